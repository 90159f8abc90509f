//! Metadata store trait and the SQLite implementation.

use crate::error::{MetadataError, MetadataResult, map_write_err};
use crate::models::{BlobFragmentRow, ConfigRow, LayerRow, ManifestRow, SessionRow, UserRow};
use async_trait::async_trait;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use time::OffsetDateTime;
use uuid::Uuid;

/// SQL prefix every wire-format digest carries; used to split tag rows from
/// digest rows in manifest queries.
const DIGEST_LIKE: &str = "sha256:%";

/// Escape `LIKE` metacharacters in user-supplied input so `%` and `_`
/// (legal in namespaces) match literally. Pair with `ESCAPE '\'`.
pub(crate) fn escape_like(input: &str) -> String {
    let mut escaped = String::with_capacity(input.len());
    for c in input.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Transactional persistence of users, sessions, manifests, configs, layers
/// and blob fragments.
///
/// Reads fail with [`MetadataError::NotFound`] when the key is absent and
/// writes fail with [`MetadataError::Conflict`] on unique-key violations.
/// All transactional writes go through a [`StoreTxn`] handle obtained from
/// [`MetadataStore::begin`]; nothing from an aborted transaction is ever
/// observable.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Create the schema if it does not exist.
    async fn migrate(&self) -> MetadataResult<()>;

    /// Check database connectivity.
    async fn health_check(&self) -> MetadataResult<()>;

    /// Open an atomic unit of work.
    async fn begin(&self) -> MetadataResult<Box<dyn StoreTxn>>;

    // ===== Registry reads =====

    /// Resolve a manifest by tag or digest within a namespace.
    async fn get_manifest_by_reference(
        &self,
        namespace: &str,
        reference: &str,
    ) -> MetadataResult<ManifestRow>;

    /// Load the config row paired with a manifest reference.
    async fn get_config(&self, namespace: &str, reference: &str) -> MetadataResult<ConfigRow>;

    /// Load a layer by content digest.
    async fn get_layer(&self, digest: &str) -> MetadataResult<LayerRow>;

    /// All tags of an image, in insertion order.
    async fn get_image_tags(&self, namespace: &str) -> MetadataResult<Vec<String>>;

    /// Page of repository namespaces in lexicographic order. A filter is a
    /// namespace prefix; `page_size <= 0` means no limit.
    async fn get_catalog(
        &self,
        namespace_filter: Option<&str>,
        page_size: i64,
        offset: i64,
    ) -> MetadataResult<Vec<String>>;

    /// Unfiltered repository count.
    async fn get_catalog_count(&self) -> MetadataResult<i64>;

    /// Substring search over repository namespaces.
    async fn get_image_namespace(&self, search_query: &str) -> MetadataResult<Vec<String>>;

    // ===== Users =====

    async fn add_user(&self, user: &UserRow) -> MetadataResult<()>;

    /// Insert an OAuth user, upserting on email.
    async fn add_oauth_user(&self, user: &UserRow) -> MetadataResult<()>;

    /// Look up a user by username or email.
    async fn get_user(&self, identifier: &str) -> MetadataResult<UserRow>;

    async fn get_user_by_id(&self, id: Uuid) -> MetadataResult<UserRow>;

    async fn update_user(&self, id: Uuid, is_active: bool) -> MetadataResult<()>;

    async fn update_password(&self, id: Uuid, password_hash: &str) -> MetadataResult<()>;

    /// Delete a user; sessions cascade.
    async fn delete_user(&self, username: &str) -> MetadataResult<()>;

    // ===== Sessions =====

    async fn add_session(&self, session: &SessionRow) -> MetadataResult<()>;

    async fn get_session(&self, id: Uuid) -> MetadataResult<SessionRow>;

    /// Resolve the active owner of a session. Fails `NotFound` when the
    /// session is gone or the owner has been deactivated.
    async fn get_user_with_session(&self, session_id: Uuid) -> MetadataResult<UserRow>;

    async fn delete_session(&self, id: Uuid, owner: Uuid) -> MetadataResult<()>;

    async fn delete_all_sessions(&self, owner: Uuid) -> MetadataResult<()>;
}

/// An open metadata transaction.
///
/// `commit` and `abort` consume the handle; a dropped handle rolls back.
#[async_trait]
pub trait StoreTxn: Send {
    async fn set_blob_fragment(&mut self, fragment: &BlobFragmentRow) -> MetadataResult<()>;

    async fn set_layer(&mut self, layer: &LayerRow) -> MetadataResult<()>;

    async fn set_manifest(&mut self, manifest: &ManifestRow) -> MetadataResult<()>;

    async fn set_config(&mut self, config: &ConfigRow) -> MetadataResult<()>;

    /// Delete a manifest (and its config) by reference. Digest references
    /// match every tag row sharing the digest; tag references match one
    /// `(namespace, tag)` row.
    async fn delete_manifest_or_tag(
        &mut self,
        namespace: &str,
        reference: &str,
    ) -> MetadataResult<()>;

    async fn delete_layer(&mut self, digest: &str) -> MetadataResult<()>;

    /// Delete blob fragment rows by fragment digest.
    async fn delete_blob(&mut self, digest: &str) -> MetadataResult<()>;

    async fn commit(self: Box<Self>) -> MetadataResult<()>;

    async fn abort(self: Box<Self>) -> MetadataResult<()>;
}

/// SQLite-based metadata store.
///
/// The test and small-deployment backend. Writers serialize through WAL
/// with a busy timeout; an upload transaction holds the write lock from its
/// first fragment until commit, so production deployments with concurrent
/// pushes use PostgreSQL.
pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    /// Open (and migrate) a SQLite store at `path`.
    pub async fn new(path: impl AsRef<Path>) -> MetadataResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                MetadataError::Config(format!("cannot create database directory: {e}"))
            })?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))
            .map_err(MetadataError::Database)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

const SQLITE_SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS users (
        id BLOB PRIMARY KEY,
        is_active INTEGER NOT NULL DEFAULT 0,
        username TEXT NOT NULL UNIQUE,
        email TEXT NOT NULL UNIQUE,
        name TEXT,
        password_hash TEXT,
        html_url TEXT,
        oauth_id INTEGER,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS session (
        id BLOB PRIMARY KEY,
        refresh_token TEXT NOT NULL,
        owner BLOB NOT NULL REFERENCES users(id) ON DELETE CASCADE
    )",
    "CREATE TABLE IF NOT EXISTS manifest (
        uuid BLOB PRIMARY KEY,
        namespace TEXT NOT NULL,
        media_type TEXT NOT NULL,
        schema_version INTEGER NOT NULL,
        digest TEXT NOT NULL,
        reference TEXT NOT NULL,
        object_key TEXT NOT NULL,
        created_at TEXT NOT NULL,
        UNIQUE (namespace, reference)
    )",
    "CREATE INDEX IF NOT EXISTS idx_manifest_digest ON manifest (digest)",
    "CREATE TABLE IF NOT EXISTS config (
        uuid BLOB PRIMARY KEY,
        namespace TEXT NOT NULL,
        reference TEXT NOT NULL,
        digest TEXT NOT NULL,
        object_key TEXT NOT NULL,
        media_type TEXT NOT NULL,
        layer_digests TEXT NOT NULL,
        size INTEGER NOT NULL,
        UNIQUE (namespace, reference)
    )",
    "CREATE TABLE IF NOT EXISTS layer (
        uuid BLOB NOT NULL,
        digest TEXT PRIMARY KEY,
        object_key TEXT NOT NULL,
        media_type TEXT NOT NULL,
        size INTEGER NOT NULL,
        fragment_digests TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS blob (
        digest TEXT NOT NULL,
        upload_uuid BLOB NOT NULL,
        range_start INTEGER NOT NULL,
        range_end INTEGER NOT NULL,
        object_key TEXT,
        PRIMARY KEY (upload_uuid, digest)
    )",
];

#[async_trait]
impl MetadataStore for SqliteStore {
    async fn migrate(&self) -> MetadataResult<()> {
        for statement in SQLITE_SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn begin(&self) -> MetadataResult<Box<dyn StoreTxn>> {
        let txn = self.pool.begin().await?;
        Ok(Box::new(SqliteTxn { txn }))
    }

    async fn get_manifest_by_reference(
        &self,
        namespace: &str,
        reference: &str,
    ) -> MetadataResult<ManifestRow> {
        sqlx::query_as::<_, ManifestRow>(
            "SELECT * FROM manifest
             WHERE namespace = ? AND (reference = ? OR digest = ?)
             LIMIT 1",
        )
        .bind(namespace)
        .bind(reference)
        .bind(reference)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| MetadataError::NotFound(format!("manifest {namespace} {reference}")))
    }

    async fn get_config(&self, namespace: &str, reference: &str) -> MetadataResult<ConfigRow> {
        sqlx::query_as::<_, ConfigRow>(
            "SELECT * FROM config
             WHERE namespace = ? AND (reference = ? OR digest = ?)
             LIMIT 1",
        )
        .bind(namespace)
        .bind(reference)
        .bind(reference)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| MetadataError::NotFound(format!("config {namespace} {reference}")))
    }

    async fn get_layer(&self, digest: &str) -> MetadataResult<LayerRow> {
        sqlx::query_as::<_, LayerRow>("SELECT * FROM layer WHERE digest = ?")
            .bind(digest)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| MetadataError::NotFound(format!("layer {digest}")))
    }

    async fn get_image_tags(&self, namespace: &str) -> MetadataResult<Vec<String>> {
        let tags = sqlx::query_scalar::<_, String>(
            "SELECT reference FROM manifest
             WHERE namespace = ? AND reference NOT LIKE ?
             ORDER BY created_at",
        )
        .bind(namespace)
        .bind(DIGEST_LIKE)
        .fetch_all(&self.pool)
        .await?;
        Ok(tags)
    }

    async fn get_catalog(
        &self,
        namespace_filter: Option<&str>,
        page_size: i64,
        offset: i64,
    ) -> MetadataResult<Vec<String>> {
        // SQLite treats LIMIT -1 as "no limit".
        let limit = if page_size > 0 { page_size } else { -1 };
        let rows = match namespace_filter {
            Some(prefix) => {
                sqlx::query_scalar::<_, String>(
                    "SELECT DISTINCT namespace FROM manifest
                     WHERE namespace LIKE ? || '%' ESCAPE '\\'
                     ORDER BY namespace LIMIT ? OFFSET ?",
                )
                .bind(escape_like(prefix))
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_scalar::<_, String>(
                    "SELECT DISTINCT namespace FROM manifest
                     ORDER BY namespace LIMIT ? OFFSET ?",
                )
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(rows)
    }

    async fn get_catalog_count(&self) -> MetadataResult<i64> {
        let count =
            sqlx::query_scalar::<_, i64>("SELECT COUNT(DISTINCT namespace) FROM manifest")
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    async fn get_image_namespace(&self, search_query: &str) -> MetadataResult<Vec<String>> {
        let rows = sqlx::query_scalar::<_, String>(
            "SELECT DISTINCT namespace FROM manifest
             WHERE namespace LIKE '%' || ? || '%' ESCAPE '\\'
             ORDER BY namespace LIMIT 50",
        )
        .bind(escape_like(search_query))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn add_user(&self, user: &UserRow) -> MetadataResult<()> {
        sqlx::query(
            "INSERT INTO users
             (id, is_active, username, email, name, password_hash, html_url, oauth_id,
              created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(user.id)
        .bind(user.is_active)
        .bind(&user.username)
        .bind(&user.email)
        .bind(&user.name)
        .bind(&user.password_hash)
        .bind(&user.html_url)
        .bind(user.oauth_id)
        .bind(user.created_at)
        .bind(user.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_write_err(e, &format!("user {}", user.username)))?;
        Ok(())
    }

    async fn add_oauth_user(&self, user: &UserRow) -> MetadataResult<()> {
        sqlx::query(
            "INSERT INTO users
             (id, is_active, username, email, name, password_hash, html_url, oauth_id,
              created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (email) DO UPDATE SET
                 username = excluded.username,
                 name = excluded.name,
                 html_url = excluded.html_url,
                 oauth_id = excluded.oauth_id,
                 is_active = excluded.is_active,
                 updated_at = excluded.updated_at",
        )
        .bind(user.id)
        .bind(user.is_active)
        .bind(&user.username)
        .bind(&user.email)
        .bind(&user.name)
        .bind(&user.password_hash)
        .bind(&user.html_url)
        .bind(user.oauth_id)
        .bind(user.created_at)
        .bind(user.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_write_err(e, &format!("oauth user {}", user.email)))?;
        Ok(())
    }

    async fn get_user(&self, identifier: &str) -> MetadataResult<UserRow> {
        sqlx::query_as::<_, UserRow>(
            "SELECT * FROM users WHERE username = ? OR email = ?",
        )
        .bind(identifier)
        .bind(identifier)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| MetadataError::NotFound(format!("user {identifier}")))
    }

    async fn get_user_by_id(&self, id: Uuid) -> MetadataResult<UserRow> {
        sqlx::query_as::<_, UserRow>("SELECT * FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| MetadataError::NotFound(format!("user {id}")))
    }

    async fn update_user(&self, id: Uuid, is_active: bool) -> MetadataResult<()> {
        let result = sqlx::query("UPDATE users SET is_active = ?, updated_at = ? WHERE id = ?")
            .bind(is_active)
            .bind(OffsetDateTime::now_utc())
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(MetadataError::NotFound(format!("user {id}")));
        }
        Ok(())
    }

    async fn update_password(&self, id: Uuid, password_hash: &str) -> MetadataResult<()> {
        let result =
            sqlx::query("UPDATE users SET password_hash = ?, updated_at = ? WHERE id = ?")
                .bind(password_hash)
                .bind(OffsetDateTime::now_utc())
                .bind(id)
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            return Err(MetadataError::NotFound(format!("user {id}")));
        }
        Ok(())
    }

    async fn delete_user(&self, username: &str) -> MetadataResult<()> {
        let result = sqlx::query("DELETE FROM users WHERE username = ?")
            .bind(username)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(MetadataError::NotFound(format!("user {username}")));
        }
        Ok(())
    }

    async fn add_session(&self, session: &SessionRow) -> MetadataResult<()> {
        sqlx::query("INSERT INTO session (id, refresh_token, owner) VALUES (?, ?, ?)")
            .bind(session.id)
            .bind(&session.refresh_token)
            .bind(session.owner)
            .execute(&self.pool)
            .await
            .map_err(|e| map_write_err(e, &format!("session {}", session.id)))?;
        Ok(())
    }

    async fn get_session(&self, id: Uuid) -> MetadataResult<SessionRow> {
        sqlx::query_as::<_, SessionRow>("SELECT * FROM session WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| MetadataError::NotFound(format!("session {id}")))
    }

    async fn get_user_with_session(&self, session_id: Uuid) -> MetadataResult<UserRow> {
        sqlx::query_as::<_, UserRow>(
            "SELECT * FROM users
             WHERE id = (SELECT owner FROM session WHERE id = ?) AND is_active = TRUE",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| MetadataError::NotFound(format!("session {session_id}")))
    }

    async fn delete_session(&self, id: Uuid, owner: Uuid) -> MetadataResult<()> {
        let result = sqlx::query("DELETE FROM session WHERE id = ? AND owner = ?")
            .bind(id)
            .bind(owner)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(MetadataError::NotFound(format!("session {id}")));
        }
        Ok(())
    }

    async fn delete_all_sessions(&self, owner: Uuid) -> MetadataResult<()> {
        sqlx::query("DELETE FROM session WHERE owner = ?")
            .bind(owner)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// A SQLite transaction handle.
struct SqliteTxn {
    txn: sqlx::Transaction<'static, Sqlite>,
}

#[async_trait]
impl StoreTxn for SqliteTxn {
    async fn set_blob_fragment(&mut self, fragment: &BlobFragmentRow) -> MetadataResult<()> {
        sqlx::query(
            "INSERT INTO blob (digest, upload_uuid, range_start, range_end, object_key)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT (upload_uuid, digest) DO UPDATE SET
                 range_start = excluded.range_start,
                 range_end = excluded.range_end,
                 object_key = excluded.object_key",
        )
        .bind(&fragment.digest)
        .bind(fragment.upload_uuid)
        .bind(fragment.range_start)
        .bind(fragment.range_end)
        .bind(&fragment.object_key)
        .execute(&mut *self.txn)
        .await
        .map_err(|e| map_write_err(e, &format!("blob fragment {}", fragment.digest)))?;
        Ok(())
    }

    async fn set_layer(&mut self, layer: &LayerRow) -> MetadataResult<()> {
        sqlx::query(
            "INSERT INTO layer (uuid, digest, object_key, media_type, size, fragment_digests)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT (digest) DO UPDATE SET
                 uuid = excluded.uuid,
                 object_key = excluded.object_key,
                 media_type = excluded.media_type,
                 size = excluded.size,
                 fragment_digests = excluded.fragment_digests",
        )
        .bind(layer.uuid)
        .bind(&layer.digest)
        .bind(&layer.object_key)
        .bind(&layer.media_type)
        .bind(layer.size)
        .bind(&layer.fragment_digests)
        .execute(&mut *self.txn)
        .await
        .map_err(|e| map_write_err(e, &format!("layer {}", layer.digest)))?;
        Ok(())
    }

    async fn set_manifest(&mut self, manifest: &ManifestRow) -> MetadataResult<()> {
        sqlx::query(
            "INSERT INTO manifest
             (uuid, namespace, media_type, schema_version, digest, reference, object_key,
              created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (namespace, reference) DO UPDATE SET
                 media_type = excluded.media_type,
                 schema_version = excluded.schema_version,
                 digest = excluded.digest,
                 object_key = excluded.object_key",
        )
        .bind(manifest.uuid)
        .bind(&manifest.namespace)
        .bind(&manifest.media_type)
        .bind(manifest.schema_version)
        .bind(&manifest.digest)
        .bind(&manifest.reference)
        .bind(&manifest.object_key)
        .bind(manifest.created_at)
        .execute(&mut *self.txn)
        .await
        .map_err(|e| {
            map_write_err(
                e,
                &format!("manifest {} {}", manifest.namespace, manifest.reference),
            )
        })?;
        Ok(())
    }

    async fn set_config(&mut self, config: &ConfigRow) -> MetadataResult<()> {
        sqlx::query(
            "INSERT INTO config
             (uuid, namespace, reference, digest, object_key, media_type, layer_digests, size)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (namespace, reference) DO UPDATE SET
                 digest = excluded.digest,
                 object_key = excluded.object_key,
                 media_type = excluded.media_type,
                 layer_digests = excluded.layer_digests,
                 size = excluded.size",
        )
        .bind(config.uuid)
        .bind(&config.namespace)
        .bind(&config.reference)
        .bind(&config.digest)
        .bind(&config.object_key)
        .bind(&config.media_type)
        .bind(&config.layer_digests)
        .bind(config.size)
        .execute(&mut *self.txn)
        .await
        .map_err(|e| {
            map_write_err(e, &format!("config {} {}", config.namespace, config.reference))
        })?;
        Ok(())
    }

    async fn delete_manifest_or_tag(
        &mut self,
        namespace: &str,
        reference: &str,
    ) -> MetadataResult<()> {
        let deleted = if reference.starts_with("sha256:") {
            // Digest references are unique globally: remove every tag row
            // pointing at the digest.
            sqlx::query("DELETE FROM config WHERE digest = ?")
                .bind(reference)
                .execute(&mut *self.txn)
                .await?;
            sqlx::query("DELETE FROM manifest WHERE digest = ?")
                .bind(reference)
                .execute(&mut *self.txn)
                .await?
                .rows_affected()
        } else {
            sqlx::query("DELETE FROM config WHERE namespace = ? AND reference = ?")
                .bind(namespace)
                .bind(reference)
                .execute(&mut *self.txn)
                .await?;
            sqlx::query("DELETE FROM manifest WHERE namespace = ? AND reference = ?")
                .bind(namespace)
                .bind(reference)
                .execute(&mut *self.txn)
                .await?
                .rows_affected()
        };
        if deleted == 0 {
            return Err(MetadataError::NotFound(format!(
                "manifest {namespace} {reference}"
            )));
        }
        Ok(())
    }

    async fn delete_layer(&mut self, digest: &str) -> MetadataResult<()> {
        let result = sqlx::query("DELETE FROM layer WHERE digest = ?")
            .bind(digest)
            .execute(&mut *self.txn)
            .await?;
        if result.rows_affected() == 0 {
            return Err(MetadataError::NotFound(format!("layer {digest}")));
        }
        Ok(())
    }

    async fn delete_blob(&mut self, digest: &str) -> MetadataResult<()> {
        sqlx::query("DELETE FROM blob WHERE digest = ?")
            .bind(digest)
            .execute(&mut *self.txn)
            .await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> MetadataResult<()> {
        self.txn.commit().await?;
        Ok(())
    }

    async fn abort(self: Box<Self>) -> MetadataResult<()> {
        self.txn.rollback().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn test_store() -> (TempDir, SqliteStore) {
        let temp = tempfile::tempdir().unwrap();
        let store = SqliteStore::new(temp.path().join("metadata.db"))
            .await
            .unwrap();
        (temp, store)
    }

    fn user(username: &str, email: &str) -> UserRow {
        let now = OffsetDateTime::now_utc();
        UserRow {
            id: Uuid::new_v4(),
            is_active: true,
            username: username.to_string(),
            email: email.to_string(),
            name: None,
            password_hash: Some("$2b$06$hash".to_string()),
            html_url: None,
            oauth_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn manifest(namespace: &str, reference: &str, digest: &str) -> ManifestRow {
        ManifestRow {
            uuid: Uuid::new_v4(),
            namespace: namespace.to_string(),
            media_type: "application/vnd.oci.image.manifest.v1+json".to_string(),
            schema_version: 2,
            digest: digest.to_string(),
            reference: reference.to_string(),
            object_key: format!("manifests/{digest}"),
            created_at: OffsetDateTime::now_utc(),
        }
    }

    #[tokio::test]
    async fn user_round_trip_by_username_and_email() {
        let (_temp, store) = test_store().await;
        let u = user("alice", "alice@example.test");
        store.add_user(&u).await.unwrap();

        assert_eq!(store.get_user("alice").await.unwrap().id, u.id);
        assert_eq!(store.get_user("alice@example.test").await.unwrap().id, u.id);
        assert_eq!(store.get_user_by_id(u.id).await.unwrap().username, "alice");
    }

    #[tokio::test]
    async fn duplicate_username_is_conflict() {
        let (_temp, store) = test_store().await;
        store.add_user(&user("alice", "a@example.test")).await.unwrap();
        let err = store
            .add_user(&user("alice", "b@example.test"))
            .await
            .unwrap_err();
        assert!(matches!(err, MetadataError::Conflict(_)));
    }

    #[tokio::test]
    async fn missing_user_is_not_found() {
        let (_temp, store) = test_store().await;
        assert!(matches!(
            store.get_user("ghost").await.unwrap_err(),
            MetadataError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn oauth_user_upserts_on_email() {
        let (_temp, store) = test_store().await;
        let mut u = user("alice", "alice@example.test");
        u.oauth_id = Some(42);
        store.add_oauth_user(&u).await.unwrap();

        let mut renamed = user("alice-gh", "alice@example.test");
        renamed.oauth_id = Some(42);
        store.add_oauth_user(&renamed).await.unwrap();

        let loaded = store.get_user("alice@example.test").await.unwrap();
        assert_eq!(loaded.username, "alice-gh");
        // The row id is the original insert's.
        assert_eq!(loaded.id, u.id);
    }

    #[tokio::test]
    async fn deleting_user_cascades_sessions() {
        let (_temp, store) = test_store().await;
        let u = user("alice", "alice@example.test");
        store.add_user(&u).await.unwrap();

        let session = SessionRow {
            id: Uuid::new_v4(),
            refresh_token: "refresh".to_string(),
            owner: u.id,
        };
        store.add_session(&session).await.unwrap();
        store.delete_user("alice").await.unwrap();

        assert!(matches!(
            store.get_session(session.id).await.unwrap_err(),
            MetadataError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn session_of_inactive_user_is_invalid() {
        let (_temp, store) = test_store().await;
        let u = user("alice", "alice@example.test");
        store.add_user(&u).await.unwrap();

        let session = SessionRow {
            id: Uuid::new_v4(),
            refresh_token: "refresh".to_string(),
            owner: u.id,
        };
        store.add_session(&session).await.unwrap();
        assert_eq!(
            store.get_user_with_session(session.id).await.unwrap().id,
            u.id
        );

        store.update_user(u.id, false).await.unwrap();
        assert!(store.get_user_with_session(session.id).await.is_err());
    }

    #[tokio::test]
    async fn manifest_resolves_by_tag_and_digest() {
        let (_temp, store) = test_store().await;
        let digest = format!("sha256:{}", "a".repeat(64));

        let mut txn = store.begin().await.unwrap();
        txn.set_manifest(&manifest("alice/app", "latest", &digest))
            .await
            .unwrap();
        txn.commit().await.unwrap();

        let by_tag = store
            .get_manifest_by_reference("alice/app", "latest")
            .await
            .unwrap();
        let by_digest = store
            .get_manifest_by_reference("alice/app", &digest)
            .await
            .unwrap();
        assert_eq!(by_tag.uuid, by_digest.uuid);
    }

    #[tokio::test]
    async fn aborted_txn_leaves_nothing_observable() {
        let (_temp, store) = test_store().await;
        let digest = format!("sha256:{}", "a".repeat(64));

        let mut txn = store.begin().await.unwrap();
        txn.set_manifest(&manifest("alice/app", "latest", &digest))
            .await
            .unwrap();
        txn.abort().await.unwrap();

        assert!(store
            .get_manifest_by_reference("alice/app", "latest")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn manifest_upsert_replaces_tag_target() {
        let (_temp, store) = test_store().await;
        let old = format!("sha256:{}", "a".repeat(64));
        let new = format!("sha256:{}", "b".repeat(64));

        let mut txn = store.begin().await.unwrap();
        txn.set_manifest(&manifest("alice/app", "latest", &old))
            .await
            .unwrap();
        txn.commit().await.unwrap();

        let mut txn = store.begin().await.unwrap();
        txn.set_manifest(&manifest("alice/app", "latest", &new))
            .await
            .unwrap();
        txn.commit().await.unwrap();

        let row = store
            .get_manifest_by_reference("alice/app", "latest")
            .await
            .unwrap();
        assert_eq!(row.digest, new);
    }

    #[tokio::test]
    async fn config_row_follows_manifest() {
        let (_temp, store) = test_store().await;
        let digest = format!("sha256:{}", "a".repeat(64));
        let layer_digest = format!("sha256:{}", "b".repeat(64));

        let mut txn = store.begin().await.unwrap();
        txn.set_manifest(&manifest("alice/app", "latest", &digest))
            .await
            .unwrap();
        txn.set_config(&ConfigRow {
            uuid: Uuid::new_v4(),
            namespace: "alice/app".to_string(),
            reference: "latest".to_string(),
            digest: digest.clone(),
            object_key: format!("manifests/{digest}"),
            media_type: "application/vnd.oci.image.manifest.v1+json".to_string(),
            layer_digests: serde_json::to_string(&[&layer_digest]).unwrap(),
            size: 7023,
        })
        .await
        .unwrap();
        txn.commit().await.unwrap();

        let config = store.get_config("alice/app", "latest").await.unwrap();
        assert_eq!(config.layer_digest_list(), [layer_digest]);
        assert_eq!(config.size, 7023);

        // Deleting the manifest takes the config with it.
        let mut txn = store.begin().await.unwrap();
        txn.delete_manifest_or_tag("alice/app", "latest").await.unwrap();
        txn.commit().await.unwrap();
        assert!(store.get_config("alice/app", "latest").await.is_err());
    }

    #[tokio::test]
    async fn delete_by_digest_removes_all_tags() {
        let (_temp, store) = test_store().await;
        let digest = format!("sha256:{}", "a".repeat(64));

        let mut txn = store.begin().await.unwrap();
        txn.set_manifest(&manifest("alice/app", "latest", &digest))
            .await
            .unwrap();
        txn.set_manifest(&manifest("alice/app", "v1", &digest))
            .await
            .unwrap();
        txn.commit().await.unwrap();

        let mut txn = store.begin().await.unwrap();
        txn.delete_manifest_or_tag("alice/app", &digest).await.unwrap();
        txn.commit().await.unwrap();

        assert!(store
            .get_manifest_by_reference("alice/app", "latest")
            .await
            .is_err());
        assert!(store
            .get_manifest_by_reference("alice/app", "v1")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn delete_by_tag_keeps_other_tags() {
        let (_temp, store) = test_store().await;
        let digest = format!("sha256:{}", "a".repeat(64));

        let mut txn = store.begin().await.unwrap();
        txn.set_manifest(&manifest("alice/app", "latest", &digest))
            .await
            .unwrap();
        txn.set_manifest(&manifest("alice/app", "v1", &digest))
            .await
            .unwrap();
        txn.commit().await.unwrap();

        let mut txn = store.begin().await.unwrap();
        txn.delete_manifest_or_tag("alice/app", "v1").await.unwrap();
        txn.commit().await.unwrap();

        assert!(store
            .get_manifest_by_reference("alice/app", "latest")
            .await
            .is_ok());
        assert_eq!(store.get_image_tags("alice/app").await.unwrap(), ["latest"]);
    }

    #[tokio::test]
    async fn delete_missing_manifest_is_not_found() {
        let (_temp, store) = test_store().await;
        let mut txn = store.begin().await.unwrap();
        let err = txn
            .delete_manifest_or_tag("alice/app", "nope")
            .await
            .unwrap_err();
        assert!(matches!(err, MetadataError::NotFound(_)));
        txn.abort().await.unwrap();
    }

    #[tokio::test]
    async fn catalog_paginates_in_lexicographic_order() {
        let (_temp, store) = test_store().await;
        for ns in ["bob/b", "alice/a", "carol/c", "alice/z"] {
            let digest = format!("sha256:{}", "a".repeat(64));
            let mut txn = store.begin().await.unwrap();
            txn.set_manifest(&manifest(ns, "latest", &digest)).await.unwrap();
            txn.commit().await.unwrap();
        }

        let page = store.get_catalog(None, 2, 1).await.unwrap();
        assert_eq!(page, ["alice/z", "bob/b"]);
        assert_eq!(store.get_catalog_count().await.unwrap(), 4);

        let filtered = store.get_catalog(Some("alice/"), 10, 0).await.unwrap();
        assert_eq!(filtered, ["alice/a", "alice/z"]);
    }

    #[test]
    fn escape_like_escapes_metacharacters() {
        assert_eq!(escape_like("alice/my_app"), "alice/my\\_app");
        assert_eq!(escape_like("50%"), "50\\%");
        assert_eq!(escape_like("back\\slash"), "back\\\\slash");
        assert_eq!(escape_like("plain"), "plain");
    }

    #[tokio::test]
    async fn like_filters_match_underscores_literally() {
        let (_temp, store) = test_store().await;
        let digest = format!("sha256:{}", "a".repeat(64));
        for ns in ["alice/my_app", "alice/myxapp"] {
            let mut txn = store.begin().await.unwrap();
            txn.set_manifest(&manifest(ns, "latest", &digest)).await.unwrap();
            txn.commit().await.unwrap();
        }

        let filtered = store
            .get_catalog(Some("alice/my_app"), 10, 0)
            .await
            .unwrap();
        assert_eq!(filtered, ["alice/my_app"]);

        let found = store.get_image_namespace("my_a").await.unwrap();
        assert_eq!(found, ["alice/my_app"]);
    }

    #[tokio::test]
    async fn layer_and_fragment_lifecycle() {
        let (_temp, store) = test_store().await;
        let upload_uuid = Uuid::new_v4();
        let layer_digest = format!("sha256:{}", "d".repeat(64));
        let fragment_digest = format!("sha256:{}", "e".repeat(64));

        let mut txn = store.begin().await.unwrap();
        txn.set_blob_fragment(&BlobFragmentRow {
            digest: fragment_digest.clone(),
            upload_uuid,
            range_start: 0,
            range_end: 4,
            object_key: None,
        })
        .await
        .unwrap();
        txn.set_layer(&LayerRow {
            uuid: upload_uuid,
            digest: layer_digest.clone(),
            object_key: format!("blobs/{layer_digest}"),
            media_type: "application/octet-stream".to_string(),
            size: 5,
            fragment_digests: serde_json::to_string(&[&fragment_digest]).unwrap(),
        })
        .await
        .unwrap();
        txn.commit().await.unwrap();

        let layer = store.get_layer(&layer_digest).await.unwrap();
        assert_eq!(layer.size, 5);
        assert_eq!(layer.fragment_digest_list(), [fragment_digest.clone()]);

        let mut txn = store.begin().await.unwrap();
        txn.delete_layer(&layer_digest).await.unwrap();
        txn.delete_blob(&fragment_digest).await.unwrap();
        txn.commit().await.unwrap();

        assert!(store.get_layer(&layer_digest).await.is_err());
    }
}
