//! PostgreSQL metadata store.

use crate::error::{MetadataError, MetadataResult, map_write_err};
use crate::models::{BlobFragmentRow, ConfigRow, LayerRow, ManifestRow, SessionRow, UserRow};
use crate::store::{MetadataStore, StoreTxn, escape_like};
use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Pool, Postgres};
use time::OffsetDateTime;
use uuid::Uuid;
use wharf_core::config::DatabaseConfig;

/// PostgreSQL-based metadata store. The production backend.
pub struct PostgresStore {
    pool: Pool<Postgres>,
}

impl PostgresStore {
    /// Connect and migrate.
    ///
    /// Every connection gets a server-side `statement_timeout` so metadata
    /// operations are bounded regardless of what the caller does. Note that
    /// open upload transactions pin a pooled connection until commit or
    /// abort, so `max_connections` bounds the number of concurrent chunked
    /// uploads as well.
    pub async fn connect(config: &DatabaseConfig) -> MetadataResult<Self> {
        let statement_timeout_ms = config.statement_timeout_ms;
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .after_connect(move |conn, _meta| {
                Box::pin(async move {
                    sqlx::query(&format!("SET statement_timeout = {statement_timeout_ms}"))
                        .execute(&mut *conn)
                        .await?;
                    Ok(())
                })
            })
            .connect(&config.postgres_url())
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }
}

const POSTGRES_SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS users (
        id UUID PRIMARY KEY,
        is_active BOOLEAN NOT NULL DEFAULT FALSE,
        username TEXT NOT NULL UNIQUE,
        email TEXT NOT NULL UNIQUE,
        name TEXT,
        password_hash TEXT,
        html_url TEXT,
        oauth_id BIGINT,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS session (
        id UUID PRIMARY KEY,
        refresh_token TEXT NOT NULL,
        owner UUID NOT NULL REFERENCES users(id) ON DELETE CASCADE
    )",
    "CREATE TABLE IF NOT EXISTS manifest (
        uuid UUID PRIMARY KEY,
        namespace TEXT NOT NULL,
        media_type TEXT NOT NULL,
        schema_version INTEGER NOT NULL,
        digest TEXT NOT NULL,
        reference TEXT NOT NULL,
        object_key TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        UNIQUE (namespace, reference)
    )",
    "CREATE INDEX IF NOT EXISTS idx_manifest_digest ON manifest (digest)",
    "CREATE TABLE IF NOT EXISTS config (
        uuid UUID PRIMARY KEY,
        namespace TEXT NOT NULL,
        reference TEXT NOT NULL,
        digest TEXT NOT NULL,
        object_key TEXT NOT NULL,
        media_type TEXT NOT NULL,
        layer_digests TEXT NOT NULL,
        size BIGINT NOT NULL,
        UNIQUE (namespace, reference)
    )",
    "CREATE TABLE IF NOT EXISTS layer (
        uuid UUID NOT NULL,
        digest TEXT PRIMARY KEY,
        object_key TEXT NOT NULL,
        media_type TEXT NOT NULL,
        size BIGINT NOT NULL,
        fragment_digests TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS blob (
        digest TEXT NOT NULL,
        upload_uuid UUID NOT NULL,
        range_start BIGINT NOT NULL,
        range_end BIGINT NOT NULL,
        object_key TEXT,
        PRIMARY KEY (upload_uuid, digest)
    )",
];

#[async_trait]
impl MetadataStore for PostgresStore {
    async fn migrate(&self) -> MetadataResult<()> {
        for statement in POSTGRES_SCHEMA {
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
        Ok(Box::new(PostgresTxn { txn }))
    }

    async fn get_manifest_by_reference(
        &self,
        namespace: &str,
        reference: &str,
    ) -> MetadataResult<ManifestRow> {
        sqlx::query_as::<_, ManifestRow>(
            "SELECT * FROM manifest
             WHERE namespace = $1 AND (reference = $2 OR digest = $2)
             LIMIT 1",
        )
        .bind(namespace)
        .bind(reference)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| MetadataError::NotFound(format!("manifest {namespace} {reference}")))
    }

    async fn get_config(&self, namespace: &str, reference: &str) -> MetadataResult<ConfigRow> {
        sqlx::query_as::<_, ConfigRow>(
            "SELECT * FROM config
             WHERE namespace = $1 AND (reference = $2 OR digest = $2)
             LIMIT 1",
        )
        .bind(namespace)
        .bind(reference)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| MetadataError::NotFound(format!("config {namespace} {reference}")))
    }

    async fn get_layer(&self, digest: &str) -> MetadataResult<LayerRow> {
        sqlx::query_as::<_, LayerRow>("SELECT * FROM layer WHERE digest = $1")
            .bind(digest)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| MetadataError::NotFound(format!("layer {digest}")))
    }

    async fn get_image_tags(&self, namespace: &str) -> MetadataResult<Vec<String>> {
        let tags = sqlx::query_scalar::<_, String>(
            "SELECT reference FROM manifest
             WHERE namespace = $1 AND reference NOT LIKE 'sha256:%'
             ORDER BY created_at",
        )
        .bind(namespace)
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
        let limit: Option<i64> = (page_size > 0).then_some(page_size);
        let rows = match namespace_filter {
            Some(prefix) => {
                sqlx::query_scalar::<_, String>(
                    "SELECT DISTINCT namespace FROM manifest
                     WHERE namespace LIKE $1 || '%' ESCAPE '\\'
                     ORDER BY namespace LIMIT $2 OFFSET $3",
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
                     ORDER BY namespace LIMIT $1 OFFSET $2",
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
             WHERE namespace LIKE '%' || $1 || '%' ESCAPE '\\'
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
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
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
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
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
            "SELECT * FROM users WHERE username = $1 OR email = $1",
        )
        .bind(identifier)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| MetadataError::NotFound(format!("user {identifier}")))
    }

    async fn get_user_by_id(&self, id: Uuid) -> MetadataResult<UserRow> {
        sqlx::query_as::<_, UserRow>("SELECT * FROM users WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| MetadataError::NotFound(format!("user {id}")))
    }

    async fn update_user(&self, id: Uuid, is_active: bool) -> MetadataResult<()> {
        let result =
            sqlx::query("UPDATE users SET is_active = $1, updated_at = $2 WHERE id = $3")
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
            sqlx::query("UPDATE users SET password_hash = $1, updated_at = $2 WHERE id = $3")
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
        let result = sqlx::query("DELETE FROM users WHERE username = $1")
            .bind(username)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(MetadataError::NotFound(format!("user {username}")));
        }
        Ok(())
    }

    async fn add_session(&self, session: &SessionRow) -> MetadataResult<()> {
        sqlx::query("INSERT INTO session (id, refresh_token, owner) VALUES ($1, $2, $3)")
            .bind(session.id)
            .bind(&session.refresh_token)
            .bind(session.owner)
            .execute(&self.pool)
            .await
            .map_err(|e| map_write_err(e, &format!("session {}", session.id)))?;
        Ok(())
    }

    async fn get_session(&self, id: Uuid) -> MetadataResult<SessionRow> {
        sqlx::query_as::<_, SessionRow>("SELECT * FROM session WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| MetadataError::NotFound(format!("session {id}")))
    }

    async fn get_user_with_session(&self, session_id: Uuid) -> MetadataResult<UserRow> {
        sqlx::query_as::<_, UserRow>(
            "SELECT * FROM users
             WHERE id = (SELECT owner FROM session WHERE id = $1) AND is_active = TRUE",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| MetadataError::NotFound(format!("session {session_id}")))
    }

    async fn delete_session(&self, id: Uuid, owner: Uuid) -> MetadataResult<()> {
        let result = sqlx::query("DELETE FROM session WHERE id = $1 AND owner = $2")
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
        sqlx::query("DELETE FROM session WHERE owner = $1")
            .bind(owner)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// A PostgreSQL transaction handle.
struct PostgresTxn {
    txn: sqlx::Transaction<'static, Postgres>,
}

#[async_trait]
impl StoreTxn for PostgresTxn {
    async fn set_blob_fragment(&mut self, fragment: &BlobFragmentRow) -> MetadataResult<()> {
        sqlx::query(
            "INSERT INTO blob (digest, upload_uuid, range_start, range_end, object_key)
             VALUES ($1, $2, $3, $4, $5)
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
             VALUES ($1, $2, $3, $4, $5, $6)
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
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
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
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
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
            sqlx::query("DELETE FROM config WHERE digest = $1")
                .bind(reference)
                .execute(&mut *self.txn)
                .await?;
            sqlx::query("DELETE FROM manifest WHERE digest = $1")
                .bind(reference)
                .execute(&mut *self.txn)
                .await?
                .rows_affected()
        } else {
            sqlx::query("DELETE FROM config WHERE namespace = $1 AND reference = $2")
                .bind(namespace)
                .bind(reference)
                .execute(&mut *self.txn)
                .await?;
            sqlx::query("DELETE FROM manifest WHERE namespace = $1 AND reference = $2")
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
        let result = sqlx::query("DELETE FROM layer WHERE digest = $1")
            .bind(digest)
            .execute(&mut *self.txn)
            .await?;
        if result.rows_affected() == 0 {
            return Err(MetadataError::NotFound(format!("layer {digest}")));
        }
        Ok(())
    }

    async fn delete_blob(&mut self, digest: &str) -> MetadataResult<()> {
        sqlx::query("DELETE FROM blob WHERE digest = $1")
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
