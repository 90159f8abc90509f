//! Upload transaction manager.
//!
//! Process-wide correlation between an upload UUID, its open metadata
//! transaction, the accumulated byte buffer, and the fragment digests
//! persisted so far. The manager is the sole mutator of this state; all
//! access goes through the named operations.
//!
//! Lock discipline: the session map mutex is only held to check a session
//! in or out. A session is *checked out* (its slot marked busy) for the
//! whole of an `append` or `finalize`, so fragment writes and object-store
//! uploads happen without the map locked, and a second concurrent request
//! for the same UUID fails with 409 instead of interleaving.
//!
//! TODO: spool the buffer to the object store incrementally and keep only
//! running digest state once multipart upload lands in the storage crate.

use crate::error::{ApiResult, ErrorCode, RegistryError};
use crate::handlers::common::blob_object_key;
use axum::http::StatusCode;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;
use wharf_core::digest::Digest;
use wharf_core::UPLOAD_SESSION_TTL_SECS;
use wharf_metadata::models::{BlobFragmentRow, LayerRow};
use wharf_metadata::{MetadataStore, StoreTxn};
use wharf_storage::ObjectStore;

/// How often the background sweeper scans for expired sessions.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// One in-progress blob upload.
struct UploadSession {
    txn: Box<dyn StoreTxn>,
    buffer: Vec<u8>,
    fragment_digests: Vec<String>,
    deadline: OffsetDateTime,
}

impl UploadSession {
    fn expired(&self) -> bool {
        self.deadline < OffsetDateTime::now_utc()
    }
}

/// Slot state: a session is either at rest in the map or checked out by
/// exactly one request.
enum UploadSlot {
    Idle(UploadSession),
    Busy,
}

/// Process-wide upload session map.
pub struct UploadManager {
    sessions: Mutex<HashMap<Uuid, UploadSlot>>,
}

impl UploadManager {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Open a new upload session: allocate a UUID, begin a metadata
    /// transaction, and start the 30-minute deadline.
    pub async fn open(&self, metadata: &dyn MetadataStore) -> ApiResult<Uuid> {
        let txn = metadata.begin().await?;
        let id = Uuid::new_v4();
        let session = UploadSession {
            txn,
            buffer: Vec::new(),
            fragment_digests: Vec::new(),
            deadline: OffsetDateTime::now_utc()
                + time::Duration::seconds(UPLOAD_SESSION_TTL_SECS),
        };

        self.sessions
            .lock()
            .await
            .insert(id, UploadSlot::Idle(session));
        tracing::info!(upload_id = %id, "upload session opened");
        Ok(id)
    }

    /// Append a chunk. `start` is the parsed `Content-Range` start; `None`
    /// means the request carried no range and is only legal as the first
    /// chunk. Returns the new accumulated length.
    pub async fn append(&self, id: Uuid, chunk: &[u8], start: Option<u64>) -> ApiResult<u64> {
        let mut session = self.checkout(id).await?;

        if session.expired() {
            return self.expire(id, session).await;
        }

        let current = session.buffer.len() as u64;
        match start {
            Some(start) if start != current => {
                self.checkin(id, session).await;
                return Err(RegistryError::new(
                    StatusCode::RANGE_NOT_SATISFIABLE,
                    ErrorCode::BlobUploadUnknown,
                    format!("range start {start} does not match accumulated length {current}"),
                ));
            }
            None if current > 0 => {
                self.checkin(id, session).await;
                return Err(RegistryError::new(
                    StatusCode::BAD_REQUEST,
                    ErrorCode::BlobUploadInvalid,
                    "streamed upload after the first chunk requires Content-Range",
                ));
            }
            _ => {}
        }

        match persist_fragment(&mut session, id, chunk).await {
            Ok(()) => {
                let total = session.buffer.len() as u64;
                self.checkin(id, session).await;
                Ok(total)
            }
            Err(err) => {
                self.remove(id).await;
                if let Err(abort_err) = session.txn.abort().await {
                    tracing::warn!(upload_id = %id, error = %abort_err, "abort failed");
                }
                Err(err)
            }
        }
    }

    /// Finalize: append any trailing bytes, verify the client digest over
    /// the accumulated buffer, upload to the object store, write the layer
    /// row, and commit.
    pub async fn finalize(
        &self,
        id: Uuid,
        trailing: &[u8],
        client_digest: &Digest,
        media_type: &str,
        storage: &dyn ObjectStore,
    ) -> ApiResult<LayerRow> {
        let mut session = self.checkout(id).await?;

        if session.expired() {
            return self.expire(id, session).await;
        }

        if let Err(err) = persist_fragment(&mut session, id, trailing).await {
            self.remove(id).await;
            let _ = session.txn.abort().await;
            return Err(err);
        }

        let computed = Digest::compute(&session.buffer);
        if computed != *client_digest {
            self.remove(id).await;
            if let Err(abort_err) = session.txn.abort().await {
                tracing::warn!(upload_id = %id, error = %abort_err, "abort failed");
            }
            tracing::warn!(
                upload_id = %id,
                client_digest = %client_digest,
                computed_digest = %computed,
                "digest mismatch at finalize"
            );
            return Err(RegistryError::digest_invalid(
                "client digest does not match computed digest",
            )
            .with_detail(serde_json::json!({
                "clientDigest": client_digest.to_string(),
                "computedDigest": computed.to_string(),
            })));
        }

        let size = session.buffer.len() as i64;
        let object_key = blob_object_key(client_digest);
        let bytes = Bytes::from(std::mem::take(&mut session.buffer));
        if let Err(err) = storage.put(&object_key, bytes).await {
            self.remove(id).await;
            let _ = session.txn.abort().await;
            return Err(err.into());
        }

        let fragment_digests = match serde_json::to_string(&session.fragment_digests) {
            Ok(json) => json,
            Err(err) => {
                self.remove(id).await;
                let _ = session.txn.abort().await;
                return Err(RegistryError::internal(err.to_string()));
            }
        };

        let layer = LayerRow {
            uuid: id,
            digest: client_digest.to_string(),
            object_key,
            media_type: media_type.to_string(),
            size,
            fragment_digests,
        };

        if let Err(err) = session.txn.set_layer(&layer).await {
            self.remove(id).await;
            let _ = session.txn.abort().await;
            return Err(err.into());
        }
        if let Err(err) = session.txn.commit().await {
            self.remove(id).await;
            return Err(err.into());
        }

        self.remove(id).await;
        tracing::info!(upload_id = %id, digest = %client_digest, size, "layer committed");
        Ok(layer)
    }

    /// Abort an upload and discard the session.
    pub async fn cancel(&self, id: Uuid) -> ApiResult<()> {
        let session = self.checkout(id).await?;
        self.remove(id).await;
        session.txn.abort().await?;
        tracing::info!(upload_id = %id, "upload session cancelled");
        Ok(())
    }

    /// Current accumulated length of an idle session.
    pub async fn progress(&self, id: Uuid) -> ApiResult<u64> {
        let sessions = self.sessions.lock().await;
        match sessions.get(&id) {
            None => Err(RegistryError::upload_unknown(id)),
            Some(UploadSlot::Busy) => Err(busy_error(id)),
            Some(UploadSlot::Idle(session)) => Ok(session.buffer.len() as u64),
        }
    }

    /// Evict every idle session past its deadline. Returns the number of
    /// sessions evicted.
    pub async fn sweep(&self) -> usize {
        let now = OffsetDateTime::now_utc();
        let mut expired = Vec::new();
        {
            let mut sessions = self.sessions.lock().await;
            let ids: Vec<Uuid> = sessions
                .iter()
                .filter(|(_, slot)| matches!(slot, UploadSlot::Idle(s) if s.deadline < now))
                .map(|(id, _)| *id)
                .collect();
            for id in ids {
                if let Some(UploadSlot::Idle(session)) = sessions.remove(&id) {
                    expired.push((id, session));
                }
            }
        }

        let count = expired.len();
        for (id, session) in expired {
            tracing::info!(upload_id = %id, "evicting expired upload session");
            if let Err(err) = session.txn.abort().await {
                tracing::warn!(upload_id = %id, error = %err, "abort of expired session failed");
            }
        }
        count
    }

    /// Spawn the periodic deadline sweeper.
    pub fn spawn_sweeper(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                interval.tick().await;
                let evicted = self.sweep().await;
                if evicted > 0 {
                    tracing::info!(evicted, "upload sweeper evicted expired sessions");
                }
            }
        })
    }

    async fn checkout(&self, id: Uuid) -> ApiResult<UploadSession> {
        let mut sessions = self.sessions.lock().await;
        let slot = sessions
            .get_mut(&id)
            .ok_or_else(|| RegistryError::upload_unknown(id))?;
        match std::mem::replace(slot, UploadSlot::Busy) {
            UploadSlot::Idle(session) => Ok(session),
            UploadSlot::Busy => Err(busy_error(id)),
        }
    }

    async fn checkin(&self, id: Uuid, session: UploadSession) {
        self.sessions
            .lock()
            .await
            .insert(id, UploadSlot::Idle(session));
    }

    async fn remove(&self, id: Uuid) {
        self.sessions.lock().await.remove(&id);
    }

    async fn expire<T>(&self, id: Uuid, session: UploadSession) -> ApiResult<T> {
        self.remove(id).await;
        if let Err(err) = session.txn.abort().await {
            tracing::warn!(upload_id = %id, error = %err, "abort of expired session failed");
        }
        Err(RegistryError::new(
            StatusCode::NOT_FOUND,
            ErrorCode::BlobUploadUnknown,
            format!("upload session {id} has expired"),
        ))
    }

    #[cfg(test)]
    async fn force_expire(&self, id: Uuid) {
        let mut sessions = self.sessions.lock().await;
        if let Some(UploadSlot::Idle(session)) = sessions.get_mut(&id) {
            session.deadline = OffsetDateTime::now_utc() - time::Duration::hours(1);
        }
    }
}

impl Default for UploadManager {
    fn default() -> Self {
        Self::new()
    }
}

fn busy_error(id: Uuid) -> RegistryError {
    RegistryError::new(
        StatusCode::CONFLICT,
        ErrorCode::BlobUploadInvalid,
        format!("another request is operating on upload {id}"),
    )
}

/// Record a chunk: fragment row inside the open transaction, then the
/// in-memory accounting. Empty chunks are a no-op.
async fn persist_fragment(
    session: &mut UploadSession,
    id: Uuid,
    chunk: &[u8],
) -> ApiResult<()> {
    if chunk.is_empty() {
        return Ok(());
    }

    let digest = Digest::compute(chunk);
    let start = session.buffer.len() as i64;
    let fragment = BlobFragmentRow {
        digest: digest.to_string(),
        upload_uuid: id,
        range_start: start,
        range_end: start + chunk.len() as i64 - 1,
        object_key: None,
    };
    session.txn.set_blob_fragment(&fragment).await?;

    session.buffer.extend_from_slice(chunk);
    session.fragment_digests.push(digest.to_string());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use wharf_metadata::SqliteStore;
    use wharf_storage::FilesystemBackend;

    async fn setup() -> (tempfile::TempDir, SqliteStore, FilesystemBackend, UploadManager) {
        let temp = tempfile::tempdir().unwrap();
        let metadata = SqliteStore::new(temp.path().join("metadata.db"))
            .await
            .unwrap();
        let storage = FilesystemBackend::new(temp.path().join("storage"))
            .await
            .unwrap();
        (temp, metadata, storage, UploadManager::new())
    }

    #[tokio::test]
    async fn chunked_upload_commits_layer() {
        let (_temp, metadata, storage, manager) = setup().await;

        let id = manager.open(&metadata).await.unwrap();
        assert_eq!(manager.append(id, b"hello", Some(0)).await.unwrap(), 5);
        assert_eq!(manager.append(id, b" world", Some(5)).await.unwrap(), 11);

        let digest = Digest::compute(b"hello world");
        let layer = manager
            .finalize(id, b"", &digest, "application/octet-stream", &storage)
            .await
            .unwrap();

        assert_eq!(layer.size, 11);
        assert_eq!(layer.fragment_digest_list().len(), 2);

        // Committed and readable outside the transaction.
        let row = metadata.get_layer(&digest.to_string()).await.unwrap();
        assert_eq!(row.object_key, layer.object_key);
        assert_eq!(
            storage.get(&layer.object_key).await.unwrap().as_ref(),
            b"hello world"
        );

        // Session is gone.
        assert_eq!(
            manager.progress(id).await.unwrap_err().status(),
            StatusCode::NOT_FOUND
        );
    }

    #[tokio::test]
    async fn out_of_order_chunk_is_rejected_and_session_survives() {
        let (_temp, metadata, _storage, manager) = setup().await;

        let id = manager.open(&metadata).await.unwrap();
        manager.append(id, b"hello", Some(0)).await.unwrap();

        let err = manager.append(id, b"late", Some(10)).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::RANGE_NOT_SATISFIABLE);

        // The session is still usable at the correct offset.
        assert_eq!(manager.append(id, b"!", Some(5)).await.unwrap(), 6);
    }

    #[tokio::test]
    async fn rangeless_second_chunk_is_rejected() {
        let (_temp, metadata, _storage, manager) = setup().await;

        let id = manager.open(&metadata).await.unwrap();
        manager.append(id, b"hello", None).await.unwrap();

        let err = manager.append(id, b"more", None).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn digest_mismatch_aborts_and_forgets_session() {
        let (_temp, metadata, storage, manager) = setup().await;

        let id = manager.open(&metadata).await.unwrap();
        manager.append(id, b"hello", Some(0)).await.unwrap();

        let wrong = Digest::compute(b"something else");
        let err = manager
            .finalize(id, b"", &wrong, "application/octet-stream", &storage)
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(err.code(), ErrorCode::DigestInvalid);

        // Follow-up PATCH sees an unknown upload.
        let err = manager.append(id, b"x", Some(5)).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);

        // Nothing was committed.
        assert!(metadata
            .get_layer(&Digest::compute(b"hello").to_string())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn concurrent_access_conflicts() {
        let (_temp, metadata, _storage, manager) = setup().await;

        let id = manager.open(&metadata).await.unwrap();
        let session = manager.checkout(id).await.unwrap();

        let err = manager.append(id, b"hello", Some(0)).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::CONFLICT);

        manager.checkin(id, session).await;
        manager.append(id, b"hello", Some(0)).await.unwrap();
    }

    #[tokio::test]
    async fn cancel_aborts_transaction() {
        let (_temp, metadata, _storage, manager) = setup().await;

        let id = manager.open(&metadata).await.unwrap();
        manager.append(id, b"hello", Some(0)).await.unwrap();
        manager.cancel(id).await.unwrap();

        assert_eq!(
            manager.progress(id).await.unwrap_err().status(),
            StatusCode::NOT_FOUND
        );
    }

    #[tokio::test]
    async fn sweep_evicts_expired_sessions() {
        let (_temp, metadata, _storage, manager) = setup().await;

        let fresh = manager.open(&metadata).await.unwrap();
        let stale = manager.open(&metadata).await.unwrap();
        manager.force_expire(stale).await;

        assert_eq!(manager.sweep().await, 1);
        assert!(manager.progress(fresh).await.is_ok());
        assert_eq!(
            manager.progress(stale).await.unwrap_err().status(),
            StatusCode::NOT_FOUND
        );
    }
}
