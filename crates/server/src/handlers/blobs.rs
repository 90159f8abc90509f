//! Layer blob endpoints: existence checks, pulls, and deletes.

use crate::error::{ApiResult, ErrorCode, RegistryError};
use crate::handlers::common::{DOCKER_CONTENT_DIGEST, namespace_from_path};
use crate::state::AppState;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use axum::http::StatusCode;
use axum::response::Response;
use wharf_core::digest::Digest;
use wharf_core::manifest::MEDIA_TYPE_OCTET_STREAM;
use wharf_metadata::MetadataError;

/// HEAD /v2/{username}/{imagename}/blobs/{digest}
pub async fn head_blob(
    State(state): State<AppState>,
    Path((username, imagename, digest)): Path<(String, String, String)>,
) -> ApiResult<Response> {
    namespace_from_path(&username, &imagename)?;
    let digest = Digest::parse(&digest)?;

    let layer = state
        .metadata
        .get_layer(&digest.to_string())
        .await
        .map_err(|err| match err {
            MetadataError::NotFound(_) => RegistryError::blob_unknown(&digest.to_string()),
            other => other.into(),
        })?;

    // A live layer must be backed by bytes in the object store.
    let meta = state.storage.head(&layer.object_key).await?;

    let response = Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_LENGTH, meta.size)
        .header(DOCKER_CONTENT_DIGEST, layer.digest)
        .body(Body::empty())
        .map_err(|e| RegistryError::internal(e.to_string()))?;
    Ok(response)
}

/// GET /v2/{username}/{imagename}/blobs/{digest}
///
/// The layer bytes are re-digested on the way out; corrupted storage must
/// never serve bytes under a digest they no longer match.
#[tracing::instrument(skip(state), fields(digest = %digest))]
pub async fn get_blob(
    State(state): State<AppState>,
    Path((username, imagename, digest)): Path<(String, String, String)>,
) -> ApiResult<Response> {
    namespace_from_path(&username, &imagename)?;
    let digest = Digest::parse(&digest)?;

    let layer = state
        .metadata
        .get_layer(&digest.to_string())
        .await
        .map_err(|err| match err {
            MetadataError::NotFound(_) => RegistryError::blob_unknown(&digest.to_string()),
            other => other.into(),
        })?;

    let bytes = state.storage.get(&layer.object_key).await?;

    let computed = Digest::compute(&bytes);
    if computed != digest {
        tracing::error!(
            stored_digest = %digest,
            computed_digest = %computed,
            object_key = %layer.object_key,
            "stored layer bytes no longer match their digest"
        );
        return Err(RegistryError::new(
            StatusCode::NOT_FOUND,
            ErrorCode::BlobUploadUnknown,
            "stored digest is different than computed digest",
        )
        .with_detail(serde_json::json!({
            "storedDigest": digest.to_string(),
            "computedDigest": computed.to_string(),
        })));
    }

    let response = Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, MEDIA_TYPE_OCTET_STREAM)
        .header(CONTENT_LENGTH, bytes.len())
        .header(DOCKER_CONTENT_DIGEST, digest.to_string())
        .body(Body::from(bytes))
        .map_err(|e| RegistryError::internal(e.to_string()))?;
    Ok(response)
}

/// DELETE /v2/{username}/{imagename}/blobs/{digest}
///
/// Deletes the layer row and its blob fragments in one transaction; the
/// object-store bytes are removed best-effort afterwards.
#[tracing::instrument(skip(state), fields(digest = %digest))]
pub async fn delete_blob(
    State(state): State<AppState>,
    Path((username, imagename, digest)): Path<(String, String, String)>,
) -> ApiResult<Response> {
    namespace_from_path(&username, &imagename)?;
    let digest = Digest::parse(&digest)?;

    let layer = state
        .metadata
        .get_layer(&digest.to_string())
        .await
        .map_err(|err| match err {
            MetadataError::NotFound(_) => RegistryError::blob_unknown(&digest.to_string()),
            other => other.into(),
        })?;
    let fragments = layer.fragment_digest_list();

    let mut txn = state.metadata.begin().await?;
    if let Err(err) = txn.delete_layer(&layer.digest).await {
        let _ = txn.abort().await;
        return Err(err.into());
    }
    for fragment in &fragments {
        if let Err(err) = txn.delete_blob(fragment).await {
            let _ = txn.abort().await;
            return Err(err.into());
        }
    }
    txn.commit().await?;

    if let Err(err) = state.storage.delete(&layer.object_key).await {
        tracing::warn!(
            object_key = %layer.object_key,
            error = %err,
            "failed to delete layer bytes; object is orphaned"
        );
    }

    let response = Response::builder()
        .status(StatusCode::ACCEPTED)
        .header(CONTENT_LENGTH, 0)
        .body(Body::empty())
        .map_err(|e| RegistryError::internal(e.to_string()))?;
    Ok(response)
}
