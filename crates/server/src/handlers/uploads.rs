//! Blob upload endpoints: monolithic push plus the chunked upload
//! lifecycle.

use crate::error::{ApiResult, ErrorCode, RegistryError};
use crate::handlers::common::{
    DOCKER_CONTENT_DIGEST, DOCKER_UPLOAD_UUID, MAX_BLOB_BODY, blob_object_key,
    namespace_from_path, read_body,
};
use crate::state::AppState;
use axum::body::Body;
use axum::extract::{Path, Query, Request, State};
use axum::http::StatusCode;
use axum::http::header::{CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, LOCATION, RANGE};
use axum::response::Response;
use std::collections::HashMap;
use uuid::Uuid;
use wharf_core::digest::Digest;
use wharf_core::manifest::MEDIA_TYPE_OCTET_STREAM;
use wharf_core::reference::Namespace;
use wharf_metadata::models::LayerRow;

/// Parse a `Content-Range: <start>-<end>` header value.
fn parse_content_range(value: &str) -> ApiResult<(u64, u64)> {
    let range = value.strip_prefix("bytes=").unwrap_or(value);
    let parse = || -> Option<(u64, u64)> {
        let (start, end) = range.split_once('-')?;
        Some((start.trim().parse().ok()?, end.trim().parse().ok()?))
    };
    parse().ok_or_else(|| {
        RegistryError::new(
            StatusCode::RANGE_NOT_SATISFIABLE,
            ErrorCode::BlobUploadUnknown,
            format!("invalid Content-Range: {value}"),
        )
    })
}

/// The inclusive `Range` response value for an accumulated length.
fn range_header(total: u64) -> String {
    format!("0-{}", total.saturating_sub(1))
}

fn upload_location(namespace: &Namespace, id: Uuid) -> String {
    format!("/v2/{namespace}/blobs/uploads/{id}")
}

fn blob_location(namespace: &Namespace, digest: &Digest) -> String {
    format!("/v2/{namespace}/blobs/{digest}")
}

fn parse_upload_uuid(uuid: &str) -> ApiResult<Uuid> {
    Uuid::parse_str(uuid).map_err(|_| {
        RegistryError::new(
            StatusCode::BAD_REQUEST,
            ErrorCode::BlobUploadInvalid,
            format!("invalid upload uuid: {uuid}"),
        )
    })
}

/// POST /v2/{username}/{imagename}/blobs/uploads/
///
/// Without a `digest` parameter this opens a chunked upload session. With
/// one it is the monolithic shortcut: the whole layer in a single body.
#[tracing::instrument(skip(state, req), fields(namespace))]
pub async fn start_upload(
    State(state): State<AppState>,
    Path((username, imagename)): Path<(String, String)>,
    Query(params): Query<HashMap<String, String>>,
    req: Request,
) -> ApiResult<Response> {
    let namespace = namespace_from_path(&username, &imagename)?;
    tracing::Span::current().record("namespace", namespace.as_str());

    if let Some(digest) = params.get("digest") {
        let digest = Digest::parse(digest)?;
        let media_type = req
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or(MEDIA_TYPE_OCTET_STREAM)
            .to_string();
        let body = read_body(req.into_body(), MAX_BLOB_BODY).await?;
        return monolithic_upload(&state, &namespace, &digest, &media_type, body).await;
    }

    let id = state.uploads.open(state.metadata.as_ref()).await?;

    let response = Response::builder()
        .status(StatusCode::ACCEPTED)
        .header(LOCATION, upload_location(&namespace, id))
        .header(DOCKER_UPLOAD_UUID, id.to_string())
        .header(RANGE, "0-0")
        .header(CONTENT_LENGTH, 0)
        .body(Body::empty())
        .map_err(|e| RegistryError::internal(e.to_string()))?;
    Ok(response)
}

/// Monolithic shortcut: verify the digest, store the bytes, and commit the
/// layer row in one request.
async fn monolithic_upload(
    state: &AppState,
    namespace: &Namespace,
    digest: &Digest,
    media_type: &str,
    body: bytes::Bytes,
) -> ApiResult<Response> {
    let computed = Digest::compute(&body);
    if computed != *digest {
        return Err(RegistryError::digest_invalid(
            "client digest does not match computed digest",
        )
        .with_detail(serde_json::json!({
            "clientDigest": digest.to_string(),
            "computedDigest": computed.to_string(),
        })));
    }

    let object_key = blob_object_key(digest);
    let size = body.len() as i64;
    state.storage.put(&object_key, body).await?;

    let layer = LayerRow {
        uuid: Uuid::new_v4(),
        digest: digest.to_string(),
        object_key,
        media_type: media_type.to_string(),
        size,
        fragment_digests: "[]".to_string(),
    };

    let mut txn = state.metadata.begin().await?;
    if let Err(err) = txn.set_layer(&layer).await {
        let _ = txn.abort().await;
        return Err(err.into());
    }
    txn.commit().await?;

    tracing::info!(digest = %digest, size, "monolithic layer push committed");

    let response = Response::builder()
        .status(StatusCode::CREATED)
        .header(LOCATION, blob_location(namespace, digest))
        .header(DOCKER_CONTENT_DIGEST, digest.to_string())
        .header(CONTENT_LENGTH, 0)
        .body(Body::empty())
        .map_err(|e| RegistryError::internal(e.to_string()))?;
    Ok(response)
}

/// PATCH /v2/{username}/{imagename}/blobs/uploads/{uuid}
#[tracing::instrument(skip(state, req), fields(upload_id = %uuid))]
pub async fn patch_upload(
    State(state): State<AppState>,
    Path((username, imagename, uuid)): Path<(String, String, String)>,
    req: Request,
) -> ApiResult<Response> {
    let namespace = namespace_from_path(&username, &imagename)?;
    let id = parse_upload_uuid(&uuid)?;

    let start = match req.headers().get(CONTENT_RANGE) {
        Some(value) => {
            let value = value.to_str().map_err(|_| {
                RegistryError::new(
                    StatusCode::RANGE_NOT_SATISFIABLE,
                    ErrorCode::BlobUploadUnknown,
                    "unreadable Content-Range header",
                )
            })?;
            Some(parse_content_range(value)?.0)
        }
        None => None,
    };

    let body = read_body(req.into_body(), MAX_BLOB_BODY).await?;
    let total = state.uploads.append(id, &body, start).await?;

    let response = Response::builder()
        .status(StatusCode::ACCEPTED)
        .header(LOCATION, upload_location(&namespace, id))
        .header(DOCKER_UPLOAD_UUID, id.to_string())
        .header(RANGE, range_header(total))
        .header(CONTENT_LENGTH, 0)
        .body(Body::empty())
        .map_err(|e| RegistryError::internal(e.to_string()))?;
    Ok(response)
}

/// GET /v2/{username}/{imagename}/blobs/uploads/{uuid} - upload progress.
pub async fn get_upload_progress(
    State(state): State<AppState>,
    Path((username, imagename, uuid)): Path<(String, String, String)>,
) -> ApiResult<Response> {
    let namespace = namespace_from_path(&username, &imagename)?;
    let id = parse_upload_uuid(&uuid)?;

    let total = state.uploads.progress(id).await?;

    let response = Response::builder()
        .status(StatusCode::NO_CONTENT)
        .header(LOCATION, upload_location(&namespace, id))
        .header(DOCKER_UPLOAD_UUID, id.to_string())
        .header(RANGE, range_header(total))
        .body(Body::empty())
        .map_err(|e| RegistryError::internal(e.to_string()))?;
    Ok(response)
}

/// PUT /v2/{username}/{imagename}/blobs/uploads/{uuid}?digest=<d>
///
/// Finalize a chunked upload. The body, if any, is the trailing chunk.
#[tracing::instrument(skip(state, req), fields(upload_id = %uuid))]
pub async fn put_upload(
    State(state): State<AppState>,
    Path((username, imagename, uuid)): Path<(String, String, String)>,
    Query(params): Query<HashMap<String, String>>,
    req: Request,
) -> ApiResult<Response> {
    let namespace = namespace_from_path(&username, &imagename)?;
    let id = parse_upload_uuid(&uuid)?;

    let digest = params
        .get("digest")
        .ok_or_else(|| RegistryError::digest_invalid("missing digest parameter"))?;
    let digest = Digest::parse(digest)?;

    let media_type = req
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or(MEDIA_TYPE_OCTET_STREAM)
        .to_string();

    let trailing = read_body(req.into_body(), MAX_BLOB_BODY).await?;
    let layer = state
        .uploads
        .finalize(id, &trailing, &digest, &media_type, state.storage.as_ref())
        .await?;

    let response = Response::builder()
        .status(StatusCode::CREATED)
        .header(LOCATION, blob_location(&namespace, &digest))
        .header(DOCKER_CONTENT_DIGEST, layer.digest)
        .header(CONTENT_LENGTH, 0)
        .body(Body::empty())
        .map_err(|e| RegistryError::internal(e.to_string()))?;
    Ok(response)
}

/// DELETE /v2/{username}/{imagename}/blobs/uploads/{uuid} - cancel.
pub async fn cancel_upload(
    State(state): State<AppState>,
    Path((username, imagename, uuid)): Path<(String, String, String)>,
) -> ApiResult<Response> {
    namespace_from_path(&username, &imagename)?;
    let id = parse_upload_uuid(&uuid)?;

    state.uploads.cancel(id).await?;

    let response = Response::builder()
        .status(StatusCode::NO_CONTENT)
        .header(CONTENT_LENGTH, 0)
        .body(Body::empty())
        .map_err(|e| RegistryError::internal(e.to_string()))?;
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_range_parses_plain_and_bytes_forms() {
        assert_eq!(parse_content_range("0-4").unwrap(), (0, 4));
        assert_eq!(parse_content_range("bytes=5-10").unwrap(), (5, 10));
    }

    #[test]
    fn content_range_rejects_garbage() {
        assert!(parse_content_range("five-ten").is_err());
        assert!(parse_content_range("5").is_err());
        assert!(parse_content_range("").is_err());
    }

    #[test]
    fn range_header_is_inclusive() {
        assert_eq!(range_header(0), "0-0");
        assert_eq!(range_header(1), "0-0");
        assert_eq!(range_header(11), "0-10");
    }
}
