//! Shared handler helpers: custom headers, object key layout, and path
//! parsing.

use crate::error::{ApiResult, ErrorCode, RegistryError};
use axum::body::Body;
use axum::http::header::HeaderName;
use axum::http::StatusCode;
use axum::response::Response;
use wharf_core::digest::Digest;
use wharf_core::reference::Namespace;

pub const DOCKER_DISTRIBUTION_API_VERSION: HeaderName =
    HeaderName::from_static("docker-distribution-api-version");
pub const DOCKER_CONTENT_DIGEST: HeaderName = HeaderName::from_static("docker-content-digest");
pub const DOCKER_UPLOAD_UUID: HeaderName = HeaderName::from_static("docker-upload-uuid");

/// Value of the version header on every `/v2/` ping.
pub const API_VERSION: &str = "registry/2.0";

/// Largest accepted manifest body (4 MiB).
pub const MAX_MANIFEST_BODY: usize = 4 * 1024 * 1024;

/// Largest accepted blob body per request (256 MiB). Bigger layers arrive
/// through the chunked upload path.
pub const MAX_BLOB_BODY: usize = 256 * 1024 * 1024;

/// Object key for a layer blob.
pub fn blob_object_key(digest: &Digest) -> String {
    format!("blobs/{digest}")
}

/// Object key for manifest JSON bytes.
pub fn manifest_object_key(digest: &Digest) -> String {
    format!("manifests/{digest}")
}

/// Validate the two repository path parameters into a namespace.
pub fn namespace_from_path(username: &str, imagename: &str) -> ApiResult<Namespace> {
    Namespace::from_parts(username, imagename).map_err(|err| {
        RegistryError::new(StatusCode::BAD_REQUEST, ErrorCode::NameInvalid, err.to_string())
    })
}

/// Read a request body up to `limit` bytes.
pub async fn read_body(body: Body, limit: usize) -> ApiResult<bytes::Bytes> {
    axum::body::to_bytes(body, limit).await.map_err(|err| {
        RegistryError::new(
            StatusCode::BAD_REQUEST,
            ErrorCode::SizeInvalid,
            format!("failed to read request body: {err}"),
        )
    })
}

/// GET /v2/ - API version check.
pub async fn api_version() -> ApiResult<Response> {
    let response = Response::builder()
        .status(StatusCode::OK)
        .header(DOCKER_DISTRIBUTION_API_VERSION, API_VERSION)
        .body(Body::empty())
        .map_err(|e| RegistryError::internal(e.to_string()))?;
    Ok(response)
}
