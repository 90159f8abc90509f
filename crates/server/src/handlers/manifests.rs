//! Manifest endpoints: push, pull, existence checks, and deletes.

use crate::error::{ApiResult, ErrorCode, RegistryError};
use crate::handlers::common::{
    DOCKER_CONTENT_DIGEST, MAX_MANIFEST_BODY, manifest_object_key, namespace_from_path, read_body,
};
use crate::state::AppState;
use axum::body::Body;
use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use axum::http::header::{CONTENT_LENGTH, CONTENT_TYPE, LOCATION};
use axum::response::Response;
use time::OffsetDateTime;
use uuid::Uuid;
use wharf_core::digest::Digest;
use wharf_core::manifest::{ImageManifest, MEDIA_TYPE_MANIFEST_V2};
use wharf_core::reference::Reference;
use wharf_metadata::MetadataError;
use wharf_metadata::models::{ConfigRow, ManifestRow};

fn map_manifest_lookup(reference: &str) -> impl FnOnce(MetadataError) -> RegistryError + '_ {
    move |err| match err {
        MetadataError::NotFound(_) => RegistryError::manifest_unknown(reference),
        other => other.into(),
    }
}

/// HEAD /v2/{username}/{imagename}/manifests/{reference}
pub async fn head_manifest(
    State(state): State<AppState>,
    Path((username, imagename, reference)): Path<(String, String, String)>,
) -> ApiResult<Response> {
    let namespace = namespace_from_path(&username, &imagename)?;
    let parsed = Reference::parse(&reference)?;

    let manifest = state
        .metadata
        .get_manifest_by_reference(namespace.as_str(), &reference)
        .await
        .map_err(map_manifest_lookup(&reference))?;

    // A digest reference must agree with the stored digest; disagreement
    // means the row was found through a stale tag column.
    if parsed.is_digest() && manifest.digest != reference {
        return Err(RegistryError::new(
            StatusCode::BAD_REQUEST,
            ErrorCode::ManifestInvalid,
            "manifest digest does not match requested reference",
        )
        .with_detail(serde_json::json!({
            "foundDigest": manifest.digest,
            "clientDigest": reference,
        })));
    }

    let meta = state
        .storage
        .head(&manifest.object_key)
        .await
        .map_err(|err| match err {
            wharf_storage::StorageError::NotFound(_) => RegistryError::new(
                StatusCode::NOT_FOUND,
                ErrorCode::ManifestBlobUnknown,
                "manifest bytes missing from object store",
            ),
            other => other.into(),
        })?;

    let response = Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, manifest.media_type)
        .header(CONTENT_LENGTH, meta.size)
        .header(DOCKER_CONTENT_DIGEST, manifest.digest)
        .body(Body::empty())
        .map_err(|e| RegistryError::internal(e.to_string()))?;
    Ok(response)
}

/// GET /v2/{username}/{imagename}/manifests/{reference}
#[tracing::instrument(skip(state), fields(reference = %reference))]
pub async fn get_manifest(
    State(state): State<AppState>,
    Path((username, imagename, reference)): Path<(String, String, String)>,
) -> ApiResult<Response> {
    let namespace = namespace_from_path(&username, &imagename)?;
    Reference::parse(&reference)?;

    let manifest = state
        .metadata
        .get_manifest_by_reference(namespace.as_str(), &reference)
        .await
        .map_err(map_manifest_lookup(&reference))?;

    let bytes = state
        .storage
        .get(&manifest.object_key)
        .await
        .map_err(|err| match err {
            wharf_storage::StorageError::NotFound(_) => RegistryError::new(
                StatusCode::NOT_FOUND,
                ErrorCode::ManifestBlobUnknown,
                "manifest bytes missing from object store",
            ),
            other => other.into(),
        })?;

    let response = Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, manifest.media_type)
        .header(CONTENT_LENGTH, bytes.len())
        .header(DOCKER_CONTENT_DIGEST, manifest.digest)
        .body(Body::from(bytes))
        .map_err(|e| RegistryError::internal(e.to_string()))?;
    Ok(response)
}

/// PUT /v2/{username}/{imagename}/manifests/{reference}
///
/// The manifest JSON goes to the object store first, then the manifest and
/// config rows commit in one transaction; a failure in between leaves an
/// orphan object, never dangling metadata.
#[tracing::instrument(skip(state, req), fields(reference = %reference, digest))]
pub async fn put_manifest(
    State(state): State<AppState>,
    Path((username, imagename, reference)): Path<(String, String, String)>,
    req: Request,
) -> ApiResult<Response> {
    let namespace = namespace_from_path(&username, &imagename)?;
    Reference::parse(&reference)?;

    let content_type = req
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let body = read_body(req.into_body(), MAX_MANIFEST_BODY).await?;
    let manifest = ImageManifest::parse(&body)?;

    let digest = Digest::compute(&body);
    tracing::Span::current().record("digest", tracing::field::display(&digest));

    let media_type = content_type
        .or_else(|| manifest.media_type.clone())
        .unwrap_or_else(|| MEDIA_TYPE_MANIFEST_V2.to_string());

    let object_key = manifest_object_key(&digest);
    state.storage.put(&object_key, body).await?;

    let layer_digests: Vec<String> = manifest
        .layer_digests()
        .iter()
        .map(|d| d.to_string())
        .collect();
    let layer_digests = serde_json::to_string(&layer_digests)
        .map_err(|e| RegistryError::internal(e.to_string()))?;

    let manifest_row = ManifestRow {
        uuid: Uuid::new_v4(),
        namespace: namespace.as_str().to_string(),
        media_type: media_type.clone(),
        schema_version: manifest.schema_version,
        digest: digest.to_string(),
        reference: reference.clone(),
        object_key: object_key.clone(),
        created_at: OffsetDateTime::now_utc(),
    };
    // The config row is keyed by the manifest document's own digest, like
    // the manifest row; digest-based deletes match both tables on it.
    let config_row = ConfigRow {
        uuid: Uuid::new_v4(),
        namespace: namespace.as_str().to_string(),
        reference: reference.clone(),
        digest: digest.to_string(),
        object_key,
        media_type,
        layer_digests,
        size: manifest.config_size(),
    };

    let mut txn = state.metadata.begin().await?;
    if let Err(err) = txn.set_manifest(&manifest_row).await {
        let _ = txn.abort().await;
        return Err(err.into());
    }
    if let Err(err) = txn.set_config(&config_row).await {
        let _ = txn.abort().await;
        return Err(err.into());
    }
    txn.commit().await?;

    tracing::info!(
        namespace = %namespace,
        reference = %reference,
        digest = %digest,
        "manifest pushed"
    );

    let response = Response::builder()
        .status(StatusCode::CREATED)
        .header(
            LOCATION,
            format!("/v2/{namespace}/manifests/{digest}"),
        )
        .header(DOCKER_CONTENT_DIGEST, digest.to_string())
        .header(CONTENT_LENGTH, 0)
        .body(Body::empty())
        .map_err(|e| RegistryError::internal(e.to_string()))?;
    Ok(response)
}

/// DELETE /v2/{username}/{imagename}/manifests/{reference}
///
/// A tag reference removes that tag; a digest reference removes every tag
/// pointing at the digest.
#[tracing::instrument(skip(state), fields(reference = %reference))]
pub async fn delete_manifest(
    State(state): State<AppState>,
    Path((username, imagename, reference)): Path<(String, String, String)>,
) -> ApiResult<Response> {
    let namespace = namespace_from_path(&username, &imagename)?;
    Reference::parse(&reference)?;

    let mut txn = state.metadata.begin().await?;
    if let Err(err) = txn
        .delete_manifest_or_tag(namespace.as_str(), &reference)
        .await
    {
        let _ = txn.abort().await;
        return Err(match err {
            MetadataError::NotFound(_) => RegistryError::manifest_unknown(&reference),
            other => other.into(),
        });
    }
    txn.commit().await?;

    let response = Response::builder()
        .status(StatusCode::ACCEPTED)
        .header(CONTENT_LENGTH, 0)
        .body(Body::empty())
        .map_err(|e| RegistryError::internal(e.to_string()))?;
    Ok(response)
}
