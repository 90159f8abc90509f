//! Repository discovery: catalog listing, tag listing, and search.

use crate::error::{ApiResult, ErrorCode, RegistryError};
use crate::handlers::common::namespace_from_path;
use crate::state::AppState;
use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use serde::Serialize;
use std::collections::HashMap;

/// Body of `GET /v2/_catalog`.
#[derive(Debug, Serialize)]
pub struct CatalogResponse {
    pub repositories: Vec<String>,
    pub total: i64,
}

/// Body of `GET /v2/<name>/tags/list`.
#[derive(Debug, Serialize)]
pub struct TagListResponse {
    pub name: String,
    pub tags: Vec<String>,
}

fn parse_query_int(params: &HashMap<String, String>, key: &str) -> ApiResult<Option<i64>> {
    match params.get(key) {
        None => Ok(None),
        Some(raw) => raw.parse::<i64>().map(Some).map_err(|err| {
            RegistryError::new(
                StatusCode::BAD_REQUEST,
                ErrorCode::Unsupported,
                format!("invalid query parameter {key}: {err}"),
            )
        }),
    }
}

/// GET /v2/_catalog?n=<page_size>&last=<offset>&ns=<prefix>
pub async fn catalog(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult<Json<CatalogResponse>> {
    let page_size = parse_query_int(&params, "n")?.unwrap_or(0);
    let offset = parse_query_int(&params, "last")?.unwrap_or(0);
    let namespace_filter = params.get("ns").map(String::as_str);

    let repositories = state
        .metadata
        .get_catalog(namespace_filter, page_size, offset)
        .await?;
    let total = state.metadata.get_catalog_count().await?;

    Ok(Json(CatalogResponse {
        repositories,
        total,
    }))
}

/// GET /v2/{username}/{imagename}/tags/list?n=<limit>
///
/// `n` truncates from the head; `n == 0` yields an empty list.
pub async fn list_tags(
    State(state): State<AppState>,
    Path((username, imagename)): Path<(String, String)>,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult<Json<TagListResponse>> {
    let namespace = namespace_from_path(&username, &imagename)?;

    let mut tags = state.metadata.get_image_tags(namespace.as_str()).await?;

    if let Some(raw) = params.get("n") {
        let limit: i64 = raw.parse().map_err(|err| {
            RegistryError::new(
                StatusCode::NOT_FOUND,
                ErrorCode::TagInvalid,
                format!("invalid tag limit: {err}"),
            )
        })?;
        if limit <= 0 {
            tags.clear();
        } else {
            tags.truncate(limit as usize);
        }
    }

    Ok(Json(TagListResponse {
        name: namespace.as_str().to_string(),
        tags,
    }))
}

/// GET /v2/_search?search_query=<q>
pub async fn search_namespaces(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult<Json<Vec<String>>> {
    let query = params
        .get("search_query")
        .filter(|q| !q.is_empty())
        .ok_or_else(|| {
            RegistryError::new(
                StatusCode::BAD_REQUEST,
                ErrorCode::Unsupported,
                "search query must not be empty",
            )
        })?;

    let result = state.metadata.get_image_namespace(query).await?;
    Ok(Json(result))
}
