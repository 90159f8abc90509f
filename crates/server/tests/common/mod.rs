//! Server test utilities.

use axum::body::{Body, Bytes};
use axum::http::{HeaderMap, Request, StatusCode};
use serde_json::{Value, json};
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;
use wharf_core::AppConfig;
use wharf_core::digest::Digest;
use wharf_metadata::{MetadataStore, SqliteStore};
use wharf_server::{AppState, create_router};
use wharf_storage::{FilesystemBackend, ObjectStore};

/// A test server wrapper with all dependencies.
/// Note: #[allow(dead_code)] because each test file compiles common/ separately.
#[allow(dead_code)]
pub struct TestServer {
    pub router: axum::Router,
    pub state: AppState,
    _temp_dir: TempDir,
}

#[allow(dead_code)]
impl TestServer {
    /// Create a new test server over SQLite metadata and filesystem
    /// storage in a temp directory.
    pub async fn new() -> Self {
        let temp_dir = tempfile::tempdir().expect("failed to create temp directory");

        let storage: Arc<dyn ObjectStore> = Arc::new(
            FilesystemBackend::new(temp_dir.path().join("storage"))
                .await
                .expect("failed to create storage backend"),
        );

        let metadata: Arc<dyn MetadataStore> = Arc::new(
            SqliteStore::new(temp_dir.path().join("metadata.db"))
                .await
                .expect("failed to create metadata store"),
        );

        let state = AppState::new(AppConfig::for_testing(), storage, metadata);
        let router = create_router(state.clone());

        Self {
            router,
            state,
            _temp_dir: temp_dir,
        }
    }

    /// Get access to the underlying metadata store.
    pub fn metadata(&self) -> Arc<dyn MetadataStore> {
        self.state.metadata.clone()
    }
}

/// Send a request and collect the full response.
#[allow(dead_code)]
pub async fn send(
    router: &axum::Router,
    method: &str,
    uri: &str,
    token: Option<&str>,
    headers: &[(&str, &str)],
    body: Vec<u8>,
) -> (StatusCode, HeaderMap, Bytes) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header("Authorization", format!("Bearer {token}"));
    }
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }

    let request = builder.body(Body::from(body)).unwrap();
    let response = router.clone().oneshot(request).await.unwrap();

    let status = response.status();
    let headers = response.headers().clone();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, headers, body)
}

/// Send a JSON request and parse the JSON response (Null when empty).
#[allow(dead_code)]
pub async fn send_json(
    router: &axum::Router,
    method: &str,
    uri: &str,
    token: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let (headers, bytes): (Vec<(&str, &str)>, Vec<u8>) = match body {
        Some(value) => (
            vec![("Content-Type", "application/json")],
            serde_json::to_vec(&value).unwrap(),
        ),
        None => (Vec::new(), Vec::new()),
    };

    let (status, _headers, body) = send(router, method, uri, token, &headers, bytes).await;
    let json = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).unwrap_or(Value::Null)
    };
    (status, json)
}

/// Register a user and sign in, returning the access token.
#[allow(dead_code)]
pub async fn create_account(server: &TestServer, username: &str) -> String {
    let (status, _) = send_json(
        &server.router,
        "POST",
        "/auth/signup",
        None,
        Some(json!({
            "username": username,
            "email": format!("{username}@example.test"),
            "password": "correct-horse-battery",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "signup failed for {username}");

    let (status, body) = send_json(
        &server.router,
        "POST",
        "/auth/signin",
        None,
        Some(json!({
            "identifier": username,
            "password": "correct-horse-battery",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "signin failed for {username}");
    body["access_token"].as_str().unwrap().to_string()
}

/// Push a blob through the monolithic shortcut, returning its digest.
#[allow(dead_code)]
pub async fn push_blob(
    server: &TestServer,
    token: &str,
    namespace: &str,
    payload: &[u8],
) -> Digest {
    let digest = Digest::compute(payload);
    let uri = format!("/v2/{namespace}/blobs/uploads/?digest={digest}");
    let (status, headers, _) = send(
        &server.router,
        "POST",
        &uri,
        Some(token),
        &[],
        payload.to_vec(),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "monolithic push failed");
    assert_eq!(
        headers.get("location").unwrap().to_str().unwrap(),
        format!("/v2/{namespace}/blobs/{digest}")
    );
    digest
}

/// A well-formed manifest body referencing the given layer digest.
#[allow(dead_code)]
pub fn manifest_body(layer_digest: &Digest, layer_size: usize) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "schemaVersion": 2,
        "mediaType": "application/vnd.docker.distribution.manifest.v2+json",
        "config": {
            "mediaType": "application/vnd.docker.container.image.v1+json",
            "digest": format!("sha256:{}", "c".repeat(64)),
            "size": 7023,
        },
        "layers": [{
            "mediaType": "application/vnd.docker.image.rootfs.diff.tar.gzip",
            "digest": layer_digest.to_string(),
            "size": layer_size,
        }],
    }))
    .unwrap()
}

/// Push a manifest under a tag, returning its digest.
#[allow(dead_code)]
pub async fn push_manifest(
    server: &TestServer,
    token: &str,
    namespace: &str,
    reference: &str,
    body: &[u8],
) -> Digest {
    let uri = format!("/v2/{namespace}/manifests/{reference}");
    let (status, headers, _) = send(
        &server.router,
        "PUT",
        &uri,
        Some(token),
        &[(
            "Content-Type",
            "application/vnd.docker.distribution.manifest.v2+json",
        )],
        body.to_vec(),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "manifest push failed");

    let digest = Digest::compute(body);
    assert_eq!(
        headers.get("docker-content-digest").unwrap().to_str().unwrap(),
        digest.to_string()
    );
    digest
}
