//! Registry API error types.
//!
//! Every error surfaced to a client is rendered as the registry error
//! envelope:
//!
//! ```json
//! { "errors": [ { "code": "<CODE>", "message": "<msg>", "detail": { ... } } ] }
//! ```

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use wharf_metadata::MetadataError;
use wharf_storage::StorageError;

/// Registry error codes, as defined by the distribution spec.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCode {
    BlobUnknown,
    BlobUploadInvalid,
    BlobUploadUnknown,
    DigestInvalid,
    ManifestBlobUnknown,
    ManifestInvalid,
    ManifestUnknown,
    NameInvalid,
    NameUnknown,
    SizeInvalid,
    TagInvalid,
    Unauthorized,
    Denied,
    Unsupported,
    Unknown,
}

impl ErrorCode {
    /// Wire representation of the code.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BlobUnknown => "BLOB_UNKNOWN",
            Self::BlobUploadInvalid => "BLOB_UPLOAD_INVALID",
            Self::BlobUploadUnknown => "BLOB_UPLOAD_UNKNOWN",
            Self::DigestInvalid => "DIGEST_INVALID",
            Self::ManifestBlobUnknown => "MANIFEST_BLOB_UNKNOWN",
            Self::ManifestInvalid => "MANIFEST_INVALID",
            Self::ManifestUnknown => "MANIFEST_UNKNOWN",
            Self::NameInvalid => "NAME_INVALID",
            Self::NameUnknown => "NAME_UNKNOWN",
            Self::SizeInvalid => "SIZE_INVALID",
            Self::TagInvalid => "TAG_INVALID",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::Denied => "DENIED",
            Self::Unsupported => "UNSUPPORTED",
            Self::Unknown => "UNKNOWN",
        }
    }
}

/// An error response: HTTP status plus one envelope entry.
#[derive(Debug)]
pub struct RegistryError {
    status: StatusCode,
    code: ErrorCode,
    message: String,
    detail: Option<serde_json::Value>,
}

impl RegistryError {
    pub fn new(status: StatusCode, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            detail: None,
        }
    }

    /// Attach a free-form detail map.
    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = Some(detail);
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    // Conveniences for the codes handlers reach for constantly.

    pub fn blob_unknown(digest: &str) -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            ErrorCode::BlobUnknown,
            format!("blob unknown to registry: {digest}"),
        )
    }

    pub fn upload_unknown(uuid: impl std::fmt::Display) -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            ErrorCode::BlobUploadUnknown,
            format!("blob upload unknown to registry: {uuid}"),
        )
    }

    pub fn manifest_unknown(reference: &str) -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            ErrorCode::ManifestUnknown,
            format!("manifest unknown to registry: {reference}"),
        )
    }

    pub fn digest_invalid(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, ErrorCode::DigestInvalid, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, ErrorCode::Unauthorized, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, ErrorCode::Unknown, message)
    }
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code.as_str(), self.message)
    }
}

impl std::error::Error for RegistryError {}

/// Generic fallbacks for errors handlers did not map to a specific code.
impl From<MetadataError> for RegistryError {
    fn from(err: MetadataError) -> Self {
        match err {
            MetadataError::NotFound(what) => {
                Self::new(StatusCode::NOT_FOUND, ErrorCode::Unknown, what)
            }
            MetadataError::Conflict(what) => {
                Self::new(StatusCode::CONFLICT, ErrorCode::Unknown, what)
            }
            other => Self::internal(other.to_string()),
        }
    }
}

impl From<StorageError> for RegistryError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(key) => Self::blob_unknown(&key),
            other => Self::internal(other.to_string()),
        }
    }
}

impl From<wharf_core::Error> for RegistryError {
    fn from(err: wharf_core::Error) -> Self {
        use wharf_core::Error;
        match &err {
            Error::InvalidDigest(_) => Self::digest_invalid(err.to_string()),
            Error::InvalidNamespace(_) => {
                Self::new(StatusCode::BAD_REQUEST, ErrorCode::NameInvalid, err.to_string())
            }
            Error::InvalidReference(_) => {
                Self::new(StatusCode::BAD_REQUEST, ErrorCode::TagInvalid, err.to_string())
            }
            Error::InvalidManifest(_) => {
                Self::new(StatusCode::BAD_REQUEST, ErrorCode::ManifestInvalid, err.to_string())
            }
            Error::Token(_) => Self::unauthorized(err.to_string()),
            _ => Self::internal(err.to_string()),
        }
    }
}

#[derive(Serialize)]
struct ErrorEnvelope {
    errors: Vec<ErrorEntry>,
}

#[derive(Serialize)]
struct ErrorEntry {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

impl IntoResponse for RegistryError {
    fn into_response(self) -> Response {
        let envelope = ErrorEnvelope {
            errors: vec![ErrorEntry {
                code: self.code.as_str(),
                message: self.message,
                detail: self.detail,
            }],
        };
        (self.status, Json(envelope)).into_response()
    }
}

/// Result type for API handlers.
pub type ApiResult<T> = std::result::Result<T, RegistryError>;
