//! Image manifest structure.
//!
//! Only the fields the registry itself needs are modeled; the full manifest
//! bytes are stored verbatim in the object store and served back unchanged,
//! so unknown fields survive the round trip regardless.

use crate::digest::Digest;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Media type for Docker schema 2 manifests.
pub const MEDIA_TYPE_MANIFEST_V2: &str = "application/vnd.docker.distribution.manifest.v2+json";

/// Media type for OCI image manifests.
pub const MEDIA_TYPE_OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";

/// Fallback media type for layer blobs pulled without one.
pub const MEDIA_TYPE_OCTET_STREAM: &str = "application/octet-stream";

/// An OCI content descriptor: a typed, sized pointer to a blob.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub digest: Digest,
    pub size: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub annotations: HashMap<String, String>,
}

/// An image manifest: the config descriptor plus the ordered layer list.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
    pub schema_version: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Descriptor>,
    #[serde(default)]
    pub layers: Vec<Descriptor>,
}

impl ImageManifest {
    /// Parse manifest JSON bytes.
    pub fn parse(bytes: &[u8]) -> crate::Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| crate::Error::InvalidManifest(e.to_string()))
    }

    /// Digests of all layers referenced by this manifest, in order.
    pub fn layer_digests(&self) -> Vec<Digest> {
        self.layers.iter().map(|layer| layer.digest).collect()
    }

    /// Total size of the config blob, if declared.
    pub fn config_size(&self) -> i64 {
        self.config.as_ref().map(|c| c.size).unwrap_or(0)
    }
}
