//! Database models mapping to the metadata schema.

use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

/// Registered user.
#[derive(Debug, Clone, FromRow)]
pub struct UserRow {
    pub id: Uuid,
    pub is_active: bool,
    pub username: String,
    pub email: String,
    pub name: Option<String>,
    /// bcrypt hash. `None` for OAuth-only users.
    pub password_hash: Option<String>,
    pub html_url: Option<String>,
    /// Upstream OAuth account id, when the user came in through OAuth.
    pub oauth_id: Option<i64>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// Login session. Deleted at sign-out and cascaded on user deletion.
#[derive(Debug, Clone, FromRow)]
pub struct SessionRow {
    pub id: Uuid,
    pub refresh_token: String,
    pub owner: Uuid,
}

/// Manifest record. One row per `(namespace, reference)`; several rows may
/// share a digest when multiple tags point at the same content.
#[derive(Debug, Clone, FromRow)]
pub struct ManifestRow {
    pub uuid: Uuid,
    pub namespace: String,
    pub media_type: String,
    pub schema_version: i32,
    pub digest: String,
    /// Tag or digest string the manifest was pushed under.
    pub reference: String,
    pub object_key: String,
    pub created_at: OffsetDateTime,
}

/// Image config record, one per manifest row.
#[derive(Debug, Clone, FromRow)]
pub struct ConfigRow {
    pub uuid: Uuid,
    pub namespace: String,
    pub reference: String,
    pub digest: String,
    pub object_key: String,
    pub media_type: String,
    /// JSON array of layer digests, in manifest order.
    pub layer_digests: String,
    pub size: i64,
}

impl ConfigRow {
    /// Decode the layer digest list.
    pub fn layer_digest_list(&self) -> Vec<String> {
        serde_json::from_str(&self.layer_digests).unwrap_or_default()
    }
}

/// Layer record, globally content-addressed by digest.
#[derive(Debug, Clone, FromRow)]
pub struct LayerRow {
    pub uuid: Uuid,
    pub digest: String,
    pub object_key: String,
    pub media_type: String,
    pub size: i64,
    /// JSON array of the blob fragment digests accumulated during upload.
    pub fragment_digests: String,
}

impl LayerRow {
    /// Decode the fragment digest list.
    pub fn fragment_digest_list(&self) -> Vec<String> {
        serde_json::from_str(&self.fragment_digests).unwrap_or_default()
    }
}

/// Blob fragment: one accepted chunk of an in-progress upload. Rolled up
/// into a layer row when the upload completes.
#[derive(Debug, Clone, FromRow)]
pub struct BlobFragmentRow {
    pub digest: String,
    pub upload_uuid: Uuid,
    pub range_start: i64,
    pub range_end: i64,
    pub object_key: Option<String>,
}
