//! Repository namespaces and manifest references.

use crate::digest::Digest;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum length of a tag, per the distribution spec.
const MAX_TAG_LEN: usize = 128;

/// A repository namespace: `<username>/<imagename>`.
///
/// The username half is the unit of ownership; mutating requests are only
/// allowed when the authenticated subject matches it.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Namespace(String);

impl Namespace {
    /// Build a namespace from its two path components, validating both.
    pub fn from_parts(username: &str, imagename: &str) -> crate::Result<Self> {
        validate_path_component(username)?;
        validate_path_component(imagename)?;
        Ok(Self(format!("{username}/{imagename}")))
    }

    /// Parse a `<username>/<imagename>` string.
    pub fn parse(s: &str) -> crate::Result<Self> {
        let (username, imagename) = s.split_once('/').ok_or_else(|| {
            crate::Error::InvalidNamespace(format!("expected <username>/<imagename>, got {s}"))
        })?;
        Self::from_parts(username, imagename)
    }

    /// The owning username.
    pub fn username(&self) -> &str {
        self.0.split_once('/').map(|(u, _)| u).unwrap_or(&self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Namespace({})", self.0)
    }
}

/// Validate a bare username (one namespace path component). Registration
/// applies the same rules as namespace parsing so every user can be pushed
/// to.
pub fn validate_username(s: &str) -> crate::Result<()> {
    validate_path_component(s)
}

fn validate_path_component(s: &str) -> crate::Result<()> {
    if s.is_empty() {
        return Err(crate::Error::InvalidNamespace(
            "empty path component".to_string(),
        ));
    }
    let valid = s.chars().all(|c| {
        c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_' || c == '.'
    });
    if !valid || s.starts_with(['-', '.']) {
        return Err(crate::Error::InvalidNamespace(format!(
            "invalid path component: {s}"
        )));
    }
    Ok(())
}

/// A manifest reference: either a mutable tag or an immutable digest.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reference {
    Tag(String),
    Digest(Digest),
}

impl Reference {
    /// Parse a reference. Anything carrying the `sha256:` prefix must be a
    /// well-formed digest; everything else is validated as a tag.
    pub fn parse(s: &str) -> crate::Result<Self> {
        if Digest::looks_like_digest(s) {
            let digest = Digest::parse(s)
                .map_err(|e| crate::Error::InvalidReference(e.to_string()))?;
            return Ok(Self::Digest(digest));
        }
        validate_tag(s)?;
        Ok(Self::Tag(s.to_string()))
    }

    /// Whether this reference is a digest.
    pub fn is_digest(&self) -> bool {
        matches!(self, Self::Digest(_))
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tag(tag) => write!(f, "{tag}"),
            Self::Digest(digest) => write!(f, "{digest}"),
        }
    }
}

fn validate_tag(s: &str) -> crate::Result<()> {
    if s.is_empty() || s.len() > MAX_TAG_LEN {
        return Err(crate::Error::InvalidReference(format!(
            "tag must be 1-{MAX_TAG_LEN} chars"
        )));
    }
    let mut chars = s.chars();
    let first = chars.next().unwrap();
    if !(first.is_ascii_alphanumeric() || first == '_') {
        return Err(crate::Error::InvalidReference(format!(
            "tag must start with an alphanumeric or underscore: {s}"
        )));
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')) {
        return Err(crate::Error::InvalidReference(format!("invalid tag: {s}")));
    }
    Ok(())
}
