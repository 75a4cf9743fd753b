//! Newtype wrappers for origins and blob identifiers

use crate::errors::{Error, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt::{self, Display};
use std::ops::Deref;
use std::str::FromStr;
use url::Url;
use uuid::Uuid;

/// A serialized tuple origin (`scheme://host[:port]`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Origin(String);

impl Origin {
    /// Derive the origin of an absolute URL
    pub fn from_url(url: &Url) -> Result<Self> {
        let origin = url.origin();
        if !origin.is_tuple() {
            return Err(Error::invalid_argument(
                "origin",
                format!("'{url}' has an opaque origin"),
            ));
        }
        Ok(Origin(origin.ascii_serialization()))
    }

    /// Parse an origin from any URL string belonging to it
    pub fn parse(value: &str) -> Result<Self> {
        let url = Url::parse(value)?;
        Self::from_url(&url)
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Filesystem-safe identifier for this origin's storage root
    pub fn storage_key(&self) -> String {
        storage_hash(&self.0)
    }
}

impl Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Deref for Origin {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl FromStr for Origin {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Identifier of a blob registered with the blob layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlobId(Uuid);

impl BlobId {
    /// Allocate a fresh random identifier
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the inner UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for BlobId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Hex SHA-256 of a string, used to derive path components from untrusted names
pub fn storage_hash(value: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_origin_strips_path_and_query() {
        let origin = Origin::parse("https://example.com:8443/a/b?c=d").unwrap();
        assert_eq!(origin.as_str(), "https://example.com:8443");

        let default_port = Origin::parse("https://example.com/").unwrap();
        assert_eq!(default_port.as_str(), "https://example.com");
    }

    #[test]
    fn test_opaque_origin_rejected() {
        assert!(Origin::parse("data:text/plain,hello").is_err());
    }

    #[test]
    fn test_storage_key_is_stable_hex() {
        let origin = Origin::parse("https://example.com").unwrap();
        let key = origin.storage_key();
        assert_eq!(key.len(), 64);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(key, Origin::parse("https://example.com/x").unwrap().storage_key());
    }
}
