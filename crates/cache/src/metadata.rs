//! Binary metadata record stored in each entry's headers stream
use cachestorage_core::{Error, Headers, Request, Response, Result};
use serde::{Deserialize, Serialize};
use std::time::SystemTime;

/// Bumped whenever the record layout changes; older records read as corrupt
pub const METADATA_VERSION: u32 = 1;

/// The parts of the request that matching needs after the fact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMetadata {
    pub method: String,
    pub headers: Headers,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMetadata {
    pub version: u32,
    /// Insertion time; orders match-all and keys results
    pub entry_time: SystemTime,
    pub request: RequestMetadata,
    pub response: Response,
}

impl EntryMetadata {
    pub fn new(request: &Request, response: Response, entry_time: SystemTime) -> Self {
        Self {
            version: METADATA_VERSION,
            entry_time,
            request: RequestMetadata {
                method: request.method.clone(),
                headers: request.headers.clone(),
            },
            response,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| Error::encode("entry metadata", e))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let metadata: Self =
            bincode::deserialize(bytes).map_err(|e| Error::decode("entry metadata", e))?;
        if metadata.version != METADATA_VERSION {
            return Err(Error::storage(
                "decode entry metadata",
                format!(
                    "unsupported version {} (expected {})",
                    metadata.version, METADATA_VERSION
                ),
            ));
        }
        Ok(metadata)
    }

    /// Rebuild the stored request; the entry key supplies the URL
    pub fn to_request(&self, key: &str) -> Result<Request> {
        let mut request = Request::new(self.request.method.clone(), key)?;
        request.headers = self.request.headers.clone();
        Ok(request)
    }
}
