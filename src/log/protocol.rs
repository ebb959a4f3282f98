//! Batch metadata protocol and key naming.
//!
//! One request per line, `{"key": "<log key>", "fields": {name: [value]}}`,
//! answered by one line carrying the key's full current field set. A request
//! with no fields is a pure read.

use std::path::Path;

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::log::record::FieldMap;

/// Backend-specific key prefix for content-addressed task keys.
pub const LOG_KEY_PREFIX: &str = "SHA256E-s0--";

/// Suffix of per-key metadata files on the log branch.
pub const METADATA_SUFFIX: &str = ".log.met";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchRequest {
    pub key: String,
    pub fields: FieldMap,
}

impl BatchRequest {
    pub fn read(fingerprint: &str) -> Self {
        Self {
            key: log_key(fingerprint),
            fields: FieldMap::new(),
        }
    }

    pub fn write(fingerprint: &str, fields: FieldMap) -> Self {
        Self {
            key: log_key(fingerprint),
            fields,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchResponse {
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub fields: FieldMap,
    #[serde(default = "default_success")]
    pub success: bool,
    #[serde(default, rename = "error-messages", skip_serializing_if = "Vec::is_empty")]
    pub error_messages: Vec<String>,
}

fn default_success() -> bool {
    true
}

/// Something that speaks the batch protocol for one log.
///
/// Implementations own their connection state; the driver serializes calls.
pub trait MetadataBackend: Send {
    /// Send one request line and return the full resulting field set.
    fn exchange(&mut self, request: &BatchRequest) -> Result<BatchResponse>;

    /// Remove every field of `key` (a log key, not a fingerprint).
    fn remove_all(&mut self, key: &str) -> Result<()>;

    /// Release the connection; the next call reconnects.
    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

impl<B: MetadataBackend + ?Sized> MetadataBackend for Box<B> {
    fn exchange(&mut self, request: &BatchRequest) -> Result<BatchResponse> {
        (**self).exchange(request)
    }

    fn remove_all(&mut self, key: &str) -> Result<()> {
        (**self).remove_all(key)
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }
}

/// Log key for a task fingerprint.
pub fn log_key(fingerprint: &str) -> String {
    format!("{LOG_KEY_PREFIX}{fingerprint}")
}

/// Metadata file path of a log key on the log branch:
/// `<md5[0..3]>/<md5[3..6]>/<key>.log.met`.
pub fn metadata_path(key: &str) -> String {
    let digest = hex::encode(Md5::digest(key.as_bytes()));
    format!("{}/{}/{}{}", &digest[0..3], &digest[3..6], key, METADATA_SUFFIX)
}

/// Metadata file path of a task fingerprint.
pub fn metadata_path_for(fingerprint: &str) -> String {
    metadata_path(&log_key(fingerprint))
}

/// Journal file name for a metadata path (slashes flattened).
pub fn journal_name(path: &str) -> String {
    path.replace('/', "_")
}

/// Fingerprint named by a metadata file path, if it is one.
pub fn fingerprint_from_path(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    let key = name.strip_suffix(METADATA_SUFFIX)?;
    // other annexed content shares the branch; only task keys qualify
    let fingerprint = key.strip_prefix(LOG_KEY_PREFIX)?;
    if fingerprint.is_empty() {
        None
    } else {
        Some(fingerprint.to_string())
    }
}
