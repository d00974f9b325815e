//! Exit File Protocol
//!
//! Exit files are named `<prefix>-<hex pubkey>.json`, where generated files
//! use the validator index as the prefix, and hold a signed voluntary exit:
//!
//! ```json
//! {"message":{"epoch":"256","validator_index":"1000"},"signature":"0x..."}
//! ```

use crate::signing::VoluntaryExit;
use crate::types::{parse_hex_fixed, to_prefixed_hex, BlsPubkey, BlsSignature};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

const EXTENSION: &str = ".json";

/// Errors from reading a single exit file. These cause the file to be skipped.
#[derive(Debug, Error)]
pub enum ExitFileError {
    #[error("malformed exit filename {name:?}: {reason}")]
    MalformedFilename { name: String, reason: String },

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid exit JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid {field} in {path}: {reason}")]
    InvalidField {
        path: PathBuf,
        field: &'static str,
        reason: String,
    },
}

/// A parsed exit filename
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitFileName {
    prefix: String,
    pubkey: BlsPubkey,
}

impl ExitFileName {
    /// Name for a generated exit: `<validator_index>-<pubkey>.json`
    #[must_use]
    pub fn for_exit(validator_index: u64, pubkey: BlsPubkey) -> Self {
        Self {
            prefix: validator_index.to_string(),
            pubkey,
        }
    }

    /// Parse `<prefix>-<hex pubkey>.json`. The pubkey is the segment after the
    /// last `-` and may carry a `0x` prefix.
    ///
    /// # Errors
    /// Returns [`ExitFileError::MalformedFilename`] if the name does not follow
    /// the pattern.
    pub fn parse(name: &str) -> Result<Self, ExitFileError> {
        let malformed = |reason: &str| ExitFileError::MalformedFilename {
            name: name.to_string(),
            reason: reason.to_string(),
        };

        let stem = name
            .strip_suffix(EXTENSION)
            .ok_or_else(|| malformed("missing .json extension"))?;
        let (prefix, pubkey) = stem
            .rsplit_once('-')
            .ok_or_else(|| malformed("expected <prefix>-<pubkey>"))?;
        if prefix.is_empty() {
            return Err(malformed("empty prefix"));
        }
        let pubkey = pubkey
            .parse::<BlsPubkey>()
            .map_err(|e| malformed(&format!("invalid pubkey: {e}")))?;

        Ok(Self {
            prefix: prefix.to_string(),
            pubkey,
        })
    }

    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    #[must_use]
    pub fn pubkey(&self) -> BlsPubkey {
        self.pubkey
    }

    /// The prefix read as a validator index, if it is one
    #[must_use]
    pub fn index(&self) -> Option<u64> {
        self.prefix.parse().ok()
    }
}

impl fmt::Display for ExitFileName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}{EXTENSION}", self.prefix, self.pubkey)
    }
}

/// JSON body of an exit file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedVoluntaryExitJson {
    pub message: VoluntaryExitJson,
    pub signature: String,
}

/// `message` of [`SignedVoluntaryExitJson`]; numbers are decimal strings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoluntaryExitJson {
    pub epoch: String,
    pub validator_index: String,
}

impl SignedVoluntaryExitJson {
    #[must_use]
    pub fn new(exit: &VoluntaryExit, signature: &BlsSignature) -> Self {
        Self {
            message: VoluntaryExitJson {
                epoch: exit.epoch.to_string(),
                validator_index: exit.validator_index.to_string(),
            },
            signature: to_prefixed_hex(signature.as_bytes()),
        }
    }
}

/// A single parsed exit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitRecord {
    pub validator_index: u64,
    pub epoch: u64,
    pub signature: BlsSignature,
    pub pubkey: BlsPubkey,
    pub path: PathBuf,
}

impl ExitRecord {
    /// Read an exit file, taking the pubkey from its name.
    ///
    /// # Errors
    /// Returns an [`ExitFileError`] for a malformed name, unreadable file or
    /// malformed body.
    pub fn read(path: &Path) -> Result<Self, ExitFileError> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| ExitFileError::MalformedFilename {
                name: path.display().to_string(),
                reason: "not valid UTF-8".to_string(),
            })?;
        let file_name = ExitFileName::parse(name)?;

        let contents = std::fs::read(path).map_err(|source| ExitFileError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        Self::from_slice(path, file_name.pubkey(), &contents)
    }

    /// Parse an exit body for `pubkey`.
    ///
    /// # Errors
    /// Returns an [`ExitFileError`] if the JSON or any field is malformed.
    pub fn from_slice(path: &Path, pubkey: BlsPubkey, contents: &[u8]) -> Result<Self, ExitFileError> {
        let body: SignedVoluntaryExitJson =
            serde_json::from_slice(contents).map_err(|source| ExitFileError::Json {
                path: path.to_path_buf(),
                source,
            })?;

        let invalid = |field: &'static str, reason: String| ExitFileError::InvalidField {
            path: path.to_path_buf(),
            field,
            reason,
        };

        let epoch = body
            .message
            .epoch
            .parse::<u64>()
            .map_err(|e| invalid("epoch", e.to_string()))?;
        let validator_index = body
            .message
            .validator_index
            .parse::<u64>()
            .map_err(|e| invalid("validator_index", e.to_string()))?;
        let signature = parse_hex_fixed(&body.signature)
            .map(BlsSignature)
            .map_err(|e| invalid("signature", e.to_string()))?;

        Ok(Self {
            validator_index,
            epoch,
            signature,
            pubkey,
            path: path.to_path_buf(),
        })
    }

    /// The signed message
    #[must_use]
    pub fn message(&self) -> VoluntaryExit {
        VoluntaryExit {
            epoch: self.epoch,
            validator_index: self.validator_index,
        }
    }
}
