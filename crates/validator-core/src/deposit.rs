//! Deposit Data Verification
//!
//! Parses a deposit-data file (as produced by the staking deposit CLI),
//! checks every record against the operator's expectations and verifies
//! each deposit signature under the record's own fork version.

use crate::network::DOMAIN_DEPOSIT;
use crate::signing::{
    compute_domain, compute_signing_root, hash_tree_root, DepositData, DepositMessage,
    SignatureVerifier, SigningError,
};
use crate::types::{parse_hex_fixed, to_prefixed_hex, BlsPubkey, BlsSignature, Root, Version};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// Errors from loading, validating or verifying deposit data
#[derive(Debug, Error)]
pub enum DepositError {
    #[error("failed to read deposit data file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse deposit data: {0}")]
    Json(#[from] serde_json::Error),

    #[error("deposit record {record}: invalid {field}: {reason}")]
    Parse {
        record: usize,
        field: &'static str,
        reason: String,
    },

    #[error("count mismatch: expected {expected}, got {actual}")]
    CountMismatch { expected: usize, actual: usize },

    #[error("invalid deposit for pubkey {pubkey}: {mismatch}")]
    CriteriaMismatch {
        pubkey: BlsPubkey,
        mismatch: CriteriaMismatch,
    },

    #[error("invalid deposit for pubkey {pubkey}: {kind} mismatch: file has {expected}, computed {computed}")]
    RootMismatch {
        pubkey: BlsPubkey,
        kind: &'static str,
        expected: String,
        computed: String,
    },

    #[error("invalid deposit signature for pubkey {pubkey}: {source}")]
    Verification {
        pubkey: BlsPubkey,
        #[source]
        source: SigningError,
    },
}

/// The expectation a record failed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CriteriaMismatch {
    #[error("network mismatch: expected {expected}, got {actual}")]
    Network { expected: String, actual: String },

    #[error("amount mismatch: expected {expected}, got {actual}")]
    Amount { expected: u64, actual: u64 },

    #[error("withdrawal credentials mismatch: expected {expected}, got {actual}")]
    WithdrawalCredentials { expected: String, actual: String },
}

/// Operator expectations for a deposit batch.
///
/// Empty network, absent credentials and a zero count are wildcards. The
/// amount is always compared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectedDepositCriteria {
    pub network: String,
    pub amount: u64,
    pub withdrawal_credentials: Option<[u8; 32]>,
    pub count: usize,
}

impl Default for ExpectedDepositCriteria {
    fn default() -> Self {
        Self {
            network: String::new(),
            amount: 32_000_000_000,
            withdrawal_credentials: None,
            count: 0,
        }
    }
}

/// One entry of a deposit-data file as written by the deposit CLI.
/// Byte fields are lowercase hex without a `0x` prefix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepositJson {
    pub pubkey: String,
    pub withdrawal_credentials: String,
    pub amount: u64,
    pub signature: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deposit_message_root: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deposit_data_root: Option<String>,
    #[serde(default)]
    pub network_name: String,
    #[serde(default)]
    pub deposit_cli_version: String,
    pub fork_version: String,
}

/// A parsed deposit record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepositRecord {
    pub pubkey: BlsPubkey,
    pub withdrawal_credentials: [u8; 32],
    pub amount: u64,
    pub signature: BlsSignature,
    pub fork_version: Version,
    pub network_name: String,
    pub deposit_message_root: Option<Root>,
    pub deposit_data_root: Option<Root>,
}

impl DepositRecord {
    fn from_json(record: usize, raw: &DepositJson) -> Result<Self, DepositError> {
        let field = |field: &'static str| {
            move |e: crate::types::HexError| DepositError::Parse {
                record,
                field,
                reason: e.to_string(),
            }
        };

        Ok(Self {
            pubkey: raw.pubkey.parse().map_err(field("pubkey"))?,
            withdrawal_credentials: parse_hex_fixed(&raw.withdrawal_credentials)
                .map_err(field("withdrawal_credentials"))?,
            amount: raw.amount,
            signature: raw.signature.parse().map_err(field("signature"))?,
            fork_version: parse_hex_fixed(&raw.fork_version).map_err(field("fork_version"))?,
            network_name: raw.network_name.clone(),
            deposit_message_root: raw
                .deposit_message_root
                .as_deref()
                .map(parse_hex_fixed)
                .transpose()
                .map_err(field("deposit_message_root"))?,
            deposit_data_root: raw
                .deposit_data_root
                .as_deref()
                .map(parse_hex_fixed)
                .transpose()
                .map_err(field("deposit_data_root"))?,
        })
    }

    /// Check the record against `criteria`, ignoring the count.
    ///
    /// # Errors
    /// Returns the first failed expectation.
    pub fn validate(&self, criteria: &ExpectedDepositCriteria) -> Result<(), CriteriaMismatch> {
        if !criteria.network.is_empty() && self.network_name != criteria.network {
            return Err(CriteriaMismatch::Network {
                expected: criteria.network.clone(),
                actual: self.network_name.clone(),
            });
        }

        if self.amount != criteria.amount {
            return Err(CriteriaMismatch::Amount {
                expected: criteria.amount,
                actual: self.amount,
            });
        }

        if let Some(expected) = criteria.withdrawal_credentials {
            if self.withdrawal_credentials != expected {
                return Err(CriteriaMismatch::WithdrawalCredentials {
                    expected: hex::encode(expected),
                    actual: hex::encode(self.withdrawal_credentials),
                });
            }
        }

        Ok(())
    }

    /// Recompute the deposit roots, then verify the signature under the
    /// deposit domain for this record's fork version.
    ///
    /// # Errors
    /// Returns an error naming this record's pubkey on any failure.
    pub fn verify(&self, verifier: &dyn SignatureVerifier) -> Result<(), DepositError> {
        let wrap = |source| DepositError::Verification {
            pubkey: self.pubkey,
            source,
        };

        let message = DepositMessage::new(&self.pubkey, self.withdrawal_credentials, self.amount)
            .map_err(wrap)?;
        let message_root = hash_tree_root(&message).map_err(wrap)?;
        self.check_root("deposit_message_root", self.deposit_message_root, message_root)?;

        if self.deposit_data_root.is_some() {
            let data = DepositData::new(
                &self.pubkey,
                self.withdrawal_credentials,
                self.amount,
                &self.signature,
            )
            .map_err(wrap)?;
            let data_root = hash_tree_root(&data).map_err(wrap)?;
            self.check_root("deposit_data_root", self.deposit_data_root, data_root)?;
        }

        // Deposits are valid across forks, so the genesis validators root is zero.
        let domain = compute_domain(DOMAIN_DEPOSIT, self.fork_version, [0u8; 32]).map_err(wrap)?;
        let signing_root = compute_signing_root(message_root, domain).map_err(wrap)?;

        verifier
            .verify(&self.pubkey, &signing_root, &self.signature)
            .map_err(wrap)
    }

    fn check_root(
        &self,
        kind: &'static str,
        declared: Option<Root>,
        computed: Root,
    ) -> Result<(), DepositError> {
        match declared {
            Some(declared) if declared != computed => Err(DepositError::RootMismatch {
                pubkey: self.pubkey,
                kind,
                expected: hex::encode(declared),
                computed: hex::encode(computed),
            }),
            _ => Ok(()),
        }
    }
}

/// All records of one deposit-data file
#[derive(Debug, Clone)]
pub struct DepositBatch {
    records: Vec<DepositRecord>,
}

impl DepositBatch {
    /// Read and parse a deposit-data file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or any record is malformed.
    pub fn load(path: &Path) -> Result<Self, DepositError> {
        let contents = std::fs::read(path).map_err(|source| DepositError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let batch = Self::from_slice(&contents)?;
        info!(path = %path.display(), records = batch.len(), "Loaded deposit data");
        Ok(batch)
    }

    /// Parse a deposit-data JSON array.
    ///
    /// # Errors
    /// Returns an error if the JSON or any hex field is malformed.
    pub fn from_slice(contents: &[u8]) -> Result<Self, DepositError> {
        let raw: Vec<DepositJson> = serde_json::from_slice(contents)?;
        let records = raw
            .iter()
            .enumerate()
            .map(|(i, r)| DepositRecord::from_json(i, r))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { records })
    }

    #[must_use]
    pub fn records(&self) -> &[DepositRecord] {
        &self.records
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// `0x`-prefixed pubkeys in file order
    #[must_use]
    pub fn pubkeys(&self) -> Vec<String> {
        self.records
            .iter()
            .map(|r| to_prefixed_hex(r.pubkey.as_bytes()))
            .collect()
    }

    /// Check the batch against `criteria`. The count is checked once before
    /// any record.
    ///
    /// # Errors
    /// Returns the count mismatch or the first record mismatch.
    pub fn validate(&self, criteria: &ExpectedDepositCriteria) -> Result<(), DepositError> {
        if criteria.count > 0 && self.records.len() != criteria.count {
            return Err(DepositError::CountMismatch {
                expected: criteria.count,
                actual: self.records.len(),
            });
        }

        for record in &self.records {
            record
                .validate(criteria)
                .map_err(|mismatch| DepositError::CriteriaMismatch {
                    pubkey: record.pubkey,
                    mismatch,
                })?;
        }

        debug!(records = self.records.len(), "Deposit data matches expectations");
        Ok(())
    }

    /// Verify every record, stopping at the first failure.
    ///
    /// # Errors
    /// Returns the first failing record's error.
    pub fn verify(&self, verifier: &dyn SignatureVerifier) -> Result<(), DepositError> {
        for record in &self.records {
            record.verify(verifier)?;
            debug!(pubkey = %record.pubkey, "Deposit signature verified");
        }
        Ok(())
    }
}

impl fmt::Display for DepositBatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.records.is_empty() {
            return f.write_str("[]");
        }
        write!(f, "[\"{}\"]", self.pubkeys().join("\", \""))
    }
}
