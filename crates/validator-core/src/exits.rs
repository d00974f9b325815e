//! Voluntary Exit Registry and Consistency Checks
//!
//! Scans a directory of exit files, groups the records per validator pubkey and
//! checks that every pubkey covers one contiguous validator index range, that
//! all pubkeys cover the same range, and that every exit verifies against a
//! minimal state.

use crate::beacon_client::{BeaconClient, BeaconClientError};
use crate::exit_file::{ExitFileError, ExitFileName, ExitRecord};
use crate::network::{ChainSpec, NetworkConfigError};
use crate::signing::SignatureVerifier;
use crate::state::{ExitCheckError, ExitVerificationState, ValidatorEntry};
use crate::types::{parse_hex_fixed, BlsPubkey, HexError};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors from loading, checking, verifying or extracting exits
#[derive(Debug, Error)]
pub enum ExitError {
    #[error(transparent)]
    Network(#[from] NetworkConfigError),

    #[error("invalid withdrawal credentials: {0}")]
    InvalidWithdrawalCredentials(HexError),

    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unexpected pubkey found: {0}")]
    UnexpectedPubkey(BlsPubkey),

    #[error("expected pubkey not found: {0}")]
    MissingExpectedPubkey(BlsPubkey),

    #[error("no voluntary exits found")]
    NoExitsFound,

    #[error("{found} files found but expected {total} for pubkey {pubkey}")]
    Gap {
        pubkey: BlsPubkey,
        found: usize,
        total: u128,
    },

    #[error("expected {expected} exits for pubkey {pubkey} but found {found}")]
    CountMismatch {
        pubkey: BlsPubkey,
        expected: usize,
        found: usize,
    },

    #[error("{bound} validator index mismatch: {actual} for pubkey {pubkey} vs {reference} for pubkey {reference_pubkey}")]
    RangeMismatch {
        bound: Bound,
        pubkey: BlsPubkey,
        actual: u64,
        reference_pubkey: BlsPubkey,
        reference: u64,
    },

    #[error("no exits found for pubkey {0}")]
    EmptyExitSet(BlsPubkey),

    #[error("exit for pubkey {pubkey} at validator index {validator_index} failed verification: {source}")]
    Verification {
        pubkey: BlsPubkey,
        validator_index: u64,
        #[source]
        source: ExitCheckError,
    },

    #[error(transparent)]
    Beacon(#[from] BeaconClientError),

    #[error("validator with pubkey {0} not found in beacon state")]
    NotOnChain(BlsPubkey),

    #[error("validator with pubkey {pubkey} is not active (status: {status})")]
    NotActive { pubkey: BlsPubkey, status: String },

    #[error("validator with pubkey {pubkey} has index {index} on chain but no exit for it")]
    NoExitForIndex { pubkey: BlsPubkey, index: u64 },
}

/// Which end of an index range differed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bound {
    Minimum,
    Maximum,
}

impl fmt::Display for Bound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Minimum => f.write_str("minimum"),
            Self::Maximum => f.write_str("maximum"),
        }
    }
}

/// Result of examining one directory entry
#[derive(Debug)]
pub enum FileOutcome {
    Parsed(ExitRecord),
    Skipped(ExitFileError),
    Fatal(ExitError),
}

/// Range reported after a successful verification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VerifySummary {
    pub first_index: u64,
    pub last_index: u64,
}

/// Exits for one pubkey plus the state they verify against
#[derive(Debug, Clone)]
pub struct ValidatorExitSet {
    pubkey: BlsPubkey,
    records: Vec<ExitRecord>,
    state: ExitVerificationState,
}

impl ValidatorExitSet {
    /// Seed the set from its first record: the state holds one placeholder per
    /// index below the record's, so the record's validator lands on its index.
    fn seed(spec: &ChainSpec, first: &ExitRecord) -> Self {
        Self {
            pubkey: first.pubkey,
            records: Vec::new(),
            state: ExitVerificationState::seeded(spec, first.epoch, first.validator_index),
        }
    }

    /// Order records by validator index and reseed the state from the lowest.
    fn sort_and_reseed(&mut self, spec: &ChainSpec) {
        self.records.sort_by_key(|r| r.validator_index);
        if let Some(first) = self.records.first() {
            self.state = ExitVerificationState::seeded(spec, first.epoch, first.validator_index);
        }
    }

    #[must_use]
    pub fn pubkey(&self) -> BlsPubkey {
        self.pubkey
    }

    #[must_use]
    pub fn records(&self) -> &[ExitRecord] {
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

    /// `(min, max)` validator index, `None` when empty
    #[must_use]
    pub fn index_range(&self) -> Option<(u64, u64)> {
        let min = self.records.iter().map(|r| r.validator_index).min()?;
        let max = self.records.iter().map(|r| r.validator_index).max()?;
        Some((min, max))
    }
}

/// All exits found in one directory, grouped by pubkey
#[derive(Debug, Clone)]
pub struct ExitRegistry {
    spec: &'static ChainSpec,
    withdrawal_credentials: [u8; 32],
    sets: BTreeMap<BlsPubkey, ValidatorExitSet>,
}

impl ExitRegistry {
    /// Scan `dir` for exit files.
    ///
    /// Files with malformed names or bodies are skipped with a warning. A
    /// pubkey outside a non-empty `expected_pubkeys` is fatal, as is an
    /// expected pubkey with no exits or a directory with no exits at all.
    ///
    /// # Errors
    /// Returns an [`ExitError`] for an unknown network, malformed withdrawal
    /// credentials, an unreadable directory or any of the fatal cases above.
    pub fn load(
        dir: &Path,
        network: &str,
        withdrawal_credentials: &str,
        expected_pubkeys: &BTreeSet<BlsPubkey>,
    ) -> Result<Self, ExitError> {
        let spec = ChainSpec::for_network(network)?;
        let withdrawal_credentials = parse_hex_fixed(withdrawal_credentials)
            .map_err(ExitError::InvalidWithdrawalCredentials)?;

        let mut registry = Self {
            spec,
            withdrawal_credentials,
            sets: BTreeMap::new(),
        };

        for path in list_exit_files(dir)? {
            match classify(&path, expected_pubkeys) {
                FileOutcome::Parsed(record) => registry.insert(record),
                FileOutcome::Skipped(reason) => {
                    warn!(file = %path.display(), error = %reason, "Skipping file");
                }
                FileOutcome::Fatal(e) => return Err(e),
            }
        }
        for set in registry.sets.values_mut() {
            set.sort_and_reseed(spec);
        }

        if let Some(missing) = expected_pubkeys
            .iter()
            .find(|pubkey| !registry.sets.contains_key(*pubkey))
        {
            return Err(ExitError::MissingExpectedPubkey(*missing));
        }
        if registry.sets.is_empty() {
            return Err(ExitError::NoExitsFound);
        }

        info!(
            dir = %dir.display(),
            pubkeys = registry.sets.len(),
            exits = registry.exit_count(),
            "Loaded voluntary exits"
        );

        Ok(registry)
    }

    fn insert(&mut self, record: ExitRecord) {
        let spec = self.spec;
        self.sets
            .entry(record.pubkey)
            .or_insert_with(|| ValidatorExitSet::seed(spec, &record))
            .records
            .push(record);
    }

    #[must_use]
    pub fn chain_spec(&self) -> &'static ChainSpec {
        self.spec
    }

    /// Exit sets keyed by pubkey
    pub fn sets(&self) -> impl Iterator<Item = &ValidatorExitSet> {
        self.sets.values()
    }

    #[must_use]
    pub fn get(&self, pubkey: &BlsPubkey) -> Option<&ValidatorExitSet> {
        self.sets.get(pubkey)
    }

    /// Number of pubkeys
    #[must_use]
    pub fn len(&self) -> usize {
        self.sets.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    /// Number of exits across all pubkeys
    #[must_use]
    pub fn exit_count(&self) -> usize {
        self.sets.values().map(ValidatorExitSet::len).sum()
    }

    /// Check that every pubkey's exits cover a contiguous index range and,
    /// when `num_exits > 0`, that each pubkey has exactly that many.
    ///
    /// # Errors
    /// Returns the first gap, duplicate or count mismatch found.
    pub fn validate_count(&self, num_exits: usize) -> Result<(), ExitError> {
        if self.sets.is_empty() {
            return Err(ExitError::NoExitsFound);
        }

        for set in self.sets.values() {
            let (min, max) = set
                .index_range()
                .ok_or(ExitError::EmptyExitSet(set.pubkey))?;
            let total = u128::from(max - min) + 1;

            if total != set.len() as u128 {
                return Err(ExitError::Gap {
                    pubkey: set.pubkey,
                    found: set.len(),
                    total,
                });
            }

            if num_exits > 0 && set.len() != num_exits {
                return Err(ExitError::CountMismatch {
                    pubkey: set.pubkey,
                    expected: num_exits,
                    found: set.len(),
                });
            }
        }

        Ok(())
    }

    /// Check that all pubkeys cover the same index range. The pubkey that
    /// sorts first is the reference.
    ///
    /// # Errors
    /// Returns the first differing bound, or [`ExitError::EmptyExitSet`].
    pub fn validate_indices(&self) -> Result<(), ExitError> {
        if self.sets.len() <= 1 {
            return Ok(());
        }

        let mut sets = self.sets.values();
        let Some(reference) = sets.next() else {
            return Ok(());
        };
        let (ref_min, ref_max) = reference
            .index_range()
            .ok_or(ExitError::EmptyExitSet(reference.pubkey))?;

        for set in sets {
            let (min, max) = set
                .index_range()
                .ok_or(ExitError::EmptyExitSet(set.pubkey))?;

            for (bound, actual, expected) in [
                (Bound::Minimum, min, ref_min),
                (Bound::Maximum, max, ref_max),
            ] {
                if actual != expected {
                    return Err(ExitError::RangeMismatch {
                        bound,
                        pubkey: set.pubkey,
                        actual,
                        reference_pubkey: reference.pubkey,
                        reference: expected,
                    });
                }
            }
        }

        Ok(())
    }

    /// Verify every exit, in order, against its pubkey's state. Each record
    /// appends a validator for the pubkey before its exit is checked.
    ///
    /// # Errors
    /// Returns the first failure with its pubkey and validator index.
    pub fn verify(&self, verifier: &dyn SignatureVerifier) -> Result<VerifySummary, ExitError> {
        let mut summary = None;

        for set in self.sets.values() {
            let mut state = set.state.clone();
            let mut verified = 0usize;

            for record in &set.records {
                state.append_validator(ValidatorEntry::synthetic(
                    record.pubkey,
                    self.withdrawal_credentials,
                    self.spec.far_future_epoch,
                ));

                state
                    .verify_exit(self.spec, &record.message(), &record.signature, verifier)
                    .map_err(|source| ExitError::Verification {
                        pubkey: set.pubkey,
                        validator_index: record.validator_index,
                        source,
                    })?;

                verified += 1;
                debug!(pubkey = %set.pubkey, validator_index = record.validator_index, "Exit verified");
            }

            info!(pubkey = %set.pubkey, verified, total = set.len(), "Exits verified");

            if summary.is_none() {
                summary = set.index_range().map(|(first_index, last_index)| VerifySummary {
                    first_index,
                    last_index,
                });
            }
        }

        summary.ok_or(ExitError::NoExitsFound)
    }

    /// Copy, for every pubkey, the exit matching its live validator index into
    /// `output_dir` as `<index>-<pubkey>.json`.
    ///
    /// # Errors
    /// Returns an error if the beacon node cannot be queried, a pubkey is not
    /// on chain or not active, has no exit for its index, or a copy fails.
    pub async fn extract(
        &self,
        beacon: &BeaconClient,
        output_dir: &Path,
    ) -> Result<Vec<PathBuf>, ExitError> {
        let validators = beacon.get_validators("finalized").await?;
        let on_chain: HashMap<BlsPubkey, (String, String)> = validators
            .into_iter()
            .map(|v| (v.validator.pubkey, (v.index, v.status)))
            .collect();

        std::fs::create_dir_all(output_dir).map_err(|source| ExitError::Io {
            path: output_dir.to_path_buf(),
            source,
        })?;

        let mut written = Vec::with_capacity(self.sets.len());

        for set in self.sets.values() {
            let (index, status) = on_chain
                .get(&set.pubkey)
                .ok_or(ExitError::NotOnChain(set.pubkey))?;

            if !is_exitable_status(status) {
                return Err(ExitError::NotActive {
                    pubkey: set.pubkey,
                    status: status.clone(),
                });
            }

            let index: u64 = index.parse().map_err(|_| {
                BeaconClientError::InvalidResponse(format!("invalid validator index {index:?}"))
            })?;

            info!(pubkey = %set.pubkey, index, status = %status, "Extracting exit file for validator");

            let record = set
                .records
                .iter()
                .find(|r| r.validator_index == index)
                .ok_or(ExitError::NoExitForIndex {
                    pubkey: set.pubkey,
                    index,
                })?;

            let dest = output_dir.join(ExitFileName::for_exit(index, set.pubkey).to_string());
            std::fs::copy(&record.path, &dest).map_err(|source| ExitError::Io {
                path: dest.clone(),
                source,
            })?;
            written.push(dest);
        }

        info!(count = written.len(), "Successfully extracted all validator exit files");
        Ok(written)
    }
}

fn is_exitable_status(status: &str) -> bool {
    status.starts_with("active") || status == "pending_initialized" || status == "pending_queued"
}

/// Regular `.json` files in `dir`, ordered by numeric prefix then name
fn list_exit_files(dir: &Path) -> Result<Vec<PathBuf>, ExitError> {
    let io_err = |source| ExitError::Io {
        path: dir.to_path_buf(),
        source,
    };

    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(io_err)? {
        let entry = entry.map_err(io_err)?;
        if entry.file_type().map_err(io_err)?.is_dir() {
            continue;
        }
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "json") {
            files.push(path);
        }
    }

    files.sort_by_cached_key(|path| {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let index = ExitFileName::parse(&name).ok().and_then(|n| n.index());
        (index, name)
    });

    Ok(files)
}

fn classify(path: &Path, expected_pubkeys: &BTreeSet<BlsPubkey>) -> FileOutcome {
    match ExitRecord::read(path) {
        Err(e) => FileOutcome::Skipped(e),
        Ok(record) if !expected_pubkeys.is_empty() && !expected_pubkeys.contains(&record.pubkey) => {
            FileOutcome::Fatal(ExitError::UnexpectedPubkey(record.pubkey))
        }
        Ok(record) => FileOutcome::Parsed(record),
    }
}
