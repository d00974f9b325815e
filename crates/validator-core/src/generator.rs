//! Voluntary Exit Generation
//!
//! Resolves the first target validator index, then, per keystore, queues one
//! task per iteration targeting `start + 1 ..= start + iterations` and hands
//! them to the worker pool.

use crate::beacon_client::{BeaconClient, BeaconClientError};
use crate::ethdo::{ExitSigner, SignerError};
use crate::network::NetworkConfig;
use crate::types::{hex_fixed, quoted_u64, BlsPubkey};
use crate::worker::{run_pool, ExitTask, GenerationPhase, GenerationProgress, WorkerContext};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, info_span, Instrument};

/// Errors from exit generation
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("number of workers must be at least 1")]
    InvalidWorkerCount,

    #[error("no keystores with prefix {prefix:?} found in {}", dir.display())]
    NoKeystores { dir: PathBuf, prefix: String },

    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse keystore {}: {reason}", path.display())]
    Keystore { path: PathBuf, reason: String },

    #[error("empty or null pubkey in keystore: {}", .0.display())]
    MissingPubkey(PathBuf),

    #[error("failed to fetch validator start index: {0}")]
    Beacon(#[from] BeaconClientError),

    #[error("validator index overflow: start {start} plus {iterations} iterations")]
    IndexOverflow { start: u64, iterations: u64 },

    #[error("worker {worker} failed to sign exit for validator index {validator_index}: {source}")]
    Signer {
        worker: usize,
        validator_index: u64,
        #[source]
        source: SignerError,
    },

    #[error("signer is not usable: {0}")]
    SignerUnavailable(#[source] SignerError),

    #[error("failed to encode preparation file: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("task queue closed before all tasks were queued")]
    QueueClosed,

    #[error("worker {worker} stopped unexpectedly: {reason}")]
    WorkerPanicked { worker: usize, reason: String },
}

/// Exit generation configuration
#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    /// Directory generated exits are written to
    pub output_dir: PathBuf,
    /// Withdrawal credentials placed in the preparation file
    pub withdrawal_credentials: [u8; 32],
    /// Exits per keystore
    pub iterations: u64,
    /// Explicit start index; the beacon node's highest index when unset
    pub index_start: Option<u64>,
    /// Added to the start index
    pub index_offset: u64,
    /// Worker count
    pub num_workers: usize,
    /// Keystore filename prefix
    pub keystore_prefix: String,
    /// Interval between progress lines
    pub progress_interval: Duration,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("."),
            withdrawal_credentials: [0u8; 32],
            iterations: 50_000,
            index_start: None,
            index_offset: 0,
            num_workers: num_cpus::get().max(1),
            keystore_prefix: "keystore-".to_string(),
            progress_interval: Duration::from_secs(10),
        }
    }
}

/// Offline preparation file handed to the signer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreparationContext {
    pub version: String,
    pub validators: Vec<ValidatorInfo>,
    #[serde(flatten)]
    pub network: NetworkConfig,
}

/// Validator entry of a [`PreparationContext`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorInfo {
    #[serde(with = "quoted_u64")]
    pub index: u64,
    pub pubkey: BlsPubkey,
    pub state: String,
    #[serde(with = "hex_fixed")]
    pub withdrawal_credentials: [u8; 32],
}

impl PreparationContext {
    pub const VERSION: &'static str = "3";

    /// Context describing `task`'s validator as active
    #[must_use]
    pub fn for_task(task: &ExitTask, withdrawal_credentials: [u8; 32], network: &NetworkConfig) -> Self {
        Self {
            version: Self::VERSION.to_string(),
            validators: vec![ValidatorInfo {
                index: task.validator_index,
                pubkey: task.pubkey,
                state: "active_ongoing".to_string(),
                withdrawal_credentials,
            }],
            network: network.clone(),
        }
    }
}

/// Drives exit generation for a set of keystores
#[derive(Debug)]
pub struct ExitGenerator<S> {
    config: GeneratorConfig,
    network: NetworkConfig,
    signer: Arc<S>,
    progress: GenerationProgress,
}

impl<S: ExitSigner> ExitGenerator<S> {
    /// # Errors
    /// Returns [`GenerationError::InvalidWorkerCount`] for zero workers.
    pub fn new(config: GeneratorConfig, network: NetworkConfig, signer: S) -> Result<Self, GenerationError> {
        if config.num_workers == 0 {
            return Err(GenerationError::InvalidWorkerCount);
        }

        info!(
            output_dir = %config.output_dir.display(),
            withdrawal_credentials = %hex::encode(config.withdrawal_credentials),
            iterations = config.iterations,
            workers = config.num_workers,
            "Creating exit generator"
        );

        Ok(Self {
            config,
            network,
            signer: Arc::new(signer),
            progress: GenerationProgress::new(),
        })
    }

    #[must_use]
    pub fn config(&self) -> &GeneratorConfig {
        &self.config
    }

    #[must_use]
    pub fn progress(&self) -> &GenerationProgress {
        &self.progress
    }

    /// The explicit start plus offset, or the beacon node's highest validator
    /// index plus offset.
    ///
    /// # Errors
    /// Returns an error if the beacon node is needed and cannot be queried.
    pub async fn resolve_start_index(&self, beacon: &BeaconClient) -> Result<u64, GenerationError> {
        self.progress.set_phase(GenerationPhase::Resolving);

        let base = match self.config.index_start {
            Some(start) => start,
            None => beacon.get_latest_validator_index().await?,
        };
        let start = base
            .checked_add(self.config.index_offset)
            .ok_or(GenerationError::IndexOverflow {
                start: base,
                iterations: self.config.index_offset,
            })?;

        info!(start_index = start, "Resolved start index");
        Ok(start)
    }

    pub fn set_total_keystores(&self, total: usize) {
        let total = u32::try_from(total).unwrap_or(u32::MAX);
        self.progress.set_total_keystores(total);
        info!(total, "Total keystores to process");
    }

    /// Probe the signer, then generate exits for each keystore in turn.
    ///
    /// # Errors
    /// Returns the first keystore's failure; later keystores are not started.
    pub async fn run(&self, keystores: &[PathBuf], start_index: u64) -> Result<(), GenerationError> {
        self.signer
            .probe()
            .await
            .map_err(GenerationError::SignerUnavailable)?;

        self.set_total_keystores(keystores.len());
        for keystore in keystores {
            self.generate_exits(keystore, start_index).await?;
        }
        Ok(())
    }

    /// Generate `iterations` exits for one keystore.
    ///
    /// # Errors
    /// Returns an error if the keystore is unreadable or has no pubkey, the
    /// output directory cannot be created, or any task fails.
    pub async fn generate_exits(&self, keystore: &Path, start_index: u64) -> Result<(), GenerationError> {
        let ordinal = self.progress.next_keystore();
        let span = info_span!("keystore", ordinal, path = %keystore.display());

        let result = self
            .generate_for_keystore(keystore, start_index, ordinal)
            .instrument(span)
            .await;

        self.progress.set_phase(if result.is_ok() {
            GenerationPhase::Completed
        } else {
            GenerationPhase::Failed
        });
        result
    }

    async fn generate_for_keystore(
        &self,
        keystore: &Path,
        start_index: u64,
        ordinal: u32,
    ) -> Result<(), GenerationError> {
        info!(
            "Processing keystore {ordinal}/{}",
            self.progress.total_keystores()
        );

        let keystore_path = std::path::absolute(keystore).map_err(|source| GenerationError::Io {
            path: keystore.to_path_buf(),
            source,
        })?;
        let pubkey = read_keystore_pubkey(&keystore_path)?;
        info!(pubkey = %pubkey, start_index, "Read keystore");

        std::fs::create_dir_all(&self.config.output_dir).map_err(|source| GenerationError::Io {
            path: self.config.output_dir.clone(),
            source,
        })?;

        self.progress.set_phase(GenerationPhase::Dispatching);
        let tasks = build_tasks(start_index, self.config.iterations, pubkey, &keystore_path)?;
        self.progress.start_batch(tasks.len() as u64);

        let ctx = Arc::new(WorkerContext {
            signer: Arc::clone(&self.signer),
            network: self.network.clone(),
            withdrawal_credentials: self.config.withdrawal_credentials,
            output_dir: self.config.output_dir.clone(),
        });
        run_pool(
            ctx,
            tasks,
            self.config.num_workers,
            &self.progress,
            self.config.progress_interval,
        )
        .await?;

        info!(
            "Exit generation completed for keystore {ordinal}/{}",
            self.progress.total_keystores()
        );
        Ok(())
    }
}

/// One task per iteration, targeting the indices after `start_index`
///
/// # Errors
/// Returns [`GenerationError::IndexOverflow`] if the last index exceeds `u64`.
pub fn build_tasks(
    start_index: u64,
    iterations: u64,
    pubkey: BlsPubkey,
    keystore_path: &Path,
) -> Result<Vec<ExitTask>, GenerationError> {
    let last = start_index
        .checked_add(iterations)
        .ok_or(GenerationError::IndexOverflow {
            start: start_index,
            iterations,
        })?;

    Ok((start_index + 1..=last)
        .map(|validator_index| ExitTask {
            validator_index,
            pubkey,
            keystore_path: keystore_path.to_path_buf(),
        })
        .collect())
}

/// Files in `dir` whose names start with `prefix`, sorted by name
///
/// # Errors
/// Returns an error if the directory cannot be read or nothing matches.
pub fn discover_keystores(dir: &Path, prefix: &str) -> Result<Vec<PathBuf>, GenerationError> {
    let io_err = |source| GenerationError::Io {
        path: dir.to_path_buf(),
        source,
    };

    let mut keystores = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(io_err)? {
        let entry = entry.map_err(io_err)?;
        if entry.file_type().map_err(io_err)?.is_dir() {
            continue;
        }
        if entry.file_name().to_string_lossy().starts_with(prefix) {
            keystores.push(entry.path());
        }
    }

    if keystores.is_empty() {
        return Err(GenerationError::NoKeystores {
            dir: dir.to_path_buf(),
            prefix: prefix.to_string(),
        });
    }

    keystores.sort();
    info!(count = keystores.len(), dir = %dir.display(), "Found keystores");
    Ok(keystores)
}

/// The `pubkey` field of an EIP-2335 keystore
///
/// # Errors
/// Returns an error if the file is unreadable, not JSON, or has no pubkey.
pub fn read_keystore_pubkey(path: &Path) -> Result<BlsPubkey, GenerationError> {
    #[derive(Deserialize)]
    struct Keystore {
        #[serde(default)]
        pubkey: Option<String>,
    }

    let contents = std::fs::read(path).map_err(|source| GenerationError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let keystore: Keystore =
        serde_json::from_slice(&contents).map_err(|e| GenerationError::Keystore {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

    match keystore.pubkey.as_deref() {
        None | Some("") => Err(GenerationError::MissingPubkey(path.to_path_buf())),
        Some(raw) => raw.parse().map_err(|e| GenerationError::Keystore {
            path: path.to_path_buf(),
            reason: format!("invalid pubkey: {e}"),
        }),
    }
}
