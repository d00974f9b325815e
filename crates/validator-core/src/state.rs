//! Minimal Exit Verification State
//!
//! A stand-in for a beacon state that holds just enough to check a voluntary
//! exit: a slot, the genesis validators root and a validator registry. The
//! registry is seeded with placeholder validators up to the first exit's
//! index so that appended validators land on the indices their exits name.

use crate::network::ChainSpec;
use crate::signing::{
    compute_domain, compute_signing_root, hash_tree_root, SignatureVerifier, SigningError,
    VoluntaryExit,
};
use crate::types::{BlsPubkey, BlsSignature, Root};
use thiserror::Error;

/// Errors from checking an exit against the state
#[derive(Debug, Error)]
pub enum ExitCheckError {
    #[error("validator index {index} out of range (registry size {size})")]
    IndexOutOfRange { index: u64, size: u64 },

    #[error("validator is not active at epoch {epoch}")]
    NotActive { epoch: u64 },

    #[error("validator has already initiated an exit")]
    AlreadyExiting,

    #[error("exit epoch {exit_epoch} is after the current epoch {current_epoch}")]
    FutureEpoch { exit_epoch: u64, current_epoch: u64 },

    #[error("validator has not been active long enough to exit (current epoch {current_epoch}, eligible at {eligible_epoch})")]
    NotActiveLongEnough {
        current_epoch: u64,
        eligible_epoch: u64,
    },

    #[error(transparent)]
    Signature(#[from] SigningError),
}

/// A validator registry entry
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidatorEntry {
    pub pubkey: BlsPubkey,
    pub withdrawal_credentials: [u8; 32],
    pub activation_epoch: u64,
    pub exit_epoch: u64,
}

impl ValidatorEntry {
    /// Active, never-exiting validator for `pubkey`
    #[must_use]
    pub fn synthetic(pubkey: BlsPubkey, withdrawal_credentials: [u8; 32], far_future_epoch: u64) -> Self {
        Self {
            pubkey,
            withdrawal_credentials,
            activation_epoch: 0,
            exit_epoch: far_future_epoch,
        }
    }

    fn is_active_at(&self, epoch: u64) -> bool {
        self.activation_epoch <= epoch && epoch < self.exit_epoch
    }
}

/// Exit verification state for one public key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitVerificationState {
    slot: u64,
    genesis_validators_root: Root,
    placeholders: u64,
    validators: Vec<ValidatorEntry>,
}

impl ExitVerificationState {
    /// Seed a state at `exit_epoch` holding `placeholders` default validators.
    #[must_use]
    pub fn seeded(spec: &ChainSpec, exit_epoch: u64, placeholders: u64) -> Self {
        Self {
            slot: spec.slots_per_epoch.saturating_mul(exit_epoch),
            genesis_validators_root: spec.genesis_validators_root,
            placeholders,
            validators: Vec::new(),
        }
    }

    /// Current slot
    #[must_use]
    pub fn slot(&self) -> u64 {
        self.slot
    }

    /// Epoch of the current slot
    #[must_use]
    pub fn current_epoch(&self, spec: &ChainSpec) -> u64 {
        self.slot / spec.slots_per_epoch.max(1)
    }

    /// Registry size including placeholders
    #[must_use]
    pub fn validator_count(&self) -> u64 {
        self.placeholders + self.validators.len() as u64
    }

    /// Append a validator to the end of the registry
    pub fn append_validator(&mut self, validator: ValidatorEntry) {
        self.validators.push(validator);
    }

    /// Validator at `index`, placeholders included
    #[must_use]
    pub fn validator_at(&self, index: u64) -> Option<ValidatorEntry> {
        if index < self.placeholders {
            return Some(ValidatorEntry::default());
        }
        let offset = usize::try_from(index - self.placeholders).ok()?;
        self.validators.get(offset).cloned()
    }

    /// Check the exit conditions and the exit signature.
    ///
    /// # Errors
    /// Returns the first failed condition, or the signature failure.
    pub fn verify_exit(
        &self,
        spec: &ChainSpec,
        exit: &VoluntaryExit,
        signature: &BlsSignature,
        verifier: &dyn SignatureVerifier,
    ) -> Result<(), ExitCheckError> {
        let validator =
            self.validator_at(exit.validator_index)
                .ok_or(ExitCheckError::IndexOutOfRange {
                    index: exit.validator_index,
                    size: self.validator_count(),
                })?;

        let current_epoch = self.current_epoch(spec);

        if !validator.is_active_at(current_epoch) {
            return Err(ExitCheckError::NotActive {
                epoch: current_epoch,
            });
        }
        if validator.exit_epoch != spec.far_future_epoch {
            return Err(ExitCheckError::AlreadyExiting);
        }
        if current_epoch < exit.epoch {
            return Err(ExitCheckError::FutureEpoch {
                exit_epoch: exit.epoch,
                current_epoch,
            });
        }
        let eligible_epoch = validator
            .activation_epoch
            .saturating_add(spec.shard_committee_period);
        if current_epoch < eligible_epoch {
            return Err(ExitCheckError::NotActiveLongEnough {
                current_epoch,
                eligible_epoch,
            });
        }

        // Exits are pinned to the Capella fork version from Deneb onwards.
        let domain = compute_domain(
            spec.domain_voluntary_exit,
            spec.capella_fork_version,
            self.genesis_validators_root,
        )?;
        let signing_root = compute_signing_root(hash_tree_root(exit)?, domain)?;
        verifier.verify(&validator.pubkey, &signing_root, signature)?;

        Ok(())
    }
}
