//! Signing Domains and Signature Verification
//!
//! SSZ containers and the domain / signing-root math shared by deposits and
//! voluntary exits, plus the [`SignatureVerifier`] capability that checks a
//! BLS signature over a signing root.

use crate::types::{BlsPubkey, BlsSignature, Domain, DomainType, Root, Version};
use blst::min_pk::{PublicKey, Signature};
use blst::BLST_ERROR;
use ssz_rs::prelude::*;
use thiserror::Error;

/// BLS domain separation tag for proof-of-possession signatures
pub const BLS_DST: &[u8] = b"BLS_SIG_BLS12381G2_XMD:SHA-256_SSWU_RO_POP_";

/// Errors from root computation and signature checks
#[derive(Debug, Error)]
pub enum SigningError {
    #[error("merkleization failed: {0}")]
    Merkleization(String),

    #[error("invalid public key: {0}")]
    InvalidPubkey(String),

    #[error("invalid signature encoding: {0}")]
    InvalidSignature(String),

    #[error("signature did not verify")]
    SignatureMismatch,
}

/// `ForkData` container
#[derive(Debug, Clone, Default, PartialEq, Eq, SimpleSerialize)]
pub struct ForkData {
    pub current_version: [u8; 4],
    pub genesis_validators_root: [u8; 32],
}

/// `SigningData` container
#[derive(Debug, Clone, Default, PartialEq, Eq, SimpleSerialize)]
pub struct SigningData {
    pub object_root: [u8; 32],
    pub domain: [u8; 32],
}

/// `DepositMessage` container (what a deposit signature commits to)
#[derive(Debug, Clone, Default, PartialEq, Eq, SimpleSerialize)]
pub struct DepositMessage {
    pub pubkey: Vector<u8, 48>,
    pub withdrawal_credentials: [u8; 32],
    pub amount: u64,
}

/// `DepositData` container (message plus signature)
#[derive(Debug, Clone, Default, PartialEq, Eq, SimpleSerialize)]
pub struct DepositData {
    pub pubkey: Vector<u8, 48>,
    pub withdrawal_credentials: [u8; 32],
    pub amount: u64,
    pub signature: Vector<u8, 96>,
}

/// `VoluntaryExit` container
#[derive(Debug, Clone, Default, PartialEq, Eq, SimpleSerialize)]
pub struct VoluntaryExit {
    pub epoch: u64,
    pub validator_index: u64,
}

impl DepositMessage {
    /// Build the message for a deposit.
    ///
    /// # Errors
    /// Fails only if the key cannot be packed into an SSZ vector.
    pub fn new(
        pubkey: &BlsPubkey,
        withdrawal_credentials: [u8; 32],
        amount: u64,
    ) -> Result<Self, SigningError> {
        Ok(Self {
            pubkey: byte_vector(pubkey.as_bytes())?,
            withdrawal_credentials,
            amount,
        })
    }
}

impl DepositData {
    /// Build the full deposit data container.
    ///
    /// # Errors
    /// Fails only if the key or signature cannot be packed into SSZ vectors.
    pub fn new(
        pubkey: &BlsPubkey,
        withdrawal_credentials: [u8; 32],
        amount: u64,
        signature: &BlsSignature,
    ) -> Result<Self, SigningError> {
        Ok(Self {
            pubkey: byte_vector(pubkey.as_bytes())?,
            withdrawal_credentials,
            amount,
            signature: byte_vector(signature.as_bytes())?,
        })
    }
}

fn byte_vector<const N: usize>(bytes: &[u8]) -> Result<Vector<u8, N>, SigningError> {
    Vector::<u8, N>::try_from(bytes.to_vec())
        .map_err(|e| SigningError::Merkleization(format!("{e:?}")))
}

/// Hash tree root of any SSZ value.
///
/// # Errors
/// Returns an error if merkleization fails.
pub fn hash_tree_root<T: HashTreeRoot>(value: &T) -> Result<Root, SigningError> {
    let node = value
        .hash_tree_root()
        .map_err(|e| SigningError::Merkleization(format!("{e:?}")))?;
    node.as_slice()
        .try_into()
        .map_err(|_| SigningError::Merkleization("root is not 32 bytes".to_string()))
}

/// `compute_fork_data_root(current_version, genesis_validators_root)`
///
/// # Errors
/// Returns an error if merkleization fails.
pub fn compute_fork_data_root(
    current_version: Version,
    genesis_validators_root: Root,
) -> Result<Root, SigningError> {
    hash_tree_root(&ForkData {
        current_version,
        genesis_validators_root,
    })
}

/// `compute_domain(domain_type, fork_version, genesis_validators_root)`:
/// the domain type followed by the first 28 bytes of the fork data root.
///
/// # Errors
/// Returns an error if merkleization fails.
pub fn compute_domain(
    domain_type: DomainType,
    fork_version: Version,
    genesis_validators_root: Root,
) -> Result<Domain, SigningError> {
    let fork_data_root = compute_fork_data_root(fork_version, genesis_validators_root)?;
    let mut domain = [0u8; 32];
    domain[..4].copy_from_slice(&domain_type);
    domain[4..].copy_from_slice(&fork_data_root[..28]);
    Ok(domain)
}

/// `compute_signing_root(object_root, domain)`
///
/// # Errors
/// Returns an error if merkleization fails.
pub fn compute_signing_root(object_root: Root, domain: Domain) -> Result<Root, SigningError> {
    hash_tree_root(&SigningData {
        object_root,
        domain,
    })
}

/// Capability that confirms a BLS signature over a signing root.
pub trait SignatureVerifier: Send + Sync {
    /// Verify `signature` by `pubkey` over `signing_root`.
    ///
    /// # Errors
    /// Returns an error if either encoding is invalid or the check fails.
    fn verify(
        &self,
        pubkey: &BlsPubkey,
        signing_root: &Root,
        signature: &BlsSignature,
    ) -> Result<(), SigningError>;
}

/// [`SignatureVerifier`] backed by `blst` (min-pk, proof-of-possession DST)
#[derive(Debug, Clone, Copy, Default)]
pub struct BlsVerifier;

impl SignatureVerifier for BlsVerifier {
    fn verify(
        &self,
        pubkey: &BlsPubkey,
        signing_root: &Root,
        signature: &BlsSignature,
    ) -> Result<(), SigningError> {
        let pk = PublicKey::from_bytes(pubkey.as_bytes())
            .map_err(|e| SigningError::InvalidPubkey(format!("{e:?}")))?;
        let sig = Signature::from_bytes(signature.as_bytes())
            .map_err(|e| SigningError::InvalidSignature(format!("{e:?}")))?;

        match sig.verify(true, signing_root, BLS_DST, &[], &pk, true) {
            BLST_ERROR::BLST_SUCCESS => Ok(()),
            _ => Err(SigningError::SignatureMismatch),
        }
    }
}
