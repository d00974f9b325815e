//! # Validator Core
//!
//! Validation and bulk generation of validator lifecycle messages:
//! - deposit data checked against operator expectations and verified
//! - voluntary exit files scanned, checked for contiguous index ranges and verified
//! - signed voluntary exits generated per keystore through an external signer

pub mod beacon_client;
pub mod deposit;
pub mod ethdo;
pub mod exit_file;
pub mod exits;
pub mod generator;
pub mod network;
pub mod signing;
pub mod state;
pub mod types;
pub mod worker;

pub use beacon_client::BeaconClient;
pub use deposit::{DepositBatch, ExpectedDepositCriteria};
pub use ethdo::{EthdoSigner, ExitSigner};
pub use exit_file::{ExitFileName, ExitRecord};
pub use exits::{ExitRegistry, VerifySummary};
pub use generator::{ExitGenerator, GeneratorConfig};
pub use network::{ChainSpec, NetworkConfig};
pub use signing::{BlsVerifier, SignatureVerifier};
pub use types::*;
