//! Network Configuration
//!
//! Built-in consensus parameters for the supported networks and the resolved
//! [`NetworkConfig`] that exit generation hands to the signing tool.

use crate::types::{const_hex, hex_fixed, quoted_u64, DomainType, Root, Version};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// `DOMAIN_DEPOSIT`, identical on every network
pub const DOMAIN_DEPOSIT: DomainType = const_hex("03000000");

/// `DOMAIN_VOLUNTARY_EXIT`
pub const DOMAIN_VOLUNTARY_EXIT: DomainType = const_hex("04000000");

/// `DOMAIN_BLS_TO_EXECUTION_CHANGE`
pub const DOMAIN_BLS_TO_EXECUTION_CHANGE: DomainType = const_hex("0a000000");

/// `FAR_FUTURE_EPOCH`
pub const FAR_FUTURE_EPOCH: u64 = u64::MAX;

/// Errors from network selection
#[derive(Debug, Error)]
pub enum NetworkConfigError {
    #[error("unknown network: {0}")]
    UnknownNetwork(String),
}

/// Static consensus parameters for a named network
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainSpec {
    /// Network name as used on the command line and in deposit data
    pub name: &'static str,
    /// Genesis validators root
    pub genesis_validators_root: Root,
    /// Genesis fork version
    pub genesis_fork_version: Version,
    /// Capella fork version (voluntary exits are pinned to it since Deneb)
    pub capella_fork_version: Version,
    /// Capella fork epoch
    pub capella_fork_epoch: u64,
    /// Slots per epoch
    pub slots_per_epoch: u64,
    /// Seconds per slot
    pub seconds_per_slot: u64,
    /// Epochs a validator must be active before it may exit
    pub shard_committee_period: u64,
    /// `MIN_VALIDATOR_WITHDRAWABILITY_DELAY`
    pub min_validator_withdrawability_delay: u64,
    /// Sentinel epoch for "never"
    pub far_future_epoch: u64,
    /// Deposit domain type
    pub domain_deposit: DomainType,
    /// Voluntary exit domain type
    pub domain_voluntary_exit: DomainType,
    /// BLS-to-execution-change domain type
    pub domain_bls_to_execution_change: DomainType,
}

const MAINNET: ChainSpec = ChainSpec {
    name: "mainnet",
    genesis_validators_root: const_hex(
        "4b363db94e286120d76eb905340fdd4e54bfe9f06bf33ff6cf5ad27f511bfe95",
    ),
    genesis_fork_version: const_hex("00000000"),
    capella_fork_version: const_hex("03000000"),
    capella_fork_epoch: 194_048,
    slots_per_epoch: 32,
    seconds_per_slot: 12,
    shard_committee_period: 256,
    min_validator_withdrawability_delay: 256,
    far_future_epoch: FAR_FUTURE_EPOCH,
    domain_deposit: DOMAIN_DEPOSIT,
    domain_voluntary_exit: DOMAIN_VOLUNTARY_EXIT,
    domain_bls_to_execution_change: DOMAIN_BLS_TO_EXECUTION_CHANGE,
};

const HOLESKY: ChainSpec = ChainSpec {
    name: "holesky",
    genesis_validators_root: const_hex(
        "9143aa7c615a7f7115e2b6aac319c03529df8242ae705fba9df39b79c59fa8b1",
    ),
    genesis_fork_version: const_hex("01017000"),
    capella_fork_version: const_hex("04017000"),
    capella_fork_epoch: 256,
    ..MAINNET
};

const HOODI: ChainSpec = ChainSpec {
    name: "hoodi",
    genesis_validators_root: const_hex(
        "212f13fc4df078b6cb7db228f1c8307566dcecf900867401a92023d7ba99cb5f",
    ),
    genesis_fork_version: const_hex("10000910"),
    capella_fork_version: const_hex("40000910"),
    capella_fork_epoch: 0,
    ..MAINNET
};

impl ChainSpec {
    /// Select the built-in parameters for `network`.
    ///
    /// # Errors
    /// Returns [`NetworkConfigError::UnknownNetwork`] for unsupported names.
    pub fn for_network(network: &str) -> Result<&'static ChainSpec, NetworkConfigError> {
        match network {
            "mainnet" => Ok(&MAINNET),
            "holesky" => Ok(&HOLESKY),
            "hoodi" => Ok(&HOODI),
            other => Err(NetworkConfigError::UnknownNetwork(other.to_string())),
        }
    }

    /// Names accepted by [`ChainSpec::for_network`]
    #[must_use]
    pub fn supported_networks() -> [&'static str; 3] {
        [MAINNET.name, HOLESKY.name, HOODI.name]
    }

    /// Epoch stamped on generated exits.
    ///
    /// This is `max(MIN_VALIDATOR_WITHDRAWABILITY_DELAY, CAPELLA_FORK_EPOCH)`,
    /// the same rule applied to configs fetched from a beacon node.
    #[must_use]
    pub fn exit_epoch(&self) -> u64 {
        exit_epoch(self.min_validator_withdrawability_delay, self.capella_fork_epoch)
    }

    /// Render the static parameters as a [`NetworkConfig`].
    #[must_use]
    pub fn network_config(&self) -> NetworkConfig {
        NetworkConfig {
            genesis_validators_root: self.genesis_validators_root,
            genesis_fork_version: self.genesis_fork_version,
            exit_fork_version: self.capella_fork_version,
            current_fork_version: self.capella_fork_version,
            epoch: self.exit_epoch(),
            bls_to_execution_change_domain_type: self.domain_bls_to_execution_change,
            voluntary_exit_domain_type: self.domain_voluntary_exit,
        }
    }
}

/// `max(withdrawal delay, capella fork epoch)`.
///
/// The two inputs are unrelated config fields; the maximum is kept as-is.
#[must_use]
pub fn exit_epoch(min_validator_withdrawability_delay: u64, capella_fork_epoch: u64) -> u64 {
    min_validator_withdrawability_delay.max(capella_fork_epoch)
}

/// Resolved network parameters for one run.
///
/// Serialized field names match the offline preparation file consumed by the
/// signing tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Genesis validators root
    #[serde(with = "hex_fixed")]
    pub genesis_validators_root: Root,
    /// Genesis fork version
    #[serde(with = "hex_fixed")]
    pub genesis_fork_version: Version,
    /// Fork version exits are signed under (the Capella version)
    #[serde(with = "hex_fixed")]
    pub exit_fork_version: Version,
    /// Fork version currently active at head
    #[serde(with = "hex_fixed")]
    pub current_fork_version: Version,
    /// Epoch stamped on generated exits
    #[serde(with = "quoted_u64")]
    pub epoch: u64,
    /// BLS-to-execution-change domain type
    #[serde(with = "hex_fixed")]
    pub bls_to_execution_change_domain_type: DomainType,
    /// Voluntary exit domain type
    #[serde(with = "hex_fixed")]
    pub voluntary_exit_domain_type: DomainType,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_networks_resolve() {
        for name in ChainSpec::supported_networks() {
            let spec = ChainSpec::for_network(name).unwrap();
            assert_eq!(spec.name, name);
            assert_eq!(spec.domain_voluntary_exit, [0x04, 0, 0, 0]);
        }
    }

    #[test]
    fn test_unknown_network() {
        let err = ChainSpec::for_network("goerli").unwrap_err();
        assert_eq!(err.to_string(), "unknown network: goerli");
    }

    #[test]
    fn test_exit_epoch_takes_maximum() {
        assert_eq!(exit_epoch(256, 194_048), 194_048);
        assert_eq!(exit_epoch(256, 0), 256);
        assert_eq!(ChainSpec::for_network("hoodi").unwrap().exit_epoch(), 256);
        assert_eq!(
            ChainSpec::for_network("mainnet").unwrap().exit_epoch(),
            194_048
        );
    }

    #[test]
    fn test_network_config_json_layout() {
        let config = ChainSpec::for_network("holesky").unwrap().network_config();
        let json = serde_json::to_value(&config).unwrap();

        assert_eq!(json["genesis_fork_version"], "0x01017000");
        assert_eq!(json["exit_fork_version"], "0x04017000");
        assert_eq!(json["epoch"], "256");
        assert_eq!(json["voluntary_exit_domain_type"], "0x04000000");
        assert_eq!(json["bls_to_execution_change_domain_type"], "0x0a000000");

        let decoded: NetworkConfig = serde_json::from_value(json).unwrap();
        assert_eq!(decoded, config);
    }
}
