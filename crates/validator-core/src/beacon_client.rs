//! Beacon API HTTP Client
//!
//! Fetches genesis, fork, spec and validator data from a beacon node and
//! assembles the [`NetworkConfig`] used for exit generation.

use crate::network::{exit_epoch, NetworkConfig};
use crate::types::{parse_hex_fixed, BlsPubkey, DomainType, HexError};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument};

/// Errors from beacon API operations
#[derive(Debug, Error)]
pub enum BeaconClientError {
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("GET {url} returned {status}: {body}")]
    UnexpectedStatus {
        url: String,
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("No validators returned by the beacon node")]
    NoValidators,
}

impl From<HexError> for BeaconClientError {
    fn from(e: HexError) -> Self {
        Self::InvalidResponse(e.to_string())
    }
}

/// `{ "data": ... }` envelope used by every beacon API response
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: T,
}

/// Genesis information
#[derive(Debug, Clone, Deserialize)]
pub struct Genesis {
    pub genesis_validators_root: String,
    pub genesis_fork_version: String,
}

/// Fork information at head
#[derive(Debug, Clone, Deserialize)]
pub struct Fork {
    pub previous_version: String,
    pub current_version: String,
    pub epoch: String,
}

/// The subset of `/eth/v1/config/spec` this crate consumes
#[derive(Debug, Clone, Deserialize)]
pub struct SpecConfig {
    #[serde(rename = "DOMAIN_VOLUNTARY_EXIT")]
    pub domain_voluntary_exit: String,
    #[serde(rename = "DOMAIN_BLS_TO_EXECUTION_CHANGE", default)]
    pub domain_bls_to_execution_change: Option<String>,
    #[serde(rename = "MIN_VALIDATOR_WITHDRAWABILITY_DELAY")]
    pub min_validator_withdrawability_delay: String,
    #[serde(rename = "CAPELLA_FORK_VERSION")]
    pub capella_fork_version: String,
    #[serde(rename = "CAPELLA_FORK_EPOCH")]
    pub capella_fork_epoch: String,
}

/// One entry of the validators endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct ValidatorData {
    pub index: String,
    #[serde(default)]
    pub status: String,
    pub validator: ValidatorRecord,
}

/// The `validator` object nested in [`ValidatorData`]
#[derive(Debug, Clone, Deserialize)]
pub struct ValidatorRecord {
    pub pubkey: BlsPubkey,
    #[serde(default)]
    pub withdrawal_credentials: String,
}

/// Client for interacting with the Beacon API
#[derive(Debug, Clone)]
pub struct BeaconClient {
    client: Client,
    base_url: String,
}

impl BeaconClient {
    /// Default request timeout; validator lists on large networks are slow to serve
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);

    /// Create a new beacon client
    ///
    /// # Arguments
    /// * `base_url` - Base URL of the beacon node (e.g., `http://localhost:5052`)
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(base_url, Client::new())
    }

    /// Create a beacon client with a preconfigured HTTP client
    #[must_use]
    pub fn with_client(base_url: impl Into<String>, client: Client) -> Self {
        let base_url: String = base_url.into();
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Base URL without a trailing slash
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn get_data<T: DeserializeOwned>(&self, path: &str) -> Result<T, BeaconClientError> {
        let url = format!("{}{path}", self.base_url);
        debug!(url = %url, "Fetching");

        let response = self.client.get(&url).send().await?;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BeaconClientError::UnexpectedStatus { url, status, body });
        }

        let envelope: Envelope<T> = response.json().await?;
        Ok(envelope.data)
    }

    /// Fetch genesis data
    ///
    /// # Errors
    /// Returns error if the request fails
    #[instrument(skip(self))]
    pub async fn get_genesis(&self) -> Result<Genesis, BeaconClientError> {
        self.get_data("/eth/v1/beacon/genesis").await
    }

    /// Fetch the fork at head
    ///
    /// # Errors
    /// Returns error if the request fails
    #[instrument(skip(self))]
    pub async fn get_fork(&self) -> Result<Fork, BeaconClientError> {
        self.get_data("/eth/v1/beacon/states/head/fork").await
    }

    /// Fetch the node's spec constants
    ///
    /// # Errors
    /// Returns error if the request fails
    #[instrument(skip(self))]
    pub async fn get_spec(&self) -> Result<SpecConfig, BeaconClientError> {
        self.get_data("/eth/v1/config/spec").await
    }

    /// Fetch all validators at a state
    ///
    /// # Arguments
    /// * `state_id` - State identifier ("head", "finalized", slot number, etc.)
    ///
    /// # Errors
    /// Returns error if the request fails
    #[instrument(skip(self))]
    pub async fn get_validators(
        &self,
        state_id: &str,
    ) -> Result<Vec<ValidatorData>, BeaconClientError> {
        self.get_data(&format!("/eth/v1/beacon/states/{state_id}/validators"))
            .await
    }

    /// Highest validator index at head. Entries with unparseable indices are ignored.
    ///
    /// # Errors
    /// Returns error if the request fails or no index could be parsed
    #[instrument(skip(self))]
    pub async fn get_latest_validator_index(&self) -> Result<u64, BeaconClientError> {
        #[derive(Deserialize)]
        struct IndexOnly {
            index: String,
        }

        let validators: Vec<IndexOnly> = self
            .get_data("/eth/v1/beacon/states/head/validators")
            .await?;

        let max_index = validators
            .iter()
            .filter_map(|v| v.index.parse::<u64>().ok())
            .max()
            .ok_or(BeaconClientError::NoValidators)?;

        debug!(index = max_index, "Latest validator index fetched");
        Ok(max_index)
    }

    /// Fetch genesis, fork and spec data and assemble a [`NetworkConfig`].
    ///
    /// # Arguments
    /// * `bls_domain_override` - Replaces `DOMAIN_BLS_TO_EXECUTION_CHANGE`,
    ///   which some clients omit from their spec endpoint
    ///
    /// # Errors
    /// Returns error if any request fails or a field is malformed
    #[instrument(skip(self))]
    pub async fn fetch_network_config(
        &self,
        bls_domain_override: Option<DomainType>,
    ) -> Result<NetworkConfig, BeaconClientError> {
        info!("Fetching beacon config");

        let genesis = self.get_genesis().await?;
        let fork = self.get_fork().await?;
        let spec = self.get_spec().await?;

        let bls_to_execution_change_domain_type = match bls_domain_override {
            Some(domain) => domain,
            None => {
                let raw = spec.domain_bls_to_execution_change.as_deref().ok_or_else(|| {
                    BeaconClientError::InvalidResponse(
                        "DOMAIN_BLS_TO_EXECUTION_CHANGE missing from spec; supply it explicitly"
                            .to_string(),
                    )
                })?;
                parse_hex_fixed(raw)?
            }
        };

        let config = NetworkConfig {
            genesis_validators_root: parse_hex_fixed(&genesis.genesis_validators_root)?,
            genesis_fork_version: parse_hex_fixed(&genesis.genesis_fork_version)?,
            exit_fork_version: parse_hex_fixed(&spec.capella_fork_version)?,
            current_fork_version: parse_hex_fixed(&fork.current_version)?,
            epoch: exit_epoch(
                parse_u64("MIN_VALIDATOR_WITHDRAWABILITY_DELAY", &spec.min_validator_withdrawability_delay)?,
                parse_u64("CAPELLA_FORK_EPOCH", &spec.capella_fork_epoch)?,
            ),
            bls_to_execution_change_domain_type,
            voluntary_exit_domain_type: parse_hex_fixed(&spec.domain_voluntary_exit)?,
        };

        info!(
            genesis_validators_root = %hex::encode(config.genesis_validators_root),
            exit_fork_version = %hex::encode(config.exit_fork_version),
            current_fork_version = %hex::encode(config.current_fork_version),
            epoch = config.epoch,
            "Beacon config fetched"
        );

        Ok(config)
    }
}

fn parse_u64(field: &str, value: &str) -> Result<u64, BeaconClientError> {
    value
        .parse()
        .map_err(|e| BeaconClientError::InvalidResponse(format!("Invalid {field}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const GVR: &str = "0x9143aa7c615a7f7115e2b6aac319c03529df8242ae705fba9df39b79c59fa8b1";

    async fn mount_config(server: &MockServer, spec: serde_json::Value) {
        Mock::given(method("GET"))
            .and(path("/eth/v1/beacon/genesis"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {
                    "genesis_time": "1695902400",
                    "genesis_validators_root": GVR,
                    "genesis_fork_version": "0x01017000"
                }
            })))
            .mount(server)
            .await;

        Mock::given(method("GET"))
            .and(path("/eth/v1/beacon/states/head/fork"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {
                    "previous_version": "0x05017000",
                    "current_version": "0x06017000",
                    "epoch": "115968"
                }
            })))
            .mount(server)
            .await;

        Mock::given(method("GET"))
            .and(path("/eth/v1/config/spec"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": spec })))
            .mount(server)
            .await;
    }

    fn holesky_spec() -> serde_json::Value {
        json!({
            "DOMAIN_VOLUNTARY_EXIT": "0x04000000",
            "DOMAIN_BLS_TO_EXECUTION_CHANGE": "0x0a000000",
            "MIN_VALIDATOR_WITHDRAWABILITY_DELAY": "256",
            "CAPELLA_FORK_VERSION": "0x04017000",
            "CAPELLA_FORK_EPOCH": "256",
            "SECONDS_PER_SLOT": "12"
        })
    }

    #[tokio::test]
    async fn test_fetch_network_config() {
        let server = MockServer::start().await;
        mount_config(&server, holesky_spec()).await;

        let client = BeaconClient::new(server.uri());
        let config = client.fetch_network_config(None).await.unwrap();

        assert_eq!(config.genesis_validators_root, parse_hex_fixed::<32>(GVR).unwrap());
        assert_eq!(config.genesis_fork_version, [0x01, 0x01, 0x70, 0x00]);
        assert_eq!(config.exit_fork_version, [0x04, 0x01, 0x70, 0x00]);
        assert_eq!(config.current_fork_version, [0x06, 0x01, 0x70, 0x00]);
        assert_eq!(config.epoch, 256);
        assert_eq!(config.voluntary_exit_domain_type, [0x04, 0, 0, 0]);
        assert_eq!(config.bls_to_execution_change_domain_type, [0x0a, 0, 0, 0]);
    }

    #[tokio::test]
    async fn test_epoch_uses_numeric_maximum() {
        let server = MockServer::start().await;
        let mut spec = holesky_spec();
        spec["CAPELLA_FORK_EPOCH"] = json!("1000");
        spec["MIN_VALIDATOR_WITHDRAWABILITY_DELAY"] = json!("256");
        mount_config(&server, spec).await;

        let config = BeaconClient::new(server.uri())
            .fetch_network_config(None)
            .await
            .unwrap();
        assert_eq!(config.epoch, 1000);
    }

    #[tokio::test]
    async fn test_missing_bls_domain_requires_override() {
        let server = MockServer::start().await;
        let mut spec = holesky_spec();
        spec.as_object_mut()
            .unwrap()
            .remove("DOMAIN_BLS_TO_EXECUTION_CHANGE");
        mount_config(&server, spec).await;

        let client = BeaconClient::new(server.uri());
        assert!(matches!(
            client.fetch_network_config(None).await,
            Err(BeaconClientError::InvalidResponse(_))
        ));

        let config = client
            .fetch_network_config(Some([0x0b, 0, 0, 0]))
            .await
            .unwrap();
        assert_eq!(config.bls_to_execution_change_domain_type, [0x0b, 0, 0, 0]);
    }

    #[tokio::test]
    async fn test_non_success_status_surfaces_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/eth/v1/beacon/genesis"))
            .respond_with(ResponseTemplate::new(503).set_body_string("node is syncing"))
            .mount(&server)
            .await;

        let err = BeaconClient::new(server.uri())
            .fetch_network_config(None)
            .await
            .unwrap_err();

        match err {
            BeaconClientError::UnexpectedStatus { status, body, .. } => {
                assert_eq!(status.as_u16(), 503);
                assert_eq!(body, "node is syncing");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_latest_validator_index_skips_garbage() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/eth/v1/beacon/states/head/validators"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [
                    { "index": "7" },
                    { "index": "1999" },
                    { "index": "not-a-number" },
                    { "index": "12" }
                ]
            })))
            .mount(&server)
            .await;

        let index = BeaconClient::new(format!("{}/", server.uri()))
            .get_latest_validator_index()
            .await
            .unwrap();
        assert_eq!(index, 1999);
    }

    #[tokio::test]
    async fn test_latest_validator_index_empty() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/eth/v1/beacon/states/head/validators"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": [] })))
            .mount(&server)
            .await;

        assert!(matches!(
            BeaconClient::new(server.uri())
                .get_latest_validator_index()
                .await,
            Err(BeaconClientError::NoValidators)
        ));
    }

    #[tokio::test]
    async fn test_get_finalized_validators() {
        let server = MockServer::start().await;
        let pubkey = format!("0x{}", "ab".repeat(48));
        Mock::given(method("GET"))
            .and(path("/eth/v1/beacon/states/finalized/validators"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{
                    "index": "42",
                    "balance": "32000000000",
                    "status": "active_ongoing",
                    "validator": {
                        "pubkey": pubkey,
                        "withdrawal_credentials": format!("0x01{}", "00".repeat(31))
                    }
                }]
            })))
            .mount(&server)
            .await;

        let validators = BeaconClient::new(server.uri())
            .get_validators("finalized")
            .await
            .unwrap();
        assert_eq!(validators.len(), 1);
        assert_eq!(validators[0].index, "42");
        assert_eq!(validators[0].status, "active_ongoing");
        assert_eq!(validators[0].validator.pubkey, BlsPubkey([0xab; 48]));
    }
}
