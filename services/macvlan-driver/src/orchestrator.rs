//! Orchestrator fallback.
//!
//! In a cluster the manager allocates networks and only some nodes see
//! `CreateNetwork`. A node that receives an endpoint request for a network
//! it never created asks the orchestrator for the network definition and
//! registers it on the fly.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use mvlan_networking::{Family, IpNet};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::config::Config;
use crate::model::{ConfigError, NetworkConfig, OptionMap, Subnet, INTERNAL_KEY};

/// Errors from orchestrator lookups.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("network {0} not found in orchestrator")]
    NotFound(String),

    #[error("orchestrator request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("orchestrator returned {status}: {body}")]
    Status { status: u16, body: String },
}

/// Network definition as reported by the orchestrator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestratorNetwork {
    #[serde(rename = "Id", default)]
    pub id: String,
    #[serde(rename = "Name", default)]
    pub name: String,
    #[serde(rename = "Driver", default)]
    pub driver: String,
    #[serde(rename = "Options", default)]
    pub options: BTreeMap<String, String>,
    #[serde(rename = "Internal", default)]
    pub internal: bool,
    #[serde(rename = "IPAM", default)]
    pub ipam: OrchestratorIpam,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestratorIpam {
    #[serde(rename = "Driver", default)]
    pub driver: String,
    #[serde(rename = "Config", default)]
    pub config: Vec<OrchestratorIpamConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestratorIpamConfig {
    #[serde(rename = "Subnet", default)]
    pub subnet: String,
    #[serde(rename = "Gateway", default)]
    pub gateway: String,
}

/// Source of network definitions for networks this node did not create.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    async fn network_info(&self, network_id: &str) -> Result<OrchestratorNetwork, OrchestratorError>;
}

/// Orchestrator client speaking the engine's network inspect API.
pub struct SwarmClient {
    client: reqwest::Client,
    base_url: String,
}

impl SwarmClient {
    /// Create a client from driver configuration.
    pub fn new(config: &Config) -> Result<Self, OrchestratorError> {
        Self::with_base_url(&config.orchestrator_url, config.orchestrator_timeout)
    }

    pub fn with_base_url(base_url: &str, timeout: Duration) -> Result<Self, OrchestratorError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl Orchestrator for SwarmClient {
    async fn network_info(&self, network_id: &str) -> Result<OrchestratorNetwork, OrchestratorError> {
        let url = format!("{}/networks/{}", self.base_url, network_id);
        debug!(url = %url, "Fetching network from orchestrator");

        let response = self.client.get(&url).send().await?;
        let status = response.status();

        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(OrchestratorError::NotFound(network_id.to_string()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %body, "Orchestrator network lookup failed");
            return Err(OrchestratorError::Status {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response.json().await?)
    }
}

/// Fixed set of networks; useful offline and in tests.
#[derive(Debug, Default)]
pub struct StaticOrchestrator {
    networks: Mutex<HashMap<String, OrchestratorNetwork>>,
}

impl StaticOrchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, network: OrchestratorNetwork) {
        self.networks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(network.id.clone(), network);
    }
}

#[async_trait]
impl Orchestrator for StaticOrchestrator {
    async fn network_info(&self, network_id: &str) -> Result<OrchestratorNetwork, OrchestratorError> {
        self.networks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(network_id)
            .cloned()
            .ok_or_else(|| OrchestratorError::NotFound(network_id.to_string()))
    }
}

/// Build a network configuration from an orchestrator definition.
///
/// Applies the same option validation as a local create. Each IPAM entry is
/// sorted into the IPv4 or IPv6 list by the family of its subnet.
pub fn config_from_orchestrator(
    network_id: &str,
    network: &OrchestratorNetwork,
) -> Result<NetworkConfig, ConfigError> {
    let mut options: OptionMap = network
        .options
        .iter()
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect();
    if network.internal {
        options.insert(INTERNAL_KEY.to_string(), Value::Bool(true));
    }

    let mut config = NetworkConfig::parse(network_id, &options)?;

    for entry in &network.ipam.config {
        let net = IpNet::parse(&entry.subnet).map_err(|e| ConfigError::InvalidPool {
            family: if entry.subnet.contains(':') {
                Family::V6
            } else {
                Family::V4
            },
            pool: entry.subnet.clone(),
            reason: e.to_string(),
        })?;
        let subnet = Subnet::new(entry.subnet.clone(), entry.gateway.clone());
        match net.family() {
            Family::V4 => config.ipv4_subnets.push(subnet),
            Family::V6 => config.ipv6_subnets.push(subnet),
        }
    }

    Ok(config)
}

/// Look a network up in the orchestrator.
///
/// Any failure, remote or local, is reported as "not found".
pub async fn lookup(orchestrator: &dyn Orchestrator, network_id: &str) -> Option<NetworkConfig> {
    let network = match orchestrator.network_info(network_id).await {
        Ok(network) => network,
        Err(OrchestratorError::NotFound(_)) => {
            debug!(network_id = %network_id, "Network unknown to orchestrator");
            return None;
        }
        Err(e) => {
            warn!(network_id = %network_id, error = %e, "Orchestrator lookup failed");
            return None;
        }
    };

    match config_from_orchestrator(network_id, &network) {
        Ok(config) => Some(config),
        Err(e) => {
            warn!(network_id = %network_id, error = %e, "Orchestrator network definition rejected");
            None
        }
    }
}
