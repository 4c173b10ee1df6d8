//! Driver option decoding and network validation.
//!
//! Requests carry a loosely typed option bag. It is decoded once into
//! [`NetworkOptions`]; everything after that works on typed values.

use mvlan_networking::{is_valid_ifname, parse_gateway, Family, IpNet};
use serde_json::Value;
use thiserror::Error;

use super::{dummy_link_name, MacvlanMode, NetworkConfig, Subnet};

/// Envelope key under which the engine nests driver options (`-o k=v`).
pub const GENERIC_DATA_KEY: &str = "com.docker.network.generic";

/// Key set when the network is created with `--internal`.
pub const INTERNAL_KEY: &str = "com.docker.network.internal";

/// Parent interface option.
pub const PARENT_OPT: &str = "parent";

/// Macvlan mode option.
pub const MODE_OPT: &str = "macvlan_mode";

/// Raw option bag as received from the caller.
pub type OptionMap = serde_json::Map<String, Value>;

/// Errors from option decoding and network validation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid network id")]
    InvalidNetworkId,

    #[error("option '{key}' must be {expected}")]
    InvalidOptionType { key: String, expected: &'static str },

    #[error("requested macvlan mode '{0}' is not valid, 'bridge' mode is the macvlan driver default")]
    InvalidMode(String),

    #[error("loopback interface is not a valid macvlan parent link")]
    LoopbackParent,

    #[error("invalid parent interface name '{0}'")]
    InvalidParent(String),

    #[error("ipv4 pool is empty")]
    EmptyIpv4Pool,

    #[error("invalid {family} pool '{pool}': {reason}")]
    InvalidPool {
        family: Family,
        pool: String,
        reason: String,
    },

    #[error("invalid {family} gateway '{gateway}'")]
    InvalidGateway { family: Family, gateway: String },
}

/// One IPAM pool as handed over by the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IpamData {
    pub pool: String,
    pub gateway: String,
}

impl IpamData {
    pub fn new(pool: impl Into<String>, gateway: impl Into<String>) -> Self {
        Self {
            pool: pool.into(),
            gateway: gateway.into(),
        }
    }
}

/// Typed view of the driver options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkOptions {
    pub parent: Option<String>,
    pub mode: Option<String>,
    pub internal: bool,
}

impl NetworkOptions {
    /// Decode the option bag.
    ///
    /// Recognized keys may appear at the top level or inside the generic
    /// data envelope; the envelope wins. Unknown keys are ignored, known
    /// keys with a non-string value are rejected.
    pub fn decode(options: &OptionMap) -> Result<Self, ConfigError> {
        let mut decoded = Self::default();
        decoded.apply_labels(options)?;

        match options.get(GENERIC_DATA_KEY) {
            None | Some(Value::Null) => {}
            Some(Value::Object(generic)) => decoded.apply_labels(generic)?,
            Some(_) => {
                return Err(ConfigError::InvalidOptionType {
                    key: GENERIC_DATA_KEY.to_string(),
                    expected: "an object",
                })
            }
        }

        // `--internal` and an empty parent are the same thing.
        match options.get(INTERNAL_KEY) {
            None | Some(Value::Null) | Some(Value::Bool(false)) => {}
            Some(_) => {
                decoded.internal = true;
                decoded.parent = None;
            }
        }

        Ok(decoded)
    }

    fn apply_labels(&mut self, labels: &OptionMap) -> Result<(), ConfigError> {
        for (label, value) in labels {
            let slot = match label.as_str() {
                PARENT_OPT => &mut self.parent,
                MODE_OPT => &mut self.mode,
                _ => continue,
            };
            match value {
                Value::String(s) => *slot = Some(s.clone()),
                Value::Null => {}
                _ => {
                    return Err(ConfigError::InvalidOptionType {
                        key: label.clone(),
                        expected: "a string",
                    })
                }
            }
        }
        Ok(())
    }
}

impl NetworkConfig {
    /// Build and validate a configuration from a raw option bag.
    ///
    /// The result has a resolved mode and a non-empty parent; subnets are
    /// added separately with [`NetworkConfig::process_ipam`].
    pub fn parse(id: &str, options: &OptionMap) -> Result<Self, ConfigError> {
        if id.is_empty() {
            return Err(ConfigError::InvalidNetworkId);
        }

        let decoded = NetworkOptions::decode(options)?;

        let mut config = NetworkConfig::new(id);
        config.internal = decoded.internal;
        config.parent = decoded.parent.unwrap_or_default();
        config.validate_mode(decoded.mode.as_deref().unwrap_or(""))?;
        config.validate_parent()?;

        Ok(config)
    }

    /// Resolve the requested mode; empty means bridge.
    pub fn validate_mode(&mut self, requested: &str) -> Result<(), ConfigError> {
        self.mode = MacvlanMode::parse(requested)?;
        Ok(())
    }

    /// Check the parent link name. An empty parent makes the network
    /// internal, backed by a dummy link named after the network id.
    pub fn validate_parent(&mut self) -> Result<(), ConfigError> {
        if self.parent == "lo" {
            return Err(ConfigError::LoopbackParent);
        }

        if self.parent.is_empty() {
            self.parent = dummy_link_name(&self.id);
            self.internal = true;
            return Ok(());
        }

        if !is_valid_ifname(&self.parent) {
            return Err(ConfigError::InvalidParent(self.parent.clone()));
        }

        Ok(())
    }

    /// Append one subnet per pool, preserving order.
    ///
    /// A missing IPv4 pool, or one that is the all-zero default route, means
    /// there is no usable address space.
    pub fn process_ipam(
        &mut self,
        ipv4_pools: &[IpamData],
        ipv6_pools: &[IpamData],
    ) -> Result<(), ConfigError> {
        let Some(first) = ipv4_pools.first() else {
            return Err(ConfigError::EmptyIpv4Pool);
        };
        if let Ok(net) = IpNet::parse(&first.pool) {
            if net.is_unspecified() {
                return Err(ConfigError::EmptyIpv4Pool);
            }
        }

        let v4 = checked_subnets(Family::V4, ipv4_pools)?;
        let v6 = checked_subnets(Family::V6, ipv6_pools)?;
        self.ipv4_subnets.extend(v4);
        self.ipv6_subnets.extend(v6);

        Ok(())
    }
}

fn checked_subnets(family: Family, pools: &[IpamData]) -> Result<Vec<Subnet>, ConfigError> {
    pools
        .iter()
        .map(|data| {
            let net = IpNet::parse(&data.pool).map_err(|e| ConfigError::InvalidPool {
                family,
                pool: data.pool.clone(),
                reason: e.to_string(),
            })?;
            if net.family() != family {
                return Err(ConfigError::InvalidPool {
                    family,
                    pool: data.pool.clone(),
                    reason: format!("not an {} prefix", family),
                });
            }
            if !data.gateway.is_empty() && parse_gateway(&data.gateway).is_err() {
                return Err(ConfigError::InvalidGateway {
                    family,
                    gateway: data.gateway.clone(),
                });
            }
            Ok(Subnet::new(data.pool.clone(), data.gateway.clone()))
        })
        .collect()
}
