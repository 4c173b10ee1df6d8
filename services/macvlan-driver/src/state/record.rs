//! Persisted record encoding.
//!
//! Records are stored as flat JSON objects under `macvlan/<kind>/<id>`.
//! The store version travels beside the value, never inside it.

use mvlan_networking::{IpNet, MacAddress};
use serde::{Deserialize, Serialize};

use super::store::StoreError;
use crate::model::{Endpoint, JoinState, MacvlanMode, NetworkConfig, Subnet};

/// Key prefix of network configuration records.
pub const NETWORK_CONFIG_PREFIX: &str = "macvlan/network-config";

/// Key prefix of endpoint records.
pub const ENDPOINT_PREFIX: &str = "macvlan/endpoint";

/// Something the record store can persist.
pub trait Record: Sized + Send + Sync {
    /// Key prefix shared by all records of this kind.
    const KEY_PREFIX: &'static str;

    /// Kind name for logs and errors.
    const KIND: &'static str;

    fn id(&self) -> &str;

    fn store_version(&self) -> u64;

    fn set_store_version(&mut self, version: u64);

    fn encode(&self) -> Result<String, StoreError>;

    fn decode(value: &str) -> Result<Self, StoreError>;

    /// Full store key.
    fn key(&self) -> String {
        format!("{}/{}", Self::KEY_PREFIX, self.id())
    }

    /// Prefix to list every record of this kind.
    fn list_prefix() -> String {
        format!("{}/", Self::KEY_PREFIX)
    }
}

// ============================================================================
// Network configuration
// ============================================================================

#[derive(Serialize, Deserialize)]
struct NetworkConfigWire {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Mtu", default)]
    mtu: u32,
    #[serde(rename = "Parent", default)]
    parent: String,
    #[serde(rename = "MacvlanMode", default)]
    mode: String,
    #[serde(rename = "Internal", default)]
    internal: bool,
    #[serde(rename = "CreatedSubIface", default)]
    created_slave_link: bool,
    #[serde(rename = "Ipv4Subnets", default, skip_serializing_if = "Option::is_none")]
    ipv4_subnets: Option<String>,
    #[serde(rename = "Ipv6Subnets", default, skip_serializing_if = "Option::is_none")]
    ipv6_subnets: Option<String>,
}

/// Subnet lists are stored as embedded JSON strings; empty lists are omitted.
fn encode_subnets(subnets: &[Subnet]) -> Result<Option<String>, StoreError> {
    if subnets.is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::to_string(subnets)?))
}

fn decode_subnets(raw: Option<&str>) -> Result<Vec<Subnet>, StoreError> {
    match raw {
        None | Some("") => Ok(Vec::new()),
        Some(s) => Ok(serde_json::from_str(s)?),
    }
}

impl Record for NetworkConfig {
    const KEY_PREFIX: &'static str = NETWORK_CONFIG_PREFIX;
    const KIND: &'static str = "network";

    fn id(&self) -> &str {
        &self.id
    }

    fn store_version(&self) -> u64 {
        self.store_version
    }

    fn set_store_version(&mut self, version: u64) {
        self.store_version = version;
    }

    fn encode(&self) -> Result<String, StoreError> {
        let wire = NetworkConfigWire {
            id: self.id.clone(),
            mtu: self.mtu,
            parent: self.parent.clone(),
            mode: self.mode.as_str().to_string(),
            internal: self.internal,
            created_slave_link: self.created_slave_link,
            ipv4_subnets: encode_subnets(&self.ipv4_subnets)?,
            ipv6_subnets: encode_subnets(&self.ipv6_subnets)?,
        };
        Ok(serde_json::to_string(&wire)?)
    }

    fn decode(value: &str) -> Result<Self, StoreError> {
        let wire: NetworkConfigWire = serde_json::from_str(value)?;
        let mode = MacvlanMode::parse(&wire.mode).map_err(|e| StoreError::Codec(e.to_string()))?;

        Ok(NetworkConfig {
            id: wire.id,
            parent: wire.parent,
            mode,
            internal: wire.internal,
            created_slave_link: wire.created_slave_link,
            mtu: wire.mtu,
            ipv4_subnets: decode_subnets(wire.ipv4_subnets.as_deref())?,
            ipv6_subnets: decode_subnets(wire.ipv6_subnets.as_deref())?,
            store_version: 0,
        })
    }
}

// ============================================================================
// Endpoint
// ============================================================================

#[derive(Serialize, Deserialize)]
struct EndpointWire {
    id: String,
    nid: String,
    #[serde(rename = "SrcName", default)]
    src_name: String,
    #[serde(rename = "MacAddress", default, skip_serializing_if = "Option::is_none")]
    mac: Option<String>,
    #[serde(rename = "Addr", default, skip_serializing_if = "Option::is_none")]
    addr: Option<String>,
    #[serde(rename = "Addrv6", default, skip_serializing_if = "Option::is_none")]
    addr_v6: Option<String>,
    #[serde(rename = "State", default, skip_serializing_if = "Option::is_none")]
    state: Option<JoinState>,
}

fn decode_field<T>(field: &str, raw: Option<String>) -> Result<Option<T>, StoreError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.filter(|s| !s.is_empty())
        .map(|s| {
            s.parse()
                .map_err(|e: T::Err| StoreError::Codec(format!("{}: {}", field, e)))
        })
        .transpose()
}

impl Record for Endpoint {
    const KEY_PREFIX: &'static str = ENDPOINT_PREFIX;
    const KIND: &'static str = "endpoint";

    fn id(&self) -> &str {
        &self.id
    }

    fn store_version(&self) -> u64 {
        self.store_version
    }

    fn set_store_version(&mut self, version: u64) {
        self.store_version = version;
    }

    fn encode(&self) -> Result<String, StoreError> {
        let wire = EndpointWire {
            id: self.id.clone(),
            nid: self.network_id.clone(),
            src_name: self.link_name.clone(),
            mac: self.mac.map(|m| m.to_string()),
            addr: self.ipv4.map(|a| a.to_string()),
            addr_v6: self.ipv6.map(|a| a.to_string()),
            state: Some(self.state),
        };
        Ok(serde_json::to_string(&wire)?)
    }

    fn decode(value: &str) -> Result<Self, StoreError> {
        let wire: EndpointWire = serde_json::from_str(value)?;

        // records written without a state are joined iff they carry a link
        let state = wire.state.unwrap_or(if wire.src_name.is_empty() {
            JoinState::Unbound
        } else {
            JoinState::Joined
        });

        Ok(Endpoint {
            id: wire.id,
            network_id: wire.nid,
            mac: decode_field::<MacAddress>("MacAddress", wire.mac)?,
            ipv4: decode_field::<IpNet>("Addr", wire.addr)?,
            ipv6: decode_field::<IpNet>("Addrv6", wire.addr_v6)?,
            link_name: wire.src_name,
            state,
            store_version: 0,
        })
    }
}
