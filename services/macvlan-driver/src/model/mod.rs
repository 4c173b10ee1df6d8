//! Network and endpoint data model.
//!
//! `NetworkConfig` is the durable description of one macvlan network,
//! `Endpoint` the durable description of one container attachment. Both are
//! plain values: the registry owns the live copies, the record store owns
//! the persisted ones.

mod options;

use std::fmt;

use mvlan_networking::{truncate_id, Family, IpNet, MacAddress, NetworkError};
use serde::{Deserialize, Serialize};

pub use options::{
    ConfigError, IpamData, NetworkOptions, OptionMap, GENERIC_DATA_KEY, INTERNAL_KEY, MODE_OPT,
    PARENT_OPT,
};

/// Driver type name, used in messages and store keys.
pub const DRIVER_NAME: &str = "macvlan";

/// Prefix of the dummy link created for isolated networks.
pub const DUMMY_LINK_PREFIX: &str = "dm-";

/// Name of the dummy parent link for a network id (`dm-` + short id).
///
/// This is also the display name used when one network is reported to
/// another, e.g. in duplicate-parent errors.
pub fn dummy_link_name(network_id: &str) -> String {
    format!("{}{}", DUMMY_LINK_PREFIX, truncate_id(network_id))
}

/// Macvlan operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MacvlanMode {
    /// Endpoints on the same parent can talk to each other (default).
    #[default]
    Bridge,
    /// Endpoints are isolated from each other.
    Private,
    /// Traffic is hairpinned through the external switch.
    Vepa,
    /// A single endpoint takes over the parent.
    Passthru,
}

impl MacvlanMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bridge => "bridge",
            Self::Private => "private",
            Self::Vepa => "vepa",
            Self::Passthru => "passthru",
        }
    }

    /// Resolve a user-supplied mode. Empty means bridge.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        match s {
            "" | "bridge" => Ok(Self::Bridge),
            "private" => Ok(Self::Private),
            "vepa" => Ok(Self::Vepa),
            "passthru" => Ok(Self::Passthru),
            other => Err(ConfigError::InvalidMode(other.to_string())),
        }
    }
}

impl fmt::Display for MacvlanMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One subnet/gateway pair handed to the network by IPAM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subnet {
    #[serde(rename = "SubnetIP")]
    pub subnet: String,
    #[serde(rename = "GwIP")]
    pub gateway: String,
}

impl Subnet {
    pub fn new(subnet: impl Into<String>, gateway: impl Into<String>) -> Self {
        Self {
            subnet: subnet.into(),
            gateway: gateway.into(),
        }
    }

    /// Parsed subnet prefix.
    pub fn cidr(&self) -> Result<IpNet, NetworkError> {
        IpNet::parse(&self.subnet)
    }
}

/// Which kind of parent link the driver created for a network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlaveLinkKind {
    /// Isolated dummy link named after the network id.
    Dummy,
    /// VLAN sub-interface `<iface>.<vlan>`.
    Vlan,
}

/// Durable configuration of a macvlan network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkConfig {
    pub id: String,
    /// Parent link. Empty only before validation; isolated networks get
    /// their dummy link name here.
    pub parent: String,
    pub mode: MacvlanMode,
    pub internal: bool,
    /// True iff this driver created the parent link and owns its teardown.
    pub created_slave_link: bool,
    pub mtu: u32,
    pub ipv4_subnets: Vec<Subnet>,
    pub ipv6_subnets: Vec<Subnet>,
    /// Version assigned by the store on the last successful write. Zero
    /// means never persisted.
    pub store_version: u64,
}

impl NetworkConfig {
    /// An empty configuration for `id`.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            parent: String::new(),
            mode: MacvlanMode::default(),
            internal: false,
            created_slave_link: false,
            mtu: 0,
            ipv4_subnets: Vec::new(),
            ipv6_subnets: Vec::new(),
            store_version: 0,
        }
    }

    /// Short name used when referring to this network in messages.
    pub fn display_name(&self) -> String {
        dummy_link_name(&self.id)
    }

    /// Kind of parent link, judged by its name.
    pub fn slave_link_kind(&self) -> SlaveLinkKind {
        if self.parent == dummy_link_name(&self.id) {
            SlaveLinkKind::Dummy
        } else {
            SlaveLinkKind::Vlan
        }
    }

    /// Configured subnets of one family.
    pub fn subnets(&self, family: Family) -> &[Subnet] {
        match family {
            Family::V4 => &self.ipv4_subnets,
            Family::V6 => &self.ipv6_subnets,
        }
    }
}

/// Attachment state of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinState {
    #[default]
    Unbound,
    Joined,
    Left,
}

impl fmt::Display for JoinState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unbound => f.write_str("unbound"),
            Self::Joined => f.write_str("joined"),
            Self::Left => f.write_str("left"),
        }
    }
}

/// A container attachment to a network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub id: String,
    /// Owning network. Looked up through the registry, never held directly.
    pub network_id: String,
    pub mac: Option<MacAddress>,
    pub ipv4: Option<IpNet>,
    pub ipv6: Option<IpNet>,
    /// Kernel link bound to this endpoint at join time; empty until then.
    pub link_name: String,
    pub state: JoinState,
    pub store_version: u64,
}

impl Endpoint {
    pub fn new(id: impl Into<String>, network_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            network_id: network_id.into(),
            mac: None,
            ipv4: None,
            ipv6: None,
            link_name: String::new(),
            state: JoinState::Unbound,
            store_version: 0,
        }
    }

    /// The endpoint address of one family, if assigned.
    pub fn address(&self, family: Family) -> Option<IpNet> {
        match family {
            Family::V4 => self.ipv4,
            Family::V6 => self.ipv6,
        }
    }

    /// Short id for log lines.
    pub fn short_id(&self) -> &str {
        truncate_id(&self.id)
    }
}
