//! Request and response types of driver operations.
//!
//! Field names follow the engine's remote network driver protocol so the
//! types can be carried over JSON unchanged.

use serde::{Deserialize, Serialize};

use crate::model::{IpamData, OptionMap};

/// IPAM pool data as carried on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct IpamDataWire {
    #[serde(default)]
    pub pool: String,
    #[serde(default)]
    pub gateway: String,
}

impl From<&IpamDataWire> for IpamData {
    fn from(data: &IpamDataWire) -> Self {
        IpamData::new(data.pool.clone(), data.gateway.clone())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CreateNetworkRequest {
    #[serde(rename = "NetworkID")]
    pub network_id: String,
    #[serde(default)]
    pub options: OptionMap,
    #[serde(rename = "IPv4Data", default)]
    pub ipv4_data: Vec<IpamDataWire>,
    #[serde(rename = "IPv6Data", default)]
    pub ipv6_data: Vec<IpamDataWire>,
}

impl CreateNetworkRequest {
    pub fn ipv4_pools(&self) -> Vec<IpamData> {
        self.ipv4_data.iter().map(IpamData::from).collect()
    }

    pub fn ipv6_pools(&self) -> Vec<IpamData> {
        self.ipv6_data.iter().map(IpamData::from).collect()
    }
}

/// Allocation carries the same payload as creation.
pub type AllocateNetworkRequest = CreateNetworkRequest;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AllocateNetworkResponse {
    /// Options to hand back to every node that creates the network.
    #[serde(default)]
    pub options: OptionMap,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkRequest {
    #[serde(rename = "NetworkID")]
    pub network_id: String,
}

pub type DeleteNetworkRequest = NetworkRequest;
pub type FreeNetworkRequest = NetworkRequest;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EndpointInterface {
    #[serde(default)]
    pub address: String,
    #[serde(rename = "AddressIPv6", default)]
    pub address_ipv6: String,
    #[serde(default)]
    pub mac_address: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CreateEndpointRequest {
    #[serde(rename = "NetworkID")]
    pub network_id: String,
    #[serde(rename = "EndpointID")]
    pub endpoint_id: String,
    #[serde(default)]
    pub interface: EndpointInterface,
    #[serde(default)]
    pub options: OptionMap,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CreateEndpointResponse {
    pub interface: EndpointInterface,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointRequest {
    #[serde(rename = "NetworkID")]
    pub network_id: String,
    #[serde(rename = "EndpointID")]
    pub endpoint_id: String,
}

pub type DeleteEndpointRequest = EndpointRequest;
pub type EndpointInfoRequest = EndpointRequest;
pub type LeaveRequest = EndpointRequest;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EndpointInfoResponse {
    #[serde(rename = "NetworkID")]
    pub network_id: String,
    #[serde(rename = "EndpointID")]
    pub endpoint_id: String,
    pub mac_address: String,
    pub address: String,
    #[serde(rename = "AddressIPv6")]
    pub address_ipv6: String,
    pub link_name: String,
    pub state: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct JoinRequest {
    #[serde(rename = "NetworkID")]
    pub network_id: String,
    #[serde(rename = "EndpointID")]
    pub endpoint_id: String,
    #[serde(default)]
    pub sandbox_key: String,
    #[serde(default)]
    pub options: OptionMap,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InterfaceName {
    /// Host-side link the engine moves into the container.
    pub src_name: String,
    /// Name prefix inside the container.
    pub dst_prefix: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct JoinResponse {
    pub interface_name: InterfaceName,
    /// Empty when the network has no IPv4 subnets.
    pub gateway: String,
    /// Empty when the network has no IPv6 subnets.
    #[serde(rename = "GatewayIPv6")]
    pub gateway_ipv6: String,
}

/// Scope of the driver's networks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Local,
    Global,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CapabilitiesResponse {
    pub scope: Scope,
    pub connectivity_scope: Scope,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_network_request_wire_names() {
        let req: CreateNetworkRequest = serde_json::from_str(
            r#"{
                "NetworkID": "n1",
                "Options": {"com.docker.network.generic": {"parent": "eth0"}},
                "IPv4Data": [{"Pool": "192.168.1.0/24", "Gateway": "192.168.1.1/24"}]
            }"#,
        )
        .unwrap();

        assert_eq!(req.network_id, "n1");
        assert!(req.ipv6_data.is_empty());
        assert_eq!(
            req.ipv4_pools(),
            vec![IpamData::new("192.168.1.0/24", "192.168.1.1/24")]
        );
    }

    #[test]
    fn test_capabilities_serialize() {
        let caps = CapabilitiesResponse {
            scope: Scope::Global,
            connectivity_scope: Scope::Global,
        };
        let value = serde_json::to_value(&caps).unwrap();
        assert_eq!(value["Scope"], "global");
    }
}
