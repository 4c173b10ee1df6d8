//! Endpoint lifecycle.

use std::net::IpAddr;

use mvlan_networking::{mac_from_ipv4, Family, IpNet, MacAddress};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::{require_ids, Driver};
use crate::api::{
    CreateEndpointRequest, CreateEndpointResponse, DeleteEndpointRequest, EndpointInfoRequest,
    EndpointInfoResponse, EndpointInterface,
};
use crate::error::DriverError;
use crate::model::{Endpoint, OptionMap};

/// Option keys the engine uses for published ports.
const PORT_MAP_KEY: &str = "com.docker.network.portmap";
const EXPOSED_PORTS_KEY: &str = "com.docker.network.endpoint.exposedports";

impl Driver {
    /// Register an endpoint and return its MAC address.
    ///
    /// An IPv4 address is required. Without an explicit MAC one is derived
    /// from the IPv4 address.
    pub async fn create_endpoint(
        &self,
        req: &CreateEndpointRequest,
    ) -> Result<CreateEndpointResponse, DriverError> {
        require_ids(&req.network_id, &req.endpoint_id)?;

        let network = self
            .network_or_fallback(&req.network_id)
            .await
            .ok_or_else(|| DriverError::NetworkNotFound(req.network_id.clone()))?;

        let ipv4 = parse_address(Family::V4, &req.interface.address)?
            .ok_or(DriverError::MissingIpv4Address)?;
        let ipv6 = parse_address(Family::V6, &req.interface.address_ipv6)?;

        let mac = if req.interface.mac_address.is_empty() {
            let IpAddr::V4(addr) = ipv4.addr() else {
                return Err(DriverError::InvalidAddress {
                    family: Family::V4,
                    value: req.interface.address.clone(),
                });
            };
            mac_from_ipv4(addr)
        } else {
            req.interface
                .mac_address
                .parse::<MacAddress>()
                .map_err(|_| DriverError::InvalidMac(req.interface.mac_address.clone()))?
        };

        warn_unsupported_options(&req.endpoint_id, &req.options);

        let mut endpoint = Endpoint::new(&req.endpoint_id, &req.network_id);
        endpoint.mac = Some(mac);
        endpoint.ipv4 = Some(ipv4);
        endpoint.ipv6 = ipv6;

        let mut table = network.lock().await;
        if !self.is_current(&network) {
            return Err(DriverError::NetworkNotFound(req.network_id.clone()));
        }
        if table.contains_key(&endpoint.id) {
            return Err(DriverError::EndpointExists(endpoint.id));
        }

        self.store
            .put(&mut endpoint)
            .await
            .map_err(|e| DriverError::store("endpoint", &req.endpoint_id, e))?;

        info!(
            network_id = %req.network_id,
            endpoint_id = %endpoint.short_id(),
            mac = %mac,
            address = %ipv4,
            "Endpoint created"
        );
        table.insert(endpoint.id.clone(), endpoint);

        Ok(CreateEndpointResponse {
            interface: EndpointInterface {
                address: String::new(),
                address_ipv6: String::new(),
                mac_address: mac.to_string(),
            },
        })
    }

    /// Remove an endpoint and its persisted record.
    ///
    /// Unknown networks and endpoints are a no-op. The link is removed on a
    /// best-effort basis; a store failure is returned and leaves the
    /// endpoint registered.
    pub async fn delete_endpoint(&self, req: &DeleteEndpointRequest) -> Result<(), DriverError> {
        require_ids(&req.network_id, &req.endpoint_id)?;

        let Some(network) = self.registry.get(&req.network_id) else {
            debug!(network_id = %req.network_id, "Delete endpoint on unknown network");
            return Ok(());
        };

        let mut table = network.lock().await;
        let Some(mut endpoint) = table.get(&req.endpoint_id).cloned() else {
            debug!(endpoint_id = %req.endpoint_id, "Delete of unknown endpoint");
            return Ok(());
        };

        self.release_endpoint_link(&endpoint).await;

        self.store
            .delete(&mut endpoint)
            .await
            .map_err(|e| DriverError::store("endpoint", &req.endpoint_id, e))?;
        table.remove(&req.endpoint_id);

        info!(
            network_id = %req.network_id,
            endpoint_id = %endpoint.short_id(),
            "Endpoint deleted"
        );
        Ok(())
    }

    /// Describe a registered endpoint.
    pub async fn endpoint_info(
        &self,
        req: &EndpointInfoRequest,
    ) -> Result<EndpointInfoResponse, DriverError> {
        require_ids(&req.network_id, &req.endpoint_id)?;

        let network = self
            .registry
            .get(&req.network_id)
            .ok_or_else(|| DriverError::NetworkNotFound(req.network_id.clone()))?;
        let endpoint = network
            .endpoint(&req.endpoint_id)
            .await
            .ok_or_else(|| DriverError::EndpointNotFound(req.endpoint_id.clone()))?;

        Ok(EndpointInfoResponse {
            network_id: endpoint.network_id,
            endpoint_id: endpoint.id,
            mac_address: endpoint.mac.map(|m| m.to_string()).unwrap_or_default(),
            address: endpoint.ipv4.map(|a| a.to_string()).unwrap_or_default(),
            address_ipv6: endpoint.ipv6.map(|a| a.to_string()).unwrap_or_default(),
            link_name: endpoint.link_name,
            state: endpoint.state.to_string(),
        })
    }
}

/// Parse an endpoint address in CIDR form. Empty means not assigned.
///
/// IPv4-mapped IPv6 addresses are stored as plain IPv4 so they can be
/// matched against IPv4 subnets.
fn parse_address(family: Family, raw: &str) -> Result<Option<IpNet>, DriverError> {
    if raw.is_empty() {
        return Ok(None);
    }
    let invalid = || DriverError::InvalidAddress {
        family,
        value: raw.to_string(),
    };
    let net = IpNet::parse(raw).map_err(|_| invalid())?;
    if net.family() != family {
        return Err(invalid());
    }

    match net.addr() {
        IpAddr::V6(v6) if family == Family::V4 => {
            let addr = v6.to_ipv4_mapped().ok_or_else(invalid)?;
            let prefix_len = net.prefix_len().checked_sub(96).ok_or_else(invalid)?;
            IpNet::new(IpAddr::V4(addr), prefix_len)
                .map(Some)
                .map_err(|_| invalid())
        }
        _ => Ok(Some(net)),
    }
}

/// Port publishing is not supported on macvlan networks.
fn warn_unsupported_options(endpoint_id: &str, options: &OptionMap) {
    for key in [PORT_MAP_KEY, EXPOSED_PORTS_KEY] {
        if let Some(Value::Array(entries)) = options.get(key) {
            if !entries.is_empty() {
                warn!(
                    endpoint_id = %endpoint_id,
                    option = key,
                    "macvlan driver does not support port mappings or exposed ports"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    #[test]
    fn test_parse_address() {
        assert!(parse_address(Family::V4, "").unwrap().is_none());
        assert_eq!(
            parse_address(Family::V4, "10.0.0.2/24").unwrap().unwrap().to_string(),
            "10.0.0.2/24"
        );
        assert!(parse_address(Family::V4, "2001:db8::2/64").is_err());
        assert!(parse_address(Family::V6, "10.0.0.2").is_err());
    }

    #[test]
    fn test_parse_address_unmaps_ipv4() {
        let net = parse_address(Family::V4, "::ffff:10.0.0.7/120")
            .unwrap()
            .unwrap();
        assert_eq!(net.addr(), IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7)));
        assert_eq!(net.to_string(), "10.0.0.7/24");

        // a mapped address with a prefix shorter than the mapping itself
        assert!(parse_address(Family::V4, "::ffff:10.0.0.7/64").is_err());
    }
}
