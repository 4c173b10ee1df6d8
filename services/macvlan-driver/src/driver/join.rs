//! Attaching endpoints to containers.
//!
//! Join resolves the gateways first and only then creates the macvlan
//! link, so a join that cannot be routed leaves nothing behind.

use std::net::IpAddr;

use mvlan_networking::{parse_gateway, Family, IpNet};
use tracing::{debug, info, warn};

use super::{require_ids, Driver};
use crate::api::{InterfaceName, JoinRequest, JoinResponse, LeaveRequest};
use crate::error::DriverError;
use crate::model::{Endpoint, JoinState, NetworkConfig, Subnet};
use crate::network::ENDPOINT_LINK_PREFIX;

/// Name prefix of the interface inside the container.
pub const CONTAINER_IFNAME_PREFIX: &str = "eth";

/// The configured subnet an endpoint address belongs to.
///
/// A subnet matches when it has the same prefix length as the address and
/// contains it. Unparsable subnets never match.
pub fn match_subnet(subnets: &[Subnet], address: IpNet) -> Option<&Subnet> {
    subnets.iter().find(|subnet| match subnet.cidr() {
        Ok(cidr) => cidr.prefix_len() == address.prefix_len() && cidr.contains(address.addr()),
        Err(_) => false,
    })
}

/// Gateway for one address family of an endpoint.
///
/// `None` when the endpoint has no address of that family. An address
/// outside every subnet of its family is an error, including when the
/// network has no subnets of that family at all.
pub fn resolve_gateway(
    config: &NetworkConfig,
    endpoint: &Endpoint,
    family: Family,
) -> Result<Option<IpAddr>, DriverError> {
    let Some(address) = endpoint.address(family) else {
        return Ok(None);
    };

    let subnet = match_subnet(config.subnets(family), address).ok_or_else(|| DriverError::NoMatchingSubnet {
        family,
        endpoint: endpoint.id.clone(),
    })?;

    parse_gateway(&subnet.gateway)
        .map(Some)
        .map_err(|_| DriverError::InvalidGateway {
            family,
            gateway: subnet.gateway.clone(),
        })
}

impl Driver {
    /// Bind an endpoint to a new macvlan link.
    ///
    /// Joining an already joined endpoint replaces its link.
    pub async fn join(&self, req: &JoinRequest) -> Result<JoinResponse, DriverError> {
        require_ids(&req.network_id, &req.endpoint_id)?;

        let network = self
            .network_or_fallback(&req.network_id)
            .await
            .ok_or_else(|| DriverError::NetworkNotFound(req.network_id.clone()))?;
        let config = network.config();

        let mut table = network.lock().await;
        if !self.is_current(&network) {
            return Err(DriverError::NetworkNotFound(req.network_id.clone()));
        }
        let endpoint = table
            .get(&req.endpoint_id)
            .cloned()
            .ok_or_else(|| DriverError::EndpointNotFound(req.endpoint_id.clone()))?;

        let gateway = resolve_gateway(config, &endpoint, Family::V4)?;
        let gateway_ipv6 = resolve_gateway(config, &endpoint, Family::V6)?;

        if !endpoint.link_name.is_empty() {
            debug!(
                endpoint_id = %endpoint.short_id(),
                link = %endpoint.link_name,
                "Replacing link from earlier join"
            );
            self.release_endpoint_link(&endpoint).await;
        }

        let link_name = self
            .provisioner
            .create_endpoint_link(ENDPOINT_LINK_PREFIX, &config.parent, config.mode)
            .await?;

        let mut joined = endpoint;
        joined.link_name = link_name.clone();
        joined.state = JoinState::Joined;

        if let Err(e) = self.store.put(&mut joined).await {
            if let Err(del) = self.provisioner.delete_endpoint_link(&link_name).await {
                warn!(link = %link_name, error = %del, "Failed to roll back endpoint link");
            }
            return Err(DriverError::store("endpoint", &req.endpoint_id, e));
        }

        info!(
            network_id = %req.network_id,
            endpoint_id = %joined.short_id(),
            link = %link_name,
            parent = %config.parent,
            "Endpoint joined"
        );
        table.insert(joined.id.clone(), joined);

        Ok(JoinResponse {
            interface_name: InterfaceName {
                src_name: link_name,
                dst_prefix: CONTAINER_IFNAME_PREFIX.to_string(),
            },
            gateway: gateway.map(|g| g.to_string()).unwrap_or_default(),
            gateway_ipv6: gateway_ipv6.map(|g| g.to_string()).unwrap_or_default(),
        })
    }

    /// Mark an endpoint as no longer attached.
    ///
    /// The link itself moved into the container and goes away with it.
    pub async fn leave(&self, req: &LeaveRequest) -> Result<(), DriverError> {
        require_ids(&req.network_id, &req.endpoint_id)?;

        let network = self
            .registry
            .get(&req.network_id)
            .ok_or_else(|| DriverError::NetworkNotFound(req.network_id.clone()))?;

        let mut table = network.lock().await;
        let endpoint = table
            .get_mut(&req.endpoint_id)
            .ok_or_else(|| DriverError::EndpointNotFound(req.endpoint_id.clone()))?;

        if endpoint.state == JoinState::Joined {
            endpoint.state = JoinState::Left;
        } else {
            debug!(
                endpoint_id = %endpoint.short_id(),
                state = %endpoint.state,
                "Leave on endpoint that is not joined"
            );
        }

        info!(network_id = %req.network_id, endpoint_id = %endpoint.short_id(), "Endpoint left");
        Ok(())
    }
}
