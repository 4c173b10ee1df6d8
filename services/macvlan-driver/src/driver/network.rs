//! Network lifecycle.

use tracing::{debug, error, info, warn};

use super::{require_network_id, Driver};
use crate::api::{
    AllocateNetworkRequest, AllocateNetworkResponse, CreateNetworkRequest, DeleteNetworkRequest,
    FreeNetworkRequest,
};
use crate::error::DriverError;
use crate::model::{Endpoint, NetworkConfig};
use crate::registry::Network;

impl Driver {
    /// Validate a network definition and reserve its parent.
    ///
    /// Nothing is created on the host and nothing is persisted; the
    /// allocation is replaced when the same id is created.
    pub async fn allocate_network(
        &self,
        req: &AllocateNetworkRequest,
    ) -> Result<AllocateNetworkResponse, DriverError> {
        debug!(network_id = %req.network_id, "Allocating network");

        let config = self.validate_network(req, false)?;
        self.registry.insert(Network::allocated(config))?;

        info!(network_id = %req.network_id, "Network allocated");
        Ok(AllocateNetworkResponse {
            options: req.options.clone(),
        })
    }

    /// Release an allocation.
    ///
    /// Unknown ids are ignored. A network that was created on this node is
    /// left for [`Driver::delete_network`].
    pub async fn free_network(&self, req: &FreeNetworkRequest) -> Result<(), DriverError> {
        require_network_id(&req.network_id)?;

        match self.registry.get(&req.network_id) {
            None => debug!(network_id = %req.network_id, "Free of unknown network"),
            Some(network) if network.is_provisioned() => {
                debug!(network_id = %req.network_id, "Network is provisioned, not freeing")
            }
            Some(_) => {
                self.registry.remove(&req.network_id);
                info!(network_id = %req.network_id, "Network allocation freed");
            }
        }
        Ok(())
    }

    /// Create a network: validate, reserve its id and parent, make sure the
    /// parent link exists, persist the configuration, then register it.
    ///
    /// A create that loses the parent to another network fails before it
    /// touches any link. Any failure after the parent link was created
    /// removes it again.
    pub async fn create_network(&self, req: &CreateNetworkRequest) -> Result<(), DriverError> {
        debug!(network_id = %req.network_id, "Creating network");

        let mut config = self.validate_network(req, true)?;
        let previous = self.registry.reserve(&config)?;

        if let Err(e) = self.provisioner.ensure_parent_link(&mut config).await {
            self.registry.release(&config.id, previous);
            return Err(e.into());
        }

        if let Err(e) = self.store.put(&mut config).await {
            error!(network_id = %config.id, error = %e, "Failed to persist network");
            self.release_parent_link(&config).await;
            self.registry.release(&config.id, previous);
            return Err(DriverError::store("network", &config.id, e));
        }

        if let Err(e) = self.registry.commit(Network::provisioned(config.clone())) {
            warn!(network_id = %config.id, error = %e, "Network reservation lost");
            self.discard_record(&mut config).await;
            self.release_parent_link(&config).await;
            return Err(e);
        }

        info!(
            network_id = %config.id,
            parent = %config.parent,
            mode = %config.mode,
            internal = config.internal,
            created_parent = config.created_slave_link,
            "Network created"
        );
        Ok(())
    }

    /// Delete a network and everything attached to it.
    ///
    /// Unknown ids are a no-op. Teardown is best-effort: each failure is
    /// logged and the remaining steps still run.
    pub async fn delete_network(&self, req: &DeleteNetworkRequest) -> Result<(), DriverError> {
        require_network_id(&req.network_id)?;

        let Some(network) = self.registry.remove(&req.network_id) else {
            debug!(network_id = %req.network_id, "Delete of unknown network");
            return Ok(());
        };

        let endpoints: Vec<Endpoint> = network.lock().await.drain().map(|(_, ep)| ep).collect();

        for mut endpoint in endpoints {
            self.release_endpoint_link(&endpoint).await;
            self.discard_record(&mut endpoint).await;
        }

        let mut config = network.config().clone();
        self.release_parent_link(&config).await;
        if network.is_provisioned() {
            self.discard_record(&mut config).await;
        }

        info!(network_id = %req.network_id, "Network deleted");
        Ok(())
    }

    fn validate_network(
        &self,
        req: &CreateNetworkRequest,
        provisioning: bool,
    ) -> Result<NetworkConfig, DriverError> {
        let mut config = NetworkConfig::parse(&req.network_id, &req.options)?;
        config.process_ipam(&req.ipv4_pools(), &req.ipv6_pools())?;

        if let Some(existing) = self.registry.get(&config.id) {
            if existing.is_provisioned() || !provisioning {
                return Err(DriverError::NetworkExists(config.id));
            }
        }

        if let Some(other) = self.registry.parent_conflict(&config) {
            return Err(DriverError::DuplicateParent {
                network: other.config().display_name(),
                parent: config.parent,
            });
        }

        Ok(config)
    }
}
