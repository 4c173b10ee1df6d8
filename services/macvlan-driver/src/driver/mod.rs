//! The macvlan network driver.
//!
//! Every operation runs to completion on the caller's task. Operations on
//! different networks proceed in parallel; operations on the same network
//! serialize on its lock.

mod bootstrap;
mod endpoint;
mod join;
mod network;

use std::sync::Arc;

use tracing::{debug, warn};

pub use bootstrap::BootstrapReport;
pub use join::{match_subnet, resolve_gateway};

use crate::api::{CapabilitiesResponse, Scope};
use crate::error::DriverError;
use crate::model::{ConfigError, Endpoint, NetworkConfig, DRIVER_NAME};
use crate::network::{LinkOps, LinkProvisioner};
use crate::orchestrator::{self, Orchestrator};
use crate::registry::{Network, Registry};
use crate::state::{KvStore, Record, RecordStore, RetryPolicy};

/// Macvlan driver state and collaborators.
pub struct Driver {
    registry: Registry,
    store: RecordStore,
    provisioner: LinkProvisioner,
    orchestrator: Arc<dyn Orchestrator>,
}

impl Driver {
    pub fn new(
        store: Arc<dyn KvStore>,
        links: Arc<dyn LinkOps>,
        orchestrator: Arc<dyn Orchestrator>,
        retry: RetryPolicy,
    ) -> Self {
        Self::with_provisioner(store, LinkProvisioner::new(links), orchestrator, retry)
    }

    /// Build a driver around a preconfigured provisioner.
    pub fn with_provisioner(
        store: Arc<dyn KvStore>,
        provisioner: LinkProvisioner,
        orchestrator: Arc<dyn Orchestrator>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            registry: Registry::new(),
            store: RecordStore::new(store, retry),
            provisioner,
            orchestrator,
        }
    }

    /// Driver type name.
    pub fn name(&self) -> &'static str {
        DRIVER_NAME
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Networks are cluster-wide.
    pub fn capabilities(&self) -> CapabilitiesResponse {
        CapabilitiesResponse {
            scope: Scope::Global,
            connectivity_scope: Scope::Global,
        }
    }

    /// Registry lookup, falling back to the orchestrator for networks
    /// created while this node was not listening.
    async fn network_or_fallback(&self, network_id: &str) -> Option<Arc<Network>> {
        if let Some(network) = self.registry.get(network_id) {
            return Some(network);
        }

        let config = orchestrator::lookup(self.orchestrator.as_ref(), network_id).await?;
        match self.registry.insert(Network::provisioned(config)) {
            Ok(network) => {
                debug!(network_id = %network_id, "Network registered from orchestrator");
                Some(network)
            }
            // someone registered it between our lookup and insert
            Err(DriverError::NetworkExists(_)) => self.registry.get(network_id),
            Err(e) => {
                warn!(network_id = %network_id, error = %e, "Cannot register orchestrator network");
                None
            }
        }
    }

    /// Whether `network` is still the registered entry for its id.
    ///
    /// Checked under the network lock, after which a concurrent delete can
    /// no longer drain the table before this caller is done with it.
    fn is_current(&self, network: &Arc<Network>) -> bool {
        self.registry
            .get(network.id())
            .is_some_and(|registered| Arc::ptr_eq(&registered, network))
    }

    /// Best-effort removal of an endpoint's link.
    async fn release_endpoint_link(&self, endpoint: &Endpoint) {
        if endpoint.link_name.is_empty() {
            return;
        }
        match self.provisioner.delete_endpoint_link(&endpoint.link_name).await {
            Ok(true) => debug!(endpoint_id = %endpoint.short_id(), link = %endpoint.link_name, "Endpoint link removed"),
            Ok(false) => {}
            Err(e) => warn!(
                endpoint_id = %endpoint.short_id(),
                link = %endpoint.link_name,
                error = %e,
                "Failed to remove endpoint link"
            ),
        }
    }

    /// Best-effort removal of the parent link this driver created.
    async fn release_parent_link(&self, config: &NetworkConfig) {
        if let Err(e) = self.provisioner.teardown_parent_link(config).await {
            warn!(
                network_id = %config.id,
                parent = %config.parent,
                error = %e,
                "Failed to remove parent link"
            );
        }
    }

    /// Best-effort record delete with retry.
    async fn discard_record<R: Record>(&self, record: &mut R) {
        if let Err(e) = self.store.delete(record).await {
            warn!(key = %record.key(), error = %e, "Failed to delete {} record", R::KIND);
        }
    }
}

fn require_network_id(network_id: &str) -> Result<(), DriverError> {
    if network_id.is_empty() {
        return Err(ConfigError::InvalidNetworkId.into());
    }
    Ok(())
}

fn require_ids(network_id: &str, endpoint_id: &str) -> Result<(), DriverError> {
    require_network_id(network_id)?;
    if endpoint_id.is_empty() {
        return Err(DriverError::InvalidEndpointId);
    }
    Ok(())
}
