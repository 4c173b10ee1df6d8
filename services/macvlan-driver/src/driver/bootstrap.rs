//! Restoring state after a restart.

use tracing::{debug, info, warn};

use super::Driver;
use crate::error::DriverError;
use crate::model::{Endpoint, NetworkConfig};
use crate::registry::Network;

/// Outcome of [`Driver::bootstrap`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BootstrapReport {
    pub networks_restored: usize,
    pub endpoints_restored: usize,
    /// Endpoint records removed because their network no longer exists.
    pub endpoints_pruned: usize,
}

impl Driver {
    /// Rebuild the registry from the store.
    ///
    /// Parent links this driver created are brought back when missing, as
    /// after a host reboot. A network whose parent cannot be restored is
    /// still registered so it can be deleted. Endpoints whose network is
    /// unknown both locally and to the orchestrator are deleted from the
    /// store.
    pub async fn bootstrap(&self) -> Result<BootstrapReport, DriverError> {
        let mut report = BootstrapReport::default();

        let networks: Vec<NetworkConfig> = self
            .store
            .list()
            .await
            .map_err(|e| DriverError::store("network", "*", e))?;

        for mut config in networks {
            if config.created_slave_link {
                if let Err(e) = self.provisioner.ensure_parent_link(&mut config).await {
                    warn!(
                        network_id = %config.id,
                        parent = %config.parent,
                        error = %e,
                        "Failed to restore parent link"
                    );
                }
            }

            let network_id = config.id.clone();
            match self.registry.insert(Network::provisioned(config)) {
                Ok(_) => {
                    debug!(network_id = %network_id, "Network restored");
                    report.networks_restored += 1;
                }
                Err(e) => warn!(network_id = %network_id, error = %e, "Skipping persisted network"),
            }
        }

        let endpoints: Vec<Endpoint> = self
            .store
            .list()
            .await
            .map_err(|e| DriverError::store("endpoint", "*", e))?;

        for mut endpoint in endpoints {
            let Some(network) = self.network_or_fallback(&endpoint.network_id).await else {
                debug!(
                    endpoint_id = %endpoint.short_id(),
                    network_id = %endpoint.network_id,
                    "Pruning endpoint of unknown network"
                );
                match self.store.delete(&mut endpoint).await {
                    Ok(()) => report.endpoints_pruned += 1,
                    Err(e) => warn!(
                        endpoint_id = %endpoint.short_id(),
                        error = %e,
                        "Failed to prune stale endpoint"
                    ),
                }
                continue;
            };

            network
                .lock()
                .await
                .insert(endpoint.id.clone(), endpoint);
            report.endpoints_restored += 1;
        }

        info!(
            networks = report.networks_restored,
            endpoints = report.endpoints_restored,
            pruned = report.endpoints_pruned,
            "Driver state restored"
        );
        Ok(report)
    }
}
