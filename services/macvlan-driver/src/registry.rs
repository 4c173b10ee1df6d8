//! In-memory registry of live networks.
//!
//! Lock order is registry, then network. The registry lock is a plain
//! `RwLock` held only for map lookups and never across I/O; each network
//! carries an async mutex over its endpoint table that may be held across
//! link and store calls.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;

use crate::error::DriverError;
use crate::model::{Endpoint, NetworkConfig};

/// Endpoints of one network, keyed by endpoint id.
pub type EndpointTable = HashMap<String, Endpoint>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Allocated,
    /// Being created; holds the id and parent until the create finishes.
    Reserved,
    Provisioned,
}

/// A registered network.
#[derive(Debug)]
pub struct Network {
    config: NetworkConfig,
    phase: Phase,
    endpoints: Mutex<EndpointTable>,
}

impl Network {
    fn with_phase(config: NetworkConfig, phase: Phase) -> Self {
        Self {
            config,
            phase,
            endpoints: Mutex::new(EndpointTable::new()),
        }
    }

    /// A network whose parent link is in place and config is persisted
    /// (or known to the orchestrator).
    pub fn provisioned(config: NetworkConfig) -> Self {
        Self::with_phase(config, Phase::Provisioned)
    }

    /// A network that has only been allocated: validated and reserved, with
    /// no link and no persisted record.
    pub fn allocated(config: NetworkConfig) -> Self {
        Self::with_phase(config, Phase::Allocated)
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn is_provisioned(&self) -> bool {
        self.phase == Phase::Provisioned
    }

    fn is_reserved(&self) -> bool {
        self.phase == Phase::Reserved
    }

    /// Take the network lock.
    pub async fn lock(&self) -> MutexGuard<'_, EndpointTable> {
        self.endpoints.lock().await
    }

    /// Copy of one endpoint.
    pub async fn endpoint(&self, endpoint_id: &str) -> Option<Endpoint> {
        self.endpoints.lock().await.get(endpoint_id).cloned()
    }

    /// Copies of all endpoints.
    pub async fn endpoints(&self) -> Vec<Endpoint> {
        self.endpoints.lock().await.values().cloned().collect()
    }
}

/// Map of network id to live network.
///
/// Reserved entries are invisible to lookups; they only hold their id and
/// parent against other creates.
#[derive(Debug, Default)]
pub struct Registry {
    networks: RwLock<HashMap<String, Arc<Network>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<Network>>> {
        self.networks.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<Network>>> {
        self.networks.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, id: &str) -> Option<Arc<Network>> {
        self.read().get(id).filter(|n| !n.is_reserved()).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.read().values().filter(|n| !n.is_reserved()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Point-in-time copy of all entries, reservations included.
    pub fn snapshot(&self) -> Vec<Arc<Network>> {
        self.read().values().cloned().collect()
    }

    /// Network other than `config` itself already bound to its parent.
    ///
    /// Scans a snapshot, so the answer can be stale by the time it is used;
    /// [`Registry::reserve`] and [`Registry::insert`] check again.
    pub fn parent_conflict(&self, config: &NetworkConfig) -> Option<Arc<Network>> {
        self.snapshot()
            .into_iter()
            .find(|n| claims_parent_of(n, config))
    }

    /// Claim a network id and its parent before anything is created.
    ///
    /// An allocation with the same id is taken over and handed back so
    /// [`Registry::release`] can restore it. A reserved or provisioned
    /// entry with the same id is rejected.
    pub fn reserve(&self, config: &NetworkConfig) -> Result<Option<Arc<Network>>, DriverError> {
        let mut networks = self.write();

        let previous = match networks.get(&config.id) {
            Some(existing) if existing.phase == Phase::Allocated => Some(existing.clone()),
            Some(_) => return Err(DriverError::NetworkExists(config.id.clone())),
            None => None,
        };
        check_parent(&networks, config)?;

        networks.insert(
            config.id.clone(),
            Arc::new(Network::with_phase(config.clone(), Phase::Reserved)),
        );
        debug!(network_id = %config.id, parent = %config.parent, "Network reserved");
        Ok(previous)
    }

    /// Replace a reservation with the provisioned network.
    pub fn commit(&self, network: Network) -> Result<Arc<Network>, DriverError> {
        let mut networks = self.write();

        match networks.get(network.id()) {
            Some(existing) if existing.is_reserved() => {}
            _ => return Err(DriverError::NetworkExists(network.id().to_string())),
        }

        let network = Arc::new(network);
        networks.insert(network.id().to_string(), network.clone());
        debug!(network_id = %network.id(), "Network registered");
        Ok(network)
    }

    /// Drop a reservation, restoring the allocation it replaced.
    pub fn release(&self, id: &str, previous: Option<Arc<Network>>) {
        let mut networks = self.write();
        if !networks.get(id).is_some_and(|n| n.is_reserved()) {
            return;
        }
        match previous {
            Some(allocation) => networks.insert(id.to_string(), allocation),
            None => networks.remove(id),
        };
        debug!(network_id = %id, "Network reservation released");
    }

    /// Register a network.
    ///
    /// The parent check is repeated under the write lock so two concurrent
    /// inserts cannot both claim a parent. An allocated-only entry with the
    /// same id is replaced by a provisioned one; anything else with the same
    /// id is rejected.
    pub fn insert(&self, network: Network) -> Result<Arc<Network>, DriverError> {
        let mut networks = self.write();

        if let Some(existing) = networks.get(network.id()) {
            if existing.phase != Phase::Allocated || !network.is_provisioned() {
                return Err(DriverError::NetworkExists(network.id().to_string()));
            }
        }
        check_parent(&networks, network.config())?;

        let network = Arc::new(network);
        networks.insert(network.id().to_string(), network.clone());
        debug!(
            network_id = %network.id(),
            provisioned = network.is_provisioned(),
            "Network registered"
        );
        Ok(network)
    }

    /// Unregister a network. Reservations stay with their create.
    pub fn remove(&self, id: &str) -> Option<Arc<Network>> {
        let mut networks = self.write();
        if networks.get(id)?.is_reserved() {
            return None;
        }
        networks.remove(id)
    }
}

fn claims_parent_of(network: &Network, config: &NetworkConfig) -> bool {
    !config.parent.is_empty() && network.id() != config.id && network.config().parent == config.parent
}

fn check_parent(
    networks: &HashMap<String, Arc<Network>>,
    config: &NetworkConfig,
) -> Result<(), DriverError> {
    match networks.values().find(|n| claims_parent_of(n, config)) {
        Some(other) => Err(DriverError::DuplicateParent {
            network: other.config().display_name(),
            parent: config.parent.clone(),
        }),
        None => Ok(()),
    }
}
