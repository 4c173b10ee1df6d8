//! Kernel link operations.
//!
//! The driver never talks to netlink directly; it goes through [`LinkOps`],
//! which covers the handful of primitives it needs (existence check,
//! dummy/VLAN/macvlan creation, bring-up, delete). Each primitive is
//! atomic from the driver's point of view.
//!
//! - [`IpLinkOps`] shells out to `ip link` and reads `/sys/class/net`.
//! - [`MockLinks`] keeps an in-memory link table for tests and dry runs.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

use crate::model::MacvlanMode;

/// Errors from link operations.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("{0} was not found on the host")]
    NotFound(String),

    #[error("link {0} already exists")]
    AlreadyExists(String),

    #[error("invalid subinterface vlan name {0}, example formatting is eth0.10")]
    InvalidVlanName(String),

    #[error("vlan id must be between 1-4094, received: {0}")]
    InvalidVlanId(String),

    #[error("could not generate interface name")]
    NameExhausted,

    #[error("ip {args} failed: {stderr}")]
    IpCommand { args: String, stderr: String },

    #[error("command execution failed: {0}")]
    CommandFailed(#[from] std::io::Error),
}

/// Primitive link operations the driver relies on.
#[async_trait]
pub trait LinkOps: Send + Sync {
    /// Check whether a link with this name exists.
    async fn link_exists(&self, name: &str) -> Result<bool, LinkError>;

    /// Create a dummy link.
    async fn create_dummy(&self, name: &str) -> Result<(), LinkError>;

    /// Create a VLAN sub-interface `name` on `parent`.
    async fn create_vlan(&self, name: &str, parent: &str, vlan_id: u16) -> Result<(), LinkError>;

    /// Create a macvlan link `name` enslaved to `parent`.
    async fn create_macvlan(
        &self,
        name: &str,
        parent: &str,
        mode: MacvlanMode,
    ) -> Result<(), LinkError>;

    /// Bring a link up.
    async fn set_up(&self, name: &str) -> Result<(), LinkError>;

    /// Delete a link.
    async fn delete(&self, name: &str) -> Result<(), LinkError>;
}

// ============================================================================
// ip(8) backed implementation
// ============================================================================

/// Link operations backed by the `ip` tool.
#[derive(Debug, Clone)]
pub struct IpLinkOps {
    sysfs_net: PathBuf,
}

impl IpLinkOps {
    pub fn new() -> Self {
        Self {
            sysfs_net: PathBuf::from("/sys/class/net"),
        }
    }
}

impl Default for IpLinkOps {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LinkOps for IpLinkOps {
    async fn link_exists(&self, name: &str) -> Result<bool, LinkError> {
        Ok(tokio::fs::try_exists(self.sysfs_net.join(name)).await?)
    }

    async fn create_dummy(&self, name: &str) -> Result<(), LinkError> {
        run_ip(&["link", "add", name, "type", "dummy"]).await?;
        debug!(link = %name, "Dummy link created");
        Ok(())
    }

    async fn create_vlan(&self, name: &str, parent: &str, vlan_id: u16) -> Result<(), LinkError> {
        let id = vlan_id.to_string();
        run_ip(&["link", "add", "link", parent, "name", name, "type", "vlan", "id", &id]).await?;
        debug!(link = %name, parent = %parent, vlan_id, "VLAN link created");
        Ok(())
    }

    async fn create_macvlan(
        &self,
        name: &str,
        parent: &str,
        mode: MacvlanMode,
    ) -> Result<(), LinkError> {
        run_ip(&[
            "link",
            "add",
            name,
            "link",
            parent,
            "type",
            "macvlan",
            "mode",
            mode.as_str(),
        ])
        .await?;
        debug!(link = %name, parent = %parent, mode = %mode, "Macvlan link created");
        Ok(())
    }

    async fn set_up(&self, name: &str) -> Result<(), LinkError> {
        run_ip(&["link", "set", "dev", name, "up"]).await
    }

    async fn delete(&self, name: &str) -> Result<(), LinkError> {
        run_ip(&["link", "delete", name]).await?;
        info!(link = %name, "Link deleted");
        Ok(())
    }
}

/// Run an `ip` command and map a non-zero exit to [`LinkError::IpCommand`].
async fn run_ip(args: &[&str]) -> Result<(), LinkError> {
    let output = Command::new("ip").args(args).output().await?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(LinkError::IpCommand {
            args: args.join(" "),
            stderr: stderr.trim().to_string(),
        });
    }

    Ok(())
}

// ============================================================================
// In-memory implementation
// ============================================================================

/// What a mock link is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockLinkKind {
    /// Pre-existing host link (e.g. `eth0`).
    Physical,
    Dummy,
    Vlan { parent: String, vlan_id: u16 },
    Macvlan { parent: String, mode: MacvlanMode },
}

#[derive(Debug, Clone)]
struct MockLink {
    kind: MockLinkKind,
    up: bool,
}

#[derive(Debug, Default)]
struct MockState {
    links: BTreeMap<String, MockLink>,
    fail_create: Vec<String>,
    fail_set_up: Vec<String>,
    fail_delete: Vec<String>,
}

/// In-memory link table.
///
/// Creation checks parents and name collisions the way the kernel would;
/// individual names can be configured to fail.
#[derive(Debug, Default)]
pub struct MockLinks {
    state: Mutex<MockState>,
}

impl MockLinks {
    /// Create an empty link table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a table that already holds the given host links.
    pub fn with_host_links<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let links = Self::new();
        for name in names {
            links.add_host_link(name);
        }
        links
    }

    /// Add a pre-existing host link.
    pub fn add_host_link(&self, name: impl Into<String>) {
        self.state().links.insert(
            name.into(),
            MockLink {
                kind: MockLinkKind::Physical,
                up: true,
            },
        );
    }

    /// Make every create of `name` fail.
    pub fn fail_create(&self, name: impl Into<String>) {
        self.state().fail_create.push(name.into());
    }

    /// Make bringing `name` up fail.
    pub fn fail_set_up(&self, name: impl Into<String>) {
        self.state().fail_set_up.push(name.into());
    }

    /// Make deleting `name` fail.
    pub fn fail_delete(&self, name: impl Into<String>) {
        self.state().fail_delete.push(name.into());
    }

    /// Whether `name` exists.
    pub fn contains(&self, name: &str) -> bool {
        self.state().links.contains_key(name)
    }

    /// Kind of `name`, if it exists.
    pub fn kind(&self, name: &str) -> Option<MockLinkKind> {
        self.state().links.get(name).map(|l| l.kind.clone())
    }

    /// Whether `name` exists and is up.
    pub fn is_up(&self, name: &str) -> bool {
        self.state().links.get(name).is_some_and(|l| l.up)
    }

    /// All link names, sorted.
    pub fn names(&self) -> Vec<String> {
        self.state().links.keys().cloned().collect()
    }

    /// Names of macvlan links, sorted.
    pub fn macvlan_names(&self) -> Vec<String> {
        self.state()
            .links
            .iter()
            .filter(|(_, l)| matches!(l.kind, MockLinkKind::Macvlan { .. }))
            .map(|(name, _)| name.clone())
            .collect()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn create(&self, name: &str, kind: MockLinkKind) -> Result<(), LinkError> {
        let mut state = self.state();
        if state.fail_create.iter().any(|n| n == name) {
            return Err(injected("link add", name));
        }
        if state.links.contains_key(name) {
            return Err(LinkError::AlreadyExists(name.to_string()));
        }
        if let MockLinkKind::Vlan { parent, .. } | MockLinkKind::Macvlan { parent, .. } = &kind {
            if !state.links.contains_key(parent) {
                return Err(LinkError::NotFound(parent.clone()));
            }
        }
        state
            .links
            .insert(name.to_string(), MockLink { kind, up: false });
        Ok(())
    }
}

fn injected(op: &str, name: &str) -> LinkError {
    LinkError::IpCommand {
        args: format!("{} {}", op, name),
        stderr: "injected failure".to_string(),
    }
}

#[async_trait]
impl LinkOps for MockLinks {
    async fn link_exists(&self, name: &str) -> Result<bool, LinkError> {
        Ok(self.contains(name))
    }

    async fn create_dummy(&self, name: &str) -> Result<(), LinkError> {
        debug!(link = %name, "[MOCK] Creating dummy link");
        self.create(name, MockLinkKind::Dummy)
    }

    async fn create_vlan(&self, name: &str, parent: &str, vlan_id: u16) -> Result<(), LinkError> {
        debug!(link = %name, parent = %parent, vlan_id, "[MOCK] Creating VLAN link");
        self.create(
            name,
            MockLinkKind::Vlan {
                parent: parent.to_string(),
                vlan_id,
            },
        )
    }

    async fn create_macvlan(
        &self,
        name: &str,
        parent: &str,
        mode: MacvlanMode,
    ) -> Result<(), LinkError> {
        debug!(link = %name, parent = %parent, mode = %mode, "[MOCK] Creating macvlan link");
        self.create(
            name,
            MockLinkKind::Macvlan {
                parent: parent.to_string(),
                mode,
            },
        )
    }

    async fn set_up(&self, name: &str) -> Result<(), LinkError> {
        let mut state = self.state();
        if state.fail_set_up.iter().any(|n| n == name) {
            return Err(injected("link set up", name));
        }
        match state.links.get_mut(name) {
            Some(link) => {
                link.up = true;
                Ok(())
            }
            None => Err(LinkError::NotFound(name.to_string())),
        }
    }

    async fn delete(&self, name: &str) -> Result<(), LinkError> {
        let mut state = self.state();
        if state.fail_delete.iter().any(|n| n == name) {
            return Err(injected("link delete", name));
        }
        match state.links.remove(name) {
            Some(_) => {
                debug!(link = %name, "[MOCK] Link deleted");
                Ok(())
            }
            None => Err(LinkError::NotFound(name.to_string())),
        }
    }
}
