//! Parent and endpoint link provisioning.
//!
//! A macvlan network rides on a parent link. When the parent already
//! exists the driver leaves it alone; otherwise it creates one (a dummy
//! link for isolated networks, a VLAN sub-interface `<iface>.<vlan>`
//! otherwise) and records that it owns the teardown.
//!
//! Endpoints get a macvlan link with a random `veth…` name, later moved
//! into the container namespace and renamed by the engine.

use std::sync::Arc;

use mvlan_networking::random_ifname;
use tracing::{debug, info, warn};

use super::link::{LinkError, LinkOps};
use crate::model::{MacvlanMode, NetworkConfig, SlaveLinkKind};

/// Prefix of generated endpoint link names.
pub const ENDPOINT_LINK_PREFIX: &str = "veth";

/// Random characters appended to [`ENDPOINT_LINK_PREFIX`].
pub const ENDPOINT_LINK_RANDOM_LEN: usize = 7;

/// Attempts at finding an unused endpoint link name.
pub const NAME_ATTEMPTS: u32 = 3;

/// Name generator signature: `(prefix, random_len) -> name`.
pub type NameGenerator = fn(&str, usize) -> String;

/// Creates and removes the links networks and endpoints depend on.
pub struct LinkProvisioner {
    links: Arc<dyn LinkOps>,
    generate_name: NameGenerator,
}

impl LinkProvisioner {
    pub fn new(links: Arc<dyn LinkOps>) -> Self {
        Self {
            links,
            generate_name: random_ifname,
        }
    }

    /// Replace the random name generator.
    pub fn with_name_generator(mut self, generate_name: NameGenerator) -> Self {
        self.generate_name = generate_name;
        self
    }

    /// Make sure the network's parent link exists.
    ///
    /// Sets `created_slave_link` only when this call created the link. A
    /// link that was created but could not be brought up is removed again.
    pub async fn ensure_parent_link(&self, config: &mut NetworkConfig) -> Result<(), LinkError> {
        if self.links.link_exists(&config.parent).await? {
            debug!(
                network_id = %config.id,
                parent = %config.parent,
                "Parent link already exists"
            );
            return Ok(());
        }

        if config.internal {
            self.links.create_dummy(&config.parent).await?;
            self.bring_up_or_remove(&config.parent).await?;
            config.created_slave_link = true;
            info!(
                network_id = %config.id,
                parent = %config.parent,
                "Created dummy parent link; communication is limited to endpoints on this network"
            );
            return Ok(());
        }

        let (iface, vlan_id) = parse_vlan_name(&config.parent)?;
        if !self.links.link_exists(&iface).await? {
            return Err(LinkError::NotFound(iface));
        }
        self.links.create_vlan(&config.parent, &iface, vlan_id).await?;
        self.bring_up_or_remove(&config.parent).await?;
        config.created_slave_link = true;
        info!(
            network_id = %config.id,
            parent = %config.parent,
            vlan_id,
            "Created VLAN parent link"
        );

        Ok(())
    }

    /// Remove the parent link if this driver created it and it still exists.
    pub async fn teardown_parent_link(&self, config: &NetworkConfig) -> Result<(), LinkError> {
        if !config.created_slave_link {
            return Ok(());
        }
        if !self.links.link_exists(&config.parent).await? {
            debug!(parent = %config.parent, "Parent link already gone");
            return Ok(());
        }

        match config.slave_link_kind() {
            SlaveLinkKind::Dummy => {}
            SlaveLinkKind::Vlan => {
                // only touch links that follow the iface.vlan naming
                parse_vlan_name(&config.parent)?;
            }
        }

        self.links.delete(&config.parent).await?;
        info!(network_id = %config.id, parent = %config.parent, "Removed parent link");
        Ok(())
    }

    /// Create a macvlan link on `parent` and return its generated name.
    pub async fn create_endpoint_link(
        &self,
        prefix: &str,
        parent: &str,
        mode: MacvlanMode,
    ) -> Result<String, LinkError> {
        let name = self.unused_name(prefix).await?;
        self.links.create_macvlan(&name, parent, mode).await?;
        Ok(name)
    }

    /// Delete an endpoint link if it is still present.
    ///
    /// Returns whether a link was removed.
    pub async fn delete_endpoint_link(&self, name: &str) -> Result<bool, LinkError> {
        if name.is_empty() || !self.links.link_exists(name).await? {
            return Ok(false);
        }
        self.links.delete(name).await?;
        Ok(true)
    }

    async fn unused_name(&self, prefix: &str) -> Result<String, LinkError> {
        for _ in 0..NAME_ATTEMPTS {
            let name = (self.generate_name)(prefix, ENDPOINT_LINK_RANDOM_LEN);
            if !self.links.link_exists(&name).await? {
                return Ok(name);
            }
            debug!(link = %name, "Generated link name already in use");
        }
        Err(LinkError::NameExhausted)
    }

    async fn bring_up_or_remove(&self, name: &str) -> Result<(), LinkError> {
        if let Err(e) = self.links.set_up(name).await {
            if let Err(del) = self.links.delete(name).await {
                warn!(link = %name, error = %del, "Failed to roll back link");
            }
            return Err(e);
        }
        Ok(())
    }
}

/// Split `eth0.10` into `("eth0", 10)`.
pub fn parse_vlan_name(name: &str) -> Result<(String, u16), LinkError> {
    let Some((iface, vlan)) = name.rsplit_once('.') else {
        return Err(LinkError::InvalidVlanName(name.to_string()));
    };
    if iface.is_empty() || vlan.is_empty() {
        return Err(LinkError::InvalidVlanName(name.to_string()));
    }

    let vlan_id: u16 = vlan
        .parse()
        .map_err(|_| LinkError::InvalidVlanId(vlan.to_string()))?;
    if !(1..=4094).contains(&vlan_id) {
        return Err(LinkError::InvalidVlanId(vlan.to_string()));
    }

    Ok((iface.to_string(), vlan_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::link::{MockLinkKind, MockLinks};

    fn provisioner(links: &Arc<MockLinks>) -> LinkProvisioner {
        LinkProvisioner::new(links.clone())
    }

    fn config(id: &str, parent: &str, internal: bool) -> NetworkConfig {
        let mut config = NetworkConfig::new(id);
        config.parent = parent.to_string();
        config.internal = internal;
        config
    }

    #[test]
    fn test_parse_vlan_name() {
        assert_eq!(parse_vlan_name("eth0.10").unwrap(), ("eth0".to_string(), 10));
        assert_eq!(
            parse_vlan_name("bond0.1.200").unwrap(),
            ("bond0.1".to_string(), 200)
        );
        assert!(matches!(
            parse_vlan_name("eth0"),
            Err(LinkError::InvalidVlanName(_))
        ));
        assert!(matches!(
            parse_vlan_name("eth0.0"),
            Err(LinkError::InvalidVlanId(_))
        ));
        assert!(matches!(
            parse_vlan_name("eth0.4095"),
            Err(LinkError::InvalidVlanId(_))
        ));
        assert!(parse_vlan_name(".10").is_err());
    }

    #[tokio::test]
    async fn test_existing_parent_is_left_alone() {
        let links = Arc::new(MockLinks::with_host_links(["eth0"]));
        let mut config = config("n1", "eth0", false);

        provisioner(&links).ensure_parent_link(&mut config).await.unwrap();

        assert!(!config.created_slave_link);
        assert_eq!(links.names(), vec!["eth0".to_string()]);
    }

    #[tokio::test]
    async fn test_internal_network_gets_dummy_link() {
        let links = Arc::new(MockLinks::new());
        let mut config = config("n1", "dm-n1", true);

        provisioner(&links).ensure_parent_link(&mut config).await.unwrap();

        assert!(config.created_slave_link);
        assert_eq!(links.kind("dm-n1"), Some(MockLinkKind::Dummy));
        assert!(links.is_up("dm-n1"));
    }

    #[tokio::test]
    async fn test_vlan_parent_created_on_physical_iface() {
        let links = Arc::new(MockLinks::with_host_links(["eth0"]));
        let mut config = config("n1", "eth0.10", false);

        provisioner(&links).ensure_parent_link(&mut config).await.unwrap();

        assert!(config.created_slave_link);
        assert_eq!(
            links.kind("eth0.10"),
            Some(MockLinkKind::Vlan {
                parent: "eth0".to_string(),
                vlan_id: 10
            })
        );
    }

    #[tokio::test]
    async fn test_vlan_parent_requires_physical_iface() {
        let links = Arc::new(MockLinks::new());
        let mut config = config("n1", "eth7.10", false);

        let err = provisioner(&links)
            .ensure_parent_link(&mut config)
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "eth7 was not found on the host");
        assert!(!config.created_slave_link);
    }

    #[tokio::test]
    async fn test_failed_bring_up_rolls_back() {
        let links = Arc::new(MockLinks::with_host_links(["eth0"]));
        links.fail_set_up("eth0.20");
        let mut config = config("n1", "eth0.20", false);

        assert!(provisioner(&links)
            .ensure_parent_link(&mut config)
            .await
            .is_err());
        assert!(!links.contains("eth0.20"));
        assert!(!config.created_slave_link);
    }

    #[tokio::test]
    async fn test_teardown_only_owned_links() {
        let links = Arc::new(MockLinks::with_host_links(["eth0", "eth0.30"]));
        let p = provisioner(&links);

        // not created by us
        let foreign = config("n1", "eth0.30", false);
        p.teardown_parent_link(&foreign).await.unwrap();
        assert!(links.contains("eth0.30"));

        let mut owned = config("n2", "dm-n2", true);
        p.ensure_parent_link(&mut owned).await.unwrap();
        p.teardown_parent_link(&owned).await.unwrap();
        assert!(!links.contains("dm-n2"));

        // already gone is fine
        p.teardown_parent_link(&owned).await.unwrap();
    }

    #[tokio::test]
    async fn test_endpoint_link_creation() {
        let links = Arc::new(MockLinks::with_host_links(["eth0"]));
        let name = provisioner(&links)
            .create_endpoint_link(ENDPOINT_LINK_PREFIX, "eth0", MacvlanMode::Private)
            .await
            .unwrap();

        assert!(name.starts_with("veth"));
        assert_eq!(name.len(), ENDPOINT_LINK_PREFIX.len() + ENDPOINT_LINK_RANDOM_LEN);
        assert_eq!(
            links.kind(&name),
            Some(MockLinkKind::Macvlan {
                parent: "eth0".to_string(),
                mode: MacvlanMode::Private
            })
        );
    }

    #[tokio::test]
    async fn test_endpoint_link_name_exhaustion() {
        fn always_taken(_: &str, _: usize) -> String {
            "vethtaken0".to_string()
        }

        let links = Arc::new(MockLinks::with_host_links(["eth0", "vethtaken0"]));
        let p = provisioner(&links).with_name_generator(always_taken);

        let err = p
            .create_endpoint_link(ENDPOINT_LINK_PREFIX, "eth0", MacvlanMode::Bridge)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "could not generate interface name");
    }

    #[tokio::test]
    async fn test_delete_endpoint_link() {
        let links = Arc::new(MockLinks::with_host_links(["eth0"]));
        let p = provisioner(&links);
        let name = p
            .create_endpoint_link(ENDPOINT_LINK_PREFIX, "eth0", MacvlanMode::Bridge)
            .await
            .unwrap();

        assert!(p.delete_endpoint_link(&name).await.unwrap());
        assert!(!p.delete_endpoint_link(&name).await.unwrap());
        assert!(!p.delete_endpoint_link("").await.unwrap());
    }
}
