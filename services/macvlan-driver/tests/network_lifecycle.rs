//! Integration tests for network allocation, creation and deletion.
//!
//! Uses MockLinks for kernel links and MemoryStore for persistence.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mvlan_driver::api::{CreateNetworkRequest, IpamDataWire, NetworkRequest};
use mvlan_driver::model::MacvlanMode;
use mvlan_driver::network::MockLinkKind;
use mvlan_driver::state::{KvEntry, KvStore, StoreError, NETWORK_CONFIG_PREFIX};
use mvlan_driver::{Driver, DriverError, MemoryStore, MockLinks, RetryPolicy, StaticOrchestrator};
use serde_json::{json, Value};
use tokio::sync::Notify;

struct Harness {
    driver: Driver,
    store: Arc<MemoryStore>,
    links: Arc<MockLinks>,
}

fn harness() -> Harness {
    let store = Arc::new(MemoryStore::new());
    let links = Arc::new(MockLinks::with_host_links(["eth0", "eth1"]));
    let driver = Driver::new(
        store.clone(),
        links.clone(),
        Arc::new(StaticOrchestrator::new()),
        RetryPolicy {
            max_attempts: 4,
            backoff: Duration::ZERO,
        },
    );
    Harness {
        driver,
        store,
        links,
    }
}

/// Store that parks the first write of one key until released.
struct GatedStore {
    inner: MemoryStore,
    key: String,
    entered: Notify,
    release: Notify,
}

impl GatedStore {
    fn new(key: &str) -> Self {
        Self {
            inner: MemoryStore::new(),
            key: key.to_string(),
            entered: Notify::new(),
            release: Notify::new(),
        }
    }
}

#[async_trait]
impl KvStore for GatedStore {
    async fn get(&self, key: &str) -> Result<Option<KvEntry>, StoreError> {
        self.inner.get(key).await
    }

    async fn put_atomic(&self, key: &str, value: &str, expected: u64) -> Result<u64, StoreError> {
        if key == self.key && expected == 0 {
            self.entered.notify_one();
            self.release.notified().await;
        }
        self.inner.put_atomic(key, value, expected).await
    }

    async fn delete_atomic(&self, key: &str, expected: u64) -> Result<(), StoreError> {
        self.inner.delete_atomic(key, expected).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<KvEntry>, StoreError> {
        self.inner.list(prefix).await
    }
}

fn create_request(id: &str, options: Value, pool: &str, gateway: &str) -> CreateNetworkRequest {
    CreateNetworkRequest {
        network_id: id.to_string(),
        options: options.as_object().cloned().unwrap_or_default(),
        ipv4_data: vec![IpamDataWire {
            pool: pool.to_string(),
            gateway: gateway.to_string(),
        }],
        ipv6_data: vec![],
    }
}

fn network_request(id: &str) -> NetworkRequest {
    NetworkRequest {
        network_id: id.to_string(),
    }
}

#[tokio::test]
async fn test_create_network_defaults_to_bridge() {
    let h = harness();

    h.driver
        .create_network(&create_request(
            "n1",
            json!({"parent": "eth0", "macvlan_mode": ""}),
            "192.168.1.0/24",
            "192.168.1.1",
        ))
        .await
        .unwrap();

    let network = h.driver.registry().get("n1").unwrap();
    assert_eq!(network.config().mode, MacvlanMode::Bridge);
    assert_eq!(network.config().parent, "eth0");
    assert!(!network.config().created_slave_link);
    assert!(network.is_provisioned());

    // persisted under the network-config prefix
    let entry = h
        .store
        .get(&format!("{}/n1", NETWORK_CONFIG_PREFIX))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.version, 1);
    assert_eq!(network.config().store_version, 1);
}

#[tokio::test]
async fn test_duplicate_parent_rejected() {
    let h = harness();
    h.driver
        .create_network(&create_request(
            "n1",
            json!({"parent": "eth0"}),
            "192.168.1.0/24",
            "192.168.1.1",
        ))
        .await
        .unwrap();

    let err = h
        .driver
        .create_network(&create_request(
            "n2",
            json!({"parent": "eth0"}),
            "192.168.3.0/24",
            "192.168.3.1",
        ))
        .await
        .unwrap_err();

    assert_eq!(
        err.to_string(),
        "network dm-n1 is already using parent interface eth0"
    );
    assert!(h.driver.registry().get("n2").is_none());
    assert_eq!(h.store.len(), 1);
}

#[tokio::test]
async fn test_allocate_rejects_default_route_pool() {
    let h = harness();

    let err = h
        .driver
        .allocate_network(&create_request(
            "n1",
            json!({"parent": "eth0"}),
            "0.0.0.0/0",
            "",
        ))
        .await
        .unwrap_err();

    assert_eq!(err.to_string(), "ipv4 pool is empty");
    assert!(h.driver.registry().is_empty());
}

#[tokio::test]
async fn test_allocate_then_create_replaces_allocation() {
    let h = harness();
    let req = create_request(
        "n1",
        json!({"com.docker.network.generic": {"parent": "eth1", "macvlan_mode": "private"}}),
        "10.10.0.0/16",
        "10.10.0.1",
    );

    let resp = h.driver.allocate_network(&req).await.unwrap();
    assert_eq!(resp.options, req.options);
    assert!(!h.driver.registry().get("n1").unwrap().is_provisioned());
    assert!(h.store.is_empty());

    // the allocation already claims the parent
    let err = h
        .driver
        .allocate_network(&create_request(
            "n2",
            json!({"parent": "eth1"}),
            "10.11.0.0/16",
            "",
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, DriverError::DuplicateParent { .. }));

    h.driver.create_network(&req).await.unwrap();
    let network = h.driver.registry().get("n1").unwrap();
    assert!(network.is_provisioned());
    assert_eq!(network.config().mode, MacvlanMode::Private);

    // creating the same id twice is rejected
    let err = h.driver.create_network(&req).await.unwrap_err();
    assert!(matches!(err, DriverError::NetworkExists(_)));
}

#[tokio::test]
async fn test_free_network() {
    let h = harness();
    let req = create_request("n1", json!({"parent": "eth0"}), "10.0.0.0/24", "");

    h.driver.allocate_network(&req).await.unwrap();
    h.driver.free_network(&network_request("n1")).await.unwrap();
    assert!(h.driver.registry().is_empty());

    // unknown ids are fine
    h.driver.free_network(&network_request("n1")).await.unwrap();

    // provisioned networks are left to delete
    h.driver.create_network(&req).await.unwrap();
    h.driver.free_network(&network_request("n1")).await.unwrap();
    assert!(h.driver.registry().contains("n1"));

    assert!(h.driver.free_network(&network_request("")).await.is_err());
}

#[tokio::test]
async fn test_internal_network_creates_dummy_parent() {
    let h = harness();

    h.driver
        .create_network(&create_request(
            "4fa2b6c1d3e5f7a9b1c3",
            json!({}),
            "172.30.0.0/24",
            "172.30.0.1",
        ))
        .await
        .unwrap();

    let network = h.driver.registry().get("4fa2b6c1d3e5f7a9b1c3").unwrap();
    assert_eq!(network.config().parent, "dm-4fa2b6c1d3e5");
    assert!(network.config().internal);
    assert!(network.config().created_slave_link);
    assert_eq!(h.links.kind("dm-4fa2b6c1d3e5"), Some(MockLinkKind::Dummy));

    h.driver
        .delete_network(&network_request("4fa2b6c1d3e5f7a9b1c3"))
        .await
        .unwrap();
    assert!(!h.links.contains("dm-4fa2b6c1d3e5"));
    assert!(h.store.is_empty());
}

#[tokio::test]
async fn test_vlan_parent_created_and_removed() {
    let h = harness();

    h.driver
        .create_network(&create_request(
            "n1",
            json!({"parent": "eth0.42"}),
            "10.42.0.0/24",
            "10.42.0.1",
        ))
        .await
        .unwrap();
    assert_eq!(
        h.links.kind("eth0.42"),
        Some(MockLinkKind::Vlan {
            parent: "eth0".to_string(),
            vlan_id: 42
        })
    );
    assert!(h.links.is_up("eth0.42"));

    h.driver.delete_network(&network_request("n1")).await.unwrap();
    assert!(!h.links.contains("eth0.42"));
    assert!(h.links.contains("eth0"));
}

#[tokio::test]
async fn test_existing_parent_is_not_removed() {
    let h = harness();
    h.driver
        .create_network(&create_request(
            "n1",
            json!({"parent": "eth1"}),
            "10.1.0.0/24",
            "",
        ))
        .await
        .unwrap();

    h.driver.delete_network(&network_request("n1")).await.unwrap();
    assert!(h.links.contains("eth1"));
}

#[tokio::test]
async fn test_missing_physical_parent() {
    let h = harness();
    let err = h
        .driver
        .create_network(&create_request(
            "n1",
            json!({"parent": "eth9.5"}),
            "10.9.0.0/24",
            "",
        ))
        .await
        .unwrap_err();

    assert_eq!(err.to_string(), "eth9 was not found on the host");
    assert!(h.driver.registry().is_empty());
    assert!(h.store.is_empty());
}

#[tokio::test]
async fn test_store_failure_rolls_back_parent_link() {
    let h = harness();
    h.store.set_available(false);

    let err = h
        .driver
        .create_network(&create_request(
            "n1",
            json!({"parent": "eth0.7"}),
            "10.7.0.0/24",
            "",
        ))
        .await
        .unwrap_err();

    assert!(matches!(err, DriverError::Store { .. }));
    assert!(!h.links.contains("eth0.7"));
    assert!(h.driver.registry().is_empty());
}

#[tokio::test]
async fn test_invalid_options_rejected() {
    let h = harness();

    let err = h
        .driver
        .create_network(&create_request(
            "n1",
            json!({"parent": "eth0", "macvlan_mode": "l3"}),
            "10.0.0.0/24",
            "",
        ))
        .await
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "requested macvlan mode 'l3' is not valid, 'bridge' mode is the macvlan driver default"
    );

    let err = h
        .driver
        .create_network(&create_request(
            "n1",
            json!({"parent": "lo"}),
            "10.0.0.0/24",
            "",
        ))
        .await
        .unwrap_err();
    assert!(err.is_invalid_request());

    let err = h
        .driver
        .create_network(&create_request(
            "n1",
            json!({"parent": "eth0.5000"}),
            "10.0.0.0/24",
            "",
        ))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("vlan id must be between 1-4094"));

    let err = h
        .driver
        .create_network(&create_request(
            "n1",
            json!({"parent": "eth3"}),
            "10.0.0.0/24",
            "",
        ))
        .await
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "invalid subinterface vlan name eth3, example formatting is eth0.10"
    );

    assert!(h.links.names().len() == 2);
    assert!(h.driver.registry().is_empty());
}

#[tokio::test]
async fn test_delete_network_is_idempotent() {
    let h = harness();
    h.driver
        .create_network(&create_request(
            "n1",
            json!({"parent": "eth0"}),
            "10.0.0.0/24",
            "",
        ))
        .await
        .unwrap();

    h.driver.delete_network(&network_request("n1")).await.unwrap();
    h.driver.delete_network(&network_request("n1")).await.unwrap();
    h.driver.delete_network(&network_request("never")).await.unwrap();

    assert!(h.driver.registry().is_empty());
    assert!(h.store.is_empty());

    let err = h
        .driver
        .delete_network(&network_request(""))
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "invalid network id");
}

#[tokio::test]
async fn test_parent_reusable_after_delete() {
    let h = harness();
    let first = create_request("n1", json!({"parent": "eth0"}), "10.0.0.0/24", "");
    let second = create_request("n2", json!({"parent": "eth0"}), "10.0.1.0/24", "");

    h.driver.create_network(&first).await.unwrap();
    h.driver.delete_network(&network_request("n1")).await.unwrap();
    h.driver.create_network(&second).await.unwrap();

    assert!(h.driver.registry().contains("n2"));
}

#[tokio::test]
async fn test_concurrent_creates_on_one_parent() {
    let h = Arc::new(harness());

    let mut handles = Vec::new();
    for i in 0..8 {
        let h = h.clone();
        handles.push(tokio::spawn(async move {
            h.driver
                .create_network(&create_request(
                    &format!("n{}", i),
                    json!({"parent": "eth0"}),
                    &format!("10.{}.0.0/24", i),
                    "",
                ))
                .await
        }));
    }

    let mut succeeded = 0;
    for handle in handles {
        if handle.await.unwrap().is_ok() {
            succeeded += 1;
        }
    }

    assert_eq!(succeeded, 1);
    assert_eq!(h.driver.registry().len(), 1);
    assert_eq!(h.store.len(), 1);
}

#[tokio::test]
async fn test_contended_vlan_parent_survives() {
    let store = Arc::new(GatedStore::new(&format!("{}/nA", NETWORK_CONFIG_PREFIX)));
    let links = Arc::new(MockLinks::with_host_links(["eth0"]));
    let driver = Arc::new(Driver::new(
        store.clone(),
        links.clone(),
        Arc::new(StaticOrchestrator::new()),
        RetryPolicy::default(),
    ));

    // nA creates eth0.10 and stalls while persisting
    let first = {
        let driver = driver.clone();
        tokio::spawn(async move {
            driver
                .create_network(&create_request(
                    "nA",
                    json!({"parent": "eth0.10"}),
                    "10.1.0.0/24",
                    "",
                ))
                .await
        })
    };
    store.entered.notified().await;
    assert!(links.contains("eth0.10"));

    let err = driver
        .create_network(&create_request(
            "nB",
            json!({"parent": "eth0.10"}),
            "10.2.0.0/24",
            "",
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, DriverError::DuplicateParent { .. }));
    assert!(links.contains("eth0.10"));

    store.release.notify_one();
    first.await.unwrap().unwrap();

    let network = driver.registry().get("nA").unwrap();
    assert!(network.config().created_slave_link);
    assert!(!driver.registry().contains("nB"));
    assert!(links.contains("eth0.10"));
    assert_eq!(store.inner.len(), 1);

    driver.delete_network(&network_request("nA")).await.unwrap();
    assert!(!links.contains("eth0.10"));
}

#[tokio::test]
async fn test_failed_create_restores_allocation() {
    let h = harness();
    let req = create_request("n1", json!({"parent": "eth0.30"}), "10.0.0.0/24", "");
    h.driver.allocate_network(&req).await.unwrap();

    h.links.fail_create("eth0.30");
    assert!(h.driver.create_network(&req).await.is_err());

    // the allocation still holds the parent
    let network = h.driver.registry().get("n1").unwrap();
    assert!(!network.is_provisioned());
    let other = create_request("n2", json!({"parent": "eth0.30"}), "10.0.1.0/24", "");
    assert!(matches!(
        h.driver.create_network(&other).await,
        Err(DriverError::DuplicateParent { .. })
    ));
}

#[test]
fn test_capabilities() {
    let h = harness();
    let caps = h.driver.capabilities();
    assert_eq!(
        serde_json::to_value(&caps).unwrap(),
        json!({"Scope": "global", "ConnectivityScope": "global"})
    );
    assert_eq!(h.driver.name(), "macvlan");
}
