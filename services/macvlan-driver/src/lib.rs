//! Macvlan network driver.
//!
//! Lets containers attach directly to a host's physical network by giving
//! each endpoint its own macvlan link on a shared parent interface.
//!
//! ## Architecture
//!
//! ```text
//! Driver
//! ├── Registry          (live networks, each with its endpoint table)
//! ├── RecordStore       (versioned persistence over a KvStore)
//! ├── LinkProvisioner   (parent and endpoint links over LinkOps)
//! └── Orchestrator      (lookup of networks this node never created)
//! ```
//!
//! ## Modules
//!
//! - `model`: network/endpoint types and option validation
//! - `state`: key-value store backends and record encoding
//! - `network`: kernel link operations and provisioning
//! - `registry`: in-memory network registry
//! - `orchestrator`: fallback network lookup
//! - `driver`: the driver operations

pub mod api;
pub mod config;
pub mod driver;
pub mod error;
pub mod model;
pub mod network;
pub mod orchestrator;
pub mod registry;
pub mod state;

// Re-export commonly used types
pub use driver::{BootstrapReport, Driver};
pub use error::DriverError;
pub use network::{IpLinkOps, MockLinks};
pub use orchestrator::{StaticOrchestrator, SwarmClient};
pub use state::{MemoryStore, RetryPolicy, SqliteStore};
