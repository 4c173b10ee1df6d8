//! Kernel link management.
//!
//! - `link`: the primitive operations ([`LinkOps`]) and their backends
//! - `provision`: parent/endpoint link lifecycle on top of them

mod link;
mod provision;

pub use link::{IpLinkOps, LinkError, LinkOps, MockLinkKind, MockLinks};
pub use provision::{
    parse_vlan_name, LinkProvisioner, NameGenerator, ENDPOINT_LINK_PREFIX,
    ENDPOINT_LINK_RANDOM_LEN, NAME_ATTEMPTS,
};
