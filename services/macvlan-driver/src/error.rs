//! Driver error type.

use mvlan_networking::Family;
use thiserror::Error;

use crate::model::ConfigError;
use crate::network::LinkError;
use crate::state::StoreError;

/// Errors returned by driver operations.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("invalid endpoint id")]
    InvalidEndpointId,

    #[error("create endpoint was not passed interface IP address")]
    MissingIpv4Address,

    #[error("invalid {family} address '{value}'")]
    InvalidAddress { family: Family, value: String },

    #[error("invalid MAC address '{0}'")]
    InvalidMac(String),

    #[error("network {network} is already using parent interface {parent}")]
    DuplicateParent { network: String, parent: String },

    #[error("network {0} already exists")]
    NetworkExists(String),

    #[error("network id {0} not found")]
    NetworkNotFound(String),

    #[error("endpoint {0} already exists")]
    EndpointExists(String),

    #[error("endpoint id {0} not found")]
    EndpointNotFound(String),

    #[error("no valid {family} subnet for endpoint {endpoint}")]
    NoMatchingSubnet { family: Family, endpoint: String },

    #[error("gateway '{gateway}' is not a valid {family} address")]
    InvalidGateway { family: Family, gateway: String },

    #[error(transparent)]
    Link(#[from] LinkError),

    #[error("failed to persist {kind} {id}: {source}")]
    Store {
        kind: &'static str,
        id: String,
        #[source]
        source: StoreError,
    },
}

impl DriverError {
    /// Wrap a store error with the record it concerns.
    pub fn store(kind: &'static str, id: impl Into<String>, source: StoreError) -> Self {
        Self::Store {
            kind,
            id: id.into(),
            source,
        }
    }

    /// The referenced network or endpoint does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NetworkNotFound(_) | Self::EndpointNotFound(_))
    }

    /// The request itself was malformed or conflicts with existing state.
    pub fn is_invalid_request(&self) -> bool {
        matches!(
            self,
            Self::Config(_)
                | Self::InvalidEndpointId
                | Self::MissingIpv4Address
                | Self::InvalidAddress { .. }
                | Self::InvalidMac(_)
                | Self::DuplicateParent { .. }
                | Self::NetworkExists(_)
                | Self::EndpointExists(_)
        )
    }
}
