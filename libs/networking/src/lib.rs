//! Networking utilities for the macvlan driver.
//!
//! This library provides helpers for:
//! - CIDR parsing and subnet membership for both address families
//! - Locally administered MAC address derivation
//! - Kernel interface naming (random names, truncated display ids)
//!
//! Nothing in here touches the kernel; callers decide what to do with the
//! values.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use rand::RngCore;
use thiserror::Error;

/// Networking errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NetworkError {
    /// Invalid IP address.
    #[error("invalid IP address: {0}")]
    InvalidAddress(String),

    /// Invalid CIDR prefix.
    #[error("invalid CIDR prefix: {0}")]
    InvalidPrefix(String),

    /// Invalid MAC address.
    #[error("invalid MAC address: {0}")]
    InvalidMac(String),
}

// ============================================================================
// CIDR
// ============================================================================

/// Address family of an address or prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    V4,
    V6,
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Family::V4 => write!(f, "ipv4"),
            Family::V6 => write!(f, "ipv6"),
        }
    }
}

/// An address qualified by a prefix length (e.g. `192.168.2.2/24`).
///
/// The host bits are preserved, so the same type describes both an
/// interface address and a subnet. Use [`IpNet::network`] to get the
/// masked form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IpNet {
    addr: IpAddr,
    prefix_len: u8,
}

impl IpNet {
    /// Create a new address/prefix pair.
    pub fn new(addr: IpAddr, prefix_len: u8) -> Result<Self, NetworkError> {
        let max = max_prefix_len(addr);
        if prefix_len > max {
            return Err(NetworkError::InvalidPrefix(format!(
                "prefix length {} exceeds {}",
                prefix_len, max
            )));
        }

        Ok(Self { addr, prefix_len })
    }

    /// Parse from CIDR notation (e.g. "10.0.0.0/8" or "2001:db8::1/64").
    pub fn parse(s: &str) -> Result<Self, NetworkError> {
        let Some((addr_str, prefix_str)) = s.split_once('/') else {
            return Err(NetworkError::InvalidPrefix(format!(
                "missing '/' in CIDR: {}",
                s
            )));
        };

        let addr = IpAddr::from_str(addr_str)
            .map_err(|_| NetworkError::InvalidAddress(addr_str.to_string()))?;

        let prefix_len = prefix_str
            .parse::<u8>()
            .map_err(|_| NetworkError::InvalidPrefix(prefix_str.to_string()))?;

        Self::new(addr, prefix_len)
    }

    /// The address, host bits included.
    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    /// Prefix length.
    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    /// Address family. IPv4-mapped IPv6 addresses count as IPv4.
    pub fn family(&self) -> Family {
        match self.addr {
            IpAddr::V4(_) => Family::V4,
            IpAddr::V6(v6) if v6.to_ipv4_mapped().is_some() => Family::V4,
            IpAddr::V6(_) => Family::V6,
        }
    }

    /// The subnet this address belongs to, host bits cleared.
    pub fn network(&self) -> IpNet {
        Self {
            addr: mask(self.addr, self.prefix_len),
            prefix_len: self.prefix_len,
        }
    }

    /// Check if an address is within this prefix.
    ///
    /// Addresses of the other family are never contained.
    pub fn contains(&self, addr: IpAddr) -> bool {
        match (self.addr, addr) {
            (IpAddr::V4(_), IpAddr::V4(_)) | (IpAddr::V6(_), IpAddr::V6(_)) => {
                mask(addr, self.prefix_len) == mask(self.addr, self.prefix_len)
            }
            _ => false,
        }
    }

    /// True for the all-zero, zero-length prefix (`0.0.0.0/0` or `::/0`).
    pub fn is_unspecified(&self) -> bool {
        self.prefix_len == 0 && self.addr.is_unspecified()
    }
}

impl fmt::Display for IpNet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix_len)
    }
}

impl FromStr for IpNet {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn max_prefix_len(addr: IpAddr) -> u8 {
    match addr {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

/// Mask an address to a prefix length.
fn mask(addr: IpAddr, prefix_len: u8) -> IpAddr {
    match addr {
        IpAddr::V4(v4) => {
            let bits = u32::from_be_bytes(v4.octets());
            let mask = if prefix_len == 0 {
                0
            } else {
                u32::MAX << (32 - u32::from(prefix_len.min(32)))
            };
            IpAddr::V4(Ipv4Addr::from(bits & mask))
        }
        IpAddr::V6(v6) => {
            let bits = u128::from_be_bytes(v6.octets());
            let mask = if prefix_len == 0 {
                0
            } else {
                u128::MAX << (128 - u32::from(prefix_len.min(128)))
            };
            IpAddr::V6(Ipv6Addr::from(bits & mask))
        }
    }
}

/// Parse a gateway that may or may not carry a prefix length.
///
/// IPAM drivers hand out gateways as `192.168.1.1/24`, users tend to
/// write `192.168.1.1`; both resolve to the bare address.
pub fn parse_gateway(s: &str) -> Result<IpAddr, NetworkError> {
    if s.contains('/') {
        return IpNet::parse(s).map(|net| net.addr());
    }
    IpAddr::from_str(s).map_err(|_| NetworkError::InvalidAddress(s.to_string()))
}

// ============================================================================
// MAC addresses
// ============================================================================

/// 48-bit hardware address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    /// Build from raw octets.
    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    /// Raw octets.
    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}

impl FromStr for MacAddress {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let sep = if s.contains('-') { '-' } else { ':' };
        let mut octets = [0u8; 6];
        let mut count = 0;

        for part in s.split(sep) {
            if count == 6 || part.len() != 2 {
                return Err(NetworkError::InvalidMac(s.to_string()));
            }
            octets[count] =
                u8::from_str_radix(part, 16).map_err(|_| NetworkError::InvalidMac(s.to_string()))?;
            count += 1;
        }

        if count != 6 {
            return Err(NetworkError::InvalidMac(s.to_string()));
        }

        Ok(Self(octets))
    }
}

/// First two octets of every generated MAC.
///
/// `0x02` marks the address unicast and locally administered.
const LOCAL_MAC_PREFIX: [u8; 2] = [0x02, 0x42];

/// Derive a locally administered MAC whose last four octets are the IPv4
/// address, e.g. `192.168.2.2` becomes `02:42:c0:a8:02:02`.
pub fn mac_from_ipv4(ip: Ipv4Addr) -> MacAddress {
    let o = ip.octets();
    MacAddress([LOCAL_MAC_PREFIX[0], LOCAL_MAC_PREFIX[1], o[0], o[1], o[2], o[3]])
}

// ============================================================================
// Interface naming
// ============================================================================

/// Kernel interface name buffer size, including the trailing NUL.
pub const IFNAMSIZ: usize = 16;

/// Length of the shortened id used in display and link names.
pub const SHORT_ID_LEN: usize = 12;

/// Generate `prefix` followed by `len` random hex characters.
///
/// The result is not checked against existing links; callers retry on
/// collision.
pub fn random_ifname(prefix: &str, len: usize) -> String {
    let mut id = [0u8; 32];
    rand::rng().fill_bytes(&mut id);
    let encoded = hex::encode(id);
    format!("{}{}", prefix, &encoded[..len.min(encoded.len())])
}

/// Shorten an id to its display form (first 12 characters).
pub fn truncate_id(id: &str) -> &str {
    match id.char_indices().nth(SHORT_ID_LEN) {
        Some((idx, _)) => &id[..idx],
        None => id,
    }
}

/// Check that a name fits the kernel interface name limit.
pub fn is_valid_ifname(name: &str) -> bool {
    !name.is_empty()
        && name.len() < IFNAMSIZ
        && !name.contains('/')
        && !name.chars().any(char::is_whitespace)
}
