//! Listener and upstream addressing.
//!
//! The configuration grammar is `tcp://<ip>:<port>` with `0.0.0.0` as the
//! wildcard; internally an address is a thin wrapper over `SocketAddr`.

use serde::Deserialize;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("malformed url '{0}', expected tcp://<ip>:<port>")]
    MalformedUrl(String),
}

/// A resolved TCP address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address(SocketAddr);

impl Address {
    pub fn new(addr: SocketAddr) -> Address {
        Address(addr)
    }

    /// Parse the `tcp://<ip>:<port>` grammar.
    pub fn resolve_url(url: &str) -> Result<Address, AddressError> {
        let rest = url
            .strip_prefix("tcp://")
            .ok_or_else(|| AddressError::MalformedUrl(url.to_string()))?;
        let addr = SocketAddr::from_str(rest)
            .map_err(|_| AddressError::MalformedUrl(url.to_string()))?;
        Ok(Address(addr))
    }

    pub fn socket_addr(&self) -> SocketAddr {
        self.0
    }

    pub fn ip(&self) -> IpAddr {
        self.0.ip()
    }

    pub fn port(&self) -> u16 {
        self.0.port()
    }

    /// True for the `0.0.0.0` catch-all.
    pub fn is_wildcard(&self) -> bool {
        self.0.ip() == IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    }

    /// Full url form, `tcp://<ip>:<port>`.
    pub fn as_url(&self) -> String {
        format!("tcp://{}", self.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Address {
        Address(addr)
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let url = String::deserialize(deserializer)?;
        Address::resolve_url(&url).map_err(serde::de::Error::custom)
    }
}
