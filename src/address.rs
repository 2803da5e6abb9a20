//! Canonical host addresses.
//!
//! Every address is parsed and normalized exactly once, when it enters the
//! process. From then on the canonical string is the only key used by the
//! stores, the address set and the state dump.

use crate::error::{JailError, Result};
use ipnet::IpNet;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

/// Canonical string form of a single host address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(String);

impl Address {
    /// Parse a textual host address. CIDR ranges are rejected.
    pub fn parse(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        if trimmed.contains('/') {
            return Err(JailError::validation("address", s));
        }
        trimmed
            .parse::<IpAddr>()
            .map(Self::from_ip)
            .map_err(|_| JailError::validation("address", s))
    }

    /// Build from an already parsed IP. IPv4-mapped IPv6 collapses to IPv4.
    pub fn from_ip(ip: IpAddr) -> Self {
        Self(ip.to_canonical().to_string())
    }

    /// Parse an entry of the external address set.
    ///
    /// Returns `Ok(None)` for a valid range, which is not a host.
    pub fn from_set_entry(entry: &str) -> Result<Option<Self>> {
        let entry = entry.trim();
        if let Ok(net) = entry.parse::<IpNet>() {
            return Ok((net.prefix_len() == net.max_prefix_len()).then(|| Self::from_ip(net.addr())));
        }
        Self::parse(entry).map(Some)
    }

    /// The entry written to the external address set (`/32` or `/128`).
    pub fn to_set_entry(&self) -> String {
        let prefix = if self.is_ipv6() { 128 } else { 32 };
        format!("{}/{}", self.0, prefix)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn is_ipv6(&self) -> bool {
        self.0.contains(':')
    }
}

impl FromStr for Address {
    type Err = JailError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Address {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_canonicalizes() {
        assert_eq!(Address::parse(" 10.0.0.1 ").unwrap().as_str(), "10.0.0.1");
        assert_eq!(
            Address::parse("2001:0db8:0000::0001").unwrap().as_str(),
            "2001:db8::1"
        );
        assert_eq!(
            Address::parse("::ffff:192.168.1.1").unwrap().as_str(),
            "192.168.1.1"
        );
    }

    #[test]
    fn test_parse_rejects_ranges_and_garbage() {
        assert!(Address::parse("10.0.0.0/8").is_err());
        assert!(Address::parse("10.0.0.1/32").is_err());
        assert!(Address::parse("not-an-ip").is_err());
        assert!(Address::parse("").is_err());
    }

    #[test]
    fn test_equal_addresses_share_a_key() {
        let a = Address::parse("2001:db8::1").unwrap();
        let b = Address::parse("2001:DB8:0:0::1").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_set_entries() {
        let v4 = Address::parse("10.0.0.1").unwrap();
        assert_eq!(v4.to_set_entry(), "10.0.0.1/32");
        let v6 = Address::parse("2001:db8::1").unwrap();
        assert_eq!(v6.to_set_entry(), "2001:db8::1/128");

        assert_eq!(Address::from_set_entry("10.0.0.1/32").unwrap(), Some(v4.clone()));
        assert_eq!(Address::from_set_entry("10.0.0.1").unwrap(), Some(v4));
        assert_eq!(Address::from_set_entry("2001:db8::1/128").unwrap(), Some(v6));
        assert_eq!(Address::from_set_entry("10.0.0.0/24").unwrap(), None);
        assert!(Address::from_set_entry("garbage/32").is_err());
    }
}
