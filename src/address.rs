//! Network addresses and unique identifiers.

use std::fmt;
use std::net::Ipv4Addr;

/// A 128-bit unique identifier, drawn from the simulation RNG.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UID {
    /// First 64 bits.
    pub first: u64,
    /// Second 64 bits.
    pub second: u64,
}

impl UID {
    /// Create a UID with explicit values.
    pub const fn new(first: u64, second: u64) -> Self {
        Self { first, second }
    }
}

impl fmt::Display for UID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}{:016x}", self.first, self.second)
    }
}

/// A normalized process network address: IPv4 address, port, TLS flag.
///
/// Addresses are hashable and totally ordered so they can key the address
/// map and the protected-address set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NetworkAddress {
    /// IPv4 address of the interface.
    pub ip: Ipv4Addr,
    /// TCP port. Port 0 is reserved for hidden machine processes.
    pub port: u16,
    /// Whether the endpoint expects TLS. The simulator does not implement
    /// TLS; connect asserts this flag is unset.
    pub tls: bool,
}

impl NetworkAddress {
    /// Create a plaintext address.
    pub const fn new(ip: Ipv4Addr, port: u16) -> Self {
        Self {
            ip,
            port,
            tls: false,
        }
    }

    /// The canonical form used as the address-map key.
    pub fn normalized(&self) -> Self {
        Self {
            ip: self.ip,
            port: self.port,
            tls: false,
        }
    }

    /// Build an address from a raw IPv4 value, wrapping on overflow.
    ///
    /// Used to synthesize ephemeral accept-side addresses near a real one.
    pub fn from_raw_ip(raw: u32, port: u16) -> Self {
        Self::new(Ipv4Addr::from(raw), port)
    }

    /// The raw IPv4 value, for address arithmetic.
    pub fn raw_ip(&self) -> u32 {
        u32::from(self.ip)
    }
}

impl fmt::Display for NetworkAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)?;
        if self.tls {
            write!(f, ":tls")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_formats() {
        let addr = NetworkAddress::new(Ipv4Addr::new(10, 0, 0, 1), 4500);
        assert_eq!(addr.to_string(), "10.0.0.1:4500");
        assert_eq!(UID::new(1, 2).to_string().len(), 32);
    }

    #[test]
    fn raw_ip_round_trip() {
        let addr = NetworkAddress::new(Ipv4Addr::new(10, 0, 0, 1), 1);
        let shifted = NetworkAddress::from_raw_ip(addr.raw_ip() + 5, 40000);
        assert_eq!(shifted.ip, Ipv4Addr::new(10, 0, 0, 6));
    }

    #[test]
    fn normalized_strips_tls() {
        let mut addr = NetworkAddress::new(Ipv4Addr::LOCALHOST, 1);
        addr.tls = true;
        assert!(!addr.normalized().tls);
    }
}
