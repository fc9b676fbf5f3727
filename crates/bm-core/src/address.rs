//! Network address records.
//!
//! Addresses are carried in two layouts:
//!
//! ```text
//! short (version message, 26 bytes): services u64 | ipv6 [16] | port u16
//! full  (addr message, 38 bytes):    time u64 | stream u32 | short
//! ```
//!
//! IPv4 addresses are carried as IPv4-mapped IPv6.

use crate::encoding::ensure_remaining;
use crate::CoreResult;
use bytes::{Buf, BufMut};
use std::fmt;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};

/// Service bit for a node that relays objects.
pub const NODE_NETWORK_SERVICE: u64 = 1;

/// A peer address with its advertised metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NetworkAddress {
    /// Unix time the address was last seen.
    pub time: u64,
    /// Stream the node serves.
    pub stream: u32,
    /// Service bitfield.
    pub services: u64,
    /// IPv6 (or IPv4-mapped) address.
    pub ip: Ipv6Addr,
    /// TCP port.
    pub port: u16,
}

impl NetworkAddress {
    /// Size of the short layout.
    pub const SHORT_SIZE: usize = 26;
    /// Size of the full layout.
    pub const FULL_SIZE: usize = 38;

    /// Create from a socket address.
    pub fn from_socket_addr(addr: SocketAddr, stream: u32, services: u64, time: u64) -> Self {
        let ip = match addr.ip() {
            IpAddr::V4(v4) => v4.to_ipv6_mapped(),
            IpAddr::V6(v6) => v6,
        };
        Self {
            time,
            stream,
            services,
            ip,
            port: addr.port(),
        }
    }

    /// Socket address, unmapping IPv4-mapped addresses.
    pub fn socket_addr(&self) -> SocketAddr {
        let ip = match self.ip.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(self.ip),
        };
        SocketAddr::new(ip, self.port)
    }

    /// Whether two records name the same endpoint.
    pub fn same_endpoint(&self, other: &Self) -> bool {
        self.ip == other.ip && self.port == other.port
    }

    /// Write the 26-byte layout used inside `version`.
    pub fn write_short(&self, buf: &mut impl BufMut) {
        buf.put_u64(self.services);
        buf.put_slice(&self.ip.octets());
        buf.put_u16(self.port);
    }

    /// Read the 26-byte layout. Time and stream are left at zero.
    pub fn read_short(buf: &mut impl Buf) -> CoreResult<Self> {
        ensure_remaining(buf, Self::SHORT_SIZE, "network address")?;
        let services = buf.get_u64();
        let mut octets = [0u8; 16];
        buf.copy_to_slice(&mut octets);
        let port = buf.get_u16();
        Ok(Self {
            time: 0,
            stream: 0,
            services,
            ip: Ipv6Addr::from(octets),
            port,
        })
    }

    /// Write the 38-byte layout used inside `addr`.
    pub fn write_full(&self, buf: &mut impl BufMut) {
        buf.put_u64(self.time);
        buf.put_u32(self.stream);
        self.write_short(buf);
    }

    /// Read the 38-byte layout.
    pub fn read_full(buf: &mut impl Buf) -> CoreResult<Self> {
        ensure_remaining(buf, Self::FULL_SIZE, "network address")?;
        let time = buf.get_u64();
        let stream = buf.get_u32();
        let short = Self::read_short(buf)?;
        Ok(Self {
            time,
            stream,
            ..short
        })
    }
}

impl fmt::Display for NetworkAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (stream {})", self.socket_addr(), self.stream)
    }
}
