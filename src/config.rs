use std::{
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    time::Duration,
};

/// Transaction ids are six random bytes, generated by this server.
pub const MTID_LENGTH: usize = 6;

/// Ceiling on concurrently in-flight RPC calls (default, see [Config::max_active_calls]).
pub const MAX_ACTIVE_CALLS: usize = 256;

/// Read-loop buffer; larger than any packet either family will deliver.
pub const RECEIVE_BUFFER_SIZE: usize = 2048;

/// OS-level UDP socket buffers, both directions.
pub const UDP_SOCKET_BUFFER_SIZE: i32 = 2 * 1024 * 1024; // 2MB

/// How long without any inbound datagram before the server considers itself unreachable.
pub const REACHABILITY_TIMEOUT: Duration = Duration::from_secs(60);

/// Responses that match no pending call are answered with an error only after
/// this much uptime; earlier they are residue of a previous run and dropped.
pub const DEFAULT_STRAY_REPLY_GRACE: Duration = Duration::from_secs(2 * 60);

/// The address family a server instance binds and speaks. Two instances may
/// coexist, one per family, sharing the reactor, scheduler and DHT layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    Ipv4,
    Ipv6,
}

impl AddressFamily {
    /// Upper bound on encoded packet size for this family.
    pub fn max_packet_size(&self) -> usize {
        match self {
            AddressFamily::Ipv4 => 1500,
            AddressFamily::Ipv6 => 1280,
        }
    }

    /// IP + UDP header overhead, counted into byte statistics.
    pub fn header_length(&self) -> usize {
        match self {
            AddressFamily::Ipv4 => 20 + 8,
            AddressFamily::Ipv6 => 40 + 8,
        }
    }

    /// The unspecified address of this family, used when no bind address is configured.
    pub fn unspecified(&self) -> IpAddr {
        match self {
            AddressFamily::Ipv4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            AddressFamily::Ipv6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        }
    }

    pub fn matches(&self, ip: &IpAddr) -> bool {
        matches!(
            (self, ip),
            (AddressFamily::Ipv4, IpAddr::V4(_)) | (AddressFamily::Ipv6, IpAddr::V6(_))
        )
    }
}

#[derive(Debug, Clone)]
/// Rpc server configurations
pub struct Config {
    /// Address family this instance speaks.
    pub family: AddressFamily,
    /// Local address to bind, defaults to the family's unspecified address.
    pub bind_address: Option<IpAddr>,
    /// Explicit port to listen on.
    ///
    /// Defaults to None, where the OS picks a free port.
    pub port: Option<u16>,
    /// Ceiling on concurrently in-flight calls; excess calls queue until slots free up.
    ///
    /// Defaults to [MAX_ACTIVE_CALLS]
    pub max_active_calls: usize,
    /// Uptime below which unmatched responses are dropped silently instead of
    /// answered with an error.
    ///
    /// Defaults to [DEFAULT_STRAY_REPLY_GRACE]
    pub stray_reply_grace: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            family: AddressFamily::Ipv4,
            bind_address: None,
            port: None,
            max_active_calls: MAX_ACTIVE_CALLS,
            stray_reply_grace: DEFAULT_STRAY_REPLY_GRACE,
        }
    }
}
