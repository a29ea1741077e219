//! Address classification helpers.

use std::net::IpAddr;

/// Whether `ip` is routable on the public internet. Peers reporting our
/// external address from anything else are not credible voters, and a locally
/// bound non-unicast address is not worth publishing.
pub fn is_global_unicast(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            !(v4.is_unspecified()
                || v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_multicast()
                || v4.is_broadcast())
        }
        IpAddr::V6(v6) => {
            !(v6.is_unspecified()
                || v6.is_loopback()
                || v6.is_multicast()
                // fe80::/10 link local
                || (v6.segments()[0] & 0xffc0) == 0xfe80
                // fc00::/7 unique local
                || (v6.segments()[0] & 0xfe00) == 0xfc00
                // ::ffff:0:0/96 v4-mapped
                || v6.to_ipv4_mapped().is_some())
        }
    }
}
