//! Id and address pair, with the BEP 5 compact encodings.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use super::{Id, ID_SIZE};

/// 26 bytes: 20 byte id + 4 byte ip + 2 byte port.
const COMPACT_V4_LEN: usize = ID_SIZE + 6;
/// 38 bytes: 20 byte id + 16 byte ip + 2 byte port.
const COMPACT_V6_LEN: usize = ID_SIZE + 18;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// A DHT contact as carried in find-node responses.
pub struct Node {
    pub id: Id,
    pub address: SocketAddr,
}

impl Node {
    pub fn new(id: Id, address: SocketAddr) -> Self {
        Self { id, address }
    }

    /// Appends this node's compact form to `out`. v4 contacts belong in
    /// `nodes`, v6 contacts in `nodes6`; callers split by family first.
    pub fn encode_compact(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.id.as_bytes());
        match self.address.ip() {
            IpAddr::V4(ip) => out.extend_from_slice(&ip.octets()),
            IpAddr::V6(ip) => out.extend_from_slice(&ip.octets()),
        }
        out.extend_from_slice(&self.address.port().to_be_bytes());
    }
}

/// Decodes a concatenation of 26-byte v4 contacts. Trailing partial entries
/// are dropped, matching how remote implementations are treated leniently.
pub fn decode_compact_v4(bytes: &[u8]) -> Vec<Node> {
    bytes
        .chunks_exact(COMPACT_V4_LEN)
        .filter_map(|chunk| {
            let id = Id::from_bytes(&chunk[..ID_SIZE]).ok()?;
            let ip: [u8; 4] = chunk[ID_SIZE..ID_SIZE + 4].try_into().ok()?;
            let port = u16::from_be_bytes([chunk[ID_SIZE + 4], chunk[ID_SIZE + 5]]);
            Some(Node::new(
                id,
                SocketAddr::new(IpAddr::V4(Ipv4Addr::from(ip)), port),
            ))
        })
        .collect()
}

/// Decodes a concatenation of 38-byte v6 contacts.
pub fn decode_compact_v6(bytes: &[u8]) -> Vec<Node> {
    bytes
        .chunks_exact(COMPACT_V6_LEN)
        .filter_map(|chunk| {
            let id = Id::from_bytes(&chunk[..ID_SIZE]).ok()?;
            let ip: [u8; 16] = chunk[ID_SIZE..ID_SIZE + 16].try_into().ok()?;
            let port = u16::from_be_bytes([chunk[ID_SIZE + 16], chunk[ID_SIZE + 17]]);
            Some(Node::new(
                id,
                SocketAddr::new(IpAddr::V6(Ipv6Addr::from(ip)), port),
            ))
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn compact_v4() {
        let node = Node::new(Id::random(), "203.0.113.7:6881".parse().unwrap());

        let mut buf = Vec::new();
        node.encode_compact(&mut buf);
        assert_eq!(buf.len(), COMPACT_V4_LEN);

        let decoded = decode_compact_v4(&buf);
        assert_eq!(decoded, vec![node]);
    }

    #[test]
    fn compact_v6() {
        let node = Node::new(Id::random(), "[2001:db8::1]:6881".parse().unwrap());

        let mut buf = Vec::new();
        node.encode_compact(&mut buf);
        assert_eq!(buf.len(), COMPACT_V6_LEN);

        let decoded = decode_compact_v6(&buf);
        assert_eq!(decoded, vec![node]);
    }

    #[test]
    fn truncated_tail_dropped() {
        let node = Node::new(Id::random(), "203.0.113.7:6881".parse().unwrap());
        let mut buf = Vec::new();
        node.encode_compact(&mut buf);
        buf.extend_from_slice(&[1, 2, 3]);

        assert_eq!(decode_compact_v4(&buf).len(), 1);
    }
}
