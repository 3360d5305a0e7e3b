//! Cluster member addressing.
//!
//! An [`Address`] binds a member's Raft ID to its network identity: the
//! stable p2p public key, an IPv4 address, and the p2p port. Addresses are
//! carried *inside* Raft config-change entries (as the `context` payload),
//! so every replica, including any future replay of the log, learns a new
//! member's wire location deterministically.

use std::fmt;
use std::net::Ipv4Addr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{RaftError, RaftResult};

/// Raft ID of a cluster member. 1-based in initial clusters; assigned by the
/// operator for later joins.
pub type RaftId = u16;

/// Default base for the Raft HTTP transport; a member listens on
/// `base + raft_id`.
pub const DEFAULT_RAFT_PORT_BASE: u16 = 50400;

/// The HTTP transport port for a member.
pub fn raft_port(base: u16, raft_id: RaftId) -> u16 {
    base + raft_id
}

/// A peer's stable cryptographic identity: the 64-byte devp2p public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub [u8; 64]);

impl NodeId {
    /// Parse from 128 hex characters.
    pub fn from_hex(s: &str) -> RaftResult<Self> {
        let bytes =
            hex::decode(s).map_err(|_| RaftError::BadAddress(format!("invalid node id: {s}")))?;
        let arr: [u8; 64] = bytes
            .try_into()
            .map_err(|_| RaftError::BadAddress("node id must be 64 bytes".into()))?;
        Ok(NodeId(arr))
    }

    /// Hex-encode the full identity.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form for logs; `to_hex` gives the full identity.
        write!(f, "{}", &self.to_hex()[..12])
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.to_hex())
    }
}

impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_hex())
        } else {
            serializer.serialize_bytes(&self.0)
        }
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            NodeId::from_hex(&s).map_err(serde::de::Error::custom)
        } else {
            let bytes = <Vec<u8>>::deserialize(deserializer)?;
            let arr: [u8; 64] = bytes
                .try_into()
                .map_err(|_| serde::de::Error::custom("node id must be 64 bytes"))?;
            Ok(NodeId(arr))
        }
    }
}

/// Where a cluster member lives on the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    /// The member's Raft ID.
    pub raft_id: RaftId,
    /// The member's p2p identity.
    pub node_id: NodeId,
    /// IPv4 address. The transport only supports IPv4.
    pub ip: Ipv4Addr,
    /// The member's p2p listening port.
    pub p2p_port: u16,
}

impl Address {
    /// Bind a Raft ID to a parsed enode.
    pub fn new(raft_id: RaftId, node_id: NodeId, ip: Ipv4Addr, p2p_port: u16) -> Self {
        Address {
            raft_id,
            node_id,
            ip,
            p2p_port,
        }
    }

    /// Parse an `enode://<id>@<ip>:<port>` URL and bind it to `raft_id`.
    ///
    /// Fails with [`RaftError::BadAddress`] on malformed input or a
    /// non-IPv4 host.
    pub fn parse_enode(raft_id: RaftId, url: &str) -> RaftResult<Self> {
        let rest = url
            .strip_prefix("enode://")
            .ok_or_else(|| RaftError::BadAddress(format!("not an enode url: {url}")))?;
        let (id_part, host_part) = rest
            .split_once('@')
            .ok_or_else(|| RaftError::BadAddress(format!("enode url missing host: {url}")))?;
        let node_id = NodeId::from_hex(id_part)?;

        // Trailing query parameters (e.g. ?discport=0) are not addressing
        // information.
        let host_part = host_part.split('?').next().unwrap_or(host_part);
        let (host, port) = host_part
            .split_once(':')
            .ok_or_else(|| RaftError::BadAddress(format!("enode url missing port: {url}")))?;

        let ip: Ipv4Addr = host.parse().map_err(|_| {
            RaftError::BadAddress(format!("expected an IPv4 address, got {host:?}"))
        })?;
        let p2p_port: u16 = port
            .parse()
            .map_err(|_| RaftError::BadAddress(format!("invalid port {port:?}")))?;

        Ok(Address::new(raft_id, node_id, ip, p2p_port))
    }

    /// Opaque byte encoding for ConfChange contexts and snapshots.
    pub fn to_bytes(&self) -> Vec<u8> {
        bincode::serialize(self).expect("address encoding is infallible")
    }

    /// Inverse of [`Address::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> RaftResult<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    /// The member's Raft transport URL.
    pub fn raft_url(&self, port_base: u16) -> String {
        format!("http://{}:{}", self.ip, raft_port(port_base, self.raft_id))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "raft:{} {}@{}:{}",
            self.raft_id, self.node_id, self.ip, self.p2p_port
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex_id(fill: u8) -> String {
        hex::encode([fill; 64])
    }

    #[test]
    fn address_bytes_roundtrip() {
        let address = Address::new(
            3,
            NodeId([0xab; 64]),
            Ipv4Addr::new(10, 0, 0, 3),
            30303,
        );
        let restored = Address::from_bytes(&address.to_bytes()).unwrap();
        assert_eq!(restored, address);
    }

    #[test]
    fn parses_well_formed_enode() {
        let url = format!("enode://{}@192.168.1.20:30303", hex_id(0x11));
        let address = Address::parse_enode(4, &url).unwrap();

        assert_eq!(address.raft_id, 4);
        assert_eq!(address.ip, Ipv4Addr::new(192, 168, 1, 20));
        assert_eq!(address.p2p_port, 30303);
        assert_eq!(address.node_id, NodeId([0x11; 64]));
    }

    #[test]
    fn parses_enode_with_discport() {
        let url = format!("enode://{}@10.1.1.1:30303?discport=0", hex_id(0x22));
        let address = Address::parse_enode(1, &url).unwrap();
        assert_eq!(address.p2p_port, 30303);
    }

    #[test]
    fn rejects_malformed_enodes() {
        let bad = [
            "http://example.com".to_string(),
            "enode://nothex@1.2.3.4:30303".to_string(),
            format!("enode://{}@1.2.3.4", hex_id(0x33)),
            format!("enode://{}", hex_id(0x33)),
            // Too-short identity.
            format!("enode://{}@1.2.3.4:30303", hex::encode([0x44; 32])),
        ];
        for url in bad {
            assert!(
                matches!(Address::parse_enode(1, &url), Err(RaftError::BadAddress(_))),
                "expected BadAddress for {url}"
            );
        }
    }

    #[test]
    fn rejects_non_ipv4_hosts() {
        for host in ["[::1]:30303", "node.example.org:30303"] {
            let url = format!("enode://{}@{}", hex_id(0x55), host);
            assert!(matches!(
                Address::parse_enode(1, &url),
                Err(RaftError::BadAddress(_))
            ));
        }
    }

    #[test]
    fn raft_url_uses_port_offset() {
        let address = Address::new(2, NodeId([0; 64]), Ipv4Addr::new(127, 0, 0, 1), 30303);
        assert_eq!(
            address.raft_url(DEFAULT_RAFT_PORT_BASE),
            "http://127.0.0.1:50402"
        );
    }
}
