//! Static membership: the list of nodes taking part in the broadcast.
//!
//! Loaded once at startup from a hosts file with one `id ip port` line per
//! node and shared read-only afterwards. Ids double as vector clock indices,
//! so they must be unique and lie in `1..=N`.

use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::Path;

use crate::config::ConfigError;

/// Identifier of a node (1-based).
pub type NodeId = u32;

/// One configured node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub id: NodeId,
    pub addr: SocketAddr,
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node {} ({})", self.id, self.addr)
    }
}

/// Ordered node list, indexable by id.
#[derive(Debug, Clone)]
pub struct Membership {
    nodes: Vec<Node>,
    /// `slots[id]` is the position of node `id` in `nodes`.
    slots: Vec<Option<usize>>,
}

impl Membership {
    /// Build a membership, validating the id constraints.
    pub fn new(nodes: Vec<Node>) -> Result<Self, ConfigError> {
        if nodes.is_empty() {
            return Err(ConfigError::NoHosts);
        }

        let mut slots = vec![None; nodes.len() + 1];
        for (pos, node) in nodes.iter().enumerate() {
            let id = node.id as usize;
            if id == 0 || id > nodes.len() {
                return Err(ConfigError::IdOutOfRange {
                    id: node.id,
                    count: nodes.len(),
                });
            }
            if slots[id].replace(pos).is_some() {
                return Err(ConfigError::DuplicateId(node.id));
            }
        }

        Ok(Self { nodes, slots })
    }

    /// Parse hosts file contents.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut nodes = Vec::new();
        for (idx, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let malformed = || ConfigError::Malformed {
                line: idx + 1,
                reason: format!("expected `id ip port`, got {line:?}"),
            };

            let mut fields = line.split_whitespace();
            let (Some(id), Some(ip), Some(port), None) =
                (fields.next(), fields.next(), fields.next(), fields.next())
            else {
                return Err(malformed());
            };
            let id: NodeId = id.parse().map_err(|_| malformed())?;
            let port: u16 = port.parse().map_err(|_| malformed())?;
            let addr = (ip, port)
                .to_socket_addrs()
                .map_err(|e| ConfigError::Resolve {
                    host: ip.to_string(),
                    reason: e.to_string(),
                })?
                .find(SocketAddr::is_ipv4)
                .ok_or_else(|| ConfigError::Resolve {
                    host: ip.to_string(),
                    reason: "no IPv4 address".into(),
                })?;
            nodes.push(Node { id, addr });
        }
        Self::new(nodes)
    }

    /// Read and parse a hosts file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        Self::parse(&text)
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        let slot = (*self.slots.get(id as usize)?)?;
        self.nodes.get(slot)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.get(id).is_some()
    }

    /// Nodes in configuration order.
    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }

    /// Every node except `me`.
    pub fn peers(&self, me: NodeId) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(move |n| n.id != me)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Vector clock entries on the wire: one per node plus the unused slot 0.
    pub fn clock_len(&self) -> usize {
        self.nodes.len() + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_hosts_file() {
        let m = Membership::parse("1 127.0.0.1 11001\n2 127.0.0.1 11002\n\n3 localhost 11003\n")
            .unwrap();
        assert_eq!(m.len(), 3);
        assert_eq!(m.clock_len(), 4);
        assert_eq!(m.get(2).unwrap().addr, "127.0.0.1:11002".parse().unwrap());
        assert_eq!(m.get(3).unwrap().addr.port(), 11003);
        assert!(m.get(0).is_none());
        assert!(m.get(4).is_none());
    }

    #[test]
    fn order_follows_file_not_ids() {
        let m = Membership::parse("2 127.0.0.1 2\n1 127.0.0.1 1\n").unwrap();
        let ids: Vec<_> = m.iter().map(|n| n.id).collect();
        assert_eq!(ids, vec![2, 1]);
        assert_eq!(m.get(1).unwrap().addr.port(), 1);
    }

    #[test]
    fn peers_skip_self() {
        let m = Membership::parse("1 127.0.0.1 1\n2 127.0.0.1 2\n3 127.0.0.1 3\n").unwrap();
        let ids: Vec<_> = m.peers(2).map(|n| n.id).collect();
        assert_eq!(ids, vec![1, 3]);
    }

    #[test]
    fn id_out_of_range_rejected() {
        let err = Membership::parse("1 127.0.0.1 1\n5 127.0.0.1 2\n").unwrap_err();
        assert!(matches!(err, ConfigError::IdOutOfRange { id: 5, count: 2 }));
        let err = Membership::parse("0 127.0.0.1 1\n").unwrap_err();
        assert!(matches!(err, ConfigError::IdOutOfRange { id: 0, .. }));
    }

    #[test]
    fn duplicate_id_rejected() {
        let err = Membership::parse("1 127.0.0.1 1\n1 127.0.0.1 2\n").unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateId(1)));
    }

    #[test]
    fn malformed_line_reports_line_number() {
        let err = Membership::parse("1 127.0.0.1 1\n2 127.0.0.1\n").unwrap_err();
        assert!(matches!(err, ConfigError::Malformed { line: 2, .. }));
        let err = Membership::parse("1 127.0.0.1 port\n").unwrap_err();
        assert!(matches!(err, ConfigError::Malformed { line: 1, .. }));
    }

    #[test]
    fn empty_file_rejected() {
        assert!(matches!(Membership::parse("\n\n"), Err(ConfigError::NoHosts)));
    }
}
