//! Run configuration: what each node originates, the causal dependency
//! graph, and the link-layer tunables.
//!
//! # Config file
//!
//! ```text
//! m [i]          messages to originate; `i` selects point-to-point mode
//! d d ...        broadcast mode only: dependencies of the 1st host
//! d d ...        ... of the 2nd host, and so on in hosts-file order
//! ```
//!
//! A missing dependency line means the host depends on nobody.

use std::path::Path;
use std::time::Duration;

use thiserror::Error;

use crate::hosts::{Membership, NodeId};

/// Errors raised while loading the hosts or config files.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("line {line}: {reason}")]
    Malformed { line: usize, reason: String },
    #[error("cannot resolve host {host}: {reason}")]
    Resolve { host: String, reason: String },
    #[error("hosts file lists no nodes")]
    NoHosts,
    #[error("node id {id} outside 1..={count}")]
    IdOutOfRange { id: NodeId, count: usize },
    #[error("node id {0} listed twice")]
    DuplicateId(NodeId),
    #[error("unknown node id {0}")]
    UnknownNode(NodeId),
    #[error("causality graph covers {got} ids, membership needs {expected}")]
    GraphSize { expected: usize, got: usize },
}

/// What this run asks every node to originate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Workload {
    /// Every node except `receiver` sends `1..=messages` to `receiver` over
    /// perfect links.
    PointToPoint { receiver: NodeId, messages: u32 },
    /// Every node causally broadcasts `1..=messages`.
    Broadcast { messages: u32 },
}

impl Workload {
    /// How many messages `me` originates under this workload.
    pub fn originated_by(&self, me: NodeId) -> u32 {
        match *self {
            Workload::PointToPoint { receiver, .. } if receiver == me => 0,
            Workload::PointToPoint { messages, .. } | Workload::Broadcast { messages } => messages,
        }
    }
}

/// Static causal dependency graph, indexed by node id.
///
/// `dependencies(n)` are the owners whose streams `n`'s messages depend on;
/// `dependents(n)` is the reverse relation, i.e. the streams that may become
/// releasable once `n`'s frontier moves.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CausalityGraph {
    dependencies: Vec<Vec<NodeId>>,
    dependents: Vec<Vec<NodeId>>,
}

impl CausalityGraph {
    /// A graph with no edges over ids `0..clock_len`.
    pub fn empty(clock_len: usize) -> Self {
        Self {
            dependencies: vec![Vec::new(); clock_len],
            dependents: vec![Vec::new(); clock_len],
        }
    }

    /// Build from `(node, dependencies)` pairs; ids must be `< clock_len`.
    pub fn new(
        clock_len: usize,
        edges: impl IntoIterator<Item = (NodeId, Vec<NodeId>)>,
    ) -> Result<Self, ConfigError> {
        let mut graph = Self::empty(clock_len);
        for (node, deps) in edges {
            if node as usize >= clock_len {
                return Err(ConfigError::UnknownNode(node));
            }
            for dep in deps {
                if dep as usize >= clock_len || dep == 0 {
                    return Err(ConfigError::UnknownNode(dep));
                }
                let list = &mut graph.dependencies[node as usize];
                if list.contains(&dep) {
                    continue;
                }
                list.push(dep);
                if dep != node {
                    graph.dependents[dep as usize].push(node);
                }
            }
        }
        Ok(graph)
    }

    pub fn dependencies(&self, node: NodeId) -> &[NodeId] {
        self.dependencies
            .get(node as usize)
            .map_or(&[], Vec::as_slice)
    }

    pub fn dependents(&self, node: NodeId) -> &[NodeId] {
        self.dependents.get(node as usize).map_or(&[], Vec::as_slice)
    }

    pub fn is_empty(&self) -> bool {
        self.dependencies.iter().all(Vec::is_empty)
    }

    /// Number of ids (`0..clock_len`) the graph was built over.
    pub fn clock_len(&self) -> usize {
        self.dependencies.len()
    }
}

/// Parsed config file.
#[derive(Debug, Clone)]
pub struct Config {
    pub workload: Workload,
    pub causality: CausalityGraph,
}

impl Config {
    /// Parse config file contents against an already loaded membership.
    pub fn parse(text: &str, membership: &Membership) -> Result<Self, ConfigError> {
        let mut lines = text.lines().enumerate();

        let (idx, first) = lines
            .by_ref()
            .find(|(_, l)| !l.trim().is_empty())
            .ok_or_else(|| ConfigError::Malformed {
                line: 1,
                reason: "missing message count".into(),
            })?;
        let numbers = parse_ids(first, idx + 1)?;
        let workload = match numbers.as_slice() {
            [messages] => Workload::Broadcast {
                messages: *messages,
            },
            [messages, receiver] => {
                if !membership.contains(*receiver) {
                    return Err(ConfigError::UnknownNode(*receiver));
                }
                Workload::PointToPoint {
                    receiver: *receiver,
                    messages: *messages,
                }
            }
            _ => {
                return Err(ConfigError::Malformed {
                    line: idx + 1,
                    reason: format!("expected `m [i]`, got {first:?}"),
                })
            }
        };

        let mut edges = Vec::new();
        if matches!(workload, Workload::Broadcast { .. }) {
            for (node, (idx, line)) in membership.iter().zip(lines) {
                let deps = parse_ids(line, idx + 1)?;
                if let Some(bad) = deps.iter().find(|d| !membership.contains(**d)) {
                    return Err(ConfigError::UnknownNode(*bad));
                }
                edges.push((node.id, deps));
            }
        }
        let causality = CausalityGraph::new(membership.clock_len(), edges)?;

        Ok(Self {
            workload,
            causality,
        })
    }

    /// Read and parse a config file.
    pub fn load(path: impl AsRef<Path>, membership: &Membership) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        Self::parse(&text, membership)
    }
}

fn parse_ids(line: &str, line_no: usize) -> Result<Vec<u32>, ConfigError> {
    line.split_whitespace()
        .map(|tok| {
            tok.parse::<u32>().map_err(|_| ConfigError::Malformed {
                line: line_no,
                reason: format!("{tok:?} is not an unsigned integer"),
            })
        })
        .collect()
}

/// Link-layer tunables.
#[derive(Debug, Clone)]
pub struct LinkSettings {
    /// Minimum delay between two transmissions of the same message.
    pub retransmission_offset: Duration,
    /// Upper bound on a single receive wait, i.e. on shutdown latency.
    pub packet_wait: Duration,
    /// Sending-queue depth above which the producer pauses.
    pub sending_chunk_size: usize,
    /// Number of receiver tasks sharing the socket.
    pub receivers: usize,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            retransmission_offset: Duration::from_millis(100),
            packet_wait: Duration::from_millis(100),
            sending_chunk_size: 100_000,
            receivers: 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_hosts() -> Membership {
        Membership::parse("1 127.0.0.1 1\n2 127.0.0.1 2\n3 127.0.0.1 3\n").unwrap()
    }

    #[test]
    fn broadcast_config_with_causality() {
        let cfg = Config::parse("10\n\n3\n1 2\n", &three_hosts()).unwrap();
        assert_eq!(cfg.workload, Workload::Broadcast { messages: 10 });
        assert!(cfg.causality.dependencies(1).is_empty());
        assert_eq!(cfg.causality.dependencies(2), &[3]);
        assert_eq!(cfg.causality.dependencies(3), &[1, 2]);
        assert_eq!(cfg.causality.dependents(1), &[3]);
        assert_eq!(cfg.causality.dependents(3), &[2]);
    }

    #[test]
    fn missing_dependency_lines_mean_none() {
        let cfg = Config::parse("5\n", &three_hosts()).unwrap();
        assert!(cfg.causality.is_empty());
    }

    #[test]
    fn point_to_point_config() {
        let cfg = Config::parse("100 2\n", &three_hosts()).unwrap();
        assert_eq!(
            cfg.workload,
            Workload::PointToPoint {
                receiver: 2,
                messages: 100
            }
        );
        assert_eq!(cfg.workload.originated_by(2), 0);
        assert_eq!(cfg.workload.originated_by(1), 100);
    }

    #[test]
    fn unknown_receiver_rejected() {
        let err = Config::parse("1 9\n", &three_hosts()).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownNode(9)));
    }

    #[test]
    fn unknown_dependency_rejected() {
        let err = Config::parse("1\n4\n", &three_hosts()).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownNode(4)));
    }

    #[test]
    fn garbage_count_rejected() {
        let err = Config::parse("many\n", &three_hosts()).unwrap_err();
        assert!(matches!(err, ConfigError::Malformed { line: 1, .. }));
        assert!(Config::parse("", &three_hosts()).is_err());
    }

    #[test]
    fn self_dependency_is_not_a_dependent() {
        let g = CausalityGraph::new(3, vec![(1, vec![1, 2, 2])]).unwrap();
        assert_eq!(g.dependencies(1), &[1, 2]);
        assert!(g.dependents(1).is_empty());
        assert_eq!(g.dependents(2), &[1]);
    }

    #[test]
    fn default_settings_match_protocol_constants() {
        let s = LinkSettings::default();
        assert_eq!(s.retransmission_offset, Duration::from_millis(100));
        assert_eq!(s.packet_wait, Duration::from_millis(100));
        assert_eq!(s.sending_chunk_size, 100_000);
        assert_eq!(s.receivers, 1);
    }
}
