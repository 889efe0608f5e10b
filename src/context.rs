//! Application context shared by every concurrent unit of a node.
//!
//! Built once per process and cloned into each task. Everything inside is
//! either read-only after construction or synchronised on its own.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::config::{CausalityGraph, ConfigError, LinkSettings, Workload};
use crate::delivered::{DeliveryPolicy, DeliveryTracker};
use crate::hosts::{Membership, NodeId};
use crate::output::OutputSender;
use crate::queue::{self, Dequeue, Queue};
use crate::sender::Message;
use crate::shutdown::Shutdown;

#[derive(Debug, Clone)]
pub struct Context {
    pub me: NodeId,
    pub membership: Arc<Membership>,
    pub tracker: Arc<DeliveryTracker>,
    pub workload: Workload,
    pub settings: Arc<LinkSettings>,
    /// Messages waiting for their next transmission.
    pub sending: Queue<Message>,
    /// Sent data messages waiting for an ack or their retransmission time.
    pub retransmissions: Queue<Message>,
    /// `b` lines; the tracker holds its own clone for `d` lines.
    pub output: OutputSender,
    pub shutdown: Shutdown,
    /// Own messages handed to the link layer so far.
    pub enqueued: Arc<AtomicU32>,
    /// Data messages handed to the link and not yet acknowledged by their
    /// recipient.
    pub unacked: Arc<AtomicUsize>,
}

/// Consumer ends of the two link-layer queues.
#[derive(Debug)]
pub struct Pipes {
    pub sending: Dequeue<Message>,
    pub retransmissions: Dequeue<Message>,
}

impl Context {
    pub fn new(
        me: NodeId,
        membership: Arc<Membership>,
        causality: CausalityGraph,
        workload: Workload,
        settings: LinkSettings,
        output: OutputSender,
    ) -> Result<(Self, Pipes), ConfigError> {
        if !membership.contains(me) {
            return Err(ConfigError::UnknownNode(me));
        }
        if causality.clock_len() != membership.clock_len() {
            return Err(ConfigError::GraphSize {
                expected: membership.clock_len(),
                got: causality.clock_len(),
            });
        }

        let policy = match workload {
            Workload::PointToPoint { .. } => DeliveryPolicy::Immediate,
            Workload::Broadcast { .. } => DeliveryPolicy::Causal,
        };
        let tracker = DeliveryTracker::new(me, membership.len(), causality, policy, output.clone());
        let (sending, sending_rx) = queue::unbounded();
        let (retransmissions, retransmissions_rx) = queue::unbounded();

        let ctx = Self {
            me,
            membership,
            tracker: Arc::new(tracker),
            workload,
            settings: Arc::new(settings),
            sending,
            retransmissions,
            output,
            shutdown: Shutdown::new(),
            enqueued: Arc::new(AtomicU32::new(0)),
            unacked: Arc::new(AtomicUsize::new(0)),
        };
        let pipes = Pipes {
            sending: sending_rx,
            retransmissions: retransmissions_rx,
        };
        Ok((ctx, pipes))
    }

    pub fn clock_len(&self) -> usize {
        self.membership.clock_len()
    }

    pub fn addr_of(&self, id: NodeId) -> Option<SocketAddr> {
        self.membership.get(id).map(|n| n.addr)
    }

    pub fn enqueued(&self) -> u32 {
        self.enqueued.load(Ordering::SeqCst)
    }

    pub fn unacked(&self) -> usize {
        self.unacked.load(Ordering::SeqCst)
    }
}

/// Hand-built contexts for unit tests.
#[cfg(test)]
pub(crate) mod fixture {
    use super::*;
    use crate::hosts::Node;
    use crate::output::{self, OutputReceiver};

    pub(crate) fn membership(n: u32) -> Arc<Membership> {
        let nodes = (1..=n)
            .map(|id| Node {
                id,
                addr: SocketAddr::from(([127, 0, 0, 1], 40_000 + id as u16)),
            })
            .collect();
        Arc::new(Membership::new(nodes).unwrap())
    }

    pub(crate) fn context(
        me: NodeId,
        n: u32,
        workload: Workload,
    ) -> (Context, Pipes, OutputReceiver) {
        let membership = membership(n);
        let graph = CausalityGraph::empty(membership.clock_len());
        let (tx, rx) = output::channel();
        let (ctx, pipes) =
            Context::new(me, membership, graph, workload, LinkSettings::default(), tx).unwrap();
        (ctx, pipes, rx)
    }

    pub(crate) fn broadcast(me: NodeId, n: u32) -> (Context, Pipes, OutputReceiver) {
        context(me, n, Workload::Broadcast { messages: 0 })
    }
}
