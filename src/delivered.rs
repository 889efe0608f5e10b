//! Delivery tracker: acknowledgement quorum and causal release gate.
//!
//! Every sighting of a payload (data or ack, local or remote) is recorded
//! through [`DeliveryTracker::insert`]. The tracker keeps, per owner, a
//! delivery frontier (next expected `packet_uid`) and releases staged payloads
//! onto the output channel once they are
//!
//! 1. at the frontier (FIFO per owner),
//! 2. seen by a strict majority of nodes (uniform reliable broadcast), and
//! 3. causally ready: for every dependency `d` of the owner, the local
//!    delivered count `vector_clock[d]` has caught up with what the owner had
//!    delivered when it broadcast the message.
//!
//! Releasing a message from owner `o` re-examines `o` and, transitively, every
//! owner that depends on `o`, so a burst of releases is handled within a
//! single `insert`.
//!
//! All compound check-then-write sequences run under one mutex; the quorum
//! decision must be atomic with respect to concurrent inserts.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use thiserror::Error;

use crate::config::CausalityGraph;
use crate::hosts::NodeId;
use crate::output::{OutputEvent, OutputSender};
use crate::packet::Payload;

/// When a counted payload may be released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryPolicy {
    /// Point-to-point links: deliver a data payload on its first sighting.
    Immediate,
    /// Broadcast: FIFO per owner, majority quorum, causal dependencies.
    Causal,
}

/// What a single [`DeliveryTracker::insert`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sighting {
    /// This sender had already reported this `(owner, packet_uid)`.
    Duplicate,
    /// New sighting of a message that was already released.
    Stale,
    /// Counted towards quorum; `released` payloads left the tracker.
    Counted { acks: u32, released: usize },
}

/// Protocol violations rejected at the tracker boundary.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TrackerError {
    #[error("unknown {role} id {id}")]
    UnknownNode { role: &'static str, id: NodeId },
    #[error("vector clock has {got} entries, expected {expected}")]
    ClockLength { expected: usize, got: usize },
}

/// Mutable tracker state. Lives for the whole process.
///
/// `acked` keeps one entry per `(sender, owner, packet_uid)` ever seen, since
/// the retransmitter consults it, so it grows with total traffic.
/// `acked_counter` and `undelivered` entries are dropped on release.
#[derive(Debug)]
pub struct DeliveredSet {
    /// `acked[sender][owner]`: packet uids `sender` reported seeing.
    acked: HashMap<NodeId, HashMap<NodeId, HashSet<u32>>>,
    /// `acked_counter[owner][uid]`: distinct senders that reported it.
    acked_counter: HashMap<NodeId, HashMap<u32, u32>>,
    /// `undelivered[owner][uid]`: staged, not yet released.
    undelivered: HashMap<NodeId, HashMap<u32, Payload>>,
    /// Next expected uid per owner, indexed by id.
    received_up_to: Vec<u32>,
    /// Delivered count per owner, indexed by id.
    vector_clock: Vec<u32>,
}

impl DeliveredSet {
    fn new(clock_len: usize) -> Self {
        Self {
            acked: HashMap::new(),
            acked_counter: HashMap::new(),
            undelivered: HashMap::new(),
            received_up_to: vec![1; clock_len],
            vector_clock: vec![0; clock_len],
        }
    }

    fn frontier(&self, owner: NodeId) -> u32 {
        self.received_up_to[owner as usize]
    }

    fn acks(&self, owner: NodeId, uid: u32) -> u32 {
        self.acked_counter
            .get(&owner)
            .and_then(|m| m.get(&uid))
            .copied()
            .unwrap_or(0)
    }

    fn staged(&self, owner: NodeId, uid: u32) -> Option<&Payload> {
        self.undelivered.get(&owner)?.get(&uid)
    }
}

/// Thread-safe handle over the [`DeliveredSet`].
#[derive(Debug)]
pub struct DeliveryTracker {
    state: Mutex<DeliveredSet>,
    me: NodeId,
    node_count: usize,
    causality: CausalityGraph,
    policy: DeliveryPolicy,
    deliverable: OutputSender,
}

impl DeliveryTracker {
    /// `node_count` nodes with ids `1..=node_count`; released payloads go to
    /// `deliverable`.
    pub fn new(
        me: NodeId,
        node_count: usize,
        causality: CausalityGraph,
        policy: DeliveryPolicy,
        deliverable: OutputSender,
    ) -> Self {
        Self {
            state: Mutex::new(DeliveredSet::new(node_count + 1)),
            me,
            node_count,
            causality,
            policy,
            deliverable,
        }
    }

    /// Record that `sender_id` has seen `payload`, then release whatever
    /// became deliverable.
    pub fn insert(&self, sender_id: NodeId, payload: &Payload) -> Result<Sighting, TrackerError> {
        self.check_node("sender", sender_id)?;
        self.check_node("owner", payload.owner_id)?;
        if payload.vector_clock.len() != self.clock_len() {
            return Err(TrackerError::ClockLength {
                expected: self.clock_len(),
                got: payload.vector_clock.len(),
            });
        }

        let owner = payload.owner_id;
        let uid = payload.packet_uid;
        let mut state = self.lock();

        let newly_seen = state
            .acked
            .entry(sender_id)
            .or_default()
            .entry(owner)
            .or_default()
            .insert(uid);
        if !newly_seen {
            return Ok(Sighting::Duplicate);
        }

        let frontier = state.frontier(owner);
        if uid < frontier {
            log::trace!("[tracker] {sender_id} saw {owner}/{uid} after release");
            return Ok(Sighting::Stale);
        }

        let acks = {
            let counter = state
                .acked_counter
                .entry(owner)
                .or_default()
                .entry(uid)
                .or_insert(0);
            *counter += 1;
            *counter
        };
        log::trace!("[tracker] {owner}/{uid} seen by {sender_id} ({acks} ack(s))");

        let released = match self.policy {
            DeliveryPolicy::Immediate => {
                if acks == 1 && !payload.is_ack {
                    self.deliver(payload.clone());
                    1
                } else {
                    0
                }
            }
            DeliveryPolicy::Causal => {
                if acks == 1 {
                    if let Entry::Vacant(slot) = state.undelivered.entry(owner).or_default().entry(uid) {
                        let mut staged = payload.clone();
                        staged.is_ack = false;
                        slot.insert(staged);
                    }
                }
                if uid == frontier {
                    self.release(&mut state, owner)
                } else {
                    0
                }
            }
        };

        Ok(Sighting::Counted { acks, released })
    }

    /// `true` if `sender_id` has reported seeing `(owner_id, packet_uid)`.
    pub fn contains(&self, sender_id: NodeId, owner_id: NodeId, packet_uid: u32) -> bool {
        self.lock()
            .acked
            .get(&sender_id)
            .and_then(|by_owner| by_owner.get(&owner_id))
            .is_some_and(|uids| uids.contains(&packet_uid))
    }

    /// Record the local node as having seen `payload`.
    pub fn mark_as_seen(&self, payload: &Payload) -> Result<Sighting, TrackerError> {
        self.insert(self.me, payload)
    }

    /// `true` if the local node already saw `payload`.
    pub fn was_seen(&self, payload: &Payload) -> bool {
        self.contains(self.me, payload.owner_id, payload.packet_uid)
    }

    /// Released already, or acknowledged by a strict majority.
    pub fn can_urb_deliver(&self, owner_id: NodeId, packet_uid: u32) -> bool {
        self.urb_ready(&self.lock(), owner_id, packet_uid)
    }

    /// The message at `owner_id`'s frontier is URB-ready and every causal
    /// predecessor claimed by `remote_clock` has been delivered locally.
    pub fn can_lcb_deliver(&self, remote_clock: &[u32], owner_id: NodeId) -> bool {
        if !self.is_node(owner_id) {
            return false;
        }
        let state = self.lock();
        let frontier = state.frontier(owner_id);
        self.urb_ready(&state, owner_id, frontier) && self.causally_ready(&state, owner_id, remote_clock)
    }

    /// Copy of the local delivered-count vector.
    pub fn clock_snapshot(&self) -> Vec<u32> {
        self.lock().vector_clock.clone()
    }

    /// Vector clock entries every payload must carry.
    pub fn clock_len(&self) -> usize {
        self.node_count + 1
    }

    // -----------------------------------------------------------------------
    // Internals (lock held by the caller)
    // -----------------------------------------------------------------------

    fn lock(&self) -> MutexGuard<'_, DeliveredSet> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_node(&self, id: NodeId) -> bool {
        id >= 1 && id as usize <= self.node_count
    }

    fn check_node(&self, role: &'static str, id: NodeId) -> Result<(), TrackerError> {
        if self.is_node(id) {
            Ok(())
        } else {
            Err(TrackerError::UnknownNode { role, id })
        }
    }

    fn majority_reached(&self, acks: u32) -> bool {
        acks as usize > self.node_count / 2
    }

    fn urb_ready(&self, state: &DeliveredSet, owner: NodeId, uid: u32) -> bool {
        if !self.is_node(owner) {
            return false;
        }
        uid < state.frontier(owner) || self.majority_reached(state.acks(owner, uid))
    }

    fn causally_ready(&self, state: &DeliveredSet, owner: NodeId, remote_clock: &[u32]) -> bool {
        self.causality.dependencies(owner).iter().all(|&dep| {
            let claimed = remote_clock.get(dep as usize).copied().unwrap_or(0);
            state
                .vector_clock
                .get(dep as usize)
                .is_some_and(|&local| local >= claimed)
        })
    }

    /// Advance `owner`'s frontier as far as possible, then revisit every
    /// stream that depends on an owner whose frontier moved.
    fn release(&self, state: &mut DeliveredSet, owner: NodeId) -> usize {
        let mut pending = VecDeque::from([owner]);
        let mut released = 0;

        while let Some(current) = pending.pop_front() {
            let mut advanced = false;
            loop {
                let uid = state.frontier(current);
                let ready = match state.staged(current, uid) {
                    Some(staged) => {
                        self.urb_ready(state, current, uid)
                            && self.causally_ready(state, current, &staged.vector_clock)
                    }
                    None => false,
                };
                if !ready {
                    break;
                }

                let Some(payload) = state
                    .undelivered
                    .get_mut(&current)
                    .and_then(|m| m.remove(&uid))
                else {
                    break;
                };
                if let Some(counters) = state.acked_counter.get_mut(&current) {
                    counters.remove(&uid);
                }
                state.received_up_to[current as usize] = uid + 1;
                state.vector_clock[current as usize] += 1;

                log::debug!("[tracker] deliver {current}/{uid}");
                self.deliver(payload);
                released += 1;
                advanced = true;
            }

            if advanced {
                for &dependent in self.causality.dependents(current) {
                    if !pending.contains(&dependent) {
                        pending.push_back(dependent);
                    }
                }
            }
        }

        released
    }

    fn deliver(&self, payload: Payload) {
        if self.deliverable.send(OutputEvent::Delivered(payload)).is_err() {
            log::debug!("[tracker] output closed, dropping delivery");
        }
    }
}

#[cfg(test)]
impl DeliveryTracker {
    fn next_expected(&self, owner_id: NodeId) -> Option<u32> {
        self.is_node(owner_id)
            .then(|| self.lock().frontier(owner_id))
    }

    fn staged(&self) -> usize {
        self.lock().undelivered.values().map(HashMap::len).sum()
    }
}
