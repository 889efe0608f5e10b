//! `layered-broadcast`: perfect links, uniform reliable broadcast and causal
//! broadcast over UDP.
//!
//! # Architecture
//!
//! ```text
//!  ┌─────────────┐  b lines                      ┌────────────────┐
//!  │  broadcast  │──────────────────────────────▶│     output     │──▶ file
//!  │ (BEB / URB) │                               └────────▲───────┘
//!  └──────┬──────┘                                        │ d lines
//!         │ Messages        ┌────────────┐  sightings ┌───┴───────┐
//!         ▼                 │  receiver  │───────────▶│ delivered │
//!  ┌─────────────┐          └─────▲──────┘            │ (quorum + │
//!  │   sender    │◀── resend ──┐  │                   │  causal)  │
//!  └──────┬──────┘    ┌────────┴──┴─┐                 └───────────┘
//!         │           │    timer    │
//!         │           └─────────────┘
//!  ┌──────▼───────────────────┴──────┐
//!  │  socket (Transport over UDP)    │
//!  └─────────────────────────────────┘
//! ```
//!
//! Each module has a single responsibility:
//! - [`packet`]     wire format (serialise / deserialise)
//! - [`hosts`]      static membership
//! - [`config`]     workload, causality graph, link tunables
//! - [`socket`]     transport seam and the UDP implementation
//! - [`simulator`]  fault-injecting transport for tests
//! - [`queue`]      shutdown-aware FIFO queues between tasks
//! - [`shutdown`]   process-wide cancellation token
//! - [`delivered`]  acknowledgement quorum and causal release
//! - [`sender`]     perfect-link send loop
//! - [`timer`]      retransmission loop
//! - [`receiver`]   perfect-link receive loop, acks, relays
//! - [`broadcast`]  best-effort, uniform reliable and causal broadcast
//! - [`output`]     ordered `b`/`d` log
//! - [`context`]    state shared by every task of a node
//! - [`process`]    task wiring, idle probe, shutdown and join

pub mod broadcast;
pub mod config;
pub mod context;
pub mod delivered;
pub mod hosts;
pub mod output;
pub mod packet;
pub mod process;
pub mod queue;
pub mod receiver;
pub mod sender;
pub mod shutdown;
pub mod simulator;
pub mod socket;
pub mod timer;
