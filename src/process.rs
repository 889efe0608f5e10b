//! One broadcast node: wiring, task lifecycle and the idle probe.
//!
//! ```text
//!             ┌──────────────┐  sending  ┌────────────┐
//!  producer ─▶│   Context    │──────────▶│   sender   │──▶ transport
//!             │ tracker, ... │◀──┐       └─────┬──────┘
//!             └──────┬───────┘   │ resend      │ data
//!                    │           │       ┌─────▼──────┐
//!     receiver(s) ◀──┘           └───────│ retransmit │
//!        ▲                               └────────────┘
//!        └── transport         tracker / producer ──▶ output drainer ──▶ io::Write
//! ```
//!
//! Every unit is a tokio task except the output drainer, which performs
//! blocking writes on `spawn_blocking`. A unit that fails fatally or panics
//! triggers the shared shutdown so the others stop within one bounded wait.

use std::future::Future;
use std::io::{self, Write};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;

use crate::broadcast;
use crate::config::{CausalityGraph, ConfigError, LinkSettings, Workload};
use crate::context::Context;
use crate::delivered::TrackerError;
use crate::hosts::{Membership, NodeId};
use crate::output;
use crate::queue::QueueDepth;
use crate::receiver::keep_receiving;
use crate::sender::keep_sending;
use crate::shutdown::Shutdown;
use crate::socket::Transport;
use crate::timer::keep_retransmitting;

/// Interval at which [`ProcessHandle::wait_idle`] re-checks the probe.
const IDLE_POLL: Duration = Duration::from_millis(10);

/// Fatal node failures.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("transport failure: {0}")]
    Transport(#[from] io::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("delivery tracker: {0}")]
    Tracker(#[from] TrackerError),
    #[error("output failure: {0}")]
    Output(#[source] io::Error),
    #[error("{0} task panicked")]
    TaskPanicked(&'static str),
}

/// Everything a node needs besides its transport and output sink.
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    pub me: NodeId,
    pub membership: Arc<Membership>,
    pub causality: CausalityGraph,
    pub workload: Workload,
    pub settings: LinkSettings,
}

type Unit = (&'static str, JoinHandle<Result<(), NodeError>>);

pub struct Process;

impl Process {
    /// Wire up and start every unit. Must be called inside a tokio runtime.
    pub fn spawn<T, W>(
        config: ProcessConfig,
        transport: T,
        writer: W,
    ) -> Result<ProcessHandle<W>, NodeError>
    where
        T: Transport,
        W: Write + Send + 'static,
    {
        let ProcessConfig {
            me,
            membership,
            causality,
            workload,
            settings,
        } = config;
        let receivers = settings.receivers.max(1);

        let (out_tx, out_rx) = output::channel();
        let (ctx, pipes) = Context::new(me, membership, causality, workload, settings, out_tx)?;
        let transport = Arc::new(transport);
        log::info!(
            "[node] {me} up on {} with {} node(s), {workload:?}",
            transport.local_addr(),
            ctx.membership.len()
        );

        let drainer = tokio::task::spawn_blocking(move || output::drain(out_rx, writer));

        let mut tasks = Vec::with_capacity(receivers + 3);
        for worker in 0..receivers {
            let unit = keep_receiving(ctx.clone(), Arc::clone(&transport), worker);
            spawn_unit(&mut tasks, "receiver", &ctx.shutdown, async move {
                unit.await.map_err(NodeError::from)
            });
        }
        let unit = keep_sending(ctx.clone(), Arc::clone(&transport), pipes.sending);
        spawn_unit(&mut tasks, "sender", &ctx.shutdown, async move {
            unit.await.map_err(NodeError::from)
        });
        let unit = keep_retransmitting(ctx.clone(), pipes.retransmissions);
        spawn_unit(&mut tasks, "retransmitter", &ctx.shutdown, async move {
            unit.await;
            Ok::<_, NodeError>(())
        });
        let unit = broadcast::run_workload(ctx.clone());
        spawn_unit(&mut tasks, "producer", &ctx.shutdown, async move {
            unit.await.map_err(NodeError::from)
        });

        Ok(ProcessHandle {
            me,
            shutdown: ctx.shutdown.clone(),
            sending: ctx.sending.depth(),
            retransmissions: ctx.retransmissions.depth(),
            enqueued: Arc::clone(&ctx.enqueued),
            unacked: Arc::clone(&ctx.unacked),
            target: workload.originated_by(me),
            tasks,
            drainer,
        })
    }
}

/// Run `unit` under a supervisor so that a failure, panics included,
/// triggers the shared shutdown.
fn spawn_unit<F>(tasks: &mut Vec<Unit>, name: &'static str, shutdown: &Shutdown, unit: F)
where
    F: Future<Output = Result<(), NodeError>> + Send + 'static,
{
    let shutdown = shutdown.clone();
    let inner = tokio::spawn(unit);
    let handle = tokio::spawn(async move {
        let failure = match inner.await {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => {
                log::error!("[node] {name} failed: {e}");
                e
            }
            Err(e) => {
                log::error!("[node] {name} task aborted: {e}");
                NodeError::TaskPanicked(name)
            }
        };
        shutdown.trigger();
        Err(failure)
    });
    tasks.push((name, handle));
}

/// Control handle for a running node.
///
/// Holds no producer end of the output channel, so the drainer finishes as
/// soon as every task has exited.
pub struct ProcessHandle<W> {
    me: NodeId,
    shutdown: Shutdown,
    sending: QueueDepth,
    retransmissions: QueueDepth,
    enqueued: Arc<AtomicU32>,
    unacked: Arc<AtomicUsize>,
    target: u32,
    tasks: Vec<Unit>,
    drainer: JoinHandle<io::Result<W>>,
}

impl<W> ProcessHandle<W> {
    /// The whole workload has been handed to the link layer and every data
    /// message sent so far has been acknowledged by its recipient.
    pub fn is_idle(&self) -> bool {
        self.enqueued.load(Ordering::SeqCst) >= self.target
            && self.sending.get() == 0
            && self.retransmissions.get() == 0
            && self.unacked.load(Ordering::SeqCst) == 0
    }

    /// Resolve once [`is_idle`](Self::is_idle) holds or the node shuts down.
    pub async fn wait_idle(&self) {
        while !self.is_idle() && !self.shutdown.is_triggered() {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(IDLE_POLL) => {}
            }
        }
    }

    pub fn shutdown(&self) {
        self.shutdown.trigger();
    }

    /// Resolves once some unit (or the caller) has triggered shutdown.
    pub async fn stopped(&self) {
        self.shutdown.cancelled().await;
    }

    /// Wait for every unit, then for the output drainer.
    ///
    /// Blocks until shutdown is triggered by [`shutdown`](Self::shutdown) or
    /// by a failing unit. Returns the writer once everything was flushed, or
    /// the first fatal error.
    pub async fn join(self) -> Result<W, NodeError> {
        let mut first_error = None;
        for (name, handle) in self.tasks {
            let outcome = match handle.await {
                Ok(result) => result,
                Err(e) => {
                    log::error!("[node] {name} task aborted: {e}");
                    self.shutdown.trigger();
                    Err(NodeError::TaskPanicked(name))
                }
            };
            if let Err(e) = outcome {
                first_error.get_or_insert(e);
            }
        }

        let drained = match self.drainer.await {
            Ok(result) => result.map_err(NodeError::Output),
            Err(_) => Err(NodeError::TaskPanicked("output")),
        };
        log::info!("[node] {} stopped", self.me);

        match first_error {
            Some(e) => Err(e),
            None => drained,
        }
    }

    /// [`shutdown`](Self::shutdown) then [`join`](Self::join).
    pub async fn stop(self) -> Result<W, NodeError> {
        self.shutdown();
        self.join().await
    }
}
