//! Entry point for `layered-broadcast`.
//!
//! Loads the hosts and config files, binds the node's UDP socket and runs the
//! node until SIGINT/SIGTERM or a fatal error. All protocol work is delegated
//! to library modules; `main.rs` owns only process setup (logging, signal
//! handling, argument parsing, the output file).

use std::fs::File;
use std::future::Future;
use std::io::{self, BufWriter};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use clap::Parser;

use layered_broadcast::config::{Config, LinkSettings};
use layered_broadcast::hosts::{Membership, NodeId};
use layered_broadcast::process::{Process, ProcessConfig, ProcessHandle};
use layered_broadcast::socket::UdpTransport;

/// Perfect links, uniform reliable and causal broadcast over UDP.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// This node's id, as listed in the hosts file.
    #[arg(long)]
    id: NodeId,
    /// Hosts file: one `id ip port` line per node.
    #[arg(long)]
    hosts: PathBuf,
    /// Where to write the `b`/`d` log (truncated on start).
    #[arg(long)]
    output: PathBuf,
    /// Config file: `m [i]`, then one dependency line per host.
    config: PathBuf,
    /// Minimum delay between two transmissions of the same message.
    #[arg(long, default_value_t = 100)]
    retransmission_offset_ms: u64,
    /// Upper bound on one receive wait (and on shutdown latency).
    #[arg(long, default_value_t = 100)]
    packet_wait_ms: u64,
    /// Sending-queue depth above which the producer pauses.
    #[arg(long, default_value_t = 100_000)]
    sending_chunk_size: usize,
    /// Receiver tasks sharing the socket.
    #[arg(long, default_value_t = 1)]
    receivers: usize,
}

impl Cli {
    fn settings(&self) -> LinkSettings {
        LinkSettings {
            retransmission_offset: Duration::from_millis(self.retransmission_offset_ms),
            packet_wait: Duration::from_millis(self.packet_wait_ms),
            sending_chunk_size: self.sending_chunk_size,
            receivers: self.receivers,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise env_logger; set RUST_LOG to control verbosity.
    env_logger::init();

    let cli = Cli::parse();

    let membership = Membership::load(&cli.hosts)
        .with_context(|| format!("loading hosts file {}", cli.hosts.display()))?;
    let addr = membership
        .get(cli.id)
        .ok_or_else(|| anyhow!("node id {} is not in {}", cli.id, cli.hosts.display()))?
        .addr;
    let config = Config::load(&cli.config, &membership)
        .with_context(|| format!("loading config file {}", cli.config.display()))?;
    let output = File::create(&cli.output)
        .with_context(|| format!("creating output file {}", cli.output.display()))?;
    let transport = UdpTransport::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;

    let node = Process::spawn(
        ProcessConfig {
            me: cli.id,
            membership: Arc::new(membership),
            causality: config.causality,
            workload: config.workload,
            settings: cli.settings(),
        },
        transport,
        BufWriter::new(output),
    )?;

    serve(node, termination()).await
}

/// Run `node` until `termination` resolves or a unit fails, then shut down
/// and flush. A failed `termination` still goes through the flush before
/// its error is reported.
async fn serve<W>(
    node: ProcessHandle<W>,
    termination: impl Future<Output = io::Result<()>>,
) -> anyhow::Result<()> {
    let mut signal_error = None;
    tokio::select! {
        signal = termination => match signal {
            Ok(()) => log::info!("[node] signal received, shutting down"),
            Err(e) => {
                log::error!("[node] cannot install signal handlers: {e}");
                signal_error = Some(e);
            }
        },
        _ = node.stopped() => {}
    }

    node.shutdown();
    node.join().await?;
    match signal_error {
        Some(e) => Err(anyhow::Error::new(e).context("installing signal handlers")),
        None => Ok(()),
    }
}

/// Resolves on SIGINT, or SIGTERM on unix.
async fn termination() -> io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut term = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result,
            _ = term.recv() => Ok(()),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}
