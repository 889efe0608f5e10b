//! Output boundary: the ordered log of broadcasts and deliveries.
//!
//! The broadcast layer and the delivery tracker push [`OutputEvent`]s onto a
//! single channel; [`drain`] writes them out in arrival order as
//!
//! ```text
//! b <content>            a message this node originated
//! d <owner> <content>    a message released for delivery
//! ```

use std::fmt;
use std::io::{self, Write};

use tokio::sync::mpsc;

use crate::packet::Payload;

/// Producer side of the output channel.
pub type OutputSender = mpsc::UnboundedSender<OutputEvent>;

/// Consumer side of the output channel.
pub type OutputReceiver = mpsc::UnboundedReceiver<OutputEvent>;

pub fn channel() -> (OutputSender, OutputReceiver) {
    mpsc::unbounded_channel()
}

/// One line of the output log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputEvent {
    /// This node originated a message with the given content.
    Broadcast(Vec<u8>),
    /// A message was released for delivery.
    Delivered(Payload),
}

impl fmt::Display for OutputEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputEvent::Broadcast(content) => {
                write!(f, "b {}", String::from_utf8_lossy(content))
            }
            OutputEvent::Delivered(p) => write!(f, "d {} {}", p.owner_id, p.content()),
        }
    }
}

/// Write every event to `writer` until all senders are dropped.
///
/// Blocking: run it on a dedicated thread (`spawn_blocking`). The writer is
/// flushed whenever the channel is momentarily empty and once more before
/// returning.
pub fn drain<W: Write>(mut rx: OutputReceiver, mut writer: W) -> io::Result<W> {
    let mut lines = 0u64;
    while let Some(event) = rx.blocking_recv() {
        writeln!(writer, "{event}")?;
        lines += 1;
        if rx.is_empty() {
            writer.flush()?;
        }
    }
    writer.flush()?;
    log::info!("[output] drained {lines} line(s)");
    Ok(writer)
}
