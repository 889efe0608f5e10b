//! Outbound half of the perfect link.
//!
//! [`keep_sending`] drains the sending queue, stamps each payload with the
//! local id and puts it on the wire exactly once. Data messages then move to
//! the retransmission queue (see [`crate::timer`]); acks are fire-and-forget.
//!
//! ```text
//!  broadcast / receiver ──▶ sending ──▶ keep_sending ──▶ transport
//!                              ▲              │
//!                              │              ▼ (data only)
//!                     keep_retransmitting ◀── retransmissions
//! ```

use std::io;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::time::Instant;

use crate::context::Context;
use crate::hosts::NodeId;
use crate::packet::Payload;
use crate::queue::{Dequeue, QueueClosed};
use crate::socket::{is_transient, Transport};

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A payload addressed to one recipient, owned by exactly one queue at a
/// time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub payload: Payload,
    /// Index into the membership; never a borrowed node.
    pub recipient: NodeId,
    /// Time of the most recent transmission attempt.
    pub sending_time: Instant,
    /// Transmissions so far (0 until first sent).
    pub attempts: u32,
}

impl Message {
    pub fn new(payload: Payload, recipient: NodeId) -> Self {
        Self {
            payload,
            recipient,
            sending_time: Instant::now(),
            attempts: 0,
        }
    }
}

/// Hand `payload` to the perfect link for delivery to `recipient`.
///
/// A data payload counts as unacknowledged from this point until the
/// retransmitter settles it.
pub fn send(ctx: &Context, payload: Payload, recipient: NodeId) -> Result<(), QueueClosed> {
    let data = !payload.is_ack;
    if data {
        ctx.unacked.fetch_add(1, Ordering::SeqCst);
    }
    let queued = ctx.sending.enqueue(Message::new(payload, recipient));
    if queued.is_err() && data {
        ctx.unacked.fetch_sub(1, Ordering::SeqCst);
    }
    queued
}

/// Forget a data message that will never reach the retransmitter.
fn abandon(ctx: &Context, msg: &Message) {
    if !msg.payload.is_ack {
        ctx.unacked.fetch_sub(1, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Sender loop
// ---------------------------------------------------------------------------

/// Run until shutdown. Returns `Err` only for a fatal transport error.
pub async fn keep_sending<T: Transport>(
    ctx: Context,
    transport: Arc<T>,
    mut sending: Dequeue<Message>,
) -> io::Result<()> {
    log::debug!("[link] sender started");

    while let Some(mut msg) = sending.dequeue(&ctx.shutdown).await {
        let Some(dest) = ctx.addr_of(msg.recipient) else {
            log::warn!("[link] no address for node {}, dropping", msg.recipient);
            abandon(&ctx, &msg);
            continue;
        };

        msg.payload.sender_id = ctx.me;
        let bytes = match msg.payload.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                log::error!("[link] cannot encode {}: {e}", msg.payload);
                abandon(&ctx, &msg);
                continue;
            }
        };

        match transport.send_datagram(&bytes, dest).await {
            Ok(_) => log::debug!("[link] → {} {}", msg.recipient, msg.payload),
            Err(e) if is_transient(&e) => {
                log::debug!("[link] send to {} failed: {e}", msg.recipient);
            }
            Err(e) => {
                log::error!("[link] send to {dest} failed: {e}");
                return Err(e);
            }
        }

        if msg.payload.is_ack {
            continue;
        }
        msg.attempts += 1;
        msg.sending_time = Instant::now();
        if ctx.retransmissions.enqueue(msg).is_err() {
            break;
        }
    }

    log::debug!("[link] sender stopped");
    Ok(())
}
