//! Retransmission timing for the perfect link.
//!
//! Every data message the sender puts on the wire is parked on the
//! retransmission queue. [`keep_retransmitting`] takes them in order, drops
//! the ones whose recipient has been recorded as having seen them, and sends
//! the rest again once [`RetransmitTimer::deadline`] has passed. There is no
//! retry limit: a message is retried until acknowledged or shutdown.
//!
//! Sends happen in queue order with a fixed offset, so deadlines on the
//! queue are non-decreasing and waiting on the head never delays a later
//! message past its own deadline.

use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::time::Instant;

use crate::context::Context;
use crate::queue::Dequeue;
use crate::sender::Message;
use crate::shutdown::Shutdown;

/// Fixed retransmission offset measured from the last send attempt.
#[derive(Debug, Clone, Copy)]
pub struct RetransmitTimer {
    offset: Duration,
}

impl RetransmitTimer {
    pub fn new(offset: Duration) -> Self {
        Self { offset }
    }

    pub fn deadline(&self, msg: &Message) -> Instant {
        msg.sending_time + self.offset
    }

    pub fn is_due(&self, msg: &Message, now: Instant) -> bool {
        now >= self.deadline(msg)
    }

    /// Sleep until `msg` is due. Returns `false` if shutdown came first.
    pub async fn wait_until_due(&self, msg: &Message, shutdown: &Shutdown) -> bool {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => false,
            _ = tokio::time::sleep_until(self.deadline(msg)) => true,
        }
    }
}

/// Recipient has reported `(owner, packet_uid)`, by ack or by relaying it.
fn acknowledged(ctx: &Context, msg: &Message) -> bool {
    ctx.tracker
        .contains(msg.recipient, msg.payload.owner_id, msg.payload.packet_uid)
}

fn settle(ctx: &Context, msg: &Message) {
    ctx.unacked.fetch_sub(1, Ordering::SeqCst);
    log::trace!(
        "[retx] {} acknowledged by {} after {} attempt(s)",
        msg.payload,
        msg.recipient,
        msg.attempts
    );
}

/// Run until shutdown.
pub async fn keep_retransmitting(ctx: Context, mut retransmissions: Dequeue<Message>) {
    let timer = RetransmitTimer::new(ctx.settings.retransmission_offset);
    log::debug!("[retx] started, offset {:?}", ctx.settings.retransmission_offset);

    while let Some(msg) = retransmissions.dequeue(&ctx.shutdown).await {
        if acknowledged(&ctx, &msg) {
            settle(&ctx, &msg);
            continue;
        }
        if !timer.wait_until_due(&msg, &ctx.shutdown).await {
            break;
        }
        if acknowledged(&ctx, &msg) {
            settle(&ctx, &msg);
            continue;
        }

        log::debug!("[retx] resend {} to {} (attempt {})", msg.payload, msg.recipient, msg.attempts + 1);
        if ctx.sending.enqueue(msg).is_err() {
            break;
        }
    }

    log::debug!("[retx] stopped");
}
