//! Broadcast layer: best-effort fan-out, uniform reliable broadcast with
//! relay-on-first-sight, causal origination, and the application producers.
//!
//! ```text
//!  broadcast_messages ──▶ originate ──▶ uniform_reliable_broadcast
//!                                            │ mark_as_seen (self counts)
//!                                            ▼
//!  receiver (first sight) ───────────▶ best_effort_broadcast ──▶ sending
//! ```

use std::sync::atomic::Ordering;
use std::time::Duration;

use crate::config::Workload;
use crate::context::Context;
use crate::delivered::{Sighting, TrackerError};
use crate::hosts::NodeId;
use crate::output::OutputEvent;
use crate::packet::Payload;
use crate::sender;

/// Poll interval while the producer waits for the sending queue to drain.
const THROTTLE_POLL: Duration = Duration::from_millis(10);

/// Queue one copy of `payload` for every peer. Returns how many were queued.
pub fn best_effort_broadcast(ctx: &Context, payload: &Payload) -> usize {
    let mut queued = 0;
    for peer in ctx.membership.peers(ctx.me) {
        if sender::send(ctx, payload.clone(), peer.id).is_err() {
            log::debug!("[urb] sending queue closed");
            break;
        }
        queued += 1;
    }
    queued
}

/// Record the local node as having seen `payload` and, on first sight, relay
/// it to every peer.
///
/// Returns `Ok(true)` when this call did the relay, `Ok(false)` if the
/// payload had already been seen locally.
pub fn uniform_reliable_broadcast(ctx: &Context, payload: &Payload) -> Result<bool, TrackerError> {
    if ctx.tracker.was_seen(payload) {
        return Ok(false);
    }
    if ctx.tracker.mark_as_seen(payload)? == Sighting::Duplicate {
        // Another receiver won the race.
        return Ok(false);
    }

    let mut relay = payload.clone();
    relay.sender_id = ctx.me;
    relay.is_ack = false;
    let fanned = best_effort_broadcast(ctx, &relay);
    log::debug!("[urb] relay {}/{} to {fanned} peer(s)", relay.owner_id, relay.packet_uid);
    Ok(true)
}

/// Build, log and URB-broadcast the `seq`-th own message.
///
/// The vector clock is the local delivered-count vector with the own entry
/// replaced by `seq - 1`, the number of own messages broadcast before it.
pub fn originate(ctx: &Context, seq: u32, content: Vec<u8>) -> Result<Payload, TrackerError> {
    let mut payload = Payload::new(ctx.me, seq, content, ctx.clock_len());
    payload.vector_clock = ctx.tracker.clock_snapshot();
    payload.vector_clock[ctx.me as usize] = seq.saturating_sub(1);

    emit_broadcast(ctx, &payload);
    uniform_reliable_broadcast(ctx, &payload)?;
    Ok(payload)
}

/// Causally broadcast `1..=count`, pausing while the sending queue holds
/// more than the configured chunk.
pub async fn broadcast_messages(ctx: &Context, count: u32) -> Result<(), TrackerError> {
    log::info!("[node] broadcasting {count} message(s)");
    for seq in 1..=count {
        if !wait_for_room(ctx).await {
            break;
        }
        originate(ctx, seq, seq.to_string().into_bytes())?;
        ctx.enqueued.fetch_add(1, Ordering::SeqCst);
    }
    Ok(())
}

/// Send `1..=count` to `receiver` over perfect links.
pub async fn send_point_to_point(ctx: &Context, receiver: NodeId, count: u32) {
    log::info!("[node] sending {count} message(s) to node {receiver}");
    for seq in 1..=count {
        if !wait_for_room(ctx).await {
            break;
        }
        let payload = Payload::new(ctx.me, seq, seq.to_string().into_bytes(), ctx.clock_len());
        emit_broadcast(ctx, &payload);
        if sender::send(ctx, payload, receiver).is_err() {
            break;
        }
        ctx.enqueued.fetch_add(1, Ordering::SeqCst);
    }
}

/// Originate this node's share of the workload.
pub async fn run_workload(ctx: Context) -> Result<(), TrackerError> {
    match ctx.workload {
        Workload::Broadcast { messages } => broadcast_messages(&ctx, messages).await?,
        Workload::PointToPoint { receiver, messages } => {
            if receiver != ctx.me {
                send_point_to_point(&ctx, receiver, messages).await;
            }
        }
    }
    log::info!("[node] enqueued {} message(s)", ctx.enqueued());
    Ok(())
}

fn emit_broadcast(ctx: &Context, payload: &Payload) {
    if ctx.output.send(OutputEvent::Broadcast(payload.buffer.clone())).is_err() {
        log::debug!("[node] output closed, dropping broadcast line");
    }
}

/// Back-pressure: `false` if shutdown arrived while waiting.
async fn wait_for_room(ctx: &Context) -> bool {
    while ctx.sending.len() > ctx.settings.sending_chunk_size {
        tokio::select! {
            biased;
            _ = ctx.shutdown.cancelled() => return false,
            _ = tokio::time::sleep(THROTTLE_POLL) => {}
        }
    }
    !ctx.shutdown.is_triggered()
}
