//! Inbound half of the perfect link.
//!
//! [`keep_receiving`] waits (bounded) for the transport to become readable,
//! decodes every queued datagram and hands it to [`handle_payload`]:
//!
//! - data is acknowledged back to its sender, duplicates included;
//! - every sighting, data or ack, is recorded in the delivery tracker;
//! - in broadcast mode, data seen for the first time is relayed (URB).
//!
//! Malformed datagrams and protocol violations are logged and dropped.

use std::io;
use std::sync::Arc;

use crate::broadcast;
use crate::config::Workload;
use crate::context::Context;
use crate::packet::{Payload, MAX_DATAGRAM};
use crate::sender::{self, Message};
use crate::socket::{is_transient, Transport};

/// Run until shutdown. Returns `Err` only for a fatal transport error.
pub async fn keep_receiving<T: Transport>(ctx: Context, transport: Arc<T>, worker: usize) -> io::Result<()> {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    let clock_len = ctx.clock_len();
    let wait = ctx.settings.packet_wait;
    log::debug!("[recv:{worker}] listening on {}", transport.local_addr());

    while !ctx.shutdown.is_triggered() {
        let readable = tokio::select! {
            biased;
            _ = ctx.shutdown.cancelled() => break,
            ready = transport.wait_readable(wait) => ready,
        };
        match readable {
            Ok(true) => {}
            Ok(false) => continue,
            Err(e) if is_transient(&e) => continue,
            Err(e) => {
                log::error!("[recv:{worker}] wait failed: {e}");
                return Err(e);
            }
        }

        while !ctx.shutdown.is_triggered() {
            let (len, from) = match transport.recv_datagram(&mut buf) {
                Ok(received) => received,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if is_transient(&e) => {
                    log::debug!("[recv:{worker}] receive failed: {e}");
                    break;
                }
                Err(e) => {
                    log::error!("[recv:{worker}] receive failed: {e}");
                    return Err(e);
                }
            };

            match Payload::decode(&buf[..len], clock_len) {
                Ok(payload) => handle_payload(&ctx, payload),
                Err(e) => log::warn!("[recv:{worker}] dropping datagram from {from}: {e}"),
            }
        }
    }

    log::debug!("[recv:{worker}] stopped");
    Ok(())
}

/// Process one decoded payload.
pub fn handle_payload(ctx: &Context, payload: Payload) {
    let from = payload.sender_id;
    log::debug!("[recv] ← {from} {payload}");

    match ctx.tracker.insert(from, &payload) {
        Ok(sighting) => log::trace!("[recv] {}/{} {sighting:?}", payload.owner_id, payload.packet_uid),
        Err(e) => {
            log::warn!("[recv] rejecting {payload}: {e}");
            return;
        }
    }

    if payload.is_ack {
        return;
    }

    if sender::send(ctx, payload.to_ack(), from).is_err() {
        return;
    }

    if matches!(ctx.workload, Workload::Broadcast { .. }) {
        if let Err(e) = broadcast::uniform_reliable_broadcast(ctx, &payload) {
            log::warn!("[urb] cannot relay {payload}: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{fixture, Pipes};
    use crate::output::OutputReceiver;

    fn data(ctx: &Context, owner: u32, uid: u32, sender: u32) -> Payload {
        let mut p = Payload::new(owner, uid, uid.to_string().into_bytes(), ctx.clock_len());
        p.sender_id = sender;
        p
    }

    fn outgoing(pipes: &mut Pipes) -> Vec<Message> {
        std::iter::from_fn(|| pipes.sending.try_dequeue()).collect()
    }

    fn lines(rx: &mut OutputReceiver) -> Vec<String> {
        std::iter::from_fn(|| rx.try_recv().ok())
            .map(|e| e.to_string())
            .collect()
    }

    #[tokio::test]
    async fn truncated_datagram_is_dropped_and_loop_keeps_serving() {
        use crate::socket::UdpTransport;
        use std::time::Duration;

        let (ctx, mut pipes, _out) = fixture::broadcast(1, 3);
        let transport = Arc::new(UdpTransport::bind("127.0.0.1:0".parse().unwrap()).await.unwrap());
        let dest = transport.local_addr();
        let task = tokio::spawn(keep_receiving(ctx.clone(), Arc::clone(&transport), 0));

        let peer = UdpTransport::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let valid = data(&ctx, 2, 1, 2).encode().unwrap();
        peer.send_datagram(&valid[..5], dest).await.unwrap();
        peer.send_datagram(&valid, dest).await.unwrap();

        let ack = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Some(msg) = pipes.sending.try_dequeue() {
                    return msg;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("valid datagram was never handled");
        assert!(ack.payload.is_ack);
        assert_eq!(ack.recipient, 2);
        assert!(ctx.tracker.contains(2, 2, 1));

        ctx.shutdown.trigger();
        task.await.unwrap().unwrap();
    }

    #[test]
    fn data_is_acked_recorded_and_relayed() {
        let (ctx, mut pipes, _out) = fixture::broadcast(2, 3);
        handle_payload(&ctx, data(&ctx, 1, 1, 1));

        let msgs = outgoing(&mut pipes);
        let ack = &msgs[0];
        assert!(ack.payload.is_ack);
        assert_eq!(ack.recipient, 1);

        let relays: Vec<_> = msgs[1..].iter().map(|m| m.recipient).collect();
        assert_eq!(relays, vec![1, 3]);
        assert!(msgs[1..].iter().all(|m| !m.payload.is_ack));

        assert!(ctx.tracker.contains(1, 1, 1));
        assert!(ctx.tracker.contains(2, 1, 1));
    }

    #[test]
    fn duplicate_is_acked_but_not_relayed_again() {
        let (ctx, mut pipes, _out) = fixture::broadcast(2, 3);
        handle_payload(&ctx, data(&ctx, 1, 1, 1));
        outgoing(&mut pipes);

        handle_payload(&ctx, data(&ctx, 1, 1, 1));
        let msgs = outgoing(&mut pipes);
        assert_eq!(msgs.len(), 1);
        assert!(msgs[0].payload.is_ack);
    }

    #[test]
    fn relay_from_third_party_acked_to_relayer() {
        let (ctx, mut pipes, mut out) = fixture::broadcast(2, 3);
        handle_payload(&ctx, data(&ctx, 1, 1, 3));
        let msgs = outgoing(&mut pipes);
        assert_eq!(msgs[0].recipient, 3);
        // Sightings by 3 and by self make a majority of three.
        assert_eq!(lines(&mut out), vec!["d 1 1"]);
    }

    #[test]
    fn ack_is_recorded_without_reply() {
        let (ctx, mut pipes, _out) = fixture::broadcast(1, 3);
        handle_payload(&ctx, data(&ctx, 1, 4, 2).to_ack());
        assert!(outgoing(&mut pipes).is_empty());
        assert!(ctx.tracker.contains(2, 1, 4));
    }

    #[test]
    fn unknown_sender_dropped_silently() {
        let (ctx, mut pipes, _out) = fixture::broadcast(1, 3);
        handle_payload(&ctx, data(&ctx, 2, 1, 9));
        assert!(outgoing(&mut pipes).is_empty());
        assert!(!ctx.tracker.contains(9, 2, 1));
    }

    #[test]
    fn point_to_point_delivers_without_relay() {
        let workload = Workload::PointToPoint {
            receiver: 3,
            messages: 2,
        };
        let (ctx, mut pipes, mut out) = fixture::context(3, 3, workload);
        handle_payload(&ctx, data(&ctx, 1, 1, 1));
        handle_payload(&ctx, data(&ctx, 1, 1, 1));
        handle_payload(&ctx, data(&ctx, 2, 1, 2));

        let msgs = outgoing(&mut pipes);
        assert_eq!(msgs.len(), 3);
        assert!(msgs.iter().all(|m| m.payload.is_ack));
        assert_eq!(lines(&mut out), vec!["d 1 1", "d 2 1"]);
    }
}
