//! Fault-injecting transport for tests.
//!
//! Real networks drop and duplicate datagrams. To exercise retransmission and
//! deduplication deterministically, [`Simulator`] wraps any [`Transport`] and
//! applies a fault model to outgoing datagrams:
//!
//! | Fault        | Description                                             |
//! |--------------|---------------------------------------------------------|
//! | Drop first   | Silently drop the first `drop_first` data datagrams.    |
//! | Packet loss  | Drop any datagram with probability `loss_rate`.         |
//! | Duplication  | Send a datagram twice with probability `duplicate_rate`.|
//!
//! Randomness comes from a `StdRng` seeded from `seed`, so a failing run can
//! be replayed. Receives pass straight through.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::packet::is_ack_datagram;
use crate::socket::Transport;

/// Fault model. Probabilities are clamped to `[0.0, 1.0]`.
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    pub loss_rate: f64,
    pub duplicate_rate: f64,
    /// Data datagrams (not acks) to drop before the model applies.
    pub drop_first: u64,
    pub seed: u64,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        // Transparent pass-through.
        Self {
            loss_rate: 0.0,
            duplicate_rate: 0.0,
            drop_first: 0,
            seed: 0,
        }
    }
}

/// Counters for what the simulator did to outgoing traffic.
#[derive(Debug, Default)]
pub struct SimulatorStats {
    pub sent: AtomicU64,
    pub dropped: AtomicU64,
    pub duplicated: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fate {
    Drop,
    Send { copies: u8 },
}

pub struct Simulator<T> {
    inner: T,
    config: SimulatorConfig,
    rng: Mutex<StdRng>,
    data_seen: AtomicU64,
    stats: Arc<SimulatorStats>,
}

impl<T: Transport> Simulator<T> {
    pub fn new(inner: T, config: SimulatorConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        Self {
            inner,
            config,
            rng: Mutex::new(rng),
            data_seen: AtomicU64::new(0),
            stats: Arc::default(),
        }
    }

    /// Shared counters; stay readable after the simulator moved into a node.
    pub fn stats(&self) -> Arc<SimulatorStats> {
        Arc::clone(&self.stats)
    }

    fn fate(&self, bytes: &[u8]) -> Fate {
        if !is_ack_datagram(bytes) {
            let nth = self.data_seen.fetch_add(1, Ordering::SeqCst);
            if nth < self.config.drop_first {
                return Fate::Drop;
            }
        }

        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        if rng.random_bool(self.config.loss_rate.clamp(0.0, 1.0)) {
            return Fate::Drop;
        }
        let copies = if rng.random_bool(self.config.duplicate_rate.clamp(0.0, 1.0)) {
            2
        } else {
            1
        };
        Fate::Send { copies }
    }
}

impl<T: Transport> Transport for Simulator<T> {
    async fn send_datagram(&self, bytes: &[u8], dest: SocketAddr) -> io::Result<usize> {
        match self.fate(bytes) {
            Fate::Drop => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                log::debug!("[sim] dropped {} byte(s) to {dest}", bytes.len());
                // The sender cannot tell a lost datagram from a delivered one.
                Ok(bytes.len())
            }
            Fate::Send { copies } => {
                let mut sent = 0;
                for _ in 0..copies {
                    sent = self.inner.send_datagram(bytes, dest).await?;
                }
                self.stats.sent.fetch_add(1, Ordering::Relaxed);
                if copies > 1 {
                    self.stats.duplicated.fetch_add(1, Ordering::Relaxed);
                }
                Ok(sent)
            }
        }
    }

    async fn wait_readable(&self, timeout: Duration) -> io::Result<bool> {
        self.inner.wait_readable(timeout).await
    }

    fn recv_datagram(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.inner.recv_datagram(buf)
    }

    fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Payload;
    use crate::socket::UdpTransport;

    async fn pair(config: SimulatorConfig) -> (Simulator<UdpTransport>, UdpTransport) {
        let loopback = "127.0.0.1:0".parse().unwrap();
        let a = UdpTransport::bind(loopback).await.unwrap();
        let b = UdpTransport::bind(loopback).await.unwrap();
        (Simulator::new(a, config), b)
    }

    /// Count datagrams arriving at `t` until it stays quiet for 50 ms.
    async fn count_arrivals(t: &UdpTransport) -> usize {
        let mut buf = [0u8; 256];
        let mut n = 0;
        while t.wait_readable(Duration::from_millis(50)).await.unwrap() {
            while t.recv_datagram(&mut buf).is_ok() {
                n += 1;
            }
        }
        n
    }

    fn datagram(ack: bool) -> Vec<u8> {
        let p = Payload::new(1, 1, b"1".to_vec(), 2);
        let p = if ack { p.to_ack() } else { p };
        p.encode().unwrap()
    }

    #[tokio::test]
    async fn default_is_pass_through() {
        let (sim, b) = pair(SimulatorConfig::default()).await;
        for _ in 0..5 {
            sim.send_datagram(&datagram(false), b.local_addr()).await.unwrap();
        }
        assert_eq!(count_arrivals(&b).await, 5);
        assert_eq!(sim.stats().dropped.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn drop_first_skips_acks() {
        let config = SimulatorConfig {
            drop_first: 2,
            ..Default::default()
        };
        let (sim, b) = pair(config).await;
        sim.send_datagram(&datagram(true), b.local_addr()).await.unwrap();
        for _ in 0..3 {
            sim.send_datagram(&datagram(false), b.local_addr()).await.unwrap();
        }
        // The ack and the third data datagram get through.
        assert_eq!(count_arrivals(&b).await, 2);
        assert_eq!(sim.stats().dropped.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn total_loss_drops_everything() {
        let config = SimulatorConfig {
            loss_rate: 1.0,
            ..Default::default()
        };
        let (sim, b) = pair(config).await;
        let n = sim.send_datagram(&datagram(false), b.local_addr()).await.unwrap();
        assert_eq!(n, datagram(false).len());
        assert_eq!(count_arrivals(&b).await, 0);
    }

    #[tokio::test]
    async fn certain_duplication_doubles_traffic() {
        let config = SimulatorConfig {
            duplicate_rate: 1.0,
            ..Default::default()
        };
        let (sim, b) = pair(config).await;
        for _ in 0..3 {
            sim.send_datagram(&datagram(false), b.local_addr()).await.unwrap();
        }
        assert_eq!(count_arrivals(&b).await, 6);
        assert_eq!(sim.stats().duplicated.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn same_seed_same_fate() {
        let config = SimulatorConfig {
            loss_rate: 0.5,
            seed: 7,
            ..Default::default()
        };
        let (a, _) = pair(config.clone()).await;
        let (b, _) = pair(config).await;
        let bytes = datagram(false);
        let fates_a: Vec<_> = (0..64).map(|_| a.fate(&bytes)).collect();
        let fates_b: Vec<_> = (0..64).map(|_| b.fate(&bytes)).collect();
        assert_eq!(fates_a, fates_b);
        assert!(fates_a.contains(&Fate::Drop));
        assert!(fates_a.contains(&Fate::Send { copies: 1 }));
    }
}
