//! Traffic accounting for the tunnel session.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Cumulative totals, persisted periodically and on shutdown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficSnapshot {
    #[serde(rename = "rx")]
    pub rx_total: u64,
    #[serde(rename = "tx")]
    pub tx_total: u64,
}

/// Durable storage for [`TrafficSnapshot`].
pub trait TrafficStore: Send + Sync {
    fn load(&self) -> TrafficSnapshot;
    fn save(&self, snapshot: TrafficSnapshot);
}

/// Store that keeps nothing.
pub struct NullStore;

impl TrafficStore for NullStore {
    fn load(&self) -> TrafficSnapshot {
        TrafficSnapshot::default()
    }

    fn save(&self, _snapshot: TrafficSnapshot) {}
}

/// Atomic byte counters.
///
/// I/O workers add to the pending counters; the tick worker moves them
/// into the per-tick rates and the cumulative totals.
pub struct TrafficMeter {
    rx_pending: AtomicU64,
    tx_pending: AtomicU64,
    rx_rate: AtomicU64,
    tx_rate: AtomicU64,
    rx_total: AtomicU64,
    tx_total: AtomicU64,
}

impl TrafficMeter {
    pub fn new() -> Self {
        Self::seeded(TrafficSnapshot::default())
    }

    /// Start from previously persisted totals.
    pub fn seeded(snapshot: TrafficSnapshot) -> Self {
        Self {
            rx_pending: AtomicU64::new(0),
            tx_pending: AtomicU64::new(0),
            rx_rate: AtomicU64::new(0),
            tx_rate: AtomicU64::new(0),
            rx_total: AtomicU64::new(snapshot.rx_total),
            tx_total: AtomicU64::new(snapshot.tx_total),
        }
    }

    pub fn record_rx(&self, bytes: usize) {
        self.rx_pending.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_tx(&self, bytes: usize) {
        self.tx_pending.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Close one accounting interval.
    ///
    /// Rates become the bytes seen since the previous tick and those bytes
    /// are folded into the totals.
    pub fn tick(&self) {
        let rx = self.rx_pending.swap(0, Ordering::Relaxed);
        let tx = self.tx_pending.swap(0, Ordering::Relaxed);

        self.rx_rate.store(rx, Ordering::Relaxed);
        self.tx_rate.store(tx, Ordering::Relaxed);
        self.rx_total.fetch_add(rx, Ordering::Relaxed);
        self.tx_total.fetch_add(tx, Ordering::Relaxed);
    }

    /// Bytes received during the last tick.
    pub fn rx_rate(&self) -> u64 {
        self.rx_rate.load(Ordering::Relaxed)
    }

    /// Bytes sent during the last tick.
    pub fn tx_rate(&self) -> u64 {
        self.tx_rate.load(Ordering::Relaxed)
    }

    pub fn totals(&self) -> TrafficSnapshot {
        TrafficSnapshot {
            rx_total: self.rx_total.load(Ordering::Relaxed),
            tx_total: self.tx_total.load(Ordering::Relaxed),
        }
    }

    /// Zero every counter.
    pub fn reset(&self) {
        for counter in [
            &self.rx_pending,
            &self.tx_pending,
            &self.rx_rate,
            &self.tx_rate,
            &self.rx_total,
            &self.tx_total,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

impl Default for TrafficMeter {
    fn default() -> Self {
        Self::new()
    }
}
