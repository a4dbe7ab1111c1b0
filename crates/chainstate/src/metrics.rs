//! Block connection timings.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Default)]
pub struct ConnectMetrics {
    check_block_us: AtomicU64,
    inputs_us: AtomicU64,
    persist_us: AtomicU64,
    blocks: AtomicU64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConnectMetricsSnapshot {
    pub check_block_us: u64,
    pub inputs_us: u64,
    pub persist_us: u64,
    pub blocks: u64,
}

impl ConnectMetrics {
    pub fn record_check_block(&self, elapsed: Duration) {
        self.check_block_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn record_inputs(&self, elapsed: Duration) {
        self.inputs_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    /// Counts one connected block.
    pub fn record_persist(&self, elapsed: Duration) {
        self.persist_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        self.blocks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ConnectMetricsSnapshot {
        ConnectMetricsSnapshot {
            check_block_us: self.check_block_us.load(Ordering::Relaxed),
            inputs_us: self.inputs_us.load(Ordering::Relaxed),
            persist_us: self.persist_us.load(Ordering::Relaxed),
            blocks: self.blocks.load(Ordering::Relaxed),
        }
    }
}
