use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::warn;

/// Bytes received by one request attempt. Written only by the stream that owns the
/// attempt, read by the sampler at any time.
#[derive(Debug, Default)]
pub struct ByteCounter {
    received_bytes: AtomicU64,
    closed: AtomicBool,
}

impl ByteCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one received chunk. Returns `false` when the transfer should be aborted.
    pub fn on_chunk(&self, len: usize) -> bool {
        if len == 0 {
            warn!("Received an empty chunk, aborting attempt");
            return false;
        }
        if self.is_closed() {
            return false;
        }
        self.received_bytes.fetch_add(len as u64, Ordering::Relaxed);
        true
    }

    pub fn total(&self) -> u64 {
        self.received_bytes.load(Ordering::Relaxed)
    }

    /// Freezes the counter once its attempt has ended.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Every counter created during a run, in creation order. Counters are never removed
/// so the sum covers finished attempts as well as in-flight ones.
#[derive(Debug, Default)]
pub struct CounterLedger {
    counters: Vec<Arc<ByteCounter>>,
}

impl CounterLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self) -> Arc<ByteCounter> {
        let counter = Arc::new(ByteCounter::new());
        self.counters.push(counter.clone());
        counter
    }

    pub fn total_bytes(&self) -> u64 {
        self.counters.iter().map(|c| c.total()).sum()
    }

    /// Freezes every counter, including those of attempts whose task was aborted.
    pub fn close_all(&self) {
        for counter in &self.counters {
            counter.close();
        }
    }

    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }
}

pub type SharedLedger = Arc<RwLock<CounterLedger>>;
