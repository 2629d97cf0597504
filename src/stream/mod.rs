use crate::counter::SharedLedger;
use crate::error::FetchError;
use crate::fetch::{Fetch, attempt_uri};
use crate::report::StreamSummary;
use dashmap::DashMap;
use http::Uri;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Pause between a failed attempt and the next one.
pub const RETRY_DELAY: Duration = Duration::from_millis(500);

pub type SharedStreamStats = Arc<DashMap<usize, StreamSummary>>;

/// One download stream: keeps a single request in flight until `running` is cancelled.
pub struct StreamWorker<F> {
    index: usize,
    fetcher: Arc<F>,
    base_url: Uri,
    ck_size: u32,
    ledger: SharedLedger,
    stats: SharedStreamStats,
    running: CancellationToken,
}

impl<F: Fetch> StreamWorker<F> {
    pub fn new(
        index: usize,
        fetcher: Arc<F>,
        base_url: Uri,
        ck_size: u32,
        ledger: SharedLedger,
        stats: SharedStreamStats,
        running: CancellationToken,
    ) -> Self {
        stats.entry(index).or_insert_with(|| StreamSummary {
            index,
            ..Default::default()
        });

        Self {
            index,
            fetcher,
            base_url,
            ck_size,
            ledger,
            stats,
            running,
        }
    }

    pub async fn run(self) {
        info!("Stream {} started.", self.index);

        while !self.running.is_cancelled() {
            let started = Instant::now();
            let (result, received) = self.attempt().await;
            let elapsed = started.elapsed().as_secs_f64();

            self.record(|s| {
                s.bytes += received;
                match &result {
                    Ok(()) => s.completed += 1,
                    Err(e) if !e.is_cancelled() => s.failed += 1,
                    Err(_) => {}
                }
            });

            match result {
                Ok(()) => {
                    debug!(
                        "Stream {} request completed in {:.2}s, received {} bytes (this request).",
                        self.index, elapsed, received
                    );
                }
                Err(e) if e.is_cancelled() || self.running.is_cancelled() => {
                    info!("Stream {} stopped (test ended).", self.index);
                    break;
                }
                Err(e) => {
                    warn!("Stream {} error: {} (reqTime={:.2}s)", self.index, e, elapsed);
                    tokio::select! {
                        _ = self.running.cancelled() => break,
                        _ = time::sleep(RETRY_DELAY) => {}
                    }
                }
            }
        }

        debug!("Stream {} loop ended.", self.index);
    }

    /// Runs one request. The counter is in the ledger before the first byte can arrive.
    async fn attempt(&self) -> (Result<(), FetchError>, u64) {
        self.record(|s| s.attempts += 1);

        let nonce: f64 = rand::rng().random();
        let uri = match attempt_uri(&self.base_url, self.ck_size, nonce) {
            Ok(uri) => uri,
            Err(e) => return (Err(e), 0),
        };

        let counter = self.ledger.write().await.register();

        let result = tokio::select! {
            biased;
            _ = self.running.cancelled() => Err(FetchError::Cancelled),
            r = self.fetcher.fetch(uri, |len| counter.on_chunk(len)) => r,
        };
        counter.close();

        (result, counter.total())
    }

    fn record(&self, update: impl FnOnce(&mut StreamSummary)) {
        if let Some(mut summary) = self.stats.get_mut(&self.index) {
            update(summary.value_mut());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counter::CounterLedger;
    use crate::fetch::scripted::{Script, ScriptedFetcher};
    use tokio::sync::RwLock;
    use tokio::task::JoinHandle;

    struct Harness {
        ledger: SharedLedger,
        stats: SharedStreamStats,
        running: CancellationToken,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                ledger: Arc::new(RwLock::new(CounterLedger::new())),
                stats: Arc::new(DashMap::new()),
                running: CancellationToken::new(),
            }
        }

        fn spawn(&self, index: usize, fetcher: Arc<ScriptedFetcher>) -> JoinHandle<()> {
            let worker = StreamWorker::new(
                index,
                fetcher,
                "http://speed.example/garbage.php".parse().unwrap(),
                25,
                self.ledger.clone(),
                self.stats.clone(),
                self.running.clone(),
            );
            tokio::spawn(worker.run())
        }

        fn summary(&self, index: usize) -> StreamSummary {
            self.stats.get(&index).unwrap().value().clone()
        }

        async fn total(&self) -> u64 {
            self.ledger.read().await.total_bytes()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn in_flight_bytes_are_visible_and_cancel_is_prompt() {
        let h = Harness::new();
        let fetcher = Arc::new(ScriptedFetcher::new(Script::Hang { chunk_len: 4096 }));
        let task = h.spawn(0, fetcher.clone());

        time::sleep(Duration::from_millis(10)).await;
        assert_eq!(h.total().await, 4096);
        assert_eq!(h.ledger.read().await.len(), 1);

        h.running.cancel();
        time::timeout(Duration::from_millis(100), task)
            .await
            .expect("worker did not exit after cancellation")
            .unwrap();

        assert_eq!(fetcher.calls(), 1);
        let summary = h.summary(0);
        assert_eq!(summary.attempts, 1);
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.bytes, 4096);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_attempts_back_off_before_retrying() {
        let h = Harness::new();
        let fetcher = Arc::new(ScriptedFetcher::new(Script::Fail {
            delay: Duration::ZERO,
        }));
        let task = h.spawn(3, fetcher.clone());

        // attempts at 0.0s, 0.5s and 1.0s
        time::sleep(Duration::from_millis(1200)).await;
        h.running.cancel();
        task.await.unwrap();

        assert_eq!(fetcher.calls(), 3);
        let summary = h.summary(3);
        assert_eq!(summary.attempts, 3);
        assert_eq!(summary.failed, 3);
        assert_eq!(summary.bytes, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn successful_attempts_loop_without_delay() {
        let h = Harness::new();
        let fetcher = Arc::new(ScriptedFetcher::new(Script::Stream {
            chunk_len: 1000,
            chunks: 10,
            interval: Duration::from_millis(100),
        }));
        let task = h.spawn(0, fetcher.clone());

        time::sleep(Duration::from_millis(2050)).await;
        assert_eq!(h.total().await, 20_000);
        h.running.cancel();
        task.await.unwrap();

        let summary = h.summary(0);
        assert_eq!(summary.completed, 2);
        assert_eq!(summary.attempts, 3);
        assert_eq!(summary.bytes, 20_000);
        assert_eq!(h.ledger.read().await.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_stream_does_not_hold_back_healthy_one() {
        let h = Harness::new();
        let healthy = Arc::new(ScriptedFetcher::new(Script::Stream {
            chunk_len: 1000,
            chunks: 10,
            interval: Duration::from_millis(100),
        }));
        let broken = Arc::new(ScriptedFetcher::new(Script::Fail {
            delay: Duration::from_millis(20),
        }));
        let tasks = vec![h.spawn(0, healthy), h.spawn(1, broken)];

        time::sleep(Duration::from_millis(2050)).await;
        h.running.cancel();
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(h.total().await, 20_000);
        assert_eq!(h.summary(0).bytes, 20_000);
        assert_eq!(h.summary(1).bytes, 0);
        assert!(h.summary(1).failed >= 3);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_chunk_aborts_the_attempt_and_retries() {
        let h = Harness::new();
        let fetcher = Arc::new(ScriptedFetcher::new(Script::EmptyChunk));
        let task = h.spawn(0, fetcher.clone());

        time::sleep(Duration::from_millis(200)).await;
        assert_eq!(h.summary(0).failed, 1);

        time::sleep(Duration::from_millis(400)).await;
        assert_eq!(h.summary(0).failed, 2);

        h.running.cancel();
        task.await.unwrap();
        assert_eq!(h.total().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn every_attempt_gets_a_fresh_cache_busting_url() {
        let h = Harness::new();
        let fetcher = Arc::new(ScriptedFetcher::new(Script::Fail {
            delay: Duration::ZERO,
        }));
        let task = h.spawn(0, fetcher.clone());

        time::sleep(Duration::from_millis(600)).await;
        h.running.cancel();
        task.await.unwrap();

        let uris = fetcher.uris();
        assert_eq!(uris.len(), 2);
        for uri in &uris {
            let query = uri.query().unwrap();
            assert!(query.starts_with("ckSize=25&r="), "{query}");
            assert!(query.ends_with("&cors=1"), "{query}");
        }
        assert_ne!(uris[0], uris[1]);
    }

    #[tokio::test]
    async fn cancelled_before_start_makes_no_request() {
        let h = Harness::new();
        h.running.cancel();
        let fetcher = Arc::new(ScriptedFetcher::steady(10, Duration::from_millis(1)));
        h.spawn(0, fetcher.clone()).await.unwrap();
        assert_eq!(fetcher.calls(), 0);
        assert!(h.ledger.read().await.is_empty());
    }
}
