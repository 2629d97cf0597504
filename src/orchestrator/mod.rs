use crate::config::TestConfig;
use crate::counter::{CounterLedger, SharedLedger};
use crate::fetch::Fetch;
use crate::report::{ProgressReport, StreamSummary, TestResult, compute_speed};
use crate::stream::{SharedStreamStats, StreamWorker};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Spacing of progress samples during the measurement phase.
pub const SAMPLE_INTERVAL: Duration = Duration::from_secs(5);

/// How long stopped streams get to exit before their tasks are aborted.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Grace,
    Measuring,
    Stopping,
    Complete,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TestEvent {
    Progress(ProgressReport),
    Warning(String),
    Finished(TestResult),
    /// Stop was requested before the grace period ended; there is no result.
    Aborted,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed(TestResult),
    /// Stop was requested during the grace period.
    Aborted,
    /// The run task itself died; no terminal event was sent.
    Failed(String),
}

/// Starts test runs. Every run gets fresh state; nothing carries over between runs.
pub struct Orchestrator<F> {
    fetcher: Arc<F>,
}

impl<F: Fetch> Orchestrator<F> {
    pub fn new(fetcher: F) -> Self {
        Self {
            fetcher: Arc::new(fetcher),
        }
    }

    pub fn start(&self, config: TestConfig) -> TestHandle {
        let stop = CancellationToken::new();
        let (phase_tx, phase_rx) = watch::channel(Phase::Idle);
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let run = TestRun {
            config,
            fetcher: self.fetcher.clone(),
            ledger: Arc::new(RwLock::new(CounterLedger::new())),
            stats: Arc::new(DashMap::new()),
            stop: stop.clone(),
            phase_tx,
            event_tx,
        };
        let task = tokio::spawn(run.execute());

        TestHandle {
            stop: StopHandle(stop),
            phase_rx,
            event_rx,
            task,
        }
    }
}

/// Cloneable, idempotent early-stop trigger for a running test.
#[derive(Debug, Clone)]
pub struct StopHandle(CancellationToken);

impl StopHandle {
    pub fn request_stop(&self) {
        self.0.cancel();
    }
}

pub struct TestHandle {
    stop: StopHandle,
    phase_rx: watch::Receiver<Phase>,
    event_rx: mpsc::UnboundedReceiver<TestEvent>,
    task: tokio::task::JoinHandle<RunOutcome>,
}

impl TestHandle {
    pub fn request_stop(&self) {
        self.stop.request_stop();
    }

    pub fn stopper(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn phase(&self) -> watch::Receiver<Phase> {
        self.phase_rx.clone()
    }

    /// Progress, warnings and the terminal event. Closes once the run is over; a channel
    /// that closes without `Finished` or `Aborted` means the run failed, see [`Self::wait`].
    pub fn events(&mut self) -> &mut mpsc::UnboundedReceiver<TestEvent> {
        &mut self.event_rx
    }

    pub async fn wait(self) -> RunOutcome {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Test run task failed: {}", e);
                RunOutcome::Failed(e.to_string())
            }
        }
    }
}

struct TestRun<F> {
    config: TestConfig,
    fetcher: Arc<F>,
    ledger: SharedLedger,
    stats: SharedStreamStats,
    stop: CancellationToken,
    phase_tx: watch::Sender<Phase>,
    event_tx: mpsc::UnboundedSender<TestEvent>,
}

impl<F: Fetch> TestRun<F> {
    async fn execute(self) -> RunOutcome {
        let config = &self.config;
        info!("===== STARTING DOWNLOAD TEST =====");
        info!(
            "Settings: serverURL={}, ckSize={}, testDuration={:.2}s, graceTime={:.2}s, streamCount={}, overheadFactor={}, unit={}",
            config.server_url(),
            config.ck_size(),
            config.test_duration().as_secs_f64(),
            config.grace_time().as_secs_f64(),
            config.stream_count(),
            config.overhead_factor(),
            config.unit(),
        );

        if config.stream_count() == 0 {
            self.warn("streamCount is 0, no data will be downloaded and the speed will be 0");
        }

        self.set_phase(Phase::Grace);
        let streams = self.stop.child_token();
        let mut workers = self.spawn_streams(&streams);

        info!("Waiting for grace time ({:.2}s)...", config.grace_time().as_secs_f64());
        let aborted = tokio::select! {
            _ = self.stop.cancelled() => true,
            _ = time::sleep(config.grace_time()) => false,
        };
        if aborted {
            info!("Test aborted before grace time ended.");
            self.set_phase(Phase::Stopping);
            self.shutdown(&streams, &mut workers).await;
            self.set_phase(Phase::Complete);
            self.emit(TestEvent::Aborted);
            return RunOutcome::Aborted;
        }

        let baseline = self.total_bytes().await;
        info!(
            "Grace time ended. Current totalBytes={}. Starting measurement period...",
            baseline
        );
        self.set_phase(Phase::Measuring);

        let measure_time = config.measure_time();
        info!("Measuring speed for next {:.2} seconds...", measure_time.as_secs_f64());
        let measure_start = Instant::now();
        let deadline = measure_start.checked_add(measure_time);
        if deadline.is_none() {
            warn!("Measurement period is beyond the clock's range, running until stopped");
        }
        let early_stop = self.sample_until(deadline, baseline).await;
        let measured_wall = measure_start.elapsed();

        if early_stop {
            info!("Stop requested, ending measurement early...");
        } else {
            info!("Measurement period ended, stopping streams...");
        }
        self.set_phase(Phase::Stopping);
        self.shutdown(&streams, &mut workers).await;

        let measured_bytes = self.total_bytes().await.saturating_sub(baseline);
        let elapsed_secs = if early_stop {
            measured_wall.as_secs_f64()
        } else {
            measure_time.as_secs_f64()
        };
        let result = TestResult {
            measured_bytes,
            elapsed_secs,
            measured_wall_secs: measured_wall.as_secs_f64(),
            speed: compute_speed(measured_bytes, elapsed_secs, config.overhead_factor(), config.unit()),
            unit: config.unit(),
            early_stop,
            streams: self.stream_summaries(),
        };

        info!("Download test finished");
        info!(
            "Elapsed (measurement only): {:.2}s, Downloaded: {} bytes during measurement period",
            result.elapsed_secs, result.measured_bytes
        );
        info!("Download Speed: {}", result);

        self.set_phase(Phase::Complete);
        self.emit(TestEvent::Finished(result.clone()));
        info!("===== TEST COMPLETE =====");
        RunOutcome::Completed(result)
    }

    fn spawn_streams(&self, running: &CancellationToken) -> JoinSet<()> {
        info!("Starting {} parallel streams...", self.config.stream_count());
        let mut workers = JoinSet::new();
        for index in 0..self.config.stream_count() {
            let worker = StreamWorker::new(
                index,
                self.fetcher.clone(),
                self.config.server_url().clone(),
                self.config.ck_size(),
                self.ledger.clone(),
                self.stats.clone(),
                running.clone(),
            );
            workers.spawn(worker.run());
        }
        workers
    }

    /// Emits a progress report every [`SAMPLE_INTERVAL`] (shorter for the last one) until
    /// `deadline`, or until stopped when there is none. Returns `true` if a stop request
    /// cut the window short.
    async fn sample_until(&self, deadline: Option<Instant>, baseline: u64) -> bool {
        let measure_start = Instant::now();
        loop {
            let tick = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    (deadline - now).min(SAMPLE_INTERVAL)
                }
                None => SAMPLE_INTERVAL,
            };
            tokio::select! {
                _ = self.stop.cancelled() => return true,
                _ = time::sleep(tick) => {}
            }

            let report = ProgressReport {
                elapsed_measurement_secs: measure_start.elapsed().as_secs_f64(),
                bytes_since_baseline: self.total_bytes().await.saturating_sub(baseline),
            };
            info!("{}", report);
            self.emit(TestEvent::Progress(report));
        }
    }

    /// Stops every stream and waits for all of them to exit, aborting stragglers after
    /// [`SHUTDOWN_TIMEOUT`]. No byte is recorded once this returns.
    async fn shutdown(&self, streams: &CancellationToken, workers: &mut JoinSet<()>) {
        info!("Stopping all streams...");
        streams.cancel();

        let drained = time::timeout(SHUTDOWN_TIMEOUT, async {
            while let Some(joined) = workers.join_next().await {
                if let Err(e) = joined {
                    error!("Stream task failed: {}", e);
                }
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                "{} streams still running after {:?}, aborting them",
                workers.len(),
                SHUTDOWN_TIMEOUT
            );
            workers.shutdown().await;
        }

        let ledger = self.ledger.read().await;
        ledger.close_all();
        if ledger.is_empty() {
            info!("All streams stopped, no request was made.");
        } else {
            info!("All streams stopped after {} requests.", ledger.len());
        }
    }

    async fn total_bytes(&self) -> u64 {
        self.ledger.read().await.total_bytes()
    }

    fn stream_summaries(&self) -> Vec<StreamSummary> {
        let mut summaries: Vec<StreamSummary> =
            self.stats.iter().map(|entry| entry.value().clone()).collect();
        summaries.sort_by_key(|s| s.index);
        summaries
    }

    fn set_phase(&self, phase: Phase) {
        self.phase_tx.send_replace(phase);
    }

    fn warn(&self, message: &str) {
        warn!("{}", message);
        self.emit(TestEvent::Warning(message.to_string()));
    }

    fn emit(&self, event: TestEvent) {
        // the caller may have dropped its receiver
        let _ = self.event_tx.send(event);
    }
}
