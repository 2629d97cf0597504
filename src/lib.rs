pub mod config;
pub mod counter;
pub mod error;
pub mod fetch;
pub mod garbage;
pub mod orchestrator;
pub mod report;
pub mod stream;

pub use config::{Config, TestConfig};
pub use error::{ConfigError, FetchError};
pub use fetch::{Fetch, HttpFetcher};
pub use orchestrator::{Orchestrator, Phase, RunOutcome, StopHandle, TestEvent, TestHandle};
pub use report::{ProgressReport, SpeedUnit, StreamSummary, TestResult};
