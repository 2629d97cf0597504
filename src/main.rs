use anyhow::Result;
use downspeed::{Config, HttpFetcher, Orchestrator, RunOutcome, TestEvent};
use std::path::Path;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG_PATH: &str = "downspeed.toml";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("downspeed=info")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let config_path = args.next();
    let mut config = load_config(config_path.as_deref())?;

    if let Some(url) = args.next().filter(|u| !u.is_empty()) {
        config.test.server_url = url;
    }
    if let Some(ck_size) = args.next() {
        match ck_size.parse() {
            Ok(ck_size) => config.test.ck_size = ck_size,
            Err(_) => warn!("Ignoring invalid ckSize {:?}, keeping {}", ck_size, config.test.ck_size),
        }
    }

    let test_config = config.test_config()?;
    info!(
        "Starting test with URL={}, ckSize={}",
        test_config.server_url(),
        test_config.ck_size()
    );

    let orchestrator = Orchestrator::new(HttpFetcher::new(&config.http));
    let mut handle = orchestrator.start(test_config);

    let stopper = handle.stopper();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping test");
            stopper.request_stop();
        }
    });

    while let Some(event) = handle.events().recv().await {
        match event {
            TestEvent::Progress(report) => println!("{}", report),
            TestEvent::Warning(message) => eprintln!("warning: {}", message),
            TestEvent::Finished(result) => {
                for stream in &result.streams {
                    println!(
                        "Stream {}: {} requests ({} ok, {} failed), {} bytes",
                        stream.index, stream.attempts, stream.completed, stream.failed, stream.bytes
                    );
                }
                println!(
                    "Downloaded {} bytes in {:.2}s",
                    result.measured_bytes, result.elapsed_secs
                );
                println!("Result: {}", result);
            }
            TestEvent::Aborted => println!("Result: -"),
        }
    }

    match handle.wait().await {
        RunOutcome::Completed(_) => Ok(()),
        RunOutcome::Aborted => anyhow::bail!("test aborted before the measurement started"),
        RunOutcome::Failed(reason) => anyhow::bail!("test run failed: {}", reason),
    }
}

/// An explicit path must exist; the default path falls back to built-in defaults.
fn load_config(path: Option<&str>) -> Result<Config> {
    match path {
        Some(path) => {
            info!("Loading config from {}", path);
            Config::from_file(path)
        }
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
            info!("Loading config from {}", DEFAULT_CONFIG_PATH);
            Config::from_file(DEFAULT_CONFIG_PATH)
        }
        None => {
            info!("No {} found, using defaults", DEFAULT_CONFIG_PATH);
            Ok(Config::default())
        }
    }
}
