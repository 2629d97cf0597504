use crate::error::ConfigError;
use crate::report::SpeedUnit;
use http::Uri;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub test: TestSection,
    pub http: HttpConfig,
}

/// Raw `[test]` table, validated into a [`TestConfig`] before use.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TestSection {
    pub server_url: String,
    pub ck_size: u32,
    pub test_duration_secs: f64,
    pub grace_time_secs: f64,
    pub stream_count: usize,
    pub overhead_factor: f64,
    pub use_mebibits: bool,
}

impl Default for TestSection {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8080/garbage".to_string(),
            ck_size: 100,
            test_duration_secs: 15.0,
            grace_time_secs: 1.5,
            stream_count: 6,
            overhead_factor: 1.06,
            use_mebibits: false,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct HttpConfig {
    pub connect_timeout_ms: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5000,
        }
    }
}

impl HttpConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl Config {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    pub fn test_config(&self) -> Result<TestConfig, ConfigError> {
        let t = &self.test;
        TestConfig::configure(
            &t.server_url,
            t.ck_size,
            t.test_duration_secs,
            t.grace_time_secs,
            t.stream_count,
            t.overhead_factor,
            t.use_mebibits,
        )
    }
}

/// A fully resolved test configuration. Only obtainable through [`TestConfig::configure`],
/// so a value of this type always has a positive measurement window.
#[derive(Debug, Clone, PartialEq)]
pub struct TestConfig {
    server_url: Uri,
    ck_size: u32,
    test_duration: Duration,
    grace_time: Duration,
    stream_count: usize,
    overhead_factor: f64,
    unit: SpeedUnit,
}

impl TestConfig {
    pub fn configure(
        server_url: &str,
        ck_size: u32,
        test_duration: f64,
        grace_time: f64,
        stream_count: usize,
        overhead_factor: f64,
        use_binary_units: bool,
    ) -> Result<Self, ConfigError> {
        let server_url = parse_server_url(server_url)?;

        if ck_size == 0 {
            return Err(ConfigError::ZeroChunkSize);
        }

        let test_duration = seconds("test_duration", test_duration)?;
        let grace_time = seconds("grace_time", grace_time)?;
        if grace_time >= test_duration {
            return Err(ConfigError::GraceExceedsDuration {
                grace_time: grace_time.as_secs_f64(),
                test_duration: test_duration.as_secs_f64(),
            });
        }

        if !overhead_factor.is_finite() || overhead_factor <= 0.0 {
            return Err(ConfigError::InvalidOverhead(overhead_factor));
        }

        Ok(Self {
            server_url,
            ck_size,
            test_duration,
            grace_time,
            stream_count,
            overhead_factor,
            unit: SpeedUnit::from_binary(use_binary_units),
        })
    }

    pub fn server_url(&self) -> &Uri {
        &self.server_url
    }

    pub fn ck_size(&self) -> u32 {
        self.ck_size
    }

    pub fn test_duration(&self) -> Duration {
        self.test_duration
    }

    pub fn grace_time(&self) -> Duration {
        self.grace_time
    }

    /// Nominal length of the measurement window, `test_duration - grace_time`.
    pub fn measure_time(&self) -> Duration {
        self.test_duration - self.grace_time
    }

    pub fn stream_count(&self) -> usize {
        self.stream_count
    }

    pub fn overhead_factor(&self) -> f64 {
        self.overhead_factor
    }

    pub fn unit(&self) -> SpeedUnit {
        self.unit
    }
}

fn parse_server_url(raw: &str) -> Result<Uri, ConfigError> {
    let uri: Uri = raw.parse().map_err(|e: http::uri::InvalidUri| ConfigError::InvalidUrl {
        url: raw.to_string(),
        reason: e.to_string(),
    })?;

    match uri.scheme_str() {
        Some("http") => {}
        Some(other) => return Err(ConfigError::UnsupportedScheme(other.to_string())),
        None => {
            return Err(ConfigError::InvalidUrl {
                url: raw.to_string(),
                reason: "missing scheme".to_string(),
            });
        }
    }

    if uri.host().is_none() {
        return Err(ConfigError::InvalidUrl {
            url: raw.to_string(),
            reason: "missing host".to_string(),
        });
    }

    Ok(uri)
}

fn seconds(name: &'static str, value: f64) -> Result<Duration, ConfigError> {
    if !value.is_finite() || value < 0.0 {
        return Err(ConfigError::NegativeDuration { name, value });
    }
    Duration::try_from_secs_f64(value).map_err(|_| ConfigError::DurationOutOfRange { name, value })
}
