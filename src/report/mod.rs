use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeedUnit {
    /// Decimal megabits, 10^6 bits.
    Megabits,
    /// Binary mebibits, 2^20 bits.
    Mebibits,
}

impl SpeedUnit {
    pub fn from_binary(use_binary_units: bool) -> Self {
        if use_binary_units {
            SpeedUnit::Mebibits
        } else {
            SpeedUnit::Megabits
        }
    }

    pub fn divisor(self) -> f64 {
        match self {
            SpeedUnit::Megabits => 1_000_000.0,
            SpeedUnit::Mebibits => 1_048_576.0,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            SpeedUnit::Megabits => "Mbps",
            SpeedUnit::Mebibits => "Mebibits/s",
        }
    }
}

impl fmt::Display for SpeedUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// `bytes * 8 * overhead / (elapsed * divisor)`. A non-positive window yields zero
/// rather than an infinite or NaN speed.
pub fn compute_speed(measured_bytes: u64, elapsed_secs: f64, overhead_factor: f64, unit: SpeedUnit) -> f64 {
    if elapsed_secs <= 0.0 || !elapsed_secs.is_finite() {
        return 0.0;
    }
    (measured_bytes as f64 * 8.0 * overhead_factor) / (elapsed_secs * unit.divisor())
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressReport {
    pub elapsed_measurement_secs: f64,
    pub bytes_since_baseline: u64,
}

impl fmt::Display for ProgressReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[Progress Update] Elapsed: {:.2}s, Downloaded: {} bytes during measurement",
            self.elapsed_measurement_secs, self.bytes_since_baseline
        )
    }
}

/// Per-stream attempt statistics for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamSummary {
    pub index: usize,
    pub attempts: u64,
    pub completed: u64,
    pub failed: u64,
    pub bytes: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TestResult {
    pub measured_bytes: u64,
    /// Seconds the speed was divided by: the nominal window, or the actual one after an early stop.
    pub elapsed_secs: f64,
    /// Wall-clock seconds actually spent between baseline and final sample.
    pub measured_wall_secs: f64,
    pub speed: f64,
    pub unit: SpeedUnit,
    pub early_stop: bool,
    pub streams: Vec<StreamSummary>,
}

impl fmt::Display for TestResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2} {}", self.speed, self.unit)
    }
}
