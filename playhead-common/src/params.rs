//! Sink tuning parameters
//!
//! Every fixed window and cadence used by the sink's timing state machines,
//! gathered into one struct so tests and deployments can tighten or relax
//! them without touching the state machines themselves.
//!
//! # Configuration Philosophy
//!
//! - **Built-in defaults**: the canonical values live in code (`Default`)
//! - **TOML optional**: a deployment may override individual fields from a
//!   TOML file; missing fields keep their defaults
//! - **Immutable at runtime**: the struct is handed to the sink at
//!   construction and never changes while a stream is open

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::Path;

/// Tuning parameters for the sink's timing state machines.
///
/// All durations are microseconds unless the field name says otherwise.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SinkTuning {
    /// Timestamp poll interval while initializing or holding a
    /// not-yet-advancing timestamp
    pub fast_poll_interval_us: i64,

    /// Timestamp poll interval once the timestamp is advancing, or once
    /// timestamps are known to be unavailable
    pub slow_poll_interval_us: i64,

    /// Timestamp poll interval after a rejected (spurious) timestamp.
    /// Intentionally shorter than the slow interval: a rejected timestamp
    /// may become valid again quickly, an absent one will not.
    pub error_poll_interval_us: i64,

    /// How long to wait for a first timestamp before concluding the route
    /// does not provide them
    pub initializing_duration_us: i64,

    /// Window over which a switch between position-estimation modes is
    /// linearly smoothed
    pub mode_switch_smoothing_duration_us: i64,

    /// Minimum interval between samples of the raw-counter/system-clock
    /// offset used for the smoothed position estimate
    pub playhead_offset_sample_interval_us: i64,

    /// Number of raw-counter offset samples averaged for smoothing
    pub playhead_offset_count: usize,

    /// Minimum interval between raw counter reads, in milliseconds
    pub raw_position_update_interval_ms: i64,

    /// Minimum interval between device latency queries
    pub latency_sample_interval_us: i64,

    /// Timestamps offset from the system clock (or from the counter-derived
    /// position) by more than this are rejected as spurious
    pub max_timestamp_offset_us: i64,

    /// Latency readings above this are reported and treated as zero
    pub max_latency_us: i64,

    /// How long the counter may sit at zero while the device claims to be
    /// playing (with data written) before the device is declared stalled,
    /// in milliseconds
    pub stall_timeout_ms: i64,

    /// Presentation times diverging from the expected value by more than
    /// this force a start-time resynchronization
    pub discontinuity_threshold_us: i64,

    /// How long initialization or write failures may recur before the
    /// pending error is finally surfaced, in milliseconds
    pub retry_deadline_ms: i64,

    /// Debounce window for batching adjacent silence-skip reports, in
    /// milliseconds
    pub silence_report_debounce_ms: i64,

    /// Minimum accumulated skipped-silence duration worth reporting
    pub min_reported_silence_us: i64,
}

impl Default for SinkTuning {
    fn default() -> Self {
        Self {
            fast_poll_interval_us: 10_000,
            slow_poll_interval_us: 10_000_000,
            error_poll_interval_us: 500_000,
            initializing_duration_us: 500_000,
            mode_switch_smoothing_duration_us: 1_000_000,
            playhead_offset_sample_interval_us: 30_000,
            playhead_offset_count: 10,
            raw_position_update_interval_ms: 5,
            latency_sample_interval_us: 500_000,
            max_timestamp_offset_us: 5_000_000,
            max_latency_us: 5_000_000,
            stall_timeout_ms: 200,
            discontinuity_threshold_us: 200_000,
            retry_deadline_ms: 100,
            silence_report_debounce_ms: 100,
            min_reported_silence_us: 300_000,
        }
    }
}

impl SinkTuning {
    /// Parse tuning overrides from a TOML string. Fields not present keep
    /// their built-in defaults.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| Error::Parse(e.to_string()))
    }

    /// Load tuning overrides from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }
}
