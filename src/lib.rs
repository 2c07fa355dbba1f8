//! Latencyprobe - round-trip audio latency measurement
//!
//! This library re-exports the measurement engine from
//! `latencyprobe-core`: probe generation, duplex capture, FFT
//! cross-correlation detection, the trial controller, and statistics.

pub use latencyprobe_core::audio;
pub use latencyprobe_core::config;
pub use latencyprobe_core::controller;
pub use latencyprobe_core::error;
pub use latencyprobe_core::stats;

pub use latencyprobe_core::{
    run_measurement, CorrelationDetector, CpalDriver, DuplexDriver, DuplexSession,
    LatencyStatistics, LatencySummary, MeasurementConfig, MeasurementError, ProbeGenerator,
    ProbeWaveform, SyntheticConfig, SyntheticLoopback, TrialController, TrialEvent, TrialResult,
};
pub use latencyprobe_core::{BUILD_DATE, DEFAULT_PROBE_LENGTH, DEFAULT_SAMPLE_RATE, VERSION};
