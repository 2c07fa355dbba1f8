//! Latencyprobe Core - probe generation, duplex capture, and latency statistics
//!
//! This library measures round-trip audio latency through real or
//! synthetic duplex streams. It plays a known probe signal on the
//! output, captures the input through a lock-free ring, locates the
//! probe's echo by FFT cross-correlation on a shared frame clock, and
//! reduces repeated trials into a robust summary.

pub mod audio;
pub mod config;
pub mod controller;
pub mod error;
pub mod stats;

pub use audio::correlator::{CorrelationDetector, Detection};
pub use audio::hardware::CpalDriver;
pub use audio::probe::{ProbeGenerator, ProbeSignal, ProbeWaveform};
pub use audio::ring::{FrameRing, FrameRingReader, FrameRingWriter, OverrunPolicy};
pub use audio::session::{DuplexDriver, DuplexSession, ErrorFn, RenderFn, SessionEvent};
pub use audio::synthetic::{SyntheticConfig, SyntheticLoopback, SyntheticPump};
pub use config::MeasurementConfig;
pub use controller::{run_measurement, TrialController, TrialEvent, TrialPhase, TrialResult};
pub use error::MeasurementError;
pub use stats::{LatencyStatistics, LatencySummary};

/// Application version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build date stamped by build.rs (YYYY-MM-DD)
pub const BUILD_DATE: &str = env!("BUILD_DATE");

/// Default sample rate for audio processing
pub const DEFAULT_SAMPLE_RATE: u32 = 48000;

/// Default probe length in frames
pub const DEFAULT_PROBE_LENGTH: usize = 2048;

/// Default capture ring capacity in frames
pub const DEFAULT_RING_CAPACITY: usize = 65536;

/// Longest supported probe (an order-15 maximum length sequence)
pub const MAX_PROBE_LENGTH: usize = (1 << 15) - 1;
