//! Measurement configuration with JSON persistence.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::audio::probe::ProbeWaveform;
use crate::audio::ring::OverrunPolicy;
use crate::error::MeasurementError;
use crate::{DEFAULT_PROBE_LENGTH, DEFAULT_RING_CAPACITY, DEFAULT_SAMPLE_RATE, MAX_PROBE_LENGTH};

fn default_sample_rate() -> u32 {
    DEFAULT_SAMPLE_RATE
}

fn default_probe_length() -> usize {
    DEFAULT_PROBE_LENGTH
}

fn default_probe_amplitude() -> f32 {
    0.5
}

fn default_probe_waveform() -> ProbeWaveform {
    ProbeWaveform::Mls
}

fn default_trial_count() -> usize {
    20
}

fn default_trial_timeout_ms() -> u64 {
    1000
}

fn default_prime_ms() -> u64 {
    250
}

fn default_inter_trial_gap_ms() -> u64 {
    100
}

fn default_max_latency_ms() -> u64 {
    500
}

fn default_detection_threshold() -> f32 {
    0.5
}

fn default_outlier_iqr_multiple() -> f64 {
    1.5
}

fn default_ring_capacity() -> usize {
    DEFAULT_RING_CAPACITY
}

fn default_overrun_policy() -> OverrunPolicy {
    OverrunPolicy::RejectWrite
}

fn default_keepalive_level() -> f32 {
    0.005
}

fn default_device() -> Option<String> {
    None
}

/// Engine configuration. Every field has a serde default so partial
/// JSON files deserialize cleanly against the built-in values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeasurementConfig {
    /// Requested sample rate in Hz. Hardware may negotiate a different
    /// effective rate; all reporting uses the effective one.
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,

    /// Probe length in frames.
    #[serde(default = "default_probe_length")]
    pub probe_length: usize,

    /// Probe peak amplitude, 0.0..=1.0.
    #[serde(default = "default_probe_amplitude")]
    pub probe_amplitude: f32,

    /// Probe waveform.
    #[serde(default = "default_probe_waveform")]
    pub probe_waveform: ProbeWaveform,

    /// Default number of trials per run.
    #[serde(default = "default_trial_count")]
    pub trial_count: usize,

    /// Wall-clock deadline for a single trial in milliseconds.
    #[serde(default = "default_trial_timeout_ms")]
    pub trial_timeout_ms: u64,

    /// Settle period after stream start; captured audio from this
    /// period is discarded.
    #[serde(default = "default_prime_ms")]
    pub prime_ms: u64,

    /// Quiet gap between trials, letting echoes die out.
    #[serde(default = "default_inter_trial_gap_ms")]
    pub inter_trial_gap_ms: u64,

    /// Largest round-trip latency the detector will search for.
    #[serde(default = "default_max_latency_ms")]
    pub max_latency_ms: u64,

    /// Minimum correlation confidence for a trial to count.
    #[serde(default = "default_detection_threshold")]
    pub detection_threshold: f32,

    /// Trials outside this multiple of the inter-quartile range are
    /// dropped from the summary.
    #[serde(default = "default_outlier_iqr_multiple")]
    pub outlier_iqr_multiple: f64,

    /// Capture ring capacity in frames.
    #[serde(default = "default_ring_capacity")]
    pub ring_capacity: usize,

    /// Behavior when the capture ring fills up.
    #[serde(default = "default_overrun_policy")]
    pub overrun_policy: OverrunPolicy,

    /// Level of the background keep-alive signal, 0.0 disables it.
    #[serde(default = "default_keepalive_level")]
    pub keepalive_level: f32,

    /// Device name substring to open, or None for the system default.
    #[serde(default = "default_device")]
    pub device: Option<String>,
}

impl Default for MeasurementConfig {
    fn default() -> Self {
        Self {
            sample_rate: default_sample_rate(),
            probe_length: default_probe_length(),
            probe_amplitude: default_probe_amplitude(),
            probe_waveform: default_probe_waveform(),
            trial_count: default_trial_count(),
            trial_timeout_ms: default_trial_timeout_ms(),
            prime_ms: default_prime_ms(),
            inter_trial_gap_ms: default_inter_trial_gap_ms(),
            max_latency_ms: default_max_latency_ms(),
            detection_threshold: default_detection_threshold(),
            outlier_iqr_multiple: default_outlier_iqr_multiple(),
            ring_capacity: default_ring_capacity(),
            overrun_policy: default_overrun_policy(),
            keepalive_level: default_keepalive_level(),
            device: default_device(),
        }
    }
}

impl MeasurementConfig {
    /// Load configuration from a JSON file, falling back to defaults if
    /// the file is missing or malformed.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {:?}", path);
                    config
                }
                Err(e) => {
                    tracing::warn!("Failed to parse config {:?}: {}, using defaults", path, e);
                    Self::default()
                }
            },
            Err(_) => {
                tracing::info!("No config file at {:?}, using defaults", path);
                Self::default()
            }
        }
    }

    /// Write the configuration as pretty JSON, creating parent
    /// directories as needed.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<(), MeasurementError> {
        if !(8000..=384_000).contains(&self.sample_rate) {
            return Err(MeasurementError::InvalidConfig(format!(
                "sample rate {} outside 8000..=384000",
                self.sample_rate
            )));
        }
        if self.probe_length < 16 || self.probe_length > MAX_PROBE_LENGTH {
            return Err(MeasurementError::InvalidConfig(format!(
                "probe length {} outside 16..={}",
                self.probe_length, MAX_PROBE_LENGTH
            )));
        }
        if self.probe_amplitude <= 0.0 || self.probe_amplitude > 1.0 {
            return Err(MeasurementError::InvalidConfig(format!(
                "probe amplitude {} outside (0.0, 1.0]",
                self.probe_amplitude
            )));
        }
        if self.trial_count == 0 {
            return Err(MeasurementError::InvalidConfig(
                "trial count must be at least 1".into(),
            ));
        }
        if self.trial_timeout_ms == 0 {
            return Err(MeasurementError::InvalidConfig(
                "trial timeout must be nonzero".into(),
            ));
        }
        if self.max_latency_ms == 0 {
            return Err(MeasurementError::InvalidConfig(
                "max latency must be nonzero".into(),
            ));
        }
        if self.detection_threshold <= 0.0 || self.detection_threshold > 1.0 {
            return Err(MeasurementError::InvalidConfig(format!(
                "detection threshold {} outside (0.0, 1.0]",
                self.detection_threshold
            )));
        }
        if self.outlier_iqr_multiple <= 0.0 {
            return Err(MeasurementError::InvalidConfig(
                "outlier IQR multiple must be positive".into(),
            ));
        }
        if self.ring_capacity < self.probe_length * 2 {
            return Err(MeasurementError::InvalidConfig(format!(
                "ring capacity {} smaller than two probe lengths",
                self.ring_capacity
            )));
        }
        if !(0.0..1.0).contains(&self.keepalive_level) {
            return Err(MeasurementError::InvalidConfig(format!(
                "keepalive level {} outside [0.0, 1.0)",
                self.keepalive_level
            )));
        }
        Ok(())
    }

    /// Search span in frames at a given effective sample rate.
    pub fn max_latency_frames(&self, sample_rate: u32) -> usize {
        (self.max_latency_ms as usize * sample_rate as usize) / 1000
    }

    /// Settle period in frames at a given effective sample rate.
    pub fn prime_frames(&self, sample_rate: u32) -> u64 {
        (self.prime_ms * sample_rate as u64) / 1000
    }

    pub fn trial_timeout(&self) -> Duration {
        Duration::from_millis(self.trial_timeout_ms)
    }

    pub fn inter_trial_gap(&self) -> Duration {
        Duration::from_millis(self.inter_trial_gap_ms)
    }
}
