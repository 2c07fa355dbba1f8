//! Error taxonomy for the measurement engine.

use thiserror::Error;

/// Errors surfaced by the measurement engine.
///
/// `TrialTimeout` and `DetectionAmbiguous` are per-trial failures: they
/// are recorded on the trial and the run keeps going. The remaining
/// variants end (or prevent) a run.
#[derive(Debug, Clone, Error)]
pub enum MeasurementError {
    /// The audio stream pair could not be opened. Nothing was measured.
    #[error("Failed to open audio stream: {0}")]
    StreamOpenFailure(String),

    /// The stream died mid-run (device disconnect, route change, stall).
    /// Valid trials collected before the interruption may still be
    /// summarized.
    #[error("Audio stream interrupted: {0}")]
    StreamInterrupted(String),

    /// A single trial did not produce a detection within its deadline.
    #[error("Trial {trial} timed out after {timeout_ms} ms")]
    TrialTimeout { trial: usize, timeout_ms: u64 },

    /// The correlation peak was too weak or implausible to trust.
    #[error("Trial {trial} detection ambiguous: confidence {confidence:.3} below threshold {threshold:.3}")]
    DetectionAmbiguous {
        trial: usize,
        confidence: f32,
        threshold: f32,
    },

    /// Too few successful trials to produce a summary.
    #[error("Insufficient samples: {valid} valid trials, {required} required")]
    InsufficientSamples { valid: usize, required: usize },

    /// Configuration rejected before the stream was opened.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl MeasurementError {
    /// Whether the error ends the whole run rather than a single trial.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            MeasurementError::TrialTimeout { .. } | MeasurementError::DetectionAmbiguous { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_per_trial_errors_are_not_fatal() {
        let timeout = MeasurementError::TrialTimeout {
            trial: 3,
            timeout_ms: 1000,
        };
        let ambiguous = MeasurementError::DetectionAmbiguous {
            trial: 0,
            confidence: 0.2,
            threshold: 0.5,
        };
        assert!(!timeout.is_fatal());
        assert!(!ambiguous.is_fatal());
    }

    #[test]
    fn test_run_level_errors_are_fatal() {
        assert!(MeasurementError::StreamOpenFailure("no device".into()).is_fatal());
        assert!(MeasurementError::StreamInterrupted("unplugged".into()).is_fatal());
        assert!(MeasurementError::InsufficientSamples {
            valid: 0,
            required: 3
        }
        .is_fatal());
    }

    #[test]
    fn test_error_messages_name_the_cause() {
        let err = MeasurementError::TrialTimeout {
            trial: 7,
            timeout_ms: 250,
        };
        let text = err.to_string();
        assert!(text.contains('7'), "message should include the trial index");
        assert!(text.contains("250"), "message should include the deadline");
    }
}
