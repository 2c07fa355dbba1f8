//! Trial state machine driving a measurement run.
//!
//! The controller owns the duplex session and walks every trial
//! through arm, capture, detect, record. All waiting happens on the
//! control thread with short poll sleeps; per-trial deadlines and the
//! stream stall watchdog run on wall clock, while all latency
//! arithmetic stays on the callback frame clock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError};

use crate::audio::correlator::CorrelationDetector;
use crate::audio::probe::ProbeGenerator;
use crate::audio::session::{DuplexDriver, DuplexSession, SessionEvent};
use crate::config::MeasurementConfig;
use crate::error::MeasurementError;
use crate::stats::{LatencyStatistics, LatencySummary};

/// Control-loop poll cadence.
const POLL_INTERVAL: Duration = Duration::from_millis(2);

/// Stream stall watchdog: no callback progress for this long means the
/// stream is dead even if the driver never reported an error.
const STALL_TIMEOUT: Duration = Duration::from_millis(500);

/// Frame budget for the gap between the capture snapshot and the probe
/// actually starting (a couple of device blocks).
const ARMING_MARGIN: usize = 8192;

/// Extra capture beyond the last searchable lag.
const CAPTURE_PAD: usize = 1024;

const PROGRESS_QUEUE_DEPTH: usize = 256;

/// Phases of a measurement run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrialPhase {
    Idle,
    Priming,
    ProbeArmed,
    Capturing,
    Detecting,
    Recorded,
    Finished,
}

/// Outcome of a single trial.
#[derive(Debug, Clone)]
pub struct TrialResult {
    pub trial: usize,
    pub latency_frames: Option<u64>,
    pub latency_ms: Option<f64>,
    /// How cleanly the correlation peak beat its runner-up, 0 when no
    /// detection ran.
    pub confidence: f32,
    pub success: bool,
    pub failure: Option<MeasurementError>,
}

impl TrialResult {
    pub fn success(trial: usize, latency_frames: u64, latency_ms: f64, confidence: f32) -> Self {
        Self {
            trial,
            latency_frames: Some(latency_frames),
            latency_ms: Some(latency_ms),
            confidence,
            success: true,
            failure: None,
        }
    }

    pub fn failure(trial: usize, confidence: f32, error: MeasurementError) -> Self {
        Self {
            trial,
            latency_frames: None,
            latency_ms: None,
            confidence,
            success: false,
            failure: Some(error),
        }
    }
}

/// Progress events emitted while a run executes.
#[derive(Debug, Clone)]
pub enum TrialEvent {
    Started { trial: usize, total: usize },
    Finished(TrialResult),
}

/// Runs measurement trials over a duplex session and reduces them into
/// a [`LatencySummary`].
pub struct TrialController {
    session: DuplexSession,
    detector: CorrelationDetector,
    config: MeasurementConfig,
    phase: TrialPhase,
    abort: Arc<AtomicBool>,
    progress_tx: Sender<TrialEvent>,
    progress_rx: Receiver<TrialEvent>,
    window: Vec<f32>,
    max_latency_frames: usize,
    last_rendered: u64,
    last_progress: Instant,
}

impl TrialController {
    /// Validate the configuration, generate the probe, open the
    /// stream, and build the detector.
    pub fn new(
        driver: Box<dyn DuplexDriver>,
        config: MeasurementConfig,
    ) -> Result<Self, MeasurementError> {
        config.validate()?;

        let probe = ProbeGenerator::new(
            config.probe_waveform,
            config.sample_rate,
            config.probe_amplitude,
        )
        .generate(config.probe_length);
        tracing::info!(
            waveform = ?probe.waveform(),
            length = probe.len(),
            duration_ms = %format!("{:.1}", probe.duration_ms()),
            "probe generated"
        );

        let session = DuplexSession::start(driver, &probe, &config)?;
        let rate = session.sample_rate();
        let max_latency_frames = config.max_latency_frames(rate);
        let max_window = ARMING_MARGIN + probe.len() + max_latency_frames;
        let detector = CorrelationDetector::new(probe.samples(), max_window);
        let (progress_tx, progress_rx) = bounded(PROGRESS_QUEUE_DEPTH);

        Ok(Self {
            session,
            detector,
            config,
            phase: TrialPhase::Idle,
            abort: Arc::new(AtomicBool::new(false)),
            progress_tx,
            progress_rx,
            window: Vec::with_capacity(max_window),
            max_latency_frames,
            last_rendered: 0,
            last_progress: Instant::now(),
        })
    }

    /// Progress event stream; clone per subscriber.
    pub fn progress(&self) -> Receiver<TrialEvent> {
        self.progress_rx.clone()
    }

    /// Flag ending the run early after the current trial. The partial
    /// results are summarized the same way an interruption is.
    pub fn abort_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.abort)
    }

    pub fn phase(&self) -> TrialPhase {
        self.phase
    }

    pub fn sample_rate(&self) -> u32 {
        self.session.sample_rate()
    }

    /// Execute `trials` trials and summarize them.
    pub fn run(&mut self, trials: usize) -> Result<LatencySummary, MeasurementError> {
        if trials == 0 {
            return Err(MeasurementError::InvalidConfig(
                "trial count must be at least 1".into(),
            ));
        }
        let rate = self.session.sample_rate();
        let mut stats = LatencyStatistics::new(self.config.outlier_iqr_multiple);
        let mut interrupted_reason: Option<String> = None;
        let mut aborted = false;

        self.phase = TrialPhase::Priming;
        if let Err(err) = self.prime() {
            interrupted_reason = Some(stream_reason(err));
        }

        if interrupted_reason.is_none() {
            for trial in 0..trials {
                if self.abort.load(Ordering::Acquire) {
                    tracing::info!(completed = stats.completed(), "measurement aborted");
                    aborted = true;
                    break;
                }
                let _ = self.progress_tx.try_send(TrialEvent::Started {
                    trial,
                    total: trials,
                });

                match self.run_trial(trial) {
                    Ok(result) => {
                        self.phase = TrialPhase::Recorded;
                        let _ = self.progress_tx.try_send(TrialEvent::Finished(result.clone()));
                        stats.record(result);
                    }
                    Err(err) => {
                        tracing::warn!(trial, error = %err, "run cut short");
                        interrupted_reason = Some(stream_reason(err));
                        break;
                    }
                }

                if trial + 1 < trials {
                    if let Err(err) = self.quiet_gap() {
                        interrupted_reason = Some(stream_reason(err));
                        break;
                    }
                }
            }
        }

        self.phase = TrialPhase::Finished;
        self.session.stop();

        let interrupted = aborted || interrupted_reason.is_some();
        match stats.summarize(trials, interrupted, rate) {
            Ok(summary) => {
                tracing::info!(
                    valid = summary.valid_trials,
                    median_ms = %format!("{:.2}", summary.median_ms),
                    rejected_outliers = summary.rejected_outliers,
                    interrupted,
                    "measurement complete"
                );
                Ok(summary)
            }
            Err(err) => match interrupted_reason {
                // The interruption is the root cause when it also
                // starved the summary.
                Some(reason) => Err(MeasurementError::StreamInterrupted(reason)),
                None => Err(err),
            },
        }
    }

    /// One trial: arm, capture, detect. Per-trial failures come back
    /// as a failed [`TrialResult`]; `Err` means the stream is gone.
    fn run_trial(&mut self, trial: usize) -> Result<TrialResult, MeasurementError> {
        let deadline = Instant::now() + self.config.trial_timeout();
        let rate = self.session.sample_rate();
        let probe_len = self.detector.probe_len();

        loop {
            self.phase = TrialPhase::ProbeArmed;
            self.drain_stale_events()?;
            self.session.discard_captured();
            let overruns_before = self.session.overruns();
            let window_start = self.session.capture_frame();
            self.session.arm_probe();
            tracing::trace!(trial, window_start, "trial armed");

            let probe_start = loop {
                if let Some(frame) = self.next_probe_start()? {
                    break frame;
                }
                if Instant::now() >= deadline {
                    tracing::warn!(trial, "probe did not start before the deadline");
                    return Ok(self.timeout_result(trial));
                }
                self.check_stream_health()?;
                std::thread::sleep(POLL_INTERVAL);
            };

            self.phase = TrialPhase::Capturing;
            let lead = probe_start.saturating_sub(window_start) as usize;
            let needed = (lead + probe_len + self.max_latency_frames + CAPTURE_PAD)
                .min(self.detector.max_window_len());
            self.window.clear();

            let mut overran = false;
            while self.window.len() < needed {
                if Instant::now() >= deadline {
                    tracing::warn!(
                        trial,
                        captured = self.window.len(),
                        needed,
                        "capture window incomplete at deadline"
                    );
                    return Ok(self.timeout_result(trial));
                }
                self.check_stream_health()?;
                if self.session.overruns() != overruns_before {
                    let discarded = self.session.recover_overrun();
                    tracing::warn!(trial, discarded, "capture overrun, restarting window");
                    overran = true;
                    break;
                }
                let want = needed - self.window.len();
                if self.session.drain_captured(&mut self.window, want) == 0 {
                    std::thread::sleep(POLL_INTERVAL);
                }
            }
            if overran {
                continue;
            }
            // A drop after the final drain would mean the window holds
            // non-contiguous audio.
            if self.session.overruns() != overruns_before {
                self.session.recover_overrun();
                continue;
            }

            self.phase = TrialPhase::Detecting;
            let detection = self.detector.detect(&self.window);
            let detect_frame = window_start + detection.offset as u64;
            let latency_frames = detect_frame as i64 - probe_start as i64;

            if detection.confidence < self.config.detection_threshold {
                tracing::debug!(
                    trial,
                    confidence = %format!("{:.3}", detection.confidence),
                    "detection below threshold"
                );
                return Ok(TrialResult::failure(
                    trial,
                    detection.confidence,
                    MeasurementError::DetectionAmbiguous {
                        trial,
                        confidence: detection.confidence,
                        threshold: self.config.detection_threshold,
                    },
                ));
            }
            if latency_frames < 0 || latency_frames as usize > self.max_latency_frames {
                tracing::debug!(trial, latency_frames, "peak outside the plausible range");
                return Ok(TrialResult::failure(
                    trial,
                    detection.confidence,
                    MeasurementError::DetectionAmbiguous {
                        trial,
                        confidence: detection.confidence,
                        threshold: self.config.detection_threshold,
                    },
                ));
            }

            let latency_ms = latency_frames as f64 * 1000.0 / rate as f64;
            tracing::debug!(
                trial,
                latency_frames,
                latency_ms = %format!("{:.3}", latency_ms),
                confidence = %format!("{:.3}", detection.confidence),
                "trial recorded"
            );
            return Ok(TrialResult::success(
                trial,
                latency_frames as u64,
                latency_ms,
                detection.confidence,
            ));
        }
    }

    /// Wait out the settle period, discarding captured audio.
    fn prime(&mut self) -> Result<(), MeasurementError> {
        let target = self.config.prime_frames(self.session.sample_rate());
        while self.session.rendered_frames() < target {
            if self.abort.load(Ordering::Acquire) {
                return Ok(());
            }
            self.check_stream_health()?;
            self.session.discard_captured();
            std::thread::sleep(POLL_INTERVAL);
        }
        let discarded = self.session.discard_captured();
        tracing::debug!(frames = target, discarded, "priming complete");
        Ok(())
    }

    /// Inter-trial quiet gap letting echoes die out.
    fn quiet_gap(&mut self) -> Result<(), MeasurementError> {
        let until = Instant::now() + self.config.inter_trial_gap();
        while Instant::now() < until {
            if self.abort.load(Ordering::Acquire) {
                return Ok(());
            }
            self.check_stream_health()?;
            self.session.discard_captured();
            std::thread::sleep(POLL_INTERVAL);
        }
        self.session.discard_captured();
        Ok(())
    }

    /// Poll for the next probe start event.
    fn next_probe_start(&mut self) -> Result<Option<u64>, MeasurementError> {
        match self.session.events().try_recv() {
            Ok(SessionEvent::ProbeStarted { output_frame }) => Ok(Some(output_frame)),
            Ok(SessionEvent::Interrupted { reason }) => {
                Err(MeasurementError::StreamInterrupted(reason))
            }
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(MeasurementError::StreamInterrupted(
                "event channel closed".into(),
            )),
        }
    }

    /// Discard events left over from a previous trial (a timed-out
    /// trial's probe may have started after its deadline).
    fn drain_stale_events(&mut self) -> Result<(), MeasurementError> {
        loop {
            match self.session.events().try_recv() {
                Ok(SessionEvent::ProbeStarted { output_frame }) => {
                    tracing::trace!(output_frame, "discarding stale probe start");
                }
                Ok(SessionEvent::Interrupted { reason }) => {
                    return Err(MeasurementError::StreamInterrupted(reason));
                }
                Err(TryRecvError::Empty) => return Ok(()),
                Err(TryRecvError::Disconnected) => {
                    return Err(MeasurementError::StreamInterrupted(
                        "event channel closed".into(),
                    ));
                }
            }
        }
    }

    /// Interruption flag plus the stall watchdog.
    fn check_stream_health(&mut self) -> Result<(), MeasurementError> {
        if self.session.is_interrupted() {
            return Err(MeasurementError::StreamInterrupted(
                self.take_interrupt_reason(),
            ));
        }
        let rendered = self.session.rendered_frames();
        if rendered != self.last_rendered {
            self.last_rendered = rendered;
            self.last_progress = Instant::now();
        } else if self.last_progress.elapsed() >= STALL_TIMEOUT {
            return Err(MeasurementError::StreamInterrupted(format!(
                "no callback progress for {} ms",
                STALL_TIMEOUT.as_millis()
            )));
        }
        Ok(())
    }

    fn take_interrupt_reason(&mut self) -> String {
        let mut reason = None;
        while let Ok(event) = self.session.events().try_recv() {
            if let SessionEvent::Interrupted { reason: r } = event {
                reason = Some(r);
            }
        }
        reason.unwrap_or_else(|| "driver reported a stream error".into())
    }

    fn timeout_result(&self, trial: usize) -> TrialResult {
        TrialResult::failure(
            trial,
            0.0,
            MeasurementError::TrialTimeout {
                trial,
                timeout_ms: self.config.trial_timeout_ms,
            },
        )
    }
}

fn stream_reason(err: MeasurementError) -> String {
    match err {
        MeasurementError::StreamInterrupted(reason) => reason,
        other => other.to_string(),
    }
}

/// Run a complete measurement: open the driver, execute `trials`
/// trials, and return the summary. Callers that want progress events
/// build a [`TrialController`] directly.
pub fn run_measurement(
    driver: Box<dyn DuplexDriver>,
    trials: usize,
    config: &MeasurementConfig,
) -> Result<LatencySummary, MeasurementError> {
    let mut controller = TrialController::new(driver, config.clone())?;
    controller.run(trials)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::synthetic::{SyntheticConfig, SyntheticLoopback};
    use approx::assert_relative_eq;

    fn fast_config() -> MeasurementConfig {
        let mut config = MeasurementConfig::default();
        config.probe_length = 512;
        config.max_latency_ms = 60;
        config.prime_ms = 30;
        config.inter_trial_gap_ms = 10;
        config.trial_timeout_ms = 4000;
        config.ring_capacity = 1 << 15;
        config
    }

    fn paced_driver(delay_frames: usize, gain: f32, noise_level: f32) -> SyntheticLoopback {
        SyntheticLoopback::new(SyntheticConfig {
            delay_frames,
            block_frames: 256,
            gain,
            noise_level,
            paced: true,
            time_scale: 8.0,
            ..Default::default()
        })
    }

    struct FailingDriver;

    impl DuplexDriver for FailingDriver {
        fn start(
            &mut self,
            _render: crate::audio::session::RenderFn,
            _on_error: crate::audio::session::ErrorFn,
        ) -> Result<u32, MeasurementError> {
            Err(MeasurementError::StreamOpenFailure("no such device".into()))
        }

        fn stop(&mut self) {}
    }

    #[test]
    fn test_measures_synthetic_delay_exactly() {
        let config = fast_config();
        let driver = paced_driver(960, 0.9, 0.002);
        let mut controller =
            TrialController::new(Box::new(driver), config).expect("controller start");
        let progress = controller.progress();

        let summary = controller.run(5).expect("run should summarize");
        assert_eq!(controller.phase(), TrialPhase::Finished);
        assert_eq!(summary.valid_trials, 5);
        assert_eq!(summary.rejected_outliers, 0);
        assert_relative_eq!(summary.median_ms, 20.0, epsilon = 1.0);
        assert!(!summary.interrupted);

        // Every trial lands on the exact loopback delay.
        let mut finished = 0;
        while let Ok(event) = progress.try_recv() {
            if let TrialEvent::Finished(result) = event {
                assert_eq!(result.latency_frames, Some(960));
                assert!(result.confidence > 0.7);
                finished += 1;
            }
        }
        assert_eq!(finished, 5);
    }

    #[test]
    fn test_muted_loopback_is_ambiguous_not_fatal() {
        let config = fast_config();
        let driver = paced_driver(960, 0.0, 0.0);
        let mut controller =
            TrialController::new(Box::new(driver), config).expect("controller start");
        let progress = controller.progress();

        match controller.run(4) {
            Err(MeasurementError::InsufficientSamples { valid, required }) => {
                assert_eq!(valid, 0);
                assert_eq!(required, 3);
            }
            other => panic!("expected InsufficientSamples, got {:?}", other.map(|s| s.median_ms)),
        }

        let ambiguous = progress
            .try_iter()
            .filter(|event| {
                matches!(
                    event,
                    TrialEvent::Finished(TrialResult {
                        failure: Some(MeasurementError::DetectionAmbiguous { .. }),
                        ..
                    })
                )
            })
            .count();
        assert_eq!(ambiguous, 4, "every trial should fail as ambiguous");
    }

    #[test]
    fn test_all_timeouts_end_in_insufficient_samples() {
        let mut config = fast_config();
        config.trial_timeout_ms = 1;
        let driver = SyntheticLoopback::new(SyntheticConfig {
            delay_frames: 960,
            block_frames: 256,
            gain: 0.9,
            paced: true,
            time_scale: 1.0,
            ..Default::default()
        });
        let mut controller =
            TrialController::new(Box::new(driver), config).expect("controller start");
        let progress = controller.progress();

        match controller.run(10) {
            Err(MeasurementError::InsufficientSamples { valid, .. }) => assert_eq!(valid, 0),
            other => panic!("expected InsufficientSamples, got {:?}", other.map(|s| s.median_ms)),
        }

        let timeouts = progress
            .try_iter()
            .filter(|event| {
                matches!(
                    event,
                    TrialEvent::Finished(TrialResult {
                        failure: Some(MeasurementError::TrialTimeout { .. }),
                        ..
                    })
                )
            })
            .count();
        assert_eq!(timeouts, 10, "every trial should time out");
    }

    #[test]
    fn test_midrun_interruption_returns_partial_summary() {
        let config = fast_config();
        let driver = paced_driver(480, 0.9, 0.0);
        let pump = driver.pump_handle();
        let mut controller =
            TrialController::new(Box::new(driver), config).expect("controller start");
        let progress = controller.progress();

        let watcher = std::thread::spawn(move || {
            let mut finished = 0;
            while let Ok(event) = progress.recv() {
                if matches!(event, TrialEvent::Finished(_)) {
                    finished += 1;
                    if finished == 4 {
                        pump.fail_with("device yanked");
                        return;
                    }
                }
            }
        });

        let summary = controller.run(40).expect("partial summary");
        watcher.join().expect("watcher join");

        assert!(summary.interrupted, "summary should be flagged interrupted");
        assert!(summary.valid_trials >= 3);
        assert!(summary.trials_completed < 40);
        assert_relative_eq!(summary.median_ms, 10.0, epsilon = 1.0);
    }

    #[test]
    fn test_abort_flag_ends_run_early() {
        let config = fast_config();
        let driver = paced_driver(480, 0.9, 0.0);
        let mut controller =
            TrialController::new(Box::new(driver), config).expect("controller start");
        let progress = controller.progress();
        let abort = controller.abort_handle();

        let watcher = std::thread::spawn(move || {
            let mut finished = 0;
            while let Ok(event) = progress.recv() {
                if matches!(event, TrialEvent::Finished(_)) {
                    finished += 1;
                    if finished == 4 {
                        abort.store(true, Ordering::Release);
                        return;
                    }
                }
            }
        });

        let summary = controller.run(40).expect("aborted run still summarizes");
        watcher.join().expect("watcher join");

        assert!(summary.interrupted);
        assert!(summary.valid_trials >= 3);
        assert!(summary.trials_completed < 40);
    }

    #[test]
    fn test_open_failure_is_fatal() {
        match TrialController::new(Box::new(FailingDriver), fast_config()) {
            Err(MeasurementError::StreamOpenFailure(reason)) => {
                assert!(reason.contains("no such device"));
            }
            Ok(_) => panic!("expected StreamOpenFailure"),
            Err(other) => panic!("expected StreamOpenFailure, got {}", other),
        }
    }

    #[test]
    fn test_validation_runs_before_the_driver_opens() {
        let mut config = fast_config();
        config.probe_length = 0;
        match TrialController::new(Box::new(FailingDriver), config) {
            Err(MeasurementError::InvalidConfig(_)) => {}
            Ok(_) => panic!("expected InvalidConfig"),
            Err(other) => panic!("expected InvalidConfig, got {}", other),
        }
    }

    #[test]
    fn test_run_measurement_convenience() {
        let config = fast_config();
        let driver = paced_driver(576, 0.9, 0.001);
        let summary = run_measurement(Box::new(driver), 3, &config).expect("measurement");
        assert_eq!(summary.trials_requested, 3);
        assert_eq!(summary.valid_trials, 3);
        assert_relative_eq!(summary.median_ms, 12.0, epsilon = 1.0);
    }
}
