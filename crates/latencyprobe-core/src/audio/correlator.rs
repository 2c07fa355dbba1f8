//! FFT cross-correlation probe detection.
//!
//! The detector is built once per run from the probe signal and reused
//! for every trial; construction allocates, detection reuses.

use rustfft::{num_complex::Complex, Fft, FftPlanner};
use std::sync::Arc;

/// Energies below this are treated as silence.
const ENERGY_FLOOR: f64 = 1e-10;

/// Where the probe was found in a capture window.
#[derive(Debug, Clone, Copy, Default)]
pub struct Detection {
    /// Lag of the probe's first sample within the window, in frames.
    pub offset: usize,
    /// How cleanly the peak beats the second-highest local maximum of
    /// the correlation, as `1 - runner_up / peak`, 0.0 to 1.0. A value
    /// of 0.5 means the peak is twice the runner-up; a rival echo of
    /// comparable strength drives it toward zero. Amplitude-invariant:
    /// attenuating the window scales both maxima alike.
    pub confidence: f32,
}

/// Locates a known probe inside capture windows by FFT
/// cross-correlation.
///
/// The FFT of the zero-padded probe is conjugated once up front; each
/// `detect` call costs one forward FFT, a spectrum multiply, one
/// inverse FFT, and two linear scans over candidate lags. The peak is
/// located on the normalized cross-correlation; confidence compares
/// that peak against the second-highest local maximum of the
/// correlation outside the peak's own lobe, so a window holding two
/// comparable probe copies reads as ambiguous rather than clean.
pub struct CorrelationDetector {
    probe_len: usize,
    max_window_len: usize,
    fft_size: usize,
    fft_forward: Arc<dyn Fft<f32>>,
    fft_inverse: Arc<dyn Fft<f32>>,
    /// Conjugated FFT of the zero-padded probe.
    probe_fft: Vec<Complex<f32>>,
    /// sqrt of the probe energy.
    probe_norm: f64,
    /// In-place FFT buffer, `fft_size` long.
    work: Vec<Complex<f32>>,
    /// FFT scratch, sized for the larger of the two plans.
    scratch: Vec<Complex<f32>>,
    /// Running window energy, `max_window_len + 1` entries.
    energy_prefix: Vec<f64>,
}

impl CorrelationDetector {
    /// Create a detector for `probe` scanning windows up to
    /// `max_window_len` frames.
    pub fn new(probe: &[f32], max_window_len: usize) -> Self {
        assert!(!probe.is_empty(), "probe must not be empty");
        let probe_len = probe.len();
        let max_window_len = max_window_len.max(probe_len);
        // Linear correlation needs room for window + probe without
        // circular wrap.
        let fft_size = (max_window_len + probe_len).next_power_of_two();

        let mut planner = FftPlanner::new();
        let fft_forward = planner.plan_fft_forward(fft_size);
        let fft_inverse = planner.plan_fft_inverse(fft_size);
        let scratch_len = fft_forward
            .get_inplace_scratch_len()
            .max(fft_inverse.get_inplace_scratch_len());

        // Pre-compute FFT of the zero-padded probe, conjugated for
        // correlation.
        let mut probe_fft: Vec<Complex<f32>> = probe
            .iter()
            .map(|&x| Complex::new(x, 0.0))
            .chain(std::iter::repeat(Complex::new(0.0, 0.0)))
            .take(fft_size)
            .collect();
        let mut scratch = vec![Complex::new(0.0, 0.0); scratch_len];
        fft_forward.process_with_scratch(&mut probe_fft, &mut scratch);
        for c in &mut probe_fft {
            c.im = -c.im;
        }

        let probe_energy: f64 = probe.iter().map(|&x| (x as f64) * (x as f64)).sum();

        Self {
            probe_len,
            max_window_len,
            fft_size,
            fft_forward,
            fft_inverse,
            probe_fft,
            probe_norm: probe_energy.sqrt(),
            work: vec![Complex::new(0.0, 0.0); fft_size],
            scratch,
            energy_prefix: vec![0.0; max_window_len + 1],
        }
    }

    /// Scan `window` for the probe. Windows shorter than the probe
    /// yield confidence 0; windows longer than the configured maximum
    /// are truncated.
    pub fn detect(&mut self, window: &[f32]) -> Detection {
        let window = &window[..window.len().min(self.max_window_len)];
        if window.len() < self.probe_len {
            return Detection::default();
        }

        // Zero-padded window into the FFT buffer.
        for (w, &x) in self.work.iter_mut().zip(window.iter()) {
            *w = Complex::new(x, 0.0);
        }
        for w in &mut self.work[window.len()..] {
            *w = Complex::new(0.0, 0.0);
        }

        self.fft_forward
            .process_with_scratch(&mut self.work, &mut self.scratch);
        for (w, p) in self.work.iter_mut().zip(&self.probe_fft) {
            *w *= *p;
        }
        self.fft_inverse
            .process_with_scratch(&mut self.work, &mut self.scratch);

        // Sliding segment energies from a prefix sum, so the per-lag
        // normalization stays O(1).
        self.energy_prefix[0] = 0.0;
        for (i, &x) in window.iter().enumerate() {
            self.energy_prefix[i + 1] = self.energy_prefix[i] + (x as f64) * (x as f64);
        }

        // Only lags where the whole probe fits inside the window.
        let max_lag = window.len() - self.probe_len;
        let norm = 1.0 / self.fft_size as f32;
        let mut best_offset = 0usize;
        let mut best_score = 0.0f32;

        if self.probe_norm <= ENERGY_FLOOR {
            return Detection::default();
        }

        // The peak is located on the normalized score; a quiet echo
        // competes on shape, not loudness.
        for k in 0..=max_lag {
            let segment_energy =
                (self.energy_prefix[k + self.probe_len] - self.energy_prefix[k]).max(0.0);
            if segment_energy <= ENERGY_FLOOR {
                continue;
            }
            let corr = ((self.work[k].re * norm).abs()) as f64;
            let score = (corr / (self.probe_norm * segment_energy.sqrt())) as f32;
            if score > best_score {
                best_score = score;
                best_offset = k;
            }
        }

        let peak = ((self.work[best_offset].re * norm).abs()) as f64;
        if peak <= ENERGY_FLOOR {
            return Detection::default();
        }

        // Runner-up: highest local maximum of the correlation
        // magnitude outside the peak's lobe. A second probe copy in
        // the window leaves a rival maximum here.
        let lobe = self.probe_len / 2;
        let mut runner_up = 0.0f64;
        let mut prev = 0.0f64;
        let mut value = ((self.work[0].re * norm).abs()) as f64;
        for k in 0..=max_lag {
            let next = if k < max_lag {
                ((self.work[k + 1].re * norm).abs()) as f64
            } else {
                0.0
            };
            if k.abs_diff(best_offset) > lobe
                && value >= prev
                && value >= next
                && value > runner_up
            {
                runner_up = value;
            }
            prev = value;
            value = next;
        }

        Detection {
            offset: best_offset,
            confidence: (((peak - runner_up) / peak) as f32).clamp(0.0, 1.0),
        }
    }

    pub fn probe_len(&self) -> usize {
        self.probe_len
    }

    pub fn max_window_len(&self) -> usize {
        self.max_window_len
    }

    pub fn fft_size(&self) -> usize {
        self.fft_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::probe::{ProbeGenerator, ProbeWaveform};

    fn mls_probe(length: usize) -> Vec<f32> {
        ProbeGenerator::new(ProbeWaveform::Mls, 48000, 0.5)
            .generate(length)
            .samples()
            .to_vec()
    }

    /// Deterministic pseudo-random noise in [-0.5, 0.5).
    fn lcg_noise(seed: &mut u32) -> f32 {
        *seed = seed.wrapping_mul(1103515245).wrapping_add(12345);
        ((*seed >> 16) & 0x7FFF) as f32 / 32768.0 - 0.5
    }

    fn window_with_probe(probe: &[f32], offset: usize, len: usize, gain: f32) -> Vec<f32> {
        let mut window = vec![0.0f32; len];
        for (i, &s) in probe.iter().enumerate() {
            window[offset + i] += s * gain;
        }
        window
    }

    #[test]
    fn test_detects_probe_at_known_offsets() {
        let probe = mls_probe(512);
        let mut detector = CorrelationDetector::new(&probe, 4096);

        for &offset in &[0usize, 1, 37, 100, 480, 1000, 3584] {
            let window = window_with_probe(&probe, offset, 4096, 1.0);
            let detection = detector.detect(&window);
            assert!(
                (detection.offset as i64 - offset as i64).abs() <= 1,
                "expected offset {}, got {}",
                offset,
                detection.offset
            );
            assert!(
                detection.confidence > 0.8,
                "clean probe at {} should be unambiguous, confidence {}",
                offset,
                detection.confidence
            );
        }
    }

    #[test]
    fn test_confidence_is_amplitude_invariant() {
        let probe = mls_probe(512);
        let mut detector = CorrelationDetector::new(&probe, 4096);

        let reference = detector.detect(&window_with_probe(&probe, 300, 4096, 1.0));
        assert!(reference.confidence > 0.8);

        for &gain in &[0.5f32, 0.1, 0.01] {
            let window = window_with_probe(&probe, 300, 4096, gain);
            let detection = detector.detect(&window);
            assert_eq!(detection.offset, 300, "gain {} shifted the peak", gain);
            assert!(
                (detection.confidence - reference.confidence).abs() < 0.01,
                "gain {} should not dent confidence, got {} against {}",
                gain,
                detection.confidence,
                reference.confidence
            );
        }
    }

    #[test]
    fn test_detects_attenuated_probe_in_noise() {
        let probe = mls_probe(512);
        let mut detector = CorrelationDetector::new(&probe, 4096);

        let mut window = window_with_probe(&probe, 700, 4096, 0.5);
        let mut seed = 0x2468u32;
        for sample in &mut window {
            *sample += lcg_noise(&mut seed) * 0.05;
        }

        let detection = detector.detect(&window);
        assert!(
            (detection.offset as i64 - 700).abs() <= 1,
            "noise moved the peak to {}",
            detection.offset
        );
        assert!(
            detection.confidence > 0.5,
            "confidence {} fell below threshold",
            detection.confidence
        );
    }

    #[test]
    fn test_inverted_polarity_still_detected() {
        let probe = mls_probe(512);
        let mut detector = CorrelationDetector::new(&probe, 4096);

        let window = window_with_probe(&probe, 250, 4096, -1.0);
        let detection = detector.detect(&window);
        assert_eq!(detection.offset, 250);
        assert!(detection.confidence > 0.8);
    }

    #[test]
    fn test_two_equal_echoes_score_ambiguous() {
        let probe = mls_probe(512);
        let mut detector = CorrelationDetector::new(&probe, 4096);

        let mut window = window_with_probe(&probe, 400, 4096, 0.6);
        for (i, &s) in probe.iter().enumerate() {
            window[2000 + i] += s * 0.6;
        }

        let detection = detector.detect(&window);
        assert!(
            detection.offset == 400 || detection.offset == 2000,
            "peak should land on one of the copies, got {}",
            detection.offset
        );
        assert!(
            detection.confidence < 0.5,
            "two equal echoes should read ambiguous, got {}",
            detection.confidence
        );
    }

    #[test]
    fn test_faint_ghost_only_dents_confidence() {
        let probe = mls_probe(512);
        let mut detector = CorrelationDetector::new(&probe, 4096);

        // Main echo plus a 30% reflection far outside the peak lobe,
        // in enough noise that the reflection cannot tie the peak.
        let mut window = window_with_probe(&probe, 400, 4096, 1.0);
        for (i, &s) in probe.iter().enumerate() {
            window[2600 + i] += s * 0.3;
        }
        let mut seed = 0x9e37u32;
        for sample in &mut window {
            *sample += lcg_noise(&mut seed) * 0.25;
        }

        let detection = detector.detect(&window);
        assert_eq!(detection.offset, 400);
        assert!(
            detection.confidence > 0.5 && detection.confidence < 0.8,
            "30% ghost should dent confidence to about 0.7, got {}",
            detection.confidence
        );
    }

    #[test]
    fn test_noise_only_scores_low() {
        let probe = mls_probe(512);
        let mut detector = CorrelationDetector::new(&probe, 4096);

        let mut seed = 0x1357u32;
        let window: Vec<f32> = (0..4096).map(|_| lcg_noise(&mut seed) * 0.4).collect();

        let detection = detector.detect(&window);
        assert!(
            detection.confidence < 0.5,
            "pure noise scored {}",
            detection.confidence
        );
    }

    #[test]
    fn test_silence_scores_zero() {
        let probe = mls_probe(512);
        let mut detector = CorrelationDetector::new(&probe, 4096);

        let detection = detector.detect(&vec![0.0f32; 4096]);
        assert_eq!(detection.confidence, 0.0);
        assert_eq!(detection.offset, 0);
    }

    #[test]
    fn test_window_shorter_than_probe() {
        let probe = mls_probe(512);
        let mut detector = CorrelationDetector::new(&probe, 4096);

        let detection = detector.detect(&[0.1f32; 100]);
        assert_eq!(detection.confidence, 0.0);
    }

    #[test]
    fn test_oversized_window_is_truncated() {
        let probe = mls_probe(512);
        let mut detector = CorrelationDetector::new(&probe, 2048);

        // Probe sits beyond the truncation point; only the leading
        // 2048 frames are scanned.
        let window = window_with_probe(&probe, 3000, 6000, 1.0);
        let detection = detector.detect(&window);
        assert!(detection.confidence < 0.5);
    }

    #[test]
    fn test_detector_is_reusable_across_trials() {
        let probe = mls_probe(256);
        let mut detector = CorrelationDetector::new(&probe, 2048);

        for &offset in &[10usize, 900, 42] {
            let window = window_with_probe(&probe, offset, 2048, 0.8);
            let detection = detector.detect(&window);
            assert_eq!(detection.offset, offset);
            assert!(detection.confidence > 0.8);
        }
    }
}
