//! Deterministic probe signal generation.
//!
//! Probes are generated in full before the stream starts; the render
//! callback only copies from the finished buffer.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Feedback masks for a Galois LFSR by order (from Xilinx XAPP052).
/// Index 0 and 1 are unused placeholders.
const LFSR_MASKS: [u32; 16] = [
    0x0, 0x0, 0x3, 0x6, 0xC, 0x14, 0x30, 0x60, 0xB8, 0x110, 0x240, 0x500, 0xE08, 0x1C80, 0x3802,
    0x6000,
];

/// Largest supported LFSR order; period 2^15 - 1 = 32767 samples.
pub const MAX_LFSR_ORDER: u32 = 15;

/// Probe tone frequency for the tone burst waveform.
const TONE_BURST_HZ: f32 = 2000.0;

/// Available probe waveforms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeWaveform {
    /// Maximal-length sequence. Flat spectrum and a single sharp
    /// autocorrelation peak, the preferred probe for correlation
    /// detection.
    Mls,
    /// 2 kHz sine with exponential decay. Audible click, useful when a
    /// human should hear the probe firing.
    ToneBurst,
}

/// A generated probe: immutable samples plus the parameters that
/// produced them.
#[derive(Debug, Clone)]
pub struct ProbeSignal {
    samples: Arc<[f32]>,
    waveform: ProbeWaveform,
    sample_rate: u32,
    amplitude: f32,
}

impl ProbeSignal {
    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    /// Shared handle to the sample buffer for the render callback.
    pub fn shared_samples(&self) -> Arc<[f32]> {
        Arc::clone(&self.samples)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn waveform(&self) -> ProbeWaveform {
        self.waveform
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn amplitude(&self) -> f32 {
        self.amplitude
    }

    pub fn duration_ms(&self) -> f64 {
        self.samples.len() as f64 * 1000.0 / self.sample_rate as f64
    }
}

/// Galois LFSR over the masks above. Seeded at 1; the output bit is
/// the LSB before each shift.
struct GaloisLfsr {
    order: u32,
    state: u32,
}

impl GaloisLfsr {
    fn new(order: u32) -> Self {
        debug_assert!((2..=MAX_LFSR_ORDER).contains(&order));
        Self { order, state: 1 }
    }

    fn next_bit(&mut self) -> u32 {
        let output = self.state & 1;
        self.state >>= 1;
        if output != 0 {
            self.state ^= LFSR_MASKS[self.order as usize];
        }
        output
    }
}

/// Smallest LFSR order whose period covers `length`, so the probe never
/// repeats internally.
fn order_for_length(length: usize) -> u32 {
    for order in 2..=MAX_LFSR_ORDER {
        if (1usize << order) - 1 >= length {
            return order;
        }
    }
    MAX_LFSR_ORDER
}

/// Builds probe signals. The same parameters always produce
/// byte-identical buffers.
#[derive(Debug, Clone)]
pub struct ProbeGenerator {
    waveform: ProbeWaveform,
    sample_rate: u32,
    amplitude: f32,
}

impl ProbeGenerator {
    pub fn new(waveform: ProbeWaveform, sample_rate: u32, amplitude: f32) -> Self {
        Self {
            waveform,
            sample_rate,
            amplitude: amplitude.clamp(0.0, 1.0),
        }
    }

    /// Generate a probe of exactly `length` frames.
    pub fn generate(&self, length: usize) -> ProbeSignal {
        let samples: Vec<f32> = match self.waveform {
            ProbeWaveform::Mls => self.generate_mls(length),
            ProbeWaveform::ToneBurst => self.generate_tone_burst(length),
        };
        ProbeSignal {
            samples: samples.into(),
            waveform: self.waveform,
            sample_rate: self.sample_rate,
            amplitude: self.amplitude,
        }
    }

    fn generate_mls(&self, length: usize) -> Vec<f32> {
        let mut lfsr = GaloisLfsr::new(order_for_length(length));
        (0..length)
            .map(|_| {
                if lfsr.next_bit() != 0 {
                    self.amplitude
                } else {
                    -self.amplitude
                }
            })
            .collect()
    }

    fn generate_tone_burst(&self, length: usize) -> Vec<f32> {
        // Decay constant of length/5 leaves the tail near -43 dB.
        let decay = (length as f32 / 5.0).max(1.0);
        let step = std::f32::consts::TAU * TONE_BURST_HZ / self.sample_rate as f32;
        (0..length)
            .map(|i| {
                let envelope = (-(i as f32) / decay).exp();
                self.amplitude * envelope * (step * i as f32).sin()
            })
            .collect()
    }
}
