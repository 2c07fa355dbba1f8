//! Synthetic duplex loopback driver.
//!
//! Simulates a device whose input is the device's own output after a
//! fixed frame delay, with optional gain and noise. Paced mode runs a
//! clock thread at block cadence; unpaced mode lets tests pump blocks
//! by hand for fully deterministic runs.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::audio::session::{DuplexDriver, ErrorFn, RenderFn};
use crate::error::MeasurementError;

#[derive(Debug, Clone)]
pub struct SyntheticConfig {
    pub sample_rate: u32,
    /// Frames per render callback.
    pub block_frames: usize,
    /// Loopback delay in frames. Must cover at least one block; a
    /// delay shorter than the block period cannot be simulated with
    /// block-synchronous callbacks.
    pub delay_frames: usize,
    /// Gain applied to the looped-back signal.
    pub gain: f32,
    /// Level of pseudo-random noise added to the input.
    pub noise_level: f32,
    /// Run a clock thread invoking the callback at block cadence.
    pub paced: bool,
    /// Pace multiplier: 2.0 runs the simulated stream at twice real
    /// time. Only meaningful in paced mode.
    pub time_scale: f32,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            block_frames: 256,
            delay_frames: 480,
            gain: 0.9,
            noise_level: 0.0,
            paced: false,
            time_scale: 1.0,
        }
    }
}

/// Delay line plus the block buffers the callback runs against.
struct LoopbackLine {
    delay: VecDeque<f32>,
    input_buf: Vec<f32>,
    output_buf: Vec<f32>,
    seed: u32,
    gain: f32,
    noise_level: f32,
}

impl LoopbackLine {
    fn new(config: &SyntheticConfig) -> Self {
        let mut delay = VecDeque::with_capacity(config.delay_frames + config.block_frames);
        delay.extend(std::iter::repeat(0.0f32).take(config.delay_frames));
        Self {
            delay,
            input_buf: vec![0.0; config.block_frames],
            output_buf: vec![0.0; config.block_frames],
            seed: 0x0BAD_5EED,
            gain: config.gain,
            noise_level: config.noise_level,
        }
    }

    fn run_block(&mut self, render: &mut RenderFn) {
        for sample in self.input_buf.iter_mut() {
            let delayed = self.delay.pop_front().unwrap_or(0.0);
            self.seed = self.seed.wrapping_mul(1103515245).wrapping_add(12345);
            let noise = ((self.seed >> 16) & 0x7FFF) as f32 / 32768.0 - 0.5;
            *sample = delayed * self.gain + noise * self.noise_level;
        }
        render(&self.input_buf, &mut self.output_buf);
        for &sample in &self.output_buf {
            self.delay.push_back(sample);
        }
    }
}

struct SyntheticShared {
    render: Mutex<Option<RenderFn>>,
    on_error: Mutex<Option<ErrorFn>>,
    line: Mutex<LoopbackLine>,
    running: AtomicBool,
}

impl SyntheticShared {
    /// Run one callback block. Returns false once stopped, failed, or
    /// not yet started.
    fn pump_block(&self) -> bool {
        if !self.running.load(Ordering::Acquire) {
            return false;
        }
        let mut render_slot = match self.render.lock() {
            Ok(guard) => guard,
            Err(_) => return false,
        };
        let render = match render_slot.as_mut() {
            Some(render) => render,
            None => return false,
        };
        let mut line = match self.line.lock() {
            Ok(guard) => guard,
            Err(_) => return false,
        };
        line.run_block(render);
        true
    }

    fn fail(&self, reason: &str) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Ok(mut slot) = self.on_error.lock() {
            if let Some(on_error) = slot.as_mut() {
                on_error(reason.to_string());
            }
        }
    }
}

/// Handle for driving or breaking an unpaced loopback from a test.
#[derive(Clone)]
pub struct SyntheticPump {
    shared: Arc<SyntheticShared>,
}

impl SyntheticPump {
    /// Invoke the render callback for `n` blocks. No-op before the
    /// driver is started or after it stopped.
    pub fn pump_blocks(&self, n: usize) {
        for _ in 0..n {
            if !self.shared.pump_block() {
                break;
            }
        }
    }

    /// Simulate a stream failure: callbacks stop and the error
    /// callback fires once.
    pub fn fail_with(&self, reason: &str) {
        self.shared.fail(reason);
    }
}

pub struct SyntheticLoopback {
    shared: Arc<SyntheticShared>,
    config: SyntheticConfig,
    thread: Option<JoinHandle<()>>,
}

impl SyntheticLoopback {
    pub fn new(config: SyntheticConfig) -> Self {
        assert!(config.block_frames > 0, "block size must be nonzero");
        assert!(
            config.delay_frames >= config.block_frames,
            "synthetic delay must cover at least one block"
        );
        let shared = Arc::new(SyntheticShared {
            render: Mutex::new(None),
            on_error: Mutex::new(None),
            line: Mutex::new(LoopbackLine::new(&config)),
            running: AtomicBool::new(false),
        });
        Self {
            shared,
            config,
            thread: None,
        }
    }

    pub fn pump_handle(&self) -> SyntheticPump {
        SyntheticPump {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn config(&self) -> &SyntheticConfig {
        &self.config
    }
}

impl DuplexDriver for SyntheticLoopback {
    fn start(&mut self, render: RenderFn, on_error: ErrorFn) -> Result<u32, MeasurementError> {
        if let Ok(mut slot) = self.shared.render.lock() {
            *slot = Some(render);
        }
        if let Ok(mut slot) = self.shared.on_error.lock() {
            *slot = Some(on_error);
        }
        self.shared.running.store(true, Ordering::Release);

        if self.config.paced {
            let shared = Arc::clone(&self.shared);
            let period = Duration::from_secs_f64(
                self.config.block_frames as f64
                    / self.config.sample_rate as f64
                    / self.config.time_scale.max(0.01) as f64,
            );
            let thread = std::thread::Builder::new()
                .name("synthetic-loopback".to_string())
                .spawn(move || {
                    tracing::debug!("synthetic clock thread started");
                    while shared.pump_block() {
                        std::thread::sleep(period);
                    }
                    tracing::debug!("synthetic clock thread exiting");
                })
                .map_err(|e| MeasurementError::StreamOpenFailure(e.to_string()))?;
            self.thread = Some(thread);
        }

        tracing::info!(
            sample_rate = self.config.sample_rate,
            delay_frames = self.config.delay_frames,
            block_frames = self.config.block_frames,
            paced = self.config.paced,
            "synthetic loopback started"
        );
        Ok(self.config.sample_rate)
    }

    fn stop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for SyntheticLoopback {
    fn drop(&mut self) {
        self.stop();
    }
}
