//! Duplex audio session.
//!
//! Owns the driver and the control-side halves of everything shared
//! with the render callback. The callback itself only touches
//! preallocated buffers, atomics, and a bounded channel: it never
//! allocates, locks, logs, or panics.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::{bounded, Receiver};

use crate::audio::probe::ProbeSignal;
use crate::audio::ring::{FrameRing, FrameRingReader};
use crate::config::MeasurementConfig;
use crate::error::MeasurementError;

/// Render callback: matched input/output blocks of equal length, mono
/// f32. Drivers must uphold the equal-length contract.
pub type RenderFn = Box<dyn FnMut(&[f32], &mut [f32]) + Send + 'static>;

/// Driver-side failure reporting, invoked off the render path.
pub type ErrorFn = Box<dyn FnMut(String) + Send + 'static>;

/// Narrow capability interface over a duplex audio backend. Everything
/// the engine needs from a platform is start, stop, and the render
/// callback; tests substitute a synthetic implementation. Driver
/// objects stay on the control thread (platform stream handles are not
/// generally `Send`); only the render callback crosses threads.
pub trait DuplexDriver {
    /// Open the stream pair and begin invoking `render`. Returns the
    /// effective sample rate, which may differ from the requested one.
    fn start(&mut self, render: RenderFn, on_error: ErrorFn) -> Result<u32, MeasurementError>;

    /// Stop the streams. Idempotent.
    fn stop(&mut self);
}

/// Events published by the audio side to the control thread.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The first probe sample was rendered at this output frame.
    ProbeStarted { output_frame: u64 },
    /// The driver reported a stream failure.
    Interrupted { reason: String },
}

const EVENT_QUEUE_DEPTH: usize = 32;

/// Keep-alive tone frequency in Hz.
const KEEPALIVE_HZ: f32 = 80.0;

/// Low-level background signal that keeps the device and any
/// downstream auto-mute logic awake between probes. Sine plus a little
/// pseudo-random noise so adaptive filters cannot null it.
#[inline]
fn keepalive_sample(phase: &mut f32, seed: &mut u32, level: f32, step: f32) -> f32 {
    if level <= 0.0 {
        return 0.0;
    }
    *phase += step;
    if *phase > std::f32::consts::TAU {
        *phase -= std::f32::consts::TAU;
    }
    *seed = seed.wrapping_mul(1103515245).wrapping_add(12345);
    let noise = ((*seed >> 16) & 0x7FFF) as f32 / 32768.0 - 0.5;
    level * (phase.sin() + noise)
}

/// Soft clip keeping probe plus keep-alive inside full scale.
#[inline]
fn soft_clip(sample: f32) -> f32 {
    (sample * 0.8).tanh()
}

/// A running duplex stream: probe playback, capture into the ring, and
/// the frame clock both sides share.
pub struct DuplexSession {
    driver: Box<dyn DuplexDriver>,
    reader: FrameRingReader,
    events: Receiver<SessionEvent>,
    probe_trigger: Arc<AtomicBool>,
    frame_counter: Arc<AtomicU64>,
    interrupted: Arc<AtomicBool>,
    sample_rate: u32,
    running: bool,
    saw_capture: bool,
}

impl DuplexSession {
    /// Build the render callback, hand it to the driver, and start the
    /// stream pair.
    pub fn start(
        mut driver: Box<dyn DuplexDriver>,
        probe: &ProbeSignal,
        config: &MeasurementConfig,
    ) -> Result<Self, MeasurementError> {
        let (mut writer, reader) =
            FrameRing::with_capacity(config.ring_capacity, config.overrun_policy);
        let (event_tx, event_rx) = bounded::<SessionEvent>(EVENT_QUEUE_DEPTH);

        let probe_trigger = Arc::new(AtomicBool::new(false));
        let frame_counter = Arc::new(AtomicU64::new(0));
        let interrupted = Arc::new(AtomicBool::new(false));

        let probe_samples = probe.shared_samples();
        let trigger = Arc::clone(&probe_trigger);
        let counter = Arc::clone(&frame_counter);
        let probe_tx = event_tx.clone();
        let keepalive_level = config.keepalive_level;
        let keepalive_step =
            std::f32::consts::TAU * KEEPALIVE_HZ / config.sample_rate.max(1) as f32;

        // State below is owned by the closure; the shared pieces are
        // the trigger, the frame counter, the ring writer, and the
        // event channel.
        let mut probe_cursor: Option<usize> = None;
        let mut keepalive_phase = 0.0f32;
        let mut noise_seed = 0x1234_5678u32;

        let render: RenderFn = Box::new(move |input: &[f32], output: &mut [f32]| {
            let block_start = counter.load(Ordering::Acquire);

            // Probe arming is picked up at block boundaries so the
            // start frame is exact.
            if probe_cursor.is_none() && trigger.swap(false, Ordering::AcqRel) {
                probe_cursor = Some(0);
                let _ = probe_tx.try_send(SessionEvent::ProbeStarted {
                    output_frame: block_start,
                });
            }

            for out in output.iter_mut() {
                let mut sample = keepalive_sample(
                    &mut keepalive_phase,
                    &mut noise_seed,
                    keepalive_level,
                    keepalive_step,
                );
                match probe_cursor {
                    Some(cursor) if cursor < probe_samples.len() => {
                        sample += probe_samples[cursor];
                        probe_cursor = Some(cursor + 1);
                    }
                    Some(_) => probe_cursor = None,
                    None => {}
                }
                *out = soft_clip(sample);
            }

            writer.push(input);
            counter.fetch_add(output.len() as u64, Ordering::Release);
        });

        let error_flag = Arc::clone(&interrupted);
        let on_error: ErrorFn = Box::new(move |reason: String| {
            error_flag.store(true, Ordering::Release);
            let _ = event_tx.try_send(SessionEvent::Interrupted { reason });
        });

        let sample_rate = driver.start(render, on_error)?;
        tracing::info!(sample_rate, "duplex session started");

        Ok(Self {
            driver,
            reader,
            events: event_rx,
            probe_trigger,
            frame_counter,
            interrupted,
            sample_rate,
            running: true,
            saw_capture: false,
        })
    }

    /// Request probe playback from the next block boundary. The exact
    /// start frame arrives as [`SessionEvent::ProbeStarted`].
    pub fn arm_probe(&self) {
        self.probe_trigger.store(true, Ordering::Release);
        tracing::debug!("probe armed");
    }

    pub fn events(&self) -> &Receiver<SessionEvent> {
        &self.events
    }

    /// Move up to `max_frames` captured frames into `out`. Returns the
    /// number appended.
    pub fn drain_captured(&mut self, out: &mut Vec<f32>, max_frames: usize) -> usize {
        let mut chunk = [0.0f32; 1024];
        let mut total = 0;
        while total < max_frames {
            let want = (max_frames - total).min(chunk.len());
            let n = self.reader.pop_chunk(&mut chunk[..want]);
            if n == 0 {
                break;
            }
            out.extend_from_slice(&chunk[..n]);
            total += n;
        }
        self.note_capture(total as u64);
        total
    }

    /// Discard everything captured so far. Returns frames discarded.
    pub fn discard_captured(&mut self) -> u64 {
        let discarded = self.reader.skip_all();
        self.note_capture(discarded);
        discarded
    }

    /// The callback cannot log; the first delivered audio is noted here
    /// on the control side instead.
    fn note_capture(&mut self, frames: u64) {
        if frames > 0 && !self.saw_capture {
            self.saw_capture = true;
            tracing::debug!(frames, "capture path delivering audio");
        }
    }

    /// Frame index of the next captured sample the control side will
    /// observe. Exact right after a full discard.
    pub fn capture_frame(&self) -> u64 {
        self.reader.stream_frame()
    }

    /// Frames rendered by the callback since the stream started.
    pub fn rendered_frames(&self) -> u64 {
        self.frame_counter.load(Ordering::Acquire)
    }

    /// Total capture frames dropped to ring overrun.
    pub fn overruns(&self) -> u64 {
        self.reader.overruns()
    }

    /// Apply the configured overrun recovery. Returns frames discarded.
    pub fn recover_overrun(&mut self) -> u64 {
        self.reader.recover()
    }

    pub fn captured_available(&self) -> usize {
        self.reader.occupied()
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }

    /// Effective sample rate negotiated by the driver.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn stop(&mut self) {
        if self.running {
            self.driver.stop();
            self.running = false;
            tracing::info!("duplex session stopped");
        }
    }
}

impl Drop for DuplexSession {
    fn drop(&mut self) {
        self.stop();
    }
}
