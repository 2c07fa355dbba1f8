//! cpal-backed duplex driver.
//!
//! cpal exposes independent input and output callbacks; this driver
//! bridges captured input through a small ring into the output
//! callback, which then invokes the duplex render callback with
//! matched blocks. Both directions therefore advance on a single frame
//! clock, and the bridge's queueing cost rides inside the measured
//! round trip like the rest of the driver stack.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, StreamConfig};
use ringbuf::traits::{Consumer, Producer, Split};
use ringbuf::HeapRb;
use std::sync::{Arc, Mutex};

use crate::audio::session::{DuplexDriver, ErrorFn, RenderFn};
use crate::error::MeasurementError;

/// Largest block the output callback processes in one render call.
/// Bigger device buffers are split into chunks of this size.
const MAX_BLOCK: usize = 8192;

/// Bridge ring between the input and output callbacks.
const BRIDGE_CAPACITY: usize = 32768;

/// Duplex driver over the system's default audio host.
pub struct CpalDriver {
    device_hint: Option<String>,
    requested_rate: u32,
    input_stream: Option<cpal::Stream>,
    output_stream: Option<cpal::Stream>,
}

impl CpalDriver {
    /// `device_hint` is matched case-insensitively against device
    /// names; `None` opens the system defaults.
    pub fn new(device_hint: Option<String>, requested_rate: u32) -> Self {
        Self {
            device_hint,
            requested_rate,
            input_stream: None,
            output_stream: None,
        }
    }

    fn pick_device(
        devices: impl Iterator<Item = cpal::Device>,
        hint: &str,
    ) -> Option<cpal::Device> {
        let needle = hint.to_lowercase();
        devices.into_iter().find(|device| {
            device
                .name()
                .map(|name| name.to_lowercase().contains(&needle))
                .unwrap_or(false)
        })
    }

    fn output_device(&self, host: &cpal::Host) -> Result<cpal::Device, MeasurementError> {
        match &self.device_hint {
            Some(hint) => {
                let devices = host.output_devices().map_err(|e| {
                    MeasurementError::StreamOpenFailure(format!("enumerate outputs: {}", e))
                })?;
                Self::pick_device(devices, hint).ok_or_else(|| {
                    MeasurementError::StreamOpenFailure(format!("no output device matching '{}'", hint))
                })
            }
            None => host.default_output_device().ok_or_else(|| {
                MeasurementError::StreamOpenFailure("no default output device".into())
            }),
        }
    }

    fn input_device(&self, host: &cpal::Host) -> Result<cpal::Device, MeasurementError> {
        match &self.device_hint {
            Some(hint) => {
                let devices = host.input_devices().map_err(|e| {
                    MeasurementError::StreamOpenFailure(format!("enumerate inputs: {}", e))
                })?;
                Self::pick_device(devices, hint).ok_or_else(|| {
                    MeasurementError::StreamOpenFailure(format!("no input device matching '{}'", hint))
                })
            }
            None => host.default_input_device().ok_or_else(|| {
                MeasurementError::StreamOpenFailure("no default input device".into())
            }),
        }
    }

    /// Try the requested rate first, then common fallbacks, by
    /// building a throwaway output stream at each until one opens.
    fn negotiate_rate(&self, device: &cpal::Device, channels: u16) -> u32 {
        let mut rates = Vec::with_capacity(4);
        for rate in [self.requested_rate, 48000, 44100, 96000] {
            if !rates.contains(&rate) {
                rates.push(rate);
            }
        }

        for &rate in &rates {
            let config = StreamConfig {
                channels,
                sample_rate: rate,
                buffer_size: BufferSize::Default,
            };
            let probe = device.build_output_stream(
                &config,
                |_: &mut [f32], _| {},
                |_| {},
                None,
            );
            if probe.is_ok() {
                if rate != self.requested_rate {
                    tracing::warn!(
                        requested = self.requested_rate,
                        effective = rate,
                        "requested sample rate unavailable, falling back"
                    );
                }
                return rate;
            }
        }
        tracing::warn!(
            requested = self.requested_rate,
            "no candidate rate opened, letting the requested rate fail loudly"
        );
        self.requested_rate
    }
}

impl DuplexDriver for CpalDriver {
    fn start(&mut self, mut render: RenderFn, on_error: ErrorFn) -> Result<u32, MeasurementError> {
        if self.output_stream.is_some() {
            return Err(MeasurementError::StreamOpenFailure(
                "driver already started".into(),
            ));
        }

        let host = cpal::default_host();
        let output_device = self.output_device(&host)?;
        let input_device = self.input_device(&host)?;

        let output_default = output_device.default_output_config().map_err(|e| {
            MeasurementError::StreamOpenFailure(format!("output config: {}", e))
        })?;
        let input_default = input_device.default_input_config().map_err(|e| {
            MeasurementError::StreamOpenFailure(format!("input config: {}", e))
        })?;
        let out_channels = output_default.channels();
        let in_channels = input_default.channels();

        let rate = self.negotiate_rate(&output_device, out_channels);
        tracing::info!(
            output = %output_device.name().unwrap_or_else(|_| "unknown".into()),
            input = %input_device.name().unwrap_or_else(|_| "unknown".into()),
            rate,
            "opening duplex streams"
        );

        let (mut bridge_tx, mut bridge_rx) = HeapRb::<f32>::new(BRIDGE_CAPACITY).split();
        let on_error = Arc::new(Mutex::new(on_error));

        // Input: channel 0 only, into the bridge.
        let input_config = StreamConfig {
            channels: in_channels,
            sample_rate: rate,
            buffer_size: BufferSize::Default,
        };
        let input_err = Arc::clone(&on_error);
        let channels = in_channels as usize;
        let input_stream = input_device
            .build_input_stream(
                &input_config,
                move |data: &[f32], _| {
                    if channels <= 1 {
                        bridge_tx.push_slice(data);
                    } else {
                        for frame in data.chunks(channels) {
                            let _ = bridge_tx.try_push(frame[0]);
                        }
                    }
                },
                move |err| {
                    if let Ok(mut callback) = input_err.lock() {
                        callback(format!("input stream: {}", err));
                    }
                },
                None,
            )
            .map_err(|e| MeasurementError::StreamOpenFailure(format!("build input: {}", e)))?;

        // Output: drain one block of bridged input, render, fan the
        // mono result out to every channel.
        let output_config = StreamConfig {
            channels: out_channels,
            sample_rate: rate,
            buffer_size: BufferSize::Default,
        };
        let output_err = Arc::clone(&on_error);
        let channels = out_channels as usize;
        let mut input_scratch = vec![0.0f32; MAX_BLOCK];
        let mut output_scratch = vec![0.0f32; MAX_BLOCK];
        let output_stream = output_device
            .build_output_stream(
                &output_config,
                move |data: &mut [f32], _| {
                    let frames_total = data.len() / channels.max(1);
                    let mut done = 0usize;
                    while done < frames_total {
                        let frames = (frames_total - done).min(MAX_BLOCK);
                        let filled = bridge_rx.pop_slice(&mut input_scratch[..frames]);
                        for sample in &mut input_scratch[filled..frames] {
                            *sample = 0.0;
                        }
                        render(&input_scratch[..frames], &mut output_scratch[..frames]);
                        for (frame_idx, &mono) in output_scratch[..frames].iter().enumerate() {
                            let base = (done + frame_idx) * channels;
                            for slot in &mut data[base..base + channels] {
                                *slot = mono;
                            }
                        }
                        done += frames;
                    }
                },
                move |err| {
                    if let Ok(mut callback) = output_err.lock() {
                        callback(format!("output stream: {}", err));
                    }
                },
                None,
            )
            .map_err(|e| MeasurementError::StreamOpenFailure(format!("build output: {}", e)))?;

        input_stream
            .play()
            .map_err(|e| MeasurementError::StreamOpenFailure(format!("start input: {}", e)))?;
        output_stream
            .play()
            .map_err(|e| MeasurementError::StreamOpenFailure(format!("start output: {}", e)))?;

        self.input_stream = Some(input_stream);
        self.output_stream = Some(output_stream);
        Ok(rate)
    }

    fn stop(&mut self) {
        // Dropping the streams stops them.
        self.input_stream = None;
        self.output_stream = None;
    }
}

impl Drop for CpalDriver {
    fn drop(&mut self) {
        self.stop();
    }
}
