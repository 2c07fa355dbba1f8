//! Latencyprobe - round-trip audio latency measurement
//!
//! Entry point for the command-line measurement tool.

use anyhow::Result;
use latencyprobe::{
    CpalDriver, DuplexDriver, MeasurementConfig, SyntheticConfig, SyntheticLoopback,
    TrialController, TrialEvent,
};
use std::path::Path;
use tracing::{error, info};

/// Loopback delay simulated when `--synthetic` is given without a value.
const DEFAULT_SYNTHETIC_DELAY_MS: f64 = 12.0;

/// Smallest simulated delay the loopback can represent (one block).
const SYNTHETIC_BLOCK_FRAMES: usize = 256;

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("latencyprobe=info".parse().unwrap()),
        )
        .init();

    println!(
        "Latencyprobe v{} ({}) - duplex round-trip latency",
        latencyprobe::VERSION,
        latencyprobe::BUILD_DATE
    );
    println!();

    // Parse command line arguments
    let args: Vec<String> = std::env::args().collect();

    let mut config_path: Option<String> = None;
    let mut device_name: Option<String> = None;
    let mut sample_rate: Option<u32> = None;
    let mut trials: Option<usize> = None;
    let mut probe_length: Option<usize> = None;
    let mut timeout_ms: Option<u64> = None;
    let mut synthetic = false;
    let mut synthetic_delay_ms = DEFAULT_SYNTHETIC_DELAY_MS;
    let mut i = 1;

    while i < args.len() {
        match args[i].as_str() {
            "--version" | "-v" => {
                println!(
                    "latencyprobe {} (built {})",
                    latencyprobe::VERSION,
                    latencyprobe::BUILD_DATE
                );
                return Ok(());
            }
            "--help" | "-h" => {
                print_help();
                return Ok(());
            }
            "--device" | "-d" => {
                if i + 1 >= args.len() {
                    eprintln!("Error: --device requires a device name");
                    return Ok(());
                }
                device_name = Some(args[i + 1].clone());
                i += 2;
                continue;
            }
            "--sample-rate" | "-r" => {
                if i + 1 >= args.len() {
                    eprintln!("Error: --sample-rate requires a value");
                    return Ok(());
                }
                sample_rate = args[i + 1].parse().ok();
                if sample_rate.is_none() {
                    eprintln!("Error: Invalid sample rate: {}", args[i + 1]);
                    return Ok(());
                }
                i += 2;
                continue;
            }
            "--trials" | "-n" => {
                if i + 1 >= args.len() {
                    eprintln!("Error: --trials requires a count");
                    return Ok(());
                }
                trials = args[i + 1].parse().ok();
                if trials.is_none() {
                    eprintln!("Error: Invalid trial count: {}", args[i + 1]);
                    return Ok(());
                }
                i += 2;
                continue;
            }
            "--probe-length" => {
                if i + 1 >= args.len() {
                    eprintln!("Error: --probe-length requires a frame count");
                    return Ok(());
                }
                probe_length = args[i + 1].parse().ok();
                if probe_length.is_none() {
                    eprintln!("Error: Invalid probe length: {}", args[i + 1]);
                    return Ok(());
                }
                i += 2;
                continue;
            }
            "--timeout-ms" => {
                if i + 1 >= args.len() {
                    eprintln!("Error: --timeout-ms requires a value");
                    return Ok(());
                }
                timeout_ms = args[i + 1].parse().ok();
                if timeout_ms.is_none() {
                    eprintln!("Error: Invalid timeout: {}", args[i + 1]);
                    return Ok(());
                }
                i += 2;
                continue;
            }
            "--config" | "-c" => {
                if i + 1 >= args.len() {
                    eprintln!("Error: --config requires a file path");
                    return Ok(());
                }
                config_path = Some(args[i + 1].clone());
                i += 2;
                continue;
            }
            "--synthetic" => {
                synthetic = true;
                // Optional delay argument in milliseconds.
                if i + 1 < args.len() && !args[i + 1].starts_with('-') {
                    match args[i + 1].parse::<f64>() {
                        Ok(ms) if ms >= 0.0 => {
                            synthetic_delay_ms = ms;
                            i += 2;
                            continue;
                        }
                        _ => {
                            eprintln!("Error: Invalid synthetic delay: {}", args[i + 1]);
                            return Ok(());
                        }
                    }
                }
            }
            arg if arg.starts_with('-') => {
                eprintln!("Unknown argument: {}", arg);
                print_help();
                return Ok(());
            }
            _ => {
                // Positional argument - treat as device name if not set
                if device_name.is_none() {
                    device_name = Some(args[i].clone());
                }
            }
        }
        i += 1;
    }

    // Load config, then let command line flags win over file values.
    let mut config = match config_path {
        Some(path) => MeasurementConfig::load(Path::new(&path)),
        None => MeasurementConfig::default(),
    };
    if let Some(device) = device_name {
        config.device = Some(device);
    }
    if let Some(rate) = sample_rate {
        config.sample_rate = rate;
    }
    if let Some(length) = probe_length {
        config.probe_length = length;
    }
    if let Some(ms) = timeout_ms {
        config.trial_timeout_ms = ms;
    }
    let trials = trials.unwrap_or(config.trial_count);

    if synthetic {
        run_synthetic(trials, &config, synthetic_delay_ms)
    } else {
        run_hardware(trials, &config)
    }
}

fn print_help() {
    println!("Usage: latencyprobe [OPTIONS]");
    println!();
    println!("Options:");
    println!("  -d, --device NAME       Duplex device (name substring, default: system default)");
    println!("  -r, --sample-rate RATE  Requested sample rate (default: 48000)");
    println!("  -n, --trials COUNT      Number of measurement trials (default: 20)");
    println!("      --probe-length LEN  Probe length in frames (default: 2048)");
    println!("      --timeout-ms MS     Per-trial timeout (default: 1000)");
    println!("  -c, --config PATH       Load measurement settings from a JSON file");
    println!("      --synthetic [MS]    Measure a simulated loopback with MS delay (default: 12)");
    println!("  -v, --version           Show version");
    println!("  -h, --help              Show this help");
    println!();
    println!("Examples:");
    println!("  latencyprobe -d \"USB Audio\" -n 50");
    println!("  latencyprobe --synthetic 20 -n 10");
    println!();
    println!("Press Ctrl+C during a run to stop after the current trial;");
    println!("already-completed trials are still summarized.");
}

fn run_synthetic(trials: usize, config: &MeasurementConfig, delay_ms: f64) -> Result<()> {
    let delay_frames = ((delay_ms / 1000.0) * config.sample_rate as f64).round() as usize;
    let delay_frames = delay_frames.max(SYNTHETIC_BLOCK_FRAMES);
    let effective_ms = delay_frames as f64 * 1000.0 / config.sample_rate as f64;
    println!("Synthetic loopback, simulated delay {:.2} ms", effective_ms);

    let driver = SyntheticLoopback::new(SyntheticConfig {
        sample_rate: config.sample_rate,
        block_frames: SYNTHETIC_BLOCK_FRAMES,
        delay_frames,
        gain: 0.9,
        noise_level: 0.001,
        paced: true,
        time_scale: 1.0,
    });
    run_with_driver(Box::new(driver), trials, config)
}

fn run_hardware(trials: usize, config: &MeasurementConfig) -> Result<()> {
    match &config.device {
        Some(name) => println!("Device: {}", name),
        None => println!("Device: system default"),
    }
    let driver = CpalDriver::new(config.device.clone(), config.sample_rate);
    run_with_driver(Box::new(driver), trials, config)
}

fn run_with_driver(
    driver: Box<dyn DuplexDriver>,
    trials: usize,
    config: &MeasurementConfig,
) -> Result<()> {
    let mut controller = match TrialController::new(driver, config.clone()) {
        Ok(controller) => controller,
        Err(e) => {
            error!("Failed to start measurement: {}", e);
            println!("Error: {}", e);
            return Ok(());
        }
    };

    info!(
        sample_rate = controller.sample_rate(),
        trials, "measurement starting"
    );
    println!("Measuring {} trials. Press Ctrl+C to stop early.", trials);
    println!("────────────────────────────────────────");

    // Ctrl+C ends the run after the current trial.
    let abort = controller.abort_handle();
    ctrlc::set_handler(move || {
        abort.store(true, std::sync::atomic::Ordering::SeqCst);
    })
    .ok();

    // Print progress from a side thread; the channel closes when the
    // controller is dropped after the run.
    let progress = controller.progress();
    let printer = std::thread::spawn(move || {
        let mut total = trials;
        while let Ok(event) = progress.recv() {
            match event {
                TrialEvent::Started { total: t, .. } => total = t,
                TrialEvent::Finished(result) => match (result.latency_ms, &result.failure) {
                    (Some(ms), _) => println!(
                        "Trial {:>3}/{}: {:>8.2} ms   (confidence {:>5.1}%)",
                        result.trial + 1,
                        total,
                        ms,
                        result.confidence * 100.0
                    ),
                    (None, Some(err)) => {
                        println!("Trial {:>3}/{}: failed - {}", result.trial + 1, total, err)
                    }
                    (None, None) => {}
                },
            }
        }
    });

    let outcome = controller.run(trials);
    drop(controller);
    printer.join().ok();

    match outcome {
        Ok(summary) => {
            println!("────────────────────────────────────────");
            println!(
                "Valid trials:    {} of {} requested ({} completed)",
                summary.valid_trials, summary.trials_requested, summary.trials_completed
            );
            if summary.rejected_outliers > 0 {
                println!("Outliers:        {} rejected", summary.rejected_outliers);
            }
            println!("Median latency:  {:>8.2} ms", summary.median_ms);
            println!("Mean latency:    {:>8.2} ms", summary.mean_ms);
            println!(
                "p10 / p90:       {:>8.2} / {:.2} ms",
                summary.p10_ms, summary.p90_ms
            );
            println!(
                "Min / max:       {:>8.2} / {:.2} ms",
                summary.min_ms, summary.max_ms
            );
            println!("Sample rate:     {} Hz", summary.sample_rate);
            if summary.interrupted {
                println!();
                println!("Run ended early; results are partial.");
            }
        }
        Err(e) => {
            error!("Measurement failed: {}", e);
            println!("────────────────────────────────────────");
            println!("Error: {}", e);
        }
    }

    Ok(())
}
