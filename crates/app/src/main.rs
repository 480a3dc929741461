use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand};
use cpal::traits::{DeviceTrait, HostTrait};
use singloop_core::{LoopbackConfig, LoopbackController};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

mod audio;
mod config;
mod effects;

use config::AppConfig;

#[derive(Parser)]
#[command(name = "singloop")]
#[command(about = "SingLoop: karaoke microphone loopback", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// List available audio devices
    List,
    /// Run the loopback in foreground (press Ctrl+C to stop)
    Run(RunArgs),
    /// Print the saved configuration
    Config,
}

/// Overrides on top of the saved configuration.
#[derive(Args, Default)]
struct RunArgs {
    #[arg(short, long)]
    input: Option<String>,
    #[arg(short, long)]
    output: Option<String>,
    /// Buffer size in frames, instead of the device minimum
    #[arg(long)]
    buffer_frames: Option<usize>,
    #[arg(long)]
    mic_gain: Option<f32>,
    #[arg(long)]
    agc_target: Option<f32>,
    #[arg(long)]
    howl_strength: Option<f32>,
    #[arg(long)]
    reverb_mix: Option<f32>,
    #[arg(long)]
    no_agc: bool,
    #[arg(long)]
    no_anti_howl: bool,
    #[arg(long)]
    no_reverb: bool,
    /// Persist the resulting settings
    #[arg(long)]
    save: bool,
}

impl RunArgs {
    fn merge_into(&self, config: &mut AppConfig) {
        if let Some(input) = &self.input {
            config.input_device = input.clone();
        }
        if let Some(output) = &self.output {
            config.output_device = output.clone();
        }
        if self.buffer_frames.is_some() {
            config.buffer_frames = self.buffer_frames;
        }
        if let Some(gain) = self.mic_gain {
            config.mic_gain = gain;
        }
        if let Some(target) = self.agc_target {
            config.agc_target_level = target;
        }
        if let Some(strength) = self.howl_strength {
            config.anti_howling_strength = strength;
        }
        if let Some(mix) = self.reverb_mix {
            config.reverb_mix = mix;
        }
        if self.no_agc {
            config.agc_enabled = false;
        }
        if self.no_anti_howl {
            config.anti_howling_enabled = false;
        }
        if self.no_reverb {
            config.reverb_enabled = false;
        }
    }
}

fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::List) => list_devices()?,
        Some(Commands::Run(args)) => run(&args)?,
        Some(Commands::Config) => {
            let config = AppConfig::load();
            if let Some(path) = config::config_path() {
                println!("# {}", path.display());
            }
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        None => run(&RunArgs::default())?,
    }

    Ok(())
}

fn run(args: &RunArgs) -> Result<()> {
    let mut config = AppConfig::load();
    args.merge_into(&mut config);

    let backend = audio::CpalBackend::new(
        &config.input_device,
        &config.output_device,
        config.buffer_frames,
    );
    let factories = backend.effect_factories();
    let mut controller = LoopbackController::with_config(
        Box::new(backend),
        LoopbackConfig {
            sample_rate: effects::EFFECT_SAMPLE_RATE,
            ..Default::default()
        },
    );
    for factory in factories {
        controller = controller.with_effect(factory);
    }
    config.apply_to(&controller);

    if args.save {
        config.capture_from(&controller);
        config.save()?;
        log::info!("Settings saved");
    }

    if !controller.start() {
        controller.release();
        bail!("Failed to start loopback (see log for details)");
    }
    println!("SingLoop active. Press Ctrl+C to stop.");

    // Graceful shutdown handling
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        println!("\nShutting down gracefully...");
        r.store(false, Ordering::Relaxed);
    })?;

    let meters = controller.meters();
    let mut last_report = Instant::now();
    while running.load(Ordering::Relaxed) && controller.is_running() {
        std::thread::sleep(Duration::from_millis(100));
        if last_report.elapsed() >= Duration::from_secs(1) {
            log::debug!(
                "input rms {:.4}, agc gain {:.2}",
                meters.input_rms(),
                meters.agc_gain()
            );
            last_report = Instant::now();
        }
    }

    controller.release();
    println!("SingLoop stopped.");
    Ok(())
}

fn list_devices() -> Result<()> {
    let host = cpal::default_host();
    println!("Audio Host: {}", host.id().name());
    println!("\nInput Devices:");
    for device in host.input_devices()? {
        println!("  - {}", device.name().unwrap_or("Unknown".to_string()));
    }
    println!("\nOutput Devices:");
    for device in host.output_devices()? {
        println!("  - {}", device.name().unwrap_or("Unknown".to_string()));
    }
    Ok(())
}
