//! play-tone - feed a sine tone through the sink against the real device
//!
//! Smoke-test binary: opens the default output device, streams a tone
//! through the full pipeline/write loop, and prints the tracked position so
//! the clock can be eyeballed against wall time.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use playhead_common::{time, AudioFormat, PlaybackParams, SinkTuning};
use playhead_sink::device::cpal_output::CpalDeviceProvider;
use playhead_sink::device::{MonotonicClock, SinkClock};
use playhead_sink::sink::{CapabilityProber, ModeSupport, StreamFormat};
use playhead_sink::{AudioSink, SinkEvent, SinkListener};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command-line arguments for play-tone
#[derive(Parser, Debug)]
#[command(name = "play-tone")]
#[command(about = "Play a test tone through the playhead sink")]
#[command(version)]
struct Args {
    /// Tone frequency in Hz
    #[arg(short, long, default_value = "440.0")]
    frequency: f32,

    /// Duration in seconds
    #[arg(short, long, default_value = "3.0")]
    duration: f32,

    /// Playback speed factor
    #[arg(short, long, default_value = "1.0")]
    speed: f32,

    /// Optional tuning TOML file
    #[arg(short, long)]
    tuning: Option<PathBuf>,

    /// Output device name (default device if omitted)
    #[arg(long)]
    device: Option<String>,
}

/// Reports PCM support at the device's native rate so the pipeline
/// resamples once, up front.
struct NativeRateProber {
    rate: Option<u32>,
}

impl CapabilityProber for NativeRateProber {
    fn probe(&self, format: &StreamFormat, _offload_requested: bool) -> ModeSupport {
        if format.audio.encoding.is_pcm() {
            ModeSupport::Pcm {
                preferred_sample_rate: self.rate,
            }
        } else {
            ModeSupport::Unsupported
        }
    }
}

struct LogListener;

impl SinkListener for LogListener {
    fn on_event(&mut self, event: &SinkEvent) {
        info!(?event, "sink event");
    }
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "playhead_sink=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let tuning = match &args.tuning {
        Some(path) => SinkTuning::load(path).context("failed to load tuning file")?,
        None => SinkTuning::default(),
    };

    let clock: Arc<dyn SinkClock> = Arc::new(MonotonicClock::new());
    let provider =
        CpalDeviceProvider::new(Arc::clone(&clock)).with_device_name(args.device.clone());
    let prober = NativeRateProber {
        rate: CpalDeviceProvider::default_output_rate(),
    };

    let mut sink = AudioSink::builder(Box::new(provider))
        .prober(Box::new(prober))
        .clock(Arc::clone(&clock))
        .tuning(tuning)
        .build();
    sink.set_listener(Box::new(LogListener));

    const SOURCE_RATE: u32 = 44100;
    const CHANNELS: u16 = 2;
    const CHUNK_FRAMES: usize = 4096;

    sink.configure(
        StreamFormat::new(AudioFormat::pcm_f32(SOURCE_RATE, CHANNELS)),
        None,
        None,
    )
    .context("failed to configure sink")?;
    if args.speed != 1.0 {
        sink.set_playback_parameters(PlaybackParams::new(args.speed, 1.0));
    }
    sink.play();

    info!(
        frequency = args.frequency,
        duration = args.duration,
        "playing tone"
    );

    let total_frames = (args.duration * SOURCE_RATE as f32) as u64;
    let mut submitted: u64 = 0;
    let mut chunk = Vec::with_capacity(CHUNK_FRAMES * CHANNELS as usize * 4);
    let mut last_print_us: i64 = 0;

    while submitted < total_frames {
        let frames = CHUNK_FRAMES.min((total_frames - submitted) as usize);
        chunk.clear();
        for i in 0..frames {
            let t = (submitted + i as u64) as f32 / SOURCE_RATE as f32;
            let sample = (2.0 * std::f32::consts::PI * args.frequency * t).sin() * 0.3;
            for _ in 0..CHANNELS {
                chunk.extend_from_slice(&sample.to_le_bytes());
            }
        }
        let pts_us = time::frames_to_duration_us(submitted, SOURCE_RATE);

        // Non-blocking write loop: retry the same chunk until accepted.
        while !sink
            .handle_buffer(&chunk, pts_us, 0)
            .context("sink rejected buffer")?
        {
            std::thread::sleep(Duration::from_millis(5));
        }
        submitted += frames as u64;

        if let Some(position_us) = sink.current_position_us(false) {
            if position_us - last_print_us >= 100_000 {
                info!(
                    position_ms = position_us / 1000,
                    submitted_frames = submitted,
                    "position"
                );
                last_print_us = position_us;
            }
        }
    }

    sink.play_to_end_of_stream()
        .context("failed to drain sink")?;
    while !sink.is_ended() {
        std::thread::sleep(Duration::from_millis(20));
        if let Some(position_us) = sink.current_position_us(true) {
            if position_us - last_print_us >= 100_000 {
                info!(position_ms = position_us / 1000, "draining");
                last_print_us = position_us;
            }
        }
    }

    info!("playback complete");
    sink.reset();
    Ok(())
}
