// camrelay demo sender
// Pushes synthetic frames through the pipeline and out over RTP/UDP.
// Watch with e.g. an SDP file describing H264/90000 on port 5000.

use std::env;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use camrelay::testing::{MockGpu, ScriptedEncoderFactory, SYNTHETIC_TEXTURE};
use camrelay::timing::PTSClock;
use camrelay::types::IDENTITY_TRANSFORM;
use camrelay::{
    EncoderConfig, Frame, GpuContextHandle, PipelineCoordinator, PipelineEvent, RelayConfig,
    RtpTransport,
};

struct Args {
    destination: String,
    seconds: u64,
    config: Option<String>,
    audio: bool,
    json: bool,
}

fn parse_args() -> anyhow::Result<Args> {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        bail!("Usage: camrelay-demo <destination-ip> [--seconds N] [--config FILE] [--audio] [--json]");
    }

    let mut parsed = Args {
        destination: args[1].clone(),
        seconds: 10,
        config: None,
        audio: false,
        json: false,
    };

    let mut i = 2;
    while i < args.len() {
        match args[i].as_str() {
            "--seconds" => {
                i += 1;
                let value = args.get(i).context("--seconds needs a value")?;
                parsed.seconds = value.parse().context("--seconds must be a number")?;
            }
            "--config" => {
                i += 1;
                parsed.config = Some(args.get(i).context("--config needs a path")?.clone());
            }
            "--audio" => parsed.audio = true,
            "--json" => parsed.json = true,
            other => bail!("Unknown argument: {}", other),
        }
        i += 1;
    }
    Ok(parsed)
}

fn main() -> anyhow::Result<()> {
    camrelay::init_logging();
    let args = parse_args()?;

    let mut config = match &args.config {
        Some(path) => RelayConfig::load_from_file(path)?,
        None => RelayConfig::load_or_default(),
    };
    if args.audio {
        config.audio.enabled = true;
    }
    config.validate()?;

    let mut encoders = ScriptedEncoderFactory::new().with_gop(u64::from(config.video.fps));
    if config.audio.enabled {
        encoders = encoders.with_audio();
    }

    let transport = Arc::new(RtpTransport::new(config.transport.clone()));
    let coordinator = PipelineCoordinator::new(
        config.clone(),
        Box::new(MockGpu::new()),
        Arc::new(encoders),
        transport,
    )?;
    let mut events = coordinator.subscribe();

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = running.clone();
        ctrlc::set_handler(move || running.store(false, Ordering::SeqCst))
            .context("failed to install ctrl-c handler")?;
    }

    let encoder_config = EncoderConfig::new(
        args.destination.clone(),
        config.video.width,
        config.video.height,
        config.video.bitrate_bps,
        GpuContextHandle(1),
    );
    coordinator.start(encoder_config)?;
    coordinator.set_encoder_texture_id(SYNTHETIC_TEXTURE);
    log::info!(
        "Streaming to {} (video:{} audio:{}) for {}s",
        args.destination,
        config.transport.video_port,
        config.transport.audio_port,
        args.seconds
    );

    let clock = PTSClock::new();
    let frame_interval = Duration::from_secs(1) / config.video.fps;
    let deadline = Instant::now() + Duration::from_secs(args.seconds);
    let mut fatal = None;

    while running.load(Ordering::SeqCst) && Instant::now() < deadline {
        coordinator.on_frame_ready(&Frame::new(SYNTHETIC_TEXTURE, clock.now_ns(), IDENTITY_TRANSFORM));

        while let Ok(event) = events.try_recv() {
            match event {
                PipelineEvent::Fatal(err) => fatal = Some(err),
                PipelineEvent::TransportError(err) => log::warn!("{}", err),
                other => log::debug!("{:?}", other),
            }
        }
        if fatal.is_some() {
            break;
        }
        std::thread::sleep(frame_interval);
    }

    coordinator.stop();
    coordinator.await_shutdown(Duration::from_secs(5))?;

    let stats = coordinator.stats();
    if args.json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        println!(
            "Sent {} video / {} audio units ({} bytes), {} frames rendered, {} dropped",
            stats.video_units,
            stats.audio_units,
            stats.bytes_sent,
            stats.frames_rendered,
            stats.frames_dropped
        );
    }

    if let Some(err) = fatal {
        bail!("session failed: {}", err);
    }
    Ok(())
}
