//! Drives one detection through the full stack against the loopback capture
//! path and prints the resulting client events as JSON.
//!
//! ```text
//! cargo run -p wakegate-core --bin wakegate-sim -- --wav hey.wav --capture --verify
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;
use tracing_subscriber::EnvFilter;

use wakegate_core::buffering::format::AudioFormat;
use wakegate_core::dispatch::DetectionPayloadWriter;
use wakegate_core::sim::{JsonModelLib, LoopbackBackend};
use wakegate_core::verifier::energy::EnergyModel;
use wakegate_core::verifier::EnergyVerifierFactory;
use wakegate_core::{
    ModelLibHandle, ModuleType, Platform, PlatformConfig, RecognitionConfig, RecognitionEvent,
    SoundModel, VerifierKind,
};

#[derive(Debug)]
struct Args {
    wav: Option<PathBuf>,
    config: Option<PathBuf>,
    capture: bool,
    verify: bool,
    kw_start_ms: u64,
    kw_end_ms: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Report {
    event: RecognitionEvent,
    bytes_read: usize,
    kw_transfer_ms: Option<u64>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("wakegate_core=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run() {
        eprintln!("simulation failed: {e}");
        std::process::exit(1);
    }
}

fn parse_args() -> Result<Args, String> {
    let mut args = Args {
        wav: None,
        config: None,
        capture: false,
        verify: false,
        kw_start_ms: 400,
        kw_end_ms: 1_200,
    };

    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--wav" => {
                let Some(v) = it.next() else {
                    return Err("missing value for --wav".into());
                };
                args.wav = Some(PathBuf::from(v));
            }
            "--config" => {
                let Some(v) = it.next() else {
                    return Err("missing value for --config".into());
                };
                args.config = Some(PathBuf::from(v));
            }
            "--keyword" => {
                let Some(v) = it.next() else {
                    return Err("missing value for --keyword".into());
                };
                let (start, end) = v
                    .split_once(':')
                    .ok_or_else(|| "--keyword expects <start_ms>:<end_ms>".to_string())?;
                args.kw_start_ms = start
                    .parse()
                    .map_err(|_| "invalid keyword start".to_string())?;
                args.kw_end_ms = end.parse().map_err(|_| "invalid keyword end".to_string())?;
            }
            "--capture" => args.capture = true,
            "--verify" => args.verify = true,
            "--help" | "-h" => {
                println!(
                    "Usage: wakegate-sim [--wav <file.wav>] [--config <platform.json>] \\
  [--keyword <start_ms>:<end_ms>] [--capture] [--verify]"
                );
                std::process::exit(0);
            }
            other => return Err(format!("unknown argument: {other}")),
        }
    }
    if args.kw_start_ms >= args.kw_end_ms {
        return Err("keyword start must precede keyword end".into());
    }
    Ok(args)
}

/// 16-bit PCM in the platform format. No resampling: the file must match.
fn read_wav(path: &Path, format: &AudioFormat) -> Result<Vec<u8>, String> {
    let mut reader = hound::WavReader::open(path).map_err(|e| e.to_string())?;
    let spec = reader.spec();
    if spec.sample_rate != format.sample_rate || spec.channels != format.channels {
        return Err(format!(
            "{} is {} Hz / {} ch, platform expects {} Hz / {} ch",
            path.display(),
            spec.sample_rate,
            spec.channels,
            format.sample_rate,
            format.channels
        ));
    }
    if spec.sample_format != hound::SampleFormat::Int || spec.bits_per_sample != 16 {
        return Err(format!("{} is not 16-bit integer PCM", path.display()));
    }
    let mut pcm = Vec::with_capacity(reader.len() as usize * 2);
    for sample in reader.samples::<i16>() {
        let sample = sample.map_err(|e| e.to_string())?;
        pcm.extend_from_slice(&sample.to_le_bytes());
    }
    Ok(pcm)
}

/// Silence, a tone over the keyword span, silence.
fn synthesize(format: &AudioFormat, kw_start_ms: u64, kw_end_ms: u64) -> Vec<u8> {
    let total_ms = kw_end_ms + 300;
    let rate = u64::from(format.sample_rate);
    let frames = total_ms * rate / 1_000;
    let mut pcm = Vec::with_capacity(format.frames_to_bytes(frames));
    for i in 0..frames {
        let ms = i * 1_000 / rate;
        let sample = if (kw_start_ms..kw_end_ms).contains(&ms) {
            let t = i as f32 / rate as f32;
            ((t * 440.0 * std::f32::consts::TAU).sin() * 8_000.0) as i16
        } else {
            0
        };
        for _ in 0..format.channels {
            pcm.extend_from_slice(&sample.to_le_bytes());
        }
    }
    pcm
}

fn recv_event(
    rx: &mut broadcast::Receiver<RecognitionEvent>,
    timeout: Duration,
) -> Result<RecognitionEvent, String> {
    let start = Instant::now();
    loop {
        match rx.try_recv() {
            Ok(event) => return Ok(event),
            Err(TryRecvError::Empty) => {
                if start.elapsed() >= timeout {
                    return Err("timed out waiting for a recognition event".into());
                }
                thread::sleep(Duration::from_millis(5));
            }
            Err(TryRecvError::Lagged(_)) => continue,
            Err(TryRecvError::Closed) => return Err("recognition channel closed".into()),
        }
    }
}

fn run() -> Result<(), String> {
    let args = parse_args()?;
    let config = match &args.config {
        Some(path) => PlatformConfig::load_or_default(path).map_err(|e| e.to_string())?,
        None => PlatformConfig::default(),
    };
    let format = config.audio;

    let pcm = match &args.wav {
        Some(path) => read_wav(path, &format)?,
        None => synthesize(&format, args.kw_start_ms, args.kw_end_ms),
    };
    let audio_us = format.bytes_to_ms(pcm.len()) * 1_000;
    if args.kw_end_ms * 1_000 > audio_us {
        return Err(format!("keyword end is past the {} ms of audio", audio_us / 1_000));
    }

    let backend = Arc::new(LoopbackBackend::with_format(format));
    let platform = Platform::new(
        config,
        backend.clone(),
        ModelLibHandle::new(JsonModelLib),
        Arc::new(EnergyVerifierFactory),
    );

    let mut model = SoundModel::new(
        ModuleType::Gmm,
        JsonModelLib::encode(&["hey wakegate"], &[], &[]),
    );
    if args.verify {
        model = model.with_verifier(VerifierKind::Keyword, EnergyModel::default().encode());
    }

    let session = platform.open_session().map_err(|e| e.to_string())?;
    let mut events = session.subscribe_recognition();
    session.load_sound_model(model).map_err(|e| e.to_string())?;
    session
        .send_recognition_config(RecognitionConfig {
            capture_requested: args.capture,
            ..RecognitionConfig::with_conf_levels(&[60])
        })
        .map_err(|e| e.to_string())?;
    session.start_recognition().map_err(|e| e.to_string())?;

    let capture = backend
        .capture(ModuleType::Gmm)
        .ok_or_else(|| "no capture session was opened".to_string())?;
    capture.push_audio(&pcm);
    // All of the clip counts as audio the DSP buffered before the detection.
    let ftrt_us = u32::try_from(audio_us).map_err(|_| "clip too long".to_string())?;
    capture.inject_detection(
        &DetectionPayloadWriter::new()
            .confidence_levels(&[80])
            .keyword_position(args.kw_start_ms * 1_000, args.kw_end_ms * 1_000)
            .timestamp(audio_us)
            .ftrt(ftrt_us)
            .build(0),
    );

    let event = recv_event(&mut events, Duration::from_secs(5))?;
    let mut bytes_read = 0;
    if event.capture_available {
        let mut buf = vec![0u8; pcm.len()];
        bytes_read = session.read(&mut buf).map_err(|e| e.to_string())?;
        session.stop_buffering().map_err(|e| e.to_string())?;
    }
    let kw_transfer_ms = platform
        .registry()
        .get(ModuleType::Gmm)
        .map(|engine| engine.kw_transfer_latency().as_millis() as u64);

    session.stop_recognition().map_err(|e| e.to_string())?;
    let report = Report {
        event,
        bytes_read,
        kw_transfer_ms,
    };
    let json = serde_json::to_string_pretty(&report).map_err(|e| e.to_string())?;
    println!("{json}");
    Ok(())
}
