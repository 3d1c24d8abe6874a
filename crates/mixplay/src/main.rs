//! Mixplay - command-line mix player, recorder and exporter
//!
//! ## Usage
//!
//! ```text
//! mixplay <mix.json> [--settings <settings.json>] [--config <engine.yaml>]
//!                    [--record [<out.wav|out.flac>]] [--export <out.wav|out.flac>]
//! mixplay --list-devices [--config <engine.yaml>]
//! ```
//!
//! Plays the mix on the configured output device and logs every engine
//! notification. Set RUST_LOG=debug for block and flush details.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use crossbeam::channel::{self, Receiver};

use mixplay_core::audio::{device_list_json, enumerate_devices, CpalHost};
use mixplay_core::config::{default_config_path, load_config, EngineConfig};
use mixplay_core::{EngineEvent, MixEngine, PlayerState, RecorderState};

const USAGE: &str = "\
usage: mixplay <mix.json> [--settings <settings.json>] [--config <engine.yaml>]
                          [--record [<out.wav|out.flac>]] [--export <out.wav|out.flac>]
       mixplay --list-devices [--config <engine.yaml>]";

#[derive(Debug, Default)]
struct Args {
    mix: Option<PathBuf>,
    settings: Option<PathBuf>,
    config: Option<PathBuf>,
    record: Option<PathBuf>,
    export: Option<PathBuf>,
    list_devices: bool,
}

impl Args {
    fn parse(mut args: impl Iterator<Item = String>) -> Result<Self> {
        let mut parsed = Args::default();
        let mut pending: Option<String> = None;

        loop {
            let Some(arg) = pending.take().or_else(|| args.next()) else {
                break;
            };
            match arg.as_str() {
                "--settings" => parsed.settings = Some(value(&mut args, &arg)?),
                "--config" => parsed.config = Some(value(&mut args, &arg)?),
                "--export" => parsed.export = Some(value(&mut args, &arg)?),
                "--list-devices" => parsed.list_devices = true,
                "--record" => match args.next() {
                    Some(path) if !path.starts_with("--") => parsed.record = Some(PathBuf::from(path)),
                    next => {
                        parsed.record = Some(default_recording_path());
                        pending = next;
                    }
                },
                "-h" | "--help" => {
                    println!("{}", USAGE);
                    std::process::exit(0);
                }
                flag if flag.starts_with("--") => bail!("unknown option {}", flag),
                _ if parsed.mix.is_none() => parsed.mix = Some(PathBuf::from(&arg)),
                _ => bail!("unexpected argument {}", arg),
            }
        }

        if parsed.mix.is_none() && !parsed.list_devices {
            bail!("missing mix document");
        }
        if parsed.record.is_some() && parsed.export.is_some() {
            bail!("--record and --export cannot be combined");
        }
        Ok(parsed)
    }
}

fn value(args: &mut impl Iterator<Item = String>, flag: &str) -> Result<PathBuf> {
    args.next()
        .filter(|v| !v.starts_with("--"))
        .map(PathBuf::from)
        .with_context(|| format!("{} needs a value", flag))
}

fn default_recording_path() -> PathBuf {
    PathBuf::from(format!(
        "recording-{}.wav",
        chrono::Local::now().format("%Y%m%d-%H%M%S")
    ))
}

fn log_event(event: &EngineEvent) {
    match event {
        EngineEvent::Progress(p) => log::debug!("progress {:.1}%", p * 100.0),
        EngineEvent::State(state) => log::info!("player: {}", state),
        EngineEvent::Error(message) => log::error!("{}", message),
        EngineEvent::RecorderState(state) => log::info!("recorder: {}", state),
        EngineEvent::RecorderProgress(seconds) => log::debug!("recorded {:.1}s", seconds),
        EngineEvent::RecorderLevel(db) => log::trace!("input level {:.1} dB", db),
        EngineEvent::RecorderError(message) => log::error!("recorder: {}", message),
        EngineEvent::DeviceList(json) => log::debug!("devices: {}", json),
    }
}

/// Log events until `done` accepts one
fn wait_for(events: &Receiver<EngineEvent>, mut done: impl FnMut(&EngineEvent) -> bool) -> Result<EngineEvent> {
    for event in events.iter() {
        log_event(&event);
        if done(&event) {
            return Ok(event);
        }
    }
    bail!("engine stopped sending events")
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let args = match Args::parse(std::env::args().skip(1)) {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{}\n\n{}", e, USAGE);
            std::process::exit(2);
        }
    };

    let config_path = args.config.clone().unwrap_or_else(default_config_path);
    let config: EngineConfig = load_config(&config_path);
    log::info!("Using config {:?}", config_path);

    if args.list_devices {
        let devices = enumerate_devices(
            config.audio.output_device.as_ref(),
            config.audio.input_device.as_ref(),
            None,
        );
        println!("{}", device_list_json(&devices));
        return Ok(());
    }

    let mix_path = args.mix.context("missing mix document")?;
    let mix_json =
        std::fs::read_to_string(&mix_path).with_context(|| format!("Failed to read mix {:?}", mix_path))?;

    let (tx, events) = channel::unbounded();
    let mut engine = MixEngine::with_defaults(&config, Arc::new(tx))?;

    if let Some(path) = &args.settings {
        let json = std::fs::read_to_string(path).with_context(|| format!("Failed to read settings {:?}", path))?;
        engine.set_settings(&json).context("Invalid settings")?;
    }

    engine.set_mix(&mix_json).context("Invalid mix")?;
    let prepared = wait_for(&events, |e| {
        matches!(e, EngineEvent::State(PlayerState::Ready | PlayerState::Error))
    })?;
    if prepared == EngineEvent::State(PlayerState::Error) {
        bail!("mix could not be prepared");
    }
    log::info!("Mix ready: {:.2}s", engine.duration());

    if let Some(path) = &args.export {
        let (done_tx, done_rx) = channel::bounded(1);
        engine.export_to_file(path, move |result| {
            let _ = done_tx.send(result);
        })?;
        loop {
            crossbeam::select! {
                recv(done_rx) -> result => {
                    result.context("export did not report back")??;
                    log::info!("Exported to {:?}", path);
                    break;
                }
                recv(events) -> event => {
                    if let Ok(event) = event {
                        log_event(&event);
                    }
                }
            }
        }
        engine.dispose();
        return Ok(());
    }

    let info = engine.attach_device(Box::new(CpalHost::new(config.audio.clone())))?;
    log::info!("Device open at {}Hz, latency {}", info.sample_rate, engine.device_latency_info());

    if let Some(path) = &args.record {
        engine.prepare_recorder(path)?;
        engine.start_recorder()?;
        if !engine.settings().rec_bg_playback {
            engine.play()?;
        }
    } else {
        engine.play()?;
    }

    let looping = engine.settings().looping;
    let finished = wait_for(&events, |e| match e {
        EngineEvent::State(PlayerState::Completed) => !looping,
        EngineEvent::State(PlayerState::Error) | EngineEvent::RecorderState(RecorderState::Error) => true,
        _ => false,
    })?;

    if args.record.is_some() && engine.is_recording() {
        engine.stop_recorder()?;
        wait_for(&events, |e| {
            matches!(e, EngineEvent::RecorderState(RecorderState::Idle | RecorderState::Error))
        })?;
    }

    engine.dispose();
    if let EngineEvent::State(PlayerState::Error) | EngineEvent::RecorderState(RecorderState::Error) = finished {
        bail!("playback ended with an error");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Args> {
        Args::parse(args.iter().map(|s| s.to_string()))
    }

    #[test]
    fn test_parse_flags() {
        let args = parse(&["mix.json", "--settings", "s.json", "--export", "out.flac"]).unwrap();
        assert_eq!(args.mix, Some(PathBuf::from("mix.json")));
        assert_eq!(args.settings, Some(PathBuf::from("s.json")));
        assert_eq!(args.export, Some(PathBuf::from("out.flac")));
        assert!(args.record.is_none());
    }

    #[test]
    fn test_record_without_path_uses_timestamp() {
        let args = parse(&["mix.json", "--record", "--config", "e.yaml"]).unwrap();
        let record = args.record.unwrap();
        assert!(record.to_string_lossy().starts_with("recording-"));
        assert_eq!(args.config, Some(PathBuf::from("e.yaml")));
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse(&[]).is_err());
        assert!(parse(&["mix.json", "--bogus"]).is_err());
        assert!(parse(&["mix.json", "--settings"]).is_err());
        assert!(parse(&["mix.json", "--record", "a.wav", "--export", "b.wav"]).is_err());
        assert!(parse(&["--list-devices"]).unwrap().list_devices);
    }
}
