//! Conversation application entry points.
//!
//! Builds engines from the configuration, runs the pipeline and renders
//! its events on the terminal.

use crate::audio::playback::{AudioOutput, NullOutput, WavFileOutput};
use crate::audio::recorder::AudioSource;
use crate::audio::wav::WavAudioSource;
use crate::cli::RunArgs;
use crate::config::{Config, OutputKind};
use crate::generation::generator::TextGenerator;
use crate::generation::scanner::{FragmentFormat, FragmentScanner};
use crate::pipeline::orchestrator::{Pipeline, PipelineHandle};
use crate::pipeline::types::{PipelineEvent, SessionState};
use crate::stt::recognizer::SpeechRecognizer;
use crate::stt::whisper::{WhisperConfig, WhisperRecognizer};
use crate::synthesis::synthesizer::{CommandSynthesizer, SpeechSynthesizer};
use anyhow::{Context, bail};
use crossbeam_channel::{Receiver, RecvTimeoutError, unbounded};
use owo_colors::OwoColorize;
use std::io::{BufRead, Read, Write};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Keyboard commands while talking to the microphone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyCommand {
    Interrupt,
    Quit,
}

/// Fold `voxturn run` flags into the configuration.
pub fn apply_run_overrides(config: &mut Config, args: &RunArgs) {
    if let Some(device) = &args.device {
        config.audio.device = Some(device.clone());
    }
    if let Some(language) = &args.language {
        config.transcription.language = language.clone();
    }
    if let Some(model) = &args.model {
        config.generation.model = model.clone();
    }
    if let Some(dir) = &args.output_dir {
        config.output.kind = OutputKind::Wav;
        config.output.directory = Some(dir.clone());
    }
    if let Some(workers) = args.workers {
        config.synthesis.workers = workers;
    }
    if let Some(inactivity) = args.inactivity {
        config.transcription.inactivity_timeout_ms = inactivity.as_millis() as u64;
    }
    if args.pace {
        config.audio.pace_files = true;
    }
}

fn build_recognizer(config: &Config) -> anyhow::Result<Arc<dyn SpeechRecognizer>> {
    let recognizer = WhisperRecognizer::new(WhisperConfig {
        model_path: config.transcription.model_path.clone(),
        threads: config.transcription.threads,
    })
    .with_context(|| {
        format!(
            "Failed to load speech model {}",
            config.transcription.model_path.display()
        )
    })?;
    Ok(Arc::new(recognizer))
}

#[cfg(feature = "http")]
fn build_generator(config: &Config) -> anyhow::Result<Arc<dyn TextGenerator>> {
    use crate::generation::ollama::{OllamaConfig, OllamaGenerator};

    let generator = OllamaGenerator::new(OllamaConfig {
        url: config.generation.url.clone(),
        model: config.generation.model.clone(),
        connect_timeout: Duration::from_millis(config.generation.connect_timeout_ms),
    })?;
    Ok(Arc::new(generator))
}

#[cfg(not(feature = "http"))]
fn build_generator(_config: &Config) -> anyhow::Result<Arc<dyn TextGenerator>> {
    bail!("voxturn was built without the `http` feature; no text generator is available")
}

fn build_synthesizer(config: &Config) -> Arc<dyn SpeechSynthesizer> {
    Arc::new(CommandSynthesizer::new(
        &config.synthesis.command,
        &config.synthesis.args,
    ))
}

fn build_output(config: &Config) -> anyhow::Result<Box<dyn AudioOutput>> {
    let rate = config.synthesis.sample_rate;
    match config.output.kind {
        OutputKind::Null => Ok(Box::new(NullOutput)),
        OutputKind::Wav => {
            let Some(dir) = &config.output.directory else {
                bail!("output.directory is required for WAV output");
            };
            Ok(Box::new(WavFileOutput::new(dir, rate)?))
        }
        OutputKind::Speaker => speaker_output(config, rate),
    }
}

#[cfg(feature = "cpal-audio")]
fn speaker_output(config: &Config, rate: u32) -> anyhow::Result<Box<dyn AudioOutput>> {
    use crate::audio::speaker::SpeakerOutput;
    Ok(Box::new(SpeakerOutput::new(
        config.output.device.as_deref(),
        rate,
    )?))
}

#[cfg(not(feature = "cpal-audio"))]
fn speaker_output(_config: &Config, _rate: u32) -> anyhow::Result<Box<dyn AudioOutput>> {
    bail!("voxturn was built without the `cpal-audio` feature; use --output-dir")
}

fn build_source(config: &Config, args: &RunArgs) -> anyhow::Result<Box<dyn AudioSource>> {
    if let Some(path) = &args.input {
        let source = WavAudioSource::open(path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        tracing::info!(path = %path.display(), ms = source.duration_ms(), "reading speech from file");
        return Ok(Box::new(source));
    }
    microphone(config)
}

#[cfg(feature = "cpal-audio")]
fn microphone(config: &Config) -> anyhow::Result<Box<dyn AudioSource>> {
    use crate::audio::capture::CpalAudioSource;
    Ok(Box::new(CpalAudioSource::new(config.audio.device.as_deref())?))
}

#[cfg(not(feature = "cpal-audio"))]
fn microphone(_config: &Config) -> anyhow::Result<Box<dyn AudioSource>> {
    bail!("voxturn was built without the `cpal-audio` feature; pass --input <FILE>")
}

/// Run a conversation until the input ends, the user quits or
/// `max_duration` passes.
pub fn run_conversation(mut config: Config, args: &RunArgs, quiet: bool) -> anyhow::Result<()> {
    apply_run_overrides(&mut config, args);
    config.validate()?;

    let recognizer = build_recognizer(&config)?;
    let generator = build_generator(&config)?;
    let synthesizer = build_synthesizer(&config);
    let output = build_output(&config)?;
    let source = build_source(&config, args)?;
    let finite = source.is_finite();

    let mut handle = Pipeline::new(config.to_pipeline_config()).start(
        recognizer,
        generator,
        synthesizer,
        output,
    )?;
    handle.attach_source(source)?;

    let keys = if finite {
        handle.close_input();
        None
    } else {
        if !quiet {
            eprintln!(
                "{}",
                "Listening. Press Enter to interrupt, q + Enter to quit.".dimmed()
            );
        }
        Some(spawn_key_reader())
    };

    let deadline = args.max_duration.map(|d| Instant::now() + d);
    let mut renderer = EventRenderer::new(quiet);
    while handle.is_running() {
        if deadline.is_some_and(|d| Instant::now() >= d) {
            tracing::info!("maximum duration reached");
            break;
        }
        if let Some(keys) = &keys
            && handle_keys(keys, &handle)
        {
            break;
        }
        match handle.events().recv_timeout(Duration::from_millis(50)) {
            Ok(event) => renderer.render(&event),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    for event in handle.events().try_iter() {
        renderer.render(&event);
    }
    handle.stop();
    Ok(())
}

/// Returns true if the user asked to quit.
fn handle_keys(keys: &Receiver<KeyCommand>, handle: &PipelineHandle) -> bool {
    for key in keys.try_iter() {
        match key {
            KeyCommand::Interrupt => {
                handle.interrupt();
            }
            KeyCommand::Quit => return true,
        }
    }
    false
}

fn spawn_key_reader() -> Receiver<KeyCommand> {
    let (tx, rx) = unbounded();
    // Blocked on stdin until the process exits.
    thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else {
                break;
            };
            let command = match line.trim() {
                "q" | "quit" => KeyCommand::Quit,
                _ => KeyCommand::Interrupt,
            };
            if tx.send(command).is_err() || command == KeyCommand::Quit {
                break;
            }
        }
    });
    rx
}

/// Prints pipeline events for a human.
struct EventRenderer {
    quiet: bool,
    partial_shown: bool,
}

impl EventRenderer {
    fn new(quiet: bool) -> Self {
        Self {
            quiet,
            partial_shown: false,
        }
    }

    fn clear_partial(&mut self) {
        if self.partial_shown {
            eprint!("\r\x1b[2K");
            self.partial_shown = false;
        }
    }

    fn render(&mut self, event: &PipelineEvent) {
        match event {
            PipelineEvent::Partial { text } => {
                if !self.quiet {
                    eprint!("\r\x1b[2K{}", text.dimmed());
                    self.partial_shown = true;
                }
            }
            PipelineEvent::Final { text } => {
                self.clear_partial();
                if !text.trim().is_empty() {
                    println!("{} {}", "you:".bold(), text);
                }
            }
            PipelineEvent::StateChanged { to, turn, .. } => {
                if !self.quiet {
                    self.clear_partial();
                    let label = match to {
                        SessionState::Interrupted => to.to_string().yellow().to_string(),
                        SessionState::Speaking => to.to_string().green().to_string(),
                        _ => to.to_string().dimmed().to_string(),
                    };
                    eprintln!("[turn {}] {}", turn, label);
                }
            }
            PipelineEvent::DeviceError { message } => {
                self.clear_partial();
                eprintln!("{} {}", "audio output error:".red(), message);
            }
            PipelineEvent::SpeakingStarted { .. }
            | PipelineEvent::SpeakingStopped { .. }
            | PipelineEvent::AudioChunk { .. } => {}
        }
    }
}

/// Run the fragment scanner over `input`, writing one JSON line per
/// fragment to `output`. Returns the number of fragments.
pub fn run_scan(
    format: FragmentFormat,
    mut input: impl Read,
    mut output: impl Write,
) -> anyhow::Result<usize> {
    let mut scanner = FragmentScanner::new(format);
    let mut count = 0;
    let mut buf = [0u8; 4096];
    let mut carry: Vec<u8> = Vec::new();

    loop {
        let n = input.read(&mut buf)?;
        let units = if n == 0 {
            scanner.finish()
        } else {
            carry.extend_from_slice(&buf[..n]);
            // Hold back an incomplete UTF-8 sequence for the next read.
            let valid = match std::str::from_utf8(&carry) {
                Ok(text) => text.len(),
                Err(e) if e.error_len().is_none() => e.valid_up_to(),
                Err(e) => bail!("input is not UTF-8: {}", e),
            };
            let rest = carry.split_off(valid);
            let text = String::from_utf8(std::mem::replace(&mut carry, rest))?;
            scanner.push(&text)
        };
        for unit in &units {
            writeln!(output, "{}", serde_json::to_string(unit)?)?;
        }
        count += units.len();
        if n == 0 {
            return Ok(count);
        }
    }
}

/// The configuration as TOML.
pub fn show_config(config: &Config) -> anyhow::Result<String> {
    Ok(toml::to_string_pretty(config)?)
}

/// List audio devices.
#[cfg(feature = "cpal-audio")]
pub fn list_audio_devices() -> anyhow::Result<()> {
    use crate::audio::device::{Direction, list_devices};

    for (title, direction) in [("Input", Direction::Input), ("Output", Direction::Output)] {
        let devices = list_devices(direction)?;
        println!("{} devices:", title);
        if devices.is_empty() {
            println!("  (none)");
        }
        for (idx, device) in devices.iter().enumerate() {
            println!("  [{}] {}", idx, device);
        }
    }
    Ok(())
}

#[cfg(not(feature = "cpal-audio"))]
pub fn list_audio_devices() -> anyhow::Result<()> {
    bail!("voxturn was built without the `cpal-audio` feature")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_run_overrides_apply_to_config() {
        let mut config = Config::default();
        let args = RunArgs {
            language: Some("es".to_string()),
            model: Some("qwen2.5".to_string()),
            output_dir: Some(PathBuf::from("/tmp/replies")),
            workers: Some(4),
            inactivity: Some(Duration::from_millis(900)),
            pace: true,
            ..RunArgs::default()
        };

        apply_run_overrides(&mut config, &args);

        assert_eq!(config.transcription.language, "es");
        assert_eq!(config.generation.model, "qwen2.5");
        assert_eq!(config.output.kind, OutputKind::Wav);
        assert_eq!(config.output.directory, Some(PathBuf::from("/tmp/replies")));
        assert_eq!(config.synthesis.workers, 4);
        assert_eq!(config.transcription.inactivity_timeout_ms, 900);
        assert!(config.audio.pace_files);
    }

    #[test]
    fn test_no_overrides_keeps_config() {
        let mut config = Config::default();
        apply_run_overrides(&mut config, &RunArgs::default());
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_scan_json_units() {
        let input = r#"{"text":"Hola.","tag":"happy"} {"texto":"Adiós","modo":"loop"}"#;
        let mut out = Vec::new();

        let count = run_scan(FragmentFormat::Json, input.as_bytes(), &mut out).unwrap();

        assert_eq!(count, 2);
        let lines: Vec<serde_json::Value> = String::from_utf8(out)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines[0]["text"], "Hola.");
        assert_eq!(lines[0]["tag"], "happy");
        assert_eq!(lines[1]["mode"], "loop");
    }

    #[test]
    fn test_scan_sentences_flushes_tail() {
        let mut out = Vec::new();
        let count = run_scan(
            FragmentFormat::Sentences,
            "Hola. ¿Qué tal? Bien".as_bytes(),
            &mut out,
        )
        .unwrap();
        assert_eq!(count, 3);
    }

    /// Reader that hands out one byte per call.
    struct ByteReader<'a>(&'a [u8]);

    impl Read for ByteReader<'_> {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let Some((first, rest)) = self.0.split_first() else {
                return Ok(0);
            };
            buf[0] = *first;
            self.0 = rest;
            Ok(1)
        }
    }

    #[test]
    fn test_scan_handles_split_utf8() {
        let input = r#"{"text":"Adiós, señor."}"#;
        let mut out = Vec::new();
        let count = run_scan(FragmentFormat::Json, ByteReader(input.as_bytes()), &mut out).unwrap();
        assert_eq!(count, 1);
        assert!(String::from_utf8(out).unwrap().contains("Adiós, señor."));
    }

    #[test]
    fn test_scan_rejects_invalid_utf8() {
        let mut out = Vec::new();
        assert!(run_scan(FragmentFormat::Json, &[0xff, 0xfe, b'a'][..], &mut out).is_err());
    }

    #[test]
    fn test_show_config_is_toml() {
        let text = show_config(&Config::default()).unwrap();
        assert!(text.contains("[synthesis]"));
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed, Config::default());
    }

    #[test]
    fn test_wav_output_requires_directory() {
        let mut config = Config::default();
        config.output.kind = OutputKind::Wav;
        assert!(build_output(&config).is_err());
    }

    #[test]
    fn test_null_output_builds() {
        let mut config = Config::default();
        config.output.kind = OutputKind::Null;
        assert_eq!(build_output(&config).unwrap().name(), "null");
    }
}
