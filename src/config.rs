use crate::audio::vad::VadConfig;
use crate::defaults;
use crate::error::VoxError;
use crate::generation::coordinator::GenerationSettings;
use crate::generation::scanner::FragmentFormat;
use crate::pipeline::orchestrator::PipelineConfig;
use crate::pipeline::transcription::TranscriptionSettings;
use crate::synthesis::reassembler::SynthesisSettings;
use crate::synthesis::synthesizer::{VoiceParams, VoiceTable};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub audio: AudioConfig,
    pub transcription: TranscriptionConfig,
    pub generation: GenerationConfig,
    pub synthesis: SynthesisConfig,
    pub output: OutputConfig,
}

/// Audio capture configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AudioConfig {
    /// Capture device name; the system default when unset.
    pub device: Option<String>,
    pub sample_rate: u32,
    pub block_ms: u64,
    /// Feed WAV input at real time instead of as fast as possible.
    pub pace_files: bool,
}

/// Speech-to-text configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TranscriptionConfig {
    /// Path to a ggml Whisper model.
    pub model_path: PathBuf,
    pub language: String,
    pub threads: Option<usize>,
    pub partial_interval_ms: u64,
    pub partial_window_ms: u64,
    pub inactivity_timeout_ms: u64,
    pub min_finalize_ms: u64,
    /// RMS level (0.0 to 1.0) above which a block is speech.
    pub vad_threshold: f32,
    /// Level needed while a reply is playing. 1.0 mutes the mic during
    /// replies; anything at or below `vad_threshold` disables the gate.
    pub echo_threshold: f32,
    pub pre_speech_ms: u64,
}

/// Text generation configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GenerationConfig {
    /// Ollama server base URL.
    pub url: String,
    pub model: String,
    pub system_prompt: Option<String>,
    pub format: FragmentFormat,
    pub connect_timeout_ms: u64,
    /// Lines of earlier conversation sent as context; 0 disables it.
    pub history_entries: usize,
}

/// Speech synthesis configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SynthesisConfig {
    /// External engine reading text on stdin and writing raw PCM to stdout.
    pub command: String,
    /// Arguments; `{voice}` and `{speed}` are substituted per fragment.
    pub args: Vec<String>,
    pub workers: usize,
    pub queue_capacity: usize,
    /// Sample rate of the engine's PCM output.
    pub sample_rate: u32,
    pub default_voice: VoiceParams,
    /// Voice per fragment tag.
    pub voices: BTreeMap<String, VoiceParams>,
}

/// Where synthesized audio goes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    #[default]
    Speaker,
    /// One WAV file per turn in `output.directory`.
    Wav,
    Null,
}

/// Playback configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct OutputConfig {
    pub kind: OutputKind,
    pub device: Option<String>,
    pub directory: Option<PathBuf>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            device: None,
            sample_rate: defaults::SAMPLE_RATE,
            block_ms: defaults::BLOCK_MS,
            pace_files: false,
        }
    }
}

impl Default for TranscriptionConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("models/ggml-base.bin"),
            language: defaults::DEFAULT_LANGUAGE.to_string(),
            threads: None,
            partial_interval_ms: defaults::PARTIAL_INTERVAL_MS,
            partial_window_ms: defaults::PARTIAL_WINDOW_MS,
            inactivity_timeout_ms: defaults::INACTIVITY_TIMEOUT_MS,
            min_finalize_ms: defaults::MIN_FINALIZE_MS,
            vad_threshold: defaults::VAD_THRESHOLD,
            echo_threshold: defaults::ECHO_THRESHOLD,
            pre_speech_ms: defaults::PRE_SPEECH_MS,
        }
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            url: defaults::GENERATOR_URL.to_string(),
            model: defaults::GENERATOR_MODEL.to_string(),
            system_prompt: None,
            format: FragmentFormat::default(),
            connect_timeout_ms: 5000,
            history_entries: defaults::HISTORY_ENTRIES,
        }
    }
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            command: "piper".to_string(),
            args: vec![
                "--model".to_string(),
                "{voice}".to_string(),
                "--output-raw".to_string(),
            ],
            workers: defaults::SYNTHESIS_WORKERS,
            queue_capacity: defaults::WORK_QUEUE_BUFFER,
            sample_rate: defaults::SYNTHESIS_SAMPLE_RATE,
            default_voice: VoiceParams::default(),
            voices: BTreeMap::new(),
        }
    }
}

fn invalid(key: &str, message: &str) -> VoxError {
    VoxError::ConfigInvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Returns an error if the file contains invalid TOML or invalid values.
    /// Missing fields will use default values.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file or return defaults if file doesn't exist
    ///
    /// Errors other than a missing file are returned.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        match Self::load(path) {
            Ok(config) => Ok(config),
            Err(e)
                if e.downcast_ref::<std::io::Error>()
                    .is_some_and(|io_err| io_err.kind() == std::io::ErrorKind::NotFound) =>
            {
                Ok(Self::default())
            }
            Err(e) => Err(e.context(format!("Failed to load config from {}", path.display()))),
        }
    }

    /// Apply environment variable overrides
    ///
    /// Supported environment variables:
    /// - VOXTURN_LANGUAGE → transcription.language
    /// - VOXTURN_GENERATOR_MODEL → generation.model
    /// - VOXTURN_AUDIO_DEVICE → audio.device
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(language) = std::env::var("VOXTURN_LANGUAGE")
            && !language.is_empty()
        {
            self.transcription.language = language;
        }

        if let Ok(model) = std::env::var("VOXTURN_GENERATOR_MODEL")
            && !model.is_empty()
        {
            self.generation.model = model;
        }

        if let Ok(device) = std::env::var("VOXTURN_AUDIO_DEVICE")
            && !device.is_empty()
        {
            self.audio.device = Some(device);
        }

        self
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.audio.sample_rate == 0 {
            return Err(invalid("audio.sample_rate", "must be positive"));
        }
        if self.audio.block_ms == 0 {
            return Err(invalid("audio.block_ms", "must be positive"));
        }
        if self.transcription.partial_interval_ms == 0 {
            return Err(invalid("transcription.partial_interval_ms", "must be positive"));
        }
        if self.transcription.partial_window_ms == 0 {
            return Err(invalid("transcription.partial_window_ms", "must be positive"));
        }
        let levels = [
            ("transcription.vad_threshold", self.transcription.vad_threshold),
            ("transcription.echo_threshold", self.transcription.echo_threshold),
        ];
        for (field, level) in levels {
            if !(0.0..=1.0).contains(&level) {
                return Err(invalid(field, "must be between 0.0 and 1.0"));
            }
        }
        if self.synthesis.workers < 2 {
            return Err(invalid(
                "synthesis.workers",
                "at least two workers are needed to overlap synthesis with playback",
            ));
        }
        if self.synthesis.queue_capacity == 0 {
            return Err(invalid("synthesis.queue_capacity", "must be positive"));
        }
        if self.synthesis.command.trim().is_empty() {
            return Err(invalid("synthesis.command", "must not be empty"));
        }
        let speeds = std::iter::once(("default_voice", &self.synthesis.default_voice))
            .chain(self.synthesis.voices.iter().map(|(tag, v)| (tag.as_str(), v)));
        for (tag, voice) in speeds {
            if !(voice.speed.is_finite() && voice.speed > 0.0) {
                return Err(invalid(
                    &format!("synthesis.voices.{}.speed", tag),
                    "must be a positive number",
                ));
            }
        }
        if self.output.kind == OutputKind::Wav && self.output.directory.is_none() {
            return Err(invalid("output.directory", "required when output.kind = \"wav\""));
        }
        Ok(())
    }

    /// Fragment tag → voice mapping.
    pub fn voice_table(&self) -> VoiceTable {
        self.synthesis.voices.iter().fold(
            VoiceTable::new(self.synthesis.default_voice.clone()),
            |table, (tag, params)| table.with_voice(tag, params.clone()),
        )
    }

    /// Runtime settings for [`crate::pipeline::Pipeline`].
    pub fn to_pipeline_config(&self) -> PipelineConfig {
        let transcription = &self.transcription;
        PipelineConfig {
            transcription: TranscriptionSettings {
                sample_rate: self.audio.sample_rate,
                language: transcription.language.clone(),
                partial_interval: Duration::from_millis(transcription.partial_interval_ms),
                partial_window: Duration::from_millis(transcription.partial_window_ms),
                inactivity_timeout: Duration::from_millis(transcription.inactivity_timeout_ms),
                min_finalize_audio: Duration::from_millis(transcription.min_finalize_ms),
                vad: VadConfig {
                    speech_threshold: transcription.vad_threshold,
                    echo_threshold: transcription.echo_threshold,
                },
                pre_speech: Duration::from_millis(transcription.pre_speech_ms),
            },
            generation: GenerationSettings {
                system_prompt: self.generation.system_prompt.clone(),
                format: self.generation.format,
                history_limit: self.generation.history_entries,
            },
            synthesis: SynthesisSettings {
                workers: self.synthesis.workers,
                queue_capacity: self.synthesis.queue_capacity,
                voices: self.voice_table(),
            },
            block_duration: Duration::from_millis(self.audio.block_ms),
            pace_finite_sources: self.audio.pace_files,
            ..PipelineConfig::default()
        }
    }

    /// Get the default configuration file path
    ///
    /// Returns ~/.config/voxturn/config.toml on Linux
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("voxturn")
            .join("config.toml")
    }
}
