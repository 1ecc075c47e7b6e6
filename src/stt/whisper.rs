//! Whisper-based speech recognition.
//!
//! The real engine requires the `whisper` feature (and cmake). Without it,
//! [`WhisperRecognizer`] still validates its model path but every
//! transcription returns an error explaining how to enable it.

use crate::error::{Result, VoxError};
use crate::stt::recognizer::SpeechRecognizer;
use std::path::PathBuf;

#[cfg(feature = "whisper")]
use std::sync::{Mutex, Once};
#[cfg(feature = "whisper")]
use whisper_rs::{
    FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters, install_logging_hooks,
};

#[cfg(feature = "whisper")]
static LOGGING_HOOKS_INSTALLED: Once = Once::new();

/// Configuration for the Whisper recognizer.
#[derive(Debug, Clone)]
pub struct WhisperConfig {
    /// Path to a ggml Whisper model file
    pub model_path: PathBuf,
    /// Number of threads for inference (None = whisper.cpp default)
    pub threads: Option<usize>,
}

impl Default for WhisperConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("models/ggml-base.bin"),
            threads: None,
        }
    }
}

/// Whisper recognizer.
///
/// The context is behind a Mutex; each call creates its own state. The
/// transcription session already serializes calls per buffer, the Mutex
/// covers sharing one model between pipelines.
pub struct WhisperRecognizer {
    #[cfg(feature = "whisper")]
    context: Mutex<WhisperContext>,
    config: WhisperConfig,
    model_name: String,
}

impl std::fmt::Debug for WhisperRecognizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WhisperRecognizer")
            .field("config", &self.config)
            .field("model_name", &self.model_name)
            .finish()
    }
}

impl WhisperRecognizer {
    /// Load a model.
    ///
    /// # Errors
    /// `RecognitionModelNotFound` if the file is missing, `Recognition` if
    /// whisper.cpp rejects it.
    pub fn new(config: WhisperConfig) -> Result<Self> {
        if !config.model_path.exists() {
            return Err(VoxError::RecognitionModelNotFound {
                path: config.model_path.to_string_lossy().to_string(),
            });
        }

        let model_name = config
            .model_path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("unknown")
            .to_string();

        Self::load(config, model_name)
    }

    #[cfg(feature = "whisper")]
    fn load(config: WhisperConfig, model_name: String) -> Result<Self> {
        LOGGING_HOOKS_INSTALLED.call_once(|| {
            install_logging_hooks();
        });

        let path = config
            .model_path
            .to_str()
            .ok_or_else(|| VoxError::Recognition {
                message: "Invalid UTF-8 in model path".to_string(),
            })?;
        let mut params = WhisperContextParameters::default();
        params.flash_attn(true);
        let context = WhisperContext::new_with_params(path, params).map_err(|e| {
            VoxError::Recognition {
                message: format!("Failed to load Whisper model: {}", e),
            }
        })?;

        tracing::info!(model = %model_name, "loaded whisper model");
        Ok(Self {
            context: Mutex::new(context),
            config,
            model_name,
        })
    }

    #[cfg(not(feature = "whisper"))]
    fn load(config: WhisperConfig, model_name: String) -> Result<Self> {
        Ok(Self { config, model_name })
    }

    pub fn config(&self) -> &WhisperConfig {
        &self.config
    }
}

/// Convert i16 PCM to f32 in [-1.0, 1.0] as Whisper expects.
pub fn convert_audio(samples: &[i16]) -> Vec<f32> {
    samples
        .iter()
        .map(|&sample| sample as f32 / 32768.0)
        .collect()
}

#[cfg(feature = "whisper")]
impl SpeechRecognizer for WhisperRecognizer {
    fn transcribe(&self, audio: &[i16], language: &str) -> Result<String> {
        let audio_f32 = convert_audio(audio);

        let context = self.context.lock().map_err(|e| VoxError::Recognition {
            message: format!("Failed to acquire context lock: {}", e),
        })?;
        let mut state = context.create_state().map_err(|e| VoxError::Recognition {
            message: format!("Failed to create Whisper state: {}", e),
        })?;

        let mut params = FullParams::new(SamplingStrategy::Greedy { best_of: 1 });
        if language == crate::defaults::AUTO_LANGUAGE {
            params.set_language(None);
        } else {
            params.set_language(Some(language));
        }
        if let Some(threads) = self.config.threads {
            params.set_n_threads(threads as i32);
        }
        params.set_print_special(false);
        params.set_print_progress(false);
        params.set_print_realtime(false);
        params.set_print_timestamps(false);

        state
            .full(params, &audio_f32)
            .map_err(|e| VoxError::Recognition {
                message: format!("Whisper inference failed: {}", e),
            })?;

        let mut transcription = String::new();
        for segment in state.as_iter() {
            transcription.push_str(&segment.to_string());
        }
        Ok(transcription.trim().to_string())
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }
}

#[cfg(not(feature = "whisper"))]
impl SpeechRecognizer for WhisperRecognizer {
    fn transcribe(&self, _audio: &[i16], _language: &str) -> Result<String> {
        Err(VoxError::Recognition {
            message: "built without speech recognition; rebuild with --features whisper"
                .to_string(),
        })
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }
}
