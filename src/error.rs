//! Error types for voxturn.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum VoxError {
    // Configuration errors
    #[error("Failed to parse configuration: {message}")]
    ConfigParse { message: String },

    #[error("Invalid configuration value for {key}: {message}")]
    ConfigInvalidValue { key: String, message: String },

    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    // Audio capture and playback errors
    #[error("Audio device not found: {device}")]
    AudioDeviceNotFound { device: String },

    #[error("Audio capture failed: {message}")]
    AudioCapture { message: String },

    #[error("Audio output failed: {message}")]
    AudioOutput { message: String },

    // Engine errors, one per stage
    #[error("Recognition model not found at {path}")]
    RecognitionModelNotFound { path: String },

    #[error("Recognition error: {message}")]
    Recognition { message: String },

    #[error("Generation error: {message}")]
    Generation { message: String },

    #[error("Synthesis engine not found: {program}")]
    SynthesisEngineNotFound { program: String },

    #[error("Synthesis error: {message}")]
    Synthesis { message: String },

    // General I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Generic error for cases not covered above
    #[error("{0}")]
    Other(String),
}

// Type alias for convenience
pub type Result<T> = std::result::Result<T, VoxError>;
