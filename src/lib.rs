//! voxturn - Turn-based voice conversations
//!
//! Streams speech through recognition, text generation and multi-worker
//! synthesis, with ordered playback and barge-in.

#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::let_underscore_must_use)]

pub mod audio;
#[cfg(feature = "cli")]
pub mod cli;
pub mod config;
pub mod defaults;
pub mod error;
pub mod generation;
pub mod pipeline;
pub mod stt;
pub mod synthesis;

// Composition root
#[cfg(feature = "cli")]
pub mod app;

// Engine seams
pub use audio::playback::AudioOutput;
pub use audio::recorder::AudioSource;
pub use generation::generator::TextGenerator;
pub use stt::recognizer::SpeechRecognizer;
pub use synthesis::synthesizer::SpeechSynthesizer;

// Pipeline
pub use pipeline::orchestrator::{Pipeline, PipelineConfig, PipelineHandle};
pub use pipeline::types::{PipelineEvent, SessionState, TurnId};

// Error handling
pub use error::{Result, VoxError};

// Config
pub use config::Config;

// Station framework (for advanced users)
pub use pipeline::error::{ErrorReporter, StationError};
pub use pipeline::station::Station;

/// Build version string with optional git commit hash.
///
/// Returns `"0.1.0+abc1234"` when git hash is available, `"0.1.0"` otherwise.
pub fn version_string() -> String {
    let version = env!("CARGO_PKG_VERSION");
    match option_env!("GIT_HASH") {
        Some(hash) if !hash.is_empty() => format!("{}+{}", version, hash),
        _ => version.to_string(),
    }
}
