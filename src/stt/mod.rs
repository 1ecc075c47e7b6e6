//! Speech recognition engines.

pub mod recognizer;
pub mod whisper;

pub use recognizer::{MockRecognizer, SpeechRecognizer, clean_transcription};
pub use whisper::{WhisperConfig, WhisperRecognizer};
