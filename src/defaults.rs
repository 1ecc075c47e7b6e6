//! Default configuration constants for voxturn.
//!
//! Shared by the config file types and the runtime pipeline settings so both
//! agree on what "unset" means.

/// Capture sample rate in Hz.
///
/// 16kHz mono is what speech recognizers expect.
pub const SAMPLE_RATE: u32 = 16000;

/// Duration of one audio block handed to the transcription session.
pub const BLOCK_MS: u64 = 100;

/// How often an in-progress partial transcription is attempted.
pub const PARTIAL_INTERVAL_MS: u64 = 200;

/// Trailing audio window handed to the recognizer for a partial.
///
/// Bounded so partial latency does not grow with utterance length.
pub const PARTIAL_WINDOW_MS: u64 = 3000;

/// Silence after the last audio block before the turn is finalized.
pub const INACTIVITY_TIMEOUT_MS: u64 = 500;

/// Minimum buffered audio required for an inactivity flush.
///
/// Shorter bursts are treated as noise and kept in the buffer.
pub const MIN_FINALIZE_MS: u64 = 1000;

/// RMS level (0.0 to 1.0) above which a block counts as speech.
pub const VAD_THRESHOLD: f32 = 0.02;

/// Speech threshold while the assistant's reply is playing.
///
/// High enough that the reply echoing into the mic stays below it.
pub const ECHO_THRESHOLD: f32 = 0.1;

/// Silence kept ahead of speech onset so the first syllable is not clipped.
pub const PRE_SPEECH_MS: u64 = 500;

/// Language code for recognition; "auto" lets the recognizer detect it.
pub const DEFAULT_LANGUAGE: &str = "auto";

/// Language value that triggers automatic language detection.
pub const AUTO_LANGUAGE: &str = "auto";

/// Number of concurrent synthesis workers.
pub const SYNTHESIS_WORKERS: usize = 2;

/// Sample rate of the PCM produced by the synthesizer.
///
/// Piper voices render at 22.05kHz.
pub const SYNTHESIS_SAMPLE_RATE: u32 = 22050;

/// Tag assigned to fragments that do not name one.
pub const DEFAULT_TAG: &str = "speak";

/// Voice used when a fragment tag has no voice profile.
pub const DEFAULT_VOICE: &str = "default";

/// Text generation endpoint (Ollama).
pub const GENERATOR_URL: &str = "http://localhost:11434";

/// Text generation model name.
pub const GENERATOR_MODEL: &str = "llama3.2";

/// Lines of earlier conversation (user and assistant) sent with each request.
pub const HISTORY_ENTRIES: usize = 6;

/// Channel capacities between stages.
pub const INPUT_BUFFER: usize = 256;
pub const WORK_QUEUE_BUFFER: usize = 64;
pub const EVENT_BUFFER: usize = 1024;
