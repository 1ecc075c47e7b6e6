//! Turn-based conversation pipeline.
//!
//! Each stage runs in its own thread, connected by crossbeam channels.
//! The turn controller owns the session state; every other stage only
//! sees turn ids.

pub mod cancellation;
pub mod clock;
pub mod controller;
pub mod error;
pub mod events;
pub mod ingest;
pub mod orchestrator;
pub mod session;
pub mod station;
pub mod transcription;
pub mod types;

pub use cancellation::{CancellationBus, GenerationControl, PlaybackControl};
pub use clock::{Clock, MockClock, SystemClock};
pub use controller::{ControlCommand, TurnController};
pub use error::{ErrorReporter, LogReporter, StationError};
pub use events::EventPublisher;
pub use ingest::{AudioIngest, IngestSettings};
pub use orchestrator::{Pipeline, PipelineConfig, PipelineHandle};
pub use session::Session;
pub use station::{Station, StationRunner};
pub use transcription::{TranscriptionSession, TranscriptionSettings};
pub use types::{
    AudioBlock, Fragment, FragmentKind, FragmentMode, PipelineEvent, PlaybackNotice, SessionState,
    SynthesisResult, TranscriptEvent, TranscriptionInput, TurnId,
};
