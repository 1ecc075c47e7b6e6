//! Streaming text generation and fragment extraction.

pub mod coordinator;
pub mod generator;
#[cfg(feature = "http")]
pub mod ollama;
pub mod scanner;

pub use coordinator::{
    CancelFlag, ConversationHistory, FragmentSink, GenerationCoordinator, GenerationOutcome,
    GenerationSettings, run_generation,
};
pub use generator::{
    GenerationRequest, HistoryEntry, Role, ScriptedGenerator, TextGenerator, TokenStream,
};
pub use scanner::{FragmentFormat, FragmentScanner, FragmentUnit};
