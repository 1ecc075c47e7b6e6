//! Multi-worker speech synthesis with ordered playback.

pub mod reassembler;
pub mod synthesizer;
pub mod worker;

pub use reassembler::{PlaybackWindow, SynthesisReassembler, SynthesisSettings};
pub use synthesizer::{
    CommandSynthesizer, MockSynthesizer, SpeechSynthesizer, VoiceParams, VoiceTable,
};
pub use worker::{SynthesisWorker, TurnGate};
