//! Data types that flow between pipeline stages.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;

/// Identifies one user-utterance-to-response cycle.
pub type TurnId = u64;

/// A fixed-duration block of mono 16-bit PCM from the capture device.
#[derive(Debug, Clone)]
pub struct AudioBlock {
    /// PCM samples (16-bit signed integers, 16kHz mono).
    pub samples: Vec<i16>,
    /// Timestamp when this block was captured.
    pub timestamp: Instant,
    /// Capture sequence number for ordering and gap detection.
    pub sequence: u64,
}

impl AudioBlock {
    /// Creates a new audio block.
    pub fn new(samples: Vec<i16>, timestamp: Instant, sequence: u64) -> Self {
        Self {
            samples,
            timestamp,
            sequence,
        }
    }
}

/// Control signals and audio that drive the transcription session.
#[derive(Debug, Clone)]
pub enum TranscriptionInput {
    /// The speaker started a new turn; anything buffered is discarded.
    StartOfTurn,
    Audio(AudioBlock),
    /// The speaker finished; finalize whatever is buffered.
    EndOfTurn,
}

/// Output of the transcription session.
///
/// `utterance` counts finals emitted by the session, it is not the
/// conversation turn.
#[derive(Debug, Clone, PartialEq)]
pub enum TranscriptEvent {
    /// First audio of a new utterance arrived.
    SpeechActivity { utterance: u64 },
    Partial { utterance: u64, text: String },
    Final { utterance: u64, text: String },
}

/// Playback behavior requested for a fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FragmentMode {
    #[default]
    Once,
    Loop,
}

impl FragmentMode {
    /// Parses a mode name, falling back to `Once` for anything unknown.
    pub fn parse_lenient(value: &str) -> Self {
        if value.trim().eq_ignore_ascii_case("loop") {
            FragmentMode::Loop
        } else {
            FragmentMode::Once
        }
    }
}

/// Whether a fragment carries text or closes its turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FragmentKind {
    Speech,
    EndOfTurn,
}

/// One ordered unit of generated text destined for one synthesis call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fragment {
    pub turn: TurnId,
    /// 1-based, strictly increasing within a turn.
    pub seq: u64,
    pub text: String,
    pub tag: String,
    pub mode: FragmentMode,
    pub kind: FragmentKind,
}

impl Fragment {
    /// Creates a speech fragment.
    pub fn speech(turn: TurnId, seq: u64, text: String, tag: String, mode: FragmentMode) -> Self {
        Self {
            turn,
            seq,
            text,
            tag,
            mode,
            kind: FragmentKind::Speech,
        }
    }

    /// Creates the sentinel that closes `turn` at position `seq`.
    pub fn end_of_turn(turn: TurnId, seq: u64) -> Self {
        Self {
            turn,
            seq,
            text: String::new(),
            tag: String::new(),
            mode: FragmentMode::Once,
            kind: FragmentKind::EndOfTurn,
        }
    }

    pub fn is_end_of_turn(&self) -> bool {
        self.kind == FragmentKind::EndOfTurn
    }
}

/// Outcome of synthesizing one fragment.
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesisResult {
    pub turn: TurnId,
    pub seq: u64,
    /// Raw little-endian 16-bit PCM; `None` when synthesis failed.
    pub audio: Option<Vec<u8>>,
    pub ok: bool,
    pub end_of_turn: bool,
}

impl SynthesisResult {
    pub fn audio(turn: TurnId, seq: u64, audio: Vec<u8>) -> Self {
        Self {
            turn,
            seq,
            audio: Some(audio),
            ok: true,
            end_of_turn: false,
        }
    }

    /// A failed slot: keeps its position in the sequence, plays nothing.
    pub fn failed(turn: TurnId, seq: u64) -> Self {
        Self {
            turn,
            seq,
            audio: None,
            ok: false,
            end_of_turn: false,
        }
    }

    pub fn end_of_turn(turn: TurnId, seq: u64) -> Self {
        Self {
            turn,
            seq,
            audio: None,
            ok: true,
            end_of_turn: true,
        }
    }
}

/// Conversation state owned by the turn controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    Listening,
    Generating,
    Speaking,
    Interrupted,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Listening => "listening",
            SessionState::Generating => "generating",
            SessionState::Speaking => "speaking",
            SessionState::Interrupted => "interrupted",
        };
        f.write_str(name)
    }
}

/// Events exposed to the presentation layer.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    Partial { text: String },
    Final { text: String },
    StateChanged {
        from: SessionState,
        to: SessionState,
        turn: TurnId,
    },
    SpeakingStarted { turn: TurnId },
    SpeakingStopped { turn: TurnId },
    /// Audio written to the output, in playback order.
    AudioChunk {
        turn: TurnId,
        seq: u64,
        audio: Vec<u8>,
    },
    /// The output device failed; playback is muted until the next turn.
    DeviceError { message: String },
}

/// Playback progress reported by the reassembler to the turn controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackNotice {
    /// The first slot of the turn reached the output.
    Started { turn: TurnId },
    /// The end-of-turn sentinel was drained.
    Drained { turn: TurnId },
}
