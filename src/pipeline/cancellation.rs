//! Barge-in: stop generation, flush playback, advance the turn.

use crate::pipeline::session::Session;
use crate::pipeline::types::{SessionState, TurnId};

/// Stops the active generation.
pub trait GenerationControl {
    /// Must not block on the generation thread.
    fn cancel(&self);
}

/// Stops playback and discards queued synthesis.
pub trait PlaybackControl {
    /// Discard everything older than `next_turn`. Returns once playback
    /// has stopped.
    fn flush(&self, next_turn: TurnId);
}

pub struct CancellationBus<'a> {
    generation: &'a dyn GenerationControl,
    playback: &'a dyn PlaybackControl,
}

impl<'a> CancellationBus<'a> {
    pub fn new(generation: &'a dyn GenerationControl, playback: &'a dyn PlaybackControl) -> Self {
        Self {
            generation,
            playback,
        }
    }

    /// Interrupt the current reply.
    ///
    /// No-op unless the session is generating or speaking. Returns whether
    /// anything was interrupted.
    pub fn interrupt(&self, session: &mut Session, audio_active: bool) -> bool {
        if !session.is_responding() {
            return false;
        }

        let interrupted = session.turn();
        tracing::info!(turn = interrupted, state = %session.state(), "interrupting");
        self.generation.cancel();
        self.playback.flush(interrupted + 1);
        session.transition(SessionState::Interrupted);
        session.advance_turn();
        session.transition(if audio_active {
            SessionState::Listening
        } else {
            SessionState::Idle
        });
        true
    }
}
