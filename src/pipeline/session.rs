//! Conversation state, owned by the turn controller.

use crate::audio::vad::EchoGate;
use crate::pipeline::events::EventPublisher;
use crate::pipeline::types::{PipelineEvent, SessionState, TurnId};

#[derive(Debug)]
pub struct Session {
    state: SessionState,
    turn_seq: TurnId,
    events: EventPublisher,
    /// Engaged exactly while the state is `Speaking`.
    echo: Option<EchoGate>,
}

impl Session {
    pub fn new(events: EventPublisher) -> Self {
        Self {
            state: SessionState::Idle,
            turn_seq: 0,
            events,
            echo: None,
        }
    }

    pub fn with_echo_gate(mut self, gate: EchoGate) -> Self {
        self.echo = Some(gate);
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn turn(&self) -> TurnId {
        self.turn_seq
    }

    /// Move to `to`, publishing `StateChanged` if it differs.
    pub fn transition(&mut self, to: SessionState) {
        if self.state == to {
            return;
        }
        let from = self.state;
        self.state = to;
        if let Some(gate) = &self.echo {
            if to == SessionState::Speaking {
                gate.engage();
            } else {
                gate.release();
            }
        }
        tracing::debug!(%from, %to, turn = self.turn_seq, "state changed");
        self.events.publish(PipelineEvent::StateChanged {
            from,
            to,
            turn: self.turn_seq,
        });
    }

    /// Start a new turn, returning its id.
    pub fn advance_turn(&mut self) -> TurnId {
        self.turn_seq += 1;
        self.turn_seq
    }

    /// True while a reply is being produced or played.
    pub fn is_responding(&self) -> bool {
        matches!(
            self.state,
            SessionState::Generating | SessionState::Speaking
        )
    }
}
