//! Turn controller: the only owner of the [`Session`].
//!
//! Reacts to transcripts, playback progress and user commands, starting
//! generations and interrupting them on barge-in.

use crate::audio::vad::EchoGate;
use crate::generation::coordinator::GenerationCoordinator;
use crate::pipeline::cancellation::CancellationBus;
use crate::pipeline::events::EventPublisher;
use crate::pipeline::session::Session;
use crate::pipeline::types::{PipelineEvent, PlaybackNotice, SessionState, TranscriptEvent};
use crate::synthesis::reassembler::SynthesisReassembler;
use crossbeam_channel::{Receiver, never, select};

/// Commands from the pipeline handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    Interrupt,
    Shutdown,
}

enum Input {
    Transcript(Option<TranscriptEvent>),
    Notice(Option<PlaybackNotice>),
    Command(Option<ControlCommand>),
}

pub struct TurnController {
    session: Session,
    events: EventPublisher,
    generation: GenerationCoordinator,
    playback: SynthesisReassembler,
    /// The user is talking (activity or partials since the last final).
    audio_active: bool,
}

impl TurnController {
    pub fn new(
        events: EventPublisher,
        generation: GenerationCoordinator,
        playback: SynthesisReassembler,
    ) -> Self {
        Self {
            session: Session::new(events.clone()),
            events,
            generation,
            playback,
            audio_active: false,
        }
    }

    /// Engage `gate` while the reply is playing.
    pub fn with_echo_gate(mut self, gate: EchoGate) -> Self {
        self.session = self.session.with_echo_gate(gate);
        self
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn on_transcript(&mut self, event: TranscriptEvent) {
        match event {
            TranscriptEvent::SpeechActivity { .. } => self.on_speech(),
            TranscriptEvent::Partial { text, .. } => {
                self.events.publish(PipelineEvent::Partial { text });
                self.on_speech();
            }
            TranscriptEvent::Final { text, .. } => self.on_final(text),
        }
    }

    fn on_speech(&mut self) {
        self.audio_active = true;
        if self.session.state() == SessionState::Idle {
            self.session.transition(SessionState::Listening);
        }
    }

    fn on_final(&mut self, text: String) {
        self.events.publish(PipelineEvent::Final { text: text.clone() });
        self.audio_active = false;

        if text.trim().is_empty() {
            if self.session.state() == SessionState::Listening {
                self.session.transition(SessionState::Idle);
            }
            return;
        }

        let turn = if self.interrupt() {
            self.session.turn()
        } else {
            self.session.advance_turn()
        };

        let Some(sink) = self.playback.submitter() else {
            tracing::warn!(turn, "synthesis is shut down, ignoring transcript");
            return;
        };
        match self.generation.generate(&text, turn, sink) {
            Ok(()) => self.session.transition(SessionState::Generating),
            Err(e) => {
                tracing::warn!(turn, "could not start generation: {}", e);
                self.session.transition(SessionState::Idle);
            }
        }
    }

    pub fn on_notice(&mut self, notice: PlaybackNotice) {
        match notice {
            PlaybackNotice::Started { turn } if turn == self.session.turn() => {
                if self.session.state() == SessionState::Generating {
                    self.session.transition(SessionState::Speaking);
                }
            }
            PlaybackNotice::Drained { turn } if turn == self.session.turn() => {
                if self.session.is_responding() {
                    self.session.transition(if self.audio_active {
                        SessionState::Listening
                    } else {
                        SessionState::Idle
                    });
                }
            }
            stale => tracing::debug!(?stale, "ignoring notice for an old turn"),
        }
    }

    /// Stop the current reply, if any.
    pub fn interrupt(&mut self) -> bool {
        let bus = CancellationBus::new(&self.generation, &self.playback);
        bus.interrupt(&mut self.session, self.audio_active)
    }

    /// Process events until shut down.
    ///
    /// Once `transcripts` closes no new turn can start, so the loop also
    /// ends as soon as the current reply (if any) has played out.
    pub fn run(
        mut self,
        transcripts: Receiver<TranscriptEvent>,
        notices: Receiver<PlaybackNotice>,
        commands: Receiver<ControlCommand>,
    ) {
        let mut transcripts = transcripts;
        let mut notices = notices;
        let mut draining = false;
        loop {
            let input = select! {
                recv(transcripts) -> msg => Input::Transcript(msg.ok()),
                recv(notices) -> msg => Input::Notice(msg.ok()),
                recv(commands) -> msg => Input::Command(msg.ok()),
            };
            match input {
                Input::Transcript(Some(event)) => self.on_transcript(event),
                Input::Transcript(None) => {
                    transcripts = never();
                    draining = true;
                }
                Input::Notice(Some(notice)) => self.on_notice(notice),
                Input::Notice(None) => notices = never(),
                Input::Command(Some(ControlCommand::Interrupt)) => {
                    self.interrupt();
                }
                Input::Command(Some(ControlCommand::Shutdown)) | Input::Command(None) => break,
            }
            if draining && !self.session.is_responding() {
                tracing::debug!("transcription closed and no reply pending");
                break;
            }
        }
        self.shutdown();
    }

    fn shutdown(mut self) {
        if let Some(outcome) = self.generation.cancel_and_wait() {
            tracing::debug!(?outcome, "generation stopped for shutdown");
        }
        self.playback.shutdown();
        tracing::debug!(turn = self.session.turn(), "turn controller stopped");
    }
}
