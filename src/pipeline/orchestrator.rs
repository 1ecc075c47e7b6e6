//! Conversation pipeline that runs from startup until shutdown.
//!
//! Thread layout:
//!
//! ```text
//! source ─► ingest ─► transcription ─► turn controller ─► generation
//!                                          ▲                  │
//!                                          │ notices          ▼ fragments
//!                                     reassembler ◄── synthesis workers
//!                                          │
//!                                          ▼
//!                                     audio output
//! ```

use crate::audio::playback::AudioOutput;
use crate::audio::recorder::AudioSource;
use crate::audio::vad::EchoGate;
use crate::defaults;
use crate::error::{Result, VoxError};
use crate::generation::coordinator::{GenerationCoordinator, GenerationSettings};
use crate::generation::generator::TextGenerator;
use crate::pipeline::clock::{Clock, SystemClock};
use crate::pipeline::controller::{ControlCommand, TurnController};
use crate::pipeline::error::{ErrorReporter, LogReporter, panic_message};
use crate::pipeline::events::EventPublisher;
use crate::pipeline::ingest::{AudioIngest, IngestSettings};
use crate::pipeline::transcription::{TranscriptionSession, TranscriptionSettings};
use crate::pipeline::types::{AudioBlock, PipelineEvent, TranscriptionInput};
use crate::stt::recognizer::SpeechRecognizer;
use crate::synthesis::reassembler::{SynthesisReassembler, SynthesisSettings};
use crate::synthesis::synthesizer::SpeechSynthesizer;
use crossbeam_channel::{Receiver, Sender, bounded, unbounded};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// How long `stop` waits for threads before detaching them.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

/// Configuration for the pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub transcription: TranscriptionSettings,
    pub generation: GenerationSettings,
    pub synthesis: SynthesisSettings,
    /// Size of the blocks an attached source is cut into.
    pub block_duration: Duration,
    /// Feed file sources no faster than real time.
    pub pace_finite_sources: bool,
    /// Channel buffer sizes
    pub input_buffer: usize,
    pub event_buffer: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            transcription: TranscriptionSettings::default(),
            generation: GenerationSettings::default(),
            synthesis: SynthesisSettings::default(),
            block_duration: Duration::from_millis(defaults::BLOCK_MS),
            pace_finite_sources: false,
            input_buffer: defaults::INPUT_BUFFER,
            event_buffer: defaults::EVENT_BUFFER,
        }
    }
}

/// Handle to a running pipeline.
pub struct PipelineHandle {
    running: Arc<AtomicBool>,
    input: Option<Sender<TranscriptionInput>>,
    commands: Sender<ControlCommand>,
    events: Receiver<PipelineEvent>,
    sequence: AtomicU64,
    ingest: IngestSettings,
    source_finished: Arc<AtomicBool>,
    error_reporter: Arc<dyn ErrorReporter>,
    controller: Option<JoinHandle<()>>,
    threads: Vec<JoinHandle<()>>,
}

impl PipelineHandle {
    /// Discard buffered audio and start a new user turn.
    pub fn start_of_turn(&self) -> bool {
        self.send(TranscriptionInput::StartOfTurn)
    }

    /// Queue one block of 16kHz mono samples. Blocks while the
    /// transcription input is full.
    pub fn push_audio(&self, samples: Vec<i16>) -> bool {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        self.send(TranscriptionInput::Audio(AudioBlock::new(
            samples,
            Instant::now(),
            sequence,
        )))
    }

    /// The user stopped talking; finalize the transcript now.
    pub fn end_of_turn(&self) -> bool {
        self.send(TranscriptionInput::EndOfTurn)
    }

    /// Barge in on the current reply.
    pub fn interrupt(&self) -> bool {
        self.commands.send(ControlCommand::Interrupt).is_ok()
    }

    fn send(&self, input: TranscriptionInput) -> bool {
        self.input
            .as_ref()
            .is_some_and(|tx| tx.send(input).is_ok())
    }

    /// Capture from `source` on its own thread.
    ///
    /// File sources end the turn when exhausted.
    pub fn attach_source(&mut self, source: Box<dyn AudioSource>) -> Result<()> {
        let Some(input) = self.input.clone() else {
            return Err(VoxError::Other("pipeline input is closed".to_string()));
        };
        let handle = AudioIngest::start(
            source,
            self.ingest.clone(),
            input,
            Arc::clone(&self.running),
            Arc::clone(&self.source_finished),
            Arc::clone(&self.error_reporter),
        )?;
        self.threads.push(handle);
        Ok(())
    }

    /// Stop accepting audio from this handle.
    ///
    /// Once every attached source has finished too, the pipeline plays out
    /// the last reply and winds down on its own.
    pub fn close_input(&mut self) {
        self.input = None;
    }

    /// Pipeline events for the presentation layer.
    pub fn events(&self) -> &Receiver<PipelineEvent> {
        &self.events
    }

    /// True once an attached source has ended or failed.
    pub fn source_finished(&self) -> bool {
        self.source_finished.load(Ordering::SeqCst)
    }

    /// True until the turn controller exits.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
            && self.controller.as_ref().is_some_and(|c| !c.is_finished())
    }

    /// Wait for the pipeline to wind down after `close_input`.
    ///
    /// Returns false if it is still running after `timeout`.
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.is_running() {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(20));
        }
        true
    }

    /// Stops the pipeline.
    ///
    /// Generation is cancelled and playback is cut. Threads that are still
    /// running after the grace period are detached.
    pub fn stop(mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.input = None;
        if self.commands.send(ControlCommand::Shutdown).is_err() {
            tracing::debug!("turn controller already stopped");
        }

        let mut threads = std::mem::take(&mut self.threads);
        threads.extend(self.controller.take());
        join_with_deadline(threads, Instant::now() + SHUTDOWN_GRACE);
    }
}

/// Join finished threads until `deadline`, logging panics.
fn join_with_deadline(mut threads: Vec<JoinHandle<()>>, deadline: Instant) {
    let poll_interval = Duration::from_millis(20);
    loop {
        let mut remaining = Vec::new();
        for handle in threads.drain(..) {
            if !handle.is_finished() {
                remaining.push(handle);
                continue;
            }
            let name = handle.thread().name().unwrap_or("pipeline").to_string();
            if let Err(panic_info) = handle.join() {
                tracing::error!(thread = %name, "thread panicked: {}", panic_message(&*panic_info));
            }
        }
        threads = remaining;

        if threads.is_empty() {
            break;
        }
        if Instant::now() >= deadline {
            tracing::warn!(count = threads.len(), "shutdown timeout, detaching threads");
            break;
        }
        thread::sleep(poll_interval);
    }
}

/// Voice pipeline: audio → transcription → generation → synthesis → output.
pub struct Pipeline {
    config: PipelineConfig,
    error_reporter: Arc<dyn ErrorReporter>,
    clock: Arc<dyn Clock>,
}

impl Pipeline {
    /// Creates a new pipeline with default error reporter.
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            error_reporter: Arc::new(LogReporter),
            clock: Arc::new(SystemClock),
        }
    }

    /// Sets a custom error reporter.
    pub fn with_error_reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.error_reporter = reporter;
        self
    }

    /// Sets a custom clock (for deterministic testing).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Starts every stage. Audio arrives through the returned handle,
    /// either pushed directly or from an attached source.
    pub fn start(
        self,
        recognizer: Arc<dyn SpeechRecognizer>,
        generator: Arc<dyn TextGenerator>,
        synthesizer: Arc<dyn SpeechSynthesizer>,
        output: Box<dyn AudioOutput>,
    ) -> Result<PipelineHandle> {
        let running = Arc::new(AtomicBool::new(true));

        let (input_tx, input_rx) = bounded(self.config.input_buffer.max(1));
        let (transcript_tx, transcript_rx) = unbounded();
        let (event_tx, event_rx) = bounded(self.config.event_buffer.max(1));
        // Unbounded: the reassembler must never block on the controller.
        let (notice_tx, notice_rx) = unbounded();
        let (command_tx, command_rx) = unbounded();
        let events = EventPublisher::new(event_tx);

        let playback = SynthesisReassembler::start(
            synthesizer,
            output,
            self.config.synthesis.clone(),
            events.clone(),
            notice_tx,
            Arc::clone(&self.error_reporter),
        )?;
        let generation = GenerationCoordinator::new(generator, self.config.generation.clone());
        let echo = EchoGate::new();
        let controller =
            TurnController::new(events, generation, playback).with_echo_gate(echo.clone());

        let session = TranscriptionSession::new(
            self.config.transcription.clone(),
            recognizer,
            Arc::clone(&self.clock),
            transcript_tx,
        )?
        .with_echo_gate(echo);

        let session_running = Arc::clone(&running);
        let transcription = thread::Builder::new()
            .name("transcription".to_string())
            .spawn(move || session.run(input_rx, session_running))
            .map_err(|e| VoxError::Other(format!("Failed to spawn transcription thread: {}", e)))?;

        let controller = thread::Builder::new()
            .name("turn-controller".to_string())
            .spawn(move || controller.run(transcript_rx, notice_rx, command_rx))
            .map_err(|e| VoxError::Other(format!("Failed to spawn controller thread: {}", e)))?;

        tracing::info!(
            workers = self.config.synthesis.workers,
            format = ?self.config.generation.format,
            "pipeline started"
        );

        Ok(PipelineHandle {
            running,
            input: Some(input_tx),
            commands: command_tx,
            events: event_rx,
            sequence: AtomicU64::new(0),
            ingest: IngestSettings {
                sample_rate: self.config.transcription.sample_rate,
                block_duration: self.config.block_duration,
                pace_finite_sources: self.config.pace_finite_sources,
            },
            source_finished: Arc::new(AtomicBool::new(false)),
            error_reporter: self.error_reporter,
            controller: Some(controller),
            threads: vec![transcription],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::playback::CollectorOutput;
    use crate::audio::recorder::MockAudioSource;
    use crate::generation::generator::ScriptedGenerator;
    use crate::pipeline::types::SessionState;
    use crate::stt::recognizer::MockRecognizer;
    use crate::synthesis::synthesizer::MockSynthesizer;

    fn start(generator: ScriptedGenerator, output: &CollectorOutput) -> PipelineHandle {
        Pipeline::new(PipelineConfig::default())
            .start(
                Arc::new(MockRecognizer::new("hola")),
                Arc::new(generator),
                Arc::new(MockSynthesizer::new()),
                Box::new(output.clone()),
            )
            .unwrap()
    }

    #[test]
    fn test_config_default() {
        let config = PipelineConfig::default();
        assert_eq!(config.input_buffer, defaults::INPUT_BUFFER);
        assert_eq!(config.event_buffer, defaults::EVENT_BUFFER);
        assert_eq!(config.block_duration, Duration::from_millis(100));
        assert_eq!(config.synthesis.workers, 2);
        assert!(!config.pace_finite_sources);
    }

    #[test]
    fn test_start_rejects_single_worker() {
        let mut config = PipelineConfig::default();
        config.synthesis.workers = 1;
        let result = Pipeline::new(config).start(
            Arc::new(MockRecognizer::new("hola")),
            Arc::new(ScriptedGenerator::new(&["x"])),
            Arc::new(MockSynthesizer::new()),
            Box::new(CollectorOutput::new()),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_pushed_turn_plays_reply_and_winds_down() {
        let output = CollectorOutput::new();
        let mut handle = start(
            ScriptedGenerator::new(&["{\"text\":\"Hola.\"}", "{\"text\":\"Qué tal.\"}"]),
            &output,
        );

        assert!(handle.push_audio(vec![8000; 16000]));
        assert!(handle.end_of_turn());
        handle.close_input();
        assert!(handle.wait(Duration::from_secs(5)));

        assert_eq!(
            output.chunks(),
            vec![b"Hola.".to_vec(), "Qué tal.".as_bytes().to_vec()]
        );
        let events: Vec<PipelineEvent> = handle.events().try_iter().collect();
        assert!(events.contains(&PipelineEvent::Final {
            text: "hola".to_string()
        }));
        assert!(events.contains(&PipelineEvent::SpeakingStopped { turn: 1 }));
        assert!(matches!(
            events.last(),
            Some(PipelineEvent::StateChanged {
                to: SessionState::Idle,
                ..
            })
        ));
        handle.stop();
    }

    #[test]
    fn test_attached_file_source_drives_a_turn() {
        let output = CollectorOutput::new();
        let mut handle = start(ScriptedGenerator::new(&["{\"text\":\"Vale.\"}"]), &output);

        let source = MockAudioSource::new().with_reads(vec![vec![8000; 8000], vec![8000; 8000]]);
        handle.attach_source(Box::new(source)).unwrap();
        handle.close_input();
        assert!(handle.wait(Duration::from_secs(5)));

        assert!(handle.source_finished());
        assert_eq!(output.chunks(), vec![b"Vale.".to_vec()]);
        handle.stop();
    }

    #[test]
    fn test_stop_while_replying() {
        let tokens: Vec<String> = (0..200).map(|i| format!("{{\"text\":\"t{}\"}}", i)).collect();
        let output = CollectorOutput::new();
        let handle = start(
            ScriptedGenerator::new(&tokens).with_token_delay(Duration::from_millis(10)),
            &output,
        );

        handle.push_audio(vec![8000; 16000]);
        handle.end_of_turn();
        thread::sleep(Duration::from_millis(100));

        let started = Instant::now();
        handle.stop();
        assert!(started.elapsed() < SHUTDOWN_GRACE);
        assert!(output.chunks().len() < tokens.len());
    }

    #[test]
    fn test_handle_after_close_rejects_audio() {
        let output = CollectorOutput::new();
        let mut handle = start(ScriptedGenerator::new(&["x"]), &output);
        handle.close_input();

        assert!(!handle.push_audio(vec![0; 10]));
        assert!(handle.attach_source(Box::new(MockAudioSource::new())).is_err());
        handle.stop();
    }
}
