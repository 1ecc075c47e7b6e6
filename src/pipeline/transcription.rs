//! Buffers a turn's audio and produces partial and final transcripts.
//!
//! Blocks are classified as speech or silence by RMS level. Silence before
//! onset only feeds a short pre-roll; silence after the last speech is kept
//! for the inactivity timeout and dropped after that. Only speech moves the
//! inactivity clock.
//!
//! Partials run on a dedicated worker over a bounded tail of the buffer so
//! the session thread never waits on them while audio is arriving. At most
//! one partial is in flight; finalizing waits for it before reading the
//! buffer.

use crate::audio::vad::{EchoGate, VadConfig, VoiceDetector};
use crate::defaults;
use crate::error::{Result, VoxError};
use crate::pipeline::clock::Clock;
use crate::pipeline::error::panic_message;
use crate::pipeline::types::{AudioBlock, TranscriptEvent, TranscriptionInput};
use crate::stt::recognizer::{SpeechRecognizer, clean_transcription};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Longest the session loop sleeps between timer checks.
const MAX_TICK: Duration = Duration::from_millis(50);

/// Timing rules for one transcription session.
#[derive(Debug, Clone)]
pub struct TranscriptionSettings {
    pub sample_rate: u32,
    pub language: String,
    pub partial_interval: Duration,
    /// How much trailing audio a partial looks at.
    pub partial_window: Duration,
    pub inactivity_timeout: Duration,
    /// Inactivity never finalizes less speech than this.
    pub min_finalize_audio: Duration,
    pub vad: VadConfig,
    /// Silence kept ahead of speech onset.
    pub pre_speech: Duration,
}

impl Default for TranscriptionSettings {
    fn default() -> Self {
        Self {
            sample_rate: defaults::SAMPLE_RATE,
            language: defaults::DEFAULT_LANGUAGE.to_string(),
            partial_interval: Duration::from_millis(defaults::PARTIAL_INTERVAL_MS),
            partial_window: Duration::from_millis(defaults::PARTIAL_WINDOW_MS),
            inactivity_timeout: Duration::from_millis(defaults::INACTIVITY_TIMEOUT_MS),
            min_finalize_audio: Duration::from_millis(defaults::MIN_FINALIZE_MS),
            vad: VadConfig::default(),
            pre_speech: Duration::from_millis(defaults::PRE_SPEECH_MS),
        }
    }
}

impl TranscriptionSettings {
    fn samples_for(&self, duration: Duration) -> usize {
        (self.sample_rate as u128 * duration.as_millis() / 1000) as usize
    }
}

/// Audio of the turn being transcribed.
#[derive(Debug, Default)]
struct TranscriptBuffer {
    samples: Vec<i16>,
    speech_samples: usize,
    /// Silence heard before onset; becomes the head of the utterance.
    pre_roll: VecDeque<i16>,
    /// Set on speech onset; `None` until the turn has heard speech.
    last_speech_time: Option<Instant>,
    last_partial_time: Option<Instant>,
    samples_at_last_partial: usize,
}

impl TranscriptBuffer {
    fn push_pre_roll(&mut self, samples: &[i16], limit: usize) {
        self.pre_roll.extend(samples.iter().copied());
        let excess = self.pre_roll.len().saturating_sub(limit);
        self.pre_roll.drain(..excess);
    }

    fn has_new_audio(&self) -> bool {
        self.samples.len() > self.samples_at_last_partial
    }

    fn clear(&mut self) {
        *self = Self::default();
    }
}

struct PartialRequest {
    utterance: u64,
    audio: Vec<i16>,
}

struct PartialReply {
    utterance: u64,
    text: Option<String>,
}

/// Thread that runs partial transcriptions one at a time.
struct PartialWorker {
    request_tx: Option<Sender<PartialRequest>>,
    reply_rx: Receiver<PartialReply>,
    handle: Option<JoinHandle<()>>,
    in_flight: bool,
}

impl PartialWorker {
    fn spawn(recognizer: Arc<dyn SpeechRecognizer>, language: String) -> Result<Self> {
        let (request_tx, request_rx) = unbounded::<PartialRequest>();
        let (reply_tx, reply_rx) = unbounded::<PartialReply>();

        let handle = thread::Builder::new()
            .name("partial-transcriber".to_string())
            .spawn(move || {
                for request in request_rx {
                    let text = match recognizer.transcribe(&request.audio, &language) {
                        Ok(text) => Some(clean_transcription(&text)),
                        Err(e) => {
                            tracing::debug!("partial transcription failed: {}", e);
                            None
                        }
                    };
                    let reply = PartialReply {
                        utterance: request.utterance,
                        text,
                    };
                    if reply_tx.send(reply).is_err() {
                        break;
                    }
                }
            })
            .map_err(|e| VoxError::Recognition {
                message: format!("Failed to spawn partial transcription thread: {}", e),
            })?;

        Ok(Self {
            request_tx: Some(request_tx),
            reply_rx,
            handle: Some(handle),
            in_flight: false,
        })
    }

    fn dispatch(&mut self, request: PartialRequest) {
        let Some(tx) = &self.request_tx else {
            return;
        };
        if tx.send(request).is_ok() {
            self.in_flight = true;
        }
    }

    fn try_reply(&mut self) -> Option<PartialReply> {
        let reply = self.reply_rx.try_recv().ok()?;
        self.in_flight = false;
        Some(reply)
    }

    /// Block until the in-flight partial answers.
    fn wait_reply(&mut self) -> Option<PartialReply> {
        if !self.in_flight {
            return None;
        }
        self.in_flight = false;
        self.reply_rx.recv().ok()
    }

    fn shutdown(&mut self) {
        self.request_tx = None;
        if let Some(handle) = self.handle.take()
            && let Err(payload) = handle.join()
        {
            tracing::error!(
                "partial transcription thread panicked: {}",
                panic_message(payload.as_ref())
            );
        }
    }
}

impl Drop for PartialWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Turns a stream of audio blocks into transcript events.
pub struct TranscriptionSession {
    settings: TranscriptionSettings,
    recognizer: Arc<dyn SpeechRecognizer>,
    clock: Arc<dyn Clock>,
    events: Sender<TranscriptEvent>,
    buffer: TranscriptBuffer,
    /// Counts finals; tags partials so late ones from an old buffer are dropped.
    utterance: u64,
    detector: VoiceDetector,
    worker: PartialWorker,
}

impl TranscriptionSession {
    pub fn new(
        settings: TranscriptionSettings,
        recognizer: Arc<dyn SpeechRecognizer>,
        clock: Arc<dyn Clock>,
        events: Sender<TranscriptEvent>,
    ) -> Result<Self> {
        let worker = PartialWorker::spawn(Arc::clone(&recognizer), settings.language.clone())?;
        let detector = VoiceDetector::new(settings.vad, EchoGate::default());
        Ok(Self {
            settings,
            recognizer,
            clock,
            events,
            buffer: TranscriptBuffer::default(),
            utterance: 0,
            detector,
            worker,
        })
    }

    /// Classify against the echo threshold whenever `gate` is engaged.
    pub fn with_echo_gate(mut self, gate: EchoGate) -> Self {
        self.detector = VoiceDetector::new(self.settings.vad, gate);
        self
    }

    /// Samples currently buffered for the turn.
    pub fn buffered_samples(&self) -> usize {
        self.buffer.samples.len()
    }

    pub fn utterance(&self) -> u64 {
        self.utterance
    }

    pub fn partial_in_flight(&self) -> bool {
        self.worker.in_flight
    }

    pub fn on_audio(&mut self, block: AudioBlock) {
        let now = self.clock.now();
        let class = self.detector.classify(&block.samples);
        tracing::trace!(
            sequence = block.sequence,
            samples = block.samples.len(),
            level = class.level,
            threshold = class.threshold,
            speech = class.is_speech,
            "audio block"
        );

        match self.buffer.last_speech_time {
            None if !class.is_speech => {
                let limit = self.settings.samples_for(self.settings.pre_speech);
                self.buffer.push_pre_roll(&block.samples, limit);
                return;
            }
            None => {
                tracing::debug!(utterance = self.utterance, level = class.level, "speech onset");
                self.buffer.samples.extend(self.buffer.pre_roll.drain(..));
                self.buffer.last_partial_time = Some(now);
                self.emit(TranscriptEvent::SpeechActivity {
                    utterance: self.utterance,
                });
            }
            Some(last)
                if !class.is_speech
                    && now.saturating_duration_since(last) > self.settings.inactivity_timeout =>
            {
                return;
            }
            Some(_) => {}
        }

        self.buffer.samples.extend_from_slice(&block.samples);
        if class.is_speech {
            self.buffer.speech_samples += block.samples.len();
            self.buffer.last_speech_time = Some(now);
        }
    }

    /// Explicit end of turn: finalize whatever is buffered.
    pub fn on_end(&mut self) {
        self.finalize();
    }

    /// Explicit start of turn: drop anything buffered without a final.
    pub fn on_start(&mut self) {
        self.settle_partial(false);
        if !self.buffer.samples.is_empty() {
            tracing::debug!(samples = self.buffer.samples.len(), "discarding buffered audio");
        }
        self.buffer.clear();
    }

    /// Timer: collect a finished partial, start the next one, and apply
    /// the inactivity rule.
    pub fn on_tick(&mut self) {
        while let Some(reply) = self.worker.try_reply() {
            self.handle_partial(reply);
        }

        let now = self.clock.now();
        if let Some(last_speech) = self.buffer.last_speech_time
            && now.saturating_duration_since(last_speech) > self.settings.inactivity_timeout
        {
            let required = self.settings.samples_for(self.settings.min_finalize_audio);
            if self.buffer.speech_samples >= required {
                tracing::debug!("inactivity timeout, finalizing");
                self.finalize();
                return;
            }
        }

        let due = self
            .buffer
            .last_partial_time
            .is_none_or(|last| now.saturating_duration_since(last) >= self.settings.partial_interval);
        if due && !self.worker.in_flight && self.buffer.has_new_audio() {
            let window = self.settings.samples_for(self.settings.partial_window);
            let start = self.buffer.samples.len().saturating_sub(window);
            let audio = self.buffer.samples[start..].to_vec();
            self.buffer.last_partial_time = Some(now);
            self.buffer.samples_at_last_partial = self.buffer.samples.len();
            self.worker.dispatch(PartialRequest {
                utterance: self.utterance,
                audio,
            });
        }
    }

    /// Block until the in-flight partial (if any) is done and emit it.
    pub fn wait_partial(&mut self) {
        self.settle_partial(true);
    }

    fn settle_partial(&mut self, emit: bool) {
        if let Some(reply) = self.worker.wait_reply()
            && emit
        {
            self.handle_partial(reply);
        }
    }

    fn handle_partial(&mut self, reply: PartialReply) {
        if reply.utterance != self.utterance {
            return;
        }
        match reply.text {
            Some(text) if !text.is_empty() => {
                self.emit(TranscriptEvent::Partial {
                    utterance: self.utterance,
                    text,
                });
            }
            _ => {}
        }
    }

    fn finalize(&mut self) {
        self.settle_partial(true);

        let text = if self.buffer.samples.is_empty() {
            String::new()
        } else {
            match self
                .recognizer
                .transcribe(&self.buffer.samples, &self.settings.language)
            {
                Ok(text) => clean_transcription(&text),
                Err(e) => {
                    tracing::warn!("final transcription failed: {}", e);
                    String::new()
                }
            }
        };

        tracing::info!(
            utterance = self.utterance,
            samples = self.buffer.samples.len(),
            chars = text.len(),
            "final transcript"
        );
        self.emit(TranscriptEvent::Final {
            utterance: self.utterance,
            text,
        });
        self.utterance += 1;
        self.buffer.clear();
    }

    fn emit(&self, event: TranscriptEvent) {
        if self.events.send(event).is_err() {
            tracing::debug!("transcript consumer is gone");
        }
    }

    /// Drive the session from `input` until it closes or `running` clears.
    pub fn run(mut self, input: Receiver<TranscriptionInput>, running: Arc<AtomicBool>) {
        let tick = self.settings.partial_interval.clamp(Duration::from_millis(1), MAX_TICK);
        while running.load(Ordering::SeqCst) {
            match input.recv_timeout(tick) {
                Ok(TranscriptionInput::Audio(block)) => self.on_audio(block),
                Ok(TranscriptionInput::StartOfTurn) => self.on_start(),
                Ok(TranscriptionInput::EndOfTurn) => self.on_end(),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    if !self.buffer.samples.is_empty() {
                        self.finalize();
                    }
                    break;
                }
            }
            self.on_tick();
        }
        self.worker.shutdown();
        tracing::debug!("transcription session stopped");
    }
}
