//! Ordered playback of concurrently synthesized fragments.
//!
//! Workers finish in any order. A single reassembler thread owns the output
//! device and the [`PlaybackWindow`], and releases slots strictly by
//! sequence number.

use crate::audio::playback::{AbortSignal, AudioOutput};
use crate::error::{Result, VoxError};
use crate::pipeline::cancellation::PlaybackControl;
use crate::pipeline::error::{ErrorReporter, panic_message};
use crate::pipeline::events::EventPublisher;
use crate::pipeline::station::StationRunner;
use crate::pipeline::types::{Fragment, PipelineEvent, PlaybackNotice, SynthesisResult, TurnId};
use crate::synthesis::synthesizer::{SpeechSynthesizer, VoiceTable};
use crate::synthesis::worker::{SynthesisWorker, TurnGate, spawn_workers};
use crossbeam_channel::{Receiver, Sender, bounded, never, select};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Results waiting for their turn to play, keyed by sequence number.
#[derive(Debug)]
pub struct PlaybackWindow {
    slots: BTreeMap<u64, SynthesisResult>,
    next_expected: u64,
}

impl Default for PlaybackWindow {
    fn default() -> Self {
        Self::new()
    }
}

impl PlaybackWindow {
    pub fn new() -> Self {
        Self {
            slots: BTreeMap::new(),
            next_expected: 1,
        }
    }

    /// Store a result. Returns false for duplicates and already-played slots.
    pub fn insert(&mut self, result: SynthesisResult) -> bool {
        if result.seq < self.next_expected || self.slots.contains_key(&result.seq) {
            return false;
        }
        self.slots.insert(result.seq, result);
        true
    }

    /// Take the next slot if it has arrived.
    pub fn pop_next(&mut self) -> Option<SynthesisResult> {
        let slot = self.slots.remove(&self.next_expected)?;
        self.next_expected += 1;
        Some(slot)
    }

    pub fn next_expected(&self) -> u64 {
        self.next_expected
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn reset(&mut self) {
        self.slots.clear();
        self.next_expected = 1;
    }
}

#[derive(Debug)]
enum Control {
    Flush { ack: Sender<()> },
    Shutdown,
}

enum Input {
    Result(Option<SynthesisResult>),
    Control(Option<Control>),
}

/// Playback state owned by the reassembler thread.
struct Reassembler {
    output: Box<dyn AudioOutput>,
    /// Raised by `SynthesisReassembler::flush`; lowered here after `abort`.
    abort: Option<AbortSignal>,
    window: PlaybackWindow,
    gate: TurnGate,
    events: EventPublisher,
    notices: Sender<PlaybackNotice>,
    turn: Option<TurnId>,
    speaking: bool,
    /// Writes fail for the rest of this turn.
    muted: bool,
    /// Reopen the device before the next turn plays.
    device_failed: bool,
}

impl Reassembler {
    fn new(
        output: Box<dyn AudioOutput>,
        gate: TurnGate,
        events: EventPublisher,
        notices: Sender<PlaybackNotice>,
    ) -> Self {
        Self {
            abort: output.abort_signal(),
            output,
            window: PlaybackWindow::new(),
            gate,
            events,
            notices,
            turn: None,
            speaking: false,
            muted: false,
            device_failed: false,
        }
    }

    fn run(mut self, results: Receiver<SynthesisResult>, control: Receiver<Control>) {
        let mut results = results;
        loop {
            let input = select! {
                recv(results) -> msg => Input::Result(msg.ok()),
                recv(control) -> msg => Input::Control(msg.ok()),
            };
            match input {
                Input::Result(Some(result)) => self.on_result(result),
                // Workers are gone; keep serving control messages.
                Input::Result(None) => results = never(),
                Input::Control(Some(Control::Flush { ack })) => {
                    self.flush();
                    if ack.send(()).is_err() {
                        tracing::debug!("flush acknowledged after caller left");
                    }
                }
                Input::Control(Some(Control::Shutdown)) | Input::Control(None) => break,
            }
        }

        if self.speaking {
            self.flush();
        }
        tracing::debug!(output = self.output.name(), "reassembler stopped");
    }

    fn on_result(&mut self, result: SynthesisResult) {
        if self.gate.is_stale(result.turn) {
            tracing::debug!(turn = result.turn, seq = result.seq, "dropping stale result");
            return;
        }
        match self.turn {
            Some(current) if result.turn < current => {
                tracing::debug!(turn = result.turn, seq = result.seq, "dropping result of an older turn");
                return;
            }
            Some(current) if result.turn == current => {}
            _ => self.begin_turn(result.turn),
        }

        if !self.window.insert(result) {
            tracing::debug!("dropping duplicate result");
            return;
        }
        self.drain();
    }

    fn begin_turn(&mut self, turn: TurnId) {
        if self.speaking {
            self.flush();
        }
        self.window.reset();
        self.turn = Some(turn);
        self.muted = false;

        if self.device_failed {
            match self.output.reopen() {
                Ok(()) => {
                    tracing::info!(output = self.output.name(), "audio output reopened");
                    self.device_failed = false;
                }
                Err(e) => {
                    self.report_device_error(&e);
                    self.muted = true;
                }
            }
        }
    }

    fn drain(&mut self) {
        while let Some(slot) = self.window.pop_next() {
            if slot.end_of_turn {
                self.finish_turn(slot.turn);
                return;
            }

            if !self.speaking {
                self.speaking = true;
                tracing::info!(turn = slot.turn, "speaking started");
                self.events
                    .publish(PipelineEvent::SpeakingStarted { turn: slot.turn });
                self.notify(PlaybackNotice::Started { turn: slot.turn });
            }

            let Some(audio) = slot.audio else {
                tracing::debug!(turn = slot.turn, seq = slot.seq, "silent slot");
                continue;
            };
            if self.muted {
                continue;
            }
            // A flush is on its way; leave the rest of the window to it.
            if self.gate.is_stale(slot.turn) {
                return;
            }
            match self.output.write(&audio) {
                Ok(()) if self.gate.is_stale(slot.turn) => {
                    tracing::debug!(turn = slot.turn, seq = slot.seq, "chunk cut off by flush");
                    return;
                }
                Ok(()) => self.events.publish(PipelineEvent::AudioChunk {
                    turn: slot.turn,
                    seq: slot.seq,
                    audio,
                }),
                Err(e) => {
                    self.report_device_error(&e);
                    self.muted = true;
                    self.device_failed = true;
                }
            }
        }
    }

    fn finish_turn(&mut self, turn: TurnId) {
        if !self.muted
            && let Err(e) = self.output.finish()
        {
            self.report_device_error(&e);
            self.device_failed = true;
        }
        if self.speaking {
            tracing::info!(turn, "speaking finished");
            self.events.publish(PipelineEvent::SpeakingStopped { turn });
        }
        self.notify(PlaybackNotice::Drained { turn });
        self.gate.raise(turn + 1);
        self.window.reset();
        self.turn = None;
        self.speaking = false;
        self.muted = false;
    }

    fn flush(&mut self) {
        if let Err(e) = self.output.abort() {
            self.report_device_error(&e);
            self.device_failed = true;
        }
        if let Some(signal) = &self.abort {
            signal.clear();
        }
        if self.speaking
            && let Some(turn) = self.turn
        {
            tracing::info!(turn, "speaking interrupted");
            self.events.publish(PipelineEvent::SpeakingStopped { turn });
        }
        self.window.reset();
        self.turn = None;
        self.speaking = false;
        self.muted = false;
    }

    fn report_device_error(&self, error: &VoxError) {
        tracing::warn!(output = self.output.name(), "audio output failed: {}", error);
        self.events.publish(PipelineEvent::DeviceError {
            message: error.to_string(),
        });
    }

    fn notify(&self, notice: PlaybackNotice) {
        if self.notices.send(notice).is_err() {
            tracing::debug!(?notice, "no one is listening for playback notices");
        }
    }
}

/// Worker pool and queue sizes.
#[derive(Debug, Clone)]
pub struct SynthesisSettings {
    /// At least two.
    pub workers: usize,
    pub queue_capacity: usize,
    pub voices: VoiceTable,
}

impl Default for SynthesisSettings {
    fn default() -> Self {
        Self {
            workers: crate::defaults::SYNTHESIS_WORKERS,
            queue_capacity: crate::defaults::WORK_QUEUE_BUFFER,
            voices: VoiceTable::default(),
        }
    }
}

/// Handle to the synthesis workers and the reassembler thread.
pub struct SynthesisReassembler {
    /// Taken on shutdown so idle workers see the queue close.
    jobs_tx: Option<Sender<Fragment>>,
    /// Kept to empty the queue on flush.
    jobs_rx: Receiver<Fragment>,
    control_tx: Sender<Control>,
    gate: TurnGate,
    /// Lets `flush` stop a blocking output without waiting for its thread.
    abort: Option<AbortSignal>,
    workers: Vec<StationRunner<SynthesisWorker>>,
    thread: Option<JoinHandle<()>>,
}

impl SynthesisReassembler {
    /// Start the workers and the reassembler.
    ///
    /// Playback progress goes to `notices`; it should be unbounded or
    /// drained promptly, since the reassembler blocks on it.
    pub fn start(
        synthesizer: Arc<dyn SpeechSynthesizer>,
        output: Box<dyn AudioOutput>,
        settings: SynthesisSettings,
        events: EventPublisher,
        notices: Sender<PlaybackNotice>,
        error_reporter: Arc<dyn ErrorReporter>,
    ) -> Result<Self> {
        if settings.workers < 2 {
            return Err(VoxError::ConfigInvalidValue {
                key: "synthesis.workers".to_string(),
                message: format!("need at least 2 workers, got {}", settings.workers),
            });
        }

        let gate = TurnGate::new();
        let (jobs_tx, jobs_rx) = bounded::<Fragment>(settings.queue_capacity);
        let (results_tx, results_rx) = bounded::<SynthesisResult>(settings.queue_capacity);
        let (control_tx, control_rx) = bounded::<Control>(4);

        tracing::info!(
            workers = settings.workers,
            synthesizer = synthesizer.name(),
            output = output.name(),
            "starting synthesis"
        );
        let workers = spawn_workers(
            settings.workers,
            &jobs_rx,
            &results_tx,
            &synthesizer,
            &Arc::new(settings.voices),
            &gate,
            &error_reporter,
        )?;
        drop(results_tx);

        let abort = output.abort_signal();
        let reassembler = Reassembler::new(output, gate.clone(), events, notices);
        let thread = thread::Builder::new()
            .name("reassembler".to_string())
            .spawn(move || reassembler.run(results_rx, control_rx))
            .map_err(|e| VoxError::Other(format!("Failed to spawn reassembler thread: {}", e)))?;

        Ok(Self {
            jobs_tx: Some(jobs_tx),
            jobs_rx,
            control_tx,
            gate,
            abort,
            workers,
            thread: Some(thread),
        })
    }

    /// Queue a fragment for synthesis. Blocks while the queue is full.
    pub fn submit(&self, fragment: Fragment) -> bool {
        self.jobs_tx
            .as_ref()
            .is_some_and(|tx| tx.send(fragment).is_ok())
    }

    /// A sender for handing fragments over from another thread.
    pub fn submitter(&self) -> Option<Sender<Fragment>> {
        self.jobs_tx.clone()
    }

    pub fn gate(&self) -> &TurnGate {
        &self.gate
    }

    /// Discard everything older than `next_turn` and stop playback now.
    ///
    /// The output is silenced from this thread first, so a chunk that is
    /// still playing does not hold the flush up. Returns once the
    /// reassembler has aborted the output.
    pub fn flush(&self, next_turn: TurnId) {
        self.gate.raise(next_turn);
        if let Some(signal) = &self.abort {
            signal.raise();
        }
        let dropped = self.jobs_rx.try_iter().count();
        tracing::debug!(next_turn, dropped, "flushing synthesis");

        let (ack_tx, ack_rx) = bounded(1);
        if self.control_tx.send(Control::Flush { ack: ack_tx }).is_err() {
            tracing::warn!("reassembler is gone, flush skipped");
            return;
        }
        if ack_rx.recv().is_err() {
            tracing::warn!("reassembler stopped before acknowledging flush");
        }
    }

    /// Stop playback, then the reassembler and the workers.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        self.gate.raise(TurnId::MAX);
        if let Some(signal) = &self.abort {
            signal.raise();
        }
        for _ in self.jobs_rx.try_iter() {}
        if self.control_tx.send(Control::Shutdown).is_err() {
            tracing::debug!("reassembler already stopped");
        }
        if let Err(payload) = thread.join() {
            tracing::error!("reassembler thread panicked: {}", panic_message(payload.as_ref()));
        }

        // Workers exit once every job sender is gone; senders handed out
        // through `submitter` may outlive us, so wait only briefly.
        self.jobs_tx = None;
        let deadline = Instant::now() + Duration::from_secs(1);
        let mut workers = std::mem::take(&mut self.workers);
        while !workers.is_empty() && Instant::now() < deadline {
            let (finished, running): (Vec<_>, Vec<_>) =
                workers.into_iter().partition(|worker| worker.is_finished());
            for worker in finished {
                if let Err(e) = worker.join() {
                    tracing::error!("{}", e);
                }
            }
            workers = running;
            if !workers.is_empty() {
                thread::sleep(Duration::from_millis(10));
            }
        }
        if !workers.is_empty() {
            tracing::warn!(count = workers.len(), "synthesis workers still busy, detaching");
        }
    }
}

impl PlaybackControl for SynthesisReassembler {
    fn flush(&self, next_turn: TurnId) {
        SynthesisReassembler::flush(self, next_turn);
    }
}

impl Drop for SynthesisReassembler {
    fn drop(&mut self) {
        self.stop();
    }
}
