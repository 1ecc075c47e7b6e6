//! Runs one streaming generation at a time and turns it into fragments.

use crate::defaults;
use crate::error::{Result, VoxError};
use crate::generation::generator::{GenerationRequest, HistoryEntry, TextGenerator};
use crate::generation::scanner::{FragmentFormat, FragmentScanner, FragmentUnit};
use crate::pipeline::cancellation::GenerationControl;
use crate::pipeline::error::panic_message;
use crate::pipeline::types::{Fragment, TurnId};
use crossbeam_channel::Sender;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

/// Receives the fragments of a generation in order.
pub trait FragmentSink: Send + 'static {
    /// Returns false once the receiver is gone; generation then stops.
    fn accept(&mut self, fragment: Fragment) -> bool;
}

impl FragmentSink for Sender<Fragment> {
    fn accept(&mut self, fragment: Fragment) -> bool {
        self.send(fragment).is_ok()
    }
}

/// Cooperative stop signal for one generation.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// How a generation ended. `fragments` counts speech fragments emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationOutcome {
    Completed { fragments: u64 },
    /// The engine failed; the sentinel was still emitted.
    Failed { fragments: u64 },
    /// Stopped early; no sentinel.
    Cancelled { fragments: u64 },
    /// The sink went away.
    Disconnected,
}

/// Stream one generation into `sink`.
///
/// The cancel flag is checked once per received token. A cancelled run
/// drops the stream and emits nothing further. Any other ending emits the
/// end-of-turn sentinel after the last fragment.
pub fn run_generation(
    generator: &dyn TextGenerator,
    request: &GenerationRequest,
    turn: TurnId,
    format: FragmentFormat,
    cancel: &CancelFlag,
    sink: &mut dyn FragmentSink,
) -> GenerationOutcome {
    let mut emitted: u64 = 0;

    let stream = match generator.stream_generate(request) {
        Ok(stream) => stream,
        Err(e) => {
            tracing::warn!(turn, generator = generator.name(), "generation failed to start: {}", e);
            return close_turn(turn, emitted, cancel, sink, true);
        }
    };

    let mut scanner = FragmentScanner::new(format);
    let mut failed = false;
    for item in stream {
        if cancel.is_cancelled() {
            tracing::debug!(turn, fragments = emitted, "generation cancelled");
            return GenerationOutcome::Cancelled { fragments: emitted };
        }
        match item {
            Ok(token) => {
                if !emit_units(scanner.push(&token), turn, &mut emitted, sink) {
                    return GenerationOutcome::Disconnected;
                }
            }
            Err(e) => {
                tracing::warn!(turn, fragments = emitted, "generation stream broke off: {}", e);
                failed = true;
                break;
            }
        }
    }

    if !failed && !emit_units(scanner.finish(), turn, &mut emitted, sink) {
        return GenerationOutcome::Disconnected;
    }
    close_turn(turn, emitted, cancel, sink, failed)
}

fn emit_units(
    units: Vec<FragmentUnit>,
    turn: TurnId,
    emitted: &mut u64,
    sink: &mut dyn FragmentSink,
) -> bool {
    for unit in units {
        *emitted += 1;
        tracing::debug!(turn, seq = *emitted, tag = %unit.tag, "fragment");
        let fragment = Fragment::speech(turn, *emitted, unit.text, unit.tag, unit.mode);
        if !sink.accept(fragment) {
            return false;
        }
    }
    true
}

fn close_turn(
    turn: TurnId,
    emitted: u64,
    cancel: &CancelFlag,
    sink: &mut dyn FragmentSink,
    failed: bool,
) -> GenerationOutcome {
    if cancel.is_cancelled() {
        return GenerationOutcome::Cancelled { fragments: emitted };
    }
    if !sink.accept(Fragment::end_of_turn(turn, emitted + 1)) {
        return GenerationOutcome::Disconnected;
    }
    if failed {
        GenerationOutcome::Failed { fragments: emitted }
    } else {
        GenerationOutcome::Completed { fragments: emitted }
    }
}

/// Settings applied to every generation.
#[derive(Debug, Clone)]
pub struct GenerationSettings {
    pub system_prompt: Option<String>,
    pub format: FragmentFormat,
    /// History lines sent with each request; 0 disables history.
    pub history_limit: usize,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            system_prompt: None,
            format: FragmentFormat::default(),
            history_limit: defaults::HISTORY_ENTRIES,
        }
    }
}

/// The most recent lines of completed exchanges, oldest first.
#[derive(Debug, Default)]
pub struct ConversationHistory {
    entries: VecDeque<HistoryEntry>,
    limit: usize,
}

impl ConversationHistory {
    pub fn new(limit: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(limit),
            limit,
        }
    }

    /// Append one finished exchange, dropping the oldest lines past the limit.
    pub fn record(&mut self, user: &str, assistant: &str) {
        if self.limit == 0 {
            return;
        }
        for entry in [HistoryEntry::user(user), HistoryEntry::assistant(assistant)] {
            if !entry.text.trim().is_empty() {
                self.entries.push_back(entry);
            }
        }
        while self.entries.len() > self.limit {
            self.entries.pop_front();
        }
    }

    pub fn entries(&self) -> Vec<HistoryEntry> {
        self.entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Forwards fragments and keeps the spoken text of the reply.
struct ReplyRecorder<S> {
    inner: S,
    spoken: Vec<String>,
}

impl<S: FragmentSink> FragmentSink for ReplyRecorder<S> {
    fn accept(&mut self, fragment: Fragment) -> bool {
        if !fragment.is_end_of_turn() {
            self.spoken.push(fragment.text.clone());
        }
        self.inner.accept(fragment)
    }
}

struct ActiveGeneration {
    turn: TurnId,
    cancel: CancelFlag,
    handle: JoinHandle<GenerationOutcome>,
}

/// Owns the single active generation.
///
/// Starting a new generation cancels the current one and waits for its
/// thread to exit first, so two streams are never open at once.
pub struct GenerationCoordinator {
    generator: Arc<dyn TextGenerator>,
    settings: GenerationSettings,
    active: Option<ActiveGeneration>,
    /// Written by the generation thread once a reply completes.
    history: Arc<Mutex<ConversationHistory>>,
}

impl GenerationCoordinator {
    pub fn new(generator: Arc<dyn TextGenerator>, settings: GenerationSettings) -> Self {
        let history = ConversationHistory::new(settings.history_limit);
        Self {
            generator,
            settings,
            active: None,
            history: Arc::new(Mutex::new(history)),
        }
    }

    /// Lines that the next request will carry as context.
    pub fn history(&self) -> Vec<HistoryEntry> {
        self.history
            .lock()
            .map(|history| history.entries())
            .unwrap_or_default()
    }

    /// Start generating a reply to `prompt` for `turn`.
    pub fn generate<S: FragmentSink>(&mut self, prompt: &str, turn: TurnId, sink: S) -> Result<()> {
        if let Some(outcome) = self.cancel_and_wait() {
            tracing::debug!(?outcome, "previous generation stopped");
        }

        let generator = Arc::clone(&self.generator);
        let request = GenerationRequest::new(prompt)
            .with_system(self.settings.system_prompt.clone())
            .with_history(self.history());
        let format = self.settings.format;
        let cancel = CancelFlag::new();
        let thread_cancel = cancel.clone();
        let history = Arc::clone(&self.history);

        tracing::info!(
            turn,
            generator = generator.name(),
            context = request.history.len(),
            "generation started"
        );
        let handle = thread::Builder::new()
            .name(format!("generation-{}", turn))
            .spawn(move || {
                let mut sink = ReplyRecorder {
                    inner: sink,
                    spoken: Vec::new(),
                };
                let outcome = run_generation(
                    generator.as_ref(),
                    &request,
                    turn,
                    format,
                    &thread_cancel,
                    &mut sink,
                );
                tracing::info!(turn, ?outcome, "generation finished");
                // Cancelled, failed and orphaned replies never become context.
                if let GenerationOutcome::Completed { .. } = outcome
                    && let Ok(mut history) = history.lock()
                {
                    history.record(&request.prompt, &sink.spoken.join(" "));
                }
                outcome
            })
            .map_err(|e| VoxError::Generation {
                message: format!("Failed to spawn generation thread: {}", e),
            })?;

        self.active = Some(ActiveGeneration {
            turn,
            cancel,
            handle,
        });
        Ok(())
    }

    /// Ask the active generation to stop at its next token.
    pub fn cancel(&self) {
        if let Some(active) = &self.active {
            active.cancel.cancel();
        }
    }

    /// Cancel and join the active generation.
    pub fn cancel_and_wait(&mut self) -> Option<GenerationOutcome> {
        self.cancel();
        self.wait()
    }

    /// Join the active generation without cancelling it.
    pub fn wait(&mut self) -> Option<GenerationOutcome> {
        let active = self.active.take()?;
        match active.handle.join() {
            Ok(outcome) => Some(outcome),
            Err(payload) => {
                tracing::error!(
                    turn = active.turn,
                    "generation thread panicked: {}",
                    panic_message(payload.as_ref())
                );
                None
            }
        }
    }

    /// True while a generation thread is still running.
    pub fn is_active(&self) -> bool {
        self.active
            .as_ref()
            .is_some_and(|active| !active.handle.is_finished())
    }

    pub fn active_turn(&self) -> Option<TurnId> {
        self.active.as_ref().map(|active| active.turn)
    }
}

impl GenerationControl for GenerationCoordinator {
    fn cancel(&self) {
        GenerationCoordinator::cancel(self);
    }
}

impl Drop for GenerationCoordinator {
    fn drop(&mut self) {
        if let Some(outcome) = self.cancel_and_wait() {
            tracing::debug!(?outcome, "generation stopped on drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::generator::ScriptedGenerator;
    use crate::pipeline::types::FragmentMode;
    use crossbeam_channel::{Receiver, unbounded};
    use std::time::Duration;

    const TWO_UNITS: [&str; 4] = [
        "{\"text\": \"Hola.\",",
        " \"tag\": \"happy\"}",
        "{\"text\": \"¿Qué tal?\"",
        ", \"mode\": \"loop\"}",
    ];

    fn run(generator: &ScriptedGenerator, cancel: &CancelFlag) -> (GenerationOutcome, Vec<Fragment>) {
        let (mut tx, rx) = unbounded();
        let outcome = run_generation(
            generator,
            &GenerationRequest::new("hi"),
            7,
            FragmentFormat::Json,
            cancel,
            &mut tx,
        );
        (outcome, rx.try_iter().collect())
    }

    fn drain(rx: &Receiver<Fragment>) -> Vec<Fragment> {
        rx.try_iter().collect()
    }

    #[test]
    fn test_completed_generation_ends_with_sentinel() {
        let generator = ScriptedGenerator::new(&TWO_UNITS);
        let (outcome, fragments) = run(&generator, &CancelFlag::new());

        assert_eq!(outcome, GenerationOutcome::Completed { fragments: 2 });
        assert_eq!(fragments.len(), 3);
        assert_eq!(
            fragments[0],
            Fragment::speech(7, 1, "Hola.".into(), "happy".into(), FragmentMode::Once)
        );
        assert_eq!(fragments[1].seq, 2);
        assert_eq!(fragments[1].mode, FragmentMode::Loop);
        assert_eq!(fragments[2], Fragment::end_of_turn(7, 3));
    }

    #[test]
    fn test_open_failure_emits_sentinel_only() {
        let generator = ScriptedGenerator::new(&TWO_UNITS).with_open_failure();
        let (outcome, fragments) = run(&generator, &CancelFlag::new());

        assert_eq!(outcome, GenerationOutcome::Failed { fragments: 0 });
        assert_eq!(fragments, vec![Fragment::end_of_turn(7, 1)]);
    }

    #[test]
    fn test_midstream_failure_keeps_emitted_fragments() {
        let generator = ScriptedGenerator::new(&TWO_UNITS).with_failure_after(3);
        let (outcome, fragments) = run(&generator, &CancelFlag::new());

        assert_eq!(outcome, GenerationOutcome::Failed { fragments: 1 });
        assert_eq!(fragments.len(), 2);
        assert_eq!(fragments[1], Fragment::end_of_turn(7, 2));
    }

    #[test]
    fn test_cancelled_before_start_emits_nothing() {
        let generator = ScriptedGenerator::new(&TWO_UNITS);
        let cancel = CancelFlag::new();
        cancel.cancel();
        let (outcome, fragments) = run(&generator, &cancel);

        assert_eq!(outcome, GenerationOutcome::Cancelled { fragments: 0 });
        assert!(fragments.is_empty());
        assert_eq!(generator.stats().closed(), 1);
        assert_eq!(generator.stats().tokens(), 1);
    }

    #[test]
    fn test_sentence_format() {
        let generator = ScriptedGenerator::new(&["Hola. ", "Adiós"]);
        let (mut tx, rx) = unbounded();
        let outcome = run_generation(
            &generator,
            &GenerationRequest::new("hi"),
            1,
            FragmentFormat::Sentences,
            &CancelFlag::new(),
            &mut tx,
        );

        assert_eq!(outcome, GenerationOutcome::Completed { fragments: 2 });
        let texts: Vec<String> = drain(&rx).into_iter().map(|f| f.text).collect();
        assert_eq!(texts, vec!["Hola.", "Adiós", ""]);
    }

    #[test]
    fn test_disconnected_sink_stops_generation() {
        let generator = ScriptedGenerator::new(&TWO_UNITS);
        let (mut tx, rx) = unbounded::<Fragment>();
        drop(rx);
        let outcome = run_generation(
            &generator,
            &GenerationRequest::new("hi"),
            1,
            FragmentFormat::Json,
            &CancelFlag::new(),
            &mut tx,
        );
        assert_eq!(outcome, GenerationOutcome::Disconnected);
    }

    #[test]
    fn test_coordinator_cancel_stops_within_one_token() {
        let tokens: Vec<String> = (0..200).map(|i| format!("{{\"text\": \"t{}\"}}", i)).collect();
        let generator = ScriptedGenerator::new(&tokens).with_token_delay(Duration::from_millis(5));
        let stats = generator.stats();
        let mut coordinator =
            GenerationCoordinator::new(Arc::new(generator), GenerationSettings::default());
        let (tx, rx) = unbounded();

        coordinator.generate("hi", 1, tx).unwrap();
        thread::sleep(Duration::from_millis(50));
        let outcome = coordinator.cancel_and_wait();

        assert!(matches!(outcome, Some(GenerationOutcome::Cancelled { .. })));
        let fragments = drain(&rx);
        assert!(fragments.iter().all(|f| !f.is_end_of_turn()));
        assert!(stats.tokens() < 200);
        assert_eq!(stats.tokens(), fragments.len() + 1);
        assert_eq!(stats.closed(), 1);
        assert!(!coordinator.is_active());
    }

    #[test]
    fn test_coordinator_new_generation_replaces_active_one() {
        let tokens: Vec<String> = (0..100).map(|i| format!("{{\"text\": \"t{}\"}}", i)).collect();
        let generator = ScriptedGenerator::new(&tokens).with_token_delay(Duration::from_millis(2));
        let stats = generator.stats();
        let mut coordinator =
            GenerationCoordinator::new(Arc::new(generator), GenerationSettings::default());
        let (tx, rx) = unbounded();

        coordinator.generate("first", 1, tx.clone()).unwrap();
        thread::sleep(Duration::from_millis(20));
        coordinator.generate("second", 2, tx).unwrap();
        assert_eq!(coordinator.active_turn(), Some(2));
        let outcome = coordinator.wait();

        assert_eq!(outcome, Some(GenerationOutcome::Completed { fragments: 100 }));
        assert_eq!(stats.max_open(), 1);
        let fragments = drain(&rx);
        assert!(
            fragments
                .iter()
                .filter(|f| f.turn == 1)
                .all(|f| !f.is_end_of_turn())
        );
        assert_eq!(fragments.last(), Some(&Fragment::end_of_turn(2, 101)));
    }

    #[test]
    fn test_history_keeps_latest_lines() {
        let mut history = ConversationHistory::new(4);
        history.record("uno", "one");
        history.record("dos", "");
        history.record("tres", "three");

        let texts: Vec<String> = history.entries().into_iter().map(|e| e.text).collect();
        assert_eq!(texts, vec!["one", "dos", "tres", "three"]);
    }

    #[test]
    fn test_history_disabled_with_zero_limit() {
        let mut history = ConversationHistory::new(0);
        history.record("uno", "one");
        assert!(history.is_empty());
    }

    #[test]
    fn test_completed_reply_becomes_context_for_next_request() {
        let generator = ScriptedGenerator::new(&TWO_UNITS);
        let recorded = generator.clone();
        let mut coordinator =
            GenerationCoordinator::new(Arc::new(generator), GenerationSettings::default());
        let (tx, _rx) = unbounded();

        coordinator.generate("hola", 1, tx.clone()).unwrap();
        coordinator.wait();
        coordinator.generate("y tú?", 2, tx).unwrap();
        coordinator.wait();

        let requests = recorded.requests();
        assert!(requests[0].history.is_empty());
        assert_eq!(
            requests[1].history,
            vec![
                HistoryEntry::user("hola"),
                HistoryEntry::assistant("Hola. ¿Qué tal?")
            ]
        );
        assert_eq!(coordinator.history().len(), 4);
    }

    #[test]
    fn test_cancelled_reply_is_not_remembered() {
        let tokens: Vec<String> = (0..100).map(|i| format!("{{\"text\": \"t{}\"}}", i)).collect();
        let generator = ScriptedGenerator::new(&tokens).with_token_delay(Duration::from_millis(5));
        let recorded = generator.clone();
        let mut coordinator =
            GenerationCoordinator::new(Arc::new(generator), GenerationSettings::default());
        let (tx, _rx) = unbounded();

        coordinator.generate("primero", 1, tx.clone()).unwrap();
        thread::sleep(Duration::from_millis(30));
        coordinator.generate("segundo", 2, tx).unwrap();
        coordinator.cancel_and_wait();

        assert!(coordinator.history().is_empty());
        assert!(recorded.requests()[1].history.is_empty());
    }

    #[test]
    fn test_coordinator_control_trait_cancels() {
        let generator = ScriptedGenerator::from_text("{\"text\":\"slow\"}")
            .with_token_delay(Duration::from_millis(10));
        let mut coordinator =
            GenerationCoordinator::new(Arc::new(generator), GenerationSettings::default());
        let (tx, _rx) = unbounded();
        coordinator.generate("hi", 3, tx).unwrap();

        let control: &dyn GenerationControl = &coordinator;
        control.cancel();

        assert!(matches!(
            coordinator.wait(),
            Some(GenerationOutcome::Cancelled { fragments: 0 })
        ));
    }
}
