//! Synthesis workers and the stale-turn floor they check.

use crate::error::Result;
use crate::pipeline::error::{ErrorReporter, StationError};
use crate::pipeline::station::{Station, StationRunner};
use crate::pipeline::types::{Fragment, SynthesisResult, TurnId};
use crate::synthesis::synthesizer::{SpeechSynthesizer, VoiceTable};
use crossbeam_channel::{Receiver, Sender};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Lowest turn whose work is still wanted.
///
/// Raised on flush and when a turn finishes draining; anything tagged with
/// an older turn is discarded wherever it is found.
#[derive(Debug, Clone, Default)]
pub struct TurnGate(Arc<AtomicU64>);

impl TurnGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn floor(&self) -> TurnId {
        self.0.load(Ordering::SeqCst)
    }

    pub fn is_stale(&self, turn: TurnId) -> bool {
        turn < self.floor()
    }

    /// Move the floor up to `turn`. Never lowers it.
    pub fn raise(&self, turn: TurnId) {
        self.0.fetch_max(turn, Ordering::SeqCst);
    }
}

/// One synthesis worker. Sentinels pass straight through.
pub struct SynthesisWorker {
    synthesizer: Arc<dyn SpeechSynthesizer>,
    voices: Arc<VoiceTable>,
    gate: TurnGate,
}

impl SynthesisWorker {
    pub fn new(
        synthesizer: Arc<dyn SpeechSynthesizer>,
        voices: Arc<VoiceTable>,
        gate: TurnGate,
    ) -> Self {
        Self {
            synthesizer,
            voices,
            gate,
        }
    }
}

impl Station for SynthesisWorker {
    type Input = Fragment;
    type Output = SynthesisResult;

    fn process(&mut self, fragment: Fragment) -> std::result::Result<Option<SynthesisResult>, StationError> {
        if self.gate.is_stale(fragment.turn) {
            tracing::debug!(turn = fragment.turn, seq = fragment.seq, "skipping stale fragment");
            return Ok(None);
        }
        if fragment.is_end_of_turn() {
            return Ok(Some(SynthesisResult::end_of_turn(fragment.turn, fragment.seq)));
        }

        let voice = self.voices.resolve(&fragment.tag);
        let result = match self.synthesizer.synthesize(&fragment.text, voice) {
            Ok(audio) => SynthesisResult::audio(fragment.turn, fragment.seq, audio),
            Err(e) => {
                tracing::warn!(
                    turn = fragment.turn,
                    seq = fragment.seq,
                    synthesizer = self.synthesizer.name(),
                    "synthesis failed, slot stays silent: {}",
                    e
                );
                SynthesisResult::failed(fragment.turn, fragment.seq)
            }
        };

        // The turn may have been flushed while the engine was busy.
        if self.gate.is_stale(fragment.turn) {
            tracing::debug!(turn = fragment.turn, seq = fragment.seq, "discarding late result");
            return Ok(None);
        }
        Ok(Some(result))
    }

    fn name(&self) -> &'static str {
        "synthesis"
    }
}

/// Start `count` workers pulling from one shared job queue.
pub fn spawn_workers(
    count: usize,
    jobs: &Receiver<Fragment>,
    results: &Sender<SynthesisResult>,
    synthesizer: &Arc<dyn SpeechSynthesizer>,
    voices: &Arc<VoiceTable>,
    gate: &TurnGate,
    error_reporter: &Arc<dyn ErrorReporter>,
) -> Result<Vec<StationRunner<SynthesisWorker>>> {
    (0..count)
        .map(|id| {
            let worker = SynthesisWorker::new(
                Arc::clone(synthesizer),
                Arc::clone(voices),
                gate.clone(),
            );
            StationRunner::spawn(
                worker,
                format!("synthesis-{}", id),
                jobs.clone(),
                results.clone(),
                Arc::clone(error_reporter),
            )
        })
        .collect()
}
