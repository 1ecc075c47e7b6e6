//! Capture loop: polls an audio source and re-chunks it into fixed blocks.

use crate::audio::recorder::AudioSource;
use crate::error::{Result, VoxError};
use crate::pipeline::error::{ErrorReporter, StationError};
use crate::pipeline::types::{AudioBlock, TranscriptionInput};
use crossbeam_channel::{SendTimeoutError, Sender, TrySendError};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(16);
const MAX_CONSECUTIVE_ERRORS: u32 = 10;
const STATION: &str = "ingest";

#[derive(Debug, Clone)]
pub struct IngestSettings {
    pub sample_rate: u32,
    pub block_duration: Duration,
    /// Feed finite sources no faster than real time.
    pub pace_finite_sources: bool,
}

impl IngestSettings {
    fn block_samples(&self) -> usize {
        ((self.sample_rate as u128 * self.block_duration.as_millis() / 1000) as usize).max(1)
    }
}

pub struct AudioIngest {
    source: Box<dyn AudioSource>,
    settings: IngestSettings,
    output: Sender<TranscriptionInput>,
    running: Arc<AtomicBool>,
    finished: Arc<AtomicBool>,
    error_reporter: Arc<dyn ErrorReporter>,
    pending: Vec<i16>,
    sequence: u64,
    dropped: u64,
}

impl AudioIngest {
    /// Start `source` and spawn the capture thread.
    ///
    /// `finished` is set once the thread exits for any reason.
    pub fn start(
        mut source: Box<dyn AudioSource>,
        settings: IngestSettings,
        output: Sender<TranscriptionInput>,
        running: Arc<AtomicBool>,
        finished: Arc<AtomicBool>,
        error_reporter: Arc<dyn ErrorReporter>,
    ) -> Result<JoinHandle<()>> {
        source.start()?;
        let ingest = Self {
            source,
            settings,
            output,
            running,
            finished,
            error_reporter,
            pending: Vec::new(),
            sequence: 0,
            dropped: 0,
        };
        thread::Builder::new()
            .name("audio-ingest".to_string())
            .spawn(move || ingest.run())
            .map_err(|e| VoxError::AudioCapture {
                message: format!("Failed to spawn capture thread: {}", e),
            })
    }

    fn run(mut self) {
        let finite = self.source.is_finite();
        let block_samples = self.settings.block_samples();
        let started = Instant::now();
        let mut consecutive_errors: u32 = 0;

        while self.running.load(Ordering::SeqCst) {
            let samples = match self.source.read_samples() {
                Ok(samples) => {
                    consecutive_errors = 0;
                    samples
                }
                Err(e) => {
                    consecutive_errors += 1;
                    if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                        self.error_reporter.report(
                            STATION,
                            &StationError::Fatal(format!(
                                "audio capture failed {} times in a row: {}",
                                consecutive_errors, e
                            )),
                        );
                        break;
                    }
                    self.error_reporter
                        .report(STATION, &StationError::Recoverable(e.to_string()));
                    thread::sleep(POLL_INTERVAL);
                    continue;
                }
            };

            if samples.is_empty() {
                if finite {
                    self.finish_finite();
                    break;
                }
                thread::sleep(POLL_INTERVAL);
                continue;
            }

            self.pending.extend_from_slice(&samples);
            while self.pending.len() >= block_samples {
                let rest = self.pending.split_off(block_samples);
                let block = std::mem::replace(&mut self.pending, rest);
                if !self.forward(block, finite) {
                    break;
                }
                if finite && self.settings.pace_finite_sources {
                    let due = self.settings.block_duration * self.sequence as u32;
                    if let Some(wait) = due.checked_sub(started.elapsed()) {
                        thread::sleep(wait);
                    }
                }
            }

            if !finite {
                thread::sleep(POLL_INTERVAL);
            }
        }

        if self.dropped > 0 {
            tracing::warn!(dropped = self.dropped, "audio blocks dropped, transcription fell behind");
        }
        if let Err(e) = self.source.stop() {
            tracing::warn!("failed to stop audio capture: {}", e);
        }
        self.finished.store(true, Ordering::SeqCst);
        tracing::debug!(blocks = self.sequence, "audio ingest stopped");
    }

    /// Send the remainder and an implicit end of turn.
    fn finish_finite(&mut self) {
        if !self.pending.is_empty() {
            let block = std::mem::take(&mut self.pending);
            if !self.forward(block, true) {
                return;
            }
        }
        tracing::debug!(blocks = self.sequence, "audio source exhausted");
        self.send_blocking(TranscriptionInput::EndOfTurn);
    }

    /// Returns false if the pipeline is going away.
    fn forward(&mut self, samples: Vec<i16>, finite: bool) -> bool {
        let block = AudioBlock::new(samples, Instant::now(), self.sequence);
        self.sequence += 1;
        let input = TranscriptionInput::Audio(block);

        if finite {
            return self.send_blocking(input);
        }
        match self.output.try_send(input) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.dropped += 1;
                tracing::debug!("transcription input full, dropping block");
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    fn send_blocking(&self, mut input: TranscriptionInput) -> bool {
        loop {
            match self.output.send_timeout(input, Duration::from_millis(100)) {
                Ok(()) => return true,
                Err(SendTimeoutError::Timeout(back)) => {
                    if !self.running.load(Ordering::SeqCst) {
                        return false;
                    }
                    input = back;
                }
                Err(SendTimeoutError::Disconnected(_)) => return false,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::recorder::MockAudioSource;
    use crate::pipeline::error::LogReporter;
    use crossbeam_channel::{Receiver, bounded, unbounded};
    use std::sync::Mutex;

    fn settings() -> IngestSettings {
        IngestSettings {
            sample_rate: 16000,
            block_duration: Duration::from_millis(100),
            pace_finite_sources: false,
        }
    }

    fn start(
        source: MockAudioSource,
        reporter: Arc<dyn ErrorReporter>,
    ) -> (Receiver<TranscriptionInput>, JoinHandle<()>, Arc<AtomicBool>, Arc<AtomicBool>) {
        let (tx, rx) = unbounded();
        let running = Arc::new(AtomicBool::new(true));
        let finished = Arc::new(AtomicBool::new(false));
        let handle = AudioIngest::start(
            Box::new(source),
            settings(),
            tx,
            Arc::clone(&running),
            Arc::clone(&finished),
            reporter,
        )
        .unwrap();
        (rx, handle, running, finished)
    }

    #[test]
    fn test_finite_source_is_rechunked_and_ends_turn() {
        let source = MockAudioSource::new().with_reads(vec![vec![1; 1000], vec![2; 2500]]);
        let (rx, handle, _running, finished) = start(source, Arc::new(LogReporter));
        handle.join().unwrap();

        let inputs: Vec<_> = rx.try_iter().collect();
        let sizes: Vec<usize> = inputs
            .iter()
            .filter_map(|input| match input {
                TranscriptionInput::Audio(block) => Some(block.samples.len()),
                _ => None,
            })
            .collect();
        assert_eq!(sizes, vec![1600, 1600, 300]);
        assert!(matches!(inputs.last(), Some(TranscriptionInput::EndOfTurn)));
        assert!(finished.load(Ordering::SeqCst));
    }

    #[test]
    fn test_block_sequence_numbers_increase() {
        let source = MockAudioSource::new().with_reads(vec![vec![0; 4800]]);
        let (rx, handle, _running, _finished) = start(source, Arc::new(LogReporter));
        handle.join().unwrap();

        let sequences: Vec<u64> = rx
            .try_iter()
            .filter_map(|input| match input {
                TranscriptionInput::Audio(block) => Some(block.sequence),
                _ => None,
            })
            .collect();
        assert_eq!(sequences, vec![0, 1, 2]);
    }

    #[derive(Default)]
    struct CountingReporter {
        reports: Mutex<Vec<StationError>>,
    }

    impl ErrorReporter for CountingReporter {
        fn report(&self, _station: &str, error: &StationError) {
            self.reports.lock().unwrap().push(error.clone());
        }
    }

    #[test]
    fn test_repeated_read_errors_stop_ingest() {
        let reporter = Arc::new(CountingReporter::default());
        let source = MockAudioSource::new().with_read_failure();
        let (_rx, handle, _running, finished) = start(source, reporter.clone());
        handle.join().unwrap();

        let reports = reporter.reports.lock().unwrap();
        assert_eq!(reports.len(), MAX_CONSECUTIVE_ERRORS as usize);
        assert!(matches!(reports.last(), Some(StationError::Fatal(_))));
        assert!(finished.load(Ordering::SeqCst));
    }

    #[test]
    fn test_start_failure_is_returned() {
        let (tx, _rx) = unbounded();
        let result = AudioIngest::start(
            Box::new(MockAudioSource::new().with_start_failure()),
            settings(),
            tx,
            Arc::new(AtomicBool::new(true)),
            Arc::new(AtomicBool::new(false)),
            Arc::new(LogReporter),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_finite_source_waits_for_slow_consumer() {
        let (tx, rx) = bounded(1);
        let source = MockAudioSource::new().with_reads(vec![vec![0; 16000]]);
        let handle = AudioIngest::start(
            Box::new(source),
            settings(),
            tx,
            Arc::new(AtomicBool::new(true)),
            Arc::new(AtomicBool::new(false)),
            Arc::new(LogReporter),
        )
        .unwrap();

        let mut blocks = 0;
        for input in rx.iter() {
            match input {
                TranscriptionInput::Audio(_) => blocks += 1,
                TranscriptionInput::EndOfTurn => break,
                TranscriptionInput::StartOfTurn => {}
            }
        }
        handle.join().unwrap();
        assert_eq!(blocks, 10);
    }
}
