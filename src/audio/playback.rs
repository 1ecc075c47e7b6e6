//! Audio output devices fed by the synthesis reassembler.
//!
//! The reassembler is the only writer, so implementations take `&mut self`
//! and need no internal locking of their own state. The one thing other
//! threads may touch is an output's [`AbortSignal`].

use crate::audio::wav::pcm_to_samples;
use crate::error::{Result, VoxError};
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Cuts a blocking `write` or `finish` short from another thread.
///
/// Once raised, the output stops producing sound and returns from any
/// wait as soon as it notices. The reassembler lowers it again after
/// `abort` has run.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal(Arc<AtomicBool>);

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Destination for ordered synthesized audio.
pub trait AudioOutput: Send {
    /// Play (or store) one chunk of little-endian 16-bit mono PCM.
    fn write(&mut self, pcm: &[u8]) -> Result<()>;

    /// The last chunk of a turn has been written.
    fn finish(&mut self) -> Result<()> {
        Ok(())
    }

    /// Stop immediately, discarding anything buffered but not yet played.
    fn abort(&mut self) -> Result<()>;

    /// Try to recover after a failure. Called before the next turn plays.
    fn reopen(&mut self) -> Result<()> {
        Ok(())
    }

    /// Signal honored by outputs whose `write` blocks while audio plays.
    fn abort_signal(&self) -> Option<AbortSignal> {
        None
    }

    /// Name for logging.
    fn name(&self) -> &str;
}

/// Output that discards audio.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullOutput;

impl AudioOutput for NullOutput {
    fn write(&mut self, _pcm: &[u8]) -> Result<()> {
        Ok(())
    }

    fn abort(&mut self) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &str {
        "null"
    }
}

/// What a [`CollectorOutput`] observed, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputRecord {
    Chunk(Vec<u8>),
    Finished,
    Aborted,
}

#[derive(Debug, Default)]
struct CollectorState {
    records: Vec<OutputRecord>,
    failing: bool,
}

/// Output that records every call, for tests and diagnostics.
///
/// Clones share the same record, so a test keeps one handle while the
/// pipeline owns another.
#[derive(Debug, Clone, Default)]
pub struct CollectorOutput {
    state: Arc<Mutex<CollectorState>>,
}

impl CollectorOutput {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make writes and reopens fail until cleared.
    pub fn set_failing(&self, failing: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.failing = failing;
        }
    }

    pub fn records(&self) -> Vec<OutputRecord> {
        self.state
            .lock()
            .map(|state| state.records.clone())
            .unwrap_or_default()
    }

    /// Only the audio chunks, in write order.
    pub fn chunks(&self) -> Vec<Vec<u8>> {
        self.records()
            .into_iter()
            .filter_map(|record| match record {
                OutputRecord::Chunk(pcm) => Some(pcm),
                _ => None,
            })
            .collect()
    }

    fn push(&self, record: OutputRecord) -> Result<()> {
        let mut state = self.state.lock().map_err(|e| VoxError::AudioOutput {
            message: format!("collector lock poisoned: {}", e),
        })?;
        if state.failing && matches!(record, OutputRecord::Chunk(_)) {
            return Err(VoxError::AudioOutput {
                message: "collector marked as failing".to_string(),
            });
        }
        state.records.push(record);
        Ok(())
    }
}

impl AudioOutput for CollectorOutput {
    fn write(&mut self, pcm: &[u8]) -> Result<()> {
        self.push(OutputRecord::Chunk(pcm.to_vec()))
    }

    fn finish(&mut self) -> Result<()> {
        self.push(OutputRecord::Finished)
    }

    fn abort(&mut self) -> Result<()> {
        self.push(OutputRecord::Aborted)
    }

    fn reopen(&mut self) -> Result<()> {
        let failing = self.state.lock().map(|state| state.failing).unwrap_or(true);
        if failing {
            return Err(VoxError::AudioOutput {
                message: "collector still failing".to_string(),
            });
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "collector"
    }
}

/// Writes each spoken turn to its own WAV file: `turn-0001.wav`, ...
///
/// A file is opened lazily on the first chunk, so silent turns leave no file.
pub struct WavFileOutput {
    directory: PathBuf,
    sample_rate: u32,
    next_index: u64,
    writer: Option<hound::WavWriter<BufWriter<File>>>,
    written: Vec<PathBuf>,
}

impl WavFileOutput {
    /// Create the output, making `directory` if it does not exist.
    pub fn new(directory: &Path, sample_rate: u32) -> Result<Self> {
        fs::create_dir_all(directory)?;
        Ok(Self {
            directory: directory.to_path_buf(),
            sample_rate,
            next_index: 1,
            writer: None,
            written: Vec::new(),
        })
    }

    /// Files completed so far.
    pub fn written_files(&self) -> &[PathBuf] {
        &self.written
    }

    fn open_next(&mut self) -> Result<&mut hound::WavWriter<BufWriter<File>>> {
        if self.writer.is_none() {
            let path = self
                .directory
                .join(format!("turn-{:04}.wav", self.next_index));
            let spec = hound::WavSpec {
                channels: 1,
                sample_rate: self.sample_rate,
                bits_per_sample: 16,
                sample_format: hound::SampleFormat::Int,
            };
            let writer = hound::WavWriter::create(&path, spec).map_err(|e| {
                VoxError::AudioOutput {
                    message: format!("Failed to create {}: {}", path.display(), e),
                }
            })?;
            tracing::debug!(path = %path.display(), "opened turn recording");
            self.next_index += 1;
            self.written.push(path);
            self.writer = Some(writer);
        }
        self.writer.as_mut().ok_or_else(|| VoxError::AudioOutput {
            message: "WAV writer unavailable".to_string(),
        })
    }

    fn close(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.take() {
            writer.finalize().map_err(|e| VoxError::AudioOutput {
                message: format!("Failed to finalize WAV file: {}", e),
            })?;
        }
        Ok(())
    }
}

impl AudioOutput for WavFileOutput {
    fn write(&mut self, pcm: &[u8]) -> Result<()> {
        let writer = self.open_next()?;
        for sample in pcm_to_samples(pcm) {
            writer
                .write_sample(sample)
                .map_err(|e| VoxError::AudioOutput {
                    message: format!("Failed to write WAV sample: {}", e),
                })?;
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.close()
    }

    /// Nothing is buffered ahead of the file, so aborting closes what was
    /// written so far.
    fn abort(&mut self) -> Result<()> {
        self.close()
    }

    fn name(&self) -> &str {
        "wav"
    }
}

impl Drop for WavFileOutput {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!("failed to close WAV output: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::wav::samples_to_pcm;

    #[test]
    fn test_collector_records_in_order() {
        let collector = CollectorOutput::new();
        let mut output: Box<dyn AudioOutput> = Box::new(collector.clone());

        output.write(&[1, 0]).unwrap();
        output.abort().unwrap();
        output.write(&[2, 0]).unwrap();
        output.finish().unwrap();

        assert_eq!(
            collector.records(),
            vec![
                OutputRecord::Chunk(vec![1, 0]),
                OutputRecord::Aborted,
                OutputRecord::Chunk(vec![2, 0]),
                OutputRecord::Finished,
            ]
        );
        assert_eq!(collector.chunks(), vec![vec![1, 0], vec![2, 0]]);
    }

    #[test]
    fn test_collector_failing_rejects_writes_and_reopen() {
        let mut collector = CollectorOutput::new();
        collector.set_failing(true);

        assert!(matches!(
            collector.write(&[0, 0]),
            Err(VoxError::AudioOutput { .. })
        ));
        assert!(collector.reopen().is_err());

        collector.set_failing(false);
        assert!(collector.reopen().is_ok());
        assert!(collector.write(&[0, 0]).is_ok());
    }

    #[test]
    fn test_wav_output_writes_one_file_per_turn() {
        let dir = tempfile::tempdir().unwrap();
        let mut output = WavFileOutput::new(dir.path(), 22050).unwrap();

        output.write(&samples_to_pcm(&[1, 2, 3])).unwrap();
        output.write(&samples_to_pcm(&[4])).unwrap();
        output.finish().unwrap();
        output.write(&samples_to_pcm(&[5, 6])).unwrap();
        output.abort().unwrap();

        let files = output.written_files().to_vec();
        assert_eq!(files.len(), 2);
        assert!(files[0].ends_with("turn-0001.wav"));
        assert!(files[1].ends_with("turn-0002.wav"));

        let mut reader = hound::WavReader::open(&files[0]).unwrap();
        assert_eq!(reader.spec().sample_rate, 22050);
        let samples: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(samples, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_wav_output_silent_turn_creates_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut output = WavFileOutput::new(dir.path(), 16000).unwrap();

        output.finish().unwrap();

        assert!(output.written_files().is_empty());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_abort_signal_is_shared_between_clones() {
        let signal = AbortSignal::new();
        let remote = signal.clone();

        remote.raise();
        assert!(signal.is_raised());
        signal.clear();
        assert!(!remote.is_raised());
        assert!(NullOutput.abort_signal().is_none());
    }

    #[test]
    fn test_null_output_accepts_everything() {
        let mut output = NullOutput;
        assert!(output.write(&[0; 8]).is_ok());
        assert!(output.abort().is_ok());
        assert_eq!(output.name(), "null");
    }
}
