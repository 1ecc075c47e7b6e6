use crate::error::{Result, VoxError};
use std::collections::VecDeque;

/// Trait for audio capture sources.
///
/// This trait allows swapping implementations (real audio device vs file vs mock).
pub trait AudioSource: Send {
    /// Start capturing audio from the source.
    fn start(&mut self) -> Result<()>;

    /// Stop capturing audio from the source.
    fn stop(&mut self) -> Result<()>;

    /// Read whatever 16kHz mono samples arrived since the last call.
    ///
    /// An empty result means "nothing yet" for live sources and
    /// "exhausted" for finite ones.
    fn read_samples(&mut self) -> Result<Vec<i16>>;

    /// Whether the source ends on its own (file, pipe) rather than running
    /// until stopped (microphone).
    fn is_finite(&self) -> bool {
        false
    }
}

/// Mock audio source for testing.
///
/// Plays back a fixed script of reads; once the script is exhausted it
/// returns empty reads. Scripted sources report themselves as finite.
#[derive(Debug, Clone, Default)]
pub struct MockAudioSource {
    is_started: bool,
    reads: VecDeque<Vec<i16>>,
    finite: bool,
    should_fail_start: bool,
    should_fail_read: bool,
    error_message: String,
}

impl MockAudioSource {
    /// Create a new mock audio source that never produces audio.
    pub fn new() -> Self {
        Self {
            error_message: "mock audio error".to_string(),
            ..Self::default()
        }
    }

    /// Queue reads to return in order, then report exhaustion.
    pub fn with_reads(mut self, reads: Vec<Vec<i16>>) -> Self {
        self.reads = reads.into();
        self.finite = true;
        self
    }

    /// Configure the mock to fail on start
    pub fn with_start_failure(mut self) -> Self {
        self.should_fail_start = true;
        self
    }

    /// Configure the mock to fail on read
    pub fn with_read_failure(mut self) -> Self {
        self.should_fail_read = true;
        self
    }

    /// Configure the error message for failures
    pub fn with_error_message(mut self, message: &str) -> Self {
        self.error_message = message.to_string();
        self
    }

    /// Check if the audio source is started
    pub fn is_started(&self) -> bool {
        self.is_started
    }
}

impl AudioSource for MockAudioSource {
    fn start(&mut self) -> Result<()> {
        if self.should_fail_start {
            return Err(VoxError::AudioCapture {
                message: self.error_message.clone(),
            });
        }
        self.is_started = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.is_started = false;
        Ok(())
    }

    fn read_samples(&mut self) -> Result<Vec<i16>> {
        if self.should_fail_read {
            return Err(VoxError::AudioCapture {
                message: self.error_message.clone(),
            });
        }
        Ok(self.reads.pop_front().unwrap_or_default())
    }

    fn is_finite(&self) -> bool {
        self.finite
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_audio_source_plays_script_then_empties() {
        let mut source = MockAudioSource::new().with_reads(vec![vec![1, 2], vec![3]]);

        assert_eq!(source.read_samples().unwrap(), vec![1, 2]);
        assert_eq!(source.read_samples().unwrap(), vec![3]);
        assert!(source.read_samples().unwrap().is_empty());
        assert!(source.is_finite());
    }

    #[test]
    fn test_mock_audio_source_without_script_is_live() {
        let mut source = MockAudioSource::new();
        assert!(!source.is_finite());
        assert!(source.read_samples().unwrap().is_empty());
    }

    #[test]
    fn test_mock_audio_source_start_stop_state_management() {
        let mut source = MockAudioSource::new();
        assert!(!source.is_started());

        source.start().unwrap();
        assert!(source.is_started());

        source.stop().unwrap();
        assert!(!source.is_started());
    }

    #[test]
    fn test_mock_audio_source_custom_start_error() {
        let mut source = MockAudioSource::new()
            .with_start_failure()
            .with_error_message("device not found");

        match source.start() {
            Err(VoxError::AudioCapture { message }) => assert_eq!(message, "device not found"),
            other => panic!("Expected AudioCapture error, got {:?}", other),
        }
        assert!(!source.is_started());
    }

    #[test]
    fn test_mock_audio_source_read_failure() {
        let mut source = MockAudioSource::new().with_read_failure();
        assert!(matches!(
            source.read_samples(),
            Err(VoxError::AudioCapture { .. })
        ));
    }

    #[test]
    fn test_can_be_used_as_trait_object() {
        let mut source: Box<dyn AudioSource> =
            Box::new(MockAudioSource::new().with_reads(vec![vec![7; 4]]));
        assert_eq!(source.read_samples().unwrap().len(), 4);
    }
}
