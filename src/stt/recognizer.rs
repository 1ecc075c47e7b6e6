use crate::error::{Result, VoxError};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

/// Trait for speech-to-text engines.
///
/// Calls are slow and blocking; the transcription session never makes them
/// on the capture path.
pub trait SpeechRecognizer: Send + Sync {
    /// Transcribe 16kHz mono PCM.
    ///
    /// `language` is a code such as "en" or "auto" for detection.
    fn transcribe(&self, audio: &[i16], language: &str) -> Result<String>;

    /// Get the name of the loaded model
    fn model_name(&self) -> &str;
}

/// Implement SpeechRecognizer for Arc<T> to allow sharing across pipelines.
impl<T: SpeechRecognizer> SpeechRecognizer for Arc<T> {
    fn transcribe(&self, audio: &[i16], language: &str) -> Result<String> {
        (**self).transcribe(audio, language)
    }

    fn model_name(&self) -> &str {
        (**self).model_name()
    }
}

/// Mock recognizer for testing.
///
/// Tracks how many calls run at once so tests can assert that the buffer
/// is never transcribed concurrently.
#[derive(Debug, Clone)]
pub struct MockRecognizer {
    response: String,
    final_response: Option<String>,
    delay: Duration,
    fail_partials: bool,
    fail_finals: bool,
    /// Calls whose audio is at most this many samples count as partials.
    partial_limit: usize,
    stats: Arc<RecognizerStats>,
}

/// Call counters shared between a [`MockRecognizer`] and its clones.
#[derive(Debug, Default)]
pub struct RecognizerStats {
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    last_len: AtomicUsize,
}

impl RecognizerStats {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of overlapping `transcribe` calls observed.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Number of samples passed to the most recent call.
    pub fn last_len(&self) -> usize {
        self.last_len.load(Ordering::SeqCst)
    }
}

impl MockRecognizer {
    /// Create a mock that answers every call with `response`.
    pub fn new(response: &str) -> Self {
        Self {
            response: response.to_string(),
            final_response: None,
            delay: Duration::ZERO,
            fail_partials: false,
            fail_finals: false,
            partial_limit: 0,
            stats: Arc::new(RecognizerStats::default()),
        }
    }

    /// Answer calls over more than `partial_limit` samples with `response`.
    pub fn with_final_response(mut self, response: &str, partial_limit: usize) -> Self {
        self.final_response = Some(response.to_string());
        self.partial_limit = partial_limit;
        self
    }

    /// Sleep inside every call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Fail every call.
    pub fn with_failure(mut self) -> Self {
        self.fail_partials = true;
        self.fail_finals = true;
        self
    }

    /// Fail only calls over more than `partial_limit` samples.
    pub fn with_final_failure(mut self, partial_limit: usize) -> Self {
        self.fail_finals = true;
        self.partial_limit = partial_limit;
        self
    }

    pub fn stats(&self) -> Arc<RecognizerStats> {
        Arc::clone(&self.stats)
    }

    fn is_final_call(&self, len: usize) -> bool {
        len > self.partial_limit
    }
}

impl SpeechRecognizer for MockRecognizer {
    fn transcribe(&self, audio: &[i16], _language: &str) -> Result<String> {
        let stats = &self.stats;
        stats.calls.fetch_add(1, Ordering::SeqCst);
        stats.last_len.store(audio.len(), Ordering::SeqCst);
        let now = stats.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        stats.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        stats.in_flight.fetch_sub(1, Ordering::SeqCst);

        let is_final = self.is_final_call(audio.len());
        let fail = if is_final {
            self.fail_finals
        } else {
            self.fail_partials
        };
        if fail {
            return Err(VoxError::Recognition {
                message: "mock recognition failure".to_string(),
            });
        }

        match (&self.final_response, is_final) {
            (Some(text), true) => Ok(text.clone()),
            _ => Ok(self.response.clone()),
        }
    }

    fn model_name(&self) -> &str {
        "mock"
    }
}

/// Strip recognizer non-speech annotations in any language.
///
/// Whisper wraps annotations in `[…]`, `*…*`, or `(…)`; these never contain
/// real speech. Unmatched opening delimiters are kept as-is.
pub fn clean_transcription(text: &str) -> String {
    let mut result = String::with_capacity(text.len());
    let mut chars = text.chars();

    while let Some(ch) = chars.next() {
        let close = match ch {
            '[' => ']',
            '(' => ')',
            '*' => '*',
            _ => {
                result.push(ch);
                continue;
            }
        };

        let mut inner = String::new();
        let mut closed = false;
        for next in chars.by_ref() {
            if next == close {
                closed = true;
                break;
            }
            inner.push(next);
        }
        if !closed {
            result.push(ch);
            result.push_str(&inner);
        }
    }

    result.split_whitespace().collect::<Vec<_>>().join(" ")
}
