//! Speech/silence classification of audio blocks.
//!
//! A block is speech when its RMS level is above the threshold. While the
//! assistant is talking the [`EchoGate`] is engaged and the higher echo
//! threshold applies instead, so the reply leaking back into the mic does
//! not count as the user speaking.

use crate::defaults;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VadConfig {
    /// RMS threshold for speech (0.0 to 1.0).
    pub speech_threshold: f32,
    /// Threshold while the echo gate is engaged. Values at or below
    /// `speech_threshold` turn the gate off; 1.0 mutes the mic.
    pub echo_threshold: f32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            speech_threshold: defaults::VAD_THRESHOLD,
            echo_threshold: defaults::ECHO_THRESHOLD,
        }
    }
}

/// Set while reply audio is playing.
#[derive(Debug, Clone, Default)]
pub struct EchoGate(Arc<AtomicBool>);

impl EchoGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn engage(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn release(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_engaged(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Classification {
    pub level: f32,
    pub threshold: f32,
    pub is_speech: bool,
}

#[derive(Debug, Clone, Default)]
pub struct VoiceDetector {
    config: VadConfig,
    echo: EchoGate,
}

impl VoiceDetector {
    pub fn new(config: VadConfig, echo: EchoGate) -> Self {
        Self { config, echo }
    }

    pub fn threshold(&self) -> f32 {
        if self.echo.is_engaged() {
            self.config.echo_threshold.max(self.config.speech_threshold)
        } else {
            self.config.speech_threshold
        }
    }

    pub fn classify(&self, samples: &[i16]) -> Classification {
        let level = calculate_rms(samples);
        let threshold = self.threshold();
        Classification {
            level,
            threshold,
            is_speech: level > threshold,
        }
    }
}

/// Normalized RMS of 16-bit samples: 0.0 is silence, 1.0 full scale.
pub fn calculate_rms(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f64 = samples
        .iter()
        .map(|&sample| {
            let normalized = sample as f64 / i16::MAX as f64;
            normalized * normalized
        })
        .sum();

    (sum_squares / samples.len() as f64).sqrt() as f32
}
