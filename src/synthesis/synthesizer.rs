//! Speech synthesis engines.

use crate::defaults::DEFAULT_VOICE;
use crate::error::{Result, VoxError};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// Voice selection for one synthesis call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceParams {
    pub voice: String,
    /// Speaking rate multiplier; 1.0 is the engine's normal speed.
    pub speed: f32,
}

impl Default for VoiceParams {
    fn default() -> Self {
        Self {
            voice: DEFAULT_VOICE.to_string(),
            speed: 1.0,
        }
    }
}

/// Maps fragment tags to voices.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VoiceTable {
    default: VoiceParams,
    by_tag: HashMap<String, VoiceParams>,
}

impl VoiceTable {
    pub fn new(default: VoiceParams) -> Self {
        Self {
            default,
            by_tag: HashMap::new(),
        }
    }

    pub fn with_voice(mut self, tag: &str, params: VoiceParams) -> Self {
        self.by_tag.insert(tag.to_string(), params);
        self
    }

    /// Voice for `tag`, or the default when the tag is unknown.
    pub fn resolve(&self, tag: &str) -> &VoiceParams {
        self.by_tag.get(tag).unwrap_or(&self.default)
    }
}

/// Trait for text-to-speech engines.
///
/// Called from several workers at once.
pub trait SpeechSynthesizer: Send + Sync {
    /// Render `text` to little-endian 16-bit mono PCM.
    fn synthesize(&self, text: &str, voice: &VoiceParams) -> Result<Vec<u8>>;

    fn name(&self) -> &str;
}

impl<T: SpeechSynthesizer> SpeechSynthesizer for Arc<T> {
    fn synthesize(&self, text: &str, voice: &VoiceParams) -> Result<Vec<u8>> {
        (**self).synthesize(text, voice)
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

/// Mock synthesizer for testing. Returns the UTF-8 bytes of the text.
#[derive(Debug, Clone, Default)]
pub struct MockSynthesizer {
    default_delay: Duration,
    delays: HashMap<String, Duration>,
    failures: HashSet<String>,
    calls: Arc<Mutex<Vec<(String, String)>>>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl MockSynthesizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep inside every call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.default_delay = delay;
        self
    }

    /// Sleep for `delay` when asked to synthesize exactly `text`.
    pub fn with_delay_for(mut self, text: &str, delay: Duration) -> Self {
        self.delays.insert(text.to_string(), delay);
        self
    }

    /// Fail when asked to synthesize exactly `text`.
    pub fn with_failure_for(mut self, text: &str) -> Self {
        self.failures.insert(text.to_string());
        self
    }

    /// Texts synthesized so far, in call order.
    pub fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .map(|calls| calls.iter().map(|(text, _)| text.clone()).collect())
            .unwrap_or_default()
    }

    /// Voices used so far, in call order.
    pub fn voices(&self) -> Vec<String> {
        self.calls
            .lock()
            .map(|calls| calls.iter().map(|(_, voice)| voice.clone()).collect())
            .unwrap_or_default()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

impl SpeechSynthesizer for MockSynthesizer {
    fn synthesize(&self, text: &str, voice: &VoiceParams) -> Result<Vec<u8>> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push((text.to_string(), voice.voice.clone()));
        }
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let delay = self.delays.get(text).copied().unwrap_or(self.default_delay);
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.failures.contains(text) {
            return Err(VoxError::Synthesis {
                message: format!("mock synthesis failure for {:?}", text),
            });
        }
        Ok(text.as_bytes().to_vec())
    }

    fn name(&self) -> &str {
        "mock"
    }
}

/// Runs an external program per fragment: text on stdin, raw PCM on stdout.
///
/// `{voice}` and `{speed}` in the arguments are replaced per call, e.g.
/// `piper --model {voice} --length_scale {speed} --output-raw`.
#[derive(Debug, Clone)]
pub struct CommandSynthesizer {
    program: String,
    args: Vec<String>,
}

impl CommandSynthesizer {
    pub fn new(program: &str, args: &[String]) -> Self {
        Self {
            program: program.to_string(),
            args: args.to_vec(),
        }
    }

    fn render_args(&self, voice: &VoiceParams) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{voice}", &voice.voice)
                    .replace("{speed}", &voice.speed.to_string())
            })
            .collect()
    }
}

impl SpeechSynthesizer for CommandSynthesizer {
    fn synthesize(&self, text: &str, voice: &VoiceParams) -> Result<Vec<u8>> {
        let mut child = Command::new(&self.program)
            .args(self.render_args(voice))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    VoxError::SynthesisEngineNotFound {
                        program: self.program.clone(),
                    }
                } else {
                    VoxError::Synthesis {
                        message: format!("Failed to start {}: {}", self.program, e),
                    }
                }
            })?;

        // An engine that exits early closes the pipe; its exit status says why.
        if let Some(mut stdin) = child.stdin.take()
            && let Err(e) = stdin.write_all(format!("{}\n", text).as_bytes())
            && e.kind() != std::io::ErrorKind::BrokenPipe
        {
            return Err(e.into());
        }

        let output = child.wait_with_output()?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(VoxError::Synthesis {
                message: format!("{} exited with {}: {}", self.program, output.status, stderr.trim()),
            });
        }
        Ok(output.stdout)
    }

    fn name(&self) -> &str {
        &self.program
    }
}
