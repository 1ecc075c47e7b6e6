//! Speaker playback using CPAL.

use crate::audio::device::{Direction, find_device};
use crate::audio::playback::{AbortSignal, AudioOutput};
use crate::audio::wav::{pcm_to_samples, resample};
use crate::error::{Result, VoxError};
use cpal::traits::{DeviceTrait, StreamTrait};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// How far ahead of the device `write` may queue audio, in milliseconds.
const MAX_LEAD_MS: u64 = 200;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// SAFETY: only touched from the reassembler thread that owns the output.
struct SendableStream(cpal::Stream);

unsafe impl Send for SendableStream {}

/// Plays mono PCM through an output device, resampling to its native rate.
pub struct SpeakerOutput {
    device_name: Option<String>,
    source_rate: u32,
    device_rate: u32,
    queue: Arc<Mutex<VecDeque<i16>>>,
    failed: Arc<AtomicBool>,
    /// Raised by a flush on another thread; mutes the callback at once.
    abort: AbortSignal,
    stream: Option<SendableStream>,
}

impl SpeakerOutput {
    /// Open an output device for PCM produced at `source_rate`.
    pub fn new(device_name: Option<&str>, source_rate: u32) -> Result<Self> {
        let mut output = Self {
            device_name: device_name.map(str::to_string),
            source_rate,
            device_rate: source_rate,
            queue: Arc::new(Mutex::new(VecDeque::new())),
            failed: Arc::new(AtomicBool::new(false)),
            abort: AbortSignal::new(),
            stream: None,
        };
        output.open()?;
        Ok(output)
    }

    fn open(&mut self) -> Result<()> {
        self.stream = None;
        let device = find_device(self.device_name.as_deref(), Direction::Output)?;
        let config = device
            .default_output_config()
            .map_err(|e| VoxError::AudioOutput {
                message: format!("Failed to query default output config: {}", e),
            })?;

        self.device_rate = config.sample_rate().0;
        let channels = config.channels() as usize;
        let stream_config: cpal::StreamConfig = config.clone().into();

        let queue = Arc::clone(&self.queue);
        let abort = self.abort.clone();
        let next_sample = move || -> i16 {
            if abort.is_raised() {
                return 0;
            }
            queue
                .lock()
                .ok()
                .and_then(|mut q| q.pop_front())
                .unwrap_or(0)
        };

        let failed = Arc::clone(&self.failed);
        let on_error = move |err: cpal::StreamError| {
            tracing::warn!("audio output stream error: {}", err);
            failed.store(true, Ordering::SeqCst);
        };

        let stream = match config.sample_format() {
            cpal::SampleFormat::I16 => device.build_output_stream(
                &stream_config,
                move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                    for frame in data.chunks_mut(channels) {
                        frame.fill(next_sample());
                    }
                },
                on_error,
                None,
            ),
            cpal::SampleFormat::F32 => device.build_output_stream(
                &stream_config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    for frame in data.chunks_mut(channels) {
                        frame.fill(next_sample() as f32 / i16::MAX as f32);
                    }
                },
                on_error,
                None,
            ),
            fmt => {
                return Err(VoxError::AudioOutput {
                    message: format!("Unsupported output sample format: {:?}", fmt),
                });
            }
        }
        .map_err(|e| VoxError::AudioOutput {
            message: format!("Failed to build output stream: {}", e),
        })?;

        stream.play().map_err(|e| VoxError::AudioOutput {
            message: format!("Failed to start output stream: {}", e),
        })?;

        self.failed.store(false, Ordering::SeqCst);
        self.stream = Some(SendableStream(stream));
        Ok(())
    }

    fn queued(&self) -> usize {
        self.queue.lock().map(|q| q.len()).unwrap_or(0)
    }

    fn check_failed(&self) -> Result<()> {
        if self.stream.is_none() || self.failed.load(Ordering::SeqCst) {
            return Err(VoxError::AudioOutput {
                message: "output stream is not running".to_string(),
            });
        }
        Ok(())
    }

    /// Block until no more than `limit` samples are waiting, or an abort
    /// is raised.
    fn wait_until_queued_at_most(&self, limit: usize) -> Result<()> {
        while self.queued() > limit && !self.abort.is_raised() {
            self.check_failed()?;
            thread::sleep(POLL_INTERVAL);
        }
        Ok(())
    }
}

impl AudioOutput for SpeakerOutput {
    fn write(&mut self, pcm: &[u8]) -> Result<()> {
        self.check_failed()?;
        if self.abort.is_raised() {
            return Ok(());
        }
        let samples = resample(&pcm_to_samples(pcm), self.source_rate, self.device_rate);
        if let Ok(mut queue) = self.queue.lock() {
            queue.extend(samples);
        }
        let lead = (self.device_rate as u64 * MAX_LEAD_MS / 1000) as usize;
        self.wait_until_queued_at_most(lead)
    }

    fn finish(&mut self) -> Result<()> {
        self.wait_until_queued_at_most(0)
    }

    fn abort(&mut self) -> Result<()> {
        if let Ok(mut queue) = self.queue.lock() {
            queue.clear();
        }
        Ok(())
    }

    fn reopen(&mut self) -> Result<()> {
        self.abort()?;
        self.open()
    }

    fn abort_signal(&self) -> Option<AbortSignal> {
        Some(self.abort.clone())
    }

    fn name(&self) -> &str {
        "speaker"
    }
}
