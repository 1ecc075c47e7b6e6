//! Microphone capture using CPAL.

use crate::audio::device::{Direction, downmix, f32_to_i16, find_device};
use crate::audio::recorder::AudioSource;
use crate::audio::wav::resample;
use crate::defaults;
use crate::error::{Result, VoxError};
use cpal::traits::{DeviceTrait, StreamTrait};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Wrapper for cpal::Stream to make it Send.
///
/// SAFETY: the stream is only touched through the Mutex in
/// [`CpalAudioSource`], never concurrently.
struct SendableStream(cpal::Stream);

unsafe impl Send for SendableStream {}

/// Live microphone source delivering 16kHz mono i16.
///
/// Tries i16 and then f32 at 16kHz mono. If the device accepts neither, or
/// accepts the config but never calls back (seen with PipeWire's ALSA
/// layer), it captures at the native config and converts in software.
pub struct CpalAudioSource {
    device: cpal::Device,
    stream: Mutex<Option<SendableStream>>,
    buffer: Arc<Mutex<Vec<i16>>>,
    callback_count: Arc<AtomicU64>,
    sample_rate: u32,
}

impl CpalAudioSource {
    /// Open a capture device by name, or the best default when `None`.
    pub fn new(device_name: Option<&str>) -> Result<Self> {
        Ok(Self {
            device: find_device(device_name, Direction::Input)?,
            stream: Mutex::new(None),
            buffer: Arc::new(Mutex::new(Vec::new())),
            callback_count: Arc::new(AtomicU64::new(0)),
            sample_rate: defaults::SAMPLE_RATE,
        })
    }

    fn sink(&self) -> impl Fn(Vec<i16>) + Send + 'static {
        let buffer = Arc::clone(&self.buffer);
        let counter = Arc::clone(&self.callback_count);
        move |samples| {
            counter.fetch_add(1, Ordering::Relaxed);
            if let Ok(mut buf) = buffer.lock() {
                buf.extend_from_slice(&samples);
            }
        }
    }

    fn build_stream(&self) -> Result<cpal::Stream> {
        let preferred = cpal::StreamConfig {
            channels: 1,
            sample_rate: cpal::SampleRate(self.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let push = self.sink();
        if let Ok(stream) = self.device.build_input_stream(
            &preferred,
            move |data: &[i16], _: &cpal::InputCallbackInfo| push(data.to_vec()),
            |err| tracing::warn!("audio input stream error: {}", err),
            None,
        ) {
            return Ok(stream);
        }

        let push = self.sink();
        if let Ok(stream) = self.device.build_input_stream(
            &preferred,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                push(data.iter().map(|&s| f32_to_i16(s)).collect())
            },
            |err| tracing::warn!("audio input stream error: {}", err),
            None,
        ) {
            return Ok(stream);
        }

        self.build_stream_native()
    }

    /// Capture at the device's own rate/channels, converting in software.
    fn build_stream_native(&self) -> Result<cpal::Stream> {
        let default_config =
            self.device
                .default_input_config()
                .map_err(|e| VoxError::AudioCapture {
                    message: format!("Failed to query default input config: {}", e),
                })?;

        let native_rate = default_config.sample_rate().0;
        let channels = default_config.channels() as usize;
        let target_rate = self.sample_rate;
        let stream_config: cpal::StreamConfig = default_config.clone().into();

        tracing::info!(
            channels,
            native_rate,
            format = ?default_config.sample_format(),
            "using native capture format, converting in software"
        );

        let push = self.sink();
        let convert = move |samples: Vec<i16>| {
            push(resample(&downmix(&samples, channels), native_rate, target_rate))
        };

        let stream = match default_config.sample_format() {
            cpal::SampleFormat::I16 => self.device.build_input_stream(
                &stream_config,
                move |data: &[i16], _: &cpal::InputCallbackInfo| convert(data.to_vec()),
                |err| tracing::warn!("audio input stream error: {}", err),
                None,
            ),
            cpal::SampleFormat::F32 => self.device.build_input_stream(
                &stream_config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    convert(data.iter().map(|&s| f32_to_i16(s)).collect())
                },
                |err| tracing::warn!("audio input stream error: {}", err),
                None,
            ),
            fmt => {
                return Err(VoxError::AudioCapture {
                    message: format!("Unsupported native sample format: {:?}", fmt),
                });
            }
        };

        stream.map_err(|e| VoxError::AudioCapture {
            message: format!("Failed to build native input stream: {}", e),
        })
    }

    fn lock_stream(&self) -> Result<std::sync::MutexGuard<'_, Option<SendableStream>>> {
        self.stream.lock().map_err(|e| VoxError::AudioCapture {
            message: format!("Failed to lock stream: {}", e),
        })
    }
}

impl AudioSource for CpalAudioSource {
    fn start(&mut self) -> Result<()> {
        if self.lock_stream()?.is_some() {
            return Ok(());
        }

        let stream = self.build_stream()?;
        stream.play().map_err(|e| VoxError::AudioCapture {
            message: format!("Failed to start audio stream: {}", e),
        })?;

        // Some backends accept the preferred config and then never deliver data.
        std::thread::sleep(Duration::from_millis(200));

        let stream = if self.callback_count.load(Ordering::Relaxed) == 0 {
            drop(stream);
            if let Ok(mut buf) = self.buffer.lock() {
                buf.clear();
            }
            let native = self.build_stream_native()?;
            native.play().map_err(|e| VoxError::AudioCapture {
                message: format!("Failed to start native audio stream: {}", e),
            })?;
            native
        } else {
            stream
        };

        *self.lock_stream()? = Some(SendableStream(stream));
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if let Some(stream) = self.lock_stream()?.take() {
            stream.0.pause().map_err(|e| VoxError::AudioCapture {
                message: format!("Failed to stop audio stream: {}", e),
            })?;
        }
        Ok(())
    }

    fn read_samples(&mut self) -> Result<Vec<i16>> {
        let mut buffer = self.buffer.lock().map_err(|e| VoxError::AudioCapture {
            message: format!("Failed to lock audio buffer: {}", e),
        })?;
        Ok(std::mem::take(&mut *buffer))
    }

    fn is_finite(&self) -> bool {
        false
    }
}
