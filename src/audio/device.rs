//! Device discovery shared by microphone capture and speaker playback.

use crate::error::{Result, VoxError};
use cpal::traits::{DeviceTrait, HostTrait};

/// Run a closure with stderr temporarily redirected to /dev/null.
///
/// CPAL queries ALSA/JACK/PipeWire backends on enumeration and each of them
/// prints to stderr when absent.
///
/// # Safety
/// Uses `libc::dup`/`libc::dup2` to save and restore file descriptor 2.
/// Safe as long as no other thread is concurrently manipulating fd 2.
pub(crate) fn with_suppressed_stderr<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    unsafe {
        let saved_fd = libc::dup(2);
        let devnull = libc::open(c"/dev/null".as_ptr(), libc::O_WRONLY);
        if saved_fd >= 0 && devnull >= 0 {
            libc::dup2(devnull, 2);
            libc::close(devnull);
        }

        let result = f();

        if saved_fd >= 0 {
            libc::dup2(saved_fd, 2);
            libc::close(saved_fd);
        }

        result
    }
}

/// Sound servers that already follow the desktop's device selection.
const PREFERRED_DEVICES: &[&str] = &["pipewire", "pulse"];

/// Device name patterns that are never useful for a conversation.
const FILTERED_PATTERNS: &[&str] = &["surround", "front:", "rear:", "center:", "side:", "hdmi", "s/pdif"];

fn should_filter_device(name: &str) -> bool {
    let lower = name.to_lowercase();
    FILTERED_PATTERNS.iter().any(|pattern| lower.contains(pattern))
}

fn is_preferred_device(name: &str) -> bool {
    let lower = name.to_lowercase();
    PREFERRED_DEVICES.iter().any(|pref| lower.contains(pref))
}

/// Direction of a device lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Input,
    Output,
}

fn enumerate(host: &cpal::Host, direction: Direction) -> Result<Vec<cpal::Device>> {
    let devices = match direction {
        Direction::Input => host.input_devices().map(|d| d.collect::<Vec<_>>()),
        Direction::Output => host.output_devices().map(|d| d.collect::<Vec<_>>()),
    };
    devices.map_err(|e| VoxError::AudioCapture {
        message: format!("Failed to enumerate {:?} devices: {}", direction, e),
    })
}

/// List usable device names, marking sound-server devices as recommended.
pub fn list_devices(direction: Direction) -> Result<Vec<String>> {
    let devices = with_suppressed_stderr(|| enumerate(&cpal::default_host(), direction))?;

    Ok(devices
        .iter()
        .filter_map(|device| device.name().ok())
        .filter(|name| !should_filter_device(name))
        .map(|name| {
            if is_preferred_device(&name) {
                format!("{} [recommended]", name)
            } else {
                name
            }
        })
        .collect())
}

/// Find a device by exact name, or pick the best default.
///
/// The default prefers PipeWire/PulseAudio, then the host default.
pub fn find_device(name: Option<&str>, direction: Direction) -> Result<cpal::Device> {
    with_suppressed_stderr(|| {
        let host = cpal::default_host();
        let devices = enumerate(&host, direction)?;

        if let Some(name) = name {
            return devices
                .into_iter()
                .find(|device| device.name().is_ok_and(|n| n == name))
                .ok_or_else(|| VoxError::AudioDeviceNotFound {
                    device: name.to_string(),
                });
        }

        if let Some(device) = devices
            .into_iter()
            .find(|device| device.name().is_ok_and(|n| is_preferred_device(&n)))
        {
            return Ok(device);
        }

        let fallback = match direction {
            Direction::Input => host.default_input_device(),
            Direction::Output => host.default_output_device(),
        };
        fallback.ok_or_else(|| VoxError::AudioDeviceNotFound {
            device: "default".to_string(),
        })
    })
}

/// Mix interleaved frames down to mono.
pub(crate) fn downmix(samples: &[i16], channels: usize) -> Vec<i16> {
    if channels <= 1 {
        return samples.to_vec();
    }
    samples
        .chunks_exact(channels)
        .map(|frame| {
            let sum: i32 = frame.iter().map(|&s| s as i32).sum();
            (sum / channels as i32) as i16
        })
        .collect()
}

pub(crate) fn f32_to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_filter_device() {
        assert!(should_filter_device("surround51"));
        assert!(should_filter_device("front:CARD=PCH"));
        assert!(should_filter_device("HDMI Output"));
        assert!(!should_filter_device("pipewire"));
        assert!(!should_filter_device("Built-in Audio"));
    }

    #[test]
    fn test_is_preferred_device() {
        assert!(is_preferred_device("PipeWire"));
        assert!(is_preferred_device("PulseAudio"));
        assert!(!is_preferred_device("hw:0,0"));
    }

    #[test]
    fn test_downmix_averages_channels() {
        assert_eq!(downmix(&[100, 300, -50, 50], 2), vec![200, 0]);
        assert_eq!(downmix(&[1, 2, 3], 1), vec![1, 2, 3]);
    }

    #[test]
    fn test_f32_to_i16_clamps() {
        assert_eq!(f32_to_i16(2.0), i16::MAX);
        assert_eq!(f32_to_i16(0.0), 0);
        assert_eq!(f32_to_i16(-2.0), -i16::MAX);
    }

    #[test]
    #[ignore] // Requires audio hardware
    fn test_list_input_devices() {
        let devices = list_devices(Direction::Input).unwrap();
        assert!(!devices.is_empty());
    }

    #[test]
    #[ignore] // Requires audio hardware
    fn test_unknown_device_name_is_not_found() {
        match find_device(Some("NonExistentDevice12345"), Direction::Output) {
            Err(VoxError::AudioDeviceNotFound { device }) => {
                assert_eq!(device, "NonExistentDevice12345")
            }
            _ => panic!("Expected AudioDeviceNotFound error"),
        }
    }
}
