//! Per-process playback volume at the OS session mixer

use super::platform;
use thiserror::Error;

/// Session mixer errors
#[derive(Error, Debug)]
pub enum MixerError {
    #[error("Not supported on this platform: {0}")]
    Unsupported(&'static str),

    #[error("No audio session for process {0}")]
    NoSession(u32),

    #[error("Invalid volume: {0}")]
    InvalidVolume(f32),

    #[error("Audio session API error: {0}")]
    Session(String),

    #[error("Failed to run {command}: {reason}")]
    Command { command: String, reason: String },
}

/// Sets the playback volume of other processes' audio sessions.
#[derive(Debug, Default, Clone, Copy)]
pub struct SessionVolume;

impl SessionVolume {
    pub fn new() -> Self {
        Self
    }

    /// Set every session of `pid` to `value`, clamped to [0, 1].
    pub fn set_process_volume(&self, pid: u32, value: f32) -> Result<(), MixerError> {
        if !value.is_finite() {
            return Err(MixerError::InvalidVolume(value));
        }
        let value = value.clamp(0.0, 1.0);

        let updated = platform::set_process_volume(pid, value)?;
        if updated == 0 {
            return Err(MixerError::NoSession(pid));
        }
        log::debug!(
            "Set volume of {} session(s) for PID {} to {:.2}",
            updated,
            pid,
            value
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_finite_volume_is_rejected() {
        let volume = SessionVolume::new();
        assert!(matches!(
            volume.set_process_volume(1, f32::NAN),
            Err(MixerError::InvalidVolume(_))
        ));
        assert!(matches!(
            volume.set_process_volume(1, f32::INFINITY),
            Err(MixerError::InvalidVolume(_))
        ));
    }

    #[test]
    fn error_messages_name_the_process() {
        assert_eq!(
            MixerError::NoSession(4242).to_string(),
            "No audio session for process 4242"
        );
    }
}
