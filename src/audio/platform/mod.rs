//! Platform-specific session mixer access
//!
//! Each platform module provides some of:
//! - `outside_peak()` - loudest session peak not owned by a given process
//! - `set_process_volume()` - set the volume of a process's sessions
//!
//! Loopback capture itself is handled cross-platform by cpal in capture.rs.

use super::MixerError;

#[cfg(target_os = "windows")]
mod windows;

#[cfg(target_os = "linux")]
mod linux;

/// Highest current peak over all active render sessions except `own_pid`.
pub fn outside_peak(own_pid: u32) -> Result<f32, MixerError> {
    #[cfg(target_os = "windows")]
    {
        windows::outside_peak(own_pid)
    }

    #[cfg(not(target_os = "windows"))]
    {
        let _ = own_pid;
        Err(MixerError::Unsupported("session peak metering"))
    }
}

/// Set the volume of every session owned by `pid`; returns how many changed.
pub fn set_process_volume(pid: u32, value: f32) -> Result<usize, MixerError> {
    #[cfg(target_os = "windows")]
    {
        windows::set_process_volume(pid, value)
    }

    #[cfg(target_os = "linux")]
    {
        linux::set_process_volume(pid, value)
    }

    #[cfg(not(any(target_os = "windows", target_os = "linux")))]
    {
        let _ = (pid, value);
        Err(MixerError::Unsupported("per-process volume"))
    }
}
