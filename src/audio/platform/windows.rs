//! Windows WASAPI session metering and volume
//!
//! Enumerates the audio sessions of the default render endpoint through
//! `IAudioSessionManager2`. Each session answers `IAudioMeterInformation`
//! for its peak and `ISimpleAudioVolume` for its volume. Each polling thread
//! keeps its COM apartment and session manager open between calls.

use crate::audio::MixerError;
use std::cell::RefCell;

use windows::core::Interface;
use windows::Win32::Media::Audio::Endpoints::IAudioMeterInformation;
use windows::Win32::Media::Audio::{
    eConsole, eRender, AudioSessionStateActive, IAudioSessionControl, IAudioSessionControl2,
    IAudioSessionEnumerator, IAudioSessionManager2, IMMDeviceEnumerator, ISimpleAudioVolume,
    MMDeviceEnumerator,
};
use windows::Win32::System::Com::{
    CoCreateInstance, CoInitializeEx, CoUninitialize, CLSCTX_ALL, COINIT_MULTITHREADED,
};

/// Loudest active session peak, excluding sessions of `own_pid`.
pub fn outside_peak(own_pid: u32) -> Result<f32, MixerError> {
    let mut loudest = 0.0f32;
    for_each_session(|session, pid| {
        if pid == own_pid {
            return;
        }
        let active = unsafe { session.GetState() }
            .map(|state| state == AudioSessionStateActive)
            .unwrap_or(false);
        if !active {
            return;
        }
        let meter: IAudioMeterInformation = match session.cast() {
            Ok(m) => m,
            Err(_) => return,
        };
        if let Ok(peak) = unsafe { meter.GetPeakValue() } {
            loudest = loudest.max(peak);
        }
    })?;
    Ok(loudest)
}

/// Set the master volume of every session owned by `pid`.
pub fn set_process_volume(pid: u32, value: f32) -> Result<usize, MixerError> {
    let mut updated = 0;
    let mut last_error = None;
    for_each_session(|session, session_pid| {
        if session_pid != pid {
            return;
        }
        let volume: ISimpleAudioVolume = match session.cast() {
            Ok(v) => v,
            Err(e) => {
                last_error = Some(e.to_string());
                return;
            }
        };
        match unsafe { volume.SetMasterVolume(value, std::ptr::null()) } {
            Ok(()) => updated += 1,
            Err(e) => last_error = Some(e.to_string()),
        }
    })?;

    match (updated, last_error) {
        (0, Some(e)) => Err(MixerError::Session(e)),
        (n, _) => Ok(n),
    }
}

/// COM apartment membership plus the session manager of the default render
/// endpoint, kept for the life of the polling thread.
struct SessionContext {
    manager: Option<IAudioSessionManager2>,
    com_initialized: bool,
}

impl SessionContext {
    fn open() -> Result<Self, MixerError> {
        // S_FALSE means already initialized - that's fine
        let com_initialized = unsafe { CoInitializeEx(None, COINIT_MULTITHREADED) }.is_ok();
        let mut context = Self {
            manager: None,
            com_initialized,
        };
        context.manager = Some(unsafe { open_session_manager() }?);
        log::debug!("Opened audio session manager");
        Ok(context)
    }
}

impl Drop for SessionContext {
    fn drop(&mut self) {
        // Interfaces must be released before the apartment goes away
        self.manager = None;
        if self.com_initialized {
            unsafe { CoUninitialize() };
        }
    }
}

thread_local! {
    static SESSION_CONTEXT: RefCell<Option<SessionContext>> = const { RefCell::new(None) };
}

/// Run `visit` for each session of the default render endpoint with its PID.
///
/// The session manager is opened once per calling thread and reused by later
/// polls. A failed enumeration drops it so the next call reopens the
/// default endpoint.
fn for_each_session<F>(visit: F) -> Result<(), MixerError>
where
    F: FnMut(&IAudioSessionControl, u32),
{
    SESSION_CONTEXT.with(|cell| {
        let mut context = cell.borrow_mut();
        if context.is_none() {
            *context = Some(SessionContext::open()?);
        }

        let result = match context.as_ref().and_then(|c| c.manager.as_ref()) {
            Some(manager) => unsafe { enumerate_sessions(manager, visit) },
            None => Ok(()),
        };
        if result.is_err() {
            *context = None;
        }
        result
    })
}

fn session_error(what: &str, e: windows::core::Error) -> MixerError {
    MixerError::Session(format!("Failed to {}: {}", what, e))
}

unsafe fn open_session_manager() -> Result<IAudioSessionManager2, MixerError> {
    let enumerator: IMMDeviceEnumerator = CoCreateInstance(&MMDeviceEnumerator, None, CLSCTX_ALL)
        .map_err(|e| session_error("create device enumerator", e))?;

    let device = enumerator
        .GetDefaultAudioEndpoint(eRender, eConsole)
        .map_err(|e| session_error("get default audio endpoint", e))?;

    device
        .Activate::<IAudioSessionManager2>(CLSCTX_ALL, None)
        .map_err(|e| session_error("activate session manager", e))
}

unsafe fn enumerate_sessions<F>(
    manager: &IAudioSessionManager2,
    mut visit: F,
) -> Result<(), MixerError>
where
    F: FnMut(&IAudioSessionControl, u32),
{
    let session_enum: IAudioSessionEnumerator = manager
        .GetSessionEnumerator()
        .map_err(|e| session_error("get session enumerator", e))?;

    let count = session_enum
        .GetCount()
        .map_err(|e| session_error("get session count", e))?;

    for i in 0..count {
        let session: IAudioSessionControl = match session_enum.GetSession(i) {
            Ok(s) => s,
            Err(_) => continue,
        };
        let session2: IAudioSessionControl2 = match session.cast() {
            Ok(s) => s,
            Err(_) => continue,
        };
        let pid = match session2.GetProcessId() {
            Ok(p) => p,
            Err(_) => continue,
        };
        visit(&session, pid);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cached_manager() -> Option<IAudioSessionManager2> {
        SESSION_CONTEXT.with(|cell| cell.borrow().as_ref().and_then(|c| c.manager.clone()))
    }

    #[test]
    fn session_manager_is_reused_between_polls() {
        let Ok(peak) = outside_peak(std::process::id()) else {
            // No render endpoint on this machine
            return;
        };
        assert!((0.0..=1.0).contains(&peak));

        let first = cached_manager();
        assert!(first.is_some());

        outside_peak(std::process::id()).unwrap();
        assert_eq!(cached_manager(), first);
    }
}
