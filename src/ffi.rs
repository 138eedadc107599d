//! C ABI
//!
//! The host owns an opaque `Engine` handle from `tempo_sync_create*` until it
//! passes it to `tempo_sync_destroy`. Every entry point accepts a null handle
//! and answers with the neutral value, and no panic ever crosses into the
//! host.

use crate::audio::{get_preset, AnalyzerConfig};
use crate::engine::Engine;
use std::ffi::{c_char, CStr};
use std::panic::{self, AssertUnwindSafe};

/// Run `f`, turning a panic into `fallback`.
fn guard<T>(fallback: T, f: impl FnOnce() -> T) -> T {
    panic::catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|_| {
        log::error!("Panic caught at the C boundary");
        fallback
    })
}

fn init_logging() {
    // Hosts embedding several engines share one logger
    let _ = env_logger::try_init();
}

fn into_handle(engine: Engine) -> *mut Engine {
    Box::into_raw(Box::new(engine))
}

/// Borrow the engine behind `handle` and run `f`, or return `fallback`.
///
/// # Safety
/// `handle` must be null or a live pointer from `tempo_sync_create*`.
unsafe fn with_engine<T>(handle: *const Engine, fallback: T, f: impl FnOnce(&Engine) -> T) -> T {
    match unsafe { handle.as_ref() } {
        Some(engine) => guard(fallback, || f(engine)),
        None => fallback,
    }
}

fn index(value: i32) -> Option<usize> {
    usize::try_from(value).ok()
}

fn create(channels: u32, sample_rate: u32, config: AnalyzerConfig) -> *mut Engine {
    match Engine::start(channels, sample_rate, config) {
        Ok(engine) => into_handle(engine),
        Err(e) => {
            log::error!("Failed to create tempo engine: {}", e);
            std::ptr::null_mut()
        }
    }
}

/// # Safety
/// `text` must be null or a valid NUL-terminated string.
unsafe fn read_str<'a>(text: *const c_char) -> Option<&'a str> {
    if text.is_null() {
        return None;
    }
    match unsafe { CStr::from_ptr(text) }.to_str() {
        Ok(s) => Some(s),
        Err(e) => {
            log::error!("String argument is not UTF-8: {}", e);
            None
        }
    }
}

/// Create an engine analyzing loopback audio with the default tuning.
///
/// Returns null if the capture device cannot be opened.
#[no_mangle]
pub extern "C" fn tempo_sync_create(channels: u32, sample_rate: u32) -> *mut Engine {
    init_logging();
    guard(std::ptr::null_mut(), || {
        create(channels, sample_rate, AnalyzerConfig::default())
    })
}

/// Create an engine with a JSON configuration; absent fields keep defaults.
///
/// # Safety
/// `json` must be null or a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn tempo_sync_create_with_config(
    channels: u32,
    sample_rate: u32,
    json: *const c_char,
) -> *mut Engine {
    init_logging();
    let Some(json) = (unsafe { read_str(json) }) else {
        return std::ptr::null_mut();
    };
    guard(std::ptr::null_mut(), || match AnalyzerConfig::from_json(json) {
        Ok(config) => create(channels, sample_rate, config),
        Err(e) => {
            log::error!("Rejected tempo configuration: {}", e);
            std::ptr::null_mut()
        }
    })
}

/// Create an engine tuned by a named preset (case-insensitive).
///
/// # Safety
/// `name` must be null or a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn tempo_sync_create_with_preset(
    channels: u32,
    sample_rate: u32,
    name: *const c_char,
) -> *mut Engine {
    init_logging();
    let Some(name) = (unsafe { read_str(name) }) else {
        return std::ptr::null_mut();
    };
    guard(std::ptr::null_mut(), || match get_preset(name) {
        Some(preset) => create(channels, sample_rate, AnalyzerConfig::with_preset(&preset)),
        None => {
            log::error!("Unknown tempo preset: {}", name);
            std::ptr::null_mut()
        }
    })
}

/// Release an engine. Null is ignored.
///
/// # Safety
/// `handle` must be null or a pointer from `tempo_sync_create*` that has not
/// been destroyed yet.
#[no_mangle]
pub unsafe extern "C" fn tempo_sync_destroy(handle: *mut Engine) {
    if handle.is_null() {
        return;
    }
    guard((), || drop(unsafe { Box::from_raw(handle) }));
}

/// # Safety
/// `handle` must be null or a live engine handle.
#[no_mangle]
pub unsafe extern "C" fn tempo_sync_reset(handle: *mut Engine) {
    unsafe { with_engine(handle, (), Engine::reset) }
}

/// Analyze one tick of captured audio.
///
/// # Safety
/// `handle` must be null or a live engine handle.
#[no_mangle]
pub unsafe extern "C" fn tempo_sync_update(handle: *mut Engine) {
    unsafe {
        with_engine(handle, (), |engine| {
            if let Err(e) = engine.update() {
                log::warn!("Tempo update failed: {}", e);
            }
        })
    }
}

/// Selected tempo in BPM, -1 while unknown.
///
/// # Safety
/// `handle` must be null or a live engine handle.
#[no_mangle]
pub unsafe extern "C" fn tempo_sync_get_bpm(handle: *const Engine) -> f32 {
    unsafe { with_engine(handle, -1.0, Engine::bpm) }
}

/// # Safety
/// `handle` must be null or a live engine handle.
#[no_mangle]
pub unsafe extern "C" fn tempo_sync_get_bpm_score(handle: *const Engine, index: i32) -> f32 {
    unsafe {
        with_engine(handle, 0.0, |engine| {
            self::index(index).map_or(0.0, |i| engine.bpm_score(i))
        })
    }
}

/// # Safety
/// `handle` must be null or a live engine handle.
#[no_mangle]
pub unsafe extern "C" fn tempo_sync_get_bpm_vu(handle: *const Engine, index: i32) -> f32 {
    unsafe {
        with_engine(handle, 0.0, |engine| {
            self::index(index).map_or(0.0, |i| engine.bpm_vu(i))
        })
    }
}

/// # Safety
/// `handle` must be null or a live engine handle.
#[no_mangle]
pub unsafe extern "C" fn tempo_sync_get_rms(handle: *const Engine, channel: i32) -> f32 {
    unsafe {
        with_engine(handle, 0.0, |engine| {
            index(channel).map_or(0.0, |c| engine.rms(c))
        })
    }
}

/// # Safety
/// `handle` must be null or a live engine handle.
#[no_mangle]
pub unsafe extern "C" fn tempo_sync_get_milliseconds_to_next_beat(handle: *const Engine) -> f32 {
    unsafe { with_engine(handle, 0.0, Engine::ms_to_next_beat) }
}

/// # Safety
/// `handle` must be null or a live engine handle.
#[no_mangle]
pub unsafe extern "C" fn tempo_sync_get_window_size(handle: *const Engine) -> i32 {
    unsafe {
        with_engine(handle, 0, |engine| {
            i32::try_from(engine.window_size()).unwrap_or(i32::MAX)
        })
    }
}

/// # Safety
/// `handle` must be null or a live engine handle.
#[no_mangle]
pub unsafe extern "C" fn tempo_sync_get_candidate_count(handle: *const Engine) -> i32 {
    unsafe {
        with_engine(handle, 0, |engine| {
            i32::try_from(engine.candidate_count()).unwrap_or(i32::MAX)
        })
    }
}

/// Peak of audio from other processes in [0, 1].
///
/// # Safety
/// `handle` must be null or a live engine handle.
#[no_mangle]
pub unsafe extern "C" fn tempo_sync_get_outside_peak_meter(handle: *const Engine) -> f32 {
    unsafe { with_engine(handle, 0.0, Engine::outside_peak_meter) }
}

/// # Safety
/// `handle` must be null or a live engine handle.
#[no_mangle]
pub unsafe extern "C" fn tempo_sync_set_process_volume(handle: *const Engine, pid: u32, value: f32) {
    unsafe {
        with_engine(handle, (), |engine| engine.set_process_volume(pid, value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::CaptureBuffer;
    use parking_lot::Mutex;
    use std::ffi::CString;
    use std::sync::Arc;

    fn test_handle() -> (*mut Engine, Arc<Mutex<CaptureBuffer>>) {
        let buffer = Arc::new(Mutex::new(CaptureBuffer::new(2, 48000, 0, 48000)));
        let engine =
            Engine::with_source(Box::new(buffer.clone()), AnalyzerConfig::default()).unwrap();
        (into_handle(engine), buffer)
    }

    #[test]
    fn null_handle_answers_neutral_values() {
        let null = std::ptr::null_mut::<Engine>();
        unsafe {
            tempo_sync_reset(null);
            tempo_sync_update(null);
            tempo_sync_set_process_volume(null, 1234, 0.5);
            tempo_sync_destroy(null);

            assert_eq!(tempo_sync_get_bpm(null), -1.0);
            assert_eq!(tempo_sync_get_bpm_score(null, 0), 0.0);
            assert_eq!(tempo_sync_get_bpm_vu(null, 0), 0.0);
            assert_eq!(tempo_sync_get_rms(null, 0), 0.0);
            assert_eq!(tempo_sync_get_milliseconds_to_next_beat(null), 0.0);
            assert_eq!(tempo_sync_get_window_size(null), 0);
            assert_eq!(tempo_sync_get_candidate_count(null), 0);
            assert_eq!(tempo_sync_get_outside_peak_meter(null), 0.0);
        }
    }

    #[test]
    fn invalid_indices_answer_zero() {
        let (handle, _) = test_handle();
        unsafe {
            assert_eq!(tempo_sync_get_bpm_score(handle, -1), 0.0);
            assert_eq!(tempo_sync_get_bpm_score(handle, 4), 0.0);
            assert_eq!(tempo_sync_get_bpm_vu(handle, i32::MIN), 0.0);
            assert_eq!(tempo_sync_get_rms(handle, -3), 0.0);
            assert_eq!(tempo_sync_get_rms(handle, 2), 0.0);
            tempo_sync_destroy(handle);
        }
    }

    #[test]
    fn handle_drives_analysis() {
        let (handle, buffer) = test_handle();
        unsafe {
            assert_eq!(tempo_sync_get_window_size(handle), 1024);
            assert_eq!(tempo_sync_get_candidate_count(handle), 4);

            buffer.lock().push_interleaved(&vec![0.5; 512 * 2]);
            tempo_sync_update(handle);
            assert!((tempo_sync_get_rms(handle, 0) - 0.5).abs() < 1e-6);

            tempo_sync_reset(handle);
            assert_eq!(tempo_sync_get_rms(handle, 0), 0.0);
            assert_eq!(tempo_sync_get_bpm(handle), -1.0);
            assert_eq!(tempo_sync_get_milliseconds_to_next_beat(handle), 0.0);

            tempo_sync_destroy(handle);
        }
    }

    #[test]
    fn bad_configuration_returns_null() {
        let broken = CString::new("{ not json").unwrap();
        let invalid = CString::new(r#"{ "min_bpm": 200.0, "max_bpm": 100.0 }"#).unwrap();
        let oversized = CString::new(r#"{ "window_size": 1099511627776 }"#).unwrap();
        unsafe {
            assert!(tempo_sync_create_with_config(2, 48000, broken.as_ptr()).is_null());
            assert!(tempo_sync_create_with_config(2, 48000, invalid.as_ptr()).is_null());
            assert!(tempo_sync_create_with_config(2, 48000, oversized.as_ptr()).is_null());
            assert!(tempo_sync_create_with_config(2, 48000, std::ptr::null()).is_null());
        }
    }

    #[test]
    fn unknown_preset_returns_null() {
        let name = CString::new("polka").unwrap();
        unsafe {
            assert!(tempo_sync_create_with_preset(2, 48000, name.as_ptr()).is_null());
            assert!(tempo_sync_create_with_preset(2, 48000, std::ptr::null()).is_null());
        }
    }

    #[test]
    fn guard_absorbs_panics() {
        assert_eq!(guard(-1.0f32, || panic!("boom")), -1.0);
        assert_eq!(guard(3, || 7), 7);
    }
}
