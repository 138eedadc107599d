//! Tempo Sync
//!
//! Streaming tempo and beat tracker for system audio. Loopback audio of the
//! default output device is analyzed tick by tick: onsets are detected from
//! the energy flux of a rolling window and fed to a bank of phase-locked
//! tempo candidates, the strongest of which predicts the next beat.
//!
//! The [`ffi`] module exposes the engine to C hosts through an opaque handle.

pub mod audio;
pub mod engine;
pub mod ffi;

pub use audio::{Analyzer, AnalyzerConfig, AnalyzerError, AnalyzerSnapshot, FrameSource};
pub use engine::{Engine, EngineError};
