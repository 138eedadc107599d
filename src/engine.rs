//! Host-facing engine
//!
//! Ties a capture source to an [`Analyzer`] and publishes the analyzer's
//! snapshot for readers. One thread drives `update()`; any number of threads
//! may query. Queries only lock the published snapshot, never the analyzer,
//! so they cannot observe a half-finished update.
//!
//! This is the layer where internal errors become the neutral values the
//! host expects: -1 for an unknown tempo, 0.0 for everything else.

use crate::audio::{
    Analyzer, AnalyzerConfig, AnalyzerError, AnalyzerSnapshot, CaptureError, FrameSource,
    LoopbackCapture, OutsideMeter, SessionVolume,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

/// Audio buffered before the first update succeeds
const CAPTURE_PREPARE_MS: u32 = 32;

/// Capture backlog kept before the oldest audio is dropped
const CAPTURE_MAX_MS: u32 = 500;

/// Engine construction errors
#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Analyzer(#[from] AnalyzerError),

    #[error(transparent)]
    Capture(#[from] CaptureError),
}

/// State touched only by the writer
struct Writer {
    source: Box<dyn FrameSource>,
    analyzer: Analyzer,
    /// Source drop counter as of the last update
    dropped_frames: u64,
    /// Updates during which the source dropped frames
    overflows: u64,
}

pub struct Engine {
    writer: Mutex<Writer>,
    published: Mutex<AnalyzerSnapshot>,
    meter: OutsideMeter,
    volume: SessionVolume,
    meter_warned: AtomicBool,
}

impl Engine {
    /// Analyze loopback audio of the default output device.
    ///
    /// `channels` and `sample_rate` are what the host expects; the analyzer
    /// always runs at the device's own format.
    pub fn start(channels: u32, sample_rate: u32, config: AnalyzerConfig) -> Result<Self, EngineError> {
        config.validate()?;
        let capture = LoopbackCapture::start(CAPTURE_PREPARE_MS, CAPTURE_MAX_MS)?;

        if capture.sample_rate() != sample_rate {
            log::warn!(
                "Host requested {} Hz, device runs at {} Hz; analyzing at device rate",
                sample_rate,
                capture.sample_rate()
            );
        }
        if capture.channels() != channels as usize {
            log::warn!(
                "Host requested {} channels, device has {}; analyzing device channels",
                channels,
                capture.channels()
            );
        }

        Ok(Self::with_source(Box::new(capture), config)?)
    }

    /// Analyze audio from any frame source.
    pub fn with_source(
        source: Box<dyn FrameSource>,
        config: AnalyzerConfig,
    ) -> Result<Self, AnalyzerError> {
        let analyzer = Analyzer::new(source.channels(), source.sample_rate(), config)?;
        let published = analyzer.snapshot().clone();
        Ok(Self {
            writer: Mutex::new(Writer {
                source,
                analyzer,
                dropped_frames: 0,
                overflows: 0,
            }),
            published: Mutex::new(published),
            meter: OutsideMeter::new(),
            volume: SessionVolume::new(),
            meter_warned: AtomicBool::new(false),
        })
    }

    /// Return the analysis to its cold-start state.
    pub fn reset(&self) {
        let mut writer = self.writer.lock();
        writer.analyzer.reset();
        self.published.lock().clone_from(writer.analyzer.snapshot());
    }

    /// Run one analysis tick.
    pub fn update(&self) -> Result<(), AnalyzerError> {
        let mut writer = self.writer.lock();
        let Writer {
            source,
            analyzer,
            dropped_frames,
            overflows,
        } = &mut *writer;
        analyzer.update(source.as_mut())?;
        self.published.lock().clone_from(analyzer.snapshot());

        let dropped = source.dropped_frames();
        if dropped > *dropped_frames {
            *dropped_frames = dropped;
            *overflows += 1;
            if overflows.is_power_of_two() {
                log::debug!(
                    "Capture backlog overflowed: {} frames dropped, {} source underruns, {} padded ticks",
                    dropped,
                    source.underruns(),
                    analyzer.underruns()
                );
            }
        }
        Ok(())
    }

    /// Copy of the last published snapshot.
    pub fn snapshot(&self) -> AnalyzerSnapshot {
        self.published.lock().clone()
    }

    /// Selected tempo, or -1.0 while unknown.
    pub fn bpm(&self) -> f32 {
        self.published.lock().try_bpm().unwrap_or(-1.0)
    }

    pub fn bpm_score(&self, index: usize) -> f32 {
        self.published.lock().try_bpm_score(index).unwrap_or(0.0)
    }

    pub fn bpm_vu(&self, index: usize) -> f32 {
        self.published.lock().try_bpm_vu(index).unwrap_or(0.0)
    }

    pub fn rms(&self, channel: usize) -> f32 {
        self.published.lock().try_rms(channel).unwrap_or(0.0)
    }

    pub fn ms_to_next_beat(&self) -> f32 {
        self.published.lock().ms_to_next_beat()
    }

    pub fn window_size(&self) -> usize {
        self.published.lock().window_size()
    }

    pub fn candidate_count(&self) -> usize {
        self.published.lock().candidate_count()
    }

    /// Followed peak of audio played by other processes, 0.0 if unavailable.
    pub fn outside_peak_meter(&self) -> f32 {
        match self.meter.read() {
            Ok(level) => level,
            Err(e) => {
                if !self.meter_warned.swap(true, Ordering::Relaxed) {
                    log::warn!("Outside peak meter unavailable: {}", e);
                }
                0.0
            }
        }
    }

    /// Set the volume of every audio session of `pid`; failures are logged.
    pub fn set_process_volume(&self, pid: u32, value: f32) {
        if let Err(e) = self.volume.set_process_volume(pid, value) {
            log::warn!("Failed to set volume of process {}: {}", pid, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::CaptureBuffer;
    use std::sync::Arc;

    fn engine_with_buffer() -> (Engine, Arc<Mutex<CaptureBuffer>>) {
        let buffer = Arc::new(Mutex::new(CaptureBuffer::new(2, 48000, 0, 48000)));
        let engine = Engine::with_source(Box::new(buffer.clone()), AnalyzerConfig::default())
            .unwrap();
        (engine, buffer)
    }

    /// Stereo 120 BPM clicks, `seconds` long.
    fn clicks(seconds: usize) -> Vec<f32> {
        let period = 24000;
        (0..48000 * seconds)
            .flat_map(|i| {
                let s = if i % period < 480 {
                    0.8 * (2.0 * std::f32::consts::PI * (i % period) as f32 / 48.0).sin()
                } else {
                    0.0
                };
                [s, s]
            })
            .collect()
    }

    /// Push audio in hop-sized pieces, updating after each one.
    fn play(engine: &Engine, buffer: &Mutex<CaptureBuffer>, data: &[f32]) {
        for chunk in data.chunks(512 * 2) {
            buffer.lock().push_interleaved(chunk);
            engine.update().unwrap();
        }
    }

    #[test]
    fn cold_start_returns_neutral_values() {
        let (engine, _) = engine_with_buffer();

        assert_eq!(engine.bpm(), -1.0);
        assert_eq!(engine.bpm_score(0), 0.0);
        assert_eq!(engine.bpm_score(99), 0.0);
        assert_eq!(engine.bpm_vu(99), 0.0);
        assert_eq!(engine.rms(0), 0.0);
        assert_eq!(engine.rms(5), 0.0);
        assert_eq!(engine.ms_to_next_beat(), 0.0);
        assert_eq!(engine.window_size(), 1024);
        assert_eq!(engine.candidate_count(), 4);
    }

    #[test]
    fn updates_publish_analysis() {
        let (engine, buffer) = engine_with_buffer();
        play(&engine, &buffer, &clicks(16));

        let bpm = engine.bpm();
        assert!((bpm - 120.0).abs() <= 2.0, "got {bpm}");
        let ms = engine.ms_to_next_beat();
        assert!(ms >= 0.0 && ms < 60_000.0 / bpm);
    }

    #[test]
    fn reset_clears_published_state() {
        let (engine, buffer) = engine_with_buffer();
        play(&engine, &buffer, &clicks(16));
        assert!(engine.bpm() > 0.0);

        engine.reset();

        assert_eq!(engine.bpm(), -1.0);
        assert_eq!(engine.rms(0), 0.0);
        assert_eq!(engine.rms(1), 0.0);
        assert_eq!(engine.ms_to_next_beat(), 0.0);
        assert_eq!(engine.snapshot().elapsed_frames(), 0);
    }

    #[test]
    fn readers_see_whole_snapshots_while_writer_runs() {
        let (engine, buffer) = engine_with_buffer();
        let audio = clicks(8);

        std::thread::scope(|scope| {
            scope.spawn(|| play(&engine, &buffer, &audio));
            scope.spawn(|| {
                for _ in 0..2000 {
                    let snapshot = engine.snapshot();
                    assert_eq!(snapshot.candidate_count(), 4);
                    assert_eq!(snapshot.elapsed_frames() % 512, 0);
                    if let Ok(bpm) = snapshot.try_bpm() {
                        assert!(snapshot.ms_to_next_beat() < 60_000.0 / bpm);
                    }
                }
            });
        });
    }

    #[test]
    fn update_tracks_capture_overflow() {
        let buffer = Arc::new(Mutex::new(CaptureBuffer::new(2, 48000, 0, 1024)));
        let engine = Engine::with_source(Box::new(buffer.clone()), AnalyzerConfig::default())
            .unwrap();

        buffer.lock().push_interleaved(&vec![0.25; 4096 * 2]);
        engine.update().unwrap();
        {
            let writer = engine.writer.lock();
            assert_eq!(writer.dropped_frames, 3072);
            assert_eq!(writer.overflows, 1);
        }

        engine.update().unwrap();
        let writer = engine.writer.lock();
        assert_eq!(writer.dropped_frames, 3072);
        assert_eq!(writer.overflows, 1);
    }

    #[test]
    fn underruns_keep_the_engine_running() {
        let (engine, _) = engine_with_buffer();
        for _ in 0..10 {
            engine.update().unwrap();
        }
        assert_eq!(engine.snapshot().elapsed_frames(), 10 * 512);
        assert_eq!(engine.rms(0), 0.0);
    }
}
