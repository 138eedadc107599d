//! Streaming tempo analyzer
//!
//! Owns the rolling window, onset detector, candidate set and beat predictor
//! and advances them once per `update()`. All queries read the snapshot
//! published at the end of the last update (or reset), so they never compute
//! and always see a consistent state.

use super::{
    AnalyzerConfig, BeatPredictor, FrameSource, OnsetDetector, SignalWindow, TempoCandidateSet,
};
use thiserror::Error;

/// Highest channel count accepted at construction
const MAX_CHANNELS: usize = 32;

/// Tempo analyzer errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AnalyzerError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid channel count: {0}")]
    InvalidChannelCount(usize),

    #[error("Invalid sample rate: {0} Hz")]
    InvalidSampleRate(u32),

    #[error("Channel {index} out of range ({channels} channels)")]
    ChannelOutOfRange { index: usize, channels: usize },

    #[error("Candidate {index} out of range ({capacity} slots)")]
    CandidateOutOfRange { index: usize, capacity: usize },

    #[error("Capture delivers {found} channels, analyzer expects {expected}")]
    ChannelMismatch { found: usize, expected: usize },

    #[error("Not enough audio analyzed yet")]
    InsufficientData,

    #[error("Tempo not known yet")]
    UnknownTempo,
}

/// Read-only view of the analyzer as of the last update.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnalyzerSnapshot {
    bpm: Option<f32>,
    scores: Vec<f32>,
    vus: Vec<f32>,
    rms: Vec<f32>,
    window_len: usize,
    window_size: usize,
    ms_to_next_beat: f32,
    elapsed_frames: u64,
}

impl AnalyzerSnapshot {
    /// Tempo of the selected candidate.
    pub fn try_bpm(&self) -> Result<f32, AnalyzerError> {
        self.bpm.ok_or(AnalyzerError::UnknownTempo)
    }

    /// Confidence of the candidate in slot `index`.
    pub fn try_bpm_score(&self, index: usize) -> Result<f32, AnalyzerError> {
        self.scores
            .get(index)
            .copied()
            .ok_or(AnalyzerError::CandidateOutOfRange {
                index,
                capacity: self.scores.len(),
            })
    }

    /// Pulse strength of the candidate in slot `index`.
    pub fn try_bpm_vu(&self, index: usize) -> Result<f32, AnalyzerError> {
        self.vus
            .get(index)
            .copied()
            .ok_or(AnalyzerError::CandidateOutOfRange {
                index,
                capacity: self.vus.len(),
            })
    }

    /// RMS of `channel` over the current window.
    pub fn try_rms(&self, channel: usize) -> Result<f32, AnalyzerError> {
        let value = self
            .rms
            .get(channel)
            .copied()
            .ok_or(AnalyzerError::ChannelOutOfRange {
                index: channel,
                channels: self.rms.len(),
            })?;
        if self.window_len == 0 {
            return Err(AnalyzerError::InsufficientData);
        }
        Ok(value)
    }

    /// Milliseconds until the next predicted beat, 0.0 while the tempo is unknown.
    pub fn ms_to_next_beat(&self) -> f32 {
        self.ms_to_next_beat
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    pub fn candidate_count(&self) -> usize {
        self.scores.len()
    }

    pub fn elapsed_frames(&self) -> u64 {
        self.elapsed_frames
    }
}

/// The tempo tracking engine.
pub struct Analyzer {
    config: AnalyzerConfig,
    channels: usize,
    sample_rate: u32,

    window: SignalWindow,
    onset: OnsetDetector,
    candidates: TempoCandidateSet,
    predictor: BeatPredictor,

    /// One tick of interleaved frames pulled from the source
    tick_buffer: Vec<f32>,

    /// Frames analyzed since reset
    elapsed_frames: u64,

    /// Ticks padded with silence because the source fell behind
    underruns: u64,

    snapshot: AnalyzerSnapshot,
}

impl Analyzer {
    /// Create an analyzer for a fixed channel count and sample rate.
    pub fn new(
        channels: usize,
        sample_rate: u32,
        config: AnalyzerConfig,
    ) -> Result<Self, AnalyzerError> {
        if channels == 0 || channels > MAX_CHANNELS {
            return Err(AnalyzerError::InvalidChannelCount(channels));
        }
        if sample_rate == 0 {
            return Err(AnalyzerError::InvalidSampleRate(sample_rate));
        }
        config.validate()?;

        log::info!(
            "Tempo analyzer: {} Hz, {} channels, window {} frames, hop {} frames, {} candidates, {:.0}-{:.0} BPM",
            sample_rate,
            channels,
            config.window_size,
            config.hop_size,
            config.candidate_count,
            config.min_bpm,
            config.max_bpm
        );

        let mut analyzer = Self {
            window: SignalWindow::new(channels, config.window_size),
            onset: OnsetDetector::new(config.ema_alpha, config.energy_floor),
            candidates: TempoCandidateSet::new(&config),
            predictor: BeatPredictor::new(),
            tick_buffer: vec![0.0; config.hop_size * channels],
            elapsed_frames: 0,
            underruns: 0,
            snapshot: AnalyzerSnapshot {
                scores: Vec::with_capacity(config.candidate_count),
                vus: Vec::with_capacity(config.candidate_count),
                rms: Vec::with_capacity(channels),
                window_size: config.window_size,
                ..Default::default()
            },
            config,
            channels,
            sample_rate,
        };
        analyzer.publish();
        Ok(analyzer)
    }

    pub fn config(&self) -> &AnalyzerConfig {
        &self.config
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn window_size(&self) -> usize {
        self.config.window_size
    }

    pub fn candidates(&self) -> &TempoCandidateSet {
        &self.candidates
    }

    pub fn underruns(&self) -> u64 {
        self.underruns
    }

    /// State as of the last update or reset.
    pub fn snapshot(&self) -> &AnalyzerSnapshot {
        &self.snapshot
    }

    /// Clear all derived state; configuration and allocations are kept.
    pub fn reset(&mut self) {
        self.window.clear();
        self.onset.reset();
        self.candidates.reset();
        self.predictor.reset();
        self.tick_buffer.fill(0.0);
        self.elapsed_frames = 0;
        self.underruns = 0;
        self.publish();
        log::debug!("Tempo analyzer reset");
    }

    /// Pull one tick of audio from `source` and advance the analysis.
    ///
    /// Frames the source cannot deliver are treated as silence so the clock
    /// keeps running in step with the host.
    pub fn update<S: FrameSource + ?Sized>(&mut self, source: &mut S) -> Result<(), AnalyzerError> {
        if source.channels() != self.channels {
            return Err(AnalyzerError::ChannelMismatch {
                found: source.channels(),
                expected: self.channels,
            });
        }

        let mut tick = std::mem::take(&mut self.tick_buffer);
        let frames = source.read_frames(&mut tick).min(self.config.hop_size);
        if frames < self.config.hop_size {
            tick[frames * self.channels..].fill(0.0);
            self.underruns += 1;
            if self.underruns.is_power_of_two() {
                log::debug!(
                    "Capture underrun: {} of {} frames ({} underruns so far)",
                    frames,
                    self.config.hop_size,
                    self.underruns
                );
            }
        }

        self.process_tick(&tick);
        self.tick_buffer = tick;
        Ok(())
    }

    /// Advance the analysis by one tick of interleaved frames.
    pub fn process_tick(&mut self, interleaved: &[f32]) {
        let frames = interleaved.len() / self.channels;
        if frames == 0 {
            return;
        }

        self.window.push_interleaved(interleaved);
        self.elapsed_frames += frames as u64;

        let strength = self.onset.process(self.window.mean_square());
        let dt = frames as f64 / self.sample_rate as f64;
        self.candidates.advance(strength, dt);
        self.predictor.update(self.candidates.selected());

        self.publish();
    }

    fn publish(&mut self) {
        let snapshot = &mut self.snapshot;

        snapshot.bpm = self.candidates.selected().map(|c| c.bpm);

        snapshot.scores.clear();
        snapshot
            .scores
            .extend(self.candidates.candidates().iter().map(|c| c.score));
        snapshot.vus.clear();
        snapshot
            .vus
            .extend(self.candidates.candidates().iter().map(|c| c.vu));

        snapshot.rms.clear();
        for channel in 0..self.channels {
            snapshot.rms.push(self.window.rms(channel).unwrap_or(0.0));
        }
        snapshot.window_len = self.window.len();
        snapshot.ms_to_next_beat = self.predictor.ms_to_next_beat();
        snapshot.elapsed_frames = self.elapsed_frames;
    }
}
