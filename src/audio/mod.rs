//! Audio capture and tempo analysis module

mod analyzer;
mod beat;
mod capture;
mod meter;
mod mixer;
mod onset;
mod platform;
mod presets;
mod tempo;
mod window;

pub use analyzer::{Analyzer, AnalyzerError, AnalyzerSnapshot};
pub use beat::BeatPredictor;
pub use capture::{CaptureBuffer, CaptureError, FrameSource, LoopbackCapture};
pub use meter::{OutsideMeter, PeakFollower};
pub use mixer::{MixerError, SessionVolume};
pub use onset::OnsetDetector;
pub use presets::{get_preset, get_presets, TempoPreset};
pub use tempo::{TempoCandidate, TempoCandidateSet};
pub use window::SignalWindow;

use serde::{Deserialize, Serialize};

/// Largest window or hop accepted, in frames
const MAX_BUFFER_FRAMES: usize = 1 << 20;

/// Largest candidate bank accepted
const MAX_CANDIDATES: usize = 64;

/// Largest onset history accepted
const MAX_ONSET_HISTORY: usize = 256;

/// Most BPM hypotheses a single scan may test
const MAX_SCAN_STEPS: f32 = 10_000.0;

/// Tempo analysis configuration
///
/// Every tunable of the engine lives here. Missing fields fall back to the
/// defaults when deserializing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    /// Rolling window capacity in frames
    pub window_size: usize,

    /// Frames consumed per `update()` call
    pub hop_size: usize,

    /// Number of tempo candidate slots
    pub candidate_count: usize,

    /// Lower end of the tempo scan (BPM)
    pub min_bpm: f32,

    /// Upper end of the tempo scan (BPM)
    pub max_bpm: f32,

    /// Scan resolution (BPM)
    pub bpm_step: f32,

    /// Smoothing factor of the long-term energy average (0-1, per tick)
    pub ema_alpha: f32,

    /// Energy floor keeping the relative flux defined in silence
    pub energy_floor: f32,

    /// Onset strength needed to count a tick as an onset
    pub onset_threshold: f32,

    /// Refractory period between onsets
    pub min_onset_interval_ms: f32,

    /// Number of onset times kept for discovery
    pub onset_history: usize,

    /// Onsets required before a scan is attempted
    pub min_discovery_onsets: usize,

    /// Highest beat multiple an onset interval may span during a scan
    pub max_multiple: u32,

    /// Timing tolerance of the scan (gaussian sigma)
    pub interval_sigma_ms: f32,

    /// Fraction of the scan fit a new candidate starts with
    pub seed_fraction: f32,

    /// Relative BPM distance under which a hypothesis refines a candidate
    pub merge_tolerance: f32,

    /// Phase window (fraction of a beat) counting an onset as aligned
    pub phase_tolerance: f32,

    /// Score gain on an aligned onset
    pub hit_gain: f32,

    /// Score multiplier on a misaligned onset
    pub miss_factor: f32,

    /// Score multiplier applied every tick
    pub score_decay: f32,

    /// VU multiplier applied every tick
    pub vu_decay: f32,

    /// Phase correction gain on aligned onsets
    pub phase_gain: f32,

    /// Tempo correction gain on aligned onsets
    pub tempo_gain: f32,

    /// Score a candidate must exceed before a tempo is reported
    pub min_confidence: f32,

    /// Ticks of low confidence before the scan re-arms
    pub discovery_patience: u32,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            window_size: 1024,
            hop_size: 512,
            candidate_count: 4,
            min_bpm: 60.0,
            max_bpm: 200.0,
            bpm_step: 0.5,
            ema_alpha: 0.05,
            energy_floor: 1e-4,
            onset_threshold: 0.5,
            min_onset_interval_ms: 150.0,
            onset_history: 16,
            min_discovery_onsets: 4,
            max_multiple: 8,
            interval_sigma_ms: 20.0,
            seed_fraction: 0.3,
            merge_tolerance: 0.03,
            phase_tolerance: 0.12,
            hit_gain: 0.25,
            miss_factor: 0.9,
            score_decay: 0.998,
            vu_decay: 0.9,
            phase_gain: 0.5,
            tempo_gain: 0.05,
            min_confidence: 0.35,
            discovery_patience: 100,
        }
    }
}

impl AnalyzerConfig {
    /// Parse a configuration from JSON; absent fields keep their defaults.
    pub fn from_json(json: &str) -> Result<Self, AnalyzerError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| AnalyzerError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Build the default configuration with a preset's tempo tuning applied.
    pub fn with_preset(preset: &TempoPreset) -> Self {
        let mut config = Self::default();
        config.apply_preset(preset);
        config
    }

    /// Apply a preset's tunables, leaving buffer sizes untouched.
    pub fn apply_preset(&mut self, preset: &TempoPreset) {
        self.min_bpm = preset.min_bpm;
        self.max_bpm = preset.max_bpm;
        self.onset_threshold = preset.onset_threshold;
        self.score_decay = preset.score_decay;
        self.phase_tolerance = preset.phase_tolerance;
    }

    /// Check every tunable for a usable value.
    pub fn validate(&self) -> Result<(), AnalyzerError> {
        let invalid = |msg: &str| Err(AnalyzerError::InvalidConfig(msg.to_string()));

        if self.window_size == 0 || self.window_size > MAX_BUFFER_FRAMES {
            return invalid("window_size must be in 1..=1048576");
        }
        if self.hop_size == 0 || self.hop_size > MAX_BUFFER_FRAMES {
            return invalid("hop_size must be in 1..=1048576");
        }
        if self.candidate_count == 0 || self.candidate_count > MAX_CANDIDATES {
            return invalid("candidate_count must be in 1..=64");
        }
        if !self.min_bpm.is_finite() || !self.max_bpm.is_finite() {
            return invalid("bpm range must be finite");
        }
        if self.min_bpm <= 0.0 || self.max_bpm <= self.min_bpm {
            return invalid("bpm range must satisfy 0 < min_bpm < max_bpm");
        }
        if !self.bpm_step.is_finite() || self.bpm_step <= 0.0 {
            return invalid("bpm_step must be positive");
        }
        if (self.max_bpm - self.min_bpm) / self.bpm_step > MAX_SCAN_STEPS {
            return invalid("bpm range spans more than 10000 bpm_step increments");
        }
        if self.ema_alpha.is_nan() || self.ema_alpha <= 0.0 || self.ema_alpha > 1.0 {
            return invalid("ema_alpha must be in (0, 1]");
        }
        if !self.energy_floor.is_finite() || self.energy_floor <= 0.0 {
            return invalid("energy_floor must be positive");
        }
        if !self.onset_threshold.is_finite() || self.onset_threshold <= 0.0 {
            return invalid("onset_threshold must be positive");
        }
        if self.onset_history < 2 || self.min_discovery_onsets < 2 {
            return invalid("onset_history and min_discovery_onsets must be at least 2");
        }
        if self.onset_history > MAX_ONSET_HISTORY {
            return invalid("onset_history must not exceed 256");
        }
        if self.min_discovery_onsets > self.onset_history {
            return invalid("min_discovery_onsets cannot exceed onset_history");
        }
        if self.max_multiple == 0 {
            return invalid("max_multiple must be positive");
        }
        if !self.interval_sigma_ms.is_finite() || self.interval_sigma_ms <= 0.0 {
            return invalid("interval_sigma_ms must be positive");
        }
        if self.phase_tolerance.is_nan() || self.phase_tolerance <= 0.0 || self.phase_tolerance >= 0.5 {
            return invalid("phase_tolerance must be in (0, 0.5)");
        }
        for (name, value) in [
            ("seed_fraction", self.seed_fraction),
            ("hit_gain", self.hit_gain),
            ("miss_factor", self.miss_factor),
            ("score_decay", self.score_decay),
            ("vu_decay", self.vu_decay),
            ("phase_gain", self.phase_gain),
            ("tempo_gain", self.tempo_gain),
            ("min_confidence", self.min_confidence),
            ("merge_tolerance", self.merge_tolerance),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(AnalyzerError::InvalidConfig(format!(
                    "{} must be in [0, 1], got {}",
                    name, value
                )));
            }
        }
        if !self.min_onset_interval_ms.is_finite() || self.min_onset_interval_ms < 0.0 {
            return invalid("min_onset_interval_ms must not be negative");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = AnalyzerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.min_bpm, 60.0);
        assert_eq!(config.max_bpm, 200.0);
        assert_eq!(config.candidate_count, 4);
    }

    #[test]
    fn from_json_fills_missing_fields_with_defaults() {
        let config = AnalyzerConfig::from_json(r#"{ "candidate_count": 6, "min_bpm": 80.0 }"#)
            .expect("valid json");

        assert_eq!(config.candidate_count, 6);
        assert_eq!(config.min_bpm, 80.0);
        assert_eq!(config.window_size, AnalyzerConfig::default().window_size);
    }

    #[test]
    fn from_json_rejects_malformed_input() {
        let err = AnalyzerConfig::from_json("{ not json").unwrap_err();
        assert!(matches!(err, AnalyzerError::InvalidConfig(_)));
    }

    #[test]
    fn validate_rejects_inverted_bpm_range() {
        let config = AnalyzerConfig {
            min_bpm: 180.0,
            max_bpm: 90.0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(AnalyzerError::InvalidConfig(_))
        ));
    }

    #[test]
    fn validate_rejects_zero_window() {
        let config = AnalyzerConfig {
            window_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_out_of_range_gain() {
        let config = AnalyzerConfig {
            hit_gain: 1.5,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("hit_gain"));
    }

    fn rejects(config: AnalyzerConfig, field: &str) {
        match config.validate() {
            Err(AnalyzerError::InvalidConfig(msg)) => {
                assert!(msg.contains(field), "{msg} should name {field}")
            }
            other => panic!("expected {field} to be rejected, got {other:?}"),
        }
    }

    #[test]
    fn validate_caps_buffer_sizes() {
        rejects(
            AnalyzerConfig {
                window_size: 1 << 40,
                ..Default::default()
            },
            "window_size",
        );
        rejects(
            AnalyzerConfig {
                hop_size: MAX_BUFFER_FRAMES + 1,
                ..Default::default()
            },
            "hop_size",
        );
        let largest = AnalyzerConfig {
            window_size: MAX_BUFFER_FRAMES,
            hop_size: MAX_BUFFER_FRAMES,
            ..Default::default()
        };
        assert!(largest.validate().is_ok());
    }

    #[test]
    fn validate_caps_candidate_count() {
        rejects(
            AnalyzerConfig {
                candidate_count: MAX_CANDIDATES + 1,
                ..Default::default()
            },
            "candidate_count",
        );
    }

    #[test]
    fn validate_caps_onset_history() {
        rejects(
            AnalyzerConfig {
                onset_history: MAX_ONSET_HISTORY + 1,
                ..Default::default()
            },
            "onset_history",
        );
    }

    #[test]
    fn validate_caps_scan_steps() {
        rejects(
            AnalyzerConfig {
                bpm_step: 1e-6,
                ..Default::default()
            },
            "bpm_step",
        );
        // 140 BPM of range in 0.0141 steps stays just under the cap
        let finest = AnalyzerConfig {
            bpm_step: 0.0141,
            ..Default::default()
        };
        assert!(finest.validate().is_ok());
    }

    #[test]
    fn validate_rejects_nan_tunables() {
        rejects(
            AnalyzerConfig {
                min_bpm: f32::NAN,
                ..Default::default()
            },
            "bpm range",
        );
        rejects(
            AnalyzerConfig {
                onset_threshold: f32::NAN,
                ..Default::default()
            },
            "onset_threshold",
        );
        rejects(
            AnalyzerConfig {
                phase_tolerance: f32::NAN,
                ..Default::default()
            },
            "phase_tolerance",
        );
    }

    #[test]
    fn oversized_json_config_is_rejected_before_allocating() {
        let err = AnalyzerConfig::from_json(r#"{ "window_size": 1099511627776 }"#).unwrap_err();
        assert!(matches!(err, AnalyzerError::InvalidConfig(_)));
    }

    #[test]
    fn with_preset_keeps_buffer_sizes() {
        let edm = get_preset("edm").unwrap();
        let config = AnalyzerConfig::with_preset(&edm);

        assert_eq!(config.min_bpm, edm.min_bpm);
        assert_eq!(config.max_bpm, edm.max_bpm);
        assert_eq!(config.window_size, 1024);
        assert!(config.validate().is_ok());
    }
}
