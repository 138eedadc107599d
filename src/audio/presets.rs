//! Built-in tempo presets for different music styles

use serde::{Deserialize, Serialize};

/// Tempo preset for tuning the tracker to a music style
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TempoPreset {
    pub name: String,
    pub min_bpm: f32,
    pub max_bpm: f32,
    pub onset_threshold: f32,
    pub score_decay: f32,
    pub phase_tolerance: f32,
}

/// Return all built-in presets
pub fn get_presets() -> Vec<TempoPreset> {
    vec![
        TempoPreset {
            name: "auto".to_string(),
            min_bpm: 60.0,
            max_bpm: 200.0,
            onset_threshold: 0.5,
            score_decay: 0.998,
            phase_tolerance: 0.12,
        },
        TempoPreset {
            name: "edm".to_string(),
            min_bpm: 100.0,
            max_bpm: 180.0,
            onset_threshold: 0.4,
            score_decay: 0.999,
            phase_tolerance: 0.10,
        },
        TempoPreset {
            name: "hiphop".to_string(),
            min_bpm: 70.0,
            max_bpm: 115.0,
            onset_threshold: 0.45,
            score_decay: 0.998,
            phase_tolerance: 0.12,
        },
        TempoPreset {
            name: "rock".to_string(),
            min_bpm: 90.0,
            max_bpm: 170.0,
            onset_threshold: 0.5,
            score_decay: 0.998,
            phase_tolerance: 0.12,
        },
        TempoPreset {
            name: "chill".to_string(),
            min_bpm: 60.0,
            max_bpm: 120.0,
            onset_threshold: 0.6,
            score_decay: 0.997,
            phase_tolerance: 0.15,
        },
        TempoPreset {
            name: "classical".to_string(),
            min_bpm: 40.0,
            max_bpm: 160.0,
            onset_threshold: 0.8,
            score_decay: 0.996,
            phase_tolerance: 0.18,
        },
    ]
}

/// Look up a preset by name (case-insensitive), returning None if not found
pub fn get_preset(name: &str) -> Option<TempoPreset> {
    let lower = name.to_lowercase();
    get_presets().into_iter().find(|p| p.name == lower)
}
