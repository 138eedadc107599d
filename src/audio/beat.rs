//! Next-beat prediction from the selected tempo candidate

use super::TempoCandidate;

/// Milliseconds until the selected candidate's phase wraps to the next beat.
#[derive(Debug, Clone, Copy, Default)]
pub struct BeatPredictor {
    ms_to_next_beat: f32,
    beat_period_ms: f32,
}

impl BeatPredictor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refresh the prediction; `None` means the tempo is unknown.
    pub fn update(&mut self, selected: Option<&TempoCandidate>) {
        let Some(candidate) = selected.filter(|c| c.bpm > 0.0 && c.bpm.is_finite()) else {
            self.reset();
            return;
        };

        let period = 60_000.0 / candidate.bpm;
        let phase = candidate.phase.clamp(0.0, 1.0);
        let mut remaining = (1.0 - phase) * period;
        // A candidate sitting exactly on the beat is at the beat, not a period away
        if remaining >= period {
            remaining = 0.0;
        }

        self.beat_period_ms = period;
        self.ms_to_next_beat = remaining.max(0.0);
    }

    /// Milliseconds to the next predicted beat, 0.0 when the tempo is unknown.
    pub fn ms_to_next_beat(&self) -> f32 {
        self.ms_to_next_beat
    }

    /// Length of one beat in milliseconds, 0.0 when the tempo is unknown.
    pub fn beat_period_ms(&self) -> f32 {
        self.beat_period_ms
    }

    pub fn reset(&mut self) {
        self.ms_to_next_beat = 0.0;
        self.beat_period_ms = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(bpm: f32, phase: f32) -> TempoCandidate {
        TempoCandidate {
            bpm,
            phase,
            score: 0.8,
            ..Default::default()
        }
    }

    #[test]
    fn unknown_tempo_predicts_zero() {
        let mut predictor = BeatPredictor::new();
        predictor.update(None);
        assert_eq!(predictor.ms_to_next_beat(), 0.0);
        assert_eq!(predictor.beat_period_ms(), 0.0);
    }

    #[test]
    fn quarter_phase_at_120_bpm_leaves_375_ms() {
        let mut predictor = BeatPredictor::new();
        predictor.update(Some(&candidate(120.0, 0.25)));

        assert!((predictor.ms_to_next_beat() - 375.0).abs() < 1e-3);
        assert!((predictor.beat_period_ms() - 500.0).abs() < 1e-3);
    }

    #[test]
    fn zero_phase_is_on_the_beat() {
        let mut predictor = BeatPredictor::new();
        predictor.update(Some(&candidate(120.0, 0.0)));
        assert_eq!(predictor.ms_to_next_beat(), 0.0);
    }

    #[test]
    fn prediction_stays_inside_one_period() {
        let mut predictor = BeatPredictor::new();
        for i in 0..100 {
            let phase = i as f32 / 100.0;
            predictor.update(Some(&candidate(97.0, phase)));
            let ms = predictor.ms_to_next_beat();
            assert!(ms >= 0.0 && ms < 60_000.0 / 97.0, "phase {phase} gave {ms}");
        }
    }

    #[test]
    fn empty_candidate_is_treated_as_unknown() {
        let mut predictor = BeatPredictor::new();
        predictor.update(Some(&candidate(120.0, 0.5)));
        predictor.update(Some(&TempoCandidate::default()));
        assert_eq!(predictor.ms_to_next_beat(), 0.0);
    }
}
