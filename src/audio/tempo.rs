//! Multi-hypothesis tempo tracking
//!
//! A fixed bank of phase-locked oscillators, one per tempo candidate. Every
//! tick each oscillator advances its phase and loses a little confidence;
//! every detected onset rewards the oscillators that predicted it and
//! penalizes the rest. New hypotheses come from scanning the BPM range
//! against the recent onset intervals.

use super::{AnalyzerConfig, AnalyzerError};

/// One tempo hypothesis.
///
/// An empty slot has `bpm == 0.0` and is never selected.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TempoCandidate {
    /// Tempo in beats per minute
    pub bpm: f32,
    /// Long-term confidence in [0, 1]
    pub score: f32,
    /// Position within the beat, [0, 1)
    pub phase: f32,
    /// Short-term pulse strength at this candidate's rate
    pub vu: f32,
    /// Ticks since the hypothesis entered its slot
    pub age: u32,
    /// Onsets that landed inside the phase window
    pub hits: u32,
}

impl TempoCandidate {
    fn seeded(bpm: f32, score: f32) -> Self {
        Self {
            bpm,
            score,
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.bpm <= 0.0
    }

    /// Signed distance to the nearest beat, in beats, within [-0.5, 0.5).
    fn phase_error(&self) -> f32 {
        if self.phase >= 0.5 {
            self.phase - 1.0
        } else {
            self.phase
        }
    }
}

/// Fixed-capacity arena of tempo candidates plus the onset history that
/// feeds discovery.
pub struct TempoCandidateSet {
    config: AnalyzerConfig,
    slots: Vec<TempoCandidate>,

    /// Onset times in seconds since reset (ring, unordered once full)
    onsets: Vec<f64>,
    onset_head: usize,
    onset_count: usize,
    last_onset: Option<f64>,

    /// Seconds since reset
    time: f64,

    /// Consecutive ticks with the best score under `min_confidence`
    low_confidence_ticks: u32,

    /// Some candidate exceeded `min_confidence` since reset
    locked: bool,
}

impl TempoCandidateSet {
    pub fn new(config: &AnalyzerConfig) -> Self {
        Self {
            config: config.clone(),
            slots: vec![TempoCandidate::default(); config.candidate_count],
            onsets: vec![0.0; config.onset_history],
            onset_head: 0,
            onset_count: 0,
            last_onset: None,
            time: 0.0,
            low_confidence_ticks: 0,
            locked: false,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn candidates(&self) -> &[TempoCandidate] {
        &self.slots
    }

    pub fn candidate(&self, index: usize) -> Result<&TempoCandidate, AnalyzerError> {
        self.slots
            .get(index)
            .ok_or(AnalyzerError::CandidateOutOfRange {
                index,
                capacity: self.slots.len(),
            })
    }

    /// Highest-scoring occupied slot; ties go to the lowest index.
    pub fn best(&self) -> Option<(usize, &TempoCandidate)> {
        let mut best: Option<(usize, &TempoCandidate)> = None;
        for (i, candidate) in self.slots.iter().enumerate() {
            if candidate.is_empty() {
                continue;
            }
            match best {
                Some((_, current)) if candidate.score <= current.score => {}
                _ => best = Some((i, candidate)),
            }
        }
        best
    }

    /// The candidate reported to the host, once a tempo has been trusted.
    pub fn selected(&self) -> Option<&TempoCandidate> {
        if !self.locked {
            return None;
        }
        self.best().map(|(_, candidate)| candidate)
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Onsets currently held in the history
    pub fn onset_count(&self) -> usize {
        self.onset_count
    }

    /// Seconds of audio seen since reset
    pub fn elapsed_secs(&self) -> f64 {
        self.time
    }

    /// Advance one tick of `dt` seconds with the tick's onset strength.
    ///
    /// Returns whether the tick was gated as an onset.
    pub fn advance(&mut self, strength: f32, dt: f64) -> bool {
        self.time += dt;

        let score_decay = self.config.score_decay;
        let vu_decay = self.config.vu_decay;
        for candidate in self.slots.iter_mut().filter(|c| !c.is_empty()) {
            let step = (dt * candidate.bpm as f64 / 60.0) as f32;
            candidate.phase = (candidate.phase + step).rem_euclid(1.0);
            candidate.score *= score_decay;
            candidate.vu *= vu_decay;
            candidate.age = candidate.age.saturating_add(1);
        }

        let is_onset = self.gate(strength);
        if is_onset {
            self.record_onset();
            self.apply_onset(strength);
        }

        for candidate in &mut self.slots {
            candidate.score = candidate.score.clamp(0.0, 1.0);
        }
        self.drop_duplicates();

        let best_score = self.best().map(|(_, c)| c.score).unwrap_or(0.0);
        if !self.locked && best_score > self.config.min_confidence {
            self.locked = true;
            if let Some((index, candidate)) = self.best() {
                log::info!(
                    "Tempo locked: {:.1} BPM (slot {}, score {:.2})",
                    candidate.bpm,
                    index,
                    candidate.score
                );
            }
        }
        if best_score < self.config.min_confidence {
            self.low_confidence_ticks = self.low_confidence_ticks.saturating_add(1);
        } else {
            self.low_confidence_ticks = 0;
        }

        if is_onset && self.discovery_armed() {
            self.discover();
        }

        is_onset
    }

    /// Clear every candidate and the onset history, keeping allocations.
    pub fn reset(&mut self) {
        self.slots.fill(TempoCandidate::default());
        self.onsets.fill(0.0);
        self.onset_head = 0;
        self.onset_count = 0;
        self.last_onset = None;
        self.time = 0.0;
        self.low_confidence_ticks = 0;
        self.locked = false;
    }

    fn gate(&self, strength: f32) -> bool {
        if strength.is_nan() || strength < self.config.onset_threshold {
            return false;
        }
        let min_interval = self.config.min_onset_interval_ms as f64 / 1000.0;
        self.last_onset
            .map(|last| self.time - last >= min_interval)
            .unwrap_or(true)
    }

    fn record_onset(&mut self) {
        self.onsets[self.onset_head] = self.time;
        self.onset_head = (self.onset_head + 1) % self.onsets.len();
        self.onset_count = (self.onset_count + 1).min(self.onsets.len());
        self.last_onset = Some(self.time);
    }

    fn apply_onset(&mut self, strength: f32) {
        let tolerance = self.config.phase_tolerance;
        let pulse = 1.0 - (-strength).exp();
        let (min_bpm, max_bpm) = (self.config.min_bpm, self.config.max_bpm);

        for candidate in self.slots.iter_mut().filter(|c| !c.is_empty()) {
            let error = candidate.phase_error();
            if error.abs() <= tolerance {
                let alignment = 1.0 - error.abs() / tolerance;
                candidate.score += self.config.hit_gain * alignment * (1.0 - candidate.score);
                candidate.vu = candidate.vu.max(alignment * pulse);
                candidate.phase =
                    (candidate.phase - self.config.phase_gain * error).rem_euclid(1.0);
                // Early onset (negative error) means the true tempo is faster
                candidate.bpm = (candidate.bpm * (1.0 - self.config.tempo_gain * error))
                    .clamp(min_bpm, max_bpm);
                candidate.hits = candidate.hits.saturating_add(1);
            } else {
                candidate.score *= self.config.miss_factor;
            }
        }
    }

    fn discovery_armed(&self) -> bool {
        !self.locked || self.low_confidence_ticks >= self.config.discovery_patience
    }

    fn discover(&mut self) {
        if self.onset_count < self.config.min_discovery_onsets {
            return;
        }
        let Some((bpm, fit)) = self.scan() else {
            return;
        };
        let seed = self.config.seed_fraction * fit;
        if seed <= f32::EPSILON {
            return;
        }

        let tolerance = self.config.merge_tolerance;
        if let Some(existing) = self
            .slots
            .iter_mut()
            .find(|c| !c.is_empty() && (c.bpm - bpm).abs() / c.bpm.max(bpm) <= tolerance)
        {
            existing.bpm = 0.75 * existing.bpm + 0.25 * bpm;
            existing.score = existing.score.max(seed);
            log::trace!("Scan confirmed {:.1} BPM (fit {:.2})", bpm, fit);
            return;
        }

        let weakest = self.weakest_slot();
        let current = self.slots[weakest];
        if current.is_empty() || seed > current.score {
            log::debug!(
                "New tempo hypothesis {:.1} BPM (fit {:.2}) in slot {}",
                bpm,
                fit,
                weakest
            );
            self.slots[weakest] = TempoCandidate::seeded(bpm, seed);
        } else {
            log::trace!(
                "Rejected {:.1} BPM hypothesis: seed {:.2} below slot {} score {:.2}",
                bpm,
                seed,
                weakest,
                current.score
            );
        }
    }

    /// Empty slots first, then the lowest score; ties go to the lowest index.
    fn weakest_slot(&self) -> usize {
        let mut weakest = 0;
        let mut weakest_key = f32::INFINITY;
        for (i, candidate) in self.slots.iter().enumerate() {
            let key = if candidate.is_empty() {
                -1.0
            } else {
                candidate.score
            };
            if key < weakest_key {
                weakest = i;
                weakest_key = key;
            }
        }
        weakest
    }

    /// Best BPM of the scan range and its normalized fit in [0, 1].
    ///
    /// Each onset pair interval votes for periods it is a small multiple of,
    /// weighted by `1 / multiple` so the fundamental beats its subdivisions.
    fn scan(&self) -> Option<(f32, f32)> {
        let onsets = &self.onsets[..self.onset_count];
        let n = onsets.len();
        let max_multiple = self.config.max_multiple as usize;

        // Fit of a perfectly periodic train of the same length
        let ideal: f64 = (1..n.min(max_multiple + 1))
            .map(|k| (n - k) as f64 / k as f64)
            .sum();
        if ideal <= 0.0 {
            return None;
        }

        let sigma = self.config.interval_sigma_ms as f64 / 1000.0;
        let two_sigma_sq = 2.0 * sigma * sigma;
        let steps =
            ((self.config.max_bpm - self.config.min_bpm) / self.config.bpm_step).floor() as usize;

        let mut best: Option<(f32, f64)> = None;
        for step in 0..=steps {
            let bpm = self.config.min_bpm + step as f32 * self.config.bpm_step;
            let period = 60.0 / bpm as f64;

            let mut fit = 0.0;
            for (i, &a) in onsets.iter().enumerate() {
                for &b in &onsets[i + 1..] {
                    let interval = (b - a).abs();
                    let multiple = (interval / period).round();
                    if multiple < 1.0 || multiple > max_multiple as f64 {
                        continue;
                    }
                    let error = interval - multiple * period;
                    fit += (-(error * error) / two_sigma_sq).exp() / multiple;
                }
            }

            if best.map(|(_, b)| fit > b).unwrap_or(true) {
                best = Some((bpm, fit));
            }
        }

        best.map(|(bpm, fit)| (bpm, (fit / ideal).min(1.0) as f32))
    }

    /// PLL drift can walk two slots onto the same tempo; keep the stronger.
    fn drop_duplicates(&mut self) {
        let tolerance = self.config.merge_tolerance;
        for i in 0..self.slots.len() {
            for j in (i + 1)..self.slots.len() {
                let (a, b) = (self.slots[i], self.slots[j]);
                if a.is_empty() || b.is_empty() {
                    continue;
                }
                if (a.bpm - b.bpm).abs() / a.bpm.max(b.bpm) <= tolerance {
                    let weaker = if b.score > a.score { i } else { j };
                    self.slots[weaker] = TempoCandidate::default();
                }
            }
        }
    }
}
