//! Energy-flux onset detection

/// Onset strength from positive energy deviation against a trailing average.
///
/// Each tick compares the window's short-term energy with an exponential
/// moving average of past energy. The strength is the relative rise,
/// `max(0, energy - ema) / (ema + floor)`, so it is level independent and
/// zero whenever energy falls.
pub struct OnsetDetector {
    /// EMA coefficient per tick
    alpha: f32,
    /// Keeps the ratio defined when the average is near zero
    floor: f32,
    /// Trailing energy average
    ema: f32,
    /// Most recent strength
    strength: f32,
}

impl OnsetDetector {
    pub fn new(alpha: f32, floor: f32) -> Self {
        Self {
            alpha,
            floor,
            ema: 0.0,
            strength: 0.0,
        }
    }

    /// Feed one tick's short-term energy and return its onset strength.
    pub fn process(&mut self, energy: f32) -> f32 {
        let energy = if energy.is_finite() { energy.max(0.0) } else { 0.0 };

        let rise = (energy - self.ema).max(0.0);
        self.strength = rise / (self.ema + self.floor);

        self.ema += self.alpha * (energy - self.ema);
        self.strength
    }

    /// Strength produced by the last `process()` call.
    pub fn strength(&self) -> f32 {
        self.strength
    }

    /// Current trailing energy average.
    pub fn average_energy(&self) -> f32 {
        self.ema
    }

    /// Reset all detector state.
    pub fn reset(&mut self) {
        self.ema = 0.0;
        self.strength = 0.0;
    }
}
