//! Peak meter for audio played by other processes

use super::{platform, MixerError};
use parking_lot::Mutex;

/// Default per-read release multiplier (~0.5 s to halve when polled at 60 Hz)
const DEFAULT_RELEASE: f32 = 0.977;

/// Level follower with instant attack and exponential release.
#[derive(Debug, Clone, Copy)]
pub struct PeakFollower {
    value: f32,
    release: f32,
}

impl PeakFollower {
    pub fn new(release: f32) -> Self {
        Self {
            value: 0.0,
            release: release.clamp(0.0, 1.0),
        }
    }

    /// Feed an instantaneous peak in [0, 1] and return the followed level.
    pub fn process(&mut self, peak: f32) -> f32 {
        let peak = if peak.is_finite() { peak.clamp(0.0, 1.0) } else { 0.0 };
        self.value = peak.max(self.value * self.release);
        self.value
    }

    pub fn value(&self) -> f32 {
        self.value
    }

    pub fn reset(&mut self) {
        self.value = 0.0;
    }
}

impl Default for PeakFollower {
    fn default() -> Self {
        Self::new(DEFAULT_RELEASE)
    }
}

/// Peak level of every render session except our own process.
pub struct OutsideMeter {
    own_pid: u32,
    follower: Mutex<PeakFollower>,
}

impl OutsideMeter {
    pub fn new() -> Self {
        Self {
            own_pid: std::process::id(),
            follower: Mutex::new(PeakFollower::default()),
        }
    }

    /// Poll the session peaks and return the followed level.
    pub fn read(&self) -> Result<f32, MixerError> {
        let peak = platform::outside_peak(self.own_pid)?;
        Ok(self.follower.lock().process(peak))
    }
}

impl Default for OutsideMeter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attack_is_instant() {
        let mut follower = PeakFollower::new(0.9);
        assert_eq!(follower.process(0.7), 0.7);
    }

    #[test]
    fn release_decays_geometrically() {
        let mut follower = PeakFollower::new(0.5);
        follower.process(0.8);
        assert_eq!(follower.process(0.0), 0.4);
        assert_eq!(follower.process(0.0), 0.2);
        assert_eq!(follower.process(0.3), 0.3);
    }

    #[test]
    fn input_is_clamped_to_unit_range() {
        let mut follower = PeakFollower::default();
        assert_eq!(follower.process(3.0), 1.0);
        follower.reset();
        assert_eq!(follower.process(-1.0), 0.0);
        assert_eq!(follower.process(f32::NAN), 0.0);
    }

    #[cfg(not(target_os = "windows"))]
    #[test]
    fn outside_meter_is_unsupported_off_windows() {
        let meter = OutsideMeter::new();
        assert!(matches!(meter.read(), Err(MixerError::Unsupported(_))));
    }
}
