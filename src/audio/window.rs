//! Rolling multichannel sample window with O(1) RMS

use super::AnalyzerError;

/// Circular frame buffer with per-channel running sum of squares.
///
/// Frames are stored interleaved; `capacity` frames of `channels` samples.
pub struct SignalWindow {
    samples: Vec<f32>,
    sum_squares: Vec<f64>,
    channels: usize,
    capacity: usize,
    write_pos: usize,
    len: usize,
}

impl SignalWindow {
    pub fn new(channels: usize, capacity: usize) -> Self {
        Self {
            samples: vec![0.0; channels * capacity],
            sum_squares: vec![0.0; channels],
            channels,
            capacity,
            write_pos: 0,
            len: 0,
        }
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of frames currently held
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append one frame (one sample per channel), evicting the oldest once full.
    ///
    /// Missing channels are treated as silence, extra samples are ignored.
    pub fn push(&mut self, frame: &[f32]) {
        let base = self.write_pos * self.channels;
        for channel in 0..self.channels {
            let incoming = frame.get(channel).copied().unwrap_or(0.0);
            let slot = &mut self.samples[base + channel];
            if self.len == self.capacity {
                self.sum_squares[channel] -= (*slot as f64) * (*slot as f64);
            }
            self.sum_squares[channel] += (incoming as f64) * (incoming as f64);
            *slot = incoming;
        }

        if self.len < self.capacity {
            self.len += 1;
        }
        self.write_pos = (self.write_pos + 1) % self.capacity;

        // Rebuild the sums once per lap so add/subtract error cannot accumulate
        if self.write_pos == 0 {
            self.recompute_sums();
        }
    }

    /// Append interleaved frames; a trailing partial frame is ignored.
    pub fn push_interleaved(&mut self, data: &[f32]) {
        for frame in data.chunks_exact(self.channels) {
            self.push(frame);
        }
    }

    /// RMS of a channel over the frames currently held.
    pub fn rms(&self, channel: usize) -> Result<f32, AnalyzerError> {
        if channel >= self.channels {
            return Err(AnalyzerError::ChannelOutOfRange {
                index: channel,
                channels: self.channels,
            });
        }
        if self.len == 0 {
            return Err(AnalyzerError::InsufficientData);
        }
        let mean = self.sum_squares[channel].max(0.0) / self.len as f64;
        Ok(mean.sqrt() as f32)
    }

    /// Channel-averaged mean square, 0.0 when empty.
    pub fn mean_square(&self) -> f32 {
        if self.len == 0 || self.channels == 0 {
            return 0.0;
        }
        let total: f64 = self.sum_squares.iter().map(|s| s.max(0.0)).sum();
        (total / (self.len * self.channels) as f64) as f32
    }

    /// Drop all frames without releasing the storage.
    pub fn clear(&mut self) {
        self.samples.fill(0.0);
        self.sum_squares.fill(0.0);
        self.write_pos = 0;
        self.len = 0;
    }

    fn recompute_sums(&mut self) {
        self.sum_squares.fill(0.0);
        for frame in self.samples.chunks_exact(self.channels) {
            for (sum, &sample) in self.sum_squares.iter_mut().zip(frame) {
                *sum += (sample as f64) * (sample as f64);
            }
        }
    }
}
