use motion_watch_common::frame::Frame;
use std::collections::VecDeque;

use crate::similarity;

/// Fixed-capacity FIFO of the most recent frames, plus the count of frames
/// appended since the last evaluation.
///
/// Owned by a single consumer; there is no internal locking.
pub struct MotionWindow {
    frames: VecDeque<Frame>,
    capacity: usize,
    since_eval: usize,
}

impl MotionWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            frames: VecDeque::with_capacity(capacity),
            capacity,
            since_eval: 0,
        }
    }

    /// Push a frame, evicting the oldest one first when full.
    pub fn append(&mut self, frame: Frame) {
        if self.frames.len() >= self.capacity {
            self.frames.pop_front();
        }
        self.frames.push_back(frame);
        self.since_eval += 1;
    }

    /// Mean similarity over every consecutive pair in window order, or 0.0
    /// with fewer than two frames.
    pub fn aggregate_score(&self) -> f64 {
        if self.frames.len() < 2 {
            return 0.0;
        }
        let sum: f64 = self
            .frames
            .iter()
            .zip(self.frames.iter().skip(1))
            .map(|(a, b)| similarity::score(a, b))
            .sum();
        sum / (self.frames.len() - 1) as f64
    }

    /// True once `batch_size` frames have arrived since the previous
    /// evaluation. Resets the count when it returns true.
    pub fn batch_complete(&mut self, batch_size: usize) -> bool {
        if self.since_eval < batch_size {
            return false;
        }
        self.since_eval = 0;
        true
    }

    pub fn latest(&self) -> Option<&Frame> {
        self.frames.back()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Frame> {
        self.frames.iter()
    }
}
