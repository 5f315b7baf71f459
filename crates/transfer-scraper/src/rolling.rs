//! Fixed-size rolling windows over attempt outcomes.

use std::collections::VecDeque;

/// Success rate over the last `capacity` outcomes.
///
/// Not synchronized; owners keep it behind the lock of the entry it belongs to.
#[derive(Debug, Clone)]
pub struct RollingRate {
    samples: VecDeque<bool>,
    capacity: usize,
    successes: usize,
}

impl RollingRate {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
            successes: 0,
        }
    }

    /// Record an outcome, discarding the oldest once full.
    pub fn record(&mut self, success: bool) {
        if self.samples.len() == self.capacity {
            if let Some(true) = self.samples.pop_front() {
                self.successes -= 1;
            }
        }
        self.samples.push_back(success);
        if success {
            self.successes += 1;
        }
    }

    /// Success rate in `[0, 1]`. An empty window is optimistic (1.0) so new
    /// resources are not ranked below ones that have already failed.
    pub fn rate(&self) -> f64 {
        if self.samples.is_empty() {
            1.0
        } else {
            self.successes as f64 / self.samples.len() as f64
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
        self.successes = 0;
    }
}
