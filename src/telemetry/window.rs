//! Fixed-capacity FIFO of the most recent samples.

use super::SamplePoint;
use std::collections::VecDeque;

/// Default number of points kept for the live display.
pub const DEFAULT_WINDOW_LEN: usize = 20;

/// Rolling window of the latest `capacity` points.
///
/// Pushing into a full window evicts the oldest point. Points are never
/// modified once stored; readers get a copy through [`snapshot`](Self::snapshot).
#[derive(Debug, Clone)]
pub struct RollingWindow {
    points: VecDeque<SamplePoint>,
    capacity: usize,
}

impl RollingWindow {
    /// Create an empty window. A zero capacity is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            points: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append `point`, returning the evicted one if the window was full.
    pub fn push(&mut self, point: SamplePoint) -> Option<SamplePoint> {
        let evicted = if self.points.len() == self.capacity {
            self.points.pop_front()
        } else {
            None
        };
        self.points.push_back(point);
        evicted
    }

    /// Copy of the current contents, oldest first.
    pub fn snapshot(&self) -> Vec<SamplePoint> {
        self.points.iter().cloned().collect()
    }

    /// Most recent point.
    pub fn latest(&self) -> Option<&SamplePoint> {
        self.points.back()
    }

    /// Number of points held.
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Whether the window holds no points.
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Maximum number of points held.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for RollingWindow {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_LEN)
    }
}
