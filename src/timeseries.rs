use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub time: i64,
    pub value: f64,
}

pub trait PointSliceExt {
    fn mean_value(&self) -> Option<f64>;
}

impl<'a, I> PointSliceExt for I
where
    I: Iterator<Item = &'a Point> + Clone,
{
    fn mean_value(&self) -> Option<f64> {
        let (sum, count) = self
            .clone()
            .fold((0.0, 0usize), |(sum, count), point| (sum + point.value, count + 1));
        if count == 0 {
            None
        } else {
            Some(sum / count as f64)
        }
    }
}

/// Fixed-duration sliding window over timestamped values.
///
/// One mutex guards the whole sequence and is held only for the duration of a
/// single push or aggregate. Callers must push non-decreasing timestamps.
#[derive(Debug)]
pub struct SignalWindow {
    window_ms: i64,
    data: Mutex<VecDeque<Point>>,
}

impl SignalWindow {
    pub fn new(window_ms: i64) -> Self {
        Self {
            window_ms,
            data: Mutex::new(VecDeque::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Point>> {
        self.data.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Mean of the retained values, `None` when empty.
    pub fn average(&self) -> Option<f64> {
        self.lock().iter().mean_value()
    }

    /// Push, drop entries older than the window relative to `time` (oldest
    /// first, the edge itself is kept) and average, all under one lock.
    pub fn push_and_average(&self, time: i64, value: f64) -> Option<f64> {
        let mut data = self.lock();
        data.push_back(Point { time, value });
        while let Some(front) = data.front() {
            if time - front.time > self.window_ms {
                data.pop_front();
            } else {
                break;
            }
        }
        data.iter().mean_value()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}
