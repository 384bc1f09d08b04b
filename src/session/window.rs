use crate::telemetry::TelemetrySample;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;

/// Fixed-capacity per-channel history, oldest evicted first.
#[derive(Debug, Clone)]
pub struct SampleWindow {
    capacity: usize,
    buffer: VecDeque<TelemetrySample>,
}

impl SampleWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            buffer: VecDeque::with_capacity(capacity),
        }
    }

    /// Returns false when the sample repeats the newest entry.
    pub fn push(&mut self, sample: TelemetrySample) -> bool {
        if let Some(newest) = self.buffer.back() {
            if newest.observed_at == sample.observed_at && newest.value == sample.value {
                return false;
            }
        }
        while self.buffer.len() >= self.capacity {
            self.buffer.pop_front();
        }
        self.buffer.push_back(sample);
        true
    }

    pub fn iter(&self) -> impl Iterator<Item = &TelemetrySample> {
        self.buffer.iter()
    }

    /// Samples whose device timestamp falls in `[since, until]`, in arrival order.
    pub fn observed_between(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> impl Iterator<Item = &TelemetrySample> {
        self.buffer
            .iter()
            .filter(move |sample| sample.observed_at >= since && sample.observed_at <= until)
    }
}
