//! # Audio Aggregation
//!
//! Collects raw audio fragments for one session and cuts them into batches of
//! `threshold` fragments. The aggregator itself is plain data; the session keeps it
//! behind its lock so that pushing the threshold fragment, detaching the buffer and
//! queueing the batch happen as one step.

use chrono::{DateTime, Utc};

/// Fragments detached from the buffer when the threshold fired.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBatch {
    /// Per-session, starts at 0, increases by one per batch
    pub sequence: u64,
    pub fragments: Vec<Vec<u8>>,
    pub dispatched_at: DateTime<Utc>,
}

impl AudioBatch {
    /// The fragments concatenated in arrival order.
    pub fn bytes(&self) -> Vec<u8> {
        self.fragments.concat()
    }
}

#[derive(Debug)]
pub struct AudioAggregator {
    threshold: usize,
    buffer: Vec<Vec<u8>>,
    next_sequence: u64,
    fragments_received: u64,
}

impl AudioAggregator {
    pub fn new(threshold: usize) -> Self {
        let threshold = threshold.max(1);
        Self {
            threshold,
            buffer: Vec::with_capacity(threshold),
            next_sequence: 0,
            fragments_received: 0,
        }
    }

    /// Buffer one fragment. Returns the detached batch when this fragment filled
    /// the buffer.
    pub fn push(&mut self, fragment: Vec<u8>) -> Option<AudioBatch> {
        self.buffer.push(fragment);
        self.fragments_received += 1;

        if self.buffer.len() < self.threshold {
            return None;
        }

        let fragments = std::mem::replace(&mut self.buffer, Vec::with_capacity(self.threshold));
        let sequence = self.next_sequence;
        self.next_sequence += 1;

        Some(AudioBatch {
            sequence,
            fragments,
            dispatched_at: Utc::now(),
        })
    }

    /// Drop whatever is buffered and return how many fragments that was.
    pub fn discard(&mut self) -> usize {
        let discarded = self.buffer.len();
        self.buffer.clear();
        discarded
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn batches_dispatched(&self) -> u64 {
        self.next_sequence
    }

    pub fn fragments_received(&self) -> u64 {
        self.fragments_received
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(aggregator: &mut AudioAggregator, count: usize) -> Vec<AudioBatch> {
        (0..count)
            .filter_map(|i| aggregator.push(vec![i as u8]))
            .collect()
    }

    #[test]
    fn test_twenty_five_fragments_make_two_batches() {
        let mut aggregator = AudioAggregator::new(10);
        let batches = feed(&mut aggregator, 25);

        assert_eq!(batches.len(), 2);
        assert_eq!(aggregator.buffered(), 5);
        assert_eq!(batches[0].sequence, 0);
        assert_eq!(batches[1].sequence, 1);
        assert_eq!(batches[0].bytes(), (0..10).collect::<Vec<u8>>());
        assert_eq!(batches[1].bytes(), (10..20).collect::<Vec<u8>>());
    }

    #[test]
    fn test_batch_count_for_any_fragment_count() {
        for threshold in [1, 3, 10] {
            for n in 0..40 {
                let mut aggregator = AudioAggregator::new(threshold);
                let batches = feed(&mut aggregator, n);
                assert_eq!(batches.len(), n / threshold);
                assert_eq!(aggregator.buffered(), n % threshold);
                assert!(batches.iter().all(|b| b.fragments.len() == threshold));
            }
        }
    }

    #[test]
    fn test_discard_reports_leftovers() {
        let mut aggregator = AudioAggregator::new(4);
        feed(&mut aggregator, 6);
        assert_eq!(aggregator.discard(), 2);
        assert_eq!(aggregator.buffered(), 0);
        assert_eq!(aggregator.fragments_received(), 6);
        assert_eq!(aggregator.batches_dispatched(), 1);
    }

    #[test]
    fn test_zero_threshold_is_treated_as_one() {
        let mut aggregator = AudioAggregator::new(0);
        assert!(aggregator.push(vec![1]).is_some());
    }
}
