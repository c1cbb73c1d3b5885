//! Counters
//!
//! A counter accumulates samples between posts. Posting copies the current
//! statistics into a record, then resets them and bumps the sequence number
//! so analysis tools can detect gaps.

use crate::registry::RecordType;
use addb_common::{BaseKind, Error, Result};
use std::sync::Arc;

/// Fixed statistics words: seq, nr, total, min, max, sum_sq
pub const COUNTER_STATS_WORDS: usize = 6;

/// Sample accumulator bound to a counter record type
#[derive(Clone, Debug)]
pub struct Counter {
    rt: Arc<RecordType>,
    seq: u64,
    nr: u64,
    total: u64,
    min: u64,
    max: u64,
    sum_sq: u64,
    hist: Vec<u64>,
}

impl Counter {
    /// Create a counter; the record type must be of counter kind
    pub fn new(rt: Arc<RecordType>) -> Result<Self> {
        if rt.kind() != BaseKind::Counter {
            return Err(Error::invalid_argument(format!(
                "record type '{}' is a {}, not a counter",
                rt.name(),
                rt.kind()
            )));
        }
        let buckets = rt.buckets().len();
        let hist = if buckets > 0 {
            vec![0; buckets + 1]
        } else {
            Vec::new()
        };
        Ok(Self {
            rt,
            seq: 0,
            nr: 0,
            total: 0,
            min: 0,
            max: 0,
            sum_sq: 0,
            hist,
        })
    }

    /// Add a sample.
    ///
    /// Returns [`Error::Overflow`] without touching any statistic if the
    /// sample would overflow the running totals. Post the counter and retry.
    pub fn update(&mut self, datum: u64) -> Result<()> {
        let sum_sq = datum
            .checked_mul(datum)
            .and_then(|sq| self.sum_sq.checked_add(sq))
            .ok_or(Error::Overflow)?;
        let total = self.total.checked_add(datum).ok_or(Error::Overflow)?;

        self.nr += 1;
        self.total = total;
        self.sum_sq = sum_sq;
        if self.nr == 1 {
            self.min = datum;
            self.max = datum;
        } else {
            self.min = self.min.min(datum);
            self.max = self.max.max(datum);
        }

        if !self.hist.is_empty() {
            let bounds = self.rt.buckets();
            let bucket = bounds
                .iter()
                .position(|&b| datum < b)
                .unwrap_or(bounds.len());
            self.hist[bucket] += 1;
        }
        Ok(())
    }

    /// Zero the statistics and advance the sequence number
    pub fn reset(&mut self) {
        self.seq += 1;
        self.nr = 0;
        self.total = 0;
        self.min = 0;
        self.max = 0;
        self.sum_sq = 0;
        self.hist.iter_mut().for_each(|h| *h = 0);
    }

    /// Words produced by [`Counter::write_fields`]
    #[must_use]
    pub fn field_words(&self) -> usize {
        COUNTER_STATS_WORDS + self.hist.len()
    }

    /// Write `seq, nr, total, min, max, sum_sq, hist...`
    pub fn write_fields(&self, out: &mut [u64]) {
        out[..COUNTER_STATS_WORDS].copy_from_slice(&[
            self.seq,
            self.nr,
            self.total,
            self.min,
            self.max,
            self.sum_sq,
        ]);
        out[COUNTER_STATS_WORDS..COUNTER_STATS_WORDS + self.hist.len()]
            .copy_from_slice(&self.hist);
    }

    #[must_use]
    pub fn record_type(&self) -> &Arc<RecordType> {
        &self.rt
    }

    #[must_use]
    pub const fn seq(&self) -> u64 {
        self.seq
    }

    /// Samples since the last reset
    #[must_use]
    pub const fn nr(&self) -> u64 {
        self.nr
    }

    #[must_use]
    pub const fn total(&self) -> u64 {
        self.total
    }

    #[must_use]
    pub const fn min(&self) -> u64 {
        self.min
    }

    #[must_use]
    pub const fn max(&self) -> u64 {
        self.max
    }

    #[must_use]
    pub const fn sum_sq(&self) -> u64 {
        self.sum_sq
    }

    /// Histogram counts, one more than the number of bounds
    #[must_use]
    pub fn histogram(&self) -> &[u64] {
        &self.hist
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counter(buckets: &[u64]) -> Counter {
        Counter::new(Arc::new(RecordType::counter(100, "lat", buckets))).unwrap()
    }

    fn snapshot(c: &Counter) -> Vec<u64> {
        let mut words = vec![0; c.field_words()];
        c.write_fields(&mut words);
        words
    }

    #[test]
    fn test_update_statistics() {
        let mut c = counter(&[]);
        c.update(7).unwrap();
        assert_eq!((c.nr(), c.min(), c.max()), (1, 7, 7));

        c.update(3).unwrap();
        c.update(11).unwrap();
        assert_eq!(c.nr(), 3);
        assert_eq!(c.total(), 21);
        assert_eq!(c.min(), 3);
        assert_eq!(c.max(), 11);
        assert_eq!(c.sum_sq(), 49 + 9 + 121);
        assert!(c.histogram().is_empty());
        assert_eq!(c.field_words(), COUNTER_STATS_WORDS);
    }

    #[test]
    fn test_first_sample_sets_min() {
        let mut c = counter(&[]);
        c.update(0).unwrap();
        c.update(5).unwrap();
        assert_eq!(c.min(), 0);
        assert_eq!(c.max(), 5);
    }

    #[test]
    fn test_histogram_buckets() {
        let mut c = counter(&[10, 100]);
        for datum in [0, 9, 10, 99, 100, 5000] {
            c.update(datum).unwrap();
        }
        assert_eq!(c.histogram(), &[2, 2, 2]);
        assert_eq!(c.field_words(), COUNTER_STATS_WORDS + 3);
    }

    #[test]
    fn test_overflow_leaves_state() {
        let mut c = counter(&[10]);
        c.update(u64::from(u32::MAX)).unwrap();
        let before = snapshot(&c);

        assert!(matches!(c.update(u64::from(u32::MAX)), Err(Error::Overflow)));
        assert_eq!(snapshot(&c), before);

        assert!(matches!(c.update(u64::MAX), Err(Error::Overflow)));
        assert_eq!(snapshot(&c), before);
    }

    #[test]
    fn test_reset_bumps_seq() {
        let mut c = counter(&[4]);
        c.update(2).unwrap();
        c.update(6).unwrap();
        c.reset();

        let words = snapshot(&c);
        assert_eq!(words[0], 1);
        assert!(words[1..].iter().all(|&w| w == 0));
    }

    #[test]
    fn test_wrong_kind_rejected() {
        let rt = Arc::new(RecordType::sequence(5, "seq"));
        assert!(Counter::new(rt).is_err());
    }
}
