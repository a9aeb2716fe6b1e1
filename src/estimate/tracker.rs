use std::sync::Arc;

use smallvec::SmallVec;
use tracing::trace;

use super::estimator::SizeEstimator;
use super::{Estimate, Field, Kind, PrimitiveKind, Shape};
use crate::types::{Result, SpillwayError};

/// Checkpoint of a tracker: estimated bytes at a given update count.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Sample {
    /// Full estimate of the tracker when the sample was taken.
    pub bytes: u64,
    /// Update count when the sample was taken.
    pub updates: u64,
}

/// Tuning knobs for [`SizeTracker`].
#[derive(Clone, Debug)]
pub struct TrackerOptions {
    /// Factor by which the gap between samples grows; must exceed 1.
    pub sample_growth_rate: f64,
}

impl Default for TrackerOptions {
    fn default() -> Self {
        Self {
            sample_growth_rate: 1.1,
        }
    }
}

impl TrackerOptions {
    /// Rejects growth rates that would never widen the sampling interval.
    pub fn validate(&self) -> Result<()> {
        if !(self.sample_growth_rate > 1.0) || !self.sample_growth_rate.is_finite() {
            return Err(SpillwayError::Invalid("sample growth rate must exceed 1"));
        }
        Ok(())
    }
}

type SampleWindow = SmallVec<[Sample; 2]>;

/// Append-only buffer that keeps a cheap running estimate of its own size.
///
/// A full estimate of the tracker is taken only when the update count
/// reaches `next_sample_at`, which grows geometrically, so `n` appends cost
/// `O(log n)` full estimates. Between samples the size is extrapolated from
/// the two most recent samples.
pub struct SizeTracker<T> {
    elements: Vec<T>,
    samples: SampleWindow,
    num_updates: u64,
    bytes_per_update: u64,
    next_sample_at: u64,
    sample_growth_rate: f64,
    samples_taken: u64,
    estimator: Arc<SizeEstimator>,
}

static SAMPLE: Shape = Shape::root(
    "Sample",
    &[
        Field::primitive("bytes", PrimitiveKind::Long),
        Field::primitive("updates", PrimitiveKind::Long),
    ],
);

static SIZE_TRACKER: Shape = Shape::root(
    "SizeTracker",
    &[
        Field::reference("elements"),
        Field::reference("samples"),
        Field::primitive("num_updates", PrimitiveKind::Long),
        Field::primitive("bytes_per_update", PrimitiveKind::Long),
        Field::primitive("next_sample_at", PrimitiveKind::Long),
        Field::primitive("sample_growth_rate", PrimitiveKind::Double),
    ],
);

impl Estimate for Sample {
    fn kind(&self) -> Kind {
        Kind::Object(&SAMPLE)
    }
}

impl Estimate for SampleWindow {
    fn kind(&self) -> Kind {
        Kind::Sequence
    }

    fn element_count(&self) -> usize {
        self.len()
    }

    fn element(&self, index: usize) -> Option<&dyn Estimate> {
        self.get(index).map(|s| s as &dyn Estimate)
    }
}

impl<T: Estimate> Estimate for SizeTracker<T> {
    fn kind(&self) -> Kind {
        Kind::Object(&SIZE_TRACKER)
    }

    fn reference(&self, field: &Field) -> Result<Option<&dyn Estimate>> {
        match field.name {
            "elements" => Ok(Some(&self.elements)),
            "samples" => Ok(Some(&self.samples)),
            other => Err(SpillwayError::FieldAccess {
                shape: SIZE_TRACKER.name,
                field: other,
            }),
        }
    }
}

impl<T: Estimate> SizeTracker<T> {
    /// Creates an empty tracker and takes its first sample.
    pub fn new(estimator: Arc<SizeEstimator>, options: &TrackerOptions) -> Result<Self> {
        options.validate()?;
        let mut tracker = Self {
            elements: Vec::new(),
            samples: SampleWindow::new(),
            num_updates: 1,
            bytes_per_update: 0,
            next_sample_at: 1,
            sample_growth_rate: options.sample_growth_rate,
            samples_taken: 0,
            estimator,
        };
        tracker.take_sample()?;
        Ok(tracker)
    }

    /// Appends `value`, re-sampling when the update count hits the next checkpoint.
    pub fn append(&mut self, value: T) -> Result<()> {
        self.elements.push(value);
        self.num_updates += 1;
        if self.num_updates >= self.next_sample_at {
            self.take_sample()?;
        }
        Ok(())
    }

    /// Extrapolated size in bytes of the tracker and its buffered values.
    pub fn estimate_size(&self) -> u64 {
        let (Some(oldest), Some(newest)) = (self.samples.first(), self.samples.last()) else {
            return 0;
        };
        let since_newest = self.num_updates - newest.updates;
        oldest.bytes + self.bytes_per_update * since_newest
    }

    /// Drops every buffered value and restarts sampling.
    pub fn clear(&mut self) -> Result<()> {
        self.elements.clear();
        self.reset_samples()
    }

    /// Moves every buffered value out in append order and restarts sampling.
    pub fn take_elements(&mut self) -> Result<Vec<T>> {
        let elements = std::mem::take(&mut self.elements);
        self.reset_samples()?;
        Ok(elements)
    }

    /// Buffered values in append order.
    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.elements.iter()
    }

    /// Number of buffered values.
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    /// Whether nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Retained samples, oldest first; never more than two.
    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    /// Current extrapolation rate.
    pub fn bytes_per_update(&self) -> u64 {
        self.bytes_per_update
    }

    /// Update count at which the next full estimate happens.
    pub fn next_sample_at(&self) -> u64 {
        self.next_sample_at
    }

    /// Full estimates taken since construction or the last reset.
    pub fn samples_taken(&self) -> u64 {
        self.samples_taken
    }

    fn reset_samples(&mut self) -> Result<()> {
        self.num_updates = 1;
        self.next_sample_at = 1;
        self.bytes_per_update = 0;
        self.samples_taken = 0;
        self.samples.clear();
        self.take_sample()
    }

    // The schedule advances before estimating so a failed estimate still
    // leaves a later checkpoint to retry at.
    fn take_sample(&mut self) -> Result<()> {
        let grown = (self.num_updates as f64 * self.sample_growth_rate).ceil() as u64;
        self.next_sample_at = grown.max(self.num_updates + 1);
        let estimator = Arc::clone(&self.estimator);
        let bytes = estimator.estimate(&*self)?;
        self.samples.push(Sample {
            bytes,
            updates: self.num_updates,
        });
        if self.samples.len() > 2 {
            self.samples.remove(0);
        }
        self.samples_taken += 1;
        if let (Some(oldest), Some(newest)) = (self.samples.first(), self.samples.last()) {
            let bytes_delta = newest.bytes as i128 - oldest.bytes as i128;
            let update_delta = newest.updates as i128 - oldest.updates as i128;
            self.bytes_per_update = (bytes_delta - update_delta).max(0) as u64;
        }
        trace!(
            bytes,
            updates = self.num_updates,
            next = self.next_sample_at,
            "took size sample"
        );
        Ok(())
    }
}

impl<'a, T> IntoIterator for &'a SizeTracker<T> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.elements.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn tracker() -> SizeTracker<u64> {
        SizeTracker::new(Arc::new(SizeEstimator::default()), &TrackerOptions::default())
            .expect("tracker")
    }

    #[test]
    fn fresh_tracker_reports_its_own_size() -> Result<()> {
        let estimator = Arc::new(SizeEstimator::default());
        let t: SizeTracker<u64> = SizeTracker::new(Arc::clone(&estimator), &TrackerOptions::default())?;
        assert_eq!(t.samples().len(), 1);
        assert_eq!(t.samples()[0].updates, 1);
        assert_eq!(t.estimate_size(), t.samples()[0].bytes);
        assert_eq!(t.next_sample_at(), 2);
        Ok(())
    }

    #[test]
    fn keeps_at_most_two_samples_and_applies_delta_rule() -> Result<()> {
        let mut t = tracker();
        for i in 0..50 {
            t.append(i)?;
            assert!(t.samples().len() <= 2);
        }
        let (oldest, newest) = (t.samples()[0], t.samples()[1]);
        let expected = (newest.bytes as i128
            - oldest.bytes as i128
            - (newest.updates as i128 - oldest.updates as i128))
            .max(0) as u64;
        assert_eq!(t.bytes_per_update(), expected);
        Ok(())
    }

    #[test]
    fn sampling_interval_grows_geometrically() -> Result<()> {
        let mut t = tracker();
        for i in 0..10_000u64 {
            t.append(i)?;
        }
        // ceil(n * 1.1) reaches 10_000 within about log(10_000) / log(1.1) steps
        // once the per-update minimum gap stops dominating.
        assert!(t.samples_taken() < 120, "took {} samples", t.samples_taken());
        assert!(t.next_sample_at() > 10_000);
        Ok(())
    }

    #[test]
    fn clear_restarts_from_an_empty_sample() -> Result<()> {
        let mut t = tracker();
        let empty = t.estimate_size();
        for i in 0..20 {
            t.append(i)?;
        }
        assert_eq!(t.len(), 20);
        t.clear()?;
        assert!(t.is_empty());
        assert_eq!(t.estimate_size(), empty);
        assert_eq!(t.samples_taken(), 1);
        Ok(())
    }

    #[test]
    fn take_elements_preserves_append_order() -> Result<()> {
        let mut t = tracker();
        for i in [5u64, 3, 9, 1] {
            t.append(i)?;
        }
        let seen: Vec<u64> = t.iter().copied().collect();
        assert_eq!(seen, vec![5, 3, 9, 1]);
        assert_eq!(t.take_elements()?, vec![5, 3, 9, 1]);
        assert!(t.is_empty());
        Ok(())
    }

    static FLAKY: Shape = Shape::root("Flaky", &[Field::reference("payload")]);

    struct Flaky {
        payload: u64,
        fail: Arc<AtomicBool>,
    }

    impl Estimate for Flaky {
        fn kind(&self) -> Kind {
            Kind::Object(&FLAKY)
        }

        fn reference(&self, field: &Field) -> Result<Option<&dyn Estimate>> {
            if self.fail.swap(false, Ordering::SeqCst) {
                return Err(SpillwayError::FieldAccess {
                    shape: FLAKY.name,
                    field: field.name,
                });
            }
            Ok(Some(&self.payload))
        }
    }

    #[test]
    fn failed_checkpoint_does_not_stall_sampling() -> Result<()> {
        let estimator = Arc::new(SizeEstimator::default());
        let mut t = SizeTracker::new(Arc::clone(&estimator), &TrackerOptions::default())?;
        let healthy = Arc::new(AtomicBool::new(false));
        for payload in 0..20 {
            t.append(Flaky {
                payload,
                fail: Arc::clone(&healthy),
            })?;
        }
        let before = t.samples_taken();
        let checkpoint = t.next_sample_at();
        while t.num_updates + 1 < checkpoint {
            t.append(Flaky {
                payload: 0,
                fail: Arc::clone(&healthy),
            })?;
        }
        let flaky = Flaky {
            payload: 0,
            fail: Arc::new(AtomicBool::new(true)),
        };
        assert!(t.append(flaky).is_err());
        assert_eq!(t.samples_taken(), before);
        assert!(t.next_sample_at() > checkpoint);

        while t.samples_taken() == before {
            t.append(Flaky {
                payload: 1,
                fail: Arc::clone(&healthy),
            })?;
        }
        let (oldest, newest) = (t.samples()[0], t.samples()[1]);
        assert_eq!(newest.updates, t.num_updates);
        assert_eq!(estimator.estimate(&t)?, newest.bytes);
        assert_eq!(t.estimate_size(), oldest.bytes);
        Ok(())
    }

    #[test]
    fn growth_rate_must_exceed_one() {
        let options = TrackerOptions {
            sample_growth_rate: 1.0,
        };
        assert!(options.validate().is_err());
        let nan = TrackerOptions {
            sample_growth_rate: f64::NAN,
        };
        assert!(nan.validate().is_err());
    }
}
