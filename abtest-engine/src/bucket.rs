//! Deterministic traffic splitting.
//!
//! A visitor is placed by hashing `"{visitor_id}-{experiment_id}"` with
//! SHA-256, reading the first 32 bits as a big-endian `u32`, and normalizing
//! to the unit interval. The interval is partitioned into contiguous buckets
//! built from the experiment's ordered allocation list, so the result depends
//! only on the inputs and never on process state.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use crate::errors::{EngineError, EngineResult};

/// Allowed deviation of an allocation's sum from 1.0
pub const ALLOCATION_TOLERANCE: f64 = 0.001;

/// One entry of an experiment's traffic allocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocationEntry {
    pub variant_id: String,
    pub fraction: f64,
}

impl AllocationEntry {
    pub fn new(variant_id: impl Into<String>, fraction: f64) -> Self {
        Self {
            variant_id: variant_id.into(),
            fraction,
        }
    }
}

/// Half-open slice `[lower_bound, upper_bound)` of the unit interval
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bucket {
    pub variant_id: String,
    pub lower_bound: f64,
    pub upper_bound: f64,
}

/// Check that an allocation can be turned into a bucket table.
pub fn validate_allocation(allocation: &[AllocationEntry]) -> EngineResult<()> {
    if allocation.is_empty() {
        return Err(EngineError::allocation_empty());
    }

    let mut seen = HashSet::new();
    for entry in allocation {
        if !entry.fraction.is_finite() || !(0.0..=1.0).contains(&entry.fraction) {
            return Err(EngineError::allocation_out_of_range(
                &entry.variant_id,
                entry.fraction,
            ));
        }
        if !seen.insert(entry.variant_id.as_str()) {
            return Err(EngineError::allocation_duplicate_variant(&entry.variant_id));
        }
    }

    let sum: f64 = allocation.iter().map(|e| e.fraction).sum();
    if (sum - 1.0).abs() > ALLOCATION_TOLERANCE {
        return Err(EngineError::allocation_sum_mismatch(
            sum,
            ALLOCATION_TOLERANCE,
        ));
    }

    Ok(())
}

/// Split traffic evenly across `variant_ids`, in order.
///
/// Shares are rounded to four decimals and the rounding residual goes to the
/// first variant so the list sums to 1.0.
pub fn equal_split(variant_ids: &[String]) -> Vec<AllocationEntry> {
    if variant_ids.is_empty() {
        return Vec::new();
    }

    #[allow(clippy::cast_precision_loss)]
    let share = (10_000.0 / variant_ids.len() as f64).round() / 10_000.0;
    let mut allocation: Vec<AllocationEntry> = variant_ids
        .iter()
        .map(|id| AllocationEntry::new(id.clone(), share))
        .collect();

    let sum: f64 = allocation.iter().map(|e| e.fraction).sum();
    allocation[0].fraction += 1.0 - sum;

    allocation
}

/// Normalized hash of a visitor/experiment pair in `[0, 1]`
pub fn hash_unit(experiment_id: &str, visitor_id: &str) -> f64 {
    let digest = Sha256::digest(format!("{visitor_id}-{experiment_id}").as_bytes());
    let prefix = [digest[0], digest[1], digest[2], digest[3]];
    log::trace!(
        "bucket hash for visitor {visitor_id} in {experiment_id}: {}",
        hex::encode(prefix)
    );
    f64::from(u32::from_be_bytes(prefix)) / f64::from(u32::MAX)
}

/// Immutable bucket table for one allocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketTable {
    buckets: Vec<Bucket>,
}

impl BucketTable {
    /// Build buckets by accumulating fractions in allocation order.
    ///
    /// Bounds are clamped to 1.0 and the last upper bound is pinned to exactly
    /// 1.0, so allocations that sum slightly off one (within tolerance) leave
    /// no gap and no overlap.
    pub fn build(allocation: &[AllocationEntry]) -> EngineResult<Self> {
        validate_allocation(allocation)?;

        let mut buckets = Vec::with_capacity(allocation.len());
        let mut cumulative: f64 = 0.0;
        for entry in allocation {
            let lower_bound = cumulative.min(1.0);
            cumulative += entry.fraction;
            buckets.push(Bucket {
                variant_id: entry.variant_id.clone(),
                lower_bound,
                upper_bound: cumulative.min(1.0),
            });
        }

        if let Some(last) = buckets.last_mut() {
            last.upper_bound = 1.0;
        }

        Ok(Self { buckets })
    }

    pub fn buckets(&self) -> &[Bucket] {
        &self.buckets
    }

    /// Find the bucket containing `value`.
    ///
    /// Buckets are half-open except the final one, which also contains 1.0.
    pub fn locate(&self, value: f64) -> Option<&Bucket> {
        let last = self.buckets.len().checked_sub(1)?;
        self.buckets.iter().enumerate().find_map(|(i, bucket)| {
            let inside = if i == last {
                value >= bucket.lower_bound && value <= bucket.upper_bound
            } else {
                value >= bucket.lower_bound && value < bucket.upper_bound
            };
            inside.then_some(bucket)
        })
    }

    /// Variant for a visitor of the given experiment
    pub fn assign(&self, experiment_id: &str, visitor_id: &str) -> Option<&str> {
        self.locate(hash_unit(experiment_id, visitor_id))
            .map(|b| b.variant_id.as_str())
    }
}

/// `assign(experimentId, visitorId, buckets) → variantId` over an allocation.
///
/// Validates the allocation before any hashing happens.
pub fn assign(
    experiment_id: &str,
    visitor_id: &str,
    allocation: &[AllocationEntry],
) -> EngineResult<String> {
    let table = BucketTable::build(allocation)?;
    table
        .assign(experiment_id, visitor_id)
        .map(str::to_string)
        .ok_or_else(EngineError::allocation_empty)
}

/// Per-experiment cache of prebuilt bucket tables.
///
/// Readers clone an `Arc` under a short read lock; `replace` swaps in a fully
/// built table, so a reader sees either the old or the new table.
#[derive(Default)]
pub struct BucketCache {
    tables: RwLock<HashMap<String, Arc<BucketTable>>>,
}

impl BucketCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the cached table or build it from `allocation`
    pub fn get_or_build(
        &self,
        experiment_id: &str,
        allocation: &[AllocationEntry],
    ) -> EngineResult<Arc<BucketTable>> {
        {
            let tables = self
                .tables
                .read()
                .map_err(|_| EngineError::internal_mutex_poisoned("bucket cache"))?;
            if let Some(table) = tables.get(experiment_id) {
                return Ok(Arc::clone(table));
            }
        }
        self.replace(experiment_id, allocation)
    }

    /// Build a new table and swap it in
    pub fn replace(
        &self,
        experiment_id: &str,
        allocation: &[AllocationEntry],
    ) -> EngineResult<Arc<BucketTable>> {
        let table = Arc::new(BucketTable::build(allocation)?);
        let mut tables = self
            .tables
            .write()
            .map_err(|_| EngineError::internal_mutex_poisoned("bucket cache"))?;
        tables.insert(experiment_id.to_string(), Arc::clone(&table));
        log::debug!(
            "bucket table for {experiment_id} rebuilt with {} buckets",
            table.buckets().len()
        );
        Ok(table)
    }

    pub fn invalidate(&self, experiment_id: &str) {
        if let Ok(mut tables) = self.tables.write() {
            tables.remove(experiment_id);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use proptest::prelude::*;

    fn split(pairs: &[(&str, f64)]) -> Vec<AllocationEntry> {
        pairs
            .iter()
            .map(|(id, f)| AllocationEntry::new(*id, *f))
            .collect()
    }

    #[test]
    fn test_assignment_is_deterministic() {
        let allocation = split(&[("control", 0.5), ("treatment", 0.5)]);
        let first = assign("exp-1", "visitor-42", &allocation).unwrap();
        for _ in 0..1000 {
            assert_eq!(assign("exp-1", "visitor-42", &allocation).unwrap(), first);
        }
    }

    #[test]
    fn test_hash_is_stable_across_runs() {
        // Key layout is "{visitor}-{experiment}", first four digest bytes big-endian
        let digest = Sha256::digest(b"visitor-1-exp-1");
        let expected = f64::from(u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]))
            / f64::from(u32::MAX);
        assert!((hash_unit("exp-1", "visitor-1") - expected).abs() < f64::EPSILON);
    }

    #[test]
    fn test_sum_outside_tolerance_rejected() {
        for allocation in [
            split(&[("a", 0.5), ("b", 0.47)]),
            split(&[("a", 0.55), ("b", 0.5)]),
        ] {
            let err = validate_allocation(&allocation).unwrap_err();
            assert_eq!(err.kind, ErrorKind::InvalidAllocation);
        }
    }

    #[test]
    fn test_sum_within_tolerance_accepted() {
        assert!(validate_allocation(&split(&[("a", 0.5), ("b", 0.5)])).is_ok());
        assert!(validate_allocation(&split(&[("a", 0.4995), ("b", 0.5)])).is_ok());
    }

    #[test]
    fn test_empty_and_out_of_range_rejected() {
        assert_eq!(
            validate_allocation(&[]).unwrap_err().code.0,
            "ALLOCATION_EMPTY"
        );
        assert_eq!(
            validate_allocation(&split(&[("a", 1.5), ("b", -0.5)]))
                .unwrap_err()
                .code
                .0,
            "ALLOCATION_OUT_OF_RANGE"
        );
        assert_eq!(
            validate_allocation(&split(&[("a", 0.5), ("a", 0.5)]))
                .unwrap_err()
                .code
                .0,
            "ALLOCATION_DUPLICATE_VARIANT"
        );
    }

    #[test]
    fn test_assign_rejects_invalid_allocation() {
        let err = assign("exp", "v", &split(&[("a", 0.97)])).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidAllocation);
    }

    #[test]
    fn test_equal_split_sums_to_one() {
        let ids: Vec<String> = ["a", "b", "c"].iter().map(|s| (*s).to_string()).collect();
        let allocation = equal_split(&ids);
        assert_eq!(allocation.len(), 3);
        let sum: f64 = allocation.iter().map(|e| e.fraction).sum();
        assert!((sum - 1.0).abs() < 1e-9);
        assert!((allocation[1].fraction - 0.3333).abs() < 1e-9);
        assert!((allocation[0].fraction - 0.3334).abs() < 1e-9);
    }

    #[test]
    fn test_bucket_bounds_are_contiguous() {
        let table = BucketTable::build(&split(&[("a", 0.2), ("b", 0.3), ("c", 0.4995)])).unwrap();
        let buckets = table.buckets();
        assert!((buckets[0].lower_bound - 0.0).abs() < f64::EPSILON);
        for pair in buckets.windows(2) {
            assert!((pair[0].upper_bound - pair[1].lower_bound).abs() < f64::EPSILON);
        }
        assert!((buckets[2].upper_bound - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_final_bucket_contains_one() {
        let table = BucketTable::build(&split(&[("a", 0.5), ("b", 0.5)])).unwrap();
        assert_eq!(table.locate(1.0).unwrap().variant_id, "b");
        assert_eq!(table.locate(0.0).unwrap().variant_id, "a");
        assert_eq!(table.locate(0.5).unwrap().variant_id, "b");
    }

    #[test]
    fn test_zero_fraction_variant_never_assigned() {
        let allocation = split(&[("a", 0.0), ("b", 1.0)]);
        for i in 0..200 {
            assert_eq!(assign("exp", &format!("visitor-{i}"), &allocation).unwrap(), "b");
        }
    }

    #[test]
    fn test_cache_replace_swaps_table() {
        let cache = BucketCache::new();
        let before = cache
            .get_or_build("exp", &split(&[("a", 1.0), ("b", 0.0)]))
            .unwrap();
        assert_eq!(before.assign("exp", "visitor").unwrap(), "a");

        // Cached table wins until replaced
        let cached = cache
            .get_or_build("exp", &split(&[("a", 0.0), ("b", 1.0)]))
            .unwrap();
        assert_eq!(cached.assign("exp", "visitor").unwrap(), "a");

        let after = cache
            .replace("exp", &split(&[("a", 0.0), ("b", 1.0)]))
            .unwrap();
        assert_eq!(after.assign("exp", "visitor").unwrap(), "b");
        // Old handle is untouched
        assert_eq!(before.assign("exp", "visitor").unwrap(), "a");
    }

    #[test]
    fn test_cache_rejects_invalid_replacement() {
        let cache = BucketCache::new();
        cache.get_or_build("exp", &split(&[("a", 1.0)])).unwrap();
        assert!(cache.replace("exp", &split(&[("a", 0.5)])).is_err());
        // Previous table still served
        let table = cache.get_or_build("exp", &[]).unwrap();
        assert_eq!(table.buckets().len(), 1);
    }

    fn allocation_strategy() -> impl Strategy<Value = Vec<AllocationEntry>> {
        (prop::collection::vec(1u32..1000, 1..8), -0.0009f64..0.0009).prop_map(
            |(weights, drift)| {
                let total: u32 = weights.iter().sum();
                let mut entries: Vec<AllocationEntry> = weights
                    .iter()
                    .enumerate()
                    .map(|(i, w)| {
                        AllocationEntry::new(format!("v{i}"), f64::from(*w) / f64::from(total))
                    })
                    .collect();
                // Push the sum anywhere inside the tolerance band
                let first = entries[0].fraction;
                entries[0].fraction = (first + drift).clamp(0.0, 1.0);
                entries
            },
        )
    }

    proptest! {
        #[test]
        fn prop_every_value_maps_to_exactly_one_bucket(
            allocation in allocation_strategy(),
            value in 0.0f64..=1.0,
        ) {
            let table = BucketTable::build(&allocation).unwrap();
            let buckets = table.buckets();
            let last = buckets.len() - 1;
            let matches = buckets
                .iter()
                .enumerate()
                .filter(|(i, b)| {
                    if *i == last {
                        value >= b.lower_bound && value <= b.upper_bound
                    } else {
                        value >= b.lower_bound && value < b.upper_bound
                    }
                })
                .count();
            prop_assert_eq!(matches, 1);
            prop_assert!(table.locate(value).is_some());
        }

        #[test]
        fn prop_assignment_is_a_pure_function(
            allocation in allocation_strategy(),
            visitor in "[a-z0-9]{1,16}",
        ) {
            let a = assign("exp-prop", &visitor, &allocation).unwrap();
            let b = assign("exp-prop", &visitor, &allocation).unwrap();
            prop_assert_eq!(a, b);
        }
    }
}
