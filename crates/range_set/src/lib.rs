//! Durable representation of the set of primary-key ranges already indexed.
//! A pure data structure: it has no I/O of its own. `index_builder` persists
//! the built `RangeSet` into the store's `<index>/range/` subspace and feeds
//! it back in on every load; the RangeSet never knows it's being persisted.
use std::{
    collections::BTreeMap,
    ops::Bound,
};

use store_api::{
    End,
    Interval,
    Key,
    Start,
};

/// Set of disjoint, maximally coalesced `Interval`s over the primary-key
/// domain. Mirrors the invariant the spec leans on throughout: the union of
/// these intervals is exactly the set of primary keys some committed chunk
/// has already reflected into the index.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RangeSet {
    intervals: BTreeMap<Start, End>,
}

impl RangeSet {
    pub fn new() -> Self {
        Self {
            intervals: BTreeMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    pub fn len(&self) -> usize {
        self.intervals.len()
    }

    /// All intervals in the set that intersect with or are adjacent to
    /// `interval`, in key order.
    fn intersecting_or_adjacent(&self, interval: &Interval) -> Vec<Interval> {
        let mut out = Vec::new();
        if let Some((other_start, other_end)) = self
            .intervals
            .range((Bound::Unbounded, Bound::Excluded(interval.start.clone())))
            .next_back()
        {
            let other = Interval {
                start: other_start.clone(),
                end: other_end.clone(),
            };
            if !interval.is_disjoint(&other) || interval.is_adjacent(&other) {
                out.push(other);
            }
        }
        for (other_start, other_end) in self.intervals.range(interval.start.clone()..) {
            if interval.end.is_disjoint(other_start) && !interval.end.is_adjacent(other_start) {
                break;
            }
            out.push(Interval {
                start: other_start.clone(),
                end: other_end.clone(),
            });
        }
        out
    }

    /// Unconditionally merge `interval` into the set, coalescing anything it
    /// touches or overlaps. Empty intervals are a no-op.
    pub fn add(&mut self, interval: Interval) {
        if interval.is_empty() {
            return;
        }
        let mut merged_start = interval.start.clone();
        let mut merged_end = interval.end.clone();
        for other in self.intersecting_or_adjacent(&interval) {
            if other.start < merged_start {
                merged_start = other.start.clone();
            }
            if other.end > merged_end {
                merged_end = other.end.clone();
            }
            self.intervals
                .remove(&other.start)
                .expect("tried to remove an interval that intersecting_or_adjacent just returned");
        }
        self.intervals.insert(merged_start, merged_end);
    }

    fn interval_preceding(&self, k: &[u8]) -> Option<Interval> {
        let (start, end) = self
            .intervals
            .range((Bound::Unbounded, Bound::Included(Start(Key::from(k.to_vec())))))
            .next_back()?;
        Some(Interval {
            start: start.clone(),
            end: end.clone(),
        })
    }

    pub fn contains(&self, k: &[u8]) -> bool {
        self.interval_preceding(k).is_some_and(|i| i.contains(k))
    }

    pub fn contains_interval(&self, target: &Interval) -> bool {
        self.split_interval_components(target)
            .into_iter()
            .all(|(in_set, _)| in_set)
    }

    pub fn iter(&self) -> impl Iterator<Item = Interval> + '_ {
        self.intervals.iter().map(|(a, b)| Interval {
            start: a.clone(),
            end: b.clone(),
        })
    }

    /// `target` minus everything in `self`.
    pub fn subtract_from_interval(&self, target: &Interval) -> Self {
        let mut difference = BTreeMap::new();
        for (in_set, interval) in self.split_interval_components(target) {
            if !in_set {
                difference.insert(interval.start, interval.end);
            }
        }
        Self { intervals: difference }
    }

    /// Splits `target` into adjacent, alternating-membership components
    /// whose union is `target`. Each returned `(in_set, interval)` says
    /// whether that component is fully covered by `self`.
    pub fn split_interval_components(&self, target: &Interval) -> Vec<(bool, Interval)> {
        let mut out = Vec::new();
        if target.is_empty() {
            return out;
        }
        let target_start = target.start.0.clone();
        let interval_before = self.interval_preceding(target_start.as_slice());
        let mut component_start = match &interval_before {
            None => target_start.clone(),
            Some(interval_before) => {
                if target.end <= interval_before.end {
                    out.push((true, target.clone()));
                    return out;
                }
                let interval_before_end = match &interval_before.end {
                    End::Unbounded => unreachable!("interval_before.end >= target.end checked above"),
                    End::Excluded(e) => e.clone(),
                };
                if interval_before_end > target_start {
                    out.push((
                        true,
                        Interval {
                            start: target.start.clone(),
                            end: interval_before.end.clone(),
                        },
                    ));
                    interval_before_end
                } else {
                    target_start.clone()
                }
            },
        };
        let intersecting_range_end = match &target.end {
            End::Excluded(e) => Bound::Excluded(Start(e.clone())),
            End::Unbounded => Bound::Unbounded,
        };
        let intersecting: Vec<(Start, End)> = self
            .intervals
            .range((Bound::Excluded(Start(component_start.clone())), intersecting_range_end))
            .map(|(s, e)| (s.clone(), e.clone()))
            .collect();
        for (interval_start, interval_end) in intersecting {
            out.push((
                false,
                Interval {
                    start: Start(component_start.clone()),
                    end: End::Excluded(interval_start.0.clone()),
                },
            ));
            if target.end <= interval_end {
                out.push((
                    true,
                    Interval {
                        start: interval_start,
                        end: target.end.clone(),
                    },
                ));
                return out;
            }
            out.push((
                true,
                Interval {
                    start: interval_start,
                    end: interval_end.clone(),
                },
            ));
            component_start = match interval_end {
                End::Unbounded => unreachable!("interval_end >= target.end checked above"),
                End::Excluded(e) => e,
            };
        }
        out.push((
            false,
            Interval {
                start: Start(component_start),
                end: target.end.clone(),
            },
        ));
        out
    }

    /// `false` without mutation if any existing interval overlaps
    /// `interval`; otherwise coalesces it in and returns `true`.
    pub fn insert_if_not_present(&mut self, interval: Interval) -> bool {
        if interval.is_empty() {
            return true;
        }
        if self.intersecting_or_adjacent(&interval).into_iter().any(|other| !interval.is_adjacent(&other)) {
            return false;
        }
        self.add(interval);
        true
    }

    /// Variant used during chunk commits: on overlap, returns the first key
    /// of the overlap so the caller can surface `RangeAlreadyBuilt` instead
    /// of a bare boolean.
    pub fn insert_range_conditional(&mut self, interval: Interval) -> Option<Key> {
        if interval.is_empty() {
            return None;
        }
        let overlap = self
            .intersecting_or_adjacent(&interval)
            .into_iter()
            .filter(|other| !interval.is_adjacent(other))
            .map(|other| other.start.0.clone().max(interval.start.0.clone()))
            .min();
        if let Some(first_overlap_key) = overlap {
            return Some(first_overlap_key);
        }
        self.add(interval);
        None
    }

    pub fn missing_ranges(&self, domain: &Interval) -> impl Iterator<Item = Interval> {
        self.subtract_from_interval(domain).iter().collect::<Vec<_>>().into_iter()
    }

    pub fn first_missing_range(&self, domain: &Interval) -> Option<Interval> {
        self.missing_ranges(domain).next()
    }

    pub fn is_fully_built(&self, domain: &Interval) -> bool {
        self.contains_interval(domain)
    }
}

#[cfg(any(test, feature = "testing"))]
mod proptest_support {
    use proptest::prelude::*;
    use store_api::Interval;

    use super::RangeSet;

    impl Arbitrary for RangeSet {
        type Parameters = ();
        type Strategy = BoxedStrategy<RangeSet>;

        fn arbitrary_with((): Self::Parameters) -> Self::Strategy {
            prop::collection::vec(any::<Interval>(), 0..8)
                .prop_map(|intervals| {
                    let mut set = RangeSet::new();
                    for interval in intervals {
                        set.add(interval);
                    }
                    set
                })
                .boxed()
        }
    }
}
