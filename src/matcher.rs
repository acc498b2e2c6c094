//! Cross-frame identity propagation by intersection-over-union.

use crate::error::EngineResult;
use crate::mask::next_label;
use crate::volume::Plane;
use cellmask_protocol::Label;
use ndarray::{Array3, ArrayView2, ArrayView3, Axis, Zip};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

pub const DEFAULT_IOU_THRESHOLD: f64 = 0.1;

/// Renumber the nonzero labels of a plane to `1..=k` in ascending order.
pub fn relabel_dense(plane: ArrayView2<'_, Label>) -> Plane {
    let ids: BTreeSet<Label> = plane.iter().copied().filter(|&v| v != 0).collect();
    let lookup: BTreeMap<Label, Label> = ids
        .into_iter()
        .zip(1..)
        .collect();
    plane.mapv(|v| lookup.get(&v).copied().unwrap_or(0))
}

/// Pairwise overlap statistics between two planes.
#[derive(Debug, Default)]
struct Overlaps {
    prev_area: BTreeMap<Label, usize>,
    next_area: BTreeMap<Label, usize>,
    shared: BTreeMap<(Label, Label), usize>,
}

impl Overlaps {
    fn measure(prev: ArrayView2<'_, Label>, next: ArrayView2<'_, Label>) -> Self {
        let mut overlaps = Self::default();
        Zip::from(&prev).and(&next).for_each(|&p, &n| {
            if p != 0 {
                *overlaps.prev_area.entry(p).or_default() += 1;
            }
            if n != 0 {
                *overlaps.next_area.entry(n).or_default() += 1;
            }
            if p != 0 && n != 0 {
                *overlaps.shared.entry((p, n)).or_default() += 1;
            }
        });
        overlaps
    }

    fn iou(&self, prev: Label, next: Label) -> f64 {
        let Some(&shared) = self.shared.get(&(prev, next)) else {
            return 0.0;
        };
        let union = self.prev_area.get(&prev).copied().unwrap_or(0)
            + self.next_area.get(&next).copied().unwrap_or(0)
            - shared;
        shared as f64 / union as f64
    }

    /// For each next label, the prev label with the highest IOU (lowest id on
    /// ties), or 0 when it overlaps nothing.
    fn best_prev(&self) -> BTreeMap<Label, Label> {
        let mut best: BTreeMap<Label, (f64, Label)> = BTreeMap::new();
        for &(p, n) in self.shared.keys() {
            let score = self.iou(p, n);
            let entry = best.entry(n).or_insert((score, p));
            // keys iterate with ascending prev ids, so only a strict gain moves it
            if score > entry.0 {
                *entry = (score, p);
            }
        }
        self.next_area
            .keys()
            .map(|&n| (n, best.get(&n).map_or(0, |&(_, p)| p)))
            .collect()
    }

    /// The next label with the highest IOU against `prev`, lowest id on ties.
    fn best_next(&self, prev: Label) -> Label {
        let mut best = (0.0, 0);
        for (&(p, n), _) in self.shared.range((prev, 0)..=(prev, Label::MAX)) {
            debug_assert_eq!(p, prev);
            let score = self.iou(p, n);
            if score > best.0 {
                best = (score, n);
            }
        }
        best.1
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IdentityMatcher {
    pub threshold: f64,
}

impl Default for IdentityMatcher {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_IOU_THRESHOLD,
        }
    }
}

impl IdentityMatcher {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    /// Relabel `next` so that objects overlapping `prev` keep their ids.
    ///
    /// Unmatched objects get fresh ids above everything already in use, in
    /// ascending order of their dense id. Output depends only on the pixel
    /// values, never on map iteration order. Fails when the fresh ids would
    /// run out of label space.
    pub fn predict_next(
        &self,
        prev: ArrayView2<'_, Label>,
        next: ArrayView2<'_, Label>,
    ) -> EngineResult<Plane> {
        let next = relabel_dense(next);
        let overlaps = Overlaps::measure(prev, next.view());
        if overlaps.prev_area.is_empty() || overlaps.next_area.is_empty() {
            return Ok(next);
        }

        let best_prev = overlaps.best_prev();
        let mut claims: BTreeMap<Label, usize> = BTreeMap::new();
        for &p in best_prev.values().filter(|&&p| p != 0) {
            *claims.entry(p).or_default() += 1;
        }

        let mut assigned: BTreeMap<Label, Label> = BTreeMap::new();
        let mut unmatched: Vec<Label> = vec![];
        let mut used: BTreeSet<Label> = BTreeSet::new();

        for (&next_cell, &matched) in &best_prev {
            if matched == 0 {
                unmatched.push(next_cell);
                continue;
            }
            if used.contains(&matched) {
                unmatched.push(next_cell);
                continue;
            }
            if claims.get(&matched).copied().unwrap_or(0) > 1 {
                // several objects claim the same predecessor: only its own
                // best match may take the id
                let best_next = overlaps.best_next(matched);
                if best_next != next_cell {
                    unmatched.push(next_cell);
                    continue;
                }
            }
            if overlaps.iou(matched, next_cell) > self.threshold {
                assigned.insert(next_cell, matched);
            } else {
                unmatched.push(next_cell);
            }
            used.insert(matched);
        }

        let max_prev = overlaps.prev_area.keys().next_back().copied().unwrap_or(0);
        let max_assigned = assigned.values().max().copied().unwrap_or(0);
        let mut last = max_prev.max(max_assigned);
        for cell in unmatched {
            last = next_label(last)?;
            assigned.insert(cell, last);
        }
        Ok(next.mapv(|v| assigned.get(&v).copied().unwrap_or(0)))
    }

    /// Propagate identities through a stack front to back. Frame 0 is left
    /// as is; every predicted frame becomes the reference for the next one.
    pub fn predict_stack(&self, stack: ArrayView3<'_, Label>) -> EngineResult<Array3<Label>> {
        let mut out = stack.to_owned();
        for frame in 1..stack.len_of(Axis(0)) {
            let predicted = self.predict_next(
                out.index_axis(Axis(0), frame - 1),
                stack.index_axis(Axis(0), frame),
            )?;
            out.index_axis_mut(Axis(0), frame).assign(&predicted);
        }
        debug!(frames = stack.len_of(Axis(0)), "propagated identities");
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mask::SWAP_SENTINEL;
    use ndarray::{array, stack};

    #[test]
    fn test_relabel_dense_removes_gaps() {
        let plane = array![[0, 7, 7], [3, 0, 12]];
        assert_eq!(relabel_dense(plane.view()), array![[0, 2, 2], [1, 0, 3]]);
    }

    #[test]
    fn test_predict_next_keeps_overlapping_id() {
        let prev = array![[1, 1], [0, 0]];
        let next = array![[1, 1], [2, 2]];
        let out = IdentityMatcher::default().predict_next(prev.view(), next.view()).unwrap();
        assert_eq!(out, array![[1, 1], [2, 2]]);
    }

    #[test]
    fn test_predict_next_follows_moved_ids() {
        let prev = array![[0, 0, 5], [9, 0, 5]];
        let next = array![[0, 0, 1], [2, 0, 1]];
        let out = IdentityMatcher::default().predict_next(prev.view(), next.view()).unwrap();
        assert_eq!(out, array![[0, 0, 5], [9, 0, 5]]);
    }

    #[test]
    fn test_predict_next_fresh_ids_clear_existing() {
        let prev = array![[4, 4, 0, 0], [0, 0, 0, 0]];
        let next = array![[1, 1, 0, 0], [0, 0, 3, 3]];
        let out = IdentityMatcher::default().predict_next(prev.view(), next.view()).unwrap();
        assert_eq!(out, array![[4, 4, 0, 0], [0, 0, 5, 5]]);
    }

    #[test]
    fn test_predict_next_resolves_competing_claims() {
        // both next objects overlap prev 1; the larger overlap keeps the id
        let prev = array![[1, 1, 1, 1]];
        let next = array![[1, 2, 2, 2]];
        let out = IdentityMatcher::default().predict_next(prev.view(), next.view()).unwrap();
        assert_eq!(out, array![[2, 1, 1, 1]]);
    }

    #[test]
    fn test_predict_next_below_threshold_gets_fresh_id() {
        let prev = array![[1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1]];
        let next = array![[1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]];
        let out = IdentityMatcher::new(0.1).predict_next(prev.view(), next.view()).unwrap();
        assert_eq!(out[(0, 0)], 2);
    }

    #[test]
    fn test_predict_next_with_empty_inputs() {
        let matcher = IdentityMatcher::default();
        let empty = array![[0, 0], [0, 0]];
        let next = array![[0, 8], [8, 0]];
        assert_eq!(matcher.predict_next(empty.view(), next.view()).unwrap(), array![[0, 1], [1, 0]]);
        assert_eq!(matcher.predict_next(next.view(), empty.view()).unwrap(), empty);
    }

    #[test]
    fn test_predict_stack_chains_predictions() {
        let f0 = array![[3, 0], [0, 0]];
        let f1 = array![[6, 0], [0, 0]];
        let f2 = array![[9, 0], [0, 0]];
        let stack = stack(Axis(0), &[f0.view(), f1.view(), f2.view()]).unwrap();
        let out = IdentityMatcher::default().predict_stack(stack.view()).unwrap();
        assert!(out.iter().all(|&v| v == 0 || v == 3));
    }

    #[test]
    fn test_predict_next_fails_when_ids_run_out() {
        let prev = array![[SWAP_SENTINEL - 1, 0, 0]];
        let next = array![[0, 0, 4]];
        let err = IdentityMatcher::default()
            .predict_next(prev.view(), next.view())
            .unwrap_err();
        assert!(err.message.contains("No label id left"));
    }
}
