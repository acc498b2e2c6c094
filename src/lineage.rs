//! Parent/daughter bookkeeping for tracking files.
//!
//! Every edge satisfies temporal precedence (the parent's last frame comes
//! before the daughter's first), which also keeps the graph acyclic. Edits
//! that would violate it unlink the offending edge instead.

use crate::error::{EngineError, EngineResult};
use crate::mask::SWAP_SENTINEL;
use crate::volume::{scan_frames, IdentityIndexed};
use cellmask_protocol::{frame_ranges, FileKind, Label, ReadableEntry, ReadableTable};
use ndarray::ArrayView3;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Lineage table as stored in archives: string label -> record.
pub type LineageTable = BTreeMap<String, Track>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Track {
    #[serde(default)]
    pub label: Label,
    #[serde(default)]
    pub frames: BTreeSet<usize>,
    #[serde(default)]
    pub daughters: BTreeSet<Label>,
    #[serde(default)]
    pub frame_div: Option<usize>,
    #[serde(default)]
    pub parent: Option<Label>,
    #[serde(default)]
    pub capped: bool,
}

impl Track {
    pub fn new(label: Label) -> Self {
        Self {
            label,
            frames: BTreeSet::new(),
            daughters: BTreeSet::new(),
            frame_div: None,
            parent: None,
            capped: false,
        }
    }

    pub fn first_frame(&self) -> Option<usize> {
        self.frames.first().copied()
    }

    pub fn last_frame(&self) -> Option<usize> {
        self.frames.last().copied()
    }
}

/// Track-specific edits on top of the identity index.
pub trait LineageTracked: IdentityIndexed {
    /// `new` continues `old` from `split_frame` on; pixels are relabelled by the caller.
    fn split_track(&mut self, old: Label, new: Label, split_frame: usize) -> EngineResult<()>;
    fn set_parent(&mut self, parent: Label, daughter: Label) -> EngineResult<()>;
    /// Fold `remove` into `keep`; pixels are relabelled by the caller.
    fn merge_tracks(&mut self, keep: Label, remove: Label) -> EngineResult<()>;
    /// Exchange the records of two labels and redirect edges pointing at them.
    fn swap_tracks(&mut self, a: Label, b: Label) -> EngineResult<()>;
    /// Drop tracks with no frames. Returns the pruned labels.
    fn prune_empty(&mut self) -> Vec<Label>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineageGraph {
    tracks: BTreeMap<Label, Track>,
}

impl LineageGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_tracks(tracks: impl IntoIterator<Item = Track>) -> Self {
        Self {
            tracks: tracks.into_iter().map(|t| (t.label, t)).collect(),
        }
    }

    /// Parse an archive lineage table; keys are decimal label ids.
    pub fn from_table(table: LineageTable) -> Result<Self, String> {
        let mut tracks = BTreeMap::new();
        for (key, mut track) in table {
            let label: Label = key
                .trim()
                .parse()
                .map_err(|_| format!("Lineage key '{key}' is not a label id"))?;
            if label == 0 || label == SWAP_SENTINEL {
                return Err(format!("Lineage key '{key}' is not a valid label id"));
            }
            track.label = label;
            tracks.insert(label, track);
        }
        Ok(Self { tracks })
    }

    pub fn to_table(&self) -> LineageTable {
        self.tracks
            .iter()
            .map(|(label, track)| (label.to_string(), track.clone()))
            .collect()
    }

    pub fn tracks(&self) -> &BTreeMap<Label, Track> {
        &self.tracks
    }

    pub fn track(&self, label: Label) -> Option<&Track> {
        self.tracks.get(&label)
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    fn require(&self, label: Label) -> EngineResult<&Track> {
        self.tracks
            .get(&label)
            .ok_or_else(|| EngineError::not_found(format!("Track {label} not found")))
    }

    /// Validate a split before any pixel is touched.
    pub fn check_split(&self, old: Label, split_frame: usize) -> EngineResult<()> {
        let track = self.require(old)?;
        if !track.frames.contains(&split_frame) {
            return Err(EngineError::invalid_input(format!(
                "Track {old} does not occur in frame {split_frame}"
            )));
        }
        if track.first_frame() == Some(split_frame) {
            return Err(EngineError::invalid_input(format!(
                "Track {old} starts at frame {split_frame}; nothing would remain before the split"
            )));
        }
        Ok(())
    }

    /// Validate a parent assignment before it is applied.
    pub fn check_parent(&self, parent: Label, daughter: Label) -> EngineResult<()> {
        let p = self.require(parent)?;
        let d = self.require(daughter)?;
        match (p.last_frame(), d.first_frame()) {
            (Some(last), Some(first)) if last < first => Ok(()),
            _ => Err(EngineError::invalid_input(format!(
                "Track {parent} must end before track {daughter} starts"
            ))),
        }
    }

    pub fn check_pair(&self, a: Label, b: Label) -> EngineResult<()> {
        self.require(a)?;
        self.require(b)?;
        if a == b {
            return Err(EngineError::invalid_input(format!(
                "Labels must differ, got {a} twice"
            )));
        }
        Ok(())
    }

    /// frame_div is the earliest first frame over all daughters.
    fn refresh_frame_div(&mut self, label: Label) {
        let Some(track) = self.tracks.get(&label) else {
            return;
        };
        let frame_div = track
            .daughters
            .iter()
            .filter_map(|d| self.tracks.get(d).and_then(Track::first_frame))
            .min();
        if let Some(track) = self.tracks.get_mut(&label) {
            track.frame_div = frame_div;
        }
    }

    /// Remove a track and every edge that references it.
    fn delete_track(&mut self, label: Label) {
        let Some(removed) = self.tracks.remove(&label) else {
            return;
        };
        for daughter in &removed.daughters {
            if let Some(track) = self.tracks.get_mut(daughter) {
                if track.parent == Some(label) {
                    track.parent = None;
                }
            }
        }
        let mut touched = vec![];
        for track in self.tracks.values_mut() {
            if track.daughters.remove(&label) {
                touched.push(track.label);
            }
            if track.parent == Some(label) {
                track.parent = None;
            }
        }
        for parent in touched {
            self.refresh_frame_div(parent);
        }
        debug!(label, "deleted track");
    }

    fn unlink(&mut self, parent: Label, daughter: Label) {
        if let Some(track) = self.tracks.get_mut(&parent) {
            track.daughters.remove(&daughter);
        }
        if let Some(track) = self.tracks.get_mut(&daughter) {
            if track.parent == Some(parent) {
                track.parent = None;
            }
        }
        self.refresh_frame_div(parent);
    }

    /// Drop the edges of `label` that no longer respect temporal precedence
    /// after its frames changed.
    fn unlink_out_of_order(&mut self, label: Label) {
        let Some(track) = self.tracks.get(&label) else {
            return;
        };
        let (first, last) = (track.first_frame(), track.last_frame());
        let stale_parent = track.parent.filter(|parent| {
            let parent_last = self.tracks.get(parent).and_then(Track::last_frame);
            !matches!((parent_last, first), (Some(end), Some(start)) if end < start)
        });
        let stale_daughters: Vec<Label> = track
            .daughters
            .iter()
            .filter(|daughter| {
                let start = self.tracks.get(*daughter).and_then(Track::first_frame);
                !matches!((last, start), (Some(end), Some(start)) if end < start)
            })
            .copied()
            .collect();
        if let Some(parent) = stale_parent {
            debug!(parent, daughter = label, "edge out of order, unlinked");
            self.unlink(parent, label);
        }
        for daughter in stale_daughters {
            debug!(parent = label, daughter, "edge out of order, unlinked");
            self.unlink(label, daughter);
        }
        self.refresh_frame_div(label);
    }

    /// Move a record to a new id, redirecting edges to follow it.
    fn relabel(&mut self, old: Label, new: Label) {
        let Some(mut track) = self.tracks.remove(&old) else {
            return;
        };
        track.label = new;
        for daughter in &track.daughters {
            if let Some(d) = self.tracks.get_mut(daughter) {
                d.parent = Some(new);
            }
        }
        if let Some(parent) = track.parent {
            if let Some(p) = self.tracks.get_mut(&parent) {
                if p.daughters.remove(&old) {
                    p.daughters.insert(new);
                }
            }
        }
        // a track listed as its own parent's daughter is handled above; a
        // self-reference cannot exist under temporal precedence
        self.tracks.insert(new, track);
    }

    pub fn readable_table(&self) -> ReadableTable {
        let entries = self
            .tracks
            .values()
            .map(|track| ReadableEntry {
                label: track.label,
                frames: frame_ranges(track.frames.iter().copied()),
                parent: track.parent,
                daughters: track.daughters.iter().copied().collect(),
                frame_div: track.frame_div,
                capped: Some(track.capped),
            })
            .collect();
        ReadableTable {
            kind: FileKind::Track,
            features: BTreeMap::from([(0, entries)]),
        }
    }

    /// Every violated structural rule, empty when the graph is consistent.
    pub fn check_invariants(&self) -> Vec<String> {
        let mut problems = vec![];
        for (label, track) in &self.tracks {
            if track.label != *label {
                problems.push(format!("track keyed {label} carries label {}", track.label));
            }
            if track.frames.is_empty() {
                problems.push(format!("track {label} has no frames"));
            }
            for daughter in &track.daughters {
                match self.tracks.get(daughter) {
                    None => problems.push(format!("track {label} lists missing daughter {daughter}")),
                    Some(d) => {
                        if d.parent != Some(*label) {
                            problems.push(format!(
                                "daughter {daughter} of {label} points at parent {:?}",
                                d.parent
                            ));
                        }
                        if let (Some(last), Some(first)) = (track.last_frame(), d.first_frame()) {
                            if last >= first {
                                problems.push(format!(
                                    "parent {label} ends at {last}, daughter {daughter} starts at {first}"
                                ));
                            }
                        }
                    }
                }
            }
            if let Some(parent) = track.parent {
                match self.tracks.get(&parent) {
                    None => problems.push(format!("track {label} points at missing parent {parent}")),
                    Some(p) if !p.daughters.contains(label) => problems.push(format!(
                        "parent {parent} does not list daughter {label}"
                    )),
                    Some(_) => {}
                }
            }
            let expected_div = track
                .daughters
                .iter()
                .filter_map(|d| self.tracks.get(d).and_then(Track::first_frame))
                .min();
            if track.frame_div != expected_div {
                problems.push(format!(
                    "track {label} frame_div {:?}, daughters start at {expected_div:?}",
                    track.frame_div
                ));
            }
        }
        if self.has_cycle() {
            problems.push("lineage contains a cycle".to_string());
        }
        problems
    }

    /// True when some label is its own ancestor.
    pub fn has_cycle(&self) -> bool {
        for start in self.tracks.keys() {
            let mut seen = BTreeSet::from([*start]);
            let mut current = self.tracks.get(start).and_then(|t| t.parent);
            while let Some(label) = current {
                if !seen.insert(label) {
                    return true;
                }
                current = self.tracks.get(&label).and_then(|t| t.parent);
            }
        }
        false
    }
}

impl IdentityIndexed for LineageGraph {
    fn add_label(&mut self, _feature: usize, label: Label, frame: usize) -> bool {
        if label == 0 {
            return false;
        }
        let track = self.tracks.entry(label).or_insert_with(|| Track::new(label));
        let added = track.frames.insert(frame);
        let parent = track.parent;
        if added {
            self.unlink_out_of_order(label);
        }
        if let Some(parent) = parent {
            self.refresh_frame_div(parent);
        }
        added
    }

    fn remove_label(&mut self, _feature: usize, label: Label, frame: usize) -> bool {
        let Some(track) = self.tracks.get_mut(&label) else {
            return false;
        };
        let removed = track.frames.remove(&frame);
        let parent = track.parent;
        if track.frames.is_empty() {
            self.delete_track(label);
        } else if let Some(parent) = parent {
            self.refresh_frame_div(parent);
        }
        removed
    }

    fn max_label(&self, _feature: usize) -> Label {
        self.tracks.keys().next_back().copied().unwrap_or(0)
    }

    fn frames_of(&self, _feature: usize, label: Label) -> Option<&BTreeSet<usize>> {
        self.tracks.get(&label).map(|t| &t.frames)
    }

    fn label_ids(&self, _feature: usize) -> BTreeSet<Label> {
        self.tracks.keys().copied().collect()
    }

    fn exchange_frames(&mut self, _feature: usize, a: Label, b: Label) {
        if a == b {
            return;
        }
        let frames_a = self.tracks.get(&a).map(|t| t.frames.clone()).unwrap_or_default();
        let frames_b = self.tracks.get(&b).map(|t| t.frames.clone()).unwrap_or_default();
        for (label, frames) in [(a, frames_b), (b, frames_a)] {
            if frames.is_empty() {
                self.delete_track(label);
            } else {
                self.tracks
                    .entry(label)
                    .or_insert_with(|| Track::new(label))
                    .frames = frames;
            }
        }
        for label in [a, b] {
            self.unlink_out_of_order(label);
            if let Some(parent) = self.tracks.get(&label).and_then(|t| t.parent) {
                self.refresh_frame_div(parent);
            }
        }
    }

    fn reindex(&mut self, _feature: usize, labels: ArrayView3<'_, Label>) {
        let mut present: BTreeMap<Label, BTreeSet<usize>> = BTreeMap::new();
        for (frame, found) in scan_frames(labels).into_iter().enumerate() {
            for label in found {
                present.entry(label).or_default().insert(frame);
            }
        }
        let stale: Vec<Label> = self
            .tracks
            .keys()
            .filter(|label| !present.contains_key(label))
            .copied()
            .collect();
        for label in stale {
            self.delete_track(label);
        }
        for (label, frames) in present {
            self.tracks
                .entry(label)
                .or_insert_with(|| Track::new(label))
                .frames = frames;
        }
        let labels: Vec<Label> = self.tracks.keys().copied().collect();
        for &label in &labels {
            self.unlink_out_of_order(label);
        }
        for label in labels {
            self.refresh_frame_div(label);
        }
    }
}

impl LineageTracked for LineageGraph {
    fn split_track(&mut self, old: Label, new: Label, split_frame: usize) -> EngineResult<()> {
        self.check_split(old, split_frame)?;
        if self.tracks.contains_key(&new) {
            return Err(EngineError::invalid_input(format!(
                "Track {new} already exists"
            )));
        }
        let Some(track_old) = self.tracks.get_mut(&old) else {
            return Err(EngineError::not_found(format!("Track {old} not found")));
        };
        let frames_after = track_old.frames.split_off(&split_frame);
        let daughters = std::mem::take(&mut track_old.daughters);
        let capped = track_old.capped;
        track_old.frame_div = None;
        track_old.capped = true;

        let mut track_new = Track::new(new);
        track_new.frames = frames_after;
        track_new.capped = capped;
        for daughter in daughters {
            let in_split_frame = self
                .tracks
                .get(&daughter)
                .is_some_and(|d| d.frames.contains(&split_frame));
            if let Some(d) = self.tracks.get_mut(&daughter) {
                if in_split_frame {
                    // left behind: no parent survives the split
                    d.parent = None;
                } else {
                    d.parent = Some(new);
                    track_new.daughters.insert(daughter);
                }
            }
        }
        self.tracks.insert(new, track_new);
        self.refresh_frame_div(new);
        debug!(old, new, split_frame, "split track");
        Ok(())
    }

    fn set_parent(&mut self, parent: Label, daughter: Label) -> EngineResult<()> {
        self.check_parent(parent, daughter)?;
        if let Some(previous) = self.tracks.get(&daughter).and_then(|d| d.parent) {
            if previous != parent {
                self.unlink(previous, daughter);
            }
        }
        if let Some(p) = self.tracks.get_mut(&parent) {
            p.daughters.insert(daughter);
        }
        if let Some(d) = self.tracks.get_mut(&daughter) {
            d.parent = Some(parent);
        }
        self.refresh_frame_div(parent);
        Ok(())
    }

    fn merge_tracks(&mut self, keep: Label, remove: Label) -> EngineResult<()> {
        self.check_pair(keep, remove)?;
        let Some(removed) = self.tracks.get(&remove).cloned() else {
            return Err(EngineError::not_found(format!("Track {remove} not found")));
        };
        let old_daughters: Vec<Label> = self
            .tracks
            .get(&keep)
            .map(|t| t.daughters.iter().copied().collect())
            .unwrap_or_default();
        for daughter in old_daughters {
            self.unlink(keep, daughter);
        }
        self.delete_track(remove);
        if let Some(track) = self.tracks.get_mut(&keep) {
            track.frames.extend(removed.frames.iter().copied());
            track.capped = removed.capped;
        }

        if let Some(parent) = self.tracks.get(&keep).and_then(|t| t.parent) {
            if self.check_parent(parent, keep).is_err() {
                self.unlink(parent, keep);
            } else {
                self.refresh_frame_div(parent);
            }
        }
        for daughter in removed.daughters {
            if daughter == keep || daughter == remove || !self.tracks.contains_key(&daughter) {
                continue;
            }
            if self.check_parent(keep, daughter).is_ok() {
                if let Some(d) = self.tracks.get_mut(&daughter) {
                    d.parent = Some(keep);
                }
                if let Some(k) = self.tracks.get_mut(&keep) {
                    k.daughters.insert(daughter);
                }
            }
        }
        self.refresh_frame_div(keep);
        debug!(keep, remove, "merged tracks");
        Ok(())
    }

    fn swap_tracks(&mut self, a: Label, b: Label) -> EngineResult<()> {
        self.check_pair(a, b)?;
        if a == SWAP_SENTINEL || b == SWAP_SENTINEL {
            return Err(EngineError::invalid_input("Label id is reserved"));
        }
        self.relabel(a, SWAP_SENTINEL);
        self.relabel(b, a);
        self.relabel(SWAP_SENTINEL, b);
        Ok(())
    }

    fn prune_empty(&mut self) -> Vec<Label> {
        let empty: Vec<Label> = self
            .tracks
            .values()
            .filter(|t| t.frames.is_empty())
            .map(|t| t.label)
            .collect();
        for label in &empty {
            self.delete_track(*label);
        }
        empty
    }
}
