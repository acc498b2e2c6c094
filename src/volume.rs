//! Raw + label arrays and the per-label identity index kept in step with them.
//!
//! Axis order is `(frame, row, col, channel|feature)` for both arrays. All
//! identity bookkeeping goes through [`IdentityIndexed`], implemented by the
//! z-stack [`IdentityIndex`] and the tracking [`LineageGraph`]; which one a
//! volume carries is fixed when it is constructed.

use crate::error::{EngineError, EngineResult};
use crate::lineage::LineageGraph;
use cellmask_protocol::{frame_ranges, ChangeSet, FileKind, Label, ReadableEntry, ReadableTable};
use ndarray::{Array2, Array3, Array4, ArrayView2, ArrayView3, Axis};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;
use tracing::debug;

pub type Plane = Array2<Label>;

/// Identity bookkeeping shared by z-stack and tracking files.
pub trait IdentityIndexed {
    /// Record that `label` occurs in `frame`. Returns whether the index changed.
    fn add_label(&mut self, feature: usize, label: Label, frame: usize) -> bool;
    /// Record that `label` no longer occurs in `frame`; drops the label when
    /// no frame is left. Returns whether the index changed.
    fn remove_label(&mut self, feature: usize, label: Label, frame: usize) -> bool;
    /// Highest tracked label, 0 when nothing is tracked.
    fn max_label(&self, feature: usize) -> Label;
    fn frames_of(&self, feature: usize, label: Label) -> Option<&BTreeSet<usize>>;
    fn label_ids(&self, feature: usize) -> BTreeSet<Label>;
    /// Swap the frame sets of two labels, leaving anything else untouched.
    fn exchange_frames(&mut self, feature: usize, a: Label, b: Label);
    /// Rebuild the frame sets of `feature` from `labels` (`frame, row, col`).
    fn reindex(&mut self, feature: usize, labels: ArrayView3<'_, Label>);
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellInfo {
    pub frames: BTreeSet<usize>,
}

/// Label -> frames index for every feature of a z-stack file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityIndex {
    features: Vec<BTreeMap<Label, CellInfo>>,
}

impl IdentityIndex {
    pub fn with_features(count: usize) -> Self {
        Self {
            features: vec![BTreeMap::new(); count],
        }
    }

    pub fn cell_info(&self, feature: usize) -> Option<&BTreeMap<Label, CellInfo>> {
        self.features.get(feature)
    }

    fn feature_mut(&mut self, feature: usize) -> &mut BTreeMap<Label, CellInfo> {
        if self.features.len() <= feature {
            self.features.resize_with(feature + 1, BTreeMap::new);
        }
        &mut self.features[feature]
    }

    pub fn readable_table(&self) -> ReadableTable {
        let features = self
            .features
            .iter()
            .enumerate()
            .map(|(feature, cells)| {
                let entries = cells
                    .iter()
                    .map(|(label, info)| ReadableEntry {
                        label: *label,
                        frames: frame_ranges(info.frames.iter().copied()),
                        parent: None,
                        daughters: vec![],
                        frame_div: None,
                        capped: None,
                    })
                    .collect();
                (feature, entries)
            })
            .collect();
        ReadableTable {
            kind: FileKind::ZStack,
            features,
        }
    }
}

impl IdentityIndexed for IdentityIndex {
    fn add_label(&mut self, feature: usize, label: Label, frame: usize) -> bool {
        if label == 0 {
            return false;
        }
        self.feature_mut(feature)
            .entry(label)
            .or_default()
            .frames
            .insert(frame)
    }

    fn remove_label(&mut self, feature: usize, label: Label, frame: usize) -> bool {
        let cells = self.feature_mut(feature);
        let Some(info) = cells.get_mut(&label) else {
            return false;
        };
        let removed = info.frames.remove(&frame);
        if info.frames.is_empty() {
            cells.remove(&label);
        }
        removed
    }

    fn max_label(&self, feature: usize) -> Label {
        self.features
            .get(feature)
            .and_then(|cells| cells.keys().next_back().copied())
            .unwrap_or(0)
    }

    fn frames_of(&self, feature: usize, label: Label) -> Option<&BTreeSet<usize>> {
        self.features
            .get(feature)
            .and_then(|cells| cells.get(&label))
            .map(|info| &info.frames)
    }

    fn label_ids(&self, feature: usize) -> BTreeSet<Label> {
        self.features
            .get(feature)
            .map(|cells| cells.keys().copied().collect())
            .unwrap_or_default()
    }

    fn exchange_frames(&mut self, feature: usize, a: Label, b: Label) {
        if a == b {
            return;
        }
        let cells = self.feature_mut(feature);
        let info_a = cells.remove(&a);
        let info_b = cells.remove(&b);
        if let Some(info) = info_a {
            cells.insert(b, info);
        }
        if let Some(info) = info_b {
            cells.insert(a, info);
        }
    }

    fn reindex(&mut self, feature: usize, labels: ArrayView3<'_, Label>) {
        let mut cells: BTreeMap<Label, CellInfo> = BTreeMap::new();
        for (frame, present) in scan_frames(labels).into_iter().enumerate() {
            for label in present {
                cells.entry(label).or_default().frames.insert(frame);
            }
        }
        *self.feature_mut(feature) = cells;
    }
}

/// Nonzero labels present in one plane.
pub fn labels_in_plane(plane: ArrayView2<'_, Label>) -> BTreeSet<Label> {
    plane.iter().copied().filter(|v| *v != 0).collect()
}

/// Nonzero labels present in each frame of a `frame, row, col` stack.
pub fn scan_frames(labels: ArrayView3<'_, Label>) -> Vec<BTreeSet<Label>> {
    (0..labels.len_of(Axis(0)))
        .into_par_iter()
        .map(|frame| labels_in_plane(labels.index_axis(Axis(0), frame)))
        .collect()
}

/// Identity layer chosen at load time from the file kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Annotations {
    ZStack(IdentityIndex),
    Track(LineageGraph),
}

impl Annotations {
    pub fn kind(&self) -> FileKind {
        match self {
            Self::ZStack(_) => FileKind::ZStack,
            Self::Track(_) => FileKind::Track,
        }
    }

    pub fn identity(&self) -> &dyn IdentityIndexed {
        match self {
            Self::ZStack(index) => index,
            Self::Track(graph) => graph,
        }
    }

    pub fn identity_mut(&mut self) -> &mut dyn IdentityIndexed {
        match self {
            Self::ZStack(index) => index,
            Self::Track(graph) => graph,
        }
    }

    pub fn readable_table(&self) -> ReadableTable {
        match self {
            Self::ZStack(index) => index.readable_table(),
            Self::Track(graph) => graph.readable_table(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelVolume {
    raw: Array4<f32>,
    labels: Array4<Label>,
    annotations: Annotations,
}

impl LabelVolume {
    /// Build a z-stack volume and index every feature from the pixels.
    pub fn zstack(raw: Array4<f32>, labels: Array4<Label>) -> EngineResult<Self> {
        Self::check_shapes(&raw, &labels)?;
        let features = labels.len_of(Axis(3));
        let mut volume = Self {
            raw,
            labels,
            annotations: Annotations::ZStack(IdentityIndex::with_features(features)),
        };
        for feature in 0..features {
            volume.reindex(feature);
        }
        Ok(volume)
    }

    /// Build a tracking volume. Frame lists in `lineage` are resynchronised
    /// with the pixels; parent/daughter fields are kept.
    pub fn track(
        raw: Array4<f32>,
        labels: Array4<Label>,
        lineage: LineageGraph,
    ) -> EngineResult<Self> {
        Self::check_shapes(&raw, &labels)?;
        if labels.len_of(Axis(3)) != 1 {
            return Err(EngineError::invalid_input(format!(
                "Tracking files hold exactly one feature, found {}",
                labels.len_of(Axis(3))
            )));
        }
        let mut volume = Self {
            raw,
            labels,
            annotations: Annotations::Track(lineage),
        };
        volume.reindex(0);
        Ok(volume)
    }

    fn check_shapes(raw: &Array4<f32>, labels: &Array4<Label>) -> EngineResult<()> {
        let (r, l) = (raw.shape(), labels.shape());
        if r[..3] != l[..3] {
            return Err(EngineError::invalid_input(format!(
                "Raw shape {r:?} and label shape {l:?} disagree on frame/height/width"
            )));
        }
        if r.iter().chain(l.iter()).any(|d| *d == 0) {
            return Err(EngineError::invalid_input(format!(
                "Empty axis in raw shape {r:?} or label shape {l:?}"
            )));
        }
        Ok(())
    }

    pub fn kind(&self) -> FileKind {
        self.annotations.kind()
    }

    pub fn num_frames(&self) -> usize {
        self.labels.len_of(Axis(0))
    }

    pub fn height(&self) -> usize {
        self.labels.len_of(Axis(1))
    }

    pub fn width(&self) -> usize {
        self.labels.len_of(Axis(2))
    }

    pub fn num_channels(&self) -> usize {
        self.raw.len_of(Axis(3))
    }

    pub fn num_features(&self) -> usize {
        self.labels.len_of(Axis(3))
    }

    pub fn raw(&self) -> &Array4<f32> {
        &self.raw
    }

    pub fn labels(&self) -> &Array4<Label> {
        &self.labels
    }

    pub(crate) fn labels_mut(&mut self) -> &mut Array4<Label> {
        &mut self.labels
    }

    pub fn annotations(&self) -> &Annotations {
        &self.annotations
    }

    pub(crate) fn annotations_mut(&mut self) -> &mut Annotations {
        &mut self.annotations
    }

    pub(crate) fn replace_annotations(&mut self, annotations: Annotations) {
        self.annotations = annotations;
    }

    pub fn lineage(&self) -> Option<&LineageGraph> {
        match &self.annotations {
            Annotations::Track(graph) => Some(graph),
            Annotations::ZStack(_) => None,
        }
    }

    pub(crate) fn lineage_mut(&mut self) -> Option<&mut LineageGraph> {
        match &mut self.annotations {
            Annotations::Track(graph) => Some(graph),
            Annotations::ZStack(_) => None,
        }
    }

    pub fn check_frame(&self, frame: usize) -> EngineResult<()> {
        if frame >= self.num_frames() {
            return Err(EngineError::invalid_selection("Frame", frame, self.num_frames()));
        }
        Ok(())
    }

    pub fn check_channel(&self, channel: usize) -> EngineResult<()> {
        if channel >= self.num_channels() {
            return Err(EngineError::invalid_selection(
                "Channel",
                channel,
                self.num_channels(),
            ));
        }
        Ok(())
    }

    pub fn check_feature(&self, feature: usize) -> EngineResult<()> {
        if feature >= self.num_features() {
            return Err(EngineError::invalid_selection(
                "Feature",
                feature,
                self.num_features(),
            ));
        }
        Ok(())
    }

    pub fn get_label_plane(&self, frame: usize, feature: usize) -> ArrayView2<'_, Label> {
        self.labels.slice(ndarray::s![frame, .., .., feature])
    }

    pub fn set_label_plane(
        &mut self,
        frame: usize,
        feature: usize,
        plane: ArrayView2<'_, Label>,
    ) -> EngineResult<()> {
        self.check_frame(frame)?;
        self.check_feature(feature)?;
        if plane.dim() != (self.height(), self.width()) {
            return Err(EngineError::invalid_input(format!(
                "Plane shape {:?} does not match volume plane ({}, {})",
                plane.dim(),
                self.height(),
                self.width()
            )));
        }
        self.labels
            .slice_mut(ndarray::s![frame, .., .., feature])
            .assign(&plane);
        Ok(())
    }

    pub fn raw_plane(&self, frame: usize, channel: usize) -> ArrayView2<'_, f32> {
        self.raw.slice(ndarray::s![frame, .., .., channel])
    }

    /// Every frame of one feature as `frame, row, col`.
    pub fn feature_stack(&self, feature: usize) -> ArrayView3<'_, Label> {
        self.labels.index_axis(Axis(3), feature)
    }

    pub fn max_label(&self, feature: usize) -> Label {
        self.annotations.identity().max_label(feature)
    }

    pub fn add_label(&mut self, feature: usize, label: Label, frame: usize) -> bool {
        self.annotations.identity_mut().add_label(feature, label, frame)
    }

    pub fn remove_label(&mut self, feature: usize, label: Label, frame: usize) -> bool {
        self.annotations
            .identity_mut()
            .remove_label(feature, label, frame)
    }

    pub fn cell_ids(&self, feature: usize) -> BTreeSet<Label> {
        self.annotations.identity().label_ids(feature)
    }

    pub fn frames_of(&self, feature: usize, label: Label) -> Option<&BTreeSet<usize>> {
        self.annotations.identity().frames_of(feature, label)
    }

    /// Full O(frames x H x W) rebuild of one feature's identity records.
    pub fn reindex(&mut self, feature: usize) {
        let started = Instant::now();
        let stack = self.labels.index_axis(Axis(3), feature);
        self.annotations.identity_mut().reindex(feature, stack);
        debug!(
            feature,
            labels = self.cell_ids(feature).len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "reindexed feature"
        );
    }

    /// Replace one plane and update the identity index from the labels that
    /// appeared or vanished in that frame.
    pub fn write_plane(&mut self, frame: usize, feature: usize, plane: Plane) -> ChangeSet {
        let current = self.get_label_plane(frame, feature);
        if current == plane.view() {
            return ChangeSet::default();
        }
        let before = labels_in_plane(current);
        let after = labels_in_plane(plane.view());
        self.labels
            .slice_mut(ndarray::s![frame, .., .., feature])
            .assign(&plane);
        let identity = self.sync_frame(frame, feature, &before, &after);
        ChangeSet {
            frame: true,
            identity,
            ..ChangeSet::default()
        }
    }

    /// Apply the presence difference of one frame to the identity index.
    pub(crate) fn sync_frame(
        &mut self,
        frame: usize,
        feature: usize,
        before: &BTreeSet<Label>,
        after: &BTreeSet<Label>,
    ) -> bool {
        let identity = self.annotations.identity_mut();
        let mut changed = false;
        for label in before.difference(after) {
            changed |= identity.remove_label(feature, *label, frame);
        }
        for label in after.difference(before) {
            changed |= identity.add_label(feature, *label, frame);
        }
        changed
    }

    /// Compare the index of `feature` with a fresh pixel scan.
    pub fn verify_index(&self, feature: usize) -> Result<(), String> {
        let identity = self.annotations.identity();
        let mut expected: BTreeMap<Label, BTreeSet<usize>> = BTreeMap::new();
        for (frame, present) in scan_frames(self.feature_stack(feature))
            .into_iter()
            .enumerate()
        {
            for label in present {
                expected.entry(label).or_default().insert(frame);
            }
        }
        let ids = identity.label_ids(feature);
        let expected_ids: BTreeSet<Label> = expected.keys().copied().collect();
        if ids != expected_ids {
            return Err(format!(
                "feature {feature}: indexed labels {ids:?} != labels in pixels {expected_ids:?}"
            ));
        }
        for (label, frames) in expected {
            let indexed = identity.frames_of(feature, label);
            if indexed != Some(&frames) {
                return Err(format!(
                    "feature {feature}: label {label} indexed in {indexed:?}, present in {frames:?}"
                ));
            }
        }
        Ok(())
    }

    /// Per-frame copies used by history snapshots (`row, col, feature`).
    pub(crate) fn frame_copy(&self, frame: usize) -> Array3<Label> {
        self.labels.index_axis(Axis(0), frame).to_owned()
    }

    pub(crate) fn restore_frame(&mut self, frame: usize, data: &Array3<Label>) {
        self.labels.index_axis_mut(Axis(0), frame).assign(data);
    }
}
