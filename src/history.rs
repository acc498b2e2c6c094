//! Snapshot chain behind undo/redo.
//!
//! Record 0 is the state the session was opened with; every committed action
//! appends the state it produced, which is also the state the next action is
//! about to run on. The cursor walks this chain on undo/redo. Committing
//! while the cursor is not at the tail discards the redo branch.

use crate::error::{EngineError, EngineResult};
use crate::volume::{Annotations, LabelVolume};
use cellmask_protocol::{ChangeSet, ErrorCode, HistoryDirection, Label, Selection};
use ndarray::{Array3, Axis};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, info};

/// Full copy of the label volume plus session state at one point in time.
///
/// Frames are reference counted so consecutive snapshots can share the
/// frames an action did not touch.
#[derive(Debug, Clone)]
pub struct Snapshot {
    frames: Vec<Arc<Array3<Label>>>,
    annotations: Annotations,
    selection: Selection,
}

impl Snapshot {
    pub fn capture(
        volume: &LabelVolume,
        selection: Selection,
        previous: Option<&Snapshot>,
        share_unchanged: bool,
    ) -> Self {
        let frames = (0..volume.num_frames())
            .map(|frame| {
                let current = volume.labels().index_axis(Axis(0), frame);
                match previous.and_then(|p| p.frames.get(frame)) {
                    Some(shared) if share_unchanged && **shared == current => Arc::clone(shared),
                    _ => Arc::new(current.to_owned()),
                }
            })
            .collect();
        Self {
            frames,
            annotations: volume.annotations().clone(),
            selection,
        }
    }

    pub fn selection(&self) -> Selection {
        self.selection
    }

    /// Write this snapshot back into `volume`, touching only differing frames.
    pub fn restore(&self, volume: &mut LabelVolume) {
        for (frame, data) in self.frames.iter().enumerate() {
            if volume.labels().index_axis(Axis(0), frame) != **data {
                volume.restore_frame(frame, data);
            }
        }
        volume.replace_annotations(self.annotations.clone());
    }

    /// `(frame, feature)` planes whose pixels differ between two snapshots.
    pub fn changed_planes(&self, other: &Snapshot) -> Vec<(usize, usize)> {
        let mut planes = vec![];
        for (frame, (a, b)) in self.frames.iter().zip(&other.frames).enumerate() {
            if Arc::ptr_eq(a, b) {
                continue;
            }
            for feature in 0..a.len_of(Axis(2)) {
                if a.index_axis(Axis(2), feature) != b.index_axis(Axis(2), feature) {
                    planes.push((frame, feature));
                }
            }
        }
        planes
    }

    /// Number of frame buffers this snapshot shares with `other`.
    pub fn shared_frames(&self, other: &Snapshot) -> usize {
        self.frames
            .iter()
            .zip(&other.frames)
            .filter(|(a, b)| Arc::ptr_eq(a, b))
            .count()
    }
}

#[derive(Debug, Clone)]
pub struct ActionRecord {
    pub id: u64,
    pub prev_id: Option<u64>,
    pub next_id: Option<u64>,
    /// Action that produced this state; None for the opening state.
    pub action: Option<String>,
    pub changes: ChangeSet,
    pub snapshot: Snapshot,
}

/// Where history records live.
pub trait HistoryStore {
    /// Append a record, returning whatever had to be evicted to make room.
    fn push(&mut self, record: ActionRecord) -> Option<ActionRecord>;
    fn get(&self, id: u64) -> Option<&ActionRecord>;
    fn get_mut(&mut self, id: u64) -> Option<&mut ActionRecord>;
    /// Drop every record newer than `id`. Returns how many were dropped.
    fn truncate_after(&mut self, id: u64) -> usize;
    fn first_id(&self) -> Option<u64>;
    fn last_id(&self) -> Option<u64>;
    fn len(&self) -> usize;
    /// Change the cap, evicting the oldest records but never `keep`.
    fn set_capacity(&mut self, capacity: Option<usize>, keep: u64) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-memory ring of records, optionally capped.
#[derive(Debug, Clone, Default)]
pub struct RingStore {
    records: VecDeque<ActionRecord>,
    capacity: Option<usize>,
}

impl RingStore {
    pub fn new(capacity: Option<usize>) -> Self {
        Self {
            records: VecDeque::new(),
            // the current state always has to stay reachable
            capacity: capacity.map(|c| c.max(1)),
        }
    }

    fn index_of(&self, id: u64) -> Option<usize> {
        // ids ascend but have gaps where redo branches were discarded
        self.records.binary_search_by_key(&id, |r| r.id).ok()
    }
}

impl HistoryStore for RingStore {
    fn push(&mut self, record: ActionRecord) -> Option<ActionRecord> {
        self.records.push_back(record);
        match self.capacity {
            Some(cap) if self.records.len() > cap => {
                let evicted = self.records.pop_front();
                if let Some(front) = self.records.front_mut() {
                    front.prev_id = None;
                }
                evicted
            }
            _ => None,
        }
    }

    fn get(&self, id: u64) -> Option<&ActionRecord> {
        self.index_of(id).and_then(|i| self.records.get(i))
    }

    fn get_mut(&mut self, id: u64) -> Option<&mut ActionRecord> {
        self.index_of(id).and_then(move |i| self.records.get_mut(i))
    }

    fn truncate_after(&mut self, id: u64) -> usize {
        match self.index_of(id) {
            Some(index) => {
                let dropped = self.records.len() - index - 1;
                self.records.truncate(index + 1);
                dropped
            }
            None => 0,
        }
    }

    fn first_id(&self) -> Option<u64> {
        self.records.front().map(|r| r.id)
    }

    fn last_id(&self) -> Option<u64> {
        self.records.back().map(|r| r.id)
    }

    fn len(&self) -> usize {
        self.records.len()
    }

    fn set_capacity(&mut self, capacity: Option<usize>, keep: u64) -> usize {
        self.capacity = capacity.map(|c| c.max(1));
        let Some(cap) = self.capacity else {
            return 0;
        };
        let mut evicted = 0;
        while self.records.len() > cap && self.records.front().is_some_and(|r| r.id != keep) {
            self.records.pop_front();
            evicted += 1;
        }
        if let Some(front) = self.records.front_mut() {
            front.prev_id = None;
        }
        evicted
    }
}

/// Result of moving the cursor.
#[derive(Debug, Clone)]
pub struct HistoryStep {
    pub direction: HistoryDirection,
    /// Record the cursor points at after the move.
    pub record_id: u64,
    /// What the undone or redone action had changed.
    pub changes: ChangeSet,
    pub action: Option<String>,
    pub selection: Selection,
    pub planes: Vec<(usize, usize)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryPosition {
    pub cursor: u64,
    pub first: u64,
    pub last: u64,
}

#[derive(Debug, Clone)]
pub struct HistoryLog<S: HistoryStore = RingStore> {
    store: S,
    cursor: u64,
    next_id: u64,
    share_unchanged: bool,
}

impl HistoryLog<RingStore> {
    pub fn new(
        volume: &LabelVolume,
        selection: Selection,
        capacity: Option<usize>,
        share_unchanged: bool,
    ) -> Self {
        Self::with_store(RingStore::new(capacity), volume, selection, share_unchanged)
    }
}

impl<S: HistoryStore> HistoryLog<S> {
    pub fn with_store(
        mut store: S,
        volume: &LabelVolume,
        selection: Selection,
        share_unchanged: bool,
    ) -> Self {
        store.push(ActionRecord {
            id: 0,
            prev_id: None,
            next_id: None,
            action: None,
            changes: ChangeSet::default(),
            snapshot: Snapshot::capture(volume, selection, None, share_unchanged),
        });
        Self {
            store,
            cursor: 0,
            next_id: 1,
            share_unchanged,
        }
    }

    fn record(&self, id: u64) -> EngineResult<&ActionRecord> {
        self.store.get(id).ok_or_else(|| {
            EngineError::new(ErrorCode::Internal, format!("History record {id} is missing"))
        })
    }

    pub fn current(&self) -> EngineResult<&ActionRecord> {
        self.record(self.cursor)
    }

    pub fn position(&self) -> HistoryPosition {
        HistoryPosition {
            cursor: self.cursor,
            first: self.store.first_id().unwrap_or(self.cursor),
            last: self.store.last_id().unwrap_or(self.cursor),
        }
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    pub fn can_undo(&self) -> bool {
        self.store
            .get(self.cursor)
            .and_then(|r| r.prev_id)
            .is_some_and(|id| self.store.get(id).is_some())
    }

    pub fn can_redo(&self) -> bool {
        self.store
            .get(self.cursor)
            .and_then(|r| r.next_id)
            .is_some()
    }

    pub fn set_capacity(&mut self, capacity: Option<usize>) {
        let evicted = self.store.set_capacity(capacity, self.cursor);
        if evicted > 0 {
            info!(evicted, "history capacity lowered, dropped oldest records");
        }
    }

    pub fn set_share_unchanged(&mut self, share: bool) {
        self.share_unchanged = share;
    }

    /// Record the state `volume` is in after a successful action.
    pub fn commit(
        &mut self,
        volume: &LabelVolume,
        selection: Selection,
        action: &str,
        changes: ChangeSet,
    ) -> EngineResult<u64> {
        let dropped = self.store.truncate_after(self.cursor);
        if dropped > 0 {
            debug!(dropped, cursor = self.cursor, "discarded redo branch");
        }
        let snapshot = Snapshot::capture(
            volume,
            selection,
            Some(&self.current()?.snapshot),
            self.share_unchanged,
        );
        let id = self.next_id;
        self.next_id += 1;
        if let Some(previous) = self.store.get_mut(self.cursor) {
            previous.next_id = Some(id);
        }
        let evicted = self.store.push(ActionRecord {
            id,
            prev_id: Some(self.cursor),
            next_id: None,
            action: Some(action.to_string()),
            changes,
            snapshot,
        });
        if let Some(evicted) = evicted {
            info!(record = evicted.id, "history capacity reached, dropped oldest record");
        }
        self.cursor = id;
        Ok(id)
    }

    /// Put the volume back into the state the cursor points at.
    pub fn restore_current(&self, volume: &mut LabelVolume) -> EngineResult<Selection> {
        let record = self.current()?;
        record.snapshot.restore(volume);
        Ok(record.snapshot.selection())
    }

    /// Step back one record. Returns None at the head of the chain.
    pub fn undo(&mut self, volume: &mut LabelVolume) -> EngineResult<Option<HistoryStep>> {
        if !self.can_undo() {
            return Ok(None);
        }
        let undone = self.current()?;
        let Some(target_id) = undone.prev_id else {
            return Ok(None);
        };
        let target = self.record(target_id)?;
        let step = HistoryStep {
            direction: HistoryDirection::Undo,
            record_id: target_id,
            changes: undone.changes,
            action: undone.action.clone(),
            selection: target.snapshot.selection(),
            planes: undone.snapshot.changed_planes(&target.snapshot),
        };
        target.snapshot.restore(volume);
        self.cursor = target_id;
        debug!(record = target_id, "undo");
        Ok(Some(step))
    }

    /// Step forward one record. Returns None at the tail of the chain.
    pub fn redo(&mut self, volume: &mut LabelVolume) -> EngineResult<Option<HistoryStep>> {
        let Some(target_id) = self.current()?.next_id else {
            return Ok(None);
        };
        let current = self.current()?;
        let target = self.record(target_id)?;
        let step = HistoryStep {
            direction: HistoryDirection::Redo,
            record_id: target_id,
            changes: target.changes,
            action: target.action.clone(),
            selection: target.snapshot.selection(),
            planes: current.snapshot.changed_planes(&target.snapshot),
        };
        target.snapshot.restore(volume);
        self.cursor = target_id;
        debug!(record = target_id, "redo");
        Ok(Some(step))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array4, s};

    fn volume(frames: usize) -> LabelVolume {
        let raw = Array4::<f32>::zeros((frames, 2, 2, 1));
        let mut labels = Array4::<Label>::zeros((frames, 2, 2, 1));
        labels[[0, 0, 0, 0]] = 1;
        LabelVolume::zstack(raw, labels).unwrap()
    }

    fn paint(volume: &mut LabelVolume, frame: usize, label: Label) -> ChangeSet {
        let mut plane = volume.get_label_plane(frame, 0).to_owned();
        plane[(1, 1)] = label;
        volume.write_plane(frame, 0, plane)
    }

    #[test]
    fn test_undo_redo_round_trip() {
        let mut vol = volume(3);
        let mut log = HistoryLog::new(&vol, Selection::default(), None, true);
        let before = vol.clone();
        let changes = paint(&mut vol, 1, 7);
        let selection = Selection {
            frame: 1,
            ..Selection::default()
        };
        log.commit(&vol, selection, "handle_draw", changes).unwrap();
        let after = vol.clone();

        let step = log.undo(&mut vol).unwrap().unwrap();
        assert_eq!(vol, before);
        assert_eq!(step.planes, vec![(1, 0)]);
        assert!(step.changes.frame);
        assert_eq!(step.selection, Selection::default());

        let step = log.redo(&mut vol).unwrap().unwrap();
        assert_eq!(vol, after);
        assert_eq!(step.selection.frame, 1);
        assert_eq!(step.action.as_deref(), Some("handle_draw"));
    }

    #[test]
    fn test_undo_at_head_and_redo_at_tail_are_noops() {
        let mut vol = volume(1);
        let mut log = HistoryLog::new(&vol, Selection::default(), None, true);
        assert!(log.undo(&mut vol).unwrap().is_none());
        assert!(log.redo(&mut vol).unwrap().is_none());
        assert_eq!(log.position().cursor, 0);
    }

    #[test]
    fn test_commit_after_undo_discards_branch() {
        let mut vol = volume(2);
        let mut log = HistoryLog::new(&vol, Selection::default(), None, true);
        let changes = paint(&mut vol, 0, 4);
        log.commit(&vol, Selection::default(), "a", changes).unwrap();
        let changes = paint(&mut vol, 1, 5);
        log.commit(&vol, Selection::default(), "b", changes).unwrap();
        log.undo(&mut vol).unwrap();
        let changes = paint(&mut vol, 1, 6);
        let id = log.commit(&vol, Selection::default(), "c", changes).unwrap();
        assert_eq!(id, 3);
        assert!(!log.can_redo());
        assert_eq!(log.len(), 3);
        log.undo(&mut vol).unwrap();
        assert_eq!(log.current().unwrap().action.as_deref(), Some("a"));
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let mut vol = volume(1);
        let mut log = HistoryLog::new(&vol, Selection::default(), Some(2), true);
        for label in 2..5 {
            let changes = paint(&mut vol, 0, label);
            log.commit(&vol, Selection::default(), "draw", changes).unwrap();
        }
        assert_eq!(log.len(), 2);
        assert!(log.undo(&mut vol).unwrap().is_some());
        assert!(log.undo(&mut vol).unwrap().is_none());
        assert_eq!(vol.labels()[[0, 1, 1, 0]], 3);
    }

    #[test]
    fn test_lowering_capacity_keeps_cursor() {
        let mut vol = volume(1);
        let mut log = HistoryLog::new(&vol, Selection::default(), None, true);
        for label in 2..6 {
            let changes = paint(&mut vol, 0, label);
            log.commit(&vol, Selection::default(), "draw", changes).unwrap();
        }
        log.undo(&mut vol).unwrap();
        log.undo(&mut vol).unwrap();
        log.undo(&mut vol).unwrap();
        // cursor sits on record 1; records 0 and 1 are older than the cap allows
        log.set_capacity(Some(2));
        assert_eq!(log.position().first, 1);
        assert_eq!(log.position().cursor, 1);
        assert!(!log.can_undo());
        assert!(log.can_redo());
    }

    #[test]
    fn test_snapshots_share_untouched_frames() {
        let mut vol = volume(4);
        let first = Snapshot::capture(&vol, Selection::default(), None, true);
        paint(&mut vol, 2, 9);
        let second = Snapshot::capture(&vol, Selection::default(), Some(&first), true);
        assert_eq!(second.shared_frames(&first), 3);
        let unshared = Snapshot::capture(&vol, Selection::default(), Some(&first), false);
        assert_eq!(unshared.shared_frames(&first), 0);
    }

    #[test]
    fn test_restore_current_rolls_back_uncommitted_edits() {
        let mut vol = volume(2);
        let log = HistoryLog::new(&vol, Selection::default(), None, true);
        let before = vol.clone();
        vol.labels_mut().slice_mut(s![1, .., .., 0]).fill(8);
        vol.reindex(0);
        log.restore_current(&mut vol).unwrap();
        assert_eq!(vol, before);
    }
}
