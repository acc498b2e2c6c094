use crate::error::{EngineError, EngineResult};
use crate::history::{HistoryLog, HistoryPosition, HistoryStep};
use crate::lineage::LineageTracked;
use crate::mask::{self, BoundingBox, SplitParams, SWAP_SENTINEL};
use crate::matcher::{IdentityMatcher, DEFAULT_IOU_THRESHOLD};
use crate::volume::{LabelVolume, Plane};
use cellmask_protocol::{
    Capabilities, ChangeSet, ErrorCode, FileKind, HistoryPayload, Label, PlanePayload,
    Selection, PROTOCOL_VERSION,
};
use ndarray::{s, Axis};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::{debug, info};

pub type OpId = String;

/// Runtime knobs of the engine. Missing fields take their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineParameters {
    /// Number of history records kept; None keeps everything.
    pub history_capacity: Option<usize>,
    pub iou_threshold: f64,
    /// Factor between the low and high hysteresis thresholds.
    pub threshold_stringency: f32,
    pub watershed_min_pixels: usize,
    pub watershed_dilation_radius: usize,
    /// Let consecutive history snapshots share frames an action left alone.
    pub share_unchanged_frames: bool,
}

impl Default for EngineParameters {
    fn default() -> Self {
        Self {
            history_capacity: None,
            iou_threshold: DEFAULT_IOU_THRESHOLD,
            threshold_stringency: 1.10,
            watershed_min_pixels: 5,
            watershed_dilation_radius: 3,
            share_unchanged_frames: true,
        }
    }
}

impl EngineParameters {
    pub const NAMES: [&'static str; 6] = [
        "history_capacity",
        "iou_threshold",
        "threshold_stringency",
        "watershed_min_pixels",
        "watershed_dilation_radius",
        "share_unchanged_frames",
    ];

    pub fn load_from_path(path: &str) -> EngineResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| EngineError {
            code: ErrorCode::Io,
            message: format!("Could not read parameter file '{path}': {e}"),
        })?;
        serde_json::from_str(&text).map_err(|e| EngineError {
            code: ErrorCode::InvalidInput,
            message: format!("Could not parse parameter file '{path}': {e}"),
        })
    }

    pub fn split_params(&self) -> SplitParams {
        SplitParams {
            min_pixels: self.watershed_min_pixels,
            dilation_radius: self.watershed_dilation_radius,
        }
    }

    pub fn matcher(&self) -> IdentityMatcher {
        IdentityMatcher::new(self.iou_threshold)
    }

    /// Set one parameter by name from a JSON value. Returns a status line.
    pub fn set(&mut self, name: &str, value: &serde_json::Value) -> EngineResult<String> {
        let positive = |what: &str| -> EngineResult<usize> {
            value
                .as_u64()
                .filter(|v| *v > 0)
                .map(|v| v as usize)
                .ok_or_else(|| {
                    EngineError::invalid_input(format!("{what} requires a positive integer"))
                })
        };
        let number = |what: &str| -> EngineResult<f64> {
            value
                .as_f64()
                .filter(|v| v.is_finite() && *v >= 0.0)
                .ok_or_else(|| {
                    EngineError::invalid_input(format!("{what} requires a non-negative number"))
                })
        };
        match name {
            "history_capacity" => {
                self.history_capacity = if value.is_null() {
                    None
                } else {
                    Some(positive(name)?)
                };
            }
            "iou_threshold" => {
                let v = number(name)?;
                if v >= 1.0 {
                    return Err(EngineError::invalid_input(
                        "iou_threshold must be below 1.0",
                    ));
                }
                self.iou_threshold = v;
            }
            "threshold_stringency" => {
                let v = number(name)?;
                if v < 1.0 {
                    return Err(EngineError::invalid_input(
                        "threshold_stringency must be >= 1.0",
                    ));
                }
                self.threshold_stringency = v as f32;
            }
            "watershed_min_pixels" => self.watershed_min_pixels = positive(name)?,
            "watershed_dilation_radius" => self.watershed_dilation_radius = positive(name)?,
            "share_unchanged_frames" => {
                self.share_unchanged_frames = value.as_bool().ok_or_else(|| {
                    EngineError::invalid_input("share_unchanged_frames requires true or false")
                })?;
            }
            _ => {
                return Err(EngineError::invalid_input(format!(
                    "Unknown parameter '{name}'"
                )));
            }
        }
        Ok(format!("Set parameter '{name}' to {value}"))
    }
}

/// One editing action. Coordinates are in volume space; `trace` points
/// are `[row, col]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", content = "params", rename_all = "snake_case")]
pub enum Action {
    ChangeFrame {
        frame: usize,
    },
    ChangeChannel {
        channel: usize,
    },
    ChangeFeature {
        feature: usize,
    },
    NewSingleCell {
        label: Label,
        frame: usize,
    },
    DeleteMask {
        label: Label,
        frame: usize,
    },
    SwapSingleFrame {
        label_1: Label,
        label_2: Label,
        frame: usize,
    },
    SwapAllFrame {
        label_1: Label,
        label_2: Label,
    },
    HandleDraw {
        trace: Vec<(usize, usize)>,
        target_value: Label,
        brush_value: Label,
        brush_size: usize,
        erase: bool,
        frame: usize,
    },
    TrimPixels {
        label: Label,
        frame: usize,
        x_location: usize,
        y_location: usize,
    },
    FillHole {
        label: Label,
        frame: usize,
        x_location: usize,
        y_location: usize,
    },
    FloodContiguous {
        label: Label,
        frame: usize,
        x_location: usize,
        y_location: usize,
    },
    Watershed {
        label: Label,
        frame: usize,
        x1_location: usize,
        y1_location: usize,
        x2_location: usize,
        y2_location: usize,
    },
    Threshold {
        y1: usize,
        x1: usize,
        y2: usize,
        x2: usize,
        frame: usize,
        label: Label,
    },
    NewCellStack {
        label: Label,
        frame: usize,
    },
    ReplaceSingle {
        label_1: Label,
        label_2: Label,
        frame: usize,
    },
    /// Z-stacks: relabel everywhere. Tracks: merge `label_2` into `label_1`.
    Replace {
        label_1: Label,
        label_2: Label,
    },
    PredictSingle {
        frame: usize,
    },
    PredictZstack {},
    NewTrack {
        label: Label,
        frame: usize,
    },
    /// `label_1` is the parent of `label_2`.
    SetParent {
        label_1: Label,
        label_2: Label,
    },
    SwapTracks {
        label_1: Label,
        label_2: Label,
    },
}

impl Action {
    pub const NAMES: [&'static str; 21] = [
        "change_frame",
        "change_channel",
        "change_feature",
        "new_single_cell",
        "delete_mask",
        "swap_single_frame",
        "swap_all_frame",
        "handle_draw",
        "trim_pixels",
        "fill_hole",
        "flood_contiguous",
        "watershed",
        "threshold",
        "new_cell_stack",
        "replace_single",
        "replace",
        "predict_single",
        "predict_zstack",
        "new_track",
        "set_parent",
        "swap_tracks",
    ];
    pub const ZSTACK_ONLY: [&'static str; 4] = [
        "new_cell_stack",
        "replace_single",
        "predict_single",
        "predict_zstack",
    ];
    pub const TRACK_ONLY: [&'static str; 3] = ["new_track", "set_parent", "swap_tracks"];

    pub fn name(&self) -> &'static str {
        match self {
            Self::ChangeFrame { .. } => "change_frame",
            Self::ChangeChannel { .. } => "change_channel",
            Self::ChangeFeature { .. } => "change_feature",
            Self::NewSingleCell { .. } => "new_single_cell",
            Self::DeleteMask { .. } => "delete_mask",
            Self::SwapSingleFrame { .. } => "swap_single_frame",
            Self::SwapAllFrame { .. } => "swap_all_frame",
            Self::HandleDraw { .. } => "handle_draw",
            Self::TrimPixels { .. } => "trim_pixels",
            Self::FillHole { .. } => "fill_hole",
            Self::FloodContiguous { .. } => "flood_contiguous",
            Self::Watershed { .. } => "watershed",
            Self::Threshold { .. } => "threshold",
            Self::NewCellStack { .. } => "new_cell_stack",
            Self::ReplaceSingle { .. } => "replace_single",
            Self::Replace { .. } => "replace",
            Self::PredictSingle { .. } => "predict_single",
            Self::PredictZstack {} => "predict_zstack",
            Self::NewTrack { .. } => "new_track",
            Self::SetParent { .. } => "set_parent",
            Self::SwapTracks { .. } => "swap_tracks",
        }
    }

    /// Build an action from a name and its named parameters.
    pub fn from_request(name: &str, params: serde_json::Value) -> EngineResult<Self> {
        if !Self::NAMES.contains(&name) {
            return Err(EngineError::new(
                ErrorCode::InvalidAction,
                format!("Invalid action \"{name}\""),
            ));
        }
        let params = if params.is_null() {
            serde_json::json!({})
        } else {
            params
        };
        serde_json::from_value(serde_json::json!({ "action": name, "params": params })).map_err(
            |e| EngineError::invalid_input(format!("Invalid parameters for '{name}': {e}")),
        )
    }

    /// Parse `{"action": NAME, "params": {...}}`.
    pub fn from_json(value: serde_json::Value) -> EngineResult<Self> {
        let name = value
            .get("action")
            .and_then(|v| v.as_str())
            .ok_or_else(|| EngineError::invalid_input("Action requires an 'action' name"))?
            .to_string();
        let params = value.get("params").cloned().unwrap_or(serde_json::Value::Null);
        Self::from_request(&name, params)
    }

    fn required_kind(&self) -> Option<FileKind> {
        let name = self.name();
        if Self::ZSTACK_ONLY.contains(&name) {
            Some(FileKind::ZStack)
        } else if Self::TRACK_ONLY.contains(&name) {
            Some(FileKind::Track)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResult {
    pub op_id: OpId,
    pub action: String,
    pub changes: ChangeSet,
    /// Frame the action was applied to, for single-frame edits.
    pub frame: Option<usize>,
    pub warnings: Vec<String>,
    pub messages: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationRecord {
    pub action: Action,
    pub result: ActionResult,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSummary {
    pub kind: FileKind,
    pub frames: usize,
    pub height: usize,
    pub width: usize,
    pub channels: usize,
    pub features: usize,
    pub selection: Selection,
    pub labels_per_feature: Vec<usize>,
    pub history: HistoryPosition,
    pub can_undo: bool,
    pub can_redo: bool,
    pub operations: usize,
}

pub trait Engine {
    fn apply(&mut self, action: Action) -> EngineResult<ActionResult>;
    fn apply_batch(&mut self, actions: Vec<Action>) -> EngineResult<Vec<ActionResult>>;
    /// None when there is nothing to undo.
    fn undo(&mut self) -> EngineResult<Option<HistoryPayload>>;
    /// None when there is nothing to redo.
    fn redo(&mut self) -> EngineResult<Option<HistoryPayload>>;
    fn volume(&self) -> &LabelVolume;
}

/// Editing session bound to one label volume.
#[derive(Debug, Clone)]
pub struct LabelEngine {
    volume: LabelVolume,
    selection: Selection,
    parameters: EngineParameters,
    history: HistoryLog,
    journal: Vec<OperationRecord>,
    op_counter: u64,
}

impl LabelEngine {
    pub fn new(volume: LabelVolume) -> Self {
        Self::with_parameters(volume, EngineParameters::default())
    }

    pub fn with_parameters(volume: LabelVolume, parameters: EngineParameters) -> Self {
        let selection = Selection::default();
        let history = HistoryLog::new(
            &volume,
            selection,
            parameters.history_capacity,
            parameters.share_unchanged_frames,
        );
        Self {
            volume,
            selection,
            parameters,
            history,
            journal: vec![],
            op_counter: 0,
        }
    }

    pub fn selection(&self) -> Selection {
        self.selection
    }

    pub fn parameters(&self) -> &EngineParameters {
        &self.parameters
    }

    pub fn history(&self) -> &HistoryLog {
        &self.history
    }

    pub fn operation_log(&self) -> &[OperationRecord] {
        &self.journal
    }

    /// Hand the volume over, e.g. for export.
    pub fn into_volume(self) -> LabelVolume {
        self.volume
    }

    pub fn capabilities() -> Capabilities {
        Capabilities {
            protocol_version: PROTOCOL_VERSION.to_string(),
            supported_actions: Action::NAMES.iter().map(|n| n.to_string()).collect(),
            zstack_only_actions: Action::ZSTACK_ONLY.iter().map(|n| n.to_string()).collect(),
            track_only_actions: Action::TRACK_ONLY.iter().map(|n| n.to_string()).collect(),
            file_kinds: vec![
                FileKind::ZStack.as_str().to_string(),
                FileKind::Track.as_str().to_string(),
            ],
            deterministic_history: true,
        }
    }

    pub fn summarize(&self) -> EngineSummary {
        EngineSummary {
            kind: self.volume.kind(),
            frames: self.volume.num_frames(),
            height: self.volume.height(),
            width: self.volume.width(),
            channels: self.volume.num_channels(),
            features: self.volume.num_features(),
            selection: self.selection,
            labels_per_feature: (0..self.volume.num_features())
                .map(|f| self.volume.cell_ids(f).len())
                .collect(),
            history: self.history.position(),
            can_undo: self.history.can_undo(),
            can_redo: self.history.can_redo(),
            operations: self.journal.len(),
        }
    }

    pub fn set_parameter(&mut self, name: &str, value: &serde_json::Value) -> EngineResult<String> {
        let message = self.parameters.set(name, value)?;
        match name {
            "history_capacity" => self.history.set_capacity(self.parameters.history_capacity),
            "share_unchanged_frames" => self
                .history
                .set_share_unchanged(self.parameters.share_unchanged_frames),
            _ => {}
        }
        Ok(message)
    }

    /// Every structural problem of the identity layer, empty when consistent.
    pub fn check_consistency(&self) -> Vec<String> {
        let mut problems: Vec<String> = (0..self.volume.num_features())
            .filter_map(|f| self.volume.verify_index(f).err())
            .collect();
        if let Some(graph) = self.volume.lineage() {
            problems.extend(graph.check_invariants());
        }
        problems
    }

    fn next_op_id(&mut self) -> OpId {
        self.op_counter += 1;
        format!("op-{}", self.op_counter)
    }

    fn check_label(label: Label) -> EngineResult<()> {
        if label == 0 || label == SWAP_SENTINEL {
            return Err(EngineError::invalid_input(format!(
                "Label {label} cannot be edited"
            )));
        }
        Ok(())
    }

    fn check_distinct(a: Label, b: Label) -> EngineResult<()> {
        Self::check_label(a)?;
        Self::check_label(b)?;
        if a == b {
            return Err(EngineError::invalid_input(format!(
                "Labels must differ, got {a} twice"
            )));
        }
        Ok(())
    }

    fn check_kind(&self, action: &Action) -> EngineResult<()> {
        match action.required_kind() {
            Some(kind) if kind != self.volume.kind() => Err(EngineError::unsupported(format!(
                "Action '{}' is not available for {} files",
                action.name(),
                self.volume.kind().as_str()
            ))),
            _ => Ok(()),
        }
    }

    fn fresh_label(&self) -> EngineResult<Label> {
        mask::next_label(self.volume.max_label(self.selection.feature))
    }

    fn commit_plane(&mut self, frame: usize, staged: Plane) -> ChangeSet {
        self.volume
            .write_plane(frame, self.selection.feature, staged)
    }

    /// Relabel pixels of one feature from `start` on, without touching the index.
    fn relabel_frames(&mut self, start: usize, from: Label, to: Label) -> bool {
        let feature = self.selection.feature;
        let mut stack = self
            .volume
            .labels_mut()
            .slice_mut(s![start.., .., .., feature]);
        let mut changed = false;
        stack.mapv_inplace(|v| {
            if v == from {
                changed = true;
                to
            } else {
                v
            }
        });
        changed
    }

    fn swap_frames(&mut self, a: Label, b: Label) -> bool {
        let changed = self.relabel_frames(0, a, SWAP_SENTINEL);
        let changed = self.relabel_frames(0, b, a) | changed;
        self.relabel_frames(0, SWAP_SENTINEL, b) | changed
    }

    fn lineage(&mut self) -> EngineResult<&mut dyn LineageTracked> {
        self.volume
            .lineage_mut()
            .map(|g| g as &mut dyn LineageTracked)
            .ok_or_else(|| EngineError::unsupported("Volume has no lineage"))
    }

    fn plane_payload(&self, frame: usize, feature: usize) -> PlanePayload {
        let plane = self.volume.get_label_plane(frame, feature);
        PlanePayload {
            frame,
            feature,
            height: plane.nrows(),
            width: plane.ncols(),
            labels: plane.iter().copied().collect(),
        }
    }

    fn history_payload(&self, step: HistoryStep) -> HistoryPayload {
        let include_table = step.changes.identity || self.volume.kind() == FileKind::Track;
        HistoryPayload {
            direction: step.direction,
            record_id: step.record_id,
            changes: step.changes,
            selection: step.selection,
            planes: step
                .planes
                .iter()
                .map(|&(frame, feature)| self.plane_payload(frame, feature))
                .collect(),
            table: include_table.then(|| self.volume.annotations().readable_table()),
        }
    }

    fn apply_internal(&mut self, action: Action, op_id: OpId) -> EngineResult<ActionResult> {
        self.check_kind(&action)?;
        let feature = self.selection.feature;
        let channel = self.selection.channel;
        let mut result = ActionResult {
            op_id,
            action: action.name().to_string(),
            changes: ChangeSet::default(),
            frame: None,
            warnings: vec![],
            messages: vec![],
        };
        let mut changes = ChangeSet::default();

        match action {
            Action::ChangeFrame { frame } => {
                self.volume.check_frame(frame)?;
                self.selection.frame = frame;
                changes.selection = true;
                result.messages.push(format!("Selected frame {frame}"));
            }
            Action::ChangeChannel { channel } => {
                self.volume.check_channel(channel)?;
                self.selection.channel = channel;
                changes.selection = true;
                changes.raw = true;
                result.messages.push(format!("Selected channel {channel}"));
            }
            Action::ChangeFeature { feature } => {
                self.volume.check_feature(feature)?;
                self.selection.feature = feature;
                changes.selection = true;
                result.messages.push(format!("Selected feature {feature}"));
            }
            Action::NewSingleCell { label, frame } => {
                Self::check_label(label)?;
                self.volume.check_frame(frame)?;
                let new_label = self.fresh_label()?;
                let staged = mask::relabel(self.volume.get_label_plane(frame, feature), label, new_label);
                changes.merge(self.commit_plane(frame, staged));
                result.frame = Some(frame);
                if changes.frame {
                    result
                        .messages
                        .push(format!("Relabelled {label} as {new_label} in frame {frame}"));
                }
            }
            Action::DeleteMask { label, frame } => {
                Self::check_label(label)?;
                self.volume.check_frame(frame)?;
                let staged = mask::relabel(self.volume.get_label_plane(frame, feature), label, 0);
                changes.merge(self.commit_plane(frame, staged));
                result.frame = Some(frame);
                if changes.frame {
                    result
                        .messages
                        .push(format!("Deleted {label} from frame {frame}"));
                }
            }
            Action::SwapSingleFrame {
                label_1,
                label_2,
                frame,
            } => {
                Self::check_distinct(label_1, label_2)?;
                self.volume.check_frame(frame)?;
                let staged =
                    mask::swap_labels(self.volume.get_label_plane(frame, feature), label_1, label_2)?;
                changes.merge(self.commit_plane(frame, staged));
                result.frame = Some(frame);
            }
            Action::SwapAllFrame { label_1, label_2 } => {
                Self::check_distinct(label_1, label_2)?;
                if self.swap_frames(label_1, label_2) {
                    self.volume
                        .annotations_mut()
                        .identity_mut()
                        .exchange_frames(feature, label_1, label_2);
                    changes.all_frames = true;
                    changes.identity = true;
                }
                result
                    .messages
                    .push(format!("Swapped {label_1} and {label_2} in every frame"));
            }
            Action::HandleDraw {
                trace,
                target_value,
                brush_value,
                brush_size,
                erase,
                frame,
            } => {
                Self::check_label(brush_value)?;
                self.volume.check_frame(frame)?;
                let staged = mask::brush_stroke(
                    self.volume.get_label_plane(frame, feature),
                    &trace,
                    target_value,
                    brush_value,
                    brush_size,
                    erase,
                )?;
                changes.merge(self.commit_plane(frame, staged));
                result.frame = Some(frame);
            }
            Action::TrimPixels {
                label,
                frame,
                x_location,
                y_location,
            } => {
                Self::check_label(label)?;
                self.volume.check_frame(frame)?;
                let staged = mask::trim_stray(
                    self.volume.get_label_plane(frame, feature),
                    label,
                    (y_location, x_location),
                )?;
                changes.merge(self.commit_plane(frame, staged));
                result.frame = Some(frame);
            }
            Action::FillHole {
                label,
                frame,
                x_location,
                y_location,
            } => {
                Self::check_label(label)?;
                self.volume.check_frame(frame)?;
                let staged = mask::fill_hole(
                    self.volume.get_label_plane(frame, feature),
                    label,
                    (y_location, x_location),
                )?;
                changes.merge(self.commit_plane(frame, staged));
                result.frame = Some(frame);
            }
            Action::FloodContiguous {
                label,
                frame,
                x_location,
                y_location,
            } => {
                self.volume.check_frame(frame)?;
                let new_label = self.fresh_label()?;
                let plane = self.volume.get_label_plane(frame, feature);
                let seed = (y_location, x_location);
                if plane.get(seed).is_some_and(|&v| v != label) {
                    result.warnings.push(format!(
                        "Seed holds label {}, not {label}; flooding it anyway",
                        plane[seed]
                    ));
                }
                let staged = mask::flood_component(plane, seed, new_label)?;
                changes.merge(self.commit_plane(frame, staged));
                result.frame = Some(frame);
                result
                    .messages
                    .push(format!("Flooded component as {new_label}"));
            }
            Action::Watershed {
                label,
                frame,
                x1_location,
                y1_location,
                x2_location,
                y2_location,
            } => {
                Self::check_label(label)?;
                self.volume.check_frame(frame)?;
                let new_label = self.fresh_label()?;
                let staged = mask::watershed_split(
                    self.volume.get_label_plane(frame, feature),
                    self.volume.raw_plane(frame, channel),
                    label,
                    new_label,
                    (y1_location, x1_location),
                    (y2_location, x2_location),
                    self.parameters.split_params(),
                )?;
                changes.merge(self.commit_plane(frame, staged));
                result.frame = Some(frame);
                if self.volume.frames_of(feature, new_label).is_some() {
                    result
                        .messages
                        .push(format!("Split {label}; new label {new_label}"));
                } else {
                    result
                        .warnings
                        .push(format!("Watershed left {label} in one piece"));
                }
            }
            Action::Threshold {
                y1,
                x1,
                y2,
                x2,
                frame,
                label,
            } => {
                Self::check_label(label)?;
                self.volume.check_frame(frame)?;
                let staged = mask::threshold_predict(
                    self.volume.get_label_plane(frame, feature),
                    self.volume.raw_plane(frame, channel),
                    BoundingBox::from_corners((y1, x1), (y2, x2)),
                    label,
                    self.parameters.threshold_stringency,
                )?;
                changes.merge(self.commit_plane(frame, staged));
                result.frame = Some(frame);
            }
            Action::NewCellStack { label, frame } => {
                Self::check_label(label)?;
                self.volume.check_frame(frame)?;
                let new_label = self.fresh_label()?;
                for f in frame..self.volume.num_frames() {
                    let staged = mask::relabel(self.volume.get_label_plane(f, feature), label, new_label);
                    changes.merge(self.commit_plane(f, staged));
                }
                changes.all_frames = changes.frame;
                result.messages.push(format!(
                    "Relabelled {label} as {new_label} from frame {frame} on"
                ));
            }
            Action::ReplaceSingle {
                label_1,
                label_2,
                frame,
            } => {
                Self::check_distinct(label_1, label_2)?;
                self.volume.check_frame(frame)?;
                let staged = mask::relabel(self.volume.get_label_plane(frame, feature), label_2, label_1);
                changes.merge(self.commit_plane(frame, staged));
                result.frame = Some(frame);
            }
            Action::Replace { label_1, label_2 } => {
                Self::check_distinct(label_1, label_2)?;
                match self.volume.kind() {
                    FileKind::ZStack => {
                        for f in 0..self.volume.num_frames() {
                            let staged =
                                mask::relabel(self.volume.get_label_plane(f, feature), label_2, label_1);
                            changes.merge(self.commit_plane(f, staged));
                        }
                        changes.all_frames = changes.frame;
                    }
                    FileKind::Track => {
                        if let Some(graph) = self.volume.lineage() {
                            graph.check_pair(label_1, label_2)?;
                        }
                        changes.all_frames = self.relabel_frames(0, label_2, label_1);
                        self.lineage()?.merge_tracks(label_1, label_2)?;
                        changes.identity = true;
                    }
                }
                result
                    .messages
                    .push(format!("Replaced {label_2} with {label_1}"));
            }
            Action::PredictSingle { frame } => {
                self.volume.check_frame(frame)?;
                result.frame = Some(frame);
                if frame == 0 {
                    result
                        .warnings
                        .push("Frame 0 has no previous frame to predict from".to_string());
                } else {
                    let staged = self.parameters.matcher().predict_next(
                        self.volume.get_label_plane(frame - 1, feature),
                        self.volume.get_label_plane(frame, feature),
                    )?;
                    changes.merge(self.commit_plane(frame, staged));
                }
            }
            Action::PredictZstack {} => {
                let predicted = self
                    .parameters
                    .matcher()
                    .predict_stack(self.volume.feature_stack(feature))?;
                if predicted != self.volume.feature_stack(feature) {
                    self.volume
                        .labels_mut()
                        .index_axis_mut(Axis(3), feature)
                        .assign(&predicted);
                    self.volume.reindex(feature);
                    changes.all_frames = true;
                    changes.identity = true;
                }
            }
            Action::NewTrack { label, frame } => {
                Self::check_label(label)?;
                self.volume.check_frame(frame)?;
                if let Some(graph) = self.volume.lineage() {
                    graph.check_split(label, frame)?;
                }
                let new_label = self.fresh_label()?;
                changes.all_frames = self.relabel_frames(frame, label, new_label);
                self.lineage()?.split_track(label, new_label, frame)?;
                changes.identity = true;
                result.messages.push(format!(
                    "Track {label} continues as {new_label} from frame {frame}"
                ));
            }
            Action::SetParent { label_1, label_2 } => {
                Self::check_distinct(label_1, label_2)?;
                self.lineage()?.set_parent(label_1, label_2)?;
                changes.identity = true;
                result
                    .messages
                    .push(format!("{label_1} is now the parent of {label_2}"));
            }
            Action::SwapTracks { label_1, label_2 } => {
                Self::check_distinct(label_1, label_2)?;
                if let Some(graph) = self.volume.lineage() {
                    graph.check_pair(label_1, label_2)?;
                }
                changes.all_frames = self.swap_frames(label_1, label_2);
                self.lineage()?.swap_tracks(label_1, label_2)?;
                changes.identity = true;
            }
        }

        result.changes = changes;
        Ok(result)
    }
}

impl Engine for LabelEngine {
    fn apply(&mut self, action: Action) -> EngineResult<ActionResult> {
        let started = Instant::now();
        let op_id = self.next_op_id();
        let result = match self.apply_internal(action.clone(), op_id) {
            Ok(result) => result,
            Err(err) => {
                // no partial edits survive a failed action
                self.selection = self.history.restore_current(&mut self.volume)?;
                debug!(action = action.name(), error = %err, "action rejected");
                return Err(err);
            }
        };
        self.history
            .commit(&self.volume, self.selection, action.name(), result.changes)?;
        info!(
            op_id = %result.op_id,
            action = action.name(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "applied action"
        );
        self.journal.push(OperationRecord {
            action,
            result: result.clone(),
        });
        Ok(result)
    }

    fn apply_batch(&mut self, actions: Vec<Action>) -> EngineResult<Vec<ActionResult>> {
        let mut results = Vec::new();
        for action in actions {
            results.push(self.apply(action)?);
        }
        Ok(results)
    }

    fn undo(&mut self) -> EngineResult<Option<HistoryPayload>> {
        let Some(step) = self.history.undo(&mut self.volume)? else {
            return Ok(None);
        };
        self.selection = step.selection;
        Ok(Some(self.history_payload(step)))
    }

    fn redo(&mut self) -> EngineResult<Option<HistoryPayload>> {
        let Some(step) = self.history.redo(&mut self.volume)? else {
            return Ok(None);
        };
        self.selection = step.selection;
        Ok(Some(self.history_payload(step)))
    }

    fn volume(&self) -> &LabelVolume {
        &self.volume
    }
}
