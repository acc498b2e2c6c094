//! Machine-readable contracts shared by the cellmask engine, shell and CLI.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Integer object id inside a label plane. 0 is background.
pub type Label = u32;

pub const PROTOCOL_VERSION: &str = "v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileKind {
    /// Multi-feature z-stack or time series without lineage.
    ZStack,
    /// Single-feature tracking file carrying a lineage table.
    Track,
}

impl FileKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ZStack => "zstack",
            Self::Track => "track",
        }
    }

    /// Kind implied by a bundle name: `.npz`/`.zip` are z-stacks, `.trk`/
    /// `.trks` are tracking files. Trailing `.json` and `.gz` are skipped.
    pub fn from_filename(name: &str) -> Option<Self> {
        let mut stem = name.trim().to_ascii_lowercase();
        for suffix in [".gz", ".json"] {
            if let Some(rest) = stem.strip_suffix(suffix) {
                stem = rest.to_string();
            }
        }
        let (_, extension) = stem.rsplit_once('.')?;
        match extension {
            "npz" | "zip" => Some(Self::ZStack),
            "trk" | "trks" => Some(Self::Track),
            _ => None,
        }
    }
}

/// Which plane the editing session is looking at.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub frame: usize,
    pub channel: usize,
    pub feature: usize,
}

/// What an action touched, so callers only re-render or re-persist that part.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChangeSet {
    pub selection: bool,
    pub raw: bool,
    pub frame: bool,
    pub all_frames: bool,
    pub identity: bool,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        !(self.selection || self.raw || self.frame || self.all_frames || self.identity)
    }

    pub fn pixels_changed(&self) -> bool {
        self.frame || self.all_frames
    }

    pub fn merge(&mut self, other: ChangeSet) {
        self.selection |= other.selection;
        self.raw |= other.raw;
        self.frame |= other.frame;
        self.all_frames |= other.all_frames;
        self.identity |= other.identity;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    InvalidInput,
    InvalidSelection,
    InvalidAction,
    NotFound,
    Unsupported,
    Io,
    Internal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capabilities {
    pub protocol_version: String,
    pub supported_actions: Vec<String>,
    pub zstack_only_actions: Vec<String>,
    pub track_only_actions: Vec<String>,
    pub file_kinds: Vec<String>,
    pub deterministic_history: bool,
}

/// One identity record rendered for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadableEntry {
    pub label: Label,
    pub frames: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<Label>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub daughters: Vec<Label>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame_div: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capped: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadableTable {
    pub kind: FileKind,
    /// feature -> records ordered by label
    pub features: BTreeMap<usize, Vec<ReadableEntry>>,
}

/// Row-major copy of one label plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanePayload {
    pub frame: usize,
    pub feature: usize,
    pub height: usize,
    pub width: usize,
    pub labels: Vec<Label>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HistoryDirection {
    Undo,
    Redo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryPayload {
    pub direction: HistoryDirection,
    /// Record the cursor points at after the move.
    pub record_id: u64,
    pub changes: ChangeSet,
    pub selection: Selection,
    pub planes: Vec<PlanePayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<ReadableTable>,
}

/// Compress frame indices into run-length ranges: `[0,1,2,3,7]` -> `"0-3, 7"`.
/// Input must be sorted ascending; duplicates are ignored.
pub fn frame_ranges<I>(frames: I) -> String
where
    I: IntoIterator<Item = usize>,
{
    let mut runs: Vec<(usize, usize)> = vec![];
    for frame in frames {
        match runs.last_mut() {
            Some((_, end)) if frame == *end => {}
            Some((_, end)) if frame == *end + 1 => *end = frame,
            _ => runs.push((frame, frame)),
        }
    }
    runs.iter()
        .map(|(start, end)| {
            if start == end {
                format!("{start}")
            } else {
                format!("{start}-{end}")
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}
