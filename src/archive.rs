//! Bundles of named arrays plus lineage tables, as read from and written to
//! local files.
//!
//! On disk a bundle is JSON, gzip-compressed when the path ends in `.gz`.
//! The file name also decides the volume kind (see `FileKind::from_filename`).

use crate::error::EngineResult;
use crate::lineage::{LineageGraph, LineageTable, LineageTracked};
use crate::volume::LabelVolume;
use cellmask_protocol::{FileKind, Label};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use ndarray::{Array4, ArrayD, Axis, Ix4};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("cannot tell the file kind of '{0}' (expected .npz, .zip, .trk or .trks)")]
    UnknownKind(String),

    #[error("tracking archives hold exactly one lineage table, found {0}")]
    LineageCount(usize),

    #[error("archive holds {0} arrays; a raw and a label array are required")]
    MissingArrays(usize),

    #[error("array '{name}' has {rank} dimensions; expected 3 or 4")]
    BadRank { name: String, rank: usize },

    #[error("raw shape {raw:?} and label shape {labels:?} disagree")]
    ShapeMismatch { raw: Vec<usize>, labels: Vec<usize> },

    #[error("array '{0}' holds values that are not label ids")]
    NonIntegerLabels(String),

    #[error("invalid lineage table: {0}")]
    Lineage(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveArray {
    pub name: String,
    pub data: ArrayD<f64>,
}

impl ArchiveArray {
    pub fn new(name: impl Into<String>, data: ArrayD<f64>) -> Self {
        Self {
            name: name.into(),
            data,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Archive {
    pub arrays: Vec<ArchiveArray>,
    #[serde(default)]
    pub lineages: Vec<LineageTable>,
}

fn is_gzip(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("gz"))
}

impl Archive {
    pub fn array(&self, name: &str) -> Option<&ArchiveArray> {
        self.arrays.iter().find(|a| a.name == name)
    }

    pub fn read_from_path(path: &Path) -> Result<Self, ArchiveError> {
        let file = File::open(path)?;
        let reader: Box<dyn Read> = if is_gzip(path) {
            Box::new(GzDecoder::new(BufReader::new(file)))
        } else {
            Box::new(BufReader::new(file))
        };
        Ok(serde_json::from_reader(reader)?)
    }

    pub fn write_to_path(&self, path: &Path) -> Result<(), ArchiveError> {
        let file = File::create(path)?;
        if is_gzip(path) {
            let mut encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
            serde_json::to_writer(&mut encoder, self)?;
            encoder.finish()?.flush()?;
        } else {
            let mut writer = BufWriter::new(file);
            serde_json::to_writer(&mut writer, self)?;
            writer.flush()?;
        }
        Ok(())
    }

    /// Pick the raw and label arrays by their conventional names, falling
    /// back to the first two arrays in the bundle.
    fn raw_and_labels(&self, kind: FileKind) -> Result<(&ArchiveArray, &ArchiveArray), ArchiveError> {
        let candidates: &[(&str, &str)] = match kind {
            FileKind::ZStack => &[("X", "y"), ("raw", "annotated")],
            FileKind::Track => &[("raw", "tracked")],
        };
        for (raw, labels) in candidates {
            if let (Some(raw), Some(labels)) = (self.array(raw), self.array(labels)) {
                return Ok((raw, labels));
            }
        }
        match self.arrays.as_slice() {
            [raw, labels, ..] => {
                warn!(
                    raw = %raw.name,
                    labels = %labels.name,
                    "unrecognized array names, using positional order"
                );
                Ok((raw, labels))
            }
            _ => Err(ArchiveError::MissingArrays(self.arrays.len())),
        }
    }
}

/// Frames first: 3-D arrays are a single frame.
fn to_frames(array: &ArchiveArray) -> Result<Array4<f64>, ArchiveError> {
    let rank = array.data.ndim();
    let data = match rank {
        3 => array.data.clone().insert_axis(Axis(0)),
        4 => array.data.clone(),
        _ => {
            return Err(ArchiveError::BadRank {
                name: array.name.clone(),
                rank,
            })
        }
    };
    data.into_dimensionality::<Ix4>().map_err(|_| ArchiveError::BadRank {
        name: array.name.clone(),
        rank,
    })
}

fn to_labels(array: &ArchiveArray) -> Result<Array4<Label>, ArchiveError> {
    let values = to_frames(array)?;
    let valid = values
        .iter()
        .all(|&v| v.is_finite() && v >= 0.0 && v.fract() == 0.0 && v < Label::MAX as f64);
    if !valid {
        return Err(ArchiveError::NonIntegerLabels(array.name.clone()));
    }
    Ok(values.mapv(|v| v as Label))
}

/// Build a volume of the given kind from an in-memory bundle.
pub fn volume_from_archive(kind: FileKind, archive: &Archive) -> EngineResult<LabelVolume> {
    if kind == FileKind::Track && archive.lineages.len() != 1 {
        return Err(ArchiveError::LineageCount(archive.lineages.len()).into());
    }
    let (raw, labels) = archive.raw_and_labels(kind)?;
    let raw_frames = to_frames(raw)?.mapv(|v| v as f32);
    let label_frames = to_labels(labels)?;
    if raw_frames.shape()[..3] != label_frames.shape()[..3] {
        return Err(ArchiveError::ShapeMismatch {
            raw: raw_frames.shape().to_vec(),
            labels: label_frames.shape().to_vec(),
        }
        .into());
    }
    match kind {
        FileKind::ZStack => LabelVolume::zstack(raw_frames, label_frames),
        FileKind::Track => {
            let table = archive.lineages[0].clone();
            let lineage = LineageGraph::from_table(table).map_err(ArchiveError::Lineage)?;
            LabelVolume::track(raw_frames, label_frames, lineage)
        }
    }
}

/// Bundle a volume for export. Empty tracks are pruned from the lineage.
pub fn archive_from_volume(volume: &LabelVolume) -> Archive {
    let raw = volume.raw().mapv(f64::from).into_dyn();
    let labels = volume.labels().mapv(f64::from).into_dyn();
    match volume.lineage() {
        None => Archive {
            arrays: vec![ArchiveArray::new("X", raw), ArchiveArray::new("y", labels)],
            lineages: vec![],
        },
        Some(graph) => {
            let mut graph = graph.clone();
            let pruned = graph.prune_empty();
            if !pruned.is_empty() {
                warn!(?pruned, "dropped empty tracks before export");
            }
            Archive {
                arrays: vec![
                    ArchiveArray::new("raw", raw),
                    ArchiveArray::new("tracked", labels),
                ],
                lineages: vec![graph.to_table()],
            }
        }
    }
}

pub fn kind_of_path(path: &Path) -> Result<FileKind, ArchiveError> {
    let name = path.to_string_lossy();
    FileKind::from_filename(&name).ok_or_else(|| ArchiveError::UnknownKind(name.to_string()))
}

pub fn load_volume(path: &Path) -> EngineResult<LabelVolume> {
    let kind = kind_of_path(path)?;
    let archive = Archive::read_from_path(path)?;
    let volume = volume_from_archive(kind, &archive)?;
    info!(
        path = %path.display(),
        kind = kind.as_str(),
        frames = volume.num_frames(),
        "loaded volume"
    );
    Ok(volume)
}

/// Write a volume; the path's name must match the volume kind.
pub fn save_volume(volume: &LabelVolume, path: &Path) -> EngineResult<()> {
    let kind = kind_of_path(path)?;
    if kind != volume.kind() {
        return Err(crate::error::EngineError::invalid_input(format!(
            "'{}' names a {} file but the volume is a {} file",
            path.display(),
            kind.as_str(),
            volume.kind().as_str()
        )));
    }
    archive_from_volume(volume).write_to_path(path)?;
    info!(path = %path.display(), "saved volume");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lineage::Track;
    use cellmask_protocol::ErrorCode;
    use ndarray::{Array3, ArrayD, IxDyn};
    use tempfile::tempdir;

    fn labels_3d() -> ArrayD<f64> {
        let mut a = Array3::<f64>::zeros((2, 2, 1));
        a[[0, 0, 0]] = 3.0;
        a.into_dyn()
    }

    fn track_table() -> LineageTable {
        let mut track = Track::new(1);
        track.frames = [0].into_iter().collect();
        let mut empty = Track::new(9);
        empty.capped = true;
        LineageTable::from([("1".to_string(), track), ("9".to_string(), empty)])
    }

    #[test]
    fn test_zstack_key_fallbacks() {
        let raw = ArrayD::<f64>::zeros(IxDyn(&[2, 2, 1]));
        for (a, b) in [("X", "y"), ("raw", "annotated"), ("first", "second")] {
            let archive = Archive {
                arrays: vec![
                    ArchiveArray::new(a, raw.clone()),
                    ArchiveArray::new(b, labels_3d()),
                ],
                lineages: vec![],
            };
            let volume = volume_from_archive(FileKind::ZStack, &archive).unwrap();
            assert_eq!(volume.num_frames(), 1);
            assert!(volume.cell_ids(0).contains(&3));
        }
    }

    #[test]
    fn test_missing_arrays_is_an_error() {
        let archive = Archive {
            arrays: vec![ArchiveArray::new("X", labels_3d())],
            lineages: vec![],
        };
        let err = volume_from_archive(FileKind::ZStack, &archive).unwrap_err();
        assert!(matches!(err.code, ErrorCode::InvalidInput));
    }

    #[test]
    fn test_tracks_need_one_lineage_table() {
        let raw = ArrayD::<f64>::zeros(IxDyn(&[2, 2, 1]));
        let mut archive = Archive {
            arrays: vec![
                ArchiveArray::new("raw", raw),
                ArchiveArray::new("tracked", labels_3d()),
            ],
            lineages: vec![],
        };
        let err = volume_from_archive(FileKind::Track, &archive).unwrap_err();
        assert!(err.message.contains("found 0"));
        archive.lineages = vec![track_table(), track_table()];
        let err = volume_from_archive(FileKind::Track, &archive).unwrap_err();
        assert!(err.message.contains("found 2"));
    }

    #[test]
    fn test_non_integer_labels_rejected() {
        let raw = ArrayD::<f64>::zeros(IxDyn(&[2, 2, 1]));
        let mut labels = labels_3d();
        labels[[1, 1, 0]] = 0.5;
        let archive = Archive {
            arrays: vec![ArchiveArray::new("X", raw), ArchiveArray::new("y", labels)],
            lineages: vec![],
        };
        assert!(volume_from_archive(FileKind::ZStack, &archive).is_err());
    }

    #[test]
    fn test_shape_mismatch_rejected() {
        let raw = ArrayD::<f64>::zeros(IxDyn(&[3, 2, 1]));
        let archive = Archive {
            arrays: vec![ArchiveArray::new("X", raw), ArchiveArray::new("y", labels_3d())],
            lineages: vec![],
        };
        let err = volume_from_archive(FileKind::ZStack, &archive).unwrap_err();
        assert!(err.message.contains("disagree"));
    }

    #[test]
    fn test_gzip_track_round_trip_prunes_empty_tracks() {
        let td = tempdir().unwrap();
        let path = td.path().join("movie.trk.json.gz");
        let raw = ArrayD::<f64>::zeros(IxDyn(&[1, 2, 2, 1]));
        let mut labels = ArrayD::<f64>::zeros(IxDyn(&[1, 2, 2, 1]));
        labels[[0, 0, 0, 0]] = 1.0;
        let archive = Archive {
            arrays: vec![
                ArchiveArray::new("raw", raw),
                ArchiveArray::new("tracked", labels),
            ],
            lineages: vec![track_table()],
        };
        archive.write_to_path(&path).unwrap();

        let volume = load_volume(&path).unwrap();
        assert_eq!(volume.kind(), FileKind::Track);
        // the reindex at load already drops the frameless track
        assert!(volume.lineage().unwrap().track(9).is_none());

        let out = td.path().join("saved.trks");
        save_volume(&volume, &out).unwrap();
        let back = Archive::read_from_path(&out).unwrap();
        assert_eq!(back.lineages.len(), 1);
        assert_eq!(back.lineages[0].keys().collect::<Vec<_>>(), vec!["1"]);
        assert!(back.array("tracked").is_some());
    }

    #[test]
    fn test_save_rejects_kind_mismatch() {
        let td = tempdir().unwrap();
        let raw = ArrayD::<f64>::zeros(IxDyn(&[2, 2, 1]));
        let archive = Archive {
            arrays: vec![ArchiveArray::new("X", raw), ArchiveArray::new("y", labels_3d())],
            lineages: vec![],
        };
        let volume = volume_from_archive(FileKind::ZStack, &archive).unwrap();
        assert!(save_volume(&volume, &td.path().join("out.trk")).is_err());
        assert!(save_volume(&volume, &td.path().join("out.txt")).is_err());
        save_volume(&volume, &td.path().join("out.npz")).unwrap();
    }
}
