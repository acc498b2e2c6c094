//! Interactive annotation engine for 4-D cell label volumes.
//!
//! A [`volume::LabelVolume`] holds raw intensities and integer label planes
//! together with an identity index (or, for tracking files, a
//! [`lineage::LineageGraph`]). [`engine::LabelEngine`] applies editing
//! actions to it and keeps an undo/redo [`history::HistoryLog`].

pub mod archive;
pub mod engine;
pub mod error;
pub mod history;
pub mod lineage;
pub mod mask;
pub mod matcher;
pub mod render_lineage;
pub mod shell;
pub mod volume;

pub use cellmask_protocol as protocol;
