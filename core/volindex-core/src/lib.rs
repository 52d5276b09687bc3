//! Live per-volume full-text indexing.
//!
//! A [`ChangeFeed`] watches every mounted volume, an [`Orchestrator`] routes
//! its events to one [`VolumeController`] per volume and commits them into
//! that volume's tantivy index on a timer.

pub mod config;
pub mod control;
pub mod controller;
pub mod engine;
pub mod error;
pub mod extract;
pub mod feed;
pub mod filter;
pub mod logging;
pub mod orchestrator;
pub mod query;
pub mod schema;
#[cfg(unix)]
pub mod signals;
pub mod source;
pub mod volume;
pub mod walk;

#[cfg(test)]
pub(crate) mod testing;

pub use crate::config::{ExtractorSettings, Settings, WriterSettings};
pub use crate::control::{ControlRequest, ControlResponse, VolumeStatus};
pub use crate::controller::{CommitReport, ControllerStatus, VolumeController};
pub use crate::engine::{IndexDocument, IndexEngine, IndexHandle, TantivyEngine};
pub use crate::error::{IndexError, Result};
pub use crate::extract::{ContentExtractor, PlainTextExtractor};
pub use crate::feed::{ChangeEvent, ChangeFeed, FeedOptions};
pub use crate::filter::{ExclusionSet, SharedExclusions};
pub use crate::orchestrator::{CycleReport, DaemonMessage, Orchestrator};
pub use crate::query::{SearchField, SearchHit, SearchQuery};
pub use crate::source::{ChangeSource, NotifySource};
pub use crate::volume::{DeviceId, Volume, VolumeEvent};
