//! One controller per mounted volume: owns the volume's index handle and the
//! add/delete queues that are flushed into it on commit.

use std::collections::HashSet;
use std::fmt;
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::engine::{IndexDocument, IndexEngine, IndexHandle};
use crate::error::{IndexError, Result};
use crate::extract::ContentExtractor;
use crate::filter::{is_well_formed, SharedExclusions};
use crate::query::{SearchHit, SearchQuery};
use crate::volume::Volume;
use crate::walk;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerStatus {
    Uninitialized,
    FirstRunInProgress,
    Ready,
    Error,
}

impl ControllerStatus {
    fn accepts_adds(self) -> bool {
        matches!(self, ControllerStatus::Ready | ControllerStatus::FirstRunInProgress)
    }
}

/// What one commit did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CommitReport {
    /// Delete-by-path requests issued, one per queued add and queued delete.
    pub delete_requests: usize,
    /// Previously committed documents the deletes matched, each counted once.
    pub deleted: u64,
    pub added: usize,
    /// Queued files that turned out to have no text.
    pub skipped: usize,
    /// Per-item failures: unreadable files and rejected documents.
    pub failed: usize,
}

impl CommitReport {
    pub fn is_empty(&self) -> bool {
        self.delete_requests == 0
    }
}

#[derive(Default)]
struct Pending {
    adds: Vec<PathBuf>,
    deletes: Vec<PathBuf>,
    handle: Option<Box<dyn IndexHandle>>,
}

pub struct VolumeController {
    volume: Volume,
    index_root: PathBuf,
    maintenance_dir: PathBuf,
    engine: Arc<dyn IndexEngine>,
    extractor: Arc<dyn ContentExtractor>,
    exclusions: SharedExclusions,
    status: Mutex<ControllerStatus>,
    pending: Mutex<Pending>,
}

impl fmt::Debug for VolumeController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VolumeController")
            .field("volume", &self.volume)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

/// Exclusive hold on a controller's queues. Taken by the orchestrator for
/// every controller before routing a batch of events.
pub struct ControllerGuard<'a> {
    controller: &'a VolumeController,
    pending: MutexGuard<'a, Pending>,
}

impl ControllerGuard<'_> {
    /// Queues `path` for (re)indexing at the next commit.
    pub fn enqueue_add(&mut self, path: &Path) -> Result<()> {
        let controller = self.controller;
        let status = controller.status();
        if !status.accepts_adds() {
            return Err(controller.invalid_state(status));
        }
        if !is_well_formed(path) {
            return Err(IndexError::InvalidPath(path.to_path_buf()));
        }
        if controller.is_excluded(path) {
            return Err(IndexError::Excluded(path.to_path_buf()));
        }
        if !controller.extractor.supports(path) {
            return Err(IndexError::NotSupported(path.to_path_buf()));
        }
        self.pending.adds.push(path.to_path_buf());
        Ok(())
    }

    /// Queues removal of `path` from the index. Accepted in every state.
    pub fn enqueue_remove(&mut self, path: &Path) -> Result<()> {
        if !is_well_formed(path) {
            return Err(IndexError::InvalidPath(path.to_path_buf()));
        }
        self.pending.deletes.push(path.to_path_buf());
        Ok(())
    }

    pub fn pending(&self) -> (usize, usize) {
        (self.pending.adds.len(), self.pending.deletes.len())
    }
}

impl VolumeController {
    pub fn new(
        volume: Volume,
        engine: Arc<dyn IndexEngine>,
        extractor: Arc<dyn ContentExtractor>,
        exclusions: SharedExclusions,
    ) -> Self {
        Self {
            index_root: volume.index_root(),
            maintenance_dir: volume.maintenance_dir(),
            volume,
            engine,
            extractor,
            exclusions,
            status: Mutex::new(ControllerStatus::Uninitialized),
            pending: Mutex::new(Pending::default()),
        }
    }

    pub fn volume(&self) -> &Volume {
        &self.volume
    }

    pub fn index_root(&self) -> &Path {
        &self.index_root
    }

    pub fn status(&self) -> ControllerStatus {
        *self.status.lock()
    }

    fn set_status(&self, status: ControllerStatus) {
        let mut current = self.status.lock();
        if *current != status {
            debug!(device = %self.volume.device, from = ?*current, to = ?status, "controller status changed");
            *current = status;
        }
    }

    fn invalid_state(&self, status: ControllerStatus) -> IndexError {
        IndexError::InvalidState {
            volume: self.volume.device,
            status,
        }
    }

    /// The maintenance directory is always excluded, whatever the shared set says.
    pub fn is_excluded(&self, path: &Path) -> bool {
        path.starts_with(&self.maintenance_dir) || self.exclusions.read().contains(path)
    }

    /// Opens the volume's index, building it from a full walk of the volume
    /// when none exists yet. On failure the controller is left in `Error`.
    pub fn initialize(&self) -> Result<()> {
        if self.engine.exists(&self.index_root) {
            self.open_existing()
        } else {
            self.first_run()
        }
    }

    fn open_existing(&self) -> Result<()> {
        let mut pending = self.pending.lock();
        match self.engine.open(&self.index_root, false) {
            Ok(handle) => {
                pending.handle = Some(handle);
                self.set_status(ControllerStatus::Ready);
                info!(device = %self.volume.device, index = %self.index_root.display(), "opened index");
                Ok(())
            }
            Err(err) => {
                pending.handle = None;
                self.set_status(ControllerStatus::Error);
                error!(device = %self.volume.device, error = %err, "failed to open index");
                Err(err)
            }
        }
    }

    fn first_run(&self) -> Result<()> {
        info!(device = %self.volume.device, root = %self.volume.root.display(), "no index found, indexing entire volume");
        self.set_status(ControllerStatus::FirstRunInProgress);
        {
            let mut pending = self.pending.lock();
            match self.engine.open(&self.index_root, true) {
                Ok(handle) => pending.handle = Some(handle),
                Err(err) => {
                    self.set_status(ControllerStatus::Error);
                    error!(device = %self.volume.device, error = %err, "failed to create index");
                    return Err(err);
                }
            }
        }

        let queued = self.queue_volume();
        let report = self.commit()?;
        self.set_status(ControllerStatus::Ready);
        info!(device = %self.volume.device, queued, added = report.added, "first run complete");
        Ok(())
    }

    /// Queues every file of the volume. The queue lock is taken per file so
    /// live events can be routed in between.
    fn queue_volume(&self) -> usize {
        let mut queued = 0;
        for path in walk::volume_files(&self.volume.root) {
            match self.lock().enqueue_add(&path) {
                Ok(()) => queued += 1,
                Err(err) if err.is_skip() => {}
                Err(err) => debug!(path = %path.display(), error = %err, "not queued"),
            }
        }
        queued
    }

    pub fn lock(&self) -> ControllerGuard<'_> {
        ControllerGuard {
            controller: self,
            pending: self.pending.lock(),
        }
    }

    pub fn enqueue_add(&self, path: &Path) -> Result<()> {
        self.lock().enqueue_add(path)
    }

    pub fn enqueue_remove(&self, path: &Path) -> Result<()> {
        self.lock().enqueue_remove(path)
    }

    /// Queued (adds, deletes).
    pub fn pending(&self) -> (usize, usize) {
        self.lock().pending()
    }

    /// Flushes both queues into the index.
    ///
    /// Every queued add and every queued delete is first turned into a
    /// delete-by-path, adds before deletes. A queued delete that matches no
    /// document of its own was a directory, so everything below it is deleted
    /// as well. Then each distinct queued add is
    /// read and submitted once, in the order it was first queued, and the
    /// index is persisted. Both queues are empty afterwards whatever the
    /// outcome. Per-file failures are counted in the report; a failure to
    /// persist puts the controller in `Error`.
    pub fn commit(&self) -> Result<CommitReport> {
        let mut pending = self.pending.lock();
        let adds = mem::take(&mut pending.adds);
        let deletes = mem::take(&mut pending.deletes);
        if adds.is_empty() && deletes.is_empty() {
            return Ok(CommitReport::default());
        }

        let Some(handle) = pending.handle.as_mut() else {
            let status = self.status();
            self.set_status(ControllerStatus::Error);
            warn!(
                device = %self.volume.device,
                adds = adds.len(),
                deletes = deletes.len(),
                "no open index, dropping queued changes"
            );
            return Err(self.invalid_state(status));
        };

        let mut report = CommitReport::default();
        let mut counted = HashSet::with_capacity(adds.len() + deletes.len());
        for path in &adds {
            delete_path(handle.as_mut(), path, &mut counted, &mut report);
        }
        for path in &deletes {
            if delete_path(handle.as_mut(), path, &mut counted, &mut report) != Some(0) {
                continue;
            }
            match handle.delete_under(&path.to_string_lossy()) {
                Ok(matched) => {
                    if matched > 0 {
                        debug!(dir = %path.display(), matched, "removed directory purged");
                    }
                    report.deleted += matched;
                }
                Err(err) => {
                    report.failed += 1;
                    warn!(dir = %path.display(), error = %err, "subtree delete failed");
                }
            }
        }

        let mut seen = HashSet::with_capacity(adds.len());
        for path in &adds {
            if !seen.insert(path.as_path()) {
                continue;
            }
            match self.extractor.extract(path) {
                Ok(Some(text)) => {
                    match IndexDocument::for_file(path, text).and_then(|doc| handle.add_document(doc)) {
                        Ok(()) => report.added += 1,
                        Err(err) => {
                            report.failed += 1;
                            warn!(path = %path.display(), error = %err, "failed to index file");
                        }
                    }
                }
                Ok(None) => report.skipped += 1,
                Err(err) => {
                    report.failed += 1;
                    debug!(path = %path.display(), error = %err, "file unreadable at commit");
                }
            }
        }

        if let Err(err) = handle.commit() {
            self.set_status(ControllerStatus::Error);
            error!(device = %self.volume.device, error = %err, "commit failed");
            return Err(err);
        }

        info!(
            device = %self.volume.device,
            deleted = report.deleted,
            added = report.added,
            skipped = report.skipped,
            failed = report.failed,
            "committed"
        );
        Ok(report)
    }

    /// Drops the index handle and both queues. Safe to call repeatedly.
    pub fn close(&self) {
        let mut pending = self.pending.lock();
        let dropped = pending.adds.len() + pending.deletes.len();
        pending.adds.clear();
        pending.deletes.clear();
        if pending.handle.take().is_some() {
            info!(device = %self.volume.device, dropped, "closed index");
        }
        drop(pending);
        self.set_status(ControllerStatus::Uninitialized);
    }

    /// Empties the index and rebuilds it from a full walk of the volume.
    pub fn reindex(&self) -> Result<CommitReport> {
        {
            let mut pending = self.pending.lock();
            if pending.handle.is_none() {
                match self.engine.open(&self.index_root, true) {
                    Ok(handle) => pending.handle = Some(handle),
                    Err(err) => {
                        self.set_status(ControllerStatus::Error);
                        return Err(err);
                    }
                }
            }
            let Some(handle) = pending.handle.as_mut() else {
                return Err(self.invalid_state(self.status()));
            };
            if let Err(err) = handle.delete_all().and_then(|()| handle.commit()) {
                self.set_status(ControllerStatus::Error);
                error!(device = %self.volume.device, error = %err, "failed to clear index");
                return Err(err);
            }
            pending.deletes.clear();
        }

        info!(device = %self.volume.device, "reindexing volume");
        self.set_status(ControllerStatus::FirstRunInProgress);
        self.queue_volume();
        let report = self.commit()?;
        self.set_status(ControllerStatus::Ready);
        Ok(report)
    }

    /// Reopens a controller that is in `Error`. No-op in any other state.
    pub fn recover(&self) -> Result<()> {
        if self.status() != ControllerStatus::Error {
            return Ok(());
        }
        self.pending.lock().handle = None;
        debug!(device = %self.volume.device, "retrying index after error");
        self.initialize()
    }

    pub fn search(&self, query: &SearchQuery) -> Result<Vec<SearchHit>> {
        let pending = self.pending.lock();
        match pending.handle.as_ref() {
            Some(handle) => handle.search(query),
            None => Err(self.invalid_state(self.status())),
        }
    }

    /// Committed documents, zero without an open index.
    pub fn num_docs(&self) -> u64 {
        self.pending
            .lock()
            .handle
            .as_ref()
            .map_or(0, |handle| handle.num_docs())
    }
}

/// Issues one delete-by-path. Matches only count the first time a path is
/// seen in a batch since they are taken from the last committed state.
fn delete_path<'a>(
    handle: &mut dyn IndexHandle,
    path: &'a Path,
    counted: &mut HashSet<&'a Path>,
    report: &mut CommitReport,
) -> Option<u64> {
    report.delete_requests += 1;
    match handle.delete_by_path(&path.to_string_lossy()) {
        Ok(matched) => {
            if counted.insert(path) {
                report.deleted += matched;
            }
            Some(matched)
        }
        Err(err) => {
            report.failed += 1;
            warn!(path = %path.display(), error = %err, "delete failed");
            None
        }
    }
}
