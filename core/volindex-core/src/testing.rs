//! Hand-driven stand-ins for the change source and the index engine.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;

use crate::engine::{IndexDocument, IndexEngine, IndexHandle};
use crate::error::{IndexError, Result};
use crate::query::{SearchHit, SearchQuery};
use crate::source::{
    ChangeSource, EntryNotice, NoticeHandler, Subscription, VolumeHandler,
};
use crate::volume::{DeviceId, Volume, VolumeEvent};

type Subscribers = Arc<Mutex<HashMap<DeviceId, NoticeHandler>>>;

/// A change source whose volumes and notices are pushed by the test.
#[derive(Default)]
pub(crate) struct ManualSource {
    volumes: Mutex<Vec<Volume>>,
    subscribers: Subscribers,
    volume_handler: Arc<Mutex<Option<VolumeHandler>>>,
    backfills: Mutex<HashMap<DeviceId, std::result::Result<Vec<PathBuf>, String>>>,
    refused: Mutex<HashSet<DeviceId>>,
}

struct Unsubscribe {
    subscribers: Subscribers,
    device: DeviceId,
}

impl Drop for Unsubscribe {
    fn drop(&mut self) {
        self.subscribers.lock().remove(&self.device);
    }
}

struct StopVolumeWatch(Arc<Mutex<Option<VolumeHandler>>>);

impl Drop for StopVolumeWatch {
    fn drop(&mut self) {
        self.0.lock().take();
    }
}

impl ManualSource {
    pub fn with_volumes(volumes: Vec<Volume>) -> Arc<Self> {
        let source = Self::default();
        *source.volumes.lock() = volumes;
        Arc::new(source)
    }

    pub fn is_subscribed(&self, device: DeviceId) -> bool {
        self.subscribers.lock().contains_key(&device)
    }

    pub fn created(&self, device: DeviceId, path: impl Into<PathBuf>) {
        self.notify(device, EntryNotice::Created(path.into()));
    }

    pub fn removed(&self, device: DeviceId, path: impl Into<PathBuf>) {
        self.notify(device, EntryNotice::Removed(path.into()));
    }

    fn notify(&self, device: DeviceId, notice: EntryNotice) {
        let handler = self.subscribers.lock().get(&device).cloned();
        if let Some(handler) = handler {
            handler(device, notice);
        }
    }

    pub fn mount(&self, volume: Volume) {
        self.volumes.lock().push(volume.clone());
        self.emit(VolumeEvent::Mounted(volume));
    }

    pub fn unmount(&self, device: DeviceId) {
        self.volumes.lock().retain(|volume| volume.device != device);
        self.emit(VolumeEvent::Unmounted(device));
    }

    fn emit(&self, event: VolumeEvent) {
        let handler = self.volume_handler.lock().clone();
        if let Some(handler) = handler {
            handler(event);
        }
    }

    pub fn set_backfill(&self, device: DeviceId, paths: Vec<PathBuf>) {
        self.backfills.lock().insert(device, Ok(paths));
    }

    pub fn fail_backfill(&self, device: DeviceId) {
        self.backfills
            .lock()
            .insert(device, Err("enumeration refused".into()));
    }

    pub fn refuse_subscription(&self, device: DeviceId) {
        self.refused.lock().insert(device);
    }
}

impl ChangeSource for ManualSource {
    fn mounted_volumes(&self) -> Result<Vec<Volume>> {
        Ok(self.volumes.lock().clone())
    }

    fn subscribe(&self, volume: &Volume, handler: NoticeHandler) -> Result<Subscription> {
        if self.refused.lock().contains(&volume.device) {
            return Err(IndexError::engine("subscribe", "refused by source"));
        }
        self.subscribers.lock().insert(volume.device, handler);
        Ok(Subscription::new(Unsubscribe {
            subscribers: Arc::clone(&self.subscribers),
            device: volume.device,
        }))
    }

    fn backfill(&self, volume: &Volume, _since: SystemTime) -> Result<Vec<PathBuf>> {
        match self.backfills.lock().get(&volume.device) {
            Some(Ok(paths)) => Ok(paths.clone()),
            Some(Err(message)) => Err(IndexError::engine("backfill", message)),
            None => Ok(Vec::new()),
        }
    }

    fn watch_volumes(&self, handler: VolumeHandler) -> Result<Subscription> {
        *self.volume_handler.lock() = Some(handler);
        Ok(Subscription::new(StopVolumeWatch(Arc::clone(
            &self.volume_handler,
        ))))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum EngineOp {
    Open { root: PathBuf, create: bool },
    Delete(String),
    DeleteUnder(String),
    Add(String),
    DeleteAll,
    Commit,
}

#[derive(Default)]
struct RecordingState {
    ops: Vec<EngineOp>,
    existing: HashSet<PathBuf>,
    /// Committed documents per index root: path -> contents of each copy.
    committed: HashMap<PathBuf, BTreeMap<String, Vec<String>>>,
    fail_commits: bool,
    fail_opens: bool,
}

/// Engine that logs every call and keeps committed documents in memory.
/// Staged operations are applied in call order at commit, matching how
/// deletions only affect documents added before them.
#[derive(Clone, Default)]
pub(crate) struct RecordingEngine {
    state: Arc<Mutex<RecordingState>>,
}

impl RecordingEngine {
    pub fn ops(&self) -> Vec<EngineOp> {
        self.state.lock().ops.clone()
    }

    pub fn clear_ops(&self) {
        self.state.lock().ops.clear();
    }

    /// Copies of the document keyed by `path` in the index at `root`.
    pub fn copies(&self, root: &Path, path: &Path) -> Vec<String> {
        self.state
            .lock()
            .committed
            .get(root)
            .and_then(|docs| docs.get(path.to_string_lossy().as_ref()))
            .cloned()
            .unwrap_or_default()
    }

    pub fn committed_paths(&self, root: &Path) -> Vec<String> {
        self.state
            .lock()
            .committed
            .get(root)
            .map(|docs| docs.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn fail_commits(&self, fail: bool) {
        self.state.lock().fail_commits = fail;
    }

    pub fn fail_opens(&self, fail: bool) {
        self.state.lock().fail_opens = fail;
    }

    pub fn mark_existing(&self, root: &Path) {
        self.state.lock().existing.insert(root.to_path_buf());
    }
}

impl IndexEngine for RecordingEngine {
    fn exists(&self, root: &Path) -> bool {
        self.state.lock().existing.contains(root)
    }

    fn open(&self, root: &Path, create_if_missing: bool) -> Result<Box<dyn IndexHandle>> {
        let mut state = self.state.lock();
        state.ops.push(EngineOp::Open {
            root: root.to_path_buf(),
            create: create_if_missing,
        });
        if state.fail_opens {
            return Err(IndexError::engine("open index", "injected failure"));
        }
        if !state.existing.contains(root) {
            if !create_if_missing {
                return Err(IndexError::engine("open index", "no index"));
            }
            state.existing.insert(root.to_path_buf());
        }
        Ok(Box::new(RecordingHandle {
            engine: self.clone(),
            root: root.to_path_buf(),
            staged: Vec::new(),
        }))
    }
}

enum Staged {
    Delete(String),
    DeleteUnder(String),
    Add(IndexDocument),
    DeleteAll,
}

struct RecordingHandle {
    engine: RecordingEngine,
    root: PathBuf,
    staged: Vec<Staged>,
}

impl RecordingHandle {
    fn committed_len(&self) -> u64 {
        self.engine
            .state
            .lock()
            .committed
            .get(&self.root)
            .map(|docs| docs.values().map(|copies| copies.len() as u64).sum())
            .unwrap_or(0)
    }
}

impl IndexHandle for RecordingHandle {
    fn add_document(&mut self, doc: IndexDocument) -> Result<()> {
        self.engine
            .state
            .lock()
            .ops
            .push(EngineOp::Add(doc.path.clone()));
        self.staged.push(Staged::Add(doc));
        Ok(())
    }

    fn delete_by_path(&mut self, path: &str) -> Result<u64> {
        let mut state = self.engine.state.lock();
        state.ops.push(EngineOp::Delete(path.to_string()));
        let matched = state
            .committed
            .get(&self.root)
            .and_then(|docs| docs.get(path))
            .map_or(0, |copies| copies.len() as u64);
        drop(state);
        self.staged.push(Staged::Delete(path.to_string()));
        Ok(matched)
    }

    fn delete_under(&mut self, dir: &str) -> Result<u64> {
        let prefix = format!("{}/", dir.trim_end_matches('/'));
        let mut state = self.engine.state.lock();
        state.ops.push(EngineOp::DeleteUnder(dir.to_string()));
        let matched = state.committed.get(&self.root).map_or(0, |docs| {
            docs.iter()
                .filter(|(path, _)| path.starts_with(&prefix))
                .map(|(_, copies)| copies.len() as u64)
                .sum()
        });
        drop(state);
        self.staged.push(Staged::DeleteUnder(prefix));
        Ok(matched)
    }

    fn delete_all(&mut self) -> Result<()> {
        self.engine.state.lock().ops.push(EngineOp::DeleteAll);
        self.staged.push(Staged::DeleteAll);
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        let staged = std::mem::take(&mut self.staged);
        let mut state = self.engine.state.lock();
        state.ops.push(EngineOp::Commit);
        if state.fail_commits {
            return Err(IndexError::engine("commit", "injected failure"));
        }
        let docs = state.committed.entry(self.root.clone()).or_default();
        for op in staged {
            match op {
                Staged::Delete(path) => {
                    docs.remove(&path);
                }
                Staged::DeleteUnder(prefix) => docs.retain(|path, _| !path.starts_with(&prefix)),
                Staged::Add(doc) => docs.entry(doc.path).or_default().push(doc.contents),
                Staged::DeleteAll => docs.clear(),
            }
        }
        Ok(())
    }

    fn search(&self, query: &SearchQuery) -> Result<Vec<SearchHit>> {
        let state = self.engine.state.lock();
        let Some(docs) = state.committed.get(&self.root) else {
            return Ok(Vec::new());
        };
        Ok(docs
            .iter()
            .filter(|(_, copies)| copies.iter().any(|text| text.contains(&query.text)))
            .map(|(path, _)| SearchHit {
                path: path.clone(),
                ..SearchHit::default()
            })
            .collect())
    }

    fn num_docs(&self) -> u64 {
        self.committed_len()
    }
}

/// Writes `contents` to `root/relative`, creating parent directories.
pub(crate) fn write_file(root: &Path, relative: &str, contents: &str) -> PathBuf {
    let path = root.join(relative);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(&path, contents).unwrap();
    path
}
