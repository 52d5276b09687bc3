//! Per-volume change subscriptions merged into two FIFO queues.
//!
//! The feed keeps one live subscription on every indexable volume and turns
//! raw notices into [`ChangeEvent`]s. Updates are filtered before they are
//! queued: only regular files that are neither hidden nor excluded get
//! through. A directory that appears (usually moved in from elsewhere) is
//! walked and its files queued. Removals are queued unfiltered because the
//! entry is already gone.
//! When a volume goes away its subscription is cancelled and its pending
//! events are discarded.

use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::SystemTime;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::filter::{is_hidden, ExclusionSet, SharedExclusions};
use crate::source::{ChangeSource, EntryNotice, NoticeHandler, Subscription};
use crate::volume::{DeviceId, Volume, VolumeEvent};
use crate::walk;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    EntryUpdated { volume: DeviceId, path: PathBuf },
    EntryRemoved { volume: DeviceId, path: PathBuf },
}

impl ChangeEvent {
    pub fn volume(&self) -> DeviceId {
        match self {
            ChangeEvent::EntryUpdated { volume, .. } | ChangeEvent::EntryRemoved { volume, .. } => {
                *volume
            }
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            ChangeEvent::EntryUpdated { path, .. } | ChangeEvent::EntryRemoved { path, .. } => path,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FeedOptions {
    pub watch_removable: bool,
    /// Lower bound for the backfill run on every newly watched volume.
    /// `None` skips backfill entirely.
    pub since: Option<SystemTime>,
}

#[derive(Default)]
struct Queues {
    updates: VecDeque<ChangeEvent>,
    removals: VecDeque<ChangeEvent>,
}

struct Watched {
    volume: Volume,
    _subscription: Subscription,
}

struct FeedState {
    source: Arc<dyn ChangeSource>,
    options: FeedOptions,
    exclusions: SharedExclusions,
    queues: Mutex<Queues>,
    watched: Mutex<BTreeMap<DeviceId, Watched>>,
}

pub struct ChangeFeed {
    state: Arc<FeedState>,
    volume_watch: Option<Subscription>,
}

impl ChangeFeed {
    pub fn new(source: Arc<dyn ChangeSource>, options: FeedOptions, exclusions: ExclusionSet) -> Self {
        Self {
            state: Arc::new(FeedState {
                source,
                options,
                exclusions: exclusions.shared(),
                queues: Mutex::new(Queues::default()),
                watched: Mutex::new(BTreeMap::new()),
            }),
            volume_watch: None,
        }
    }

    /// Subscribes to every indexable mounted volume, then follows mounts and
    /// unmounts. Each volume event is applied to the feed before it is
    /// handed to `forward`.
    pub fn start_watching<F>(&mut self, forward: F) -> Result<()>
    where
        F: Fn(VolumeEvent) + Send + Sync + 'static,
    {
        for volume in self.state.source.mounted_volumes()? {
            self.state.add_volume(volume);
        }

        let weak = Arc::downgrade(&self.state);
        let guard = self.state.source.watch_volumes(Arc::new(move |event: VolumeEvent| {
            if let Some(state) = weak.upgrade() {
                state.apply(&event);
            }
            forward(event);
        }))?;
        self.volume_watch = Some(guard);
        Ok(())
    }

    /// Cancels every subscription. Queued events stay available.
    pub fn stop(&mut self) {
        self.volume_watch = None;
        let watched = std::mem::take(&mut *self.state.watched.lock());
        drop(watched);
    }

    pub fn next_update(&self) -> Option<ChangeEvent> {
        self.state.queues.lock().updates.pop_front()
    }

    pub fn next_removal(&self) -> Option<ChangeEvent> {
        self.state.queues.lock().removals.pop_front()
    }

    /// Queued (updates, removals).
    pub fn pending(&self) -> (usize, usize) {
        let queues = self.state.queues.lock();
        (queues.updates.len(), queues.removals.len())
    }

    pub fn is_watching(&self, device: DeviceId) -> bool {
        self.state.watched.lock().contains_key(&device)
    }

    /// Volumes that currently hold a live subscription.
    pub fn volumes(&self) -> Vec<Volume> {
        self.state
            .watched
            .lock()
            .values()
            .map(|watched| watched.volume.clone())
            .collect()
    }

    /// Adds `dir` to the exclusion set. Updates already queued are not
    /// revisited; controllers reject them at enqueue time.
    pub fn exclude(&self, dir: impl Into<PathBuf>) -> bool {
        self.state.exclusions.write().insert(dir)
    }

    pub fn exclusions(&self) -> SharedExclusions {
        Arc::clone(&self.state.exclusions)
    }
}

impl FeedState {
    fn apply(self: &Arc<Self>, event: &VolumeEvent) {
        match event {
            VolumeEvent::Mounted(volume) => self.add_volume(volume.clone()),
            VolumeEvent::Unmounted(device) => self.remove_volume(*device),
        }
    }

    fn add_volume(self: &Arc<Self>, volume: Volume) {
        let device = volume.device;
        if !volume.is_indexable(self.options.watch_removable) {
            debug!(%device, root = %volume.root.display(), "volume not indexable, not watching");
            return;
        }
        if self.watched.lock().contains_key(&device) {
            return;
        }

        // Weak: the subscription lives inside this state and must not keep it alive.
        let weak: Weak<FeedState> = Arc::downgrade(self);
        let root = volume.root.clone();
        let handler: NoticeHandler = Arc::new(move |device: DeviceId, notice: EntryNotice| {
            if let Some(state) = weak.upgrade() {
                state.receive(device, &root, notice);
            }
        });

        let subscription = match self.source.subscribe(&volume, handler) {
            Ok(subscription) => subscription,
            Err(err) => {
                warn!(%device, root = %volume.root.display(), error = %err, "failed to subscribe to volume");
                return;
            }
        };
        info!(%device, root = %volume.root.display(), "watching volume");

        self.backfill(&volume);
        self.watched.lock().insert(
            device,
            Watched {
                volume,
                _subscription: subscription,
            },
        );
    }

    fn backfill(&self, volume: &Volume) {
        let Some(since) = self.options.since else {
            return;
        };
        match self.source.backfill(volume, since) {
            Ok(paths) => {
                let count = paths.len();
                for path in paths {
                    self.push_update(volume.device, &volume.root, path);
                }
                debug!(device = %volume.device, count, "backfill complete");
            }
            Err(err) => {
                warn!(device = %volume.device, error = %err, "backfill failed, live subscription stays active");
            }
        }
    }

    fn remove_volume(&self, device: DeviceId) {
        let removed = self.watched.lock().remove(&device);
        if removed.is_none() {
            return;
        }
        drop(removed);

        let mut queues = self.queues.lock();
        queues.updates.retain(|event| event.volume() != device);
        queues.removals.retain(|event| event.volume() != device);
        info!(%device, "stopped watching volume");
    }

    fn receive(&self, device: DeviceId, root: &Path, notice: EntryNotice) {
        match notice {
            EntryNotice::Created(path) => {
                if fs::symlink_metadata(&path).is_ok_and(|metadata| metadata.is_dir()) {
                    self.push_directory(device, root, &path);
                } else {
                    self.push_update(device, root, path);
                }
            }
            EntryNotice::Removed(path) => {
                self.queues
                    .lock()
                    .removals
                    .push_back(ChangeEvent::EntryRemoved { volume: device, path });
            }
        }
    }

    fn push_directory(&self, device: DeviceId, root: &Path, dir: &Path) {
        if is_hidden(root, dir) || self.exclusions.read().contains(dir) {
            return;
        }
        let before = self.queues.lock().updates.len();
        for path in walk::volume_files(dir) {
            self.push_update(device, root, path);
        }
        let queued = self.queues.lock().updates.len().saturating_sub(before);
        debug!(%device, dir = %dir.display(), queued, "directory appeared");
    }

    fn push_update(&self, device: DeviceId, root: &Path, path: PathBuf) {
        let is_file = fs::symlink_metadata(&path).is_ok_and(|metadata| metadata.is_file());
        if !is_file || is_hidden(root, &path) || self.exclusions.read().contains(&path) {
            return;
        }
        self.queues
            .lock()
            .updates
            .push_back(ChangeEvent::EntryUpdated { volume: device, path });
    }
}
