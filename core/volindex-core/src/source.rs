//! Where filesystem activity comes from.
//!
//! A [`ChangeSource`] enumerates volumes, keeps live subscriptions on them and
//! reports mounts and unmounts. [`NotifySource`] is the Linux implementation:
//! recursive `notify` watches per volume plus a thread polling the mount table.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime};

use crossbeam_channel::RecvTimeoutError;
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecursiveMode, Watcher};
use tracing::{debug, warn};

use crate::error::Result;
use crate::volume::{diff_volumes, read_mounted_volumes, DeviceId, Volume, VolumeEvent};
use crate::walk;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryNotice {
    /// The entry appeared or its contents changed.
    Created(PathBuf),
    Removed(PathBuf),
}

pub type NoticeHandler = Arc<dyn Fn(DeviceId, EntryNotice) + Send + Sync>;
pub type VolumeHandler = Arc<dyn Fn(VolumeEvent) + Send + Sync>;

/// Keeps a subscription alive. Dropping it stops delivery.
pub struct Subscription {
    _guard: Box<dyn Send>,
}

impl Subscription {
    pub fn new(guard: impl Send + 'static) -> Self {
        Self {
            _guard: Box::new(guard),
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Subscription")
    }
}

pub trait ChangeSource: Send + Sync {
    fn mounted_volumes(&self) -> Result<Vec<Volume>>;

    /// Starts reporting entry changes on `volume` to `handler`.
    fn subscribe(&self, volume: &Volume, handler: NoticeHandler) -> Result<Subscription>;

    /// Files on `volume` modified after `since`.
    fn backfill(&self, volume: &Volume, since: SystemTime) -> Result<Vec<PathBuf>>;

    /// Starts reporting mounts and unmounts to `handler`.
    fn watch_volumes(&self, handler: VolumeHandler) -> Result<Subscription>;
}

#[derive(Debug, Clone)]
pub struct NotifySource {
    mount_poll_interval: Duration,
}

impl NotifySource {
    pub fn new(mount_poll_interval: Duration) -> Self {
        Self {
            mount_poll_interval,
        }
    }
}

impl ChangeSource for NotifySource {
    fn mounted_volumes(&self) -> Result<Vec<Volume>> {
        Ok(read_mounted_volumes()?)
    }

    fn subscribe(&self, volume: &Volume, handler: NoticeHandler) -> Result<Subscription> {
        let device = volume.device;
        let mut watcher =
            notify::recommended_watcher(move |result: notify::Result<Event>| match result {
                Ok(event) => {
                    for notice in notices_from_event(&event) {
                        if on_device(&notice, device) {
                            handler(device, notice);
                        }
                    }
                }
                Err(err) => warn!(%device, error = %err, "live subscription error"),
            })?;
        watcher.watch(&volume.root, RecursiveMode::Recursive)?;
        debug!(%device, root = %volume.root.display(), "live subscription registered");
        Ok(Subscription::new(watcher))
    }

    fn backfill(&self, volume: &Volume, since: SystemTime) -> Result<Vec<PathBuf>> {
        if since >= SystemTime::now() {
            return Ok(Vec::new());
        }
        walk::changed_since(&volume.root, since)
    }

    fn watch_volumes(&self, handler: VolumeHandler) -> Result<Subscription> {
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(0);
        let interval = self.mount_poll_interval;
        let mut known = read_mounted_volumes()?;

        thread::Builder::new()
            .name("volindex-mounts".into())
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {}
                    // Sender dropped: the subscription was cancelled.
                    _ => break,
                }
                match read_mounted_volumes() {
                    Ok(current) => {
                        for event in diff_volumes(&known, &current) {
                            handler(event);
                        }
                        known = current;
                    }
                    Err(err) => warn!(error = %err, "failed to read mount table"),
                }
            })?;

        Ok(Subscription::new(stop_tx))
    }
}

/// Recursive watches descend into nested mounts; entries that live on another
/// device belong to that device's own subscription.
#[cfg(unix)]
fn on_device(notice: &EntryNotice, device: DeviceId) -> bool {
    use std::os::unix::fs::MetadataExt;
    match notice {
        EntryNotice::Created(path) => {
            std::fs::symlink_metadata(path).map_or(true, |metadata| metadata.dev() == device.0)
        }
        EntryNotice::Removed(_) => true,
    }
}

#[cfg(not(unix))]
fn on_device(_notice: &EntryNotice, _device: DeviceId) -> bool {
    true
}

/// Maps one raw watcher event onto created/removed notices. Renames with
/// both ends known yield a removal for the old path and a creation for the
/// new one.
pub fn notices_from_event(event: &Event) -> Vec<EntryNotice> {
    let created = || -> Vec<EntryNotice> {
        event.paths.iter().cloned().map(EntryNotice::Created).collect()
    };
    let removed = || -> Vec<EntryNotice> {
        event.paths.iter().cloned().map(EntryNotice::Removed).collect()
    };

    match event.kind {
        EventKind::Create(_) => created(),
        EventKind::Remove(_) => removed(),
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => removed(),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => created(),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            let mut notices = Vec::with_capacity(2);
            if let Some(from) = event.paths.first() {
                notices.push(EntryNotice::Removed(from.clone()));
            }
            if let Some(to) = event.paths.get(1) {
                notices.push(EntryNotice::Created(to.clone()));
            }
            notices
        }
        EventKind::Modify(ModifyKind::Name(_)) => event
            .paths
            .iter()
            .map(|path| {
                if path.exists() {
                    EntryNotice::Created(path.clone())
                } else {
                    EntryNotice::Removed(path.clone())
                }
            })
            .collect(),
        EventKind::Modify(_) => created(),
        EventKind::Access(_) | EventKind::Any | EventKind::Other => Vec::new(),
    }
}
