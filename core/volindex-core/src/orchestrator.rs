//! The daemon loop: owns the change feed and one controller per volume,
//! routes queued events to controllers and commits them on a timer.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use crossbeam_channel::{select, Receiver, Sender};
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::control::{ControlRequest, ControlResponse, VolumeStatus};
use crate::controller::{CommitReport, ControllerGuard, ControllerStatus, VolumeController};
use crate::engine::IndexEngine;
use crate::error::{IndexError, Result};
use crate::extract::ContentExtractor;
use crate::feed::{ChangeEvent, ChangeFeed, FeedOptions};
use crate::filter::ExclusionSet;
use crate::source::ChangeSource;
use crate::volume::{DeviceId, Volume, VolumeEvent};

#[derive(Debug)]
pub enum DaemonMessage {
    Volume(VolumeEvent),
    Control {
        request: ControlRequest,
        reply: Option<Sender<ControlResponse>>,
    },
    Tick,
    Quit,
}

/// Totals for one pass of [`Orchestrator::update_index`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub paused: bool,
    pub routed_updates: usize,
    pub routed_removals: usize,
    /// Events the target controller refused: excluded, unsupported or wrong state.
    pub rejected: usize,
    /// Events whose volume has no controller.
    pub orphaned: usize,
    pub commits: usize,
    pub failed_commits: usize,
    pub added: usize,
    pub deleted: u64,
}

impl CycleReport {
    fn absorb(&mut self, report: &CommitReport) {
        if !report.is_empty() {
            self.commits += 1;
        }
        self.added += report.added;
        self.deleted += report.deleted;
    }
}

/// Consecutive failed recoveries of one controller. The first two retries
/// run on consecutive cycles, then each failure doubles the number of cycles
/// skipped before the next attempt.
#[derive(Debug, Default, Clone, Copy)]
struct Backoff {
    failures: u32,
    wait: u32,
}

const MAX_BACKOFF_SHIFT: u32 = 6;

impl Backoff {
    fn due(&mut self) -> bool {
        if self.wait == 0 {
            return true;
        }
        self.wait -= 1;
        false
    }

    fn failed(&mut self) {
        self.failures += 1;
        self.wait = (1 << self.failures.saturating_sub(2).min(MAX_BACKOFF_SHIFT)) - 1;
    }
}

pub struct Orchestrator {
    feed: ChangeFeed,
    /// Ordered by device id; routing locks controllers in this order.
    controllers: BTreeMap<DeviceId, Arc<VolumeController>>,
    retries: BTreeMap<DeviceId, Backoff>,
    engine: Arc<dyn IndexEngine>,
    extractor: Arc<dyn ContentExtractor>,
    settings: Settings,
    settings_path: Option<PathBuf>,
    paused: bool,
}

impl Orchestrator {
    pub fn new(
        source: Arc<dyn ChangeSource>,
        engine: Arc<dyn IndexEngine>,
        extractor: Arc<dyn ContentExtractor>,
        settings: Settings,
    ) -> Self {
        let options = FeedOptions {
            watch_removable: settings.watch_removable_volumes,
            since: settings.checkpoint(),
        };
        let exclusions = ExclusionSet::new(settings.excluded_paths.iter().cloned());
        Self {
            feed: ChangeFeed::new(source, options, exclusions),
            controllers: BTreeMap::new(),
            retries: BTreeMap::new(),
            engine,
            extractor,
            settings,
            settings_path: None,
            paused: false,
        }
    }

    /// Where permanent exclusions and the shutdown checkpoint are saved.
    pub fn with_settings_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.settings_path = Some(path.into());
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Starts the feed, builds a controller for every watched volume and runs
    /// one update cycle. Volume events are forwarded to `tx` for the loop.
    pub fn start(&mut self, tx: Sender<DaemonMessage>) -> Result<CycleReport> {
        self.feed.start_watching(move |event| {
            let _ = tx.send(DaemonMessage::Volume(event));
        })?;
        for volume in self.feed.volumes() {
            self.add_controller(volume);
        }
        info!(volumes = self.controllers.len(), "volume indexing started");
        Ok(self.update_index())
    }

    /// Blocks until a quit request or until every sender is gone, running an
    /// update cycle each interval, then shuts down.
    pub fn run(&mut self, rx: Receiver<DaemonMessage>) {
        let ticker = crossbeam_channel::tick(self.settings.update_interval());
        loop {
            select! {
                recv(ticker) -> _ => {
                    self.update_index();
                }
                recv(rx) -> message => match message {
                    Ok(message) => {
                        if !self.handle_message(message) {
                            break;
                        }
                    }
                    Err(_) => break,
                },
            }
        }
        self.shutdown();
    }

    /// Returns false when the loop should stop.
    pub fn handle_message(&mut self, message: DaemonMessage) -> bool {
        match message {
            DaemonMessage::Tick => {
                self.update_index();
                true
            }
            DaemonMessage::Volume(event) => {
                self.handle_volume_event(event);
                true
            }
            DaemonMessage::Control { request, reply } => {
                let quit = request == ControlRequest::Quit;
                let response = self.handle_control(request);
                if let Some(reply) = reply {
                    let _ = reply.send(response);
                }
                !quit
            }
            DaemonMessage::Quit => false,
        }
    }

    pub fn handle_volume_event(&mut self, event: VolumeEvent) {
        match event {
            VolumeEvent::Mounted(volume) => self.add_controller(volume),
            VolumeEvent::Unmounted(device) => {
                self.retries.remove(&device);
                if let Some(controller) = self.controllers.remove(&device) {
                    controller.close();
                    info!(%device, "volume unmounted, controller closed");
                }
            }
        }
    }

    /// Only volumes the feed holds a live subscription on get a controller.
    fn add_controller(&mut self, volume: Volume) {
        let device = volume.device;
        if !self.feed.is_watching(device) {
            debug!(%device, "volume not watched, no controller");
            return;
        }
        if self.controllers.contains_key(&device) {
            return;
        }
        let controller = Arc::new(VolumeController::new(
            volume,
            Arc::clone(&self.engine),
            Arc::clone(&self.extractor),
            self.feed.exclusions(),
        ));
        if let Err(err) = controller.initialize() {
            warn!(%device, error = %err, "controller failed to initialize, will retry");
        }
        self.controllers.insert(device, controller);
    }

    pub fn find_controller(&self, device: DeviceId) -> Option<&Arc<VolumeController>> {
        self.controllers.get(&device)
    }

    /// Controller of the volume whose root is the longest prefix of `path`.
    pub fn controller_for_path(&self, path: &Path) -> Option<&Arc<VolumeController>> {
        self.controllers
            .values()
            .filter(|controller| controller.volume().contains(path))
            .max_by_key(|controller| controller.volume().root.components().count())
    }

    pub fn controllers(&self) -> impl Iterator<Item = &Arc<VolumeController>> {
        self.controllers.values()
    }

    pub fn feed(&self) -> &ChangeFeed {
        &self.feed
    }

    /// One update cycle: retry failed controllers, route everything queued
    /// in the feed, then commit every controller.
    pub fn update_index(&mut self) -> CycleReport {
        if self.paused {
            debug!("indexing paused, skipping cycle");
            return CycleReport {
                paused: true,
                ..CycleReport::default()
            };
        }
        self.recover_failed();
        let mut report = self.route_events();
        let targets: Vec<_> = self.controllers.values().cloned().collect();
        commit_all(&targets, &mut report);
        if report.routed_updates + report.routed_removals > 0 || report.failed_commits > 0 {
            info!(
                updates = report.routed_updates,
                removals = report.routed_removals,
                rejected = report.rejected,
                commits = report.commits,
                failed = report.failed_commits,
                "update cycle complete"
            );
        }
        report
    }

    fn recover_failed(&mut self) {
        for (device, controller) in &self.controllers {
            if controller.status() != ControllerStatus::Error {
                self.retries.remove(device);
                continue;
            }
            let backoff = self.retries.entry(*device).or_default();
            if !backoff.due() {
                continue;
            }
            match controller.recover() {
                Ok(()) => {
                    self.retries.remove(device);
                }
                Err(err) => {
                    backoff.failed();
                    debug!(%device, error = %err, failures = backoff.failures, "controller still failing");
                }
            }
        }
    }

    /// Drains the feed with every controller locked, so a batch lands in the
    /// queues as a unit.
    fn route_events(&self) -> CycleReport {
        let mut report = CycleReport::default();
        let mut guards: BTreeMap<DeviceId, ControllerGuard<'_>> = self
            .controllers
            .iter()
            .map(|(device, controller)| (*device, controller.lock()))
            .collect();

        while let Some(event) = self.feed.next_update() {
            route(&mut guards, &event, &mut report);
        }
        while let Some(event) = self.feed.next_removal() {
            route(&mut guards, &event, &mut report);
        }
        report
    }

    /// Routes pending events, then commits the volume containing `scope`, or
    /// every volume when `scope` is `None`. Runs while paused.
    pub fn commit_cycle(&mut self, scope: Option<&Path>) -> Result<CycleReport> {
        let targets = self.targets(scope)?;
        let mut report = self.route_events();
        commit_all(&targets, &mut report);
        Ok(report)
    }

    fn targets(&self, scope: Option<&Path>) -> Result<Vec<Arc<VolumeController>>> {
        match scope {
            None => Ok(self.controllers.values().cloned().collect()),
            Some(path) => self
                .controller_for_path(path)
                .map(|controller| vec![Arc::clone(controller)])
                .ok_or_else(|| IndexError::InvalidPath(path.to_path_buf())),
        }
    }

    pub fn reindex(&mut self, scope: Option<&Path>) -> Result<CycleReport> {
        let targets = self.targets(scope)?;
        let mut report = CycleReport::default();
        for controller in targets {
            match controller.reindex() {
                Ok(commit) => report.absorb(&commit),
                Err(err) => {
                    report.failed_commits += 1;
                    warn!(device = %controller.volume().device, error = %err, "reindex failed");
                }
            }
        }
        Ok(report)
    }

    /// Adds `path` to the exclusion set; a permanent exclusion is also
    /// written to the settings file.
    pub fn exclude(&mut self, path: PathBuf, permanent: bool) -> Result<bool> {
        let added = self.feed.exclude(path.clone());
        if permanent && self.settings.add_exclusion(path) {
            self.save_settings()?;
        }
        Ok(added)
    }

    fn save_settings(&self) -> Result<()> {
        match &self.settings_path {
            Some(path) => self.settings.save(path),
            None => Ok(()),
        }
    }

    pub fn status(&self) -> ControlResponse {
        let (pending_updates, pending_removals) = self.feed.pending();
        let volumes = self
            .controllers
            .values()
            .map(|controller| {
                let volume = controller.volume();
                let (pending_adds, pending_deletes) = controller.pending();
                VolumeStatus {
                    device: volume.device,
                    name: volume.name.clone(),
                    root: volume.root.clone(),
                    status: controller.status(),
                    pending_adds,
                    pending_deletes,
                    documents: controller.num_docs(),
                }
            })
            .collect();
        ControlResponse::Status {
            paused: self.paused,
            pending_updates,
            pending_removals,
            volumes,
        }
    }

    pub fn handle_control(&mut self, request: ControlRequest) -> ControlResponse {
        debug!(?request, "control request");
        match request {
            ControlRequest::TogglePause => {
                self.paused = !self.paused;
                let state = if self.paused { "paused" } else { "resumed" };
                info!("indexing {state}");
                ControlResponse::ack(format!("indexing {state}"))
            }
            ControlRequest::Quit => ControlResponse::ack("shutting down"),
            ControlRequest::Commit { volume } => match self.commit_cycle(volume.as_deref()) {
                Ok(report) => ControlResponse::ack(format!(
                    "committed {} volume(s): {} added, {} deleted",
                    report.commits, report.added, report.deleted
                )),
                Err(err) => ControlResponse::error(err),
            },
            ControlRequest::Reindex { volume } => match self.reindex(volume.as_deref()) {
                Ok(report) if report.failed_commits == 0 => {
                    ControlResponse::ack(format!("reindexed: {} files added", report.added))
                }
                Ok(report) => ControlResponse::error(format!(
                    "reindex failed on {} volume(s)",
                    report.failed_commits
                )),
                Err(err) => ControlResponse::error(err),
            },
            ControlRequest::Exclude { path, permanent } => {
                match self.exclude(path.clone(), permanent) {
                    Ok(true) => ControlResponse::ack(format!("excluding {}", path.display())),
                    Ok(false) => {
                        ControlResponse::ack(format!("{} was already excluded", path.display()))
                    }
                    Err(err) => ControlResponse::error(err),
                }
            }
            ControlRequest::Status => self.status(),
        }
    }

    /// Final cycle, then closes every controller and records the checkpoint
    /// for the next start's backfill. The checkpoint is only moved when the
    /// final cycle ran, so changes seen while paused are picked up next time.
    pub fn shutdown(&mut self) {
        let started = SystemTime::now();
        let flushed = !self.paused;
        if flushed {
            self.update_index();
        }
        self.feed.stop();
        for controller in std::mem::take(&mut self.controllers).into_values() {
            controller.close();
        }
        if flushed {
            self.settings.set_checkpoint(started);
            if let Err(err) = self.save_settings() {
                warn!(error = %err, "failed to save checkpoint");
            }
        }
        info!("volume indexing stopped");
    }
}

fn route(
    guards: &mut BTreeMap<DeviceId, ControllerGuard<'_>>,
    event: &ChangeEvent,
    report: &mut CycleReport,
) {
    let Some(guard) = guards.get_mut(&event.volume()) else {
        report.orphaned += 1;
        debug!(error = %IndexError::LifecycleRace(event.volume()), path = %event.path().display(), "event dropped");
        return;
    };
    let outcome = match event {
        ChangeEvent::EntryUpdated { path, .. } => guard.enqueue_add(path),
        ChangeEvent::EntryRemoved { path, .. } => guard.enqueue_remove(path),
    };
    match (outcome, event) {
        (Ok(()), ChangeEvent::EntryUpdated { .. }) => report.routed_updates += 1,
        (Ok(()), ChangeEvent::EntryRemoved { .. }) => report.routed_removals += 1,
        (Err(err), _) => {
            report.rejected += 1;
            if !err.is_skip() {
                debug!(path = %event.path().display(), error = %err, "event rejected");
            }
        }
    }
}

/// Commits controllers concurrently; each one holds only its own lock.
fn commit_all(targets: &[Arc<VolumeController>], report: &mut CycleReport) {
    let results: Vec<_> = targets
        .par_iter()
        .map(|controller| (controller.volume().device, controller.commit()))
        .collect();
    for (device, result) in results {
        match result {
            Ok(commit) => report.absorb(&commit),
            Err(err) => {
                report.failed_commits += 1;
                warn!(%device, error = %err, "commit failed");
            }
        }
    }
}
