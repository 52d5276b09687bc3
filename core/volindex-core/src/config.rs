//! Daemon settings, persisted as JSON between runs.
//!
//! Every field has a default so older or partial settings files keep loading.

use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{IndexError, Result};

const SETTINGS_ENV: &str = "VOLINDEX_CONFIG";
const SETTINGS_DIR: &str = "volindex";
const SETTINGS_FILE: &str = "settings.json";

const DEFAULT_UPDATE_INTERVAL_SECS: u64 = 30;
const DEFAULT_MOUNT_POLL_SECS: u64 = 5;
const DEFAULT_MAX_BYTES: u64 = 1_572_864;
const DEFAULT_SNIFF_BYTES: usize = 4096;
const DEFAULT_SKIP_EXT: &[&str] = &[
    "zip", "gz", "tgz", "bz2", "xz", "zst", "7z", "rar", "iso", "dmg", "pkg", "png", "jpg",
    "jpeg", "gif", "webp", "mp3", "mp4", "mkv", "pdf",
];
const DEFAULT_WRITER_THREADS: usize = 1;
const DEFAULT_WRITER_HEAP_BYTES: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub watch_removable_volumes: bool,
    pub update_interval_secs: u64,
    pub mount_poll_interval_secs: u64,
    pub excluded_paths: Vec<PathBuf>,
    /// Unix seconds of the last cycle completed before a clean shutdown.
    pub last_checkpoint: Option<u64>,
    pub extractor: ExtractorSettings,
    pub writer: WriterSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            watch_removable_volumes: false,
            update_interval_secs: DEFAULT_UPDATE_INTERVAL_SECS,
            mount_poll_interval_secs: DEFAULT_MOUNT_POLL_SECS,
            excluded_paths: Vec::new(),
            last_checkpoint: None,
            extractor: ExtractorSettings::default(),
            writer: WriterSettings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractorSettings {
    pub max_bytes: u64,
    pub sniff_bytes: usize,
    pub skip_extensions: Vec<String>,
}

impl Default for ExtractorSettings {
    fn default() -> Self {
        Self {
            max_bytes: DEFAULT_MAX_BYTES,
            sniff_bytes: DEFAULT_SNIFF_BYTES,
            skip_extensions: DEFAULT_SKIP_EXT.iter().map(|ext| ext.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterSettings {
    /// Zero means one thread per cpu.
    pub threads: usize,
    pub heap_bytes: usize,
}

impl Default for WriterSettings {
    fn default() -> Self {
        Self {
            threads: DEFAULT_WRITER_THREADS,
            heap_bytes: DEFAULT_WRITER_HEAP_BYTES,
        }
    }
}

impl Settings {
    /// Loads settings from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(err) => {
                return Err(IndexError::Settings(format!(
                    "failed reading {}: {err}",
                    path.display()
                )))
            }
        };
        serde_json::from_str(&raw).map_err(|err| {
            IndexError::Settings(format!("failed parsing {}: {err}", path.display()))
        })
    }

    /// Writes settings to `path`, creating the parent directory on demand.
    /// The file is replaced atomically so a crash mid-save keeps the old one.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| {
                IndexError::Settings(format!("failed creating {}: {err}", parent.display()))
            })?;
        }
        let encoded = serde_json::to_vec_pretty(self)
            .map_err(|err| IndexError::Settings(format!("failed encoding settings: {err}")))?;
        let staging = path.with_extension("json.tmp");
        fs::write(&staging, encoded)
            .and_then(|()| fs::rename(&staging, path))
            .map_err(|err| {
                IndexError::Settings(format!("failed writing {}: {err}", path.display()))
            })
    }

    /// `$VOLINDEX_CONFIG`, then the XDG config directory, then `~/.config`.
    pub fn default_path() -> PathBuf {
        if let Some(explicit) = env::var_os(SETTINGS_ENV) {
            return PathBuf::from(explicit);
        }
        let base = env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .filter(|dir| dir.is_absolute())
            .or_else(|| env::var_os("HOME").map(|home| PathBuf::from(home).join(".config")))
            .unwrap_or_else(env::temp_dir);
        base.join(SETTINGS_DIR).join(SETTINGS_FILE)
    }

    pub fn update_interval(&self) -> Duration {
        Duration::from_secs(self.update_interval_secs.max(1))
    }

    pub fn mount_poll_interval(&self) -> Duration {
        Duration::from_secs(self.mount_poll_interval_secs.max(1))
    }

    pub fn checkpoint(&self) -> Option<SystemTime> {
        self.last_checkpoint
            .map(|secs| UNIX_EPOCH + Duration::from_secs(secs))
    }

    pub fn set_checkpoint(&mut self, at: SystemTime) {
        self.last_checkpoint = at
            .duration_since(UNIX_EPOCH)
            .ok()
            .map(|elapsed| elapsed.as_secs());
    }

    /// Records a permanent exclusion. Returns false if it was already known.
    pub fn add_exclusion(&mut self, path: PathBuf) -> bool {
        if self.excluded_paths.contains(&path) {
            return false;
        }
        self.excluded_paths.push(path);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempdir().unwrap();
        let settings = Settings::load(&dir.path().join("absent.json")).unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.update_interval(), Duration::from_secs(30));
        assert!(!settings.watch_removable_volumes);
    }

    #[test]
    fn save_then_load_preserves_values() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/settings.json");

        let mut settings = Settings::default();
        settings.watch_removable_volumes = true;
        settings.update_interval_secs = 5;
        settings.add_exclusion(PathBuf::from("/data/scratch"));
        settings.set_checkpoint(UNIX_EPOCH + Duration::from_secs(1_700_000_000));
        settings.save(&path).unwrap();

        let loaded = Settings::load(&path).unwrap();
        assert_eq!(loaded, settings);
        assert_eq!(
            loaded.checkpoint(),
            Some(UNIX_EPOCH + Duration::from_secs(1_700_000_000))
        );
    }

    #[test]
    fn partial_files_fill_in_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, r#"{ "update_interval_secs": 10, "writer": { "threads": 2 } }"#).unwrap();

        let loaded = Settings::load(&path).unwrap();
        assert_eq!(loaded.update_interval_secs, 10);
        assert_eq!(loaded.writer.threads, 2);
        assert_eq!(loaded.writer.heap_bytes, DEFAULT_WRITER_HEAP_BYTES);
        assert_eq!(loaded.extractor, ExtractorSettings::default());
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            Settings::load(&path),
            Err(IndexError::Settings(_))
        ));
    }

    #[test]
    fn exclusions_are_not_duplicated() {
        let mut settings = Settings::default();
        assert!(settings.add_exclusion(PathBuf::from("/a")));
        assert!(!settings.add_exclusion(PathBuf::from("/a")));
        assert_eq!(settings.excluded_paths.len(), 1);
    }

    #[test]
    fn zero_intervals_are_clamped() {
        let settings = Settings {
            update_interval_secs: 0,
            mount_poll_interval_secs: 0,
            ..Settings::default()
        };
        assert_eq!(settings.update_interval(), Duration::from_secs(1));
        assert_eq!(settings.mount_poll_interval(), Duration::from_secs(1));
    }
}
