//! Mounted volumes as seen through the kernel mount table.
//!
//! A [`Volume`] is keyed by the device id of its mount point. The id is only
//! meaningful while the volume stays mounted, so nothing here is persisted.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub const MOUNT_TABLE: &str = "/proc/self/mounts";

/// Directory reserved on every volume for maintenance data.
pub const MAINTENANCE_DIR: &str = ".volindex";
const INDEX_DIR: &str = "index";

const REMOVABLE_MOUNT_PREFIXES: &[&str] = &["/media", "/run/media"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(pub u64);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Volume {
    pub device: DeviceId,
    pub name: String,
    pub root: PathBuf,
    pub fstype: String,
    pub removable: bool,
    pub supports_live_query: bool,
}

impl Volume {
    /// A volume rooted at `root` with live-query support and no removable flag.
    pub fn new(device: DeviceId, root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let name = volume_name(&root, "");
        Self {
            device,
            name,
            root,
            fstype: String::from("unknown"),
            removable: false,
            supports_live_query: true,
        }
    }

    /// Builds a volume for an existing directory, taking the device id from
    /// the directory's metadata.
    pub fn at(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        let device = device_of(&root)?;
        Ok(Self::new(device, root))
    }

    fn from_mount(entry: &MountEntry) -> io::Result<Self> {
        let device = device_of(&entry.mount_point)?;
        let category = classify_fstype(&entry.fstype);
        Ok(Self {
            device,
            name: volume_name(&entry.mount_point, &entry.source),
            root: entry.mount_point.clone(),
            fstype: entry.fstype.clone(),
            removable: is_removable_mount(entry),
            supports_live_query: category.supports_live_query(),
        })
    }

    pub fn is_indexable(&self, watch_removable: bool) -> bool {
        self.supports_live_query && (!self.removable || watch_removable)
    }

    pub fn maintenance_dir(&self) -> PathBuf {
        self.root.join(MAINTENANCE_DIR)
    }

    pub fn index_root(&self) -> PathBuf {
        self.maintenance_dir().join(INDEX_DIR)
    }

    pub fn contains(&self, path: &Path) -> bool {
        path.starts_with(&self.root)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VolumeEvent {
    Mounted(Volume),
    Unmounted(DeviceId),
}

/// One line of the kernel mount table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub source: String,
    pub mount_point: PathBuf,
    pub fstype: String,
    pub options: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FsCategory {
    Local,
    Memory,
    Network,
    Pseudo,
    Unknown,
}

impl FsCategory {
    fn supports_live_query(self) -> bool {
        matches!(self, FsCategory::Local | FsCategory::Memory)
    }
}

fn classify_fstype(fstype: &str) -> FsCategory {
    match fstype {
        "ext2" | "ext3" | "ext4" | "xfs" | "btrfs" | "zfs" | "f2fs" | "reiserfs" | "jfs"
        | "nilfs2" | "bcachefs" | "apfs" | "hfs" | "hfsplus" | "ntfs" | "ntfs3" | "vfat"
        | "exfat" | "fuseblk" => FsCategory::Local,
        "tmpfs" | "ramfs" => FsCategory::Memory,
        "nfs" | "nfs4" | "cifs" | "smb" | "smb2" | "smbfs" | "fuse.sshfs" => FsCategory::Network,
        "proc" | "sysfs" | "devtmpfs" | "devpts" | "securityfs" | "cgroup" | "cgroup2"
        | "pstore" | "debugfs" | "tracefs" | "hugetlbfs" | "mqueue" | "configfs" | "efivarfs"
        | "binfmt_misc" | "fusectl" | "autofs" | "bpf" | "nsfs" | "overlay" | "squashfs"
        | "rpc_pipefs" => FsCategory::Pseudo,
        other if other.starts_with("fuse.") => FsCategory::Network,
        _ => FsCategory::Unknown,
    }
}

/// Parses `/proc/self/mounts` formatted text. Malformed lines are skipped.
pub fn parse_mount_table(contents: &str) -> Vec<MountEntry> {
    contents
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let source = fields.next()?;
            let mount_point = fields.next()?;
            let fstype = fields.next()?;
            let options = fields.next().unwrap_or_default();
            Some(MountEntry {
                source: unescape_mount_field(source),
                mount_point: PathBuf::from(unescape_mount_field(mount_point)),
                fstype: fstype.to_string(),
                options: options.to_string(),
            })
        })
        .collect()
}

/// Decodes the octal escapes (`\040` for space and friends) the kernel uses
/// in mount table fields.
fn unescape_mount_field(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' {
            if let Some(value) = raw
                .get(i + 1..i + 4)
                .and_then(|digits| u8::from_str_radix(digits, 8).ok())
            {
                out.push(value);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Lists the volumes that could hold user files, one per device id.
pub fn read_mounted_volumes() -> io::Result<Vec<Volume>> {
    let table = fs::read_to_string(MOUNT_TABLE)?;
    Ok(volumes_from_entries(&parse_mount_table(&table)))
}

fn volumes_from_entries(entries: &[MountEntry]) -> Vec<Volume> {
    let mut seen = BTreeSet::new();
    let mut volumes = Vec::new();
    for entry in entries {
        if classify_fstype(&entry.fstype) == FsCategory::Pseudo {
            continue;
        }
        // Mount points we cannot stat (permissions, stale network mounts) are
        // not volumes we could index anyway.
        let Ok(volume) = Volume::from_mount(entry) else {
            continue;
        };
        if seen.insert(volume.device) {
            volumes.push(volume);
        }
    }
    volumes
}

/// Computes the notifications that turn `previous` into `current`.
/// Unmounts come first so a device id reused by a new mount is released
/// before it is claimed again.
pub fn diff_volumes(previous: &[Volume], current: &[Volume]) -> Vec<VolumeEvent> {
    let before: BTreeMap<DeviceId, &Volume> = previous.iter().map(|v| (v.device, v)).collect();
    let after: BTreeMap<DeviceId, &Volume> = current.iter().map(|v| (v.device, v)).collect();

    let mut events = Vec::new();
    for (device, old) in &before {
        match after.get(device) {
            Some(new) if new.root == old.root => {}
            _ => events.push(VolumeEvent::Unmounted(*device)),
        }
    }
    for (device, new) in &after {
        match before.get(device) {
            Some(old) if old.root == new.root => {}
            _ => events.push(VolumeEvent::Mounted((*new).clone())),
        }
    }
    events
}

fn volume_name(root: &Path, source: &str) -> String {
    root.file_name()
        .map(|name| name.to_string_lossy().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| {
            if source.is_empty() {
                root.to_string_lossy().to_string()
            } else {
                source.to_string()
            }
        })
}

fn is_removable_mount(entry: &MountEntry) -> bool {
    if REMOVABLE_MOUNT_PREFIXES
        .iter()
        .any(|prefix| entry.mount_point.starts_with(prefix))
    {
        return true;
    }
    let Some(block) = block_device_name(&entry.source) else {
        return false;
    };
    fs::read_to_string(format!("/sys/block/{block}/removable"))
        .map(|flag| flag.trim() == "1")
        .unwrap_or(false)
}

/// Maps a partition node such as `/dev/sdb1` or `/dev/nvme0n1p2` to the
/// whole-disk name used under `/sys/block`.
fn block_device_name(source: &str) -> Option<String> {
    let name = source.strip_prefix("/dev/")?;
    if name.is_empty() || name.contains('/') {
        return None;
    }
    let partitioned_with_p = name.starts_with("nvme") || name.starts_with("mmcblk");
    let trimmed = if partitioned_with_p {
        match name.rfind('p') {
            Some(idx) if idx > 0 && name[idx + 1..].chars().all(|c| c.is_ascii_digit()) => {
                &name[..idx]
            }
            _ => name,
        }
    } else {
        name.trim_end_matches(|c: char| c.is_ascii_digit())
    };
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

#[cfg(unix)]
fn device_of(path: &Path) -> io::Result<DeviceId> {
    use std::os::unix::fs::MetadataExt;
    Ok(DeviceId(fs::metadata(path)?.dev()))
}

#[cfg(not(unix))]
fn device_of(_path: &Path) -> io::Result<DeviceId> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "device ids are only available on unix",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
/dev/nvme0n1p2 / ext4 rw,relatime 0 0
proc /proc proc rw,nosuid,nodev,noexec,relatime 0 0
tmpfs /run tmpfs rw,nosuid,nodev 0 0
/dev/sdb1 /media/usb\\040stick vfat rw,relatime 0 0
server:/export /mnt/share nfs4 rw 0 0
garbage
";

    #[test]
    fn parses_mount_table_lines() {
        let entries = parse_mount_table(SAMPLE);
        assert_eq!(entries.len(), 5);
        assert_eq!(entries[0].mount_point, PathBuf::from("/"));
        assert_eq!(entries[0].fstype, "ext4");
        assert_eq!(entries[3].mount_point, PathBuf::from("/media/usb stick"));
        assert_eq!(entries[3].source, "/dev/sdb1");
    }

    #[test]
    fn classifies_filesystems() {
        assert!(classify_fstype("ext4").supports_live_query());
        assert!(classify_fstype("tmpfs").supports_live_query());
        assert!(!classify_fstype("nfs4").supports_live_query());
        assert!(!classify_fstype("fuse.rclone").supports_live_query());
        assert_eq!(classify_fstype("cgroup2"), FsCategory::Pseudo);
    }

    #[test]
    fn media_mounts_are_removable() {
        let entries = parse_mount_table(SAMPLE);
        assert!(is_removable_mount(&entries[3]));
    }

    #[test]
    fn block_names_strip_partitions() {
        assert_eq!(block_device_name("/dev/sdb1").as_deref(), Some("sdb"));
        assert_eq!(block_device_name("/dev/nvme0n1p2").as_deref(), Some("nvme0n1"));
        assert_eq!(block_device_name("/dev/mmcblk0p1").as_deref(), Some("mmcblk0"));
        assert_eq!(block_device_name("server:/export"), None);
    }

    #[test]
    fn indexable_respects_removable_setting() {
        let mut volume = Volume::new(DeviceId(7), "/media/usb");
        volume.removable = true;
        assert!(!volume.is_indexable(false));
        assert!(volume.is_indexable(true));
        volume.supports_live_query = false;
        assert!(!volume.is_indexable(true));
    }

    #[test]
    fn index_root_lives_in_maintenance_dir() {
        let volume = Volume::new(DeviceId(1), "/data");
        assert_eq!(volume.index_root(), PathBuf::from("/data/.volindex/index"));
        assert!(volume.contains(Path::new("/data/docs/a.txt")));
        assert!(!volume.contains(Path::new("/database/a.txt")));
    }

    #[test]
    fn diff_reports_unmounts_before_mounts() {
        let a = Volume::new(DeviceId(1), "/a");
        let b = Volume::new(DeviceId(2), "/b");
        let c = Volume::new(DeviceId(3), "/c");
        let events = diff_volumes(&[a.clone(), b.clone()], &[a, c.clone()]);
        assert_eq!(
            events,
            vec![VolumeEvent::Unmounted(DeviceId(2)), VolumeEvent::Mounted(c)]
        );
    }

    #[test]
    fn diff_treats_moved_root_as_remount() {
        let old = Volume::new(DeviceId(4), "/mnt/old");
        let new = Volume::new(DeviceId(4), "/mnt/new");
        let events = diff_volumes(&[old], &[new.clone()]);
        assert_eq!(
            events,
            vec![VolumeEvent::Unmounted(DeviceId(4)), VolumeEvent::Mounted(new)]
        );
    }

    #[cfg(unix)]
    #[test]
    fn volume_at_reads_device_id() {
        let dir = tempfile::tempdir().unwrap();
        let volume = Volume::at(dir.path()).unwrap();
        assert_eq!(volume.root, dir.path());
        assert!(volume.supports_live_query);
    }
}
