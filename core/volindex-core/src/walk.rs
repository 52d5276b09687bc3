use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use ignore::WalkBuilder;
use rayon::prelude::*;
use walkdir::{DirEntry, WalkDir};

use crate::error::Result;

fn is_hidden_entry(entry: &DirEntry) -> bool {
    entry.depth() > 0 && entry.file_name().to_string_lossy().starts_with('.')
}

/// Every regular file below `root` on the same filesystem. Symbolic links
/// are not followed or returned, hidden entries are pruned together with
/// everything below them.
pub fn volume_files(root: &Path) -> impl Iterator<Item = PathBuf> {
    WalkDir::new(root)
        .follow_links(false)
        .same_file_system(true)
        .into_iter()
        .filter_entry(|entry| !is_hidden_entry(entry))
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(DirEntry::into_path)
}

/// Regular files below `root` modified strictly after `since`, sorted by
/// path. Fails only when `root` itself cannot be listed.
pub fn changed_since(root: &Path, since: SystemTime) -> Result<Vec<PathBuf>> {
    fs::read_dir(root)?;

    let mut builder = WalkBuilder::new(root);
    builder
        .standard_filters(false)
        .hidden(true)
        .follow_links(false)
        .same_file_system(true);

    let candidates: Vec<PathBuf> = builder
        .build()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_some_and(|ft| ft.is_file()))
        .map(|entry| entry.into_path())
        .collect();

    let mut changed: Vec<PathBuf> = candidates
        .into_par_iter()
        .filter(|path| {
            fs::symlink_metadata(path)
                .and_then(|metadata| metadata.modified())
                .is_ok_and(|modified| modified > since)
        })
        .collect();

    changed.par_sort();
    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;

    #[test]
    fn walks_visible_regular_files() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        fs::write(root.join("a.txt"), "a").unwrap();
        fs::create_dir(root.join("sub")).unwrap();
        fs::write(root.join("sub/b.md"), "b").unwrap();
        fs::write(root.join(".hidden.txt"), "h").unwrap();
        fs::create_dir(root.join(".volindex")).unwrap();
        fs::write(root.join(".volindex/meta.json"), "{}").unwrap();

        let mut files: Vec<_> = volume_files(root).collect();
        files.sort();
        assert_eq!(files, vec![root.join("a.txt"), root.join("sub/b.md")]);
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_are_skipped() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        fs::write(root.join("real.txt"), "r").unwrap();
        std::os::unix::fs::symlink(root.join("real.txt"), root.join("link.txt")).unwrap();

        let files: Vec<_> = volume_files(root).collect();
        assert_eq!(files, vec![root.join("real.txt")]);
    }

    #[test]
    fn changed_since_filters_by_mtime() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        fs::write(root.join("a.txt"), "a").unwrap();
        fs::create_dir(root.join(".cache")).unwrap();
        fs::write(root.join(".cache/c.txt"), "c").unwrap();

        let past = SystemTime::now() - Duration::from_secs(3600);
        assert_eq!(changed_since(root, past).unwrap(), vec![root.join("a.txt")]);

        let future = SystemTime::now() + Duration::from_secs(3600);
        assert!(changed_since(root, future).unwrap().is_empty());
    }

    #[test]
    fn changed_since_fails_for_missing_root() {
        let dir = tempdir().unwrap();
        assert!(changed_since(&dir.path().join("gone"), SystemTime::now()).is_err());
    }
}
