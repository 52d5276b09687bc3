use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;

/// Read handle to the exclusion set shared between the feed and controllers.
pub type SharedExclusions = Arc<RwLock<ExclusionSet>>;

/// Directories whose contents never reach an index. Membership is decided by
/// containment: excluding `/data/build` excludes everything below it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExclusionSet {
    dirs: Vec<PathBuf>,
}

impl ExclusionSet {
    pub fn new<I, P>(dirs: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        let mut set = Self::default();
        for dir in dirs {
            set.insert(dir);
        }
        set
    }

    pub fn shared(self) -> SharedExclusions {
        Arc::new(RwLock::new(self))
    }

    /// Returns false when the directory was already present.
    pub fn insert(&mut self, dir: impl Into<PathBuf>) -> bool {
        let dir = dir.into();
        if self.dirs.contains(&dir) {
            return false;
        }
        self.dirs.push(dir);
        true
    }

    pub fn remove(&mut self, dir: &Path) -> bool {
        let before = self.dirs.len();
        self.dirs.retain(|existing| existing != dir);
        before != self.dirs.len()
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.dirs.iter().any(|dir| path.starts_with(dir))
    }

    pub fn dirs(&self) -> &[PathBuf] {
        &self.dirs
    }

    pub fn is_empty(&self) -> bool {
        self.dirs.is_empty()
    }
}

/// True when `path`, or any directory between `root` and `path`, has a name
/// starting with a dot. Components above `root` are not considered, so a
/// volume mounted under a hidden directory still has visible files.
pub fn is_hidden(root: &Path, path: &Path) -> bool {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative.components().any(|component| match component {
        Component::Normal(name) => name.to_string_lossy().starts_with('.'),
        _ => false,
    })
}

/// Absolute and free of `.`/`..` segments.
pub fn is_well_formed(path: &Path) -> bool {
    path.is_absolute()
        && path
            .components()
            .all(|component| !matches!(component, Component::ParentDir | Component::CurDir))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hidden_names_and_ancestors_are_detected() {
        let root = Path::new("/vol");
        assert!(is_hidden(root, Path::new("/vol/.profile")));
        assert!(is_hidden(root, Path::new("/vol/.git/config")));
        assert!(is_hidden(root, Path::new("/vol/src/.cache/blob")));
        assert!(!is_hidden(root, Path::new("/vol/src/main.rs")));
        assert!(!is_hidden(root, Path::new("/vol/notes.v2.txt")));
    }

    #[test]
    fn hidden_check_ignores_components_above_root() {
        let root = Path::new("/tmp/.tmpAbc123");
        assert!(!is_hidden(root, Path::new("/tmp/.tmpAbc123/docs/a.txt")));
        assert!(is_hidden(root, Path::new("/tmp/.tmpAbc123/.trash/a.txt")));
    }

    #[test]
    fn exclusion_is_by_containment() {
        let set = ExclusionSet::new(["/vol/.volindex", "/vol/build"]);
        assert!(set.contains(Path::new("/vol/.volindex/index/meta.json")));
        assert!(set.contains(Path::new("/vol/build")));
        assert!(!set.contains(Path::new("/vol/builds/a.txt")));
        assert!(!set.contains(Path::new("/vol/src/a.txt")));
    }

    #[test]
    fn insert_and_remove_report_changes() {
        let mut set = ExclusionSet::default();
        assert!(set.insert("/a"));
        assert!(!set.insert("/a"));
        assert!(set.remove(Path::new("/a")));
        assert!(!set.remove(Path::new("/a")));
        assert!(set.is_empty());
    }

    #[test]
    fn well_formed_paths_are_absolute_and_normalized() {
        assert!(is_well_formed(Path::new("/vol/a.txt")));
        assert!(!is_well_formed(Path::new("vol/a.txt")));
        assert!(!is_well_formed(Path::new("/vol/../etc/passwd")));
    }
}
