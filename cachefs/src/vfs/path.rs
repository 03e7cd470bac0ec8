//! Virtual path -> backing path mapping.

use std::path::{Path, PathBuf};

#[derive(Clone, Debug)]
pub struct PathTranslator {
    root: PathBuf,
}

impl PathTranslator {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Strip one leading separator and join with the storage root.
    pub fn resolve(&self, virtual_path: &str) -> PathBuf {
        let rel = virtual_path.strip_prefix('/').unwrap_or(virtual_path);
        if rel.is_empty() {
            return self.root.clone();
        }
        self.root.join(rel)
    }
}

/// Join a directory's virtual path with a child name.
pub fn join_virtual(dir: &str, name: &str) -> String {
    if dir.ends_with('/') {
        format!("{dir}{name}")
    } else {
        format!("{dir}/{name}")
    }
}

/// Split a virtual path into (parent directory, file name).
pub fn split_virtual(path: &str) -> (String, String) {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) | None => ("/".into(), trimmed.trim_start_matches('/').into()),
        Some(n) => (trimmed[..n].into(), trimmed[n + 1..].into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_strips_one_leading_separator() {
        let t = PathTranslator::new("/srv/storage");
        assert_eq!(t.resolve("/a/b.txt"), PathBuf::from("/srv/storage/a/b.txt"));
        assert_eq!(t.resolve("a/b.txt"), PathBuf::from("/srv/storage/a/b.txt"));
        assert_eq!(t.resolve("/"), PathBuf::from("/srv/storage"));
    }

    #[test]
    fn split_and_join() {
        assert_eq!(split_virtual("/a/b/c.txt"), ("/a/b".into(), "c.txt".into()));
        assert_eq!(split_virtual("/c.txt"), ("/".into(), "c.txt".into()));
        assert_eq!(join_virtual("/", "x"), "/x");
        assert_eq!(join_virtual("/a", "x"), "/a/x");
    }
}
