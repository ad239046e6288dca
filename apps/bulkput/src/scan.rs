//! Local tree scanning.
//!
//! Walks a directory recursively and yields every directory and file below
//! it, parents before children, siblings sorted by name.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// One local path to schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedEntry {
    pub path: PathBuf,
    pub is_dir: bool,
    pub size: i64,
    pub mod_time: Option<SystemTime>,
}

/// Scans `root` and returns its entries plus the total file size in bytes.
///
/// `root` itself is not included.
pub fn scan_tree(root: &Path) -> std::io::Result<(Vec<ScannedEntry>, i64)> {
    let mut entries = Vec::new();
    let mut total_size: i64 = 0;

    walk_dir(root, &mut entries, &mut total_size)?;

    Ok((entries, total_size))
}

fn walk_dir(current: &Path, entries: &mut Vec<ScannedEntry>, total_size: &mut i64) -> std::io::Result<()> {
    let mut children: Vec<_> = std::fs::read_dir(current)?.collect::<Result<_, _>>()?;
    children.sort_by_key(|e| e.file_name());

    for child in children {
        let path = child.path();
        let metadata = child.metadata()?;
        let mod_time = metadata.modified().ok();

        if metadata.is_dir() {
            entries.push(ScannedEntry {
                path: path.clone(),
                is_dir: true,
                size: 0,
                mod_time,
            });
            walk_dir(&path, entries, total_size)?;
        } else if metadata.is_file() {
            let size = metadata.len() as i64;
            entries.push(ScannedEntry {
                path,
                is_dir: false,
                size,
                mod_time,
            });
            *total_size += size;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn create_test_tree() -> TempDir {
        let dir = TempDir::new().unwrap();
        let root = dir.path();

        fs::write(root.join("b.txt"), b"BBBB").unwrap();
        fs::write(root.join("a.bin"), b"AA").unwrap();
        fs::create_dir_all(root.join("data").join("levels")).unwrap();
        fs::write(root.join("data").join("levels").join("one.dat"), b"LEVEL").unwrap();

        dir
    }

    #[test]
    fn scan_lists_parents_before_children() {
        let dir = create_test_tree();
        let (entries, total_size) = scan_tree(dir.path()).unwrap();

        let rel: Vec<String> = entries
            .iter()
            .map(|e| {
                e.path
                    .strip_prefix(dir.path())
                    .unwrap()
                    .to_string_lossy()
                    .replace('\\', "/")
            })
            .collect();
        assert_eq!(rel, vec!["a.bin", "b.txt", "data", "data/levels", "data/levels/one.dat"]);
        assert_eq!(total_size, 11);
        assert!(entries[2].is_dir);
        assert_eq!(entries[2].size, 0);
    }

    #[test]
    fn scan_empty_dir() {
        let dir = TempDir::new().unwrap();
        let (entries, total_size) = scan_tree(dir.path()).unwrap();
        assert!(entries.is_empty());
        assert_eq!(total_size, 0);
    }

    #[test]
    fn scan_nonexistent_dir() {
        assert!(scan_tree(Path::new("/nonexistent/path/that/does/not/exist")).is_err());
    }
}
