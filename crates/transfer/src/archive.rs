//! Tar bundle creation and unpacking.

use std::collections::HashSet;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::TransferError;

/// Byte progress callback: `(processed, total)`.
pub type ArchiveCallback = Box<dyn FnMut(i64, i64) + Send>;

/// Returns every ancestor directory of `path`, outermost first.
pub fn parent_dirs(path: &Path) -> Vec<PathBuf> {
    let mut dirs: Vec<PathBuf> = path
        .ancestors()
        .skip(1)
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .collect();
    dirs.reverse();
    dirs
}

fn relative_name(base_dir: &Path, path: &Path) -> Result<String, TransferError> {
    let rel = path.strip_prefix(base_dir).map_err(|_| {
        TransferError::InvalidPath(format!(
            "{} is not under {}",
            path.display(),
            base_dir.display()
        ))
    })?;
    let name = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");
    Ok(name)
}

fn stat_source(path: &Path) -> Result<std::fs::Metadata, TransferError> {
    std::fs::metadata(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            TransferError::SourceMissing(path.to_path_buf())
        } else {
            TransferError::Io(e)
        }
    })
}

enum Member {
    Dir { source: PathBuf, name: String },
    File { source: PathBuf, name: String },
}

/// Writes `sources` into a tar file at `target`.
///
/// Member names are relative to `base_dir` with `/` separators. Every
/// ancestor directory of a source that lies strictly inside `base_dir` is
/// emitted once, before its first child. The callback receives `(0, total)`
/// up front and the cumulative file bytes after each file.
pub fn create_archive(
    base_dir: &Path,
    sources: &[PathBuf],
    target: &Path,
    mut callback: Option<ArchiveCallback>,
) -> Result<(), TransferError> {
    let base_dir = std::path::absolute(base_dir)?;

    let mut members = Vec::with_capacity(sources.len());
    let mut emitted: HashSet<PathBuf> = HashSet::new();
    let mut total: i64 = 0;

    for source in sources {
        let source = std::path::absolute(source)?;
        let meta = stat_source(&source)?;
        let name = relative_name(&base_dir, &source)?;

        for dir in parent_dirs(&source) {
            if dir.starts_with(&base_dir) && dir != base_dir && emitted.insert(dir.clone()) {
                let name = relative_name(&base_dir, &dir)?;
                members.push(Member::Dir { source: dir, name });
            }
        }

        if meta.is_dir() {
            if emitted.insert(source.clone()) {
                members.push(Member::Dir { source, name });
            }
        } else {
            total += meta.len() as i64;
            members.push(Member::File { source, name });
        }
    }

    if let Some(cb) = callback.as_mut() {
        cb(0, total);
    }

    let out = BufWriter::new(File::create(target)?);
    let mut builder = tar::Builder::new(out);
    let mut processed: i64 = 0;

    for member in &members {
        match member {
            Member::Dir { source, name } => {
                debug!(dir = %source.display(), name = %name, "adding directory to archive");
                builder.append_dir(name, source)?;
            }
            Member::File { source, name } => {
                let mut file = File::open(source).map_err(|e| {
                    if e.kind() == std::io::ErrorKind::NotFound {
                        TransferError::SourceMissing(source.clone())
                    } else {
                        TransferError::Io(e)
                    }
                })?;
                let size = file.metadata()?.len() as i64;
                builder.append_file(name, &mut file)?;
                processed += size;
                if let Some(cb) = callback.as_mut() {
                    cb(processed, total);
                }
            }
        }
    }

    let mut out = builder.into_inner()?;
    std::io::Write::flush(&mut out)?;
    Ok(())
}

/// Unpacks the tar file `archive` into `dest`, overwriting existing files.
pub fn unpack_archive(archive: &Path, dest: &Path) -> Result<(), TransferError> {
    let file = File::open(archive)?;
    let mut archive = tar::Archive::new(file);
    archive.set_overwrite(true);
    std::fs::create_dir_all(dest)?;
    archive.unpack(dest)?;
    Ok(())
}
