use std::fmt;
use std::sync::Arc;

/// Kind of a remote entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    File,
    Dir,
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File => f.write_str("file"),
            Self::Dir => f.write_str("directory"),
        }
    }
}

/// Snapshot of one remote path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    /// Absolute remote path.
    pub path: String,
    /// Last path component.
    pub name: String,
    pub kind: EntryKind,
    /// Size in bytes (0 for directories).
    pub size: i64,
    /// Hex SHA-256 of the content, when the store knows it.
    pub checksum: Option<String>,
}

impl RemoteEntry {
    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Dir
    }

    pub fn is_file(&self) -> bool {
        self.kind == EntryKind::File
    }
}

/// Archive container formats understood by `extract_archive`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ArchiveKind {
    #[default]
    Tar,
}

impl fmt::Display for ArchiveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tar => f.write_str("tar"),
        }
    }
}

/// Per-upload options forwarded to the store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadOptions {
    /// Target storage resource, if the store has several.
    pub resource: Option<String>,
    /// Ask the store to replicate after upload.
    pub replicate: bool,
    /// Replace an existing file instead of failing.
    pub overwrite: bool,
}

/// Byte progress callback: `(processed, total)`.
pub type ByteProgressFn = Arc<dyn Fn(i64, i64) + Send + Sync>;
