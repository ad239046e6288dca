//! Byte-range file I/O.
//!
//! [`RangeReader`] yields checksummed [`Chunk`]s from a span of a local file.
//! [`RangeWriter`] lands them at their offsets in a target file below a root
//! directory. Disjoint ranges of one target may be written by separate
//! writers at the same time.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};

use crate::checksum::checksum_bytes;
use crate::{DEFAULT_CHUNK_SIZE, TransferError};

/// One span of file data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Byte offset of `data[0]` within the file.
    pub offset: i64,
    pub data: Vec<u8>,
    /// Hex SHA-256 of `data`; `None` skips verification on write.
    pub checksum: Option<String>,
}

impl Chunk {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Offset one past the last byte.
    pub fn end(&self) -> i64 {
        self.offset + self.data.len() as i64
    }
}

// ---------------------------------------------------------------------------
// RangeReader
// ---------------------------------------------------------------------------

/// Iterates over `[start, end)` of a file in chunks of at most `chunk_size`.
pub struct RangeReader {
    file: File,
    chunk_size: usize,
    pos: i64,
    end: i64,
    file_size: i64,
}

impl RangeReader {
    /// Reads the whole file. A `chunk_size` of 0 means [`DEFAULT_CHUNK_SIZE`].
    pub fn open(path: &Path, chunk_size: usize) -> Result<Self, TransferError> {
        let file = File::open(path)?;
        let file_size = file.metadata()?.len() as i64;
        Ok(Self {
            file,
            chunk_size: if chunk_size == 0 { DEFAULT_CHUNK_SIZE } else { chunk_size },
            pos: 0,
            end: file_size,
            file_size,
        })
    }

    /// Reads `len` bytes from `start`, clipped to the file.
    pub fn range(path: &Path, chunk_size: usize, start: i64, len: i64) -> Result<Self, TransferError> {
        let mut reader = Self::open(path, chunk_size)?;
        let start = start.clamp(0, reader.file_size);
        reader.file.seek(SeekFrom::Start(start as u64))?;
        reader.pos = start;
        reader.end = start.saturating_add(len.max(0)).min(reader.file_size);
        Ok(reader)
    }

    pub fn file_size(&self) -> i64 {
        self.file_size
    }

    pub fn position(&self) -> i64 {
        self.pos
    }

    pub fn remaining(&self) -> i64 {
        self.end - self.pos
    }

    fn read_next(&mut self) -> Result<Option<Chunk>, TransferError> {
        let want = self.remaining().min(self.chunk_size as i64);
        if want <= 0 {
            return Ok(None);
        }

        let mut data = vec![0u8; want as usize];
        let n = self.file.read(&mut data)?;
        if n == 0 {
            // File shrank under us.
            self.end = self.pos;
            return Ok(None);
        }
        data.truncate(n);

        let chunk = Chunk {
            offset: self.pos,
            checksum: Some(checksum_bytes(&data)),
            data,
        };
        self.pos += n as i64;
        Ok(Some(chunk))
    }
}

impl Iterator for RangeReader {
    type Item = Result<Chunk, TransferError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.read_next().transpose()
    }
}

// ---------------------------------------------------------------------------
// RangeWriter
// ---------------------------------------------------------------------------

/// Joins `rel` onto `root`, refusing anything that would leave `root`.
///
/// `rel` must be non-empty and relative; `.` components are dropped and `..`
/// is rejected outright.
pub fn resolve_relative(root: &Path, rel: &str) -> Result<PathBuf, TransferError> {
    let mut full = root.to_path_buf();
    let mut depth = 0usize;
    for component in Path::new(rel).components() {
        match component {
            Component::Normal(part) => {
                full.push(part);
                depth += 1;
            }
            Component::CurDir => {}
            Component::ParentDir => {
                return Err(TransferError::InvalidPath(format!("escapes root: {rel}")));
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(TransferError::InvalidPath(format!("not relative: {rel}")));
            }
        }
    }
    if depth == 0 {
        return Err(TransferError::InvalidPath(format!("no file name: {rel:?}")));
    }
    Ok(full)
}

/// Writes chunks into one target file at their own offsets.
#[derive(Debug)]
pub struct RangeWriter {
    path: PathBuf,
    file: File,
    written: i64,
}

impl RangeWriter {
    /// Creates or truncates `root/rel`, making parent directories, and sizes
    /// it to `size` bytes so ranges can land in any order.
    pub fn create(root: &Path, rel: &str, size: i64) -> Result<Self, TransferError> {
        let path = resolve_relative(root, rel)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        file.set_len(size.max(0) as u64)?;
        Ok(Self {
            path,
            file,
            written: 0,
        })
    }

    /// Opens a target previously sized with [`RangeWriter::create`].
    pub fn open(root: &Path, rel: &str) -> Result<Self, TransferError> {
        let path = resolve_relative(root, rel)?;
        let file = OpenOptions::new().write(true).open(&path)?;
        Ok(Self {
            path,
            file,
            written: 0,
        })
    }

    /// Verifies the chunk checksum, if any, then writes it at its offset.
    pub fn write(&mut self, chunk: &Chunk) -> Result<(), TransferError> {
        if let Some(expected) = &chunk.checksum
            && !checksum_bytes(&chunk.data).eq_ignore_ascii_case(expected)
        {
            return Err(TransferError::ChecksumMismatch);
        }
        self.file.seek(SeekFrom::Start(chunk.offset.max(0) as u64))?;
        self.file.write_all(&chunk.data)?;
        self.written += chunk.len() as i64;
        Ok(())
    }

    /// Bytes written through this writer.
    pub fn written(&self) -> i64 {
        self.written
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn source(dir: &Path, data: &[u8]) -> PathBuf {
        let path = dir.join("source.bin");
        std::fs::write(&path, data).unwrap();
        path
    }

    fn collect(reader: RangeReader) -> Vec<Chunk> {
        reader.collect::<Result<_, _>>().unwrap()
    }

    #[test]
    fn reader_splits_file_into_chunks() {
        let dir = TempDir::new().unwrap();
        let path = source(dir.path(), b"AABBCCDDEE");

        let reader = RangeReader::open(&path, 4).unwrap();
        assert_eq!(reader.file_size(), 10);
        let chunks = collect(reader);

        let offsets: Vec<i64> = chunks.iter().map(|c| c.offset).collect();
        assert_eq!(offsets, vec![0, 4, 8]);
        assert_eq!(chunks[2].data, b"EE");
        assert_eq!(chunks[2].end(), 10);
        assert!(chunks.iter().all(|c| c.checksum.is_some()));
    }

    #[test]
    fn range_is_clipped_to_file() {
        let dir = TempDir::new().unwrap();
        let path = source(dir.path(), b"0123456789");

        let reader = RangeReader::range(&path, 3, 2, 5).unwrap();
        assert_eq!(reader.position(), 2);
        assert_eq!(reader.remaining(), 5);
        let bytes: Vec<u8> = collect(reader).into_iter().flat_map(|c| c.data).collect();
        assert_eq!(bytes, b"23456");

        assert_eq!(RangeReader::range(&path, 4, 8, 100).unwrap().remaining(), 2);
        assert_eq!(RangeReader::range(&path, 4, 50, 10).unwrap().remaining(), 0);
    }

    #[test]
    fn empty_file_yields_nothing() {
        let dir = TempDir::new().unwrap();
        let path = source(dir.path(), b"");
        assert!(collect(RangeReader::open(&path, 0).unwrap()).is_empty());
    }

    #[test]
    fn ranges_land_out_of_order() {
        let dir = TempDir::new().unwrap();
        let path = source(dir.path(), b"12345678");

        RangeWriter::create(dir.path(), "out/target.bin", 8).unwrap();
        for (start, len) in [(4, 4), (0, 4)] {
            let mut writer = RangeWriter::open(dir.path(), "out/target.bin").unwrap();
            for chunk in RangeReader::range(&path, 3, start, len).unwrap() {
                writer.write(&chunk.unwrap()).unwrap();
            }
            assert_eq!(writer.written(), 4);
        }

        assert_eq!(std::fs::read(dir.path().join("out/target.bin")).unwrap(), b"12345678");
    }

    #[test]
    fn corrupted_chunk_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut writer = RangeWriter::create(dir.path(), "t.bin", 4).unwrap();

        let good = Chunk {
            offset: 0,
            data: b"data".to_vec(),
            checksum: Some(checksum_bytes(b"data")),
        };
        writer.write(&good).unwrap();

        let bad = Chunk {
            data: b"DATA".to_vec(),
            ..good
        };
        assert!(matches!(writer.write(&bad), Err(TransferError::ChecksumMismatch)));

        let unchecked = Chunk {
            offset: 0,
            data: b"DATA".to_vec(),
            checksum: None,
        };
        writer.write(&unchecked).unwrap();
        assert_eq!(std::fs::read(writer.path()).unwrap(), b"DATA");
    }

    #[test]
    fn open_requires_prepared_target() {
        let dir = TempDir::new().unwrap();
        assert!(RangeWriter::open(dir.path(), "missing.bin").unwrap_err().is_not_found());
    }

    #[test]
    fn relative_paths_stay_below_root() {
        let root = Path::new("/data/root");
        assert_eq!(
            resolve_relative(root, "./runs/2024/run01.dat").unwrap(),
            root.join("runs/2024/run01.dat")
        );
        assert_eq!(resolve_relative(root, ".hidden").unwrap(), root.join(".hidden"));

        for bad in ["", ".", "..", "runs/../../escape", "/etc/passwd"] {
            assert!(
                matches!(resolve_relative(root, bad), Err(TransferError::InvalidPath(_))),
                "{bad:?}"
            );
        }
    }
}
