//! SHA-256 digests, hex encoded.

use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::TransferError;

const READ_BUF: usize = 64 * 1024;

/// Digest of an in-memory buffer.
pub fn checksum_bytes(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Digest over an ordered list of strings.
///
/// Every part is NUL terminated, so `["ab", "c"]` and `["a", "bc"]` differ.
pub fn checksum_strings<S: AsRef<str>>(parts: &[S]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_ref().as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

/// Digest of a whole file, streamed.
pub fn calculate_file_checksum(path: &Path) -> Result<String, TransferError> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_BUF];
    loop {
        match file.read(&mut buf)? {
            0 => break,
            n => hasher.update(&buf[..n]),
        }
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn known_digest() {
        assert_eq!(
            checksum_bytes(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn string_parts_are_delimited() {
        assert_eq!(checksum_strings(&["a", "b"]), checksum_strings(&["a", "b"]));
        assert_ne!(checksum_strings(&["a", "b"]), checksum_strings(&["b", "a"]));
        assert_ne!(checksum_strings(&["ab", "c"]), checksum_strings(&["a", "bc"]));
    }

    #[test]
    fn file_digest_matches_buffer_digest() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run.dat");
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &data).unwrap();

        assert_eq!(calculate_file_checksum(&path).unwrap(), checksum_bytes(&data));
    }
}
