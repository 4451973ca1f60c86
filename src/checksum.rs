//! Streaming SHA-256 checksum of a file's content, read in fixed-size blocks so
//! large files never need to be fully resident in memory.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::error::Result;

/// Hash of the empty string, used as a boundary-behavior reference in tests.
pub const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

pub fn sha256_file<P: AsRef<Path>>(path: P, block_size: usize) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; block_size.max(1)];

    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_file_hashes_to_sha256_of_empty_string() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty");
        File::create(&path).unwrap();

        let hash = sha256_file(&path, 1024).unwrap();
        assert_eq!(hash, EMPTY_SHA256);
    }

    #[test]
    fn known_content_hash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hi");
        let mut file = File::create(&path).unwrap();
        file.write_all(b"hi").unwrap();

        let hash = sha256_file(&path, 1024).unwrap();
        assert_eq!(
            hash,
            "8f434346648f6b96df89dda901c5176b10a6d83961dd3c1ac88b59b2dc327aa4"
        );
    }

    #[test]
    fn block_size_does_not_change_result() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blocky");
        let mut file = File::create(&path).unwrap();
        file.write_all(&vec![0xAB; 5000]).unwrap();

        let a = sha256_file(&path, 1).unwrap();
        let b = sha256_file(&path, 4096).unwrap();
        assert_eq!(a, b);
    }
}
