//! Persistent deployment index (§4.4): a bzip2-compressed, line-oriented
//! `fingerprint path` table recording the last successfully deployed
//! fingerprint per path, with atomic backup/rotation semantics so a crash
//! mid-write never loses track of what was actually deployed last time.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use bzip2::write::BzEncoder;
use bzip2::Compression;
use tracing::warn;

use crate::error::{DeployError, Result};
use crate::ftp_session::FtpSession;
use crate::scanner::ScanResult;

pub const INDEX_FILE: &str = "/.deployment-index";
pub const INDEX_BACKUP_FILE: &str = "/.deployment-index.backup";

const INDEX_UPLOAD_RETRIES: u32 = 10;

pub struct IndexReadResult {
    pub remove: bool,
    pub contents: BTreeMap<String, Option<String>>,
}

pub struct Index {
    remote_root: String,
    file_path: PathBuf,
    backup_path: PathBuf,
    writer: Mutex<Option<BzEncoder<File>>>,
    hashes: RwLock<ScanResult>,
}

impl Index {
    pub fn new(local_root: &Path, remote_root: &str) -> Index {
        Index {
            remote_root: remote_root.to_string(),
            file_path: append_path(local_root, INDEX_FILE),
            backup_path: append_path(local_root, INDEX_BACKUP_FILE),
            writer: Mutex::new(None),
            hashes: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn backup_path(&self) -> &Path {
        &self.backup_path
    }

    /// Makes the scanner's fingerprint map available to `write()`, which looks
    /// up a path's fingerprint here rather than taking it as a parameter (this
    /// mirrors the teacher's `Index` holding its own `hashes` map).
    pub fn set_hashes(&self, hashes: ScanResult) {
        *self.hashes.write().unwrap() = hashes;
    }

    /// Read protocol (§4.4): rotate current→backup if needed, read the local
    /// backup if one exists, otherwise download the remote index.
    ///
    /// `mutate` gates the current→backup rename: under `--dry-run` the caller
    /// passes `false` so the read never touches local state (§4.7 step 1). A
    /// current file found with rotation suppressed is read in place instead,
    /// with the same `remove=false` semantics it would have had if rotated.
    pub fn read(&self, ftp: &mut FtpSession, mutate: bool) -> Result<IndexReadResult> {
        if mutate && self.file_path.is_file() && !self.backup_path.is_file() {
            fs::rename(&self.file_path, &self.backup_path)?;
        }

        let (raw, remove) = if self.backup_path.is_file() {
            (fs::read(&self.backup_path)?, false)
        } else if self.file_path.is_file() {
            (fs::read(&self.file_path)?, false)
        } else {
            let remote = format!("{}{}", self.remote_root, INDEX_FILE);
            match ftp.retrieve(&remote)? {
                Some(bytes) => (bytes, true),
                None => return Ok(IndexReadResult { remove: true, contents: BTreeMap::new() }),
            }
        };

        match decode_lines(&raw) {
            Some(contents) => Ok(IndexReadResult { remove, contents }),
            None => Ok(IndexReadResult { remove: true, contents: BTreeMap::new() }),
        }
    }

    /// Write protocol: append one `<fingerprint-or-"None"> <path>` line under a
    /// mutex. On first write, rotates an existing current file to backup (this
    /// mirrors read()'s rotation but applies to the edge case where a write
    /// happens before read() has run, e.g. `--force`).
    pub fn write(&self, path: &str) -> Result<()> {
        let fingerprint = self
            .hashes
            .read()
            .unwrap()
            .get(path)
            .cloned()
            .flatten()
            .unwrap_or_else(|| "None".to_string());

        let mut guard = self.writer.lock().unwrap();
        if guard.is_none() {
            if self.file_path.is_file() && !self.backup_path.is_file() {
                fs::rename(&self.file_path, &self.backup_path)?;
            }
            let file = File::create(&self.file_path)?;
            *guard = Some(BzEncoder::new(file, Compression::best()));
        }

        let encoder = guard.as_mut().expect("writer initialized above");
        writeln!(encoder, "{fingerprint} {path}")?;
        encoder.flush()?;
        Ok(())
    }

    /// The backup is deleted the moment any delta is written this run — the
    /// orchestrator calls this once it has determined that the prior state was
    /// fully carried forward (or superseded) by the current scan.
    pub fn remove_backup_if_exists(&self) -> Result<()> {
        if self.backup_path.is_file() {
            fs::remove_file(&self.backup_path)?;
        }
        Ok(())
    }

    /// Closes the writer, uploads the current file as `.deployment-index`
    /// (retrying up to 10 times with fresh sessions), and deletes the local
    /// copy on success.
    pub fn upload(&self, ftp: &mut FtpSession) -> Result<()> {
        {
            let mut guard = self.writer.lock().unwrap();
            if let Some(encoder) = guard.take() {
                encoder.finish()?;
            }
        }

        if !self.file_path.is_file() {
            File::create(&self.file_path)?;
        }

        let remote = format!("{}{}", self.remote_root, INDEX_FILE);
        let mut attempt = 0;
        loop {
            match ftp.store(&self.file_path, &remote, None) {
                Ok(()) => break,
                Err(e) => {
                    attempt += 1;
                    warn!(attempt, error = %e, "index upload failed, retrying with a fresh session");
                    if attempt >= INDEX_UPLOAD_RETRIES {
                        return Err(DeployError::message(format!(
                            "failed to upload index after {INDEX_UPLOAD_RETRIES} attempts: {e}"
                        )));
                    }
                    ftp.close();
                }
            }
        }

        fs::remove_file(&self.file_path)?;
        Ok(())
    }
}

fn append_path(root: &Path, suffix: &str) -> PathBuf {
    let joined = format!("{}{}", root.to_string_lossy().replace('\\', "/"), suffix);
    PathBuf::from(joined)
}

fn decode_lines(raw: &[u8]) -> Option<BTreeMap<String, Option<String>>> {
    let text = match decompress_bzip2(raw) {
        Ok(decoded) => String::from_utf8(decoded).ok()?,
        Err(_) => String::from_utf8(raw.to_vec()).ok()?,
    };

    let mut map = BTreeMap::new();
    for line in text.split('\n') {
        if line.is_empty() {
            continue;
        }
        if let Some((fingerprint, path)) = line.split_once(' ') {
            let value = if fingerprint == "None" { None } else { Some(fingerprint.to_string()) };
            map.insert(path.to_string(), value);
        }
    }
    Some(map)
}

fn decompress_bzip2(raw: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoder = bzip2::read::BzDecoder::new(raw);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_decode_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let index = Index::new(dir.path(), "/www");

        let mut hashes = BTreeMap::new();
        hashes.insert("/a.txt".to_string(), Some("abc123".to_string()));
        hashes.insert("/dir".to_string(), None);
        index.set_hashes(hashes);

        index.write("/a.txt").unwrap();
        index.write("/dir").unwrap();

        {
            let mut guard = index.writer.lock().unwrap();
            let encoder = guard.take().unwrap();
            encoder.finish().unwrap();
        }

        let raw = fs::read(&index.file_path).unwrap();
        let decoded = decode_lines(&raw).unwrap();
        assert_eq!(decoded.get("/a.txt").unwrap().as_deref(), Some("abc123"));
        assert_eq!(decoded.get("/dir").unwrap(), &None);
    }

    #[test]
    fn first_write_rotates_existing_current_to_backup() {
        let dir = tempfile::tempdir().unwrap();
        let index = Index::new(dir.path(), "/www");
        fs::write(&index.file_path, b"stale").unwrap();

        index.set_hashes(BTreeMap::new());
        index.write("/a.txt").unwrap();

        assert!(index.backup_path.is_file());
        assert_eq!(fs::read(&index.backup_path).unwrap(), b"stale");
    }

    #[test]
    fn legacy_uncompressed_index_is_parsed_as_fallback() {
        let raw = b"abc123 /a.txt\nNone /dir\n".to_vec();
        let decoded = decode_lines(&raw).unwrap();
        assert_eq!(decoded.get("/a.txt").unwrap().as_deref(), Some("abc123"));
        assert_eq!(decoded.get("/dir").unwrap(), &None);
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let raw = b"abc123 /a.txt\nnotvalidline\nNone /b\n".to_vec();
        let decoded = decode_lines(&raw).unwrap();
        assert_eq!(decoded.len(), 2);
    }

    #[test]
    fn invalid_utf8_returns_none_so_caller_forces_upload_everything() {
        let raw = vec![0xff, 0xfe, 0xfd];
        assert!(decode_lines(&raw).is_none());
    }

    #[test]
    fn remove_backup_if_exists_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let index = Index::new(dir.path(), "/www");
        index.remove_backup_if_exists().unwrap();

        fs::write(index.backup_path(), b"x").unwrap();
        index.remove_backup_if_exists().unwrap();
        assert!(!index.backup_path().is_file());
    }
}
