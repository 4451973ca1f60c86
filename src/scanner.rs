//! Scanner (§4.2): enumerates one or more local roots into an ordered
//! `path → fingerprint-or-null` map, using two cooperating worker pools — a
//! directory-listing pool and a hashing pool — connected by bounded channels.
//!
//! An ignored subdirectory is not descended. A pattern that exactly matches a
//! directory is recorded as a null entry but not descended either; any other
//! match suppresses the directory from the result entirely (§9's "re-entrant
//! scanner ignore semantics", preserved verbatim).

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::warn;

use crate::checksum::sha256_file;
use crate::exclusion::Exclusion;

pub type ScanResult = BTreeMap<String, Option<String>>;

const POLL_SLEEP: Duration = Duration::from_millis(5);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

struct DirTask {
    absolute: PathBuf,
    root: String,
    prefix_len: usize,
}

struct FileTask {
    absolute: PathBuf,
    relative: String,
}

enum ResultEntry {
    Directory(String),
    File(String, String),
}

pub struct Scanner {
    roots: Vec<PathBuf>,
    exclusion: Arc<Exclusion>,
    threads: usize,
    block_size: usize,
    running: Arc<AtomicBool>,
}

impl Scanner {
    pub fn new(roots: Vec<PathBuf>, exclusion: Exclusion, threads: usize, block_size: usize) -> Scanner {
        Scanner {
            roots,
            exclusion: Arc::new(exclusion),
            threads: threads.max(1),
            block_size,
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Shared flag an external caller (e.g. a Ctrl-C handler) can flip to
    /// request cooperative cancellation.
    pub fn running_flag(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    pub fn scan(&self) -> ScanResult {
        let (dir_tx, dir_rx) = bounded::<DirTask>(4096);
        let (file_tx, file_rx) = bounded::<FileTask>(4096);
        let (result_tx, result_rx) = bounded::<ResultEntry>(4096);

        let outstanding = Arc::new(AtomicUsize::new(0));

        for root in &self.roots {
            let normalized = normalize(root);
            outstanding.fetch_add(1, Ordering::SeqCst);
            let _ = dir_tx.send(DirTask {
                absolute: root.clone(),
                root: normalized.clone(),
                prefix_len: normalized.len(),
            });
        }

        let mut handles = Vec::new();

        for _ in 0..self.threads {
            let dir_rx = dir_rx.clone();
            let dir_tx = dir_tx.clone();
            let file_tx = file_tx.clone();
            let result_tx = result_tx.clone();
            let outstanding = outstanding.clone();
            let exclusion = self.exclusion.clone();
            let running = self.running.clone();

            handles.push(thread::spawn(move || {
                listing_worker(dir_rx, dir_tx, file_tx, result_tx, outstanding, exclusion, running);
            }));
        }

        let hash_threads = num_cpus::get().max(1);
        for _ in 0..hash_threads {
            let file_rx = file_rx.clone();
            let result_tx = result_tx.clone();
            let outstanding = outstanding.clone();
            let running = self.running.clone();
            let block_size = self.block_size;

            handles.push(thread::spawn(move || {
                hashing_worker(file_rx, result_tx, outstanding, running, block_size);
            }));
        }

        drop(dir_tx);
        drop(file_tx);
        drop(result_tx);

        // Quiescence is driven by `outstanding`; once it hits zero there is
        // nothing left in either queue and nothing mid-processing.
        let deadline_running = self.running.clone();
        let outstanding_for_wait = outstanding.clone();
        thread::spawn(move || loop {
            if outstanding_for_wait.load(Ordering::SeqCst) == 0 {
                break;
            }
            if !deadline_running.load(Ordering::SeqCst) {
                thread::sleep(SHUTDOWN_GRACE);
                break;
            }
            thread::sleep(POLL_SLEEP);
        });

        let collected = Arc::new(Mutex::new(BTreeMap::new()));
        {
            let collected = collected.clone();
            let drain = thread::spawn(move || {
                for entry in result_rx {
                    let mut map = collected.lock().unwrap();
                    match entry {
                        ResultEntry::Directory(path) => {
                            map.insert(path, None);
                        }
                        ResultEntry::File(path, hash) => {
                            map.insert(path, Some(hash));
                        }
                    }
                }
            });

            for handle in handles {
                let _ = handle.join();
            }
            drain.join().ok();
        }

        let mut result = Arc::try_unwrap(collected)
            .map(|m| m.into_inner().unwrap())
            .unwrap_or_default();

        ensure_ancestor_directories(&mut result, &self.roots.iter().map(|r| normalize(r)).collect::<Vec<_>>());

        result
    }
}

fn listing_worker(
    dir_rx: Receiver<DirTask>,
    dir_tx: Sender<DirTask>,
    file_tx: Sender<FileTask>,
    result_tx: Sender<ResultEntry>,
    outstanding: Arc<AtomicUsize>,
    exclusion: Arc<Exclusion>,
    running: Arc<AtomicBool>,
) {
    loop {
        if !running.load(Ordering::SeqCst) {
            return;
        }

        let task = match dir_rx.try_recv() {
            Ok(task) => task,
            Err(_) => {
                if outstanding.load(Ordering::SeqCst) == 0 {
                    return;
                }
                thread::sleep(POLL_SLEEP);
                continue;
            }
        };

        process_directory(&task, &dir_tx, &file_tx, &result_tx, &outstanding, &exclusion);
        outstanding.fetch_sub(1, Ordering::SeqCst);
    }
}

fn process_directory(
    task: &DirTask,
    dir_tx: &Sender<DirTask>,
    file_tx: &Sender<FileTask>,
    result_tx: &Sender<ResultEntry>,
    outstanding: &Arc<AtomicUsize>,
    exclusion: &Arc<Exclusion>,
) {
    let entries = match fs::read_dir(&task.absolute) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(path = %task.absolute.display(), error = %e, "scandir failed, skipping subtree");
            return;
        }
    };

    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(error = %e, "directory entry read failed, skipping");
                continue;
            }
        };

        let absolute = entry.path();
        let normalized_absolute = normalize(&absolute);

        // Symlinks are followed only when the resolved metadata reports a
        // regular file or directory; a broken or otherwise unresolvable
        // symlink is silently skipped.
        let metadata = match fs::metadata(&absolute) {
            Ok(m) => m,
            Err(e) => {
                warn!(path = %absolute.display(), error = %e, "stat failed, skipping");
                continue;
            }
        };

        if metadata.is_dir() {
            let ignored = exclusion.is_ignored_absolute(&normalized_absolute);
            match ignored {
                Some(_) => {
                    if exclusion.is_exact_literal_match(&normalized_absolute) {
                        let relative = normalized_absolute[task.prefix_len..].to_string();
                        let _ = result_tx.send(ResultEntry::Directory(relative));
                    }
                    // descended: no, matched pattern suppresses traversal
                }
                None => {
                    let relative = normalized_absolute[task.prefix_len..].to_string();
                    let _ = result_tx.send(ResultEntry::Directory(relative));

                    outstanding.fetch_add(1, Ordering::SeqCst);
                    let _ = dir_tx.send(DirTask {
                        absolute,
                        root: task.root.clone(),
                        prefix_len: task.prefix_len,
                    });
                }
            }
        } else if metadata.is_file() {
            if exclusion.is_ignored_absolute(&normalized_absolute).is_none() {
                let relative = normalized_absolute[task.prefix_len..].to_string();
                outstanding.fetch_add(1, Ordering::SeqCst);
                let _ = file_tx.send(FileTask { absolute, relative });
            }
        }
    }
}

fn hashing_worker(
    file_rx: Receiver<FileTask>,
    result_tx: Sender<ResultEntry>,
    outstanding: Arc<AtomicUsize>,
    running: Arc<AtomicBool>,
    block_size: usize,
) {
    loop {
        if !running.load(Ordering::SeqCst) {
            return;
        }

        let task = match file_rx.try_recv() {
            Ok(task) => task,
            Err(_) => {
                if outstanding.load(Ordering::SeqCst) == 0 {
                    return;
                }
                thread::sleep(POLL_SLEEP);
                continue;
            }
        };

        match sha256_file(&task.absolute, block_size) {
            Ok(hash) => {
                let _ = result_tx.send(ResultEntry::File(task.relative, hash));
            }
            Err(e) => {
                warn!(path = %task.absolute.display(), error = %e, "hashing failed, skipping");
            }
        }

        outstanding.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Ensures every strict ancestor directory of every file path, up to (but not
/// including) its root, is present in `result` with a null fingerprint.
fn ensure_ancestor_directories(result: &mut ScanResult, roots: &[String]) {
    let files: Vec<String> = result
        .iter()
        .filter(|(_, v)| v.is_some())
        .map(|(k, _)| k.clone())
        .collect();

    for path in files {
        let mut directory = Path::new(&path).parent();
        while let Some(dir) = directory {
            let dir_str = dir.to_string_lossy().replace('\\', "/");
            if dir_str.is_empty() || dir_str == "/" {
                break;
            }
            if result.contains_key(&dir_str) {
                break;
            }
            // roots themselves are never represented as entries.
            if roots.iter().any(|r| dir_str == *r) {
                break;
            }
            result.insert(dir_str.clone(), None);
            directory = dir.parent();
        }
    }
}

fn normalize(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;

    fn write_file(path: &Path, contents: &str) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        let mut file = File::create(path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
    }

    #[test]
    fn scans_files_and_ancestor_directories() {
        let dir = tempfile::tempdir().unwrap();
        write_file(&dir.path().join("a.txt"), "hi");
        write_file(&dir.path().join("b/c.txt"), "bye");

        let root = dir.path().to_path_buf();
        let exclusion = Exclusion::new(&[normalize(&root)], &[], &[]);
        let scanner = Scanner::new(vec![root], exclusion, 2, 4096);
        let result = scanner.scan();

        assert!(result.contains_key("/a.txt"));
        assert!(result.contains_key("/b/c.txt"));
        assert_eq!(result.get("/b"), Some(&None));
    }

    #[test]
    fn ignored_subdirectory_is_not_descended() {
        let dir = tempfile::tempdir().unwrap();
        write_file(&dir.path().join("keep.txt"), "keep");
        write_file(&dir.path().join("cache/nested.txt"), "nope");

        let root = dir.path().to_path_buf();
        let root_str = normalize(&root);
        let exclusion = Exclusion::new(&[root_str.clone()], &["/cache".to_string()], &[]);
        let scanner = Scanner::new(vec![root], exclusion, 2, 4096);
        let result = scanner.scan();

        assert!(result.contains_key("/keep.txt"));
        assert!(!result.keys().any(|k| k.starts_with("/cache")));
    }

    #[test]
    fn exact_literal_match_recorded_but_not_descended() {
        let dir = tempfile::tempdir().unwrap();
        write_file(&dir.path().join("logs/today.log"), "log");

        let root = dir.path().to_path_buf();
        let root_str = normalize(&root);
        let logs_pattern = format!("{root_str}/logs");
        let exclusion = Exclusion::new(&[root_str.clone()], &[logs_pattern], &[]);
        let scanner = Scanner::new(vec![root], exclusion, 2, 4096);
        let result = scanner.scan();

        assert_eq!(result.get("/logs"), Some(&None));
        assert!(!result.contains_key("/logs/today.log"));
    }
}
