//! Upload/remove worker pool (§4.6). Each worker owns one dedicated
//! `FtpSession` and drains jobs from a shared queue until `running` is false
//! and the queue is drained. Failures are retried up to `retry_count` times by
//! re-enqueueing before being recorded in the failure sink.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::counter::Counter;
use crate::error::Result;
use crate::ftp_session::FtpSession;
use crate::index::Index;

const PROGRESS_TEMPLATE: &str = "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] ({pos}/{len}) {msg}";

const PROGRESS_LOG_INTERVAL: Duration = Duration::from_secs(2);
const PROGRESS_THRESHOLD_BYTES: u64 = 1024 * 1024; // strictly greater than 1 MiB
const MONITOR_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobMode {
    Upload,
    Remove,
}

impl JobMode {
    fn label(self) -> &'static str {
        match self {
            JobMode::Upload => "upload",
            JobMode::Remove => "remove",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Job {
    pub path: String,
    pub retry: u32,
}

impl Job {
    pub fn fresh(path: String) -> Job {
        Job { path, retry: 0 }
    }
}

/// Monotonically false-after-true; any worker may flip it, every worker reads
/// it without locking.
#[derive(Clone)]
pub struct WorkersState {
    running: Arc<AtomicBool>,
}

impl WorkersState {
    pub fn new() -> WorkersState {
        WorkersState { running: Arc::new(AtomicBool::new(true)) }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn flag(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }
}

impl Default for WorkersState {
    fn default() -> Self {
        WorkersState::new()
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init = 0,
    Fetch = 1,
    Upload = 2,
    Index = 3,
    Delete = 4,
    Done = 5,
    Error = 6,
    Close = 7,
}

impl Phase {
    fn label(self) -> &'static str {
        match self {
            Phase::Init => "init",
            Phase::Fetch => "fetch",
            Phase::Upload => "upload",
            Phase::Index => "index",
            Phase::Delete => "delete",
            Phase::Done => "done",
            Phase::Error => "error",
            Phase::Close => "close",
        }
    }
}

struct PhaseCell(AtomicU8);

impl PhaseCell {
    fn new() -> PhaseCell {
        PhaseCell(AtomicU8::new(Phase::Init as u8))
    }

    fn set(&self, phase: Phase) {
        self.0.store(phase as u8, Ordering::SeqCst);
    }

    fn get(&self) -> u8 {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct WorkerPool {
    config: Config,
    counter: Arc<Counter>,
    index: Arc<Index>,
    mapping: Arc<Vec<(String, String)>>,
    failed: Arc<Mutex<Vec<String>>>,
}

impl WorkerPool {
    pub fn new(
        config: Config,
        counter: Arc<Counter>,
        index: Arc<Index>,
        mapping: Arc<Vec<(String, String)>>,
        failed: Arc<Mutex<Vec<String>>>,
    ) -> WorkerPool {
        WorkerPool { config, counter, index, mapping, failed }
    }

    /// Runs `jobs` to completion (or cancellation) through `config.threads`
    /// workers, blocking until the shared queue is drained.
    pub fn process(&self, jobs: Vec<String>, mode: JobMode) {
        if jobs.is_empty() {
            return;
        }

        self.counter.reset(jobs.len());

        let bar = ProgressBar::new(jobs.len() as u64);
        bar.set_style(
            ProgressStyle::default_bar()
                .template(PROGRESS_TEMPLATE)
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );

        let (tx, rx) = unbounded::<Job>();
        let pending = Arc::new(AtomicUsize::new(jobs.len()));
        for path in jobs {
            let _ = tx.send(Job::fresh(path));
        }

        let state = WorkersState::new();
        let mut handles = Vec::new();
        let mut phase_cells = Vec::new();

        for _ in 0..self.config.threads {
            let rx = rx.clone();
            let tx = tx.clone();
            let pending = pending.clone();
            let state = state.clone();
            let config = self.config.clone();
            let counter = self.counter.clone();
            let index = self.index.clone();
            let mapping = self.mapping.clone();
            let failed = self.failed.clone();
            let phase = Arc::new(PhaseCell::new());
            phase_cells.push(phase.clone());
            let bar = bar.clone();

            handles.push(thread::spawn(move || {
                run_worker(rx, tx, pending, state, config, counter, index, mapping, failed, mode, phase, bar);
            }));
        }
        drop(tx);

        let monitor_state = state.clone();
        let monitor_pending = pending.clone();
        let monitor_cells = phase_cells.clone();
        let monitor = thread::spawn(move || run_monitor(monitor_cells, monitor_pending, monitor_state));

        while pending.load(Ordering::SeqCst) > 0 && state.is_running() {
            thread::sleep(Duration::from_millis(100));
        }

        state.stop();
        for handle in handles {
            let _ = handle.join();
        }
        let _ = monitor.join();
        bar.finish_and_clear();
    }
}

#[allow(clippy::too_many_arguments)]
fn run_worker(
    rx: Receiver<Job>,
    tx: Sender<Job>,
    pending: Arc<AtomicUsize>,
    state: WorkersState,
    config: Config,
    counter: Arc<Counter>,
    index: Arc<Index>,
    mapping: Arc<Vec<(String, String)>>,
    failed: Arc<Mutex<Vec<String>>>,
    mode: JobMode,
    phase: Arc<PhaseCell>,
    bar: ProgressBar,
) {
    let mut ftp = FtpSession::new(config.clone());

    while state.is_running() || pending.load(Ordering::SeqCst) > 0 {
        let job = match rx.try_recv() {
            Ok(job) => job,
            Err(_) => {
                if pending.load(Ordering::SeqCst) == 0 {
                    break;
                }
                thread::sleep(Duration::from_millis(20));
                continue;
            }
        };

        phase.set(Phase::Fetch);
        bar.set_message(job.path.clone());
        let label = if job.retry > 0 {
            format!("retrying ({} of {}) {}", job.retry, config.retry_count, job.path)
        } else {
            format!("({}) {}", counter.next(), job.path)
        };
        info!("{} {}", mode.label(), label);

        let result = match mode {
            JobMode::Upload => do_upload(&mut ftp, &config, &index, &mapping, &job.path, &phase),
            JobMode::Remove => {
                phase.set(Phase::Delete);
                let remote = format!("{}{}", config.remote, job.path);
                ftp.delete_file_or_dir(&remote)
            }
        };

        match result {
            Ok(()) => {
                phase.set(Phase::Done);
                pending.fetch_sub(1, Ordering::SeqCst);
                bar.inc(1);
            }
            Err(e) => {
                phase.set(Phase::Error);
                ftp.close();

                if job.retry < config.retry_count {
                    let _ = tx.send(Job { path: job.path, retry: job.retry + 1 });
                } else {
                    error!(error = %e, path = %job.path, "giving up after {} retries", config.retry_count);
                    failed.lock().unwrap().push(format!("{} {} ({e})", mode.label(), job.path));
                    pending.fetch_sub(1, Ordering::SeqCst);
                    bar.inc(1);
                }
            }
        }
    }

    phase.set(Phase::Close);
    ftp.close();
}

fn do_upload(
    ftp: &mut FtpSession,
    config: &Config,
    index: &Index,
    mapping: &[(String, String)],
    path: &str,
    phase: &PhaseCell,
) -> Result<()> {
    let local = resolve_local_path(config, mapping, path);
    let remote = format!("{}{}", config.remote, path);

    if local.is_dir() {
        phase.set(Phase::Upload);
        ftp.mkdir(&remote)?;
    } else if local.is_file() {
        let size = local.metadata().map(|m| m.len()).unwrap_or(0);
        phase.set(Phase::Upload);

        if size > PROGRESS_THRESHOLD_BYTES {
            let written = AtomicUsize::new(0);
            let last_log = Mutex::new(Instant::now() - PROGRESS_LOG_INTERVAL);
            let label = path.to_string();
            let mut callback = move |n: usize| {
                let total = written.fetch_add(n, Ordering::SeqCst) + n;
                let percent = ((total as f64 / size as f64) * 100.0).round().min(100.0) as u32;
                let mut guard = last_log.lock().unwrap();
                if guard.elapsed() >= PROGRESS_LOG_INTERVAL {
                    info!("uploading {label} [{percent}%]");
                    *guard = Instant::now();
                }
            };
            ftp.store(&local, &remote, Some(&mut callback))?;
        } else {
            ftp.store(&local, &remote, None)?;
        }
    }

    phase.set(Phase::Index);
    index.write(path)?;
    Ok(())
}

/// Resolves `path` against the mapping table (longest-prefix-wins, see
/// DESIGN.md) to find its on-disk source; falls back to the configured local
/// root when no mapping applies.
fn resolve_local_path(config: &Config, mapping: &[(String, String)], path: &str) -> PathBuf {
    for (remote_prefix, local_prefix) in mapping {
        if path.starts_with(remote_prefix.as_str()) {
            let rest = &path[remote_prefix.len()..];
            return PathBuf::from(format!("{local_prefix}{rest}"));
        }
    }
    PathBuf::from(format!("{}{}", config.local.to_string_lossy(), path))
}

fn run_monitor(cells: Vec<Arc<PhaseCell>>, pending: Arc<AtomicUsize>, state: WorkersState) {
    let mut last: Vec<u8> = cells.iter().map(|c| c.get()).collect();

    while pending.load(Ordering::SeqCst) > 0 && state.is_running() {
        thread::sleep(MONITOR_INTERVAL);
        for (i, cell) in cells.iter().enumerate() {
            let current = cell.get();
            if current == last[i] && current != Phase::Done as u8 && current != Phase::Close as u8 {
                warn!(worker = i, phase = phase_label(current), "worker has not advanced since last tick");
            }
            last[i] = current;
        }
    }
}

fn phase_label(value: u8) -> &'static str {
    match value {
        0 => Phase::Init.label(),
        1 => Phase::Fetch.label(),
        2 => Phase::Upload.label(),
        3 => Phase::Index.label(),
        4 => Phase::Delete.label(),
        5 => Phase::Done.label(),
        6 => Phase::Error.label(),
        _ => Phase::Close.label(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_local_path_without_mapping_uses_config_local() {
        let config_local = PathBuf::from("/srv/www");
        let mapping: Vec<(String, String)> = vec![];
        let mut config = test_config();
        config.local = config_local;
        let resolved = resolve_local_path(&config, &mapping, "/a/b.txt");
        assert_eq!(resolved, PathBuf::from("/srv/www/a/b.txt"));
    }

    #[test]
    fn resolve_local_path_applies_mapping() {
        let mapping = vec![("/vendor".to_string(), "/tmp/vendor-build".to_string())];
        let config = test_config();
        let resolved = resolve_local_path(&config, &mapping, "/vendor/pkg/file.php");
        assert_eq!(resolved, PathBuf::from("/tmp/vendor-build/pkg/file.php"));
    }

    #[test]
    fn longest_prefix_wins_when_multiple_mappings_match() {
        let mapping = vec![
            ("/vendor".to_string(), "/tmp/short".to_string()),
            ("/vendor/pkg".to_string(), "/tmp/long".to_string()),
        ];
        // Mapping is expected to already be sorted longest-prefix-first by the
        // orchestrator before being handed to the worker pool.
        let config = test_config();
        let resolved = resolve_local_path(&config, &mapping, "/vendor/pkg/file.php");
        assert_eq!(resolved, PathBuf::from("/tmp/short/pkg/file.php"));
    }

    fn test_config() -> Config {
        Config {
            name: "t".into(),
            local: PathBuf::from("/local"),
            threads: 1,
            secure: false,
            implicit: false,
            passive: true,
            passive_workaround: false,
            connection_limit_wait: None,
            host: "h".into(),
            port: 21,
            user: "u".into(),
            password: "p".into(),
            password_encrypted: None,
            password_salt: None,
            password_encryption: false,
            remote: "/remote".into(),
            bind: None,
            retry_count: 10,
            timeout: 10,
            ignore: vec![],
            purge: vec![],
            purge_partial: Default::default(),
            purge_threads: None,
            file_log: false,
            block_size: 4096,
            composer: None,
            before: vec![],
            after: vec![],
        }
    }
}
