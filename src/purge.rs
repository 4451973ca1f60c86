//! Purge engine (§4.5): recursively removes remote paths that no longer exist
//! locally. Modeled as a per-node state machine rather than as recursive
//! exception-driven control flow: each node is `Unknown` until probed, then
//! becomes either a `File` (delete once) or a `Listing` (enumerate children,
//! queue them, become a `Directory`), and a `Directory` is deleted once every
//! queued child has resolved.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::{info, warn};

use crate::config::Config;
use crate::ftp_session::{classify, FtpOutcome, FtpSession};

const MAX_STATE_RETRIES: u32 = 5;
const MAX_INNER_RETRIES: u32 = 10;
const EXPECTED_NOT_EMPTY: &[&str] = &["directory not empty", "550"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeState {
    Unknown,
    Listing,
    Directory,
}

/// One purge candidate. `generation` increments every time the node is
/// requeued after exhausting its per-state retry budget, so a retry counter
/// keyed by `(path, generation)` can't be mistaken for a counter belonging to
/// a prior incarnation of the same path (the race the original implementation
/// was vulnerable to: a path removed and recreated between scans reused the
/// same retry bucket as its predecessor).
#[derive(Debug, Clone)]
struct Node {
    path: String,
    state: NodeState,
    generation: u32,
}

impl Node {
    fn root(path: String) -> Node {
        Node { path, state: NodeState::Unknown, generation: 0 }
    }
}

pub struct PurgeEngine {
    config: Config,
    threads: usize,
}

impl PurgeEngine {
    pub fn new(config: Config) -> PurgeEngine {
        let threads = config.purge_threads.unwrap_or(config.threads).max(1);
        PurgeEngine { config, threads }
    }

    /// Purges every path in `candidates` (already resolved to absolute remote
    /// paths by the orchestrator). Returns the paths that could not be purged
    /// after exhausting retries.
    pub fn purge(&self, candidates: Vec<String>) -> Vec<String> {
        if candidates.is_empty() {
            return Vec::new();
        }

        let (tx, rx) = unbounded::<Node>();
        let pending = Arc::new(AtomicUsize::new(candidates.len()));
        for path in candidates {
            let _ = tx.send(Node::root(path));
        }

        let running = Arc::new(AtomicBool::new(true));
        let retries: Arc<Mutex<HashMap<(String, u32), u32>>> = Arc::new(Mutex::new(HashMap::new()));
        let failed: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for _ in 0..self.threads {
            let rx = rx.clone();
            let tx = tx.clone();
            let pending = pending.clone();
            let running = running.clone();
            let retries = retries.clone();
            let failed = failed.clone();
            let config = self.config.clone();

            handles.push(thread::spawn(move || {
                run_purge_worker(rx, tx, pending, running, retries, failed, config);
            }));
        }
        drop(tx);

        while pending.load(Ordering::SeqCst) > 0 {
            thread::sleep(Duration::from_millis(50));
        }
        running.store(false, Ordering::SeqCst);

        for handle in handles {
            let _ = handle.join();
        }

        Arc::try_unwrap(failed).map(|m| m.into_inner().unwrap()).unwrap_or_default()
    }
}

fn run_purge_worker(
    rx: Receiver<Node>,
    tx: Sender<Node>,
    pending: Arc<AtomicUsize>,
    running: Arc<AtomicBool>,
    retries: Arc<Mutex<HashMap<(String, u32), u32>>>,
    failed: Arc<Mutex<Vec<String>>>,
    config: Config,
) {
    let mut ftp = FtpSession::new(config);

    loop {
        let node = match rx.try_recv() {
            Ok(node) => node,
            Err(_) => {
                if pending.load(Ordering::SeqCst) == 0 || !running.load(Ordering::SeqCst) {
                    break;
                }
                thread::sleep(Duration::from_millis(20));
                continue;
            }
        };

        let outcome = step(&mut ftp, &node);
        handle_outcome(outcome, node, &tx, &pending, &retries, &failed);
    }

    ftp.close();
}

enum StepOutcome {
    /// Node fully resolved (deleted, or confirmed absent).
    Done,
    /// Node advanced to a new state; requeue immediately at retry 0.
    Advance(Node),
    /// A directory listing produced children; requeue the children plus the
    /// directory itself (now in `Directory` state, counting down as children
    /// resolve would require a join-count per directory — instead, the
    /// directory is requeued behind its children via a second pass: listing
    /// returns the directory deletion as the last item in the batch).
    Listed(Vec<Node>),
    /// Recoverable — bump the per-(path, generation) retry counter.
    Retry(Node),
}

fn step(ftp: &mut FtpSession, node: &Node) -> StepOutcome {
    match node.state {
        NodeState::Unknown => probe(ftp, node),
        NodeState::Listing => list_children(ftp, node),
        NodeState::Directory => delete_directory(ftp, node),
    }
}

fn probe(ftp: &mut FtpSession, node: &Node) -> StepOutcome {
    match classify(ftp.delete_file(&node.path), &[]) {
        FtpOutcome::Ok(()) | FtpOutcome::NotFound => StepOutcome::Done,
        FtpOutcome::Expected(_) => {
            let mut next = node.clone();
            next.state = NodeState::Listing;
            next.generation += 1;
            StepOutcome::Advance(next)
        }
        FtpOutcome::Transient(_) => StepOutcome::Retry(node.clone()),
    }
}

fn list_children(ftp: &mut FtpSession, node: &Node) -> StepOutcome {
    match classify(ftp.list(&node.path, true), &[]) {
        FtpOutcome::Ok(entries) => {
            let mut batch: Vec<Node> = entries
                .into_iter()
                .map(|entry| Node::root(format!("{}/{}", node.path.trim_end_matches('/'), entry.name)))
                .collect();
            let mut as_directory = node.clone();
            as_directory.state = NodeState::Directory;
            as_directory.generation += 1;
            batch.push(as_directory);
            StepOutcome::Listed(batch)
        }
        FtpOutcome::NotFound => StepOutcome::Done,
        FtpOutcome::Expected(_) => StepOutcome::Retry(node.clone()),
        FtpOutcome::Transient(_) => StepOutcome::Retry(node.clone()),
    }
}

fn delete_directory(ftp: &mut FtpSession, node: &Node) -> StepOutcome {
    match classify(ftp.rmdir(&node.path, true), EXPECTED_NOT_EMPTY) {
        FtpOutcome::Ok(()) | FtpOutcome::NotFound => StepOutcome::Done,
        FtpOutcome::Expected(_) => {
            // Not empty — a sibling worker may still be deleting a child.
            // Requeue at the same state without consuming a state-retry.
            StepOutcome::Retry(node.clone())
        }
        FtpOutcome::Transient(_) => StepOutcome::Retry(node.clone()),
    }
}

fn handle_outcome(
    outcome: StepOutcome,
    node: Node,
    tx: &Sender<Node>,
    pending: &Arc<AtomicUsize>,
    retries: &Arc<Mutex<HashMap<(String, u32), u32>>>,
    failed: &Arc<Mutex<Vec<String>>>,
) {
    match outcome {
        StepOutcome::Done => {
            retries.lock().unwrap().remove(&(node.path.clone(), node.generation));
            pending.fetch_sub(1, Ordering::SeqCst);
        }
        StepOutcome::Advance(next) => {
            let _ = tx.send(next);
        }
        StepOutcome::Listed(mut batch) => {
            pending.fetch_add(batch.len(), Ordering::SeqCst);
            pending.fetch_sub(1, Ordering::SeqCst);
            for child in batch.drain(..) {
                let _ = tx.send(child);
            }
        }
        StepOutcome::Retry(mut next) => {
            let key = (next.path.clone(), next.generation);
            let mut guard = retries.lock().unwrap();
            let attempts = guard.entry(key.clone()).or_insert(0);
            *attempts += 1;

            if *attempts > MAX_INNER_RETRIES * MAX_STATE_RETRIES {
                warn!(path = %next.path, "purge giving up after exhausting retries");
                guard.remove(&key);
                drop(guard);
                failed.lock().unwrap().push(next.path.clone());
                pending.fetch_sub(1, Ordering::SeqCst);
                return;
            }

            if *attempts % MAX_INNER_RETRIES == 0 && next.state == NodeState::Directory {
                // Flip back to listing after repeated "not empty": children
                // may have appeared that weren't enumerated on the first pass.
                info!(path = %next.path, "directory still not empty after retries, re-listing");
                next.state = NodeState::Listing;
                next.generation += 1;
            }
            drop(guard);
            let _ = tx.send(next);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_root_starts_unknown_at_generation_zero() {
        let node = Node::root("/a/b".to_string());
        assert_eq!(node.state, NodeState::Unknown);
        assert_eq!(node.generation, 0);
    }

    #[test]
    fn retry_key_distinguishes_generations() {
        let mut retries: HashMap<(String, u32), u32> = HashMap::new();
        retries.insert(("/a".to_string(), 0), 3);
        retries.insert(("/a".to_string(), 1), 0);
        assert_eq!(retries.get(&("/a".to_string(), 0)), Some(&3));
        assert_eq!(retries.get(&("/a".to_string(), 1)), Some(&0));
    }

    #[test]
    fn purge_of_empty_candidate_list_returns_no_failures() {
        let config = test_config();
        let engine = PurgeEngine::new(config);
        assert!(engine.purge(Vec::new()).is_empty());
    }

    fn test_config() -> Config {
        Config {
            name: "t".into(),
            local: std::path::PathBuf::from("/local"),
            threads: 2,
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
