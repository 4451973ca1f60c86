//! Deployment orchestrator (§4.7): sequences index read, composer, before
//! commands, scan, plan, upload/remove, index upload, purge, after commands.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use regex::Regex;
use tracing::{error, info, warn};

use crate::composer::Composer;
use crate::config::Config;
use crate::counter::Counter;
use crate::error::{DeployError, Result};
use crate::exclusion::Exclusion;
use crate::ftp_session::FtpSession;
use crate::index::{Index, IndexReadResult};
use crate::process::run_commands;
use crate::purge::PurgeEngine;
use crate::scanner::{ScanResult, Scanner};
use crate::worker::{JobMode, WorkerPool};

#[derive(Debug, Clone, Default)]
pub struct DeploymentOptions {
    pub force: bool,
    pub dry_run: bool,
    pub purge_only: bool,
    pub purge_skip: bool,
    pub purge_partial_enabled: bool,
    pub skip_before_and_after: bool,
    pub clear_composer: bool,
}

pub struct Deployment {
    config: Config,
    options: DeploymentOptions,
}

impl Deployment {
    pub fn new(config: Config, options: DeploymentOptions) -> Deployment {
        Deployment { config, options }
    }

    pub fn run(&self) -> Result<()> {
        let failed: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

        if self.options.dry_run {
            info!("dry run: index and remote state will not be modified");
        }

        if self.options.purge_only {
            if self.options.dry_run {
                return Err(DeployError::config("purge cannot run under --dry-run"));
            }
            self.run_purge(&HashSet::new(), &failed)?;
            self.report_failures(&failed);
            return Ok(());
        }

        let counter = Arc::new(Counter::new());
        let mut ftp = FtpSession::new(self.config.clone());

        let index = Arc::new(Index::new(&self.config.local, &self.config.remote));
        let IndexReadResult { remove, contents } = if self.options.force {
            IndexReadResult { remove: true, contents: BTreeMap::new() }
        } else {
            index.read(&mut ftp, !self.options.dry_run)?
        };

        let mut roots = vec![self.config.local.clone()];
        let mut ignore = self.config.ignore.clone();
        let mut mapping: Vec<(String, String)> = Vec::new();

        if let Some(composer_command) = self.config.composer.clone() {
            let composer = Composer::new(&self.config.local, Some(composer_command));
            let result = composer.run(self.options.clear_composer)?;
            if let Some(parent) = result.local_vendor.parent() {
                roots.push(parent.to_path_buf());
            }
            mapping.push((result.remote_vendor.clone(), result.local_vendor.to_string_lossy().to_string()));
            ignore.push(result.remote_vendor);
            ignore.push("/composer.json".to_string());
            ignore.push("/composer.lock".to_string());
        }
        mapping.sort_by(|a, b| b.0.len().cmp(&a.0.len()));

        if !self.options.skip_before_and_after && !self.options.dry_run {
            run_commands(&self.config.before, &self.config.local, "before")?;
        }

        let root_strings: Vec<String> = roots.iter().map(|p| normalize(p)).collect();
        let exclusion = Exclusion::new(&root_strings, &ignore, &mapping);

        info!("scanning {} root(s)", roots.len());
        let scanner = Scanner::new(roots, exclusion.clone(), self.config.threads, self.config.block_size as usize);
        let scan_result = scanner.scan();
        index.set_hashes(scan_result.clone());

        let plan = plan(&scan_result, &contents, remove, &exclusion);

        if !self.options.dry_run {
            for path in &plan.written_through {
                index.write(path)?;
            }
            if index.backup_path().is_file() {
                index.remove_backup_if_exists()?;
            }
        }

        let pool = WorkerPool::new(self.config.clone(), counter.clone(), index.clone(), Arc::new(mapping), failed.clone());

        if !self.options.dry_run {
            info!("uploading {} path(s)", plan.upload.len());
            pool.process(plan.upload, JobMode::Upload);
            info!("removing {} path(s)", plan.delete.len());
            pool.process(plan.delete, JobMode::Remove);
            index.upload(&mut ftp)?;
        }
        ftp.close();

        if !self.options.purge_skip && !self.options.dry_run {
            self.run_purge(&plan.extensions, &failed)?;
        }

        if !self.options.skip_before_and_after && !self.options.dry_run {
            run_commands(&self.config.after, &self.config.local, "after")?;
        }

        self.report_failures(&failed);
        Ok(())
    }

    fn run_purge(&self, extensions: &HashSet<String>, failed: &Arc<Mutex<Vec<String>>>) -> Result<()> {
        let mut purge_list = self.config.purge.clone();
        if self.options.purge_partial_enabled {
            let substituted: Vec<String> = extensions
                .iter()
                .filter_map(|ext| self.config.purge_partial.get(ext))
                .cloned()
                .collect();
            if !substituted.is_empty() {
                purge_list = substituted;
            }
        }

        if purge_list.is_empty() {
            return Ok(());
        }

        let mut ftp = FtpSession::new(self.config.clone());
        let mut temps = Vec::new();

        for path in &purge_list {
            let remote = format!("{}{}", self.config.remote, path);
            match ftp.delete_file(&remote) {
                Ok(()) => {}
                Err(DeployError::Permission(msg)) => {
                    warn!(path = %remote, error = %msg, "permission error purging, renaming aside and recreating");
                    let epoch = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
                    let tmp = format!("{remote}_{epoch}.tmp");
                    match ftp.rename(&remote, &tmp) {
                        Ok(()) => {
                            temps.push(tmp);
                            // A permission error recreating the directory is
                            // swallowed the same way the original tool does
                            // (`except error_perm: pass`) rather than
                            // aborting the whole deploy.
                            if let Err(e) = ftp.mkdir(&remote) {
                                if !matches!(e, DeployError::Permission(_)) {
                                    return Err(e);
                                }
                            }
                        }
                        // The path never actually existed (a bare `delete`
                        // 550 on an already-absent path lands here too):
                        // nothing to rename or recreate, per §8 "purge of a
                        // remote path that does not exist is a no-op".
                        Err(DeployError::Permission(_)) => {}
                        Err(e) => return Err(e),
                    }
                }
                Err(e) => return Err(e),
            }
        }

        for path in &purge_list {
            let (parent, base) = split_parent(path);
            let listing_path = format!("{}{}", self.config.remote, parent);
            if let Ok(entries) = ftp.list(&listing_path, true) {
                let pattern = Regex::new(&format!("^{}_[0-9]+\\.tmp$", regex::escape(base))).unwrap();
                for entry in entries {
                    if pattern.is_match(&entry.name) {
                        temps.push(format!("{listing_path}/{}", entry.name));
                    }
                }
            }
        }
        ftp.close();

        if temps.is_empty() {
            return Ok(());
        }

        info!("purging {} collected path(s)", temps.len());
        let engine = PurgeEngine::new(self.config.clone());
        let remaining = engine.purge(temps);
        failed.lock().unwrap().extend(remaining);
        Ok(())
    }

    fn report_failures(&self, failed: &Arc<Mutex<Vec<String>>>) {
        let guard = failed.lock().unwrap();
        for entry in guard.iter() {
            error!("{entry}");
        }
    }
}

struct Plan {
    written_through: Vec<String>,
    upload: Vec<String>,
    delete: Vec<String>,
    extensions: HashSet<String>,
}

/// Pure planning step (§4.7 step 7), kept free of any FTP/filesystem side
/// effect so it can be exercised directly in tests.
fn plan(scan: &ScanResult, prior: &BTreeMap<String, Option<String>>, remove: bool, exclusion: &Exclusion) -> Plan {
    let mut written_through = Vec::new();
    let mut upload = Vec::new();
    let mut extensions = HashSet::new();

    for (path, fingerprint) in scan {
        match prior.get(path) {
            Some(prior_fingerprint) if prior_fingerprint.is_none() || prior_fingerprint == fingerprint => {
                written_through.push(path.clone());
            }
            _ => {
                upload.push(path.clone());
                if let Some(ext) = Path::new(path).extension().and_then(|e| e.to_str()) {
                    extensions.insert(ext.to_string());
                }
            }
        }
    }

    let mut delete = Vec::new();
    if remove {
        for prior_path in prior.keys() {
            if !scan.contains_key(prior_path) && !exclusion.is_ignored_relative(prior_path) {
                delete.push(prior_path.clone());
            }
        }
        // deepest first, to maximize rmdir success before purge has to retry.
        delete.sort_by(|a, b| b.matches('/').count().cmp(&a.matches('/').count()));
    }

    Plan { written_through, upload, delete, extensions }
}

fn split_parent(path: &str) -> (&str, &str) {
    match path.rsplit_once('/') {
        Some((parent, base)) if !parent.is_empty() => (parent, base),
        Some((_, base)) => ("", base),
        None => ("", path),
    }
}

fn normalize(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exclusion() -> Exclusion {
        Exclusion::new(&["/www".to_string()], &[], &[])
    }

    #[test]
    fn unchanged_path_is_written_through_not_uploaded() {
        let mut scan = BTreeMap::new();
        scan.insert("/a.txt".to_string(), Some("hash1".to_string()));
        let mut prior = BTreeMap::new();
        prior.insert("/a.txt".to_string(), Some("hash1".to_string()));

        let result = plan(&scan, &prior, true, &exclusion());
        assert_eq!(result.written_through, vec!["/a.txt".to_string()]);
        assert!(result.upload.is_empty());
    }

    #[test]
    fn changed_fingerprint_is_uploaded() {
        let mut scan = BTreeMap::new();
        scan.insert("/a.txt".to_string(), Some("hash2".to_string()));
        let mut prior = BTreeMap::new();
        prior.insert("/a.txt".to_string(), Some("hash1".to_string()));

        let result = plan(&scan, &prior, true, &exclusion());
        assert_eq!(result.upload, vec!["/a.txt".to_string()]);
        assert!(result.written_through.is_empty());
        assert!(result.extensions.contains("txt"));
    }

    #[test]
    fn new_path_not_in_prior_is_uploaded() {
        let mut scan = BTreeMap::new();
        scan.insert("/new.txt".to_string(), Some("hash".to_string()));
        let prior = BTreeMap::new();

        let result = plan(&scan, &prior, true, &exclusion());
        assert_eq!(result.upload, vec!["/new.txt".to_string()]);
    }

    #[test]
    fn prior_path_missing_from_scan_is_deleted_when_remove_is_true() {
        let scan = BTreeMap::new();
        let mut prior = BTreeMap::new();
        prior.insert("/gone.txt".to_string(), Some("hash".to_string()));

        let result = plan(&scan, &prior, true, &exclusion());
        assert_eq!(result.delete, vec!["/gone.txt".to_string()]);
    }

    #[test]
    fn prior_path_missing_from_scan_is_kept_when_remove_is_false() {
        let scan = BTreeMap::new();
        let mut prior = BTreeMap::new();
        prior.insert("/gone.txt".to_string(), Some("hash".to_string()));

        let result = plan(&scan, &prior, false, &exclusion());
        assert!(result.delete.is_empty());
    }

    #[test]
    fn ignored_relative_path_is_never_proposed_for_deletion() {
        let scan = BTreeMap::new();
        let mut prior = BTreeMap::new();
        prior.insert("/.deployment-index".to_string(), Some("hash".to_string()));

        let result = plan(&scan, &prior, true, &exclusion());
        assert!(result.delete.is_empty());
    }

    #[test]
    fn null_fingerprint_in_prior_counts_as_written_through() {
        let mut scan = BTreeMap::new();
        scan.insert("/dir".to_string(), None);
        let mut prior = BTreeMap::new();
        prior.insert("/dir".to_string(), None);

        let result = plan(&scan, &prior, true, &exclusion());
        assert_eq!(result.written_through, vec!["/dir".to_string()]);
    }

    #[test]
    fn split_parent_handles_root_level_path() {
        assert_eq!(split_parent("/a.txt"), ("", "a.txt"));
        assert_eq!(split_parent("/dir/a.txt"), ("/dir", "a.txt"));
    }

    #[test]
    fn delete_queue_is_sorted_deepest_first() {
        let scan = BTreeMap::new();
        let mut prior = BTreeMap::new();
        prior.insert("/a".to_string(), None);
        prior.insert("/a/b/c.txt".to_string(), Some("h".to_string()));
        prior.insert("/a/b".to_string(), None);

        let result = plan(&scan, &prior, true, &exclusion());
        assert_eq!(result.delete[0], "/a/b/c.txt");
        assert_eq!(result.delete.last().unwrap(), "/a");
    }
}
