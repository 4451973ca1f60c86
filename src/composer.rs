//! Composer collaborator (§4.7, supplemented from
//! `original_source/deployment/composer.py`): runs `composer install` when
//! `composer.lock`'s checksum has changed since the last deploy, and reports
//! the local/remote vendor prefixes the worker pool should remap uploads
//! through.

use std::path::{Path, PathBuf};

use tracing::info;

use crate::checksum::sha256_file;
use crate::error::Result;
use crate::process::run_commands;

const LOCK_FILE: &str = "composer.lock";
const CHECKSUM_MARKER: &str = ".composer-lock-checksum";
const VENDOR_DIR: &str = "vendor";
const BLOCK_SIZE: usize = 64 * 1024;

pub struct Composer {
    project_root: PathBuf,
    command: String,
}

pub struct ComposerResult {
    /// Absolute local directory `composer install` populated.
    pub local_vendor: PathBuf,
    /// Remote-relative prefix the vendor directory should be deployed under.
    pub remote_vendor: String,
    pub ran_install: bool,
}

impl Composer {
    pub fn new(project_root: &Path, command: Option<String>) -> Composer {
        Composer {
            project_root: project_root.to_path_buf(),
            command: command.unwrap_or_else(|| "composer install --no-dev --optimize-autoloader".to_string()),
        }
    }

    /// `clear` forces a reinstall by discarding the stored checksum, used by
    /// the `--clear-composer` CLI flag.
    pub fn run(&self, clear: bool) -> Result<ComposerResult> {
        let lock_path = self.project_root.join(LOCK_FILE);
        let marker_path = self.project_root.join(CHECKSUM_MARKER);

        if !lock_path.is_file() {
            return Ok(ComposerResult {
                local_vendor: self.project_root.join(VENDOR_DIR),
                remote_vendor: format!("/{VENDOR_DIR}"),
                ran_install: false,
            });
        }

        let current = sha256_file(&lock_path, BLOCK_SIZE)?;
        let previous = if clear { None } else { std::fs::read_to_string(&marker_path).ok() };

        if previous.as_deref().map(str::trim) == Some(current.as_str()) {
            info!("composer.lock unchanged, skipping install");
            return Ok(ComposerResult {
                local_vendor: self.project_root.join(VENDOR_DIR),
                remote_vendor: format!("/{VENDOR_DIR}"),
                ran_install: false,
            });
        }

        info!("composer.lock changed, running `{}`", self.command);
        run_commands(&[self.command.clone()], &self.project_root, "composer")?;
        std::fs::write(&marker_path, &current)?;

        Ok(ComposerResult {
            local_vendor: self.project_root.join(VENDOR_DIR),
            remote_vendor: format!("/{VENDOR_DIR}"),
            ran_install: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn missing_lock_file_skips_install() {
        let dir = tempfile::tempdir().unwrap();
        let composer = Composer::new(dir.path(), None);
        let result = composer.run(false).unwrap();
        assert!(!result.ran_install);
    }

    #[test]
    fn unchanged_checksum_skips_install() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(LOCK_FILE), b"{}").unwrap();
        let checksum = sha256_file(&dir.path().join(LOCK_FILE), BLOCK_SIZE).unwrap();
        fs::write(dir.path().join(CHECKSUM_MARKER), &checksum).unwrap();

        let composer = Composer::new(dir.path(), Some("true".to_string()));
        let result = composer.run(false).unwrap();
        assert!(!result.ran_install);
    }

    #[test]
    fn changed_checksum_runs_install_and_updates_marker() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(LOCK_FILE), b"{}").unwrap();
        fs::write(dir.path().join(CHECKSUM_MARKER), "stale").unwrap();

        let composer = Composer::new(dir.path(), Some(if cfg!(windows) { "cmd /C exit 0".to_string() } else { "true".to_string() }));
        let result = composer.run(false).unwrap();
        assert!(result.ran_install);

        let expected = sha256_file(&dir.path().join(LOCK_FILE), BLOCK_SIZE).unwrap();
        let stored = fs::read_to_string(dir.path().join(CHECKSUM_MARKER)).unwrap();
        assert_eq!(stored, expected);
    }

    #[test]
    fn clear_forces_install_even_with_matching_checksum() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(LOCK_FILE), b"{}").unwrap();
        let checksum = sha256_file(&dir.path().join(LOCK_FILE), BLOCK_SIZE).unwrap();
        fs::write(dir.path().join(CHECKSUM_MARKER), &checksum).unwrap();

        let composer = Composer::new(dir.path(), Some(if cfg!(windows) { "cmd /C exit 0".to_string() } else { "true".to_string() }));
        let result = composer.run(true).unwrap();
        assert!(result.ran_install);
    }
}
