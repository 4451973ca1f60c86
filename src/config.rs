//! Configuration file loading (§6). Deliberately a "simple JSON read": the
//! interesting engineering lives in the components that consume a `Config`, not
//! in getting it off disk.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{DeployError, Result};

const DEFAULT_PORT: u16 = 21;
const DEFAULT_RETRY_COUNT: u32 = 10;
const DEFAULT_TIMEOUT: u64 = 10;
const DEFAULT_BLOCK_SIZE: u64 = 1024 * 1024; // 1 MiB

#[derive(Debug, Deserialize, Default)]
struct RawConnection {
    threads: Option<usize>,
    secure: Option<bool>,
    implicit: Option<bool>,
    passive: Option<bool>,
    passive_workaround: Option<bool>,
    connection_limit_wait: Option<u64>,
    host: Option<String>,
    port: Option<u16>,
    user: Option<String>,
    password: Option<String>,
    password_encrypted: Option<String>,
    password_salt: Option<String>,
    password_encryption: Option<bool>,
    root: Option<String>,
    bind: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct RawConfig {
    local: Option<String>,
    connection: Option<RawConnection>,
    retry_count: Option<u32>,
    timeout: Option<u64>,
    ignore: Option<Vec<String>>,
    purge: Option<Vec<String>>,
    purge_partial: Option<HashMap<String, String>>,
    purge_threads: Option<usize>,
    file_log: Option<bool>,
    block_size: Option<u64>,
    composer: Option<String>,
    before: Option<Vec<String>>,
    after: Option<Vec<String>>,
}

/// Fully resolved configuration, with every default already applied.
#[derive(Debug, Clone)]
pub struct Config {
    pub name: String,
    pub local: PathBuf,
    pub threads: usize,
    pub secure: bool,
    pub implicit: bool,
    pub passive: bool,
    pub passive_workaround: bool,
    pub connection_limit_wait: Option<u64>,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub password_encrypted: Option<String>,
    pub password_salt: Option<String>,
    pub password_encryption: bool,
    pub remote: String,
    pub bind: Option<String>,
    pub retry_count: u32,
    pub timeout: u64,
    pub ignore: Vec<String>,
    pub purge: Vec<String>,
    pub purge_partial: HashMap<String, String>,
    pub purge_threads: Option<usize>,
    pub file_log: bool,
    pub block_size: u64,
    pub composer: Option<String>,
    pub before: Vec<String>,
    pub after: Vec<String>,
}

impl Config {
    /// Resolve the config file referenced by `name_or_path`: an explicit path, or
    /// an alias resolved as `.ftp-<alias>.json` in the current directory, or the
    /// bare `deploy` config if `name_or_path` is empty.
    pub fn resolve_path(name_or_path: Option<&str>, cwd: &Path) -> PathBuf {
        if let Some(candidate) = name_or_path {
            let path = Path::new(candidate);
            if path.is_file() {
                return path.to_path_buf();
            }
            return cwd.join(format!(".ftp-{candidate}.json"));
        }

        let default_path = cwd.join("deploy");
        if default_path.is_file() {
            return default_path;
        }
        cwd.join("deploy.json")
    }

    pub fn load(path: &Path) -> Result<Config> {
        let contents = fs::read_to_string(path)
            .map_err(|e| DeployError::config(format!("cannot read {}: {e}", path.display())))?;
        let raw: RawConfig = serde_json::from_str(&contents)
            .map_err(|e| DeployError::config(format!("invalid config json: {e}")))?;

        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("deploy")
            .to_string();

        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));

        let local = match raw.local {
            Some(ref l) => {
                let candidate = Path::new(l);
                if candidate.is_absolute() {
                    candidate.to_path_buf()
                } else {
                    base_dir.join(candidate)
                }
            }
            None => base_dir.to_path_buf(),
        };

        let connection = raw.connection.unwrap_or_default();

        let host = connection
            .host
            .ok_or_else(|| DeployError::config("connection.host is not defined"))?;
        let user = connection
            .user
            .ok_or_else(|| DeployError::config("connection.user is not defined"))?;
        let mut remote = connection
            .root
            .ok_or_else(|| DeployError::config("connection.root is not defined"))?;
        if remote == "/" {
            remote = String::new();
        }

        let threads = connection.threads.unwrap_or(1).max(1);

        Ok(Config {
            name,
            local,
            threads,
            secure: connection.secure.unwrap_or(false),
            implicit: connection.implicit.unwrap_or(false),
            passive: connection.passive.unwrap_or(true),
            passive_workaround: connection.passive_workaround.unwrap_or(false),
            connection_limit_wait: connection.connection_limit_wait,
            host,
            port: connection.port.unwrap_or(DEFAULT_PORT),
            user,
            password: connection.password.unwrap_or_default(),
            password_encrypted: connection.password_encrypted,
            password_salt: connection.password_salt,
            password_encryption: connection.password_encryption.unwrap_or(false),
            remote,
            bind: connection.bind,
            retry_count: raw.retry_count.unwrap_or(DEFAULT_RETRY_COUNT),
            timeout: raw.timeout.unwrap_or(DEFAULT_TIMEOUT),
            ignore: raw.ignore.unwrap_or_default(),
            purge: raw.purge.unwrap_or_default(),
            purge_partial: raw.purge_partial.unwrap_or_default(),
            purge_threads: raw.purge_threads,
            file_log: raw.file_log.unwrap_or(false),
            block_size: raw.block_size.unwrap_or(DEFAULT_BLOCK_SIZE),
            composer: raw.composer,
            before: raw.before.unwrap_or_default(),
            after: raw.after.unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(dir: &Path, contents: &str) -> PathBuf {
        let path = dir.join(".ftp-test.json");
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn loads_minimal_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            dir.path(),
            r#"{"connection": {"host": "ftp.example.com", "user": "bob", "root": "/www"}}"#,
        );

        let config = Config::load(&path).unwrap();
        assert_eq!(config.host, "ftp.example.com");
        assert_eq!(config.user, "bob");
        assert_eq!(config.remote, "/www");
        assert_eq!(config.port, 21);
        assert_eq!(config.retry_count, 10);
        assert_eq!(config.threads, 1);
    }

    #[test]
    fn root_slash_becomes_empty_string() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            dir.path(),
            r#"{"connection": {"host": "h", "user": "u", "root": "/"}}"#,
        );

        let config = Config::load(&path).unwrap();
        assert_eq!(config.remote, "");
    }

    #[test]
    fn missing_required_field_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), r#"{"connection": {"host": "h"}}"#);

        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, DeployError::Config(_)));
    }

    #[test]
    fn thread_count_floors_at_one() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            dir.path(),
            r#"{"connection": {"host": "h", "user": "u", "root": "/", "threads": 0}}"#,
        );

        let config = Config::load(&path).unwrap();
        assert_eq!(config.threads, 1);
    }
}
