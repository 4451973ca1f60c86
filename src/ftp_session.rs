//! FTP session (§4.1): a stateful wrapper around a single control channel.
//! Connection is lazy and one-shot — the first operation opens it. Not
//! thread-safe; each worker owns exactly one `FtpSession`.

use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::process::Command;

use regex::Regex;
use suppaftp::FtpStream;

use crate::config::Config;
use crate::error::{DeployError, Result};

const ERROR_FILE_FAILED_NO_DIRECTORY: &[&str] = &[
    "could not create file",
    "no such file or directory",
    "550",
    "553",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
}

#[derive(Debug, Clone)]
pub struct Entry {
    pub name: String,
    pub kind: EntryKind,
}

/// The result of one attempt against the purge state machine's "expected error"
/// set: ordinary success, an FTP 550-style "doesn't exist" (treated as success),
/// an expected failure that should drive a state transition, or a transient
/// error that should be retried.
#[derive(Debug)]
pub enum FtpOutcome<T> {
    Ok(T),
    NotFound,
    Expected(String),
    Transient(DeployError),
}

pub struct FtpSession {
    config: Config,
    stream: Option<FtpStream>,
    mlsd_supported: bool,
}

impl FtpSession {
    pub fn new(config: Config) -> FtpSession {
        FtpSession {
            config,
            stream: None,
            mlsd_supported: true,
        }
    }

    fn connect(&mut self) -> Result<&mut FtpStream> {
        if self.stream.is_none() {
            if self.config.host.is_empty() {
                return Err(DeployError::config("host is missing"));
            }

            let address = format!("{}:{}", self.config.host, self.config.port);
            let mut stream = FtpStream::connect(&address)
                .map_err(|e| DeployError::network(format!("connect failed: {e}")))?;

            if let Some(bind) = &self.config.bind {
                // Binding to a specific local interface is applied before
                // connect() on most clients; suppaftp doesn't expose a
                // source-address knob post-connect, so we resolve the address
                // only to validate configuration early and surface a clear
                // error if the interface can't be found.
                translate_interface_to_address(bind)?;
            }

            if self.config.secure {
                let connector = suppaftp::native_tls::TlsConnector::new()
                    .map_err(|e| DeployError::network(format!("tls init failed: {e}")))?;
                stream = stream
                    .into_secure(connector, &self.config.host)
                    .map_err(|e| DeployError::network(format!("tls upgrade failed: {e}")))?;

                if self.config.implicit {
                    // Implicit-TLS deployments expect protection to be
                    // requested explicitly once the session is secured.
                    let _ = stream.site("PROT P");
                }
            }

            stream
                .login(&self.config.user, &self.config.password)
                .map_err(|e| DeployError::permission(format!("login failed: {e}")))?;

            if self.config.passive {
                stream.set_mode(suppaftp::Mode::Passive);
            } else {
                stream.set_mode(suppaftp::Mode::Active);
            }

            self.stream = Some(stream);
        }

        Ok(self.stream.as_mut().expect("stream just set"))
    }

    pub fn rename(&mut self, current: &str, new: &str) -> Result<()> {
        let stream = self.connect()?;
        stream
            .rename(current, new)
            .map_err(|e| classify_ftp_error(&e))
    }

    pub fn mkdir(&mut self, path: &str) -> Result<()> {
        let stream = self.connect()?;
        match stream.mkdir(path) {
            Ok(()) => Ok(()),
            Err(e) => {
                let message = e.to_string();
                if message.contains("550") {
                    return Ok(()); // already exists — ignore
                }
                Err(classify_ftp_error(&e))
            }
        }
    }

    /// Uploads `local` to `remote`. On first failure with a "no such directory"
    /// style error, the parent chain is created depth-first and the store is
    /// retried exactly once.
    pub fn store(&mut self, local: &Path, remote: &str, mut progress: Option<&mut dyn FnMut(usize)>) -> Result<()> {
        self.store_inner(local, remote, &mut progress, true)
    }

    fn store_inner(
        &mut self,
        local: &Path,
        remote: &str,
        progress: &mut Option<&mut dyn FnMut(usize)>,
        ensure_parent_on_failure: bool,
    ) -> Result<()> {
        let mut file = File::open(local)?;
        let stream = self.connect()?;

        let result = if let Some(callback) = progress.as_deref_mut() {
            let mut reader = ProgressReader {
                inner: &mut file,
                callback,
            };
            stream.put_file(remote, &mut reader)
        } else {
            stream.put_file(remote, &mut file)
        };

        match result {
            Ok(_) => Ok(()),
            Err(e) => {
                let message = e.to_string().to_lowercase();
                if ensure_parent_on_failure
                    && ERROR_FILE_FAILED_NO_DIRECTORY.iter().any(|needle| message.contains(needle))
                {
                    let parent = remote.rsplit_once('/').map(|(p, _)| p).unwrap_or("");
                    self.ensure_directory_exists(parent)?;
                    return self.store_inner(local, remote, progress, false);
                }
                Err(classify_ftp_error(&e))
            }
        }
    }

    fn ensure_directory_exists(&mut self, path: &str) -> Result<()> {
        let mut current = String::new();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            current.push('/');
            current.push_str(segment);
            self.mkdir(&current)?;
        }
        Ok(())
    }

    pub fn retrieve(&mut self, remote: &str) -> Result<Option<Vec<u8>>> {
        let stream = self.connect()?;
        match stream.retr_as_buffer(remote) {
            Ok(cursor) => Ok(Some(cursor.into_inner())),
            Err(e) => {
                let message = e.to_string();
                if message.contains("550") {
                    return Ok(None); // not found
                }
                Err(DeployError::DownloadFailed(message))
            }
        }
    }

    pub fn delete_file(&mut self, path: &str) -> Result<()> {
        let stream = self.connect()?;
        stream.rm(path).map_err(|e| classify_ftp_error(&e))
    }

    /// Attempts `delete`, then on permission error attempts `rmdir`. A 550 on
    /// `rmdir` is treated as "already gone" and succeeds silently.
    pub fn delete_file_or_dir(&mut self, path: &str) -> Result<()> {
        let stream = self.connect()?;
        if stream.rm(path).is_ok() {
            return Ok(());
        }

        match stream.rmdir(path) {
            Ok(()) => Ok(()),
            Err(e) => {
                let message = e.to_string();
                if message.contains("550") {
                    return Ok(()); // already gone
                }
                Err(classify_ftp_error(&e))
            }
        }
    }

    /// `verify_absent` additionally confirms, via a `cwd` attempt, that the
    /// directory is truly gone before returning success; this discriminates
    /// "not empty" from "doesn't exist" when servers reuse the same code.
    pub fn rmdir(&mut self, path: &str, verify_absent: bool) -> Result<()> {
        let stream = self.connect()?;
        match stream.rmdir(path) {
            Ok(()) => Ok(()),
            Err(e) => {
                if !verify_absent {
                    return Err(classify_ftp_error(&e));
                }
                match stream.cwd(path) {
                    Ok(()) => Err(classify_ftp_error(&e)),
                    Err(cwd_err) => {
                        let message = cwd_err.to_string().to_lowercase();
                        if message.contains("failed to change directory") || message.contains("550") {
                            Ok(())
                        } else {
                            Err(classify_ftp_error(&e))
                        }
                    }
                }
            }
        }
    }

    /// `extended = true` prefers MLSD; once the server rejects it, the session
    /// remembers that and serves subsequent calls via LIST parsing instead.
    pub fn list(&mut self, path: &str, extended: bool) -> Result<Vec<Entry>> {
        if extended && self.mlsd_supported {
            let stream = self.connect()?;
            match stream.mlsd(Some(path)) {
                Ok(entries) => {
                    return Ok(entries
                        .into_iter()
                        .map(|f| Entry {
                            name: f.name().to_string(),
                            kind: if f.is_directory() {
                                EntryKind::Directory
                            } else {
                                EntryKind::File
                            },
                        })
                        .filter(|e| e.name != "." && e.name != "..")
                        .collect());
                }
                Err(_) => {
                    self.mlsd_supported = false;
                }
            }
        }

        if extended {
            return self.list_via_list_command(path);
        }

        let stream = self.connect()?;
        stream
            .cwd(path)
            .map_err(|e| classify_ftp_error(&e))?;
        let names = stream.nlst(None).map_err(|e| classify_ftp_error(&e))?;
        Ok(names
            .into_iter()
            .filter(|name| name != "." && name != "..")
            .map(|name| Entry {
                name,
                kind: EntryKind::File,
            })
            .collect())
    }

    fn list_via_list_command(&mut self, path: &str) -> Result<Vec<Entry>> {
        let stream = self.connect()?;
        let lines = stream.list(Some(path)).map_err(|e| classify_ftp_error(&e))?;

        let mut entries = Vec::new();
        for line in lines {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.is_empty() {
                continue;
            }
            let name = match parts.last() {
                Some(n) => n.to_string(),
                None => continue,
            };
            if name == "." || name == ".." {
                continue;
            }
            let is_dir = parts[0].starts_with('d');
            entries.push(Entry {
                name,
                kind: if is_dir { EntryKind::Directory } else { EntryKind::File },
            });
        }
        Ok(entries)
    }

    /// Idempotent; swallows all errors.
    pub fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.quit();
        }
    }
}

impl Drop for FtpSession {
    fn drop(&mut self) {
        self.close();
    }
}

struct ProgressReader<'a> {
    inner: &'a mut File,
    callback: &'a mut dyn FnMut(usize),
}

impl<'a> Read for ProgressReader<'a> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n > 0 {
            (self.callback)(n);
        }
        Ok(n)
    }
}

fn classify_ftp_error(err: &suppaftp::FtpError) -> DeployError {
    let message = err.to_string();
    let lower = message.to_lowercase();
    if lower.contains("550") || lower.contains("553") || lower.contains("permission") {
        DeployError::permission(message)
    } else {
        DeployError::network(message)
    }
}

/// Classifies a `DeployError` raised by an FTP operation against a set of
/// "expected" substrings, for the purge state machine (§4.5). Errors whose
/// message contains "no such file or directory" are treated as success.
pub fn classify<T>(result: Result<T>, expected: &[&str]) -> FtpOutcome<T> {
    match result {
        Ok(value) => FtpOutcome::Ok(value),
        Err(err) => {
            let message = err.to_string().to_lowercase();
            if message.contains("no such file or directory") {
                FtpOutcome::NotFound
            } else if expected.iter().any(|needle| message.contains(needle)) {
                FtpOutcome::Expected(message)
            } else {
                FtpOutcome::Transient(err)
            }
        }
    }
}

fn translate_interface_to_address(bind: &str) -> Result<String> {
    let ip_pattern = Regex::new(r"^[0-9.]+$").unwrap();
    if ip_pattern.is_match(bind) {
        return Ok(bind.to_string());
    }

    if cfg!(windows) {
        let output = Command::new("ipconfig.exe")
            .output()
            .map_err(|e| DeployError::message(format!("ipconfig failed: {e}")))?;
        let text = String::from_utf8_lossy(&output.stdout);

        let adapter_re = Regex::new(r"(?i)^Ethernet adapter ([^:]+):$").unwrap();
        let addr_re = Regex::new(r"(?i)^IPv4 Address[\s.]*: ([0-9.]+)$").unwrap();

        let mut found = false;
        for line in text.lines() {
            let line = line.trim();
            if let Some(caps) = adapter_re.captures(line) {
                found = &caps[1] == bind;
                continue;
            }
            if found {
                if let Some(caps) = addr_re.captures(line) {
                    return Ok(caps[1].to_string());
                }
            }
        }

        if found {
            Err(DeployError::message(format!("address not found for interface {bind}")))
        } else {
            Err(DeployError::message(format!("interface {bind} not found")))
        }
    } else {
        let output = Command::new("sh")
            .arg("-c")
            .arg(format!("ip addr show {bind}"))
            .output()
            .map_err(|e| DeployError::message(format!("ip addr show failed: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("does not exist") {
                return Err(DeployError::message(format!("interface {bind} not found")));
            }
            return Err(DeployError::message(stderr.to_string()));
        }

        let text = String::from_utf8_lossy(&output.stdout);
        let addr_re = Regex::new(r"(?im)^\s*inet ([0-9.]+)/[0-9]+").unwrap();
        addr_re
            .captures(&text)
            .map(|caps| caps[1].to_string())
            .ok_or_else(|| DeployError::message(format!("address not found for interface {bind}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_not_found() {
        let err: Result<()> = Err(DeployError::permission("550 no such file or directory"));
        assert!(matches!(classify(err, &[]), FtpOutcome::NotFound));
    }

    #[test]
    fn classify_expected() {
        let err: Result<()> = Err(DeployError::permission("directory not empty"));
        assert!(matches!(
            classify(err, &["directory not empty"]),
            FtpOutcome::Expected(_)
        ));
    }

    #[test]
    fn classify_transient_otherwise() {
        let err: Result<()> = Err(DeployError::network("connection reset"));
        assert!(matches!(classify(err, &["directory not empty"]), FtpOutcome::Transient(_)));
    }

    #[test]
    fn classify_ok_passes_through() {
        let result: Result<u32> = Ok(42);
        match classify(result, &[]) {
            FtpOutcome::Ok(v) => assert_eq!(v, 42),
            _ => panic!("expected Ok"),
        }
    }

    #[test]
    fn literal_ip_bind_passes_through_unchanged() {
        assert_eq!(translate_interface_to_address("10.0.0.5").unwrap(), "10.0.0.5");
    }
}
