use std::io::{self, Write};
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use ftpdeploy::config::Config;
use ftpdeploy::encryption::{decrypt, encrypt, generate_salt};
use ftpdeploy::error::DeployError;
use ftpdeploy::{Deployment, DeploymentOptions};

/// Incremental FTP/FTPS deployment engine.
#[derive(Parser, Debug)]
#[command(name = "ftpdeploy", version, about)]
struct Cli {
    /// Config path or alias (resolves to `.ftp-<name>.json`)
    name: Option<String>,

    /// Skip before/after commands
    #[arg(short = 's', long = "skip")]
    skip: bool,

    /// Enable per-extension partial purge substitution
    #[arg(long = "purge-partial", visible_alias = "pp")]
    purge_partial: bool,

    /// Run purge only, skipping scan/upload/remove
    #[arg(long = "purge-only", visible_alias = "po")]
    purge_only: bool,

    /// Skip purge entirely
    #[arg(long = "purge-skip", visible_alias = "ps")]
    purge_skip: bool,

    /// Override worker thread count
    #[arg(short = 't', long = "threads")]
    threads: Option<usize>,

    /// Override purge thread count
    #[arg(long = "purge-threads", visible_alias = "pt")]
    purge_threads: Option<usize>,

    /// Override the bind interface/address
    #[arg(short = 'b', long = "bind")]
    bind: Option<String>,

    /// Ignore the existing index and upload everything
    #[arg(short = 'f', long = "force")]
    force: bool,

    /// Announce actions without mutating the index or remote
    #[arg(long = "dry-run")]
    dry_run: bool,

    /// Force a composer reinstall, discarding the stored lock checksum
    #[arg(long = "clear-composer")]
    clear_composer: bool,

    /// Encrypt the config's plaintext password in place and exit
    #[arg(long = "use-encryption")]
    use_encryption: bool,

    /// Decrypt the config's password and print it, then exit
    #[arg(short = 'd', long = "decrypt")]
    decrypt: bool,

    /// Decrypt the config's password and rewrite it in place as plaintext
    #[arg(long = "decrypt-in-place")]
    decrypt_in_place: bool,

    /// Passphrase for password encryption/decryption, supplied non-interactively
    #[arg(long = "shared-passphrase")]
    shared_passphrase: Option<String>,

    /// ssh-agent-backed passphrase retrieval (not supported by this build)
    #[arg(long = "ssh-agent")]
    ssh_agent: bool,

    /// ssh key path for agent-backed passphrase retrieval (not supported by this build)
    #[arg(long = "ssh-key")]
    ssh_key: Option<String>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            // `run` installs the tracing subscriber only once the config is
            // loaded (it needs `file_log` to decide the layers), so a config
            // load failure happens before any subscriber exists; eprintln
            // guarantees the error is still visible.
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> ftpdeploy::Result<()> {
    let cwd = std::env::current_dir()?;
    let config_path = Config::resolve_path(cli.name.as_deref(), &cwd);
    let mut config = Config::load(&config_path)?;

    init_tracing(&config);

    if let Some(threads) = cli.threads {
        config.threads = threads.max(1);
    }
    if let Some(purge_threads) = cli.purge_threads {
        config.purge_threads = Some(purge_threads);
    }
    if let Some(bind) = cli.bind {
        config.bind = Some(bind);
    }

    if cli.ssh_agent || cli.ssh_key.is_some() {
        return Err(DeployError::config(
            "ssh-agent-backed passphrase retrieval is not supported by this build; use --shared-passphrase",
        ));
    }

    if cli.use_encryption {
        return encrypt_password_in_place(&config_path, &mut config, cli.shared_passphrase.as_deref());
    }
    if cli.decrypt || cli.decrypt_in_place {
        return decrypt_password(&config_path, &mut config, cli.shared_passphrase.as_deref(), cli.decrypt_in_place);
    }

    if config.password_encryption {
        config.password = resolve_password_interactively(&config, cli.shared_passphrase.as_deref())?;
    }

    let options = DeploymentOptions {
        force: cli.force,
        dry_run: cli.dry_run,
        purge_only: cli.purge_only,
        purge_skip: cli.purge_skip,
        purge_partial_enabled: cli.purge_partial,
        skip_before_and_after: cli.skip,
        clear_composer: cli.clear_composer,
    };

    Deployment::new(config, options).run()
}

/// Builds the one global subscriber for the process: a console `fmt` layer
/// always, plus a non-blocking file layer writing `<config>.log` in the local
/// root when `file_log` is set (§6). Both layers are registered together so
/// enabling `file_log` doesn't require (and silently lose to) a second,
/// redundant `init()` call.
fn init_tracing(config: &Config) {
    let env_filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let console_layer = fmt::layer().with_filter(env_filter());

    if config.file_log {
        let file_appender = tracing_appender::rolling::never(&config.local, format!("{}.log", config.name));
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        // The appender guard must outlive the run; leaking it is acceptable
        // for a short-lived CLI process.
        Box::leak(Box::new(guard));
        let file_layer = fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false)
            .with_filter(env_filter());
        tracing_subscriber::registry().with(console_layer).with(file_layer).init();
    } else {
        tracing_subscriber::registry().with(console_layer).init();
    }
}

const MAX_PASSPHRASE_ATTEMPTS: u32 = 3;

/// Resolves `config.password` when `password_encryption` is set, retrying the
/// interactive prompt on a wrong passphrase (§7's `DecryptionFailedError`).
fn resolve_password_interactively(config: &Config, shared: Option<&str>) -> ftpdeploy::Result<String> {
    let encrypted = config.password_encrypted.as_deref().unwrap_or_default();
    let salt = config.password_salt.as_deref().unwrap_or_default();
    decrypt_with_retry(encrypted, salt, shared)
}

/// Prompts for a passphrase and decrypts `encrypted`/`salt`, retrying the
/// prompt on a wrong passphrase (§7's `DecryptionFailedError`). A passphrase
/// supplied non-interactively via `--shared-passphrase` gets a single
/// attempt, since there is no one to re-prompt.
fn decrypt_with_retry(encrypted: &str, salt: &str, shared: Option<&str>) -> ftpdeploy::Result<String> {
    let attempts = if shared.is_some() { 1 } else { MAX_PASSPHRASE_ATTEMPTS };

    let mut last_err = None;
    for attempt in 0..attempts {
        if attempt > 0 {
            eprintln!("wrong passphrase, try again");
        }
        let passphrase = prompt_passphrase(shared)?;
        match decrypt(encrypted, &passphrase, salt) {
            Ok(plaintext) => return Ok(plaintext),
            Err(e @ DeployError::DecryptionFailed(_)) => last_err = Some(e),
            Err(e) => return Err(e),
        }
    }
    Err(last_err.unwrap_or_else(|| DeployError::DecryptionFailed("no passphrase attempts made".to_string())))
}

fn prompt_passphrase(shared: Option<&str>) -> ftpdeploy::Result<String> {
    if let Some(p) = shared {
        return Ok(p.to_string());
    }
    print!("passphrase: ");
    io::stdout().flush().ok();
    let mut line = String::new();
    io::stdin()
        .read_line(&mut line)
        .map_err(|e| DeployError::message(format!("failed to read passphrase: {e}")))?;
    Ok(line.trim_end().to_string())
}

fn encrypt_password_in_place(config_path: &std::path::Path, config: &mut Config, shared: Option<&str>) -> ftpdeploy::Result<()> {
    let passphrase = prompt_passphrase(shared)?;
    let salt = generate_salt();
    let ciphertext = encrypt(&config.password, &passphrase, &salt)?;

    config.password_encrypted = Some(ciphertext);
    config.password_salt = Some(salt);
    config.password_encryption = true;
    config.password.clear();

    rewrite_config_json(config_path, config)
}

fn decrypt_password(config_path: &std::path::Path, config: &mut Config, shared: Option<&str>, in_place: bool) -> ftpdeploy::Result<()> {
    let encrypted = config
        .password_encrypted
        .clone()
        .ok_or_else(|| DeployError::config("config has no password_encrypted value to decrypt"))?;
    let salt = config
        .password_salt
        .clone()
        .ok_or_else(|| DeployError::config("config has no password_salt value to decrypt"))?;

    let plaintext = decrypt_with_retry(&encrypted, &salt, shared)?;

    if in_place {
        config.password = plaintext;
        config.password_encrypted = None;
        config.password_salt = None;
        config.password_encryption = false;
        rewrite_config_json(config_path, config)
    } else {
        println!("{plaintext}");
        Ok(())
    }
}

/// Rewrites only the connection password fields in the on-disk config JSON,
/// leaving the rest of the document untouched.
fn rewrite_config_json(config_path: &std::path::Path, config: &Config) -> ftpdeploy::Result<()> {
    let contents = std::fs::read_to_string(config_path)?;
    let mut doc: serde_json::Value = serde_json::from_str(&contents)
        .map_err(|e| DeployError::config(format!("invalid config json: {e}")))?;

    let connection = doc
        .get_mut("connection")
        .ok_or_else(|| DeployError::config("config has no connection section"))?;

    connection["password"] = serde_json::Value::String(config.password.clone());
    match &config.password_encrypted {
        Some(v) => connection["password_encrypted"] = serde_json::Value::String(v.clone()),
        None => {
            if let Some(obj) = connection.as_object_mut() {
                obj.remove("password_encrypted");
            }
        }
    }
    match &config.password_salt {
        Some(v) => connection["password_salt"] = serde_json::Value::String(v.clone()),
        None => {
            if let Some(obj) = connection.as_object_mut() {
                obj.remove("password_salt");
            }
        }
    }
    connection["password_encryption"] = serde_json::Value::Bool(config.password_encryption);

    let pretty = serde_json::to_string_pretty(&doc)
        .map_err(|e| DeployError::message(format!("failed to serialize config: {e}")))?;
    std::fs::write(config_path, pretty)?;
    Ok(())
}
