//! vaultsync command line: the sync daemon plus offline backup tooling.

use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use vaultsync_agent::api::{self, ApiState};
use vaultsync_agent::{AgentMetrics, Config, Syncer};
use vaultsync_backup::{generate_keypair, unwrap_key, FileBackup};
use vaultsync_output::{write_file_atomically, FileInfo, Filesystem, OsLookup};

#[derive(Parser)]
#[command(name = "vaultsync", about = "Sync secrets from a remote server to tmpfs")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the agent: poll the server and serve the local control API.
    Run {
        /// The main configuration file.
        #[arg(long, env = "VAULTSYNC_CONFIG")]
        config: PathBuf,
        /// Sync once and exit instead of polling.
        #[arg(long)]
        once: bool,
    },
    /// Write an encrypted backup of the secrets directory.
    Backup {
        #[arg(long, env = "VAULTSYNC_CONFIG")]
        config: PathBuf,
    },
    /// Restore the secrets directory offline, from backup artifacts or a
    /// bundle file. The destination must be empty.
    Restore {
        #[arg(long, env = "VAULTSYNC_CONFIG")]
        config: PathBuf,
        /// File holding the base64 unwrapped key, as printed by `unwrap`.
        #[arg(long)]
        key: Option<PathBuf>,
        /// Restore by syncing from a bundle JSON file instead of the
        /// encrypted backup.
        #[arg(long)]
        from_bundle: Option<PathBuf>,
    },
    /// Unwrap a backup key with the recipient private key and print it
    /// base64-encoded for use with `restore`.
    Unwrap {
        /// The wrapped backup key JSON.
        #[arg(long)]
        wrapped: PathBuf,
        /// The offline recipient private key (raw 32 bytes).
        #[arg(long)]
        private_key: PathBuf,
    },
    /// Generate a recipient keypair for backup wrapping.
    GenKeypair {
        /// Where to write the private key (raw bytes, mode 0400).
        #[arg(long)]
        private_key: PathBuf,
        /// Where to write the base64 public key (mode 0444).
        #[arg(long)]
        public_key: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match Cli::parse().command {
        Command::Run { config, once } => run(&config, once).await,
        Command::Backup { config } => backup(&config),
        Command::Restore {
            config,
            key,
            from_bundle,
        } => restore(&config, key.as_deref(), from_bundle.as_deref()).await,
        Command::Unwrap {
            wrapped,
            private_key,
        } => unwrap(&wrapped, &private_key),
        Command::GenKeypair {
            private_key,
            public_key,
        } => gen_keypair(&private_key, &public_key),
    }
}

async fn run(config_path: &Path, once: bool) -> Result<(), Box<dyn Error>> {
    info!(config = %config_path.display(), "loading config");
    let mut config = Config::load(config_path)?;
    if once {
        config.poll_interval_secs = 0;
    }

    let metrics = Arc::new(AgentMetrics::new());
    let api_port = config.api_port;
    let backup = build_backup(&config)?;
    let syncer = Arc::new(Syncer::new(config, Arc::new(OsLookup), metrics)?);

    let api_state = Arc::new(ApiState {
        syncer: Arc::clone(&syncer),
        backup,
    });
    tokio::spawn(async move {
        if let Err(err) = api::serve(api_state, api_port).await {
            error!(%err, "control API exited");
        }
    });

    syncer.run().await?;
    Ok(())
}

fn backup(config_path: &Path) -> Result<(), Box<dyn Error>> {
    let config = Config::load(config_path)?;
    let Some(backup) = build_backup(&config)? else {
        return Err("backups are not configured".into());
    };
    backup.backup()?;
    Ok(())
}

async fn restore(
    config_path: &Path,
    key_file: Option<&Path>,
    from_bundle: Option<&Path>,
) -> Result<(), Box<dyn Error>> {
    let config = Config::load(config_path)?;

    if let Some(bundle) = from_bundle {
        info!(bundle = %bundle.display(), "restoring from bundle");
        let metrics = Arc::new(AgentMetrics::new());
        let syncer = Syncer::with_bundle(config, bundle, Arc::new(OsLookup), metrics)?;
        let (updated, errors) = syncer.run_once().await;
        info!(
            added = updated.added,
            changed = updated.changed,
            deleted = updated.deleted,
            "bundle restore complete"
        );
        return match errors.into_iter().next() {
            Some(err) => Err(err.into()),
            None => Ok(()),
        };
    }

    let Some(key_file) = key_file else {
        return Err("restore needs --key or --from-bundle".into());
    };
    let Some(backup) = build_backup(&config)? else {
        return Err("backups are not configured".into());
    };

    let encoded = fs::read_to_string(key_file)?;
    let key = STANDARD.decode(encoded.trim())?;

    info!("restoring backup");
    if let Err(err) = backup.restore(&key) {
        warn!(%err, "error restoring backup");
        return Err(err.into());
    }
    info!("backup restored");
    Ok(())
}

fn unwrap(wrapped_path: &Path, private_key_path: &Path) -> Result<(), Box<dyn Error>> {
    let private_key = fs::read(private_key_path)?;
    let wrapped = fs::read(wrapped_path)?;
    let key = unwrap_key(&wrapped, &private_key)?;
    println!("{}", STANDARD.encode(key));
    Ok(())
}

fn gen_keypair(private_key_path: &Path, public_key_path: &Path) -> Result<(), Box<dyn Error>> {
    if private_key_path.exists() {
        return Err(format!(
            "expected private key {} to not exist",
            private_key_path.display()
        )
        .into());
    }

    let (public, secret) = generate_keypair();

    // Base64 the public key so it pastes into configuration; leave the
    // private key raw so the two are hard to confuse.
    write_file_atomically(
        public_key_path,
        false,
        FileInfo { mode: 0o444, uid: 0, gid: 0 },
        Filesystem(0),
        STANDARD.encode(public.as_bytes()).as_bytes(),
    )?;
    write_file_atomically(
        private_key_path,
        false,
        FileInfo { mode: 0o400, uid: 0, gid: 0 },
        Filesystem(0),
        &secret.to_bytes(),
    )?;

    info!(
        public_key = %public_key_path.display(),
        private_key = %private_key_path.display(),
        "keypair written"
    );
    Ok(())
}

fn build_backup(config: &Config) -> Result<Option<FileBackup>, Box<dyn Error>> {
    let Some(backup_config) = &config.backup else {
        return Ok(None);
    };
    Ok(Some(FileBackup {
        secrets_dir: config.secrets_dir.clone(),
        backup_path: backup_config.backup_path.clone(),
        key_path: backup_config.key_path.clone(),
        recipient_pubkey: backup_config.recipient_key()?,
        chown: config.chown_files,
        enforce_filesystem: config.filesystem_type,
    }))
}
