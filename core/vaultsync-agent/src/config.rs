//! Agent and per-client configuration.
//!
//! The global config is one JSON file; client configs are one JSON file
//! per client in `client_directory`, with the file stem as the client
//! name. Relative key/cert paths are resolved against that directory so
//! configs and keys can live side by side.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use vaultsync_output::Filesystem;

use crate::error::{AgentError, AgentResult};

const CLIENT_CONFIG_EXT: &str = "json";

/// Main configuration for the agent.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// The secrets server to connect to (host:port).
    pub server: String,

    /// The directory secrets are written to, one subdirectory per client.
    pub secrets_dir: PathBuf,

    /// Directory of per-client configuration files.
    pub client_directory: PathBuf,

    /// CA bundle (PEM) trusted for server communication.
    pub ca_file: PathBuf,

    /// Poll at this interval; 0 means sync once and exit.
    #[serde(default)]
    pub poll_interval_secs: u64,

    /// Port the local control API listens on.
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Default user/group to own files when a secret names none.
    #[serde(default)]
    pub default_user: String,
    #[serde(default)]
    pub default_group: String,

    /// Enforce writing to this filesystem type (statfs magic, 0 = off).
    #[serde(default)]
    pub filesystem_type: Filesystem,

    /// Whether to chown files (needs root or CAP_CHOWN).
    #[serde(default)]
    pub chown_files: bool,

    #[serde(default = "default_timeout_ms")]
    pub client_timeout_ms: u64,
    #[serde(default = "default_min_backoff_ms")]
    pub min_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Encrypted backup settings; absent disables `/backup`.
    #[serde(default)]
    pub backup: Option<BackupConfig>,
}

fn default_api_port() -> u16 {
    31738
}

fn default_timeout_ms() -> u64 {
    60_000
}

fn default_min_backoff_ms() -> u64 {
    100
}

fn default_max_backoff_ms() -> u64 {
    10_000
}

fn default_max_retries() -> u32 {
    1
}

/// Where backups are written and the key they are wrapped to.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackupConfig {
    pub backup_path: PathBuf,
    pub key_path: PathBuf,
    /// Base64 of the recipient's 32-byte X25519 public key.
    pub recipient_pubkey: String,
}

impl BackupConfig {
    /// Decodes and validates the recipient public key.
    pub fn recipient_key(&self) -> AgentResult<[u8; 32]> {
        let decoded = STANDARD
            .decode(self.recipient_pubkey.trim())
            .map_err(|err| AgentError::Config(format!("invalid recipient_pubkey: {err}")))?;
        let key: [u8; 32] = decoded.try_into().map_err(|bytes: Vec<u8>| {
            AgentError::Config(format!(
                "invalid recipient_pubkey length: expected 32, got {}",
                bytes.len()
            ))
        })?;
        Ok(key)
    }
}

/// One tenant: a key/cert pair and an output directory.
///
/// The retry/backoff/timeout fields are filled from the global config at
/// load time; an entry is reused across passes only when the whole struct
/// is identical.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Path to the PEM key.
    pub key: PathBuf,

    /// Path to the PEM certificate; empty means it's in the key file.
    #[serde(default)]
    pub cert: PathBuf,

    /// Default user/group for this client's files.
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub group: String,

    /// Directory under `secrets_dir`; empty means the client name.
    #[serde(default, rename = "directory")]
    pub dir_name: String,

    #[serde(skip)]
    pub max_retries: u32,
    #[serde(skip)]
    pub timeout_ms: u64,
    #[serde(skip)]
    pub min_backoff_ms: u64,
    #[serde(skip)]
    pub max_backoff_ms: u64,
}

impl Config {
    /// Loads and validates the main configuration file.
    pub fn load(path: &Path) -> AgentResult<Config> {
        let data = fs::read(path)
            .map_err(|err| AgentError::Config(format!("loading {}: {err}", path.display())))?;
        let config: Config = serde_json::from_slice(&data)
            .map_err(|err| AgentError::Config(format!("parsing {}: {err}", path.display())))?;

        if config.server.is_empty() {
            return Err(AgentError::Config("server must not be empty".to_string()));
        }
        if config.secrets_dir.as_os_str().is_empty() {
            return Err(AgentError::Config(
                "secrets_dir must not be empty".to_string(),
            ));
        }
        if config.max_retries < 1 {
            return Err(AgentError::Config(
                "max_retries must be at least 1".to_string(),
            ));
        }

        Ok(config)
    }

    /// Loads every client config file in `client_directory`.
    ///
    /// Only files with a `.json` extension are considered, so keys can be
    /// kept in the same directory.
    pub fn load_clients(&self) -> AgentResult<HashMap<String, ClientConfig>> {
        let entries = fs::read_dir(&self.client_directory).map_err(|err| {
            AgentError::Config(format!(
                "failed opening directory {}: {err}",
                self.client_directory.display()
            ))
        })?;

        let mut clients = HashMap::new();
        for entry in entries {
            let entry = entry.map_err(|err| AgentError::Config(err.to_string()))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(CLIENT_CONFIG_EXT) {
                continue;
            }
            let name = match path.file_stem().and_then(|s| s.to_str()) {
                Some(stem) if !stem.is_empty() => stem.to_string(),
                _ => continue,
            };

            let data = fs::read(&path).map_err(|err| {
                AgentError::Config(format!("failed opening {}: {err}", path.display()))
            })?;
            let mut client: ClientConfig = serde_json::from_slice(&data).map_err(|err| {
                AgentError::Config(format!("failed parsing {}: {err}", path.display()))
            })?;

            if client.key.as_os_str().is_empty() {
                return Err(AgentError::Config(format!(
                    "no key in config {}",
                    path.display()
                )));
            }

            if client.dir_name.is_empty() {
                client.dir_name = name.clone();
            }
            client.max_retries = self.max_retries;
            client.timeout_ms = self.client_timeout_ms;
            client.min_backoff_ms = self.min_backoff_ms;
            client.max_backoff_ms = self.max_backoff_ms;

            client.key = resolve_path(&self.client_directory, client.key);
            client.cert = if client.cert.as_os_str().is_empty() {
                // No separate cert file; it lives alongside the key.
                client.key.clone()
            } else {
                resolve_path(&self.client_directory, client.cert)
            };

            clients.insert(name, client);
        }

        Ok(clients)
    }
}

fn resolve_path(directory: &Path, path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        path
    } else {
        directory.join(path)
    }
}
