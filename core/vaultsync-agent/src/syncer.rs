//! The reconciliation engine.
//!
//! A [`Syncer`] owns one [`SyncerEntry`] per configured client and drives
//! the on-disk state of every client directory to match the server's
//! catalog: fetch what is stale, write it atomically, reconcile deletions,
//! and sweep anything unrecognized. All reconciliation — the poll loop and
//! every control-API trigger — serializes through one mutex.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::{Duration, Instant};

use rand::Rng as _;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use vaultsync_output::Lookup;

use crate::bundle::BundleClient;
use crate::client::{HttpsClient, SecretSource};
use crate::config::{ClientConfig, Config};
use crate::error::{AgentError, AgentResult};
use crate::metrics::AgentMetrics;
use crate::output::{Output, OutputDirCollection, SecretState};

/// How many poll intervals may pass without a success before `/status`
/// reports unhealthy.
pub const FAILURE_THRESHOLD_MULTIPLIER: u32 = 10;

/// Counts of what one pass changed on disk.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Updated {
    pub added: usize,
    pub changed: usize,
    pub deleted: usize,
}

impl Updated {
    pub fn merge(&mut self, other: Updated) {
        self.added += other.added;
        self.changed += other.changed;
        self.deleted += other.deleted;
    }
}

/// One client's reconciliation unit: its secrets source, its output
/// directory, and the record of everything written so far.
pub struct SyncerEntry {
    pub name: String,
    pub client: SecretSource,
    pub config: ClientConfig,
    pub output: Box<dyn Output>,
    sync_state: HashMap<String, SecretState>,
}

impl SyncerEntry {
    pub fn new(
        name: String,
        client: SecretSource,
        config: ClientConfig,
        output: Box<dyn Output>,
    ) -> SyncerEntry {
        SyncerEntry {
            name,
            client,
            config,
            output,
            sync_state: HashMap::new(),
        }
    }

    /// Reconciles this client against the server catalog.
    ///
    /// New and changed secrets are written before anything is deleted, so
    /// a rotated filename never leaves a window with neither value on
    /// disk. Per-secret failures are recorded and the loop continues; any
    /// inconsistency converges by being rewritten on a later pass.
    pub async fn sync(&mut self) -> (Updated, Vec<AgentError>) {
        let mut updated = Updated::default();
        let mut errors = Vec::new();

        let secrets = match self.client.list().await {
            Ok(secrets) => secrets,
            Err(err) => {
                errors.push(err);
                return (updated, errors);
            }
        };

        let mut pending_deletions: Vec<String> = Vec::new();

        for (filename, metadata) in &secrets {
            if let Some(state) = self.sync_state.get(filename) {
                // The local copy is authoritative while it still matches.
                if self.output.validate(metadata, state) {
                    continue;
                }
            }

            let secret = match self.client.get(&metadata.name).await {
                Ok(secret) => secret,
                Err(AgentError::SecretDeleted) => {
                    // Deleted between list and get; reconcile it below.
                    pending_deletions.push(filename.clone());
                    continue;
                }
                Err(err) => {
                    warn!(client = %self.name, secret = %filename, %err, "fetching secret");
                    errors.push(err);
                    continue;
                }
            };

            let existed = self.sync_state.contains_key(filename);
            let state = match self.output.write(&secret) {
                Ok(state) => state,
                Err(err) => {
                    error!(client = %self.name, secret = %filename, %err, "writing secret");
                    errors.push(err);
                    continue;
                }
            };
            self.sync_state.insert(filename.clone(), state);
            if existed {
                updated.changed += 1;
            } else {
                updated.added += 1;
            }

            // Immediately verify what was written. If it doesn't check
            // out, forget the state so the next pass rewrites it.
            if let Some(state) = self.sync_state.get(filename) {
                if !self.output.validate(&secret, state) {
                    warn!(client = %self.name, secret = %filename, "write failed post-write validation");
                    self.sync_state.remove(filename);
                }
            }
        }

        let stale: Vec<String> = self
            .sync_state
            .keys()
            .filter(|filename| !secrets.contains_key(*filename))
            .cloned()
            .collect();
        pending_deletions.extend(stale);

        for filename in pending_deletions {
            self.sync_state.remove(&filename);
            match self.output.remove(&filename) {
                Ok(()) => {
                    info!(client = %self.name, file = %filename, "removed deleted secret");
                    updated.deleted += 1;
                }
                // Never written in the first place still counts as gone.
                Err(AgentError::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {
                    updated.deleted += 1;
                }
                Err(err) => {
                    warn!(client = %self.name, file = %filename, %err, "removing secret");
                    errors.push(err);
                }
            }
        }

        // Sweep anything in the directory the catalog doesn't know about,
        // e.g. files left over from a crash.
        match self.output.cleanup(&secrets) {
            Ok(removed) => updated.deleted += removed,
            Err(err) => errors.push(err),
        }

        (updated, errors)
    }
}

/// Former clients whose directories are removed after the pass that
/// noticed them disappear.
#[derive(Default)]
pub struct PendingCleanup {
    pub outputs: HashMap<String, Box<dyn Output>>,
}

impl PendingCleanup {
    pub fn contains(&self, name: &str) -> bool {
        self.outputs.contains_key(name)
    }

    pub fn cleanup(self) -> Vec<AgentError> {
        let mut errors = Vec::new();
        for (name, output) in self.outputs {
            info!(client = %name, "removing directory of deconfigured client");
            if let Err(err) = output.remove_all() {
                warn!(client = %name, %err, "removing client directory");
                errors.push(err);
            }
        }
        errors
    }
}

struct SyncerInner {
    entries: HashMap<String, SyncerEntry>,
}

/// Owns every [`SyncerEntry`] and drives reconciliation, either as a
/// single pass or a jittered polling loop.
pub struct Syncer {
    config: Config,
    server: reqwest::Url,
    collection: OutputDirCollection,
    metrics: Arc<AgentMetrics>,
    poll_interval: Duration,
    reload_enabled: bool,
    inner: Mutex<SyncerInner>,
    last_success_at: StdMutex<Option<Instant>>,
    most_recent_error: StdRwLock<Option<String>>,
}

impl Syncer {
    /// Builds a syncer against the configured server.
    pub fn new(
        config: Config,
        lookup: Arc<dyn Lookup>,
        metrics: Arc<AgentMetrics>,
    ) -> AgentResult<Syncer> {
        let server = reqwest::Url::parse(&format!("https://{}", config.server))
            .map_err(|err| AgentError::Config(format!("parsing server {}: {err}", config.server)))?;
        let collection = Self::collection(&config, lookup);
        let poll_interval = Duration::from_secs(config.poll_interval_secs);

        Ok(Syncer {
            config,
            server,
            collection,
            metrics,
            poll_interval,
            reload_enabled: true,
            inner: Mutex::new(SyncerInner {
                entries: HashMap::new(),
            }),
            last_success_at: StdMutex::new(None),
            most_recent_error: StdRwLock::new(None),
        })
    }

    /// Builds a syncer whose entries all read from an offline bundle file
    /// instead of the network. Client reloading is disabled: the entry set
    /// is fixed at construction.
    pub fn with_bundle(
        config: Config,
        bundle: &Path,
        lookup: Arc<dyn Lookup>,
        metrics: Arc<AgentMetrics>,
    ) -> AgentResult<Syncer> {
        let server = reqwest::Url::parse(&format!("https://{}", config.server))
            .map_err(|err| AgentError::Config(format!("parsing server {}: {err}", config.server)))?;
        let collection = Self::collection(&config, lookup);
        let poll_interval = Duration::from_secs(config.poll_interval_secs);

        let bundle_client = BundleClient::from_file(bundle)?;
        let mut entries = HashMap::new();
        for (name, client_config) in config.load_clients()? {
            let output = collection.new_output(&client_config)?;
            entries.insert(
                name.clone(),
                SyncerEntry::new(
                    name,
                    SecretSource::Bundle(bundle_client.clone()),
                    client_config,
                    Box::new(output),
                ),
            );
        }

        Ok(Syncer {
            config,
            server,
            collection,
            metrics,
            poll_interval,
            reload_enabled: false,
            inner: Mutex::new(SyncerInner { entries }),
            last_success_at: StdMutex::new(None),
            most_recent_error: StdRwLock::new(None),
        })
    }

    fn collection(config: &Config, lookup: Arc<dyn Lookup>) -> OutputDirCollection {
        OutputDirCollection::new(
            config.secrets_dir.clone(),
            config.default_user.clone(),
            config.default_group.clone(),
            config.filesystem_type,
            config.chown_files,
            lookup,
        )
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn metrics(&self) -> &AgentMetrics {
        &self.metrics
    }

    /// Time since the last pass that finished without any error, or None
    /// if none has yet.
    pub fn time_since_last_success(&self) -> Option<Duration> {
        self.last_success_at
            .lock()
            .expect("health lock poisoned")
            .map(|at| at.elapsed())
    }

    /// The most recent pass's error, if it had one.
    pub fn most_recent_error(&self) -> Option<String> {
        self.most_recent_error
            .read()
            .expect("health lock poisoned")
            .clone()
    }

    /// Brings the entry registry up to date with the configured clients.
    ///
    /// An entry whose config is identical to the previous pass is kept,
    /// and its client reloads certificates from disk. A changed config
    /// rebuilds the entry from scratch. Entries whose config disappeared
    /// are handed back for cleanup after the pass.
    async fn load_clients(&self, inner: &mut SyncerInner) -> AgentResult<PendingCleanup> {
        let configs = self.config.load_clients()?;

        for (name, client_config) in &configs {
            if let Some(entry) = inner.entries.get(name) {
                if &entry.config == client_config {
                    if let Err(err) = entry.client.rebuild().await {
                        warn!(client = %name, %err, "reloading client certificates");
                    }
                    continue;
                }
            }
            match self.build_entry(name, client_config.clone()) {
                Ok(entry) => {
                    inner.entries.insert(name.clone(), entry);
                }
                Err(err) => {
                    error!(client = %name, %err, "building client");
                }
            }
        }

        let gone: Vec<String> = inner
            .entries
            .keys()
            .filter(|name| !configs.contains_key(*name))
            .cloned()
            .collect();
        let mut pending = PendingCleanup::default();
        for name in gone {
            if let Some(entry) = inner.entries.remove(&name) {
                warn!(client = %name, "client configuration gone, queueing cleanup");
                pending.outputs.insert(name, entry.output);
            }
        }

        Ok(pending)
    }

    fn build_entry(&self, name: &str, config: ClientConfig) -> AgentResult<SyncerEntry> {
        let client = HttpsClient::new(
            &config,
            self.config.ca_file.clone(),
            &self.server,
            Arc::clone(&self.metrics),
        )?;
        let output = self.collection.new_output(&config)?;
        Ok(SyncerEntry::new(
            name.to_string(),
            SecretSource::Https(client),
            config,
            Box::new(output),
        ))
    }

    /// One full reconciliation pass over every client, serialized with
    /// all other reconciliation.
    pub async fn run_once(&self) -> (Updated, Vec<AgentError>) {
        let mut inner = self.inner.lock().await;
        let mut updated = Updated::default();
        let mut errors = Vec::new();

        let pending = if self.reload_enabled {
            match self.load_clients(&mut inner).await {
                Ok(pending) => Some(pending),
                Err(err) => {
                    error!(%err, "loading clients");
                    errors.push(err);
                    drop(inner);
                    self.finish_pass(&errors);
                    return (updated, errors);
                }
            }
        } else {
            None
        };

        for (name, entry) in inner.entries.iter_mut() {
            let (entry_updated, entry_errors) = entry.sync().await;
            updated.merge(entry_updated);
            for err in entry_errors {
                error!(client = %name, %err, "syncing");
                errors.push(err);
            }
        }

        if let Some(pending) = pending {
            errors.extend(pending.cleanup());

            let known: HashSet<String> = inner
                .entries
                .values()
                .map(|entry| entry.config.dir_name.clone())
                .collect();
            let (_, sweep_errors) = self.collection.cleanup(&known);
            errors.extend(sweep_errors);
        }

        drop(inner);

        info!(
            added = updated.added,
            changed = updated.changed,
            deleted = updated.deleted,
            errors = errors.len(),
            "sync pass complete"
        );
        self.finish_pass(&errors);
        (updated, errors)
    }

    /// Syncs a single client by name, loading configs first so a freshly
    /// added client is visible immediately. Pending cleanup from removed
    /// clients still runs.
    pub async fn sync_one(&self, name: &str) -> AgentResult<Updated> {
        let mut inner = self.inner.lock().await;

        let pending = if self.reload_enabled {
            self.load_clients(&mut inner).await?
        } else {
            PendingCleanup::default()
        };

        let result = match inner.entries.get_mut(name) {
            Some(entry) => {
                let (updated, mut errors) = entry.sync().await;
                match errors.pop() {
                    Some(err) => Err(err),
                    None => Ok(updated),
                }
            }
            None if pending.contains(name) => Ok(Updated::default()),
            None => Err(AgentError::UnknownClient(name.to_string())),
        };

        pending.cleanup();
        result
    }

    /// The main loop: run a pass, then sleep the poll interval plus an
    /// upward jitter of as much as a quarter of it. With no poll interval
    /// configured, a single pass runs and its first error propagates.
    pub async fn run(&self) -> AgentResult<()> {
        if self.poll_interval.is_zero() {
            let (_, errors) = self.run_once().await;
            return match errors.into_iter().next() {
                Some(err) => Err(err),
                None => Ok(()),
            };
        }

        loop {
            let (_, errors) = self.run_once().await;
            if !errors.is_empty() {
                error!(count = errors.len(), "sync pass had errors");
            }
            tokio::time::sleep(randomize(self.poll_interval)).await;
        }
    }

    fn finish_pass(&self, errors: &[AgentError]) {
        if errors.is_empty() {
            *self.last_success_at.lock().expect("health lock poisoned") = Some(Instant::now());
        }
        *self
            .most_recent_error
            .write()
            .expect("health lock poisoned") = errors.last().map(|err| err.to_string());
    }
}

/// The poll interval plus up to a quarter of it, so a fleet of agents
/// spreads out instead of thundering in lockstep.
fn randomize(interval: Duration) -> Duration {
    let max_added = interval.as_secs_f64() / 4.0;
    let added = rand::thread_rng().gen::<f64>() * max_added;
    interval + Duration::from_secs_f64(added)
}
