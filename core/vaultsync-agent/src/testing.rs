//! In-memory fakes shared across unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};

use sha2::{Digest, Sha256};

use vaultsync_output::FileInfo;

use crate::error::{AgentError, AgentResult};
use crate::output::{Output, SecretState};
use crate::secret::{Secret, SecretContent};

pub fn secret(name: &str, content: &[u8], checksum: &str) -> Secret {
    Secret {
        name: name.to_string(),
        content: SecretContent(content.to_vec()),
        checksum: checksum.to_string(),
        ..Secret::default()
    }
}

#[derive(Default)]
struct MockState {
    secrets: HashMap<String, Secret>,
    deleted: HashSet<String>,
    failing_gets: HashSet<String>,
    fail_listing: bool,
}

/// Scriptable secrets source.
#[derive(Clone, Default)]
pub struct MockClient {
    state: Arc<StdMutex<MockState>>,
}

impl MockClient {
    pub fn new(secrets: Vec<Secret>) -> MockClient {
        let client = MockClient::default();
        client.set_secrets(secrets);
        client
    }

    pub fn set_secrets(&self, secrets: Vec<Secret>) {
        let indexed = secrets
            .into_iter()
            .map(|secret| (secret.filename().expect("test secret").to_string(), secret))
            .collect();
        self.state.lock().unwrap().secrets = indexed;
    }

    /// Makes `get` of this name 404, as if deleted between list and get.
    pub fn mark_deleted(&self, name: &str) {
        self.state.lock().unwrap().deleted.insert(name.to_string());
    }

    pub fn fail_get(&self, name: &str) {
        self.state
            .lock()
            .unwrap()
            .failing_gets
            .insert(name.to_string());
    }

    pub fn fail_listing(&self) {
        self.state.lock().unwrap().fail_listing = true;
    }

    pub fn list(&self) -> AgentResult<HashMap<String, Secret>> {
        let state = self.state.lock().unwrap();
        if state.fail_listing {
            return Err(AgentError::Server {
                status: 500,
                message: "scripted listing failure".to_string(),
            });
        }
        Ok(state.secrets.clone())
    }

    pub fn get(&self, name: &str) -> AgentResult<Secret> {
        let state = self.state.lock().unwrap();
        if state.deleted.contains(name) {
            return Err(AgentError::SecretDeleted);
        }
        if state.failing_gets.contains(name) {
            return Err(AgentError::Server {
                status: 500,
                message: "scripted fetch failure".to_string(),
            });
        }
        state
            .secrets
            .values()
            .find(|secret| secret.name == name)
            .cloned()
            .ok_or_else(|| AgentError::NotFound(name.to_string()))
    }
}

struct StoredFile {
    content: Vec<u8>,
    state: SecretState,
    writes: usize,
}

/// [`Output`] kept entirely in memory.
#[derive(Clone, Default)]
pub struct InMemoryOutput {
    files: Arc<StdMutex<HashMap<String, StoredFile>>>,
}

impl InMemoryOutput {
    pub fn content(&self, name: &str) -> Option<Vec<u8>> {
        self.files
            .lock()
            .unwrap()
            .get(name)
            .map(|file| file.content.clone())
    }

    pub fn write_count(&self, name: &str) -> usize {
        self.files
            .lock()
            .unwrap()
            .get(name)
            .map(|file| file.writes)
            .unwrap_or(0)
    }

    /// Inserts a file behind the engine's back, as if left by a crash.
    pub fn plant(&self, name: &str, content: &[u8]) {
        self.files.lock().unwrap().insert(
            name.to_string(),
            StoredFile {
                content: content.to_vec(),
                state: SecretState {
                    content_hash: Sha256::digest(content).into(),
                    checksum: String::new(),
                    file_info: FileInfo::default(),
                    owner: String::new(),
                    group: String::new(),
                    mode: String::new(),
                },
                writes: 0,
            },
        );
    }
}

impl Output for InMemoryOutput {
    fn validate(&self, secret: &Secret, state: &SecretState) -> bool {
        if state.checksum != secret.checksum {
            return false;
        }
        if state.owner != secret.owner || state.group != secret.group || state.mode != secret.mode {
            return false;
        }
        let files = self.files.lock().unwrap();
        let filename = match secret.filename() {
            Ok(filename) => filename,
            Err(_) => return false,
        };
        files
            .get(filename)
            .is_some_and(|stored| &stored.state == state)
    }

    fn write(&self, secret: &Secret) -> AgentResult<SecretState> {
        let filename = secret.filename()?.to_string();
        let mode = secret.mode_value()?;
        let state = SecretState {
            content_hash: Sha256::digest(&secret.content.0).into(),
            checksum: secret.checksum.clone(),
            file_info: FileInfo { mode, uid: 0, gid: 0 },
            owner: secret.owner.clone(),
            group: secret.group.clone(),
            mode: secret.mode.clone(),
        };
        let mut files = self.files.lock().unwrap();
        let writes = files.get(&filename).map(|file| file.writes).unwrap_or(0) + 1;
        files.insert(
            filename,
            StoredFile {
                content: secret.content.0.clone(),
                state: state.clone(),
                writes,
            },
        );
        Ok(state)
    }

    fn remove(&self, name: &str) -> AgentResult<()> {
        match self.files.lock().unwrap().remove(name) {
            Some(_) => Ok(()),
            None => Err(AgentError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no such file: {name}"),
            ))),
        }
    }

    fn remove_all(&self) -> AgentResult<()> {
        self.files.lock().unwrap().clear();
        Ok(())
    }

    fn cleanup(&self, known: &HashMap<String, Secret>) -> AgentResult<usize> {
        let mut files = self.files.lock().unwrap();
        let before = files.len();
        files.retain(|name, _| known.contains_key(name));
        Ok(before - files.len())
    }
}
