//! Offline secrets source backed by a backup bundle JSON file.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::error::{AgentError, AgentResult};
use crate::secret::{index_by_filename, parse_secret_list, Secret};

/// A secrets source that reads a JSON list of secrets once at
/// construction, for restoring without contacting the server.
#[derive(Clone, Debug)]
pub struct BundleClient {
    secrets: HashMap<String, Secret>,
}

impl BundleClient {
    /// Parses a bundle file: a JSON array of secrets, indexed by derived
    /// filename. Duplicate filenames fail construction.
    pub fn from_file(path: &Path) -> AgentResult<BundleClient> {
        let data = fs::read(path)?;
        Self::from_slice(&data)
    }

    pub fn from_slice(data: &[u8]) -> AgentResult<BundleClient> {
        let parsed = parse_secret_list(data)?;
        Ok(BundleClient {
            secrets: index_by_filename(parsed)?,
        })
    }

    pub fn list(&self) -> AgentResult<HashMap<String, Secret>> {
        Ok(self.secrets.clone())
    }

    /// Looks up by filename key, falling back to the server name for
    /// secrets whose filename override differs from their name.
    pub fn get(&self, name: &str) -> AgentResult<Secret> {
        if let Some(secret) = self.secrets.get(name) {
            return Ok(secret.clone());
        }
        self.secrets
            .values()
            .find(|secret| secret.name == name)
            .cloned()
            .ok_or_else(|| AgentError::NotFound(name.to_string()))
    }
}
