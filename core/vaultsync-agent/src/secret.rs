//! The secret record as the server describes it.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use vaultsync_output::{Lookup, Ownership};

use crate::error::{AgentError, AgentResult};

/// A secret returned by the server, either as a catalog entry (content
/// absent) or as a full fetch.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Secret {
    #[serde(default, alias = "Name")]
    pub name: String,

    #[serde(default, rename = "secret")]
    pub content: SecretContent,

    #[serde(default, rename = "secretLength")]
    pub length: u64,

    /// Opaque server identifier for the current content; the sole
    /// equality key between server state and what was written.
    #[serde(default, alias = "Checksum")]
    pub checksum: String,

    #[serde(default, rename = "creationDate")]
    pub created_at: Option<DateTime<Utc>>,

    #[serde(default, rename = "updateDate")]
    pub updated_at: Option<DateTime<Utc>>,

    /// Server-chosen display filename; replaces `name` on disk when set.
    #[serde(default, rename = "filename")]
    pub filename_override: Option<String>,

    /// Octal mode string, e.g. "0440". Empty means the default.
    #[serde(default, alias = "Mode", rename = "mode")]
    pub mode: String,

    #[serde(default, alias = "Owner", rename = "owner")]
    pub owner: String,

    #[serde(default, alias = "Group", rename = "group")]
    pub group: String,
}

impl Secret {
    /// The on-disk filename for this secret: the filename override if the
    /// server set one, otherwise the name. A name containing a path
    /// separator is rejected so a maliciously-named secret can never
    /// write or delete outside its client directory.
    pub fn filename(&self) -> AgentResult<&str> {
        let name = self.filename_override.as_deref().unwrap_or(&self.name);
        if name.contains('/') {
            return Err(AgentError::UnsafeFilename(name.to_string()));
        }
        Ok(name)
    }

    /// The numeric file mode, defaulting to 0440. Only read bits may be
    /// set; anything else is silently stripped.
    pub fn mode_value(&self) -> AgentResult<u32> {
        let mode = if self.mode.is_empty() { "0440" } else { &self.mode };
        let parsed = u32::from_str_radix(mode, 8).map_err(|err| {
            AgentError::Parse(format!("unable to parse secret file mode ({mode}): {err}"))
        })?;
        Ok(parsed & 0o444)
    }

    /// Ownership for this secret: per-secret owner/group names when they
    /// resolve, otherwise the client default.
    pub fn ownership(&self, default: Ownership, lookup: &dyn Lookup) -> Ownership {
        let mut ownership = default;
        if !self.owner.is_empty() {
            if let Ok(uid) = lookup.uid(&self.owner) {
                ownership.uid = uid;
            }
        }
        if !self.group.is_empty() {
            if let Ok(gid) = lookup.gid(&self.group) {
                ownership.gid = gid;
            }
        }
        ownership
    }
}

/// Secret payload bytes, base64 on the wire.
///
/// The server may omit padding; it is restored before decoding.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct SecretContent(pub Vec<u8>);

impl fmt::Debug for SecretContent {
    // Never expose payload bytes through Debug formatting.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretContent({} bytes)", self.0.len())
    }
}

impl Serialize for SecretContent {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use base64::engine::general_purpose::STANDARD;
        use base64::Engine as _;
        serializer.serialize_str(&STANDARD.encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for SecretContent {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        use base64::engine::general_purpose::STANDARD;
        use base64::Engine as _;

        let mut encoded = String::deserialize(deserializer)?;
        let trailing = encoded.len() % 4;
        if trailing != 0 {
            encoded.extend(std::iter::repeat('=').take(4 - trailing));
        }
        let decoded = STANDARD
            .decode(&encoded)
            .map_err(|err| serde::de::Error::custom(format!("secret not valid base64: {err}")))?;
        Ok(SecretContent(decoded))
    }
}

/// Deserializes a single secret from server JSON.
pub fn parse_secret(data: &[u8]) -> AgentResult<Secret> {
    serde_json::from_slice(data)
        .map_err(|err| AgentError::Parse(format!("failed to deserialize secret: {err}")))
}

/// Deserializes a list of secrets from server JSON.
pub fn parse_secret_list(data: &[u8]) -> AgentResult<Vec<Secret>> {
    serde_json::from_slice(data)
        .map_err(|err| AgentError::Parse(format!("failed to deserialize secret list: {err}")))
}

/// Indexes secrets by derived filename.
///
/// A duplicate derived filename is a data inconsistency on the server,
/// and syncing stops until it is fixed there.
pub fn index_by_filename(secrets: Vec<Secret>) -> AgentResult<HashMap<String, Secret>> {
    let mut indexed: HashMap<String, Secret> = HashMap::with_capacity(secrets.len());
    for secret in secrets {
        let filename = secret.filename()?.to_string();
        match indexed.entry(filename) {
            std::collections::hash_map::Entry::Occupied(entry) => {
                return Err(AgentError::DuplicateFilename {
                    filename: entry.key().clone(),
                    first: entry.get().name.clone(),
                    second: secret.name,
                });
            }
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(secret);
            }
        }
    }
    Ok(indexed)
}
