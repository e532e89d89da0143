//! User and group name resolution.
//!
//! Secrets carry owner/group *names*; the filesystem wants numeric ids.
//! Resolution never fails outright: a name that cannot be resolved falls
//! back to the configured default, and the default falls back to root.
//! Root can read everything it might need to, and never under-authorizes.

use crate::error::{OutputError, OutputResult};
use tracing::error;

/// Where to look up users and groups.
///
/// The OS implementation goes through the platform user database; tests
/// use [`MockLookup`] with fixed data.
pub trait Lookup: Send + Sync {
    fn uid(&self, username: &str) -> OutputResult<u32>;
    fn gid(&self, groupname: &str) -> OutputResult<u32>;
}

/// [`Lookup`] backed by the platform's passwd and group databases.
#[derive(Clone, Copy, Debug, Default)]
pub struct OsLookup;

impl Lookup for OsLookup {
    fn uid(&self, username: &str) -> OutputResult<u32> {
        let user = nix::unistd::User::from_name(username)
            .map_err(std::io::Error::from)?
            .ok_or_else(|| OutputError::UnknownUser(username.to_string()))?;
        Ok(user.uid.as_raw())
    }

    fn gid(&self, groupname: &str) -> OutputResult<u32> {
        let group = nix::unistd::Group::from_name(groupname)
            .map_err(std::io::Error::from)?
            .ok_or_else(|| OutputError::UnknownGroup(groupname.to_string()))?;
        Ok(group.gid.as_raw())
    }
}

/// [`Lookup`] with fixed name→id maps, for tests.
#[derive(Clone, Debug, Default)]
pub struct MockLookup {
    pub users: std::collections::HashMap<String, u32>,
    pub groups: std::collections::HashMap<String, u32>,
}

impl Lookup for MockLookup {
    fn uid(&self, username: &str) -> OutputResult<u32> {
        self.users
            .get(username)
            .copied()
            .ok_or_else(|| OutputError::UnknownUser(username.to_string()))
    }

    fn gid(&self, groupname: &str) -> OutputResult<u32> {
        self.groups
            .get(groupname)
            .copied()
            .ok_or_else(|| OutputError::UnknownGroup(groupname.to_string()))
    }
}

/// Resolved numeric ownership of filesystem entries.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Ownership {
    pub uid: u32,
    pub gid: u32,
}

impl Ownership {
    /// Resolves ownership from names, trying the requested name first,
    /// then the fallback, then root.
    ///
    /// Every failed lookup is logged with the name that was attempted, but
    /// resolution always produces a usable result.
    pub fn resolve(
        username: &str,
        groupname: &str,
        fallback_user: &str,
        fallback_group: &str,
        lookup: &dyn Lookup,
    ) -> Ownership {
        let uid = resolve_side(username, fallback_user, "user", |name| lookup.uid(name));
        let gid = resolve_side(groupname, fallback_group, "group", |name| lookup.gid(name));
        Ownership { uid, gid }
    }
}

fn resolve_side<F>(name: &str, fallback: &str, kind: &str, lookup: F) -> u32
where
    F: Fn(&str) -> OutputResult<u32>,
{
    if !name.is_empty() {
        match lookup(name) {
            Ok(id) => return id,
            Err(err) => {
                error!(%kind, %name, %err, "lookup failed, trying fallback");
            }
        }
    }
    if !fallback.is_empty() {
        match lookup(fallback) {
            Ok(id) => return id,
            Err(err) => {
                error!(%kind, name = %fallback, %err, "fallback lookup failed, using 0");
            }
        }
    }
    0
}
