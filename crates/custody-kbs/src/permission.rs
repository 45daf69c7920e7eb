//! Caller authorization
//!
//! Callers are identified by the peer credentials of their socket. Grants
//! bind an entity (a uid, a gid, or anyone) to a key set pattern with an
//! access level. `retrieve` implies `operate`.

use std::fmt;
use std::str::FromStr;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::{BrokerError, Result};

/// What a request wants to do with a key set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    /// Use the key through the engine
    Operate,
    /// Read the key material itself
    Retrieve,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Operate => write!(f, "operate"),
            Action::Retrieve => write!(f, "retrieve"),
        }
    }
}

/// Access level granted on a key set. Ordered: `Retrieve` covers `Operate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Operate,
    Retrieve,
}

impl Capability {
    pub fn permits(self, action: Action) -> bool {
        match action {
            Action::Operate => true,
            Action::Retrieve => self == Capability::Retrieve,
        }
    }
}

/// Authenticated peer of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallerIdentity {
    pub uid: u32,
    pub gid: u32,
    pub pid: Option<i32>,
}

impl fmt::Display for CallerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.pid {
            Some(pid) => write!(f, "uid={} gid={} pid={}", self.uid, self.gid, pid),
            None => write!(f, "uid={} gid={}", self.uid, self.gid),
        }
    }
}

/// Who a grant applies to. Written as `*`, `user:<uid>` or `group:<gid>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Entity {
    Any,
    User(u32),
    Group(u32),
}

impl Entity {
    pub fn matches(&self, caller: &CallerIdentity) -> bool {
        match self {
            Entity::Any => true,
            Entity::User(uid) => *uid == caller.uid,
            Entity::Group(gid) => *gid == caller.gid,
        }
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Entity::Any => write!(f, "*"),
            Entity::User(uid) => write!(f, "user:{}", uid),
            Entity::Group(gid) => write!(f, "group:{}", gid),
        }
    }
}

impl FromStr for Entity {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self> {
        let parse_id = |raw: &str| {
            raw.trim()
                .parse::<u32>()
                .map_err(|_| BrokerError::Config(format!("invalid entity id in {:?}", s)))
        };

        match s.trim().split_once(':') {
            None if s.trim() == "*" => Ok(Entity::Any),
            Some(("user", id)) => Ok(Entity::User(parse_id(id)?)),
            Some(("group", id)) => Ok(Entity::Group(parse_id(id)?)),
            _ => Err(BrokerError::Config(format!(
                "invalid entity {:?}, expected \"*\", \"user:<uid>\" or \"group:<gid>\"",
                s
            ))),
        }
    }
}

impl TryFrom<String> for Entity {
    type Error = BrokerError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Entity> for String {
    fn from(entity: Entity) -> Self {
        entity.to_string()
    }
}

/// One permission entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grant {
    pub entity: Entity,
    /// Exact set name, or a prefix ending in `*`
    pub set: String,
    pub access: Capability,
}

impl Grant {
    pub fn new(entity: Entity, set: impl Into<String>, access: Capability) -> Self {
        Self {
            entity,
            set: set.into(),
            access,
        }
    }

    pub fn covers_set(&self, set: &str) -> bool {
        match self.set.strip_suffix('*') {
            Some(prefix) => set.starts_with(prefix),
            None => self.set == set,
        }
    }

    pub fn applies(&self, caller: &CallerIdentity, set: &str) -> bool {
        self.entity.matches(caller) && self.covers_set(set)
    }

    pub fn validate(&self) -> Result<()> {
        let stars = self.set.matches('*').count();
        if self.set.is_empty() || stars > 1 || (stars == 1 && !self.set.ends_with('*')) {
            return Err(BrokerError::Config(format!(
                "invalid set pattern {:?}: use an exact name or a trailing '*'",
                self.set
            )));
        }
        Ok(())
    }
}

/// Decides what a caller may do with a key set.
///
/// Consulted before any key store access.
pub trait PermissionGate: Send + Sync {
    /// Highest capability `caller` holds on `set`
    fn capability(&self, caller: &CallerIdentity, set: &str) -> Option<Capability>;

    fn authorize(&self, caller: &CallerIdentity, set: &str, action: Action) -> Result<Capability> {
        match self.capability(caller, set) {
            Some(capability) if capability.permits(action) => Ok(capability),
            _ => Err(BrokerError::Denied(format!(
                "{} may not {} key set {}",
                caller, action, set
            ))),
        }
    }
}

/// Gate evaluating a static list of grants
#[derive(Debug, Clone, Default)]
pub struct PolicyGate {
    grants: Vec<Grant>,
}

impl PolicyGate {
    pub fn new(grants: Vec<Grant>) -> Self {
        Self { grants }
    }

    pub fn grants(&self) -> &[Grant] {
        &self.grants
    }
}

impl PermissionGate for PolicyGate {
    fn capability(&self, caller: &CallerIdentity, set: &str) -> Option<Capability> {
        let capability = self
            .grants
            .iter()
            .filter(|g| g.applies(caller, set))
            .map(|g| g.access)
            .max();
        debug!("capability of {} on {}: {:?}", caller, set, capability);
        capability
    }
}
