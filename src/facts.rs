//! Typed knowledge about a target: enumerated facts, recorded tampers and
//! installed implants. These are the rows cached per session and persisted
//! in the target store.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How often a fact should be re-enumerated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Schedule {
    /// Enumerate once per host, cache forever.
    Once,
    /// Enumerate once per (host, user) pair.
    PerUser,
    /// Never cache.
    Always,
}

/// A single piece of enumerated knowledge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fact {
    /// Dotted name of the module which produced this fact.
    pub source_module: String,
    /// Type tag used for lookup, e.g. `system.distro`.
    pub type_tag: String,
    /// Opaque payload addressable by a schema per type tag.
    pub data: serde_json::Value,
    pub schedule: Schedule,
    /// User the fact was enumerated as; relevant for `PerUser` facts.
    pub user: Option<String>,
    pub collected_at: DateTime<Utc>,
}

impl Fact {
    pub fn new(source_module: &str, type_tag: &str, data: serde_json::Value) -> Fact {
        Fact {
            source_module: source_module.to_string(),
            type_tag: type_tag.to_string(),
            data,
            schedule: Schedule::Once,
            user: None,
            collected_at: Utc::now(),
        }
    }

    /// Cache key within a host: type tag plus the schedule-relevant part.
    pub fn cache_key(&self) -> String {
        match self.schedule {
            Schedule::Once => self.type_tag.clone(),
            Schedule::PerUser => format!(
                "{}:{}",
                self.type_tag,
                self.user.as_deref().unwrap_or("")
            ),
            Schedule::Always => format!("{}:{}", self.type_tag, self.collected_at.timestamp()),
        }
    }
}

/// A recorded modification of remote state, with enough information to
/// undo it later.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tamper {
    pub description: String,
    /// Shell command (or stage-two call description) undoing the change.
    pub revert_action: Option<String>,
    /// User the change was made as; reverting may require the same
    /// principal.
    pub principal_user: String,
    pub reversible: bool,
    pub created_at: DateTime<Utc>,
}

impl Tamper {
    pub fn new(description: &str, revert_action: Option<String>, principal_user: &str) -> Tamper {
        Tamper {
            description: description.to_string(),
            reversible: revert_action.is_some(),
            revert_action,
            principal_user: principal_user.to_string(),
            created_at: Utc::now(),
        }
    }
}

/// What an implant is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImplantKind {
    /// Escalate locally from an unprivileged session.
    LocalEscalate,
    /// Re-establish a session from outside, e.g. an authorized SSH key.
    RemoteReconnect,
    /// Replaces an existing credentialed access path.
    Replacement,
}

/// A persistent remote modification enabling reconnect or escalation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Implant {
    /// Module that installed (and can remove) the implant.
    pub module_name: String,
    pub kind: ImplantKind,
    /// The user the implant authenticates or escalates to.
    pub user: String,
    /// Module-specific parameters, e.g. the private key path for an
    /// authorized_key implant.
    pub params: HashMap<String, String>,
    pub installed_at: DateTime<Utc>,
}

/// A user account on the target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// UID on Linux, SID on Windows; kept as a string for uniformity.
    pub id: String,
    pub name: String,
    pub group_id: Option<String>,
    pub home: Option<String>,
    pub shell: Option<String>,
}

/// A group on the target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub id: String,
    pub name: String,
    pub members: Vec<String>,
}
