//! The persisted target store.
//!
//! Everything learned about a host that must survive the session lives
//! here: facts, implants, tampers and credential discoveries, keyed by the
//! stable `host_id`. The store is a single MessagePack file guarded by a
//! lock file so two managers cannot corrupt it concurrently.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use redcat_internal::error::Error;
use serde::{Deserialize, Serialize};

use crate::facts::{Fact, Implant, Tamper};
use crate::platform::PlatformKind;

/// A credential discovered for a user on a target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    pub user: String,
    pub password: Option<String>,
    /// Path to a local private key authenticating this user.
    pub key_path: Option<String>,
}

/// Everything persisted about one host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    pub host_id: String,
    pub platform: Option<PlatformKind>,
    /// `host:port` of the most recent connection.
    pub last_address: Option<String>,
    pub facts: Vec<Fact>,
    pub implants: Vec<Implant>,
    pub tampers: Vec<Tamper>,
    pub credentials: Vec<Credential>,
}

impl Target {
    fn new(host_id: &str) -> Target {
        Target {
            host_id: host_id.to_string(),
            platform: None,
            last_address: None,
            facts: Vec::new(),
            implants: Vec::new(),
            tampers: Vec::new(),
            credentials: Vec::new(),
        }
    }

    /// Record a fact, replacing any cached entry with the same cache key.
    pub fn record_fact(&mut self, fact: Fact) {
        let key = fact.cache_key();
        self.facts.retain(|f| f.cache_key() != key);
        self.facts.push(fact);
    }

    /// Record an implant, replacing any previous row for the same module,
    /// user and kind. Sessions flush their accumulated state repeatedly,
    /// so this must be idempotent.
    pub fn record_implant(&mut self, implant: Implant) {
        self.implants.retain(|i| {
            i.module_name != implant.module_name
                || i.user != implant.user
                || i.kind != implant.kind
        });
        self.implants.push(implant);
    }

    /// Record a tamper, replacing a previous entry describing the same
    /// change by the same principal.
    pub fn record_tamper(&mut self, tamper: Tamper) {
        self.tampers.retain(|t| {
            t.description != tamper.description || t.principal_user != tamper.principal_user
        });
        self.tampers.push(tamper);
    }

    /// The credential to use for reconnecting as `user`, if any.
    pub fn credential_for(&self, user: &str) -> Option<&Credential> {
        self.credentials.iter().find(|c| c.user == user)
    }

    /// The first implant enabling remote reconnect, if any.
    pub fn reconnect_implant(&self) -> Option<&Implant> {
        self.implants
            .iter()
            .find(|i| i.kind == crate::facts::ImplantKind::RemoteReconnect)
    }
}

/// Host-id-keyed store backed by a MessagePack file plus a lock file.
pub struct TargetStore {
    path: PathBuf,
    lock_path: PathBuf,
    targets: HashMap<String, Target>,
}

impl TargetStore {
    /// Open the store under `data_dir`, taking the manager lock. Fails with
    /// `Busy` when another manager already holds it.
    pub fn open(data_dir: &Path) -> Result<TargetStore, Error> {
        std::fs::create_dir_all(data_dir)
            .map_err(|e| Error::Platform(format!("{}: {}", data_dir.display(), e)))?;

        let path = data_dir.join("targets.db");
        let lock_path = data_dir.join("targets.lock");

        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_path)
        {
            Ok(mut lock) => {
                use std::io::Write;
                let _ = write!(lock, "{}", std::process::id());
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(Error::Busy(format!(
                    "{}: another manager holds the target store",
                    lock_path.display()
                )));
            }
            Err(e) => {
                return Err(Error::Platform(format!("{}: {}", lock_path.display(), e)));
            }
        }

        let targets = match std::fs::read(&path) {
            Ok(raw) => rmp_serde::from_slice(&raw).map_err(|e| {
                Error::Platform(format!("{}: corrupt target store: {}", path.display(), e))
            })?,
            Err(ref e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(Error::Platform(format!("{}: {}", path.display(), e))),
        };

        Ok(TargetStore {
            path,
            lock_path,
            targets,
        })
    }

    pub fn get(&self, host_id: &str) -> Option<&Target> {
        self.targets.get(host_id)
    }

    /// Fetch or create the row for a host.
    pub fn upsert(&mut self, host_id: &str) -> &mut Target {
        self.targets
            .entry(host_id.to_string())
            .or_insert_with(|| Target::new(host_id))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Target> {
        self.targets.values()
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Write the store to disk atomically (write-then-rename).
    pub fn save(&self) -> Result<(), Error> {
        let encoded = rmp_serde::to_vec(&self.targets)
            .map_err(|e| Error::Platform(format!("target store encode: {}", e)))?;

        let staging = self.path.with_extension("db.tmp");
        std::fs::write(&staging, &encoded)
            .map_err(|e| Error::Platform(format!("{}: {}", staging.display(), e)))?;
        std::fs::rename(&staging, &self.path)
            .map_err(|e| Error::Platform(format!("{}: {}", self.path.display(), e)))?;
        Ok(())
    }
}

impl Drop for TargetStore {
    fn drop(&mut self) {
        if let Err(err) = self.save() {
            log::warn!("failed to persist target store: {}", err);
        }
        let _ = std::fs::remove_file(&self.lock_path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::facts::{Fact, Implant, ImplantKind, Schedule};
    use serde_json::json;

    #[test]
    fn rows_round_trip_through_the_store() {
        let dir = tempfile::tempdir().unwrap();

        {
            let mut store = TargetStore::open(dir.path()).unwrap();
            let target = store.upsert("ab8b7df2a1f83fa6694b0315aaf1deec");
            target.platform = Some(PlatformKind::Linux);
            target.last_address = Some("10.0.0.5:4444".into());
            target.implants.push(Implant {
                module_name: "implant.authorized_key".into(),
                kind: ImplantKind::RemoteReconnect,
                user: "caleb".into(),
                params: [("key".to_string(), "/tmp/key".to_string())].into(),
                installed_at: chrono::Utc::now(),
            });
            target.credentials.push(Credential {
                user: "caleb".into(),
                password: None,
                key_path: Some("/tmp/key".into()),
            });
            store.save().unwrap();
        }

        let store = TargetStore::open(dir.path()).unwrap();
        let target = store.get("ab8b7df2a1f83fa6694b0315aaf1deec").unwrap();
        assert_eq!(target.platform, Some(PlatformKind::Linux));
        assert_eq!(target.last_address.as_deref(), Some("10.0.0.5:4444"));

        let implant = target.reconnect_implant().unwrap();
        assert_eq!(implant.user, "caleb");
        assert_eq!(target.credential_for("caleb").unwrap().key_path.as_deref(), Some("/tmp/key"));
    }

    #[test]
    fn lock_file_prevents_concurrent_managers() {
        let dir = tempfile::tempdir().unwrap();
        let store = TargetStore::open(dir.path()).unwrap();

        match TargetStore::open(dir.path()) {
            Err(Error::Busy(_)) => {}
            other => panic!("expected Busy, got {:?}", other.map(|_| ())),
        }

        // releasing the first store frees the lock
        drop(store);
        TargetStore::open(dir.path()).unwrap();
    }

    #[test]
    fn repeated_flushes_do_not_duplicate_implants_or_tampers() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = TargetStore::open(dir.path()).unwrap();
        let target = store.upsert("deadbeefdeadbeefdeadbeefdeadbeef");

        let implant = Implant {
            module_name: "implant.authorized_key".into(),
            kind: ImplantKind::RemoteReconnect,
            user: "caleb".into(),
            params: [("key".to_string(), "/tmp/key".to_string())].into(),
            installed_at: chrono::Utc::now(),
        };
        let tamper = crate::facts::Tamper::new(
            "appended key to /home/caleb/.ssh/authorized_keys",
            Some("sed -i '$d' /home/caleb/.ssh/authorized_keys".into()),
            "caleb",
        );

        // a session flushes its full accumulated state after every module
        // run and again at close; the row must not grow
        for _ in 0..3 {
            target.record_implant(implant.clone());
            target.record_tamper(tamper.clone());
        }
        assert_eq!(target.implants.len(), 1);
        assert_eq!(target.tampers.len(), 1);

        // a different user's implant from the same module is a new row
        let mut other = implant.clone();
        other.user = "root".into();
        target.record_implant(other);
        assert_eq!(target.implants.len(), 2);
    }

    #[test]
    fn facts_replace_by_cache_key() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = TargetStore::open(dir.path()).unwrap();
        let target = store.upsert("deadbeefdeadbeefdeadbeefdeadbeef");

        let mut fact = Fact::new("enumerate.uname", "system.kernel", json!("6.1.0"));
        fact.schedule = Schedule::Once;
        target.record_fact(fact.clone());

        fact.data = json!("6.2.0");
        target.record_fact(fact);

        assert_eq!(target.facts.len(), 1);
        assert_eq!(target.facts[0].data, json!("6.2.0"));
    }
}
