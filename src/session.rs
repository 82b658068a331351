//! A session: one connected target.
//!
//! Couples a channel-backed platform driver with the per-target state that
//! accumulates while working the host: enumerated facts, recorded tampers,
//! installed implants, and the session log.

use redcat_internal::error::Error;

use crate::channel::Channel;
use crate::config::Config;
use crate::facts::{Fact, Implant, Tamper, User};
use crate::logging::SessionLog;
use crate::platform::{Platform, PlatformKind};

pub struct Session {
    /// Manager-assigned id; monotonic, never reused.
    pub id: u32,
    /// Stable identity of the host behind the channel.
    pub host_id: String,
    pub platform: Platform,
    pub log: SessionLog,
    /// User the session authenticated or landed as.
    pub username: String,
    /// Session-lifetime fact cache; flushed to the target store by the
    /// manager.
    pub facts: Vec<Fact>,
    pub implants: Vec<Implant>,
    pub tampers: Vec<Tamper>,
    users_cache: Option<Vec<User>>,
}

impl Session {
    /// Bring up a platform over the channel and snapshot the target
    /// identity. This blocks for the whole probe/bootstrap sequence.
    pub fn establish(
        id: u32,
        kind: PlatformKind,
        channel: Box<dyn Channel>,
        config: &Config,
    ) -> Result<Session, Error> {
        let address = format!("{}:{}", channel.host(), channel.port());
        let log = SessionLog::open(&config.data_path.join("logs"), id);
        log.log(&format!("establishing {} session with {}", kind, address));

        let mut platform = Platform::establish(kind, channel, config)?;
        let host_id = platform.host_id()?;
        let username = platform.whoami().unwrap_or_default();

        log.log(&format!(
            "session established: {}@{} (host id {})",
            username, address, host_id
        ));

        Ok(Session {
            id,
            host_id,
            platform,
            log,
            username,
            facts: Vec::new(),
            implants: Vec::new(),
            tampers: Vec::new(),
            users_cache: None,
        })
    }

    /// The target's user table, enumerated once per session.
    pub fn users(&mut self) -> Result<&[User], Error> {
        if self.users_cache.is_none() {
            self.users_cache = Some(self.platform.users()?);
        }
        // populated just above
        Ok(self.users_cache.as_deref().unwrap_or_default())
    }

    pub fn find_user(&mut self, name: &str) -> Result<Option<User>, Error> {
        Ok(self.users()?.iter().find(|u| u.name == name).cloned())
    }

    /// `host:port` of the underlying channel.
    pub fn address(&mut self) -> String {
        let chan = self.platform.channel_mut();
        format!("{}:{}", chan.host(), chan.port())
    }

    /// One-line description for session listings.
    pub fn summary(&mut self) -> String {
        let kind = self.platform.kind();
        let address = self.address();
        format!("{} {}@{} ({})", kind, self.username, address, self.host_id)
    }

    /// Cache a fact, replacing a previous one with the same cache key.
    pub fn record_fact(&mut self, fact: Fact) {
        let key = fact.cache_key();
        self.facts.retain(|f| f.cache_key() != key);
        self.facts.push(fact);
    }

    pub fn find_fact(&self, type_tag: &str) -> Option<&Fact> {
        self.facts.iter().find(|f| f.type_tag == type_tag)
    }

    pub fn record_tamper(&mut self, tamper: Tamper) {
        self.log.log(&format!("tamper: {}", tamper.description));
        self.tampers.push(tamper);
    }

    pub fn record_implant(&mut self, implant: Implant) {
        self.log
            .log(&format!("implant installed: {} for {}", implant.module_name, implant.user));
        self.implants.push(implant);
    }

    /// Tear the session down: ask the remote side to exit, close the
    /// channel and flush the log. Consumes the session.
    pub fn close(mut self) {
        self.log.log("closing session");
        if !self.platform.poisoned() {
            self.platform.exit();
        }
        self.platform.channel_mut().close();
        self.log.flush();
    }
}
