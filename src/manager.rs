//! The manager: session table, background listeners, and the two-state
//! interactive terminal loop.
//!
//! The loop runs in one of two states. In COMMAND state a local line
//! editor dispatches built-in commands and module runs. In RAW state the
//! keyboard is bound byte-for-byte to the current session's channel and
//! remote output streams to the local terminal; a single keystroke
//! (default EOT) switches back, and a prefix keystroke quotes the next
//! byte through to the remote. The pump is single-threaded and
//! cooperative: keyboard reads, channel reads and dispatch all interleave
//! through non-blocking reads.

use std::collections::{BTreeMap, HashMap};
use std::io::{BufRead, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use redcat_internal::error::{ChannelError, Error};

use crate::channel::{Channel, ChannelExt, ChannelSpec};
use crate::config::Config;
use crate::listener::{Listener, ListenerSpec, ListenerState};
use crate::modules::{run_module, Registry};
use crate::platform::{OutputEvent, PlatformKind};
use crate::session::Session;
use crate::target::TargetStore;
use crate::terminal::RawMode;

/// Set by the Ctrl-C handler; consumed by whatever framed execution or
/// command loop is currently running.
static INTERRUPT: AtomicBool = AtomicBool::new(false);

/// Request cancellation of the current foreground work. Installed as the
/// SIGINT handler by the CLI.
pub fn request_interrupt() {
    INTERRUPT.store(true, Ordering::SeqCst);
}

/// Consume a pending interrupt request.
pub fn take_interrupt() -> bool {
    INTERRUPT.swap(false, Ordering::SeqCst)
}

/// Route SIGINT to [`request_interrupt`] so Ctrl-C aborts the current
/// command instead of killing the manager. In raw mode Ctrl-C never raises
/// a signal (the local terminal is raw) and is forwarded as a byte.
pub fn install_interrupt_handler() {
    if let Err(err) = ctrlc::set_handler(request_interrupt) {
        log::warn!("Ctrl-C handler unavailable: {}", err);
    }
}

/// Monotonic session table. Ids are never reused within a manager's
/// lifetime, even when establishment fails after an id was reserved.
#[derive(Default)]
pub struct SessionTable {
    next_id: u32,
    sessions: BTreeMap<u32, Arc<Mutex<Session>>>,
    /// `(host_id, username)` per session, kept alongside so duplicate
    /// checks do not need to lock every session.
    identities: BTreeMap<u32, (String, String)>,
}

impl SessionTable {
    pub fn reserve_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn insert(&mut self, session: Session) -> u32 {
        let id = session.id;
        self.identities
            .insert(id, (session.host_id.clone(), session.username.clone()));
        self.sessions.insert(id, Arc::new(Mutex::new(session)));
        id
    }

    pub fn get(&self, id: u32) -> Option<Arc<Mutex<Session>>> {
        self.sessions.get(&id).cloned()
    }

    pub fn remove(&mut self, id: u32) -> Option<Arc<Mutex<Session>>> {
        self.identities.remove(&id);
        self.sessions.remove(&id)
    }

    pub fn ids(&self) -> Vec<u32> {
        self.sessions.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Whether a session with this host id and user already exists.
    pub fn has_identity(&self, host_id: &str, username: &str) -> bool {
        self.identities
            .values()
            .any(|(h, u)| h == host_id && u == username)
    }
}

/// Establish a session around a connected channel and insert it into the
/// table. Returns `Ok(None)` when the session was dropped as a duplicate.
pub fn bootstrap_session(
    table: &Arc<Mutex<SessionTable>>,
    store: &Arc<Mutex<TargetStore>>,
    config: &Config,
    kind: PlatformKind,
    channel: Box<dyn Channel>,
    drop_duplicate: bool,
) -> Result<Option<u32>, Error> {
    let id = table.lock().unwrap().reserve_id();
    let mut session = Session::establish(id, kind, channel, config)?;

    if drop_duplicate
        && table
            .lock()
            .unwrap()
            .has_identity(&session.host_id, &session.username)
    {
        log::info!(
            "dropping duplicate session for {}@{}",
            session.username,
            session.host_id
        );
        session.close();
        return Ok(None);
    }

    {
        let mut store = store.lock().unwrap();
        let address = session.address();
        let row = store.upsert(&session.host_id);
        row.platform = Some(kind);
        row.last_address = Some(address);
        if let Err(err) = store.save() {
            log::warn!("target store save failed: {}", err);
        }
    }

    Ok(Some(table.lock().unwrap().insert(session)))
}

/// What ended a raw pass-through.
enum RawOutcome {
    /// The user pressed the escape keystroke.
    Escaped,
    /// The remote interactive surface completed (Windows ConPTY exit).
    Completed,
    /// The channel died.
    Died,
}

pub struct Manager {
    pub config: Arc<Config>,
    table: Arc<Mutex<SessionTable>>,
    store: Arc<Mutex<TargetStore>>,
    pub registry: Registry,
    listeners: Vec<Listener>,
    next_listener_id: u32,
    current: Option<u32>,
}

impl Manager {
    /// Open the target store (taking the manager lock) and set up an empty
    /// session table.
    pub fn new(config: Config) -> Result<Manager, Error> {
        let store = TargetStore::open(&config.data_path)?;

        Ok(Manager {
            config: Arc::new(config),
            table: Arc::new(Mutex::new(SessionTable::default())),
            store: Arc::new(Mutex::new(store)),
            registry: Registry::with_builtins(),
            listeners: Vec::new(),
            next_listener_id: 0,
            current: None,
        })
    }

    /// Create a session from a channel spec (connect/bind/ssl/ssh). Blocks
    /// until the channel is connected and the platform established. The new
    /// session becomes current.
    pub fn create_session(&mut self, kind: PlatformKind, spec: &ChannelSpec) -> Result<u32, Error> {
        let channel = crate::channel::create(spec)?;
        let id = bootstrap_session(&self.table, &self.store, &self.config, kind, channel, false)?
            .ok_or_else(|| Error::Platform("bootstrap dropped a non-duplicate session".into()))?;
        self.current = Some(id);
        Ok(id)
    }

    /// Reconnect to a known target by host id, using a stored reconnect
    /// implant (e.g. an authorized SSH key).
    pub fn reconnect(&mut self, host_id: &str) -> Result<u32, Error> {
        let (address, user, key_path) = {
            let store = self.store.lock().unwrap();
            let target = store
                .get(host_id)
                .ok_or_else(|| Error::NotFound(format!("{}: unknown target", host_id)))?;

            let implant = target.reconnect_implant().ok_or_else(|| {
                Error::NotFound(format!("{}: no reconnect implant installed", host_id))
            })?;

            let key_path = implant
                .params
                .get("key")
                .cloned()
                .or_else(|| {
                    target
                        .credential_for(&implant.user)
                        .and_then(|c| c.key_path.clone())
                })
                .ok_or_else(|| {
                    Error::NotFound(format!("{}: implant has no key material", host_id))
                })?;

            let address = target
                .last_address
                .clone()
                .ok_or_else(|| Error::NotFound(format!("{}: no known address", host_id)))?;

            (address, implant.user.clone(), key_path)
        };

        let (host, _) = address
            .rsplit_once(':')
            .ok_or_else(|| Error::Platform(format!("{}: malformed stored address", address)))?;

        log::info!("reconnecting to {} as {} over ssh", host, user);
        let spec = ChannelSpec {
            protocol: Some(crate::channel::Protocol::Ssh),
            host: Some(host.to_string()),
            port: Some(22),
            user: Some(user),
            identity: Some(key_path),
            ..Default::default()
        };

        self.create_session(PlatformKind::Linux, &spec)
    }

    pub fn sessions(&self) -> Vec<(u32, String)> {
        let table = self.table.lock().unwrap();
        table
            .ids()
            .into_iter()
            .filter_map(|id| {
                let session = table.get(id)?;
                let summary = match session.try_lock() {
                    Ok(mut guard) => guard.summary(),
                    Err(_) => "(busy)".to_string(),
                };
                Some((id, summary))
            })
            .collect()
    }

    pub fn current(&self) -> Option<u32> {
        self.current
    }

    /// Switch the current session. The switch is atomic with respect to
    /// the interactive loop: it only happens between loop iterations.
    pub fn set_current(&mut self, id: u32) -> Result<(), Error> {
        if self.table.lock().unwrap().get(id).is_none() {
            return Err(Error::NotFound(format!("session {}", id)));
        }
        self.current = Some(id);
        Ok(())
    }

    /// Close a session: remote exit, channel close, log flush, table
    /// removal.
    pub fn close_session(&mut self, id: u32) -> Result<(), Error> {
        let session = self
            .table
            .lock()
            .unwrap()
            .remove(id)
            .ok_or_else(|| Error::NotFound(format!("session {}", id)))?;

        if self.current == Some(id) {
            self.current = None;
        }

        match Arc::try_unwrap(session) {
            Ok(mutex) => {
                if let Ok(session) = mutex.into_inner() {
                    self.flush_session_state(&session);
                    session.close();
                }
            }
            Err(_) => log::warn!("session {} still referenced; leaking channel", id),
        }
        Ok(())
    }

    /// Copy a session's accumulated facts/tampers/implants into the store.
    /// The session lists are flushed after every module run and again at
    /// close, so every record path dedups by its stable key.
    fn flush_session_state(&self, session: &Session) {
        let mut store = self.store.lock().unwrap();
        let row = store.upsert(&session.host_id);

        for fact in &session.facts {
            row.record_fact(fact.clone());
        }
        for implant in &session.implants {
            row.record_implant(implant.clone());
        }
        for tamper in &session.tampers {
            row.record_tamper(tamper.clone());
        }

        if let Err(err) = store.save() {
            log::warn!("target store save failed: {}", err);
        }
    }

    pub fn create_listener(&mut self, spec: ListenerSpec) -> Result<u32, Error> {
        let id = self.next_listener_id;
        self.next_listener_id += 1;

        let listener = Listener::start(
            id,
            spec,
            self.table.clone(),
            self.store.clone(),
            self.config.clone(),
        )?;
        self.listeners.push(listener);
        Ok(id)
    }

    pub fn listeners(&self) -> impl Iterator<Item = &Listener> {
        self.listeners.iter()
    }

    /// Promote a channel queued on a hint-less listener into a session.
    pub fn init_pending(
        &mut self,
        listener_id: u32,
        pending_ix: usize,
        kind: PlatformKind,
        drop_duplicate: bool,
    ) -> Result<Option<u32>, Error> {
        let listener = self
            .listeners
            .iter()
            .find(|l| l.id == listener_id)
            .ok_or_else(|| Error::NotFound(format!("listener {}", listener_id)))?;

        listener.init(
            pending_ix,
            kind,
            drop_duplicate,
            &self.table,
            &self.store,
            &self.config,
        )
    }

    pub fn stop_listener(&mut self, id: u32) -> Result<(), Error> {
        let ix = self
            .listeners
            .iter()
            .position(|l| l.id == id)
            .ok_or_else(|| Error::NotFound(format!("listener {}", id)))?;
        self.listeners.remove(ix); // Drop stops it
        Ok(())
    }

    /// Run a module against the current session and return the result
    /// titles.
    pub fn run_on_current(
        &mut self,
        module: &str,
        raw_args: &HashMap<String, String>,
    ) -> Result<Vec<String>, Error> {
        let id = self
            .current
            .ok_or_else(|| Error::NotFound("no current session".into()))?;
        let session = self
            .table
            .lock()
            .unwrap()
            .get(id)
            .ok_or_else(|| Error::NotFound(format!("session {}", id)))?;

        let mut guard = session.lock().unwrap();
        let results = run_module(&self.registry, module, &mut guard, raw_args)?;
        let titles = results.iter().map(|r| r.title()).collect();
        self.flush_session_state(&guard);
        Ok(titles)
    }

    /// Targets recorded in the persistent store, for `--list`.
    pub fn known_targets(&self) -> Vec<(String, Option<String>, usize)> {
        let store = self.store.lock().unwrap();
        store
            .iter()
            .map(|t| (t.host_id.clone(), t.last_address.clone(), t.implants.len()))
            .collect()
    }

    /// The interactive terminal loop; returns when the user exits.
    pub fn interactive(&mut self) {
        let stdin = std::io::stdin();

        loop {
            let _ = take_interrupt();

            print!("(local) redcat$ ");
            let _ = std::io::stdout().flush();

            let mut line = String::new();
            match stdin.lock().read_line(&mut line) {
                // EOF at the local prompt: bind the keyboard to the
                // current session
                Ok(0) => {
                    if self.current.is_some() {
                        println!();
                        self.enter_raw();
                        continue;
                    }
                    println!();
                    break;
                }
                Ok(_) => {}
                Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => {
                    println!();
                    continue;
                }
                Err(err) => {
                    log::error!("stdin: {}", err);
                    break;
                }
            }

            let line = line.trim().to_string();
            if line.is_empty() {
                continue;
            }
            if !self.dispatch(&line) {
                break;
            }
        }

        self.shutdown();
    }

    /// Handle one COMMAND-state line. Returns false to exit the loop.
    fn dispatch(&mut self, line: &str) -> bool {
        let mut words = line.split_whitespace();
        let verb = words.next().unwrap_or_default();
        let rest: Vec<&str> = words.collect();

        match verb {
            "exit" | "quit" => return false,
            "help" => self.cmd_help(),
            "sessions" => self.cmd_sessions(),
            "use" => self.cmd_use(&rest),
            "close" => self.cmd_close(&rest),
            "back" | "raw" => {
                if self.current.is_some() {
                    self.enter_raw();
                } else {
                    println!("error: no current session");
                }
            }
            "listen" => self.cmd_listen(&rest),
            "listeners" => self.cmd_listeners(),
            "search" => self.cmd_search(&rest),
            "run" => self.cmd_run(&rest),
            other => println!("error: {}: unknown command (try 'help')", other),
        }

        true
    }

    fn cmd_help(&self) {
        println!("sessions                list active sessions");
        println!("use <id>                select the current session");
        println!("back                    enter raw pass-through (also C-d at the prompt)");
        println!("close [<id>]            close a session");
        println!("listen <port> [opts]    start a background listener");
        println!("listeners               list listeners");
        println!("search <glob>           search modules");
        println!("run <module> [k=v ...]  run a module on the current session");
        println!("exit                    quit");
    }

    fn cmd_sessions(&self) {
        let sessions = self.sessions();
        if sessions.is_empty() {
            println!("no active sessions");
            return;
        }
        for (id, summary) in sessions {
            let marker = if self.current == Some(id) { "*" } else { " " };
            println!("{} {}: {}", marker, id, summary);
        }
    }

    fn cmd_use(&mut self, args: &[&str]) {
        let Some(id) = args.first().and_then(|a| a.parse().ok()) else {
            println!("usage: use <session-id>");
            return;
        };
        match self.set_current(id) {
            Ok(()) => println!("session {} selected", id),
            Err(err) => println!("error: {}", err),
        }
    }

    fn cmd_close(&mut self, args: &[&str]) {
        let id = match args.first() {
            Some(arg) => match arg.parse() {
                Ok(id) => id,
                Err(_) => {
                    println!("usage: close [<session-id>]");
                    return;
                }
            },
            None => match self.current {
                Some(id) => id,
                None => {
                    println!("error: no current session");
                    return;
                }
            },
        };

        match self.close_session(id) {
            Ok(()) => println!("session {} closed", id),
            Err(err) => println!("error: {}", err),
        }
    }

    fn cmd_listen(&mut self, args: &[&str]) {
        let mut spec = ListenerSpec::default();
        let mut iter = args.iter();

        let mut port = None;
        while let Some(arg) = iter.next() {
            match *arg {
                "--platform" | "-m" => {
                    spec.platform_hint = iter
                        .next()
                        .and_then(|p| p.parse::<PlatformKind>().ok());
                }
                "--count" | "-c" => {
                    spec.count_limit = iter.next().and_then(|c| c.parse().ok());
                }
                "--drop-duplicate" | "-D" => spec.drop_duplicate = true,
                "--host" | "-H" => {
                    spec.host = iter.next().map(|h| h.to_string()).unwrap_or_default();
                }
                "--ssl-cert" => spec.certfile = iter.next().map(|c| c.to_string()),
                "--ssl-key" => spec.keyfile = iter.next().map(|k| k.to_string()),
                other => {
                    if let Ok(p) = other.parse() {
                        port = Some(p);
                    } else {
                        println!("error: {}: unknown listen option", other);
                        return;
                    }
                }
            }
        }

        let Some(port) = port else {
            println!("usage: listen <port> [--platform linux|windows] [--count N] [--drop-duplicate] [--host H] [--ssl-cert PEM [--ssl-key PEM]]");
            return;
        };
        spec.port = port;

        if spec.platform_hint.is_none() {
            println!("note: no platform given; connections will queue until initialized");
        }

        match self.create_listener(spec) {
            Ok(id) => println!("listener {} started", id),
            Err(err) => println!("error: {}", err),
        }
    }

    fn cmd_listeners(&self) {
        if self.listeners.is_empty() {
            println!("no listeners");
            return;
        }
        for listener in &self.listeners {
            let (host, port) = listener.address();
            let state = match listener.state() {
                ListenerState::Running => "running",
                ListenerState::Stopped => "stopped",
                ListenerState::Failed => "failed",
            };
            let mut line = format!(
                "{}: {}:{} [{}] established={} pending={}",
                listener.id,
                host,
                port,
                state,
                listener.sessions().len(),
                listener.pending_count()
            );
            if let Some(error) = listener.error_message() {
                line.push_str(&format!(" error={:?}", error));
            }
            println!("{}", line);
        }
    }

    fn cmd_search(&self, args: &[&str]) {
        let pattern = args.first().copied().unwrap_or("*");
        for name in self.registry.search(pattern) {
            match self.registry.find(name) {
                Some(module) => println!("{:32} {}", name, module.description()),
                None => println!("{}", name),
            }
        }
    }

    fn cmd_run(&mut self, args: &[&str]) {
        let Some(module) = args.first() else {
            println!("usage: run <module> [name=value ...]");
            return;
        };

        let mut raw_args = HashMap::new();
        for pair in &args[1..] {
            match pair.split_once('=') {
                Some((k, v)) => {
                    raw_args.insert(k.to_string(), v.to_string());
                }
                None => {
                    // bare flag syntax: `run module flag` means flag=true
                    raw_args.insert(pair.to_string(), "true".to_string());
                }
            }
        }

        match self.run_on_current(module, &raw_args) {
            Ok(titles) => {
                for title in titles {
                    println!("{}", title);
                }
            }
            Err(err) => println!("error: {}", err),
        }
    }

    /// RAW state: pump keyboard and channel until escape, completion or
    /// death.
    fn enter_raw(&mut self) {
        let Some(id) = self.current else { return };
        let Some(session) = self.table.lock().unwrap().get(id) else {
            self.current = None;
            return;
        };

        let mut guard = session.lock().unwrap();
        if let Err(err) = guard.platform.set_interactive(true) {
            println!("error: {}", err);
            if err.is_fatal() {
                drop(guard);
                drop(session);
                let _ = self.close_session(id);
            }
            return;
        }

        let outcome = match RawMode::enter() {
            Ok(raw) => self.pump_raw(&raw, &mut guard),
            Err(err) => {
                println!("error: raw mode unavailable: {}", err);
                RawOutcome::Escaped
            }
        };

        match outcome {
            RawOutcome::Escaped | RawOutcome::Completed => {
                println!();
                if let Err(err) = guard.platform.set_interactive(false) {
                    log::warn!("leaving raw mode: {}", err);
                }
            }
            RawOutcome::Died => {
                drop(guard);
                drop(session);
                println!();
                println!("connection to session {} lost", id);
                let _ = self.close_session(id);
            }
        }
    }

    fn pump_raw(&self, raw: &RawMode, session: &mut Session) -> RawOutcome {
        let mut stdout = std::io::stdout();
        let mut keyboard = [0u8; 64];
        let mut has_prefix = false;

        loop {
            let mut idle = true;

            // keyboard -> channel
            match raw.read_input(&mut keyboard) {
                Ok(Some(n)) => {
                    idle = false;
                    for &byte in &keyboard[..n] {
                        if has_prefix {
                            has_prefix = false;
                            // the prefix quotes the next keystroke through
                            if session.platform.channel_mut().send(&[byte]).is_err() {
                                return RawOutcome::Died;
                            }
                        } else if byte == self.config.prefix_key {
                            has_prefix = true;
                        } else if byte == self.config.escape_key {
                            return RawOutcome::Escaped;
                        } else if session.platform.channel_mut().send(&[byte]).is_err() {
                            return RawOutcome::Died;
                        }
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    log::error!("keyboard read: {}", err);
                    return RawOutcome::Escaped;
                }
            }

            // channel -> terminal
            match session.platform.channel_mut().try_recv(4096) {
                Ok(data) => {
                    idle = false;
                    match session.platform.process_output(&data) {
                        OutputEvent::Data(out) => {
                            let _ = stdout.write_all(&out);
                            let _ = stdout.flush();
                        }
                        OutputEvent::InteractiveComplete(out) => {
                            let _ = stdout.write_all(&out);
                            let _ = stdout.flush();
                            return RawOutcome::Completed;
                        }
                    }
                }
                Err(ChannelError::Blocked) => {}
                Err(_) => return RawOutcome::Died,
            }

            if idle {
                std::thread::sleep(Duration::from_millis(10));
            }
        }
    }

    /// Close everything: listeners first (so no new sessions arrive), then
    /// sessions.
    pub fn shutdown(&mut self) {
        self.listeners.clear();

        let ids = self.table.lock().unwrap().ids();
        for id in ids {
            if let Err(err) = self.close_session(id) {
                log::warn!("closing session {}: {}", id, err);
            }
        }
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_ids_are_monotonic_and_never_reused() {
        let mut table = SessionTable::default();
        let a = table.reserve_id();
        let b = table.reserve_id();
        assert_ne!(a, b);
        assert!(b > a);

        // removal does not recycle ids
        table.remove(a);
        let c = table.reserve_id();
        assert!(c > b);
    }

    #[test]
    fn identity_tracking_for_duplicate_detection() {
        let mut table = SessionTable::default();
        assert!(!table.has_identity("hash", "root"));

        // simulate an insert by hand (Session construction needs a live
        // channel, so only the identity map is exercised here)
        table
            .identities
            .insert(7, ("hash".to_string(), "root".to_string()));
        assert!(table.has_identity("hash", "root"));
        assert!(!table.has_identity("hash", "caleb"));
        assert!(!table.has_identity("other", "root"));
    }
}
