//! Background listeners.
//!
//! A listener accepts inbound connections on its own thread. With a
//! platform hint each accepted channel is immediately bootstrapped into a
//! full session (optionally dropping duplicates of already-connected
//! targets); without one, channels queue until the operator initializes
//! them explicitly.

use std::collections::VecDeque;
use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use native_tls::TlsAcceptor;
use redcat_internal::error::Error;

use crate::channel::{tls, Channel, TcpChannel, TlsChannel};
use crate::config::Config;
use crate::manager::{bootstrap_session, SessionTable};
use crate::platform::PlatformKind;
use crate::target::TargetStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Running,
    Stopped,
    Failed,
}

/// Construction parameters for a listener.
#[derive(Debug, Clone, Default)]
pub struct ListenerSpec {
    pub host: String,
    pub port: u16,
    /// Bootstrap accepted channels into sessions of this platform; `None`
    /// queues them for explicit initialization.
    pub platform_hint: Option<PlatformKind>,
    /// Stop after this many established sessions.
    pub count_limit: Option<usize>,
    /// Drop new sessions whose (host id, user) already has a session.
    pub drop_duplicate: bool,
    pub certfile: Option<String>,
    pub keyfile: Option<String>,
}

struct Shared {
    spec: ListenerSpec,
    /// Actual bound port; differs from the spec when port 0 was requested.
    bound_port: u16,
    state: Mutex<ListenerState>,
    error: Mutex<Option<String>>,
    pending: Mutex<VecDeque<Box<dyn Channel>>>,
    established: Mutex<Vec<u32>>,
    stop: AtomicBool,
}

pub struct Listener {
    pub id: u32,
    shared: Arc<Shared>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl Listener {
    /// Bind the socket and start the accept thread. TLS material is
    /// validated here so certificate problems surface immediately.
    pub fn start(
        id: u32,
        spec: ListenerSpec,
        table: Arc<Mutex<SessionTable>>,
        store: Arc<Mutex<TargetStore>>,
        config: Arc<Config>,
    ) -> Result<Listener, Error> {
        let acceptor = match &spec.certfile {
            Some(cert) => Some(tls::build_acceptor(cert, spec.keyfile.as_deref())?),
            None => None,
        };

        let host = if spec.host.is_empty() {
            "0.0.0.0".to_string()
        } else {
            spec.host.clone()
        };
        let server = TcpListener::bind((host.as_str(), spec.port))
            .map_err(|e| Error::Platform(format!("bind {}:{}: {}", host, spec.port, e)))?;
        server
            .set_nonblocking(true)
            .map_err(|e| Error::Platform(format!("listener setup: {}", e)))?;
        let bound_port = server
            .local_addr()
            .map(|a| a.port())
            .unwrap_or(spec.port);

        log::info!("listener {} bound to {}:{}", id, host, bound_port);

        let shared = Arc::new(Shared {
            spec,
            bound_port,
            state: Mutex::new(ListenerState::Running),
            error: Mutex::new(None),
            pending: Mutex::new(VecDeque::new()),
            established: Mutex::new(Vec::new()),
            stop: AtomicBool::new(false),
        });

        let thread_shared = shared.clone();
        let thread = std::thread::Builder::new()
            .name(format!("redcat::listener::{}", id))
            .spawn(move || {
                accept_loop(thread_shared, acceptor, server, table, store, config);
            })
            .map_err(|e| Error::Platform(format!("listener thread: {}", e)))?;

        Ok(Listener {
            id,
            shared,
            thread: Some(thread),
        })
    }

    pub fn state(&self) -> ListenerState {
        *self.shared.state.lock().unwrap()
    }

    pub fn error_message(&self) -> Option<String> {
        self.shared.error.lock().unwrap().clone()
    }

    pub fn address(&self) -> (String, u16) {
        (self.shared.spec.host.clone(), self.shared.bound_port)
    }

    /// The port actually bound (resolves a requested port of 0).
    pub fn bound_port(&self) -> u16 {
        self.shared.bound_port
    }

    pub fn platform_hint(&self) -> Option<PlatformKind> {
        self.shared.spec.platform_hint
    }

    /// Session ids established by this listener.
    pub fn sessions(&self) -> Vec<u32> {
        self.shared.established.lock().unwrap().clone()
    }

    pub fn pending_count(&self) -> usize {
        self.shared.pending.lock().unwrap().len()
    }

    /// Promote a queued channel into a session.
    pub fn init(
        &self,
        pending_ix: usize,
        kind: PlatformKind,
        drop_duplicate: bool,
        table: &Arc<Mutex<SessionTable>>,
        store: &Arc<Mutex<TargetStore>>,
        config: &Config,
    ) -> Result<Option<u32>, Error> {
        let channel = {
            let mut pending = self.shared.pending.lock().unwrap();
            pending
                .remove(pending_ix)
                .ok_or_else(|| Error::NotFound(format!("pending channel {}", pending_ix)))?
        };

        let established = bootstrap_session(table, store, config, kind, channel, drop_duplicate)?;
        if let Some(id) = established {
            self.shared.established.lock().unwrap().push(id);
        }
        Ok(established)
    }

    /// Stop the accept thread and close any queued channels.
    pub fn stop(&mut self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }

        let mut state = self.shared.state.lock().unwrap();
        if *state == ListenerState::Running {
            *state = ListenerState::Stopped;
        }
        drop(state);

        let mut pending = self.shared.pending.lock().unwrap();
        for mut channel in pending.drain(..) {
            channel.close();
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(
    shared: Arc<Shared>,
    acceptor: Option<TlsAcceptor>,
    server: TcpListener,
    table: Arc<Mutex<SessionTable>>,
    store: Arc<Mutex<TargetStore>>,
    config: Arc<Config>,
) {
    loop {
        if shared.stop.load(Ordering::SeqCst) {
            *shared.state.lock().unwrap() = ListenerState::Stopped;
            return;
        }

        let (stream, peer) = match server.accept() {
            Ok(accepted) => accepted,
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(e) => {
                log::error!("listener accept failed: {}", e);
                *shared.error.lock().unwrap() = Some(e.to_string());
                *shared.state.lock().unwrap() = ListenerState::Failed;
                return;
            }
        };

        log::info!("received connection from {}", peer);

        // The accepted socket starts blocking for the TLS handshake; the
        // channel wrapper flips it to non-blocking afterwards.
        let channel: Box<dyn Channel> = match &acceptor {
            Some(acceptor) => {
                if stream.set_nonblocking(false).is_err() {
                    continue;
                }
                match tls::accept_handshake(acceptor, stream)
                    .and_then(|s| TlsChannel::from_tls_stream(s, peer.ip().to_string(), peer.port()))
                {
                    Ok(channel) => Box::new(channel),
                    Err(err) => {
                        log::warn!("tls handshake with {} failed: {}", peer, err);
                        continue;
                    }
                }
            }
            None => match TcpChannel::from_stream(stream, peer.ip().to_string(), peer.port()) {
                Ok(channel) => Box::new(channel),
                Err(err) => {
                    log::warn!("channel setup for {} failed: {}", peer, err);
                    continue;
                }
            },
        };

        match shared.spec.platform_hint {
            None => {
                shared.pending.lock().unwrap().push_back(channel);
                log::info!("channel from {} queued for initialization", peer);
            }
            Some(kind) => {
                match bootstrap_session(
                    &table,
                    &store,
                    &config,
                    kind,
                    channel,
                    shared.spec.drop_duplicate,
                ) {
                    Ok(Some(id)) => {
                        let mut established = shared.established.lock().unwrap();
                        established.push(id);
                        let count = established.len();
                        drop(established);

                        if let Some(limit) = shared.spec.count_limit {
                            if count >= limit {
                                log::info!("listener reached its session limit; stopping");
                                *shared.state.lock().unwrap() = ListenerState::Stopped;
                                return;
                            }
                        }
                    }
                    Ok(None) => {
                        // duplicate dropped; keep listening
                    }
                    Err(err) => {
                        log::warn!("session bootstrap for {} failed: {}", peer, err);
                    }
                }
            }
        }
    }
}
