//! Byte-level channels to a target.
//!
//! A channel is the lowest layer of the session runtime: a bidirectional byte
//! transport with peek/recv/send semantics. Channels make no assumption about
//! the protocol spoken over them; turning the byte stream into something
//! useful is the platform driver's job.
//!
//! All concrete channels keep their underlying socket in non-blocking mode
//! and implement blocking semantics in the trait layer with a short backoff
//! loop. This keeps a single code path for "blocking", "non-blocking" and
//! "deadline" reads, and is what allows `peek` to be implemented uniformly:
//! every byte read from the wire lands in the peek buffer first, and `recv`
//! consumes that buffer before touching the socket again.

use std::time::{Duration, Instant};

use redcat_internal::error::ChannelError;

pub mod ssh;
pub mod tcp;
pub mod tls;

pub use ssh::SshChannel;
pub use tcp::TcpChannel;
pub use tls::TlsChannel;

/// Backoff used by blocking loops layered over non-blocking reads.
pub(crate) const BACKOFF: Duration = redcat_internal::wire::BACKOFF_DURATION;

/// Default deadline for `recvuntil` when the caller does not provide one.
pub const DEFAULT_RECV_TIMEOUT: Duration = Duration::from_secs(30);

/// Buffer of bytes which have been read from the transport but not yet
/// consumed by `recv`. `peek` fills it, `recv` drains it, `unrecv` prepends
/// to it.
#[derive(Debug, Default)]
pub struct PeekBuffer {
    data: Vec<u8>,
}

impl PeekBuffer {
    pub fn new() -> PeekBuffer {
        PeekBuffer { data: Vec::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Remove and return up to `max` bytes from the front.
    pub fn take(&mut self, max: usize) -> Vec<u8> {
        let n = max.min(self.data.len());
        self.data.drain(..n).collect()
    }

    /// Copy up to `max` bytes from the front without consuming.
    pub fn copy_front(&self, max: usize) -> Vec<u8> {
        let n = max.min(self.data.len());
        self.data[..n].to_vec()
    }

    /// Push data back so the next `recv` returns it first.
    pub fn prepend(&mut self, data: &[u8]) {
        let mut merged = data.to_vec();
        merged.extend_from_slice(&self.data);
        self.data = merged;
    }

    pub fn append(&mut self, data: &[u8]) {
        self.data.extend_from_slice(data);
    }
}

/// Abstract bidirectional byte transport to a single target.
///
/// Implementors provide the raw socket plumbing; all higher level read
/// patterns (`recv`, `peek`, `recvuntil`, `drain`) are provided by
/// [`ChannelExt`] on top of `try_recv_raw`. `try_recv_raw` must never block:
/// it returns `ChannelError::Blocked` when no data is available and
/// `ChannelError::Eof` on orderly close.
pub trait Channel: Send {
    /// Remote (or bound) host name for display purposes.
    fn host(&self) -> &str;

    /// Remote (or bound) port.
    fn port(&self) -> u16;

    /// Whether the transport is currently usable.
    fn is_connected(&self) -> bool;

    /// Send data, blocking until all of it is written.
    fn send(&mut self, data: &[u8]) -> Result<usize, ChannelError>;

    /// Non-blocking read directly from the transport.
    fn try_recv_raw(&mut self, buf: &mut [u8]) -> Result<usize, ChannelError>;

    /// Close the channel. Must be idempotent.
    fn close(&mut self);

    /// Access to the shared peek buffer.
    fn peek_buffer(&mut self) -> &mut PeekBuffer;

    /// Whether `recv` should block waiting for data.
    fn blocking(&self) -> bool;

    /// Switch between blocking and non-blocking `recv` semantics.
    fn set_blocking(&mut self, blocking: bool);
}

/// Default read patterns layered over [`Channel`].
pub trait ChannelExt: Channel {
    /// Read up to `max` bytes without ever blocking. Consumes the peek
    /// buffer first. Returns `Blocked` when nothing is available.
    fn try_recv(&mut self, max: usize) -> Result<Vec<u8>, ChannelError> {
        let mut data = self.peek_buffer().take(max);

        if data.len() < max {
            let mut buf = vec![0u8; max - data.len()];
            match self.try_recv_raw(&mut buf) {
                Ok(n) => data.extend_from_slice(&buf[..n]),
                Err(ChannelError::Blocked) if !data.is_empty() => {}
                Err(ChannelError::Eof) if !data.is_empty() => {}
                Err(err) => {
                    if data.is_empty() {
                        return Err(err);
                    }
                }
            }
        }

        if data.is_empty() {
            return Err(ChannelError::Blocked);
        }

        Ok(data)
    }

    /// Read up to `max` bytes. Short reads are returned on any available
    /// data; with nothing buffered this blocks (or fails with `Blocked` in
    /// non-blocking mode).
    fn recv(&mut self, max: usize) -> Result<Vec<u8>, ChannelError> {
        loop {
            match self.try_recv(max) {
                Err(ChannelError::Blocked) => {
                    if !self.blocking() {
                        return Err(ChannelError::Blocked);
                    }
                    std::thread::sleep(BACKOFF);
                }
                other => return other,
            }
        }
    }

    /// Return up to `max` bytes without consuming them: the returned bytes
    /// are a prefix of what the next `recv` will return. With nothing
    /// buffered, waits up to `timeout` for at least one byte; `None` means
    /// return immediately, possibly empty.
    fn peek(&mut self, max: usize, timeout: Option<Duration>) -> Result<Vec<u8>, ChannelError> {
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            if !self.peek_buffer().is_empty() {
                break;
            }

            let mut buf = vec![0u8; max.max(1)];
            match self.try_recv_raw(&mut buf) {
                Ok(n) => {
                    let chunk = buf[..n].to_vec();
                    self.peek_buffer().append(&chunk);
                    break;
                }
                Err(ChannelError::Blocked) => match deadline {
                    None => break,
                    Some(end) if Instant::now() >= end => break,
                    Some(_) => std::thread::sleep(BACKOFF),
                },
                Err(err) => return Err(err),
            }
        }

        Ok(self.peek_buffer().copy_front(max))
    }

    /// Push bytes back onto the channel so the next `recv` returns them
    /// first.
    fn unrecv(&mut self, data: &[u8]) {
        self.peek_buffer().prepend(data);
    }

    /// Receive until the given delimiter is seen. The delimiter is included
    /// in the returned data. Reads one byte at a time so it never overshoots.
    fn recvuntil(&mut self, needle: &[u8], timeout: Option<Duration>) -> Result<Vec<u8>, ChannelError> {
        let timeout = timeout.unwrap_or(DEFAULT_RECV_TIMEOUT);
        let start = Instant::now();
        let mut data: Vec<u8> = Vec::new();

        while !data.ends_with(needle) {
            if start.elapsed() >= timeout {
                return Err(ChannelError::Timeout {
                    partial: data,
                    elapsed: start.elapsed(),
                });
            }

            match self.try_recv(1) {
                Ok(byte) => data.extend_from_slice(&byte),
                Err(ChannelError::Blocked) => std::thread::sleep(BACKOFF),
                Err(err) => return Err(err),
            }
        }

        Ok(data)
    }

    /// Receive a single line, including the newline.
    fn recvline(&mut self, timeout: Option<Duration>) -> Result<Vec<u8>, ChannelError> {
        self.recvuntil(b"\n", timeout)
    }

    /// Send data followed by a newline.
    fn sendline(&mut self, data: &[u8]) -> Result<usize, ChannelError> {
        let mut line = data.to_vec();
        line.push(b'\n');
        self.send(&line)
    }

    /// Discard everything currently buffered on the channel.
    fn drain(&mut self) -> Result<(), ChannelError> {
        loop {
            match self.try_recv(4096) {
                Ok(_) => continue,
                Err(ChannelError::Blocked) => return Ok(()),
                Err(ChannelError::Eof) => return Ok(()),
                Err(err) => return Err(err),
            }
        }
    }
}

impl<T: Channel + ?Sized> ChannelExt for T {}

/// Blocking write-all over a non-blocking stream. `WouldBlock` backs off and
/// retries; `Interrupted` retries immediately; zero-length writes are an
/// error.
pub(crate) fn send_all<W: std::io::Write>(stream: &mut W, mut buf: &[u8]) -> Result<(), ChannelError> {
    while !buf.is_empty() {
        match stream.write(buf) {
            Ok(0) => {
                return Err(ChannelError::Transport(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    "failed to write whole buffer",
                )));
            }
            Ok(n) => buf = &buf[n..],
            Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(BACKOFF);
            }
            Err(e) => return Err(ChannelError::Transport(e)),
        }
    }
    Ok(())
}

/// Which transport to use for a new channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Connect,
    Bind,
    SslConnect,
    SslBind,
    Ssh,
}

impl Protocol {
    pub fn name(&self) -> &'static str {
        match self {
            Protocol::Connect => "connect",
            Protocol::Bind => "bind",
            Protocol::SslConnect => "ssl-connect",
            Protocol::SslBind => "ssl-bind",
            Protocol::Ssh => "ssh",
        }
    }

    pub fn from_name(name: &str) -> Option<Protocol> {
        match name {
            "connect" => Some(Protocol::Connect),
            "bind" => Some(Protocol::Bind),
            "ssl-connect" => Some(Protocol::SslConnect),
            "ssl-bind" => Some(Protocol::SslBind),
            "ssh" => Some(Protocol::Ssh),
            _ => None,
        }
    }
}

/// Everything needed to construct a channel. Built by the CLI from the
/// connection string, or programmatically by listeners and the reconnect
/// logic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelSpec {
    pub protocol: Option<Protocol>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub password: Option<String>,
    /// Path to an SSH private key.
    pub identity: Option<String>,
    /// TLS certificate (possibly a combined PEM with the key).
    pub certfile: Option<String>,
    /// TLS private key when not combined with the certificate.
    pub keyfile: Option<String>,
    /// Force TLS wrapping even without cert/key (outbound connections).
    pub ssl: bool,
}

impl ChannelSpec {
    /// Resolve the effective protocol, applying the inference rules: a user
    /// implies ssh; a missing or wildcard host implies bind; anything else
    /// is an outbound connect. TLS material (or the ssl flag) selects the
    /// `ssl-` variant.
    pub fn effective_protocol(&self) -> Protocol {
        if let Some(protocol) = self.protocol {
            return protocol;
        }

        if self.user.is_some() {
            return Protocol::Ssh;
        }

        let wants_ssl = self.ssl || self.certfile.is_some() || self.keyfile.is_some();
        let host_is_wild = match self.host.as_deref() {
            None | Some("") | Some("0.0.0.0") => true,
            _ => false,
        };

        match (host_is_wild, wants_ssl) {
            (true, true) => Protocol::SslBind,
            (true, false) => Protocol::Bind,
            (false, true) => Protocol::SslConnect,
            (false, false) => Protocol::Connect,
        }
    }
}

/// Construct and connect a channel according to the spec. For `bind`
/// protocols this blocks until a single connection is accepted.
pub fn create(spec: &ChannelSpec) -> Result<Box<dyn Channel>, ChannelError> {
    let host = spec.host.clone().unwrap_or_default();
    let port = spec
        .port
        .ok_or_else(|| ChannelError::Connect("no port specified".into()))?;

    match spec.effective_protocol() {
        Protocol::Connect => {
            if host.is_empty() {
                return Err(ChannelError::Connect("no host address provided".into()));
            }
            Ok(Box::new(TcpChannel::connect(&host, port)?))
        }
        Protocol::Bind => Ok(Box::new(TcpChannel::bind(&host, port)?)),
        Protocol::SslConnect => {
            if host.is_empty() {
                return Err(ChannelError::Connect("no host address provided".into()));
            }
            Ok(Box::new(TlsChannel::connect(&host, port)?))
        }
        Protocol::SslBind => {
            let cert = spec.certfile.as_deref().ok_or_else(|| {
                ChannelError::Connect("ssl-bind requires a server certificate".into())
            })?;
            Ok(Box::new(TlsChannel::bind(
                &host,
                port,
                cert,
                spec.keyfile.as_deref(),
            )?))
        }
        Protocol::Ssh => {
            let user = spec
                .user
                .as_deref()
                .ok_or_else(|| ChannelError::Connect("ssh requires a user".into()))?;
            Ok(Box::new(SshChannel::connect(
                &host,
                port,
                user,
                spec.password.as_deref(),
                spec.identity.as_deref(),
            )?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockChannel;

    #[test]
    fn peek_is_prefix_of_next_recv() {
        let mut chan = MockChannel::with_incoming(b"hello world");

        let peeked = chan.peek(5, None).unwrap();
        assert_eq!(peeked, b"hello");

        // peek again returns the same bytes
        let peeked2 = chan.peek(3, None).unwrap();
        assert_eq!(peeked2, b"hel");

        let received = chan.recv(11).unwrap();
        assert!(received.starts_with(&peeked));
        assert_eq!(received, b"hello world");
    }

    #[test]
    fn unrecv_is_returned_first() {
        let mut chan = MockChannel::with_incoming(b"tail");
        chan.unrecv(b"head ");
        assert_eq!(chan.recv(9).unwrap(), b"head tail");
    }

    #[test]
    fn nonblocking_recv_reports_blocked() {
        let mut chan = MockChannel::with_incoming(b"");
        chan.set_blocking(false);
        match chan.recv(16) {
            Err(ChannelError::Blocked) => {}
            other => panic!("expected Blocked, got {:?}", other.map(|d| d.len())),
        }
    }

    #[test]
    fn recvuntil_includes_needle_and_times_out() {
        let mut chan = MockChannel::with_incoming(b"first line\nrest");
        let line = chan.recvuntil(b"\n", None).unwrap();
        assert_eq!(line, b"first line\n");

        // nothing more is coming; a tiny timeout must produce Timeout with
        // the partial data
        match chan.recvuntil(b"\n", Some(Duration::from_millis(30))) {
            Err(ChannelError::Timeout { partial, .. }) => assert_eq!(partial, b"rest"),
            other => panic!("expected Timeout, got {:?}", other),
        }
    }

    #[test]
    fn drain_discards_pending_bytes() {
        let mut chan = MockChannel::with_incoming(b"noise noise noise");
        chan.drain().unwrap();
        chan.set_blocking(false);
        assert!(matches!(chan.recv(1), Err(ChannelError::Blocked)));
    }

    #[test]
    fn protocol_inference_matches_connection_rules() {
        // user implies ssh
        let spec = ChannelSpec {
            user: Some("caleb".into()),
            host: Some("target".into()),
            port: Some(22),
            ..Default::default()
        };
        assert_eq!(spec.effective_protocol(), Protocol::Ssh);

        // host + port implies connect
        let spec = ChannelSpec {
            host: Some("10.0.0.2".into()),
            port: Some(4444),
            ..Default::default()
        };
        assert_eq!(spec.effective_protocol(), Protocol::Connect);

        // missing or wildcard host implies bind
        for host in [None, Some("".to_string()), Some("0.0.0.0".to_string())] {
            let spec = ChannelSpec {
                host,
                port: Some(4444),
                ..Default::default()
            };
            assert_eq!(spec.effective_protocol(), Protocol::Bind);
        }

        // TLS material upgrades to the ssl- variant
        let spec = ChannelSpec {
            port: Some(4444),
            certfile: Some("combined.pem".into()),
            ..Default::default()
        };
        assert_eq!(spec.effective_protocol(), Protocol::SslBind);

        let spec = ChannelSpec {
            host: Some("10.0.0.2".into()),
            port: Some(4444),
            ssl: true,
            ..Default::default()
        };
        assert_eq!(spec.effective_protocol(), Protocol::SslConnect);
    }
}
