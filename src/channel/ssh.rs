//! SSH channels over legitimate credentials.
//!
//! Opens an SSH session, authenticates with a password or private key,
//! requests a PTY-backed shell channel and adapts it to the [`Channel`]
//! interface. Callers never see the SSH framing; an SSH channel behaves like
//! any other byte transport, except that the remote side already has a PTY
//! so the platform skips its upgrade ladder.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::Path;

use redcat_internal::error::ChannelError;

use super::{Channel, PeekBuffer, BACKOFF};

pub struct SshChannel {
    // Owns the session so it outlives the shell channel.
    _session: ssh2::Session,
    shell: ssh2::Channel,
    host: String,
    port: u16,
    connected: bool,
    peek: PeekBuffer,
    blocking: bool,
}

impl SshChannel {
    /// Authenticate and open a shell channel. When neither a password nor an
    /// identity file is supplied, the password is prompted for on the local
    /// terminal.
    pub fn connect(
        host: &str,
        port: u16,
        user: &str,
        password: Option<&str>,
        identity: Option<&str>,
    ) -> Result<SshChannel, ChannelError> {
        if user.is_empty() {
            return Err(ChannelError::Connect("you must specify a user".into()));
        }

        let port = if port == 0 { 22 } else { port };
        let tcp = TcpStream::connect((host, port))
            .map_err(|e| ChannelError::Connect(format!("{}:{}: {}", host, port, e)))?;

        let mut session =
            ssh2::Session::new().map_err(|e| ChannelError::Connect(format!("ssh: {}", e)))?;
        session.set_tcp_stream(tcp);
        session
            .handshake()
            .map_err(|e| ChannelError::Connect(format!("ssh handshake: {}", e)))?;

        if let Some(identity) = identity {
            session
                .userauth_pubkey_file(user, None, Path::new(identity), None)
                .map_err(|e| ChannelError::Connect(format!("ssh authentication failed: {}", e)))?;
        } else {
            let prompted;
            let password = match password {
                Some(p) => p,
                None => {
                    prompted = rpassword::prompt_password("Password: ").map_err(|e| {
                        ChannelError::Connect(format!("password prompt failed: {}", e))
                    })?;
                    &prompted
                }
            };
            session
                .userauth_password(user, password)
                .map_err(|e| ChannelError::Connect(format!("ssh authentication failed: {}", e)))?;
        }

        if !session.authenticated() {
            return Err(ChannelError::Connect("ssh authentication failed".into()));
        }

        let mut shell = session
            .channel_session()
            .map_err(|e| ChannelError::Connect(format!("ssh channel: {}", e)))?;

        let (cols, rows) = crate::terminal::window_size().unwrap_or((80, 24));
        shell
            .request_pty(
                &std::env::var("TERM").unwrap_or_else(|_| "xterm".into()),
                None,
                Some((cols as u32, rows as u32, 0, 0)),
            )
            .map_err(|e| ChannelError::Connect(format!("ssh pty: {}", e)))?;
        shell
            .shell()
            .map_err(|e| ChannelError::Connect(format!("ssh shell: {}", e)))?;

        // All blocking behavior is layered above the transport.
        session.set_blocking(false);

        log::info!("ssh connection to {}@{}:{} established", user, host, port);

        Ok(SshChannel {
            _session: session,
            shell,
            host: host.to_string(),
            port,
            connected: true,
            peek: PeekBuffer::new(),
            blocking: true,
        })
    }
}

impl Channel for SshChannel {
    fn host(&self) -> &str {
        &self.host
    }

    fn port(&self) -> u16 {
        self.port
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn send(&mut self, data: &[u8]) -> Result<usize, ChannelError> {
        if !self.connected {
            return Err(ChannelError::Eof);
        }

        let mut buf = data;
        while !buf.is_empty() {
            match self.shell.write(buf) {
                Ok(0) => {
                    self.connected = false;
                    return Err(ChannelError::Transport(std::io::Error::new(
                        std::io::ErrorKind::WriteZero,
                        "ssh channel write returned zero",
                    )));
                }
                Ok(n) => buf = &buf[n..],
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(BACKOFF);
                }
                Err(e) => {
                    self.connected = false;
                    return Err(ChannelError::Transport(e));
                }
            }
        }
        Ok(data.len())
    }

    fn try_recv_raw(&mut self, buf: &mut [u8]) -> Result<usize, ChannelError> {
        if !self.connected {
            return Err(ChannelError::Eof);
        }

        match self.shell.read(buf) {
            Ok(0) => {
                if self.shell.eof() {
                    self.connected = false;
                    Err(ChannelError::Eof)
                } else {
                    Err(ChannelError::Blocked)
                }
            }
            Ok(n) => Ok(n),
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => Err(ChannelError::Blocked),
            Err(e) => {
                self.connected = false;
                Err(ChannelError::Transport(e))
            }
        }
    }

    fn close(&mut self) {
        if !self.connected {
            return;
        }
        self.connected = false;
        let _ = self.shell.send_eof();
        let _ = self.shell.close();
    }

    fn peek_buffer(&mut self) -> &mut PeekBuffer {
        &mut self.peek
    }

    fn blocking(&self) -> bool {
        self.blocking
    }

    fn set_blocking(&mut self, blocking: bool) {
        self.blocking = blocking;
    }
}
