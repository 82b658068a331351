//! Plain TCP channels: outbound `connect` and single-accept `bind`.

use std::io::Read;
use std::net::{Shutdown, TcpListener, TcpStream};

use redcat_internal::error::ChannelError;

use super::{send_all, Channel, PeekBuffer};

/// A channel riding over a shell attached directly to a TCP socket.
pub struct TcpChannel {
    stream: TcpStream,
    host: String,
    port: u16,
    connected: bool,
    peek: PeekBuffer,
    blocking: bool,
}

impl TcpChannel {
    /// Connect out to a listening target (the bind-shell case).
    pub fn connect(host: &str, port: u16) -> Result<TcpChannel, ChannelError> {
        let stream = TcpStream::connect((host, port))
            .map_err(|e| ChannelError::Connect(format!("{}:{}: {}", host, port, e)))?;

        log::info!("connection to {}:{} established", host, port);
        TcpChannel::from_stream(stream, host.to_string(), port)
    }

    /// Listen on `host:port` and accept exactly one connection (the
    /// reverse-shell case). Blocks until the connection arrives.
    pub fn bind(host: &str, port: u16) -> Result<TcpChannel, ChannelError> {
        let host = if host.is_empty() { "0.0.0.0" } else { host };
        let server = TcpListener::bind((host, port))
            .map_err(|e| ChannelError::Connect(format!("bind {}:{}: {}", host, port, e)))?;

        log::info!("bound to {}:{}", host, port);
        let (stream, peer) = server
            .accept()
            .map_err(|e| ChannelError::Connect(format!("accept: {}", e)))?;
        log::info!("received connection from {}", peer);

        TcpChannel::from_stream(stream, peer.ip().to_string(), peer.port())
    }

    /// Wrap an already-established socket, e.g. one accepted by a background
    /// listener. The socket is switched to non-blocking mode.
    pub fn from_stream(stream: TcpStream, host: String, port: u16) -> Result<TcpChannel, ChannelError> {
        stream.set_nonblocking(true)?;

        Ok(TcpChannel {
            stream,
            host,
            port,
            connected: true,
            peek: PeekBuffer::new(),
            blocking: true,
        })
    }
}

impl Channel for TcpChannel {
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

        send_all(&mut self.stream, data).map_err(|err| {
            self.connected = false;
            err
        })?;
        Ok(data.len())
    }

    fn try_recv_raw(&mut self, buf: &mut [u8]) -> Result<usize, ChannelError> {
        if !self.connected {
            return Err(ChannelError::Eof);
        }

        match self.stream.read(buf) {
            Ok(0) => {
                self.connected = false;
                Err(ChannelError::Eof)
            }
            Ok(n) => Ok(n),
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => Err(ChannelError::Blocked),
            Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => Err(ChannelError::Blocked),
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
        let _ = self.stream.shutdown(Shutdown::Both);
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelExt;
    use std::io::Write;

    /// Loopback pair: a connected TcpChannel plus the raw remote socket.
    fn loopback() -> (TcpChannel, TcpStream) {
        let server = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = server.local_addr().unwrap();
        let remote = TcpStream::connect(addr).unwrap();
        let (stream, peer) = server.accept().unwrap();
        let chan = TcpChannel::from_stream(stream, peer.ip().to_string(), peer.port()).unwrap();
        (chan, remote)
    }

    #[test]
    fn recv_returns_what_remote_sent() {
        let (mut chan, mut remote) = loopback();
        remote.write_all(b"uid=0(root)\n").unwrap();
        let line = chan.recvline(None).unwrap();
        assert_eq!(line, b"uid=0(root)\n");
    }

    #[test]
    fn peek_then_recv_consistency_over_a_real_socket() {
        let (mut chan, mut remote) = loopback();
        remote.write_all(b"abcdefgh").unwrap();

        // wait for the bytes to land
        let peeked = chan.peek(4, Some(std::time::Duration::from_secs(2))).unwrap();
        assert_eq!(peeked, b"abcd");
        assert_eq!(chan.recv(8).unwrap(), b"abcdefgh");
    }

    #[test]
    fn remote_close_yields_eof() {
        let (mut chan, remote) = loopback();
        drop(remote);

        // The close may take a moment to be observable.
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        loop {
            match chan.try_recv(16) {
                Err(ChannelError::Eof) => break,
                Err(ChannelError::Blocked) if std::time::Instant::now() < deadline => {
                    std::thread::sleep(std::time::Duration::from_millis(5));
                }
                other => panic!("expected Eof, got {:?}", other),
            }
        }
        assert!(!chan.is_connected());
    }

    #[test]
    fn send_after_close_fails() {
        let (mut chan, _remote) = loopback();
        chan.close();
        assert!(matches!(chan.send(b"data"), Err(ChannelError::Eof)));
    }
}
