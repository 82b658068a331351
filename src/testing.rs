//! In-memory channel used by unit tests to drive the platform state
//! machines without a network.

use redcat_internal::error::ChannelError;

use crate::channel::{Channel, PeekBuffer};

type Responder = Box<dyn FnMut(&[u8]) -> Vec<u8> + Send>;

/// A scripted channel: bytes queued on `incoming` are served to reads, and
/// an optional responder closure fabricates the remote reaction to every
/// `send`.
pub(crate) struct MockChannel {
    incoming: Vec<u8>,
    pub sent: Vec<u8>,
    peek: PeekBuffer,
    blocking: bool,
    connected: bool,
    responder: Option<Responder>,
    /// Maximum bytes served per raw read; small values simulate fragmented
    /// delivery.
    chunk: usize,
}

impl MockChannel {
    pub fn with_incoming(data: &[u8]) -> MockChannel {
        MockChannel {
            incoming: data.to_vec(),
            sent: Vec::new(),
            peek: PeekBuffer::new(),
            blocking: true,
            connected: true,
            responder: None,
            chunk: usize::MAX,
        }
    }

    pub fn scripted<F>(responder: F) -> MockChannel
    where
        F: FnMut(&[u8]) -> Vec<u8> + Send + 'static,
    {
        let mut chan = MockChannel::with_incoming(b"");
        chan.responder = Some(Box::new(responder));
        chan
    }

    pub fn scripted_chunked<F>(responder: F, chunk: usize) -> MockChannel
    where
        F: FnMut(&[u8]) -> Vec<u8> + Send + 'static,
    {
        let mut chan = MockChannel::scripted(responder);
        chan.chunk = chunk.max(1);
        chan
    }

    /// Queue additional bytes for delivery.
    pub fn push_incoming(&mut self, data: &[u8]) {
        self.incoming.extend_from_slice(data);
    }

    /// Everything sent so far, decoded lossily.
    #[allow(dead_code)]
    pub fn sent_text(&self) -> String {
        String::from_utf8_lossy(&self.sent).into_owned()
    }
}

impl Channel for MockChannel {
    fn host(&self) -> &str {
        "mock"
    }

    fn port(&self) -> u16 {
        0
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn send(&mut self, data: &[u8]) -> Result<usize, ChannelError> {
        if !self.connected {
            return Err(ChannelError::Eof);
        }
        self.sent.extend_from_slice(data);
        if let Some(responder) = self.responder.as_mut() {
            let reply = responder(data);
            self.incoming.extend_from_slice(&reply);
        }
        Ok(data.len())
    }

    fn try_recv_raw(&mut self, buf: &mut [u8]) -> Result<usize, ChannelError> {
        if self.incoming.is_empty() {
            if !self.connected {
                return Err(ChannelError::Eof);
            }
            return Err(ChannelError::Blocked);
        }

        let n = buf.len().min(self.incoming.len()).min(self.chunk);
        buf[..n].copy_from_slice(&self.incoming[..n]);
        self.incoming.drain(..n);
        Ok(n)
    }

    fn close(&mut self) {
        self.connected = false;
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
