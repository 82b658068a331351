// SPDX-License-Identifier: MIT OR Apache-2.0
//! Byte-stream framing helpers.
//!
//! Two framing shapes are used on redcat channels: newline-delimited JSON
//! lines (the stage-two control ABI) and length-prefixed raw byte windows
//! (binary file transfer). This module implements the buffering needed to
//! reassemble both from arbitrary read chunks.

/// The default backoff used by polling read loops.
pub const BACKOFF_DURATION: std::time::Duration = std::time::Duration::from_millis(10);

/// Encode a length-prefixed raw window: 4-byte big-endian length followed by
/// the payload itself.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 4);
    let len: u32 = payload.len() as u32;
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// Accumulates bytes from a stream until a complete length-prefixed frame is
/// available.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    bytes: Vec<u8>,
}

impl FrameBuffer {
    pub fn new() -> FrameBuffer {
        FrameBuffer { bytes: Vec::new() }
    }

    /// Append raw bytes read from the stream.
    pub fn push(&mut self, data: &[u8]) {
        self.bytes.extend_from_slice(data);
    }

    /// The announced length of the in-flight frame, if the header is complete.
    pub fn expected_length(&self) -> Option<u32> {
        if self.bytes.len() < 4 {
            return None;
        }
        let header: [u8; 4] = self.bytes[0..4].try_into().ok()?;
        Some(u32::from_be_bytes(header))
    }

    /// Pop a complete frame if one is buffered.
    pub fn pop(&mut self) -> Option<Vec<u8>> {
        let len = self.expected_length()? as usize;
        if self.bytes.len() - 4 < len {
            return None;
        }
        //drain length field
        self.bytes.drain(0..4);
        //drain message
        Some(self.bytes.drain(0..len).collect())
    }
}

/// Accumulates bytes until a complete `\n`-terminated line is available.
///
/// The stage-two ABI is line oriented; responses can arrive interleaved with
/// short reads, so the platform keeps one of these per channel.
#[derive(Debug, Default)]
pub struct LineBuffer {
    bytes: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> LineBuffer {
        LineBuffer { bytes: Vec::new() }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.bytes.extend_from_slice(data);
    }

    /// Pop one full line, excluding the terminating newline. A trailing `\r`
    /// is stripped as well since the remote side is frequently CRLF.
    pub fn pop_line(&mut self) -> Option<Vec<u8>> {
        let nl = self.bytes.iter().position(|&b| b == b'\n')?;
        let mut line: Vec<u8> = self.bytes.drain(0..=nl).collect();
        line.pop(); // the newline itself
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Some(line)
    }

    /// Bytes currently buffered without a complete line.
    pub fn pending(&self) -> &[u8] {
        &self.bytes
    }

    /// Remove and return everything buffered. Used when the stream switches
    /// from line-oriented to a raw byte window mid-protocol.
    pub fn take_pending(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trip() {
        let mut buf = FrameBuffer::new();
        let frame = encode_frame(b"hello world");
        // feed it one byte at a time to exercise partial header handling
        for b in &frame[..frame.len() - 1] {
            buf.push(std::slice::from_ref(b));
            assert!(buf.pop().is_none());
        }
        buf.push(&frame[frame.len() - 1..]);
        assert_eq!(buf.pop().unwrap(), b"hello world");
        assert!(buf.pop().is_none());
    }

    #[test]
    fn frame_empty_payload() {
        let mut buf = FrameBuffer::new();
        buf.push(&encode_frame(b""));
        assert_eq!(buf.pop().unwrap(), b"");
    }

    #[test]
    fn two_frames_back_to_back() {
        let mut buf = FrameBuffer::new();
        let mut data = encode_frame(b"one");
        data.extend_from_slice(&encode_frame(b"two"));
        buf.push(&data);
        assert_eq!(buf.pop().unwrap(), b"one");
        assert_eq!(buf.pop().unwrap(), b"two");
        assert!(buf.pop().is_none());
    }

    #[test]
    fn line_buffer_strips_crlf() {
        let mut buf = LineBuffer::new();
        buf.push(b"READY\r\npartial");
        assert_eq!(buf.pop_line().unwrap(), b"READY");
        assert!(buf.pop_line().is_none());
        assert_eq!(buf.pending(), b"partial");
        buf.push(b" line\n");
        assert_eq!(buf.pop_line().unwrap(), b"partial line");
    }
}
