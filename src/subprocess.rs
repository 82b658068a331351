//! Framed remote processes.
//!
//! A remote command on a Linux session shares the single shell byte stream
//! with everything else, so its output is located by wrapping the command in
//! unique start/end markers:
//!
//! ```text
//!  export PS1=; echo; echo <S>; <cmd>; echo <E> $?
//! ```
//!
//! The driver consumes the stream until `<S>` followed by a newline (which
//! skips any echo of the command itself, since the echoed form is followed
//! by `;`), then hands out output bytes until `<E> <status>` appears. The
//! end marker can be split across reads, so a holdback window of
//! marker-length bytes is retained until more data arrives or the marker is
//! ruled out.
//!
//! While a [`Popen`] exists it mutably borrows the session channel, which
//! statically enforces the one-bound-process-per-channel invariant.

use std::time::{Duration, Instant};

use redcat_internal::error::{ChannelError, Error};

use crate::channel::{Channel, ChannelExt, BACKOFF};
use crate::util;

/// Length in hex characters of the per-command framing markers.
pub const MARKER_LEN: usize = 32;

/// Default time to wait for the start marker to appear.
pub const START_TIMEOUT: Duration = Duration::from_secs(30);

/// Grace period granted to a command after an interrupt before the channel
/// is declared poisoned.
const INTERRUPT_GRACE: Duration = Duration::from_secs(5);

/// Result of a completed framed execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Output {
    pub stdout: Vec<u8>,
    pub status: i32,
}

impl Output {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    pub fn stdout_utf8(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }
}

/// Framing markers for one command.
#[derive(Debug, Clone)]
pub struct Markers {
    pub start: String,
    pub end: String,
}

impl Markers {
    pub fn generate() -> Markers {
        Markers {
            start: util::random_hex(MARKER_LEN),
            end: util::random_hex(MARKER_LEN),
        }
    }

    /// The complete wrapped command line for the given payload.
    pub fn wrap(&self, command: &str) -> String {
        format!(
            " export PS1=; echo; echo {}; {}; echo {} $?",
            self.start, command, self.end
        )
    }
}

/// A file-like view over a running remote process, bounded by the framing
/// markers. Holds the channel borrow for its whole lifetime.
pub struct Popen<'c> {
    chan: &'c mut dyn Channel,
    markers: Markers,
    /// Bytes read from the channel, not yet ruled in or out as output.
    acc: Vec<u8>,
    status: Option<i32>,
}

impl<'c> Popen<'c> {
    /// Send the wrapped command and wait for the start marker. Optional
    /// `stdin` bytes are sent immediately after the command line (used to
    /// bootstrap payloads that read from stdin).
    pub fn spawn(
        chan: &'c mut dyn Channel,
        command: &str,
        bootstrap_input: Option<&[u8]>,
    ) -> Result<Popen<'c>, Error> {
        let markers = Markers::generate();
        let line = markers.wrap(command);

        log::debug!("running: {}", command);
        chan.sendline(line.as_bytes()).map_err(Error::Channel)?;

        if let Some(input) = bootstrap_input {
            chan.send(input).map_err(Error::Channel)?;
        }

        // Skip everything up to the start marker line. Requiring the
        // trailing newline avoids matching the shell's echo of the command,
        // where the marker is followed by `;`.
        let needle = format!("{}\n", markers.start);
        match chan.recvuntil(needle.as_bytes(), Some(START_TIMEOUT)) {
            Ok(_) => {}
            Err(ChannelError::Timeout { .. }) => {
                return Err(Error::Protocol(format!(
                    "{:?}: start marker never arrived",
                    command
                )))
            }
            Err(err) => return Err(Error::Channel(err)),
        }

        Ok(Popen {
            chan,
            markers,
            acc: Vec::new(),
            status: None,
        })
    }

    /// Exit status, available once all output has been consumed.
    pub fn status(&self) -> Option<i32> {
        self.status
    }

    /// Write bytes to the process standard input (raw channel write).
    pub fn write_stdin(&mut self, data: &[u8]) -> Result<(), Error> {
        self.chan.send(data).map_err(Error::Channel)?;
        Ok(())
    }

    /// Send an exit command (e.g. an EOF control byte) to terminate a
    /// stdin-reading payload.
    pub fn send_exit(&mut self, exit_cmd: &[u8]) -> Result<(), Error> {
        if !exit_cmd.is_empty() {
            self.chan.send(exit_cmd).map_err(Error::Channel)?;
        }
        Ok(())
    }

    /// Scan the accumulator for the end marker followed by ` <digits>\n`.
    /// Returns `(output_len, status, consumed_len)` when complete.
    fn scan_end(&self) -> ScanResult {
        let marker = self.markers.end.as_bytes();
        let mut from = 0;

        while let Some(rel) = find(&self.acc[from..], marker) {
            let pos = from + rel;
            let tail = &self.acc[pos + marker.len()..];

            // Need at least " d\n" after the marker to decide.
            if tail.first() != Some(&b' ') {
                if tail.is_empty() {
                    return ScanResult::NeedMore;
                }
                from = pos + marker.len();
                continue;
            }

            match tail[1..].iter().position(|&b| b == b'\n') {
                Some(nl) => {
                    let digits = &tail[1..1 + nl];
                    let text = String::from_utf8_lossy(digits);
                    match text.trim().parse::<i32>() {
                        Ok(status) => {
                            let consumed = pos + marker.len() + 2 + nl;
                            return ScanResult::Complete {
                                output_len: pos,
                                status,
                                consumed,
                            };
                        }
                        Err(_) => {
                            // Not a status line (probably the echoed `$?`
                            // form); keep scanning.
                            from = pos + marker.len();
                        }
                    }
                }
                None => return ScanResult::NeedMore,
            }
        }

        ScanResult::NotFound
    }

    /// Read the next chunk of process output. `Ok(None)` signals the end of
    /// output; the exit status is then available via [`Popen::status`].
    pub fn read_some(&mut self, deadline: Option<Instant>) -> Result<Option<Vec<u8>>, Error> {
        loop {
            if self.status.is_some() {
                return Ok(None);
            }

            match self.scan_end() {
                ScanResult::Complete {
                    output_len,
                    status,
                    consumed,
                } => {
                    let output: Vec<u8> = self.acc.drain(..output_len).collect();
                    // everything between output and the end of the status
                    // line belongs to the framing
                    let leftovers: Vec<u8> = self.acc.split_off(consumed - output_len);
                    self.acc.clear();
                    if !leftovers.is_empty() {
                        self.chan.unrecv(&leftovers);
                    }
                    self.status = Some(status);
                    if output.is_empty() {
                        return Ok(None);
                    }
                    return Ok(Some(output));
                }
                ScanResult::NotFound => {
                    // Hold back a marker-sized window in case the end marker
                    // straddles a read boundary.
                    let holdback = self.markers.end.len() + 16;
                    if self.acc.len() > holdback {
                        let safe = self.acc.len() - holdback;
                        return Ok(Some(self.acc.drain(..safe).collect()));
                    }
                }
                ScanResult::NeedMore => {}
            }

            // a user interrupt aborts exactly like a deadline expiry: the
            // caller sends the interrupt sequence and drains to the marker
            if crate::manager::take_interrupt() {
                return Err(Error::Channel(ChannelError::Timeout {
                    partial: std::mem::take(&mut self.acc),
                    elapsed: Duration::default(),
                }));
            }

            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Err(Error::Channel(ChannelError::Timeout {
                        partial: std::mem::take(&mut self.acc),
                        elapsed: Duration::default(),
                    }));
                }
            }

            match self.chan.try_recv(4096) {
                Ok(data) => self.acc.extend_from_slice(&data),
                Err(ChannelError::Blocked) => std::thread::sleep(BACKOFF),
                Err(err) => return Err(Error::Channel(err)),
            }
        }
    }

    /// Drain all remaining output and return the aggregate result.
    pub fn wait(mut self, timeout: Option<Duration>) -> Result<Output, Error> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut stdout = Vec::new();

        loop {
            match self.read_some(deadline) {
                Ok(Some(chunk)) => stdout.extend_from_slice(&chunk),
                Ok(None) => {
                    let status = self.status.unwrap_or(0);
                    return Ok(Output { stdout, status });
                }
                Err(Error::Channel(ChannelError::Timeout { partial, .. })) => {
                    stdout.extend_from_slice(&partial);
                    self.interrupt()?;
                    return match self.drain_to_end(INTERRUPT_GRACE) {
                        Ok(_) => Err(Error::Channel(ChannelError::Timeout {
                            partial: stdout,
                            elapsed: timeout.unwrap_or_default(),
                        })),
                        Err(_) => Err(Error::Protocol(
                            "command did not stop after interrupt; channel poisoned".into(),
                        )),
                    };
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Send the interrupt sequence to the remote PTY.
    pub fn interrupt(&mut self) -> Result<(), Error> {
        let mut seq = Vec::with_capacity(2);
        seq.extend_from_slice(util::CTRL_C);
        seq.extend_from_slice(util::CTRL_C);
        self.chan.send(&seq).map_err(Error::Channel)?;
        Ok(())
    }

    /// After an interrupt, consume the stream until the end marker shows up.
    pub fn drain_to_end(&mut self, grace: Duration) -> Result<i32, Error> {
        let deadline = Instant::now() + grace;

        loop {
            if let ScanResult::Complete { status, consumed, .. } = self.scan_end() {
                let leftovers = self.acc.split_off(consumed);
                self.acc.clear();
                if !leftovers.is_empty() {
                    self.chan.unrecv(&leftovers);
                }
                self.status = Some(status);
                return Ok(status);
            }

            if Instant::now() >= deadline {
                return Err(Error::Protocol("end marker never arrived".into()));
            }

            match self.chan.try_recv(4096) {
                Ok(data) => self.acc.extend_from_slice(&data),
                Err(ChannelError::Blocked) => std::thread::sleep(BACKOFF),
                Err(err) => return Err(Error::Channel(err)),
            }
        }
    }
}

enum ScanResult {
    /// End marker with a parsed status line.
    Complete {
        output_len: usize,
        status: i32,
        consumed: usize,
    },
    /// Marker not present in the accumulator.
    NotFound,
    /// A candidate is at the boundary; read more before deciding.
    NeedMore,
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockChannel;

    fn respond_framed(cmdline: &[u8], output: &[u8], status: i32) -> Vec<u8> {
        // Parse the wrapped command the driver sent and fabricate the remote
        // side of the exchange: echo, blank line, start marker, output, end
        // marker with status.
        let text = String::from_utf8_lossy(cmdline);
        let start = text
            .split("echo ")
            .nth(1)
            .and_then(|s| s.split(';').next())
            .expect("start marker")
            .trim()
            .to_string();
        let end = text
            .rsplit("echo ")
            .next()
            .and_then(|s| s.split(' ').next())
            .expect("end marker")
            .to_string();

        let mut resp = Vec::new();
        resp.extend_from_slice(cmdline); // local echo of the command
        resp.extend_from_slice(b"\n");
        resp.extend_from_slice(format!("{}\n", start).as_bytes());
        resp.extend_from_slice(output);
        resp.extend_from_slice(format!("{} {}\n", end, status).as_bytes());
        resp
    }

    #[test]
    fn framed_output_is_extracted() {
        let mut chan = MockChannel::scripted(|sent| respond_framed(sent, b"uid=0(root)\n", 0));
        let popen = Popen::spawn(&mut chan, "id", None).unwrap();
        let out = popen.wait(None).unwrap();
        assert_eq!(out.stdout, b"uid=0(root)\n");
        assert_eq!(out.status, 0);
    }

    #[test]
    fn status_is_reported_verbatim() {
        let mut chan = MockChannel::scripted(|sent| respond_framed(sent, b"", 127));
        let popen = Popen::spawn(&mut chan, "missing-binary", None).unwrap();
        let out = popen.wait(None).unwrap();
        assert_eq!(out.status, 127);
        assert!(out.stdout.is_empty());
    }

    #[test]
    fn output_without_trailing_newline_is_preserved() {
        let mut chan = MockChannel::scripted(|sent| respond_framed(sent, b"no newline", 0));
        let popen = Popen::spawn(&mut chan, "printf no-newline", None).unwrap();
        let out = popen.wait(None).unwrap();
        assert_eq!(out.stdout, b"no newline");
    }

    #[test]
    fn end_marker_split_across_reads() {
        // Deliver the response in two chunks, splitting inside the end
        // marker itself.
        let mut chan = MockChannel::scripted_chunked(
            |sent| respond_framed(sent, b"partial data here\n", 0),
            17, // small chunk size forces the marker across a boundary
        );
        let popen = Popen::spawn(&mut chan, "cat /tmp/x", None).unwrap();
        let out = popen.wait(None).unwrap();
        assert_eq!(out.stdout, b"partial data here\n");
        assert_eq!(out.status, 0);
    }

    #[test]
    fn framing_isolation_across_sequential_commands() {
        // Two executions on the same channel: each must see exactly its own
        // output.
        let mut chan = MockChannel::scripted(|sent| {
            let text = String::from_utf8_lossy(sent);
            if text.contains("echo one") {
                respond_framed(sent, b"one\n", 0)
            } else {
                respond_framed(sent, b"two\n", 0)
            }
        });

        let out1 = Popen::spawn(&mut chan, "echo one", None)
            .unwrap()
            .wait(None)
            .unwrap();
        let out2 = Popen::spawn(&mut chan, "echo two", None)
            .unwrap()
            .wait(None)
            .unwrap();

        assert_eq!(out1.stdout, b"one\n");
        assert_eq!(out2.stdout, b"two\n");
    }

    #[test]
    fn binary_output_with_nul_bytes_survives() {
        let payload = vec![0u8, 1, 2, 0, 255, 0, 10, 0];
        let expected = payload.clone();
        let mut chan = MockChannel::scripted(move |sent| respond_framed(sent, &payload, 0));
        let popen = Popen::spawn(&mut chan, "cat blob", None).unwrap();
        let out = popen.wait(None).unwrap();
        assert_eq!(out.stdout, expected);
    }
}
