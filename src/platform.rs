//! Platform drivers: the OS-specific state machines that turn a raw channel
//! into POSIX-like primitives.
//!
//! A platform owns its channel for the lifetime of the session. The two
//! concrete drivers are wildly different internally (Linux drives a shell
//! through framed execution, Windows speaks a JSON RPC to a stage-two C2)
//! but expose the same primitive surface through this enum.

use std::time::Duration;

use redcat_internal::error::Error;
use serde::{Deserialize, Serialize};

use crate::channel::Channel;
use crate::config::Config;
use crate::facts::{Group, User};
use crate::subprocess::Output;

pub mod linux;
pub mod windows;

pub use linux::Linux;
pub use windows::Windows;

/// Which driver a session uses. Stored in the target database and used to
/// match modules against sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlatformKind {
    Linux,
    Windows,
}

impl PlatformKind {
    pub fn name(&self) -> &'static str {
        match self {
            PlatformKind::Linux => "linux",
            PlatformKind::Windows => "windows",
        }
    }
}

impl std::str::FromStr for PlatformKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<PlatformKind, Error> {
        match s {
            "linux" => Ok(PlatformKind::Linux),
            "windows" => Ok(PlatformKind::Windows),
            other => Err(Error::Argument(format!("{}: unknown platform", other))),
        }
    }
}

impl std::fmt::Display for PlatformKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// What `process_output` decided about a chunk of remote output during
/// interactive pass-through.
#[derive(Debug, PartialEq, Eq)]
pub enum OutputEvent {
    /// Write these bytes to the local terminal.
    Data(Vec<u8>),
    /// The remote interactive surface ended; write the bytes, then leave
    /// raw mode.
    InteractiveComplete(Vec<u8>),
}

/// Service manager operations (SystemD introspection on Linux).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceOp {
    Status,
    Start,
    Stop,
    Restart,
}

impl ServiceOp {
    pub fn verb(&self) -> &'static str {
        match self {
            ServiceOp::Status => "status",
            ServiceOp::Start => "start",
            ServiceOp::Stop => "stop",
            ServiceOp::Restart => "restart",
        }
    }
}

/// A platform bound to a channel.
pub enum Platform {
    Linux(Linux),
    Windows(Windows),
}

/// A readable remote file handle.
pub enum RemoteReader<'p> {
    Linux(linux::FileReader<'p>),
    Windows(windows::FileHandle<'p>),
}

/// A writable remote file handle. Must be closed explicitly for the write
/// to be committed and the channel state drained.
pub enum RemoteWriter<'p> {
    Linux(linux::FileWriter<'p>),
    Windows(windows::FileHandle<'p>),
}

impl std::io::Read for RemoteReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            RemoteReader::Linux(f) => std::io::Read::read(f, buf),
            RemoteReader::Windows(f) => std::io::Read::read(f, buf),
        }
    }
}

impl RemoteReader<'_> {
    /// Read to end and release the handle.
    pub fn read_all(mut self) -> Result<Vec<u8>, Error> {
        let mut data = Vec::new();
        std::io::Read::read_to_end(&mut self, &mut data)
            .map_err(|e| Error::Protocol(format!("remote read: {}", e)))?;
        self.close()?;
        Ok(data)
    }

    pub fn close(self) -> Result<(), Error> {
        match self {
            RemoteReader::Linux(f) => f.close(),
            RemoteReader::Windows(f) => f.close(),
        }
    }
}

impl std::io::Write for RemoteWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            RemoteWriter::Linux(f) => std::io::Write::write(f, buf),
            RemoteWriter::Windows(f) => std::io::Write::write(f, buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl RemoteWriter<'_> {
    /// Terminate the transfer: flushes encoder state, sends the exit
    /// command and drains the end-of-stream markers from the channel.
    pub fn close(self) -> Result<(), Error> {
        match self {
            RemoteWriter::Linux(f) => f.close(),
            RemoteWriter::Windows(f) => f.close(),
        }
    }
}

impl Platform {
    /// Probe the channel and bring up the matching driver. This is the
    /// blocking half of session establishment: for Linux it runs the shell
    /// probe and normalization, for Windows it bootstraps the stage-two C2.
    pub fn establish(
        kind: PlatformKind,
        channel: Box<dyn Channel>,
        config: &Config,
    ) -> Result<Platform, Error> {
        match kind {
            PlatformKind::Linux => Ok(Platform::Linux(Linux::establish(channel, config)?)),
            PlatformKind::Windows => Ok(Platform::Windows(Windows::establish(channel, config)?)),
        }
    }

    pub fn kind(&self) -> PlatformKind {
        match self {
            Platform::Linux(_) => PlatformKind::Linux,
            Platform::Windows(_) => PlatformKind::Windows,
        }
    }

    pub fn channel_mut(&mut self) -> &mut dyn Channel {
        match self {
            Platform::Linux(p) => p.channel_mut(),
            Platform::Windows(p) => p.channel_mut(),
        }
    }

    /// Whether the session is currently in raw pass-through mode.
    pub fn is_interactive(&self) -> bool {
        match self {
            Platform::Linux(p) => p.is_interactive(),
            Platform::Windows(p) => p.is_interactive(),
        }
    }

    /// Toggle between raw pass-through and programmatic mode.
    pub fn set_interactive(&mut self, value: bool) -> Result<(), Error> {
        match self {
            Platform::Linux(p) => p.set_interactive(value),
            Platform::Windows(p) => p.set_interactive(value),
        }
    }

    /// Filter remote output while interactive; detects the end-of-
    /// interactive marker on Windows.
    pub fn process_output(&mut self, data: &[u8]) -> OutputEvent {
        match self {
            Platform::Linux(p) => p.process_output(data),
            Platform::Windows(p) => p.process_output(data),
        }
    }

    /// Execute a command and collect its output and exit status.
    pub fn run(
        &mut self,
        argv: &[String],
        env: Option<&[(String, String)]>,
        timeout: Option<Duration>,
    ) -> Result<Output, Error> {
        match self {
            Platform::Linux(p) => p.run(argv, env, timeout),
            Platform::Windows(p) => p.run(argv, timeout),
        }
    }

    /// Locate a binary on the remote PATH. Cached per session.
    pub fn which(&mut self, name: &str) -> Result<Option<String>, Error> {
        match self {
            Platform::Linux(p) => Ok(p.which(name)),
            Platform::Windows(p) => p.which(name),
        }
    }

    pub fn whoami(&mut self) -> Result<String, Error> {
        match self {
            Platform::Linux(p) => p.whoami(),
            Platform::Windows(p) => p.whoami(),
        }
    }

    pub fn users(&mut self) -> Result<Vec<User>, Error> {
        match self {
            Platform::Linux(p) => p.users(),
            Platform::Windows(p) => p.users(),
        }
    }

    pub fn groups(&mut self) -> Result<Vec<Group>, Error> {
        match self {
            Platform::Linux(p) => p.groups(),
            Platform::Windows(p) => p.groups(),
        }
    }

    pub fn current_user(&mut self) -> Result<User, Error> {
        match self {
            Platform::Linux(p) => p.current_user(),
            Platform::Windows(p) => p.current_user(),
        }
    }

    pub fn getenv(&mut self, name: &str) -> Result<String, Error> {
        match self {
            Platform::Linux(p) => p.getenv(name),
            Platform::Windows(p) => p.getenv(name),
        }
    }

    pub fn chdir(&mut self, path: &str) -> Result<String, Error> {
        match self {
            Platform::Linux(p) => p.chdir(path),
            Platform::Windows(p) => p.chdir(path),
        }
    }

    pub fn cwd(&self) -> &str {
        match self {
            Platform::Linux(p) => p.cwd(),
            Platform::Windows(p) => p.cwd(),
        }
    }

    pub fn hostname(&mut self) -> Result<String, Error> {
        match self {
            Platform::Linux(p) => p.hostname(),
            Platform::Windows(p) => p.hostname(),
        }
    }

    /// Stable identifier for the host behind this channel, independent of
    /// the connection method.
    pub fn host_id(&mut self) -> Result<String, Error> {
        match self {
            Platform::Linux(p) => p.host_id(),
            Platform::Windows(p) => Ok(p.host_id()),
        }
    }

    pub fn open_read(&mut self, path: &str) -> Result<RemoteReader<'_>, Error> {
        match self {
            Platform::Linux(p) => Ok(RemoteReader::Linux(p.open_read(path)?)),
            Platform::Windows(p) => Ok(RemoteReader::Windows(p.open_read(path)?)),
        }
    }

    pub fn open_write(
        &mut self,
        path: &str,
        length: Option<u64>,
    ) -> Result<RemoteWriter<'_>, Error> {
        match self {
            Platform::Linux(p) => Ok(RemoteWriter::Linux(p.open_write(path, length)?)),
            Platform::Windows(p) => Ok(RemoteWriter::Windows(p.open_write(path)?)),
        }
    }

    /// Send the platform's interrupt sequence to abort the foreground
    /// command.
    pub fn interrupt(&mut self) -> Result<(), Error> {
        match self {
            Platform::Linux(p) => p.interrupt(),
            Platform::Windows(p) => p.interrupt(),
        }
    }

    /// Ask the remote side to exit cleanly. Called during session close.
    pub fn exit(&mut self) {
        match self {
            Platform::Linux(p) => p.exit(),
            Platform::Windows(p) => p.exit(),
        }
    }

    /// True once a protocol error has made the channel unusable.
    pub fn poisoned(&self) -> bool {
        match self {
            Platform::Linux(p) => p.poisoned(),
            Platform::Windows(p) => p.poisoned(),
        }
    }
}
