//! redcat is a session runtime for post-exploitation work: it takes a raw
//! bind or reverse shell and turns it into a stable, framed, multiplexed
//! control surface over which enumeration, file transfer and persistence
//! can be scripted.
//!
//! # Overview
//!
//! The stack is layered bottom-up:
//!
//! - **[`channel`]** — uniform byte transports (TCP, TLS, SSH) with
//!   peek/recv/send, framing delimiters, timeouts and non-blocking reads.
//! - **[`listener`]** — background acceptors that queue inbound channels or
//!   promote them straight into sessions.
//! - **[`platform`]** — per-OS drivers. Linux probes the shell, upgrades it
//!   to a PTY and frames every command with unique markers; Windows
//!   bootstraps a reflective stage-two C2 and speaks line-oriented JSON.
//! - **[`session`]** / **[`manager`]** — the multi-target session table and
//!   the interactive terminal loop that switches between raw pass-through
//!   and the local prompt on a single keystroke.
//! - **[`modules`]** — named operations with typed, validated arguments
//!   and streamed results.
//!
//! No async runtime is involved: listeners run on plain threads and the
//! interactive loop is a single-threaded cooperative pump over
//! non-blocking reads, which keeps the channel — the one shared resource
//! in a session — trivially serialized.
//!
//! # Quick start
//!
//! ```no_run
//! use redcat::channel::ChannelSpec;
//! use redcat::config::Config;
//! use redcat::manager::Manager;
//! use redcat::platform::PlatformKind;
//!
//! let mut manager = Manager::new(Config::default()).unwrap();
//! let spec = ChannelSpec {
//!     host: Some("10.0.0.2".into()),
//!     port: Some(4444),
//!     ..Default::default()
//! };
//! let session = manager.create_session(PlatformKind::Linux, &spec).unwrap();
//! println!("session {} established", session);
//! manager.interactive();
//! ```

pub mod channel;
pub mod config;
pub mod facts;
pub mod gtfobins;
pub mod listener;
pub mod logging;
pub mod manager;
pub mod modules;
pub mod platform;
pub mod session;
pub mod subprocess;
pub mod target;
pub mod terminal;
pub mod util;

#[cfg(test)]
pub(crate) mod testing;

pub use redcat_internal::error::{ChannelError, Error};
