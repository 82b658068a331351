//! Local terminal control for raw pass-through.
//!
//! Raw mode is entered when the manager binds the keyboard directly to a
//! session channel and must be reliably restored no matter how the loop
//! exits, so the saved state lives in an RAII guard.

use std::io::Read;
use std::os::fd::AsFd;

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::termios::{cfmakeraw, tcgetattr, tcsetattr, SetArg, Termios};

/// Saved terminal state; dropping the guard restores it.
pub struct RawMode {
    saved: Termios,
    saved_flags: OFlag,
}

impl RawMode {
    /// Switch the controlling terminal to raw, non-blocking mode.
    pub fn enter() -> std::io::Result<RawMode> {
        let stdin = std::io::stdin();
        let saved = tcgetattr(stdin.as_fd()).map_err(std::io::Error::from)?;

        let mut raw = saved.clone();
        cfmakeraw(&mut raw);
        tcsetattr(stdin.as_fd(), SetArg::TCSADRAIN, &raw).map_err(std::io::Error::from)?;

        let bits = fcntl(stdin.as_fd(), FcntlArg::F_GETFL).map_err(std::io::Error::from)?;
        let saved_flags = OFlag::from_bits_retain(bits);
        fcntl(
            stdin.as_fd(),
            FcntlArg::F_SETFL(saved_flags | OFlag::O_NONBLOCK),
        )
        .map_err(std::io::Error::from)?;

        Ok(RawMode { saved, saved_flags })
    }

    /// Non-blocking read of pending keyboard bytes. `Ok(None)` means no
    /// input is available right now.
    pub fn read_input(&self, buf: &mut [u8]) -> std::io::Result<Option<usize>> {
        match std::io::stdin().read(buf) {
            Ok(0) => Ok(None),
            Ok(n) => Ok(Some(n)),
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl Drop for RawMode {
    fn drop(&mut self) {
        let stdin = std::io::stdin();
        let _ = tcsetattr(stdin.as_fd(), SetArg::TCSADRAIN, &self.saved);
        let _ = fcntl(stdin.as_fd(), FcntlArg::F_SETFL(self.saved_flags));
    }
}

/// Size of the controlling terminal as `(columns, rows)`.
///
/// `COLUMNS`/`ROWS` from the environment win when both are set (this is also
/// what gets synchronized to the remote PTY); otherwise the kernel is asked
/// directly.
pub fn window_size() -> Option<(u16, u16)> {
    if let (Ok(cols), Ok(rows)) = (std::env::var("COLUMNS"), std::env::var("ROWS")) {
        if let (Ok(cols), Ok(rows)) = (cols.parse(), rows.parse()) {
            return Some((cols, rows));
        }
    }

    unsafe {
        let mut ws: nix::libc::winsize = std::mem::zeroed();
        if nix::libc::ioctl(0, nix::libc::TIOCGWINSZ, &mut ws) == 0 && ws.ws_col > 0 {
            return Some((ws.ws_col, ws.ws_row));
        }
    }

    None
}

/// The TERM value to propagate to the remote side.
pub fn term_name() -> String {
    std::env::var("TERM").unwrap_or_else(|_| "xterm".to_string())
}
