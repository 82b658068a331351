//! The Linux driver: turns an arbitrary inbound shell into a framed,
//! PTY-backed, programmatically addressable session.
//!
//! Establishment runs in phases: wake the shell, disable history, identify
//! the shell binary, upgrade weak shells, normalize `PATH`, and take a UID
//! snapshot. The PTY upgrade ladder runs lazily the first time interactive
//! mode is requested (an SSH channel already has a PTY and skips it).
//!
//! All programmatic execution goes through [`crate::subprocess::Popen`]
//! framing; raw pass-through and framed execution are mutually exclusive,
//! enforced by the `interactive` flag.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use redcat_internal::error::Error;
use sha2::{Digest, Sha256};

use crate::channel::{Channel, ChannelExt};
use crate::config::Config;
use crate::facts::{Group, User};
use crate::gtfobins::{BuildParams, Capability, GtfoDb, Stream, StreamSet};
use crate::platform::{OutputEvent, ServiceOp};
use crate::subprocess::{Output, Popen};
use crate::{terminal, util};

/// Shells that exit on any stdin. Driving one of these would close the
/// channel, so establishment refuses them outright.
const HOSTILE_SHELLS: &[&str] = &["nologin", "false", "sync", "git-shell"];

/// Shells worth upgrading away from when something better is installed.
const WEAK_SHELLS: &[&str] = &["sh", "dash"];
const BETTER_SHELLS: &[&str] = &["bash", "zsh", "ksh", "fish"];

/// Directories that should always be on the remote PATH.
const WANTED_PATHS: &[&str] = &[
    "/bin",
    "/usr/bin",
    "/usr/local/bin",
    "/sbin",
    "/usr/sbin",
    "/usr/local/sbin",
];

/// Which PTY spawn method succeeded for this session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PtyMethod {
    ScriptUtilLinux,
    ScriptBsd,
    Python,
    Socat,
    None,
}

pub struct Linux {
    chan: Box<dyn Channel>,
    pub shell: String,
    pub has_pty: bool,
    pub pty_method: PtyMethod,
    /// 64 random hex characters identifying this session's prompt on the
    /// byte stream. Embedded invisibly (SGR conceal) so it never renders.
    prompt_marker: String,
    interactive: bool,
    poisoned: bool,
    which_cache: HashMap<String, Option<String>>,
    uid: String,
    username: String,
    cwd: String,
    cached_host_id: Option<String>,
    normalize_exit: bool,
    default_deadline: Option<Duration>,
}

impl Linux {
    /// Probe and normalize the remote shell. See the module docs for the
    /// phase ordering.
    pub fn establish(channel: Box<dyn Channel>, config: &Config) -> Result<Linux, Error> {
        let mut platform = Linux {
            chan: channel,
            shell: String::new(),
            has_pty: false,
            pty_method: PtyMethod::None,
            prompt_marker: util::random_hex(64),
            interactive: false,
            poisoned: false,
            which_cache: HashMap::new(),
            uid: String::new(),
            username: String::new(),
            cwd: String::from("/"),
            cached_host_id: None,
            normalize_exit: config.normalize_exit_status,
            default_deadline: config.default_deadline(),
        };

        // Wake the shell with a no-op and discard any banner it prints.
        platform.chan.sendline(b"").map_err(Error::Channel)?;
        let _ = platform
            .chan
            .peek(4096, Some(Duration::from_millis(500)));
        platform.chan.drain().map_err(Error::Channel)?;

        platform.disable_history()?;
        platform.detect_shell()?;
        platform.upgrade_shell()?;
        platform.normalize_path()?;

        platform.has_pty = platform.run_shell("[ -t 1 ]", None)?.status == 0;
        if platform.has_pty {
            log::info!("remote shell already has a pty");
        }

        platform.refresh_uid()?;
        platform.cwd = platform.run_shell("pwd", None)?.stdout_utf8().trim().to_string();

        Ok(platform)
    }

    pub fn channel_mut(&mut self) -> &mut dyn Channel {
        self.chan.as_mut()
    }

    pub fn is_interactive(&self) -> bool {
        self.interactive
    }

    pub fn poisoned(&self) -> bool {
        self.poisoned
    }

    pub fn cwd(&self) -> &str {
        &self.cwd
    }

    /// The invisible per-session prompt marker.
    pub fn prompt_marker(&self) -> &str {
        &self.prompt_marker
    }

    /// Execute a shell command under framing and collect the result.
    pub fn run_shell(&mut self, command: &str, timeout: Option<Duration>) -> Result<Output, Error> {
        if self.interactive {
            return Err(Error::Busy(
                "cannot run framed command while raw pass-through is active".into(),
            ));
        }
        if self.poisoned {
            return Err(Error::Platform("channel is poisoned".into()));
        }

        let timeout = timeout.or(self.default_deadline);
        let popen = Popen::spawn(self.chan.as_mut(), command, None)?;
        let result = popen.wait(timeout);

        match result {
            Ok(mut output) => {
                if self.normalize_exit && output.status != 0 {
                    output.status = 1;
                }
                Ok(output)
            }
            Err(err) => {
                if matches!(err, Error::Protocol(_)) {
                    self.poisoned = true;
                }
                Err(err)
            }
        }
    }

    /// Execute an argv, optionally under a clean environment, and collect
    /// stdout and the exit status.
    pub fn run(
        &mut self,
        argv: &[String],
        env: Option<&[(String, String)]>,
        timeout: Option<Duration>,
    ) -> Result<Output, Error> {
        let mut command = util::join(argv);

        if let Some(env) = env {
            let pairs = env
                .iter()
                .map(|(k, v)| format!("{}={}", k, util::quote(v)))
                .collect::<Vec<_>>()
                .join(" ");
            command = format!("env -i {} {}", pairs, command);
        }

        self.run_shell(&command, timeout)
    }

    /// Start a process and return the framed handle. The handle borrows the
    /// channel, so no other platform operation is possible until it is
    /// consumed — which is exactly the protocol invariant.
    pub fn popen(
        &mut self,
        command: &str,
        bootstrap_input: Option<&[u8]>,
    ) -> Result<Popen<'_>, Error> {
        if self.interactive {
            return Err(Error::Busy(
                "cannot open process while raw pass-through is active".into(),
            ));
        }
        if self.poisoned {
            return Err(Error::Platform("channel is poisoned".into()));
        }

        Popen::spawn(self.chan.as_mut(), command, bootstrap_input)
    }

    fn disable_history(&mut self) -> Result<(), Error> {
        self.run_shell(
            "unset HISTFILE; export HISTCONTROL=ignorespace; export HISTSIZE=0; unset PROMPT_COMMAND",
            None,
        )?;
        Ok(())
    }

    /// Resolve the shell binary via `/proc/<pid>/exe`, falling back to
    /// `$SHELL`. Refuses shells that exit on stdin.
    fn detect_shell(&mut self) -> Result<(), Error> {
        let pid = self.run_shell("echo $$", None)?.stdout_utf8().trim().to_string();

        let mut shell = String::new();
        if !pid.is_empty() {
            let out = self.run_shell(&format!("readlink /proc/{}/exe", pid), None)?;
            if out.success() {
                shell = out.stdout_utf8().trim().to_string();
            }
        }

        if shell.is_empty() {
            shell = self.getenv("SHELL")?.trim().to_string();
        }
        if shell.is_empty() {
            shell = "/bin/sh".to_string();
        }

        let base = basename(&shell);
        if HOSTILE_SHELLS.contains(&base) {
            return Err(Error::Platform(format!(
                "{}: shell exits on any input; refusing to drive it",
                shell
            )));
        }

        log::info!("remote shell is {}", shell);
        self.shell = shell;
        Ok(())
    }

    /// Swap a bare `sh`/`dash` for a more capable shell when one exists.
    fn upgrade_shell(&mut self) -> Result<(), Error> {
        if !WEAK_SHELLS.contains(&basename(&self.shell)) {
            return Ok(());
        }

        for candidate in BETTER_SHELLS {
            if let Some(path) = self.which(candidate) {
                log::info!("upgrading from {} to {}", self.shell, path);
                self.chan
                    .sendline(format!(" exec {}", path).as_bytes())
                    .map_err(Error::Channel)?;
                std::thread::sleep(Duration::from_millis(500));
                self.chan.drain().map_err(Error::Channel)?;
                self.shell = path;
                // the new shell re-enables history
                self.disable_history()?;
                break;
            }
        }

        Ok(())
    }

    fn normalize_path(&mut self) -> Result<(), Error> {
        let current = self.getenv("PATH")?;
        let mut parts: Vec<&str> = current.split(':').filter(|p| !p.is_empty()).collect();

        let mut changed = false;
        for wanted in WANTED_PATHS {
            if !parts.contains(wanted) {
                parts.push(wanted);
                changed = true;
            }
        }

        if changed {
            log::info!("normalizing shell PATH");
            let joined = parts.join(":");
            self.run_shell(&format!("export PATH={}", util::quote(&joined)), None)?;
            self.which_cache.clear();
        }

        Ok(())
    }

    pub fn getenv(&mut self, name: &str) -> Result<String, Error> {
        let out = self.run_shell(&format!("echo \"${}\"", name), None)?;
        let mut value = out.stdout_utf8();
        if value.ends_with('\n') {
            value.pop();
        }
        Ok(value)
    }

    pub fn setenv(&mut self, name: &str, value: &str) -> Result<(), Error> {
        self.run_shell(&format!("export {}={}", name, util::quote(value)), None)?;
        Ok(())
    }

    /// Locate a binary. Results (including misses) are cached per session.
    pub fn which(&mut self, name: &str) -> Option<String> {
        if let Some(cached) = self.which_cache.get(name) {
            return cached.clone();
        }

        let resolved = self.which_uncached(name);
        self.which_cache.insert(name.to_string(), resolved.clone());
        resolved
    }

    fn which_uncached(&mut self, name: &str) -> Option<String> {
        // `command -v` is a builtin everywhere we care about; fall back to a
        // manual PATH walk for shells where it misbehaves.
        if let Ok(out) = self.run_shell(&format!("command -v {}", util::quote(name)), None) {
            if out.success() {
                let path = out.stdout_utf8().trim().to_string();
                if path.starts_with('/') {
                    return Some(path);
                }
            }
        }

        let walk = format!(
            r#"IFS=:; for __d in $PATH; do [ -x "$__d/{name}" ] && {{ echo "$__d/{name}"; break; }}; done"#,
            name = name
        );
        if let Ok(out) = self.run_shell(&walk, None) {
            let path = out.stdout_utf8().trim().to_string();
            if path.starts_with('/') {
                return Some(path);
            }
        }

        None
    }

    pub fn refresh_uid(&mut self) -> Result<(), Error> {
        self.uid = self.run_shell("id -u", None)?.stdout_utf8().trim().to_string();
        self.username = self.run_shell("id -un", None)?.stdout_utf8().trim().to_string();
        Ok(())
    }

    pub fn whoami(&mut self) -> Result<String, Error> {
        let out = self.run_shell("whoami", None)?;
        if !out.success() {
            return Err(Error::NotFound("whoami".into()));
        }
        Ok(out.stdout_utf8().trim().to_string())
    }

    pub fn hostname(&mut self) -> Result<String, Error> {
        let out = self.run_shell("hostname -f 2>/dev/null || cat /etc/hostname", None)?;
        Ok(out.stdout_utf8().trim().to_string())
    }

    /// Stable host identifier: a 32-hex-character digest over the
    /// distribution identity, kernel release and the MAC address set. The
    /// same host yields the same id regardless of connection method.
    pub fn host_id(&mut self) -> Result<String, Error> {
        if let Some(id) = &self.cached_host_id {
            return Ok(id.clone());
        }

        let distro = self
            .run_shell("head -n2 /etc/os-release 2>/dev/null", None)?
            .stdout_utf8();
        let kernel = self.run_shell("uname -r", None)?.stdout_utf8();
        let macs = self
            .run_shell("cat /sys/class/net/*/address 2>/dev/null | sort", None)?
            .stdout_utf8();

        let mut hasher = Sha256::new();
        hasher.update(distro.as_bytes());
        hasher.update(kernel.as_bytes());
        hasher.update(macs.as_bytes());
        let digest = hasher.finalize();

        let id: String = digest
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect::<String>()[..32]
            .to_string();

        self.cached_host_id = Some(id.clone());
        Ok(id)
    }

    pub fn users(&mut self) -> Result<Vec<User>, Error> {
        let out = self.run_shell("cat /etc/passwd", None)?;
        if !out.success() {
            return Err(Error::Permission("/etc/passwd".into()));
        }

        let mut users = Vec::new();
        for line in out.stdout_utf8().lines() {
            let fields: Vec<&str> = line.split(':').collect();
            if fields.len() < 7 {
                continue;
            }
            users.push(User {
                name: fields[0].to_string(),
                id: fields[2].to_string(),
                group_id: Some(fields[3].to_string()),
                home: Some(fields[5].to_string()),
                shell: Some(fields[6].to_string()),
            });
        }
        Ok(users)
    }

    pub fn groups(&mut self) -> Result<Vec<Group>, Error> {
        let out = self.run_shell("cat /etc/group", None)?;
        if !out.success() {
            return Err(Error::Permission("/etc/group".into()));
        }

        let mut groups = Vec::new();
        for line in out.stdout_utf8().lines() {
            let fields: Vec<&str> = line.split(':').collect();
            if fields.len() < 4 {
                continue;
            }
            groups.push(Group {
                name: fields[0].to_string(),
                id: fields[2].to_string(),
                members: fields[3]
                    .split(',')
                    .filter(|m| !m.is_empty())
                    .map(str::to_string)
                    .collect(),
            });
        }
        Ok(groups)
    }

    pub fn current_user(&mut self) -> Result<User, Error> {
        let uid = self.uid.clone();
        let users = self.users()?;
        if let Some(user) = users.into_iter().find(|u| u.id == uid) {
            return Ok(user);
        }

        // Not listed in /etc/passwd (e.g. an LDAP user); synthesize.
        Ok(User {
            id: uid,
            name: self.username.clone(),
            group_id: None,
            home: None,
            shell: Some(self.shell.clone()),
        })
    }

    pub fn chdir(&mut self, path: &str) -> Result<String, Error> {
        let out = self.run_shell(&format!("cd {} && pwd", util::quote(path)), None)?;
        if !out.success() {
            return Err(Error::NotFound(path.to_string()));
        }

        let old = std::mem::replace(&mut self.cwd, out.stdout_utf8().trim().to_string());
        Ok(old)
    }

    /// Create a remote temporary file and return its path.
    pub fn tempfile(&mut self) -> Result<String, Error> {
        let out = self.run_shell("mktemp 2>/dev/null", None)?;
        if out.success() {
            let path = out.stdout_utf8().trim().to_string();
            if !path.is_empty() {
                return Ok(path);
            }
        }

        let path = format!("/tmp/.{}", util::random_string(8));
        let out = self.run_shell(&format!("touch {}", util::quote(&path)), None)?;
        if !out.success() {
            return Err(Error::Permission(path));
        }
        Ok(path)
    }

    /// SystemD introspection; `NotFound` when systemctl is unavailable.
    pub fn service(&mut self, name: &str, op: ServiceOp) -> Result<Output, Error> {
        let systemctl = self
            .which("systemctl")
            .ok_or_else(|| Error::NotFound("systemctl".into()))?;
        self.run(
            &[
                systemctl,
                op.verb().to_string(),
                name.to_string(),
                "--no-pager".to_string(),
            ],
            None,
            None,
        )
    }

    /// Spawn a PTY around the current shell, preferring util-linux `script`,
    /// then BSD `script`, then python's pty module, then socat. Surrender
    /// (with a warning) when none is available.
    pub fn get_pty(&mut self) -> Result<(), Error> {
        if self.has_pty {
            return Ok(());
        }

        let shell = self.shell.clone();
        let (command, method) = if let Some(script) = self.which("script") {
            // util-linux script supports --version; BSD script does not
            let util_linux = self
                .run_shell("script --version >/dev/null 2>&1", None)?
                .success();
            if util_linux {
                (
                    format!(" exec {} -qc {} /dev/null 2>&1", script, shell),
                    PtyMethod::ScriptUtilLinux,
                )
            } else {
                (
                    format!(" exec {} -q /dev/null {} 2>&1", script, shell),
                    PtyMethod::ScriptBsd,
                )
            }
        } else if let Some(python) = ["python3", "python", "python2"]
            .iter()
            .find_map(|p| self.which(p))
        {
            (
                format!(
                    " exec {} -c 'import pty; pty.spawn(\"{}\")' 2>&1",
                    python, shell
                ),
                PtyMethod::Python,
            )
        } else if let Some(socat) = self.which("socat") {
            (
                format!(
                    " exec {} exec:{},pty,stderr,setsid,sigint,sane - 2>&1",
                    socat, shell
                ),
                PtyMethod::Socat,
            )
        } else {
            log::warn!("no pty method available; continuing without a pty");
            self.pty_method = PtyMethod::None;
            return Ok(());
        };

        log::info!("spawning pty: {}", command.trim());
        self.chan.sendline(command.as_bytes()).map_err(Error::Channel)?;
        std::thread::sleep(Duration::from_millis(500));
        self.chan.drain().map_err(Error::Channel)?;

        // Raw mode stops the new tty from mangling framed output; the size
        // sync keeps full-screen programs usable.
        let (cols, rows) = terminal::window_size().unwrap_or((80, 24));
        self.run_shell(
            &format!("stty raw -echo; stty rows {} columns {}", rows, cols),
            None,
        )?;
        self.setenv("TERM", &terminal::term_name())?;

        if self.run_shell("[ -t 1 ]", None)?.status == 0 {
            self.has_pty = true;
            self.pty_method = method;
            log::info!("pty spawned via {:?}", method);
        } else {
            log::warn!("pty spawn failed; continuing without a pty");
            self.pty_method = PtyMethod::None;
        }

        Ok(())
    }

    /// The PS1 value for interactive mode: an invisible session marker
    /// followed by a visually distinct prompt in the dialect of the remote
    /// shell. Dash ignores the readline `\[..\]` escapes, which is why the
    /// marker relies on SGR conceal codes instead.
    fn prompt_ps1(&self) -> String {
        let marker = format!("\x1b[8m{}\x1b[28m", self.prompt_marker);

        match basename(&self.shell) {
            "zsh" => format!("'{}%F{{red}}(remote)%f %n@%m:%~$ '", marker),
            "sh" | "dash" => format!(
                r#"'$(command printf "{}(remote) $(whoami)@$(hostname):$PWD\$ ")'"#,
                marker
            ),
            _ => format!(
                r#"'$(command printf "{}\033[01;31m(remote)\033[0m \033[01;33m$(whoami)@$(hostname)\033[0m:\033[1;36m$PWD\033[0m\$ ")'"#,
                marker
            ),
        }
    }

    /// Toggle raw pass-through. Entering ensures a PTY, restores sane tty
    /// settings, synchronizes the window size and exports the marker
    /// prompt. Leaving disables echo and clears the prompt so framed
    /// execution sees a quiet stream.
    pub fn set_interactive(&mut self, value: bool) -> Result<(), Error> {
        if value == self.interactive {
            return Ok(());
        }

        if value {
            self.get_pty()?;
            self.chan.drain().map_err(Error::Channel)?;

            let (cols, rows) = terminal::window_size().unwrap_or((80, 24));
            let command = format!(
                " stty sane; stty rows {} columns {}; export TERM={}; export PS1={}\n",
                rows,
                cols,
                util::quote(&terminal::term_name()),
                self.prompt_ps1()
            );
            self.chan.send(command.as_bytes()).map_err(Error::Channel)?;

            // If echo is still on, swallow the reflected command so it does
            // not splatter over the user's terminal.
            if let Ok(peeked) = self.chan.peek(command.len(), Some(Duration::from_millis(500))) {
                if peeked.windows(4).any(|w| w == b"stty") {
                    let _ = self.chan.recvline(Some(Duration::from_millis(500)));
                }
            }

            self.interactive = true;
        } else {
            self.chan
                .send(b" stty -echo nl lnext ^V; export PS1=\n")
                .map_err(Error::Channel)?;
            std::thread::sleep(Duration::from_millis(100));
            self.chan.drain().map_err(Error::Channel)?;
            self.interactive = false;

            // The user may have changed shells while interactive.
            if let Ok(out) = self.run_shell("readlink /proc/$$/exe", None) {
                let shell = out.stdout_utf8().trim().to_string();
                if out.success() && !shell.is_empty() && shell != self.shell {
                    self.shell = shell;
                }
            }
            let _ = self.refresh_uid();
        }

        Ok(())
    }

    /// Interactive output is passed through unmodified on Linux.
    pub fn process_output(&mut self, data: &[u8]) -> OutputEvent {
        OutputEvent::Data(data.to_vec())
    }

    pub fn interrupt(&mut self) -> Result<(), Error> {
        self.chan.send(util::CTRL_C).map_err(Error::Channel)?;
        Ok(())
    }

    pub fn exit(&mut self) {
        let _ = self.chan.send(b"exit\n");
    }

    /// Open a remote file for reading, selecting a GTFO read method.
    pub fn open_read(&mut self, path: &str) -> Result<FileReader<'_>, Error> {
        if !self.run_shell(&format!("test -e {}", util::quote(path)), None)?.success() {
            return Err(Error::NotFound(path.to_string()));
        }
        if !self.run_shell(&format!("test -r {}", util::quote(path)), None)?.success() {
            return Err(Error::Permission(path.to_string()));
        }

        let (payload, input, exit_cmd, stream) =
            self.select_method(Capability::READ, StreamSet::ANY, path, None)?;

        let popen = self.popen(&payload, Some(&input))?;

        Ok(FileReader {
            popen,
            exit_cmd,
            decoder: Decoder::new(stream),
            decoded: Vec::new(),
            done: false,
        })
    }

    /// Open a remote file for writing. A known length enables the raw
    /// stream writer; otherwise the transfer is base64 (or another encoded
    /// stream) through a remote decoder.
    pub fn open_write(&mut self, path: &str, length: Option<u64>) -> Result<FileWriter<'_>, Error> {
        let quoted = util::quote(path);
        let exists = self.run_shell(&format!("test -e {}", quoted), None)?.success();
        if exists {
            if !self.run_shell(&format!("test -w {}", quoted), None)?.success() {
                return Err(Error::Permission(path.to_string()));
            }
        } else {
            let parent = match path.rsplit_once('/') {
                Some(("", _)) => "/".to_string(),
                Some((parent, _)) => parent.to_string(),
                None => ".".to_string(),
            };
            let quoted_parent = util::quote(&parent);
            if !self.run_shell(&format!("test -d {}", quoted_parent), None)?.success() {
                return Err(Error::NotFound(parent));
            }
            if !self.run_shell(&format!("test -w {}", quoted_parent), None)?.success() {
                return Err(Error::Permission(parent));
            }
        }

        // With a known length a raw writer is ideal; without one we need an
        // encoded stream so the remote decoder can find the end of data.
        let streams = if length.is_some() {
            StreamSet::RAW | StreamSet::BASE64 | StreamSet::PRINT | StreamSet::HEX
        } else {
            StreamSet::BASE64 | StreamSet::PRINT | StreamSet::HEX
        };

        let (payload, input, exit_cmd, stream) =
            self.select_method(Capability::WRITE, streams, path, length)?;

        let popen = self.popen(&payload, Some(&input))?;

        Ok(FileWriter {
            popen,
            exit_cmd,
            encoder: Encoder::new(stream),
            closed: false,
        })
    }

    /// Resolve the first applicable GTFO method and build its payload.
    fn select_method(
        &mut self,
        caps: Capability,
        streams: StreamSet,
        path: &str,
        length: Option<u64>,
    ) -> Result<(String, Vec<u8>, Vec<u8>, Stream), Error> {
        let db = GtfoDb::new();

        for wrapper in db.iter_methods(caps, streams, |name| self.which(name)) {
            let params = BuildParams {
                lfile: path.to_string(),
                length,
            };
            if let Ok(built) = wrapper.build(&params) {
                return Ok((built.payload, built.input, built.exit_cmd, wrapper.stream()));
            }
        }

        Err(Error::NotFound("no applicable gtfo method on target".into()))
    }
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

// ---------------------------------------------------------------------------
// file streams

/// Incremental decoder for the read-side streams.
enum Decoder {
    Passthrough,
    Base64 { carry: Vec<u8> },
    Hex { carry: Vec<u8> },
}

impl Decoder {
    fn new(stream: Stream) -> Decoder {
        match stream {
            Stream::Raw | Stream::Print => Decoder::Passthrough,
            Stream::Base64 => Decoder::Base64 { carry: Vec::new() },
            Stream::Hex => Decoder::Hex { carry: Vec::new() },
        }
    }

    fn push(&mut self, data: &[u8], out: &mut Vec<u8>) -> Result<(), Error> {
        match self {
            Decoder::Passthrough => {
                out.extend_from_slice(data);
                Ok(())
            }
            Decoder::Base64 { carry } => {
                carry.extend(data.iter().filter(|b| !b" \t\r\n".contains(*b)));
                let usable = carry.len() - carry.len() % 4;
                if usable > 0 {
                    let chunk: Vec<u8> = carry.drain(..usable).collect();
                    let decoded = BASE64
                        .decode(&chunk)
                        .map_err(|e| Error::Protocol(format!("base64 stream: {}", e)))?;
                    out.extend_from_slice(&decoded);
                }
                Ok(())
            }
            Decoder::Hex { carry } => {
                carry.extend(data.iter().filter(|b| b.is_ascii_hexdigit()));
                let usable = carry.len() - carry.len() % 2;
                if usable > 0 {
                    let chunk: Vec<u8> = carry.drain(..usable).collect();
                    for pair in chunk.chunks_exact(2) {
                        let text = std::str::from_utf8(pair)
                            .map_err(|_| Error::Protocol("hex stream".into()))?;
                        let byte = u8::from_str_radix(text, 16)
                            .map_err(|e| Error::Protocol(format!("hex stream: {}", e)))?;
                        out.push(byte);
                    }
                }
                Ok(())
            }
        }
    }

    fn finish(&mut self, out: &mut Vec<u8>) -> Result<(), Error> {
        match self {
            Decoder::Passthrough => Ok(()),
            Decoder::Base64 { carry } => {
                if !carry.is_empty() {
                    let chunk = std::mem::take(carry);
                    let decoded = BASE64
                        .decode(&chunk)
                        .map_err(|e| Error::Protocol(format!("base64 stream tail: {}", e)))?;
                    out.extend_from_slice(&decoded);
                }
                Ok(())
            }
            Decoder::Hex { carry } => {
                if !carry.is_empty() {
                    return Err(Error::Protocol("odd trailing hex digit".into()));
                }
                Ok(())
            }
        }
    }
}

/// Incremental encoder for the write-side streams. Base64 buffers to
/// 3-byte alignment so chunk boundaries never corrupt the encoding.
enum Encoder {
    Passthrough,
    Base64 { carry: Vec<u8> },
    Hex,
}

impl Encoder {
    fn new(stream: Stream) -> Encoder {
        match stream {
            Stream::Raw | Stream::Print => Encoder::Passthrough,
            Stream::Base64 => Encoder::Base64 { carry: Vec::new() },
            Stream::Hex => Encoder::Hex,
        }
    }

    fn push(&mut self, data: &[u8]) -> Vec<u8> {
        match self {
            Encoder::Passthrough => data.to_vec(),
            Encoder::Base64 { carry } => {
                carry.extend_from_slice(data);
                let usable = carry.len() - carry.len() % 3;
                if usable == 0 {
                    return Vec::new();
                }
                let chunk: Vec<u8> = carry.drain(..usable).collect();
                BASE64.encode(&chunk).into_bytes()
            }
            Encoder::Hex => data.iter().map(|b| format!("{:02x}", b)).collect::<String>().into_bytes(),
        }
    }

    fn finish(&mut self) -> Vec<u8> {
        match self {
            Encoder::Passthrough => Vec::new(),
            Encoder::Base64 { carry } => {
                let mut tail = Vec::new();
                if !carry.is_empty() {
                    let chunk = std::mem::take(carry);
                    tail = BASE64.encode(&chunk).into_bytes();
                }
                tail.push(b'\n');
                tail
            }
            Encoder::Hex => b"\n".to_vec(),
        }
    }
}

/// Channel-backed remote file reader, bounded by the framing of its
/// underlying payload process.
pub struct FileReader<'p> {
    popen: Popen<'p>,
    exit_cmd: Vec<u8>,
    decoder: Decoder,
    decoded: Vec<u8>,
    done: bool,
}

impl Read for FileReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        loop {
            if !self.decoded.is_empty() {
                let n = buf.len().min(self.decoded.len());
                buf[..n].copy_from_slice(&self.decoded[..n]);
                self.decoded.drain(..n);
                return Ok(n);
            }

            if self.done {
                return Ok(0);
            }

            match self.popen.read_some(None) {
                Ok(Some(chunk)) => {
                    self.decoder
                        .push(&chunk, &mut self.decoded)
                        .map_err(to_io_error)?;
                }
                Ok(None) => {
                    self.decoder.finish(&mut self.decoded).map_err(to_io_error)?;
                    self.done = true;
                }
                Err(err) => return Err(to_io_error(err)),
            }
        }
    }
}

impl FileReader<'_> {
    /// Drain any remaining payload output and release the channel.
    pub fn close(mut self) -> Result<(), Error> {
        if !self.done {
            if !self.exit_cmd.is_empty() {
                self.popen.send_exit(&self.exit_cmd)?;
            }
            while self.popen.read_some(None)?.is_some() {}
        }
        Ok(())
    }
}

/// Channel-backed remote file writer. Data flows through the encoder into
/// the payload's stdin; `close` terminates the payload and confirms the
/// framed status.
pub struct FileWriter<'p> {
    popen: Popen<'p>,
    exit_cmd: Vec<u8>,
    encoder: Encoder,
    closed: bool,
}

impl Write for FileWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if self.closed {
            return Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "remote file already closed",
            ));
        }

        let encoded = self.encoder.push(buf);
        if !encoded.is_empty() {
            self.popen.write_stdin(&encoded).map_err(to_io_error)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl FileWriter<'_> {
    /// Flush the encoder tail, send the exit command and wait for the
    /// payload to finish. A partial transfer interrupted before `close` is
    /// committed as-is.
    pub fn close(mut self) -> Result<(), Error> {
        self.closed = true;

        let tail = self.encoder.finish();
        if !tail.is_empty() {
            self.popen.write_stdin(&tail)?;
        }
        self.popen.send_exit(&self.exit_cmd)?;

        while self.popen.read_some(None)?.is_some() {}

        match self.popen.status() {
            Some(0) | None => Ok(()),
            Some(status) => Err(Error::Permission(format!(
                "remote writer exited with status {}",
                status
            ))),
        }
    }
}

fn to_io_error(err: Error) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::Other, err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockChannel;

    /// Emulate the remote shell: unwrap each framed command, dispatch it to
    /// `handler`, and script the byte-exact response including echo and
    /// markers.
    fn fake_shell<F>(mut handler: F) -> MockChannel
    where
        F: FnMut(&str) -> (String, i32) + Send + 'static,
    {
        MockChannel::scripted(move |sent| {
            let text = String::from_utf8_lossy(sent).into_owned();

            // Raw sends (no framing): bare newline wake-ups, exec lines,
            // stty preludes. Respond with nothing.
            let Some(start) = text
                .split("echo ")
                .nth(1)
                .and_then(|s| s.split(';').next())
                .map(|s| s.trim().to_string())
            else {
                return Vec::new();
            };
            if start.len() != crate::subprocess::MARKER_LEN {
                return Vec::new();
            }

            let end = text
                .rsplit("echo ")
                .next()
                .and_then(|s| s.split(' ').next())
                .unwrap_or_default()
                .to_string();

            // the command sits between the start-marker echo and the
            // end-marker echo
            let command = text
                .split_once(&format!("echo {}; ", start))
                .map(|(_, rest)| rest)
                .and_then(|rest| rest.rsplit_once(&format!("; echo {} $?", end)))
                .map(|(cmd, _)| cmd.to_string())
                .unwrap_or_default();

            let (output, status) = handler(&command);

            let mut resp = Vec::new();
            resp.extend_from_slice(sent); // echo of the command line
            resp.extend_from_slice(b"\n");
            resp.extend_from_slice(format!("{}\n", start).as_bytes());
            resp.extend_from_slice(output.as_bytes());
            resp.extend_from_slice(format!("{} {}\n", end, status).as_bytes());
            resp
        })
    }

    /// Handler emulating a minimal dash host used by most tests.
    fn dash_host(command: &str) -> (String, i32) {
        match command {
            c if c.starts_with("unset HISTFILE") => (String::new(), 0),
            "echo $$" => ("4242\n".into(), 0),
            "readlink /proc/4242/exe" => ("/bin/dash\n".into(), 0),
            c if c.starts_with("command -v") => (String::new(), 1),
            c if c.starts_with("IFS=:;") => (String::new(), 0),
            "echo \"$PATH\"" => ("/usr/bin:/bin\n".into(), 0),
            c if c.starts_with("export PATH=") => (String::new(), 0),
            "[ -t 1 ]" => (String::new(), 1),
            "id -u" => ("0\n".into(), 0),
            "id -un" => ("root\n".into(), 0),
            "pwd" => ("/root\n".into(), 0),
            "id" => ("uid=0(root) gid=0(root) groups=0(root)\n".into(), 0),
            "whoami" => ("root\n".into(), 0),
            c if c.starts_with("echo \"$SHELL\"") => ("/bin/dash\n".into(), 0),
            _ => (format!("unexpected: {}\n", command), 127),
        }
    }

    fn established() -> Linux {
        let chan = fake_shell(dash_host);
        Linux::establish(Box::new(chan), &Config::default()).unwrap()
    }

    #[test]
    fn establish_probes_a_dash_shell() {
        let platform = established();
        assert_eq!(platform.shell, "/bin/dash");
        assert!(!platform.has_pty);
        assert_eq!(platform.uid, "0");
        assert_eq!(platform.username, "root");
        assert_eq!(platform.cwd(), "/root");
        assert_eq!(platform.prompt_marker().len(), 64);
    }

    #[test]
    fn establish_refuses_nologin_shell() {
        let chan = fake_shell(|command| match command {
            c if c.starts_with("unset HISTFILE") => (String::new(), 0),
            "echo $$" => ("99\n".into(), 0),
            "readlink /proc/99/exe" => ("/usr/sbin/nologin\n".into(), 0),
            _ => (String::new(), 0),
        });

        match Linux::establish(Box::new(chan), &Config::default()) {
            Err(Error::Platform(msg)) => assert!(msg.contains("nologin")),
            other => panic!("expected Platform error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn run_returns_stdout_and_status() {
        let mut platform = established();
        let out = platform.run(&["id".to_string()], None, None).unwrap();
        assert!(out.stdout_utf8().starts_with("uid="));
        assert_eq!(out.status, 0);
    }

    #[test]
    fn run_with_env_wraps_in_clean_environment() {
        let chan = fake_shell(|command| {
            if command.starts_with("env -i LANG=C id") {
                ("uid=0(root)\n".into(), 0)
            } else {
                dash_host(command)
            }
        });
        let mut platform = Linux::establish(Box::new(chan), &Config::default()).unwrap();
        let out = platform
            .run(
                &["id".to_string()],
                Some(&[("LANG".to_string(), "C".to_string())]),
                None,
            )
            .unwrap();
        assert_eq!(out.status, 0);
    }

    #[test]
    fn sequential_framed_commands_route_to_the_right_caller() {
        let chan = fake_shell(|command| {
            match command.strip_prefix("echo ") {
                Some(n) if n.trim().chars().all(|c| c.is_ascii_digit()) => {
                    (format!("{}\n", n.trim()), 0)
                }
                _ => dash_host(command),
            }
        });
        let mut platform = Linux::establish(Box::new(chan), &Config::default()).unwrap();

        for n in 0..10 {
            let out = platform
                .run(&["echo".to_string(), n.to_string()], None, None)
                .unwrap();
            assert_eq!(out.stdout_utf8().trim(), n.to_string());
            assert_eq!(out.status, 0);
        }
    }

    #[test]
    fn which_caches_lookups() {
        let chan = fake_shell(|command| match command {
            "command -v curl" => ("/usr/bin/curl\n".into(), 0),
            other => dash_host(other),
        });
        let mut platform = Linux::establish(Box::new(chan), &Config::default()).unwrap();

        assert_eq!(platform.which("curl"), Some("/usr/bin/curl".into()));
        // second lookup must come from the cache (the fake shell would
        // answer identically, but the cache entry proves the path)
        assert!(platform.which_cache.contains_key("curl"));
        assert_eq!(platform.which("curl"), Some("/usr/bin/curl".into()));
        assert_eq!(platform.which("definitely-not-there"), None);
    }

    #[test]
    fn users_parse_from_passwd() {
        let chan = fake_shell(|command| match command {
            "cat /etc/passwd" => (
                "root:x:0:0:root:/root:/bin/bash\n\
                 caleb:x:1000:1000:Caleb:/home/caleb:/bin/bash\n"
                    .into(),
                0,
            ),
            other => dash_host(other),
        });
        let mut platform = Linux::establish(Box::new(chan), &Config::default()).unwrap();

        let users = platform.users().unwrap();
        assert_eq!(users.len(), 2);
        assert_eq!(users[0].name, "root");
        assert_eq!(users[1].id, "1000");
        assert_eq!(users[1].home.as_deref(), Some("/home/caleb"));

        let current = platform.current_user().unwrap();
        assert_eq!(current.name, "root");
        assert_eq!(current.id, "0");
    }

    #[test]
    fn framed_command_while_interactive_is_busy() {
        let mut platform = established();
        platform.interactive = true;
        match platform.run_shell("id", None) {
            Err(Error::Busy(_)) => {}
            other => panic!("expected Busy, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn host_id_is_stable_32_hex() {
        let enumeration = |command: &str| -> Option<(String, i32)> {
            match command {
                "head -n2 /etc/os-release 2>/dev/null" => {
                    Some(("PRETTY_NAME=\"Debian 12\"\nNAME=\"Debian\"\n".into(), 0))
                }
                "uname -r" => Some(("6.1.0-13-amd64\n".into(), 0)),
                "cat /sys/class/net/*/address 2>/dev/null | sort" => {
                    Some(("00:11:22:33:44:55\n".into(), 0))
                }
                _ => None,
            }
        };

        let chan = fake_shell(move |c| enumeration(c).unwrap_or_else(|| dash_host(c)));
        let mut platform = Linux::establish(Box::new(chan), &Config::default()).unwrap();
        let id1 = platform.host_id().unwrap();
        assert_eq!(id1.len(), 32);
        assert!(id1.chars().all(|c| c.is_ascii_hexdigit()));

        // same inputs, same id, and the second call is served from cache
        let id2 = platform.host_id().unwrap();
        assert_eq!(id1, id2);
    }

    #[test]
    fn open_read_streams_and_decodes_base64() {
        let payload: &[u8] = b"\x00binary\xffdata\x00";
        let encoded = BASE64.encode(payload);

        let chan = fake_shell(move |command| match command {
            c if c.starts_with("test -e") || c.starts_with("test -r") => (String::new(), 0),
            "command -v cat" => (String::new(), 1),
            "command -v dd" => (String::new(), 1),
            "command -v xxd" => (String::new(), 1),
            "command -v base64" => ("/usr/bin/base64\n".into(), 0),
            c if c.starts_with("IFS=:;") => (String::new(), 1),
            c if c.starts_with("/usr/bin/base64 -w0") => (format!("{}\n", encoded), 0),
            other => dash_host(other),
        });

        let mut platform = Linux::establish(Box::new(chan), &Config::default()).unwrap();
        let mut reader = platform.open_read("/root/blob").unwrap();
        let mut data = Vec::new();
        reader.read_to_end(&mut data).unwrap();
        assert_eq!(data, payload);
    }

    #[test]
    fn open_write_round_trips_through_base64_decoder() {
        use std::sync::{Arc, Mutex};

        // What the remote decoder receives on stdin, and the end marker of
        // the in-flight writer payload (delivered only once EOF arrives,
        // like a real `base64 -d` blocking on stdin).
        let stdin_data: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
        let pending_end: Arc<Mutex<String>> = Arc::new(Mutex::new(String::new()));

        let stdin_sink = stdin_data.clone();
        let end_cell = pending_end.clone();

        let mut chan = MockChannel::scripted(move |sent| {
            let text = String::from_utf8_lossy(sent).into_owned();

            if text.contains("; echo ") && text.contains(" $?") {
                // the framed writer payload: respond with the start marker
                // and remember the end marker for later
                let start = text
                    .split("echo ")
                    .nth(1)
                    .and_then(|s| s.split(';').next())
                    .unwrap()
                    .trim()
                    .to_string();
                let end = text
                    .rsplit("echo ")
                    .next()
                    .and_then(|s| s.split(' ').next())
                    .unwrap()
                    .to_string();
                *end_cell.lock().unwrap() = end;

                let mut resp = Vec::new();
                resp.extend_from_slice(sent);
                resp.extend_from_slice(b"\n");
                resp.extend_from_slice(format!("{}\n", start).as_bytes());
                resp
            } else if sent == b"\x04" {
                // stdin EOF: the payload exits and the shell prints the
                // end marker with its status
                format!("{} 0\n", end_cell.lock().unwrap()).into_bytes()
            } else {
                // stdin data for the decoder
                stdin_sink.lock().unwrap().extend_from_slice(sent);
                Vec::new()
            }
        });

        let popen = Popen::spawn(&mut chan, "/usr/bin/base64 -d > /tmp/blob", None).unwrap();
        let mut writer = FileWriter {
            popen,
            exit_cmd: b"\x04".to_vec(),
            encoder: Encoder::new(Stream::Base64),
            closed: false,
        };

        let body = vec![0u8, 1, 2, 3, 0, 255, 254, 0];
        writer.write_all(&body).unwrap();
        writer.close().unwrap();

        let captured = stdin_data.lock().unwrap().clone();
        let text = String::from_utf8_lossy(&captured);
        assert_eq!(BASE64.decode(text.trim()).unwrap(), body);
    }

    #[test]
    fn base64_decoder_handles_split_chunks() {
        let mut decoder = Decoder::new(Stream::Base64);
        let encoded = BASE64.encode(b"hello binary world");
        let mut out = Vec::new();

        // feed in awkward chunk sizes
        for chunk in encoded.as_bytes().chunks(5) {
            decoder.push(chunk, &mut out).unwrap();
        }
        decoder.finish(&mut out).unwrap();
        assert_eq!(out, b"hello binary world");
    }

    #[test]
    fn hex_encoder_and_decoder_round_trip() {
        let mut encoder = Encoder::new(Stream::Hex);
        let mut decoder = Decoder::new(Stream::Hex);

        let body = vec![0u8, 0xde, 0xad, 0xbe, 0xef, 0x00, 0x0a];
        let mut wire = encoder.push(&body);
        wire.extend_from_slice(&encoder.finish());

        let mut out = Vec::new();
        decoder.push(&wire, &mut out).unwrap();
        decoder.finish(&mut out).unwrap();
        assert_eq!(out, body);
    }
}
