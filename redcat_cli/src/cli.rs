// SPDX-License-Identifier: MIT OR Apache-2.0
//! Command line surface and connection-string parsing.
//!
//! The positional target accepts the full connection grammar
//! `[protocol://][user[:password]@][host][:port][?k=v&...]`, a bare
//! 32-hex-character host id for reconnecting to a known target, or the
//! netcat style `redcat <host> <port>` with the port as a second
//! positional.

use std::path::PathBuf;

use clap::Parser;
use redcat::channel::{ChannelSpec, Protocol};

/// redcat — stabilize a raw bind or reverse shell into an interactive,
/// multi-session exploitation framework.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "redcat",
    version,
    about = "Session runtime for raw bind and reverse shells",
    long_about = None,
)]
pub struct Cli {
    /// Connection string: [protocol://][user[:password]@][host][:port][?k=v&...],
    /// or a stored host id for reconnect.
    pub target: Option<String>,

    /// Port, netcat style (`redcat 10.0.0.2 4444`).
    pub positional_port: Option<u16>,

    /// Force a bind (listen) protocol.
    #[arg(short = 'l', long)]
    pub listen: bool,

    /// Wrap the connection in TLS.
    #[arg(long)]
    pub ssl: bool,

    /// Server certificate for TLS listeners (combined PEM accepted).
    #[arg(long, value_name = "PATH")]
    pub ssl_cert: Option<String>,

    /// Server private key when not combined with the certificate.
    #[arg(long, value_name = "PATH")]
    pub ssl_key: Option<String>,

    /// SSH private key.
    #[arg(short = 'i', long, value_name = "PATH")]
    pub identity: Option<String>,

    /// Target platform.
    #[arg(short = 'm', long, default_value = "linux", value_parser = ["linux", "windows"])]
    pub platform: String,

    /// Port number (alternative to the connection string form).
    #[arg(short = 'p', long)]
    pub port: Option<u16>,

    /// List known targets from the persistent store and exit.
    #[arg(long)]
    pub list: bool,

    /// Configuration file.
    #[arg(short = 'c', long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Prefetch the Windows stage payloads and exit.
    #[arg(long)]
    pub download_plugins: bool,

    /// Verbose logging.
    #[arg(short = 'v', long)]
    pub verbose: bool,
}

/// What the positional target resolved to.
#[derive(Debug, PartialEq)]
pub enum TargetKind {
    /// Reconnect to a stored target by host id.
    Reconnect(String),
    /// Establish a fresh channel.
    Spec(ChannelSpec),
}

/// Parse the target and flags into a channel spec (or a reconnect
/// request). Returns a human-readable message on grammar errors.
pub fn resolve_target(cli: &Cli) -> Result<TargetKind, String> {
    let raw = cli.target.clone().unwrap_or_default();

    // A bare 32-hex-char token is a stored host id.
    if raw.len() == 32 && raw.chars().all(|c| c.is_ascii_hexdigit()) {
        return Ok(TargetKind::Reconnect(raw));
    }

    let pattern = regex::Regex::new(
        r"^(?:(?P<proto>[a-z][a-z0-9+\-]*)://)?(?:(?P<user>[^:@/]+)(?::(?P<pass>[^@]*))?@)?(?P<host>[^:?]*)(?::(?P<port>\d+))?(?:\?(?P<query>.*))?$",
    )
    .expect("connection grammar");

    let captures = pattern
        .captures(&raw)
        .ok_or_else(|| format!("{}: malformed connection string", raw))?;

    let mut spec = ChannelSpec {
        host: captures
            .name("host")
            .map(|m| m.as_str().to_string())
            .filter(|h| !h.is_empty()),
        user: captures.name("user").map(|m| m.as_str().to_string()),
        password: captures.name("pass").map(|m| m.as_str().to_string()),
        identity: cli.identity.clone(),
        certfile: cli.ssl_cert.clone(),
        keyfile: cli.ssl_key.clone(),
        ssl: cli.ssl,
        ..Default::default()
    };

    if let Some(proto) = captures.name("proto") {
        spec.protocol = Some(
            Protocol::from_name(proto.as_str())
                .ok_or_else(|| format!("{}: unknown protocol", proto.as_str()))?,
        );
    }

    // ?k=v&... query parameters extend the spec
    if let Some(query) = captures.name("query") {
        for (key, value) in parse_query(query.as_str()) {
            match key.as_str() {
                "user" => spec.user = Some(value),
                "password" => spec.password = Some(value),
                "identity" => spec.identity = Some(value),
                "certfile" => spec.certfile = Some(value),
                "keyfile" => spec.keyfile = Some(value),
                "ssl" => spec.ssl = value == "true" || value == "1",
                other => return Err(format!("{}: unknown connection parameter", other)),
            }
        }
    }

    // Port precedence: inside the string, then --port, then the netcat
    // style second positional. SSH falls back to 22.
    spec.port = captures
        .name("port")
        .and_then(|m| m.as_str().parse().ok())
        .or(cli.port)
        .or(cli.positional_port);
    if spec.port.is_none() && spec.effective_protocol() == Protocol::Ssh {
        spec.port = Some(22);
    }

    // `redcat -l 4444`: a bare numeric positional is the listen port.
    if cli.listen && spec.port.is_none() {
        if let Some(port) = spec.host.as_deref().and_then(|h| h.parse().ok()) {
            spec.host = None;
            spec.port = Some(port);
        }
    }

    if cli.listen {
        spec.protocol = Some(
            if spec.ssl || spec.certfile.is_some() || spec.keyfile.is_some() {
                Protocol::SslBind
            } else {
                Protocol::Bind
            },
        );
    }

    if spec.port.is_none() {
        return Err("no port specified".to_string());
    }

    Ok(TargetKind::Spec(spec))
}

fn parse_query(query: &str) -> Vec<(String, String)> {
    query
        .split('&')
        .filter(|kv| !kv.is_empty())
        .map(|kv| match kv.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (kv.to_string(), "true".to_string()),
        })
        .collect::<Vec<_>>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn cli(args: &[&str]) -> Cli {
        Cli::parse_from(std::iter::once("redcat").chain(args.iter().copied()))
    }

    fn spec(cli_args: &[&str]) -> ChannelSpec {
        match resolve_target(&cli(cli_args)).unwrap() {
            TargetKind::Spec(spec) => spec,
            other => panic!("expected spec, got {:?}", other),
        }
    }

    #[test]
    fn netcat_style_host_and_port() {
        let spec = spec(&["127.0.0.1", "4444"]);
        assert_eq!(spec.host.as_deref(), Some("127.0.0.1"));
        assert_eq!(spec.port, Some(4444));
        assert_eq!(spec.effective_protocol(), Protocol::Connect);
    }

    #[test]
    fn host_colon_port() {
        let spec = spec(&["10.0.0.2:4444"]);
        assert_eq!(spec.host.as_deref(), Some("10.0.0.2"));
        assert_eq!(spec.port, Some(4444));
    }

    #[test]
    fn ssh_from_user_at_host() {
        let spec = spec(&["caleb:hunter2@target.example:2222"]);
        assert_eq!(spec.user.as_deref(), Some("caleb"));
        assert_eq!(spec.password.as_deref(), Some("hunter2"));
        assert_eq!(spec.host.as_deref(), Some("target.example"));
        assert_eq!(spec.port, Some(2222));
        assert_eq!(spec.effective_protocol(), Protocol::Ssh);
    }

    #[test]
    fn explicit_protocol_prefix() {
        let spec = spec(&["ssl-connect://10.0.0.2:9999"]);
        assert_eq!(spec.protocol, Some(Protocol::SslConnect));
    }

    #[test]
    fn bare_port_binds() {
        let spec = spec(&[":4444"]);
        assert_eq!(spec.host, None);
        assert_eq!(spec.port, Some(4444));
        assert_eq!(spec.effective_protocol(), Protocol::Bind);
    }

    #[test]
    fn listen_flag_forces_bind_even_with_host() {
        let spec = spec(&["-l", "127.0.0.1", "4444"]);
        assert_eq!(spec.effective_protocol(), Protocol::Bind);
    }

    #[test]
    fn listen_with_bare_numeric_positional_is_a_port() {
        let spec = spec(&["-l", "4444"]);
        assert_eq!(spec.host, None);
        assert_eq!(spec.port, Some(4444));
        assert_eq!(spec.effective_protocol(), Protocol::Bind);
    }

    #[test]
    fn ssl_listener_scenario() {
        // redcat -l --ssl --ssl-cert combined.pem :4444
        let spec = spec(&["-l", "--ssl", "--ssl-cert", "combined.pem", ":4444"]);
        assert_eq!(spec.effective_protocol(), Protocol::SslBind);
        assert_eq!(spec.certfile.as_deref(), Some("combined.pem"));
        assert_eq!(spec.port, Some(4444));
    }

    #[test]
    fn query_parameters_extend_the_spec() {
        let spec = spec(&["ssh://root@10.0.0.9:22?identity=/tmp/key"]);
        assert_eq!(spec.identity.as_deref(), Some("/tmp/key"));
        assert_eq!(spec.effective_protocol(), Protocol::Ssh);
    }

    #[test]
    fn unknown_query_parameter_is_an_error() {
        let cli = cli(&["connect://10.0.0.2:4444?frobnicate=1"]);
        assert!(resolve_target(&cli).unwrap_err().contains("frobnicate"));
    }

    #[test]
    fn host_id_reconnect() {
        let cli = cli(&["ab8b7df2a1f83fa6694b0315aaf1deec"]);
        assert_eq!(
            resolve_target(&cli).unwrap(),
            TargetKind::Reconnect("ab8b7df2a1f83fa6694b0315aaf1deec".to_string())
        );
    }

    #[test]
    fn missing_port_is_an_error() {
        let cli = cli(&["10.0.0.2"]);
        assert!(resolve_target(&cli).unwrap_err().contains("port"));
    }

    #[test]
    fn port_flag_fills_in() {
        let spec = spec(&["-p", "4444", "10.0.0.2"]);
        assert_eq!(spec.port, Some(4444));
    }
}
