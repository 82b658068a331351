//! Small helpers shared across the runtime.

use rand::distr::Alphanumeric;
use rand::Rng;

/// The interrupt byte sent to a remote PTY to abort a running command.
pub const CTRL_C: &[u8] = b"\x03";

/// EOT; the default raw-mode escape keystroke.
pub const CTRL_D: u8 = 0x04;

/// Generate `len` random lowercase hex characters.
pub fn random_hex(len: usize) -> String {
    let mut rng = rand::rng();
    (0..len)
        .map(|_| {
            let v: u8 = rng.random_range(0..16);
            char::from_digit(v as u32, 16).unwrap_or('0')
        })
        .collect()
}

/// Generate a random alphanumeric identifier, e.g. for remote temp names.
pub fn random_string(len: usize) -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Quote a token for a POSIX shell. Plain words pass through untouched;
/// anything else is single-quoted with embedded quotes escaped.
pub fn quote(token: &str) -> String {
    if !token.is_empty()
        && token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-+=/.,:@%^".contains(c))
    {
        return token.to_string();
    }

    format!("'{}'", token.replace('\'', r"'\''"))
}

/// Join an argv into a single shell command line.
pub fn join(argv: &[String]) -> String {
    argv.iter()
        .map(|a| quote(a))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_hex_is_hex() {
        let marker = random_hex(64);
        assert_eq!(marker.len(), 64);
        assert!(marker.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn markers_are_unique() {
        assert_ne!(random_hex(32), random_hex(32));
    }

    #[test]
    fn quote_passes_plain_words() {
        assert_eq!(quote("ls"), "ls");
        assert_eq!(quote("/etc/passwd"), "/etc/passwd");
    }

    #[test]
    fn quote_wraps_specials() {
        assert_eq!(quote("hello world"), "'hello world'");
        assert_eq!(quote("a'b"), r"'a'\''b'");
        assert_eq!(quote(""), "''");
    }

    #[test]
    fn join_builds_a_command_line() {
        let argv = vec!["echo".to_string(), "two words".to_string()];
        assert_eq!(join(&argv), "echo 'two words'");
    }
}
