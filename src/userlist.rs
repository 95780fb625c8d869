//! Read-only parsers for the on-disk pairing records a session's user
//! filter and beacon target list are built from. Pairing and
//! key generation themselves are out of scope; this
//! module only reads already-paired records.

use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::error::ConfigError;
use crate::session::UserRecord;

/// Maximum line length for `bluetooth.txt` entries.
const MAX_BLUETOOTH_LINE_LEN: usize = 19;

/// Parses `users.txt`: one whitespace-separated record per non-empty,
/// non-comment (`#`-prefixed) line — `username pico-public-key-b64
/// symmetric-key-b64`. Malformed lines (wrong field count, bad base64) are
/// skipped rather than failing the whole file, since a single bad pairing
/// record should not take every other user offline.
pub fn load_users(path: impl AsRef<Path>) -> Result<Vec<UserRecord>, ConfigError> {
    let contents = read_optional(path.as_ref())?;
    let mut users = Vec::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut fields = line.split_whitespace();
        let (Some(username), Some(pico_key_b64), Some(symmetric_key_b64), None) = (
            fields.next(),
            fields.next(),
            fields.next(),
            fields.next(),
        ) else {
            continue;
        };
        let (Ok(pico_public_key), Ok(symmetric_key)) = (
            BASE64.decode(pico_key_b64),
            BASE64.decode(symmetric_key_b64),
        ) else {
            continue;
        };
        users.push(UserRecord {
            username: username.to_string(),
            pico_public_key,
            symmetric_key,
        });
    }
    Ok(users)
}

/// Parses `bluetooth.txt`: one beacon target address per non-empty,
/// non-comment line, `#` comments ignored, lines over
/// [`MAX_BLUETOOTH_LINE_LEN`] bytes rejected.
pub fn load_bluetooth_targets(path: impl AsRef<Path>) -> Result<Vec<String>, ConfigError> {
    let contents = read_optional(path.as_ref())?;
    let mut targets = Vec::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if line.len() > MAX_BLUETOOTH_LINE_LEN {
            continue;
        }
        targets.push(line.to_string());
    }
    Ok(targets)
}

/// Loads raw DER bytes for the service identity key pair.
pub fn load_der_key(path: impl AsRef<Path>) -> Result<Vec<u8>, ConfigError> {
    std::fs::read(path.as_ref()).map_err(|source| ConfigError::Io {
        path: path.as_ref().display().to_string(),
        source,
    })
}

fn read_optional(path: &Path) -> Result<String, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(contents) => Ok(contents),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(source) => Err(ConfigError::Io {
            path: path.display().to_string(),
            source,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_users_file_and_skips_comments_and_blank_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.txt");
        let pico_key = BASE64.encode(b"pico-key-bytes");
        let sym_key = BASE64.encode(b"symmetric-key-bytes");
        std::fs::write(
            &path,
            format!("# comment\n\nalice {pico_key} {sym_key}\nbob {pico_key} {sym_key}\n"),
        )
        .unwrap();

        let users = load_users(&path).unwrap();
        assert_eq!(users.len(), 2);
        assert_eq!(users[0].username, "alice");
        assert_eq!(users[0].pico_public_key, b"pico-key-bytes");
        assert_eq!(users[0].symmetric_key, b"symmetric-key-bytes");
    }

    #[test]
    fn skips_malformed_lines_without_failing_the_whole_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.txt");
        let sym_key = BASE64.encode(b"k");
        std::fs::write(&path, format!("bad-line-only-one-field\nalice not-base64!! {sym_key}\n")).unwrap();

        let users = load_users(&path).unwrap();
        assert!(users.is_empty());
    }

    #[test]
    fn missing_users_file_is_fail_open_to_empty_list() {
        let users = load_users("/no/such/path/users.txt").unwrap();
        assert!(users.is_empty());
    }

    #[test]
    fn bluetooth_targets_respect_max_line_length_and_comments() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bluetooth.txt");
        std::fs::write(
            &path,
            "# targets\nAA:BB:CC:DD:EE:FF\nthis-line-is-far-too-long-to-be-valid\n",
        )
        .unwrap();

        let targets = load_bluetooth_targets(&path).unwrap();
        assert_eq!(targets, vec!["AA:BB:CC:DD:EE:FF".to_string()]);
    }
}
