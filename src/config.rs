//! Configuration overlay: defaults ← file ← caller.
//!
//! `any_user` is locked: its file value is discarded before the overlay is
//! ever applied, so a malicious or stale config file cannot widen the
//! accepted-user set for a session the caller scoped to one username.

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ConfigError;

/// Transport selected for a session's [`crate::channel::ByteChannel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelType {
    Rvp,
    Stream,
    Attr,
}

impl Default for ChannelType {
    fn default() -> Self {
        ChannelType::Rvp
    }
}

/// Effective, overlaid configuration for one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigOverlay {
    pub continuous: bool,
    pub channel_type: ChannelType,
    pub beacons: bool,
    pub any_user: bool,
    pub timeout_seconds: u64,
    pub rvp_url_prefix: String,
    pub config_dir: String,
}

impl Default for ConfigOverlay {
    fn default() -> Self {
        Self {
            continuous: false,
            channel_type: ChannelType::Rvp,
            beacons: false,
            any_user: false,
            timeout_seconds: 0,
            rvp_url_prefix: normalize_path("http://localhost:8081/channel/"),
            config_dir: normalize_path("/etc/continuauth/"),
        }
    }
}

/// Appends a trailing `/` if one is not already present.
fn normalize_path(s: &str) -> String {
    if s.ends_with('/') {
        s.to_string()
    } else {
        format!("{s}/")
    }
}

impl ConfigOverlay {
    /// The documented defaults for every recognised key.
    pub fn new() -> Self {
        Self::default()
    }

    /// Overlays recognised keys from an on-disk JSON dictionary.
    ///
    /// Fail-open if the file is absent (defaults are kept as-is); fails with
    /// [`ConfigError::Malformed`] if the file exists but is not a JSON
    /// object. `any_user` is never read from a file, even if present.
    pub fn load_file(&mut self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => {
                return Err(ConfigError::Io {
                    path: path.display().to_string(),
                    source: err,
                })
            }
        };
        let value: Value = serde_json::from_str(&contents).map_err(|_| ConfigError::Malformed)?;
        let obj = value.as_object().ok_or(ConfigError::Malformed)?;
        self.apply_object(obj, /* allow_locked */ false);
        Ok(())
    }

    /// Overlays recognised keys from a caller-supplied JSON dictionary,
    /// including the locked `any_user` field.
    pub fn overlay_caller(&mut self, json: &str) -> Result<(), ConfigError> {
        let value: Value = serde_json::from_str(json).map_err(|_| ConfigError::CallerMalformed)?;
        let obj = value.as_object().ok_or(ConfigError::CallerMalformed)?;
        self.apply_object(obj, /* allow_locked */ true);
        Ok(())
    }

    fn apply_object(&mut self, obj: &serde_json::Map<String, Value>, allow_locked: bool) {
        if let Some(v) = obj.get("continuous").and_then(Value::as_bool) {
            self.continuous = v;
        }
        if let Some(v) = obj.get("channel_type").and_then(Value::as_str) {
            self.channel_type = match v.to_ascii_lowercase().as_str() {
                "stream" => ChannelType::Stream,
                "attr" => ChannelType::Attr,
                _ => ChannelType::Rvp,
            };
        }
        if let Some(v) = obj.get("beacons").and_then(Value::as_bool) {
            self.beacons = v;
        }
        if allow_locked {
            if let Some(v) = obj.get("any_user").and_then(Value::as_bool) {
                self.any_user = v;
            }
        }
        if let Some(v) = obj.get("timeout_seconds").and_then(Value::as_u64) {
            self.timeout_seconds = v;
        }
        if let Some(v) = obj.get("rvp_url_prefix").and_then(Value::as_str) {
            self.rvp_url_prefix = normalize_path(v);
        }
        if let Some(v) = obj.get("config_dir").and_then(Value::as_str) {
            self.config_dir = normalize_path(v);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_table() {
        let cfg = ConfigOverlay::new();
        assert!(!cfg.continuous);
        assert_eq!(cfg.channel_type, ChannelType::Rvp);
        assert!(!cfg.beacons);
        assert!(!cfg.any_user);
        assert_eq!(cfg.timeout_seconds, 0);
        assert!(cfg.rvp_url_prefix.ends_with('/'));
        assert!(cfg.config_dir.ends_with('/'));
    }

    #[test]
    fn missing_file_is_fail_open() {
        let mut cfg = ConfigOverlay::new();
        cfg.load_file("/no/such/path/config.txt").unwrap();
        assert_eq!(cfg, ConfigOverlay::new());
    }

    #[test]
    fn malformed_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.txt");
        std::fs::write(&path, "not json").unwrap();
        let mut cfg = ConfigOverlay::new();
        assert!(matches!(cfg.load_file(&path), Err(ConfigError::Malformed)));
    }

    #[test]
    fn file_any_user_is_discarded_even_when_present() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.txt");
        std::fs::write(&path, r#"{"any_user": true}"#).unwrap();
        let mut cfg = ConfigOverlay::new();
        cfg.load_file(&path).unwrap();
        assert!(!cfg.any_user);
    }

    #[test]
    fn caller_overlay_sets_locked_field() {
        let mut cfg = ConfigOverlay::new();
        cfg.overlay_caller(r#"{"any_user": true, "continuous": true}"#)
            .unwrap();
        assert!(cfg.any_user);
        assert!(cfg.continuous);
    }

    /// file `any_user=1`, caller `{"any_user":0,"continuous":1}` → caller wins, file ignored.
    #[test]
    fn locked_any_user_key_ignores_file_value() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.txt");
        std::fs::write(&path, r#"{"any_user": true}"#).unwrap();

        let mut cfg = ConfigOverlay::new();
        cfg.load_file(&path).unwrap();
        cfg.overlay_caller(r#"{"any_user": false, "continuous": true}"#)
            .unwrap();

        assert!(!cfg.any_user, "caller value must win, file value discarded");
        assert!(cfg.continuous);
    }

    #[test]
    fn trailing_slash_is_appended_when_absent() {
        let mut cfg = ConfigOverlay::new();
        cfg.overlay_caller(r#"{"rvp_url_prefix": "http://host/channel", "config_dir": "/etc/x"}"#)
            .unwrap();
        assert_eq!(cfg.rvp_url_prefix, "http://host/channel/");
        assert_eq!(cfg.config_dir, "/etc/x/");
    }

    #[test]
    fn caller_malformed_json_is_rejected() {
        let mut cfg = ConfigOverlay::new();
        assert!(matches!(
            cfg.overlay_caller("[]"),
            Err(ConfigError::CallerMalformed)
        ));
    }
}
