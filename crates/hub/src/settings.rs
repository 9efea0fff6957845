//! TOML settings file loading and validation for process-local knobs:
//! listen port, data directory, schedule timezone offset, relay timeout.
//!
//! These are deployment settings, distinct from the device-facing runtime
//! configuration in `config.rs` which is mutated over the API.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::Path;

/// Widest real-world UTC offset is 14 hours.
const MAX_TZ_OFFSET_MIN: i64 = 14 * 60;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub http_port: u16,
    pub data_dir: String,
    /// Fixed offset from UTC, in minutes, used for schedule evaluation.
    pub tz_offset_minutes: i64,
    pub relay_timeout_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            http_port: 8080,
            data_dir: "data".to_string(),
            tz_offset_minutes: 120, // UTC+2
            relay_timeout_secs: 5,
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Settings {
    /// Validate all settings. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        if self.data_dir.trim().is_empty() {
            errors.push("data_dir is empty".to_string());
        }

        if self.tz_offset_minutes.abs() > MAX_TZ_OFFSET_MIN {
            errors.push(format!(
                "tz_offset_minutes {} out of range [-{MAX_TZ_OFFSET_MIN}, {MAX_TZ_OFFSET_MIN}]",
                self.tz_offset_minutes
            ));
        }

        if self.relay_timeout_secs == 0 || self.relay_timeout_secs > 120 {
            errors.push(format!(
                "relay_timeout_secs {} out of range [1, 120]",
                self.relay_timeout_secs
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "settings validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML settings file. A missing file is not an
/// error: the hub runs with defaults.
pub fn load(path: &str) -> Result<Settings> {
    if !Path::new(path).exists() {
        tracing::info!(path, "settings file not found, using defaults");
        return Ok(Settings::default());
    }

    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read settings: {path}"))?;
    let settings: Settings =
        toml::from_str(&contents).with_context(|| format!("failed to parse settings: {path}"))?;
    settings
        .validate()
        .with_context(|| format!("invalid settings: {path}"))?;
    Ok(settings)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// Assert validation fails and the error message contains `needle`.
    fn assert_validation_err(settings: &Settings, needle: &str) {
        let err = settings.validate().unwrap_err();
        let msg = format!("{err:#}");
        assert!(
            msg.contains(needle),
            "expected error containing {needle:?}, got: {msg}"
        );
    }

    // -- Parsing ----------------------------------------------------------

    #[test]
    fn parse_full_settings() {
        let toml_str = r#"
http_port = 9090
data_dir = "/var/lib/autolight"
tz_offset_minutes = 60
relay_timeout_secs = 10
"#;
        let s: Settings = toml::from_str(toml_str).unwrap();
        assert_eq!(s.http_port, 9090);
        assert_eq!(s.data_dir, "/var/lib/autolight");
        assert_eq!(s.tz_offset_minutes, 60);
        assert_eq!(s.relay_timeout_secs, 10);
    }

    #[test]
    fn parse_empty_settings_gives_defaults() {
        let s: Settings = toml::from_str("").unwrap();
        assert_eq!(s.http_port, 8080);
        assert_eq!(s.data_dir, "data");
        assert_eq!(s.tz_offset_minutes, 120);
        assert_eq!(s.relay_timeout_secs, 5);
    }

    #[test]
    fn parse_partial_settings_keeps_other_defaults() {
        let s: Settings = toml::from_str("http_port = 3000").unwrap();
        assert_eq!(s.http_port, 3000);
        assert_eq!(s.tz_offset_minutes, 120);
    }

    // -- Validation -------------------------------------------------------

    #[test]
    fn defaults_pass_validation() {
        Settings::default().validate().unwrap();
    }

    #[test]
    fn empty_data_dir_rejected() {
        let s = Settings {
            data_dir: "  ".into(),
            ..Settings::default()
        };
        assert_validation_err(&s, "data_dir is empty");
    }

    #[test]
    fn tz_offset_too_large_rejected() {
        let s = Settings {
            tz_offset_minutes: 900,
            ..Settings::default()
        };
        assert_validation_err(&s, "tz_offset_minutes 900 out of range");
    }

    #[test]
    fn tz_offset_too_negative_rejected() {
        let s = Settings {
            tz_offset_minutes: -900,
            ..Settings::default()
        };
        assert_validation_err(&s, "tz_offset_minutes -900 out of range");
    }

    #[test]
    fn tz_offset_boundary_accepted() {
        let s = Settings {
            tz_offset_minutes: 840,
            ..Settings::default()
        };
        s.validate().unwrap();
        let s = Settings {
            tz_offset_minutes: -840,
            ..Settings::default()
        };
        s.validate().unwrap();
    }

    #[test]
    fn zero_relay_timeout_rejected() {
        let s = Settings {
            relay_timeout_secs: 0,
            ..Settings::default()
        };
        assert_validation_err(&s, "relay_timeout_secs 0 out of range");
    }

    #[test]
    fn multiple_errors_collected() {
        let s = Settings {
            data_dir: "".into(),
            tz_offset_minutes: 2000,
            relay_timeout_secs: 0,
            ..Settings::default()
        };
        let err = s.validate().unwrap_err();
        let msg = format!("{err:#}");
        assert!(msg.contains("3 errors"), "got: {msg}");
    }

    // -- Load -------------------------------------------------------------

    #[test]
    fn load_missing_file_returns_defaults() {
        let s = load("/nonexistent/hub.toml").unwrap();
        assert_eq!(s.http_port, 8080);
    }

    #[test]
    fn load_invalid_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hub.toml");
        std::fs::write(&path, "relay_timeout_secs = 0").unwrap();
        assert!(load(path.to_str().unwrap()).is_err());
    }
}
