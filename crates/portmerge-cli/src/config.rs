//! Configuration – `portmerge.toml` plus `PORTMERGE_*` overrides.
//!
//! Layers, lowest priority first: built-in defaults, the TOML file,
//! environment variables, command-line flags.
//!
//! ```toml
//! format = "(/imu:o[1-3] (/gps:o))"
//! frequency = 20.0
//! port = "/lm/merge"
//! transport = "udp"
//! connect_timeout_ms = 2000
//!
//! [udp]
//! bind_host = "127.0.0.1"
//!
//! [udp.ports]
//! "/imu:o" = "127.0.0.1:7001"
//! "/gps:o" = "127.0.0.1:7002"
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use portmerge_middleware::TransportSettings;
use portmerge_runtime::engine::DEFAULT_PREFIX;
use serde::{Deserialize, Serialize};

/// File looked up when `--config` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "portmerge.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Format in text form.  Required, from any layer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,

    /// Merge frequency in Hz.
    #[serde(default = "default_frequency")]
    pub frequency: f64,

    /// Prefix of the ports opened by the engine.
    #[serde(default = "default_port")]
    pub port: String,

    /// Registered transport name (`local` or `udp`).
    #[serde(default = "default_transport")]
    pub transport: String,

    /// How long each source may take to accept a connection.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Settings handed to the transport constructor.
    #[serde(default)]
    pub udp: TransportSettings,
}

fn default_frequency() -> f64 {
    10.0
}
fn default_port() -> String {
    DEFAULT_PREFIX.to_string()
}
fn default_transport() -> String {
    "udp".to_string()
}
fn default_connect_timeout_ms() -> u64 {
    2_000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            format: None,
            frequency: default_frequency(),
            port: default_port(),
            transport: default_transport(),
            connect_timeout_ms: default_connect_timeout_ms(),
            udp: TransportSettings::default(),
        }
    }
}

impl Config {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Load the file at `explicit`, or `./portmerge.toml` when no path is given.
///
/// A missing default file yields the defaults; a missing explicit file is an
/// error.  Environment overrides are applied in both cases.
pub fn load(explicit: Option<&Path>) -> Result<Config, String> {
    let mut cfg = match explicit {
        Some(path) => load_from(path)?
            .ok_or_else(|| format!("config file {} does not exist", path.display()))?,
        None => load_from(&PathBuf::from(DEFAULT_CONFIG_FILE))?.unwrap_or_default(),
    };
    apply_env_overrides(&mut cfg);
    Ok(cfg)
}

/// Parse one file.  Returns `None` if it does not exist.
pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let cfg: Config = toml::from_str(&raw)
        .map_err(|e| format!("Failed to parse config at {}: {}", path.display(), e))?;
    Ok(Some(cfg))
}

/// Apply `PORTMERGE_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `PORTMERGE_FORMAT` | `format` |
/// | `PORTMERGE_FREQUENCY` | `frequency` (ignored unless numeric) |
/// | `PORTMERGE_PORT` | `port` |
/// | `PORTMERGE_TRANSPORT` | `transport` |
pub fn apply_env_overrides(cfg: &mut Config) {
    apply_overrides_from(cfg, |key| std::env::var(key).ok());
}

/// Same as [`apply_env_overrides`] with an injectable lookup, so tests do
/// not have to mutate the process environment.
pub(crate) fn apply_overrides_from(cfg: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("PORTMERGE_FORMAT") {
        cfg.format = Some(v);
    }
    if let Some(v) = lookup("PORTMERGE_FREQUENCY")
        && let Ok(hz) = v.trim().parse::<f64>()
    {
        cfg.frequency = hz;
    }
    if let Some(v) = lookup("PORTMERGE_PORT") {
        cfg.port = v;
    }
    if let Some(v) = lookup("PORTMERGE_TRANSPORT") {
        cfg.transport = v;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn write(dir: &tempfile::TempDir, body: &str) -> PathBuf {
        let path = dir.path().join(DEFAULT_CONFIG_FILE);
        fs::write(&path, body).expect("write config");
        path
    }

    #[test]
    fn defaults_match_engine_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.port, "/lm/merge");
        assert_eq!(cfg.transport, "udp");
        assert_eq!(cfg.connect_timeout(), Duration::from_secs(2));
        assert!(cfg.format.is_none());
    }

    #[test]
    fn full_file_is_read() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = write(
            &dir,
            r#"
format = "(/imu:o[1-3] (/gps:o))"
frequency = 50.0
port = "/robot/merge"
transport = "local"
connect_timeout_ms = 500

[udp]
bind_host = "0.0.0.0"

[udp.ports]
"/imu:o" = "10.0.0.5:7001"
"#,
        );

        let cfg = load_from(&path).expect("load ok").expect("some");
        assert_eq!(cfg.format.as_deref(), Some("(/imu:o[1-3] (/gps:o))"));
        assert_eq!(cfg.frequency, 50.0);
        assert_eq!(cfg.port, "/robot/merge");
        assert_eq!(cfg.transport, "local");
        assert_eq!(cfg.connect_timeout(), Duration::from_millis(500));
        assert_eq!(cfg.udp.bind_host, "0.0.0.0");
        assert_eq!(
            cfg.udp.ports.get("/imu:o").map(String::as_str),
            Some("10.0.0.5:7001")
        );
    }

    #[test]
    fn partial_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = write(&dir, "frequency = 5.0\n");
        let cfg = load_from(&path).expect("load ok").expect("some");
        assert_eq!(cfg.frequency, 5.0);
        assert_eq!(cfg.port, "/lm/merge");
        assert_eq!(cfg.udp, TransportSettings::default());
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = write(&dir, "frequency = \"fast\"\n");
        let err = load_from(&path).expect_err("type mismatch");
        assert!(err.contains("Failed to parse config"));
    }

    #[test]
    fn load_from_returns_none_when_missing() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("absent.toml");
        assert!(load_from(&path).expect("no error").is_none());
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("absent.toml");
        let err = load(Some(&path)).expect_err("explicit file must exist");
        assert!(err.contains("does not exist"));
    }

    #[test]
    fn overrides_replace_file_values() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("PORTMERGE_FORMAT", "(/x:o)"),
            ("PORTMERGE_FREQUENCY", "25"),
            ("PORTMERGE_PORT", "/other"),
            ("PORTMERGE_TRANSPORT", "local"),
        ]);
        let mut cfg = Config::default();
        apply_overrides_from(&mut cfg, |key| env.get(key).map(|v| v.to_string()));
        assert_eq!(cfg.format.as_deref(), Some("(/x:o)"));
        assert_eq!(cfg.frequency, 25.0);
        assert_eq!(cfg.port, "/other");
        assert_eq!(cfg.transport, "local");
    }

    #[test]
    fn invalid_frequency_override_is_ignored() {
        let mut cfg = Config::default();
        apply_overrides_from(&mut cfg, |key| {
            (key == "PORTMERGE_FREQUENCY").then(|| "very fast".to_string())
        });
        assert_eq!(cfg.frequency, default_frequency());
    }

    #[test]
    fn config_serializes_back_to_toml() {
        let cfg = Config {
            format: Some("(/a:o)".to_string()),
            ..Config::default()
        };
        let text = toml::to_string_pretty(&cfg).expect("serialize");
        let again: Config = toml::from_str(&text).expect("parse");
        assert_eq!(again, cfg);
    }
}
