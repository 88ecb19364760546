//! Configuration System using Figment
//!
//! Configuration is layered from:
//! 1. Built-in defaults (every field has one, so an absent file is valid)
//! 2. `config/enose.toml` (or a path given by the caller)
//! 3. Environment variables prefixed with `ENOSE_`, using `__` as the nesting
//!    separator (e.g. `ENOSE_CAPTURE__OUTPUT_DIR=/data`)
//! 4. The raw `FIREBASE_DATABASE_URL`, `FIREBASE_CREDENTIALS_BASE64` and
//!    `FIREBASE_CREDENTIALS_PATH` variables, mapped into the `remote` section
//!
//! # Example
//! ```no_run
//! use enose_capture::config::AppConfig;
//!
//! let config = AppConfig::load()?;
//! println!("Writing under {}", config.capture.output_dir.display());
//! # Ok::<(), figment::Error>(())
//! ```

use crate::board::BoardFamily;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Capture timing and output settings
    pub capture: CaptureConfig,
    /// Per-family serial and unit settings
    pub families: FamiliesConfig,
    /// Optional remote mirror
    pub remote: RemoteConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    pub log_format: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "e-nose capture".to_string(),
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
        }
    }
}

/// Capture timing and output settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Root folder under which `<Stage>/<Substance>/` folders are created
    pub output_dir: PathBuf,
    /// How long a writer waits for every enabled board before freezing the header
    pub header_wait_secs: f64,
    /// Bounded serial read timeout; the stop signal is observed at least this often
    pub read_timeout_ms: u64,
    /// Grace period per task when stopping a session
    pub join_timeout_ms: u64,
    /// Poll period of the auto-stop watcher and the header wait
    pub watcher_poll_ms: u64,
    /// Backoff after a transient read error
    pub read_backoff_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("."),
            header_wait_secs: 15.0,
            read_timeout_ms: 1000,
            join_timeout_ms: 2000,
            watcher_poll_ms: 250,
            read_backoff_ms: 250,
        }
    }
}

/// Upper bound on `capture.header_wait_secs` (one hour).
pub const MAX_HEADER_WAIT_SECS: f64 = 3600.0;

impl CaptureConfig {
    /// Header wait as a `Duration`, clamped to `0..=MAX_HEADER_WAIT_SECS`.
    /// NaN counts as zero.
    pub fn header_wait(&self) -> Duration {
        let secs = if self.header_wait_secs.is_nan() {
            0.0
        } else {
            self.header_wait_secs.clamp(0.0, MAX_HEADER_WAIT_SECS)
        };
        Duration::from_secs_f64(secs)
    }

    /// Serial read timeout as a `Duration`.
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Join grace period as a `Duration`.
    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    /// Watcher poll period as a `Duration`.
    pub fn watcher_poll(&self) -> Duration {
        Duration::from_millis(self.watcher_poll_ms)
    }

    /// Read-error backoff as a `Duration`.
    pub fn read_backoff(&self) -> Duration {
        Duration::from_millis(self.read_backoff_ms)
    }
}

/// Settings for both board families
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FamiliesConfig {
    /// Simple start/end-marker boards (B1, B2, ...)
    pub standard: FamilyConfig,
    /// Battery-line boards (LB1, LB2, ...)
    pub libelium: FamilyConfig,
}

impl Default for FamiliesConfig {
    fn default() -> Self {
        Self {
            standard: FamilyConfig {
                baud_rate: 9600,
                settle_ms: 1000,
                expected_sensors: BTreeMap::new(),
                default_units: BTreeMap::new(),
                fallback_unit: None,
            },
            libelium: FamilyConfig {
                baud_rate: 115_200,
                settle_ms: 600,
                expected_sensors: BTreeMap::from([
                    ("LB1".to_string(), owned(&["SO2", "NO2", "H2S", "CH4"])),
                    ("LB2".to_string(), owned(&["NO", "CO", "NO2", "NH3", "O2"])),
                ]),
                default_units: BTreeMap::from([("O2".to_string(), "%".to_string())]),
                fallback_unit: Some("ppm".to_string()),
            },
        }
    }
}

impl FamiliesConfig {
    /// Settings for one family.
    pub fn get(&self, family: BoardFamily) -> &FamilyConfig {
        match family {
            BoardFamily::Standard => &self.standard,
            BoardFamily::Libelium => &self.libelium,
        }
    }
}

/// Serial and unit settings for one board family
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FamilyConfig {
    /// Fixed baud rate of the family's firmware
    pub baud_rate: u32,
    /// Delay after opening the port (boards reset on connect)
    pub settle_ms: u64,
    /// Sensors every board of this family is expected to report, by board id.
    /// Seeds the header before any sample arrives.
    pub expected_sensors: BTreeMap<String, Vec<String>>,
    /// Unit used when a line carries none, by (upper-cased) label
    pub default_units: BTreeMap<String, String>,
    /// Unit used when a line carries none and the label has no entry above
    pub fallback_unit: Option<String>,
}

impl Default for FamilyConfig {
    fn default() -> Self {
        FamiliesConfig::default().standard
    }
}

impl FamilyConfig {
    /// Settle delay as a `Duration`.
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}

/// Remote mirror configuration (Firebase Realtime Database)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Database URL; mirroring is disabled when absent
    pub database_url: Option<String>,
    /// Base64-encoded credential JSON
    pub credentials_base64: Option<String>,
    /// Path to a credential JSON file
    pub credentials_path: Option<PathBuf>,
    /// Consecutive failures before the mirror goes offline for the session
    pub error_budget: u32,
    /// Per-request timeout
    pub request_timeout_ms: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            credentials_base64: None,
            credentials_path: None,
            error_budget: 3,
            request_timeout_ms: 5000,
        }
    }
}

fn owned(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl AppConfig {
    /// Load configuration from `config/enose.toml` and environment variables
    ///
    /// Example override: `ENOSE_APPLICATION__LOG_LEVEL=debug`
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from("config/enose.toml")
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Self::figment(path.as_ref()).extract()
    }

    /// The layered provider stack used by [`AppConfig::load_from`].
    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("ENOSE_").split("__"))
            .merge(
                Env::raw()
                    .only(&[
                        "FIREBASE_DATABASE_URL",
                        "FIREBASE_CREDENTIALS_BASE64",
                        "FIREBASE_CREDENTIALS_PATH",
                    ])
                    .map(|key| {
                        let key = key.as_str().to_ascii_lowercase();
                        format!("remote.{}", key.trim_start_matches("firebase_")).into()
                    }),
            )
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.as_str()) {
            return Err(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            ));
        }

        if self.capture.read_timeout_ms == 0 || self.capture.join_timeout_ms == 0 {
            return Err("read_timeout_ms and join_timeout_ms must be positive".to_string());
        }
        if self.capture.watcher_poll_ms == 0 {
            return Err("watcher_poll_ms must be positive".to_string());
        }
        let header_wait = self.capture.header_wait_secs;
        if !(0.0..=MAX_HEADER_WAIT_SECS).contains(&header_wait) {
            return Err(format!(
                "Invalid header_wait_secs {header_wait}. Must be between 0 and {MAX_HEADER_WAIT_SECS}"
            ));
        }

        for (name, family) in [
            ("standard", &self.families.standard),
            ("libelium", &self.families.libelium),
        ] {
            if family.baud_rate == 0 {
                return Err(format!("families.{name}.baud_rate must be positive"));
            }
        }

        if self.remote.error_budget == 0 {
            return Err("remote.error_budget must be at least 1".to_string());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.families.standard.baud_rate, 9600);
        assert_eq!(config.families.libelium.baud_rate, 115_200);
        assert_eq!(config.remote.error_budget, 3);
        assert!(config.remote.database_url.is_none());
    }

    #[test]
    fn file_values_override_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            [application]
            log_level = "debug"

            [capture]
            output_dir = "/tmp/enose"
            header_wait_secs = 2.5

            [families.libelium]
            baud_rate = 57600
            "#
        )
        .unwrap();

        let config = AppConfig::load_from(file.path()).unwrap();
        assert_eq!(config.application.log_level, "debug");
        assert_eq!(config.capture.output_dir, PathBuf::from("/tmp/enose"));
        assert_eq!(config.capture.header_wait(), Duration::from_millis(2500));
        assert_eq!(config.families.libelium.baud_rate, 57600);
        // untouched keys keep their defaults
        assert_eq!(config.families.libelium.settle_ms, 600);
        assert_eq!(config.capture.join_timeout_ms, 2000);
        assert!(config
            .families
            .libelium
            .expected_sensors
            .contains_key("LB2"));
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = AppConfig::load_from("does/not/exist.toml").unwrap();
        assert_eq!(config.capture.read_timeout_ms, 1000);
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = AppConfig::default();
        config.application.log_level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_error_budget_is_rejected() {
        let mut config = AppConfig::default();
        config.remote.error_budget = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn header_wait_is_clamped() {
        let mut capture = CaptureConfig::default();
        capture.header_wait_secs = 1e20;
        assert_eq!(capture.header_wait(), Duration::from_secs(3600));
        capture.header_wait_secs = f64::INFINITY;
        assert_eq!(capture.header_wait(), Duration::from_secs(3600));
        capture.header_wait_secs = f64::NAN;
        assert_eq!(capture.header_wait(), Duration::ZERO);
        capture.header_wait_secs = -4.0;
        assert_eq!(capture.header_wait(), Duration::ZERO);
    }

    #[test]
    fn out_of_range_header_wait_is_rejected() {
        for bad in [1e20, f64::INFINITY, f64::NAN, -1.0, MAX_HEADER_WAIT_SECS + 1.0] {
            let mut config = AppConfig::default();
            config.capture.header_wait_secs = bad;
            assert!(config.validate().is_err(), "accepted {bad}");
        }

        let mut config = AppConfig::default();
        config.capture.header_wait_secs = MAX_HEADER_WAIT_SECS;
        assert!(config.validate().is_ok());
    }
}
