//! Monitor configuration
//!
//! Settings come from an optional YAML file layered under command line flags.
//! Durations are written in the short form used throughout the deployment
//! manifests (`90s`, `5m`, `24h`, `30d`).

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// CSI driver names registered by democratic-csi
pub const DEFAULT_CSI_DRIVERS: &[&str] = &[
    "org.democratic-csi.iscsi",
    "org.democratic-csi.nfs",
    "org.democratic-csi.smb",
    "democratic-csi",
];

const MIN_SCAN_INTERVAL: Duration = Duration::from_secs(60);
const MAX_SCAN_INTERVAL: Duration = Duration::from_secs(24 * 3600);
const MIN_AGE_THRESHOLD: Duration = Duration::from_secs(60);

// =============================================================================
// Duration Parsing
// =============================================================================

/// Parse a duration like `30s`, `5m`, `24h`, `30d` or a bare number of seconds
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::DurationParse("empty duration".into()));
    }

    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (num, unit) = s.split_at(split);
    let value: u64 = num
        .parse()
        .map_err(|_| Error::DurationParse(format!("invalid duration: {}", s)))?;

    let multiplier = match unit.trim() {
        "" | "s" => 1,
        "m" => 60,
        "h" => 3600,
        "d" => 86400,
        other => {
            return Err(Error::DurationParse(format!(
                "unknown duration unit '{}' in {}",
                other, s
            )))
        }
    };

    value
        .checked_mul(multiplier)
        .map(Duration::from_secs)
        .ok_or_else(|| Error::DurationParse(format!("duration overflows: {}", s)))
}

/// Render a duration in the largest whole unit
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs != 0 && secs % 86400 == 0 {
        format!("{}d", secs / 86400)
    } else if secs != 0 && secs % 3600 == 0 {
        format!("{}h", secs / 3600)
    } else if secs != 0 && secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{}s", secs)
    }
}

mod duration_str {
    use super::{format_duration, parse_duration};
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Thresholds
// =============================================================================

/// Minimum ages before a resource of each kind may be reported
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Thresholds {
    #[serde(with = "duration_str")]
    pub volume_age: Duration,
    #[serde(with = "duration_str")]
    pub claim_age: Duration,
    #[serde(with = "duration_str")]
    pub snapshot_age: Duration,
    /// Age after which an unreferenced backend snapshot is reported
    #[serde(with = "duration_str")]
    pub snapshot_retention: Duration,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            volume_age: Duration::from_secs(24 * 3600),
            claim_age: Duration::from_secs(3600),
            snapshot_age: Duration::from_secs(24 * 3600),
            snapshot_retention: Duration::from_secs(30 * 86400),
        }
    }
}

impl Thresholds {
    fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("volumeAge", self.volume_age),
            ("claimAge", self.claim_age),
            ("snapshotAge", self.snapshot_age),
            ("snapshotRetention", self.snapshot_retention),
        ] {
            if value.is_zero() {
                return Err(Error::Configuration(format!("{} must be non-zero", name)));
            }
        }
        Ok(())
    }
}

// =============================================================================
// Retry Settings
// =============================================================================

/// Retry behaviour for every upstream call
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RetryConfig {
    pub max_attempts: u32,
    #[serde(with = "duration_str")]
    pub attempt_timeout: Duration,
    #[serde(with = "duration_str")]
    pub initial_backoff: Duration,
    #[serde(with = "duration_str")]
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            attempt_timeout: Duration::from_secs(30),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(10),
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::Configuration("retry.maxAttempts must be at least 1".into()));
        }
        if self.attempt_timeout.is_zero() {
            return Err(Error::Configuration("retry.attemptTimeout must be non-zero".into()));
        }
        if self.multiplier < 1.0 {
            return Err(Error::Configuration("retry.multiplier must be >= 1.0".into()));
        }
        Ok(())
    }
}

// =============================================================================
// Scan Settings
// =============================================================================

/// Scan scheduling and scope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ScanConfig {
    #[serde(with = "duration_str")]
    pub interval: Duration,
    /// How long shutdown waits for an in-flight scan
    #[serde(with = "duration_str")]
    pub shutdown_grace: Duration,
    /// Restrict claim and snapshot listing to one namespace
    pub namespace: Option<String>,
    /// Pool utilization above which a warning is logged
    pub pool_usage_warn_percent: f64,
    pub thresholds: Thresholds,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            shutdown_grace: Duration::from_secs(30),
            namespace: None,
            pool_usage_warn_percent: 80.0,
            thresholds: Thresholds::default(),
        }
    }
}

impl ScanConfig {
    /// Checks the orchestrator cannot run without
    pub fn validate(&self) -> Result<()> {
        if self.interval.is_zero() {
            return Err(Error::Configuration("scan.interval must be non-zero".into()));
        }
        if self.shutdown_grace.is_zero() {
            return Err(Error::Configuration("scan.shutdownGrace must be non-zero".into()));
        }
        if !(0.0..=100.0).contains(&self.pool_usage_warn_percent) {
            return Err(Error::Configuration(
                "scan.poolUsageWarnPercent must be between 0 and 100".into(),
            ));
        }
        self.thresholds.validate()
    }
}

// =============================================================================
// Upstream Settings
// =============================================================================

/// Kubernetes-side scope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct KubernetesConfig {
    /// Only volumes provisioned by these drivers are inspected; empty means all
    pub csi_drivers: Vec<String>,
    /// Namespace the CSI driver runs in; `None` searches all namespaces
    pub driver_namespace: Option<String>,
    /// Label selectors identifying CSI driver pods
    pub driver_selectors: Vec<String>,
}

impl Default for KubernetesConfig {
    fn default() -> Self {
        Self {
            csi_drivers: DEFAULT_CSI_DRIVERS.iter().map(|s| s.to_string()).collect(),
            driver_namespace: None,
            driver_selectors: vec![
                "app.kubernetes.io/name=democratic-csi".into(),
                "app=democratic-csi".into(),
            ],
        }
    }
}

/// TrueNAS connection settings
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TrueNasConfig {
    /// Base URL, e.g. `https://truenas.local`
    pub url: String,
    pub api_key: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub verify_tls: bool,
    #[serde(with = "duration_str")]
    pub request_timeout: Duration,
    /// Parent dataset holding CSI volumes; enables backend-to-cluster checks
    pub dataset_prefix: Option<String>,
}

impl Default for TrueNasConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            api_key: None,
            username: None,
            password: None,
            verify_tls: true,
            request_timeout: Duration::from_secs(30),
            dataset_prefix: None,
        }
    }
}

impl std::fmt::Debug for TrueNasConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrueNasConfig")
            .field("url", &self.url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("verify_tls", &self.verify_tls)
            .field("request_timeout", &self.request_timeout)
            .field("dataset_prefix", &self.dataset_prefix)
            .finish()
    }
}

impl TrueNasConfig {
    fn validate(&self) -> Result<()> {
        if self.url.is_empty() {
            return Err(Error::Configuration("truenas.url is required".into()));
        }
        if !self.url.starts_with("http://") && !self.url.starts_with("https://") {
            return Err(Error::Configuration(format!(
                "truenas.url must start with http:// or https://: {}",
                self.url
            )));
        }
        let has_key = self.api_key.as_deref().map_or(false, |k| !k.is_empty());
        let has_basic = self.username.as_deref().map_or(false, |u| !u.is_empty())
            && self.password.as_deref().map_or(false, |p| !p.is_empty());
        if !has_key && !has_basic {
            return Err(Error::Configuration(
                "truenas requires either apiKey or username and password".into(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Application Config
// =============================================================================

/// Complete monitor configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AppConfig {
    pub scan: ScanConfig,
    pub retry: RetryConfig,
    pub kubernetes: KubernetesConfig,
    pub truenas: TrueNasConfig,
}

impl AppConfig {
    /// Load a YAML configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!(path = %path.display(), "Loading configuration file");
        let raw = std::fs::read_to_string(path)?;
        Self::from_yaml(&raw)
    }

    /// Parse configuration from YAML text
    pub fn from_yaml(raw: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(raw)?)
    }

    /// Validate the complete configuration for a production deployment
    pub fn validate(&self) -> Result<()> {
        self.scan.validate()?;
        if self.scan.interval < MIN_SCAN_INTERVAL || self.scan.interval > MAX_SCAN_INTERVAL {
            return Err(Error::Configuration(format!(
                "scan.interval must be between {} and {}",
                format_duration(MIN_SCAN_INTERVAL),
                format_duration(MAX_SCAN_INTERVAL)
            )));
        }
        if self.scan.thresholds.volume_age < MIN_AGE_THRESHOLD
            || self.scan.thresholds.claim_age < MIN_AGE_THRESHOLD
        {
            return Err(Error::Configuration(format!(
                "volume and claim age thresholds must be at least {}",
                format_duration(MIN_AGE_THRESHOLD)
            )));
        }
        self.retry.validate()?;
        self.truenas.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::io::Write;

    fn valid_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.truenas.url = "https://truenas.local".into();
        config.truenas.api_key = Some("1-abcdef".into());
        config
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("24h").unwrap(), Duration::from_secs(86400));
        assert_eq!(parse_duration("30d").unwrap(), Duration::from_secs(30 * 86400));
        assert_eq!(parse_duration("45").unwrap(), Duration::from_secs(45));
        assert_matches!(parse_duration(""), Err(Error::DurationParse(_)));
        assert_matches!(parse_duration("5w"), Err(Error::DurationParse(_)));
        assert_matches!(parse_duration("h"), Err(Error::DurationParse(_)));
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(3600)), "1h");
        assert_eq!(format_duration(Duration::from_secs(30 * 86400)), "30d");
        assert_eq!(format_duration(Duration::from_secs(90)), "90s");
        assert_eq!(format_duration(Duration::ZERO), "0s");
    }

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.scan.interval, Duration::from_secs(300));
        assert_eq!(config.scan.shutdown_grace, Duration::from_secs(30));
        assert_eq!(config.scan.thresholds.snapshot_retention, Duration::from_secs(30 * 86400));
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.kubernetes.csi_drivers.len(), 4);
    }

    #[test]
    fn test_validate() {
        assert!(valid_config().validate().is_ok());

        let mut config = valid_config();
        config.scan.interval = Duration::from_secs(10);
        assert_matches!(config.validate(), Err(Error::Configuration(_)));

        let mut config = valid_config();
        config.truenas.api_key = None;
        assert_matches!(config.validate(), Err(Error::Configuration(_)));
        config.truenas.username = Some("admin".into());
        config.truenas.password = Some("secret".into());
        assert!(config.validate().is_ok());

        let mut config = valid_config();
        config.truenas.url = "truenas.local".into();
        assert_matches!(config.validate(), Err(Error::Configuration(_)));

        let mut config = valid_config();
        config.scan.thresholds.snapshot_age = Duration::ZERO;
        assert_matches!(config.validate(), Err(Error::Configuration(_)));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
scan:
  interval: 10m
  namespace: storage
  thresholds:
    claimAge: 2h
    snapshotRetention: 14d
truenas:
  url: https://nas.example.com
  apiKey: 1-secret
  datasetPrefix: tank/k8s/volumes
"#
        )
        .unwrap();

        let config = AppConfig::from_file(file.path()).unwrap();
        assert_eq!(config.scan.interval, Duration::from_secs(600));
        assert_eq!(config.scan.namespace.as_deref(), Some("storage"));
        assert_eq!(config.scan.thresholds.claim_age, Duration::from_secs(7200));
        assert_eq!(config.scan.thresholds.snapshot_retention, Duration::from_secs(14 * 86400));
        // Unset fields keep their defaults
        assert_eq!(config.scan.thresholds.volume_age, Duration::from_secs(86400));
        assert_eq!(config.truenas.dataset_prefix.as_deref(), Some("tank/k8s/volumes"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_bad_duration_in_file() {
        let err = AppConfig::from_yaml("scan:\n  interval: soon\n").unwrap_err();
        assert_matches!(err, Error::YamlParse(_));
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let rendered = format!("{:?}", valid_config().truenas);
        assert!(!rendered.contains("1-abcdef"));
        assert!(rendered.contains("<redacted>"));
    }
}
