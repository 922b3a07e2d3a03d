use crate::error::EngineError;
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize)]
pub struct Config {
    pub lnd: LndConfig,
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub actions: ActionsConfig,
}

#[derive(Debug, Deserialize)]
pub struct LndConfig {
    /// LND REST endpoint, e.g. "https://127.0.0.1:8080"
    pub rest_url: String,
    /// Path to a readonly macaroon
    pub macaroon_path: PathBuf,
    /// Path to LND's TLS certificate
    pub tls_cert_path: PathBuf,
}

#[derive(Debug, Deserialize)]
pub struct GeneralConfig {
    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Rolling window of history to evaluate, in days
    #[serde(default = "default_days")]
    pub days: u32,
    /// Poll interval driving the refresher, in seconds
    #[serde(default = "default_loop_interval")]
    pub loop_interval_secs: u64,
    /// Debounce delay between a change notification and the refresh
    #[serde(default = "default_refresh_delay")]
    pub refresh_delay_secs: u64,
}

/// Tuning knobs of the recommendation engine.
///
/// Fractions and distances are unitless; fee rates are ppm.
#[derive(Debug, Clone, Deserialize)]
pub struct ActionsConfig {
    /// Forwards needed before the flow is trusted to predict a balance target
    #[serde(default = "default_min_channel_forwards")]
    pub min_channel_forwards: u32,
    /// Capacity fraction that recent outbound forwards must sum to before an
    /// outbound fee rate is considered reliable
    #[serde(default = "default_min_out_fee_forward_fraction")]
    pub min_out_fee_forward_fraction: f64,
    /// Balance floor and ceiling as a fraction of capacity
    #[serde(default = "default_min_channel_balance_fraction")]
    pub min_channel_balance_fraction: f64,
    /// Minimum |distance| before a balance action is emitted
    #[serde(default = "default_min_rebalance_distance")]
    pub min_rebalance_distance: f64,
    /// Headroom kept above the largest forward seen in either direction
    #[serde(default = "default_largest_forward_margin_fraction")]
    pub largest_forward_margin_fraction: f64,
    /// |distance| beyond which a channel counts as out of bounds for fees
    #[serde(default = "default_min_fee_increase_distance")]
    pub min_fee_increase_distance: f64,
    /// Temporal aggressiveness of long-term fee increases
    #[serde(default = "default_fee_increase_multiplier")]
    pub fee_increase_multiplier: f64,
    /// Idle days before fee decreases begin
    #[serde(default = "default_fee_decrease_wait_days")]
    pub fee_decrease_wait_days: f64,
    /// Inflow share above which recent rebalance cost no longer floors decreases
    #[serde(default = "default_min_inflow_fraction")]
    pub min_inflow_fraction: f64,
    /// Absolute fee rate cap in ppm
    #[serde(default = "default_max_fee_rate")]
    pub max_fee_rate: u64,
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}
fn default_days() -> u32 {
    30
}
fn default_loop_interval() -> u64 {
    600
}
fn default_refresh_delay() -> u64 {
    10
}
fn default_min_channel_forwards() -> u32 {
    20
}
fn default_min_out_fee_forward_fraction() -> f64 {
    0.01
}
fn default_min_channel_balance_fraction() -> f64 {
    0.25
}
fn default_min_rebalance_distance() -> f64 {
    0.05
}
fn default_largest_forward_margin_fraction() -> f64 {
    0.1
}
fn default_min_fee_increase_distance() -> f64 {
    0.3
}
fn default_fee_increase_multiplier() -> f64 {
    3.0
}
fn default_fee_decrease_wait_days() -> f64 {
    4.0
}
fn default_min_inflow_fraction() -> f64 {
    0.3
}
fn default_max_fee_rate() -> u64 {
    2500
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            days: default_days(),
            loop_interval_secs: default_loop_interval(),
            refresh_delay_secs: default_refresh_delay(),
        }
    }
}

impl Default for ActionsConfig {
    fn default() -> Self {
        Self {
            min_channel_forwards: default_min_channel_forwards(),
            min_out_fee_forward_fraction: default_min_out_fee_forward_fraction(),
            min_channel_balance_fraction: default_min_channel_balance_fraction(),
            min_rebalance_distance: default_min_rebalance_distance(),
            largest_forward_margin_fraction: default_largest_forward_margin_fraction(),
            min_fee_increase_distance: default_min_fee_increase_distance(),
            fee_increase_multiplier: default_fee_increase_multiplier(),
            fee_decrease_wait_days: default_fee_decrease_wait_days(),
            min_inflow_fraction: default_min_inflow_fraction(),
            max_fee_rate: default_max_fee_rate(),
        }
    }
}

impl ActionsConfig {
    /// Check the engine invariants. Runs at construction; the engine refuses
    /// to start on a config that fails here.
    pub fn validate(&self, days: u32) -> Result<(), EngineError> {
        if days == 0 {
            return Err(EngineError::Config("days must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.min_out_fee_forward_fraction) {
            return Err(EngineError::Config(format!(
                "min_out_fee_forward_fraction ({}) must be within [0, 1]",
                self.min_out_fee_forward_fraction
            )));
        }
        if self.min_channel_balance_fraction <= 0.0 || self.min_channel_balance_fraction >= 0.5 {
            return Err(EngineError::Config(format!(
                "min_channel_balance_fraction ({}) must be within (0, 0.5)",
                self.min_channel_balance_fraction
            )));
        }
        if self.min_rebalance_distance <= 0.0 || self.min_rebalance_distance > 1.0 {
            return Err(EngineError::Config(format!(
                "min_rebalance_distance ({}) must be within (0, 1]",
                self.min_rebalance_distance
            )));
        }
        if self.largest_forward_margin_fraction < 0.0 {
            return Err(EngineError::Config(format!(
                "largest_forward_margin_fraction ({}) must not be negative",
                self.largest_forward_margin_fraction
            )));
        }
        if self.min_fee_increase_distance <= self.min_rebalance_distance
            || self.min_fee_increase_distance > 1.0
        {
            return Err(EngineError::Config(format!(
                "min_fee_increase_distance ({}) must be within (min_rebalance_distance, 1]",
                self.min_fee_increase_distance
            )));
        }
        if self.fee_increase_multiplier < 1.0 {
            return Err(EngineError::Config(format!(
                "fee_increase_multiplier ({}) must be at least 1",
                self.fee_increase_multiplier
            )));
        }
        if self.fee_decrease_wait_days < 0.0 || self.fee_decrease_wait_days >= f64::from(days) {
            return Err(EngineError::Config(format!(
                "fee_decrease_wait_days ({}) must be within [0, days)",
                self.fee_decrease_wait_days
            )));
        }
        if !(0.0..=1.0).contains(&self.min_inflow_fraction) {
            return Err(EngineError::Config(format!(
                "min_inflow_fraction ({}) must be within [0, 1]",
                self.min_inflow_fraction
            )));
        }
        if self.max_fee_rate == 0 {
            return Err(EngineError::Config("max_fee_rate must be positive".into()));
        }
        Ok(())
    }
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.actions.validate(self.general.days)?;
        if !self.lnd.tls_cert_path.exists() {
            anyhow::bail!(
                "TLS cert not found at: {}",
                self.lnd.tls_cert_path.display()
            );
        }
        if !self.lnd.macaroon_path.exists() {
            anyhow::bail!(
                "macaroon not found at: {}",
                self.lnd.macaroon_path.display()
            );
        }
        Ok(())
    }

    /// Create a config with all defaults for testing purposes.
    /// The cert and macaroon paths must exist for validation.
    #[cfg(test)]
    pub fn test_default(existing_path: std::path::PathBuf) -> Self {
        Self {
            lnd: LndConfig {
                rest_url: "https://127.0.0.1:8080".to_string(),
                macaroon_path: existing_path.clone(),
                tls_cert_path: existing_path,
            },
            general: GeneralConfig::default(),
            actions: ActionsConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    /// A config whose cert and macaroon paths point at a real file. The
    /// guard keeps that file alive for the duration of the test.
    fn make_valid_config() -> (NamedTempFile, Config) {
        let credentials = NamedTempFile::new().unwrap();
        let config = Config::test_default(credentials.path().to_path_buf());
        (credentials, config)
    }

    #[test]
    fn test_validate_defaults_pass() {
        let (_credentials, config) = make_valid_config();
        assert!(config.validate().is_ok(), "{}", config.validate().unwrap_err());
    }

    #[test]
    fn test_validate_zero_days() {
        let (_credentials, mut config) = make_valid_config();
        config.general.days = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("days"));
    }

    #[test]
    fn test_validate_balance_fraction_bounds() {
        let (_credentials, mut config) = make_valid_config();
        config.actions.min_channel_balance_fraction = 0.5;
        assert!(config.validate().is_err());

        let (_credentials, mut config) = make_valid_config();
        config.actions.min_channel_balance_fraction = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rebalance_distance_bounds() {
        let (_credentials, mut config) = make_valid_config();
        config.actions.min_rebalance_distance = 0.0;
        assert!(config.validate().is_err());

        let (_credentials, mut config) = make_valid_config();
        config.actions.min_rebalance_distance = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_fee_increase_distance_must_exceed_rebalance_distance() {
        let (_credentials, mut config) = make_valid_config();
        config.actions.min_fee_increase_distance = config.actions.min_rebalance_distance;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("min_fee_increase_distance"));
    }

    #[test]
    fn test_validate_fee_decrease_wait_days_below_window() {
        let (_credentials, mut config) = make_valid_config();
        config.actions.fee_decrease_wait_days = 30.0; // equals days
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("fee_decrease_wait_days"));

        let (_credentials, mut config) = make_valid_config();
        config.actions.fee_decrease_wait_days = -1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_multiplier_at_least_one() {
        let (_credentials, mut config) = make_valid_config();
        config.actions.fee_increase_multiplier = 0.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_max_fee_rate_positive() {
        let (_credentials, mut config) = make_valid_config();
        config.actions.max_fee_rate = 0;
        assert!(config.validate().is_err());
    }

    /// Path of a temp file that no longer exists.
    fn missing_path() -> PathBuf {
        let file = NamedTempFile::new().unwrap();
        let path = file.path().to_path_buf();
        drop(file);
        path
    }

    #[test]
    fn test_validate_cert_missing() {
        let (_credentials, mut config) = make_valid_config();
        config.lnd.tls_cert_path = missing_path();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("TLS cert not found"));
    }

    #[test]
    fn test_validate_macaroon_missing() {
        let (_credentials, mut config) = make_valid_config();
        config.lnd.macaroon_path = missing_path();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("macaroon not found"));
    }

    #[test]
    fn test_load_reads_file_and_validates() {
        let dir = tempfile::tempdir().unwrap();
        let cert_path = dir.path().join("tls.cert");
        let macaroon_path = dir.path().join("readonly.macaroon");
        std::fs::write(&cert_path, "cert").unwrap();
        std::fs::write(&macaroon_path, "macaroon").unwrap();

        let config_path = dir.path().join("lnd-advisor.toml");
        std::fs::write(
            &config_path,
            format!(
                "[lnd]\nrest_url = \"https://127.0.0.1:8080\"\nmacaroon_path = {:?}\ntls_cert_path = {:?}\n\n[general]\ndays = 14\n",
                macaroon_path, cert_path
            ),
        )
        .unwrap();

        let config = Config::load(&config_path).unwrap();
        assert_eq!(config.general.days, 14);
        assert_eq!(config.lnd.tls_cert_path, cert_path);

        // Deleting the credentials makes the same file fail validation.
        std::fs::remove_file(&macaroon_path).unwrap();
        assert!(Config::load(&config_path).is_err());
    }

    #[test]
    fn test_toml_deserialize_minimal() {
        let toml_str = r#"
[lnd]
rest_url = "https://127.0.0.1:8080"
macaroon_path = "/tmp/readonly.macaroon"
tls_cert_path = "/tmp/tls.cert"
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.lnd.rest_url, "https://127.0.0.1:8080");
        // Reference defaults should be applied
        assert_eq!(config.general.days, 30);
        assert_eq!(config.general.loop_interval_secs, 600);
        assert_eq!(config.general.refresh_delay_secs, 10);
        assert_eq!(config.actions.min_channel_forwards, 20);
        assert_eq!(config.actions.max_fee_rate, 2500);
        assert!((config.actions.min_fee_increase_distance - 0.3).abs() < f64::EPSILON);
    }

    #[test]
    fn test_toml_overrides_actions() {
        let toml_str = r#"
[lnd]
rest_url = "https://127.0.0.1:8080"
macaroon_path = "/tmp/readonly.macaroon"
tls_cert_path = "/tmp/tls.cert"

[actions]
min_channel_forwards = 5
max_fee_rate = 1000
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.actions.min_channel_forwards, 5);
        assert_eq!(config.actions.max_fee_rate, 1000);
        // Untouched fields keep their defaults
        assert!((config.actions.min_rebalance_distance - 0.05).abs() < f64::EPSILON);
    }
}
