//! Configuration loading from TOML files
//!
//! Config file is selected via `--config <path>` (default: config/dev.toml).
//! Every section and field has a default, so a partial file is valid.

use crate::services::crossing_detector::{DetectorSettings, NoEchoPolicy};
use anyhow::{bail, Context};
use serde::Deserialize;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
pub struct SiteConfig {
    /// Identifier reported in status, metrics labels and session records
    #[serde(default = "default_site_id")]
    pub id: String,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self { id: default_site_id() }
    }
}

fn default_site_id() -> String {
    "doorway".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct DetectorConfig {
    /// Readings below this (sensor units, cm for HC-SR04) interrupt the beam
    #[serde(default = "default_threshold_distance")]
    pub threshold_distance: f64,
    /// Maximum gap between the two beams arming for one crossing
    #[serde(default = "default_sequence_timeout_ms")]
    pub sequence_timeout_ms: u64,
    /// Consecutive in-range readings before a beam arms
    #[serde(default = "default_min_stable_samples")]
    pub min_stable_samples: u32,
    #[serde(default = "default_min_valid_distance")]
    pub min_valid_distance: f64,
    #[serde(default = "default_max_valid_distance")]
    pub max_valid_distance: f64,
    #[serde(default)]
    pub no_echo: NoEchoPolicy,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            threshold_distance: default_threshold_distance(),
            sequence_timeout_ms: default_sequence_timeout_ms(),
            min_stable_samples: default_min_stable_samples(),
            min_valid_distance: default_min_valid_distance(),
            max_valid_distance: default_max_valid_distance(),
            no_echo: NoEchoPolicy::default(),
        }
    }
}

fn default_threshold_distance() -> f64 {
    75.0
}

fn default_sequence_timeout_ms() -> u64 {
    3000
}

fn default_min_stable_samples() -> u32 {
    1
}

fn default_min_valid_distance() -> f64 {
    2.0
}

fn default_max_valid_distance() -> f64 {
    400.0
}

#[derive(Debug, Clone, Deserialize)]
pub struct SamplingConfig {
    /// Tick cadence of the polling loop
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Consecutive no-echo ticks before a sensor is reported (0 disables)
    #[serde(default = "default_unresponsive_after")]
    pub unresponsive_after: u32,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            unresponsive_after: default_unresponsive_after(),
        }
    }
}

fn default_tick_interval_ms() -> u64 {
    100
}

fn default_unresponsive_after() -> u32 {
    10
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    /// JSONL capture played back as the range source
    #[serde(default = "default_capture_file")]
    pub capture_file: String,
    #[serde(default)]
    pub loop_playback: bool,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self { capture_file: default_capture_file(), loop_playback: false }
    }
}

fn default_capture_file() -> String {
    "captures/doorway.jsonl".to_string()
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct WebhookConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Called (GET) when the room becomes occupied
    #[serde(default)]
    pub occupied_url: String,
    /// Called (GET) when the room becomes empty
    #[serde(default)]
    pub empty_url: String,
    /// Called (GET) when a sensor goes unresponsive or recovers, with
    /// `sensor` and `state` query parameters
    #[serde(default)]
    pub alert_url: String,
    #[serde(default = "default_webhook_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_webhook_timeout_ms() -> u64 {
    5000
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatusConfig {
    #[serde(default = "default_status_bind_address")]
    pub bind_address: String,
    /// Status/dashboard/metrics HTTP port (0 to disable)
    #[serde(default = "default_status_port")]
    pub port: u16,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self { bind_address: default_status_bind_address(), port: default_status_port() }
    }
}

fn default_status_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_status_port() -> u16 {
    8080
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionsConfig {
    /// JSONL file for completed sessions (empty to disable)
    #[serde(default = "default_sessions_file")]
    pub file: String,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self { file: default_sessions_file() }
    }
}

fn default_sessions_file() -> String {
    "sessions.jsonl".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_interval_secs")]
    pub interval_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: default_metrics_interval_secs() }
    }
}

fn default_metrics_interval_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub site: SiteConfig,
    #[serde(default)]
    pub detector: DetectorConfig,
    #[serde(default)]
    pub sampling: SamplingConfig,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub status: StatusConfig,
    #[serde(default)]
    pub sessions: SessionsConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    site_id: String,
    detector: DetectorSettings,
    tick_interval_ms: u64,
    unresponsive_after: u32,
    capture_file: String,
    loop_playback: bool,
    webhook_enabled: bool,
    webhook_occupied_url: String,
    webhook_empty_url: String,
    webhook_alert_url: String,
    webhook_timeout_ms: u64,
    status_bind_address: String,
    status_port: u16,
    sessions_file: String,
    metrics_interval_secs: u64,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_toml(TomlConfig::default(), "default".to_string())
    }
}

impl Config {
    fn from_toml(toml_config: TomlConfig, config_file: String) -> Self {
        let detector = toml_config.detector;
        Self {
            site_id: toml_config.site.id,
            detector: DetectorSettings {
                threshold_distance: detector.threshold_distance,
                sequence_timeout_ms: detector.sequence_timeout_ms,
                min_stable_samples: detector.min_stable_samples,
                min_valid_distance: detector.min_valid_distance,
                max_valid_distance: detector.max_valid_distance,
                no_echo: detector.no_echo,
            },
            tick_interval_ms: toml_config.sampling.tick_interval_ms,
            unresponsive_after: toml_config.sampling.unresponsive_after,
            capture_file: toml_config.source.capture_file,
            loop_playback: toml_config.source.loop_playback,
            webhook_enabled: toml_config.webhook.enabled,
            webhook_occupied_url: toml_config.webhook.occupied_url,
            webhook_empty_url: toml_config.webhook.empty_url,
            webhook_alert_url: toml_config.webhook.alert_url,
            webhook_timeout_ms: toml_config.webhook.timeout_ms,
            status_bind_address: toml_config.status.bind_address,
            status_port: toml_config.status.port,
            sessions_file: toml_config.sessions.file,
            metrics_interval_secs: toml_config.metrics.interval_secs,
            config_file,
        }
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str, config_file: &str) -> anyhow::Result<Self> {
        let toml_config: TomlConfig = toml::from_str(content)
            .with_context(|| format!("Failed to parse config file {}", config_file))?;
        let config = Self::from_toml(toml_config, config_file.to_string());
        config.validate().with_context(|| format!("Invalid config file {}", config_file))?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml_str(&content, &path.display().to_string())
    }

    /// Load configuration - falls back to defaults when the file is missing.
    /// A file that exists but is malformed or invalid is still an error.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::warn!(config_file = %path.display(), "config_not_found_using_defaults");
            return Ok(Self::default());
        }
        Self::from_file(path)
    }

    fn validate(&self) -> anyhow::Result<()> {
        let d = &self.detector;
        if !(d.threshold_distance.is_finite() && d.threshold_distance > 0.0) {
            bail!("detector.threshold_distance must be positive, got {}", d.threshold_distance);
        }
        if d.sequence_timeout_ms == 0 {
            bail!("detector.sequence_timeout_ms must be positive");
        }
        if d.min_valid_distance < 0.0 || d.min_valid_distance >= d.max_valid_distance {
            bail!(
                "detector plausibility window is empty ({} .. {})",
                d.min_valid_distance,
                d.max_valid_distance
            );
        }
        if d.threshold_distance <= d.min_valid_distance {
            bail!(
                "detector.threshold_distance {} is below min_valid_distance {}",
                d.threshold_distance,
                d.min_valid_distance
            );
        }
        if d.threshold_distance >= d.max_valid_distance {
            bail!(
                "detector.threshold_distance {} must be below max_valid_distance {}",
                d.threshold_distance,
                d.max_valid_distance
            );
        }
        if self.tick_interval_ms == 0 {
            bail!("sampling.tick_interval_ms must be positive");
        }
        if self.webhook_enabled
            && self.webhook_occupied_url.is_empty()
            && self.webhook_empty_url.is_empty()
            && self.webhook_alert_url.is_empty()
        {
            bail!("webhook is enabled but no occupied_url, empty_url or alert_url is set");
        }
        Ok(())
    }

    // Getters for all config fields
    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    pub fn detector_settings(&self) -> DetectorSettings {
        self.detector
    }

    pub fn threshold_distance(&self) -> f64 {
        self.detector.threshold_distance
    }

    pub fn sequence_timeout_ms(&self) -> u64 {
        self.detector.sequence_timeout_ms
    }

    pub fn tick_interval_ms(&self) -> u64 {
        self.tick_interval_ms
    }

    pub fn unresponsive_after(&self) -> u32 {
        self.unresponsive_after
    }

    pub fn capture_file(&self) -> &str {
        &self.capture_file
    }

    pub fn loop_playback(&self) -> bool {
        self.loop_playback
    }

    pub fn webhook_enabled(&self) -> bool {
        self.webhook_enabled
    }

    pub fn webhook_occupied_url(&self) -> &str {
        &self.webhook_occupied_url
    }

    pub fn webhook_empty_url(&self) -> &str {
        &self.webhook_empty_url
    }

    pub fn webhook_alert_url(&self) -> &str {
        &self.webhook_alert_url
    }

    pub fn webhook_timeout_ms(&self) -> u64 {
        self.webhook_timeout_ms
    }

    pub fn status_bind_address(&self) -> &str {
        &self.status_bind_address
    }

    pub fn status_port(&self) -> u16 {
        self.status_port
    }

    pub fn sessions_file(&self) -> &str {
        &self.sessions_file
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    /// Override detector thresholds (replay tool flags)
    pub fn with_detector_overrides(
        mut self,
        threshold_distance: Option<f64>,
        sequence_timeout_ms: Option<u64>,
    ) -> anyhow::Result<Self> {
        if let Some(threshold) = threshold_distance {
            self.detector.threshold_distance = threshold;
        }
        if let Some(timeout) = sequence_timeout_ms {
            self.detector.sequence_timeout_ms = timeout;
        }
        self.validate()?;
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.site_id(), "doorway");
        assert_eq!(config.threshold_distance(), 75.0);
        assert_eq!(config.sequence_timeout_ms(), 3000);
        assert_eq!(config.tick_interval_ms(), 100);
        assert_eq!(config.unresponsive_after(), 10);
        assert_eq!(config.status_port(), 8080);
        assert_eq!(config.sessions_file(), "sessions.jsonl");
        assert!(!config.webhook_enabled());
        assert_eq!(config.detector_settings(), DetectorSettings::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config = Config::from_toml_str(
            r#"
[detector]
threshold_distance = 50.0
no_echo = "clear"
"#,
            "inline",
        )
        .unwrap();
        assert_eq!(config.threshold_distance(), 50.0);
        assert_eq!(config.detector_settings().no_echo, NoEchoPolicy::Clear);
        assert_eq!(config.sequence_timeout_ms(), 3000);
        assert_eq!(config.site_id(), "doorway");
    }

    #[test]
    fn test_rejects_zero_timeout() {
        let err = Config::from_toml_str("[detector]\nsequence_timeout_ms = 0\n", "inline")
            .unwrap_err();
        assert!(format!("{err:#}").contains("sequence_timeout_ms"));
    }

    #[test]
    fn test_rejects_inverted_window() {
        let content = "[detector]\nmin_valid_distance = 500.0\nmax_valid_distance = 400.0\n";
        assert!(Config::from_toml_str(content, "inline").is_err());
    }

    #[test]
    fn test_rejects_threshold_outside_window() {
        // Nothing above max_valid_distance is an echo, so the beam could never clear
        let err = Config::from_toml_str("[detector]\nthreshold_distance = 450.0\n", "inline")
            .unwrap_err();
        assert!(format!("{err:#}").contains("max_valid_distance"));
        assert!(Config::from_toml_str("[detector]\nthreshold_distance = 400.0\n", "inline").is_err());
        assert!(Config::default().with_detector_overrides(Some(500.0), None).is_err());
    }

    #[test]
    fn test_alert_url_alone_enables_webhook() {
        let config = Config::from_toml_str(
            "[webhook]\nenabled = true\nalert_url = \"http://hooks.local/alert\"\n",
            "inline",
        )
        .unwrap();
        assert_eq!(config.webhook_alert_url(), "http://hooks.local/alert");
        assert_eq!(config.webhook_occupied_url(), "");
    }

    #[test]
    fn test_rejects_webhook_without_urls() {
        assert!(Config::from_toml_str("[webhook]\nenabled = true\n", "inline").is_err());
    }

    #[test]
    fn test_unknown_no_echo_policy_rejected() {
        assert!(Config::from_toml_str("[detector]\nno_echo = \"maybe\"\n", "inline").is_err());
    }

    #[test]
    fn test_detector_overrides() {
        let config = Config::default().with_detector_overrides(Some(60.0), Some(1500)).unwrap();
        assert_eq!(config.threshold_distance(), 60.0);
        assert_eq!(config.sequence_timeout_ms(), 1500);
        assert!(Config::default().with_detector_overrides(Some(-1.0), None).is_err());
    }
}
