//! Watchdog configuration: defaults, `VC_WATCHDOG_*` env overrides, and
//! range validation. File layer (JSON/TOML) is left to the binary crate;
//! this module only defines the shape and the env-var merge.

use std::time::Duration;
use thiserror::Error;

use crate::anomaly::AnomalySeverity;

#[derive(Debug, Error)]
#[error("{message} (hint: {hint})")]
pub struct ConfigError {
    pub message: String,
    pub hint: String,
}

impl ConfigError {
    fn new(message: impl Into<String>, hint: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            hint: hint.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AiConfig {
    pub min_confidence_threshold: f64,
    pub min_severity_level: AnomalySeverity,
    pub enable_anomaly_logging: bool,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            min_confidence_threshold: 0.75,
            min_severity_level: AnomalySeverity::High,
            enable_anomaly_logging: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InterventionConfig {
    pub auto_kill_enabled: bool,
    pub max_retries: u32,
    pub escalate_on_critical: bool,
}

impl Default for InterventionConfig {
    fn default() -> Self {
        Self {
            auto_kill_enabled: true,
            max_retries: 3,
            escalate_on_critical: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    pub enabled: bool,
    pub base_interval: Duration,
    pub max_interval: Duration,
    pub backoff_multiplier: f64,
    pub trigger_threshold: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_interval: Duration::from_secs(30),
            max_interval: Duration::from_secs(300),
            backoff_multiplier: 2.0,
            trigger_threshold: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WatchdogConfig {
    pub enabled: bool,
    pub check_interval: Duration,
    pub telemetry_window_size: usize,
    pub max_history_size: usize,
    pub ai: AiConfig,
    pub intervention: InterventionConfig,
    pub backoff: BackoffConfig,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval: Duration::from_secs(30),
            telemetry_window_size: 100,
            max_history_size: 200,
            ai: AiConfig::default(),
            intervention: InterventionConfig::default(),
            backoff: BackoffConfig::default(),
        }
    }
}

/// Parse a strict subset of Go-duration syntax: one integer followed by a
/// unit in `{ns, us, ms, s, m, h}`, e.g. `"30s"`, `"2m"`, `"500ms"`.
pub fn parse_duration(raw: &str) -> Result<Duration, ConfigError> {
    let raw = raw.trim();
    let split_at = raw
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| ConfigError::new(format!("invalid duration `{raw}`"), "use e.g. `30s`, `2m`, `500ms`"))?;
    let (digits, unit) = raw.split_at(split_at);
    let value: u64 = digits
        .parse()
        .map_err(|_| ConfigError::new(format!("invalid duration `{raw}`"), "use e.g. `30s`, `2m`, `500ms`"))?;
    let duration = match unit {
        "ns" => Duration::from_nanos(value),
        "us" => Duration::from_micros(value),
        "ms" => Duration::from_millis(value),
        "s" => Duration::from_secs(value),
        "m" => Duration::from_secs(value * 60),
        "h" => Duration::from_secs(value * 3600),
        other => {
            return Err(ConfigError::new(
                format!("unknown duration unit `{other}` in `{raw}`"),
                "supported units are ns, us, ms, s, m, h",
            ))
        }
    };
    Ok(duration)
}

fn parse_bool(raw: &str) -> Option<bool> {
    let lowered = raw.trim().to_ascii_lowercase();
    match lowered.as_str() {
        "" => Some(true),
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_severity(raw: &str) -> Option<AnomalySeverity> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "low" => Some(AnomalySeverity::Low),
        "medium" => Some(AnomalySeverity::Medium),
        "high" => Some(AnomalySeverity::High),
        "critical" => Some(AnomalySeverity::Critical),
        _ => None,
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

impl WatchdogConfig {
    /// Apply `VC_WATCHDOG_*` env overrides on top of `self`, in place.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(v) = env_var("VC_WATCHDOG_ENABLED") {
            self.enabled = parse_bool(&v)
                .ok_or_else(|| ConfigError::new("invalid VC_WATCHDOG_ENABLED", "use true/false/1/0/yes/no/on/off"))?;
        }
        if let Some(v) = env_var("VC_WATCHDOG_CHECK_INTERVAL") {
            self.check_interval = parse_duration(&v)?;
        }
        if let Some(v) = env_var("VC_WATCHDOG_TELEMETRY_WINDOW_SIZE") {
            self.telemetry_window_size = v
                .parse()
                .map_err(|_| ConfigError::new("invalid VC_WATCHDOG_TELEMETRY_WINDOW_SIZE", "use an integer 1-10000"))?;
        }
        if let Some(v) = env_var("VC_WATCHDOG_MAX_HISTORY_SIZE") {
            self.max_history_size = v
                .parse()
                .map_err(|_| ConfigError::new("invalid VC_WATCHDOG_MAX_HISTORY_SIZE", "use an integer 1-10000"))?;
        }
        if let Some(v) = env_var("VC_WATCHDOG_MIN_CONFIDENCE") {
            self.ai.min_confidence_threshold = v
                .parse()
                .map_err(|_| ConfigError::new("invalid VC_WATCHDOG_MIN_CONFIDENCE", "use a float in [0,1]"))?;
        }
        if let Some(v) = env_var("VC_WATCHDOG_MIN_SEVERITY") {
            self.ai.min_severity_level = parse_severity(&v)
                .ok_or_else(|| ConfigError::new("invalid VC_WATCHDOG_MIN_SEVERITY", "use low/medium/high/critical"))?;
        }
        if let Some(v) = env_var("VC_WATCHDOG_ENABLE_ANOMALY_LOGGING") {
            self.ai.enable_anomaly_logging = parse_bool(&v)
                .ok_or_else(|| ConfigError::new("invalid VC_WATCHDOG_ENABLE_ANOMALY_LOGGING", "use true/false"))?;
        }
        if let Some(v) = env_var("VC_WATCHDOG_AUTO_KILL_ENABLED") {
            self.intervention.auto_kill_enabled = parse_bool(&v)
                .ok_or_else(|| ConfigError::new("invalid VC_WATCHDOG_AUTO_KILL_ENABLED", "use true/false"))?;
        }
        if let Some(v) = env_var("VC_WATCHDOG_MAX_RETRIES") {
            self.intervention.max_retries = v
                .parse()
                .map_err(|_| ConfigError::new("invalid VC_WATCHDOG_MAX_RETRIES", "use an integer 0-100"))?;
        }
        if let Some(v) = env_var("VC_WATCHDOG_ESCALATE_ON_CRITICAL") {
            self.intervention.escalate_on_critical = parse_bool(&v)
                .ok_or_else(|| ConfigError::new("invalid VC_WATCHDOG_ESCALATE_ON_CRITICAL", "use true/false"))?;
        }
        if let Some(v) = env_var("VC_WATCHDOG_BACKOFF_ENABLED") {
            self.backoff.enabled = parse_bool(&v)
                .ok_or_else(|| ConfigError::new("invalid VC_WATCHDOG_BACKOFF_ENABLED", "use true/false"))?;
        }
        if let Some(v) = env_var("VC_WATCHDOG_BACKOFF_BASE_INTERVAL") {
            self.backoff.base_interval = parse_duration(&v)?;
        }
        if let Some(v) = env_var("VC_WATCHDOG_BACKOFF_MAX_INTERVAL") {
            self.backoff.max_interval = parse_duration(&v)?;
        }
        if let Some(v) = env_var("VC_WATCHDOG_BACKOFF_MULTIPLIER") {
            self.backoff.backoff_multiplier = v
                .parse()
                .map_err(|_| ConfigError::new("invalid VC_WATCHDOG_BACKOFF_MULTIPLIER", "use a float >= 1"))?;
        }
        if let Some(v) = env_var("VC_WATCHDOG_BACKOFF_TRIGGER_THRESHOLD") {
            self.backoff.trigger_threshold = v.parse().map_err(|_| {
                ConfigError::new("invalid VC_WATCHDOG_BACKOFF_TRIGGER_THRESHOLD", "use an integer > 0")
            })?;
        }
        Ok(())
    }

    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let five_sec = Duration::from_secs(5);
        let five_min = Duration::from_secs(300);
        if self.check_interval < five_sec || self.check_interval > five_min {
            return Err(ConfigError::new(
                "check_interval out of range",
                "must be between 5s and 5m",
            ));
        }
        if !(1..=10_000).contains(&self.telemetry_window_size) {
            return Err(ConfigError::new(
                "telemetry_window_size out of range",
                "must be between 1 and 10000",
            ));
        }
        if !(1..=10_000).contains(&self.max_history_size) {
            return Err(ConfigError::new(
                "max_history_size out of range",
                "must be between 1 and 10000",
            ));
        }
        if !(0.0..=1.0).contains(&self.ai.min_confidence_threshold) {
            return Err(ConfigError::new(
                "ai.min_confidence_threshold out of range",
                "must be within [0,1]",
            ));
        }
        if self.intervention.max_retries > 100 {
            return Err(ConfigError::new(
                "intervention.max_retries out of range",
                "must be between 0 and 100",
            ));
        }
        if self.backoff.base_interval > self.backoff.max_interval {
            return Err(ConfigError::new(
                "backoff.base_interval exceeds backoff.max_interval",
                "base_interval must be <= max_interval",
            ));
        }
        if self.backoff.backoff_multiplier < 1.0 {
            return Err(ConfigError::new(
                "backoff.backoff_multiplier out of range",
                "must be >= 1",
            ));
        }
        if self.backoff.trigger_threshold == 0 {
            return Err(ConfigError::new(
                "backoff.trigger_threshold out of range",
                "must be > 0",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        WatchdogConfig::default().validate().unwrap();
    }

    #[test]
    fn parses_duration_units() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
    }

    #[test]
    fn rejects_unknown_unit() {
        assert!(parse_duration("30x").is_err());
    }

    #[test]
    fn rejects_out_of_range_check_interval() {
        let mut config = WatchdogConfig::default();
        config.check_interval = Duration::from_secs(1);
        assert!(config.validate().is_err());
    }

    #[test]
    fn blank_bool_env_defaults_to_true() {
        assert_eq!(parse_bool(""), Some(true));
        assert_eq!(parse_bool("off"), Some(false));
        assert_eq!(parse_bool("yes"), Some(true));
        assert_eq!(parse_bool("nonsense"), None);
    }
}
