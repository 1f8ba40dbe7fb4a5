// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Runtime configuration, resolved once at startup from environment
//! variables. Every input has a default; an unset or empty variable means
//! "use the default", a malformed value is a startup-fatal error.

use crate::errors::ConfigError;
use std::env;
use std::str::FromStr;

/// MQTT broker connection settings.
#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub base_topic: String,
    pub keepalive_s: u64,
}

impl MqttConfig {
    /// Wildcard pattern covering every node publishing under the base topic.
    pub fn subscribe_topic(&self) -> String {
        format!("{}/+/metrics", self.base_topic)
    }
}

/// CSV sink settings.
#[derive(Debug, Clone)]
pub struct CsvConfig {
    pub path: String,
}

/// InfluxDB 2.x sink settings.
#[derive(Debug, Clone)]
pub struct InfluxConfig {
    pub url: String,
    pub token: String,
    pub org: String,
    pub bucket: String,
    pub measurement: String,
    /// A batch size above 1 enables the buffered write mode.
    pub batch_size: usize,
    pub flush_interval_ms: u64,
}

/// Top-level configuration for the ingestion daemon.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub mqtt: MqttConfig,
    pub csv: CsvConfig,
    pub influx: InfluxConfig,
    /// Number of current-transformer channels; fixes the record shape for
    /// the lifetime of the process.
    pub max_ct: usize,
    pub log_level: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            mqtt: MqttConfig {
                host: "127.0.0.1".to_string(),
                port: 1883,
                user: String::new(),
                password: String::new(),
                base_topic: "home/load_meter".to_string(),
                keepalive_s: 60,
            },
            csv: CsvConfig {
                path: "load_meter_log.csv".to_string(),
            },
            influx: InfluxConfig {
                url: "http://127.0.0.1:8086".to_string(),
                token: String::new(),
                org: "home".to_string(),
                bucket: "load_meter".to_string(),
                measurement: "load_meter".to_string(),
                batch_size: 1,
                flush_interval_ms: 1000,
            },
            max_ct: 2,
            log_level: "info".to_string(),
        }
    }
}

impl AppConfig {
    /// Create configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = AppConfig::default();

        let config = Self {
            mqtt: MqttConfig {
                host: env_or("MQTT_HOST", &defaults.mqtt.host),
                port: env_parse("MQTT_PORT", defaults.mqtt.port)?,
                user: env_or("MQTT_USER", ""),
                password: env_or("MQTT_PASS", ""),
                base_topic: env_or("MQTT_BASE_TOPIC", &defaults.mqtt.base_topic),
                keepalive_s: env_parse("MQTT_KEEPALIVE", defaults.mqtt.keepalive_s)?,
            },
            csv: CsvConfig {
                path: env_or("CSV_PATH", &defaults.csv.path),
            },
            influx: InfluxConfig {
                url: env_or("INFLUX_URL", &defaults.influx.url),
                token: env_or("INFLUX_TOKEN", ""),
                org: env_or("INFLUX_ORG", &defaults.influx.org),
                bucket: env_or("INFLUX_BUCKET", &defaults.influx.bucket),
                measurement: env_or("INFLUX_MEASUREMENT", &defaults.influx.measurement),
                batch_size: env_parse("INFLUX_BATCH_SIZE", defaults.influx.batch_size)?,
                flush_interval_ms: env_parse(
                    "INFLUX_FLUSH_INTERVAL_MS",
                    defaults.influx.flush_interval_ms,
                )?,
            },
            max_ct: env_parse("MAX_CT", defaults.max_ct)?,
            log_level: env::var("LOG_LEVEL")
                .map(|val| val.to_lowercase())
                .unwrap_or(defaults.log_level),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mqtt.port == 0 {
            return Err(ConfigError::Invalid(
                "MQTT_PORT must be greater than 0".to_string(),
            ));
        }

        if self.mqtt.keepalive_s == 0 {
            return Err(ConfigError::Invalid(
                "MQTT_KEEPALIVE must be greater than 0".to_string(),
            ));
        }

        if self.mqtt.base_topic.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "MQTT_BASE_TOPIC cannot be empty".to_string(),
            ));
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.log_level.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
                self.log_level
            )));
        }

        Ok(())
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key)
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_parse<T: FromStr + Copy>(key: &str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Err(_) => Ok(default),
        Ok(val) if val.is_empty() => Ok(default),
        Ok(val) => val
            .trim()
            .parse::<T>()
            .map_err(|_| ConfigError::Invalid(format!("{key} is not a valid number: '{val}'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_subscribe_topic_pattern() {
        let config = AppConfig::default();
        assert_eq!(config.mqtt.subscribe_topic(), "home/load_meter/+/metrics");
    }

    #[test]
    fn test_validate_zero_port() {
        let mut config = AppConfig::default();
        config.mqtt.port = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_empty_base_topic() {
        let mut config = AppConfig::default();
        config.mqtt.base_topic = "   ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_invalid_log_level() {
        let mut config = AppConfig::default();
        config.log_level = "verbose".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    #[serial]
    fn test_from_env_defaults() {
        for key in [
            "MQTT_HOST",
            "MQTT_PORT",
            "MAX_CT",
            "INFLUX_BATCH_SIZE",
            "LOG_LEVEL",
        ] {
            env::remove_var(key);
        }

        let config = AppConfig::from_env().unwrap();
        assert_eq!(config.mqtt.host, "127.0.0.1");
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.max_ct, 2);
        assert_eq!(config.influx.batch_size, 1);
    }

    #[test]
    #[serial]
    fn test_from_env_overrides() {
        env::set_var("MQTT_HOST", "broker.local");
        env::set_var("MQTT_PORT", "8883");
        env::set_var("MAX_CT", "4");

        let config = AppConfig::from_env().unwrap();
        assert_eq!(config.mqtt.host, "broker.local");
        assert_eq!(config.mqtt.port, 8883);
        assert_eq!(config.max_ct, 4);

        env::remove_var("MQTT_HOST");
        env::remove_var("MQTT_PORT");
        env::remove_var("MAX_CT");
    }

    #[test]
    #[serial]
    fn test_from_env_malformed_number_is_fatal() {
        env::set_var("MQTT_PORT", "not-a-port");
        let result = AppConfig::from_env();
        env::remove_var("MQTT_PORT");
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    #[serial]
    fn test_from_env_empty_value_uses_default() {
        env::set_var("MQTT_KEEPALIVE", "");
        let config = AppConfig::from_env().unwrap();
        env::remove_var("MQTT_KEEPALIVE");
        assert_eq!(config.mqtt.keepalive_s, 60);
    }
}
