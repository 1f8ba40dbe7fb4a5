// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! InfluxDB 2.x line-protocol encoding and the HTTP write API.
//!
//! Line protocol:
//! ```text
//! measurement,tag1=val1 field1=val1,field2=val2 timestamp
//! ```
//! Timestamps are written in milliseconds (`precision=ms`), matching the
//! millisecond precision of the receipt-time record field.

use crate::config::InfluxConfig;
use crate::errors::{ConfigError, SinkError};
use crate::reading::{DeviceCounter, MetricReading};
use reqwest::StatusCode;
use std::time::Duration;
use tracing::{debug, warn};

const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// A numeric value in an InfluxDB field. Integers carry the `i` suffix so
/// integer-typed device counters stay integer-typed in the store.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldValue {
    Float(f64),
    Integer(i64),
}

impl FieldValue {
    pub fn to_line_protocol(&self) -> String {
        match self {
            FieldValue::Float(v) => format!("{v}"),
            FieldValue::Integer(v) => format!("{v}i"),
        }
    }
}

/// Every non-absent numeric field of a record, in a stable order.
pub fn field_set(reading: &MetricReading) -> Vec<(String, FieldValue)> {
    let mut fields = Vec::new();

    if let Some(counter) = reading.device_epoch {
        fields.push(("epoch".to_string(), counter_value(counter)));
    }
    if let Some(counter) = reading.device_t_ms {
        fields.push(("t_ms".to_string(), counter_value(counter)));
    }
    for (idx, channel) in reading.channels.iter().enumerate() {
        let i = idx + 1;
        if let Some(v) = channel.irms {
            fields.push((format!("ct{i}_irms"), FieldValue::Float(v)));
        }
        if let Some(v) = channel.apparent_power {
            fields.push((format!("ct{i}_apparpower"), FieldValue::Float(v)));
        }
        if let Some(v) = channel.real_power {
            fields.push((format!("ct{i}_power"), FieldValue::Float(v)));
        }
    }
    if let Some(v) = reading.vrms {
        fields.push(("vrms".to_string(), FieldValue::Float(v)));
    }

    fields
}

fn counter_value(counter: DeviceCounter) -> FieldValue {
    match counter {
        DeviceCounter::Int(v) => FieldValue::Integer(v),
        DeviceCounter::Float(v) => FieldValue::Float(v),
    }
}

/// Encode one record as a line-protocol point: measurement, `node` tag,
/// all non-absent numeric fields, receipt timestamp in milliseconds.
///
/// Returns `None` when every numeric field is absent — InfluxDB requires
/// at least one field per point, so there is nothing to write.
pub fn point_line(measurement: &str, reading: &MetricReading) -> Option<String> {
    let fields = field_set(reading);
    if fields.is_empty() {
        return None;
    }

    let mut line = escape_measurement(measurement);
    line.push(',');
    line.push_str("node=");
    line.push_str(&escape_key(&reading.node));
    line.push(' ');
    for (i, (key, value)) in fields.iter().enumerate() {
        if i > 0 {
            line.push(',');
        }
        line.push_str(&escape_key(key));
        line.push('=');
        line.push_str(&value.to_line_protocol());
    }
    line.push(' ');
    line.push_str(&reading.received_at.timestamp_millis().to_string());

    Some(line)
}

/// Escape tag keys/values and field keys: commas, equals signs and spaces
/// carry a backslash.
fn escape_key(s: &str) -> String {
    s.replace(',', "\\,")
        .replace('=', "\\=")
        .replace(' ', "\\ ")
}

/// Escape a measurement name. Measurements only escape commas and spaces;
/// an equals sign is a literal character there.
fn escape_measurement(s: &str) -> String {
    s.replace(',', "\\,").replace(' ', "\\ ")
}

/// How transient write failures are retried.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// No retries: the first failure surfaces immediately. Used by the
    /// synchronous write mode, where errors belong at the dispatch boundary.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Bounded exponential backoff for the batched write mode.
    pub fn bounded_backoff() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(30),
        }
    }

    fn delay(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let delay = self.base_delay.saturating_mul(1u32 << shift);
        delay.min(self.max_delay)
    }
}

/// Thin client for the InfluxDB 2.x write endpoint.
#[derive(Debug, Clone)]
pub struct InfluxApi {
    client: reqwest::Client,
    write_url: String,
    org: String,
    bucket: String,
    token: String,
    retry: RetryPolicy,
}

impl InfluxApi {
    /// Build the client. An empty token is a fatal configuration error,
    /// raised here — before any connection attempt — not per message.
    pub fn new(config: &InfluxConfig, retry: RetryPolicy) -> Result<Self, ConfigError> {
        if config.token.is_empty() {
            return Err(ConfigError::MissingSecret("INFLUX_TOKEN"));
        }

        let client = reqwest::Client::builder()
            .timeout(WRITE_TIMEOUT)
            .build()
            .map_err(|e| ConfigError::Invalid(format!("failed to build http client: {e}")))?;

        Ok(Self {
            client,
            write_url: format!("{}/api/v2/write", config.url.trim_end_matches('/')),
            org: config.org.clone(),
            bucket: config.bucket.clone(),
            token: config.token.clone(),
            retry,
        })
    }

    /// Write a batch of line-protocol lines.
    ///
    /// 2xx is success; 4xx is permanent (the batch is malformed or
    /// unauthorized, retrying cannot help); 5xx and transport errors are
    /// transient and retried up to the policy bound with exponential
    /// backoff.
    pub async fn write_lines(&self, lines: &[String]) -> Result<(), SinkError> {
        if lines.is_empty() {
            return Ok(());
        }
        let body = lines.join("\n");

        let mut attempt: u32 = 0;
        loop {
            let result = self
                .client
                .post(&self.write_url)
                .query(&[
                    ("org", self.org.as_str()),
                    ("bucket", self.bucket.as_str()),
                    ("precision", "ms"),
                ])
                .header("Authorization", format!("Token {}", self.token))
                .header("Content-Type", "text/plain; charset=utf-8")
                .body(body.clone())
                .send()
                .await;

            match result {
                Ok(resp) if resp.status().is_success() => {
                    debug!("wrote {} point(s)", lines.len());
                    return Ok(());
                }
                Ok(resp) => {
                    let status = resp.status();
                    let body = resp.text().await.unwrap_or_default();
                    if is_permanent(status) || attempt >= self.retry.max_retries {
                        return Err(SinkError::Rejected { status, body });
                    }
                    warn!("influx write failed ({status}), retrying: {body}");
                }
                Err(e) => {
                    if attempt >= self.retry.max_retries {
                        return Err(SinkError::Http(e));
                    }
                    warn!("influx write failed, retrying: {e}");
                }
            }

            attempt += 1;
            tokio::time::sleep(self.retry.delay(attempt)).await;
        }
    }
}

fn is_permanent(status: StatusCode) -> bool {
    status.is_client_error()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reading::MetricReading;
    use serde_json::json;

    fn test_config(url: &str) -> InfluxConfig {
        InfluxConfig {
            url: url.to_string(),
            token: "secret".to_string(),
            org: "home".to_string(),
            bucket: "load_meter".to_string(),
            measurement: "load_meter".to_string(),
            batch_size: 1,
            flush_interval_ms: 1000,
        }
    }

    #[test]
    fn test_field_value_rendering() {
        assert_eq!(FieldValue::Float(12.345).to_line_protocol(), "12.345");
        assert_eq!(FieldValue::Integer(1700000000).to_line_protocol(), "1700000000i");
    }

    #[test]
    fn test_point_line_shape() {
        let payload = json!({"epoch": 1700000000, "ct1_irms": 1.23, "vrms": "bad"});
        let reading = MetricReading::normalize("home/load_meter/esp32a/metrics", &payload, 2);
        let line = point_line("load_meter", &reading).unwrap();

        let expected_fields = "epoch=1700000000i,ct1_irms=1.23";
        assert!(line.starts_with("load_meter,node=esp32a "));
        assert!(line.contains(expected_fields), "line: {line}");
        // Absent fields never appear, not even as zero.
        assert!(!line.contains("ct2_irms"));
        assert!(!line.contains("vrms"));
        // Millisecond timestamp at the end.
        let ts: i64 = line.rsplit(' ').next().unwrap().parse().unwrap();
        assert_eq!(ts, reading.received_at.timestamp_millis());
    }

    #[test]
    fn test_point_line_none_when_no_fields() {
        let reading = MetricReading::normalize("a/b/metrics", &json!({}), 2);
        assert!(point_line("load_meter", &reading).is_none());
    }

    #[test]
    fn test_escape_key() {
        assert_eq!(escape_key("my key"), "my\\ key");
        assert_eq!(escape_key("a,b=c"), "a\\,b\\=c");
    }

    #[test]
    fn test_escape_measurement_keeps_equals_literal() {
        assert_eq!(escape_measurement("load meter"), "load\\ meter");
        assert_eq!(escape_measurement("a,b"), "a\\,b");
        assert_eq!(escape_measurement("load=meter"), "load=meter");
    }

    #[test]
    fn test_point_line_measurement_with_equals() {
        let payload = json!({"ct1_irms": 1.0});
        let reading = MetricReading::normalize("a/b/metrics", &payload, 1);
        let line = point_line("load=meter", &reading).unwrap();
        assert!(line.starts_with("load=meter,node=b "), "line: {line}");
    }

    #[test]
    fn test_retry_delay_is_bounded() {
        let policy = RetryPolicy {
            max_retries: 10,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(30),
        };
        assert_eq!(policy.delay(1), Duration::from_secs(5));
        assert_eq!(policy.delay(2), Duration::from_secs(10));
        assert_eq!(policy.delay(3), Duration::from_secs(20));
        assert_eq!(policy.delay(4), Duration::from_secs(30));
        assert_eq!(policy.delay(12), Duration::from_secs(30));
    }

    #[test]
    fn test_empty_token_is_fatal() {
        let mut config = test_config("http://127.0.0.1:8086");
        config.token = String::new();
        let result = InfluxApi::new(&config, RetryPolicy::none());
        assert!(matches!(result, Err(ConfigError::MissingSecret(_))));
    }

    #[tokio::test]
    async fn test_write_lines_success() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/v2/write")
            .match_query(mockito::Matcher::AllOf(vec![
                mockito::Matcher::UrlEncoded("org".into(), "home".into()),
                mockito::Matcher::UrlEncoded("bucket".into(), "load_meter".into()),
                mockito::Matcher::UrlEncoded("precision".into(), "ms".into()),
            ]))
            .match_header("Authorization", "Token secret")
            .with_status(204)
            .create_async()
            .await;

        let api = InfluxApi::new(&test_config(&server.url()), RetryPolicy::none()).unwrap();
        api.write_lines(&["m,node=a f=1 1".to_string()])
            .await
            .unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_write_lines_client_error_is_permanent() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/v2/write")
            .match_query(mockito::Matcher::Any)
            .with_status(400)
            .with_body("bad line")
            .expect(1)
            .create_async()
            .await;

        let policy = RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        };
        let api = InfluxApi::new(&test_config(&server.url()), policy).unwrap();
        let result = api.write_lines(&["junk".to_string()]).await;

        // 4xx is never retried.
        mock.assert_async().await;
        assert!(matches!(result, Err(SinkError::Rejected { status, .. })
            if status == StatusCode::BAD_REQUEST));
    }

    #[tokio::test]
    async fn test_write_lines_server_error_retries_until_bound() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/v2/write")
            .match_query(mockito::Matcher::Any)
            .with_status(503)
            .expect(3)
            .create_async()
            .await;

        let policy = RetryPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        };
        let api = InfluxApi::new(&test_config(&server.url()), policy).unwrap();
        let result = api.write_lines(&["m,node=a f=1 1".to_string()]).await;

        mock.assert_async().await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_write_lines_empty_batch_is_noop() {
        let config = test_config("http://127.0.0.1:9"); // nothing listens here
        let api = InfluxApi::new(&config, RetryPolicy::none()).unwrap();
        assert!(api.write_lines(&[]).await.is_ok());
    }
}
