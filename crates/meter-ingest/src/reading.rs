// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The canonical record extracted from a loosely-typed sensor payload.
//!
//! Normalization is total: no payload shape causes an error, the worst case
//! is a record where every optional field is absent. A value that cannot be
//! coerced to its target numeric type is omitted, never defaulted to zero —
//! downstream consumers must treat absence as "unknown".

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;

/// A device-reported counter that is kept integer-typed when possible and
/// falls back to float only when the payload carried a fractional value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DeviceCounter {
    Int(i64),
    Float(f64),
}

/// Readings for one current-transformer channel.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ChannelReading {
    pub irms: Option<f64>,
    pub apparent_power: Option<f64>,
    pub real_power: Option<f64>,
}

/// One normalized meter reading. Constructed once per accepted inbound
/// message and handed to exactly one sink call.
#[derive(Debug, Clone)]
pub struct MetricReading {
    /// Receipt time on the ingester (UTC), not device time.
    pub received_at: DateTime<Utc>,
    /// The exact broker topic the message arrived on.
    pub topic: String,
    /// Device identifier, from the payload or the topic path. Never empty.
    pub node: String,
    pub device_epoch: Option<DeviceCounter>,
    pub device_t_ms: Option<DeviceCounter>,
    /// One entry per configured channel, index 0 is `ct1`.
    pub channels: Vec<ChannelReading>,
    pub vrms: Option<f64>,
}

impl MetricReading {
    /// Normalize a raw `(topic, payload)` pair into the canonical record.
    ///
    /// Total over its input domain: any JSON value is accepted (non-object
    /// payloads simply yield a record with every optional field absent).
    pub fn normalize(topic: &str, payload: &Value, max_channels: usize) -> MetricReading {
        let channels = (1..=max_channels)
            .map(|i| ChannelReading {
                irms: try_float(payload.get(format!("ct{i}_irms"))),
                apparent_power: try_float(payload.get(format!("ct{i}_apparpower"))),
                real_power: try_float(payload.get(format!("ct{i}_power"))),
            })
            .collect();

        MetricReading {
            received_at: Utc::now(),
            topic: topic.to_string(),
            node: extract_node(topic, payload),
            device_epoch: try_int_preferred(payload.get("epoch")),
            device_t_ms: try_int_preferred(payload.get("t_ms")),
            channels,
            vrms: try_float(payload.get("vrms")),
        }
    }

    /// Receipt time as epoch seconds with millisecond precision.
    pub fn recv_ts_epoch(&self) -> String {
        format!("{:.3}", self.received_at.timestamp_millis() as f64 / 1000.0)
    }

    /// Receipt time as an RFC 3339 rendering with millisecond precision.
    pub fn recv_ts_iso(&self) -> String {
        self.received_at
            .to_rfc3339_opts(SecondsFormat::Millis, false)
    }
}

/// Extract the node identifier: prefer the payload `node` field, fall back
/// to the second-to-last topic segment, then to `"unknown"`.
fn extract_node(topic: &str, payload: &Value) -> String {
    match payload.get("node") {
        Some(Value::String(s)) if !s.is_empty() => return s.clone(),
        Some(Value::Number(n)) => return n.to_string(),
        _ => {}
    }

    // topic format: base/<node>/metrics
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() >= 2 && !parts[parts.len() - 2].is_empty() {
        parts[parts.len() - 2].to_string()
    } else {
        "unknown".to_string()
    }
}

/// Coerce a JSON value to a float. Numbers pass through, strings are
/// trimmed and parsed; anything else is absent. Non-finite values are
/// dropped because neither CSV consumers nor line protocol can carry them.
pub fn try_float(value: Option<&Value>) -> Option<f64> {
    let parsed = match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                None
            } else {
                trimmed.parse::<f64>().ok()
            }
        }
        _ => None,
    };
    parsed.filter(|f| f.is_finite())
}

/// Integer-preferred coercion for device counters: an integer parse is
/// attempted first, then a float parse, then the field is absent. This
/// keeps integer-typed counters out of float formatting when possible.
pub fn try_int_preferred(value: Option<&Value>) -> Option<DeviceCounter> {
    match value? {
        Value::Number(n) => n
            .as_i64()
            .map(DeviceCounter::Int)
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(DeviceCounter::Float)),
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return None;
            }
            trimmed
                .parse::<i64>()
                .ok()
                .map(DeviceCounter::Int)
                .or_else(|| {
                    trimmed
                        .parse::<f64>()
                        .ok()
                        .filter(|f| f.is_finite())
                        .map(DeviceCounter::Float)
                })
        }
        _ => None,
    }
}
