// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Append-only CSV sink.
//!
//! Columns are stable for the lifetime of the process: receipt timestamps,
//! topic, node, device counters, then the channel fields grouped by metric
//! type, then vrms. The header is written at most once; rows always append.
//!
//! A pre-existing file whose header was written with a different channel
//! count is an unsupported configuration change: rows follow the configured
//! width and the old header is not reconciled.

use crate::errors::SinkError;
use crate::reading::{DeviceCounter, MetricReading};
use crate::sink::Sink;
use async_trait::async_trait;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::debug;

pub struct CsvSink {
    path: PathBuf,
    max_channels: usize,
}

impl CsvSink {
    /// Create the sink, writing the header row if the target file does not
    /// exist or is empty. Safe to call repeatedly across process restarts.
    pub fn new(path: impl Into<PathBuf>, max_channels: usize) -> Result<Self, SinkError> {
        let sink = Self {
            path: path.into(),
            max_channels,
        };
        sink.ensure_header()?;
        Ok(sink)
    }

    /// Column names, in row order, for a given channel count.
    pub fn column_names(max_channels: usize) -> Vec<String> {
        let mut columns: Vec<String> = ["recv_ts_iso", "recv_ts_epoch", "topic", "node", "epoch", "t_ms"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        columns.extend((1..=max_channels).map(|i| format!("ct{i}_irms")));
        columns.extend((1..=max_channels).map(|i| format!("ct{i}_apparpower")));
        columns.extend((1..=max_channels).map(|i| format!("ct{i}_power")));
        columns.push("vrms".to_string());
        columns
    }

    fn ensure_header(&self) -> Result<(), SinkError> {
        let needs_header = match std::fs::metadata(&self.path) {
            Ok(meta) => meta.len() == 0,
            Err(_) => true,
        };
        if needs_header {
            let header = encode_row(&Self::column_names(self.max_channels));
            std::fs::write(&self.path, header)?;
            debug!("wrote csv header: {}", self.path.display());
        }
        Ok(())
    }

    /// Cells for one record, matching [`CsvSink::column_names`] order.
    /// Absent fields render as empty cells.
    fn row_cells(&self, reading: &MetricReading) -> Vec<String> {
        let mut cells = vec![
            reading.recv_ts_iso(),
            reading.recv_ts_epoch(),
            reading.topic.clone(),
            reading.node.clone(),
            counter_cell(reading.device_epoch),
            counter_cell(reading.device_t_ms),
        ];
        cells.extend(reading.channels.iter().map(|c| float_cell(c.irms)));
        cells.extend(reading.channels.iter().map(|c| float_cell(c.apparent_power)));
        cells.extend(reading.channels.iter().map(|c| float_cell(c.real_power)));
        cells.push(float_cell(reading.vrms));
        cells
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Sink for CsvSink {
    async fn handle(&mut self, topic: &str, payload: &Value) -> Result<(), SinkError> {
        let reading = MetricReading::normalize(topic, payload, self.max_channels);
        let row = encode_row(&self.row_cells(&reading));

        // One open-append-close per message. No batching: durability over
        // throughput, appropriate for seconds between readings.
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(row.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

fn counter_cell(counter: Option<DeviceCounter>) -> String {
    match counter {
        Some(DeviceCounter::Int(v)) => v.to_string(),
        Some(DeviceCounter::Float(v)) => v.to_string(),
        None => String::new(),
    }
}

fn float_cell(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

/// Encode one row, newline-terminated. Cells are quoted only when they
/// contain the delimiter, a quote, or a line break (RFC 4180).
fn encode_row(cells: &[String]) -> String {
    let mut row = cells
        .iter()
        .map(|c| escape_cell(c))
        .collect::<Vec<_>>()
        .join(",");
    row.push('\n');
    row
}

fn escape_cell(cell: &str) -> String {
    if cell.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", cell.replace('"', "\"\""))
    } else {
        cell.to_string()
    }
}
