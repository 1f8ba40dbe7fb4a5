// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! InfluxDB sink with two write modes.
//!
//! Synchronous mode performs one HTTP write per message — simple and
//! deterministic, appropriate for readings that arrive seconds apart.
//! Batched mode hands points to a background writer task over a bounded
//! channel; the writer flushes on batch size or interval and retries
//! transient failures with bounded exponential backoff. Buffered-but-
//! unflushed points are at risk on crash; `close` drains the buffer.

use crate::config::InfluxConfig;
use crate::errors::{ConfigError, SinkError};
use crate::influx::{point_line, InfluxApi, RetryPolicy};
use crate::reading::MetricReading;
use crate::sink::Sink;
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

const COMMAND_QUEUE_CAPACITY: usize = 1024;
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// How points reach the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// One write per message, errors surface at the dispatch boundary.
    Synchronous,
    /// Buffered writes through a background task.
    Batched {
        batch_size: usize,
        flush_interval_ms: u64,
    },
}

impl WriteMode {
    pub fn from_config(config: &InfluxConfig) -> Self {
        if config.batch_size > 1 {
            WriteMode::Batched {
                batch_size: config.batch_size,
                flush_interval_ms: config.flush_interval_ms,
            }
        } else {
            WriteMode::Synchronous
        }
    }
}

#[derive(Debug)]
enum WriterCommand {
    Write(String),
    Flush(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

/// Cheap-to-clone handle to the background writer task.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<WriterCommand>,
}

impl WriterHandle {
    fn write(&self, line: String) -> Result<(), SinkError> {
        self.tx
            .try_send(WriterCommand::Write(line))
            .map_err(|e| SinkError::WriterUnavailable(e.to_string()))
    }

    /// Force a flush of the current buffer and wait for it to complete.
    pub async fn flush(&self) -> Result<(), SinkError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(WriterCommand::Flush(ack_tx))
            .await
            .map_err(|e| SinkError::WriterUnavailable(e.to_string()))?;
        ack_rx
            .await
            .map_err(|e| SinkError::WriterUnavailable(e.to_string()))
    }

    async fn shutdown(&self) -> Result<(), SinkError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(WriterCommand::Shutdown(ack_tx))
            .await
            .map_err(|e| SinkError::WriterUnavailable(e.to_string()))?;
        tokio::time::timeout(SHUTDOWN_TIMEOUT, ack_rx)
            .await
            .map_err(|_| SinkError::WriterUnavailable("shutdown timed out".to_string()))?
            .map_err(|e| SinkError::WriterUnavailable(e.to_string()))
    }
}

/// Background writer: buffers lines, flushes on size or interval, drains
/// on shutdown. A batch that still fails after the retry bound is dropped
/// with a diagnostic; the stream itself is never stopped.
struct WriterService {
    api: InfluxApi,
    rx: mpsc::Receiver<WriterCommand>,
    batch: Vec<String>,
    batch_size: usize,
    flush_interval: Duration,
}

impl WriterService {
    fn new(api: InfluxApi, batch_size: usize, flush_interval: Duration) -> (Self, WriterHandle) {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
        let service = Self {
            api,
            rx,
            batch: Vec::with_capacity(batch_size),
            batch_size,
            flush_interval,
        };
        (service, WriterHandle { tx })
    }

    async fn run(mut self) {
        debug!("influx writer started");
        let mut ticker = tokio::time::interval(self.flush_interval);

        loop {
            tokio::select! {
                command = self.rx.recv() => match command {
                    Some(WriterCommand::Write(line)) => {
                        self.batch.push(line);
                        if self.batch.len() >= self.batch_size {
                            self.flush_batch().await;
                        }
                    }
                    Some(WriterCommand::Flush(ack)) => {
                        self.flush_batch().await;
                        let _ = ack.send(());
                    }
                    Some(WriterCommand::Shutdown(ack)) => {
                        self.flush_batch().await;
                        let _ = ack.send(());
                        break;
                    }
                    None => {
                        // All handles dropped: drain and stop.
                        self.flush_batch().await;
                        break;
                    }
                },
                _ = ticker.tick() => {
                    if !self.batch.is_empty() {
                        self.flush_batch().await;
                    }
                }
            }
        }

        debug!("influx writer stopped");
    }

    async fn flush_batch(&mut self) {
        if self.batch.is_empty() {
            return;
        }
        let lines = std::mem::take(&mut self.batch);
        if let Err(e) = self.api.write_lines(&lines).await {
            error!("influx batch write failed, dropping {} point(s): {e}", lines.len());
        }
    }
}

/// Writes each normalized record as one timestamped point, tagged by node.
pub struct InfluxSink {
    api: InfluxApi,
    measurement: String,
    max_channels: usize,
    writer: Option<WriterHandle>,
}

impl InfluxSink {
    /// Build the sink. Requires a non-empty token (fatal otherwise) and, in
    /// batched mode, spawns the background writer task.
    pub fn new(config: &InfluxConfig, max_channels: usize) -> Result<Self, ConfigError> {
        let mode = WriteMode::from_config(config);

        let (api, writer) = match mode {
            WriteMode::Synchronous => (InfluxApi::new(config, RetryPolicy::none())?, None),
            WriteMode::Batched {
                batch_size,
                flush_interval_ms,
            } => {
                let api = InfluxApi::new(config, RetryPolicy::bounded_backoff())?;
                let (service, handle) = WriterService::new(
                    api.clone(),
                    batch_size,
                    Duration::from_millis(flush_interval_ms.max(1)),
                );
                tokio::spawn(service.run());
                (api, Some(handle))
            }
        };

        Ok(Self {
            api,
            measurement: config.measurement.clone(),
            max_channels,
            writer,
        })
    }

    #[cfg(test)]
    fn writer(&self) -> Option<&WriterHandle> {
        self.writer.as_ref()
    }
}

#[async_trait]
impl Sink for InfluxSink {
    async fn handle(&mut self, topic: &str, payload: &Value) -> Result<(), SinkError> {
        let reading = MetricReading::normalize(topic, payload, self.max_channels);

        let Some(line) = point_line(&self.measurement, &reading) else {
            // A point needs at least one field; nothing numeric arrived.
            debug!("no numeric fields on {topic}, skipping point");
            return Ok(());
        };

        match &self.writer {
            Some(writer) => writer.write(line),
            None => self.api.write_lines(&[line]).await,
        }
    }

    async fn close(&mut self) {
        if let Some(writer) = self.writer.take() {
            if let Err(e) = writer.shutdown().await {
                warn!("influx writer shutdown failed: {e}");
            }
        }
    }
}
