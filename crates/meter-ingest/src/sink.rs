// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The pluggable persistence endpoint for accepted messages.

use crate::errors::SinkError;
use async_trait::async_trait;
use serde_json::Value;

/// A persistence/presentation endpoint for inbound messages.
///
/// `handle` receives the exact topic and the parsed JSON payload of one
/// accepted message; errors it returns are caught at the dispatch boundary
/// and never stop ingestion. `close` is best-effort cleanup — it runs once
/// at shutdown and must not fail or hang.
#[async_trait]
pub trait Sink: Send {
    async fn handle(&mut self, topic: &str, payload: &Value) -> Result<(), SinkError>;

    async fn close(&mut self) {}
}

/// Debug sink: prints every accepted message unmodified, no normalization,
/// no persisted side effect.
pub struct ConsoleSink;

#[async_trait]
impl Sink for ConsoleSink {
    async fn handle(&mut self, topic: &str, payload: &Value) -> Result<(), SinkError> {
        println!("[MSG] {topic} {payload}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_console_sink_never_fails() {
        let mut sink = ConsoleSink;
        let payload = json!({"vrms": "not even numeric"});
        assert!(sink.handle("a/b/metrics", &payload).await.is_ok());
        sink.close().await;
    }
}
