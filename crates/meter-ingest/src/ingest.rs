// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The ingestion control loop: broker connection lifecycle, message
//! dispatch, and signal-driven shutdown.
//!
//! Messages are handled one-in-one-out: the loop decodes, parses, and
//! dispatches each publish synchronously, so no two sink calls ever run
//! concurrently and records are persisted in receipt order. Malformed
//! input and sink failures are logged and dropped; only cancellation
//! stops the loop.

use crate::config::MqttConfig;
use crate::sink::Sink;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use serde_json::Value;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const RECONNECT_MIN_DELAY: Duration = Duration::from_secs(1);
const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(30);
const EVENT_CHANNEL_CAPACITY: usize = 64;
const DISCONNECT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Why an inbound payload was dropped before reaching the sink.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("JSON is not an object")]
    NotAnObject,
}

/// Decode raw broker bytes into a JSON object: lossy UTF-8 (invalid
/// sequences replaced, never fatal), whitespace trimmed, top-level value
/// must be an object.
pub fn decode_payload(bytes: &[u8]) -> Result<Value, DecodeError> {
    let raw = String::from_utf8_lossy(bytes);
    let value: Value = serde_json::from_str(raw.trim())?;
    if value.is_object() {
        Ok(value)
    } else {
        Err(DecodeError::NotAnObject)
    }
}

/// Reconnection delay with bounded exponential growth: starts at the
/// floor, doubles per consecutive failure, never exceeds the ceiling.
/// Reset on every successful connection.
#[derive(Debug)]
struct ReconnectBackoff {
    current: Duration,
}

impl ReconnectBackoff {
    fn new() -> Self {
        Self {
            current: RECONNECT_MIN_DELAY,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(RECONNECT_MAX_DELAY);
        delay
    }

    fn reset(&mut self) {
        self.current = RECONNECT_MIN_DELAY;
    }
}

/// Owns the broker connection and drives messages into a sink until the
/// cancellation token fires.
pub struct IngestLoop {
    client: AsyncClient,
    eventloop: EventLoop,
    subscribe_topic: String,
    sink: Box<dyn Sink>,
    cancel: CancellationToken,
    backoff: ReconnectBackoff,
}

impl IngestLoop {
    /// Prepare the loop. No connection is attempted until [`run`] polls
    /// the event loop.
    ///
    /// [`run`]: IngestLoop::run
    pub fn new(config: &MqttConfig, sink: Box<dyn Sink>, cancel: CancellationToken) -> Self {
        let client_id = format!("meter-ingest-{}", std::process::id());
        let mut options = MqttOptions::new(client_id, config.host.as_str(), config.port);
        options.set_keep_alive(Duration::from_secs(config.keepalive_s));
        if !config.user.is_empty() && !config.password.is_empty() {
            options.set_credentials(config.user.as_str(), config.password.as_str());
        }

        let (client, eventloop) = AsyncClient::new(options, EVENT_CHANNEL_CAPACITY);

        Self {
            client,
            eventloop,
            subscribe_topic: config.subscribe_topic(),
            sink,
            cancel,
            backoff: ReconnectBackoff::new(),
        }
    }

    /// Run until cancelled: connect, subscribe on every (re)connection,
    /// dispatch each publish to the sink, retry connection failures
    /// forever with bounded backoff. On cancellation the broker is
    /// disconnected first, then the sink is closed; both steps are
    /// best-effort and the sequence runs exactly once even if the token
    /// is cancelled more than once.
    pub async fn run(mut self) {
        info!("ingesting from '{}'", self.subscribe_topic);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                event = self.eventloop.poll() => match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("connected to broker");
                        self.backoff.reset();
                        // Resubscribe on every ConnAck so reconnects are
                        // transparent to the sink.
                        match self
                            .client
                            .subscribe(self.subscribe_topic.as_str(), QoS::AtMostOnce)
                            .await
                        {
                            Ok(()) => info!("subscribed: {}", self.subscribe_topic),
                            Err(e) => error!("subscribe failed: {e}"),
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        self.dispatch(&publish.topic, &publish.payload).await;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        let delay = self.backoff.next_delay();
                        warn!("broker connection error: {e}; retrying in {delay:?}");
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = self.cancel.cancelled() => break,
                        }
                    }
                },
            }
        }

        debug!("disconnecting from broker");
        match self.client.disconnect().await {
            Ok(()) => self.drain_disconnect().await,
            Err(e) => debug!("disconnect failed: {e}"),
        }
        self.sink.close().await;
        info!("ingestion stopped");
    }

    /// `AsyncClient::disconnect` only queues the DISCONNECT request; the
    /// packet reaches the socket on a later event-loop poll. Keep polling
    /// until it goes out, the connection errors, or the drain window
    /// elapses — otherwise the broker sees a raw TCP drop.
    async fn drain_disconnect(&mut self) {
        let drained = tokio::time::timeout(DISCONNECT_DRAIN_TIMEOUT, async {
            loop {
                match self.eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        debug!("event loop closed before disconnect: {e}");
                        break;
                    }
                }
            }
        })
        .await;
        if drained.is_err() {
            debug!("broker never acknowledged the disconnect");
        }
    }

    /// Decode and hand one message to the sink. Malformed input and sink
    /// failures are logged and dropped — one bad record never takes down
    /// the stream.
    async fn dispatch(&mut self, topic: &str, payload: &[u8]) {
        let value = match decode_payload(payload) {
            Ok(value) => value,
            Err(e) => {
                let raw: String = String::from_utf8_lossy(payload).chars().take(200).collect();
                warn!("bad JSON on {topic}: {e} | {raw}");
                return;
            }
        };

        if let Err(e) = self.sink.handle(topic, &value).await {
            error!("sink error on {topic}: {e}");
        }
    }
}
