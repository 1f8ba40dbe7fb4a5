// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Errors raised while resolving the runtime configuration.
///
/// These are the only errors that reach the process exit code; everything
/// that happens after startup is isolated to the message or connection
/// attempt that caused it.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("missing required secret: {0} is empty")]
    MissingSecret(&'static str),
}

/// Errors raised by a sink while handling a single message.
///
/// Sink errors are caught at the dispatch boundary: the message is lost,
/// the stream is not.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("file write failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("influx write failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("influx rejected write ({status}): {body}")]
    Rejected {
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("influx writer unavailable: {0}")]
    WriterUnavailable(String),
}
