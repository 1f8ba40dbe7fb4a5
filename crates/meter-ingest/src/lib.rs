// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Telemetry ingestion for a multi-channel current/power/voltage meter.
//!
//! This crate subscribes to an MQTT topic pattern carrying JSON-encoded
//! sensor readings, normalizes each message into a fixed-shape record, and
//! hands it to one of several interchangeable sinks (console, append-only
//! CSV file, InfluxDB 2.x).

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod config;
pub mod csv_sink;
pub mod errors;
pub mod influx;
pub mod influx_sink;
pub mod ingest;
pub mod reading;
pub mod sink;
