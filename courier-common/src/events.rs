//! Structured operator events published to the log side-queue.
//!
//! Every event is mirrored to the local [`tracing`] output first, then
//! serialized as JSON onto a queue of the message bus so that a central
//! collector can pick it up. A publish failure is surfaced to the caller:
//! on the per-delivery path it is a fatal condition that forces a requeue,
//! while background callers may choose to carry on with the local log line
//! alone.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{FixedOffset, SecondsFormat, Utc};
use serde::Serialize;
use thiserror::Error;

/// Offset of the timezone the collector expects timestamps in (UTC+3).
const COLLECTOR_UTC_OFFSET_SECS: i32 = 3 * 60 * 60;

/// Failure to hand an event payload to the bus.
#[derive(Debug, Error)]
#[error("failed to publish log event: {0}")]
pub struct PublishError(pub String);

/// Transport used to ship serialized events. The bus adapter implements
/// this; tests use in-memory stand-ins.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, payload: Vec<u8>) -> Result<(), PublishError>;
}

/// Severity of an event on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Info,
    Error,
    Fatal,
}

impl Level {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Error => "error",
            Self::Fatal => "fatal",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wire shape of a published event.
#[derive(Debug, Serialize)]
struct LogEvent<'a> {
    service_name: &'a str,
    message: &'a str,
    message_type: &'a str,
    time_date: String,
}

/// Sink for operator-visible events, tagged with the service name from the
/// configuration.
pub struct EventSink {
    publisher: Arc<dyn EventPublisher>,
    service_name: String,
    offset: FixedOffset,
}

impl EventSink {
    #[must_use]
    pub fn new(publisher: Arc<dyn EventPublisher>, service_name: impl Into<String>) -> Self {
        Self {
            publisher,
            service_name: service_name.into(),
            offset: FixedOffset::east_opt(COLLECTOR_UTC_OFFSET_SECS)
                .expect("offset is within a day"),
        }
    }

    /// Emit one event: log it locally, then publish it to the side queue.
    ///
    /// The local log line is written unconditionally, so even a failed
    /// publish leaves a trace on the box.
    ///
    /// # Errors
    ///
    /// Returns an error when the event could not be handed to the bus.
    pub async fn emit(&self, level: Level, message: &str) -> Result<(), PublishError> {
        match level {
            Level::Info => tracing::info!("{message}"),
            Level::Error => tracing::error!("{message}"),
            Level::Fatal => tracing::error!(fatal = true, "{message}"),
        }

        let event = LogEvent {
            service_name: &self.service_name,
            message,
            message_type: level.as_str(),
            time_date: Utc::now()
                .with_timezone(&self.offset)
                .to_rfc3339_opts(SecondsFormat::Micros, false),
        };
        let payload = serde_json::to_vec(&event)
            .map_err(|err| PublishError(format!("failed to serialize log event: {err}")))?;
        self.publisher.publish(payload).await
    }

    /// # Errors
    ///
    /// See [`emit`](Self::emit).
    pub async fn info(&self, message: &str) -> Result<(), PublishError> {
        self.emit(Level::Info, message).await
    }

    /// # Errors
    ///
    /// See [`emit`](Self::emit).
    pub async fn error(&self, message: &str) -> Result<(), PublishError> {
        self.emit(Level::Error, message).await
    }

    /// # Errors
    ///
    /// See [`emit`](Self::emit).
    pub async fn fatal(&self, message: &str) -> Result<(), PublishError> {
        self.emit(Level::Fatal, message).await
    }
}
