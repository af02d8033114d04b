use thiserror::Error;

/// Errors that can occur while configuring or driving the telemetry pipeline.
///
/// Producer-side input problems (negative counter increments, malformed label
/// lists) are absorbed and logged rather than represented here.
#[derive(Error, Debug)]
pub enum TelemetryError {
    /// The client configuration was rejected.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// `start` was called on a client that already left its initial state.
    #[error("Client already started")]
    AlreadyStarted,

    /// An HTTP-level failure while delivering a batch: connect, IO,
    /// serialization, or deadline exceeded.
    #[error("Http error: {0}")]
    Http(#[from] reqwest::Error),

    /// The ingest endpoint answered outside the 2xx range.
    #[error("Ingest endpoint returned status {0}")]
    Status(u16),

    /// A custom error with a free-form message.
    #[error("Custom error: {0}")]
    Custom(String),
}

impl From<String> for TelemetryError {
    fn from(value: String) -> Self {
        Self::Custom(value)
    }
}

impl From<&str> for TelemetryError {
    fn from(value: &str) -> Self {
        Self::Custom(value.to_string())
    }
}
