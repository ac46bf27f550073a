// ===============================
// src/error.rs
// ===============================
use thiserror::Error;

/// Setup-time misconfiguration. Only these are returned to the caller of
/// initialization; everything at runtime degrades to an ERROR event.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("topic must not be empty")]
    EmptyTopic,
    #[error("key specification must name at least one field")]
    EmptyKeySpec,
    #[error("record kind {kind} has no field named {field}")]
    UnknownField { kind: &'static str, field: String },
    #[error("bounded queue capacity must be > 0")]
    ZeroCapacity,
    #[error("event bus already started")]
    AlreadyStarted,
    #[error("topic {topic} does not carry {kind} records")]
    TopicMismatch { kind: &'static str, topic: String },
}

/// A subscriber failed while processing an event.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("handler on {topic} failed: {reason}")]
    Handler { topic: String, reason: String },
    #[error("handler on {topic} panicked: {reason}")]
    Panicked { topic: String, reason: String },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TableError {
    /// MissingFieldError: a key field is absent on the record.
    #[error("{kind} record is missing key field {field}")]
    MissingField { kind: &'static str, field: String },
    #[error("payload on {topic} is not a {kind} record")]
    WrongPayload { kind: &'static str, topic: String },
}

/// Adapter-side connectivity/protocol failures. Never raised across the
/// gateway/bus boundary, always turned into `write_error`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GatewayFault {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("{op} timed out after {ms}ms")]
    Timeout { op: &'static str, ms: u64 },
    #[error("request rejected: {0}")]
    Rejected(String),
    #[error("gateway not connected")]
    NotConnected,
}

impl GatewayFault {
    /// Stable numeric code carried on the ERROR record.
    pub fn code(&self) -> i64 {
        match self {
            GatewayFault::Connect(_) => 1001,
            GatewayFault::Timeout { .. } => 1002,
            GatewayFault::Rejected(_) => 1003,
            GatewayFault::NotConnected => 1004,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SinkError {
    #[error("log sink closed")]
    Closed,
    #[error("log sink backlog full")]
    Full,
    #[error("log sink serialize failed: {0}")]
    Serialize(String),
}

/// Error type returned by bus handlers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(msg: impl Into<String>) -> Self { Self(msg.into()) }
}

impl From<TableError> for HandlerError {
    fn from(e: TableError) -> Self { Self(e.to_string()) }
}

impl From<&str> for HandlerError {
    fn from(s: &str) -> Self { Self(s.to_string()) }
}

impl From<String> for HandlerError {
    fn from(s: String) -> Self { Self(s) }
}

pub type HandlerResult = Result<(), HandlerError>;
