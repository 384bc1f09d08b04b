use crate::telemetry::Channel;
use thiserror::Error;

/// Why an inbound topic could not be attributed to a registered device.
#[derive(Debug, Error)]
pub enum RoutingError {
    #[error("topic does not start with root `{expected}`")]
    RootMismatch { expected: String },
    #[error("expected 4 topic segments, got {0}")]
    SegmentCount(usize),
    #[error("empty topic segment")]
    EmptySegment,
    #[error("malformed device id `{0}`")]
    InvalidDeviceId(String),
    #[error("unknown channel `{0}`")]
    UnknownChannel(String),
    #[error("device `{0}` is not registered")]
    UnknownDevice(String),
    #[error("device `{device_id}` does not belong to tenant segment `{tenant}`")]
    TenantMismatch { device_id: String, tenant: String },
    #[error("device lookup failed: {0}")]
    Lookup(#[from] sqlx::Error),
}

#[derive(Debug, Error, PartialEq)]
pub enum DecodeError {
    #[error("empty payload")]
    Empty,
    #[error("malformed payload: {0}")]
    Malformed(String),
    #[error("payload carries no value")]
    MissingValue,
    #[error("{0} expects a numeric value")]
    NonNumeric(Channel),
    #[error("{0} expects a boolean value")]
    NonBoolean(Channel),
    #[error("{0} value is not finite")]
    NonFinite(Channel),
    #[error("invalid timestamp: {0}")]
    Timestamp(String),
    #[error("{channel} value {value} outside plausible range [{min}, {max}]")]
    OutOfRange {
        channel: Channel,
        value: f64,
        min: f64,
        max: f64,
    },
    #[error("{channel} reported unit `{got}`, expected `{expected}`")]
    UnitMismatch {
        channel: Channel,
        expected: String,
        got: String,
    },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} is required")]
    Missing(String),
    #[error("invalid {key}: {reason}")]
    Invalid { key: String, reason: String },
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse diagnostic policy: {0}")]
    Parse(#[from] simd_json::Error),
    #[error("invalid diagnostic policy: {0}")]
    Policy(String),
}

impl ConfigError {
    pub fn invalid(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("event log unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error(transparent)]
    Connection(#[from] rumqttc::ConnectionError),
    #[error(transparent)]
    Client(#[from] rumqttc::ClientError),
    #[error("broker refused connection: {0:?}")]
    Refused(rumqttc::ConnectReturnCode),
}
