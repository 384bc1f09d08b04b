use crate::error::DecodeError;
use crate::policy::ChannelSpec;
use crate::router::Route;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Integer timestamps below this are treated as epoch seconds, above as epoch milliseconds.
const EPOCH_MILLIS_CUTOFF: i64 = 100_000_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Channel {
    PressureIn,
    PressureOut,
    Flow,
    FlowReject,
    Conductivity,
    Temp,
    PressureSwitch,
    FloatCall,
}

impl Channel {
    pub const ALL: [Channel; 8] = [
        Channel::PressureIn,
        Channel::PressureOut,
        Channel::Flow,
        Channel::FlowReject,
        Channel::Conductivity,
        Channel::Temp,
        Channel::PressureSwitch,
        Channel::FloatCall,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Channel::PressureIn => "PRESSURE_IN",
            Channel::PressureOut => "PRESSURE_OUT",
            Channel::Flow => "FLOW",
            Channel::FlowReject => "FLOW_REJECT",
            Channel::Conductivity => "CONDUCTIVITY",
            Channel::Temp => "TEMP",
            Channel::PressureSwitch => "PRESSURE_SWITCH",
            Channel::FloatCall => "FLOAT_CALL",
        }
    }

    /// Switch-style inputs report on/off rather than a measurement.
    pub fn is_boolean(self) -> bool {
        matches!(self, Channel::PressureSwitch | Channel::FloatCall)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = ();

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let trimmed = raw.trim();
        Channel::ALL
            .into_iter()
            .find(|channel| channel.as_str().eq_ignore_ascii_case(trimmed))
            .ok_or(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SampleValue {
    Number(f64),
    Bool(bool),
}

impl SampleValue {
    /// Booleans map to 1.0 / 0.0 so comparisons stay uniform across channels.
    pub fn as_f64(self) -> f64 {
        match self {
            SampleValue::Number(value) => value,
            SampleValue::Bool(true) => 1.0,
            SampleValue::Bool(false) => 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetrySample {
    pub device_id: String,
    pub tenant_id: String,
    pub channel: Channel,
    pub value: SampleValue,
    pub unit: Option<String>,
    pub observed_at: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WirePayload {
    Bare(WireValue),
    Record(WireRecord),
}

#[derive(Debug, Deserialize)]
struct WireRecord {
    #[serde(default, alias = "v")]
    value: Option<WireValue>,
    #[serde(default, alias = "timestamp")]
    ts: Option<WireTimestamp>,
    #[serde(default)]
    unit: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireTimestamp {
    Int(i64),
    Float(f64),
    Text(String),
}

impl WireTimestamp {
    fn to_datetime(&self) -> Result<DateTime<Utc>, DecodeError> {
        let parsed = match self {
            WireTimestamp::Text(raw) => DateTime::parse_from_rfc3339(raw.trim())
                .map(|dt| dt.with_timezone(&Utc))
                .ok(),
            WireTimestamp::Int(raw) if *raw < EPOCH_MILLIS_CUTOFF => {
                Utc.timestamp_opt(*raw, 0).single()
            }
            WireTimestamp::Int(raw) => Utc.timestamp_millis_opt(*raw).single(),
            WireTimestamp::Float(raw) if raw.is_finite() => {
                Utc.timestamp_millis_opt((*raw * 1000.0) as i64).single()
            }
            WireTimestamp::Float(_) => None,
        };
        parsed.ok_or_else(|| DecodeError::Timestamp(format!("{self:?}")))
    }
}

/// Turns raw MQTT payloads into typed samples, validated against the policy's channel limits.
#[derive(Clone, Debug)]
pub struct MessageDecoder {
    channels: Arc<HashMap<Channel, ChannelSpec>>,
}

impl MessageDecoder {
    pub fn new(channels: Arc<HashMap<Channel, ChannelSpec>>) -> Self {
        Self { channels }
    }

    /// Accepts a bare JSON scalar (`0.2`, `true`) or an object carrying
    /// `value`/`v` plus optional `ts` and `unit`. Without a device timestamp
    /// the sample is stamped with `received_at`.
    pub fn decode(
        &self,
        route: &Route,
        payload: &mut [u8],
        received_at: DateTime<Utc>,
    ) -> Result<TelemetrySample, DecodeError> {
        if payload.iter().all(u8::is_ascii_whitespace) {
            return Err(DecodeError::Empty);
        }

        let wire: WirePayload = simd_json::serde::from_slice(payload)
            .map_err(|err| DecodeError::Malformed(err.to_string()))?;
        let (raw_value, ts, unit) = match wire {
            WirePayload::Bare(value) => (value, None, None),
            WirePayload::Record(record) => (
                record.value.ok_or(DecodeError::MissingValue)?,
                record.ts,
                record.unit,
            ),
        };

        let channel = route.channel;
        let value = if channel.is_boolean() {
            SampleValue::Bool(coerce_bool(channel, raw_value)?)
        } else {
            SampleValue::Number(coerce_number(channel, raw_value)?)
        };

        let spec = self.channels.get(&channel);
        let unit = unit
            .map(|raw| raw.trim().to_string())
            .filter(|raw| !raw.is_empty());
        let unit = match (unit, spec.and_then(|spec| spec.unit.as_deref())) {
            (Some(got), Some(expected)) if !got.eq_ignore_ascii_case(expected) => {
                return Err(DecodeError::UnitMismatch {
                    channel,
                    expected: expected.to_string(),
                    got,
                });
            }
            (Some(got), _) => Some(got),
            (None, expected) => expected.map(str::to_string),
        };

        if let (SampleValue::Number(value), Some(spec)) = (value, spec) {
            if value < spec.min || value > spec.max {
                return Err(DecodeError::OutOfRange {
                    channel,
                    value,
                    min: spec.min,
                    max: spec.max,
                });
            }
        }

        let observed_at = match ts {
            Some(ts) => ts.to_datetime()?,
            None => received_at,
        };

        Ok(TelemetrySample {
            device_id: route.device_id.clone(),
            tenant_id: route.tenant_id.clone(),
            channel,
            value,
            unit,
            observed_at,
            received_at,
        })
    }
}

fn coerce_number(channel: Channel, raw: WireValue) -> Result<f64, DecodeError> {
    let value = match raw {
        WireValue::Int(value) => value as f64,
        WireValue::Float(value) => value,
        WireValue::Text(text) => text
            .trim()
            .parse::<f64>()
            .map_err(|_| DecodeError::NonNumeric(channel))?,
        WireValue::Bool(_) => return Err(DecodeError::NonNumeric(channel)),
    };
    if !value.is_finite() {
        return Err(DecodeError::NonFinite(channel));
    }
    Ok(value)
}

fn coerce_bool(channel: Channel, raw: WireValue) -> Result<bool, DecodeError> {
    match raw {
        WireValue::Bool(value) => Ok(value),
        WireValue::Int(0) => Ok(false),
        WireValue::Int(1) => Ok(true),
        WireValue::Float(value) if value == 0.0 => Ok(false),
        WireValue::Float(value) if value == 1.0 => Ok(true),
        WireValue::Text(text) => match text.trim().to_ascii_lowercase().as_str() {
            "true" | "on" | "1" => Ok(true),
            "false" | "off" | "0" => Ok(false),
            _ => Err(DecodeError::NonBoolean(channel)),
        },
        _ => Err(DecodeError::NonBoolean(channel)),
    }
}
