//! Callback event types
//!
//! Defines the delivery lifecycle states reported by the provider, the
//! per-message event record and the batch delivered by one HTTP call.

use axum::body::Bytes;
use chrono::{DateTime, Utc};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

/// Errors raised while decoding a callback payload
#[derive(Error, Debug)]
pub enum EventParseError {
    #[error("Unknown event type ordinal: {0}")]
    UnknownEventType(i64),

    #[error("Unknown event type name: {0}")]
    UnknownEventName(String),

    #[error("Malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Batch holds {count} records, limit is {limit}")]
    TooManyRecords { count: usize, limit: usize },
}

const EVENT_TYPE_NAMES: [&str; EventType::COUNT] = [
    "target_valid",
    "target_invalid",
    "sent_succ",
    "sent_fail",
    "received_succ",
    "received_fail",
    "click",
    "retracted_succ",
    "retracted_fail",
];

/// Delivery lifecycle state of a message.
///
/// The ordinal is the wire representation and never changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum EventType {
    TargetValid = 0,
    TargetInvalid = 1,
    SentSucc = 2,
    SentFail = 3,
    ReceivedSucc = 4,
    ReceivedFail = 5,
    Click = 6,
    RetractedSucc = 7,
    RetractedFail = 8,
}

impl EventType {
    pub const COUNT: usize = 9;

    /// All event types in ordinal order
    pub const ALL: [EventType; Self::COUNT] = [
        Self::TargetValid,
        Self::TargetInvalid,
        Self::SentSucc,
        Self::SentFail,
        Self::ReceivedSucc,
        Self::ReceivedFail,
        Self::Click,
        Self::RetractedSucc,
        Self::RetractedFail,
    ];

    pub fn ordinal(self) -> u8 {
        self as u8
    }

    /// Look up an event type by its wire ordinal
    pub fn from_ordinal(ordinal: i64) -> Result<Self, EventParseError> {
        usize::try_from(ordinal)
            .ok()
            .and_then(|idx| Self::ALL.get(idx).copied())
            .ok_or(EventParseError::UnknownEventType(ordinal))
    }

    pub fn as_str(self) -> &'static str {
        EVENT_TYPE_NAMES[self as usize]
    }

    /// Whether this state reports a failure and carries an error
    pub fn is_failure(self) -> bool {
        matches!(
            self,
            Self::TargetInvalid | Self::SentFail | Self::ReceivedFail | Self::RetractedFail
        )
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = EventParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EVENT_TYPE_NAMES
            .iter()
            .position(|name| *name == s)
            .map(|idx| Self::ALL[idx])
            .ok_or_else(|| EventParseError::UnknownEventName(s.to_string()))
    }
}

impl Serialize for EventType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.ordinal())
    }
}

impl<'de> Deserialize<'de> for EventType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let ordinal = i64::deserialize(deserializer)?;
        Self::from_ordinal(ordinal).map_err(de::Error::custom)
    }
}

/// Channel the provider used to deliver the message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "i64", into = "i64")]
pub enum Sender {
    /// Provider's own persistent connection
    App,
    /// Device vendor push channel
    Vendor,
    Sms,
    Email,
    /// Value not known to this build, passed through untouched
    Other(i64),
}

impl From<i64> for Sender {
    fn from(value: i64) -> Self {
        match value {
            0 => Self::App,
            1 => Self::Vendor,
            2 => Self::Sms,
            3 => Self::Email,
            other => Self::Other(other),
        }
    }
}

impl From<Sender> for i64 {
    fn from(sender: Sender) -> Self {
        match sender {
            Sender::App => 0,
            Sender::Vendor => 1,
            Sender::Sms => 2,
            Sender::Email => 3,
            Sender::Other(value) => value,
        }
    }
}

/// Device operating system of the target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "i64", into = "i64")]
pub enum Platform {
    Android,
    Ios,
    Harmony,
    Other(i64),
}

impl From<i64> for Platform {
    fn from(value: i64) -> Self {
        match value {
            1 => Self::Android,
            2 => Self::Ios,
            3 => Self::Harmony,
            other => Self::Other(other),
        }
    }
}

impl From<Platform> for i64 {
    fn from(platform: Platform) -> Self {
        match platform {
            Platform::Android => 1,
            Platform::Ios => 2,
            Platform::Harmony => 3,
            Platform::Other(value) => value,
        }
    }
}

/// Error attached to failure events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventError {
    /// Provider error code
    pub code: i64,
    /// Human-readable reason
    #[serde(default, deserialize_with = "null_as_default")]
    pub message: String,
}

/// Mismatch between an event's type and the presence of its error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorInvariant {
    /// Failure type without an error object
    MissingError,
    /// Success type carrying an error object
    UnexpectedError,
}

/// Treat an explicit `null` like a missing key
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Option::unwrap_or_default)
}

/// One delivery status notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Delivery state being reported
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Channel the message was sent through
    #[serde(rename = "channelkey", default, deserialize_with = "null_as_default")]
    pub channel_key: String,
    /// Message id returned by the original send
    #[serde(rename = "msgid", default, deserialize_with = "null_as_default")]
    pub msg_id: String,
    /// Empty when the message was addressed through the channel itself
    #[serde(rename = "userid", default, deserialize_with = "null_as_default")]
    pub user_id: String,
    /// Channel registration id of the target
    #[serde(default, deserialize_with = "null_as_default")]
    pub sender_id: String,
    /// Delivery channel
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<Sender>,
    /// Target device platform
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
    /// Vendor sub-channel, e.g. "huawei" or "apns"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vendor: Option<String>,
    /// Epoch seconds
    #[serde(default, deserialize_with = "null_as_default")]
    pub sent_time: i64,
    /// Present for failure types
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<EventError>,
    /// Parameters attached to the original send, echoed back verbatim
    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "serde_json::Map::is_empty"
    )]
    pub params: serde_json::Map<String, serde_json::Value>,
}

impl EventRecord {
    pub fn new(event_type: EventType, msg_id: &str) -> Self {
        Self {
            event_type,
            channel_key: String::new(),
            msg_id: msg_id.to_string(),
            user_id: String::new(),
            sender_id: String::new(),
            sender: None,
            platform: None,
            vendor: None,
            sent_time: 0,
            error: None,
            params: serde_json::Map::new(),
        }
    }

    pub fn with_channel_key(mut self, channel_key: &str) -> Self {
        self.channel_key = channel_key.to_string();
        self
    }

    pub fn with_error(mut self, code: i64, message: &str) -> Self {
        self.error = Some(EventError {
            code,
            message: message.to_string(),
        });
        self
    }

    pub fn with_param(mut self, key: &str, value: serde_json::Value) -> Self {
        self.params.insert(key.to_string(), value);
        self
    }

    pub fn param(&self, key: &str) -> Option<&serde_json::Value> {
        self.params.get(key)
    }

    pub fn sent_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.sent_time, 0)
    }

    /// Check that the error is present exactly for failure types
    pub fn error_invariant(&self) -> Option<ErrorInvariant> {
        match (self.event_type.is_failure(), self.error.is_some()) {
            (true, false) => Some(ErrorInvariant::MissingError),
            (false, true) => Some(ErrorInvariant::UnexpectedError),
            _ => None,
        }
    }
}

/// Records delivered by a single POST, with the raw body kept for forensics
#[derive(Debug, Clone)]
pub struct EventBatch {
    pub id: String,
    pub received_at: DateTime<Utc>,
    pub records: Vec<EventRecord>,
    raw: Bytes,
}

impl EventBatch {
    pub fn new(records: Vec<EventRecord>, raw: Bytes) -> Self {
        Self {
            id: format!("cbb_{}", Uuid::new_v4().simple()),
            received_at: Utc::now(),
            records,
            raw,
        }
    }

    /// Decode a JSON array of events.
    ///
    /// Records violating the error/type pairing are kept and logged.
    pub fn parse(raw: Bytes, max_records: usize) -> Result<Self, EventParseError> {
        let records: Vec<EventRecord> = serde_json::from_slice(&raw)?;
        if records.len() > max_records {
            return Err(EventParseError::TooManyRecords {
                count: records.len(),
                limit: max_records,
            });
        }

        let batch = Self::new(records, raw);
        for record in &batch.records {
            if let Some(violation) = record.error_invariant() {
                warn!(
                    batch_id = %batch.id,
                    msg_id = %record.msg_id,
                    event_type = %record.event_type,
                    violation = ?violation,
                    "Callback record error field does not match its type"
                );
            }
        }
        Ok(batch)
    }

    pub fn raw(&self) -> &Bytes {
        &self.raw
    }

    pub fn raw_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.raw)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &EventRecord> {
        self.records.iter()
    }

    pub fn count_by_type(&self) -> BTreeMap<EventType, usize> {
        let mut counts = BTreeMap::new();
        for record in &self.records {
            *counts.entry(record.event_type).or_insert(0) += 1;
        }
        counts
    }
}
