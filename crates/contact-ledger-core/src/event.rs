use std::fmt::{Display, Formatter};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use time::{Duration, OffsetDateTime, UtcOffset};

use crate::{format_rfc3339, LedgerError};

/// Stable identifier correlating every event of one contact.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct ContactId(String);

impl ContactId {
    /// Builds a contact id from a raw producer value.
    ///
    /// # Errors
    /// Returns [`LedgerError::MalformedEvent`] when the value is empty or
    /// only whitespace.
    pub fn parse(value: &str) -> Result<Self, LedgerError> {
        if value.trim().is_empty() {
            return Err(LedgerError::MalformedEvent(
                "contact id MUST be a non-empty string".to_string(),
            ));
        }
        Ok(Self(value.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ContactId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    ContactFlowLog,
    ContactFlowInvocation,
    LifecycleEvent,
}

impl SourceKind {
    pub const ALL: [Self; 3] = [
        Self::ContactFlowLog,
        Self::ContactFlowInvocation,
        Self::LifecycleEvent,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ContactFlowLog => "contact_flow_log",
            Self::ContactFlowInvocation => "contact_flow_invocation",
            Self::LifecycleEvent => "lifecycle_event",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "contact_flow_log" => Some(Self::ContactFlowLog),
            "contact_flow_invocation" => Some(Self::ContactFlowInvocation),
            "lifecycle_event" => Some(Self::LifecycleEvent),
            _ => None,
        }
    }
}

impl Display for SourceKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Producer-assigned instant, normalized to UTC.
///
/// Accepts RFC 3339 strings with any offset, and epoch milliseconds given
/// either as a JSON integer or as an all-digit string.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct EventTimestamp(OffsetDateTime);

impl EventTimestamp {
    /// The initial high-water mark of a fresh record.
    pub const ZERO: Self = Self(OffsetDateTime::UNIX_EPOCH);

    /// Wraps an instant, normalizing it to UTC.
    ///
    /// # Errors
    /// Returns [`LedgerError::MalformedEvent`] for instants outside years
    /// 0000-9999, which cannot be stored as RFC 3339 text.
    pub fn from_datetime(value: OffsetDateTime) -> Result<Self, LedgerError> {
        let utc = value.to_offset(UtcOffset::UTC);
        if !(0..=9999).contains(&utc.year()) {
            return Err(LedgerError::MalformedEvent(format!(
                "timestamp year {} is out of range",
                utc.year()
            )));
        }
        Ok(Self(utc))
    }

    /// Builds a timestamp from epoch milliseconds.
    ///
    /// # Errors
    /// Returns [`LedgerError::MalformedEvent`] when the value overflows the
    /// supported range.
    pub fn from_unix_millis(millis: i64) -> Result<Self, LedgerError> {
        let value = OffsetDateTime::UNIX_EPOCH
            .checked_add(Duration::milliseconds(millis))
            .ok_or_else(|| {
                LedgerError::MalformedEvent(format!("timestamp {millis} is out of range"))
            })?;
        Self::from_datetime(value)
    }

    /// Parses a textual timestamp.
    ///
    /// # Errors
    /// Returns [`LedgerError::MalformedEvent`] when the value is neither an
    /// RFC 3339 instant nor an epoch-millisecond integer.
    pub fn parse(value: &str) -> Result<Self, LedgerError> {
        let trimmed = value.trim();
        if !trimmed.is_empty() && trimmed.bytes().all(|byte| byte.is_ascii_digit()) {
            let millis = trimmed.parse::<i64>().map_err(|err| {
                LedgerError::MalformedEvent(format!("timestamp out of range: {err}"))
            })?;
            return Self::from_unix_millis(millis);
        }

        OffsetDateTime::parse(trimmed, &time::format_description::well_known::Rfc3339)
            .map_err(|err| {
                LedgerError::MalformedEvent(format!("invalid timestamp {value:?}: {err}"))
            })
            .and_then(Self::from_datetime)
    }

    /// Reads a timestamp from a decoded JSON value.
    ///
    /// # Errors
    /// Returns [`LedgerError::MalformedEvent`] for non-string, non-integer
    /// values and for strings that fail [`EventTimestamp::parse`].
    pub fn from_json(value: &Value) -> Result<Self, LedgerError> {
        match value {
            Value::String(raw) => Self::parse(raw),
            Value::Number(number) => match number.as_i64() {
                Some(millis) => Self::from_unix_millis(millis),
                None => Err(LedgerError::MalformedEvent(format!(
                    "numeric timestamp MUST be integral epoch milliseconds, got {number}"
                ))),
            },
            other => Err(LedgerError::MalformedEvent(format!(
                "timestamp MUST be a string or integer, got {other}"
            ))),
        }
    }

    #[must_use]
    pub fn as_datetime(self) -> OffsetDateTime {
        self.0
    }
}

impl Default for EventTimestamp {
    fn default() -> Self {
        Self::ZERO
    }
}

impl Display for EventTimestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match format_rfc3339(self.0) {
            Ok(text) => f.write_str(&text),
            Err(_) => write!(f, "{}", self.0.unix_timestamp()),
        }
    }
}

impl Serialize for EventTimestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let text = format_rfc3339(self.0).map_err(serde::ser::Error::custom)?;
        serializer.serialize_str(&text)
    }
}

impl<'de> Deserialize<'de> for EventTimestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Self::from_json(&value).map_err(serde::de::Error::custom)
    }
}

/// Source-specific view of an event, derived once at normalization.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "source_kind", rename_all = "snake_case")]
pub enum EventKind {
    ContactFlowLog {
        flow_name: Option<String>,
        module_type: Option<String>,
    },
    ContactFlowInvocation {
        flow_name: Option<String>,
        module_type: Option<String>,
        parameters: Map<String, Value>,
    },
    LifecycleEvent {
        event_type: String,
    },
}

impl EventKind {
    #[must_use]
    pub fn source_kind(&self) -> SourceKind {
        match self {
            Self::ContactFlowLog { .. } => SourceKind::ContactFlowLog,
            Self::ContactFlowInvocation { .. } => SourceKind::ContactFlowInvocation,
            Self::LifecycleEvent { .. } => SourceKind::LifecycleEvent,
        }
    }

    #[must_use]
    pub fn event_type(&self) -> Option<&str> {
        match self {
            Self::LifecycleEvent { event_type } => Some(event_type.as_str()),
            _ => None,
        }
    }
}

/// Canonical event produced by the normalizer and consumed by the merge engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContactEvent {
    pub contact_id: ContactId,
    pub timestamp: EventTimestamp,
    pub kind: EventKind,
    pub attributes: Map<String, Value>,
}

impl ContactEvent {
    #[must_use]
    pub fn source_kind(&self) -> SourceKind {
        self.kind.source_kind()
    }

    #[must_use]
    pub fn event_type(&self) -> Option<&str> {
        self.kind.event_type()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    #[test]
    fn contact_id_rejects_blank_values() {
        assert!(ContactId::parse("").is_err());
        assert!(ContactId::parse("   ").is_err());
        assert_eq!(must_ok(ContactId::parse("c1")).as_str(), "c1");
    }

    #[test]
    fn source_kind_round_trips_through_text() {
        for kind in SourceKind::ALL {
            assert_eq!(SourceKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(SourceKind::parse("cloudwatch"), None);
    }

    #[test]
    fn numeric_and_digit_string_timestamps_are_epoch_millis() {
        let from_number = must_ok(EventTimestamp::from_json(&json!(1_500)));
        let from_string = must_ok(EventTimestamp::parse("1500"));
        assert_eq!(from_number, from_string);
        assert_eq!(from_number.as_datetime().unix_timestamp(), 1);
        assert!(from_number > EventTimestamp::ZERO);
    }

    #[test]
    fn rfc3339_offsets_normalize_to_utc_for_ordering() {
        let paris = must_ok(EventTimestamp::parse("2026-02-07T13:00:00+01:00"));
        let utc = must_ok(EventTimestamp::parse("2026-02-07T12:00:00Z"));
        let later = must_ok(EventTimestamp::parse("2026-02-07T12:00:00.001Z"));
        assert_eq!(paris, utc);
        assert!(later > utc);
    }

    #[test]
    fn invalid_timestamps_are_malformed() {
        for value in [
            json!("yesterday"),
            json!(1.5),
            json!(null),
            json!({"t": 1}),
            json!(i64::MAX),
        ] {
            let err = match EventTimestamp::from_json(&value) {
                Ok(parsed) => panic!("expected failure for {value}, got {parsed}"),
                Err(err) => err,
            };
            assert!(matches!(err, LedgerError::MalformedEvent(_)));
        }
    }

    #[test]
    fn timestamp_serializes_as_rfc3339() {
        let ts = must_ok(EventTimestamp::from_unix_millis(90));
        let encoded = must_ok(serde_json::to_value(ts));
        assert_eq!(encoded, json!("1970-01-01T00:00:00.09Z"));
        let decoded: EventTimestamp = must_ok(serde_json::from_value(encoded));
        assert_eq!(decoded, ts);
    }
}
