//! Transport envelopes around producer payloads.
//!
//! A delivery is one NDJSON line naming its source kind. Some producers
//! batch or wrap their records: flow log subscriptions carry a `logEvents`
//! array whose `message` fields hold the actual records, and lifecycle
//! notifications carry the record under `detail` with the notification
//! time beside it.

use contact_ledger_core::{LedgerError, SourceKind};
use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Delivery {
    pub source_kind: SourceKind,
    pub payload: Value,
}

impl Delivery {
    /// # Errors
    /// Returns [`LedgerError::MalformedEvent`] when the line is not a
    /// delivery object with a known source kind.
    pub fn parse_line(line: &str) -> Result<Self, LedgerError> {
        serde_json::from_str(line)
            .map_err(|err| LedgerError::MalformedEvent(format!("invalid delivery: {err}")))
    }

    /// Raw event payloads carried by this delivery, in envelope order.
    #[must_use]
    pub fn events(&self) -> Vec<Result<Value, LedgerError>> {
        unwrap_envelope(self.source_kind, &self.payload)
    }
}

/// Splits one delivered payload into the raw events it carries.
///
/// Each entry fails independently, so one undecodable log message does not
/// take the rest of its batch down with it.
#[must_use]
pub fn unwrap_envelope(
    source_kind: SourceKind,
    payload: &Value,
) -> Vec<Result<Value, LedgerError>> {
    match source_kind {
        SourceKind::ContactFlowLog => match payload.get("logEvents") {
            Some(Value::Array(entries)) => entries.iter().map(decode_log_message).collect(),
            Some(_) => vec![Err(LedgerError::MalformedEvent(
                "logEvents MUST be an array".to_string(),
            ))],
            None => vec![Ok(payload.clone())],
        },
        SourceKind::LifecycleEvent => vec![Ok(unwrap_detail(payload))],
        SourceKind::ContactFlowInvocation => vec![Ok(payload.clone())],
    }
}

fn decode_log_message(entry: &Value) -> Result<Value, LedgerError> {
    match entry.get("message") {
        Some(Value::String(text)) => serde_json::from_str(text).map_err(|err| {
            LedgerError::MalformedEvent(format!("log event message is not JSON: {err}"))
        }),
        Some(message @ Value::Object(_)) => Ok(message.clone()),
        _ => Err(LedgerError::MalformedEvent(
            "log event has no message".to_string(),
        )),
    }
}

/// The envelope `time` is authoritative and replaces any `timestamp` the
/// detail carries.
fn unwrap_detail(payload: &Value) -> Value {
    let Some(Value::Object(detail)) = payload.get("detail") else {
        return payload.clone();
    };

    let mut detail = detail.clone();
    if let Some(time) = payload.get("time") {
        detail.insert("timestamp".to_string(), time.clone());
    }
    Value::Object(detail)
}
