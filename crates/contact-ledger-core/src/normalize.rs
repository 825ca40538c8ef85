//! Maps raw producer payloads onto [`ContactEvent`].
//!
//! Each source kind names its contact id, timestamp and descriptive fields
//! through an ordered list of dot-separated paths. The first path that
//! resolves to a non-null value wins; everything else in the payload passes
//! through untouched as event attributes.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::event::{ContactEvent, ContactId, EventKind, EventTimestamp, SourceKind};
use crate::LedgerError;

/// Field paths recognized for one source kind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceFieldMapping {
    pub contact_id: Vec<String>,
    pub timestamp: Vec<String>,
    #[serde(default)]
    pub event_type: Vec<String>,
    #[serde(default)]
    pub flow_name: Vec<String>,
    #[serde(default)]
    pub module_type: Vec<String>,
    #[serde(default)]
    pub parameters: Vec<String>,
}

/// Per-source-kind field mappings used by [`normalize`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FieldMappings {
    pub contact_flow_log: SourceFieldMapping,
    pub contact_flow_invocation: SourceFieldMapping,
    pub lifecycle_event: SourceFieldMapping,
}

impl Default for FieldMappings {
    fn default() -> Self {
        Self {
            contact_flow_log: SourceFieldMapping {
                contact_id: paths(&["InitialContactId", "ContactId"]),
                timestamp: paths(&["Timestamp"]),
                event_type: Vec::new(),
                flow_name: paths(&["ContactFlowName"]),
                module_type: paths(&["ContactFlowModuleType"]),
                parameters: Vec::new(),
            },
            contact_flow_invocation: SourceFieldMapping {
                contact_id: paths(&[
                    "Details.ContactData.InitialContactId",
                    "Details.ContactData.ContactId",
                    "InitialContactId",
                    "ContactId",
                ]),
                timestamp: paths(&["Details.Parameters.Timestamp", "Timestamp"]),
                event_type: Vec::new(),
                flow_name: paths(&["Details.Parameters.ContactFlowName", "ContactFlowName"]),
                module_type: paths(&[
                    "Details.Parameters.ContactFlowModuleType",
                    "ContactFlowModuleType",
                ]),
                parameters: paths(&["Details.Parameters", "Parameters"]),
            },
            lifecycle_event: SourceFieldMapping {
                contact_id: paths(&["initialContactId", "contactId"]),
                timestamp: paths(&["timestamp", "time"]),
                event_type: paths(&["eventType"]),
                flow_name: Vec::new(),
                module_type: Vec::new(),
                parameters: Vec::new(),
            },
        }
    }
}

impl FieldMappings {
    #[must_use]
    pub fn for_kind(&self, kind: SourceKind) -> &SourceFieldMapping {
        match kind {
            SourceKind::ContactFlowLog => &self.contact_flow_log,
            SourceKind::ContactFlowInvocation => &self.contact_flow_invocation,
            SourceKind::LifecycleEvent => &self.lifecycle_event,
        }
    }

    /// Checks that every source kind can resolve the fields the merge reads.
    ///
    /// # Errors
    /// Returns [`LedgerError::Configuration`] when a required path list is
    /// empty or contains a blank path.
    pub fn validate(&self) -> Result<(), LedgerError> {
        for kind in SourceKind::ALL {
            let mapping = self.for_kind(kind);
            if mapping.contact_id.is_empty() {
                return Err(LedgerError::Configuration(format!(
                    "{kind}: contact_id MUST list at least one field path"
                )));
            }
            if mapping.timestamp.is_empty() {
                return Err(LedgerError::Configuration(format!(
                    "{kind}: timestamp MUST list at least one field path"
                )));
            }
            if kind == SourceKind::LifecycleEvent && mapping.event_type.is_empty() {
                return Err(LedgerError::Configuration(format!(
                    "{kind}: event_type MUST list at least one field path"
                )));
            }

            let all_paths = mapping
                .contact_id
                .iter()
                .chain(&mapping.timestamp)
                .chain(&mapping.event_type)
                .chain(&mapping.flow_name)
                .chain(&mapping.module_type)
                .chain(&mapping.parameters);
            for path in all_paths {
                if path.split('.').any(|segment| segment.trim().is_empty()) {
                    return Err(LedgerError::Configuration(format!(
                        "{kind}: invalid field path {path:?}"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Decodes and validates mappings from JSON.
    ///
    /// # Errors
    /// Returns [`LedgerError::Configuration`] when decoding fails or the
    /// decoded mappings are incomplete.
    pub fn from_json(value: &Value) -> Result<Self, LedgerError> {
        let mappings: Self = serde_json::from_value(value.clone()).map_err(|err| {
            LedgerError::Configuration(format!("invalid field mapping JSON payload: {err}"))
        })?;
        mappings.validate()?;
        Ok(mappings)
    }
}

/// Builds the canonical event for a decoded payload of the given kind.
///
/// # Errors
/// Returns [`LedgerError::MalformedEvent`] when the payload is not a JSON
/// object, or when the contact id, timestamp, or (for lifecycle events) the
/// event type cannot be resolved.
pub fn normalize(
    source_kind: SourceKind,
    raw_payload: &Value,
    mappings: &FieldMappings,
) -> Result<ContactEvent, LedgerError> {
    let Value::Object(attributes) = raw_payload else {
        return Err(LedgerError::MalformedEvent(format!(
            "{source_kind} payload MUST be a JSON object"
        )));
    };
    let mapping = mappings.for_kind(source_kind);

    let contact_id = match first_present(attributes, &mapping.contact_id) {
        Some(Value::String(raw)) => ContactId::parse(raw)?,
        Some(other) => {
            return Err(LedgerError::MalformedEvent(format!(
                "{source_kind} contact id MUST be a string, got {other}"
            )))
        }
        None => {
            return Err(LedgerError::MalformedEvent(format!(
                "{source_kind} payload has no contact id (looked for {})",
                mapping.contact_id.join(", ")
            )))
        }
    };

    let timestamp = match first_present(attributes, &mapping.timestamp) {
        Some(value) => EventTimestamp::from_json(value)?,
        None => {
            return Err(LedgerError::MalformedEvent(format!(
                "{source_kind} payload has no timestamp (looked for {})",
                mapping.timestamp.join(", ")
            )))
        }
    };

    let kind = match source_kind {
        SourceKind::ContactFlowLog => EventKind::ContactFlowLog {
            flow_name: optional_text(attributes, &mapping.flow_name),
            module_type: optional_text(attributes, &mapping.module_type),
        },
        SourceKind::ContactFlowInvocation => EventKind::ContactFlowInvocation {
            flow_name: optional_text(attributes, &mapping.flow_name),
            module_type: optional_text(attributes, &mapping.module_type),
            parameters: match first_present(attributes, &mapping.parameters) {
                Some(Value::Object(parameters)) => parameters.clone(),
                _ => Map::new(),
            },
        },
        SourceKind::LifecycleEvent => match first_present(attributes, &mapping.event_type) {
            Some(Value::String(event_type)) if !event_type.trim().is_empty() => {
                EventKind::LifecycleEvent {
                    event_type: event_type.clone(),
                }
            }
            _ => {
                return Err(LedgerError::MalformedEvent(format!(
                    "{source_kind} payload has no event type (looked for {})",
                    mapping.event_type.join(", ")
                )))
            }
        },
    };

    Ok(ContactEvent {
        contact_id,
        timestamp,
        kind,
        attributes: attributes.clone(),
    })
}

/// Resolves a dot-separated path inside a JSON object.
#[must_use]
pub fn lookup_path<'a>(object: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = object.get(segments.next()?)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

fn first_present<'a>(object: &'a Map<String, Value>, paths: &[String]) -> Option<&'a Value> {
    paths
        .iter()
        .filter_map(|path| lookup_path(object, path))
        .find(|value| !value.is_null())
}

fn optional_text(object: &Map<String, Value>, paths: &[String]) -> Option<String> {
    first_present(object, paths)
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn paths(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| (*value).to_string()).collect()
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

    fn must_malformed<T: std::fmt::Debug>(result: Result<T, LedgerError>) -> String {
        match result {
            Err(LedgerError::MalformedEvent(message)) => message,
            other => panic!("expected MalformedEvent, got {other:?}"),
        }
    }

    #[test]
    fn flow_log_prefers_initial_contact_id() {
        let payload = json!({
            "InitialContactId": "initial-1",
            "ContactId": "transfer-2",
            "Timestamp": "2026-02-07T12:00:00.000Z",
            "ContactFlowName": "Main IVR",
            "ContactFlowModuleType": "PlayPrompt",
        });

        let event = must_ok(normalize(
            SourceKind::ContactFlowLog,
            &payload,
            &FieldMappings::default(),
        ));

        assert_eq!(event.contact_id.as_str(), "initial-1");
        assert_eq!(event.source_kind(), SourceKind::ContactFlowLog);
        assert_eq!(
            event.kind,
            EventKind::ContactFlowLog {
                flow_name: Some("Main IVR".to_string()),
                module_type: Some("PlayPrompt".to_string()),
            }
        );
        assert_eq!(event.attributes.get("ContactId"), Some(&json!("transfer-2")));
    }

    #[test]
    fn lifecycle_falls_back_to_secondary_contact_id() {
        let payload = json!({
            "contactId": "c-7",
            "initialContactId": null,
            "eventType": "QUEUED",
            "timestamp": 100,
            "queueInfo": {"queueArn": "arn:queue/1"},
        });

        let event = must_ok(normalize(
            SourceKind::LifecycleEvent,
            &payload,
            &FieldMappings::default(),
        ));

        assert_eq!(event.contact_id.as_str(), "c-7");
        assert_eq!(event.event_type(), Some("QUEUED"));
        assert_eq!(event.timestamp, must_ok(EventTimestamp::from_unix_millis(100)));
    }

    #[test]
    fn invocation_reads_nested_contact_data_and_parameters() {
        let payload = json!({
            "Details": {
                "ContactData": {"ContactId": "c-9"},
                "Parameters": {
                    "Timestamp": "2026-02-07T12:00:05Z",
                    "ContactFlowName": "Billing",
                    "intent": "pay_bill",
                },
            },
            "Name": "ContactFlowEvent",
        });

        let event = must_ok(normalize(
            SourceKind::ContactFlowInvocation,
            &payload,
            &FieldMappings::default(),
        ));

        assert_eq!(event.contact_id.as_str(), "c-9");
        match &event.kind {
            EventKind::ContactFlowInvocation {
                flow_name,
                module_type,
                parameters,
            } => {
                assert_eq!(flow_name.as_deref(), Some("Billing"));
                assert_eq!(module_type, &None);
                assert_eq!(parameters.get("intent"), Some(&json!("pay_bill")));
            }
            other => panic!("unexpected kind: {other:?}"),
        }
    }

    #[test]
    fn missing_contact_id_is_malformed() {
        let payload = json!({"Timestamp": "2026-02-07T12:00:00Z"});
        let message = must_malformed(normalize(
            SourceKind::ContactFlowLog,
            &payload,
            &FieldMappings::default(),
        ));
        assert!(message.contains("no contact id"));
    }

    #[test]
    fn missing_or_invalid_timestamp_is_malformed() {
        let mappings = FieldMappings::default();
        let missing = json!({"contactId": "c1", "eventType": "QUEUED"});
        let message = must_malformed(normalize(SourceKind::LifecycleEvent, &missing, &mappings));
        assert!(message.contains("no timestamp"));

        let invalid = json!({"contactId": "c1", "eventType": "QUEUED", "timestamp": "soon"});
        let _ = must_malformed(normalize(SourceKind::LifecycleEvent, &invalid, &mappings));
    }

    #[test]
    fn non_string_contact_id_and_non_object_payload_are_malformed() {
        let mappings = FieldMappings::default();
        let numeric = json!({"contactId": 42, "eventType": "QUEUED", "timestamp": 1});
        let _ = must_malformed(normalize(SourceKind::LifecycleEvent, &numeric, &mappings));
        let _ = must_malformed(normalize(SourceKind::LifecycleEvent, &json!([1, 2]), &mappings));
    }

    #[test]
    fn lifecycle_without_event_type_is_malformed() {
        let payload = json!({"contactId": "c1", "timestamp": 5});
        let message = must_malformed(normalize(
            SourceKind::LifecycleEvent,
            &payload,
            &FieldMappings::default(),
        ));
        assert!(message.contains("event type"));
    }

    #[test]
    fn default_mappings_validate_and_decode_from_json() {
        let defaults = FieldMappings::default();
        must_ok(defaults.validate());

        let encoded = must_ok(serde_json::to_value(&defaults));
        let decoded = must_ok(FieldMappings::from_json(&encoded));
        assert_eq!(decoded, defaults);
    }

    #[test]
    fn mappings_without_required_paths_are_rejected() {
        let mut mappings = FieldMappings::default();
        mappings.lifecycle_event.event_type.clear();
        assert!(matches!(
            mappings.validate(),
            Err(LedgerError::Configuration(_))
        ));

        let mut mappings = FieldMappings::default();
        mappings.contact_flow_log.timestamp = vec!["Details..Timestamp".to_string()];
        assert!(matches!(
            mappings.validate(),
            Err(LedgerError::Configuration(_))
        ));
    }

    #[test]
    fn lookup_path_walks_nested_objects_only() {
        let payload = json!({"a": {"b": {"c": 1}}, "list": [1]});
        let Value::Object(object) = payload else {
            panic!("fixture must be an object");
        };
        assert_eq!(lookup_path(&object, "a.b.c"), Some(&json!(1)));
        assert_eq!(lookup_path(&object, "a.x"), None);
        assert_eq!(lookup_path(&object, "list.0"), None);
    }
}
