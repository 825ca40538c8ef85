use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::event::{ContactEvent, ContactId, EventTimestamp, SourceKind};

/// Greatest event timestamp merged so far, per source kind.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct HighWaterMarks {
    pub contact_flow_log: EventTimestamp,
    pub contact_flow_invocation: EventTimestamp,
    pub lifecycle_event: EventTimestamp,
}

impl HighWaterMarks {
    #[must_use]
    pub fn get(&self, kind: SourceKind) -> EventTimestamp {
        match kind {
            SourceKind::ContactFlowLog => self.contact_flow_log,
            SourceKind::ContactFlowInvocation => self.contact_flow_invocation,
            SourceKind::LifecycleEvent => self.lifecycle_event,
        }
    }

    /// Both contact-flow sources feed one projection; this is its gate.
    #[must_use]
    pub fn contact_flow(&self) -> EventTimestamp {
        self.contact_flow_log.max(self.contact_flow_invocation)
    }

    /// Raises the mark for `kind` to `timestamp`; never lowers it.
    pub fn advance(&mut self, kind: SourceKind, timestamp: EventTimestamp) {
        let slot = match kind {
            SourceKind::ContactFlowLog => &mut self.contact_flow_log,
            SourceKind::ContactFlowInvocation => &mut self.contact_flow_invocation,
            SourceKind::LifecycleEvent => &mut self.lifecycle_event,
        };
        if timestamp > *slot {
            *slot = timestamp;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusProjection {
    pub event_type: String,
    pub timestamp: EventTimestamp,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContactFlowProjection {
    pub source_kind: SourceKind,
    pub flow_name: Option<String>,
    pub module_type: Option<String>,
    pub timestamp: EventTimestamp,
    pub attributes: Map<String, Value>,
}

/// Sticky marker for a lifecycle stage the contact has reached.
///
/// Presence is the flag. `detail` follows the newest occurrence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Milestone {
    pub first_seen_at: EventTimestamp,
    pub last_seen_at: EventTimestamp,
    pub detail: Value,
}

impl Milestone {
    #[must_use]
    pub fn new(timestamp: EventTimestamp, detail: Value) -> Self {
        Self {
            first_seen_at: timestamp,
            last_seen_at: timestamp,
            detail,
        }
    }

    /// Folds another occurrence in; only a strictly newer one replaces `detail`.
    pub fn observe(&mut self, timestamp: EventTimestamp, detail: Value) {
        if timestamp < self.first_seen_at {
            self.first_seen_at = timestamp;
        }
        if timestamp > self.last_seen_at {
            self.last_seen_at = timestamp;
            self.detail = detail;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimestampedValue {
    pub value: Value,
    pub timestamp: EventTimestamp,
}

/// Merged aggregate for one contact.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContactRecord {
    pub contact_id: ContactId,
    /// Write counter maintained by the merge engine; 0 means never stored.
    pub revision: u64,
    pub history: Vec<ContactEvent>,
    pub high_water_marks: HighWaterMarks,
    pub latest_status: Option<StatusProjection>,
    pub latest_contact_flow: Option<ContactFlowProjection>,
    pub queued: Option<Milestone>,
    pub connected_to_agent: Option<Milestone>,
    pub disconnected: Option<Milestone>,
    pub parameters: BTreeMap<String, TimestampedValue>,
    pub first_event_at: Option<EventTimestamp>,
    pub last_event_at: Option<EventTimestamp>,
    /// Unix seconds after which storage may reclaim the record.
    pub expires_at: i64,
}

impl ContactRecord {
    /// The record a contact starts from before its first merge.
    #[must_use]
    pub fn skeleton(contact_id: ContactId, expires_at: i64) -> Self {
        Self {
            contact_id,
            revision: 0,
            history: Vec::new(),
            high_water_marks: HighWaterMarks::default(),
            latest_status: None,
            latest_contact_flow: None,
            queued: None,
            connected_to_agent: None,
            disconnected: None,
            parameters: BTreeMap::new(),
            first_event_at: None,
            last_event_at: None,
            expires_at,
        }
    }

    #[must_use]
    pub fn was_queued(&self) -> bool {
        self.queued.is_some()
    }

    #[must_use]
    pub fn was_connected_to_agent(&self) -> bool {
        self.connected_to_agent.is_some()
    }

    #[must_use]
    pub fn disconnect_timestamp(&self) -> Option<EventTimestamp> {
        self.disconnected.as_ref().map(|milestone| milestone.last_seen_at)
    }

    /// Moves expiry out to `candidate` unless it is already later.
    pub fn extend_expiry(&mut self, candidate: i64) {
        if candidate > self.expires_at {
            self.expires_at = candidate;
        }
    }

    /// Appends `event` and restores timestamp order.
    ///
    /// The sort is stable, so events sharing a timestamp keep insertion order.
    pub(crate) fn push_history(&mut self, event: &ContactEvent) {
        self.history.push(event.clone());
        self.history.sort_by_key(|entry| entry.timestamp);
        self.first_event_at = self.history.first().map(|entry| entry.timestamp);
        self.last_event_at = self.history.last().map(|entry| entry.timestamp);
    }
}
