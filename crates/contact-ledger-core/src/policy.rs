//! Conflict and status resolution.
//!
//! Every rule is gated on event timestamps rather than arrival order, so
//! folding the same set of events in any order yields the same projections,
//! high-water marks and milestones.

use serde_json::Value;

use crate::event::{ContactEvent, EventKind, SourceKind};
use crate::record::{
    ContactFlowProjection, ContactRecord, Milestone, StatusProjection, TimestampedValue,
};

pub const EVENT_TYPE_QUEUED: &str = "QUEUED";
pub const EVENT_TYPE_CONNECTED_TO_AGENT: &str = "CONNECTED_TO_AGENT";
pub const EVENT_TYPE_DISCONNECTED: &str = "DISCONNECTED";

const QUEUE_DETAIL_FIELD: &str = "queueInfo";
const AGENT_DETAIL_FIELD: &str = "agentInfo";
const DISCONNECT_DETAIL_FIELD: &str = "disconnectDetails";

type ProjectionUpdate = fn(&mut ContactRecord, &ContactEvent);

struct Rule {
    source_kind: SourceKind,
    /// `None` matches every event type of the source kind.
    event_type: Option<&'static str>,
    update: ProjectionUpdate,
}

const RULES: &[Rule] = &[
    Rule {
        source_kind: SourceKind::LifecycleEvent,
        event_type: None,
        update: project_status,
    },
    Rule {
        source_kind: SourceKind::LifecycleEvent,
        event_type: Some(EVENT_TYPE_QUEUED),
        update: mark_queued,
    },
    Rule {
        source_kind: SourceKind::LifecycleEvent,
        event_type: Some(EVENT_TYPE_CONNECTED_TO_AGENT),
        update: mark_connected_to_agent,
    },
    Rule {
        source_kind: SourceKind::LifecycleEvent,
        event_type: Some(EVENT_TYPE_DISCONNECTED),
        update: mark_disconnected,
    },
    Rule {
        source_kind: SourceKind::ContactFlowLog,
        event_type: None,
        update: project_contact_flow,
    },
    Rule {
        source_kind: SourceKind::ContactFlowInvocation,
        event_type: None,
        update: project_contact_flow,
    },
    Rule {
        source_kind: SourceKind::ContactFlowInvocation,
        event_type: None,
        update: merge_parameters,
    },
];

/// Folds one event into `record`: history, projections, milestones, then
/// the source's high-water mark.
pub fn apply_event(record: &mut ContactRecord, event: &ContactEvent) {
    record.push_history(event);

    let source_kind = event.source_kind();
    let event_type = event.event_type();
    for rule in RULES {
        if rule.source_kind != source_kind {
            continue;
        }
        if rule.event_type.is_some() && rule.event_type != event_type {
            continue;
        }
        (rule.update)(record, event);
    }

    record.high_water_marks.advance(source_kind, event.timestamp);
}

fn project_status(record: &mut ContactRecord, event: &ContactEvent) {
    let Some(event_type) = event.event_type() else {
        return;
    };
    if event.timestamp > record.high_water_marks.lifecycle_event {
        record.latest_status = Some(StatusProjection {
            event_type: event_type.to_string(),
            timestamp: event.timestamp,
        });
    }
}

fn project_contact_flow(record: &mut ContactRecord, event: &ContactEvent) {
    if event.timestamp <= record.high_water_marks.contact_flow() {
        return;
    }
    let (flow_name, module_type) = match &event.kind {
        EventKind::ContactFlowLog {
            flow_name,
            module_type,
        }
        | EventKind::ContactFlowInvocation {
            flow_name,
            module_type,
            ..
        } => (flow_name.clone(), module_type.clone()),
        EventKind::LifecycleEvent { .. } => return,
    };
    record.latest_contact_flow = Some(ContactFlowProjection {
        source_kind: event.source_kind(),
        flow_name,
        module_type,
        timestamp: event.timestamp,
        attributes: event.attributes.clone(),
    });
}

fn merge_parameters(record: &mut ContactRecord, event: &ContactEvent) {
    let EventKind::ContactFlowInvocation { parameters, .. } = &event.kind else {
        return;
    };
    for (name, value) in parameters {
        match record.parameters.get_mut(name) {
            Some(existing) if event.timestamp <= existing.timestamp => {}
            Some(existing) => {
                existing.value = value.clone();
                existing.timestamp = event.timestamp;
            }
            None => {
                record.parameters.insert(
                    name.clone(),
                    TimestampedValue {
                        value: value.clone(),
                        timestamp: event.timestamp,
                    },
                );
            }
        }
    }
}

fn mark_queued(record: &mut ContactRecord, event: &ContactEvent) {
    observe_milestone(&mut record.queued, event, QUEUE_DETAIL_FIELD);
}

fn mark_connected_to_agent(record: &mut ContactRecord, event: &ContactEvent) {
    observe_milestone(&mut record.connected_to_agent, event, AGENT_DETAIL_FIELD);
}

fn mark_disconnected(record: &mut ContactRecord, event: &ContactEvent) {
    observe_milestone(&mut record.disconnected, event, DISCONNECT_DETAIL_FIELD);
}

fn observe_milestone(slot: &mut Option<Milestone>, event: &ContactEvent, detail_field: &str) {
    let detail = event
        .attributes
        .get(detail_field)
        .cloned()
        .unwrap_or(Value::Null);
    match slot {
        Some(milestone) => milestone.observe(event.timestamp, detail),
        None => *slot = Some(Milestone::new(event.timestamp, detail)),
    }
}
