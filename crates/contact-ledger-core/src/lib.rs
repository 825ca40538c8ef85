//! Merges out-of-order, possibly duplicated contact events from several
//! producers into one aggregate record per contact.
//!
//! - [`normalize`] turns a decoded producer payload into a [`ContactEvent`].
//! - [`apply_event`] is the pure resolution policy.
//! - [`MergeEngine`] runs the read-merge-write cycle against a
//!   [`RecordStore`] with conditional put and bounded retry.

use time::{OffsetDateTime, UtcOffset};

pub mod engine;
pub mod event;
pub mod expiry;
pub mod normalize;
pub mod policy;
pub mod record;
pub mod store;

pub use engine::{MergeEngine, DEFAULT_MAX_MERGE_ATTEMPTS};
pub use event::{ContactEvent, ContactId, EventKind, EventTimestamp, SourceKind};
pub use expiry::ExpiryPolicy;
pub use normalize::{lookup_path, normalize, FieldMappings, SourceFieldMapping};
pub use policy::{
    apply_event, EVENT_TYPE_CONNECTED_TO_AGENT, EVENT_TYPE_DISCONNECTED, EVENT_TYPE_QUEUED,
};
pub use record::{
    ContactFlowProjection, ContactRecord, HighWaterMarks, Milestone, StatusProjection,
    TimestampedValue,
};
pub use store::{InMemoryRecordStore, PutOutcome, RecordStore, StoreError};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum LedgerError {
    #[error("malformed event: {0}")]
    MalformedEvent(String),
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("merge conflict for contact {contact_id}: gave up after {attempts} attempts")]
    MergeConflict { contact_id: String, attempts: u32 },
    #[error("configuration error: {0}")]
    Configuration(String),
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum ErrorKind {
    MalformedEvent,
    StoreUnavailable,
    MergeConflict,
    Configuration,
}

impl ErrorKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MalformedEvent => "malformed_event",
            Self::StoreUnavailable => "store_unavailable",
            Self::MergeConflict => "merge_conflict",
            Self::Configuration => "configuration",
        }
    }
}

impl LedgerError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MalformedEvent(_) => ErrorKind::MalformedEvent,
            Self::StoreUnavailable(_) => ErrorKind::StoreUnavailable,
            Self::MergeConflict { .. } => ErrorKind::MergeConflict,
            Self::Configuration(_) => ErrorKind::Configuration,
        }
    }

    /// Whether redelivering the same event may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::StoreUnavailable | ErrorKind::MergeConflict
        )
    }
}

impl From<StoreError> for LedgerError {
    fn from(err: StoreError) -> Self {
        Self::StoreUnavailable(err.0)
    }
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`LedgerError::Configuration`] when parsing fails or an input
/// timestamp is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, LedgerError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| LedgerError::Configuration(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(LedgerError::Configuration(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`LedgerError::Configuration`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, LedgerError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            LedgerError::Configuration(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}
