//! Read-merge-write cycle with conditional put and bounded retry.

use serde_json::Value;
use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::event::{ContactEvent, ContactId, SourceKind};
use crate::expiry::ExpiryPolicy;
use crate::normalize::{normalize, FieldMappings};
use crate::policy::apply_event;
use crate::record::ContactRecord;
use crate::store::{PutOutcome, RecordStore};
use crate::{now_utc, LedgerError};

pub const DEFAULT_MAX_MERGE_ATTEMPTS: u32 = 5;

pub struct MergeEngine<S> {
    store: S,
    expiry: ExpiryPolicy,
    max_attempts: u32,
}

impl<S: RecordStore> MergeEngine<S> {
    /// # Errors
    /// Returns [`LedgerError::Configuration`] when `max_attempts` is zero.
    pub fn new(store: S, expiry: ExpiryPolicy, max_attempts: u32) -> Result<Self, LedgerError> {
        if max_attempts == 0 {
            return Err(LedgerError::Configuration(
                "max_attempts MUST be >= 1".to_string(),
            ));
        }
        Ok(Self {
            store,
            expiry,
            max_attempts,
        })
    }

    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }

    #[must_use]
    pub fn expiry(&self) -> ExpiryPolicy {
        self.expiry
    }

    /// Merges `event` into the stored record for `contact_id`.
    ///
    /// # Errors
    /// See [`MergeEngine::merge_at`].
    pub fn merge(
        &self,
        contact_id: &ContactId,
        event: &ContactEvent,
    ) -> Result<ContactRecord, LedgerError> {
        self.merge_at(contact_id, event, now_utc())
    }

    /// Normalizes one decoded producer payload and merges it.
    ///
    /// # Errors
    /// Returns [`LedgerError::MalformedEvent`] when the payload cannot be
    /// normalized, otherwise the errors of [`MergeEngine::merge_at`].
    pub fn submit(
        &self,
        source_kind: SourceKind,
        raw_payload: &Value,
        mappings: &FieldMappings,
    ) -> Result<ContactRecord, LedgerError> {
        let event = normalize(source_kind, raw_payload, mappings)?;
        self.merge(&event.contact_id, &event)
    }

    /// Merges `event` with `now` as the expiry reference time.
    ///
    /// Each attempt re-reads the record, folds the event in, and writes back
    /// conditionally on the revision it read. A lost race re-runs the whole
    /// cycle against the fresh record.
    ///
    /// # Errors
    /// Returns [`LedgerError::MalformedEvent`] when the event belongs to a
    /// different contact, [`LedgerError::StoreUnavailable`] when the store
    /// fails, and [`LedgerError::MergeConflict`] when every attempt lost a
    /// concurrent-write race.
    pub fn merge_at(
        &self,
        contact_id: &ContactId,
        event: &ContactEvent,
        now: OffsetDateTime,
    ) -> Result<ContactRecord, LedgerError> {
        if &event.contact_id != contact_id {
            return Err(LedgerError::MalformedEvent(format!(
                "event for contact {} submitted under contact {contact_id}",
                event.contact_id
            )));
        }

        let expires_at = self.expiry.expires_at(now);
        for attempt in 1..=self.max_attempts {
            let current = self.store.get(contact_id)?;
            let expected_revision = current.as_ref().map(|record| record.revision);
            debug!(
                %contact_id,
                attempt,
                ?expected_revision,
                source_kind = %event.source_kind(),
                "merging event"
            );

            let mut next = current
                .unwrap_or_else(|| ContactRecord::skeleton(contact_id.clone(), expires_at));
            apply_event(&mut next, event);
            next.extend_expiry(expires_at);
            next.revision = expected_revision.map_or(1, |revision| revision + 1);

            match self.store.put(&next, expected_revision)? {
                PutOutcome::Written => {
                    debug!(%contact_id, revision = next.revision, "record written");
                    return Ok(next);
                }
                PutOutcome::Conflict => {
                    warn!(%contact_id, attempt, "concurrent write detected, retrying merge");
                }
            }
        }

        Err(LedgerError::MergeConflict {
            contact_id: contact_id.to_string(),
            attempts: self.max_attempts,
        })
    }
}
