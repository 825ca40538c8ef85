//! Single-key storage contract consumed by the merge engine.

use std::collections::BTreeMap;
use std::sync::Mutex;

use tracing::debug;

use crate::event::ContactId;
use crate::record::ContactRecord;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
#[error("{0}")]
pub struct StoreError(pub String);

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum PutOutcome {
    Written,
    /// The stored revision no longer matches the one the caller read.
    Conflict,
}

/// Record storage keyed by contact id.
///
/// `put` is conditional: `expected_revision = None` creates the record only
/// if it is absent, `Some(r)` replaces it only while the stored revision is
/// still `r`. Implementations never write partially.
pub trait RecordStore {
    /// # Errors
    /// Returns [`StoreError`] when the backing store cannot be read.
    fn get(&self, contact_id: &ContactId) -> Result<Option<ContactRecord>, StoreError>;

    /// # Errors
    /// Returns [`StoreError`] when the backing store cannot be written.
    fn put(
        &self,
        record: &ContactRecord,
        expected_revision: Option<u64>,
    ) -> Result<PutOutcome, StoreError>;
}

impl<S: RecordStore + ?Sized> RecordStore for &S {
    fn get(&self, contact_id: &ContactId) -> Result<Option<ContactRecord>, StoreError> {
        (**self).get(contact_id)
    }

    fn put(
        &self,
        record: &ContactRecord,
        expected_revision: Option<u64>,
    ) -> Result<PutOutcome, StoreError> {
        (**self).put(record, expected_revision)
    }
}

/// Process-local store, shareable across threads.
#[derive(Debug, Default)]
pub struct InMemoryRecordStore {
    records: Mutex<BTreeMap<ContactId, ContactRecord>>,
}

impl InMemoryRecordStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// # Errors
    /// Returns [`StoreError`] when the lock is poisoned.
    pub fn len(&self) -> Result<usize, StoreError> {
        Ok(self.lock()?.len())
    }

    /// # Errors
    /// Returns [`StoreError`] when the lock is poisoned.
    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.lock()?.is_empty())
    }

    /// Drops records whose `expires_at` is at or before `now_unix`.
    ///
    /// # Errors
    /// Returns [`StoreError`] when the lock is poisoned.
    pub fn purge_expired(&self, now_unix: i64) -> Result<usize, StoreError> {
        let mut records = self.lock()?;
        let before = records.len();
        records.retain(|_, record| record.expires_at > now_unix);
        Ok(before - records.len())
    }

    fn lock(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, BTreeMap<ContactId, ContactRecord>>, StoreError> {
        self.records
            .lock()
            .map_err(|_| StoreError("in-memory record store lock poisoned".to_string()))
    }
}

impl RecordStore for InMemoryRecordStore {
    fn get(&self, contact_id: &ContactId) -> Result<Option<ContactRecord>, StoreError> {
        Ok(self.lock()?.get(contact_id).cloned())
    }

    fn put(
        &self,
        record: &ContactRecord,
        expected_revision: Option<u64>,
    ) -> Result<PutOutcome, StoreError> {
        let mut records = self.lock()?;
        let stored_revision = records.get(&record.contact_id).map(|stored| stored.revision);
        if stored_revision != expected_revision {
            debug!(
                contact_id = %record.contact_id,
                ?stored_revision,
                ?expected_revision,
                "conditional put rejected"
            );
            return Ok(PutOutcome::Conflict);
        }
        records.insert(record.contact_id.clone(), record.clone());
        Ok(PutOutcome::Written)
    }
}
