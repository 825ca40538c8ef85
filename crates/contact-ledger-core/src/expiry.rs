use time::{Duration, OffsetDateTime};

use crate::LedgerError;

/// Sliding time-to-live applied on every merge.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ExpiryPolicy {
    retention: Duration,
}

impl ExpiryPolicy {
    /// # Errors
    /// Returns [`LedgerError::Configuration`] when `retention` is not positive.
    pub fn new(retention: Duration) -> Result<Self, LedgerError> {
        if retention <= Duration::ZERO {
            return Err(LedgerError::Configuration(
                "retention MUST be a positive duration".to_string(),
            ));
        }
        Ok(Self { retention })
    }

    /// # Errors
    /// Returns [`LedgerError::Configuration`] when `hours` is zero.
    pub fn from_hours(hours: u32) -> Result<Self, LedgerError> {
        Self::new(Duration::hours(i64::from(hours)))
    }

    #[must_use]
    pub fn retention(&self) -> Duration {
        self.retention
    }

    #[must_use]
    pub fn compute_expiry(&self, now: OffsetDateTime) -> OffsetDateTime {
        now.saturating_add(self.retention)
    }

    /// [`ExpiryPolicy::compute_expiry`] as Unix seconds, the stored form.
    #[must_use]
    pub fn expires_at(&self, now: OffsetDateTime) -> i64 {
        self.compute_expiry(now).unix_timestamp()
    }
}
