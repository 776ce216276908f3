use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationLease {
    pub owner_id: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LeaseError {
    #[error("validation already running (owner {owner_id}, expires {expires_at})")]
    Held {
        owner_id: String,
        expires_at: DateTime<Utc>,
    },
    #[error("lease is not held by {0}")]
    NotOwner(String),
}

impl ValidationLease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Grants a lease unless a live one belongs to somebody else. Expired leases
    /// are always reclaimable; the same owner re-acquiring simply extends.
    pub fn acquire(
        current: Option<&ValidationLease>,
        owner_id: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<ValidationLease, LeaseError> {
        if let Some(lease) = current
            && !lease.is_expired(now)
            && lease.owner_id != owner_id
        {
            return Err(LeaseError::Held {
                owner_id: lease.owner_id.clone(),
                expires_at: lease.expires_at,
            });
        }
        Ok(ValidationLease {
            owner_id: owner_id.to_owned(),
            acquired_at: now,
            expires_at: now + ttl,
        })
    }

    pub fn renew(
        current: Option<&ValidationLease>,
        owner_id: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<ValidationLease, LeaseError> {
        match current {
            Some(lease) if lease.owner_id == owner_id => Ok(ValidationLease {
                owner_id: lease.owner_id.clone(),
                acquired_at: lease.acquired_at,
                expires_at: now + ttl,
            }),
            Some(lease) if !lease.is_expired(now) => Err(LeaseError::NotOwner(owner_id.to_owned())),
            // Nobody else holds it: renewing an expired or missing lease re-acquires.
            _ => Self::acquire(current, owner_id, ttl, now),
        }
    }

    /// Whether `owner_id` may delete the stored lease.
    pub fn can_release(current: Option<&ValidationLease>, owner_id: &str) -> Result<(), LeaseError> {
        match current {
            None => Ok(()),
            Some(lease) if lease.owner_id == owner_id => Ok(()),
            Some(_) => Err(LeaseError::NotOwner(owner_id.to_owned())),
        }
    }
}
