//! Lease domain types
//!
//! A lease binds a job to the one agent allowed to execute it. Every
//! mutating call from an agent presents a [`LeaseClaim`] that is compared
//! against the current lease.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Ownership record of a job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub job_id: Uuid,
    pub agent_id: String,
    pub token: Uuid,
    pub granted_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Credentials presented by the lease holder
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseClaim {
    pub agent_id: String,
    pub token: Uuid,
}

impl Lease {
    /// Grants a fresh lease valid for `ttl` from `now`
    pub fn grant(job_id: Uuid, agent_id: impl Into<String>, now: DateTime<Utc>, ttl: Duration) -> Self {
        Self {
            job_id,
            agent_id: agent_id.into(),
            token: Uuid::new_v4(),
            granted_at: now,
            expires_at: now + ttl_to_chrono(ttl),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn is_held_by(&self, claim: &LeaseClaim) -> bool {
        self.agent_id == claim.agent_id && self.token == claim.token
    }

    /// Pushes the expiry to `now + ttl`
    pub fn renew(&mut self, now: DateTime<Utc>, ttl: Duration) {
        self.expires_at = now + ttl_to_chrono(ttl);
    }

    pub fn claim(&self) -> LeaseClaim {
        LeaseClaim {
            agent_id: self.agent_id.clone(),
            token: self.token,
        }
    }
}

fn ttl_to_chrono(ttl: Duration) -> chrono::Duration {
    chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX)
}
