//! Named advisory lock backed by the shared database.
//!
//! The scheduled stock check may run in several stateless instances at once;
//! this lock keeps overlapping runs from racing through fetch+diff together.
//! Acquisition is non-blocking: a `false` result means another run is in
//! progress and the caller should skip this cycle, not fail.

use crate::db;
use anyhow::Result;
use chrono::Utc;
use std::time::Duration;
use tracing::instrument;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct JobLock {
    pool: db::Pool,
    key: String,
    ttl: Duration,
    holder: String,
}

impl JobLock {
    /// Each `JobLock` value carries its own holder token, so a release only
    /// ever frees its own acquisition. A lease that outlives `ttl` may be
    /// stolen by a later run (the previous holder is assumed crashed).
    pub fn new(pool: db::Pool, key: impl Into<String>, ttl: Duration) -> Self {
        Self {
            pool,
            key: key.into(),
            ttl,
            holder: Uuid::new_v4().to_string(),
        }
    }

    #[instrument(skip_all, fields(key = %self.key))]
    pub async fn try_acquire(&self) -> Result<bool> {
        db::try_acquire_job_lock(
            &self.pool,
            &self.key,
            &self.holder,
            self.ttl.as_secs(),
            Utc::now(),
        )
        .await
    }

    #[instrument(skip_all, fields(key = %self.key))]
    pub async fn release(&self) -> Result<()> {
        db::release_job_lock(&self.pool, &self.key, &self.holder).await
    }
}
