//! History Inscription
//!
//! Flushes the unflushed slice of the history log to permanent storage on
//! a cron schedule anchored to the wall clock (default: UTC midnight).
//! Inscription failure is non-fatal; the events stay unflushed and the
//! scheduler force-flushes once the backlog goes stale.

use std::str::FromStr;
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use cron::Schedule;
use tracing::{debug, info};

use crate::state::StateStore;
use crate::types::StorageClient;

/// Backlog age after which a flush is forced regardless of the schedule.
/// A healthy agent never reaches this: it means at least one scheduled
/// inscription was missed.
pub const STALE_AFTER_HOURS: i64 = 24;

/// Tracks the inscription cron schedule against wall-clock time.
pub struct InscriptionScheduler {
    schedule: Schedule,
    last_run: DateTime<Utc>,
}

impl InscriptionScheduler {
    /// Anchors the schedule at `now`: the first run is the next scheduled
    /// tick after process start, not process start itself.
    pub fn new(expr: &str, now: DateTime<Utc>) -> Result<Self> {
        let schedule = Schedule::from_str(expr)
            .with_context(|| format!("invalid inscription cron expression: {expr}"))?;
        Ok(Self {
            schedule,
            last_run: now,
        })
    }

    /// Whether a scheduled tick has passed since the last run.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.schedule
            .after(&self.last_run)
            .next()
            .map(|next| next <= now)
            .unwrap_or(false)
    }

    pub fn mark_run(&mut self, now: DateTime<Utc>) {
        self.last_run = now;
    }
}

/// Whether the unflushed backlog is old enough to force a flush.
pub fn backlog_is_stale(store: &Mutex<StateStore>, now: DateTime<Utc>) -> bool {
    store
        .lock()
        .expect("state store lock poisoned")
        .oldest_unflushed()
        .ok()
        .flatten()
        .map(|oldest| now - oldest > Duration::hours(STALE_AFTER_HOURS))
        .unwrap_or(false)
}

/// Upload every unflushed history event as one inscription and mark the
/// events flushed under the returned content id. `None` means there was
/// nothing to flush.
pub async fn flush_history(
    identity: &str,
    store: &Mutex<StateStore>,
    storage: &dyn StorageClient,
) -> Result<Option<String>> {
    let events = store
        .lock()
        .expect("state store lock poisoned")
        .unflushed_history()?;
    if events.is_empty() {
        debug!("No unflushed history; skipping inscription");
        return Ok(None);
    }

    let payload = serde_json::to_vec(&serde_json::json!({
        "identity": identity,
        "events": events,
        "inscribedAt": Utc::now().to_rfc3339(),
    }))?;

    let content_id = storage
        .upload(
            payload,
            vec!["symbiont-history".to_string(), identity.to_string()],
        )
        .await
        .context("history inscription upload failed")?;

    let ids: Vec<String> = events.iter().map(|e| e.id.clone()).collect();
    store
        .lock()
        .expect("state store lock poisoned")
        .mark_history_flushed(&ids, &content_id)?;

    info!(
        "Inscribed {} history events as {}",
        ids.len(),
        content_id
    );
    Ok(Some(content_id))
}
