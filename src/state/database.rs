//! Symbiont State Store
//!
//! SQLite persistence via rusqlite: synchronous, single-process,
//! single-writer access. The scheduler is the only writer, which is the
//! serialization discipline the runtime relies on.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::fs;
use std::path::Path;
use uuid::Uuid;

use crate::types::{
    DeathRecord, HistoryEvent, HistoryKind, OperatingMode, SettlementEvidence, SettlementStatus,
};

const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS kv (
    key        TEXT PRIMARY KEY,
    value      TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS history_events (
    id         TEXT PRIMARY KEY,
    kind       TEXT NOT NULL,
    detail     TEXT NOT NULL,
    created_at TEXT NOT NULL,
    flushed_at TEXT
);

CREATE TABLE IF NOT EXISTS mode_transitions (
    id             TEXT PRIMARY KEY,
    from_mode      TEXT NOT NULL,
    to_mode        TEXT NOT NULL,
    stable_balance REAL NOT NULL,
    gas_balance    REAL NOT NULL,
    created_at     TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS pending_settlements (
    tx_ref       TEXT PRIMARY KEY,
    network_id   TEXT NOT NULL,
    payment      TEXT NOT NULL,
    submitted_at TEXT NOT NULL,
    status       TEXT NOT NULL DEFAULT 'pending'
);

CREATE TABLE IF NOT EXISTS price_history (
    target TEXT PRIMARY KEY,
    total  REAL NOT NULL,
    count  INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS death_record (
    identity TEXT PRIMARY KEY,
    record   TEXT NOT NULL,
    died_at  TEXT NOT NULL
);
"#;

/// The agent's SQLite state handle.
pub struct StateStore {
    conn: Connection,
}

impl StateStore {
    /// Open (or create) the database at `db_path` and initialize the schema.
    pub fn open(db_path: &str) -> Result<Self> {
        if let Some(parent) = Path::new(db_path).parent() {
            if !parent.exists() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create db directory: {}", parent.display())
                })?;
            }
        }

        let conn = Connection::open(db_path)
            .with_context(|| format!("failed to open database: {db_path}"))?;

        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(CREATE_TABLES)
            .context("failed to create tables")?;

        Ok(Self { conn })
    }

    /// Open an in-memory database (useful for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(CREATE_TABLES)
            .context("failed to create tables")?;
        Ok(Self { conn })
    }

    // ─── Key-Value ───────────────────────────────────────────────

    pub fn get_kv(&self, key: &str) -> Result<Option<String>> {
        let result = self
            .conn
            .query_row(
                "SELECT value FROM kv WHERE key = ?1",
                params![key],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(result)
    }

    pub fn set_kv(&self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn delete_kv(&self, key: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        Ok(())
    }

    // ─── History Log ─────────────────────────────────────────────

    /// Append an event to the history log. The log is append-only; events
    /// are only ever marked flushed, never rewritten.
    pub fn append_history(&self, kind: HistoryKind, detail: &str) -> Result<HistoryEvent> {
        let event = HistoryEvent {
            id: Uuid::new_v4().to_string(),
            kind,
            detail: detail.to_string(),
            timestamp: Utc::now().to_rfc3339(),
        };
        let kind_str = serde_json::to_string(&event.kind)?;
        self.conn.execute(
            "INSERT INTO history_events (id, kind, detail, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                event.id,
                kind_str.trim_matches('"'),
                event.detail,
                event.timestamp
            ],
        )?;
        Ok(event)
    }

    pub fn unflushed_history(&self) -> Result<Vec<HistoryEvent>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, kind, detail, created_at FROM history_events
             WHERE flushed_at IS NULL ORDER BY created_at ASC",
        )?;
        let events = stmt
            .query_map([], |row| {
                let kind_str: String = row.get(1)?;
                Ok(HistoryEvent {
                    id: row.get(0)?,
                    kind: serde_json::from_str(&format!("\"{kind_str}\""))
                        .unwrap_or(HistoryKind::Thought),
                    detail: row.get(2)?,
                    timestamp: row.get(3)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(events)
    }

    /// Mark the given events flushed, recording the content id they were
    /// inscribed under.
    pub fn mark_history_flushed(&self, ids: &[String], content_id: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        for id in ids {
            self.conn.execute(
                "UPDATE history_events SET flushed_at = ?1 WHERE id = ?2",
                params![now, id],
            )?;
        }
        self.set_kv("last_inscription_content_id", content_id)?;
        Ok(())
    }

    /// Timestamp of the oldest event not yet inscribed, if any.
    pub fn oldest_unflushed(&self) -> Result<Option<DateTime<Utc>>> {
        let ts: Option<String> = self
            .conn
            .query_row(
                "SELECT MIN(created_at) FROM history_events WHERE flushed_at IS NULL",
                [],
                |row| row.get(0),
            )
            .optional()?
            .flatten();
        Ok(ts.and_then(|t| t.parse::<DateTime<Utc>>().ok()))
    }

    // ─── Mode Transitions ────────────────────────────────────────

    pub fn record_mode_transition(
        &self,
        from: OperatingMode,
        to: OperatingMode,
        stable: f64,
        gas: f64,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT INTO mode_transitions (id, from_mode, to_mode, stable_balance, gas_balance, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                Uuid::new_v4().to_string(),
                format!("{from:?}"),
                format!("{to:?}"),
                stable,
                gas,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    // ─── Pending Settlements ─────────────────────────────────────

    /// Cache ambiguous settlement evidence for retry on a later cycle.
    pub fn insert_pending_settlement(&self, evidence: &SettlementEvidence) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO pending_settlements (tx_ref, network_id, payment, submitted_at, status)
             VALUES (?1, ?2, ?3, ?4, 'pending')",
            params![
                evidence.tx_ref,
                evidence.network_id,
                serde_json::to_string(&evidence.payment)?,
                evidence.submitted_at,
            ],
        )?;
        Ok(())
    }

    pub fn pending_settlements(&self) -> Result<Vec<SettlementEvidence>> {
        let mut stmt = self.conn.prepare(
            "SELECT tx_ref, network_id, payment, submitted_at FROM pending_settlements
             WHERE status = 'pending' ORDER BY submitted_at ASC",
        )?;
        let rows = stmt
            .query_map([], |row| {
                let payment_json: String = row.get(2)?;
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    payment_json,
                    row.get::<_, String>(3)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut out = Vec::with_capacity(rows.len());
        for (tx_ref, network_id, payment_json, submitted_at) in rows {
            let payment = serde_json::from_str(&payment_json)
                .with_context(|| format!("corrupt payment JSON for settlement {tx_ref}"))?;
            out.push(SettlementEvidence {
                tx_ref,
                network_id,
                payment,
                submitted_at,
            });
        }
        Ok(out)
    }

    pub fn resolve_settlement(&self, tx_ref: &str, status: SettlementStatus) -> Result<()> {
        let status_str = match status {
            SettlementStatus::Confirmed => "confirmed",
            SettlementStatus::Failed => "failed",
            SettlementStatus::Pending => "pending",
        };
        self.conn.execute(
            "UPDATE pending_settlements SET status = ?1 WHERE tx_ref = ?2",
            params![status_str, tx_ref],
        )?;
        Ok(())
    }

    // ─── Price History ───────────────────────────────────────────

    /// Record a successfully paid price for a target, feeding the
    /// deviation guard.
    pub fn record_price(&self, target: &str, amount: f64) -> Result<()> {
        self.conn.execute(
            "INSERT INTO price_history (target, total, count) VALUES (?1, ?2, 1)
             ON CONFLICT(target) DO UPDATE SET total = total + excluded.total, count = count + 1",
            params![target, amount],
        )?;
        Ok(())
    }

    pub fn average_price(&self, target: &str) -> Result<Option<f64>> {
        let result: Option<(f64, i64)> = self
            .conn
            .query_row(
                "SELECT total, count FROM price_history WHERE target = ?1",
                params![target],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        Ok(result.and_then(|(total, count)| {
            if count > 0 {
                Some(total / count as f64)
            } else {
                None
            }
        }))
    }

    // ─── Death Record ────────────────────────────────────────────

    pub fn record_death(&self, record: &DeathRecord) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO death_record (identity, record, died_at) VALUES (?1, ?2, ?3)",
            params![
                record.identity,
                serde_json::to_string(record)?,
                record.died_at
            ],
        )?;
        Ok(())
    }

    pub fn get_death_record(&self, identity: &str) -> Result<Option<DeathRecord>> {
        let json: Option<String> = self
            .conn
            .query_row(
                "SELECT record FROM death_record WHERE identity = ?1",
                params![identity],
                |row| row.get(0),
            )
            .optional()?;
        match json {
            Some(j) => Ok(Some(serde_json::from_str(&j)?)),
            None => Ok(None),
        }
    }
}
