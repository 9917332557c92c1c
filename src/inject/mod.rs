//! Injection pipeline: durable, ordered context delivery to running agents.
//!
//! Agents own their terminal's I/O, so producers never write to a session
//! directly. They enqueue entries here; the runner drains them at the
//! agent's next lifecycle event and surfaces everything in one injection.
//! Within a session, drain order equals enqueue order; across sessions
//! there is no ordering.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rusqlite::params;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::beads::Beads;
use crate::errors::StoreError;
use crate::town::TOWN_PREFIX;

/// What produced an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Mail,
    Decision,
    Nudge,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mail => "mail",
            Self::Decision => "decision",
            Self::Nudge => "nudge",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "mail" => Some(Self::Mail),
            "decision" => Some(Self::Decision),
            "nudge" => Some(Self::Nudge),
            _ => None,
        }
    }
}

/// One pending injection entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub kind: EntryKind,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// Durable per-session injection queues over the town database.
pub struct Injector {
    beads: Arc<Beads>,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl Injector {
    pub fn new(beads: Arc<Beads>) -> Self {
        Self {
            beads,
            locks: DashMap::new(),
        }
    }

    fn session_lock(&self, session_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Append an entry to a session's queue. Non-blocking apart from the
    /// session mutex; the entry is durable once this returns.
    pub async fn enqueue(
        &self,
        session_id: &str,
        kind: EntryKind,
        content: &str,
    ) -> Result<(), StoreError> {
        let lock = self.session_lock(session_id);
        let _guard = lock.lock().await;
        self.beads.with_db(TOWN_PREFIX, |db| {
            db.connection().execute(
                "INSERT INTO injections (session_id, kind, content, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![session_id, kind.as_str(), content, Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
    }

    /// Atomically remove and return every pending entry for a session, in
    /// enqueue order. Empty queue returns an empty vec, never blocks.
    pub async fn drain(&self, session_id: &str) -> Result<Vec<Entry>, StoreError> {
        let lock = self.session_lock(session_id);
        let _guard = lock.lock().await;
        self.beads.with_db(TOWN_PREFIX, |db| {
            let conn = db.connection();
            let mut stmt = conn.prepare(
                "SELECT seq, kind, content, created_at FROM injections
                 WHERE session_id = ?1 ORDER BY seq ASC",
            )?;
            let rows = stmt.query_map(params![session_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?;

            let mut seqs = Vec::new();
            let mut entries = Vec::new();
            for row in rows {
                let (seq, kind_raw, content, created_raw) = row?;
                seqs.push(seq);
                entries.push(Entry {
                    kind: EntryKind::parse(&kind_raw).unwrap_or(EntryKind::Nudge),
                    content,
                    timestamp: chrono::DateTime::parse_from_rfc3339(&created_raw)
                        .map(|t| t.with_timezone(&Utc))
                        .unwrap_or_else(|_| Utc::now()),
                });
            }
            // Store-then-ack: rows leave the table only after they were read
            // out successfully.
            for seq in seqs {
                conn.execute("DELETE FROM injections WHERE seq = ?1", params![seq])?;
            }
            Ok(entries)
        })
    }

    /// Pending entry count for a session without consuming anything.
    pub fn pending(&self, session_id: &str) -> Result<u64, StoreError> {
        self.beads.with_db(TOWN_PREFIX, |db| {
            let n: i64 = db.connection().query_row(
                "SELECT COUNT(*) FROM injections WHERE session_id = ?1",
                params![session_id],
                |row| row.get(0),
            )?;
            Ok(n as u64)
        })
    }
}
