//! SQLite persistence for one bead database.
//!
//! Each routed prefix maps to one `BeadDb`. Core columns are real columns;
//! labels, notes, and the typed extension payload are JSON text, the same
//! discipline the rest of the town uses for persisted records.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};

#[cfg_attr(not(test), allow(unused_imports))]
use crate::beads::types::{Bead, BeadFields, BeadStatus, BeadType};
use crate::errors::StoreError;

/// Bumped on breaking schema changes; a mismatch refuses to open.
const SCHEMA_VERSION: i64 = 1;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS beads (
        id TEXT PRIMARY KEY,
        title TEXT NOT NULL,
        description TEXT NOT NULL DEFAULT '',
        bead_type TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'open',
        priority INTEGER NOT NULL DEFAULT 2,
        labels TEXT NOT NULL DEFAULT '[]',
        assignee TEXT,
        created_by TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        closed_at TEXT,
        close_reason TEXT,
        parent TEXT,
        notes TEXT NOT NULL DEFAULT '{}',
        fields TEXT NOT NULL DEFAULT '{\"kind\":\"none\"}'
    );

    CREATE TABLE IF NOT EXISTS deps (
        blocked TEXT NOT NULL,
        blocker TEXT NOT NULL,
        PRIMARY KEY (blocked, blocker)
    );

    CREATE TABLE IF NOT EXISTS injections (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        session_id TEXT NOT NULL,
        kind TEXT NOT NULL,
        content TEXT NOT NULL,
        created_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS meta (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_beads_status ON beads(status);
    CREATE INDEX IF NOT EXISTS idx_beads_type ON beads(bead_type, status);
    CREATE INDEX IF NOT EXISTS idx_beads_parent ON beads(parent);
    CREATE INDEX IF NOT EXISTS idx_deps_blocker ON deps(blocker);
    CREATE INDEX IF NOT EXISTS idx_injections_session ON injections(session_id);
";

/// Filter for `list`.
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub status: Option<BeadStatus>,
    pub bead_type: Option<BeadType>,
    pub parent: Option<String>,
    pub assignee: Option<String>,
    pub label: Option<String>,
}

impl ListFilter {
    pub fn open() -> Self {
        Self {
            status: Some(BeadStatus::Open),
            ..Default::default()
        }
    }

    pub fn with_type(mut self, t: BeadType) -> Self {
        self.bead_type = Some(t);
        self
    }

    pub fn with_label(mut self, label: &str) -> Self {
        self.label = Some(label.to_string());
        self
    }

    pub fn with_parent(mut self, parent: &str) -> Self {
        self.parent = Some(parent.to_string());
        self
    }
}

#[derive(Debug)]
pub struct BeadDb {
    conn: Connection,
    path: PathBuf,
}

impl BeadDb {
    /// Open (or create) a bead database and verify its schema version.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(|e| StoreError::Unavailable {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })?;
        let db = Self {
            conn,
            path: path.to_path_buf(),
        };
        db.init()?;
        Ok(db)
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn,
            path: PathBuf::from(":memory:"),
        };
        db.init()?;
        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    fn init(&self) -> Result<(), StoreError> {
        self.conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        self.conn.execute_batch(SCHEMA)?;
        let version: Option<String> = self
            .conn
            .query_row(
                "SELECT value FROM meta WHERE key = 'schema_version'",
                [],
                |row| row.get(0),
            )
            .optional()?;
        match version {
            None => {
                self.conn.execute(
                    "INSERT INTO meta (key, value) VALUES ('schema_version', ?1)",
                    params![SCHEMA_VERSION.to_string()],
                )?;
            }
            Some(v) if v == SCHEMA_VERSION.to_string() => {}
            Some(v) => {
                return Err(StoreError::Incompatible {
                    path: self.path.clone(),
                    detail: format!("found schema version {v}, expected {SCHEMA_VERSION}"),
                });
            }
        }
        Ok(())
    }

    // ── CRUD ──────────────────────────────────────────────────────────

    /// Insert a new bead. The caller owns timestamps so replays stay exact.
    pub fn create(&self, bead: &Bead) -> Result<(), StoreError> {
        let labels = serde_json::to_string(&bead.labels).expect("labels serialize");
        let notes = serde_json::to_string(&bead.notes).expect("notes serialize");
        let fields = serde_json::to_string(&bead.fields).expect("fields serialize");
        self.conn.execute(
            "INSERT INTO beads
                 (id, title, description, bead_type, status, priority, labels,
                  assignee, created_by, created_at, updated_at, closed_at,
                  close_reason, parent, notes, fields)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            params![
                bead.id,
                bead.title,
                bead.description,
                bead.bead_type.as_str(),
                bead.status.as_str(),
                bead.priority,
                labels,
                bead.assignee,
                bead.created_by,
                bead.created_at.to_rfc3339(),
                bead.updated_at.to_rfc3339(),
                bead.closed_at.map(|t| t.to_rfc3339()),
                bead.close_reason,
                bead.parent,
                notes,
                fields,
            ],
        )?;
        for blocker in &bead.blocked_by {
            self.insert_dep(&bead.id, blocker)?;
        }
        Ok(())
    }

    /// Fetch a bead if present, dependency edges included.
    pub fn get(&self, id: &str) -> Result<Option<Bead>, StoreError> {
        let row = self
            .conn
            .query_row(
                "SELECT id, title, description, bead_type, status, priority, labels,
                        assignee, created_by, created_at, updated_at, closed_at,
                        close_reason, parent, notes, fields
                 FROM beads WHERE id = ?1",
                params![id],
                Self::map_row,
            )
            .optional()?;
        let Some(mut bead) = row.transpose()? else {
            return Ok(None);
        };
        self.load_deps(&mut bead)?;
        Ok(Some(bead))
    }

    /// Fetch a bead, erroring when absent. Closed beads remain visible here.
    pub fn show(&self, id: &str) -> Result<Bead, StoreError> {
        self.get(id)?.ok_or_else(|| StoreError::NotFound { id: id.to_string() })
    }

    /// Read-modify-write under the store's serialized writer.
    pub fn update<F>(&self, id: &str, mutate: F) -> Result<Bead, StoreError>
    where
        F: FnOnce(&mut Bead),
    {
        let mut bead = self.show(id)?;
        mutate(&mut bead);
        bead.updated_at = Utc::now();
        self.write_columns(&bead)?;
        Ok(bead)
    }

    /// Close a bead. Molecules with open children are rejected.
    pub fn close(&self, id: &str, reason: Option<&str>) -> Result<Bead, StoreError> {
        let bead = self.show(id)?;
        if bead.bead_type == BeadType::Molecule {
            let open_children: i64 = self.conn.query_row(
                "SELECT COUNT(*) FROM beads WHERE parent = ?1 AND status != 'closed'",
                params![id],
                |row| row.get(0),
            )?;
            if open_children > 0 {
                return Err(StoreError::OpenChildren { id: id.to_string() });
            }
        }
        self.update(id, |b| {
            b.status = BeadStatus::Closed;
            b.closed_at = Some(Utc::now());
            b.close_reason = reason.map(str::to_string);
        })
    }

    /// List beads matching the filter, most urgent first, then oldest.
    pub fn list(&self, filter: &ListFilter) -> Result<Vec<Bead>, StoreError> {
        let mut sql = String::from(
            "SELECT id, title, description, bead_type, status, priority, labels,
                    assignee, created_by, created_at, updated_at, closed_at,
                    close_reason, parent, notes, fields
             FROM beads WHERE 1=1",
        );
        let mut args: Vec<String> = Vec::new();
        if let Some(status) = filter.status {
            args.push(status.as_str().to_string());
            sql.push_str(&format!(" AND status = ?{}", args.len()));
        }
        if let Some(t) = filter.bead_type {
            args.push(t.as_str().to_string());
            sql.push_str(&format!(" AND bead_type = ?{}", args.len()));
        }
        if let Some(parent) = &filter.parent {
            args.push(parent.clone());
            sql.push_str(&format!(" AND parent = ?{}", args.len()));
        }
        if let Some(assignee) = &filter.assignee {
            args.push(assignee.clone());
            sql.push_str(&format!(" AND assignee = ?{}", args.len()));
        }
        sql.push_str(" ORDER BY priority ASC, created_at ASC");

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(args.iter()), Self::map_row)?;
        let mut beads = Vec::new();
        for row in rows {
            let mut bead = row??;
            if let Some(label) = &filter.label
                && !bead.labels.contains(label)
            {
                continue;
            }
            self.load_deps(&mut bead)?;
            beads.push(bead);
        }
        Ok(beads)
    }

    /// Open beads carrying a label.
    pub fn list_by_label(&self, label: &str) -> Result<Vec<Bead>, StoreError> {
        self.list(&ListFilter::open().with_label(label))
    }

    /// The ready set: open beads with no open blockers, optionally scoped to
    /// a parent. Ordered most urgent first, then oldest.
    pub fn ready(&self, parent: Option<&str>) -> Result<Vec<Bead>, StoreError> {
        let mut filter = ListFilter::open();
        if let Some(p) = parent {
            filter = filter.with_parent(p);
        }
        let open = self.list(&filter)?;
        let mut ready = Vec::new();
        for bead in open {
            let open_blockers: i64 = self.conn.query_row(
                "SELECT COUNT(*) FROM deps d JOIN beads b ON d.blocker = b.id
                 WHERE d.blocked = ?1 AND b.status != 'closed'",
                params![bead.id],
                |row| row.get(0),
            )?;
            if open_blockers == 0 {
                ready.push(bead);
            }
        }
        Ok(ready)
    }

    // ── Dependencies ──────────────────────────────────────────────────

    /// Declare `blocked` blocked_by `blocker`, rejecting cycles.
    pub fn add_dependency(&self, blocked: &str, blocker: &str) -> Result<(), StoreError> {
        if blocked == blocker {
            return Err(StoreError::Cycle {
                blocker: blocker.to_string(),
                blocked: blocked.to_string(),
            });
        }
        // Walk depends-on edges from the blocker; reaching `blocked` means
        // the new edge would close a loop.
        let edges = self.all_deps()?;
        let mut seen: HashSet<&str> = HashSet::new();
        let mut stack = vec![blocker];
        while let Some(node) = stack.pop() {
            if !seen.insert(node) {
                continue;
            }
            if node == blocked {
                return Err(StoreError::Cycle {
                    blocker: blocker.to_string(),
                    blocked: blocked.to_string(),
                });
            }
            if let Some(next) = edges.get(node) {
                stack.extend(next.iter().map(String::as_str));
            }
        }
        self.insert_dep(blocked, blocker)
    }

    pub fn remove_dependency(&self, blocked: &str, blocker: &str) -> Result<(), StoreError> {
        self.conn.execute(
            "DELETE FROM deps WHERE blocked = ?1 AND blocker = ?2",
            params![blocked, blocker],
        )?;
        Ok(())
    }

    fn insert_dep(&self, blocked: &str, blocker: &str) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT OR IGNORE INTO deps (blocked, blocker) VALUES (?1, ?2)",
            params![blocked, blocker],
        )?;
        Ok(())
    }

    /// blocked -> [blocker] adjacency for cycle walks.
    fn all_deps(&self) -> Result<HashMap<String, Vec<String>>, StoreError> {
        let mut stmt = self.conn.prepare("SELECT blocked, blocker FROM deps")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut edges: HashMap<String, Vec<String>> = HashMap::new();
        for row in rows {
            let (blocked, blocker) = row?;
            edges.entry(blocked).or_default().push(blocker);
        }
        Ok(edges)
    }

    fn load_deps(&self, bead: &mut Bead) -> Result<(), StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT blocker FROM deps WHERE blocked = ?1")?;
        let blockers = stmt.query_map(params![bead.id], |row| row.get::<_, String>(0))?;
        bead.blocked_by = blockers.collect::<Result<BTreeSet<_>, _>>()?;

        let mut stmt = self
            .conn
            .prepare("SELECT blocked FROM deps WHERE blocker = ?1")?;
        let blocked = stmt.query_map(params![bead.id], |row| row.get::<_, String>(0))?;
        bead.blocks = blocked.collect::<Result<BTreeSet<_>, _>>()?;
        Ok(())
    }

    // ── Row mapping ───────────────────────────────────────────────────

    fn write_columns(&self, bead: &Bead) -> Result<(), StoreError> {
        let labels = serde_json::to_string(&bead.labels).expect("labels serialize");
        let notes = serde_json::to_string(&bead.notes).expect("notes serialize");
        let fields = serde_json::to_string(&bead.fields).expect("fields serialize");
        let n = self.conn.execute(
            "UPDATE beads SET title = ?2, description = ?3, status = ?4, priority = ?5,
                 labels = ?6, assignee = ?7, updated_at = ?8, closed_at = ?9,
                 close_reason = ?10, parent = ?11, notes = ?12, fields = ?13
             WHERE id = ?1",
            params![
                bead.id,
                bead.title,
                bead.description,
                bead.status.as_str(),
                bead.priority,
                labels,
                bead.assignee,
                bead.updated_at.to_rfc3339(),
                bead.closed_at.map(|t| t.to_rfc3339()),
                bead.close_reason,
                bead.parent,
                notes,
                fields,
            ],
        )?;
        if n == 0 {
            return Err(StoreError::NotFound {
                id: bead.id.clone(),
            });
        }
        Ok(())
    }

    #[allow(clippy::type_complexity)]
    fn map_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<Bead, StoreError>> {
        let id: String = row.get(0)?;
        let bead_type_raw: String = row.get(3)?;
        let status_raw: String = row.get(4)?;
        let labels_raw: String = row.get(6)?;
        let created_raw: String = row.get(9)?;
        let updated_raw: String = row.get(10)?;
        let closed_raw: Option<String> = row.get(11)?;
        let notes_raw: String = row.get(14)?;
        let fields_raw: String = row.get(15)?;

        let parse = || -> Result<Bead, StoreError> {
            let corrupt = |what: &str| StoreError::Incompatible {
                path: PathBuf::new(),
                detail: format!("bead {id}: unreadable {what}"),
            };
            Ok(Bead {
                id: id.clone(),
                title: row.get(1).map_err(StoreError::Sqlite)?,
                description: row.get(2).map_err(StoreError::Sqlite)?,
                bead_type: BeadType::parse(&bead_type_raw).ok_or_else(|| corrupt("type"))?,
                status: BeadStatus::parse(&status_raw).ok_or_else(|| corrupt("status"))?,
                priority: row.get(5).map_err(StoreError::Sqlite)?,
                labels: serde_json::from_str(&labels_raw).map_err(|_| corrupt("labels"))?,
                assignee: row.get(7).map_err(StoreError::Sqlite)?,
                created_by: row.get(8).map_err(StoreError::Sqlite)?,
                created_at: parse_ts(&created_raw).ok_or_else(|| corrupt("created_at"))?,
                updated_at: parse_ts(&updated_raw).ok_or_else(|| corrupt("updated_at"))?,
                closed_at: match closed_raw {
                    Some(raw) => Some(parse_ts(&raw).ok_or_else(|| corrupt("closed_at"))?),
                    None => None,
                },
                close_reason: row.get(12).map_err(StoreError::Sqlite)?,
                parent: row.get(13).map_err(StoreError::Sqlite)?,
                blocked_by: BTreeSet::new(),
                blocks: BTreeSet::new(),
                notes: serde_json::from_str(&notes_raw).map_err(|_| corrupt("notes"))?,
                fields: serde_json::from_str(&fields_raw).map_err(|_| corrupt("fields"))?,
            })
        };
        Ok(parse())
    }
}

fn parse_ts(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::beads::types::{AgentFields, RoleType};
    use chrono::Duration;

    fn db() -> BeadDb {
        BeadDb::open_in_memory().unwrap()
    }

    #[test]
    fn create_show_round_trip() {
        let db = db();
        let bead = Bead::new("gt-1", "first", BeadType::Task)
            .with_label("urgency:high")
            .with_description("do the thing");
        db.create(&bead).unwrap();
        let got = db.show("gt-1").unwrap();
        assert_eq!(got.title, "first");
        assert!(got.has_label("urgency:high"));
        assert_eq!(got.bead_type, BeadType::Task);
    }

    #[test]
    fn typed_fields_survive_storage() {
        let db = db();
        let bead = Bead::new("gt-agent-max", "max", BeadType::Agent).with_fields(
            BeadFields::Agent(AgentFields {
                role_type: Some(RoleType::Crew),
                rig: Some("gastown".into()),
                agent_name: Some("max".into()),
                ..Default::default()
            }),
        );
        db.create(&bead).unwrap();
        let got = db.show("gt-agent-max").unwrap();
        let agent = got.fields.as_agent().unwrap();
        assert_eq!(agent.role_type, Some(RoleType::Crew));
        assert_eq!(agent.rig.as_deref(), Some("gastown"));
    }

    #[test]
    fn closed_bead_leaves_open_list_but_remains_visible() {
        let db = db();
        db.create(&Bead::new("gt-1", "t", BeadType::Task)).unwrap();
        db.close("gt-1", Some("done")).unwrap();
        let open = db.list(&ListFilter::open()).unwrap();
        assert!(open.is_empty());
        let shown = db.show("gt-1").unwrap();
        assert_eq!(shown.status, BeadStatus::Closed);
        assert_eq!(shown.close_reason.as_deref(), Some("done"));
        assert!(shown.closed_at.is_some());
    }

    #[test]
    fn ready_excludes_beads_with_open_blockers() {
        let db = db();
        db.create(&Bead::new("gt-a", "a", BeadType::Task)).unwrap();
        db.create(&Bead::new("gt-b", "b", BeadType::Task)).unwrap();
        db.add_dependency("gt-b", "gt-a").unwrap();

        let ready: Vec<_> = db.ready(None).unwrap().into_iter().map(|b| b.id).collect();
        assert_eq!(ready, vec!["gt-a"]);

        db.close("gt-a", None).unwrap();
        let ready: Vec<_> = db.ready(None).unwrap().into_iter().map(|b| b.id).collect();
        assert_eq!(ready, vec!["gt-b"]);
    }

    #[test]
    fn ready_orders_by_priority_then_age() {
        let db = db();
        let old = Utc::now() - Duration::minutes(10);
        let mut urgent = Bead::new("gt-urgent", "u", BeadType::Task).with_priority(0);
        urgent.created_at = Utc::now();
        let mut older = Bead::new("gt-older", "o", BeadType::Task).with_priority(2);
        older.created_at = old;
        let mut newer = Bead::new("gt-newer", "n", BeadType::Task).with_priority(2);
        newer.created_at = Utc::now();
        db.create(&newer).unwrap();
        db.create(&older).unwrap();
        db.create(&urgent).unwrap();

        let ready: Vec<_> = db.ready(None).unwrap().into_iter().map(|b| b.id).collect();
        assert_eq!(ready, vec!["gt-urgent", "gt-older", "gt-newer"]);
    }

    #[test]
    fn direct_cycle_rejected() {
        let db = db();
        db.create(&Bead::new("gt-a", "a", BeadType::Task)).unwrap();
        db.create(&Bead::new("gt-b", "b", BeadType::Task)).unwrap();
        db.add_dependency("gt-b", "gt-a").unwrap();
        let err = db.add_dependency("gt-a", "gt-b").unwrap_err();
        assert!(matches!(err, StoreError::Cycle { .. }));
    }

    #[test]
    fn transitive_cycle_rejected() {
        let db = db();
        for id in ["gt-a", "gt-b", "gt-c"] {
            db.create(&Bead::new(id, id, BeadType::Task)).unwrap();
        }
        db.add_dependency("gt-b", "gt-a").unwrap();
        db.add_dependency("gt-c", "gt-b").unwrap();
        // a depends on c would close the loop a -> c -> b -> a
        let err = db.add_dependency("gt-a", "gt-c").unwrap_err();
        assert!(matches!(err, StoreError::Cycle { .. }));
    }

    #[test]
    fn self_dependency_rejected() {
        let db = db();
        db.create(&Bead::new("gt-a", "a", BeadType::Task)).unwrap();
        assert!(matches!(
            db.add_dependency("gt-a", "gt-a"),
            Err(StoreError::Cycle { .. })
        ));
    }

    #[test]
    fn molecule_with_open_children_refuses_close() {
        let db = db();
        db.create(&Bead::new("gt-mol1", "mol", BeadType::Molecule))
            .unwrap();
        db.create(&Bead::new("gt-step1", "s1", BeadType::Task).with_parent("gt-mol1"))
            .unwrap();
        let err = db.close("gt-mol1", None).unwrap_err();
        assert!(matches!(err, StoreError::OpenChildren { .. }));

        db.close("gt-step1", None).unwrap();
        db.close("gt-mol1", None).unwrap();
    }

    #[test]
    fn list_by_label_only_returns_open_matches() {
        let db = db();
        db.create(&Bead::new("gt-1", "a", BeadType::MergeRequest).with_label("gt:merge-request"))
            .unwrap();
        db.create(&Bead::new("gt-2", "b", BeadType::Task)).unwrap();
        db.create(&Bead::new("gt-3", "c", BeadType::MergeRequest).with_label("gt:merge-request"))
            .unwrap();
        db.close("gt-3", None).unwrap();

        let found: Vec<_> = db
            .list_by_label("gt:merge-request")
            .unwrap()
            .into_iter()
            .map(|b| b.id)
            .collect();
        assert_eq!(found, vec!["gt-1"]);
    }

    #[test]
    fn duplicate_id_is_a_constraint_error() {
        let db = db();
        db.create(&Bead::new("gt-1", "a", BeadType::Task)).unwrap();
        assert!(db.create(&Bead::new("gt-1", "b", BeadType::Task)).is_err());
    }

    #[test]
    fn update_bumps_updated_at_and_persists() {
        let db = db();
        db.create(&Bead::new("gt-1", "a", BeadType::Task)).unwrap();
        let before = db.show("gt-1").unwrap();
        let updated = db
            .update("gt-1", |b| {
                b.assignee = Some("gastown/crew/max".into());
                b.priority = 0;
            })
            .unwrap();
        assert_eq!(updated.assignee.as_deref(), Some("gastown/crew/max"));
        assert_eq!(updated.priority, 0);
        assert!(updated.updated_at >= before.updated_at);
    }

    #[test]
    fn schema_version_mismatch_refuses_to_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("beads.db");
        {
            let db = BeadDb::open(&path).unwrap();
            db.conn
                .execute("UPDATE meta SET value = '999' WHERE key = 'schema_version'", [])
                .unwrap();
        }
        let err = BeadDb::open(&path).unwrap_err();
        assert!(matches!(err, StoreError::Incompatible { .. }));
    }
}
