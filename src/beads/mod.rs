//! Issue store & router (the town's single shared persistent state).
//!
//! `Beads` fronts every routed database behind one handle: IDs select their
//! database by prefix, writes are serialized per database, and every
//! mutation emits a change event consumed by the daemon stream and the
//! control loop.

pub mod db;
pub mod id;
pub mod router;
pub mod types;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::errors::StoreError;
pub use db::{BeadDb, ListFilter};
pub use id::BeadId;
pub use router::{Route, RouteTable};
pub use types::*;

/// What happened to a bead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Updated,
    Closed,
}

/// Change event broadcast on every store mutation. `subject` is the bead's
/// prefix so subscribers can filter per rig.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub subject: String,
    pub kind: ChangeKind,
    pub bead_id: String,
    pub bead_type: BeadType,
    pub at: DateTime<Utc>,
}

const EVENT_CAPACITY: usize = 1024;

/// Multi-database store façade.
pub struct Beads {
    routes: RouteTable,
    handles: DashMap<String, Arc<Mutex<BeadDb>>>,
    events: broadcast::Sender<ChangeEvent>,
}

impl Beads {
    /// Open the store over a route table file.
    pub fn open(routes_file: &Path) -> Result<Self, StoreError> {
        let routes = RouteTable::load(routes_file)?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            routes,
            handles: DashMap::new(),
            events,
        })
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    /// Subscribe to change events.
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.events.subscribe()
    }

    /// Run a closure against the database owning `prefix`.
    pub fn with_db<T>(
        &self,
        prefix: &str,
        f: impl FnOnce(&BeadDb) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let handle = self.handle(prefix)?;
        let guard: MutexGuard<'_, BeadDb> = handle.lock().map_err(|_| StoreError::Unavailable {
            path: PathBuf::from(prefix),
            detail: "store lock poisoned".into(),
        })?;
        f(&guard)
    }

    fn handle(&self, prefix: &str) -> Result<Arc<Mutex<BeadDb>>, StoreError> {
        if let Some(handle) = self.handles.get(prefix) {
            return Ok(handle.clone());
        }
        let dir = self.routes.resolve(prefix)?;
        let dir = follow_redirect(&dir)?;
        let db = BeadDb::open(&dir.join("beads.db"))?;
        let handle = Arc::new(Mutex::new(db));
        self.handles.insert(prefix.to_string(), handle.clone());
        Ok(handle)
    }

    fn emit(&self, kind: ChangeKind, bead: &Bead) {
        let prefix = bead.id.split('-').next().unwrap_or_default().to_string();
        // No subscribers is fine; the send result only reports that.
        let _ = self.events.send(ChangeEvent {
            subject: prefix,
            kind,
            bead_id: bead.id.clone(),
            bead_type: bead.bead_type,
            at: Utc::now(),
        });
    }

    // ── C1 operations ─────────────────────────────────────────────────

    /// Create a bead in the database its prefix routes to.
    pub fn create(&self, bead: &Bead) -> Result<Bead, StoreError> {
        let id = BeadId::parse(&bead.id)?;
        self.with_db(id.prefix(), |db| db.create(bead))?;
        self.emit(ChangeKind::Created, bead);
        Ok(bead.clone())
    }

    /// Fetch a bead by ID; closed beads stay visible.
    pub fn show(&self, id: &str) -> Result<Bead, StoreError> {
        let parsed = BeadId::parse(id)?;
        self.with_db(parsed.prefix(), |db| db.show(id))
    }

    /// Fetch a bead if it exists.
    pub fn get(&self, id: &str) -> Result<Option<Bead>, StoreError> {
        let parsed = BeadId::parse(id)?;
        self.with_db(parsed.prefix(), |db| db.get(id))
    }

    /// Read-modify-write a bead and broadcast the update.
    pub fn update<F>(&self, id: &str, mutate: F) -> Result<Bead, StoreError>
    where
        F: FnOnce(&mut Bead),
    {
        let parsed = BeadId::parse(id)?;
        let bead = self.with_db(parsed.prefix(), |db| db.update(id, mutate))?;
        self.emit(ChangeKind::Updated, &bead);
        Ok(bead)
    }

    /// Close a bead and broadcast the close.
    pub fn close(&self, id: &str, reason: Option<&str>) -> Result<Bead, StoreError> {
        let parsed = BeadId::parse(id)?;
        let bead = self.with_db(parsed.prefix(), |db| db.close(id, reason))?;
        self.emit(ChangeKind::Closed, &bead);
        Ok(bead)
    }

    /// List beads in one database.
    pub fn list(&self, prefix: &str, filter: &ListFilter) -> Result<Vec<Bead>, StoreError> {
        self.with_db(prefix, |db| db.list(filter))
    }

    /// List matching beads across every routed database.
    pub fn list_all(&self, filter: &ListFilter) -> Result<Vec<Bead>, StoreError> {
        let mut out = Vec::new();
        for prefix in self.routes.prefixes() {
            out.extend(self.with_db(&prefix, |db| db.list(filter))?);
        }
        Ok(out)
    }

    /// Ready set for one database, optionally scoped to a parent bead.
    ///
    /// Unlike the single-database query, blockers are resolved through the
    /// router so cross-database edges (textual references) still gate
    /// readiness. A blocker that resolves nowhere no longer blocks.
    pub fn ready(&self, prefix: &str, parent: Option<&str>) -> Result<Vec<Bead>, StoreError> {
        let mut filter = ListFilter::open();
        if let Some(p) = parent {
            filter = filter.with_parent(p);
        }
        let open = self.with_db(prefix, |db| db.list(&filter))?;
        let mut ready = Vec::new();
        for bead in open {
            let mut blocked = false;
            for blocker in &bead.blocked_by {
                if let Ok(Some(b)) = self.get(blocker)
                    && b.status != BeadStatus::Closed
                {
                    blocked = true;
                    break;
                }
            }
            if !blocked {
                ready.push(bead);
            }
        }
        Ok(ready)
    }

    /// Declare `blocked` blocked_by `blocker`. Both IDs must share a
    /// database; cross-database references stay textual.
    pub fn add_dependency(&self, blocked: &str, blocker: &str) -> Result<(), StoreError> {
        let parsed = BeadId::parse(blocked)?;
        self.with_db(parsed.prefix(), |db| db.add_dependency(blocked, blocker))?;
        if let Ok(bead) = self.show(blocked) {
            self.emit(ChangeKind::Updated, &bead);
        }
        Ok(())
    }

    pub fn remove_dependency(&self, blocked: &str, blocker: &str) -> Result<(), StoreError> {
        let parsed = BeadId::parse(blocked)?;
        self.with_db(parsed.prefix(), |db| db.remove_dependency(blocked, blocker))
    }

    /// Open beads carrying a label in one database.
    pub fn list_by_label(&self, prefix: &str, label: &str) -> Result<Vec<Bead>, StoreError> {
        self.with_db(prefix, |db| db.list_by_label(label))
    }
}

/// A `.beads` directory may be a redirect file pointing at the canonical
/// location (first non-empty line is the target path).
fn follow_redirect(dir: &Path) -> Result<PathBuf, StoreError> {
    let marker = dir.join("redirect");
    if !marker.is_file() {
        return Ok(dir.to_path_buf());
    }
    let raw = std::fs::read_to_string(&marker)?;
    let target = raw.lines().find(|l| !l.trim().is_empty()).map(str::trim);
    match target {
        Some(path) => Ok(PathBuf::from(path)),
        None => Err(StoreError::CorruptRoutes {
            path: marker,
            detail: "empty redirect file".into(),
        }),
    }
}
