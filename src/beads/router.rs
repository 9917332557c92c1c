//! Prefix routing across bead databases.
//!
//! The route table is `routes.jsonl`: one JSON object per line mapping a
//! prefix to a database directory. File-backed so new rigs register without
//! reconfiguring running clients; reloaded on demand.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::errors::StoreError;

/// One route-table entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub prefix: String,
    pub path: String,
}

/// The prefix → database map, guarded for concurrent readers.
#[derive(Debug)]
pub struct RouteTable {
    file: PathBuf,
    routes: RwLock<BTreeMap<String, String>>,
}

impl RouteTable {
    /// Load the table from `routes.jsonl`, creating an empty file when
    /// missing. Duplicate prefixes on disk are a fatal corruption.
    pub fn load(file: &Path) -> Result<Self, StoreError> {
        let mut routes = BTreeMap::new();
        if file.exists() {
            let raw = std::fs::read_to_string(file)?;
            for (lineno, line) in raw.lines().enumerate() {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let route: Route =
                    serde_json::from_str(line).map_err(|e| StoreError::CorruptRoutes {
                        path: file.to_path_buf(),
                        detail: format!("line {}: {e}", lineno + 1),
                    })?;
                if routes.insert(route.prefix.clone(), route.path).is_some() {
                    return Err(StoreError::CorruptRoutes {
                        path: file.to_path_buf(),
                        detail: format!("duplicate prefix '{}'", route.prefix),
                    });
                }
            }
        } else {
            if let Some(parent) = file.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::File::create(file)?;
        }
        Ok(Self {
            file: file.to_path_buf(),
            routes: RwLock::new(routes),
        })
    }

    /// Register a prefix. Conflicting prefixes are rejected, matching ones
    /// with an identical path are a no-op.
    pub fn add(&self, prefix: &str, path: &str) -> Result<(), StoreError> {
        let mut routes = self.routes.write().expect("route table lock");
        match routes.get(prefix) {
            Some(existing) if existing == path => return Ok(()),
            Some(_) => {
                return Err(StoreError::DuplicatePrefix {
                    prefix: prefix.to_string(),
                });
            }
            None => {}
        }
        routes.insert(prefix.to_string(), path.to_string());
        self.persist(&routes)
    }

    /// Resolve a prefix to its database directory.
    pub fn resolve(&self, prefix: &str) -> Result<PathBuf, StoreError> {
        let routes = self.routes.read().expect("route table lock");
        routes
            .get(prefix)
            .map(PathBuf::from)
            .ok_or_else(|| StoreError::NoRoute {
                prefix: prefix.to_string(),
            })
    }

    /// All registered routes, prefix-sorted.
    pub fn list(&self) -> Vec<Route> {
        let routes = self.routes.read().expect("route table lock");
        routes
            .iter()
            .map(|(prefix, path)| Route {
                prefix: prefix.clone(),
                path: path.clone(),
            })
            .collect()
    }

    /// Registered prefixes.
    pub fn prefixes(&self) -> Vec<String> {
        let routes = self.routes.read().expect("route table lock");
        routes.keys().cloned().collect()
    }

    fn persist(&self, routes: &BTreeMap<String, String>) -> Result<(), StoreError> {
        let tmp = self.file.with_extension("jsonl.tmp");
        {
            let mut f = std::fs::File::create(&tmp)?;
            for (prefix, path) in routes {
                let line = serde_json::to_string(&Route {
                    prefix: prefix.clone(),
                    path: path.clone(),
                })
                .expect("route serialize");
                writeln!(f, "{line}")?;
            }
            f.flush()?;
        }
        std::fs::rename(&tmp, &self.file)?;
        Ok(())
    }
}
