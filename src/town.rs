//! Town root layout, identity, rig registry, and tunables.
//!
//! A town is a directory tree:
//!
//! ```text
//! <root>/
//!   mayor/town.json       town identity
//!   mayor/rigs.json       rig registry
//!   mayor/routes.jsonl    prefix route table
//!   .beads/               town-level bead database (prefix `hq`)
//!   .gastown/             daemon runtime state (token, pidfile, logs)
//!   <rig>/.beads/         rig-level database
//!   <rig>/<role>/...      per-role workspaces
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::beads::{Beads, id::random_base36};

/// Town-level database prefix.
pub const TOWN_PREFIX: &str = "hq";

/// Merge strategy selectable per rig.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum MergeStrategy {
    /// Rebase the source onto the target, test, fast-forward. The default.
    #[default]
    RebaseFf,
    /// Legacy squash-merge path.
    Squash,
}

impl MergeStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RebaseFf => "rebase-ff",
            Self::Squash => "squash",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "rebase-ff" => Some(Self::RebaseFf),
            "squash" => Some(Self::Squash),
            _ => None,
        }
    }
}

/// Town identity persisted at `mayor/town.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TownIdentity {
    pub name: String,
    pub town_id: String,
    pub created_at: DateTime<Utc>,
}

/// One registered rig in `mayor/rigs.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RigConfig {
    pub repo_url: String,
    pub prefix: String,
    #[serde(default = "default_branch")]
    pub default_branch: String,
    #[serde(default)]
    pub merge_strategy: MergeStrategy,
    /// Opt-in semantic conflict arbitration.
    #[serde(default)]
    pub semantic_merge: bool,
    /// Test command the refinery runs on rebased branches.
    pub test_command: Option<String>,
}

fn default_branch() -> String {
    "main".to_string()
}

/// Operational tunables, loaded from `.gastown/town.toml` when present.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Tunables {
    pub reconcile_interval_secs: u64,
    pub stale_timeout_secs: u64,
    /// Consecutive stale detections before a stuck agent is declared dead.
    pub dead_grace: u32,
    pub backoff_base_secs: u64,
    pub backoff_cap_secs: u64,
    /// Consecutive start failures before a blocker bead is raised.
    pub escalate_after_failures: u32,
    pub decision_auto_close_secs: u64,
    pub decision_timeout_secs: u64,
    pub merge_step_timeout_secs: u64,
    pub test_timeout_secs: u64,
    pub semantic_timeout_secs: u64,
    /// Durable replay window for late stream subscribers.
    pub event_replay: usize,
    /// Per-subscriber buffered events before the subscription is closed.
    pub subscriber_buffer: usize,
    pub http_port: u16,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            reconcile_interval_secs: 60,
            stale_timeout_secs: 900,
            dead_grace: 3,
            backoff_base_secs: 30,
            backoff_cap_secs: 900,
            escalate_after_failures: 4,
            decision_auto_close_secs: 600,
            decision_timeout_secs: 3600,
            merge_step_timeout_secs: 600,
            test_timeout_secs: 1800,
            semantic_timeout_secs: 1800,
            event_replay: 256,
            subscriber_buffer: 64,
            http_port: 4511,
        }
    }
}

/// Filesystem layout helpers for a town root.
#[derive(Debug, Clone)]
pub struct TownPaths {
    root: PathBuf,
}

impl TownPaths {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn mayor_dir(&self) -> PathBuf {
        self.root.join("mayor")
    }

    pub fn town_json(&self) -> PathBuf {
        self.mayor_dir().join("town.json")
    }

    pub fn rigs_json(&self) -> PathBuf {
        self.mayor_dir().join("rigs.json")
    }

    pub fn routes_file(&self) -> PathBuf {
        self.mayor_dir().join("routes.jsonl")
    }

    pub fn town_beads_dir(&self) -> PathBuf {
        self.root.join(".beads")
    }

    pub fn runtime_dir(&self) -> PathBuf {
        self.root.join(".gastown")
    }

    pub fn token_file(&self) -> PathBuf {
        self.runtime_dir().join("daemon.token")
    }

    pub fn pidfile(&self) -> PathBuf {
        self.runtime_dir().join("daemon.pid")
    }

    pub fn socket_path(&self) -> PathBuf {
        self.runtime_dir().join("daemon.sock")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.runtime_dir().join("logs")
    }

    pub fn tunables_file(&self) -> PathBuf {
        self.runtime_dir().join("town.toml")
    }

    pub fn rig_dir(&self, rig: &str) -> PathBuf {
        self.root.join(rig)
    }

    pub fn rig_beads_dir(&self, rig: &str) -> PathBuf {
        self.rig_dir(rig).join(".beads")
    }

    pub fn rig_checkout(&self, rig: &str) -> PathBuf {
        self.rig_dir(rig).join("rig")
    }

    /// Workspace directory for an agent of a role.
    pub fn role_dir(&self, rig: &str, role: &str, name: Option<&str>) -> PathBuf {
        let base = self.rig_dir(rig);
        match (role, name) {
            ("crew", Some(n)) => base.join("crew").join(n),
            ("polecat", Some(n)) => base.join("polecats").join(n),
            ("dog", Some(n)) => base.join("dogs").join(n),
            ("mayor", _) => self.mayor_dir().join("rig"),
            ("refinery", _) => base.join("refinery").join("rig"),
            ("witness", _) => base.join("witness"),
            (other, Some(n)) => base.join(other).join(n),
            (other, None) => base.join(other),
        }
    }
}

/// An opened town: identity, rigs, tunables, and the bead store.
pub struct Town {
    pub paths: TownPaths,
    pub identity: TownIdentity,
    pub rigs: BTreeMap<String, RigConfig>,
    pub tunables: Tunables,
    pub beads: Beads,
}

impl Town {
    /// Create a new town root: mayor/ metadata, the `hq` database, the
    /// route table, and a fresh daemon token.
    pub fn init(root: &Path, name: &str) -> Result<Self> {
        let paths = TownPaths::new(root);
        std::fs::create_dir_all(paths.mayor_dir()).context("creating mayor/")?;
        std::fs::create_dir_all(paths.town_beads_dir()).context("creating .beads/")?;
        std::fs::create_dir_all(paths.log_dir()).context("creating .gastown/logs/")?;

        let identity = TownIdentity {
            name: name.to_string(),
            town_id: format!("town-{}", random_base36(8)),
            created_at: Utc::now(),
        };
        write_json(&paths.town_json(), &identity)?;
        write_json(&paths.rigs_json(), &BTreeMap::<String, RigConfig>::new())?;

        let token_path = paths.token_file();
        if !token_path.exists() {
            std::fs::write(&token_path, random_base36(32)).context("writing daemon token")?;
        }

        let beads = Beads::open(&paths.routes_file())?;
        beads.routes().add(
            TOWN_PREFIX,
            paths
                .town_beads_dir()
                .to_str()
                .context("town root is not valid UTF-8")?,
        )?;

        Ok(Self {
            paths,
            identity,
            rigs: BTreeMap::new(),
            tunables: Tunables::default(),
            beads,
        })
    }

    /// Open an existing town root.
    pub fn open(root: &Path) -> Result<Self> {
        let paths = TownPaths::new(root);
        let identity: TownIdentity = read_json(&paths.town_json())
            .with_context(|| format!("not a town root: {}", root.display()))?;
        let rigs: BTreeMap<String, RigConfig> = read_json(&paths.rigs_json())?;
        let tunables = match std::fs::read_to_string(paths.tunables_file()) {
            Ok(raw) => toml::from_str(&raw).context("parsing town.toml")?,
            Err(_) => Tunables::default(),
        };
        let beads = Beads::open(&paths.routes_file())?;
        Ok(Self {
            paths,
            identity,
            rigs,
            tunables,
            beads,
        })
    }

    /// Discover the town root: explicit flag, `GT_TOWN_ROOT`, or the
    /// default under the home directory.
    pub fn discover_root(explicit: Option<&Path>) -> PathBuf {
        if let Some(p) = explicit {
            return p.to_path_buf();
        }
        if let Ok(env) = std::env::var("GT_TOWN_ROOT") {
            return PathBuf::from(env);
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("gt")
    }

    /// Register a rig: rigs.json entry, its database, its route, and the
    /// per-role directory skeleton.
    pub fn add_rig(&mut self, name: &str, repo_url: &str, cfg: RigConfig) -> Result<()> {
        anyhow::ensure!(
            !self.rigs.contains_key(name),
            "rig '{name}' is already registered"
        );
        let beads_dir = self.paths.rig_beads_dir(name);
        std::fs::create_dir_all(&beads_dir)?;
        for role in ["witness", "refinery", "crew", "polecats"] {
            std::fs::create_dir_all(self.paths.rig_dir(name).join(role))?;
        }
        self.beads.routes().add(
            &cfg.prefix,
            beads_dir.to_str().context("rig path is not valid UTF-8")?,
        )?;
        let mut cfg = cfg;
        cfg.repo_url = repo_url.to_string();
        self.rigs.insert(name.to_string(), cfg);
        write_json(&self.paths.rigs_json(), &self.rigs)?;
        Ok(())
    }

    pub fn rig(&self, name: &str) -> Result<&RigConfig> {
        self.rigs
            .get(name)
            .with_context(|| format!("unknown rig '{name}'"))
    }

    /// The shared daemon token; created at init, readable by agents via
    /// their identity environment.
    pub fn daemon_token(&self) -> Result<String> {
        let raw = std::fs::read_to_string(self.paths.token_file())
            .context("daemon token missing; re-run gt init")?;
        Ok(raw.trim().to_string())
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    std::fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let raw =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}
