//! Typed error hierarchy for the Gas Town core.
//!
//! Each subsystem gets its own enum; `GtError` is the boundary type callers
//! see. Every error maps to a stable machine-readable code (`E_*`) and a
//! process exit code, so scripts can branch on failures without parsing
//! prose.

use std::path::PathBuf;
use thiserror::Error;

/// Errors from the issue store and prefix router (C1).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store at {path} is unavailable: {detail}")]
    Unavailable { path: PathBuf, detail: String },

    #[error("Store at {path} has incompatible schema: {detail}")]
    Incompatible { path: PathBuf, detail: String },

    #[error("No route registered for prefix '{prefix}'")]
    NoRoute { prefix: String },

    #[error("Route prefix '{prefix}' is already registered")]
    DuplicatePrefix { prefix: String },

    #[error("Dependency {blocker} -> {blocked} would create a cycle")]
    Cycle { blocker: String, blocked: String },

    #[error("Bead {id} not found")]
    NotFound { id: String },

    #[error("Invalid bead ID '{raw}'")]
    InvalidId { raw: String },

    #[error("Cannot close {id}: molecule has open children")]
    OpenChildren { id: String },

    #[error("Corrupt route table at {path}: {detail}")]
    CorruptRoutes { path: PathBuf, detail: String },

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error("Store I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the mail bus (C2).
#[derive(Debug, Error)]
pub enum MailError {
    #[error("Address '{name}' is ambiguous; use group:/queue:/channel: prefix")]
    Ambiguous { name: String },

    #[error("Unknown address '{addr}'")]
    UnknownAddress { addr: String },

    #[error("Queue '{name}' is closed")]
    QueueClosed { name: String },

    #[error("Channel '{name}' retention misconfigured: both caps are zero")]
    ChannelConfig { name: String },

    #[error("Message {id} was already claimed")]
    AlreadyClaimed { id: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors from the work scheduler (C6).
#[derive(Debug, Error)]
pub enum SchedError {
    #[error("Bead {id} is already hooked")]
    HookBusy { id: String },

    #[error("Agent {agent} has no hooked bead")]
    NothingHooked { agent: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors from the merge queue / refinery (C7).
#[derive(Debug, Error)]
pub enum MergeError {
    #[error("Merge request {id} is already claimed by {worker}")]
    AlreadyClaimed { id: String, worker: String },

    #[error("Merge request {id} is not ready")]
    NotReady { id: String },

    #[error("Merge step '{step}' timed out after {secs}s")]
    Timeout { step: String, secs: u64 },

    #[error("Merge slot for rig '{rig}' is held by {holder}")]
    SlotHeld { rig: String, holder: String },

    #[error(transparent)]
    Git(#[from] git2::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Merge infrastructure error: {0}")]
    Infra(String),
}

/// Errors from the agent runner (C4).
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("Failed to spawn session for agent {agent}: {detail}")]
    SpawnFailed { agent: String, detail: String },

    #[error("No session found for agent {agent}")]
    SessionMissing { agent: String },

    #[error("Workspace error at {path}: {source}")]
    Workspace {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Sidecar request failed: {0}")]
    Sidecar(#[from] reqwest::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors from the decision gate (C8).
#[derive(Debug, Error)]
pub enum DecisionError {
    #[error("Decision {id} is not pending")]
    NotPending { id: String },

    #[error("Option index {index} out of range (1..={max})")]
    BadOption { index: u32, max: u32 },

    #[error("Decision context mentions failures but no option files a bug")]
    MissingFileOption,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors from the daemon surface (C9).
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("Forbidden: bad or missing daemon token")]
    Forbidden,

    #[error("Malformed request envelope: {0}")]
    BadEnvelope(String),

    #[error("Unknown op '{op}'")]
    UnknownOp { op: String },

    #[error("Daemon already running (pidfile {path} is locked)")]
    AlreadyRunning { path: PathBuf },

    #[error("Daemon I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Boundary error type: every subsystem error converges here before it
/// reaches a caller or the CLI.
#[derive(Debug, Error)]
pub enum GtError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Mail(#[from] MailError),
    #[error(transparent)]
    Sched(#[from] SchedError),
    #[error(transparent)]
    Merge(#[from] MergeError),
    #[error(transparent)]
    Runner(#[from] RunnerError),
    #[error(transparent)]
    Decision(#[from] DecisionError),
    #[error(transparent)]
    Daemon(#[from] DaemonError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl GtError {
    /// Stable machine-readable code for scripts.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Store(e) => match e {
                StoreError::Unavailable { .. } => "E_STORE_UNAVAILABLE",
                StoreError::Incompatible { .. } => "E_STORE_INCOMPATIBLE",
                StoreError::NoRoute { .. } => "E_NO_ROUTE",
                StoreError::DuplicatePrefix { .. } => "E_PREFIX_CONFLICT",
                StoreError::Cycle { .. } => "E_CYCLE",
                StoreError::NotFound { .. } => "E_NOT_FOUND",
                StoreError::InvalidId { .. } => "E_BAD_ID",
                StoreError::OpenChildren { .. } => "E_OPEN_CHILDREN",
                StoreError::CorruptRoutes { .. } => "E_ROUTES_CORRUPT",
                StoreError::Sqlite(_) | StoreError::Io(_) => "E_STORE_IO",
            },
            Self::Mail(e) => match e {
                MailError::Ambiguous { .. } => "E_ADDR_AMBIGUOUS",
                MailError::UnknownAddress { .. } => "E_ADDR_UNKNOWN",
                MailError::QueueClosed { .. } => "E_QUEUE_CLOSED",
                MailError::ChannelConfig { .. } => "E_CHANNEL_CONFIG",
                MailError::AlreadyClaimed { .. } => "E_MSG_CLAIMED",
                MailError::Store(_) => "E_STORE_IO",
            },
            Self::Sched(e) => match e {
                SchedError::HookBusy { .. } => "E_HOOK_BUSY",
                SchedError::NothingHooked { .. } => "E_NOT_HOOKED",
                SchedError::Store(_) => "E_STORE_IO",
            },
            Self::Merge(e) => match e {
                MergeError::AlreadyClaimed { .. } => "E_MR_CLAIMED",
                MergeError::NotReady { .. } => "E_MR_NOT_READY",
                MergeError::Timeout { .. } => "E_MERGE_TIMEOUT",
                MergeError::SlotHeld { .. } => "E_SLOT_HELD",
                MergeError::Git(_) => "E_GIT",
                MergeError::Store(_) => "E_STORE_IO",
                MergeError::Infra(_) => "E_MERGE_INFRA",
            },
            Self::Runner(e) => match e {
                RunnerError::SpawnFailed { .. } => "E_SPAWN",
                RunnerError::SessionMissing { .. } => "E_SESSION_MISSING",
                RunnerError::Workspace { .. } => "E_WORKSPACE",
                RunnerError::Sidecar(_) => "E_SIDECAR",
                RunnerError::Store(_) => "E_STORE_IO",
            },
            Self::Decision(e) => match e {
                DecisionError::NotPending { .. } => "E_DECISION_NOT_PENDING",
                DecisionError::BadOption { .. } => "E_DECISION_BAD_OPTION",
                DecisionError::MissingFileOption => "E_DECISION_MISSING_FILE_OPTION",
                DecisionError::Store(_) => "E_STORE_IO",
            },
            Self::Daemon(e) => match e {
                DaemonError::Forbidden => "E_FORBIDDEN",
                DaemonError::BadEnvelope(_) => "E_BAD_ENVELOPE",
                DaemonError::UnknownOp { .. } => "E_UNKNOWN_OP",
                DaemonError::AlreadyRunning { .. } => "E_DAEMON_RUNNING",
                DaemonError::Io(_) => "E_DAEMON_IO",
            },
            Self::Other(_) => "E_GENERAL",
        }
    }

    /// Process exit code per the CLI contract: 0 ok, 1 general, 2 usage,
    /// 3 not found, 4 conflict/state, 5 forbidden, 6 timeout, 7 external
    /// dependency, 10 partial success, 20 no-op.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Store(e) => match e {
                StoreError::NoRoute { .. } | StoreError::NotFound { .. } => 3,
                StoreError::InvalidId { .. } => 2,
                StoreError::DuplicatePrefix { .. }
                | StoreError::Cycle { .. }
                | StoreError::OpenChildren { .. } => 4,
                StoreError::Unavailable { .. } | StoreError::Sqlite(_) | StoreError::Io(_) => 7,
                StoreError::Incompatible { .. } | StoreError::CorruptRoutes { .. } => 1,
            },
            Self::Mail(e) => match e {
                MailError::Ambiguous { .. } => 2,
                MailError::UnknownAddress { .. } => 3,
                MailError::QueueClosed { .. }
                | MailError::ChannelConfig { .. }
                | MailError::AlreadyClaimed { .. } => 4,
                MailError::Store(_) => 7,
            },
            Self::Sched(e) => match e {
                SchedError::HookBusy { .. } => 4,
                SchedError::NothingHooked { .. } => 20,
                SchedError::Store(_) => 7,
            },
            Self::Merge(e) => match e {
                MergeError::AlreadyClaimed { .. }
                | MergeError::NotReady { .. }
                | MergeError::SlotHeld { .. } => 4,
                MergeError::Timeout { .. } => 6,
                MergeError::Git(_) | MergeError::Infra(_) | MergeError::Store(_) => 7,
            },
            Self::Runner(e) => match e {
                RunnerError::SessionMissing { .. } => 3,
                _ => 7,
            },
            Self::Decision(e) => match e {
                DecisionError::NotPending { .. } => 4,
                DecisionError::BadOption { .. } | DecisionError::MissingFileOption => 2,
                DecisionError::Store(_) => 7,
            },
            Self::Daemon(e) => match e {
                DaemonError::Forbidden => 5,
                DaemonError::BadEnvelope(_) | DaemonError::UnknownOp { .. } => 2,
                DaemonError::AlreadyRunning { .. } => 4,
                DaemonError::Io(_) => 7,
            },
            Self::Other(_) => 1,
        }
    }

    /// Optional recovery hints surfaced alongside the error.
    pub fn hints(&self) -> Vec<String> {
        match self {
            Self::Store(StoreError::NoRoute { prefix }) => vec![format!(
                "register the prefix with: gt routes add {prefix} <path>"
            )],
            Self::Mail(MailError::Ambiguous { name }) => vec![format!(
                "try group:{name}, queue:{name}, or channel:{name}"
            )],
            Self::Daemon(DaemonError::Forbidden) => {
                vec!["set GT_DAEMON_TOKEN to the town's daemon token".to_string()]
            }
            _ => Vec::new(),
        }
    }
}

/// Convenience alias used across the crate.
pub type Result<T, E = GtError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_cycle_maps_to_conflict_exit() {
        let err = GtError::from(StoreError::Cycle {
            blocker: "gt-a".into(),
            blocked: "gt-b".into(),
        });
        assert_eq!(err.code(), "E_CYCLE");
        assert_eq!(err.exit_code(), 4);
    }

    #[test]
    fn no_route_carries_hint() {
        let err = GtError::from(StoreError::NoRoute { prefix: "zz".into() });
        assert_eq!(err.code(), "E_NO_ROUTE");
        assert_eq!(err.exit_code(), 3);
        assert!(err.hints()[0].contains("gt routes add zz"));
    }

    #[test]
    fn ambiguous_address_is_usage_error() {
        let err = GtError::from(MailError::Ambiguous { name: "alerts".into() });
        assert_eq!(err.code(), "E_ADDR_AMBIGUOUS");
        assert_eq!(err.exit_code(), 2);
        assert!(err.hints()[0].contains("channel:alerts"));
    }

    #[test]
    fn hook_busy_is_state_conflict() {
        let err = GtError::from(SchedError::HookBusy { id: "gt-1".into() });
        assert_eq!(err.code(), "E_HOOK_BUSY");
        assert_eq!(err.exit_code(), 4);
    }

    #[test]
    fn unhook_without_hook_is_noop_exit() {
        let err = GtError::from(SchedError::NothingHooked { agent: "gt-crew".into() });
        assert_eq!(err.exit_code(), 20);
    }

    #[test]
    fn forbidden_maps_to_exit_five() {
        let err = GtError::from(DaemonError::Forbidden);
        assert_eq!(err.exit_code(), 5);
    }

    #[test]
    fn merge_timeout_maps_to_timeout_exit() {
        let err = GtError::from(MergeError::Timeout {
            step: "rebase".into(),
            secs: 600,
        });
        assert_eq!(err.code(), "E_MERGE_TIMEOUT");
        assert_eq!(err.exit_code(), 6);
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&StoreError::NotFound { id: "x".into() });
        assert_std_error(&MailError::QueueClosed { name: "build".into() });
        assert_std_error(&MergeError::Infra("network".into()));
        assert_std_error(&DecisionError::MissingFileOption);
    }
}
