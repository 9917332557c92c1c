//! Local execution backend: supervised tmux sessions.
//!
//! Every local agent runs inside a detached tmux session with a
//! deterministic name, started from the workspace's bootstrap script. The
//! control loop talks to sessions only through this backend.

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::errors::RunnerError;
use crate::runner::{AgentSpec, ExecBackend, RuntimeInfo};

pub struct TmuxBackend {
    tmux_cmd: String,
}

impl TmuxBackend {
    pub fn new() -> Self {
        Self {
            tmux_cmd: std::env::var("GT_TMUX_CMD").unwrap_or_else(|_| "tmux".to_string()),
        }
    }
}

impl Default for TmuxBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn start_args(spec: &AgentSpec) -> Vec<String> {
    vec![
        "new-session".into(),
        "-d".into(),
        "-s".into(),
        spec.session_name(),
        "-c".into(),
        spec.workspace.display().to_string(),
        "./start.sh".into(),
    ]
}

fn observe_args(spec: &AgentSpec, lines: u32) -> Vec<String> {
    vec![
        "capture-pane".into(),
        "-p".into(),
        "-t".into(),
        spec.session_name(),
        "-S".into(),
        format!("-{lines}"),
    ]
}

#[async_trait]
impl ExecBackend for TmuxBackend {
    async fn start(&self, spec: &AgentSpec) -> Result<RuntimeInfo, RunnerError> {
        let output = Command::new(&self.tmux_cmd)
            .args(start_args(spec))
            .output()
            .await
            .map_err(|e| RunnerError::SpawnFailed {
                agent: spec.bead_id.clone(),
                detail: e.to_string(),
            })?;
        if !output.status.success() {
            return Err(RunnerError::SpawnFailed {
                agent: spec.bead_id.clone(),
                detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        debug!(session = %spec.session_name(), "tmux session started");
        Ok(RuntimeInfo {
            session_name: Some(spec.session_name()),
            pod_name: None,
            pod_ip: None,
        })
    }

    /// Idempotent: a missing session is already stopped.
    async fn stop(&self, spec: &AgentSpec) -> Result<(), RunnerError> {
        let _ = Command::new(&self.tmux_cmd)
            .args(["kill-session", "-t", &spec.session_name()])
            .output()
            .await
            .map_err(|e| RunnerError::SpawnFailed {
                agent: spec.bead_id.clone(),
                detail: e.to_string(),
            })?;
        Ok(())
    }

    async fn is_alive(&self, spec: &AgentSpec) -> Result<bool, RunnerError> {
        let status = Command::new(&self.tmux_cmd)
            .args(["has-session", "-t", &spec.session_name()])
            .output()
            .await
            .map_err(|e| RunnerError::SpawnFailed {
                agent: spec.bead_id.clone(),
                detail: e.to_string(),
            })?;
        Ok(status.status.success())
    }

    async fn observe(&self, spec: &AgentSpec, lines: u32) -> Result<String, RunnerError> {
        let output = Command::new(&self.tmux_cmd)
            .args(observe_args(spec, lines))
            .output()
            .await
            .map_err(|e| RunnerError::SpawnFailed {
                agent: spec.bead_id.clone(),
                detail: e.to_string(),
            })?;
        if !output.status.success() {
            return Err(RunnerError::SessionMissing {
                agent: spec.bead_id.clone(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    async fn send_input(&self, spec: &AgentSpec, text: &str) -> Result<(), RunnerError> {
        let output = Command::new(&self.tmux_cmd)
            .args(["send-keys", "-t", &spec.session_name(), text, "Enter"])
            .output()
            .await
            .map_err(|e| RunnerError::SpawnFailed {
                agent: spec.bead_id.clone(),
                detail: e.to_string(),
            })?;
        if !output.status.success() {
            return Err(RunnerError::SessionMissing {
                agent: spec.bead_id.clone(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::beads::types::{ExecutionTarget, RoleType};
    use std::path::PathBuf;

    fn spec() -> AgentSpec {
        AgentSpec {
            bead_id: "gt-agent-nux".into(),
            rig: "gastown".into(),
            role: RoleType::Polecat,
            name: "nux".into(),
            execution_target: ExecutionTarget::Local,
            workspace: PathBuf::from("/town/gastown/polecats/nux"),
        }
    }

    #[test]
    fn start_args_use_deterministic_session_and_workspace() {
        let args = start_args(&spec());
        assert_eq!(args[3], "gt-gastown-polecat-nux");
        assert!(args.contains(&"/town/gastown/polecats/nux".to_string()));
        assert_eq!(args.last().unwrap(), "./start.sh");
    }

    #[test]
    fn observe_args_bound_scrollback() {
        let args = observe_args(&spec(), 50);
        assert_eq!(args.last().unwrap(), "-50");
        assert!(args.contains(&"gt-gastown-polecat-nux".to_string()));
    }
}
