//! Agent registry & runner: the only component that touches agent
//! processes and workspaces.
//!
//! Given an agent bead, the runner provisions the workspace, starts the
//! execution context (local tmux session or cluster pod), writes the
//! discovery metadata back onto the bead, and answers health questions for
//! the control loop.

pub mod local;
pub mod remote;
pub mod workspace;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::info;

use crate::beads::types::{AgentState, ExecutionTarget, RoleType};
use crate::beads::{Bead, Beads};
use crate::errors::RunnerError;
use crate::town::TownPaths;

pub use workspace::Identity;

/// Everything needed to start or find an agent's process, derived from its
/// bead.
#[derive(Debug, Clone)]
pub struct AgentSpec {
    pub bead_id: String,
    pub rig: String,
    pub role: RoleType,
    pub name: String,
    pub execution_target: ExecutionTarget,
    pub workspace: PathBuf,
}

impl AgentSpec {
    /// Build a spec from an agent bead; incomplete agent fields are a
    /// spawn-time error, not a panic.
    pub fn from_bead(bead: &Bead, paths: &TownPaths) -> Result<Self, RunnerError> {
        let fields = bead
            .fields
            .as_agent()
            .ok_or_else(|| RunnerError::SpawnFailed {
                agent: bead.id.clone(),
                detail: "bead has no agent fields".into(),
            })?;
        let role = fields.role_type.ok_or_else(|| RunnerError::SpawnFailed {
            agent: bead.id.clone(),
            detail: "agent bead has no role".into(),
        })?;
        let rig = fields.rig.clone().ok_or_else(|| RunnerError::SpawnFailed {
            agent: bead.id.clone(),
            detail: "agent bead has no rig".into(),
        })?;
        let name = fields
            .agent_name
            .clone()
            .ok_or_else(|| RunnerError::SpawnFailed {
                agent: bead.id.clone(),
                detail: "agent bead has no name".into(),
            })?;
        let workspace = paths.role_dir(&rig, role.as_str(), Some(&name));
        Ok(Self {
            bead_id: bead.id.clone(),
            rig,
            role,
            name,
            execution_target: fields.execution_target,
            workspace,
        })
    }

    /// Deterministic session name: `gt-<rig>-<role>-<name>`.
    pub fn session_name(&self) -> String {
        format!("gt-{}-{}-{}", self.rig, self.role.as_str(), self.name)
    }
}

/// Discovery metadata reported by a backend after start.
#[derive(Debug, Clone, Default)]
pub struct RuntimeInfo {
    pub session_name: Option<String>,
    pub pod_name: Option<String>,
    pub pod_ip: Option<String>,
}

/// The closed set of execution contexts. The control loop only ever calls
/// through this trait.
#[async_trait]
pub trait ExecBackend: Send + Sync {
    async fn start(&self, spec: &AgentSpec) -> Result<RuntimeInfo, RunnerError>;
    async fn stop(&self, spec: &AgentSpec) -> Result<(), RunnerError>;
    async fn is_alive(&self, spec: &AgentSpec) -> Result<bool, RunnerError>;
    /// Most recent rendered screen, bounded to `lines`.
    async fn observe(&self, spec: &AgentSpec, lines: u32) -> Result<String, RunnerError>;
    async fn send_input(&self, spec: &AgentSpec, text: &str) -> Result<(), RunnerError>;
}

/// Registry over the two backends plus workspace ownership.
pub struct Runner {
    beads: Arc<Beads>,
    paths: TownPaths,
    identity: Identity,
    local: Arc<dyn ExecBackend>,
    remote: Arc<dyn ExecBackend>,
}

impl Runner {
    pub fn new(beads: Arc<Beads>, paths: TownPaths, identity: Identity) -> Self {
        let sidecar_url = std::env::var("GT_SIDECAR_URL")
            .unwrap_or_else(|_| "http://localhost:8088".to_string());
        Self {
            beads,
            paths,
            identity,
            local: Arc::new(local::TmuxBackend::new()),
            remote: Arc::new(remote::SidecarBackend::new(&sidecar_url)),
        }
    }

    /// Swap backends; used by the control loop's tests and by embedders.
    pub fn with_backends(
        mut self,
        local: Arc<dyn ExecBackend>,
        remote: Arc<dyn ExecBackend>,
    ) -> Self {
        self.local = local;
        self.remote = remote;
        self
    }

    fn backend_for(&self, target: ExecutionTarget) -> &Arc<dyn ExecBackend> {
        match target {
            ExecutionTarget::Local => &self.local,
            ExecutionTarget::K8s => &self.remote,
        }
    }

    pub fn spec(&self, bead_id: &str) -> Result<AgentSpec, RunnerError> {
        let bead = self.beads.show(bead_id)?;
        AgentSpec::from_bead(&bead, &self.paths)
    }

    /// Provision the workspace, start the process, and register discovery
    /// metadata back into the bead (`spawning -> working`).
    pub async fn start(&self, bead_id: &str) -> Result<RuntimeInfo, RunnerError> {
        let spec = self.spec(bead_id)?;
        workspace::provision(&spec, &self.identity)?;
        let started = self
            .backend_for(spec.execution_target)
            .start(&spec)
            .await;
        let info = match started {
            Ok(info) => info,
            Err(e) => {
                // A failed spawn must not leave half a workspace behind.
                let _ = workspace::teardown(&spec);
                return Err(e);
            }
        };
        let reported = info.clone();
        self.beads.update(bead_id, |b| {
            if let Some(f) = b.fields.as_agent_mut() {
                f.session_name = reported.session_name.clone();
                f.pod_name = reported.pod_name.clone();
                f.pod_ip = reported.pod_ip.clone();
                f.agent_state = AgentState::Working;
                f.last_activity = Some(Utc::now());
            }
        })?;
        info!(agent = bead_id, "agent started");
        Ok(info)
    }

    /// Stop the process and tear down ephemeral workspace state.
    /// Idempotent: stopping a stopped agent succeeds.
    pub async fn stop(&self, bead_id: &str) -> Result<(), RunnerError> {
        let spec = self.spec(bead_id)?;
        self.backend_for(spec.execution_target).stop(&spec).await?;
        workspace::teardown(&spec)?;
        if let Ok(Some(_)) = self.beads.get(bead_id) {
            self.beads.update(bead_id, |b| {
                if let Some(f) = b.fields.as_agent_mut() {
                    f.session_name = None;
                    f.pod_name = None;
                    f.pod_ip = None;
                }
            })?;
        }
        info!(agent = bead_id, "agent stopped");
        Ok(())
    }

    pub async fn is_alive(&self, bead_id: &str) -> Result<bool, RunnerError> {
        let spec = self.spec(bead_id)?;
        self.backend_for(spec.execution_target).is_alive(&spec).await
    }

    /// The most recent rendered screen of the agent's session.
    pub async fn observe(&self, bead_id: &str, lines: u32) -> Result<String, RunnerError> {
        let spec = self.spec(bead_id)?;
        self.backend_for(spec.execution_target)
            .observe(&spec, lines)
            .await
    }

    /// Type a line into the agent's session.
    pub async fn send_input(&self, bead_id: &str, text: &str) -> Result<(), RunnerError> {
        let spec = self.spec(bead_id)?;
        self.backend_for(spec.execution_target)
            .send_input(&spec, text)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::beads::types::{AgentFields, BeadFields, BeadType};
    use std::path::Path;

    fn agent_bead() -> Bead {
        Bead::new("gt-agent-nux", "nux", BeadType::Agent).with_fields(BeadFields::Agent(
            AgentFields {
                role_type: Some(RoleType::Crew),
                rig: Some("gastown".into()),
                agent_name: Some("nux".into()),
                execution_target: ExecutionTarget::Local,
                ..Default::default()
            },
        ))
    }

    #[test]
    fn spec_from_bead_resolves_workspace_and_session() {
        let paths = TownPaths::new(Path::new("/town"));
        let spec = AgentSpec::from_bead(&agent_bead(), &paths).unwrap();
        assert_eq!(spec.session_name(), "gt-gastown-crew-nux");
        assert_eq!(spec.workspace, PathBuf::from("/town/gastown/crew/nux"));
    }

    #[test]
    fn spec_requires_complete_agent_fields() {
        let paths = TownPaths::new(Path::new("/town"));
        let mut bead = agent_bead();
        if let Some(f) = bead.fields.as_agent_mut() {
            f.rig = None;
        }
        let err = AgentSpec::from_bead(&bead, &paths).unwrap_err();
        assert!(matches!(err, RunnerError::SpawnFailed { .. }));

        let plain = Bead::new("gt-1", "not an agent", BeadType::Task);
        assert!(AgentSpec::from_bead(&plain, &paths).is_err());
    }
}
