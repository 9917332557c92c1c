//! Remote execution backend: cluster pods behind the PTY-manager sidecar.
//!
//! The sidecar exposes a uniform HTTP surface per pod (create, delete,
//! liveness, screen capture, input). This backend is the only component
//! that speaks it; the control loop stays transport-agnostic.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::RunnerError;
use crate::runner::{AgentSpec, ExecBackend, RuntimeInfo};

pub struct SidecarBackend {
    client: reqwest::Client,
    base_url: String,
}

impl SidecarBackend {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn pod_url(&self, pod: &str, tail: &str) -> String {
        if tail.is_empty() {
            format!("{}/v1/pods/{pod}", self.base_url)
        } else {
            format!("{}/v1/pods/{pod}/{tail}", self.base_url)
        }
    }
}

/// Deterministic pod name mirroring the local session naming.
pub fn pod_name(spec: &AgentSpec) -> String {
    spec.session_name()
}

#[derive(Debug, Serialize)]
struct CreatePod<'a> {
    name: String,
    rig: &'a str,
    role: &'a str,
    agent: &'a str,
}

#[derive(Debug, Deserialize)]
struct PodCreated {
    pod_name: String,
    pod_ip: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Liveness {
    alive: bool,
}

#[derive(Debug, Deserialize)]
struct Screen {
    screen: String,
}

#[async_trait]
impl ExecBackend for SidecarBackend {
    async fn start(&self, spec: &AgentSpec) -> Result<RuntimeInfo, RunnerError> {
        let body = CreatePod {
            name: pod_name(spec),
            rig: &spec.rig,
            role: spec.role.as_str(),
            agent: &spec.name,
        };
        let resp = self
            .client
            .post(format!("{}/v1/pods", self.base_url))
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        let created: PodCreated = resp.json().await?;
        debug!(pod = %created.pod_name, "pod created");
        Ok(RuntimeInfo {
            session_name: None,
            pod_name: Some(created.pod_name),
            pod_ip: created.pod_ip,
        })
    }

    /// Idempotent: a 404 means the pod is already gone.
    async fn stop(&self, spec: &AgentSpec) -> Result<(), RunnerError> {
        let resp = self
            .client
            .delete(self.pod_url(&pod_name(spec), ""))
            .send()
            .await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        resp.error_for_status()?;
        Ok(())
    }

    async fn is_alive(&self, spec: &AgentSpec) -> Result<bool, RunnerError> {
        let resp = self
            .client
            .get(self.pod_url(&pod_name(spec), "alive"))
            .send()
            .await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(false);
        }
        let liveness: Liveness = resp.error_for_status()?.json().await?;
        Ok(liveness.alive)
    }

    async fn observe(&self, spec: &AgentSpec, lines: u32) -> Result<String, RunnerError> {
        let resp = self
            .client
            .get(self.pod_url(&pod_name(spec), "screen"))
            .query(&[("lines", lines)])
            .send()
            .await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(RunnerError::SessionMissing {
                agent: spec.bead_id.clone(),
            });
        }
        let screen: Screen = resp.error_for_status()?.json().await?;
        Ok(screen.screen)
    }

    async fn send_input(&self, spec: &AgentSpec, text: &str) -> Result<(), RunnerError> {
        self.client
            .post(self.pod_url(&pod_name(spec), "input"))
            .json(&serde_json::json!({ "text": text }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}
