//! Control loop: converges declared agents onto running processes.
//!
//! Two paths drive the same state machine: store change events (create and
//! close of agent beads) and a periodic reconcile tick. The loop never
//! touches files or transports itself; every side effect goes through the
//! runner.
//!
//! State ladder: `spawning -> working` on registration, `working -> idle`
//! when no work is hooked, `working -> stuck` on staleness, `stuck -> dead`
//! past the grace threshold (the hook is released and the agent restarted),
//! `* -> done` when the bead closes.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::beads::types::{AgentState, BeadType};
use crate::beads::{Bead, Beads, ChangeEvent, ChangeKind, ListFilter, LABEL_AGENT};
use crate::decision::DecisionGate;
use crate::errors::GtError;
use crate::mail::{Draft, MailBus};
use crate::runner::Runner;
use crate::sched::Scheduler;
use crate::town::Tunables;

/// Per-agent start-failure backoff record.
#[derive(Debug, Clone)]
struct Backoff {
    failures: u32,
    next_attempt: DateTime<Utc>,
    escalated: bool,
}

/// What one reconcile pass did; used to prove idempotence.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub started: Vec<String>,
    pub stopped: Vec<String>,
    pub marked_idle: Vec<String>,
    pub marked_stuck: Vec<String>,
    pub marked_dead: Vec<String>,
    pub restarted: Vec<String>,
    pub escalated: Vec<String>,
    pub slots_released: Vec<String>,
    pub decisions_swept: Vec<String>,
}

impl ReconcileReport {
    pub fn is_noop(&self) -> bool {
        self == &Self::default()
    }
}

pub struct ControlLoop {
    beads: Arc<Beads>,
    runner: Arc<Runner>,
    sched: Arc<Scheduler>,
    mail: Arc<MailBus>,
    decisions: Arc<DecisionGate>,
    tunables: Tunables,
    backoff: DashMap<String, Backoff>,
    stale_strikes: DashMap<String, u32>,
    cancel: CancellationToken,
}

impl ControlLoop {
    pub fn new(
        beads: Arc<Beads>,
        runner: Arc<Runner>,
        sched: Arc<Scheduler>,
        mail: Arc<MailBus>,
        decisions: Arc<DecisionGate>,
        tunables: Tunables,
    ) -> Self {
        Self {
            beads,
            runner,
            sched,
            mail,
            decisions,
            tunables,
            backoff: DashMap::new(),
            stale_strikes: DashMap::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run until cancelled: periodic reconcile plus event-driven reactions.
    pub async fn run(&self) {
        let mut events = self.beads.subscribe();
        let mut tick = tokio::time::interval(std::time::Duration::from_secs(
            self.tunables.reconcile_interval_secs.max(1),
        ));
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tick.tick() => {
                    if let Err(e) = self.reconcile().await {
                        warn!(error = %e, "reconcile pass failed");
                    }
                }
                ev = events.recv() => match ev {
                    Ok(ev) => self.handle_event(ev).await,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "event stream lagged; next tick resyncs");
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
    }

    /// React to a single store change.
    pub async fn handle_event(&self, ev: ChangeEvent) {
        if ev.bead_type != BeadType::Agent {
            return;
        }
        match ev.kind {
            ChangeKind::Created => {
                if let Err(e) = self.start_agent(&ev.bead_id).await {
                    warn!(agent = %ev.bead_id, error = %e, "spawn on create failed");
                }
            }
            ChangeKind::Closed => {
                if let Err(e) = self.retire_agent(&ev.bead_id).await {
                    warn!(agent = %ev.bead_id, error = %e, "stop on close failed");
                }
            }
            ChangeKind::Updated => {}
        }
    }

    /// One full convergence pass over desired and actual agents.
    pub async fn reconcile(&self) -> Result<ReconcileReport, GtError> {
        let mut report = ReconcileReport::default();
        let now = Utc::now();
        let stale_after = Duration::seconds(self.tunables.stale_timeout_secs as i64);

        // Desired: open beads labeled as agents.
        let desired = self.desired_agents()?;
        for agent in &desired {
            let Some(fields) = agent.fields.as_agent() else {
                continue;
            };
            if fields.agent_state.is_terminal() {
                continue;
            }
            let alive = self.runner.is_alive(&agent.id).await.unwrap_or(false);

            if !alive {
                // Desired but not running: start, under backoff.
                if self.backoff_blocks(&agent.id, now) {
                    continue;
                }
                match self.runner.start(&agent.id).await {
                    Ok(_) => {
                        self.backoff.remove(&agent.id);
                        self.stale_strikes.remove(&agent.id);
                        report.started.push(agent.id.clone());
                    }
                    Err(e) => {
                        warn!(agent = %agent.id, error = %e, "start failed");
                        if self.record_failure(&agent.id, now) {
                            self.escalate(agent).await;
                            report.escalated.push(agent.id.clone());
                        }
                    }
                }
                continue;
            }

            // Alive: idle/working bookkeeping, then the staleness ladder.
            let last = fields.last_activity.unwrap_or(agent.updated_at);
            if now - last < stale_after {
                self.stale_strikes.remove(&agent.id);
                match (fields.agent_state, &fields.hook_bead) {
                    (AgentState::Working, None) => {
                        self.set_state(&agent.id, AgentState::Idle)?;
                        report.marked_idle.push(agent.id.clone());
                    }
                    (AgentState::Idle, Some(_)) | (AgentState::Stuck, _) => {
                        self.set_state(&agent.id, AgentState::Working)?;
                    }
                    _ => {}
                }
                continue;
            }

            let strikes = {
                let mut entry = self.stale_strikes.entry(agent.id.clone()).or_insert(0);
                *entry += 1;
                *entry
            };
            if strikes < self.tunables.dead_grace {
                if fields.agent_state != AgentState::Stuck {
                    self.set_state(&agent.id, AgentState::Stuck)?;
                    report.marked_stuck.push(agent.id.clone());
                    info!(agent = %agent.id, "agent marked stuck");
                }
            } else {
                // Past grace: declare dead, release the hook, restart.
                self.set_state(&agent.id, AgentState::Dead)?;
                report.marked_dead.push(agent.id.clone());
                if let Some(hook) = fields.hook_bead.clone() {
                    self.sched.release_hook(&agent.id, &hook)?;
                }
                let _ = self.runner.stop(&agent.id).await;
                self.stale_strikes.remove(&agent.id);
                match self.runner.start(&agent.id).await {
                    Ok(_) => report.restarted.push(agent.id.clone()),
                    Err(e) => {
                        warn!(agent = %agent.id, error = %e, "restart after death failed");
                        if self.record_failure(&agent.id, now) {
                            self.escalate(agent).await;
                            report.escalated.push(agent.id.clone());
                        }
                    }
                }
            }
        }

        // Actual but no longer desired: closed agent beads with leftover
        // runtime state.
        for agent in self.undesired_agents()? {
            let _ = self.runner.stop(&agent.id).await;
            report.stopped.push(agent.id.clone());
        }

        // Idempotent sweeps that ride the same tick.
        report.slots_released = self.sweep_merge_slots()?;
        report.decisions_swept = self
            .decisions
            .enforce_single_pending()
            .map_err(GtError::from)?;
        let stale_decisions = self
            .decisions
            .auto_close(Duration::seconds(self.tunables.decision_auto_close_secs as i64))
            .map_err(GtError::from)?;
        report.decisions_swept.extend(stale_decisions);

        Ok(report)
    }

    // ── Individual transitions ────────────────────────────────────────

    async fn start_agent(&self, bead_id: &str) -> Result<(), GtError> {
        let bead = self.beads.show(bead_id)?;
        if !bead.has_label(LABEL_AGENT) || !bead.is_open() {
            return Ok(());
        }
        self.runner.start(bead_id).await?;
        Ok(())
    }

    /// Stop is idempotent and non-blocking: issue it, record the terminal
    /// state, and let the next tick re-check.
    async fn retire_agent(&self, bead_id: &str) -> Result<(), GtError> {
        let _ = self.runner.stop(bead_id).await;
        let bead = self.beads.show(bead_id)?;
        if let Some(fields) = bead.fields.as_agent() {
            if let Some(hook) = fields.hook_bead.clone() {
                self.sched.release_hook(bead_id, &hook)?;
            }
            if fields.agent_state != AgentState::Done {
                self.set_state(bead_id, AgentState::Done)?;
            }
        }
        Ok(())
    }

    fn set_state(&self, bead_id: &str, state: AgentState) -> Result<(), GtError> {
        self.beads.update(bead_id, |b| {
            if let Some(f) = b.fields.as_agent_mut() {
                f.agent_state = state;
            }
        })?;
        Ok(())
    }

    fn desired_agents(&self) -> Result<Vec<Bead>, GtError> {
        Ok(self
            .beads
            .list_all(&ListFilter::open().with_type(BeadType::Agent).with_label(LABEL_AGENT))?)
    }

    fn undesired_agents(&self) -> Result<Vec<Bead>, GtError> {
        let mut filter = ListFilter::default().with_type(BeadType::Agent);
        filter.status = Some(crate::beads::BeadStatus::Closed);
        let closed = self.beads.list_all(&filter)?;
        Ok(closed
            .into_iter()
            .filter(|b| {
                b.fields
                    .as_agent()
                    .map(|f| f.session_name.is_some() || f.pod_name.is_some())
                    .unwrap_or(false)
            })
            .collect())
    }

    // ── Backoff & escalation ──────────────────────────────────────────

    fn backoff_blocks(&self, agent_id: &str, now: DateTime<Utc>) -> bool {
        self.backoff
            .get(agent_id)
            .map(|b| now < b.next_attempt)
            .unwrap_or(false)
    }

    /// Record a start failure; returns true when the failure count crosses
    /// the escalation threshold for the first time.
    fn record_failure(&self, agent_id: &str, now: DateTime<Utc>) -> bool {
        let mut entry = self.backoff.entry(agent_id.to_string()).or_insert(Backoff {
            failures: 0,
            next_attempt: now,
            escalated: false,
        });
        entry.failures += 1;
        let exp = entry.failures.saturating_sub(1).min(16);
        let base = self.tunables.backoff_base_secs.saturating_mul(1u64 << exp);
        let delay = base.min(self.tunables.backoff_cap_secs);
        let jitter = u64::from(uuid::Uuid::new_v4().as_bytes()[0]) % (delay / 4 + 1);
        entry.next_attempt = now + Duration::seconds((delay + jitter) as i64);
        let cross = entry.failures >= self.tunables.escalate_after_failures && !entry.escalated;
        if cross {
            entry.escalated = true;
        }
        cross
    }

    /// Raise a blocker bead and tell the rig's witness.
    async fn escalate(&self, agent: &Bead) {
        let prefix = agent.id.split('-').next().unwrap_or("hq").to_string();
        let blocker_id = format!(
            "{prefix}-blocker-{}",
            crate::beads::id::random_base36(6)
        );
        let blocker = Bead::new(
            &blocker_id,
            &format!("agent {} failing to start", agent.id),
            BeadType::Bug,
        )
        .with_priority(0)
        .with_description(&format!(
            "{} consecutive start failures; manual attention needed",
            self.tunables.escalate_after_failures
        ));
        if let Err(e) = self.beads.create(&blocker) {
            warn!(error = %e, "could not raise blocker bead");
        }
        if let Some(rig) = agent.fields.as_agent().and_then(|f| f.rig.clone()) {
            let draft = Draft {
                from: "hq/deacon".into(),
                to: vec![format!("{rig}/witness")],
                subject: format!("agent {} cannot start", agent.id),
                body: format!("blocker bead: {blocker_id}"),
                ..Default::default()
            };
            if let Err(e) = self.mail.send(&draft).await {
                warn!(error = %e, "witness unreachable for escalation");
            }
        }
    }

    /// Open question #1: a crashed slot holder must not pin the rig
    /// forever. Release slots whose holder bead is dead or gone, leaving an
    /// audit note on the refinery bead.
    fn sweep_merge_slots(&self) -> Result<Vec<String>, GtError> {
        let mut released = Vec::new();
        let agents = self
            .beads
            .list_all(&ListFilter::open().with_type(BeadType::Agent))?;
        for agent in agents {
            let Some(fields) = agent.fields.as_agent() else {
                continue;
            };
            let Some(slot) = &fields.merge_slot else {
                continue;
            };
            let Some(holder) = &slot.holder else {
                continue;
            };
            let holder_dead = match self.beads.get(holder) {
                Ok(Some(b)) => {
                    !b.is_open()
                        || b.fields
                            .as_agent()
                            .map(|f| f.agent_state == AgentState::Dead)
                            .unwrap_or(false)
                }
                Ok(None) | Err(_) => true,
            };
            if !holder_dead {
                continue;
            }
            let holder = holder.clone();
            self.beads.update(&agent.id, |b| {
                if let Some(f) = b.fields.as_agent_mut()
                    && let Some(slot) = &mut f.merge_slot
                {
                    slot.holder = None;
                    slot.reason = None;
                    slot.acquired_at = None;
                }
                b.notes.insert(
                    format!("slot-swept-{}", Utc::now().timestamp()),
                    format!("released slot held by dead holder {holder}"),
                );
            })?;
            info!(refinery = %agent.id, holder = %holder, "merge slot swept");
            released.push(agent.id.clone());
        }
        Ok(released)
    }
}
