//! Decision gate: structured human-in-the-loop prompts that block work.
//!
//! A pending decision is a bead carrying the question, up to four options,
//! and the issues it blocks. Each requester holds at most one pending
//! decision; newer requests supersede older ones. Stale decisions are
//! auto-closed by the control loop's sweep so nothing stays gated forever.

use std::sync::Arc;

use chrono::{Duration, Utc};
use tracing::{info, warn};

use crate::beads::{
    Bead, BeadFields, BeadStatus, BeadType, Beads, DecisionFields, DecisionOption, ListFilter,
    LABEL_DECISION_PENDING, LABEL_DECISION_RESOLVED, id::decision_slug,
};
use crate::errors::DecisionError;
use crate::inject::{EntryKind, Injector};
use crate::mail::{Draft, MailBus};
use crate::town::TOWN_PREFIX;

/// Label applied when a decision was answered with free text instead of a
/// numbered option.
pub const LABEL_CUSTOM_TEXT: &str = "implicit:custom_text";

const MAX_OPTIONS: u32 = 4;

/// Keywords that trigger fail-then-file validation.
const FAILURE_KEYWORDS: &[&str] = &["fail", "failed", "failure", "error", "crash", "broken"];

/// A decision request before it becomes a bead.
#[derive(Debug, Clone, Default)]
pub struct DecisionRequest {
    /// Agent bead ID of the requester.
    pub requester: String,
    pub question: String,
    pub context: Option<String>,
    pub analysis: Option<String>,
    pub tradeoffs: Option<String>,
    pub options: Vec<DecisionOption>,
    pub recommended_index: Option<u32>,
    pub urgency: Option<String>,
    /// Issue IDs blocked until this decision resolves.
    pub blockers: Vec<String>,
}

pub struct DecisionGate {
    beads: Arc<Beads>,
    injector: Arc<Injector>,
    mail: Arc<MailBus>,
    /// Where notification mail goes; usually a channel the human watches.
    notify_address: Option<String>,
    /// Per-rig fail-then-file validation.
    require_file_option: bool,
}

impl DecisionGate {
    pub fn new(beads: Arc<Beads>, injector: Arc<Injector>, mail: Arc<MailBus>) -> Self {
        Self {
            beads,
            injector,
            mail,
            notify_address: None,
            require_file_option: false,
        }
    }

    pub fn with_notify_address(mut self, address: &str) -> Self {
        self.notify_address = Some(address.to_string());
        self
    }

    pub fn with_fail_then_file(mut self, enabled: bool) -> Self {
        self.require_file_option = enabled;
        self
    }

    // ── Request ───────────────────────────────────────────────────────

    /// Write a pending decision bead, notify the human inbox, surface the
    /// decision to the requester's own session, and supersede any older
    /// pending decision from the same requester.
    pub async fn request(&self, req: DecisionRequest) -> Result<Bead, DecisionError> {
        if req.options.is_empty() || req.options.len() as u32 > MAX_OPTIONS {
            return Err(DecisionError::BadOption {
                index: req.options.len() as u32,
                max: MAX_OPTIONS,
            });
        }
        self.validate_fail_then_file(&req)?;

        // Single-pending invariant: older pending decisions from this
        // requester close as superseded.
        for stale in self.pending_for(&req.requester)? {
            self.release_blockers(&stale)?;
            self.beads.close(&stale.id, Some("superseded"))?;
            info!(decision = %stale.id, "superseded by newer request");
        }

        let id = format!("{TOWN_PREFIX}-{}", decision_slug(&req.question));
        let mut bead = Bead::new(&id, &req.question, BeadType::Decision)
            .with_label(LABEL_DECISION_PENDING)
            .with_fields(BeadFields::Decision(DecisionFields {
                question: req.question.clone(),
                context: req.context.clone(),
                analysis: req.analysis.clone(),
                tradeoffs: req.tradeoffs.clone(),
                options: req.options.clone(),
                recommended_index: req.recommended_index,
                urgency: req.urgency.clone(),
                blockers: req.blockers.clone(),
                ..Default::default()
            }));
        if let Some(urgency) = &req.urgency {
            bead.labels.insert(format!("urgency:{urgency}"));
        }
        bead.created_by = Some(req.requester.clone());
        self.beads.create(&bead)?;

        for blocked in &req.blockers {
            self.beads.add_dependency(blocked, &id)?;
        }

        if let Some(notify) = &self.notify_address {
            let draft = Draft {
                from: req.requester.clone(),
                to: vec![notify.clone()],
                subject: format!("decision needed: {}", req.question),
                body: render_summary(&req),
                ..Default::default()
            };
            if let Err(e) = self.mail.send(&draft).await {
                warn!(error = %e, "decision notification undeliverable");
            }
        }
        self.injector
            .enqueue(
                &req.requester,
                EntryKind::Decision,
                &format!("decision {id} pending: {}", req.question),
            )
            .await?;
        Ok(self.beads.show(&id)?)
    }

    fn validate_fail_then_file(&self, req: &DecisionRequest) -> Result<(), DecisionError> {
        if !self.require_file_option {
            return Ok(());
        }
        let haystack = format!(
            "{} {}",
            req.question,
            req.context.as_deref().unwrap_or_default()
        )
        .to_ascii_lowercase();
        if !FAILURE_KEYWORDS.iter().any(|k| haystack.contains(k)) {
            return Ok(());
        }
        let has_file_option = req.options.iter().any(|o| {
            let text = format!("{} {}", o.label, o.description).to_ascii_lowercase();
            text.contains("file a bug") || text.contains("file bug")
        });
        if has_file_option {
            Ok(())
        } else {
            Err(DecisionError::MissingFileOption)
        }
    }

    // ── Resolution ────────────────────────────────────────────────────

    /// Resolve with a 1-indexed option choice.
    pub async fn resolve(
        &self,
        id: &str,
        choice: u32,
        rationale: Option<&str>,
        resolved_by: &str,
    ) -> Result<Bead, DecisionError> {
        let bead = self.beads.show(id)?;
        if !bead.has_label(LABEL_DECISION_PENDING) || bead.status == BeadStatus::Closed {
            return Err(DecisionError::NotPending { id: id.to_string() });
        }
        let options = bead
            .fields
            .as_decision()
            .map(|d| d.options.len() as u32)
            .unwrap_or(0);
        if choice == 0 || choice > options {
            return Err(DecisionError::BadOption {
                index: choice,
                max: options,
            });
        }

        let rationale = rationale.map(str::to_string);
        let resolver = resolved_by.to_string();
        self.beads.update(id, |b| {
            b.labels.remove(LABEL_DECISION_PENDING);
            b.labels.insert(LABEL_DECISION_RESOLVED.to_string());
            if let BeadFields::Decision(d) = &mut b.fields {
                d.chosen_index = choice;
                d.rationale = rationale.clone();
                d.resolved_by = Some(resolver.clone());
                d.resolved_at = Some(Utc::now());
            }
        })?;
        let resolved = self.beads.close(id, Some("resolved"))?;
        self.release_blockers(&resolved)?;
        self.notify_requester(&resolved, &format!("decision {id} resolved: option {choice}"))
            .await;
        Ok(resolved)
    }

    /// Record a free-form response instead of a numbered option.
    pub async fn respond_text(
        &self,
        id: &str,
        text: &str,
        resolved_by: &str,
    ) -> Result<Bead, DecisionError> {
        let bead = self.beads.show(id)?;
        if !bead.has_label(LABEL_DECISION_PENDING) || bead.status == BeadStatus::Closed {
            return Err(DecisionError::NotPending { id: id.to_string() });
        }
        let text = text.to_string();
        let resolver = resolved_by.to_string();
        self.beads.update(id, |b| {
            b.labels.remove(LABEL_DECISION_PENDING);
            b.labels.insert(LABEL_DECISION_RESOLVED.to_string());
            b.labels.insert(LABEL_CUSTOM_TEXT.to_string());
            if let BeadFields::Decision(d) = &mut b.fields {
                d.response_text = Some(text.clone());
                d.resolved_by = Some(resolver.clone());
                d.resolved_at = Some(Utc::now());
            }
        })?;
        let resolved = self.beads.close(id, Some("resolved"))?;
        self.release_blockers(&resolved)?;
        self.notify_requester(&resolved, &format!("decision {id} answered with custom text"))
            .await;
        Ok(resolved)
    }

    /// Close pending decisions older than `threshold` with reason `stale`,
    /// unblocking dependents. Returns the closed IDs.
    pub fn auto_close(&self, threshold: Duration) -> Result<Vec<String>, DecisionError> {
        let cutoff = Utc::now() - threshold;
        let mut closed = Vec::new();
        for bead in self.all_pending()? {
            if bead.created_at <= cutoff {
                self.release_blockers(&bead)?;
                self.beads.close(&bead.id, Some("stale"))?;
                info!(decision = %bead.id, "auto-closed stale decision");
                closed.push(bead.id);
            }
        }
        Ok(closed)
    }

    // ── Queries ───────────────────────────────────────────────────────

    pub fn all_pending(&self) -> Result<Vec<Bead>, DecisionError> {
        Ok(self.beads.list(
            TOWN_PREFIX,
            &ListFilter::open()
                .with_type(BeadType::Decision)
                .with_label(LABEL_DECISION_PENDING),
        )?)
    }

    pub fn pending_for(&self, requester: &str) -> Result<Vec<Bead>, DecisionError> {
        Ok(self
            .all_pending()?
            .into_iter()
            .filter(|b| b.created_by.as_deref() == Some(requester))
            .collect())
    }

    /// Re-assert the single-pending invariant; used by the control loop's
    /// idempotent sweep. Keeps the newest decision per requester.
    pub fn enforce_single_pending(&self) -> Result<Vec<String>, DecisionError> {
        let mut by_requester: std::collections::BTreeMap<String, Vec<Bead>> = Default::default();
        for bead in self.all_pending()? {
            let requester = bead.created_by.clone().unwrap_or_default();
            by_requester.entry(requester).or_default().push(bead);
        }
        let mut superseded = Vec::new();
        for (_, mut decisions) in by_requester {
            if decisions.len() <= 1 {
                continue;
            }
            decisions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
            let keep = decisions.pop().expect("nonempty");
            for stale in decisions {
                self.release_blockers(&stale)?;
                self.beads.close(&stale.id, Some("superseded"))?;
                superseded.push(stale.id);
            }
            info!(kept = %keep.id, "single-pending sweep");
        }
        Ok(superseded)
    }

    fn release_blockers(&self, decision: &Bead) -> Result<(), DecisionError> {
        if let Some(d) = decision.fields.as_decision() {
            for blocked in &d.blockers {
                self.beads.remove_dependency(blocked, &decision.id)?;
            }
        }
        Ok(())
    }

    async fn notify_requester(&self, decision: &Bead, subject: &str) {
        let Some(requester) = &decision.created_by else {
            return;
        };
        // The requester field holds the agent bead ID; mail wants an
        // address. Fall back to injection when the agent is gone.
        let body = decision
            .fields
            .as_decision()
            .and_then(|d| d.rationale.clone())
            .unwrap_or_default();
        if let Ok(agent) = self.beads.show(requester)
            && let Some(address) = agent.agent_address()
        {
            let draft = Draft {
                from: "hq/mayor".into(),
                to: vec![address],
                subject: subject.to_string(),
                body,
                ..Default::default()
            };
            if self.mail.send(&draft).await.is_ok() {
                return;
            }
        }
        if let Err(e) = self
            .injector
            .enqueue(requester, EntryKind::Decision, subject)
            .await
        {
            warn!(error = %e, "resolution notification undeliverable");
        }
    }
}

fn render_summary(req: &DecisionRequest) -> String {
    let mut out = String::new();
    out.push_str(&req.question);
    out.push('\n');
    if let Some(ctx) = &req.context {
        out.push_str("\nContext: ");
        out.push_str(ctx);
        out.push('\n');
    }
    for (i, opt) in req.options.iter().enumerate() {
        out.push_str(&format!("\n{}. {} - {}", i + 1, opt.label, opt.description));
    }
    if let Some(rec) = req.recommended_index {
        out.push_str(&format!("\n\nRecommended: option {rec}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::beads::types::{AgentFields, AgentState, RoleType};
    use tempfile::tempdir;

    struct Fixture {
        gate: DecisionGate,
        beads: Arc<Beads>,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let beads = Beads::open(&dir.path().join("routes.jsonl")).unwrap();
        beads
            .routes()
            .add(TOWN_PREFIX, dir.path().join("hq").to_str().unwrap())
            .unwrap();
        beads
            .routes()
            .add("gt", dir.path().join("gt").to_str().unwrap())
            .unwrap();
        let beads = Arc::new(beads);
        let injector = Arc::new(Injector::new(beads.clone()));
        let mail = Arc::new(MailBus::new(beads.clone(), injector.clone()));
        Fixture {
            gate: DecisionGate::new(beads.clone(), injector, mail),
            beads,
            _dir: dir,
        }
    }

    fn add_requester(beads: &Beads, name: &str) -> String {
        let id = format!("hq-agent-{name}");
        beads
            .create(
                &Bead::new(&id, name, BeadType::Agent)
                    .with_fields(BeadFields::Agent(AgentFields {
                        role_type: Some(RoleType::Crew),
                        rig: Some("gastown".into()),
                        agent_name: Some(name.into()),
                        agent_state: AgentState::Working,
                        ..Default::default()
                    })),
            )
            .unwrap();
        id
    }

    fn two_options() -> Vec<DecisionOption> {
        vec![
            DecisionOption {
                label: "ship".into(),
                description: "merge now".into(),
                ..Default::default()
            },
            DecisionOption {
                label: "wait".into(),
                description: "hold for review".into(),
                ..Default::default()
            },
        ]
    }

    fn request_for(requester: &str, question: &str) -> DecisionRequest {
        DecisionRequest {
            requester: requester.into(),
            question: question.into(),
            options: two_options(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn request_creates_pending_decision() {
        let f = fixture();
        let alice = add_requester(&f.beads, "alice");
        let bead = f
            .gate
            .request(request_for(&alice, "Should we ship the release?"))
            .await
            .unwrap();
        assert!(bead.has_label(LABEL_DECISION_PENDING));
        assert!(bead.id.starts_with("hq-dec-"));
        assert_eq!(f.gate.pending_for(&alice).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn newer_request_supersedes_older() {
        let f = fixture();
        let alice = add_requester(&f.beads, "alice");
        let d1 = f
            .gate
            .request(request_for(&alice, "First question about shipping?"))
            .await
            .unwrap();
        let d2 = f
            .gate
            .request(request_for(&alice, "Second question about testing?"))
            .await
            .unwrap();

        let old = f.beads.show(&d1.id).unwrap();
        assert_eq!(old.status, BeadStatus::Closed);
        assert_eq!(old.close_reason.as_deref(), Some("superseded"));
        let pending = f.gate.pending_for(&alice).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, d2.id);
    }

    #[tokio::test]
    async fn resolve_sets_choice_and_unblocks() {
        let f = fixture();
        let alice = add_requester(&f.beads, "alice");
        f.beads
            .create(&Bead::new("gt-blocked", "waiting", BeadType::Task))
            .unwrap();
        let mut req = request_for(&alice, "Pick a path forward?");
        req.blockers = vec!["gt-blocked".into()];
        let d = f.gate.request(req).await.unwrap();

        // Blocked while pending.
        let ready: Vec<_> = f.beads.ready("gt", None).unwrap();
        assert!(ready.is_empty());

        let resolved = f.gate.resolve(&d.id, 2, Some("review first"), "human").await.unwrap();
        assert!(resolved.has_label(LABEL_DECISION_RESOLVED));
        let fields = resolved.fields.as_decision().unwrap();
        assert_eq!(fields.chosen_index, 2);
        assert!(fields.resolved_at.is_some());
        assert_eq!(fields.resolved_by.as_deref(), Some("human"));

        let ready: Vec<_> = f
            .beads
            .ready("gt", None)
            .unwrap()
            .into_iter()
            .map(|b| b.id)
            .collect();
        assert_eq!(ready, vec!["gt-blocked"]);
    }

    #[tokio::test]
    async fn resolve_rejects_bad_choice_and_double_resolution() {
        let f = fixture();
        let alice = add_requester(&f.beads, "alice");
        let d = f
            .gate
            .request(request_for(&alice, "Choose an option?"))
            .await
            .unwrap();
        assert!(matches!(
            f.gate.resolve(&d.id, 0, None, "human").await,
            Err(DecisionError::BadOption { .. })
        ));
        assert!(matches!(
            f.gate.resolve(&d.id, 3, None, "human").await,
            Err(DecisionError::BadOption { .. })
        ));

        f.gate.resolve(&d.id, 1, None, "human").await.unwrap();
        assert!(matches!(
            f.gate.resolve(&d.id, 1, None, "human").await,
            Err(DecisionError::NotPending { .. })
        ));
    }

    #[tokio::test]
    async fn respond_text_resolves_without_numeric_choice() {
        let f = fixture();
        let alice = add_requester(&f.beads, "alice");
        let d = f
            .gate
            .request(request_for(&alice, "How should we proceed?"))
            .await
            .unwrap();
        let resolved = f
            .gate
            .respond_text(&d.id, "do neither, refactor instead", "human")
            .await
            .unwrap();
        assert!(resolved.has_label(LABEL_CUSTOM_TEXT));
        assert!(resolved.has_label(LABEL_DECISION_RESOLVED));
        let fields = resolved.fields.as_decision().unwrap();
        assert_eq!(fields.chosen_index, 0);
        assert!(fields.resolved_at.is_some());
        assert_eq!(
            fields.response_text.as_deref(),
            Some("do neither, refactor instead")
        );
    }

    #[tokio::test]
    async fn auto_close_honors_threshold_boundary() {
        let f = fixture();
        let alice = add_requester(&f.beads, "alice");
        let d = f
            .gate
            .request(request_for(&alice, "Stale soon?"))
            .await
            .unwrap();

        // Fresh decision survives a sweep with a generous threshold.
        assert!(f.gate.auto_close(Duration::minutes(10)).unwrap().is_empty());

        // now - created >= 0 holds immediately, so a zero threshold sweeps it.
        let closed = f.gate.auto_close(Duration::zero()).unwrap();
        assert_eq!(closed, vec![d.id.clone()]);
        let bead = f.beads.show(&d.id).unwrap();
        assert_eq!(bead.close_reason.as_deref(), Some("stale"));
    }

    #[tokio::test]
    async fn fail_then_file_requires_bug_option() {
        let f = fixture();
        let alice = add_requester(&f.beads, "alice");
        let gate = {
            let beads = f.beads.clone();
            let injector = Arc::new(Injector::new(beads.clone()));
            let mail = Arc::new(MailBus::new(beads.clone(), injector.clone()));
            DecisionGate::new(beads, injector, mail).with_fail_then_file(true)
        };

        let mut req = request_for(&alice, "Tests failed on main, what now?");
        req.context = Some("CI reports two failures".into());
        assert!(matches!(
            gate.request(req.clone()).await,
            Err(DecisionError::MissingFileOption)
        ));

        req.options.push(DecisionOption {
            label: "file a bug".into(),
            description: "record the failure".into(),
            ..Default::default()
        });
        gate.request(req).await.unwrap();
    }

    #[tokio::test]
    async fn sweep_enforces_single_pending() {
        let f = fixture();
        let alice = add_requester(&f.beads, "alice");
        let bob = add_requester(&f.beads, "bob");
        let d1 = f
            .gate
            .request(request_for(&alice, "Alpha question?"))
            .await
            .unwrap();
        // Simulate a second pending decision slipping past request-time
        // supersession (e.g. written by another client).
        let rogue = Bead::new("hq-dec-rogue-000000", "rogue", BeadType::Decision)
            .with_label(LABEL_DECISION_PENDING);
        let mut rogue = rogue;
        rogue.created_by = Some(alice.clone());
        rogue.created_at = Utc::now() + Duration::milliseconds(5);
        rogue.fields = BeadFields::Decision(DecisionFields {
            question: "rogue".into(),
            ..Default::default()
        });
        f.beads.create(&rogue).unwrap();
        let db = f
            .gate
            .request(request_for(&bob, "Bob question?"))
            .await
            .unwrap();

        let superseded = f.gate.enforce_single_pending().unwrap();
        assert_eq!(superseded, vec![d1.id.clone()]);
        assert_eq!(f.gate.pending_for(&alice).unwrap().len(), 1);
        assert_eq!(f.gate.pending_for(&bob).unwrap()[0].id, db.id);
    }
}
