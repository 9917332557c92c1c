//! The refinery: serialized merge-queue processing for one rig.
//!
//! Merge requests move through `open -> ready -> claimed -> processing ->
//! (merged | conflict | test_failed | rejected)`. Two strategies exist:
//! `rebase-ff` (production default) and the legacy `squash` path. Clean
//! merges run without coordination; conflict resolution and semantic
//! arbitration serialize on the rig's merge slot.

pub mod git;
pub mod semantic;
pub mod slot;

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::beads::types::{MergeRequestFields, BeadFields};
use crate::beads::{Bead, BeadStatus, BeadType, Beads, ListFilter, LABEL_MERGE_REQUEST};
use crate::errors::{MergeError, StoreError};
use crate::mail::{Draft, MailBus};
use crate::town::{MergeStrategy, RigConfig, Tunables};

pub use git::{GitWorkspace, RebaseOutcome};
pub use slot::MergeSlot;

/// Branch used to test a squashed preview without touching the target.
const PREVIEW_BRANCH: &str = "gt/squash-preview";

/// Notes keys used for semantic escalation bookkeeping.
const NOTE_SEMANTIC_ESCALATED: &str = "semantic-escalated-at";
const NOTE_SEMANTIC_RESOLVED: &str = "semantic-resolved";

/// Terminal result of processing one merge request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    Merged,
    /// A resolution task was filed and the MR is blocked on it.
    Conflict { task: String, files: Vec<String> },
    TestsFailed,
    /// Nothing ready to process.
    QueueEmpty,
    /// Contradicting structured changes; escalated and blocked on the slot.
    SemanticHold { contradictions: usize },
}

impl MergeOutcome {
    /// Stable exit codes: 0 merged, 1 conflict, 2 test failure, 3 queue
    /// empty, 4 infrastructure/blocked.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Merged => 0,
            Self::Conflict { .. } => 1,
            Self::TestsFailed => 2,
            Self::QueueEmpty => 3,
            Self::SemanticHold { .. } => 4,
        }
    }
}

pub struct Refinery {
    beads: Arc<Beads>,
    mail: Arc<MailBus>,
    rig_name: String,
    cfg: RigConfig,
    /// The refinery's checkout of the rig repository.
    repo_dir: PathBuf,
    slot: MergeSlot,
    /// Worker identity recorded on claims and slot holds.
    worker: String,
    tunables: Tunables,
}

impl Refinery {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        beads: Arc<Beads>,
        mail: Arc<MailBus>,
        rig_name: &str,
        cfg: RigConfig,
        repo_dir: PathBuf,
        refinery_bead: &str,
        worker: &str,
        tunables: Tunables,
    ) -> Self {
        let slot = MergeSlot::new(beads.clone(), rig_name, refinery_bead);
        Self {
            beads,
            mail,
            rig_name: rig_name.to_string(),
            cfg,
            repo_dir,
            slot,
            worker: worker.to_string(),
            tunables,
        }
    }

    pub fn slot(&self) -> &MergeSlot {
        &self.slot
    }

    // ── Queue operations ──────────────────────────────────────────────

    /// Create a merge-request bead for a finished work branch.
    pub fn create_merge_request(
        &self,
        source_branch: &str,
        target_branch: &str,
        source_issue: Option<&str>,
    ) -> Result<Bead, MergeError> {
        let id = format!(
            "{}-mr-{}",
            self.cfg.prefix,
            crate::beads::id::random_base36(6)
        );
        let bead = Bead::new(
            &id,
            &format!("merge {source_branch} into {target_branch}"),
            BeadType::MergeRequest,
        )
        .with_label(LABEL_MERGE_REQUEST)
        .with_fields(BeadFields::MergeRequest(MergeRequestFields {
            source_branch: source_branch.to_string(),
            target_branch: target_branch.to_string(),
            source_issue: source_issue.map(str::to_string),
            claimed_at: None,
            ready_at: Some(Utc::now()),
        }));
        Ok(self.beads.create(&bead)?)
    }

    /// MRs ready for processing: labeled, open, unclaimed, no open
    /// blockers. FIFO by `ready_at`.
    pub fn list_ready(&self) -> Result<Vec<Bead>, MergeError> {
        let ready = self.beads.ready(&self.cfg.prefix, None)?;
        let mut mrs: Vec<Bead> = ready
            .into_iter()
            .filter(|b| {
                b.bead_type == BeadType::MergeRequest
                    && b.has_label(LABEL_MERGE_REQUEST)
                    && b.assignee.is_none()
            })
            .collect();
        mrs.sort_by_key(|b| {
            b.fields
                .as_merge_request()
                .and_then(|f| f.ready_at)
                .unwrap_or(b.created_at)
        });
        Ok(mrs)
    }

    /// Compare-and-set claim; the store's serialized writer makes this
    /// atomic.
    pub fn claim(&self, mr_id: &str, worker: &str) -> Result<Bead, MergeError> {
        let worker_owned = worker.to_string();
        let mut taken_by: Option<String> = None;
        let updated = self.beads.update(mr_id, |b| {
            if let Some(existing) = &b.assignee {
                taken_by = Some(existing.clone());
                return;
            }
            b.assignee = Some(worker_owned.clone());
            if let BeadFields::MergeRequest(f) = &mut b.fields {
                f.claimed_at = Some(Utc::now());
            }
        })?;
        if let Some(existing) = taken_by {
            return Err(MergeError::AlreadyClaimed {
                id: mr_id.to_string(),
                worker: existing,
            });
        }
        Ok(updated)
    }

    pub fn release_claim(&self, mr_id: &str) -> Result<(), MergeError> {
        self.beads.update(mr_id, |b| {
            b.assignee = None;
            if let BeadFields::MergeRequest(f) = &mut b.fields {
                f.claimed_at = None;
            }
        })?;
        Ok(())
    }

    /// Claim and process the next ready MR. `QueueEmpty` when nothing is
    /// ready.
    pub async fn process_next(&self) -> Result<MergeOutcome, MergeError> {
        let Some(next) = self.list_ready()?.into_iter().next() else {
            return Ok(MergeOutcome::QueueEmpty);
        };
        self.claim(&next.id, &self.worker)?;
        self.process(&next.id).await
    }

    /// Run the configured strategy against one claimed MR. The claim is
    /// always released on exit; infrastructure errors leave the MR state
    /// untouched.
    pub async fn process(&self, mr_id: &str) -> Result<MergeOutcome, MergeError> {
        let result = self.process_inner(mr_id).await;
        // Merged/rejected MRs are closed by the handlers below; a released
        // claim on a closed bead is harmless.
        if let Err(e) = self.release_claim(mr_id) {
            warn!(mr = mr_id, error = %e, "claim release failed");
        }
        result
    }

    async fn process_inner(&self, mr_id: &str) -> Result<MergeOutcome, MergeError> {
        let mr = self.beads.show(mr_id)?;
        let fields = mr
            .fields
            .as_merge_request()
            .cloned()
            .ok_or_else(|| MergeError::NotReady { id: mr_id.to_string() })?;
        if mr.status == BeadStatus::Closed {
            return Err(MergeError::NotReady { id: mr_id.to_string() });
        }

        if self.cfg.semantic_merge
            && let Some(hold) = self.semantic_gate(&mr, &fields)?
        {
            return Ok(hold);
        }

        match self.cfg.merge_strategy {
            MergeStrategy::RebaseFf => self.process_rebase_ff(&mr, &fields).await,
            MergeStrategy::Squash => self.process_squash(&mr, &fields).await,
        }
    }

    // ── rebase-ff (production default) ────────────────────────────────

    async fn process_rebase_ff(
        &self,
        mr: &Bead,
        fields: &MergeRequestFields,
    ) -> Result<MergeOutcome, MergeError> {
        let ws = GitWorkspace::open(&self.repo_dir)?;
        let target = &fields.target_branch;
        let source = &fields.source_branch;

        ws.fetch("origin", target)?;
        let onto = format!("origin/{target}");

        match ws.rebase_onto(source, &onto)? {
            RebaseOutcome::Conflict { files } => {
                return self.handle_conflict(mr, fields, files).await;
            }
            RebaseOutcome::Clean => {}
        }

        if !self.run_tests(&ws).await? {
            return self.handle_tests_failed(mr, fields).await;
        }

        ws.fast_forward_to(target, &onto)?;
        ws.ff_merge(target, source)?;
        ws.push("origin", target)?;
        self.handle_merged(mr, fields, &ws)?;
        Ok(MergeOutcome::Merged)
    }

    // ── squash (legacy) ───────────────────────────────────────────────

    async fn process_squash(
        &self,
        mr: &Bead,
        fields: &MergeRequestFields,
    ) -> Result<MergeOutcome, MergeError> {
        let ws = GitWorkspace::open(&self.repo_dir)?;
        let target = &fields.target_branch;
        let source = &fields.source_branch;

        ws.fetch("origin", target)?;
        ws.fast_forward_to(target, &format!("origin/{target}"))?;

        let conflicts = ws.conflict_check(target, source)?;
        if !conflicts.is_empty() {
            return self.handle_conflict(mr, fields, conflicts).await;
        }

        if self.cfg.test_command.is_some() {
            // Test the squashed preview without touching the target.
            ws.create_branch_at(PREVIEW_BRANCH, target)?;
            ws.squash_merge(PREVIEW_BRANCH, source, "squash preview")?;
            let passed = self.run_tests(&ws).await?;
            ws.checkout_branch(target)?;
            ws.delete_local_branch(PREVIEW_BRANCH)?;
            if !passed {
                return self.handle_tests_failed(mr, fields).await;
            }
        }

        ws.squash_merge(target, source, &format!("{} (squash of {source})", mr.title))?;
        ws.push("origin", target)?;
        self.handle_merged(mr, fields, &ws)?;
        Ok(MergeOutcome::Merged)
    }

    // ── Shared steps ──────────────────────────────────────────────────

    /// Run the rig's test command in the checkout. No command configured
    /// means tests pass. A timeout counts as failure.
    async fn run_tests(&self, ws: &GitWorkspace) -> Result<bool, MergeError> {
        let Some(cmd) = &self.cfg.test_command else {
            return Ok(true);
        };
        let timeout = std::time::Duration::from_secs(self.tunables.test_timeout_secs);
        let mut child = tokio::process::Command::new("sh");
        child.arg("-c").arg(cmd).current_dir(ws.path());
        let run = async {
            child
                .output()
                .await
                .map_err(|e| MergeError::Infra(format!("test command: {e}")))
        };
        match tokio::time::timeout(timeout, run).await {
            Ok(output) => Ok(output?.status.success()),
            Err(_) => {
                warn!(rig = %self.rig_name, "test command timed out");
                Ok(false)
            }
        }
    }

    fn handle_merged(
        &self,
        mr: &Bead,
        fields: &MergeRequestFields,
        ws: &GitWorkspace,
    ) -> Result<(), MergeError> {
        self.beads.close(&mr.id, Some("merged"))?;
        if let Some(issue) = &fields.source_issue {
            if fields.target_branch == self.cfg.default_branch {
                // Landed on the default branch: the work is done.
                match self.beads.close(issue, Some("merged")) {
                    Ok(_) | Err(StoreError::NotFound { .. }) => {}
                    Err(e) => return Err(e.into()),
                }
            }
            // Integration-branch merges leave the source issue open.
        }
        let source = &fields.source_branch;
        if let Err(e) = ws.delete_local_branch(source) {
            warn!(branch = %source, error = %e, "local branch cleanup failed");
        }
        if let Err(e) = ws.delete_remote_branch("origin", source) {
            warn!(branch = %source, error = %e, "remote branch cleanup failed");
        }
        info!(mr = %mr.id, target = %fields.target_branch, "merged");
        Ok(())
    }

    /// Conflict: file a resolution task, block the MR on it, take the merge
    /// slot, and tell the witness. The source branch is retained.
    async fn handle_conflict(
        &self,
        mr: &Bead,
        fields: &MergeRequestFields,
        files: Vec<String>,
    ) -> Result<MergeOutcome, MergeError> {
        let task_id = format!(
            "{}-task-{}",
            self.cfg.prefix,
            crate::beads::id::random_base36(6)
        );
        let task = Bead::new(
            &task_id,
            &format!("resolve merge conflict for {}", mr.id),
            BeadType::Task,
        )
        .with_priority(0)
        .with_description(&format!(
            "Rebase of `{source}` onto `{target}` hit conflicts.\n\n\
             ## Metadata\n\
             - merge_request: {mr_id}\n\
             - source_branch: {source}\n\
             - target_branch: {target}\n\
             - conflicting_files: {files}\n",
            source = fields.source_branch,
            target = fields.target_branch,
            mr_id = mr.id,
            files = files.join(", "),
        ));
        self.beads.create(&task)?;
        self.beads.add_dependency(&mr.id, &task_id)?;
        self.slot
            .acquire(&self.worker, &format!("conflict resolution for {}", mr.id))?;
        self.send_merge_failed(mr, &format!("conflict in {}", files.join(", ")))
            .await;
        info!(mr = %mr.id, task = %task_id, "conflict task filed");
        Ok(MergeOutcome::Conflict {
            task: task_id,
            files,
        })
    }

    /// Tests failed: reopen the source issue, reject the MR, keep the
    /// branch for debugging.
    async fn handle_tests_failed(
        &self,
        mr: &Bead,
        fields: &MergeRequestFields,
    ) -> Result<MergeOutcome, MergeError> {
        if let Some(issue) = &fields.source_issue {
            match self.beads.update(issue, |b| {
                b.status = BeadStatus::Open;
                b.closed_at = None;
                b.close_reason = None;
            }) {
                Ok(_) | Err(StoreError::NotFound { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }
        self.beads.close(&mr.id, Some("rejected: tests failed"))?;
        self.send_merge_failed(mr, "tests failed on rebased branch").await;
        info!(mr = %mr.id, "rejected, tests failed");
        Ok(MergeOutcome::TestsFailed)
    }

    async fn send_merge_failed(&self, mr: &Bead, detail: &str) {
        let draft = Draft {
            from: format!("{}/refinery", self.rig_name),
            to: vec![format!("{}/witness", self.rig_name)],
            subject: format!("MERGE_FAILED: {}", mr.id),
            body: detail.to_string(),
            ..Default::default()
        };
        if let Err(e) = self.mail.send(&draft).await {
            warn!(mr = %mr.id, error = %e, "witness unreachable for MERGE_FAILED");
        }
    }

    // ── Semantic conflicts (opt-in) ───────────────────────────────────

    /// Detect contradicting `BEAD_CHANGES` blocks between this MR and other
    /// open MRs to the same target. First detection escalates to the mayor
    /// under the merge slot; a timed-out escalation falls back to
    /// last-write-wins.
    fn semantic_gate(
        &self,
        mr: &Bead,
        fields: &MergeRequestFields,
    ) -> Result<Option<MergeOutcome>, MergeError> {
        if mr.notes.contains_key(NOTE_SEMANTIC_RESOLVED) {
            return Ok(None);
        }
        if let Some(raw) = mr.notes.get(NOTE_SEMANTIC_ESCALATED) {
            let escalated_at = chrono::DateTime::parse_from_rfc3339(raw)
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now());
            let deadline =
                escalated_at + chrono::Duration::seconds(self.tunables.semantic_timeout_secs as i64);
            if Utc::now() >= deadline {
                // Last-write-wins fallback: record it and release the slot.
                self.beads.update(&mr.id, |b| {
                    b.notes.insert(
                        NOTE_SEMANTIC_RESOLVED.into(),
                        "last-write-wins after escalation timeout".into(),
                    );
                })?;
                let _ = self.slot.release(&self.worker);
                return Ok(None);
            }
            // Still waiting on the mayor.
            let n = mr
                .notes
                .get("semantic-contradictions")
                .and_then(|v| v.parse().ok())
                .unwrap_or(1);
            return Ok(Some(MergeOutcome::SemanticHold { contradictions: n }));
        }

        let ws = GitWorkspace::open(&self.repo_dir)?;
        let ours = semantic::scan_messages(
            &ws.messages_ahead(&fields.source_branch, &fields.target_branch)?,
        );
        if ours.is_empty() {
            return Ok(None);
        }

        let mut found = Vec::new();
        for other in self.open_mrs_to_target(&fields.target_branch)? {
            if other.id == mr.id {
                continue;
            }
            let Some(of) = other.fields.as_merge_request() else {
                continue;
            };
            let theirs = match ws.messages_ahead(&of.source_branch, &of.target_branch) {
                Ok(messages) => semantic::scan_messages(&messages),
                Err(_) => continue,
            };
            found.extend(semantic::contradictions(&ours, &theirs));
        }
        if found.is_empty() {
            return Ok(None);
        }

        self.slot
            .acquire(&self.worker, &format!("semantic arbitration for {}", mr.id))?;
        let count = found.len();
        let summary = serde_json::to_string(&found).unwrap_or_default();
        self.beads.update(&mr.id, |b| {
            b.notes
                .insert(NOTE_SEMANTIC_ESCALATED.into(), Utc::now().to_rfc3339());
            b.notes
                .insert("semantic-contradictions".into(), count.to_string());
        })?;
        // Escalation mail is fire-and-forget; the hold itself is the gate.
        let mail = self.mail.clone();
        let draft = Draft {
            from: format!("{}/refinery", self.rig_name),
            to: vec!["*/mayor".into()],
            subject: format!("semantic conflict on {}", mr.id),
            body: summary,
            ..Default::default()
        };
        tokio::spawn(async move {
            if let Err(e) = mail.send(&draft).await {
                warn!(error = %e, "mayor unreachable for semantic escalation");
            }
        });
        info!(mr = %mr.id, count, "semantic conflict escalated");
        Ok(Some(MergeOutcome::SemanticHold {
            contradictions: count,
        }))
    }

    /// Record the mayor's arbitration and release the slot; the next
    /// process pass proceeds.
    pub fn record_semantic_resolution(
        &self,
        mr_id: &str,
        rationale: &str,
    ) -> Result<(), MergeError> {
        let rationale = rationale.to_string();
        self.beads.update(mr_id, |b| {
            b.notes.insert(NOTE_SEMANTIC_RESOLVED.into(), rationale.clone());
        })?;
        let _ = self.slot.release(&self.worker)?;
        Ok(())
    }

    fn open_mrs_to_target(&self, target: &str) -> Result<Vec<Bead>, MergeError> {
        let open = self.beads.list(
            &self.cfg.prefix,
            &ListFilter::open().with_type(BeadType::MergeRequest),
        )?;
        Ok(open
            .into_iter()
            .filter(|b| {
                b.fields
                    .as_merge_request()
                    .map(|f| f.target_branch == target)
                    .unwrap_or(false)
            })
            .collect())
    }
}
