//! Work scheduler: hooks, molecule continuation, convoy landing.
//!
//! A hook is the association between an agent and its current work bead.
//! Molecules are parent beads whose children run in order; closing a child
//! with `continue` advances the molecule by hooking the next ready child to
//! the same agent. Convoys land automatically when every tracked bead is
//! closed.

use std::sync::Arc;

use tracing::info;

use crate::beads::{
    Bead, BeadFields, BeadStatus, BeadType, Beads, ConvoyFields, ListFilter,
};
use crate::errors::{SchedError, StoreError};
use crate::inject::{EntryKind, Injector};

pub struct Scheduler {
    beads: Arc<Beads>,
    injector: Arc<Injector>,
}

impl Scheduler {
    pub fn new(beads: Arc<Beads>, injector: Arc<Injector>) -> Self {
        Self { beads, injector }
    }

    // ── Hooks ─────────────────────────────────────────────────────────

    /// Atomically hook a bead to an agent and notify the agent's session.
    pub async fn hook(&self, agent_id: &str, bead_id: &str) -> Result<(), SchedError> {
        let bead = self.beads.show(bead_id)?;
        if bead.status == BeadStatus::Hooked {
            return Err(SchedError::HookBusy {
                id: bead_id.to_string(),
            });
        }
        let agent = self.beads.show(agent_id)?;
        if let Some(current) = agent.fields.as_agent().and_then(|f| f.hook_bead.clone())
            && self
                .beads
                .get(&current)?
                .map(|b| b.status == BeadStatus::Hooked)
                .unwrap_or(false)
        {
            return Err(SchedError::HookBusy { id: current });
        }

        let address = agent.agent_address().unwrap_or_else(|| agent_id.to_string());
        self.beads.update(bead_id, |b| {
            b.status = BeadStatus::Hooked;
            b.assignee = Some(address.clone());
        })?;
        let bead_owned = bead_id.to_string();
        self.beads.update(agent_id, |b| {
            if let Some(f) = b.fields.as_agent_mut() {
                f.hook_bead = Some(bead_owned.clone());
            }
        })?;
        self.injector
            .enqueue(
                agent_id,
                EntryKind::Nudge,
                &format!("hooked {bead_id}: {}", bead.title),
            )
            .await?;
        info!(agent = agent_id, bead = bead_id, "hooked");
        Ok(())
    }

    /// Clear an agent's hook; the bead returns to the ready pool.
    pub async fn unhook(&self, agent_id: &str) -> Result<String, SchedError> {
        let agent = self.beads.show(agent_id)?;
        let Some(bead_id) = agent.fields.as_agent().and_then(|f| f.hook_bead.clone()) else {
            return Err(SchedError::NothingHooked {
                agent: agent_id.to_string(),
            });
        };
        self.release_hook(agent_id, &bead_id)?;
        Ok(bead_id)
    }

    /// Shared by unhook and the control loop's dead-agent path.
    pub fn release_hook(&self, agent_id: &str, bead_id: &str) -> Result<(), SchedError> {
        if let Some(bead) = self.beads.get(bead_id)?
            && bead.status == BeadStatus::Hooked
        {
            self.beads.update(bead_id, |b| {
                b.status = BeadStatus::Open;
                b.assignee = None;
            })?;
        }
        self.beads.update(agent_id, |b| {
            if let Some(f) = b.fields.as_agent_mut() {
                f.hook_bead = None;
            }
        })?;
        Ok(())
    }

    // ── Continuation ──────────────────────────────────────────────────

    /// Close a bead and, when its parent is a molecule, hook the next ready
    /// child to the same agent. Returns the next hooked bead, if any.
    /// Continuation on an already-closed bead is a no-op success.
    pub async fn continue_bead(&self, bead_id: &str) -> Result<Option<String>, SchedError> {
        let bead = self.beads.show(bead_id)?;
        if bead.status == BeadStatus::Closed {
            return Ok(None);
        }

        let agent = self.agent_hooked_to(bead_id)?;
        self.beads.close(bead_id, None)?;
        if let Some(agent_id) = &agent {
            self.beads.update(agent_id, |b| {
                if let Some(f) = b.fields.as_agent_mut()
                    && f.hook_bead.as_deref() == Some(bead_id)
                {
                    f.hook_bead = None;
                }
            })?;
        }
        self.land_convoys(bead_id)?;

        let Some(parent_id) = bead.parent else {
            return Ok(None);
        };
        let Some(parent) = self.beads.get(&parent_id)? else {
            return Ok(None);
        };
        if parent.bead_type != BeadType::Molecule {
            return Ok(None);
        }
        let Some(next) = self.next_ready_child(&parent_id)? else {
            return Ok(None);
        };
        // Continuation never crosses molecule boundaries and only follows
        // the agent that finished the previous step.
        if let Some(agent_id) = agent {
            self.hook(&agent_id, &next.id).await?;
            return Ok(Some(next.id));
        }
        Ok(Some(next.id))
    }

    /// The next child of a molecule to run: lowest creation order among
    /// open children with no open blockers; priority breaks ties.
    pub fn next_ready_child(&self, molecule_id: &str) -> Result<Option<Bead>, SchedError> {
        let parsed = crate::beads::BeadId::parse(molecule_id)?;
        let mut ready = self.beads.ready(parsed.prefix(), Some(molecule_id))?;
        ready.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then(a.priority.cmp(&b.priority))
        });
        Ok(ready.into_iter().next())
    }

    fn agent_hooked_to(&self, bead_id: &str) -> Result<Option<String>, StoreError> {
        let agents = self
            .beads
            .list_all(&ListFilter::open().with_type(BeadType::Agent))?;
        Ok(agents
            .into_iter()
            .find(|a| {
                a.fields
                    .as_agent()
                    .map(|f| f.hook_bead.as_deref() == Some(bead_id))
                    .unwrap_or(false)
            })
            .map(|a| a.id))
    }

    // ── Convoys ───────────────────────────────────────────────────────

    /// Create a convoy tracking a set of beads.
    pub fn create_convoy(
        &self,
        id: &str,
        title: &str,
        tracked: Vec<String>,
    ) -> Result<Bead, SchedError> {
        let bead = Bead::new(id, title, BeadType::Convoy)
            .with_fields(BeadFields::Convoy(ConvoyFields { tracked }));
        Ok(self.beads.create(&bead)?)
    }

    /// Land every open convoy whose tracked beads are now all closed.
    /// Called on each close; cheap because convoys are few.
    pub fn land_convoys(&self, _closed_id: &str) -> Result<Vec<String>, SchedError> {
        let convoys = self
            .beads
            .list_all(&ListFilter::open().with_type(BeadType::Convoy))?;
        let mut landed = Vec::new();
        for convoy in convoys {
            let BeadFields::Convoy(ConvoyFields { tracked }) = &convoy.fields else {
                continue;
            };
            if tracked.is_empty() {
                continue;
            }
            let mut all_closed = true;
            for id in tracked {
                match self.beads.get(id)? {
                    Some(b) if b.status == BeadStatus::Closed => {}
                    _ => {
                        all_closed = false;
                        break;
                    }
                }
            }
            if all_closed {
                self.beads.close(&convoy.id, Some("landed"))?;
                info!(convoy = %convoy.id, "convoy landed");
                landed.push(convoy.id);
            }
        }
        Ok(landed)
    }
}
