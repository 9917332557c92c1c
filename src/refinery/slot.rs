//! The rig-wide merge slot.
//!
//! A named mutex persisted on the refinery's agent bead, so holders survive
//! process restarts and stay auditable. The slot serializes conflict
//! resolution and semantic arbitration; independent clean merges never take
//! it. Waiters queue FIFO and are promoted on release.

use std::sync::Arc;

use chrono::Utc;
use tracing::info;

use crate::beads::types::MergeSlotState;
use crate::beads::Beads;
use crate::errors::MergeError;

pub struct MergeSlot {
    beads: Arc<Beads>,
    /// Bead ID of the rig's refinery agent.
    refinery_bead: String,
    rig: String,
}

impl MergeSlot {
    pub fn new(beads: Arc<Beads>, rig: &str, refinery_bead: &str) -> Self {
        Self {
            beads,
            refinery_bead: refinery_bead.to_string(),
            rig: rig.to_string(),
        }
    }

    /// Try to take the slot. Returns `true` when held by `holder` after the
    /// call; `false` means the holder was queued as a waiter. Re-acquiring
    /// a slot you already hold succeeds.
    pub fn acquire(&self, holder: &str, reason: &str) -> Result<bool, MergeError> {
        let holder_owned = holder.to_string();
        let reason_owned = reason.to_string();
        let mut acquired = false;
        self.beads.update(&self.refinery_bead, |b| {
            let Some(fields) = b.fields.as_agent_mut() else {
                return;
            };
            let slot = fields.merge_slot.get_or_insert_with(MergeSlotState::default);
            match &slot.holder {
                None => {
                    slot.holder = Some(holder_owned.clone());
                    slot.reason = Some(reason_owned.clone());
                    slot.acquired_at = Some(Utc::now());
                    slot.waiters.retain(|w| w != &holder_owned);
                    acquired = true;
                }
                Some(current) if current == &holder_owned => {
                    acquired = true;
                }
                Some(_) => {
                    if !slot.waiters.contains(&holder_owned) {
                        slot.waiters.push(holder_owned.clone());
                    }
                }
            }
        })?;
        if acquired {
            info!(rig = %self.rig, holder, reason, "merge slot acquired");
        }
        Ok(acquired)
    }

    /// Release the slot; the oldest waiter (if any) is promoted and
    /// returned. Releasing a slot you do not hold is an error.
    pub fn release(&self, holder: &str) -> Result<Option<String>, MergeError> {
        let state = self.status()?;
        match &state.holder {
            Some(current) if current == holder => {}
            Some(current) => {
                return Err(MergeError::SlotHeld {
                    rig: self.rig.clone(),
                    holder: current.clone(),
                });
            }
            None => return Ok(None),
        }

        let mut promoted = None;
        self.beads.update(&self.refinery_bead, |b| {
            let Some(fields) = b.fields.as_agent_mut() else {
                return;
            };
            let Some(slot) = &mut fields.merge_slot else {
                return;
            };
            if slot.waiters.is_empty() {
                slot.holder = None;
                slot.reason = None;
                slot.acquired_at = None;
            } else {
                let next = slot.waiters.remove(0);
                slot.holder = Some(next.clone());
                slot.reason = Some("promoted from wait queue".into());
                slot.acquired_at = Some(Utc::now());
                promoted = Some(next);
            }
        })?;
        info!(rig = %self.rig, holder, promoted = ?promoted, "merge slot released");
        Ok(promoted)
    }

    pub fn status(&self) -> Result<MergeSlotState, MergeError> {
        let bead = self.beads.show(&self.refinery_bead)?;
        Ok(bead
            .fields
            .as_agent()
            .and_then(|f| f.merge_slot.clone())
            .unwrap_or_default())
    }
}
