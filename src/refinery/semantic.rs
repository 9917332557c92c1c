//! Structured change blocks in commit messages.
//!
//! Agents annotate commits with `BEAD_CHANGES:` followed by one JSON object
//! describing field-level edits to a bead. The refinery scans unmerged
//! commits for these blocks to detect semantic conflicts between merge
//! requests. Absence of a block is normal; malformed JSON is ignored.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Marker scanned for in commit messages.
pub const BEAD_CHANGES_PREFIX: &str = "BEAD_CHANGES:";

/// One field-level edit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub old: Value,
    pub new: Value,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub reasoning: Option<String>,
}

/// All edits one commit declares against one bead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeadChanges {
    pub bead: String,
    #[serde(default)]
    pub fields: BTreeMap<String, FieldChange>,
}

/// Two merge requests writing different values to the same field of the
/// same bead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contradiction {
    pub bead: String,
    pub field: String,
    pub ours: Value,
    pub theirs: Value,
}

/// Extract every well-formed change block from a set of commit messages.
/// Partially-valid blocks are skipped, never an error.
pub fn scan_messages(messages: &[String]) -> Vec<BeadChanges> {
    let mut found = Vec::new();
    for message in messages {
        for (idx, _) in message.match_indices(BEAD_CHANGES_PREFIX) {
            let tail = &message[idx + BEAD_CHANGES_PREFIX.len()..];
            if let Some(changes) = parse_one_object(tail) {
                found.push(changes);
            }
        }
    }
    found
}

/// Parse exactly one JSON object from the front of `tail` (whitespace
/// tolerated). Trailing commit-message prose after the object is fine.
fn parse_one_object(tail: &str) -> Option<BeadChanges> {
    let trimmed = tail.trim_start();
    let mut stream = serde_json::Deserializer::from_str(trimmed).into_iter::<BeadChanges>();
    match stream.next() {
        Some(Ok(changes)) if !changes.bead.is_empty() => Some(changes),
        _ => None,
    }
}

/// Field-level contradictions between two change sets: same bead, same
/// field, different resulting values.
pub fn contradictions(ours: &[BeadChanges], theirs: &[BeadChanges]) -> Vec<Contradiction> {
    let mut out = Vec::new();
    for a in ours {
        for b in theirs.iter().filter(|b| b.bead == a.bead) {
            for (field, fa) in &a.fields {
                if let Some(fb) = b.fields.get(field)
                    && fa.new != fb.new
                {
                    out.push(Contradiction {
                        bead: a.bead.clone(),
                        field: field.clone(),
                        ours: fa.new.clone(),
                        theirs: fb.new.clone(),
                    });
                }
            }
        }
    }
    out
}
