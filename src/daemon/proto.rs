//! Wire envelopes for the daemon's two transports.
//!
//! Requests and responses are framed JSON objects; stream events carry a
//! per-subject monotonically increasing sequence number. A bounded replay
//! ring gives late subscribers a durable window.

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::GtError;

/// `{ op, id, payload }` plus the shared auth token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub op: String,
    pub id: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub token: Option<String>,
}

/// `{ id, ok, data | error }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub id: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

/// Error payload: stable code, one-line message, optional hints, exit code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub msg: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hint: Vec<String>,
    pub exit: i32,
}

impl Response {
    pub fn ok(id: &str, data: Value) -> Self {
        Self {
            id: id.to_string(),
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(id: &str, error: &GtError) -> Self {
        Self {
            id: id.to_string(),
            ok: false,
            data: None,
            error: Some(ErrorBody {
                code: error.code().to_string(),
                msg: error.to_string(),
                hint: error.hints(),
                exit: error.exit_code(),
            }),
        }
    }
}

/// `{ subject, seq, data }` with per-subject monotone `seq`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamEvent {
    pub subject: String,
    pub seq: u64,
    pub data: Value,
}

/// Bounded replay window plus per-subject sequence assignment.
pub struct ReplayBuffer {
    capacity: usize,
    events: VecDeque<StreamEvent>,
    next_seq: HashMap<String, u64>,
}

impl ReplayBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            events: VecDeque::new(),
            next_seq: HashMap::new(),
        }
    }

    /// Stamp an event with the subject's next sequence number and retain it
    /// in the window (oldest dropped at capacity).
    pub fn push(&mut self, subject: &str, data: Value) -> StreamEvent {
        let seq = self.next_seq.entry(subject.to_string()).or_insert(0);
        *seq += 1;
        let event = StreamEvent {
            subject: subject.to_string(),
            seq: *seq,
            data,
        };
        if self.events.len() == self.capacity {
            self.events.pop_front();
        }
        self.events.push_back(event.clone());
        event
    }

    /// Everything in the window, oldest first, optionally filtered by
    /// subject prefix.
    pub fn replay(&self, subject_prefix: Option<&str>) -> Vec<StreamEvent> {
        self.events
            .iter()
            .filter(|e| {
                subject_prefix
                    .map(|p| e.subject.starts_with(p))
                    .unwrap_or(true)
            })
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::StoreError;
    use serde_json::json;

    #[test]
    fn request_envelope_round_trips() {
        let raw = r#"{"op":"bead.show","id":"r1","payload":{"id":"gt-1"}}"#;
        let req: Request = serde_json::from_str(raw).unwrap();
        assert_eq!(req.op, "bead.show");
        assert_eq!(req.payload["id"], "gt-1");
        assert!(req.token.is_none());
    }

    #[test]
    fn error_response_carries_code_and_exit() {
        let err = GtError::from(StoreError::NoRoute { prefix: "zz".into() });
        let resp = Response::err("r2", &err);
        assert!(!resp.ok);
        let body = resp.error.unwrap();
        assert_eq!(body.code, "E_NO_ROUTE");
        assert_eq!(body.exit, 3);
        assert!(!body.hint.is_empty());
    }

    #[test]
    fn seq_is_monotone_per_subject() {
        let mut buf = ReplayBuffer::new(16);
        let a1 = buf.push("gt", json!({"n": 1}));
        let b1 = buf.push("hq", json!({"n": 2}));
        let a2 = buf.push("gt", json!({"n": 3}));
        assert_eq!(a1.seq, 1);
        assert_eq!(b1.seq, 1);
        assert_eq!(a2.seq, 2);
    }

    #[test]
    fn replay_window_is_bounded_and_ordered() {
        let mut buf = ReplayBuffer::new(3);
        for i in 0..5 {
            buf.push("gt", json!({ "n": i }));
        }
        let replay = buf.replay(None);
        assert_eq!(replay.len(), 3);
        assert_eq!(replay[0].data["n"], 2);
        assert_eq!(replay[2].data["n"], 4);
        // Sequence numbers keep counting even as the window slides.
        assert_eq!(replay[2].seq, 5);
    }

    #[test]
    fn replay_filters_by_subject_prefix() {
        let mut buf = ReplayBuffer::new(8);
        buf.push("gt", json!({}));
        buf.push("hq", json!({}));
        buf.push("gt", json!({}));
        assert_eq!(buf.replay(Some("gt")).len(), 2);
        assert_eq!(buf.replay(Some("hq")).len(), 1);
    }
}
