//! Request/response dispatch: the complete component API behind one op
//! table, shared by both transports.
//!
//! The daemon adds no business logic here; every op is a thin, authorized
//! call into C1-C8. Payloads are typed per op and malformed payloads fail
//! as envelope errors, not panics.

use serde::Deserialize;
use serde_json::{Value, json};

use crate::beads::{Bead, BeadStatus, BeadType, ChannelFields, ListFilter, LABEL_MERGE_REQUEST};
use crate::daemon::DaemonState;
use crate::daemon::proto::{Request, Response};
use crate::decision::DecisionRequest;
use crate::errors::{DaemonError, GtError};
use crate::inject::EntryKind;
use crate::mail::Draft;

/// Dispatch one request. Authorization happens before any op other than
/// `health` runs.
pub async fn dispatch(state: &DaemonState, req: Request) -> Response {
    if req.op != "health" && req.token.as_deref() != Some(state.token.as_str()) {
        return Response::err(&req.id, &GtError::from(DaemonError::Forbidden));
    }
    match route(state, &req).await {
        Ok(data) => Response::ok(&req.id, data),
        Err(e) => Response::err(&req.id, &e),
    }
}

fn parse<T: serde::de::DeserializeOwned>(payload: &Value) -> Result<T, GtError> {
    serde_json::from_value(payload.clone())
        .map_err(|e| GtError::from(DaemonError::BadEnvelope(e.to_string())))
}

fn bead_json(bead: &Bead) -> Value {
    serde_json::to_value(bead).unwrap_or(Value::Null)
}

fn beads_json(beads: &[Bead]) -> Value {
    Value::Array(beads.iter().map(bead_json).collect())
}

async fn route(state: &DaemonState, req: &Request) -> Result<Value, GtError> {
    match req.op.as_str() {
        "health" => Ok(json!({
            "status": "ok",
            "town": state.town_name,
            "routes": state.beads.routes().prefixes(),
        })),

        // ── C1: issue store ───────────────────────────────────────────
        "bead.create" => {
            #[derive(Deserialize)]
            struct P {
                id: String,
                title: String,
                #[serde(rename = "type")]
                bead_type: Option<String>,
                #[serde(default)]
                description: String,
                priority: Option<i64>,
                #[serde(default)]
                labels: Vec<String>,
                parent: Option<String>,
                created_by: Option<String>,
            }
            let p: P = parse(&req.payload)?;
            let bead_type = match p.bead_type.as_deref() {
                Some(raw) => BeadType::parse(raw).ok_or_else(|| {
                    GtError::from(DaemonError::BadEnvelope(format!("unknown type '{raw}'")))
                })?,
                None => BeadType::Task,
            };
            let mut bead = Bead::new(&p.id, &p.title, bead_type).with_description(&p.description);
            if let Some(priority) = p.priority {
                bead.priority = priority;
            }
            for label in p.labels {
                bead.labels.insert(label);
            }
            bead.parent = p.parent;
            bead.created_by = p.created_by;
            Ok(bead_json(&state.beads.create(&bead)?))
        }
        "bead.show" => {
            #[derive(Deserialize)]
            struct P {
                id: String,
            }
            let p: P = parse(&req.payload)?;
            Ok(bead_json(&state.beads.show(&p.id)?))
        }
        "bead.list" => {
            #[derive(Deserialize)]
            struct P {
                prefix: String,
                status: Option<String>,
                #[serde(rename = "type")]
                bead_type: Option<String>,
                label: Option<String>,
            }
            let p: P = parse(&req.payload)?;
            let mut filter = ListFilter::default();
            if let Some(raw) = p.status.as_deref() {
                filter.status = BeadStatus::parse(raw);
            }
            if let Some(raw) = p.bead_type.as_deref() {
                filter.bead_type = BeadType::parse(raw);
            }
            filter.label = p.label;
            Ok(beads_json(&state.beads.list(&p.prefix, &filter)?))
        }
        "bead.ready" => {
            #[derive(Deserialize)]
            struct P {
                prefix: String,
                parent: Option<String>,
            }
            let p: P = parse(&req.payload)?;
            Ok(beads_json(&state.beads.ready(&p.prefix, p.parent.as_deref())?))
        }
        "bead.close" => {
            #[derive(Deserialize)]
            struct P {
                id: String,
                reason: Option<String>,
            }
            let p: P = parse(&req.payload)?;
            let closed = state.beads.close(&p.id, p.reason.as_deref())?;
            state.sched.land_convoys(&p.id)?;
            Ok(bead_json(&closed))
        }
        "bead.update" => {
            #[derive(Deserialize)]
            struct P {
                id: String,
                title: Option<String>,
                description: Option<String>,
                priority: Option<i64>,
                assignee: Option<String>,
                #[serde(default)]
                add_labels: Vec<String>,
                #[serde(default)]
                remove_labels: Vec<String>,
            }
            let p: P = parse(&req.payload)?;
            let updated = state.beads.update(&p.id, |b| {
                if let Some(title) = &p.title {
                    b.title = title.clone();
                }
                if let Some(description) = &p.description {
                    b.description = description.clone();
                }
                if let Some(priority) = p.priority {
                    b.priority = priority;
                }
                if let Some(assignee) = &p.assignee {
                    b.assignee = Some(assignee.clone());
                }
                for label in &p.add_labels {
                    b.labels.insert(label.clone());
                }
                for label in &p.remove_labels {
                    b.labels.remove(label);
                }
            })?;
            Ok(bead_json(&updated))
        }
        "bead.dep.add" => {
            #[derive(Deserialize)]
            struct P {
                blocked: String,
                blocker: String,
            }
            let p: P = parse(&req.payload)?;
            state.beads.add_dependency(&p.blocked, &p.blocker)?;
            Ok(json!({ "blocked": p.blocked, "blocker": p.blocker }))
        }
        "bead.label.list" => {
            #[derive(Deserialize)]
            struct P {
                prefix: String,
                label: String,
            }
            let p: P = parse(&req.payload)?;
            Ok(beads_json(&state.beads.list_by_label(&p.prefix, &p.label)?))
        }

        // ── C2: mail ──────────────────────────────────────────────────
        "mail.send" => {
            #[derive(Deserialize)]
            struct P {
                from: String,
                to: Vec<String>,
                #[serde(default)]
                subject: String,
                #[serde(default)]
                body: String,
                thread_id: Option<String>,
                priority: Option<i64>,
            }
            let p: P = parse(&req.payload)?;
            let ids = state
                .mail
                .send(&Draft {
                    from: p.from,
                    to: p.to,
                    subject: p.subject,
                    body: p.body,
                    thread_id: p.thread_id,
                    priority: p.priority,
                    attachments: Vec::new(),
                })
                .await?;
            Ok(json!({ "message_ids": ids }))
        }
        "mail.inbox" => {
            #[derive(Deserialize)]
            struct P {
                address: String,
                #[serde(default)]
                unread: bool,
            }
            let p: P = parse(&req.payload)?;
            Ok(beads_json(&state.mail.inbox(&p.address, p.unread)?))
        }
        "mail.claim" => {
            #[derive(Deserialize)]
            struct P {
                queue: String,
                worker: String,
            }
            let p: P = parse(&req.payload)?;
            Ok(match state.mail.claim(&p.queue, &p.worker)? {
                Some(bead) => bead_json(&bead),
                None => Value::Null,
            })
        }
        "mail.revoke" => {
            #[derive(Deserialize)]
            struct P {
                id: String,
                sender: String,
            }
            let p: P = parse(&req.payload)?;
            state.mail.revoke(&p.id, &p.sender)?;
            Ok(json!({ "revoked": p.id }))
        }
        "mail.ack" => {
            #[derive(Deserialize)]
            struct P {
                id: String,
                reader: String,
            }
            let p: P = parse(&req.payload)?;
            state.mail.ack(&p.id, &p.reader)?;
            Ok(json!({ "acked": p.id }))
        }
        "group.create" => {
            #[derive(Deserialize)]
            struct P {
                name: String,
                #[serde(default)]
                members: Vec<String>,
            }
            let p: P = parse(&req.payload)?;
            Ok(bead_json(&state.mail.create_group(&p.name, p.members)?))
        }
        "queue.create" => {
            #[derive(Deserialize)]
            struct P {
                name: String,
            }
            let p: P = parse(&req.payload)?;
            Ok(bead_json(&state.mail.create_queue(&p.name)?))
        }
        "channel.create" => {
            #[derive(Deserialize)]
            struct P {
                name: String,
                #[serde(default)]
                retention_count: u64,
                #[serde(default)]
                retention_secs: u64,
                #[serde(default)]
                retention_required: bool,
            }
            let p: P = parse(&req.payload)?;
            Ok(bead_json(&state.mail.create_channel(
                &p.name,
                ChannelFields {
                    retention_count: p.retention_count,
                    retention_secs: p.retention_secs,
                    retention_required: p.retention_required,
                },
            )?))
        }

        // ── C3: injection ─────────────────────────────────────────────
        "inject.enqueue" => {
            #[derive(Deserialize)]
            struct P {
                session: String,
                kind: String,
                content: String,
            }
            let p: P = parse(&req.payload)?;
            let kind = EntryKind::parse(&p.kind).ok_or_else(|| {
                GtError::from(DaemonError::BadEnvelope(format!("unknown kind '{}'", p.kind)))
            })?;
            state.injector.enqueue(&p.session, kind, &p.content).await?;
            Ok(json!({ "enqueued": p.session }))
        }
        "inject.drain" => {
            #[derive(Deserialize)]
            struct P {
                session: String,
            }
            let p: P = parse(&req.payload)?;
            let entries = state.injector.drain(&p.session).await?;
            Ok(serde_json::to_value(entries).unwrap_or(Value::Null))
        }

        // ── C6: scheduler ─────────────────────────────────────────────
        "sched.hook" => {
            #[derive(Deserialize)]
            struct P {
                agent: String,
                bead: String,
            }
            let p: P = parse(&req.payload)?;
            state.sched.hook(&p.agent, &p.bead).await?;
            Ok(json!({ "agent": p.agent, "bead": p.bead }))
        }
        "sched.unhook" => {
            #[derive(Deserialize)]
            struct P {
                agent: String,
            }
            let p: P = parse(&req.payload)?;
            let released = state.sched.unhook(&p.agent).await?;
            Ok(json!({ "released": released }))
        }
        "sched.continue" => {
            #[derive(Deserialize)]
            struct P {
                bead: String,
            }
            let p: P = parse(&req.payload)?;
            let next = state.sched.continue_bead(&p.bead).await?;
            Ok(json!({ "next": next }))
        }

        // ── C7: merge queue queries ───────────────────────────────────
        "mq.ready" => {
            #[derive(Deserialize)]
            struct P {
                prefix: String,
            }
            let p: P = parse(&req.payload)?;
            let ready = state.beads.ready(&p.prefix, None)?;
            let mrs: Vec<Bead> = ready
                .into_iter()
                .filter(|b| {
                    b.bead_type == BeadType::MergeRequest
                        && b.has_label(LABEL_MERGE_REQUEST)
                        && b.assignee.is_none()
                })
                .collect();
            Ok(beads_json(&mrs))
        }

        // ── C8: decisions ─────────────────────────────────────────────
        "decision.request" => {
            let p: DecisionPayload = parse(&req.payload)?;
            let bead = state.decisions.request(p.into_request()).await?;
            Ok(bead_json(&bead))
        }
        "decision.resolve" => {
            #[derive(Deserialize)]
            struct P {
                id: String,
                choice: u32,
                rationale: Option<String>,
                resolved_by: String,
            }
            let p: P = parse(&req.payload)?;
            let bead = state
                .decisions
                .resolve(&p.id, p.choice, p.rationale.as_deref(), &p.resolved_by)
                .await?;
            Ok(bead_json(&bead))
        }
        "decision.respond_text" => {
            #[derive(Deserialize)]
            struct P {
                id: String,
                text: String,
                resolved_by: String,
            }
            let p: P = parse(&req.payload)?;
            let bead = state
                .decisions
                .respond_text(&p.id, &p.text, &p.resolved_by)
                .await?;
            Ok(bead_json(&bead))
        }
        "decision.auto_close" => {
            #[derive(Deserialize)]
            struct P {
                threshold_secs: Option<u64>,
            }
            let p: P = parse(&req.payload)?;
            let threshold = chrono::Duration::seconds(
                p.threshold_secs
                    .unwrap_or(state.tunables.decision_auto_close_secs) as i64,
            );
            let closed = state.decisions.auto_close(threshold)?;
            Ok(json!({ "closed": closed }))
        }

        other => Err(GtError::from(DaemonError::UnknownOp {
            op: other.to_string(),
        })),
    }
}

/// Payload shape for `decision.request`, kept serde-friendly.
#[derive(Debug, Deserialize)]
struct DecisionPayload {
    requester: String,
    question: String,
    context: Option<String>,
    #[serde(default)]
    options: Vec<DecisionOptionPayload>,
    recommended_index: Option<u32>,
    urgency: Option<String>,
    #[serde(default)]
    blockers: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct DecisionOptionPayload {
    label: String,
    #[serde(default)]
    description: String,
}

impl DecisionPayload {
    fn into_request(self) -> DecisionRequest {
        DecisionRequest {
            requester: self.requester,
            question: self.question,
            context: self.context,
            options: self
                .options
                .into_iter()
                .map(|o| crate::beads::DecisionOption {
                    label: o.label,
                    description: o.description,
                    ..Default::default()
                })
                .collect(),
            recommended_index: self.recommended_index,
            urgency: self.urgency,
            blockers: self.blockers,
            ..Default::default()
        }
    }
}
