//! Mail bus: durable inter-agent messages over the bead store.
//!
//! Delivery is write-once: sending creates message beads, consumers read
//! their inbox (or claim from a queue). Direct and pattern addresses fan
//! out to active agents and nudge their injection queues; queue messages
//! wait for exactly one claimant; channel messages broadcast under the
//! channel's retention policy.

pub mod address;

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use chrono::Utc;
use tracing::debug;

use crate::beads::{
    Bead, BeadFields, BeadStatus, BeadType, Beads, ChannelFields, GroupFields, ListFilter,
    MessageFields, QueueFields, id::random_base36,
};
use crate::errors::{MailError, StoreError};
use crate::inject::{EntryKind, Injector};
use crate::town::TOWN_PREFIX;

pub use address::Address;

/// An outgoing message before resolution.
#[derive(Debug, Clone, Default)]
pub struct Draft {
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    pub body: String,
    pub thread_id: Option<String>,
    pub priority: Option<i64>,
    pub attachments: Vec<String>,
}

/// Terminal destinations after address resolution.
#[derive(Debug, Default)]
struct Resolution {
    /// Agent bead IDs with their addresses.
    agents: BTreeSet<(String, String)>,
    queues: BTreeSet<String>,
    channels: BTreeSet<String>,
}

pub struct MailBus {
    beads: Arc<Beads>,
    injector: Arc<Injector>,
}

impl MailBus {
    pub fn new(beads: Arc<Beads>, injector: Arc<Injector>) -> Self {
        Self { beads, injector }
    }

    // ── Sending ───────────────────────────────────────────────────────

    /// Resolve every recipient and write the message beads. Returns the
    /// created message IDs.
    pub async fn send(&self, draft: &Draft) -> Result<Vec<String>, MailError> {
        let mut resolution = Resolution::default();
        for raw in &draft.to {
            let addr = Address::parse(raw)?;
            let mut visited = HashSet::new();
            self.resolve(&addr, &mut visited, &mut resolution)?;
        }

        let mut created = Vec::new();
        for (agent_id, agent_addr) in &resolution.agents {
            let id = self.write_message(draft, &[agent_addr.clone()], None, None)?;
            self.injector
                .enqueue(
                    agent_id,
                    EntryKind::Mail,
                    &format!("mail {id} from {}: {}", draft.from, draft.subject),
                )
                .await?;
            created.push(id);
        }
        for queue in &resolution.queues {
            self.ensure_queue_open(queue)?;
            created.push(self.write_message(draft, &[], Some(queue), None)?);
        }
        for channel in &resolution.channels {
            let chan = self
                .find_named(BeadType::Channel, channel)?
                .ok_or_else(|| MailError::UnknownAddress {
                    addr: format!("channel:{channel}"),
                })?;
            created.push(self.write_message(draft, &[], None, Some(channel))?);
            self.enforce_retention(&chan)?;
        }
        debug!(from = %draft.from, count = created.len(), "mail sent");
        Ok(created)
    }

    fn write_message(
        &self,
        draft: &Draft,
        to: &[String],
        queue: Option<&str>,
        channel: Option<&str>,
    ) -> Result<String, MailError> {
        let id = format!("{TOWN_PREFIX}-msg-{}", random_base36(8));
        let mut bead = Bead::new(&id, &draft.subject, BeadType::Message)
            .with_description(&draft.body)
            .with_fields(BeadFields::Message(MessageFields {
                from: draft.from.clone(),
                to: to.to_vec(),
                thread_id: draft.thread_id.clone(),
                attachments: draft.attachments.clone(),
                queue: queue.map(str::to_string),
                channel: channel.map(str::to_string),
                ..Default::default()
            }));
        if let Some(p) = draft.priority {
            bead.priority = p;
        }
        bead.created_by = Some(draft.from.clone());
        self.beads.create(&bead)?;
        Ok(id)
    }

    // ── Resolution ────────────────────────────────────────────────────

    fn resolve(
        &self,
        addr: &Address,
        visited: &mut HashSet<String>,
        out: &mut Resolution,
    ) -> Result<(), MailError> {
        match addr {
            Address::Direct { rig, role, name } => {
                let mut matched = false;
                for agent in self.active_agents()? {
                    let Some(f) = agent.fields.as_agent() else {
                        continue;
                    };
                    let role_ok = f.role_type.map(|r| r.as_str() == role).unwrap_or(false);
                    let rig_ok = f.rig.as_deref() == Some(rig.as_str());
                    let name_ok = match name {
                        Some(n) => f.agent_name.as_deref() == Some(n.as_str()),
                        None => true,
                    };
                    if role_ok && rig_ok && name_ok {
                        if let Some(address) = agent.agent_address() {
                            out.agents.insert((agent.id.clone(), address));
                            matched = true;
                        }
                    }
                }
                if !matched {
                    return Err(MailError::UnknownAddress {
                        addr: addr.to_string(),
                    });
                }
                Ok(())
            }
            Address::Pattern { role } => {
                for agent in self.active_agents()? {
                    let Some(f) = agent.fields.as_agent() else {
                        continue;
                    };
                    if f.role_type.map(|r| r.as_str() == role).unwrap_or(false)
                        && let Some(address) = agent.agent_address()
                    {
                        out.agents.insert((agent.id.clone(), address));
                    }
                }
                Ok(())
            }
            Address::Group(name) => self.expand_group(name, visited, out),
            Address::Queue(name) => {
                if self.find_named(BeadType::Queue, name)?.is_none() {
                    return Err(MailError::UnknownAddress {
                        addr: addr.to_string(),
                    });
                }
                out.queues.insert(name.clone());
                Ok(())
            }
            Address::Channel(name) => {
                if self.find_named(BeadType::Channel, name)?.is_none() {
                    return Err(MailError::UnknownAddress {
                        addr: addr.to_string(),
                    });
                }
                out.channels.insert(name.clone());
                Ok(())
            }
            Address::Bare(name) => {
                let group = self.find_named(BeadType::Group, name)?.is_some();
                let queue = self.find_named(BeadType::Queue, name)?.is_some();
                let channel = self.find_named(BeadType::Channel, name)?.is_some();
                match (group, queue, channel) {
                    (true, false, false) => {
                        self.resolve(&Address::Group(name.clone()), visited, out)
                    }
                    (false, true, false) => {
                        self.resolve(&Address::Queue(name.clone()), visited, out)
                    }
                    (false, false, true) => {
                        self.resolve(&Address::Channel(name.clone()), visited, out)
                    }
                    (false, false, false) => Err(MailError::UnknownAddress {
                        addr: name.clone(),
                    }),
                    _ => Err(MailError::Ambiguous { name: name.clone() }),
                }
            }
        }
    }

    /// Recursive member expansion; cycles are tolerated via the visited set.
    fn expand_group(
        &self,
        name: &str,
        visited: &mut HashSet<String>,
        out: &mut Resolution,
    ) -> Result<(), MailError> {
        if !visited.insert(name.to_string()) {
            return Ok(());
        }
        let group = self
            .find_named(BeadType::Group, name)?
            .ok_or_else(|| MailError::UnknownAddress {
                addr: format!("group:{name}"),
            })?;
        let members = match &group.fields {
            BeadFields::Group(GroupFields { members }) => members.clone(),
            _ => Vec::new(),
        };
        for member in members {
            let addr = Address::parse(&member)?;
            // Members that no longer resolve should not poison the whole
            // group send.
            if let Err(e) = self.resolve(&addr, visited, out) {
                match e {
                    MailError::UnknownAddress { .. } => {
                        debug!(group = name, member = %member, "skipping unresolved member");
                    }
                    other => return Err(other),
                }
            }
        }
        Ok(())
    }

    fn active_agents(&self) -> Result<Vec<Bead>, StoreError> {
        let agents = self
            .beads
            .list_all(&ListFilter::open().with_type(BeadType::Agent))?;
        Ok(agents
            .into_iter()
            .filter(|a| {
                a.fields
                    .as_agent()
                    .map(|f| !f.agent_state.is_terminal())
                    .unwrap_or(false)
            })
            .collect())
    }

    fn find_named(&self, t: BeadType, name: &str) -> Result<Option<Bead>, StoreError> {
        let id = format!("{TOWN_PREFIX}-{}-{name}", t.as_str());
        match self.beads.get(&id)? {
            Some(b) if b.status != BeadStatus::Closed => Ok(Some(b)),
            _ => Ok(None),
        }
    }

    // ── Messaging primitives ──────────────────────────────────────────

    pub fn create_group(&self, name: &str, members: Vec<String>) -> Result<Bead, MailError> {
        let id = format!("{TOWN_PREFIX}-group-{name}");
        let bead = Bead::new(&id, name, BeadType::Group)
            .with_fields(BeadFields::Group(GroupFields { members }));
        Ok(self.beads.create(&bead)?)
    }

    pub fn create_queue(&self, name: &str) -> Result<Bead, MailError> {
        let id = format!("{TOWN_PREFIX}-queue-{name}");
        let bead = Bead::new(&id, name, BeadType::Queue)
            .with_fields(BeadFields::Queue(QueueFields { open: true }));
        Ok(self.beads.create(&bead)?)
    }

    /// Create a channel. `retention_required` with both caps zero is a
    /// configuration error.
    pub fn create_channel(
        &self,
        name: &str,
        retention: ChannelFields,
    ) -> Result<Bead, MailError> {
        if retention.retention_required
            && retention.retention_count == 0
            && retention.retention_secs == 0
        {
            return Err(MailError::ChannelConfig { name: name.into() });
        }
        let id = format!("{TOWN_PREFIX}-channel-{name}");
        let bead =
            Bead::new(&id, name, BeadType::Channel).with_fields(BeadFields::Channel(retention));
        Ok(self.beads.create(&bead)?)
    }

    pub fn close_queue(&self, name: &str) -> Result<(), MailError> {
        let queue = self
            .find_named(BeadType::Queue, name)?
            .ok_or_else(|| MailError::UnknownAddress {
                addr: format!("queue:{name}"),
            })?;
        self.beads.update(&queue.id, |b| {
            if let BeadFields::Queue(q) = &mut b.fields {
                q.open = false;
            }
        })?;
        Ok(())
    }

    fn ensure_queue_open(&self, name: &str) -> Result<(), MailError> {
        let queue = self
            .find_named(BeadType::Queue, name)?
            .ok_or_else(|| MailError::UnknownAddress {
                addr: format!("queue:{name}"),
            })?;
        let open = matches!(&queue.fields, BeadFields::Queue(QueueFields { open: true }));
        if !open {
            return Err(MailError::QueueClosed { name: name.into() });
        }
        Ok(())
    }

    // ── Queue consumption ─────────────────────────────────────────────

    /// Claim the next message from a queue for `worker`: at most one
    /// claimant per message, priority order then FIFO. Returns `None` when
    /// the queue is empty.
    pub fn claim(&self, queue: &str, worker: &str) -> Result<Option<Bead>, MailError> {
        self.ensure_queue_open(queue)?;
        let next = self
            .queue_messages(queue)?
            .into_iter()
            .find(|m| {
                m.fields
                    .as_message()
                    .map(|f| f.claimed_by.is_none())
                    .unwrap_or(false)
            });
        let Some(message) = next else {
            return Ok(None);
        };
        let worker = worker.to_string();
        let claimed = self.beads.update(&message.id, |b| {
            if let BeadFields::Message(f) = &mut b.fields {
                f.claimed_by = Some(worker.clone());
                f.claimed_at = Some(Utc::now());
            }
            b.status = BeadStatus::InProgress;
        })?;
        Ok(Some(claimed))
    }

    /// Unclaimed depth of a queue.
    pub fn queue_depth(&self, queue: &str) -> Result<usize, MailError> {
        Ok(self
            .queue_messages(queue)?
            .iter()
            .filter(|m| {
                m.fields
                    .as_message()
                    .map(|f| f.claimed_by.is_none())
                    .unwrap_or(false)
            })
            .count())
    }

    fn queue_messages(&self, queue: &str) -> Result<Vec<Bead>, StoreError> {
        let all = self
            .beads
            .list(TOWN_PREFIX, &ListFilter::default().with_type(BeadType::Message))?;
        Ok(all
            .into_iter()
            .filter(|m| {
                m.status != BeadStatus::Closed
                    && m.fields
                        .as_message()
                        .map(|f| f.queue.as_deref() == Some(queue))
                        .unwrap_or(false)
            })
            .collect())
    }

    /// Sender-side cancellation: allowed until a worker claims the message.
    pub fn revoke(&self, message_id: &str, sender: &str) -> Result<(), MailError> {
        let message = self.beads.show(message_id)?;
        let Some(f) = message.fields.as_message() else {
            return Err(MailError::UnknownAddress {
                addr: message_id.into(),
            });
        };
        if f.claimed_by.is_some() {
            return Err(MailError::AlreadyClaimed {
                id: message_id.into(),
            });
        }
        if f.from != sender {
            return Err(MailError::UnknownAddress {
                addr: sender.into(),
            });
        }
        self.beads.close(message_id, Some("revoked"))?;
        Ok(())
    }

    // ── Inbox ─────────────────────────────────────────────────────────

    /// Messages addressed to `address`, oldest first. `unread_only` hides
    /// messages the reader has acknowledged.
    pub fn inbox(&self, address: &str, unread_only: bool) -> Result<Vec<Bead>, MailError> {
        let all = self
            .beads
            .list(TOWN_PREFIX, &ListFilter::default().with_type(BeadType::Message))?;
        let mut found: Vec<Bead> = all
            .into_iter()
            .filter(|m| {
                m.status != BeadStatus::Closed
                    && m.fields
                        .as_message()
                        .map(|f| {
                            f.to.iter().any(|t| t == address)
                                && (!unread_only || !f.acked_by.iter().any(|a| a == address))
                        })
                        .unwrap_or(false)
            })
            .collect();
        found.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(found)
    }

    /// Mark a message read by `reader`.
    pub fn ack(&self, message_id: &str, reader: &str) -> Result<(), MailError> {
        let reader = reader.to_string();
        self.beads.update(message_id, |b| {
            if let BeadFields::Message(f) = &mut b.fields
                && !f.acked_by.contains(&reader)
            {
                f.acked_by.push(reader.clone());
            }
        })?;
        Ok(())
    }

    /// Retained messages of a channel, oldest first.
    pub fn channel_history(&self, channel: &str) -> Result<Vec<Bead>, MailError> {
        let all = self
            .beads
            .list(TOWN_PREFIX, &ListFilter::default().with_type(BeadType::Message))?;
        let mut found: Vec<Bead> = all
            .into_iter()
            .filter(|m| {
                m.status != BeadStatus::Closed
                    && m.fields
                        .as_message()
                        .map(|f| f.channel.as_deref() == Some(channel))
                        .unwrap_or(false)
            })
            .collect();
        found.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(found)
    }

    /// Enforce both retention caps, dropping oldest first.
    fn enforce_retention(&self, channel: &Bead) -> Result<(), MailError> {
        let BeadFields::Channel(policy) = &channel.fields else {
            return Ok(());
        };
        let history = self.channel_history(&channel.title)?;
        let mut drop: BTreeSet<String> = BTreeSet::new();
        if policy.retention_count > 0 && history.len() as u64 > policy.retention_count {
            let excess = history.len() - policy.retention_count as usize;
            for m in history.iter().take(excess) {
                drop.insert(m.id.clone());
            }
        }
        if policy.retention_secs > 0 {
            let cutoff = Utc::now() - chrono::Duration::seconds(policy.retention_secs as i64);
            for m in &history {
                if m.created_at < cutoff {
                    drop.insert(m.id.clone());
                }
            }
        }
        for id in drop {
            self.beads.close(&id, Some("retention"))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::beads::types::{AgentFields, AgentState, RoleType};
    use tempfile::tempdir;

    struct Fixture {
        bus: MailBus,
        beads: Arc<Beads>,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let beads = Beads::open(&dir.path().join("routes.jsonl")).unwrap();
        beads
            .routes()
            .add(TOWN_PREFIX, dir.path().join("beads").to_str().unwrap())
            .unwrap();
        let beads = Arc::new(beads);
        let injector = Arc::new(Injector::new(beads.clone()));
        Fixture {
            bus: MailBus::new(beads.clone(), injector),
            beads,
            _dir: dir,
        }
    }

    fn add_agent(beads: &Beads, rig: &str, role: RoleType, name: &str) -> String {
        let id = format!("hq-agent-{name}");
        let bead = Bead::new(&id, name, BeadType::Agent)
            .with_label(crate::beads::LABEL_AGENT)
            .with_fields(BeadFields::Agent(AgentFields {
                role_type: Some(role),
                rig: Some(rig.into()),
                agent_name: Some(name.into()),
                agent_state: AgentState::Working,
                ..Default::default()
            }));
        beads.create(&bead).unwrap();
        id
    }

    fn draft(from: &str, to: &[&str], subject: &str) -> Draft {
        Draft {
            from: from.into(),
            to: to.iter().map(|s| s.to_string()).collect(),
            subject: subject.into(),
            body: "body".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn direct_send_lands_in_inbox() {
        let f = fixture();
        add_agent(&f.beads, "gastown", RoleType::Crew, "alice");
        f.bus
            .send(&draft("gastown/witness", &["gastown/crew/alice"], "hi"))
            .await
            .unwrap();
        let inbox = f.bus.inbox("gastown/crew/alice", false).unwrap();
        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox[0].title, "hi");
    }

    #[tokio::test]
    async fn role_address_fans_out_to_all_matching_agents() {
        let f = fixture();
        add_agent(&f.beads, "gastown", RoleType::Crew, "alice");
        add_agent(&f.beads, "gastown", RoleType::Crew, "bob");
        add_agent(&f.beads, "other", RoleType::Crew, "carol");

        let ids = f
            .bus
            .send(&draft("hq/mayor", &["gastown/crew"], "standup"))
            .await
            .unwrap();
        assert_eq!(ids.len(), 2);
        assert_eq!(f.bus.inbox("other/crew/carol", false).unwrap().len(), 0);
    }

    #[tokio::test]
    async fn pattern_reaches_every_rig() {
        let f = fixture();
        add_agent(&f.beads, "gastown", RoleType::Witness, "w1");
        add_agent(&f.beads, "other", RoleType::Witness, "w2");
        let ids = f
            .bus
            .send(&draft("hq/mayor", &["*/witness"], "ping"))
            .await
            .unwrap();
        assert_eq!(ids.len(), 2);
    }

    #[tokio::test]
    async fn unknown_direct_recipient_errors() {
        let f = fixture();
        let err = f
            .bus
            .send(&draft("x", &["gastown/crew/ghost"], "hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, MailError::UnknownAddress { .. }));
    }

    #[tokio::test]
    async fn queue_claims_are_fifo_and_at_most_once() {
        let f = fixture();
        f.bus.create_queue("build").unwrap();
        for subject in ["m1", "m2", "m3"] {
            f.bus
                .send(&draft("sender", &["queue:build"], subject))
                .await
                .unwrap();
        }
        assert_eq!(f.bus.queue_depth("build").unwrap(), 3);

        let c1 = f.bus.claim("build", "w1").unwrap().unwrap();
        assert_eq!(c1.title, "m1");
        assert_eq!(f.bus.queue_depth("build").unwrap(), 2);
        let c2 = f.bus.claim("build", "w2").unwrap().unwrap();
        assert_eq!(c2.title, "m2");
        let c3 = f.bus.claim("build", "w1").unwrap().unwrap();
        assert_eq!(c3.title, "m3");
        assert_eq!(f.bus.queue_depth("build").unwrap(), 0);
        assert!(f.bus.claim("build", "w1").unwrap().is_none());
    }

    #[tokio::test]
    async fn closed_queue_rejects_sends_and_claims() {
        let f = fixture();
        f.bus.create_queue("build").unwrap();
        f.bus.close_queue("build").unwrap();
        let err = f
            .bus
            .send(&draft("s", &["queue:build"], "m"))
            .await
            .unwrap_err();
        assert!(matches!(err, MailError::QueueClosed { .. }));
        assert!(matches!(
            f.bus.claim("build", "w"),
            Err(MailError::QueueClosed { .. })
        ));
    }

    #[tokio::test]
    async fn revoke_allowed_until_claimed() {
        let f = fixture();
        f.bus.create_queue("build").unwrap();
        let ids = f
            .bus
            .send(&draft("sender", &["queue:build"], "m1"))
            .await
            .unwrap();
        f.bus.revoke(&ids[0], "sender").unwrap();
        assert_eq!(f.bus.queue_depth("build").unwrap(), 0);

        let ids = f
            .bus
            .send(&draft("sender", &["queue:build"], "m2"))
            .await
            .unwrap();
        f.bus.claim("build", "w1").unwrap().unwrap();
        assert!(matches!(
            f.bus.revoke(&ids[0], "sender"),
            Err(MailError::AlreadyClaimed { .. })
        ));
    }

    #[tokio::test]
    async fn group_expansion_tolerates_cycles() {
        let f = fixture();
        add_agent(&f.beads, "gastown", RoleType::Crew, "alice");
        f.bus
            .create_group("ops", vec!["group:oncall".into(), "gastown/crew/alice".into()])
            .unwrap();
        f.bus
            .create_group("oncall", vec!["group:ops".into()])
            .unwrap();

        let ids = f
            .bus
            .send(&draft("x", &["group:ops"], "page"))
            .await
            .unwrap();
        assert_eq!(ids.len(), 1);
    }

    #[tokio::test]
    async fn bare_name_resolution_and_ambiguity() {
        let f = fixture();
        f.bus.create_queue("alerts").unwrap();
        f.bus
            .send(&draft("x", &["alerts"], "to queue"))
            .await
            .unwrap();
        assert_eq!(f.bus.queue_depth("alerts").unwrap(), 1);

        f.bus
            .create_channel("alerts", ChannelFields::default())
            .unwrap();
        let err = f
            .bus
            .send(&draft("x", &["alerts"], "now ambiguous"))
            .await
            .unwrap_err();
        assert!(matches!(err, MailError::Ambiguous { .. }));

        // Explicit prefix resolves the ambiguity.
        f.bus
            .send(&draft("x", &["channel:alerts"], "explicit"))
            .await
            .unwrap();
        assert_eq!(f.bus.channel_history("alerts").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn channel_count_cap_drops_oldest() {
        let f = fixture();
        f.bus
            .create_channel(
                "events",
                ChannelFields {
                    retention_count: 2,
                    ..Default::default()
                },
            )
            .unwrap();
        for subject in ["e1", "e2", "e3"] {
            f.bus
                .send(&draft("x", &["channel:events"], subject))
                .await
                .unwrap();
        }
        let history = f.bus.channel_history("events").unwrap();
        let titles: Vec<_> = history.iter().map(|m| m.title.as_str()).collect();
        assert_eq!(titles, vec!["e2", "e3"]);
    }

    #[test]
    fn required_retention_with_no_caps_is_config_error() {
        let f = fixture();
        let err = f
            .bus
            .create_channel(
                "bad",
                ChannelFields {
                    retention_required: true,
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, MailError::ChannelConfig { .. }));
    }

    #[tokio::test]
    async fn unread_filter_hides_acked_messages() {
        let f = fixture();
        add_agent(&f.beads, "gastown", RoleType::Crew, "alice");
        let ids = f
            .bus
            .send(&draft("x", &["gastown/crew/alice"], "hi"))
            .await
            .unwrap();
        assert_eq!(f.bus.inbox("gastown/crew/alice", true).unwrap().len(), 1);
        f.bus.ack(&ids[0], "gastown/crew/alice").unwrap();
        assert_eq!(f.bus.inbox("gastown/crew/alice", true).unwrap().len(), 0);
        assert_eq!(f.bus.inbox("gastown/crew/alice", false).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn dead_agents_do_not_receive_mail() {
        let f = fixture();
        let id = add_agent(&f.beads, "gastown", RoleType::Crew, "ghost");
        f.beads
            .update(&id, |b| {
                if let Some(a) = b.fields.as_agent_mut() {
                    a.agent_state = AgentState::Dead;
                }
            })
            .unwrap();
        let err = f
            .bus
            .send(&draft("x", &["gastown/crew/ghost"], "hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, MailError::UnknownAddress { .. }));
    }
}
