//! The bead data model.
//!
//! A bead is the universal record: tasks, bugs, agents, decisions, merge
//! requests, messages, and messaging primitives are all beads with a typed
//! extension payload. Core columns are first-class; everything
//! type-specific lives in [`BeadFields`], serialized as JSON alongside the
//! record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Label marking agent beads for the reconciler.
pub const LABEL_AGENT: &str = "gt:agent";
/// Label marking merge-request beads for the refinery.
pub const LABEL_MERGE_REQUEST: &str = "gt:merge-request";
/// Label on decisions awaiting a human.
pub const LABEL_DECISION_PENDING: &str = "decision:pending";
/// Label on resolved decisions.
pub const LABEL_DECISION_RESOLVED: &str = "decision:resolved";

/// Every kind of record the store holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BeadType {
    Task,
    Bug,
    Epic,
    Agent,
    Role,
    Group,
    Queue,
    Channel,
    Decision,
    Convoy,
    MergeRequest,
    Molecule,
    Message,
    Gate,
}

impl BeadType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Task => "task",
            Self::Bug => "bug",
            Self::Epic => "epic",
            Self::Agent => "agent",
            Self::Role => "role",
            Self::Group => "group",
            Self::Queue => "queue",
            Self::Channel => "channel",
            Self::Decision => "decision",
            Self::Convoy => "convoy",
            Self::MergeRequest => "merge-request",
            Self::Molecule => "molecule",
            Self::Message => "message",
            Self::Gate => "gate",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "task" => Some(Self::Task),
            "bug" => Some(Self::Bug),
            "epic" => Some(Self::Epic),
            "agent" => Some(Self::Agent),
            "role" => Some(Self::Role),
            "group" => Some(Self::Group),
            "queue" => Some(Self::Queue),
            "channel" => Some(Self::Channel),
            "decision" => Some(Self::Decision),
            "convoy" => Some(Self::Convoy),
            "merge-request" => Some(Self::MergeRequest),
            "molecule" => Some(Self::Molecule),
            "message" => Some(Self::Message),
            "gate" => Some(Self::Gate),
            _ => None,
        }
    }
}

/// Lifecycle status shared by every bead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BeadStatus {
    #[default]
    Open,
    InProgress,
    Hooked,
    Blocked,
    Closed,
}

impl BeadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::InProgress => "in_progress",
            Self::Hooked => "hooked",
            Self::Blocked => "blocked",
            Self::Closed => "closed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(Self::Open),
            "in_progress" => Some(Self::InProgress),
            "hooked" => Some(Self::Hooked),
            "blocked" => Some(Self::Blocked),
            "closed" => Some(Self::Closed),
            _ => None,
        }
    }

    /// Closed is the only terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

/// Agent roles in the town hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoleType {
    /// Town-level coordinator.
    Mayor,
    /// Town-level background worker.
    Deacon,
    /// Per-rig lifecycle monitor.
    Witness,
    /// Per-rig merge-queue processor.
    Refinery,
    /// Established worker with a persistent workspace.
    Crew,
    /// Transient worker with an ephemeral workspace.
    Polecat,
    /// Short-lived helper spawned for a single chore.
    Dog,
}

impl RoleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mayor => "mayor",
            Self::Deacon => "deacon",
            Self::Witness => "witness",
            Self::Refinery => "refinery",
            Self::Crew => "crew",
            Self::Polecat => "polecat",
            Self::Dog => "dog",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "mayor" => Some(Self::Mayor),
            "deacon" => Some(Self::Deacon),
            "witness" => Some(Self::Witness),
            "refinery" => Some(Self::Refinery),
            "crew" => Some(Self::Crew),
            "polecat" => Some(Self::Polecat),
            "dog" => Some(Self::Dog),
            _ => None,
        }
    }

    /// Whether this role keeps its workspace across restarts.
    pub fn persistent_workspace(&self) -> bool {
        !matches!(self, Self::Polecat | Self::Dog)
    }
}

/// Runtime state of an agent, driven by the runner and the control loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    #[default]
    Spawning,
    Working,
    Idle,
    Done,
    Stuck,
    Dead,
}

impl AgentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Spawning => "spawning",
            Self::Working => "working",
            Self::Idle => "idle",
            Self::Done => "done",
            Self::Stuck => "stuck",
            Self::Dead => "dead",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Dead)
    }
}

/// Where an agent's process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionTarget {
    /// Supervised terminal multiplexer session on this host.
    #[default]
    Local,
    /// Pod in the town's cluster, reached through the PTY sidecar.
    K8s,
}

/// Agent-specific bead payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct AgentFields {
    pub role_type: Option<RoleType>,
    pub rig: Option<String>,
    pub agent_name: Option<String>,
    #[serde(default)]
    pub agent_state: AgentState,
    pub hook_bead: Option<String>,
    #[serde(default)]
    pub execution_target: ExecutionTarget,
    pub pod_name: Option<String>,
    pub pod_ip: Option<String>,
    pub session_name: Option<String>,
    pub last_activity: Option<DateTime<Utc>>,
    /// Merge slot state, present only on refinery agents.
    pub merge_slot: Option<MergeSlotState>,
}

/// Persisted merge-slot record on a refinery agent bead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct MergeSlotState {
    pub holder: Option<String>,
    pub reason: Option<String>,
    pub acquired_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub waiters: Vec<String>,
}

/// Role template payload: which skills, tools, and hooks agents of this role
/// receive at provisioning time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RoleFields {
    pub role_type: Option<RoleType>,
    #[serde(default)]
    pub skills: Vec<String>,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub hooks: Vec<String>,
}

/// Merge-request payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct MergeRequestFields {
    pub source_branch: String,
    pub target_branch: String,
    pub source_issue: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub ready_at: Option<DateTime<Utc>>,
}

/// One selectable option in a decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DecisionOption {
    pub label: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub pros: Vec<String>,
    #[serde(default)]
    pub cons: Vec<String>,
    pub confidence: Option<f64>,
}

/// Structured decision payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DecisionFields {
    pub question: String,
    pub context: Option<String>,
    pub analysis: Option<String>,
    pub tradeoffs: Option<String>,
    #[serde(default)]
    pub options: Vec<DecisionOption>,
    pub recommended_index: Option<u32>,
    pub urgency: Option<String>,
    #[serde(default)]
    pub blockers: Vec<String>,
    /// 1-indexed; 0 means unresolved.
    #[serde(default)]
    pub chosen_index: u32,
    pub rationale: Option<String>,
    pub resolved_by: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    /// Free-form response recorded by `respond_text`.
    pub response_text: Option<String>,
}

/// Mail message payload. The body lives in the bead description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct MessageFields {
    pub from: String,
    #[serde(default)]
    pub to: Vec<String>,
    pub thread_id: Option<String>,
    #[serde(default)]
    pub attachments: Vec<String>,
    /// Queue name when the message sits in a queue awaiting a claimant.
    pub queue: Option<String>,
    /// Channel name when the message was published to a channel.
    pub channel: Option<String>,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub acked_by: Vec<String>,
}

/// Group payload: recursive member list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct GroupFields {
    #[serde(default)]
    pub members: Vec<String>,
}

/// Queue payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueFields {
    #[serde(default = "default_true")]
    pub open: bool,
}

fn default_true() -> bool {
    true
}

impl Default for QueueFields {
    fn default() -> Self {
        Self { open: true }
    }
}

/// Channel payload with retention policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ChannelFields {
    /// Keep at most this many messages; 0 means uncapped.
    #[serde(default)]
    pub retention_count: u64,
    /// Keep messages at most this many seconds; 0 means uncapped.
    #[serde(default)]
    pub retention_secs: u64,
    /// When true, at least one cap must be nonzero.
    #[serde(default)]
    pub retention_required: bool,
}

/// Convoy payload: tracked beads and automatic landing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ConvoyFields {
    #[serde(default)]
    pub tracked: Vec<String>,
}

/// Typed extension payload, tagged so the JSON stays self-describing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BeadFields {
    #[default]
    None,
    Agent(AgentFields),
    Role(RoleFields),
    MergeRequest(MergeRequestFields),
    Decision(DecisionFields),
    Message(MessageFields),
    Group(GroupFields),
    Queue(QueueFields),
    Channel(ChannelFields),
    Convoy(ConvoyFields),
}

impl BeadFields {
    pub fn as_agent(&self) -> Option<&AgentFields> {
        match self {
            Self::Agent(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_agent_mut(&mut self) -> Option<&mut AgentFields> {
        match self {
            Self::Agent(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_merge_request(&self) -> Option<&MergeRequestFields> {
        match self {
            Self::MergeRequest(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_decision(&self) -> Option<&DecisionFields> {
        match self {
            Self::Decision(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_message(&self) -> Option<&MessageFields> {
        match self {
            Self::Message(f) => Some(f),
            _ => None,
        }
    }
}

/// The universal record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bead {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub bead_type: BeadType,
    #[serde(default)]
    pub status: BeadStatus,
    /// Lower is more urgent.
    #[serde(default = "default_priority")]
    pub priority: i64,
    #[serde(default)]
    pub labels: BTreeSet<String>,
    pub assignee: Option<String>,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub close_reason: Option<String>,
    pub parent: Option<String>,
    /// IDs this bead is blocked by (edges live in the deps table).
    #[serde(default)]
    pub blocked_by: BTreeSet<String>,
    /// IDs this bead blocks.
    #[serde(default)]
    pub blocks: BTreeSet<String>,
    #[serde(default)]
    pub notes: BTreeMap<String, String>,
    #[serde(default)]
    pub fields: BeadFields,
}

fn default_priority() -> i64 {
    2
}

impl Bead {
    /// Construct an open bead with defaults; callers fill in extensions.
    pub fn new(id: &str, title: &str, bead_type: BeadType) -> Self {
        let now = Utc::now();
        Self {
            id: id.to_string(),
            title: title.to_string(),
            description: String::new(),
            bead_type,
            status: BeadStatus::Open,
            priority: default_priority(),
            labels: BTreeSet::new(),
            assignee: None,
            created_by: None,
            created_at: now,
            updated_at: now,
            closed_at: None,
            close_reason: None,
            parent: None,
            blocked_by: BTreeSet::new(),
            blocks: BTreeSet::new(),
            notes: BTreeMap::new(),
            fields: BeadFields::None,
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_label(mut self, label: &str) -> Self {
        self.labels.insert(label.to_string());
        self
    }

    pub fn with_parent(mut self, parent: &str) -> Self {
        self.parent = Some(parent.to_string());
        self
    }

    pub fn with_fields(mut self, fields: BeadFields) -> Self {
        self.fields = fields;
        self
    }

    pub fn is_open(&self) -> bool {
        !self.status.is_terminal()
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.labels.contains(label)
    }

    /// Agent address of the form `<rig>/<role>/<name>` (town-level agents
    /// use the town name as rig).
    pub fn agent_address(&self) -> Option<String> {
        let f = self.fields.as_agent()?;
        let role = f.role_type?.as_str();
        match (&f.rig, &f.agent_name) {
            (Some(rig), Some(name)) => Some(format!("{rig}/{role}/{name}")),
            (Some(rig), None) => Some(format!("{rig}/{role}")),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bead_type_round_trips_through_strings() {
        for t in [
            BeadType::Task,
            BeadType::MergeRequest,
            BeadType::Decision,
            BeadType::Message,
        ] {
            assert_eq!(BeadType::parse(t.as_str()), Some(t));
        }
        assert_eq!(BeadType::parse("nonsense"), None);
    }

    #[test]
    fn fields_serialize_with_kind_tag() {
        let fields = BeadFields::MergeRequest(MergeRequestFields {
            source_branch: "polecat/gt-42".into(),
            target_branch: "main".into(),
            source_issue: Some("gt-42".into()),
            ..Default::default()
        });
        let json = serde_json::to_value(&fields).unwrap();
        assert_eq!(json["kind"], "merge_request");
        assert_eq!(json["source_branch"], "polecat/gt-42");
        let back: BeadFields = serde_json::from_value(json).unwrap();
        assert_eq!(back, fields);
    }

    #[test]
    fn agent_address_formats() {
        let mut bead = Bead::new("gt-agent-toecutter", "toecutter", BeadType::Agent);
        bead.fields = BeadFields::Agent(AgentFields {
            role_type: Some(RoleType::Crew),
            rig: Some("gastown".into()),
            agent_name: Some("toecutter".into()),
            ..Default::default()
        });
        assert_eq!(bead.agent_address().unwrap(), "gastown/crew/toecutter");
    }

    #[test]
    fn polecat_and_dog_workspaces_are_ephemeral() {
        assert!(!RoleType::Polecat.persistent_workspace());
        assert!(!RoleType::Dog.persistent_workspace());
        assert!(RoleType::Crew.persistent_workspace());
        assert!(RoleType::Refinery.persistent_workspace());
    }

    #[test]
    fn decision_default_is_unresolved() {
        let d = DecisionFields::default();
        assert_eq!(d.chosen_index, 0);
        assert!(d.resolved_at.is_none());
    }

    #[test]
    fn builder_sets_core_columns() {
        let bead = Bead::new("gt-7", "fix flaky test", BeadType::Bug)
            .with_priority(0)
            .with_label(LABEL_AGENT)
            .with_description("fails every third run");
        assert_eq!(bead.priority, 0);
        assert!(bead.has_label(LABEL_AGENT));
        assert_eq!(bead.status, BeadStatus::Open);
        assert!(bead.is_open());
    }
}
