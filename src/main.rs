use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use clap::{Parser, Subcommand};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use gastown::beads::{Bead, BeadStatus, BeadType, ChannelFields, ListFilter};
use gastown::control::ControlLoop;
use gastown::daemon::{Daemon, DaemonState};
use gastown::decision::DecisionRequest;
use gastown::errors::{GtError, StoreError};
use gastown::inject::EntryKind;
use gastown::mail::Draft;
use gastown::output;
use gastown::refinery::Refinery;
use gastown::runner::{Identity, Runner};
use gastown::town::{MergeStrategy, RigConfig, Town};

#[derive(Parser)]
#[command(name = "gt", version, about = "Gas Town - multi-agent orchestration")]
struct Cli {
    /// Town root directory (defaults to $GT_TOWN_ROOT, then ~/gt).
    #[arg(long, global = true)]
    town: Option<PathBuf>,

    /// Machine-readable output: one root JSON object per command.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a town root
    Init {
        #[arg(long, default_value = "gastown")]
        name: String,
    },
    /// Register and inspect rigs
    Rig {
        #[command(subcommand)]
        command: RigCommands,
    },
    /// Manage the prefix route table
    Routes {
        #[command(subcommand)]
        command: RouteCommands,
    },
    /// Run the town daemon (RPC surface plus control loop)
    Daemon,
    /// Bead CRUD and queries
    Bead {
        #[command(subcommand)]
        command: BeadCommands,
    },
    /// Hook a bead to an agent
    Hook { agent: String, bead: String },
    /// Release an agent's hook
    Unhook { agent: String },
    /// Close a bead and advance its molecule
    Continue { bead: String },
    /// Inter-agent mail
    Mail {
        #[command(subcommand)]
        command: MailCommands,
    },
    /// Work queues (at-most-once claims)
    Queue {
        #[command(subcommand)]
        command: QueueCommands,
    },
    /// Broadcast channels with retention
    Channel {
        #[command(subcommand)]
        command: ChannelCommands,
    },
    /// Recipient groups
    Group {
        #[command(subcommand)]
        command: GroupCommands,
    },
    /// Merge queue (refinery)
    Mq {
        #[command(subcommand)]
        command: MqCommands,
    },
    /// Human-in-the-loop decisions
    Decision {
        #[command(subcommand)]
        command: DecisionCommands,
    },
    /// Agent lifecycle
    Agent {
        #[command(subcommand)]
        command: AgentCommands,
    },
    /// Run one reconcile pass and report what changed
    Reconcile,
    /// Session injection queues
    Inject {
        #[command(subcommand)]
        command: InjectCommands,
    },
}

#[derive(Subcommand)]
enum RigCommands {
    /// Register a rig: its database, route, and role directories
    Add {
        name: String,
        repo_url: String,
        #[arg(long)]
        prefix: String,
        #[arg(long, default_value = "main")]
        default_branch: String,
        #[arg(long, default_value = "rebase-ff")]
        strategy: String,
        #[arg(long)]
        test_command: Option<String>,
        #[arg(long)]
        semantic_merge: bool,
    },
    List,
}

#[derive(Subcommand)]
enum RouteCommands {
    Add { prefix: String, path: String },
    List,
}

#[derive(Subcommand)]
enum BeadCommands {
    Create {
        id: String,
        title: String,
        #[arg(long, default_value = "task")]
        r#type: String,
        #[arg(long, default_value = "")]
        description: String,
        #[arg(long)]
        priority: Option<i64>,
        #[arg(long)]
        label: Vec<String>,
        #[arg(long)]
        parent: Option<String>,
    },
    Show {
        id: String,
    },
    List {
        prefix: String,
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        r#type: Option<String>,
        #[arg(long)]
        label: Option<String>,
    },
    /// Open beads with no open blockers
    Ready {
        prefix: String,
        #[arg(long)]
        parent: Option<String>,
    },
    Close {
        id: String,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Declare BLOCKED blocked_by BLOCKER
    Dep {
        blocked: String,
        blocker: String,
    },
}

#[derive(Subcommand)]
enum MailCommands {
    Send {
        #[arg(long)]
        from: String,
        #[arg(long, required = true)]
        to: Vec<String>,
        #[arg(long)]
        subject: String,
        #[arg(long, default_value = "")]
        body: String,
        #[arg(long)]
        thread: Option<String>,
    },
    Inbox {
        address: String,
        #[arg(long)]
        unread: bool,
    },
    Ack {
        id: String,
        reader: String,
    },
    /// Cancel a queued message before anyone claims it
    Revoke {
        id: String,
        sender: String,
    },
}

#[derive(Subcommand)]
enum QueueCommands {
    Create { name: String },
    Claim { name: String, worker: String },
    Depth { name: String },
    Close { name: String },
}

#[derive(Subcommand)]
enum ChannelCommands {
    Create {
        name: String,
        #[arg(long, default_value_t = 0)]
        retain_count: u64,
        #[arg(long, default_value_t = 0)]
        retain_secs: u64,
        #[arg(long)]
        retention_required: bool,
    },
    History {
        name: String,
    },
}

#[derive(Subcommand)]
enum GroupCommands {
    Create {
        name: String,
        #[arg(long)]
        member: Vec<String>,
    },
}

#[derive(Subcommand)]
enum MqCommands {
    /// Ready merge requests for a rig
    List { rig: String },
    /// File a merge request for a finished branch
    Add {
        rig: String,
        source_branch: String,
        #[arg(long)]
        target: Option<String>,
        #[arg(long)]
        source_issue: Option<String>,
    },
    /// Process one MR (or the next ready one)
    Process {
        rig: String,
        #[arg(long)]
        mr: Option<String>,
    },
    /// Record the mayor's semantic arbitration for a held MR
    Resolve {
        rig: String,
        mr: String,
        #[arg(long, default_value = "arbitrated")]
        rationale: String,
    },
}

#[derive(Subcommand)]
enum DecisionCommands {
    Request {
        #[arg(long)]
        requester: String,
        #[arg(long)]
        question: String,
        /// label:description, up to four
        #[arg(long, required = true)]
        option: Vec<String>,
        #[arg(long)]
        context: Option<String>,
        #[arg(long)]
        urgency: Option<String>,
        #[arg(long)]
        recommend: Option<u32>,
        #[arg(long)]
        blocker: Vec<String>,
    },
    Resolve {
        id: String,
        choice: u32,
        #[arg(long)]
        rationale: Option<String>,
        #[arg(long, default_value = "human")]
        by: String,
    },
    /// Answer with free text instead of a numbered option
    Respond {
        id: String,
        text: String,
        #[arg(long, default_value = "human")]
        by: String,
    },
    AutoClose {
        #[arg(long)]
        threshold_secs: Option<u64>,
    },
    List,
}

#[derive(Subcommand)]
enum AgentCommands {
    /// Declare an agent bead (the control loop will start it)
    Add {
        rig: String,
        role: String,
        name: String,
        #[arg(long, default_value = "local")]
        target: String,
    },
    List,
    Start {
        id: String,
    },
    Stop {
        id: String,
    },
    Observe {
        id: String,
        #[arg(long, default_value_t = 40)]
        lines: u32,
    },
    Nudge {
        id: String,
        text: String,
    },
}

#[derive(Subcommand)]
enum InjectCommands {
    Enqueue {
        session: String,
        kind: String,
        content: String,
    },
    Drain {
        session: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let started = Instant::now();
    let json_mode = cli.json;
    init_tracing();

    match run(cli).await {
        Ok((data, human)) => {
            output::emit(json_mode, data, &human, started);
        }
        Err(e) => {
            if json_mode {
                println!("{}", output::error_envelope(&e, started));
            } else {
                eprintln!("error: {e}");
                for hint in e.hints() {
                    eprintln!("hint: {hint}");
                }
            }
            std::process::exit(e.exit_code());
        }
    }
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_env("GT_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn open_town(cli_town: &Option<PathBuf>) -> Result<Town, GtError> {
    let root = Town::discover_root(cli_town.as_deref());
    Town::open(&root).map_err(GtError::from)
}

fn beads_value(beads: &[Bead]) -> Value {
    json!({ "beads": beads, "count": beads.len() })
}

async fn run(cli: Cli) -> Result<(Value, String), GtError> {
    let json_mode = cli.json;
    match cli.command {
        Commands::Init { name } => {
            let root = Town::discover_root(cli.town.as_deref());
            let town = Town::init(&root, &name)?;
            Ok((
                json!({ "town": town.identity.name, "root": root, "town_id": town.identity.town_id }),
                format!("initialized town '{name}' at {}", root.display()),
            ))
        }

        Commands::Rig { command } => {
            let mut town = open_town(&cli.town)?;
            match command {
                RigCommands::Add {
                    name,
                    repo_url,
                    prefix,
                    default_branch,
                    strategy,
                    test_command,
                    semantic_merge,
                } => {
                    let merge_strategy = MergeStrategy::parse(&strategy).ok_or_else(|| {
                        GtError::Other(anyhow::anyhow!("unknown merge strategy '{strategy}'"))
                    })?;
                    town.add_rig(
                        &name,
                        &repo_url,
                        RigConfig {
                            repo_url: repo_url.clone(),
                            prefix: prefix.clone(),
                            default_branch,
                            merge_strategy,
                            semantic_merge,
                            test_command,
                        },
                    )?;
                    Ok((
                        json!({ "rig": name, "prefix": prefix }),
                        format!("registered rig '{name}' with prefix '{prefix}'"),
                    ))
                }
                RigCommands::List => {
                    let human = town
                        .rigs
                        .iter()
                        .map(|(name, cfg)| format!("{name}\t{}\t{}", cfg.prefix, cfg.repo_url))
                        .collect::<Vec<_>>()
                        .join("\n");
                    Ok((json!({ "rigs": town.rigs }), human))
                }
            }
        }

        Commands::Routes { command } => {
            let town = open_town(&cli.town)?;
            match command {
                RouteCommands::Add { prefix, path } => {
                    town.beads.routes().add(&prefix, &path)?;
                    Ok((
                        json!({ "prefix": prefix, "path": path }),
                        format!("route {prefix} -> {path}"),
                    ))
                }
                RouteCommands::List => {
                    let routes = town.beads.routes().list();
                    let human = routes
                        .iter()
                        .map(|r| format!("{}\t{}", r.prefix, r.path))
                        .collect::<Vec<_>>()
                        .join("\n");
                    Ok((json!({ "routes": routes }), human))
                }
            }
        }

        Commands::Daemon => {
            let town = open_town(&cli.town)?;
            let paths = town.paths.clone();
            let identity = Identity {
                town_root: paths.root().to_path_buf(),
                town_name: town.identity.name.clone(),
                daemon_token: town.daemon_token()?,
            };
            let tunables = town.tunables.clone();
            let daemon = Daemon::new(town).map_err(GtError::Other)?;
            let state = daemon.state();
            let runner = Arc::new(Runner::new(state.beads.clone(), paths, identity));
            let control = ControlLoop::new(
                state.beads.clone(),
                runner,
                state.sched.clone(),
                state.mail.clone(),
                state.decisions.clone(),
                tunables,
            );
            let cancel = CancellationToken::new();
            let ctrlc_cancel = cancel.clone();
            tokio::spawn(async move {
                let _ = tokio::signal::ctrl_c().await;
                ctrlc_cancel.cancel();
            });
            let loop_cancel = control.cancellation();
            let control = Arc::new(control);
            let control_task = control.clone();
            tokio::spawn(async move { control_task.run().await });
            let result = daemon.serve(cancel).await;
            loop_cancel.cancel();
            result.map_err(GtError::Other)?;
            Ok((json!({ "daemon": "stopped" }), "daemon stopped".into()))
        }

        Commands::Bead { command } => {
            let town = open_town(&cli.town)?;
            let state = DaemonState::new(&town).map_err(GtError::Other)?;
            match command {
                BeadCommands::Create {
                    id,
                    title,
                    r#type,
                    description,
                    priority,
                    label,
                    parent,
                } => {
                    let bead_type = BeadType::parse(&r#type).ok_or_else(|| {
                        GtError::Other(anyhow::anyhow!("unknown bead type '{}'", r#type))
                    })?;
                    let mut bead =
                        Bead::new(&id, &title, bead_type).with_description(&description);
                    if let Some(p) = priority {
                        bead.priority = p;
                    }
                    for l in label {
                        bead.labels.insert(l);
                    }
                    bead.parent = parent;
                    let created = state.beads.create(&bead)?;
                    Ok((serde_json::to_value(&created).unwrap_or_default(), format!("created {id}")))
                }
                BeadCommands::Show { id } => {
                    let bead = state.beads.show(&id)?;
                    let human = format!(
                        "{}\t{}\t{}\t{}",
                        bead.id,
                        bead.bead_type.as_str(),
                        bead.status.as_str(),
                        bead.title
                    );
                    Ok((serde_json::to_value(&bead).unwrap_or_default(), human))
                }
                BeadCommands::List {
                    prefix,
                    status,
                    r#type,
                    label,
                } => {
                    let mut filter = ListFilter::default();
                    filter.status = status.as_deref().and_then(BeadStatus::parse);
                    filter.bead_type = r#type.as_deref().and_then(BeadType::parse);
                    filter.label = label;
                    let found = state.beads.list(&prefix, &filter)?;
                    let human = found
                        .iter()
                        .map(|b| format!("{}\t{}\t{}", b.id, b.status.as_str(), b.title))
                        .collect::<Vec<_>>()
                        .join("\n");
                    Ok((beads_value(&found), human))
                }
                BeadCommands::Ready { prefix, parent } => {
                    let ready = state.beads.ready(&prefix, parent.as_deref())?;
                    let human = ready
                        .iter()
                        .map(|b| format!("{}\t{}", b.id, b.title))
                        .collect::<Vec<_>>()
                        .join("\n");
                    Ok((beads_value(&ready), human))
                }
                BeadCommands::Close { id, reason } => {
                    let closed = state.beads.close(&id, reason.as_deref())?;
                    state.sched.land_convoys(&id)?;
                    Ok((serde_json::to_value(&closed).unwrap_or_default(), format!("closed {id}")))
                }
                BeadCommands::Dep { blocked, blocker } => {
                    state.beads.add_dependency(&blocked, &blocker)?;
                    Ok((
                        json!({ "blocked": blocked, "blocker": blocker }),
                        format!("{blocked} blocked_by {blocker}"),
                    ))
                }
            }
        }

        Commands::Hook { agent, bead } => {
            let town = open_town(&cli.town)?;
            let state = DaemonState::new(&town).map_err(GtError::Other)?;
            state.sched.hook(&agent, &bead).await?;
            Ok((
                json!({ "agent": agent, "bead": bead }),
                format!("hooked {bead} to {agent}"),
            ))
        }
        Commands::Unhook { agent } => {
            let town = open_town(&cli.town)?;
            let state = DaemonState::new(&town).map_err(GtError::Other)?;
            let released = state.sched.unhook(&agent).await?;
            Ok((json!({ "released": released }), format!("released {released}")))
        }
        Commands::Continue { bead } => {
            let town = open_town(&cli.town)?;
            let state = DaemonState::new(&town).map_err(GtError::Other)?;
            let next = state.sched.continue_bead(&bead).await?;
            let human = match &next {
                Some(id) => format!("closed {bead}; hooked {id}"),
                None => format!("closed {bead}"),
            };
            Ok((json!({ "closed": bead, "next": next }), human))
        }

        Commands::Mail { command } => {
            let town = open_town(&cli.town)?;
            let state = DaemonState::new(&town).map_err(GtError::Other)?;
            match command {
                MailCommands::Send {
                    from,
                    to,
                    subject,
                    body,
                    thread,
                } => {
                    let ids = state
                        .mail
                        .send(&Draft {
                            from,
                            to,
                            subject,
                            body,
                            thread_id: thread,
                            priority: None,
                            attachments: Vec::new(),
                        })
                        .await?;
                    let human = format!("sent {} message(s)", ids.len());
                    Ok((json!({ "message_ids": ids }), human))
                }
                MailCommands::Inbox { address, unread } => {
                    let messages = state.mail.inbox(&address, unread)?;
                    let human = messages
                        .iter()
                        .map(|m| format!("{}\t{}", m.id, m.title))
                        .collect::<Vec<_>>()
                        .join("\n");
                    Ok((beads_value(&messages), human))
                }
                MailCommands::Ack { id, reader } => {
                    state.mail.ack(&id, &reader)?;
                    Ok((json!({ "acked": id }), String::new()))
                }
                MailCommands::Revoke { id, sender } => {
                    state.mail.revoke(&id, &sender)?;
                    Ok((json!({ "revoked": id }), format!("revoked {id}")))
                }
            }
        }

        Commands::Queue { command } => {
            let town = open_town(&cli.town)?;
            let state = DaemonState::new(&town).map_err(GtError::Other)?;
            match command {
                QueueCommands::Create { name } => {
                    let bead = state.mail.create_queue(&name)?;
                    Ok((serde_json::to_value(&bead).unwrap_or_default(), format!("queue:{name}")))
                }
                QueueCommands::Claim { name, worker } => match state.mail.claim(&name, &worker)? {
                    Some(message) => {
                        let human = format!("{}\t{}", message.id, message.title);
                        Ok((serde_json::to_value(&message).unwrap_or_default(), human))
                    }
                    None => Ok((json!({ "message": null }), "queue empty".into())),
                },
                QueueCommands::Depth { name } => {
                    let depth = state.mail.queue_depth(&name)?;
                    Ok((json!({ "queue": name, "depth": depth }), depth.to_string()))
                }
                QueueCommands::Close { name } => {
                    state.mail.close_queue(&name)?;
                    Ok((json!({ "closed": name }), format!("closed queue:{name}")))
                }
            }
        }

        Commands::Channel { command } => {
            let town = open_town(&cli.town)?;
            let state = DaemonState::new(&town).map_err(GtError::Other)?;
            match command {
                ChannelCommands::Create {
                    name,
                    retain_count,
                    retain_secs,
                    retention_required,
                } => {
                    let bead = state.mail.create_channel(
                        &name,
                        ChannelFields {
                            retention_count: retain_count,
                            retention_secs: retain_secs,
                            retention_required,
                        },
                    )?;
                    Ok((serde_json::to_value(&bead).unwrap_or_default(), format!("channel:{name}")))
                }
                ChannelCommands::History { name } => {
                    let messages = state.mail.channel_history(&name)?;
                    let human = messages
                        .iter()
                        .map(|m| format!("{}\t{}", m.id, m.title))
                        .collect::<Vec<_>>()
                        .join("\n");
                    Ok((beads_value(&messages), human))
                }
            }
        }

        Commands::Group { command } => {
            let town = open_town(&cli.town)?;
            let state = DaemonState::new(&town).map_err(GtError::Other)?;
            match command {
                GroupCommands::Create { name, member } => {
                    let bead = state.mail.create_group(&name, member)?;
                    Ok((serde_json::to_value(&bead).unwrap_or_default(), format!("group:{name}")))
                }
            }
        }

        Commands::Mq { command } => {
            let town = open_town(&cli.town)?;
            let state = DaemonState::new(&town).map_err(GtError::Other)?;
            match command {
                MqCommands::List { rig } => {
                    let refinery = build_refinery(&town, &state, &rig)?;
                    let ready = refinery.list_ready()?;
                    let human = ready
                        .iter()
                        .map(|b| format!("{}\t{}", b.id, b.title))
                        .collect::<Vec<_>>()
                        .join("\n");
                    Ok((beads_value(&ready), human))
                }
                MqCommands::Add {
                    rig,
                    source_branch,
                    target,
                    source_issue,
                } => {
                    let cfg = town.rig(&rig).map_err(GtError::Other)?.clone();
                    let refinery = build_refinery(&town, &state, &rig)?;
                    let target = target.unwrap_or(cfg.default_branch);
                    let mr = refinery.create_merge_request(
                        &source_branch,
                        &target,
                        source_issue.as_deref(),
                    )?;
                    Ok((serde_json::to_value(&mr).unwrap_or_default(), format!("filed {}", mr.id)))
                }
                MqCommands::Process { rig, mr } => {
                    let refinery = build_refinery(&town, &state, &rig)?;
                    let outcome = match mr {
                        Some(id) => {
                            refinery.claim(&id, "gt-cli")?;
                            refinery.process(&id).await?
                        }
                        None => refinery.process_next().await?,
                    };
                    let exit = outcome.exit_code();
                    let label = mq_outcome_label(&outcome);
                    let data = json!({ "outcome": label, "exit": exit });
                    if exit != 0 {
                        // Non-merge outcomes surface their state through the
                        // documented exit codes, still in envelope form.
                        output::emit(json_mode, data, label, Instant::now());
                        std::process::exit(exit);
                    }
                    Ok((data, "merged".into()))
                }
                MqCommands::Resolve { rig, mr, rationale } => {
                    let refinery = build_refinery(&town, &state, &rig)?;
                    refinery.record_semantic_resolution(&mr, &rationale)?;
                    Ok((json!({ "resolved": mr }), format!("semantic hold on {mr} resolved")))
                }
            }
        }

        Commands::Decision { command } => {
            let town = open_town(&cli.town)?;
            let state = DaemonState::new(&town).map_err(GtError::Other)?;
            match command {
                DecisionCommands::Request {
                    requester,
                    question,
                    option,
                    context,
                    urgency,
                    recommend,
                    blocker,
                } => {
                    let options = option
                        .iter()
                        .map(|raw| {
                            let (label, description) =
                                raw.split_once(':').unwrap_or((raw.as_str(), ""));
                            gastown::beads::DecisionOption {
                                label: label.to_string(),
                                description: description.to_string(),
                                ..Default::default()
                            }
                        })
                        .collect();
                    let bead = state
                        .decisions
                        .request(DecisionRequest {
                            requester,
                            question,
                            context,
                            options,
                            recommended_index: recommend,
                            urgency,
                            blockers: blocker,
                            ..Default::default()
                        })
                        .await?;
                    Ok((serde_json::to_value(&bead).unwrap_or_default(), format!("requested {}", bead.id)))
                }
                DecisionCommands::Resolve {
                    id,
                    choice,
                    rationale,
                    by,
                } => {
                    let bead = state
                        .decisions
                        .resolve(&id, choice, rationale.as_deref(), &by)
                        .await?;
                    Ok((serde_json::to_value(&bead).unwrap_or_default(), format!("resolved {id} with option {choice}")))
                }
                DecisionCommands::Respond { id, text, by } => {
                    let bead = state.decisions.respond_text(&id, &text, &by).await?;
                    Ok((serde_json::to_value(&bead).unwrap_or_default(), format!("resolved {id} with custom text")))
                }
                DecisionCommands::AutoClose { threshold_secs } => {
                    let threshold = chrono::Duration::seconds(
                        threshold_secs.unwrap_or(town.tunables.decision_auto_close_secs) as i64,
                    );
                    let closed = state.decisions.auto_close(threshold)?;
                    let human = format!("auto-closed {} decision(s)", closed.len());
                    Ok((json!({ "closed": closed }), human))
                }
                DecisionCommands::List => {
                    let pending = state.decisions.all_pending()?;
                    let human = pending
                        .iter()
                        .map(|d| format!("{}\t{}", d.id, d.title))
                        .collect::<Vec<_>>()
                        .join("\n");
                    Ok((beads_value(&pending), human))
                }
            }
        }

        Commands::Agent { command } => {
            let town = open_town(&cli.town)?;
            let state = DaemonState::new(&town).map_err(GtError::Other)?;
            let runner = build_runner(&town, &state)?;
            match command {
                AgentCommands::Add {
                    rig,
                    role,
                    name,
                    target,
                } => {
                    use gastown::beads::types::{AgentFields, BeadFields, ExecutionTarget, RoleType};
                    let role_type = RoleType::parse(&role).ok_or_else(|| {
                        GtError::Other(anyhow::anyhow!("unknown role '{role}'"))
                    })?;
                    let execution_target = match target.as_str() {
                        "local" => ExecutionTarget::Local,
                        "k8s" => ExecutionTarget::K8s,
                        other => {
                            return Err(GtError::Other(anyhow::anyhow!(
                                "unknown execution target '{other}'"
                            )));
                        }
                    };
                    let prefix = town.rig(&rig).map(|c| c.prefix.clone()).unwrap_or_else(|_| "hq".into());
                    let id = format!("{prefix}-agent-{name}");
                    let bead = Bead::new(&id, &name, BeadType::Agent)
                        .with_label(gastown::beads::LABEL_AGENT)
                        .with_fields(BeadFields::Agent(AgentFields {
                            role_type: Some(role_type),
                            rig: Some(rig.clone()),
                            agent_name: Some(name.clone()),
                            execution_target,
                            ..Default::default()
                        }));
                    let created = state.beads.create(&bead)?;
                    Ok((serde_json::to_value(&created).unwrap_or_default(), format!("declared agent {id}")))
                }
                AgentCommands::List => {
                    let agents = state
                        .beads
                        .list_all(&ListFilter::open().with_type(BeadType::Agent))?;
                    let human = agents
                        .iter()
                        .map(|a| {
                            let state_name = a
                                .fields
                                .as_agent()
                                .map(|f| f.agent_state.as_str())
                                .unwrap_or("?");
                            format!("{}\t{}\t{}", a.id, state_name, a.title)
                        })
                        .collect::<Vec<_>>()
                        .join("\n");
                    Ok((beads_value(&agents), human))
                }
                AgentCommands::Start { id } => {
                    let info = runner.start(&id).await?;
                    Ok((
                        json!({
                            "agent": id,
                            "session": info.session_name,
                            "pod": info.pod_name,
                        }),
                        format!("started {id}"),
                    ))
                }
                AgentCommands::Stop { id } => {
                    runner.stop(&id).await?;
                    Ok((json!({ "stopped": id }), format!("stopped {id}")))
                }
                AgentCommands::Observe { id, lines } => {
                    let screen = runner.observe(&id, lines).await?;
                    Ok((json!({ "agent": id, "screen": screen }), screen))
                }
                AgentCommands::Nudge { id, text } => {
                    state
                        .injector
                        .enqueue(&id, EntryKind::Nudge, &text)
                        .await?;
                    Ok((json!({ "nudged": id }), format!("nudged {id}")))
                }
            }
        }

        Commands::Reconcile => {
            let town = open_town(&cli.town)?;
            let state = DaemonState::new(&town).map_err(GtError::Other)?;
            let runner = build_runner(&town, &state)?;
            let control = ControlLoop::new(
                state.beads.clone(),
                runner,
                state.sched.clone(),
                state.mail.clone(),
                state.decisions.clone(),
                town.tunables.clone(),
            );
            let report = control.reconcile().await?;
            let human = format!(
                "started {} stopped {} stuck {} dead {} restarted {}",
                report.started.len(),
                report.stopped.len(),
                report.marked_stuck.len(),
                report.marked_dead.len(),
                report.restarted.len()
            );
            Ok((
                json!({
                    "started": report.started,
                    "stopped": report.stopped,
                    "marked_idle": report.marked_idle,
                    "marked_stuck": report.marked_stuck,
                    "marked_dead": report.marked_dead,
                    "restarted": report.restarted,
                    "escalated": report.escalated,
                    "slots_released": report.slots_released,
                    "decisions_swept": report.decisions_swept,
                }),
                human,
            ))
        }

        Commands::Inject { command } => {
            let town = open_town(&cli.town)?;
            let state = DaemonState::new(&town).map_err(GtError::Other)?;
            match command {
                InjectCommands::Enqueue {
                    session,
                    kind,
                    content,
                } => {
                    let kind = EntryKind::parse(&kind).ok_or_else(|| {
                        GtError::Other(anyhow::anyhow!("unknown entry kind '{kind}'"))
                    })?;
                    state.injector.enqueue(&session, kind, &content).await?;
                    Ok((json!({ "enqueued": session }), String::new()))
                }
                InjectCommands::Drain { session } => {
                    let entries = state.injector.drain(&session).await?;
                    let human = entries
                        .iter()
                        .map(|e| format!("[{}] {}", e.kind.as_str(), e.content))
                        .collect::<Vec<_>>()
                        .join("\n");
                    Ok((
                        json!({ "entries": entries, "count": entries.len() }),
                        human,
                    ))
                }
            }
        }
    }
}

fn mq_outcome_label(outcome: &gastown::refinery::MergeOutcome) -> &'static str {
    use gastown::refinery::MergeOutcome;
    match outcome {
        MergeOutcome::Merged => "merged",
        MergeOutcome::Conflict { .. } => "conflict",
        MergeOutcome::TestsFailed => "tests_failed",
        MergeOutcome::QueueEmpty => "queue_empty",
        MergeOutcome::SemanticHold { .. } => "semantic_hold",
    }
}

fn build_runner(town: &Town, state: &Arc<DaemonState>) -> Result<Arc<Runner>, GtError> {
    let identity = Identity {
        town_root: town.paths.root().to_path_buf(),
        town_name: town.identity.name.clone(),
        daemon_token: town.daemon_token()?,
    };
    Ok(Arc::new(Runner::new(
        state.beads.clone(),
        town.paths.clone(),
        identity,
    )))
}

/// Locate the rig's refinery agent bead and assemble a refinery over its
/// checkout.
fn build_refinery(
    town: &Town,
    state: &Arc<DaemonState>,
    rig: &str,
) -> Result<Refinery, GtError> {
    let cfg = town.rig(rig).map_err(GtError::Other)?.clone();
    let agents = state.beads.list(
        &cfg.prefix,
        &ListFilter::open().with_type(BeadType::Agent),
    )?;
    let refinery_bead = agents
        .iter()
        .find(|a| {
            a.fields
                .as_agent()
                .map(|f| {
                    f.role_type == Some(gastown::beads::types::RoleType::Refinery)
                        && f.rig.as_deref() == Some(rig)
                })
                .unwrap_or(false)
        })
        .map(|a| a.id.clone())
        .ok_or_else(|| {
            GtError::Store(StoreError::NotFound {
                id: format!("{rig}/refinery"),
            })
        })?;
    let repo_dir = town.paths.role_dir(rig, "refinery", None);
    Ok(Refinery::new(
        state.beads.clone(),
        state.mail.clone(),
        rig,
        cfg,
        repo_dir,
        &refinery_bead,
        &refinery_bead,
        town.tunables.clone(),
    ))
}
