//! The town daemon: one long-lived process exposing the component API over
//! a local stream socket and JSON-over-HTTP, plus a multiplexed event
//! stream with bounded replay.
//!
//! The daemon owns no business logic; it wires the components together,
//! authorizes callers with the shared token, and fans change events out to
//! subscribers. Fatal store problems surface at `/healthz`, never as silent
//! wedges.

pub mod proto;
pub mod rpc;

use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use fs2::FileExt;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::beads::Beads;
use crate::decision::DecisionGate;
use crate::inject::Injector;
use crate::mail::MailBus;
use crate::sched::Scheduler;
use crate::town::{Town, TownPaths, Tunables};
use proto::{ReplayBuffer, Request, Response, StreamEvent};

/// Shared daemon state: every component handle plus the stream plumbing.
pub struct DaemonState {
    pub town_name: String,
    pub beads: Arc<Beads>,
    pub injector: Arc<Injector>,
    pub mail: Arc<MailBus>,
    pub sched: Arc<Scheduler>,
    pub decisions: Arc<DecisionGate>,
    pub tunables: Tunables,
    pub token: String,
    pub replay: Mutex<ReplayBuffer>,
    pub stream: broadcast::Sender<StreamEvent>,
}

impl DaemonState {
    /// Wire the component graph for an opened town.
    pub fn new(town: &Town) -> Result<Arc<Self>> {
        let beads = Arc::new(Beads::open(&town.paths.routes_file())?);
        let injector = Arc::new(Injector::new(beads.clone()));
        let mail = Arc::new(MailBus::new(beads.clone(), injector.clone()));
        let sched = Arc::new(Scheduler::new(beads.clone(), injector.clone()));
        let decisions = Arc::new(DecisionGate::new(
            beads.clone(),
            injector.clone(),
            mail.clone(),
        ));
        let (stream, _) = broadcast::channel(town.tunables.subscriber_buffer.max(1));
        Ok(Arc::new(Self {
            town_name: town.identity.name.clone(),
            beads,
            injector,
            mail,
            sched,
            decisions,
            tunables: town.tunables.clone(),
            token: town.daemon_token()?,
            replay: Mutex::new(ReplayBuffer::new(town.tunables.event_replay)),
            stream,
        }))
    }

    /// Stamp a change event and fan it out. Slow subscribers are dropped by
    /// the broadcast channel's bounded buffer.
    fn publish(&self, subject: &str, data: serde_json::Value) {
        let event = {
            let mut replay = self.replay.lock().expect("replay lock");
            replay.push(subject, data)
        };
        let _ = self.stream.send(event);
    }
}

pub struct Daemon {
    state: Arc<DaemonState>,
    paths: TownPaths,
    /// Held for the daemon's lifetime; the lock is the single-instance
    /// guarantee.
    _pidfile: std::fs::File,
}

impl Daemon {
    /// Open the town and take the pidfile lock. A second daemon on the same
    /// town fails fast.
    pub fn new(town: Town) -> Result<Self> {
        let paths = town.paths.clone();
        std::fs::create_dir_all(paths.runtime_dir())?;
        let pidfile = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(paths.pidfile())?;
        pidfile.try_lock_exclusive().map_err(|_| {
            crate::errors::DaemonError::AlreadyRunning {
                path: paths.pidfile(),
            }
        })?;
        use std::io::Write;
        let mut f = &pidfile;
        let _ = writeln!(f, "{}", std::process::id());

        let state = DaemonState::new(&town)?;
        Ok(Self {
            state,
            paths,
            _pidfile: pidfile,
        })
    }

    pub fn state(&self) -> Arc<DaemonState> {
        self.state.clone()
    }

    /// Serve both transports until cancelled.
    pub async fn serve(&self, cancel: CancellationToken) -> Result<()> {
        // Event pump: store changes -> replay window + live stream.
        let pump_state = self.state.clone();
        let mut events = self.state.beads.subscribe();
        let pump_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = pump_cancel.cancelled() => break,
                    ev = events.recv() => match ev {
                        Ok(ev) => {
                            let subject = ev.subject.clone();
                            let data = serde_json::to_value(&ev).unwrap_or_default();
                            pump_state.publish(&subject, data);
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(skipped = n, "event pump lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });

        // Local stream-socket transport.
        let socket_path = self.paths.socket_path();
        if socket_path.exists() {
            std::fs::remove_file(&socket_path)?;
        }
        let listener = UnixListener::bind(&socket_path)
            .with_context(|| format!("binding {}", socket_path.display()))?;
        let sock_state = self.state.clone();
        let sock_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = sock_cancel.cancelled() => break,
                    accepted = listener.accept() => {
                        let Ok((stream, _)) = accepted else { continue };
                        let state = sock_state.clone();
                        tokio::spawn(serve_socket_client(state, stream));
                    }
                }
            }
        });

        // HTTP/WS transport for remote controllers.
        let app = router(self.state.clone());
        let addr = format!("127.0.0.1:{}", self.state.tunables.http_port);
        let tcp = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("binding {addr}"))?;
        info!(%addr, socket = %socket_path.display(), "daemon listening");
        axum::serve(tcp, app)
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await?;
        Ok(())
    }
}

/// Newline-delimited JSON request/response over the local socket.
async fn serve_socket_client(state: Arc<DaemonState>, stream: tokio::net::UnixStream) {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<Request>(&line) {
            Ok(req) => rpc::dispatch(&state, req).await,
            Err(e) => Response::err(
                "",
                &crate::errors::GtError::from(crate::errors::DaemonError::BadEnvelope(
                    e.to_string(),
                )),
            ),
        };
        let Ok(mut out) = serde_json::to_vec(&response) else {
            continue;
        };
        out.push(b'\n');
        if write.write_all(&out).await.is_err() {
            break;
        }
    }
}

/// Build the HTTP router (exposed for in-process tests).
pub fn router(state: Arc<DaemonState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/rpc", post(http_rpc))
        .route("/v1/events", get(ws_events))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn healthz(State(state): State<Arc<DaemonState>>) -> impl IntoResponse {
    // A store that cannot enumerate its routes is a fatal condition the
    // health check must expose.
    let routes = state.beads.routes().prefixes();
    Json(serde_json::json!({
        "status": "ok",
        "town": state.town_name,
        "routes": routes,
        "replay_depth": state.replay.lock().map(|r| r.len()).unwrap_or(0),
    }))
}

async fn http_rpc(
    State(state): State<Arc<DaemonState>>,
    Json(req): Json<Request>,
) -> Json<Response> {
    Json(rpc::dispatch(&state, req).await)
}

#[derive(serde::Deserialize)]
struct EventsQuery {
    token: Option<String>,
    /// Optional subject-prefix filter.
    subject: Option<String>,
}

async fn ws_events(
    State(state): State<Arc<DaemonState>>,
    Query(query): Query<EventsQuery>,
    ws: WebSocketUpgrade,
) -> axum::response::Response {
    if query.token.as_deref() != Some(state.token.as_str()) {
        return (axum::http::StatusCode::FORBIDDEN, "bad token").into_response();
    }
    ws.on_upgrade(move |socket| stream_events(state, socket, query.subject))
}

/// Replay the durable window, then forward live events. A subscriber that
/// falls behind its bounded buffer is closed rather than back-pressuring
/// the daemon.
async fn stream_events(state: Arc<DaemonState>, mut socket: WebSocket, subject: Option<String>) {
    let backlog = {
        let replay = state.replay.lock().expect("replay lock");
        replay.replay(subject.as_deref())
    };
    let mut live = state.stream.subscribe();
    for event in backlog {
        if send_event(&mut socket, &event).await.is_err() {
            return;
        }
    }
    loop {
        match live.recv().await {
            Ok(event) => {
                if let Some(prefix) = &subject
                    && !event.subject.starts_with(prefix.as_str())
                {
                    continue;
                }
                if send_event(&mut socket, &event).await.is_err() {
                    return;
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(skipped = n, "closing slow event subscriber");
                let _ = socket.send(Message::Close(None)).await;
                return;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

async fn send_event(socket: &mut WebSocket, event: &StreamEvent) -> Result<(), axum::Error> {
    let text = serde_json::to_string(event).unwrap_or_default();
    socket.send(Message::Text(text.into())).await
}
