use std::collections::HashMap;
use std::env;
use std::fs;
use std::io::BufRead;
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use herald_contracts::commands::{parse_command, parse_external_id, Command, HELP_COMMANDS};
use herald_contracts::events::{EventPayload, EventWriter};
use herald_contracts::links::LinkStore;
use herald_contracts::presence::{translate, PresenceSnapshot, RichPresence};
use herald_engine::{
    portrait_prompt, synthesize_logged, Artist, BannerComposer, BannerFields, DryrunSynthesizer,
    GeminiSynthesizer, ImageSynthesizer,
};
use indexmap::IndexMap;
use serde_json::{json, Map, Value};
use tungstenite::stream::MaybeTlsStream;
use tungstenite::{Error as WsError, Message, WebSocket};
use uuid::Uuid;

const HANDSHAKE_TTL: Duration = Duration::from_secs(300);
const GATEWAY_READ_TIMEOUT: Duration = Duration::from_millis(500);
const LOGIN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(
    name = "herald",
    version,
    about = "Account-linking chronicle bot with rich-presence banners"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the interactive bot loop.
    Run(RunArgs),
    /// Compose one banner from a presence payload file, then exit.
    Compose(ComposeArgs),
}

#[derive(Args)]
struct RunArgs {
    /// Output directory for banners, the link store and the event log.
    #[arg(long, default_value = "herald_out")]
    out: PathBuf,
    /// Image synthesis backend: dryrun or gemini.
    #[arg(long, default_value = "dryrun")]
    synth: String,
    #[arg(long, default_value = "gemini-2.5-flash-image")]
    model: String,
    /// Background layer asset (resized to the canvas when needed).
    #[arg(long)]
    background: Option<PathBuf>,
    /// Glyph-sheet font asset.
    #[arg(long)]
    font: Option<PathBuf>,
    /// Gateway websocket URL; defaults to HERALD_GATEWAY_URL.
    #[arg(long)]
    gateway: Option<String>,
    /// Requester id assumed for stdin lines without an @<id> prefix.
    #[arg(long, default_value_t = 1)]
    requester: u64,
    /// Link store path; defaults to <out>/links.json.
    #[arg(long)]
    links: Option<PathBuf>,
}

#[derive(Args)]
struct ComposeArgs {
    /// Path to a JSON object file with raw presence fields.
    presence: PathBuf,
    #[arg(long, default_value = "banner.png")]
    out: PathBuf,
    #[arg(long, default_value = "dryrun")]
    synth: String,
    #[arg(long, default_value = "gemini-2.5-flash-image")]
    model: String,
    #[arg(long)]
    background: Option<PathBuf>,
    #[arg(long)]
    font: Option<PathBuf>,
}

fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let outcome = match cli.command {
        Commands::Run(args) => run_bot(args),
        Commands::Compose(args) => run_compose(args),
    };
    match outcome {
        Ok(code) => process::exit(code),
        Err(err) => {
            eprintln!("error: {err:#}");
            process::exit(1);
        }
    }
}

// ---------------------------------------------------------------------------
// Main loop plumbing
// ---------------------------------------------------------------------------

/// Everything the single-threaded command loop consumes. Producers are the
/// stdin reader, the session thread and banner render threads.
#[derive(Debug)]
enum LoopEvent {
    Command { requester: u64, line: String },
    NewPeer { external_id: u64, display_name: String },
    BannerReady { requester: u64, outcome: std::result::Result<PathBuf, String> },
    InputClosed,
}

/// Narrow submission primitive handed to background threads. Submitting
/// never blocks; a `false` return means the loop is gone and the event was
/// dropped.
#[derive(Clone)]
struct LoopHandle {
    tx: Sender<LoopEvent>,
}

impl LoopHandle {
    fn new(tx: Sender<LoopEvent>) -> Self {
        Self { tx }
    }

    fn submit(&self, event: LoopEvent) -> bool {
        self.tx.send(event).is_ok()
    }
}

// ---------------------------------------------------------------------------
// Session gateway client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
struct SessionIdentity {
    user_id: u64,
    display_name: String,
}

#[derive(Debug, Clone, PartialEq)]
enum SessionEvent {
    FriendInvite { external_id: u64, display_name: String },
    Presence { external_id: u64, fields: Map<String, Value> },
    Idle,
    Disconnected,
}

/// One live gateway connection. Implementations poll without blocking
/// longer than the read timeout so session commands stay responsive.
trait SessionClient {
    fn login(&mut self, username: &str, password: &str) -> Result<SessionIdentity>;
    fn poll(&mut self) -> Result<SessionEvent>;
    fn accept_invite(&mut self, external_id: u64) -> Result<()>;
    fn add_friend(&mut self, external_id: u64) -> Result<()>;
    fn logout(&mut self);
}

trait SessionConnector: Send {
    fn connect(&mut self) -> Result<Box<dyn SessionClient>>;
}

struct WsSessionConnector {
    url: String,
}

impl WsSessionConnector {
    fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

impl SessionConnector for WsSessionConnector {
    fn connect(&mut self) -> Result<Box<dyn SessionClient>> {
        let (mut socket, _response) = tungstenite::connect(self.url.as_str())
            .with_context(|| format!("gateway connect failed ({})", self.url))?;
        set_read_timeout(&mut socket, GATEWAY_READ_TIMEOUT)?;
        Ok(Box::new(WsSessionClient { socket }))
    }
}

struct WsSessionClient {
    socket: WebSocket<MaybeTlsStream<TcpStream>>,
}

impl WsSessionClient {
    fn send_json(&mut self, value: &Value) -> Result<()> {
        self.socket
            .send(Message::text(value.to_string()))
            .context("gateway send failed")?;
        Ok(())
    }
}

impl SessionClient for WsSessionClient {
    fn login(&mut self, username: &str, password: &str) -> Result<SessionIdentity> {
        self.send_json(&json!({
            "type": "login",
            "username": username,
            "password": password,
        }))?;

        let deadline = Instant::now() + LOGIN_TIMEOUT;
        while Instant::now() < deadline {
            let message = match self.socket.read() {
                Ok(message) => message,
                Err(err) if is_read_timeout(&err) => continue,
                Err(err) => return Err(err).context("gateway read during login"),
            };
            let Message::Text(text) = message else {
                continue;
            };
            let Ok(value) = serde_json::from_str::<Value>(text.as_str()) else {
                continue;
            };
            match value.get("type").and_then(Value::as_str) {
                Some("logged_on") => {
                    let user_id = value
                        .get("user_id")
                        .and_then(Value::as_u64)
                        .context("logged_on frame without user_id")?;
                    let display_name = value
                        .get("display_name")
                        .and_then(Value::as_str)
                        .unwrap_or("herald")
                        .to_string();
                    self.send_json(&json!({ "type": "set_status", "status": "online" }))?;
                    return Ok(SessionIdentity {
                        user_id,
                        display_name,
                    });
                }
                Some("login_failed") => {
                    let reason = value
                        .get("reason")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown");
                    bail!("gateway rejected login: {reason}");
                }
                _ => {}
            }
        }
        bail!("gateway login timed out")
    }

    fn poll(&mut self) -> Result<SessionEvent> {
        match self.socket.read() {
            Ok(Message::Text(text)) => Ok(session_event_from_text(text.as_str())),
            Ok(Message::Close(_)) => Ok(SessionEvent::Disconnected),
            Ok(_) => Ok(SessionEvent::Idle),
            Err(err) if is_read_timeout(&err) => Ok(SessionEvent::Idle),
            Err(err) if is_transport_error(&err) => Ok(SessionEvent::Disconnected),
            Err(err) => Err(err).context("gateway read failed"),
        }
    }

    fn accept_invite(&mut self, external_id: u64) -> Result<()> {
        self.send_json(&json!({ "type": "accept_invite", "user_id": external_id }))
    }

    fn add_friend(&mut self, external_id: u64) -> Result<()> {
        self.send_json(&json!({ "type": "add_friend", "user_id": external_id }))
    }

    fn logout(&mut self) {
        let _ = self.send_json(&json!({ "type": "logout" }));
        let _ = self.socket.close(None);
    }
}

fn set_read_timeout(
    socket: &mut WebSocket<MaybeTlsStream<TcpStream>>,
    timeout: Duration,
) -> Result<()> {
    let stream = match socket.get_mut() {
        MaybeTlsStream::Plain(stream) => stream,
        MaybeTlsStream::Rustls(tls) => tls.get_mut(),
        _ => return Ok(()),
    };
    stream
        .set_read_timeout(Some(timeout))
        .context("failed to set gateway read timeout")?;
    Ok(())
}

fn is_read_timeout(err: &WsError) -> bool {
    matches!(
        err,
        WsError::Io(io) if matches!(
            io.kind(),
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
        )
    )
}

fn is_transport_error(err: &WsError) -> bool {
    matches!(
        err,
        WsError::ConnectionClosed | WsError::AlreadyClosed | WsError::Io(_) | WsError::Protocol(_)
    )
}

fn session_event_from_text(text: &str) -> SessionEvent {
    match serde_json::from_str::<Value>(text) {
        Ok(value) => session_event_from_payload(&value),
        Err(_) => SessionEvent::Idle,
    }
}

/// Maps one gateway frame to a session event. Unknown or malformed frames
/// are ignored rather than treated as transport failures.
fn session_event_from_payload(value: &Value) -> SessionEvent {
    match value.get("type").and_then(Value::as_str) {
        Some("friend_invite") => {
            let Some(external_id) = value.get("user_id").and_then(Value::as_u64) else {
                return SessionEvent::Idle;
            };
            let display_name = value
                .get("display_name")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string();
            SessionEvent::FriendInvite {
                external_id,
                display_name,
            }
        }
        Some("presence") => {
            let Some(external_id) = value.get("user_id").and_then(Value::as_u64) else {
                return SessionEvent::Idle;
            };
            let fields = value
                .get("fields")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();
            SessionEvent::Presence {
                external_id,
                fields,
            }
        }
        Some("disconnect") => SessionEvent::Disconnected,
        _ => SessionEvent::Idle,
    }
}

// ---------------------------------------------------------------------------
// Session bridge
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum SessionCommand {
    AddFriend(u64),
    Logout,
}

#[derive(Debug, Clone, Copy)]
struct BridgeTuning {
    login_retry: Duration,
    reconnect: Duration,
}

impl BridgeTuning {
    fn from_env() -> Self {
        Self {
            login_retry: env_duration_secs("HERALD_LOGIN_RETRY_SECS", 60, 1, 600),
            reconnect: env_duration_secs("HERALD_RECONNECT_SECS", 10, 1, 120),
        }
    }
}

fn env_duration_secs(key: &str, default: u64, min: u64, max: u64) -> Duration {
    let seconds = env::var(key)
        .ok()
        .and_then(|raw| raw.trim().parse::<u64>().ok())
        .map(|value| value.clamp(min, max))
        .unwrap_or(default);
    Duration::from_secs(seconds)
}

/// Owns the session thread and the state shared with the command loop.
///
/// The thread logs in, auto-accepts friend invites and forwards them to the
/// command loop, and keeps the latest presence payload per peer. Login
/// failures and disconnects are retried forever with backoff until `stop`.
struct SessionBridge {
    events: EventWriter,
    connected: Arc<AtomicBool>,
    identity: Arc<Mutex<Option<SessionIdentity>>>,
    presence: Arc<Mutex<HashMap<u64, Map<String, Value>>>>,
    loop_handle: Arc<Mutex<Option<LoopHandle>>>,
    stop: Arc<AtomicBool>,
    commands: Option<Sender<SessionCommand>>,
    worker: Option<thread::JoinHandle<()>>,
}

impl SessionBridge {
    fn new(events: EventWriter) -> Self {
        Self {
            events,
            connected: Arc::new(AtomicBool::new(false)),
            identity: Arc::new(Mutex::new(None)),
            presence: Arc::new(Mutex::new(HashMap::new())),
            loop_handle: Arc::new(Mutex::new(None)),
            stop: Arc::new(AtomicBool::new(false)),
            commands: None,
            worker: None,
        }
    }

    fn attach_loop(&self, handle: LoopHandle) {
        if let Ok(mut slot) = self.loop_handle.lock() {
            *slot = Some(handle);
        }
    }

    fn start(
        &mut self,
        connector: Box<dyn SessionConnector>,
        username: String,
        password: String,
        tuning: BridgeTuning,
    ) -> Result<()> {
        let (tx, rx) = mpsc::channel();
        let worker = SessionWorker {
            connector,
            username,
            password,
            tuning,
            events: self.events.clone(),
            connected: Arc::clone(&self.connected),
            identity: Arc::clone(&self.identity),
            presence: Arc::clone(&self.presence),
            loop_handle: Arc::clone(&self.loop_handle),
            stop: Arc::clone(&self.stop),
            commands: rx,
        };
        let handle = thread::Builder::new()
            .name("session-bridge".to_string())
            .spawn(move || worker.run())
            .context("failed to spawn session thread")?;
        self.commands = Some(tx);
        self.worker = Some(handle);
        Ok(())
    }

    fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn identity(&self) -> Option<SessionIdentity> {
        self.identity.lock().ok().and_then(|slot| slot.clone())
    }

    fn get_presence(&self, external_id: u64) -> Option<RichPresence> {
        if !self.connected() {
            return None;
        }
        let fields = self
            .presence
            .lock()
            .ok()
            .and_then(|map| map.get(&external_id).cloned())?;
        Some(RichPresence::from_map(fields))
    }

    /// Queues an outbound friend request with the session thread. `true`
    /// means the command was handed to a connected worker, not that the
    /// gateway delivered it; a delivery failure is logged by the worker as
    /// `friend_request_failed`.
    fn request_friend(&self, external_id: u64) -> bool {
        if !self.connected() {
            return false;
        }
        match &self.commands {
            Some(tx) => tx.send(SessionCommand::AddFriend(external_id)).is_ok(),
            None => false,
        }
    }

    fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(tx) = self.commands.take() {
            let _ = tx.send(SessionCommand::Logout);
        }
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

enum PumpExit {
    Stopped,
    Disconnected,
}

struct SessionWorker {
    connector: Box<dyn SessionConnector>,
    username: String,
    password: String,
    tuning: BridgeTuning,
    events: EventWriter,
    connected: Arc<AtomicBool>,
    identity: Arc<Mutex<Option<SessionIdentity>>>,
    presence: Arc<Mutex<HashMap<u64, Map<String, Value>>>>,
    loop_handle: Arc<Mutex<Option<LoopHandle>>>,
    stop: Arc<AtomicBool>,
    commands: Receiver<SessionCommand>,
}

impl SessionWorker {
    fn run(mut self) {
        while !self.stop.load(Ordering::SeqCst) {
            let mut client = match self.connect_and_login() {
                Ok(client) => client,
                Err(err) => {
                    let _ = self.events.emit(
                        "session_login_failed",
                        payload(json!({ "error": format!("{err:#}") })),
                    );
                    self.sleep(self.tuning.login_retry);
                    continue;
                }
            };

            let exit = self.pump(client.as_mut());
            self.connected.store(false, Ordering::SeqCst);
            match exit {
                Ok(PumpExit::Stopped) => {
                    client.logout();
                    break;
                }
                Ok(PumpExit::Disconnected) => {
                    let _ = self
                        .events
                        .emit("session_disconnected", EventPayload::new());
                }
                Err(err) => {
                    let _ = self.events.emit(
                        "session_crashed",
                        payload(json!({ "error": format!("{err:#}") })),
                    );
                }
            }
            self.sleep(self.tuning.reconnect);
        }
        self.connected.store(false, Ordering::SeqCst);
    }

    fn connect_and_login(&mut self) -> Result<Box<dyn SessionClient>> {
        let mut client = self.connector.connect()?;
        let identity = client.login(&self.username, &self.password)?;
        let _ = self.events.emit(
            "session_logged_on",
            payload(json!({
                "user_id": identity.user_id,
                "display_name": identity.display_name.clone(),
            })),
        );
        if let Ok(mut slot) = self.identity.lock() {
            *slot = Some(identity);
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(client)
    }

    fn pump(&self, client: &mut dyn SessionClient) -> Result<PumpExit> {
        loop {
            if self.stop.load(Ordering::SeqCst) {
                return Ok(PumpExit::Stopped);
            }
            while let Ok(command) = self.commands.try_recv() {
                match command {
                    SessionCommand::AddFriend(external_id) => match client.add_friend(external_id)
                    {
                        Ok(()) => {
                            let _ = self.events.emit(
                                "friend_request_sent",
                                payload(json!({ "external_id": external_id })),
                            );
                        }
                        Err(err) => {
                            let _ = self.events.emit(
                                "friend_request_failed",
                                payload(json!({
                                    "external_id": external_id,
                                    "error": format!("{err:#}"),
                                })),
                            );
                        }
                    },
                    SessionCommand::Logout => return Ok(PumpExit::Stopped),
                }
            }

            match client.poll()? {
                SessionEvent::FriendInvite {
                    external_id,
                    display_name,
                } => {
                    client.accept_invite(external_id)?;
                    let _ = self.events.emit(
                        "peer_invite_accepted",
                        payload(json!({
                            "external_id": external_id,
                            "display_name": display_name.clone(),
                        })),
                    );
                    self.forward_new_peer(external_id, display_name);
                }
                SessionEvent::Presence {
                    external_id,
                    fields,
                } => {
                    if let Ok(mut map) = self.presence.lock() {
                        map.insert(external_id, fields);
                    }
                }
                SessionEvent::Idle => {}
                SessionEvent::Disconnected => return Ok(PumpExit::Disconnected),
            }
        }
    }

    /// Hands a new-peer event to the command loop. Without an attached
    /// loop the event is dropped and logged, never queued.
    fn forward_new_peer(&self, external_id: u64, display_name: String) {
        let forwarded = match self.loop_handle.lock() {
            Ok(slot) => slot.as_ref().map(|handle| {
                handle.submit(LoopEvent::NewPeer {
                    external_id,
                    display_name: display_name.clone(),
                })
            }),
            Err(_) => None,
        };
        let reason = match forwarded {
            Some(true) => return,
            Some(false) => "loop_closed",
            None => "loop_detached",
        };
        let _ = self.events.emit(
            "peer_event_dropped",
            payload(json!({
                "external_id": external_id,
                "reason": reason,
            })),
        );
    }

    fn sleep(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        while !self.stop.load(Ordering::SeqCst) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            thread::sleep(remaining.min(Duration::from_millis(50)));
        }
    }
}

// ---------------------------------------------------------------------------
// Link coordinator
// ---------------------------------------------------------------------------

/// What the coordinator needs from the session side; the bridge is the
/// production implementation.
trait SessionPort {
    fn connected(&self) -> bool;
    fn identity(&self) -> Option<SessionIdentity>;
    fn presence_of(&self, external_id: u64) -> Option<RichPresence>;
    fn request_friend(&self, external_id: u64) -> bool;
}

impl SessionPort for SessionBridge {
    fn connected(&self) -> bool {
        SessionBridge::connected(self)
    }

    fn identity(&self) -> Option<SessionIdentity> {
        SessionBridge::identity(self)
    }

    fn presence_of(&self, external_id: u64) -> Option<RichPresence> {
        self.get_presence(external_id)
    }

    fn request_friend(&self, external_id: u64) -> bool {
        SessionBridge::request_friend(self, external_id)
    }
}

#[derive(Debug, Clone)]
struct PeerCandidate {
    external_id: u64,
    display_name: String,
}

#[derive(Debug)]
struct PendingHandshake {
    requester_id: u64,
    expires_at: Instant,
    candidate: Option<PeerCandidate>,
}

#[derive(Debug)]
enum BannerAction {
    Reply(String),
    Render { snapshot: PresenceSnapshot },
}

/// Drives the link handshake state machine and resolves banner requests.
///
/// A new-peer event cannot be attributed to a requester, so it is
/// broadcast to every open handshake as a candidate and disambiguated by
/// `/confirm`: only the requester who opened a handshake can complete it.
/// Handshakes expire lazily; expired rows are swept on the next call that
/// touches the pending table.
struct LinkCoordinator {
    links: LinkStore,
    pending: IndexMap<Uuid, PendingHandshake>,
    events: EventWriter,
}

impl LinkCoordinator {
    fn new(links: LinkStore, events: EventWriter) -> Self {
        Self {
            links,
            pending: IndexMap::new(),
            events,
        }
    }

    fn handle_banner(&mut self, requester: u64, session: &dyn SessionPort) -> BannerAction {
        self.handle_banner_at(requester, session, Instant::now())
    }

    fn handle_banner_at(
        &mut self,
        requester: u64,
        session: &dyn SessionPort,
        now: Instant,
    ) -> BannerAction {
        self.sweep_expired(now);

        if let Some(external_id) = self.links.get(requester) {
            return match session.presence_of(external_id) {
                Some(presence) if !presence.is_empty() => {
                    let _ = self.events.emit(
                        "banner_requested",
                        payload(json!({
                            "requester": requester,
                            "external_id": external_id,
                        })),
                    );
                    BannerAction::Render {
                        snapshot: translate(&presence),
                    }
                }
                _ => BannerAction::Reply(
                    "Could not read your game status. Make sure you are in game and your \
                     rich presence is visible, then try /banner again."
                        .to_string(),
                ),
            };
        }

        if !session.connected() {
            return BannerAction::Reply(
                "The chronicle service is offline right now. Try again shortly.".to_string(),
            );
        }
        let Some(identity) = session.identity() else {
            return BannerAction::Reply(
                "The chronicle service is offline right now. Try again shortly.".to_string(),
            );
        };

        let handle = Uuid::new_v4();
        self.pending.insert(
            handle,
            PendingHandshake {
                requester_id: requester,
                expires_at: now + HANDSHAKE_TTL,
                candidate: None,
            },
        );
        let _ = self.events.emit(
            "link_handshake_opened",
            payload(json!({
                "requester": requester,
                "handle": handle.to_string(),
            })),
        );
        BannerAction::Reply(format!(
            "I need to see your game first. Add the bot account **{name}** (id `{id}`) \
             as a friend, then reply /confirm once I greet you. This offer expires in \
             5 minutes.",
            name = identity.display_name,
            id = identity.user_id,
        ))
    }

    fn handle_new_peer(&mut self, external_id: u64, display_name: &str) -> Vec<(u64, String)> {
        self.handle_new_peer_at(external_id, display_name, Instant::now())
    }

    fn handle_new_peer_at(
        &mut self,
        external_id: u64,
        display_name: &str,
        now: Instant,
    ) -> Vec<(u64, String)> {
        self.sweep_expired(now);

        let mut prompts = Vec::new();
        for pending in self.pending.values_mut() {
            pending.candidate = Some(PeerCandidate {
                external_id,
                display_name: display_name.to_string(),
            });
            prompts.push((
                pending.requester_id,
                format!(
                    "I just accepted a friend request from **{display_name}** \
                     (id `{external_id}`). If that is you, reply /confirm."
                ),
            ));
        }
        if !prompts.is_empty() {
            let _ = self.events.emit(
                "link_candidate_broadcast",
                payload(json!({
                    "external_id": external_id,
                    "pending": prompts.len(),
                })),
            );
        }
        prompts
    }

    fn handle_confirm(&mut self, requester: u64) -> String {
        self.handle_confirm_at(requester, Instant::now())
    }

    fn handle_confirm_at(&mut self, requester: u64, now: Instant) -> String {
        self.sweep_expired(now);

        let handle = self
            .pending
            .iter()
            .rev()
            .find(|(_, pending)| pending.requester_id == requester)
            .map(|(handle, _)| *handle);
        let Some(handle) = handle else {
            return if self.links.get(requester).is_some() {
                "You are already linked. Use /banner.".to_string()
            } else {
                "That confirmation is not for you. Start with /banner.".to_string()
            };
        };

        let candidate = self
            .pending
            .get(&handle)
            .and_then(|pending| pending.candidate.clone());
        let Some(candidate) = candidate else {
            return "No friend request has arrived yet. Add the bot account, wait for my \
                    greeting, then /confirm again."
                .to_string();
        };

        if let Err(err) = self.links.upsert(requester, candidate.external_id) {
            let _ = self.events.emit(
                "link_store_error",
                payload(json!({
                    "requester": requester,
                    "error": format!("{err:#}"),
                })),
            );
            return format!("Could not persist the link: {err:#}");
        }
        self.pending.shift_remove(&handle);
        let _ = self.events.emit(
            "link_confirmed",
            payload(json!({
                "requester": requester,
                "external_id": candidate.external_id,
            })),
        );
        format!(
            "Linked to **{name}**! You can now use /banner.",
            name = candidate.display_name
        )
    }

    fn handle_force_add(
        &mut self,
        requester: u64,
        raw_id: &str,
        session: &dyn SessionPort,
    ) -> String {
        let Some(external_id) = parse_external_id(raw_id) else {
            return format!("`{raw_id}` is not a valid account id.");
        };
        if !session.request_friend(external_id) {
            return "Could not send the friend request. The session is offline or the id \
                    is invalid."
                .to_string();
        }
        if let Err(err) = self.links.upsert(requester, external_id) {
            return format!("Friend request sent, but the link could not be stored: {err:#}");
        }
        let _ = self.events.emit(
            "link_forced",
            payload(json!({
                "requester": requester,
                "external_id": external_id,
            })),
        );
        format!(
            "Friend request sent to `{external_id}` and tentatively linked. Accept it, \
             then use /banner."
        )
    }

    fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn sweep_expired(&mut self, now: Instant) {
        let expired: Vec<Uuid> = self
            .pending
            .iter()
            .filter(|(_, pending)| pending.expires_at <= now)
            .map(|(handle, _)| *handle)
            .collect();
        for handle in expired {
            if let Some(pending) = self.pending.shift_remove(&handle) {
                let _ = self.events.emit(
                    "link_handshake_expired",
                    payload(json!({ "requester": pending.requester_id })),
                );
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Bot loop
// ---------------------------------------------------------------------------

#[derive(Debug, PartialEq)]
enum CredentialState {
    Ready { username: String, password: String },
    Placeholder,
    Missing,
}

fn session_credentials() -> CredentialState {
    credential_state(
        non_empty_env("HERALD_SESSION_USERNAME"),
        non_empty_env("HERALD_SESSION_PASSWORD"),
    )
}

/// Template `.env` files ship `your_username`-style values; treating them
/// as real credentials would burn a login retry loop against the gateway,
/// so they are rejected up front.
fn credential_state(username: Option<String>, password: Option<String>) -> CredentialState {
    match (username, password) {
        (Some(username), Some(password)) => {
            if username.contains("your_") || password.contains("your_") {
                CredentialState::Placeholder
            } else {
                CredentialState::Ready { username, password }
            }
        }
        _ => CredentialState::Missing,
    }
}

fn synthesizer_for(synth: &str, model: &str) -> Arc<dyn ImageSynthesizer> {
    match synth {
        "gemini" => Arc::new(GeminiSynthesizer::new(model)),
        _ => Arc::new(DryrunSynthesizer),
    }
}

fn run_bot(args: RunArgs) -> Result<i32> {
    fs::create_dir_all(&args.out)
        .with_context(|| format!("failed to create output dir {}", args.out.display()))?;
    let events = EventWriter::new(args.out.join("events.jsonl"), "herald");
    let _ = events.emit(
        "startup",
        payload(json!({
            "synth": args.synth,
            "out": args.out.to_string_lossy().to_string(),
        })),
    );

    let links_path = args
        .links
        .clone()
        .unwrap_or_else(|| args.out.join("links.json"));
    let mut coordinator = LinkCoordinator::new(LinkStore::new(links_path), events.scoped("links"));

    let synthesizer = synthesizer_for(&args.synth, &args.model);
    let mut artist = Artist::new(Arc::clone(&synthesizer), events.scoped("artist"));
    let composer = Arc::new(BannerComposer::new(
        args.background.as_deref(),
        args.font.as_deref(),
        &events,
    ));

    let (tx, rx) = mpsc::channel();
    let handle = LoopHandle::new(tx);

    let mut bridge = SessionBridge::new(events.scoped("session"));
    bridge.attach_loop(handle.clone());
    start_session_if_configured(&mut bridge, &args, &events)?;

    spawn_stdin_reader(handle.clone(), args.requester);
    println!("herald is listening. Commands:");
    for line in HELP_COMMANDS {
        println!("  {line}");
    }

    while let Ok(event) = rx.recv() {
        match event {
            LoopEvent::Command { requester, line } => {
                let request = parse_command(&line);
                let requester = request.requester.unwrap_or(requester);
                match request.command {
                    Command::Banner => match coordinator.handle_banner(requester, &bridge) {
                        BannerAction::Reply(reply) => println!("[{requester}] {reply}"),
                        BannerAction::Render { snapshot } => {
                            println!(
                                "[{requester}] Consulting the court painter for {} {}...",
                                snapshot.rank, snapshot.actual_name
                            );
                            let synth = if artist.admit() {
                                Some(artist.synthesizer())
                            } else {
                                None
                            };
                            spawn_banner_render(
                                requester,
                                snapshot,
                                synth,
                                Arc::clone(&composer),
                                events.scoped("render"),
                                args.out.clone(),
                                handle.clone(),
                            );
                        }
                    },
                    Command::ForceAdd { external_id } => {
                        let reply = coordinator.handle_force_add(requester, &external_id, &bridge);
                        println!("[{requester}] {reply}");
                    }
                    Command::Confirm => {
                        let reply = coordinator.handle_confirm(requester);
                        println!("[{requester}] {reply}");
                    }
                    Command::Help => {
                        for line in HELP_COMMANDS {
                            println!("  {line}");
                        }
                    }
                    Command::Quit => break,
                    Command::BannerHint => {
                        println!("[{requester}] Use /banner to request a banner.");
                    }
                    Command::Unknown { command } => {
                        println!("[{requester}] Unknown command /{command}. Try /help.");
                    }
                    Command::Noop => {}
                }
            }
            LoopEvent::NewPeer {
                external_id,
                display_name,
            } => {
                for (requester, prompt) in coordinator.handle_new_peer(external_id, &display_name)
                {
                    println!("[{requester}] {prompt}");
                }
            }
            LoopEvent::BannerReady { requester, outcome } => match outcome {
                Ok(path) => println!("[{requester}] Banner ready: {}", path.display()),
                Err(error) => println!("[{requester}] Banner failed: {error}"),
            },
            LoopEvent::InputClosed => break,
        }
    }

    bridge.stop();
    let _ = events.emit("shutdown", EventPayload::new());
    Ok(0)
}

fn start_session_if_configured(
    bridge: &mut SessionBridge,
    args: &RunArgs,
    events: &EventWriter,
) -> Result<()> {
    let gateway = args
        .gateway
        .clone()
        .or_else(|| non_empty_env("HERALD_GATEWAY_URL"));
    match (session_credentials(), gateway) {
        (CredentialState::Ready { username, password }, Some(url)) => bridge.start(
            Box::new(WsSessionConnector::new(url)),
            username,
            password,
            BridgeTuning::from_env(),
        ),
        (CredentialState::Ready { .. }, None) => {
            let _ = events.emit(
                "session_disabled",
                payload(json!({ "reason": "no_gateway_url" })),
            );
            println!("No gateway URL configured; running without a session.");
            Ok(())
        }
        (CredentialState::Placeholder, _) => {
            let _ = events.emit(
                "session_disabled",
                payload(json!({ "reason": "placeholder_credentials" })),
            );
            println!(
                "HERALD_SESSION_USERNAME / HERALD_SESSION_PASSWORD still hold placeholder \
                 values; running without a session."
            );
            Ok(())
        }
        (CredentialState::Missing, _) => {
            let _ = events.emit(
                "session_disabled",
                payload(json!({ "reason": "missing_credentials" })),
            );
            println!(
                "Set HERALD_SESSION_USERNAME and HERALD_SESSION_PASSWORD to enable the \
                 session; running without one."
            );
            Ok(())
        }
    }
}

fn spawn_stdin_reader(handle: LoopHandle, default_requester: u64) {
    let spawned = thread::Builder::new()
        .name("stdin-reader".to_string())
        .spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                let Ok(line) = line else { break };
                if !handle.submit(LoopEvent::Command {
                    requester: default_requester,
                    line,
                }) {
                    return;
                }
            }
            let _ = handle.submit(LoopEvent::InputClosed);
        });
    if let Err(err) = spawned {
        eprintln!("failed to spawn stdin reader: {err}");
    }
}

/// Offloads synthesis and composition so the command loop stays
/// responsive. `synthesizer` is `None` when admission was denied; the
/// banner still renders with the placeholder panel.
fn spawn_banner_render(
    requester: u64,
    snapshot: PresenceSnapshot,
    synthesizer: Option<Arc<dyn ImageSynthesizer>>,
    composer: Arc<BannerComposer>,
    events: EventWriter,
    out_dir: PathBuf,
    handle: LoopHandle,
) {
    let thread_handle = handle.clone();
    let spawned = thread::Builder::new()
        .name(format!("banner-{requester}"))
        .spawn(move || {
            let prompt = portrait_prompt(&snapshot);
            let portrait =
                synthesizer.and_then(|synth| synthesize_logged(synth.as_ref(), &events, &prompt));
            let outcome = render_banner(&composer, portrait.as_ref(), &snapshot, &out_dir, requester);
            match &outcome {
                Ok(path) => {
                    let _ = events.emit(
                        "banner_written",
                        payload(json!({
                            "requester": requester,
                            "path": path.to_string_lossy().to_string(),
                        })),
                    );
                }
                Err(err) => {
                    let _ = events.emit(
                        "banner_failed",
                        payload(json!({
                            "requester": requester,
                            "error": format!("{err:#}"),
                        })),
                    );
                }
            }
            let _ = thread_handle.submit(LoopEvent::BannerReady {
                requester,
                outcome: outcome.map_err(|err| format!("{err:#}")),
            });
        });
    if let Err(err) = spawned {
        let _ = handle.submit(LoopEvent::BannerReady {
            requester,
            outcome: Err(format!("failed to spawn render thread: {err}")),
        });
    }
}

fn render_banner(
    composer: &BannerComposer,
    portrait: Option<&image::DynamicImage>,
    snapshot: &PresenceSnapshot,
    out_dir: &Path,
    requester: u64,
) -> Result<PathBuf> {
    let fields = BannerFields::from_snapshot(snapshot);
    let bytes = composer.compose(portrait, &fields)?;
    let stamp = chrono::Utc::now().timestamp_millis();
    let path = out_dir.join(format!("banner-{requester}-{stamp}.png"));
    fs::write(&path, bytes).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(path)
}

fn run_compose(args: ComposeArgs) -> Result<i32> {
    let raw = fs::read_to_string(&args.presence)
        .with_context(|| format!("failed to read {}", args.presence.display()))?;
    let value: Value = serde_json::from_str(&raw)
        .with_context(|| format!("{} is not valid JSON", args.presence.display()))?;
    let fields = value
        .as_object()
        .cloned()
        .context("presence file must contain a JSON object")?;
    let snapshot = translate(&RichPresence::from_map(fields));

    let log_dir = args.out.parent().unwrap_or_else(|| Path::new("."));
    let events = EventWriter::new(log_dir.join("events.jsonl"), "herald");
    let mut artist = Artist::new(
        synthesizer_for(&args.synth, &args.model),
        events.scoped("artist"),
    );
    let composer = BannerComposer::new(args.background.as_deref(), args.font.as_deref(), &events);

    let portrait = artist.generate(&portrait_prompt(&snapshot));
    let bytes = composer.compose(portrait.as_ref(), &BannerFields::from_snapshot(&snapshot))?;
    fs::write(&args.out, bytes)
        .with_context(|| format!("failed to write {}", args.out.display()))?;
    println!("wrote {}", args.out.display());
    Ok(0)
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn payload(value: Value) -> EventPayload {
    value.as_object().cloned().unwrap_or_default()
}
