//! One client connection: decodes frames, routes them to bridges, and keeps
//! the socket alive.
//!
//! The execution session speaks JSON ([`ClientMessage`]/[`ServerMessage`]).
//! The shell session is a raw byte pipe to a single interactive shell.

use crate::bridge::utf8::Utf8Carry;
use crate::bridge::{BridgeHandle, ExecutionBridge, Reporter, StreamKind, Target, WindowSize};
use crate::config::Config;
use crate::outbound::OutboundChannel;
use crate::protocol::{exit_summary, ClientMessage, ServerMessage, ShellMessage};
use crate::state::AppState;
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use futures_util::{Stream, StreamExt};
use std::fmt::Display;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout_at, Instant, MissedTickBehavior};
use tracing::{debug, info, trace};
use uuid::Uuid;

/// Close reasons are limited to 123 bytes on the wire.
const MAX_CLOSE_REASON: usize = 123;

/// Serve an execution session until the client goes away.
pub async fn serve_exec(socket: WebSocket, state: AppState) {
    let conn = Uuid::new_v4();
    let tunables = state.config.tunables.clone();
    info!(conn = %conn, "Execution session opened");

    let (sink, stream) = socket.split();
    let outbound = OutboundChannel::spawn(sink, tunables.outbound_capacity);
    let keepalive = spawn_keepalive(outbound.clone(), tunables.ping_interval);
    let session = ExecSession::new(conn, Arc::clone(&state.config), outbound.clone());

    let mut frames = FrameReader::new(conn, stream, tunables.read_deadline);
    while let Some(frame) = frames.next().await {
        let Inbound::Text(text) = frame else {
            trace!(conn = %conn, "Ignoring binary frame");
            continue;
        };
        match serde_json::from_str::<ClientMessage>(&text) {
            Ok(ClientMessage::Pong) => frames.renew(),
            Ok(message) => session.dispatch(message).await,
            Err(e) => debug!(conn = %conn, "Ignoring undecodable message: {}", e),
        }
    }

    keepalive.abort();
    session.detach().await;
    outbound.close();
    outbound.finished().await;
    info!(conn = %conn, "Execution session closed");
}

/// Serve a shell session: one shell for the life of the connection.
pub async fn serve_shell(socket: WebSocket, state: AppState) {
    let conn = Uuid::new_v4();
    let config = Arc::clone(&state.config);
    let tunables = config.tunables.clone();
    info!(conn = %conn, mode = ?config.stream_mode, "Shell session opened");

    let (sink, stream) = socket.split();
    let outbound = OutboundChannel::spawn(sink, tunables.outbound_capacity);
    let keepalive = spawn_keepalive(outbound.clone(), tunables.ping_interval);
    let reporter = Arc::new(ShellReporter::new(outbound.clone()));
    let shell = ExecutionBridge::start(&config, Target::Shell, config.stream_mode, reporter);

    // After the shell exits the close frame is already queued; keep reading
    // until the client completes the close handshake.
    let mut frames = FrameReader::new(conn, stream, tunables.read_deadline);
    while let Some(frame) = frames.next().await {
        match frame {
            Inbound::Binary(data) => {
                forward_shell_input(&shell, String::from_utf8_lossy(&data).into_owned()).await
            }
            Inbound::Text(text) => match serde_json::from_str::<ShellMessage>(&text) {
                Ok(ShellMessage::Input { data }) => forward_shell_input(&shell, data).await,
                Ok(ShellMessage::Resize { rows, cols }) => {
                    if rows > 0 && cols > 0 {
                        shell.resize(WindowSize { rows, cols });
                    }
                }
                Err(e) => debug!(conn = %conn, "Ignoring undecodable message: {}", e),
            },
        }
    }

    keepalive.abort();
    if !shell.status().is_finished() {
        shell.hang_up();
    }
    outbound.close();
    outbound.finished().await;
    info!(conn = %conn, "Shell session closed");
}

async fn forward_shell_input(shell: &BridgeHandle, data: String) {
    if !shell.send_input(data).await {
        trace!(bridge = %shell.id(), "Shell gone, input dropped");
    }
}

/// Routing state of an execution session.
pub struct ExecSession {
    conn: Uuid,
    config: Arc<Config>,
    outbound: OutboundChannel<Message>,
    /// The bridge that currently receives input.
    current: tokio::sync::Mutex<Option<Arc<BridgeHandle>>>,
}

impl ExecSession {
    pub fn new(conn: Uuid, config: Arc<Config>, outbound: OutboundChannel<Message>) -> Self {
        Self {
            conn,
            config,
            outbound,
            current: tokio::sync::Mutex::new(None),
        }
    }

    pub async fn dispatch(&self, message: ClientMessage) {
        match message {
            ClientMessage::Execute { file } => self.execute(file).await,
            ClientMessage::Input { input } => self.input(input).await,
            ClientMessage::Ping => {
                send_json(&self.outbound, &ServerMessage::Pong);
            }
            ClientMessage::Pong => {}
        }
    }

    async fn execute(&self, file: Option<String>) {
        let reporter = Arc::new(JsonReporter::new(self.outbound.clone()));
        let handle = ExecutionBridge::start(
            &self.config,
            Target::Script(file),
            self.config.stream_mode,
            reporter,
        );
        debug!(conn = %self.conn, bridge = %handle.id(), "Routing input to new bridge");

        let previous = self.current.lock().await.replace(Arc::new(handle));
        if let Some(previous) = previous {
            if !previous.status().is_finished() {
                previous.supersede();
            }
        }
    }

    async fn input(&self, input: String) {
        // Clone out so a full input queue never holds the routing lock.
        let Some(bridge) = self.current.lock().await.clone() else {
            debug!(conn = %self.conn, "No process started, input dropped");
            return;
        };
        if !bridge.send_input(input + "\n").await {
            debug!(conn = %self.conn, bridge = %bridge.id(), "Process no longer accepts input");
        }
    }

    /// The bridge input is currently routed to, if any.
    pub async fn current(&self) -> Option<Arc<BridgeHandle>> {
        self.current.lock().await.clone()
    }

    /// Connection is going away. A running process is left to finish on its
    /// own; its remaining output is dropped by the closed channel.
    pub async fn detach(&self) {
        if let Some(bridge) = self.current.lock().await.take() {
            if !bridge.status().is_finished() {
                info!(conn = %self.conn, bridge = %bridge.id(), "Client gone; process left running");
            }
        }
    }
}

fn send_json(outbound: &OutboundChannel<Message>, message: &ServerMessage) -> bool {
    match serde_json::to_string(message) {
        Ok(text) => outbound.send(Message::Text(text)),
        Err(e) => {
            debug!(kind = message.kind(), "Encoding message failed: {}", e);
            false
        }
    }
}

/// Renders bridge events as JSON messages.
pub struct JsonReporter {
    outbound: OutboundChannel<Message>,
    stdout: Mutex<Utf8Carry>,
    stderr: Mutex<Utf8Carry>,
}

impl JsonReporter {
    pub fn new(outbound: OutboundChannel<Message>) -> Self {
        Self {
            outbound,
            stdout: Mutex::new(Utf8Carry::default()),
            stderr: Mutex::new(Utf8Carry::default()),
        }
    }

    fn carry(&self, stream: StreamKind) -> &Mutex<Utf8Carry> {
        match stream {
            StreamKind::Stdout => &self.stdout,
            StreamKind::Stderr => &self.stderr,
        }
    }

    fn send_text(&self, stream: StreamKind, content: String) {
        if content.is_empty() {
            return;
        }
        let message = match stream {
            StreamKind::Stdout => ServerMessage::Stdout { content },
            StreamKind::Stderr => ServerMessage::Stderr { content },
        };
        send_json(&self.outbound, &message);
    }
}

impl Reporter for JsonReporter {
    fn output(&self, stream: StreamKind, chunk: &[u8]) {
        let text = self
            .carry(stream)
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .decode(chunk);
        self.send_text(stream, text);
    }

    fn stream_ended(&self, stream: StreamKind) {
        let text = self
            .carry(stream)
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .finish();
        self.send_text(stream, text);
    }

    fn error(&self, message: String) {
        send_json(&self.outbound, &ServerMessage::Error { content: message });
    }

    fn completed(&self, code: i32) {
        send_json(&self.outbound, &ServerMessage::completed(code));
    }
}

/// Forwards raw terminal bytes and ends the socket with the shell.
pub struct ShellReporter {
    outbound: OutboundChannel<Message>,
}

impl ShellReporter {
    pub fn new(outbound: OutboundChannel<Message>) -> Self {
        Self { outbound }
    }

    fn close(&self, code: u16, reason: String) {
        self.outbound.send(Message::Close(Some(CloseFrame {
            code,
            reason: truncate_reason(reason).into(),
        })));
    }
}

impl Reporter for ShellReporter {
    fn output(&self, _stream: StreamKind, chunk: &[u8]) {
        self.outbound.send(Message::Binary(chunk.to_vec()));
    }

    fn error(&self, message: String) {
        self.close(close_code::ERROR, message);
    }

    fn completed(&self, code: i32) {
        self.close(close_code::NORMAL, exit_summary(code));
    }
}

fn truncate_reason(mut reason: String) -> String {
    if reason.len() > MAX_CLOSE_REASON {
        let mut end = MAX_CLOSE_REASON;
        while !reason.is_char_boundary(end) {
            end -= 1;
        }
        reason.truncate(end);
    }
    reason
}

/// Sends a WebSocket ping every `period` until aborted or the channel
/// closes.
fn spawn_keepalive(outbound: OutboundChannel<Message>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if outbound.is_closed() {
                break;
            }
            outbound.send(Message::Ping(Vec::new()));
        }
    })
}

/// A frame the session has to act on.
#[derive(Debug, PartialEq, Eq)]
pub enum Inbound {
    Text(String),
    Binary(Vec<u8>),
}

/// Reads frames under a deadline that only a pong pushes forward.
pub struct FrameReader<S> {
    conn: Uuid,
    stream: S,
    window: Duration,
    deadline: Instant,
}

impl<S, E> FrameReader<S>
where
    S: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    pub fn new(conn: Uuid, stream: S, window: Duration) -> Self {
        Self {
            conn,
            stream,
            window,
            deadline: Instant::now() + window,
        }
    }

    pub fn renew(&mut self) {
        self.deadline = Instant::now() + self.window;
    }

    /// Next text or binary frame; `None` once the connection is done.
    pub async fn next(&mut self) -> Option<Inbound> {
        loop {
            let frame = match timeout_at(self.deadline, self.stream.next()).await {
                Err(_) => {
                    info!(conn = %self.conn, "No pong within read deadline, closing");
                    return None;
                }
                Ok(None) => return None,
                Ok(Some(Err(e))) => {
                    debug!(conn = %self.conn, "Read error: {}", e);
                    return None;
                }
                Ok(Some(Ok(frame))) => frame,
            };
            match frame {
                Message::Text(text) => return Some(Inbound::Text(text)),
                Message::Binary(data) => return Some(Inbound::Binary(data)),
                Message::Pong(_) => self.renew(),
                // Answered by the websocket layer.
                Message::Ping(_) => {}
                Message::Close(_) => return None,
            }
        }
    }
}
