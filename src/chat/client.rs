//! Owned chat channel binding: one task per application id.
//!
//! Bridges the pure pieces (bootstrap, transcript, connection state machine,
//! protocol decode) to a live tokio-tungstenite socket. All mutation happens
//! on the owning task, so socket callbacks are processed one at a time in
//! arrival order and history is fully applied before any live event.
//! Consumers hold a [`ChatHandle`] for commands and snapshots and drain a
//! [`ChatUpdate`] channel for changes.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;

use anyhow::Result;
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async,
    tungstenite::protocol::{frame::coding::CloseCode, CloseFrame},
    tungstenite::Message as WsMessage,
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};

use crate::chat::bootstrap::{HttpSessionApi, SessionApi, SessionBootstrapper};
use crate::chat::connection::{
    BackoffConfig, ConnectionManager, Directive, ReconnectPolicy, SocketEvent,
};
use crate::chat::protocol::{ClientFrame, ServerEvent};
use crate::chat::state::{self, ChatPhase, StateInputs};
use crate::chat::transcript::Transcript;
use crate::models::{ChatConfig, ChatMessage, Sender};

/// Status shown when the session was already closed at bootstrap.
pub const STATUS_CHAT_ENDED: &str = "The chat has ended.";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, WsMessage>;

/// Commands accepted by a running binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatCommand {
    /// Send an answer to the counterpart. Silently dropped unless the
    /// channel is connected and the counterpart is not typing.
    SendAnswer(String),
    /// Tear the binding down: reconnect disabled, socket closed normally.
    Close,
}

/// Changes published to the consumer, in the order they happened.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatUpdate {
    /// History load resolved (successfully or not); ids are stable now.
    HistoryLoaded { message_count: usize },
    /// Server-side session id became known.
    SessionId(i64),
    Phase(ChatPhase),
    Status(Option<String>),
    Typing(bool),
    /// A message was appended to the transcript.
    Message(ChatMessage),
}

/// Observable state of one binding. Written only by the owning task.
#[derive(Debug, Clone)]
pub struct ChatSnapshot {
    pub phase: ChatPhase,
    pub connected: bool,
    pub typing: bool,
    pub status: Option<String>,
    pub session_id: Option<i64>,
    pub messages: Vec<ChatMessage>,
}

impl Default for ChatSnapshot {
    fn default() -> Self {
        Self {
            phase: ChatPhase::LoadingHistory,
            connected: false,
            typing: false,
            status: None,
            session_id: None,
            messages: Vec::new(),
        }
    }
}

/// Binding counters for monitoring.
#[derive(Debug, Default)]
pub struct ChatMetrics {
    pub connects_attempted: AtomicU64,
    pub connects_succeeded: AtomicU64,
    pub reconnects: AtomicU64,
    pub frames_decoded: AtomicU64,
    pub frames_dropped: AtomicU64,
    pub answers_sent: AtomicU64,
    pub terminal_events: AtomicU64,
}

impl ChatMetrics {
    #[inline]
    fn record_connect_attempt(&self) {
        self.connects_attempted.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn record_connect_success(&self) {
        self.connects_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn record_frame_decoded(&self) {
        self.frames_decoded.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn record_frame_dropped(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn record_answer_sent(&self) {
        self.answers_sent.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn record_terminal_event(&self) {
        self.terminal_events.fetch_add(1, Ordering::Relaxed);
    }

    /// Summary string for logging.
    pub fn summary(&self) -> String {
        format!(
            "connects={}/{} reconnects={} frames={} dropped={} answers={} terminal={}",
            self.connects_succeeded.load(Ordering::Relaxed),
            self.connects_attempted.load(Ordering::Relaxed),
            self.reconnects.load(Ordering::Relaxed),
            self.frames_decoded.load(Ordering::Relaxed),
            self.frames_dropped.load(Ordering::Relaxed),
            self.answers_sent.load(Ordering::Relaxed),
            self.terminal_events.load(Ordering::Relaxed),
        )
    }
}

/// Consumer-side handle to one binding. Dropping every handle tears the
/// binding down the same way an explicit [`ChatHandle::close`] does.
#[derive(Clone)]
pub struct ChatHandle {
    cmd_tx: mpsc::Sender<ChatCommand>,
    shared: Arc<RwLock<ChatSnapshot>>,
    metrics: Arc<ChatMetrics>,
}

impl ChatHandle {
    pub fn snapshot(&self) -> ChatSnapshot {
        self.shared.read().clone()
    }

    pub fn phase(&self) -> ChatPhase {
        self.shared.read().phase
    }

    /// Queue an answer for sending. Non-blocking.
    pub fn send_answer(&self, text: impl Into<String>) {
        let _ = self.cmd_tx.try_send(ChatCommand::SendAnswer(text.into()));
    }

    /// Tear the binding down. Non-blocking; idempotent.
    pub fn close(&self) {
        let _ = self.cmd_tx.try_send(ChatCommand::Close);
    }

    pub fn metrics(&self) -> &ChatMetrics {
        &self.metrics
    }
}

/// One live chat binding. Owns the transcript, the connection state machine,
/// and the socket for exactly one application id.
pub struct ChatClient {
    config: ChatConfig,
    application_id: u64,
    auth_token: Option<String>,
    api: Arc<dyn SessionApi>,

    transcript: Transcript,
    conn: ConnectionManager,
    typing: bool,
    ended: bool,
    history_loaded: bool,
    status: Option<String>,
    session_id: Option<i64>,

    shared: Arc<RwLock<ChatSnapshot>>,
    metrics: Arc<ChatMetrics>,
    update_tx: mpsc::UnboundedSender<ChatUpdate>,
}

impl ChatClient {
    /// Bind one application's chat channel over the real REST service.
    /// Returns the handle plus the stream of updates.
    pub fn connect(
        config: ChatConfig,
        application_id: u64,
        auth_token: Option<String>,
    ) -> Result<(ChatHandle, mpsc::UnboundedReceiver<ChatUpdate>)> {
        let api = HttpSessionApi::new(&config.api_base_url, config.http_timeout())?;
        Ok(Self::connect_with_api(
            config,
            application_id,
            auth_token,
            Arc::new(api),
        ))
    }

    /// Same as [`ChatClient::connect`] with the HTTP seam injected.
    pub fn connect_with_api(
        config: ChatConfig,
        application_id: u64,
        auth_token: Option<String>,
        api: Arc<dyn SessionApi>,
    ) -> (ChatHandle, mpsc::UnboundedReceiver<ChatUpdate>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (update_tx, update_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(RwLock::new(ChatSnapshot::default()));
        let metrics = Arc::new(ChatMetrics::default());

        let policy = ReconnectPolicy::new(config.max_reconnect_attempts);
        let backoff = BackoffConfig {
            base_ms: config.backoff_base_ms,
            max_ms: config.backoff_max_ms,
            ..BackoffConfig::default()
        };

        let client = Self {
            conn: ConnectionManager::new(policy, backoff),
            transcript: Transcript::new(),
            typing: false,
            ended: false,
            history_loaded: false,
            status: None,
            session_id: None,
            shared: shared.clone(),
            metrics: metrics.clone(),
            update_tx,
            api,
            auth_token,
            application_id,
            config,
        };
        tokio::spawn(client.run(cmd_rx));

        (
            ChatHandle {
                cmd_tx,
                shared,
                metrics,
            },
            update_rx,
        )
    }

    async fn run(mut self, mut cmd_rx: mpsc::Receiver<ChatCommand>) {
        info!(application_id = self.application_id, "chat binding started");
        self.sync();

        // Bootstrap must fully resolve before any socket work.
        let bootstrapper = SessionBootstrapper::new(self.api.clone());
        let outcome = bootstrapper
            .load(self.application_id, self.auth_token.clone())
            .await;

        if let Some(session_id) = outcome.session.session_id {
            self.session_id = Some(session_id);
            self.shared.write().session_id = Some(session_id);
            let _ = self.update_tx.send(ChatUpdate::SessionId(session_id));
        }

        self.transcript.seed(
            outcome
                .history
                .iter()
                .map(|entry| (entry.body.clone(), entry.sender())),
        );
        self.shared.write().messages = self.transcript.messages().to_vec();
        self.history_loaded = true;
        let _ = self.update_tx.send(ChatUpdate::HistoryLoaded {
            message_count: self.transcript.len(),
        });

        if outcome.session.is_closed() {
            self.ended = true;
            self.status = Some(STATUS_CHAT_ENDED.to_string());
            self.sync();
            info!(
                application_id = self.application_id,
                "chat session already closed; not connecting"
            );
            return;
        }
        self.sync();

        loop {
            let directive = self.connect_and_stream(&mut cmd_rx).await;
            match directive {
                Directive::Redial { delay, .. } => {
                    self.metrics.record_reconnect();
                    if !self.wait_backoff(delay, &mut cmd_rx).await {
                        break;
                    }
                }
                _ => break,
            }
        }

        self.sync();
        info!(
            application_id = self.application_id,
            metrics = %self.metrics.summary(),
            "chat binding finished"
        );
    }

    /// One dial and, if it opens, one full socket session. Returns the
    /// directive that ended it.
    async fn connect_and_stream(&mut self, cmd_rx: &mut mpsc::Receiver<ChatCommand>) -> Directive {
        self.conn_event(SocketEvent::Dial);
        self.sync();
        self.metrics.record_connect_attempt();

        let url = self.ws_url();
        let dial = tokio::time::timeout(self.config.connect_timeout(), connect_async(&url));
        let ws: WsStream = match dial.await {
            Ok(Ok((ws, response))) => {
                debug!(status = %response.status(), "chat socket connected");
                ws
            }
            Ok(Err(e)) => {
                warn!(error = %e, "chat socket connect failed");
                let directive = self.conn_event(SocketEvent::TransportError);
                self.sync();
                return directive;
            }
            Err(_) => {
                warn!(
                    timeout_ms = self.config.connect_timeout_ms,
                    "chat socket connect timed out"
                );
                let directive = self.conn_event(SocketEvent::TransportError);
                self.sync();
                return directive;
            }
        };

        let directive = self.conn_event(SocketEvent::OpenAck);
        let (mut write, mut read) = ws.split();
        if directive == Directive::CloseNormal {
            // A dial that landed after teardown belongs to a dead binding.
            let _ = write.send(close_frame()).await;
            return Directive::Halt;
        }
        self.metrics.record_connect_success();
        self.sync();

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(ChatCommand::SendAnswer(text)) => {
                        self.handle_send(&mut write, text).await;
                    }
                    Some(ChatCommand::Close) | None => {
                        let directive = self.conn_event(SocketEvent::CallerClose);
                        if directive == Directive::CloseNormal {
                            let _ = write.send(close_frame()).await;
                        }
                        self.sync();
                        return Directive::Halt;
                    }
                },
                frame = read.next() => match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        self.handle_frame(&text);
                        self.sync();
                    }
                    Some(Ok(WsMessage::Ping(payload))) => {
                        let _ = write.send(WsMessage::Pong(payload)).await;
                    }
                    Some(Ok(WsMessage::Close(frame))) => {
                        let code = frame.as_ref().map(|f| u16::from(f.code)).unwrap_or(1005);
                        debug!(code, "chat socket closed by server");
                        return self.after_socket_loss(SocketEvent::Closed { code });
                    }
                    Some(Ok(_)) => {
                        debug!("ignoring non-text chat frame");
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "chat socket error");
                        return self.after_socket_loss(SocketEvent::TransportError);
                    }
                    None => {
                        debug!("chat socket stream ended");
                        return self.after_socket_loss(SocketEvent::Closed { code: 1006 });
                    }
                }
            }
        }
    }

    /// Socket went away. The typing indicator must not survive the socket
    /// that produced it.
    fn after_socket_loss(&mut self, event: SocketEvent) -> Directive {
        self.typing = false;
        let directive = self.conn_event(event);
        self.sync();
        directive
    }

    /// Feed the connection machine and adopt its status line. Connection
    /// transitions and protocol events share one status field, last writer
    /// wins, same as the single status the consumer renders.
    fn conn_event(&mut self, event: SocketEvent) -> Directive {
        let directive = self.conn.on_event(event);
        self.status = self.conn.status().map(str::to_string);
        directive
    }

    fn handle_frame(&mut self, text: &str) {
        let event = match ServerEvent::decode(text) {
            Ok(event) => {
                self.metrics.record_frame_decoded();
                event
            }
            Err(e) => {
                // Never fatal: drop the frame, keep the stream.
                self.metrics.record_frame_dropped();
                debug!(error = %e, frame_len = text.len(), "dropping undecodable chat frame");
                return;
            }
        };
        self.apply_event(event);
    }

    fn apply_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::Welcome { session_id } => {
                debug!(session_id, "chat session established");
                self.session_id = Some(session_id);
                self.shared.write().session_id = Some(session_id);
                let _ = self.update_tx.send(ChatUpdate::SessionId(session_id));
            }
            ServerEvent::Keepalive | ServerEvent::Pong => {}
            ServerEvent::AnalysisStatus { message } => {
                self.status = Some(message);
            }
            ServerEvent::BotTyping { value } => {
                self.typing = value;
            }
            ServerEvent::Question { text } => {
                self.typing = false;
                self.status = None;
                self.push_message(text, Sender::Them);
            }
            ServerEvent::AnalysisUpdate { message } => {
                self.typing = false;
                self.status = None;
                self.push_message(message, Sender::Them);
            }
            ServerEvent::FinalSummary { message } => {
                self.typing = false;
                self.status = None;
                self.push_message(message, Sender::Them);
                self.ended = true;
                self.metrics.record_terminal_event();
                self.conn_event(SocketEvent::Terminal);
            }
            ServerEvent::Error { message } => {
                warn!(message = %message, "chat error event");
                self.status = Some(format!("Error: {message}"));
            }
            ServerEvent::Unknown => {
                debug!("ignoring unrecognized chat frame type");
            }
        }
    }

    async fn handle_send(&mut self, write: &mut WsSink, text: String) {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return;
        }
        if !self.phase().can_send() {
            debug!(phase = %self.phase(), "outbound answer dropped; channel not ready");
            return;
        }

        let frame = ClientFrame::Answer {
            text: trimmed.to_string(),
        };
        let json = match serde_json::to_string(&frame) {
            Ok(json) => json,
            Err(e) => {
                warn!(error = %e, "failed to serialize answer frame");
                return;
            }
        };

        self.push_message(trimmed.to_string(), Sender::Me);
        if let Err(e) = write.send(WsMessage::Text(json)).await {
            // The read half will observe the broken transport and recover.
            warn!(error = %e, "failed to send answer frame");
        } else {
            self.metrics.record_answer_sent();
        }
        self.sync();
    }

    fn push_message(&mut self, text: impl Into<String>, sender: Sender) {
        self.transcript.append(text, sender);
        if let Some(message) = self.transcript.last() {
            let message = message.clone();
            self.shared.write().messages.push(message.clone());
            let _ = self.update_tx.send(ChatUpdate::Message(message));
        }
    }

    fn phase(&self) -> ChatPhase {
        state::derive(&StateInputs {
            history_loaded: self.history_loaded,
            conn: self.conn.state(),
            attempts: self.conn.attempts(),
            typing: self.typing,
            ended: self.ended,
            allow_reconnect: self.conn.allow_reconnect(),
        })
    }

    /// Reconcile the snapshot with current state, publishing what changed.
    fn sync(&mut self) {
        let phase = self.phase();
        let mut snap = self.shared.write();
        snap.connected = self.conn.is_connected();
        if snap.typing != self.typing {
            snap.typing = self.typing;
            let _ = self.update_tx.send(ChatUpdate::Typing(self.typing));
        }
        if snap.status != self.status {
            snap.status = self.status.clone();
            let _ = self.update_tx.send(ChatUpdate::Status(self.status.clone()));
        }
        if snap.phase != phase {
            snap.phase = phase;
            let _ = self.update_tx.send(ChatUpdate::Phase(phase));
        }
    }

    /// Wait out a backoff while staying responsive to teardown. Returns
    /// false if the binding was closed while waiting.
    async fn wait_backoff(
        &mut self,
        delay: Duration,
        cmd_rx: &mut mpsc::Receiver<ChatCommand>,
    ) -> bool {
        debug!(delay_ms = delay.as_millis() as u64, "waiting before redial");
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                cmd = cmd_rx.recv() => match cmd {
                    Some(ChatCommand::SendAnswer(_)) => {
                        debug!("outbound answer dropped while reconnecting");
                    }
                    Some(ChatCommand::Close) | None => {
                        self.conn_event(SocketEvent::CallerClose);
                        self.sync();
                        return false;
                    }
                }
            }
        }
    }

    fn ws_url(&self) -> String {
        let mut url = format!(
            "{}/ws/applications/{}",
            self.config.ws_base_url.trim_end_matches('/'),
            self.application_id
        );
        if let Some(token) = &self.auth_token {
            url.push_str("?token=");
            url.push_str(token);
        }
        url
    }
}

fn close_frame() -> WsMessage {
    WsMessage::Close(Some(CloseFrame {
        code: CloseCode::Normal,
        reason: "client closing".into(),
    }))
}
