//! Protocol client - socket lifecycle, authentication, heartbeat and dispatch
//!
//! The client is a sans-IO state machine. The owner feeds it socket events
//! and the current time, then drains [`ClientAction`]s and sleeps until
//! [`ProtocolClient::poll_timeout`].
//!
//! ```text
//!            start()              any message
//!   Idle ─────────────► Connecting ───────────► Authenticated
//!                         ▲    │                      │
//!          reconnect timer│    │ socket lost          │ socket lost /
//!                         │    ▼                      │ server silent
//!                       Reconnecting ◄────────────────┘
//!
//!   E ─► Closed(error-auth)     watchdog ─► Closed(error-timeout)
//!   CLOSE after a fragment ─► Closed
//! ```
//!
//! Every socket gets a fresh [`SocketId`]. Events tagged with any other id
//! are dropped, so a replaced socket can never dispatch into the new one.

use crate::{
    config::ClientConfig,
    message::{ControlMessage, MessageKind},
    timer::Timers,
    types::*,
};
use bytes::Bytes;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use url::Url;

/// Identifier of one socket generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(pub u64);

impl std::fmt::Display for SocketId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Timer purposes owned by the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientTimer {
    /// Start-up window for the first fragment
    Watchdog,
    /// Periodic heartbeat and silence check
    Heartbeat,
    /// Delay before opening a new socket
    Reconnect,
}

/// Work the owner must carry out on behalf of the client
#[derive(Debug, Clone, PartialEq)]
pub enum ClientAction {
    /// Open a socket to `url`, tagging its events with `socket`
    Connect { socket: SocketId, url: Url },
    /// Send a text frame
    Send { socket: SocketId, text: String },
    /// Close and forget the socket
    CloseSocket { socket: SocketId },
    /// Deliver a complete fragment downstream
    Fragment(Fragment),
    /// The client closed, with the terminal error if any. Emitted once.
    Closed(Option<CloseError>),
}

/// Stateful pull protocol client
pub struct ProtocolClient {
    server_url: Url,
    stream_id: String,
    auth_token: String,
    max_initial_fragments: Option<u32>,
    timeout: Duration,
    heartbeat_period: Duration,
    reconnect_delay: Duration,

    state: ConnectionState,
    started: bool,
    closed: bool,
    destroyed: bool,
    error: Option<CloseError>,

    socket: Option<SocketId>,
    next_socket_id: u64,
    timers: Timers<ClientTimer>,
    /// Last time anything arrived on the current socket
    last_activity: Option<Instant>,
    /// Duration announced by the last `F` message, consumed by the next binary frame
    pending_duration: Option<f64>,
    fragments_delivered: u64,

    actions: VecDeque<ClientAction>,
}

impl ProtocolClient {
    /// Create a client from the session configuration
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            server_url: config.server_url.clone(),
            stream_id: config.stream_id.clone(),
            auth_token: config.auth_token.clone(),
            max_initial_fragments: config.max_initial_fragments,
            timeout: config.timeout(),
            heartbeat_period: config.heartbeat_period(),
            reconnect_delay: config.reconnect_delay(),
            state: ConnectionState::Idle,
            started: false,
            closed: false,
            destroyed: false,
            error: None,
            socket: None,
            next_socket_id: 1,
            timers: Timers::new(),
            last_activity: None,
            pending_duration: None,
            fragments_delivered: 0,
            actions: VecDeque::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn error(&self) -> Option<CloseError> {
        self.error
    }

    pub fn current_socket(&self) -> Option<SocketId> {
        self.socket
    }

    pub fn fragments_delivered(&self) -> u64 {
        self.fragments_delivered
    }

    pub fn last_activity(&self) -> Option<Instant> {
        self.last_activity
    }

    pub fn is_timer_armed(&self, timer: ClientTimer) -> bool {
        self.timers.is_armed(timer)
    }

    /// Next action for the owner
    pub fn poll_action(&mut self) -> Option<ClientAction> {
        self.actions.pop_front()
    }

    /// Earliest deadline at which [`handle_timeout`](Self::handle_timeout) must run
    pub fn poll_timeout(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    /// Start connecting and arm the start-up watchdog. Later calls are no-ops.
    pub fn start(&mut self, now: Instant) {
        if self.started || self.closed {
            return;
        }
        self.started = true;

        info!(
            url = %self.server_url,
            stream = %self.stream_id,
            timeout_ms = self.timeout.as_millis() as u64,
            "Starting pull client"
        );

        self.timers.schedule(ClientTimer::Watchdog, now, self.timeout);
        self.connect();
    }

    /// The socket finished its handshake
    pub fn handle_open(&mut self, socket: SocketId, now: Instant) {
        if !self.is_current(socket) {
            debug!(%socket, "Ignoring open from stale socket");
            return;
        }

        self.authenticate();
        self.last_activity = Some(now);
        self.timers
            .schedule(ClientTimer::Heartbeat, now, self.heartbeat_period);
    }

    /// A text frame arrived
    pub fn handle_text(&mut self, socket: SocketId, now: Instant, text: &str) {
        if !self.is_current(socket) {
            debug!(%socket, "Ignoring text frame from stale socket");
            return;
        }
        self.touch(now);

        let msg = ControlMessage::parse(text);
        match msg.kind() {
            MessageKind::Error => {
                warn!(
                    code = msg.param("code").unwrap_or_default(),
                    message = msg.param("message").unwrap_or_default(),
                    "Server rejected the pull"
                );
                self.close(Some(CloseError::Auth));
            }
            MessageKind::Fragment => self.receive_fragment_metadata(&msg),
            MessageKind::Close => {
                if self.fragments_delivered > 0 {
                    info!(fragments = self.fragments_delivered, "Stream ended by server");
                    self.close(None);
                } else {
                    debug!("Ignoring CLOSE received before any fragment");
                }
            }
            MessageKind::Ok => debug!("Pull acknowledged"),
            _ => debug!(msg_type = %msg.msg_type, "Ignoring message"),
        }
    }

    /// A binary frame arrived
    pub fn handle_binary(&mut self, socket: SocketId, now: Instant, payload: Bytes) {
        if !self.is_current(socket) {
            debug!(%socket, "Ignoring binary frame from stale socket");
            return;
        }
        self.touch(now);

        if payload.is_empty() {
            debug!("Dropping empty binary frame");
            return;
        }

        let duration = match self.pending_duration {
            Some(d) if d > 0.0 => d,
            _ => {
                debug!(bytes = payload.len(), "Dropping binary frame without fragment metadata");
                return;
            }
        };

        self.fragments_delivered += 1;
        if self.fragments_delivered == 1 {
            self.timers.cancel(ClientTimer::Watchdog);
            info!("First fragment received");
        }

        debug!(duration, bytes = payload.len(), "Fragment received");
        self.actions
            .push_back(ClientAction::Fragment(Fragment { duration, payload }));
    }

    /// The socket closed without the client asking for it
    pub fn handle_socket_closed(&mut self, socket: SocketId, now: Instant) {
        if !self.is_current(socket) {
            debug!(%socket, "Ignoring close from stale socket");
            return;
        }
        self.socket = None;
        self.on_socket_lost(now);
    }

    /// Run every timer due at `now`
    pub fn handle_timeout(&mut self, now: Instant) {
        for timer in self.timers.take_expired(now) {
            if self.closed {
                break;
            }
            match timer {
                ClientTimer::Watchdog => {
                    if self.fragments_delivered == 0 {
                        warn!(
                            timeout_ms = self.timeout.as_millis() as u64,
                            "No fragment received in time"
                        );
                        self.close(Some(CloseError::Timeout));
                    }
                }
                ClientTimer::Heartbeat => self.heartbeat(now),
                ClientTimer::Reconnect => {
                    info!("Reconnecting");
                    self.connect();
                }
            }
        }
    }

    /// Close the client. The first call emits [`ClientAction::Closed`]; later calls do nothing.
    pub fn close(&mut self, error: Option<CloseError>) {
        if self.closed {
            return;
        }
        if error.is_some() {
            self.error = error;
        }

        self.clear_socket();
        self.timers.cancel_all();
        self.pending_duration = None;
        self.closed = true;
        self.set_state(ConnectionState::Closed(self.error));

        match self.error {
            Some(err) => warn!(error = %err, "Pull client closed"),
            None => info!("Pull client closed"),
        }
        self.actions.push_back(ClientAction::Closed(self.error));
    }

    /// Close and stop delivering fragments. Safe to call more than once.
    pub fn destroy(&mut self) {
        self.close(None);
        if !self.destroyed {
            self.destroyed = true;
            self.actions
                .retain(|action| !matches!(action, ClientAction::Fragment(_)));
        }
    }

    fn is_current(&self, socket: SocketId) -> bool {
        !self.closed && self.socket == Some(socket)
    }

    fn touch(&mut self, now: Instant) {
        self.last_activity = Some(now);
        if self.state == ConnectionState::Connecting {
            self.set_state(ConnectionState::Authenticated);
        }
    }

    fn connect(&mut self) {
        self.clear_socket();
        self.timers.cancel(ClientTimer::Reconnect);
        self.timers.cancel(ClientTimer::Heartbeat);

        let socket = SocketId(self.next_socket_id);
        self.next_socket_id += 1;
        self.socket = Some(socket);
        self.set_state(ConnectionState::Connecting);

        debug!(%socket, url = %self.server_url, "Opening socket");
        self.actions.push_back(ClientAction::Connect {
            socket,
            url: self.server_url.clone(),
        });
    }

    fn clear_socket(&mut self) {
        if let Some(socket) = self.socket.take() {
            self.actions.push_back(ClientAction::CloseSocket { socket });
        }
    }

    fn on_socket_lost(&mut self, now: Instant) {
        self.timers.cancel(ClientTimer::Heartbeat);
        if self.closed {
            return;
        }

        self.set_state(ConnectionState::Reconnecting);
        self.timers
            .schedule(ClientTimer::Reconnect, now, self.reconnect_delay);
        info!(
            delay_ms = self.reconnect_delay.as_millis() as u64,
            "Socket lost, reconnect scheduled"
        );
    }

    fn send(&mut self, msg: ControlMessage) {
        if let Some(socket) = self.socket {
            self.actions.push_back(ClientAction::Send {
                socket,
                text: msg.serialize(),
            });
        }
    }

    fn authenticate(&mut self) {
        let mut msg = ControlMessage::new("PULL")
            .with_param("stream", self.stream_id.as_str())
            .with_param("auth", self.auth_token.as_str());
        if let Some(count) = self.max_initial_fragments {
            msg = msg.with_param("max_initial_fragments", count.to_string());
        }
        self.send(msg);
    }

    fn heartbeat(&mut self, now: Instant) {
        if self.socket.is_none() {
            return;
        }

        self.send(ControlMessage::new("H"));

        let silence = self
            .last_activity
            .map(|at| now.saturating_duration_since(at))
            .unwrap_or_default();
        if silence > self.heartbeat_period * 2 {
            warn!(silence_ms = silence.as_millis() as u64, "Server inactive, dropping socket");
            self.clear_socket();
            self.on_socket_lost(now);
        } else {
            self.timers
                .schedule(ClientTimer::Heartbeat, now, self.heartbeat_period);
        }
    }

    fn receive_fragment_metadata(&mut self, msg: &ControlMessage) {
        let Some(raw) = msg.param("duration") else {
            debug!("Fragment metadata without duration");
            return;
        };
        match raw.parse::<f64>() {
            Ok(duration) if duration.is_finite() && duration >= 0.0 => {
                self.pending_duration = Some(duration);
            }
            _ => debug!(duration = raw, "Ignoring invalid fragment duration"),
        }
    }

    fn set_state(&mut self, next: ConnectionState) {
        if self.state == next {
            return;
        }
        if !self.state.can_transition_to(next) {
            debug!(from = %self.state, to = %next, "Ignoring invalid state transition");
            return;
        }
        debug!(from = %self.state, to = %next, "Connection state");
        self.state = next;
    }
}
