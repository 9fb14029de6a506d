//! Pull Session - Main orchestrator for a live pull
//!
//! Coordinates:
//! - The protocol client and its socket
//! - Remuxing of received fragments
//! - Buffer appends, eviction and live-edge steering
//! - Session events for the host application
//!
//! All three stages live on one tokio task. The host talks to that task
//! through [`PullSession`] and [`SessionNotifier`]; nothing is shared
//! between threads except the event bus and the state channel.

use crate::{
    client::{ClientAction, ProtocolClient, SocketId},
    config::ClientConfig,
    events::{EventBus, SessionEvent, SessionEventKind, SubscriptionId},
    media::{BufferController, BufferSink, MediaEvent, PlaybackElement},
    remux::{RemuxEngine, RemuxEvent, RemuxQueue},
    transport::{Connector, SocketEvent, SocketHandle},
    types::*,
    Error, Result,
};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, instrument, warn, Instrument};

enum Command {
    AttachMedia(Box<dyn PlaybackElement>),
    DetachMedia,
    SetDelayOptions { delay: f64, max_delay: Option<f64> },
    RemuxOutput(RemuxOutput),
    SinkOpen,
    UpdateEnd,
    TimeUpdate,
    Destroy,
}

/// Cloneable handle for the collaborators' asynchronous notifications
#[derive(Clone)]
pub struct SessionNotifier {
    commands: mpsc::UnboundedSender<Command>,
}

impl SessionNotifier {
    /// The remux engine produced output for the fragment in flight
    pub fn remux_output(&self, output: RemuxOutput) {
        self.send(Command::RemuxOutput(output));
    }

    /// The buffer sink is open
    pub fn sink_open(&self) {
        self.send(Command::SinkOpen);
    }

    /// The pending sink append or removal finished
    pub fn update_end(&self) {
        self.send(Command::UpdateEnd);
    }

    /// The playback position changed
    pub fn time_update(&self) {
        self.send(Command::TimeUpdate);
    }

    fn send(&self, command: Command) {
        // The session may already be gone
        let _ = self.commands.send(command);
    }
}

/// Live pull session managing one stream
pub struct PullSession {
    /// Unique session ID
    id: SessionId,
    /// Session configuration
    config: ClientConfig,
    /// Event subscribers
    events: Arc<EventBus<SessionEvent>>,
    /// Connection state broadcaster
    state_tx: watch::Sender<ConnectionState>,
    /// Commands for the driver task
    commands: mpsc::UnboundedSender<Command>,
    /// Driver, until `start()` spawns it
    driver: Option<Driver>,
    task: Option<JoinHandle<()>>,
    destroyed: bool,
}

impl PullSession {
    /// Create a session. Nothing connects until [`start`](Self::start).
    pub fn new(
        config: ClientConfig,
        connector: Arc<dyn Connector>,
        engine: Box<dyn RemuxEngine>,
        sink: Box<dyn BufferSink>,
    ) -> Result<Self> {
        config.validate()?;

        let id = SessionId::new();
        let events = Arc::new(EventBus::new());
        let (state_tx, _) = watch::channel(ConnectionState::Idle);
        let (commands, command_rx) = mpsc::unbounded_channel();

        let driver = Driver {
            client: ProtocolClient::new(&config),
            remux: RemuxQueue::new(engine, config.max_fragment_queue_length),
            media: BufferController::new(sink, &config),
            connector,
            socket: None,
            events: events.clone(),
            state_tx: state_tx.clone(),
            commands: command_rx,
            timeout_ms: config.timeout_ms,
        };

        info!(session_id = %id, stream = %config.stream_id, "Pull session created");

        Ok(Self {
            id,
            config,
            events,
            state_tx,
            commands,
            driver: Some(driver),
            task: None,
            destroyed: false,
        })
    }

    /// Get session ID
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Subscribe to connection state changes
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Handle for engine, sink and playback notifications
    pub fn notifier(&self) -> SessionNotifier {
        SessionNotifier {
            commands: self.commands.clone(),
        }
    }

    /// Register an event handler
    pub fn on<F>(&self, kind: SessionEventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&SessionEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.events.subscribe(kind, handler)
    }

    /// Remove an event handler
    pub fn off(&self, id: SubscriptionId) -> bool {
        self.events.unsubscribe(id)
    }

    /// Start pulling. Must run inside a tokio runtime; later calls are no-ops.
    #[instrument(skip(self), fields(session_id = %self.id))]
    pub fn start(&mut self) {
        let Some(driver) = self.driver.take() else {
            debug!("Session already started");
            return;
        };

        let span = info_span!("pull_session", session_id = %self.id);
        self.task = Some(tokio::spawn(driver.run().instrument(span)));
    }

    /// Attach the host playback element used for live-edge steering
    pub fn attach_media(&self, element: impl PlaybackElement + 'static) {
        self.send(Command::AttachMedia(Box::new(element)));
    }

    pub fn detach_media(&self) {
        self.send(Command::DetachMedia);
    }

    /// Change the target delay. `max_delay` is raised to at least `delay`.
    pub fn set_delay_options(&mut self, delay: f64, max_delay: Option<f64>) {
        self.config.delay = delay;
        self.config.max_delay = Some(crate::config::resolve_max_delay(delay, max_delay));
        self.send(Command::SetDelayOptions { delay, max_delay });
    }

    /// Release everything: observers first, then client, remux queue and buffer.
    /// Safe to call more than once.
    #[instrument(skip(self), fields(session_id = %self.id))]
    pub async fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        self.events.clear();

        if let Some(mut driver) = self.driver.take() {
            driver.destroy();
        }
        self.send(Command::Destroy);
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                warn!(error = %err, "Session task failed");
            }
        }
        info!("Pull session destroyed");
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            debug!("Session task gone, dropping command");
        }
    }
}

impl Drop for PullSession {
    fn drop(&mut self) {
        if !self.destroyed {
            self.events.clear();
            let _ = self.commands.send(Command::Destroy);
        }
    }
}

/// State owned by the session task
struct Driver {
    client: ProtocolClient,
    remux: RemuxQueue<Box<dyn RemuxEngine>>,
    media: BufferController<Box<dyn BufferSink>>,
    connector: Arc<dyn Connector>,
    socket: Option<(SocketId, SocketHandle)>,
    events: Arc<EventBus<SessionEvent>>,
    state_tx: watch::Sender<ConnectionState>,
    commands: mpsc::UnboundedReceiver<Command>,
    timeout_ms: u64,
}

impl Driver {
    async fn run(mut self) {
        self.client.start(now());
        self.pump();

        loop {
            let deadline = self.client.poll_timeout();

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Destroy) | None => {
                        self.destroy();
                        break;
                    }
                    Some(command) => self.handle_command(command),
                },
                Some((socket, event)) = next_socket_event(&mut self.socket) => {
                    self.handle_socket_event(socket, event);
                }
                _ = sleep_until(deadline) => {
                    self.client.handle_timeout(now());
                }
            }

            self.pump();
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::AttachMedia(element) => self.media.attach_media(element),
            Command::DetachMedia => {
                self.media.detach_media();
            }
            Command::SetDelayOptions { delay, max_delay } => {
                self.media.set_delay_options(delay, max_delay)
            }
            Command::RemuxOutput(output) => self.remux.on_output(output),
            Command::SinkOpen => self.media.on_sink_open(),
            Command::UpdateEnd => self.media.on_update_end(),
            Command::TimeUpdate => {
                self.media.on_time_update();
            }
            Command::Destroy => self.destroy(),
        }
    }

    fn handle_socket_event(&mut self, socket: SocketId, event: SocketEvent) {
        let now = now();
        match event {
            SocketEvent::Open => self.client.handle_open(socket, now),
            SocketEvent::Text(text) => self.client.handle_text(socket, now, &text),
            SocketEvent::Binary(payload) => self.client.handle_binary(socket, now, payload),
            SocketEvent::Closed => {
                if self.socket.as_ref().is_some_and(|(id, _)| *id == socket) {
                    self.socket = None;
                }
                self.client.handle_socket_closed(socket, now);
            }
        }
    }

    /// Drain every stage until none of them has anything left to report
    fn pump(&mut self) {
        loop {
            let mut progressed = false;

            while let Some(action) = self.client.poll_action() {
                progressed = true;
                self.apply_client_action(action);
            }
            while let Some(event) = self.remux.poll_event() {
                progressed = true;
                self.apply_remux_event(event);
            }
            while let Some(event) = self.media.poll_event() {
                progressed = true;
                self.apply_media_event(event);
            }

            if !progressed {
                break;
            }
        }

        self.state_tx.send_if_modified(|state| {
            let next = self.client.state();
            let changed = *state != next;
            *state = next;
            changed
        });
    }

    fn apply_client_action(&mut self, action: ClientAction) {
        match action {
            ClientAction::Connect { socket, url } => {
                let handle = self.connector.connect(&url);
                self.socket = Some((socket, handle));
            }
            ClientAction::Send { socket, text } => match &self.socket {
                Some((id, handle)) if *id == socket => {
                    if !handle.send_text(text) {
                        debug!(%socket, "Transport gone, text frame dropped");
                    }
                }
                _ => debug!(%socket, "No such socket, text frame dropped"),
            },
            ClientAction::CloseSocket { socket } => {
                if let Some((id, handle)) = self.socket.take() {
                    if id == socket {
                        handle.close();
                    } else {
                        self.socket = Some((id, handle));
                    }
                }
            }
            ClientAction::Fragment(fragment) => {
                if let Err(err) = self.remux.add_fragment(fragment) {
                    warn!(error = %err, "Fragment rejected by the remux queue");
                    self.emit_error(&err);
                }
            }
            ClientAction::Closed(error) => {
                if let Some(close_error) = error {
                    let err = match close_error {
                        CloseError::Auth => Error::AuthRejected,
                        CloseError::Timeout => Error::StartupTimeout {
                            timeout_ms: self.timeout_ms,
                        },
                    };
                    self.emit_error(&err);
                }
                self.events.emit(&SessionEvent::Close { error });
                self.remux.end();
            }
        }
    }

    fn apply_remux_event(&mut self, event: RemuxEvent) {
        match event {
            RemuxEvent::Segment(segment) => {
                if let Err(err) = self.media.add_segment(segment) {
                    warn!(error = %err, "Segment rejected by the buffer controller");
                    self.emit_error(&err);
                }
            }
            RemuxEvent::Error(err) => self.emit_error(&err),
            RemuxEvent::Ended => self.media.end(),
        }
    }

    fn apply_media_event(&mut self, event: MediaEvent) {
        match event {
            MediaEvent::Error(err) => self.emit_error(&err),
            MediaEvent::SinkCreated { mime_type } => debug!(mime_type = %mime_type, "Sink ready"),
            MediaEvent::Ended => {
                self.events.emit(&SessionEvent::Ended);
            }
        }
    }

    fn emit_error(&self, err: &Error) {
        self.events.emit(&SessionEvent::error(err));
    }

    fn destroy(&mut self) {
        self.events.clear();
        self.client.destroy();
        self.remux.destroy();
        self.media.destroy();
        self.pump();
    }
}

fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

async fn next_socket_event(
    socket: &mut Option<(SocketId, SocketHandle)>,
) -> Option<(SocketId, SocketEvent)> {
    match socket {
        Some((id, handle)) => {
            let event = handle.events.recv().await.unwrap_or(SocketEvent::Closed);
            Some((*id, event))
        }
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
        None => std::future::pending().await,
    }
}
