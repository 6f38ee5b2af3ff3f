//! Viewer session: the single owner of all client-side state
//!
//! [`ViewerState`] holds the transport, scheduler, buffer, watch table,
//! auto-pause controller and subscription registry, and exposes the
//! operations the event loop calls. [`ViewerSession::run`] is that loop: one
//! task, so every mutation happens in one place and in receipt order.

use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use crate::client::backpressure::{AutoPauseController, AutoPauseEvent};
use crate::client::batcher::{apply_command, BatchScheduler, FlushReport};
use crate::client::buffer::IngestionBuffer;
use crate::client::connector::{spawn_connection, BackfillClient, TransportEvent};
use crate::client::subscriptions::SubscriptionRegistry;
use crate::client::transport::{BackfillData, TransportClient, TransportStatus};
use crate::client::watches::WatchTable;
use crate::config::AppConfig;
use crate::error::{Result, TransportError};
use crate::protocol::{ClientMessage, ControlCommand, ServerMessage};

/// Requests from the UI or other external collaborators
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewerCommand {
    Connect,
    SubscribeStream(String),
    UnsubscribeStream(String),
    PauseStream(String),
    ResumeStream(String),
    PauseAll,
    ResumeAll,
    SwitchRoom(String),
    SetToken(Option<String>),
    SetAutoPause(bool),
    Shutdown,
}

/// Notifications for the UI
#[derive(Debug, Clone, PartialEq)]
pub enum ViewerEvent {
    Connection(TransportStatus),
    Flushed(FlushReport),
    AutoPaused(AutoPauseEvent),
    Producers(usize),
    Rooms(Vec<String>),
    Latency(i64),
}

/// All client state, owned by the session task
pub struct ViewerState {
    pub transport: TransportClient,
    pub scheduler: BatchScheduler,
    pub buffer: IngestionBuffer,
    pub watches: WatchTable,
    pub controller: AutoPauseController,
    pub registry: SubscriptionRegistry,
    pub producers: usize,
    pub rooms: Vec<String>,
}

impl ViewerState {
    pub fn new(config: &AppConfig, registry: SubscriptionRegistry, epoch: Instant) -> Self {
        Self {
            transport: TransportClient::new(&config.client),
            scheduler: BatchScheduler::new(&config.batching, epoch),
            buffer: IngestionBuffer::new(config.buffer.max_entries, config.buffer.stream_max_entries),
            watches: WatchTable::new(),
            controller: AutoPauseController::new(config.auto_pause.clone()),
            registry,
            producers: 0,
            rooms: Vec::new(),
        }
    }

    /// Route one inbound frame. Malformed frames are logged and dropped.
    pub fn handle_frame(&mut self, text: &str, now: Instant) -> Vec<ViewerEvent> {
        let message = match ServerMessage::parse(text) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!("Ignoring malformed frame: {}", e);
                return Vec::new();
            }
        };

        match message {
            ServerMessage::Init {
                watches, producers, ..
            } => {
                for watch in watches {
                    self.scheduler.push_watch(watch, now);
                }
                self.producers = producers;
                vec![ViewerEvent::Producers(producers)]
            }
            ServerMessage::Entries { .. }
            | ServerMessage::Watch { .. }
            | ServerMessage::Control { .. }
            | ServerMessage::Stream { .. }
                if !self.transport.room_feed_current() =>
            {
                tracing::debug!("Dropping frame from the previous room");
                Vec::new()
            }
            ServerMessage::Entries { entries } => {
                let fresh = self.transport.accept_entries(entries);
                self.scheduler.push_entries(fresh, now);
                Vec::new()
            }
            ServerMessage::Watch { watch } => {
                self.scheduler.push_watch(watch, now);
                Vec::new()
            }
            ServerMessage::Control { command } => {
                self.scheduler.push_control(command, now);
                Vec::new()
            }
            ServerMessage::Stream { channel, entries } => {
                if self.registry.is_subscribed(&channel) {
                    self.scheduler.push_stream(&channel, entries, now);
                }
                Vec::new()
            }
            ServerMessage::ClientConnect { producers }
            | ServerMessage::ClientDisconnect { producers } => {
                self.producers = producers;
                vec![ViewerEvent::Producers(producers)]
            }
            ServerMessage::Rooms { rooms } => {
                self.rooms = rooms.clone();
                vec![ViewerEvent::Rooms(rooms)]
            }
            ServerMessage::RoomCreated { room } => {
                if !self.rooms.contains(&room) {
                    self.rooms.push(room);
                }
                vec![ViewerEvent::Rooms(self.rooms.clone())]
            }
            ServerMessage::RoomSwitched { room } => {
                if self.transport.on_room_switched(&room) {
                    tracing::info!("Now viewing room '{}'", room);
                } else {
                    tracing::debug!("Ignoring stale switch ack for room '{}'", room);
                }
                Vec::new()
            }
            ServerMessage::Pong { timestamp } => {
                let latency = self.transport.on_pong(timestamp, Utc::now().timestamp_millis());
                vec![ViewerEvent::Latency(latency)]
            }
            ack @ (ServerMessage::StreamSubscribed { .. }
            | ServerMessage::StreamUnsubscribed { .. }
            | ServerMessage::StreamPaused { .. }
            | ServerMessage::StreamResumed { .. }) => {
                self.registry.record_ack(&ack);
                Vec::new()
            }
        }
    }

    /// Apply a user command (everything except connect/shutdown)
    pub fn handle_command(&mut self, command: ViewerCommand) {
        match command {
            ViewerCommand::SubscribeStream(channel) => {
                self.registry.subscribe(&channel);
                self.transport.send(ClientMessage::SubscribeStream { channel });
            }
            ViewerCommand::UnsubscribeStream(channel) => {
                self.registry.unsubscribe(&channel);
                self.buffer.remove_stream(&channel);
                self.transport.send(ClientMessage::UnsubscribeStream { channel });
            }
            ViewerCommand::PauseStream(channel) => {
                self.registry.pause(&channel);
                self.transport.send(ClientMessage::PauseStream { channel });
            }
            ViewerCommand::ResumeStream(channel) => {
                self.registry.manual_resume(&channel);
                self.transport.send(ClientMessage::ResumeStream { channel });
            }
            ViewerCommand::PauseAll => {
                self.transport.send(ClientMessage::Pause);
            }
            ViewerCommand::ResumeAll => {
                self.transport.send(ClientMessage::Resume);
            }
            ViewerCommand::SwitchRoom(room) => {
                if self.transport.set_room(&room) {
                    self.scheduler.discard_pending();
                    apply_command(ControlCommand::ClearAll, &mut self.buffer, &mut self.watches);
                }
            }
            ViewerCommand::SetToken(token) => self.transport.set_token(token),
            ViewerCommand::SetAutoPause(enabled) => self.controller.set_enabled(enabled),
            ViewerCommand::Connect | ViewerCommand::Shutdown => {}
        }
    }

    /// Run the scheduled flush if its deadline has passed
    pub fn flush_if_due(&mut self, now: Instant) -> Option<FlushReport> {
        if !self.scheduler.is_due(now) {
            return None;
        }
        Some(self.scheduler.flush(now, &mut self.buffer, &mut self.watches))
    }

    pub fn auto_pause_tick(&mut self, now: Instant) -> Vec<AutoPauseEvent> {
        self.controller
            .tick(now, &self.buffer, &mut self.registry, &mut self.transport)
    }

    /// Queue the result of a finished backfill, unless it is stale
    pub fn complete_backfill(
        &mut self,
        room: &str,
        result: std::result::Result<BackfillData, TransportError>,
        now: Instant,
    ) {
        if let Some(history) = self.transport.complete_backfill(room, result) {
            self.scheduler.push_entries(history.entries, now);
            for (channel, samples) in history.streams {
                self.scheduler.push_stream(&channel, samples, now);
            }
        }
    }
}

/// Cloneable handle for sending commands to a running session
#[derive(Clone)]
pub struct ViewerHandle {
    commands: mpsc::UnboundedSender<ViewerCommand>,
}

impl ViewerHandle {
    /// Returns false once the session has stopped
    pub fn send(&self, command: ViewerCommand) -> bool {
        self.commands.send(command).is_ok()
    }

    pub fn subscribe(&self, channel: &str) -> bool {
        self.send(ViewerCommand::SubscribeStream(channel.to_string()))
    }

    pub fn resume(&self, channel: &str) -> bool {
        self.send(ViewerCommand::ResumeStream(channel.to_string()))
    }

    pub fn shutdown(&self) -> bool {
        self.send(ViewerCommand::Shutdown)
    }
}

pub struct ViewerSession {
    state: ViewerState,
    backfill: Arc<BackfillClient>,
    auto_pause_tick: Duration,
    ping_interval: Option<Duration>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    events_rx: mpsc::UnboundedReceiver<TransportEvent>,
    commands_rx: mpsc::UnboundedReceiver<ViewerCommand>,
    notify: mpsc::UnboundedSender<ViewerEvent>,
    last_status: Option<TransportStatus>,
}

impl ViewerSession {
    /// Build a session plus its command handle and event stream.
    ///
    /// Subscription state is restored from the configured state directory;
    /// an unreadable document is logged and replaced with an empty registry.
    pub fn new(
        config: &AppConfig,
    ) -> Result<(Self, ViewerHandle, mpsc::UnboundedReceiver<ViewerEvent>)> {
        config.validate()?;

        let registry = match config.client.resolved_state_dir() {
            Some(dir) => SubscriptionRegistry::with_storage(&dir).unwrap_or_else(|e| {
                tracing::warn!("Discarding saved subscriptions: {}", e);
                SubscriptionRegistry::new()
            }),
            None => SubscriptionRegistry::new(),
        };

        let backfill = BackfillClient::new(
            &config.client.server_url,
            config.client.token.clone(),
            config.client.backfill_limit,
            config.client.stream_backfill_limit,
        )?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (notify, notifications) = mpsc::unbounded_channel();

        let session = Self {
            state: ViewerState::new(config, registry, Instant::now()),
            backfill: Arc::new(backfill),
            auto_pause_tick: config.auto_pause.tick(),
            ping_interval: config.client.ping_interval(),
            events_tx,
            events_rx,
            commands_rx,
            notify,
            last_status: None,
        };

        Ok((session, ViewerHandle { commands: commands_tx }, notifications))
    }

    pub fn state(&self) -> &ViewerState {
        &self.state
    }

    /// Drive the session until shutdown or until every handle is dropped
    pub async fn run(mut self) -> Result<()> {
        self.connect()?;

        let mut auto_pause = tokio::time::interval(self.auto_pause_tick);
        auto_pause.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut housekeeping = tokio::time::interval(Duration::from_millis(100));
        housekeeping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut ping = tokio::time::interval(self.ping_interval.unwrap_or(Duration::from_secs(3600)));
        let ping_enabled = self.ping_interval.is_some();

        loop {
            let flush_deadline = self.state.scheduler.next_deadline();

            tokio::select! {
                Some(event) = self.events_rx.recv() => {
                    self.on_transport_event(event, Instant::now());
                }
                command = self.commands_rx.recv() => match command {
                    None | Some(ViewerCommand::Shutdown) => break,
                    Some(ViewerCommand::Connect) => self.connect()?,
                    Some(other) => self.state.handle_command(other),
                },
                _ = sleep_until(flush_deadline) => {
                    if let Some(report) = self.state.flush_if_due(Instant::now()) {
                        if !report.is_empty() {
                            self.emit(ViewerEvent::Flushed(report));
                        }
                    }
                }
                _ = auto_pause.tick() => {
                    for event in self.state.auto_pause_tick(Instant::now()) {
                        self.emit(ViewerEvent::AutoPaused(event));
                    }
                }
                _ = housekeeping.tick() => {
                    if self.state.transport.poll(Instant::now()) {
                        self.connect()?;
                    }
                }
                _ = ping.tick(), if ping_enabled => {
                    self.state.transport.ping(Utc::now().timestamp_millis());
                }
            }

            self.spawn_backfill();
            self.publish_status();
        }

        self.state.transport.disconnect();
        tracing::info!("Viewer session stopped");
        Ok(())
    }

    fn connect(&mut self) -> Result<()> {
        if let Some(request) = self.state.transport.connect()? {
            spawn_connection(request.connection, request.url, self.events_tx.clone());
        }
        Ok(())
    }

    fn on_transport_event(&mut self, event: TransportEvent, now: Instant) {
        match event {
            TransportEvent::Opened { connection, outbound } => {
                let state = &mut self.state;
                state.transport.on_open(connection, outbound, &state.registry, now);
            }
            TransportEvent::Frame { text, .. } => {
                for event in self.state.handle_frame(&text, now) {
                    self.emit(event);
                }
            }
            TransportEvent::Closed {
                connection,
                code,
                reason,
            } => {
                self.state.transport.on_close(connection, code, &reason, now);
            }
            TransportEvent::Backfill { room, result } => {
                self.state.complete_backfill(&room, result, now);
            }
        }
    }

    fn spawn_backfill(&mut self) {
        let Some(room) = self.state.transport.take_backfill_request() else {
            return;
        };
        let channels: Vec<String> = self
            .state
            .registry
            .channels()
            .map(|(name, _)| name.to_string())
            .collect();

        let client = Arc::clone(&self.backfill);
        let events = self.events_tx.clone();
        let task = tokio::spawn(async move {
            let result = client.fetch(&room, &channels).await;
            let _ = events.send(TransportEvent::Backfill { room, result });
        });
        self.state.transport.attach_backfill_task(task.abort_handle());
    }

    fn publish_status(&mut self) {
        let status = self.state.transport.status();
        if self.last_status.as_ref() != Some(&status) {
            self.last_status = Some(status.clone());
            self.emit(ViewerEvent::Connection(status));
        }
    }

    fn emit(&self, event: ViewerEvent) {
        let _ = self.notify.send(event);
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await,
        None => std::future::pending().await,
    }
}
