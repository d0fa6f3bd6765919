//! Sync provider.
//!
//! A [`Provider`] keeps one document and its awareness directory in sync
//! with a room, over a reconnecting network connection and over the
//! in-process local channel. All provider state lives in a single task that
//! multiplexes application commands, connection events, local frames,
//! document updates, awareness changes and its timers; the [`Provider`]
//! value is only a handle to that task.
//!
//! Updates the provider applies itself are tagged with its origin and never
//! re-broadcast, which keeps the two channels free of feedback loops.
//!
//! The liveness tick also refreshes awareness. The renewed local state is
//! what keeps an otherwise idle connection from looking silent.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use uuid::Uuid;

use crate::awareness::{AwarenessChange, AwarenessStore};
use crate::config::ProviderConfig;
use crate::connection::{NetworkConnection, Transition};
use crate::dispatch::Dispatcher;
use crate::document::{DocUpdate, SyncDocument, UpdateOrigin};
use crate::error::{Result, SyncError};
use crate::events::{ConnectionStatus, EventEmitter, ProviderEvent};
use crate::liveness::LivenessMonitor;
use crate::local_bus::{LocalBus, LocalFrame};
use crate::local_sync::LocalChannel;
use crate::protocol::Message;
use crate::transport::{ConnectionId, Transport, TransportEvent, WsTransport};

/// Point-in-time view of a provider, mostly for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderSnapshot {
    pub status: ConnectionStatus,
    pub synced: bool,
    /// Whether the provider currently wants a network connection.
    pub should_connect: bool,
    pub local_channel_connected: bool,
    pub unsuccessful_reconnects: u32,
    pub reconnect_pending: bool,
}

/// Removes the local participant from awareness. The host calls
/// [`ShutdownHook::run`] when the process is about to exit.
#[derive(Clone)]
pub struct ShutdownHook {
    awareness: Arc<dyn AwarenessStore>,
}

impl ShutdownHook {
    pub fn run(&self) {
        let client = self.awareness.client_id();
        self.awareness
            .remove_states(&[client], UpdateOrigin::Named("app closed".into()));
    }
}

enum Command {
    Connect(oneshot::Sender<()>),
    Disconnect(oneshot::Sender<()>),
    SendToUser {
        target: String,
        payload: String,
        done: oneshot::Sender<bool>,
    },
    Snapshot(oneshot::Sender<ProviderSnapshot>),
    Destroy(oneshot::Sender<()>),
}

/// Handle to a running provider.
///
/// Dropping the handle destroys the provider.
pub struct Provider {
    id: Uuid,
    config: ProviderConfig,
    commands: mpsc::UnboundedSender<Command>,
    emitter: Arc<EventEmitter>,
    awareness: Arc<dyn AwarenessStore>,
}

impl Provider {
    /// Create a provider on the WebSocket transport and the process-wide
    /// local bus. Must be called within a tokio runtime.
    pub fn new<D, A>(doc: &Arc<D>, awareness: Arc<A>, config: ProviderConfig) -> Result<Self>
    where
        D: SyncDocument,
        A: AwarenessStore,
    {
        Self::with_transport(
            doc,
            awareness,
            config,
            Arc::new(WsTransport::new()),
            LocalBus::global(),
        )
    }

    /// Create a provider on an explicit transport and local bus.
    ///
    /// The provider only keeps a weak reference to `doc`; once the
    /// application drops the document the provider destroys itself.
    pub fn with_transport<D, A>(
        doc: &Arc<D>,
        awareness: Arc<A>,
        config: ProviderConfig,
        transport: Arc<dyn Transport>,
        bus: Arc<LocalBus>,
    ) -> Result<Self>
    where
        D: SyncDocument,
        A: AwarenessStore,
    {
        config.validate()?;
        let id = Uuid::new_v4();
        let awareness: Arc<dyn AwarenessStore> = awareness;
        if doc.client_id() != awareness.client_id() {
            log::warn!(
                "Awareness client {} differs from document client {}",
                awareness.client_id(),
                doc.client_id()
            );
        }

        let (commands, command_rx) = mpsc::unbounded_channel();
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let inbox = Inbox {
            commands: command_rx,
            transport: transport_rx,
            doc_updates: doc.subscribe(),
            awareness_changes: awareness.subscribe(),
        };

        let emitter = Arc::new(EventEmitter::new(256));
        let doc: Weak<D> = Arc::downgrade(doc);
        let doc: Weak<dyn SyncDocument> = doc;
        let task = ProviderTask {
            id,
            origin: UpdateOrigin::Peer(id),
            doc,
            awareness: awareness.clone(),
            network: NetworkConnection::new(
                transport,
                config.connect_request(),
                config.max_backoff(),
                transport_tx,
            ),
            local: (!config.disable_local_channel)
                .then(|| LocalChannel::new(bus, config.channel_name(), id)),
            liveness: LivenessMonitor::new(config.reconnect_timeout()),
            emitter: emitter.clone(),
        };

        log::info!("Provider {id} created for room {}", config.room);
        tokio::spawn(task.run(inbox, config.connect, config.resync_interval()));

        Ok(Self {
            id,
            config,
            commands,
            emitter,
            awareness,
        })
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .map_err(|_| SyncError::Destroyed)?;
        rx.await.map_err(|_| SyncError::Destroyed)
    }

    /// Origin tag of everything this provider applies.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Start (or keep) connecting on both channels. Idempotent.
    pub async fn connect(&self) -> Result<()> {
        self.request(Command::Connect).await
    }

    /// Announce departure and close both channels. Idempotent.
    pub async fn disconnect(&self) -> Result<()> {
        self.request(Command::Disconnect).await
    }

    /// Send an application message to `target` over the network.
    /// Returns false if the provider is not connected.
    pub async fn send_to_user(
        &self,
        target: impl Into<String>,
        payload: impl Into<String>,
    ) -> Result<bool> {
        let (target, payload) = (target.into(), payload.into());
        self.request(|done| Command::SendToUser {
            target,
            payload,
            done,
        })
        .await
    }

    pub async fn snapshot(&self) -> Result<ProviderSnapshot> {
        self.request(Command::Snapshot).await
    }

    /// Disconnect and stop the provider task. Idempotent.
    pub async fn destroy(&self) -> Result<()> {
        match self.request(Command::Destroy).await {
            Err(SyncError::Destroyed) => Ok(()),
            result => result,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProviderEvent> {
        self.emitter.subscribe()
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.emitter.watch_status().borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.emitter.watch_status()
    }

    pub fn is_synced(&self) -> bool {
        self.emitter.is_synced()
    }

    pub fn watch_synced(&self) -> watch::Receiver<bool> {
        self.emitter.watch_synced()
    }

    pub fn awareness(&self) -> &Arc<dyn AwarenessStore> {
        &self.awareness
    }

    pub fn shutdown_hook(&self) -> ShutdownHook {
        ShutdownHook {
            awareness: self.awareness.clone(),
        }
    }

    pub fn url(&self) -> String {
        self.config.url()
    }

    pub fn room(&self) -> &str {
        &self.config.room
    }

    pub fn channel_name(&self) -> String {
        self.config.channel_name()
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }
}

struct Inbox {
    commands: mpsc::UnboundedReceiver<Command>,
    transport: mpsc::UnboundedReceiver<(ConnectionId, TransportEvent)>,
    doc_updates: broadcast::Receiver<DocUpdate>,
    awareness_changes: broadcast::Receiver<AwarenessChange>,
}

struct ProviderTask {
    id: Uuid,
    origin: UpdateOrigin,
    doc: Weak<dyn SyncDocument>,
    awareness: Arc<dyn AwarenessStore>,
    network: NetworkConnection,
    local: Option<LocalChannel>,
    liveness: LivenessMonitor,
    emitter: Arc<EventEmitter>,
}

async fn next_local_frame(local: &mut Option<LocalChannel>) -> LocalFrame {
    match local {
        Some(channel) => channel.recv().await,
        None => std::future::pending().await,
    }
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn ticker(period: Duration) -> Interval {
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

impl ProviderTask {
    async fn run(mut self, mut inbox: Inbox, connect_now: bool, resync: Option<Duration>) {
        if connect_now {
            self.connect().await;
        }
        let mut liveness = ticker(self.liveness.tick_interval());
        let mut resync = resync.map(ticker);

        loop {
            let reconnect_at = self.network.reconnect_deadline();
            // Branch order makes events that were queued first win
            tokio::select! {
                biased;

                Some((id, event)) = inbox.transport.recv() => {
                    let transition = self.network.on_event(id, event);
                    self.on_transition(transition);
                }
                frame = next_local_frame(&mut self.local) => self.on_local_frame(frame).await,
                update = inbox.doc_updates.recv() => match update {
                    Ok(update) => self.on_doc_update(update).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("Provider {} missed {n} document updates, resending full state", self.id);
                        self.resend_full_state().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        log::info!("Document of provider {} dropped", self.id);
                        break;
                    }
                },
                change = inbox.awareness_changes.recv() => match change {
                    Ok(change) => self.on_awareness_change(change).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("Provider {} missed {n} awareness changes", self.id);
                    }
                    Err(broadcast::error::RecvError::Closed) => {}
                },
                command = inbox.commands.recv() => match command {
                    Some(Command::Connect(ack)) => {
                        self.connect().await;
                        let _ = ack.send(());
                    }
                    Some(Command::Disconnect(ack)) => {
                        self.disconnect().await;
                        let _ = ack.send(());
                    }
                    Some(Command::SendToUser { target, payload, done }) => {
                        let sent = self.send_to_user(target, payload);
                        let _ = done.send(sent);
                    }
                    Some(Command::Snapshot(reply)) => {
                        let _ = reply.send(self.snapshot());
                    }
                    Some(Command::Destroy(ack)) => {
                        self.shutdown().await;
                        let _ = ack.send(());
                        return;
                    }
                    None => break,
                },
                _ = liveness.tick() => {
                    self.awareness.refresh(self.liveness.timeout());
                    self.check_liveness();
                }
                _ = next_tick(&mut resync) => self.resync(),
                _ = sleep_until(reconnect_at) => self.reconnect(),
            }
        }

        self.shutdown().await;
    }

    /// Disconnect both channels. Subscriptions and timers go with the task.
    async fn shutdown(&mut self) {
        self.disconnect().await;
        log::info!("Provider {} destroyed", self.id);
    }

    fn dispatch(&self, data: &[u8], emit_synced: bool) -> Option<Vec<u8>> {
        let doc = self.doc.upgrade()?;
        Dispatcher {
            doc: doc.as_ref(),
            awareness: self.awareness.as_ref(),
            origin: &self.origin,
            events: &self.emitter,
        }
        .dispatch(data, emit_synced)
    }

    /// Send on every active channel.
    async fn broadcast(&mut self, frame: Vec<u8>) {
        if self.network.is_connected() {
            self.network.send(frame.clone());
        }
        if let Some(local) = &self.local {
            local.publish(frame).await;
        }
    }

    async fn connect(&mut self) {
        match self.network.connect() {
            Ok(true) => self.on_connecting(),
            Ok(false) => {}
            Err(e) => self.emitter.emit(ProviderEvent::ConnectionError(e.to_string())),
        }
        if let (Some(local), Some(doc)) = (self.local.as_mut(), self.doc.upgrade()) {
            local.enable(doc.as_ref(), self.awareness.as_ref()).await;
        }
    }

    fn reconnect(&mut self) {
        match self.network.reconnect_due() {
            Ok(true) => self.on_connecting(),
            Ok(false) => {}
            Err(e) => self.emitter.emit(ProviderEvent::ConnectionError(e.to_string())),
        }
    }

    async fn disconnect(&mut self) {
        let departure = Message::awareness(self.awareness.encode_departure()).encode();
        self.network.send(departure.clone());
        if let Some(local) = self.local.as_mut() {
            local.disable(departure).await;
        }
        if let Some(transition) = self.network.disconnect() {
            self.on_transition(transition);
        }
    }

    fn on_connecting(&self) {
        self.emitter.set_synced(false);
        self.emitter.set_status(ConnectionStatus::Connecting);
    }

    fn on_transition(&mut self, transition: Transition) {
        match transition {
            Transition::Ignored => {}
            Transition::Opened => self.on_open(),
            Transition::Message(data) => {
                self.liveness.touch();
                if let Some(reply) = self.dispatch(&data, true) {
                    self.network.send(reply);
                }
            }
            Transition::Error(error) => self.emitter.emit(ProviderEvent::ConnectionError(error)),
            Transition::Closed {
                was_connected,
                reason,
            } => self.on_close(was_connected, reason),
        }
    }

    fn on_open(&mut self) {
        self.liveness.touch();
        self.emitter.set_status(ConnectionStatus::Connected);
        let Some(doc) = self.doc.upgrade() else {
            return;
        };
        self.network
            .send(Message::sync_step1(doc.state_vector()).encode());
        if self.awareness.local_state().is_some() {
            let local = [self.awareness.client_id()];
            self.network
                .send(Message::awareness(self.awareness.encode_update(&local)).encode());
        }
    }

    fn on_close(&mut self, was_connected: bool, reason: Option<String>) {
        self.emitter.emit(ProviderEvent::ConnectionClose(reason));
        if was_connected {
            self.emitter.set_synced(false);
            let local = self.awareness.client_id();
            let others: Vec<_> = self
                .awareness
                .client_ids()
                .into_iter()
                .filter(|client| *client != local)
                .collect();
            self.awareness.remove_states(&others, self.origin.clone());
        }
        self.emitter.set_status(ConnectionStatus::Disconnected);
    }

    async fn on_local_frame(&mut self, frame: LocalFrame) {
        if let Some(reply) = self.dispatch(&frame.data, false) {
            if let Some(local) = &self.local {
                local.publish(reply).await;
            }
        }
    }

    async fn on_doc_update(&mut self, update: DocUpdate) {
        if update.origin == self.origin {
            return;
        }
        self.broadcast(Message::update(update.update).encode()).await;
    }

    async fn resend_full_state(&mut self) {
        if let Some(doc) = self.doc.upgrade() {
            self.broadcast(Message::update(doc.full_state()).encode()).await;
        }
    }

    async fn on_awareness_change(&mut self, change: AwarenessChange) {
        let clients = change.changed_clients();
        let update = self.awareness.encode_update(&clients);
        self.broadcast(Message::awareness(update).encode()).await;
    }

    fn check_liveness(&mut self) {
        if !self.network.is_connected() || !self.liveness.is_stale() {
            return;
        }
        log::warn!(
            "Provider {}: no message for {:?}, closing connection",
            self.id,
            self.liveness.last_message().elapsed()
        );
        if let Some(transition) = self.network.close(None) {
            self.on_transition(transition);
        }
    }

    fn resync(&mut self) {
        if !self.network.is_connected() {
            return;
        }
        if let Some(doc) = self.doc.upgrade() {
            log::debug!("Provider {} resyncing", self.id);
            self.network
                .send(Message::sync_step1(doc.state_vector()).encode());
        }
    }

    fn send_to_user(&mut self, target: String, payload: String) -> bool {
        if !self.network.is_connected() {
            return false;
        }
        self.network.send(Message::custom(target, payload).encode())
    }

    fn snapshot(&self) -> ProviderSnapshot {
        ProviderSnapshot {
            status: self.network.status(),
            synced: self.emitter.is_synced(),
            should_connect: self.network.is_wanted(),
            local_channel_connected: self.local.as_ref().is_some_and(LocalChannel::is_connected),
            unsuccessful_reconnects: self.network.unsuccessful_reconnects(),
            reconnect_pending: self.network.reconnect_deadline().is_some(),
        }
    }
}
