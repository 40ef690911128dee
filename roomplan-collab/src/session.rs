//! One collaboration session: a single task running the event loop.
//!
//! ```text
//!               ┌──────────── Session task ────────────┐
//! commands ───► │                                       │
//! socket   ───► │  tokio::select! (one event at a time) │ ───► socket
//! timers   ───► │   debounce · reconnect · refresh      │ ───► host callbacks
//!               └───────────────────────────────────────┘
//! ```
//!
//! All state lives in [`Session`] and is touched only from the loop, so no
//! locking is needed. Document observers feed a queue that is drained after
//! every event; local transactions become outbound `Update` frames, remote
//! ones are merged into the host's room object.

use futures_util::future::BoxFuture;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::{self, JoinHandle};

use crate::awareness::{AwarenessChannel, AwarenessPatch, ConnectedUser, RemoteOutcome, User};
use crate::config::CollabConfig;
use crate::document::{DocumentChange, Origin, SharedDocument, Transaction, ITEMS, META, ROOM_DATA};
use crate::protocol::{Frame, ProtocolError};
use crate::sync::{PushOutcome, RoomSnapshot, SyncIntegration};
use crate::timer::Timer;
use crate::transport::{
    Connection, ConnectionMachine, ConnectionState, Connector, Reconnect, ReconnectPolicy,
    TransportError,
};

pub type RoomUpdateFn = Arc<dyn Fn(RoomSnapshot) + Send + Sync>;
pub type RedrawFn = Arc<dyn Fn() + Send + Sync>;
pub type RoomGetterFn = Arc<dyn Fn() -> RoomSnapshot + Send + Sync>;
pub type StatusFn = Arc<dyn Fn(ConnectionState) + Send + Sync>;
pub type UsersFn = Arc<dyn Fn(Vec<ConnectedUser>) + Send + Sync>;

/// Host callbacks invoked from the session task.
#[derive(Clone, Default)]
pub(crate) struct Hooks {
    pub on_room_update: Option<RoomUpdateFn>,
    pub on_redraw: Option<RedrawFn>,
    pub get_room_obj: Option<RoomGetterFn>,
    pub on_status_change: Option<StatusFn>,
    pub on_users_change: Option<UsersFn>,
}

#[derive(Debug)]
pub(crate) enum Command {
    Sync(RoomSnapshot),
    Awareness(AwarenessPatch),
    Shutdown,
}

enum Event {
    Command(Command),
    ConnectDone(Result<Connection, TransportError>),
    Inbound(Option<Vec<u8>>),
    DebounceDue,
    ReconnectDue,
    AwarenessRefresh,
}

/// Facade-side handle to a running session.
pub(crate) struct SessionHandle {
    pub room_id: String,
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<ConnectionState>,
    users: watch::Receiver<Vec<ConnectedUser>>,
    applying_remote: Arc<AtomicBool>,
    task_id: task::Id,
    task: JoinHandle<()>,
}

impl SessionHandle {
    /// Returns `false` if the session task is gone.
    pub fn send(&self, command: Command) -> bool {
        self.commands.send(command).is_ok()
    }

    /// True only for calls made on the session task itself while it hands
    /// a remote change to the host. Other threads never see the flag.
    pub fn is_applying_remote(&self) -> bool {
        task::try_id() == Some(self.task_id) && self.applying_remote.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> ConnectionState {
        *self.status.borrow()
    }

    pub fn users(&self) -> Vec<ConnectedUser> {
        self.users.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionState> {
        self.status.clone()
    }

    pub fn watch_users(&self) -> watch::Receiver<Vec<ConnectedUser>> {
        self.users.clone()
    }

    /// Ask the task to tear down. Returns the task handle for callers that
    /// want to wait for it.
    pub fn shutdown(self) -> JoinHandle<()> {
        let _ = self.commands.send(Command::Shutdown);
        self.task
    }
}

pub(crate) struct SessionParams {
    pub room_id: String,
    pub url: String,
    pub user: User,
    pub config: CollabConfig,
    pub connector: Arc<dyn Connector>,
    pub hooks: Hooks,
}

/// Build a session and start its task on `runtime`.
pub(crate) fn spawn(runtime: &tokio::runtime::Handle, params: SessionParams) -> SessionHandle {
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let session = Session::new(params.url, params.user, &params.config, params.connector, params.hooks, command_rx);

    let status = session.status_tx.subscribe();
    let users = session.users_tx.subscribe();
    let applying_remote = session.sync.applying_remote_flag();
    let task = runtime.spawn(session.run());
    let task_id = task.id();

    SessionHandle {
        room_id: params.room_id,
        commands: command_tx,
        status,
        users,
        applying_remote,
        task_id,
        task,
    }
}

pub(crate) struct Session {
    url: String,
    connector: Arc<dyn Connector>,
    machine: ConnectionMachine,
    link: Option<Connection>,
    pending_connect: Option<BoxFuture<'static, Result<Connection, TransportError>>>,
    reconnect: Timer,
    refresh: Timer,
    refresh_interval: Duration,
    doc: SharedDocument,
    doc_events: mpsc::UnboundedReceiver<(Vec<DocumentChange>, Transaction)>,
    awareness: AwarenessChannel,
    sync: SyncIntegration,
    commands: mpsc::UnboundedReceiver<Command>,
    status_tx: watch::Sender<ConnectionState>,
    users_tx: watch::Sender<Vec<ConnectedUser>>,
    hooks: Hooks,
}

impl Session {
    fn new(
        url: String,
        user: User,
        config: &CollabConfig,
        connector: Arc<dyn Connector>,
        hooks: Hooks,
        commands: mpsc::UnboundedReceiver<Command>,
    ) -> Self {
        let mut doc = SharedDocument::new();
        let (doc_tx, doc_events) = mpsc::unbounded_channel();
        doc.observe(move |changes, txn| {
            let _ = doc_tx.send((changes.to_vec(), *txn));
        });

        let policy = ReconnectPolicy {
            base_interval: config.reconnect_base_interval(),
            max_attempts: config.max_reconnect_attempts,
        };
        let sync = SyncIntegration::new(user.id.clone(), config.debounce_window());
        let awareness = AwarenessChannel::new(user);
        let (status_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (users_tx, _) = watch::channel(awareness.connected_users());

        Self {
            url,
            connector,
            machine: ConnectionMachine::new(policy),
            link: None,
            pending_connect: None,
            reconnect: Timer::new(),
            refresh: Timer::new(),
            refresh_interval: config.awareness_refresh_interval(),
            doc,
            doc_events,
            awareness,
            sync,
            commands,
            status_tx,
            users_tx,
            hooks,
        }
    }

    async fn run(mut self) {
        log::info!("Collaboration session starting for {}", self.url);
        self.start_connect();

        loop {
            let event = tokio::select! {
                biased;
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => Event::Command(command),
                },
                result = connect_done(&mut self.pending_connect) => Event::ConnectDone(result),
                inbound = next_inbound(&mut self.link) => Event::Inbound(inbound),
                _ = self.sync.debounce_elapsed() => Event::DebounceDue,
                _ = self.reconnect.fired() => Event::ReconnectDue,
                _ = self.refresh.fired() => Event::AwarenessRefresh,
            };

            self.handle(event);
            self.drain_document_events();
        }

        self.shutdown();
    }

    fn handle(&mut self, event: Event) {
        match event {
            Event::Command(Command::Sync(snapshot)) => {
                self.sync.schedule(snapshot);
            }
            Event::Command(Command::Awareness(patch)) => self.update_awareness(patch),
            Event::Command(Command::Shutdown) => {}
            Event::ConnectDone(Ok(connection)) => self.on_open(connection),
            Event::ConnectDone(Err(e)) => {
                log::warn!("Connecting to {} failed: {e}", self.url);
                self.connection_lost();
            }
            Event::Inbound(Some(bytes)) => self.on_frame(&bytes),
            Event::Inbound(None) => {
                log::info!("Connection to {} closed", self.url);
                self.connection_lost();
            }
            Event::DebounceDue => self.push_pending(),
            Event::ReconnectDue => self.start_connect(),
            Event::AwarenessRefresh => self.refresh_awareness(),
        }
    }

    // ── Connection lifecycle ─────────────────────────────────────

    fn start_connect(&mut self) {
        self.reconnect.cancel();
        self.link = None;
        self.machine.connecting();
        self.publish_status();
        self.pending_connect = Some(self.connector.connect(&self.url));
    }

    fn on_open(&mut self, connection: Connection) {
        self.link = Some(connection);
        self.machine.opened();
        self.publish_status();

        self.send(Frame::SyncRequest);
        self.send_local_awareness();
        self.send(Frame::AwarenessRequest);
        self.refresh.arm(self.refresh_interval);
    }

    fn connection_lost(&mut self) {
        self.link = None;
        self.pending_connect = None;
        self.refresh.cancel();
        if self.awareness.peer_count() > 0 {
            self.awareness.clear_peers();
            self.publish_users();
        }

        self.set_status(ConnectionState::Disconnected);
        match self.machine.failed() {
            Reconnect::Scheduled { attempt, delay } => {
                log::info!("Reconnect attempt {attempt} in {delay:?}");
                self.reconnect.arm(delay);
            }
            Reconnect::Exhausted { attempts } => {
                log::warn!("Giving up on {} after {attempts} reconnect attempts", self.url);
            }
        }
        self.publish_status();
    }

    fn shutdown(&mut self) {
        self.sync.reset();
        self.reconnect.cancel();
        self.pending_connect = None;
        self.link = None;
        self.machine.closed();
        self.refresh.cancel();
        self.doc.clear();
        self.awareness.clear_peers();
        self.publish_status();
        self.users_tx.send_replace(Vec::new());
        log::info!("Collaboration session for {} stopped", self.url);
    }

    // ── Inbound frames ───────────────────────────────────────────

    fn on_frame(&mut self, bytes: &[u8]) {
        let frame = match Frame::decode(bytes) {
            Ok(frame) => frame,
            Err(ProtocolError::EmptyFrame) => return,
            Err(e) => {
                log::warn!("Dropping frame: {e}");
                return;
            }
        };

        match frame {
            Frame::SyncRequest => {
                // An empty document has nothing authoritative to offer.
                if self.doc.map(META).is_some_and(|m| !m.is_empty()) {
                    self.send_document(Frame::SyncState);
                }
            }
            Frame::SyncState(payload) | Frame::Update(payload) => {
                if let Err(e) = self.doc.apply_snapshot(&payload, Origin::Remote) {
                    log::warn!("Dropping remote snapshot: {e}");
                }
            }
            Frame::AwarenessRequest => self.send_local_awareness(),
            Frame::AwarenessUpdate(payload) => match self.awareness.apply_remote(&payload) {
                Ok(RemoteOutcome::Upserted) => self.publish_users(),
                Ok(RemoteOutcome::Unchanged | RemoteOutcome::SelfEcho) => {}
                Err(e) => log::warn!("Dropping awareness update: {e}"),
            },
        }
    }

    // ── Document replication ─────────────────────────────────────

    fn push_pending(&mut self) {
        let Some(snapshot) = self.sync.take_pending() else {
            return;
        };
        match self.sync.push(&mut self.doc, &snapshot) {
            Ok(PushOutcome::Pushed { changed }) => log::debug!("Pushed room: {changed} keys changed"),
            Ok(PushOutcome::Unchanged) => {}
            Err(e) => log::error!("Local room push failed: {e}"),
        }
    }

    fn drain_document_events(&mut self) {
        while let Ok((changes, txn)) = self.doc_events.try_recv() {
            if txn.local {
                self.send_document(Frame::Update);
            } else {
                self.apply_remote_to_host(&changes);
            }
        }
    }

    fn apply_remote_to_host(&mut self, changes: &[DocumentChange]) {
        if !changes.iter().any(|c| c.map == ROOM_DATA || c.map == ITEMS) {
            return;
        }

        let _scope = self.sync.enter_remote();
        let current = self.hooks.get_room_obj.as_ref().map(|get| get());
        match self.sync.merge_remote(&self.doc, current) {
            Ok(merged) => {
                if let Some(on_room_update) = &self.hooks.on_room_update {
                    on_room_update(merged);
                }
                if let Some(on_redraw) = &self.hooks.on_redraw {
                    on_redraw();
                }
            }
            Err(e) => log::error!("Applying remote room change failed: {e}"),
        }
    }

    // ── Awareness ────────────────────────────────────────────────

    fn update_awareness(&mut self, patch: AwarenessPatch) {
        match self.awareness.update_local(patch) {
            Ok(payload) => {
                self.send(Frame::AwarenessUpdate(payload));
            }
            Err(e) => log::error!("Encoding local awareness failed: {e}"),
        }
        self.publish_users();
    }

    fn send_local_awareness(&self) {
        match self.awareness.encode_local() {
            Ok(payload) => {
                self.send(Frame::AwarenessUpdate(payload));
            }
            Err(e) => log::error!("Encoding local awareness failed: {e}"),
        }
    }

    fn refresh_awareness(&mut self) {
        let pruned = self.awareness.refresh();
        if !pruned.is_empty() {
            log::debug!("Pruned silent peers: {pruned:?}");
            self.publish_users();
        }
        self.send(Frame::AwarenessRequest);
        self.refresh.arm(self.refresh_interval);
    }

    // ── Outbound & publishing ────────────────────────────────────

    fn send_document(&self, frame: fn(Vec<u8>) -> Frame) {
        match self.doc.to_snapshot() {
            Ok(snapshot) => {
                self.send(frame(snapshot));
            }
            Err(e) => log::error!("Encoding document snapshot failed: {e}"),
        }
    }

    /// Returns `true` if the frame was handed to an open socket.
    fn send(&self, frame: Frame) -> bool {
        match &self.link {
            Some(link) if self.machine.state() == ConnectionState::Connected => {
                link.outgoing.send(frame.encode()).is_ok()
            }
            _ => {
                log::trace!("Not connected; dropping {:?} frame", frame.message_type());
                false
            }
        }
    }

    fn publish_status(&self) {
        self.set_status(self.machine.state());
    }

    fn set_status(&self, state: ConnectionState) {
        let changed = self.status_tx.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            *current = state;
            true
        });
        if changed {
            log::debug!("Connection state: {state:?}");
            if let Some(on_status_change) = &self.hooks.on_status_change {
                on_status_change(state);
            }
        }
    }

    fn publish_users(&self) {
        let users = self.awareness.connected_users();
        self.users_tx.send_replace(users.clone());
        if let Some(on_users_change) = &self.hooks.on_users_change {
            on_users_change(users);
        }
    }
}

async fn connect_done(
    slot: &mut Option<BoxFuture<'static, Result<Connection, TransportError>>>,
) -> Result<Connection, TransportError> {
    match slot {
        Some(fut) => {
            let result = fut.await;
            *slot = None;
            result
        }
        None => std::future::pending().await,
    }
}

async fn next_inbound(link: &mut Option<Connection>) -> Option<Vec<u8>> {
    match link {
        Some(connection) => connection.incoming.recv().await,
        None => std::future::pending().await,
    }
}
