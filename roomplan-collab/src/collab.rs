//! Host-facing facade.
//!
//! [`Collaboration`] is what the editor holds on to. Every method is
//! synchronous and cheap; the work happens on the session task, which
//! requires a tokio runtime to be running when [`Collaboration::enable`]
//! is called.

use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::awareness::{AwarenessPatch, ConnectedUser, Dragging, Point, User};
use crate::config::CollabConfig;
use crate::session::{
    self, Command, Hooks, RedrawFn, RoomGetterFn, RoomUpdateFn, SessionHandle, SessionParams,
    StatusFn, UsersFn,
};
use crate::sync::RoomSnapshot;
use crate::transport::{endpoint_url, ConnectionState, Connector, TransportError, WsConnector};

#[derive(Debug, Error)]
pub enum CollabError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("collaboration requires a running tokio runtime")]
    NoRuntime,
}

/// Everything a session needs besides the room id.
#[derive(Clone)]
pub struct CollabOptions {
    pub user: User,
    pub config: CollabConfig,
    pub connector: Arc<dyn Connector>,
    hooks: Hooks,
}

impl CollabOptions {
    pub fn new(user: User) -> Self {
        Self {
            user,
            config: CollabConfig::default(),
            connector: Arc::new(WsConnector),
            hooks: Hooks::default(),
        }
    }

    pub fn config(mut self, config: CollabConfig) -> Self {
        self.config = config;
        self
    }

    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    /// Receives the merged room after every remote room change.
    pub fn on_room_update(mut self, f: impl Fn(RoomSnapshot) + Send + Sync + 'static) -> Self {
        self.hooks.on_room_update = Some(Arc::new(f) as RoomUpdateFn);
        self
    }

    pub fn on_redraw(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.hooks.on_redraw = Some(Arc::new(f) as RedrawFn);
        self
    }

    /// Supplies the host's current room, used as the base for merges.
    pub fn get_room_obj(mut self, f: impl Fn() -> RoomSnapshot + Send + Sync + 'static) -> Self {
        self.hooks.get_room_obj = Some(Arc::new(f) as RoomGetterFn);
        self
    }

    pub fn on_status_change(mut self, f: impl Fn(ConnectionState) + Send + Sync + 'static) -> Self {
        self.hooks.on_status_change = Some(Arc::new(f) as StatusFn);
        self
    }

    pub fn on_users_change(mut self, f: impl Fn(Vec<ConnectedUser>) + Send + Sync + 'static) -> Self {
        self.hooks.on_users_change = Some(Arc::new(f) as UsersFn);
        self
    }
}

impl std::fmt::Debug for CollabOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollabOptions")
            .field("user", &self.user)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Collaboration on/off switch for one editor.
#[derive(Default)]
pub struct Collaboration {
    session: Option<SessionHandle>,
}

impl Collaboration {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join `room_id`. An already-active session is disabled first, even
    /// when joining the new room then fails.
    pub fn enable(&mut self, room_id: &str, options: CollabOptions) -> Result<(), CollabError> {
        self.disable();
        let url = endpoint_url(&options.config.host, options.config.secure, room_id)?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| CollabError::NoRuntime)?;

        log::info!("Enabling collaboration in room {room_id} as {}", options.user.id);
        self.session = Some(session::spawn(
            &runtime,
            SessionParams {
                room_id: room_id.to_string(),
                url,
                user: options.user,
                config: options.config,
                connector: options.connector,
                hooks: options.hooks,
            },
        ));
        Ok(())
    }

    /// Leave the room. Safe to call at any time, including repeatedly.
    pub fn disable(&mut self) {
        let _ = self.disable_inner();
    }

    /// Like [`disable`](Self::disable), but waits until the session task
    /// has torn everything down.
    pub async fn disable_and_wait(&mut self) {
        if let Some(task) = self.disable_inner() {
            let _ = task.await;
        }
    }

    fn disable_inner(&mut self) -> Option<JoinHandle<()>> {
        let session = self.session.take()?;
        log::info!("Disabling collaboration in room {}", session.room_id);
        Some(session.shutdown())
    }

    /// Queue the host's current room for replication.
    ///
    /// Ignored when disabled, and when called from a host callback that is
    /// receiving a remote change.
    pub fn sync(&self, room: RoomSnapshot) {
        let Some(session) = &self.session else {
            return;
        };
        if session.is_applying_remote() {
            log::debug!("Ignoring sync() issued from a remote update");
            return;
        }
        session.send(Command::Sync(room));
    }

    pub fn update_cursor(&self, position: Option<Point>) {
        self.update_awareness(AwarenessPatch::cursor(position));
    }

    pub fn update_selection(&self, ids: Vec<String>) {
        self.update_awareness(AwarenessPatch::selection(ids));
    }

    pub fn update_dragging(&self, dragging: Option<Dragging>) {
        self.update_awareness(AwarenessPatch::dragging(dragging));
    }

    fn update_awareness(&self, patch: AwarenessPatch) {
        if let Some(session) = &self.session {
            session.send(Command::Awareness(patch));
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.session.is_some()
    }

    pub fn room_id(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.room_id.as_str())
    }

    pub fn status(&self) -> ConnectionState {
        self.session
            .as_ref()
            .map_or(ConnectionState::Disconnected, SessionHandle::status)
    }

    /// Local user first, then peers.
    pub fn users(&self) -> Vec<ConnectedUser> {
        self.session.as_ref().map(SessionHandle::users).unwrap_or_default()
    }

    pub fn watch_status(&self) -> Option<watch::Receiver<ConnectionState>> {
        self.session.as_ref().map(SessionHandle::watch_status)
    }

    pub fn watch_users(&self) -> Option<watch::Receiver<Vec<ConnectedUser>>> {
        self.session.as_ref().map(SessionHandle::watch_users)
    }
}

impl Drop for Collaboration {
    fn drop(&mut self) {
        self.disable();
    }
}
