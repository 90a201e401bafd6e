//! Authoritative per-connection sessions held by a frontend process
//!
//! This module owns the only writable copy of each session:
//! - Session records with their bound uid and settings
//! - Lookup by session id and by uid (a uid may hold several connections)
//! - Kicks, which notify and close the connection before forgetting it
//! - Local delivery of pushes and broadcasts routed here from other processes
//!
//! Every mutation happens inside one registry lock scope, so a `set` followed
//! by a `send` on the same session is always observed in that order.

use crate::config::SessionConfig;
use crate::error::{Error, Result};
use log::{debug, info, warn};
use shared::{PushMessage, SessionId, SessionSnapshot, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

/// Events written to a client connection by the session layer
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    Push(PushMessage),
    Kick { reason: String },
    Close,
}

/// Outbound half of a client connection
pub type ConnectionSender = mpsc::UnboundedSender<ConnectionEvent>;

/// One client connection and its mutable state
///
/// Each session maintains:
/// - Its identity (sid and owning frontend), fixed for its lifetime
/// - At most one bound uid
/// - A settings map that backends read through snapshots
/// - The outbound queue of its connection
#[derive(Debug)]
pub struct Session {
    /// Process-unique id, assigned sequentially from 1
    pub id: SessionId,
    /// Id of the frontend server holding the connection
    pub frontend_id: String,
    /// User bound to this connection, if logged in
    uid: Option<String>,
    /// Arbitrary per-connection state, last write wins
    settings: HashMap<String, Value>,
    /// Where pushes and kick notices for the client are queued
    connection: ConnectionSender,
}

impl Session {
    /// Creates an unbound session with empty settings
    ///
    /// The session does not register itself anywhere; use
    /// [`SessionService::create`] to make it reachable by sid and uid.
    pub fn new(id: SessionId, frontend_id: &str, connection: ConnectionSender) -> Self {
        Self {
            id,
            frontend_id: frontend_id.to_string(),
            uid: None,
            settings: HashMap::new(),
            connection,
        }
    }

    /// The bound uid, or None before login
    pub fn uid(&self) -> Option<&str> {
        self.uid.as_deref()
    }

    /// Reads one setting from the authoritative record
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.settings.get(key)
    }

    /// Writes one setting, replacing any previous value
    ///
    /// The change is visible to the next backend fetch at once; there is
    /// nothing to push on a frontend.
    pub fn set(&mut self, key: &str, value: Value) {
        self.settings.insert(key.to_string(), value);
    }

    /// Removes one setting and returns its old value
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.settings.remove(key)
    }

    /// All settings, in no particular order
    pub fn settings(&self) -> &HashMap<String, Value> {
        &self.settings
    }

    /// Binds `uid` to this session; a session holds at most one uid
    pub fn bind(&mut self, uid: &str) -> Result<()> {
        if let Some(bound) = &self.uid {
            return Err(Error::InvalidBindState(format!(
                "session {} already bound to {}",
                self.id, bound
            )));
        }
        self.uid = Some(uid.to_string());
        Ok(())
    }

    /// Unbinds `uid`, which must be the uid currently bound
    pub fn unbind(&mut self, uid: &str) -> Result<()> {
        match &self.uid {
            Some(bound) if bound == uid => {
                self.uid = None;
                Ok(())
            }
            Some(bound) => Err(Error::InvalidBindState(format!(
                "session {} is bound to {}, not {}",
                self.id, bound, uid
            ))),
            None => Err(Error::InvalidBindState(format!(
                "session {} has no bound uid",
                self.id
            ))),
        }
    }

    /// Queues one push for the client
    ///
    /// Fails with [`Error::ConnectionClosed`] once the connection's receiving
    /// side is gone. Pushes are delivered in the order they were queued.
    pub fn send(&self, message: PushMessage) -> Result<()> {
        self.connection
            .send(ConnectionEvent::Push(message))
            .map_err(|_| Error::ConnectionClosed(self.id))
    }

    /// Queues several pushes in order, stopping at the first failure
    pub fn send_batch(&self, messages: Vec<PushMessage>) -> Result<()> {
        for message in messages {
            self.send(message)?;
        }
        Ok(())
    }

    /// True once the client side of the connection has been dropped
    pub fn is_closed(&self) -> bool {
        self.connection.is_closed()
    }

    /// Copies the fields a backend may read
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id,
            frontend_id: self.frontend_id.clone(),
            uid: self.uid.clone(),
            settings: self.settings.clone(),
        }
    }

    /// Sends a kick notice followed by a close
    fn disconnect(&self, reason: &str) -> Result<()> {
        self.connection
            .send(ConnectionEvent::Kick {
                reason: reason.to_string(),
            })
            .and_then(|_| self.connection.send(ConnectionEvent::Close))
            .map_err(|_| Error::ConnectionClosed(self.id))
    }
}

/// Frontend-local policy deciding which sessions a broadcast reaches
///
/// The filter parameter of a broadcast is passed here untouched.
pub trait BroadcastFilter: Send + Sync {
    fn accept(&self, session: &Session, param: Option<&Value>) -> bool;
}

/// Accepts every session
pub struct AcceptAll;

impl BroadcastFilter for AcceptAll {
    fn accept(&self, _session: &Session, _param: Option<&Value>) -> bool {
        true
    }
}

#[derive(Default)]
struct Registry {
    sessions: HashMap<SessionId, Session>,
    by_uid: HashMap<String, Vec<SessionId>>,
    last_session_id: SessionId,
}

impl Registry {
    fn index_uid(&mut self, uid: &str, sid: SessionId) {
        let sids = self.by_uid.entry(uid.to_string()).or_default();
        if !sids.contains(&sid) {
            sids.push(sid);
        }
    }

    fn unindex_uid(&mut self, uid: &str, sid: SessionId) {
        if let Some(sids) = self.by_uid.get_mut(uid) {
            sids.retain(|s| *s != sid);
            if sids.is_empty() {
                self.by_uid.remove(uid);
            }
        }
    }

    fn take(&mut self, sid: SessionId) -> Option<Session> {
        let session = self.sessions.remove(&sid)?;
        if let Some(uid) = session.uid.clone() {
            self.unindex_uid(&uid, sid);
        }
        Some(session)
    }
}

/// Registry of the live sessions on one frontend process
pub struct SessionService {
    frontend_id: String,
    config: SessionConfig,
    registry: RwLock<Registry>,
    filter: Arc<dyn BroadcastFilter>,
}

impl SessionService {
    pub fn new(frontend_id: &str, config: SessionConfig) -> Self {
        Self {
            frontend_id: frontend_id.to_string(),
            config,
            registry: RwLock::new(Registry::default()),
            filter: Arc::new(AcceptAll),
        }
    }

    pub fn with_filter(mut self, filter: Arc<dyn BroadcastFilter>) -> Self {
        self.filter = filter;
        self
    }

    pub fn frontend_id(&self) -> &str {
        &self.frontend_id
    }

    /// Registers a new connection
    ///
    /// Returns None if the frontend is already at its connection limit.
    pub async fn create(&self, connection: ConnectionSender) -> Option<SessionId> {
        let mut registry = self.registry.write().await;
        if registry.sessions.len() >= self.config.max_connections {
            warn!(
                "{} refusing connection: {} sessions open",
                self.frontend_id,
                registry.sessions.len()
            );
            return None;
        }

        registry.last_session_id += 1;
        let sid = registry.last_session_id;

        registry
            .sessions
            .insert(sid, Session::new(sid, &self.frontend_id, connection));
        info!("Session {} opened on {}", sid, self.frontend_id);
        Some(sid)
    }

    /// Forgets a session whose connection has already closed
    pub async fn remove(&self, sid: SessionId) -> bool {
        let mut registry = self.registry.write().await;
        if registry.take(sid).is_some() {
            info!("Session {} closed on {}", sid, self.frontend_id);
            true
        } else {
            false
        }
    }

    /// Runs `f` against the live session, if it exists
    pub async fn with_session<R>(
        &self,
        sid: SessionId,
        f: impl FnOnce(&mut Session) -> R,
    ) -> Option<R> {
        let mut registry = self.registry.write().await;
        registry.sessions.get_mut(&sid).map(f)
    }

    pub async fn get(&self, sid: SessionId) -> Option<SessionSnapshot> {
        let registry = self.registry.read().await;
        registry.sessions.get(&sid).map(Session::snapshot)
    }

    /// Snapshots of every session bound to `uid`
    ///
    /// The result is not kept in sync with later kicks or disconnects.
    pub async fn get_by_uid(&self, uid: &str) -> Vec<SessionSnapshot> {
        let registry = self.registry.read().await;
        registry
            .by_uid
            .get(uid)
            .map(|sids| {
                sids.iter()
                    .filter_map(|sid| registry.sessions.get(sid))
                    .map(Session::snapshot)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn bind(&self, sid: SessionId, uid: &str) -> Result<()> {
        let mut registry = self.registry.write().await;
        let session = registry
            .sessions
            .get_mut(&sid)
            .ok_or_else(|| Error::SessionNotFound(format!("session {sid}")))?;
        session.bind(uid)?;
        registry.index_uid(uid, sid);
        info!("Session {} bound to {}", sid, uid);
        Ok(())
    }

    pub async fn unbind(&self, sid: SessionId, uid: &str) -> Result<()> {
        let mut registry = self.registry.write().await;
        let session = registry
            .sessions
            .get_mut(&sid)
            .ok_or_else(|| Error::SessionNotFound(format!("session {sid}")))?;
        session.unbind(uid)?;
        registry.unindex_uid(uid, sid);
        info!("Session {} unbound from {}", sid, uid);
        Ok(())
    }

    /// Applies one pushed setting; `None` removes the key
    pub async fn import(&self, sid: SessionId, key: &str, value: Option<Value>) -> Result<()> {
        let mut registry = self.registry.write().await;
        let session = registry
            .sessions
            .get_mut(&sid)
            .ok_or_else(|| Error::SessionNotFound(format!("session {sid}")))?;
        match value {
            Some(value) => session.set(key, value),
            None => {
                session.remove(key);
            }
        }
        Ok(())
    }

    /// Applies every pushed setting in one step
    ///
    /// Keys are merged one by one, so keys missing from `settings` keep their
    /// current value. Removals travel through [`SessionService::import`].
    pub async fn import_all(&self, sid: SessionId, settings: HashMap<String, Value>) -> Result<()> {
        let mut registry = self.registry.write().await;
        let session = registry
            .sessions
            .get_mut(&sid)
            .ok_or_else(|| Error::SessionNotFound(format!("session {sid}")))?;
        for (key, value) in settings {
            session.set(&key, value);
        }
        Ok(())
    }

    /// Closes every connection bound to `uid`
    ///
    /// A uid with no sessions is a no-op. Sessions are removed from both
    /// indices even when their disconnect fails; the first failure is returned.
    pub async fn kick(&self, uid: &str, reason: Option<&str>) -> Result<()> {
        let sessions = {
            let mut registry = self.registry.write().await;
            let sids = registry.by_uid.remove(uid).unwrap_or_default();
            sids.into_iter()
                .filter_map(|sid| registry.sessions.remove(&sid))
                .collect::<Vec<_>>()
        };

        if sessions.is_empty() {
            debug!("Kick of {} on {}: no sessions", uid, self.frontend_id);
            return Ok(());
        }

        info!(
            "Kicking {} ({} session(s)) on {}",
            uid,
            sessions.len(),
            self.frontend_id
        );
        self.disconnect_all(&sessions, reason)
    }

    pub async fn kick_by_session_id(&self, sid: SessionId, reason: Option<&str>) -> Result<()> {
        let session = {
            let mut registry = self.registry.write().await;
            registry.take(sid)
        };

        match session {
            Some(session) => {
                info!("Kicking session {} on {}", sid, self.frontend_id);
                self.disconnect_all(&[session], reason)
            }
            None => Ok(()),
        }
    }

    fn disconnect_all(&self, sessions: &[Session], reason: Option<&str>) -> Result<()> {
        let reason = reason.unwrap_or(self.config.kick_reason.as_str());
        let mut first_error = None;
        for session in sessions {
            if let Err(e) = session.disconnect(reason) {
                warn!("Failed to disconnect session {}: {}", session.id, e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Delivers `message` to every session bound to one of `uids`
    ///
    /// Returns the number of connections reached. Unknown uids are skipped.
    pub async fn push_by_uids(&self, message: &PushMessage, uids: &[String]) -> usize {
        let registry = self.registry.read().await;
        let mut delivered = 0;
        for uid in uids {
            let Some(sids) = registry.by_uid.get(uid) else {
                debug!("No session for {} on {}", uid, self.frontend_id);
                continue;
            };
            for session in sids.iter().filter_map(|sid| registry.sessions.get(sid)) {
                match session.send(message.clone()) {
                    Ok(()) => delivered += 1,
                    Err(e) => warn!("Push to {} failed: {}", uid, e),
                }
            }
        }
        delivered
    }

    /// Delivers `message` to every session the broadcast filter accepts
    ///
    /// With `binded` set, sessions without a uid are skipped.
    pub async fn broadcast(
        &self,
        message: &PushMessage,
        binded: bool,
        filter_param: Option<&Value>,
    ) -> usize {
        let registry = self.registry.read().await;
        registry
            .sessions
            .values()
            .filter(|s| !binded || s.uid.is_some())
            .filter(|s| self.filter.accept(s, filter_param))
            .filter(|s| s.send(message.clone()).is_ok())
            .count()
    }

    pub async fn len(&self) -> usize {
        self.registry.read().await.sessions.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.registry.read().await.sessions.is_empty()
    }
}
