//! Disconnected copies of frontend sessions, held by backend processes
//!
//! A [`BackendSession`] is a snapshot taken when it was fetched. Changing its
//! settings only changes the local copy until `push` or `push_all` sends them
//! to the frontend, where the last write wins. There is no locking across
//! processes: two backends pushing the same key race, and callers that care
//! must serialize those pushes themselves.
//!
//! `bind` and `unbind` are different: they go to the frontend first and only
//! touch the local copy once the frontend has accepted the change.

use crate::config::BackendSessionConfig;
use crate::error::{Error, Result};
use crate::rpc::RpcGateway;
use crate::topology::Topology;
use log::{debug, info};
use shared::{RemoteRequest, RemoteResponse, SessionId, SessionSnapshot, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Local proxy for a session living on a frontend process
///
/// Holds a copy of the session's fields as they were when fetched. Reads
/// never leave the process; writes leave it only through `push`, `push_all`,
/// `bind` and `unbind`. Dropping the proxy has no effect on the frontend.
pub struct BackendSession {
    /// Sid of the session on its frontend
    pub id: SessionId,
    /// Frontend that owns the session and receives every remote call
    pub frontend_id: String,
    /// Bound uid as of the fetch or the last successful bind/unbind
    uid: Option<String>,
    /// Local copy of the settings, possibly ahead of the frontend
    settings: HashMap<String, Value>,
    /// Service used for remote calls and the snapshot cache
    service: Arc<BackendSessionService>,
}

impl fmt::Debug for BackendSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendSession")
            .field("id", &self.id)
            .field("frontend_id", &self.frontend_id)
            .field("uid", &self.uid)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl BackendSession {
    /// The bound uid as this copy knows it
    pub fn uid(&self) -> Option<&str> {
        self.uid.as_deref()
    }

    /// Reads one setting from the local copy
    ///
    /// Values pushed by other backends since the fetch are not seen; fetch
    /// again for a fresh view.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.settings.get(key)
    }

    /// Changes the local copy only
    ///
    /// Nothing reaches the frontend until [`BackendSession::push`] or
    /// [`BackendSession::push_all`] is called.
    pub fn set(&mut self, key: &str, value: Value) {
        self.settings.insert(key.to_string(), value);
    }

    /// Changes the local copy only; push the key to remove it remotely
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.settings.remove(key)
    }

    /// The local settings, in no particular order
    pub fn settings(&self) -> &HashMap<String, Value> {
        &self.settings
    }

    /// Binds `uid` on the frontend session, then locally
    pub async fn bind(&mut self, uid: &str) -> Result<()> {
        self.service
            .request_done(
                &self.frontend_id,
                RemoteRequest::Bind {
                    sid: self.id,
                    uid: uid.to_string(),
                },
            )
            .await?;
        self.uid = Some(uid.to_string());
        self.service.remember(self.snapshot()).await;
        Ok(())
    }

    /// Unbinds `uid` on the frontend session, then locally
    pub async fn unbind(&mut self, uid: &str) -> Result<()> {
        self.service
            .request_done(
                &self.frontend_id,
                RemoteRequest::Unbind {
                    sid: self.id,
                    uid: uid.to_string(),
                },
            )
            .await?;
        self.uid = None;
        self.service.remember(self.snapshot()).await;
        Ok(())
    }

    /// Overwrites one key on the frontend with the local value
    ///
    /// A key that is absent locally is removed on the frontend.
    pub async fn push(&self, key: &str) -> Result<()> {
        self.service
            .request_done(
                &self.frontend_id,
                RemoteRequest::Push {
                    sid: self.id,
                    key: key.to_string(),
                    value: self.settings.get(key).cloned(),
                },
            )
            .await?;
        self.service.remember(self.snapshot()).await;
        Ok(())
    }

    /// Sends every local setting to the frontend in one call
    ///
    /// Each key overwrites the frontend's value; keys the frontend holds that
    /// are missing here are kept. Use [`BackendSession::push`] on a removed
    /// key to delete it remotely.
    pub async fn push_all(&self) -> Result<()> {
        self.service
            .request_done(
                &self.frontend_id,
                RemoteRequest::PushAll {
                    sid: self.id,
                    settings: self.settings.clone(),
                },
            )
            .await?;
        self.service.remember(self.snapshot()).await;
        Ok(())
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id,
            frontend_id: self.frontend_id.clone(),
            uid: self.uid.clone(),
            settings: self.settings.clone(),
        }
    }
}

type CacheKey = (String, SessionId);

/// Last snapshot seen for each (frontend id, sid)
///
/// Holds at most `capacity` entries; the least recently stored one is evicted
/// first. Frontends never tell backends that a session closed, so without the
/// bound every session ever fetched would stay here.
struct SnapshotCache {
    capacity: usize,
    entries: HashMap<CacheKey, SessionSnapshot>,
    order: VecDeque<CacheKey>,
}

impl SnapshotCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn get(&self, key: &CacheKey) -> Option<&SessionSnapshot> {
        self.entries.get(key)
    }

    fn insert(&mut self, snapshot: SessionSnapshot) {
        if self.capacity == 0 {
            return;
        }
        let key = (snapshot.frontend_id.clone(), snapshot.id);
        if self.entries.insert(key.clone(), snapshot).is_some() {
            self.order.retain(|k| *k != key);
        }
        self.order.push_back(key);

        while self.entries.len() > self.capacity {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            self.entries.remove(&oldest);
        }
    }

    fn remove(&mut self, key: &CacheKey) {
        if self.entries.remove(key).is_some() {
            self.order.retain(|k| k != key);
        }
    }

    fn retain(&mut self, mut keep: impl FnMut(&CacheKey, &SessionSnapshot) -> bool) {
        self.entries.retain(|k, v| keep(k, v));
        let entries = &self.entries;
        self.order.retain(|k| entries.contains_key(k));
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Fetches sessions from frontends and sends changes back to them
pub struct BackendSessionService {
    rpc: Arc<dyn RpcGateway>,
    topology: Arc<dyn Topology>,
    cache: RwLock<SnapshotCache>,
}

impl BackendSessionService {
    pub fn new(rpc: Arc<dyn RpcGateway>, topology: Arc<dyn Topology>) -> Self {
        Self::with_cache_capacity(rpc, topology, BackendSessionConfig::default().cache_capacity)
    }

    /// Like [`BackendSessionService::new`], keeping at most `capacity`
    /// snapshots for [`BackendSessionService::cached`]
    pub fn with_cache_capacity(
        rpc: Arc<dyn RpcGateway>,
        topology: Arc<dyn Topology>,
        capacity: usize,
    ) -> Self {
        Self {
            rpc,
            topology,
            cache: RwLock::new(SnapshotCache::new(capacity)),
        }
    }

    /// Wraps a snapshot in a proxy bound to this service
    pub fn create(self: &Arc<Self>, snapshot: SessionSnapshot) -> BackendSession {
        BackendSession {
            id: snapshot.id,
            frontend_id: snapshot.frontend_id,
            uid: snapshot.uid,
            settings: snapshot.settings,
            service: Arc::clone(self),
        }
    }

    /// Fetches a fresh copy of session `sid` from `frontend_id`
    ///
    /// Returns `Ok(None)` if the frontend has no such session.
    pub async fn get(
        self: &Arc<Self>,
        frontend_id: &str,
        sid: SessionId,
    ) -> Result<Option<BackendSession>> {
        self.check_frontend(frontend_id)?;
        match self
            .rpc
            .request(frontend_id, RemoteRequest::GetBySid { sid })
            .await?
        {
            RemoteResponse::Session(Some(snapshot)) => {
                self.remember(snapshot.clone()).await;
                Ok(Some(self.create(snapshot)))
            }
            RemoteResponse::Session(None) => {
                self.forget(frontend_id, sid).await;
                Ok(None)
            }
            other => Err(Self::unexpected(frontend_id, other)),
        }
    }

    /// Fetches fresh copies of every session `uid` holds on `frontend_id`
    ///
    /// Cached copies of `uid`'s sessions that the frontend no longer reports
    /// are dropped.
    pub async fn get_by_uid(
        self: &Arc<Self>,
        frontend_id: &str,
        uid: &str,
    ) -> Result<Vec<BackendSession>> {
        self.check_frontend(frontend_id)?;
        match self
            .rpc
            .request(
                frontend_id,
                RemoteRequest::GetByUid {
                    uid: uid.to_string(),
                },
            )
            .await?
        {
            RemoteResponse::Sessions(snapshots) => {
                let live: HashSet<SessionId> = snapshots.iter().map(|s| s.id).collect();
                let sessions = {
                    let mut cache = self.cache.write().await;
                    cache.retain(|(fid, sid), snapshot| {
                        fid != frontend_id
                            || snapshot.uid.as_deref() != Some(uid)
                            || live.contains(sid)
                    });
                    snapshots
                        .into_iter()
                        .map(|snapshot| {
                            cache.insert(snapshot.clone());
                            self.create(snapshot)
                        })
                        .collect()
                };
                Ok(sessions)
            }
            other => Err(Self::unexpected(frontend_id, other)),
        }
    }

    /// The last copy of `sid` this process fetched or pushed, without a
    /// remote call; it may be stale.
    pub async fn cached(self: &Arc<Self>, frontend_id: &str, sid: SessionId) -> Option<BackendSession> {
        let cache = self.cache.read().await;
        cache
            .get(&(frontend_id.to_string(), sid))
            .cloned()
            .map(|snapshot| self.create(snapshot))
    }

    pub async fn kick_by_sid(
        &self,
        frontend_id: &str,
        sid: SessionId,
        reason: Option<&str>,
    ) -> Result<()> {
        info!("Kicking session {} on {}", sid, frontend_id);
        self.request_done(
            frontend_id,
            RemoteRequest::KickBySid {
                sid,
                reason: reason.map(str::to_string),
            },
        )
        .await?;
        self.forget(frontend_id, sid).await;
        Ok(())
    }

    pub async fn kick_by_uid(&self, frontend_id: &str, uid: &str, reason: Option<&str>) -> Result<()> {
        info!("Kicking {} on {}", uid, frontend_id);
        self.request_done(
            frontend_id,
            RemoteRequest::KickByUid {
                uid: uid.to_string(),
                reason: reason.map(str::to_string),
            },
        )
        .await?;
        self.cache
            .write()
            .await
            .retain(|(fid, _), snapshot| fid != frontend_id || snapshot.uid.as_deref() != Some(uid));
        Ok(())
    }

    fn check_frontend(&self, frontend_id: &str) -> Result<()> {
        if self.topology.is_frontend(frontend_id) {
            Ok(())
        } else {
            Err(Error::UnknownServer(frontend_id.to_string()))
        }
    }

    async fn request_done(&self, frontend_id: &str, request: RemoteRequest) -> Result<()> {
        self.check_frontend(frontend_id)?;
        let method = request.method();
        match self.rpc.request(frontend_id, request).await? {
            RemoteResponse::Done => {
                debug!("{} on {} done", method, frontend_id);
                Ok(())
            }
            other => Err(Self::unexpected(frontend_id, other)),
        }
    }

    async fn remember(&self, snapshot: SessionSnapshot) {
        self.cache.write().await.insert(snapshot);
    }

    #[cfg(test)]
    async fn cache_len(&self) -> usize {
        self.cache.read().await.len()
    }

    async fn forget(&self, frontend_id: &str, sid: SessionId) {
        self.cache
            .write()
            .await
            .remove(&(frontend_id.to_string(), sid));
    }

    fn unexpected(frontend_id: &str, response: RemoteResponse) -> Error {
        Error::Remote {
            server_id: frontend_id.to_string(),
            message: format!("unexpected response {response:?}"),
        }
    }
}
