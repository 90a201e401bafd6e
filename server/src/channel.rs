//! Named groups of receivers owned by one process
//!
//! A channel maps each member uid to the frontend server that holds that
//! user's connection. A uid appears at most once: adding it again moves it to
//! the new frontend. Channels are local to the process that created them and
//! are never replicated.

use crate::error::{Error, Result};
use crate::push::{partition, PushOptions, PushReport, PushRouter};
use log::{debug, info};
use shared::{PushMessage, Value};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::RwLock;

pub(crate) type ChannelRegistry = RwLock<HashMap<String, Arc<Channel>>>;

/// One member of a channel and the frontend it is reached through
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMember {
    pub uid: String,
    pub sid: String,
}

/// What a successful add did to the membership
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddOutcome {
    Added,
    Reassigned { previous: String },
    Unchanged,
}

#[derive(Default)]
struct ChannelState {
    members: HashMap<String, String>,
    destroyed: bool,
}

/// A named set of receivers owned by one process
///
/// Each channel maintains:
/// - Its members, one frontend per uid
/// - A destroyed flag; a destroyed channel refuses every further operation
/// - A handle back to the service registry it is listed in
pub struct Channel {
    /// Unique name within the owning process
    name: String,
    /// Membership and the destroyed flag, changed under one lock
    state: RwLock<ChannelState>,
    /// Issues the per-frontend push calls
    router: Arc<PushRouter>,
    /// Registry to leave on destroy; weak so the two do not keep each other alive
    registry: Weak<ChannelRegistry>,
    /// Destroy as soon as the last member leaves
    destroy_when_empty: bool,
}

impl Channel {
    /// Creates an empty channel listed in `registry`
    ///
    /// Only [`crate::channel_service::ChannelService`] creates channels, so
    /// that every channel is reachable by name.
    pub(crate) fn new(
        name: &str,
        router: Arc<PushRouter>,
        registry: Weak<ChannelRegistry>,
        destroy_when_empty: bool,
    ) -> Self {
        Self {
            name: name.to_string(),
            state: RwLock::new(ChannelState::default()),
            router,
            registry,
            destroy_when_empty,
        }
    }

    /// The name the channel is registered under
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Adds `uid` reached through frontend `sid`, reporting why it failed
    pub async fn try_add(&self, uid: &str, sid: &str) -> Result<AddOutcome> {
        if !self.router.resolves(sid) {
            return Err(Error::UnknownServer(sid.to_string()));
        }

        let mut state = self.state.write().await;
        if state.destroyed {
            return Err(Error::ChannelDestroyed(self.name.clone()));
        }

        let outcome = match state.members.insert(uid.to_string(), sid.to_string()) {
            None => AddOutcome::Added,
            Some(previous) if previous == sid => AddOutcome::Unchanged,
            Some(previous) => AddOutcome::Reassigned { previous },
        };
        debug!("Channel {}: {} at {} ({:?})", self.name, uid, sid, outcome);
        Ok(outcome)
    }

    /// Adds `uid` reached through frontend `sid`
    ///
    /// Returns false if `sid` is not a known frontend or the channel has been
    /// destroyed; use [`Channel::try_add`] to tell the two apart.
    pub async fn add(&self, uid: &str, sid: &str) -> bool {
        self.try_add(uid, sid).await.is_ok()
    }

    /// Removes `uid` only if it is still registered under frontend `sid`
    ///
    /// With `destroy_when_empty` set, the leave that empties the channel also
    /// destroys it under the same lock, so no add can slip in between.
    pub async fn leave(&self, uid: &str, sid: &str) -> bool {
        let destroyed = {
            let mut state = self.state.write().await;
            if state.destroyed || state.members.get(uid).map(String::as_str) != Some(sid) {
                return false;
            }
            state.members.remove(uid);
            if state.members.is_empty() && self.destroy_when_empty {
                state.destroyed = true;
            }
            state.destroyed
        };

        if destroyed {
            info!("Channel {} is empty, destroying", self.name);
            self.unregister().await;
        }
        true
    }

    /// All member uids, in no particular order
    ///
    /// Copies the whole membership; avoid it on hot paths.
    pub async fn get_members(&self) -> Vec<String> {
        self.state.read().await.members.keys().cloned().collect()
    }

    pub async fn get_member(&self, uid: &str) -> Option<ChannelMember> {
        self.state
            .read()
            .await
            .members
            .get(uid)
            .map(|sid| ChannelMember {
                uid: uid.to_string(),
                sid: sid.clone(),
            })
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.members.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.members.is_empty()
    }

    pub async fn is_destroyed(&self) -> bool {
        self.state.read().await.destroyed
    }

    /// Destroys this channel and unregisters it from its service
    pub async fn destroy(&self) {
        self.mark_destroyed().await;
        self.unregister().await;
    }

    /// Removes this channel from its service's registry, if still listed
    async fn unregister(&self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let mut channels = registry.write().await;
        // A channel of the same name may have been created since
        let is_self = channels
            .get(&self.name)
            .map(|c| std::ptr::eq(Arc::as_ptr(c), self))
            .unwrap_or(false);
        if is_self {
            channels.remove(&self.name);
        }
    }

    pub(crate) async fn mark_destroyed(&self) {
        let mut state = self.state.write().await;
        state.destroyed = true;
        state.members.clear();
    }

    /// Pushes a message to every member, one call per frontend
    pub async fn push_message(
        &self,
        route: &str,
        body: Value,
        opts: &PushOptions,
    ) -> Result<PushReport> {
        let partitions = {
            let state = self.state.read().await;
            if state.destroyed {
                return Err(Error::ChannelDestroyed(self.name.clone()));
            }
            partition(
                state
                    .members
                    .iter()
                    .map(|(uid, sid)| (uid.as_str(), sid.as_str())),
                &opts.exclude,
            )
        };

        debug!(
            "Channel {}: pushing {} to {} frontend(s)",
            self.name,
            route,
            partitions.len()
        );
        self.router
            .push_partitions(&PushMessage::new(route, body), partitions)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::mock::RecordingRpc;
    use crate::topology::StaticTopology;
    use shared::{RemoteRequest, ServerInfo};
    use tokio_test::{assert_err, assert_ok};

    fn channel_with(rpc: Arc<RecordingRpc>, destroy_when_empty: bool) -> Channel {
        let topology = StaticTopology::new(vec![
            ServerInfo::frontend("f1", "connector", "127.0.0.1", 3010),
            ServerInfo::frontend("f2", "connector", "127.0.0.1", 3011),
            ServerInfo::backend("area-1", "area", "127.0.0.1", 3150),
        ]);
        let router = Arc::new(PushRouter::new(rpc, Arc::new(topology)));
        Channel::new("room1", router, Weak::new(), destroy_when_empty)
    }

    fn channel() -> Channel {
        channel_with(Arc::new(RecordingRpc::default()), false)
    }

    #[tokio::test]
    async fn test_add_and_get_member() {
        let channel = channel();
        assert_eq!(assert_ok!(channel.try_add("u1", "f1").await), AddOutcome::Added);

        assert_eq!(
            channel.get_member("u1").await,
            Some(ChannelMember {
                uid: "u1".into(),
                sid: "f1".into()
            })
        );
        assert!(channel.get_member("u2").await.is_none());
        assert_eq!(channel.get_members().await, vec!["u1"]);
    }

    #[tokio::test]
    async fn test_add_again_reassigns() {
        let channel = channel();
        assert!(channel.add("u1", "f1").await);
        assert_eq!(
            channel.try_add("u1", "f2").await,
            Ok(AddOutcome::Reassigned {
                previous: "f1".into()
            })
        );

        assert_eq!(channel.len().await, 1);
        assert_eq!(channel.get_member("u1").await.unwrap().sid, "f2");
        assert_eq!(channel.try_add("u1", "f2").await, Ok(AddOutcome::Unchanged));
    }

    #[tokio::test]
    async fn test_add_unknown_frontend_fails_quietly() {
        let channel = channel();
        assert!(!channel.add("u1", "f9").await);
        assert!(!channel.add("u1", "area-1").await);
        assert_eq!(
            channel.try_add("u1", "f9").await,
            Err(Error::UnknownServer("f9".into()))
        );
        assert!(channel.is_empty().await);
    }

    #[tokio::test]
    async fn test_leave_under_stale_frontend_fails() {
        let channel = channel();
        assert!(channel.add("u1", "f1").await);
        assert!(channel.add("u1", "f2").await);

        assert!(!channel.leave("u1", "f1").await);
        assert_eq!(channel.len().await, 1);

        assert!(channel.leave("u1", "f2").await);
        assert!(channel.is_empty().await);
        assert!(!channel.leave("u1", "f2").await);
    }

    #[tokio::test]
    async fn test_destroyed_channel_rejects_operations() {
        let channel = channel();
        assert!(channel.add("u1", "f1").await);
        channel.destroy().await;

        assert!(channel.is_destroyed().await);
        assert!(channel.get_members().await.is_empty());
        assert_eq!(
            channel.try_add("u2", "f1").await,
            Err(Error::ChannelDestroyed("room1".into()))
        );
        assert!(!channel.leave("u1", "f1").await);
        assert_err!(
            channel
                .push_message("chat", Value::Null, &PushOptions::default())
                .await
        );
    }

    #[tokio::test]
    async fn test_empty_channel_destroys_itself_when_configured() {
        let channel = channel_with(Arc::new(RecordingRpc::default()), true);
        assert!(channel.add("u1", "f1").await);
        assert!(channel.leave("u1", "f1").await);
        assert!(channel.is_destroyed().await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_add_racing_emptying_leave_is_never_lost() {
        for _ in 0..2_000 {
            let channel = Arc::new(channel_with(Arc::new(RecordingRpc::default()), true));
            assert!(channel.add("u1", "f1").await);

            let leaving = {
                let channel = Arc::clone(&channel);
                tokio::spawn(async move { channel.leave("u1", "f1").await })
            };
            let adding = {
                let channel = Arc::clone(&channel);
                tokio::spawn(async move { channel.add("u2", "f2").await })
            };
            assert!(leaving.await.unwrap());
            let added = adding.await.unwrap();

            // Either the add landed first and kept the channel alive, or it
            // was refused by the destroyed channel
            if added {
                assert!(!channel.is_destroyed().await);
                assert!(channel.get_member("u2").await.is_some());
            } else {
                assert!(channel.is_destroyed().await);
            }
        }
    }

    #[tokio::test]
    async fn test_push_message_one_call_per_frontend() {
        let rpc = Arc::new(RecordingRpc::default());
        let channel = channel_with(rpc.clone(), false);
        assert!(channel.add("u1", "f1").await);
        assert!(channel.add("u2", "f2").await);

        let report = channel
            .push_message("chat", Value::from("hi"), &PushOptions::default())
            .await
            .unwrap();
        assert_eq!(report.partitions, 2);
        assert_eq!(report.delivered, 2);

        let calls = rpc.calls();
        assert_eq!(calls.len(), 2);
        let expected = PushMessage::new("chat", Value::from("hi"));
        assert_eq!(
            calls[0],
            (
                "f1".to_string(),
                RemoteRequest::PushMessage {
                    message: expected.clone(),
                    uids: vec!["u1".into()]
                }
            )
        );
        assert_eq!(
            calls[1],
            (
                "f2".to_string(),
                RemoteRequest::PushMessage {
                    message: expected,
                    uids: vec!["u2".into()]
                }
            )
        );
    }

    #[tokio::test]
    async fn test_push_message_reports_failed_partition() {
        let rpc = Arc::new(RecordingRpc::default());
        rpc.fail("f2");
        let channel = channel_with(rpc.clone(), false);
        assert!(channel.add("u1", "f1").await);
        assert!(channel.add("u2", "f2").await);
        assert!(channel.add("u3", "f2").await);

        let err = channel
            .push_message("chat", Value::from("hi"), &PushOptions::default())
            .await
            .unwrap_err();

        match err {
            Error::PartialBroadcastFailure(failures) => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].frontend_id, "f2");
                let mut uids = failures[0].uids.clone();
                uids.sort();
                assert_eq!(uids, vec!["u2", "u3"]);
            }
            other => panic!("Unexpected error: {other:?}"),
        }
        // f1 was still called
        assert!(rpc.calls().iter().any(|(id, _)| id == "f1"));
    }

    #[tokio::test]
    async fn test_push_message_honours_exclude() {
        let rpc = Arc::new(RecordingRpc::default());
        let channel = channel_with(rpc.clone(), false);
        assert!(channel.add("u1", "f1").await);
        assert!(channel.add("u2", "f2").await);

        let opts = PushOptions {
            exclude: vec!["u2".into()],
            ..PushOptions::default()
        };
        let report = channel
            .push_message("chat", Value::Null, &opts)
            .await
            .unwrap();

        assert_eq!(report.partitions, 1);
        assert_eq!(rpc.calls()[0].0, "f1");
    }
}
