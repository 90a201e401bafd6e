//! Per-process registry of channels, plus pushes that need no channel
//!
//! Channels created here are visible only to this process. Besides managing
//! them, the service can push to an explicit list of receivers and broadcast
//! to every frontend of a given server type.

use crate::channel::{Channel, ChannelRegistry};
use crate::config::ChannelConfig;
use crate::error::{Error, Result};
use crate::push::{partition, PushOptions, PushReport, PushRouter};
use crate::rpc::RpcGateway;
use crate::topology::Topology;
use log::{debug, info};
use shared::{PushMessage, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// A push receiver: a uid and the frontend server it is connected to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receiver {
    pub uid: String,
    pub sid: Option<String>,
}

impl Receiver {
    pub fn new(uid: &str, sid: &str) -> Self {
        Self {
            uid: uid.to_string(),
            sid: Some(sid.to_string()),
        }
    }
}

pub struct ChannelService {
    server_id: String,
    config: ChannelConfig,
    channels: Arc<ChannelRegistry>,
    router: Arc<PushRouter>,
}

impl ChannelService {
    pub fn new(
        server_id: &str,
        config: ChannelConfig,
        rpc: Arc<dyn RpcGateway>,
        topology: Arc<dyn Topology>,
    ) -> Self {
        Self {
            server_id: server_id.to_string(),
            config,
            channels: Arc::new(RwLock::new(HashMap::new())),
            router: Arc::new(PushRouter::new(rpc, topology)),
        }
    }

    fn new_channel(&self, name: &str) -> Arc<Channel> {
        Arc::new(Channel::new(
            name,
            Arc::clone(&self.router),
            Arc::downgrade(&self.channels),
            self.config.destroy_when_empty,
        ))
    }

    /// Creates a channel, failing if the name is taken
    pub async fn create_channel(&self, name: &str) -> Result<Arc<Channel>> {
        let mut channels = self.channels.write().await;
        if channels.contains_key(name) {
            return Err(Error::ChannelExists(name.to_string()));
        }
        let channel = self.new_channel(name);
        channels.insert(name.to_string(), Arc::clone(&channel));
        info!("Channel {} created on {}", name, self.server_id);
        Ok(channel)
    }

    /// Returns the named channel, creating it first when `create` is set
    ///
    /// Lookup and creation happen under one lock, so concurrent callers
    /// always get the same instance.
    pub async fn get_channel(&self, name: &str, create: bool) -> Option<Arc<Channel>> {
        if !create {
            return self.channels.read().await.get(name).cloned();
        }

        let mut channels = self.channels.write().await;
        let channel = channels.entry(name.to_string()).or_insert_with(|| {
            info!("Channel {} created on {}", name, self.server_id);
            self.new_channel(name)
        });
        Some(Arc::clone(channel))
    }

    /// Removes the named channel; existing handles to it stop working
    pub async fn destroy_channel(&self, name: &str) -> bool {
        let removed = self.channels.write().await.remove(name);
        match removed {
            Some(channel) => {
                channel.mark_destroyed().await;
                info!("Channel {} destroyed on {}", name, self.server_id);
                true
            }
            None => false,
        }
    }

    pub async fn channel_names(&self) -> Vec<String> {
        self.channels.read().await.keys().cloned().collect()
    }

    /// Pushes to an explicit receiver list, one call per frontend
    ///
    /// Receivers without a sid, or whose sid is not a known frontend, are
    /// dropped without failing the push.
    pub async fn push_message_by_uids(
        &self,
        route: &str,
        body: Value,
        receivers: &[Receiver],
        opts: &PushOptions,
    ) -> Result<PushReport> {
        let resolved = receivers.iter().filter_map(|r| match &r.sid {
            Some(sid) if self.router.resolves(sid) => Some((r.uid.as_str(), sid.as_str())),
            _ => {
                debug!("Dropping receiver {} without a known frontend", r.uid);
                None
            }
        });
        let partitions = partition(resolved, &opts.exclude);

        self.router
            .push_partitions(&PushMessage::new(route, body), partitions)
            .await
    }

    /// Pushes to every connection on every frontend of `server_type`
    pub async fn broadcast(
        &self,
        server_type: &str,
        route: &str,
        body: Value,
        opts: &PushOptions,
    ) -> Result<PushReport> {
        self.router
            .broadcast(server_type, &PushMessage::new(route, body), opts)
            .await
    }
}
