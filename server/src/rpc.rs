//! Remote calls between server processes
//!
//! [`RpcGateway`] is the only way one process reaches another. The
//! [`LocalCluster`] implementation connects processes that share a tokio
//! runtime: every request and response is bincode-encoded on the way through,
//! the same way a network transport would carry it, so nothing but plain data
//! crosses a process boundary.

use crate::config::RpcConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use log::{debug, warn};
use shared::{RemoteRequest, RemoteResponse};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, RwLock};

#[async_trait]
pub trait RpcGateway: Send + Sync {
    /// Sends `request` to `server_id` and waits for its response
    ///
    /// Transport failures (unknown endpoint, stopped process, timeout) are
    /// returned as [`Error::RemoteUnreachable`]. A fault raised by the remote
    /// side comes back as `Ok(RemoteResponse::Fault(..))`.
    async fn call(&self, server_id: &str, request: RemoteRequest) -> Result<RemoteResponse>;

    /// Like [`RpcGateway::call`], with remote faults mapped onto [`Error`]
    async fn request(&self, server_id: &str, request: RemoteRequest) -> Result<RemoteResponse> {
        match self.call(server_id, request).await? {
            RemoteResponse::Fault(fault) => Err(Error::from_fault(server_id, fault)),
            response => Ok(response),
        }
    }
}

/// A request travelling to a process, with the slot for its answer
#[derive(Debug)]
pub struct Envelope {
    pub payload: Vec<u8>,
    pub reply: oneshot::Sender<Vec<u8>>,
}

/// Inbound request queue of one registered process
pub type Inbound = mpsc::UnboundedReceiver<Envelope>;

/// Message bus connecting the processes of one runtime
pub struct LocalCluster {
    endpoints: RwLock<HashMap<String, mpsc::UnboundedSender<Envelope>>>,
    timeout: Duration,
}

impl LocalCluster {
    pub fn new(timeout: Duration) -> Self {
        Self {
            endpoints: RwLock::new(HashMap::new()),
            timeout,
        }
    }

    /// Builds a bus whose calls give up after `config.timeout()`
    pub fn from_config(config: &RpcConfig) -> Self {
        Self::new(config.timeout())
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Registers `server_id` and returns the queue its requests arrive on
    ///
    /// Registering an id again replaces the previous endpoint.
    pub async fn register(&self, server_id: &str) -> Inbound {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut endpoints = self.endpoints.write().await;
        if endpoints.insert(server_id.to_string(), tx).is_some() {
            warn!("Endpoint {} re-registered", server_id);
        }
        debug!("Endpoint {} registered", server_id);
        rx
    }

    pub async fn unregister(&self, server_id: &str) -> bool {
        self.endpoints.write().await.remove(server_id).is_some()
    }

    pub async fn is_registered(&self, server_id: &str) -> bool {
        self.endpoints.read().await.contains_key(server_id)
    }

    fn unreachable(server_id: &str, reason: impl Into<String>) -> Error {
        Error::RemoteUnreachable {
            server_id: server_id.to_string(),
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl RpcGateway for LocalCluster {
    async fn call(&self, server_id: &str, request: RemoteRequest) -> Result<RemoteResponse> {
        let endpoint = {
            let endpoints = self.endpoints.read().await;
            endpoints.get(server_id).cloned()
        }
        .ok_or_else(|| Self::unreachable(server_id, "no such endpoint"))?;

        let method = request.method();
        let payload = shared::encode(&request)?;
        let (reply, response) = oneshot::channel();

        endpoint
            .send(Envelope { payload, reply })
            .map_err(|_| Self::unreachable(server_id, "endpoint stopped"))?;

        let bytes = match tokio::time::timeout(self.timeout, response).await {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(_)) => return Err(Self::unreachable(server_id, "request dropped")),
            Err(_) => {
                return Err(Self::unreachable(
                    server_id,
                    format!("timed out after {:?}", self.timeout),
                ))
            }
        };

        let response: RemoteResponse = shared::decode(&bytes)?;
        debug!("{} -> {} answered {:?}", method, server_id, response);
        Ok(response)
    }
}
