//! Everything one server process needs, built once at start
//!
//! A [`ProcessContext`] carries the process's identity, its view of the
//! cluster, its RPC gateway and the services registered for it. Which
//! services a process gets is decided by the [`COMPONENTS`] table: frontends
//! own sessions, every process can fetch backend sessions and run channels.
//!
//! The context also serves the remote requests other processes send it. They
//! are taken off the inbound queue one at a time, so they are applied in the
//! order they arrived.

use crate::backend_session::BackendSessionService;
use crate::channel_service::ChannelService;
use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::filter::{BlockedMethods, FilterChain, LoggingFilter, RpcContext, RpcFilter};
use crate::rpc::{Envelope, Inbound, RpcGateway};
use crate::session::{AcceptAll, BroadcastFilter, SessionService};
use crate::topology::Topology;
use log::{error, info, warn};
use shared::{FaultKind, RemoteFault, RemoteRequest, RemoteResponse, ServerInfo};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentKind {
    Session,
    BackendSession,
    Channel,
}

/// Inputs shared by every component constructor
pub struct Wiring<'a> {
    pub config: &'a ServerConfig,
    pub topology: &'a Arc<dyn Topology>,
    pub rpc: &'a Arc<dyn RpcGateway>,
    pub broadcast_filter: &'a Arc<dyn BroadcastFilter>,
}

pub enum Component {
    Session(Arc<SessionService>),
    BackendSession(Arc<BackendSessionService>),
    Channel(Arc<ChannelService>),
}

pub struct Registration {
    pub kind: ComponentKind,
    pub applies: fn(&ServerInfo) -> bool,
    pub build: fn(&Wiring<'_>) -> Component,
}

fn frontend_only(server: &ServerInfo) -> bool {
    server.frontend
}

fn every_server(_server: &ServerInfo) -> bool {
    true
}

fn build_sessions(w: &Wiring<'_>) -> Component {
    let service = SessionService::new(&w.config.server.id, w.config.session.clone())
        .with_filter(Arc::clone(w.broadcast_filter));
    Component::Session(Arc::new(service))
}

fn build_backend_sessions(w: &Wiring<'_>) -> Component {
    Component::BackendSession(Arc::new(BackendSessionService::with_cache_capacity(
        Arc::clone(w.rpc),
        Arc::clone(w.topology),
        w.config.backend_session.cache_capacity,
    )))
}

fn build_channels(w: &Wiring<'_>) -> Component {
    Component::Channel(Arc::new(ChannelService::new(
        &w.config.server.id,
        w.config.channel.clone(),
        Arc::clone(w.rpc),
        Arc::clone(w.topology),
    )))
}

/// Component kind -> constructor, resolved once per process start
pub const COMPONENTS: &[Registration] = &[
    Registration {
        kind: ComponentKind::Session,
        applies: frontend_only,
        build: build_sessions,
    },
    Registration {
        kind: ComponentKind::BackendSession,
        applies: every_server,
        build: build_backend_sessions,
    },
    Registration {
        kind: ComponentKind::Channel,
        applies: every_server,
        build: build_channels,
    },
];

/// Optional extension points supplied at start
#[derive(Default)]
pub struct ProcessHooks {
    pub broadcast_filter: Option<Arc<dyn BroadcastFilter>>,
    /// Run after the built-in logging and blocked-method filters
    pub rpc_filters: Vec<Arc<dyn RpcFilter>>,
}

pub struct ProcessContext {
    config: ServerConfig,
    topology: Arc<dyn Topology>,
    rpc: Arc<dyn RpcGateway>,
    filters: FilterChain,
    kinds: Vec<ComponentKind>,
    sessions: Option<Arc<SessionService>>,
    backend_sessions: Option<Arc<BackendSessionService>>,
    channels: Option<Arc<ChannelService>>,
    serve_task: Mutex<Option<JoinHandle<()>>>,
}

impl ProcessContext {
    pub fn start(
        config: ServerConfig,
        topology: Arc<dyn Topology>,
        rpc: Arc<dyn RpcGateway>,
        hooks: ProcessHooks,
    ) -> Self {
        let broadcast_filter = hooks
            .broadcast_filter
            .unwrap_or_else(|| Arc::new(AcceptAll));

        let mut filters = FilterChain::new().with(Arc::new(LoggingFilter));
        if !config.rpc.blocked_methods.is_empty() {
            filters.push(Arc::new(BlockedMethods::new(
                config.rpc.blocked_methods.iter().cloned(),
            )));
        }
        for filter in hooks.rpc_filters {
            filters.push(filter);
        }

        let mut context = Self {
            config,
            topology,
            rpc,
            filters,
            kinds: Vec::new(),
            sessions: None,
            backend_sessions: None,
            channels: None,
            serve_task: Mutex::new(None),
        };

        let components: Vec<(ComponentKind, Component)> = {
            let wiring = Wiring {
                config: &context.config,
                topology: &context.topology,
                rpc: &context.rpc,
                broadcast_filter: &broadcast_filter,
            };
            COMPONENTS
                .iter()
                .filter(|r| (r.applies)(&context.config.server))
                .map(|r| (r.kind, (r.build)(&wiring)))
                .collect()
        };

        for (kind, component) in components {
            context.kinds.push(kind);
            match component {
                Component::Session(s) => context.sessions = Some(s),
                Component::BackendSession(s) => context.backend_sessions = Some(s),
                Component::Channel(s) => context.channels = Some(s),
            }
        }

        info!(
            "{} ({}) started with {:?}, filters {:?}",
            context.config.server.id,
            context.config.server.server_type,
            context.kinds,
            context.filters.names()
        );
        context
    }

    pub fn server(&self) -> &ServerInfo {
        &self.config.server
    }

    pub fn server_id(&self) -> &str {
        &self.config.server.id
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn topology(&self) -> &Arc<dyn Topology> {
        &self.topology
    }

    pub fn rpc(&self) -> &Arc<dyn RpcGateway> {
        &self.rpc
    }

    pub fn components(&self) -> &[ComponentKind] {
        &self.kinds
    }

    /// Present on frontends only
    pub fn sessions(&self) -> Option<&Arc<SessionService>> {
        self.sessions.as_ref()
    }

    pub fn backend_sessions(&self) -> Option<&Arc<BackendSessionService>> {
        self.backend_sessions.as_ref()
    }

    pub fn channels(&self) -> Option<&Arc<ChannelService>> {
        self.channels.as_ref()
    }

    /// Starts answering requests from `inbound`, one at a time
    pub async fn serve(self: &Arc<Self>, mut inbound: Inbound) {
        let context = Arc::clone(self);
        let handle = tokio::spawn(async move {
            while let Some(envelope) = inbound.recv().await {
                context.handle_envelope(envelope).await;
            }
            info!("{} stopped serving", context.server_id());
        });

        if let Some(previous) = self.serve_task.lock().await.replace(handle) {
            warn!("{} was already serving, replacing", self.server_id());
            previous.abort();
        }
    }

    /// Stops answering requests; calls in flight fail as unreachable
    pub async fn stop(&self) {
        let handle = self.serve_task.lock().await.take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
            info!("{} stopped", self.server_id());
        }
    }

    async fn handle_envelope(&self, envelope: Envelope) {
        let response = match shared::decode::<RemoteRequest>(&envelope.payload) {
            Ok(request) => self.handle(request).await,
            Err(e) => {
                warn!("{} received undecodable request: {}", self.server_id(), e);
                RemoteResponse::Fault(RemoteFault::new(FaultKind::Internal, e.to_string()))
            }
        };

        match shared::encode(&response) {
            Ok(bytes) => {
                // The caller may have given up already
                let _ = envelope.reply.send(bytes);
            }
            Err(e) => error!("{} failed to encode response: {}", self.server_id(), e),
        }
    }

    /// Runs one request through the filter chain and the matching service
    pub async fn handle(&self, request: RemoteRequest) -> RemoteResponse {
        let ctx = match self.filters.before(RpcContext::new(self.server_id(), request)) {
            Ok(ctx) => ctx,
            Err(e) => return e.into(),
        };

        let response = match self.dispatch(ctx.request.clone()).await {
            Ok(response) => response,
            Err(e) => e.into(),
        };

        self.filters
            .after(&ctx, response)
            .unwrap_or_else(RemoteResponse::from)
    }

    async fn dispatch(&self, request: RemoteRequest) -> Result<RemoteResponse> {
        let Some(sessions) = self.sessions.as_ref() else {
            return Ok(RemoteResponse::Fault(RemoteFault::new(
                FaultKind::Unsupported,
                format!("{} holds no sessions", self.server_id()),
            )));
        };

        let response = match request {
            RemoteRequest::GetBySid { sid } => RemoteResponse::Session(sessions.get(sid).await),
            RemoteRequest::GetByUid { uid } => {
                RemoteResponse::Sessions(sessions.get_by_uid(&uid).await)
            }
            RemoteRequest::Bind { sid, uid } => {
                sessions.bind(sid, &uid).await?;
                RemoteResponse::Done
            }
            RemoteRequest::Unbind { sid, uid } => {
                sessions.unbind(sid, &uid).await?;
                RemoteResponse::Done
            }
            RemoteRequest::Push { sid, key, value } => {
                sessions.import(sid, &key, value).await?;
                RemoteResponse::Done
            }
            RemoteRequest::PushAll { sid, settings } => {
                sessions.import_all(sid, settings).await?;
                RemoteResponse::Done
            }
            RemoteRequest::KickBySid { sid, reason } => {
                sessions.kick_by_session_id(sid, reason.as_deref()).await?;
                RemoteResponse::Done
            }
            RemoteRequest::KickByUid { uid, reason } => {
                sessions.kick(&uid, reason.as_deref()).await?;
                RemoteResponse::Done
            }
            RemoteRequest::PushMessage { message, uids } => {
                RemoteResponse::Delivered(sessions.push_by_uids(&message, &uids).await)
            }
            RemoteRequest::Broadcast {
                message,
                binded,
                filter_param,
            } => RemoteResponse::Delivered(
                sessions
                    .broadcast(&message, binded, filter_param.as_ref())
                    .await,
            ),
        };
        Ok(response)
    }
}

impl From<Error> for RemoteResponse {
    fn from(e: Error) -> Self {
        RemoteResponse::Fault(e.to_fault())
    }
}
