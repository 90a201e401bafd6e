//! Filters wrapped around every inbound remote request
//!
//! A [`FilterChain`] runs each filter's `before` hook in registration order
//! and each `after` hook in reverse order. Any hook may fail, which stops the
//! request and is reported back to the caller as a rejection.

use crate::error::{Error, Result};
use log::debug;
use shared::{RemoteRequest, RemoteResponse};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

/// A remote request as it passes through the filter chain
#[derive(Debug, Clone)]
pub struct RpcContext {
    /// Id of the process handling the request
    pub server_id: String,
    pub request: RemoteRequest,
    pub received_at: Instant,
}

impl RpcContext {
    pub fn new(server_id: &str, request: RemoteRequest) -> Self {
        Self {
            server_id: server_id.to_string(),
            request,
            received_at: Instant::now(),
        }
    }
}

pub trait RpcFilter: Send + Sync {
    fn name(&self) -> &'static str;

    fn before(&self, ctx: RpcContext) -> Result<RpcContext> {
        Ok(ctx)
    }

    fn after(&self, _ctx: &RpcContext, response: RemoteResponse) -> Result<RemoteResponse> {
        Ok(response)
    }
}

#[derive(Default, Clone)]
pub struct FilterChain {
    filters: Vec<Arc<dyn RpcFilter>>,
}

impl FilterChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, filter: Arc<dyn RpcFilter>) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn push(&mut self, filter: Arc<dyn RpcFilter>) {
        self.filters.push(filter);
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.filters.iter().map(|f| f.name()).collect()
    }

    pub fn before(&self, ctx: RpcContext) -> Result<RpcContext> {
        self.filters.iter().try_fold(ctx, |ctx, f| f.before(ctx))
    }

    pub fn after(&self, ctx: &RpcContext, response: RemoteResponse) -> Result<RemoteResponse> {
        self.filters
            .iter()
            .rev()
            .try_fold(response, |response, f| f.after(ctx, response))
    }
}

/// Logs each request with the time it took to answer
pub struct LoggingFilter;

impl RpcFilter for LoggingFilter {
    fn name(&self) -> &'static str {
        "logging"
    }

    fn before(&self, ctx: RpcContext) -> Result<RpcContext> {
        debug!("[{}] <- {}", ctx.server_id, ctx.request.method());
        Ok(ctx)
    }

    fn after(&self, ctx: &RpcContext, response: RemoteResponse) -> Result<RemoteResponse> {
        debug!(
            "[{}] -> {} in {:?}",
            ctx.server_id,
            ctx.request.method(),
            ctx.received_at.elapsed()
        );
        Ok(response)
    }
}

/// Rejects requests for methods that have been switched off
pub struct BlockedMethods {
    methods: HashSet<String>,
}

impl BlockedMethods {
    pub fn new<I, S>(methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            methods: methods.into_iter().map(Into::into).collect(),
        }
    }
}

impl RpcFilter for BlockedMethods {
    fn name(&self) -> &'static str {
        "blocked-methods"
    }

    fn before(&self, ctx: RpcContext) -> Result<RpcContext> {
        let method = ctx.request.method();
        if self.methods.contains(method) {
            return Err(Error::Rejected(format!("{method} is disabled")));
        }
        Ok(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recorder {
        label: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl RpcFilter for Recorder {
        fn name(&self) -> &'static str {
            self.label
        }

        fn before(&self, ctx: RpcContext) -> Result<RpcContext> {
            self.log.lock().unwrap().push(format!("before:{}", self.label));
            Ok(ctx)
        }

        fn after(&self, _ctx: &RpcContext, response: RemoteResponse) -> Result<RemoteResponse> {
            self.log.lock().unwrap().push(format!("after:{}", self.label));
            Ok(response)
        }
    }

    fn request() -> RemoteRequest {
        RemoteRequest::KickByUid {
            uid: "u1".to_string(),
            reason: None,
        }
    }

    #[test]
    fn test_hooks_run_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = FilterChain::new()
            .with(Arc::new(Recorder {
                label: "a",
                log: log.clone(),
            }))
            .with(Arc::new(Recorder {
                label: "b",
                log: log.clone(),
            }));

        let ctx = chain.before(RpcContext::new("connector-1", request())).unwrap();
        let response = chain.after(&ctx, RemoteResponse::Done).unwrap();

        assert_eq!(response, RemoteResponse::Done);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["before:a", "before:b", "after:b", "after:a"]
        );
        assert_eq!(chain.names(), vec!["a", "b"]);
    }

    #[test]
    fn test_blocked_method_short_circuits() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = FilterChain::new()
            .with(Arc::new(BlockedMethods::new(["session.kickByUid"])))
            .with(Arc::new(Recorder {
                label: "a",
                log: log.clone(),
            }));

        let err = chain
            .before(RpcContext::new("connector-1", request()))
            .unwrap_err();

        assert_eq!(err, Error::Rejected("session.kickByUid is disabled".into()));
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn test_logging_filter_passes_through() {
        let chain = FilterChain::new().with(Arc::new(LoggingFilter));
        let ctx = chain
            .before(RpcContext::new("connector-1", RemoteRequest::GetBySid { sid: 1 }))
            .unwrap();
        assert_eq!(
            chain.after(&ctx, RemoteResponse::Delivered(2)).unwrap(),
            RemoteResponse::Delivered(2)
        );
    }
}
