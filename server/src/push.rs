//! Fan-out of pushes to the frontends that own the receivers
//!
//! Receivers are grouped by frontend id and each frontend gets exactly one
//! remote call carrying all of its uids. The calls run concurrently and every
//! one of them is awaited: the fan-out succeeds only if all partitions
//! succeed, otherwise the failed partitions are reported together while the
//! deliveries that did go through stay delivered.

use crate::error::{Error, PartitionFailure, Result};
use crate::rpc::RpcGateway;
use crate::topology::Topology;
use log::{debug, warn};
use shared::{PushMessage, RemoteRequest, RemoteResponse, Value};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

/// Options accepted by channel pushes and broadcasts
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PushOptions {
    /// Broadcast only to connections with a bound uid
    pub binded: bool,
    /// Handed unchanged to the frontend's broadcast filter
    pub filter_param: Option<Value>,
    /// Uids that must not receive this push
    pub exclude: Vec<String>,
}

/// Outcome of a fan-out in which every partition succeeded
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushReport {
    /// Number of frontend calls issued
    pub partitions: usize,
    /// Connections reached, as counted by the frontends
    pub delivered: usize,
}

/// Receivers grouped by the frontend that owns their connection
pub type Partitions = BTreeMap<String, Vec<String>>;

/// Groups `(uid, frontend_id)` pairs by frontend, skipping excluded uids
pub fn partition<'a, I>(receivers: I, exclude: &[String]) -> Partitions
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let exclude: HashSet<&str> = exclude.iter().map(String::as_str).collect();
    let mut groups = Partitions::new();
    for (uid, frontend_id) in receivers {
        if exclude.contains(uid) {
            continue;
        }
        groups
            .entry(frontend_id.to_string())
            .or_default()
            .push(uid.to_string());
    }
    groups
}

/// Issues pushes to frontends through the RPC gateway
pub struct PushRouter {
    rpc: Arc<dyn RpcGateway>,
    topology: Arc<dyn Topology>,
}

impl PushRouter {
    pub fn new(rpc: Arc<dyn RpcGateway>, topology: Arc<dyn Topology>) -> Self {
        Self { rpc, topology }
    }

    /// True if `sid` names a frontend server known to the topology
    pub fn resolves(&self, sid: &str) -> bool {
        self.topology.is_frontend(sid)
    }

    /// Pushes `message` to each partition with one call per frontend
    pub async fn push_partitions(
        &self,
        message: &PushMessage,
        partitions: Partitions,
    ) -> Result<PushReport> {
        let calls = partitions
            .into_iter()
            .map(|(frontend_id, uids)| {
                let request = RemoteRequest::PushMessage {
                    message: message.clone(),
                    uids: uids.clone(),
                };
                (frontend_id, uids, request)
            })
            .collect();
        self.fan_out(calls).await
    }

    /// Pushes `message` to every server of `server_type`
    pub async fn broadcast(
        &self,
        server_type: &str,
        message: &PushMessage,
        opts: &PushOptions,
    ) -> Result<PushReport> {
        let servers = self.topology.servers_by_type(server_type);
        if servers.is_empty() {
            debug!("Broadcast {}: no {} servers", message.route, server_type);
        }
        let calls = servers
            .into_iter()
            .map(|server| {
                let request = RemoteRequest::Broadcast {
                    message: message.clone(),
                    binded: opts.binded,
                    filter_param: opts.filter_param.clone(),
                };
                (server.id, Vec::new(), request)
            })
            .collect();
        self.fan_out(calls).await
    }

    async fn fan_out(&self, calls: Vec<(String, Vec<String>, RemoteRequest)>) -> Result<PushReport> {
        let handles: Vec<_> = calls
            .into_iter()
            .map(|(frontend_id, uids, request)| {
                let rpc = Arc::clone(&self.rpc);
                let target = frontend_id.clone();
                let handle = tokio::spawn(async move { rpc.request(&target, request).await });
                (frontend_id, uids, handle)
            })
            .collect();

        let mut report = PushReport::default();
        let mut failures = Vec::new();

        for (frontend_id, uids, handle) in handles {
            report.partitions += 1;
            let reason = match handle.await {
                Ok(Ok(RemoteResponse::Delivered(count))) => {
                    report.delivered += count;
                    continue;
                }
                Ok(Ok(other)) => format!("unexpected response {other:?}"),
                Ok(Err(e)) => e.to_string(),
                Err(e) => format!("push task failed: {e}"),
            };
            warn!("Push to {} failed: {}", frontend_id, reason);
            failures.push(PartitionFailure {
                frontend_id,
                uids,
                reason,
            });
        }

        if failures.is_empty() {
            Ok(report)
        } else {
            Err(Error::PartialBroadcastFailure(failures))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::mock::RecordingRpc;
    use crate::topology::StaticTopology;
    use shared::ServerInfo;

    fn router(rpc: Arc<RecordingRpc>) -> PushRouter {
        let topology = StaticTopology::new(vec![
            ServerInfo::frontend("connector-1", "connector", "127.0.0.1", 3010),
            ServerInfo::frontend("connector-2", "connector", "127.0.0.1", 3011),
            ServerInfo::backend("area-1", "area", "127.0.0.1", 3150),
        ]);
        PushRouter::new(rpc, Arc::new(topology))
    }

    #[test]
    fn test_partition_groups_by_frontend() {
        let receivers = vec![
            ("u1", "connector-1"),
            ("u2", "connector-2"),
            ("u3", "connector-1"),
        ];
        let groups = partition(receivers, &[]);

        assert_eq!(groups.len(), 2);
        assert_eq!(groups["connector-1"], vec!["u1", "u3"]);
        assert_eq!(groups["connector-2"], vec!["u2"]);
    }

    #[test]
    fn test_partition_skips_excluded() {
        let receivers = vec![("u1", "connector-1"), ("u2", "connector-1")];
        let groups = partition(receivers, &["u1".to_string()]);
        assert_eq!(groups["connector-1"], vec!["u2"]);

        let groups = partition(vec![("u1", "connector-1")], &["u1".to_string()]);
        assert!(groups.is_empty());
    }

    #[test]
    fn test_resolves_only_frontends() {
        let router = router(Arc::new(RecordingRpc::default()));
        assert!(router.resolves("connector-1"));
        assert!(!router.resolves("area-1"));
        assert!(!router.resolves("connector-9"));
    }

    #[tokio::test]
    async fn test_empty_partitions_succeed() {
        let rpc = Arc::new(RecordingRpc::default());
        let router = router(rpc.clone());
        let message = PushMessage::new("chat", Value::Null);

        let report = router
            .push_partitions(&message, Partitions::new())
            .await
            .unwrap();
        assert_eq!(report, PushReport::default());
        assert!(rpc.calls().is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_server_of_type() {
        let rpc = Arc::new(RecordingRpc::default());
        let router = router(rpc.clone());
        let message = PushMessage::new("notice", Value::from("maintenance"));
        let opts = PushOptions {
            binded: true,
            filter_param: Some(Value::from("r1")),
            ..PushOptions::default()
        };

        let report = router.broadcast("connector", &message, &opts).await.unwrap();
        assert_eq!(report.partitions, 2);

        let calls = rpc.calls();
        let targets: Vec<&str> = calls.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(targets, vec!["connector-1", "connector-2"]);
        for (_, request) in &calls {
            assert_eq!(
                *request,
                RemoteRequest::Broadcast {
                    message: message.clone(),
                    binded: true,
                    filter_param: Some(Value::from("r1")),
                }
            );
        }
    }

    #[tokio::test]
    async fn test_broadcast_failure_names_server() {
        let rpc = Arc::new(RecordingRpc::default());
        rpc.fail("connector-1");
        let router = router(rpc.clone());
        let message = PushMessage::new("notice", Value::Null);

        let err = router
            .broadcast("connector", &message, &PushOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.failed_frontends(), vec!["connector-1"]);
        assert_eq!(rpc.calls().len(), 2);
    }

    /// Answers pushes with a lookup result, as a misrouted call would
    struct MisroutedRpc;

    #[async_trait::async_trait]
    impl RpcGateway for MisroutedRpc {
        async fn call(&self, _server_id: &str, _request: RemoteRequest) -> Result<RemoteResponse> {
            Ok(RemoteResponse::Sessions(Vec::new()))
        }
    }

    #[tokio::test]
    async fn test_unexpected_response_fails_partition() {
        let topology = StaticTopology::new(vec![ServerInfo::frontend(
            "connector-1",
            "connector",
            "127.0.0.1",
            3010,
        )]);
        let router = PushRouter::new(Arc::new(MisroutedRpc), Arc::new(topology));
        let mut partitions = Partitions::new();
        partitions.insert("connector-1".to_string(), vec!["u1".to_string()]);

        let err = router
            .push_partitions(&PushMessage::new("chat", Value::Null), partitions)
            .await
            .unwrap_err();
        match err {
            Error::PartialBroadcastFailure(failures) => {
                assert_eq!(failures[0].frontend_id, "connector-1");
                assert!(failures[0].reason.starts_with("unexpected response"));
            }
            other => panic!("Unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_broadcast_unknown_type_is_noop() {
        let rpc = Arc::new(RecordingRpc::default());
        let router = router(rpc.clone());
        let message = PushMessage::new("notice", Value::Null);

        let report = router
            .broadcast("gate", &message, &PushOptions::default())
            .await
            .unwrap();
        assert_eq!(report.partitions, 0);
    }
}
