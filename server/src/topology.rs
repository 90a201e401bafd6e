//! Read-only view of which servers exist in the cluster

use shared::ServerInfo;
use std::collections::HashMap;

/// Server lookup consumed by channel routing and backend sessions
pub trait Topology: Send + Sync {
    fn server_by_id(&self, id: &str) -> Option<ServerInfo>;
    fn servers_by_type(&self, server_type: &str) -> Vec<ServerInfo>;

    /// True if `id` names a server that holds client connections
    fn is_frontend(&self, id: &str) -> bool {
        self.server_by_id(id).map(|s| s.frontend).unwrap_or(false)
    }
}

/// Topology fixed at process start
#[derive(Debug, Default, Clone)]
pub struct StaticTopology {
    servers: HashMap<String, ServerInfo>,
}

impl StaticTopology {
    pub fn new(servers: Vec<ServerInfo>) -> Self {
        Self {
            servers: servers.into_iter().map(|s| (s.id.clone(), s)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }
}

impl Topology for StaticTopology {
    fn server_by_id(&self, id: &str) -> Option<ServerInfo> {
        self.servers.get(id).cloned()
    }

    fn servers_by_type(&self, server_type: &str) -> Vec<ServerInfo> {
        let mut servers: Vec<ServerInfo> = self
            .servers
            .values()
            .filter(|s| s.server_type == server_type)
            .cloned()
            .collect();
        servers.sort_by(|a, b| a.id.cmp(&b.id));
        servers
    }
}
