//! Types exchanged between frontend and backend processes
//!
//! Everything in this crate crosses a process boundary, so every type is plain
//! data that serializes with bincode. Nothing here holds a reference to live
//! connection state.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Identifier of one connection on its frontend process
pub type SessionId = u64;

/// Arbitrary value stored in session settings or carried by a push
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Map(HashMap<String, Value>),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

/// Static description of one server process in the cluster
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ServerInfo {
    pub id: String,
    pub server_type: String,
    pub host: String,
    pub port: u16,
    /// Frontends hold client connections, backends only run game logic
    pub frontend: bool,
}

impl ServerInfo {
    pub fn frontend(id: &str, server_type: &str, host: &str, port: u16) -> Self {
        Self {
            id: id.to_string(),
            server_type: server_type.to_string(),
            host: host.to_string(),
            port,
            frontend: true,
        }
    }

    pub fn backend(id: &str, server_type: &str, host: &str, port: u16) -> Self {
        Self {
            id: id.to_string(),
            server_type: server_type.to_string(),
            host: host.to_string(),
            port,
            frontend: false,
        }
    }
}

/// Point-in-time copy of a frontend session's bindable fields
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub frontend_id: String,
    pub uid: Option<String>,
    pub settings: HashMap<String, Value>,
}

/// Message delivered to a client connection
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PushMessage {
    pub route: String,
    pub body: Value,
}

impl PushMessage {
    pub fn new(route: &str, body: Value) -> Self {
        Self {
            route: route.to_string(),
            body,
        }
    }
}

/// Requests one process sends to another through the RPC gateway
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum RemoteRequest {
    // Session remote (served by frontends)
    GetBySid {
        sid: SessionId,
    },
    GetByUid {
        uid: String,
    },
    Bind {
        sid: SessionId,
        uid: String,
    },
    Unbind {
        sid: SessionId,
        uid: String,
    },
    /// `None` removes the key on the frontend
    Push {
        sid: SessionId,
        key: String,
        value: Option<Value>,
    },
    PushAll {
        sid: SessionId,
        settings: HashMap<String, Value>,
    },
    KickBySid {
        sid: SessionId,
        reason: Option<String>,
    },
    KickByUid {
        uid: String,
        reason: Option<String>,
    },

    // Channel remote (served by frontends)
    PushMessage {
        message: PushMessage,
        uids: Vec<String>,
    },
    Broadcast {
        message: PushMessage,
        binded: bool,
        filter_param: Option<Value>,
    },
}

impl RemoteRequest {
    /// Short service.method name used in logs and filters
    pub fn method(&self) -> &'static str {
        match self {
            RemoteRequest::GetBySid { .. } => "session.getBySid",
            RemoteRequest::GetByUid { .. } => "session.getByUid",
            RemoteRequest::Bind { .. } => "session.bind",
            RemoteRequest::Unbind { .. } => "session.unbind",
            RemoteRequest::Push { .. } => "session.push",
            RemoteRequest::PushAll { .. } => "session.pushAll",
            RemoteRequest::KickBySid { .. } => "session.kickBySid",
            RemoteRequest::KickByUid { .. } => "session.kickByUid",
            RemoteRequest::PushMessage { .. } => "channel.pushMessage",
            RemoteRequest::Broadcast { .. } => "channel.broadcast",
        }
    }
}

/// Category of a failure reported by the remote side
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    SessionNotFound,
    InvalidBindState,
    Rejected,
    /// The session's connection was already gone when it was written to
    ConnectionClosed(SessionId),
    Unsupported,
    Internal,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct RemoteFault {
    pub kind: FaultKind,
    pub message: String,
}

impl RemoteFault {
    pub fn new(kind: FaultKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum RemoteResponse {
    Done,
    Session(Option<SessionSnapshot>),
    Sessions(Vec<SessionSnapshot>),
    /// Number of connections a push reached
    Delivered(usize),
    Fault(RemoteFault),
}

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, bincode::Error> {
    bincode::serialize(value)
}

pub fn decode<'a, T: Deserialize<'a>>(bytes: &'a [u8]) -> Result<T, bincode::Error> {
    bincode::deserialize(bytes)
}
