//! Error types for the session and channel services

use shared::{FaultKind, RemoteFault, SessionId};
use thiserror::Error;

/// A frontend partition of a fan-out push that failed
#[derive(Debug, Clone, PartialEq)]
pub struct PartitionFailure {
    pub frontend_id: String,
    /// Receivers that were addressed through this frontend
    pub uids: Vec<String>,
    pub reason: String,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("server {server_id} unreachable: {reason}")]
    RemoteUnreachable { server_id: String, reason: String },

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("invalid bind state: {0}")]
    InvalidBindState(String),

    #[error("push failed on {} frontend partition(s)", .0.len())]
    PartialBroadcastFailure(Vec<PartitionFailure>),

    #[error("channel {0} already exists")]
    ChannelExists(String),

    #[error("channel {0} has been destroyed")]
    ChannelDestroyed(String),

    #[error("unknown server: {0}")]
    UnknownServer(String),

    #[error("server {server_id} failed: {message}")]
    Remote { server_id: String, message: String },

    #[error("request rejected: {0}")]
    Rejected(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("connection for session {0} is closed")]
    ConnectionClosed(SessionId),
}

impl Error {
    /// Only transport failures are worth retrying; everything else needs the
    /// caller to re-resolve or fix its usage.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::RemoteUnreachable { .. })
    }

    /// Frontend ids of the partitions that failed, empty for other kinds
    pub fn failed_frontends(&self) -> Vec<&str> {
        match self {
            Error::PartialBroadcastFailure(failures) => {
                failures.iter().map(|f| f.frontend_id.as_str()).collect()
            }
            _ => Vec::new(),
        }
    }

    /// Maps a fault reported by `server_id` back onto a local error kind
    pub fn from_fault(server_id: &str, fault: RemoteFault) -> Self {
        match fault.kind {
            FaultKind::SessionNotFound => Error::SessionNotFound(fault.message),
            FaultKind::InvalidBindState => Error::InvalidBindState(fault.message),
            FaultKind::Rejected => Error::Rejected(fault.message),
            FaultKind::ConnectionClosed(sid) => Error::ConnectionClosed(sid),
            FaultKind::Unsupported | FaultKind::Internal => Error::Remote {
                server_id: server_id.to_string(),
                message: fault.message,
            },
        }
    }

    /// Inverse of [`Error::from_fault`], used when answering a remote request
    pub fn to_fault(&self) -> RemoteFault {
        let kind = match self {
            Error::SessionNotFound(_) => FaultKind::SessionNotFound,
            Error::InvalidBindState(_) => FaultKind::InvalidBindState,
            Error::Rejected(_) => FaultKind::Rejected,
            Error::ConnectionClosed(sid) => FaultKind::ConnectionClosed(*sid),
            _ => FaultKind::Internal,
        };
        let message = match self {
            Error::SessionNotFound(m) | Error::InvalidBindState(m) | Error::Rejected(m) => {
                m.clone()
            }
            other => other.to_string(),
        };
        RemoteFault::new(kind, message)
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Codec(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_unreachable_is_retryable() {
        let unreachable = Error::RemoteUnreachable {
            server_id: "connector-1".to_string(),
            reason: "timed out".to_string(),
        };
        assert!(unreachable.is_retryable());
        assert!(!Error::SessionNotFound("7".to_string()).is_retryable());
        assert!(!Error::InvalidBindState("already bound".to_string()).is_retryable());
        assert!(!Error::PartialBroadcastFailure(vec![]).is_retryable());
    }

    #[test]
    fn test_fault_mapping_keeps_kind() {
        let fault = RemoteFault::new(FaultKind::SessionNotFound, "session 4 not found");
        assert_eq!(
            Error::from_fault("connector-1", fault),
            Error::SessionNotFound("session 4 not found".to_string())
        );

        let fault = RemoteFault::new(FaultKind::Unsupported, "not a frontend");
        match Error::from_fault("area-1", fault) {
            Error::Remote { server_id, message } => {
                assert_eq!(server_id, "area-1");
                assert_eq!(message, "not a frontend");
            }
            other => panic!("Unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_to_fault_round_trips_bind_errors() {
        let err = Error::InvalidBindState("session 1 already bound to u1".to_string());
        let fault = err.to_fault();
        assert_eq!(fault.kind, FaultKind::InvalidBindState);
        assert_eq!(Error::from_fault("connector-1", fault), err);
    }

    #[test]
    fn test_closed_connection_keeps_its_sid_across_processes() {
        let err = Error::ConnectionClosed(12);
        let fault = err.to_fault();
        assert_eq!(fault.kind, FaultKind::ConnectionClosed(12));
        assert_eq!(Error::from_fault("connector-1", fault), err);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_partial_failure_lists_frontends() {
        let err = Error::PartialBroadcastFailure(vec![PartitionFailure {
            frontend_id: "connector-2".to_string(),
            uids: vec!["u2".to_string()],
            reason: "timed out".to_string(),
        }]);
        assert_eq!(err.failed_frontends(), vec!["connector-2"]);
        assert_eq!(err.to_string(), "push failed on 1 frontend partition(s)");
    }
}
