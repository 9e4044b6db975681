use std::sync::Arc;

use crate::classifier::ErrorCategory;
use crate::udbc::exception::SqlException;

/// Notifications a managed connection sends to its listeners.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    ConnectionClosed {
        connection_id: u64,
        handle_id: u64,
    },
    /// 没有活动句柄也不在事务中，可以放回连接池
    ConnectionReleasable {
        connection_id: u64,
        descriptor_hash: u64,
        fatal_error_snapshot: u64,
        stale: bool,
    },
    /// The physical connection is unusable; evict it.
    ConnectionErrorOccurred {
        connection_id: u64,
        category: ErrorCategory,
        error: Option<Arc<SqlException>>,
    },
    /// Credentials went bad; purge only this connection.
    SingleConnectionErrorOccurred {
        connection_id: u64,
        error: Option<Arc<SqlException>>,
    },
    LocalTransactionStarted {
        connection_id: u64,
    },
    LocalTransactionCommitted {
        connection_id: u64,
    },
    LocalTransactionRolledBack {
        connection_id: u64,
    },
}

impl ConnectionEvent {
    pub fn connection_id(&self) -> u64 {
        match self {
            ConnectionEvent::ConnectionClosed { connection_id, .. }
            | ConnectionEvent::ConnectionReleasable { connection_id, .. }
            | ConnectionEvent::ConnectionErrorOccurred { connection_id, .. }
            | ConnectionEvent::SingleConnectionErrorOccurred { connection_id, .. }
            | ConnectionEvent::LocalTransactionStarted { connection_id }
            | ConnectionEvent::LocalTransactionCommitted { connection_id }
            | ConnectionEvent::LocalTransactionRolledBack { connection_id } => *connection_id,
        }
    }
}

/// Receives connection events.
///
/// Called while the connection is locked: implementations must not lock the
/// same managed connection again.
pub trait ConnectionEventListener: Send + Sync {
    fn connection_event(&self, event: &ConnectionEvent);
}
