use crate::error::DbError;
use crate::managed::{SharedConnection, lock};
use tracing::{debug, warn};

/// 外部事务管理器中的全局事务标识
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GlobalTransactionId(pub String);

/// A global transaction detached from the calling thread.
#[derive(Debug)]
pub struct SuspendedTransaction {
    pub id: GlobalTransactionId,
}

/// The external transaction manager coordinating global transactions.
pub trait TransactionManager: Send + Sync {
    fn current_global_transaction(&self) -> Option<GlobalTransactionId>;

    fn suspend(&self) -> Option<SuspendedTransaction>;

    fn resume(&self, tx: SuspendedTransaction);

    /// Asks the manager to enlist the connection in the current global
    /// transaction.
    fn enlist_lazily(&self, connection_id: u64) -> Result<(), DbError>;
}

/// Detaches the thread's global transaction for the lifetime of the guard.
/// The transaction is resumed on drop, including on early returns.
pub struct SuspendGuard<'a> {
    tm: Option<&'a dyn TransactionManager>,
    suspended: Option<SuspendedTransaction>,
}

impl<'a> SuspendGuard<'a> {
    pub fn suspend(tm: Option<&'a dyn TransactionManager>) -> Self {
        let suspended = tm.and_then(|t| t.suspend());
        if let Some(tx) = &suspended {
            debug!(tx = %tx.id.0, "suspended global transaction");
        }
        Self { tm, suspended }
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.is_some()
    }
}

impl Drop for SuspendGuard<'_> {
    fn drop(&mut self) {
        if let (Some(tm), Some(tx)) = (self.tm, self.suspended.take()) {
            debug!(tx = %tx.id.0, "resuming global transaction");
            tm.resume(tx);
        }
    }
}

/// Local transaction scoped to a managed connection; rolled back on drop
/// unless committed or rolled back explicitly.
pub struct TransactionContext {
    conn: SharedConnection,
    completed: bool,
}

impl TransactionContext {
    pub fn begin(conn: SharedConnection) -> Result<Self, DbError> {
        lock(&conn).begin_scoped_local()?;
        Ok(Self {
            conn,
            completed: false,
        })
    }

    pub fn commit(mut self) -> Result<(), DbError> {
        self.completed = true;
        lock(&self.conn).commit_local()
    }

    pub fn rollback(mut self) -> Result<(), DbError> {
        self.completed = true;
        lock(&self.conn).rollback_local()
    }
}

impl Drop for TransactionContext {
    fn drop(&mut self) {
        if !self.completed {
            if let Err(e) = lock(&self.conn).rollback_local() {
                warn!(error = %e, "rollback of abandoned local transaction failed");
            }
        }
    }
}
