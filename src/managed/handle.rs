use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::DbError;
use crate::managed::{SharedConnection, lock};
use crate::transaction::TransactionContext;
use crate::udbc::exception::SqlException;
use crate::udbc::statement::{Statement, StatementKey};

/// Application-facing view of a managed connection.
///
/// Closing (or dropping) the handle hands the connection back; the pool
/// takes it once no handle and no transaction are left on it.
pub struct ConnectionHandle {
    id: u64,
    connection_id: u64,
    conn: SharedConnection,
    closed: bool,
}

impl ConnectionHandle {
    pub(crate) fn new(id: u64, connection_id: u64, conn: SharedConnection) -> Self {
        Self {
            id,
            connection_id,
            conn,
            closed: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    pub fn connection(&self) -> &SharedConnection {
        &self.conn
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn ensure_open(&self) -> Result<(), DbError> {
        if self.closed {
            return Err(DbError::Connection(format!("handle {} is closed", self.id)));
        }
        Ok(())
    }

    /// Enlists the connection with the current global transaction on its
    /// first use there. The connection stays unlocked while the manager
    /// is called, since enlisting starts a branch on it.
    fn signal_lazy_enlistment(&self) -> Result<(), DbError> {
        let target = lock(&self.conn).lazy_enlistment_target();
        if let Some(tm) = target {
            tm.enlist_lazily(self.connection_id)?;
            lock(&self.conn).mark_lazily_enlisted();
        }
        Ok(())
    }

    pub fn prepare_statement(&self, key: &StatementKey) -> Result<Box<dyn Statement>, DbError> {
        self.ensure_open()?;
        self.signal_lazy_enlistment()?;
        lock(&self.conn).prepare_statement(key)
    }

    pub fn return_statement(&self, key: StatementKey, stmt: Box<dyn Statement>) {
        lock(&self.conn).return_statement(key, stmt);
    }

    /// Reports a driver failure raised while using a statement; the
    /// classified error comes back for the caller to surface.
    pub fn statement_failed(&self, key: &StatementKey, e: Arc<SqlException>) -> DbError {
        lock(&self.conn).statement_failed(key, e)
    }

    pub fn auto_commit(&self) -> Result<bool, DbError> {
        self.ensure_open()?;
        lock(&self.conn)
            .handle_auto_commit(self.id)
            .ok_or_else(|| DbError::Connection(format!("handle {} is not associated", self.id)))
    }

    pub fn set_auto_commit(&self, on: bool) -> Result<(), DbError> {
        self.ensure_open()?;
        lock(&self.conn).set_auto_commit(self.id, on)
    }

    pub fn commit(&self) -> Result<(), DbError> {
        self.ensure_open()?;
        lock(&self.conn).commit()
    }

    pub fn rollback(&self) -> Result<(), DbError> {
        self.ensure_open()?;
        lock(&self.conn).rollback()
    }

    /// Starts a local transaction, rolled back unless completed.
    pub fn begin(&self) -> Result<TransactionContext, DbError> {
        self.ensure_open()?;
        TransactionContext::begin(self.conn.clone())
    }

    pub fn close(mut self) -> Result<(), DbError> {
        self.close_inner()
    }

    fn close_inner(&mut self) -> Result<(), DbError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        debug!(connection_id = self.connection_id, handle_id = self.id, "handle closed");
        lock(&self.conn).close_handle(self.id)
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        if let Err(e) = self.close_inner() {
            warn!(handle_id = self.id, error = %e, "closing dropped handle failed");
        }
    }
}
