//! Two-phase-commit participation of a managed connection.
//!
//! The coordinator fences every call against the branch bound by `start`,
//! keeps heuristic outcomes until they are explicitly forgotten and defers
//! two-phase traffic for a while after the pool has seen a stale connection.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::classifier::ErrorCategory;
use crate::error::{XaError, XaErrorCode};
use crate::managed::connection::ManagedConnection;
use crate::managed::state::{TransactionState, Transition};
use crate::managed::{SharedConnection, lock};
use crate::udbc::xa::{XaFlags, XaResource, XaVote, Xid};

/// Per-pool record of the last stale-connection event, shared by all
/// branches of the pool.
#[derive(Debug, Default)]
pub struct FailoverTracker {
    last_stale: Mutex<Option<Instant>>,
}

impl FailoverTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_stale(&self) {
        *self.last_stale.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
    }

    /// Whether two-phase traffic is still suspended. The flag is cleared
    /// once the window has elapsed.
    pub fn should_defer(&self, window: Option<Duration>) -> bool {
        let Some(window) = window else {
            return false;
        };
        let mut last = self.last_stale.lock().unwrap_or_else(|e| e.into_inner());
        match *last {
            Some(at) if at.elapsed() < window => true,
            Some(_) => {
                *last = None;
                false
            }
            None => false,
        }
    }
}

/// Branch bookkeeping, created on the first two-phase call.
#[derive(Debug, Clone, Default)]
pub struct BranchState {
    pub xid: Option<Xid>,
    pub prepared: bool,
    /// 启发式结果保留到 forget 为止
    pub heuristic: Option<(Xid, XaErrorCode)>,
}

fn protocol(message: String) -> XaError {
    XaError::new(XaErrorCode::Protocol, message)
}

impl ManagedConnection {
    fn xa_driver(&self) -> Result<Arc<dyn XaResource>, XaError> {
        if self.aborted {
            return Err(XaError::new(
                XaErrorCode::RmFail,
                format!("connection {} was aborted", self.id()),
            ));
        }
        self.driver_xa.clone().ok_or_else(|| {
            XaError::new(
                XaErrorCode::RmError,
                "driver does not support two-phase commit",
            )
        })
    }

    fn branch_mut(&mut self) -> &mut BranchState {
        self.branch.get_or_insert_with(BranchState::default)
    }

    fn bound_xid(&self) -> Option<&Xid> {
        self.branch.as_ref().and_then(|b| b.xid.as_ref())
    }

    fn fence(&self, xid: &Xid) -> Result<(), XaError> {
        match self.bound_xid() {
            Some(bound) if bound != xid => Err(XaError::new(
                XaErrorCode::NoSuchBranch,
                format!("branch {} is not the bound branch {}", xid, bound),
            )),
            _ => Ok(()),
        }
    }

    fn check_xa(&self, t: Transition) -> Result<(), XaError> {
        self.state.check(t).map_err(|e| protocol(e.to_string()))
    }

    fn apply_xa(&mut self, t: Transition) {
        if let Err(e) = self.state.apply(t) {
            warn!(connection_id = self.id(), error = %e, "transaction state not updated");
        }
    }

    /// Classifies a failed driver call and raises the eviction signal when
    /// the connection is gone. The error is always handed back.
    fn xa_failed(&mut self, op: &'static str, err: XaError) -> XaError {
        let category = self.classifier.classify_xa(&err);
        warn!(connection_id = self.id(), op, code = %err.code, category = ?category, "xa operation failed");
        match category {
            ErrorCategory::StaleConnection => {
                self.fire_connection_error(err.source.clone(), category)
            }
            ErrorCategory::Authorization => self.fire_single_connection_error(err.source.clone()),
            _ => {}
        }
        err
    }

    fn branch_completed(&mut self) {
        if let Some(b) = self.branch.as_mut() {
            b.xid = None;
            b.prepared = false;
        }
        self.transaction_ended();
    }

    /// Whether a commit or rollback arrives without this connection having
    /// bound the branch, as after a process restart.
    fn is_recovery_path(&self, xid: &Xid) -> bool {
        self.state() == TransactionState::RecoveryInProgress
            || match self.bound_xid() {
                None => true,
                Some(bound) => bound != xid && !self.state().in_transaction(),
            }
    }

    fn enter_recovery(&mut self) {
        if self.state() != TransactionState::RecoveryInProgress {
            self.apply_xa(Transition::MarkRecovering);
        }
    }

    pub fn xa_start(&mut self, xid: &Xid, flags: XaFlags) -> Result<(), XaError> {
        let driver = self.xa_driver()?;
        let transition = if flags.contains(XaFlags::RESUME) || flags.contains(XaFlags::JOIN) {
            if self.state() == TransactionState::TransactionEnding {
                self.fence(xid)?;
                Transition::ResumeBranch
            } else {
                Transition::StartBranch
            }
        } else {
            Transition::StartBranch
        };
        self.check_xa(transition)?;

        if let Err(e) = driver.start(xid, flags) {
            let e = self.xa_failed("start", e);
            if !self.aborted {
                // best effort: leave nothing half-started in the driver
                if let Err(end) = driver.end(xid, XaFlags::FAIL) {
                    debug!(connection_id = self.id(), error = %end, "end after failed start");
                }
                if let Err(rb) = driver.rollback(xid) {
                    debug!(connection_id = self.id(), error = %rb, "rollback after failed start");
                }
            }
            let mut err = protocol(format!("start of branch {} failed: {}", xid, e));
            err.source = e.source;
            return Err(err);
        }
        self.branch_mut().xid = Some(xid.clone());
        self.apply_xa(transition);
        debug!(connection_id = self.id(), xid = %xid, "branch started");
        Ok(())
    }

    pub fn xa_end(&mut self, xid: &Xid, flags: XaFlags) -> Result<(), XaError> {
        let driver = self.xa_driver()?;
        if let Err(e) = self.check_xa(Transition::EndBranch) {
            // rollback-on-end so the driver does not keep the branch open
            if let Err(end) = driver.end(xid, XaFlags::FAIL) {
                debug!(connection_id = self.id(), error = %end, "safety-net end failed");
            }
            return Err(e);
        }
        self.fence(xid)?;

        if let Err(e) = driver.end(xid, flags) {
            if e.code.is_rollback() {
                // branch is rollback-only; the manager still has to roll it back
                self.apply_xa(Transition::EndBranch);
                return Err(e);
            }
            return Err(self.xa_failed("end", e));
        }
        self.apply_xa(Transition::EndBranch);

        let resets = self.classifier.vendor().xa_end_resets_auto_commit;
        if resets {
            let current = self
                .physical()
                .map_err(|e| XaError::new(XaErrorCode::RmFail, e.to_string()))?
                .auto_commit();
            match current {
                Ok(on) => {
                    self.props.auto_commit = on;
                    for h in self.handles.iter_mut() {
                        h.auto_commit = on;
                    }
                }
                Err(e) => {
                    let err = XaError::new(XaErrorCode::RmError, e.message().to_string())
                        .with_source(e);
                    return Err(self.xa_failed("end", err));
                }
            }
        }
        debug!(connection_id = self.id(), xid = %xid, "branch ended");
        Ok(())
    }

    pub fn xa_prepare(&mut self, xid: &Xid) -> Result<XaVote, XaError> {
        let driver = self.xa_driver()?;
        match self.state() {
            TransactionState::RecoveryInProgress => {}
            TransactionState::TransactionEnding => self.fence(xid)?,
            state => {
                return Err(protocol(format!(
                    "prepare is not valid in state {}",
                    state.name()
                )));
            }
        }
        match driver.prepare(xid) {
            Ok(XaVote::ReadOnly) => {
                self.apply_xa(Transition::PrepareReadOnly);
                debug!(connection_id = self.id(), xid = %xid, "read-only vote");
                self.branch_completed();
                Ok(XaVote::ReadOnly)
            }
            Ok(XaVote::Ok) => {
                self.branch_mut().prepared = true;
                Ok(XaVote::Ok)
            }
            Err(e) if e.code.is_rollback() => {
                self.apply_xa(Transition::RollbackBranch);
                self.branch_completed();
                Err(e)
            }
            Err(e) => Err(self.xa_failed("prepare", e)),
        }
    }

    fn heuristic_replay(&self, xid: &Xid) -> Option<XaError> {
        let (hx, code) = self.branch.as_ref()?.heuristic.as_ref()?;
        (hx == xid).then(|| {
            XaError::new(
                *code,
                format!("branch {} already completed heuristically", xid),
            )
        })
    }

    fn check_deferral(&self) -> Result<(), XaError> {
        if self.failover.should_defer(self.config.failover_retry_delay_window()) {
            info!(connection_id = self.id(), "two-phase operation deferred after failover");
            return Err(XaError::new(
                XaErrorCode::Retry,
                "recent stale connection in this pool, retry later",
            ));
        }
        Ok(())
    }

    pub fn xa_commit(&mut self, xid: &Xid, one_phase: bool) -> Result<(), XaError> {
        let driver = self.xa_driver()?;
        if let Some(e) = self.heuristic_replay(xid) {
            return Err(e);
        }
        if !one_phase {
            self.check_deferral()?;
        }
        let recovery = self.is_recovery_path(xid);
        if recovery {
            self.enter_recovery();
        } else {
            self.check_xa(Transition::CommitBranch)?;
            self.fence(xid)?;
        }

        match driver.commit(xid, one_phase) {
            Ok(()) => {
                self.apply_xa(Transition::CommitBranch);
                debug!(connection_id = self.id(), xid = %xid, one_phase, recovery, "branch committed");
                self.branch_completed();
                Ok(())
            }
            Err(e) => Err(self.completion_failed("commit", xid, e)),
        }
    }

    pub fn xa_rollback(&mut self, xid: &Xid) -> Result<(), XaError> {
        let driver = self.xa_driver()?;
        if let Some(e) = self.heuristic_replay(xid) {
            return Err(e);
        }
        let recovery = self.is_recovery_path(xid);
        let prepared = self.branch.as_ref().is_some_and(|b| b.prepared);
        if recovery || prepared {
            self.check_deferral()?;
        }
        if recovery {
            self.enter_recovery();
        } else {
            self.check_xa(Transition::RollbackBranch)?;
            self.fence(xid)?;
        }

        match driver.rollback(xid) {
            Ok(()) => {
                self.apply_xa(Transition::RollbackBranch);
                debug!(connection_id = self.id(), xid = %xid, recovery, "branch rolled back");
                self.branch_completed();
                Ok(())
            }
            Err(e) => Err(self.completion_failed("rollback", xid, e)),
        }
    }

    fn completion_failed(&mut self, op: &'static str, xid: &Xid, e: XaError) -> XaError {
        if e.code.is_heuristic() {
            self.apply_xa(Transition::HeuristicOutcome);
            let branch = self.branch_mut();
            branch.heuristic = Some((xid.clone(), e.code));
            branch.xid = None;
            warn!(connection_id = self.id(), xid = %xid, code = %e.code, "heuristic outcome, waiting for forget");
            return e;
        }
        if e.code.is_rollback() {
            self.apply_xa(Transition::RollbackBranch);
            self.branch_completed();
            return e;
        }
        self.xa_failed(op, e)
    }

    pub fn xa_forget(&mut self, xid: &Xid) -> Result<(), XaError> {
        let driver = self.xa_driver()?;
        if let Err(e) = driver.forget(xid) {
            return Err(self.xa_failed("forget", e));
        }
        if let Some(b) = self.branch.as_mut() {
            if b.heuristic.as_ref().is_some_and(|(hx, _)| hx == xid) {
                b.heuristic = None;
            }
        }
        if matches!(
            self.state(),
            TransactionState::HeuristicEnd | TransactionState::RecoveryInProgress
        ) {
            self.apply_xa(Transition::Forget);
            self.branch_completed();
        }
        debug!(connection_id = self.id(), xid = %xid, "branch forgotten");
        Ok(())
    }

    pub fn xa_recover(&mut self, flags: XaFlags) -> Result<Vec<Xid>, XaError> {
        let driver = self.xa_driver()?;
        match driver.recover(flags) {
            Ok(xids) => {
                if !xids.is_empty() {
                    info!(
                        connection_id = self.id(),
                        count = xids.len(),
                        "in-doubt branches reported"
                    );
                    self.enter_recovery();
                }
                Ok(xids)
            }
            Err(e) => Err(self.xa_failed("recover", e)),
        }
    }

    pub fn xa_resource_manager_id(&self) -> Option<String> {
        self.driver_xa.as_ref().map(|x| x.resource_manager_id())
    }

    pub fn xa_transaction_timeout(&mut self) -> Result<u32, XaError> {
        let driver = self.xa_driver()?;
        driver
            .transaction_timeout()
            .map_err(|e| self.xa_failed("getTransactionTimeout", e))
    }

    pub fn xa_set_transaction_timeout(&mut self, secs: u32) -> Result<bool, XaError> {
        let driver = self.xa_driver()?;
        driver
            .set_transaction_timeout(secs)
            .map_err(|e| self.xa_failed("setTransactionTimeout", e))
    }
}

/// The two-phase-commit resource a transaction manager enlists for one
/// managed connection.
#[derive(Clone)]
pub struct ManagedXaResource {
    conn: SharedConnection,
    rm_id: String,
}

impl ManagedXaResource {
    pub fn new(conn: SharedConnection) -> Self {
        let rm_id = {
            let mc = lock(&conn);
            mc.xa_resource_manager_id()
                .unwrap_or_else(|| format!("{}:{}", mc.config().name, mc.config().pool_id))
        };
        Self { conn, rm_id }
    }

    pub fn connection(&self) -> &SharedConnection {
        &self.conn
    }
}

impl XaResource for ManagedXaResource {
    fn start(&self, xid: &Xid, flags: XaFlags) -> Result<(), XaError> {
        lock(&self.conn).xa_start(xid, flags)
    }

    fn end(&self, xid: &Xid, flags: XaFlags) -> Result<(), XaError> {
        lock(&self.conn).xa_end(xid, flags)
    }

    fn prepare(&self, xid: &Xid) -> Result<XaVote, XaError> {
        lock(&self.conn).xa_prepare(xid)
    }

    fn commit(&self, xid: &Xid, one_phase: bool) -> Result<(), XaError> {
        lock(&self.conn).xa_commit(xid, one_phase)
    }

    fn rollback(&self, xid: &Xid) -> Result<(), XaError> {
        lock(&self.conn).xa_rollback(xid)
    }

    fn forget(&self, xid: &Xid) -> Result<(), XaError> {
        lock(&self.conn).xa_forget(xid)
    }

    fn recover(&self, flags: XaFlags) -> Result<Vec<Xid>, XaError> {
        lock(&self.conn).xa_recover(flags)
    }

    fn resource_manager_id(&self) -> String {
        self.rm_id.clone()
    }

    fn transaction_timeout(&self) -> Result<u32, XaError> {
        lock(&self.conn).xa_transaction_timeout()
    }

    fn set_transaction_timeout(&self, secs: u32) -> Result<bool, XaError> {
        lock(&self.conn).xa_set_transaction_timeout(secs)
    }
}
