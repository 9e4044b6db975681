use std::sync::Arc;
use std::thread::{self, ThreadId};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::classifier::{ErrorCategory, ExceptionClassifier};
use crate::descriptor::{ConnectionRequestInfo, DriverDefaults};
use crate::error::{DbError, XaErrorCode};
use crate::managed::events::{ConnectionEvent, ConnectionEventListener};
use crate::managed::state::{StateManager, TransactionState, Transition};
use crate::managed::xa::{BranchState, FailoverTracker};
use crate::models::db_config::{CleanupPolicy, PoolConfig};
use crate::statement_cache::StatementCache;
use crate::transaction::{SuspendGuard, TransactionManager};
use crate::udbc::SqlResult;
use crate::udbc::connection::{Holdability, IsolationLevel, PhysicalConnection, TypeMap};
use crate::udbc::driver::DriverConnection;
use crate::udbc::exception::SqlException;
use crate::udbc::statement::{Statement, StatementKey};
use crate::udbc::value::ShardingKey;
use crate::udbc::xa::XaResource;

const INITIAL_HANDLE_SLOTS: usize = 4;

/// Property values currently in effect on the physical connection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionProperties {
    pub auto_commit: bool,
    pub isolation: IsolationLevel,
    pub catalog: Option<String>,
    pub schema: Option<String>,
    pub read_only: bool,
    pub type_map: TypeMap,
    /// `None` when the driver does not support holdability.
    pub holdability: Option<Holdability>,
    pub sharding_key: Option<ShardingKey>,
    pub super_sharding_key: Option<ShardingKey>,
    pub network_timeout: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub(crate) struct HandleState {
    pub(crate) id: u64,
    pub(crate) auto_commit: bool,
}

/// Collaborators shared by every connection of one pool.
#[derive(Clone)]
pub struct ConnectionContext {
    pub config: Arc<PoolConfig>,
    pub classifier: Arc<ExceptionClassifier>,
    pub transaction_manager: Option<Arc<dyn TransactionManager>>,
    pub failover: Arc<FailoverTracker>,
    pub fatal_error_snapshot: u64,
}

/// Read-only diagnostic snapshot of a managed connection.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionDump {
    pub id: u64,
    pub created_at: DateTime<Utc>,
    pub state: TransactionState,
    pub properties: ConnectionProperties,
    pub defaults: DriverDefaults,
    pub requested: ConnectionRequestInfo,
    pub handles: Vec<u64>,
    pub cached_statements: usize,
    pub statement_cache_capacity: usize,
    pub bound_xid: Option<String>,
    pub heuristic: Option<(String, XaErrorCode)>,
    pub lazily_enlisted: bool,
    pub claimed_victim: bool,
    pub stale: bool,
    pub aborted: bool,
    pub destroyed: bool,
    pub fatal_error_snapshot: u64,
    pub multithreaded_access_violations: u64,
}

fn or_unsupported<T>(
    classifier: &ExceptionClassifier,
    r: SqlResult<T>,
    fallback: T,
) -> Result<T, DbError> {
    match r {
        Ok(v) => Ok(v),
        Err(e) if classifier.is_unsupported(&e) => Ok(fallback),
        Err(e) => Err(DbError::Driver(e)),
    }
}

/// A pooled, transaction-aware wrapper around one physical connection.
pub struct ManagedConnection {
    id: u64,
    created_at: DateTime<Utc>,
    physical: Option<Box<dyn PhysicalConnection>>,
    pub(crate) driver_xa: Option<Arc<dyn XaResource>>,
    pub(crate) config: Arc<PoolConfig>,
    pub(crate) classifier: Arc<ExceptionClassifier>,
    tm: Option<Arc<dyn TransactionManager>>,
    pub(crate) failover: Arc<FailoverTracker>,
    pub(crate) state: StateManager,
    pub(crate) props: ConnectionProperties,
    defaults: DriverDefaults,
    initial_auto_commit: bool,
    requested: Arc<ConnectionRequestInfo>,
    cache: Option<StatementCache>,
    fatal_error_snapshot: u64,
    pub(crate) handles: Vec<HandleState>,
    next_handle_id: u64,
    listeners: Vec<Arc<dyn ConnectionEventListener>>,
    claimed_victim: bool,
    stale: bool,
    pub(crate) aborted: bool,
    connection_error_fired: bool,
    lazily_enlisted: bool,
    scoped_local: bool,
    owner_thread: Option<ThreadId>,
    multithread_violations: u64,
    pub(crate) branch: Option<BranchState>,
    destroyed: bool,
}

impl ManagedConnection {
    /// Wraps a freshly opened physical connection, reads the driver
    /// defaults and applies the requested properties.
    pub fn new(
        id: u64,
        driver_conn: DriverConnection,
        requested: &ConnectionRequestInfo,
        ctx: ConnectionContext,
    ) -> Result<Self, DbError> {
        let DriverConnection {
            connection: physical,
            xa,
        } = driver_conn;
        let classifier = &ctx.classifier;
        let auto_commit = physical.auto_commit()?;
        let isolation = physical.isolation()?;
        let catalog = or_unsupported(classifier, physical.catalog(), None)?;
        let schema = or_unsupported(classifier, physical.schema(), None)?;
        let read_only = or_unsupported(classifier, physical.read_only(), false)?;
        let type_map = or_unsupported(classifier, physical.type_map(), TypeMap::new())?;
        let holdability = or_unsupported(classifier, physical.holdability().map(Some), None)?;
        let network_timeout = or_unsupported(classifier, physical.network_timeout(), 0)?;

        let defaults = DriverDefaults {
            isolation: Some(isolation),
            catalog: catalog.clone(),
            schema: schema.clone(),
            read_only: Some(read_only),
            type_map: Some(type_map.clone()),
            holdability,
            network_timeout,
        };

        let mut mc = Self {
            id,
            created_at: Utc::now(),
            physical: Some(physical),
            driver_xa: xa,
            cache: StatementCache::new(ctx.config.statement_cache_size),
            config: ctx.config,
            classifier: ctx.classifier,
            tm: ctx.transaction_manager,
            failover: ctx.failover,
            state: StateManager::new(),
            props: ConnectionProperties {
                auto_commit,
                isolation,
                catalog,
                schema,
                read_only,
                type_map,
                holdability,
                sharding_key: None,
                super_sharding_key: None,
                network_timeout,
            },
            requested: Arc::new(requested.with_defaults(defaults.clone()).frozen()),
            defaults,
            initial_auto_commit: auto_commit,
            fatal_error_snapshot: ctx.fatal_error_snapshot,
            handles: Vec::with_capacity(INITIAL_HANDLE_SLOTS),
            next_handle_id: 1,
            listeners: Vec::new(),
            claimed_victim: false,
            stale: false,
            aborted: false,
            connection_error_fired: false,
            lazily_enlisted: false,
            scoped_local: false,
            owner_thread: None,
            multithread_violations: 0,
            branch: None,
            destroyed: false,
        };
        mc.apply_properties(requested)?;
        info!(connection_id = id, "managed connection created");
        Ok(mc)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> TransactionState {
        self.state.state()
    }

    pub fn properties(&self) -> &ConnectionProperties {
        &self.props
    }

    pub fn defaults(&self) -> &DriverDefaults {
        &self.defaults
    }

    pub fn requested(&self) -> &Arc<ConnectionRequestInfo> {
        &self.requested
    }

    pub fn handle_count(&self) -> usize {
        self.handles.len()
    }

    pub fn is_stale(&self) -> bool {
        self.stale
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    pub fn is_claimed_victim(&self) -> bool {
        self.claimed_victim
    }

    pub fn fatal_error_snapshot(&self) -> u64 {
        self.fatal_error_snapshot
    }

    pub fn multithreaded_access_violations(&self) -> u64 {
        self.multithread_violations
    }

    pub fn cached_statement_count(&self) -> usize {
        self.cache.as_ref().map_or(0, |c| c.len())
    }

    pub fn config(&self) -> &Arc<PoolConfig> {
        &self.config
    }

    /// Listener registration happens while the connection is not shared.
    pub fn add_listener(&mut self, listener: Arc<dyn ConnectionEventListener>) {
        self.listeners.push(listener);
    }

    pub fn remove_listener(&mut self, listener: &Arc<dyn ConnectionEventListener>) {
        self.listeners.retain(|l| !Arc::ptr_eq(l, listener));
    }

    pub(crate) fn fire(&self, event: ConnectionEvent) {
        for l in &self.listeners {
            l.connection_event(&event);
        }
    }

    pub(crate) fn physical(&mut self) -> Result<&mut Box<dyn PhysicalConnection>, DbError> {
        self.physical.as_mut().ok_or(DbError::Destroyed(self.id))
    }

    /// Marks the connection stale without a driver error, as done by an
    /// administrative purge.
    pub fn mark_stale(&mut self) {
        self.stale = true;
    }

    /// Flags a connection taken from the pool to be re-authenticated under
    /// another identity. Statements prepared for the old identity go away.
    pub fn claim_as_victim(&mut self) {
        self.claimed_victim = true;
        if let Some(cache) = self.cache.as_mut() {
            cache.clear();
        }
        debug!(connection_id = self.id, "connection claimed as victim");
    }

    /// Classifies a driver failure and raises the matching event.
    pub fn process_sql_error(&mut self, e: Arc<SqlException>) -> DbError {
        let category = self.classifier.classify(&e);
        match category {
            ErrorCategory::StaleConnection => {
                self.fire_connection_error(Some(e.clone()), category);
                DbError::Driver(e)
            }
            ErrorCategory::Authorization => {
                self.fire_single_connection_error(Some(e.clone()));
                DbError::Authorization(e)
            }
            _ => DbError::Driver(e),
        }
    }

    /// Fires the eviction signal, at most once per physical connection.
    pub(crate) fn fire_connection_error(
        &mut self,
        error: Option<Arc<SqlException>>,
        category: ErrorCategory,
    ) {
        self.stale = true;
        self.aborted = true;
        if self.connection_error_fired {
            return;
        }
        self.connection_error_fired = true;
        self.failover.record_stale();
        // no further transactional work is possible on this connection
        let _ = self.state.apply(Transition::Fail);
        error!(connection_id = self.id, category = ?category, "connection error, evicting");
        self.fire(ConnectionEvent::ConnectionErrorOccurred {
            connection_id: self.id,
            category,
            error,
        });
    }

    pub(crate) fn fire_single_connection_error(&mut self, error: Option<Arc<SqlException>>) {
        self.stale = true;
        if self.connection_error_fired {
            return;
        }
        self.connection_error_fired = true;
        warn!(connection_id = self.id, "authorization error, purging connection");
        self.fire(ConnectionEvent::SingleConnectionErrorOccurred {
            connection_id: self.id,
            error,
        });
    }

    fn unsupported_ok(&self, r: SqlResult<()>, what: &str) -> Result<(), DbError> {
        match r {
            Ok(()) => Ok(()),
            Err(e) if self.classifier.is_unsupported(&e) => {
                debug!(
                    connection_id = self.id,
                    property = what,
                    "driver does not support property, ignored"
                );
                Ok(())
            }
            Err(e) => Err(DbError::Driver(e)),
        }
    }

    fn driver_call<T>(&mut self, r: SqlResult<T>) -> Result<T, DbError> {
        r.map_err(|e| self.process_sql_error(e))
    }

    /// Pushes every property in `cri` that differs from what the driver
    /// currently has. Unset properties fall back to the driver default.
    fn apply_properties(&mut self, cri: &ConnectionRequestInfo) -> Result<(), DbError> {
        let target_isolation = cri
            .isolation()
            .or(self.config.isolation_level)
            .or(self.defaults.isolation)
            .unwrap_or(self.props.isolation);
        if target_isolation != self.props.isolation {
            let r = self.physical()?.set_isolation(target_isolation);
            self.driver_call(r)?;
            self.props.isolation = target_isolation;
        }

        let target_catalog = cri
            .catalog()
            .map(str::to_string)
            .or_else(|| self.defaults.catalog.clone());
        if let Some(c) = target_catalog {
            if self.props.catalog.as_deref() != Some(c.as_str()) {
                let r = self.physical()?.set_catalog(&c);
                self.driver_call(r)?;
                self.props.catalog = Some(c);
            }
        }

        let target_schema = cri
            .schema()
            .map(str::to_string)
            .or_else(|| self.defaults.schema.clone());
        if let Some(s) = target_schema {
            if self.props.schema.as_deref() != Some(s.as_str()) {
                let r = self.physical()?.set_schema(&s);
                self.unsupported_ok(r, "schema")?;
                self.props.schema = Some(s);
            }
        }

        let target_read_only = cri
            .read_only()
            .or(self.defaults.read_only)
            .unwrap_or(false);
        if target_read_only != self.props.read_only {
            let r = self.physical()?.set_read_only(target_read_only);
            self.driver_call(r)?;
            self.props.read_only = target_read_only;
        }

        let target_map = cri
            .type_map()
            .cloned()
            .or_else(|| self.defaults.type_map.clone())
            .unwrap_or_default();
        if target_map != self.props.type_map {
            let r = self.physical()?.set_type_map(&target_map);
            self.unsupported_ok(r, "typeMap")?;
            self.props.type_map = target_map;
        }

        if self.props.holdability.is_some() {
            if let Some(h) = cri.holdability().or(self.defaults.holdability) {
                if self.props.holdability != Some(h) {
                    let r = self.physical()?.set_holdability(h);
                    self.unsupported_ok(r, "holdability")?;
                    self.props.holdability = Some(h);
                }
            }
        }

        if cri.sharding_key() != self.props.sharding_key.as_ref()
            || cri.super_sharding_key() != self.props.super_sharding_key.as_ref()
        {
            let key = cri.sharding_key().cloned();
            let super_key = cri.super_sharding_key().cloned();
            let r = self
                .physical()?
                .set_sharding_keys(key.as_ref(), super_key.as_ref());
            self.driver_call(r)?;
            self.props.sharding_key = key;
            self.props.super_sharding_key = super_key;
        }

        let target_timeout = match cri.network_timeout() {
            0 => self.defaults.network_timeout,
            t => t,
        };
        if target_timeout != self.props.network_timeout {
            let r = self.physical()?.set_network_timeout(target_timeout);
            self.unsupported_ok(r, "networkTimeout")?;
            self.props.network_timeout = target_timeout;
        }
        Ok(())
    }

    /// Whether this connection serves `cri` without any driver call.
    pub fn matches(&self, cri: &ConnectionRequestInfo) -> bool {
        self.requested
            .matches(cri, self.config.isolation_level_switching_support)
    }

    /// Switches this connection over to `cri`. Refused while handles are
    /// active, since properties must not change under a live handle.
    pub fn reconfigure(&mut self, cri: &ConnectionRequestInfo) -> Result<(), DbError> {
        if self.destroyed {
            return Err(DbError::Destroyed(self.id));
        }
        if self.matches(cri) {
            return Ok(());
        }
        if !self.handles.is_empty() {
            return Err(DbError::HandlesActive(self.handles.len()));
        }
        if !self.requested.is_reconfigurable(cri) {
            return Err(DbError::General(format!(
                "connection {} cannot be reconfigured for a different identity",
                self.id
            )));
        }
        let tm = self.tm.clone();
        let _suspended = SuspendGuard::suspend(tm.as_deref());
        self.apply_properties(cri)?;
        self.requested = Arc::new(cri.with_defaults(self.defaults.clone()).frozen());
        debug!(connection_id = self.id, "connection reconfigured for new request");
        Ok(())
    }

    /// Per-request isolation switch for pools that allow it; the requested
    /// descriptor is left alone so bucket matching is unaffected.
    pub fn switch_isolation(&mut self, level: IsolationLevel) -> Result<(), DbError> {
        if level == self.props.isolation {
            return Ok(());
        }
        if self.state().in_transaction() {
            return Err(DbError::InvalidTransactionState {
                state: self.state().name(),
                operation: "setTransactionIsolation",
            });
        }
        let r = self.physical()?.set_isolation(level);
        self.driver_call(r)?;
        self.props.isolation = level;
        Ok(())
    }

    fn detect_multithreaded_access(&mut self) {
        if !self.config.enable_multithreaded_access_detection {
            return;
        }
        let current = thread::current().id();
        match self.owner_thread {
            None => self.owner_thread = Some(current),
            Some(owner) if owner != current => {
                self.multithread_violations += 1;
                warn!(
                    connection_id = self.id,
                    owner = ?owner,
                    current = ?current,
                    "managed connection accessed by more than one thread"
                );
            }
            Some(_) => {}
        }
    }

    /// Associates a new logical handle with this connection.
    pub fn issue_handle(&mut self) -> Result<u64, DbError> {
        if self.destroyed {
            return Err(DbError::Destroyed(self.id));
        }
        if self.stale {
            return Err(DbError::Connection(format!(
                "managed connection {} is stale",
                self.id
            )));
        }
        self.detect_multithreaded_access();
        let id = self.next_handle_id;
        self.next_handle_id += 1;
        self.handles.push(HandleState {
            id,
            auto_commit: self.props.auto_commit,
        });
        Ok(id)
    }

    /// Dissociates a handle. When the last handle goes away outside any
    /// transaction the connection is cleaned up and offered back to the pool.
    pub fn close_handle(&mut self, handle_id: u64) -> Result<(), DbError> {
        let before = self.handles.len();
        self.handles.retain(|h| h.id != handle_id);
        if self.handles.len() == before {
            return Ok(());
        }
        self.fire(ConnectionEvent::ConnectionClosed {
            connection_id: self.id,
            handle_id,
        });
        self.release_if_idle()
    }

    pub(crate) fn release_if_idle(&mut self) -> Result<(), DbError> {
        if !self.handles.is_empty() || self.destroyed {
            return Ok(());
        }
        // a local transaction nobody scopes any more is resolved by cleanup
        let pending_local =
            self.state() == TransactionState::LocalTransactionActive && !self.scoped_local;
        if self.state().in_transaction() && !pending_local {
            return Ok(());
        }
        let cleaned = if self.stale { Ok(()) } else { self.cleanup() };
        if let Err(e) = &cleaned {
            warn!(connection_id = self.id, error = %e, "cleanup failed, connection will be discarded");
            self.stale = true;
        }
        self.fire(ConnectionEvent::ConnectionReleasable {
            connection_id: self.id,
            descriptor_hash: self.requested.descriptor_hash(),
            fatal_error_snapshot: self.fatal_error_snapshot,
            stale: self.stale,
        });
        cleaned
    }

    /// Prepares the connection for reuse: resolves pending local work per
    /// the cleanup policy and restores auto-commit.
    pub fn cleanup(&mut self) -> Result<(), DbError> {
        if self.destroyed {
            return Ok(());
        }
        let policy = self.config.cleanup_policy();
        if self.state() == TransactionState::LocalTransactionActive {
            self.finish_local(policy == CleanupPolicy::Commit)?;
            self.lazily_enlisted = false;
        } else if !self.props.auto_commit && !self.state().in_transaction() {
            let r = match policy {
                CleanupPolicy::Commit => self.physical()?.commit(),
                CleanupPolicy::Rollback => self.physical()?.rollback(),
            };
            self.unsupported_ok(r, "cleanup")?;
        }
        if self.props.auto_commit != self.initial_auto_commit && !self.state().in_transaction() {
            let on = self.initial_auto_commit;
            let r = self.physical()?.set_auto_commit(on);
            self.driver_call(r)?;
            self.props.auto_commit = on;
        }
        self.handles.clear();
        self.owner_thread = None;
        Ok(())
    }

    /// Closes the statement cache and the physical connection. Idempotent.
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        if let Some(mut cache) = self.cache.take() {
            cache.clear();
        }
        if let Some(mut physical) = self.physical.take() {
            if let Err(e) = physical.close() {
                warn!(connection_id = self.id, error = %e, "closing physical connection failed");
            }
        }
        self.driver_xa = None;
        self.handles.clear();
        self.listeners.clear();
        self.branch = None;
        info!(connection_id = self.id, "managed connection destroyed");
    }

    /// Checks the physical connection with the driver. Only authorization
    /// failures are raised, anything else reads as invalid.
    pub fn validate(&mut self) -> Result<bool, DbError> {
        if self.destroyed || self.stale {
            return Ok(false);
        }
        let timeout = self.config.validation_timeout_secs;
        let tm = self.tm.clone();
        let result = {
            let _suspended = SuspendGuard::suspend(tm.as_deref());
            self.physical()?.is_valid(timeout)
        };
        match result {
            Ok(valid) => Ok(valid),
            Err(e) => match self.process_sql_error(e) {
                err @ DbError::Authorization(_) => Err(err),
                err => {
                    debug!(connection_id = self.id, error = %err, "validation failed");
                    Ok(false)
                }
            },
        }
    }

    /// The transaction manager to signal for lazy enlistment, when the
    /// connection is used under a global transaction it has not joined yet.
    ///
    /// The manager may start a branch on this connection, so the caller
    /// signals it with the connection unlocked.
    pub fn lazy_enlistment_target(&self) -> Option<Arc<dyn TransactionManager>> {
        if self.lazily_enlisted || self.state() != TransactionState::NoTransaction {
            return None;
        }
        let tm = self.tm.clone()?;
        tm.current_global_transaction().map(|_| tm)
    }

    pub fn mark_lazily_enlisted(&mut self) {
        self.lazily_enlisted = true;
        debug!(connection_id = self.id, "lazy enlistment signalled");
    }

    pub fn is_lazily_enlisted(&self) -> bool {
        self.lazily_enlisted
    }

    /// Called whenever a transaction completes on this connection.
    pub(crate) fn transaction_ended(&mut self) {
        self.lazily_enlisted = false;
        if let Err(e) = self.release_if_idle() {
            warn!(connection_id = self.id, error = %e, "release after transaction end failed");
        }
    }

    fn begin_deferred_local_work(&mut self) -> Result<(), DbError> {
        if self.state() == TransactionState::LocalTransactionActive && self.props.auto_commit {
            let r = self.physical()?.set_auto_commit(false);
            self.driver_call(r)?;
            self.props.auto_commit = false;
        }
        Ok(())
    }

    /// Hands out a statement, from the cache when possible.
    pub fn prepare_statement(&mut self, key: &StatementKey) -> Result<Box<dyn Statement>, DbError> {
        if self.destroyed {
            return Err(DbError::Destroyed(self.id));
        }
        self.detect_multithreaded_access();
        self.begin_deferred_local_work()?;
        let key = self.session_key(key);
        if let Some(stmt) = self.cache.as_mut().and_then(|c| c.get(&key)) {
            return Ok(stmt);
        }
        let r = self.physical()?.prepare_statement(&key);
        self.driver_call(r)
    }

    /// `key` bound to the catalog and schema the session currently resolves
    /// unqualified names against.
    fn session_key(&self, key: &StatementKey) -> StatementKey {
        StatementKey {
            catalog: self.props.catalog.clone(),
            schema: self.props.schema.clone(),
            ..key.clone()
        }
    }

    /// Returns a statement after use; cached when caching is enabled.
    pub fn return_statement(&mut self, key: StatementKey, mut stmt: Box<dyn Statement>) {
        if stmt.is_closed() {
            return;
        }
        let key = self.session_key(&key);
        match self.cache.as_mut() {
            Some(cache) if !self.stale => cache.put(key, stmt),
            _ => {
                if let Err(e) = stmt.close() {
                    debug!(connection_id = self.id, error = %e, "closing uncached statement failed");
                }
            }
        }
    }

    /// Handles a failure raised while executing `key`.
    pub fn statement_failed(&mut self, key: &StatementKey, e: Arc<SqlException>) -> DbError {
        if self.classifier.is_stale_statement(&e) {
            let cached = self.session_key(key);
            if let Some(cache) = self.cache.as_mut() {
                cache.remove(&cached);
            }
            debug!(connection_id = self.id, sql = %key.sql, "stale statement evicted from cache");
        }
        self.process_sql_error(e)
    }

    pub fn begin_local(&mut self) -> Result<(), DbError> {
        self.detect_multithreaded_access();
        self.state.apply(Transition::BeginLocal)?;
        self.fire(ConnectionEvent::LocalTransactionStarted {
            connection_id: self.id,
        });
        Ok(())
    }

    /// Begins a local transaction owned by a `TransactionContext`; closing the
    /// last handle leaves it to the context to resolve.
    pub(crate) fn begin_scoped_local(&mut self) -> Result<(), DbError> {
        self.begin_local()?;
        self.scoped_local = true;
        Ok(())
    }

    pub fn commit_local(&mut self) -> Result<(), DbError> {
        self.end_local(true)
    }

    pub fn rollback_local(&mut self) -> Result<(), DbError> {
        self.end_local(false)
    }

    fn end_local(&mut self, commit: bool) -> Result<(), DbError> {
        let result = self.finish_local(commit);
        if !matches!(result, Err(DbError::InvalidTransactionState { .. })) {
            self.transaction_ended();
        }
        result
    }

    /// Ends the local transaction. A failed driver commit or rollback still
    /// leaves the connection outside the transaction, with the error returned.
    fn finish_local(&mut self, commit: bool) -> Result<(), DbError> {
        let transition = if commit {
            Transition::CommitLocal
        } else {
            Transition::RollbackLocal
        };
        self.state.check(transition)?;
        self.scoped_local = false;
        // still in auto-commit means no work was done in the transaction
        if !self.props.auto_commit {
            let r = if commit {
                self.physical()?.commit()
            } else {
                self.physical()?.rollback()
            };
            if let Err(e) = r {
                let err = self.process_sql_error(e);
                self.abandon_local(commit);
                return Err(err);
            }
        }
        let restored = self.restore_auto_commit();
        if let Err(e) = &restored {
            warn!(connection_id = self.id, error = %e, "restoring auto-commit failed, connection will be discarded");
            self.stale = true;
        }
        if self.state() == TransactionState::LocalTransactionActive {
            self.state.apply(transition)?;
            self.fire(if commit {
                ConnectionEvent::LocalTransactionCommitted {
                    connection_id: self.id,
                }
            } else {
                ConnectionEvent::LocalTransactionRolledBack {
                    connection_id: self.id,
                }
            });
        }
        restored
    }

    /// Settles a local transaction whose commit or rollback failed: the work
    /// is rolled back where still possible and the state leaves LOCAL.
    fn abandon_local(&mut self, commit_failed: bool) {
        // a stale connection has already moved to FAILED
        if self.state() != TransactionState::LocalTransactionActive {
            return;
        }
        if commit_failed {
            let r = self
                .physical()
                .and_then(|p| p.rollback().map_err(DbError::Driver));
            if let Err(e) = r {
                warn!(connection_id = self.id, error = %e, "rollback after failed commit failed");
                self.stale = true;
            }
        }
        if let Err(e) = self.restore_auto_commit() {
            warn!(connection_id = self.id, error = %e, "restoring auto-commit failed, connection will be discarded");
            self.stale = true;
        }
        if self.state() != TransactionState::LocalTransactionActive {
            return;
        }
        if let Err(e) = self.state.apply(Transition::RollbackLocal) {
            warn!(connection_id = self.id, error = %e, "abandoning local transaction failed");
            return;
        }
        self.fire(ConnectionEvent::LocalTransactionRolledBack {
            connection_id: self.id,
        });
    }

    fn restore_auto_commit(&mut self) -> Result<(), DbError> {
        if self.initial_auto_commit && !self.props.auto_commit {
            let r = self.physical()?.set_auto_commit(true);
            self.driver_call(r)?;
            self.props.auto_commit = true;
        }
        Ok(())
    }

    pub fn external_begin(&mut self) -> Result<(), DbError> {
        self.state.apply(Transition::ExternalBegin)?;
        debug!(connection_id = self.id, "external transaction started");
        Ok(())
    }

    pub fn external_end(&mut self) -> Result<(), DbError> {
        self.state.apply(Transition::ExternalEnd)?;
        debug!(connection_id = self.id, "external transaction ended");
        self.transaction_ended();
        Ok(())
    }

    pub fn handle_auto_commit(&self, handle_id: u64) -> Option<bool> {
        self.handles
            .iter()
            .find(|h| h.id == handle_id)
            .map(|h| h.auto_commit)
    }

    /// Application-level auto-commit switch through a handle.
    pub fn set_auto_commit(&mut self, handle_id: u64, on: bool) -> Result<(), DbError> {
        self.detect_multithreaded_access();
        let state = self.state();
        if on && state.in_transaction() {
            return Err(DbError::InvalidTransactionState {
                state: state.name(),
                operation: "setAutoCommit(true)",
            });
        }
        if self.props.auto_commit != on {
            let r = self.physical()?.set_auto_commit(on);
            self.driver_call(r)?;
            self.props.auto_commit = on;
        }
        if let Some(h) = self.handles.iter_mut().find(|h| h.id == handle_id) {
            h.auto_commit = on;
        }
        Ok(())
    }

    /// Commit issued by the application outside any managed transaction.
    pub fn commit(&mut self) -> Result<(), DbError> {
        self.application_boundary(true)
    }

    pub fn rollback(&mut self) -> Result<(), DbError> {
        self.application_boundary(false)
    }

    fn application_boundary(&mut self, commit: bool) -> Result<(), DbError> {
        let state = self.state();
        if state != TransactionState::NoTransaction {
            return Err(DbError::InvalidTransactionState {
                state: state.name(),
                operation: if commit { "commit" } else { "rollback" },
            });
        }
        if self.props.auto_commit {
            return Ok(());
        }
        let r = if commit {
            self.physical()?.commit()
        } else {
            self.physical()?.rollback()
        };
        self.driver_call(r)
    }

    /// Picks up a new configuration snapshot; the statement cache is
    /// resized when its capacity changed.
    pub fn apply_config(&mut self, config: Arc<PoolConfig>, classifier: Arc<ExceptionClassifier>) {
        let size = config.statement_cache_size;
        let current = self.cache.as_ref().map_or(0, |c| c.capacity());
        if size != current {
            self.cache = match self.cache.take() {
                Some(cache) => cache.resize(size),
                None => StatementCache::new(size),
            };
            debug!(connection_id = self.id, from = current, to = size, "statement cache resized");
        }
        self.config = config;
        self.classifier = classifier;
    }

    pub fn dump(&self) -> ConnectionDump {
        ConnectionDump {
            id: self.id,
            created_at: self.created_at,
            state: self.state(),
            properties: self.props.clone(),
            defaults: self.defaults.clone(),
            requested: (*self.requested).clone(),
            handles: self.handles.iter().map(|h| h.id).collect(),
            cached_statements: self.cached_statement_count(),
            statement_cache_capacity: self.cache.as_ref().map_or(0, |c| c.capacity()),
            bound_xid: self
                .branch
                .as_ref()
                .and_then(|b| b.xid.as_ref())
                .map(|x| x.to_string()),
            heuristic: self
                .branch
                .as_ref()
                .and_then(|b| b.heuristic.as_ref())
                .map(|(x, c)| (x.to_string(), *c)),
            lazily_enlisted: self.lazily_enlisted,
            claimed_victim: self.claimed_victim,
            stale: self.stale,
            aborted: self.aborted,
            destroyed: self.destroyed,
            fatal_error_snapshot: self.fatal_error_snapshot,
            multithreaded_access_violations: self.multithread_violations,
        }
    }
}

impl Drop for ManagedConnection {
    fn drop(&mut self) {
        self.destroy();
    }
}
