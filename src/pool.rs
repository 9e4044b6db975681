use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::classifier::ExceptionClassifier;
use crate::descriptor::ConnectionRequestInfo;
use crate::error::DbError;
use crate::managed::events::{ConnectionEvent, ConnectionEventListener};
use crate::managed::handle::ConnectionHandle;
use crate::managed::xa::{FailoverTracker, ManagedXaResource};
use crate::managed::{ConnectionContext, ConnectionDump, ManagedConnection, SharedConnection, lock};
use crate::matching::{self, MatchOutcome};
use crate::models::db_config::{ConfigCell, PoolConfig};
use crate::transaction::TransactionManager;
use crate::udbc::driver::Driver;
use crate::vendor::{VENDORS, VendorCapabilities};

type IdleBuckets = HashMap<u64, Vec<SharedConnection>>;

/// Read-only snapshot of a pool for operational tooling.
#[derive(Debug, Clone, Serialize)]
pub struct PoolDump {
    pub name: String,
    pub taken_at: DateTime<Utc>,
    pub database_type: String,
    pub idle: usize,
    pub in_use: usize,
    pub fatal_errors: u64,
    pub connections: Vec<ConnectionDump>,
}

pub(crate) struct PoolInner {
    driver: Arc<dyn Driver>,
    config: ConfigCell,
    classifier: RwLock<Arc<ExceptionClassifier>>,
    vendor: Arc<VendorCapabilities>,
    tm: Option<Arc<dyn TransactionManager>>,
    // never lock a managed connection while holding this lock
    idle: Mutex<IdleBuckets>,
    in_use: DashMap<u64, SharedConnection>,
    fatal_errors: AtomicU64,
    failover: Arc<FailoverTracker>,
    next_id: AtomicU64,
}

impl PoolInner {
    fn idle(&self) -> MutexGuard<'_, IdleBuckets> {
        self.idle.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn classifier(&self) -> Arc<ExceptionClassifier> {
        self.classifier
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn park(&self, descriptor_hash: u64, conn: SharedConnection) {
        self.idle().entry(descriptor_hash).or_default().push(conn);
    }

    fn remove_idle(&self, connection_id: u64, conn: Option<&SharedConnection>) {
        let Some(conn) = conn else {
            return;
        };
        for bucket in self.idle().values_mut() {
            bucket.retain(|c| !Arc::ptr_eq(c, conn));
        }
        debug!(connection_id, "connection removed from idle list");
    }
}

/// Receives events from every connection of the pool. Runs with the
/// connection locked, so it only touches pool-side structures.
struct PoolListener {
    pool: Weak<PoolInner>,
}

impl ConnectionEventListener for PoolListener {
    fn connection_event(&self, event: &ConnectionEvent) {
        let Some(pool) = self.pool.upgrade() else {
            return;
        };
        match event {
            ConnectionEvent::ConnectionReleasable {
                connection_id,
                descriptor_hash,
                fatal_error_snapshot,
                stale,
            } => {
                let Some((_, conn)) = pool.in_use.remove(connection_id) else {
                    return;
                };
                let fatal = pool.fatal_errors.load(Ordering::Acquire);
                if *stale || *fatal_error_snapshot < fatal {
                    // the last reference going away destroys it
                    info!(connection_id, "discarding released connection");
                    return;
                }
                pool.park(*descriptor_hash, conn);
                debug!(connection_id, "connection returned to pool");
            }
            ConnectionEvent::ConnectionErrorOccurred {
                connection_id,
                category,
                ..
            } => {
                pool.fatal_errors.fetch_add(1, Ordering::AcqRel);
                let removed = pool.in_use.remove(connection_id).map(|(_, c)| c);
                pool.remove_idle(*connection_id, removed.as_ref());
                warn!(connection_id, category = ?category, "fatal connection error, older connections will be purged");
            }
            ConnectionEvent::SingleConnectionErrorOccurred { connection_id, .. } => {
                let removed = pool.in_use.remove(connection_id).map(|(_, c)| c);
                pool.remove_idle(*connection_id, removed.as_ref());
                warn!(connection_id, "connection purged after authorization failure");
            }
            _ => {}
        }
    }
}

/// 托管连接池
/// Pool of managed connections for one data source.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
    listener: Arc<dyn ConnectionEventListener>,
}

impl ConnectionPool {
    pub fn new(
        driver: Arc<dyn Driver>,
        config: PoolConfig,
        tm: Option<Arc<dyn TransactionManager>>,
    ) -> Result<Self, DbError> {
        let vendor = Arc::new(VENDORS.resolve(&config, driver.database_type())?);
        let classifier = Arc::new(ExceptionClassifier::new(
            &config.identify_exceptions,
            vendor.clone(),
        ));
        info!(
            pool = %config.name,
            driver = driver.name(),
            database = vendor.database_type.as_str(),
            "connection pool created"
        );
        let inner = Arc::new(PoolInner {
            driver,
            config: ConfigCell::new(config),
            classifier: RwLock::new(classifier),
            vendor,
            tm,
            idle: Mutex::new(HashMap::new()),
            in_use: DashMap::new(),
            fatal_errors: AtomicU64::new(0),
            failover: Arc::new(FailoverTracker::new()),
            next_id: AtomicU64::new(1),
        });
        let listener: Arc<dyn ConnectionEventListener> = Arc::new(PoolListener {
            pool: Arc::downgrade(&inner),
        });
        Ok(Self { inner, listener })
    }

    pub fn config(&self) -> Arc<PoolConfig> {
        self.inner.config.snapshot()
    }

    pub fn vendor(&self) -> &VendorCapabilities {
        &self.inner.vendor
    }

    pub fn idle_count(&self) -> usize {
        self.inner.idle().values().map(Vec::len).sum()
    }

    pub fn in_use_count(&self) -> usize {
        self.inner.in_use.len()
    }

    pub fn fatal_error_count(&self) -> u64 {
        self.inner.fatal_errors.load(Ordering::Acquire)
    }

    /// A descriptor for this pool, with the pool id filled in.
    pub fn request(&self, user: Option<&str>, password: Option<&str>) -> ConnectionRequestInfo {
        ConnectionRequestInfo::new(user, password, self.config().pool_id)
    }

    /// Hands out a connection for `cri`: an idle match first, then a new
    /// physical connection, then one claimed from another identity.
    pub fn acquire(&self, cri: &ConnectionRequestInfo) -> Result<ConnectionHandle, DbError> {
        if let Some(handle) = self.match_idle(cri)? {
            return Ok(handle);
        }
        let config = self.config();
        if self.idle_count() + self.in_use_count() < config.max_connections {
            return self.open(cri, config);
        }
        if self.claim_victim() {
            return self.open(cri, config);
        }
        Err(DbError::Connection(format!(
            "pool {} exhausted ({} connections)",
            config.name, config.max_connections
        )))
    }

    /// Looks for an idle connection that serves `cri`, reconfiguring one
    /// of the same identity when no exact match exists.
    pub fn match_idle(
        &self,
        cri: &ConnectionRequestInfo,
    ) -> Result<Option<ConnectionHandle>, DbError> {
        let key = cri.descriptor_hash();
        let Some(mut bucket) = self.inner.idle().remove(&key) else {
            return Ok(None);
        };
        let fatal = self.fatal_error_count();

        let outcome = {
            let guards: Vec<_> = bucket.iter().map(lock).collect();
            matching::select(guards.iter().map(|g| &**g), cri, fatal)
        };
        let chosen = outcome.index().map(|i| bucket.swap_remove(i));
        // drop what can never be handed out again
        bucket.retain(|c| {
            let mc = lock(c);
            !mc.is_stale() && !mc.is_destroyed() && mc.fatal_error_snapshot() >= fatal
        });
        if !bucket.is_empty() {
            self.inner.idle().entry(key).or_default().append(&mut bucket);
        }

        let Some(conn) = chosen else {
            debug!(pool = %self.config().name, "no reusable idle connection");
            return Ok(None);
        };
        let issued = {
            let mut mc = lock(&conn);
            let prepared = match outcome {
                MatchOutcome::Reconfigure(_) => mc.reconfigure(cri),
                _ if mc.config().isolation_level_switching_support => {
                    let level = cri
                        .isolation()
                        .or(mc.config().isolation_level)
                        .or(mc.defaults().isolation);
                    match level {
                        Some(level) => mc.switch_isolation(level),
                        None => Ok(()),
                    }
                }
                _ => Ok(()),
            };
            prepared.and_then(|_| mc.issue_handle()).map(|h| (h, mc.id()))
        };
        match issued {
            Ok((handle_id, connection_id)) => {
                self.inner.in_use.insert(connection_id, conn.clone());
                debug!(
                    connection_id,
                    reconfigured = matches!(outcome, MatchOutcome::Reconfigure(_)),
                    "idle connection reused"
                );
                Ok(Some(ConnectionHandle::new(handle_id, connection_id, conn)))
            }
            Err(e) => {
                warn!(error = %e, "idle connection could not be prepared, discarding");
                lock(&conn).mark_stale();
                Ok(None)
            }
        }
    }

    fn open(
        &self,
        cri: &ConnectionRequestInfo,
        config: Arc<PoolConfig>,
    ) -> Result<ConnectionHandle, DbError> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let driver_conn = self.inner.driver.connect(cri.user(), cri.password())?;
        let ctx = ConnectionContext {
            config,
            classifier: self.inner.classifier(),
            transaction_manager: self.inner.tm.clone(),
            failover: self.inner.failover.clone(),
            fatal_error_snapshot: self.fatal_error_count(),
        };
        let mut mc = ManagedConnection::new(id, driver_conn, cri, ctx)?;
        mc.add_listener(self.listener.clone());
        let handle_id = mc.issue_handle()?;
        let conn: SharedConnection = Arc::new(Mutex::new(mc));
        self.inner.in_use.insert(id, conn.clone());
        Ok(ConnectionHandle::new(handle_id, id, conn))
    }

    /// Frees a slot by destroying an idle connection of another identity.
    fn claim_victim(&self) -> bool {
        let victim = {
            let mut idle = self.inner.idle();
            let key = idle.iter().find(|(_, b)| !b.is_empty()).map(|(k, _)| *k);
            key.and_then(|k| {
                let bucket = idle.get_mut(&k)?;
                let v = bucket.pop();
                if bucket.is_empty() {
                    idle.remove(&k);
                }
                v
            })
        };
        let Some(conn) = victim else {
            return false;
        };
        let mut mc = lock(&conn);
        mc.claim_as_victim();
        info!(connection_id = mc.id(), "idle connection claimed for a new identity");
        mc.destroy();
        true
    }

    /// Hands a connection back. Equivalent to closing the handle.
    pub fn release(&self, handle: ConnectionHandle) -> Result<(), DbError> {
        handle.close()
    }

    /// Validates an idle or in-use connection by id.
    pub fn validate(&self, connection_id: u64) -> Result<bool, DbError> {
        let conn = self.find(connection_id);
        match conn {
            Some(c) => lock(&c).validate(),
            None => Ok(false),
        }
    }

    fn find(&self, connection_id: u64) -> Option<SharedConnection> {
        if let Some(c) = self.inner.in_use.get(&connection_id).map(|r| r.value().clone()) {
            return Some(c);
        }
        self.idle_connections()
            .into_iter()
            .find(|c| lock(c).id() == connection_id)
    }

    fn idle_connections(&self) -> Vec<SharedConnection> {
        self.inner.idle().values().flatten().cloned().collect()
    }

    fn in_use_connections(&self) -> Vec<SharedConnection> {
        self.inner.in_use.iter().map(|r| r.value().clone()).collect()
    }

    /// Administrative purge: idle connections are destroyed now, in-use
    /// ones are marked stale and discarded when handed back.
    pub fn purge(&self) {
        self.inner.fatal_errors.fetch_add(1, Ordering::AcqRel);
        let idle: Vec<SharedConnection> = {
            let mut buckets = self.inner.idle();
            buckets.drain().flat_map(|(_, b)| b).collect()
        };
        let count = idle.len();
        for conn in idle {
            lock(&conn).destroy();
        }
        for conn in self.in_use_connections() {
            lock(&conn).mark_stale();
        }
        info!(pool = %self.config().name, destroyed = count, "pool purged");
    }

    /// Installs a new configuration. Every connection picks it up; the
    /// statement caches are resized in place.
    pub fn update_config(&self, config: PoolConfig) -> Result<(), DbError> {
        let vendor = Arc::new(VENDORS.resolve(&config, self.inner.driver.database_type())?);
        let classifier = Arc::new(ExceptionClassifier::new(&config.identify_exceptions, vendor));
        self.inner.config.swap(config);
        *self
            .inner
            .classifier
            .write()
            .unwrap_or_else(|e| e.into_inner()) = classifier.clone();
        let snapshot = self.config();
        let mut all = self.idle_connections();
        all.extend(self.in_use_connections());
        for conn in all {
            lock(&conn).apply_config(snapshot.clone(), classifier.clone());
        }
        info!(pool = %snapshot.name, "configuration updated");
        Ok(())
    }

    /// The two-phase-commit resource for the connection behind `handle`.
    pub fn xa_resource(&self, handle: &ConnectionHandle) -> ManagedXaResource {
        ManagedXaResource::new(handle.connection().clone())
    }

    pub fn dump(&self) -> PoolDump {
        let idle = self.idle_connections();
        let in_use = self.in_use_connections();
        let connections = idle
            .iter()
            .chain(in_use.iter())
            .map(|c| lock(c).dump())
            .collect();
        PoolDump {
            name: self.config().name.clone(),
            taken_at: Utc::now(),
            database_type: self.inner.vendor.database_type.as_str().to_string(),
            idle: idle.len(),
            in_use: in_use.len(),
            fatal_errors: self.fatal_error_count(),
            connections,
        }
    }
}
