#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Once};

use upool::error::{DbError, XaError};
use upool::models::db_type::DatabaseType;
use upool::transaction::{GlobalTransactionId, SuspendedTransaction, TransactionManager};
use upool::udbc::SqlResult;
use upool::udbc::connection::{Holdability, IsolationLevel, PhysicalConnection, TypeMap};
use upool::udbc::driver::{Driver, DriverConnection};
use upool::udbc::exception::{SqlException, SqlExceptionKind};
use upool::udbc::statement::{Statement, StatementKey};
use upool::udbc::value::ShardingKey;
use upool::udbc::xa::{XaFlags, XaResource, XaVote, Xid};

static TRACING: Once = Once::new();

pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Records every driver call and serves scripted failures.
#[derive(Default)]
pub struct Script {
    calls: Vec<String>,
    fail_next: HashMap<String, Arc<SqlException>>,
    xa_fail_next: HashMap<String, XaError>,
    unsupported: HashSet<String>,
    recover: Vec<Xid>,
    vote: Option<XaVote>,
    connects: usize,
    statements_closed: usize,
}

#[derive(Clone, Default)]
pub struct Recorder(Arc<Mutex<Script>>);

impl Recorder {
    fn with<R>(&self, f: impl FnOnce(&mut Script) -> R) -> R {
        f(&mut self.0.lock().unwrap())
    }

    fn record(&self, call: impl Into<String>) {
        let call = call.into();
        self.with(|s| s.calls.push(call));
    }

    fn check(&self, op: &str) -> SqlResult<()> {
        self.with(|s| {
            if s.unsupported.contains(op) {
                return Err(SqlException::new(format!("{} not supported", op))
                    .sql_state("0A000")
                    .kind(SqlExceptionKind::FeatureNotSupported)
                    .build());
            }
            match s.fail_next.remove(op) {
                Some(e) => Err(e),
                None => Ok(()),
            }
        })
    }

    fn check_xa(&self, op: &str) -> Result<(), XaError> {
        self.with(|s| match s.xa_fail_next.remove(op) {
            Some(e) => Err(e),
            None => Ok(()),
        })
    }

    pub fn calls(&self) -> Vec<String> {
        self.with(|s| s.calls.clone())
    }

    pub fn clear(&self) {
        self.with(|s| s.calls.clear());
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.with(|s| s.calls.iter().filter(|c| c.starts_with(prefix)).count())
    }

    pub fn fail_next(&self, op: &str, e: Arc<SqlException>) {
        self.with(|s| s.fail_next.insert(op.to_string(), e));
    }

    pub fn fail_xa_next(&self, op: &str, e: XaError) {
        self.with(|s| s.xa_fail_next.insert(op.to_string(), e));
    }

    pub fn unsupported(&self, op: &str) {
        self.with(|s| s.unsupported.insert(op.to_string()));
    }

    pub fn set_recover(&self, xids: Vec<Xid>) {
        self.with(|s| s.recover = xids);
    }

    pub fn set_vote(&self, vote: XaVote) {
        self.with(|s| s.vote = Some(vote));
    }

    pub fn connects(&self) -> usize {
        self.with(|s| s.connects)
    }

    pub fn statements_closed(&self) -> usize {
        self.with(|s| s.statements_closed)
    }
}

/// Driver defaults every mock connection starts with.
#[derive(Clone)]
pub struct MockDefaults {
    pub auto_commit: bool,
    pub isolation: IsolationLevel,
    pub catalog: Option<String>,
    pub schema: Option<String>,
}

impl Default for MockDefaults {
    fn default() -> Self {
        Self {
            auto_commit: true,
            isolation: IsolationLevel::ReadCommitted,
            catalog: Some("SALES".to_string()),
            schema: Some("APP".to_string()),
        }
    }
}

pub struct MockDriver {
    pub recorder: Recorder,
    pub defaults: MockDefaults,
    pub database_type: DatabaseType,
    pub xa: bool,
}

impl MockDriver {
    pub fn new(recorder: Recorder) -> Self {
        Self {
            recorder,
            defaults: MockDefaults::default(),
            database_type: DatabaseType::Generic,
            xa: true,
        }
    }

    pub fn database_type(mut self, db: DatabaseType) -> Self {
        self.database_type = db;
        self
    }

    pub fn without_xa(mut self) -> Self {
        self.xa = false;
        self
    }
}

impl Driver for MockDriver {
    fn name(&self) -> &str {
        "mock"
    }

    fn database_type(&self) -> DatabaseType {
        self.database_type
    }

    fn connect(&self, user: Option<&str>, _password: Option<&str>) -> Result<DriverConnection, DbError> {
        self.recorder.record(format!("connect({})", user.unwrap_or("-")));
        self.recorder.check("connect")?;
        self.recorder.with(|s| s.connects += 1);
        let connection = MockConnection {
            recorder: self.recorder.clone(),
            auto_commit: self.defaults.auto_commit,
            isolation: self.defaults.isolation,
            catalog: self.defaults.catalog.clone(),
            schema: self.defaults.schema.clone(),
            read_only: false,
            type_map: TypeMap::new(),
            holdability: Holdability::HoldCursorsOverCommit,
            network_timeout: 0,
        };
        let xa: Option<Arc<dyn XaResource>> = if self.xa {
            Some(Arc::new(MockXa {
                recorder: self.recorder.clone(),
            }))
        } else {
            None
        };
        Ok(DriverConnection {
            connection: Box::new(connection),
            xa,
        })
    }
}

pub struct MockConnection {
    recorder: Recorder,
    auto_commit: bool,
    isolation: IsolationLevel,
    catalog: Option<String>,
    schema: Option<String>,
    read_only: bool,
    type_map: TypeMap,
    holdability: Holdability,
    network_timeout: u32,
}

impl PhysicalConnection for MockConnection {
    fn auto_commit(&self) -> SqlResult<bool> {
        self.recorder.check("getAutoCommit")?;
        Ok(self.auto_commit)
    }

    fn set_auto_commit(&mut self, on: bool) -> SqlResult<()> {
        self.recorder.record(format!("setAutoCommit({})", on));
        self.recorder.check("setAutoCommit")?;
        self.auto_commit = on;
        Ok(())
    }

    fn isolation(&self) -> SqlResult<IsolationLevel> {
        Ok(self.isolation)
    }

    fn set_isolation(&mut self, level: IsolationLevel) -> SqlResult<()> {
        self.recorder.record(format!("setIsolation({:?})", level));
        self.recorder.check("setIsolation")?;
        self.isolation = level;
        Ok(())
    }

    fn catalog(&self) -> SqlResult<Option<String>> {
        Ok(self.catalog.clone())
    }

    fn set_catalog(&mut self, catalog: &str) -> SqlResult<()> {
        self.recorder.record(format!("setCatalog({})", catalog));
        self.recorder.check("setCatalog")?;
        self.catalog = Some(catalog.to_string());
        Ok(())
    }

    fn schema(&self) -> SqlResult<Option<String>> {
        self.recorder.check("getSchema")?;
        Ok(self.schema.clone())
    }

    fn set_schema(&mut self, schema: &str) -> SqlResult<()> {
        self.recorder.record(format!("setSchema({})", schema));
        self.recorder.check("setSchema")?;
        self.schema = Some(schema.to_string());
        Ok(())
    }

    fn read_only(&self) -> SqlResult<bool> {
        Ok(self.read_only)
    }

    fn set_read_only(&mut self, read_only: bool) -> SqlResult<()> {
        self.recorder.record(format!("setReadOnly({})", read_only));
        self.recorder.check("setReadOnly")?;
        self.read_only = read_only;
        Ok(())
    }

    fn type_map(&self) -> SqlResult<TypeMap> {
        Ok(self.type_map.clone())
    }

    fn set_type_map(&mut self, map: &TypeMap) -> SqlResult<()> {
        self.recorder.record("setTypeMap");
        self.recorder.check("setTypeMap")?;
        self.type_map = map.clone();
        Ok(())
    }

    fn holdability(&self) -> SqlResult<Holdability> {
        self.recorder.check("getHoldability")?;
        Ok(self.holdability)
    }

    fn set_holdability(&mut self, h: Holdability) -> SqlResult<()> {
        self.recorder.record(format!("setHoldability({:?})", h));
        self.recorder.check("setHoldability")?;
        self.holdability = h;
        Ok(())
    }

    fn set_sharding_keys(
        &mut self,
        key: Option<&ShardingKey>,
        super_key: Option<&ShardingKey>,
    ) -> SqlResult<()> {
        self.recorder.record(format!(
            "setShardingKeys({},{})",
            key.is_some(),
            super_key.is_some()
        ));
        self.recorder.check("setShardingKeys")
    }

    fn network_timeout(&self) -> SqlResult<u32> {
        self.recorder.check("getNetworkTimeout")?;
        Ok(self.network_timeout)
    }

    fn set_network_timeout(&mut self, millis: u32) -> SqlResult<()> {
        self.recorder.record(format!("setNetworkTimeout({})", millis));
        self.recorder.check("setNetworkTimeout")?;
        self.network_timeout = millis;
        Ok(())
    }

    fn prepare_statement(&mut self, key: &StatementKey) -> SqlResult<Box<dyn Statement>> {
        self.recorder.record(format!("prepare({})", key.sql));
        self.recorder.check("prepare")?;
        Ok(Box::new(MockStatement {
            recorder: self.recorder.clone(),
            closed: false,
        }))
    }

    fn commit(&mut self) -> SqlResult<()> {
        self.recorder.record("commit");
        self.recorder.check("commit")
    }

    fn rollback(&mut self) -> SqlResult<()> {
        self.recorder.record("rollback");
        self.recorder.check("rollback")
    }

    fn is_valid(&mut self, timeout_secs: u32) -> SqlResult<bool> {
        self.recorder.record(format!("isValid({})", timeout_secs));
        self.recorder.check("isValid")?;
        Ok(true)
    }

    fn close(&mut self) -> SqlResult<()> {
        self.recorder.record("close");
        Ok(())
    }
}

pub struct MockStatement {
    recorder: Recorder,
    closed: bool,
}

impl Statement for MockStatement {
    fn close(&mut self) -> SqlResult<()> {
        if !self.closed {
            self.closed = true;
            self.recorder.with(|s| s.statements_closed += 1);
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

pub struct MockXa {
    recorder: Recorder,
}

impl XaResource for MockXa {
    fn start(&self, xid: &Xid, _flags: XaFlags) -> Result<(), XaError> {
        self.recorder.record(format!("xa.start({})", xid));
        self.recorder.check_xa("start")
    }

    fn end(&self, xid: &Xid, flags: XaFlags) -> Result<(), XaError> {
        let fail = if flags.contains(XaFlags::FAIL) { ",FAIL" } else { "" };
        self.recorder.record(format!("xa.end({}{})", xid, fail));
        self.recorder.check_xa("end")
    }

    fn prepare(&self, xid: &Xid) -> Result<XaVote, XaError> {
        self.recorder.record(format!("xa.prepare({})", xid));
        self.recorder.check_xa("prepare")?;
        Ok(self.recorder.with(|s| s.vote.unwrap_or(XaVote::Ok)))
    }

    fn commit(&self, xid: &Xid, one_phase: bool) -> Result<(), XaError> {
        self.recorder.record(format!("xa.commit({},{})", xid, one_phase));
        self.recorder.check_xa("commit")
    }

    fn rollback(&self, xid: &Xid) -> Result<(), XaError> {
        self.recorder.record(format!("xa.rollback({})", xid));
        self.recorder.check_xa("rollback")
    }

    fn forget(&self, xid: &Xid) -> Result<(), XaError> {
        self.recorder.record(format!("xa.forget({})", xid));
        self.recorder.check_xa("forget")
    }

    fn recover(&self, _flags: XaFlags) -> Result<Vec<Xid>, XaError> {
        self.recorder.record("xa.recover");
        self.recorder.check_xa("recover")?;
        Ok(self.recorder.with(|s| s.recover.clone()))
    }

    fn resource_manager_id(&self) -> String {
        "mock-rm".to_string()
    }

    fn transaction_timeout(&self) -> Result<u32, XaError> {
        Ok(0)
    }

    fn set_transaction_timeout(&self, _secs: u32) -> Result<bool, XaError> {
        Ok(true)
    }
}

/// Transaction manager that only records what the pool asks of it.
#[derive(Default)]
pub struct MockTm {
    pub current: Mutex<Option<String>>,
    pub log: Mutex<Vec<String>>,
}

impl MockTm {
    pub fn begin(&self, id: &str) {
        *self.current.lock().unwrap() = Some(id.to_string());
    }

    pub fn finish(&self) {
        *self.current.lock().unwrap() = None;
    }

    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }
}

impl TransactionManager for MockTm {
    fn current_global_transaction(&self) -> Option<GlobalTransactionId> {
        self.current
            .lock()
            .unwrap()
            .clone()
            .map(GlobalTransactionId)
    }

    fn suspend(&self) -> Option<SuspendedTransaction> {
        let id = self.current.lock().unwrap().take()?;
        self.log.lock().unwrap().push(format!("suspend {}", id));
        Some(SuspendedTransaction {
            id: GlobalTransactionId(id),
        })
    }

    fn resume(&self, tx: SuspendedTransaction) {
        self.log.lock().unwrap().push(format!("resume {}", tx.id.0));
        *self.current.lock().unwrap() = Some(tx.id.0);
    }

    fn enlist_lazily(&self, connection_id: u64) -> Result<(), DbError> {
        self.log
            .lock()
            .unwrap()
            .push(format!("enlist {}", connection_id));
        Ok(())
    }
}

pub fn xid(n: u8) -> Xid {
    Xid::new(0x1234, vec![n; 4], vec![1])
}

pub fn stale_exception() -> Arc<SqlException> {
    SqlException::new("connection reset by peer")
        .sql_state("08006")
        .build()
}
