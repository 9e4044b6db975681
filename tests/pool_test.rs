mod common;

use std::sync::Arc;
use std::thread;

use common::{MockDriver, Recorder, init_tracing, stale_exception};
use upool::ConnectionPool;
use upool::error::DbError;
use upool::managed::lock;
use upool::managed::state::TransactionState;
use upool::models::db_config::PoolConfig;
use upool::udbc::connection::IsolationLevel;
use upool::udbc::exception::SqlException;
use upool::udbc::statement::StatementKey;

fn pool_with(recorder: &Recorder, config: PoolConfig) -> ConnectionPool {
    init_tracing();
    ConnectionPool::new(Arc::new(MockDriver::new(recorder.clone())), config, None).unwrap()
}

fn orders() -> PoolConfig {
    PoolConfig::new("orders").pool_id(1)
}

#[test]
fn test_default_catalog_reused_without_driver_calls() {
    let recorder = Recorder::default();
    let pool = pool_with(&recorder, orders());

    let first = pool
        .request(Some("app"), Some("pw"))
        .with_catalog(Some("SALES".into()));
    let h = pool.acquire(&first).unwrap();
    h.close().unwrap();
    assert_eq!(pool.idle_count(), 1);

    recorder.clear();
    let second = pool
        .request(Some("app"), Some("pw"))
        .with_isolation(Some(IsolationLevel::ReadCommitted));
    let h = pool.acquire(&second).unwrap();
    assert!(recorder.calls().is_empty(), "unexpected calls: {:?}", recorder.calls());
    assert_eq!(recorder.connects(), 1);
    assert_eq!(pool.in_use_count(), 1);
    drop(h);
}

#[test]
fn test_reconfigure_pushes_only_changed_properties() {
    let recorder = Recorder::default();
    let pool = pool_with(&recorder, orders());
    let cri = pool.request(Some("app"), Some("pw"));
    pool.acquire(&cri).unwrap().close().unwrap();

    recorder.clear();
    let h = pool.acquire(&cri.with_schema(Some("HR".into()))).unwrap();
    assert_eq!(recorder.calls(), vec!["setSchema(HR)"]);
    assert_eq!(recorder.connects(), 1);
    assert_eq!(
        lock(h.connection()).properties().schema.as_deref(),
        Some("HR")
    );
}

#[test]
fn test_cached_statements_stay_with_their_schema() {
    let recorder = Recorder::default();
    let pool = pool_with(&recorder, orders().max_connections(1));
    let cri = pool.request(Some("app"), Some("pw"));
    let k = StatementKey::prepared("select * from t");

    for schema in ["X", "Y", "X"] {
        let h = pool.acquire(&cri.with_schema(Some(schema.into()))).unwrap();
        let s = h.prepare_statement(&k).unwrap();
        h.return_statement(k.clone(), s);
        h.close().unwrap();
    }
    assert_eq!(recorder.connects(), 1);
    assert_eq!(recorder.count("prepare"), 2);
    assert_eq!(recorder.statements_closed(), 0);
}

#[test]
fn test_other_identity_opens_new_connection() {
    let recorder = Recorder::default();
    let pool = pool_with(&recorder, orders());
    pool.acquire(&pool.request(Some("app"), Some("pw")))
        .unwrap()
        .close()
        .unwrap();

    let _h = pool.acquire(&pool.request(Some("audit"), Some("pw"))).unwrap();
    assert_eq!(recorder.connects(), 2);
    assert_eq!(pool.idle_count(), 1);
    assert_eq!(pool.in_use_count(), 1);
}

#[test]
fn test_reconfigure_refused_under_active_handle() {
    let recorder = Recorder::default();
    let pool = pool_with(&recorder, orders());
    let cri = pool.request(Some("app"), Some("pw"));
    let h = pool.acquire(&cri).unwrap();

    let err = lock(h.connection())
        .reconfigure(&cri.with_schema(Some("HR".into())))
        .unwrap_err();
    assert!(matches!(err, DbError::HandlesActive(1)));
}

#[test]
fn test_isolation_switched_per_request() {
    let recorder = Recorder::default();
    let pool = pool_with(&recorder, orders().isolation_level_switching_support(true));
    let cri = pool.request(Some("app"), Some("pw"));
    pool.acquire(&cri).unwrap().close().unwrap();

    recorder.clear();
    let h = pool
        .acquire(&cri.with_isolation(Some(IsolationLevel::Serializable)))
        .unwrap();
    assert_eq!(recorder.calls(), vec!["setIsolation(Serializable)"]);
    h.close().unwrap();

    recorder.clear();
    let _h = pool.acquire(&cri).unwrap();
    assert_eq!(recorder.calls(), vec!["setIsolation(ReadCommitted)"]);
    assert_eq!(recorder.connects(), 1);
}

#[test]
fn test_full_pool_claims_idle_victim() {
    let recorder = Recorder::default();
    let pool = pool_with(&recorder, orders().max_connections(1));
    pool.acquire(&pool.request(Some("a"), Some("pw")))
        .unwrap()
        .close()
        .unwrap();

    let b = pool.acquire(&pool.request(Some("b"), Some("pw"))).unwrap();
    assert_eq!(recorder.count("close"), 1);
    assert_eq!(recorder.connects(), 2);

    let err = pool
        .acquire(&pool.request(Some("c"), Some("pw")))
        .err()
        .unwrap();
    assert!(matches!(err, DbError::Connection(_)));
    drop(b);
}

#[test]
fn test_stale_connection_is_evicted() {
    let recorder = Recorder::default();
    let pool = pool_with(&recorder, orders());
    let h = pool.acquire(&pool.request(Some("app"), Some("pw"))).unwrap();

    recorder.fail_next("prepare", stale_exception());
    let err = h
        .prepare_statement(&StatementKey::prepared("select 1"))
        .err()
        .unwrap();
    assert!(matches!(err, DbError::Driver(_)));
    assert_eq!(pool.in_use_count(), 0);
    assert_eq!(pool.fatal_error_count(), 1);
    assert_eq!(lock(h.connection()).state(), TransactionState::Failed);

    drop(h);
    assert_eq!(pool.idle_count(), 0);
    assert_eq!(recorder.count("close"), 1);
}

#[test]
fn test_purge_discards_every_connection() {
    let recorder = Recorder::default();
    let pool = pool_with(&recorder, orders());
    let cri = pool.request(Some("app"), Some("pw"));
    let busy = pool.acquire(&cri).unwrap();
    pool.acquire(&cri).unwrap().close().unwrap();
    assert_eq!(pool.idle_count(), 1);

    pool.purge();
    assert_eq!(pool.idle_count(), 0);
    assert!(lock(busy.connection()).is_stale());

    busy.close().unwrap();
    assert_eq!(pool.idle_count(), 0);
    assert_eq!(recorder.count("close"), 2);

    let _fresh = pool.acquire(&cri).unwrap();
    assert_eq!(recorder.connects(), 3);
}

#[test]
fn test_statement_cache_reuse_eviction_and_resize() {
    let recorder = Recorder::default();
    let pool = pool_with(&recorder, orders().statement_cache_size(2));
    let h = pool.acquire(&pool.request(Some("app"), Some("pw"))).unwrap();

    let k1 = StatementKey::prepared("select 1");
    let s = h.prepare_statement(&k1).unwrap();
    h.return_statement(k1.clone(), s);
    let s = h.prepare_statement(&k1).unwrap();
    assert_eq!(recorder.count("prepare"), 1);
    h.return_statement(k1.clone(), s);

    for sql in ["select 2", "select 3"] {
        let k = StatementKey::prepared(sql);
        let s = h.prepare_statement(&k).unwrap();
        h.return_statement(k, s);
    }
    assert_eq!(recorder.statements_closed(), 1);
    assert_eq!(lock(h.connection()).cached_statement_count(), 2);

    pool.update_config(orders().statement_cache_size(0)).unwrap();
    assert_eq!(recorder.statements_closed(), 3);
    assert_eq!(lock(h.connection()).cached_statement_count(), 0);
}

#[test]
fn test_stale_statement_evicted_from_cache() {
    let recorder = Recorder::default();
    let pool = pool_with(&recorder, orders());
    let h = pool.acquire(&pool.request(Some("app"), Some("pw"))).unwrap();
    let k = StatementKey::prepared("select * from t");
    let s = h.prepare_statement(&k).unwrap();
    h.return_statement(k.clone(), s);

    let gone = SqlException::new("statement no longer valid")
        .sql_state("26000")
        .build();
    let err = h.statement_failed(&k, gone);
    assert!(matches!(err, DbError::Driver(_)));
    assert_eq!(lock(h.connection()).cached_statement_count(), 0);
    assert!(!lock(h.connection()).is_stale());
}

#[test]
fn test_validation_failures() {
    let recorder = Recorder::default();
    let pool = pool_with(&recorder, orders());
    let h = pool.acquire(&pool.request(Some("app"), Some("pw"))).unwrap();
    let id = h.connection_id();

    assert!(pool.validate(id).unwrap());

    recorder.fail_next("isValid", SqlException::new("timed out").sql_state("HYT00").build());
    assert!(!pool.validate(id).unwrap());

    recorder.fail_next(
        "isValid",
        SqlException::new("password expired").sql_state("28000").build(),
    );
    let err = pool.validate(id).unwrap_err();
    assert!(matches!(err, DbError::Authorization(_)));
    assert_eq!(pool.in_use_count(), 0);
}

#[test]
fn test_unsupported_driver_properties_tolerated() {
    let recorder = Recorder::default();
    recorder.unsupported("getSchema");
    recorder.unsupported("getHoldability");
    let pool = pool_with(&recorder, orders());
    let h = pool.acquire(&pool.request(Some("app"), Some("pw"))).unwrap();
    let mc = lock(h.connection());
    assert_eq!(mc.properties().schema, None);
    assert_eq!(mc.properties().holdability, None);
    assert_eq!(mc.defaults().holdability, None);
}

#[test]
fn test_multithreaded_access_detected() {
    let recorder = Recorder::default();
    let pool = pool_with(&recorder, orders().enable_multithreaded_access_detection(true));
    let h = pool.acquire(&pool.request(Some("app"), Some("pw"))).unwrap();
    let key = StatementKey::prepared("select 1");

    thread::scope(|s| {
        s.spawn(|| h.prepare_statement(&key).unwrap());
    });
    assert_eq!(lock(h.connection()).multithreaded_access_violations(), 1);
}

#[test]
fn test_dump_is_serializable_without_password() {
    let recorder = Recorder::default();
    let pool = pool_with(&recorder, orders());
    let _h = pool
        .acquire(&pool.request(Some("app"), Some("pw-secret")))
        .unwrap();

    let json = serde_json::to_value(pool.dump()).unwrap();
    assert_eq!(json["in_use"], 1);
    assert_eq!(json["connections"][0]["state"], "NoTransaction");
    assert_eq!(json["connections"][0]["requested"]["user"], "app");
    assert!(!json.to_string().contains("pw-secret"));
}
