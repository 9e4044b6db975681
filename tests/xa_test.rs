mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{MockDriver, MockTm, Recorder, init_tracing, stale_exception, xid};
use upool::ConnectionPool;
use upool::error::{XaError, XaErrorCode};
use upool::managed::lock;
use upool::managed::state::TransactionState;
use upool::models::db_config::PoolConfig;
use upool::transaction::TransactionManager;
use upool::udbc::statement::StatementKey;
use upool::udbc::xa::{XaFlags, XaResource, XaVote};

fn pool_with(recorder: &Recorder, config: PoolConfig, tm: Option<Arc<dyn TransactionManager>>) -> ConnectionPool {
    init_tracing();
    ConnectionPool::new(Arc::new(MockDriver::new(recorder.clone())), config, tm).unwrap()
}

fn payments() -> PoolConfig {
    PoolConfig::new("payments").pool_id(2)
}

#[test]
fn test_two_phase_commit_cycle() {
    let recorder = Recorder::default();
    let pool = pool_with(&recorder, payments(), None);
    let h = pool.acquire(&pool.request(Some("app"), Some("pw"))).unwrap();
    let xa = pool.xa_resource(&h);
    let x = xid(1);

    xa.start(&x, XaFlags::NO_FLAGS).unwrap();
    assert_eq!(lock(h.connection()).state(), TransactionState::GlobalTransactionActive);
    xa.end(&x, XaFlags::SUCCESS).unwrap();
    assert_eq!(lock(h.connection()).state(), TransactionState::TransactionEnding);
    assert_eq!(xa.prepare(&x).unwrap(), XaVote::Ok);
    xa.commit(&x, false).unwrap();
    assert_eq!(lock(h.connection()).state(), TransactionState::NoTransaction);
    assert_eq!(recorder.count("xa.commit"), 1);
    assert_eq!(xa.resource_manager_id(), "mock-rm");
}

#[test]
fn test_suspend_and_resume_same_branch() {
    let recorder = Recorder::default();
    let pool = pool_with(&recorder, payments(), None);
    let h = pool.acquire(&pool.request(Some("app"), Some("pw"))).unwrap();
    let xa = pool.xa_resource(&h);
    let x = xid(2);

    xa.start(&x, XaFlags::NO_FLAGS).unwrap();
    xa.end(&x, XaFlags::SUSPEND).unwrap();
    let err = xa.start(&xid(9), XaFlags::RESUME).unwrap_err();
    assert_eq!(err.code, XaErrorCode::NoSuchBranch);
    xa.start(&x, XaFlags::RESUME).unwrap();
    assert_eq!(lock(h.connection()).state(), TransactionState::GlobalTransactionActive);
}

#[test]
fn test_end_with_foreign_branch_is_rejected() {
    let recorder = Recorder::default();
    let pool = pool_with(&recorder, payments(), None);
    let h = pool.acquire(&pool.request(Some("app"), Some("pw"))).unwrap();
    let xa = pool.xa_resource(&h);

    xa.start(&xid(1), XaFlags::NO_FLAGS).unwrap();
    recorder.clear();
    let err = xa.end(&xid(2), XaFlags::SUCCESS).unwrap_err();
    assert_eq!(err.code, XaErrorCode::NoSuchBranch);
    assert!(recorder.calls().is_empty());
    assert_eq!(lock(h.connection()).state(), TransactionState::GlobalTransactionActive);
}

#[test]
fn test_end_without_start_forces_fail_end() {
    let recorder = Recorder::default();
    let pool = pool_with(&recorder, payments(), None);
    let h = pool.acquire(&pool.request(Some("app"), Some("pw"))).unwrap();
    let xa = pool.xa_resource(&h);
    let x = xid(3);

    let err = xa.end(&x, XaFlags::SUCCESS).unwrap_err();
    assert_eq!(err.code, XaErrorCode::Protocol);
    assert_eq!(recorder.calls().last().cloned(), Some(format!("xa.end({},FAIL)", x)));
    assert_eq!(lock(h.connection()).state(), TransactionState::NoTransaction);
}

#[test]
fn test_commit_without_start_is_recovery_path() {
    let recorder = Recorder::default();
    let pool = pool_with(&recorder, payments(), None);
    let h = pool.acquire(&pool.request(Some("app"), Some("pw"))).unwrap();
    let xa = pool.xa_resource(&h);

    xa.commit(&xid(4), false).unwrap();
    xa.rollback(&xid(5)).unwrap();
    assert_eq!(recorder.count("xa.commit"), 1);
    assert_eq!(recorder.count("xa.rollback"), 1);
    assert_eq!(lock(h.connection()).state(), TransactionState::NoTransaction);
}

#[test]
fn test_heuristic_outcome_replayed_until_forget() {
    let recorder = Recorder::default();
    let pool = pool_with(&recorder, payments(), None);
    let h = pool.acquire(&pool.request(Some("app"), Some("pw"))).unwrap();
    let xa = pool.xa_resource(&h);
    let x = xid(6);

    xa.start(&x, XaFlags::NO_FLAGS).unwrap();
    xa.end(&x, XaFlags::SUCCESS).unwrap();
    xa.prepare(&x).unwrap();
    recorder.fail_xa_next(
        "commit",
        XaError::new(XaErrorCode::HeurRollback, "branch rolled back by operator"),
    );
    let err = xa.commit(&x, false).unwrap_err();
    assert_eq!(err.code, XaErrorCode::HeurRollback);
    assert_eq!(lock(h.connection()).state(), TransactionState::HeuristicEnd);

    recorder.clear();
    let err = xa.commit(&x, false).unwrap_err();
    assert_eq!(err.code, XaErrorCode::HeurRollback);
    assert_eq!(recorder.count("xa.commit"), 0);
    assert_eq!(lock(h.connection()).state(), TransactionState::HeuristicEnd);

    xa.forget(&x).unwrap();
    assert_eq!(recorder.count("xa.forget"), 1);
    assert_eq!(lock(h.connection()).state(), TransactionState::NoTransaction);
}

#[test]
fn test_two_phase_commit_deferred_after_stale_event() {
    let recorder = Recorder::default();
    let pool = pool_with(
        &recorder,
        payments().failover_retry_delay(Duration::from_secs(60)),
        None,
    );
    let cri = pool.request(Some("app"), Some("pw"));
    let broken = pool.acquire(&cri).unwrap();
    let h = pool.acquire(&cri).unwrap();
    let xa = pool.xa_resource(&h);
    let x = xid(7);

    xa.start(&x, XaFlags::NO_FLAGS).unwrap();
    xa.end(&x, XaFlags::SUCCESS).unwrap();
    xa.prepare(&x).unwrap();

    recorder.fail_next("prepare", stale_exception());
    assert!(broken.prepare_statement(&StatementKey::prepared("select 1")).is_err());

    recorder.clear();
    let err = xa.commit(&x, false).unwrap_err();
    assert_eq!(err.code, XaErrorCode::Retry);
    assert!(recorder.calls().is_empty());
    assert_eq!(lock(h.connection()).state(), TransactionState::TransactionEnding);
}

#[test]
fn test_aborted_connection_short_circuits() {
    let recorder = Recorder::default();
    let pool = pool_with(&recorder, payments(), None);
    let h = pool.acquire(&pool.request(Some("app"), Some("pw"))).unwrap();
    let xa = pool.xa_resource(&h);
    let x = xid(8);

    xa.start(&x, XaFlags::NO_FLAGS).unwrap();
    recorder.fail_xa_next("end", XaError::new(XaErrorCode::RmFail, "connection lost"));
    let err = xa.end(&x, XaFlags::SUCCESS).unwrap_err();
    assert_eq!(err.code, XaErrorCode::RmFail);
    assert_eq!(pool.fatal_error_count(), 1);

    recorder.clear();
    let err = xa.rollback(&x).unwrap_err();
    assert_eq!(err.code, XaErrorCode::RmFail);
    assert!(recorder.calls().is_empty());
}

#[test]
fn test_read_only_vote_completes_branch() {
    let recorder = Recorder::default();
    recorder.set_vote(XaVote::ReadOnly);
    let pool = pool_with(&recorder, payments(), None);
    let h = pool.acquire(&pool.request(Some("app"), Some("pw"))).unwrap();
    let xa = pool.xa_resource(&h);
    let x = xid(10);

    xa.start(&x, XaFlags::NO_FLAGS).unwrap();
    xa.end(&x, XaFlags::SUCCESS).unwrap();
    assert_eq!(xa.prepare(&x).unwrap(), XaVote::ReadOnly);
    assert_eq!(lock(h.connection()).state(), TransactionState::NoTransaction);
}

#[test]
fn test_failed_start_cleans_up_driver_branch() {
    let recorder = Recorder::default();
    let pool = pool_with(&recorder, payments(), None);
    let h = pool.acquire(&pool.request(Some("app"), Some("pw"))).unwrap();
    let xa = pool.xa_resource(&h);
    let x = xid(11);

    recorder.fail_xa_next("start", XaError::new(XaErrorCode::RmError, "start refused"));
    let err = xa.start(&x, XaFlags::NO_FLAGS).unwrap_err();
    assert_eq!(err.code, XaErrorCode::Protocol);
    let calls = recorder.calls();
    assert!(calls.contains(&format!("xa.end({},FAIL)", x)));
    assert!(calls.contains(&format!("xa.rollback({})", x)));
    assert_eq!(lock(h.connection()).state(), TransactionState::NoTransaction);
}

#[test]
fn test_recover_enters_recovery() {
    let recorder = Recorder::default();
    let pool = pool_with(&recorder, payments(), None);
    let h = pool.acquire(&pool.request(Some("app"), Some("pw"))).unwrap();
    let xa = pool.xa_resource(&h);

    assert!(xa.recover(XaFlags::START_RSCAN).unwrap().is_empty());
    assert_eq!(lock(h.connection()).state(), TransactionState::NoTransaction);

    recorder.set_recover(vec![xid(12)]);
    let found = xa.recover(XaFlags::START_RSCAN | XaFlags::END_RSCAN).unwrap();
    assert_eq!(found, vec![xid(12)]);
    assert_eq!(lock(h.connection()).state(), TransactionState::RecoveryInProgress);

    xa.commit(&xid(12), false).unwrap();
    assert_eq!(lock(h.connection()).state(), TransactionState::NoTransaction);
}

#[test]
fn test_lazy_enlistment_once_per_transaction() {
    let recorder = Recorder::default();
    let tm = Arc::new(MockTm::default());
    let pool = pool_with(&recorder, payments(), Some(tm.clone()));
    let h = pool.acquire(&pool.request(Some("app"), Some("pw"))).unwrap();
    let xa = pool.xa_resource(&h);
    let key = StatementKey::prepared("update t set x = 1");

    tm.begin("g1");
    h.prepare_statement(&key).unwrap();
    h.prepare_statement(&key).unwrap();
    let enlisted = format!("enlist {}", h.connection_id());
    assert_eq!(tm.log(), vec![enlisted.clone()]);

    let x = xid(13);
    xa.start(&x, XaFlags::NO_FLAGS).unwrap();
    xa.end(&x, XaFlags::SUCCESS).unwrap();
    xa.commit(&x, true).unwrap();

    h.prepare_statement(&key).unwrap();
    assert_eq!(tm.log(), vec![enlisted.clone(), enlisted]);
}

#[test]
fn test_validation_runs_outside_global_transaction() {
    let recorder = Recorder::default();
    let tm = Arc::new(MockTm::default());
    let pool = pool_with(&recorder, payments(), Some(tm.clone()));
    let h = pool.acquire(&pool.request(Some("app"), Some("pw"))).unwrap();

    tm.begin("g2");
    assert!(pool.validate(h.connection_id()).unwrap());
    assert_eq!(tm.log(), vec!["suspend g2", "resume g2"]);
    tm.finish();
}
