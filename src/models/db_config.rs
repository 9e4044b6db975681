use crate::classifier::ErrorCategory;
use crate::udbc::connection::IsolationLevel;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// 归还连接时未结束的本地事务如何处理
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CleanupPolicy {
    Commit,
    Rollback,
}

/// One user override of the error classification: exceptions carrying the
/// given SQL state and/or vendor code are reported as `category`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentifyException {
    pub sql_state: Option<String>,
    pub error_code: Option<i32>,
    pub category: ErrorCategory,
}

impl IdentifyException {
    pub fn state(sql_state: impl Into<String>, category: ErrorCategory) -> Self {
        Self {
            sql_state: Some(sql_state.into()),
            error_code: None,
            category,
        }
    }

    pub fn code(error_code: i32, category: ErrorCategory) -> Self {
        Self {
            sql_state: None,
            error_code: Some(error_code),
            category,
        }
    }

    pub fn state_and_code(
        sql_state: impl Into<String>,
        error_code: i32,
        category: ErrorCategory,
    ) -> Self {
        Self {
            sql_state: Some(sql_state.into()),
            error_code: Some(error_code),
            category,
        }
    }
}

/// Immutable configuration snapshot of one connection pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    pub name: String,
    pub pool_id: u32,
    pub max_connections: usize,
    /// 厂商插件注册名，为空时按驱动类型选择
    pub vendor: Option<String>,
    pub statement_cache_size: usize,
    pub commit_or_rollback_on_cleanup: Option<CleanupPolicy>,
    pub enable_multithreaded_access_detection: bool,
    /// 0 表示不启用 2PC 延迟重试
    pub failover_retry_delay_ms: u64,
    pub isolation_level_switching_support: bool,
    pub isolation_level: Option<IsolationLevel>,
    pub validation_timeout_secs: u32,
    pub xa_end_resets_auto_commit: Option<bool>,
    pub identify_exceptions: Vec<IdentifyException>,
}

impl PoolConfig {
    pub fn new(name: impl Into<String>) -> Self {
        PoolConfig {
            name: name.into(),
            pool_id: 0,
            max_connections: 10,
            vendor: None,
            statement_cache_size: 10,
            commit_or_rollback_on_cleanup: None,
            enable_multithreaded_access_detection: false,
            failover_retry_delay_ms: 0,
            isolation_level_switching_support: false,
            isolation_level: None,
            validation_timeout_secs: 10,
            xa_end_resets_auto_commit: None,
            identify_exceptions: Vec::new(),
        }
    }

    pub fn pool_id(mut self, pool_id: u32) -> Self {
        self.pool_id = pool_id;
        self
    }

    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    pub fn vendor(mut self, vendor: impl Into<String>) -> Self {
        self.vendor = Some(vendor.into());
        self
    }

    pub fn statement_cache_size(mut self, size: usize) -> Self {
        self.statement_cache_size = size;
        self
    }

    pub fn commit_or_rollback_on_cleanup(mut self, policy: CleanupPolicy) -> Self {
        self.commit_or_rollback_on_cleanup = Some(policy);
        self
    }

    pub fn enable_multithreaded_access_detection(mut self, on: bool) -> Self {
        self.enable_multithreaded_access_detection = on;
        self
    }

    pub fn failover_retry_delay(mut self, delay: Duration) -> Self {
        self.failover_retry_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn isolation_level_switching_support(mut self, on: bool) -> Self {
        self.isolation_level_switching_support = on;
        self
    }

    pub fn isolation_level(mut self, level: IsolationLevel) -> Self {
        self.isolation_level = Some(level);
        self
    }

    pub fn validation_timeout_secs(mut self, secs: u32) -> Self {
        self.validation_timeout_secs = secs;
        self
    }

    pub fn xa_end_resets_auto_commit(mut self, on: bool) -> Self {
        self.xa_end_resets_auto_commit = Some(on);
        self
    }

    pub fn identify_exception(mut self, entry: IdentifyException) -> Self {
        self.identify_exceptions.push(entry);
        self
    }

    pub fn failover_retry_delay_window(&self) -> Option<Duration> {
        (self.failover_retry_delay_ms > 0).then(|| Duration::from_millis(self.failover_retry_delay_ms))
    }

    pub fn cleanup_policy(&self) -> CleanupPolicy {
        self.commit_or_rollback_on_cleanup
            .unwrap_or(CleanupPolicy::Rollback)
    }
}

/// Shared holder of the live configuration. Readers take one snapshot per
/// operation; an update swaps the whole snapshot.
#[derive(Debug)]
pub struct ConfigCell {
    current: RwLock<Arc<PoolConfig>>,
}

impl ConfigCell {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            current: RwLock::new(Arc::new(config)),
        }
    }

    pub fn snapshot(&self) -> Arc<PoolConfig> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Installs `config` and returns the snapshot it replaced.
    pub fn swap(&self, config: PoolConfig) -> Arc<PoolConfig> {
        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        std::mem::replace(&mut *guard, Arc::new(config))
    }
}
