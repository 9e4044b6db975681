use std::collections::HashSet;
use std::sync::{Arc, LazyLock};

use dashmap::DashMap;
use tracing::debug;

use crate::error::DbError;
use crate::models::db_config::PoolConfig;
use crate::models::db_type::DatabaseType;
use crate::udbc::connection::IsolationLevel;
use crate::udbc::exception::SqlException;

/// 全局厂商插件注册表
pub static VENDORS: LazyLock<PluginRegistry> = LazyLock::new(PluginRegistry::with_builtins);

/// SQL states that mean the physical connection is gone, for every vendor.
const GENERIC_STALE_STATES: &[&str] = &[
    "08000", "08001", "08003", "08004", "08006", "08007", "08S01", "40003",
];

/// Vendor behaviour the pooling layer needs, resolved once per pool.
#[derive(Debug, Clone)]
pub struct VendorCapabilities {
    pub database_type: DatabaseType,
    pub stale_connection_states: HashSet<String>,
    pub stale_connection_codes: HashSet<i32>,
    pub stale_statement_states: HashSet<String>,
    pub stale_statement_codes: HashSet<i32>,
    pub unsupported_codes: HashSet<i32>,
    /// 判断瞬时异常是否意味着发生了故障转移
    pub failover_occurred: fn(&SqlException) -> bool,
    pub xa_end_resets_auto_commit: bool,
    pub default_isolation: IsolationLevel,
}

fn never_failover(_: &SqlException) -> bool {
    false
}

fn db2_failover(e: &SqlException) -> bool {
    matches!(e.code(), -4498 | -30108)
}

fn oracle_failover(e: &SqlException) -> bool {
    matches!(e.code(), 25402 | 25408)
}

fn informix_failover(e: &SqlException) -> bool {
    e.code() == -79716
}

fn states(list: &[&str]) -> HashSet<String> {
    list.iter().map(|s| s.to_string()).collect()
}

impl VendorCapabilities {
    pub fn generic() -> Self {
        Self {
            database_type: DatabaseType::Generic,
            stale_connection_states: states(GENERIC_STALE_STATES),
            stale_connection_codes: HashSet::new(),
            stale_statement_states: states(&["26000"]),
            stale_statement_codes: HashSet::new(),
            unsupported_codes: HashSet::new(),
            failover_occurred: never_failover,
            xa_end_resets_auto_commit: false,
            default_isolation: IsolationLevel::ReadCommitted,
        }
    }

    pub fn for_database(db: DatabaseType) -> Self {
        let mut caps = Self::generic();
        caps.database_type = db;
        match db {
            DatabaseType::Db2 => {
                caps.stale_connection_codes
                    .extend([-30108, -30081, -30080, -4499, -4498, -4470, -1224, -1229, -1776]);
                caps.stale_statement_codes.extend([-514, -518]);
                caps.unsupported_codes.insert(-4450);
                caps.failover_occurred = db2_failover;
                caps.default_isolation = IsolationLevel::RepeatableRead;
            }
            DatabaseType::Oracle => {
                caps.stale_connection_codes
                    .extend([28, 1012, 1033, 1034, 1089, 1090, 1092, 3113, 3114, 17002, 17008, 17410]);
                caps.stale_statement_codes.insert(17009);
                caps.unsupported_codes.insert(17023);
                caps.failover_occurred = oracle_failover;
            }
            DatabaseType::SqlServer => {
                caps.stale_connection_codes.extend([4060, 10054, 40613]);
                caps.stale_statement_codes.insert(8179);
            }
            DatabaseType::Informix => {
                caps.stale_connection_codes
                    .extend([-79716, -79735, -79850, -908, -25580, -27002]);
                caps.failover_occurred = informix_failover;
                caps.xa_end_resets_auto_commit = true;
            }
            DatabaseType::Sybase => {
                caps.stale_connection_states
                    .extend(states(&["JZ006", "JZ0C0", "JZ0C1"]));
                caps.unsupported_codes.insert(2762);
                caps.default_isolation = IsolationLevel::RepeatableRead;
            }
            DatabaseType::Derby => {
                caps.stale_connection_states.insert("XJ015".to_string());
                caps.stale_connection_codes.insert(40000);
            }
            DatabaseType::Postgres => {
                caps.stale_connection_states
                    .extend(states(&["57P01", "57P02", "57P03"]));
            }
            DatabaseType::MySql => {
                caps.stale_connection_codes.extend([1053, 1927, 2006, 2013]);
                caps.default_isolation = IsolationLevel::RepeatableRead;
            }
            DatabaseType::Generic => {}
        }
        caps
    }
}

/// Supplies the capability table for one database product.
pub trait VendorPlugin: Send + Sync {
    fn name(&self) -> &str;

    fn capabilities(&self) -> VendorCapabilities;
}

struct BuiltinVendor(DatabaseType);

impl VendorPlugin for BuiltinVendor {
    fn name(&self) -> &str {
        self.0.as_str()
    }

    fn capabilities(&self) -> VendorCapabilities {
        VendorCapabilities::for_database(self.0)
    }
}

/// 按配置名查找厂商插件
pub struct PluginRegistry {
    plugins: DashMap<String, Arc<dyn VendorPlugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self {
            plugins: DashMap::new(),
        }
    }

    pub fn with_builtins() -> Self {
        let registry = Self::new();
        for db in [
            DatabaseType::Db2,
            DatabaseType::Oracle,
            DatabaseType::SqlServer,
            DatabaseType::Informix,
            DatabaseType::Sybase,
            DatabaseType::Derby,
            DatabaseType::Postgres,
            DatabaseType::MySql,
            DatabaseType::Generic,
        ] {
            registry.register(BuiltinVendor(db));
        }
        registry
    }

    /// 注册厂商插件，同名插件会被替换
    pub fn register(&self, plugin: impl VendorPlugin + 'static) {
        self.plugins
            .insert(plugin.name().to_string(), Arc::new(plugin));
    }

    pub fn get(&self, key: &str) -> Option<Arc<dyn VendorPlugin>> {
        self.plugins.get(key).map(|v| v.value().clone())
    }

    /// Picks the plugin named by the configuration, falling back to the
    /// driver-reported database type, and applies configured overrides.
    pub fn resolve(
        &self,
        config: &PoolConfig,
        detected: DatabaseType,
    ) -> Result<VendorCapabilities, DbError> {
        let key = config.vendor.as_deref().unwrap_or(detected.as_str());
        let plugin = self
            .get(key)
            .ok_or_else(|| DbError::UnsupportedDatabaseType(key.to_string()))?;
        let mut caps = plugin.capabilities();
        if let Some(v) = config.xa_end_resets_auto_commit {
            caps.xa_end_resets_auto_commit = v;
        }
        debug!(pool = %config.name, vendor = key, "resolved vendor capabilities");
        Ok(caps)
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Custom;

    impl VendorPlugin for Custom {
        fn name(&self) -> &str {
            "acme"
        }

        fn capabilities(&self) -> VendorCapabilities {
            let mut caps = VendorCapabilities::generic();
            caps.stale_connection_codes.insert(777);
            caps
        }
    }

    #[test]
    fn test_resolve_by_detected_type() {
        let registry = PluginRegistry::with_builtins();
        let caps = registry
            .resolve(&PoolConfig::new("ds"), DatabaseType::Db2)
            .unwrap();
        assert_eq!(caps.database_type, DatabaseType::Db2);
        assert!(caps.stale_connection_codes.contains(&-4499));
        assert!(caps.stale_connection_states.contains("08006"));
    }

    #[test]
    fn test_resolve_custom_plugin_by_config_key() {
        let registry = PluginRegistry::with_builtins();
        registry.register(Custom);
        let caps = registry
            .resolve(&PoolConfig::new("ds").vendor("acme"), DatabaseType::Oracle)
            .unwrap();
        assert!(caps.stale_connection_codes.contains(&777));
    }

    #[test]
    fn test_unknown_plugin_key() {
        let registry = PluginRegistry::with_builtins();
        let err = registry
            .resolve(&PoolConfig::new("ds").vendor("nope"), DatabaseType::Generic)
            .unwrap_err();
        assert!(matches!(err, DbError::UnsupportedDatabaseType(k) if k == "nope"));
    }

    #[test]
    fn test_config_overrides_xa_end_flag() {
        let registry = PluginRegistry::with_builtins();
        let caps = registry
            .resolve(
                &PoolConfig::new("ds").xa_end_resets_auto_commit(true),
                DatabaseType::Oracle,
            )
            .unwrap();
        assert!(caps.xa_end_resets_auto_commit);
    }
}
