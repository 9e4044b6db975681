use std::path::Path;
use std::sync::{Arc, LazyLock};

use dashmap::DashMap;

use crate::config_loader::{find_data_source, load, load_from_path};
use crate::error::DbError;
use crate::models::db_config::PoolConfig;
use crate::pool::ConnectionPool;
use crate::transaction::TransactionManager;
use crate::udbc::driver::Driver;

// 全局单例（Rust 1.80+ 推荐）
pub static DB: LazyLock<PoolManager> = LazyLock::new(PoolManager::new);

/// 数据库连接池管理器
/// Manages connection pools by data source name
pub struct PoolManager {
    pools: DashMap<String, ConnectionPool>,
}

/// 获取全局 PoolManager 实例
pub fn pool_mgr() -> &'static PoolManager {
    &DB
}

impl PoolManager {
    pub fn new() -> Self {
        Self {
            pools: DashMap::new(),
        }
    }

    /// 加载 XML 数据源配置（内存内容或目录）
    pub fn assets(&self, assets: Option<&[&[u8]]>, path: Option<&str>) -> Result<(), DbError> {
        if let Some(assets) = assets {
            load(assets).map_err(|e| DbError::Config(format!("{:#}", e)))?;
        }
        if let Some(path) = path {
            load_from_path(Path::new(path)).map_err(|e| DbError::Config(format!("{:#}", e)))?;
        }
        Ok(())
    }

    /// 注册数据库连接池
    pub fn register(
        &self,
        driver: Arc<dyn Driver>,
        config: PoolConfig,
        tm: Option<Arc<dyn TransactionManager>>,
    ) -> Result<ConnectionPool, DbError> {
        let name = config.name.clone();
        let pool = ConnectionPool::new(driver, config, tm)?;
        self.pools.insert(name, pool.clone());
        Ok(pool)
    }

    /// Registers a pool for a data source loaded through [`PoolManager::assets`].
    pub fn register_configured(
        &self,
        driver: Arc<dyn Driver>,
        name: &str,
        tm: Option<Arc<dyn TransactionManager>>,
    ) -> Result<ConnectionPool, DbError> {
        let config = find_data_source(name)
            .ok_or_else(|| DbError::Config(format!("data source '{}' is not configured", name)))?;
        self.register(driver, config, tm)
    }

    pub fn pool(&self, name: &str) -> Option<ConnectionPool> {
        self.pools.get(name).map(|v| v.value().clone())
    }

    /// Removes a pool and purges its idle connections.
    pub fn remove(&self, name: &str) -> Option<ConnectionPool> {
        let (_, pool) = self.pools.remove(name)?;
        pool.purge();
        Some(pool)
    }
}

impl Default for PoolManager {
    fn default() -> Self {
        Self::new()
    }
}
