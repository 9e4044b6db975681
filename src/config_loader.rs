use anyhow::{Context, Result, anyhow};
use dashmap::DashMap;
use quick_xml::de;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;
use walkdir::WalkDir;

use crate::classifier::ErrorCategory;
use crate::models::db_config::{CleanupPolicy, IdentifyException, PoolConfig};
use crate::udbc::connection::IsolationLevel;

pub type DataSourceStore = DashMap<String, PoolConfig>;

static DATA_SOURCES: OnceLock<DataSourceStore> = OnceLock::new();

#[derive(Debug, Deserialize)]
struct DataSources {
    #[serde(rename = "dataSource", default)]
    data_sources: Vec<DataSourceItem>,
}

#[derive(Debug, Deserialize)]
struct DataSourceItem {
    #[serde(rename = "@name")]
    name: String,
    #[serde(rename = "@poolId")]
    pool_id: Option<String>,
    #[serde(rename = "@vendor")]
    vendor: Option<String>,
    #[serde(rename = "@maxConnections")]
    max_connections: Option<String>,
    #[serde(rename = "@statementCacheSize")]
    statement_cache_size: Option<String>,
    #[serde(rename = "@commitOrRollbackOnCleanup")]
    commit_or_rollback_on_cleanup: Option<String>,
    #[serde(rename = "@enableMultithreadedAccessDetection")]
    enable_multithreaded_access_detection: Option<String>,
    #[serde(rename = "@failoverRetryDelayMs")]
    failover_retry_delay_ms: Option<String>,
    #[serde(rename = "@isolationLevelSwitchingSupport")]
    isolation_level_switching_support: Option<String>,
    #[serde(rename = "@isolationLevel")]
    isolation_level: Option<String>,
    #[serde(rename = "@validationTimeout")]
    validation_timeout: Option<String>,
    #[serde(rename = "@xaEndResetsAutoCommit")]
    xa_end_resets_auto_commit: Option<String>,
    #[serde(rename = "identifyException", default)]
    identify_exceptions: Vec<IdentifyItem>,
}

#[derive(Debug, Deserialize)]
struct IdentifyItem {
    #[serde(rename = "@sqlState")]
    sql_state: Option<String>,
    #[serde(rename = "@errorCode")]
    error_code: Option<String>,
    #[serde(rename = "@as")]
    category: String,
}

fn parse_bool(s: &str) -> bool {
    matches!(s.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes")
}

fn parse_num<T: std::str::FromStr>(s: &str, attr: &str) -> Result<T> {
    s.trim()
        .parse()
        .map_err(|_| anyhow!("属性 {} 不是合法数字: '{}'", attr, s))
}

fn parse_isolation(s: &str) -> Result<IsolationLevel> {
    match s.trim().to_ascii_uppercase().replace('-', "_").as_str() {
        "NONE" => Ok(IsolationLevel::None),
        "READ_UNCOMMITTED" => Ok(IsolationLevel::ReadUncommitted),
        "READ_COMMITTED" => Ok(IsolationLevel::ReadCommitted),
        "REPEATABLE_READ" => Ok(IsolationLevel::RepeatableRead),
        "SERIALIZABLE" => Ok(IsolationLevel::Serializable),
        other => Err(anyhow!("未知的隔离级别: '{}'", other)),
    }
}

fn parse_cleanup(s: &str) -> Result<CleanupPolicy> {
    match s.trim().to_ascii_lowercase().as_str() {
        "commit" => Ok(CleanupPolicy::Commit),
        "rollback" => Ok(CleanupPolicy::Rollback),
        other => Err(anyhow!("commitOrRollbackOnCleanup 取值无效: '{}'", other)),
    }
}

impl IdentifyItem {
    fn to_entry(&self) -> Result<IdentifyException> {
        let category = ErrorCategory::parse(&self.category)
            .ok_or_else(|| anyhow!("未知的异常类别: '{}'", self.category))?;
        let error_code = self
            .error_code
            .as_deref()
            .map(|c| parse_num::<i32>(c, "errorCode"))
            .transpose()?;
        let sql_state = self
            .sql_state
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        if sql_state.is_none() && error_code.is_none() {
            anyhow::bail!("identifyException 需要 sqlState 或 errorCode");
        }
        Ok(IdentifyException {
            sql_state,
            error_code,
            category,
        })
    }
}

impl DataSourceItem {
    fn to_config(&self) -> Result<PoolConfig> {
        let mut config = PoolConfig::new(self.name.trim());
        if let Some(v) = &self.pool_id {
            config = config.pool_id(parse_num(v, "poolId")?);
        }
        if let Some(v) = &self.vendor {
            config = config.vendor(v.trim());
        }
        if let Some(v) = &self.max_connections {
            config = config.max_connections(parse_num(v, "maxConnections")?);
        }
        if let Some(v) = &self.statement_cache_size {
            config = config.statement_cache_size(parse_num(v, "statementCacheSize")?);
        }
        if let Some(v) = &self.commit_or_rollback_on_cleanup {
            config = config.commit_or_rollback_on_cleanup(parse_cleanup(v)?);
        }
        if let Some(v) = &self.enable_multithreaded_access_detection {
            config = config.enable_multithreaded_access_detection(parse_bool(v));
        }
        if let Some(v) = &self.failover_retry_delay_ms {
            let ms: u64 = parse_num(v, "failoverRetryDelayMs")?;
            config = config.failover_retry_delay(Duration::from_millis(ms));
        }
        if let Some(v) = &self.isolation_level_switching_support {
            config = config.isolation_level_switching_support(parse_bool(v));
        }
        if let Some(v) = &self.isolation_level {
            config = config.isolation_level(parse_isolation(v)?);
        }
        if let Some(v) = &self.validation_timeout {
            config = config.validation_timeout_secs(parse_num(v, "validationTimeout")?);
        }
        if let Some(v) = &self.xa_end_resets_auto_commit {
            config = config.xa_end_resets_auto_commit(parse_bool(v));
        }
        for item in &self.identify_exceptions {
            config = config.identify_exception(item.to_entry()?);
        }
        Ok(config)
    }
}

/// 从内存中的 XML 内容加载数据源配置
pub fn load(assets: &[&[u8]]) -> Result<Vec<PoolConfig>> {
    let mut loaded = Vec::new();
    for data in assets {
        let content = std::str::from_utf8(data).context("Asset content is not valid UTF-8")?;
        loaded.extend(process_data(content, "memory")?);
    }
    Ok(loaded)
}

pub fn load_str(xml: &str) -> Result<Vec<PoolConfig>> {
    process_data(xml, "memory")
}

pub fn find_data_source(name: &str) -> Option<PoolConfig> {
    let store = DATA_SOURCES.get()?;
    store.get(name).map(|v| v.clone())
}

/// 递归读取指定目录及其子目录下的所有 XML 文件，并解析。
pub fn load_from_path(dir_path: &Path) -> Result<Vec<PoolConfig>> {
    let mut loaded = Vec::new();
    for entry in WalkDir::new(dir_path).into_iter().filter_map(|e| e.ok()) {
        let path = entry.path();

        if path.is_file() && path.extension().is_some_and(|ext| ext == "xml") {
            loaded.extend(process_file(path)?);
        }
    }
    Ok(loaded)
}

fn process_file(path: &Path) -> Result<Vec<PoolConfig>> {
    let xml_content =
        fs::read_to_string(path).with_context(|| format!("读取文件失败: {}", path.display()))?;
    process_data(&xml_content, &path.display().to_string())
}

fn process_data(xml_content: &str, source: &str) -> Result<Vec<PoolConfig>> {
    let parsed: DataSources =
        de::from_str(xml_content).with_context(|| format!("XML 解析失败: {}", source))?;

    let store = DATA_SOURCES.get_or_init(DashMap::new);

    let mut loaded = Vec::with_capacity(parsed.data_sources.len());
    for item in &parsed.data_sources {
        let config = item
            .to_config()
            .with_context(|| format!("数据源 '{}' 配置无效 ({})", item.name, source))?;
        if store.insert(config.name.clone(), config.clone()).is_some() {
            anyhow::bail!("文件 '{}' 中发现重复的数据源: '{}'", source, config.name);
        }
        loaded.push(config);
    }
    Ok(loaded)
}
