use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    Db2,
    Oracle,
    SqlServer,
    Informix,
    Sybase,
    Derby,
    Postgres,
    MySql,
    Generic,
}

impl DatabaseType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DatabaseType::Db2 => "db2",
            DatabaseType::Oracle => "oracle",
            DatabaseType::SqlServer => "sqlserver",
            DatabaseType::Informix => "informix",
            DatabaseType::Sybase => "sybase",
            DatabaseType::Derby => "derby",
            DatabaseType::Postgres => "postgres",
            DatabaseType::MySql => "mysql",
            DatabaseType::Generic => "generic",
        }
    }

    /// 根据驱动元数据中的产品名识别数据库厂商
    pub fn from_product_name(product: &str) -> DatabaseType {
        let p = product.to_ascii_lowercase();
        if p.contains("db2") {
            DatabaseType::Db2
        } else if p.contains("oracle") {
            DatabaseType::Oracle
        } else if p.contains("microsoft sql server") || p.contains("sqlserver") {
            DatabaseType::SqlServer
        } else if p.contains("informix") {
            DatabaseType::Informix
        } else if p.contains("sybase") || p.contains("adaptive server") {
            DatabaseType::Sybase
        } else if p.contains("derby") {
            DatabaseType::Derby
        } else if p.contains("postgres") {
            DatabaseType::Postgres
        } else if p.contains("mysql") || p.contains("mariadb") {
            DatabaseType::MySql
        } else {
            DatabaseType::Generic
        }
    }
}
