use crate::error::DbError;
use crate::models::db_type::DatabaseType;
use crate::udbc::connection::PhysicalConnection;
use crate::udbc::xa::XaResource;
use std::sync::Arc;

/// 驱动建立的一条物理连接，XA 能力可选
pub struct DriverConnection {
    pub connection: Box<dyn PhysicalConnection>,
    pub xa: Option<Arc<dyn XaResource>>,
}

pub trait Driver: Send + Sync {
    fn name(&self) -> &str;

    fn database_type(&self) -> DatabaseType;

    /// Opens a new physical connection authenticated as `user`.
    fn connect(&self, user: Option<&str>, password: Option<&str>) -> Result<DriverConnection, DbError>;
}
