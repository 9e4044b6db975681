pub mod value;

pub mod connection;
pub mod driver;
pub mod exception;
pub mod statement;
pub mod xa;

use std::sync::Arc;

/// 驱动调用的结果，失败时携带完整的异常链
pub type SqlResult<T> = Result<T, Arc<exception::SqlException>>;
