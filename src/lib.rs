pub mod classifier;
pub mod config_loader;
pub mod descriptor;
pub mod error;
pub mod managed;
pub mod matching;
pub mod models;
pub mod pool;
pub mod pool_manager;
pub mod statement_cache;
pub mod transaction;
pub mod udbc;
pub mod vendor;

pub use descriptor::ConnectionRequestInfo;
pub use error::{DbError, XaError, XaErrorCode};
pub use managed::handle::ConnectionHandle;
pub use pool::ConnectionPool;
pub use pool_manager::{DB, pool_mgr};
