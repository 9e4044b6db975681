use crate::udbc::SqlResult;
use crate::udbc::statement::{Statement, StatementKey};
use crate::udbc::value::ShardingKey;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IsolationLevel {
    None,
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Holdability {
    HoldCursorsOverCommit,
    CloseCursorsAtCommit,
}

/// SQL 用户自定义类型名 -> 映射类型名
pub type TypeMap = BTreeMap<String, String>;

/// One physical connection as handed out by the driver.
///
/// Getters and setters go straight to the driver. Implementations report
/// failures as [`SqlException`](crate::udbc::exception::SqlException) so
/// the classifier can inspect vendor state and code.
pub trait PhysicalConnection: Send {
    fn auto_commit(&self) -> SqlResult<bool>;
    fn set_auto_commit(&mut self, on: bool) -> SqlResult<()>;

    fn isolation(&self) -> SqlResult<IsolationLevel>;
    fn set_isolation(&mut self, level: IsolationLevel) -> SqlResult<()>;

    fn catalog(&self) -> SqlResult<Option<String>>;
    fn set_catalog(&mut self, catalog: &str) -> SqlResult<()>;

    fn schema(&self) -> SqlResult<Option<String>>;
    fn set_schema(&mut self, schema: &str) -> SqlResult<()>;

    fn read_only(&self) -> SqlResult<bool>;
    fn set_read_only(&mut self, read_only: bool) -> SqlResult<()>;

    fn type_map(&self) -> SqlResult<TypeMap>;
    fn set_type_map(&mut self, map: &TypeMap) -> SqlResult<()>;

    fn holdability(&self) -> SqlResult<Holdability>;
    fn set_holdability(&mut self, h: Holdability) -> SqlResult<()>;

    fn set_sharding_keys(
        &mut self,
        key: Option<&ShardingKey>,
        super_key: Option<&ShardingKey>,
    ) -> SqlResult<()>;

    /// Milliseconds, 0 means no timeout.
    fn network_timeout(&self) -> SqlResult<u32>;
    fn set_network_timeout(&mut self, millis: u32) -> SqlResult<()>;

    fn prepare_statement(&mut self, key: &StatementKey) -> SqlResult<Box<dyn Statement>>;

    fn commit(&mut self) -> SqlResult<()>;
    fn rollback(&mut self) -> SqlResult<()>;

    fn is_valid(&mut self, timeout_secs: u32) -> SqlResult<bool>;

    fn close(&mut self) -> SqlResult<()>;
}
