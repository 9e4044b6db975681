use crate::udbc::SqlResult;
use crate::udbc::connection::Holdability;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum StatementKind {
    Prepared,
    Callable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ResultSetType {
    ForwardOnly,
    ScrollInsensitive,
    ScrollSensitive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ResultSetConcurrency {
    ReadOnly,
    Updatable,
}

/// 自增主键返回方式
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum GeneratedKeys {
    None,
    Auto,
    ColumnIndexes(Vec<u32>),
    ColumnNames(Vec<String>),
}

/// Identifies a statement shape: two keys are equal only when the SQL text
/// and every shape parameter agree.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct StatementKey {
    pub sql: String,
    pub kind: StatementKind,
    pub result_set_type: ResultSetType,
    pub concurrency: ResultSetConcurrency,
    pub holdability: Option<Holdability>,
    pub generated_keys: GeneratedKeys,
    pub catalog: Option<String>,
    pub schema: Option<String>,
}

impl StatementKey {
    pub fn prepared(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            kind: StatementKind::Prepared,
            result_set_type: ResultSetType::ForwardOnly,
            concurrency: ResultSetConcurrency::ReadOnly,
            holdability: None,
            generated_keys: GeneratedKeys::None,
            catalog: None,
            schema: None,
        }
    }

    pub fn callable(sql: impl Into<String>) -> Self {
        Self {
            kind: StatementKind::Callable,
            ..Self::prepared(sql)
        }
    }

    pub fn result_set(mut self, t: ResultSetType, c: ResultSetConcurrency) -> Self {
        self.result_set_type = t;
        self.concurrency = c;
        self
    }

    pub fn holdability(mut self, h: Holdability) -> Self {
        self.holdability = Some(h);
        self
    }

    pub fn generated_keys(mut self, g: GeneratedKeys) -> Self {
        self.generated_keys = g;
        self
    }

    pub fn catalog(mut self, catalog: impl Into<String>) -> Self {
        self.catalog = Some(catalog.into());
        self
    }

    pub fn schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }
}

pub trait Statement: Send {
    fn close(&mut self) -> SqlResult<()>;

    fn is_closed(&self) -> bool;
}
