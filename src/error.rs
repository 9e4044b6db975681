use crate::udbc::exception::SqlException;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Represents errors raised by the pooling and transaction layer.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("General error: {0}")]
    General(String),
    #[error("Driver error: {0}")]
    Driver(#[source] Arc<SqlException>),
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Invalid transaction state: {operation} is not allowed in {state}")]
    InvalidTransactionState {
        state: &'static str,
        operation: &'static str,
    },
    #[error("Connection request descriptor is immutable")]
    DescriptorImmutable,
    #[error("Cannot change connection properties while {0} handle(s) are active")]
    HandlesActive(usize),
    #[error("Authorization error: {0}")]
    Authorization(#[source] Arc<SqlException>),
    #[error("XA error: {0}")]
    Xa(#[from] XaError),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Unsupported database type: {0}")]
    UnsupportedDatabaseType(String),
    #[error("Managed connection {0} has been destroyed")]
    Destroyed(u64),
}

impl From<Arc<SqlException>> for DbError {
    fn from(e: Arc<SqlException>) -> Self {
        DbError::Driver(e)
    }
}

impl DbError {
    /// The driver exception behind this error, if any.
    pub fn sql_exception(&self) -> Option<&Arc<SqlException>> {
        match self {
            DbError::Driver(e) | DbError::Authorization(e) => Some(e),
            DbError::Xa(x) => x.source_exception(),
            _ => None,
        }
    }
}

/// X/Open XA return codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(i32)]
pub enum XaErrorCode {
    RbRollback = 100,
    RbCommFail = 101,
    RbDeadlock = 102,
    RbIntegrity = 103,
    RbOther = 104,
    RbProto = 105,
    RbTimeout = 106,
    RbTransient = 107,
    NoMigrate = 9,
    HeurHazard = 8,
    HeurCommit = 7,
    HeurRollback = 6,
    HeurMixed = 5,
    Retry = 4,
    ReadOnly = 3,
    Async = -2,
    RmError = -3,
    NoSuchBranch = -4,
    Invalid = -5,
    Protocol = -6,
    RmFail = -7,
    DuplicateId = -8,
    Outside = -9,
}

impl XaErrorCode {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn is_rollback(self) -> bool {
        (100..=107).contains(&self.code())
    }

    pub fn is_heuristic(self) -> bool {
        matches!(
            self,
            XaErrorCode::HeurHazard
                | XaErrorCode::HeurCommit
                | XaErrorCode::HeurRollback
                | XaErrorCode::HeurMixed
        )
    }
}

impl fmt::Display for XaErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            XaErrorCode::RbRollback => "XA_RBROLLBACK",
            XaErrorCode::RbCommFail => "XA_RBCOMMFAIL",
            XaErrorCode::RbDeadlock => "XA_RBDEADLOCK",
            XaErrorCode::RbIntegrity => "XA_RBINTEGRITY",
            XaErrorCode::RbOther => "XA_RBOTHER",
            XaErrorCode::RbProto => "XA_RBPROTO",
            XaErrorCode::RbTimeout => "XA_RBTIMEOUT",
            XaErrorCode::RbTransient => "XA_RBTRANSIENT",
            XaErrorCode::NoMigrate => "XA_NOMIGRATE",
            XaErrorCode::HeurHazard => "XA_HEURHAZ",
            XaErrorCode::HeurCommit => "XA_HEURCOM",
            XaErrorCode::HeurRollback => "XA_HEURRB",
            XaErrorCode::HeurMixed => "XA_HEURMIX",
            XaErrorCode::Retry => "XA_RETRY",
            XaErrorCode::ReadOnly => "XA_RDONLY",
            XaErrorCode::Async => "XAER_ASYNC",
            XaErrorCode::RmError => "XAER_RMERR",
            XaErrorCode::NoSuchBranch => "XAER_NOTA",
            XaErrorCode::Invalid => "XAER_INVAL",
            XaErrorCode::Protocol => "XAER_PROTO",
            XaErrorCode::RmFail => "XAER_RMFAIL",
            XaErrorCode::DuplicateId => "XAER_DUPID",
            XaErrorCode::Outside => "XAER_OUTSIDE",
        };
        write!(f, "{}({})", name, self.code())
    }
}

/// Failure of a two-phase-commit operation.
#[derive(Error, Debug, Clone)]
#[error("{code}: {message}")]
pub struct XaError {
    pub code: XaErrorCode,
    pub message: String,
    #[source]
    pub source: Option<Arc<SqlException>>,
}

impl XaError {
    pub fn new(code: XaErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(mut self, source: Arc<SqlException>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn source_exception(&self) -> Option<&Arc<SqlException>> {
        self.source.as_ref()
    }
}
