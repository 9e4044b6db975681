use serde::Serialize;
use std::fmt;
use std::sync::{Arc, OnceLock};

/// 驱动异常的子类型，对应 JDBC 风格的 SQLException 层级
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SqlExceptionKind {
    General,
    /// 连接失效后可通过重连恢复
    Recoverable,
    NonTransientConnection,
    TransientConnection,
    Transient,
    FeatureNotSupported,
    InvalidAuthorization,
}

/// A driver-reported failure.
///
/// `next` and `cause` are assigned after construction, the way drivers chain
/// exceptions while unwinding. Because of that a chain may contain cycles and
/// must always be walked with a visited set.
pub struct SqlException {
    message: String,
    sql_state: Option<String>,
    error_code: i32,
    kind: SqlExceptionKind,
    next: OnceLock<Arc<SqlException>>,
    cause: OnceLock<Arc<SqlException>>,
}

impl SqlException {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            sql_state: None,
            error_code: 0,
            kind: SqlExceptionKind::General,
            next: OnceLock::new(),
            cause: OnceLock::new(),
        }
    }

    pub fn sql_state(mut self, state: impl Into<String>) -> Self {
        self.sql_state = Some(state.into());
        self
    }

    pub fn error_code(mut self, code: i32) -> Self {
        self.error_code = code;
        self
    }

    pub fn kind(mut self, kind: SqlExceptionKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn build(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn state(&self) -> Option<&str> {
        self.sql_state.as_deref()
    }

    pub fn code(&self) -> i32 {
        self.error_code
    }

    pub fn exception_kind(&self) -> SqlExceptionKind {
        self.kind
    }

    pub fn next_exception(&self) -> Option<&Arc<SqlException>> {
        self.next.get()
    }

    pub fn cause(&self) -> Option<&Arc<SqlException>> {
        self.cause.get()
    }

    /// Returns `false` when a cause was already assigned.
    pub fn init_cause(&self, cause: Arc<SqlException>) -> bool {
        self.cause.set(cause).is_ok()
    }

    /// Appends to the end of the `next` chain.
    pub fn set_next_exception(&self, next: Arc<SqlException>) -> bool {
        let mut seen: Vec<*const SqlException> = vec![self as *const _];
        let mut tail = self;
        while let Some(n) = tail.next.get() {
            let ptr = Arc::as_ptr(n);
            if seen.contains(&ptr) {
                return false;
            }
            seen.push(ptr);
            tail = n.as_ref();
        }
        tail.next.set(next).is_ok()
    }
}

// Debug must not follow the links: they may form a cycle.
impl fmt::Debug for SqlException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqlException")
            .field("message", &self.message)
            .field("sql_state", &self.sql_state)
            .field("error_code", &self.error_code)
            .field("kind", &self.kind)
            .field("has_next", &self.next.get().is_some())
            .field("has_cause", &self.cause.get().is_some())
            .finish()
    }
}

impl fmt::Display for SqlException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(state) = &self.sql_state {
            write!(f, " (SQLSTATE {}", state)?;
            if self.error_code != 0 {
                write!(f, ", error code {}", self.error_code)?;
            }
            write!(f, ")")?;
        } else if self.error_code != 0 {
            write!(f, " (error code {})", self.error_code)?;
        }
        Ok(())
    }
}

impl std::error::Error for SqlException {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_chain_appends_at_tail() {
        let top = SqlException::new("top").build();
        let a = SqlException::new("a").build();
        let b = SqlException::new("b").build();
        assert!(top.set_next_exception(a.clone()));
        assert!(top.set_next_exception(b.clone()));
        let second = top.next_exception().unwrap();
        assert_eq!(second.message(), "a");
        assert_eq!(second.next_exception().unwrap().message(), "b");
    }

    #[test]
    fn test_cycle_is_refused_when_appending() {
        let a = SqlException::new("a").build();
        let b = SqlException::new("b").build();
        assert!(a.set_next_exception(b.clone()));
        assert!(b.set_next_exception(a.clone()));
        // a -> b -> a, appending again must detect the loop
        let c = SqlException::new("c").build();
        assert!(!a.set_next_exception(c));
    }

    #[test]
    fn test_display_includes_state_and_code() {
        let e = SqlException::new("connection reset")
            .sql_state("08006")
            .error_code(-4499)
            .build();
        assert_eq!(
            e.to_string(),
            "connection reset (SQLSTATE 08006, error code -4499)"
        );
    }
}
