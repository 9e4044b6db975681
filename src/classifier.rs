//! Maps driver exceptions to the categories the pool acts on.
//!
//! Lookup order for every exception in the chain is `(state, code)`, then
//! `code`, then `state` in the user override table; the first hit decides
//! the category outright. Without an override the built-in vendor
//! heuristics apply. Classification never fails and has no side effects.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::{XaError, XaErrorCode};
use crate::models::db_config::IdentifyException;
use crate::udbc::exception::{SqlException, SqlExceptionKind};
use crate::vendor::VendorCapabilities;

/// Upper bound on links followed through `next` and `cause` chains.
pub const DEFAULT_MAX_CHAIN_DEPTH: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCategory {
    None,
    StaleConnection,
    StaleStatement,
    Unsupported,
    Authorization,
}

impl ErrorCategory {
    pub fn parse(s: &str) -> Option<ErrorCategory> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Some(ErrorCategory::None),
            "staleconnection" | "stale_connection" => Some(ErrorCategory::StaleConnection),
            "stalestatement" | "stale_statement" => Some(ErrorCategory::StaleStatement),
            "unsupported" => Some(ErrorCategory::Unsupported),
            "authorization" => Some(ErrorCategory::Authorization),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum OverrideKey {
    StateAndCode(String, i32),
    Code(i32),
    State(String),
}

/// 用户配置的异常分类覆盖表
#[derive(Debug, Clone, Default)]
pub struct OverrideTable {
    entries: HashMap<OverrideKey, ErrorCategory>,
}

impl OverrideTable {
    pub fn new(entries: &[IdentifyException]) -> Self {
        let mut map = HashMap::with_capacity(entries.len());
        for e in entries {
            let key = match (&e.sql_state, e.error_code) {
                (Some(s), Some(c)) => OverrideKey::StateAndCode(s.clone(), c),
                (None, Some(c)) => OverrideKey::Code(c),
                (Some(s), None) => OverrideKey::State(s.clone()),
                (None, None) => continue,
            };
            map.insert(key, e.category);
        }
        Self { entries: map }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn lookup(&self, state: Option<&str>, code: i32) -> Option<ErrorCategory> {
        if self.entries.is_empty() {
            return None;
        }
        if let Some(s) = state {
            if let Some(c) = self
                .entries
                .get(&OverrideKey::StateAndCode(s.to_string(), code))
            {
                return Some(*c);
            }
        }
        if let Some(c) = self.entries.get(&OverrideKey::Code(code)) {
            return Some(*c);
        }
        state.and_then(|s| self.entries.get(&OverrideKey::State(s.to_string())).copied())
    }
}

/// Collects the distinct exceptions reachable through `next` and `cause`
/// links, breadth first, stopping after `max` entries.
pub fn exception_chain(top: &SqlException, max: usize) -> Vec<&SqlException> {
    let mut out = Vec::new();
    let mut seen: HashSet<*const SqlException> = HashSet::new();
    let mut queue: VecDeque<&SqlException> = VecDeque::new();
    queue.push_back(top);
    while let Some(e) = queue.pop_front() {
        if out.len() >= max {
            break;
        }
        if !seen.insert(e as *const SqlException) {
            continue;
        }
        out.push(e);
        if let Some(n) = e.next_exception() {
            queue.push_back(n.as_ref());
        }
        if let Some(c) = e.cause() {
            queue.push_back(c.as_ref());
        }
    }
    out
}

pub struct ExceptionClassifier {
    overrides: OverrideTable,
    vendor: Arc<VendorCapabilities>,
    max_depth: usize,
}

impl ExceptionClassifier {
    pub fn new(overrides: &[IdentifyException], vendor: Arc<VendorCapabilities>) -> Self {
        Self {
            overrides: OverrideTable::new(overrides),
            vendor,
            max_depth: DEFAULT_MAX_CHAIN_DEPTH,
        }
    }

    pub fn max_depth(mut self, depth: usize) -> Self {
        self.max_depth = depth.max(1);
        self
    }

    pub fn vendor(&self) -> &VendorCapabilities {
        &self.vendor
    }

    /// The category declared by the override table for the first exception
    /// in the chain that has one.
    pub fn find_override(&self, ex: &SqlException) -> Option<ErrorCategory> {
        if self.overrides.is_empty() {
            return None;
        }
        exception_chain(ex, self.max_depth)
            .into_iter()
            .find_map(|e| self.overrides.lookup(e.state(), e.code()))
    }

    pub fn classify(&self, ex: &SqlException) -> ErrorCategory {
        if let Some(c) = self.find_override(ex) {
            trace!(category = ?c, state = ?ex.state(), code = ex.code(), "override matched");
            return c;
        }
        if self.default_stale_connection(ex) {
            ErrorCategory::StaleConnection
        } else if self.default_stale_statement(ex) {
            ErrorCategory::StaleStatement
        } else if self.default_authorization(ex) {
            ErrorCategory::Authorization
        } else if self.default_unsupported(ex) {
            ErrorCategory::Unsupported
        } else {
            ErrorCategory::None
        }
    }

    pub fn classify_xa(&self, err: &XaError) -> ErrorCategory {
        if let Some(src) = err.source_exception() {
            if let Some(c) = self.find_override(src) {
                return c;
            }
        }
        if err.code == XaErrorCode::RmFail {
            return ErrorCategory::StaleConnection;
        }
        err.source_exception()
            .map(|src| self.classify(src))
            .unwrap_or(ErrorCategory::None)
    }

    pub fn is_stale_connection(&self, ex: &SqlException) -> bool {
        match self.find_override(ex) {
            Some(c) => c == ErrorCategory::StaleConnection,
            None => self.default_stale_connection(ex),
        }
    }

    pub fn is_stale_statement(&self, ex: &SqlException) -> bool {
        match self.find_override(ex) {
            Some(c) => c == ErrorCategory::StaleStatement,
            None => self.default_stale_statement(ex),
        }
    }

    pub fn is_unsupported(&self, ex: &SqlException) -> bool {
        match self.find_override(ex) {
            Some(c) => c == ErrorCategory::Unsupported,
            None => self.default_unsupported(ex),
        }
    }

    pub fn is_authorization_error(&self, ex: &SqlException) -> bool {
        match self.find_override(ex) {
            Some(c) => c == ErrorCategory::Authorization,
            None => self.default_authorization(ex),
        }
    }

    fn default_stale_connection(&self, ex: &SqlException) -> bool {
        match ex.exception_kind() {
            SqlExceptionKind::Recoverable | SqlExceptionKind::NonTransientConnection => {
                return true;
            }
            SqlExceptionKind::TransientConnection | SqlExceptionKind::Transient => {
                if (self.vendor.failover_occurred)(ex) {
                    return true;
                }
            }
            _ => {}
        }
        let by_state = ex
            .state()
            .is_some_and(|s| self.vendor.stale_connection_states.contains(s));
        by_state || (ex.code() != 0 && self.vendor.stale_connection_codes.contains(&ex.code()))
    }

    fn default_stale_statement(&self, ex: &SqlException) -> bool {
        let by_state = ex
            .state()
            .is_some_and(|s| self.vendor.stale_statement_states.contains(s));
        by_state || (ex.code() != 0 && self.vendor.stale_statement_codes.contains(&ex.code()))
    }

    fn default_unsupported(&self, ex: &SqlException) -> bool {
        ex.exception_kind() == SqlExceptionKind::FeatureNotSupported
            || ex.state().is_some_and(|s| s.starts_with("0A"))
            || (ex.code() != 0 && self.vendor.unsupported_codes.contains(&ex.code()))
    }

    fn default_authorization(&self, ex: &SqlException) -> bool {
        exception_chain(ex, self.max_depth).into_iter().any(|e| {
            e.exception_kind() == SqlExceptionKind::InvalidAuthorization
                || e.state().is_some_and(|s| s.starts_with("28"))
        })
    }
}
