//! Selection of a reusable idle connection for a request.

use crate::descriptor::ConnectionRequestInfo;
use crate::managed::ManagedConnection;

/// 匹配结果，携带候选连接的下标
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchOutcome {
    /// Serves the request as is.
    Equal(usize),
    /// Same identity; properties are pushed to the driver before reuse.
    Reconfigure(usize),
    Declined,
}

impl MatchOutcome {
    pub fn index(self) -> Option<usize> {
        match self {
            MatchOutcome::Equal(i) | MatchOutcome::Reconfigure(i) => Some(i),
            MatchOutcome::Declined => None,
        }
    }
}

/// Whether `mc` may be handed out at all. Connections with bound handles,
/// stale ones, and ones opened before the latest fatal error are skipped.
pub fn is_candidate(mc: &ManagedConnection, fatal_errors: u64) -> bool {
    mc.handle_count() == 0
        && !mc.is_stale()
        && !mc.is_destroyed()
        && !mc.state().in_transaction()
        && mc.fatal_error_snapshot() >= fatal_errors
}

/// Picks a connection for `cri`, preferring one that matches without any
/// reconfiguration.
pub fn select<'a, I>(candidates: I, cri: &ConnectionRequestInfo, fatal_errors: u64) -> MatchOutcome
where
    I: IntoIterator<Item = &'a ManagedConnection>,
{
    let mut fallback = None;
    for (i, mc) in candidates.into_iter().enumerate() {
        if !is_candidate(mc, fatal_errors) {
            continue;
        }
        if mc.matches(cri) {
            return MatchOutcome::Equal(i);
        }
        if fallback.is_none() && mc.requested().is_reconfigurable(cri) {
            fallback = Some(i);
        }
    }
    fallback.map_or(MatchOutcome::Declined, MatchOutcome::Reconfigure)
}
