use serde::Serialize;
use tracing::trace;

use crate::error::DbError;

/// 物理连接当前所处的事务阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TransactionState {
    NoTransaction,
    LocalTransactionActive,
    GlobalTransactionActive,
    /// Coordinated by an out-of-process recovery subsystem.
    ExternalTransactionActive,
    TransactionEnding,
    HeuristicEnd,
    RecoveryInProgress,
    Failed,
}

impl TransactionState {
    pub fn name(self) -> &'static str {
        match self {
            TransactionState::NoTransaction => "NO_TX",
            TransactionState::LocalTransactionActive => "LOCAL_TX_ACTIVE",
            TransactionState::GlobalTransactionActive => "GLOBAL_TX_ACTIVE",
            TransactionState::ExternalTransactionActive => "EXTERNAL_TX_ACTIVE",
            TransactionState::TransactionEnding => "TX_ENDING",
            TransactionState::HeuristicEnd => "HEURISTIC_END",
            TransactionState::RecoveryInProgress => "RECOVERY_IN_PROGRESS",
            TransactionState::Failed => "FAILED",
        }
    }

    pub fn in_transaction(self) -> bool {
        !matches!(
            self,
            TransactionState::NoTransaction | TransactionState::Failed
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Transition {
    BeginLocal,
    CommitLocal,
    RollbackLocal,
    StartBranch,
    ResumeBranch,
    EndBranch,
    PrepareReadOnly,
    CommitBranch,
    RollbackBranch,
    HeuristicOutcome,
    ExternalBegin,
    ExternalEnd,
    MarkRecovering,
    Forget,
    Fail,
}

impl Transition {
    pub fn name(self) -> &'static str {
        match self {
            Transition::BeginLocal => "beginLocal",
            Transition::CommitLocal => "commitLocal",
            Transition::RollbackLocal => "rollbackLocal",
            Transition::StartBranch => "startBranch",
            Transition::ResumeBranch => "resumeBranch",
            Transition::EndBranch => "endBranch",
            Transition::PrepareReadOnly => "prepareReadOnly",
            Transition::CommitBranch => "commitBranch",
            Transition::RollbackBranch => "rollbackBranch",
            Transition::HeuristicOutcome => "heuristicOutcome",
            Transition::ExternalBegin => "externalBegin",
            Transition::ExternalEnd => "externalEnd",
            Transition::MarkRecovering => "markRecovering",
            Transition::Forget => "forget",
            Transition::Fail => "fail",
        }
    }
}

/// Target state of `t` from `from`, or `None` when not permitted.
pub fn next_state(from: TransactionState, t: Transition) -> Option<TransactionState> {
    use TransactionState::*;
    use Transition::*;
    match (from, t) {
        (_, Fail) => Some(Failed),
        (Failed, _) => None,
        (_, MarkRecovering) => Some(RecoveryInProgress),

        (NoTransaction, BeginLocal) => Some(LocalTransactionActive),
        (NoTransaction, StartBranch) => Some(GlobalTransactionActive),
        (NoTransaction, ExternalBegin) => Some(ExternalTransactionActive),

        (LocalTransactionActive, CommitLocal | RollbackLocal) => Some(NoTransaction),

        (GlobalTransactionActive, EndBranch) => Some(TransactionEnding),

        (TransactionEnding, ResumeBranch) => Some(GlobalTransactionActive),
        (TransactionEnding, PrepareReadOnly | CommitBranch | RollbackBranch) => {
            Some(NoTransaction)
        }
        (TransactionEnding, HeuristicOutcome) => Some(HeuristicEnd),

        (HeuristicEnd, Forget) => Some(NoTransaction),

        (ExternalTransactionActive, ExternalEnd) => Some(NoTransaction),

        (RecoveryInProgress, StartBranch) => Some(GlobalTransactionActive),
        (RecoveryInProgress, PrepareReadOnly | CommitBranch | RollbackBranch | Forget) => {
            Some(NoTransaction)
        }
        (RecoveryInProgress, HeuristicOutcome) => Some(HeuristicEnd),

        _ => None,
    }
}

#[derive(Debug, Clone)]
pub struct StateManager {
    state: TransactionState,
    last_transition: Option<Transition>,
}

impl StateManager {
    pub fn new() -> Self {
        Self {
            state: TransactionState::NoTransaction,
            last_transition: None,
        }
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn last_transition(&self) -> Option<Transition> {
        self.last_transition
    }

    pub fn is_valid(&self, t: Transition) -> bool {
        next_state(self.state, t).is_some()
    }

    pub fn check(&self, t: Transition) -> Result<(), DbError> {
        if self.is_valid(t) {
            Ok(())
        } else {
            Err(DbError::InvalidTransactionState {
                state: self.state.name(),
                operation: t.name(),
            })
        }
    }

    pub fn apply(&mut self, t: Transition) -> Result<TransactionState, DbError> {
        let next = next_state(self.state, t).ok_or(DbError::InvalidTransactionState {
            state: self.state.name(),
            operation: t.name(),
        })?;
        trace!(from = self.state.name(), to = next.name(), transition = t.name(), "transaction state change");
        self.state = next;
        self.last_transition = Some(t);
        Ok(next)
    }
}

impl Default for StateManager {
    fn default() -> Self {
        Self::new()
    }
}
