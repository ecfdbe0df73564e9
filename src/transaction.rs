//! Transaction Binding
//!
//! Handles:
//! - The transaction contract consumed from the environment
//! - Gating deferred actions on a transaction's outcome
//! - An in-process transaction manager

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{Result, SchedError};

/// Transaction lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Active,
    MarkedRollback,
    Committed,
    RolledBack,
}

impl TransactionStatus {
    pub fn is_final(self) -> bool {
        matches!(self, TransactionStatus::Committed | TransactionStatus::RolledBack)
    }
}

/// Callback bound to a transaction's completion
pub trait Synchronization: Send {
    /// Runs once, before the outcome is decided
    fn before_completion(&mut self) {}

    /// Runs once, after the outcome is final
    fn after_completion(self: Box<Self>, status: TransactionStatus);
}

/// A unit of work operations may be scoped to.
///
/// Operations that need transactional deferral take an explicit
/// `Option<&dyn Transaction>`; `None` means "no transaction, act now".
pub trait Transaction: Send + Sync {
    fn id(&self) -> u64;

    fn status(&self) -> TransactionStatus;

    fn register_synchronization(&self, sync: Box<dyn Synchronization>) -> Result<()>;

    fn set_rollback_only(&self) -> Result<()>;

    fn commit(&self) -> Result<()>;

    fn rollback(&self) -> Result<()>;
}

pub trait TransactionManager: Send + Sync {
    fn begin(&self) -> Result<Arc<dyn Transaction>>;
}

type Action = Box<dyn FnOnce() + Send>;

/// Binds before-commit, commit and rollback actions to one transaction.
///
/// Exactly one of commit/rollback fires, once, after the outcome is final.
/// Without a transaction the commit action fires immediately on the
/// calling thread and the rollback action is dropped.
#[derive(Default)]
pub struct TransactionalGate {
    before_commit: Option<Action>,
    commit: Option<Action>,
    rollback: Option<Action>,
}

impl TransactionalGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn before_commit(mut self, action: impl FnOnce() + Send + 'static) -> Self {
        self.before_commit = Some(Box::new(action));
        self
    }

    pub fn on_commit(mut self, action: impl FnOnce() + Send + 'static) -> Self {
        self.commit = Some(Box::new(action));
        self
    }

    pub fn on_rollback(mut self, action: impl FnOnce() + Send + 'static) -> Self {
        self.rollback = Some(Box::new(action));
        self
    }

    pub fn submit(self, tx: Option<&dyn Transaction>) -> Result<()> {
        match tx {
            Some(tx) => tx.register_synchronization(Box::new(self)),
            None => {
                if let Some(commit) = self.commit {
                    commit();
                }
                Ok(())
            }
        }
    }
}

impl Synchronization for TransactionalGate {
    fn before_completion(&mut self) {
        if let Some(action) = self.before_commit.take() {
            action();
        }
    }

    fn after_completion(self: Box<Self>, status: TransactionStatus) {
        let gate = *self;
        match status {
            TransactionStatus::Committed => {
                if let Some(commit) = gate.commit {
                    commit();
                }
            }
            TransactionStatus::RolledBack => {
                if let Some(rollback) = gate.rollback {
                    rollback();
                }
            }
            other => warn!("Transaction completed with non-final status {:?}", other),
        }
    }
}

struct TxState {
    status: TransactionStatus,
    // Set once commit or rollback has claimed the outcome
    completing: bool,
    synchronizations: Vec<Box<dyn Synchronization>>,
}

/// In-process transaction, used when no external transaction manager is wired in
pub struct LocalTransaction {
    id: u64,
    state: Mutex<TxState>,
}

impl std::fmt::Debug for LocalTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTransaction")
            .field("id", &self.id)
            .field("status", &self.status())
            .finish()
    }
}

impl LocalTransaction {
    fn new(id: u64) -> Self {
        Self {
            id,
            state: Mutex::new(TxState {
                status: TransactionStatus::Active,
                completing: false,
                synchronizations: Vec::new(),
            }),
        }
    }

    fn finish(state: &mut TxState, status: TransactionStatus) -> Vec<Box<dyn Synchronization>> {
        state.status = status;
        std::mem::take(&mut state.synchronizations)
    }

    fn complete(&self, status: TransactionStatus, synchronizations: Vec<Box<dyn Synchronization>>) {
        debug!("Transaction {} completed: {:?}", self.id, status);
        // Compensations unwind newest first
        if status == TransactionStatus::RolledBack {
            for sync in synchronizations.into_iter().rev() {
                sync.after_completion(status);
            }
        } else {
            for sync in synchronizations {
                sync.after_completion(status);
            }
        }
    }
}

impl Transaction for LocalTransaction {
    fn id(&self) -> u64 {
        self.id
    }

    fn status(&self) -> TransactionStatus {
        self.state.lock().status
    }

    fn register_synchronization(&self, sync: Box<dyn Synchronization>) -> Result<()> {
        let mut state = self.state.lock();
        match state.status {
            TransactionStatus::Active | TransactionStatus::MarkedRollback => {
                state.synchronizations.push(sync);
                Ok(())
            }
            status => Err(SchedError::transaction(format!(
                "Cannot register synchronization on transaction {} in state {:?}",
                self.id, status
            ))),
        }
    }

    fn set_rollback_only(&self) -> Result<()> {
        let mut state = self.state.lock();
        match state.status {
            TransactionStatus::Active | TransactionStatus::MarkedRollback => {
                state.status = TransactionStatus::MarkedRollback;
                Ok(())
            }
            status => Err(SchedError::transaction(format!(
                "Transaction {} is {:?}",
                self.id, status
            ))),
        }
    }

    fn commit(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            if state.completing {
                let reason = if state.status.is_final() { "complete" } else { "completing" };
                return Err(SchedError::transaction(format!(
                    "Cannot commit transaction {}, it is already {} ({:?})",
                    self.id, reason, state.status
                )));
            }
            let status = state.status;
            match status {
                TransactionStatus::Active => state.completing = true,
                TransactionStatus::MarkedRollback => {
                    state.completing = true;
                    let synchronizations = Self::finish(&mut state, TransactionStatus::RolledBack);
                    drop(state);
                    self.complete(TransactionStatus::RolledBack, synchronizations);
                    return Err(SchedError::transaction(format!(
                        "Transaction {} was marked rollback-only and has been rolled back",
                        self.id
                    )));
                }
                status => {
                    return Err(SchedError::transaction(format!(
                        "Cannot commit transaction {} in state {:?}",
                        self.id, status
                    )))
                }
            }
        }

        // Hooks may register further synchronizations or mark the transaction
        // rollback-only, so drain until nothing new shows up.
        let mut prepared: Vec<Box<dyn Synchronization>> = Vec::new();
        loop {
            let mut batch = std::mem::take(&mut self.state.lock().synchronizations);
            if batch.is_empty() {
                break;
            }
            for sync in batch.iter_mut() {
                sync.before_completion();
            }
            prepared.append(&mut batch);
        }

        let (outcome, synchronizations) = {
            let mut state = self.state.lock();
            state.synchronizations = prepared;
            let outcome = if state.status == TransactionStatus::MarkedRollback {
                TransactionStatus::RolledBack
            } else {
                TransactionStatus::Committed
            };
            (outcome, Self::finish(&mut state, outcome))
        };
        self.complete(outcome, synchronizations);

        if outcome == TransactionStatus::RolledBack {
            return Err(SchedError::transaction(format!(
                "Transaction {} was marked rollback-only during commit",
                self.id
            )));
        }
        Ok(())
    }

    fn rollback(&self) -> Result<()> {
        let synchronizations = {
            let mut state = self.state.lock();
            if state.completing {
                return Err(SchedError::transaction(format!(
                    "Cannot roll back transaction {} in state {:?}, its outcome is already claimed",
                    self.id, state.status
                )));
            }
            state.completing = true;
            Self::finish(&mut state, TransactionStatus::RolledBack)
        };
        self.complete(TransactionStatus::RolledBack, synchronizations);
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct LocalTransactionManager {
    next_id: AtomicU64,
}

impl LocalTransactionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin_local(&self) -> Arc<LocalTransaction> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        Arc::new(LocalTransaction::new(id))
    }
}

impl TransactionManager for LocalTransactionManager {
    fn begin(&self) -> Result<Arc<dyn Transaction>> {
        Ok(self.begin_local())
    }
}
