//! Binder transaction matching tables.
//!
//! A synchronous transaction shows up as a CALL on the client thread and, some
//! number of events later, a REPLY on whichever pool thread serviced it. The
//! call is parked as a [`PendingTransaction`] until the reply arrives; the
//! matched pair is then parked as a [`CompletedTransaction`] until the thread
//! it was addressed to is switched in. ASYNC calls have no reply half and go
//! straight to the completed table.
//!
//! Both tables are searched most recent first.

use crate::event::BinderCall;
use crate::pid::PidClassifier;
use crate::task::TaskRef;

/// Threads a transaction half may be delivered to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetPids {
    Thread(u32),
    /// The kernel had not picked a thread yet: any pool thread of the
    /// destination process.
    AnyOf(Vec<u32>),
}

impl TargetPids {
    /// `dest_thread` when the kernel resolved it, otherwise the binder pool
    /// of `dest_pid`.
    pub fn resolve(
        dest_thread: u32,
        dest_pid: u32,
        classifier: &dyn PidClassifier,
    ) -> Option<Self> {
        if dest_thread != 0 {
            return Some(TargetPids::Thread(dest_thread));
        }
        classifier
            .binder_children(dest_pid)
            .filter(|children| !children.is_empty())
            .map(TargetPids::AnyOf)
    }

    pub fn contains(&self, pid: u32) -> bool {
        match self {
            TargetPids::Thread(thread) => *thread == pid,
            TargetPids::AnyOf(pids) => pids.contains(&pid),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PendingTransaction {
    pub send: BinderCall,
    /// Task of the client thread when it issued the call.
    pub caller: Option<TaskRef>,
    pub target: TargetPids,
}

impl PendingTransaction {
    /// A reply from `pid` answers this call if `pid` is one of the candidate
    /// threads or the destination process itself.
    pub fn answered_by(&self, pid: u32) -> bool {
        self.target.contains(pid) || self.send.dest_pid == pid
    }
}

#[derive(Debug, Clone)]
pub struct CompletedTransaction {
    pub send: BinderCall,
    /// Reply half, `None` for ASYNC transactions.
    pub recv: Option<BinderCall>,
    pub caller: Option<TaskRef>,
    /// Binder node emitted when the reply matched.
    pub node: Option<TaskRef>,
    /// Thread(s) whose next switch-in consumes this transaction.
    pub target: TargetPids,
}

impl CompletedTransaction {
    pub fn is_async(&self) -> bool {
        self.recv.is_none()
    }
}

#[derive(Debug, Default)]
pub struct TransactionTable {
    pending: Vec<PendingTransaction>,
    completed: Vec<CompletedTransaction>,
}

impl TransactionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_pending(&mut self, transaction: PendingTransaction) {
        self.pending.push(transaction);
    }

    pub fn add_completed(&mut self, transaction: CompletedTransaction) {
        self.completed.push(transaction);
    }

    /// Remove and return the most recent pending call answered by `pid`.
    pub fn match_reply(&mut self, pid: u32) -> Option<PendingTransaction> {
        // TODO: index pending calls by candidate pid, this is a linear scan
        // per reply
        let idx = self.pending.iter().rposition(|p| p.answered_by(pid))?;
        Some(self.pending.remove(idx))
    }

    /// Remove and return the most recent completed transaction addressed to
    /// `pid`.
    pub fn take_completed_for(&mut self, pid: u32) -> Option<CompletedTransaction> {
        let idx = self.completed.iter().rposition(|c| c.target.contains(pid))?;
        Some(self.completed.remove(idx))
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn completed_len(&self) -> usize {
        self.completed.len()
    }
}
