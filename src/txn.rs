//! Nestable transaction contexts layered over the single `pmem::Pmem`
//! handle's own linear begin/commit/abort.
//!
//! The frame stack is attached explicitly to one `Pool` handle rather than
//! kept in a process-global thread-local, so there is never a question of
//! a thread already having a transaction active for a different pool --
//! the stack lives on the handle itself.
//!
//! The scoped path: commit on a clean exit, abort with the cancellation
//! errno (`ERRNO_CANCELED`) on any host exception, and swallow that exact
//! errno coming back out of `tx_end` since it is the expected echo of an
//! abort we ourselves requested.

use std::cell::RefCell;
use std::panic::{catch_unwind, AssertUnwindSafe};

use crate::cache::ObjectCache;
use crate::error::{Error, Result, ERRNO_CANCELED};
use crate::pmem::Pmem;

enum FrameKind {
    Scoped,
    Explicit,
}

/// A capability token proving a transaction is active, handed to callers
/// inside a transaction's scope. Carries no data of its own; all actual
/// work goes through `Pool`/`Pmem`, which enforce the "must have an active
/// transaction" invariant independently (defense in depth).
pub struct Transaction {
    level: usize,
}

impl Transaction {
    pub fn level(&self) -> usize {
        self.level
    }
}

/// Per-pool-handle stack of transaction frames, enforcing context
/// discipline between scoped and explicit transaction levels.
pub struct TransactionStack {
    frames: RefCell<Vec<FrameKind>>,
}

impl TransactionStack {
    pub fn new() -> Self {
        TransactionStack {
            frames: RefCell::new(Vec::new()),
        }
    }

    pub fn depth(&self) -> usize {
        self.frames.borrow().len()
    }

    /// Explicit `begin()`. The caller must close it with a matching
    /// `commit()`/`abort()` before the enclosing scope exits; failing to do
    /// so is reported as `TransactionMisuse` when the scope does exit.
    pub fn begin(&self, pmem: &Pmem) -> Transaction {
        pmem.tx_begin();
        self.frames.borrow_mut().push(FrameKind::Explicit);
        Transaction {
            level: self.depth(),
        }
    }

    pub fn commit(&self, pmem: &Pmem, cache: &ObjectCache) -> Result<()> {
        {
            let mut frames = self.frames.borrow_mut();
            match frames.last() {
                Some(FrameKind::Explicit) => {
                    frames.pop();
                }
                _ => {
                    return Err(Error::transaction_misuse(
                        "commit() called with no matching begin()",
                    ))
                }
            }
        }
        pmem.tx_commit()?;
        let end_errno = pmem.tx_end();
        if self.depth() == 0 {
            cache.promote();
        }
        if end_errno != 0 {
            return Err(Error::internal(format!(
                "tx_end returned unexpected errno {} after commit",
                end_errno
            )));
        }
        Ok(())
    }

    pub fn abort(&self, pmem: &Pmem, cache: &ObjectCache, errno: i32) -> Result<()> {
        {
            let mut frames = self.frames.borrow_mut();
            match frames.last() {
                Some(FrameKind::Explicit) => {
                    frames.pop();
                }
                _ => {
                    return Err(Error::transaction_misuse(
                        "abort() called with no matching begin()",
                    ))
                }
            }
        }
        pmem.tx_abort(errno)?;
        let end_errno = pmem.tx_end();
        if self.depth() == 0 {
            cache.discard_staged();
        }
        if end_errno != 0 && end_errno != ERRNO_CANCELED {
            return Err(Error::internal(format!(
                "tx_end returned unexpected errno {} after abort",
                end_errno
            )));
        }
        Ok(())
    }

    /// Run `f` inside its own transaction level: commit on `Ok`, abort with
    /// `ERRNO_CANCELED` on `Err` or panic.
    ///
    /// If `f` leaves an explicit `begin()` open when it returns, that is a
    /// programming error: every frame down through this scope's own is
    /// force-aborted and a `TransactionMisuse` is reported.
    pub fn scoped<R>(
        &self,
        pmem: &Pmem,
        cache: &ObjectCache,
        f: impl FnOnce(&Transaction) -> Result<R>,
    ) -> Result<R> {
        let entry_depth = self.depth();
        pmem.tx_begin();
        self.frames.borrow_mut().push(FrameKind::Scoped);
        let txn = Transaction {
            level: entry_depth + 1,
        };

        let outcome = catch_unwind(AssertUnwindSafe(|| f(&txn)));

        if self.depth() > entry_depth + 1 {
            while self.depth() > entry_depth {
                let _ = pmem.tx_abort(ERRNO_CANCELED);
                pmem.tx_end();
                self.frames.borrow_mut().pop();
            }
            if entry_depth == 0 {
                cache.discard_staged();
            }
            return match outcome {
                Err(panic_payload) => std::panic::resume_unwind(panic_payload),
                _ => Err(Error::transaction_misuse(
                    "a begin() transaction was left open across a scope exit",
                )),
            };
        }

        match outcome {
            Ok(Ok(value)) => {
                pmem.tx_commit()?;
                let end_errno = pmem.tx_end();
                self.frames.borrow_mut().pop();
                if entry_depth == 0 {
                    cache.promote();
                }
                if end_errno != 0 {
                    return Err(Error::internal(format!(
                        "tx_end returned unexpected errno {} after commit",
                        end_errno
                    )));
                }
                Ok(value)
            }
            Ok(Err(e)) => {
                let _ = pmem.tx_abort(ERRNO_CANCELED);
                let end_errno = pmem.tx_end();
                self.frames.borrow_mut().pop();
                if entry_depth == 0 {
                    cache.discard_staged();
                }
                if end_errno != 0 && end_errno != ERRNO_CANCELED {
                    return Err(Error::internal(format!(
                        "tx_end returned unexpected errno {} during abort",
                        end_errno
                    )));
                }
                Err(e)
            }
            Err(panic_payload) => {
                let _ = pmem.tx_abort(ERRNO_CANCELED);
                pmem.tx_end();
                self.frames.borrow_mut().pop();
                if entry_depth == 0 {
                    cache.discard_staged();
                }
                std::panic::resume_unwind(panic_payload);
            }
        }
    }
}

impl Default for TransactionStack {
    fn default() -> Self {
        Self::new()
    }
}
