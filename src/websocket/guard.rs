use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Mutex,
};

use tokio_util::sync::CancellationToken;

use super::lock;

/// Tracks whether an operation of one kind is in flight.
///
/// At most one caller owns the slot at a time. The owner gets a child of its own
/// cancellation token, which [`OperationGuard::cancel_all`] fires when the
/// connection is aborted.
#[derive(Default)]
pub(crate) struct OperationGuard {
    outstanding: AtomicUsize,
    linked: Mutex<Option<CancellationToken>>,
    disposed: AtomicBool,
}

/// Ownership of a guard slot, released on drop.
pub(crate) struct Ticket<'a> {
    guard: &'a OperationGuard,
    token: CancellationToken,
}

impl OperationGuard {
    /// Claims the slot if nothing else holds it. Returns `None` when another
    /// operation is outstanding or the guard was disposed.
    pub fn try_start(&self, cancel: &CancellationToken) -> Option<Ticket<'_>> {
        if self.disposed.load(Ordering::Acquire) {
            return None;
        }

        if self.outstanding.fetch_add(1, Ordering::AcqRel) != 0 {
            self.complete(false);
            return None;
        }

        let token = cancel.child_token();
        *lock(&self.linked) = Some(token.clone());
        Some(Ticket { guard: self, token })
    }

    fn complete(&self, owned: bool) {
        if self.disposed.load(Ordering::Acquire) {
            return;
        }
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
        if owned {
            lock(&self.linked).take();
        }
    }

    /// Cancels the linked token of the outstanding operation, if any.
    pub fn cancel_all(&self) {
        if self.outstanding.load(Ordering::Acquire) > 0 {
            if let Some(token) = lock(&self.linked).as_ref() {
                token.cancel();
            }
        }
    }

    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        lock(&self.linked).take();
    }

    #[cfg(test)]
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }
}

impl Ticket<'_> {
    /// Token linked to the caller's token and to aborts of the connection.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for Ticket<'_> {
    fn drop(&mut self) {
        self.guard.complete(true);
    }
}
