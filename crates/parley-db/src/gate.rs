use std::sync::atomic::{AtomicU8, Ordering};

const PENDING: u8 = 0;
const COMMITTING: u8 = 1;
const CANCELLED: u8 = 2;

/// One-shot handshake between a blocking write and the caller waiting on it.
///
/// The write claims the gate right before it commits; the caller cancels it
/// when it stops waiting. Exactly one of the two wins, so a write the caller
/// gave up on never becomes durable, and a write that did commit is never
/// reported as failed.
#[derive(Debug, Default)]
pub struct CommitGate {
    state: AtomicU8,
}

impl CommitGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called by the write just before committing. False means the caller
    /// has cancelled and the write must roll back.
    pub fn try_commit(&self) -> bool {
        self.state
            .compare_exchange(PENDING, COMMITTING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Called by the waiting side. False means the write already claimed the
    /// gate and its outcome has to be awaited.
    pub fn cancel(&self) -> bool {
        self.state
            .compare_exchange(PENDING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}
