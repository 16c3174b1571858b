use std::sync::{
    atomic::{AtomicBool, AtomicI32, Ordering},
    Arc,
};

/// Reason code fired at an in-flight simulation when a stronger bid arrives.
pub const COMMIT_INTERRUPT_BETTER_BID: i32 = 1;

/// One-shot interrupt shared between the arbiter and a single simulation
/// run. The arbiter creates a fresh token per committed bid and trips it
/// with a reason code; the simulator polls between transactions.
#[derive(Clone, Debug, Default)]
pub struct Interrupt {
    inner: Arc<InterruptState>,
}

#[derive(Debug, Default)]
struct InterruptState {
    fired: AtomicBool,
    reason: AtomicI32,
}

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    /// Trip the token. The reason is stored before the flag so a reader
    /// that observes the flag also observes the reason.
    pub fn fire(&self, reason: i32) {
        self.inner.reason.store(reason, Ordering::Release);
        self.inner.fired.store(true, Ordering::Release);
    }

    pub fn is_fired(&self) -> bool {
        self.inner.fired.load(Ordering::Acquire)
    }

    pub fn reason(&self) -> i32 {
        self.inner.reason.load(Ordering::Acquire)
    }
}
