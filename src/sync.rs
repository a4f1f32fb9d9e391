//! Opportunistic data resynchronization hook.

/// Fire-and-forget resync trigger, invoked after a successful unlock and on
/// return to foreground while unlocked. Best-effort refresh only: failures
/// are the implementation's concern and never affect the lock state machine.
pub trait SyncTrigger: Send + Sync {
    fn trigger_sync(&self);
}

/// Trigger for shells without a sync engine
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSync;

impl SyncTrigger for NoopSync {
    fn trigger_sync(&self) {}
}
