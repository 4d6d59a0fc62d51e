//! Reserved-slot NV interface backing DA persistence and audit state.
//!
//! Grounded on `NvWriteReserved`/`NvIsAvailable`, referenced throughout
//! `SessionProcess.c` and `CommandAudit.c` for exactly the handful of
//! persistent values this crate also needs to persist: failed-tries,
//! lockout-auth-enabled, the audited-command bitmap, and the audit hash
//! algorithm.

use crate::da::DaMutation;

/// The reserved NV slots this crate actually writes. The original's
/// `NV_FAILED_TRIES`/`NV_LOCKOUT_AUTH_ENABLED`/`NV_AUDIT_COMMANDS`/
/// `NV_AUDIT_HASH_ALG`/`NV_AUDIT_COUNTER` constants name many more slots
/// than this crate's scope touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ReservedSlot {
    FailedTries,
    LockoutAuthEnabled,
    AuditCommands,
    AuditHashAlg,
}

/// `NvIsAvailable` plus `NvWriteReserved`, narrowed to the reserved slots
/// this crate persists.
pub trait NvStore {
    /// `NvIsAvailable`: `false` simulates NV being temporarily busy or
    /// nearing its write-cycle budget, the condition that makes
    /// `IncrementLockout`/`CheckLockedOut` defer writes.
    fn is_available(&self) -> bool;

    fn write_reserved(&mut self, slot: ReservedSlot, value: &[u8]);

    fn read_reserved(&self, slot: ReservedSlot) -> Option<Vec<u8>>;

    /// Applies a drained [`DaMutation`] log to the store, the caller's side
    /// of `CheckLockedOut`'s pending-write flush.
    fn apply_da_mutations(&mut self, mutations: &[DaMutation]) {
        for mutation in mutations {
            match *mutation {
                DaMutation::FailedTries(count) => {
                    self.write_reserved(ReservedSlot::FailedTries, &count.to_be_bytes());
                }
                DaMutation::LockoutAuthEnabled(enabled) => {
                    self.write_reserved(ReservedSlot::LockoutAuthEnabled, &[u8::from(enabled)]);
                }
            }
        }
    }
}

/// In-memory reserved-slot store. Always available unless told otherwise,
/// so tests can exercise the NV-unavailable path deliberately.
#[derive(Debug, Default)]
pub struct SimNvStore {
    slots: std::collections::BTreeMap<ReservedSlot, Vec<u8>>,
    available: bool,
}

impl SimNvStore {
    #[must_use]
    pub fn new() -> Self {
        SimNvStore { slots: std::collections::BTreeMap::new(), available: true }
    }

    pub fn set_available(&mut self, available: bool) {
        self.available = available;
    }
}

impl NvStore for SimNvStore {
    fn is_available(&self) -> bool {
        self.available
    }

    fn write_reserved(&mut self, slot: ReservedSlot, value: &[u8]) {
        self.slots.insert(slot, value.to_vec());
    }

    fn read_reserved(&self, slot: ReservedSlot) -> Option<Vec<u8>> {
        self.slots.get(&slot).cloned()
    }
}
