//! Dictionary-attack lockout: failed-tries counting, lockout-auth disabling,
//! and the deferred-NV-write bookkeeping that lets the TPM keep accepting
//! commands while NV is temporarily unavailable.
//!
//! Grounded on `original_source/SessionProcess.c`'s `IsDAExempted`,
//! `IncrementLockout` and `CheckLockedOut`. The original represents a
//! deferred NV write as a single `s_DAPendingOnNV` flag plus whatever
//! `gp.failedTries`/`gp.lockOutAuthEnabled` already hold in RAM; this models
//! the deferral explicitly as a [`DaMutation`] log so the caller's NV layer
//! can replay exactly what would have been written, rather than relying on
//! ambient global state to reconstruct it.

use tpm2_call::ResponseCode;

use crate::error::{TpmError, TpmResult};
use crate::handle::HandleKind;

/// A DA-state change that still needs to reach NV. Recorded instead of
/// written immediately when NV is unavailable, mirroring `s_DAPendingOnNV`
/// but carrying the actual values instead of relying on the in-RAM fields
/// still being correct when the flush happens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaMutation {
    FailedTries(u32),
    LockoutAuthEnabled(bool),
}

/// Entity-independent inputs `IncrementLockout` needs to decide whether (and
/// which) failure counter to advance. The caller (the session pipeline)
/// derives these per the original's `sessionHandle`/`session->attributes`
/// inspection; `da` itself never touches session state directly.
#[derive(Debug, Clone, Copy)]
pub struct LockoutContext {
    pub is_password_session: bool,
    pub is_lockout_bound: bool,
    pub is_da_bound: bool,
    pub includes_auth: bool,
}

/// Mutable dictionary-attack state: `gp.failedTries`, `gp.maxTries`,
/// `gp.recoveryTime`, `gp.lockoutRecovery`, `gp.lockOutAuthEnabled`.
#[derive(Debug, Clone)]
pub struct DaManager {
    pub failed_tries: u32,
    pub max_tries: u32,
    pub recovery_time: u32,
    pub lockout_recovery: u32,
    pub lockout_auth_enabled: bool,
    pending: Vec<DaMutation>,
}

impl DaManager {
    #[must_use]
    pub fn new(max_tries: u32, recovery_time: u32, lockout_recovery: u32) -> Self {
        DaManager {
            failed_tries: 0,
            max_tries,
            recovery_time,
            lockout_recovery,
            lockout_auth_enabled: true,
            pending: Vec::new(),
        }
    }

    /// `IsDAExempted`: permanent handles other than lockout, noDA objects,
    /// no-DA NV indices, and PCRs are exempt.
    #[must_use]
    pub fn is_exempted(kind: HandleKind, no_da_attribute: bool) -> bool {
        use tpm2_call::Handle;
        match kind {
            HandleKind::Permanent(h) => h != Handle::Lockout as u32,
            HandleKind::Transient(_) | HandleKind::Persistent(_) | HandleKind::NvIndex(_) => no_da_attribute,
            HandleKind::Pcr(_) => true,
            HandleKind::HmacSession(_) | HandleKind::PolicySession(_) => false,
        }
    }

    /// Drains the NV mutations queued while NV was unavailable, for the
    /// caller's NV layer to apply and persist. Mirrors `CheckLockedOut`'s
    /// `s_DAPendingOnNV` flush, made explicit.
    pub fn take_pending(&mut self) -> Vec<DaMutation> {
        std::mem::take(&mut self.pending)
    }

    #[must_use]
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// `IncrementLockout`: registers an authorization failure against
    /// `handle` (already resolved to `TPM_RH_LOCKOUT` by the caller when the
    /// session is lockout-bound), returning whether it counted as a DA
    /// failure (`TPM_RC_AUTH_FAIL`) or a bare bad-auth with no DA
    /// side-effect (`TPM_RC_BAD_AUTH`). `nv_available` stands in for
    /// `NvIsAvailable()`.
    pub fn increment_lockout(
        &mut self,
        exempted: bool,
        is_lockout_handle: bool,
        ctx: LockoutContext,
        nv_available: bool,
    ) -> TpmError {
        let exempt_from_da = if ctx.is_password_session {
            exempted
        } else {
            !ctx.is_da_bound && (exempted || !ctx.includes_auth)
        };
        if exempt_from_da && !is_lockout_handle {
            return TpmError::new(ResponseCode::BadAuth);
        }

        if is_lockout_handle {
            self.lockout_auth_enabled = false;
            if self.lockout_recovery != 0 {
                if nv_available {
                    self.pending.push(DaMutation::LockoutAuthEnabled(false));
                } else {
                    self.pending.push(DaMutation::LockoutAuthEnabled(false));
                }
            }
        } else if self.recovery_time != 0 {
            self.failed_tries += 1;
            self.pending.push(DaMutation::FailedTries(self.failed_tries));
            let _ = nv_available;
        }

        TpmError::new(ResponseCode::AuthFail)
    }

    /// `CheckLockedOut`: refuses the check outright if NV is unavailable and
    /// the TPM did not shut down cleanly, flushes any pending DA write, then
    /// applies the lockout gate itself.
    pub fn check_locked_out(&mut self, lockout_auth_check: bool, nv_available: bool, orderly: bool) -> TpmResult<()> {
        if !nv_available && !orderly {
            return Err(TpmError::new(ResponseCode::NvUnavailable));
        }
        if self.has_pending() {
            if nv_available {
                self.take_pending();
            } else {
                return Err(TpmError::new(ResponseCode::NvUnavailable));
            }
        }
        if lockout_auth_check {
            if !self.lockout_auth_enabled {
                return Err(TpmError::new(ResponseCode::Lockout));
            }
        } else if self.failed_tries >= self.max_tries {
            return Err(TpmError::new(ResponseCode::Lockout));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tpm2_call::Handle;

    fn ctx(password: bool) -> LockoutContext {
        LockoutContext {
            is_password_session: password,
            is_lockout_bound: false,
            is_da_bound: false,
            includes_auth: true,
        }
    }

    #[test]
    fn pcr_handles_are_always_da_exempt() {
        let kind = HandleKind::classify(0x0000_0001).unwrap();
        assert!(DaManager::is_exempted(kind, false));
    }

    #[test]
    fn lockout_handle_is_the_only_non_exempt_permanent_handle() {
        let lockout = HandleKind::classify(Handle::Lockout as u32).unwrap();
        let owner = HandleKind::classify(Handle::Owner as u32).unwrap();
        assert!(!DaManager::is_exempted(lockout, false));
        assert!(DaManager::is_exempted(owner, false));
    }

    #[test]
    fn exempt_handle_fails_without_da_side_effect() {
        let mut da = DaManager::new(5, 1000, 1000);
        let err = da.increment_lockout(true, false, ctx(true), true);
        assert_eq!(err.code, ResponseCode::BadAuth);
        assert_eq!(da.failed_tries, 0);
    }

    #[test]
    fn non_exempt_failure_increments_failed_tries_and_queues_nv_write() {
        let mut da = DaManager::new(5, 1000, 1000);
        let err = da.increment_lockout(false, false, ctx(true), false);
        assert_eq!(err.code, ResponseCode::AuthFail);
        assert_eq!(da.failed_tries, 1);
        assert!(da.has_pending());
    }

    #[test]
    fn zero_recovery_time_never_increments_failed_tries() {
        let mut da = DaManager::new(5, 0, 1000);
        da.increment_lockout(false, false, ctx(true), true);
        assert_eq!(da.failed_tries, 0);
        assert!(!da.has_pending());
    }

    #[test]
    fn lockout_handle_failure_disables_lockout_auth() {
        let mut da = DaManager::new(5, 1000, 1000);
        let err = da.increment_lockout(false, true, ctx(true), true);
        assert_eq!(err.code, ResponseCode::AuthFail);
        assert!(!da.lockout_auth_enabled);
    }

    #[test]
    fn zero_lockout_recovery_disables_auth_without_queuing_nv_write() {
        let mut da = DaManager::new(5, 1000, 0);
        da.increment_lockout(false, true, ctx(true), true);
        assert!(!da.lockout_auth_enabled);
        assert!(!da.has_pending());
    }

    #[test]
    fn check_locked_out_rejects_when_failed_tries_maxed() {
        let mut da = DaManager::new(1, 1000, 1000);
        da.failed_tries = 1;
        assert_eq!(
            da.check_locked_out(false, true, true).unwrap_err().code,
            ResponseCode::Lockout
        );
    }

    #[test]
    fn check_locked_out_rejects_lockout_auth_when_disabled() {
        let mut da = DaManager::new(5, 1000, 1000);
        da.lockout_auth_enabled = false;
        assert_eq!(
            da.check_locked_out(true, true, true).unwrap_err().code,
            ResponseCode::Lockout
        );
    }

    #[test]
    fn check_locked_out_refuses_when_nv_unavailable_after_unclean_shutdown() {
        let mut da = DaManager::new(5, 1000, 1000);
        assert_eq!(
            da.check_locked_out(false, false, false).unwrap_err().code,
            ResponseCode::NvUnavailable
        );
    }

    #[test]
    fn check_locked_out_flushes_pending_writes_once_nv_is_available() {
        let mut da = DaManager::new(5, 1000, 1000);
        da.increment_lockout(false, false, ctx(true), false);
        assert!(da.has_pending());
        da.check_locked_out(false, true, true).unwrap();
        assert!(!da.has_pending());
    }
}
