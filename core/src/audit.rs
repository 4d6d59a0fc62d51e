//! Command-audit subsystem: which commands are audited, and the running
//! digest of audited command codes.
//!
//! Grounded on `original_source/CommandAudit.c`. The bit array that original
//! keys by `COMMAND_INDEX` is here keyed directly by `TPM_CC` value through
//! a sparse `BTreeSet`, since this crate implements a representative command
//! subset rather than the full code-generated command table.

use std::collections::BTreeSet;

use tpm2_call::Command;

use crate::crypto::{Crypto, HashAlg};

/// Tracks which command codes are audited and the running digest over them.
///
/// `audit_hash_alg` mirrors `gp.auditHashAlg`: the hash algorithm the digest
/// is computed with, changeable only through `TPM2_SetCommandCodeAuditStatus`
/// with an empty command list.
#[derive(Debug, Clone)]
pub struct CommandAudit {
    audited: BTreeSet<u32>,
    audit_hash_alg: HashAlg,
}

impl CommandAudit {
    /// `CommandAuditPreInstall_Init`: always audits
    /// `TPM_CC_SetCommandCodeAuditStatus` and starts from the given digest
    /// algorithm (the original uses the context-integrity hash algorithm).
    #[must_use]
    pub fn new(audit_hash_alg: HashAlg) -> Self {
        let mut audited = BTreeSet::new();
        audited.insert(Command::SetCommandCodeAuditStatus as u32);
        CommandAudit { audited, audit_hash_alg }
    }

    #[must_use]
    pub fn audit_hash_alg(&self) -> HashAlg {
        self.audit_hash_alg
    }

    /// Changes the digest algorithm. The caller is responsible for only
    /// calling this when the audited command list is otherwise empty
    /// (the sole invariant the original's `TPM2_SetCommandCodeAuditStatus`
    /// enforces before flipping `gp.auditHashAlg`).
    pub fn set_audit_hash_alg(&mut self, alg: HashAlg) {
        self.audit_hash_alg = alg;
    }

    /// `CommandAuditSet`: returns whether the flag actually changed.
    /// `TPM_CC_Shutdown` can never be audited.
    pub fn set(&mut self, command_code: u32) -> bool {
        if command_code == Command::Shutdown as u32 {
            return false;
        }
        self.audited.insert(command_code)
    }

    /// `CommandAuditClear`: returns whether the flag actually changed.
    /// `TPM_CC_SetCommandCodeAuditStatus`'s own bit can never be cleared.
    pub fn clear(&mut self, command_code: u32) -> bool {
        if command_code == Command::SetCommandCodeAuditStatus as u32 {
            return false;
        }
        self.audited.remove(&command_code)
    }

    /// `CommandAuditIsRequired`.
    #[must_use]
    pub fn is_required(&self, command_code: u32) -> bool {
        self.audited.contains(&command_code)
    }

    /// `CommandAuditCapGetCCList`: ascending command codes starting at or
    /// above `start`, capped at `count`. Returns `(codes, more)`.
    #[must_use]
    pub fn cc_list(&self, start: u32, count: usize) -> (Vec<u32>, bool) {
        let mut codes = Vec::new();
        let mut more = false;
        for &code in self.audited.range(start..) {
            if codes.len() < count {
                codes.push(code);
            } else {
                more = true;
                break;
            }
        }
        (codes, more)
    }

    /// `CommandAuditGetDigest`: hashes the ascending list of audited command
    /// codes as if they were concatenated 4-byte big-endian values.
    #[must_use]
    pub fn digest(&self, crypto: &dyn Crypto) -> Vec<u8> {
        let encoded: Vec<u8> = self.audited.iter().flat_map(|code| code.to_be_bytes()).collect();
        crypto.hash(self.audit_hash_alg, &encoded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::sim::SimCrypto;

    #[test]
    fn fresh_audit_state_always_audits_set_command_code_audit_status() {
        let audit = CommandAudit::new(HashAlg::Sha256);
        assert!(audit.is_required(Command::SetCommandCodeAuditStatus as u32));
    }

    #[test]
    fn shutdown_can_never_be_audited() {
        let mut audit = CommandAudit::new(HashAlg::Sha256);
        assert!(!audit.set(Command::Shutdown as u32));
        assert!(!audit.is_required(Command::Shutdown as u32));
    }

    #[test]
    fn set_command_code_audit_status_bit_cannot_be_cleared() {
        let mut audit = CommandAudit::new(HashAlg::Sha256);
        assert!(!audit.clear(Command::SetCommandCodeAuditStatus as u32));
        assert!(audit.is_required(Command::SetCommandCodeAuditStatus as u32));
    }

    #[test]
    fn set_and_clear_report_whether_anything_changed() {
        let mut audit = CommandAudit::new(HashAlg::Sha256);
        let cc = Command::NvWrite as u32;
        assert!(audit.set(cc));
        assert!(!audit.set(cc));
        assert!(audit.clear(cc));
        assert!(!audit.clear(cc));
    }

    #[test]
    fn cc_list_is_ascending_and_reports_more() {
        let mut audit = CommandAudit::new(HashAlg::Sha256);
        audit.set(Command::NvWrite as u32);
        audit.set(Command::Clear as u32);
        audit.set(Command::PcrReset as u32);
        let (codes, more) = audit.cc_list(0, 2);
        assert_eq!(codes.len(), 2);
        assert!(codes.windows(2).all(|w| w[0] < w[1]));
        assert!(more);
    }

    #[test]
    fn digest_changes_when_the_audited_set_changes() {
        let crypto = SimCrypto;
        let mut audit = CommandAudit::new(HashAlg::Sha256);
        let before = audit.digest(&crypto);
        audit.set(Command::NvWrite as u32);
        let after = audit.digest(&crypto);
        assert_ne!(before, after);
    }
}
