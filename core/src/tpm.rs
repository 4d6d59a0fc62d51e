//! The `Tpm` aggregate: every piece of state a command touches, bundled
//! behind one owner instead of the original's file-scope statics.
//!
//! Grounded on the global state `SessionProcess.c`/`Entity.c`/`Power.c`
//! share through `gp` (persistent), `gc`/`gr` (volatile), and the
//! session-indexed `s_*` arrays. `PersistentState`/`VolatileState` split
//! those two lifetimes out explicitly; [`crate::pipeline::CommandCtx`] is
//! the per-command slice that used to be file statics.

use tpm2_call::{Algorithm, AuthRole, Command, NvAttributes, ResponseCode};

use crate::audit::CommandAudit;
use crate::command_table;
use crate::crypto::{Crypto, HashAlg, Rng};
use crate::da::DaManager;
use crate::entity::{self, HierarchyEnables, LoadStatusInputs};
use crate::error::{TpmError, TpmResult};
use crate::handle::HandleKind;
use crate::lifecycle::TpmLifecycle;
use crate::nv::{NvStore, SimNvStore};
use crate::pipeline::{check_auth_no_session, parse_sessions, CommandCtx, HandleAuthContext, NoSessionInput, ParseSessionsInput};
use crate::platform::{Platform, PlatformState};
use crate::session::SessionStore;
use crate::store::{NvIndexStore, ObjectStore, PcrStore, SimStore};

/// `gp`: survives reset, written through the NV interface.
#[derive(Debug, Clone)]
pub struct PersistentState {
    pub owner_auth: Vec<u8>,
    pub owner_policy: Vec<u8>,
    pub owner_policy_alg: Option<Algorithm>,
    pub endorsement_auth: Vec<u8>,
    pub endorsement_policy: Vec<u8>,
    pub endorsement_policy_alg: Option<Algorithm>,
    pub platform_auth: Vec<u8>,
    pub platform_policy: Vec<u8>,
    pub platform_policy_alg: Option<Algorithm>,
    pub lockout_auth: Vec<u8>,
    pub lockout_policy: Vec<u8>,
    pub lockout_policy_alg: Option<Algorithm>,
    /// `orderlyState`: whether the previous shutdown was `TPM2_Shutdown`
    /// with `SHUTDOWN_CLEAR`/`SHUTDOWN_STATE` (clean) rather than a bare
    /// power loss.
    pub orderly: bool,
}

impl Default for PersistentState {
    fn default() -> Self {
        PersistentState {
            owner_auth: Vec::new(),
            owner_policy: Vec::new(),
            owner_policy_alg: None,
            endorsement_auth: Vec::new(),
            endorsement_policy: Vec::new(),
            endorsement_policy_alg: None,
            platform_auth: Vec::new(),
            platform_policy: Vec::new(),
            platform_policy_alg: None,
            lockout_auth: Vec::new(),
            lockout_policy: Vec::new(),
            lockout_policy_alg: None,
            orderly: true,
        }
    }
}

/// `gc`/`gr`: lost at reset or power-off.
#[derive(Debug, Clone, Default)]
pub struct VolatileState {
    pub sh_enable: bool,
    pub eh_enable: bool,
    pub ph_enable: bool,
    /// `gr.commandAuditDigest`: empty means "no digest started yet", length
    /// 1 is the hash-alg-just-changed sentinel, matching
    /// [`crate::pipeline::extend_command_audit_digest`].
    pub command_audit_digest: Vec<u8>,
    pub audit_counter: u64,
    pub exclusive_audit_session: Option<u32>,
    /// `gr.pcrCounter`: bumped by every PCR extend/reset, compared against a
    /// policy session's snapshot from `TPM2_PolicyPCR` to invalidate it if
    /// the PCRs moved since.
    pub pcr_update_counter: u32,
}

/// Every piece of state a command needs, owned in one place. Built fresh
/// for a test or a demo-binary process; a long-running host would persist
/// [`PersistentState`] and the reserved NV slots across instances.
pub struct Tpm {
    pub persistent: PersistentState,
    pub volatile: VolatileState,
    pub lifecycle: TpmLifecycle,
    pub platform: PlatformState,
    pub sessions: SessionStore,
    pub store: SimStore,
    pub nv: SimNvStore,
    pub da: DaManager,
    pub audit: CommandAudit,
    pub crypto: Box<dyn Crypto>,
    pub rng: Box<dyn Rng>,
}

impl Tpm {
    #[must_use]
    pub fn new(
        session_capacity: usize,
        audit_hash_alg: HashAlg,
        crypto: Box<dyn Crypto>,
        rng: Box<dyn Rng>,
    ) -> Self {
        Tpm {
            persistent: PersistentState::default(),
            volatile: VolatileState::default(),
            lifecycle: TpmLifecycle::new(),
            platform: PlatformState::new(),
            sessions: SessionStore::with_capacity(session_capacity),
            store: SimStore::new(),
            nv: SimNvStore::new(),
            da: DaManager::new(3, 1000, 1000),
            audit: CommandAudit::new(audit_hash_alg),
            crypto,
            rng,
        }
    }

    /// Whether authorization processing may proceed against NV even though
    /// `NvIsAvailable()` reports unavailable: an orderly previous shutdown
    /// permits non-DA authorization to continue per the NV discipline rule.
    #[must_use]
    pub fn nv_usable_for_authorization(&self) -> bool {
        self.nv.is_available() || self.persistent.orderly
    }

    /// Flushes any dictionary-attack state queued while NV was unavailable,
    /// applying it to the reserved-slot store.
    pub fn flush_pending_da_state(&mut self) {
        if self.da.has_pending() && self.nv.is_available() {
            let pending = self.da.take_pending();
            self.nv.apply_da_mutations(&pending);
        }
    }

    fn hierarchy_enables(&self) -> HierarchyEnables {
        HierarchyEnables {
            owner: self.volatile.sh_enable,
            endorsement: self.volatile.eh_enable,
            platform: self.volatile.ph_enable,
        }
    }

    /// `EntityGetLoadStatus` + the four `Entity*` accessors, folded into the
    /// one [`HandleAuthContext`] the session pipeline needs per handle.
    /// `role` is this handle's position's `CommandAuthRole`; `is_write`
    /// selects which of an NV index's `AUTHWRITE`/`AUTHREAD` and
    /// `POLICYWRITE`/`POLICYREAD` attributes applies.
    fn resolve_handle_auth_context(&self, raw: u32, role: AuthRole, is_write: bool) -> TpmResult<HandleAuthContext> {
        let mut handle = raw;
        let session_kind = |h: u32| self.sessions.get(h).map(|s| s.kind);
        let persistent_loader = |_: u32| -> Option<u32> { None };
        let inputs = LoadStatusInputs {
            enables: self.hierarchy_enables(),
            objects: &self.store,
            nv: &self.store,
            pcrs: &self.store,
            session_kind: &session_kind,
            persistent_loader: &persistent_loader,
        };
        entity::load_status(&mut handle, &inputs)?;

        let kind = HandleKind::classify(handle).ok_or_else(|| TpmError::new(ResponseCode::Handle))?;
        let object = ObjectStore::get(&self.store, handle);
        let nv_record = NvIndexStore::get(&self.store, handle);
        let pcr = PcrStore::get(&self.store, handle);

        let name = entity::get_name(kind, object, nv_record);
        let auth_value = entity::get_auth_value(kind, object, nv_record, pcr);
        let material = entity::get_auth_policy(kind, object, nv_record, pcr);
        let policy_alg = material.policy_alg.and_then(|alg| HashAlg::from_wire(&alg));

        let auth_value_available = match kind {
            HandleKind::Transient(_) | HandleKind::Persistent(_) => {
                object.is_some_and(|o| entity::is_object_auth_value_available(o, role))
            }
            HandleKind::NvIndex(_) => nv_record.is_some_and(|n| entity::is_nv_auth_value_available(n, is_write)),
            HandleKind::Pcr(_) => true,
            // The hierarchy auth values (`gp.*Auth`) this module doesn't own
            // are always directly usable once `EntityGetLoadStatus` admits
            // the handle at all.
            HandleKind::Permanent(_) => true,
            HandleKind::HmacSession(_) | HandleKind::PolicySession(_) => false,
        };
        let auth_policy_available = match kind {
            HandleKind::Transient(_) | HandleKind::Persistent(_) => object.is_some_and(entity::is_object_auth_policy_available),
            HandleKind::NvIndex(_) => {
                let policy_required = matches!(role, AuthRole::Admin | AuthRole::Dup);
                nv_record.is_some_and(|n| entity::is_nv_auth_policy_available(n, is_write, policy_required))
            }
            HandleKind::Permanent(_) => entity::is_permanent_auth_policy_available(&material.auth_policy),
            HandleKind::Pcr(_) => !material.auth_policy.is_empty(),
            HandleKind::HmacSession(_) | HandleKind::PolicySession(_) => false,
        };

        let no_da = match kind {
            HandleKind::Transient(_) | HandleKind::Persistent(_) => object.is_some_and(|o| o.no_da),
            HandleKind::NvIndex(_) => nv_record.is_some_and(|n| n.attributes.contains(NvAttributes::NoDa)),
            _ => false,
        };
        let da_exempt = DaManager::is_exempted(kind, no_da);

        let is_platform = matches!(kind, HandleKind::Permanent(h) if h == tpm2_call::Handle::Platform as u32);
        let is_lockout = matches!(kind, HandleKind::Permanent(h) if h == tpm2_call::Handle::Lockout as u32);
        let requires_policy_session = match role {
            AuthRole::Dup => true,
            AuthRole::Admin => {
                matches!(kind, HandleKind::Transient(_) | HandleKind::Persistent(_)) && object.is_some_and(|o| o.admin_with_policy)
            }
            AuthRole::User | AuthRole::None => false,
        };

        Ok(HandleAuthContext {
            handle,
            name,
            role,
            auth_value,
            auth_policy: material.auth_policy,
            policy_alg,
            auth_value_available,
            auth_policy_available,
            da_exempt,
            is_platform,
            is_lockout,
            requires_policy_session,
        })
    }

    /// `ParseSessions`'s entry point as the command dispatcher would call it:
    /// resolves every handle's authorization facts through the entity layer,
    /// looks up the command's attributes, and runs the session area through
    /// [`parse_sessions`] (or [`check_auth_no_session`] when it's empty).
    pub fn authorize_command(
        &mut self,
        command_code: u32,
        handles: &[u32],
        session_area: &[u8],
        command_parameters: &mut Vec<u8>,
        is_write: bool,
    ) -> TpmResult<CommandCtx> {
        let attrs = command_table::lookup(command_code);
        let mut handle_ctxs = Vec::with_capacity(handles.len());
        for (i, &raw) in handles.iter().enumerate() {
            let role = attrs.role_for(i);
            handle_ctxs.push(self.resolve_handle_auth_context(raw, role, is_write)?);
        }

        let command_is_audited = self.audit.is_required(command_code) && attrs.auditable;
        let audit_hash_alg = self.audit.audit_hash_alg();
        let nv_available = self.nv_usable_for_authorization();

        if session_area.is_empty() {
            let input = NoSessionInput {
                handles: &handle_ctxs,
                command_code,
                command_is_audited,
                command_audit_digest_is_empty: self.volatile.command_audit_digest.is_empty(),
                is_command_audit_digest_get: command_code == Command::GetCommandAuditDigest as u32,
                nv_available,
                audit_hash_alg,
                command_parameters: command_parameters.as_slice(),
            };
            check_auth_no_session(self.crypto.as_ref(), &input)
        } else {
            let decrypt_size = command_parameters.len();
            let input = ParseSessionsInput {
                command_code,
                sessions_allowed: attrs.sessions_allowed,
                decrypt_admissible: attrs.decrypt_admissible,
                encrypt_admissible: attrs.encrypt_admissible,
                pp_required: attrs.pp_required,
                handles: &handle_ctxs,
                session_area,
                command_parameters,
                decrypt_size,
                physical_presence_asserted: self.platform.physical_presence_asserted(),
                current_locality: self.platform.locality(),
                current_clock: Some(self.platform.clock()),
                nv_available,
                orderly: self.persistent.orderly,
                command_audit_digest_is_empty: self.volatile.command_audit_digest.is_empty(),
                is_command_audit_digest_get: command_code == Command::GetCommandAuditDigest as u32,
                command_is_audited,
                audit_hash_alg,
                current_exclusive_audit_session: self.volatile.exclusive_audit_session,
                current_pcr_counter: self.volatile.pcr_update_counter,
                is_policy_secret_command: command_code == Command::PolicySecret as u32,
            };
            parse_sessions(input, &mut self.sessions, &mut self.da, self.crypto.as_ref())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::sim::{SimCrypto, SimRng};

    fn tpm() -> Tpm {
        Tpm::new(3, HashAlg::Sha256, Box::new(SimCrypto), Box::new(SimRng::default()))
    }

    #[test]
    fn fresh_tpm_has_no_loaded_sessions() {
        let t = tpm();
        assert!(!t.sessions.is_loaded(0x0200_0000));
    }

    #[test]
    fn unavailable_nv_is_still_usable_after_an_orderly_shutdown() {
        let mut t = tpm();
        t.nv.set_available(false);
        assert!(t.nv_usable_for_authorization());
        t.persistent.orderly = false;
        assert!(!t.nv_usable_for_authorization());
    }

    #[test]
    fn flush_pending_da_state_applies_queued_mutations_once_nv_is_back() {
        let mut t = tpm();
        t.da.increment_lockout(
            false,
            false,
            crate::da::LockoutContext {
                is_password_session: true,
                is_lockout_bound: false,
                is_da_bound: false,
                includes_auth: true,
            },
            false,
        );
        assert!(t.da.has_pending());
        t.flush_pending_da_state();
        assert!(t.da.has_pending());
        t.nv.set_available(true);
        t.flush_pending_da_state();
        assert!(!t.da.has_pending());
        assert!(t.nv.read_reserved(crate::nv::ReservedSlot::FailedTries).is_some());
    }
}
