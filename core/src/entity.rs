//! Entity resolution: the handle-type-agnostic accessors every session check
//! and command handler goes through to reach an auth value, auth policy,
//! name or hierarchy for *any* handle class.
//!
//! Grounded on `original_source/Entity.c`, which groups these five lookups
//! (`EntityGetLoadStatus`, `EntityGetAuthValue`, `EntityGetAuthPolicy`,
//! `EntityGetName`, `EntityGetHierarchy`) precisely because every other
//! module needs a handle-type-blind way to reach them.

use tpm2_call::{AuthRole, Handle, NvAttributes, ResponseCode};

use crate::error::{TpmError, TpmResult};
use crate::handle::HandleKind;
use crate::session::SessionKind;
use crate::store::{NvIndexRecord, NvIndexStore, ObjectRecord, ObjectStore, PcrRecord, PcrStore};

/// `TPMI_RH_HIERARCHY`: which hierarchy an entity belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hierarchy {
    Platform,
    Owner,
    Endorsement,
    /// The hierarchy of a transient object created with none of the
    /// pps/eps/sps attributes set. `EntityGetHierarchy` leaves its local
    /// initialized to `TPM_RH_NULL` in this case and returns it as-is;
    /// this is carried forward rather than treated as an error.
    Null,
}

/// Whether the three hierarchy-enable globals (`shEnable`, `ehEnable`,
/// `phEnable`) gate a permanent handle as present. Supplied by the caller
/// rather than owned here, since hierarchy enable state belongs to the
/// aggregate TPM state, not to entity resolution itself.
#[derive(Debug, Clone, Copy)]
pub struct HierarchyEnables {
    pub owner: bool,
    pub endorsement: bool,
    pub platform: bool,
}

/// A loaded object's hierarchy-membership flags, as recorded on creation
/// (`ppsHierarchy`/`epsHierarchy`/`spsHierarchy` in `OBJECT::attributes`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ObjectHierarchyFlags {
    pub pps: bool,
    pub eps: bool,
    pub sps: bool,
}

/// Per-entity authorization material independent of handle class: the
/// resolver never needs to know whether it came from an object, an NV
/// index, or a PCR to hand this back.
#[derive(Debug, Clone, Default)]
pub struct AuthMaterial {
    pub auth_value: Vec<u8>,
    pub auth_policy: Vec<u8>,
    pub policy_alg: Option<tpm2_call::Algorithm>,
}

/// Checks whether a permanent handle's entity is currently present, per
/// `EntityGetLoadStatus`'s `TPM_HT_PERMANENT` arm. Handle-class-specific
/// presence (object loaded, NV index defined, session loaded) is the
/// caller's responsibility; this only covers the handle-agnostic permanent
/// cases `Entity.c` itself resolves without delegating.
pub fn permanent_load_status(raw: u32, enables: HierarchyEnables) -> TpmResult<()> {
    use tpm2_call::Handle;
    match raw {
        h if h == Handle::Owner as u32 => {
            if enables.owner {
                Ok(())
            } else {
                Err(TpmError::new(ResponseCode::Hierarchy))
            }
        }
        h if h == Handle::Endorsement as u32 => {
            if enables.endorsement {
                Ok(())
            } else {
                Err(TpmError::new(ResponseCode::Hierarchy))
            }
        }
        h if h == Handle::Platform as u32 => {
            if enables.platform {
                Ok(())
            } else {
                Err(TpmError::new(ResponseCode::Hierarchy))
            }
        }
        h if h == Handle::Null as u32 || h == Handle::Password as u32 || h == Handle::Lockout as u32 => Ok(()),
        h if (Handle::Auth00 as u32..=Handle::AuthFF as u32).contains(&h) => {
            Err(TpmError::new(ResponseCode::Value))
        }
        _ => Err(TpmError::new(ResponseCode::Handle)),
    }
}

/// The stores and session lookup [`load_status`] needs to resolve presence
/// across all seven handle classes, gathered behind one reference bundle
/// since each arm touches a different subset of them.
pub struct LoadStatusInputs<'a> {
    pub enables: HierarchyEnables,
    pub objects: &'a dyn ObjectStore,
    pub nv: &'a dyn NvIndexStore,
    pub pcrs: &'a dyn PcrStore,
    /// `SessionIsLoaded` plus the loaded session's kind, so the `isPolicy`
    /// bit can be checked against the handle's own session-type range.
    pub session_kind: &'a dyn Fn(u32) -> Option<SessionKind>,
    /// `ObjectLoadEvict`: given a persistent handle not already present
    /// under that handle, attempts to load it, returning the transient
    /// handle it was loaded under. `None` means the load failed (for
    /// whatever underlying reason; this representative store does not
    /// distinguish object-memory exhaustion from a missing hierarchy the
    /// way `EntityGetLoadStatus` itself does).
    pub persistent_loader: &'a dyn Fn(u32) -> Option<u32>,
}

/// `EntityGetLoadStatus`: the single handle-class-blind presence check every
/// other handle-indexed lookup in this module assumes already passed. Unlike
/// the other five accessors here, this one can mutate its handle: a
/// persistent handle that gets loaded is rewritten in place to the transient
/// handle it now lives under, exactly as `ObjectLoadEvict` does to its
/// `object->handle` field.
pub fn load_status(raw: &mut u32, inputs: &LoadStatusInputs<'_>) -> TpmResult<()> {
    let kind = HandleKind::classify(*raw).ok_or_else(|| TpmError::new(ResponseCode::Handle))?;
    match kind {
        HandleKind::Permanent(h) => permanent_load_status(h, inputs.enables),
        HandleKind::Transient(h) => {
            if inputs.objects.is_present(h) {
                Ok(())
            } else {
                Err(TpmError::new(ResponseCode::ReferenceH0))
            }
        }
        HandleKind::Persistent(h) => {
            if inputs.objects.is_present(h) {
                return Ok(());
            }
            match (inputs.persistent_loader)(h) {
                Some(transient) => {
                    *raw = transient;
                    Ok(())
                }
                None => Err(TpmError::new(ResponseCode::ObjectMemory)),
            }
        }
        HandleKind::HmacSession(h) | HandleKind::PolicySession(h) => {
            let requested_is_policy = matches!(kind, HandleKind::PolicySession(_));
            match (inputs.session_kind)(h) {
                Some(actual) => {
                    let actual_is_policy = matches!(actual, SessionKind::Policy | SessionKind::Trial);
                    if actual_is_policy == requested_is_policy {
                        Ok(())
                    } else {
                        Err(TpmError::new(ResponseCode::Handle))
                    }
                }
                None => Err(TpmError::new(ResponseCode::ReferenceS0)),
            }
        }
        HandleKind::NvIndex(h) => {
            if inputs.nv.is_accessible(h) {
                Ok(())
            } else {
                Err(TpmError::new(ResponseCode::Handle))
            }
        }
        HandleKind::Pcr(_) => Ok(()),
    }
}

/// `EntityGetHierarchy` for the handle classes whose hierarchy does not
/// depend on stored object/NV state (permanent and PCR); NV and object
/// hierarchy require the caller's stored attributes and are resolved by
/// [`nv_index_hierarchy`] and [`object_hierarchy`].
#[must_use]
pub fn hierarchy_of_permanent_or_pcr(kind: HandleKind) -> Option<Hierarchy> {
    use tpm2_call::Handle;
    match kind {
        HandleKind::Permanent(h) => Some(if h == Handle::Platform as u32 {
            Hierarchy::Platform
        } else if h == Handle::Endorsement as u32 {
            Hierarchy::Endorsement
        } else if h == Handle::Null as u32 {
            Hierarchy::Null
        } else {
            // TPM_RH_OWNER, TPM_RH_LOCKOUT, and anything else reaching here.
            Hierarchy::Owner
        }),
        HandleKind::Pcr(_) => Some(Hierarchy::Owner),
        _ => None,
    }
}

/// `EntityGetHierarchy`'s NV index arm: platform-created indices belong to
/// the platform hierarchy, everything else to the owner hierarchy.
#[must_use]
pub fn nv_index_hierarchy(platform_create: bool) -> Hierarchy {
    if platform_create {
        Hierarchy::Platform
    } else {
        Hierarchy::Owner
    }
}

/// `EntityGetHierarchy`'s transient-object arm: the first hierarchy flag
/// set, in pps/eps/sps priority order, or [`Hierarchy::Null`] if none are
/// set (the Open Question this module resolves by matching the source
/// literally rather than treating it as malformed).
#[must_use]
pub fn object_hierarchy(flags: ObjectHierarchyFlags) -> Hierarchy {
    if flags.pps {
        Hierarchy::Platform
    } else if flags.eps {
        Hierarchy::Endorsement
    } else if flags.sps {
        Hierarchy::Owner
    } else {
        Hierarchy::Null
    }
}

/// `EntityGetName`: an object or NV index reports its precomputed
/// `hashAlg || digest` Name; every other handle class's Name is simply its
/// own 4-byte big-endian handle value.
#[must_use]
pub fn get_name(kind: HandleKind, object: Option<&ObjectRecord>, nv: Option<&NvIndexRecord>) -> Vec<u8> {
    match kind {
        HandleKind::Transient(_) | HandleKind::Persistent(_) => object.map(|o| o.name.clone()).unwrap_or_default(),
        HandleKind::NvIndex(_) => nv.map(|n| n.name.clone()).unwrap_or_default(),
        _ => kind.raw().to_be_bytes().to_vec(),
    }
}

/// `EntityGetAuthValue`: `TPM_RH_NULL`'s auth value is always empty; objects,
/// NV indices, and PCRs read their stored value; every other permanent
/// handle (owner/endorsement/platform/lockout) has no directly addressable
/// auth value of its own here — those are resolved through the caller's
/// `PersistentState`, not this module.
#[must_use]
pub fn get_auth_value(
    kind: HandleKind,
    object: Option<&ObjectRecord>,
    nv: Option<&NvIndexRecord>,
    pcr: Option<&PcrRecord>,
) -> Vec<u8> {
    match kind {
        HandleKind::Permanent(h) if h == Handle::Null as u32 => Vec::new(),
        HandleKind::Transient(_) | HandleKind::Persistent(_) => object.map(|o| o.auth_value.clone()).unwrap_or_default(),
        HandleKind::NvIndex(_) => nv.map(|n| n.auth_value.clone()).unwrap_or_default(),
        HandleKind::Pcr(_) => pcr.map(|p| p.auth_value.clone()).unwrap_or_default(),
        _ => Vec::new(),
    }
}

/// `EntityGetAuthPolicy`: pairs the stored policy digest with the hash
/// algorithm it was authored under, `Algorithm::Null` when no policy is
/// bound (mirroring the original returning `TPM_ALG_NULL` for an empty
/// `authPolicy`).
#[must_use]
pub fn get_auth_policy(
    kind: HandleKind,
    object: Option<&ObjectRecord>,
    nv: Option<&NvIndexRecord>,
    pcr: Option<&PcrRecord>,
) -> AuthMaterial {
    let (auth_policy, policy_alg) = match kind {
        HandleKind::Transient(_) | HandleKind::Persistent(_) => {
            (object.map(|o| o.auth_policy.clone()).unwrap_or_default(), object.and_then(|o| o.policy_alg))
        }
        HandleKind::NvIndex(_) => (nv.map(|n| n.auth_policy.clone()).unwrap_or_default(), nv.and_then(|n| n.policy_alg)),
        HandleKind::Pcr(_) => (pcr.map(|p| p.auth_policy.clone()).unwrap_or_default(), None),
        _ => (Vec::new(), None),
    };
    let policy_alg = if auth_policy.is_empty() { None } else { policy_alg };
    AuthMaterial { auth_value: Vec::new(), auth_policy, policy_alg }
}

/// `IsAuthValueAvailable`'s object arm: a sequence object's auth value is
/// always usable regardless of role; otherwise the object needs
/// `userWithAuth` for a `USER`-role authorization, or, for an `ADMIN`-role
/// authorization, needs no bound auth policy (`adminWithPolicy` clear).
#[must_use]
pub fn is_object_auth_value_available(object: &ObjectRecord, role: AuthRole) -> bool {
    if object.is_sequence {
        return true;
    }
    match role {
        AuthRole::Admin => !object.admin_with_policy,
        _ => object.user_with_auth,
    }
}

/// `IsAuthValueAvailable`'s NV arm: gated by `TPMA_NV_AUTHWRITE`/
/// `TPMA_NV_AUTHREAD` depending on which direction the command needs.
#[must_use]
pub fn is_nv_auth_value_available(nv: &NvIndexRecord, is_write: bool) -> bool {
    if is_write {
        nv.attributes.contains(NvAttributes::AuthWrite)
    } else {
        nv.attributes.contains(NvAttributes::AuthRead)
    }
}

/// `IsAuthPolicyAvailable`'s object arm: the private area must be loaded
/// (not `publicOnly`), the object must not be a sequence object, and a
/// non-empty policy must be bound.
#[must_use]
pub fn is_object_auth_policy_available(object: &ObjectRecord) -> bool {
    !object.auth_policy.is_empty() && !object.public_only && !object.is_sequence
}

/// `IsAuthPolicyAvailable`'s NV arm: a non-empty policy is necessary but not
/// sufficient — the command must either require a policy session outright
/// (`DUP`/`ADMIN` roles) or the index must carry the matching
/// `TPMA_NV_POLICYWRITE`/`TPMA_NV_POLICYREAD` attribute.
#[must_use]
pub fn is_nv_auth_policy_available(nv: &NvIndexRecord, is_write: bool, policy_required_by_command: bool) -> bool {
    if nv.auth_policy.is_empty() {
        return false;
    }
    let attribute_allows = if is_write {
        nv.attributes.contains(NvAttributes::PolicyWrite)
    } else {
        nv.attributes.contains(NvAttributes::PolicyRead)
    };
    policy_required_by_command || attribute_allows
}

/// `IsAuthPolicyAvailable`'s permanent-handle arm: available whenever a
/// non-empty policy has been set.
#[must_use]
pub fn is_permanent_auth_policy_available(policy: &[u8]) -> bool {
    !policy.is_empty()
}
