//! The session pipeline: parameter hashing, PW/HMAC/policy authorization
//! checks, and response session construction.
//!
//! Grounded on `original_source/SessionProcess.c`. The original keeps the
//! working state for "the sessions attached to the command currently being
//! processed" in a clutch of file-scope static arrays indexed by session
//! position (`s_sessionHandles`, `s_associatedHandles`,
//! `s_inputAuthValues`, `s_attributes`, `s_decryptSessionIndex`,
//! `s_encryptSessionIndex`, `s_cpHashForAudit`, …). [`CommandCtx`] is that
//! same per-command scratch space made into an explicit, owned value
//! instead of module statics, so nothing here depends on being called
//! exactly once per dispatch loop iteration.

use tpm2_call::{AuthRole, Command, ResponseCode, SessionAttributes};

use crate::crypto::{Crypto, HashAlg, Rng};
use crate::da::{DaManager, LockoutContext};
use crate::error::{TpmError, TpmResult};
use crate::handle::{is_password_session, HandleKind};
use crate::platform::locality_compatible;
use crate::session::{Session, SessionCommitment, SessionDigest, SessionKind, SessionStore};

/// The upper bound on sessions in one command's authorization area
/// (`MAX_SESSION_NUM`): three, matching the original's fixed-size
/// `s_sessionHandles` array.
pub const MAX_SESSION_NUM: usize = 3;

/// One authorization session as attached to the command currently being
/// processed: its slot position, the handle it is attached to (or none, for
/// a password/exclusive-audit-only use), and the input values the caller
/// supplied on the wire.
#[derive(Debug, Clone)]
pub struct AttachedSession {
    pub session_handle: u32,
    pub associated_handle: Option<u32>,
    pub input_auth_value: Vec<u8>,
    pub nonce_caller: Vec<u8>,
    pub attributes: SessionAttributes,
    /// Whether [`check_auth_session`] folded the associated entity's auth
    /// value into this session's command HMAC key, carried forward so
    /// [`build_response_sessions`] uses the same key for the response HMAC
    /// without recomputing the bind/policy decision that produced it.
    pub include_auth: bool,
}

/// Per-command scratch space, replacing the original's session-indexed file
/// statics with one owned value built fresh per command.
#[derive(Debug, Clone, Default)]
pub struct CommandCtx {
    pub sessions: Vec<AttachedSession>,
    pub decrypt_session_index: Option<usize>,
    pub encrypt_session_index: Option<usize>,
    pub cp_hash_for_audit: Vec<u8>,
    /// `s_cpHashForCommandAudit`: snapshotted once per command, independent
    /// of any individual session, when the command is a member of the
    /// audited-command set.
    pub cp_hash_for_command_audit: Option<Vec<u8>>,
}

impl CommandCtx {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

/// `ComputeCpHash`: `hash(commandCode || name_1 || ... || name_n || parameters)`.
#[must_use]
pub fn compute_cp_hash(
    crypto: &dyn Crypto,
    hash_alg: HashAlg,
    command_code: u32,
    handle_names: &[Vec<u8>],
    parameters: &[u8],
) -> Vec<u8> {
    let mut chunks: Vec<&[u8]> = Vec::with_capacity(handle_names.len() + 2);
    let cc_bytes = command_code.to_be_bytes();
    chunks.push(&cc_bytes);
    for name in handle_names {
        chunks.push(name);
    }
    chunks.push(parameters);
    crypto.hash_chunks(hash_alg, &chunks)
}

/// `ComputeCpHash`'s `nameHash` output: `hash(name_1 || ... || name_n)`, with
/// no command code or parameters mixed in.
#[must_use]
pub fn compute_name_hash(crypto: &dyn Crypto, hash_alg: HashAlg, handle_names: &[Vec<u8>]) -> Vec<u8> {
    let chunks: Vec<&[u8]> = handle_names.iter().map(Vec::as_slice).collect();
    crypto.hash_chunks(hash_alg, &chunks)
}

/// `ComputeRpHash`: `hash(TPM_RC_SUCCESS || commandCode || parameters)`. Only
/// ever computed for a successful response, per the original's hardcoded
/// `responseCode`.
#[must_use]
pub fn compute_rp_hash(crypto: &dyn Crypto, hash_alg: HashAlg, command_code: u32, response_parameters: &[u8]) -> Vec<u8> {
    let rc_bytes = (ResponseCode::Success as u32).to_be_bytes();
    let cc_bytes = command_code.to_be_bytes();
    crypto.hash_chunks(hash_alg, &[&rc_bytes, &cc_bytes, response_parameters])
}

/// `CheckPWAuthSession`: a direct comparison of the (trailing-zero-stripped)
/// input value against the entity's auth value. DA bookkeeping on failure is
/// the caller's responsibility (it needs the full [`DaManager`] and handle
/// context this function deliberately does not take).
#[must_use]
pub fn check_pw_auth(input_auth_value: &[u8], entity_auth_value: &[u8]) -> bool {
    let stripped = crate::bitmem::strip_trailing_zeros(input_auth_value);
    crate::bitmem::buffers_equal(stripped, entity_auth_value)
}

/// The extra session nonces `ComputeCommandHMAC` mixes in for session 0 when
/// distinct decrypt/encrypt sessions are also attached to the command.
#[derive(Debug, Clone, Default)]
pub struct ExtraNonces {
    pub decrypt: Option<Vec<u8>>,
    pub encrypt: Option<Vec<u8>>,
}

/// Computes which extra nonces (if any) belong in session `session_index`'s
/// HMAC, per `ComputeCommandHMAC`'s exact rule: only session 0, only when it
/// has an associated handle, and only for a decrypt/encrypt session that
/// isn't itself this session (and, for the encrypt nonce, isn't the same
/// session as the decrypt one).
#[must_use]
pub fn extra_nonces_for(ctx: &CommandCtx, session_index: usize) -> ExtraNonces {
    let mut extra = ExtraNonces::default();
    if session_index != 0 || ctx.sessions[session_index].associated_handle.is_none() {
        return extra;
    }
    if let Some(decrypt_index) = ctx.decrypt_session_index {
        if decrypt_index != session_index {
            extra.decrypt = Some(ctx.sessions[decrypt_index].session_handle.to_be_bytes().to_vec());
        }
    }
    if let Some(encrypt_index) = ctx.encrypt_session_index {
        if encrypt_index != session_index && Some(encrypt_index) != ctx.decrypt_session_index {
            extra.encrypt = Some(ctx.sessions[encrypt_index].session_handle.to_be_bytes().to_vec());
        }
    }
    extra
}

/// `ComputeCommandHMAC`: folds the session key (and, when `includeAuth` is
/// set, the associated entity's auth value) into an HMAC over the cpHash,
/// the caller/TPM nonces, any extra nonces, and the marshaled session
/// attributes byte. An empty key and empty input auth value short-circuits
/// to an empty HMAC, matching the original's null-string-HMAC allowance.
#[must_use]
pub fn compute_command_hmac(
    crypto: &dyn Crypto,
    session: &Session,
    include_auth_value: Option<&[u8]>,
    input_auth_value_is_empty: bool,
    cp_hash: &[u8],
    nonce_caller: &[u8],
    extra: &ExtraNonces,
    session_attributes_byte: u8,
) -> Vec<u8> {
    let mut key = session.session_key.clone();
    if let Some(auth) = include_auth_value {
        key.extend_from_slice(auth);
    }
    if key.is_empty() && input_auth_value_is_empty {
        return Vec::new();
    }
    let mut message = Vec::new();
    message.extend_from_slice(cp_hash);
    message.extend_from_slice(nonce_caller);
    message.extend_from_slice(&session.nonce_tpm);
    if let Some(decrypt) = &extra.decrypt {
        message.extend_from_slice(decrypt);
    }
    if let Some(encrypt) = &extra.encrypt {
        message.extend_from_slice(encrypt);
    }
    message.push(session_attributes_byte);
    crypto.hmac(session.hash_alg, &key, &message)
}

/// `CheckSessionHMAC`: compares the caller-supplied HMAC against the
/// expected one computed by [`compute_command_hmac`], registering a DA
/// failure through `da` on mismatch. `includes_auth` is whatever
/// [`compute_command_hmac`] was called with for this session, since that
/// same fact decides how `IncrementLockout` weighs the failure.
#[allow(clippy::too_many_arguments)]
pub fn check_session_hmac(
    da: &mut DaManager,
    session: &Session,
    input_hmac: &[u8],
    expected_hmac: &[u8],
    exempted: bool,
    is_lockout_handle: bool,
    includes_auth: bool,
    nv_available: bool,
) -> TpmResult<()> {
    if crate::bitmem::buffers_equal(input_hmac, expected_hmac) {
        return Ok(());
    }
    let ctx = LockoutContext {
        is_password_session: false,
        is_lockout_bound: session.is_lockout_bound,
        is_da_bound: session.is_da_bound,
        includes_auth,
    };
    Err(da.increment_lockout(exempted, is_lockout_handle, ctx, nv_available))
}

/// The entity-independent facts [`check_policy_auth_session`] needs, since
/// the resolver, NV store, and platform all live outside this module.
#[derive(Debug, Clone)]
pub struct PolicyCheckInputs<'a> {
    pub command_code: u32,
    pub auth_policy: &'a [u8],
    pub policy_alg: HashAlg,
    pub current_clock: Option<u64>,
    pub current_locality: u8,
    pub physical_presence_asserted: bool,
    pub cp_hash: &'a [u8],
    pub name_hash: &'a [u8],
    pub associated_is_nv_index: bool,
    pub nv_written: Option<bool>,
    pub requires_admin_or_dup: bool,
    /// The current PCR update counter, compared against whatever value a
    /// `TPM2_PolicyPCR` execution snapshotted onto the session
    /// (`session.pcr_counter`). Ignored for a session that never ran
    /// `TPM2_PolicyPCR`.
    pub current_pcr_counter: u32,
    /// Whether the command this policy session is authorizing is
    /// `TPM2_PolicySecret` itself.
    pub is_policy_secret_command: bool,
}

/// `CheckPolicyAuthSession`: compares the session's committed policy digest,
/// timeout, command code, locality, physical-presence requirement, and
/// cpHash/nameHash/NV-written commitments against the current command. Order
/// does not matter for correctness (every branch returns the same class of
/// failure independent of evaluation order, as the original notes), but
/// this follows the source's order for easy comparison.
pub fn check_policy_auth_session(session: &Session, inputs: &PolicyCheckInputs<'_>) -> TpmResult<()> {
    if inputs.is_policy_secret_command && !session.is_password {
        return Err(TpmError::new(ResponseCode::Mode));
    }
    if let Some(created_at) = session.pcr_counter {
        if created_at != inputs.current_pcr_counter {
            return Err(TpmError::new(ResponseCode::PcrChanged));
        }
    }
    let policy_digest = match &session.digest {
        SessionDigest::Policy(d) => d.as_slice(),
        _ => return Err(TpmError::new(ResponseCode::PolicyFail)),
    };
    if !crate::bitmem::buffers_equal(policy_digest, inputs.auth_policy) {
        return Err(TpmError::new(ResponseCode::PolicyFail));
    }
    if session.hash_alg != inputs.policy_alg {
        return Err(TpmError::new(ResponseCode::PolicyFail));
    }
    if let Some(timeout) = session.timeout {
        match inputs.current_clock {
            None => return Err(TpmError::new(ResponseCode::NvUnavailable)),
            Some(clock) if timeout < clock => return Err(TpmError::new(ResponseCode::Expired)),
            Some(_) => {}
        }
    }
    match session.command_code {
        Some(cc) if cc != inputs.command_code => return Err(TpmError::new(ResponseCode::PolicyCc)),
        None if inputs.requires_admin_or_dup => return Err(TpmError::new(ResponseCode::PolicyFail)),
        _ => {}
    }
    if !locality_compatible(session.locality, inputs.current_locality) {
        return Err(TpmError::new(ResponseCode::Locality));
    }
    if session.pp_required && !inputs.physical_presence_asserted {
        return Err(TpmError::new(ResponseCode::Pp));
    }
    // `iscpHashDefined` selects which of the two commitments applies: a
    // policy that committed via `TPM2_PolicyCpHash` compares against the
    // full cpHash, one that committed via `TPM2_PolicyNameHash` compares
    // against the bare handle-name hash instead. Never both.
    match &session.commitment {
        SessionCommitment::CpHash(committed) => {
            if !crate::bitmem::buffers_equal(committed, inputs.cp_hash) {
                return Err(TpmError::new(ResponseCode::PolicyFail));
            }
        }
        SessionCommitment::NameHash(committed) => {
            if !crate::bitmem::buffers_equal(committed, inputs.name_hash) {
                return Err(TpmError::new(ResponseCode::PolicyFail));
            }
        }
        SessionCommitment::None | SessionCommitment::BoundEntity(_) => {}
    }
    if inputs.nv_written.is_some() && !inputs.associated_is_nv_index {
        return Err(TpmError::new(ResponseCode::PolicyFail));
    }
    Ok(())
}

/// `InitAuditSession`: marks a session as the running audit session, clears
/// its bound-entity status, and zeroes its digest to the session's digest
/// size.
pub fn init_audit_session(session: &mut Session) {
    session.is_audit_session = true;
    session.is_bound = false;
    session.digest = SessionDigest::Audit(vec![0u8; session.hash_alg.digest_size()]);
}

/// `Audit`: extends a loaded audit session's digest with `hash(old || cpHash
/// || rpHash)`.
pub fn extend_audit_digest(crypto: &dyn Crypto, session: &mut Session, cp_hash: &[u8], rp_hash: &[u8]) {
    let SessionDigest::Audit(old) = &session.digest else {
        return;
    };
    let new_digest = crypto.hash_chunks(session.hash_alg, &[old, cp_hash, rp_hash]);
    session.digest = SessionDigest::Audit(new_digest);
}

/// Outcome of extending the command-audit digest for one response,
/// reporting the `CommandAudit` sentinel cases the caller's NV layer must
/// react to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandAuditOutcome {
    /// The command is not audited; nothing changed.
    NotAudited,
    /// The hash algorithm had just been changed (digest size sentinel of 1);
    /// the digest was reset to empty and nothing was extended this time.
    HashAlgJustChanged,
    /// A fresh digest was started (the audit counter advanced) before
    /// extending.
    CounterAdvanced,
    /// The digest was extended onto an already-running digest.
    Extended,
}

/// `CommandAudit` (response-side, distinct from [`crate::audit::CommandAudit`]
/// the audited-command-set type): extends the persistent command-audit
/// digest for an audited command, handling the empty-digest
/// (start-new-digest) and one-byte-digest (hash-alg-just-changed) sentinels
/// literally, the same way the original overloads `gr.commandAuditDigest.size`.
pub fn extend_command_audit_digest(
    crypto: &dyn Crypto,
    is_audited: bool,
    digest: &mut Vec<u8>,
    hash_alg: HashAlg,
    cp_hash: &[u8],
    rp_hash: &[u8],
) -> CommandAuditOutcome {
    if !is_audited {
        return CommandAuditOutcome::NotAudited;
    }
    if digest.len() == 1 {
        digest.clear();
        return CommandAuditOutcome::HashAlgJustChanged;
    }
    let outcome = if digest.is_empty() {
        *digest = vec![0u8; hash_alg.digest_size()];
        CommandAuditOutcome::CounterAdvanced
    } else {
        CommandAuditOutcome::Extended
    };
    *digest = crypto.hash_chunks(hash_alg, &[digest, cp_hash, rp_hash]);
    outcome
}

/// `UpdateAuditSessionStatus`: among this command's attached sessions, finds
/// the one (if any) marked `audit`, initializes or re-exclusives it as
/// needed, and reports whether it is (still) the exclusive audit session.
/// Returns the new exclusive-audit-session handle, or `None` if exclusivity
/// should be cleared.
pub fn update_audit_session_status(
    ctx: &CommandCtx,
    sessions_by_handle: &mut dyn FnMut(u32) -> Option<&mut Session>,
    current_exclusive: Option<u32>,
    sessions_allowed: bool,
) -> Option<u32> {
    let mut found_audit_session = None;
    let mut new_exclusive = current_exclusive;

    for attached in &ctx.sessions {
        if !attached.attributes.contains(SessionAttributes::Audit) {
            continue;
        }
        found_audit_session = Some(attached.session_handle);
        let reset = attached.attributes.contains(SessionAttributes::AuditReset);
        if let Some(session) = sessions_by_handle(attached.session_handle) {
            let needs_init = !session.is_audit_session || reset;
            if needs_init {
                init_audit_session(session);
                new_exclusive = Some(attached.session_handle);
            } else if new_exclusive != Some(attached.session_handle) {
                new_exclusive = None;
            }
        }
    }

    if found_audit_session.is_none() && sessions_allowed {
        return None;
    }
    new_exclusive
}

/// `ComputeResponseHMAC`: structurally identical to
/// [`compute_command_hmac`] but over the rpHash instead of the cpHash, and
/// with no extra nonces (the response side never adds them).
#[must_use]
pub fn compute_response_hmac(
    crypto: &dyn Crypto,
    session: &Session,
    include_auth_value: Option<&[u8]>,
    input_auth_value_is_empty: bool,
    rp_hash: &[u8],
) -> Vec<u8> {
    let mut key = session.session_key.clone();
    if let Some(auth) = include_auth_value {
        key.extend_from_slice(auth);
    }
    if key.is_empty() && input_auth_value_is_empty {
        return Vec::new();
    }
    crypto.hmac(session.hash_alg, &key, rp_hash)
}

/// `BuildSingleResponseAuth`'s one deviation from the general per-session
/// response path: a PW session's `continueSession` is always reported SET
/// regardless of what the caller's command session requested, since a PW
/// session carries no state to continue or discard.
#[must_use]
pub fn force_continue_session(attributes: SessionAttributes, is_password: bool) -> SessionAttributes {
    if is_password {
        attributes | SessionAttributes::ContinueSession
    } else {
        attributes
    }
}

/// `SessionRemoveAssociationToHandle`: when an entity is deleted mid-command
/// (the `TPM2_NV_UndefineSpaceSpecial` case), any session still associated
/// with that handle is rebound to `TPM_RH_NULL` so later HMAC/response
/// processing resolves an empty auth value rather than a dangling handle.
pub fn remove_association_to_handle(ctx: &mut CommandCtx, handle: u32, null_handle: u32) {
    for attached in &mut ctx.sessions {
        if attached.associated_handle == Some(handle) {
            attached.associated_handle = Some(null_handle);
        }
    }
}

/// Per-handle facts [`parse_sessions`]/[`check_auth_session`] need, resolved
/// by the caller's entity layer ([`crate::entity`]/[`crate::store`]) the same
/// way [`PolicyCheckInputs`] keeps this module blind to where its facts come
/// from. One entry per position in the command's handle list, in order.
#[derive(Debug, Clone)]
pub struct HandleAuthContext {
    pub handle: u32,
    pub name: Vec<u8>,
    pub role: AuthRole,
    pub auth_value: Vec<u8>,
    pub auth_policy: Vec<u8>,
    pub policy_alg: Option<HashAlg>,
    pub auth_value_available: bool,
    pub auth_policy_available: bool,
    /// `IsDAExempted`.
    pub da_exempt: bool,
    pub is_platform: bool,
    pub is_lockout: bool,
    /// Whether this handle's role forces a policy session: `DUP`, `ADMIN`
    /// with no auth-value override, or a PCR policy is currently available
    /// on the object. Precomputed by the caller since it depends on the
    /// object's `adminWithPolicy`/PCR-policy state this module never reads
    /// directly.
    pub requires_policy_session: bool,
}

/// A minimal big-endian byte cursor over a command's session area. No
/// unmarshal helper exists elsewhere in this crate (wire marshaling
/// generally is out of scope); this is the one exception, since the session
/// area's own framing has to be parsed by something.
struct SessionAreaCursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> SessionAreaCursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        SessionAreaCursor { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, len: usize, tag: u8) -> TpmResult<&'a [u8]> {
        if self.remaining() < len {
            return Err(TpmError::session(ResponseCode::Size, tag));
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn read_u8(&mut self, tag: u8) -> TpmResult<u8> {
        Ok(self.take(1, tag)?[0])
    }

    fn read_u16(&mut self, tag: u8) -> TpmResult<u16> {
        let b = self.take(2, tag)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn read_u32(&mut self, tag: u8) -> TpmResult<u32> {
        let b = self.take(4, tag)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_sized(&mut self, tag: u8) -> TpmResult<Vec<u8>> {
        let len = self.read_u16(tag)? as usize;
        Ok(self.take(len, tag)?.to_vec())
    }
}

/// Per-algorithm cpHash/nameHash cache, since several sessions in the same
/// area commonly share a hash algorithm and `ComputeCpHash` is not free.
fn cp_and_name_hash(
    cache: &mut Vec<(HashAlg, Vec<u8>, Vec<u8>)>,
    crypto: &dyn Crypto,
    alg: HashAlg,
    command_code: u32,
    handle_names: &[Vec<u8>],
    parameters: &[u8],
) -> (Vec<u8>, Vec<u8>) {
    if let Some((_, cp, name)) = cache.iter().find(|(a, _, _)| *a == alg) {
        return (cp.clone(), name.clone());
    }
    let cp = compute_cp_hash(crypto, alg, command_code, handle_names, parameters);
    let name = compute_name_hash(crypto, alg, handle_names);
    cache.push((alg, cp.clone(), name.clone()));
    (cp, name)
}

fn command_audit_cp_hash(
    crypto: &dyn Crypto,
    command_is_audited: bool,
    digest_is_empty: bool,
    is_command_audit_digest_get: bool,
    nv_available: bool,
    audit_hash_alg: HashAlg,
    command_code: u32,
    handle_names: &[Vec<u8>],
    command_parameters: &[u8],
) -> TpmResult<Option<Vec<u8>>> {
    if !command_is_audited {
        return Ok(None);
    }
    if (digest_is_empty || is_command_audit_digest_get) && !nv_available {
        return Err(TpmError::new(ResponseCode::NvUnavailable));
    }
    Ok(Some(compute_cp_hash(crypto, audit_hash_alg, command_code, handle_names, command_parameters)))
}

/// `H(Name(A) || AuthValue(A))` compared against an HMAC session's committed
/// bound-entity digest — `IsSessionBindEntity`.
fn is_session_bind_entity(crypto: &dyn Crypto, session: &Session, handle: &HandleAuthContext) -> bool {
    if !session.is_bound {
        return false;
    }
    let SessionCommitment::BoundEntity(committed) = &session.commitment else {
        return false;
    };
    let digest = crypto.hash_chunks(session.hash_alg, &[&handle.name, &handle.auth_value]);
    crate::bitmem::buffers_equal(committed, &digest)
}

/// Inputs [`parse_sessions`] needs beyond the wire bytes themselves: the
/// command's own metadata and the per-handle facts its caller already
/// resolved through the entity layer.
pub struct ParseSessionsInput<'a> {
    pub command_code: u32,
    pub sessions_allowed: bool,
    pub decrypt_admissible: bool,
    pub encrypt_admissible: bool,
    pub pp_required: bool,
    pub handles: &'a [HandleAuthContext],
    pub session_area: &'a [u8],
    pub command_parameters: &'a mut Vec<u8>,
    pub decrypt_size: usize,
    pub physical_presence_asserted: bool,
    pub current_locality: u8,
    pub current_clock: Option<u64>,
    pub nv_available: bool,
    pub orderly: bool,
    pub command_audit_digest_is_empty: bool,
    pub is_command_audit_digest_get: bool,
    pub command_is_audited: bool,
    pub audit_hash_alg: HashAlg,
    pub current_exclusive_audit_session: Option<u32>,
    pub current_pcr_counter: u32,
    pub is_policy_secret_command: bool,
}

/// `ParseSessions`: unmarshals the command's session area, associates each
/// session with the handle in the same list position (when that position's
/// role requires authorization), and runs every attached session through its
/// authorization check. Returns the [`CommandCtx`] `BuildResponseSessions`
/// will need later, or the first error encountered (session-tagged per
/// `TPM_RC_S + n`, exactly as the original macro-expands every `return`
/// inside `SessionProcess.c`'s parsing loop).
#[allow(clippy::too_many_lines)]
pub fn parse_sessions(
    input: ParseSessionsInput<'_>,
    sessions: &mut SessionStore,
    da: &mut DaManager,
    crypto: &dyn Crypto,
) -> TpmResult<CommandCtx> {
    if !input.sessions_allowed && !input.session_area.is_empty() {
        return Err(TpmError::new(ResponseCode::AuthContext));
    }

    let mut ctx = CommandCtx::new();
    let mut cursor = SessionAreaCursor::new(input.session_area);

    // Step 2: unmarshal sessions until the area is exhausted.
    while cursor.remaining() > 0 {
        let tag = (ctx.sessions.len() + 1) as u8;
        if ctx.sessions.len() >= MAX_SESSION_NUM {
            return Err(TpmError::session(ResponseCode::Size, tag));
        }
        let session_handle = cursor.read_u32(tag)?;
        let nonce_caller = cursor.read_sized(tag)?;
        let attributes_byte = cursor.read_u8(tag)?;
        let attributes = SessionAttributes::from_bits(attributes_byte).ok_or_else(|| TpmError::session(ResponseCode::Attributes, tag))?;
        let input_auth_value = cursor.read_sized(tag)?;

        let is_pw = is_password_session(session_handle);
        if is_pw {
            if !attributes.difference(SessionAttributes::ContinueSession).is_empty() {
                return Err(TpmError::session(ResponseCode::Attributes, tag));
            }
            if !nonce_caller.is_empty() {
                return Err(TpmError::session(ResponseCode::Nonce, tag));
            }
        } else {
            if !sessions.is_loaded(session_handle) {
                return Err(TpmError::session(ResponseCode::ReferenceS0, tag));
            }
            let kind = HandleKind::classify(session_handle);
            let wants_policy = matches!(kind, Some(HandleKind::PolicySession(_)));
            let loaded_is_policy = sessions.get(session_handle).is_some_and(Session::is_policy);
            if wants_policy != loaded_is_policy {
                return Err(TpmError::session(ResponseCode::Handle, tag));
            }
            if ctx.sessions.iter().any(|s| s.session_handle == session_handle) {
                return Err(TpmError::session(ResponseCode::Handle, tag));
            }
        }

        if attributes.contains(SessionAttributes::Decrypt) {
            if !input.decrypt_admissible {
                return Err(TpmError::session(ResponseCode::Attributes, tag));
            }
            if ctx.decrypt_session_index.is_some() {
                return Err(TpmError::session(ResponseCode::Attributes, tag));
            }
            if sessions.get(session_handle).is_some_and(|s| s.symmetric == tpm2_call::Algorithm::Null) {
                return Err(TpmError::session(ResponseCode::Symmetric, tag));
            }
        }
        if attributes.contains(SessionAttributes::Encrypt) {
            if !input.encrypt_admissible {
                return Err(TpmError::session(ResponseCode::Attributes, tag));
            }
            if ctx.encrypt_session_index.is_some() {
                return Err(TpmError::session(ResponseCode::Attributes, tag));
            }
            if sessions.get(session_handle).is_some_and(|s| s.symmetric == tpm2_call::Algorithm::Null) {
                return Err(TpmError::session(ResponseCode::Symmetric, tag));
            }
        }
        if attributes.contains(SessionAttributes::Audit) {
            if ctx.sessions.iter().any(|s| s.attributes.contains(SessionAttributes::Audit)) {
                return Err(TpmError::session(ResponseCode::Attributes, tag));
            }
            if sessions.get(session_handle).is_some_and(Session::is_policy) {
                return Err(TpmError::session(ResponseCode::Attributes, tag));
            }
            let audit_exclusive_without_reset =
                attributes.contains(SessionAttributes::AuditExclusive) && !attributes.contains(SessionAttributes::AuditReset);
            if audit_exclusive_without_reset && input.current_exclusive_audit_session != Some(session_handle) {
                return Err(TpmError::session(ResponseCode::Exclusive, tag));
            }
        }

        let index = ctx.sessions.len();
        if attributes.contains(SessionAttributes::Decrypt) {
            ctx.decrypt_session_index = Some(index);
        }
        if attributes.contains(SessionAttributes::Encrypt) {
            ctx.encrypt_session_index = Some(index);
        }
        ctx.sessions.push(AttachedSession {
            session_handle,
            associated_handle: None,
            input_auth_value,
            nonce_caller,
            attributes,
            include_auth: false,
        });
    }

    // Step 3: associate handles positionally.
    for (i, handle) in input.handles.iter().enumerate() {
        if handle.role == AuthRole::None {
            continue;
        }
        if i >= ctx.sessions.len() {
            return Err(TpmError::new(ResponseCode::AuthMissing));
        }
        ctx.sessions[i].associated_handle = Some(handle.handle);
    }

    // Step 4: per-session authorization.
    let mut hash_cache: Vec<(HashAlg, Vec<u8>, Vec<u8>)> = Vec::new();
    let handle_names: Vec<Vec<u8>> = input.handles.iter().map(|h| h.name.clone()).collect();
    for idx in 0..ctx.sessions.len() {
        let tag = (idx + 1) as u8;
        let session_handle = ctx.sessions[idx].session_handle;
        if sessions.get(session_handle).is_some_and(|s| s.kind == SessionKind::Trial) {
            return Err(TpmError::session(ResponseCode::Attributes, tag));
        }
        if sessions.get(session_handle).is_some_and(|s| s.is_da_bound) {
            let is_lockout_bound = sessions.get(session_handle).is_some_and(|s| s.is_lockout_bound);
            da.check_locked_out(is_lockout_bound, input.nv_available, input.orderly)
                .map_err(|e| TpmError::session(e.code, tag))?;
        }

        let hash_alg = sessions.get(session_handle).map(|s| s.hash_alg);
        let (cp_hash, name_hash) = if let Some(alg) = hash_alg {
            cp_and_name_hash(&mut hash_cache, crypto, alg, input.command_code, &handle_names, input.command_parameters)
        } else {
            (Vec::new(), Vec::new())
        };

        if ctx.sessions[idx].attributes.contains(SessionAttributes::Audit) {
            ctx.cp_hash_for_audit = cp_hash.clone();
        }

        let associated_handle = ctx.sessions[idx].associated_handle;
        if let Some(associated) = associated_handle {
            let handle_ctx = input.handles.iter().find(|h| h.handle == associated).ok_or_else(|| TpmError::session(ResponseCode::Handle, tag))?;
            let inputs = CheckAuthSessionInput {
                handle_ctx,
                command_code: input.command_code,
                requires_physical_presence: input.pp_required,
                physical_presence_asserted: input.physical_presence_asserted,
                nv_available: input.nv_available,
                orderly: input.orderly,
                current_clock: input.current_clock,
                current_locality: input.current_locality,
                cp_hash: &cp_hash,
                name_hash: &name_hash,
                associated_is_nv_index: matches!(HandleKind::classify(associated), Some(HandleKind::NvIndex(_))),
                nv_written: None,
                current_pcr_counter: input.current_pcr_counter,
                is_policy_secret_command: input.is_policy_secret_command,
            };
            let attached = ctx.sessions[idx].clone();
            let include_auth = check_auth_session(da, crypto, sessions, &attached, &inputs, &ctx, idx)
                .map_err(|e| TpmError::session(e.code, tag))?;
            ctx.sessions[idx].include_auth = include_auth;
        } else {
            let attached = ctx.sessions[idx].clone();
            if !attached.attributes.intersects(SessionAttributes::Decrypt | SessionAttributes::Encrypt | SessionAttributes::Audit) {
                return Err(TpmError::session(ResponseCode::Attributes, tag));
            }
            let session = sessions.get(session_handle).ok_or_else(|| TpmError::session(ResponseCode::ReferenceS0, tag))?;
            let extra = extra_nonces_for(&ctx, idx);
            let expected =
                compute_command_hmac(crypto, session, None, attached.input_auth_value.is_empty(), &cp_hash, &attached.nonce_caller, &extra, attached.attributes.bits());
            check_session_hmac(da, session, &attached.input_auth_value, &expected, true, false, false, input.nv_available)
                .map_err(|e| TpmError::session(e.code, tag))?;
        }
    }

    // Step 5: command-audit cpHash.
    ctx.cp_hash_for_command_audit = command_audit_cp_hash(
        crypto,
        input.command_is_audited,
        input.command_audit_digest_is_empty,
        input.is_command_audit_digest_get,
        input.nv_available,
        input.audit_hash_alg,
        input.command_code,
        &handle_names,
        input.command_parameters,
    )?;

    // Step 6: decrypt the first command parameter in place.
    if let Some(decrypt_idx) = ctx.decrypt_session_index {
        let attached = ctx.sessions[decrypt_idx].clone();
        if let Some(session) = sessions.get(attached.session_handle) {
            let extra_key = attached
                .associated_handle
                .and_then(|h| input.handles.iter().find(|hc| hc.handle == h))
                .map(|h| h.auth_value.clone())
                .unwrap_or_default();
            let mut key = session.session_key.clone();
            key.extend_from_slice(&extra_key);
            let size = input.decrypt_size.min(input.command_parameters.len());
            let plaintext = session.hash_alg;
            let decrypted = crypto.decrypt(plaintext, &key, &attached.nonce_caller, &input.command_parameters[..size]);
            input.command_parameters[..size].copy_from_slice(&decrypted);
        }
    }

    Ok(ctx)
}

/// The entity-independent facts [`check_auth_session`] needs about the
/// handle a session is associated with, plus the command-wide facts that do
/// not belong on [`HandleAuthContext`] itself.
pub struct CheckAuthSessionInput<'a> {
    pub handle_ctx: &'a HandleAuthContext,
    pub command_code: u32,
    pub requires_physical_presence: bool,
    pub physical_presence_asserted: bool,
    pub nv_available: bool,
    pub orderly: bool,
    pub current_clock: Option<u64>,
    pub current_locality: u8,
    pub cp_hash: &'a [u8],
    pub name_hash: &'a [u8],
    pub associated_is_nv_index: bool,
    pub nv_written: Option<bool>,
    pub current_pcr_counter: u32,
    pub is_policy_secret_command: bool,
}

/// `CheckAuthSession`: authorizes one session against the handle it is
/// associated with, dispatching to PW comparison, HMAC verification, or
/// [`check_policy_auth_session`] depending on the session's kind. Returns
/// whether the associated entity's auth value was folded into the
/// authentication key (`includeAuth`), which [`build_response_sessions`]
/// needs again for the matching response HMAC.
#[allow(clippy::too_many_arguments)]
pub fn check_auth_session(
    da: &mut DaManager,
    crypto: &dyn Crypto,
    sessions: &SessionStore,
    attached: &AttachedSession,
    input: &CheckAuthSessionInput<'_>,
    ctx: &CommandCtx,
    session_index: usize,
) -> TpmResult<bool> {
    let a = input.handle_ctx;
    if a.is_platform && input.requires_physical_presence && !input.physical_presence_asserted {
        return Err(TpmError::new(ResponseCode::Pp));
    }

    let is_pw = is_password_session(attached.session_handle);
    let session = if is_pw { None } else { sessions.get(attached.session_handle) };

    let include_auth = match session {
        None => true,
        Some(s) if s.is_policy() => s.is_password,
        Some(s) => !is_session_bind_entity(crypto, s, a),
    };

    if (session.is_none() || include_auth) && !a.da_exempt {
        da.check_locked_out(a.is_lockout, input.nv_available, input.orderly)?;
    }

    match session {
        None => {
            if a.requires_policy_session {
                return Err(TpmError::new(ResponseCode::AuthType));
            }
            if !a.auth_value_available {
                return Err(TpmError::new(ResponseCode::AuthUnavailable));
            }
        }
        Some(s) if !s.is_policy() => {
            if a.requires_policy_session {
                return Err(TpmError::new(ResponseCode::AuthType));
            }
            if !a.auth_value_available {
                return Err(TpmError::new(ResponseCode::AuthUnavailable));
            }
        }
        Some(s) => {
            if !a.auth_policy_available {
                return Err(TpmError::new(ResponseCode::AuthUnavailable));
            }
            let policy_inputs = PolicyCheckInputs {
                command_code: input.command_code,
                auth_policy: &a.auth_policy,
                policy_alg: a.policy_alg.unwrap_or(s.hash_alg),
                current_clock: input.current_clock,
                current_locality: input.current_locality,
                physical_presence_asserted: input.physical_presence_asserted,
                cp_hash: input.cp_hash,
                name_hash: input.name_hash,
                associated_is_nv_index: input.associated_is_nv_index,
                nv_written: input.nv_written,
                requires_admin_or_dup: a.requires_policy_session,
                current_pcr_counter: input.current_pcr_counter,
                is_policy_secret_command: input.is_policy_secret_command,
            };
            check_policy_auth_session(s, &policy_inputs)?;
        }
    }

    let is_password_like = is_pw || session.is_some_and(|s| s.is_password);
    if is_password_like {
        if !check_pw_auth(&attached.input_auth_value, &a.auth_value) {
            let ctx_lockout = LockoutContext {
                is_password_session: is_pw,
                is_lockout_bound: session.is_some_and(|s| s.is_lockout_bound),
                is_da_bound: session.is_some_and(|s| s.is_da_bound),
                includes_auth: include_auth,
            };
            return Err(da.increment_lockout(a.da_exempt, a.is_lockout, ctx_lockout, input.nv_available));
        }
    } else {
        let session = session.expect("non-password, non-policy-password authentication requires a loaded session");
        let key_auth = include_auth.then_some(a.auth_value.as_slice());
        let extra = extra_nonces_for(ctx, session_index);
        let expected = compute_command_hmac(
            crypto,
            session,
            key_auth,
            attached.input_auth_value.is_empty(),
            input.cp_hash,
            &attached.nonce_caller,
            &extra,
            attached.attributes.bits(),
        );
        check_session_hmac(da, session, &attached.input_auth_value, &expected, a.da_exempt, a.is_lockout, include_auth, input.nv_available)?;
    }

    Ok(include_auth)
}

/// Inputs for [`check_auth_no_session`]: the command's handle list (none of
/// which may require authorization) plus whatever the command-audit cpHash
/// snapshot needs.
pub struct NoSessionInput<'a> {
    pub handles: &'a [HandleAuthContext],
    pub command_code: u32,
    pub command_is_audited: bool,
    pub command_audit_digest_is_empty: bool,
    pub is_command_audit_digest_get: bool,
    pub nv_available: bool,
    pub audit_hash_alg: HashAlg,
    pub command_parameters: &'a [u8],
}

/// `CheckAuthNoSession`: the path taken when the command's session area is
/// empty. Every handle must admit `AUTH_NONE`; the command-audit cpHash is
/// still computed if the command is audited.
pub fn check_auth_no_session(crypto: &dyn Crypto, input: &NoSessionInput<'_>) -> TpmResult<CommandCtx> {
    for handle in input.handles {
        if handle.role != AuthRole::None {
            return Err(TpmError::new(ResponseCode::AuthMissing));
        }
    }
    let mut ctx = CommandCtx::new();
    let names: Vec<Vec<u8>> = input.handles.iter().map(|h| h.name.clone()).collect();
    ctx.cp_hash_for_command_audit = command_audit_cp_hash(
        crypto,
        input.command_is_audited,
        input.command_audit_digest_is_empty,
        input.is_command_audit_digest_get,
        input.nv_available,
        input.audit_hash_alg,
        input.command_code,
        &names,
        input.command_parameters,
    )?;
    Ok(ctx)
}

/// Inputs [`build_response_sessions`] needs that come from outside the
/// pipeline: the command's outcome, the response parameter buffer (mutated
/// in place when an encrypt session applies), and the persistent
/// audit-digest/exclusivity state the `Tpm` aggregate owns.
pub struct BuildResponseSessionsInput<'a> {
    pub command_code: u32,
    pub tag_carries_sessions: bool,
    pub response_parameters: &'a mut Vec<u8>,
    pub auth_values: &'a std::collections::BTreeMap<u32, Vec<u8>>,
    pub sessions_allowed: bool,
    pub command_is_audited: bool,
    pub audit_hash_alg: HashAlg,
    pub command_audit_digest: &'a mut Vec<u8>,
    pub current_exclusive_audit_session: Option<u32>,
    pub current_clock: u64,
}

/// One session's contribution to the response authorization area.
#[derive(Debug, Clone)]
pub struct ResponseSessionAuth {
    pub session_handle: u32,
    pub nonce_tpm: Vec<u8>,
    pub attributes: SessionAttributes,
    pub hmac: Vec<u8>,
}

/// Everything [`build_response_sessions`] produces: the marshalable
/// per-session response auths plus the updated exclusive-audit-session
/// handle and command-audit outcome the caller's `Tpm` aggregate persists.
pub struct BuildResponseSessionsOutput {
    pub per_session: Vec<ResponseSessionAuth>,
    pub exclusive_audit_session: Option<u32>,
    pub command_audit_outcome: CommandAuditOutcome,
}

/// `BuildResponseSessions`: refreshes nonces, encrypts the first response
/// parameter for an encrypt session, extends the audit and command-audit
/// digests, computes each session's response HMAC, forces `continueSession`
/// for PW sessions, and flushes or resets every session per `continueSession`
/// — in that order, matching the original's single top-to-bottom pass.
pub fn build_response_sessions(
    ctx: &CommandCtx,
    sessions: &mut SessionStore,
    crypto: &dyn Crypto,
    rng: &mut dyn Rng,
    input: BuildResponseSessionsInput<'_>,
) -> BuildResponseSessionsOutput {
    // Step 1: nonce refresh + encrypt.
    if input.tag_carries_sessions {
        for attached in &ctx.sessions {
            if is_password_session(attached.session_handle) {
                continue;
            }
            if let Some(session) = sessions.get_mut(attached.session_handle) {
                let fresh = rng.nonce(session.hash_alg.digest_size());
                session.update_nonce(fresh);
            }
        }
        if let Some(encrypt_idx) = ctx.encrypt_session_index {
            let attached = ctx.sessions[encrypt_idx].clone();
            if let Some(session) = sessions.get(attached.session_handle) {
                let extra_key = attached.associated_handle.and_then(|h| input.auth_values.get(&h)).cloned().unwrap_or_default();
                let mut key = session.session_key.clone();
                key.extend_from_slice(&extra_key);
                let plaintext = input.response_parameters.clone();
                let ciphertext = crypto.encrypt(session.hash_alg, &key, &attached.nonce_caller, &plaintext);
                *input.response_parameters = ciphertext;
            }
        }
    }

    // Step 2: UpdateAuditSessionStatus.
    let exclusive = update_audit_session_status(ctx, &mut |h| sessions.get_mut(h), input.current_exclusive_audit_session, input.sessions_allowed);
    for attached in &ctx.sessions {
        if !attached.attributes.contains(SessionAttributes::Audit) {
            continue;
        }
        let hash_alg = sessions.get(attached.session_handle).map(|s| s.hash_alg);
        if let Some(hash_alg) = hash_alg {
            let rp_hash = compute_rp_hash(crypto, hash_alg, input.command_code, input.response_parameters);
            if let Some(session) = sessions.get_mut(attached.session_handle) {
                extend_audit_digest(crypto, session, &ctx.cp_hash_for_audit, &rp_hash);
            }
        }
    }

    // Step 3: CommandAudit digest extension.
    let command_audit_outcome = if let Some(cp_hash_for_command_audit) = &ctx.cp_hash_for_command_audit {
        let rp_hash = compute_rp_hash(crypto, input.audit_hash_alg, input.command_code, input.response_parameters);
        extend_command_audit_digest(crypto, input.command_is_audited, input.command_audit_digest, input.audit_hash_alg, cp_hash_for_command_audit, &rp_hash)
    } else {
        CommandAuditOutcome::NotAudited
    };

    // Steps 4-6: per-session response auth.
    let mut per_session = Vec::with_capacity(ctx.sessions.len());
    for attached in &ctx.sessions {
        let is_pw = is_password_session(attached.session_handle);
        let forced_attributes = force_continue_session(attached.attributes, is_pw);
        if is_pw {
            per_session.push(ResponseSessionAuth {
                session_handle: attached.session_handle,
                nonce_tpm: Vec::new(),
                attributes: forced_attributes,
                hmac: Vec::new(),
            });
            continue;
        }
        let Some(session) = sessions.get(attached.session_handle) else {
            continue;
        };
        if session.is_password {
            per_session.push(ResponseSessionAuth {
                session_handle: attached.session_handle,
                nonce_tpm: session.nonce_tpm.clone(),
                attributes: forced_attributes,
                hmac: Vec::new(),
            });
            continue;
        }
        let rp_hash = compute_rp_hash(crypto, session.hash_alg, input.command_code, input.response_parameters);
        let auth_value = attached.associated_handle.and_then(|h| input.auth_values.get(&h));
        let key_auth = if attached.include_auth { auth_value.map(Vec::as_slice) } else { None };
        let hmac = compute_response_hmac(crypto, session, key_auth, attached.input_auth_value.is_empty(), &rp_hash);
        per_session.push(ResponseSessionAuth {
            session_handle: attached.session_handle,
            nonce_tpm: session.nonce_tpm.clone(),
            attributes: forced_attributes,
            hmac,
        });
    }

    // Step 7: UpdateInternalSession.
    for attached in &ctx.sessions {
        if is_password_session(attached.session_handle) {
            continue;
        }
        if !attached.attributes.contains(SessionAttributes::ContinueSession) {
            sessions.remove(attached.session_handle);
        } else if let Some(session) = sessions.get_mut(attached.session_handle) {
            if session.is_policy() {
                session.digest = SessionDigest::Policy(vec![0u8; session.hash_alg.digest_size()]);
                session.command_code = None;
                session.timeout = None;
                session.commitment = SessionCommitment::None;
                session.pcr_counter = None;
                session.pp_required = false;
                session.is_password = false;
                session.start_time = input.current_clock;
            }
        }
    }

    BuildResponseSessionsOutput { per_session, exclusive_audit_session: exclusive, command_audit_outcome }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::sim::SimCrypto;

    fn sample_session() -> Session {
        let mut s = Session::new(SessionKind::Hmac, HashAlg::Sha256, vec![7; 32], vec![8; 32]);
        s.session_key = vec![1, 2, 3, 4];
        s
    }

    #[test]
    fn cp_hash_changes_with_parameters() {
        let crypto = SimCrypto;
        let names = vec![vec![1, 2, 3]];
        let a = compute_cp_hash(&crypto, HashAlg::Sha256, 0x140, &names, b"aaa");
        let b = compute_cp_hash(&crypto, HashAlg::Sha256, 0x140, &names, b"bbb");
        assert_ne!(a, b);
    }

    #[test]
    fn name_hash_ignores_command_code_and_parameters() {
        let crypto = SimCrypto;
        let names = vec![vec![1, 2, 3]];
        let direct = compute_name_hash(&crypto, HashAlg::Sha256, &names);
        let via_cp_hash_with_different_cc =
            compute_cp_hash(&crypto, HashAlg::Sha256, 0x999, &names, b"");
        // Not equal in general (cpHash also folds in the command code), but
        // name_hash itself must not depend on anything but the names.
        let direct_again = compute_name_hash(&crypto, HashAlg::Sha256, &names);
        assert_eq!(direct, direct_again);
        assert_ne!(direct, via_cp_hash_with_different_cc);
    }

    #[test]
    fn check_pw_auth_strips_trailing_zeros_before_comparing() {
        assert!(check_pw_auth(&[1, 2, 0, 0], &[1, 2]));
        assert!(!check_pw_auth(&[1, 2, 3], &[1, 2]));
    }

    #[test]
    fn extra_nonces_only_apply_to_session_zero_with_an_associated_handle() {
        let mut ctx = CommandCtx::new();
        ctx.sessions.push(AttachedSession {
            session_handle: 0x0200_0001,
            associated_handle: Some(0x8000_0001),
            input_auth_value: vec![],
            nonce_caller: vec![],
            attributes: SessionAttributes::empty(),
            include_auth: false,
        });
        ctx.sessions.push(AttachedSession {
            session_handle: 0x0200_0002,
            associated_handle: None,
            input_auth_value: vec![],
            nonce_caller: vec![],
            attributes: SessionAttributes::Decrypt,
            include_auth: false,
        });
        ctx.decrypt_session_index = Some(1);
        let extra = extra_nonces_for(&ctx, 0);
        assert!(extra.decrypt.is_some());
        let extra_for_non_zero = extra_nonces_for(&ctx, 1);
        assert!(extra_for_non_zero.decrypt.is_none());
    }

    #[test]
    fn empty_key_and_empty_input_auth_produce_an_empty_hmac() {
        let crypto = SimCrypto;
        let mut session = sample_session();
        session.session_key.clear();
        let hmac = compute_command_hmac(&crypto, &session, None, true, b"cp", b"nc", &ExtraNonces::default(), 0);
        assert!(hmac.is_empty());
    }

    #[test]
    fn command_hmac_changes_when_the_cp_hash_changes() {
        let crypto = SimCrypto;
        let session = sample_session();
        let a = compute_command_hmac(&crypto, &session, None, false, b"cp-a", b"nc", &ExtraNonces::default(), 0);
        let b = compute_command_hmac(&crypto, &session, None, false, b"cp-b", b"nc", &ExtraNonces::default(), 0);
        assert_ne!(a, b);
    }

    #[test]
    fn rp_hash_is_deterministic_for_the_same_inputs() {
        let crypto = SimCrypto;
        let a = compute_rp_hash(&crypto, HashAlg::Sha256, 0x140, b"resp");
        let b = compute_rp_hash(&crypto, HashAlg::Sha256, 0x140, b"resp");
        assert_eq!(a, b);
    }

    #[test]
    fn policy_check_rejects_digest_mismatch() {
        let mut session = Session::new(SessionKind::Policy, HashAlg::Sha256, vec![], vec![]);
        session.digest = SessionDigest::Policy(vec![1; 32]);
        let inputs = PolicyCheckInputs {
            command_code: 1,
            auth_policy: &[2; 32],
            policy_alg: HashAlg::Sha256,
            current_clock: None,
            current_locality: 0,
            physical_presence_asserted: true,
            cp_hash: &[],
            name_hash: &[],
            associated_is_nv_index: false,
            nv_written: None,
            requires_admin_or_dup: false,
            current_pcr_counter: 0,
            is_policy_secret_command: false,
        };
        let err = check_policy_auth_session(&session, &inputs).unwrap_err();
        assert_eq!(err.code, ResponseCode::PolicyFail);
    }

    #[test]
    fn policy_check_rejects_command_code_mismatch() {
        let digest = vec![2u8; 32];
        let mut session = Session::new(SessionKind::Policy, HashAlg::Sha256, vec![], vec![]);
        session.digest = SessionDigest::Policy(digest.clone());
        session.command_code = Some(5);
        let inputs = PolicyCheckInputs {
            command_code: 6,
            auth_policy: &digest,
            policy_alg: HashAlg::Sha256,
            current_clock: None,
            current_locality: 0,
            physical_presence_asserted: true,
            cp_hash: &[],
            name_hash: &[],
            associated_is_nv_index: false,
            nv_written: None,
            requires_admin_or_dup: false,
            current_pcr_counter: 0,
            is_policy_secret_command: false,
        };
        let err = check_policy_auth_session(&session, &inputs).unwrap_err();
        assert_eq!(err.code, ResponseCode::PolicyCc);
    }

    #[test]
    fn policy_check_rejects_expired_timeout() {
        let digest = vec![3u8; 32];
        let mut session = Session::new(SessionKind::Policy, HashAlg::Sha256, vec![], vec![]);
        session.digest = SessionDigest::Policy(digest.clone());
        session.timeout = Some(10);
        let inputs = PolicyCheckInputs {
            command_code: 1,
            auth_policy: &digest,
            policy_alg: HashAlg::Sha256,
            current_clock: Some(20),
            current_locality: 0,
            physical_presence_asserted: true,
            cp_hash: &[],
            name_hash: &[],
            associated_is_nv_index: false,
            nv_written: None,
            requires_admin_or_dup: false,
            current_pcr_counter: 0,
            is_policy_secret_command: false,
        };
        let err = check_policy_auth_session(&session, &inputs).unwrap_err();
        assert_eq!(err.code, ResponseCode::Expired);
    }

    #[test]
    fn policy_check_passes_when_everything_matches() {
        let digest = vec![4u8; 32];
        let mut session = Session::new(SessionKind::Policy, HashAlg::Sha256, vec![], vec![]);
        session.digest = SessionDigest::Policy(digest.clone());
        let inputs = PolicyCheckInputs {
            command_code: 1,
            auth_policy: &digest,
            policy_alg: HashAlg::Sha256,
            current_clock: None,
            current_locality: 0,
            physical_presence_asserted: true,
            cp_hash: &[],
            name_hash: &[],
            associated_is_nv_index: false,
            nv_written: None,
            requires_admin_or_dup: false,
            current_pcr_counter: 0,
            is_policy_secret_command: false,
        };
        assert!(check_policy_auth_session(&session, &inputs).is_ok());
    }

    #[test]
    fn command_audit_digest_starts_fresh_from_empty() {
        let crypto = SimCrypto;
        let mut digest = Vec::new();
        let outcome =
            extend_command_audit_digest(&crypto, true, &mut digest, HashAlg::Sha256, b"cp", b"rp");
        assert_eq!(outcome, CommandAuditOutcome::CounterAdvanced);
        assert_eq!(digest.len(), 32);
    }

    #[test]
    fn command_audit_digest_handles_the_hash_alg_changed_sentinel() {
        let crypto = SimCrypto;
        let mut digest = vec![0u8];
        let outcome =
            extend_command_audit_digest(&crypto, true, &mut digest, HashAlg::Sha256, b"cp", b"rp");
        assert_eq!(outcome, CommandAuditOutcome::HashAlgJustChanged);
        assert!(digest.is_empty());
    }

    #[test]
    fn command_audit_digest_skips_unaudited_commands() {
        let crypto = SimCrypto;
        let mut digest = Vec::new();
        let outcome =
            extend_command_audit_digest(&crypto, false, &mut digest, HashAlg::Sha256, b"cp", b"rp");
        assert_eq!(outcome, CommandAuditOutcome::NotAudited);
        assert!(digest.is_empty());
    }

    #[test]
    fn remove_association_to_handle_rebinds_matching_sessions_to_null() {
        let mut ctx = CommandCtx::new();
        ctx.sessions.push(AttachedSession {
            session_handle: 1,
            associated_handle: Some(0x0100_0001),
            input_auth_value: vec![],
            nonce_caller: vec![],
            attributes: SessionAttributes::empty(),
            include_auth: false,
        });
        remove_association_to_handle(&mut ctx, 0x0100_0001, tpm2_call::Handle::Null as u32);
        assert_eq!(ctx.sessions[0].associated_handle, Some(tpm2_call::Handle::Null as u32));
    }

    #[test]
    fn check_session_hmac_accepts_a_matching_hmac_without_touching_da() {
        let mut da = DaManager::new(5, 1000, 1000);
        let session = sample_session();
        check_session_hmac(&mut da, &session, b"same", b"same", false, false, true, true).unwrap();
        assert_eq!(da.failed_tries, 0);
    }

    #[test]
    fn check_session_hmac_registers_a_da_failure_on_mismatch() {
        let mut da = DaManager::new(5, 1000, 1000);
        let session = sample_session();
        let err = check_session_hmac(&mut da, &session, b"wrong", b"expected", false, false, true, false)
            .unwrap_err();
        assert_eq!(err.code, ResponseCode::AuthFail);
        assert!(da.has_pending());
    }

    #[test]
    fn update_audit_session_status_initializes_a_fresh_audit_session() {
        let mut ctx = CommandCtx::new();
        ctx.sessions.push(AttachedSession {
            session_handle: 0x0200_0001,
            associated_handle: None,
            input_auth_value: vec![],
            nonce_caller: vec![],
            attributes: SessionAttributes::Audit,
            include_auth: false,
        });
        let mut session = sample_session();
        let mut lookup = |handle: u32| -> Option<&mut Session> {
            if handle == 0x0200_0001 {
                Some(&mut session)
            } else {
                None
            }
        };
        let exclusive = update_audit_session_status(&ctx, &mut lookup, None, true);
        assert_eq!(exclusive, Some(0x0200_0001));
        assert!(session.is_audit_session);
        assert!(!session.is_bound);
    }

    #[test]
    fn password_sessions_always_get_continue_session_forced_on() {
        let cleared = force_continue_session(SessionAttributes::empty(), true);
        assert!(cleared.contains(SessionAttributes::ContinueSession));
        let non_password = force_continue_session(SessionAttributes::empty(), false);
        assert!(!non_password.contains(SessionAttributes::ContinueSession));
    }

    #[test]
    fn update_audit_session_status_clears_exclusivity_with_no_audit_session_present() {
        let ctx = CommandCtx::new();
        let mut lookup = |_: u32| -> Option<&mut Session> { None };
        let exclusive = update_audit_session_status(&ctx, &mut lookup, Some(0x0200_0001), true);
        assert_eq!(exclusive, None);
    }
}
