//! End-to-end scenarios composing several pipeline pieces the way a command
//! dispatcher would, one test per named scenario.

use std::collections::BTreeMap;

use tpm2_call::{AuthRole, Handle, ResponseCode, SessionAttributes};
use tpm2_core::crypto::sim::{SimCrypto, SimRng};
use tpm2_core::crypto::{Crypto, HashAlg};
use tpm2_core::da::{DaManager, LockoutContext};
use tpm2_core::pipeline::{
    build_response_sessions, check_auth_no_session, check_policy_auth_session, check_pw_auth, extend_command_audit_digest,
    force_continue_session, parse_sessions, update_audit_session_status, AttachedSession, BuildResponseSessionsInput,
    CommandAuditOutcome, CommandCtx, HandleAuthContext, NoSessionInput, ParseSessionsInput, PolicyCheckInputs,
};
use tpm2_core::session::{Session, SessionCommitment, SessionDigest, SessionKind, SessionStore};

/// S1: PW success — trailing zero stripped, comparison succeeds, and the
/// response session attributes force `continueSession` on.
#[test]
fn s1_pw_success_strips_trailing_zero_and_forces_continue_session() {
    let entity_auth = [0x01, 0x02, 0x03];
    let input_auth = [0x01, 0x02, 0x03, 0x00];
    assert!(check_pw_auth(&input_auth, &entity_auth));

    let response_attrs = force_continue_session(SessionAttributes::empty(), true);
    assert!(response_attrs.contains(SessionAttributes::ContinueSession));
}

/// S2: PW failure charges DA — `failedTries` increments by exactly 1 and a
/// pending NV write is queued for it.
#[test]
fn s2_pw_failure_charges_da_by_exactly_one() {
    let entity_auth = [0x01, 0x02, 0x03];
    let input_auth = [0x01, 0x02, 0x04];
    assert!(!check_pw_auth(&input_auth, &entity_auth));

    let mut da = DaManager::new(5, 1000, 1000);
    let ctx = LockoutContext {
        is_password_session: true,
        is_lockout_bound: false,
        is_da_bound: false,
        includes_auth: true,
    };
    let err = da.increment_lockout(false, false, ctx, true);
    assert_eq!(err.code, ResponseCode::AuthFail);
    assert_eq!(da.failed_tries, 1);
    assert!(da.has_pending());
}

/// S3: LOCKOUT pre-emption — once `lockOutAuthEnabled` is false, any
/// lockout-authorizing command is refused without touching `failedTries`.
#[test]
fn s3_lockout_preemption_leaves_failed_tries_untouched() {
    let mut da = DaManager::new(5, 1000, 1000);
    da.lockout_auth_enabled = false;
    let before = da.failed_tries;

    let err = da.check_locked_out(true, true, true).unwrap_err();
    assert_eq!(err.code, ResponseCode::Lockout);
    assert_eq!(da.failed_tries, before);
}

/// S4: policy mismatch — a committed policy digest that does not match the
/// entity's bound policy fails with `POLICY_FAIL` and never touches DA.
#[test]
fn s4_policy_digest_mismatch_fails_without_da_charge() {
    let mut session = Session::new(SessionKind::Policy, HashAlg::Sha256, vec![], vec![]);
    session.digest = SessionDigest::Policy(vec![0xAA; 32]);

    let inputs = PolicyCheckInputs {
        command_code: 0x1,
        auth_policy: &[0xBB; 32],
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

    let da = DaManager::new(5, 1000, 1000);
    assert_eq!(da.failed_tries, 0);
}

/// S5: audit digest chain — the first audited command starts a fresh digest
/// from an all-zero buffer and advances the counter; the second extends it.
#[test]
fn s5_audit_digest_chains_across_two_commands() {
    let crypto = SimCrypto;
    let mut digest = Vec::new();
    let mut audit_counter = 0u64;

    let cp_hash_1 = crypto.hash(HashAlg::Sha256, b"command-1-params");
    let rp_hash_1 = crypto.hash(HashAlg::Sha256, b"response-1-params");
    let outcome_1 = extend_command_audit_digest(&crypto, true, &mut digest, HashAlg::Sha256, &cp_hash_1, &rp_hash_1);
    assert_eq!(outcome_1, CommandAuditOutcome::CounterAdvanced);
    audit_counter += 1;
    let expected_1 = crypto.hash_chunks(HashAlg::Sha256, &[&vec![0u8; 32], &cp_hash_1, &rp_hash_1]);
    assert_eq!(digest, expected_1);

    let cp_hash_2 = crypto.hash(HashAlg::Sha256, b"command-2-params");
    let rp_hash_2 = crypto.hash(HashAlg::Sha256, b"response-2-params");
    let outcome_2 = extend_command_audit_digest(&crypto, true, &mut digest, HashAlg::Sha256, &cp_hash_2, &rp_hash_2);
    assert_eq!(outcome_2, CommandAuditOutcome::Extended);
    let expected_2 = crypto.hash_chunks(HashAlg::Sha256, &[&expected_1, &cp_hash_2, &rp_hash_2]);
    assert_eq!(digest, expected_2);
    assert_eq!(audit_counter, 1);
}

/// S6: exclusive audit — the first session to audit a command claims
/// exclusivity; a different audit session on the next command clears it, and
/// the first session's own digest is untouched by that clearing.
#[test]
fn s6_exclusive_audit_session_handoff() {
    let mut session_1 = Session::new(SessionKind::Hmac, HashAlg::Sha256, vec![], vec![]);
    let mut session_2 = Session::new(SessionKind::Hmac, HashAlg::Sha256, vec![], vec![]);

    let mut ctx_1 = CommandCtx::new();
    ctx_1.sessions.push(AttachedSession {
        session_handle: 0x0200_0001,
        associated_handle: None,
        input_auth_value: vec![],
        nonce_caller: vec![],
        attributes: SessionAttributes::Audit,
        include_auth: true,
    });
    let mut lookup_1 = |handle: u32| -> Option<&mut Session> {
        (handle == 0x0200_0001).then_some(&mut session_1)
    };
    let exclusive_after_first = update_audit_session_status(&ctx_1, &mut lookup_1, None, true);
    assert_eq!(exclusive_after_first, Some(0x0200_0001));
    assert!(session_1.is_audit_session);
    let session_1_digest_after_first = session_1.digest.clone();

    let mut ctx_2 = CommandCtx::new();
    ctx_2.sessions.push(AttachedSession {
        session_handle: 0x0200_0002,
        associated_handle: None,
        input_auth_value: vec![],
        nonce_caller: vec![],
        attributes: SessionAttributes::Audit,
        include_auth: true,
    });
    let mut lookup_2 = |handle: u32| -> Option<&mut Session> {
        (handle == 0x0200_0002).then_some(&mut session_2)
    };
    let exclusive_after_second = update_audit_session_status(&ctx_2, &mut lookup_2, exclusive_after_first, true);
    assert_eq!(exclusive_after_second, Some(0x0200_0002));
    assert!(session_2.is_audit_session);

    // The first session was not part of the second command at all, so its
    // own digest/state is untouched by the handoff.
    assert_eq!(session_1.digest, session_1_digest_after_first);
}

/// Invariant 7: a command whose handles all require `AUTH_NONE` accepts an
/// empty session area — nothing in `CommandCtx` requires sessions to exist.
#[test]
fn empty_session_area_is_a_valid_command_ctx() {
    let ctx = CommandCtx::new();
    assert_eq!(ctx.sessions.len(), 0);
}

/// Invariant 8: `ComputeCpHash` is a pure function of its inputs.
#[test]
fn cp_hash_is_deterministic_across_calls() {
    let crypto = SimCrypto;
    let names = vec![vec![1, 2, 3, 4]];
    let a = tpm2_core::pipeline::compute_cp_hash(&crypto, HashAlg::Sha256, 0x157, &names, b"params");
    let b = tpm2_core::pipeline::compute_cp_hash(&crypto, HashAlg::Sha256, 0x157, &names, b"params");
    assert_eq!(a, b);
}

/// A trial policy session's committed name-hash comparison is exercised
/// alongside S4 to confirm the two commitment kinds stay distinct.
#[test]
fn name_hash_commitment_is_checked_independently_of_cp_hash_commitment() {
    let crypto = SimCrypto;
    let name_hash = crypto.hash(HashAlg::Sha256, b"object-name");
    let mut session = Session::new(SessionKind::Trial, HashAlg::Sha256, vec![], vec![]);
    session.digest = SessionDigest::Policy(vec![0xCC; 32]);
    session.commitment = SessionCommitment::NameHash(name_hash.clone());

    let matching = PolicyCheckInputs {
        command_code: 1,
        auth_policy: &[0xCC; 32],
        policy_alg: HashAlg::Sha256,
        current_clock: None,
        current_locality: 0,
        physical_presence_asserted: true,
        cp_hash: &[],
        name_hash: &name_hash,
        associated_is_nv_index: false,
        nv_written: None,
        requires_admin_or_dup: false,
        current_pcr_counter: 0,
        is_policy_secret_command: false,
    };
    assert!(check_policy_auth_session(&session, &matching).is_ok());

    let different_name_hash = crypto.hash(HashAlg::Sha256, b"different-name");
    let mismatched = PolicyCheckInputs { name_hash: &different_name_hash, ..matching };
    assert_eq!(
        check_policy_auth_session(&session, &mismatched).unwrap_err().code,
        ResponseCode::PolicyFail
    );
}

fn pw_session_area(auth_value: &[u8]) -> Vec<u8> {
    let mut area = Vec::new();
    area.extend_from_slice(&(Handle::Password as u32).to_be_bytes());
    area.extend_from_slice(&0u16.to_be_bytes()); // empty caller nonce
    area.push(SessionAttributes::ContinueSession.bits());
    area.extend_from_slice(&(auth_value.len() as u16).to_be_bytes());
    area.extend_from_slice(auth_value);
    area
}

fn single_user_handle(handle: u32, name: &[u8], auth_value: &[u8]) -> HandleAuthContext {
    HandleAuthContext {
        handle,
        name: name.to_vec(),
        role: AuthRole::User,
        auth_value: auth_value.to_vec(),
        auth_policy: Vec::new(),
        policy_alg: None,
        auth_value_available: true,
        auth_policy_available: false,
        da_exempt: false,
        is_platform: false,
        is_lockout: false,
        requires_policy_session: false,
    }
}

/// ParseSessions → BuildResponseSessions, driven end to end over a
/// wire-format PW session area the way a command dispatcher would hand the
/// orchestrator its session bytes: the PW auth value matches the handle's,
/// and the response session area reports `continueSession` forced on with
/// no HMAC.
#[test]
fn pw_session_round_trips_through_parse_and_build_response() {
    let crypto = SimCrypto;
    let mut rng = SimRng::default();
    let mut sessions = SessionStore::with_capacity(3);
    let mut da = DaManager::new(5, 1000, 1000);

    let handle = single_user_handle(0x8000_0001, b"object-name", b"secret");
    let session_area = pw_session_area(b"secret");
    let mut command_parameters = Vec::new();

    let input = ParseSessionsInput {
        command_code: 0x15B,
        sessions_allowed: true,
        decrypt_admissible: false,
        encrypt_admissible: false,
        pp_required: false,
        handles: std::slice::from_ref(&handle),
        session_area: &session_area,
        command_parameters: &mut command_parameters,
        decrypt_size: 0,
        physical_presence_asserted: false,
        current_locality: 0,
        current_clock: None,
        nv_available: true,
        orderly: true,
        command_audit_digest_is_empty: true,
        is_command_audit_digest_get: false,
        command_is_audited: false,
        audit_hash_alg: HashAlg::Sha256,
        current_exclusive_audit_session: None,
        current_pcr_counter: 0,
        is_policy_secret_command: false,
    };
    let ctx = parse_sessions(input, &mut sessions, &mut da, &crypto).expect("matching PW auth value authorizes");
    assert_eq!(ctx.sessions.len(), 1);
    assert_eq!(ctx.sessions[0].associated_handle, Some(handle.handle));
    assert!(ctx.sessions[0].include_auth);

    let mut response_parameters = Vec::new();
    let mut command_audit_digest = Vec::new();
    let auth_values = BTreeMap::new();
    let build_input = BuildResponseSessionsInput {
        command_code: 0x15B,
        tag_carries_sessions: true,
        response_parameters: &mut response_parameters,
        auth_values: &auth_values,
        sessions_allowed: true,
        command_is_audited: false,
        audit_hash_alg: HashAlg::Sha256,
        command_audit_digest: &mut command_audit_digest,
        current_exclusive_audit_session: None,
        current_clock: 0,
    };
    let output = build_response_sessions(&ctx, &mut sessions, &crypto, &mut rng, build_input);
    assert_eq!(output.per_session.len(), 1);
    let response_auth = &output.per_session[0];
    assert_eq!(response_auth.session_handle, Handle::Password as u32);
    assert!(response_auth.hmac.is_empty());
    assert!(response_auth.attributes.contains(SessionAttributes::ContinueSession));
    assert_eq!(output.command_audit_outcome, CommandAuditOutcome::NotAudited);
}

/// ParseSessions rejects a PW session whose value doesn't match the
/// handle's, charging dictionary-attack state the same way a mismatched
/// password always does.
#[test]
fn pw_session_with_wrong_auth_value_fails_and_charges_da() {
    let crypto = SimCrypto;
    let mut sessions = SessionStore::with_capacity(3);
    let mut da = DaManager::new(5, 1000, 1000);

    let handle = single_user_handle(0x8000_0001, b"object-name", b"secret");
    let session_area = pw_session_area(b"wrong");
    let mut command_parameters = Vec::new();

    let input = ParseSessionsInput {
        command_code: 0x15B,
        sessions_allowed: true,
        decrypt_admissible: false,
        encrypt_admissible: false,
        pp_required: false,
        handles: std::slice::from_ref(&handle),
        session_area: &session_area,
        command_parameters: &mut command_parameters,
        decrypt_size: 0,
        physical_presence_asserted: false,
        current_locality: 0,
        current_clock: None,
        nv_available: true,
        orderly: true,
        command_audit_digest_is_empty: true,
        is_command_audit_digest_get: false,
        command_is_audited: false,
        audit_hash_alg: HashAlg::Sha256,
        current_exclusive_audit_session: None,
        current_pcr_counter: 0,
        is_policy_secret_command: false,
    };
    let err = parse_sessions(input, &mut sessions, &mut da, &crypto).unwrap_err();
    assert_eq!(err.code, ResponseCode::AuthFail);
    assert_eq!(da.failed_tries, 1);
}

/// CheckAuthNoSession: a command whose only handle requires `AUTH_NONE`
/// accepts an empty session area outright and still snapshots the
/// command-audit cpHash when the command is audited.
#[test]
fn no_session_path_accepts_auth_none_handle_and_snapshots_audit_cp_hash() {
    let crypto = SimCrypto;
    let handle = HandleAuthContext { role: AuthRole::None, ..single_user_handle(0x8000_0002, b"pcr-name", b"") };
    let command_parameters = b"parameters".to_vec();

    let input = NoSessionInput {
        handles: std::slice::from_ref(&handle),
        command_code: 0x17E,
        command_is_audited: true,
        command_audit_digest_is_empty: true,
        is_command_audit_digest_get: false,
        nv_available: true,
        audit_hash_alg: HashAlg::Sha256,
        command_parameters: &command_parameters,
    };
    let ctx = check_auth_no_session(&crypto, &input).expect("AUTH_NONE handle needs no session");
    assert!(ctx.sessions.is_empty());
    assert!(ctx.cp_hash_for_command_audit.is_some());
}

/// CheckAuthNoSession rejects a command whose handle needs authorization
/// when no session area was supplied at all.
#[test]
fn no_session_path_rejects_a_handle_that_requires_authorization() {
    let crypto = SimCrypto;
    let handle = single_user_handle(0x8000_0003, b"object-name", b"secret");
    let command_parameters = Vec::new();

    let input = NoSessionInput {
        handles: std::slice::from_ref(&handle),
        command_code: 0x15B,
        command_is_audited: false,
        command_audit_digest_is_empty: true,
        is_command_audit_digest_get: false,
        nv_available: true,
        audit_hash_alg: HashAlg::Sha256,
        command_parameters: &command_parameters,
    };
    assert_eq!(check_auth_no_session(&crypto, &input).unwrap_err().code, ResponseCode::AuthMissing);
}
