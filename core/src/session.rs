//! Session state and the bounded slot table that holds it.
//!
//! Grounded on the `SESSION` structure implied throughout
//! `original_source/SessionProcess.c` (`session->attributes`,
//! `session->u1.cpHash`/`u1.boundEntity`, `session->u2.policyDigest`/
//! `u2.auditDigest`, `session->nonceTPM`, `session->startTime`,
//! `session->timeOut`). The C union fields become two small per-kind enums
//! here instead of raw bytes reinterpreted by session type.

use tpm2_call::{Algorithm, SessionAttributes};

use crate::crypto::HashAlg;

/// `session->u1`: a trial/policy session's committed cpHash or nameHash
/// (`TPM2_PolicyCpHash` vs. `TPM2_PolicyNameHash`, mutually exclusive), or an
/// HMAC session's bound-entity name. Never more than one at a time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCommitment {
    None,
    CpHash(Vec<u8>),
    NameHash(Vec<u8>),
    BoundEntity(Vec<u8>),
}

/// `session->u2`: a policy session's running policy digest, or an audit
/// session's running audit digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionDigest {
    None,
    Policy(Vec<u8>),
    Audit(Vec<u8>),
}

/// `TPM_SE`: whether a session is HMAC, policy, or a trial policy (a policy
/// session that never authorizes a command, only computes a digest).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    Hmac,
    Policy,
    Trial,
}

/// A single loaded authorization session.
#[derive(Debug, Clone)]
pub struct Session {
    pub kind: SessionKind,
    pub hash_alg: HashAlg,
    pub nonce_tpm: Vec<u8>,
    pub nonce_caller: Vec<u8>,
    pub session_key: Vec<u8>,
    pub attributes: SessionAttributes,
    pub is_bound: bool,
    pub is_da_bound: bool,
    pub is_lockout_bound: bool,
    pub is_password: bool,
    pub commitment: SessionCommitment,
    pub digest: SessionDigest,
    /// `policyCommandCode`: the command this policy session was made to
    /// authorize, if `TPM2_PolicyCommandCode` was executed.
    pub command_code: Option<u32>,
    /// `isPPRequired`, `isAuditSession`, `pcrCounter`, `timeOut` collapse to
    /// `start_time`/`timeout` checked against the platform clock.
    pub start_time: u64,
    pub timeout: Option<u64>,
    pub pp_required: bool,
    pub is_audit_session: bool,
    pub locality: u8,
    /// The symmetric algorithm negotiated at `TPM2_StartAuthSession` time,
    /// used to key [`crate::crypto::Crypto::encrypt`]/`decrypt` for this
    /// session's decrypt/encrypt parameter. `Algorithm::Null` for a session
    /// that never negotiated one.
    pub symmetric: Algorithm,
    /// `pcrCounter`: the PCR update counter snapshotted when a policy
    /// session last executed `TPM2_PolicyPCR`. `None` until that happens, or
    /// for non-policy sessions.
    pub pcr_counter: Option<u32>,
}

impl Session {
    /// `SessionIsLoaded`'s per-session-type checks are handled by
    /// [`crate::handle::HandleKind`]; this just builds a fresh session for a
    /// newly started `TPM2_StartAuthSession`.
    #[must_use]
    pub fn new(kind: SessionKind, hash_alg: HashAlg, nonce_tpm: Vec<u8>, nonce_caller: Vec<u8>) -> Self {
        Session {
            kind,
            hash_alg,
            nonce_tpm,
            nonce_caller,
            session_key: Vec::new(),
            attributes: SessionAttributes::ContinueSession,
            is_bound: false,
            is_da_bound: false,
            is_lockout_bound: false,
            is_password: false,
            commitment: SessionCommitment::None,
            digest: match kind {
                SessionKind::Hmac => SessionDigest::None,
                SessionKind::Policy | SessionKind::Trial => SessionDigest::Policy(vec![0; hash_alg.digest_size()]),
            },
            command_code: None,
            start_time: 0,
            timeout: None,
            pp_required: false,
            is_audit_session: false,
            locality: 0,
            symmetric: Algorithm::Null,
            pcr_counter: None,
        }
    }

    #[must_use]
    pub fn is_policy(&self) -> bool {
        matches!(self.kind, SessionKind::Policy | SessionKind::Trial)
    }

    /// `UpdateTPMNonce`: refresh `nonceTPM` to a freshly generated value, run
    /// on every response that carries this session.
    pub fn update_nonce(&mut self, fresh: Vec<u8>) {
        self.nonce_tpm = fresh;
    }
}

/// Bounded pool of loaded sessions, replacing the original's fixed
/// `MAX_LOADED_SESSIONS`-sized array indexed by session handle.
#[derive(Debug, Default)]
pub struct SessionStore {
    slots: Vec<Option<(u32, Session)>>,
}

impl SessionStore {
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        SessionStore { slots: (0..capacity).map(|_| None).collect() }
    }

    pub fn insert(&mut self, handle: u32, session: Session) -> Result<(), Session> {
        match self.slots.iter_mut().find(|slot| slot.is_none()) {
            Some(slot) => {
                *slot = Some((handle, session));
                Ok(())
            }
            None => Err(session),
        }
    }

    #[must_use]
    pub fn get(&self, handle: u32) -> Option<&Session> {
        self.slots.iter().flatten().find(|(h, _)| *h == handle).map(|(_, s)| s)
    }

    pub fn get_mut(&mut self, handle: u32) -> Option<&mut Session> {
        self.slots.iter_mut().flatten().find(|(h, _)| *h == handle).map(|(_, s)| s)
    }

    pub fn remove(&mut self, handle: u32) -> Option<Session> {
        for slot in &mut self.slots {
            if matches!(slot, Some((h, _)) if *h == handle) {
                return slot.take().map(|(_, s)| s);
            }
        }
        None
    }

    #[must_use]
    pub fn is_loaded(&self, handle: u32) -> bool {
        self.slots.iter().flatten().any(|(h, _)| *h == handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::new(SessionKind::Hmac, HashAlg::Sha256, vec![1; 32], vec![2; 32])
    }

    #[test]
    fn store_round_trips_a_session_through_a_handle() {
        let mut store = SessionStore::with_capacity(2);
        store.insert(0x0200_0000, session()).unwrap();
        assert!(store.is_loaded(0x0200_0000));
        assert!(store.get(0x0200_0000).is_some());
        let removed = store.remove(0x0200_0000).unwrap();
        assert_eq!(removed.hash_alg, HashAlg::Sha256);
        assert!(!store.is_loaded(0x0200_0000));
    }

    #[test]
    fn store_rejects_insert_once_full() {
        let mut store = SessionStore::with_capacity(1);
        store.insert(1, session()).unwrap();
        let overflow = store.insert(2, session());
        assert!(overflow.is_err());
    }

    #[test]
    fn fresh_policy_session_starts_with_a_zeroed_digest() {
        let policy = Session::new(SessionKind::Policy, HashAlg::Sha256, vec![], vec![]);
        match policy.digest {
            SessionDigest::Policy(d) => assert_eq!(d, vec![0u8; 32]),
            _ => panic!("expected a policy digest"),
        }
    }

    #[test]
    fn update_nonce_replaces_the_tpm_nonce() {
        let mut s = session();
        s.update_nonce(vec![9; 32]);
        assert_eq!(s.nonce_tpm, vec![9; 32]);
    }
}
