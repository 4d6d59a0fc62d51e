//! Result type and session/handle tagging for command processing.
//!
//! The original C core returns a bare `TPM_RC` and separately tracks which
//! handle or session slot a format-1 error applies to through an out-of-band
//! `parmNum`/`sessionNum`/`handleNum`. [`TpmError`] folds both into one value
//! so the pipeline can propagate it with `?` the way the rest of this crate
//! does, and [`TpmError::encode`] reassembles the tagged wire code on the way
//! out.

use std::fmt;

use tpm2_call::ResponseCode;

/// Which argument slot a format-1 response code is attributed to.
///
/// Mirrors the three associativity groups the original adds to `TPM_RC_FMT1`
/// codes: `TPM_RC_P + N`, `TPM_RC_S + N`, `TPM_RC_H + N` (`RcIndex` in the
/// source).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RcSubject {
    /// Unassociated with a particular argument (format-0 codes, or a format-1
    /// code with no handle/session/parameter context).
    None,
    /// 1-based parameter index.
    Parameter(u8),
    /// 1-based session index.
    Session(u8),
    /// 1-based handle index.
    Handle(u8),
}

const RC_FMT1: u32 = tpm2_call::RC_FMT1;
const RC_P: u32 = 0x040;
const RC_S: u32 = 0x800;
const RC_H: u32 = 0x000;
const RC_N_MASK: u32 = 0xF00;

/// A `TPM_RC` together with the argument it is attributed to, as produced by
/// every fallible step in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TpmError {
    pub code: ResponseCode,
    pub subject: RcSubject,
}

impl TpmError {
    #[must_use]
    pub fn new(code: ResponseCode) -> Self {
        TpmError { code, subject: RcSubject::None }
    }

    #[must_use]
    pub fn parameter(code: ResponseCode, index: u8) -> Self {
        TpmError { code, subject: RcSubject::Parameter(index) }
    }

    #[must_use]
    pub fn session(code: ResponseCode, index: u8) -> Self {
        TpmError { code, subject: RcSubject::Session(index) }
    }

    #[must_use]
    pub fn handle(code: ResponseCode, index: u8) -> Self {
        TpmError { code, subject: RcSubject::Handle(index) }
    }

    /// Reassembles the wire `TPM_RC` value, folding the subject back in for
    /// format-1 codes the way `TPM_RC_P`/`TPM_RC_S`/`TPM_RC_H` do on the wire.
    /// Format-0 and warning codes never carry a subject and are passed
    /// through unchanged.
    #[must_use]
    pub fn encode(&self) -> u32 {
        let base = self.code as u32;
        if base & RC_FMT1 == 0 {
            return base;
        }
        match self.subject {
            RcSubject::None => base,
            RcSubject::Parameter(n) => base | RC_P | index_bits(n),
            RcSubject::Session(n) => base | RC_S | index_bits(n),
            RcSubject::Handle(n) => base | RC_H | index_bits(n),
        }
    }
}

fn index_bits(n: u8) -> u32 {
    (u32::from(n) << 8) & RC_N_MASK
}

impl fmt::Display for TpmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.subject {
            RcSubject::None => write!(f, "{}", self.code),
            RcSubject::Parameter(n) => write!(f, "{} (parameter {n})", self.code),
            RcSubject::Session(n) => write!(f, "{} (session {n})", self.code),
            RcSubject::Handle(n) => write!(f, "{} (handle {n})", self.code),
        }
    }
}

impl std::error::Error for TpmError {}

pub type TpmResult<T> = Result<T, TpmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format1_session_error_encodes_the_session_bit_and_index() {
        let err = TpmError::session(ResponseCode::AuthFail, 2);
        let encoded = err.encode();
        assert_eq!(encoded & RC_S, RC_S);
        assert_eq!((encoded & RC_N_MASK) >> 8, 2);
    }

    #[test]
    fn format0_error_ignores_subject_on_encode() {
        let err = TpmError::handle(ResponseCode::Failure, 1);
        assert_eq!(err.encode(), ResponseCode::Failure as u32);
    }

    #[test]
    fn display_includes_the_subject_when_present() {
        let err = TpmError::parameter(ResponseCode::Value, 3);
        let rendered = format!("{err}");
        assert!(rendered.contains("parameter 3"));
    }
}
