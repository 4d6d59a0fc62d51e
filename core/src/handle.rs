//! Typed dispatch over the raw 32-bit handles the wire format carries.
//!
//! The original core switches on the top byte of a handle (`HandleGetType`)
//! throughout `Entity.c` and `SessionProcess.c` to decide whether a handle
//! names a PCR, an NV index, a session, or an object. [`HandleKind`] makes
//! that switch total and exhaustive instead of falling through a `default`
//! case silently.

use tpm2_call::{handle_class, Class, Handle};

/// The handle-type partition of a raw 32-bit handle value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleKind {
    Pcr(u32),
    NvIndex(u32),
    HmacSession(u32),
    PolicySession(u32),
    Permanent(u32),
    Transient(u32),
    Persistent(u32),
}

impl HandleKind {
    /// Classifies a raw handle. Returns `None` for a top byte the protocol
    /// never assigns (`HandleGetType` returning an unrecognized
    /// `TPM_HT` is an internal-consistency failure in the original; here it
    /// surfaces as a classification failure the caller must reject).
    #[must_use]
    pub fn classify(raw: u32) -> Option<HandleKind> {
        let class = handle_class(raw)?;
        Some(match class {
            Class::Pcr => HandleKind::Pcr(raw),
            Class::NvIndex => HandleKind::NvIndex(raw),
            Class::HmacSession => HandleKind::HmacSession(raw),
            Class::PolicySession => HandleKind::PolicySession(raw),
            Class::Permanent => HandleKind::Permanent(raw),
            Class::Transient => HandleKind::Transient(raw),
            Class::Persistent => HandleKind::Persistent(raw),
        })
    }

    #[must_use]
    pub fn raw(self) -> u32 {
        match self {
            HandleKind::Pcr(h)
            | HandleKind::NvIndex(h)
            | HandleKind::HmacSession(h)
            | HandleKind::PolicySession(h)
            | HandleKind::Permanent(h)
            | HandleKind::Transient(h)
            | HandleKind::Persistent(h) => h,
        }
    }

    /// True for the two session handle types (`CheckSessionHMAC`'s
    /// `IS_SESSION_HANDLE` test).
    #[must_use]
    pub fn is_session(self) -> bool {
        matches!(self, HandleKind::HmacSession(_) | HandleKind::PolicySession(_))
    }

    /// True for handle types that name a loaded or persistent object rather
    /// than a session, PCR, or NV index.
    #[must_use]
    pub fn is_object(self) -> bool {
        matches!(self, HandleKind::Transient(_) | HandleKind::Persistent(_))
    }
}

/// `TPM_RS_PW`: the reserved handle meaning "plaintext password
/// authorization", as opposed to a real session slot.
#[must_use]
pub fn is_password_session(raw: u32) -> bool {
    raw == Handle::Password as u32
}

/// Whether `raw` is one of the permanent hierarchy handles that can appear as
/// the `authHandle`/`objectHandle` of a policy or storage command (owner,
/// endorsement, platform, platform NV, lockout, null).
#[must_use]
pub fn is_hierarchy_handle(raw: u32) -> bool {
    raw == Handle::Owner as u32
        || raw == Handle::Endorsement as u32
        || raw == Handle::Platform as u32
        || raw == Handle::PlatformNv as u32
        || raw == Handle::Lockout as u32
        || raw == Handle::Null as u32
}
