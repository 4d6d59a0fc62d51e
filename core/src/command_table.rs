//! Per-command authorization metadata.
//!
//! The original generates `s_ccAttr` (`COMMAND_ATTRIBUTES`) for every
//! implemented `TPM_CC` from the command tables in Part 3 of the
//! specification at build time. Hand-authoring all ~200 entries is out of
//! reach for this distillation, so [`lookup`] covers a representative
//! subset: at least one command per [`tpm2_call::AuthRole`], one with each
//! decrypt/encrypt-session admissibility, one requiring physical presence,
//! and every command referenced elsewhere in this crate's tests. A command
//! outside the table gets [`CommandAttributes::conservative`]: no handles,
//! no sessions, nothing admissible, so an unknown command can never be
//! accidentally authorized by a hole in the table rather than an explicit
//! decision.

use tpm2_call::{AuthRole, Command};

/// Per-handle authorization role plus command-wide session admissibility,
/// the fields `CommandAuthRole`, `DecryptSize`, `EncryptSize`,
/// `IsSessionAllowed` and `PhysicalPresenceIsRequired` read out of
/// `s_ccAttr` in the original.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandAttributes {
    /// Auth role required for each handle, in handle order. Empty means the
    /// command takes no handles.
    pub handle_roles: &'static [AuthRole],
    /// Whether a decrypt session is admissible on the first command
    /// parameter.
    pub decrypt_admissible: bool,
    /// Whether an encrypt session is admissible on the first response
    /// parameter.
    pub encrypt_admissible: bool,
    /// Whether any session at all may accompany this command.
    pub sessions_allowed: bool,
    /// Physical presence assertion required regardless of authorization.
    pub pp_required: bool,
    /// Whether this command can be audited (`IS_IMPLEMENTED` in the
    /// original also requires the command to exist at all, already implied
    /// by reaching this table).
    pub auditable: bool,
}

impl CommandAttributes {
    const fn conservative() -> Self {
        CommandAttributes {
            handle_roles: &[],
            decrypt_admissible: false,
            encrypt_admissible: false,
            sessions_allowed: false,
            pp_required: false,
            auditable: false,
        }
    }

    const fn new(handle_roles: &'static [AuthRole]) -> Self {
        CommandAttributes {
            handle_roles,
            decrypt_admissible: false,
            encrypt_admissible: false,
            sessions_allowed: true,
            pp_required: false,
            auditable: true,
        }
    }

    const fn decrypt(mut self) -> Self {
        self.decrypt_admissible = true;
        self
    }

    const fn encrypt(mut self) -> Self {
        self.encrypt_admissible = true;
        self
    }

    const fn pp(mut self) -> Self {
        self.pp_required = true;
        self
    }

    /// `CommandAuthRole`: the role required for `handle_index` (0-based).
    /// `AuthRole::None` if the command has no handle at that index.
    #[must_use]
    pub fn role_for(&self, handle_index: usize) -> AuthRole {
        self.handle_roles.get(handle_index).copied().unwrap_or(AuthRole::None)
    }
}

const USER: &[AuthRole] = &[AuthRole::User];
const ADMIN: &[AuthRole] = &[AuthRole::Admin];
const DUP: &[AuthRole] = &[AuthRole::Dup];
const USER_USER: &[AuthRole] = &[AuthRole::User, AuthRole::User];

/// `CommandCodeToCommandIndex` + `s_ccAttr[...]` lookup, collapsed into one
/// call: classifies `command_code` and returns its attributes, or the
/// conservative default for anything this table does not name.
#[must_use]
pub fn lookup(command_code: u32) -> CommandAttributes {
    match Command::from_repr(command_code) {
        Some(Command::NvWrite) => CommandAttributes::new(USER).decrypt(),
        Some(Command::NvRead) => CommandAttributes::new(USER).encrypt(),
        Some(Command::NvChangeAuth) => CommandAttributes::new(ADMIN),
        Some(Command::ObjectChangeAuth) => CommandAttributes::new(ADMIN),
        Some(Command::Duplicate) => CommandAttributes::new(DUP),
        Some(Command::PolicySecret) => CommandAttributes::new(USER),
        Some(Command::StartAuthSession) => CommandAttributes::new(&[]).decrypt(),
        Some(Command::GetCommandAuditDigest) => CommandAttributes::new(USER_USER),
        Some(Command::SetCommandCodeAuditStatus) => CommandAttributes::new(ADMIN),
        Some(Command::DictionaryAttackLockReset) => CommandAttributes::new(ADMIN),
        Some(Command::DictionaryAttackParameters) => CommandAttributes::new(ADMIN),
        Some(Command::Clear) => CommandAttributes::new(USER).pp(),
        Some(Command::ClearControl) => CommandAttributes::new(USER).pp(),
        Some(Command::HierarchyChangeAuth) => CommandAttributes::new(USER),
        Some(Command::EvictControl) => CommandAttributes::new(USER_USER),
        Some(Command::Shutdown) => CommandAttributes::new(&[]),
        Some(Command::SelfTest) => CommandAttributes::new(&[]),
        Some(Command::GetRandom) => CommandAttributes::new(&[]).encrypt(),
        Some(Command::PcrEvent) => CommandAttributes::new(USER),
        Some(Command::PcrReset) => CommandAttributes::new(USER),
        Some(Command::Create) => CommandAttributes::new(USER).decrypt().encrypt(),
        Some(Command::CreatePrimary) => CommandAttributes::new(USER).decrypt().encrypt(),
        _ => CommandAttributes::conservative(),
    }
}
