//! Power-on/init/startup gating.
//!
//! Grounded on `original_source/Power.c`'s `TPMInit`/`TPMRegisterStartup`/
//! `TPMIsStarted` (a single `s_initialized` boolean) plus the power-on
//! signal handling in `PowerPlat.c` already reflected by
//! [`crate::platform::PlatformState`].

use log::{debug, info};

use crate::platform::PlatformState;

/// `s_initialized`: whether `TPM2_Startup` has completed successfully since
/// the last `_TPM_Init`. Dispatching a command while this is `false` is the
/// caller's responsibility to refuse, not this type's.
#[derive(Debug, Default)]
pub struct TpmLifecycle {
    initialized: bool,
}

impl TpmLifecycle {
    #[must_use]
    pub fn new() -> Self {
        TpmLifecycle { initialized: false }
    }

    /// `_TPM_Init` / `TPMInit`: clears the startup-completed flag and
    /// applies the platform's power-on signal effects.
    pub fn power_on_reset(&mut self, platform: &mut PlatformState) {
        self.initialized = false;
        platform.signal_power_on();
        info!("TPM power-on reset");
    }

    /// `TPM2_Startup`'s completion, registering the fact via
    /// `TPMRegisterStartup`.
    pub fn register_startup(&mut self) {
        self.initialized = true;
        debug!("startup registered");
    }

    /// `TPMIsStarted`.
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.initialized
    }

    /// Power-off: NV is expected to have been flushed by the caller before
    /// this is called; recorded here only to force `Startup` again before
    /// the next command.
    pub fn power_off(&mut self) {
        self.initialized = false;
        info!("TPM power-off");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_lifecycle_is_not_started() {
        assert!(!TpmLifecycle::new().is_started());
    }

    #[test]
    fn startup_then_init_requires_startup_again() {
        let mut lifecycle = TpmLifecycle::new();
        lifecycle.register_startup();
        assert!(lifecycle.is_started());

        let mut platform = PlatformState::new();
        lifecycle.power_on_reset(&mut platform);
        assert!(!lifecycle.is_started());
    }

    #[test]
    fn power_on_reset_raises_power_lost_on_the_platform() {
        let mut lifecycle = TpmLifecycle::new();
        let mut platform = PlatformState::new();
        platform.was_power_lost(true);
        lifecycle.power_on_reset(&mut platform);
        assert!(platform.was_power_lost(true));
    }

    #[test]
    fn power_off_forces_startup_again() {
        let mut lifecycle = TpmLifecycle::new();
        lifecycle.register_startup();
        lifecycle.power_off();
        assert!(!lifecycle.is_started());
    }
}
