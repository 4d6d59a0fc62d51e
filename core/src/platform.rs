//! Platform signal interface: physical presence, power, locality, clock.
//!
//! Grounded on `original_source/PPPlat.c` and `PowerPlat.c`. Those files model
//! a single-process simulator with a bag of module-wide mutable flags that the
//! platform driver flips and the TPM core reads; [`PlatformState`] is that bag,
//! and [`Platform`] is the trait the pipeline actually programs against so a
//! real platform binding can replace the simulator without touching the core.

/// Abstract source of physical-presence, power, locality and clock signals.
pub trait Platform {
    /// `_plat__PhysicalPresenceAsserted`.
    fn physical_presence_asserted(&self) -> bool;
    /// `_plat__LocalityGet`.
    fn locality(&self) -> u8;
    /// `_plat__ClockRead` in ticks since the last reset; monotonic within a
    /// power cycle.
    fn clock(&self) -> u64;
    /// Whether a cancel has been signaled since the last check. The pipeline
    /// itself never polls this mid-operation (§5); only the dispatcher does.
    fn is_canceled(&self) -> bool;
}

/// In-process simulation of the platform signal interface.
///
/// Mirrors the static flags in `PowerPlat.c`/`PPPlat.c` (`s_physicalPresence`,
/// `s_locality`, `s_isCanceled`, `s_powerLost`) as struct fields reset on the
/// matching signal method instead of file-scope statics.
#[derive(Debug, Clone)]
pub struct PlatformState {
    physical_presence: bool,
    locality: u8,
    clock: u64,
    is_canceled: bool,
    power_lost: bool,
}

impl Default for PlatformState {
    fn default() -> Self {
        PlatformState {
            physical_presence: false,
            locality: 0,
            clock: 0,
            is_canceled: false,
            power_lost: true,
        }
    }
}

impl PlatformState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// `_plat__Signal_PhysicalPresenceOn`.
    pub fn signal_physical_presence_on(&mut self) {
        self.physical_presence = true;
    }

    /// `_plat__Signal_PhysicalPresenceOff`.
    pub fn signal_physical_presence_off(&mut self) {
        self.physical_presence = false;
    }

    /// `_plat__Signal_PowerOn`: resets the clock, locality and cancel flag,
    /// and raises `powerLost`.
    pub fn signal_power_on(&mut self) {
        self.clock = 0;
        self.locality = 0;
        self.is_canceled = false;
        self.power_lost = true;
    }

    /// `_plat__Signal_Reset`: a reset without a power loss. Only the clock is
    /// touched.
    pub fn signal_reset(&mut self) {
        self.clock = 0;
    }

    /// `_plat__WasPowerLost`, with the original's `clear` parameter: reading
    /// with `clear = true` is what `_TPM_Init` uses to consume the flag.
    pub fn was_power_lost(&mut self, clear: bool) -> bool {
        let value = self.power_lost;
        if clear {
            self.power_lost = false;
        }
        value
    }

    pub fn set_locality(&mut self, locality: u8) {
        self.locality = locality;
    }

    pub fn advance_clock(&mut self, ticks: u64) {
        self.clock = self.clock.saturating_add(ticks);
    }

    pub fn signal_cancel(&mut self) {
        self.is_canceled = true;
    }

    pub fn clear_cancel(&mut self) {
        self.is_canceled = false;
    }
}

impl Platform for PlatformState {
    fn physical_presence_asserted(&self) -> bool {
        self.physical_presence
    }

    fn locality(&self) -> u8 {
        self.locality
    }

    fn clock(&self) -> u64 {
        self.clock
    }

    fn is_canceled(&self) -> bool {
        self.is_canceled
    }
}

/// Checks whether `session_locality` (the one-octet canonical form recorded
/// by a policy session) is compatible with the platform's current locality.
///
/// Localities 0-4 are a bitmask (bit `n` permits locality `n`); localities
/// 32-255 require exact equality, matching `CheckPolicyAuthSession`'s
/// locality check.
#[must_use]
pub fn locality_compatible(session_locality: u8, current: u8) -> bool {
    if session_locality == 0 {
        // No locality constraint was recorded.
        return true;
    }
    if current < 5 {
        session_locality & (1 << current) != 0 && session_locality <= 31
    } else if current > 31 {
        session_locality == current
    } else {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn power_on_raises_power_lost_and_resets_signals() {
        let mut platform = PlatformState::new();
        platform.signal_cancel();
        platform.set_locality(3);
        platform.advance_clock(100);
        platform.signal_power_on();
        assert_eq!(platform.locality(), 0);
        assert_eq!(platform.clock(), 0);
        assert!(!platform.is_canceled());
        assert!(platform.was_power_lost(false));
    }

    #[test]
    fn was_power_lost_clears_only_when_asked() {
        let mut platform = PlatformState::new();
        assert!(platform.was_power_lost(false));
        assert!(platform.was_power_lost(true));
        assert!(!platform.was_power_lost(false));
    }

    #[test]
    fn locality_bitmask_for_low_localities() {
        assert!(locality_compatible(0b0000_0001, 0));
        assert!(!locality_compatible(0b0000_0001, 1));
        assert!(locality_compatible(0, 4));
    }

    #[test]
    fn locality_exact_match_for_extended_localities() {
        assert!(locality_compatible(200, 200));
        assert!(!locality_compatible(200, 201));
        assert!(!locality_compatible(200, 2));
    }
}
