//! GPIO-driven hardware reset: toggling specific board pins to force a
//! radio co-processor into the bootloader, for adapters that have no
//! software reset path.
//!
//! Userspace GPIO access itself (`libgpiod`, sysfs, whatever the host
//! exposes) is outside this crate; [`GpioDriver`] is the seam a caller
//! implements against their platform.

use std::time::Duration;

use bitflags::bitflags;

use crate::error::Result;

bitflags! {
    /// Which of a board's named reset/boot pins should be driven high
    /// for a given [`ResetTarget`] profile.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Pins: u8 {
        const RESET = 0b0001;
        const BOOT  = 0b0010;
        const HOST  = 0b0100;
    }
}

/// A named GPIO reset wiring, as used by a handful of common RCP
/// adapter boards. Sonoff adapters have no dedicated reset line and
/// are reset via [`crate::serial::Transport::sonoff_reset_sequence`]
/// instead, so they have no entry here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetTarget {
    Yellow,
    IHost,
    Slzb07,
}

/// The pins to assert, and for how long, to drive `target` into its
/// bootloader.
#[derive(Debug, Clone, Copy)]
pub struct GpioPattern {
    pub assert: Pins,
    pub toggle_delay: Duration,
}

const TOGGLE_DELAY: Duration = Duration::from_millis(100);

/// Returns the GPIO pattern for a named reset target.
#[must_use]
pub fn pattern_for(target: ResetTarget) -> GpioPattern {
    let assert = match target {
        ResetTarget::Yellow => Pins::RESET | Pins::BOOT,
        ResetTarget::IHost => Pins::RESET | Pins::BOOT | Pins::HOST,
        ResetTarget::Slzb07 => Pins::RESET | Pins::BOOT,
    };

    GpioPattern {
        assert,
        toggle_delay: TOGGLE_DELAY,
    }
}

/// A platform's GPIO line control, implemented by the caller. Two
/// incompatible `libgpiod` binding generations exist upstream (pre-1.5
/// per-line requests vs. the batched `request_lines` API in 2.x); this
/// trait is the stable seam that hides either one from the flasher.
pub trait GpioDriver {
    fn drive_high(&mut self, pins: Pins) -> Result<()>;
    fn drive_low(&mut self, pins: Pins) -> Result<()>;
}

/// Drives `pattern` against `driver`: asserts its pins, waits
/// `toggle_delay`, then releases them.
pub async fn drive_pattern(driver: &mut impl GpioDriver, pattern: GpioPattern) -> Result<()> {
    driver.drive_high(pattern.assert)?;
    tokio::time::sleep(pattern.toggle_delay).await;
    driver.drive_low(pattern.assert)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RecordingDriver {
        events: Vec<(bool, Pins)>,
    }

    impl GpioDriver for RecordingDriver {
        fn drive_high(&mut self, pins: Pins) -> Result<()> {
            self.events.push((true, pins));
            Ok(())
        }

        fn drive_low(&mut self, pins: Pins) -> Result<()> {
            self.events.push((false, pins));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_drive_pattern_asserts_then_releases() {
        let mut driver = RecordingDriver { events: Vec::new() };
        let pattern = pattern_for(ResetTarget::Yellow);

        drive_pattern(&mut driver, pattern).await.unwrap();

        assert_eq!(
            driver.events,
            vec![
                (true, Pins::RESET | Pins::BOOT),
                (false, Pins::RESET | Pins::BOOT),
            ]
        );
    }

    #[test]
    fn test_ihost_drives_all_three_pins() {
        let pattern = pattern_for(ResetTarget::IHost);
        assert_eq!(pattern.assert, Pins::RESET | Pins::BOOT | Pins::HOST);
    }
}
