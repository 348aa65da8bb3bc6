//! The single valve relay. The `gpio` feature gates the real rppal driver;
//! without it, a mock relay only logs state changes.

use anyhow::Result;
use tracing::info;

#[cfg(feature = "gpio")]
use rppal::gpio::{Gpio, OutputPin};

// ---------------------------------------------------------------------------
// Real GPIO relay (requires rppal + Raspberry Pi hardware)
// ---------------------------------------------------------------------------
#[cfg(feature = "gpio")]
pub(crate) struct Relay {
    pin: OutputPin,
    active_low: bool, // many relay boards are active-low
    open: bool,
}

#[cfg(feature = "gpio")]
impl Relay {
    pub(crate) fn new(gpio_pin: u8, active_low: bool) -> Result<Self> {
        let pin = Gpio::new()?.get(gpio_pin)?.into_output();
        let mut relay = Self {
            pin,
            active_low,
            open: true,
        };
        // Fail-safe: closed at startup
        relay.set(false);
        Ok(relay)
    }

    pub(crate) fn set(&mut self, open: bool) {
        // active-low: LOW = energised
        if open != self.active_low {
            self.pin.set_high();
        } else {
            self.pin.set_low();
        }
        if self.open != open {
            info!(open, "valve relay switched");
        }
        self.open = open;
    }

    pub(crate) fn is_open(&self) -> bool {
        self.open
    }
}

// ---------------------------------------------------------------------------
// Mock relay (development, no hardware)
// ---------------------------------------------------------------------------
#[cfg(not(feature = "gpio"))]
pub(crate) struct Relay {
    open: bool,
    pub(super) switches: u32,
}

#[cfg(not(feature = "gpio"))]
impl Relay {
    pub(crate) fn new(gpio_pin: u8, _active_low: bool) -> Result<Self> {
        info!("[mock-gpio] valve relay on gpio {gpio_pin} (not wired)");
        Ok(Self {
            open: false,
            switches: 0,
        })
    }

    pub(crate) fn set(&mut self, open: bool) {
        if self.open != open {
            self.switches += 1;
            info!(open, "[mock-gpio] valve relay switched");
        }
        self.open = open;
    }

    pub(crate) fn is_open(&self) -> bool {
        self.open
    }
}

// ===========================================================================
// Tests
// ===========================================================================
