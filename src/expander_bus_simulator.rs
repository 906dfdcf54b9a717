//! # Expander Bus Simulator - Testing and Development Mock
//!
//! An in-memory stand-in for the five-expander I/O bank so the hub core runs
//! on a host without hardware. The shared [`SimFixture`] holds the pin matrix;
//! tests and simulations poke switches and observe LEDs through channel-level
//! helpers that use the same pin table as the firmware.
//!
//! The bus write counter makes LED idempotence observable: every pin write
//! that reaches the "hardware" increments it.

use core::cell::RefCell;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;

use crate::io_map::{pin_assignment, ExpanderBus as ExpanderBusTrait};
use crate::{CHANNEL_COUNT, EXPANDER_COUNT};

struct SimPins {
    outputs: [[bool; 16]; EXPANDER_COUNT],
    inputs: [[bool; 16]; EXPANDER_COUNT],
    writes: u32,
}

/// Shared simulated I/O bank.
///
/// One static (or leaked) instance backs each simulated hub; the test harness
/// keeps a reference to drive switches while the hub owns a [`FixtureBus`]
/// handle over the same state.
pub struct SimFixture {
    pins: Mutex<CriticalSectionRawMutex, RefCell<SimPins>>,
}

impl SimFixture {
    pub const fn new() -> Self {
        SimFixture {
            pins: Mutex::new(RefCell::new(SimPins {
                outputs: [[false; 16]; EXPANDER_COUNT],
                // Pull-ups hold every input line high until pressed.
                inputs: [[true; 16]; EXPANDER_COUNT],
                writes: 0,
            })),
        }
    }

    /// Presses a channel switch (pulls its input line low).
    pub fn press(&self, ch: usize) {
        self.set_switch_level(ch, false);
    }

    /// Releases a channel switch.
    pub fn release(&self, ch: usize) {
        self.set_switch_level(ch, true);
    }

    fn set_switch_level(&self, ch: usize, high: bool) {
        debug_assert!(ch < CHANNEL_COUNT);
        let p = pin_assignment(ch);
        self.pins.lock(|pins| {
            pins.borrow_mut().inputs[p.expander as usize][p.switch_pin as usize] = high;
        });
    }

    /// Current LED level of a channel.
    pub fn led(&self, ch: usize) -> bool {
        let p = pin_assignment(ch);
        self.pins
            .lock(|pins| pins.borrow().outputs[p.expander as usize][p.led_pin as usize])
    }

    /// Number of pin writes that reached the bank.
    pub fn write_count(&self) -> u32 {
        self.pins.lock(|pins| pins.borrow().writes)
    }
}

/// Bus handle handed to the hub; all state lives in the shared fixture.
pub struct FixtureBus {
    fixture: &'static SimFixture,
}

impl FixtureBus {
    pub fn new(fixture: &'static SimFixture) -> Self {
        FixtureBus { fixture }
    }
}

impl ExpanderBusTrait for FixtureBus {
    fn write_pin(&mut self, expander: u8, pin: u8, high: bool) {
        self.fixture.pins.lock(|pins| {
            let mut pins = pins.borrow_mut();
            pins.outputs[expander as usize][pin as usize] = high;
            pins.writes += 1;
        });
    }

    fn read_pin(&mut self, expander: u8, pin: u8) -> bool {
        self.fixture
            .pins
            .lock(|pins| pins.borrow().inputs[expander as usize][pin as usize])
    }

    fn configure_led(&mut self, expander: u8, pin: u8) {
        self.fixture.pins.lock(|pins| {
            pins.borrow_mut().outputs[expander as usize][pin as usize] = false;
        });
    }

    fn configure_switch(&mut self, expander: u8, pin: u8) {
        self.fixture.pins.lock(|pins| {
            pins.borrow_mut().inputs[expander as usize][pin as usize] = true;
        });
    }
}
