//! # I/O Map Module
//!
//! Maps the 40 logical channels onto five 16-bit port expanders and owns the
//! LED write cache. Every expander transaction runs under one exclusive lock,
//! and the lock is held across any read-modify-write against a single device.
//!
//! For channel `c` the pin pair starts at `base = 2*c`: expander `base/16`,
//! pins `base % 16` and `(base+1) % 16`. The low and high nibbles of each pin
//! index are then swapped (`p < 8 ? p+8 : p-8`) to keep each channel's LED and
//! switch grouped on the PCB. The first pin of the pair drives the LED
//! (output, initially low); the second reads the switch (pull-up input,
//! pressed reads electrically low).

use core::cell::RefCell;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;

use crate::{CHANNEL_COUNT, EXPANDER_COUNT};

/// Pin-level access to the expander bank.
///
/// The real I²C driver is an external collaborator; implementations here are
/// feature-selected concrete types (see `expander_bus_simulator`).
pub trait ExpanderBus {
    fn write_pin(&mut self, expander: u8, pin: u8, high: bool);
    fn read_pin(&mut self, expander: u8, pin: u8) -> bool;
    /// Configures a pin as a push-pull output driven low.
    fn configure_led(&mut self, expander: u8, pin: u8);
    /// Configures a pin as a pull-up input.
    fn configure_switch(&mut self, expander: u8, pin: u8);
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct PinAssignment {
    pub expander: u8,
    pub led_pin: u8,
    pub switch_pin: u8,
}

const fn remap(p: u8) -> u8 {
    if p < 8 {
        p + 8
    } else {
        p - 8
    }
}

/// Static pin table entry for one channel.
pub const fn pin_assignment(ch: usize) -> PinAssignment {
    let base = (ch * 2) as u16;
    PinAssignment {
        expander: (base / 16) as u8,
        led_pin: remap((base % 16) as u8),
        switch_pin: remap(((base + 1) % 16) as u8),
    }
}

const _: () = assert!(CHANNEL_COUNT * 2 <= EXPANDER_COUNT * 16);

struct IoInner<B> {
    bus: B,
    led_on: [bool; CHANNEL_COUNT],
}

/// Channel-level view of the expander bank.
pub struct IoMap<B> {
    inner: Mutex<CriticalSectionRawMutex, RefCell<IoInner<B>>>,
}

impl<B: ExpanderBus> IoMap<B> {
    /// Configures every channel's pin pair and starts with all LEDs off.
    pub fn new(mut bus: B) -> Self {
        for ch in 0..CHANNEL_COUNT {
            let p = pin_assignment(ch);
            bus.configure_led(p.expander, p.led_pin);
            bus.configure_switch(p.expander, p.switch_pin);
        }
        IoMap {
            inner: Mutex::new(RefCell::new(IoInner {
                bus,
                led_on: [false; CHANNEL_COUNT],
            })),
        }
    }

    /// Drives a channel LED. Idempotent: a write matching the cached level
    /// produces no bus transaction.
    pub fn set_led(&self, ch: usize, on: bool) {
        let p = pin_assignment(ch);
        self.inner.lock(|inner| {
            let mut inner = inner.borrow_mut();
            if inner.led_on[ch] == on {
                return;
            }
            inner.led_on[ch] = on;
            inner.bus.write_pin(p.expander, p.led_pin, on);
        });
    }

    pub fn all_leds(&self, on: bool) {
        for ch in 0..CHANNEL_COUNT {
            self.set_led(ch, on);
        }
    }

    /// Raw switch level: `true` while the pull-up holds the line released.
    pub fn read_switch_raw(&self, ch: usize) -> bool {
        let p = pin_assignment(ch);
        self.inner
            .lock(|inner| inner.borrow_mut().bus.read_pin(p.expander, p.switch_pin))
    }

    /// `true` while the switch is pressed (line pulled low).
    pub fn is_pressed_raw(&self, ch: usize) -> bool {
        !self.read_switch_raw(ch)
    }
}
