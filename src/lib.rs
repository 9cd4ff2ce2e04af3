//! Tap-dance keyboard engine
//!
//! Small keyboards assign several meanings to one physical key, selected
//! by tap count or by holding the key down. The firmware cannot know what
//! a press means at the moment it happens, so it has to sit on the
//! decision for a few scan cycles while the rest of the keyboard keeps
//! producing ordinary events that must not be delayed or reordered.
//!
//! This crate is the part of the firmware that makes that work:
//!
//! - [`dispatch`] runs the per-cycle hook pipeline that every key event
//!   flows through, and owns the work queue that lets plugins inject
//!   synthesized events back into the same pipeline without recursing.
//! - [`dance`] is the resolution engine itself: per-key tap counting, the
//!   timeout window, and the interrupt/timeout/release decisions.
//! - [`report`] is the narrow contract to the HID report builder.
//!
//! Matrix scanning, debounce, layer lookup and USB encoding live elsewhere
//! in the firmware; events arrive here already debounced and already mapped
//! to a [`Key`] identity.

#![cfg_attr(not(any(feature = "std", test)), no_std)]

use bitflags::bitflags;

pub use usbd_human_interface_device::page::Keyboard;

pub use dance::{Dance, DanceHandler, DanceKind, DanceManager, NoopDance, TableDance};
pub use dispatch::{Dispatcher, EventContext, EventResult, Plugin};
pub use report::{KeyReport, Reporter};

pub mod dance;
pub mod dispatch;
pub mod report;

cfg_if::cfg_if! {
    if #[cfg(feature = "defmt")] {
        pub(crate) mod log {
            pub use defmt::{info, warn};
        }
    } else if #[cfg(feature = "log")] {
        pub(crate) mod log {
            pub use log::{info, warn};
        }
    } else {
        pub(crate) mod log {
            macro_rules! info { ($($arg:tt)*) => {{}} }
            macro_rules! warn { ($($arg:tt)*) => {{}} }
            pub(crate) use info;
            pub(crate) use warn;
        }
    }
}

/// Upper bound on physical key positions. Addresses index a `u64` mask in
/// the dispatcher, so this cannot grow past 64 without widening that.
pub const NKEYS: usize = 64;

/// Stable identifier of a physical key position.
///
/// An address names a switch, not a meaning: the same address can produce
/// different [`Key`] identities as layers change, but it never refers to
/// two different physical keys.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct KeyAddr(u8);

#[cfg(feature = "defmt")]
impl defmt::Format for KeyAddr {
    fn format(&self, fmt: defmt::Formatter) {
        defmt::write!(fmt, "KeyAddr({})", self.0)
    }
}

impl KeyAddr {
    pub const fn new(index: u8) -> Self {
        KeyAddr(index % NKEYS as u8)
    }

    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

bitflags! {
    /// Modifiers to be held down together with a reported key.
    #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
    pub struct Mods: u8 {
        const SHIFT = 0b0000_0001;
        const CONTROL = 0b0000_0010;
        const ALT = 0b0000_0100;
        const GUI = 0b0000_1000;
    }
}

/// The meaning currently mapped to a key position.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Key {
    /// Transparent / unmapped; produces no output.
    None,
    /// An ordinary HID key, possibly with modifiers baked in.
    Kbd { code: Keyboard, mods: Mods },
    /// A tap-dance key, indexed into the engine's configuration table.
    Dance(u8),
}

impl Key {
    pub const fn kbd(code: Keyboard) -> Key {
        Key::Kbd {
            code,
            mods: Mods::empty(),
        }
    }

    pub const fn shifted(code: Keyboard) -> Key {
        Key::Kbd {
            code,
            mods: Mods::SHIFT,
        }
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for Key {
    fn format(&self, fmt: defmt::Formatter) {
        match self {
            Key::None => defmt::write!(fmt, "Key::None"),
            Key::Kbd { code, mods } => {
                defmt::write!(fmt, "Key::Kbd({}, {})", *code as u8, mods.bits())
            }
            Key::Dance(index) => defmt::write!(fmt, "Key::Dance({})", index),
        }
    }
}

/// Switch state carried by an event.
///
/// The scan layer reports every pressed key once per cycle, so a key that
/// stays down produces a stream of held events between its toggle-on and
/// toggle-off. The interesting predicates are derived, not stored.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct KeyState {
    pub is_pressed: bool,
    pub was_pressed: bool,
    /// Synthesized by a plugin rather than scanned from the matrix.
    pub injected: bool,
}

impl KeyState {
    pub const fn press() -> Self {
        KeyState {
            is_pressed: true,
            was_pressed: false,
            injected: false,
        }
    }

    pub const fn release() -> Self {
        KeyState {
            is_pressed: false,
            was_pressed: true,
            injected: false,
        }
    }

    pub const fn hold() -> Self {
        KeyState {
            is_pressed: true,
            was_pressed: true,
            injected: false,
        }
    }

    pub const fn toggled_on(&self) -> bool {
        self.is_pressed && !self.was_pressed
    }

    pub const fn toggled_off(&self) -> bool {
        !self.is_pressed && self.was_pressed
    }

    pub const fn held(&self) -> bool {
        self.is_pressed && self.was_pressed
    }
}

/// A single key event flowing through the dispatcher.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct KeyEvent {
    pub addr: KeyAddr,
    pub key: Key,
    pub state: KeyState,
}

#[cfg(feature = "defmt")]
impl defmt::Format for KeyEvent {
    fn format(&self, fmt: defmt::Formatter) {
        defmt::write!(fmt, "KeyEvent({}, {}, {})", self.addr, self.key, self.state)
    }
}

impl KeyEvent {
    pub const fn new(addr: KeyAddr, key: Key, state: KeyState) -> Self {
        KeyEvent { addr, key, state }
    }
}
