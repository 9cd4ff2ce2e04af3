//! Contract to the HID report builder.
//!
//! The dispatcher builds each cycle's report from scratch: presses
//! accumulate while events are processed, the report is flushed once at
//! the end of the cycle, then emptied. A key that stays down therefore
//! stays in the report because its held event re-presses it every cycle,
//! not because anything remembers it. Plugins that need an intermediate
//! report on the wire (to pin down ordering across a report boundary)
//! flush explicitly mid-cycle.

use arrayvec::ArrayVec;

use crate::log::warn;
use crate::{Keyboard, Mods};

/// Maximum distinct key codes carried in one report.
pub const REPORT_KEYS: usize = 24;

/// Where resolved key state ends up. The real implementation encodes USB
/// HID reports; tests substitute a recorder.
pub trait Reporter {
    fn press(&mut self, key: Keyboard, mods: Mods);
    fn release(&mut self, key: Keyboard, mods: Mods);
    /// Empty the in-progress report.
    fn release_all(&mut self);
    /// Hand the in-progress report to the host.
    fn flush(&mut self);
}

/// The in-progress report: an ordered set of key codes plus a modifier
/// byte. Order of insertion is preserved, which keeps host-visible
/// ordering observable in tests.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct KeyReport {
    keys: ArrayVec<Keyboard, REPORT_KEYS>,
    mods: Mods,
}

impl Default for KeyReport {
    fn default() -> Self {
        KeyReport::new()
    }
}

impl KeyReport {
    pub fn new() -> Self {
        KeyReport {
            keys: ArrayVec::new(),
            mods: Mods::empty(),
        }
    }

    pub fn press(&mut self, key: Keyboard, mods: Mods) {
        self.mods |= mods;
        if !self.keys.contains(&key) && self.keys.try_push(key).is_err() {
            // Report is full; the key is simply not reported this cycle.
            warn!("key report overflow");
        }
    }

    pub fn release(&mut self, key: Keyboard, mods: Mods) {
        self.keys.retain(|k| *k != key);
        self.mods &= !mods;
    }

    pub fn clear(&mut self) {
        self.keys.clear();
        self.mods = Mods::empty();
    }

    pub fn keys(&self) -> &[Keyboard] {
        &self.keys
    }

    pub fn mods(&self) -> Mods {
        self.mods
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty() && self.mods.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn press_is_idempotent_and_ordered() {
        let mut report = KeyReport::new();
        report.press(Keyboard::A, Mods::empty());
        report.press(Keyboard::B, Mods::SHIFT);
        report.press(Keyboard::A, Mods::empty());
        assert_eq!(report.keys(), &[Keyboard::A, Keyboard::B]);
        assert_eq!(report.mods(), Mods::SHIFT);
    }

    #[test]
    fn release_removes_key_and_mods() {
        let mut report = KeyReport::new();
        report.press(Keyboard::B, Mods::SHIFT);
        report.release(Keyboard::B, Mods::SHIFT);
        assert!(report.is_empty());
    }
}
