use std::collections::VecDeque;

use crate::membus::{Address, DeviceKind, MappedDevice};

/// A small FIFO of pressed scancodes. The host pushes codes in with
/// [`Keyboard::push_scancode`]; reading offset 0 drains the oldest
/// pending code (0 if empty). No real hardware polling — out of scope.
#[derive(Default)]
pub struct Keyboard {
    pending: VecDeque<u8>,
}

impl Keyboard {
    pub fn new() -> Self {
        Keyboard::default()
    }

    pub fn push_scancode(&mut self, code: u8) {
        self.pending.push_back(code);
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl MappedDevice for Keyboard {
    fn read_byte(&mut self, offset: Address) -> u8 {
        if offset == 0 {
            self.pending.pop_front().unwrap_or(0)
        } else {
            0
        }
    }

    fn write_byte(&mut self, _offset: Address, _value: u8) {}

    fn hard_reset(&mut self) {
        self.pending.clear();
    }

    fn label(&self) -> &str {
        "keyboard"
    }

    fn kind(&self) -> DeviceKind {
        DeviceKind::Keyboard
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drains_in_fifo_order() {
        let mut kb = Keyboard::new();
        kb.push_scancode(0x1E);
        kb.push_scancode(0x30);
        assert_eq!(kb.read_byte(0), 0x1E);
        assert_eq!(kb.read_byte(0), 0x30);
        assert_eq!(kb.read_byte(0), 0);
    }

    #[test]
    fn offsets_other_than_zero_read_zero() {
        let mut kb = Keyboard::new();
        kb.push_scancode(0x42);
        assert_eq!(kb.read_byte(1), 0);
    }

    #[test]
    fn hard_reset_clears_pending_queue() {
        let mut kb = Keyboard::new();
        kb.push_scancode(0x10);
        kb.hard_reset();
        assert!(kb.is_empty());
    }
}
