use crate::membus::{Address, DeviceKind, MappedDevice};

/// A read-only enumeration of every device mapped on the bus at the time
/// this device was built (spec §6, "Computer info device"). Layout: three
/// consecutive words per entry — `kind`, `address_start`, `range` — for
/// every device known when the machine was assembled, in registration
/// order. Total byte range is `3 * 4 * entries.len()`.
///
/// `ComputerInfo` itself is typically the *last* device registered, so its
/// own entry is deliberately not included in the snapshot passed to
/// [`ComputerInfo::new`] — the builder owns that decision.
pub struct ComputerInfo {
    words: Vec<u32>,
}

impl ComputerInfo {
    pub fn new(entries: &[(DeviceKind, Address, Address)]) -> Self {
        let mut words = Vec::with_capacity(entries.len() * 3);
        for &(kind, start, range) in entries {
            words.push(kind as u32);
            words.push(start);
            words.push(range);
        }
        ComputerInfo { words }
    }

    pub fn byte_len(&self) -> usize {
        self.words.len() * 4
    }

    fn word(&self, index: u32) -> u32 {
        self.words.get(index as usize).copied().unwrap_or(0)
    }
}

impl MappedDevice for ComputerInfo {
    fn read_byte(&mut self, offset: Address) -> u8 {
        let word_index = offset / 4;
        let byte_index = offset % 4;
        ((self.word(word_index) >> (byte_index * 8)) & 0xFF) as u8
    }

    fn write_byte(&mut self, _offset: Address, _value: u8) {}

    fn label(&self) -> &str {
        "computer-info"
    }

    fn kind(&self) -> DeviceKind {
        DeviceKind::ComputerInfo
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enumerates_devices_as_kind_start_range_triples() {
        let mut info = ComputerInfo::new(&[
            (DeviceKind::Ram, 0x0000, 0x1000),
            (DeviceKind::Rom, 0x1000, 0x2000),
        ]);
        assert_eq!(info.read_byte(0), DeviceKind::Ram as u8);
        assert_eq!(info.read_byte(4), 0x00);
        assert_eq!(info.read_byte(8), 0x00);
        assert_eq!(info.read_byte(8 + 1), 0x10);

        assert_eq!(info.read_byte(12), DeviceKind::Rom as u8);
        assert_eq!(info.read_byte(16), 0x00);
        assert_eq!(info.read_byte(16 + 1), 0x10);
    }

    #[test]
    fn byte_len_is_three_words_per_entry() {
        let info = ComputerInfo::new(&[(DeviceKind::Ram, 0, 0x10), (DeviceKind::Rom, 0x10, 0x10)]);
        assert_eq!(info.byte_len(), 3 * 4 * 2);
    }

    #[test]
    fn writes_are_discarded() {
        let mut info = ComputerInfo::new(&[(DeviceKind::Ram, 0, 1)]);
        info.write_byte(0, 0xFF);
        assert_eq!(info.read_byte(0), DeviceKind::Ram as u8);
    }
}
