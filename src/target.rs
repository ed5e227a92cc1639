//! On-chip memory as seen by the bootloader.
//!
//! [`Target`] is the contract the state machine drives: self-programming of
//! flash pages (erase, fill the temporary page buffer word by word, write,
//! re-enable read-while-write) and byte-wide EEPROM access, plus the
//! capabilities reported in the HELLO reply. [`MemoryTarget`] is an in-memory
//! part used by the loopback transport and the tests.

use crate::constants::ERASED_BYTE;
use crate::device::Part;
use crate::protocol::Fuses;

pub trait Target {
    fn signature(&self) -> [u8; 3];
    /// Flash page size in bytes, always even.
    fn page_size(&self) -> u8;
    /// Flash below the bootloader, in bytes.
    fn available_flash(&self) -> u16;
    fn fuses(&self) -> Fuses;
    fn eeprom_size(&self) -> u16;

    fn read_flash(&self, address: u16) -> u8;
    /// Starts erasing the page containing `address`. Returns immediately.
    fn page_erase(&mut self, address: u16);
    /// Blocks until the last erase or write has finished.
    fn busy_wait(&mut self);
    /// Loads one little-endian word into the temporary page buffer.
    fn page_fill(&mut self, address: u16, word: u16);
    /// Starts writing the temporary page buffer to the page containing `address`.
    fn page_write(&mut self, address: u16);
    /// Re-enables reading the application section after a write.
    fn rww_enable(&mut self);

    fn eeprom_read(&mut self, address: u16) -> u8;
    /// Writes one byte and blocks until it is stored.
    fn eeprom_write(&mut self, address: u16, value: u8);
}

/// Observable hardware operations, recorded by [`MemoryTarget`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    PageErase(u16),
    PageWrite(u16),
    EepromWrite(u16, u8),
}

/// Flash and EEPROM held in memory.
///
/// Mirrors the self-programming rules of the real part: a page write can only
/// clear bits, so writing a page that was not erased first ANDs the new data
/// into the old contents.
#[derive(Debug, Clone)]
pub struct MemoryTarget {
    signature: [u8; 3],
    page_size: u8,
    available_flash: u16,
    fuses: Fuses,
    flash: Vec<u8>,
    eeprom: Vec<u8>,
    page_buffer: Vec<u8>,
    busy: bool,
    rww_enabled: bool,
    operations: Vec<Operation>,
}

impl MemoryTarget {
    /// Blank part: flash and EEPROM erased.
    ///
    /// # Panics
    ///
    /// If `page_size` is zero or odd.
    pub fn new(
        signature: [u8; 3],
        page_size: u8,
        available_flash: u16,
        eeprom_size: u16,
        fuses: Fuses,
    ) -> Self {
        assert!(
            page_size > 0 && page_size % 2 == 0,
            "page size must be a positive even number"
        );
        MemoryTarget {
            signature,
            page_size,
            available_flash,
            fuses,
            flash: vec![ERASED_BYTE; available_flash as usize],
            eeprom: vec![ERASED_BYTE; eeprom_size as usize],
            page_buffer: vec![ERASED_BYTE; page_size as usize],
            busy: false,
            rww_enabled: true,
            operations: vec![],
        }
    }

    pub fn from_part(part: &Part) -> Self {
        Self::new(
            part.signature,
            part.page_size,
            part.available_flash(),
            part.eeprom_size,
            part.fuses(),
        )
    }

    pub fn flash(&self) -> &[u8] {
        &self.flash
    }

    pub fn flash_mut(&mut self) -> &mut [u8] {
        &mut self.flash
    }

    pub fn eeprom(&self) -> &[u8] {
        &self.eeprom
    }

    pub fn eeprom_mut(&mut self) -> &mut [u8] {
        &mut self.eeprom
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    pub fn rww_enabled(&self) -> bool {
        self.rww_enabled
    }

    fn page_base(&self, address: u16) -> usize {
        let page = self.page_size as usize;
        (address as usize / page) * page
    }
}

impl Target for MemoryTarget {
    fn signature(&self) -> [u8; 3] {
        self.signature
    }

    fn page_size(&self) -> u8 {
        self.page_size
    }

    fn available_flash(&self) -> u16 {
        self.available_flash
    }

    fn fuses(&self) -> Fuses {
        self.fuses
    }

    fn eeprom_size(&self) -> u16 {
        self.eeprom.len() as u16
    }

    fn read_flash(&self, address: u16) -> u8 {
        self.flash
            .get(address as usize)
            .copied()
            .unwrap_or(ERASED_BYTE)
    }

    fn page_erase(&mut self, address: u16) {
        let base = self.page_base(address);
        let end = (base + self.page_size as usize).min(self.flash.len());
        if base < end {
            self.flash[base..end].fill(ERASED_BYTE);
        }
        self.operations.push(Operation::PageErase(address));
        self.busy = true;
        self.rww_enabled = false;
    }

    fn busy_wait(&mut self) {
        self.busy = false;
    }

    fn page_fill(&mut self, address: u16, word: u16) {
        // word offset within the page
        let offset = (address as usize % self.page_size as usize) & !1;
        let [lo, hi] = word.to_le_bytes();
        self.page_buffer[offset] = lo;
        self.page_buffer[offset + 1] = hi;
    }

    fn page_write(&mut self, address: u16) {
        let base = self.page_base(address);
        for (offset, &value) in self.page_buffer.iter().enumerate() {
            if let Some(cell) = self.flash.get_mut(base + offset) {
                *cell &= value;
            }
        }
        self.page_buffer.fill(ERASED_BYTE);
        self.operations.push(Operation::PageWrite(address));
        self.busy = true;
        self.rww_enabled = false;
    }

    fn rww_enable(&mut self) {
        self.rww_enabled = true;
    }

    fn eeprom_read(&mut self, address: u16) -> u8 {
        self.eeprom
            .get(address as usize)
            .copied()
            .unwrap_or(ERASED_BYTE)
    }

    fn eeprom_write(&mut self, address: u16, value: u8) {
        if let Some(cell) = self.eeprom.get_mut(address as usize) {
            *cell = value;
        }
        self.operations.push(Operation::EepromWrite(address, value));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> MemoryTarget {
        MemoryTarget::new([0x1e, 0x95, 0x0f], 4, 16, 8, Fuses::default())
    }

    #[test]
    fn write_without_erase_only_clears_bits() {
        let mut t = target();
        t.page_fill(4, 0x0f0f);
        t.page_fill(6, 0x0f0f);
        t.page_write(4);
        assert_eq!(&t.flash()[4..8], [0x0f; 4]);

        t.page_fill(4, 0xf0f0);
        t.page_fill(6, 0xf0f0);
        t.page_write(4);
        assert_eq!(&t.flash()[4..8], [0x00; 4]);

        t.page_erase(5);
        t.busy_wait();
        assert_eq!(&t.flash()[4..8], [0xff; 4]);
        assert_eq!(&t.flash()[0..4], [0xff; 4]);
    }

    #[test]
    fn out_of_range_reads_are_erased() {
        let mut t = target();
        assert_eq!(t.read_flash(100), 0xff);
        assert_eq!(t.eeprom_read(100), 0xff);
        t.eeprom_write(3, 0x42);
        assert_eq!(t.eeprom_read(3), 0x42);
        assert_eq!(t.operations(), [Operation::EepromWrite(3, 0x42)]);
    }
}
