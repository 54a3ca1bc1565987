//! RAM backed NOR flash simulator.
//!
//! Follows NOR programming rules: erase sets a page to `0xFF`, and a write unit may
//! only be programmed while erased or with all-zero data. Faults can be injected:
//! double-ECC errors on read ranges, and a power cut after a given number of
//! program/erase operations.
use std::ops::Range;

use embedded_storage::nor_flash::{
    ErrorType, NorFlash, NorFlashError, NorFlashErrorKind, ReadNorFlash,
};

use super::EccFaultCounter;
use crate::constants::ERASED_BYTE;
use crate::util;

/// Byte left behind by an erase cut short by a power loss.
pub const TORN_ERASE_BYTE: u8 = 0x5A;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemFlashError {
    NotAligned,
    OutOfBounds,
    /// The unit is neither erased nor being zeroed.
    ProgramOverlap,
    PowerLoss,
}

impl NorFlashError for MemFlashError {
    fn kind(&self) -> NorFlashErrorKind {
        match self {
            MemFlashError::NotAligned => NorFlashErrorKind::NotAligned,
            MemFlashError::OutOfBounds => NorFlashErrorKind::OutOfBounds,
            MemFlashError::ProgramOverlap | MemFlashError::PowerLoss => NorFlashErrorKind::Other,
        }
    }
}

/// Simulated flash with a `WRITE` byte program unit and `PAGE` byte erase unit.
pub struct MemFlash<const WRITE: usize, const PAGE: usize> {
    data: Vec<u8>,
    ecc: EccFaultCounter,
    ecc_faults: Vec<Range<u32>>,
    operations: usize,
    cut_at: Option<usize>,
    powered: bool,
}

impl<const WRITE: usize, const PAGE: usize> MemFlash<WRITE, PAGE> {
    /// Creates an erased device, rounded up to whole pages.
    pub fn new(capacity: usize) -> Self {
        Self::from_bytes(vec![ERASED_BYTE; capacity])
    }

    /// Wraps an existing flash dump. A trailing partial page is padded with the erase pattern.
    pub fn from_bytes(mut data: Vec<u8>) -> Self {
        data.resize(util::align_up(data.len(), PAGE), ERASED_BYTE);
        Self {
            data,
            ecc: EccFaultCounter::default(),
            ecc_faults: Vec::new(),
            operations: 0,
            cut_at: None,
            powered: true,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    /// Counter the simulated fault handler reports into.
    pub fn ecc_counter(&self) -> EccFaultCounter {
        self.ecc.clone()
    }

    /// Any read touching `range` raises a double-ECC fault.
    pub fn inject_ecc_fault(&mut self, range: Range<u32>) {
        self.ecc_faults.push(range);
    }

    pub fn clear_ecc_faults(&mut self) {
        self.ecc_faults.clear();
    }

    /// Cuts power during the program/erase operation that follows the next `ops` ones.
    pub fn cut_power_after(&mut self, ops: usize) {
        self.cut_at = Some(self.operations + ops);
    }

    /// Powers the device back up, as after a reset.
    pub fn restore_power(&mut self) {
        self.cut_at = None;
        self.powered = true;
    }

    pub fn is_powered(&self) -> bool {
        self.powered
    }

    /// Number of program/erase operations executed so far.
    pub fn operations(&self) -> usize {
        self.operations
    }

    fn check(&self, offset: u32, len: usize, align: usize) -> Result<(), MemFlashError> {
        if !self.powered {
            return Err(MemFlashError::PowerLoss);
        }
        if offset as usize % align != 0 || len % align != 0 {
            return Err(MemFlashError::NotAligned);
        }
        if offset as usize + len > self.data.len() {
            return Err(MemFlashError::OutOfBounds);
        }
        Ok(())
    }

    /// Accounts for one program/erase operation, returning true if power is lost during it.
    fn begin_operation(&mut self) -> bool {
        let cut = self.cut_at == Some(self.operations);
        self.operations += 1;
        if cut {
            self.powered = false;
        }
        cut
    }
}

impl<const WRITE: usize, const PAGE: usize> ErrorType for MemFlash<WRITE, PAGE> {
    type Error = MemFlashError;
}

impl<const WRITE: usize, const PAGE: usize> ReadNorFlash for MemFlash<WRITE, PAGE> {
    const READ_SIZE: usize = 1;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        self.check(offset, bytes.len(), Self::READ_SIZE)?;

        let start = offset as usize;
        bytes.copy_from_slice(&self.data[start..start + bytes.len()]);

        let read = offset..offset + bytes.len() as u32;
        if self
            .ecc_faults
            .iter()
            .any(|fault| fault.start < read.end && read.start < fault.end)
        {
            // the fault handler skips the faulting load and lets the copy finish
            self.ecc.record();
        }

        Ok(())
    }

    fn capacity(&self) -> usize {
        self.data.len()
    }
}

impl<const WRITE: usize, const PAGE: usize> NorFlash for MemFlash<WRITE, PAGE> {
    const WRITE_SIZE: usize = WRITE;
    const ERASE_SIZE: usize = PAGE;

    fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        let len = to.checked_sub(from).ok_or(MemFlashError::OutOfBounds)? as usize;
        self.check(from, len, PAGE)?;

        let range = from as usize..to as usize;
        if self.begin_operation() {
            self.data[range.start..range.start + len.min(PAGE)].fill(TORN_ERASE_BYTE);
            return Err(MemFlashError::PowerLoss);
        }

        self.data[range].fill(ERASED_BYTE);
        Ok(())
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        self.check(offset, bytes.len(), WRITE)?;

        let start = offset as usize;
        for (i, unit) in bytes.chunks_exact(WRITE).enumerate() {
            let at = start + i * WRITE;
            let current = &self.data[at..at + WRITE];
            if !util::is_erased(current) && !util::is_zeroed(unit) {
                return Err(MemFlashError::ProgramOverlap);
            }
        }

        let units = bytes.len() / WRITE;
        let programmed = if self.begin_operation() {
            units / 2
        } else {
            units
        };

        for (i, unit) in bytes.chunks_exact(WRITE).take(programmed).enumerate() {
            let at = start + i * WRITE;
            for (cell, new) in self.data[at..at + WRITE].iter_mut().zip(unit) {
                *cell &= *new;
            }
        }

        if programmed < units {
            return Err(MemFlashError::PowerLoss);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Flash = MemFlash<8, 256>;

    #[test]
    fn starts_erased_and_page_rounded() {
        let flash = Flash::new(300);
        assert_eq!(flash.capacity(), 512);
        assert!(util::is_erased(flash.as_bytes()));
    }

    #[test]
    fn nor_programming_rules() {
        let mut flash = Flash::new(256);
        flash.write(0, &[0xAA; 8]).unwrap();
        assert_eq!(flash.write(0, &[0xAA; 8]), Err(MemFlashError::ProgramOverlap));
        flash.write(0, &[0; 8]).unwrap();
        assert_eq!(&flash.as_bytes()[..8], &[0; 8]);

        flash.erase(0, 256).unwrap();
        flash.write(0, &[0x55; 16]).unwrap();
        assert_eq!(flash.write(3, &[0; 8]), Err(MemFlashError::NotAligned));
    }

    #[test]
    fn power_cut_during_write_programs_half() {
        let mut flash = Flash::new(256);
        flash.cut_power_after(1);
        flash.write(0, &[1; 8]).unwrap();
        assert_eq!(flash.write(8, &[2; 32]), Err(MemFlashError::PowerLoss));
        assert_eq!(&flash.as_bytes()[8..24], &[2; 16]);
        assert!(util::is_erased(&flash.as_bytes()[24..40]));

        let mut buf = [0_u8; 8];
        assert_eq!(flash.read(0, &mut buf), Err(MemFlashError::PowerLoss));

        flash.restore_power();
        flash.read(0, &mut buf).unwrap();
        assert_eq!(buf, [1; 8]);
        assert_eq!(flash.operations(), 2);
    }

    #[test]
    fn power_cut_during_erase_leaves_garbage() {
        let mut flash = Flash::new(512);
        flash.write(0, &[0; 8]).unwrap();
        flash.cut_power_after(0);
        assert_eq!(flash.erase(0, 256), Err(MemFlashError::PowerLoss));
        assert!(flash.as_bytes()[..256].iter().all(|b| *b == TORN_ERASE_BYTE));
        assert!(!flash.is_powered());
    }

    #[test]
    fn ecc_fault_ranges() {
        let mut flash = Flash::new(256);
        let counter = flash.ecc_counter();
        flash.inject_ecc_fault(16..24);

        let mut buf = [0_u8; 8];
        flash.read(0, &mut buf).unwrap();
        assert_eq!(counter.drain(), 0);
        flash.read(20, &mut buf).unwrap();
        assert_eq!(counter.drain(), 1);

        flash.clear_ecc_faults();
        flash.read(20, &mut buf).unwrap();
        assert_eq!(counter.drain(), 0);
    }
}
