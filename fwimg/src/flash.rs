//! Flash access layer.
//!
//! Wraps any [`NorFlash`] device and exposes reads, writes and erases over absolute
//! addresses. Writes must be whole atomic write units and are read back and compared.
//! Every read drains the double-ECC fault counter, so a fault raised while copying
//! turns an apparently successful read into an error.
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use embedded_storage::nor_flash::{NorFlash, NorFlashError, NorFlashErrorKind};

use crate::watchdog::Watchdog;

pub mod mem;

/// Counter incremented by the double-bit ECC fault handler.
///
/// The handler side calls [`EccFaultCounter::record`]; the read primitive drains it
/// right before and right after copying data out of flash.
#[derive(Debug, Clone, Default)]
pub struct EccFaultCounter(Arc<AtomicU32>);

impl EccFaultCounter {
    pub fn record(&self) {
        self.0.fetch_add(1, Ordering::AcqRel);
    }

    /// Returns the number of faults seen since the last drain and resets the counter.
    pub fn drain(&self) -> u32 {
        self.0.swap(0, Ordering::AcqRel)
    }
}

/// Flash device mapped at a base address.
pub struct FlashAccess<F> {
    device: F,
    base: u32,
    ecc: EccFaultCounter,
}

impl<F: NorFlash> FlashAccess<F> {
    pub fn new(device: F, base: u32, ecc: EccFaultCounter) -> Self {
        Self { device, base, ecc }
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    pub fn capacity(&self) -> usize {
        self.device.capacity()
    }

    pub fn write_unit(&self) -> usize {
        F::WRITE_SIZE
    }

    pub fn page_size(&self) -> usize {
        F::ERASE_SIZE
    }

    pub fn device(&self) -> &F {
        &self.device
    }

    pub fn into_inner(self) -> F {
        self.device
    }

    /// Start address of the page holding `addr`.
    pub fn page_start(&self, addr: u32) -> u32 {
        addr - (addr.wrapping_sub(self.base) % F::ERASE_SIZE as u32)
    }

    fn offset(&self, addr: u32, len: usize) -> Result<u32, Error> {
        let offset = addr
            .checked_sub(self.base)
            .ok_or(Error::OutOfBounds { addr, len })?;
        if offset as usize + len > self.capacity() {
            return Err(Error::OutOfBounds { addr, len });
        }
        Ok(offset)
    }

    /// Copies `dst.len()` bytes starting at `addr`.
    pub fn read(&mut self, addr: u32, dst: &mut [u8]) -> Result<(), Error> {
        let offset = self.offset(addr, dst.len())?;

        // stale faults belong to someone else
        let stale = self.ecc.drain();
        if stale != 0 {
            #[cfg(feature = "log")]
            log::warn!("{} double ECC error(s) recorded outside a read", stale);
        }

        self.device
            .read(offset, dst)
            .map_err(|e| Error::Read { addr, kind: e.kind() })?;

        if self.ecc.drain() != 0 {
            #[cfg(feature = "log")]
            log::error!("double ECC error while reading {:#010x}", addr);
            return Err(Error::DoubleEcc { addr });
        }

        Ok(())
    }

    /// Programs `src` at `addr` and verifies the result by reading it back.
    pub fn write(&mut self, addr: u32, src: &[u8]) -> Result<(), Error> {
        let offset = self.offset(addr, src.len())?;
        if offset as usize % F::WRITE_SIZE != 0 || src.len() % F::WRITE_SIZE != 0 {
            return Err(Error::Misaligned {
                addr,
                len: src.len(),
            });
        }

        self.device
            .write(offset, src)
            .map_err(|e| Error::Write { addr, kind: e.kind() })?;

        let mut readback = [0_u8; 64];
        for (i, expected) in src.chunks(readback.len()).enumerate() {
            let at = addr + (i * readback.len()) as u32;
            let readback = &mut readback[..expected.len()];
            self.read(at, readback)?;
            if readback != expected {
                return Err(Error::VerifyMismatch { addr: at });
            }
        }

        Ok(())
    }

    /// Erases `len` bytes starting at `addr`, one page at a time, refreshing the
    /// watchdog after every page.
    pub fn erase(
        &mut self,
        addr: u32,
        len: usize,
        watchdog: &mut impl Watchdog,
    ) -> Result<(), Error> {
        let offset = self.offset(addr, len)?;
        let page = F::ERASE_SIZE;
        if offset as usize % page != 0 || len % page != 0 {
            return Err(Error::Misaligned { addr, len });
        }

        for from in (offset..offset + len as u32).step_by(page) {
            self.device
                .erase(from, from + page as u32)
                .map_err(|e| Error::Erase {
                    addr: self.base + from,
                    kind: e.kind(),
                })?;
            watchdog.refresh();
        }

        Ok(())
    }
}

/// Flash error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    Read { addr: u32, kind: NorFlashErrorKind },
    Write { addr: u32, kind: NorFlashErrorKind },
    Erase { addr: u32, kind: NorFlashErrorKind },
    DoubleEcc { addr: u32 },
    Misaligned { addr: u32, len: usize },
    OutOfBounds { addr: u32, len: usize },
    VerifyMismatch { addr: u32 },
}

#[cfg(test)]
mod tests {
    use super::mem::MemFlash;
    use super::*;
    use crate::watchdog::RefreshCounter;

    const BASE: u32 = 0x0800_0000;

    fn access() -> FlashAccess<MemFlash<8, 512>> {
        let device = MemFlash::new(4 * 512);
        let ecc = device.ecc_counter();
        FlashAccess::new(device, BASE, ecc)
    }

    #[test]
    fn write_then_read() {
        let mut flash = access();
        flash.write(BASE + 16, &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();

        let mut buf = [0_u8; 10];
        flash.read(BASE + 15, &mut buf).unwrap();
        assert_eq!(buf, [0xFF, 1, 2, 3, 4, 5, 6, 7, 8, 0xFF]);
    }

    #[test]
    fn misaligned_writes_are_refused() {
        let mut flash = access();
        assert_eq!(
            flash.write(BASE + 4, &[0; 8]),
            Err(Error::Misaligned {
                addr: BASE + 4,
                len: 8
            })
        );
        assert_eq!(
            flash.write(BASE, &[0; 12]),
            Err(Error::Misaligned { addr: BASE, len: 12 })
        );
    }

    #[test]
    fn out_of_bounds() {
        let mut flash = access();
        let mut buf = [0_u8; 8];
        assert!(matches!(
            flash.read(BASE - 8, &mut buf),
            Err(Error::OutOfBounds { .. })
        ));
        assert!(matches!(
            flash.read(BASE + 4 * 512 - 4, &mut buf),
            Err(Error::OutOfBounds { .. })
        ));
    }

    #[test]
    fn erase_refreshes_watchdog_per_page() {
        let mut flash = access();
        flash.write(BASE + 512, &[0; 8]).unwrap();

        let mut watchdog = RefreshCounter::default();
        flash.erase(BASE + 512, 3 * 512, &mut watchdog).unwrap();
        assert_eq!(watchdog.0, 3);

        let mut buf = [0_u8; 8];
        flash.read(BASE + 512, &mut buf).unwrap();
        assert_eq!(buf, [0xFF; 8]);
    }

    #[test]
    fn unaligned_erase() {
        let mut flash = access();
        assert!(matches!(
            flash.erase(BASE + 8, 512, &mut RefreshCounter::default()),
            Err(Error::Misaligned { .. })
        ));
    }

    #[test]
    fn ecc_fault_turns_read_into_error() {
        let mut flash = access();
        flash.device.inject_ecc_fault(600..608);

        let mut buf = [0_u8; 32];
        flash.read(BASE, &mut buf).unwrap();
        assert_eq!(
            flash.read(BASE + 590, &mut buf),
            Err(Error::DoubleEcc { addr: BASE + 590 })
        );

        // counter is drained; the next clean read succeeds
        flash.read(BASE + 1024, &mut buf).unwrap();
    }

    #[test]
    fn stale_fault_is_not_attributed_to_next_read() {
        let mut flash = access();
        flash.ecc.record();
        flash.ecc.record();
        let mut buf = [0_u8; 8];
        flash.read(BASE, &mut buf).unwrap();
        // consumed by that read, not carried over
        assert_eq!(flash.ecc.drain(), 0);

        flash.device.inject_ecc_fault(8..16);
        assert_eq!(
            flash.read(BASE + 8, &mut buf),
            Err(Error::DoubleEcc { addr: BASE + 8 })
        );
    }

    #[test]
    fn rejected_program_is_reported() {
        let mut flash = access();
        flash.write(BASE, &[0x0F; 8]).unwrap();
        assert!(matches!(
            flash.write(BASE, &[0xF0; 8]),
            Err(Error::Write { addr: BASE, .. })
        ));
        // zeroing a programmed unit is always allowed
        flash.write(BASE, &[0; 8]).unwrap();
    }
}
