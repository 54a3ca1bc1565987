//! Anti-rollback version floor that survives slot erases.
//!
//! The record region is split into two banks of equal size. Raising the floor
//! appends one write unit to a bank:
//!
//! ```text
//! bytes 0..2   version (u16 LE)
//! bytes 2..4   bitwise complement of the version
//! bytes 4..    zero
//! ```
//!
//! The floor is the highest well formed entry in either bank. Once the bank holding
//! it is full, the new entry opens the other bank, which is erased first. The full
//! bank is erased only after that, so the floor is on flash at every point.
use embedded_storage::nor_flash::NorFlash;

use crate::config::Region;
use crate::constants::*;
use crate::util;
use crate::watchdog::Watchdog;
use crate::{Error, FwImg};

#[derive(Debug, Clone, Copy)]
struct Bank {
    region: Region,
    floor: Option<u16>,
    /// Unit index after the last programmed one.
    next: usize,
    units: usize,
}

impl Bank {
    fn has_room(&self) -> bool {
        self.next < self.units
    }
}

fn encode_entry(version: u16, write_unit: usize) -> Vec<u8> {
    let mut unit = vec![0_u8; write_unit];
    unit[..2].copy_from_slice(&version.to_le_bytes());
    unit[2..VERSION_ENTRY_LEN].copy_from_slice(&(!version).to_le_bytes());
    unit
}

fn decode_entry(unit: &[u8]) -> Option<u16> {
    let version = u16::from_le_bytes([unit[0], unit[1]]);
    let check = u16::from_le_bytes([unit[2], unit[3]]);
    (check == !version && util::is_zeroed(&unit[VERSION_ENTRY_LEN..])).then_some(version)
}

impl<F: NorFlash, W: Watchdog> FwImg<F, W> {
    fn version_banks(&self) -> [Region; 2] {
        let record = self.config.version_record;
        let half = record.len / 2;
        [
            Region::new(record.start, half),
            Region::new(record.start + half, half),
        ]
    }

    fn scan_bank(&mut self, region: Region) -> Result<Bank, Error> {
        let wu = self.flash.write_unit();
        let len = region.len as usize;
        let mut window = [0_u8; VERIFY_WINDOW];
        let mut floor = None;
        let mut next = 0;

        let mut offset = 0;
        while offset < len {
            let n = (len - offset).min(VERIFY_WINDOW);
            self.flash.read(region.start + offset as u32, &mut window[..n])?;
            for (i, unit) in window[..n].chunks(wu).enumerate() {
                if util::is_erased(unit) {
                    continue;
                }
                next = offset / wu + i + 1;
                floor = floor.max(decode_entry(unit));
            }
            offset += n;
        }

        Ok(Bank {
            region,
            floor,
            next,
            units: len / wu,
        })
    }

    /// Highest version recorded as installed, if any.
    pub fn version_floor(&mut self) -> Result<Option<u16>, Error> {
        let [a, b] = self.version_banks();
        let a = self.scan_bank(a)?;
        let b = self.scan_bank(b)?;
        Ok(a.floor.max(b.floor))
    }

    /// Version a candidate has to reach: the recorded floor or the version of the
    /// authentic header in slot 0, whichever is higher.
    pub fn rollback_floor(&mut self) -> Result<Option<u16>, Error> {
        let recorded = self.version_floor()?;
        Ok(recorded.max(self.active_version()?))
    }

    /// Raises the recorded floor to `version`. Never lowers it.
    pub fn raise_version_floor(&mut self, version: u16) -> Result<(), Error> {
        let [a, b] = self.version_banks();
        let a = self.scan_bank(a)?;
        let b = self.scan_bank(b)?;
        if a.floor.max(b.floor) >= Some(version) {
            return Ok(());
        }

        let (current, other) = if b.floor > a.floor { (b, a) } else { (a, b) };
        let wu = self.flash.write_unit();
        let entry = encode_entry(version, wu);

        if current.has_room() {
            self.flash
                .write(current.region.start + (current.next * wu) as u32, &entry)?;
        } else {
            #[cfg(feature = "log")]
            log::debug!("version record bank at {:#010x} full, switching banks", current.region.start);

            self.flash
                .erase(other.region.start, other.region.len as usize, &mut self.watchdog)?;
            self.flash.write(other.region.start, &entry)?;
            self.flash
                .erase(current.region.start, current.region.len as usize, &mut self.watchdog)?;
        }

        #[cfg(feature = "log")]
        log::info!("version floor raised to v{}", version);
        Ok(())
    }
}
