//! Slot lifecycle: state inspection, the VALID commit point, post-install scanning
//! and cleanup.
use embedded_storage::nor_flash::NorFlash;

use crate::config::Region;
use crate::constants::*;
use crate::header::{self, FwRawHeader};
use crate::util;
use crate::watchdog::Watchdog;
use crate::{Error, FwImg};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotId {
    /// Slot 0, the image that gets launched.
    Active,
    /// Where the loader stores a candidate. Slot 0 itself in the single slot profile.
    Download,
}

/// Where a slot is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Erased, or invalidated.
    Empty,
    /// Carries a header but no VALID marker: a download or an interrupted install.
    Written,
    /// Validated image outside slot 0, e.g. the backup left by a swap.
    Valid,
    /// A swap between the slots is in progress.
    Swapping,
    /// Validated image in slot 0.
    Active,
}

/// Anti-rollback check. A candidate must not be older than the active image nor
/// than the configured minimum; reinstalling the same version is allowed.
pub fn check_fw_version(current: Option<u16>, candidate: u16, min_version: u16) -> Result<(), Error> {
    let floor = current.unwrap_or(0).max(min_version);
    if candidate < floor {
        #[cfg(feature = "log")]
        log::warn!(
            "rejecting v{}: floor {:?}, minimum {}",
            candidate,
            current,
            min_version
        );
        return Err(Error::Rollback {
            current,
            candidate,
            min_version,
        });
    }
    Ok(())
}

impl<F: NorFlash, W: Watchdog> FwImg<F, W> {
    pub fn slot_region(&self, slot: SlotId) -> Region {
        match slot {
            SlotId::Active => self.config.slot0,
            SlotId::Download => self.config.download_slot(),
        }
    }

    pub fn slot_state(&mut self, slot: SlotId) -> Result<SlotState, Error> {
        if self.swap_armed()? {
            return Ok(SlotState::Swapping);
        }

        let region = self.slot_region(slot);
        let area = self.read_header_area(region.start)?;
        if util::is_erased(&area[..HEADER_LEN]) || util::is_zeroed(&area[HEADER_LEN..]) {
            return Ok(SlotState::Empty);
        }

        Ok(match (header::check_header_validated(&area), slot) {
            (Ok(()), SlotId::Active) => SlotState::Active,
            (Ok(()), SlotId::Download) => SlotState::Valid,
            (Err(_), _) => SlotState::Written,
        })
    }

    /// Version of the image in slot 0, if its header is authentic.
    ///
    /// An invalidated image still counts: its version keeps blocking older candidates.
    pub fn active_version(&mut self) -> Result<Option<u16>, Error> {
        let raw = self.read_raw_header(self.config.slot0.start)?;
        if util::is_erased(&raw) {
            return Ok(None);
        }
        match self.verify_fw_raw_header_tag(&raw) {
            Ok(header) => Ok(Some(header.fw_version)),
            Err(e) if e.kind() == crate::ErrorKind::Structural
                || e.kind() == crate::ErrorKind::Authentication =>
            {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Scans a slot beyond the end of its image.
    ///
    /// Every write unit after the image must be erased or zeroed; anything else is
    /// treated as code smuggled past the authenticated area.
    pub fn verify_slot(&mut self, slot: Region, fw_size: u32) -> Result<(), Error> {
        let wu = self.flash.write_unit();
        let from = util::align_up(self.config.image_offset as usize + fw_size as usize, wu);
        let len = slot.len as usize;
        if from > len {
            return Err(Error::ImageTooLarge {
                size: fw_size as usize,
                capacity: len - self.config.image_offset as usize,
            });
        }

        let mut window = [0_u8; VERIFY_WINDOW];
        let mut offset = from;
        while offset < len {
            let n = (len - offset).min(VERIFY_WINDOW);
            let addr = slot.start + offset as u32;
            self.flash.read(addr, &mut window[..n])?;

            for (i, unit) in window[..n].chunks(wu).enumerate() {
                if !util::is_erased(unit) && !util::is_zeroed(unit) {
                    let addr = addr + (i * wu) as u32;
                    #[cfg(feature = "log")]
                    log::error!("unexpected content at {:#010x} past the image end", addr);
                    return Err(Error::MaliciousCode { addr });
                }
            }

            offset += n;
            self.watchdog.refresh();
        }

        Ok(())
    }

    /// Zeroes every write unit of `slot` from offset `from` (rounded up to a write
    /// unit) to the end of the slot.
    pub fn clean_up_slot(&mut self, slot: Region, from: usize) -> Result<(), Error> {
        let from = util::align_up(from, self.flash.write_unit());
        self.zero_range(slot.start + from as u32, slot.end())
    }

    /// Programs to zero every unit in `[start, end)` that is not zero yet.
    fn zero_range(&mut self, start: u32, end: u32) -> Result<(), Error> {
        let wu = self.flash.write_unit();
        let zeros = [0_u8; VERIFY_WINDOW];
        let mut window = [0_u8; VERIFY_WINDOW];

        let mut addr = start;
        while addr < end {
            let n = ((end - addr) as usize).min(VERIFY_WINDOW);
            self.flash.read(addr, &mut window[..n])?;

            // program runs of non-zero units in one go
            let mut run: Option<usize> = None;
            for (i, unit) in window[..n].chunks(wu).enumerate() {
                match (util::is_zeroed(unit), run) {
                    (false, None) => run = Some(i * wu),
                    (true, Some(at)) => {
                        self.flash.write(addr + at as u32, &zeros[..i * wu - at])?;
                        run = None;
                    }
                    _ => {}
                }
            }
            if let Some(at) = run {
                self.flash.write(addr + at as u32, &zeros[..n - at])?;
            }

            addr += n as u32;
            self.watchdog.refresh();
        }

        Ok(())
    }

    /// Writes the VALID marker of the header found at the base of `slot`.
    ///
    /// Each of the three copies is written separately. Units that already hold the
    /// right pattern are left alone, so the operation can be repeated after a reset.
    pub fn write_header_validated(&mut self, slot: Region) -> Result<(), Error> {
        let area = self.read_header_area(slot.start)?;
        if header::check_header_validated(&area).is_ok() {
            return Ok(());
        }

        let header = FwRawHeader::decode(&area)?;
        let pattern = header.valid_pattern();
        let wu = self.flash.write_unit();

        for copy in 0..3 {
            let at = HEADER_LEN + copy * MAGIC_LENGTH;
            let current = &area[at..at + MAGIC_LENGTH];
            for (i, (unit, wanted)) in current.chunks(wu).zip(pattern.chunks(wu)).enumerate() {
                let addr = slot.start + (at + i * wu) as u32;
                if unit == wanted {
                    continue;
                }
                if !util::is_erased(unit) {
                    return Err(Error::ValidAreaCorrupt { addr });
                }
                self.flash.write(addr, wanted)?;
            }
        }

        let area = self.read_header_area(slot.start)?;
        header::check_header_validated(&area)?;

        #[cfg(feature = "log")]
        log::info!("v{} validated at {:#010x}", header.fw_version, slot.start);
        Ok(())
    }

    /// Revokes the active image: zeroes its VALID marker and its payload.
    ///
    /// The header stays in place so its version keeps counting for anti-rollback.
    pub fn invalidate_current_firmware(&mut self) -> Result<(), Error> {
        self.fw_header_validated = None;
        self.fw_tag_validated = None;
        self.invalidate_slot(self.config.slot0)?;

        #[cfg(feature = "log")]
        log::warn!("active firmware invalidated");
        Ok(())
    }

    /// Zeroes the VALID area and the payload of `slot`, keeping its header.
    pub(crate) fn invalidate_slot(&mut self, slot: Region) -> Result<(), Error> {
        self.zero_range(
            slot.start + HEADER_LEN as u32,
            slot.start + HEADER_AREA_LEN as u32,
        )?;
        self.clean_up_slot(slot, self.config.image_offset as usize)
    }

    /// Erases the slot candidates are downloaded to.
    pub fn erase_downloaded_img(&mut self) -> Result<(), Error> {
        let slot = self.config.download_slot();
        self.download = None;
        self.flash
            .erase(slot.start, slot.len as usize, &mut self.watchdog)?;

        #[cfg(feature = "log")]
        log::debug!("erased download slot at {:#010x}", slot.start);
        Ok(())
    }
}
