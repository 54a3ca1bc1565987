//! Dual slot swap through a scratch region, resumable after power loss.
//!
//! The slots are exchanged one swap-region sized chunk at a time, in three stages:
//! download chunk to swap, active chunk to download, swap to active. Each stage ends
//! by programming a marker unit to zero in the trailer, so the next stage to run can
//! always be read back from flash, and every stage can be repeated safely.
//!
//! An install that fails its final checks is reversed by a second exchange with its
//! own set of stage markers. Setting the rollback marker switches a resumed swap over
//! to that set, so the trailer stays armed from the install until the rollback ends.
//!
//! ```text
//! trailer + 0                          header copy of the image moving into slot 0
//! trailer + 192                        count unit: chunk count (u32 LE)
//! trailer + 192 + wu                   armed marker
//! trailer + 192 + 2wu                  rollback marker
//! trailer + 192 + 3wu + 3i*wu          install stage markers of chunk i
//! trailer + 192 + 3wu + 3(n + i)*wu    rollback stage markers of chunk i
//! ```
//!
//! `n` is the number of swap chunks in a slot.
use embedded_storage::nor_flash::NorFlash;

use crate::config::Region;
use crate::constants::*;
use crate::header::FwRawHeader;
use crate::util;
use crate::watchdog::Watchdog;
use crate::{Error, FwImg};

/// Why the slots are being swapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapKind {
    /// A candidate moves into slot 0.
    Install,
    /// A candidate that failed its final checks moves back out.
    Rollback,
}

/// Progress of one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkState {
    NotSwapped,
    /// Download chunk copied to the swap region.
    InSwap,
    /// Active chunk copied to the download slot.
    InDownload,
    Swapped,
}

/// An armed swap as recorded in the trailer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapStatus {
    pub kind: SwapKind,
    pub chunks: usize,
    pub swapped: usize,
}

enum Marker {
    Erased,
    Set,
    Corrupt,
}

#[derive(Clone, Copy)]
struct Trailer {
    region: Region,
    write_unit: usize,
    slot_chunks: usize,
}

impl Trailer {
    fn count(&self) -> u32 {
        self.region.start + HEADER_LEN as u32
    }

    fn armed(&self) -> u32 {
        self.count() + self.write_unit as u32
    }

    fn rollback(&self) -> u32 {
        self.armed() + self.write_unit as u32
    }

    fn marker(&self, kind: SwapKind, chunk: usize, stage: usize) -> u32 {
        let first = match kind {
            SwapKind::Install => 0,
            SwapKind::Rollback => self.slot_chunks,
        };
        self.rollback() + ((1 + 3 * (first + chunk) + stage) * self.write_unit) as u32
    }
}

impl<F: NorFlash, W: Watchdog> FwImg<F, W> {
    fn trailer(&self) -> Option<Trailer> {
        self.dual_slot().map(|(_, swap, region)| Trailer {
            region,
            write_unit: self.flash.write_unit(),
            slot_chunks: (self.config.slot0.len / swap.len) as usize,
        })
    }

    fn swap_layout(&self) -> Result<(Region, Region, Trailer), Error> {
        match (self.dual_slot(), self.trailer()) {
            (Some((download, swap, _)), Some(trailer)) => Ok((download, swap, trailer)),
            _ => Err(Error::Unsupported("swapping needs the dual slot profile")),
        }
    }

    /// True while a swap is recorded as in progress.
    pub fn swap_armed(&mut self) -> Result<bool, Error> {
        match self.trailer() {
            Some(trailer) => Ok(matches!(self.marker(trailer.armed())?, Marker::Set)),
            None => Ok(false),
        }
    }

    fn marker(&mut self, addr: u32) -> Result<Marker, Error> {
        let mut unit = vec![0_u8; self.flash.write_unit()];
        self.flash.read(addr, &mut unit)?;
        Ok(if util::is_erased(&unit) {
            Marker::Erased
        } else if util::is_zeroed(&unit) {
            Marker::Set
        } else {
            Marker::Corrupt
        })
    }

    fn set_marker(&mut self, addr: u32) -> Result<(), Error> {
        let zeros = vec![0_u8; self.flash.write_unit()];
        self.flash.write(addr, &zeros)?;
        Ok(())
    }

    pub fn chunk_state(&mut self, kind: SwapKind, chunk: usize) -> Result<ChunkState, Error> {
        let (_, _, trailer) = self.swap_layout()?;

        let mut set = [false; 3];
        for (stage, set) in set.iter_mut().enumerate() {
            *set = match self.marker(trailer.marker(kind, chunk, stage))? {
                Marker::Erased => false,
                Marker::Set => true,
                Marker::Corrupt => return Err(Error::TrailerCorrupt),
            };
        }

        match set {
            [false, false, false] => Ok(ChunkState::NotSwapped),
            [true, false, false] => Ok(ChunkState::InSwap),
            [true, true, false] => Ok(ChunkState::InDownload),
            [true, true, true] => Ok(ChunkState::Swapped),
            _ => Err(Error::TrailerCorrupt),
        }
    }

    fn read_count(&mut self, trailer: &Trailer) -> Result<usize, Error> {
        let mut unit = vec![0_u8; trailer.write_unit];
        self.flash.read(trailer.count(), &mut unit)?;

        let chunks = u32::from_le_bytes([unit[0], unit[1], unit[2], unit[3]]) as usize;
        if chunks == 0 || chunks > trailer.slot_chunks || !util::is_erased(&unit[TRAILER_COUNT_LEN..]) {
            return Err(Error::TrailerCorrupt);
        }
        Ok(chunks)
    }

    /// Direction of the armed swap. A rollback marker that was only partly
    /// programmed still means the install failed.
    fn swap_kind(&mut self, trailer: &Trailer) -> Result<SwapKind, Error> {
        Ok(match self.marker(trailer.rollback())? {
            Marker::Erased => SwapKind::Install,
            Marker::Set | Marker::Corrupt => SwapKind::Rollback,
        })
    }

    /// Swap recorded in the trailer, if one is armed.
    pub fn swap_status(&mut self) -> Result<Option<SwapStatus>, Error> {
        let Some(trailer) = self.trailer() else {
            return Ok(None);
        };
        if !self.swap_armed()? {
            return Ok(None);
        }

        let chunks = self.read_count(&trailer)?;
        let kind = self.swap_kind(&trailer)?;
        let mut swapped = 0;
        while swapped < chunks && self.chunk_state(kind, swapped)? == ChunkState::Swapped {
            swapped += 1;
        }
        Ok(Some(SwapStatus {
            kind,
            chunks,
            swapped,
        }))
    }

    /// Bytes from the slot start that may hold image data.
    fn image_extent(&mut self, slot: Region) -> Result<usize, Error> {
        let raw = self.read_raw_header(slot.start)?;
        let len = slot.len as usize;
        Ok(match FwRawHeader::decode(&raw) {
            Ok(header) if header.check_structure().is_ok() => {
                (self.config.image_offset as usize + header.fw_size as usize).min(len)
            }
            _ => len,
        })
    }

    /// Records an install swap in the trailer and runs it to completion.
    pub(crate) fn swap_slots(&mut self, header: &[u8; HEADER_LEN]) -> Result<(), Error> {
        let (download, swap, trailer) = self.swap_layout()?;
        let extent = self
            .image_extent(self.config.slot0)?
            .max(self.image_extent(download)?);
        let chunks = extent.div_ceil(swap.len as usize);

        #[cfg(feature = "log")]
        log::info!("install swap of {} chunks", chunks);

        self.erase_trailer()?;
        self.flash.write(trailer.region.start, header)?;

        let mut count = vec![ERASED_BYTE; trailer.write_unit];
        count[..TRAILER_COUNT_LEN].copy_from_slice(&(chunks as u32).to_le_bytes());
        self.flash.write(trailer.count(), &count)?;
        self.set_marker(trailer.armed())?;

        self.run_swap(SwapKind::Install, chunks)
    }

    fn run_swap(&mut self, kind: SwapKind, chunks: usize) -> Result<(), Error> {
        let (download, swap, trailer) = self.swap_layout()?;
        let slot0 = self.config.slot0;
        let len = swap.len as usize;

        for chunk in 0..chunks {
            let at = (chunk * len) as u32;
            loop {
                let (from, to, stage) = match self.chunk_state(kind, chunk)? {
                    ChunkState::NotSwapped => (download.start + at, swap.start, 0),
                    ChunkState::InSwap => (slot0.start + at, download.start + at, 1),
                    ChunkState::InDownload => (swap.start, slot0.start + at, 2),
                    ChunkState::Swapped => break,
                };
                self.copy_region(from, to, len)?;
                self.set_marker(trailer.marker(kind, chunk, stage))?;
            }
        }

        Ok(())
    }

    /// Erases `len` bytes at `to` and copies `from` over, skipping erased windows.
    fn copy_region(&mut self, from: u32, to: u32, len: usize) -> Result<(), Error> {
        self.flash.erase(to, len, &mut self.watchdog)?;

        let mut window = [0_u8; VERIFY_WINDOW];
        let mut offset = 0;
        while offset < len {
            let n = (len - offset).min(VERIFY_WINDOW);
            self.flash.read(from + offset as u32, &mut window[..n])?;
            if !util::is_erased(&window[..n]) {
                self.flash.write(to + offset as u32, &window[..n])?;
            }
            offset += n;
        }

        Ok(())
    }

    /// Finishes whatever a swap was for, once all its chunks are exchanged.
    ///
    /// If a freshly installed image fails its final checks, the swap is undone and
    /// the original error returned.
    pub(crate) fn complete_swap(&mut self, kind: SwapKind, header: &FwRawHeader) -> Result<(), Error> {
        match kind {
            SwapKind::Install => match self.finish_install(header) {
                Ok(()) => Ok(()),
                Err(e) => {
                    #[cfg(feature = "log")]
                    log::error!("v{} failed after swap ({}), rolling back", header.fw_version, e);
                    self.roll_back()?;
                    Err(e)
                }
            },
            SwapKind::Rollback => self.finish_rollback(),
        }
    }

    /// Reverses a completed install swap. The trailer stays armed throughout.
    fn roll_back(&mut self) -> Result<(), Error> {
        let (_, _, trailer) = self.swap_layout()?;
        let chunks = self.read_count(&trailer)?;
        self.set_marker(trailer.rollback())?;
        self.run_swap(SwapKind::Rollback, chunks)?;
        self.finish_rollback()
    }

    fn finish_rollback(&mut self) -> Result<(), Error> {
        self.erase_downloaded_img()?;
        self.erase_trailer()
    }

    /// Completes a swap interrupted by a reset, or clears a trailer left behind by
    /// one that never got armed.
    ///
    /// A resumed install that fails its final checks is rolled back here too. The
    /// failure is only logged once the previous firmware is back in slot 0.
    pub fn resume_swap(&mut self) -> Result<Option<SwapKind>, Error> {
        let Some(trailer) = self.trailer() else {
            return Ok(None);
        };

        if !self.swap_armed()? {
            if !self.region_erased(trailer.region)? {
                #[cfg(feature = "log")]
                log::warn!("clearing stale swap trailer");
                self.erase_trailer()?;
            }
            return Ok(None);
        }

        let chunks = self.read_count(&trailer)?;
        let kind = self.swap_kind(&trailer)?;

        #[cfg(feature = "log")]
        log::warn!("resuming interrupted {:?} swap of {} chunks", kind, chunks);

        self.run_swap(kind, chunks)?;
        if kind == SwapKind::Rollback {
            self.finish_rollback()?;
            return Ok(Some(kind));
        }

        let header = FwRawHeader::decode(&self.read_raw_header(trailer.region.start)?)?;
        match self.complete_swap(kind, &header) {
            Ok(()) => Ok(Some(kind)),
            Err(e) => {
                if self.swap_armed()? {
                    return Err(e);
                }
                #[cfg(feature = "log")]
                log::warn!(
                    "resumed install of v{} failed ({}), previous firmware restored",
                    header.fw_version,
                    e
                );
                Ok(Some(SwapKind::Rollback))
            }
        }
    }

    fn region_erased(&mut self, region: Region) -> Result<bool, Error> {
        let mut window = [0_u8; VERIFY_WINDOW];
        let mut offset = 0;
        while offset < region.len as usize {
            let n = (region.len as usize - offset).min(VERIFY_WINDOW);
            self.flash.read(region.start + offset as u32, &mut window[..n])?;
            if !util::is_erased(&window[..n]) {
                return Ok(false);
            }
            offset += n;
        }
        Ok(true)
    }

    pub(crate) fn erase_trailer(&mut self) -> Result<(), Error> {
        let (_, _, trailer) = self.swap_layout()?;
        self.flash
            .erase(trailer.region.start, trailer.region.len as usize, &mut self.watchdog)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Scheme;
    use crate::slot::{SlotId, SlotState};
    use crate::testing::*;
    use crate::BootOutcome;

    fn filled(a: u8, b: u8) -> TestImg {
        let mut img = blank(dual_config(Scheme::AesGcm));
        let slot0 = img.config().slot0;
        let download = img.config().download_slot();
        img.flash.write(slot0.start, &vec![a; slot0.len as usize]).unwrap();
        img.flash
            .write(download.start, &vec![b; download.len as usize])
            .unwrap();
        img
    }

    fn slot_bytes(img: &TestImg, slot: Region) -> Vec<u8> {
        img.flash().device().as_bytes()[slot.start as usize..slot.end() as usize].to_vec()
    }

    /// v1 active, v2 swapped in under a recorded header that does not match it.
    fn failing_install() -> (TestImg, FwRawHeader) {
        let mut img = installed(dual_config(Scheme::AesGcm), 1, &firmware(1200, 1));
        let header = img
            .download_image(&pack(Scheme::AesGcm, 2, &firmware(1200, 2), None))
            .unwrap();
        let mut recorded = header.clone();
        recorded.fw_tag[0] ^= 1;
        img.swap_slots(&recorded.encode()).unwrap();
        (img, recorded)
    }

    #[test]
    fn trailer_layout() {
        let trailer = Trailer {
            region: Region::new(9216, 1024),
            write_unit: 8,
            slot_chunks: 8,
        };
        assert_eq!(trailer.count(), 9216 + 192);
        assert_eq!(trailer.armed(), 9216 + 200);
        assert_eq!(trailer.rollback(), 9216 + 208);
        assert_eq!(trailer.marker(SwapKind::Install, 0, 0), 9216 + 216);
        assert_eq!(trailer.marker(SwapKind::Install, 1, 2), 9216 + 216 + 5 * 8);
        assert_eq!(trailer.marker(SwapKind::Rollback, 0, 0), 9216 + 216 + 24 * 8);
        assert!(
            trailer.marker(SwapKind::Rollback, 7, 2) + 8
                <= 9216 + crate::config::trailer_len(8, 8) as u32
        );
    }

    #[test]
    fn swap_exchanges_slots() {
        let mut img = filled(0x11, 0x22);
        img.swap_slots(&[0xAB; HEADER_LEN]).unwrap();

        let slot0 = img.config().slot0;
        let download = img.config().download_slot();
        assert!(slot_bytes(&img, slot0).iter().all(|b| *b == 0x22));
        assert!(slot_bytes(&img, download).iter().all(|b| *b == 0x11));
        assert_eq!(
            img.swap_status(),
            Ok(Some(SwapStatus {
                kind: SwapKind::Install,
                chunks: 8,
                swapped: 8
            }))
        );
        assert_eq!(img.slot_state(SlotId::Active), Ok(SlotState::Swapping));
    }

    #[test]
    fn interrupted_swap_resumes_at_any_point() {
        let mut cut = 0;
        loop {
            let img = filled(0x11, 0x22);
            let config = img.config().clone();
            let mut device = img.into_flash();
            device.cut_power_after(cut);

            let mut img = fwimg(device, config);
            let result = img.swap_slots(&[0xCD; HEADER_LEN]);
            let powered = img.flash().device().is_powered();

            let mut img = reboot(img);
            let slot0 = img.config().slot0;
            let download = img.config().download_slot();
            match img.swap_status().unwrap() {
                Some(status) => {
                    assert_eq!(status.kind, SwapKind::Install);
                    img.run_swap(status.kind, status.chunks).unwrap();
                    assert!(slot_bytes(&img, slot0).iter().all(|b| *b == 0x22), "cut at {}", cut);
                    assert!(slot_bytes(&img, download).iter().all(|b| *b == 0x11), "cut at {}", cut);
                }
                None => assert!(slot_bytes(&img, slot0).iter().all(|b| *b == 0x11), "cut at {}", cut),
            }

            if powered {
                assert_eq!(result, Ok(()));
                break;
            }
            cut += 1;
        }
        assert!(cut > 8 * 6);
    }

    #[test]
    fn stale_trailer_is_cleared() {
        let mut img = blank(dual_config(Scheme::AesGcm));
        let (_, _, trailer) = img.swap_layout().unwrap();
        img.flash.write(trailer.region.start + 512, &[0x42; 8]).unwrap();

        assert_eq!(img.resume_swap(), Ok(None));
        assert!(img.region_erased(trailer.region).unwrap());
    }

    #[test]
    fn corrupt_markers_are_refused() {
        let mut img = filled(0x11, 0x22);
        img.swap_slots(&[0xAB; HEADER_LEN]).unwrap();
        let (_, _, trailer) = img.swap_layout().unwrap();

        img.erase_trailer().unwrap();
        img.flash.write(trailer.armed(), &[0; 8]).unwrap();
        img.flash
            .write(trailer.count(), &[1, 0, 0, 0, 0xFF, 0xFF, 0xFF, 0xFF])
            .unwrap();
        // second stage marked without the first
        img.flash
            .write(trailer.marker(SwapKind::Install, 0, 1), &[0; 8])
            .unwrap();
        assert_eq!(img.chunk_state(SwapKind::Install, 0), Err(Error::TrailerCorrupt));

        img.flash
            .write(trailer.marker(SwapKind::Install, 1, 0), &[0x0F; 8])
            .unwrap();
        assert_eq!(img.chunk_state(SwapKind::Install, 1), Err(Error::TrailerCorrupt));
        assert_eq!(img.chunk_state(SwapKind::Rollback, 0), Ok(ChunkState::NotSwapped));

        // more chunks than a slot holds
        img.erase_trailer().unwrap();
        img.flash.write(trailer.armed(), &[0; 8]).unwrap();
        img.flash
            .write(trailer.count(), &[0, 1, 0, 0, 0xFF, 0xFF, 0xFF, 0xFF])
            .unwrap();
        assert_eq!(img.resume_swap(), Err(Error::TrailerCorrupt));
    }

    #[test]
    fn download_refused_during_swap() {
        let mut img = filled(0x11, 0x22);
        img.swap_slots(&[0xAB; HEADER_LEN]).unwrap();
        let image = pack(Scheme::AesGcm, 1, &firmware(64, 0), None);
        assert_eq!(img.download_image(&image), Err(Error::SwapInProgress));
    }

    #[test]
    fn failed_final_check_swaps_back() {
        let (mut img, recorded) = failing_install();
        assert_eq!(
            img.complete_swap(SwapKind::Install, &recorded),
            Err(Error::HeaderAuthFailed)
        );

        assert_eq!(img.swap_armed(), Ok(false));
        assert_eq!(img.slot_state(SlotId::Download), Ok(SlotState::Empty));
        assert_eq!(img.boot(), Ok(BootOutcome::Launch { version: 1 }));
        assert_eq!(slot0_image(&img, 1200), firmware(1200, 1));
    }

    #[test]
    fn rollback_survives_power_cut_at_any_point() {
        let mut cut = 0;
        loop {
            let (img, recorded) = failing_install();
            let config = img.config().clone();
            let mut device = img.into_flash();
            device.cut_power_after(cut);

            let mut img = fwimg(device, config);
            let result = img.complete_swap(SwapKind::Install, &recorded);
            let powered = img.flash().device().is_powered();

            let mut img = reboot(img);
            assert_eq!(img.boot(), Ok(BootOutcome::Launch { version: 1 }), "cut at {}", cut);
            assert_eq!(slot0_image(&img, 1200), firmware(1200, 1), "cut at {}", cut);
            assert_eq!(img.swap_armed(), Ok(false));
            assert_eq!(img.slot_state(SlotId::Download), Ok(SlotState::Empty));

            if powered {
                assert_eq!(result, Err(Error::HeaderAuthFailed));
                break;
            }
            cut += 1;
        }
        // rollback marker, three stages per chunk, then the erases
        assert!(cut > 1 + 3 * 3);
    }

    #[test]
    fn resumed_install_that_fails_restores_previous_firmware() {
        let (img, _) = failing_install();
        let mut img = reboot(img);

        assert_eq!(img.resume_swap(), Ok(Some(SwapKind::Rollback)));
        assert_eq!(img.swap_armed(), Ok(false));
        assert_eq!(img.slot_state(SlotId::Download), Ok(SlotState::Empty));
        assert_eq!(img.boot(), Ok(BootOutcome::Launch { version: 1 }));
    }

    #[test]
    fn boot_rolls_back_an_interrupted_failing_install() {
        let (img, _) = failing_install();
        let mut img = reboot(img);
        assert_eq!(img.boot(), Ok(BootOutcome::Launch { version: 1 }));
        assert_eq!(slot0_image(&img, 1200), firmware(1200, 1));
    }
}
