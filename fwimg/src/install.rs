//! Candidate download and installation.
//!
//! Decryption runs in place, one flash page at a time: the page is read into a
//! shadow buffer, its payload part is decrypted chunk by chunk into the shadow, and
//! the page is erased and rewritten. Nothing is validated until the clear image has
//! passed its tag check and the slot scan; the VALID marker is always written last.
use embedded_storage::nor_flash::NorFlash;

use crate::config::{Profile, Region};
use crate::constants::*;
use crate::crypto::{Domain, Operation};
use crate::header::{self, FwRawHeader, Payload};
use crate::slot::{check_fw_version, SlotId, SlotState};
use crate::swap::SwapKind;
use crate::util;
use crate::verify::{memory_compare, Span};
use crate::watchdog::Watchdog;
use crate::{Error, ErrorKind, FwImg};

impl<F: NorFlash, W: Watchdog> FwImg<F, W> {
    /// Offset of the stored payload from the start of the download slot.
    ///
    /// A partial image is stored at the residue of its offset modulo the swap region
    /// size, so that reassembling it is a whole-page move.
    pub fn payload_offset(&self, header: &FwRawHeader) -> u32 {
        self.payload_offset_of(header, header.payload())
    }

    fn payload_offset_of(&self, header: &FwRawHeader, payload: Payload) -> u32 {
        match (payload, self.config.profile) {
            (Payload::Partial, Profile::DualSlot { swap, .. }) => {
                self.config.image_offset + header.partial_fw_offset % swap.len
            }
            _ => self.config.image_offset,
        }
    }

    /// Rejects headers whose sizes do not fit this layout and scheme.
    fn check_geometry(&self, header: &FwRawHeader) -> Result<(), Error> {
        let slot_len = self.config.slot0.len as usize;
        let fw_size = header.fw_size as usize;
        let capacity = slot_len - self.config.image_offset as usize;

        if fw_size == 0 {
            return Err(Error::Unsupported("empty firmware image"));
        }
        if fw_size > capacity {
            return Err(Error::ImageTooLarge {
                size: fw_size,
                capacity,
            });
        }
        if fw_size % self.engine.scheme().block_len() != 0 {
            return Err(Error::Unsupported("payload is not a whole number of cipher blocks"));
        }

        if header.is_partial() {
            if self.config.profile == Profile::SingleSlot {
                return Err(Error::Unsupported("partial images need the dual slot profile"));
            }

            let offset = header.partial_fw_offset as usize;
            let size = header.partial_fw_size as usize;
            if size == 0 || offset.checked_add(size) != Some(fw_size) {
                return Err(Error::SizeMismatch {
                    declared: fw_size,
                    actual: offset.saturating_add(size),
                });
            }
            if offset % AES_BLOCK_LEN != 0 || offset % self.flash.write_unit() != 0 {
                return Err(Error::Unsupported("partial offset is not block aligned"));
            }

            let at = self.payload_offset(header) as usize;
            if at + size > slot_len {
                return Err(Error::ImageTooLarge {
                    size,
                    capacity: slot_len - at,
                });
            }
        }

        Ok(())
    }

    /// Authenticates a candidate header and prepares the download slot for it.
    ///
    /// Anti-rollback is enforced here, before anything is erased, against the
    /// recorded version floor and the image currently in slot 0. That image's
    /// version is recorded before its slot can be erased.
    pub fn begin_download(&mut self, raw: &[u8; HEADER_LEN]) -> Result<FwRawHeader, Error> {
        if self.swap_armed()? {
            return Err(Error::SwapInProgress);
        }

        let header = self.verify_fw_raw_header_tag(raw)?;
        self.check_geometry(&header)?;

        let current = self.rollback_floor()?;
        check_fw_version(current, header.fw_version, self.config.min_version)?;
        if let Some(version) = current {
            self.raise_version_floor(version)?;
        }

        if self.config.profile == Profile::SingleSlot {
            self.fw_header_validated = None;
            self.fw_tag_validated = None;
        }

        let slot = self.config.download_slot();
        self.erase_downloaded_img()?;
        self.flash.write(slot.start, raw)?;
        self.download = Some(header.clone());

        #[cfg(feature = "log")]
        log::info!(
            "receiving v{} ({} payload bytes) at {:#010x}",
            header.fw_version,
            header.payload_size(header.payload()),
            slot.start
        );

        Ok(header)
    }

    /// Stores a piece of the payload announced by [`FwImg::begin_download`].
    ///
    /// `offset` is relative to the payload start and must be write unit aligned. A
    /// trailing partial unit is padded with the erase pattern.
    pub fn write_download(&mut self, offset: u32, data: &[u8]) -> Result<(), Error> {
        let header = self.download.clone().ok_or(Error::NoDownload)?;
        let size = header.payload_size(header.payload());
        let wu = self.flash.write_unit();

        let end = offset as usize + data.len();
        if end > size {
            return Err(Error::ImageTooLarge {
                size: end,
                capacity: size,
            });
        }

        let addr = self.config.download_slot().start + self.payload_offset(&header) + offset;
        if offset as usize % wu != 0 {
            return Err(Error::Flash(crate::flash::Error::Misaligned {
                addr,
                len: data.len(),
            }));
        }

        if data.len() % wu == 0 {
            self.flash.write(addr, data)?;
        } else {
            let mut padded = data.to_vec();
            padded.resize(util::align_up(data.len(), wu), ERASED_BYTE);
            self.flash.write(addr, &padded)?;
        }
        Ok(())
    }

    /// Stores a complete packed image: header followed by its payload.
    pub fn download_image(&mut self, image: &[u8]) -> Result<FwRawHeader, Error> {
        let raw: [u8; HEADER_LEN] = image
            .get(..HEADER_LEN)
            .and_then(|raw| raw.try_into().ok())
            .ok_or(Error::Header(header::Error::Length(image.len())))?;

        let payload = &image[HEADER_LEN..];
        let header = self.begin_download(&raw)?;
        let declared = header.payload_size(header.payload());
        if payload.len() != declared {
            return Err(Error::SizeMismatch {
                declared,
                actual: payload.len(),
            });
        }

        for (i, piece) in payload.chunks(VERIFY_WINDOW).enumerate() {
            self.write_download((i * VERIFY_WINDOW) as u32, piece)?;
        }
        Ok(header)
    }

    /// Decrypts a stored payload in place inside `slot`.
    ///
    /// With an authenticated cipher the payload tag is checked once the last chunk
    /// went through; the caller still has to verify the clear image afterwards.
    pub fn decrypt_image_in_slot(
        &mut self,
        slot: Region,
        header: &FwRawHeader,
        payload: Payload,
    ) -> Result<(), Error> {
        if !self.engine.scheme().is_encrypted() {
            return Ok(());
        }

        let start = slot.start + self.payload_offset_of(header, payload);
        let end = start + header.payload_size(payload) as u32;

        let mut op = self.engine.decrypt_init(header, payload)?;
        if let Err(e) = self.decrypt_pages(&mut op, start, end) {
            self.engine.abort(op);
            return Err(e);
        }

        let tag_len = self.engine.scheme().tag_len();
        self.engine
            .decrypt_finish(op, header.payload_tag(payload, tag_len))?;

        #[cfg(feature = "log")]
        log::debug!("decrypted {:?} payload of v{}", payload, header.fw_version);
        Ok(())
    }

    fn decrypt_pages(&mut self, op: &mut Operation, start: u32, end: u32) -> Result<(), Error> {
        let page = self.flash.page_size();
        let chunk = self.config.chunk_size;
        let mut shadow = vec![0_u8; page];
        let mut scratch = vec![0_u8; chunk];

        let mut addr = start;
        while addr < end {
            let page_addr = self.flash.page_start(addr);
            let page_end = page_addr + page as u32;
            self.flash.read(page_addr, &mut shadow)?;

            while addr < end && addr < page_end {
                let n = chunk
                    .min((page_end - addr) as usize)
                    .min((end - addr) as usize);
                let at = (addr - page_addr) as usize;
                self.flash.read(addr, &mut scratch[..n])?;
                self.engine
                    .decrypt_append(op, &scratch[..n], &mut shadow[at..at + n])?;
                addr += n as u32;
            }

            self.flash.erase(page_addr, page, &mut self.watchdog)?;
            self.flash.write(page_addr, &shadow)?;
        }

        Ok(())
    }

    /// Installs the candidate waiting in the download slot, if any.
    ///
    /// Returns the installed version. [`Error::NothingToInstall`] means there was no
    /// candidate. A candidate whose header fails is erased. In the single slot
    /// profile, one failing later is revoked in place instead, so its header keeps
    /// counting against older candidates. One rejected by anti-rollback is left
    /// untouched.
    pub fn install_new_version(&mut self) -> Result<u16, Error> {
        match self.slot_state(SlotId::Download)? {
            SlotState::Written => {}
            SlotState::Swapping => return Err(Error::SwapInProgress),
            _ => return Err(Error::NothingToInstall),
        }

        let slot = self.config.download_slot();
        let raw = self.read_raw_header(slot.start)?;
        let header = match self
            .verify_fw_raw_header_tag(&raw)
            .and_then(|header| self.check_geometry(&header).map(|_| header))
        {
            Ok(header) => header,
            Err(e) => {
                if matches!(e.kind(), ErrorKind::Structural | ErrorKind::Authentication) {
                    self.discard_candidate();
                }
                return Err(e);
            }
        };

        // in the single slot profile the candidate itself sits in slot 0
        let current = match self.config.profile {
            Profile::SingleSlot => self.version_floor()?,
            Profile::DualSlot { .. } => self.rollback_floor()?,
        };
        check_fw_version(current, header.fw_version, self.config.min_version)?;

        #[cfg(feature = "log")]
        log::info!("installing v{} over {:?}", header.fw_version, current);

        self.download = None;
        match self.config.profile {
            Profile::SingleSlot => {
                if let Err(e) = self.install_single(&header) {
                    self.revoke_candidate();
                    return Err(e);
                }
            }
            Profile::DualSlot { .. } => self.install_dual(&header)?,
        }

        Ok(header.fw_version)
    }

    fn discard_candidate(&mut self) {
        if let Err(_e) = self.erase_downloaded_img() {
            #[cfg(feature = "log")]
            log::error!("could not erase rejected candidate: {}", _e);
        }
    }

    fn revoke_candidate(&mut self) {
        if let Err(_e) = self.invalidate_slot(self.config.slot0) {
            #[cfg(feature = "log")]
            log::error!("could not revoke rejected candidate: {}", _e);
        }
    }

    fn install_single(&mut self, header: &FwRawHeader) -> Result<(), Error> {
        let slot = self.config.slot0;
        self.stage_full(slot, header)?;
        self.write_header_validated(slot)
    }

    fn install_dual(&mut self, header: &FwRawHeader) -> Result<(), Error> {
        let download = self.config.download_slot();
        let staged = match header.payload() {
            Payload::Full => self.stage_full(download, header),
            Payload::Partial => self.stage_partial(download, header),
        };
        if let Err(e) = staged {
            #[cfg(feature = "log")]
            log::warn!("staging v{} failed: {}", header.fw_version, e);
            self.discard_candidate();
            return Err(e);
        }

        self.fw_header_validated = None;
        self.fw_tag_validated = None;
        self.swap_slots(&header.encode())?;
        self.complete_swap(SwapKind::Install, header)
    }

    /// Verifies a complete stored image in `slot`, decrypts it and verifies the result.
    fn stage_full(&mut self, slot: Region, header: &FwRawHeader) -> Result<(), Error> {
        let addr = slot.start + self.config.image_offset;
        self.verify_tag(header, Payload::Full, addr, Domain::Stored)?;

        if self.engine.scheme().is_encrypted() {
            self.decrypt_image_in_slot(slot, header, Payload::Full)?;
            self.verify_tag(header, Payload::Full, addr, Domain::Clear)?;
        }

        self.verify_slot(slot, header.fw_size)
    }

    /// Turns a stored partial image into a complete clear image in `slot`.
    ///
    /// The prefix comes from the validated image in slot 0. The result is checked
    /// against the full firmware tag twice: scattered over both slots before it is
    /// assembled, and contiguous afterwards.
    fn stage_partial(&mut self, slot: Region, header: &FwRawHeader) -> Result<(), Error> {
        let slot0 = self.config.slot0;
        let active = self.active_header()?;
        if active.fw_size < header.partial_fw_offset {
            return Err(Error::NoActiveImage);
        }

        let tail = slot.start + self.payload_offset_of(header, Payload::Partial);
        self.verify_tag(header, Payload::Partial, tail, Domain::Stored)?;
        self.decrypt_image_in_slot(slot, header, Payload::Partial)?;

        let spans = [
            Span::new(
                slot0.start + self.config.image_offset,
                header.partial_fw_offset as usize,
            ),
            Span::new(tail, header.partial_fw_size as usize),
        ];
        self.verify_tag_scatter(header, Payload::Full, &spans, Domain::Clear)?;

        self.assemble_partial(slot, header)?;
        self.verify_tag(
            header,
            Payload::Full,
            slot.start + self.config.image_offset,
            Domain::Clear,
        )?;
        self.verify_slot(slot, header.fw_size)
    }

    fn active_header(&mut self) -> Result<FwRawHeader, Error> {
        let area = self.read_header_area(self.config.slot0.start)?;
        if header::check_header_validated(&area).is_err() {
            return Err(Error::NoActiveImage);
        }

        let mut raw = [0_u8; HEADER_LEN];
        raw.copy_from_slice(&area[..HEADER_LEN]);
        self.verify_fw_raw_header_tag(&raw)
            .map_err(|_| Error::NoActiveImage)
    }

    /// Rebuilds `slot` page by page, highest page first, as the active prefix
    /// followed by the clear tail, which moves up by a whole number of pages.
    fn assemble_partial(&mut self, slot: Region, header: &FwRawHeader) -> Result<(), Error> {
        let page = self.flash.page_size();
        let slot0 = self.config.slot0;
        let offset = self.config.image_offset as usize;
        let prefix_end = offset + header.partial_fw_offset as usize;
        let image_end = offset + header.fw_size as usize;
        let shift = prefix_end - self.payload_offset_of(header, Payload::Partial) as usize;

        let mut shadow = vec![0_u8; page];
        let pages = util::align_up(image_end, page) / page;

        for index in (0..pages).rev() {
            let start = index * page;
            let end = start + page;
            let addr = slot.start + start as u32;
            self.flash.read(addr, &mut shadow)?;

            if let Some((from, to)) = overlap(start, end, offset, prefix_end) {
                self.flash
                    .read(slot0.start + from as u32, &mut shadow[from - start..to - start])?;
            }
            if let Some((from, to)) = overlap(start, end, prefix_end, image_end) {
                self.flash.read(
                    slot.start + (from - shift) as u32,
                    &mut shadow[from - start..to - start],
                )?;
            }
            if let Some((from, to)) = overlap(start, end, image_end, end) {
                shadow[from - start..to - start].fill(ERASED_BYTE);
            }

            self.flash.erase(addr, page, &mut self.watchdog)?;
            self.flash.write(addr, &shadow)?;
        }

        Ok(())
    }

    /// Completes an install once the candidate sits in slot 0: checks it against the
    /// header recorded for the swap, clears the rest of the slot, writes the VALID
    /// marker and drops the swap record.
    pub(crate) fn finish_install(&mut self, header: &FwRawHeader) -> Result<(), Error> {
        let slot0 = self.config.slot0;
        let raw = self.read_raw_header(slot0.start)?;
        if !memory_compare(&raw, &header.encode()) {
            return Err(Error::HeaderAuthFailed);
        }

        let offset = self.config.image_offset;
        self.verify_tag(header, Payload::Full, slot0.start + offset, Domain::Clear)?;
        self.clean_up_slot(slot0, (offset + header.fw_size) as usize)?;
        self.verify_slot(slot0, header.fw_size)?;
        self.write_header_validated(slot0)?;

        // keep the previous image only if it was a validated one
        let download = self.config.download_slot();
        let backup = self.read_header_area(download.start)?;
        if header::check_header_validated(&backup).is_err() {
            self.erase_downloaded_img()?;
        }
        self.erase_trailer()?;

        #[cfg(feature = "log")]
        log::info!("v{} installed", header.fw_version);
        Ok(())
    }
}

/// Intersection of `[start, end)` with `[from, to)`.
fn overlap(start: usize, end: usize, from: usize, to: usize) -> Option<(usize, usize)> {
    let from = from.max(start);
    let to = to.min(end);
    (from < to).then_some((from, to))
}
