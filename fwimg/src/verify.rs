//! Tag verification of stored and installed images.
//!
//! Payloads are never trusted to fit in RAM: tags are computed over flash in
//! `VERIFY_WINDOW` sized reads, refreshing the watchdog as they go. A payload may be
//! scattered over two flash spans, which is how a partial update is checked against
//! the prefix still sitting in the active slot.
use embedded_storage::nor_flash::NorFlash;

use crate::constants::*;
use crate::crypto::{Domain, Operation, Tag};
use crate::header::{self, FwRawHeader, Payload};
use crate::watchdog::Watchdog;
use crate::{Error, FwImg};

/// Compares two buffers in time independent of their contents.
///
/// Buffers of different length never match.
pub fn memory_compare(a: &[u8], b: &[u8]) -> bool {
    compare_with(a, b, |_| {})
}

fn compare_with(a: &[u8], b: &[u8], mut visit: impl FnMut(usize)) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut diff = 0_u8;
    for (i, (x, y)) in a.iter().zip(b).enumerate() {
        visit(i);
        diff |= x ^ y;
    }

    std::hint::black_box(diff) == 0
}

/// A run of flash bytes belonging to one payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub addr: u32,
    pub len: usize,
}

impl Span {
    pub fn new(addr: u32, len: usize) -> Self {
        Self { addr, len }
    }
}

impl<F: NorFlash, W: Watchdog> FwImg<F, W> {
    /// Parses a raw header, checks its structure and authenticates it.
    pub fn verify_fw_raw_header_tag(&mut self, raw: &[u8; HEADER_LEN]) -> Result<FwRawHeader, Error> {
        let header = header::parse_fw_info(raw)?;
        header.check_structure()?;

        if let Err(e) = self.engine.verify_header(raw) {
            #[cfg(feature = "log")]
            log::warn!("header authentication failed for v{}", header.fw_version);
            return Err(e);
        }

        Ok(header)
    }

    /// Verifies the tag of a payload stored contiguously at `addr`.
    pub fn verify_tag(
        &mut self,
        header: &FwRawHeader,
        payload: Payload,
        addr: u32,
        domain: Domain,
    ) -> Result<(), Error> {
        let span = Span::new(addr, header.payload_size(payload));
        self.verify_tag_scatter(header, payload, &[span], domain)
    }

    /// Verifies the tag of a payload spread over up to two flash spans.
    ///
    /// The spans must add up exactly to the size the header declares for `payload`,
    /// and exactly that many bytes are fed to the tag computation.
    pub fn verify_tag_scatter(
        &mut self,
        header: &FwRawHeader,
        payload: Payload,
        spans: &[Span],
        domain: Domain,
    ) -> Result<(), Error> {
        let tag = self.compute_tag(header, payload, spans, domain)?;
        let expected = header.payload_tag(payload, self.engine.scheme().tag_len());

        if !memory_compare(tag.as_slice(), expected) {
            #[cfg(feature = "log")]
            log::warn!("{:?} {:?} tag mismatch for v{}", domain, payload, header.fw_version);
            return Err(Error::TagMismatch);
        }

        Ok(())
    }

    fn compute_tag(
        &mut self,
        header: &FwRawHeader,
        payload: Payload,
        spans: &[Span],
        domain: Domain,
    ) -> Result<Tag, Error> {
        if spans.is_empty() || spans.len() > MAX_SCATTER {
            return Err(Error::Scatter(spans.len()));
        }

        let declared = header.payload_size(payload);
        let total: usize = spans.iter().map(|span| span.len).sum();
        if total != declared {
            return Err(Error::SizeMismatch {
                declared,
                actual: total,
            });
        }

        let mut op = self.engine.authenticate_fw_init(header, payload, domain)?;
        if let Err(e) = self.feed_spans(&mut op, spans, declared) {
            self.engine.abort(op);
            return Err(e);
        }
        self.engine.authenticate_fw_finish(op)
    }

    fn feed_spans(&mut self, op: &mut Operation, spans: &[Span], declared: usize) -> Result<(), Error> {
        let mut window = [0_u8; VERIFY_WINDOW];
        let mut processed = 0;

        for span in spans {
            let mut addr = span.addr;
            let mut left = span.len;
            while left > 0 {
                let n = left.min(VERIFY_WINDOW);
                self.flash.read(addr, &mut window[..n])?;
                self.engine.authenticate_fw_append(op, &window[..n])?;
                self.watchdog.refresh();

                addr += n as u32;
                left -= n;
                processed += n;
            }
        }

        if processed != declared {
            return Err(Error::SizeMismatch {
                declared,
                actual: processed,
            });
        }
        Ok(())
    }

    /// Checks that slot 0 carries a validated, authentic header and caches it.
    ///
    /// Fails with [`header::Error::NotValidated`] when the VALID marker is missing or
    /// damaged, before any cryptographic work.
    pub fn check_slot0_fw_valid(&mut self) -> Result<FwRawHeader, Error> {
        self.fw_header_validated = None;
        self.fw_tag_validated = None;

        let area = self.read_header_area(self.config.slot0.start)?;
        header::check_header_validated(&area)?;

        let mut raw = [0_u8; HEADER_LEN];
        raw.copy_from_slice(&area[..HEADER_LEN]);
        let header = self.verify_fw_raw_header_tag(&raw)?;

        self.fw_header_validated = Some(header.clone());
        Ok(header)
    }

    /// Re-reads the active header and checks it still equals the one validated
    /// earlier in this boot, then caches its firmware tag.
    pub fn verify_active_img_metadata(&mut self) -> Result<(), Error> {
        let header = self
            .fw_header_validated
            .clone()
            .ok_or(Error::NotValidated)?;

        let area = self.read_header_area(self.config.slot0.start)?;
        if !memory_compare(&area[..HEADER_LEN], &header.encode()) {
            #[cfg(feature = "log")]
            log::error!("active header changed since it was validated");
            return Err(Error::HeaderAuthFailed);
        }
        header::check_header_validated(&area)?;

        self.fw_tag_validated = Some(header.fw_tag);
        Ok(())
    }

    /// Recomputes the tag of the installed image and compares it with the cached one.
    pub fn control_active_img_tag(&mut self) -> Result<(), Error> {
        let header = self
            .fw_header_validated
            .clone()
            .ok_or(Error::NotValidated)?;
        let expected = self.fw_tag_validated.ok_or(Error::NotValidated)?;

        let span = Span::new(
            self.config.slot0.start + self.config.image_offset,
            header.fw_size as usize,
        );
        let tag = self.compute_tag(&header, Payload::Full, &[span], Domain::Clear)?;

        let tag_len = self.engine.scheme().tag_len();
        if !memory_compare(tag.as_slice(), &expected[..tag_len]) {
            #[cfg(feature = "log")]
            log::error!("active image does not match its tag");
            return Err(Error::TagMismatch);
        }
        Ok(())
    }
}
