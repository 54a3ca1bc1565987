//! # Secure firmware image install and verification engine.
//!
//! This library authenticates, decrypts, swaps and atomically installs firmware
//! images in NOR flash. It is built for bootloaders that have to survive power loss
//! at any point, double-bit ECC read faults and tampered images.
//!
//! A firmware image is a [`header::FwRawHeader`] followed by its payload. The header
//! carries the version, sizes, tags and a MAC or signature over itself. Once an image
//! has been fully installed and verified, three copies of a pattern derived from the
//! header MAC are written right after the header. That VALID marker is the single
//! commit point: nothing without it is ever launched.
//!
//! Two install profiles are supported:
//!
//! * single slot, where the candidate is decrypted in place inside slot 0;
//! * dual slot, where the candidate is staged in a download slot and swapped into
//!   slot 0 chunk by chunk. Progress is recorded in a trailer so an interrupted swap
//!   resumes on the next boot.
//!
//! ```no_run
//! use fwimg::flash::{mem::MemFlash, FlashAccess};
//! use fwimg::{config::Config, kms::Kms, watchdog::NoWatchdog, BootOutcome, FwImg};
//!
//! # fn main() -> Result<(), fwimg::Error> {
//! let config = Config::default();
//! let device = MemFlash::<8, 2048>::new(config.required_capacity());
//! let ecc = device.ecc_counter();
//! let flash = FlashAccess::new(device, config.flash_base, ecc);
//!
//! // provision keys into the KMS before booting
//! let kms = Kms::new();
//! let mut fwimg = FwImg::new(flash, kms, NoWatchdog, config)?;
//!
//! match fwimg.boot()? {
//!     BootOutcome::Launch { version } => println!("launching firmware v{}", version),
//!     BootOutcome::NoValidFirmware => println!("waiting for a download"),
//! }
//! # Ok(())
//! # }
//! ```
use embedded_storage::nor_flash::NorFlash;

pub mod config;
pub mod constants;
pub mod crypto;
pub mod flash;
pub mod header;
pub mod install;
pub mod kms;
pub mod pack;
pub mod slot;
pub mod swap;
pub mod util;
pub mod verify;
pub mod version;
pub mod watchdog;

use config::{Config, Profile};
use constants::*;
use crypto::{Scheme, SecureEngine};
use flash::FlashAccess;
use header::FwRawHeader;
use kms::Kms;
use watchdog::Watchdog;

/// What the boot sequence decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootOutcome {
    /// Slot 0 holds a validated, authenticated firmware.
    Launch { version: u16 },
    /// Nothing bootable; the caller should wait for a download.
    NoValidFirmware,
}

/// Firmware image engine bound to a flash device.
///
/// Owns everything that would otherwise be process-wide state: the crypto service
/// and its session table, the double-ECC fault counter and the cached metadata of
/// the active image. The cached values are only trusted after
/// [`FwImg::check_slot0_fw_valid`] succeeded in the current boot.
pub struct FwImg<F, W> {
    flash: FlashAccess<F>,
    watchdog: W,
    engine: SecureEngine,
    config: Config,
    fw_header_validated: Option<FwRawHeader>,
    fw_tag_validated: Option<[u8; TAG_LEN]>,
    download: Option<FwRawHeader>,
}

impl<F: NorFlash, W: Watchdog> FwImg<F, W> {
    /// Validates the configuration against the flash geometry and resets the
    /// session table.
    pub fn new(flash: FlashAccess<F>, kms: Kms, watchdog: W, config: Config) -> Result<Self, Error> {
        if flash.base() != config.flash_base {
            return Err(Error::Config(config::Error::Invalid(
                "flash base does not match the configuration",
            )));
        }
        config.validate(flash.write_unit(), flash.page_size(), flash.capacity())?;

        let mut engine = SecureEngine::new(kms, config.scheme);
        engine.reset();

        #[cfg(feature = "log")]
        log::debug!(
            "fwimg: write unit {} page {} chunk {} profile {:?}",
            flash.write_unit(),
            flash.page_size(),
            config.chunk_size,
            config.profile
        );

        Ok(Self {
            flash,
            watchdog,
            engine,
            config,
            fw_header_validated: None,
            fw_tag_validated: None,
            download: None,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn scheme(&self) -> Scheme {
        self.config.scheme
    }

    pub fn flash(&self) -> &FlashAccess<F> {
        &self.flash
    }

    pub fn engine(&self) -> &SecureEngine {
        &self.engine
    }

    pub fn watchdog(&self) -> &W {
        &self.watchdog
    }

    /// Header of the active image, once validated in this boot.
    pub fn fw_header_validated(&self) -> Option<&FwRawHeader> {
        self.fw_header_validated.as_ref()
    }

    /// Releases the flash device.
    pub fn into_flash(self) -> F {
        self.flash.into_inner()
    }

    /// Runs the boot sequence.
    ///
    /// Resumes an interrupted swap, installs a pending candidate and then checks the
    /// active image twice: once through its VALID marker and header MAC, once by
    /// recomputing its tag. A failed install leaves the current firmware in place and
    /// is only logged. Authentication failures of the active image are returned as
    /// errors; the caller must not launch anything then. The version of an image that
    /// passes is recorded as the new anti-rollback floor.
    pub fn boot(&mut self) -> Result<BootOutcome, Error> {
        self.engine.reset();
        self.fw_header_validated = None;
        self.fw_tag_validated = None;
        self.download = None;

        if let Some(_kind) = self.resume_swap()? {
            #[cfg(feature = "log")]
            log::info!("boot: completed interrupted {:?} swap", _kind);
        }

        match self.install_new_version() {
            Ok(_version) => {
                #[cfg(feature = "log")]
                log::info!("boot: installed firmware v{}", _version);
            }
            Err(Error::NothingToInstall) => {}
            Err(_e) => {
                #[cfg(feature = "log")]
                log::warn!("boot: install failed ({}), staying on current firmware", _e);
            }
        }

        let header = match self.check_slot0_fw_valid() {
            Ok(header) => header,
            Err(e) if e.kind() == ErrorKind::Structural => {
                #[cfg(feature = "log")]
                log::warn!("boot: no valid firmware in slot 0 ({})", e);
                return Ok(BootOutcome::NoValidFirmware);
            }
            Err(e) => return Err(e),
        };

        self.verify_active_img_metadata()?;
        self.verify_slot(self.config.slot0, header.fw_size)?;
        self.control_active_img_tag()?;
        self.raise_version_floor(header.fw_version)?;

        Ok(BootOutcome::Launch {
            version: header.fw_version,
        })
    }

    fn dual_slot(&self) -> Option<(config::Region, config::Region, config::Region)> {
        match self.config.profile {
            Profile::SingleSlot => None,
            Profile::DualSlot {
                download,
                swap,
                trailer,
            } => Some((download, swap, trailer)),
        }
    }

    fn read_header_area(&mut self, addr: u32) -> Result<[u8; HEADER_AREA_LEN], Error> {
        let mut area = [0_u8; HEADER_AREA_LEN];
        self.flash.read(addr, &mut area)?;
        Ok(area)
    }

    fn read_raw_header(&mut self, addr: u32) -> Result<[u8; HEADER_LEN], Error> {
        let mut raw = [0_u8; HEADER_LEN];
        self.flash.read(addr, &mut raw)?;
        Ok(raw)
    }
}

/// Error kinds, following how a failure is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed or absent metadata, detected before any cryptographic work.
    Structural,
    /// Tag, MAC or signature mismatch, or code found beyond the image end.
    Authentication,
    /// Read, write or erase failure, including double-bit ECC errors.
    FlashIo,
    /// Candidate older than the active image or the minimum version.
    AntiRollback,
    /// No free KMS session.
    ResourceExhaustion,
    /// Invalid layout or key provisioning.
    Configuration,
}

/// Firmware image error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    Config(config::Error),
    Header(header::Error),
    Flash(flash::Error),
    Kms(kms::Error),
    HeaderAuthFailed,
    TagMismatch,
    SignatureInvalid,
    Rollback {
        current: Option<u16>,
        candidate: u16,
        min_version: u16,
    },
    SizeMismatch {
        declared: usize,
        actual: usize,
    },
    ImageTooLarge {
        size: usize,
        capacity: usize,
    },
    Scatter(usize),
    NotValidated,
    NoActiveImage,
    NothingToInstall,
    NoDownload,
    MaliciousCode {
        addr: u32,
    },
    ValidAreaCorrupt {
        addr: u32,
    },
    TrailerCorrupt,
    SwapInProgress,
    Unsupported(&'static str),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Config(_) | Error::Unsupported(_) => ErrorKind::Configuration,
            Error::Flash(_) => ErrorKind::FlashIo,
            Error::Kms(kms::Error::SessionCount) => ErrorKind::ResourceExhaustion,
            Error::Kms(kms::Error::SignatureInvalid) => ErrorKind::Authentication,
            Error::Kms(_) => ErrorKind::Configuration,
            Error::HeaderAuthFailed
            | Error::TagMismatch
            | Error::SignatureInvalid
            | Error::MaliciousCode { .. } => ErrorKind::Authentication,
            Error::Rollback { .. } => ErrorKind::AntiRollback,
            Error::Header(_)
            | Error::SizeMismatch { .. }
            | Error::ImageTooLarge { .. }
            | Error::Scatter(_)
            | Error::NotValidated
            | Error::NoActiveImage
            | Error::NothingToInstall
            | Error::NoDownload
            | Error::ValidAreaCorrupt { .. }
            | Error::TrailerCorrupt
            | Error::SwapInProgress => ErrorKind::Structural,
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        None
    }
}

impl From<config::Error> for Error {
    fn from(error: config::Error) -> Self {
        Self::Config(error)
    }
}

impl From<header::Error> for Error {
    fn from(error: header::Error) -> Self {
        Self::Header(error)
    }
}

impl From<flash::Error> for Error {
    fn from(error: flash::Error) -> Self {
        Self::Flash(error)
    }
}

impl From<kms::Error> for Error {
    fn from(error: kms::Error) -> Self {
        Self::Kms(error)
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::slot::{SlotId, SlotState};

    #[test]
    fn blank_device_has_nothing_to_launch() {
        let mut img = blank(dual_config(Scheme::AesGcm));
        assert_eq!(img.boot(), Ok(BootOutcome::NoValidFirmware));
        assert_eq!(img.engine().kms().open_sessions(), 0);
    }

    #[test]
    fn config_must_match_device() {
        let config = dual_config(Scheme::AesGcm);
        let device = TestFlash::new(1024);
        let ecc = device.ecc_counter();
        let flash = FlashAccess::new(device, 0, ecc);
        assert!(matches!(
            FwImg::new(flash, kms(), watchdog::NoWatchdog, config),
            Err(Error::Config(_))
        ));
    }

    // header{Magic="SFUM", FwSize=2048, FwVersion=3}, GCM encrypted payload
    #[test]
    fn gcm_install_then_rollback_attempt() {
        let fw = firmware(2048, 1);
        let mut img = blank(dual_config(Scheme::AesGcm));
        let image = pack(Scheme::AesGcm, 3, &fw, None);

        let raw: [u8; HEADER_LEN] = image[..HEADER_LEN].try_into().unwrap();
        let header = img.verify_fw_raw_header_tag(&raw).unwrap();
        assert_eq!(header.magic, *b"SFUM");
        assert_eq!(header.fw_size, 2048);
        assert_eq!(header.fw_version, 3);

        img.download_image(&image).unwrap();
        assert_eq!(img.install_new_version(), Ok(3));

        let area = img.read_header_area(img.config().slot0.start).unwrap();
        assert_eq!(header::check_header_validated(&area), Ok(()));
        assert_eq!(slot0_image(&img, 2048), fw);

        let older = pack(Scheme::AesGcm, 2, &firmware(2048, 9), None);
        assert_eq!(
            img.download_image(&older),
            Err(Error::Rollback {
                current: Some(3),
                candidate: 2,
                min_version: 0
            })
        );

        let mut img = reboot(img);
        assert_eq!(img.boot(), Ok(BootOutcome::Launch { version: 3 }));
    }

    #[test]
    fn tampered_ciphertext_is_rejected_and_revoked() {
        let fw = firmware(2048, 1);
        let mut img = blank(single_config(Scheme::AesGcm));
        let mut image = pack(Scheme::AesGcm, 3, &fw, None);
        image[HEADER_LEN + 1000] ^= 0x01;

        img.download_image(&image).unwrap();
        assert_eq!(img.install_new_version(), Err(Error::TagMismatch));

        assert_eq!(img.slot_state(SlotId::Active), Ok(SlotState::Empty));
        let area = img.read_header_area(img.config().slot0.start).unwrap();
        assert!(header::check_header_validated(&area).is_err());
        assert_eq!(&area[..HEADER_LEN], &image[..HEADER_LEN]);
        assert!(util::is_zeroed(&slot0_image(&img, fw.len())));

        // the revoked header still blocks older candidates
        assert_eq!(img.active_version(), Ok(Some(3)));
        assert_eq!(img.boot(), Ok(BootOutcome::NoValidFirmware));
        assert!(matches!(
            img.download_image(&pack(Scheme::AesGcm, 2, &fw, None)),
            Err(Error::Rollback {
                current: Some(3),
                candidate: 2,
                ..
            })
        ));
    }

    #[test]
    fn every_scheme_installs_in_both_profiles() {
        for scheme in [Scheme::AesGcm, Scheme::AesCbcSha256Ecdsa, Scheme::Sha256Ecdsa] {
            for config in [dual_config(scheme), single_config(scheme)] {
                let fw = firmware(1500, 4);
                let img = installed(config, 1, &fw);
                // CBC pads the image to whole blocks
                assert_eq!(slot0_image(&img, 1500), fw);
            }
        }
    }

    #[test]
    fn dual_slot_upgrade_keeps_backup() {
        let mut img = installed(dual_config(Scheme::AesGcm), 1, &firmware(3000, 1));
        let fw2 = firmware(1000, 2);
        img.download_image(&pack(Scheme::AesGcm, 2, &fw2, None))
            .unwrap();
        assert_eq!(img.slot_state(SlotId::Download), Ok(SlotState::Written));

        assert_eq!(img.boot(), Ok(BootOutcome::Launch { version: 2 }));
        assert_eq!(slot0_image(&img, 1000), fw2);
        assert_eq!(img.slot_state(SlotId::Active), Ok(SlotState::Active));
        assert_eq!(img.slot_state(SlotId::Download), Ok(SlotState::Valid));

        // the old, longer image left nothing behind beyond the new image end
        let slot0 = img.config().slot0;
        let tail = (slot0.start + 320 + 1000) as usize..slot0.end() as usize;
        assert!(img.flash().device().as_bytes()[tail]
            .iter()
            .all(|b| *b == 0 || *b == 0xFF));
    }

    #[test]
    fn same_version_reinstall_is_allowed() {
        let mut img = installed(dual_config(Scheme::AesGcm), 5, &firmware(800, 1));
        img.download_image(&pack(Scheme::AesGcm, 5, &firmware(900, 2), None))
            .unwrap();
        assert_eq!(img.boot(), Ok(BootOutcome::Launch { version: 5 }));
        assert_eq!(slot0_image(&img, 900), firmware(900, 2));
    }

    #[test]
    fn minimum_version_is_enforced() {
        let mut config = dual_config(Scheme::AesGcm);
        config.min_version = 4;
        let mut img = blank(config);
        assert!(matches!(
            img.download_image(&pack(Scheme::AesGcm, 3, &firmware(100, 0), None)),
            Err(Error::Rollback { current: None, .. })
        ));
        // rejected before any flash mutation
        assert!(util::is_erased(img.flash().device().as_bytes()));
    }

    #[test]
    fn tampered_active_image_halts_boot() {
        let img = installed(dual_config(Scheme::AesGcm), 1, &firmware(1024, 1));
        let config = img.config().clone();
        let mut device = img.into_flash();
        let at = (config.slot0.start + config.image_offset + 10) as usize;
        device.as_bytes_mut()[at] ^= 0x01;

        let mut img = fwimg(device, config);
        let err = img.boot().unwrap_err();
        assert_eq!(err, Error::TagMismatch);
        assert_eq!(err.kind(), ErrorKind::Authentication);
    }

    #[test]
    fn ecc_fault_in_active_image_is_reported() {
        let img = installed(dual_config(Scheme::AesGcm), 1, &firmware(1024, 1));
        let config = img.config().clone();
        let mut device = img.into_flash();
        let at = config.slot0.start + config.image_offset + 700;
        device.inject_ecc_fault(at..at + 1);

        let mut img = fwimg(device, config);
        let err = img.boot().unwrap_err();
        assert!(matches!(err, Error::Flash(flash::Error::DoubleEcc { .. })));
        assert_eq!(err.kind(), ErrorKind::FlashIo);
    }

    #[test]
    fn error_kinds() {
        assert_eq!(Error::Kms(kms::Error::SessionCount).kind(), ErrorKind::ResourceExhaustion);
        assert_eq!(
            Error::Rollback {
                current: Some(5),
                candidate: 4,
                min_version: 0
            }
            .kind(),
            ErrorKind::AntiRollback
        );
        assert_eq!(
            Error::Header(header::Error::BadMagic(*b"XXXX")).kind(),
            ErrorKind::Structural
        );
        assert_eq!(Error::TagMismatch.kind(), ErrorKind::Authentication);
    }
}
