//! Flash layout and install profile.
use crate::constants::*;
use crate::crypto::Scheme;
use crate::util;

/// A contiguous flash region at an absolute address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub start: u32,
    pub len: u32,
}

impl Region {
    pub const fn new(start: u32, len: u32) -> Self {
        Self { start, len }
    }

    pub fn end(&self) -> u32 {
        self.start + self.len
    }

    pub fn overlaps(&self, other: &Region) -> bool {
        self.start < other.end() && other.start < self.end()
    }
}

/// How a candidate image reaches the active slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Profile {
    /// The loader writes the candidate straight into slot 0, where it is decrypted in place.
    SingleSlot,
    /// The candidate lands in a download slot and is swapped into slot 0 through the
    /// swap region. Progress markers live in the trailer region.
    DualSlot {
        download: Region,
        swap: Region,
        trailer: Region,
    },
}

/// Board configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the flash device's offset 0 is mapped at.
    pub flash_base: u32,
    /// Active slot.
    pub slot0: Region,
    pub profile: Profile,
    pub scheme: Scheme,
    /// Installer chunk size; one page holds a whole number of chunks.
    pub chunk_size: usize,
    /// Offset of the firmware payload from the slot start.
    pub image_offset: u32,
    /// Lowest firmware version that may ever be installed.
    pub min_version: u16,
    /// Two equal banks of whole pages recording the highest version installed.
    pub version_record: Region,
}

impl Default for Config {
    /// Dual slot layout for a 2 KiB page part with 64 KiB slots.
    fn default() -> Self {
        Config::dual_slot(0x0800_0000, 2048, 0x1_0000, 0x2000)
    }
}

impl Config {
    /// Lays out slot 0 after one reserved page, followed by the download slot,
    /// the swap region, a trailer of whole pages and the two page version record.
    pub fn dual_slot(flash_base: u32, page_size: u32, slot_len: u32, swap_len: u32) -> Self {
        let slot0 = Region::new(flash_base + page_size, slot_len);
        let download = Region::new(slot0.end(), slot_len);
        let swap = Region::new(download.end(), swap_len);
        let chunks = (slot_len / swap_len.max(1)) as usize;
        let trailer_len = util::align_up(trailer_len(MAX_WRITE_UNIT, chunks), page_size as usize);
        let trailer = Region::new(swap.end(), trailer_len as u32);
        let version_record = Region::new(trailer.end(), 2 * page_size);

        Self {
            flash_base,
            slot0,
            profile: Profile::DualSlot {
                download,
                swap,
                trailer,
            },
            scheme: Scheme::AesGcm,
            chunk_size: 512_usize.min(page_size as usize),
            image_offset: 512,
            min_version: 0,
            version_record,
        }
    }

    /// Single slot layout: one reserved page, slot 0, then the two page version record.
    pub fn single_slot(flash_base: u32, page_size: u32, slot_len: u32) -> Self {
        let slot0 = Region::new(flash_base + page_size, slot_len);
        Self {
            flash_base,
            slot0,
            profile: Profile::SingleSlot,
            scheme: Scheme::AesGcm,
            chunk_size: 512_usize.min(page_size as usize),
            image_offset: 512,
            min_version: 0,
            version_record: Region::new(slot0.end(), 2 * page_size),
        }
    }

    /// Bytes of flash the layout needs, counted from `flash_base`.
    pub fn required_capacity(&self) -> usize {
        let end = match self.profile {
            Profile::SingleSlot => self.slot0.end(),
            Profile::DualSlot { trailer, .. } => trailer.end(),
        };
        (end.max(self.version_record.end()) - self.flash_base) as usize
    }

    /// Region the loader writes a candidate image into.
    pub fn download_slot(&self) -> Region {
        match self.profile {
            Profile::SingleSlot => self.slot0,
            Profile::DualSlot { download, .. } => download,
        }
    }

    /// Rejects layouts the installer cannot honor on a device with the given geometry.
    pub fn validate(&self, write_unit: usize, page_size: usize, capacity: usize) -> Result<(), Error> {
        let page = page_size as u32;

        if HEADER_LEN % write_unit != 0 {
            return Err(Error::Invalid("header length is not a multiple of the write unit"));
        }
        if MAGIC_LENGTH % write_unit != 0 {
            return Err(Error::Invalid("VALID marker copies are not whole write units"));
        }
        if self.chunk_size == 0 || self.chunk_size % AES_BLOCK_LEN != 0 {
            return Err(Error::Invalid("chunk size must be a non-zero multiple of the AES block"));
        }
        if page_size % self.chunk_size != 0 {
            return Err(Error::Invalid("page size is not a multiple of the chunk size"));
        }
        if (self.image_offset as usize) < HEADER_AREA_LEN
            || self.image_offset as usize % AES_BLOCK_LEN != 0
            || self.image_offset as usize % write_unit != 0
        {
            return Err(Error::Invalid("image offset overlaps the header or is misaligned"));
        }
        if self.image_offset >= page {
            return Err(Error::Invalid("image offset must fall inside the first page"));
        }

        let inside = |region: &Region| {
            region.start >= self.flash_base
                && (region.end() - self.flash_base) as usize <= capacity
                && (region.start - self.flash_base) % page == 0
                && region.len % page == 0
                && region.len > 0
        };

        if !inside(&self.slot0) || self.slot0.len <= self.image_offset {
            return Err(Error::Invalid("slot 0 is outside the device or not page aligned"));
        }
        if !inside(&self.version_record) || self.version_record.len % (2 * page) != 0 {
            return Err(Error::Invalid("version record must be two banks of whole pages"));
        }
        if write_unit < VERSION_ENTRY_LEN {
            return Err(Error::Invalid("write unit too small for a version record entry"));
        }
        if self.slot0.overlaps(&self.version_record) {
            return Err(Error::Invalid("flash regions overlap"));
        }

        if let Profile::DualSlot {
            download,
            swap,
            trailer,
        } = self.profile
        {
            if !inside(&download) || download.len != self.slot0.len {
                return Err(Error::Invalid("download slot must mirror slot 0"));
            }
            if !inside(&swap) || swap.len as usize % self.chunk_size != 0 {
                return Err(Error::Invalid("swap region must be whole pages and chunks"));
            }
            if self.slot0.len % swap.len != 0 {
                return Err(Error::Invalid("slot size is not a multiple of the swap region"));
            }
            if !inside(&trailer) {
                return Err(Error::Invalid("trailer is outside the device or not page aligned"));
            }
            if write_unit < TRAILER_COUNT_LEN {
                return Err(Error::Invalid("write unit too small for the trailer count"));
            }
            let chunks = (self.slot0.len / swap.len) as usize;
            if (trailer.len as usize) < trailer_len(write_unit, chunks) {
                return Err(Error::Invalid("trailer too small for the swap markers"));
            }

            let regions = [self.slot0, download, swap, trailer, self.version_record];
            for (i, a) in regions.iter().enumerate() {
                if regions[i + 1..].iter().any(|b| a.overlaps(b)) {
                    return Err(Error::Invalid("flash regions overlap"));
                }
            }
        }

        Ok(())
    }
}

/// Largest write unit the default layouts reserve trailer space for.
const MAX_WRITE_UNIT: usize = 32;

/// Trailer bytes needed for `chunks` swap chunks: header copy, count unit, armed
/// and rollback markers, then three install and three rollback markers per chunk.
pub fn trailer_len(write_unit: usize, chunks: usize) -> usize {
    HEADER_LEN + 3 * write_unit + 6 * write_unit * chunks
}

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    Invalid(&'static str),
}
