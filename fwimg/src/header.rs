//! Firmware raw header and its three-fold VALID marker.
//!
//! The header is a fixed 192 byte little-endian record at the base of every slot:
//!
//! ```text
//!   0  magic "SFUM"            4
//!   4  protocol version        2
//!   6  firmware version        2
//!   8  firmware size           4
//!  12  partial firmware offset 4
//!  16  partial firmware size   4
//!  20  firmware tag            32
//!  52  partial firmware tag    32
//!  84  nonce / IV              16
//! 100  reserved                28
//! 128  header MAC / signature  64
//! ```
//!
//! The first 128 bytes are covered by the header MAC. Three copies of a pattern
//! derived from the MAC follow the header and mark the image as validated.
use crate::constants::*;
use crate::util;

/// Which part of an image a tag or a decryption pass refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Payload {
    /// The complete firmware, `fw_size` bytes, authenticated by `fw_tag`.
    Full,
    /// The tail starting at `partial_fw_offset`, authenticated by `partial_fw_tag`.
    Partial,
}

/// Decoded firmware raw header. Nothing in here is trusted until the header
/// MAC has been verified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FwRawHeader {
    pub magic: [u8; 4],
    pub protocol_version: u16,
    pub fw_version: u16,
    pub fw_size: u32,
    pub partial_fw_offset: u32,
    pub partial_fw_size: u32,
    pub fw_tag: [u8; TAG_LEN],
    pub partial_fw_tag: [u8; TAG_LEN],
    pub nonce: [u8; NONCE_LEN],
    pub reserved: [u8; RESERVED_LEN],
    pub header_mac: [u8; MAC_LEN],
}

impl FwRawHeader {
    /// Creates an unauthenticated header for a complete image.
    pub fn new(fw_version: u16, fw_size: u32, nonce: [u8; NONCE_LEN]) -> Self {
        Self {
            magic: SFU_MAGIC,
            protocol_version: HEADER_PROTOCOL_VERSION,
            fw_version,
            fw_size,
            partial_fw_offset: 0,
            partial_fw_size: fw_size,
            fw_tag: [0; TAG_LEN],
            partial_fw_tag: [0; TAG_LEN],
            nonce,
            reserved: [0; RESERVED_LEN],
            header_mac: [0; MAC_LEN],
        }
    }

    /// Decodes a header from the first `HEADER_LEN` bytes of `bytes`.
    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        let bytes = bytes.get(..HEADER_LEN).ok_or(Error::Length(bytes.len()))?;

        Ok(Self {
            magic: decode_array(bytes.get(0..4))?,
            protocol_version: decode_u16(bytes.get(4..6))?,
            fw_version: decode_u16(bytes.get(6..8))?,
            fw_size: decode_u32(bytes.get(8..12))?,
            partial_fw_offset: decode_u32(bytes.get(12..16))?,
            partial_fw_size: decode_u32(bytes.get(16..20))?,
            fw_tag: decode_array(bytes.get(20..52))?,
            partial_fw_tag: decode_array(bytes.get(52..84))?,
            nonce: decode_array(bytes.get(84..100))?,
            reserved: decode_array(bytes.get(100..HEADER_AUTH_LEN))?,
            header_mac: decode_array(bytes.get(HEADER_AUTH_LEN..HEADER_LEN))?,
        })
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0_u8; HEADER_LEN];
        out[0..4].copy_from_slice(&self.magic);
        out[4..6].copy_from_slice(&self.protocol_version.to_le_bytes());
        out[6..8].copy_from_slice(&self.fw_version.to_le_bytes());
        out[8..12].copy_from_slice(&self.fw_size.to_le_bytes());
        out[12..16].copy_from_slice(&self.partial_fw_offset.to_le_bytes());
        out[16..20].copy_from_slice(&self.partial_fw_size.to_le_bytes());
        out[20..52].copy_from_slice(&self.fw_tag);
        out[52..84].copy_from_slice(&self.partial_fw_tag);
        out[84..100].copy_from_slice(&self.nonce);
        out[100..HEADER_AUTH_LEN].copy_from_slice(&self.reserved);
        out[HEADER_AUTH_LEN..HEADER_LEN].copy_from_slice(&self.header_mac);
        out
    }

    /// Checks the structural fields: magic and protocol version.
    pub fn check_structure(&self) -> Result<(), Error> {
        if self.magic != SFU_MAGIC {
            return Err(Error::BadMagic(self.magic));
        }
        if self.protocol_version != HEADER_PROTOCOL_VERSION {
            return Err(Error::UnsupportedProtocol(self.protocol_version));
        }
        Ok(())
    }

    /// True if the image only carries a tail of the firmware.
    pub fn is_partial(&self) -> bool {
        self.partial_fw_offset != 0 || self.partial_fw_size != self.fw_size
    }

    /// Payload kind an installer has to process for this image.
    pub fn payload(&self) -> Payload {
        if self.is_partial() {
            Payload::Partial
        } else {
            Payload::Full
        }
    }

    /// Declared size of the given payload.
    pub fn payload_size(&self, payload: Payload) -> usize {
        match payload {
            Payload::Full => self.fw_size as usize,
            Payload::Partial => self.partial_fw_size as usize,
        }
    }

    /// Recorded tag of the given payload, truncated to the scheme's tag length.
    pub fn payload_tag(&self, payload: Payload, tag_len: usize) -> &[u8] {
        match payload {
            Payload::Full => &self.fw_tag[..tag_len],
            Payload::Partial => &self.partial_fw_tag[..tag_len],
        }
    }

    /// Pattern replicated three times after the header once the image is validated.
    pub fn valid_pattern(&self) -> [u8; MAGIC_LENGTH] {
        valid_pattern(&self.header_mac)
    }

    /// Complete VALID marker as written to flash.
    pub fn valid_marker(&self) -> [u8; VALID_TAG_LEN] {
        let pattern = self.valid_pattern();
        let mut marker = [0_u8; VALID_TAG_LEN];
        for copy in marker.chunks_exact_mut(MAGIC_LENGTH) {
            copy.copy_from_slice(&pattern);
        }
        marker
    }
}

fn valid_pattern(header_mac: &[u8]) -> [u8; MAGIC_LENGTH] {
    util::sha256(header_mac)
}

/// Copies a raw header out of a flash-backed buffer. The contents are not trusted yet.
pub fn parse_fw_info(buffer: &[u8]) -> Result<FwRawHeader, Error> {
    FwRawHeader::decode(buffer)
}

/// Checks the VALID marker that follows the header in `buffer`.
///
/// All three copies must be bit-identical, must match the pattern derived from the
/// header MAC in the same buffer, and must be neither erased nor zeroed. Any single
/// differing byte fails the check.
pub fn check_header_validated(buffer: &[u8]) -> Result<(), Error> {
    let area = buffer
        .get(..HEADER_AREA_LEN)
        .ok_or(Error::Length(buffer.len()))?;
    let expected = valid_pattern(&area[HEADER_AUTH_LEN..HEADER_LEN]);
    let marker = &area[HEADER_LEN..];

    let (first, rest) = marker.split_at(MAGIC_LENGTH);
    let (second, third) = rest.split_at(MAGIC_LENGTH);

    let mut diff = 0_u8;
    for i in 0..MAGIC_LENGTH {
        diff |= (first[i] ^ second[i]) | (first[i] ^ third[i]) | (first[i] ^ expected[i]);
    }

    if diff != 0 || util::is_erased(first) || util::is_zeroed(first) {
        return Err(Error::NotValidated);
    }

    Ok(())
}

/// Header error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    Length(usize),
    DecodeFromBytes(&'static str),
    BadMagic([u8; 4]),
    UnsupportedProtocol(u16),
    NotValidated,
}

fn decode_u16(bytes: Option<&[u8]>) -> Result<u16, Error> {
    Ok(u16::from_le_bytes(decode_array(bytes)?))
}

fn decode_u32(bytes: Option<&[u8]>) -> Result<u32, Error> {
    Ok(u32::from_le_bytes(decode_array(bytes)?))
}

fn decode_array<const N: usize>(bytes: Option<&[u8]>) -> Result<[u8; N], Error> {
    bytes
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or(Error::DecodeFromBytes("array"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample() -> FwRawHeader {
        let mut header = FwRawHeader::new(3, 2048, [0x11; NONCE_LEN]);
        header.fw_tag = [0xA5; TAG_LEN];
        header.partial_fw_tag = [0xA5; TAG_LEN];
        header.header_mac = [0x3C; MAC_LEN];
        header
    }

    fn validated_area(header: &FwRawHeader) -> Vec<u8> {
        let mut area = header.encode().to_vec();
        area.extend_from_slice(&header.valid_marker());
        area
    }

    #[test]
    fn layout_offsets() {
        let header = sample();
        let raw = header.encode();
        assert_eq!(&raw[0..4], b"SFUM");
        assert_eq!(u16::from_le_bytes([raw[6], raw[7]]), 3);
        assert_eq!(u32::from_le_bytes(raw[8..12].try_into().unwrap()), 2048);
        assert_eq!(&raw[84..100], &[0x11; NONCE_LEN]);
        assert_eq!(&raw[128..192], &[0x3C; MAC_LEN]);
        assert_eq!(FwRawHeader::decode(&raw).unwrap(), header);
    }

    #[test]
    fn parse_short_buffer() {
        assert_eq!(parse_fw_info(&[0; 100]), Err(Error::Length(100)));
    }

    #[test]
    fn parse_does_not_trust_contents() {
        let mut raw = sample().encode();
        raw[0] = b'X';
        let header = parse_fw_info(&raw).unwrap();
        assert_eq!(header.check_structure(), Err(Error::BadMagic(*b"XFUM")));
    }

    #[test]
    fn full_and_partial_payloads() {
        let mut header = sample();
        assert_eq!(header.payload(), Payload::Full);

        header.partial_fw_offset = 1024;
        header.partial_fw_size = 1024;
        assert_eq!(header.payload(), Payload::Partial);
        assert_eq!(header.payload_size(Payload::Partial), 1024);
        assert_eq!(header.payload_size(Payload::Full), 2048);
    }

    #[test]
    fn validated_marker_is_accepted() {
        let area = validated_area(&sample());
        assert_eq!(check_header_validated(&area), Ok(()));
    }

    #[test]
    fn erased_or_zeroed_marker_is_rejected() {
        let mut area = sample().encode().to_vec();
        area.extend_from_slice(&[ERASED_BYTE; VALID_TAG_LEN]);
        assert_eq!(check_header_validated(&area), Err(Error::NotValidated));

        area[HEADER_LEN..].fill(0);
        assert_eq!(check_header_validated(&area), Err(Error::NotValidated));
    }

    #[test]
    fn marker_of_another_header_is_rejected() {
        let mut area = validated_area(&sample());
        area[HEADER_AUTH_LEN] ^= 0x01;
        assert_eq!(check_header_validated(&area), Err(Error::NotValidated));
    }

    #[test]
    fn torn_marker_write_is_rejected() {
        // two copies written, third still erased
        let mut area = validated_area(&sample());
        area[HEADER_LEN + 2 * MAGIC_LENGTH..].fill(ERASED_BYTE);
        assert_eq!(check_header_validated(&area), Err(Error::NotValidated));
    }

    proptest! {
        #[test]
        fn any_flipped_copy_byte_fails(
            mac in proptest::collection::vec(any::<u8>(), MAC_LEN),
            copy in 0_usize..3,
            index in 0_usize..MAGIC_LENGTH,
            flip in 1_u8..=255,
        ) {
            let mut header = sample();
            header.header_mac.copy_from_slice(&mac);
            let mut area = validated_area(&header);
            prop_assert!(check_header_validated(&area).is_ok());

            area[HEADER_LEN + copy * MAGIC_LENGTH + index] ^= flip;
            prop_assert_eq!(check_header_validated(&area), Err(Error::NotValidated));
        }

        #[test]
        fn validation_is_a_pure_function_of_the_buffer(
            area in proptest::collection::vec(any::<u8>(), HEADER_AREA_LEN),
        ) {
            let first = check_header_validated(&area);
            let second = check_header_validated(&area);
            prop_assert_eq!(first, second);
        }
    }
}
