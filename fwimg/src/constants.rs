pub const SFU_MAGIC: [u8; 4] = *b"SFUM";
pub const HEADER_PROTOCOL_VERSION: u16 = 1;

pub const HEADER_LEN: usize = 192;
pub const HEADER_AUTH_LEN: usize = 128;

pub const TAG_LEN: usize = 32;
pub const NONCE_LEN: usize = 16;
pub const MAC_LEN: usize = 64;
pub const RESERVED_LEN: usize = HEADER_AUTH_LEN - 100;

pub const MAGIC_LENGTH: usize = 32;
pub const VALID_TAG_LEN: usize = 3 * MAGIC_LENGTH;
pub const HEADER_AREA_LEN: usize = HEADER_LEN + VALID_TAG_LEN;

pub const ERASED_BYTE: u8 = 0xFF;

pub const VERIFY_WINDOW: usize = 1024;
pub const MAX_SCATTER: usize = 2;

pub const AES_BLOCK_LEN: usize = 16;
pub const AES_KEY_LEN: usize = 16;
pub const GCM_NONCE_LEN: usize = 12;
pub const GCM_TAG_LEN: usize = 16;
pub const SHA256_LEN: usize = 32;
pub const ECDSA_SIG_LEN: usize = 64;

pub const MAX_SESSIONS: usize = 4;
pub const AES_KEY_HANDLE: u32 = 1;
pub const ECDSA_KEY_HANDLE: u32 = 2;

/// Bytes of a swap trailer count unit actually used by the chunk count.
pub const TRAILER_COUNT_LEN: usize = 4;
/// Bytes of a version record entry actually used: version and its complement.
pub const VERSION_ENTRY_LEN: usize = 4;
