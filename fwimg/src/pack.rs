//! Host side image packaging.
//!
//! Produces what the installer consumes: a signed or MAC'ed header followed by the
//! stored payload. Complete images carry the whole firmware; partial images carry
//! only the tail from `partial_offset` on and rely on the prefix already installed.
use k256::ecdsa::signature::hazmat::PrehashSigner;
use k256::ecdsa::{Signature, SigningKey};
use rand::RngCore;

use crate::constants::*;
use crate::crypto::{Domain, Scheme, SecureEngine, Tag};
use crate::header::{FwRawHeader, Payload};
use crate::util;
use crate::Error;

#[derive(Debug, Clone)]
pub struct PackOptions {
    pub fw_version: u16,
    /// Start of the tail shipped in a partial image.
    pub partial_offset: Option<u32>,
    pub nonce: [u8; NONCE_LEN],
}

impl PackOptions {
    /// Options for a complete image with a fresh random nonce.
    pub fn new(fw_version: u16) -> Self {
        let mut nonce = [0_u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        Self {
            fw_version,
            partial_offset: None,
            nonce,
        }
    }
}

/// A packed image: header and stored payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackedImage {
    pub header: FwRawHeader,
    pub payload: Vec<u8>,
}

impl PackedImage {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.payload.len());
        out.extend_from_slice(&self.header.encode());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Splits a packed image file. Only the structure is checked here.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let header = FwRawHeader::decode(bytes)?;
        header.check_structure()?;

        let payload = bytes[HEADER_LEN..].to_vec();
        let declared = header.payload_size(header.payload());
        if payload.len() != declared {
            return Err(Error::SizeMismatch {
                declared,
                actual: payload.len(),
            });
        }

        Ok(Self { header, payload })
    }
}

/// Packs `firmware` for the engine's scheme.
///
/// The ECDSA schemes need `signing_key`; AES-GCM authenticates the header with the
/// installer's AES key instead. CBC images are padded with the erase pattern to a
/// whole number of blocks.
pub fn pack_image(
    engine: &mut SecureEngine,
    signing_key: Option<&SigningKey>,
    firmware: &[u8],
    options: &PackOptions,
) -> Result<PackedImage, Error> {
    let scheme = engine.scheme();

    let mut firmware = firmware.to_vec();
    firmware.resize(util::align_up(firmware.len(), scheme.block_len()), ERASED_BYTE);
    let fw_size = u32::try_from(firmware.len()).map_err(|_| Error::ImageTooLarge {
        size: firmware.len(),
        capacity: u32::MAX as usize,
    })?;
    if fw_size == 0 {
        return Err(Error::Unsupported("empty firmware image"));
    }

    let partial_offset = options.partial_offset.unwrap_or(0);
    if partial_offset >= fw_size {
        return Err(Error::SizeMismatch {
            declared: fw_size as usize,
            actual: partial_offset as usize,
        });
    }
    if partial_offset as usize % AES_BLOCK_LEN != 0 {
        return Err(Error::Unsupported("partial offset is not block aligned"));
    }

    let mut header = FwRawHeader::new(options.fw_version, fw_size, options.nonce);
    header.partial_fw_offset = partial_offset;
    header.partial_fw_size = fw_size - partial_offset;

    let tail = &firmware[partial_offset as usize..];
    let shipped = header.payload();
    header.fw_tag = clear_tag(engine, &header, Payload::Full, &firmware)?.to_field();
    header.partial_fw_tag = match shipped {
        Payload::Partial => clear_tag(engine, &header, Payload::Partial, tail)?.to_field(),
        Payload::Full => header.fw_tag,
    };

    let mut payload = vec![0_u8; tail.len()];
    let mut op = engine.encrypt_init(&header, shipped)?;
    for (input, output) in tail
        .chunks(VERIFY_WINDOW)
        .zip(payload.chunks_mut(VERIFY_WINDOW))
    {
        if let Err(e) = engine.encrypt_append(&mut op, input, output) {
            engine.abort(op);
            return Err(e);
        }
    }
    engine.encrypt_finish(op)?;

    let auth = header.encode();
    let auth = &auth[..HEADER_AUTH_LEN];
    match scheme {
        Scheme::AesGcm => {
            let mac = engine.header_mac(auth, &header.nonce)?;
            header.header_mac[..GCM_TAG_LEN].copy_from_slice(mac.as_slice());
        }
        Scheme::AesCbcSha256Ecdsa | Scheme::Sha256Ecdsa => {
            let key = signing_key.ok_or(Error::Unsupported("scheme needs a signing key"))?;
            let signature: Signature = key
                .sign_prehash(&util::sha256(auth))
                .map_err(|_| Error::SignatureInvalid)?;
            header.header_mac[..ECDSA_SIG_LEN].copy_from_slice(&signature.to_bytes());
        }
    }

    #[cfg(feature = "log")]
    log::info!(
        "packed v{}: {} bytes, payload {} bytes",
        header.fw_version,
        fw_size,
        payload.len()
    );

    Ok(PackedImage { header, payload })
}

fn clear_tag(
    engine: &mut SecureEngine,
    header: &FwRawHeader,
    payload: Payload,
    data: &[u8],
) -> Result<Tag, Error> {
    let mut op = engine.authenticate_fw_init(header, payload, Domain::Clear)?;
    for window in data.chunks(VERIFY_WINDOW) {
        if let Err(e) = engine.authenticate_fw_append(&mut op, window) {
            engine.abort(op);
            return Err(e);
        }
    }
    engine.authenticate_fw_finish(op)
}
