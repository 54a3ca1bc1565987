//! Cryptographic service.
//!
//! Exposes the four streaming triads used by the installer (encrypt, decrypt,
//! firmware authentication, signature verification) on top of the key management
//! service. Every triad holds its KMS sessions from `init` until `finish` or
//! [`SecureEngine::abort`].
use crate::constants::*;
use crate::header::{FwRawHeader, Payload};
use crate::kms::{Kms, Mechanism, SessionHandle};
use crate::verify::memory_compare;
use crate::Error;

pub mod gcm;

/// Configured crypto scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    /// AES-128-GCM for header authentication, payload confidentiality and payload tag.
    AesGcm,
    /// ECDSA signed header, AES-128-CBC encrypted payload, SHA-256 payload tag.
    AesCbcSha256Ecdsa,
    /// ECDSA signed header, clear payload, SHA-256 payload tag.
    Sha256Ecdsa,
}

impl Scheme {
    pub fn tag_len(self) -> usize {
        match self {
            Scheme::AesGcm => GCM_TAG_LEN,
            Scheme::AesCbcSha256Ecdsa | Scheme::Sha256Ecdsa => SHA256_LEN,
        }
    }

    pub fn is_encrypted(self) -> bool {
        !matches!(self, Scheme::Sha256Ecdsa)
    }

    /// Required payload size granularity.
    pub fn block_len(self) -> usize {
        match self {
            Scheme::AesCbcSha256Ecdsa => AES_BLOCK_LEN,
            Scheme::AesGcm | Scheme::Sha256Ecdsa => 1,
        }
    }
}

/// Form of the payload a firmware tag is computed over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Domain {
    /// As stored by the loader, possibly encrypted.
    Stored,
    /// Installed in clear.
    Clear,
}

/// Firmware tag or digest produced by [`SecureEngine::authenticate_fw_finish`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tag {
    len: usize,
    bytes: [u8; TAG_LEN],
}

impl Tag {
    fn new(value: &[u8]) -> Result<Self, Error> {
        let mut bytes = [0_u8; TAG_LEN];
        bytes
            .get_mut(..value.len())
            .ok_or(Error::Unsupported("tag longer than the header field"))?
            .copy_from_slice(value);
        Ok(Self {
            len: value.len(),
            bytes,
        })
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    /// The tag as stored in a header field, zero padded.
    pub fn to_field(&self) -> [u8; TAG_LEN] {
        self.bytes
    }
}

impl AsRef<[u8]> for Tag {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

enum Stage {
    Encrypt(SessionHandle),
    Decrypt(SessionHandle),
    Copy,
    Digest(SessionHandle),
    DecryptDigest {
        decrypt: SessionHandle,
        digest: SessionHandle,
    },
    GcmTag {
        session: SessionHandle,
        decrypt: bool,
    },
    Signature(SessionHandle),
}

/// A streaming operation in flight.
pub struct Operation(Stage);

impl Operation {
    fn sessions(&self) -> [Option<SessionHandle>; 2] {
        match self.0 {
            Stage::Copy => [None, None],
            Stage::Encrypt(s)
            | Stage::Decrypt(s)
            | Stage::Digest(s)
            | Stage::Signature(s)
            | Stage::GcmTag { session: s, .. } => [Some(s), None],
            Stage::DecryptDigest { decrypt, digest } => [Some(decrypt), Some(digest)],
        }
    }
}

/// Crypto service bound to a key store and a scheme.
pub struct SecureEngine {
    kms: Kms,
    scheme: Scheme,
    scratch: Vec<u8>,
}

impl SecureEngine {
    pub fn new(kms: Kms, scheme: Scheme) -> Self {
        Self {
            kms,
            scheme,
            scratch: Vec::new(),
        }
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn kms(&self) -> &Kms {
        &self.kms
    }

    /// Closes every KMS session.
    pub fn reset(&mut self) {
        self.kms.close_all();
    }

    /// Drops an operation and releases its sessions.
    pub fn abort(&mut self, op: Operation) {
        self.close(&op);
    }

    fn close(&mut self, op: &Operation) {
        for session in op.sessions().into_iter().flatten() {
            // already closed if the operation failed halfway through opening
            let _ = self.kms.close_session(session);
        }
    }

    fn payload_mechanism(&self, header: &FwRawHeader, payload: Payload) -> Option<Mechanism> {
        let purpose = match payload {
            Payload::Full => GCM_IV_FULL,
            Payload::Partial => GCM_IV_PARTIAL,
        };
        match self.scheme {
            Scheme::AesGcm => Some(Mechanism::AesGcm {
                iv: gcm_iv(&header.nonce, purpose),
                aad: Vec::new(),
            }),
            Scheme::AesCbcSha256Ecdsa => Some(Mechanism::AesCbc { iv: header.nonce }),
            Scheme::Sha256Ecdsa => None,
        }
    }

    fn open(&mut self) -> Result<SessionHandle, Error> {
        Ok(self.kms.open_session()?)
    }

    /// Runs `init` on a fresh session, closing it again if `init` fails.
    fn open_with(
        &mut self,
        init: impl FnOnce(&mut Kms, SessionHandle) -> Result<(), crate::kms::Error>,
    ) -> Result<SessionHandle, Error> {
        let session = self.open()?;
        if let Err(e) = init(&mut self.kms, session) {
            let _ = self.kms.close_session(session);
            return Err(e.into());
        }
        Ok(session)
    }

    pub fn encrypt_init(&mut self, header: &FwRawHeader, payload: Payload) -> Result<Operation, Error> {
        match self.payload_mechanism(header, payload) {
            Some(mechanism) => {
                let session = self.open_with(|kms, s| kms.encrypt_init(s, &mechanism, AES_KEY_HANDLE))?;
                Ok(Operation(Stage::Encrypt(session)))
            }
            None => Ok(Operation(Stage::Copy)),
        }
    }

    pub fn encrypt_append(
        &mut self,
        op: &mut Operation,
        input: &[u8],
        output: &mut [u8],
    ) -> Result<(), Error> {
        match op.0 {
            Stage::Encrypt(session) => Ok(self.kms.encrypt_update(session, input, output)?),
            Stage::Copy => copy(input, output),
            _ => Err(Error::Unsupported("not an encryption")),
        }
    }

    /// Ends an encryption and returns the tag it produced, if the scheme has one.
    pub fn encrypt_finish(&mut self, op: Operation) -> Result<Option<Tag>, Error> {
        match op.0 {
            Stage::Encrypt(session) => {
                let tag = self.kms.encrypt_final(session);
                self.close(&op);
                let tag = tag?;
                Ok(if tag.is_empty() {
                    None
                } else {
                    Some(Tag::new(&tag)?)
                })
            }
            Stage::Copy => Ok(None),
            _ => {
                self.close(&op);
                Err(Error::Unsupported("not an encryption"))
            }
        }
    }

    pub fn decrypt_init(&mut self, header: &FwRawHeader, payload: Payload) -> Result<Operation, Error> {
        match self.payload_mechanism(header, payload) {
            Some(mechanism) => {
                let session = self.open_with(|kms, s| kms.decrypt_init(s, &mechanism, AES_KEY_HANDLE))?;
                Ok(Operation(Stage::Decrypt(session)))
            }
            None => Ok(Operation(Stage::Copy)),
        }
    }

    pub fn decrypt_append(
        &mut self,
        op: &mut Operation,
        input: &[u8],
        output: &mut [u8],
    ) -> Result<(), Error> {
        match op.0 {
            Stage::Decrypt(session) => Ok(self.kms.decrypt_update(session, input, output)?),
            Stage::Copy => copy(input, output),
            _ => Err(Error::Unsupported("not a decryption")),
        }
    }

    /// Ends a decryption. With an authenticated cipher the computed tag must match
    /// `expected`.
    pub fn decrypt_finish(&mut self, op: Operation, expected: &[u8]) -> Result<(), Error> {
        match op.0 {
            Stage::Decrypt(session) => {
                let tag = self.kms.decrypt_final(session);
                self.close(&op);
                let tag = tag?;
                if !tag.is_empty() && !memory_compare(&tag, expected) {
                    return Err(Error::TagMismatch);
                }
                Ok(())
            }
            Stage::Copy => Ok(()),
            _ => {
                self.close(&op);
                Err(Error::Unsupported("not a decryption"))
            }
        }
    }

    /// Starts computing the firmware tag of a payload.
    ///
    /// With AES-GCM the tag covers the ciphertext: a stored payload is run through
    /// decryption, a clear one through encryption under the same IV. The other
    /// schemes digest the clear payload, decrypting a stored CBC payload on the way.
    pub fn authenticate_fw_init(
        &mut self,
        header: &FwRawHeader,
        payload: Payload,
        domain: Domain,
    ) -> Result<Operation, Error> {
        let mechanism = self.payload_mechanism(header, payload);
        let stage = match (self.scheme, domain, mechanism) {
            (Scheme::AesGcm, domain, Some(mechanism)) => {
                let decrypt = domain == Domain::Stored;
                let session = self.open_with(|kms, s| {
                    if decrypt {
                        kms.decrypt_init(s, &mechanism, AES_KEY_HANDLE)
                    } else {
                        kms.encrypt_init(s, &mechanism, AES_KEY_HANDLE)
                    }
                })?;
                Stage::GcmTag { session, decrypt }
            }
            (Scheme::AesCbcSha256Ecdsa, Domain::Stored, Some(mechanism)) => {
                let decrypt =
                    self.open_with(|kms, s| kms.decrypt_init(s, &mechanism, AES_KEY_HANDLE))?;
                match self.open_with(|kms, s| kms.digest_init(s)) {
                    Ok(digest) => Stage::DecryptDigest { decrypt, digest },
                    Err(e) => {
                        let _ = self.kms.close_session(decrypt);
                        return Err(e);
                    }
                }
            }
            _ => Stage::Digest(self.open_with(|kms, s| kms.digest_init(s))?),
        };
        Ok(Operation(stage))
    }

    pub fn authenticate_fw_append(&mut self, op: &mut Operation, data: &[u8]) -> Result<(), Error> {
        self.scratch.resize(data.len(), 0);
        match op.0 {
            Stage::GcmTag { session, decrypt } => {
                if decrypt {
                    self.kms.decrypt_update(session, data, &mut self.scratch)?;
                } else {
                    self.kms.encrypt_update(session, data, &mut self.scratch)?;
                }
            }
            Stage::DecryptDigest { decrypt, digest } => {
                self.kms.decrypt_update(decrypt, data, &mut self.scratch)?;
                self.kms.digest_update(digest, &self.scratch)?;
            }
            Stage::Digest(session) => self.kms.digest_update(session, data)?,
            _ => return Err(Error::Unsupported("not a firmware authentication")),
        }
        Ok(())
    }

    pub fn authenticate_fw_finish(&mut self, op: Operation) -> Result<Tag, Error> {
        let tag = match op.0 {
            Stage::GcmTag { session, decrypt } => {
                if decrypt {
                    self.kms.decrypt_final(session).map(|t| Tag::new(&t))
                } else {
                    self.kms.encrypt_final(session).map(|t| Tag::new(&t))
                }
            }
            Stage::DecryptDigest { decrypt, digest } => self
                .kms
                .decrypt_final(decrypt)
                .and_then(|_| self.kms.digest_final(digest))
                .map(|d| Tag::new(&d)),
            Stage::Digest(session) => self.kms.digest_final(session).map(|d| Tag::new(&d)),
            _ => Ok(Err(Error::Unsupported("not a firmware authentication"))),
        };
        self.close(&op);
        tag?
    }

    pub fn verify_signature_init(&mut self) -> Result<Operation, Error> {
        let session = self.open_with(|kms, s| kms.digest_init(s))?;
        Ok(Operation(Stage::Signature(session)))
    }

    pub fn verify_signature_append(&mut self, op: &mut Operation, data: &[u8]) -> Result<(), Error> {
        match op.0 {
            Stage::Signature(session) => Ok(self.kms.digest_update(session, data)?),
            _ => Err(Error::Unsupported("not a signature verification")),
        }
    }

    /// Checks a raw `r || s` ECDSA signature over everything appended.
    pub fn verify_signature_finish(&mut self, op: Operation, signature: &[u8]) -> Result<(), Error> {
        let result = match op.0 {
            Stage::Signature(session) => self.kms.digest_final(session).and_then(|digest| {
                self.kms.verify_init(session, ECDSA_KEY_HANDLE)?;
                self.kms.verify(session, &digest, signature)
            }),
            _ => {
                self.close(&op);
                return Err(Error::Unsupported("not a signature verification"));
            }
        };
        self.close(&op);
        result.map_err(|e| match e {
            crate::kms::Error::SignatureInvalid | crate::kms::Error::SignatureLenRange => {
                Error::SignatureInvalid
            }
            e => e.into(),
        })
    }

    /// GCM tag authenticating the header span, computed with an empty payload.
    pub fn header_mac(&mut self, auth: &[u8], nonce: &[u8; NONCE_LEN]) -> Result<Tag, Error> {
        let mechanism = Mechanism::AesGcm {
            iv: gcm_iv(nonce, GCM_IV_HEADER),
            aad: auth.to_vec(),
        };
        let session = self.open_with(|kms, s| kms.encrypt_init(s, &mechanism, AES_KEY_HANDLE))?;
        let tag = self.kms.encrypt_final(session);
        let _ = self.kms.close_session(session);
        Tag::new(&tag?)
    }

    /// Authenticates the first `HEADER_AUTH_LEN` bytes of a raw header against its MAC.
    pub fn verify_header(&mut self, raw: &[u8; HEADER_LEN]) -> Result<(), Error> {
        let (auth, mac) = raw.split_at(HEADER_AUTH_LEN);
        match self.scheme {
            Scheme::AesGcm => {
                let nonce: [u8; NONCE_LEN] = raw[84..100]
                    .try_into()
                    .map_err(|_| Error::HeaderAuthFailed)?;
                let tag = self.header_mac(auth, &nonce)?;
                if !memory_compare(tag.as_slice(), &mac[..GCM_TAG_LEN]) {
                    return Err(Error::HeaderAuthFailed);
                }
                Ok(())
            }
            Scheme::AesCbcSha256Ecdsa | Scheme::Sha256Ecdsa => {
                let mut op = self.verify_signature_init()?;
                if let Err(e) = self.verify_signature_append(&mut op, auth) {
                    self.abort(op);
                    return Err(e);
                }
                self.verify_signature_finish(op, &mac[..ECDSA_SIG_LEN])
                    .map_err(|e| match e {
                        Error::SignatureInvalid => Error::HeaderAuthFailed,
                        e => e,
                    })
            }
        }
    }
}

// Last IV byte of each GCM computation keyed off one header nonce. The header MAC
// and the two payload tags must never share an IV.
const GCM_IV_HEADER: u8 = 0x00;
const GCM_IV_FULL: u8 = 0x01;
const GCM_IV_PARTIAL: u8 = 0x02;

/// GCM IV: the first 11 nonce bytes followed by a purpose byte.
fn gcm_iv(nonce: &[u8; NONCE_LEN], purpose: u8) -> [u8; GCM_NONCE_LEN] {
    let mut iv = [0_u8; GCM_NONCE_LEN];
    iv[..GCM_NONCE_LEN - 1].copy_from_slice(&nonce[..GCM_NONCE_LEN - 1]);
    iv[GCM_NONCE_LEN - 1] = purpose;
    iv
}

fn copy(input: &[u8], output: &mut [u8]) -> Result<(), Error> {
    output
        .get_mut(..input.len())
        .ok_or(Error::Kms(crate::kms::Error::BufferTooSmall))?
        .copy_from_slice(input);
    Ok(())
}
