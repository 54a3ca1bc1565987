//! Key management service.
//!
//! A small PKCS#11 flavored key store: provisioned key objects are referenced by
//! integer handles, and every cryptographic operation runs inside a session taken
//! from a fixed-size table. Session handles are table indices starting at 1.
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes::Aes128;
use k256::ecdsa::signature::hazmat::PrehashVerifier;
use k256::ecdsa::{Signature, VerifyingKey};

use crate::constants::*;
use crate::crypto::gcm::Gcm;
use crate::util::Sha256Engine;

pub type ObjectHandle = u32;
pub type SessionHandle = u32;

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// Provisioned key material.
#[derive(Clone)]
pub enum KeyObject {
    Aes128([u8; AES_KEY_LEN]),
    EcdsaPublic(VerifyingKey),
}

/// Mechanism selecting the algorithm of an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mechanism {
    AesGcm {
        iv: [u8; GCM_NONCE_LEN],
        aad: Vec<u8>,
    },
    AesCbc {
        iv: [u8; AES_BLOCK_LEN],
    },
}

enum Cipher {
    GcmEncrypt(Box<Gcm>),
    GcmDecrypt(Box<Gcm>),
    CbcEncrypt(Aes128CbcEnc),
    CbcDecrypt(Aes128CbcDec),
}

enum Operation {
    Encrypt(Cipher),
    Decrypt(Cipher),
    Digest(Sha256Engine),
    Verify(VerifyingKey),
}

/// Key store and session table.
pub struct Kms {
    objects: Vec<(ObjectHandle, KeyObject)>,
    sessions: [Option<Option<Operation>>; MAX_SESSIONS],
}

impl Default for Kms {
    fn default() -> Self {
        Self::new()
    }
}

impl Kms {
    pub fn new() -> Self {
        Self {
            objects: Vec::new(),
            sessions: Default::default(),
        }
    }

    /// Provisions a key object under `handle`.
    pub fn add_object(&mut self, handle: ObjectHandle, object: KeyObject) -> Result<(), Error> {
        if self.objects.iter().any(|(h, _)| *h == handle) {
            return Err(Error::ObjectHandleInUse(handle));
        }
        self.objects.push((handle, object));
        Ok(())
    }

    fn object(&self, handle: ObjectHandle) -> Result<&KeyObject, Error> {
        self.objects
            .iter()
            .find(|(h, _)| *h == handle)
            .map(|(_, object)| object)
            .ok_or(Error::KeyHandleInvalid(handle))
    }

    fn aes_key(&self, handle: ObjectHandle) -> Result<[u8; AES_KEY_LEN], Error> {
        match self.object(handle)? {
            KeyObject::Aes128(key) => Ok(*key),
            _ => Err(Error::KeyTypeInconsistent(handle)),
        }
    }

    /// Allocates the first free session slot.
    pub fn open_session(&mut self) -> Result<SessionHandle, Error> {
        let index = self
            .sessions
            .iter()
            .position(Option::is_none)
            .ok_or(Error::SessionCount)?;
        self.sessions[index] = Some(None);

        #[cfg(feature = "log")]
        log::trace!("kms: opened session {}", index + 1);

        Ok(index as SessionHandle + 1)
    }

    pub fn close_session(&mut self, session: SessionHandle) -> Result<(), Error> {
        *self.slot(session)? = None;
        Ok(())
    }

    /// Closes every session. Used when the boot sequence (re-)enters.
    pub fn close_all(&mut self) {
        self.sessions = Default::default();
    }

    /// Number of sessions currently open.
    pub fn open_sessions(&self) -> usize {
        self.sessions.iter().filter(|s| s.is_some()).count()
    }

    fn slot(&mut self, session: SessionHandle) -> Result<&mut Option<Option<Operation>>, Error> {
        let index = (session as usize)
            .checked_sub(1)
            .ok_or(Error::SessionHandleInvalid(session))?;
        match self.sessions.get_mut(index) {
            Some(slot @ Some(_)) => Ok(slot),
            _ => Err(Error::SessionHandleInvalid(session)),
        }
    }

    fn idle(&mut self, session: SessionHandle) -> Result<&mut Option<Operation>, Error> {
        match self.slot(session)? {
            Some(op @ None) => Ok(op),
            Some(Some(_)) => Err(Error::OperationActive(session)),
            None => Err(Error::SessionHandleInvalid(session)),
        }
    }

    fn active(&mut self, session: SessionHandle) -> Result<&mut Option<Operation>, Error> {
        match self.slot(session)? {
            Some(op @ Some(_)) => Ok(op),
            Some(None) => Err(Error::OperationNotInitialized(session)),
            None => Err(Error::SessionHandleInvalid(session)),
        }
    }

    fn cipher(
        &self,
        mechanism: &Mechanism,
        key: ObjectHandle,
        encrypt: bool,
    ) -> Result<Cipher, Error> {
        let key = self.aes_key(key)?;
        Ok(match mechanism {
            Mechanism::AesGcm { iv, aad } if encrypt => {
                Cipher::GcmEncrypt(Box::new(Gcm::new(&key, iv, aad)))
            }
            Mechanism::AesGcm { iv, aad } => Cipher::GcmDecrypt(Box::new(Gcm::new(&key, iv, aad))),
            Mechanism::AesCbc { iv } if encrypt => Cipher::CbcEncrypt(Aes128CbcEnc::new(
                GenericArray::from_slice(&key),
                GenericArray::from_slice(iv),
            )),
            Mechanism::AesCbc { iv } => Cipher::CbcDecrypt(Aes128CbcDec::new(
                GenericArray::from_slice(&key),
                GenericArray::from_slice(iv),
            )),
        })
    }

    pub fn encrypt_init(
        &mut self,
        session: SessionHandle,
        mechanism: &Mechanism,
        key: ObjectHandle,
    ) -> Result<(), Error> {
        let cipher = self.cipher(mechanism, key, true)?;
        *self.idle(session)? = Some(Operation::Encrypt(cipher));
        Ok(())
    }

    /// Encrypts `input` into the first `input.len()` bytes of `output`.
    pub fn encrypt_update(
        &mut self,
        session: SessionHandle,
        input: &[u8],
        output: &mut [u8],
    ) -> Result<(), Error> {
        match self.active(session)? {
            Some(Operation::Encrypt(cipher)) => update(cipher, input, output),
            _ => Err(Error::OperationNotInitialized(session)),
        }
    }

    /// Ends the encryption and returns the authentication tag, empty for CBC.
    pub fn encrypt_final(&mut self, session: SessionHandle) -> Result<Vec<u8>, Error> {
        match self.active(session)?.take() {
            Some(Operation::Encrypt(cipher)) => Ok(finish(cipher)),
            _ => Err(Error::OperationNotInitialized(session)),
        }
    }

    pub fn decrypt_init(
        &mut self,
        session: SessionHandle,
        mechanism: &Mechanism,
        key: ObjectHandle,
    ) -> Result<(), Error> {
        let cipher = self.cipher(mechanism, key, false)?;
        *self.idle(session)? = Some(Operation::Decrypt(cipher));
        Ok(())
    }

    pub fn decrypt_update(
        &mut self,
        session: SessionHandle,
        input: &[u8],
        output: &mut [u8],
    ) -> Result<(), Error> {
        match self.active(session)? {
            Some(Operation::Decrypt(cipher)) => update(cipher, input, output),
            _ => Err(Error::OperationNotInitialized(session)),
        }
    }

    /// Ends the decryption and returns the tag computed over the ciphertext.
    /// Comparing it against the expected tag is left to the caller.
    pub fn decrypt_final(&mut self, session: SessionHandle) -> Result<Vec<u8>, Error> {
        match self.active(session)?.take() {
            Some(Operation::Decrypt(cipher)) => Ok(finish(cipher)),
            _ => Err(Error::OperationNotInitialized(session)),
        }
    }

    pub fn digest_init(&mut self, session: SessionHandle) -> Result<(), Error> {
        *self.idle(session)? = Some(Operation::Digest(Sha256Engine::default()));
        Ok(())
    }

    pub fn digest_update(&mut self, session: SessionHandle, data: &[u8]) -> Result<(), Error> {
        match self.active(session)? {
            Some(Operation::Digest(engine)) => {
                engine.update(data);
                Ok(())
            }
            _ => Err(Error::OperationNotInitialized(session)),
        }
    }

    pub fn digest_final(&mut self, session: SessionHandle) -> Result<[u8; SHA256_LEN], Error> {
        match self.active(session)?.take() {
            Some(Operation::Digest(engine)) => Ok(engine.finalize()),
            _ => Err(Error::OperationNotInitialized(session)),
        }
    }

    pub fn verify_init(&mut self, session: SessionHandle, key: ObjectHandle) -> Result<(), Error> {
        let key = match self.object(key)? {
            KeyObject::EcdsaPublic(key) => key.clone(),
            _ => return Err(Error::KeyTypeInconsistent(key)),
        };
        *self.idle(session)? = Some(Operation::Verify(key));
        Ok(())
    }

    /// Verifies a raw `r || s` signature over a SHA-256 digest.
    pub fn verify(
        &mut self,
        session: SessionHandle,
        digest: &[u8],
        signature: &[u8],
    ) -> Result<(), Error> {
        let key = match self.active(session)?.take() {
            Some(Operation::Verify(key)) => key,
            _ => return Err(Error::OperationNotInitialized(session)),
        };

        let (r, s) = signature
            .get(..ECDSA_SIG_LEN)
            .ok_or(Error::SignatureLenRange)?
            .split_at(ECDSA_SIG_LEN / 2);
        let r: [u8; 32] = r.try_into().map_err(|_| Error::SignatureLenRange)?;
        let s: [u8; 32] = s.try_into().map_err(|_| Error::SignatureLenRange)?;
        let signature = Signature::from_scalars(r, s).map_err(|_| Error::SignatureInvalid)?;

        key.verify_prehash(digest, &signature)
            .map_err(|_| Error::SignatureInvalid)
    }
}

fn update(cipher: &mut Cipher, input: &[u8], output: &mut [u8]) -> Result<(), Error> {
    let output = output
        .get_mut(..input.len())
        .ok_or(Error::BufferTooSmall)?;
    output.copy_from_slice(input);

    match cipher {
        Cipher::GcmEncrypt(gcm) => gcm.encrypt(output),
        Cipher::GcmDecrypt(gcm) => gcm.decrypt(output),
        Cipher::CbcEncrypt(enc) => {
            if output.len() % AES_BLOCK_LEN != 0 {
                return Err(Error::DataLenRange);
            }
            for block in output.chunks_exact_mut(AES_BLOCK_LEN) {
                enc.encrypt_block_mut(GenericArray::from_mut_slice(block));
            }
        }
        Cipher::CbcDecrypt(dec) => {
            if output.len() % AES_BLOCK_LEN != 0 {
                return Err(Error::DataLenRange);
            }
            for block in output.chunks_exact_mut(AES_BLOCK_LEN) {
                dec.decrypt_block_mut(GenericArray::from_mut_slice(block));
            }
        }
    }

    Ok(())
}

fn finish(cipher: Cipher) -> Vec<u8> {
    match cipher {
        Cipher::GcmEncrypt(gcm) | Cipher::GcmDecrypt(gcm) => gcm.finalize().to_vec(),
        Cipher::CbcEncrypt(_) | Cipher::CbcDecrypt(_) => Vec::new(),
    }
}

/// KMS error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    SessionCount,
    SessionHandleInvalid(SessionHandle),
    OperationActive(SessionHandle),
    OperationNotInitialized(SessionHandle),
    ObjectHandleInUse(ObjectHandle),
    KeyHandleInvalid(ObjectHandle),
    KeyTypeInconsistent(ObjectHandle),
    DataLenRange,
    BufferTooSmall,
    SignatureLenRange,
    SignatureInvalid,
}

#[cfg(test)]
mod tests {
    use super::*;
    use k256::ecdsa::signature::hazmat::PrehashSigner;
    use k256::ecdsa::SigningKey;

    const AES: ObjectHandle = 1;
    const ECDSA: ObjectHandle = 2;

    fn kms() -> (Kms, SigningKey) {
        let signing = SigningKey::from_slice(&[7; 32]).unwrap();
        let mut kms = Kms::new();
        kms.add_object(AES, KeyObject::Aes128([0x2B; 16])).unwrap();
        kms.add_object(ECDSA, KeyObject::EcdsaPublic(signing.verifying_key().clone()))
            .unwrap();
        (kms, signing)
    }

    #[test]
    fn session_table_is_bounded() {
        let (mut kms, _) = kms();
        let handles: Vec<_> = (0..MAX_SESSIONS)
            .map(|_| kms.open_session().unwrap())
            .collect();
        assert_eq!(handles, vec![1, 2, 3, 4]);
        assert_eq!(kms.open_session(), Err(Error::SessionCount));

        // closing one frees exactly that slot
        kms.close_session(3).unwrap();
        assert_eq!(kms.open_session(), Ok(3));

        kms.close_all();
        assert_eq!(kms.open_sessions(), 0);
        assert_eq!(kms.open_session(), Ok(1));
    }

    #[test]
    fn invalid_session_handles() {
        let (mut kms, _) = kms();
        assert_eq!(kms.digest_init(0), Err(Error::SessionHandleInvalid(0)));
        assert_eq!(kms.digest_init(2), Err(Error::SessionHandleInvalid(2)));
        assert_eq!(kms.close_session(9), Err(Error::SessionHandleInvalid(9)));
    }

    #[test]
    fn one_operation_per_session() {
        let (mut kms, _) = kms();
        let session = kms.open_session().unwrap();
        kms.digest_init(session).unwrap();
        assert_eq!(kms.digest_init(session), Err(Error::OperationActive(session)));
        kms.digest_update(session, b"abc").unwrap();
        assert_eq!(kms.digest_final(session), Ok(crate::util::sha256(b"abc")));
        assert_eq!(
            kms.digest_final(session),
            Err(Error::OperationNotInitialized(session))
        );
    }

    #[test]
    fn key_handles_are_checked() {
        let (mut kms, _) = kms();
        let session = kms.open_session().unwrap();
        let gcm = Mechanism::AesGcm {
            iv: [0; 12],
            aad: vec![],
        };
        assert_eq!(
            kms.encrypt_init(session, &gcm, 99),
            Err(Error::KeyHandleInvalid(99))
        );
        assert_eq!(
            kms.encrypt_init(session, &gcm, ECDSA),
            Err(Error::KeyTypeInconsistent(ECDSA))
        );
        assert_eq!(
            kms.verify_init(session, AES),
            Err(Error::KeyTypeInconsistent(AES))
        );
        assert_eq!(
            kms.add_object(AES, KeyObject::Aes128([0; 16])),
            Err(Error::ObjectHandleInUse(AES))
        );
    }

    #[test]
    fn gcm_decrypt_reproduces_encrypt_tag() {
        let (mut kms, _) = kms();
        let mechanism = Mechanism::AesGcm {
            iv: [9; 12],
            aad: b"aad".to_vec(),
        };
        let plain = [0x33_u8; 100];

        let session = kms.open_session().unwrap();
        kms.encrypt_init(session, &mechanism, AES).unwrap();
        let mut cipher = [0_u8; 100];
        kms.encrypt_update(session, &plain, &mut cipher).unwrap();
        let tag = kms.encrypt_final(session).unwrap();
        assert_eq!(tag.len(), GCM_TAG_LEN);

        kms.decrypt_init(session, &mechanism, AES).unwrap();
        let mut out = [0_u8; 100];
        kms.decrypt_update(session, &cipher[..40], &mut out[..40])
            .unwrap();
        kms.decrypt_update(session, &cipher[40..], &mut out[40..])
            .unwrap();
        assert_eq!(kms.decrypt_final(session).unwrap(), tag);
        assert_eq!(out, plain);
    }

    #[test]
    fn cbc_requires_whole_blocks() {
        let (mut kms, _) = kms();
        let mechanism = Mechanism::AesCbc { iv: [1; 16] };
        let session = kms.open_session().unwrap();
        kms.encrypt_init(session, &mechanism, AES).unwrap();

        let mut out = [0_u8; 32];
        assert_eq!(
            kms.encrypt_update(session, &[0; 20], &mut out),
            Err(Error::DataLenRange)
        );
        assert_eq!(
            kms.encrypt_update(session, &[0; 32], &mut out[..16]),
            Err(Error::BufferTooSmall)
        );

        kms.encrypt_update(session, &[0x44; 32], &mut out).unwrap();
        assert!(kms.encrypt_final(session).unwrap().is_empty());

        kms.decrypt_init(session, &mechanism, AES).unwrap();
        let mut plain = [0_u8; 32];
        kms.decrypt_update(session, &out, &mut plain).unwrap();
        assert_eq!(plain, [0x44; 32]);
    }

    #[test]
    fn ecdsa_verify() {
        let (mut kms, signing) = kms();
        let digest = crate::util::sha256(b"header bytes");
        let signature: Signature = signing.sign_prehash(&digest).unwrap();
        let raw = signature.to_bytes();

        let session = kms.open_session().unwrap();
        kms.verify_init(session, ECDSA).unwrap();
        assert_eq!(kms.verify(session, &digest, &raw), Ok(()));

        let mut tampered = raw;
        tampered[40] ^= 1;
        kms.verify_init(session, ECDSA).unwrap();
        assert_eq!(
            kms.verify(session, &digest, &tampered),
            Err(Error::SignatureInvalid)
        );

        kms.verify_init(session, ECDSA).unwrap();
        assert_eq!(
            kms.verify(session, &digest, &raw[..10]),
            Err(Error::SignatureLenRange)
        );
    }
}
