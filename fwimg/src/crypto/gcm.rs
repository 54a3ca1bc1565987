//! Streaming AES-128-GCM.
//!
//! Data may be fed in pieces of any length; GHASH input is buffered until a full
//! block is available.
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit, KeyIvInit, StreamCipher};
use aes::Aes128;
use ghash::universal_hash::UniversalHash;
use ghash::GHash;

use crate::constants::{AES_BLOCK_LEN, AES_KEY_LEN, GCM_NONCE_LEN, GCM_TAG_LEN};

type Aes128Ctr = ctr::Ctr32BE<Aes128>;

pub struct Gcm {
    ctr: Aes128Ctr,
    ghash: GHash,
    tag_mask: [u8; AES_BLOCK_LEN],
    pending: [u8; AES_BLOCK_LEN],
    pending_len: usize,
    aad_len: u64,
    data_len: u64,
}

impl Gcm {
    pub fn new(key: &[u8; AES_KEY_LEN], nonce: &[u8; GCM_NONCE_LEN], aad: &[u8]) -> Self {
        let cipher = Aes128::new(GenericArray::from_slice(key));

        let mut h = GenericArray::default();
        cipher.encrypt_block(&mut h);

        let mut j0 = [0_u8; AES_BLOCK_LEN];
        j0[..GCM_NONCE_LEN].copy_from_slice(nonce);
        j0[AES_BLOCK_LEN - 1] = 1;

        let mut tag_mask = GenericArray::clone_from_slice(&j0);
        cipher.encrypt_block(&mut tag_mask);

        // payload keystream starts at inc32(J0)
        j0[AES_BLOCK_LEN - 1] = 2;
        let ctr = Aes128Ctr::new(GenericArray::from_slice(key), GenericArray::from_slice(&j0));

        let mut ghash = GHash::new(&h);
        ghash.update_padded(aad);

        Self {
            ctr,
            ghash,
            tag_mask: tag_mask.into(),
            pending: [0; AES_BLOCK_LEN],
            pending_len: 0,
            aad_len: aad.len() as u64,
            data_len: 0,
        }
    }

    pub fn encrypt(&mut self, buf: &mut [u8]) {
        self.ctr.apply_keystream(buf);
        self.absorb(buf);
    }

    pub fn decrypt(&mut self, buf: &mut [u8]) {
        self.absorb(buf);
        self.ctr.apply_keystream(buf);
    }

    /// Computes the authentication tag over everything seen so far.
    pub fn finalize(mut self) -> [u8; GCM_TAG_LEN] {
        if self.pending_len > 0 {
            self.ghash.update_padded(&self.pending[..self.pending_len]);
        }

        let mut lengths = [0_u8; AES_BLOCK_LEN];
        lengths[..8].copy_from_slice(&(self.aad_len * 8).to_be_bytes());
        lengths[8..].copy_from_slice(&(self.data_len * 8).to_be_bytes());
        self.ghash.update(&[GenericArray::clone_from_slice(&lengths)]);

        let mut tag: [u8; GCM_TAG_LEN] = self.ghash.finalize().into();
        for (t, m) in tag.iter_mut().zip(self.tag_mask) {
            *t ^= m;
        }
        tag
    }

    fn absorb(&mut self, mut data: &[u8]) {
        self.data_len += data.len() as u64;

        if self.pending_len > 0 {
            let take = (AES_BLOCK_LEN - self.pending_len).min(data.len());
            self.pending[self.pending_len..self.pending_len + take].copy_from_slice(&data[..take]);
            self.pending_len += take;
            data = &data[take..];

            if self.pending_len < AES_BLOCK_LEN {
                return;
            }
            self.ghash
                .update(&[GenericArray::clone_from_slice(&self.pending)]);
            self.pending_len = 0;
        }

        let mut blocks = data.chunks_exact(AES_BLOCK_LEN);
        for block in &mut blocks {
            self.ghash.update(&[GenericArray::clone_from_slice(block)]);
        }

        let rest = blocks.remainder();
        self.pending[..rest.len()].copy_from_slice(rest);
        self.pending_len = rest.len();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unhex(s: &str) -> Vec<u8> {
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap())
            .collect()
    }

    #[test]
    fn empty_message_vector() {
        let gcm = Gcm::new(&[0; 16], &[0; 12], &[]);
        assert_eq!(
            gcm.finalize().to_vec(),
            unhex("58e2fccefa7e3061367f1d57a4e7455a")
        );
    }

    #[test]
    fn single_block_vector() {
        let mut buf = [0_u8; 16];
        let mut gcm = Gcm::new(&[0; 16], &[0; 12], &[]);
        gcm.encrypt(&mut buf);
        assert_eq!(buf.to_vec(), unhex("0388dace60b6a392f328c2b971b2fe78"));
        assert_eq!(
            gcm.finalize().to_vec(),
            unhex("ab6e47d42cec13bdf53a67b21257bddf")
        );
    }

    #[test]
    fn streaming_matches_one_shot() {
        let key = [0x42; 16];
        let nonce = [0x24; 12];
        let plain: Vec<u8> = (0..1000_u32).map(|i| (i * 7) as u8).collect();

        let mut one_shot = plain.clone();
        let mut gcm = Gcm::new(&key, &nonce, b"header");
        gcm.encrypt(&mut one_shot);
        let tag = gcm.finalize();

        let mut pieces = plain.clone();
        let mut gcm = Gcm::new(&key, &nonce, b"header");
        let (a, rest) = pieces.split_at_mut(7);
        let (b, c) = rest.split_at_mut(500);
        gcm.encrypt(a);
        gcm.encrypt(b);
        gcm.encrypt(c);
        assert_eq!(pieces, one_shot);
        assert_eq!(gcm.finalize(), tag);

        let mut gcm = Gcm::new(&key, &nonce, b"header");
        let (a, b) = pieces.split_at_mut(333);
        gcm.decrypt(a);
        gcm.decrypt(b);
        assert_eq!(pieces, plain);
        assert_eq!(gcm.finalize(), tag);
    }

    #[test]
    fn aad_is_authenticated() {
        let a = Gcm::new(&[1; 16], &[2; 12], b"one").finalize();
        let b = Gcm::new(&[1; 16], &[2; 12], b"two").finalize();
        assert_ne!(a, b);
    }
}
