//! Cipher contexts for block headers and block bodies.
//!
//! Headers are exactly one AES block and are encrypted raw (ECB): this is
//! safe because the sequence number inside never repeats within a key
//! epoch and the header key is used for nothing else. Bodies are sealed
//! with AES-128-GCM using the encrypted header as a 16-byte nonce and no
//! associated data.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;
use aes_gcm::aead::consts::U16;
use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{AesGcm, Nonce};

use crate::crypto::{KEY_SIZE, NONCE_SIZE};
use crate::error::{Error, Result};

/// AES-128-GCM with a 16-byte nonce.
type BodyCipher = AesGcm<Aes128, U16>;

/// Encrypts 16-byte block headers.
pub struct HeaderEncryptor(Aes128);

impl HeaderEncryptor {
    /// Create an encryptor from a header key.
    pub fn new(key: &[u8; KEY_SIZE]) -> Self {
        Self(Aes128::new(GenericArray::from_slice(key)))
    }

    /// Encrypt one header block.
    pub fn encrypt(&self, clear: &[u8; 16]) -> [u8; 16] {
        let mut block = GenericArray::clone_from_slice(clear);
        self.0.encrypt_block(&mut block);
        block.into()
    }
}

/// Decrypts 16-byte block headers.
pub struct HeaderDecryptor(Aes128);

impl HeaderDecryptor {
    /// Create a decryptor from a header key.
    pub fn new(key: &[u8; KEY_SIZE]) -> Self {
        Self(Aes128::new(GenericArray::from_slice(key)))
    }

    /// Decrypt one header block.
    pub fn decrypt(&self, cipher: &[u8; 16]) -> [u8; 16] {
        let mut block = GenericArray::clone_from_slice(cipher);
        self.0.decrypt_block(&mut block);
        block.into()
    }
}

/// Seals outgoing block bodies (data + padding).
pub struct BlockSealer(BodyCipher);

impl BlockSealer {
    /// Create a sealer from a payload key.
    pub fn new(key: &[u8; KEY_SIZE]) -> Self {
        Self(BodyCipher::new(GenericArray::from_slice(key)))
    }

    /// Encrypt and authenticate a body, returning ciphertext with the
    /// 16-byte tag appended.
    pub fn seal(&self, nonce: &[u8; NONCE_SIZE], plaintext: &[u8]) -> Vec<u8> {
        self.0
            .encrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: plaintext,
                    aad: &[],
                },
            )
            .expect("GCM sealing cannot fail for in-range lengths")
    }
}

/// Opens incoming block bodies.
pub struct BlockOpener(BodyCipher);

impl BlockOpener {
    /// Create an opener from a payload key.
    pub fn new(key: &[u8; KEY_SIZE]) -> Self {
        Self(BodyCipher::new(GenericArray::from_slice(key)))
    }

    /// Verify and decrypt a body (ciphertext with appended tag).
    pub fn open(&self, nonce: &[u8; NONCE_SIZE], ciphertext: &[u8]) -> Result<Vec<u8>> {
        self.0
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: &[],
                },
            )
            .map_err(|_| Error::MacFailure)
    }
}
