//! Cryptographic primitives for the chop protocol.
//!
//! This module provides:
//! - PBKDF2/HKDF key schedule derivation from a shared passphrase
//! - AES-128-ECB header encryption (one block at a time)
//! - AES-128-GCM sealing of block bodies, with the encrypted header
//!   doubling as a 16-byte nonce
//! - Secure random number generation
//!
//! All secret key material is zeroized on drop.

mod cipher;
mod kdf;
mod random;

pub use cipher::{BlockOpener, BlockSealer, HeaderDecryptor, HeaderEncryptor};
pub use kdf::KeySchedule;
pub use random::{range_geom, SecureRandom};

/// Size of each derived cipher key in bytes (AES-128)
pub const KEY_SIZE: usize = 16;

/// Size of the GCM nonce in bytes: the whole encrypted header
pub const NONCE_SIZE: usize = 16;

/// Size of the GCM authentication tag in bytes
pub const TAG_SIZE: usize = 16;

/// Which end of a circuit this endpoint is.
///
/// Both sides derive the same four keys; the side determines only which
/// two are used for encryption and which for decryption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// The censored endpoint that dials cover connections.
    Client,
    /// The uncensored endpoint that accepts cover connections.
    Server,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schedule_and_ciphers_interoperate() {
        let client = KeySchedule::from_passphrase(b"passphrase", &[], Side::Client);
        let server = KeySchedule::from_passphrase(b"passphrase", &[], Side::Server);

        // Client-sent header decrypts on the server.
        let enc = HeaderEncryptor::new(client.header_enc());
        let dec = HeaderDecryptor::new(server.header_dec());
        let clear = *b"0123456789abcdef";
        assert_eq!(dec.decrypt(&enc.encrypt(&clear)), clear);

        // Client-sealed body opens on the server, bound to the same nonce.
        let sealer = BlockSealer::new(client.payload_enc());
        let opener = BlockOpener::new(server.payload_dec());
        let nonce = enc.encrypt(&clear);
        let sealed = sealer.seal(&nonce, b"covert bytes");
        assert_eq!(opener.open(&nonce, &sealed).unwrap(), b"covert bytes");
    }
}
