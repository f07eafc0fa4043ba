//! Key schedule derivation.
//!
//! One keying operation drives all four cipher contexts of a circuit. The
//! passphrase is stretched with PBKDF2-HMAC-SHA256 into a pseudorandom key,
//! which then feeds an HKDF-Expand-SHA256 stream; the four 16-byte keys are
//! drawn from that stream in a fixed order, so both endpoints derive
//! identical material and differ only in which keys they encrypt with.

use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::{Side, KEY_SIZE};

/// PBKDF2 iteration count for passphrase stretching.
const PBKDF2_ROUNDS: u32 = 10_000;

/// When no salt is supplied, a hash-length block of zeroes substitutes.
const NO_SALT: [u8; 32] = [0u8; 32];

/// The four keys backing one circuit's cipher contexts.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct KeySchedule {
    header_enc: [u8; KEY_SIZE],
    header_dec: [u8; KEY_SIZE],
    payload_enc: [u8; KEY_SIZE],
    payload_dec: [u8; KEY_SIZE],
}

impl KeySchedule {
    /// Derive the schedule for one side of a circuit from a shared
    /// passphrase.
    ///
    /// The key stream yields four keys k1..k4. The server reads them as
    /// (payload-send, header-send, payload-recv, header-recv); the client
    /// as (payload-recv, header-recv, payload-send, header-send). The
    /// client's send keys are therefore the server's receive keys and vice
    /// versa.
    pub fn from_passphrase(passphrase: &[u8], salt: &[u8], side: Side) -> Self {
        let salt = if salt.is_empty() { &NO_SALT[..] } else { salt };

        let mut prk = [0u8; 32];
        pbkdf2::pbkdf2_hmac::<Sha256>(passphrase, salt, PBKDF2_ROUNDS, &mut prk);

        let hk = Hkdf::<Sha256>::from_prk(&prk)
            .expect("PRK is exactly one hash block, always acceptable");
        let mut okm = [0u8; KEY_SIZE * 4];
        hk.expand(&[], &mut okm)
            .expect("64 bytes is far below the HKDF expansion limit");
        prk.zeroize();

        let key = |i: usize| -> [u8; KEY_SIZE] {
            okm[i * KEY_SIZE..(i + 1) * KEY_SIZE].try_into().unwrap()
        };

        let schedule = match side {
            Side::Server => Self {
                payload_enc: key(0),
                header_enc: key(1),
                payload_dec: key(2),
                header_dec: key(3),
            },
            Side::Client => Self {
                payload_dec: key(0),
                header_dec: key(1),
                payload_enc: key(2),
                header_enc: key(3),
            },
        };
        okm.zeroize();
        schedule
    }

    /// Key for encrypting outgoing block headers.
    pub fn header_enc(&self) -> &[u8; KEY_SIZE] {
        &self.header_enc
    }

    /// Key for decrypting incoming block headers.
    pub fn header_dec(&self) -> &[u8; KEY_SIZE] {
        &self.header_dec
    }

    /// Key for sealing outgoing block bodies.
    pub fn payload_enc(&self) -> &[u8; KEY_SIZE] {
        &self.payload_enc
    }

    /// Key for opening incoming block bodies.
    pub fn payload_dec(&self) -> &[u8; KEY_SIZE] {
        &self.payload_dec
    }
}

impl std::fmt::Debug for KeySchedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("KeySchedule").field(&"*****").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sides_mirror() {
        let client = KeySchedule::from_passphrase(b"shared words", &[], Side::Client);
        let server = KeySchedule::from_passphrase(b"shared words", &[], Side::Server);

        assert_eq!(client.header_enc(), server.header_dec());
        assert_eq!(client.header_dec(), server.header_enc());
        assert_eq!(client.payload_enc(), server.payload_dec());
        assert_eq!(client.payload_dec(), server.payload_enc());
    }

    #[test]
    fn test_keys_are_distinct() {
        let ks = KeySchedule::from_passphrase(b"shared words", &[], Side::Client);
        assert_ne!(ks.header_enc(), ks.header_dec());
        assert_ne!(ks.payload_enc(), ks.payload_dec());
        assert_ne!(ks.header_enc(), ks.payload_enc());
    }

    #[test]
    fn test_derivation_is_deterministic() {
        let a = KeySchedule::from_passphrase(b"x", b"salt", Side::Server);
        let b = KeySchedule::from_passphrase(b"x", b"salt", Side::Server);
        assert_eq!(a.header_enc(), b.header_enc());
        assert_eq!(a.payload_dec(), b.payload_dec());
    }

    #[test]
    fn test_salt_changes_keys() {
        let a = KeySchedule::from_passphrase(b"x", &[], Side::Server);
        let b = KeySchedule::from_passphrase(b"x", b"salt", Side::Server);
        assert_ne!(a.header_enc(), b.header_enc());
    }
}
