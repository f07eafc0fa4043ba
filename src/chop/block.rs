//! Block framing.
//!
//! Blocks on the wire have a 16-byte header, consisting of a 32-bit
//! sequence number, two 16-bit length fields ("D" and "P"), an 8-bit
//! opcode ("F"), and a 56-bit check field. All numbers are serialized in
//! network byte order.
//!
//! ```text
//! | 0 | 1 | 2 | 3 | 4 | 5 | 6 | 7 | 8 | 9 | A | B | C | D | E | F |
//! |Sequence Number|   D   |   P   | F |           Check           |
//! ```
//!
//! The header is encrypted with AES in ECB mode: this is safe because the
//! header is exactly one AES block long, the sequence number is never
//! repeated, and the header key is used for nothing else. The high 24 bits
//! of the sequence number plus the check field constitute an 80-bit MAC:
//! the receiver accepts only sequence numbers inside a 256-element window
//! and only an all-zero check field, so an attacker's odds of forging any
//! header field are below one in 2^80.
//!
//! Following the header are the "data" and "padding" sections, encrypted
//! together with AES-GCM under a different key; the *encrypted* header
//! doubles as the GCM nonce. Padding is sent as zeroes and ignored on
//! receipt. The trailing 16-byte GCM tag covers the data and padding
//! sections only, not the header.

use bytes::{BufMut, BytesMut};

use crate::crypto::{BlockSealer, HeaderDecryptor, HeaderEncryptor};

/// Length of the encrypted block header.
pub const HEADER_LEN: usize = 16;
/// Length of the GCM authentication tag.
pub const TRAILER_LEN: usize = 16;
/// Maximum length of either variable-length section.
pub const SECTION_LEN: usize = u16::MAX as usize;
/// Smallest legal block: header and tag around an empty body.
pub const MIN_BLOCK_SIZE: usize = HEADER_LEN + TRAILER_LEN;
/// Largest legal block: both sections at full length.
pub const MAX_BLOCK_SIZE: usize = MIN_BLOCK_SIZE + SECTION_LEN * 2;

/// Block opcodes.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    /// Pass the data section along to the upstream.
    Dat = 0,
    /// No further transmissions (pass data along, if any).
    Fin = 1,
    /// Protocol error, close the circuit now.
    Rst = 2,
    /// Commence rekeying.
    Rk1 = 3,
    /// Continue rekeying.
    Rk2 = 4,
    /// Conclude rekeying.
    Rk3 = 5,
}

impl Opcode {
    /// Decode an opcode byte. Values 6–127 are reserved for future
    /// definition, 128–255 for steganography modules; none are in use.
    pub fn from_byte(b: u8) -> Option<Opcode> {
        match b {
            0 => Some(Opcode::Dat),
            1 => Some(Opcode::Fin),
            2 => Some(Opcode::Rst),
            3 => Some(Opcode::Rk1),
            4 => Some(Opcode::Rk2),
            5 => Some(Opcode::Rk3),
            _ => None,
        }
    }
}

/// A decoded (or freshly built) block header, holding both the cleartext
/// layout and the ciphertext that doubles as the body nonce.
pub struct BlockHeader {
    clear: [u8; HEADER_LEN],
    cipher: [u8; HEADER_LEN],
}

impl BlockHeader {
    /// Build and encrypt a header for transmission.
    pub fn seal(seq: u32, d: u16, p: u16, op: Opcode, enc: &HeaderEncryptor) -> Self {
        let mut clear = [0u8; HEADER_LEN];
        clear[0..4].copy_from_slice(&seq.to_be_bytes());
        clear[4..6].copy_from_slice(&d.to_be_bytes());
        clear[6..8].copy_from_slice(&p.to_be_bytes());
        clear[8] = op as u8;
        // bytes 9..16 are the check field, all zero

        let cipher = enc.encrypt(&clear);
        Self { clear, cipher }
    }

    /// Decrypt a received header. `cipher` must be exactly [`HEADER_LEN`]
    /// bytes.
    pub fn open(cipher: &[u8], dec: &HeaderDecryptor) -> Self {
        let cipher: [u8; HEADER_LEN] = cipher.try_into().expect("header is 16 bytes");
        let clear = dec.decrypt(&cipher);
        Self { clear, cipher }
    }

    /// Sequence number S.
    pub fn seqno(&self) -> u32 {
        u32::from_be_bytes(self.clear[0..4].try_into().unwrap())
    }

    /// Data-section length D.
    pub fn dlen(&self) -> usize {
        u16::from_be_bytes(self.clear[4..6].try_into().unwrap()) as usize
    }

    /// Padding-section length P.
    pub fn plen(&self) -> usize {
        u16::from_be_bytes(self.clear[6..8].try_into().unwrap()) as usize
    }

    /// Raw opcode byte F.
    pub fn opcode_byte(&self) -> u8 {
        self.clear[8]
    }

    /// Total on-wire length of the block this header describes.
    pub fn total_len(&self) -> usize {
        HEADER_LEN + TRAILER_LEN + self.dlen() + self.plen()
    }

    /// Validate the check field and the receive window in one pass.
    ///
    /// This check must run in constant time: the check-field byte OR and
    /// the window predicate are combined without short-circuiting, so the
    /// rejection cause is not observable through timing.
    pub fn is_valid(&self, window: u32) -> bool {
        let mut ck = self.clear[9]
            | self.clear[10]
            | self.clear[11]
            | self.clear[12]
            | self.clear[13]
            | self.clear[14]
            | self.clear[15];
        let delta = self.seqno().wrapping_sub(window);
        ck |= u8::from((delta & !0xFFu32) != 0);
        ck == 0
    }

    /// The encrypted header, which doubles as the body's GCM nonce.
    pub fn nonce(&self) -> &[u8; HEADER_LEN] {
        &self.cipher
    }

    /// The decrypted header bytes, for diagnostics.
    pub fn cleartext(&self) -> &[u8; HEADER_LEN] {
        &self.clear
    }
}

/// Frame and seal a complete block: encrypted header, sealed data plus
/// `padlen` zero bytes of padding, trailing tag.
pub fn encode_block(
    seq: u32,
    data: &[u8],
    padlen: usize,
    hdr_enc: &HeaderEncryptor,
    sealer: &BlockSealer,
    op: Opcode,
) -> BytesMut {
    debug_assert!(data.len() <= SECTION_LEN);
    debug_assert!(padlen <= SECTION_LEN);

    let hdr = BlockHeader::seal(seq, data.len() as u16, padlen as u16, op, hdr_enc);

    let mut body = Vec::with_capacity(data.len() + padlen);
    body.extend_from_slice(data);
    body.resize(data.len() + padlen, 0);

    let sealed = sealer.seal(hdr.nonce(), &body);

    let mut block = BytesMut::with_capacity(HEADER_LEN + sealed.len());
    block.put_slice(hdr.nonce());
    block.put_slice(&sealed);
    block
}
