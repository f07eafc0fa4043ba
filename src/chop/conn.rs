//! Per-downstream-connection state.
//!
//! One `Conn` wraps a single cover connection: its steganography module,
//! the staging buffers on the receive path, and the handshake and
//! transmission-discipline flags. Connections hold only the identifier of
//! their owning circuit; the engine validates the reference on every
//! lookup, so a connection that outlives its circuit is simply detached.

use bytes::BytesMut;

use crate::chop::ConnId;
use crate::steg::Steg;

pub(crate) struct Conn {
    pub id: ConnId,
    /// The steganography module bound to this connection.
    pub steg: Box<dyn Steg>,
    /// Owning circuit, if attached. Server-side connections are
    /// unattached until the handshake resolves.
    pub circuit: Option<u32>,
    /// Raw carrier bytes from the socket, not yet decoded by the steg
    /// module.
    pub inbound: BytesMut,
    /// Hidden bytes the steg module has extracted, not yet framed into
    /// blocks.
    pub recv_pending: BytesMut,
    /// The 4-byte circuit-id handshake has gone out (merged into the
    /// first block).
    pub sent_handshake: bool,
    /// The steg module has forbidden further transmissions.
    pub no_more_transmissions: bool,
    /// A must-send timer is pending for this connection.
    pub must_send_armed: bool,
    /// This connection has been handed to the I/O layer for
    /// flush-and-close; ignore further traffic for it.
    pub closing: bool,
}

impl Conn {
    pub fn new(id: ConnId, steg: Box<dyn Steg>) -> Self {
        Self {
            id,
            steg,
            circuit: None,
            inbound: BytesMut::new(),
            recv_pending: BytesMut::new(),
            sent_handshake: false,
            no_more_transmissions: false,
            must_send_armed: false,
            closing: false,
        }
    }

    /// Try to consume the 4-byte circuit-id handshake from the extracted
    /// bytes. Returns `None` until all four bytes have arrived.
    ///
    /// The id travels in little-endian byte order (a host-order copy in
    /// the original deployment, kept bit-exact for compatibility).
    pub fn take_handshake_id(&mut self) -> Option<u32> {
        if self.recv_pending.len() < 4 {
            return None;
        }
        let raw = self.recv_pending.split_to(4);
        Some(u32::from_le_bytes(raw[..].try_into().unwrap()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Side;
    use crate::steg;

    fn conn() -> Conn {
        Conn::new(1, steg::create("nosteg", Side::Server).unwrap())
    }

    #[test]
    fn test_handshake_waits_for_four_bytes() {
        let mut c = conn();
        c.recv_pending.extend_from_slice(&[0xEF, 0xBE]);
        assert_eq!(c.take_handshake_id(), None);

        c.recv_pending.extend_from_slice(&[0xAD, 0xDE, 0x99]);
        assert_eq!(c.take_handshake_id(), Some(0xDEADBEEF));
        // The trailing byte stays for block framing.
        assert_eq!(&c.recv_pending[..], &[0x99]);
    }
}
