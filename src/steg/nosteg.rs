//! Transparent non-hiding module.
//!
//! Blocks go on the wire exactly as framed, with no carrier around them
//! and no shape constraints in either direction. Useful for protocol
//! bring-up and testing; it hides nothing.

use bytes::BytesMut;

use crate::chop::block::MAX_BLOCK_SIZE;
use crate::error::Result;
use crate::steg::{RecvStatus, Steg, StegHints};

pub(super) struct NoSteg;

impl NoSteg {
    pub(super) fn new() -> Self {
        NoSteg
    }
}

impl Steg for NoSteg {
    fn name(&self) -> &'static str {
        "nosteg"
    }

    fn transmit_room(&self) -> usize {
        MAX_BLOCK_SIZE
    }

    fn transmit(&mut self, block: &[u8], out: &mut BytesMut, _hints: &mut StegHints) -> Result<()> {
        tracing::debug!(len = block.len(), "transmitting raw block");
        out.extend_from_slice(block);
        Ok(())
    }

    fn receive(
        &mut self,
        inbound: &mut BytesMut,
        extracted: &mut BytesMut,
        _hints: &mut StegHints,
    ) -> Result<RecvStatus> {
        tracing::debug!(len = inbound.len(), "receiving raw bytes");
        extracted.extend_from_slice(inbound);
        inbound.clear();
        Ok(RecvStatus::Good)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_passthrough() {
        let mut steg = NoSteg::new();
        let mut hints = StegHints::default();

        assert_eq!(steg.transmit_room(), MAX_BLOCK_SIZE);

        let mut carrier = BytesMut::new();
        steg.transmit(b"block bytes", &mut carrier, &mut hints)
            .unwrap();
        assert_eq!(&carrier[..], b"block bytes");
        assert!(!hints.cease_transmission);

        let mut inbound = BytesMut::from(&carrier[..]);
        let mut extracted = BytesMut::new();
        let status = steg.receive(&mut inbound, &mut extracted, &mut hints).unwrap();
        assert_eq!(status, RecvStatus::Good);
        assert_eq!(&extracted[..], b"block bytes");
        assert!(inbound.is_empty());
    }
}
