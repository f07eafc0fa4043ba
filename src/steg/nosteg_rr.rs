//! Strict request/response non-hiding module.
//!
//! Mimics the connection discipline of query/response cover protocols
//! (notably HTTP) without actually hiding anything: the client may
//! transmit exactly once per connection and then must stop; the server may
//! transmit only after it has received, and must reply promptly.

use bytes::BytesMut;

use crate::chop::block::MAX_BLOCK_SIZE;
use crate::crypto::Side;
use crate::error::Result;
use crate::steg::{RecvStatus, Steg, StegHints};

/// How long the server may sit on a received request before it must make
/// up a reply, in milliseconds.
const REPLY_DEADLINE_MS: u64 = 100;

pub(super) struct NoStegRr {
    side: Side,
    can_transmit: bool,
    did_transmit: bool,
}

impl NoStegRr {
    pub(super) fn new(side: Side) -> Self {
        Self {
            side,
            // The client speaks first; the server only ever answers.
            can_transmit: side == Side::Client,
            did_transmit: false,
        }
    }
}

impl Steg for NoStegRr {
    fn name(&self) -> &'static str {
        "nosteg_rr"
    }

    fn transmit_room(&self) -> usize {
        if self.can_transmit {
            MAX_BLOCK_SIZE
        } else {
            0
        }
    }

    fn transmit(&mut self, block: &[u8], out: &mut BytesMut, hints: &mut StegHints) -> Result<()> {
        debug_assert!(self.can_transmit);
        tracing::debug!(len = block.len(), "transmitting raw block");

        out.extend_from_slice(block);
        self.did_transmit = true;
        self.can_transmit = false;
        hints.cease_transmission = true;
        Ok(())
    }

    fn receive(
        &mut self,
        inbound: &mut BytesMut,
        extracted: &mut BytesMut,
        hints: &mut StegHints,
    ) -> Result<RecvStatus> {
        tracing::debug!(
            len = inbound.len(),
            side = ?self.side,
            "receiving raw bytes"
        );
        extracted.extend_from_slice(inbound);
        inbound.clear();

        match self.side {
            // The reply is in; nothing further will come on this connection.
            Side::Client => hints.expect_close = true,
            Side::Server => {
                if !self.did_transmit {
                    self.can_transmit = true;
                    hints.transmit_soon = Some(REPLY_DEADLINE_MS);
                }
            }
        }

        Ok(RecvStatus::Good)
    }
}
