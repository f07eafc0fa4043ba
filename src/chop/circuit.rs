//! Per-circuit state.
//!
//! A circuit is one logical end-to-end byte stream, multiplexed across any
//! number of downstream cover connections. It owns the four cipher
//! contexts derived from the shared passphrase, the outgoing sequence
//! counter, the reassembly queue for the peer's blocks, and the staging
//! buffer of upstream bytes waiting to be chopped.

use std::collections::HashSet;
use std::time::Duration;

use bytes::BytesMut;

use crate::chop::queue::ReassemblyQueue;
use crate::chop::ConnId;
use crate::crypto::{
    range_geom, BlockOpener, BlockSealer, HeaderDecryptor, HeaderEncryptor, KeySchedule, Side,
};

/// Server-side idle limit: if a circuit sits with no downstream
/// connections this long, it is destroyed. This must always exceed the
/// maximum interval the peer's flush timer can produce, or we would axe
/// circuits that merely had nothing to say for a while.
const AXE_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// Upper bound of the flush-timer sample, milliseconds (20 minutes).
const FLUSH_CEILING_MS: u64 = 20 * 60 * 1000;

/// Cap on the flush expectation, milliseconds (10 minutes; between 2^19
/// and 2^20, so the dead-cycle shift below saturates it).
const FLUSH_EXPECTATION_CAP_MS: u64 = 10 * 60 * 1000;

pub(crate) struct Circuit {
    /// Nonzero identifier, unique within the peer's circuit table.
    pub id: u32,
    /// Blocks from the peer, awaiting in-order delivery.
    pub recv_queue: ReassemblyQueue,
    /// Attached downstream connections.
    pub downstreams: HashSet<ConnId>,
    /// Header cipher contexts.
    pub hdr_enc: HeaderEncryptor,
    pub hdr_dec: HeaderDecryptor,
    /// Body cipher contexts.
    pub sealer: BlockSealer,
    pub opener: BlockOpener,
    /// Sequence number of the next block to transmit. Starts at zero,
    /// increments by one per block, and must not wrap before a rekey.
    pub send_seq: u32,
    /// Consecutive send passes that moved no real data.
    pub dead_cycles: u32,
    /// We have transmitted a FIN block.
    pub sent_fin: bool,
    /// The peer's FIN has been delivered to the upstream.
    pub received_fin: bool,
    /// The upstream has reported end-of-stream.
    pub upstream_eof: bool,
    /// Upstream bytes waiting to be chopped into blocks.
    pub xmit_pending: BytesMut,
}

impl Circuit {
    /// Create a circuit and derive its cipher contexts.
    pub fn new(id: u32, passphrase: &[u8], side: Side) -> Self {
        let keys = KeySchedule::from_passphrase(passphrase, &[], side);
        Self {
            id,
            recv_queue: ReassemblyQueue::new(),
            downstreams: HashSet::new(),
            hdr_enc: HeaderEncryptor::new(keys.header_enc()),
            hdr_dec: HeaderDecryptor::new(keys.header_dec()),
            sealer: BlockSealer::new(keys.payload_enc()),
            opener: BlockOpener::new(keys.payload_dec()),
            send_seq: 0,
            dead_cycles: 0,
            sent_fin: false,
            received_fin: false,
            upstream_eof: false,
            xmit_pending: BytesMut::new(),
        }
    }

    /// Interval before the client's flush timer fires and forces a chaff
    /// transmission.
    ///
    /// A truncated-geometric sample whose expectation doubles with every
    /// dead cycle: a freshly busy circuit checks back within fractions of
    /// a second, a long-idle one backs off toward the ceiling.
    pub fn flush_interval(&self) -> Duration {
        let shift = self.dead_cycles.clamp(1, 19);
        let expectation = (1u64 << shift).clamp(1, FLUSH_EXPECTATION_CAP_MS);
        Duration::from_millis(range_geom(FLUSH_CEILING_MS, expectation) + 100)
    }

    /// Interval before an idle server-side circuit is destroyed.
    pub fn axe_interval(&self) -> Duration {
        AXE_INTERVAL
    }

    /// True once both FINs have been exchanged.
    pub fn closing(&self) -> bool {
        self.sent_fin && self.received_fin
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PASSPHRASE: &[u8] = b"unit test passphrase";

    #[test]
    fn test_new_circuit_is_quiescent() {
        let ckt = Circuit::new(42, PASSPHRASE, Side::Client);
        assert_eq!(ckt.id, 42);
        assert_eq!(ckt.send_seq, 0);
        assert!(!ckt.sent_fin && !ckt.received_fin && !ckt.upstream_eof);
        assert!(ckt.downstreams.is_empty());
        assert!(ckt.xmit_pending.is_empty());
        assert_eq!(ckt.recv_queue.window(), 0);
    }

    #[test]
    fn test_flush_interval_bounds() {
        let mut ckt = Circuit::new(1, PASSPHRASE, Side::Client);
        for dead in [0u32, 1, 5, 19, 40, 1000] {
            ckt.dead_cycles = dead;
            let iv = ckt.flush_interval();
            assert!(iv >= Duration::from_millis(100));
            assert!(iv < Duration::from_millis(FLUSH_CEILING_MS + 100));
        }
    }

    #[test]
    fn test_axe_exceeds_any_flush_interval() {
        let mut ckt = Circuit::new(1, PASSPHRASE, Side::Server);
        ckt.dead_cycles = u32::MAX;
        assert!(ckt.axe_interval() > Duration::from_millis(FLUSH_CEILING_MS + 100));
    }
}
