//! Reassembly queue.
//!
//! A 256-element circular buffer of received blocks, mirroring the
//! 256-element sliding window of sequence numbers that may legitimately be
//! received at any time. Delivery is in strict sequence order; a gap
//! blocks everything behind it.

use bytes::Bytes;

/// Number of slots, equal to the width of the acceptance window.
const QUEUE_SLOTS: usize = 256;

/// One received block awaiting delivery: its opcode byte and data section.
#[derive(Debug)]
pub struct QueuedBlock {
    /// Raw opcode byte from the header.
    pub op: u8,
    /// The data section (padding already stripped). May be empty.
    pub data: Bytes,
}

/// Circular reassembly buffer keyed by sequence number.
pub struct ReassemblyQueue {
    slots: [Option<QueuedBlock>; QUEUE_SLOTS],
    next_to_process: u32,
}

impl ReassemblyQueue {
    /// An empty queue expecting sequence number 0.
    pub fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| None),
            next_to_process: 0,
        }
    }

    /// The current lowest acceptable sequence number. This is the value to
    /// pass to header validation.
    pub fn window(&self) -> u32 {
        self.next_to_process
    }

    /// Insert a block at sequence number `seqno`. Returns false if the
    /// block is outside the acceptable window or duplicates a block
    /// already queued; both indicate protocol errors, and the payload is
    /// dropped either way.
    pub fn insert(&mut self, seqno: u32, op: u8, data: Bytes) -> bool {
        let offset = seqno.wrapping_sub(self.window());
        if offset > 255 {
            tracing::info!(seqno, window = self.window(), "block outside receive window");
            return false;
        }
        let pos = (self.next_to_process.wrapping_add(offset) & 0xFF) as usize;
        if self.slots[pos].is_some() {
            tracing::info!(seqno, "duplicate block");
            return false;
        }

        self.slots[pos] = Some(QueuedBlock { op, data });
        true
    }

    /// Remove and return the next block to be processed. Returns `None`
    /// when the next block in sequence has not yet arrived.
    pub fn remove_next(&mut self) -> Option<QueuedBlock> {
        let front = (self.next_to_process & 0xFF) as usize;
        let blk = self.slots[front].take()?;
        self.next_to_process = self.next_to_process.wrapping_add(1);
        Some(blk)
    }

    /// True if no blocks are waiting anywhere in the window.
    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(|s| s.is_none())
    }

    /// As the last step of a rekeying cycle, the expected next sequence
    /// number is reset to zero. All slots must already be empty.
    #[allow(dead_code)] // rekeying opcodes are reserved but unimplemented
    pub fn reset(&mut self) {
        debug_assert!(self.is_empty());
        self.next_to_process = 0;
    }
}
