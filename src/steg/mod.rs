//! Steganography capability.
//!
//! The protocol engine never looks inside a carrier; it consumes only this
//! capability: how much room the next carrier offers, "hide this block",
//! and "extract whatever is hidden in these carrier bytes". Modules talk
//! back to the owning connection through [`StegHints`], which the engine
//! applies after every call.

mod nosteg;
mod nosteg_rr;

use bytes::BytesMut;

use crate::crypto::Side;
use crate::error::{Error, Result};

/// Outcome of draining carriers from a connection's inbound buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvStatus {
    /// All complete carriers were decoded.
    Good,
    /// A carrier is only partially present; more bytes are needed.
    Incomplete,
    /// The carrier stream is malformed beyond recovery.
    Bad,
}

/// Behavior hints a module raises for the connection that owns it.
#[derive(Debug, Default)]
pub struct StegHints {
    /// No further data will arrive from the peer on this connection.
    pub expect_close: bool,
    /// No further data may be written to the peer on this connection.
    pub cease_transmission: bool,
    /// If nothing is transmitted within this many milliseconds, the
    /// connection must make up a transmission (cover protocols with
    /// mandatory replies).
    pub transmit_soon: Option<u64>,
}

/// One steganography module instance, bound to a single connection.
pub trait Steg: Send {
    /// Module name, for configuration echo and logging.
    fn name(&self) -> &'static str;

    /// Upper bound on total block bytes that fit in the next carrier this
    /// module would emit right now. May be 0.
    fn transmit_room(&self) -> usize;

    /// Embed a complete framed block into a carrier, appending the carrier
    /// bytes to `out`.
    fn transmit(&mut self, block: &[u8], out: &mut BytesMut, hints: &mut StegHints) -> Result<()>;

    /// Drain as many whole carriers as possible from `inbound`, appending
    /// the hidden bytes they carry to `extracted`.
    fn receive(
        &mut self,
        inbound: &mut BytesMut,
        extracted: &mut BytesMut,
        hints: &mut StegHints,
    ) -> Result<RecvStatus>;
}

/// True if `name` names a module this build can instantiate.
pub fn is_supported(name: &str) -> bool {
    matches!(name, "nosteg" | "nosteg_rr")
}

/// Instantiate a module by name for one side of one connection.
pub fn create(name: &str, side: Side) -> Result<Box<dyn Steg>> {
    match name {
        "nosteg" => Ok(Box::new(nosteg::NoSteg::new())),
        "nosteg_rr" => Ok(Box::new(nosteg_rr::NoStegRr::new(side))),
        other => Err(Error::UnknownSteg(other.to_owned())),
    }
}
