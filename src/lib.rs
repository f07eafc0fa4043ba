//! # chopstream
//!
//! A pluggable circumvention transport: one logical byte stream (the
//! upstream) is multiplexed across many concurrent, short-lived cover
//! connections (the downstreams), each carrying encrypted framed blocks
//! embedded in innocuous-looking carriers. A censored client talks to an
//! uncensored server through an observer who sees only ordinary traffic,
//! with end-to-end reliability, confidentiality, authenticity, and flow
//! control preserved.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │            Upstream (cleartext user traffic)              │
//! ├───────────────────────────────────────────────────────────┤
//! │  Chopper engine (framing, reassembly, circuit lifecycle)  │
//! ├───────────────────────────────────────────────────────────┤
//! │  Block crypto (AES-ECB header / AES-GCM body, PBKDF2+HKDF)│
//! ├───────────────────────────────────────────────────────────┤
//! │  Steganography modules (carrier encode/decode, room)      │
//! ├───────────────────────────────────────────────────────────┤
//! │  Cover connections (many short-lived TCP downstreams)     │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! The protocol engine ([`chop::Engine`]) is a deterministic state
//! machine, free of I/O; the [`net`] module binds it to tokio sockets and
//! timers. Steganography modules plug in through the [`steg::Steg`]
//! capability and never see protocol internals.
//!
//! ## Modes
//!
//! An endpoint runs in one of three modes: `client` (accept plain TCP
//! locally), `socks` (accept SOCKS5 locally; the requested destination is
//! ignored, traffic goes to the configured peer), or `server` (accept
//! cover connections, dial the protected service).

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod chop;
pub mod config;
pub mod crypto;
pub mod error;
pub mod net;
pub mod steg;

pub use config::{Config, Mode};
pub use error::{Error, Result};
