//! Transport configuration.
//!
//! A configuration is built once from command-line style arguments and is
//! immutable afterwards:
//!
//! ```text
//! <mode> <up_address> (<down_address> <steg>)...
//!     mode ~ client|socks|server
//!     up_address, down_address ~ host:port
//! ```
//!
//! A steganographer name is required for each downstream address. The
//! downstream list is required in socks mode as well.

use std::net::{SocketAddr, ToSocketAddrs};

use crate::crypto::Side;
use crate::error::{Error, Result};
use crate::steg;

/// Default listen port for plain client mode.
pub const DEFAULT_CLIENT_PORT: u16 = 48988;
/// Default listen port for socks client mode.
pub const DEFAULT_SOCKS_PORT: u16 = 23548;
/// Default listen port for server mode.
pub const DEFAULT_SERVER_PORT: u16 = 11253;

/// Operating mode of one transport endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Accept plain TCP upstreams locally, dial cover connections outward.
    Client,
    /// Accept SOCKS5 upstreams locally, dial cover connections outward.
    SocksClient,
    /// Accept cover connections, dial the upstream service.
    Server,
}

impl Mode {
    /// Which end of the key schedule this mode uses.
    pub fn side(self) -> Side {
        match self {
            Mode::Client | Mode::SocksClient => Side::Client,
            Mode::Server => Side::Server,
        }
    }

    /// True in server mode.
    pub fn is_server(self) -> bool {
        self == Mode::Server
    }
}

/// One downstream target: where its carrier connects and which
/// steganography module hides blocks in it.
#[derive(Debug, Clone)]
pub struct DownstreamTarget {
    /// Listen address (server) or dial address (client).
    pub addr: SocketAddr,
    /// Registered steganography module name.
    pub steg: String,
}

/// Immutable configuration for one transport endpoint.
#[derive(Debug, Clone)]
pub struct Config {
    /// Operating mode.
    pub mode: Mode,
    /// The cleartext side: listen address on clients, dial address on servers.
    pub up_addr: SocketAddr,
    /// Ordered downstream targets, one steganographer each.
    pub downstreams: Vec<DownstreamTarget>,
}

impl Config {
    /// Parse a configuration from positional arguments.
    pub fn from_args<S: AsRef<str>>(args: &[S]) -> Result<Self> {
        if args.len() < 3 {
            return Err(Error::config(format!("not enough parameters\n{}", USAGE)));
        }

        let mode = match args[0].as_ref() {
            "client" => Mode::Client,
            "socks" => Mode::SocksClient,
            "server" => Mode::Server,
            other => {
                return Err(Error::config(format!("unknown mode '{}'\n{}", other, USAGE)))
            }
        };

        let default_port = match mode {
            Mode::Client => DEFAULT_CLIENT_PORT,
            Mode::SocksClient => DEFAULT_SOCKS_PORT,
            Mode::Server => DEFAULT_SERVER_PORT,
        };

        let up_addr = resolve_addr(args[1].as_ref(), Some(default_port)).map_err(|e| {
            Error::config(format!("invalid up address '{}': {}", args[1].as_ref(), e))
        })?;

        // From here on out, arguments alternate between downstream
        // addresses and steganographer names. Downstream addresses must
        // carry an explicit port.
        let mut downstreams = Vec::new();
        let mut rest = args[2..].iter();
        while let Some(addr_arg) = rest.next() {
            let addr = resolve_addr(addr_arg.as_ref(), None).map_err(|e| {
                Error::config(format!(
                    "invalid down address '{}': {}",
                    addr_arg.as_ref(),
                    e
                ))
            })?;

            let steg_name = rest.next().ok_or_else(|| {
                Error::config(format!(
                    "missing steganographer for {}\n{}",
                    addr_arg.as_ref(),
                    USAGE
                ))
            })?;

            if !steg::is_supported(steg_name.as_ref()) {
                return Err(Error::config(format!(
                    "steganographer '{}' not supported",
                    steg_name.as_ref()
                )));
            }

            downstreams.push(DownstreamTarget {
                addr,
                steg: steg_name.as_ref().to_owned(),
            });
        }

        Ok(Config {
            mode,
            up_addr,
            downstreams,
        })
    }
}

/// Usage text shown on configuration errors.
pub const USAGE: &str = "\
chopstream syntax:
\tchopstream <mode> <up_address> (<down_address> <steg>)...
\t\tmode ~ server|client|socks
\t\tup_address, down_address ~ host:port
\t\tA steganographer is required for each down_address.
\t\tThe down_address list is still required in socks mode.
Examples:
\tchopstream client 127.0.0.1:5000 192.168.1.99:11253 nosteg
\tchopstream server 127.0.0.1:9005 192.168.1.99:11253 nosteg";

/// Resolve a `host:port` string. When a default port is given, a bare
/// `host` is accepted too; otherwise the port is mandatory.
fn resolve_addr(s: &str, default_port: Option<u16>) -> std::io::Result<SocketAddr> {
    let attempt = |addr: &str| -> std::io::Result<Option<SocketAddr>> {
        Ok(addr.to_socket_addrs()?.next())
    };

    let resolved = match (attempt(s), default_port) {
        (Ok(found), _) => found,
        // No port given: retry with the mode's default.
        (Err(_), Some(port)) => attempt(&format!("{}:{}", s, port))?,
        (Err(e), None) => return Err(e),
    };

    resolved.ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::AddrNotAvailable, "no usable address")
    })
}
