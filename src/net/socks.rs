//! Minimal SOCKS5 front-end for socks mode.
//!
//! Accepts the no-authentication method and a CONNECT request, then hands
//! the socket over as an ordinary upstream. The requested destination is
//! noted and ignored: this transport multiplexes everything to its
//! configured peer, which is responsible for onward routing.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::{Error, Result};

const SOCKS_VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const CMD_CONNECT: u8 = 0x01;

const REP_SUCCESS: u8 = 0x00;
const REP_CMD_NOT_SUPPORTED: u8 = 0x07;
const REP_ATYP_NOT_SUPPORTED: u8 = 0x08;

/// Negotiate SOCKS5 on a freshly accepted local connection.
pub(super) async fn handshake(stream: &mut TcpStream) -> Result<()> {
    // Method selection: VER NMETHODS METHODS...
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).await?;
    if head[0] != SOCKS_VERSION {
        return Err(Error::protocol("not a SOCKS5 client"));
    }
    let mut methods = vec![0u8; head[1] as usize];
    stream.read_exact(&mut methods).await?;
    if !methods.contains(&METHOD_NO_AUTH) {
        stream.write_all(&[SOCKS_VERSION, 0xFF]).await?;
        return Err(Error::protocol("client requires authentication"));
    }
    stream.write_all(&[SOCKS_VERSION, METHOD_NO_AUTH]).await?;

    // Request: VER CMD RSV ATYP DST.ADDR DST.PORT
    let mut req = [0u8; 4];
    stream.read_exact(&mut req).await?;
    if req[1] != CMD_CONNECT {
        reply(stream, REP_CMD_NOT_SUPPORTED).await?;
        return Err(Error::protocol("only CONNECT is supported"));
    }

    let destination = match req[3] {
        // IPv4
        0x01 => {
            let mut addr = [0u8; 6];
            stream.read_exact(&mut addr).await?;
            format!(
                "{}.{}.{}.{}:{}",
                addr[0],
                addr[1],
                addr[2],
                addr[3],
                u16::from_be_bytes([addr[4], addr[5]])
            )
        }
        // Domain name
        0x03 => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut rest = vec![0u8; len[0] as usize + 2];
            stream.read_exact(&mut rest).await?;
            let port = u16::from_be_bytes([rest[rest.len() - 2], rest[rest.len() - 1]]);
            let host = String::from_utf8_lossy(&rest[..rest.len() - 2]).into_owned();
            format!("{host}:{port}")
        }
        // IPv6
        0x04 => {
            let mut addr = [0u8; 18];
            stream.read_exact(&mut addr).await?;
            let port = u16::from_be_bytes([addr[16], addr[17]]);
            format!("[ipv6]:{port}")
        }
        _ => {
            reply(stream, REP_ATYP_NOT_SUPPORTED).await?;
            return Err(Error::protocol("unsupported address type"));
        }
    };

    // The chop transport carries traffic to its configured peer; the
    // SOCKS destination is advisory only.
    tracing::debug!(%destination, "SOCKS destination ignored");

    reply(stream, REP_SUCCESS).await?;
    Ok(())
}

async fn reply(stream: &mut TcpStream, code: u8) -> Result<()> {
    // BND.ADDR/BND.PORT as zeroed IPv4.
    stream
        .write_all(&[SOCKS_VERSION, code, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
        .await?;
    Ok(())
}
