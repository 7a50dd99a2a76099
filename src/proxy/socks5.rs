//! SOCKS5 wire codec
//!
//! Both halves of the protocol live here: the client handshake used by the
//! proxy dialer, and the server handshake used by the dynamic forward's
//! embedded SOCKS5 server. Constants, address framing, and replies are
//! written once and shared.

use std::net::Ipv4Addr;

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::error::{Error, Result};

pub const VERSION: u8 = 0x05;
pub const AUTH_NONE: u8 = 0x00;
pub const AUTH_USERPASS: u8 = 0x02;
pub const AUTH_NO_ACCEPTABLE: u8 = 0xFF;
pub const AUTH_SUBNEG_VERSION: u8 = 0x01;
pub const CMD_CONNECT: u8 = 0x01;
pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;
pub const REP_SUCCESS: u8 = 0x00;
pub const REP_GENERAL_FAILURE: u8 = 0x01;
pub const REP_CMD_NOT_SUPPORTED: u8 = 0x07;
pub const REP_ADDR_NOT_SUPPORTED: u8 = 0x08;

/// Map a non-zero reply status to a dial error carrying the code verbatim.
fn reply_error(code: u8) -> Error {
    let reason = match code {
        0x01 => "general SOCKS server failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown failure",
    };
    Error::Dial(format!("SOCKS5 connect rejected: {} (status {})", reason, code))
}

/// Encode the CONNECT request for a target.
///
/// IPv4 literals use ATYP 0x01 with raw octets; everything else, including
/// IPv6 literals, is sent as a domain string (ATYP 0x03).
pub fn encode_connect_request(host: &str, port: u16) -> Result<Vec<u8>> {
    let mut buf = BytesMut::with_capacity(7 + host.len());
    buf.put_slice(&[VERSION, CMD_CONNECT, 0x00]);

    if let Ok(ip) = host.parse::<Ipv4Addr>() {
        buf.put_u8(ATYP_IPV4);
        buf.put_slice(&ip.octets());
    } else {
        if host.len() > 255 {
            return Err(Error::Configuration(format!(
                "SOCKS5 domain too long ({} bytes): {}",
                host.len(),
                host
            )));
        }
        buf.put_u8(ATYP_DOMAIN);
        buf.put_u8(host.len() as u8);
        buf.put_slice(host.as_bytes());
    }

    buf.put_u16(port);
    Ok(buf.to_vec())
}

/// Run the client side of the SOCKS5 handshake on `stream`.
///
/// On success the stream is positioned past the proxy handshake, ready for
/// the next protocol layer. Any malformed frame or fatal reply fails the
/// dial; the caller drops the stream.
pub async fn client_handshake<S>(
    stream: &mut S,
    credentials: Option<(&str, &str)>,
    target_host: &str,
    target_port: u16,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Greeting: offer no-auth, plus username/password when we have it
    let greeting: &[u8] = if credentials.is_some() {
        &[VERSION, 2, AUTH_NONE, AUTH_USERPASS]
    } else {
        &[VERSION, 1, AUTH_NONE]
    };
    stream
        .write_all(greeting)
        .await
        .map_err(|e| Error::Dial(format!("Failed to send SOCKS5 greeting: {}", e)))?;

    let mut method = [0u8; 2];
    stream
        .read_exact(&mut method)
        .await
        .map_err(|e| Error::Dial(format!("Failed to read SOCKS5 method selection: {}", e)))?;

    if method[0] != VERSION {
        return Err(Error::Protocol(format!(
            "Unexpected SOCKS version in method selection: {}",
            method[0]
        )));
    }

    match method[1] {
        AUTH_NONE => {}
        AUTH_USERPASS => {
            let (user, pass) = credentials.ok_or_else(|| {
                Error::Dial("SOCKS5 proxy requires authentication, none supplied".into())
            })?;
            authenticate_userpass(stream, user, pass).await?;
        }
        AUTH_NO_ACCEPTABLE => {
            return Err(Error::Dial(
                "SOCKS5 proxy accepted no offered auth method".into(),
            ));
        }
        other => {
            return Err(Error::Protocol(format!(
                "SOCKS5 proxy selected unsupported auth method: {:#04x}",
                other
            )));
        }
    }

    // Connect request
    let request = encode_connect_request(target_host, target_port)?;
    stream
        .write_all(&request)
        .await
        .map_err(|e| Error::Dial(format!("Failed to send SOCKS5 request: {}", e)))?;

    // Reply header: VER | REP | RSV | ATYP
    let mut head = [0u8; 4];
    stream
        .read_exact(&mut head)
        .await
        .map_err(|e| Error::Dial(format!("Failed to read SOCKS5 reply: {}", e)))?;

    if head[0] != VERSION {
        return Err(Error::Protocol(format!(
            "Unexpected SOCKS version in reply: {}",
            head[0]
        )));
    }
    if head[1] != REP_SUCCESS {
        return Err(reply_error(head[1]));
    }

    // Consume the bound address so the stream is positioned for the tunnel
    let addr_len = match head[3] {
        ATYP_IPV4 => 4usize,
        ATYP_IPV6 => 16,
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream
                .read_exact(&mut len)
                .await
                .map_err(|e| Error::Dial(format!("Failed to read SOCKS5 bound domain: {}", e)))?;
            len[0] as usize
        }
        other => {
            return Err(Error::Protocol(format!(
                "Unsupported address type in SOCKS5 reply: {}",
                other
            )));
        }
    };
    let mut bound = vec![0u8; addr_len + 2];
    stream
        .read_exact(&mut bound)
        .await
        .map_err(|e| Error::Dial(format!("Failed to read SOCKS5 bound address: {}", e)))?;

    debug!("SOCKS5 tunnel to {}:{} established", target_host, target_port);
    Ok(())
}

/// Username/password subnegotiation (RFC 1929)
async fn authenticate_userpass<S>(stream: &mut S, user: &str, pass: &str) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if user.len() > 255 || pass.len() > 255 {
        return Err(Error::Configuration(
            "SOCKS5 username/password exceed 255 bytes".into(),
        ));
    }

    let mut frame = BytesMut::with_capacity(3 + user.len() + pass.len());
    frame.put_u8(AUTH_SUBNEG_VERSION);
    frame.put_u8(user.len() as u8);
    frame.put_slice(user.as_bytes());
    frame.put_u8(pass.len() as u8);
    frame.put_slice(pass.as_bytes());

    stream
        .write_all(&frame)
        .await
        .map_err(|e| Error::Dial(format!("Failed to send SOCKS5 auth: {}", e)))?;

    let mut reply = [0u8; 2];
    stream
        .read_exact(&mut reply)
        .await
        .map_err(|e| Error::Dial(format!("Failed to read SOCKS5 auth reply: {}", e)))?;

    if reply[1] != 0x00 {
        return Err(Error::Authentication(format!(
            "SOCKS5 proxy rejected credentials (status {})",
            reply[1]
        )));
    }
    Ok(())
}

/// Outcome of parsing a server-side CONNECT request
pub struct ConnectRequest {
    pub host: String,
    pub port: u16,
}

/// Run the server side of the SOCKS5 handshake: greeting and method
/// selection. Only no-auth is offered to dynamic-forward clients.
pub async fn serve_greeting<S>(stream: &mut S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut head = [0u8; 2];
    stream
        .read_exact(&mut head)
        .await
        .map_err(|e| Error::Protocol(format!("Failed to read SOCKS5 greeting: {}", e)))?;

    if head[0] != VERSION {
        return Err(Error::Protocol(format!(
            "Unsupported SOCKS version: {}",
            head[0]
        )));
    }

    let nmethods = head[1] as usize;
    let mut methods = vec![0u8; nmethods];
    stream
        .read_exact(&mut methods)
        .await
        .map_err(|e| Error::Protocol(format!("Failed to read auth methods: {}", e)))?;

    if !methods.contains(&AUTH_NONE) {
        stream.write_all(&[VERSION, AUTH_NO_ACCEPTABLE]).await.ok();
        return Err(Error::Protocol(
            "SOCKS5 client does not offer the no-auth method".into(),
        ));
    }

    stream
        .write_all(&[VERSION, AUTH_NONE])
        .await
        .map_err(|e| Error::Protocol(format!("Failed to send method selection: {}", e)))?;
    Ok(())
}

/// Parse the client's CONNECT request. IPv4 and domain address types only;
/// anything else is refused with the matching reply code before erroring.
pub async fn serve_connect_request<S>(stream: &mut S) -> Result<ConnectRequest>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut head = [0u8; 4];
    stream
        .read_exact(&mut head)
        .await
        .map_err(|e| Error::Protocol(format!("Failed to read SOCKS5 request: {}", e)))?;

    if head[0] != VERSION {
        return Err(Error::Protocol("Invalid SOCKS5 version in request".into()));
    }
    if head[1] != CMD_CONNECT {
        send_server_reply(stream, REP_CMD_NOT_SUPPORTED).await?;
        return Err(Error::Protocol(format!(
            "Unsupported SOCKS5 command: {}",
            head[1]
        )));
    }

    let (host, port) = match head[3] {
        ATYP_IPV4 => {
            let mut buf = [0u8; 6];
            stream
                .read_exact(&mut buf)
                .await
                .map_err(|e| Error::Protocol(format!("Failed to read IPv4 address: {}", e)))?;
            let ip = Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3]);
            let port = u16::from_be_bytes([buf[4], buf[5]]);
            (ip.to_string(), port)
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream
                .read_exact(&mut len)
                .await
                .map_err(|e| Error::Protocol(format!("Failed to read domain length: {}", e)))?;
            let mut buf = vec![0u8; len[0] as usize + 2];
            stream
                .read_exact(&mut buf)
                .await
                .map_err(|e| Error::Protocol(format!("Failed to read domain: {}", e)))?;
            let domain = String::from_utf8_lossy(&buf[..len[0] as usize]).to_string();
            let port = u16::from_be_bytes([buf[len[0] as usize], buf[len[0] as usize + 1]]);
            (domain, port)
        }
        other => {
            send_server_reply(stream, REP_ADDR_NOT_SUPPORTED).await?;
            return Err(Error::Protocol(format!(
                "Unsupported address type: {}",
                other
            )));
        }
    };

    Ok(ConnectRequest { host, port })
}

/// Send a server reply. The bound address is always reported as 0.0.0.0:0.
pub async fn send_server_reply<S>(stream: &mut S, status: u8) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // VER | REP | RSV | ATYP | BND.ADDR | BND.PORT
    let reply = [VERSION, status, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0];
    stream
        .write_all(&reply)
        .await
        .map_err(|e| Error::Protocol(format!("Failed to send SOCKS5 reply: {}", e)))
}
