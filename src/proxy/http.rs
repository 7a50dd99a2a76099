//! HTTP CONNECT proxy client

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tracing::debug;

use crate::error::{Error, Result};

/// Refuse to buffer unbounded header data from a misbehaving proxy.
const MAX_RESPONSE_HEADER: usize = 16 * 1024;

/// Run the CONNECT handshake on `stream`.
///
/// Returns any bytes received after the header terminator in the same
/// reads: those already belong to the tunnelled protocol and must be
/// replayed ahead of the stream (see [`ReplayStream`]).
pub async fn client_handshake<S>(
    stream: &mut S,
    credentials: Option<(&str, &str)>,
    target_host: &str,
    target_port: u16,
) -> Result<Vec<u8>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut request = format!(
        "CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n",
        host = target_host,
        port = target_port
    );
    if let Some((user, pass)) = credentials {
        let token = BASE64.encode(format!("{}:{}", user, pass));
        request.push_str(&format!("Proxy-Authorization: Basic {}\r\n", token));
    }
    request.push_str("\r\n");

    stream
        .write_all(request.as_bytes())
        .await
        .map_err(|e| Error::Dial(format!("Failed to send CONNECT request: {}", e)))?;

    // Accumulate until the header terminator
    let mut response: Vec<u8> = Vec::with_capacity(256);
    let mut buf = [0u8; 1024];
    let header_end = loop {
        let n = stream
            .read(&mut buf)
            .await
            .map_err(|e| Error::Dial(format!("Failed to read CONNECT response: {}", e)))?;
        if n == 0 {
            return Err(Error::Dial(
                "Proxy closed the connection before completing CONNECT".into(),
            ));
        }
        response.extend_from_slice(&buf[..n]);

        if let Some(pos) = find_terminator(&response) {
            break pos;
        }
        if response.len() > MAX_RESPONSE_HEADER {
            return Err(Error::Protocol(
                "CONNECT response header exceeds 16 KiB".into(),
            ));
        }
    };

    let header = String::from_utf8_lossy(&response[..header_end]);
    let status_line = header.lines().next().unwrap_or("").trim().to_string();

    let status_code = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| {
            Error::Protocol(format!("Malformed CONNECT status line: {:?}", status_line))
        })?;

    if status_code != 200 {
        return Err(Error::Dial(format!(
            "Proxy refused CONNECT: {}",
            status_line
        )));
    }

    debug!(
        "HTTP CONNECT tunnel to {}:{} established",
        target_host, target_port
    );

    // Whatever follows the terminator is tunnel payload
    Ok(response[header_end + 4..].to_vec())
}

fn find_terminator(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Stream wrapper that replays buffered bytes before reading from the
/// inner stream. Writes pass straight through.
pub struct ReplayStream<S> {
    prefix: Vec<u8>,
    pos: usize,
    inner: S,
}

impl<S> ReplayStream<S> {
    pub fn new(prefix: Vec<u8>, inner: S) -> Self {
        Self {
            prefix,
            pos: 0,
            inner,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for ReplayStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.pos < self.prefix.len() {
            let remaining = &self.prefix[self.pos..];
            let n = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..n]);
            self.pos += n;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for ReplayStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connect_sends_host_header_and_succeeds_on_200() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        let server_task = tokio::spawn(async move {
            let mut buf = vec![0u8; 1024];
            let n = server.read(&mut buf).await.unwrap();
            let req = String::from_utf8_lossy(&buf[..n]).to_string();
            assert!(req.starts_with("CONNECT gateway.internal:8443 HTTP/1.1\r\n"));
            assert!(req.contains("Host: gateway.internal:8443\r\n"));
            assert!(!req.contains("Proxy-Authorization"));
            server
                .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                .await
                .unwrap();
        });

        let leftover = client_handshake(&mut client, None, "gateway.internal", 8443)
            .await
            .unwrap();
        assert!(leftover.is_empty());
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn connect_sends_basic_auth_header() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        let server_task = tokio::spawn(async move {
            let mut buf = vec![0u8; 1024];
            let n = server.read(&mut buf).await.unwrap();
            let req = String::from_utf8_lossy(&buf[..n]).to_string();
            // base64("alice:s3cret")
            assert!(req.contains("Proxy-Authorization: Basic YWxpY2U6czNjcmV0\r\n"));
            server.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await.unwrap();
        });

        client_handshake(&mut client, Some(("alice", "s3cret")), "h", 80)
            .await
            .unwrap();
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn connect_fails_with_status_line_detail() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        tokio::spawn(async move {
            let mut buf = vec![0u8; 1024];
            let _ = server.read(&mut buf).await.unwrap();
            server
                .write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n")
                .await
                .unwrap();
        });

        let err = client_handshake(&mut client, None, "h", 80).await.unwrap_err();
        assert!(matches!(err, Error::Dial(_)));
        assert!(err.to_string().contains("407 Proxy Authentication Required"));
    }

    #[tokio::test]
    async fn post_terminator_bytes_are_returned_and_replayed() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        tokio::spawn(async move {
            let mut buf = vec![0u8; 1024];
            let _ = server.read(&mut buf).await.unwrap();
            // Header terminator and early tunnel bytes in one write
            server
                .write_all(b"HTTP/1.1 200 OK\r\n\r\nSSH-2.0-OpenSSH_9.6\r\n")
                .await
                .unwrap();
        });

        let leftover = client_handshake(&mut client, None, "h", 22).await.unwrap();
        assert_eq!(leftover, b"SSH-2.0-OpenSSH_9.6\r\n");

        let mut replay = ReplayStream::new(leftover, client);
        let mut banner = vec![0u8; 21];
        replay.read_exact(&mut banner).await.unwrap();
        assert_eq!(&banner, b"SSH-2.0-OpenSSH_9.6\r\n");
    }
}
