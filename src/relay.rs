use crate::error::{ProxyError, ProxyResult};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Per-direction copy buffer
const RELAY_BUFFER_SIZE: usize = 16_384;

/// Written to the client once the upstream has finished sending.
///
/// By then the stream is opaque tunnel bytes, so this is a diagnostic only.
pub const UPSTREAM_END_LINE: &[u8] = b"HTTP/1.1 500 External Server End\r\n";

/// Bytes moved through a finished tunnel
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    pub from_client: u64,
    pub from_upstream: u64,
}

#[derive(Debug)]
enum Finish {
    Eof,
    Cancelled,
    ReadError(io::Error),
    WriteError(io::Error),
}

/// Copy from `reader` to `writer` until end-of-stream, an error, or `abort`.
async fn pump<R, W>(reader: &mut R, writer: &mut W, abort: &CancellationToken) -> (u64, Finish)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let n = tokio::select! {
            res = reader.read(&mut buf) => match res {
                Ok(0) => return (total, Finish::Eof),
                Ok(n) => n,
                Err(e) => return (total, Finish::ReadError(e)),
            },
            _ = abort.cancelled() => return (total, Finish::Cancelled),
        };

        tokio::select! {
            res = writer.write_all(&buf[..n]) => {
                if let Err(e) = res {
                    return (total, Finish::WriteError(e));
                }
            }
            _ = abort.cancelled() => return (total, Finish::Cancelled),
        }
        total += n as u64;
    }
}

/// Splice bytes between an established client and upstream until both
/// directions are done.
///
/// The two directions run concurrently and end independently:
/// - client EOF half-closes the upstream; upstream-to-client keeps flowing.
/// - upstream EOF writes [`UPSTREAM_END_LINE`] to the client and closes its
///   write side; client-to-upstream keeps flowing.
/// - an I/O error on either side stops both directions. Upstream read errors
///   are reported to the client as a best-effort `500 <error>` line.
/// - cancelling `cancel` stops both directions immediately.
///
/// Both sockets are dropped, and therefore closed, on return.
pub async fn relay<C, U>(
    client: C,
    upstream: U,
    cancel: &CancellationToken,
) -> ProxyResult<RelayStats>
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);
    let abort = cancel.child_token();

    let outbound = async {
        let (n, finish) = pump(&mut client_read, &mut upstream_write, &abort).await;
        let result = match finish {
            Finish::Eof => {
                trace!("client finished sending, half-closing upstream");
                upstream_write.shutdown().await.ok();
                Ok(())
            }
            Finish::Cancelled => Ok(()),
            Finish::ReadError(e) => {
                debug!("Tunnel client read error: {}", e);
                abort.cancel();
                upstream_write.shutdown().await.ok();
                Err(e)
            }
            Finish::WriteError(e) => {
                debug!("Tunnel upstream write error: {}", e);
                abort.cancel();
                Err(e)
            }
        };
        (n, result)
    };

    let inbound = async {
        let (n, finish) = pump(&mut upstream_read, &mut client_write, &abort).await;
        let result = match finish {
            Finish::Eof => {
                trace!("upstream finished sending, closing client");
                client_write.write_all(UPSTREAM_END_LINE).await.ok();
                client_write.shutdown().await.ok();
                Ok(())
            }
            Finish::Cancelled => Ok(()),
            Finish::ReadError(e) => {
                debug!("Tunnel upstream read error: {}", e);
                abort.cancel();
                let line = format!("HTTP/1.1 500 {}\r\n", e);
                client_write.write_all(line.as_bytes()).await.ok();
                client_write.shutdown().await.ok();
                Err(e)
            }
            Finish::WriteError(e) => {
                debug!("Tunnel client write error: {}", e);
                abort.cancel();
                Err(e)
            }
        };
        (n, result)
    };

    let ((from_client, outbound), (from_upstream, inbound)) = tokio::join!(outbound, inbound);
    if cancel.is_cancelled() {
        trace!("tunnel cancelled after {}↑ {}↓ bytes", from_client, from_upstream);
    }

    outbound.and(inbound).map_err(ProxyError::RelayError)?;
    Ok(RelayStats {
        from_client,
        from_upstream,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_bytes_flow_unmodified_both_ways() {
        let (mut client, client_side) = duplex(64 * 1024);
        let (upstream_side, mut upstream) = duplex(64 * 1024);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(async move { relay(client_side, upstream_side, &cancel).await });

        let payload: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
        client.write_all(&payload).await.unwrap();
        let mut received = vec![0u8; payload.len()];
        upstream.read_exact(&mut received).await.unwrap();
        assert_eq!(received, payload);

        upstream.write_all(b"\x16\x03\x01 server hello").await.unwrap();
        let mut reply = [0u8; 16];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"\x16\x03\x01 server hello");

        client.shutdown().await.unwrap();
        upstream.shutdown().await.unwrap();
        let stats = task.await.unwrap().unwrap();
        assert_eq!(
            stats,
            RelayStats {
                from_client: 4096,
                from_upstream: 16
            }
        );
    }

    #[tokio::test]
    async fn test_client_half_close_keeps_upstream_direction_open() {
        let (mut client, client_side) = duplex(64 * 1024);
        let (upstream_side, mut upstream) = duplex(64 * 1024);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(async move { relay(client_side, upstream_side, &cancel).await });

        client.write_all(b"request").await.unwrap();
        client.shutdown().await.unwrap();

        let mut seen = Vec::new();
        upstream.read_to_end(&mut seen).await.unwrap();
        assert_eq!(seen, b"request");

        // The other direction is still usable after the client's EOF.
        upstream.write_all(b"late response").await.unwrap();
        let mut reply = [0u8; 13];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"late response");

        upstream.shutdown().await.unwrap();
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_upstream_end_sends_diagnostic_line() {
        let (mut client, client_side) = duplex(64 * 1024);
        let (upstream_side, mut upstream) = duplex(64 * 1024);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(async move { relay(client_side, upstream_side, &cancel).await });

        upstream.write_all(b"bye").await.unwrap();
        upstream.shutdown().await.unwrap();

        let mut seen = Vec::new();
        client.read_to_end(&mut seen).await.unwrap();
        let mut expected = b"bye".to_vec();
        expected.extend_from_slice(UPSTREAM_END_LINE);
        assert_eq!(seen, expected);

        client.shutdown().await.unwrap();
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_cancel_closes_both_sides() {
        let (mut client, client_side) = duplex(64 * 1024);
        let (upstream_side, mut upstream) = duplex(64 * 1024);
        let cancel = CancellationToken::new();
        let relay_cancel = cancel.clone();
        let task =
            tokio::spawn(async move { relay(client_side, upstream_side, &relay_cancel).await });

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        upstream.read_exact(&mut buf).await.unwrap();

        cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("relay should stop once cancelled")
            .unwrap();
        assert_eq!(result.unwrap().from_client, 4);

        let mut rest = Vec::new();
        assert_eq!(client.read_to_end(&mut rest).await.unwrap(), 0);
        assert_eq!(upstream.read_to_end(&mut rest).await.unwrap(), 0);
    }
}
