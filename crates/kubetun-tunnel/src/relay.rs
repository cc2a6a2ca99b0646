//! Bidirectional copy between a local socket and a tunnel stream.
//!
//! EOF on either side half-closes the other. A reset on the stream or an
//! I/O error on the socket aborts both directions.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::frame::MAX_DATA_CHUNK;
use crate::stream::Stream;

/// Bytes moved by one relay, and why it ended if not cleanly.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Socket → stream.
    pub bytes_up: u64,
    /// Stream → socket.
    pub bytes_down: u64,
    /// Set when the relay was aborted instead of finishing on EOF.
    pub aborted: Option<String>,
}

/// Pump bytes both ways until both directions finish or one side aborts.
pub async fn relay<S>(socket: S, stream: Stream) -> RelayStats
where
    S: AsyncRead + AsyncWrite + Send,
{
    let id = stream.id();
    let (mut sock_r, mut sock_w) = tokio::io::split(socket);
    let (mut reader, mut writer) = stream.split();
    let cancel = CancellationToken::new();

    let up = async {
        let mut buf = vec![0u8; MAX_DATA_CHUNK];
        let mut total = 0u64;
        loop {
            let n = tokio::select! {
                r = sock_r.read(&mut buf) => r,
                _ = cancel.cancelled() => return (total, None),
            };
            match n {
                Ok(0) => {
                    writer.finish();
                    return (total, None);
                }
                Ok(n) => {
                    if let Err(e) = writer.write_all(&buf[..n]).await {
                        cancel.cancel();
                        return (total, Some(e.to_string()));
                    }
                    total += n as u64;
                }
                Err(e) => {
                    writer.reset("local socket error");
                    cancel.cancel();
                    return (total, Some(e.to_string()));
                }
            }
        }
    };

    let down = async {
        let mut total = 0u64;
        loop {
            let next = tokio::select! {
                r = reader.read() => r,
                _ = cancel.cancelled() => return (total, None),
            };
            match next {
                Ok(Some(chunk)) => {
                    if let Err(e) = sock_w.write_all(&chunk).await {
                        cancel.cancel();
                        return (total, Some(e.to_string()));
                    }
                    total += chunk.len() as u64;
                }
                Ok(None) => {
                    let _ = sock_w.shutdown().await;
                    return (total, None);
                }
                Err(e) => {
                    cancel.cancel();
                    return (total, Some(e.to_string()));
                }
            }
        }
    };

    let ((bytes_up, up_err), (bytes_down, down_err)) = tokio::join!(up, down);
    let aborted = up_err.or(down_err);
    if let Some(reason) = &aborted {
        writer.reset(reason);
    }
    debug!(stream = id, bytes_up, bytes_down, aborted = ?aborted, "relay finished");
    RelayStats {
        bytes_up,
        bytes_down,
        aborted,
    }
}
