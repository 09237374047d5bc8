//! Forwarding relay streams to the local target

use std::time::Duration;

use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use sr_transport::{run_pair, MuxStream};

/// Connect `stream` to `target` and relay until either side ends.
///
/// If the target cannot be reached the stream is dropped, which the relay's
/// client observes as end of data.
pub async fn forward_stream(
    cancel: &CancellationToken,
    stream: MuxStream,
    target: &str,
    idle_timeout: Duration,
) {
    let conn = tokio::select! {
        _ = cancel.cancelled() => return,
        conn = TcpStream::connect(target) => match conn {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!("Failed to connect to target {}: {}", target, e);
                return;
            }
        },
    };

    let report = run_pair(cancel, stream, conn, idle_timeout).await;
    match &report.error {
        None => tracing::debug!(
            "Forward to {} done ({} bytes in, {} out)",
            target,
            report.upstream_bytes,
            report.downstream_bytes
        ),
        Some(e) => tracing::debug!("Forward to {} ended with error: {}", target, e),
    }
}
