//! Upstream streaming for protocol switches.
//!
//! After a 101 response the connection becomes an opaque bidirectional
//! byte stream (`kubectl exec` stdin, for example). This task pumps the
//! relay's per-request stream endpoint into the backend's write side. The
//! relay offers no ordered, resumable upstream delivery, so any failure is
//! terminal for this direction.

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::relay::RelayChannel;

/// Repeatedly pulls upstream bytes from the relay and writes them into the
/// backend. On return the write side is shut down; that forces the backend
/// to finish its own response stream, which lets the response chunker
/// drain and complete.
pub(crate) async fn stream_to_backend<W>(relay: RelayChannel, id: String, mut writer: W)
where
    W: AsyncWrite + Unpin,
{
    loop {
        match relay.pull_request_stream(&id).await {
            Ok(Some(data)) => {
                if let Err(err) = writer.write_all(&data).await {
                    warn!(id = %id, error = %err, "Failed to write to backend");
                    break;
                }
                debug!(id = %id, bytes = data.len(), "Wrote request stream bytes to backend");
            }
            Ok(None) => {
                debug!(id = %id, "End of request stream");
                break;
            }
            Err(err) => {
                warn!(id = %id, error = %err, "Failed to get request stream");
                break;
            }
        }
    }

    if let Err(err) = writer.shutdown().await {
        debug!(id = %id, error = %err, "Backend write side already closed");
    }
}
