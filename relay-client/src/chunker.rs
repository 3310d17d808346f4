//! Response chunking pipeline: a reader task turns the backend body into a
//! stream of byte blocks, and a collator task coalesces blocks into wire
//! chunks.
//!
//! The collator covers three regimes: fast data is split at
//! `max_chunk_size`, trickling data is flushed on a timer, and a silent
//! backend produces periodic empty keep-alive chunks so the relay does not
//! time the response stream out.

use std::mem;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use http_body_util::BodyExt;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, warn};

use crate::wire;

/// An empty chunk goes out after this many consecutive timer expiries.
pub(crate) const KEEPALIVE_TIMEOUTS: u32 = 30;

/// Backend response trailers, shared between the reader (which fills them
/// in at body EOF) and the posting loop (which snapshots them into the
/// terminal chunk). The two never run at the same point in time: trailers
/// are read only after the body has drained.
#[derive(Clone, Default)]
pub(crate) struct Trailers(Arc<Mutex<http::HeaderMap>>);

impl Trailers {
    pub(crate) fn merge(&self, map: http::HeaderMap) {
        let mut slot = self.0.lock().unwrap_or_else(|err| err.into_inner());
        slot.extend(map);
    }

    pub(crate) fn snapshot(&self) -> Vec<wire::HttpHeader> {
        let slot = self.0.lock().unwrap_or_else(|err| err.into_inner());
        wire::headers_from_map(&slot)
    }
}

/// Reads the backend response body frame by frame, slicing data into
/// blocks of at most `block_size` bytes. Trailer frames land in the shared
/// slot. A read error is terminal and treated like EOF; the channel closes
/// when this task returns, which drops the body.
pub(crate) async fn stream_body_blocks<B>(
    id: String,
    mut body: B,
    block_size: usize,
    blocks: mpsc::UnboundedSender<Bytes>,
    trailers: Trailers,
) where
    B: hyper::body::Body<Data = Bytes> + Unpin,
    B::Error: std::fmt::Display,
{
    loop {
        match body.frame().await {
            Some(Ok(frame)) => match frame.into_data() {
                Ok(mut data) => {
                    while !data.is_empty() {
                        let take = data.len().min(block_size);
                        let block = data.split_to(take);
                        debug!(id = %id, bytes = block.len(), "Forwarding bytes from backend");
                        if blocks.send(block).is_err() {
                            return;
                        }
                    }
                }
                Err(frame) => {
                    if let Ok(map) = frame.into_trailers() {
                        trailers.merge(map);
                    }
                }
            },
            Some(Err(err)) => {
                warn!(id = %id, error = %err, "Failed to read from backend");
                break;
            }
            None => break,
        }
    }
    debug!(id = %id, "Backend body reached EOF");
}

/// Reader for the protocol-switch path: pulls blocks out of the upgraded
/// connection's read half. Each read gets a fresh buffer; the collator
/// keeps the block without copying.
pub(crate) async fn stream_upgraded_blocks<R>(
    id: String,
    mut reader: R,
    block_size: usize,
    blocks: mpsc::UnboundedSender<Bytes>,
) where
    R: AsyncRead + Unpin,
{
    loop {
        let mut buffer = BytesMut::with_capacity(block_size);
        match reader.read_buf(&mut buffer).await {
            Ok(0) => break,
            Ok(n) => {
                debug!(id = %id, bytes = n, "Forwarding bytes from backend");
                if blocks.send(buffer.freeze()).is_err() {
                    break;
                }
            }
            Err(err) => {
                warn!(id = %id, error = %err, "Failed to read from backend");
                break;
            }
        }
    }
    debug!(id = %id, "Backend stream reached EOF");
}

/// Collates byte blocks into response chunks. `pending` starts as the seed
/// chunk from the backend invoker (id, status code, header snapshot); each
/// emitted chunk's successor inherits only the id, so the status code
/// appears on exactly one chunk and `eof` only on the last.
pub(crate) async fn collate_responses(
    trickle_timeout: Duration,
    max_chunk_size: usize,
    mut blocks: mpsc::UnboundedReceiver<Bytes>,
    mut pending: wire::HttpResponse,
    chunks: mpsc::UnboundedSender<wire::HttpResponse>,
) {
    let id = pending.id().to_string();
    let mut ticker = time::interval_at(time::Instant::now() + trickle_timeout, trickle_timeout);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut timeouts = 0u32;

    loop {
        tokio::select! {
            block = blocks.recv() => match block {
                Some(block) => {
                    pending.body.extend_from_slice(&block);
                    if pending.body.len() > max_chunk_size {
                        debug!(id = %id, bytes = pending.body.len(), "Posting intermediate response chunk");
                        let next = next_chunk(&pending);
                        if chunks.send(mem::replace(&mut pending, next)).is_err() {
                            return;
                        }
                        timeouts = 0;
                    }
                }
                None => {
                    pending.eof = Some(true);
                    debug!(id = %id, bytes = pending.body.len(), "Posting final response chunk");
                    let _ = chunks.send(pending);
                    return;
                }
            },
            _ = ticker.tick() => {
                timeouts += 1;
                if !pending.body.is_empty() || pending.status_code.is_some() || timeouts > KEEPALIVE_TIMEOUTS {
                    debug!(id = %id, bytes = pending.body.len(), "Posting partial response chunk");
                    let next = next_chunk(&pending);
                    if chunks.send(mem::replace(&mut pending, next)).is_err() {
                        return;
                    }
                    timeouts = 0;
                }
            }
        }
    }
}

fn next_chunk(pending: &wire::HttpResponse) -> wire::HttpResponse {
    wire::HttpResponse {
        id: pending.id.clone(),
        ..Default::default()
    }
}
