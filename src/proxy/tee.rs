use std::time::Duration;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::models::config::TeeKeep;

// After the client side goes away we keep draining the upstream briefly so
// trailing usage data still lands in the accounting buffer.
const DISCONNECT_DRAIN_CAP: Duration = Duration::from_secs(2);

#[derive(Debug)]
pub struct CapturedStream {
    pub buffer: Vec<u8>,
    pub truncated: bool,
    pub total_bytes: u64,
    pub client_disconnected: bool,
}

pub struct TeeHandle {
    pub body: axum::body::Body,
    pub captured: oneshot::Receiver<CapturedStream>,
}

// Bounded accounting sink. Head mode keeps the first `capacity` bytes and
// drops the rest; tail mode keeps the last `capacity` bytes.
struct AccountingBuffer {
    data: Vec<u8>,
    capacity: usize,
    keep: TeeKeep,
    truncated: bool,
}

impl AccountingBuffer {
    fn new(capacity: usize, keep: TeeKeep) -> Self {
        Self {
            data: Vec::with_capacity(capacity.min(64 * 1024)),
            capacity,
            keep,
            truncated: false,
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        match self.keep {
            TeeKeep::Head => {
                let room = self.capacity.saturating_sub(self.data.len());
                if room >= chunk.len() {
                    self.data.extend_from_slice(chunk);
                } else {
                    self.data.extend_from_slice(&chunk[..room]);
                    self.truncated = true;
                }
            }
            TeeKeep::Tail => {
                self.data.extend_from_slice(chunk);
                if self.data.len() > self.capacity {
                    let overflow = self.data.len() - self.capacity;
                    self.data.drain(..overflow);
                    self.truncated = true;
                }
            }
        }
    }
}

// Duplicates one upstream byte stream into the client response body and a
// bounded in-memory accounting buffer. The client sink is authoritative for
// flow control; the accounting sink never blocks and sheds bytes once full.
pub fn tee<S, E>(upstream: S, capacity: usize, keep: TeeKeep) -> TeeHandle
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    let (client_tx, client_rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(16);
    let (done_tx, done_rx) = oneshot::channel();

    tokio::spawn(async move {
        let mut upstream = std::pin::pin!(upstream);
        let mut accounting = AccountingBuffer::new(capacity, keep);
        let mut total_bytes: u64 = 0;
        let mut client_disconnected = false;
        let mut drain_deadline: Option<tokio::time::Instant> = None;

        loop {
            let chunk = match drain_deadline {
                Some(deadline) => {
                    match tokio::time::timeout_at(deadline, upstream.next()).await {
                        Ok(chunk) => chunk,
                        Err(_) => {
                            debug!("Post-disconnect drain window elapsed, closing upstream");
                            break;
                        }
                    }
                }
                None => upstream.next().await,
            };

            match chunk {
                Some(Ok(bytes)) => {
                    total_bytes += bytes.len() as u64;
                    accounting.push(&bytes);
                    if !client_disconnected && client_tx.send(Ok(bytes)).await.is_err() {
                        debug!("Client sink closed mid-stream, draining upstream tail");
                        client_disconnected = true;
                        drain_deadline =
                            Some(tokio::time::Instant::now() + DISCONNECT_DRAIN_CAP);
                    }
                }
                Some(Err(e)) => {
                    warn!("Upstream stream error: {}", e);
                    if !client_disconnected {
                        let _ = client_tx
                            .send(Err(std::io::Error::new(
                                std::io::ErrorKind::Other,
                                e.to_string(),
                            )))
                            .await;
                    }
                    break;
                }
                None => break,
            }
        }

        let _ = done_tx.send(CapturedStream {
            buffer: accounting.data,
            truncated: accounting.truncated,
            total_bytes,
            client_disconnected,
        });
    });

    TeeHandle {
        body: axum::body::Body::from_stream(tokio_stream::wrappers::ReceiverStream::new(
            client_rx,
        )),
        captured: done_rx,
    }
}
