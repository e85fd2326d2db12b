//! Relay from a stream's adapter to its HTTP clients.
//!
//! The supervisor pushes adapter chunks into the relay with
//! [`Relay::publish`]; every attached [`RelayClient`] receives the framed
//! bytes through a broadcast channel. The relay never decides retry policy:
//! when the adapter fails, the supervisor closes the relay, which ends every
//! client stream, and then drives the state transition itself.

pub mod framing;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use bytes::Bytes;
use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use crate::stream::StreamId;

pub use framing::Framing;

/// Chunks buffered per client before a slow client starts losing data.
const RELAY_BUFFER: usize = 64;

pub struct Relay {
    id: StreamId,
    framing: Framing,
    channel: Mutex<Option<broadcast::Sender<Bytes>>>,
    bytes_transferred: AtomicU64,
    clients: Arc<AtomicUsize>,
}

impl Relay {
    pub fn new(id: StreamId, framing: Framing) -> Self {
        Self {
            id,
            framing,
            channel: Mutex::new(None),
            bytes_transferred: AtomicU64::new(0),
            clients: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn framing(&self) -> &Framing {
        &self.framing
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred.load(Ordering::SeqCst)
    }

    pub fn clients_connected(&self) -> usize {
        self.clients.load(Ordering::SeqCst)
    }

    pub fn is_open(&self) -> bool {
        self.channel.lock().is_some()
    }

    /// Start accepting clients for a new streaming attempt.
    pub(crate) fn open(&self) {
        let (tx, _) = broadcast::channel(RELAY_BUFFER);
        *self.channel.lock() = Some(tx);
        tracing::debug!(stream = %self.id, "relay opened");
    }

    /// End every client stream. Idempotent.
    pub(crate) fn close(&self) {
        if self.channel.lock().take().is_some() {
            tracing::debug!(
                stream = %self.id,
                clients = self.clients_connected(),
                "relay closed"
            );
        }
    }

    /// Forward one adapter chunk to all attached clients.
    ///
    /// Returns the number of clients it reached. `bytes_transferred` grows by
    /// the unframed chunk length once per chunk that reached any client.
    pub(crate) fn publish(&self, chunk: Bytes) -> usize {
        let channel = self.channel.lock();
        let Some(tx) = channel.as_ref() else {
            return 0;
        };
        if tx.receiver_count() == 0 {
            return 0;
        }
        let len = chunk.len() as u64;
        match tx.send(self.framing.frame(&chunk)) {
            Ok(reached) => {
                self.bytes_transferred.fetch_add(len, Ordering::SeqCst);
                reached
            }
            Err(_) => 0,
        }
    }

    /// Attach a client. `None` when the relay is not open.
    pub(crate) fn subscribe(&self) -> Option<RelayClient> {
        let rx = self.channel.lock().as_ref()?.subscribe();
        let clients = self.clients.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::debug!(stream = %self.id, clients, "relay client attached");
        Some(RelayClient {
            rx,
            content_type: self.framing.content_type(),
            _guard: ClientGuard {
                id: self.id.clone(),
                clients: self.clients.clone(),
            },
        })
    }
}

/// Decrements the client count however the client goes away.
struct ClientGuard {
    id: StreamId,
    clients: Arc<AtomicUsize>,
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        let result = self
            .clients
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match result {
            Ok(previous) => {
                tracing::debug!(stream = %self.id, clients = previous - 1, "relay client detached");
            }
            Err(_) => tracing::warn!(stream = %self.id, "client count already zero"),
        }
    }
}

/// One downstream client of a [`Relay`].
pub struct RelayClient {
    rx: broadcast::Receiver<Bytes>,
    content_type: String,
    _guard: ClientGuard,
}

impl RelayClient {
    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    /// Next framed chunk, or `None` once the relay is closed.
    ///
    /// A client that falls more than the buffer behind skips the chunks it
    /// missed instead of stalling the others.
    pub async fn recv(&mut self) -> Option<Bytes> {
        loop {
            match self.rx.recv().await {
                Ok(chunk) => return Some(chunk),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "relay client lagging, chunks dropped");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Turn the client into a body stream. Dropping the stream detaches it.
    pub fn into_stream(self) -> impl Stream<Item = std::io::Result<Bytes>> + Send + 'static {
        futures::stream::unfold(self, |mut client| async move {
            let chunk = client.recv().await?;
            Some((Ok(chunk), client))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::Quality;

    fn relay(framing: Framing) -> Relay {
        Relay::new(StreamId::new("cam1", Quality::Low), framing)
    }

    #[tokio::test]
    async fn closed_relay_refuses_clients() {
        let relay = relay(Framing::raw("video/mp2t"));
        assert!(relay.subscribe().is_none());
        assert_eq!(relay.clients_connected(), 0);
    }

    #[tokio::test]
    async fn publish_without_clients_is_not_counted() {
        let relay = relay(Framing::raw("video/mp2t"));
        relay.open();
        assert_eq!(relay.publish(Bytes::from_static(b"data")), 0);
        assert_eq!(relay.bytes_transferred(), 0);
    }

    #[tokio::test]
    async fn fan_out_counts_bytes_once() {
        let relay = relay(Framing::raw("video/mp2t"));
        relay.open();
        let mut a = relay.subscribe().unwrap();
        let mut b = relay.subscribe().unwrap();
        assert_eq!(relay.clients_connected(), 2);

        assert_eq!(relay.publish(Bytes::from_static(b"12345")), 2);
        assert_eq!(a.recv().await.unwrap(), Bytes::from_static(b"12345"));
        assert_eq!(b.recv().await.unwrap(), Bytes::from_static(b"12345"));
        assert_eq!(relay.bytes_transferred(), 5);
    }

    #[tokio::test]
    async fn dropping_client_decrements_count() {
        let relay = relay(Framing::raw("video/mp2t"));
        relay.open();
        let client = relay.subscribe().unwrap();
        let stream = relay.subscribe().unwrap().into_stream();
        assert_eq!(relay.clients_connected(), 2);

        drop(client);
        drop(stream);
        assert_eq!(relay.clients_connected(), 0);
    }

    #[tokio::test]
    async fn close_ends_client_streams() {
        let relay = relay(Framing::multipart("image/svg+xml"));
        relay.open();
        let mut client = relay.subscribe().unwrap();
        relay.publish(Bytes::from_static(b"<svg/>"));
        relay.close();

        let part = client.recv().await.unwrap();
        assert!(part.starts_with(b"--rtspmux"));
        assert!(client.recv().await.is_none());
        assert!(!relay.is_open());
    }

    #[tokio::test]
    async fn client_stream_yields_framed_chunks() {
        use futures::StreamExt;

        let relay = relay(Framing::raw("video/mp2t"));
        relay.open();
        let mut stream = Box::pin(relay.subscribe().unwrap().into_stream());
        relay.publish(Bytes::from_static(b"ts"));
        relay.close();

        assert_eq!(stream.next().await.unwrap().unwrap(), Bytes::from_static(b"ts"));
        assert!(stream.next().await.is_none());
    }
}
