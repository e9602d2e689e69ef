use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_stream::Stream;

use crate::error::TransportError;
use crate::mesh::DeviceAddress;
use crate::protocol::EndpointId;

/// Per-attempt connect timeout applied inside the transport.
pub(crate) const CONNECT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(10);
/// Fixed number of transport-level connect attempts per candidate.
pub(crate) const CONNECT_ATTEMPTS: u32 = 3;
/// Fixed delay between transport-level connect attempts.
pub(crate) const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(500);

const NOTIFICATION_CHANNEL_CAPACITY: usize = 64;

/// Opens exclusive links to individual peripherals.
///
/// Implementations own the transport-level retry discipline: each `connect`
/// call makes up to [`CONNECT_ATTEMPTS`] bounded attempts with a fixed delay
/// between them before surfacing a failure.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connects to one peripheral and discovers its services.
    async fn connect(
        &self,
        address: &DeviceAddress,
    ) -> Result<Box<dyn TransportLink>, TransportError>;
}

/// One established GATT link.
///
/// Callbacks are registered through [`TransportLink::subscribe`] streams
/// rather than inherited hooks, so the link stays a plain injected
/// collaborator.
#[async_trait]
pub trait TransportLink: Send + Sync {
    /// Returns the peer's canonical address.
    fn address(&self) -> &DeviceAddress;

    /// Returns the usable per-write payload limit for this link.
    fn write_limit(&self) -> usize;

    /// Returns whether a GATT service is present after discovery.
    fn has_service(&self, endpoint: EndpointId) -> bool;

    /// Writes one payload to a characteristic endpoint.
    async fn write_endpoint(
        &self,
        endpoint: EndpointId,
        payload: &[u8],
    ) -> Result<(), TransportError>;

    /// Enables notifications on an endpoint and returns its stream.
    async fn subscribe(&self, endpoint: EndpointId) -> Result<NotificationStream, TransportError>;

    /// Tears the link down; idempotent.
    async fn close(&self) -> Result<(), TransportError>;
}

/// Ordered notification payloads from one subscribed endpoint.
#[derive(Debug)]
pub struct NotificationStream {
    receiver: mpsc::Receiver<Vec<u8>>,
}

impl NotificationStream {
    /// Wraps a backend notification channel.
    pub(crate) fn new(receiver: mpsc::Receiver<Vec<u8>>) -> Self {
        Self { receiver }
    }

    /// Creates a stream along with its feeding half.
    pub(crate) fn channel() -> (mpsc::Sender<Vec<u8>>, Self) {
        let (sender, receiver) = mpsc::channel(NOTIFICATION_CHANNEL_CAPACITY);
        (sender, Self::new(receiver))
    }

    /// Receives the next notification payload.
    ///
    /// Returns `None` once the link is closed.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.receiver.recv().await
    }
}

impl Stream for NotificationStream {
    type Item = Vec<u8>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}
