use std::collections::HashMap;
use std::sync::Mutex;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, trace};

use super::address::UnicastAddress;

const CHANNEL_CAPACITY: usize = 64;

/// A Generic OnOff status event attributed to one node.
///
/// Zero, one, or several of these may arrive for a single request; there is
/// no delivery guarantee and repeats are expected, not errors.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize)]
pub struct DeviceStatus {
    unicast_address: UnicastAddress,
    present_state: bool,
    target_state: Option<bool>,
}

impl DeviceStatus {
    /// Creates a status event.
    #[must_use]
    pub fn new(
        unicast_address: UnicastAddress,
        present_state: bool,
        target_state: Option<bool>,
    ) -> Self {
        Self {
            unicast_address,
            present_state,
            target_state,
        }
    }

    /// Returns the reporting node's unicast address.
    #[must_use]
    pub fn unicast_address(&self) -> UnicastAddress {
        self.unicast_address
    }

    /// Returns the reported present state.
    #[must_use]
    pub fn present_state(&self) -> bool {
        self.present_state
    }

    /// Returns the reported target state, when the node included one.
    #[must_use]
    pub fn target_state(&self) -> Option<bool> {
        self.target_state
    }
}

/// A live status subscription.
///
/// Dropping the subscription detaches it; [`StatusSubscription::unsubscribe`]
/// does the same explicitly.
#[derive(Debug)]
pub struct StatusSubscription {
    receiver: broadcast::Receiver<DeviceStatus>,
}

impl StatusSubscription {
    /// Receives the next status event.
    ///
    /// Returns `None` once the router is gone or the subscription lagged past
    /// the channel capacity and no further events arrive.
    pub async fn recv(&mut self) -> Option<DeviceStatus> {
        loop {
            match self.receiver.recv().await {
                Ok(status) => return Some(status),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    trace!(missed, "status subscription lagged; continuing with latest");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Detaches the subscription.
    pub fn unsubscribe(self) {
        drop(self);
    }
}

/// Demultiplexes status events to per-address subscribers.
///
/// Stateless pass-through: only the most recent event per address is
/// meaningful, nothing is persisted, and ordering is only guaranteed within
/// one address per connection.
#[derive(Debug)]
pub struct StatusRouter {
    by_address: Mutex<HashMap<UnicastAddress, broadcast::Sender<DeviceStatus>>>,
    firehose: broadcast::Sender<DeviceStatus>,
}

impl Default for StatusRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusRouter {
    /// Creates an empty router.
    #[must_use]
    pub fn new() -> Self {
        let (firehose, _receiver) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            by_address: Mutex::new(HashMap::new()),
            firehose,
        }
    }

    /// Subscribes to status events from one unicast address.
    #[must_use]
    pub fn subscribe(&self, address: UnicastAddress) -> StatusSubscription {
        let mut by_address = self
            .by_address
            .lock()
            .expect("status router lock should not be poisoned");
        let sender = by_address.entry(address).or_insert_with(|| {
            let (sender, _receiver) = broadcast::channel(CHANNEL_CAPACITY);
            sender
        });
        StatusSubscription {
            receiver: sender.subscribe(),
        }
    }

    /// Subscribes to status events from every address.
    #[must_use]
    pub fn subscribe_all(&self) -> StatusSubscription {
        StatusSubscription {
            receiver: self.firehose.subscribe(),
        }
    }

    /// Routes one decoded status event to its subscribers.
    pub fn route(&self, status: DeviceStatus) {
        trace!(
            address = %status.unicast_address(),
            present = status.present_state(),
            "routing device status"
        );

        let _ = self.firehose.send(status);

        let mut by_address = self
            .by_address
            .lock()
            .expect("status router lock should not be poisoned");
        let abandoned = by_address
            .get(&status.unicast_address())
            .is_some_and(|sender| sender.send(status).is_err());
        if abandoned {
            // Last subscriber went away; reclaim the slot.
            by_address.remove(&status.unicast_address());
        }
    }

    /// Logs and drops one undecodable inbound payload.
    pub fn discard_malformed(&self, payload: &[u8], reason: &str) {
        debug!(
            payload = %hex::encode(payload),
            reason,
            "dropping malformed status PDU"
        );
    }
}
