use std::sync::Arc;

use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

/// Gatekeeper for the one physical radio.
///
/// The proxy connection and firmware transfers are the two owner classes of
/// the radio and must never hold it concurrently. Proxy ownership is
/// exclusive; transfer workers share their side among themselves, bounded
/// separately by the update queue's concurrency cap.
#[derive(Debug, Clone)]
pub struct RadioArbiter {
    gate: Arc<RwLock<()>>,
}

/// Held while the proxy connection owns the radio.
#[derive(Debug)]
pub struct ProxyPermit {
    _guard: OwnedRwLockWriteGuard<()>,
}

/// Held while one firmware transfer owns a share of the radio.
#[derive(Debug)]
pub struct TransferPermit {
    _guard: OwnedRwLockReadGuard<()>,
}

impl Default for RadioArbiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RadioArbiter {
    /// Creates an arbiter with the radio unowned.
    #[must_use]
    pub fn new() -> Self {
        Self {
            gate: Arc::new(RwLock::new(())),
        }
    }

    /// Acquires the radio for the proxy connection, waiting for transfers to
    /// drain. The permit releases on drop.
    pub async fn acquire_proxy(&self) -> ProxyPermit {
        ProxyPermit {
            _guard: self.gate.clone().write_owned().await,
        }
    }

    /// Acquires a transfer share of the radio, waiting for the proxy
    /// connection to release it. The permit releases on drop.
    pub async fn acquire_transfer(&self) -> TransferPermit {
        TransferPermit {
            _guard: self.gate.clone().read_owned().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;

    #[tokio::test]
    async fn transfers_share_the_radio_with_each_other() {
        let arbiter = RadioArbiter::new();
        let first = arbiter.acquire_transfer().await;

        let second = timeout(Duration::from_millis(50), arbiter.acquire_transfer()).await;
        assert!(second.is_ok());
        drop(first);
    }

    #[tokio::test]
    async fn proxy_waits_until_transfers_drain() {
        let arbiter = RadioArbiter::new();
        let transfer = arbiter.acquire_transfer().await;

        let blocked = timeout(Duration::from_millis(50), arbiter.acquire_proxy()).await;
        assert!(blocked.is_err());

        drop(transfer);
        let acquired = timeout(Duration::from_millis(50), arbiter.acquire_proxy()).await;
        assert!(acquired.is_ok());
    }

    #[tokio::test]
    async fn transfer_waits_for_proxy_release() {
        let arbiter = RadioArbiter::new();
        let proxy = arbiter.acquire_proxy().await;

        let blocked = timeout(Duration::from_millis(50), arbiter.acquire_transfer()).await;
        assert!(blocked.is_err());

        drop(proxy);
        let acquired = timeout(Duration::from_millis(50), arbiter.acquire_transfer()).await;
        assert!(acquired.is_ok());
    }
}
