use std::sync::Arc;
use std::time::Duration;

use bon::Builder;
use strum_macros::Display;
use tokio::sync::{Mutex, broadcast, watch};
use tokio::time::{Instant, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::radio::{ProxyPermit, RadioArbiter};
use super::transport::{NotificationStream, Transport, TransportLink};
use crate::error::ConnectionError;
use crate::mesh::DeviceAddress;
use crate::mesh::pdu::{InboundPdu, Reassembler};
use crate::protocol::EndpointId;

const DEFAULT_WAIT_DEADLINE: Duration = Duration::from_secs(25);
const INBOUND_CHANNEL_CAPACITY: usize = 64;

/// One proxy address to try, with whatever is already known about it.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ProxyCandidate {
    address: DeviceAddress,
    proxy_service_known: bool,
}

impl ProxyCandidate {
    /// A candidate whose proxy capability is unverified.
    #[must_use]
    pub fn new(address: DeviceAddress) -> Self {
        Self {
            address,
            proxy_service_known: false,
        }
    }

    /// A candidate already known to expose the proxy service.
    #[must_use]
    pub fn known_proxy(address: DeviceAddress) -> Self {
        Self {
            address,
            proxy_service_known: true,
        }
    }

    /// Returns the candidate address.
    #[must_use]
    pub fn address(&self) -> &DeviceAddress {
        &self.address
    }
}

/// Lifecycle of the one proxy connection.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Display)]
pub enum ConnectionState {
    #[strum(to_string = "disconnected")]
    Disconnected,
    #[strum(to_string = "connecting")]
    Connecting,
    #[strum(to_string = "ready")]
    Ready,
    #[strum(to_string = "failed")]
    Failed,
}

/// Tunables for connection management.
#[derive(Debug, Clone, Builder)]
pub struct ConnectionConfig {
    /// Caller-visible deadline covering queueing behind an in-flight attempt.
    #[builder(default = DEFAULT_WAIT_DEADLINE)]
    wait_deadline: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum AttemptOutcome {
    Ready,
    Failed,
}

#[derive(Debug)]
struct InFlightAttempt {
    target: DeviceAddress,
    outcome: watch::Receiver<Option<AttemptOutcome>>,
}

struct ActiveConnection {
    address: DeviceAddress,
    link: Arc<dyn TransportLink>,
    pump_cancel: CancellationToken,
    _permit: ProxyPermit,
}

#[derive(Default)]
struct ManagerInner {
    active: Option<ActiveConnection>,
    in_flight: Option<InFlightAttempt>,
}

/// Owner of the one proxy connection.
///
/// Connection state is mutated only through this manager. Concurrent
/// `ensure_connection` calls coalesce onto a single spawned attempt: the
/// attempt runs on its own task publishing into a `watch` channel, so a
/// caller abandoning its wait never orphans the attempt and late arrivals
/// observe an outcome they did not start.
pub struct ProxyConnectionManager {
    transport: Arc<dyn Transport>,
    radio: RadioArbiter,
    config: ConnectionConfig,
    inner: Arc<Mutex<ManagerInner>>,
    state_tx: watch::Sender<ConnectionState>,
    inbound_tx: broadcast::Sender<InboundPdu>,
}

impl ProxyConnectionManager {
    /// Creates a manager in the disconnected state.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, radio: RadioArbiter, config: ConnectionConfig) -> Self {
        let (state_tx, _state_rx) = watch::channel(ConnectionState::Disconnected);
        let (inbound_tx, _inbound_rx) = broadcast::channel(INBOUND_CHANNEL_CAPACITY);
        Self {
            transport,
            radio,
            config,
            inner: Arc::new(Mutex::new(ManagerInner::default())),
            state_tx,
            inbound_tx,
        }
    }

    /// Returns the current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Returns a watch stream of connection-state transitions.
    #[must_use]
    pub fn state_stream(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Subscribes to reassembled inbound proxy PDUs.
    #[must_use]
    pub fn inbound_pdus(&self) -> broadcast::Receiver<InboundPdu> {
        self.inbound_tx.subscribe()
    }

    /// Returns the active link while the connection is ready.
    pub async fn active_link(&self) -> Option<Arc<dyn TransportLink>> {
        let inner = self.inner.lock().await;
        inner.active.as_ref().map(|active| active.link.clone())
    }

    /// Returns the ready proxy's address, if any.
    pub async fn active_address(&self) -> Option<DeviceAddress> {
        let inner = self.inner.lock().await;
        inner.active.as_ref().map(|active| active.address.clone())
    }

    /// Drives the connection to ready using the candidates in order.
    ///
    /// Returns immediately when already ready; joins an in-flight attempt
    /// instead of racing a second physical connection. A candidate succeeds
    /// only if the mesh proxy service is present after discovery and the
    /// reply characteristic is subscribed.
    ///
    /// # Errors
    ///
    /// Returns an error when every candidate fails or the caller-visible
    /// deadline elapses.
    #[instrument(skip(self, candidates), level = "info", fields(candidate_count = candidates.len()))]
    pub async fn ensure_connection(
        &self,
        candidates: &[ProxyCandidate],
    ) -> Result<(), ConnectionError> {
        let mut deadline = Instant::now() + self.config.wait_deadline;
        let mut foreign_grace_used = false;

        loop {
            let (mut outcome_rx, target, initiated) = {
                let mut inner = self.inner.lock().await;
                if inner.active.is_some() {
                    return Ok(());
                }
                if let Some(attempt) = &inner.in_flight {
                    (attempt.outcome.clone(), attempt.target.clone(), false)
                } else {
                    let Some(first) = candidates.first() else {
                        return Err(ConnectionError::NoCandidates);
                    };
                    let (outcome_tx, outcome_rx) = watch::channel(None);
                    inner.in_flight = Some(InFlightAttempt {
                        target: first.address.clone(),
                        outcome: outcome_rx.clone(),
                    });
                    self.state_tx.send_replace(ConnectionState::Connecting);
                    self.spawn_attempt(candidates.to_vec(), outcome_tx);
                    (outcome_rx, first.address.clone(), true)
                }
            };

            let waited = timeout_at(deadline, outcome_rx.wait_for(Option::is_some)).await;
            match waited {
                Ok(Ok(outcome)) => match (*outcome).expect("wait_for only yields settled outcomes")
                {
                    AttemptOutcome::Ready => return Ok(()),
                    AttemptOutcome::Failed if initiated => {
                        return Err(ConnectionError::AllCandidatesFailed {
                            tried: candidates.len(),
                        });
                    }
                    AttemptOutcome::Failed => {
                        // The attempt we joined failed; fall through and run
                        // our own candidate list.
                        continue;
                    }
                },
                Ok(Err(_sender_gone)) if initiated => {
                    return Err(ConnectionError::AllCandidatesFailed {
                        tried: candidates.len(),
                    });
                }
                Ok(Err(_sender_gone)) => continue,
                Err(_elapsed) => {
                    let own_target = candidates.first().map(ProxyCandidate::address);
                    if !initiated
                        && !foreign_grace_used
                        && own_target.is_some_and(|own| *own != target)
                    {
                        // Waited out an attempt to a different proxy; grant
                        // one fresh window to retry with our own candidates.
                        foreign_grace_used = true;
                        deadline = Instant::now() + self.config.wait_deadline;
                        continue;
                    }
                    return Err(ConnectionError::WaitDeadlineExceeded {
                        waited_ms: u64::try_from(self.config.wait_deadline.as_millis())
                            .unwrap_or(u64::MAX),
                    });
                }
            }
        }
    }

    /// Tears down the active connection and releases the radio.
    pub async fn disconnect(&self) {
        let active = {
            let mut inner = self.inner.lock().await;
            inner.active.take()
        };
        self.state_tx.send_replace(ConnectionState::Disconnected);

        if let Some(active) = active {
            info!(address = %active.address, "disconnecting proxy");
            active.pump_cancel.cancel();
            if let Err(error) = active.link.close().await {
                debug!(%error, "proxy link close failed during disconnect");
            }
        }
    }

    fn spawn_attempt(
        &self,
        candidates: Vec<ProxyCandidate>,
        outcome_tx: watch::Sender<Option<AttemptOutcome>>,
    ) {
        let transport = self.transport.clone();
        let radio = self.radio.clone();
        let inner = self.inner.clone();
        let state_tx = self.state_tx.clone();
        let inbound_tx = self.inbound_tx.clone();

        tokio::spawn(async move {
            let outcome = run_attempt(transport, radio, &candidates, inbound_tx).await;
            let mut guard = inner.lock().await;
            guard.in_flight = None;
            match outcome {
                Ok(active) => {
                    info!(address = %active.address, "proxy connection ready");
                    guard.active = Some(active);
                    state_tx.send_replace(ConnectionState::Ready);
                    let _ = outcome_tx.send(Some(AttemptOutcome::Ready));
                }
                Err(error) => {
                    warn!(%error, "proxy connection attempt failed");
                    guard.active = None;
                    state_tx.send_replace(ConnectionState::Failed);
                    let _ = outcome_tx.send(Some(AttemptOutcome::Failed));
                }
            }
        });
    }
}

/// Tries candidates strictly in order until one yields a usable proxy link.
async fn run_attempt(
    transport: Arc<dyn Transport>,
    radio: RadioArbiter,
    candidates: &[ProxyCandidate],
    inbound_tx: broadcast::Sender<InboundPdu>,
) -> Result<ActiveConnection, ConnectionError> {
    let permit = radio.acquire_proxy().await;

    for candidate in candidates {
        debug!(
            address = %candidate.address,
            proxy_known = candidate.proxy_service_known,
            "trying proxy candidate"
        );
        let link = match transport.connect(&candidate.address).await {
            Ok(link) => link,
            Err(error) => {
                debug!(address = %candidate.address, %error, "candidate connect failed");
                continue;
            }
        };

        // A bare GATT connection is not success; the proxy service must be
        // present after discovery.
        if !link.has_service(EndpointId::MeshProxyService) {
            debug!(address = %candidate.address, "candidate lacks the mesh proxy service");
            if let Err(error) = link.close().await {
                debug!(%error, "failed to close non-proxy candidate link");
            }
            continue;
        }

        let stream = match link.subscribe(EndpointId::MeshDataOut).await {
            Ok(stream) => stream,
            Err(error) => {
                debug!(address = %candidate.address, %error, "candidate notify enable failed");
                if let Err(error) = link.close().await {
                    debug!(%error, "failed to close candidate link after notify failure");
                }
                continue;
            }
        };

        let link: Arc<dyn TransportLink> = Arc::from(link);
        let pump_cancel = CancellationToken::new();
        tokio::spawn(pump_inbound(stream, inbound_tx, pump_cancel.clone()));

        return Ok(ActiveConnection {
            address: candidate.address.clone(),
            link,
            pump_cancel,
            _permit: permit,
        });
    }

    Err(ConnectionError::AllCandidatesFailed {
        tried: candidates.len(),
    })
}

/// Reassembles notification fragments into whole PDUs for subscribers.
async fn pump_inbound(
    mut stream: NotificationStream,
    inbound_tx: broadcast::Sender<InboundPdu>,
    cancel: CancellationToken,
) {
    let mut reassembler = Reassembler::new();
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            maybe_fragment = stream.recv() => {
                let Some(fragment) = maybe_fragment else {
                    break;
                };
                match reassembler.feed(&fragment) {
                    Ok(Some(pdu)) => {
                        let _ = inbound_tx.send(pdu);
                    }
                    Ok(None) => {}
                    Err(error) => {
                        debug!(%error, "dropping malformed proxy fragment");
                    }
                }
            }
        }
    }
}
