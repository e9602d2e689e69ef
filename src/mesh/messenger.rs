use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;
use tracing::{debug, instrument};

use super::address::UnicastAddress;
use super::codec::{CodecError, MeshCodec, MeshMessage};
use super::credentials::MeshCredentials;
use super::pdu::{self, FilterType, PduError, ProxyPduType};
use crate::ble::ProxyConnectionManager;
use crate::error::TransportError;
use crate::protocol::EndpointId;

/// Errors returned by mesh message submission.
///
/// None of these are retried here; retry policy belongs to the caller.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("no proxy connection is ready; connect first")]
    NoConnection,
    #[error("no application key is configured for this network")]
    NoApplicationKey,
    #[error("transport write failed")]
    TransportWriteFailed {
        #[source]
        source: TransportError,
    },
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Pdu(#[from] PduError),
}

/// Builds mesh PDUs and submits them through the ready proxy connection.
pub struct MeshMessenger {
    connections: Arc<ProxyConnectionManager>,
    codec: Arc<dyn MeshCodec>,
    credentials: std::sync::Mutex<Option<MeshCredentials>>,
    filter_configured: AtomicBool,
}

impl MeshMessenger {
    /// Creates a messenger over the shared connection manager.
    #[must_use]
    pub fn new(connections: Arc<ProxyConnectionManager>, codec: Arc<dyn MeshCodec>) -> Self {
        Self {
            connections,
            codec,
            credentials: std::sync::Mutex::new(None),
            filter_configured: AtomicBool::new(false),
        }
    }

    /// Installs the network and application keys used for encoding.
    pub fn set_credentials(&self, credentials: MeshCredentials) {
        *self
            .credentials
            .lock()
            .expect("credentials lock should not be poisoned") = Some(credentials);
    }

    /// Returns whether credentials have been installed.
    #[must_use]
    pub fn has_credentials(&self) -> bool {
        self.credentials
            .lock()
            .expect("credentials lock should not be poisoned")
            .is_some()
    }

    /// Configures the proxy's whitelist with every address replies are
    /// expected from.
    ///
    /// Until this runs, the proxy may silently drop status replies; callers
    /// treat missing replies as inconclusive rather than as failures.
    ///
    /// # Errors
    ///
    /// Returns an error when no connection is ready or a write fails.
    #[instrument(skip(self, addresses), level = "info", fields(address_count = addresses.len()))]
    pub async fn configure_filter(
        &self,
        addresses: &[UnicastAddress],
    ) -> Result<(), SendError> {
        let link = self
            .connections
            .active_link()
            .await
            .ok_or(SendError::NoConnection)?;

        let mut payloads = vec![pdu::encode_set_filter_type(FilterType::Whitelist)];
        if !addresses.is_empty() {
            payloads.push(pdu::encode_add_addresses(addresses));
        }

        for payload in payloads {
            for fragment in pdu::segment(ProxyPduType::ProxyConfig, &payload, link.write_limit())? {
                link.write_endpoint(EndpointId::MeshDataIn, &fragment)
                    .await
                    .map_err(|source| SendError::TransportWriteFailed { source })?;
            }
        }

        self.filter_configured.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Encodes and submits one mesh message through the ready connection.
    ///
    /// # Errors
    ///
    /// Returns [`SendError::NoConnection`] before a connection is ready,
    /// [`SendError::NoApplicationKey`] before credentials are installed, and
    /// [`SendError::TransportWriteFailed`] for propagated write failures.
    #[instrument(
        skip(self, message),
        level = "info",
        fields(destination = %message.destination(), transaction_id = message.transaction_id())
    )]
    pub async fn send(&self, message: &MeshMessage) -> Result<(), SendError> {
        let link = self
            .connections
            .active_link()
            .await
            .ok_or(SendError::NoConnection)?;

        let credentials = self
            .credentials
            .lock()
            .expect("credentials lock should not be poisoned")
            .clone()
            .ok_or(SendError::NoApplicationKey)?;

        if !self.filter_configured.load(Ordering::SeqCst) {
            debug!("sending before the proxy filter is configured; replies may be dropped");
        }

        let payload = self.codec.encode(message, &credentials)?;
        let fragments = pdu::segment(ProxyPduType::Network, &payload, link.write_limit())?;
        let fragment_count = fragments.len();
        for fragment in fragments {
            link.write_endpoint(EndpointId::MeshDataIn, &fragment)
                .await
                .map_err(|source| SendError::TransportWriteFailed { source })?;
        }

        debug!(fragment_count, "mesh message submitted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::ble::{ConnectionConfig, DeviceScript, FakeTransport, ProxyCandidate, RadioArbiter};
    use crate::mesh::codec::CleartextCodec;
    use crate::mesh::{DeviceAddress, GroupAddress};

    fn proxy_address() -> DeviceAddress {
        "aa:bb:cc:dd:ee:01".parse().expect("address should parse")
    }

    fn messenger_over(transport: Arc<FakeTransport>) -> (Arc<ProxyConnectionManager>, MeshMessenger) {
        let manager = Arc::new(ProxyConnectionManager::new(
            transport,
            RadioArbiter::new(),
            ConnectionConfig::default(),
        ));
        let messenger = MeshMessenger::new(manager.clone(), Arc::new(CleartextCodec));
        (manager, messenger)
    }

    #[tokio::test]
    async fn send_requires_a_ready_connection() {
        let transport = Arc::new(FakeTransport::new());
        let (_manager, messenger) = messenger_over(transport);

        let group = GroupAddress::try_from(0xC001).expect("0xC001 should be a group");
        let message = MeshMessage::generic_onoff_set(group, true);
        assert_matches!(
            messenger.send(&message).await,
            Err(SendError::NoConnection)
        );
    }

    #[tokio::test]
    async fn send_requires_credentials() {
        let transport = Arc::new(FakeTransport::with_devices([DeviceScript::builder()
            .address(proxy_address())
            .build()]));
        let (manager, messenger) = messenger_over(transport);
        manager
            .ensure_connection(&[ProxyCandidate::known_proxy(proxy_address())])
            .await
            .expect("scripted proxy should connect");

        let group = GroupAddress::try_from(0xC001).expect("0xC001 should be a group");
        let message = MeshMessage::generic_onoff_set(group, true);
        assert_matches!(
            messenger.send(&message).await,
            Err(SendError::NoApplicationKey)
        );
    }

    #[tokio::test]
    async fn send_propagates_transport_write_failures() {
        let transport = Arc::new(FakeTransport::with_devices([DeviceScript::builder()
            .address(proxy_address())
            .fail_writes(DeviceScript::always())
            .build()]));
        let (manager, messenger) = messenger_over(transport);
        manager
            .ensure_connection(&[ProxyCandidate::known_proxy(proxy_address())])
            .await
            .expect("scripted proxy should connect");
        messenger.set_credentials(
            MeshCredentials::parse(
                "00112233445566778899aabbccddeeff",
                "ffeeddccbbaa99887766554433221100",
            )
            .expect("test keys should parse"),
        );

        let group = GroupAddress::try_from(0xC001).expect("0xC001 should be a group");
        let message = MeshMessage::generic_onoff_set(group, true);
        assert_matches!(
            messenger.send(&message).await,
            Err(SendError::TransportWriteFailed { .. })
        );
    }
}
