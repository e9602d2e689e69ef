use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    Central, CharPropFlags, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use tokio::task::AbortHandle;
use tokio::time::{sleep, timeout};
use tokio_stream::StreamExt;
use tracing::{debug, info, instrument, trace};

use super::transport::{
    CONNECT_ATTEMPTS, CONNECT_ATTEMPT_TIMEOUT, CONNECT_RETRY_DELAY, NotificationStream, Transport,
    TransportLink,
};
use crate::error::TransportError;
use crate::mesh::DeviceAddress;
use crate::protocol::{
    ATT_WRITE_OVERHEAD, EndpointId, FALLBACK_WRITE_LIMIT, REQUESTED_ATT_MTU, endpoint_metadata,
};

const SCAN_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Transport backed by `btleplug`.
#[derive(Debug)]
pub struct BtleplugTransport {
    manager: Manager,
}

impl BtleplugTransport {
    /// Creates the real BLE transport.
    ///
    /// # Errors
    ///
    /// Returns an error when the platform BLE manager cannot be created.
    pub async fn new() -> Result<Self, TransportError> {
        let manager = Manager::new().await?;
        Ok(Self { manager })
    }

    async fn adapters(&self) -> Result<Vec<Adapter>, TransportError> {
        let adapters = self.manager.adapters().await?;
        if adapters.is_empty() {
            return Err(TransportError::NoAdapters);
        }
        Ok(adapters)
    }

    /// Scans until the peripheral with the requested address appears.
    #[instrument(skip(self, adapters), level = "debug", fields(%address))]
    async fn find_peripheral(
        &self,
        adapters: &[Adapter],
        address: &DeviceAddress,
    ) -> Result<Peripheral, TransportError> {
        for adapter in adapters {
            adapter.start_scan(ScanFilter::default()).await?;
        }

        let found = 'scan: loop {
            for adapter in adapters {
                let peripherals = adapter.peripherals().await?;
                for peripheral in peripherals {
                    if peripheral_matches(&peripheral, address).await? {
                        break 'scan peripheral;
                    }
                }
            }
            sleep(SCAN_POLL_INTERVAL).await;
        };

        for adapter in adapters {
            if let Err(error) = adapter.stop_scan().await {
                debug!(?error, "failed to stop adapter scan cleanly");
            }
        }

        Ok(found)
    }

    #[instrument(skip(self), level = "debug", fields(%address))]
    async fn try_connect(&self, address: &DeviceAddress) -> Result<RealLink, TransportError> {
        let adapters = self.adapters().await?;
        let peripheral = self.find_peripheral(&adapters, address).await?;

        if !peripheral.is_connected().await? {
            peripheral.connect().await?;
        }
        peripheral.discover_services().await?;

        let characteristics = collect_characteristics(&peripheral);
        let service_uuids: Vec<String> = peripheral
            .services()
            .iter()
            .map(|service| service.uuid.to_string().to_lowercase())
            .collect();

        info!(%address, services = service_uuids.len(), "connected to peripheral");
        Ok(RealLink {
            address: address.clone(),
            peripheral,
            characteristics,
            service_uuids,
            forwarders: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl Transport for BtleplugTransport {
    async fn connect(
        &self,
        address: &DeviceAddress,
    ) -> Result<Box<dyn TransportLink>, TransportError> {
        let mut last_error = None;
        for attempt in 1..=CONNECT_ATTEMPTS {
            match timeout(CONNECT_ATTEMPT_TIMEOUT, self.try_connect(address)).await {
                Ok(Ok(link)) => return Ok(Box::new(link)),
                Ok(Err(error)) => {
                    debug!(%address, attempt, %error, "connect attempt failed");
                    last_error = Some(error);
                }
                Err(_elapsed) => {
                    debug!(%address, attempt, "connect attempt timed out");
                }
            }
            if attempt < CONNECT_ATTEMPTS {
                sleep(CONNECT_RETRY_DELAY).await;
            }
        }

        Err(last_error.unwrap_or(TransportError::ConnectAttemptsExhausted {
            address: address.to_string(),
            attempts: CONNECT_ATTEMPTS,
        }))
    }
}

async fn peripheral_matches(
    peripheral: &Peripheral,
    address: &DeviceAddress,
) -> Result<bool, TransportError> {
    let Some(properties) = peripheral.properties().await? else {
        return Ok(false);
    };

    let reported = properties.address.to_string().to_lowercase();
    if reported == address.as_str() {
        return Ok(true);
    }

    // CoreBluetooth masks MAC addresses behind opaque peripheral ids.
    Ok(peripheral.id().to_string().to_lowercase() == address.as_str())
}

fn collect_characteristics(peripheral: &Peripheral) -> HashMap<String, Characteristic> {
    let mut characteristics = HashMap::new();
    for service in peripheral.services() {
        for characteristic in &service.characteristics {
            characteristics
                .entry(characteristic.uuid.to_string().to_lowercase())
                .or_insert_with(|| characteristic.clone());
        }
    }
    characteristics
}

/// One established `btleplug` link.
#[derive(Debug)]
struct RealLink {
    address: DeviceAddress,
    peripheral: Peripheral,
    characteristics: HashMap<String, Characteristic>,
    service_uuids: Vec<String>,
    forwarders: Mutex<Vec<AbortHandle>>,
}

impl RealLink {
    fn characteristic_for(&self, endpoint: EndpointId) -> Result<&Characteristic, TransportError> {
        self.characteristics
            .get(endpoint_metadata(endpoint).uuid())
            .ok_or(TransportError::MissingEndpoint { endpoint })
    }
}

#[async_trait]
impl TransportLink for RealLink {
    fn address(&self) -> &DeviceAddress {
        &self.address
    }

    fn write_limit(&self) -> usize {
        let write_without_response = self.characteristics.values().any(|characteristic| {
            characteristic
                .properties
                .contains(CharPropFlags::WRITE_WITHOUT_RESPONSE)
        });
        if write_without_response {
            REQUESTED_ATT_MTU - ATT_WRITE_OVERHEAD
        } else {
            FALLBACK_WRITE_LIMIT
        }
    }

    fn has_service(&self, endpoint: EndpointId) -> bool {
        let uuid = endpoint_metadata(endpoint).uuid();
        self.service_uuids
            .iter()
            .any(|candidate| candidate.eq_ignore_ascii_case(uuid))
            || self.characteristics.contains_key(uuid)
    }

    #[instrument(skip(self, payload), level = "trace", fields(?endpoint, payload_len = payload.len()))]
    async fn write_endpoint(
        &self,
        endpoint: EndpointId,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        let write_limit = self.write_limit();
        if payload.len() > write_limit {
            return Err(TransportError::PayloadExceedsWriteLimit {
                payload_len: payload.len(),
                write_limit,
            });
        }

        let characteristic = self.characteristic_for(endpoint)?;
        let write_type = if characteristic
            .properties
            .contains(CharPropFlags::WRITE_WITHOUT_RESPONSE)
        {
            WriteType::WithoutResponse
        } else {
            WriteType::WithResponse
        };
        self.peripheral
            .write(characteristic, payload, write_type)
            .await?;
        Ok(())
    }

    #[instrument(skip(self), level = "debug", fields(?endpoint))]
    async fn subscribe(&self, endpoint: EndpointId) -> Result<NotificationStream, TransportError> {
        let characteristic = self.characteristic_for(endpoint)?.clone();
        self.peripheral.subscribe(&characteristic).await?;

        let mut notifications = self.peripheral.notifications().await?;
        let (sender, stream) = NotificationStream::channel();
        let expected_uuid = characteristic.uuid;
        let handle = tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                if notification.uuid != expected_uuid {
                    continue;
                }
                if sender.send(notification.value).await.is_err() {
                    break;
                }
            }
            trace!("notification forwarder finished");
        });
        self.forwarders
            .lock()
            .expect("forwarder lock should not be poisoned")
            .push(handle.abort_handle());

        Ok(stream)
    }

    #[instrument(skip(self), level = "debug")]
    async fn close(&self) -> Result<(), TransportError> {
        let forwarders = std::mem::take(
            &mut *self
                .forwarders
                .lock()
                .expect("forwarder lock should not be poisoned"),
        );
        for forwarder in forwarders {
            forwarder.abort();
        }

        if self.peripheral.is_connected().await? {
            self.peripheral.disconnect().await?;
        }
        Ok(())
    }
}
