use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bon::Builder;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, trace};

use super::transport::{
    CONNECT_ATTEMPTS, CONNECT_RETRY_DELAY, NotificationStream, Transport, TransportLink,
};
use crate::dfu::protocol::{
    DfuRequest, DfuResponse, ImageSlot, decode_request, encode_response,
};
use crate::error::TransportError;
use crate::mesh::codec::{self, LOCAL_ELEMENT_ADDRESS, Opcode};
use crate::mesh::pdu::{
    self, FilterType, ProxyConfigMessage, ProxyPduType, Reassembler,
};
use crate::mesh::{DeviceAddress, UnicastAddress};
use crate::protocol::EndpointId;

const DEFAULT_FAKE_WRITE_LIMIT: usize = 244;
const ALWAYS: u32 = u32::MAX;

/// Behaviour script for one fake peripheral.
///
/// Counters of [`DeviceScript::always`] never decrement, so the scripted
/// failure applies to every attempt.
#[derive(Debug, Clone, Builder)]
pub struct DeviceScript {
    address: DeviceAddress,
    #[builder(default = true)]
    proxy_service: bool,
    #[builder(default = true)]
    firmware_service: bool,
    /// Number of connect attempts to refuse before accepting.
    #[builder(default)]
    refuse_connects: u32,
    #[builder(default)]
    connect_delay: Duration,
    /// Delay applied to every accepted write.
    #[builder(default)]
    write_delay: Duration,
    /// Number of writes to reject before accepting.
    #[builder(default)]
    fail_writes: u32,
    #[builder(default = DEFAULT_FAKE_WRITE_LIMIT)]
    write_limit: usize,
    /// Mesh nodes reachable behind this proxy that answer OnOff messages.
    #[builder(default)]
    mesh_nodes: Vec<UnicastAddress>,
    /// Reports a corrupted digest for uploaded images, failing verification.
    #[builder(default)]
    corrupt_uploads: bool,
    /// Raw fragments pushed to the mesh data-out stream on subscribe.
    #[builder(default)]
    canned_mesh_notifications: Vec<Vec<u8>>,
}

impl DeviceScript {
    /// Sentinel for scripted failures that never stop applying.
    #[must_use]
    pub const fn always() -> u32 {
        ALWAYS
    }

    /// Returns the scripted address.
    #[must_use]
    pub fn address(&self) -> &DeviceAddress {
        &self.address
    }
}

#[derive(Debug, Default)]
struct FakeStats {
    connect_attempts: AtomicUsize,
    dropped_replies: AtomicUsize,
}

#[derive(Debug, Default)]
struct DfuDeviceState {
    expected_total: u32,
    declared_digest: [u8; 32],
    received: Vec<u8>,
    pending_image: Option<ImageSlot>,
}

/// Durable per-device state shared across reconnects.
#[derive(Debug)]
struct DeviceRuntime {
    refusals_remaining: AtomicU32,
    write_failures_remaining: AtomicU32,
    node_states: Mutex<HashMap<u16, bool>>,
    reset_count: AtomicUsize,
    dfu: Mutex<DfuDeviceState>,
}

impl DeviceRuntime {
    fn new(script: &DeviceScript) -> Self {
        Self {
            refusals_remaining: AtomicU32::new(script.refuse_connects),
            write_failures_remaining: AtomicU32::new(script.fail_writes),
            node_states: Mutex::new(HashMap::new()),
            reset_count: AtomicUsize::new(0),
            dfu: Mutex::new(DfuDeviceState::default()),
        }
    }

    fn consume(counter: &AtomicU32) -> bool {
        let mut current = counter.load(Ordering::SeqCst);
        loop {
            if current == 0 {
                return false;
            }
            if current == ALWAYS {
                return true;
            }
            match counter.compare_exchange(
                current,
                current - 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_previous) => return true,
                Err(observed) => current = observed,
            }
        }
    }
}

/// In-memory transport used by tests and `--fake` runs.
///
/// Every scripted peripheral behaves as a loopback mesh proxy plus firmware
/// endpoint: proxy filter configuration and OnOff messages get protocol-level
/// replies, firmware frames get acknowledgements, so full flows run with no
/// radio present.
#[derive(Debug, Default)]
pub struct FakeTransport {
    scripts: Mutex<HashMap<DeviceAddress, DeviceScript>>,
    runtimes: Mutex<HashMap<DeviceAddress, Arc<DeviceRuntime>>>,
    stats: Arc<FakeStats>,
}

impl FakeTransport {
    /// Creates a transport with no scripted peripherals.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a transport pre-loaded with scripted peripherals.
    #[must_use]
    pub fn with_devices(scripts: impl IntoIterator<Item = DeviceScript>) -> Self {
        let transport = Self::new();
        for script in scripts {
            transport.register(script);
        }
        transport
    }

    /// Registers or replaces one peripheral script.
    pub fn register(&self, script: DeviceScript) {
        let address = script.address.clone();
        self.runtimes
            .lock()
            .expect("fake transport lock should not be poisoned")
            .insert(address.clone(), Arc::new(DeviceRuntime::new(&script)));
        self.scripts
            .lock()
            .expect("fake transport lock should not be poisoned")
            .insert(address, script);
    }

    /// Returns whether a script is registered for one address.
    #[must_use]
    pub fn has_device(&self, address: &DeviceAddress) -> bool {
        self.scripts
            .lock()
            .expect("fake transport lock should not be poisoned")
            .contains_key(address)
    }

    /// Returns the number of physical connect attempts made so far.
    #[must_use]
    pub fn connect_attempts(&self) -> usize {
        self.stats.connect_attempts.load(Ordering::SeqCst)
    }

    /// Returns the number of status replies dropped by unconfigured filters.
    #[must_use]
    pub fn dropped_replies(&self) -> usize {
        self.stats.dropped_replies.load(Ordering::SeqCst)
    }

    /// Returns how many reset commands one peripheral acknowledged.
    #[must_use]
    pub fn reset_count(&self, address: &DeviceAddress) -> usize {
        self.runtimes
            .lock()
            .expect("fake transport lock should not be poisoned")
            .get(address)
            .map_or(0, |runtime| runtime.reset_count.load(Ordering::SeqCst))
    }

    /// Returns one mesh node's last applied OnOff state.
    #[must_use]
    pub fn node_state(&self, proxy: &DeviceAddress, node: UnicastAddress) -> Option<bool> {
        self.runtimes
            .lock()
            .expect("fake transport lock should not be poisoned")
            .get(proxy)
            .and_then(|runtime| {
                runtime
                    .node_states
                    .lock()
                    .expect("fake node lock should not be poisoned")
                    .get(&node.value())
                    .copied()
            })
    }

    fn lookup(
        &self,
        address: &DeviceAddress,
    ) -> Result<(DeviceScript, Arc<DeviceRuntime>), TransportError> {
        let script = self
            .scripts
            .lock()
            .expect("fake transport lock should not be poisoned")
            .get(address)
            .cloned()
            .ok_or_else(|| TransportError::PeripheralNotFound {
                address: address.to_string(),
            })?;
        let runtime = self
            .runtimes
            .lock()
            .expect("fake transport lock should not be poisoned")
            .get(address)
            .cloned()
            .expect("script and runtime maps should stay in step");
        Ok((script, runtime))
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn connect(
        &self,
        address: &DeviceAddress,
    ) -> Result<Box<dyn TransportLink>, TransportError> {
        let (script, runtime) = self.lookup(address)?;

        for attempt in 1..=CONNECT_ATTEMPTS {
            self.stats.connect_attempts.fetch_add(1, Ordering::SeqCst);
            if !script.connect_delay.is_zero() {
                sleep(script.connect_delay).await;
            }

            if DeviceRuntime::consume(&runtime.refusals_remaining) {
                trace!(%address, attempt, "fake peripheral refused connect attempt");
                if attempt < CONNECT_ATTEMPTS {
                    sleep(CONNECT_RETRY_DELAY).await;
                }
                continue;
            }

            debug!(%address, attempt, "fake peripheral connected");
            return Ok(Box::new(FakeLink::new(script, runtime, self.stats.clone())));
        }

        Err(TransportError::ConnectAttemptsExhausted {
            address: address.to_string(),
            attempts: CONNECT_ATTEMPTS,
        })
    }
}

#[derive(Debug)]
struct FakeLink {
    script: DeviceScript,
    runtime: Arc<DeviceRuntime>,
    stats: Arc<FakeStats>,
    closed: AtomicBool,
    reassembler: Mutex<Reassembler>,
    filter: Mutex<Option<BTreeSet<u16>>>,
    mesh_out: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    firmware_out: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
}

impl FakeLink {
    fn new(script: DeviceScript, runtime: Arc<DeviceRuntime>, stats: Arc<FakeStats>) -> Self {
        Self {
            script,
            runtime,
            stats,
            closed: AtomicBool::new(false),
            reassembler: Mutex::new(Reassembler::new()),
            filter: Mutex::new(None),
            mesh_out: Mutex::new(None),
            firmware_out: Mutex::new(None),
        }
    }

    fn push_mesh(&self, pdu_type: ProxyPduType, payload: &[u8]) {
        let sender = self
            .mesh_out
            .lock()
            .expect("fake link lock should not be poisoned")
            .clone();
        let Some(sender) = sender else {
            return;
        };
        let Ok(fragments) = pdu::segment(pdu_type, payload, self.script.write_limit) else {
            return;
        };
        for fragment in fragments {
            let _ = sender.try_send(fragment);
        }
    }

    fn handle_proxy_config(&self, payload: &[u8]) {
        match pdu::parse_config_message(payload) {
            Ok(ProxyConfigMessage::SetFilterType(_filter_type)) => {
                let mut filter = self
                    .filter
                    .lock()
                    .expect("fake link lock should not be poisoned");
                *filter = Some(BTreeSet::new());
                self.push_mesh(
                    ProxyPduType::ProxyConfig,
                    &pdu::encode_filter_status(FilterType::Whitelist, 0),
                );
            }
            Ok(ProxyConfigMessage::AddAddresses(addresses)) => {
                let list_size = {
                    let mut filter = self
                        .filter
                        .lock()
                        .expect("fake link lock should not be poisoned");
                    let entries = filter.get_or_insert_with(BTreeSet::new);
                    entries.extend(addresses);
                    u16::try_from(entries.len()).unwrap_or(u16::MAX)
                };
                self.push_mesh(
                    ProxyPduType::ProxyConfig,
                    &pdu::encode_filter_status(FilterType::Whitelist, list_size),
                );
            }
            Ok(ProxyConfigMessage::FilterStatus { .. }) | Err(_) => {
                trace!("fake proxy ignoring configuration payload");
            }
        }
    }

    fn handle_network(&self, payload: &[u8]) {
        let Ok(frame) = codec::decode_frame(payload) else {
            trace!("fake proxy ignoring undecodable network PDU");
            return;
        };

        let responders: Vec<UnicastAddress> = self
            .script
            .mesh_nodes
            .iter()
            .copied()
            .filter(|node| {
                frame.destination == node.value() || frame.destination >= 0xC000
            })
            .collect();

        for node in responders {
            let state = {
                let mut states = self
                    .runtime
                    .node_states
                    .lock()
                    .expect("fake node lock should not be poisoned");
                match frame.opcode {
                    Opcode::GenericOnOffSet | Opcode::GenericOnOffSetUnacknowledged => {
                        let requested = frame.parameters.first().is_some_and(|&value| value != 0);
                        states.insert(node.value(), requested);
                        requested
                    }
                    Opcode::GenericOnOffGet => {
                        states.get(&node.value()).copied().unwrap_or(false)
                    }
                    Opcode::GenericOnOffStatus => return,
                }
            };

            let whitelisted = self
                .filter
                .lock()
                .expect("fake link lock should not be poisoned")
                .as_ref()
                .is_some_and(|filter| filter.contains(&node.value()));
            if !whitelisted {
                self.stats.dropped_replies.fetch_add(1, Ordering::SeqCst);
                trace!(node = %node, "fake proxy dropping reply outside filter");
                continue;
            }

            let status = codec::encode_frame(
                node.value(),
                LOCAL_ELEMENT_ADDRESS,
                Opcode::GenericOnOffStatus,
                frame.transaction_id,
                &[u8::from(state)],
            );
            self.push_mesh(ProxyPduType::Network, &status);
        }
    }

    fn handle_firmware(&self, payload: &[u8]) {
        let Ok((seq, request)) = decode_request(payload) else {
            trace!("fake firmware endpoint ignoring undecodable frame");
            return;
        };

        let response = match request {
            DfuRequest::ImageUpload {
                offset,
                crc32,
                init,
                data,
            } => {
                let mut dfu = self
                    .runtime
                    .dfu
                    .lock()
                    .expect("fake dfu lock should not be poisoned");
                if let Some(init) = init {
                    dfu.expected_total = init.total_len;
                    dfu.declared_digest = init.digest;
                    dfu.received.clear();
                    dfu.pending_image = None;
                }

                if crc32fast::hash(&data) != crc32 {
                    DfuResponse::UploadAck {
                        rc: 2,
                        offset: u32::try_from(dfu.received.len()).unwrap_or(u32::MAX),
                    }
                } else if usize::try_from(offset).unwrap_or(usize::MAX) != dfu.received.len() {
                    DfuResponse::UploadAck {
                        rc: 1,
                        offset: u32::try_from(dfu.received.len()).unwrap_or(u32::MAX),
                    }
                } else {
                    dfu.received.extend_from_slice(&data);
                    let received = u32::try_from(dfu.received.len()).unwrap_or(u32::MAX);
                    if received == dfu.expected_total {
                        let mut digest = dfu.declared_digest;
                        if self.script.corrupt_uploads {
                            digest[0] ^= 0xFF;
                        }
                        dfu.pending_image = Some(ImageSlot {
                            slot: 1,
                            version: String::new(),
                            digest,
                            bootable: true,
                            pending: true,
                            confirmed: false,
                            active: false,
                        });
                    }
                    DfuResponse::UploadAck {
                        rc: 0,
                        offset: received,
                    }
                }
            }
            DfuRequest::ImageState => {
                let dfu = self
                    .runtime
                    .dfu
                    .lock()
                    .expect("fake dfu lock should not be poisoned");
                let mut images = vec![ImageSlot {
                    slot: 0,
                    version: "1.0.0".to_string(),
                    digest: [0u8; 32],
                    bootable: true,
                    pending: false,
                    confirmed: true,
                    active: true,
                }];
                images.extend(dfu.pending_image.clone());
                DfuResponse::ImageState { images }
            }
            DfuRequest::Reset => {
                self.runtime.reset_count.fetch_add(1, Ordering::SeqCst);
                DfuResponse::ResetAck { rc: 0 }
            }
        };

        let sender = self
            .firmware_out
            .lock()
            .expect("fake link lock should not be poisoned")
            .clone();
        if let Some(sender) = sender {
            let _ = sender.try_send(encode_response(seq, &response));
        }
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::LinkClosed {
                address: self.script.address.to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl TransportLink for FakeLink {
    fn address(&self) -> &DeviceAddress {
        &self.script.address
    }

    fn write_limit(&self) -> usize {
        self.script.write_limit
    }

    fn has_service(&self, endpoint: EndpointId) -> bool {
        match endpoint {
            EndpointId::MeshProxyService => self.script.proxy_service,
            EndpointId::FirmwareService => self.script.firmware_service,
            EndpointId::MeshDataIn | EndpointId::MeshDataOut => self.script.proxy_service,
            EndpointId::FirmwareData => self.script.firmware_service,
        }
    }

    async fn write_endpoint(
        &self,
        endpoint: EndpointId,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        self.ensure_open()?;

        if payload.len() > self.script.write_limit {
            return Err(TransportError::PayloadExceedsWriteLimit {
                payload_len: payload.len(),
                write_limit: self.script.write_limit,
            });
        }

        if DeviceRuntime::consume(&self.runtime.write_failures_remaining) {
            return Err(TransportError::WriteRejected {
                reason: "scripted write failure".to_string(),
            });
        }

        if !self.script.write_delay.is_zero() {
            sleep(self.script.write_delay).await;
        }

        match endpoint {
            EndpointId::MeshDataIn => {
                if !self.script.proxy_service {
                    return Err(TransportError::MissingEndpoint { endpoint });
                }
                let complete = self
                    .reassembler
                    .lock()
                    .expect("fake link lock should not be poisoned")
                    .feed(payload)
                    .map_err(|error| TransportError::WriteRejected {
                        reason: error.to_string(),
                    })?;
                if let Some(pdu) = complete {
                    match pdu.pdu_type {
                        ProxyPduType::ProxyConfig => self.handle_proxy_config(&pdu.payload),
                        ProxyPduType::Network => self.handle_network(&pdu.payload),
                        ProxyPduType::MeshBeacon | ProxyPduType::Provisioning => {}
                    }
                }
                Ok(())
            }
            EndpointId::FirmwareData => {
                if !self.script.firmware_service {
                    return Err(TransportError::MissingEndpoint { endpoint });
                }
                self.handle_firmware(payload);
                Ok(())
            }
            _other => Err(TransportError::Unsupported {
                operation: "write to non-writable endpoint",
            }),
        }
    }

    async fn subscribe(&self, endpoint: EndpointId) -> Result<NotificationStream, TransportError> {
        self.ensure_open()?;

        match endpoint {
            EndpointId::MeshDataOut => {
                let (sender, stream) = NotificationStream::channel();
                for fragment in &self.script.canned_mesh_notifications {
                    let _ = sender.try_send(fragment.clone());
                }
                *self
                    .mesh_out
                    .lock()
                    .expect("fake link lock should not be poisoned") = Some(sender);
                Ok(stream)
            }
            EndpointId::FirmwareData => {
                let (sender, stream) = NotificationStream::channel();
                *self
                    .firmware_out
                    .lock()
                    .expect("fake link lock should not be poisoned") = Some(sender);
                Ok(stream)
            }
            _other => Err(TransportError::Unsupported {
                operation: "subscribe to non-notifying endpoint",
            }),
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        self.mesh_out
            .lock()
            .expect("fake link lock should not be poisoned")
            .take();
        self.firmware_out
            .lock()
            .expect("fake link lock should not be poisoned")
            .take();
        Ok(())
    }
}
