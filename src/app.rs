use std::collections::BTreeSet;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use owo_colors::OwoColorize;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{Instant, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, warn};
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::ble::{
    BtleplugTransport, ConnectionConfig, ConnectionState, DeviceScript, FakeTransport,
    ProxyCandidate, ProxyConnectionManager, RadioArbiter, Transport,
};
use crate::cli::{Command, DiscoverArgs, LogLevel, RunOptions, TargetArgs, UpdateArgs};
use crate::dfu::{
    FirmwarePayload, FirmwareResolver, FleetDevice, HardwareIdResolver, QueueConfig,
    TransferClient, TransferConfig, TransferProgress, UpdateQueueManager, UpdateStage,
};
use crate::error::CoreError;
use crate::mesh::{
    CleartextCodec, DeviceAddress, DeviceStatus, GroupAddress, MeshCodec, MeshCredentials,
    MeshMessage, MeshMessenger, ProxyConfigMessage, ProxyPduType, StatusRouter,
    StatusSubscription, UnicastAddress,
};
use crate::mesh::pdu::{self, InboundPdu};
use crate::protocol::{ATT_WRITE_OVERHEAD, FALLBACK_WRITE_LIMIT};
use crate::telemetry;

const ONE_OFF_PROGRESS_CAPACITY: usize = 32;

/// The request/response boundary the UI layer talks to.
///
/// Wires the connection manager, messenger, status router, and update queue
/// over one shared transport and radio gate. Addresses cross this boundary
/// as strings and are canonicalized on entry.
pub struct MeshController {
    connections: Arc<ProxyConnectionManager>,
    messenger: Arc<MeshMessenger>,
    router: Arc<StatusRouter>,
    queue: UpdateQueueManager,
    transfers: TransferClient,
    pump_cancel: CancellationToken,
}

impl MeshController {
    /// Creates a controller with default tunables.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, codec: Arc<dyn MeshCodec>) -> Self {
        Self::with_configs(
            transport,
            codec,
            ConnectionConfig::default(),
            QueueConfig::default(),
        )
    }

    /// Creates a controller with explicit connection and queue tunables.
    #[must_use]
    pub fn with_configs(
        transport: Arc<dyn Transport>,
        codec: Arc<dyn MeshCodec>,
        connection_config: ConnectionConfig,
        queue_config: QueueConfig,
    ) -> Self {
        let radio = RadioArbiter::new();
        let connections = Arc::new(ProxyConnectionManager::new(
            transport.clone(),
            radio.clone(),
            connection_config,
        ));
        let messenger = Arc::new(MeshMessenger::new(connections.clone(), codec.clone()));
        let router = Arc::new(StatusRouter::new());
        let queue = UpdateQueueManager::new(transport.clone(), radio.clone(), queue_config);
        let transfers = TransferClient::new(transport, radio, TransferConfig::default());

        let pump_cancel = CancellationToken::new();
        tokio::spawn(pump_status(
            connections.inbound_pdus(),
            codec,
            router.clone(),
            pump_cancel.clone(),
        ));

        Self {
            connections,
            messenger,
            router,
            queue,
            transfers,
            pump_cancel,
        }
    }

    /// Installs mesh credentials from hex key strings.
    ///
    /// # Errors
    ///
    /// Returns an error when either key fails to parse.
    pub fn set_mesh_credentials(
        &self,
        net_key_hex: &str,
        app_key_hex: &str,
    ) -> Result<bool, CoreError> {
        let credentials = MeshCredentials::parse(net_key_hex, app_key_hex)?;
        self.messenger.set_credentials(credentials);
        Ok(true)
    }

    /// Drives the proxy connection to ready via the supplied candidates.
    ///
    /// # Errors
    ///
    /// Returns an error when no candidate yields a proxy connection.
    pub async fn ensure_proxy_connection(
        &self,
        proxy_address: &str,
        known_device_addresses: &[&str],
    ) -> Result<bool, CoreError> {
        let mut candidates = vec![ProxyCandidate::known_proxy(proxy_address.parse()?)];
        for address in known_device_addresses {
            candidates.push(ProxyCandidate::new(address.parse()?));
        }
        self.connections.ensure_connection(&candidates).await?;
        Ok(true)
    }

    /// Whitelists the unicast addresses replies are expected from.
    ///
    /// # Errors
    ///
    /// Returns an error when no connection is ready or a write fails.
    pub async fn configure_proxy_filter(
        &self,
        device_addresses: &[u16],
    ) -> Result<bool, CoreError> {
        let mut unicasts = Vec::with_capacity(device_addresses.len());
        for &address in device_addresses {
            unicasts.push(UnicastAddress::try_from(address)?);
        }
        self.messenger.configure_filter(&unicasts).await?;
        Ok(true)
    }

    /// Sends a Generic OnOff Set to a group, connecting first if candidates
    /// are supplied.
    ///
    /// # Errors
    ///
    /// Returns an error for connection failures and send failures.
    pub async fn send_group_message(
        &self,
        group_address: u16,
        proxy_candidates: &[&str],
        on_off_state: bool,
    ) -> Result<bool, CoreError> {
        let group = GroupAddress::try_from(group_address)?;
        if !proxy_candidates.is_empty() {
            let mut candidates = Vec::with_capacity(proxy_candidates.len());
            for address in proxy_candidates {
                candidates.push(ProxyCandidate::new(address.parse()?));
            }
            self.connections.ensure_connection(&candidates).await?;
        }

        self.messenger
            .send(&MeshMessage::generic_onoff_set(group, on_off_state))
            .await?;
        Ok(true)
    }

    /// Sends a Generic OnOff Set to a single node.
    ///
    /// # Errors
    ///
    /// Returns an error for connection failures and send failures.
    pub async fn send_unicast_message(
        &self,
        unicast_address: u16,
        on_off_state: bool,
        proxy_address: Option<&str>,
    ) -> Result<bool, CoreError> {
        let unicast = UnicastAddress::try_from(unicast_address)?;
        if let Some(proxy) = proxy_address {
            let candidate = ProxyCandidate::known_proxy(proxy.parse()?);
            self.connections.ensure_connection(&[candidate]).await?;
        }

        self.messenger
            .send(&MeshMessage::generic_onoff_set(unicast, on_off_state))
            .await?;
        Ok(true)
    }

    /// Probes a group; members confirm through device-status events.
    ///
    /// Fire-and-collect: this returns as soon as the probe is submitted, and
    /// the caller owns the reply-collection window.
    ///
    /// # Errors
    ///
    /// Returns an error when the probe cannot be submitted.
    pub async fn discover_group_members(
        &self,
        group_address: u16,
        probe_state: bool,
    ) -> Result<bool, CoreError> {
        let group = GroupAddress::try_from(group_address)?;
        self.messenger
            .send(&MeshMessage::generic_onoff_set(group, probe_state))
            .await?;
        Ok(true)
    }

    /// Subscribes to status events from every device.
    #[must_use]
    pub fn device_status_events(&self) -> StatusSubscription {
        self.router.subscribe_all()
    }

    /// Subscribes to status events from one device.
    #[must_use]
    pub fn status_events_for(&self, address: UnicastAddress) -> StatusSubscription {
        self.router.subscribe(address)
    }

    /// Returns the proxy connection state.
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.connections.state()
    }

    /// Tears down the proxy connection.
    pub async fn disconnect_proxy(&self) {
        self.connections.disconnect().await;
    }

    /// Returns the negotiated MTU of the active link, or the BLE default.
    pub async fn mtu(&self) -> usize {
        match self.connections.active_link().await {
            Some(link) => link.write_limit() + ATT_WRITE_OVERHEAD,
            None => FALLBACK_WRITE_LIMIT + ATT_WRITE_OVERHEAD,
        }
    }

    /// Returns the update queue.
    #[must_use]
    pub fn queue(&self) -> &UpdateQueueManager {
        &self.queue
    }

    /// Releases the proxy connection and enqueues an update run.
    ///
    /// Mesh messaging and firmware transfer never interleave on the radio,
    /// so the proxy link is handed back before workers start.
    pub async fn start_updates(
        &self,
        devices: &[FleetDevice],
        resolver: &dyn FirmwareResolver,
    ) -> usize {
        self.connections.disconnect().await;
        self.queue.start_updates(devices, resolver).await
    }

    /// Runs one out-of-queue firmware upload, returning its progress stream.
    ///
    /// # Errors
    ///
    /// Returns an error when the address fails to parse; transfer errors
    /// surface as a terminal `Failed` progress event.
    pub async fn upload_firmware(
        &self,
        address: &str,
        firmware: FirmwarePayload,
    ) -> Result<mpsc::Receiver<TransferProgress>, CoreError> {
        let address: DeviceAddress = address.parse()?;
        self.connections.disconnect().await;

        let (progress_tx, progress_rx) = mpsc::channel(ONE_OFF_PROGRESS_CAPACITY);
        let transfers = self.transfers.clone();
        tokio::spawn(async move {
            let cancel = CancellationToken::new();
            let total = firmware.total_bytes();
            if let Err(error) = transfers
                .run(&address, &firmware, &progress_tx, &cancel)
                .await
            {
                warn!(%address, %error, "one-off firmware upload failed");
                let _ = progress_tx
                    .send(TransferProgress::new(UpdateStage::Failed, 0, total))
                    .await;
            }
        });

        Ok(progress_rx)
    }

    /// Reboots one device into its pending image.
    ///
    /// # Errors
    ///
    /// Returns an error when the device cannot be reached or rejects the
    /// command.
    pub async fn reset_device(&self, address: &str) -> Result<bool, CoreError> {
        let address: DeviceAddress = address.parse()?;
        self.connections.disconnect().await;

        let mut session = self.transfers.connect(&address).await?;
        let outcome = session.reset().await;
        session.close().await;
        outcome?;
        Ok(true)
    }
}

impl Drop for MeshController {
    fn drop(&mut self) {
        self.pump_cancel.cancel();
    }
}

/// Decodes reassembled inbound PDUs and feeds the status router.
async fn pump_status(
    mut inbound: broadcast::Receiver<InboundPdu>,
    codec: Arc<dyn MeshCodec>,
    router: Arc<StatusRouter>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            received = inbound.recv() => match received {
                Ok(inbound_pdu) => match inbound_pdu.pdu_type {
                    ProxyPduType::Network => {
                        match codec.decode_status(&inbound_pdu.payload) {
                            Ok(Some(status)) => router.route(status),
                            Ok(None) => {}
                            Err(error) => {
                                router.discard_malformed(&inbound_pdu.payload, &error.to_string());
                            }
                        }
                    }
                    ProxyPduType::ProxyConfig => {
                        if let Ok(ProxyConfigMessage::FilterStatus { filter_type, list_size }) =
                            pdu::parse_config_message(&inbound_pdu.payload)
                        {
                            debug!(%filter_type, list_size, "proxy filter status");
                        }
                    }
                    ProxyPduType::MeshBeacon | ProxyPduType::Provisioning => {}
                },
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    debug!(missed, "status pump lagged behind inbound PDUs");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

/// Runs one CLI command, building the transport selected by the options.
///
/// # Errors
///
/// Returns an error when the transport cannot be created or the command
/// fails.
pub async fn run<W>(command: Command, out: &mut W, options: RunOptions) -> anyhow::Result<()>
where
    W: Write,
{
    run_with_log_level(command, out, options, None).await
}

/// Runs one CLI command with an explicit telemetry log-level override.
///
/// # Errors
///
/// Returns an error when tracing initialisation, transport creation, or the
/// command fails.
pub async fn run_with_log_level<W>(
    command: Command,
    out: &mut W,
    options: RunOptions,
    log_level: Option<LogLevel>,
) -> anyhow::Result<()>
where
    W: Write,
{
    let directive = log_level.map_or("warn", LogLevel::directive);
    if let Err(error) = telemetry::initialise_tracing("meshfleet", directive, !options.json) {
        return Err(anyhow::anyhow!(error.to_string()));
    }

    let transport: Arc<dyn Transport> = match &options.fake_devices {
        Some(scripts) => {
            info!("using fake loopback transport");
            let fake = FakeTransport::with_devices(scripts.iter().cloned());
            if let Command::Update(update) = &command {
                register_fake_update_targets(&fake, update)?;
            }
            Arc::new(fake)
        }
        None => Arc::new(BtleplugTransport::new().await?),
    };

    run_with_transport(command, out, transport, &options).await
}

/// Registers default scripts for update targets missing from the fixture.
fn register_fake_update_targets(fake: &FakeTransport, update: &UpdateArgs) -> anyhow::Result<()> {
    for pair in &update.devices {
        let (address, _hardware_id) = parse_device_pair(pair)?;
        if !fake.has_device(&address) {
            fake.register(DeviceScript::builder().address(address).build());
        }
    }
    Ok(())
}

/// Runs one CLI command over an injected transport.
///
/// # Errors
///
/// Returns an error when the command fails.
pub async fn run_with_transport<W>(
    command: Command,
    out: &mut W,
    transport: Arc<dyn Transport>,
    options: &RunOptions,
) -> anyhow::Result<()>
where
    W: Write,
{
    let queue_config = match &command {
        Command::Update(update) => QueueConfig::builder()
            .max_concurrent(update.max_concurrent)
            .build(),
        _other => QueueConfig::default(),
    };
    let controller = MeshController::with_configs(
        transport,
        Arc::new(CleartextCodec),
        ConnectionConfig::default(),
        queue_config,
    );

    if let (Some(net_key), Some(app_key)) = (&options.net_key, &options.app_key) {
        controller.set_mesh_credentials(net_key, app_key)?;
    }

    match command {
        Command::On(target) => run_switch(&controller, out, &target, true, options.json).await,
        Command::Off(target) => run_switch(&controller, out, &target, false, options.json).await,
        Command::Discover(discover) => {
            run_discover(&controller, out, &discover, options.json).await
        }
        Command::Update(update) => run_update(&controller, out, &update, options.json).await,
    }
}

async fn run_switch<W>(
    controller: &MeshController,
    out: &mut W,
    target: &TargetArgs,
    on: bool,
    json: bool,
) -> anyhow::Result<()>
where
    W: Write,
{
    let candidates: Vec<&str> = target.candidates.iter().map(String::as_str).collect();
    controller
        .ensure_proxy_connection(&target.proxy, &candidates)
        .await?;

    let mut expected = target.expect.clone();
    if let Some(unicast) = target.unicast {
        expected.push(unicast);
    }
    if !expected.is_empty() {
        controller.configure_proxy_filter(&expected).await?;
    }

    let mut events = controller.device_status_events();
    if let Some(group) = target.group {
        controller.send_group_message(group, &[], on).await?;
    } else if let Some(unicast) = target.unicast {
        controller.send_unicast_message(unicast, on, None).await?;
    } else {
        anyhow::bail!("pass either --group or --unicast");
    }

    let confirmations = collect_statuses(&mut events, target.reply_window, out, json).await?;
    writeln!(
        out,
        "{} command sent, {confirmations} confirmation(s)",
        "✓".green()
    )?;
    Ok(())
}

async fn run_discover<W>(
    controller: &MeshController,
    out: &mut W,
    discover: &DiscoverArgs,
    json: bool,
) -> anyhow::Result<()>
where
    W: Write,
{
    let candidates: Vec<&str> = discover.candidates.iter().map(String::as_str).collect();
    controller
        .ensure_proxy_connection(&discover.proxy, &candidates)
        .await?;
    if !discover.expect.is_empty() {
        controller.configure_proxy_filter(&discover.expect).await?;
    }

    let mut events = controller.device_status_events();
    controller
        .discover_group_members(discover.group, discover.probe_state.as_bool())
        .await?;

    let mut members = BTreeSet::new();
    let deadline = Instant::now() + discover.reply_window;
    loop {
        match timeout_at(deadline, events.recv()).await {
            Ok(Some(status)) => {
                if members.insert(status.unicast_address()) && !json {
                    writeln!(out, "member {}", status.unicast_address())?;
                }
            }
            Ok(None) | Err(_) => break,
        }
    }

    if json {
        let members: Vec<&UnicastAddress> = members.iter().collect();
        writeln!(out, "{}", serde_json::to_string(&members)?)?;
    } else {
        writeln!(
            out,
            "{} {} member(s) confirmed within {:?}",
            "✓".green(),
            members.len(),
            discover.reply_window
        )?;
    }
    Ok(())
}

async fn run_update<W>(
    controller: &MeshController,
    out: &mut W,
    update: &UpdateArgs,
    json: bool,
) -> anyhow::Result<()>
where
    W: Write,
{
    let data = std::fs::read(&update.firmware)
        .with_context(|| format!("failed to read firmware file {}", update.firmware.display()))?;
    let firmware = FirmwarePayload::new(&update.fw_version, &update.hardware_id, data);
    let resolver = HardwareIdResolver::new().with_firmware(firmware);

    let mut devices = Vec::with_capacity(update.devices.len());
    for pair in &update.devices {
        let (address, hardware_id) = parse_device_pair(pair)?;
        devices.push(FleetDevice::new(address, hardware_id));
    }

    let mut events = controller.queue().events();
    let enqueued = controller.start_updates(&devices, &resolver).await;
    writeln!(out, "queued {enqueued} of {} device(s)", devices.len())?;
    if enqueued == 0 {
        return Ok(());
    }

    let span = tracing::info_span!("firmware update run");
    span.pb_set_length(enqueued as u64);
    let summary = async {
        loop {
            match events.recv().await {
                Ok(event) => {
                    let current = tracing::Span::current();
                    current.pb_set_position((event.summary.completed + event.summary.failed) as u64);
                    current.pb_set_message(&format!(
                        "{} {} ({:.0}%)",
                        event.device,
                        event.stage,
                        TransferProgress::new(
                            event.stage,
                            event.bytes_transferred,
                            event.total_bytes
                        )
                        .percentage()
                    ));

                    if json {
                        writeln!(
                            out,
                            "{}",
                            serde_json::json!({
                                "device": event.device.as_str(),
                                "stage": event.stage,
                                "bytes": event.bytes_transferred,
                                "total": event.total_bytes,
                                "retries": event.retry_count,
                                "error": event.error_message,
                            })
                        )?;
                    } else if matches!(event.stage, UpdateStage::Complete | UpdateStage::Failed) {
                        let glyph = if event.stage == UpdateStage::Complete {
                            "✓".green().to_string()
                        } else {
                            "✗".red().to_string()
                        };
                        let detail = event.error_message.unwrap_or_default();
                        writeln!(out, "{glyph} {} {} {detail}", event.device, event.stage)?;
                    }

                    let settled = event.summary.completed + event.summary.failed;
                    if settled == event.summary.total {
                        break Ok::<_, anyhow::Error>(event.summary);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    debug!(missed, "queue event stream lagged");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    break Ok(controller.queue().summary().await);
                }
            }
        }
    }
    .instrument(span)
    .await?;

    if json {
        writeln!(out, "{}", serde_json::to_string(&summary)?)?;
    } else {
        let glyph = if summary.failed == 0 {
            "✓".green().to_string()
        } else {
            "✗".red().to_string()
        };
        writeln!(
            out,
            "{glyph} {} complete, {} failed, overall {:.0}%",
            summary.completed,
            summary.failed,
            summary.overall_progress() * 100.0
        )?;
    }
    Ok(())
}

async fn collect_statuses<W>(
    events: &mut StatusSubscription,
    window: Duration,
    out: &mut W,
    json: bool,
) -> anyhow::Result<usize>
where
    W: Write,
{
    let mut seen: BTreeSet<UnicastAddress> = BTreeSet::new();
    let deadline = Instant::now() + window;
    loop {
        match timeout_at(deadline, events.recv()).await {
            Ok(Some(status)) => {
                // Repeated replies refresh state; only the latest matters.
                let fresh = seen.insert(status.unicast_address());
                if json {
                    writeln!(out, "{}", serde_json::to_string(&status)?)?;
                } else if fresh {
                    write_status_line(out, &status)?;
                }
            }
            Ok(None) | Err(_) => break,
        }
    }
    Ok(seen.len())
}

fn write_status_line<W>(out: &mut W, status: &DeviceStatus) -> anyhow::Result<()>
where
    W: Write,
{
    writeln!(
        out,
        "{} reports {}",
        status.unicast_address(),
        if status.present_state() { "on" } else { "off" }
    )?;
    Ok(())
}

fn parse_device_pair(pair: &str) -> anyhow::Result<(DeviceAddress, String)> {
    let (address, hardware_id) = pair
        .split_once('=')
        .with_context(|| format!("device `{pair}` is not an `address=hardware_id` pair"))?;
    let address: DeviceAddress = address
        .trim()
        .parse()
        .with_context(|| format!("invalid device address in `{pair}`"))?;
    Ok((address, hardware_id.trim().to_string()))
}
