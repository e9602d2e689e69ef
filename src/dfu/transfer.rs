use std::sync::Arc;
use std::time::Duration;

use bon::Builder;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace};

use super::firmware::FirmwarePayload;
use super::protocol::{
    CHUNK_PRELUDE_LEN, DfuRequest, DfuResponse, HEADER_LEN, INIT_FIELDS_LEN, UploadInit,
    decode_response, encode_request,
};
use super::task::{UpdateError, UpdateStage};
use crate::ble::{NotificationStream, RadioArbiter, Transport, TransferPermit, TransportLink};
use crate::mesh::DeviceAddress;
use crate::protocol::EndpointId;

const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);
const RESET_RESPONSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Tunables for one transfer client.
#[derive(Debug, Clone, Builder)]
pub struct TransferConfig {
    /// How long to wait for each device acknowledgement.
    #[builder(default = DEFAULT_RESPONSE_TIMEOUT)]
    response_timeout: Duration,
    /// Pacing delay applied between upload chunks.
    #[builder(default)]
    per_chunk_delay: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// One progress event pushed during a transfer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransferProgress {
    stage: UpdateStage,
    bytes_transferred: u64,
    total_bytes: u64,
}

impl TransferProgress {
    /// Creates a progress event.
    #[must_use]
    pub fn new(stage: UpdateStage, bytes_transferred: u64, total_bytes: u64) -> Self {
        Self {
            stage,
            bytes_transferred,
            total_bytes,
        }
    }

    /// Returns the stage this event was emitted in.
    #[must_use]
    pub fn stage(&self) -> UpdateStage {
        self.stage
    }

    /// Returns bytes transferred so far in this attempt.
    #[must_use]
    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred
    }

    /// Returns the image size.
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Maps the event onto the fixed percentage bands: connecting 0–10,
    /// uploading 10–80 (linear in bytes), verifying 80–95, rebooting 95–100.
    ///
    /// ```
    /// use meshfleet::{TransferProgress, UpdateStage};
    ///
    /// let halfway = TransferProgress::new(UpdateStage::Uploading, 512, 1024);
    /// assert_eq!(45.0, halfway.percentage());
    /// assert_eq!(80.0, TransferProgress::new(UpdateStage::Verifying, 1024, 1024).percentage());
    /// assert_eq!(100.0, TransferProgress::new(UpdateStage::Complete, 1024, 1024).percentage());
    /// ```
    #[must_use]
    pub fn percentage(&self) -> f64 {
        match self.stage {
            UpdateStage::Idle | UpdateStage::Connecting | UpdateStage::Failed => 0.0,
            UpdateStage::Uploading => {
                let ratio = if self.total_bytes == 0 {
                    1.0
                } else {
                    self.bytes_transferred as f64 / self.total_bytes as f64
                };
                10.0 + 70.0 * ratio
            }
            UpdateStage::Verifying => 80.0,
            UpdateStage::Rebooting => 95.0,
            UpdateStage::Complete => 100.0,
        }
    }
}

/// Firmware-upload protocol driver over one exclusive connection.
#[derive(Clone)]
pub struct TransferClient {
    transport: Arc<dyn Transport>,
    radio: RadioArbiter,
    config: TransferConfig,
}

impl TransferClient {
    /// Creates a client over the shared transport and radio gate.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, radio: RadioArbiter, config: TransferConfig) -> Self {
        Self {
            transport,
            radio,
            config,
        }
    }

    /// Acquires a transfer share of the radio and connects to one device.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::ConnectionFailed`] when the device cannot be
    /// reached or lacks the firmware-update service.
    #[instrument(skip(self), level = "info", fields(%address))]
    pub async fn connect(&self, address: &DeviceAddress) -> Result<TransferSession, UpdateError> {
        let permit = self.radio.acquire_transfer().await;
        let link = self
            .transport
            .connect(address)
            .await
            .map_err(|error| UpdateError::ConnectionFailed(error.to_string()))?;

        if !link.has_service(EndpointId::FirmwareService) {
            let _ = link.close().await;
            return Err(UpdateError::ConnectionFailed(format!(
                "device {address} does not expose the firmware update service"
            )));
        }

        let responses = match link.subscribe(EndpointId::FirmwareData).await {
            Ok(stream) => stream,
            Err(error) => {
                let _ = link.close().await;
                return Err(UpdateError::ConnectionFailed(error.to_string()));
            }
        };

        Ok(TransferSession {
            link,
            responses,
            seq: 0,
            config: self.config.clone(),
            _permit: permit,
        })
    }

    /// Runs the whole pipeline for one device: connect, upload, verify,
    /// reset, close.
    ///
    /// Progress events cover every stage transition; the upload restarts
    /// from zero on every call.
    ///
    /// # Errors
    ///
    /// Returns the first per-task error; [`UpdateError::Cancelled`] wins over
    /// any in-flight operation.
    #[instrument(skip(self, firmware, progress, cancel), level = "info", fields(%address, total_bytes = firmware.total_bytes()))]
    pub async fn run(
        &self,
        address: &DeviceAddress,
        firmware: &FirmwarePayload,
        progress: &mpsc::Sender<TransferProgress>,
        cancel: &CancellationToken,
    ) -> Result<(), UpdateError> {
        let total = firmware.total_bytes();
        emit(progress, TransferProgress::new(UpdateStage::Connecting, 0, total)).await;

        let mut session = tokio::select! {
            () = cancel.cancelled() => return Err(UpdateError::Cancelled),
            session = self.connect(address) => session?,
        };

        let outcome = self
            .drive(&mut session, firmware, progress, cancel)
            .await;
        session.close().await;
        outcome
    }

    async fn drive(
        &self,
        session: &mut TransferSession,
        firmware: &FirmwarePayload,
        progress: &mpsc::Sender<TransferProgress>,
        cancel: &CancellationToken,
    ) -> Result<(), UpdateError> {
        let total = firmware.total_bytes();

        session.upload(firmware, progress, cancel).await?;

        emit(progress, TransferProgress::new(UpdateStage::Verifying, total, total)).await;
        tokio::select! {
            () = cancel.cancelled() => return Err(UpdateError::Cancelled),
            verified = session.verify(firmware.digest()) => verified?,
        }

        emit(progress, TransferProgress::new(UpdateStage::Rebooting, total, total)).await;
        tokio::select! {
            () = cancel.cancelled() => return Err(UpdateError::Cancelled),
            reset = session.reset() => reset?,
        }

        emit(progress, TransferProgress::new(UpdateStage::Complete, total, total)).await;
        Ok(())
    }
}

/// One connected firmware-update session.
pub struct TransferSession {
    link: Box<dyn TransportLink>,
    responses: NotificationStream,
    seq: u8,
    config: TransferConfig,
    _permit: TransferPermit,
}

impl TransferSession {
    /// Returns the per-write payload limit of the underlying link.
    #[must_use]
    pub fn write_limit(&self) -> usize {
        self.link.write_limit()
    }

    fn next_seq(&mut self) -> u8 {
        let seq = self.seq;
        self.seq = self.seq.wrapping_add(1);
        seq
    }

    fn chunk_capacity(&self, with_init: bool) -> usize {
        let overhead = HEADER_LEN + CHUNK_PRELUDE_LEN + if with_init { INIT_FIELDS_LEN } else { 0 };
        self.link.write_limit().saturating_sub(overhead).max(1)
    }

    async fn request(
        &mut self,
        request: &DfuRequest,
        response_timeout: Duration,
    ) -> Result<DfuResponse, String> {
        let seq = self.next_seq();
        let frame = encode_request(seq, request);
        self.link
            .write_endpoint(EndpointId::FirmwareData, &frame)
            .await
            .map_err(|error| error.to_string())?;

        loop {
            let frame = timeout(response_timeout, self.responses.recv())
                .await
                .map_err(|_elapsed| {
                    format!(
                        "no response within {}ms",
                        response_timeout.as_millis()
                    )
                })?
                .ok_or_else(|| "firmware response stream closed".to_string())?;

            match decode_response(&frame) {
                Ok((response_seq, response)) if response_seq == seq => return Ok(response),
                Ok((stale_seq, _response)) => {
                    trace!(stale_seq, expected = seq, "discarding stale firmware response");
                }
                Err(error) => {
                    debug!(%error, "discarding undecodable firmware response");
                }
            }
        }
    }

    /// Uploads one image from offset zero, emitting progress per chunk.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::UploadFailed`] for rejected chunks or transport
    /// failures and [`UpdateError::Cancelled`] when interrupted.
    pub async fn upload(
        &mut self,
        firmware: &FirmwarePayload,
        progress: &mpsc::Sender<TransferProgress>,
        cancel: &CancellationToken,
    ) -> Result<(), UpdateError> {
        let data = firmware.data();
        let total = firmware.total_bytes();
        let total_u32 = u32::try_from(data.len())
            .map_err(|_overflow| UpdateError::UploadFailed("image exceeds 4GiB".to_string()))?;

        emit(progress, TransferProgress::new(UpdateStage::Uploading, 0, total)).await;

        let mut offset = 0usize;
        while offset < data.len() {
            let init = (offset == 0).then_some(UploadInit {
                total_len: total_u32,
                digest: *firmware.digest(),
            });
            let end = (offset + self.chunk_capacity(init.is_some())).min(data.len());
            let chunk = &data[offset..end];
            let request = DfuRequest::ImageUpload {
                offset: u32::try_from(offset).unwrap_or(u32::MAX),
                crc32: crc32fast::hash(chunk),
                init,
                data: chunk.to_vec(),
            };

            let response_timeout = self.config.response_timeout;
            let response = tokio::select! {
                () = cancel.cancelled() => return Err(UpdateError::Cancelled),
                response = self.request(&request, response_timeout) => {
                    response.map_err(UpdateError::UploadFailed)?
                }
            };

            match response {
                DfuResponse::UploadAck { rc: 0, offset: acked } => {
                    offset = usize::try_from(acked).unwrap_or(usize::MAX);
                    emit(
                        progress,
                        TransferProgress::new(UpdateStage::Uploading, u64::from(acked), total),
                    )
                    .await;
                }
                DfuResponse::UploadAck { rc, offset: acked } => {
                    return Err(UpdateError::UploadFailed(format!(
                        "device rejected chunk at offset {acked} (rc {rc})"
                    )));
                }
                _other => {
                    return Err(UpdateError::UploadFailed(
                        "unexpected response to upload chunk".to_string(),
                    ));
                }
            }

            if !self.config.per_chunk_delay.is_zero() {
                sleep(self.config.per_chunk_delay).await;
            }
        }

        Ok(())
    }

    /// Queries the image list; the uploaded digest must sit in a pending
    /// slot.
    ///
    /// A missing or mismatched pending image is a device-side rejection, not
    /// a transport fault.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::VerificationFailed`] when the pending image is
    /// absent and [`UpdateError::UploadFailed`] for query transport errors.
    pub async fn verify(&mut self, digest: &[u8; 32]) -> Result<(), UpdateError> {
        let response_timeout = self.config.response_timeout;
        let response = self
            .request(&DfuRequest::ImageState, response_timeout)
            .await
            .map_err(|error| UpdateError::UploadFailed(format!("image list query failed: {error}")))?;

        let DfuResponse::ImageState { images } = response else {
            return Err(UpdateError::UploadFailed(
                "unexpected response to image list query".to_string(),
            ));
        };

        let pending = images
            .iter()
            .any(|image| image.pending && image.digest == *digest);
        if !pending {
            return Err(UpdateError::VerificationFailed(
                "uploaded image is not present in the pending slot".to_string(),
            ));
        }
        Ok(())
    }

    /// Sends the reboot command; fire-and-forget.
    ///
    /// Success means the command went out; the device may drop the link
    /// before acknowledging and that is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::UploadFailed`] when the command cannot be
    /// written at all.
    pub async fn reset(&mut self) -> Result<(), UpdateError> {
        let seq = self.next_seq();
        let frame = encode_request(seq, &DfuRequest::Reset);
        self.link
            .write_endpoint(EndpointId::FirmwareData, &frame)
            .await
            .map_err(|error| UpdateError::UploadFailed(format!("reset command failed: {error}")))?;

        match timeout(RESET_RESPONSE_TIMEOUT, self.responses.recv()).await {
            Ok(Some(frame)) => {
                if let Ok((_seq, DfuResponse::ResetAck { rc })) = decode_response(&frame)
                    && rc != 0
                {
                    return Err(UpdateError::UploadFailed(format!(
                        "device rejected reset (rc {rc})"
                    )));
                }
                Ok(())
            }
            Ok(None) | Err(_) => {
                // Devices often reboot before the acknowledgement leaves.
                debug!("no reset acknowledgement; treating as sent");
                Ok(())
            }
        }
    }

    /// Tears the session down and releases its radio share.
    pub async fn close(self) {
        if let Err(error) = self.link.close().await {
            debug!(%error, "transfer link close failed");
        }
    }
}

async fn emit(progress: &mpsc::Sender<TransferProgress>, event: TransferProgress) {
    if progress.send(event).await.is_err() {
        trace!("progress receiver dropped; continuing transfer");
    }
}
