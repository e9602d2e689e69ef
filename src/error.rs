use derive_more::From;
use thiserror::Error;

use crate::dfu::UpdateError;
use crate::mesh::{AddressError, CodecError, CredentialsError, PduError, SendError};
use crate::protocol::{EndpointId, endpoint_metadata};

/// Errors surfaced by the BLE transport layer.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("BLE operation failed")]
    Ble(#[from] btleplug::Error),
    #[error("no BLE adapters were found")]
    NoAdapters,
    #[error("no peripheral with address `{address}` was discovered")]
    PeripheralNotFound { address: String },
    #[error("connection to `{address}` failed after {attempts} attempts")]
    ConnectAttemptsExhausted { address: String, attempts: u32 },
    #[error(
        "required endpoint `{name}` ({uuid}) was not found on the connected device",
        name = endpoint_metadata(*endpoint).name(),
        uuid = endpoint_metadata(*endpoint).uuid()
    )]
    MissingEndpoint { endpoint: EndpointId },
    #[error("write of {payload_len} bytes exceeds the {write_limit}-byte link write limit")]
    PayloadExceedsWriteLimit {
        payload_len: usize,
        write_limit: usize,
    },
    #[error("transport write was rejected: {reason}")]
    WriteRejected { reason: String },
    #[error("link to `{address}` is closed")]
    LinkClosed { address: String },
    #[error("operation `{operation}` is not supported by this transport")]
    Unsupported { operation: &'static str },
}

/// Errors returned by proxy connection management.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("no proxy candidates were supplied")]
    NoCandidates,
    #[error("all {tried} proxy candidates failed")]
    AllCandidatesFailed { tried: usize },
    #[error("timed out after {waited_ms}ms waiting for a proxy connection")]
    WaitDeadlineExceeded { waited_ms: u64 },
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Top-level error wrapping every module-specific error type.
#[derive(Debug, Error, From)]
pub enum CoreError {
    #[error(transparent)]
    #[from(AddressError, Box<AddressError>)]
    Address(Box<AddressError>),
    #[error(transparent)]
    #[from(CredentialsError, Box<CredentialsError>)]
    Credentials(Box<CredentialsError>),
    #[error(transparent)]
    #[from(TransportError, Box<TransportError>)]
    Transport(Box<TransportError>),
    #[error(transparent)]
    #[from(ConnectionError, Box<ConnectionError>)]
    Connection(Box<ConnectionError>),
    #[error(transparent)]
    #[from(SendError, Box<SendError>)]
    Send(Box<SendError>),
    #[error(transparent)]
    #[from(PduError, Box<PduError>)]
    Pdu(Box<PduError>),
    #[error(transparent)]
    #[from(CodecError, Box<CodecError>)]
    Codec(Box<CodecError>),
    #[error(transparent)]
    #[from(UpdateError, Box<UpdateError>)]
    Update(Box<UpdateError>),
}

/// Errors returned by telemetry initialisation.
#[derive(Debug, Error)]
pub(crate) enum TelemetryError {
    #[error("failed to install tracing subscriber")]
    Subscriber(#[from] tracing_subscriber::util::TryInitError),
}
