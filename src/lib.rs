mod app;
mod ble;
mod cli;
mod dfu;
mod error;
mod mesh;
mod protocol;
mod telemetry;

pub use app::{MeshController, run, run_with_log_level, run_with_transport};
pub use ble::{
    BtleplugTransport, ConnectionConfig, ConnectionState, DeviceScript, FakeTransport,
    NotificationStream, ProxyCandidate, ProxyConnectionManager, ProxyPermit, RadioArbiter,
    Transport, TransferPermit, TransportLink,
};
pub use cli::{
    Args, Command, DiscoverArgs, FixtureError, LogLevel, MeshFixture, RunOptions, SwitchState,
    TargetArgs, UpdateArgs,
};
pub use dfu::{
    DfuFrameError, FirmwarePayload, FirmwareResolver, FleetDevice, HardwareIdResolver, ImageSlot,
    QueueConfig, QueueEvent, TransferClient, TransferConfig, TransferProgress, TransferSession,
    UpdateError, UpdateQueueManager, UpdateStage, UpdateSummary, UpdateTask,
};
pub use error::{ConnectionError, CoreError, TransportError};
pub use mesh::{
    AddressError, CleartextCodec, CodecError, CredentialsError, Destination, DeviceAddress,
    DeviceStatus, FilterType, GroupAddress, InboundPdu, MeshCodec, MeshCredentials, MeshKey,
    MeshMessage, MeshMessenger, Opcode, PduError, ProxyConfigMessage, ProxyPduType, SendError,
    StatusRouter, StatusSubscription, UnicastAddress,
};
pub use protocol::EndpointId;
