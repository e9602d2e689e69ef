mod btleplug_backend;
mod connection;
mod fake_backend;
mod radio;
mod transport;

pub use self::btleplug_backend::BtleplugTransport;
pub use self::connection::{
    ConnectionConfig, ConnectionState, ProxyCandidate, ProxyConnectionManager,
};
pub use self::fake_backend::{DeviceScript, FakeTransport};
pub use self::radio::{ProxyPermit, RadioArbiter, TransferPermit};
pub use self::transport::{NotificationStream, Transport, TransportLink};
