mod address;
pub(crate) mod codec;
mod credentials;
mod messenger;
pub(crate) mod pdu;
mod status;

pub use self::address::{AddressError, Destination, DeviceAddress, GroupAddress, UnicastAddress};
pub use self::codec::{CleartextCodec, CodecError, MeshCodec, MeshMessage, Opcode};
pub use self::credentials::{CredentialsError, MeshCredentials, MeshKey};
pub use self::messenger::{MeshMessenger, SendError};
pub use self::pdu::{FilterType, InboundPdu, PduError, ProxyConfigMessage, ProxyPduType};
pub use self::status::{DeviceStatus, StatusRouter, StatusSubscription};
