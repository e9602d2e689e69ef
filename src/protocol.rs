use std::collections::HashMap;
use std::sync::LazyLock;

use strum::IntoEnumIterator;
use strum_macros::{Display, EnumIter};

/// Requested ATT MTU for proxy and firmware links.
pub(crate) const REQUESTED_ATT_MTU: usize = 517;
/// ATT write opcode + handle overhead subtracted from the MTU per write.
pub(crate) const ATT_WRITE_OVERHEAD: usize = 3;
/// Conservative write limit assumed when MTU negotiation is unavailable.
pub(crate) const FALLBACK_WRITE_LIMIT: usize = 20;

/// GATT endpoints the core interacts with.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, EnumIter, Display)]
pub enum EndpointId {
    /// Mesh proxy service hosting the data-in/data-out pair.
    #[strum(to_string = "mesh_proxy_service")]
    MeshProxyService,
    /// Characteristic proxy clients write mesh PDUs to.
    #[strum(to_string = "mesh_data_in")]
    MeshDataIn,
    /// Characteristic the proxy notifies inbound mesh PDUs on.
    #[strum(to_string = "mesh_data_out")]
    MeshDataOut,
    /// Firmware-update (SMP) service.
    #[strum(to_string = "firmware_service")]
    FirmwareService,
    /// Bidirectional firmware-update characteristic.
    #[strum(to_string = "firmware_data")]
    FirmwareData,
}

/// Endpoint category in GATT.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Display)]
pub(crate) enum EndpointKind {
    /// GATT service endpoint.
    #[strum(to_string = "service")]
    Service,
    /// GATT characteristic endpoint.
    #[strum(to_string = "characteristic")]
    Characteristic,
}

/// Descriptive metadata for one protocol endpoint.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(crate) struct EndpointMetadata {
    name: &'static str,
    uuid: &'static str,
    kind: EndpointKind,
}

impl EndpointMetadata {
    /// Human-readable endpoint name.
    pub(crate) fn name(self) -> &'static str {
        self.name
    }

    /// Endpoint UUID.
    pub(crate) fn uuid(self) -> &'static str {
        self.uuid
    }

    /// Endpoint kind.
    #[allow(dead_code)]
    pub(crate) fn kind(self) -> EndpointKind {
        self.kind
    }
}

/// Endpoint metadata keyed by typed endpoint IDs.
pub(crate) static ENDPOINTS_BY_ID: LazyLock<HashMap<EndpointId, EndpointMetadata>> =
    LazyLock::new(|| {
        EndpointId::iter()
            .map(|endpoint| (endpoint, metadata_for(endpoint)))
            .collect()
    });

/// Returns metadata for one endpoint.
pub(crate) fn endpoint_metadata(endpoint: EndpointId) -> EndpointMetadata {
    *ENDPOINTS_BY_ID
        .get(&endpoint)
        .unwrap_or(&metadata_for(endpoint))
}

fn metadata_for(endpoint: EndpointId) -> EndpointMetadata {
    match endpoint {
        EndpointId::MeshProxyService => EndpointMetadata {
            name: "mesh proxy service",
            uuid: "00001828-0000-1000-8000-00805f9b34fb",
            kind: EndpointKind::Service,
        },
        EndpointId::MeshDataIn => EndpointMetadata {
            name: "mesh proxy data in",
            uuid: "00002add-0000-1000-8000-00805f9b34fb",
            kind: EndpointKind::Characteristic,
        },
        EndpointId::MeshDataOut => EndpointMetadata {
            name: "mesh proxy data out",
            uuid: "00002ade-0000-1000-8000-00805f9b34fb",
            kind: EndpointKind::Characteristic,
        },
        EndpointId::FirmwareService => EndpointMetadata {
            name: "firmware update service",
            uuid: "8d53dc1d-1db7-4cd3-868b-8a527460aa84",
            kind: EndpointKind::Service,
        },
        EndpointId::FirmwareData => EndpointMetadata {
            name: "firmware update data",
            uuid: "da2e7828-fbce-4e01-ae9e-261174997c48",
            kind: EndpointKind::Characteristic,
        },
    }
}
