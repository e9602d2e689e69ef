use std::collections::HashMap;
use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::mesh::DeviceAddress;

/// A firmware image ready for transfer.
#[derive(Debug, Clone)]
pub struct FirmwarePayload {
    version: String,
    hardware_id: String,
    data: Arc<[u8]>,
    digest: [u8; 32],
}

impl FirmwarePayload {
    /// Creates a payload, computing its SHA-256 digest once up front.
    #[must_use]
    pub fn new(version: impl Into<String>, hardware_id: impl Into<String>, data: Vec<u8>) -> Self {
        let digest = Sha256::digest(&data).into();
        Self {
            version: version.into(),
            hardware_id: hardware_id.into(),
            data: data.into(),
            digest,
        }
    }

    /// Returns the firmware version string.
    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Returns the hardware id this image targets.
    #[must_use]
    pub fn hardware_id(&self) -> &str {
        &self.hardware_id
    }

    /// Returns the image bytes.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Returns the image length in bytes.
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.data.len() as u64
    }

    /// Returns the image SHA-256 digest.
    #[must_use]
    pub fn digest(&self) -> &[u8; 32] {
        &self.digest
    }
}

/// One fleet device eligible for updates.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct FleetDevice {
    address: DeviceAddress,
    hardware_id: String,
}

impl FleetDevice {
    /// Creates a fleet device record.
    #[must_use]
    pub fn new(address: DeviceAddress, hardware_id: impl Into<String>) -> Self {
        Self {
            address,
            hardware_id: hardware_id.into(),
        }
    }

    /// Returns the device address.
    #[must_use]
    pub fn address(&self) -> &DeviceAddress {
        &self.address
    }

    /// Returns the device's hardware id.
    #[must_use]
    pub fn hardware_id(&self) -> &str {
        &self.hardware_id
    }
}

/// External collaborator resolving the applicable image per device.
///
/// Devices the resolver returns `None` for are skipped silently, never
/// enqueued and never reported as failed.
pub trait FirmwareResolver: Send + Sync {
    /// Returns the firmware applicable to one device, if any.
    fn resolve(&self, device: &FleetDevice) -> Option<FirmwarePayload>;
}

/// Resolver matching firmware to devices by hardware id.
#[derive(Debug, Default)]
pub struct HardwareIdResolver {
    by_hardware_id: HashMap<String, FirmwarePayload>,
}

impl HardwareIdResolver {
    /// Creates an empty resolver.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers one image, replacing any previous image for its hardware id.
    #[must_use]
    pub fn with_firmware(mut self, firmware: FirmwarePayload) -> Self {
        self.by_hardware_id
            .insert(firmware.hardware_id().to_string(), firmware);
        self
    }
}

impl FirmwareResolver for HardwareIdResolver {
    fn resolve(&self, device: &FleetDevice) -> Option<FirmwarePayload> {
        self.by_hardware_id.get(device.hardware_id()).cloned()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn device(hardware_id: &str) -> FleetDevice {
        FleetDevice::new(
            "aa:bb:cc:dd:ee:01".parse().expect("address should parse"),
            hardware_id,
        )
    }

    #[test]
    fn resolver_matches_by_hardware_id() {
        let resolver = HardwareIdResolver::new()
            .with_firmware(FirmwarePayload::new("2.1.0", "sensor-v2", vec![0xAA; 16]));

        let matched = resolver.resolve(&device("sensor-v2"));
        assert_eq!("2.1.0", matched.expect("sensor-v2 should match").version());
        assert_eq!(true, resolver.resolve(&device("sensor-v1")).is_none());
    }

    #[test]
    fn payload_digest_is_stable_for_identical_data() {
        let first = FirmwarePayload::new("1.0.0", "hw", vec![1, 2, 3]);
        let second = FirmwarePayload::new("1.0.0", "hw", vec![1, 2, 3]);
        assert_eq!(first.digest(), second.digest());
        assert_eq!(3, first.total_bytes());
    }
}
