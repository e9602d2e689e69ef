use std::fmt;
use std::str::FromStr;

use thiserror::Error;

const KEY_LEN: usize = 16;

/// Errors returned while parsing mesh credentials.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CredentialsError {
    #[error("mesh key must be {expected} hex characters, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },
    #[error("mesh key contains non-hexadecimal characters")]
    InvalidHex(#[from] hex::FromHexError),
}

/// A 128-bit mesh key parsed from its 32-character hex form.
#[derive(Clone, Eq, PartialEq)]
pub struct MeshKey([u8; KEY_LEN]);

impl MeshKey {
    /// Returns the raw key bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for MeshKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Keys never appear in logs beyond a short prefix.
        write!(f, "MeshKey({:02x}{:02x}..)", self.0[0], self.0[1])
    }
}

impl FromStr for MeshKey {
    type Err = CredentialsError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        if value.len() != KEY_LEN * 2 {
            return Err(CredentialsError::InvalidKeyLength {
                expected: KEY_LEN * 2,
                actual: value.len(),
            });
        }
        let bytes = hex::decode(value)?;
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(&bytes);
        Ok(Self(key))
    }
}

/// Network and application keys required to encode mesh messages.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct MeshCredentials {
    network_key: MeshKey,
    application_key: MeshKey,
}

impl MeshCredentials {
    /// Creates credentials from already-parsed keys.
    #[must_use]
    pub fn new(network_key: MeshKey, application_key: MeshKey) -> Self {
        Self {
            network_key,
            application_key,
        }
    }

    /// Parses credentials from 32-character hex key strings.
    ///
    /// ```
    /// use meshfleet::MeshCredentials;
    ///
    /// let credentials = MeshCredentials::parse(
    ///     "00112233445566778899aabbccddeeff",
    ///     "ffeeddccbbaa99887766554433221100",
    /// );
    /// assert!(credentials.is_ok());
    /// ```
    ///
    /// # Errors
    ///
    /// Returns an error when either key is not exactly 32 hex characters.
    pub fn parse(network_key_hex: &str, application_key_hex: &str) -> Result<Self, CredentialsError> {
        Ok(Self {
            network_key: network_key_hex.parse()?,
            application_key: application_key_hex.parse()?,
        })
    }

    /// Returns the network key.
    #[must_use]
    pub fn network_key(&self) -> &MeshKey {
        &self.network_key
    }

    /// Returns the application key.
    #[must_use]
    pub fn application_key(&self) -> &MeshKey {
        &self.application_key
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn parse_accepts_mixed_case_hex_keys() {
        let credentials = MeshCredentials::parse(
            "00112233445566778899AABBccddeeff",
            "FFeeddccbbaa99887766554433221100",
        )
        .expect("valid keys should parse");

        assert_eq!(0x00, credentials.network_key().as_bytes()[0]);
        assert_eq!(0xFF, credentials.application_key().as_bytes()[0]);
    }

    #[test]
    fn parse_rejects_short_keys() {
        let parsed = MeshCredentials::parse("0011", "ffeeddccbbaa99887766554433221100");
        assert_matches!(
            parsed,
            Err(CredentialsError::InvalidKeyLength {
                expected: 32,
                actual: 4
            })
        );
    }

    #[test]
    fn debug_output_truncates_key_material() {
        let key: MeshKey = "00112233445566778899aabbccddeeff"
            .parse()
            .expect("key should parse");
        assert_eq!("MeshKey(0011..)", format!("{key:?}"));
    }
}
