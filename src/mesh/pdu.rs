use thiserror::Error;

use super::address::UnicastAddress;

const SAR_COMPLETE: u8 = 0b00;
const SAR_FIRST: u8 = 0b01;
const SAR_CONTINUATION: u8 = 0b10;
const SAR_LAST: u8 = 0b11;
const SAR_SHIFT: u8 = 6;
const TYPE_MASK: u8 = 0x3F;

const FILTER_SET_TYPE: u8 = 0x00;
const FILTER_ADD_ADDRESSES: u8 = 0x01;
const FILTER_STATUS: u8 = 0x03;

/// Upper bound on a reassembled proxy PDU; anything larger is a framing fault.
const MAX_PDU_LEN: usize = 4096;

/// Errors returned by proxy PDU framing and reassembly.
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum PduError {
    #[error("proxy PDU fragment is empty")]
    EmptyFragment,
    #[error("unknown proxy PDU type 0x{value:02X}")]
    UnknownPduType { value: u8 },
    #[error("continuation fragment arrived with no PDU in progress")]
    UnexpectedContinuation,
    #[error("fragment type {incoming} interleaved with in-progress {in_progress} PDU")]
    InterleavedSegments {
        in_progress: ProxyPduType,
        incoming: ProxyPduType,
    },
    #[error("reassembled PDU exceeds {MAX_PDU_LEN} bytes")]
    OversizedPdu,
    #[error("write limit {write_limit} leaves no room for fragment payload")]
    WriteLimitTooSmall { write_limit: usize },
    #[error("proxy configuration message is truncated at {actual} bytes")]
    TruncatedConfigMessage { actual: usize },
    #[error("unknown proxy configuration opcode 0x{opcode:02X}")]
    UnknownConfigOpcode { opcode: u8 },
}

/// Proxy PDU message types carried in the header's low six bits.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, derive_more::Display)]
pub enum ProxyPduType {
    #[display("network")]
    Network,
    #[display("mesh_beacon")]
    MeshBeacon,
    #[display("proxy_config")]
    ProxyConfig,
    #[display("provisioning")]
    Provisioning,
}

impl ProxyPduType {
    const fn raw(self) -> u8 {
        match self {
            Self::Network => 0x00,
            Self::MeshBeacon => 0x01,
            Self::ProxyConfig => 0x02,
            Self::Provisioning => 0x03,
        }
    }

    fn from_raw(value: u8) -> Result<Self, PduError> {
        match value {
            0x00 => Ok(Self::Network),
            0x01 => Ok(Self::MeshBeacon),
            0x02 => Ok(Self::ProxyConfig),
            0x03 => Ok(Self::Provisioning),
            other => Err(PduError::UnknownPduType { value: other }),
        }
    }
}

/// A complete inbound proxy PDU after reassembly.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct InboundPdu {
    pub pdu_type: ProxyPduType,
    pub payload: Vec<u8>,
}

/// Splits one proxy PDU payload into ordered transport fragments.
///
/// Each fragment carries the one-byte SAR+type header and at most
/// `write_limit - 1` payload bytes; fragment order must be preserved on the
/// wire.
///
/// # Errors
///
/// Returns an error when `write_limit` cannot fit a header plus payload byte.
pub fn segment(
    pdu_type: ProxyPduType,
    payload: &[u8],
    write_limit: usize,
) -> Result<Vec<Vec<u8>>, PduError> {
    if write_limit < 2 {
        return Err(PduError::WriteLimitTooSmall { write_limit });
    }

    let data_per_fragment = write_limit - 1;
    if payload.len() <= data_per_fragment {
        let mut fragment = Vec::with_capacity(payload.len() + 1);
        fragment.push((SAR_COMPLETE << SAR_SHIFT) | pdu_type.raw());
        fragment.extend_from_slice(payload);
        return Ok(vec![fragment]);
    }

    let chunks: Vec<&[u8]> = payload.chunks(data_per_fragment).collect();
    let last_index = chunks.len() - 1;
    let fragments = chunks
        .into_iter()
        .enumerate()
        .map(|(index, chunk)| {
            let sar = match index {
                0 => SAR_FIRST,
                _ if index == last_index => SAR_LAST,
                _ => SAR_CONTINUATION,
            };
            let mut fragment = Vec::with_capacity(chunk.len() + 1);
            fragment.push((sar << SAR_SHIFT) | pdu_type.raw());
            fragment.extend_from_slice(chunk);
            fragment
        })
        .collect();

    Ok(fragments)
}

/// In-order reassembly of segmented proxy PDUs.
///
/// Transport notifications are delivered in order per connection, so a
/// continuation for a different PDU type while one is in progress is a
/// framing fault, not a reordering to tolerate.
#[derive(Debug, Default)]
pub struct Reassembler {
    in_progress: Option<(ProxyPduType, Vec<u8>)>,
}

impl Reassembler {
    /// Creates an empty reassembler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Consumes one transport fragment, returning a PDU when complete.
    ///
    /// # Errors
    ///
    /// Returns an error for empty fragments, unknown PDU types, interleaved
    /// or orphaned continuations, and oversized reassembly buffers.
    pub fn feed(&mut self, fragment: &[u8]) -> Result<Option<InboundPdu>, PduError> {
        let (&header, data) = fragment.split_first().ok_or(PduError::EmptyFragment)?;
        let sar = header >> SAR_SHIFT;
        let pdu_type = ProxyPduType::from_raw(header & TYPE_MASK)?;

        match sar {
            SAR_COMPLETE => {
                self.in_progress = None;
                Ok(Some(InboundPdu {
                    pdu_type,
                    payload: data.to_vec(),
                }))
            }
            SAR_FIRST => {
                self.in_progress = Some((pdu_type, data.to_vec()));
                Ok(None)
            }
            SAR_CONTINUATION => {
                self.append(pdu_type, data)?;
                Ok(None)
            }
            _ => {
                self.append(pdu_type, data)?;
                let (pdu_type, payload) = self
                    .in_progress
                    .take()
                    .unwrap_or((pdu_type, Vec::new()));
                Ok(Some(InboundPdu { pdu_type, payload }))
            }
        }
    }

    fn append(&mut self, pdu_type: ProxyPduType, data: &[u8]) -> Result<(), PduError> {
        let Some((in_progress, buffer)) = self.in_progress.as_mut() else {
            return Err(PduError::UnexpectedContinuation);
        };
        if *in_progress != pdu_type {
            let error = PduError::InterleavedSegments {
                in_progress: *in_progress,
                incoming: pdu_type,
            };
            self.in_progress = None;
            return Err(error);
        }
        if buffer.len() + data.len() > MAX_PDU_LEN {
            self.in_progress = None;
            return Err(PduError::OversizedPdu);
        }
        buffer.extend_from_slice(data);
        Ok(())
    }
}

/// Proxy filter type carried by filter configuration messages.
#[derive(Debug, Clone, Copy, Eq, PartialEq, derive_more::Display)]
pub enum FilterType {
    #[display("whitelist")]
    Whitelist,
    #[display("blacklist")]
    Blacklist,
}

impl FilterType {
    const fn raw(self) -> u8 {
        match self {
            Self::Whitelist => 0x00,
            Self::Blacklist => 0x01,
        }
    }
}

/// Proxy configuration messages exchanged over `ProxyConfig` PDUs.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ProxyConfigMessage {
    SetFilterType(FilterType),
    AddAddresses(Vec<u16>),
    FilterStatus { filter_type: FilterType, list_size: u16 },
}

/// Encodes a set-filter-type configuration payload.
#[must_use]
pub fn encode_set_filter_type(filter_type: FilterType) -> Vec<u8> {
    vec![FILTER_SET_TYPE, filter_type.raw()]
}

/// Encodes an add-addresses configuration payload.
#[must_use]
pub fn encode_add_addresses(addresses: &[UnicastAddress]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(1 + addresses.len() * 2);
    payload.push(FILTER_ADD_ADDRESSES);
    for address in addresses {
        payload.extend_from_slice(&address.value().to_be_bytes());
    }
    payload
}

/// Encodes a filter-status configuration payload.
#[must_use]
pub fn encode_filter_status(filter_type: FilterType, list_size: u16) -> Vec<u8> {
    let mut payload = vec![FILTER_STATUS, filter_type.raw()];
    payload.extend_from_slice(&list_size.to_be_bytes());
    payload
}

/// Parses one proxy configuration payload.
///
/// # Errors
///
/// Returns an error for truncated payloads and unknown opcodes.
pub fn parse_config_message(payload: &[u8]) -> Result<ProxyConfigMessage, PduError> {
    let (&opcode, rest) = payload
        .split_first()
        .ok_or(PduError::TruncatedConfigMessage { actual: 0 })?;

    match opcode {
        FILTER_SET_TYPE => {
            let &filter_type = rest.first().ok_or(PduError::TruncatedConfigMessage {
                actual: payload.len(),
            })?;
            Ok(ProxyConfigMessage::SetFilterType(match filter_type {
                0x01 => FilterType::Blacklist,
                _ => FilterType::Whitelist,
            }))
        }
        FILTER_ADD_ADDRESSES => {
            let addresses = rest
                .chunks_exact(2)
                .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                .collect();
            Ok(ProxyConfigMessage::AddAddresses(addresses))
        }
        FILTER_STATUS => {
            if rest.len() < 3 {
                return Err(PduError::TruncatedConfigMessage {
                    actual: payload.len(),
                });
            }
            let filter_type = match rest[0] {
                0x01 => FilterType::Blacklist,
                _ => FilterType::Whitelist,
            };
            let list_size = u16::from_be_bytes([rest[1], rest[2]]);
            Ok(ProxyConfigMessage::FilterStatus {
                filter_type,
                list_size,
            })
        }
        other => Err(PduError::UnknownConfigOpcode { opcode: other }),
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    #[test]
    fn segment_emits_single_complete_fragment_when_payload_fits() {
        let fragments = segment(ProxyPduType::Network, &[0xAA, 0xBB], 20)
            .expect("small payload should segment");

        assert_eq!(vec![vec![0x00, 0xAA, 0xBB]], fragments);
    }

    #[test]
    fn segment_orders_first_continuation_last_fragments() {
        let payload: Vec<u8> = (0..10).collect();
        let fragments =
            segment(ProxyPduType::ProxyConfig, &payload, 5).expect("payload should segment");

        assert_eq!(3, fragments.len());
        assert_eq!(0x42, fragments[0][0]);
        assert_eq!(0x82, fragments[1][0]);
        assert_eq!(0xC2, fragments[2][0]);
        let reassembled: Vec<u8> = fragments
            .iter()
            .flat_map(|fragment| fragment[1..].to_vec())
            .collect();
        assert_eq!(payload, reassembled);
    }

    #[test]
    fn segment_rejects_unusable_write_limit() {
        assert_matches!(
            segment(ProxyPduType::Network, &[0x00], 1),
            Err(PduError::WriteLimitTooSmall { write_limit: 1 })
        );
    }

    #[rstest]
    #[case(6)]
    #[case(5)]
    #[case(64)]
    fn reassembler_round_trips_segmented_payloads(#[case] write_limit: usize) {
        let payload: Vec<u8> = (0..40).collect();
        let fragments = segment(ProxyPduType::Network, &payload, write_limit)
            .expect("payload should segment");

        let mut reassembler = Reassembler::new();
        let mut complete = None;
        for fragment in &fragments {
            complete = reassembler.feed(fragment).expect("fragments should feed");
        }

        let pdu = complete.expect("last fragment should complete the PDU");
        assert_eq!(ProxyPduType::Network, pdu.pdu_type);
        assert_eq!(payload, pdu.payload);
    }

    #[test]
    fn reassembler_rejects_orphaned_continuation() {
        let mut reassembler = Reassembler::new();
        let fragment = [0x80, 0x01];
        assert_matches!(
            reassembler.feed(&fragment),
            Err(PduError::UnexpectedContinuation)
        );
    }

    #[test]
    fn reassembler_rejects_interleaved_types() {
        let mut reassembler = Reassembler::new();
        reassembler
            .feed(&[0x40, 0x01])
            .expect("first fragment should start a PDU");

        assert_matches!(
            reassembler.feed(&[0x82, 0x02]),
            Err(PduError::InterleavedSegments { .. })
        );
    }

    #[test]
    fn config_messages_round_trip() {
        let address = UnicastAddress::try_from(0x0105).expect("0x0105 should be unicast");
        let encoded = encode_add_addresses(&[address]);
        let parsed = parse_config_message(&encoded).expect("encoded message should parse");

        assert_eq!(ProxyConfigMessage::AddAddresses(vec![0x0105]), parsed);

        let status = encode_filter_status(FilterType::Whitelist, 3);
        assert_eq!(
            ProxyConfigMessage::FilterStatus {
                filter_type: FilterType::Whitelist,
                list_size: 3
            },
            parse_config_message(&status).expect("status should parse")
        );
    }
}
