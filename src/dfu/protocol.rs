use thiserror::Error;

/// Frame header length: op, flags, length, group, sequence, command.
pub(crate) const HEADER_LEN: usize = 8;
/// Fixed upload-chunk prelude: offset, CRC32, total-fields flag.
pub(crate) const CHUNK_PRELUDE_LEN: usize = 9;
/// Extra prelude bytes on the first chunk: total length plus digest.
pub(crate) const INIT_FIELDS_LEN: usize = 36;

pub(crate) const DIGEST_LEN: usize = 32;

const OP_READ: u8 = 0x00;
const OP_READ_RSP: u8 = 0x01;
const OP_WRITE: u8 = 0x02;
const OP_WRITE_RSP: u8 = 0x03;

const GROUP_OS: u16 = 0x0000;
const GROUP_IMAGE: u16 = 0x0001;

const CMD_IMAGE_STATE: u8 = 0x00;
const CMD_IMAGE_UPLOAD: u8 = 0x01;
const CMD_OS_RESET: u8 = 0x05;

const FLAG_BOOTABLE: u8 = 1 << 0;
const FLAG_PENDING: u8 = 1 << 1;
const FLAG_CONFIRMED: u8 = 1 << 2;
const FLAG_ACTIVE: u8 = 1 << 3;

/// Errors returned by firmware frame encoding and decoding.
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum DfuFrameError {
    #[error("firmware frame is truncated: expected at least {expected} bytes, got {actual}")]
    TruncatedFrame { expected: usize, actual: usize },
    #[error("firmware frame declares {declared} payload bytes but carries {actual}")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("unknown firmware operation 0x{op:02X} for group 0x{group:04X} command 0x{command:02X}")]
    UnknownOperation { op: u8, group: u16, command: u8 },
    #[error("firmware frame payload is malformed: {reason}")]
    MalformedPayload { reason: &'static str },
}

/// One firmware slot reported by the device's image list.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ImageSlot {
    pub slot: u8,
    pub version: String,
    pub digest: [u8; DIGEST_LEN],
    pub bootable: bool,
    pub pending: bool,
    pub confirmed: bool,
    pub active: bool,
}

/// Requests sent to the device over the firmware characteristic.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum DfuRequest {
    /// Query the image slot list.
    ImageState,
    /// Upload one image chunk; `init` fields ride along at offset zero.
    ImageUpload {
        offset: u32,
        crc32: u32,
        init: Option<UploadInit>,
        data: Vec<u8>,
    },
    /// Reboot into the pending image.
    Reset,
}

/// First-chunk upload fields describing the whole image.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct UploadInit {
    pub total_len: u32,
    pub digest: [u8; DIGEST_LEN],
}

/// Responses received from the device.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum DfuResponse {
    ImageState { images: Vec<ImageSlot> },
    UploadAck { rc: u8, offset: u32 },
    ResetAck { rc: u8 },
}

fn encode(op: u8, group: u16, seq: u8, command: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.push(op);
    frame.push(0x00);
    frame.extend_from_slice(
        &u16::try_from(payload.len())
            .unwrap_or(u16::MAX)
            .to_be_bytes(),
    );
    frame.extend_from_slice(&group.to_be_bytes());
    frame.push(seq);
    frame.push(command);
    frame.extend_from_slice(payload);
    frame
}

fn split_frame(frame: &[u8]) -> Result<(u8, u16, u8, u8, &[u8]), DfuFrameError> {
    if frame.len() < HEADER_LEN {
        return Err(DfuFrameError::TruncatedFrame {
            expected: HEADER_LEN,
            actual: frame.len(),
        });
    }

    let declared = usize::from(u16::from_be_bytes([frame[2], frame[3]]));
    let payload = &frame[HEADER_LEN..];
    if declared != payload.len() {
        return Err(DfuFrameError::LengthMismatch {
            declared,
            actual: payload.len(),
        });
    }

    let group = u16::from_be_bytes([frame[4], frame[5]]);
    Ok((frame[0], group, frame[6], frame[7], payload))
}

/// Encodes one request frame.
#[must_use]
pub fn encode_request(seq: u8, request: &DfuRequest) -> Vec<u8> {
    match request {
        DfuRequest::ImageState => encode(OP_READ, GROUP_IMAGE, seq, CMD_IMAGE_STATE, &[]),
        DfuRequest::ImageUpload {
            offset,
            crc32,
            init,
            data,
        } => {
            let init_len = init.map_or(0, |_fields| INIT_FIELDS_LEN);
            let mut payload = Vec::with_capacity(CHUNK_PRELUDE_LEN + init_len + data.len());
            payload.extend_from_slice(&offset.to_be_bytes());
            payload.extend_from_slice(&crc32.to_be_bytes());
            payload.push(u8::from(init.is_some()));
            if let Some(init) = init {
                payload.extend_from_slice(&init.total_len.to_be_bytes());
                payload.extend_from_slice(&init.digest);
            }
            payload.extend_from_slice(data);
            encode(OP_WRITE, GROUP_IMAGE, seq, CMD_IMAGE_UPLOAD, &payload)
        }
        DfuRequest::Reset => encode(OP_WRITE, GROUP_OS, seq, CMD_OS_RESET, &[]),
    }
}

/// Decodes one request frame.
///
/// # Errors
///
/// Returns an error for truncated, mismatched, or unrecognised frames.
pub fn decode_request(frame: &[u8]) -> Result<(u8, DfuRequest), DfuFrameError> {
    let (op, group, seq, command, payload) = split_frame(frame)?;
    match (op, group, command) {
        (OP_READ, GROUP_IMAGE, CMD_IMAGE_STATE) => Ok((seq, DfuRequest::ImageState)),
        (OP_WRITE, GROUP_IMAGE, CMD_IMAGE_UPLOAD) => {
            if payload.len() < CHUNK_PRELUDE_LEN {
                return Err(DfuFrameError::MalformedPayload {
                    reason: "upload chunk is shorter than its prelude",
                });
            }
            let offset = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
            let crc32 = u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]);
            let has_init = payload[8] != 0;
            let mut cursor = CHUNK_PRELUDE_LEN;
            let init = if has_init {
                if payload.len() < CHUNK_PRELUDE_LEN + INIT_FIELDS_LEN {
                    return Err(DfuFrameError::MalformedPayload {
                        reason: "upload init fields are truncated",
                    });
                }
                let total_len = u32::from_be_bytes([
                    payload[cursor],
                    payload[cursor + 1],
                    payload[cursor + 2],
                    payload[cursor + 3],
                ]);
                let mut digest = [0u8; DIGEST_LEN];
                digest.copy_from_slice(&payload[cursor + 4..cursor + 4 + DIGEST_LEN]);
                cursor += INIT_FIELDS_LEN;
                Some(UploadInit { total_len, digest })
            } else {
                None
            };
            Ok((
                seq,
                DfuRequest::ImageUpload {
                    offset,
                    crc32,
                    init,
                    data: payload[cursor..].to_vec(),
                },
            ))
        }
        (OP_WRITE, GROUP_OS, CMD_OS_RESET) => Ok((seq, DfuRequest::Reset)),
        (op, group, command) => Err(DfuFrameError::UnknownOperation { op, group, command }),
    }
}

/// Encodes one response frame.
#[must_use]
pub fn encode_response(seq: u8, response: &DfuResponse) -> Vec<u8> {
    match response {
        DfuResponse::ImageState { images } => {
            let mut payload = vec![u8::try_from(images.len()).unwrap_or(u8::MAX)];
            for image in images {
                payload.push(image.slot);
                let mut flags = 0u8;
                if image.bootable {
                    flags |= FLAG_BOOTABLE;
                }
                if image.pending {
                    flags |= FLAG_PENDING;
                }
                if image.confirmed {
                    flags |= FLAG_CONFIRMED;
                }
                if image.active {
                    flags |= FLAG_ACTIVE;
                }
                payload.push(flags);
                payload.extend_from_slice(&image.digest);
                let version = image.version.as_bytes();
                payload.push(u8::try_from(version.len()).unwrap_or(u8::MAX));
                payload.extend_from_slice(version);
            }
            encode(OP_READ_RSP, GROUP_IMAGE, seq, CMD_IMAGE_STATE, &payload)
        }
        DfuResponse::UploadAck { rc, offset } => {
            let mut payload = vec![*rc];
            payload.extend_from_slice(&offset.to_be_bytes());
            encode(OP_WRITE_RSP, GROUP_IMAGE, seq, CMD_IMAGE_UPLOAD, &payload)
        }
        DfuResponse::ResetAck { rc } => encode(OP_WRITE_RSP, GROUP_OS, seq, CMD_OS_RESET, &[*rc]),
    }
}

/// Decodes one response frame.
///
/// # Errors
///
/// Returns an error for truncated, mismatched, or unrecognised frames.
pub fn decode_response(frame: &[u8]) -> Result<(u8, DfuResponse), DfuFrameError> {
    let (op, group, seq, command, payload) = split_frame(frame)?;
    match (op, group, command) {
        (OP_READ_RSP, GROUP_IMAGE, CMD_IMAGE_STATE) => {
            let (&count, mut rest) = payload.split_first().ok_or(DfuFrameError::MalformedPayload {
                reason: "image state response is empty",
            })?;
            let mut images = Vec::with_capacity(usize::from(count));
            for _index in 0..count {
                if rest.len() < 2 + DIGEST_LEN + 1 {
                    return Err(DfuFrameError::MalformedPayload {
                        reason: "image slot record is truncated",
                    });
                }
                let slot = rest[0];
                let flags = rest[1];
                let mut digest = [0u8; DIGEST_LEN];
                digest.copy_from_slice(&rest[2..2 + DIGEST_LEN]);
                let version_len = usize::from(rest[2 + DIGEST_LEN]);
                let version_start = 2 + DIGEST_LEN + 1;
                if rest.len() < version_start + version_len {
                    return Err(DfuFrameError::MalformedPayload {
                        reason: "image slot version is truncated",
                    });
                }
                let version =
                    String::from_utf8_lossy(&rest[version_start..version_start + version_len])
                        .into_owned();
                images.push(ImageSlot {
                    slot,
                    version,
                    digest,
                    bootable: flags & FLAG_BOOTABLE != 0,
                    pending: flags & FLAG_PENDING != 0,
                    confirmed: flags & FLAG_CONFIRMED != 0,
                    active: flags & FLAG_ACTIVE != 0,
                });
                rest = &rest[version_start + version_len..];
            }
            Ok((seq, DfuResponse::ImageState { images }))
        }
        (OP_WRITE_RSP, GROUP_IMAGE, CMD_IMAGE_UPLOAD) => {
            if payload.len() < 5 {
                return Err(DfuFrameError::MalformedPayload {
                    reason: "upload acknowledgement is truncated",
                });
            }
            let offset = u32::from_be_bytes([payload[1], payload[2], payload[3], payload[4]]);
            Ok((
                seq,
                DfuResponse::UploadAck {
                    rc: payload[0],
                    offset,
                },
            ))
        }
        (OP_WRITE_RSP, GROUP_OS, CMD_OS_RESET) => {
            let rc = payload.first().copied().unwrap_or(0);
            Ok((seq, DfuResponse::ResetAck { rc }))
        }
        (op, group, command) => Err(DfuFrameError::UnknownOperation { op, group, command }),
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn upload_request_round_trips_with_init_fields() {
        let request = DfuRequest::ImageUpload {
            offset: 0,
            crc32: 0xDEAD_BEEF,
            init: Some(UploadInit {
                total_len: 1024,
                digest: [0x5A; DIGEST_LEN],
            }),
            data: vec![1, 2, 3, 4],
        };

        let frame = encode_request(7, &request);
        let (seq, decoded) = decode_request(&frame).expect("upload frame should decode");

        assert_eq!(7, seq);
        assert_eq!(request, decoded);
    }

    #[test]
    fn upload_request_round_trips_without_init_fields() {
        let request = DfuRequest::ImageUpload {
            offset: 512,
            crc32: 42,
            init: None,
            data: vec![9; 100],
        };

        let frame = encode_request(8, &request);
        let (_seq, decoded) = decode_request(&frame).expect("upload frame should decode");
        assert_eq!(request, decoded);
    }

    #[test]
    fn image_state_response_round_trips_slot_flags() {
        let response = DfuResponse::ImageState {
            images: vec![
                ImageSlot {
                    slot: 0,
                    version: "1.2.0".to_string(),
                    digest: [0x11; DIGEST_LEN],
                    bootable: true,
                    pending: false,
                    confirmed: true,
                    active: true,
                },
                ImageSlot {
                    slot: 1,
                    version: "1.3.0".to_string(),
                    digest: [0x22; DIGEST_LEN],
                    bootable: true,
                    pending: true,
                    confirmed: false,
                    active: false,
                },
            ],
        };

        let frame = encode_response(3, &response);
        let (seq, decoded) = decode_response(&frame).expect("state frame should decode");

        assert_eq!(3, seq);
        assert_eq!(response, decoded);
    }

    #[test]
    fn reset_frames_round_trip() {
        let frame = encode_request(1, &DfuRequest::Reset);
        assert_matches!(decode_request(&frame), Ok((1, DfuRequest::Reset)));

        let ack = encode_response(1, &DfuResponse::ResetAck { rc: 0 });
        assert_matches!(decode_response(&ack), Ok((1, DfuResponse::ResetAck { rc: 0 })));
    }

    #[test]
    fn decode_rejects_length_mismatch() {
        let mut frame = encode_request(1, &DfuRequest::ImageState);
        frame.push(0xFF);
        assert_matches!(
            decode_request(&frame),
            Err(DfuFrameError::LengthMismatch { .. })
        );
    }

    #[test]
    fn decode_rejects_unknown_operation() {
        let frame = encode(OP_WRITE, 0x0009, 1, 0x07, &[]);
        assert_matches!(
            decode_request(&frame),
            Err(DfuFrameError::UnknownOperation {
                op: OP_WRITE,
                group: 0x0009,
                command: 0x07
            })
        );
    }
}
