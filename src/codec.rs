//! Frames of the partial flashing characteristic.
//!
//! Every frame starts with a tag byte. Commands and their replies share the
//! tag of the request they belong to.

use num_enum::{IntoPrimitive, TryFromPrimitive};
use thiserror::Error;

/// Frame tags
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum Tag {
    Region = 0x00,
    Write = 0x01,
    TransmissionEnd = 0x02,
    Status = 0xEE,
    Reboot = 0xFF,
}

/// Flash regions known to the device
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum Region {
    Embedded = 0x00,
    Dal = 0x01,
    Program = 0x02,
}

/// Device run modes, used by STATUS replies and REBOOT requests
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum DeviceMode {
    BleOnly = 0x00,
    Application = 0x01,
}

const WRITE_SUCCESS: u8 = 0xFF;
const WRITE_FAIL: u8 = 0xAA;

/// Outgoing requests
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    RequestRegion(Region),
    RequestStatus,
    WritePacket { address: u16, seq: u8, data: Vec<u8> },
    /// Sent ahead of a batch resend. The payload does not follow the
    /// WritePacket layout; it is kept byte-for-byte for device compatibility.
    Resync { seq: u8 },
    Reboot(DeviceMode),
    EndTransmission,
}

impl Command {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Command::RequestRegion(region) => vec![Tag::Region.into(), (*region).into()],
            Command::RequestStatus => vec![Tag::Status.into()],
            Command::WritePacket { address, seq, data } => {
                let mut frame: Vec<u8> = Vec::with_capacity(4 + data.len());
                frame.push(Tag::Write.into());
                frame.extend_from_slice(&address.to_be_bytes());
                frame.push(*seq);
                frame.extend_from_slice(data);
                frame
            }
            Command::Resync { seq } => {
                let mut frame: Vec<u8> = vec![Tag::Write.into()];
                frame.extend_from_slice(&[0xAA; 8]);
                frame.extend_from_slice(&[0x12, 0x34]);
                frame.push(*seq);
                frame
            }
            Command::Reboot(mode) => vec![Tag::Reboot.into(), (*mode).into()],
            Command::EndTransmission => vec![Tag::TransmissionEnd.into()],
        }
    }
}

/// Incoming notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    RegionInfo {
        region: Region,
        start: u32,
        end: u32,
        hash: [u8; 8],
    },
    StatusInfo {
        mode: DeviceMode,
    },
    WriteAck {
        ok: bool,
    },
    WriteAckUnknown {
        code: u8,
    },
}

/// Notification that cannot be interpreted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("empty frame")]
    Empty,
    #[error("unrecognized frame tag {0:#04x}")]
    UnrecognizedTag(u8),
    #[error("truncated {tag:?} frame of {len} bytes")]
    Truncated { tag: Tag, len: usize },
    #[error("unknown region id {0:#04x}")]
    UnknownRegion(u8),
    #[error("unknown device mode {0:#04x}")]
    UnknownMode(u8),
}

impl Response {
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let first = *bytes.first().ok_or(DecodeError::Empty)?;
        let tag = Tag::try_from(first).map_err(|_| DecodeError::UnrecognizedTag(first))?;
        let need = |len: usize| {
            if bytes.len() < len {
                Err(DecodeError::Truncated { tag, len: bytes.len() })
            } else {
                Ok(())
            }
        };

        match tag {
            Tag::Region => {
                need(18)?;
                let region =
                    Region::try_from(bytes[1]).map_err(|_| DecodeError::UnknownRegion(bytes[1]))?;
                let mut hash = [0u8; 8];
                hash.copy_from_slice(&bytes[10..18]);
                Ok(Response::RegionInfo {
                    region,
                    start: u32::from_be_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]),
                    end: u32::from_be_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]),
                    hash,
                })
            }
            Tag::Status => {
                need(3)?;
                let mode =
                    DeviceMode::try_from(bytes[2]).map_err(|_| DecodeError::UnknownMode(bytes[2]))?;
                Ok(Response::StatusInfo { mode })
            }
            Tag::Write => {
                need(2)?;
                Ok(match bytes[1] {
                    WRITE_SUCCESS => Response::WriteAck { ok: true },
                    WRITE_FAIL => Response::WriteAck { ok: false },
                    code => Response::WriteAckUnknown { code },
                })
            }
            Tag::TransmissionEnd | Tag::Reboot => Err(DecodeError::UnrecognizedTag(first)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_commands() {
        assert_eq!(Command::RequestRegion(Region::Dal).encode(), vec![0x00, 0x01]);
        assert_eq!(Command::RequestStatus.encode(), vec![0xEE]);
        assert_eq!(Command::Reboot(DeviceMode::BleOnly).encode(), vec![0xFF, 0x00]);
        assert_eq!(Command::EndTransmission.encode(), vec![0x02]);
    }

    #[test]
    fn test_encode_write_packet() {
        let frame = Command::WritePacket {
            address: 0x1234,
            seq: 7,
            data: vec![0xDE, 0xAD],
        }
        .encode();
        assert_eq!(frame, vec![0x01, 0x12, 0x34, 0x07, 0xDE, 0xAD]);
    }

    #[test]
    fn test_encode_resync() {
        let frame = Command::Resync { seq: 0x08 }.encode();
        assert_eq!(
            frame,
            vec![0x01, 0xAA, 0xAA, 0xAA, 0xAA, 0xAA, 0xAA, 0xAA, 0xAA, 0x12, 0x34, 0x08]
        );
    }

    #[test]
    fn test_decode_region_info() {
        let mut bytes = vec![0x00, 0x01, 0x00, 0x01, 0x80, 0x00, 0x00, 0x03, 0x00, 0x00];
        bytes.extend_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(
            Response::decode(&bytes),
            Ok(Response::RegionInfo {
                region: Region::Dal,
                start: 0x0001_8000,
                end: 0x0003_0000,
                hash: [1, 2, 3, 4, 5, 6, 7, 8],
            })
        );
    }

    #[test]
    fn test_decode_status_uses_byte_two() {
        assert_eq!(
            Response::decode(&[0xEE, 0x99, 0x01]),
            Ok(Response::StatusInfo { mode: DeviceMode::Application })
        );
        assert_eq!(
            Response::decode(&[0xEE, 0x01, 0x00]),
            Ok(Response::StatusInfo { mode: DeviceMode::BleOnly })
        );
    }

    #[test]
    fn test_decode_write_acks() {
        assert_eq!(Response::decode(&[0x01, 0xFF]), Ok(Response::WriteAck { ok: true }));
        assert_eq!(Response::decode(&[0x01, 0xAA]), Ok(Response::WriteAck { ok: false }));
        assert_eq!(
            Response::decode(&[0x01, 0x42]),
            Ok(Response::WriteAckUnknown { code: 0x42 })
        );
    }

    #[test]
    fn test_decode_is_total() {
        assert_eq!(Response::decode(&[]), Err(DecodeError::Empty));
        assert_eq!(Response::decode(&[0x7A, 0x00]), Err(DecodeError::UnrecognizedTag(0x7A)));
        assert_eq!(Response::decode(&[0x02]), Err(DecodeError::UnrecognizedTag(0x02)));
        assert_eq!(
            Response::decode(&[0x00, 0x01, 0x00]),
            Err(DecodeError::Truncated { tag: Tag::Region, len: 3 })
        );
        assert_eq!(Response::decode(&[0xEE, 0x00, 0x05]), Err(DecodeError::UnknownMode(0x05)));
        assert_eq!(Response::decode(&[0x01]), Err(DecodeError::Truncated { tag: Tag::Write, len: 1 }));
    }
}
