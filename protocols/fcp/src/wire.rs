// SPDX-License-Identifier: GPL-3.0-or-later

//! The client/daemon socket protocol (C8): a length-framed request/response
//! exchange shared by `fcpd`'s socket server and the `fcp-ctl` client, so
//! that both sides of the wire agree on one set of constants instead of each
//! crate guessing at the other's.

use {
    super::{new_error, ProtocolError},
    glib::Error,
    std::io::{Read, Write},
};

/// USB vendor id shared by every device this protocol targets; the firmware
/// container and payload headers both carry a vid/pid pair validated against it.
pub const EXPECTED_VID: u16 = 0x1235;

pub const REQUEST_MAGIC: u8 = 0xA5;
pub const RESPONSE_MAGIC: u8 = 0x5A;

/// Generous enough to carry a firmware payload in one frame.
pub const MAX_PAYLOAD_LEN: usize = 16 * 1024 * 1024;

pub const HEADER_LEN: usize = 8;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum RequestType {
    Reboot,
    ConfigErase,
    AppFirmwareErase,
    AppFirmwareUpdate,
    EspFirmwareUpdate,
}

impl RequestType {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Reboot),
            1 => Some(Self::ConfigErase),
            2 => Some(Self::AppFirmwareErase),
            3 => Some(Self::AppFirmwareUpdate),
            4 => Some(Self::EspFirmwareUpdate),
            _ => None,
        }
    }

    fn to_byte(self) -> u8 {
        match self {
            Self::Reboot => 0,
            Self::ConfigErase => 1,
            Self::AppFirmwareErase => 2,
            Self::AppFirmwareUpdate => 3,
            Self::EspFirmwareUpdate => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ResponseType {
    Progress,
    Error,
    Success,
}

impl ResponseType {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Progress),
            1 => Some(Self::Error),
            2 => Some(Self::Success),
            _ => None,
        }
    }

    fn to_byte(self) -> u8 {
        match self {
            Self::Progress => 0,
            Self::Error => 1,
            Self::Success => 2,
        }
    }
}

/// Numeric socket error table; the i16 sent over the wire indexes this list
/// on both sides.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SocketError {
    InvalidMagic,
    InvalidLength,
    InvalidCommand,
    InvalidHash,
    InvalidUsbId,
    InvalidState,
    NotLeapfrog,
    Read,
    Write,
    Timeout,
    Fcp,
    Config,
}

impl SocketError {
    pub const fn code(self) -> i16 {
        match self {
            Self::InvalidMagic => 0,
            Self::InvalidLength => 1,
            Self::InvalidCommand => 2,
            Self::InvalidHash => 3,
            Self::InvalidUsbId => 4,
            Self::InvalidState => 5,
            Self::NotLeapfrog => 6,
            Self::Read => 7,
            Self::Write => 8,
            Self::Timeout => 9,
            Self::Fcp => 10,
            Self::Config => 11,
        }
    }

    pub fn from_code(code: i16) -> Option<Self> {
        Some(match code {
            0 => Self::InvalidMagic,
            1 => Self::InvalidLength,
            2 => Self::InvalidCommand,
            3 => Self::InvalidHash,
            4 => Self::InvalidUsbId,
            5 => Self::InvalidState,
            6 => Self::NotLeapfrog,
            7 => Self::Read,
            8 => Self::Write,
            9 => Self::Timeout,
            10 => Self::Fcp,
            11 => Self::Config,
            _ => return None,
        })
    }

    pub const fn message(self) -> &'static str {
        match self {
            Self::InvalidMagic => "invalid magic",
            Self::InvalidLength => "invalid length",
            Self::InvalidCommand => "invalid command",
            Self::InvalidHash => "invalid hash",
            Self::InvalidUsbId => "invalid USB id",
            Self::InvalidState => "invalid state",
            Self::NotLeapfrog => "device is not running leapfrog firmware",
            Self::Read => "read error",
            Self::Write => "write error",
            Self::Timeout => "timed out",
            Self::Fcp => "FCP transport error",
            Self::Config => "configuration error",
        }
    }
}

/// `{u32 size, u16 vid, u16 pid, u8[32] sha256, u8[16] md5}` prefix, followed
/// by `size` bytes, carried in `APP_FIRMWARE_UPDATE`/`ESP_FIRMWARE_UPDATE` payloads.
pub struct FirmwarePayloadHeader {
    pub size: u32,
    pub vid: u16,
    pub pid: u16,
    pub sha256: [u8; 32],
    pub md5: [u8; 16],
}

pub const FIRMWARE_PAYLOAD_HEADER_LEN: usize = 4 + 2 + 2 + 32 + 16;

impl FirmwarePayloadHeader {
    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.size.to_le_bytes());
        out.extend_from_slice(&self.vid.to_le_bytes());
        out.extend_from_slice(&self.pid.to_le_bytes());
        out.extend_from_slice(&self.sha256);
        out.extend_from_slice(&self.md5);
    }

    pub fn parse(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < FIRMWARE_PAYLOAD_HEADER_LEN {
            return Err(new_error(ProtocolError::Framing, "firmware payload header too short"));
        }
        let size = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        let vid = u16::from_le_bytes(buf[4..6].try_into().unwrap());
        let pid = u16::from_le_bytes(buf[6..8].try_into().unwrap());
        let mut sha256 = [0u8; 32];
        sha256.copy_from_slice(&buf[8..40]);
        let mut md5 = [0u8; 16];
        md5.copy_from_slice(&buf[40..56]);
        Ok(Self { size, vid, pid, sha256, md5 })
    }
}

/// `{u8 magic, u8 msg_type, u16 reserved, u32 len}`, `len` wide enough for
/// the 16 MiB `MAX_PAYLOAD_LEN` ceiling a firmware-upload payload actually reaches.
fn write_frame<W: Write>(writer: &mut W, magic: u8, msg_type: u8, payload: &[u8]) -> Result<(), Error> {
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(new_error(ProtocolError::Framing, "payload exceeds maximum frame size"));
    }
    let mut header = [0u8; HEADER_LEN];
    header[0] = magic;
    header[1] = msg_type;
    header[4..8].copy_from_slice(&(payload.len() as u32).to_le_bytes());
    writer
        .write_all(&header)
        .and_then(|_| writer.write_all(payload))
        .map_err(|e| new_error(ProtocolError::Transport, format!("socket write: {e}")))
}

fn read_frame<R: Read>(reader: &mut R, expected_magic: u8) -> Result<(u8, Vec<u8>), Error> {
    let mut header = [0u8; HEADER_LEN];
    reader
        .read_exact(&mut header)
        .map_err(|e| new_error(ProtocolError::Transport, format!("socket read: {e}")))?;
    if header[0] != expected_magic {
        return Err(new_error(ProtocolError::Framing, "unexpected frame magic"));
    }
    let msg_type = header[1];
    let len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;
    if len > MAX_PAYLOAD_LEN {
        return Err(new_error(ProtocolError::Framing, "declared payload length exceeds maximum"));
    }
    let mut payload = vec![0u8; len];
    reader
        .read_exact(&mut payload)
        .map_err(|e| new_error(ProtocolError::Transport, format!("socket read payload: {e}")))?;
    Ok((msg_type, payload))
}

pub fn write_request<W: Write>(writer: &mut W, request: RequestType, payload: &[u8]) -> Result<(), Error> {
    write_frame(writer, REQUEST_MAGIC, request.to_byte(), payload)
}

pub fn read_request<R: Read>(reader: &mut R) -> Result<(RequestType, Vec<u8>), Error> {
    let (msg_type, payload) = read_frame(reader, REQUEST_MAGIC)?;
    let request = RequestType::from_byte(msg_type)
        .ok_or_else(|| new_error(ProtocolError::Framing, "unknown request type"))?;
    Ok((request, payload))
}

pub fn write_response<W: Write>(writer: &mut W, response: ResponseType, payload: &[u8]) -> Result<(), Error> {
    write_frame(writer, RESPONSE_MAGIC, response.to_byte(), payload)
}

pub fn read_response<R: Read>(reader: &mut R) -> Result<(ResponseType, Vec<u8>), Error> {
    let (msg_type, payload) = read_frame(reader, RESPONSE_MAGIC)?;
    let response = ResponseType::from_byte(msg_type)
        .ok_or_else(|| new_error(ProtocolError::Framing, "unknown response type"))?;
    Ok((response, payload))
}

pub fn write_progress<W: Write>(writer: &mut W, percent: u8) -> Result<(), Error> {
    write_response(writer, ResponseType::Progress, &[percent])
}

pub fn write_error<W: Write>(writer: &mut W, error: SocketError) -> Result<(), Error> {
    write_response(writer, ResponseType::Error, &error.code().to_le_bytes())
}

pub fn write_success<W: Write>(writer: &mut W) -> Result<(), Error> {
    write_response(writer, ResponseType::Success, &[])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_roundtrips_through_a_byte_buffer() {
        let mut buf = Vec::new();
        write_request(&mut buf, RequestType::Reboot, &[]).unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        let (request, payload) = read_request(&mut cursor).unwrap();
        assert_eq!(request, RequestType::Reboot);
        assert!(payload.is_empty());
    }

    #[test]
    fn payload_larger_than_a_u16_roundtrips() {
        let mut buf = Vec::new();
        let payload = vec![0xABu8; 70_000];
        write_request(&mut buf, RequestType::AppFirmwareUpdate, &payload).unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        let (request, read_back) = read_request(&mut cursor).unwrap();
        assert_eq!(request, RequestType::AppFirmwareUpdate);
        assert_eq!(read_back.len(), 70_000);
    }

    #[test]
    fn oversized_payload_is_rejected_before_writing() {
        let mut buf = Vec::new();
        let oversized = vec![0u8; MAX_PAYLOAD_LEN + 1];
        assert!(write_request(&mut buf, RequestType::AppFirmwareUpdate, &oversized).is_err());
    }

    #[test]
    fn firmware_payload_header_roundtrips() {
        let header = FirmwarePayloadHeader {
            size: 4096,
            vid: 0x1235,
            pid: 0x821D,
            sha256: [7u8; 32],
            md5: [9u8; 16],
        };
        let mut bytes = Vec::new();
        header.write_to(&mut bytes);
        let parsed = FirmwarePayloadHeader::parse(&bytes).unwrap();
        assert_eq!(parsed.size, 4096);
        assert_eq!(parsed.vid, 0x1235);
        assert_eq!(parsed.sha256, [7u8; 32]);
    }

    #[test]
    fn wrong_magic_is_rejected() {
        let mut buf = Vec::new();
        write_response(&mut buf, ResponseType::Success, &[]).unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        assert!(read_request(&mut cursor).is_err());
    }
}
