// SPDX-License-Identifier: GPL-3.0-or-later

//! Transport adapter (C1): one call per opcode, little-endian wire framing
//! over the kernel audio-control device.
//!
//! Every call is synchronous: build a request buffer of little-endian
//! primitives, hand it to the [`Transport`] together with the opcode and the
//! expected response length, and decode the response bytes back into
//! little-endian primitives. Opcode categories sit in the high bits, the
//! sub-code in the low 12 bits, matching the kernel driver's ioctl ABI.

use {
    super::{new_error, ProtocolError},
    glib::Error,
    std::time::Duration,
};

pub const CATEGORY_INIT: u32 = 0x000;
pub const CATEGORY_METER: u32 = 0x001;
pub const CATEGORY_MIX: u32 = 0x002;
pub const CATEGORY_MUX: u32 = 0x003;
pub const CATEGORY_FLASH: u32 = 0x004;
pub const CATEGORY_SYNC: u32 = 0x006;
pub const CATEGORY_ESP_DFU: u32 = 0x009;
pub const CATEGORY_DATA: u32 = 0x800;

const fn opcode(category: u32, sub: u32) -> u32 {
    category << 12 | sub
}

pub const OP_INIT_1: u32 = opcode(CATEGORY_INIT, 0x000);
pub const OP_INIT_2: u32 = opcode(CATEGORY_INIT, 0x001);
pub const OP_INIT_CAP_READ: u32 = opcode(CATEGORY_INIT, 0x002);
pub const OP_INIT_REBOOT: u32 = opcode(CATEGORY_INIT, 0x003);

pub const OP_METER_INFO: u32 = opcode(CATEGORY_METER, 0x000);
pub const OP_METER_READ: u32 = opcode(CATEGORY_METER, 0x001);

pub const OP_MIX_INFO: u32 = opcode(CATEGORY_MIX, 0x000);
pub const OP_MIX_READ: u32 = opcode(CATEGORY_MIX, 0x001);
pub const OP_MIX_WRITE: u32 = opcode(CATEGORY_MIX, 0x002);

pub const OP_MUX_INFO: u32 = opcode(CATEGORY_MUX, 0x000);
pub const OP_MUX_READ: u32 = opcode(CATEGORY_MUX, 0x001);
pub const OP_MUX_WRITE: u32 = opcode(CATEGORY_MUX, 0x002);

pub const OP_FLASH_INFO: u32 = opcode(CATEGORY_FLASH, 0x000);
pub const OP_FLASH_SEGMENT_INFO: u32 = opcode(CATEGORY_FLASH, 0x001);
pub const OP_FLASH_ERASE: u32 = opcode(CATEGORY_FLASH, 0x002);
pub const OP_FLASH_ERASE_PROGRESS: u32 = opcode(CATEGORY_FLASH, 0x003);
pub const OP_FLASH_WRITE: u32 = opcode(CATEGORY_FLASH, 0x004);
pub const OP_FLASH_READ: u32 = opcode(CATEGORY_FLASH, 0x005);

pub const OP_SYNC_READ: u32 = opcode(CATEGORY_SYNC, 0x000);

pub const OP_ESP_DFU_START: u32 = opcode(CATEGORY_ESP_DFU, 0x000);
pub const OP_ESP_DFU_WRITE: u32 = opcode(CATEGORY_ESP_DFU, 0x001);

pub const OP_DATA_READ: u32 = opcode(CATEGORY_DATA, 0x000);
pub const OP_DATA_WRITE: u32 = opcode(CATEGORY_DATA, 0x001);
pub const OP_DATA_NOTIFY: u32 = opcode(CATEGORY_DATA, 0x002);
pub const OP_DEVMAP_INFO: u32 = opcode(CATEGORY_DATA, 0x003);
pub const OP_DEVMAP_READ: u32 = opcode(CATEGORY_DATA, 0x004);

pub const DEVMAP_BLOCK_SIZE: usize = 1024;
pub const FLASH_WRITE_MAX: usize = 1024 - 3 * 4;

/// Required protocol version: the kernel driver and this implementation must agree on
/// major=2. A device reporting major=1 belongs to a different driver generation and is
/// silently ignored rather than treated as a fatal error.
pub const PROTOCOL_VERSION_MAJOR: u32 = 2;
pub const PROTOCOL_VERSION_MINOR: u32 = 0;

/// Abstraction over the kernel audio-control device's command and notification
/// ioctls, kept blocking-vs-future-agnostic per the single production implementation
/// (a char device opened by the daemon) and a fake used by tests.
pub trait Transport {
    /// Issue `{opcode, req.len(), resp_len}` followed by `req`, returning exactly
    /// `resp_len` bytes read back from the device.
    fn command(&self, opcode: u32, req: &[u8], resp_len: usize) -> Result<Vec<u8>, Error>;

    /// Block until one notification word is available, or the given timeout elapses.
    fn read_notification(&self, timeout: Duration) -> Result<Option<u32>, Error>;
}

fn le_u16(v: u16) -> [u8; 2] {
    v.to_le_bytes()
}

fn le_u32(v: u32) -> [u8; 4] {
    v.to_le_bytes()
}

/// Reads `size` (1, 2, or 4) bytes at `offset` from `buf`, sign-extending into `i64`
/// when `is_signed`, matching `fcp_data_read`'s widening behaviour.
pub fn widen(buf: &[u8], is_signed: bool) -> i64 {
    match buf.len() {
        1 => {
            if is_signed {
                buf[0] as i8 as i64
            } else {
                buf[0] as i64
            }
        }
        2 => {
            let v = u16::from_le_bytes([buf[0], buf[1]]);
            if is_signed {
                v as i16 as i64
            } else {
                v as i64
            }
        }
        4 => {
            let v = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
            if is_signed {
                v as i32 as i64
            } else {
                v as i64
            }
        }
        _ => 0,
    }
}

/// Narrows `value` to `size` (1, 2, or 4) bytes, matching `fcp_data_write`.
pub fn narrow(value: i64, size: usize) -> Vec<u8> {
    match size {
        1 => vec![value as u8],
        2 => (value as u16).to_le_bytes().to_vec(),
        4 => (value as u32).to_le_bytes().to_vec(),
        _ => Vec::new(),
    }
}

/// High-level opcode catalog bound to one [`Transport`] implementation.
pub struct FcpTransport<T: Transport> {
    io: T,
}

impl<T: Transport> FcpTransport<T> {
    pub fn new(io: T) -> Self {
        Self { io }
    }

    pub fn io(&self) -> &T {
        &self.io
    }

    /// Performs the version handshake. Returns `Ok(false)` when the device speaks the
    /// older major=1 protocol (a different driver/utility owns it, not an error), and
    /// `Ok(true)` on a compatible major=2 device.
    pub fn init(&self) -> Result<bool, Error> {
        let resp = self.io.command(OP_INIT_1, &[], 4)?;
        let packed = u32::from_le_bytes(resp[..4].try_into().unwrap());
        let major = (packed >> 16) & 0xff;
        if major == 1 {
            return Ok(false);
        }
        if major != PROTOCOL_VERSION_MAJOR {
            return Err(new_error(
                ProtocolError::VersionMismatch,
                format!("unsupported protocol major version {major}"),
            ));
        }
        self.io.command(OP_INIT_2, &[], 0)?;
        Ok(true)
    }

    pub fn cap_read(&self, category: u16) -> Result<u8, Error> {
        let resp = self.io.command(OP_INIT_CAP_READ, &le_u16(category), 1)?;
        Ok(resp[0])
    }

    pub fn reboot(&self) -> Result<(), Error> {
        self.io.command(OP_INIT_REBOOT, &[], 0).map(|_| ())
    }

    pub fn meter_info(&self) -> Result<u8, Error> {
        let resp = self.io.command(OP_METER_INFO, &[], 4)?;
        Ok(resp[0])
    }

    pub fn meter_read(&self, offset: u16, count: u16) -> Result<Vec<u32>, Error> {
        let mut req = Vec::with_capacity(8);
        req.extend_from_slice(&le_u16(offset));
        req.extend_from_slice(&le_u16(count));
        req.extend_from_slice(&le_u32(0));
        let resp = self.io.command(OP_METER_READ, &req, count as usize * 4)?;
        Ok(decode_u32_array(&resp))
    }

    pub fn mix_info(&self) -> Result<(u8, u8), Error> {
        let resp = self.io.command(OP_MIX_INFO, &[], 8)?;
        Ok((resp[0], resp[1]))
    }

    pub fn mix_read(&self, mix: u16, count: u16) -> Result<Vec<u16>, Error> {
        let mut req = Vec::with_capacity(4);
        req.extend_from_slice(&le_u16(mix));
        req.extend_from_slice(&le_u16(count));
        let resp = self.io.command(OP_MIX_READ, &req, count as usize * 2)?;
        Ok(decode_u16_array(&resp))
    }

    pub fn mix_write(&self, mix: u16, values: &[u16]) -> Result<(), Error> {
        let mut req = Vec::with_capacity(4 + values.len() * 2);
        req.extend_from_slice(&le_u16(mix));
        req.extend_from_slice(&le_u16(values.len() as u16));
        values.iter().for_each(|v| req.extend_from_slice(&v.to_le_bytes()));
        self.io.command(OP_MIX_WRITE, &req, 0).map(|_| ())
    }

    pub fn mux_info(&self) -> Result<[u16; 3], Error> {
        let resp = self.io.command(OP_MUX_INFO, &[], 12)?;
        let sizes = decode_u16_array(&resp[..6]);
        Ok([sizes[0], sizes[1], sizes[2]])
    }

    pub fn mux_read(&self, rate: u8, count: u8) -> Result<Vec<u32>, Error> {
        let req = [0u8, 0u8, count, rate];
        let resp = self.io.command(OP_MUX_READ, &req, count as usize * 4)?;
        Ok(decode_u32_array(&resp))
    }

    pub fn mux_write(&self, rate: u16, values: &[u32]) -> Result<(), Error> {
        let mut req = Vec::with_capacity(4 + values.len() * 4);
        req.extend_from_slice(&le_u16(0));
        req.extend_from_slice(&le_u16(rate));
        values.iter().for_each(|v| req.extend_from_slice(&v.to_le_bytes()));
        self.io.command(OP_MUX_WRITE, &req, 0).map(|_| ())
    }

    pub fn flash_info(&self) -> Result<(u32, u32), Error> {
        let resp = self.io.command(OP_FLASH_INFO, &[], 16)?;
        let size = u32::from_le_bytes(resp[0..4].try_into().unwrap());
        let count = u32::from_le_bytes(resp[4..8].try_into().unwrap());
        Ok((size, count))
    }

    pub fn flash_segment_info(&self, num: u32) -> Result<(u32, u32, String), Error> {
        let resp = self
            .io
            .command(OP_FLASH_SEGMENT_INFO, &le_u32(num), 4 + 4 + 16)?;
        let size = u32::from_le_bytes(resp[0..4].try_into().unwrap());
        let flags = u32::from_le_bytes(resp[4..8].try_into().unwrap());
        let name_bytes = &resp[8..24];
        let nul = name_bytes.iter().position(|&b| b == 0).unwrap_or(name_bytes.len());
        let name = String::from_utf8_lossy(&name_bytes[..nul]).into_owned();
        Ok((size, flags, name))
    }

    pub fn flash_erase(&self, num: u8) -> Result<(), Error> {
        let mut req = vec![num];
        req.extend_from_slice(&[0u8; 7]);
        self.io.command(OP_FLASH_ERASE, &req, 0).map(|_| ())
    }

    /// Returns a block count 0..N, or 255 meaning "erase complete".
    pub fn flash_erase_progress(&self, num: u32) -> Result<u8, Error> {
        let mut req = Vec::with_capacity(8);
        req.extend_from_slice(&le_u32(num));
        req.extend_from_slice(&le_u32(0));
        let resp = self.io.command(OP_FLASH_ERASE_PROGRESS, &req, 1)?;
        Ok(resp[0])
    }

    pub fn flash_write(&self, num: u32, offset: u32, bytes: &[u8]) -> Result<(), Error> {
        debug_assert!(bytes.len() <= FLASH_WRITE_MAX);
        let mut req = Vec::with_capacity(12 + bytes.len());
        req.extend_from_slice(&le_u32(num));
        req.extend_from_slice(&le_u32(offset));
        req.extend_from_slice(&le_u32(0));
        req.extend_from_slice(bytes);
        self.io.command(OP_FLASH_WRITE, &req, 0).map(|_| ())
    }

    pub fn sync_read(&self) -> Result<bool, Error> {
        let resp = self.io.command(OP_SYNC_READ, &[], 4)?;
        Ok(u32::from_le_bytes(resp[..4].try_into().unwrap()) != 0)
    }

    pub fn esp_dfu_start(&self, length: u32, md5: &[u8; 16]) -> Result<(), Error> {
        let mut req = Vec::with_capacity(8 + 16);
        req.extend_from_slice(&le_u32(0));
        req.extend_from_slice(&le_u32(length));
        req.extend_from_slice(md5);
        self.io.command(OP_ESP_DFU_START, &req, 0).map(|_| ())
    }

    pub fn esp_dfu_write(&self, data: &[u8]) -> Result<(), Error> {
        self.io.command(OP_ESP_DFU_WRITE, data, 0).map(|_| ())
    }

    pub fn data_read(&self, offset: u32, size: usize, is_signed: bool) -> Result<i64, Error> {
        if size == 0 {
            return Err(new_error(ProtocolError::Framing, "data.read(size=0) is invalid"));
        }
        let mut req = Vec::with_capacity(8);
        req.extend_from_slice(&le_u32(offset));
        req.extend_from_slice(&le_u32(size as u32));
        let resp = self.io.command(OP_DATA_READ, &req, size)?;
        Ok(widen(&resp, is_signed))
    }

    pub fn data_write(&self, offset: u32, size: usize, value: i64) -> Result<(), Error> {
        let bytes = narrow(value, size);
        let mut req = Vec::with_capacity(8 + bytes.len());
        req.extend_from_slice(&le_u32(offset));
        req.extend_from_slice(&le_u32(size as u32));
        req.extend_from_slice(&bytes);
        self.io.command(OP_DATA_WRITE, &req, 0).map(|_| ())
    }

    pub fn data_read_buf(&self, offset: u32, size: usize) -> Result<Vec<u8>, Error> {
        let mut req = Vec::with_capacity(8);
        req.extend_from_slice(&le_u32(offset));
        req.extend_from_slice(&le_u32(size as u32));
        self.io.command(OP_DATA_READ, &req, size)
    }

    pub fn data_write_buf(&self, offset: u32, bytes: &[u8]) -> Result<(), Error> {
        let mut req = Vec::with_capacity(8 + bytes.len());
        req.extend_from_slice(&le_u32(offset));
        req.extend_from_slice(&le_u32(bytes.len() as u32));
        req.extend_from_slice(bytes);
        self.io.command(OP_DATA_WRITE, &req, 0).map(|_| ())
    }

    pub fn data_notify(&self, event: u32) -> Result<(), Error> {
        self.io.command(OP_DATA_NOTIFY, &le_u32(event), 0).map(|_| ())
    }

    /// Returns the device-map's total encoded size in bytes.
    pub fn devmap_info(&self) -> Result<u32, Error> {
        let resp = self.io.command(OP_DEVMAP_INFO, &[], 4)?;
        let sizes = decode_u16_array(&resp);
        Ok(sizes[1] as u32)
    }

    /// Reads one `DEVMAP_BLOCK_SIZE`-byte block; the final block may be short.
    pub fn devmap_read_block(&self, block_num: u32) -> Result<Vec<u8>, Error> {
        self.io
            .command(OP_DEVMAP_READ, &le_u32(block_num), DEVMAP_BLOCK_SIZE)
    }

    /// Loops `devmap_read_block` until `total_size` bytes have been gathered.
    pub fn devmap_read_all(&self, total_size: usize) -> Result<Vec<u8>, Error> {
        let mut out = Vec::with_capacity(total_size);
        let mut block_num = 0u32;
        while out.len() < total_size {
            let block = self.devmap_read_block(block_num)?;
            let remaining = total_size - out.len();
            let take = remaining.min(block.len());
            out.extend_from_slice(&block[..take]);
            block_num += 1;
        }
        Ok(out)
    }
}

fn decode_u16_array(buf: &[u8]) -> Vec<u16> {
    buf.chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect()
}

fn decode_u32_array(buf: &[u8]) -> Vec<u32> {
    buf.chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

#[cfg(any(test, feature = "testing"))]
pub mod fake {
    use super::*;
    use std::{cell::RefCell, collections::VecDeque};

    /// A scripted [`Transport`] for unit tests: queue expected `(opcode, response)`
    /// pairs and a stream of notification words.
    #[derive(Default)]
    pub struct FakeTransport {
        pub responses: RefCell<VecDeque<(u32, Vec<u8>)>>,
        pub notifications: RefCell<VecDeque<u32>>,
        pub sent: RefCell<Vec<(u32, Vec<u8>)>>,
    }

    impl Transport for FakeTransport {
        fn command(&self, opcode: u32, req: &[u8], resp_len: usize) -> Result<Vec<u8>, Error> {
            self.sent.borrow_mut().push((opcode, req.to_vec()));
            let mut responses = self.responses.borrow_mut();
            let (expected_opcode, resp) = responses
                .pop_front()
                .unwrap_or((opcode, vec![0u8; resp_len]));
            assert_eq!(expected_opcode, opcode, "unexpected opcode");
            Ok(resp)
        }

        fn read_notification(&self, _timeout: Duration) -> Result<Option<u32>, Error> {
            Ok(self.notifications.borrow_mut().pop_front())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn widen_sign_extends() {
        assert_eq!(widen(&[0xff], true), -1);
        assert_eq!(widen(&[0xff], false), 0xff);
        assert_eq!(widen(&[0xff, 0xff], true), -1);
        assert_eq!(widen(&[0x00, 0x80], true), -32768);
    }

    #[test]
    fn narrow_truncates() {
        assert_eq!(narrow(-1, 1), vec![0xff]);
        assert_eq!(narrow(-1, 2), vec![0xff, 0xff]);
        assert_eq!(narrow(0x1234, 2), vec![0x34, 0x12]);
    }

    #[test]
    fn data_read_rejects_zero_size() {
        let t = FcpTransport::new(fake::FakeTransport::default());
        let err = t.data_read(0, 0, false).unwrap_err();
        assert!(err.kind::<ProtocolError>().is_some());
    }
}
