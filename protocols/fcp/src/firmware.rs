// SPDX-License-Identifier: GPL-3.0-or-later

//! Firmware container codec (C7): the big-endian, magic-tagged multi-section
//! file format used to distribute main-application, auxiliary-MCU, and
//! leapfrog firmware images.

use {
    super::{new_error, ProtocolError},
    glib::Error,
    md5::{Digest as _, Md5},
    sha2::{Digest, Sha256},
    std::io::Read,
};

pub const CONTAINER_MAGIC: &[u8; 8] = b"SCARLBOX";
pub const APP_MAGIC: &[u8; 8] = b"SCARLET4";
pub const ESP_MAGIC: &[u8; 8] = b"SCARLESP";
pub const LEAPFROG_MAGIC: &[u8; 8] = b"SCARLEAP";

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SectionKind {
    App,
    Esp,
    Leapfrog,
}

impl SectionKind {
    fn from_magic(magic: &[u8; 8]) -> Option<Self> {
        match magic {
            APP_MAGIC => Some(Self::App),
            ESP_MAGIC => Some(Self::Esp),
            LEAPFROG_MAGIC => Some(Self::Leapfrog),
            _ => None,
        }
    }

    fn magic(self) -> &'static [u8; 8] {
        match self {
            Self::App => APP_MAGIC,
            Self::Esp => ESP_MAGIC,
            Self::Leapfrog => LEAPFROG_MAGIC,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FirmwareSection {
    pub kind: SectionKind,
    pub usb_vid: u16,
    pub usb_pid: u16,
    pub version: [u32; 4],
    pub length: u32,
    pub sha256: [u8; 32],
    /// Computed (not on-disk) for the auxiliary-MCU section only.
    pub md5: Option<[u8; 16]>,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct FirmwareContainer {
    pub usb_vid: u16,
    pub usb_pid: u16,
    pub version: [u32; 4],
    pub sections: Vec<FirmwareSection>,
}

impl FirmwareContainer {
    pub fn section(&self, kind: SectionKind) -> Option<&FirmwareSection> {
        self.sections.iter().find(|s| s.kind == kind)
    }
}

fn read_exact_or_err<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<(), Error> {
    reader
        .read_exact(buf)
        .map_err(|_| new_error(ProtocolError::FirmwareInvalid, "short read in firmware container"))
}

fn read_magic<R: Read>(reader: &mut R) -> Result<[u8; 8], Error> {
    let mut magic = [0u8; 8];
    read_exact_or_err(reader, &mut magic)?;
    Ok(magic)
}

fn read_u16_be<R: Read>(reader: &mut R) -> Result<u16, Error> {
    let mut buf = [0u8; 2];
    read_exact_or_err(reader, &mut buf)?;
    Ok(u16::from_be_bytes(buf))
}

fn read_u32_be<R: Read>(reader: &mut R) -> Result<u32, Error> {
    let mut buf = [0u8; 4];
    read_exact_or_err(reader, &mut buf)?;
    Ok(u32::from_be_bytes(buf))
}

fn read_version<R: Read>(reader: &mut R) -> Result<[u32; 4], Error> {
    let mut v = [0u32; 4];
    for slot in &mut v {
        *slot = read_u32_be(reader)?;
    }
    Ok(v)
}

struct SectionHeader {
    usb_vid: u16,
    usb_pid: u16,
    version: [u32; 4],
    length: u32,
    sha256: [u8; 32],
}

fn read_section_header<R: Read>(reader: &mut R) -> Result<SectionHeader, Error> {
    let usb_vid = read_u16_be(reader)?;
    let usb_pid = read_u16_be(reader)?;
    let version = read_version(reader)?;
    let length = read_u32_be(reader)?;
    let mut sha256 = [0u8; 32];
    read_exact_or_err(reader, &mut sha256)?;
    Ok(SectionHeader {
        usb_vid,
        usb_pid,
        version,
        length,
        sha256,
    })
}

fn read_section<R: Read>(reader: &mut R, magic: &[u8; 8], header_only: bool) -> Result<FirmwareSection, Error> {
    let kind = SectionKind::from_magic(magic)
        .ok_or_else(|| new_error(ProtocolError::FirmwareInvalid, "unknown section magic"))?;
    let header = read_section_header(reader)?;

    let payload = if header_only {
        let mut sink = std::io::sink();
        std::io::copy(&mut reader.take(header.length as u64), &mut sink)
            .map_err(|_| new_error(ProtocolError::FirmwareInvalid, "short read skipping section payload"))?;
        Vec::new()
    } else {
        let mut buf = vec![0u8; header.length as usize];
        read_exact_or_err(reader, &mut buf)?;

        let digest: [u8; 32] = Sha256::digest(&buf).into();
        if digest != header.sha256 {
            return Err(new_error(
                ProtocolError::FirmwareInvalid,
                "firmware section SHA-256 mismatch",
            ));
        }
        buf
    };

    let md5 = if !header_only && kind == SectionKind::Esp {
        let digest: [u8; 16] = Md5::digest(&payload).into();
        Some(digest)
    } else {
        None
    };

    Ok(FirmwareSection {
        kind,
        usb_vid: header.usb_vid,
        usb_pid: header.usb_pid,
        version: header.version,
        length: header.length,
        sha256: header.sha256,
        md5,
        payload,
    })
}

fn read_container<R: Read>(reader: &mut R, header_only: bool) -> Result<FirmwareContainer, Error> {
    let magic = read_magic(reader)?;

    if &magic == CONTAINER_MAGIC {
        let usb_vid = read_u16_be(reader)?;
        let usb_pid = read_u16_be(reader)?;
        let version = read_version(reader)?;
        let num_sections = read_u32_be(reader)?;
        if !(1..=3).contains(&num_sections) {
            return Err(new_error(
                ProtocolError::FirmwareInvalid,
                format!("section count {num_sections} outside 1..3"),
            ));
        }

        let mut sections = Vec::with_capacity(num_sections as usize);
        for _ in 0..num_sections {
            let section_magic = read_magic(reader)?;
            sections.push(read_section(reader, &section_magic, header_only)?);
        }

        Ok(FirmwareContainer {
            usb_vid,
            usb_pid,
            version,
            sections,
        })
    } else {
        // Legacy: a bare section at the top level is treated as a single-section container.
        let section = read_section(reader, &magic, header_only)?;
        Ok(FirmwareContainer {
            usb_vid: section.usb_vid,
            usb_pid: section.usb_pid,
            version: section.version,
            sections: vec![section],
        })
    }
}

/// Parses a full container, validating every section's SHA-256 and computing an
/// MD5 digest for the auxiliary-MCU section.
pub fn read_firmware_file(path: &std::path::Path) -> Result<FirmwareContainer, Error> {
    let file = std::fs::File::open(path)
        .map_err(|e| new_error(ProtocolError::FirmwareInvalid, format!("open {}: {e}", path.display())))?;
    let mut reader = std::io::BufReader::new(file);
    read_container(&mut reader, false)
}

/// Parses only the container and section headers, skipping payload bytes. Used to
/// enumerate available firmware files without reading their full contents.
pub fn read_firmware_header(path: &std::path::Path) -> Result<FirmwareContainer, Error> {
    let file = std::fs::File::open(path)
        .map_err(|e| new_error(ProtocolError::FirmwareInvalid, format!("open {}: {e}", path.display())))?;
    let mut reader = std::io::BufReader::new(file);
    read_container(&mut reader, true)
}

/// Serializes a container back to its on-disk byte-exact big-endian form.
pub fn write_firmware_container(container: &FirmwareContainer) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(CONTAINER_MAGIC);
    out.extend_from_slice(&container.usb_vid.to_be_bytes());
    out.extend_from_slice(&container.usb_pid.to_be_bytes());
    container.version.iter().for_each(|v| out.extend_from_slice(&v.to_be_bytes()));
    out.extend_from_slice(&(container.sections.len() as u32).to_be_bytes());

    for section in &container.sections {
        out.extend_from_slice(section.kind.magic());
        out.extend_from_slice(&section.usb_vid.to_be_bytes());
        out.extend_from_slice(&section.usb_pid.to_be_bytes());
        section.version.iter().for_each(|v| out.extend_from_slice(&v.to_be_bytes()));
        out.extend_from_slice(&section.length.to_be_bytes());
        out.extend_from_slice(&section.sha256);
        out.extend_from_slice(&section.payload);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn section_bytes(kind: SectionKind, payload: &[u8]) -> Vec<u8> {
        let digest: [u8; 32] = Sha256::digest(payload).into();
        let mut out = Vec::new();
        out.extend_from_slice(kind.magic());
        out.extend_from_slice(&0x1235u16.to_be_bytes());
        out.extend_from_slice(&0x821Du16.to_be_bytes());
        [1u32, 2, 3, 4].iter().for_each(|v| out.extend_from_slice(&v.to_be_bytes()));
        out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        out.extend_from_slice(&digest);
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn parses_two_section_container() {
        let app_payload = vec![0xAAu8; 128];
        let esp_payload = vec![0xBBu8; 64];

        let mut bytes = Vec::new();
        bytes.extend_from_slice(CONTAINER_MAGIC);
        bytes.extend_from_slice(&0x1235u16.to_be_bytes());
        bytes.extend_from_slice(&0x821Du16.to_be_bytes());
        [1u32, 2, 3, 4].iter().for_each(|v| bytes.extend_from_slice(&v.to_be_bytes()));
        bytes.extend_from_slice(&2u32.to_be_bytes());
        bytes.extend_from_slice(&section_bytes(SectionKind::App, &app_payload));
        bytes.extend_from_slice(&section_bytes(SectionKind::Esp, &esp_payload));

        let mut reader = &bytes[..];
        let container = read_container(&mut reader, false).unwrap();

        assert_eq!(container.sections.len(), 2);
        let app = container.section(SectionKind::App).unwrap();
        let esp = container.section(SectionKind::Esp).unwrap();
        assert_eq!(app.payload, app_payload);
        assert!(esp.md5.is_some());
        let expected: [u8; 16] = Md5::digest(&esp_payload).into();
        assert_eq!(esp.md5.unwrap(), expected);
    }

    #[test]
    fn legacy_bare_section_becomes_single_section_container() {
        let payload = vec![0x11u8; 32];
        let bytes = section_bytes(SectionKind::Leapfrog, &payload);
        let mut reader = &bytes[..];
        let container = read_container(&mut reader, false).unwrap();
        assert_eq!(container.sections.len(), 1);
        assert_eq!(container.sections[0].kind, SectionKind::Leapfrog);
    }

    #[test]
    fn sha256_mismatch_is_rejected() {
        let payload = vec![0x11u8; 32];
        let mut bytes = section_bytes(SectionKind::App, &payload);
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        let mut reader = &bytes[..];
        assert!(read_container(&mut reader, false).is_err());
    }

    #[test]
    fn section_count_out_of_range_is_rejected() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(CONTAINER_MAGIC);
        bytes.extend_from_slice(&0u16.to_be_bytes());
        bytes.extend_from_slice(&0u16.to_be_bytes());
        [0u32; 4].iter().for_each(|v| bytes.extend_from_slice(&v.to_be_bytes()));
        bytes.extend_from_slice(&4u32.to_be_bytes());
        let mut reader = &bytes[..];
        assert!(read_container(&mut reader, false).is_err());
    }
}
