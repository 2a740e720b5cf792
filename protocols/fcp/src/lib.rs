// SPDX-License-Identifier: GPL-3.0-or-later

//! Data model and wire formats for the Focusrite Control Protocol (FCP).
//!
//! Covers the little-endian command framing exchanged with the kernel
//! audio-control device, the JSON device-map and per-product control-map
//! documents that describe a specific interface, the typed control records
//! synthesized from them, and the big-endian multi-section firmware
//! container format used to distribute updates.

pub mod control;
pub mod devmap;
pub mod firmware;
pub mod transport;
pub mod wire;

use glib::{
    error::{ErrorDomain, Quark},
    Error,
};

/// Any error raised while interpreting the FCP wire formats or device map.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ProtocolError {
    /// The transport's protocol-version handshake returned an unsupported major version.
    VersionMismatch,
    /// The kernel device returned a negative status for an opcode.
    Transport,
    /// An opcode's request or response did not have the declared length.
    Framing,
    /// No device-map document could be found or fetched.
    DevmapMissing,
    /// The device-map or product-map JSON failed to parse or navigate.
    DevmapInvalid,
    /// A firmware container's magic, section count, or digest did not validate.
    FirmwareInvalid,
    Invalid(i32),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let msg = match self {
            ProtocolError::VersionMismatch => "version-mismatch",
            ProtocolError::Transport => "transport",
            ProtocolError::Framing => "framing",
            ProtocolError::DevmapMissing => "devmap-missing",
            ProtocolError::DevmapInvalid => "devmap-invalid",
            ProtocolError::FirmwareInvalid => "firmware-invalid",
            ProtocolError::Invalid(_) => "invalid",
        };
        write!(f, "ProtocolError::{}", msg)
    }
}

impl ErrorDomain for ProtocolError {
    fn domain() -> Quark {
        Quark::from_str("fcp-protocol-error-quark")
    }

    fn code(self) -> i32 {
        match self {
            ProtocolError::VersionMismatch => 0,
            ProtocolError::Transport => 1,
            ProtocolError::Framing => 2,
            ProtocolError::DevmapMissing => 3,
            ProtocolError::DevmapInvalid => 4,
            ProtocolError::FirmwareInvalid => 5,
            ProtocolError::Invalid(v) => v,
        }
    }

    fn from(code: i32) -> Option<Self> {
        let variant = match code {
            0 => ProtocolError::VersionMismatch,
            1 => ProtocolError::Transport,
            2 => ProtocolError::Framing,
            3 => ProtocolError::DevmapMissing,
            4 => ProtocolError::DevmapInvalid,
            5 => ProtocolError::FirmwareInvalid,
            _ => ProtocolError::Invalid(code),
        };
        Some(variant)
    }
}

pub fn new_error(kind: ProtocolError, msg: impl AsRef<str>) -> Error {
    Error::new(kind, msg.as_ref())
}
