// SPDX-License-Identifier: GPL-3.0-or-later

//! Client socket server (C8): one UNIX-domain stream socket per card,
//! serving firmware-management requests from the `fcp-ctl` client.
//!
//! At most one client is served at a time; a non-blocking accept that finds
//! a second connection attempt closes it immediately rather than queuing it,
//! matching the reference behaviour of never letting the listen backlog grow
//! during a long flash operation.

use {
    fcp_protocol::{
        devmap::DeviceMap,
        new_error,
        transport::{FcpTransport, Transport},
        wire::{
            self, FirmwarePayloadHeader, RequestType, SocketError,
        },
        ProtocolError,
    },
    glib::Error,
    sha2::{Digest, Sha256},
    std::{
        io::{Read, Write},
        os::unix::net::{UnixListener, UnixStream},
        path::{Path, PathBuf},
        time::Duration,
    },
    tracing::{debug, info, warn},
};

const SEGMENT_NAMES: [&str; 4] = ["App_Upgrade", "App_Settings", "App_Disk", "App_Env"];
const ERASE_POLL_INTERVAL: Duration = Duration::from_millis(50);
const ERASE_COMPLETE: u8 = 255;
const MIN_APP_FIRMWARE_LEN: usize = 64 * 1024;

#[derive(Debug, Clone, Copy)]
struct FlashSegment {
    index: u32,
    size: u32,
}

/// Segment indices/sizes discovered once per process lifetime, per §4.7.
pub struct FlashSegments {
    upgrade: FlashSegment,
    settings: FlashSegment,
    #[allow(dead_code)]
    disk: FlashSegment,
    #[allow(dead_code)]
    env: FlashSegment,
}

impl FlashSegments {
    pub fn discover<T: Transport>(transport: &FcpTransport<T>) -> Result<Self, Error> {
        let (_, count) = transport.flash_info()?;
        let mut found: [Option<FlashSegment>; 4] = [None; 4];
        for num in 0..count {
            let (size, _flags, name) = transport.flash_segment_info(num)?;
            if let Some(slot) = SEGMENT_NAMES.iter().position(|n| *n == name) {
                found[slot] = Some(FlashSegment { index: num, size });
            }
        }
        let mut resolved = found.into_iter();
        let upgrade = resolved
            .next()
            .flatten()
            .ok_or_else(|| new_error(ProtocolError::DevmapMissing, "App_Upgrade flash segment not found"))?;
        let settings = resolved
            .next()
            .flatten()
            .ok_or_else(|| new_error(ProtocolError::DevmapMissing, "App_Settings flash segment not found"))?;
        let disk = resolved
            .next()
            .flatten()
            .ok_or_else(|| new_error(ProtocolError::DevmapMissing, "App_Disk flash segment not found"))?;
        let env = resolved
            .next()
            .flatten()
            .ok_or_else(|| new_error(ProtocolError::DevmapMissing, "App_Env flash segment not found"))?;
        if [upgrade.index, settings.index, disk.index, env.index].iter().any(|i| *i == 0) {
            return Err(new_error(ProtocolError::DevmapInvalid, "flash segment index must be non-zero"));
        }
        Ok(Self { upgrade, settings, disk, env })
    }
}

/// Binds `$RUNTIME_DIRECTORY`/`$XDG_RUNTIME_DIR`/`/tmp`, in that order, to
/// find where the listening socket for `card_num` should live.
pub fn socket_path(card_num: u32) -> PathBuf {
    let dir = std::env::var("RUNTIME_DIRECTORY")
        .or_else(|_| std::env::var("XDG_RUNTIME_DIR"))
        .unwrap_or_else(|_| "/tmp".to_string());
    Path::new(&dir).join(format!("fcp-{card_num}.sock"))
}

pub struct SocketServer {
    listener: UnixListener,
    segments: Option<FlashSegments>,
    expected_pid: u16,
}

impl SocketServer {
    pub fn bind(path: &Path, expected_pid: u16) -> Result<Self, Error> {
        let _ = std::fs::remove_file(path);
        let listener = UnixListener::bind(path)
            .map_err(|e| new_error(ProtocolError::Transport, format!("bind {}: {e}", path.display())))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| new_error(ProtocolError::Transport, format!("set_nonblocking: {e}")))?;
        Ok(Self { listener, segments: None, expected_pid })
    }

    /// Accepts and immediately drops any additional pending connection,
    /// per the "at most one client" rule. Call on every event-loop tick and
    /// from inside long-running operations.
    pub fn drain_pending_connections(&self) {
        while let Ok((extra, _)) = self.listener.accept() {
            debug!("closing extra client connection while one is already in progress");
            drop(extra);
        }
    }

    /// Non-blocking accept of the next client, if any.
    pub fn try_accept(&self) -> Option<UnixStream> {
        match self.listener.accept() {
            Ok((stream, _)) => Some(stream),
            Err(_) => None,
        }
    }

    /// Hands out a cloned listener handle for the dedicated accept thread;
    /// both handles share the same underlying socket.
    pub fn listener_clone(&self) -> std::io::Result<UnixListener> {
        self.listener.try_clone()
    }

    /// Services one client connection to completion, then closes it.
    pub fn handle_client<T: Transport>(
        &mut self,
        mut stream: UnixStream,
        transport: &FcpTransport<T>,
        devmap: &DeviceMap,
    ) {
        let (request, payload) = match wire::read_request(&mut stream) {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "failed to read client request");
                return;
            }
        };

        let result = match request {
            RequestType::Reboot => transport.reboot(),
            RequestType::ConfigErase => self.erase_segment(&mut stream, transport, Segment::Settings),
            RequestType::AppFirmwareErase => self.erase_segment(&mut stream, transport, Segment::Upgrade),
            RequestType::AppFirmwareUpdate => self.write_app_firmware(&mut stream, transport, &payload),
            RequestType::EspFirmwareUpdate => {
                crate::dfu::run_update(transport, devmap, self.expected_pid, &payload, |percent| {
                    wire::write_progress(&mut stream, percent)
                })
            }
        };

        match result {
            Ok(()) => {
                let _ = wire::write_success(&mut stream);
            }
            Err(e) => {
                warn!(error = %e, "client request failed");
                let code = e
                    .kind::<ProtocolError>()
                    .map(|kind| match kind {
                        ProtocolError::FirmwareInvalid => SocketError::InvalidHash,
                        ProtocolError::Framing => SocketError::InvalidLength,
                        ProtocolError::VersionMismatch
                        | ProtocolError::DevmapMissing
                        | ProtocolError::DevmapInvalid => SocketError::Config,
                        ProtocolError::Invalid(raw) => {
                            SocketError::from_code(raw as i16).unwrap_or(SocketError::Fcp)
                        }
                        ProtocolError::Transport => SocketError::Fcp,
                    })
                    .unwrap_or(SocketError::Fcp);
                let _ = wire::write_error(&mut stream, code);
            }
        }
    }

    fn ensure_segments<T: Transport>(&mut self, transport: &FcpTransport<T>) -> Result<&FlashSegments, Error> {
        if self.segments.is_none() {
            self.segments = Some(FlashSegments::discover(transport)?);
        }
        Ok(self.segments.as_ref().unwrap())
    }

    fn erase_segment<T: Transport>(
        &mut self,
        stream: &mut UnixStream,
        transport: &FcpTransport<T>,
        which: Segment,
    ) -> Result<(), Error> {
        let segment = {
            let segments = self.ensure_segments(transport)?;
            match which {
                Segment::Upgrade => segments.upgrade,
                Segment::Settings => segments.settings,
            }
        };
        let total_blocks = (segment.size / 4096).max(1);

        transport.flash_erase(segment.index as u8)?;

        let mut last_percent = u8::MAX;
        loop {
            self.drain_pending_connections();
            let progress = transport.flash_erase_progress(segment.index)?;
            if progress == ERASE_COMPLETE {
                break;
            }
            let percent = ((progress as u32 * 100) / total_blocks).min(100) as u8;
            if percent != last_percent {
                wire::write_progress(stream, percent)?;
                last_percent = percent;
            }
            std::thread::sleep(ERASE_POLL_INTERVAL);
        }
        Ok(())
    }

    fn write_app_firmware<T: Transport>(
        &mut self,
        stream: &mut UnixStream,
        transport: &FcpTransport<T>,
        payload: &[u8],
    ) -> Result<(), Error> {
        let header = FirmwarePayloadHeader::parse(payload)?;
        let body = &payload[fcp_protocol::wire::FIRMWARE_PAYLOAD_HEADER_LEN..];
        if body.len() != header.size as usize {
            return Err(new_error(ProtocolError::Framing, "firmware payload size mismatch"));
        }
        if header.vid != wire::EXPECTED_VID || header.pid != self.expected_pid {
            return Err(new_error(
                ProtocolError::Invalid(SocketError::InvalidUsbId.code() as i32),
                format!("firmware targets {:04x}:{:04x}, device is {:04x}:{:04x}", header.vid, header.pid, wire::EXPECTED_VID, self.expected_pid),
            ));
        }

        let segment = self.ensure_segments(transport)?.upgrade;
        if body.len() < MIN_APP_FIRMWARE_LEN || body.len() > segment.size as usize {
            return Err(new_error(ProtocolError::Framing, "firmware payload length out of bounds"));
        }

        let digest: [u8; 32] = Sha256::digest(body).into();
        if digest != header.sha256 {
            return Err(new_error(ProtocolError::FirmwareInvalid, "firmware SHA-256 mismatch"));
        }

        let chunk_size = fcp_protocol::transport::FLASH_WRITE_MAX;
        let total = body.len();
        let mut written = 0usize;
        let mut last_percent = u8::MAX;

        while written < total {
            self.drain_pending_connections();
            let take = chunk_size.min(total - written);
            transport.flash_write(segment.index, written as u32, &body[written..written + take])?;
            written += take;

            let percent = ((written as u64 * 100) / total as u64) as u8;
            if percent != last_percent {
                wire::write_progress(stream, percent)?;
                last_percent = percent;
            }
        }

        info!(bytes = total, "app firmware write complete");
        Ok(())
    }
}

#[derive(Clone, Copy)]
enum Segment {
    Upgrade,
    Settings,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_path_prefers_runtime_directory() {
        std::env::remove_var("XDG_RUNTIME_DIR");
        std::env::set_var("RUNTIME_DIRECTORY", "/run/fcp-test");
        let path = socket_path(3);
        assert_eq!(path, Path::new("/run/fcp-test/fcp-3.sock"));
        std::env::remove_var("RUNTIME_DIRECTORY");
    }
}
