// SPDX-License-Identifier: GPL-3.0-or-later

//! The hardware-facing half of the daemon: the kernel transport binding and
//! the `Device` value threaded through control read/write dispatch, playing
//! the role the teacher's `SndDice`/unit types play for `CtlModel<O>`.

use {
    fcp_protocol::{
        new_error,
        transport::{FcpTransport, Transport},
        ProtocolError,
    },
    glib::Error,
    nix::{ioctl_read, ioctl_readwrite},
    std::{
        os::fd::{AsRawFd, BorrowedFd, OwnedFd},
        sync::Arc,
        time::Duration,
    },
};

/// `{opcode, req_size, resp_size}` header immediately followed by a buffer at
/// least `max(req_size, resp_size)` bytes; the kernel overwrites the leading
/// portion of that buffer in place with the response.
#[repr(C)]
struct CommandHeader {
    opcode: u32,
    req_size: u32,
    resp_size: u32,
}

const FCP_IOCTL_MAGIC: u8 = 0xF0;
const MAX_COMMAND_BUF: usize = 8192;

#[repr(C)]
struct CommandIoctlBuf {
    header: CommandHeader,
    data: [u8; MAX_COMMAND_BUF],
}

ioctl_read!(fcp_ioctl_version, FCP_IOCTL_MAGIC, 0, u32);
ioctl_readwrite!(fcp_ioctl_init, FCP_IOCTL_MAGIC, 1, [u8; 64]);
ioctl_readwrite!(fcp_ioctl_command, FCP_IOCTL_MAGIC, 2, CommandIoctlBuf);

/// Blocking, `ioctl`-based implementation of [`Transport`] over an open hwdep
/// character-device file descriptor.
pub struct CharDeviceTransport {
    fd: OwnedFd,
}

impl CharDeviceTransport {
    pub fn open(path: &std::path::Path) -> Result<Self, Error> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| new_error(ProtocolError::Transport, format!("open {}: {e}", path.display())))?;
        Ok(Self { fd: file.into() })
    }

    pub fn version(&self) -> Result<u32, Error> {
        let mut packed = 0u32;
        unsafe { fcp_ioctl_version(self.fd.as_raw_fd(), &mut packed) }
            .map_err(|e| new_error(ProtocolError::Transport, format!("version ioctl: {e}")))?;
        Ok(packed)
    }

    fn borrowed(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl Transport for CharDeviceTransport {
    fn command(&self, opcode: u32, req: &[u8], resp_len: usize) -> Result<Vec<u8>, Error> {
        if req.len() > MAX_COMMAND_BUF || resp_len > MAX_COMMAND_BUF {
            return Err(new_error(ProtocolError::Framing, "request or response exceeds transport buffer"));
        }

        let mut buf = CommandIoctlBuf {
            header: CommandHeader {
                opcode,
                req_size: req.len() as u32,
                resp_size: resp_len as u32,
            },
            data: [0u8; MAX_COMMAND_BUF],
        };
        buf.data[..req.len()].copy_from_slice(req);

        unsafe { fcp_ioctl_command(self.borrowed().as_raw_fd(), &mut buf) }
            .map_err(|e| new_error(ProtocolError::Transport, format!("command 0x{opcode:x}: {e}")))?;

        Ok(buf.data[..resp_len].to_vec())
    }

    fn read_notification(&self, timeout: Duration) -> Result<Option<u32>, Error> {
        use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

        let borrowed = self.borrowed();
        let mut fds = [PollFd::new(borrowed, PollFlags::POLLIN)];
        let millis: u16 = timeout.as_millis().min(u16::MAX as u128) as u16;
        let ready = poll(&mut fds, PollTimeout::from(millis))
            .map_err(|e| new_error(ProtocolError::Transport, format!("poll: {e}")))?;
        if ready == 0 {
            return Ok(None);
        }

        let mut word = [0u8; 4];
        let n = nix::unistd::read(self.fd.as_raw_fd(), &mut word)
            .map_err(|e| new_error(ProtocolError::Transport, format!("read notification: {e}")))?;
        if n < 4 {
            return Ok(None);
        }
        Ok(Some(u32::from_ne_bytes(word)))
    }
}

/// Owns the transport connection and the per-daemon shared resources the
/// control synthesizer dispatches reads and writes through: the mixer and
/// router caches, and the immutable device-map/product-map documents.
pub struct Device<T: Transport> {
    pub transport: Arc<FcpTransport<T>>,
    pub mixer_cache: crate::cache::mixer::MixerCache,
    pub router_cache: crate::cache::router::RouterCache,
}

impl<T: Transport> Device<T> {
    pub fn new(
        transport: FcpTransport<T>,
        mixer_cache: crate::cache::mixer::MixerCache,
        router_cache: crate::cache::router::RouterCache,
    ) -> Self {
        Self {
            transport: Arc::new(transport),
            mixer_cache,
            router_cache,
        }
    }
}
