// SPDX-License-Identifier: GPL-3.0-or-later

//! Socket session handling (C8 client side): connects to a daemon's socket,
//! issues one request, and drains its stream of responses.
//!
//! Grounded on the original client's `main.c`: `handle_server_responses`
//! becomes a blocking read loop whose 15-second inactivity budget (per §5)
//! is enforced directly as the stream's read timeout, rather than via a
//! `select` call watching one descriptor — the single-client, one-request-
//! at-a-time shape here makes the two equivalent.

use {
    fcp_protocol::{
        new_error,
        wire::{self, ResponseType, SocketError},
        ProtocolError,
    },
    glib::Error,
    std::{
        io::Write,
        os::unix::net::UnixStream,
        path::Path,
        time::Duration,
    },
};

const CLIENT_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(15);
const DISCONNECT_WAIT: Duration = Duration::from_secs(1);
const PROGRESS_BAR_WIDTH: usize = 50;

pub fn connect(path: &Path) -> Result<UnixStream, Error> {
    UnixStream::connect(path)
        .map_err(|e| new_error(ProtocolError::Transport, format!("connect to {}: {e}", path.display())))
}

/// Renders the 50-character `[####------]  42%` bar in place on `out`,
/// matching `main.c`'s `show_progress`.
fn show_progress<W: Write>(out: &mut W, percent: u8) {
    let percent = percent.min(100);
    let filled = percent as usize / 2;
    let half = percent % 2 == 1;

    let mut bar = String::with_capacity(PROGRESS_BAR_WIDTH);
    for i in 0..PROGRESS_BAR_WIDTH {
        let ch = if i < filled {
            '#'
        } else if i == filled && half {
            '>'
        } else {
            '-'
        };
        bar.push(ch);
    }
    let _ = write!(out, "\r[{bar}] {percent:3}%");
    let _ = out.flush();
}

/// Reads responses until SUCCESS or ERROR, rendering PROGRESS frames as a
/// bar on stderr. The 15s read timeout doubles as the client-inactivity
/// cancellation named in §5: a response that never arrives surfaces as a
/// transport error, same as an explicit `SocketError::Timeout`.
pub fn handle_server_responses(stream: &mut UnixStream) -> Result<(), Error> {
    stream
        .set_read_timeout(Some(CLIENT_INACTIVITY_TIMEOUT))
        .map_err(|e| new_error(ProtocolError::Transport, format!("set_read_timeout: {e}")))?;

    let mut stderr = std::io::stderr();
    let mut progress_shown = false;

    loop {
        let (response, payload) = wire::read_response(stream).map_err(|e| {
            if progress_shown {
                let _ = writeln!(stderr);
            }
            let _ = writeln!(stderr, "Error: {}", SocketError::Timeout.message());
            e
        })?;

        match response {
            ResponseType::Progress => {
                let percent = payload.first().copied().unwrap_or(0);
                show_progress(&mut stderr, percent);
                progress_shown = true;
            }
            ResponseType::Error => {
                let code = payload
                    .get(0..2)
                    .map(|b| i16::from_le_bytes([b[0], b[1]]))
                    .unwrap_or(-1);
                let message = SocketError::from_code(code).map(SocketError::message).unwrap_or("unknown error");
                if progress_shown {
                    writeln!(stderr).ok();
                }
                writeln!(stderr, "Error: {message}").ok();
                return Err(new_error(ProtocolError::Invalid(code as i32), message));
            }
            ResponseType::Success => {
                if progress_shown {
                    show_progress(&mut stderr, 100);
                    writeln!(stderr).ok();
                } else {
                    writeln!(stderr, "Done!").ok();
                }
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn show_progress_renders_half_width_bar() {
        let mut buf = Vec::new();
        show_progress(&mut buf, 42);
        let rendered = String::from_utf8(buf).unwrap();

        assert!(rendered.starts_with('\r'));
        assert!(rendered.ends_with(" 42%"));
        let filled = rendered.matches('#').count();
        assert_eq!(filled, 21);
    }

    #[test]
    fn show_progress_clamps_above_100() {
        let mut buf = Vec::new();
        show_progress(&mut buf, 150);
        let rendered = String::from_utf8(buf).unwrap();
        assert!(rendered.contains("100%"));
        assert_eq!(rendered.matches('#').count(), PROGRESS_BAR_WIDTH);
    }
}

/// Sends a zero-payload request and drains the response stream, matching
/// `main.c`'s `send_simple_command`.
pub fn send_simple_command(stream: &mut UnixStream, request: wire::RequestType) -> Result<(), Error> {
    wire::write_request(stream, request, &[])?;
    handle_server_responses(stream)
}

/// Waits up to one second for the socket to hit EOF after a REBOOT request,
/// matching `main.c`'s `wait_for_disconnect`.
pub fn wait_for_disconnect(stream: &mut UnixStream) -> Result<(), Error> {
    use std::io::Read;

    stream
        .set_read_timeout(Some(DISCONNECT_WAIT))
        .map_err(|e| new_error(ProtocolError::Transport, format!("set_read_timeout: {e}")))?;

    let mut buf = [0u8; 64];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => return Ok(()),
            Ok(_) => continue,
            Err(e) if matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut) => {
                return Ok(())
            }
            Err(e) => return Err(new_error(ProtocolError::Transport, format!("wait for disconnect: {e}"))),
        }
    }
}
