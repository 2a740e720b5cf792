// SPDX-License-Identifier: GPL-3.0-or-later

//! Waiting for a card to reappear after a reboot (C4.9), grounded on the
//! original client's `wait.c`: poll once a second up to a deadline, and only
//! surface the failure on the final attempt rather than on every miss.

use {
    crate::card::{enumerate_cards, FoundCard},
    fcp_protocol::{new_error, ProtocolError},
    glib::Error,
    std::{
        thread,
        time::{Duration, Instant},
    },
};

const POLL_INTERVAL: Duration = Duration::from_secs(1);

fn find_by_serial(serial: &str) -> Result<Option<FoundCard>, Error> {
    let cards = enumerate_cards()?;
    Ok(cards.into_iter().find(|c| c.serial.as_deref() == Some(serial) && c.daemon_running()))
}

/// Polls for a card whose serial equals `serial` and whose daemon has
/// re-published the socket-path TLV, for up to `timeout`, once a second.
pub fn wait_for_device(serial: &str, timeout: Duration) -> Result<FoundCard, Error> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(card) = find_by_serial(serial)? {
            return Ok(card);
        }

        if Instant::now() >= deadline {
            return find_by_serial(serial)?.ok_or_else(|| {
                new_error(
                    ProtocolError::Transport,
                    format!("timed out waiting for device with serial {serial} to reappear"),
                )
            });
        }

        thread::sleep(POLL_INTERVAL);
    }
}
