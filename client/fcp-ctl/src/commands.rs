// SPDX-License-Identifier: GPL-3.0-or-later

//! Command execution (C4.7/C4.9 client side), grounded on `main.c`'s
//! `execute_command`/`perform_update`: each firmware-bearing command prints
//! a status line, streams the request, and for `update` decides which
//! sections actually need flashing by comparing embedded section versions
//! against the card's cached control values.

use {
    crate::{
        card::{FoundCard, ESP_FIRMWARE_VERSION_CONTROL, FIRMWARE_VERSION_CONTROL},
        session,
        wait::wait_for_device,
    },
    fcp_protocol::{
        firmware::{FirmwareContainer, FirmwareSection, SectionKind},
        new_error,
        wire::{self, FirmwarePayloadHeader, RequestType, EXPECTED_VID, FIRMWARE_PAYLOAD_HEADER_LEN},
        ProtocolError,
    },
    glib::Error,
    std::{os::unix::net::UnixStream, time::Duration},
};

const REBOOT_WAIT_TIMEOUT: Duration = Duration::from_secs(20);

fn build_payload(section: &FirmwareSection, pid: u16) -> Vec<u8> {
    let header = FirmwarePayloadHeader {
        size: section.payload.len() as u32,
        vid: EXPECTED_VID,
        pid,
        sha256: section.sha256,
        md5: section.md5.unwrap_or([0u8; 16]),
    };
    let mut out = Vec::with_capacity(FIRMWARE_PAYLOAD_HEADER_LEN + section.payload.len());
    header.write_to(&mut out);
    out.extend_from_slice(&section.payload);
    out
}

fn upload_section(stream: &mut UnixStream, pid: u16, section: &FirmwareSection, request: RequestType) -> Result<(), Error> {
    let payload = build_payload(section, pid);
    wire::write_request(stream, request, &payload)?;
    session::handle_server_responses(stream)
}

/// Sends REBOOT, waits for the socket to drop, then polls for the card's
/// serial to reappear with a freshly-published socket path, matching
/// `main.c`'s `reboot_and_wait`.
fn reboot_and_reconnect(stream: &mut UnixStream, card: &FoundCard) -> Result<(FoundCard, UnixStream), Error> {
    let serial = card
        .serial
        .clone()
        .ok_or_else(|| new_error(ProtocolError::Transport, "card has no resolvable USB serial number"))?;

    wire::write_request(stream, RequestType::Reboot, &[])?;
    session::wait_for_disconnect(stream)?;

    eprintln!("Waiting for device to come back...");
    let reappeared = wait_for_device(&serial, REBOOT_WAIT_TIMEOUT)?;
    let path = reappeared
        .socket_path
        .clone()
        .ok_or_else(|| new_error(ProtocolError::Transport, "reappeared device did not publish a socket path"))?;
    let new_stream = session::connect(&path)?;
    Ok((reappeared, new_stream))
}

pub fn reboot(stream: &mut UnixStream) -> Result<(), Error> {
    eprintln!("Rebooting...");
    session::send_simple_command(stream, RequestType::Reboot)
}

pub fn erase_config(stream: &mut UnixStream) -> Result<(), Error> {
    eprintln!("Erasing configuration...");
    session::send_simple_command(stream, RequestType::ConfigErase)
}

pub fn erase_app(stream: &mut UnixStream) -> Result<(), Error> {
    eprintln!("Erasing application firmware...");
    session::send_simple_command(stream, RequestType::AppFirmwareErase)
}

pub fn upload_leapfrog(stream: &mut UnixStream, card: &FoundCard, container: &FirmwareContainer) -> Result<(), Error> {
    let section = container
        .section(SectionKind::Leapfrog)
        .ok_or_else(|| new_error(ProtocolError::FirmwareInvalid, "firmware file has no leapfrog section"))?;
    eprintln!("Uploading leapfrog firmware...");
    upload_section(stream, card.usb_pid, section, RequestType::AppFirmwareUpdate)
}

pub fn upload_app(stream: &mut UnixStream, card: &FoundCard, container: &FirmwareContainer) -> Result<(), Error> {
    let section = container
        .section(SectionKind::App)
        .ok_or_else(|| new_error(ProtocolError::FirmwareInvalid, "firmware file has no application section"))?;
    eprintln!("Uploading application firmware...");
    upload_section(stream, card.usb_pid, section, RequestType::AppFirmwareUpdate)
}

pub fn upload_esp(stream: &mut UnixStream, card: &FoundCard, container: &FirmwareContainer) -> Result<(), Error> {
    let section = container
        .section(SectionKind::Esp)
        .ok_or_else(|| new_error(ProtocolError::FirmwareInvalid, "firmware file has no auxiliary-MCU section"))?;
    eprintln!("Uploading auxiliary-MCU firmware...");
    upload_section(stream, card.usb_pid, section, RequestType::EspFirmwareUpdate)
}

fn versions_differ(section_version: [u32; 4], card_version: [i32; 4]) -> bool {
    section_version.iter().zip(card_version.iter()).any(|(&s, &c)| s != c as u32)
}

/// Decides which sections actually need flashing by comparing each
/// section's embedded version against the corresponding control the card
/// currently reports, then uploads leapfrog, then ESP, then app, rebooting
/// and reconnecting after any app-firmware-path upload. Mirrors `main.c`'s
/// `perform_update`.
pub fn update(mut stream: UnixStream, mut card: FoundCard, container: &FirmwareContainer) -> Result<(), Error> {
    let need_leapfrog = container.section(SectionKind::Leapfrog).is_some();
    let need_esp = container
        .section(SectionKind::Esp)
        .is_some_and(|s| versions_differ(s.version, card.esp_firmware_version));
    let need_app = container
        .section(SectionKind::App)
        .is_some_and(|s| versions_differ(s.version, card.firmware_version));

    if !need_leapfrog && !need_esp && !need_app {
        eprintln!("Device is already up to date.");
        return Ok(());
    }

    if need_leapfrog {
        let section = container.section(SectionKind::Leapfrog).unwrap();
        eprintln!("Uploading leapfrog firmware...");
        upload_section(&mut stream, card.usb_pid, section, RequestType::AppFirmwareUpdate)?;
        let (reappeared, reconnected) = reboot_and_reconnect(&mut stream, &card)?;
        card = reappeared;
        stream = reconnected;
    }

    if need_esp {
        let section = container.section(SectionKind::Esp).unwrap();
        eprintln!("Uploading auxiliary-MCU firmware...");
        upload_section(&mut stream, card.usb_pid, section, RequestType::EspFirmwareUpdate)?;
    }

    if need_app {
        let section = container.section(SectionKind::App).unwrap();
        eprintln!("Uploading application firmware...");
        upload_section(&mut stream, card.usb_pid, section, RequestType::AppFirmwareUpdate)?;
        reboot_and_reconnect(&mut stream, &card)?;
    }

    eprintln!("Update complete.");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn versions_differ_detects_mismatch() {
        assert!(versions_differ([1, 0, 0, 0], [0, 0, 0, 0]));
        assert!(!versions_differ([1, 2, 3, 4], [1, 2, 3, 4]));
    }

    #[test]
    fn versions_differ_handles_negative_card_values_as_unsigned() {
        // A card control can't actually report a negative word, but the cast
        // back to u32 must still line up bit-for-bit against the section's
        // embedded version so a 0xffffffff word compares equal to itself.
        assert!(!versions_differ([0xffff_ffff, 0, 0, 0], [-1, 0, 0, 0]));
    }
}

pub fn print_card(card: &FoundCard) {
    let serial = card.serial.as_deref().unwrap_or("unknown");
    if let Some(path) = &card.socket_path {
        println!(
            "card {}: {:04x}:{:04x} serial={} socket={} [{}={:?} {}={:?}]",
            card.card_num,
            card.usb_vid,
            card.usb_pid,
            serial,
            path.display(),
            FIRMWARE_VERSION_CONTROL,
            card.firmware_version,
            ESP_FIRMWARE_VERSION_CONTROL,
            card.esp_firmware_version,
        );
    } else {
        println!(
            "card {}: {:04x}:{:04x} serial={} (no fcpd running)",
            card.card_num, card.usb_vid, card.usb_pid, serial,
        );
    }
}
