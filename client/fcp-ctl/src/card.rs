// SPDX-License-Identifier: GPL-3.0-or-later

//! Card discovery (C4.9): finds Focusrite interfaces on the system, and
//! reads whatever a running daemon has published about each one.
//!
//! Grounded on the original client's `alsa.c`/`usb.c`: a card only counts if
//! `/proc/asound/card<N>/usbid` names our vendor, and its stable identity
//! for a reboot/reconnect cycle is the USB device serial rather than the
//! ALSA card number, which is free to change across a replug.

use {
    alsactl::{prelude::*, Card, ElemAccessFlag, ElemId, ElemIfaceType},
    fcp_protocol::{new_error, wire::EXPECTED_VID, ProtocolError},
    glib::Error,
    std::path::PathBuf,
};

pub const FIRMWARE_VERSION_CONTROL: &str = "Firmware Version";
pub const ESP_FIRMWARE_VERSION_CONTROL: &str = "ESP Firmware Version";

/// Matches `daemon.rs`'s `SOCKET_PATH_TLV_MAGIC`; duplicated here rather than
/// shared because the two binaries otherwise have no common crate for it.
const SOCKET_PATH_TLV_MAGIC: u32 = 0x53434B54;
const MAX_TLV_WORDS: usize = 256;
const MAX_CARDS: u32 = 32;

#[derive(Debug, Clone)]
pub struct FoundCard {
    pub card_num: u32,
    pub usb_vid: u16,
    pub usb_pid: u16,
    pub serial: Option<String>,
    pub socket_path: Option<PathBuf>,
    pub firmware_version: [i32; 4],
    pub esp_firmware_version: [i32; 4],
}

impl FoundCard {
    /// A card only counts as daemon-managed when the control is locked *and*
    /// carries a recognizable TLV, per §4.9.
    pub fn daemon_running(&self) -> bool {
        self.socket_path.is_some()
    }
}

/// Reads and validates the "VVVV:PPPP" USB id ALSA exposes for a card's
/// parent device, mirroring `alsa.c`'s `get_usb_id`.
fn usb_id(card_num: u32) -> Option<(u16, u16)> {
    let raw = std::fs::read_to_string(format!("/proc/asound/card{card_num}/usbid")).ok()?;
    let (vid_str, pid_str) = raw.trim().split_once(':')?;
    let vid = u16::from_str_radix(vid_str, 16).ok()?;
    let pid = u16::from_str_radix(pid_str, 16).ok()?;
    if vid != EXPECTED_VID {
        return None;
    }
    Some((vid, pid))
}

/// Parses `/proc/asound/card<N>/usbbus` ("bus/dev") the way `usb.c`'s
/// `get_usbbus` does, and walks `/sys/bus/usb/devices` for the matching
/// `devnum` to recover the port directory's `serial` attribute.
fn device_serial(card_num: u32) -> Option<String> {
    let usbbus = std::fs::read_to_string(format!("/proc/asound/card{card_num}/usbbus")).ok()?;
    let (bus, dev) = usbbus.trim().split_once('/')?;
    let bus: u32 = bus.parse().ok()?;
    let devnum: u32 = dev.parse().ok()?;

    let root = format!("/sys/bus/usb/devices/usb{bus}");
    find_device_port(&root, &format!("{bus}-"), devnum).and_then(|port_path| {
        std::fs::read_to_string(port_path.join("serial"))
            .ok()
            .map(|s| s.trim().to_string())
    })
}

fn find_device_port(dir: &str, prefix: &str, devnum: u32) -> Option<PathBuf> {
    let entries = std::fs::read_dir(dir).ok()?;
    for entry in entries.flatten() {
        let path = entry.path();
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !name.starts_with(prefix) {
            continue;
        }
        if let Ok(found_devnum) = std::fs::read_to_string(path.join("devnum")) {
            if found_devnum.trim().parse::<u32>() == Ok(devnum) {
                return Some(path);
            }
        }
        let nested_prefix = format!("{name}.");
        if let Some(found) = find_device_port(&path.to_string_lossy(), &nested_prefix, devnum) {
            return Some(found);
        }
    }
    None
}

/// Finds the audio-control element named `name` on the card interface.
fn find_elem(card: &Card, name: &str) -> Result<Option<ElemId>, Error> {
    let elem_id_list = card.elem_id_list()?;
    Ok(elem_id_list
        .into_iter()
        .find(|eid| eid.iface() == ElemIfaceType::Card && eid.name().as_str() == name))
}

fn is_locked(card: &Card, elem_id: &ElemId) -> Result<bool, Error> {
    let info = card.elem_info(elem_id)?;
    Ok(info.as_ref().access().contains(ElemAccessFlag::LOCK))
}

fn read_version_words(card: &Card, elem_id: &ElemId) -> Result<[i32; 4], Error> {
    let mut value = alsactl::ElemValue::new();
    card.read_elem_value(elem_id, &mut value)?;
    let words = value.int();
    let mut out = [0i32; 4];
    out.copy_from_slice(&words[..4]);
    Ok(out)
}

/// Reads and validates the "SCKT"-tagged TLV blob, per §4.9/§6, returning the
/// socket path it names. `None` means either no TLV, a bad magic, or an
/// unreadable/unterminated path: all three mean "not daemon-managed".
fn read_socket_path_tlv(card: &Card, elem_id: &ElemId) -> Option<PathBuf> {
    let mut tlv = [0u32; MAX_TLV_WORDS];
    card.read_elem_tlv(elem_id, &mut tlv).ok()?;

    if tlv[0] != SOCKET_PATH_TLV_MAGIC {
        return None;
    }
    let byte_len = tlv[1] as usize;
    let word_count = byte_len.div_ceil(4).min(MAX_TLV_WORDS - 2);

    let mut bytes = Vec::with_capacity(word_count * 4);
    for word in &tlv[2..2 + word_count] {
        bytes.extend_from_slice(&word.to_ne_bytes());
    }
    bytes.truncate(byte_len);

    let nul = bytes.iter().position(|&b| b == 0)?;
    let path = std::str::from_utf8(&bytes[..nul]).ok()?;
    Some(PathBuf::from(path))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_tmp_dir(label: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("fcp-ctl-test-{label}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn find_device_port_matches_devnum_in_flat_layout() {
        let root = unique_tmp_dir("flat");
        let port = root.join("1-2");
        std::fs::create_dir_all(&port).unwrap();
        std::fs::write(port.join("devnum"), "5\n").unwrap();

        let found = find_device_port(root.to_str().unwrap(), "1-", 5);
        assert_eq!(found, Some(port));

        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn find_device_port_recurses_into_nested_hub_ports() {
        let root = unique_tmp_dir("nested");
        let hub = root.join("1-2");
        let leaf = hub.join("1-2.3");
        std::fs::create_dir_all(&leaf).unwrap();
        std::fs::write(hub.join("devnum"), "9\n").unwrap();
        std::fs::write(leaf.join("devnum"), "7\n").unwrap();

        let found = find_device_port(root.to_str().unwrap(), "1-", 7);
        assert_eq!(found, Some(leaf));

        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn find_device_port_returns_none_without_a_match() {
        let root = unique_tmp_dir("nomatch");
        std::fs::create_dir_all(root.join("1-2")).unwrap();
        std::fs::write(root.join("1-2").join("devnum"), "5\n").unwrap();

        assert_eq!(find_device_port(root.to_str().unwrap(), "1-", 99), None);

        let _ = std::fs::remove_dir_all(&root);
    }
}

/// Opens card `card_num` and reads everything the daemon may have published
/// on it. Returns `Ok(None)` for a card number that doesn't exist or isn't a
/// supported Focusrite device at all (not an error, just "not ours").
pub fn inspect_card(card_num: u32) -> Result<Option<FoundCard>, Error> {
    let Some((usb_vid, usb_pid)) = usb_id(card_num) else {
        return Ok(None);
    };

    let mut card = Card::default();
    if card.open(card_num, 0).is_err() {
        return Ok(None);
    }

    let serial = device_serial(card_num);

    let (socket_path, firmware_version) = match find_elem(&card, FIRMWARE_VERSION_CONTROL)? {
        Some(elem_id) => {
            let locked = is_locked(&card, &elem_id).unwrap_or(false);
            let path = if locked { read_socket_path_tlv(&card, &elem_id) } else { None };
            let version = read_version_words(&card, &elem_id).unwrap_or([0; 4]);
            (path, version)
        }
        None => (None, [0; 4]),
    };

    let esp_firmware_version = match find_elem(&card, ESP_FIRMWARE_VERSION_CONTROL)? {
        Some(elem_id) => read_version_words(&card, &elem_id).unwrap_or([0; 4]),
        None => [0; 4],
    };

    Ok(Some(FoundCard {
        card_num,
        usb_vid,
        usb_pid,
        serial,
        socket_path,
        firmware_version,
        esp_firmware_version,
    }))
}

/// Scans every possible ALSA card number, matching `alsa.c`'s
/// `enumerate_cards` loop over `snd_card_next`.
pub fn enumerate_cards() -> Result<Vec<FoundCard>, Error> {
    let mut found = Vec::new();
    for card_num in 0..MAX_CARDS {
        if let Some(card) = inspect_card(card_num)? {
            found.push(card);
        }
    }
    Ok(found)
}

/// Selects exactly one card: the one named by `--card`, or the sole result
/// of [`enumerate_cards`] when there's exactly one. Mirrors `main.c`'s
/// "No supported devices found" / "Multiple supported devices found" checks.
pub fn select_card(card_num: Option<u32>) -> Result<FoundCard, Error> {
    match card_num {
        Some(n) => inspect_card(n)?
            .ok_or_else(|| new_error(ProtocolError::Transport, format!("no supported device found on card {n}"))),
        None => {
            let mut cards = enumerate_cards()?;
            match cards.len() {
                0 => Err(new_error(ProtocolError::Transport, "no supported devices found")),
                1 => Ok(cards.remove(0)),
                _ => Err(new_error(
                    ProtocolError::Transport,
                    "multiple supported devices found; use --card to pick one",
                )),
            }
        }
    }
}
