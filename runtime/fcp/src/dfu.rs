// SPDX-License-Identifier: GPL-3.0-or-later

//! Auxiliary-MCU DFU engine (C9): drives the device's `eSuperState` state
//! machine (OFF → DFU → OFF → NORMAL) while streaming a leapfrog-firmware
//! payload, per the twelve-step sequence in the running design.

use {
    fcp_protocol::{
        devmap::DeviceMap,
        new_error,
        transport::{FcpTransport, Transport},
        wire::{FirmwarePayloadHeader, SocketError},
        ProtocolError,
    },
    glib::Error,
    sha2::{Digest, Sha256},
    std::time::{Duration, Instant},
};

const SUPER_STATE_ENUM: &str = "eSuperState";
const DFU_NOTIFY_ENUM: &str = "eDfuNotify";

const NOTIFY_WAIT_TIMEOUT: Duration = Duration::from_secs(10);
const NOTIFY_POLL_INTERVAL: Duration = Duration::from_millis(100);
const NOTIFY_POLL_ATTEMPTS: u32 = 5;
const DFU_BLOCK_SIZE: usize = 1024;

struct SuperStates {
    off: i64,
    dfu: i64,
    normal: i64,
}

struct DfuNotifications {
    clear: i64,
    next_block: i64,
    finish: i64,
    #[allow(dead_code)]
    error: i64,
}

struct ResolvedMap {
    states: SuperStates,
    notifications: DfuNotifications,
    boot_mode_offset: i64,
    dfu_notify_offset: i64,
    dfu_change_bit: i64,
}

fn enumerator(devmap: &DeviceMap, table: &str, symbol: &str) -> Result<i64, Error> {
    devmap.enumerator(table, symbol).ok_or_else(|| {
        new_error(
            ProtocolError::DevmapInvalid,
            format!("device map missing enumerator {table}.{symbol}"),
        )
    })
}

fn resolve(devmap: &DeviceMap) -> Result<ResolvedMap, Error> {
    Ok(ResolvedMap {
        states: SuperStates {
            off: enumerator(devmap, SUPER_STATE_ENUM, "off")?,
            dfu: enumerator(devmap, SUPER_STATE_ENUM, "dfu")?,
            normal: enumerator(devmap, SUPER_STATE_ENUM, "normal")?,
        },
        notifications: DfuNotifications {
            clear: enumerator(devmap, DFU_NOTIFY_ENUM, "clear")?,
            next_block: enumerator(devmap, DFU_NOTIFY_ENUM, "next_block")?,
            finish: enumerator(devmap, DFU_NOTIFY_ENUM, "finish")?,
            error: enumerator(devmap, DFU_NOTIFY_ENUM, "error")?,
        },
        boot_mode_offset: devmap
            .resolve_path("aux.boot_mode", false)?
            .ok_or_else(|| new_error(ProtocolError::DevmapInvalid, "aux.boot_mode missing"))?
            .offset,
        dfu_notify_offset: devmap
            .resolve_path("aux.dfu_notify", false)?
            .ok_or_else(|| new_error(ProtocolError::DevmapInvalid, "aux.dfu_notify missing"))?
            .offset,
        dfu_change_bit: enumerator(devmap, "eDEV_NOTIFY_BIT", "aux_dfu_change")
            .or_else(|_| enumerator(devmap, SUPER_STATE_ENUM, "notify_bit"))?,
    })
}

/// Blocks up to 10s total for a notification with the DFU-change bit set.
/// An EINTR-equivalent poll timeout is not progress; it simply keeps
/// spinning until the overall deadline elapses.
fn wait_for_dfu_change<T: Transport>(transport: &FcpTransport<T>, change_bit: i64) -> Result<(), Error> {
    let deadline = Instant::now() + NOTIFY_WAIT_TIMEOUT;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(new_error(ProtocolError::Transport, "timed out waiting for DFU-change notification"));
        }
        if let Some(word) = transport.io().read_notification(remaining)? {
            if (word as i64) & change_bit != 0 {
                return Ok(());
            }
        }
    }
}

/// Polls the DFU notify slot up to five times, reading and clearing between
/// attempts, waiting for it to equal `expected`.
fn poll_notify_slot<T: Transport>(
    transport: &FcpTransport<T>,
    map: &ResolvedMap,
    expected: i64,
) -> Result<(), Error> {
    for _ in 0..NOTIFY_POLL_ATTEMPTS {
        wait_for_dfu_change(transport, map.dfu_change_bit)?;
        let value = transport.data_read(map.dfu_notify_offset as u32, 4, false)?;
        transport.data_write(map.dfu_notify_offset as u32, 4, map.notifications.clear)?;
        if value == expected {
            return Ok(());
        }
        std::thread::sleep(NOTIFY_POLL_INTERVAL);
    }
    Err(new_error(ProtocolError::Transport, "DFU notify slot never reached the expected value"))
}

fn read_super_state<T: Transport>(transport: &FcpTransport<T>, map: &ResolvedMap) -> Result<i64, Error> {
    transport.data_read(map.boot_mode_offset as u32, 4, false)
}

/// Drives the device from `from` to `to` by writing the boot-mode value and
/// waiting for the transition to complete, per steps 4 and 11.
fn drive_state<T: Transport>(transport: &FcpTransport<T>, map: &ResolvedMap, to: i64) -> Result<(), Error> {
    transport.data_write(map.boot_mode_offset as u32, 4, to)?;
    wait_for_dfu_change(transport, map.dfu_change_bit)?;

    for attempt in 0..NOTIFY_POLL_ATTEMPTS {
        let state = read_super_state(transport, map)?;
        if state == to {
            return Ok(());
        }
        if attempt + 1 < NOTIFY_POLL_ATTEMPTS {
            std::thread::sleep(NOTIFY_POLL_INTERVAL);
        }
    }
    Err(new_error(ProtocolError::Transport, "device did not reach the requested boot mode"))
}

/// Runs the full OFF→DFU→OFF→NORMAL auxiliary-MCU update sequence, invoking
/// `on_progress` as the percentage monotonically advances from 0 to 100.
pub fn run_update<T: Transport>(
    transport: &FcpTransport<T>,
    devmap: &DeviceMap,
    expected_pid: u16,
    payload: &[u8],
    mut on_progress: impl FnMut(u8) -> Result<(), Error>,
) -> Result<(), Error> {
    let map = resolve(devmap)?;
    let header = FirmwarePayloadHeader::parse(payload)?;
    let body = &payload[fcp_protocol::wire::FIRMWARE_PAYLOAD_HEADER_LEN..];
    if body.len() != header.size as usize {
        return Err(new_error(ProtocolError::Framing, "ESP firmware payload size mismatch"));
    }
    if header.vid != fcp_protocol::wire::EXPECTED_VID || header.pid != expected_pid {
        return Err(new_error(
            ProtocolError::Invalid(SocketError::InvalidUsbId.code() as i32),
            format!("firmware targets {:04x}:{:04x}, device is {:04x}:{:04x}", header.vid, header.pid, fcp_protocol::wire::EXPECTED_VID, expected_pid),
        ));
    }
    let digest: [u8; 32] = Sha256::digest(body).into();
    if digest != header.sha256 {
        return Err(new_error(ProtocolError::FirmwareInvalid, "ESP firmware SHA-256 mismatch"));
    }

    on_progress(0)?;

    let state = read_super_state(transport, &map)?;
    if state != map.states.off && state != map.states.dfu && state != map.states.normal {
        return Err(new_error(ProtocolError::Invalid(SocketError::NotLeapfrog.code() as i32), "device is not running leapfrog firmware"));
    }

    if state == map.states.normal {
        drive_state(transport, &map, map.states.off)?;
    }
    if read_super_state(transport, &map)? != map.states.off {
        return Err(new_error(ProtocolError::Transport, "device failed to reach OFF before DFU start"));
    }

    transport.esp_dfu_start(body.len() as u32, &header.md5)?;
    wait_for_dfu_change(transport, map.dfu_change_bit)?;
    if read_super_state(transport, &map)? != map.states.dfu {
        return Err(new_error(ProtocolError::Transport, "device did not enter DFU state"));
    }

    poll_notify_slot(transport, &map, map.notifications.next_block)?;

    let total_blocks = body.len().div_ceil(DFU_BLOCK_SIZE).max(1);
    let mut last_percent = 0u8;
    for (i, chunk) in body.chunks(DFU_BLOCK_SIZE).enumerate() {
        transport.esp_dfu_write(chunk)?;
        poll_notify_slot(transport, &map, map.notifications.next_block)?;

        let percent = (((i + 1) as u64 * 100) / total_blocks as u64) as u8;
        if percent > last_percent {
            on_progress(percent)?;
            last_percent = percent;
        }
    }

    transport.esp_dfu_write(&[])?;
    poll_notify_slot(transport, &map, map.notifications.finish)?;

    drive_state(transport, &map, map.states.off)?;
    drive_state(transport, &map, map.states.normal)?;

    if last_percent < 100 {
        on_progress(100)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_map() -> DeviceMap {
        DeviceMap::from_json(json!({
            "structs": {
                "APP_SPACE": {
                    "members": {
                        "aux": { "type": "aux_t", "offset": 0 }
                    }
                },
                "aux_t": {
                    "members": {
                        "boot_mode": { "type": "uint32", "offset": 0 },
                        "dfu_notify": { "type": "uint32", "offset": 4 }
                    }
                }
            },
            "enums": {
                "eSuperState": { "enumerators": { "off": 0, "dfu": 1, "normal": 2 } },
                "eDfuNotify": { "enumerators": { "clear": 0, "next_block": 1, "finish": 2, "error": 3 } },
                "eDEV_NOTIFY_BIT": { "enumerators": { "aux_dfu_change": 1 } }
            }
        }))
    }

    #[test]
    fn resolve_reads_every_required_enumerator() {
        let map = sample_map();
        let resolved = resolve(&map).unwrap();
        assert_eq!(resolved.states.off, 0);
        assert_eq!(resolved.notifications.next_block, 1);
        assert_eq!(resolved.dfu_change_bit, 1);
    }
}
