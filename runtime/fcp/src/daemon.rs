// SPDX-License-Identifier: GPL-3.0-or-later

//! Ties the control synthesizer, the audio-control surface, the kernel
//! transport's notification stream, and the client socket server into one
//! `RuntimeOperation`, playing the role the teacher's per-vendor `*Runtime`
//! structs play for their unit types.
//!
//! Every attached source (surface events, device notifications, client
//! connections, the SIGINT handler) runs on its own OS thread and only ever
//! forwards an `Event` through an `mpsc` channel; all daemon state is read
//! and mutated exclusively from the single consumer loop in `run`, matching
//! the single-threaded-cooperative model the wire protocol and caches assume.

use {
    crate::{
        device::{CharDeviceTransport, Device},
        socket::{socket_path, SocketServer},
        synth::{self, Controller},
    },
    fcp_core::{
        card_cntr::CardCntr,
        dispatcher::Dispatcher,
        LogLevel, RuntimeOperation,
    },
    fcp_protocol::{
        devmap::{DeviceMap, ProductMap},
        new_error,
        transport::{FcpTransport, Transport},
        ProtocolError,
    },
    glib::{ControlFlow, Error},
    nix::sys::signal,
    std::{
        env,
        io::ErrorKind,
        path::PathBuf,
        sync::mpsc,
        thread,
        time::Duration,
    },
    tracing::{error, info, warn},
};

/// Arguments accepted by the `fcpd` binary, parsed by its own `clap::Parser`.
pub struct Arguments {
    pub card_id: u32,
    pub device_path: PathBuf,
}

enum Event {
    Shutdown,
    Elem(alsactl::ElemId, alsactl::ElemEventMask),
    Notify(u32),
    Client(std::os::unix::net::UnixStream),
}

pub struct Daemon {
    device: Device<CharDeviceTransport>,
    controller: Controller,
    card_cntr: CardCntr,
    socket: SocketServer,
    socket_path: PathBuf,
    devmap: DeviceMap,
    rx: mpsc::Receiver<Event>,
    tx: mpsc::SyncSender<Event>,
    dispatchers: Vec<Dispatcher>,
}

const FIRMWARE_VERSION_CONTROL: &str = "Firmware Version";
const ESP_FIRMWARE_VERSION_CONTROL: &str = "ESP Firmware Version";

/// Little-endian magic opening the socket-path TLV blob published on the
/// "Firmware Version" control, matching the client's `get_socket_path` check.
const SOCKET_PATH_TLV_MAGIC: u32 = 0x53434B54;

/// Reads a devmap-resolved four-word version field, defaulting to all zeros
/// when the product map doesn't expose one under this path.
fn read_version_words<T: Transport>(
    transport: &FcpTransport<T>,
    devmap: &DeviceMap,
    path: &str,
) -> Result<[i32; 4], Error> {
    let mut words = [0i32; 4];
    if let Some(resolved) = devmap.resolve_path(path, true)? {
        let bytes = transport.data_read_buf(resolved.offset as u32, 16)?;
        for (word, chunk) in words.iter_mut().zip(bytes.chunks_exact(4)) {
            *word = u32::from_le_bytes(chunk.try_into().unwrap()) as i32;
        }
    }
    Ok(words)
}

/// Builds the "SCKT"-tagged TLV payload the client reads off the
/// "Firmware Version" control to discover this daemon's socket path.
fn socket_path_tlv(path: &PathBuf) -> Vec<u32> {
    let mut bytes = path.as_os_str().as_encoded_bytes().to_vec();
    bytes.push(0);
    while bytes.len() % 4 != 0 {
        bytes.push(0);
    }

    let mut tlv = Vec::with_capacity(2 + bytes.len() / 4);
    tlv.push(SOCKET_PATH_TLV_MAGIC);
    tlv.push(bytes.len() as u32);
    tlv.extend(bytes.chunks_exact(4).map(|c| u32::from_ne_bytes(c.try_into().unwrap())));
    tlv
}

/// Resolves the USB product id of the card's backing device, since the
/// kernel transport's own opcode catalog has no call for it: ALSA exposes
/// the "VVVV:PPPP" USB id of a sound card's parent device at
/// `/proc/asound/card<N>/usbid`.
fn usb_product_id(card_id: u32) -> Result<u16, Error> {
    let path = PathBuf::from(format!("/proc/asound/card{card_id}/usbid"));
    let raw = std::fs::read_to_string(&path)
        .map_err(|e| new_error(ProtocolError::Transport, format!("read {}: {e}", path.display())))?;
    let (vid_str, pid_str) = raw.trim().split_once(':').ok_or_else(|| {
        new_error(ProtocolError::Transport, format!("malformed usbid {raw:?}"))
    })?;
    let vid = u16::from_str_radix(vid_str, 16)
        .map_err(|e| new_error(ProtocolError::Transport, format!("parse vid {vid_str:?}: {e}")))?;
    let pid = u16::from_str_radix(pid_str, 16)
        .map_err(|e| new_error(ProtocolError::Transport, format!("parse pid {pid_str:?}: {e}")))?;
    if vid != fcp_protocol::wire::EXPECTED_VID {
        return Err(new_error(
            ProtocolError::Transport,
            format!("card {card_id} has USB vendor id {vid:04x}, not a supported device"),
        ));
    }
    Ok(pid)
}

fn init_tracing(log_level: Option<LogLevel>) {
    use tracing_subscriber::EnvFilter;

    let level = log_level.unwrap_or_default();
    let filter = EnvFilter::try_from_env("LOG_LEVEL").unwrap_or_else(|_| {
        EnvFilter::new(match level {
            LogLevel::Error => "error",
            LogLevel::Warning => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        })
    });

    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if env::var("JOURNAL_STREAM").is_ok() {
        let _ = subscriber.without_time().try_init();
    } else {
        let _ = subscriber.try_init();
    }
}

impl RuntimeOperation<Arguments> for Daemon {
    fn new(args: Arguments, log_level: Option<LogLevel>) -> Result<Self, Error> {
        init_tracing(log_level);

        let transport = CharDeviceTransport::open(&args.device_path)?;
        let fcp_transport = FcpTransport::new(transport);
        if !fcp_transport.init()? {
            return Err(new_error(
                ProtocolError::VersionMismatch,
                "device speaks the legacy major=1 protocol; a different driver owns it",
            ));
        }

        let override_dir = env::var("FCP_SERVER_DATA_DIR").ok();
        let pid = usb_product_id(args.card_id)?;

        let devmap = DeviceMap::load(pid, override_dir.as_deref())
            .map(Ok)
            .unwrap_or_else(|| DeviceMap::fetch_from_device(&fcp_transport))?;
        let product = ProductMap::load(pid, override_dir.as_deref())
            .ok_or_else(|| new_error(ProtocolError::DevmapMissing, "no product map found for this device"))?;

        let mix_counts = fcp_transport.mix_info()?;
        let mux_sizes = fcp_transport.mux_info()?;
        let (registry, mixer_cache, router_cache) = synth::synthesize(&fcp_transport, &devmap, &product, mix_counts, mux_sizes)?;

        let device = Device::new(fcp_transport, mixer_cache, router_cache);
        let controller = Controller::new(registry);

        let mut card_cntr = CardCntr::default();
        card_cntr.card.open(args.card_id, 0)?;

        let bound_socket_path = socket_path(args.card_id);
        let socket = SocketServer::bind(&bound_socket_path, pid)?;

        let (tx, rx) = mpsc::sync_channel(32);

        Ok(Self {
            device,
            controller,
            card_cntr,
            socket,
            socket_path: bound_socket_path,
            devmap,
            rx,
            tx,
            dispatchers: Vec::new(),
        })
    }

    fn listen(&mut self) -> Result<(), Error> {
        self.controller.load(&mut self.card_cntr)?;
        self.publish_daemon_presence()?;

        self.launch_system_event_dispatcher()?;
        self.launch_notification_thread();
        self.launch_socket_thread()?;

        info!("fcpd listening");
        Ok(())
    }

    fn run(&mut self) -> Result<(), Error> {
        loop {
            let event = match self.rx.recv() {
                Ok(event) => event,
                Err(_) => continue,
            };

            match event {
                Event::Shutdown => break,
                Event::Elem(elem_id, events) => {
                    if let Err(e) = self.card_cntr.dispatch_elem_event(&mut self.device, &elem_id, &events, &mut self.controller) {
                        warn!(error = %e, "control dispatch failed");
                    }
                }
                Event::Notify(word) => {
                    let ids = self.controller.elem_ids_for_notification(word);
                    if ids.is_empty() {
                        tracing::debug!(notification = word, "notification matched no control");
                        continue;
                    }
                    if let Err(e) = self.card_cntr.dispatch_notification(&mut self.device, &word, &ids, &mut self.controller) {
                        warn!(error = %e, "notification reconcile failed");
                    }
                }
                Event::Client(stream) => {
                    self.socket.handle_client(stream, &self.device.transport, &self.devmap);
                }
            }

            self.socket.drain_pending_connections();
        }

        Ok(())
    }
}

impl Daemon {
    /// Registers the "Firmware Version"/"ESP Firmware Version" controls and
    /// writes the socket-path TLV, per C4.9: these live outside the
    /// device-map-driven control registry because the socket path isn't known
    /// until after `SocketServer::bind`, and the TLV shape has nothing to do
    /// with the per-product control catalog.
    fn publish_daemon_presence(&mut self) -> Result<(), Error> {
        let transport = &self.device.transport;

        let fw_elem_id = alsactl::ElemId::new_by_name(alsactl::ElemIfaceType::Card, 0, 0, FIRMWARE_VERSION_CONTROL, 0);
        let tlv = socket_path_tlv(&self.socket_path);
        let fw_ids = self.card_cntr.add_int_elems(
            &fw_elem_id,
            1,
            i32::MIN,
            i32::MAX,
            1,
            4,
            Some(&tlv),
            false,
        )?;
        let fw_version = read_version_words(transport, &self.devmap, "app.firmware_version")?;
        self.write_version_control(&fw_ids, &fw_version)?;

        let esp_elem_id = alsactl::ElemId::new_by_name(alsactl::ElemIfaceType::Card, 0, 0, ESP_FIRMWARE_VERSION_CONTROL, 0);
        let esp_ids = self.card_cntr.add_int_elems(
            &esp_elem_id,
            1,
            i32::MIN,
            i32::MAX,
            1,
            4,
            None,
            false,
        )?;
        let esp_version = read_version_words(transport, &self.devmap, "esp.firmware_version")?;
        self.write_version_control(&esp_ids, &esp_version)?;

        info!(path = %self.socket_path.display(), "published socket path and locked firmware version controls");
        Ok(())
    }

    fn write_version_control(&self, ids: &[alsactl::ElemId], words: &[i32; 4]) -> Result<(), Error> {
        let Some(elem_id) = ids.first() else {
            return Ok(());
        };
        let value = alsactl::ElemValue::new();
        value.set_int(words);
        self.card_cntr.card.write_elem_value(elem_id, &value)
    }

    fn launch_system_event_dispatcher(&mut self) -> Result<(), Error> {
        let mut dispatcher = Dispatcher::run("system event dispatcher".to_string())?;

        let tx = self.tx.clone();
        dispatcher.attach_signal_handler(signal::Signal::SIGINT, move || {
            let _ = tx.send(Event::Shutdown);
            ControlFlow::Break
        });

        let tx = self.tx.clone();
        dispatcher.attach_snd_card(&self.card_cntr.card, |_: &alsactl::Card| {})?;
        self.card_cntr.card.connect_handle_elem_event(move |_, elem_id, events| {
            let _ = tx.send(Event::Elem(elem_id.clone(), events));
        });

        self.dispatchers.push(dispatcher);
        Ok(())
    }

    fn launch_notification_thread(&mut self) {
        let tx = self.tx.clone();
        let transport = self.device.transport.clone();
        thread::spawn(move || loop {
            match transport.io().read_notification(Duration::from_secs(1)) {
                Ok(Some(word)) => {
                    if tx.send(Event::Notify(word)).is_err() {
                        break;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    error!(error = %e, "notification stream read failed");
                    break;
                }
            }
        });
    }

    fn launch_socket_thread(&mut self) -> Result<(), Error> {
        let tx = self.tx.clone();
        let listener = self
            .socket
            .listener_clone()
            .map_err(|e| new_error(ProtocolError::Transport, format!("clone socket listener: {e}")))?;
        thread::spawn(move || loop {
            match listener.accept() {
                Ok((stream, _)) => {
                    if tx.send(Event::Client(stream)).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(100));
                }
                Err(e) => {
                    error!(error = %e, "socket accept failed");
                    thread::sleep(Duration::from_millis(100));
                }
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fcp_protocol::transport::{fake::FakeTransport, OP_DATA_READ};
    use serde_json::json;

    fn devmap_with_app_firmware_version() -> DeviceMap {
        DeviceMap::from_json(json!({
            "structs": {
                "APP_SPACE": {
                    "members": {
                        "app": { "type": "app_t", "offset": 0x200 }
                    }
                },
                "app_t": {
                    "members": {
                        "firmware_version": { "type": "uint32array4", "offset": 0x10 }
                    }
                }
            }
        }))
    }

    #[test]
    fn socket_path_tlv_starts_with_magic_and_matching_length() {
        let path = PathBuf::from("/run/fcpd/card0.sock");
        let tlv = socket_path_tlv(&path);

        assert_eq!(tlv[0], SOCKET_PATH_TLV_MAGIC);
        let byte_len = tlv[1] as usize;
        assert_eq!(byte_len % 4, 0);

        let mut bytes = Vec::with_capacity(byte_len);
        for word in &tlv[2..] {
            bytes.extend_from_slice(&word.to_ne_bytes());
        }
        bytes.truncate(byte_len);
        let nul = bytes.iter().position(|&b| b == 0).unwrap();
        assert_eq!(std::str::from_utf8(&bytes[..nul]).unwrap(), path.to_str().unwrap());
    }

    #[test]
    fn socket_path_tlv_pads_to_four_byte_boundary() {
        // "/a" + NUL is 3 bytes, which needs one pad byte to reach 4.
        let tlv = socket_path_tlv(&PathBuf::from("/a"));
        assert_eq!(tlv[1], 4);
        assert_eq!(tlv.len(), 3);
    }

    #[test]
    fn read_version_words_resolves_devmap_path() {
        let fake = FakeTransport::default();
        fake.responses.borrow_mut().push_back((
            OP_DATA_READ,
            vec![1, 0, 0, 0, 2, 0, 0, 0, 3, 0, 0, 0, 4, 0, 0, 0],
        ));
        let transport = FcpTransport::new(fake);
        let devmap = devmap_with_app_firmware_version();

        let words = read_version_words(&transport, &devmap, "app.firmware_version").unwrap();
        assert_eq!(words, [1, 2, 3, 4]);
    }

    #[test]
    fn read_version_words_defaults_to_zero_when_path_is_absent() {
        let fake = FakeTransport::default();
        let transport = FcpTransport::new(fake);
        let devmap = devmap_with_app_firmware_version();

        let words = read_version_words(&transport, &devmap, "esp.firmware_version").unwrap();
        assert_eq!(words, [0, 0, 0, 0]);
        assert!(transport.io().sent.borrow().is_empty());
    }
}
