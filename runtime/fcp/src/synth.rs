// SPDX-License-Identifier: GPL-3.0-or-later

//! Control synthesizer (C4): walks the device map and the per-product
//! control map to build the [`ControlRegistry`], then plays the role of
//! `Tcd22xxCtls` in the teacher's design — a single `CtlModel`/`NotifyModel`
//! implementation whose `read`/`write` dispatch centrally on
//! [`ControlKind`] instead of one function-pointer pair per control.

use {
    crate::device::Device,
    alsa_ctl_tlv_codec::items::DbInterval,
    fcp_core::card_cntr::{CardCntr, CtlModel, NotifyModel},
    fcp_protocol::{
        control::{
            Category, CompositeComponent, ControlKind, ControlRecord, ControlRegistry,
            DbRangeTlv, EnumMapping, Interface, PrimitiveType,
        },
        devmap::{DeviceMap, ProductMap},
        new_error,
        transport::{FcpTransport, Transport},
        ProtocolError,
    },
    alsactl::{ElemId, ElemIfaceType, ElemValue},
    glib::Error,
    serde_json::Value,
};

const FCP_USER_MESSAGE_ENUM: &str = "eDEV_FCP_USER_MESSAGE_TYPE";
const FLASH_SAVE_SYMBOL: &str = "flash_save";

/// Mixer coefficient range, per `spec.md` §4.3: -80 dB..+12 dB in 0.5 dB steps.
pub const MIXER_MIN_DB: i32 = -80;
pub const MIXER_MAX_DB: i32 = 12;
pub const MIXER_MAX_VALUE: i64 = ((MIXER_MAX_DB - MIXER_MIN_DB) * 2) as i64;

fn interface_of(value: &Value) -> Interface {
    match value.get("interface").and_then(Value::as_str) {
        Some("mixer") => Interface::Mixer,
        _ => Interface::Card,
    }
}

fn str_field<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(Value::as_str)
}

fn synthesize_save_redirect(
    devmap: &DeviceMap,
    entry: &Value,
    notify_device: Option<i64>,
) -> Result<Option<i64>, Error> {
    let save = entry.get("save").and_then(Value::as_bool).unwrap_or(false);
    if !save {
        return Ok(notify_device);
    }
    if notify_device.is_some() {
        return Err(new_error(
            ProtocolError::DevmapInvalid,
            "control requests both explicit notify-device and save",
        ));
    }
    devmap
        .enumerator(FCP_USER_MESSAGE_ENUM, FLASH_SAVE_SYMBOL)
        .map(Some)
        .ok_or_else(|| new_error(ProtocolError::DevmapInvalid, "flash-save bit missing from device map"))
}

/// Synthesizes one control from a product-map entry naming a device-map path.
/// Returns `None` when the path is declared `allow_missing` and absent.
fn synthesize_named(devmap: &DeviceMap, entry: &Value) -> Result<Option<ControlRecord>, Error> {
    let name = str_field(entry, "name")
        .ok_or_else(|| new_error(ProtocolError::DevmapInvalid, "control entry missing 'name'"))?
        .to_string();
    let path = str_field(entry, "path")
        .ok_or_else(|| new_error(ProtocolError::DevmapInvalid, "control entry missing 'path'"))?;
    let allow_missing = entry.get("allow-missing").and_then(Value::as_bool).unwrap_or(false);

    let resolved = match devmap.resolve_path(path, allow_missing)? {
        Some(r) => r,
        None => return Ok(None),
    };

    let primitive = PrimitiveType::from_name(&resolved.type_name)
        .ok_or_else(|| new_error(ProtocolError::DevmapInvalid, format!("unknown primitive type '{}'", resolved.type_name)))?;

    let notify_device = synthesize_save_redirect(devmap, entry, resolved.notify_device)?;
    let array_index = entry.get("array-index").and_then(Value::as_i64).unwrap_or(0);
    let read_only = entry.get("read-only").and_then(Value::as_bool).unwrap_or(false);
    let interface = interface_of(entry);

    let kind = match str_field(entry, "kind").unwrap_or("boolean") {
        "boolean" => ControlKind::Boolean,
        "integer" => {
            let (nat_min, nat_max) = primitive.natural_range();
            let min = entry.get("min").and_then(Value::as_i64).unwrap_or(nat_min);
            let max = entry.get("max").and_then(Value::as_i64).unwrap_or(nat_max);
            let tlv = match (entry.get("db-min").and_then(Value::as_i64), entry.get("db-max").and_then(Value::as_i64)) {
                (Some(db_min), Some(db_max)) => Some(DbRangeTlv {
                    min_centidb: (db_min * 100) as i32,
                    max_centidb: (db_max * 100) as i32,
                }),
                _ => None,
            };
            ControlKind::Integer { min, max, step: 1, tlv }
        }
        "enumerated" => synthesize_enum_kind(entry)?,
        "bytes" => {
            let size = resolved.size.unwrap_or(primitive.width as i64) as usize;
            ControlKind::Bytes { size }
        }
        "bool-bitmap" => {
            let bit = entry
                .get("bit")
                .and_then(Value::as_u64)
                .unwrap_or(array_index as u64) as u32;
            ControlKind::BitmapBit { bit }
        }
        other => return Err(new_error(ProtocolError::DevmapInvalid, format!("unknown control kind '{other}'"))),
    };

    Ok(Some(ControlRecord {
        name,
        interface,
        category: Category::Data,
        kind,
        primitive,
        offset: resolved.offset,
        array_index,
        read_only,
        notify_device,
        notify_client: resolved.notify_client,
        value: 0,
        bytes_value: Vec::new(),
        linked_index: None,
    }))
}

fn synthesize_enum_kind(entry: &Value) -> Result<ControlKind, Error> {
    if let (Some(max_from), Some(label_format)) = (
        entry.get("max-from").and_then(Value::as_str),
        entry.get("label-format").and_then(Value::as_str),
    ) {
        let n: i64 = max_from.parse().unwrap_or(0);
        let labels = (1..=n).map(|i| label_format.replacen("%d", &i.to_string(), 1)).collect();
        return Ok(ControlKind::Enumerated { labels, mapping: EnumMapping::Direct });
    }

    let values = entry
        .get("values")
        .and_then(Value::as_array)
        .ok_or_else(|| new_error(ProtocolError::DevmapInvalid, "enumerated control missing 'values'"))?;

    if values.iter().all(Value::is_string) {
        let labels = values.iter().map(|v| v.as_str().unwrap().to_string()).collect();
        Ok(ControlKind::Enumerated { labels, mapping: EnumMapping::Direct })
    } else {
        let mut labels = Vec::with_capacity(values.len());
        let mut table = Vec::with_capacity(values.len());
        for (i, v) in values.iter().enumerate() {
            let label = v
                .get("name")
                .and_then(Value::as_str)
                .ok_or_else(|| new_error(ProtocolError::DevmapInvalid, "enum value object missing 'name'"))?;
            let device_value = v.get("value").and_then(Value::as_i64).unwrap_or(i as i64);
            labels.push(label.to_string());
            table.push(device_value);
        }
        Ok(ControlKind::Enumerated { labels, mapping: EnumMapping::Indexed(table) })
    }
}

fn synthesize_composite(devmap: &DeviceMap, entry: &Value) -> Result<Option<ControlRecord>, Error> {
    let name = str_field(entry, "name")
        .ok_or_else(|| new_error(ProtocolError::DevmapInvalid, "composite control missing 'name'"))?
        .to_string();
    let component_strs = entry
        .get("components")
        .and_then(Value::as_array)
        .ok_or_else(|| new_error(ProtocolError::DevmapInvalid, "composite control missing 'components'"))?;

    let mut components = Vec::new();
    for raw in component_strs {
        let text = raw.as_str().ok_or_else(|| new_error(ProtocolError::DevmapInvalid, "composite component is not a string"))?;
        let mut parts = text.split(':');
        let path = parts.next().unwrap_or("");
        let offset_adjust: i64 = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
        let width_override: Option<usize> = parts.next().and_then(|s| s.parse().ok());

        let resolved = match devmap.resolve_path(path, true)? {
            Some(r) => r,
            None => continue,
        };
        let mut primitive = PrimitiveType::from_name(&resolved.type_name)
            .ok_or_else(|| new_error(ProtocolError::DevmapInvalid, format!("unknown primitive type '{}'", resolved.type_name)))?;
        if let Some(width) = width_override {
            primitive.width = width;
        }
        components.push(CompositeComponent {
            offset: resolved.offset + offset_adjust,
            primitive,
        });
    }

    if let Some(declared) = entry.get("component-count").and_then(Value::as_i64) {
        if declared as usize != components.len() {
            return Err(new_error(
                ProtocolError::DevmapInvalid,
                format!("composite control '{name}' declared {declared} components but found {}", components.len()),
            ));
        }
    }

    Ok(Some(ControlRecord {
        name,
        interface: interface_of(entry),
        category: Category::Data,
        kind: ControlKind::Composite { components },
        primitive: PrimitiveType::UINT32,
        offset: 0,
        array_index: 0,
        read_only: true,
        notify_device: None,
        notify_client: None,
        value: 0,
        bytes_value: Vec::new(),
        linked_index: None,
    }))
}

/// Names destinations beginning with "PCM" or "Mixer" get a Capture-facing
/// enum label; everything else is Playback-facing.
fn router_elem_suffix(label: &str) -> &'static str {
    if label.starts_with("PCM") || label.starts_with("Mixer") {
        "Capture Enum"
    } else {
        "Playback Enum"
    }
}

/// Finds the slot in `table` whose destination pin (low 12 bits) is
/// `dest_pin`, per §4.3 "search table 0 for the slot holding that
/// destination pin" (applied to whichever rate table is passed in).
fn find_slot_for_dest(table: &[u32], dest_pin: u16) -> i32 {
    table
        .iter()
        .position(|&word| (word & 0xFFF) as u16 == dest_pin)
        .map(|i| i as i32)
        .unwrap_or(-1)
}

/// Builds every synthesized control from the device map and product map,
/// per `spec.md` §4.3.
pub fn synthesize<T: Transport>(
    transport: &FcpTransport<T>,
    devmap: &DeviceMap,
    product: &ProductMap,
    mix_counts: (u8, u8),
    mux_sizes: [u16; 3],
) -> Result<(ControlRegistry, crate::cache::mixer::MixerCache, crate::cache::router::RouterCache), Error> {
    let mut registry = ControlRegistry::new();

    for entry in product.global_controls() {
        if entry.get("components").is_some() {
            if let Some(control) = synthesize_composite(devmap, entry)? {
                registry.insert(control).map_err(|d| new_error(ProtocolError::DevmapInvalid, format!("duplicate control '{}'", d.0)))?;
            }
        } else if let Some(control) = synthesize_named(devmap, entry)? {
            registry.insert(control).map_err(|d| new_error(ProtocolError::DevmapInvalid, format!("duplicate control '{}'", d.0)))?;
        }
    }

    if let Some(links) = product.root().get("output-link").and_then(Value::as_array) {
        let indices: Vec<i64> = links.iter().filter_map(Value::as_i64).collect();
        for pair in indices.chunks(2) {
            if let [a, b] = pair {
                let name_a = format!("Line Out {a} Playback Volume");
                let name_b = format!("Line Out {b} Playback Volume");
                let idx_a = registry.find(Interface::Card, &name_a);
                let idx_b = registry.find(Interface::Card, &name_b);
                if let (Some(ia), Some(ib)) = (idx_a, idx_b) {
                    registry.get_mut(ia).unwrap().linked_index = Some(ib);
                    registry.get_mut(ib).unwrap().linked_index = Some(ia);
                }
            }
        }
    }

    let (out_count, in_count) = (mix_counts.0 as usize, mix_counts.1 as usize);
    for out in 0..out_count {
        for inp in 0..in_count {
            let name = format!("Mix A Input {:02} Playback Volume", inp + 1);
            let control = ControlRecord {
                name,
                interface: Interface::Mixer,
                category: Category::Mix,
                kind: ControlKind::Integer {
                    min: 0,
                    max: synth_mixer_max(),
                    step: 1,
                    tlv: Some(DbRangeTlv {
                        min_centidb: MIXER_MIN_DB * 100,
                        max_centidb: MIXER_MAX_DB * 100,
                    }),
                },
                primitive: PrimitiveType::UINT16,
                offset: out as i64,
                array_index: inp as i64,
                read_only: false,
                notify_device: None,
                notify_client: None,
                value: 0,
                bytes_value: Vec::new(),
                linked_index: None,
            };
            let _ = registry.insert(control);
        }
    }

    let mixer_cache = crate::cache::mixer::MixerCache::new(out_count, in_count);

    let mut router_cache = crate::cache::router::RouterCache::new([
        mux_sizes[0] as usize,
        mux_sizes[1] as usize,
        mux_sizes[2] as usize,
    ]);
    router_cache.inputs.push(crate::cache::router::RouterInput {
        label: "Off".to_string(),
        pin: 0,
    });
    let mut mux_tables: [Vec<u32>; 3] = [Vec::new(), Vec::new(), Vec::new()];
    for (rate, size) in mux_sizes.iter().enumerate() {
        if *size > 0 {
            mux_tables[rate] = transport.mux_read(rate as u8, *size as u8)?;
        }
    }

    for source in product.sources() {
        if let (Some(label), Some(pin)) = (str_field(source, "name"), source.get("router-pin").and_then(Value::as_u64)) {
            router_cache.inputs.push(crate::cache::router::RouterInput {
                label: label.to_string(),
                pin: pin as u16,
            });
        }
    }

    for sink in product.sinks() {
        let label = match str_field(sink, "name") {
            Some(l) => l,
            None => continue,
        };
        let dest_pin = sink.get("router-pin").and_then(Value::as_u64).unwrap_or(0) as u16;

        if let Some(static_source) = str_field(sink, "static-source") {
            let fixed_index = router_cache
                .inputs
                .iter()
                .position(|i| i.label == static_source)
                .unwrap_or(0);
            router_cache.outputs.push(crate::cache::router::RouterOutput {
                pin: dest_pin,
                fixed_input: Some(fixed_index),
                slots: [-1, -1, -1],
            });
            let name = format!("{} {}", label, router_elem_suffix(label));
            let labels: Vec<String> = router_cache.inputs.iter().map(|i| i.label.clone()).collect();
            let control = ControlRecord {
                name,
                interface: Interface::Card,
                category: Category::Mux,
                kind: ControlKind::Enumerated { labels, mapping: EnumMapping::Direct },
                primitive: PrimitiveType::UINT32,
                offset: 0,
                array_index: (router_cache.outputs.len() - 1) as i64,
                read_only: true,
                notify_device: None,
                notify_client: None,
                value: fixed_index as i64,
                bytes_value: Vec::new(),
                linked_index: None,
            };
            let _ = registry.insert(control);
            continue;
        }

        let slots = [
            find_slot_for_dest(&mux_tables[0], dest_pin),
            find_slot_for_dest(&mux_tables[1], dest_pin),
            find_slot_for_dest(&mux_tables[2], dest_pin),
        ];
        router_cache.outputs.push(crate::cache::router::RouterOutput {
            pin: dest_pin,
            fixed_input: None,
            slots,
        });
        let name = format!("{} {}", label, router_elem_suffix(label));
        let labels: Vec<String> = router_cache.inputs.iter().map(|i| i.label.clone()).collect();
        let control = ControlRecord {
            name,
            interface: Interface::Card,
            category: Category::Mux,
            kind: ControlKind::Enumerated { labels, mapping: EnumMapping::Direct },
            primitive: PrimitiveType::UINT32,
            offset: 0,
            array_index: (router_cache.outputs.len() - 1) as i64,
            read_only: false,
            notify_device: None,
            notify_client: None,
            value: 0,
            bytes_value: Vec::new(),
            linked_index: None,
        };
        let _ = registry.insert(control);
    }

    let sync_control = ControlRecord {
        name: "Sync Status".to_string(),
        interface: Interface::Card,
        category: Category::Sync,
        kind: ControlKind::Enumerated {
            labels: vec!["Unlocked".to_string(), "Locked".to_string()],
            mapping: EnumMapping::Direct,
        },
        primitive: PrimitiveType::UINT32,
        offset: 0,
        array_index: 0,
        read_only: true,
        notify_device: None,
        notify_client: Some(8),
        value: 0,
        bytes_value: Vec::new(),
        linked_index: None,
    };
    let _ = registry.insert(sync_control);

    router_cache.seed_tables(mux_tables);

    Ok((registry, mixer_cache, router_cache))
}

const fn synth_mixer_max() -> i64 {
    32613
}

/// Central control-record dispatcher: implements [`CtlModel`] and
/// [`NotifyModel`] for the whole registry, replacing the teacher's
/// per-vendor struct composition with one dynamic table.
pub struct Controller {
    pub registry: ControlRegistry,
    elem_ids: Vec<(usize, ElemId)>,
}

impl Controller {
    pub fn new(registry: ControlRegistry) -> Self {
        Self { registry, elem_ids: Vec::new() }
    }

    /// The subset of registered element ids whose `notify_client` mask
    /// intersects `notice`, i.e. exactly what `dispatch_notification` (C6)
    /// must be handed for a given device notification word.
    pub fn elem_ids_for_notification(&self, notice: u32) -> Vec<ElemId> {
        let matched = self.registry.matching_notification(notice as i64);
        self.elem_ids
            .iter()
            .filter(|(index, _)| matched.contains(index))
            .map(|(_, id)| id.clone())
            .collect()
    }

    fn record_for(&self, elem_id: &ElemId) -> Option<usize> {
        let iface = match elem_id.iface() {
            ElemIfaceType::Mixer => Interface::Mixer,
            _ => Interface::Card,
        };
        self.registry.find(iface, elem_id.name().as_str())
    }

    fn read_from_device<T: Transport>(&mut self, device: &mut Device<T>, index: usize) -> Result<Vec<i64>, Error> {
        let control = self.registry.get(index).unwrap();
        match &control.kind {
            ControlKind::Boolean => Ok(vec![device.transport.data_read(control.offset as u32, control.primitive.width, control.primitive.is_signed)?]),
            ControlKind::Integer { .. } if control.category == Category::Mix => {
                let row = control.offset as usize;
                let col = control.array_index as usize;
                let value = device.mixer_cache.read(&device.transport, row, col)?;
                Ok(vec![value as i64])
            }
            ControlKind::Integer { .. } => Ok(vec![device.transport.data_read(control.offset as u32, control.primitive.width, control.primitive.is_signed)?]),
            ControlKind::Enumerated { mapping, .. } => {
                if control.category == Category::Mux {
                    let array_index = control.array_index as usize;
                    let selected = device.router_cache.read_output(&device.transport, array_index)?;
                    Ok(vec![selected as i64])
                } else if control.category == Category::Sync {
                    Ok(vec![device.transport.sync_read()? as i64])
                } else {
                    let raw = device.transport.data_read(control.offset as u32, control.primitive.width, control.primitive.is_signed)?;
                    match mapping {
                        EnumMapping::Direct => Ok(vec![raw]),
                        EnumMapping::Indexed(table) => table
                            .iter()
                            .position(|v| *v == raw)
                            .map(|i| vec![i as i64])
                            .ok_or_else(|| new_error(ProtocolError::DevmapInvalid, "unknown device enum value on read")),
                    }
                }
            }
            ControlKind::Bytes { size } => {
                let bytes = device.transport.data_read_buf(control.offset as u32, *size)?;
                Ok(bytes.into_iter().map(i64::from).collect())
            }
            ControlKind::BitmapBit { bit } => {
                let raw = device.transport.data_read(control.offset as u32, control.primitive.width, false)?;
                Ok(vec![(raw >> bit) & 1])
            }
            ControlKind::Composite { components } => {
                let mut out = Vec::with_capacity(components.len());
                for c in components {
                    out.push(device.transport.data_read(c.offset as u32, c.primitive.width, c.primitive.is_signed)?);
                }
                Ok(out)
            }
        }
    }

    fn write_to_device<T: Transport>(&mut self, device: &mut Device<T>, index: usize, values: &[i64]) -> Result<(), Error> {
        let control = self.registry.get(index).unwrap().clone();
        match &control.kind {
            ControlKind::Integer { .. } if control.category == Category::Mix => {
                let row = control.offset as usize;
                let col = control.array_index as usize;
                device.mixer_cache.write(&device.transport, row, col, values[0] as u16)?;
            }
            ControlKind::Boolean | ControlKind::Integer { .. } => {
                device.transport.data_write(control.offset as u32, control.primitive.width, values[0])?;
            }
            ControlKind::Enumerated { mapping, .. } => {
                if control.category == Category::Mux {
                    let array_index = control.array_index as usize;
                    device.router_cache.write_output(&device.transport, array_index, values[0] as usize)?;
                } else {
                    let raw = match mapping {
                        EnumMapping::Direct => values[0],
                        EnumMapping::Indexed(table) => *table.get(values[0] as usize).ok_or_else(|| {
                            new_error(ProtocolError::DevmapInvalid, "enum index out of range on write")
                        })?,
                    };
                    device.transport.data_write(control.offset as u32, control.primitive.width, raw)?;
                }
            }
            ControlKind::Bytes { .. } => {
                let bytes: Vec<u8> = values.iter().map(|v| *v as u8).collect();
                device.transport.data_write_buf(control.offset as u32, &bytes)?;
            }
            ControlKind::BitmapBit { bit } => {
                let raw = device.transport.data_read(control.offset as u32, control.primitive.width, false)?;
                let mask = 1i64 << bit;
                let new_raw = if values[0] != 0 { raw | mask } else { raw & !mask };
                device.transport.data_write(control.offset as u32, control.primitive.width, new_raw)?;
            }
            ControlKind::Composite { .. } => {
                return Err(new_error(ProtocolError::DevmapInvalid, "composite controls are read-only"));
            }
        }

        if let Some(notify) = control.notify_device {
            device.transport.data_notify(notify as u32)?;
        }

        if let Some(linked) = control.linked_index {
            if matches!(control.kind, ControlKind::Integer { .. }) {
                let linked_control = self.registry.get(linked).unwrap().clone();
                device.transport.data_write(linked_control.offset as u32, linked_control.primitive.width, values[0])?;
                if let Some(notify) = linked_control.notify_device {
                    device.transport.data_notify(notify as u32)?;
                }
            }
        }

        Ok(())
    }

    fn set_elem_value(info_width: usize, elem_value: &ElemValue, values: &[i64], kind: &ControlKind) {
        match kind {
            ControlKind::Boolean => elem_value.set_bool(&values.iter().map(|v| *v != 0).collect::<Vec<_>>()),
            ControlKind::Enumerated { .. } => elem_value.set_enum(&values.iter().map(|v| *v as u32).collect::<Vec<_>>()),
            ControlKind::Bytes { .. } => elem_value.set_bytes(&values.iter().map(|v| *v as u8).collect::<Vec<_>>()),
            _ => {
                let _ = info_width;
                elem_value.set_int(&values.iter().map(|v| *v as i32).collect::<Vec<_>>())
            }
        }
    }

    fn get_elem_value(elem_value: &ElemValue, count: usize, kind: &ControlKind) -> Vec<i64> {
        match kind {
            ControlKind::Boolean => elem_value.boolean()[..count].iter().map(|v| *v as i64).collect(),
            ControlKind::Enumerated { .. } => elem_value.enumerated()[..count].iter().map(|v| *v as i64).collect(),
            ControlKind::Bytes { .. } => elem_value.bytes()[..count].iter().map(|v| *v as i64).collect(),
            _ => elem_value.int()[..count].iter().map(|v| *v as i64).collect(),
        }
    }
}

impl<T: Transport> CtlModel<Device<T>> for Controller {
    fn cache(&mut self, _device: &mut Device<T>) -> Result<(), Error> {
        Ok(())
    }

    fn load(&mut self, card_cntr: &mut CardCntr) -> Result<(), Error> {
        for (index, control) in self.registry.iter().enumerate() {
            let iface = match control.interface {
                Interface::Mixer => ElemIfaceType::Mixer,
                Interface::Card => ElemIfaceType::Card,
            };
            let elem_id = ElemId::new_by_name(iface, 0, 0, &control.name, 0);
            let count = control.component_count();

            let ids = match &control.kind {
                ControlKind::Boolean | ControlKind::BitmapBit { .. } => {
                    card_cntr.add_bool_elems(&elem_id, 1, 1, false)?
                }
                ControlKind::Integer { min, max, step, tlv } => {
                    let raw_tlv = tlv.map(|t| {
                        Vec::<u32>::from(DbInterval {
                            min: t.min_centidb,
                            max: t.max_centidb,
                            linear: false,
                            mute_avail: false,
                        })
                    });
                    card_cntr.add_int_elems(&elem_id, 1, *min as i32, *max as i32, *step as i32, count, raw_tlv.as_deref(), false)?
                }
                ControlKind::Enumerated { labels, .. } => {
                    card_cntr.add_enum_elems(&elem_id, 1, 1, labels, None, false)?
                }
                ControlKind::Bytes { size } => card_cntr.add_bytes_elems(&elem_id, 1, *size, None, false)?,
                ControlKind::Composite { .. } => {
                    card_cntr.add_int_elems(&elem_id, 1, i32::MIN, i32::MAX, 1, count, None, false)?
                }
            };

            if let Some(id) = ids.into_iter().next() {
                self.elem_ids.push((index, id));
            }
        }
        Ok(())
    }

    fn read(&mut self, device: &mut Device<T>, elem_id: &ElemId, elem_value: &mut ElemValue) -> Result<bool, Error> {
        let index = match self.record_for(elem_id) {
            Some(i) => i,
            None => return Ok(false),
        };
        let values = self.read_from_device(device, index)?;
        let control = self.registry.get_mut(index).unwrap();
        control.value = values[0];
        Self::set_elem_value(control.primitive.width, elem_value, &values, &control.kind);
        Ok(true)
    }

    fn write(&mut self, device: &mut Device<T>, elem_id: &ElemId, old: &ElemValue, new: &ElemValue) -> Result<bool, Error> {
        let index = match self.record_for(elem_id) {
            Some(i) => i,
            None => return Ok(false),
        };
        let control = self.registry.get(index).unwrap();
        if control.read_only {
            return Ok(false);
        }
        let count = control.component_count();
        let new_values = Self::get_elem_value(new, count, &control.kind);
        let old_values = Self::get_elem_value(old, count, &control.kind);
        if new_values == old_values {
            return Ok(false);
        }

        self.write_to_device(device, index, &new_values)?;
        self.registry.get_mut(index).unwrap().value = new_values[0];
        Ok(true)
    }
}

impl<T: Transport> NotifyModel<Device<T>, u32> for Controller {
    fn get_notified_elem_list(&mut self, elem_id_list: &mut Vec<ElemId>) {
        for control in self.registry.iter() {
            if control.notify_client.is_some() {
                let iface = match control.interface {
                    Interface::Mixer => ElemIfaceType::Mixer,
                    Interface::Card => ElemIfaceType::Card,
                };
                elem_id_list.push(ElemId::new_by_name(iface, 0, 0, &control.name, 0));
            }
        }
    }

    fn parse_notification(&mut self, _device: &mut Device<T>, _notice: &u32) -> Result<(), Error> {
        // card_cntr's dispatch_notification already restricts the elem_id_list
        // passed in to get_notified_elem_list's output and re-reads each one
        // through CtlModel::read; there is no extra per-notification state to
        // cache here beyond what `registry` already holds.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fcp_protocol::transport::{fake::FakeTransport, FcpTransport, OP_DATA_READ, OP_DATA_WRITE};

    #[test]
    fn find_slot_for_dest_locates_matching_low_bits() {
        let table = [slot(0x010, 0x203), slot(0x011, 0x204), slot(0x012, 0x205)];
        assert_eq!(find_slot_for_dest(&table, 0x011), 1);
    }

    #[test]
    fn find_slot_for_dest_returns_negative_one_when_absent() {
        let table = [slot(0x010, 0x203)];
        assert_eq!(find_slot_for_dest(&table, 0x099), -1);
    }

    fn slot(dest_pin: u16, source_pin: u16) -> u32 {
        (dest_pin as u32 & 0xFFF) | ((source_pin as u32 & 0xFFF) << 12)
    }

    fn test_device(fake: FakeTransport) -> Device<FakeTransport> {
        Device::new(
            FcpTransport::new(fake),
            crate::cache::mixer::MixerCache::new(1, 1),
            crate::cache::router::RouterCache::new([1, 1, 1]),
        )
    }

    fn integer_control(name: &str, offset: i64, notify_device: Option<i64>, notify_client: Option<i64>) -> ControlRecord {
        ControlRecord {
            name: name.to_string(),
            interface: Interface::Card,
            category: Category::Data,
            kind: ControlKind::Integer { min: 0, max: 100, step: 1, tlv: None },
            primitive: PrimitiveType::UINT8,
            offset,
            array_index: 0,
            read_only: false,
            notify_device,
            notify_client,
            value: 0,
            bytes_value: Vec::new(),
            linked_index: None,
        }
    }

    #[test]
    fn read_integer_control_fetches_from_device_and_caches_value() {
        let fake = FakeTransport::default();
        fake.responses.borrow_mut().push_back((OP_DATA_READ, vec![42]));
        let mut device = test_device(fake);

        let mut registry = ControlRegistry::new();
        registry.insert(integer_control("Gain", 4, None, None)).unwrap();
        let mut controller = Controller::new(registry);

        let elem_id = ElemId::new_by_name(ElemIfaceType::Card, 0, 0, "Gain", 0);
        let mut elem_value = ElemValue::new();
        let handled = controller.read(&mut device, &elem_id, &mut elem_value).unwrap();

        assert!(handled);
        assert_eq!(elem_value.int()[0], 42);
        assert_eq!(controller.registry.get(0).unwrap().value, 42);
    }

    #[test]
    fn write_unchanged_value_does_not_touch_device() {
        let fake = FakeTransport::default();
        let mut device = test_device(fake);

        let mut registry = ControlRegistry::new();
        registry.insert(integer_control("Gain", 4, None, None)).unwrap();
        let mut controller = Controller::new(registry);

        let elem_id = ElemId::new_by_name(ElemIfaceType::Card, 0, 0, "Gain", 0);
        let old = ElemValue::new();
        old.set_int(&[7]);
        let new = ElemValue::new();
        new.set_int(&[7]);

        let handled = controller.write(&mut device, &elem_id, &old, &new).unwrap();
        assert!(!handled);
        assert!(device.transport.io().sent.borrow().is_empty());
    }

    #[test]
    fn write_changed_value_notifies_device_and_updates_cache() {
        let fake = FakeTransport::default();
        fake.responses.borrow_mut().push_back((OP_DATA_WRITE, vec![]));
        fake.responses.borrow_mut().push_back((fcp_protocol::transport::OP_DATA_NOTIFY, vec![]));
        let mut device = test_device(fake);

        let mut registry = ControlRegistry::new();
        registry.insert(integer_control("Gain", 4, Some(0x01), None)).unwrap();
        let mut controller = Controller::new(registry);

        let elem_id = ElemId::new_by_name(ElemIfaceType::Card, 0, 0, "Gain", 0);
        let old = ElemValue::new();
        old.set_int(&[7]);
        let new = ElemValue::new();
        new.set_int(&[55]);

        let handled = controller.write(&mut device, &elem_id, &old, &new).unwrap();
        assert!(handled);
        assert_eq!(controller.registry.get(0).unwrap().value, 55);

        let sent = device.transport.io().sent.borrow();
        assert!(sent.iter().any(|(op, _)| *op == OP_DATA_WRITE));
        assert!(sent.iter().any(|(op, _)| *op == fcp_protocol::transport::OP_DATA_NOTIFY));
    }

    #[test]
    fn read_of_unregistered_elem_is_not_handled() {
        let fake = FakeTransport::default();
        let mut device = test_device(fake);
        let mut controller = Controller::new(ControlRegistry::new());

        let elem_id = ElemId::new_by_name(ElemIfaceType::Card, 0, 0, "Nonexistent", 0);
        let mut elem_value = ElemValue::new();
        let handled = controller.read(&mut device, &elem_id, &mut elem_value).unwrap();
        assert!(!handled);
    }

    #[test]
    fn elem_ids_for_notification_filters_by_mask() {
        let mut registry = ControlRegistry::new();
        registry.insert(integer_control("A", 0, None, Some(0x01))).unwrap();
        registry.insert(integer_control("B", 1, None, Some(0x02))).unwrap();
        let mut controller = Controller::new(registry);
        controller.elem_ids.push((0, ElemId::new_by_name(ElemIfaceType::Card, 0, 0, "A", 0)));
        controller.elem_ids.push((1, ElemId::new_by_name(ElemIfaceType::Card, 0, 0, "B", 0)));

        let matched = controller.elem_ids_for_notification(0x02);
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].name().as_str(), "B");
    }
}
