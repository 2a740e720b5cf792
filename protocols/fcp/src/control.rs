// SPDX-License-Identifier: GPL-3.0-or-later

//! Control model (C3): the in-memory, append-only collection of synthesized
//! controls and their per-kind metadata.
//!
//! Kind-specific behaviour is modeled as a tagged [`ControlKind`] rather than
//! a pair of function pointers, so that reconciliation and notification
//! dispatch (C6) can match on it centrally instead of calling through opaque
//! read/write callbacks. Linked controls (the output-link volume pairing in
//! C4) refer to each other by index into the registry's stable, append-only
//! vector rather than by pointer, so the registry can be rebuilt freely
//! between test cases.

/// Which audio-control-surface interface a control is exposed on.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Interface {
    Mixer,
    Card,
}

/// Which device subsystem services a control's reads and writes.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Category {
    Data,
    Sync,
    Mix,
    Mux,
}

/// A device-map primitive type: width in bytes plus signedness.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct PrimitiveType {
    pub width: usize,
    pub is_signed: bool,
}

impl PrimitiveType {
    pub const BOOL: Self = Self { width: 1, is_signed: false };
    pub const UINT8: Self = Self { width: 1, is_signed: false };
    pub const INT8: Self = Self { width: 1, is_signed: true };
    pub const UINT16: Self = Self { width: 2, is_signed: false };
    pub const INT16: Self = Self { width: 2, is_signed: true };
    pub const UINT32: Self = Self { width: 4, is_signed: false };

    /// Resolves a device-map primitive type name, accepting `int8` everywhere
    /// per the completeness decision recorded for this implementation (see
    /// the "int8" open question).
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "bool" => Some(Self::BOOL),
            "uint8" => Some(Self::UINT8),
            "int8" => Some(Self::INT8),
            "uint16" => Some(Self::UINT16),
            "int16" => Some(Self::INT16),
            "uint32" => Some(Self::UINT32),
            _ => None,
        }
    }

    pub fn natural_range(&self) -> (i64, i64) {
        match (self.width, self.is_signed) {
            (1, false) => (0, u8::MAX as i64),
            (1, true) => (i8::MIN as i64, i8::MAX as i64),
            (2, false) => (0, u16::MAX as i64),
            (2, true) => (i16::MIN as i64, i16::MAX as i64),
            (4, false) => (0, u32::MAX as i64),
            (4, true) => (i32::MIN as i64, i32::MAX as i64),
            _ => (0, 0),
        }
    }
}

/// A dB-range TLV attached to an integer control, in centidecibels.
#[derive(Debug, Clone, Copy)]
pub struct DbRangeTlv {
    pub min_centidb: i32,
    pub max_centidb: i32,
}

/// How an enumerated control's surface index maps to the device's raw value.
#[derive(Debug, Clone)]
pub enum EnumMapping {
    /// Surface index equals device value.
    Direct,
    /// Surface index `i` maps to `table[i]`; unknown device values on read are
    /// a hard error.
    Indexed(Vec<i64>),
}

/// One component of a composite (multi-field) read-only integer control.
#[derive(Debug, Clone, Copy)]
pub struct CompositeComponent {
    pub offset: i64,
    pub primitive: PrimitiveType,
}

/// Tagged kind-specific state for a synthesized control, replacing the
/// function-pointer pair of the reference implementation with a single
/// enum a central dispatcher can match on.
#[derive(Debug, Clone)]
pub enum ControlKind {
    Boolean,
    Integer {
        min: i64,
        max: i64,
        step: i64,
        tlv: Option<DbRangeTlv>,
    },
    Enumerated {
        labels: Vec<String>,
        mapping: EnumMapping,
    },
    Bytes {
        size: usize,
    },
    /// One boolean bit within a single shared integer cell, addressed by
    /// `array_index`. Used for output-group selection across several outputs.
    BitmapBit {
        bit: u32,
    },
    /// Read-only integer vector assembled from several device-map fields.
    Composite {
        components: Vec<CompositeComponent>,
    },
}

/// A fully synthesized control.
#[derive(Debug, Clone)]
pub struct ControlRecord {
    pub name: String,
    pub interface: Interface,
    pub category: Category,
    pub kind: ControlKind,
    pub primitive: PrimitiveType,
    pub offset: i64,
    pub array_index: i64,
    pub read_only: bool,
    /// Device opcode/bit to send on write (DATA/notify), or the redirected
    /// flash-save bit when the control was declared `save: true`.
    pub notify_device: Option<i64>,
    /// Bitmask the device raises on change that should cause a re-read.
    pub notify_client: Option<i64>,
    /// Cached scalar value(s); for `Bytes` and `Composite` kinds this holds
    /// the first component only and `bytes_value` holds the full vector.
    pub value: i64,
    pub bytes_value: Vec<u8>,
    /// Index, within the owning [`ControlRegistry`], of the paired output for
    /// `output-link` volume controls.
    pub linked_index: Option<usize>,
}

impl ControlRecord {
    pub fn component_count(&self) -> usize {
        match &self.kind {
            ControlKind::Composite { components } => components.len(),
            _ => 1,
        }
    }
}

/// Error returned when a registry insert would violate the
/// one-(interface,name)-per-surface invariant.
#[derive(Debug)]
pub struct DuplicateControl(pub String);

/// Stable-indexed, append-only collection of synthesized controls, keyed by
/// name for lookup and addressed by integer index for linking.
#[derive(Debug, Default)]
pub struct ControlRegistry {
    controls: Vec<ControlRecord>,
    by_name: std::collections::HashMap<(Interface, String), usize>,
}

impl ControlRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a control, returning its stable index. Rejects a duplicate
    /// `(interface, name)` pair.
    pub fn insert(&mut self, control: ControlRecord) -> Result<usize, DuplicateControl> {
        let key = (control.interface, control.name.clone());
        if self.by_name.contains_key(&key) {
            return Err(DuplicateControl(control.name));
        }
        let index = self.controls.len();
        self.by_name.insert(key, index);
        self.controls.push(control);
        Ok(index)
    }

    pub fn get(&self, index: usize) -> Option<&ControlRecord> {
        self.controls.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut ControlRecord> {
        self.controls.get_mut(index)
    }

    pub fn find(&self, interface: Interface, name: &str) -> Option<usize> {
        self.by_name.get(&(interface, name.to_string())).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ControlRecord> {
        self.controls.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ControlRecord> {
        self.controls.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.controls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.controls.is_empty()
    }

    /// Indices of every control whose `notify_client` mask intersects `mask`.
    pub fn matching_notification(&self, mask: i64) -> Vec<usize> {
        self.controls
            .iter()
            .enumerate()
            .filter(|(_, c)| c.notify_client.is_some_and(|bits| bits & mask != 0))
            .map(|(i, _)| i)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(name: &str, notify_client: Option<i64>) -> ControlRecord {
        ControlRecord {
            name: name.to_string(),
            interface: Interface::Mixer,
            category: Category::Data,
            kind: ControlKind::Boolean,
            primitive: PrimitiveType::BOOL,
            offset: 0,
            array_index: 0,
            read_only: false,
            notify_device: None,
            notify_client,
            value: 0,
            bytes_value: Vec::new(),
            linked_index: None,
        }
    }

    #[test]
    fn duplicate_name_rejected() {
        let mut reg = ControlRegistry::new();
        reg.insert(sample("Volume", None)).unwrap();
        assert!(reg.insert(sample("Volume", None)).is_err());
    }

    #[test]
    fn matching_notification_intersects_mask() {
        let mut reg = ControlRegistry::new();
        reg.insert(sample("A", Some(0x4))).unwrap();
        reg.insert(sample("B", Some(0x6))).unwrap();
        reg.insert(sample("C", Some(0x14))).unwrap();
        reg.insert(sample("D", Some(0x8))).unwrap();

        let matched = reg.matching_notification(0x4);
        assert_eq!(matched, vec![0, 1, 2]);
    }

    #[test]
    fn int8_primitive_accepted() {
        assert_eq!(PrimitiveType::from_name("int8"), Some(PrimitiveType::INT8));
    }
}
