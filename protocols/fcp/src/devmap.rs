// SPDX-License-Identifier: GPL-3.0-or-later

//! Device-map loader (C2): locates, fetches, and exposes the JSON device
//! description and per-product control map as navigable trees.
//!
//! Both documents vary in shape from product to product, so they are kept as
//! [`serde_json::Value`] trees rather than fixed `#[derive(Deserialize)]`
//! structs; [`DeviceMap::resolve_path`] is the one piece of structure the
//! rest of the daemon actually needs: walking a dotted path through
//! `structs.APP_SPACE.members` while accumulating byte offsets and the most
//! recent notification bits seen along the way.

use {
    super::{
        new_error,
        transport::{FcpTransport, Transport},
        ProtocolError,
    },
    glib::Error,
    serde_json::Value,
    std::{
        io::Read,
        path::{Path, PathBuf},
    },
};

const APP_SPACE: &str = "APP_SPACE";

/// A resolved leaf of a dotted device-map path.
#[derive(Debug, Clone, Default)]
pub struct ResolvedPath {
    pub offset: i64,
    pub type_name: String,
    pub size: Option<i64>,
    pub array_shape: Option<Vec<i64>>,
    pub notify_device: Option<i64>,
    pub notify_client: Option<i64>,
}

/// The JSON device-description document (`devmap-<pid>.json`).
#[derive(Debug, Clone)]
pub struct DeviceMap {
    root: Value,
}

/// The per-product control map naming which device-map members become which
/// controls.
#[derive(Debug, Clone)]
pub struct ProductMap {
    root: Value,
}

fn search_paths(file_name: &str, override_dir: Option<&str>) -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Some(dir) = override_dir {
        paths.push(Path::new(dir).join(file_name));
    }
    paths.push(Path::new(".").join(file_name));
    paths.push(Path::new("/usr/share/fcp").join(file_name));
    paths
}

fn read_first_existing(paths: &[PathBuf]) -> Option<Value> {
    paths.iter().find_map(|path| {
        std::fs::read_to_string(path)
            .ok()
            .and_then(|text| serde_json::from_str(&text).ok())
    })
}

impl DeviceMap {
    pub fn from_json(root: Value) -> Self {
        Self { root }
    }

    /// Searches `$FCP_SERVER_DATA_DIR`, the current directory, then the system data
    /// directory for `devmap-<pid>.json`.
    pub fn load(pid: u16, override_dir: Option<&str>) -> Option<Self> {
        let name = format!("devmap-{pid:04x}.json");
        read_first_existing(&search_paths(&name, override_dir)).map(Self::from_json)
    }

    /// Fetches the device map directly from the hardware: `devmap-info` for the
    /// total size, `devmap-read` in 1024-byte blocks, base64-decodes the
    /// concatenation, inflates the deflate stream, and parses the result as JSON.
    pub fn fetch_from_device<T: Transport>(transport: &FcpTransport<T>) -> Result<Self, Error> {
        use base64::Engine;

        let total_size = transport.devmap_info()? as usize;
        let encoded = transport.devmap_read_all(total_size)?;
        let encoded_str = std::str::from_utf8(&encoded).map_err(|_| {
            new_error(ProtocolError::DevmapInvalid, "device map is not valid UTF-8")
        })?;
        let compressed = base64::engine::general_purpose::STANDARD
            .decode(encoded_str.trim_end_matches('\0'))
            .map_err(|e| new_error(ProtocolError::DevmapInvalid, format!("base64: {e}")))?;

        let mut inflated = Vec::with_capacity(compressed.len() * 16);
        flate2::read::DeflateDecoder::new(&compressed[..])
            .read_to_end(&mut inflated)
            .map_err(|e| new_error(ProtocolError::DevmapInvalid, format!("inflate: {e}")))?;

        if let Ok(path) = std::env::var("TMPDIR").or_else(|_| Ok::<_, std::env::VarError>("/tmp".to_string())) {
            let _ = std::fs::write(Path::new(&path).join("fcp-devmap-fetched.json"), &inflated);
        }

        let root = serde_json::from_slice(&inflated)
            .map_err(|e| new_error(ProtocolError::DevmapInvalid, format!("json: {e}")))?;
        Ok(Self::from_json(root))
    }

    pub fn root(&self) -> &Value {
        &self.root
    }

    fn struct_member<'a>(&'a self, struct_name: &str, member: &str) -> Option<&'a Value> {
        self.root
            .get("structs")?
            .get(struct_name)?
            .get("members")?
            .get(member)
    }

    /// Looks up `enums.<enum_name>.enumerators.<symbol>`.
    pub fn enumerator(&self, enum_name: &str, symbol: &str) -> Option<i64> {
        self.root
            .get("enums")?
            .get(enum_name)?
            .get("enumerators")?
            .get(symbol)?
            .as_i64()
    }

    /// Returns the whole `enumerators` map of a named enum, e.g. to iterate
    /// `maximum_array_sizes`.
    pub fn enum_table(&self, enum_name: &str) -> Option<&serde_json::Map<String, Value>> {
        self.root
            .get("enums")?
            .get(enum_name)?
            .get("enumerators")?
            .as_object()
    }

    /// Resolves a dotted path (`a.b.c`) starting from `structs.APP_SPACE.members`,
    /// accumulating byte offsets and remembering the last non-null notification
    /// bits seen along the way. When `allow_missing` is set, a missing token yields
    /// `Ok(None)` rather than an error.
    pub fn resolve_path(&self, path: &str, allow_missing: bool) -> Result<Option<ResolvedPath>, Error> {
        let mut struct_name = APP_SPACE.to_string();
        let mut offset = 0i64;
        let mut notify_device = None;
        let mut notify_client = None;
        let tokens: Vec<&str> = path.split('.').collect();

        for (i, token) in tokens.iter().enumerate() {
            let member = match self.struct_member(&struct_name, token) {
                Some(m) => m,
                None => {
                    return if allow_missing {
                        Ok(None)
                    } else {
                        Err(new_error(
                            ProtocolError::DevmapInvalid,
                            format!("device-map path '{path}' has no member '{token}'"),
                        ))
                    }
                }
            };

            let member_offset = member.get("offset").and_then(Value::as_i64).unwrap_or(0);
            offset += member_offset;

            if let Some(v) = member.get("notify-device").and_then(Value::as_i64) {
                notify_device = Some(v);
            }
            if let Some(v) = member.get("notify-client").and_then(Value::as_i64) {
                notify_client = Some(v);
            }

            let type_name = member
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();

            if i + 1 == tokens.len() {
                let size = member.get("size").and_then(Value::as_i64);
                let array_shape = member.get("array-shape").and_then(Value::as_array).map(|arr| {
                    arr.iter().filter_map(Value::as_i64).collect()
                });
                return Ok(Some(ResolvedPath {
                    offset,
                    type_name,
                    size,
                    array_shape,
                    notify_device,
                    notify_client,
                }));
            }

            struct_name = type_name;
        }

        Ok(None)
    }
}

impl ProductMap {
    pub fn from_json(root: Value) -> Self {
        Self { root }
    }

    /// Searches `$FCP_SERVER_DATA_DIR`, the current directory, then the system data
    /// directory for `family-<pid>.json`.
    pub fn load(pid: u16, override_dir: Option<&str>) -> Option<Self> {
        let name = format!("family-{pid:04x}.json");
        read_first_existing(&search_paths(&name, override_dir)).map(Self::from_json)
    }

    pub fn root(&self) -> &Value {
        &self.root
    }

    pub fn array(&self, key: &str) -> &[Value] {
        self.root.get(key).and_then(Value::as_array).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn global_controls(&self) -> &[Value] {
        self.array("global-controls")
    }

    pub fn output_group_sources(&self) -> &[Value] {
        self.array("output-group-sources")
    }

    pub fn sources(&self) -> &[Value] {
        self.array("sources")
    }

    pub fn sinks(&self) -> &[Value] {
        self.array("sinks")
    }
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
                        "mixer": { "type": "mixer_t", "offset": 0x100 }
                    }
                },
                "mixer_t": {
                    "members": {
                        "coeff": { "type": "uint16", "offset": 0, "notify-client": 6 }
                    }
                }
            },
            "enums": {
                "eSuperState": { "enumerators": { "off": 0, "dfu": 1, "normal": 2 } }
            }
        }))
    }

    #[test]
    fn resolve_path_accumulates_offset_and_notify() {
        let map = sample_map();
        let resolved = map.resolve_path("mixer.coeff", false).unwrap().unwrap();
        assert_eq!(resolved.offset, 0x100);
        assert_eq!(resolved.type_name, "uint16");
        assert_eq!(resolved.notify_client, Some(6));
    }

    #[test]
    fn resolve_path_missing_token_without_allow_missing_is_error() {
        let map = sample_map();
        assert!(map.resolve_path("nope.coeff", false).is_err());
    }

    #[test]
    fn resolve_path_missing_token_with_allow_missing_is_none() {
        let map = sample_map();
        assert!(map.resolve_path("nope.coeff", true).unwrap().is_none());
    }

    #[test]
    fn enumerator_lookup() {
        let map = sample_map();
        assert_eq!(map.enumerator("eSuperState", "dfu"), Some(1));
        assert_eq!(map.enumerator("eSuperState", "missing"), None);
    }
}
