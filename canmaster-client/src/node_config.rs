//! Declarative node configuration
//!
//! A TOML file describing PDO setups and object values to be written to a
//! slave. Applying a configuration drives the remote PDO reconfiguration
//! flow and plain SDO downloads, so a node can be brought into a known
//! state without any imperative code.

use std::collections::HashMap;
use std::path::Path;

use serde::{de, Deserialize, Deserializer};
use snafu::{ResultExt, Snafu};

use canmaster_common::Value;

use crate::device::{Device, RpdoNo, TpdoNo};
use crate::error::{CanOpenError, CanopenSnafu};

/// Error returned when loading node configuration files
#[derive(Debug, Snafu)]
pub enum ConfigError {
    /// Reading the file failed
    #[snafu(display("IO error loading {path}: {source:?}"))]
    Io {
        /// The offending path
        path: String,
        /// Underlying error
        source: std::io::Error,
    },
    /// The file is not valid TOML or violates the schema
    #[snafu(display("Error parsing TOML: {source}"))]
    TomlDeserialization {
        /// Underlying error
        source: toml::de::Error,
    },
}

/// A runtime configuration which can be applied to a node
///
/// Describes PDO configurations and arbitrary object values to store.
#[derive(Debug, Clone)]
pub struct NodeConfig(NodeConfigSerializer);

impl NodeConfig {
    /// Read a configuration from a file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<NodeConfig, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).context(IoSnafu {
            path: path.to_string_lossy(),
        })?;
        Self::load_from_str(&content)
    }

    /// Read a configuration from a string
    pub fn load_from_str(s: &str) -> Result<NodeConfig, ConfigError> {
        let raw: NodeConfigSerializer = toml::from_str(s).context(TomlDeserializationSnafu)?;
        Ok(NodeConfig(raw))
    }

    /// The transmit PDO configurations, keyed by zero-based PDO number
    pub fn tpdos(&self) -> &HashMap<usize, PdoConfig> {
        &self.0.tpdo
    }

    /// The receive PDO configurations, keyed by zero-based PDO number
    pub fn rpdos(&self) -> &HashMap<usize, PdoConfig> {
        &self.0.rpdo
    }

    /// The object values to be written during configuration
    pub fn stores(&self) -> &[Store] {
        &self.0.store
    }

    /// Write this configuration into the slave behind `device` via SDO
    ///
    /// Applies every TPDO and RPDO configuration through the remote PDO
    /// reconfiguration flow, then downloads the stores. Any SDO failure
    /// aborts the remainder.
    pub fn apply(&self, device: &Device) -> Result<(), CanOpenError> {
        for (n, config) in &self.0.tpdo {
            let tpdo = TpdoNo::from_number(*n).ok_or_else(|| {
                CanopenSnafu {
                    message: format!("Invalid TPDO number {n}"),
                }
                .build()
            })?;
            device.map_tpdo_in_device(
                tpdo,
                &config.packed_mappings(),
                config.transmission_type,
                config.inhibit_time,
                config.event_timer,
            )?;
        }
        for (n, config) in &self.0.rpdo {
            let rpdo = RpdoNo::from_number(*n).ok_or_else(|| {
                CanopenSnafu {
                    message: format!("Invalid RPDO number {n}"),
                }
                .build()
            })?;
            device.map_rpdo_in_device(
                rpdo,
                &config.packed_mappings(),
                config.transmission_type,
                config.inhibit_time,
            )?;
        }
        for store in &self.0.store {
            device.set_entry_via_sdo(store.index, store.sub, &store.value)?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct NodeConfigSerializer {
    #[serde(deserialize_with = "deserialize_pdo_map", default)]
    pub tpdo: HashMap<usize, PdoConfig>,
    #[serde(deserialize_with = "deserialize_pdo_map", default)]
    pub rpdo: HashMap<usize, PdoConfig>,
    #[serde(default, deserialize_with = "deserialize_store")]
    pub store: Vec<Store>,
}

/// Configuration parameters for a single PDO
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PdoConfig {
    /// List of sub-objects mapped into this PDO
    pub mappings: Vec<PdoMappingEntry>,
    /// When the PDO is sent (CiA 301 transmission type byte)
    pub transmission_type: u8,
    /// Minimum time between transmissions, in multiples of 100us
    #[serde(default)]
    pub inhibit_time: Option<u16>,
    /// Event timer in milliseconds (TPDO only)
    #[serde(default)]
    pub event_timer: Option<u16>,
}

impl PdoConfig {
    /// The mappings as packed 32-bit mapping parameter records
    pub fn packed_mappings(&self) -> Vec<u32> {
        self.mappings.iter().map(PdoMappingEntry::packed).collect()
    }
}

/// One sub-object mapped into a PDO
#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PdoMappingEntry {
    /// The object index
    pub index: u16,
    /// The object subindex
    pub sub: u8,
    /// The size of the mapped object, in **bits**
    pub size: u8,
}

impl PdoMappingEntry {
    /// The packed mapping parameter record: index << 16 | sub << 8 | bits
    pub fn packed(&self) -> u32 {
        ((self.index as u32) << 16) | ((self.sub as u32) << 8) | self.size as u32
    }
}

/// A value to be written to a specific sub-object during configuration
#[derive(Clone, Debug, PartialEq)]
pub struct Store {
    /// Index of the object to be written
    pub index: u16,
    /// Subindex to be written
    pub sub: u8,
    /// The typed value to write
    pub value: Value,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
enum StoreType {
    U32,
    U16,
    U8,
    I32,
    I16,
    I8,
    F32,
    String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct StoreSerializer {
    pub index: u16,
    pub sub: u8,
    pub value: toml::Value,
    #[serde(rename = "type")]
    pub ty: StoreType,
}

fn store_int<'de, D, T>(value: &toml::Value) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: TryFrom<i64>,
{
    let value = value.as_integer().ok_or(de::Error::invalid_type(
        de::Unexpected::Str(&value.to_string()),
        &"an integer",
    ))?;
    T::try_from(value).map_err(|_| {
        de::Error::invalid_value(
            de::Unexpected::Signed(value),
            &"an integer in the target type's range",
        )
    })
}

fn deserialize_store<'de, D>(deserializer: D) -> Result<Vec<Store>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw_store = Vec::<StoreSerializer>::deserialize(deserializer)?;

    raw_store
        .into_iter()
        .map(|raw| {
            let value = match raw.ty {
                StoreType::U32 => Value::from(store_int::<D, u32>(&raw.value)?),
                StoreType::U16 => Value::from(store_int::<D, u16>(&raw.value)?),
                StoreType::U8 => Value::from(store_int::<D, u8>(&raw.value)?),
                StoreType::I32 => Value::from(store_int::<D, i32>(&raw.value)?),
                StoreType::I16 => Value::from(store_int::<D, i16>(&raw.value)?),
                StoreType::I8 => Value::from(store_int::<D, i8>(&raw.value)?),
                StoreType::F32 => {
                    let value = raw.value.as_float().ok_or(de::Error::invalid_type(
                        de::Unexpected::Str(&raw.value.to_string()),
                        &"a float",
                    ))?;
                    Value::from(value as f32)
                }
                StoreType::String => {
                    let value = raw.value.as_str().ok_or(de::Error::invalid_type(
                        de::Unexpected::Str(&raw.value.to_string()),
                        &"a string",
                    ))?;
                    Value::from(value)
                }
            };
            Ok(Store {
                index: raw.index,
                sub: raw.sub,
                value,
            })
        })
        .collect()
}

fn deserialize_pdo_map<'de, D>(deserializer: D) -> Result<HashMap<usize, PdoConfig>, D::Error>
where
    D: Deserializer<'de>,
{
    let str_map = HashMap::<String, PdoConfig>::deserialize(deserializer)?;
    let original_len = str_map.len();
    let data = str_map
        .into_iter()
        .map(|(str_key, value)| match str_key.parse() {
            Ok(int_key) => Ok((int_key, value)),
            Err(_) => Err(de::Error::invalid_value(
                de::Unexpected::Str(&str_key),
                &"a non-negative integer",
            )),
        })
        .collect::<Result<HashMap<_, _>, _>>()?;
    // multiple strings could parse to the same int, e.g "0" and "00"
    if data.len() < original_len {
        return Err(de::Error::custom("detected duplicate integer key"));
    }
    Ok(data)
}
