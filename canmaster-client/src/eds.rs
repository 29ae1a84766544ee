//! EDS (Electronic Data Sheet) loading
//!
//! Populates a device's dictionary from the INI-based EDS format. Loading
//! is externally driven - a device never loads EDS files on its own - and
//! all loader behavior is controlled through explicit [`EdsLoadOptions`]
//! rather than ambient configuration.
//!
//! A malformed or partially-overlapping EDS cannot corrupt the dictionary:
//! entries whose name or address already exists are skipped, keeping the
//! dictionary and name index consistent with each other.

use std::collections::HashMap;

use configparser::ini::Ini;
use snafu::Snafu;

use canmaster_common::{DataType, Value};

use crate::device::Device;
use crate::entry::AccessType;

/// Errors raised while loading an EDS file
#[derive(Debug, Snafu)]
pub enum EdsError {
    /// The file could not be read or is not valid INI
    #[snafu(display("Error reading EDS: {message}"))]
    IniFormat {
        /// Parser diagnostics
        message: String,
    },
    /// The INI is readable but violates the EDS structure
    #[snafu(display("Invalid EDS content: {message}"))]
    EdsFormat {
        /// What was wrong
        message: String,
    },
}

/// Explicit switches controlling what the loader does to the dictionary
#[derive(Debug, Clone, Copy, Default)]
pub struct EdsLoadOptions {
    /// Wipe the dictionary before importing
    pub clear_dictionary: bool,
    /// Silently skip objects which already exist instead of warning; used
    /// when layering generic profile names over a manufacturer dictionary
    pub just_add_mappings: bool,
}

/// Load an EDS file into a device's dictionary
///
/// Returns the number of entries added.
pub fn load_eds_file(
    path: &str,
    device: &Device,
    options: EdsLoadOptions,
) -> Result<usize, EdsError> {
    let mut ini = Ini::new();
    let map = ini
        .load(path)
        .map_err(|message| EdsError::IniFormat { message })?;
    import_entries(&map, device, options)
}

/// Load EDS content from a string into a device's dictionary
pub fn load_eds_str(
    content: &str,
    device: &Device,
    options: EdsLoadOptions,
) -> Result<usize, EdsError> {
    let mut ini = Ini::new();
    let map = ini
        .read(content.to_string())
        .map_err(|message| EdsError::IniFormat { message })?;
    import_entries(&map, device, options)
}

type IniMap = HashMap<String, HashMap<String, Option<String>>>;
type IniSection = HashMap<String, Option<String>>;

fn get_string(section: &IniSection, key: &str) -> Option<String> {
    section.get(key)?.clone()
}

/// Read an integer field; EDS files mix decimal and 0x-prefixed hex
fn get_u32(section: &IniSection, key: &str) -> Option<u32> {
    let s = get_string(section, key)?;
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).ok()
    } else {
        s.parse().ok()
    }
}

fn import_entries(
    map: &IniMap,
    device: &Device,
    options: EdsLoadOptions,
) -> Result<usize, EdsError> {
    if options.clear_dictionary {
        device.clear_dictionary();
    }

    let mut added = 0;
    for (section_name, section) in map {
        let Some((index, subindex)) = parse_section_address(section_name) else {
            continue;
        };

        // Array/record parents carry no data themselves
        if let Some(object_type) = get_u32(section, "objecttype") {
            if object_type != 7 {
                continue;
            }
        }

        let Some(parameter_name) = get_string(section, "parametername") else {
            return EdsFormatSnafu {
                message: format!("Object section '{section_name}' has no ParameterName"),
            }
            .fail();
        };
        let data_type = DataType::from(get_u32(section, "datatype").unwrap_or(0) as u16);
        let access_type = get_string(section, "accesstype")
            .map(|s| parse_access_type(&s))
            .transpose()?
            .unwrap_or(AccessType::ReadWrite);

        if device.has_entry_at(index, subindex) || device.has_entry(&parameter_name) {
            if !options.just_add_mappings {
                log::warn!(
                    "EDS object {index:04X}sub{subindex} ('{parameter_name}') collides with an \
                     existing entry, skipping"
                );
            }
            continue;
        }

        if let Err(e) = device.add_entry(index, subindex, &parameter_name, data_type, access_type)
        {
            log::warn!("Cannot import EDS object {index:04X}sub{subindex}: {e}");
            continue;
        }
        added += 1;

        // Seed the cache with the declared default where one is parseable
        if let Some(default) = get_string(section, "defaultvalue") {
            if let Some(value) = parse_typed_value(data_type, &default) {
                device
                    .set_entry(
                        &parameter_name,
                        value,
                        crate::entry::WriteAccessMethod::Pdo,
                    )
                    .ok();
            }
        }
    }
    Ok(added)
}

/// Parse "1000" or "1018sub3" section names; anything else is not an object
fn parse_section_address(section: &str) -> Option<(u16, u8)> {
    let (index_part, sub_part) = match section.split_once("sub") {
        Some((index, sub)) => (index, Some(sub)),
        None => (section, None),
    };
    if index_part.len() != 4 {
        return None;
    }
    let index = u16::from_str_radix(index_part, 16).ok()?;
    let subindex = match sub_part {
        Some(sub) => u8::from_str_radix(sub, 16).ok()?,
        None => 0,
    };
    Some((index, subindex))
}

fn parse_access_type(s: &str) -> Result<AccessType, EdsError> {
    match s.to_lowercase().as_str() {
        "ro" => Ok(AccessType::ReadOnly),
        "wo" => Ok(AccessType::WriteOnly),
        "rw" | "rww" | "rwr" => Ok(AccessType::ReadWrite),
        "const" => Ok(AccessType::Constant),
        other => EdsFormatSnafu {
            message: format!("Invalid AccessType: '{other}'"),
        }
        .fail(),
    }
}

fn parse_typed_value(data_type: DataType, s: &str) -> Option<Value> {
    let s = s.trim();
    // Formulas like "$NODEID+0x600" depend on the node and are not cached
    if s.is_empty() || s.contains('$') {
        return None;
    }
    let parse_u64 = |s: &str| -> Option<u64> {
        if let Some(hex) = s.strip_prefix("0x") {
            u64::from_str_radix(hex, 16).ok()
        } else {
            s.parse().ok()
        }
    };
    let parse_i64 = |s: &str| -> Option<i64> {
        if let Some(hex) = s.strip_prefix("0x") {
            i64::from_str_radix(hex, 16).ok()
        } else {
            s.parse().ok()
        }
    };
    use DataType::*;
    match data_type {
        Boolean => Some(Value::from(parse_u64(s)? != 0)),
        UInt8 => Some(Value::from(u8::try_from(parse_u64(s)?).ok()?)),
        UInt16 => Some(Value::from(u16::try_from(parse_u64(s)?).ok()?)),
        UInt32 => Some(Value::from(u32::try_from(parse_u64(s)?).ok()?)),
        UInt64 => Some(Value::from(parse_u64(s)?)),
        Int8 => Some(Value::from(i8::try_from(parse_i64(s)?).ok()?)),
        Int16 => Some(Value::from(i16::try_from(parse_i64(s)?).ok()?)),
        Int32 => Some(Value::from(i32::try_from(parse_i64(s)?).ok()?)),
        Int64 => Some(Value::from(parse_i64(s)?)),
        Real32 => Some(Value::from(s.parse::<f32>().ok()?)),
        Real64 => Some(Value::from(s.parse::<f64>().ok()?)),
        VisibleString | OctetString => Some(Value::from(s)),
        Invalid => None,
    }
}
