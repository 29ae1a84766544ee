//! Typed values for object dictionary entries
//!
//! CANopen object data is transported as raw little-endian bytes. [`Value`]
//! pairs those bytes with a [`DataType`] tag so dictionary entries can be
//! marshalled into PDO frames and converted to native scalars safely.

use snafu::Snafu;

/// CANopen data type codes as used in EDS files and PDO mapping records
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(u16)]
pub enum DataType {
    /// No type assigned yet; the state of an entry before first population
    #[default]
    Invalid = 0,
    /// BOOLEAN
    Boolean = 0x01,
    /// INTEGER8
    Int8 = 0x02,
    /// INTEGER16
    Int16 = 0x03,
    /// INTEGER32
    Int32 = 0x04,
    /// UNSIGNED8
    UInt8 = 0x05,
    /// UNSIGNED16
    UInt16 = 0x06,
    /// UNSIGNED32
    UInt32 = 0x07,
    /// REAL32
    Real32 = 0x08,
    /// VISIBLE_STRING
    VisibleString = 0x09,
    /// OCTET_STRING
    OctetString = 0x0A,
    /// REAL64
    Real64 = 0x11,
    /// INTEGER64
    Int64 = 0x15,
    /// UNSIGNED64
    UInt64 = 0x1B,
}

impl From<u16> for DataType {
    fn from(value: u16) -> Self {
        use DataType::*;
        match value {
            0x01 => Boolean,
            0x02 => Int8,
            0x03 => Int16,
            0x04 => Int32,
            0x05 => UInt8,
            0x06 => UInt16,
            0x07 => UInt32,
            0x08 => Real32,
            0x09 => VisibleString,
            0x0A => OctetString,
            0x11 => Real64,
            0x15 => Int64,
            0x1B => UInt64,
            _ => Invalid,
        }
    }
}

impl DataType {
    /// Byte size of a fixed-size type, or None for strings and Invalid
    pub fn size(&self) -> Option<usize> {
        use DataType::*;
        match self {
            Invalid | VisibleString | OctetString => None,
            Boolean | Int8 | UInt8 => Some(1),
            Int16 | UInt16 => Some(2),
            Int32 | UInt32 | Real32 => Some(4),
            Int64 | UInt64 | Real64 => Some(8),
        }
    }

    /// Returns true if this is one of the variable-length string types
    pub fn is_string(&self) -> bool {
        matches!(self, Self::VisibleString | Self::OctetString)
    }
}

impl core::fmt::Display for DataType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Error constructing a [`Value`] from raw bytes
#[derive(Debug, Clone, PartialEq, Snafu)]
pub enum ValueError {
    /// The byte slice length does not match the declared fixed-size type
    #[snafu(display("{data_type} requires {expected} bytes, got {got}"))]
    WrongSize {
        /// The declared type
        data_type: DataType,
        /// Required length
        expected: usize,
        /// Provided length
        got: usize,
    },
    /// The target scalar type does not match the value's tag
    #[snafu(display("Cannot read {data_type} value as {requested}"))]
    TypeMismatch {
        /// The value's tag
        data_type: DataType,
        /// The requested native type
        requested: &'static str,
    },
}

/// A typed value: a [`DataType`] tag plus its canonical little-endian bytes
///
/// Equality is by (type, bytes).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Value {
    data_type: DataType,
    bytes: Vec<u8>,
}

impl Value {
    /// The invalid value, used for entries which have never been populated
    pub fn invalid() -> Self {
        Self::default()
    }

    /// Construct from raw wire bytes
    ///
    /// Fails with [`ValueError::WrongSize`] when the slice length does not
    /// match the fixed size of `data_type`. String types accept any length.
    pub fn from_bytes(data_type: DataType, bytes: &[u8]) -> Result<Self, ValueError> {
        if let Some(expected) = data_type.size() {
            if bytes.len() != expected {
                return WrongSizeSnafu {
                    data_type,
                    expected,
                    got: bytes.len(),
                }
                .fail();
            }
        }
        Ok(Self {
            data_type,
            bytes: bytes.to_vec(),
        })
    }

    /// The type tag
    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    /// The canonical little-endian encoding
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Returns true if this value carries the invalid tag
    pub fn is_invalid(&self) -> bool {
        self.data_type == DataType::Invalid
    }

    fn fixed<const N: usize>(&self, requested: &'static str) -> Result<[u8; N], ValueError> {
        self.bytes
            .as_slice()
            .try_into()
            .map_err(|_| ValueError::TypeMismatch {
                data_type: self.data_type,
                requested,
            })
    }

    /// Read as bool; valid for Boolean values only
    pub fn as_bool(&self) -> Result<bool, ValueError> {
        match self.data_type {
            DataType::Boolean => Ok(self.bytes[0] != 0),
            _ => TypeMismatchSnafu {
                data_type: self.data_type,
                requested: "bool",
            }
            .fail(),
        }
    }

    /// Read as i8
    pub fn as_i8(&self) -> Result<i8, ValueError> {
        Ok(i8::from_le_bytes(self.fixed("i8")?))
    }

    /// Read as u8
    pub fn as_u8(&self) -> Result<u8, ValueError> {
        Ok(u8::from_le_bytes(self.fixed("u8")?))
    }

    /// Read as i16
    pub fn as_i16(&self) -> Result<i16, ValueError> {
        Ok(i16::from_le_bytes(self.fixed("i16")?))
    }

    /// Read as u16
    pub fn as_u16(&self) -> Result<u16, ValueError> {
        Ok(u16::from_le_bytes(self.fixed("u16")?))
    }

    /// Read as i32
    pub fn as_i32(&self) -> Result<i32, ValueError> {
        Ok(i32::from_le_bytes(self.fixed("i32")?))
    }

    /// Read as u32
    pub fn as_u32(&self) -> Result<u32, ValueError> {
        Ok(u32::from_le_bytes(self.fixed("u32")?))
    }

    /// Read as i64
    pub fn as_i64(&self) -> Result<i64, ValueError> {
        Ok(i64::from_le_bytes(self.fixed("i64")?))
    }

    /// Read as u64
    pub fn as_u64(&self) -> Result<u64, ValueError> {
        Ok(u64::from_le_bytes(self.fixed("u64")?))
    }

    /// Read as f32
    pub fn as_f32(&self) -> Result<f32, ValueError> {
        Ok(f32::from_le_bytes(self.fixed("f32")?))
    }

    /// Read as f64
    pub fn as_f64(&self) -> Result<f64, ValueError> {
        Ok(f64::from_le_bytes(self.fixed("f64")?))
    }

    /// Read as a string; valid for the string types only
    pub fn as_string(&self) -> Result<String, ValueError> {
        if !self.data_type.is_string() {
            return TypeMismatchSnafu {
                data_type: self.data_type,
                requested: "string",
            }
            .fail();
        }
        Ok(String::from_utf8_lossy(&self.bytes).into_owned())
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self {
            data_type: DataType::Boolean,
            bytes: vec![v as u8],
        }
    }
}

macro_rules! impl_scalar_value {
    ($native:ty, $tag:expr) => {
        impl From<$native> for Value {
            fn from(v: $native) -> Self {
                Self {
                    data_type: $tag,
                    bytes: v.to_le_bytes().to_vec(),
                }
            }
        }
    };
}

impl_scalar_value!(i8, DataType::Int8);
impl_scalar_value!(i16, DataType::Int16);
impl_scalar_value!(i32, DataType::Int32);
impl_scalar_value!(i64, DataType::Int64);
impl_scalar_value!(u8, DataType::UInt8);
impl_scalar_value!(u16, DataType::UInt16);
impl_scalar_value!(u32, DataType::UInt32);
impl_scalar_value!(u64, DataType::UInt64);
impl_scalar_value!(f32, DataType::Real32);
impl_scalar_value!(f64, DataType::Real64);

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self {
            data_type: DataType::VisibleString,
            bytes: v.as_bytes().to_vec(),
        }
    }
}

impl core::fmt::Display for Value {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        use DataType::*;
        match self.data_type {
            Invalid => write!(f, "<invalid>"),
            Boolean => write!(f, "{}", self.bytes[0] != 0),
            Int8 => write!(f, "{}", self.as_i8().unwrap()),
            Int16 => write!(f, "{}", self.as_i16().unwrap()),
            Int32 => write!(f, "{}", self.as_i32().unwrap()),
            Int64 => write!(f, "{}", self.as_i64().unwrap()),
            UInt8 => write!(f, "{}", self.as_u8().unwrap()),
            UInt16 => write!(f, "{}", self.as_u16().unwrap()),
            UInt32 => write!(f, "{}", self.as_u32().unwrap()),
            UInt64 => write!(f, "{}", self.as_u64().unwrap()),
            Real32 => write!(f, "{}", self.as_f32().unwrap()),
            Real64 => write!(f, "{}", self.as_f64().unwrap()),
            VisibleString | OctetString => {
                write!(f, "{}", String::from_utf8_lossy(&self.bytes))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_round_trip_for_every_fixed_type() {
        let cases = [
            (DataType::Boolean, vec![0x01]),
            (DataType::Int8, vec![0xFE]),
            (DataType::Int16, vec![0x34, 0x12]),
            (DataType::Int32, vec![0x78, 0x56, 0x34, 0x12]),
            (DataType::Int64, vec![1, 2, 3, 4, 5, 6, 7, 8]),
            (DataType::UInt8, vec![0xAB]),
            (DataType::UInt16, vec![0xCD, 0xAB]),
            (DataType::UInt32, vec![0x92, 0x01, 0x02, 0x00]),
            (DataType::UInt64, vec![8, 7, 6, 5, 4, 3, 2, 1]),
            (DataType::Real32, 1.5f32.to_le_bytes().to_vec()),
            (DataType::Real64, 2.25f64.to_le_bytes().to_vec()),
        ];
        for (data_type, bytes) in cases {
            let value = Value::from_bytes(data_type, &bytes).unwrap();
            assert_eq!(bytes.as_slice(), value.bytes(), "{data_type}");
        }
    }

    #[test]
    fn scalar_round_trip() {
        assert_eq!(-1234i16, Value::from(-1234i16).as_i16().unwrap());
        assert_eq!(1000i32, Value::from(1000i32).as_i32().unwrap());
        assert_eq!(0x0237u16, Value::from(0x0237u16).as_u16().unwrap());
        assert_eq!(131474u32, Value::from(131474u32).as_u32().unwrap());
        assert_eq!(1.5f32, Value::from(1.5f32).as_f32().unwrap());
        assert!(Value::from(true).as_bool().unwrap());
    }

    #[test]
    fn scalar_encoding_is_little_endian() {
        assert_eq!(&[0xF4, 0x01, 0x00, 0x00], Value::from(500i32).bytes());
        assert_eq!(&[0x0F, 0x00], Value::from(0x000Fu16).bytes());
    }

    #[test]
    fn wrong_size_is_rejected() {
        let err = Value::from_bytes(DataType::UInt32, &[1, 2]).unwrap_err();
        assert!(matches!(err, ValueError::WrongSize { expected: 4, got: 2, .. }));
    }

    #[test]
    fn strings_accept_any_length() {
        let value = Value::from_bytes(DataType::VisibleString, b"maxon").unwrap();
        assert_eq!("maxon", value.as_string().unwrap());
    }

    #[test]
    fn equality_is_by_type_and_bytes() {
        assert_eq!(Value::from(1u16), Value::from(1u16));
        assert_ne!(Value::from(1u16), Value::from(1i16));
        assert_ne!(Value::from(1u16), Value::from(2u16));
    }
}
