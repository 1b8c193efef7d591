use std::fmt;

use byteorder::{BigEndian, ByteOrder as _, LittleEndian};
use serde::{Deserialize, Serialize};
use serde_yaml::Value;

use crate::{Error, Result};

/// Byte order of array elements in a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ByteOrder {
    Big,
    #[default]
    Little,
}

impl ByteOrder {
    pub fn native() -> Self {
        if cfg!(target_endian = "big") {
            Self::Big
        } else {
            Self::Little
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Big => "big",
            Self::Little => "little",
        }
    }
}

/// One field of a structured datatype.
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: Option<String>,
    pub dtype: DType,
    pub byteorder: ByteOrder,
    pub shape: Vec<u64>,
}

/// Element type of an ndarray.
#[derive(Debug, Clone, PartialEq)]
pub enum DType {
    Bool8,
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Float16,
    Float32,
    Float64,
    Complex64,
    Complex128,
    /// Fixed-width ASCII string of the given length.
    Ascii(u64),
    /// Fixed-width UCS-4 string of the given number of characters.
    Ucs4(u64),
    Structured(Vec<Field>),
}

impl DType {
    /// Size of one element in bytes, saturating at `u64::MAX`.
    pub fn size(&self) -> u64 {
        self.checked_size().unwrap_or(u64::MAX)
    }

    fn checked_size(&self) -> Option<u64> {
        match self {
            Self::Bool8 | Self::Int8 | Self::UInt8 => Some(1),
            Self::Int16 | Self::UInt16 | Self::Float16 => Some(2),
            Self::Int32 | Self::UInt32 | Self::Float32 => Some(4),
            Self::Int64 | Self::UInt64 | Self::Float64 | Self::Complex64 => Some(8),
            Self::Complex128 => Some(16),
            Self::Ascii(n) => Some(*n),
            Self::Ucs4(n) => n.checked_mul(4),
            Self::Structured(fields) => fields.iter().try_fold(0u64, |acc, f| {
                let field = f
                    .shape
                    .iter()
                    .try_fold(f.dtype.checked_size()?, |a, &n| a.checked_mul(n))?;
                acc.checked_add(field)
            }),
        }
    }

    fn from_name(name: &str) -> Result<Self> {
        let out = match name {
            "bool8" => Self::Bool8,
            "int8" => Self::Int8,
            "uint8" => Self::UInt8,
            "int16" => Self::Int16,
            "uint16" => Self::UInt16,
            "int32" => Self::Int32,
            "uint32" => Self::UInt32,
            "int64" => Self::Int64,
            "uint64" => Self::UInt64,
            "float16" => Self::Float16,
            "float32" => Self::Float32,
            "float64" => Self::Float64,
            "complex64" => Self::Complex64,
            "complex128" => Self::Complex128,
            s => return Err(Error::format(format!("unknown datatype {s:?}"))),
        };
        Ok(out)
    }

    fn name(&self) -> Option<&'static str> {
        let out = match self {
            Self::Bool8 => "bool8",
            Self::Int8 => "int8",
            Self::UInt8 => "uint8",
            Self::Int16 => "int16",
            Self::UInt16 => "uint16",
            Self::Int32 => "int32",
            Self::UInt32 => "uint32",
            Self::Int64 => "int64",
            Self::UInt64 => "uint64",
            Self::Float16 => "float16",
            Self::Float32 => "float32",
            Self::Float64 => "float64",
            Self::Complex64 => "complex64",
            Self::Complex128 => "complex128",
            _ => return None,
        };
        Some(out)
    }

    /// Parse the `datatype` entry of an ndarray.
    pub fn from_yaml(value: &Value) -> Result<Self> {
        let dtype = Self::parse_yaml(value)?;
        if dtype.checked_size().is_none() {
            return Err(Error::format(format!("datatype {dtype} is too large")));
        }
        Ok(dtype)
    }

    fn parse_yaml(value: &Value) -> Result<Self> {
        match value {
            Value::String(s) => Self::from_name(s),
            Value::Sequence(seq) if seq.len() == 2 && seq[0].is_string() => {
                let len = seq[1]
                    .as_u64()
                    .ok_or_else(|| Error::format("string datatype length must be an integer"))?;
                match seq[0].as_str() {
                    Some("ascii") => Ok(Self::Ascii(len)),
                    Some("ucs4") => Ok(Self::Ucs4(len)),
                    _ => Err(Error::format(format!("unknown string datatype {seq:?}"))),
                }
            }
            Value::Sequence(seq) => seq
                .iter()
                .map(Field::from_yaml)
                .collect::<Result<Vec<_>>>()
                .map(Self::Structured),
            other => Err(Error::format(format!("invalid datatype {other:?}"))),
        }
    }

    pub fn to_yaml(&self) -> Value {
        match self {
            Self::Ascii(n) => Value::Sequence(vec!["ascii".into(), (*n).into()]),
            Self::Ucs4(n) => Value::Sequence(vec!["ucs4".into(), (*n).into()]),
            Self::Structured(fields) => {
                Value::Sequence(fields.iter().map(Field::to_yaml).collect())
            }
            simple => simple.name().unwrap_or_default().into(),
        }
    }

    /// Decode one element as `f64`, for numeric real types.
    pub(crate) fn read_f64(&self, bytes: &[u8], order: ByteOrder) -> Option<f64> {
        let out = match self {
            Self::Bool8 => f64::from(u8::from(bytes[0] != 0)),
            Self::Int8 => f64::from(bytes[0] as i8),
            Self::UInt8 => f64::from(bytes[0]),
            Self::Int16 => f64::from(i16::read(bytes, order)),
            Self::UInt16 => f64::from(u16::read(bytes, order)),
            Self::Int32 => f64::from(i32::read(bytes, order)),
            Self::UInt32 => f64::from(u32::read(bytes, order)),
            Self::Int64 => i64::read(bytes, order) as f64,
            Self::UInt64 => u64::read(bytes, order) as f64,
            Self::Float32 => f64::from(f32::read(bytes, order)),
            Self::Float64 => f64::read(bytes, order),
            _ => return None,
        };
        Some(out)
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ascii(n) => write!(f, "ascii[{n}]"),
            Self::Ucs4(n) => write!(f, "ucs4[{n}]"),
            Self::Structured(fields) => {
                write!(f, "{{")?;
                for (i, field) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", field.name.as_deref().unwrap_or("_"), field.dtype)?;
                }
                write!(f, "}}")
            }
            simple => f.write_str(simple.name().unwrap_or("?")),
        }
    }
}

impl Field {
    fn from_yaml(value: &Value) -> Result<Self> {
        let map = value
            .as_mapping()
            .ok_or_else(|| Error::format("structured datatype fields must be mappings"))?;
        let dtype = map
            .get("datatype")
            .ok_or_else(|| Error::format("structured field without datatype"))
            .and_then(DType::from_yaml)?;
        let byteorder = match map.get("byteorder") {
            Some(v) => serde_yaml::from_value(v.clone())?,
            None => ByteOrder::default(),
        };
        let shape = match map.get("shape") {
            Some(v) => serde_yaml::from_value(v.clone())?,
            None => Vec::new(),
        };
        Ok(Self {
            name: map.get("name").and_then(Value::as_str).map(str::to_owned),
            dtype,
            byteorder,
            shape,
        })
    }

    fn to_yaml(&self) -> Value {
        let mut map = serde_yaml::Mapping::new();
        if let Some(name) = &self.name {
            map.insert("name".into(), name.as_str().into());
        }
        map.insert("datatype".into(), self.dtype.to_yaml());
        map.insert("byteorder".into(), self.byteorder.as_str().into());
        if !self.shape.is_empty() {
            map.insert(
                "shape".into(),
                Value::Sequence(self.shape.iter().map(|&n| n.into()).collect()),
            );
        }
        Value::Mapping(map)
    }
}

/// A primitive Rust type that array elements can be decoded into.
pub trait Element: Copy + Send + Sync + 'static {
    /// The datatype this element type corresponds to.
    fn dtype() -> DType;

    /// Decode from exactly `Self::dtype().size()` bytes.
    fn read(bytes: &[u8], order: ByteOrder) -> Self;

    /// Encode into the slice.
    fn write(self, bytes: &mut [u8], order: ByteOrder);
}

macro_rules! impl_element {
    ($ty:ty, $dtype:ident, $read:ident, $write:ident) => {
        impl Element for $ty {
            fn dtype() -> DType {
                DType::$dtype
            }

            fn read(bytes: &[u8], order: ByteOrder) -> Self {
                match order {
                    ByteOrder::Big => BigEndian::$read(bytes),
                    ByteOrder::Little => LittleEndian::$read(bytes),
                }
            }

            fn write(self, bytes: &mut [u8], order: ByteOrder) {
                match order {
                    ByteOrder::Big => BigEndian::$write(bytes, self),
                    ByteOrder::Little => LittleEndian::$write(bytes, self),
                }
            }
        }
    };
}

impl_element!(i16, Int16, read_i16, write_i16);
impl_element!(u16, UInt16, read_u16, write_u16);
impl_element!(i32, Int32, read_i32, write_i32);
impl_element!(u32, UInt32, read_u32, write_u32);
impl_element!(i64, Int64, read_i64, write_i64);
impl_element!(u64, UInt64, read_u64, write_u64);
impl_element!(f32, Float32, read_f32, write_f32);
impl_element!(f64, Float64, read_f64, write_f64);

impl Element for u8 {
    fn dtype() -> DType {
        DType::UInt8
    }

    fn read(bytes: &[u8], _order: ByteOrder) -> Self {
        bytes[0]
    }

    fn write(self, bytes: &mut [u8], _order: ByteOrder) {
        bytes[0] = self;
    }
}

impl Element for i8 {
    fn dtype() -> DType {
        DType::Int8
    }

    fn read(bytes: &[u8], _order: ByteOrder) -> Self {
        bytes[0] as i8
    }

    fn write(self, bytes: &mut [u8], _order: ByteOrder) {
        bytes[0] = self as u8;
    }
}

impl Element for bool {
    fn dtype() -> DType {
        DType::Bool8
    }

    fn read(bytes: &[u8], _order: ByteOrder) -> Self {
        bytes[0] != 0
    }

    fn write(self, bytes: &mut [u8], _order: ByteOrder) {
        bytes[0] = u8::from(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_and_string_types() {
        let v: Value = serde_yaml::from_str("float32").unwrap();
        assert_eq!(DType::from_yaml(&v).unwrap(), DType::Float32);
        let v: Value = serde_yaml::from_str("[ascii, 12]").unwrap();
        assert_eq!(DType::from_yaml(&v).unwrap(), DType::Ascii(12));
        assert_eq!(DType::Ucs4(3).size(), 12);
        assert!(DType::from_yaml(&"float80".into()).is_err());
    }

    #[test]
    fn parses_structured_types() {
        let v: Value = serde_yaml::from_str(
            "- {name: x, datatype: int16, byteorder: big}\n- {name: y, datatype: float64, shape: [3]}\n",
        )
        .unwrap();
        let dt = DType::from_yaml(&v).unwrap();
        assert_eq!(dt.size(), 2 + 8 * 3);
        assert_eq!(dt.to_string(), "{x: int16, y: float64}");
        assert_eq!(DType::from_yaml(&dt.to_yaml()).unwrap(), dt);
    }

    #[test]
    fn elements_respect_byte_order() {
        let mut buf = [0u8; 4];
        1.5f32.write(&mut buf, ByteOrder::Big);
        assert_eq!(buf, 1.5f32.to_be_bytes());
        assert_eq!(f32::read(&buf, ByteOrder::Big), 1.5);
        assert_eq!(DType::Float32.read_f64(&buf, ByteOrder::Big), Some(1.5));
        assert_eq!(DType::Ascii(4).read_f64(&buf, ByteOrder::Big), None);
    }
}
