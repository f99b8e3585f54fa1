//! Typed value codec for RPC payloads.
//!
//! Function arguments, variable reads and signal payloads travel as raw
//! bytes tagged out-of-band with one of a small set of wire types. This
//! module is the single canonical mapping between those bytes and Rust
//! values. Doubles are little-endian (device native); every other numeric
//! type is big-endian.

use crate::error::{ProtocolError, Result};

/// Wire types a device may declare for variables and function results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    Bool,
    Byte,
    Crc,
    Uint16,
    Uint32,
    Int32,
    Float,
    Double,
    Buffer,
    String,
}

impl ValueType {
    /// Resolves a type name as it appears in a device description payload.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "bool" => Some(Self::Bool),
            "byte" | "uint8" => Some(Self::Byte),
            "crc" => Some(Self::Crc),
            "uint16" => Some(Self::Uint16),
            "uint32" => Some(Self::Uint32),
            "int32" | "int" => Some(Self::Int32),
            "float" => Some(Self::Float),
            "double" => Some(Self::Double),
            "buffer" => Some(Self::Buffer),
            "string" => Some(Self::String),
            _ => None,
        }
    }
}

/// A decoded wire value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Byte(u8),
    Crc(u32),
    Uint16(u16),
    Uint32(u32),
    Int32(i32),
    Float(f32),
    Double(f64),
    Buffer(Vec<u8>),
    String(String),
}

impl Value {
    /// The wire type this value encodes as.
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Bool(_) => ValueType::Bool,
            Value::Byte(_) => ValueType::Byte,
            Value::Crc(_) => ValueType::Crc,
            Value::Uint16(_) => ValueType::Uint16,
            Value::Uint32(_) => ValueType::Uint32,
            Value::Int32(_) => ValueType::Int32,
            Value::Float(_) => ValueType::Float,
            Value::Double(_) => ValueType::Double,
            Value::Buffer(_) => ValueType::Buffer,
            Value::String(_) => ValueType::String,
        }
    }

    /// Encodes the value into its wire representation.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Value::Bool(v) => vec![u8::from(*v)],
            Value::Byte(v) => vec![*v],
            Value::Crc(v) => v.to_be_bytes().to_vec(),
            Value::Uint16(v) => v.to_be_bytes().to_vec(),
            Value::Uint32(v) => v.to_be_bytes().to_vec(),
            Value::Int32(v) => v.to_be_bytes().to_vec(),
            Value::Float(v) => v.to_be_bytes().to_vec(),
            // Doubles are the one little-endian type on the wire.
            Value::Double(v) => v.to_le_bytes().to_vec(),
            Value::Buffer(v) => v.clone(),
            Value::String(v) => v.as_bytes().to_vec(),
        }
    }

    /// Decodes bytes as the given wire type.
    ///
    /// An empty buffer decoded as `Int32` yields 0; every other numeric
    /// type requires its full fixed width.
    pub fn decode(bytes: &[u8], value_type: ValueType) -> Result<Self> {
        match value_type {
            ValueType::Bool => {
                let first = bytes.first().copied().unwrap_or(0);
                Ok(Value::Bool(first != 0))
            }
            ValueType::Byte => Ok(Value::Byte(bytes.first().copied().unwrap_or(0))),
            ValueType::Crc => Ok(Value::Crc(u32::from_be_bytes(fixed(bytes, "crc")?))),
            ValueType::Uint16 => Ok(Value::Uint16(u16::from_be_bytes(fixed(bytes, "uint16")?))),
            ValueType::Uint32 => Ok(Value::Uint32(u32::from_be_bytes(fixed(bytes, "uint32")?))),
            ValueType::Int32 => {
                // Devices answer some int32 reads with an empty payload.
                if bytes.is_empty() {
                    return Ok(Value::Int32(0));
                }
                Ok(Value::Int32(i32::from_be_bytes(fixed(bytes, "int32")?)))
            }
            ValueType::Float => Ok(Value::Float(f32::from_be_bytes(fixed(bytes, "float")?))),
            ValueType::Double => Ok(Value::Double(f64::from_le_bytes(fixed(bytes, "double")?))),
            ValueType::Buffer => Ok(Value::Buffer(bytes.to_vec())),
            ValueType::String => Ok(Value::String(
                String::from_utf8_lossy(bytes).into_owned(),
            )),
        }
    }
}

/// Reads an exact-width prefix, erroring out on short input.
fn fixed<const N: usize>(bytes: &[u8], what: &str) -> Result<[u8; N]> {
    if bytes.len() < N {
        return Err(ProtocolError::MalformedPacket(format!(
            "{} value needs {} bytes, got {}",
            what,
            N,
            bytes.len()
        )));
    }
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[..N]);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(value: Value) {
        let encoded = value.encode();
        let decoded = Value::decode(&encoded, value.value_type()).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn test_bool_roundtrip() {
        roundtrip(Value::Bool(true));
        roundtrip(Value::Bool(false));
    }

    #[test]
    fn test_byte_roundtrip() {
        roundtrip(Value::Byte(0));
        roundtrip(Value::Byte(255));
    }

    #[test]
    fn test_crc_roundtrip() {
        roundtrip(Value::Crc(0xDEAD_BEEF));
    }

    #[test]
    fn test_uint16_roundtrip() {
        roundtrip(Value::Uint16(0));
        roundtrip(Value::Uint16(u16::MAX));
    }

    #[test]
    fn test_uint32_roundtrip() {
        roundtrip(Value::Uint32(0));
        roundtrip(Value::Uint32(u32::MAX));
    }

    #[test]
    fn test_int32_roundtrip() {
        roundtrip(Value::Int32(0));
        roundtrip(Value::Int32(-1));
        roundtrip(Value::Int32(i32::MIN));
        roundtrip(Value::Int32(i32::MAX));
    }

    #[test]
    fn test_float_roundtrip() {
        roundtrip(Value::Float(3.5));
        roundtrip(Value::Float(-0.25));
    }

    #[test]
    fn test_double_roundtrip() {
        roundtrip(Value::Double(6.02e23));
        roundtrip(Value::Double(-1.5));
    }

    #[test]
    fn test_buffer_roundtrip() {
        roundtrip(Value::Buffer(vec![1, 2, 3, 0, 255]));
        roundtrip(Value::Buffer(vec![]));
    }

    #[test]
    fn test_string_roundtrip() {
        roundtrip(Value::String("hello device".to_string()));
        roundtrip(Value::String(String::new()));
    }

    #[test]
    fn test_numeric_byte_order() {
        assert_eq!(Value::Uint16(0x0102).encode(), vec![0x01, 0x02]);
        assert_eq!(Value::Uint32(0x01020304).encode(), vec![1, 2, 3, 4]);
        assert_eq!(Value::Crc(0x01020304).encode(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_double_is_little_endian() {
        let encoded = Value::Double(1.0).encode();
        assert_eq!(encoded, 1.0f64.to_le_bytes().to_vec());
        assert_ne!(encoded, 1.0f64.to_be_bytes().to_vec());
    }

    #[test]
    fn test_empty_buffer_decodes_as_zero_int32() {
        let decoded = Value::decode(&[], ValueType::Int32).unwrap();
        assert_eq!(decoded, Value::Int32(0));
    }

    #[test]
    fn test_short_uint32_is_error() {
        let result = Value::decode(&[1, 2], ValueType::Uint32);
        assert!(matches!(result, Err(ProtocolError::MalformedPacket(_))));
    }

    #[test]
    fn test_bool_decodes_any_nonzero() {
        assert_eq!(Value::decode(&[7], ValueType::Bool).unwrap(), Value::Bool(true));
        assert_eq!(Value::decode(&[0], ValueType::Bool).unwrap(), Value::Bool(false));
        assert_eq!(Value::decode(&[], ValueType::Bool).unwrap(), Value::Bool(false));
    }

    #[test]
    fn test_type_names() {
        assert_eq!(ValueType::from_name("double"), Some(ValueType::Double));
        assert_eq!(ValueType::from_name("uint8"), Some(ValueType::Byte));
        assert_eq!(ValueType::from_name("int"), Some(ValueType::Int32));
        assert_eq!(ValueType::from_name("complex"), None);
    }
}
