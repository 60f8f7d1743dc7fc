//! MessagePack encoding of the Constellation value model.
//!
//! The codec is self-describing: scalars map to the corresponding MessagePack
//! types, timestamps to the standard timestamp extension (type `-1`), and the
//! containers to arrays and string-keyed maps. Several protocol frames carry
//! multiple MessagePack objects back to back, so all decoding consumes from a
//! mutable byte-slice cursor.

use chrono::{DateTime, Utc};
use constellation_core::{Dictionary, List, Value};

use crate::error::ProtocolError;

/// MessagePack extension type for timestamps.
const TIMESTAMP_EXT_TYPE: i8 = -1;

/// Encode a value, appending to `buf`.
///
/// # Errors
/// Returns [`ProtocolError::Decoding`] if the value tree cannot be
/// represented (practically unreachable for well-formed values).
pub fn encode_value(buf: &mut Vec<u8>, value: &Value) -> Result<(), ProtocolError> {
    let mp = to_rmpv(value);
    rmpv::encode::write_value(buf, &mp).map_err(|err| ProtocolError::decoding(err.to_string()))
}

/// Encode a single value into a fresh buffer.
///
/// # Errors
/// See [`encode_value`].
pub fn value_to_bytes(value: &Value) -> Result<Vec<u8>, ProtocolError> {
    let mut buf = Vec::new();
    encode_value(&mut buf, value)?;
    Ok(buf)
}

/// Decode one value from the cursor, advancing it past the consumed bytes.
///
/// # Errors
/// Returns [`ProtocolError::Decoding`] for malformed MessagePack data or
/// unsupported types.
pub fn decode_value(cursor: &mut &[u8]) -> Result<Value, ProtocolError> {
    let mp = rmpv::decode::read_value(cursor)
        .map_err(|err| ProtocolError::decoding(err.to_string()))?;
    from_rmpv(mp)
}

/// Decode a single value that must consume the whole buffer.
///
/// # Errors
/// Returns [`ProtocolError::Decoding`] on malformed data or trailing bytes.
pub fn value_from_bytes(bytes: &[u8]) -> Result<Value, ProtocolError> {
    let mut cursor = bytes;
    let value = decode_value(&mut cursor)?;
    if !cursor.is_empty() {
        return Err(ProtocolError::decoding("trailing bytes after value"));
    }
    Ok(value)
}

/// Encode a dictionary into MessagePack bytes.
///
/// # Errors
/// See [`encode_value`].
pub fn encode_dictionary(dict: &Dictionary) -> Result<Vec<u8>, ProtocolError> {
    value_to_bytes(&Value::Dictionary(dict.clone()))
}

/// Decode a payload that must be a dictionary.
///
/// # Errors
/// Returns [`ProtocolError::Decoding`] if the payload is not a MessagePack map.
pub fn decode_dictionary(bytes: &[u8]) -> Result<Dictionary, ProtocolError> {
    match value_from_bytes(bytes)? {
        Value::Dictionary(dict) => Ok(dict),
        other => Err(ProtocolError::decoding(format!(
            "expected dictionary payload, got {}",
            other.type_name()
        ))),
    }
}

/// Encode a list into MessagePack bytes.
///
/// # Errors
/// See [`encode_value`].
pub fn encode_list(list: &List) -> Result<Vec<u8>, ProtocolError> {
    value_to_bytes(&Value::List(list.clone()))
}

/// Decode a payload that must be a list.
///
/// # Errors
/// Returns [`ProtocolError::Decoding`] if the payload is not a MessagePack array.
pub fn decode_list(bytes: &[u8]) -> Result<List, ProtocolError> {
    match value_from_bytes(bytes)? {
        Value::List(list) => Ok(list),
        Value::Array(values) => Ok(List::from(values)),
        other => Err(ProtocolError::decoding(format!(
            "expected list payload, got {}",
            other.type_name()
        ))),
    }
}

fn to_rmpv(value: &Value) -> rmpv::Value {
    match value {
        Value::Nil => rmpv::Value::Nil,
        Value::Bool(v) => rmpv::Value::Boolean(*v),
        Value::Int(v) => rmpv::Value::from(*v),
        Value::UInt(v) => rmpv::Value::from(*v),
        Value::Double(v) => rmpv::Value::F64(*v),
        Value::String(v) => rmpv::Value::from(v.as_str()),
        Value::Timestamp(v) => encode_timestamp(v),
        Value::Bytes(v) => rmpv::Value::Binary(v.clone()),
        Value::Array(values) => rmpv::Value::Array(values.iter().map(to_rmpv).collect()),
        Value::List(list) => rmpv::Value::Array(list.iter().map(to_rmpv).collect()),
        Value::Dictionary(dict) => rmpv::Value::Map(
            dict.iter()
                .map(|(key, val)| (rmpv::Value::from(key), to_rmpv(val)))
                .collect(),
        ),
    }
}

fn from_rmpv(mp: rmpv::Value) -> Result<Value, ProtocolError> {
    match mp {
        rmpv::Value::Nil => Ok(Value::Nil),
        rmpv::Value::Boolean(v) => Ok(Value::Bool(v)),
        rmpv::Value::Integer(int) => {
            if let Some(v) = int.as_u64() {
                Ok(Value::UInt(v))
            } else if let Some(v) = int.as_i64() {
                Ok(Value::Int(v))
            } else {
                Err(ProtocolError::decoding("integer out of 64-bit range"))
            }
        }
        rmpv::Value::F32(v) => Ok(Value::Double(f64::from(v))),
        rmpv::Value::F64(v) => Ok(Value::Double(v)),
        rmpv::Value::String(s) => match s.into_str() {
            Some(v) => Ok(Value::String(v)),
            None => Err(ProtocolError::decoding("non-UTF-8 string value")),
        },
        rmpv::Value::Binary(v) => Ok(Value::Bytes(v)),
        rmpv::Value::Ext(ext_type, data) if ext_type == TIMESTAMP_EXT_TYPE => {
            decode_timestamp(&data).map(Value::Timestamp)
        }
        rmpv::Value::Ext(ext_type, _) => Err(ProtocolError::decoding(format!(
            "unsupported extension type {ext_type}"
        ))),
        rmpv::Value::Array(values) => {
            let decoded: Result<Vec<Value>, ProtocolError> =
                values.into_iter().map(from_rmpv).collect();
            Ok(Value::List(List::from(decoded?)))
        }
        rmpv::Value::Map(entries) => {
            let mut dict = Dictionary::new();
            for (key, val) in entries {
                let key = match key {
                    rmpv::Value::String(s) => s
                        .into_str()
                        .ok_or_else(|| ProtocolError::decoding("non-UTF-8 map key"))?,
                    other => {
                        return Err(ProtocolError::decoding(format!(
                            "non-string map key of type {other}"
                        )))
                    }
                };
                dict.insert(key, from_rmpv(val)?);
            }
            Ok(Value::Dictionary(dict))
        }
    }
}

/// Encode a timestamp in the 12-byte extension format: nanoseconds (u32 BE)
/// followed by seconds (i64 BE).
fn encode_timestamp(time: &DateTime<Utc>) -> rmpv::Value {
    let mut data = Vec::with_capacity(12);
    data.extend_from_slice(&time.timestamp_subsec_nanos().to_be_bytes());
    data.extend_from_slice(&time.timestamp().to_be_bytes());
    rmpv::Value::Ext(TIMESTAMP_EXT_TYPE, data)
}

/// Decode the 4, 8 and 12-byte timestamp extension formats.
fn decode_timestamp(data: &[u8]) -> Result<DateTime<Utc>, ProtocolError> {
    let (secs, nanos) = match data.len() {
        4 => {
            let secs = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
            (i64::from(secs), 0)
        }
        8 => {
            let packed = u64::from_be_bytes([
                data[0], data[1], data[2], data[3], data[4], data[5], data[6], data[7],
            ]);
            let nanos = u32::try_from(packed >> 34)
                .map_err(|_| ProtocolError::decoding("timestamp nanoseconds out of range"))?;
            let secs = i64::try_from(packed & 0x3_ffff_ffff)
                .map_err(|_| ProtocolError::decoding("timestamp seconds out of range"))?;
            (secs, nanos)
        }
        12 => {
            let nanos = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
            let secs = i64::from_be_bytes([
                data[4], data[5], data[6], data[7], data[8], data[9], data[10], data[11],
            ]);
            (secs, nanos)
        }
        len => {
            return Err(ProtocolError::decoding(format!(
                "invalid timestamp extension length {len}"
            )))
        }
    };
    DateTime::from_timestamp(secs, nanos)
        .ok_or_else(|| ProtocolError::decoding("timestamp out of range"))
}
