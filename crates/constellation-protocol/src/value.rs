//! Dynamic typed value and its self-describing MessagePack encoding.
//!
//! The wire format is plain MessagePack: scalars use the standard families,
//! timestamps the official timestamp extension (type -1, ts32/ts64/ts96
//! chosen by the size rules), byte blobs the bin family. A foreign node
//! using the same format family decodes to semantically equal values.

use std::fmt;
use std::io::Cursor;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use thiserror::Error;

use crate::error::DecodeError;

/// MessagePack extension type of the timestamp extension.
const EXT_TIMESTAMP: i8 = -1;

/// Extraction from a [`Value`] failed.
#[derive(Debug, Error)]
pub enum ValueError {
    #[error("type mismatch: requested {requested}, stored {stored}")]
    TypeMismatch {
        requested: &'static str,
        stored: &'static str,
    },

    #[error("value out of range for {target}")]
    OutOfRange { target: &'static str },

    #[error("'{value}' is not one of the allowed values [{allowed}]")]
    InvalidEnum { value: String, allowed: String },
}

/// UTC wall-clock instant, nanosecond resolution, signed seconds since the
/// Unix epoch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp {
    pub secs: i64,
    pub nanos: u32,
}

impl Timestamp {
    pub fn new(secs: i64, nanos: u32) -> Self {
        Timestamp { secs, nanos }
    }

    pub fn now() -> Self {
        Timestamp::from_system_time(SystemTime::now())
    }

    pub fn from_system_time(time: SystemTime) -> Self {
        match time.duration_since(UNIX_EPOCH) {
            Ok(elapsed) => Timestamp {
                secs: elapsed.as_secs() as i64,
                nanos: elapsed.subsec_nanos(),
            },
            Err(before_epoch) => {
                let gap = before_epoch.duration();
                if gap.subsec_nanos() == 0 {
                    Timestamp {
                        secs: -(gap.as_secs() as i64),
                        nanos: 0,
                    }
                } else {
                    Timestamp {
                        secs: -(gap.as_secs() as i64) - 1,
                        nanos: 1_000_000_000 - gap.subsec_nanos(),
                    }
                }
            }
        }
    }

    pub fn to_system_time(self) -> SystemTime {
        if self.secs >= 0 {
            UNIX_EPOCH + Duration::new(self.secs as u64, self.nanos)
        } else {
            let whole = UNIX_EPOCH - Duration::from_secs(self.secs.unsigned_abs());
            whole + Duration::from_nanos(u64::from(self.nanos))
        }
    }

    /// Elapsed wall-clock time since this instant, zero if in the future.
    pub fn elapsed(self) -> Duration {
        SystemTime::now()
            .duration_since(self.to_system_time())
            .unwrap_or_default()
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}s", self.secs, self.nanos)
    }
}

/// Tagged dynamic value covering every payload type of the fabric.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int64(i64),
    UInt64(u64),
    Double(f64),
    String(String),
    TimePoint(Timestamp),
    Binary(Vec<u8>),
    BoolList(Vec<bool>),
    Int64List(Vec<i64>),
    DoubleList(Vec<f64>),
    StringList(Vec<String>),
    TimePointList(Vec<Timestamp>),
}

impl Value {
    /// Observable variant tag.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int64(_) => "int64",
            Value::UInt64(_) => "uint64",
            Value::Double(_) => "double",
            Value::String(_) => "string",
            Value::TimePoint(_) => "timepoint",
            Value::Binary(_) => "binary",
            Value::BoolList(_) => "bool_list",
            Value::Int64List(_) => "int64_list",
            Value::DoubleList(_) => "double_list",
            Value::StringList(_) => "string_list",
            Value::TimePointList(_) => "timepoint_list",
        }
    }

    fn mismatch(&self, requested: &'static str) -> ValueError {
        ValueError::TypeMismatch {
            requested,
            stored: self.type_name(),
        }
    }

    pub fn as_bool(&self) -> Result<bool, ValueError> {
        match self {
            Value::Bool(v) => Ok(*v),
            other => Err(other.mismatch("bool")),
        }
    }

    /// Signed extraction. Accepts either integer tag; an unsigned value
    /// above `i64::MAX` is out of range.
    pub fn as_i64(&self) -> Result<i64, ValueError> {
        match self {
            Value::Int64(v) => Ok(*v),
            Value::UInt64(v) => {
                i64::try_from(*v).map_err(|_| ValueError::OutOfRange { target: "int64" })
            }
            other => Err(other.mismatch("int64")),
        }
    }

    /// Unsigned extraction. Accepts either integer tag; negative values are
    /// out of range.
    pub fn as_u64(&self) -> Result<u64, ValueError> {
        match self {
            Value::UInt64(v) => Ok(*v),
            Value::Int64(v) => {
                u64::try_from(*v).map_err(|_| ValueError::OutOfRange { target: "uint64" })
            }
            other => Err(other.mismatch("uint64")),
        }
    }

    pub fn as_f64(&self) -> Result<f64, ValueError> {
        match self {
            Value::Double(v) => Ok(*v),
            other => Err(other.mismatch("double")),
        }
    }

    pub fn as_str(&self) -> Result<&str, ValueError> {
        match self {
            Value::String(v) => Ok(v),
            other => Err(other.mismatch("string")),
        }
    }

    pub fn as_timestamp(&self) -> Result<Timestamp, ValueError> {
        match self {
            Value::TimePoint(v) => Ok(*v),
            other => Err(other.mismatch("timepoint")),
        }
    }

    pub fn as_binary(&self) -> Result<&[u8], ValueError> {
        match self {
            Value::Binary(v) => Ok(v),
            other => Err(other.mismatch("binary")),
        }
    }

    /// Match a string value against a declared enum domain,
    /// case-insensitively. Returns the canonical spelling from `domain`.
    pub fn as_enum(&self, domain: &[&str]) -> Result<String, ValueError> {
        let raw = self.as_str()?;
        domain
            .iter()
            .find(|candidate| candidate.eq_ignore_ascii_case(raw))
            .map(|candidate| (*candidate).to_owned())
            .ok_or_else(|| ValueError::InvalidEnum {
                value: raw.to_owned(),
                allowed: domain.join(", "),
            })
    }

    pub(crate) fn to_mp(&self) -> rmpv::Value {
        match self {
            Value::Null => rmpv::Value::Nil,
            Value::Bool(v) => rmpv::Value::Boolean(*v),
            Value::Int64(v) => rmpv::Value::from(*v),
            Value::UInt64(v) => rmpv::Value::from(*v),
            Value::Double(v) => rmpv::Value::F64(*v),
            Value::String(v) => rmpv::Value::from(v.as_str()),
            Value::TimePoint(ts) => timestamp_to_mp(*ts),
            Value::Binary(v) => rmpv::Value::Binary(v.clone()),
            Value::BoolList(v) => {
                rmpv::Value::Array(v.iter().map(|b| rmpv::Value::Boolean(*b)).collect())
            }
            Value::Int64List(v) => {
                rmpv::Value::Array(v.iter().map(|i| rmpv::Value::from(*i)).collect())
            }
            Value::DoubleList(v) => {
                rmpv::Value::Array(v.iter().map(|f| rmpv::Value::F64(*f)).collect())
            }
            Value::StringList(v) => {
                rmpv::Value::Array(v.iter().map(|s| rmpv::Value::from(s.as_str())).collect())
            }
            Value::TimePointList(v) => {
                rmpv::Value::Array(v.iter().map(|ts| timestamp_to_mp(*ts)).collect())
            }
        }
    }

    pub(crate) fn from_mp(mp: rmpv::Value) -> Result<Self, DecodeError> {
        Ok(match mp {
            rmpv::Value::Nil => Value::Null,
            rmpv::Value::Boolean(v) => Value::Bool(v),
            rmpv::Value::Integer(i) => {
                if let Some(v) = i.as_i64() {
                    Value::Int64(v)
                } else if let Some(v) = i.as_u64() {
                    Value::UInt64(v)
                } else {
                    return Err(DecodeError::payload("unrepresentable integer"));
                }
            }
            rmpv::Value::F32(v) => Value::Double(f64::from(v)),
            rmpv::Value::F64(v) => Value::Double(v),
            rmpv::Value::String(s) => match s.into_str() {
                Some(v) => Value::String(v),
                None => return Err(DecodeError::payload("string is not valid UTF-8")),
            },
            rmpv::Value::Binary(v) => Value::Binary(v),
            rmpv::Value::Ext(EXT_TIMESTAMP, data) => Value::TimePoint(timestamp_from_ext(&data)?),
            rmpv::Value::Ext(ty, _) => {
                return Err(DecodeError::Field {
                    field: "extension type",
                    value: ty.unsigned_abs() as u64,
                })
            }
            rmpv::Value::Array(elements) => list_from_mp(elements)?,
            rmpv::Value::Map(_) => {
                return Err(DecodeError::payload("nested maps are not valid values"))
            }
        })
    }

    /// Encode as a self-contained byte buffer.
    pub fn assemble(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        write_mp(&mut buf, &self.to_mp());
        buf
    }

    /// Decode a buffer produced by [`Value::assemble`]. Trailing bytes after
    /// the object are an error.
    pub fn disassemble(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut cursor = Cursor::new(bytes);
        let mp = read_mp(&mut cursor)?;
        expect_consumed(&cursor)?;
        Value::from_mp(mp)
    }
}

/// Homogeneous-array decoding: element tags must agree. An empty array has
/// no observable element type and decodes as an empty string list.
fn list_from_mp(elements: Vec<rmpv::Value>) -> Result<Value, DecodeError> {
    let Some(first) = elements.first() else {
        return Ok(Value::StringList(Vec::new()));
    };

    match first {
        rmpv::Value::Boolean(_) => elements
            .into_iter()
            .map(|e| match e {
                rmpv::Value::Boolean(v) => Ok(v),
                _ => Err(DecodeError::payload("mixed-type array")),
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Value::BoolList),
        rmpv::Value::Integer(_) => elements
            .into_iter()
            .map(|e| match e {
                rmpv::Value::Integer(i) => i
                    .as_i64()
                    .ok_or_else(|| DecodeError::payload("integer list element exceeds int64")),
                _ => Err(DecodeError::payload("mixed-type array")),
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Int64List),
        rmpv::Value::F32(_) | rmpv::Value::F64(_) => elements
            .into_iter()
            .map(|e| match e {
                rmpv::Value::F32(v) => Ok(f64::from(v)),
                rmpv::Value::F64(v) => Ok(v),
                _ => Err(DecodeError::payload("mixed-type array")),
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Value::DoubleList),
        rmpv::Value::String(_) => elements
            .into_iter()
            .map(|e| match e {
                rmpv::Value::String(s) => s
                    .into_str()
                    .ok_or_else(|| DecodeError::payload("string is not valid UTF-8")),
                _ => Err(DecodeError::payload("mixed-type array")),
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Value::StringList),
        rmpv::Value::Ext(EXT_TIMESTAMP, _) => elements
            .into_iter()
            .map(|e| match e {
                rmpv::Value::Ext(EXT_TIMESTAMP, data) => timestamp_from_ext(&data),
                _ => Err(DecodeError::payload("mixed-type array")),
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Value::TimePointList),
        _ => Err(DecodeError::payload("unsupported array element type")),
    }
}

/// Equality follows wire semantics: the two integer tags compare by numeric
/// value so that a round-trip through the compact encoding stays equal.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int64(a), Value::Int64(b)) => a == b,
            (Value::UInt64(a), Value::UInt64(b)) => a == b,
            (Value::Int64(a), Value::UInt64(b)) | (Value::UInt64(b), Value::Int64(a)) => {
                u64::try_from(*a).is_ok_and(|a| a == *b)
            }
            (Value::Double(a), Value::Double(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::TimePoint(a), Value::TimePoint(b)) => a == b,
            (Value::Binary(a), Value::Binary(b)) => a == b,
            (Value::BoolList(a), Value::BoolList(b)) => a == b,
            (Value::Int64List(a), Value::Int64List(b)) => a == b,
            (Value::DoubleList(a), Value::DoubleList(b)) => a == b,
            (Value::StringList(a), Value::StringList(b)) => a == b,
            (Value::TimePointList(a), Value::TimePointList(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::Int64(v) => write!(f, "{v}"),
            Value::UInt64(v) => write!(f, "{v}"),
            Value::Double(v) => write!(f, "{v}"),
            Value::String(v) => write!(f, "{v}"),
            Value::TimePoint(v) => write!(f, "{v}"),
            Value::Binary(v) => write!(f, "<{} bytes>", v.len()),
            Value::BoolList(v) => write!(f, "{v:?}"),
            Value::Int64List(v) => write!(f, "{v:?}"),
            Value::DoubleList(v) => write!(f, "{v:?}"),
            Value::StringList(v) => write!(f, "{v:?}"),
            Value::TimePointList(v) => {
                let rendered: Vec<String> = v.iter().map(Timestamp::to_string).collect();
                write!(f, "{rendered:?}")
            }
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int64(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int64(i64::from(v))
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::UInt64(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::UInt64(u64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<Timestamp> for Value {
    fn from(v: Timestamp) -> Self {
        Value::TimePoint(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Binary(v)
    }
}

impl From<Vec<bool>> for Value {
    fn from(v: Vec<bool>) -> Self {
        Value::BoolList(v)
    }
}

impl From<Vec<i64>> for Value {
    fn from(v: Vec<i64>) -> Self {
        Value::Int64List(v)
    }
}

impl From<Vec<f64>> for Value {
    fn from(v: Vec<f64>) -> Self {
        Value::DoubleList(v)
    }
}

impl From<Vec<String>> for Value {
    fn from(v: Vec<String>) -> Self {
        Value::StringList(v)
    }
}

impl From<Vec<Timestamp>> for Value {
    fn from(v: Vec<Timestamp>) -> Self {
        Value::TimePointList(v)
    }
}

/// Typed extraction used by [`crate::config::Configuration::get`].
pub trait FromValue: Sized {
    fn from_value(value: &Value) -> Result<Self, ValueError>;
}

impl FromValue for bool {
    fn from_value(value: &Value) -> Result<Self, ValueError> {
        value.as_bool()
    }
}

impl FromValue for i64 {
    fn from_value(value: &Value) -> Result<Self, ValueError> {
        value.as_i64()
    }
}

impl FromValue for u64 {
    fn from_value(value: &Value) -> Result<Self, ValueError> {
        value.as_u64()
    }
}

impl FromValue for i32 {
    fn from_value(value: &Value) -> Result<Self, ValueError> {
        i32::try_from(value.as_i64()?).map_err(|_| ValueError::OutOfRange { target: "int32" })
    }
}

impl FromValue for u32 {
    fn from_value(value: &Value) -> Result<Self, ValueError> {
        u32::try_from(value.as_u64()?).map_err(|_| ValueError::OutOfRange { target: "uint32" })
    }
}

impl FromValue for u16 {
    fn from_value(value: &Value) -> Result<Self, ValueError> {
        u16::try_from(value.as_u64()?).map_err(|_| ValueError::OutOfRange { target: "uint16" })
    }
}

impl FromValue for f64 {
    fn from_value(value: &Value) -> Result<Self, ValueError> {
        value.as_f64()
    }
}

impl FromValue for String {
    fn from_value(value: &Value) -> Result<Self, ValueError> {
        value.as_str().map(str::to_owned)
    }
}

impl FromValue for Timestamp {
    fn from_value(value: &Value) -> Result<Self, ValueError> {
        value.as_timestamp()
    }
}

impl FromValue for Vec<u8> {
    fn from_value(value: &Value) -> Result<Self, ValueError> {
        value.as_binary().map(<[u8]>::to_vec)
    }
}

impl FromValue for Vec<bool> {
    fn from_value(value: &Value) -> Result<Self, ValueError> {
        match value {
            Value::BoolList(v) => Ok(v.clone()),
            other => Err(other.mismatch("bool_list")),
        }
    }
}

impl FromValue for Vec<i64> {
    fn from_value(value: &Value) -> Result<Self, ValueError> {
        match value {
            Value::Int64List(v) => Ok(v.clone()),
            other => Err(other.mismatch("int64_list")),
        }
    }
}

impl FromValue for Vec<f64> {
    fn from_value(value: &Value) -> Result<Self, ValueError> {
        match value {
            Value::DoubleList(v) => Ok(v.clone()),
            other => Err(other.mismatch("double_list")),
        }
    }
}

impl FromValue for Vec<String> {
    fn from_value(value: &Value) -> Result<Self, ValueError> {
        match value {
            Value::StringList(v) => Ok(v.clone()),
            other => Err(other.mismatch("string_list")),
        }
    }
}

impl FromValue for Vec<Timestamp> {
    fn from_value(value: &Value) -> Result<Self, ValueError> {
        match value {
            Value::TimePointList(v) => Ok(v.clone()),
            other => Err(other.mismatch("timepoint_list")),
        }
    }
}

fn timestamp_to_mp(ts: Timestamp) -> rmpv::Value {
    // Official timestamp extension size rules: ts32 when the nanoseconds are
    // zero and the seconds fit 32 bits, ts64 when the pair fits the packed
    // 34/30-bit split, ts96 otherwise.
    if ts.secs >= 0 && (ts.secs >> 34) == 0 {
        let packed = (u64::from(ts.nanos) << 34) | ts.secs as u64;
        if packed & 0xffff_ffff_0000_0000 == 0 {
            rmpv::Value::Ext(EXT_TIMESTAMP, (packed as u32).to_be_bytes().to_vec())
        } else {
            rmpv::Value::Ext(EXT_TIMESTAMP, packed.to_be_bytes().to_vec())
        }
    } else {
        let mut data = Vec::with_capacity(12);
        data.extend_from_slice(&ts.nanos.to_be_bytes());
        data.extend_from_slice(&ts.secs.to_be_bytes());
        rmpv::Value::Ext(EXT_TIMESTAMP, data)
    }
}

fn timestamp_from_ext(data: &[u8]) -> Result<Timestamp, DecodeError> {
    match data.len() {
        4 => {
            let secs = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
            Ok(Timestamp::new(i64::from(secs), 0))
        }
        8 => {
            let packed = u64::from_be_bytes([
                data[0], data[1], data[2], data[3], data[4], data[5], data[6], data[7],
            ]);
            Ok(Timestamp::new(
                (packed & 0x3_ffff_ffff) as i64,
                (packed >> 34) as u32,
            ))
        }
        12 => {
            let nanos = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
            let secs = i64::from_be_bytes([
                data[4], data[5], data[6], data[7], data[8], data[9], data[10], data[11],
            ]);
            Ok(Timestamp::new(secs, nanos))
        }
        other => Err(DecodeError::Length {
            expected: 12,
            got: other,
        }),
    }
}

/// Append one MessagePack object to `buf`. Writing into a `Vec` cannot fail.
pub(crate) fn write_mp(buf: &mut Vec<u8>, value: &rmpv::Value) {
    rmpv::encode::write_value(buf, value).expect("write to Vec");
}

/// Read the next MessagePack object from the cursor.
pub(crate) fn read_mp(cursor: &mut Cursor<&[u8]>) -> Result<rmpv::Value, DecodeError> {
    rmpv::decode::read_value(cursor).map_err(DecodeError::from)
}

/// Fail when a cursor has unread bytes after the final object.
pub(crate) fn expect_consumed(cursor: &Cursor<&[u8]>) -> Result<(), DecodeError> {
    let total = cursor.get_ref().len();
    let read = cursor.position() as usize;
    if read != total {
        return Err(DecodeError::Length {
            expected: read,
            got: total,
        });
    }
    Ok(())
}

pub(crate) fn mp_str(value: rmpv::Value, field: &'static str) -> Result<String, DecodeError> {
    match value {
        rmpv::Value::String(s) => s
            .into_str()
            .ok_or_else(|| DecodeError::payload(format!("{field} is not valid UTF-8"))),
        _ => Err(DecodeError::payload(format!("{field} is not a string"))),
    }
}

pub(crate) fn mp_u64(value: rmpv::Value, field: &'static str) -> Result<u64, DecodeError> {
    match value {
        rmpv::Value::Integer(i) => i
            .as_u64()
            .ok_or_else(|| DecodeError::payload(format!("{field} is negative"))),
        _ => Err(DecodeError::payload(format!("{field} is not an integer"))),
    }
}

pub(crate) fn mp_timestamp(value: rmpv::Value, field: &'static str) -> Result<Timestamp, DecodeError> {
    match value {
        rmpv::Value::Ext(EXT_TIMESTAMP, data) => timestamp_from_ext(&data),
        _ => Err(DecodeError::payload(format!("{field} is not a timestamp"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_round_trips() {
        for value in [
            Value::Null,
            Value::Bool(true),
            Value::Int64(-42),
            Value::Int64(i64::MIN),
            Value::UInt64(7),
            Value::UInt64(u64::MAX),
            Value::Double(3.25),
            Value::String("orbit".into()),
            Value::TimePoint(Timestamp::new(1_700_000_000, 123_456_789)),
            Value::Binary(vec![0xde, 0xad, 0xbe, 0xef]),
        ] {
            let decoded = Value::disassemble(&value.assemble()).unwrap();
            assert_eq!(decoded, value, "round trip failed for {}", value.type_name());
        }
    }

    #[test]
    fn list_round_trips() {
        for value in [
            Value::BoolList(vec![true, false]),
            Value::Int64List(vec![1, -2, 3]),
            Value::DoubleList(vec![0.5, -1.5]),
            Value::StringList(vec!["a".into(), "b".into()]),
            Value::TimePointList(vec![Timestamp::new(12, 0), Timestamp::new(-1, 999)]),
        ] {
            let decoded = Value::disassemble(&value.assemble()).unwrap();
            assert_eq!(decoded, value);
        }
    }

    #[test]
    fn timestamp_encodings_cover_all_widths() {
        // ts32: second-aligned, fits 32 bits
        let ts32 = Timestamp::new(1_000_000, 0);
        // ts64: nanoseconds present
        let ts64 = Timestamp::new(1_000_000, 42);
        // ts96: pre-epoch
        let ts96 = Timestamp::new(-5, 7);

        for ts in [ts32, ts64, ts96] {
            let value = Value::TimePoint(ts);
            assert_eq!(Value::disassemble(&value.assemble()).unwrap(), value);
        }

        assert_eq!(Value::TimePoint(ts32).assemble().len(), 6); // fixext4
        assert_eq!(Value::TimePoint(ts64).assemble().len(), 10); // fixext8
        assert_eq!(Value::TimePoint(ts96).assemble().len(), 15); // ext8 + 12
    }

    #[test]
    fn type_mismatch_reported() {
        let value = Value::String("x".into());
        let err = value.as_i64().unwrap_err();
        assert!(matches!(err, ValueError::TypeMismatch { .. }));
    }

    #[test]
    fn narrowing_out_of_range() {
        let value = Value::Int64(70_000);
        assert!(matches!(
            u16::from_value(&value),
            Err(ValueError::OutOfRange { .. })
        ));
        assert_eq!(u32::from_value(&value).unwrap(), 70_000);
    }

    #[test]
    fn enum_domain_matching() {
        let value = Value::String("Rising".into());
        assert_eq!(value.as_enum(&["rising", "falling"]).unwrap(), "rising");
        assert!(matches!(
            value.as_enum(&["high", "low"]),
            Err(ValueError::InvalidEnum { .. })
        ));
    }

    #[test]
    fn signedness_is_not_observable_after_round_trip() {
        // a positive int64 encodes compactly and decodes as int64 again
        let decoded = Value::disassemble(&Value::UInt64(5).assemble()).unwrap();
        assert_eq!(decoded, Value::UInt64(5));
        assert_eq!(decoded, Value::Int64(5));
    }

    #[test]
    fn trailing_garbage_rejected() {
        let mut bytes = Value::Bool(true).assemble();
        bytes.push(0x00);
        assert!(Value::disassemble(&bytes).is_err());
    }

    #[test]
    fn mixed_array_rejected() {
        // [1, "x"] is not a homogeneous list
        let mp = rmpv::Value::Array(vec![rmpv::Value::from(1i64), rmpv::Value::from("x")]);
        let mut buf = Vec::new();
        write_mp(&mut buf, &mp);
        assert!(Value::disassemble(&buf).is_err());
    }
}
