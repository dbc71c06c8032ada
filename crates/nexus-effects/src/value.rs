//! Value codec - typed property values to and from their wire form
//!
//! Every payload is preceded by a one-byte type tag, so an encoded value is
//! self-describing:
//!
//! ```text
//! Null     [0x00]
//! Boolean  [0x01][0|1]
//! Integer  [0x02][i64 LE]
//! Double   [0x03][f64 LE]
//! String   [0x04][len:u32 LE][utf-8 bytes]
//! Array    [0x05][count:u32 LE][element]*
//! Point    [0x06][latitude:f64 LE][longitude:f64 LE]
//! ```
//!
//! Tag `0xFF` is the attribute tombstone. It is only legal where an
//! attribute value is expected (see [`encode_attribute`]).

use crate::{Error, Result};
use bytes::BufMut;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Tag of the Null value
pub const TAG_NULL: u8 = 0x00;
/// Tag of a Boolean value
pub const TAG_BOOL: u8 = 0x01;
/// Tag of an Integer value
pub const TAG_INTEGER: u8 = 0x02;
/// Tag of a Double value
pub const TAG_DOUBLE: u8 = 0x03;
/// Tag of a String value
pub const TAG_STRING: u8 = 0x04;
/// Tag of an Array value
pub const TAG_ARRAY: u8 = 0x05;
/// Tag of a Point value
pub const TAG_POINT: u8 = 0x06;
/// Tag marking a deleted attribute
pub const TAG_TOMBSTONE: u8 = 0xFF;

/// Geographic point, stored as (latitude, longitude)
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Point {
    /// Latitude in degrees, [-90, 90]
    pub latitude: f64,
    /// Longitude in degrees, [-180, 180]
    pub longitude: f64,
}

impl Point {
    /// Create a new point
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Check the coordinates are finite and inside the WGS84 ranges
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }
}

impl PartialEq for Point {
    fn eq(&self, other: &Self) -> bool {
        self.latitude.to_bits() == other.latitude.to_bits()
            && self.longitude.to_bits() == other.longitude.to_bits()
    }
}

/// Property value attached to a node or edge attribute
///
/// Doubles compare bit-exactly, so a value always equals its own
/// round-trip through the codec (NaN and -0.0 included).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PropertyValue {
    /// Null value
    Null,
    /// Boolean value
    Boolean(bool),
    /// 64-bit signed integer
    Integer(i64),
    /// IEEE-754 64-bit floating point
    Double(f64),
    /// UTF-8 string
    String(String),
    /// Ordered, possibly nested, sequence of values
    Array(Vec<PropertyValue>),
    /// Geographic point
    Point(Point),
}

impl PartialEq for PropertyValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Boolean(a), Self::Boolean(b)) => a == b,
            (Self::Integer(a), Self::Integer(b)) => a == b,
            (Self::Double(a), Self::Double(b)) => a.to_bits() == b.to_bits(),
            (Self::String(a), Self::String(b)) => a == b,
            (Self::Array(a), Self::Array(b)) => a == b,
            (Self::Point(a), Self::Point(b)) => a == b,
            _ => false,
        }
    }
}

impl PropertyValue {
    /// Type tag written before the payload
    pub fn tag(&self) -> u8 {
        match self {
            Self::Null => TAG_NULL,
            Self::Boolean(_) => TAG_BOOL,
            Self::Integer(_) => TAG_INTEGER,
            Self::Double(_) => TAG_DOUBLE,
            Self::String(_) => TAG_STRING,
            Self::Array(_) => TAG_ARRAY,
            Self::Point(_) => TAG_POINT,
        }
    }

    /// Name of the value type, for diagnostics
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Boolean(_) => "boolean",
            Self::Integer(_) => "integer",
            Self::Double(_) => "double",
            Self::String(_) => "string",
            Self::Array(_) => "array",
            Self::Point(_) => "point",
        }
    }

    /// Check if this is the Null value
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Boolean(b) => write!(f, "{}", b),
            Self::Integer(i) => write!(f, "{}", i),
            Self::Double(d) => write!(f, "{}", d),
            Self::String(s) => write!(f, "'{}'", s),
            Self::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Self::Point(p) => write!(
                f,
                "point({{latitude: {}, longitude: {}}})",
                p.latitude, p.longitude
            ),
        }
    }
}

impl From<i64> for PropertyValue {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<f64> for PropertyValue {
    fn from(v: f64) -> Self {
        Self::Double(v)
    }
}

impl From<bool> for PropertyValue {
    fn from(v: bool) -> Self {
        Self::Boolean(v)
    }
}

impl From<&str> for PropertyValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<Point> for PropertyValue {
    fn from(v: Point) -> Self {
        Self::Point(v)
    }
}

impl From<Vec<PropertyValue>> for PropertyValue {
    fn from(v: Vec<PropertyValue>) -> Self {
        Self::Array(v)
    }
}

/// Size limits checked before a value or batch leaves the master
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncodeLimits {
    /// Maximum string length in bytes
    pub max_string_bytes: usize,
    /// Maximum number of elements in one array
    pub max_array_len: usize,
    /// Maximum array nesting depth
    pub max_array_depth: usize,
    /// Maximum labels on a created node
    pub max_labels: usize,
    /// Maximum attributes in a created entity's attribute set
    pub max_attributes: usize,
    /// Maximum effects in one batch
    pub max_batch_effects: usize,
}

impl Default for EncodeLimits {
    fn default() -> Self {
        Self {
            max_string_bytes: 512 * 1024 * 1024,
            max_array_len: 16 * 1024 * 1024,
            max_array_depth: 32,
            max_labels: u16::MAX as usize,
            max_attributes: u16::MAX as usize,
            max_batch_effects: u32::MAX as usize,
        }
    }
}

impl EncodeLimits {
    /// Validate the limits fit the fixed-width fields of the wire format
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.max_string_bytes > u32::MAX as usize {
            return Err("max_string_bytes cannot exceed u32::MAX".into());
        }
        if self.max_array_len > u32::MAX as usize {
            return Err("max_array_len cannot exceed u32::MAX".into());
        }
        if self.max_labels > u16::MAX as usize {
            return Err("max_labels cannot exceed u16::MAX".into());
        }
        if self.max_attributes > u16::MAX as usize {
            return Err("max_attributes cannot exceed u16::MAX".into());
        }
        if self.max_batch_effects > u32::MAX as usize {
            return Err("max_batch_effects cannot exceed u32::MAX".into());
        }
        if self.max_array_depth == 0 {
            return Err("max_array_depth must be at least 1".into());
        }
        Ok(())
    }
}

/// Encode a value with the default limits
pub fn encode(value: &PropertyValue) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    encode_into(value, &mut buf, &EncodeLimits::default())?;
    Ok(buf)
}

/// Append the encoding of `value` to `buf`
///
/// On error `buf` may hold a partial encoding; callers abort the whole
/// batch in that case.
pub fn encode_into(value: &PropertyValue, buf: &mut Vec<u8>, limits: &EncodeLimits) -> Result<()> {
    encode_nested(value, buf, limits, 0)
}

fn encode_nested(
    value: &PropertyValue,
    buf: &mut Vec<u8>,
    limits: &EncodeLimits,
    depth: usize,
) -> Result<()> {
    buf.put_u8(value.tag());
    match value {
        PropertyValue::Null => {}
        PropertyValue::Boolean(b) => buf.put_u8(u8::from(*b)),
        PropertyValue::Integer(i) => buf.put_i64_le(*i),
        PropertyValue::Double(d) => buf.put_f64_le(*d),
        PropertyValue::String(s) => {
            if s.len() > limits.max_string_bytes {
                return Err(Error::encode(format!(
                    "String too large: {} bytes (max: {})",
                    s.len(),
                    limits.max_string_bytes
                )));
            }
            put_str(buf, s)?;
        }
        PropertyValue::Array(items) => {
            if depth >= limits.max_array_depth {
                return Err(Error::encode(format!(
                    "Array nesting exceeds depth {}",
                    limits.max_array_depth
                )));
            }
            if items.len() > limits.max_array_len {
                return Err(Error::encode(format!(
                    "Array too large: {} elements (max: {})",
                    items.len(),
                    limits.max_array_len
                )));
            }
            buf.put_u32_le(checked_u32(items.len(), "array length")?);
            for item in items {
                encode_nested(item, buf, limits, depth + 1)?;
            }
        }
        PropertyValue::Point(p) => {
            if !p.is_valid() {
                return Err(Error::encode(format!(
                    "Point out of range: latitude {}, longitude {}",
                    p.latitude, p.longitude
                )));
            }
            buf.put_f64_le(p.latitude);
            buf.put_f64_le(p.longitude);
        }
    }
    Ok(())
}

/// Decode one value starting at `offset`, returning it and the offset just
/// past its encoding
pub fn decode(buf: &[u8], offset: usize) -> Result<(PropertyValue, usize)> {
    let mut reader = WireReader::at(buf, offset);
    let value = reader.value(EncodeLimits::default().max_array_depth)?;
    Ok((value, reader.offset()))
}

/// Encode an attribute value, `None` being the tombstone of a deleted key
pub fn encode_attribute(
    value: Option<&PropertyValue>,
    buf: &mut Vec<u8>,
    limits: &EncodeLimits,
) -> Result<()> {
    match value {
        Some(v) => encode_into(v, buf, limits),
        None => {
            buf.put_u8(TAG_TOMBSTONE);
            Ok(())
        }
    }
}

pub(crate) fn put_str(buf: &mut Vec<u8>, s: &str) -> Result<()> {
    buf.put_u32_le(checked_u32(s.len(), "string length")?);
    buf.put_slice(s.as_bytes());
    Ok(())
}

pub(crate) fn checked_u32(n: usize, what: &str) -> Result<u32> {
    u32::try_from(n).map_err(|_| Error::encode(format!("{} {} does not fit in u32", what, n)))
}

pub(crate) fn checked_u16(n: usize, what: &str) -> Result<u16> {
    u16::try_from(n).map_err(|_| Error::encode(format!("{} {} does not fit in u16", what, n)))
}

/// Bounds-checked little-endian reader over an effect buffer
pub(crate) struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub(crate) fn at(buf: &'a [u8], pos: usize) -> Self {
        Self { buf, pos }
    }

    pub(crate) fn offset(&self) -> usize {
        self.pos
    }

    pub(crate) fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    pub(crate) fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(Error::decode(format!(
                "Truncated buffer: need {} bytes at offset {}, have {}",
                n,
                self.pos,
                self.remaining()
            )));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub(crate) fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    pub(crate) fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    pub(crate) fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    pub(crate) fn i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.array()?))
    }

    pub(crate) fn f64(&mut self) -> Result<f64> {
        Ok(f64::from_le_bytes(self.array()?))
    }

    pub(crate) fn string(&mut self) -> Result<String> {
        let len = self.u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| Error::decode(format!("Invalid UTF-8 in string: {}", e)))
    }

    pub(crate) fn value(&mut self, max_depth: usize) -> Result<PropertyValue> {
        let tag = self.u8()?;
        self.value_with_tag(tag, max_depth, 0)
    }

    /// Attribute value or tombstone (`None`)
    pub(crate) fn attribute(&mut self, max_depth: usize) -> Result<Option<PropertyValue>> {
        let tag = self.u8()?;
        if tag == TAG_TOMBSTONE {
            return Ok(None);
        }
        self.value_with_tag(tag, max_depth, 0).map(Some)
    }

    fn value_with_tag(&mut self, tag: u8, max_depth: usize, depth: usize) -> Result<PropertyValue> {
        match tag {
            TAG_NULL => Ok(PropertyValue::Null),
            TAG_BOOL => match self.u8()? {
                0 => Ok(PropertyValue::Boolean(false)),
                1 => Ok(PropertyValue::Boolean(true)),
                other => Err(Error::decode(format!("Invalid boolean byte: {}", other))),
            },
            TAG_INTEGER => Ok(PropertyValue::Integer(self.i64()?)),
            TAG_DOUBLE => Ok(PropertyValue::Double(self.f64()?)),
            TAG_STRING => Ok(PropertyValue::String(self.string()?)),
            TAG_ARRAY => {
                if depth >= max_depth {
                    return Err(Error::decode(format!(
                        "Array nesting exceeds depth {}",
                        max_depth
                    )));
                }
                let count = self.u32()? as usize;
                // every element needs at least its tag byte
                if count > self.remaining() {
                    return Err(Error::decode(format!(
                        "Array declares {} elements but only {} bytes remain",
                        count,
                        self.remaining()
                    )));
                }
                let mut items = Vec::with_capacity(count);
                for _ in 0..count {
                    let tag = self.u8()?;
                    items.push(self.value_with_tag(tag, max_depth, depth + 1)?);
                }
                Ok(PropertyValue::Array(items))
            }
            TAG_POINT => {
                let latitude = self.f64()?;
                let longitude = self.f64()?;
                let point = Point::new(latitude, longitude);
                if !point.is_valid() {
                    return Err(Error::decode(format!(
                        "Point out of range: latitude {}, longitude {}",
                        latitude, longitude
                    )));
                }
                Ok(PropertyValue::Point(point))
            }
            TAG_TOMBSTONE => Err(Error::decode("Tombstone outside attribute position")),
            other => Err(Error::decode(format!("Unknown value tag: 0x{:02x}", other))),
        }
    }
}
