//! YANG data type definitions and conversions
//!
//! Leaf values move between their RFC 7951 JSON form and their RFC 9254
//! CBOR form here. Inside unions, enumeration, bits and identityref values
//! carry CBOR tags 44, 43 and 45 so the decoder can tell members apart.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use ciborium::Value as Cbor;
use serde_json::Value;

use crate::bimap::BiMap;
use crate::error::{CoreconfError, Result};
use crate::sid::SidTable;

const TAG_BITS: u64 = 43;
const TAG_ENUM: u64 = 44;
const TAG_IDENTITYREF: u64 = 45;

/// Represents YANG built-in types, with their type-specific metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum YangType {
    String,
    Int8,
    Int16,
    Int32,
    Int64,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Decimal64 { fraction_digits: u8 },
    Binary,
    Boolean,
    Empty,
    Identityref { base: Option<String> },
    /// Only left in place when the target leaf could not be found
    Leafref { path: Option<String> },
    InstanceIdentifier,
    /// Bit name to bit position
    Bits(BiMap<String, u32>),
    /// Enum name to value
    Enumeration(BiMap<String, i64>),
    /// Members tried in declared order
    Union(Vec<LeafType>),
    /// Unknown/unrecognized type
    Unknown(String),
}

impl YangType {
    /// Map a built-in type name; `None` means "not built in" (a typedef)
    pub fn builtin(name: &str) -> Option<Self> {
        let t = match name {
            "string" => YangType::String,
            "int8" => YangType::Int8,
            "int16" => YangType::Int16,
            "int32" => YangType::Int32,
            "int64" => YangType::Int64,
            "uint8" => YangType::Uint8,
            "uint16" => YangType::Uint16,
            "uint32" => YangType::Uint32,
            "uint64" => YangType::Uint64,
            "decimal64" => YangType::Decimal64 { fraction_digits: 0 },
            "binary" => YangType::Binary,
            "boolean" => YangType::Boolean,
            "empty" => YangType::Empty,
            "identityref" => YangType::Identityref { base: None },
            "leafref" => YangType::Leafref { path: None },
            "instance-identifier" => YangType::InstanceIdentifier,
            "bits" => YangType::Bits(BiMap::new()),
            "enumeration" => YangType::Enumeration(BiMap::new()),
            "union" => YangType::Union(Vec::new()),
            _ => return None,
        };
        Some(t)
    }

    fn from_string(s: &str) -> Self {
        Self::builtin(s).unwrap_or_else(|| YangType::Unknown(s.to_string()))
    }

    fn int_bounds(&self) -> Option<(i128, i128)> {
        let bounds = match self {
            YangType::Int8 => (i8::MIN as i128, i8::MAX as i128),
            YangType::Int16 => (i16::MIN as i128, i16::MAX as i128),
            YangType::Int32 => (i32::MIN as i128, i32::MAX as i128),
            YangType::Int64 => (i64::MIN as i128, i64::MAX as i128),
            YangType::Uint8 => (0, u8::MAX as i128),
            YangType::Uint16 => (0, u16::MAX as i128),
            YangType::Uint32 => (0, u32::MAX as i128),
            YangType::Uint64 => (0, u64::MAX as i128),
            _ => return None,
        };
        Some(bounds)
    }
}

/// `range`/`length` restriction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeSet {
    pub raw: String,
    /// `None` when the expression has non-integer bounds (not enforced)
    intervals: Option<Vec<(i128, i128)>>,
}

impl RangeSet {
    pub fn parse(raw: &str) -> Self {
        let intervals = raw
            .split('|')
            .map(|part| {
                let part = part.trim();
                let (lo, hi) = part.split_once("..").unwrap_or((part, part));
                Some((parse_bound(lo.trim())?, parse_bound(hi.trim())?))
            })
            .collect();
        Self {
            raw: raw.to_string(),
            intervals,
        }
    }

    pub fn contains(&self, n: i128) -> bool {
        match &self.intervals {
            Some(intervals) => intervals.iter().any(|&(lo, hi)| lo <= n && n <= hi),
            None => true,
        }
    }
}

fn parse_bound(s: &str) -> Option<i128> {
    match s {
        "min" => Some(i128::MIN),
        "max" => Some(i128::MAX),
        _ => s.parse().ok(),
    }
}

/// A leaf's resolved type: base type plus restrictions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafType {
    pub base: YangType,
    pub range: Option<RangeSet>,
    pub length: Option<RangeSet>,
    pub patterns: Vec<String>,
}

impl LeafType {
    pub fn new(base: YangType) -> Self {
        Self {
            base,
            range: None,
            length: None,
            patterns: Vec::new(),
        }
    }

    /// Parse the `type` field of a SID file item
    pub fn from_sid_type(type_value: &Value) -> Self {
        let base = match type_value {
            Value::String(s) => YangType::from_string(s),
            Value::Object(map) => {
                // Enumeration: {"value": "name", ...}
                let enums: BiMap<String, i64> = map
                    .iter()
                    .filter_map(|(k, v)| {
                        let name = v.as_str()?;
                        Some((name.to_string(), k.parse().ok()?))
                    })
                    .collect();
                YangType::Enumeration(enums)
            }
            Value::Array(arr) => YangType::Union(arr.iter().map(Self::from_sid_type).collect()),
            _ => YangType::Unknown("invalid".to_string()),
        };
        Self::new(base)
    }

    fn check_range(&self, n: i128, path: &str) -> Result<()> {
        if let Some((lo, hi)) = self.base.int_bounds()
            && (n < lo || n > hi)
        {
            return Err(CoreconfError::type_conversion(
                path,
                format!("{n} out of bounds for {:?}", self.base),
            ));
        }
        if let Some(range) = &self.range
            && !range.contains(n)
        {
            return Err(CoreconfError::type_conversion(
                path,
                format!("{n} outside range {}", range.raw),
            ));
        }
        Ok(())
    }

    fn check_length(&self, len: usize, path: &str) -> Result<()> {
        if let Some(length) = &self.length
            && !length.contains(len as i128)
        {
            return Err(CoreconfError::type_conversion(
                path,
                format!("length {len} outside {}", length.raw),
            ));
        }
        Ok(())
    }
}

/// Cast a JSON value to CORECONF representation based on YANG type
pub fn cast_to_coreconf(value: &Value, ty: &LeafType, sids: &SidTable, path: &str) -> Result<Cbor> {
    encode_leaf(value, ty, sids, path, false)
}

fn encode_leaf(
    value: &Value,
    ty: &LeafType,
    sids: &SidTable,
    path: &str,
    in_union: bool,
) -> Result<Cbor> {
    let mismatch = |expected: &str| {
        CoreconfError::type_conversion(path, format!("expected {expected}, got {value}"))
    };

    match &ty.base {
        YangType::String => {
            let s = value.as_str().ok_or_else(|| mismatch("string"))?;
            ty.check_length(s.chars().count(), path)?;
            Ok(Cbor::Text(s.to_string()))
        }

        YangType::Int8 | YangType::Int16 | YangType::Int32 | YangType::Uint8 | YangType::Uint16
        | YangType::Uint32 => {
            let n = json_integer(value).ok_or_else(|| mismatch("integer"))?;
            ty.check_range(n, path)?;
            cbor_integer(n, path)
        }

        YangType::Int64 | YangType::Uint64 => {
            let n = match value {
                Value::String(s) => s.parse::<i128>().ok(),
                other => json_integer(other),
            }
            .ok_or_else(|| mismatch("64-bit integer"))?;
            ty.check_range(n, path)?;
            cbor_integer(n, path)
        }

        YangType::Decimal64 { fraction_digits } => {
            let text = match value {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                _ => return Err(mismatch("decimal64")),
            };
            let scaled = parse_decimal(&text, *fraction_digits)
                .ok_or_else(|| mismatch(&format!("decimal64 with {fraction_digits} digits")))?;
            Ok(Cbor::Integer(scaled.into()))
        }

        YangType::Binary => {
            let s = value.as_str().ok_or_else(|| mismatch("base64 string"))?;
            let bytes = BASE64
                .decode(s)
                .map_err(|e| CoreconfError::type_conversion(path, format!("base64 decode: {e}")))?;
            ty.check_length(bytes.len(), path)?;
            Ok(Cbor::Bytes(bytes))
        }

        YangType::Boolean => value.as_bool().map(Cbor::Bool).ok_or_else(|| mismatch("boolean")),

        YangType::Empty => match value {
            Value::Null => Ok(Cbor::Null),
            Value::Array(a) if a.len() == 1 && a[0].is_null() => Ok(Cbor::Null),
            _ => Err(mismatch("[null]")),
        },

        YangType::Identityref { .. } => {
            let s = value.as_str().ok_or_else(|| mismatch("identity"))?;
            // Identities of the leaf's own module may be written unqualified
            let qualified = match enclosing_module(path) {
                Some(module) if !s.contains(':') => format!("{module}:{s}"),
                _ => s.to_string(),
            };
            let sid = sids.get_sid(&qualified).ok_or_else(|| {
                CoreconfError::type_conversion(path, format!("identity '{s}' has no SID"))
            })?;
            Ok(tagged(TAG_IDENTITYREF, Cbor::Integer(sid.into()), in_union))
        }

        YangType::Enumeration(enums) => {
            let v = match value {
                Value::String(s) => enums.get_by_left(s).copied(),
                Value::Number(n) => n.as_i64().filter(|v| enums.get_by_right(v).is_some()),
                _ => None,
            }
            .ok_or_else(|| mismatch("enumeration member"))?;
            Ok(tagged(TAG_ENUM, Cbor::Integer(v.into()), in_union))
        }

        YangType::Bits(bits) => {
            let s = value.as_str().ok_or_else(|| mismatch("bits string"))?;
            let mut bytes: Vec<u8> = Vec::new();
            for name in s.split_whitespace() {
                let pos = *bits.get_by_left(&name.to_string()).ok_or_else(|| {
                    CoreconfError::type_conversion(path, format!("unknown bit '{name}'"))
                })? as usize;
                if bytes.len() <= pos / 8 {
                    bytes.resize(pos / 8 + 1, 0);
                }
                bytes[pos / 8] |= 1 << (pos % 8);
            }
            Ok(tagged(TAG_BITS, Cbor::Bytes(bytes), in_union))
        }

        YangType::Union(members) => members
            .iter()
            .find_map(|member| encode_leaf(value, member, sids, path, true).ok())
            .ok_or_else(|| mismatch("a value accepted by a union member")),

        YangType::Leafref { .. } | YangType::InstanceIdentifier | YangType::Unknown(_) => {
            json_to_cbor(value, path)
        }
    }
}

/// Module of the innermost qualified segment of `/mod:a/b/mod2:c`
fn enclosing_module(path: &str) -> Option<&str> {
    path.rsplit('/')
        .filter_map(|segment| segment.split('[').next()?.split_once(':'))
        .map(|(module, _)| module)
        .next()
}

fn tagged(tag: u64, value: Cbor, in_union: bool) -> Cbor {
    if in_union {
        Cbor::Tag(tag, Box::new(value))
    } else {
        value
    }
}

/// Cast a CORECONF value back to JSON representation based on YANG type
pub fn cast_from_coreconf(value: &Cbor, ty: &LeafType, sids: &SidTable, path: &str) -> Result<Value> {
    decode_leaf(value, ty, sids, path)
}

fn decode_leaf(value: &Cbor, ty: &LeafType, sids: &SidTable, path: &str) -> Result<Value> {
    let mismatch = |expected: &str| {
        CoreconfError::type_conversion(path, format!("expected {expected}, got {value:?}"))
    };

    match &ty.base {
        YangType::String => match value {
            Cbor::Text(s) => Ok(Value::String(s.clone())),
            _ => Err(mismatch("text")),
        },

        YangType::Int8 | YangType::Int16 | YangType::Int32 | YangType::Uint8 | YangType::Uint16
        | YangType::Uint32 => {
            let n = cbor_integer_value(value).ok_or_else(|| mismatch("integer"))?;
            ty.check_range(n, path)?;
            json_number(n, path)
        }

        YangType::Int64 | YangType::Uint64 => {
            let n = cbor_integer_value(value).ok_or_else(|| mismatch("integer"))?;
            ty.check_range(n, path)?;
            Ok(Value::String(n.to_string()))
        }

        YangType::Decimal64 { fraction_digits } => match value {
            Cbor::Integer(i) => Ok(Value::String(format_decimal(i128::from(*i), *fraction_digits))),
            Cbor::Float(f) => Ok(Value::String(format!("{:.*}", *fraction_digits as usize, f))),
            _ => Err(mismatch("scaled integer")),
        },

        YangType::Binary => match value {
            Cbor::Bytes(b) => Ok(Value::String(BASE64.encode(b))),
            _ => Err(mismatch("byte string")),
        },

        YangType::Boolean => match value {
            Cbor::Bool(b) => Ok(Value::Bool(*b)),
            _ => Err(mismatch("boolean")),
        },

        YangType::Empty => match value {
            Cbor::Null => Ok(Value::Array(vec![Value::Null])),
            _ => Err(mismatch("null")),
        },

        YangType::Identityref { .. } => match untag(value, TAG_IDENTITYREF) {
            Cbor::Integer(i) => {
                let sid = i64::try_from(*i).map_err(|_| mismatch("SID"))?;
                sids.get_identifier(sid)
                    .map(|id| Value::String(id.to_string()))
                    .ok_or(CoreconfError::IdentifierNotFound(sid))
            }
            Cbor::Text(s) => Ok(Value::String(s.clone())),
            _ => Err(mismatch("identity SID")),
        },

        YangType::Enumeration(enums) => match untag(value, TAG_ENUM) {
            Cbor::Integer(i) => {
                let v = i64::try_from(*i).map_err(|_| mismatch("enum value"))?;
                enums
                    .get_by_right(&v)
                    .map(|name| Value::String(name.clone()))
                    .ok_or_else(|| mismatch("enumeration member"))
            }
            Cbor::Text(s) if enums.contains_left(s) => Ok(Value::String(s.clone())),
            _ => Err(mismatch("enumeration member")),
        },

        YangType::Bits(bits) => match untag(value, TAG_BITS) {
            Cbor::Bytes(bytes) => {
                let mut names = Vec::new();
                for (name, &pos) in bits.iter() {
                    let byte = bytes.get(pos as usize / 8).copied().unwrap_or(0);
                    if byte & (1 << (pos % 8)) != 0 {
                        names.push(name.clone());
                    }
                }
                Ok(Value::String(names.join(" ")))
            }
            _ => Err(mismatch("bits byte string")),
        },

        YangType::Union(members) => {
            let tag = match value {
                Cbor::Tag(t, _) if matches!(*t, TAG_BITS | TAG_ENUM | TAG_IDENTITYREF) => Some(*t),
                _ => None,
            };
            members
                .iter()
                .filter(|m| {
                    tag.is_none()
                        || union_tag(&m.base) == tag
                        || matches!(m.base, YangType::Union(_))
                })
                .find_map(|member| decode_leaf(value, member, sids, path).ok())
                .ok_or_else(|| mismatch("a value accepted by a union member"))
        }

        YangType::Leafref { .. } | YangType::InstanceIdentifier | YangType::Unknown(_) => {
            cbor_to_json(value, path)
        }
    }
}

fn union_tag(ty: &YangType) -> Option<u64> {
    match ty {
        YangType::Bits(_) => Some(TAG_BITS),
        YangType::Enumeration(_) => Some(TAG_ENUM),
        YangType::Identityref { .. } => Some(TAG_IDENTITYREF),
        _ => None,
    }
}

fn untag(value: &Cbor, tag: u64) -> &Cbor {
    match value {
        Cbor::Tag(t, inner) if *t == tag => inner,
        other => other,
    }
}

fn json_integer(value: &Value) -> Option<i128> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .map(i128::from)
            .or_else(|| n.as_u64().map(i128::from)),
        _ => None,
    }
}

fn cbor_integer_value(value: &Cbor) -> Option<i128> {
    match value {
        Cbor::Integer(i) => Some(i128::from(*i)),
        _ => None,
    }
}

fn cbor_integer(n: i128, path: &str) -> Result<Cbor> {
    ciborium::value::Integer::try_from(n)
        .map(Cbor::Integer)
        .map_err(|_| CoreconfError::type_conversion(path, format!("{n} does not fit CBOR")))
}

fn json_number(n: i128, path: &str) -> Result<Value> {
    if let Ok(v) = i64::try_from(n) {
        Ok(Value::Number(v.into()))
    } else if let Ok(v) = u64::try_from(n) {
        Ok(Value::Number(v.into()))
    } else {
        Err(CoreconfError::type_conversion(path, format!("{n} does not fit JSON")))
    }
}

/// Parse a decimal string into an integer scaled by `10^digits`
fn parse_decimal(text: &str, digits: u8) -> Option<i64> {
    let text = text.trim();
    let (negative, body) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text.strip_prefix('+').unwrap_or(text)),
    };
    let (int_part, frac_part) = body.split_once('.').unwrap_or((body, ""));
    if int_part.is_empty() && frac_part.is_empty() {
        return None;
    }
    if !int_part.chars().all(|c| c.is_ascii_digit()) || !frac_part.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let frac_trimmed = frac_part.trim_end_matches('0');
    if frac_trimmed.len() > digits as usize {
        return None;
    }

    let mut scaled: i128 = if int_part.is_empty() { 0 } else { int_part.parse().ok()? };
    let mut frac_digits = frac_trimmed.chars();
    for _ in 0..digits {
        let d = frac_digits.next().and_then(|c| c.to_digit(10)).unwrap_or(0);
        scaled = scaled.checked_mul(10)?.checked_add(i128::from(d))?;
    }
    if negative {
        scaled = -scaled;
    }
    i64::try_from(scaled).ok()
}

fn format_decimal(scaled: i128, digits: u8) -> String {
    if digits == 0 {
        return scaled.to_string();
    }
    let sign = if scaled < 0 { "-" } else { "" };
    let magnitude = scaled.unsigned_abs();
    let divisor = 10u128.pow(u32::from(digits));
    format!(
        "{sign}{}.{:0width$}",
        magnitude / divisor,
        magnitude % divisor,
        width = digits as usize
    )
}

/// Untyped JSON to CBOR conversion
pub fn json_to_cbor(value: &Value, path: &str) -> Result<Cbor> {
    Ok(match value {
        Value::Null => Cbor::Null,
        Value::Bool(b) => Cbor::Bool(*b),
        Value::Number(n) => match json_integer(value) {
            Some(i) => cbor_integer(i, path)?,
            None => Cbor::Float(n.as_f64().unwrap_or(f64::NAN)),
        },
        Value::String(s) => Cbor::Text(s.clone()),
        Value::Array(items) => Cbor::Array(
            items
                .iter()
                .map(|v| json_to_cbor(v, path))
                .collect::<Result<_>>()?,
        ),
        Value::Object(map) => Cbor::Map(
            map.iter()
                .map(|(k, v)| Ok((Cbor::Text(k.clone()), json_to_cbor(v, path)?)))
                .collect::<Result<_>>()?,
        ),
    })
}

/// Untyped CBOR to JSON conversion
pub fn cbor_to_json(value: &Cbor, path: &str) -> Result<Value> {
    Ok(match value {
        Cbor::Null => Value::Null,
        Cbor::Bool(b) => Value::Bool(*b),
        Cbor::Integer(i) => json_number(i128::from(*i), path)?,
        Cbor::Float(f) => serde_json::Number::from_f64(*f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        Cbor::Text(s) => Value::String(s.clone()),
        Cbor::Bytes(b) => Value::String(BASE64.encode(b)),
        Cbor::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| cbor_to_json(v, path))
                .collect::<Result<_>>()?,
        ),
        Cbor::Map(entries) => {
            let mut map = serde_json::Map::new();
            for (k, v) in entries {
                let key = match k {
                    Cbor::Text(s) => s.clone(),
                    Cbor::Integer(i) => i128::from(*i).to_string(),
                    other => format!("{other:?}"),
                };
                map.insert(key, cbor_to_json(v, path)?);
            }
            Value::Object(map)
        }
        Cbor::Tag(_, inner) => cbor_to_json(inner, path)?,
        other => {
            return Err(CoreconfError::CborDecode(format!(
                "unsupported CBOR item at {path}: {other:?}"
            )));
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sids() -> SidTable {
        let mut table = SidTable::new();
        table.insert("ex:ethernet", 1800);
        table.insert("ex:wifi", 1801);
        table
    }

    fn enum_type() -> LeafType {
        LeafType::new(YangType::Enumeration(
            [("up".to_string(), 1), ("down".to_string(), 2)].into_iter().collect(),
        ))
    }

    fn roundtrip(value: Value, ty: &LeafType) -> (Cbor, Value) {
        let table = sids();
        let cbor = cast_to_coreconf(&value, ty, &table, "/t").unwrap();
        let back = cast_from_coreconf(&cbor, ty, &table, "/t").unwrap();
        (cbor, back)
    }

    #[test]
    fn test_yang_type_from_string() {
        assert_eq!(YangType::from_string("string"), YangType::String);
        assert_eq!(YangType::from_string("uint8"), YangType::Uint8);
        assert_eq!(YangType::from_string("boolean"), YangType::Boolean);
        assert_eq!(
            YangType::from_string("inet:uri"),
            YangType::Unknown("inet:uri".into())
        );
    }

    #[test]
    fn test_sid_file_enum_and_union() {
        let t = LeafType::from_sid_type(&json!({"1": "up", "2": "down"}));
        assert_eq!(t, enum_type());

        let u = LeafType::from_sid_type(&json!(["uint8", "string"]));
        assert_eq!(
            u.base,
            YangType::Union(vec![LeafType::new(YangType::Uint8), LeafType::new(YangType::String)])
        );
    }

    #[test]
    fn test_cast_integer_and_range() {
        let mut ty = LeafType::new(YangType::Uint8);
        assert_eq!(roundtrip(json!(42), &ty).1, json!(42));

        let table = sids();
        assert!(cast_to_coreconf(&json!(256), &ty, &table, "/t").is_err());
        assert!(cast_to_coreconf(&json!("42"), &ty, &table, "/t").is_err());

        ty.range = Some(RangeSet::parse("1..10 | 20..max"));
        assert!(cast_to_coreconf(&json!(15), &ty, &table, "/t").is_err());
        assert!(cast_to_coreconf(&json!(25), &ty, &table, "/t").is_ok());
    }

    #[test]
    fn test_int64_is_string_in_json() {
        let ty = LeafType::new(YangType::Int64);
        let (cbor, back) = roundtrip(json!("-9000000000"), &ty);
        assert_eq!(cbor, Cbor::Integer((-9_000_000_000i64).into()));
        assert_eq!(back, json!("-9000000000"));
    }

    #[test]
    fn test_decimal64_scaled() {
        let ty = LeafType::new(YangType::Decimal64 { fraction_digits: 2 });
        let (cbor, back) = roundtrip(json!("-12.5"), &ty);
        assert_eq!(cbor, Cbor::Integer((-1250).into()));
        assert_eq!(back, json!("-12.50"));

        let (cbor, _) = roundtrip(json!(0.05), &ty);
        assert_eq!(cbor, Cbor::Integer(5.into()));

        let table = sids();
        assert!(cast_to_coreconf(&json!("1.234"), &ty, &table, "/t").is_err());
    }

    #[test]
    fn test_enumeration() {
        let (cbor, back) = roundtrip(json!("down"), &enum_type());
        assert_eq!(cbor, Cbor::Integer(2.into()));
        assert_eq!(back, json!("down"));
        assert!(cast_to_coreconf(&json!("sideways"), &enum_type(), &sids(), "/t").is_err());
    }

    #[test]
    fn test_bits_bitfield() {
        let ty = LeafType::new(YangType::Bits(
            [("a".to_string(), 0), ("b".to_string(), 3), ("c".to_string(), 9)]
                .into_iter()
                .collect(),
        ));
        let (cbor, back) = roundtrip(json!("c a"), &ty);
        assert_eq!(cbor, Cbor::Bytes(vec![0x01, 0x02]));
        assert_eq!(back, json!("a c"));
    }

    #[test]
    fn test_identityref_uses_sid() {
        let ty = LeafType::new(YangType::Identityref { base: Some("ex:iftype".into()) });
        let (cbor, back) = roundtrip(json!("ex:wifi"), &ty);
        assert_eq!(cbor, Cbor::Integer(1801.into()));
        assert_eq!(back, json!("ex:wifi"));
    }

    #[test]
    fn test_identityref_short_form_uses_leaf_module() {
        let ty = LeafType::new(YangType::Identityref { base: Some("ex:iftype".into()) });
        let table = sids();
        let cbor = cast_to_coreconf(&json!("ethernet"), &ty, &table, "/ex:ports/port/kind").unwrap();
        assert_eq!(cbor, Cbor::Integer(1800.into()));
        assert_eq!(
            cast_from_coreconf(&cbor, &ty, &table, "/ex:ports/port/kind").unwrap(),
            json!("ex:ethernet")
        );
        assert!(cast_to_coreconf(&json!("ethernet"), &ty, &table, "/other:ports/kind").is_err());
        assert_eq!(enclosing_module("/a:x/y/b:z/w"), Some("b"));
        assert_eq!(enclosing_module("t"), None);
    }

    #[test]
    fn test_union_tags_enum_member() {
        let ty = LeafType::new(YangType::Union(vec![LeafType::new(YangType::Uint8), enum_type()]));

        let (cbor, back) = roundtrip(json!(1), &ty);
        assert_eq!(cbor, Cbor::Integer(1.into()));
        assert_eq!(back, json!(1));

        let (cbor, back) = roundtrip(json!("up"), &ty);
        assert_eq!(cbor, Cbor::Tag(TAG_ENUM, Box::new(Cbor::Integer(1.into()))));
        assert_eq!(back, json!("up"));
    }

    #[test]
    fn test_binary_and_empty() {
        let (cbor, back) = roundtrip(json!("AQID"), &LeafType::new(YangType::Binary));
        assert_eq!(cbor, Cbor::Bytes(vec![1, 2, 3]));
        assert_eq!(back, json!("AQID"));

        let (cbor, back) = roundtrip(json!([null]), &LeafType::new(YangType::Empty));
        assert_eq!(cbor, Cbor::Null);
        assert_eq!(back, json!([null]));
    }

    #[test]
    fn test_string_length() {
        let mut ty = LeafType::new(YangType::String);
        ty.length = Some(RangeSet::parse("1..4"));
        assert!(cast_to_coreconf(&json!("abcd"), &ty, &sids(), "/t").is_ok());
        assert!(cast_to_coreconf(&json!("abcde"), &ty, &sids(), "/t").is_err());
        assert!(cast_to_coreconf(&json!(""), &ty, &sids(), "/t").is_err());
    }

    #[test]
    fn test_decimal_helpers() {
        assert_eq!(parse_decimal("3", 3), Some(3000));
        assert_eq!(parse_decimal(".5", 1), Some(5));
        assert_eq!(parse_decimal("1.50", 1), Some(15));
        assert_eq!(parse_decimal("abc", 1), None);
        assert_eq!(format_decimal(-5, 2), "-0.05");
        assert_eq!(format_decimal(42, 0), "42");
    }
}
