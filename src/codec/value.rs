//! Typed value representation and its packed byte form.
//!
//! Primitive types pack to fixed little-endian widths; strings and blobs
//! pack verbatim. Containers and multisets pack as a header followed by
//! length-prefixed entries, where the length prefix of a nested compound
//! value is zero-padded to `VINT_MAX_BYTES` so the header can be backfilled
//! after the body is written without shifting data.
//!
//! A container key reserved by `insert_atomic` but not yet filled packs as
//! a zero-length value. On unpack, a zero-length value decodes back to the
//! reserved state for every value type whose packed form is never empty;
//! for STRING and BLOB it is a legal empty value.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::codec::vint;
use crate::msg::DataError;

/// Tag of a datum type.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub enum DataType {
    #[default]
    Null = 0,
    Integer = 1,
    Float = 2,
    String = 3,
    Blob = 4,
    Container = 5,
    Multiset = 6,
    Struct = 7,
    Ref = 8,
    FileRef = 9,
}

impl DataType {
    pub fn from_i64(v: i64) -> Result<Self, DataError> {
        match v {
            0 => Ok(DataType::Null),
            1 => Ok(DataType::Integer),
            2 => Ok(DataType::Float),
            3 => Ok(DataType::String),
            4 => Ok(DataType::Blob),
            5 => Ok(DataType::Container),
            6 => Ok(DataType::Multiset),
            7 => Ok(DataType::Struct),
            8 => Ok(DataType::Ref),
            9 => Ok(DataType::FileRef),
            _ => Err(DataError::Invalid),
        }
    }

    pub fn to_string_name(self) -> &'static str {
        match self {
            DataType::Null => "null",
            DataType::Integer => "integer",
            DataType::Float => "float",
            DataType::String => "string",
            DataType::Blob => "blob",
            DataType::Container => "container",
            DataType::Multiset => "multiset",
            DataType::Struct => "struct",
            DataType::Ref => "ref",
            DataType::FileRef => "file_ref",
        }
    }

    /// Parses a type name, accepting a `struct<N>` suffix form for struct
    /// sub-types, e.g. `"struct14"`.
    pub fn parse_name(name: &str) -> Option<(Self, Option<i32>)> {
        match name {
            "integer" => Some((DataType::Integer, None)),
            "float" => Some((DataType::Float, None)),
            "string" => Some((DataType::String, None)),
            "blob" => Some((DataType::Blob, None)),
            "container" => Some((DataType::Container, None)),
            "multiset" => Some((DataType::Multiset, None)),
            "ref" => Some((DataType::Ref, None)),
            "file_ref" => Some((DataType::FileRef, None)),
            _ => {
                let suffix = name.strip_prefix("struct")?;
                if suffix.is_empty() {
                    Some((DataType::Struct, None))
                } else {
                    suffix.parse::<i32>().ok().map(|t| (DataType::Struct, Some(t)))
                }
            }
        }
    }

    /// Whether the nested length prefix of this type is padded to
    /// `VINT_MAX_BYTES` in packed form.
    pub fn pad_size(self) -> bool {
        matches!(self, DataType::Container | DataType::Multiset)
    }

    /// Whether a zero-length packed form is a legal value of this type.
    fn may_pack_empty(self) -> bool {
        matches!(self, DataType::String | DataType::Blob)
    }
}

/// Extra type information supplied at creation time for compound types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TypeExtra {
    #[default]
    None,
    Container {
        key_type: DataType,
        val_type: DataType,
    },
    Multiset {
        val_type: DataType,
    },
    Struct {
        struct_type: i32,
    },
}

/// A single typed value as held by the data store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Integer(i64),
    Float(f64),
    String(Vec<u8>),
    Blob(Vec<u8>),
    Ref(i64),
    FileRef {
        status_id: i64,
        filename_id: i64,
        mapped: bool,
    },
    Struct {
        struct_type: i32,
        fields: Vec<Value>,
    },
    Container {
        key_type: DataType,
        val_type: DataType,
        /// Key bytes -> owned value; `None` marks a reserved, unfilled key.
        entries: BTreeMap<Vec<u8>, Option<Value>>,
    },
    Multiset {
        elem_type: DataType,
        elems: Vec<Value>,
    },
}

impl Value {
    pub fn dtype(&self) -> DataType {
        match self {
            Value::Integer(_) => DataType::Integer,
            Value::Float(_) => DataType::Float,
            Value::String(_) => DataType::String,
            Value::Blob(_) => DataType::Blob,
            Value::Ref(_) => DataType::Ref,
            Value::FileRef { .. } => DataType::FileRef,
            Value::Struct { .. } => DataType::Struct,
            Value::Container { .. } => DataType::Container,
            Value::Multiset { .. } => DataType::Multiset,
        }
    }

    pub fn string(s: &str) -> Value {
        Value::String(s.as_bytes().to_vec())
    }

    /// Invokes `f` for every datum id referenced from inside this value
    /// (REF targets and both FILE_REF ids), recursing through compounds.
    /// Used to propagate refcount changes to referands.
    pub fn each_ref_id(&self, f: &mut impl FnMut(i64)) {
        match self {
            Value::Ref(id) => f(*id),
            Value::FileRef {
                status_id,
                filename_id,
                ..
            } => {
                f(*status_id);
                f(*filename_id);
            }
            Value::Struct { fields, .. } => {
                for v in fields {
                    v.each_ref_id(f);
                }
            }
            Value::Container { entries, .. } => {
                for v in entries.values().flatten() {
                    v.each_ref_id(f);
                }
            }
            Value::Multiset { elems, .. } => {
                for v in elems {
                    v.each_ref_id(f);
                }
            }
            _ => {}
        }
    }

    /// Packs this value to its byte form.
    pub fn pack(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.pack_buffer(false, &mut out);
        out
    }

    /// Appends the packed form to `out`. With `prefix_len`, the form is
    /// preceded by its own byte length (padded for compound types).
    pub(crate) fn pack_buffer(&self, prefix_len: bool, out: &mut Vec<u8>) {
        if self.dtype().pad_size() {
            // reserve space at front to backfill the serialized size
            let start = out.len();
            if prefix_len {
                out.resize(start + vint::VINT_MAX_BYTES, 0);
            }
            let body_start = out.len();
            match self {
                Value::Container {
                    key_type,
                    val_type,
                    entries,
                } => {
                    vint::encode_to(*key_type as i64, out);
                    vint::encode_to(*val_type as i64, out);
                    vint::encode_to(entries.len() as i64, out);
                    for (key, val) in entries {
                        vint::encode_to(key.len() as i64, out);
                        out.extend_from_slice(key);
                        match val {
                            // reserved key: zero-length value, with the
                            // prefix width the value type dictates
                            None if val_type.pad_size() => {
                                let start = out.len();
                                out.resize(start + vint::VINT_MAX_BYTES, 0);
                            }
                            None => {
                                vint::encode_to(0, out);
                            }
                            Some(v) => v.pack_buffer(true, out),
                        }
                    }
                }
                Value::Multiset { elem_type, elems } => {
                    vint::encode_to(*elem_type as i64, out);
                    vint::encode_to(elems.len() as i64, out);
                    for v in elems {
                        v.pack_buffer(true, out);
                    }
                }
                _ => unreachable!(),
            }
            if prefix_len {
                let body_len = (out.len() - body_start) as i64;
                vint::encode_into(body_len, &mut out[start..start + vint::VINT_MAX_BYTES]);
            }
            return;
        }

        let bytes: Vec<u8> = match self {
            Value::Integer(v) => v.to_le_bytes().to_vec(),
            Value::Float(v) => v.to_le_bytes().to_vec(),
            Value::String(b) | Value::Blob(b) => b.clone(),
            Value::Ref(id) => id.to_le_bytes().to_vec(),
            Value::FileRef {
                status_id,
                filename_id,
                mapped,
            } => {
                let mut b = Vec::with_capacity(17);
                b.extend_from_slice(&status_id.to_le_bytes());
                b.extend_from_slice(&filename_id.to_le_bytes());
                b.push(*mapped as u8);
                b
            }
            Value::Struct {
                struct_type,
                fields,
            } => {
                let mut b = Vec::new();
                vint::encode_to(*struct_type as i64, &mut b);
                vint::encode_to(fields.len() as i64, &mut b);
                for field in fields {
                    vint::encode_to(field.dtype() as i64, &mut b);
                    field.pack_buffer(true, &mut b);
                }
                b
            }
            _ => unreachable!(),
        };
        if prefix_len {
            vint::encode_to(bytes.len() as i64, out);
        }
        out.extend_from_slice(&bytes);
    }

    /// Unpacks a value of the given type from its full byte form.
    pub fn unpack(dtype: DataType, buf: &[u8]) -> Result<Value, DataError> {
        match dtype {
            DataType::Integer => Ok(Value::Integer(i64::from_le_bytes(
                buf.try_into().map_err(|_| DataError::Invalid)?,
            ))),
            DataType::Float => Ok(Value::Float(f64::from_le_bytes(
                buf.try_into().map_err(|_| DataError::Invalid)?,
            ))),
            DataType::String => Ok(Value::String(buf.to_vec())),
            DataType::Blob => Ok(Value::Blob(buf.to_vec())),
            DataType::Ref => Ok(Value::Ref(i64::from_le_bytes(
                buf.try_into().map_err(|_| DataError::Invalid)?,
            ))),
            DataType::FileRef => {
                if buf.len() != 17 {
                    return Err(DataError::Invalid);
                }
                Ok(Value::FileRef {
                    status_id: i64::from_le_bytes(buf[0..8].try_into().unwrap()),
                    filename_id: i64::from_le_bytes(buf[8..16].try_into().unwrap()),
                    mapped: buf[16] != 0,
                })
            }
            DataType::Struct => {
                let mut pos = 0;
                let struct_type = decode_vint(buf, &mut pos)?;
                let nfields = decode_vint(buf, &mut pos)?;
                if !(0..=i32::MAX as i64).contains(&nfields) {
                    return Err(DataError::Invalid);
                }
                let mut fields = Vec::with_capacity(nfields.min(1024) as usize);
                for _ in 0..nfields {
                    let ftype = DataType::from_i64(decode_vint(buf, &mut pos)?)?;
                    let entry = unpack_entry(ftype, buf, &mut pos)?;
                    fields.push(Value::unpack(ftype, entry)?);
                }
                Ok(Value::Struct {
                    struct_type: struct_type as i32,
                    fields,
                })
            }
            DataType::Container => {
                let mut pos = 0;
                let key_type = DataType::from_i64(decode_vint(buf, &mut pos)?)?;
                let val_type = DataType::from_i64(decode_vint(buf, &mut pos)?)?;
                let nelems = decode_vint(buf, &mut pos)?;
                if nelems < 0 {
                    return Err(DataError::Invalid);
                }
                let mut entries = BTreeMap::new();
                for _ in 0..nelems {
                    let key = unpack_entry(DataType::Null, buf, &mut pos)?.to_vec();
                    let val_bytes = unpack_entry(val_type, buf, &mut pos)?;
                    let val = if val_bytes.is_empty() && !val_type.may_pack_empty() {
                        None // reserved but not filled
                    } else {
                        Some(Value::unpack(val_type, val_bytes)?)
                    };
                    entries.insert(key, val);
                }
                Ok(Value::Container {
                    key_type,
                    val_type,
                    entries,
                })
            }
            DataType::Multiset => {
                let mut pos = 0;
                let elem_type = DataType::from_i64(decode_vint(buf, &mut pos)?)?;
                let nelems = decode_vint(buf, &mut pos)?;
                if nelems < 0 {
                    return Err(DataError::Invalid);
                }
                let mut elems = Vec::with_capacity(nelems.min(1024) as usize);
                for _ in 0..nelems {
                    let entry = unpack_entry(elem_type, buf, &mut pos)?;
                    elems.push(Value::unpack(elem_type, entry)?);
                }
                Ok(Value::Multiset { elem_type, elems })
            }
            DataType::Null => Err(DataError::Invalid),
        }
    }
}

fn decode_vint(buf: &[u8], pos: &mut usize) -> Result<i64, DataError> {
    let (v, used) = vint::decode(&buf[*pos..]).ok_or(DataError::Invalid)?;
    *pos += used;
    Ok(v)
}

/// Reads one length-prefixed entry from a packed buffer, honoring the
/// padded prefix width of compound entry types. Returns the entry slice.
/// This is also the decoder for enumerate result slices.
pub fn unpack_entry<'a>(
    dtype: DataType,
    buf: &'a [u8],
    pos: &mut usize,
) -> Result<&'a [u8], DataError> {
    if *pos >= buf.len() {
        return Err(DataError::Done);
    }
    let (len, used) = vint::decode(&buf[*pos..]).ok_or(DataError::Invalid)?;
    if len < 0 {
        return Err(DataError::Invalid);
    }
    let prefix = if dtype.pad_size() {
        vint::VINT_MAX_BYTES
    } else {
        used
    };
    let start = *pos + prefix;
    let end = start.checked_add(len as usize).ok_or(DataError::Invalid)?;
    if end > buf.len() {
        return Err(DataError::Invalid);
    }
    *pos = end;
    Ok(&buf[start..end])
}

#[cfg(test)]
mod value_tests {
    use super::*;

    fn roundtrip(v: Value) {
        let packed = v.pack();
        let back = Value::unpack(v.dtype(), &packed).unwrap();
        assert_eq!(back, v);
    }

    #[test]
    fn primitives_roundtrip() {
        roundtrip(Value::Integer(42));
        roundtrip(Value::Integer(-7_000_000_000));
        roundtrip(Value::Float(6.18));
        roundtrip(Value::string("hello mill"));
        roundtrip(Value::String(vec![]));
        roundtrip(Value::Blob(vec![0, 1, 2, 255]));
        roundtrip(Value::Ref(101));
        roundtrip(Value::FileRef {
            status_id: 11,
            filename_id: 12,
            mapped: true,
        });
    }

    #[test]
    fn integer_packs_fixed_width() {
        assert_eq!(Value::Integer(42).pack(), 42i64.to_le_bytes().to_vec());
        assert_eq!(Value::Integer(42).pack().len(), 8);
    }

    #[test]
    fn struct_roundtrip() {
        roundtrip(Value::Struct {
            struct_type: 3,
            fields: vec![
                Value::Integer(1),
                Value::string("field"),
                Value::Ref(900),
            ],
        });
    }

    #[test]
    fn container_roundtrip_with_reservation() {
        let mut entries = BTreeMap::new();
        entries.insert(b"k1".to_vec(), Some(Value::Ref(101)));
        entries.insert(b"k2".to_vec(), None); // reserved, unfilled
        roundtrip(Value::Container {
            key_type: DataType::String,
            val_type: DataType::Ref,
            entries,
        });
    }

    #[test]
    fn container_of_strings_empty_value_stays_filled() {
        // for string values a zero-length payload is a real (empty) value,
        // not a reservation
        let mut entries = BTreeMap::new();
        entries.insert(b"k".to_vec(), Some(Value::String(vec![])));
        let v = Value::Container {
            key_type: DataType::String,
            val_type: DataType::String,
            entries,
        };
        let back = Value::unpack(DataType::Container, &v.pack()).unwrap();
        assert_eq!(back, v);
    }

    #[test]
    fn nested_container_in_multiset() {
        let mut entries = BTreeMap::new();
        entries.insert(b"a".to_vec(), Some(Value::Integer(1)));
        entries.insert(b"b".to_vec(), Some(Value::Integer(2)));
        roundtrip(Value::Multiset {
            elem_type: DataType::Container,
            elems: vec![
                Value::Container {
                    key_type: DataType::String,
                    val_type: DataType::Integer,
                    entries,
                },
                Value::Container {
                    key_type: DataType::String,
                    val_type: DataType::Integer,
                    entries: BTreeMap::new(),
                },
            ],
        });
    }

    #[test]
    fn ref_walk_finds_embedded_ids() {
        let mut entries = BTreeMap::new();
        entries.insert(b"x".to_vec(), Some(Value::Ref(5)));
        entries.insert(b"y".to_vec(), None);
        let v = Value::Struct {
            struct_type: 0,
            fields: vec![
                Value::Ref(1),
                Value::FileRef {
                    status_id: 2,
                    filename_id: 3,
                    mapped: false,
                },
                Value::Container {
                    key_type: DataType::String,
                    val_type: DataType::Ref,
                    entries,
                },
                Value::Integer(99),
            ],
        };
        let mut ids = Vec::new();
        v.each_ref_id(&mut |id| ids.push(id));
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2, 3, 5]);
    }

    #[test]
    fn unpack_rejects_bad_widths() {
        assert_eq!(
            Value::unpack(DataType::Integer, &[1, 2, 3]),
            Err(DataError::Invalid)
        );
        assert_eq!(
            Value::unpack(DataType::FileRef, &[0; 16]),
            Err(DataError::Invalid)
        );
    }

    #[test]
    fn type_name_parsing() {
        assert_eq!(
            DataType::parse_name("integer"),
            Some((DataType::Integer, None))
        );
        assert_eq!(
            DataType::parse_name("struct14"),
            Some((DataType::Struct, Some(14)))
        );
        assert_eq!(DataType::parse_name("bogus"), None);
    }
}
