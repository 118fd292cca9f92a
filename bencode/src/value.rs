use std::collections::BTreeMap;
use serde::{de, ser, ser::SerializeSeq, ser::SerializeMap};
use crate::error::Result;

// Dynamically-typed bencode tree. Byte strings stay bytes; `pieces` and
// compact peer lists are binary, not text. Dictionaries use a BTreeMap keyed
// by raw bytes, so re-encoding is canonical by construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Int(i64),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Dict(BTreeMap<Vec<u8>, Value>),
}

impl Value {

    pub fn decode(input: &[u8]) -> Result<Value> {
        crate::decode_bytes(input)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        crate::encode_to_raw(self)
    }

    pub fn get(&self, key: &[u8]) -> Option<&Value> {
        match self {
            Value::Dict(dict) => dict.get(key),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|b| std::str::from_utf8(b).ok())
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, Value>> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Value { Value::Int(v) }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Value { Value::Bytes(v.to_vec()) }
}

impl From<&str> for Value {
    fn from(v: &str) -> Value { Value::Bytes(v.as_bytes().to_vec()) }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Value { Value::Bytes(v) }
}

impl ser::Serialize for Value {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
        where S: ser::Serializer
    {
        match self {
            Value::Int(i) => serializer.serialize_i64(*i),

            Value::Bytes(bytes) => serializer.serialize_bytes(bytes),

            Value::List(list) => {
                let mut seq = serializer.serialize_seq(Some(list.len()))?;
                for elem in list {
                    seq.serialize_element(elem)?;
                }
                seq.end()
            },

            Value::Dict(dict) => {
                let mut map = serializer.serialize_map(Some(dict.len()))?;
                for (k, v) in dict {
                    map.serialize_entry(serde_bytes::Bytes::new(k), v)?;
                }
                map.end()
            },
        }
    }
}

impl<'de> de::Deserialize<'de> for Value {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Value, D::Error>
        where D: de::Deserializer<'de>
    {
        struct ValueVisitor;

        impl<'de> de::Visitor<'de> for ValueVisitor {

            type Value = Value;

            fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                formatter.write_str("a bencode value")
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<Value, E> {
                Ok(Value::Int(v))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<Value, E> {
                i64::try_from(v)
                    .map(Value::Int)
                    .map_err(|_| E::custom("integer out of i64 range"))
            }

            fn visit_bytes<E: de::Error>(self, v: &[u8]) -> std::result::Result<Value, E> {
                Ok(Value::Bytes(v.to_vec()))
            }

            fn visit_byte_buf<E: de::Error>(self, v: Vec<u8>) -> std::result::Result<Value, E> {
                Ok(Value::Bytes(v))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<Value, E> {
                Ok(Value::Bytes(v.as_bytes().to_vec()))
            }

            fn visit_seq<A>(self, mut seq: A) -> std::result::Result<Value, A::Error>
                where A: de::SeqAccess<'de>
            {
                let mut list = Vec::new();
                while let Some(elem) = seq.next_element::<Value>()? {
                    list.push(elem);
                }
                Ok(Value::List(list))
            }

            fn visit_map<A>(self, mut map: A) -> std::result::Result<Value, A::Error>
                where A: de::MapAccess<'de>
            {
                let mut dict = BTreeMap::new();
                while let Some((key, value)) = map.next_entry::<serde_bytes::ByteBuf, Value>()? {
                    dict.insert(key.into_vec(), value);
                }
                Ok(Value::Dict(dict))
            }
        }

        deserializer.deserialize_any(ValueVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dict(entries: Vec<(&[u8], Value)>) -> Value {
        Value::Dict(entries.into_iter().map(|(k, v)| (k.to_vec(), v)).collect())
    }

    #[test]
    fn test_round_trip() {
        let tree = dict(vec![
            (b"files", Value::List(vec![Value::Int(1), Value::Bytes(vec![0xff, 0x00])])),
            (b"name", Value::from("spam")),
            (b"size", Value::Int(-3)),
        ]);
        let raw = tree.to_bytes().unwrap();
        assert_eq!(Value::decode(&raw).unwrap(), tree);
    }

    #[test]
    fn test_dict_emits_sorted() {
        // BTreeMap ordering carries through to the wire.
        let tree = dict(vec![
            (b"zz", Value::Int(1)),
            (b"aa", Value::Int(2)),
        ]);
        assert_eq!(tree.to_bytes().unwrap(), b"d2:aai2e2:zzi1ee");
    }

    #[test]
    fn test_accessors() {
        let tree = Value::decode(b"d3:numi7e3:raw2:\x01\x02e").unwrap();
        assert_eq!(tree.get(b"num").and_then(Value::as_int), Some(7));
        assert_eq!(tree.get(b"raw").and_then(Value::as_bytes), Some(&[1u8, 2][..]));
        assert!(tree.get(b"missing").is_none());
    }
}
