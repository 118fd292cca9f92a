use std::cmp::Ordering;
use serde::{de, forward_to_deserialize_any};
use crate::error::{Error, Result};

// Decode a bencoded document into any `Deserialize` type. The whole input
// must be consumed; trailing bytes and empty input are errors.
pub fn decode_bytes<'de, T: de::Deserialize<'de>>(input: &'de [u8]) -> Result<T> {
    if input.is_empty() {
        return Err(Error::EmptyInput);
    }
    let mut decoder = Decoder::new(input);
    let value = T::deserialize(&mut decoder)?;
    if decoder.peeked.is_some() || decoder.pos != decoder.input.len() {
        return Err(Error::TrailingBytes);
    }
    Ok(value)
}

// Scanned lexical item. Structural openers are returned before their contents.
#[derive(Debug)]
enum Token {
    Int(i64),
    Bytes(Vec<u8>),
    ListStart,
    DictStart,
    End,
}

pub struct Decoder<'de> {
    input: &'de [u8],
    pos: usize,
    peeked: Option<Token>,
}

impl<'de> Decoder<'de> {

    pub fn new(input: &'de [u8]) -> Self {
        Self { input, pos: 0, peeked: None }
    }

    fn next_byte(&mut self) -> Result<u8> {
        let b = *self.input.get(self.pos).ok_or(Error::Eof)?;
        self.pos += 1;
        Ok(b)
    }

    fn next_token(&mut self) -> Result<Token> {
        if let Some(token) = self.peeked.take() {
            return Ok(token);
        }
        match self.next_byte()? {
            b'i' => Ok(Token::Int(self.read_int()?)),
            n @ b'0'..=b'9' => Ok(Token::Bytes(self.read_bytes(n)?)),
            b'l' => Ok(Token::ListStart),
            b'd' => Ok(Token::DictStart),
            b'e' => Ok(Token::End),
            other => Err(Error::InvalidToken {
                expected: "'i', 'l', 'd', 'e' or a digit".to_string(),
                found: (other as char).to_string(),
            }),
        }
    }

    // Integers are canonical: no leading zeros except "0" itself, no "-0".
    fn read_int(&mut self) -> Result<i64> {
        let mut digits = Vec::new();
        loop {
            let b = self.next_byte()?;
            if b == b'e' {
                break;
            }
            digits.push(b);
        }
        let s = std::str::from_utf8(&digits)
            .map_err(|_| Error::InvalidInteger("non-ascii digits".to_string()))?;

        let unsigned = s.strip_prefix('-').unwrap_or(s);
        if unsigned.is_empty() {
            return Err(Error::InvalidInteger(s.to_string()));
        }
        if s == "-0" {
            return Err(Error::InvalidInteger("negative zero".to_string()));
        }
        if unsigned.len() > 1 && unsigned.starts_with('0') {
            return Err(Error::InvalidInteger(format!("leading zeros in {}", s)));
        }
        s.parse().map_err(|_| Error::InvalidInteger(s.to_string()))
    }

    fn read_len(&mut self, first: u8) -> Result<usize> {
        let mut digits = vec![first];
        loop {
            let b = self.next_byte()?;
            if b == b':' {
                break;
            }
            if !b.is_ascii_digit() {
                return Err(Error::InvalidLength((b as char).to_string()));
            }
            digits.push(b);
        }
        if digits.len() > 1 && digits[0] == b'0' {
            return Err(Error::InvalidLength("leading zeros".to_string()));
        }
        // Safe: digits are ascii by construction.
        std::str::from_utf8(&digits)
            .unwrap()
            .parse()
            .map_err(|_| Error::InvalidLength(String::from_utf8_lossy(&digits).to_string()))
    }

    fn read_bytes(&mut self, first: u8) -> Result<Vec<u8>> {
        let len = self.read_len(first)?;
        let end = self.pos.checked_add(len).ok_or(Error::Eof)?;
        if end > self.input.len() {
            return Err(Error::Eof);
        }
        let bytes = self.input[self.pos..end].to_vec();
        self.pos = end;
        Ok(bytes)
    }

    fn expect_bytes(&mut self) -> Result<Vec<u8>> {
        match self.next_token()? {
            Token::Bytes(b) => Ok(b),
            other => Err(Error::InvalidToken {
                expected: "a byte string".to_string(),
                found: format!("{:?}", other),
            }),
        }
    }
}

impl<'de, 'a> de::Deserializer<'de> for &'a mut Decoder<'de> {

    type Error = Error;

    fn deserialize_any<V>(self, visitor: V) -> Result<V::Value>
        where V: de::Visitor<'de>
    {
        match self.next_token()? {
            Token::Int(i) => visitor.visit_i64(i),
            Token::Bytes(b) => visitor.visit_byte_buf(b),
            Token::ListStart => visitor.visit_seq(ListAccess { decoder: self }),
            Token::DictStart => visitor.visit_map(DictAccess { decoder: self, last_key: None }),
            Token::End => Err(Error::InvalidToken {
                expected: "a value".to_string(),
                found: "'e'".to_string(),
            }),
        }
    }

    forward_to_deserialize_any! {
        bool char
        i8 i16 i32 i64 i128
        u8 u16 u32 u64 u128
        f32 f64
        unit bytes byte_buf
        seq map unit_struct tuple tuple_struct
        struct ignored_any
    }

    fn deserialize_str<V>(self, visitor: V) -> Result<V::Value>
        where V: de::Visitor<'de>
    {
        let bytes = self.expect_bytes()?;
        let s = std::str::from_utf8(&bytes)
            .map_err(|e| Error::Custom(format!("byte string is not utf-8: {}", e)))?;
        visitor.visit_str(s)
    }

    fn deserialize_string<V>(self, visitor: V) -> Result<V::Value>
        where V: de::Visitor<'de>
    {
        self.deserialize_str(visitor)
    }

    fn deserialize_identifier<V>(self, visitor: V) -> Result<V::Value>
        where V: de::Visitor<'de>
    {
        self.deserialize_str(visitor)
    }

    // Bencode has no encoding for "absent"; a present value is always Some.
    fn deserialize_option<V>(self, visitor: V) -> Result<V::Value>
        where V: de::Visitor<'de>
    {
        visitor.visit_some(self)
    }

    fn deserialize_newtype_struct<V>(self, _name: &'static str, visitor: V) -> Result<V::Value>
        where V: de::Visitor<'de>
    {
        visitor.visit_newtype_struct(self)
    }

    fn deserialize_enum<V>(
        self,
        _name: &'static str,
        _variants: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value>
        where V: de::Visitor<'de>
    {
        use serde::de::IntoDeserializer;
        let bytes = self.expect_bytes()?;
        let s = String::from_utf8(bytes)
            .map_err(|e| Error::Custom(format!("variant name is not utf-8: {}", e)))?;
        visitor.visit_enum(s.into_deserializer())
    }
}

struct ListAccess<'a, 'de> {
    decoder: &'a mut Decoder<'de>,
}

impl<'de, 'a> de::SeqAccess<'de> for ListAccess<'a, 'de> {

    type Error = Error;

    fn next_element_seed<T>(&mut self, seed: T) -> Result<Option<T::Value>>
        where T: de::DeserializeSeed<'de>
    {
        let token = self.decoder.next_token()?;
        if matches!(token, Token::End) {
            return Ok(None);
        }
        self.decoder.peeked = Some(token);
        seed.deserialize(&mut *self.decoder).map(Some)
    }
}

struct DictAccess<'a, 'de> {
    decoder: &'a mut Decoder<'de>,
    // Previous key, kept to enforce strict ascending byte order.
    last_key: Option<Vec<u8>>,
}

impl<'de, 'a> de::MapAccess<'de> for DictAccess<'a, 'de> {

    type Error = Error;

    fn next_key_seed<K>(&mut self, seed: K) -> Result<Option<K::Value>>
        where K: de::DeserializeSeed<'de>
    {
        match self.decoder.next_token()? {
            Token::End => Ok(None),
            Token::Bytes(key) => {
                if let Some(prev) = &self.last_key {
                    match key.cmp(prev) {
                        Ordering::Equal => {
                            return Err(Error::DuplicateKey(String::from_utf8_lossy(&key).to_string()));
                        },
                        Ordering::Less => {
                            return Err(Error::UnsortedKey(String::from_utf8_lossy(&key).to_string()));
                        },
                        Ordering::Greater => {},
                    }
                }
                self.last_key = Some(key.clone());
                self.decoder.peeked = Some(Token::Bytes(key));
                seed.deserialize(&mut *self.decoder).map(Some)
            },
            _ => Err(Error::NonStringKey),
        }
    }

    fn next_value_seed<V>(&mut self, seed: V) -> Result<V::Value>
        where V: de::DeserializeSeed<'de>
    {
        seed.deserialize(&mut *self.decoder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_derive::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Announce {
        interval: u64,
        #[serde(rename = "min interval")]
        min_interval: Option<u64>,
        #[serde(with = "serde_bytes")]
        peers: Vec<u8>,
    }

    #[test]
    fn test_decode_struct() {
        let raw = b"d8:intervali1800e12:min intervali60e5:peers6:\x7f\x00\x00\x01\x1a\xe1e";
        let announce: Announce = decode_bytes(raw).unwrap();
        assert_eq!(announce.interval, 1800);
        assert_eq!(announce.min_interval, Some(60));
        assert_eq!(announce.peers, b"\x7f\x00\x00\x01\x1a\xe1");
    }

    #[test]
    fn test_decode_missing_optional() {
        let raw = b"d8:intervali1800e5:peers0:e";
        let announce: Announce = decode_bytes(raw).unwrap();
        assert_eq!(announce.min_interval, None);
    }

    #[test]
    fn test_empty_input_is_error() {
        assert!(matches!(decode_bytes::<i64>(b""), Err(Error::EmptyInput)));
    }

    #[test]
    fn test_trailing_bytes() {
        assert!(matches!(decode_bytes::<i64>(b"i1ei2e"), Err(Error::TrailingBytes)));
    }

    #[test]
    fn test_canonical_integers() {
        assert_eq!(decode_bytes::<i64>(b"i0e").unwrap(), 0);
        assert_eq!(decode_bytes::<i64>(b"i-42e").unwrap(), -42);
        assert!(decode_bytes::<i64>(b"i-0e").is_err());
        assert!(decode_bytes::<i64>(b"i042e").is_err());
        assert!(decode_bytes::<i64>(b"ie").is_err());
    }

    #[test]
    fn test_duplicate_key_rejected() {
        let raw = b"d1:ai1e1:ai2ee";
        assert!(matches!(
            decode_bytes::<crate::Value>(raw),
            Err(Error::DuplicateKey(_))
        ));
    }

    #[test]
    fn test_unsorted_keys_rejected() {
        let raw = b"d1:bi1e1:ai2ee";
        assert!(matches!(
            decode_bytes::<crate::Value>(raw),
            Err(Error::UnsortedKey(_))
        ));
    }

    #[test]
    fn test_truncated_string() {
        assert!(matches!(decode_bytes::<crate::Value>(b"10:short"), Err(Error::Eof)));
    }
}
