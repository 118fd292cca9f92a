use serde::ser;
use crate::error::{Error, Result};

// Encode any `Serialize` type as canonical bencode. Dictionary keys are
// emitted in byte-lexicographic order regardless of field declaration order,
// so the output is suitable for info-hash computation.
pub fn encode_to_raw<T: ser::Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut encoder = Encoder::new();
    value.serialize(&mut encoder)?;
    Ok(encoder.into_buf())
}

#[derive(Default)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {

    pub fn new() -> Self { Self::default() }

    fn push<T: AsRef<[u8]>>(&mut self, bytes: T) {
        self.buf.extend_from_slice(bytes.as_ref());
    }

    pub fn into_buf(self) -> Vec<u8> { self.buf }
}

impl<'a> ser::Serializer for &'a mut Encoder {

    type Ok     = ();
    type Error  = Error;

    type SerializeSeq           = Self;
    type SerializeTuple         = Self;
    type SerializeTupleStruct   = Self;
    type SerializeTupleVariant  = Self;
    type SerializeMap           = DictEncoder<'a>;
    type SerializeStruct        = DictEncoder<'a>;
    type SerializeStructVariant = DictEncoder<'a>;

    fn serialize_i64(self, v: i64) -> Result<()> {
        self.push("i");
        self.push(v.to_string());
        self.push("e");
        Ok(())
    }

    fn serialize_u64(self, v: u64) -> Result<()> {
        self.push("i");
        self.push(v.to_string());
        self.push("e");
        Ok(())
    }

    fn serialize_bool(self, v: bool) -> Result<()> { self.serialize_i64(v as i64) }
    fn serialize_i8(self, v: i8) -> Result<()> { self.serialize_i64(v as i64) }
    fn serialize_i16(self, v: i16) -> Result<()> { self.serialize_i64(v as i64) }
    fn serialize_i32(self, v: i32) -> Result<()> { self.serialize_i64(v as i64) }
    fn serialize_u8(self, v: u8) -> Result<()> { self.serialize_u64(v as u64) }
    fn serialize_u16(self, v: u16) -> Result<()> { self.serialize_u64(v as u64) }
    fn serialize_u32(self, v: u32) -> Result<()> { self.serialize_u64(v as u64) }

    fn serialize_f32(self, _: f32) -> Result<()> {
        Err(Error::InvalidType("f32".to_string()))
    }

    fn serialize_f64(self, _: f64) -> Result<()> {
        Err(Error::InvalidType("f64".to_string()))
    }

    fn serialize_bytes(self, v: &[u8]) -> Result<()> {
        self.push(v.len().to_string());
        self.push(":");
        self.push(v);
        Ok(())
    }

    fn serialize_str(self, v: &str) -> Result<()> {
        self.serialize_bytes(v.as_bytes())
    }

    fn serialize_char(self, v: char) -> Result<()> {
        let mut buf = [0; 4];
        self.serialize_bytes(v.encode_utf8(&mut buf).as_bytes())
    }

    // Absent values write nothing; the dictionary encoder drops empty entries
    // so optional struct fields disappear from the output entirely.
    fn serialize_none(self) -> Result<()> { Ok(()) }

    fn serialize_some<T: ?Sized>(self, value: &T) -> Result<()>
        where T: ser::Serialize
    {
        value.serialize(self)
    }

    fn serialize_unit(self) -> Result<()> { Ok(()) }

    fn serialize_unit_struct(self, _name: &'static str) -> Result<()> { Ok(()) }

    fn serialize_unit_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        variant: &'static str,
    ) -> Result<()> {
        self.serialize_str(variant)
    }

    fn serialize_newtype_struct<T: ?Sized>(self, _name: &'static str, value: &T) -> Result<()>
        where T: ser::Serialize
    {
        value.serialize(self)
    }

    fn serialize_newtype_variant<T: ?Sized>(
        self,
        _name: &'static str,
        _variant_index: u32,
        variant: &'static str,
        value: &T,
    ) -> Result<()>
        where T: ser::Serialize
    {
        self.push("d");
        self.serialize_bytes(variant.as_bytes())?;
        value.serialize(&mut *self)?;
        self.push("e");
        Ok(())
    }

    fn serialize_seq(self, _len: Option<usize>) -> Result<Self::SerializeSeq> {
        self.push("l");
        Ok(self)
    }

    fn serialize_tuple(self, len: usize) -> Result<Self::SerializeTuple> {
        self.serialize_seq(Some(len))
    }

    fn serialize_tuple_struct(self, _name: &'static str, len: usize) -> Result<Self::SerializeTupleStruct> {
        self.serialize_seq(Some(len))
    }

    fn serialize_tuple_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        variant: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeTupleVariant> {
        self.push("d");
        self.serialize_bytes(variant.as_bytes())?;
        self.push("l");
        Ok(self)
    }

    fn serialize_map(self, len: Option<usize>) -> Result<Self::SerializeMap> {
        Ok(DictEncoder::new(self, len.unwrap_or(0)))
    }

    fn serialize_struct(self, _name: &'static str, len: usize) -> Result<Self::SerializeStruct> {
        self.serialize_map(Some(len))
    }

    fn serialize_struct_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        variant: &'static str,
        len: usize,
    ) -> Result<Self::SerializeStructVariant> {
        self.push("d");
        self.serialize_bytes(variant.as_bytes())?;
        Ok(DictEncoder::new(self, len))
    }
}

impl ser::SerializeSeq for &mut Encoder {

    type Ok = ();
    type Error = Error;

    fn serialize_element<T: ?Sized>(&mut self, value: &T) -> Result<()>
        where T: ser::Serialize
    {
        value.serialize(&mut **self)
    }

    fn end(self) -> Result<()> {
        self.push("e");
        Ok(())
    }
}

impl ser::SerializeTuple for &mut Encoder {

    type Ok = ();
    type Error = Error;

    fn serialize_element<T: ?Sized>(&mut self, value: &T) -> Result<()>
        where T: ser::Serialize
    {
        value.serialize(&mut **self)
    }

    fn end(self) -> Result<()> {
        ser::SerializeSeq::end(self)
    }
}

impl ser::SerializeTupleStruct for &mut Encoder {

    type Ok = ();
    type Error = Error;

    fn serialize_field<T: ?Sized>(&mut self, value: &T) -> Result<()>
        where T: ser::Serialize
    {
        value.serialize(&mut **self)
    }

    fn end(self) -> Result<()> {
        ser::SerializeSeq::end(self)
    }
}

impl ser::SerializeTupleVariant for &mut Encoder {

    type Ok = ();
    type Error = Error;

    fn serialize_field<T: ?Sized>(&mut self, value: &T) -> Result<()>
        where T: ser::Serialize
    {
        value.serialize(&mut **self)
    }

    fn end(self) -> Result<()> {
        self.push("ee");
        Ok(())
    }
}

// Buffers entries and emits them sorted by raw key content. Keys arrive
// length-prefix encoded; ordering on the encoded form would put "1:z" ahead
// of "2:aa", so comparison strips the prefix.
pub struct DictEncoder<'a> {
    encoder: &'a mut Encoder,
    entries: Vec<(Vec<u8>, Vec<u8>)>,
    pending_key: Option<Vec<u8>>,
}

fn raw_key(encoded: &[u8]) -> &[u8] {
    match encoded.iter().position(|&b| b == b':') {
        Some(i) => &encoded[i + 1..],
        None => encoded,
    }
}

impl<'a> DictEncoder<'a> {

    fn new(encoder: &'a mut Encoder, size: usize) -> Self {
        Self {
            encoder,
            entries: Vec::with_capacity(size),
            pending_key: None,
        }
    }

    fn push_entry(&mut self, key: Vec<u8>, value: Vec<u8>) {
        // An empty encoding means the value was None; drop the entry.
        if !value.is_empty() {
            self.entries.push((key, value));
        }
    }

    fn finish(&mut self) -> Result<()> {
        if self.pending_key.is_some() {
            return Err(Error::Custom("dictionary ended while holding a key".to_string()));
        }
        let mut entries = std::mem::take(&mut self.entries);
        entries.sort_by(|a, b| raw_key(&a.0).cmp(raw_key(&b.0)));

        self.encoder.push("d");
        for (key, value) in entries {
            self.encoder.push(key);
            self.encoder.push(value);
        }
        self.encoder.push("e");
        Ok(())
    }
}

fn encode_key<T: ?Sized + ser::Serialize>(key: &T) -> Result<Vec<u8>> {
    let mut encoder = Encoder::new();
    key.serialize(&mut encoder)?;
    let encoded = encoder.into_buf();
    // Keys must be byte strings, whose encoding starts with a length digit.
    if !encoded.first().map_or(false, u8::is_ascii_digit) {
        return Err(Error::NonStringKey);
    }
    Ok(encoded)
}

impl<'a> ser::SerializeMap for DictEncoder<'a> {

    type Ok = ();
    type Error = Error;

    fn serialize_key<T: ?Sized>(&mut self, key: &T) -> Result<()>
        where T: ser::Serialize
    {
        if self.pending_key.is_some() {
            return Err(Error::Custom("serialize_key called twice".to_string()));
        }
        self.pending_key = Some(encode_key(key)?);
        Ok(())
    }

    fn serialize_value<T: ?Sized>(&mut self, value: &T) -> Result<()>
        where T: ser::Serialize
    {
        let key = self.pending_key.take()
            .ok_or_else(|| Error::Custom("serialize_value called before serialize_key".to_string()))?;
        let mut encoder = Encoder::new();
        value.serialize(&mut encoder)?;
        self.push_entry(key, encoder.into_buf());
        Ok(())
    }

    fn serialize_entry<K: ?Sized, V: ?Sized>(&mut self, key: &K, value: &V) -> Result<()>
        where K: ser::Serialize, V: ser::Serialize
    {
        if self.pending_key.is_some() {
            return Err(Error::Custom("serialize_entry called while holding a key".to_string()));
        }
        let key = encode_key(key)?;
        let mut encoder = Encoder::new();
        value.serialize(&mut encoder)?;
        self.push_entry(key, encoder.into_buf());
        Ok(())
    }

    fn end(mut self) -> Result<()> {
        self.finish()
    }
}

impl<'a> ser::SerializeStruct for DictEncoder<'a> {

    type Ok = ();
    type Error = Error;

    fn serialize_field<T: ?Sized>(&mut self, key: &'static str, value: &T) -> Result<()>
        where T: ser::Serialize
    {
        ser::SerializeMap::serialize_entry(self, key, value)
    }

    fn end(mut self) -> Result<()> {
        self.finish()
    }
}

impl<'a> ser::SerializeStructVariant for DictEncoder<'a> {

    type Ok = ();
    type Error = Error;

    fn serialize_field<T: ?Sized>(&mut self, key: &'static str, value: &T) -> Result<()>
        where T: ser::Serialize
    {
        ser::SerializeMap::serialize_entry(self, key, value)
    }

    fn end(mut self) -> Result<()> {
        self.finish()?;
        self.encoder.push("e");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_derive::Serialize;

    #[derive(Serialize)]
    struct Info {
        // Field order here is deliberately not lexicographic.
        pieces: serde_bytes::ByteBuf,
        name: String,
        #[serde(rename = "piece length")]
        piece_length: u32,
        length: u64,
        md5sum: Option<String>,
    }

    #[test]
    fn test_struct_fields_sorted() {
        let info = Info {
            pieces: serde_bytes::ByteBuf::from(vec![0u8; 20]),
            name: "archivo.txt".to_string(),
            piece_length: 16384,
            length: 12345,
            md5sum: None,
        };
        let raw = encode_to_raw(&info).unwrap();
        let expected: Vec<u8> = [
            &b"d6:lengthi12345e4:name11:archivo.txt12:piece lengthi16384e6:pieces20:"[..],
            &[0u8; 20][..],
            &b"e"[..],
        ].concat();
        assert_eq!(raw, expected);
    }

    #[test]
    fn test_key_order_ignores_length_prefix() {
        use std::collections::HashMap;
        let mut map = HashMap::new();
        map.insert("z".to_string(), 1i64);
        map.insert("aa".to_string(), 2i64);
        let raw = encode_to_raw(&map).unwrap();
        // "aa" sorts before "z" even though "2:aa" > "1:z" byte-wise.
        assert_eq!(raw, b"d2:aai2e1:zi1ee");
    }

    #[test]
    fn test_none_is_omitted() {
        #[derive(Serialize)]
        struct Opt {
            a: Option<i64>,
            b: i64,
        }
        let raw = encode_to_raw(&Opt { a: None, b: 7 }).unwrap();
        assert_eq!(raw, b"d1:bi7ee");
    }

    #[test]
    fn test_list() {
        let raw = encode_to_raw(&vec!["spam".to_string(), "eggs".to_string()]).unwrap();
        assert_eq!(raw, b"l4:spam4:eggse");
    }
}
