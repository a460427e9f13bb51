//! Map-oriented encoder/decoder helpers.
//!
//! The wire format frames every structured value as an indefinite-length
//! map with short text keys. [`Encoder`] writes such a map field by field;
//! [`Decoder`] walks one, yielding keys in whatever order the producer
//! chose and skipping the ones the caller does not recognize.

use bytes::BufMut;

use crate::constants::{CBOR_BREAK, CBOR_MAP_INDEF};
use crate::decode::{decode_text, skip_item, CborDecode};
use crate::encode::{write_u32_fixed, CborEncode};
use crate::error::CborDecodeError;

pub struct Encoder<'a> {
    buf: &'a mut dyn BufMut,
}

impl<'a> Encoder<'a> {
    pub fn new(buf: &'a mut dyn BufMut) -> Self {
        buf.put_u8(CBOR_MAP_INDEF);
        Self { buf }
    }

    pub fn encode_field<T: CborEncode + ?Sized>(self, key: &str, value: &T) -> Self {
        key.encode(self.buf);
        value.encode(self.buf);
        self
    }

    /// Encodes the value with a full 4-byte argument so the field width is
    /// independent of the value.
    pub fn encode_fixed_u32_field(self, key: &str, value: u32) -> Self {
        key.encode(self.buf);
        write_u32_fixed(value, self.buf);
        self
    }

    /// Encodes the field only when the value is present.
    pub fn encode_optional_field<T: CborEncode>(self, key: &str, value: &Option<T>) -> Self {
        match value {
            Some(value) => self.encode_field(key, value),
            None => self,
        }
    }

    /// Encodes the field only when `present` holds.
    pub fn encode_field_if<T: CborEncode>(self, present: bool, key: &str, value: &T) -> Self {
        if present {
            self.encode_field(key, value)
        } else {
            self
        }
    }

    pub fn finish(self) {
        self.buf.put_u8(CBOR_BREAK);
    }
}

pub struct Decoder<'a> {
    rest: &'a [u8],
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Result<Self, CborDecodeError> {
        match buf.split_first() {
            Some((&CBOR_MAP_INDEF, rest)) => Ok(Self { rest }),
            Some(_) => Err(CborDecodeError::UnexpectedType),
            None => Err(CborDecodeError::UnexpectedEof),
        }
    }

    /// Advances to the next map entry, returning its key, or `None` once
    /// the closing break has been consumed.
    pub fn next_key(&mut self) -> Result<Option<&'a str>, CborDecodeError> {
        match self.rest.first() {
            Some(&CBOR_BREAK) => {
                self.rest = &self.rest[1..];
                Ok(None)
            }
            Some(_) => {
                let (key, rest) = decode_text(self.rest)?;
                self.rest = rest;
                Ok(Some(key))
            }
            None => Err(CborDecodeError::UnexpectedEof),
        }
    }

    pub fn decode_field<T: CborDecode>(&mut self) -> Result<T, CborDecodeError> {
        let (value, rest) = T::decode_unfinished(self.rest)?;
        self.rest = rest;
        Ok(value)
    }

    pub fn skip_field(&mut self) -> Result<(), CborDecodeError> {
        self.rest = skip_item(self.rest)?;
        Ok(())
    }

    /// Consumes the next value and returns its raw encoding, for callers
    /// that can only interpret it once the rest of the map is known.
    pub fn raw_field(&mut self) -> Result<&'a [u8], CborDecodeError> {
        let start = self.rest;
        self.rest = skip_item(self.rest)?;
        Ok(&start[..start.len() - self.rest.len()])
    }

    /// Returns the input remaining after the map. Only meaningful after
    /// [`next_key`] has returned `None`.
    ///
    /// [`next_key`]: Decoder::next_key
    pub fn finish(self) -> &'a [u8] {
        self.rest
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_map_roundtrip() {
        let mut buf = Vec::new();
        Encoder::new(&mut buf)
            .encode_field("a", &5u32)
            .encode_fixed_u32_field("t", 0x7890_1234)
            .encode_optional_field("x", &Option::<u8>::None)
            .encode_field("s", "hi")
            .finish();

        let mut map = Decoder::new(&buf).unwrap();
        let mut a = None;
        let mut t = None;
        let mut s = None;
        while let Some(key) = map.next_key().unwrap() {
            match key {
                "a" => a = Some(map.decode_field::<u32>().unwrap()),
                "t" => t = Some(map.decode_field::<u32>().unwrap()),
                "s" => s = Some(map.decode_field::<String>().unwrap()),
                _ => map.skip_field().unwrap(),
            }
        }
        assert_eq!(a, Some(5));
        assert_eq!(t, Some(0x7890_1234));
        assert_eq!(s.as_deref(), Some("hi"));
        assert!(map.finish().is_empty());
    }

    #[test]
    fn unknown_fields_are_skipped() {
        let mut buf = Vec::new();
        Encoder::new(&mut buf)
            .encode_field("z", &vec![1u8, 2, 3])
            .encode_field("a", &7u8)
            .finish();

        let mut map = Decoder::new(&buf).unwrap();
        let mut a = None;
        while let Some(key) = map.next_key().unwrap() {
            match key {
                "a" => a = Some(map.decode_field::<u8>().unwrap()),
                _ => map.skip_field().unwrap(),
            }
        }
        assert_eq!(a, Some(7));
    }

    #[test]
    fn missing_break_is_an_error() {
        let mut buf = Vec::new();
        Encoder::new(&mut buf).encode_field("a", &1u8).finish();
        buf.pop(); // drop the break

        let mut map = Decoder::new(&buf).unwrap();
        assert_eq!(map.next_key().unwrap(), Some("a"));
        map.decode_field::<u8>().unwrap();
        assert_eq!(map.next_key(), Err(CborDecodeError::UnexpectedEof));
    }

    #[test]
    fn fixed_u32_field_width() {
        let mut buf = Vec::new();
        Encoder::new(&mut buf).encode_fixed_u32_field("t", 0).finish();
        // map header + key + 5-byte uint + break
        assert_eq!(buf.len(), 1 + 2 + 5 + 1);
        assert_eq!(hex::encode(&buf), "bf61741a00000000ff");
    }
}
