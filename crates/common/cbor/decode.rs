use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use super::constants::{
    CBOR_BREAK, CBOR_FALSE, CBOR_NULL, CBOR_TRUE, INFO_INDEFINITE, INFO_U16, INFO_U32, INFO_U64,
    INFO_U8, MAJOR_ARRAY, MAJOR_BYTES, MAJOR_MAP, MAJOR_NINT, MAJOR_SIMPLE, MAJOR_TEXT, MAJOR_UINT,
};
use super::error::CborDecodeError;

pub trait CborDecode: Sized {
    fn decode_unfinished(buf: &[u8]) -> Result<(Self, &[u8]), CborDecodeError>;

    fn decode(buf: &[u8]) -> Result<Self, CborDecodeError> {
        let (value, rest) = Self::decode_unfinished(buf)?;
        if !rest.is_empty() {
            return Err(CborDecodeError::MalformedData);
        }
        Ok(value)
    }
}

/// Splits the initial byte and the argument of the next data item.
/// Indefinite-length items are rejected here; the map [`structs::Decoder`]
/// handles the one indefinite form the wire format uses.
///
/// [`structs::Decoder`]: crate::structs::Decoder
pub(crate) fn decode_header(buf: &[u8]) -> Result<(u8, u64, &[u8]), CborDecodeError> {
    let (&initial, rest) = buf.split_first().ok_or(CborDecodeError::UnexpectedEof)?;
    let major = initial & 0xe0;
    let info = initial & 0x1f;
    match info {
        0..=23 => Ok((major, u64::from(info), rest)),
        INFO_U8 => {
            let (&b, rest) = rest.split_first().ok_or(CborDecodeError::UnexpectedEof)?;
            Ok((major, u64::from(b), rest))
        }
        INFO_U16 => {
            if rest.len() < 2 {
                return Err(CborDecodeError::UnexpectedEof);
            }
            let value = u16::from_be_bytes([rest[0], rest[1]]);
            Ok((major, u64::from(value), &rest[2..]))
        }
        INFO_U32 => {
            if rest.len() < 4 {
                return Err(CborDecodeError::UnexpectedEof);
            }
            let value = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]);
            Ok((major, u64::from(value), &rest[4..]))
        }
        INFO_U64 => {
            if rest.len() < 8 {
                return Err(CborDecodeError::UnexpectedEof);
            }
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&rest[..8]);
            Ok((major, u64::from_be_bytes(bytes), &rest[8..]))
        }
        _ => Err(CborDecodeError::MalformedData),
    }
}

pub(crate) fn decode_uint(buf: &[u8]) -> Result<(u64, &[u8]), CborDecodeError> {
    let (major, value, rest) = decode_header(buf)?;
    if major != MAJOR_UINT {
        return Err(CborDecodeError::UnexpectedType);
    }
    Ok((value, rest))
}

/// Decodes a byte string, borrowing its content from the input.
pub fn decode_bytes(buf: &[u8]) -> Result<(&[u8], &[u8]), CborDecodeError> {
    let (major, len, rest) = decode_header(buf)?;
    if major != MAJOR_BYTES {
        return Err(CborDecodeError::UnexpectedType);
    }
    let len = len as usize;
    if rest.len() < len {
        return Err(CborDecodeError::UnexpectedEof);
    }
    Ok((&rest[..len], &rest[len..]))
}

pub fn decode_text(buf: &[u8]) -> Result<(&str, &[u8]), CborDecodeError> {
    let (major, len, rest) = decode_header(buf)?;
    if major != MAJOR_TEXT {
        return Err(CborDecodeError::UnexpectedType);
    }
    let len = len as usize;
    if rest.len() < len {
        return Err(CborDecodeError::UnexpectedEof);
    }
    let text = std::str::from_utf8(&rest[..len]).map_err(|_| CborDecodeError::InvalidUtf8)?;
    Ok((text, &rest[len..]))
}

/// Skips one complete data item, including nested containers. Used when a
/// decoder meets a key it does not know.
pub fn skip_item(buf: &[u8]) -> Result<&[u8], CborDecodeError> {
    let (&initial, _) = buf.split_first().ok_or(CborDecodeError::UnexpectedEof)?;
    let major = initial & 0xe0;
    let info = initial & 0x1f;

    if info == INFO_INDEFINITE {
        match major {
            MAJOR_ARRAY | MAJOR_MAP => {
                let mut rest = &buf[1..];
                loop {
                    match rest.first() {
                        Some(&CBOR_BREAK) => return Ok(&rest[1..]),
                        Some(_) => rest = skip_item(rest)?,
                        None => return Err(CborDecodeError::UnexpectedEof),
                    }
                }
            }
            _ => Err(CborDecodeError::MalformedData),
        }
    } else {
        let (major, value, rest) = decode_header(buf)?;
        match major {
            MAJOR_UINT | MAJOR_NINT | MAJOR_SIMPLE => Ok(rest),
            MAJOR_BYTES | MAJOR_TEXT => {
                let len = value as usize;
                if rest.len() < len {
                    return Err(CborDecodeError::UnexpectedEof);
                }
                Ok(&rest[len..])
            }
            MAJOR_ARRAY => {
                let mut rest = rest;
                for _ in 0..value {
                    rest = skip_item(rest)?;
                }
                Ok(rest)
            }
            MAJOR_MAP => {
                let mut rest = rest;
                for _ in 0..value.saturating_mul(2) {
                    rest = skip_item(rest)?;
                }
                Ok(rest)
            }
            _ => Err(CborDecodeError::MalformedData),
        }
    }
}

pub fn decode_array_header(buf: &[u8]) -> Result<(usize, &[u8]), CborDecodeError> {
    let (major, len, rest) = decode_header(buf)?;
    if major != MAJOR_ARRAY {
        return Err(CborDecodeError::UnexpectedType);
    }
    Ok((len as usize, rest))
}

impl CborDecode for bool {
    fn decode_unfinished(buf: &[u8]) -> Result<(Self, &[u8]), CborDecodeError> {
        let (&initial, rest) = buf.split_first().ok_or(CborDecodeError::UnexpectedEof)?;
        match initial {
            CBOR_TRUE => Ok((true, rest)),
            CBOR_FALSE => Ok((false, rest)),
            _ => Err(CborDecodeError::UnexpectedType),
        }
    }
}

impl CborDecode for u8 {
    fn decode_unfinished(buf: &[u8]) -> Result<(Self, &[u8]), CborDecodeError> {
        let (value, rest) = decode_uint(buf)?;
        let value = u8::try_from(value).map_err(|_| CborDecodeError::InvalidLength)?;
        Ok((value, rest))
    }
}

impl CborDecode for u16 {
    fn decode_unfinished(buf: &[u8]) -> Result<(Self, &[u8]), CborDecodeError> {
        let (value, rest) = decode_uint(buf)?;
        let value = u16::try_from(value).map_err(|_| CborDecodeError::InvalidLength)?;
        Ok((value, rest))
    }
}

impl CborDecode for u32 {
    fn decode_unfinished(buf: &[u8]) -> Result<(Self, &[u8]), CborDecodeError> {
        let (value, rest) = decode_uint(buf)?;
        let value = u32::try_from(value).map_err(|_| CborDecodeError::InvalidLength)?;
        Ok((value, rest))
    }
}

impl CborDecode for u64 {
    fn decode_unfinished(buf: &[u8]) -> Result<(Self, &[u8]), CborDecodeError> {
        decode_uint(buf)
    }
}

impl CborDecode for usize {
    fn decode_unfinished(buf: &[u8]) -> Result<(Self, &[u8]), CborDecodeError> {
        let (value, rest) = decode_uint(buf)?;
        let value = usize::try_from(value).map_err(|_| CborDecodeError::InvalidLength)?;
        Ok((value, rest))
    }
}

impl CborDecode for i64 {
    fn decode_unfinished(buf: &[u8]) -> Result<(Self, &[u8]), CborDecodeError> {
        let (major, value, rest) = decode_header(buf)?;
        match major {
            MAJOR_UINT => {
                let value = i64::try_from(value).map_err(|_| CborDecodeError::InvalidLength)?;
                Ok((value, rest))
            }
            MAJOR_NINT => {
                let value = i64::try_from(value).map_err(|_| CborDecodeError::InvalidLength)?;
                Ok((!value, rest))
            }
            _ => Err(CborDecodeError::UnexpectedType),
        }
    }
}

impl CborDecode for i32 {
    fn decode_unfinished(buf: &[u8]) -> Result<(Self, &[u8]), CborDecodeError> {
        let (value, rest) = i64::decode_unfinished(buf)?;
        let value = i32::try_from(value).map_err(|_| CborDecodeError::InvalidLength)?;
        Ok((value, rest))
    }
}

impl<const N: usize> CborDecode for [u8; N] {
    fn decode_unfinished(buf: &[u8]) -> Result<(Self, &[u8]), CborDecodeError> {
        let (bytes, rest) = decode_bytes(buf)?;
        let value: [u8; N] = bytes
            .try_into()
            .map_err(|_| CborDecodeError::InvalidLength)?;
        Ok((value, rest))
    }
}

impl CborDecode for String {
    fn decode_unfinished(buf: &[u8]) -> Result<(Self, &[u8]), CborDecodeError> {
        let (text, rest) = decode_text(buf)?;
        Ok((text.to_string(), rest))
    }
}

impl<T: CborDecode> CborDecode for Vec<T> {
    fn decode_unfinished(buf: &[u8]) -> Result<(Self, &[u8]), CborDecodeError> {
        let (len, mut rest) = decode_array_header(buf)?;
        let mut items = Vec::with_capacity(len.min(64));
        for _ in 0..len {
            let (item, remaining) = T::decode_unfinished(rest)?;
            items.push(item);
            rest = remaining;
        }
        Ok((items, rest))
    }
}

impl<T: CborDecode> CborDecode for Option<T> {
    fn decode_unfinished(buf: &[u8]) -> Result<(Self, &[u8]), CborDecodeError> {
        match buf.first() {
            Some(&CBOR_NULL) => Ok((None, &buf[1..])),
            Some(_) => {
                let (value, rest) = T::decode_unfinished(buf)?;
                Ok((Some(value), rest))
            }
            None => Err(CborDecodeError::UnexpectedEof),
        }
    }
}

impl CborDecode for IpAddr {
    fn decode_unfinished(buf: &[u8]) -> Result<(Self, &[u8]), CborDecodeError> {
        let (bytes, rest) = decode_bytes(buf)?;
        match bytes.len() {
            4 => {
                let octets: [u8; 4] = bytes.try_into().unwrap();
                Ok((IpAddr::V4(Ipv4Addr::from(octets)), rest))
            }
            16 => {
                let octets: [u8; 16] = bytes.try_into().unwrap();
                Ok((IpAddr::V6(Ipv6Addr::from(octets)), rest))
            }
            _ => Err(CborDecodeError::InvalidLength),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode::CborEncode;

    #[test]
    fn can_decode_uints() {
        assert_eq!(u32::decode(&[0x00]).unwrap(), 0);
        assert_eq!(u32::decode(&[0x17]).unwrap(), 23);
        assert_eq!(u32::decode(&[0x18, 0x18]).unwrap(), 24);
        assert_eq!(u32::decode(&[0x19, 0x12, 0x34]).unwrap(), 0x1234);
        assert_eq!(
            u32::decode(&[0x1a, 0x78, 0x90, 0x12, 0x34]).unwrap(),
            0x7890_1234
        );
        // fixed-width zero is still zero
        assert_eq!(u32::decode(&[0x1a, 0x00, 0x00, 0x00, 0x00]).unwrap(), 0);
    }

    #[test]
    fn can_decode_negative_ints() {
        assert_eq!(i32::decode(&[0x20]).unwrap(), -1);
        assert_eq!(i32::decode(&[0x38, 0x18]).unwrap(), -25);
        assert_eq!(i32::decode(&[0x05]).unwrap(), 5);
    }

    #[test]
    fn rejects_narrowing_overflow() {
        let encoded = 0x1_0000u32.encode_to_vec();
        assert_eq!(
            u16::decode(&encoded),
            Err(CborDecodeError::InvalidLength)
        );
    }

    #[test]
    fn can_decode_fixed_arrays() {
        let bytes = [0x11u8; 32];
        let encoded = bytes.encode_to_vec();
        assert_eq!(<[u8; 32]>::decode(&encoded).unwrap(), bytes);

        // wrong length is rejected
        let short = [0x11u8; 16].encode_to_vec();
        assert_eq!(
            <[u8; 32]>::decode(&short),
            Err(CborDecodeError::InvalidLength)
        );
    }

    #[test]
    fn can_decode_strings_and_vectors() {
        let encoded = "dog".encode_to_vec();
        assert_eq!(String::decode(&encoded).unwrap(), "dog");

        let list: Vec<u16> = vec![1, 500, 65_000];
        let encoded = list.encode_to_vec();
        assert_eq!(Vec::<u16>::decode(&encoded).unwrap(), list);
    }

    #[test]
    fn can_decode_options() {
        assert_eq!(Option::<u8>::decode(&[0xf6]).unwrap(), None);
        assert_eq!(Option::<u8>::decode(&[0x07]).unwrap(), Some(7));
    }

    #[test]
    fn can_skip_nested_items() {
        // [1, [2, 3], "ab"] followed by a trailing byte
        let data = hex_literal::hex!("83 01 82 02 03 62 61 62 aa");
        let rest = skip_item(&data).unwrap();
        assert_eq!(rest, &[0xaa]);
    }

    #[test]
    fn skip_handles_indefinite_maps() {
        // {_ "a": 1} followed by a trailing byte
        let data = [0xbf, 0x61, b'a', 0x01, 0xff, 0xbb];
        let rest = skip_item(&data).unwrap();
        assert_eq!(rest, &[0xbb]);
    }

    #[test]
    fn truncated_input_fails() {
        assert_eq!(
            u32::decode(&[0x1a, 0x00]),
            Err(CborDecodeError::UnexpectedEof)
        );
        assert_eq!(
            <[u8; 4]>::decode(&[0x44, 0x01]),
            Err(CborDecodeError::UnexpectedEof)
        );
    }
}
