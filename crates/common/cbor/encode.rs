use bytes::BufMut;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use tinyvec::ArrayVec;

use super::constants::{
    CBOR_FALSE, CBOR_NULL, CBOR_TRUE, INFO_U16, INFO_U32, INFO_U64, INFO_U8, MAJOR_ARRAY,
    MAJOR_BYTES, MAJOR_NINT, MAJOR_TEXT, MAJOR_UINT,
};

/// Function for encoding a value to CBOR.
/// For encoding the value into a buffer directly, use [`CborEncode::encode`].
pub fn encode<T: CborEncode>(value: T) -> Vec<u8> {
    let mut buf = Vec::new();
    value.encode(&mut buf);
    buf
}

/// Writes a major-type header with the shortest argument width that can
/// hold `value`.
pub fn write_header(major: u8, value: u64, buf: &mut dyn BufMut) {
    match value {
        0..=23 => buf.put_u8(major | value as u8),
        24..=0xff => {
            buf.put_u8(major | INFO_U8);
            buf.put_u8(value as u8);
        }
        0x100..=0xffff => {
            buf.put_u8(major | INFO_U16);
            let mut bytes = ArrayVec::<[u8; 8]>::new();
            bytes.extend_from_slice(&value.to_be_bytes());
            buf.put_slice(&bytes[6..]);
        }
        0x1_0000..=0xffff_ffff => {
            buf.put_u8(major | INFO_U32);
            let mut bytes = ArrayVec::<[u8; 8]>::new();
            bytes.extend_from_slice(&value.to_be_bytes());
            buf.put_slice(&bytes[4..]);
        }
        _ => {
            buf.put_u8(major | INFO_U64);
            buf.put_slice(&value.to_be_bytes());
        }
    }
}

/// Writes an unsigned integer as a full-width 4-byte argument regardless of
/// its value. Used for fields whose wire width must not depend on content.
pub fn write_u32_fixed(value: u32, buf: &mut dyn BufMut) {
    buf.put_u8(MAJOR_UINT | INFO_U32);
    buf.put_slice(&value.to_be_bytes());
}

pub fn write_array_header(len: usize, buf: &mut dyn BufMut) {
    write_header(MAJOR_ARRAY, len as u64, buf);
}

pub fn write_null(buf: &mut dyn BufMut) {
    buf.put_u8(CBOR_NULL);
}

pub trait CborEncode {
    fn encode(&self, buf: &mut dyn BufMut);

    fn length(&self) -> usize {
        let mut buf = Vec::new();
        self.encode(&mut buf);
        buf.len()
    }

    fn encode_to_vec(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode(&mut buf);
        buf
    }
}

impl CborEncode for bool {
    #[inline(always)]
    fn encode(&self, buf: &mut dyn BufMut) {
        buf.put_u8(if *self { CBOR_TRUE } else { CBOR_FALSE });
    }

    #[inline(always)]
    fn length(&self) -> usize {
        1
    }
}

// integer types impls

impl CborEncode for u8 {
    fn encode(&self, buf: &mut dyn BufMut) {
        write_header(MAJOR_UINT, u64::from(*self), buf);
    }
}

impl CborEncode for u16 {
    fn encode(&self, buf: &mut dyn BufMut) {
        write_header(MAJOR_UINT, u64::from(*self), buf);
    }
}

impl CborEncode for u32 {
    fn encode(&self, buf: &mut dyn BufMut) {
        write_header(MAJOR_UINT, u64::from(*self), buf);
    }
}

impl CborEncode for u64 {
    fn encode(&self, buf: &mut dyn BufMut) {
        write_header(MAJOR_UINT, *self, buf);
    }
}

impl CborEncode for usize {
    fn encode(&self, buf: &mut dyn BufMut) {
        write_header(MAJOR_UINT, *self as u64, buf);
    }
}

impl CborEncode for i32 {
    fn encode(&self, buf: &mut dyn BufMut) {
        i64::from(*self).encode(buf);
    }
}

impl CborEncode for i64 {
    fn encode(&self, buf: &mut dyn BufMut) {
        if *self >= 0 {
            write_header(MAJOR_UINT, *self as u64, buf);
        } else {
            write_header(MAJOR_NINT, !(*self) as u64, buf);
        }
    }
}

impl CborEncode for [u8] {
    fn encode(&self, buf: &mut dyn BufMut) {
        write_header(MAJOR_BYTES, self.len() as u64, buf);
        buf.put_slice(self);
    }
}

impl<const N: usize> CborEncode for [u8; N] {
    fn encode(&self, buf: &mut dyn BufMut) {
        self.as_ref().encode(buf)
    }
}

impl CborEncode for str {
    fn encode(&self, buf: &mut dyn BufMut) {
        write_header(MAJOR_TEXT, self.len() as u64, buf);
        buf.put_slice(self.as_bytes());
    }
}

impl CborEncode for &str {
    fn encode(&self, buf: &mut dyn BufMut) {
        (**self).encode(buf)
    }
}

impl CborEncode for String {
    fn encode(&self, buf: &mut dyn BufMut) {
        self.as_str().encode(buf)
    }
}

impl<T: CborEncode> CborEncode for Vec<T> {
    fn encode(&self, buf: &mut dyn BufMut) {
        write_array_header(self.len(), buf);
        for item in self {
            item.encode(buf);
        }
    }
}

impl<T: CborEncode> CborEncode for Option<T> {
    fn encode(&self, buf: &mut dyn BufMut) {
        match self {
            Some(value) => value.encode(buf),
            None => buf.put_u8(CBOR_NULL),
        }
    }
}

impl CborEncode for Ipv4Addr {
    fn encode(&self, buf: &mut dyn BufMut) {
        self.octets().encode(buf)
    }
}

impl CborEncode for Ipv6Addr {
    fn encode(&self, buf: &mut dyn BufMut) {
        self.octets().encode(buf)
    }
}

impl CborEncode for IpAddr {
    fn encode(&self, buf: &mut dyn BufMut) {
        match self {
            IpAddr::V4(ip) => ip.encode(buf),
            IpAddr::V6(ip) => ip.encode(buf),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn can_encode_booleans() {
        let mut encoded = Vec::new();
        true.encode(&mut encoded);
        assert_eq!(encoded, vec![CBOR_TRUE]);

        let mut encoded = Vec::new();
        false.encode(&mut encoded);
        assert_eq!(encoded, vec![CBOR_FALSE]);
    }

    #[test]
    fn can_encode_uints() {
        let mut encoded = Vec::new();
        0u8.encode(&mut encoded);
        assert_eq!(encoded, vec![0x00]);

        let mut encoded = Vec::new();
        23u8.encode(&mut encoded);
        assert_eq!(encoded, vec![0x17]);

        let mut encoded = Vec::new();
        24u8.encode(&mut encoded);
        assert_eq!(encoded, vec![0x18, 0x18]);

        let mut encoded = Vec::new();
        0x1234u16.encode(&mut encoded);
        assert_eq!(encoded, vec![0x19, 0x12, 0x34]);

        let mut encoded = Vec::new();
        0x7890_1234u32.encode(&mut encoded);
        assert_eq!(encoded, vec![0x1a, 0x78, 0x90, 0x12, 0x34]);

        let mut encoded = Vec::new();
        0x0102_0304_0506_0708u64.encode(&mut encoded);
        assert_eq!(
            encoded,
            vec![0x1b, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08]
        );
    }

    #[test]
    fn can_encode_negative_ints() {
        let mut encoded = Vec::new();
        (-1i32).encode(&mut encoded);
        assert_eq!(encoded, vec![0x20]);

        let mut encoded = Vec::new();
        (-25i32).encode(&mut encoded);
        assert_eq!(encoded, vec![0x38, 0x18]);

        let mut encoded = Vec::new();
        5i32.encode(&mut encoded);
        assert_eq!(encoded, vec![0x05]);
    }

    #[test]
    fn can_encode_fixed_width_u32() {
        let mut encoded = Vec::new();
        write_u32_fixed(0, &mut encoded);
        assert_eq!(encoded, vec![0x1a, 0x00, 0x00, 0x00, 0x00]);

        let mut encoded = Vec::new();
        write_u32_fixed(0x7890_1234, &mut encoded);
        assert_eq!(encoded, vec![0x1a, 0x78, 0x90, 0x12, 0x34]);
    }

    #[test]
    fn can_encode_bytes() {
        let message: [u8; 2] = [0x04, 0x00];
        let encoded = {
            let mut buf = vec![];
            message.encode(&mut buf);
            buf
        };
        assert_eq!(encoded, vec![0x42, 0x04, 0x00]);

        let long = [0xaau8; 32];
        let encoded = {
            let mut buf = vec![];
            long.encode(&mut buf);
            buf
        };
        assert_eq!(encoded[..2], [0x58, 0x20]);
        assert_eq!(encoded.len(), 34);
    }

    #[test]
    fn can_encode_strings() {
        let message = "dog";
        let encoded = {
            let mut buf = vec![];
            message.encode(&mut buf);
            buf
        };
        let expected: [u8; 4] = [0x63, b'd', b'o', b'g'];
        assert_eq!(encoded, expected);

        let message = "";
        let encoded = {
            let mut buf = vec![];
            message.encode(&mut buf);
            buf
        };
        assert_eq!(encoded, vec![0x60]);
    }

    #[test]
    fn can_encode_arrays() {
        let message: Vec<u8> = vec![1, 2, 3];
        let encoded = {
            let mut buf = vec![];
            message.encode(&mut buf);
            buf
        };
        assert_eq!(encoded, vec![0x83, 0x01, 0x02, 0x03]);

        let message: Vec<u8> = vec![];
        let encoded = {
            let mut buf = vec![];
            message.encode(&mut buf);
            buf
        };
        assert_eq!(encoded, vec![0x80]);
    }

    #[test]
    fn can_encode_options() {
        let mut encoded = Vec::new();
        Option::<u8>::None.encode(&mut encoded);
        assert_eq!(encoded, vec![CBOR_NULL]);

        let mut encoded = Vec::new();
        Some(7u8).encode(&mut encoded);
        assert_eq!(encoded, vec![0x07]);
    }

    #[test]
    fn can_encode_ip() {
        let ip: IpAddr = "192.168.0.1".parse().unwrap();
        let encoded = {
            let mut buf = vec![];
            ip.encode(&mut buf);
            buf
        };
        let expected: [u8; 5] = [0x44, 192, 168, 0, 1];
        assert_eq!(encoded, expected);

        let ip: IpAddr = "2001:0000:130F:0000:0000:09C0:876A:130B".parse().unwrap();
        let encoded = {
            let mut buf = vec![];
            ip.encode(&mut buf);
            buf
        };
        let expected: [u8; 17] = [
            0x50, 0x20, 0x01, 0x00, 0x00, 0x13, 0x0f, 0x00, 0x00, 0x00, 0x00, 0x09, 0xc0, 0x87,
            0x6a, 0x13, 0x0b,
        ];
        assert_eq!(encoded, expected);
    }
}
