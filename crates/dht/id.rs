use std::cmp::Ordering;
use std::fmt;

use boson_cbor::decode::CborDecode;
use boson_cbor::encode::CborEncode;
use boson_cbor::error::CborDecodeError;
use bytes::BufMut;
use rand::RngCore;
use sha2::{Digest, Sha256};

pub const ID_BYTES: usize = 32;
pub const ID_BITS: usize = ID_BYTES * 8;

/// A 256-bit node or content identifier. Ids are plain values; the XOR
/// metric below is the only structure the lookup engine relies on.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Id([u8; ID_BYTES]);

impl Id {
    pub const MIN: Id = Id([0; ID_BYTES]);
    pub const MAX: Id = Id([0xff; ID_BYTES]);

    pub const fn new(bytes: [u8; ID_BYTES]) -> Self {
        Id(bytes)
    }

    pub fn random() -> Self {
        let mut bytes = [0u8; ID_BYTES];
        rand::thread_rng().fill_bytes(&mut bytes);
        Id(bytes)
    }

    /// The id of an immutable blob: SHA-256 over its content.
    pub fn of_data(data: &[u8]) -> Self {
        Id(Sha256::digest(data).into())
    }

    /// The id of a mutable record: SHA-256 over the owner's public key.
    pub fn of_public_key(public_key: &Id) -> Self {
        Id(Sha256::digest(public_key.as_bytes()).into())
    }

    pub fn as_bytes(&self) -> &[u8; ID_BYTES] {
        &self.0
    }

    /// XOR distance, itself an id-sized value.
    pub fn distance(&self, other: &Id) -> Id {
        let mut bytes = [0u8; ID_BYTES];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = self.0[i] ^ other.0[i];
        }
        Id(bytes)
    }

    /// ⌊log₂(distance)⌋, or -1 for identical ids. Only used to render
    /// distance shells in log output.
    pub fn approx_distance(&self, other: &Id) -> i32 {
        let distance = self.distance(other);
        for (i, b) in distance.0.iter().enumerate() {
            if *b != 0 {
                return (ID_BITS - 1 - i * 8 - b.leading_zeros() as usize) as i32;
            }
        }
        -1
    }

    /// Orders `a` and `b` by their distance from `self`.
    pub fn three_way_compare(&self, a: &Id, b: &Id) -> Ordering {
        for i in 0..ID_BYTES {
            let da = self.0[i] ^ a.0[i];
            let db = self.0[i] ^ b.0[i];
            if da != db {
                return da.cmp(&db);
            }
        }
        Ordering::Equal
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // the leading bytes carry the bucket structure, that prefix is
        // enough to tell ids apart in logs
        write!(f, "{}..", hex::encode(&self.0[..8]))
    }
}

impl From<[u8; ID_BYTES]> for Id {
    fn from(bytes: [u8; ID_BYTES]) -> Self {
        Id(bytes)
    }
}

impl TryFrom<&[u8]> for Id {
    type Error = CborDecodeError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        let bytes: [u8; ID_BYTES] = bytes
            .try_into()
            .map_err(|_| CborDecodeError::InvalidLength)?;
        Ok(Id(bytes))
    }
}

impl CborEncode for Id {
    fn encode(&self, buf: &mut dyn BufMut) {
        self.0.encode(buf)
    }
}

impl CborDecode for Id {
    fn decode_unfinished(buf: &[u8]) -> Result<(Self, &[u8]), CborDecodeError> {
        let (bytes, rest) = <[u8; ID_BYTES]>::decode_unfinished(buf)?;
        Ok((Id(bytes), rest))
    }
}
