use boson_cbor::decode::{decode_bytes, CborDecode};
use boson_cbor::encode::CborEncode;
use boson_cbor::error::CborDecodeError;
use boson_cbor::structs::{Decoder, Encoder};
use bytes::BufMut;
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};

use crate::id::Id;
use crate::peer::SIGNATURE_BYTES;

pub const NONCE_BYTES: usize = 24;

/// A stored value. Three flavors share one record:
/// immutable (`data` only, addressed by its hash), signed mutable
/// (key/nonce/sequence/signature, addressed by the owner key's hash) and
/// encrypted mutable (signed plus a `recipient`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Value {
    public_key: Option<Id>,
    recipient: Option<Id>,
    nonce: Option<[u8; NONCE_BYTES]>,
    sequence_number: i32,
    signature: Option<[u8; SIGNATURE_BYTES]>,
    data: Vec<u8>,
}

impl Value {
    pub fn immutable(data: Vec<u8>) -> Self {
        Self {
            public_key: None,
            recipient: None,
            nonce: None,
            sequence_number: 0,
            signature: None,
            data,
        }
    }

    /// Creates a signed mutable value. `recipient` marks the encrypted
    /// flavor; the data is carried opaquely either way.
    pub fn signed(
        keypair: &SigningKey,
        recipient: Option<Id>,
        nonce: [u8; NONCE_BYTES],
        sequence_number: i32,
        data: Vec<u8>,
    ) -> Self {
        let input = Self::sign_input(recipient.as_ref(), &nonce, sequence_number, &data);
        let signature = keypair.sign(&input).to_bytes();
        Self {
            public_key: Some(Id::new(keypair.verifying_key().to_bytes())),
            recipient,
            nonce: Some(nonce),
            sequence_number,
            signature: Some(signature),
            data,
        }
    }

    pub fn new(
        public_key: Option<Id>,
        recipient: Option<Id>,
        nonce: Option<[u8; NONCE_BYTES]>,
        sequence_number: i32,
        signature: Option<[u8; SIGNATURE_BYTES]>,
        data: Vec<u8>,
    ) -> Self {
        Self {
            public_key,
            recipient,
            nonce,
            sequence_number,
            signature,
            data,
        }
    }

    pub fn id(&self) -> Id {
        match &self.public_key {
            Some(key) => Id::of_public_key(key),
            None => Id::of_data(&self.data),
        }
    }

    pub fn public_key(&self) -> Option<&Id> {
        self.public_key.as_ref()
    }

    pub fn recipient(&self) -> Option<&Id> {
        self.recipient.as_ref()
    }

    pub fn nonce(&self) -> Option<&[u8; NONCE_BYTES]> {
        self.nonce.as_ref()
    }

    pub fn sequence_number(&self) -> i32 {
        self.sequence_number
    }

    pub fn signature(&self) -> Option<&[u8; SIGNATURE_BYTES]> {
        self.signature.as_ref()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn is_mutable(&self) -> bool {
        self.public_key.is_some()
    }

    pub fn is_encrypted(&self) -> bool {
        self.recipient.is_some()
    }

    fn sign_input(
        recipient: Option<&Id>,
        nonce: &[u8; NONCE_BYTES],
        sequence_number: i32,
        data: &[u8],
    ) -> Vec<u8> {
        let mut input = Vec::with_capacity(NONCE_BYTES + 36 + data.len());
        if let Some(recipient) = recipient {
            input.extend_from_slice(recipient.as_bytes());
        }
        input.extend_from_slice(nonce);
        input.extend_from_slice(&sequence_number.to_be_bytes());
        input.extend_from_slice(data);
        input
    }

    /// Immutable values are valid as such; mutable ones must carry a
    /// complete, verifying signature.
    pub fn is_valid(&self) -> bool {
        let Some(public_key) = &self.public_key else {
            return !self.data.is_empty();
        };
        let (Some(nonce), Some(signature)) = (&self.nonce, &self.signature) else {
            return false;
        };
        if self.sequence_number < 0 {
            return false;
        }
        let Ok(key) = VerifyingKey::from_bytes(public_key.as_bytes()) else {
            return false;
        };
        let input =
            Self::sign_input(self.recipient.as_ref(), nonce, self.sequence_number, &self.data);
        key.verify_strict(&input, &Signature::from_bytes(signature))
            .is_ok()
    }
}

impl CborEncode for Value {
    fn encode(&self, buf: &mut dyn BufMut) {
        Encoder::new(buf)
            .encode_optional_field("k", &self.public_key)
            .encode_optional_field("rec", &self.recipient)
            .encode_optional_field("n", &self.nonce)
            .encode_field_if(self.is_mutable(), "seq", &(self.sequence_number as u32))
            .encode_optional_field("sig", &self.signature)
            .encode_field("d", self.data.as_slice())
            .finish();
    }
}

impl CborDecode for Value {
    fn decode_unfinished(buf: &[u8]) -> Result<(Self, &[u8]), CborDecodeError> {
        let mut map = Decoder::new(buf)?;
        let mut public_key = None;
        let mut recipient = None;
        let mut nonce = None;
        let mut sequence_number = 0i32;
        let mut signature = None;
        let mut data = Vec::new();
        while let Some(key) = map.next_key()? {
            match key {
                "k" => public_key = Some(map.decode_field::<Id>()?),
                "rec" => recipient = Some(map.decode_field::<Id>()?),
                "n" => nonce = Some(map.decode_field::<[u8; NONCE_BYTES]>()?),
                "seq" => sequence_number = map.decode_field::<u32>()? as i32,
                "sig" => signature = Some(map.decode_field::<[u8; SIGNATURE_BYTES]>()?),
                "d" => data = map.decode_field::<DataBytes>()?.0,
                _ => map.skip_field()?,
            }
        }
        let value = Value::new(public_key, recipient, nonce, sequence_number, signature, data);
        Ok((value, map.finish()))
    }
}

/// Byte-string payload wrapper; `Vec<u8>` itself decodes as a CBOR array.
struct DataBytes(Vec<u8>);

impl CborDecode for DataBytes {
    fn decode_unfinished(buf: &[u8]) -> Result<(Self, &[u8]), CborDecodeError> {
        let (bytes, rest) = decode_bytes(buf)?;
        Ok((DataBytes(bytes.to_vec()), rest))
    }
}
