use boson_cbor::decode::{decode_array_header, CborDecode};
use boson_cbor::encode::{write_array_header, write_null, CborEncode};
use boson_cbor::error::CborDecodeError;
use bytes::BufMut;
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use sha2::{Digest, Sha256};

use crate::id::Id;

pub const SIGNATURE_BYTES: usize = 64;

/// A peer record: "the peer identified by `peer_id` is reachable through
/// the node `node_id` on `port`". The record is signed by the peer itself;
/// `peer_id` doubles as its Ed25519 public key.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    peer_id: Id,
    node_id: Id,
    origin: Option<Id>,
    port: u16,
    alternative_url: Option<String>,
    signature: [u8; SIGNATURE_BYTES],
    authenticated: bool,
}

impl PeerInfo {
    pub fn new(
        peer_id: Id,
        node_id: Id,
        origin: Option<Id>,
        port: u16,
        alternative_url: Option<String>,
        signature: [u8; SIGNATURE_BYTES],
    ) -> Self {
        Self {
            peer_id,
            node_id,
            origin,
            port,
            alternative_url,
            signature,
            authenticated: false,
        }
    }

    /// Creates and signs a record announcing the key holder itself.
    pub fn create(
        keypair: &SigningKey,
        node_id: Id,
        port: u16,
        alternative_url: Option<String>,
    ) -> Self {
        let peer_id = Id::new(keypair.verifying_key().to_bytes());
        let digest = Self::sign_input(&peer_id, port, alternative_url.as_deref());
        let signature = keypair.sign(&digest).to_bytes();
        Self {
            peer_id,
            node_id,
            origin: None,
            port,
            alternative_url,
            signature,
            authenticated: true,
        }
    }

    pub fn peer_id(&self) -> &Id {
        &self.peer_id
    }

    pub fn node_id(&self) -> &Id {
        &self.node_id
    }

    pub fn origin(&self) -> Option<&Id> {
        self.origin.as_ref()
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn alternative_url(&self) -> Option<&str> {
        self.alternative_url.as_deref()
    }

    pub fn signature(&self) -> &[u8; SIGNATURE_BYTES] {
        &self.signature
    }

    /// A record is delegated when somebody other than the peer itself
    /// announced it.
    pub fn is_delegated(&self) -> bool {
        self.origin.map_or(false, |origin| origin != self.peer_id)
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// The canonical byte sequence the signature covers.
    fn sign_input(peer_id: &Id, port: u16, alternative_url: Option<&str>) -> Vec<u8> {
        let mut input = Vec::with_capacity(34 + alternative_url.map_or(0, str::len));
        input.extend_from_slice(peer_id.as_bytes());
        input.extend_from_slice(&port.to_be_bytes());
        if let Some(url) = alternative_url {
            input.extend_from_slice(url.as_bytes());
        }
        input
    }

    pub fn is_valid(&self) -> bool {
        let Ok(key) = VerifyingKey::from_bytes(self.peer_id.as_bytes()) else {
            return false;
        };
        let input = Self::sign_input(&self.peer_id, self.port, self.alternative_url.as_deref());
        let signature = Signature::from_bytes(&self.signature);
        key.verify_strict(&input, &signature).is_ok()
    }

    /// Validates the record and remembers the outcome in the
    /// `authenticated` flag.
    pub fn validate(&mut self) -> bool {
        if self.is_valid() {
            self.authenticated = true;
            true
        } else {
            false
        }
    }

    /// Stable dedup key over the whole tuple; records differing in any
    /// field get distinct fingerprints.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = Sha256::new();
        hasher.update(self.peer_id.as_bytes());
        hasher.update(self.node_id.as_bytes());
        if let Some(origin) = &self.origin {
            hasher.update(origin.as_bytes());
        }
        hasher.update(self.port.to_be_bytes());
        if let Some(url) = &self.alternative_url {
            hasher.update(url.as_bytes());
        }
        hasher.update(self.signature);
        let digest = hasher.finalize();
        u64::from_be_bytes(digest[..8].try_into().unwrap())
    }

    /// Wire encoding. The peer id slot is nulled out when
    /// `omit_peer_id` holds; the receiver restores it from the envelope
    /// sender.
    pub(crate) fn encode_into(&self, omit_peer_id: bool, buf: &mut dyn BufMut) {
        write_array_header(6, buf);
        if omit_peer_id {
            write_null(buf);
        } else {
            self.peer_id.encode(buf);
        }
        self.node_id.encode(buf);
        self.origin.encode(buf);
        self.port.encode(buf);
        self.alternative_url.encode(buf);
        self.signature.encode(buf);
    }

    pub(crate) fn decode_unfinished_with<'a>(
        buf: &'a [u8],
        sender: Option<&Id>,
    ) -> Result<(Self, &'a [u8]), CborDecodeError> {
        let (len, rest) = decode_array_header(buf)?;
        if len != 6 {
            return Err(CborDecodeError::InvalidLength);
        }
        let (peer_id, rest) = Option::<Id>::decode_unfinished(rest)?;
        let (node_id, rest) = Id::decode_unfinished(rest)?;
        let (origin, rest) = Option::<Id>::decode_unfinished(rest)?;
        let (port, rest) = u16::decode_unfinished(rest)?;
        let (alternative_url, rest) = Option::<String>::decode_unfinished(rest)?;
        let (signature, rest) = <[u8; SIGNATURE_BYTES]>::decode_unfinished(rest)?;

        let peer_id = match (peer_id, sender) {
            (Some(id), _) => id,
            (None, Some(sender)) => *sender,
            (None, None) => return Err(CborDecodeError::MalformedData),
        };

        Ok((
            PeerInfo::new(peer_id, node_id, origin, port, alternative_url, signature),
            rest,
        ))
    }
}

// the authenticated flag is local bookkeeping, not part of the record's
// identity
impl PartialEq for PeerInfo {
    fn eq(&self, other: &Self) -> bool {
        self.peer_id == other.peer_id
            && self.node_id == other.node_id
            && self.origin == other.origin
            && self.port == other.port
            && self.alternative_url == other.alternative_url
            && self.signature == other.signature
    }
}

impl Eq for PeerInfo {}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    fn keypair() -> SigningKey {
        SigningKey::generate(&mut OsRng)
    }

    #[test]
    fn created_records_verify() {
        let peer = PeerInfo::create(&keypair(), Id::random(), 8090, None);
        assert!(peer.is_valid());
        assert!(peer.is_authenticated());
        assert!(!peer.is_delegated());

        let with_url = PeerInfo::create(
            &keypair(),
            Id::random(),
            8090,
            Some("https://alt.example.com".to_string()),
        );
        assert!(with_url.is_valid());
    }

    #[test]
    fn tampered_records_fail() {
        let good = PeerInfo::create(&keypair(), Id::random(), 8090, None);
        let mut bad = PeerInfo::new(
            *good.peer_id(),
            *good.node_id(),
            None,
            8091, // port not covered by the original signature
            None,
            *good.signature(),
        );
        assert!(!bad.is_valid());
        assert!(!bad.validate());
        assert!(!bad.is_authenticated());
    }

    #[test]
    fn fingerprint_distinguishes_announcers() {
        let key = keypair();
        let a = PeerInfo::create(&key, Id::random(), 8090, None);
        let b = PeerInfo::create(&key, Id::random(), 8090, None);
        assert_eq!(a.peer_id(), b.peer_id());
        assert_ne!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint(), a.clone().fingerprint());
    }

    #[test]
    fn wire_roundtrip_preserves_fields() {
        let peer = PeerInfo::create(&keypair(), Id::random(), 8090, Some("alt".into()));
        let mut buf = Vec::new();
        peer.encode_into(false, &mut buf);
        let (decoded, rest) = PeerInfo::decode_unfinished_with(&buf, None).unwrap();
        assert!(rest.is_empty());
        // the authenticated flag is local state, not wire state
        assert_eq!(decoded.peer_id(), peer.peer_id());
        assert_eq!(decoded.node_id(), peer.node_id());
        assert_eq!(decoded.port(), peer.port());
        assert_eq!(decoded.alternative_url(), peer.alternative_url());
        assert!(decoded.is_valid());
    }

    #[test]
    fn elided_peer_id_needs_sender_context() {
        let key = keypair();
        let peer = PeerInfo::create(&key, Id::random(), 8090, None);
        let mut buf = Vec::new();
        peer.encode_into(true, &mut buf);

        assert!(PeerInfo::decode_unfinished_with(&buf, None).is_err());

        let sender = *peer.peer_id();
        let (decoded, _) = PeerInfo::decode_unfinished_with(&buf, Some(&sender)).unwrap();
        assert_eq!(decoded.peer_id(), peer.peer_id());
        assert!(decoded.is_valid());
    }
}
