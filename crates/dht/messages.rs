use std::fmt;

use boson_cbor::decode::decode_array_header;
use boson_cbor::encode::{write_array_header, CborEncode};
use boson_cbor::structs::{Decoder, Encoder};
use bytes::BufMut;
use rand::Rng;

use crate::error::MessageError;
use crate::id::Id;
use crate::node::NodeInfo;
use crate::peer::PeerInfo;
use crate::value::Value;

/// Bytes of an encoded message with no body: the envelope map holding the
/// composite, txid and version fields.
pub const ENVELOPE_SIZE: usize = 20;
/// Worst-case encoding of one NodeInfo entry.
const NODE_INFO_SIZE: usize = 55;
/// Worst-case encoding of one PeerInfo entry, excluding the URL.
const PEER_INFO_SIZE: usize = 176;
/// Worst-case fixed overhead of a value map, excluding the data.
const VALUE_SIZE: usize = 200;

pub const WANT_IPV4: u8 = 0x01;
pub const WANT_IPV6: u8 = 0x02;
pub const WANT_TOKEN: u8 = 0x04;

// Reserved wire error codes; everything above is domain-defined.
pub const ERR_GENERIC: i32 = 201;
pub const ERR_SERVER: i32 = 202;
pub const ERR_PROTOCOL: i32 = 203;
pub const ERR_UNKNOWN_METHOD: i32 = 204;
pub const ERR_TOKEN_MISMATCH: i32 = 205;
pub const ERR_SEQUENCE_CONFLICT: i32 = 206;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Request = 0x20,
    Response = 0x40,
    Error = 0x60,
}

impl MessageType {
    fn from_composite(composite: u8) -> Result<Self, MessageError> {
        match composite & 0xe0 {
            0x20 => Ok(MessageType::Request),
            0x40 => Ok(MessageType::Response),
            0x60 => Ok(MessageType::Error),
            other => Err(MessageError::UnknownType(other)),
        }
    }

    fn body_key(self) -> &'static str {
        match self {
            MessageType::Request => "q",
            MessageType::Response => "r",
            MessageType::Error => "e",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Ping = 0x00,
    FindNode = 0x01,
    FindPeer = 0x02,
    FindValue = 0x03,
    StoreValue = 0x04,
    AnnouncePeer = 0x05,
}

impl Method {
    fn from_composite(composite: u8) -> Result<Self, MessageError> {
        match composite & 0x1f {
            0x00 => Ok(Method::Ping),
            0x01 => Ok(Method::FindNode),
            0x02 => Ok(Method::FindPeer),
            0x03 => Ok(Method::FindValue),
            0x04 => Ok(Method::StoreValue),
            0x05 => Ok(Method::AnnouncePeer),
            other => Err(MessageError::UnknownMethod(other)),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Method::Ping => "ping",
            Method::FindNode => "find_node",
            Method::FindPeer => "find_peer",
            Method::FindValue => "find_value",
            Method::StoreValue => "store_value",
            Method::AnnouncePeer => "announce_peer",
        };
        f.write_str(name)
    }
}

/// Builds the wire version field: a two-ASCII-char implementation tag in
/// the high half, the major version in the low half.
pub fn version_tag(name: &[u8; 2], major: u16) -> u32 {
    (u32::from(u16::from_be_bytes(*name)) << 16) | u32::from(major)
}

/// Renders a version field as `"<name>/<major>"`, `"N/A"` when unset.
pub fn readable_version(version: u32) -> String {
    if version == 0 {
        return "N/A".to_string();
    }
    let name = ((version >> 16) as u16).to_be_bytes();
    if name.iter().all(u8::is_ascii_alphanumeric) {
        format!(
            "{}{}/{}",
            name[0] as char,
            name[1] as char,
            version & 0xffff
        )
    } else {
        format!("{version:#010x}")
    }
}

pub fn generate_txid() -> u32 {
    rand::thread_rng().gen_range(1..=u32::MAX)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FindNodeRequest {
    pub target: Id,
    pub want4: bool,
    pub want6: bool,
    pub want_token: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FindNodeResponse {
    pub nodes4: Vec<NodeInfo>,
    pub nodes6: Vec<NodeInfo>,
    pub token: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FindPeerRequest {
    pub target: Id,
    pub want4: bool,
    pub want6: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FindPeerResponse {
    pub nodes4: Vec<NodeInfo>,
    pub nodes6: Vec<NodeInfo>,
    pub peers: Vec<PeerInfo>,
    pub token: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FindValueRequest {
    pub target: Id,
    pub want4: bool,
    pub want6: bool,
    /// Lowest acceptable sequence number; -1 accepts any version.
    pub sequence_number: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FindValueResponse {
    pub nodes4: Vec<NodeInfo>,
    pub nodes6: Vec<NodeInfo>,
    pub value: Option<Value>,
    pub token: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreValueRequest {
    pub token: u32,
    pub value: Value,
    /// Compare-and-swap floor; -1 disables the check.
    pub expected_sequence_number: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnouncePeerRequest {
    pub token: u32,
    pub peer: PeerInfo,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorBody {
    pub method: Method,
    pub code: i32,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageBody {
    PingRequest,
    PingResponse,
    FindNodeRequest(FindNodeRequest),
    FindNodeResponse(FindNodeResponse),
    FindPeerRequest(FindPeerRequest),
    FindPeerResponse(FindPeerResponse),
    FindValueRequest(FindValueRequest),
    FindValueResponse(FindValueResponse),
    StoreValueRequest(StoreValueRequest),
    StoreValueResponse,
    AnnouncePeerRequest(AnnouncePeerRequest),
    AnnouncePeerResponse,
    Error(ErrorBody),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub txid: u32,
    pub version: u32,
    /// Authenticated sender, supplied by the transport on parse. Never on
    /// the wire.
    pub sender: Option<Id>,
    pub body: MessageBody,
}

impl Message {
    fn new(txid: u32, body: MessageBody) -> Self {
        Self {
            txid,
            version: 0,
            sender: None,
            body,
        }
    }

    pub fn ping_request(txid: u32) -> Self {
        Self::new(txid, MessageBody::PingRequest)
    }

    pub fn ping_response(txid: u32) -> Self {
        Self::new(txid, MessageBody::PingResponse)
    }

    pub fn find_node_request(txid: u32, target: Id, want4: bool, want6: bool, want_token: bool) -> Self {
        Self::new(
            txid,
            MessageBody::FindNodeRequest(FindNodeRequest {
                target,
                want4,
                want6,
                want_token,
            }),
        )
    }

    pub fn find_node_response(txid: u32, nodes4: Vec<NodeInfo>, nodes6: Vec<NodeInfo>, token: u32) -> Self {
        Self::new(
            txid,
            MessageBody::FindNodeResponse(FindNodeResponse {
                nodes4,
                nodes6,
                token,
            }),
        )
    }

    pub fn find_peer_request(txid: u32, target: Id, want4: bool, want6: bool) -> Self {
        Self::new(
            txid,
            MessageBody::FindPeerRequest(FindPeerRequest {
                target,
                want4,
                want6,
            }),
        )
    }

    pub fn find_peer_response(
        txid: u32,
        nodes4: Vec<NodeInfo>,
        nodes6: Vec<NodeInfo>,
        peers: Vec<PeerInfo>,
        token: u32,
    ) -> Self {
        Self::new(
            txid,
            MessageBody::FindPeerResponse(FindPeerResponse {
                nodes4,
                nodes6,
                peers,
                token,
            }),
        )
    }

    pub fn find_value_request(
        txid: u32,
        target: Id,
        want4: bool,
        want6: bool,
        sequence_number: i32,
    ) -> Self {
        Self::new(
            txid,
            MessageBody::FindValueRequest(FindValueRequest {
                target,
                want4,
                want6,
                sequence_number,
            }),
        )
    }

    pub fn find_value_response(
        txid: u32,
        nodes4: Vec<NodeInfo>,
        nodes6: Vec<NodeInfo>,
        value: Option<Value>,
        token: u32,
    ) -> Self {
        Self::new(
            txid,
            MessageBody::FindValueResponse(FindValueResponse {
                nodes4,
                nodes6,
                value,
                token,
            }),
        )
    }

    pub fn store_value_request(txid: u32, token: u32, value: Value, expected_sequence_number: i32) -> Self {
        Self::new(
            txid,
            MessageBody::StoreValueRequest(StoreValueRequest {
                token,
                value,
                expected_sequence_number,
            }),
        )
    }

    pub fn store_value_response(txid: u32) -> Self {
        Self::new(txid, MessageBody::StoreValueResponse)
    }

    pub fn announce_peer_request(txid: u32, token: u32, peer: PeerInfo) -> Self {
        Self::new(txid, MessageBody::AnnouncePeerRequest(AnnouncePeerRequest { token, peer }))
    }

    pub fn announce_peer_response(txid: u32) -> Self {
        Self::new(txid, MessageBody::AnnouncePeerResponse)
    }

    pub fn error(txid: u32, method: Method, code: i32, message: impl Into<String>) -> Self {
        Self::new(
            txid,
            MessageBody::Error(ErrorBody {
                method,
                code,
                message: message.into(),
            }),
        )
    }

    pub fn with_sender(mut self, sender: Id) -> Self {
        self.sender = Some(sender);
        self
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn msg_type(&self) -> MessageType {
        match &self.body {
            MessageBody::PingRequest
            | MessageBody::FindNodeRequest(_)
            | MessageBody::FindPeerRequest(_)
            | MessageBody::FindValueRequest(_)
            | MessageBody::StoreValueRequest(_)
            | MessageBody::AnnouncePeerRequest(_) => MessageType::Request,
            MessageBody::PingResponse
            | MessageBody::FindNodeResponse(_)
            | MessageBody::FindPeerResponse(_)
            | MessageBody::FindValueResponse(_)
            | MessageBody::StoreValueResponse
            | MessageBody::AnnouncePeerResponse => MessageType::Response,
            MessageBody::Error(_) => MessageType::Error,
        }
    }

    pub fn method(&self) -> Method {
        match &self.body {
            MessageBody::PingRequest | MessageBody::PingResponse => Method::Ping,
            MessageBody::FindNodeRequest(_) | MessageBody::FindNodeResponse(_) => Method::FindNode,
            MessageBody::FindPeerRequest(_) | MessageBody::FindPeerResponse(_) => Method::FindPeer,
            MessageBody::FindValueRequest(_) | MessageBody::FindValueResponse(_) => Method::FindValue,
            MessageBody::StoreValueRequest(_) | MessageBody::StoreValueResponse => Method::StoreValue,
            MessageBody::AnnouncePeerRequest(_) | MessageBody::AnnouncePeerResponse => {
                Method::AnnouncePeer
            }
            MessageBody::Error(body) => body.method,
        }
    }

    fn composite(&self) -> u8 {
        self.msg_type() as u8 | self.method() as u8
    }

    /// The token a lookup response granted, zero when absent.
    pub fn token(&self) -> u32 {
        match &self.body {
            MessageBody::FindNodeResponse(body) => body.token,
            MessageBody::FindPeerResponse(body) => body.token,
            MessageBody::FindValueResponse(body) => body.token,
            _ => 0,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.estimated_size());
        self.encode_into(&mut buf);
        buf
    }

    pub fn encode_into(&self, buf: &mut dyn BufMut) {
        let encoder = Encoder::new(buf)
            .encode_field("y", &self.composite())
            .encode_fixed_u32_field("t", self.txid)
            .encode_fixed_u32_field("v", self.version);
        let encoder = self.encode_body(encoder);
        encoder.finish();
    }

    /// Empty bodies stay off the wire entirely; such messages are exactly
    /// the 20-byte envelope.
    fn has_body(&self) -> bool {
        match &self.body {
            MessageBody::PingRequest
            | MessageBody::PingResponse
            | MessageBody::StoreValueResponse
            | MessageBody::AnnouncePeerResponse => false,
            MessageBody::FindNodeResponse(body) => {
                !body.nodes4.is_empty() || !body.nodes6.is_empty() || body.token != 0
            }
            MessageBody::FindPeerResponse(body) => {
                !body.nodes4.is_empty()
                    || !body.nodes6.is_empty()
                    || !body.peers.is_empty()
                    || body.token != 0
            }
            MessageBody::FindValueResponse(body) => {
                !body.nodes4.is_empty()
                    || !body.nodes6.is_empty()
                    || body.value.is_some()
                    || body.token != 0
            }
            _ => true,
        }
    }

    fn encode_body<'a>(&self, encoder: Encoder<'a>) -> Encoder<'a> {
        if !self.has_body() {
            return encoder;
        }
        let key = self.msg_type().body_key();
        let mut body = Vec::new();
        self.encode_body_map(&mut body);
        // splice the pre-encoded body map in as the field value
        encoder.encode_field(key, &RawCbor(&body))
    }

    fn encode_body_map(&self, buf: &mut dyn BufMut) {
        match &self.body {
            MessageBody::FindNodeRequest(body) => {
                let want = want_flags(body.want4, body.want6, body.want_token);
                Encoder::new(buf)
                    .encode_field("t", &body.target)
                    .encode_field("w", &want)
                    .finish();
            }
            MessageBody::FindNodeResponse(body) => {
                encode_lookup_response(buf, &body.nodes4, &body.nodes6, body.token, |e| e);
            }
            MessageBody::FindPeerRequest(body) => {
                let want = want_flags(body.want4, body.want6, false);
                Encoder::new(buf)
                    .encode_field("t", &body.target)
                    .encode_field("w", &want)
                    .finish();
            }
            MessageBody::FindPeerResponse(body) => {
                let peers = PeerList {
                    peers: &body.peers,
                    sender: self.sender,
                };
                encode_lookup_response(buf, &body.nodes4, &body.nodes6, body.token, |e| {
                    if body.peers.is_empty() {
                        e
                    } else {
                        e.encode_field("p", &peers)
                    }
                });
            }
            MessageBody::FindValueRequest(body) => {
                let want = want_flags(body.want4, body.want6, false);
                Encoder::new(buf)
                    .encode_field("t", &body.target)
                    .encode_field("w", &want)
                    .encode_field_if(body.sequence_number >= 0, "seq", &body.sequence_number)
                    .finish();
            }
            MessageBody::FindValueResponse(body) => {
                encode_lookup_response(buf, &body.nodes4, &body.nodes6, body.token, |e| {
                    e.encode_optional_field("v", &body.value)
                });
            }
            MessageBody::StoreValueRequest(body) => {
                Encoder::new(buf)
                    .encode_field("tok", &body.token)
                    .encode_field("v", &body.value)
                    .encode_field_if(
                        body.expected_sequence_number >= 0,
                        "cas",
                        &body.expected_sequence_number,
                    )
                    .finish();
            }
            MessageBody::AnnouncePeerRequest(body) => {
                let omit_peer_id = self.sender.as_ref() == Some(body.peer.peer_id());
                let mut peer = Vec::new();
                body.peer.encode_into(omit_peer_id, &mut peer);
                Encoder::new(buf)
                    .encode_field("tok", &body.token)
                    .encode_field("p", &RawCbor(&peer))
                    .finish();
            }
            MessageBody::Error(body) => {
                Encoder::new(buf)
                    .encode_field("c", &body.code)
                    .encode_field("m", body.message.as_str())
                    .finish();
            }
            MessageBody::PingRequest
            | MessageBody::PingResponse
            | MessageBody::StoreValueResponse
            | MessageBody::AnnouncePeerResponse => {}
        }
    }

    /// Upper bound on the encoded size; `encode().len()` never exceeds it.
    pub fn estimated_size(&self) -> usize {
        let body = match &self.body {
            MessageBody::PingRequest
            | MessageBody::PingResponse
            | MessageBody::StoreValueResponse
            | MessageBody::AnnouncePeerResponse => 0,
            MessageBody::FindNodeRequest(_)
            | MessageBody::FindPeerRequest(_)
            | MessageBody::FindValueRequest(_) => 64,
            MessageBody::FindNodeResponse(body) => {
                lookup_response_size(&body.nodes4, &body.nodes6)
            }
            MessageBody::FindPeerResponse(body) => {
                lookup_response_size(&body.nodes4, &body.nodes6)
                    + body
                        .peers
                        .iter()
                        .map(|p| PEER_INFO_SIZE + p.alternative_url().map_or(0, str::len))
                        .sum::<usize>()
                    + 16
            }
            MessageBody::FindValueResponse(body) => {
                lookup_response_size(&body.nodes4, &body.nodes6)
                    + body
                        .value
                        .as_ref()
                        .map_or(0, |v| VALUE_SIZE + v.data().len())
            }
            MessageBody::StoreValueRequest(body) => VALUE_SIZE + body.value.data().len() + 32,
            MessageBody::AnnouncePeerRequest(body) => {
                PEER_INFO_SIZE + body.peer.alternative_url().map_or(0, str::len) + 32
            }
            MessageBody::Error(body) => body.message.len() + 32,
        };
        ENVELOPE_SIZE + body
    }

    pub fn parse(buf: &[u8]) -> Result<Self, MessageError> {
        Self::parse_internal(buf, None)
    }

    /// Parse with the authenticated sender id from the transport; needed
    /// to restore elided peer ids and recorded on the message.
    pub fn parse_with_sender(buf: &[u8], sender: Id) -> Result<Self, MessageError> {
        Self::parse_internal(buf, Some(sender))
    }

    fn parse_internal(buf: &[u8], sender: Option<Id>) -> Result<Self, MessageError> {
        let mut map = Decoder::new(buf)?;
        let mut composite = None;
        let mut txid = 0u32;
        let mut version = 0u32;
        let mut body: Option<(&str, &[u8])> = None;
        while let Some(key) = map.next_key()? {
            match key {
                "y" => composite = Some(map.decode_field::<u8>()?),
                "t" => txid = map.decode_field::<u32>()?,
                "v" => version = map.decode_field::<u32>()?,
                "q" | "r" | "e" => body = Some((key, map.raw_field()?)),
                _ => map.skip_field()?,
            }
        }
        let composite = composite.ok_or(MessageError::InvalidMessage("missing type field"))?;
        let msg_type = MessageType::from_composite(composite)?;
        let method = Method::from_composite(composite)?;

        if let Some((key, _)) = body {
            if key != msg_type.body_key() {
                return Err(MessageError::InvalidMessage("body key does not match type"));
            }
        }
        let body = Self::parse_body(msg_type, method, body.map(|(_, raw)| raw), sender.as_ref())?;

        Ok(Self {
            txid,
            version,
            sender,
            body,
        })
    }

    fn parse_body(
        msg_type: MessageType,
        method: Method,
        raw: Option<&[u8]>,
        sender: Option<&Id>,
    ) -> Result<MessageBody, MessageError> {
        match (msg_type, method, raw) {
            (MessageType::Request, Method::Ping, None) => Ok(MessageBody::PingRequest),
            (MessageType::Response, Method::Ping, None) => Ok(MessageBody::PingResponse),
            (MessageType::Response, Method::StoreValue, None) => Ok(MessageBody::StoreValueResponse),
            (MessageType::Response, Method::AnnouncePeer, None) => {
                Ok(MessageBody::AnnouncePeerResponse)
            }
            (MessageType::Response, Method::FindNode, None) => {
                Ok(MessageBody::FindNodeResponse(FindNodeResponse::default()))
            }
            (MessageType::Response, Method::FindPeer, None) => {
                Ok(MessageBody::FindPeerResponse(FindPeerResponse::default()))
            }
            (MessageType::Response, Method::FindValue, None) => {
                Ok(MessageBody::FindValueResponse(FindValueResponse::default()))
            }
            (MessageType::Request, Method::FindNode, Some(raw)) => {
                let (target, want) = parse_target_and_want(raw)?;
                Ok(MessageBody::FindNodeRequest(FindNodeRequest {
                    target,
                    want4: want & WANT_IPV4 != 0,
                    want6: want & WANT_IPV6 != 0,
                    want_token: want & WANT_TOKEN != 0,
                }))
            }
            (MessageType::Response, Method::FindNode, Some(raw)) => {
                let (nodes4, nodes6, token, _, _) = parse_lookup_response(raw, sender)?;
                Ok(MessageBody::FindNodeResponse(FindNodeResponse {
                    nodes4,
                    nodes6,
                    token,
                }))
            }
            (MessageType::Request, Method::FindPeer, Some(raw)) => {
                let (target, want) = parse_target_and_want(raw)?;
                Ok(MessageBody::FindPeerRequest(FindPeerRequest {
                    target,
                    want4: want & WANT_IPV4 != 0,
                    want6: want & WANT_IPV6 != 0,
                }))
            }
            (MessageType::Response, Method::FindPeer, Some(raw)) => {
                let (nodes4, nodes6, token, peers, _) = parse_lookup_response(raw, sender)?;
                Ok(MessageBody::FindPeerResponse(FindPeerResponse {
                    nodes4,
                    nodes6,
                    peers,
                    token,
                }))
            }
            (MessageType::Request, Method::FindValue, Some(raw)) => {
                let mut map = Decoder::new(raw)?;
                let mut target = None;
                let mut want = 0u8;
                let mut sequence_number = -1i32;
                while let Some(key) = map.next_key()? {
                    match key {
                        "t" => target = Some(map.decode_field::<Id>()?),
                        "w" => want = map.decode_field::<u8>()?,
                        "seq" => sequence_number = map.decode_field::<i32>()?,
                        _ => map.skip_field()?,
                    }
                }
                let target = target.ok_or(MessageError::InvalidMessage("missing target"))?;
                Ok(MessageBody::FindValueRequest(FindValueRequest {
                    target,
                    want4: want & WANT_IPV4 != 0,
                    want6: want & WANT_IPV6 != 0,
                    sequence_number,
                }))
            }
            (MessageType::Response, Method::FindValue, Some(raw)) => {
                let (nodes4, nodes6, token, _, value) = parse_lookup_response(raw, sender)?;
                Ok(MessageBody::FindValueResponse(FindValueResponse {
                    nodes4,
                    nodes6,
                    value,
                    token,
                }))
            }
            (MessageType::Request, Method::StoreValue, Some(raw)) => {
                let mut map = Decoder::new(raw)?;
                let mut token = 0u32;
                let mut value = None;
                let mut expected_sequence_number = -1i32;
                while let Some(key) = map.next_key()? {
                    match key {
                        "tok" => token = map.decode_field::<u32>()?,
                        "v" => value = Some(map.decode_field::<Value>()?),
                        "cas" => expected_sequence_number = map.decode_field::<i32>()?,
                        _ => map.skip_field()?,
                    }
                }
                let value = value.ok_or(MessageError::InvalidMessage("missing value"))?;
                Ok(MessageBody::StoreValueRequest(StoreValueRequest {
                    token,
                    value,
                    expected_sequence_number,
                }))
            }
            (MessageType::Request, Method::AnnouncePeer, Some(raw)) => {
                let mut map = Decoder::new(raw)?;
                let mut token = 0u32;
                let mut peer = None;
                while let Some(key) = map.next_key()? {
                    match key {
                        "tok" => token = map.decode_field::<u32>()?,
                        "p" => {
                            let raw_peer = map.raw_field()?;
                            let (decoded, rest) =
                                PeerInfo::decode_unfinished_with(raw_peer, sender)?;
                            if !rest.is_empty() {
                                return Err(MessageError::InvalidMessage("trailing peer data"));
                            }
                            peer = Some(decoded);
                        }
                        _ => map.skip_field()?,
                    }
                }
                let peer = peer.ok_or(MessageError::InvalidMessage("missing peer"))?;
                Ok(MessageBody::AnnouncePeerRequest(AnnouncePeerRequest { token, peer }))
            }
            (MessageType::Error, method, Some(raw)) => {
                let mut map = Decoder::new(raw)?;
                let mut code = 0i32;
                let mut message = String::new();
                while let Some(key) = map.next_key()? {
                    match key {
                        "c" => code = map.decode_field::<i32>()?,
                        "m" => message = map.decode_field::<String>()?,
                        _ => map.skip_field()?,
                    }
                }
                Ok(MessageBody::Error(ErrorBody {
                    method,
                    code,
                    message,
                }))
            }
            _ => Err(MessageError::InvalidMessage("body does not match method")),
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?}:{},txid:{:#010x},version:{}",
            self.msg_type(),
            self.method(),
            self.txid,
            readable_version(self.version)
        )
    }
}

fn want_flags(want4: bool, want6: bool, want_token: bool) -> u8 {
    let mut want = 0;
    if want4 {
        want |= WANT_IPV4;
    }
    if want6 {
        want |= WANT_IPV6;
    }
    if want_token {
        want |= WANT_TOKEN;
    }
    want
}

fn lookup_response_size(nodes4: &[NodeInfo], nodes6: &[NodeInfo]) -> usize {
    32 + (nodes4.len() + nodes6.len()) * NODE_INFO_SIZE
}

fn parse_target_and_want(raw: &[u8]) -> Result<(Id, u8), MessageError> {
    let mut map = Decoder::new(raw)?;
    let mut target = None;
    let mut want = 0u8;
    while let Some(key) = map.next_key()? {
        match key {
            "t" => target = Some(map.decode_field::<Id>()?),
            "w" => want = map.decode_field::<u8>()?,
            _ => map.skip_field()?,
        }
    }
    let target = target.ok_or(MessageError::InvalidMessage("missing target"))?;
    Ok((target, want))
}

fn encode_lookup_response<'b>(
    buf: &'b mut dyn BufMut,
    nodes4: &[NodeInfo],
    nodes6: &[NodeInfo],
    token: u32,
    extra: impl FnOnce(Encoder<'b>) -> Encoder<'b>,
) {
    let encoder = Encoder::new(buf);
    let encoder = if nodes4.is_empty() {
        encoder
    } else {
        encoder.encode_field("n4", &nodes4.to_vec())
    };
    let encoder = if nodes6.is_empty() {
        encoder
    } else {
        encoder.encode_field("n6", &nodes6.to_vec())
    };
    let encoder = extra(encoder);
    let encoder = encoder.encode_field_if(token != 0, "tok", &token);
    encoder.finish();
}

type LookupFields = (Vec<NodeInfo>, Vec<NodeInfo>, u32, Vec<PeerInfo>, Option<Value>);

fn parse_lookup_response(raw: &[u8], sender: Option<&Id>) -> Result<LookupFields, MessageError> {
    let mut map = Decoder::new(raw)?;
    let mut nodes4 = Vec::new();
    let mut nodes6 = Vec::new();
    let mut token = 0u32;
    let mut peers = Vec::new();
    let mut value = None;
    while let Some(key) = map.next_key()? {
        match key {
            "n4" => nodes4 = map.decode_field::<Vec<NodeInfo>>()?,
            "n6" => nodes6 = map.decode_field::<Vec<NodeInfo>>()?,
            "tok" => token = map.decode_field::<u32>()?,
            "v" => value = Some(map.decode_field::<Value>()?),
            "p" => {
                let raw_peers = map.raw_field()?;
                peers = decode_peers(raw_peers, sender)?;
            }
            _ => map.skip_field()?,
        }
    }
    Ok((nodes4, nodes6, token, peers, value))
}

fn decode_peers(raw: &[u8], sender: Option<&Id>) -> Result<Vec<PeerInfo>, MessageError> {
    let (len, mut rest) = decode_array_header(raw)?;
    let mut peers = Vec::with_capacity(len.min(64));
    for _ in 0..len {
        let (peer, remaining) = PeerInfo::decode_unfinished_with(rest, sender)?;
        peers.push(peer);
        rest = remaining;
    }
    if !rest.is_empty() {
        return Err(MessageError::InvalidMessage("trailing peer data"));
    }
    Ok(peers)
}

/// Pre-encoded CBOR spliced verbatim into an enclosing encoder.
struct RawCbor<'a>(&'a [u8]);

impl CborEncode for RawCbor<'_> {
    fn encode(&self, buf: &mut dyn BufMut) {
        buf.put_slice(self.0);
    }

    fn length(&self) -> usize {
        self.0.len()
    }
}

/// Peer list whose entries may elide the peer id when it matches the
/// envelope sender.
struct PeerList<'a> {
    peers: &'a [PeerInfo],
    sender: Option<Id>,
}

impl CborEncode for PeerList<'_> {
    fn encode(&self, buf: &mut dyn BufMut) {
        write_array_header(self.peers.len(), buf);
        for peer in self.peers {
            let omit = self.sender.as_ref() == Some(peer.peer_id());
            peer.encode_into(omit, buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::NONCE_BYTES;
    use ed25519_dalek::SigningKey;
    use hex_literal::hex;
    use rand::rngs::OsRng;

    fn node4(n: u8) -> NodeInfo {
        NodeInfo::new(Id::random(), format!("192.0.2.{n}").parse().unwrap(), 39000 + n as u16)
    }

    fn node6(n: u8) -> NodeInfo {
        NodeInfo::new(
            Id::random(),
            format!("2001:4860::{n:x}").parse().unwrap(),
            39000 + n as u16,
        )
    }

    #[test]
    fn ping_request_is_exactly_the_envelope() {
        let sender = Id::random();
        let msg = Message::ping_request(0x78901234).with_sender(sender);
        let encoded = msg.encode();
        assert_eq!(encoded.len(), 20);
        assert_eq!(
            encoded,
            hex!("bf6179182061741a7890123461761a00000000ff")
        );
        assert!(encoded.len() <= msg.estimated_size());

        let parsed = Message::parse_with_sender(&encoded, sender).unwrap();
        assert_eq!(parsed.msg_type(), MessageType::Request);
        assert_eq!(parsed.method(), Method::Ping);
        assert_eq!(parsed.txid, 0x78901234);
        assert_eq!(parsed.sender, Some(sender));
    }

    #[test]
    fn empty_response_bodies_are_envelope_only() {
        for msg in [
            Message::ping_response(1),
            Message::store_value_response(2),
            Message::announce_peer_response(3),
        ] {
            assert_eq!(msg.encode().len(), 20);
        }
    }

    #[test]
    fn find_node_request_width() {
        let mut target = [0u8; 32];
        target[31] = 1;
        let msg = Message::find_node_request(generate_txid(), Id::new(target), true, false, true);
        let encoded = msg.encode();
        assert_eq!(encoded.len(), 63);
        assert!(encoded.len() <= msg.estimated_size());
        assert_eq!(Message::parse(&encoded).unwrap(), msg);
    }

    #[test]
    fn request_roundtrips() {
        let target = Id::random();
        for msg in [
            Message::find_node_request(generate_txid(), target, true, true, false),
            Message::find_peer_request(generate_txid(), target, true, false),
            Message::find_value_request(generate_txid(), target, false, true, 17),
            Message::find_value_request(generate_txid(), target, true, false, -1),
        ] {
            let encoded = msg.encode();
            assert!(encoded.len() <= msg.estimated_size());
            assert_eq!(Message::parse(&encoded).unwrap(), msg);
        }
    }

    #[test]
    fn lookup_response_roundtrips() {
        let msg = Message::find_node_response(
            generate_txid(),
            vec![node4(1), node4(2)],
            vec![node6(1)],
            0x01020304,
        );
        let encoded = msg.encode();
        assert!(encoded.len() <= msg.estimated_size());
        assert_eq!(Message::parse(&encoded).unwrap(), msg);

        // nodes omitted entirely when empty
        let empty = Message::find_node_response(generate_txid(), vec![], vec![], 0);
        assert_eq!(empty.encode().len(), 20);
    }

    #[test]
    fn value_response_roundtrips() {
        let value = Value::signed(
            &SigningKey::generate(&mut OsRng),
            None,
            [1u8; NONCE_BYTES],
            7,
            b"value data".to_vec(),
        );
        let msg = Message::find_value_response(generate_txid(), vec![], vec![], Some(value), 99);
        let encoded = msg.encode();
        assert!(encoded.len() <= msg.estimated_size());
        assert_eq!(Message::parse(&encoded).unwrap(), msg);
    }

    #[test]
    fn store_value_request_roundtrips() {
        let value = Value::immutable(b"immutable blob".to_vec());
        let msg = Message::store_value_request(generate_txid(), 0xdead, value, 4);
        let encoded = msg.encode();
        assert!(encoded.len() <= msg.estimated_size());
        assert_eq!(Message::parse(&encoded).unwrap(), msg);
    }

    #[test]
    fn peer_response_roundtrips() {
        let keypair = SigningKey::generate(&mut OsRng);
        let peer = PeerInfo::create(&keypair, Id::random(), 8090, None);
        let msg = Message::find_peer_response(generate_txid(), vec![], vec![], vec![peer], 5);
        let encoded = msg.encode();
        assert!(encoded.len() <= msg.estimated_size());
        assert_eq!(Message::parse(&encoded).unwrap(), msg);
    }

    #[test]
    fn announce_peer_elides_own_peer_id() {
        let keypair = SigningKey::generate(&mut OsRng);
        let peer = PeerInfo::create(&keypair, Id::random(), 8090, None);
        let sender = *peer.peer_id();

        let elided = Message::announce_peer_request(generate_txid(), 3, peer.clone()).with_sender(sender);
        let spelled =
            Message::announce_peer_request(elided.txid, 3, peer.clone()).with_sender(Id::random());
        // the elided form is a full id shorter on the wire
        assert!(elided.encode().len() + 30 < spelled.encode().len());

        let parsed = Message::parse_with_sender(&elided.encode(), sender).unwrap();
        assert_eq!(parsed, elided);
        match parsed.body {
            MessageBody::AnnouncePeerRequest(body) => {
                assert_eq!(body.peer, peer);
                assert!(body.peer.is_valid());
            }
            other => panic!("unexpected body: {other:?}"),
        }
    }

    #[test]
    fn error_roundtrips() {
        let msg = Message::error(generate_txid(), Method::StoreValue, ERR_TOKEN_MISMATCH, "token mismatch");
        let encoded = msg.encode();
        assert!(encoded.len() <= msg.estimated_size());
        let parsed = Message::parse(&encoded).unwrap();
        assert_eq!(parsed, msg);
        assert_eq!(parsed.msg_type(), MessageType::Error);
        assert_eq!(parsed.method(), Method::StoreValue);
    }

    #[test]
    fn malformed_messages_are_rejected() {
        // not a map
        assert!(Message::parse(&[0x83, 0x01, 0x02, 0x03]).is_err());
        // missing composite
        let mut buf = Vec::new();
        Encoder::new(&mut buf).encode_fixed_u32_field("t", 1).finish();
        assert!(Message::parse(&buf).is_err());
        // request body under the wrong key
        let good = Message::find_node_request(1, Id::random(), true, false, false).encode();
        let mut bad = good.clone();
        let pos = bad.iter().position(|&b| b == b'q').unwrap();
        bad[pos] = b'r';
        assert!(Message::parse(&bad).is_err());
        // truncated
        assert!(Message::parse(&good[..good.len() - 2]).is_err());
    }

    #[test]
    fn version_rendering() {
        let version = version_tag(b"BN", 9);
        assert_eq!(readable_version(version), "BN/9");
        assert_eq!(readable_version(0), "N/A");

        let msg = Message::ping_request(1).with_version(version);
        assert_eq!(Message::parse(&msg.encode()).unwrap().version, version);
    }
}
