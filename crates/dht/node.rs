use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use boson_cbor::decode::{decode_array_header, CborDecode};
use boson_cbor::encode::{write_array_header, CborEncode};
use boson_cbor::error::CborDecodeError;
use bytes::BufMut;

use crate::id::Id;

/// How long an entry may go unheard-from before a refresh should probe it.
const ENTRY_PING_AGE: Duration = Duration::from_secs(30);
/// Entries failing more often than this are no longer offered to local
/// lookups.
const MAX_ENTRY_FAILURES: u32 = 2;

/// A node's wire identity: id plus UDP endpoint. Two records are the same
/// node only when id, address and port all agree.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeInfo {
    pub id: Id,
    pub addr: SocketAddr,
}

impl NodeInfo {
    pub fn new(id: Id, ip: IpAddr, port: u16) -> Self {
        Self {
            id,
            addr: SocketAddr::new(ip, port),
        }
    }

    pub fn ip(&self) -> IpAddr {
        self.addr.ip()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn is_ipv4(&self) -> bool {
        self.addr.is_ipv4()
    }
}

impl fmt::Display for NodeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}@{}", self.id, self.addr)
    }
}

impl CborEncode for NodeInfo {
    fn encode(&self, buf: &mut dyn BufMut) {
        write_array_header(3, buf);
        self.id.encode(buf);
        self.addr.ip().encode(buf);
        self.addr.port().encode(buf);
    }
}

impl CborDecode for NodeInfo {
    fn decode_unfinished(buf: &[u8]) -> Result<(Self, &[u8]), CborDecodeError> {
        let (len, rest) = decode_array_header(buf)?;
        if len != 3 {
            return Err(CborDecodeError::InvalidLength);
        }
        let (id, rest) = Id::decode_unfinished(rest)?;
        let (ip, rest) = IpAddr::decode_unfinished(rest)?;
        let (port, rest) = u16::decode_unfinished(rest)?;
        Ok((NodeInfo::new(id, ip, port), rest))
    }
}

/// Whether `ip` is a unicast address at all, regardless of scope. This is
/// the admission rule in developer mode, where whole swarms live on one
/// loopback interface.
pub fn is_any_unicast(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => !v4.is_multicast() && !v4.is_broadcast() && !v4.is_unspecified(),
        IpAddr::V6(v6) => !v6.is_multicast() && !v6.is_unspecified(),
    }
}

/// Whether `ip` is a globally routable unicast address, the production
/// admission rule.
pub fn is_global_unicast(ip: &IpAddr) -> bool {
    if !is_any_unicast(ip) {
        return false;
    }
    match ip {
        IpAddr::V4(v4) => {
            !v4.is_loopback()
                && !v4.is_private()
                && !v4.is_link_local()
                && !v4.is_documentation()
                // 100.64.0.0/10, shared address space
                && !(v4.octets()[0] == 100 && (v4.octets()[1] & 0xc0) == 64)
                // 240.0.0.0/4, reserved
                && v4.octets()[0] < 240
        }
        IpAddr::V6(v6) => {
            if let Some(v4) = v6.to_ipv4_mapped() {
                return is_global_unicast(&IpAddr::V4(v4));
            }
            let segments = v6.segments();
            !v6.is_loopback()
                // fe80::/10 link local
                && (segments[0] & 0xffc0) != 0xfe80
                // fc00::/7 unique local
                && (segments[0] & 0xfe00) != 0xfc00
                // 2001:db8::/32 documentation
                && !(segments[0] == 0x2001 && segments[1] == 0xdb8)
        }
    }
}

/// A routing-table entry as the lookup engine sees it. The table maintains
/// these; lookups only read the liveness predicates.
#[derive(Debug, Clone)]
pub struct KBucketEntry {
    info: NodeInfo,
    created: Instant,
    last_seen: Instant,
    last_sent: Option<Instant>,
    failed_requests: u32,
    reachable: bool,
}

impl KBucketEntry {
    pub fn new(info: NodeInfo) -> Self {
        let now = Instant::now();
        Self {
            info,
            created: now,
            last_seen: now,
            last_sent: None,
            failed_requests: 0,
            reachable: false,
        }
    }

    pub fn reachable(info: NodeInfo) -> Self {
        Self {
            reachable: true,
            ..Self::new(info)
        }
    }

    pub fn info(&self) -> &NodeInfo {
        &self.info
    }

    pub fn id(&self) -> &Id {
        &self.info.id
    }

    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }

    pub fn last_sent(&self) -> Option<Instant> {
        self.last_sent
    }

    pub fn is_reachable(&self) -> bool {
        self.reachable
    }

    pub fn needs_ping(&self) -> bool {
        self.failed_requests > 0 || self.last_seen.elapsed() >= ENTRY_PING_AGE
    }

    pub fn eligible_for_local_lookup(&self) -> bool {
        self.reachable || self.failed_requests <= MAX_ENTRY_FAILURES
    }

    pub fn signal_request(&mut self) {
        self.last_sent = Some(Instant::now());
    }

    pub fn signal_response(&mut self) {
        self.last_seen = Instant::now();
        self.failed_requests = 0;
        self.reachable = true;
    }

    pub fn signal_request_timeout(&mut self) {
        self.failed_requests += 1;
    }

    pub fn failed_requests(&self) -> u32 {
        self.failed_requests
    }
}

/// One routing-table shell: live entries plus a replacement cache of
/// would-be entries waiting for a slot.
#[derive(Debug, Clone, Default)]
pub struct KBucket {
    entries: Vec<KBucketEntry>,
    cache: Vec<KBucketEntry>,
}

impl KBucket {
    pub fn new(entries: Vec<KBucketEntry>, cache: Vec<KBucketEntry>) -> Self {
        Self { entries, cache }
    }

    pub fn entries(&self) -> &[KBucketEntry] {
        &self.entries
    }

    pub fn cache_entries(&self) -> &[KBucketEntry] {
        &self.cache
    }
}
