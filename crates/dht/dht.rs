use std::cell::RefCell;
use std::rc::Rc;

pub mod candidates;
pub mod closest_set;
pub mod eligible;
pub mod error;
pub mod id;
pub mod messages;
pub mod node;
pub mod peer;
pub mod routing;
pub mod rpc;
pub mod scheduler;
pub mod task;
pub mod value;

pub use candidates::{CandidateNode, ClosestCandidates};
pub use closest_set::ClosestSet;
pub use eligible::{EligiblePeers, EligibleValue};
pub use error::MessageError;
pub use id::Id;
pub use messages::{Message, MessageBody, Method};
pub use node::{KBucket, KBucketEntry, NodeInfo};
pub use peer::PeerInfo;
pub use routing::{KClosestNodes, MemoryRoutingTable, RoutingTable, RoutingTableRef};
pub use rpc::{CallState, RpcCall, RpcServer};
pub use scheduler::EventLoop;
pub use task::manager::TaskManager;
pub use task::{Task, TaskHandle, TaskState};
pub use value::Value;

/// Kademlia replication factor / bucket size.
pub const K: usize = 8;

/// The collaborators every task needs, bundled so constructors stay
/// short: the transport, the event loop everything runs on, the routing
/// table and the developer-mode switch.
///
/// Developer mode loosens address admission so whole swarms can run on
/// one host; it is a per-instance choice, never process-wide state.
#[derive(Clone)]
pub struct Dht {
    pub server: Rc<RefCell<dyn RpcServer>>,
    pub event_loop: Rc<EventLoop>,
    pub routing: RoutingTableRef,
    pub dev_mode: bool,
}

impl Dht {
    pub fn new(
        server: Rc<RefCell<dyn RpcServer>>,
        event_loop: Rc<EventLoop>,
        routing: RoutingTableRef,
    ) -> Self {
        Self {
            server,
            event_loop,
            routing,
            dev_mode: false,
        }
    }

    pub fn with_dev_mode(mut self, dev_mode: bool) -> Self {
        self.dev_mode = dev_mode;
        self
    }
}
