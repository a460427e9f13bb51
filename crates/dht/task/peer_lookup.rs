use super::lookup::{FilterResult, LookupState, LookupTask, LookupVariant};
use super::{Task, TaskHandle};
use crate::eligible::EligiblePeers;
use crate::id::Id;
use crate::messages::{generate_txid, Message, MessageBody};
use crate::node::NodeInfo;
use crate::peer::PeerInfo;
use crate::rpc::RpcCall;
use crate::Dht;
use crate::K;

pub type PeerResultFilter = Box<dyn FnMut(&[PeerInfo]) -> FilterResult>;

/// Retrieve the peers announced under a content id. One invalid record
/// condemns the entire response of the node that sent it.
pub struct PeerLookup {
    peers: EligiblePeers,
    filter: Option<PeerResultFilter>,
}

pub type PeerLookupTask = LookupTask<PeerLookup>;

impl PeerLookup {
    /// The merged peer list collected so far, in display order.
    pub fn peers(&self) -> Vec<PeerInfo> {
        self.peers.peers()
    }
}

impl PeerLookupTask {
    pub fn create(dht: &Dht, target: Id, filter: Option<PeerResultFilter>) -> TaskHandle {
        let lookup = LookupState::new(target, dht.routing.clone(), dht.dev_mode);
        let variant = PeerLookup {
            peers: EligiblePeers::new(target, K * 16),
            filter,
        };
        Task::new(
            Box::new(LookupTask::new(lookup, variant)),
            dht.server.clone(),
            dht.event_loop.clone(),
        )
    }
}

impl LookupVariant for PeerLookup {
    fn name(&self) -> &'static str {
        "peer-lookup"
    }

    fn build_request(&mut self, lookup: &LookupState) -> Message {
        Message::find_peer_request(generate_txid(), *lookup.target(), true, false)
    }

    fn on_response(
        &mut self,
        lookup: &mut LookupState,
        _call: &RpcCall,
        response: &Message,
    ) -> Option<Vec<NodeInfo>> {
        let MessageBody::FindPeerResponse(body) = &response.body else {
            return None;
        };
        if !body.peers.is_empty() {
            if !self.peers.add(body.peers.clone()) {
                return None;
            }
            if let Some(filter) = &mut self.filter {
                let merged = self.peers.peers();
                if filter(&merged).done() {
                    lookup.set_done();
                }
            }
        }
        Some(body.nodes4.iter().chain(body.nodes6.iter()).cloned().collect())
    }
}
