use super::lookup::{FilterResult, LookupState, LookupTask, LookupVariant};
use super::{Task, TaskHandle};
use crate::messages::{generate_txid, Message, MessageBody};
use crate::node::NodeInfo;
use crate::rpc::RpcCall;
use crate::Dht;
use crate::id::Id;

pub type NodeResultFilter = Box<dyn FnMut(&NodeInfo) -> FilterResult>;

/// Locate the k nodes closest to a target id. With a result filter
/// attached, nodes whose id equals the target are additionally offered to
/// the filter, which can collect them and stop the lookup early.
pub struct NodeLookup {
    want4: bool,
    want6: bool,
    want_token: bool,
    filter: Option<NodeResultFilter>,
    found: Vec<NodeInfo>,
}

pub type NodeLookupTask = LookupTask<NodeLookup>;

impl NodeLookup {
    fn new(want_token: bool, filter: Option<NodeResultFilter>) -> Self {
        Self {
            want4: true,
            want6: false,
            want_token,
            filter,
            found: Vec::new(),
        }
    }

    /// Exact-id matches the lookup came across (post filter).
    pub fn found(&self) -> &[NodeInfo] {
        &self.found
    }
}

impl NodeLookupTask {
    pub fn create(dht: &Dht, target: Id, want_token: bool) -> TaskHandle {
        Self::create_filtered(dht, target, want_token, false, None)
    }

    /// Bootstrap mode seeds from the farthest shell of the routing table
    /// instead of the nearest nodes.
    pub fn create_bootstrap(dht: &Dht, target: Id) -> TaskHandle {
        Self::create_filtered(dht, target, false, true, None)
    }

    pub fn create_filtered(
        dht: &Dht,
        target: Id,
        want_token: bool,
        bootstrap: bool,
        filter: Option<NodeResultFilter>,
    ) -> TaskHandle {
        let lookup =
            LookupState::new(target, dht.routing.clone(), dht.dev_mode).with_bootstrap(bootstrap);
        let handler = LookupTask::new(lookup, NodeLookup::new(want_token, filter));
        Task::new(Box::new(handler), dht.server.clone(), dht.event_loop.clone())
    }
}

impl LookupVariant for NodeLookup {
    fn name(&self) -> &'static str {
        "node-lookup"
    }

    fn build_request(&mut self, lookup: &LookupState) -> Message {
        Message::find_node_request(
            generate_txid(),
            *lookup.target(),
            self.want4,
            self.want6,
            self.want_token,
        )
    }

    fn on_response(
        &mut self,
        lookup: &mut LookupState,
        _call: &RpcCall,
        response: &Message,
    ) -> Option<Vec<NodeInfo>> {
        let MessageBody::FindNodeResponse(body) = &response.body else {
            return None;
        };
        let nodes: Vec<NodeInfo> = body.nodes4.iter().chain(body.nodes6.iter()).cloned().collect();

        let target = *lookup.target();
        for node in nodes.iter().filter(|node| node.id == target) {
            match &mut self.filter {
                Some(filter) => {
                    let decision = filter(node);
                    if decision.accepted() {
                        self.found.push(node.clone());
                    }
                    if decision.done() {
                        lookup.set_done();
                    }
                }
                None => self.found.push(node.clone()),
            }
        }
        Some(nodes)
    }
}
