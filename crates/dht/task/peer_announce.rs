use std::any::Any;
use std::collections::VecDeque;

use tracing::{debug, warn};

use super::{Task, TaskContext, TaskHandle, TaskHandler};
use crate::candidates::CandidateNode;
use crate::messages::{generate_txid, Message, MessageBody};
use crate::peer::PeerInfo;
use crate::rpc::RpcCall;
use crate::Dht;

/// Announces a peer record to a pre-computed closest set.
pub struct PeerAnnounceTask {
    todo: VecDeque<CandidateNode>,
    peer: PeerInfo,
}

impl PeerAnnounceTask {
    pub fn create(dht: &Dht, closest: Vec<CandidateNode>, peer: PeerInfo) -> TaskHandle {
        let handler = Self {
            todo: closest.into(),
            peer,
        };
        Task::new(Box::new(handler), dht.server.clone(), dht.event_loop.clone())
    }
}

impl TaskHandler for PeerAnnounceTask {
    fn name(&self) -> &str {
        "peer-announce"
    }

    fn iterate(&mut self, ctx: &mut TaskContext) {
        while ctx.can_do_request() {
            let Some(candidate) = self.todo.pop_front() else {
                break;
            };
            if candidate.token() == 0 {
                warn!(node = %candidate.info(), "Skipping announce target without token");
                continue;
            }
            let request =
                Message::announce_peer_request(generate_txid(), candidate.token(), self.peer.clone());
            ctx.send_call(candidate.info().clone(), request);
        }
    }

    fn call_responded(&mut self, _ctx: &mut TaskContext, call: &RpcCall, _response: &Message) {
        debug!(node = %call.target(), peer = %self.peer.peer_id(), "Peer announced");
    }

    fn call_error(&mut self, _ctx: &mut TaskContext, call: &RpcCall) {
        match call.response().map(|response| &response.body) {
            Some(MessageBody::Error(body)) => warn!(
                node = %call.target(),
                code = body.code,
                message = %body.message,
                "Announce rejected"
            ),
            _ => warn!(node = %call.target(), "Announce failed"),
        }
    }

    fn is_done(&self, inflight: usize) -> bool {
        self.todo.is_empty() && inflight == 0
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
