use std::any::Any;
use std::collections::VecDeque;

use tracing::{debug, warn};

use super::{Task, TaskContext, TaskHandle, TaskHandler};
use crate::candidates::CandidateNode;
use crate::messages::{generate_txid, Message, MessageBody};
use crate::rpc::RpcCall;
use crate::value::Value;
use crate::Dht;

/// Pushes a value to a pre-computed closest set, typically the outcome of
/// a node lookup that requested tokens.
pub struct ValueAnnounceTask {
    todo: VecDeque<CandidateNode>,
    value: Value,
    expected_sequence_number: i32,
}

impl ValueAnnounceTask {
    pub fn create(
        dht: &Dht,
        closest: Vec<CandidateNode>,
        value: Value,
        expected_sequence_number: i32,
    ) -> TaskHandle {
        let handler = Self {
            todo: closest.into(),
            value,
            expected_sequence_number,
        };
        Task::new(Box::new(handler), dht.server.clone(), dht.event_loop.clone())
    }
}

impl TaskHandler for ValueAnnounceTask {
    fn name(&self) -> &str {
        "value-announce"
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
            let request = Message::store_value_request(
                generate_txid(),
                candidate.token(),
                self.value.clone(),
                self.expected_sequence_number,
            );
            ctx.send_call(candidate.info().clone(), request);
        }
    }

    fn call_responded(&mut self, _ctx: &mut TaskContext, call: &RpcCall, _response: &Message) {
        debug!(node = %call.target(), "Value stored");
    }

    fn call_error(&mut self, _ctx: &mut TaskContext, call: &RpcCall) {
        // rejected stores (token mismatch, sequence conflict) are logged,
        // never retried
        match call.response().map(|response| &response.body) {
            Some(MessageBody::Error(body)) => warn!(
                node = %call.target(),
                code = body.code,
                message = %body.message,
                "Store rejected"
            ),
            _ => warn!(node = %call.target(), "Store failed"),
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
