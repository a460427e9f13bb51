use super::lookup::{LookupState, LookupTask, LookupVariant};
use super::{Task, TaskHandle};
use crate::eligible::EligibleValue;
use crate::id::Id;
use crate::messages::{generate_txid, Message, MessageBody};
use crate::node::NodeInfo;
use crate::rpc::RpcCall;
use crate::Dht;

/// Retrieve a value by id. A node returning an unacceptable value is
/// untrustworthy and its whole response is dropped, node list included.
pub struct ValueLookup {
    expected_sequence_number: i32,
    done_on_eligible_result: bool,
    eligible: EligibleValue,
}

pub type ValueLookupTask = LookupTask<ValueLookup>;

impl ValueLookup {
    /// The best value accepted so far.
    pub fn value(&self) -> Option<&crate::value::Value> {
        self.eligible.value()
    }
}

impl ValueLookupTask {
    /// `done_on_eligible_result` stops at the first acceptable value;
    /// otherwise the lookup keeps converging and collects the
    /// highest-sequence version the network has.
    pub fn create(
        dht: &Dht,
        target: Id,
        expected_sequence_number: i32,
        done_on_eligible_result: bool,
    ) -> TaskHandle {
        let lookup = LookupState::new(target, dht.routing.clone(), dht.dev_mode);
        let variant = ValueLookup {
            expected_sequence_number,
            done_on_eligible_result,
            eligible: EligibleValue::new(target, expected_sequence_number),
        };
        Task::new(
            Box::new(LookupTask::new(lookup, variant)),
            dht.server.clone(),
            dht.event_loop.clone(),
        )
    }
}

impl LookupVariant for ValueLookup {
    fn name(&self) -> &'static str {
        "value-lookup"
    }

    fn build_request(&mut self, lookup: &LookupState) -> Message {
        Message::find_value_request(
            generate_txid(),
            *lookup.target(),
            true,
            false,
            self.expected_sequence_number,
        )
    }

    fn on_response(
        &mut self,
        lookup: &mut LookupState,
        _call: &RpcCall,
        response: &Message,
    ) -> Option<Vec<NodeInfo>> {
        let MessageBody::FindValueResponse(body) = &response.body else {
            return None;
        };
        if let Some(value) = &body.value {
            if !self.eligible.update(value.clone()) {
                return None;
            }
            if self.done_on_eligible_result && !self.eligible.is_empty() {
                lookup.set_done();
            }
        }
        Some(body.nodes4.iter().chain(body.nodes6.iter()).cloned().collect())
    }
}
