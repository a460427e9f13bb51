use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::messages::Message;
use crate::node::NodeInfo;

/// Soft deadline: a call with no answer by now is stalled, freeing the
/// task to issue further requests while this one may still land.
pub const CALL_STALL_TIMEOUT: Duration = Duration::from_millis(1000);
/// Hard deadline: the call is abandoned, late answers are dropped.
pub const CALL_HARD_TIMEOUT: Duration = Duration::from_millis(3000);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CallState {
    Unsent,
    Sent,
    Stalled,
    Responded,
    Error,
    Timeout,
}

impl CallState {
    pub fn is_terminal(self) -> bool {
        matches!(self, CallState::Responded | CallState::Error | CallState::Timeout)
    }
}

pub type CallListener = Box<dyn FnMut(&mut RpcCall, CallState, CallState)>;
pub type CallRef = Rc<RefCell<RpcCall>>;

/// One request/response round-trip. The issuing task and the RpcServer
/// share the call; the server drives the state machine, the task observes
/// it through the single listener.
pub struct RpcCall {
    target: NodeInfo,
    request: Message,
    state: CallState,
    sent_at: Option<Instant>,
    responded_at: Option<Instant>,
    response: Option<Message>,
    id_mismatched: bool,
    listener: Option<CallListener>,
}

impl RpcCall {
    pub fn new(target: NodeInfo, request: Message) -> Self {
        Self {
            target,
            request,
            state: CallState::Unsent,
            sent_at: None,
            responded_at: None,
            response: None,
            id_mismatched: false,
            listener: None,
        }
    }

    pub fn target(&self) -> &NodeInfo {
        &self.target
    }

    pub fn request(&self) -> &Message {
        &self.request
    }

    pub fn txid(&self) -> u32 {
        self.request.txid
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn response(&self) -> Option<&Message> {
        self.response.as_ref()
    }

    pub fn sent_at(&self) -> Option<Instant> {
        self.sent_at
    }

    pub fn responded_at(&self) -> Option<Instant> {
        self.responded_at
    }

    /// Whether the response really came from the node this call was
    /// addressed to.
    pub fn matches_id(&self) -> bool {
        !self.id_mismatched
    }

    pub fn is_id_mismatched(&self) -> bool {
        self.id_mismatched
    }

    /// The single listener receiving `(call, previous, next)` transitions.
    pub fn add_listener(&mut self, listener: CallListener) {
        self.listener = Some(listener);
    }

    // State drivers, invoked by the RpcServer on the task's event loop.

    pub fn sent(&mut self) {
        if self.update_state(CallState::Sent) {
            self.sent_at = Some(Instant::now());
        }
    }

    pub fn stall(&mut self) {
        self.update_state(CallState::Stalled);
    }

    pub fn responded(&mut self, response: Message) {
        if self.state.is_terminal() {
            debug!(txid = self.txid(), "Dropping response for finished call");
            return;
        }
        self.id_mismatched = response.sender.as_ref() != Some(&self.target.id);
        self.response = Some(response);
        if self.update_state(CallState::Responded) {
            self.responded_at = Some(Instant::now());
        }
    }

    /// The remote answered with an ERROR message, or the request could not
    /// be delivered at all.
    pub fn failed(&mut self, response: Option<Message>) {
        if self.state.is_terminal() {
            return;
        }
        self.response = response;
        self.update_state(CallState::Error);
    }

    pub fn timeout(&mut self) {
        self.update_state(CallState::Timeout);
    }

    fn update_state(&mut self, next: CallState) -> bool {
        let previous = self.state;
        // the machine only ever moves forward; anything after a terminal
        // state is a stray event
        if previous.is_terminal() || next <= previous {
            debug!(
                txid = self.txid(),
                ?previous,
                ?next,
                "Refusing call state transition"
            );
            return false;
        }
        self.state = next;
        if let Some(mut listener) = self.listener.take() {
            listener(self, previous, next);
            if self.listener.is_none() {
                self.listener = Some(listener);
            }
        }
        true
    }
}

/// The transport collaborator. `send_call` must not block and must not
/// deliver state changes synchronously: transitions are posted back onto
/// the task's event loop. Responses with an unknown txid, a sender that
/// does not match the addressed node, or arriving after the owning task
/// ended are dropped (or diverted to routing-table maintenance) without
/// task involvement.
pub trait RpcServer {
    fn send_call(&mut self, call: CallRef);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::Id;
    use crate::messages::generate_txid;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn call() -> RpcCall {
        let target = NodeInfo::new(Id::random(), "127.0.0.1".parse().unwrap(), 9000);
        RpcCall::new(target.clone(), Message::ping_request(generate_txid()))
    }

    #[test]
    fn transitions_are_monotonic() {
        let mut call = call();
        assert_eq!(call.state(), CallState::Unsent);
        call.sent();
        assert_eq!(call.state(), CallState::Sent);
        call.stall();
        assert_eq!(call.state(), CallState::Stalled);
        call.timeout();
        assert_eq!(call.state(), CallState::Timeout);

        // terminal is sticky: a late response is dropped
        let txid = call.txid();
        let sender = call.target().id;
        call.responded(Message::ping_response(txid).with_sender(sender));
        assert_eq!(call.state(), CallState::Timeout);
        assert!(call.response().is_none());
    }

    #[test]
    fn listener_sees_each_transition_once() {
        let seen: Rc<RefCell<Vec<(CallState, CallState)>>> = Rc::default();
        let mut call = call();
        let log = seen.clone();
        call.add_listener(Box::new(move |_, previous, next| {
            log.borrow_mut().push((previous, next));
        }));
        call.sent();
        let txid = call.txid();
        let sender = call.target().id;
        call.responded(Message::ping_response(txid).with_sender(sender));
        call.timeout(); // refused

        assert_eq!(
            *seen.borrow(),
            vec![
                (CallState::Unsent, CallState::Sent),
                (CallState::Sent, CallState::Responded),
            ]
        );
    }

    #[test]
    fn mismatched_sender_is_flagged_but_terminal() {
        let mut call = call();
        call.sent();
        let txid = call.txid();
        call.responded(Message::ping_response(txid).with_sender(Id::random()));
        assert_eq!(call.state(), CallState::Responded);
        assert!(call.is_id_mismatched());
        assert!(!call.matches_id());
    }

    #[test]
    fn error_keeps_the_error_response() {
        use crate::messages::{Method, ERR_TOKEN_MISMATCH};
        let mut call = call();
        call.sent();
        let txid = call.txid();
        call.failed(Some(Message::error(
            txid,
            Method::StoreValue,
            ERR_TOKEN_MISMATCH,
            "token mismatch",
        )));
        assert_eq!(call.state(), CallState::Error);
        assert!(call.response().is_some());
    }
}
