use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, warn};

use crate::messages::Message;
use crate::node::NodeInfo;
use crate::rpc::{CallState, RpcCall, RpcServer};
use crate::scheduler::EventLoop;

pub mod lookup;
pub mod manager;
pub mod node_lookup;
pub mod peer_announce;
pub mod peer_lookup;
pub mod ping_refresh;
pub mod value_announce;
pub mod value_lookup;

/// In-flight call budget per task.
pub const MAX_CONCURRENT_TASK_REQUESTS: usize = 16;
/// Budget for tasks flagged low-priority, e.g. background refreshes.
pub const MAX_CONCURRENT_TASK_REQUESTS_LOW_PRIORITY: usize = 4;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Initial,
    Queued,
    Running,
    Completed,
    Canceled,
}

impl TaskState {
    pub fn is_end(self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Canceled)
    }

    fn can_transition_to(self, next: TaskState) -> bool {
        matches!(
            (self, next),
            (TaskState::Initial, TaskState::Queued)
                | (TaskState::Queued, TaskState::Running)
                | (TaskState::Running, TaskState::Completed)
                | (TaskState::Initial, TaskState::Canceled)
                | (TaskState::Queued, TaskState::Canceled)
                | (TaskState::Running, TaskState::Canceled)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskEvent {
    Started,
    Completed,
    Canceled,
    Ended,
}

pub type TaskListener = Box<dyn FnMut(TaskEvent)>;

/// What a handler hook may do while it runs: inspect the call budget and
/// queue outgoing requests. Queued requests are dispatched when the hook
/// returns.
pub struct TaskContext {
    inflight: usize,
    limit: usize,
    pending: Vec<(NodeInfo, Message)>,
}

impl TaskContext {
    pub fn can_do_request(&self) -> bool {
        self.inflight + self.pending.len() < self.limit
    }

    pub fn inflight(&self) -> usize {
        self.inflight
    }

    pub fn send_call(&mut self, target: NodeInfo, request: Message) {
        self.pending.push((target, request));
    }
}

/// The per-kind hooks a task plugs into the shared lifecycle. `iterate`
/// runs once at start and again after every stalled or terminal call
/// transition; the `call_*` hooks see each transition of the task's own
/// calls.
pub trait TaskHandler: 'static {
    fn name(&self) -> &str;

    fn prepare(&mut self, _ctx: &mut TaskContext) {}

    fn iterate(&mut self, _ctx: &mut TaskContext) {}

    fn call_sent(&mut self, _ctx: &mut TaskContext, _call: &RpcCall) {}

    fn call_responded(&mut self, _ctx: &mut TaskContext, _call: &RpcCall, _response: &Message) {}

    fn call_error(&mut self, _ctx: &mut TaskContext, _call: &RpcCall) {}

    fn call_timeout(&mut self, _ctx: &mut TaskContext, _call: &RpcCall) {}

    fn is_done(&self, inflight: usize) -> bool;

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

pub type TaskHandle = Rc<RefCell<Task>>;

/// Shared task machinery: the lifecycle state machine, listener fan-out,
/// the in-flight call table and the hook driver. Concrete behavior lives
/// in the boxed [`TaskHandler`].
pub struct Task {
    id: u64,
    name: String,
    state: TaskState,
    low_priority: bool,
    listeners: Vec<TaskListener>,
    inflight: HashMap<u32, Rc<RefCell<RpcCall>>>,
    nested: Option<TaskHandle>,
    handler: Option<Box<dyn TaskHandler>>,
    server: Rc<RefCell<dyn RpcServer>>,
    event_loop: Rc<EventLoop>,
    end_handler: Option<Box<dyn FnOnce()>>,
}

impl Task {
    pub fn new(
        handler: Box<dyn TaskHandler>,
        server: Rc<RefCell<dyn RpcServer>>,
        event_loop: Rc<EventLoop>,
    ) -> TaskHandle {
        Rc::new(RefCell::new(Self {
            id: NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed),
            name: handler.name().to_string(),
            state: TaskState::Initial,
            low_priority: false,
            listeners: Vec::new(),
            inflight: HashMap::new(),
            nested: None,
            handler: Some(handler),
            server,
            event_loop,
            end_handler: None,
        }))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn is_end(&self) -> bool {
        self.state.is_end()
    }

    pub fn set_low_priority(&mut self, low_priority: bool) {
        self.low_priority = low_priority;
    }

    pub fn inflight_count(&self) -> usize {
        self.inflight.len()
    }

    pub fn event_loop(&self) -> &Rc<EventLoop> {
        &self.event_loop
    }

    pub(crate) fn set_state(&mut self, next: TaskState) -> bool {
        if !self.state.can_transition_to(next) {
            warn!(
                task = self.id,
                state = ?self.state,
                ?next,
                "Refusing illegal task state transition"
            );
            return false;
        }
        self.state = next;
        true
    }

    pub(crate) fn clear_end_handler(&mut self) {
        self.end_handler = None;
    }

    pub(crate) fn set_end_handler(&mut self, end_handler: Box<dyn FnOnce()>) {
        self.end_handler = Some(end_handler);
    }

    /// Borrows the concrete handler for result extraction.
    pub fn with_handler_ref<H: TaskHandler, R>(
        this: &TaskHandle,
        f: impl FnOnce(&H) -> R,
    ) -> Option<R> {
        let task = this.borrow();
        task.handler
            .as_ref()
            .and_then(|handler| handler.as_any().downcast_ref::<H>())
            .map(f)
    }

    /// Mutable counterpart, e.g. to feed a lookup extra candidates before
    /// it starts.
    pub fn with_handler_mut<H: TaskHandler, R>(
        this: &TaskHandle,
        f: impl FnOnce(&mut H) -> R,
    ) -> Option<R> {
        let mut task = this.borrow_mut();
        task.handler
            .as_mut()
            .and_then(|handler| handler.as_any_mut().downcast_mut::<H>())
            .map(f)
    }

    /// Registers a listener. On an already-ended task the terminal events
    /// are delivered synchronously instead.
    pub fn add_listener(this: &TaskHandle, mut listener: TaskListener) {
        let state = this.borrow().state;
        match state {
            TaskState::Completed => {
                listener(TaskEvent::Completed);
                listener(TaskEvent::Ended);
            }
            TaskState::Canceled => {
                listener(TaskEvent::Canceled);
                listener(TaskEvent::Ended);
            }
            _ => this.borrow_mut().listeners.push(listener),
        }
    }

    /// Attaches a nested task; canceling this task cancels it too.
    pub fn set_nested(this: &TaskHandle, nested: TaskHandle) {
        this.borrow_mut().nested = Some(nested);
    }

    pub fn start(this: &TaskHandle) {
        {
            let mut task = this.borrow_mut();
            if task.state == TaskState::Initial && !task.set_state(TaskState::Queued) {
                return;
            }
            if !task.set_state(TaskState::Running) {
                return;
            }
            debug!(task = task.id, name = %task.name, "Task starting");
        }
        Self::fire_event(this, TaskEvent::Started);
        Self::with_handler(this, |handler, ctx| handler.prepare(ctx));
        Self::drive(this);
    }

    pub fn complete(this: &TaskHandle) {
        Self::finish(this, TaskState::Completed);
    }

    /// Cooperative cancellation: the task ends now, in-flight calls keep
    /// their own lifecycle but their transitions are ignored from here on.
    pub fn cancel(this: &TaskHandle) {
        if this.borrow().state.is_end() {
            return;
        }
        Self::finish(this, TaskState::Canceled);
    }

    fn finish(this: &TaskHandle, final_state: TaskState) {
        {
            let mut task = this.borrow_mut();
            if !task.set_state(final_state) {
                return;
            }
            debug!(task = task.id, name = %task.name, state = ?final_state, "Task finished");
        }
        if final_state == TaskState::Canceled {
            let nested = this.borrow_mut().nested.take();
            if let Some(nested) = nested {
                Task::cancel(&nested);
            }
        }
        let event = if final_state == TaskState::Completed {
            TaskEvent::Completed
        } else {
            TaskEvent::Canceled
        };
        Self::fire_event(this, event);
        let end_handler = this.borrow_mut().end_handler.take();
        if let Some(end_handler) = end_handler {
            end_handler();
        }
        Self::fire_event(this, TaskEvent::Ended);
    }

    fn fire_event(this: &TaskHandle, event: TaskEvent) {
        let mut listeners = std::mem::take(&mut this.borrow_mut().listeners);
        for listener in listeners.iter_mut() {
            listener(event);
        }
        let mut task = this.borrow_mut();
        // listeners registered during delivery were served synchronously
        // by add_listener when the task had already ended
        listeners.append(&mut task.listeners);
        task.listeners = listeners;
    }

    /// Runs one handler hook and dispatches whatever it queued.
    fn with_handler(
        this: &TaskHandle,
        f: impl FnOnce(&mut Box<dyn TaskHandler>, &mut TaskContext),
    ) {
        let (mut handler, mut ctx) = {
            let mut task = this.borrow_mut();
            let Some(handler) = task.handler.take() else {
                return;
            };
            let limit = if task.low_priority {
                MAX_CONCURRENT_TASK_REQUESTS_LOW_PRIORITY
            } else {
                MAX_CONCURRENT_TASK_REQUESTS
            };
            let ctx = TaskContext {
                inflight: task.inflight.len(),
                limit,
                pending: Vec::new(),
            };
            (handler, ctx)
        };
        f(&mut handler, &mut ctx);
        this.borrow_mut().handler = Some(handler);
        Self::dispatch(this, ctx.pending);
    }

    fn dispatch(this: &TaskHandle, pending: Vec<(NodeInfo, Message)>) {
        for (target, request) in pending {
            let call = Rc::new(RefCell::new(RpcCall::new(target, request)));
            let weak = Rc::downgrade(this);
            call.borrow_mut()
                .add_listener(Box::new(move |call, previous, next| {
                    if let Some(task) = weak.upgrade() {
                        Task::on_call_event(&task, call, previous, next);
                    }
                }));
            let txid = call.borrow().txid();
            let server = {
                let mut task = this.borrow_mut();
                task.inflight.insert(txid, call.clone());
                task.server.clone()
            };
            server.borrow_mut().send_call(call);
        }
    }

    fn on_call_event(this: &TaskHandle, call: &mut RpcCall, _previous: CallState, next: CallState) {
        if this.borrow().state.is_end() {
            // the task is gone, the transition is noise
            return;
        }
        if next.is_terminal() {
            this.borrow_mut().inflight.remove(&call.txid());
        }
        match next {
            CallState::Unsent => return,
            CallState::Sent => {
                Self::with_handler(this, |handler, ctx| handler.call_sent(ctx, call));
                return;
            }
            CallState::Stalled => {}
            CallState::Responded => {
                if call.matches_id() {
                    if let Some(response) = call.response().cloned() {
                        Self::with_handler(this, |handler, ctx| {
                            handler.call_responded(ctx, call, &response)
                        });
                    }
                } else {
                    debug!(
                        txid = call.txid(),
                        target = %call.target(),
                        "Ignoring response body from mismatched sender"
                    );
                }
            }
            CallState::Error => {
                Self::with_handler(this, |handler, ctx| handler.call_error(ctx, call));
            }
            CallState::Timeout => {
                Self::with_handler(this, |handler, ctx| handler.call_timeout(ctx, call));
            }
        }
        // stalled and terminal transitions re-enter the iteration
        Self::drive(this);
    }

    fn drive(this: &TaskHandle) {
        if this.borrow().state != TaskState::Running {
            return;
        }
        // the handler may already consider itself done; don't issue
        // another round of requests in that case
        Self::check_completion(this);
        if this.borrow().state != TaskState::Running {
            return;
        }
        Self::with_handler(this, |handler, ctx| handler.iterate(ctx));
        Self::check_completion(this);
    }

    fn check_completion(this: &TaskHandle) {
        let done = {
            let task = this.borrow();
            task.state == TaskState::Running
                && task
                    .handler
                    .as_ref()
                    .map_or(false, |handler| handler.is_done(task.inflight.len()))
        };
        if done {
            Self::complete(this);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::Id;
    use crate::messages::generate_txid;
    use crate::rpc::CallRef;

    /// Server stub that records calls and lets the test drive their state
    /// through the event loop, as the contract requires.
    #[derive(Default)]
    struct RecordingServer {
        calls: Vec<CallRef>,
        event_loop: Option<Rc<EventLoop>>,
    }

    impl RecordingServer {
        fn new(event_loop: Rc<EventLoop>) -> Rc<RefCell<Self>> {
            Rc::new(RefCell::new(Self {
                calls: Vec::new(),
                event_loop: Some(event_loop),
            }))
        }
    }

    impl RpcServer for RecordingServer {
        fn send_call(&mut self, call: CallRef) {
            let event_loop = self.event_loop.clone().unwrap();
            let sent = call.clone();
            event_loop.post(move || sent.borrow_mut().sent());
            self.calls.push(call);
        }
    }

    /// Minimal handler: pings a fixed set of targets once, done when all
    /// calls finished.
    struct PingAll {
        todo: Vec<NodeInfo>,
        responded: usize,
        timeouts: usize,
    }

    impl PingAll {
        fn new(todo: Vec<NodeInfo>) -> Self {
            Self {
                todo,
                responded: 0,
                timeouts: 0,
            }
        }
    }

    impl TaskHandler for PingAll {
        fn name(&self) -> &str {
            "ping-all"
        }

        fn iterate(&mut self, ctx: &mut TaskContext) {
            while ctx.can_do_request() {
                let Some(target) = self.todo.pop() else { break };
                ctx.send_call(target, Message::ping_request(generate_txid()));
            }
        }

        fn call_responded(&mut self, _ctx: &mut TaskContext, _call: &RpcCall, _response: &Message) {
            self.responded += 1;
        }

        fn call_timeout(&mut self, _ctx: &mut TaskContext, _call: &RpcCall) {
            self.timeouts += 1;
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

    fn node(n: u8) -> NodeInfo {
        NodeInfo::new(Id::random(), "127.0.0.1".parse().unwrap(), 1000 + n as u16)
    }

    fn events_listener(log: Rc<RefCell<Vec<TaskEvent>>>) -> TaskListener {
        Box::new(move |event| log.borrow_mut().push(event))
    }

    #[test]
    fn lifecycle_and_listener_order() {
        let event_loop = EventLoop::new();
        let server = RecordingServer::new(event_loop.clone());
        let task = Task::new(
            Box::new(PingAll::new(vec![node(1), node(2)])),
            server.clone(),
            event_loop.clone(),
        );
        let events = Rc::new(RefCell::new(Vec::new()));
        Task::add_listener(&task, events_listener(events.clone()));

        Task::start(&task);
        assert_eq!(task.borrow().state(), TaskState::Running);
        event_loop.run_until_idle();
        assert_eq!(task.borrow().inflight_count(), 2);

        // answer both calls on the loop
        for call in server.borrow().calls.iter() {
            let call = call.clone();
            event_loop.post(move || {
                let (txid, sender) = {
                    let call = call.borrow();
                    (call.txid(), call.target().id)
                };
                call.borrow_mut()
                    .responded(Message::ping_response(txid).with_sender(sender));
            });
        }
        event_loop.run_until_idle();

        assert_eq!(task.borrow().state(), TaskState::Completed);
        assert_eq!(
            *events.borrow(),
            vec![TaskEvent::Started, TaskEvent::Completed, TaskEvent::Ended]
        );
        Task::with_handler_ref::<PingAll, _>(&task, |handler| {
            assert_eq!(handler.responded, 2);
        })
        .unwrap();
    }

    #[test]
    fn late_listener_gets_terminal_events() {
        let event_loop = EventLoop::new();
        let server = RecordingServer::new(event_loop.clone());
        let task = Task::new(Box::new(PingAll::new(vec![])), server, event_loop.clone());
        Task::start(&task);
        event_loop.run_until_idle();
        assert_eq!(task.borrow().state(), TaskState::Completed);

        let events = Rc::new(RefCell::new(Vec::new()));
        Task::add_listener(&task, events_listener(events.clone()));
        assert_eq!(*events.borrow(), vec![TaskEvent::Completed, TaskEvent::Ended]);
    }

    #[test]
    fn illegal_transitions_are_refused() {
        let event_loop = EventLoop::new();
        let server = RecordingServer::new(event_loop.clone());
        let task = Task::new(Box::new(PingAll::new(vec![])), server, event_loop.clone());

        // completing a task that never ran is refused
        Task::complete(&task);
        assert_eq!(task.borrow().state(), TaskState::Initial);

        Task::start(&task);
        event_loop.run_until_idle();
        assert_eq!(task.borrow().state(), TaskState::Completed);

        // canceling after completion changes nothing
        Task::cancel(&task);
        assert_eq!(task.borrow().state(), TaskState::Completed);
    }

    #[test]
    fn cancel_ignores_inflight_transitions_and_cancels_nested() {
        let event_loop = EventLoop::new();
        let server = RecordingServer::new(event_loop.clone());
        let task = Task::new(
            Box::new(PingAll::new(vec![node(1)])),
            server.clone(),
            event_loop.clone(),
        );
        let nested = Task::new(
            Box::new(PingAll::new(vec![node(2)])),
            server.clone(),
            event_loop.clone(),
        );
        Task::set_nested(&task, nested.clone());

        Task::start(&task);
        event_loop.run_until_idle();
        assert_eq!(task.borrow().inflight_count(), 1);

        Task::cancel(&task);
        assert_eq!(task.borrow().state(), TaskState::Canceled);
        assert_eq!(nested.borrow().state(), TaskState::Canceled);

        // a late response on the in-flight call must not resurrect the task
        let call = server.borrow().calls[0].clone();
        let (txid, sender) = {
            let call = call.borrow();
            (call.txid(), call.target().id)
        };
        call.borrow_mut()
            .responded(Message::ping_response(txid).with_sender(sender));
        event_loop.run_until_idle();
        assert_eq!(task.borrow().state(), TaskState::Canceled);
        Task::with_handler_ref::<PingAll, _>(&task, |handler| {
            assert_eq!(handler.responded, 0);
        })
        .unwrap();
    }

    #[test]
    fn concurrency_cap_is_respected() {
        let event_loop = EventLoop::new();
        let server = RecordingServer::new(event_loop.clone());
        let targets: Vec<NodeInfo> = (0..40).map(|n| node(n as u8)).collect();
        let task = Task::new(
            Box::new(PingAll::new(targets)),
            server.clone(),
            event_loop.clone(),
        );
        Task::start(&task);
        event_loop.run_until_idle();
        assert_eq!(task.borrow().inflight_count(), MAX_CONCURRENT_TASK_REQUESTS);

        let low = Task::new(
            Box::new(PingAll::new((0..40).map(|n| node(n as u8)).collect())),
            server,
            event_loop.clone(),
        );
        low.borrow_mut().set_low_priority(true);
        Task::start(&low);
        event_loop.run_until_idle();
        assert_eq!(
            low.borrow().inflight_count(),
            MAX_CONCURRENT_TASK_REQUESTS_LOW_PRIORITY
        );
    }

    #[test]
    fn timeouts_reenter_iterate_and_finish() {
        let event_loop = EventLoop::new();
        let server = RecordingServer::new(event_loop.clone());
        let task = Task::new(
            Box::new(PingAll::new(vec![node(1), node(2)])),
            server.clone(),
            event_loop.clone(),
        );
        Task::start(&task);
        event_loop.run_until_idle();

        for call in server.borrow().calls.iter() {
            let call = call.clone();
            event_loop.post(move || call.borrow_mut().timeout());
        }
        event_loop.run_until_idle();

        assert_eq!(task.borrow().state(), TaskState::Completed);
        Task::with_handler_ref::<PingAll, _>(&task, |handler| {
            assert_eq!(handler.timeouts, 2);
        })
        .unwrap();
    }
}
