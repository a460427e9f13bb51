use std::any::Any;
use std::collections::VecDeque;

use tracing::debug;

use super::{Task, TaskContext, TaskHandle, TaskHandler};
use crate::messages::{generate_txid, Message};
use crate::node::{KBucket, KBucketEntry};
use crate::routing::RoutingTableRef;
use crate::rpc::RpcCall;
use crate::Dht;

#[derive(Debug, Clone, Copy, Default)]
pub struct RefreshOptions {
    /// Probe every entry, not only the ones that look stale.
    pub check_all: bool,
    /// Also probe the bucket's replacement cache.
    pub probe_cache: bool,
    /// Ask the routing table to drop entries that time out.
    pub remove_on_timeout: bool,
}

/// Walks a bucket pinging entries, optionally evicting the unresponsive
/// ones through the routing-table contract.
pub struct PingRefreshTask {
    routing: RoutingTableRef,
    todo: VecDeque<KBucketEntry>,
    options: RefreshOptions,
}

impl PingRefreshTask {
    pub fn create(dht: &Dht, bucket: &KBucket, options: RefreshOptions) -> TaskHandle {
        let mut todo: VecDeque<KBucketEntry> = bucket
            .entries()
            .iter()
            .filter(|entry| options.check_all || entry.needs_ping())
            .cloned()
            .collect();
        if options.probe_cache {
            todo.extend(bucket.cache_entries().iter().cloned());
        }
        let handler = Self {
            routing: dht.routing.clone(),
            todo,
            options,
        };
        let task = Task::new(Box::new(handler), dht.server.clone(), dht.event_loop.clone());
        // refreshes yield to user-visible lookups
        task.borrow_mut().set_low_priority(true);
        task
    }
}

impl TaskHandler for PingRefreshTask {
    fn name(&self) -> &str {
        "ping-refresh"
    }

    fn iterate(&mut self, ctx: &mut TaskContext) {
        while ctx.can_do_request() {
            let Some(entry) = self.todo.pop_front() else {
                break;
            };
            ctx.send_call(entry.info().clone(), Message::ping_request(generate_txid()));
        }
    }

    fn call_timeout(&mut self, _ctx: &mut TaskContext, call: &RpcCall) {
        if self.options.remove_on_timeout {
            // resolve by id at timeout time; the bucket may have split
            // since the entry was captured
            let id = call.target().id;
            debug!(node = %call.target(), "Refresh timeout, dropping entry");
            self.routing.borrow_mut().remove_if_bad(&id, true);
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
