use std::any::Any;
use std::cmp::Ordering;

use tracing::debug;

use super::{TaskContext, TaskHandler};
use crate::candidates::ClosestCandidates;
use crate::closest_set::ClosestSet;
use crate::id::Id;
use crate::messages::Message;
use crate::node::{is_any_unicast, is_global_unicast, NodeInfo};
use crate::routing::RoutingTableRef;
use crate::rpc::RpcCall;
use crate::K;

/// Iteration ceiling; a lookup that has not converged by now is close
/// enough and stops burning calls.
pub const MAX_LOOKUP_ITERATIONS: usize = 3 * K;

/// What a result filter decided about a candidate result: whether to keep
/// it, and whether the lookup can stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterResult {
    AcceptContinue,
    AcceptDone,
    RejectContinue,
    RejectDone,
}

impl FilterResult {
    pub fn accepted(self) -> bool {
        matches!(self, FilterResult::AcceptContinue | FilterResult::AcceptDone)
    }

    pub fn done(self) -> bool {
        matches!(self, FilterResult::AcceptDone | FilterResult::RejectDone)
    }
}

/// The shared state of every iterative lookup: the target, the candidate
/// frontier and the confirmed closest set.
pub struct LookupState {
    target: Id,
    candidates: ClosestCandidates,
    closest: ClosestSet,
    routing: RoutingTableRef,
    dev_mode: bool,
    bootstrap: bool,
    iteration_count: usize,
    lookup_done: bool,
}

impl LookupState {
    pub fn new(target: Id, routing: RoutingTableRef, dev_mode: bool) -> Self {
        Self {
            target,
            candidates: ClosestCandidates::new(target, K * 3, dev_mode),
            closest: ClosestSet::new(target, K),
            routing,
            dev_mode,
            bootstrap: false,
            iteration_count: 0,
            lookup_done: false,
        }
    }

    /// Seed from the farthest shell instead of the nearest, maximizing
    /// path coverage on a cold start.
    pub fn with_bootstrap(mut self, bootstrap: bool) -> Self {
        self.bootstrap = bootstrap;
        self
    }

    pub fn target(&self) -> &Id {
        &self.target
    }

    pub fn closest_set(&self) -> &ClosestSet {
        &self.closest
    }

    pub fn candidates(&self) -> &ClosestCandidates {
        &self.candidates
    }

    pub fn iteration_count(&self) -> usize {
        self.iteration_count
    }

    /// Ends the lookup after the current event settles.
    pub fn set_done(&mut self) {
        self.lookup_done = true;
    }

    fn populate(&mut self) {
        let seed_target = if self.bootstrap {
            self.target.distance(&Id::MAX)
        } else {
            self.target
        };
        let entries = self
            .routing
            .borrow()
            .closest_nodes(&seed_target, K * 3)
            .filter(|entry| entry.eligible_for_local_lookup())
            .fill();
        self.candidates.add_entries(entries);
    }

    /// Admission control for nodes learned from responses: acceptable
    /// address class, not ourselves, not already confirmed.
    fn add_candidates(&mut self, nodes: Vec<NodeInfo>) {
        let mut admitted = Vec::with_capacity(nodes.len());
        {
            let routing = self.routing.borrow();
            for node in nodes {
                let address_ok = if self.dev_mode {
                    is_any_unicast(&node.ip())
                } else {
                    is_global_unicast(&node.ip())
                };
                if address_ok && !routing.is_local_id(&node.id) && !self.closest.contains(&node.id)
                {
                    admitted.push(node);
                }
            }
        }
        self.candidates.add(admitted);
    }
}

/// The method-specific half of a lookup.
pub trait LookupVariant: 'static {
    fn name(&self) -> &'static str;

    fn build_request(&mut self, lookup: &LookupState) -> Message;

    /// Digests a response body after the common bookkeeping ran. Returns
    /// the nodes to feed into the frontier, or `None` to condemn the whole
    /// response.
    fn on_response(
        &mut self,
        lookup: &mut LookupState,
        call: &RpcCall,
        response: &Message,
    ) -> Option<Vec<NodeInfo>>;
}

/// Kademlia convergence shared by all lookup kinds: drain eligible
/// candidates into RPCs, absorb responses into the closest set, stop when
/// the frontier cannot improve the set anymore.
pub struct LookupTask<V: LookupVariant> {
    lookup: LookupState,
    variant: V,
}

impl<V: LookupVariant> LookupTask<V> {
    pub fn new(lookup: LookupState, variant: V) -> Self {
        Self { lookup, variant }
    }

    pub fn lookup(&self) -> &LookupState {
        &self.lookup
    }

    pub fn variant(&self) -> &V {
        &self.variant
    }

    /// Injects candidates directly, bypassing the routing table seed.
    pub fn inject_candidates(&mut self, nodes: Vec<NodeInfo>) {
        self.lookup.add_candidates(nodes);
    }
}

impl<V: LookupVariant> TaskHandler for LookupTask<V> {
    fn name(&self) -> &str {
        self.variant.name()
    }

    fn prepare(&mut self, _ctx: &mut TaskContext) {
        self.lookup.populate();
    }

    fn iterate(&mut self, ctx: &mut TaskContext) {
        self.lookup.iteration_count += 1;
        while ctx.can_do_request() {
            let Some(id) = self.lookup.candidates.next() else {
                break;
            };
            let request = self.variant.build_request(&self.lookup);
            let target = {
                // in-flight before dispatch, so next() skips it from here on
                let candidate = self
                    .lookup
                    .candidates
                    .get_mut(&id)
                    .expect("next() returned the id");
                candidate.set_sent();
                candidate.info().clone()
            };
            debug!(
                target = %self.lookup.target,
                node = %target,
                "Lookup querying candidate"
            );
            ctx.send_call(target, request);
        }
    }

    fn call_responded(&mut self, _ctx: &mut TaskContext, call: &RpcCall, response: &Message) {
        let id = call.target().id;
        let Some(mut candidate) = self.lookup.candidates.remove(&id) else {
            return;
        };
        candidate.set_replied();
        candidate.set_token(response.token());
        self.lookup.closest.add(candidate);

        if let Some(nodes) = self.variant.on_response(&mut self.lookup, call, response) {
            self.lookup.add_candidates(nodes);
        } else {
            debug!(
                target = %self.lookup.target,
                node = %call.target(),
                "Lookup dropped a response wholesale"
            );
        }
    }

    fn call_error(&mut self, _ctx: &mut TaskContext, call: &RpcCall) {
        // gone for good; the dedup set keeps it from coming back
        self.lookup.candidates.remove(&call.target().id);
    }

    fn call_timeout(&mut self, _ctx: &mut TaskContext, call: &RpcCall) {
        let id = call.target().id;
        let Some(candidate) = self.lookup.candidates.get_mut(&id) else {
            return;
        };
        if candidate.is_unreachable() {
            self.lookup.candidates.remove(&id);
        } else {
            candidate.clear_sent();
        }
    }

    fn is_done(&self, inflight: usize) -> bool {
        if self.lookup.lookup_done {
            return true;
        }
        if self.lookup.iteration_count >= MAX_LOOKUP_ITERATIONS {
            return true;
        }
        if inflight > 0 {
            return false;
        }
        if self.lookup.candidates.is_empty() {
            return true;
        }
        // every remaining candidate is farther than our worst confirmed
        // responder: the frontier cannot improve the set anymore
        self.lookup.closest.is_eligible()
            && self.lookup.target.three_way_compare(
                &self.lookup.closest.tail(),
                &self.lookup.candidates.head(),
            ) != Ordering::Greater
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
