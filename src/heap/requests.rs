//! The ticketed collection-request queue.
//!
//! Every request is granted a monotonically increasing ticket; a request is
//! satisfied when `last_served` reaches its ticket. An async request that an
//! earlier pending, equal-or-stronger request would already satisfy is
//! coalesced onto that request's ticket instead of being enqueued. Coalescing
//! only happens before a cycle begins; once Begun, a cycle always runs to
//! completion.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

use crate::heap::CollectionScope;

/// Whether `collect` blocks until the request's ticket is served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Synchronousness {
    Sync,
    Async,
}

/// One enqueued collection request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GCRequest {
    /// The scope the requester demands; `None` lets the Begin-phase
    /// heuristics decide.
    pub scope: Option<CollectionScope>,
}

impl GCRequest {
    pub fn eden() -> Self {
        GCRequest {
            scope: Some(CollectionScope::Eden),
        }
    }

    pub fn full() -> Self {
        GCRequest {
            scope: Some(CollectionScope::Full),
        }
    }

    fn strength(&self) -> u8 {
        match self.scope {
            None => 0,
            Some(CollectionScope::Eden) => 1,
            Some(CollectionScope::Full) => 2,
        }
    }

    /// Would a collection satisfying `other` also satisfy `self`?
    pub(crate) fn subsumed_by(&self, other: &GCRequest) -> bool {
        other.strength() >= self.strength()
    }
}

struct RequestsSync {
    queue: VecDeque<(u64, GCRequest)>,
    last_granted: u64,
    last_served: u64,
    /// Set by `last_chance_to_finalize`; no request is granted afterwards.
    shutdown: bool,
}

pub(crate) struct RequestQueue {
    sync: Mutex<RequestsSync>,
    served: Condvar,
}

impl RequestQueue {
    pub fn new() -> Self {
        RequestQueue {
            sync: Mutex::new(RequestsSync {
                queue: VecDeque::new(),
                last_granted: 0,
                last_served: 0,
                shutdown: false,
            }),
            served: Condvar::new(),
        }
    }

    /// Enqueue (or coalesce) a request. Returns the ticket that will satisfy
    /// it, or `None` after shutdown.
    pub fn enqueue(&self, request: GCRequest) -> Option<u64> {
        let mut sync = self.sync.lock().unwrap();
        if sync.shutdown {
            warn!("ignoring {:?}: collections are forbidden after shutdown", request);
            return None;
        }
        for (ticket, pending) in sync.queue.iter() {
            if request.subsumed_by(pending) {
                trace!("request {:?} coalesced onto ticket {}", request, ticket);
                return Some(*ticket);
            }
        }
        sync.last_granted += 1;
        let ticket = sync.last_granted;
        sync.queue.push_back((ticket, request));
        trace!("request {:?} granted ticket {}", request, ticket);
        Some(ticket)
    }

    /// Block until `ticket` is served.
    pub fn wait_for_ticket(&self, ticket: u64) {
        let mut sync = self.sync.lock().unwrap();
        while sync.last_served < ticket {
            sync = self.served.wait(sync).unwrap();
        }
    }

    pub fn is_ticket_served(&self, ticket: u64) -> bool {
        self.sync.lock().unwrap().last_served >= ticket
    }

    /// Begin pops the head request; the cycle now in flight owns its ticket.
    pub fn begin_cycle(&self) -> Option<(u64, GCRequest)> {
        self.sync.lock().unwrap().queue.pop_front()
    }

    /// End marks the in-flight ticket served. Tickets are served strictly in
    /// grant order; anything else is an unsound scheduler.
    pub fn did_serve(&self, ticket: u64) {
        let mut sync = self.sync.lock().unwrap();
        assert!(
            ticket > sync.last_served && ticket <= sync.last_granted,
            "ticket {} served out of order (served {}, granted {})",
            ticket,
            sync.last_served,
            sync.last_granted
        );
        sync.last_served = ticket;
        drop(sync);
        self.served.notify_all();
    }

    pub fn has_pending(&self) -> bool {
        !self.sync.lock().unwrap().queue.is_empty()
    }

    pub fn last_granted(&self) -> u64 {
        self.sync.lock().unwrap().last_granted
    }

    /// Forbid all future requests. Returns the final granted ticket so the
    /// caller can wait out everything already promised.
    pub fn forbid_new_requests(&self) -> u64 {
        let mut sync = self.sync.lock().unwrap();
        sync.shutdown = true;
        sync.last_granted
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tickets_are_granted_in_order() {
        let queue = RequestQueue::new();
        let t1 = queue.enqueue(GCRequest::eden()).unwrap();
        let t2 = queue.enqueue(GCRequest::full()).unwrap();
        assert!(t1 < t2);
    }

    #[test]
    fn weaker_requests_coalesce_onto_stronger_pending_ones() {
        let queue = RequestQueue::new();
        let t_full = queue.enqueue(GCRequest::full()).unwrap();
        let t_eden = queue.enqueue(GCRequest::eden()).unwrap();
        let t_any = queue.enqueue(GCRequest::default()).unwrap();
        assert_eq!(t_full, t_eden);
        assert_eq!(t_full, t_any);
        // One cycle serves all three.
        assert_eq!(queue.begin_cycle().unwrap().0, t_full);
        assert!(!queue.has_pending());
    }

    #[test]
    fn stronger_requests_do_not_coalesce_onto_weaker_ones() {
        let queue = RequestQueue::new();
        let t_eden = queue.enqueue(GCRequest::eden()).unwrap();
        let t_full = queue.enqueue(GCRequest::full()).unwrap();
        assert_ne!(t_eden, t_full);
    }

    #[test]
    fn serving_follows_grant_order() {
        let queue = RequestQueue::new();
        let t1 = queue.enqueue(GCRequest::eden()).unwrap();
        let t2 = queue.enqueue(GCRequest::full()).unwrap();

        let (ticket, _) = queue.begin_cycle().unwrap();
        assert_eq!(ticket, t1);
        queue.did_serve(t1);
        assert!(queue.is_ticket_served(t1));
        assert!(!queue.is_ticket_served(t2));

        let (ticket, request) = queue.begin_cycle().unwrap();
        assert_eq!(ticket, t2);
        assert_eq!(request, GCRequest::full());
        queue.did_serve(t2);
        assert!(queue.is_ticket_served(t2));
    }

    #[test]
    #[should_panic(expected = "out of order")]
    fn out_of_order_serving_is_fatal() {
        let queue = RequestQueue::new();
        let _t1 = queue.enqueue(GCRequest::eden()).unwrap();
        let t2 = queue.enqueue(GCRequest::full()).unwrap();
        queue.did_serve(t2);
        queue.did_serve(t2 - 1);
    }

    #[test]
    fn shutdown_refuses_new_requests() {
        let queue = RequestQueue::new();
        let t1 = queue.enqueue(GCRequest::eden()).unwrap();
        let last = queue.forbid_new_requests();
        assert_eq!(last, t1);
        assert_eq!(queue.enqueue(GCRequest::full()), None);
    }
}
