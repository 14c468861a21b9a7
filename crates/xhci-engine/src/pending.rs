//! Correlation of completion events with outstanding requests.
//!
//! Every TRB of an outstanding request is keyed by its device address, which is stable for as long
//! as the TRB is unretired. A completion event names the TRB it completes, which leads back to the
//! request and its one-shot completion slot.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use crate::event_ring::{CommandCompletionEvent, TransferEvent};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestId(u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestKind {
    Command,
    ControlTransfer { slot_id: u8 },
    /// A timed-out command rewritten as a No-Op; its completion only retires the ring slot.
    Reclaim,
    /// A timed-out control TD whose endpoint could not be stopped. It stays correlated until the
    /// controller reports it or the endpoint is recovered.
    AbandonedTransfer { slot_id: u8 },
}

impl RequestKind {
    /// Slot whose endpoint 0 ring holds the request's TRBs.
    pub fn slot_id(self) -> Option<u8> {
        match self {
            Self::ControlTransfer { slot_id } | Self::AbandonedTransfer { slot_id } => {
                Some(slot_id)
            }
            Self::Command | Self::Reclaim => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Completion {
    Command(CommandCompletionEvent),
    Transfer(TransferEvent),
}

impl Completion {
    fn is_final_for(&self, last_trb: bool) -> bool {
        match self {
            Self::Command(_) => true,
            // Success/short packet on an intermediate TRB is progress, not completion: the TD
            // finishes on its last TRB. Any error ends it where it happened.
            Self::Transfer(ev) => last_trb || !ev.code.is_success(),
        }
    }
}

/// A resolved request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Finished {
    pub completion: Completion,
    /// Intermediate event recorded before the final one (e.g. a short packet on a data stage).
    pub partial: Option<TransferEvent>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resolution {
    Completed { id: RequestId, kind: RequestKind },
    Partial { id: RequestId },
    /// No outstanding request owns the TRB, or the request already completed.
    Miss,
}

#[derive(Debug)]
struct Request {
    kind: RequestKind,
    trbs: Vec<u64>,
    completion: Option<Completion>,
    partial: Option<TransferEvent>,
}

#[derive(Debug, Default)]
pub struct PendingRequests {
    next_id: u64,
    by_trb: BTreeMap<u64, RequestId>,
    requests: BTreeMap<RequestId, Request>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Registers a request owning `trbs` (device addresses, in ring order).
    pub fn register(&mut self, kind: RequestKind, trbs: &[u64]) -> RequestId {
        let id = RequestId(self.next_id);
        self.next_id = self.next_id.wrapping_add(1);
        for &trb in trbs {
            self.by_trb.insert(trb, id);
        }
        self.requests.insert(
            id,
            Request {
                kind,
                trbs: trbs.to_vec(),
                completion: None,
                partial: None,
            },
        );
        id
    }

    pub fn set_kind(&mut self, id: RequestId, kind: RequestKind) {
        if let Some(req) = self.requests.get_mut(&id) {
            req.kind = kind;
        }
    }

    pub fn is_complete(&self, id: RequestId) -> bool {
        self.requests
            .get(&id)
            .is_some_and(|r| r.completion.is_some())
    }

    /// Routes a completion naming `trb` to the request that owns it.
    pub fn resolve(&mut self, trb: u64, completion: Completion) -> Resolution {
        let Some(&id) = self.by_trb.get(&trb) else {
            return Resolution::Miss;
        };
        let Some(req) = self.requests.get_mut(&id) else {
            return Resolution::Miss;
        };
        if req.completion.is_some() {
            return Resolution::Miss;
        }

        let last_trb = req.trbs.last() == Some(&trb);
        if !completion.is_final_for(last_trb) {
            if let Completion::Transfer(ev) = completion {
                req.partial = Some(ev);
            }
            return Resolution::Partial { id };
        }

        req.completion = Some(completion);
        Resolution::Completed { id, kind: req.kind }
    }

    /// Removes a request, returning its result if it completed.
    pub fn take(&mut self, id: RequestId) -> Option<Finished> {
        let req = self.requests.remove(&id)?;
        for trb in &req.trbs {
            if self.by_trb.get(trb) == Some(&id) {
                self.by_trb.remove(trb);
            }
        }
        req.completion.map(|completion| Finished {
            completion,
            partial: req.partial,
        })
    }

    /// Drops every request whose kind matches `pred` (used when a ring is torn down).
    pub fn remove_where(&mut self, mut pred: impl FnMut(RequestKind) -> bool) {
        let ids: Vec<RequestId> = self
            .requests
            .iter()
            .filter(|(_, r)| pred(r.kind))
            .map(|(&id, _)| id)
            .collect();
        for id in ids {
            self.take(id);
        }
    }
}
