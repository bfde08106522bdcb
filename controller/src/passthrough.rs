//! Memory pass-through path
//!
//! # Purpose
//! Ordinary (non-capability) traffic is forwarded downstream with a
//! controller-private tag and relayed back once memory answers. The
//! controller promises its CPU side per-requester FIFO completion: a
//! requester sees its pass-through responses in the order it issued the
//! requests, whatever order memory completes them in. No ordering exists
//! across requesters.
//!
//! ## Head-of-line and timeouts
//! A completion that overtakes an older in-flight request of the same
//! requester is held until the older one completes or times out. A request
//! with no answer by its deadline completes with a timeout error in its
//! FIFO position; a downstream response that arrives after its request
//! timed out is dropped and counted, never delivered.

use std::collections::{BTreeMap, HashMap, VecDeque};

use capstone_protocol::{
    ErrorCode, MemRequest, MemRequestKind, MemResponse, MemResponseBody, MemTag, RequestTag,
    RequesterId, Response, ResponseBody,
};

/// What became of a downstream completion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Matched an in-flight request
    Matched,

    /// Arrived for a request that already timed out or was never issued
    Late,
}

#[derive(Debug)]
enum EntryState {
    /// Issued, no answer yet
    Waiting,

    /// Answer arrived, waiting for its FIFO turn
    Arrived(MemResponseBody),

    /// Deadline passed; releases as a timeout error
    TimedOut,
}

#[derive(Debug)]
struct Entry {
    tag: RequestTag,
    requester: RequesterId,
    deadline: Option<u64>,
    state: EntryState,
}

impl Entry {
    /// Response to release, `None` while still waiting
    fn into_response(self) -> Option<Response> {
        let body = match self.state {
            EntryState::Waiting => return None,
            EntryState::Arrived(MemResponseBody::Data(bytes)) => ResponseBody::Data(bytes),
            EntryState::Arrived(MemResponseBody::Written) => ResponseBody::Ack,
            EntryState::TimedOut => ResponseBody::Error(ErrorCode::MemoryTimeout),
        };
        Some(Response::new(self.tag, self.requester, body))
    }
}

/// In-flight pass-through bookkeeping
#[derive(Debug, Default)]
pub struct PassThrough {
    /// Next downstream tag; never reused while the model lives
    next_tag: u64,

    /// In-flight and arrived-but-held requests, keyed by downstream tag
    entries: HashMap<u64, Entry>,

    /// Per-requester release order of downstream tags
    order: BTreeMap<u32, VecDeque<u64>>,
}

impl PassThrough {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests issued and not yet released
    #[inline]
    pub fn outstanding(&self) -> usize {
        self.entries.len()
    }

    /// Record a pass-through request and build its downstream form
    ///
    /// `timeout` is relative to `now`; `None` waits forever.
    pub fn submit(
        &mut self,
        tag: RequestTag,
        requester: RequesterId,
        kind: MemRequestKind,
        now: u64,
        timeout: Option<u64>,
    ) -> MemRequest {
        let mem_tag = MemTag(self.next_tag);
        self.next_tag += 1;

        self.entries.insert(
            mem_tag.0,
            Entry {
                tag,
                requester,
                deadline: timeout.map(|t| now.saturating_add(t)),
                state: EntryState::Waiting,
            },
        );
        self.order
            .entry(requester.0)
            .or_default()
            .push_back(mem_tag.0);

        log::trace!(
            "passthrough: issued {:?} for requester {} tag {:#x}",
            mem_tag,
            requester.0,
            tag.0
        );
        MemRequest { tag: mem_tag, kind }
    }

    /// Accept a downstream completion
    ///
    /// Late completions are dropped here; a timed-out request keeps its
    /// timeout status even if memory answers afterwards.
    pub fn on_response(&mut self, response: MemResponse) -> Completion {
        match self.entries.get_mut(&response.tag.0) {
            Some(entry) if matches!(entry.state, EntryState::Waiting) => {
                entry.state = EntryState::Arrived(response.body);
                Completion::Matched
            }
            Some(_) => {
                log::debug!("passthrough: late completion for {:?}, dropped", response.tag);
                Completion::Late
            }
            None => {
                log::debug!("passthrough: unmatched completion {:?}, dropped", response.tag);
                Completion::Late
            }
        }
    }

    /// Mark every overdue request timed out; returns how many
    pub fn expire(&mut self, now: u64) -> usize {
        let mut expired = 0;
        for entry in self.entries.values_mut() {
            if matches!(entry.state, EntryState::Waiting)
                && entry.deadline.is_some_and(|d| now >= d)
            {
                entry.state = EntryState::TimedOut;
                expired += 1;
                log::debug!(
                    "passthrough: request tag {:#x} of requester {} timed out",
                    entry.tag.0,
                    entry.requester.0
                );
            }
        }
        expired
    }

    /// Release every response whose FIFO turn has come
    ///
    /// Per requester, responses leave strictly in submission order; a
    /// waiting head holds everything behind it.
    pub fn release(&mut self) -> Vec<Response> {
        let entries = &mut self.entries;
        let mut out = Vec::new();

        self.order.retain(|_, queue| {
            while let Some(&front) = queue.front() {
                match entries.get(&front) {
                    Some(entry) if matches!(entry.state, EntryState::Waiting) => break,
                    Some(_) => {
                        queue.pop_front();
                        if let Some(response) =
                            entries.remove(&front).and_then(Entry::into_response)
                        {
                            out.push(response);
                        }
                    }
                    None => {
                        queue.pop_front();
                    }
                }
            }
            !queue.is_empty()
        });
        out
    }
}
