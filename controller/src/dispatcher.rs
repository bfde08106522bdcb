//! Request classification and mutation scheduling
//!
//! # Purpose
//! Every request entering the controller passes through here exactly once.
//! The dispatcher sorts traffic into three lanes:
//!
//! ```text
//!                      +----------------------+
//!   Request ---------->|        admit         |
//!                      +----------------------+
//!                        |        |        |
//!            PassThrough |  Query |        | Mutation
//!                        v        v        v
//!                   downstream  answered  FIFO queue --> step()
//!                   memory      now                      (engine)
//! ```
//!
//! ## Scheduling rules
//! Queries are answered at admission in O(1) and never wait behind
//! mutations. Mutations execute strictly in admission order, at most one
//! starting per tick, against the single engine reference - the node table
//! has one writer by construction. A revocation whose subtree exceeds the
//! per-tick budget keeps the mutation lane busy across ticks until its walk
//! completes; its acknowledgement is sent on the completing tick.
//!
//! Memory accesses that touch the node-table window are refused here as
//! malformed rather than forwarded, so raw writes can never corrupt node
//! records behind the engine's back.

use std::collections::VecDeque;

use capstone_node_table::{Bounds, Derivation, RevocationEngine, RevokeProgress, RevokeWalk};
use capstone_protocol::wire::MAX_ACCESS_SIZE;
use capstone_protocol::{
    Command, CommandClass, ErrorCode, Request, RequestTag, RequesterId, Response, ResponseBody,
};

use crate::stats::ControllerStats;

/// Admission outcome for one request
#[derive(Debug)]
pub enum Admit {
    /// Window-checked memory access; forward downstream
    PassThrough(Request),

    /// Answered on the spot (queries and admission-time errors)
    Response(Response),

    /// Mutation accepted; executes in FIFO order via [`Dispatcher::step`]
    Queued,
}

/// Revocation walk occupying the mutation lane
#[derive(Debug)]
struct ActiveRevoke {
    tag: RequestTag,
    requester: RequesterId,
    walk: RevokeWalk,
}

/// Single-writer scheduler in front of the revocation engine
#[derive(Debug)]
pub struct Dispatcher {
    /// Node-table MMIO window; overlapping accesses are malformed
    window: Bounds,

    /// Mutations admitted but not yet started
    mutations: VecDeque<Request>,

    /// Revocation walk in progress, if any
    active: Option<ActiveRevoke>,
}

impl Dispatcher {
    pub fn new(window: Bounds) -> Self {
        Self {
            window,
            mutations: VecDeque::new(),
            active: None,
        }
    }

    /// True when no mutation is queued or walking
    #[inline]
    pub fn is_idle(&self) -> bool {
        self.mutations.is_empty() && self.active.is_none()
    }

    /// Mutations admitted and not yet completed
    #[inline]
    pub fn backlog(&self) -> usize {
        self.mutations.len() + usize::from(self.active.is_some())
    }

    /// Classify one request and serve what can be served immediately
    pub fn admit(
        &mut self,
        engine: &RevocationEngine,
        request: Request,
        stats: &mut ControllerStats,
    ) -> Admit {
        match request.command.class() {
            CommandClass::PassThrough => {
                if let Err(code) = self.check_access(&request.command) {
                    stats.malformed_requests += 1;
                    return Admit::Response(Response::error(request.tag, request.requester, code));
                }
                Admit::PassThrough(request)
            }
            CommandClass::NodeQuery => {
                let Command::Query { node } = request.command else {
                    // class() puts only Query here
                    stats.malformed_requests += 1;
                    return Admit::Response(Response::error(
                        request.tag,
                        request.requester,
                        ErrorCode::MalformedRequest,
                    ));
                };
                let body = match engine.query(node) {
                    Ok(valid) => {
                        stats.queries += 1;
                        ResponseBody::Validity(valid)
                    }
                    Err(err) => {
                        stats.node_op_errors += 1;
                        ResponseBody::Error(err.into())
                    }
                };
                Admit::Response(Response::new(request.tag, request.requester, body))
            }
            CommandClass::NodeMutation => {
                self.mutations.push_back(request);
                Admit::Queued
            }
        }
    }

    /// Run the mutation lane for one tick
    ///
    /// Continues an active revocation walk first, spending at most `budget`
    /// node visits; otherwise starts the oldest queued mutation. Returns
    /// the responses completed this tick (at most one).
    pub fn step(
        &mut self,
        engine: &mut RevocationEngine,
        budget: usize,
        stats: &mut ControllerStats,
    ) -> Vec<Response> {
        let mut out = Vec::new();

        if let Some(active) = self.active.as_mut() {
            match engine.revoke_step(&mut active.walk, budget) {
                RevokeProgress::InProgress => {}
                RevokeProgress::Complete { revoked, freed } => {
                    stats.revokes += 1;
                    stats.nodes_revoked += revoked as u64;
                    stats.nodes_freed += freed as u64;
                    out.push(Response::new(active.tag, active.requester, ResponseBody::Ack));
                    self.active = None;
                }
            }
            // The walk held the lane this tick either way
            return out;
        }

        if let Some(request) = self.mutations.pop_front() {
            if let Some(response) = self.execute(engine, request, budget, stats) {
                out.push(response);
            }
        }
        out
    }

    /// Run one mutation to completion or, for revocation, as far as the
    /// budget allows
    ///
    /// Returns `None` when a revocation walk outlives the tick; its
    /// acknowledgement comes from the completing [`Dispatcher::step`].
    fn execute(
        &mut self,
        engine: &mut RevocationEngine,
        request: Request,
        budget: usize,
        stats: &mut ControllerStats,
    ) -> Option<Response> {
        let Request {
            tag,
            requester,
            command,
        } = request;

        let result = match command {
            Command::Derive { parent: None, derivation: Derivation::Branch } => {
                engine.derive_root().map(|handle| {
                    stats.derives += 1;
                    ResponseBody::Handle(handle)
                })
            }
            Command::Derive { parent: None, derivation: Derivation::Leaf { .. } } => {
                // A leaf cannot anchor a tree
                stats.malformed_requests += 1;
                return Some(Response::error(tag, requester, ErrorCode::MalformedRequest));
            }
            Command::Derive {
                parent: Some(parent),
                derivation,
            } => engine.derive(parent, derivation).map(|handle| {
                stats.derives += 1;
                ResponseBody::Handle(handle)
            }),
            Command::Revoke { node } => match engine.begin_revoke(node) {
                Ok(mut walk) => match engine.revoke_step(&mut walk, budget) {
                    RevokeProgress::Complete { revoked, freed } => {
                        stats.revokes += 1;
                        stats.nodes_revoked += revoked as u64;
                        stats.nodes_freed += freed as u64;
                        Ok(ResponseBody::Ack)
                    }
                    RevokeProgress::InProgress => {
                        self.active = Some(ActiveRevoke {
                            tag,
                            requester,
                            walk,
                        });
                        return None;
                    }
                },
                Err(err) => Err(err),
            },
            Command::Unlink { node } => engine.unlink(node).map(|()| {
                stats.unlinks += 1;
                ResponseBody::Ack
            }),
            Command::RcUpdate { node, delta } => engine.rc_update(node, delta).map(|count| {
                stats.rc_updates += 1;
                // A zero count on a now-dead handle means the slot was
                // reclaimed by this update
                if count == 0 && !engine.store().contains(node) {
                    stats.nodes_freed += 1;
                }
                ResponseBody::RefCount(count)
            }),
            Command::MemRead { .. } | Command::MemWrite { .. } | Command::Query { .. } => {
                // admit() never queues these
                stats.malformed_requests += 1;
                return Some(Response::error(tag, requester, ErrorCode::MalformedRequest));
            }
        };

        Some(match result {
            Ok(body) => Response::new(tag, requester, body),
            Err(err) => {
                stats.node_op_errors += 1;
                log::debug!("node op failed: {}", err);
                Response::error(tag, requester, err.into())
            }
        })
    }

    /// Refuse accesses that are out of size range, wrap the top of the
    /// address space, or touch node records
    fn check_access(&self, command: &Command) -> Result<(), ErrorCode> {
        let (addr, length) = match *command {
            Command::MemRead { addr, size } => (addr, size as u64),
            Command::MemWrite { addr, ref data } => (addr, data.len() as u64),
            _ => return Ok(()),
        };
        if length == 0 || length > MAX_ACCESS_SIZE as u64 {
            return Err(ErrorCode::MalformedRequest);
        }
        // The exclusive end must stay representable; a wrapping access
        // would alias low memory downstream
        if addr.checked_add(length).is_none() {
            return Err(ErrorCode::MalformedRequest);
        }
        let access = Bounds::new(addr, length);
        if access.overlaps(&self.window) {
            log::warn!(
                "memory access {:#x}+{} overlaps the node-table window, refused",
                access.base,
                access.length
            );
            return Err(ErrorCode::MalformedRequest);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capstone_protocol::wire::{node_table_window, NODE_TABLE_BASE};

    const CAPACITY: usize = 128;

    fn setup() -> (Dispatcher, RevocationEngine, ControllerStats) {
        (
            Dispatcher::new(node_table_window(CAPACITY)),
            RevocationEngine::new(CAPACITY),
            ControllerStats::default(),
        )
    }

    fn derive_root_req(tag: u64) -> Request {
        Request::new(
            RequestTag(tag),
            RequesterId(0),
            Command::Derive {
                parent: None,
                derivation: Derivation::Branch,
            },
        )
    }

    fn run_one(
        dispatcher: &mut Dispatcher,
        engine: &mut RevocationEngine,
        stats: &mut ControllerStats,
        request: Request,
    ) -> Response {
        match dispatcher.admit(engine, request, stats) {
            Admit::Response(response) => response,
            Admit::Queued => {
                let mut responses = dispatcher.step(engine, usize::MAX, stats);
                assert_eq!(responses.len(), 1);
                responses.pop().unwrap()
            }
            Admit::PassThrough(_) => panic!("node op classified as pass-through"),
        }
    }

    fn handle_of(response: &Response) -> capstone_node_table::NodeHandle {
        match response.body {
            ResponseBody::Handle(handle) => handle,
            ref other => panic!("expected handle, got {:?}", other),
        }
    }

    #[test]
    fn mutations_execute_in_admission_order() {
        let (mut dispatcher, mut engine, mut stats) = setup();

        assert!(matches!(
            dispatcher.admit(&engine, derive_root_req(1), &mut stats),
            Admit::Queued
        ));
        assert!(matches!(
            dispatcher.admit(&engine, derive_root_req(2), &mut stats),
            Admit::Queued
        ));
        assert_eq!(dispatcher.backlog(), 2);

        let first = dispatcher.step(&mut engine, 8, &mut stats);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].tag, RequestTag(1));

        let second = dispatcher.step(&mut engine, 8, &mut stats);
        assert_eq!(second[0].tag, RequestTag(2));
        assert!(dispatcher.is_idle());
    }

    #[test]
    fn query_bypasses_queued_mutations() {
        let (mut dispatcher, mut engine, mut stats) = setup();
        let root = engine.derive_root().unwrap();

        // A queued revoke has not executed yet; the query sees the root
        // still valid.
        dispatcher.admit(
            &engine,
            Request::new(RequestTag(1), RequesterId(0), Command::Revoke { node: root }),
            &mut stats,
        );
        let answer = match dispatcher.admit(
            &engine,
            Request::new(RequestTag(2), RequesterId(1), Command::Query { node: root }),
            &mut stats,
        ) {
            Admit::Response(response) => response,
            other => panic!("query not answered at admit: {:?}", other),
        };
        assert_eq!(answer.body, ResponseBody::Validity(true));

        dispatcher.step(&mut engine, usize::MAX, &mut stats);
        assert_eq!(engine.query(root), Ok(false));
    }

    #[test]
    fn large_revoke_spans_ticks_and_blocks_later_mutations() {
        let (mut dispatcher, mut engine, mut stats) = setup();
        let root = engine.derive_root().unwrap();
        let mut parent = root;
        for _ in 0..20 {
            parent = engine.derive(parent, Derivation::Branch).unwrap();
        }

        dispatcher.admit(
            &engine,
            Request::new(RequestTag(1), RequesterId(0), Command::Revoke { node: root }),
            &mut stats,
        );
        dispatcher.admit(
            &engine,
            Request::new(
                RequestTag(2),
                RequesterId(0),
                Command::Derive {
                    parent: Some(root),
                    derivation: Derivation::Branch,
                },
            ),
            &mut stats,
        );

        // 21 nodes at 8 visits per tick: walk spans three ticks, the ack
        // lands on the completing one
        assert!(dispatcher.step(&mut engine, 8, &mut stats).is_empty());
        assert!(!dispatcher.is_idle());
        assert!(dispatcher.step(&mut engine, 8, &mut stats).is_empty());
        let ack = dispatcher.step(&mut engine, 8, &mut stats);
        assert_eq!(ack.len(), 1);
        assert_eq!(ack[0].tag, RequestTag(1));
        assert_eq!(ack[0].body, ResponseBody::Ack);
        assert_eq!(stats.nodes_revoked, 21);

        // Walk done; the queued derive now runs and sees a revoked parent
        let derive = dispatcher.step(&mut engine, 8, &mut stats);
        assert_eq!(derive[0].error_code(), Some(ErrorCode::InvalidParent));
        assert!(dispatcher.is_idle());
    }

    #[test]
    fn small_revoke_completes_in_its_first_tick() {
        let (mut dispatcher, mut engine, mut stats) = setup();
        let root = engine.derive_root().unwrap();

        let ack = run_one(
            &mut dispatcher,
            &mut engine,
            &mut stats,
            Request::new(RequestTag(1), RequesterId(0), Command::Revoke { node: root }),
        );
        assert_eq!(ack.body, ResponseBody::Ack);
        assert!(dispatcher.is_idle());
        assert_eq!(stats.revokes, 1);
        assert_eq!(stats.nodes_revoked, 1);
    }

    #[test]
    fn derive_and_rcupdate_round_trip() {
        let (mut dispatcher, mut engine, mut stats) = setup();

        let root = handle_of(&run_one(
            &mut dispatcher,
            &mut engine,
            &mut stats,
            derive_root_req(1),
        ));
        let response = run_one(
            &mut dispatcher,
            &mut engine,
            &mut stats,
            Request::new(
                RequestTag(2),
                RequesterId(0),
                Command::RcUpdate {
                    node: root,
                    delta: 2,
                },
            ),
        );
        assert_eq!(response.body, ResponseBody::RefCount(3));
        assert_eq!(stats.derives, 1);
        assert_eq!(stats.rc_updates, 1);
    }

    #[test]
    fn leaf_without_parent_is_malformed() {
        let (mut dispatcher, mut engine, mut stats) = setup();
        let response = run_one(
            &mut dispatcher,
            &mut engine,
            &mut stats,
            Request::new(
                RequestTag(1),
                RequesterId(0),
                Command::Derive {
                    parent: None,
                    derivation: Derivation::Leaf {
                        bounds: Bounds::new(0x2000, 64),
                    },
                },
            ),
        );
        assert_eq!(response.error_code(), Some(ErrorCode::MalformedRequest));
        assert_eq!(stats.malformed_requests, 1);
    }

    #[test]
    fn window_overlap_is_refused() {
        let (mut dispatcher, engine, mut stats) = setup();

        let inside = Request::new(
            RequestTag(1),
            RequesterId(0),
            Command::MemRead {
                addr: NODE_TABLE_BASE,
                size: 8,
            },
        );
        match dispatcher.admit(&engine, inside, &mut stats) {
            Admit::Response(response) => {
                assert_eq!(response.error_code(), Some(ErrorCode::MalformedRequest));
            }
            other => panic!("window access admitted: {:?}", other),
        }

        // Straddling the window's start from below is refused too
        let straddle = Request::new(
            RequestTag(2),
            RequesterId(0),
            Command::MemWrite {
                addr: NODE_TABLE_BASE - 4,
                data: vec![0; 8],
            },
        );
        assert!(matches!(
            dispatcher.admit(&engine, straddle, &mut stats),
            Admit::Response(_)
        ));
        assert_eq!(stats.malformed_requests, 2);
    }

    #[test]
    fn ordinary_memory_access_passes_through() {
        let (mut dispatcher, engine, mut stats) = setup();
        let request = Request::new(
            RequestTag(1),
            RequesterId(0),
            Command::MemRead {
                addr: 0x8000,
                size: 64,
            },
        );
        assert!(matches!(
            dispatcher.admit(&engine, request, &mut stats),
            Admit::PassThrough(_)
        ));
        assert_eq!(stats.malformed_requests, 0);
    }

    #[test]
    fn degenerate_access_sizes_are_malformed() {
        let (mut dispatcher, engine, mut stats) = setup();

        let zero = Request::new(
            RequestTag(1),
            RequesterId(0),
            Command::MemRead {
                addr: 0x8000,
                size: 0,
            },
        );
        assert!(matches!(
            dispatcher.admit(&engine, zero, &mut stats),
            Admit::Response(_)
        ));

        let oversize = Request::new(
            RequestTag(2),
            RequesterId(0),
            Command::MemRead {
                addr: 0x8000,
                size: MAX_ACCESS_SIZE + 1,
            },
        );
        assert!(matches!(
            dispatcher.admit(&engine, oversize, &mut stats),
            Admit::Response(_)
        ));
        assert_eq!(stats.malformed_requests, 2);
    }

    #[test]
    fn access_wrapping_the_address_space_is_refused() {
        let (mut dispatcher, engine, mut stats) = setup();

        let read = Request::new(
            RequestTag(1),
            RequesterId(0),
            Command::MemRead {
                addr: u64::MAX - 3,
                size: 8,
            },
        );
        match dispatcher.admit(&engine, read, &mut stats) {
            Admit::Response(response) => {
                assert_eq!(response.error_code(), Some(ErrorCode::MalformedRequest));
            }
            other => panic!("wrapping read admitted: {:?}", other),
        }

        let write = Request::new(
            RequestTag(2),
            RequesterId(0),
            Command::MemWrite {
                addr: u64::MAX - 3,
                data: vec![0; 8],
            },
        );
        assert!(matches!(
            dispatcher.admit(&engine, write, &mut stats),
            Admit::Response(_)
        ));
        assert_eq!(stats.malformed_requests, 2);

        // An access ending exactly at the top is still in range
        let flush = Request::new(
            RequestTag(3),
            RequesterId(0),
            Command::MemRead {
                addr: u64::MAX - 8,
                size: 8,
            },
        );
        assert!(matches!(
            dispatcher.admit(&engine, flush, &mut stats),
            Admit::PassThrough(_)
        ));
        assert_eq!(stats.malformed_requests, 2);
    }
}
