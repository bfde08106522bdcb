//! Controller composition and the tick pipeline
//!
//! # Purpose
//! [`NodeController`] owns every moving part and advances them in a fixed
//! order once per simulated cycle:
//!
//! ```text
//!   CPU link ==> ingest ==> dispatcher ==> engine ==> node table
//!                  |            |
//!                  |            +--> responses
//!                  v                      |
//!             pass-through --> mem outbox |
//!                  ^                      v
//!   mem link ======+================ CPU outbox ==> CPU link
//! ```
//!
//! ## Tick order
//! Each [`NodeController::tick`] runs: ingest CPU requests, run the
//! mutation lane, ingest memory completions, expire overdue pass-through
//! requests, release completions in FIFO order, flush both outboxes.
//! Memory completions are ingested before expiry, so an answer landing on
//! its deadline tick still counts as completed. Outboxes absorb port
//! backpressure: what a full channel refuses stays queued for the next
//! tick, in order.

use std::collections::VecDeque;

use capstone_node_table::{Bounds, NodeHandle, RevocationEngine, StoreStats};
use capstone_protocol::wire::{self, node_table_window};
use capstone_protocol::{
    Command, ErrorCode, MemRequest, MemRequestKind, Request, Response,
};

use crate::config::NodeControllerConfig;
use crate::dispatcher::{Admit, Dispatcher};
use crate::passthrough::{Completion, PassThrough};
use crate::ports::{cpu_channel, mem_channel, CpuLink, CpuPort, MemLink, MemPort};
use crate::stats::ControllerStats;
use crate::tracking::{CapLoc, CapTracker, ObjectRegistry, TrackingError};

/// The node controller device
///
/// Single-threaded by design: one instance owns the node table outright,
/// and everything it does happens inside [`NodeController::tick`] or a
/// direct host call. The CPU and memory sides talk to it over the channel
/// links returned by [`NodeController::connect`].
pub struct NodeController {
    config: NodeControllerConfig,
    engine: RevocationEngine,
    dispatcher: Dispatcher,
    passthrough: PassThrough,
    caps: CapTracker,
    objects: ObjectRegistry,
    stats: ControllerStats,
    cpu: CpuPort,
    mem: MemPort,
    now: u64,
    cpu_outbox: VecDeque<Response>,
    mem_outbox: VecDeque<MemRequest>,
}

impl NodeController {
    /// Build a controller and the links its neighbours drive
    pub fn connect(config: NodeControllerConfig) -> (Self, CpuLink, MemLink) {
        let (cpu, cpu_link) = cpu_channel(config.port_depth);
        let (mem, mem_link) = mem_channel(config.port_depth);
        let controller = Self {
            engine: RevocationEngine::new(config.node_capacity),
            dispatcher: Dispatcher::new(node_table_window(config.node_capacity)),
            passthrough: PassThrough::new(),
            caps: CapTracker::new(),
            objects: ObjectRegistry::new(),
            stats: ControllerStats::default(),
            cpu,
            mem,
            now: 0,
            cpu_outbox: VecDeque::new(),
            mem_outbox: VecDeque::new(),
            config,
        };
        log::info!(
            "node controller up: {} slots, revoke budget {}, mem timeout {:?}",
            controller.config.node_capacity,
            controller.config.revoke_budget,
            controller.config.mem_timeout
        );
        (controller, cpu_link, mem_link)
    }

    /// Advance one cycle
    pub fn tick(&mut self) {
        self.now += 1;

        while let Some(request) = self.cpu.try_recv() {
            self.admit(request);
        }

        let completed =
            self.dispatcher
                .step(&mut self.engine, self.config.revoke_budget, &mut self.stats);
        self.cpu_outbox.extend(completed);

        while let Some(response) = self.mem.try_recv() {
            if self.passthrough.on_response(response) == Completion::Late {
                self.stats.passthrough_late_dropped += 1;
            }
        }

        self.stats.passthrough_timed_out += self.passthrough.expire(self.now) as u64;

        let released = self.passthrough.release();
        self.stats.passthrough_completed +=
            released.iter().filter(|r| !r.is_error()).count() as u64;
        self.cpu_outbox.extend(released);

        self.flush();
    }

    /// Feed one raw frame in, as if it had arrived over the CPU link
    ///
    /// Undecodable frames are answered with a `MalformedRequest` error when
    /// the header survives, and dropped silently when it does not.
    pub fn submit_frame(&mut self, frame: &[u8]) {
        match wire::decode_request(frame) {
            Ok(request) => self.admit(request),
            Err(err) => {
                self.stats.malformed_requests += 1;
                log::warn!("rejected raw frame: {}", err);
                if let Some((tag, requester)) = wire::peek_header(frame) {
                    self.cpu_outbox.push_back(Response::error(
                        tag,
                        requester,
                        ErrorCode::MalformedRequest,
                    ));
                }
            }
        }
    }

    /// True when nothing is queued, walking, in flight or unflushed
    ///
    /// Requests still sitting unread on the CPU link are not visible here;
    /// tick at least once after the last send before trusting this.
    pub fn idle(&self) -> bool {
        self.dispatcher.is_idle()
            && self.passthrough.outstanding() == 0
            && self.cpu_outbox.is_empty()
            && self.mem_outbox.is_empty()
    }

    #[inline]
    pub fn now(&self) -> u64 {
        self.now
    }

    #[inline]
    pub fn stats(&self) -> ControllerStats {
        self.stats
    }

    #[inline]
    pub fn store_stats(&self) -> StoreStats {
        self.engine.store().stats()
    }

    #[inline]
    pub fn config(&self) -> &NodeControllerConfig {
        &self.config
    }

    /// Engine access for host-side inspection; mutations go through the
    /// request path, never through this.
    #[inline]
    pub fn engine(&self) -> &RevocationEngine {
        &self.engine
    }

    // Host-side bookkeeping, driven directly by the simulated CPU rather
    // than over the wire.

    /// Pin a capability location to a node; returns the displaced handle
    pub fn track_cap(&mut self, loc: CapLoc, handle: NodeHandle) -> Option<NodeHandle> {
        self.caps.track(loc, handle)
    }

    pub fn untrack_cap(&mut self, loc: CapLoc) -> Option<NodeHandle> {
        self.caps.untrack(loc)
    }

    pub fn lookup_cap(&self, loc: CapLoc) -> Option<NodeHandle> {
        self.caps.lookup(loc)
    }

    pub fn alloc_object(&mut self, bounds: Bounds) -> Result<(), TrackingError> {
        self.objects.alloc_object(bounds)
    }

    pub fn free_object(&mut self, addr: u64) -> Result<Bounds, TrackingError> {
        self.objects.free_object(addr)
    }

    pub fn lookup_addr(&self, addr: u64) -> Option<Bounds> {
        self.objects.lookup_addr(addr)
    }

    /// Route one admitted request to its lane
    fn admit(&mut self, request: Request) {
        match self.dispatcher.admit(&self.engine, request, &mut self.stats) {
            Admit::Queued => {}
            Admit::Response(response) => self.cpu_outbox.push_back(response),
            Admit::PassThrough(request) => {
                let Request {
                    tag,
                    requester,
                    command,
                } = request;
                let kind = match command {
                    Command::MemRead { addr, size } => MemRequestKind::Read { addr, size },
                    Command::MemWrite { addr, data } => MemRequestKind::Write { addr, data },
                    other => {
                        // admit() forwards only memory accesses
                        log::error!("dropping misrouted command {:?}", other);
                        return;
                    }
                };
                let downstream = self.passthrough.submit(
                    tag,
                    requester,
                    kind,
                    self.now,
                    self.config.mem_timeout,
                );
                self.stats.passthrough_issued += 1;
                self.mem_outbox.push_back(downstream);
            }
        }
    }

    /// Push queued traffic out while the channels take it
    fn flush(&mut self) {
        while let Some(request) = self.mem_outbox.pop_front() {
            match self.mem.try_send(request) {
                Ok(()) => {}
                Err(request) => {
                    self.mem_outbox.push_front(request);
                    break;
                }
            }
        }
        while let Some(response) = self.cpu_outbox.pop_front() {
            match self.cpu.try_send(response) {
                Ok(()) => self.stats.responses_sent += 1,
                Err(response) => {
                    self.cpu_outbox.push_front(response);
                    break;
                }
            }
        }
    }
}

impl core::fmt::Debug for NodeController {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("NodeController")
            .field("now", &self.now)
            .field("live_nodes", &self.engine.store().len())
            .field("backlog", &self.dispatcher.backlog())
            .field("outstanding_mem", &self.passthrough.outstanding())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capstone_node_table::Derivation;
    use capstone_protocol::{
        MemResponse, MemResponseBody, RequestTag, RequesterId, ResponseBody,
    };

    fn small_config() -> NodeControllerConfig {
        NodeControllerConfig::with_capacity(64)
    }

    fn derive_root(tag: u64) -> Request {
        Request::new(
            RequestTag(tag),
            RequesterId(0),
            Command::Derive {
                parent: None,
                derivation: Derivation::Branch,
            },
        )
    }

    #[test]
    fn derive_completes_within_one_tick() {
        let (mut controller, cpu, _mem) = NodeController::connect(small_config());

        cpu.try_send(derive_root(7)).unwrap();
        controller.tick();

        let response = cpu.try_recv().expect("response should be flushed");
        assert_eq!(response.tag, RequestTag(7));
        assert!(matches!(response.body, ResponseBody::Handle(_)));
        assert!(controller.idle());
        assert_eq!(controller.stats().derives, 1);
        assert_eq!(controller.stats().responses_sent, 1);
    }

    #[test]
    fn passthrough_round_trip_via_links() {
        let (mut controller, cpu, mem) = NodeController::connect(small_config());

        cpu.try_send(Request::new(
            RequestTag(1),
            RequesterId(2),
            Command::MemRead {
                addr: 0x4000,
                size: 8,
            },
        ))
        .unwrap();
        controller.tick();

        let downstream = mem.try_recv().expect("request should be forwarded");
        mem.try_send(MemResponse {
            tag: downstream.tag,
            body: MemResponseBody::Data(vec![0x5a; 8]),
        })
        .unwrap();
        controller.tick();

        let response = cpu.try_recv().expect("completion should be relayed");
        assert_eq!(response.tag, RequestTag(1));
        assert_eq!(response.body, ResponseBody::Data(vec![0x5a; 8]));
        assert_eq!(controller.stats().passthrough_completed, 1);
        assert!(controller.idle());
    }

    #[test]
    fn unanswered_read_times_out() {
        let config = small_config().mem_timeout(2);
        let (mut controller, cpu, mem) = NodeController::connect(config);

        cpu.try_send(Request::new(
            RequestTag(1),
            RequesterId(0),
            Command::MemRead {
                addr: 0x4000,
                size: 8,
            },
        ))
        .unwrap();
        // Issued at tick 1, deadline at tick 3
        controller.tick();
        assert!(mem.try_recv().is_some());
        controller.tick();
        assert!(cpu.try_recv().is_none());
        controller.tick();

        let response = cpu.try_recv().expect("timeout should be reported");
        assert_eq!(response.error_code(), Some(ErrorCode::MemoryTimeout));
        assert_eq!(controller.stats().passthrough_timed_out, 1);
        assert!(controller.idle());
    }

    #[test]
    fn raw_frames_reach_the_same_path() {
        let (mut controller, cpu, _mem) = NodeController::connect(small_config());

        let frame = wire::encode_request(&derive_root(9));
        controller.submit_frame(&frame);
        controller.tick();
        let response = cpu.try_recv().expect("decoded frame should execute");
        assert!(matches!(response.body, ResponseBody::Handle(_)));

        // Garbage with an intact header is answered, not ignored
        let mut bad = frame.clone();
        bad.truncate(17);
        controller.submit_frame(&bad);
        controller.tick();
        let rejection = cpu.try_recv().expect("malformed frame should be answered");
        assert_eq!(rejection.tag, RequestTag(9));
        assert_eq!(rejection.error_code(), Some(ErrorCode::MalformedRequest));
        assert_eq!(controller.stats().malformed_requests, 1);
    }

    #[test]
    fn host_bookkeeping_round_trip() {
        let (mut controller, _cpu, _mem) = NodeController::connect(small_config());

        controller.alloc_object(Bounds::new(0x9000, 0x100)).unwrap();
        assert_eq!(
            controller.lookup_addr(0x9080),
            Some(Bounds::new(0x9000, 0x100))
        );

        let loc = CapLoc::Reg { hart: 0, reg: 5 };
        assert_eq!(controller.track_cap(loc, NodeHandle::new(3, 0)), None);
        assert_eq!(controller.lookup_cap(loc), Some(NodeHandle::new(3, 0)));
        assert_eq!(controller.untrack_cap(loc), Some(NodeHandle::new(3, 0)));
        assert_eq!(controller.free_object(0x9000).unwrap(), Bounds::new(0x9000, 0x100));
    }
}
