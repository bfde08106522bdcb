//! Scriptable backing memory for controller tests
//!
//! # Purpose
//! A deliberately small memory device for the far side of the controller's
//! memory port. It is not a performance model: its job is to hand tests
//! the awkward behaviours real memory exhibits - latency, completions
//! arriving out of order, and requests that never complete at all - with a
//! knob for each.
//!
//! Reads of untouched memory return zeroes, like DRAM after clear.

use std::collections::HashMap;

use capstone_node_table::Bounds;
use capstone_protocol::{MemRequest, MemRequestKind, MemResponse, MemResponseBody};

/// Behaviour knobs
#[derive(Debug, Clone)]
pub struct MemModelConfig {
    /// Ticks between accepting a request and its answer being ready
    pub latency: u64,

    /// Deliver same-tick answers youngest-first instead of oldest-first
    pub reorder: bool,

    /// Ranges that swallow requests without ever answering
    pub black_holes: Vec<Bounds>,
}

impl Default for MemModelConfig {
    fn default() -> Self {
        Self {
            latency: 1,
            reorder: false,
            black_holes: Vec::new(),
        }
    }
}

#[derive(Debug)]
struct Pending {
    due: u64,
    response: MemResponse,
}

/// Sparse byte-addressed memory with configurable completion behaviour
#[derive(Debug, Default)]
pub struct MemoryModel {
    config: MemModelConfig,
    bytes: HashMap<u64, u8>,
    pending: Vec<Pending>,
    now: u64,
}

impl MemoryModel {
    pub fn new(config: MemModelConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// Accept one request; the answer surfaces from a later [`tick`]
    ///
    /// [`tick`]: MemoryModel::tick
    pub fn handle(&mut self, request: MemRequest) {
        let access = match &request.kind {
            MemRequestKind::Read { addr, size } => Bounds::new(*addr, *size as u64),
            MemRequestKind::Write { addr, data } => Bounds::new(*addr, data.len() as u64),
        };
        if self.config.black_holes.iter().any(|hole| hole.overlaps(&access)) {
            log::debug!("memory model swallowing {:?} at {:#x}", request.tag, access.base);
            return;
        }

        let body = match request.kind {
            MemRequestKind::Read { addr, size } => {
                // Bytes past the top of the address space read as zero;
                // the address must never wrap onto low memory
                let data = (0..size as u64)
                    .map(|i| {
                        addr.checked_add(i)
                            .and_then(|a| self.bytes.get(&a))
                            .copied()
                            .unwrap_or(0)
                    })
                    .collect();
                MemResponseBody::Data(data)
            }
            MemRequestKind::Write { addr, data } => {
                for (i, byte) in data.iter().enumerate() {
                    // Bytes past the top of the address space are dropped
                    if let Some(a) = addr.checked_add(i as u64) {
                        self.bytes.insert(a, *byte);
                    }
                }
                MemResponseBody::Written
            }
        };
        self.pending.push(Pending {
            due: self.now + self.config.latency,
            response: MemResponse {
                tag: request.tag,
                body,
            },
        });
    }

    /// Advance one tick and surface every answer that has come due
    pub fn tick(&mut self) -> Vec<MemResponse> {
        self.now += 1;
        let now = self.now;

        let (due, waiting): (Vec<_>, Vec<_>) =
            self.pending.drain(..).partition(|pending| pending.due <= now);
        self.pending = waiting;

        let mut due: Vec<MemResponse> = due.into_iter().map(|pending| pending.response).collect();
        if self.config.reorder {
            due.reverse();
        }
        due
    }

    /// Requests accepted and not yet answered
    #[inline]
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    /// Seed memory before a test
    pub fn preload(&mut self, addr: u64, data: &[u8]) {
        for (i, byte) in data.iter().enumerate() {
            self.bytes.insert(addr + i as u64, *byte);
        }
    }

    /// Inspect memory after a test
    pub fn read_back(&self, addr: u64, len: usize) -> Vec<u8> {
        (0..len as u64)
            .map(|i| self.bytes.get(&(addr + i)).copied().unwrap_or(0))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capstone_protocol::MemTag;

    fn read(tag: u64, addr: u64, size: u32) -> MemRequest {
        MemRequest {
            tag: MemTag(tag),
            kind: MemRequestKind::Read { addr, size },
        }
    }

    fn write(tag: u64, addr: u64, data: Vec<u8>) -> MemRequest {
        MemRequest {
            tag: MemTag(tag),
            kind: MemRequestKind::Write { addr, data },
        }
    }

    #[test]
    fn write_then_read_round_trips() {
        let mut model = MemoryModel::new(MemModelConfig::default());
        model.handle(write(1, 0x100, vec![1, 2, 3]));
        assert_eq!(model.tick().len(), 1);

        model.handle(read(2, 0x100, 4));
        let responses = model.tick();
        assert_eq!(responses[0].body, MemResponseBody::Data(vec![1, 2, 3, 0]));
    }

    #[test]
    fn latency_delays_answers() {
        let mut model = MemoryModel::new(MemModelConfig {
            latency: 3,
            ..MemModelConfig::default()
        });
        model.handle(read(1, 0, 8));
        assert!(model.tick().is_empty());
        assert!(model.tick().is_empty());
        assert_eq!(model.tick().len(), 1);
        assert_eq!(model.in_flight(), 0);
    }

    #[test]
    fn reorder_delivers_youngest_first() {
        let mut model = MemoryModel::new(MemModelConfig {
            reorder: true,
            ..MemModelConfig::default()
        });
        model.handle(read(1, 0, 8));
        model.handle(read(2, 8, 8));
        let responses = model.tick();
        assert_eq!(responses[0].tag, MemTag(2));
        assert_eq!(responses[1].tag, MemTag(1));
    }

    #[test]
    fn black_hole_swallows_requests() {
        let mut model = MemoryModel::new(MemModelConfig {
            black_holes: vec![Bounds::new(0x1000, 0x100)],
            ..MemModelConfig::default()
        });
        model.handle(read(1, 0x1080, 8));
        model.handle(read(2, 0x2000, 8));
        let responses = model.tick();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].tag, MemTag(2));
        assert_eq!(model.in_flight(), 0);
    }

    #[test]
    fn preload_and_read_back_inspect_the_store() {
        let mut model = MemoryModel::new(MemModelConfig::default());
        model.preload(0x40, &[0xaa, 0xbb]);
        model.handle(read(1, 0x40, 2));
        assert_eq!(
            model.tick()[0].body,
            MemResponseBody::Data(vec![0xaa, 0xbb])
        );
        assert_eq!(model.read_back(0x40, 3), vec![0xaa, 0xbb, 0]);
    }

    #[test]
    fn accesses_at_the_address_space_top_do_not_wrap() {
        let mut model = MemoryModel::new(MemModelConfig::default());
        model.preload(0, &[0xaa, 0xbb]);

        model.handle(write(1, u64::MAX - 1, vec![1, 2, 3, 4]));
        assert_eq!(model.tick().len(), 1);
        // The in-range prefix lands; nothing spills onto low memory
        assert_eq!(model.read_back(0, 2), vec![0xaa, 0xbb]);

        model.handle(read(2, u64::MAX - 1, 4));
        let responses = model.tick();
        assert_eq!(responses[0].body, MemResponseBody::Data(vec![1, 2, 0, 0]));
    }
}
