//! Typed ports connecting the controller to its neighbors
//!
//! Each port is one end of a pair of bounded channels: the controller end
//! and the harness end are created together and handed out by the wiring
//! layer, mirroring how the modeled hardware is connected to a CPU above
//! and a memory system below.
//!
//! ```text
//!   CPU harness                      controller                    memory
//!  +----------+   Request    +----------------------+   MemRequest  +---+
//!  | CpuLink  | -----------> | CpuPort      MemPort | ------------> |Mem|
//!  |          | <----------- |                      | <------------ |Lnk|
//!  +----------+   Response   +----------------------+  MemResponse  +---+
//! ```
//!
//! All operations are non-blocking; the controller is stepped by an
//! external clock and must never stall inside a tick. A full channel simply
//! leaves traffic queued on the sending side until a later tick.

use capstone_protocol::{MemRequest, MemResponse, Request, Response};
use crossbeam::channel::{bounded, Receiver, Sender};

/// CPU-facing end owned by the controller
#[derive(Debug)]
pub struct CpuPort {
    requests: Receiver<Request>,
    responses: Sender<Response>,
}

/// CPU-side harness end
#[derive(Debug, Clone)]
pub struct CpuLink {
    requests: Sender<Request>,
    responses: Receiver<Response>,
}

/// Create a connected CPU port pair
pub fn cpu_channel(depth: usize) -> (CpuPort, CpuLink) {
    let (req_tx, req_rx) = bounded(depth);
    let (resp_tx, resp_rx) = bounded(depth);
    (
        CpuPort {
            requests: req_rx,
            responses: resp_tx,
        },
        CpuLink {
            requests: req_tx,
            responses: resp_rx,
        },
    )
}

impl CpuPort {
    /// Take the next pending request, if any
    pub fn try_recv(&self) -> Option<Request> {
        self.requests.try_recv().ok()
    }

    /// Try to emit a response; hands it back when the link is full or gone
    pub fn try_send(&self, response: Response) -> Result<(), Response> {
        self.responses.try_send(response).map_err(|e| e.into_inner())
    }
}

impl CpuLink {
    /// Submit a request; hands it back when the controller's inbox is full
    pub fn try_send(&self, request: Request) -> Result<(), Request> {
        self.requests.try_send(request).map_err(|e| e.into_inner())
    }

    /// Take the next response, if any
    pub fn try_recv(&self) -> Option<Response> {
        self.responses.try_recv().ok()
    }

    /// Take every response currently pending
    pub fn drain(&self) -> Vec<Response> {
        let mut out = Vec::new();
        while let Some(response) = self.try_recv() {
            out.push(response);
        }
        out
    }
}

/// Memory-facing end owned by the controller
#[derive(Debug)]
pub struct MemPort {
    requests: Sender<MemRequest>,
    responses: Receiver<MemResponse>,
}

/// Memory-side harness end
#[derive(Debug, Clone)]
pub struct MemLink {
    requests: Receiver<MemRequest>,
    responses: Sender<MemResponse>,
}

/// Create a connected memory port pair
pub fn mem_channel(depth: usize) -> (MemPort, MemLink) {
    let (req_tx, req_rx) = bounded(depth);
    let (resp_tx, resp_rx) = bounded(depth);
    (
        MemPort {
            requests: req_tx,
            responses: resp_rx,
        },
        MemLink {
            requests: req_rx,
            responses: resp_tx,
        },
    )
}

impl MemPort {
    /// Try to issue a request downstream; hands it back when the link is
    /// full or gone
    pub fn try_send(&self, request: MemRequest) -> Result<(), MemRequest> {
        self.requests.try_send(request).map_err(|e| e.into_inner())
    }

    /// Take the next completion, if any
    pub fn try_recv(&self) -> Option<MemResponse> {
        self.responses.try_recv().ok()
    }
}

impl MemLink {
    /// Take the next downstream request, if any
    pub fn try_recv(&self) -> Option<MemRequest> {
        self.requests.try_recv().ok()
    }

    /// Take every downstream request currently pending
    pub fn drain(&self) -> Vec<MemRequest> {
        let mut out = Vec::new();
        while let Some(request) = self.try_recv() {
            out.push(request);
        }
        out
    }

    /// Deliver a completion; hands it back when the controller's inbox is
    /// full or gone
    pub fn try_send(&self, response: MemResponse) -> Result<(), MemResponse> {
        self.responses.try_send(response).map_err(|e| e.into_inner())
    }
}
