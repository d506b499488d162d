//! Protocol used by a worker pool and its worker processes.
//!
//! # Overview
//!
//! Each worker opens two connections to the pool's loopback listener and
//! introduces itself on both with a [`WorkerHello`]. The *side* channel is
//! opened first, followed by the *control* channel, and a worker counts as
//! ready once both are in place.
//!
//! The control channel carries [`WorkerRequest`]s from the pool to the
//! worker. Nothing is ever read back from it: everything the worker wants to
//! say travels as a [`WorkerEvent`] over the side channel. This keeps a long
//! running call from blocking tube relays and info snapshots, which go out on
//! the same side channel as soon as they're produced.
//!
//! Requests expecting an answer carry a ticket, echoed back in the matching
//! `Done` event.

use spindle_core::{NodeIndex, NodeTubes, RemoteError, Value};

use std::collections::BTreeMap;

/// Identifies a pending request within a pool.
pub type Ticket = u64;

/// Outcome of a single worker call.
pub type Reply = std::result::Result<Value, RemoteError>;

/// Role of a connection opened by a worker.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelKind {
    Control,
    Side,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerHello {
    pub slot: usize,
    /// Incremented every time the slot's worker is relaunched
    pub generation: u32,
    pub pid: u32,
    pub kind: ChannelKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WorkerRequest {
    /// Call a job function from the registry
    RunJob {
        ticket: Ticket,
        function: String,
        args: Vec<Value>,
        kwds: BTreeMap<String, Value>,
    },
    /// Instantiate a task for one node
    CreateTask {
        ticket: Ticket,
        task_id: String,
        class: String,
        node: NodeIndex,
        node_count: usize,
        tubes: NodeTubes,
    },
    InitializeTask {
        ticket: Ticket,
        task_id: String,
        args: Vec<Value>,
    },
    /// Run the task; the ticket resolves with the node's final result
    StartTask { ticket: Ticket, task_id: String },
    /// Read the latest info snapshot without waiting for the task
    GetInfo { ticket: Ticket, task_id: String },
    DropTask { task_id: String },
    /// Enqueue a value on one of the node's incoming tubes
    Deliver {
        task_id: String,
        tube: String,
        value: Value,
    },
    /// Finish the current call and exit
    Terminate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WorkerEvent {
    Done { ticket: Ticket, reply: Reply },
    /// Value pushed by a node into one of its outgoing tubes
    Push {
        task_id: String,
        source: NodeIndex,
        tube: String,
        value: Value,
    },
}
