//! Task interface implemented by user code and hosted by worker processes.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::shared::SharedData;
use crate::topology::{NodeIndex, NodeTubes};
use crate::value::Value;

/// Transport backing the tubes of a single node.
///
/// Implemented by the worker runtime. Tube names passed in here were already
/// checked against the node's tube set by [`TaskContext`].
pub trait TubeIo: Send {
    /// Sends a value down an outgoing tube. Never blocks on the receiver.
    fn push(&mut self, tube: &str, value: Value) -> Result<()>;
    /// Receives the next value from an incoming tube, blocking until one
    /// is available.
    fn pop(&mut self, tube: &str) -> Result<Value>;
    /// Replaces the node's info snapshot.
    fn set_info(&mut self, info: Value) -> Result<()>;
}

/// View of the running task available to a single node.
pub struct TaskContext {
    index: NodeIndex,
    node_count: usize,
    tubes: NodeTubes,
    shared: Arc<SharedData>,
    io: Box<dyn TubeIo>,
}

impl TaskContext {
    pub fn new(
        index: NodeIndex,
        node_count: usize,
        tubes: NodeTubes,
        shared: Arc<SharedData>,
        io: Box<dyn TubeIo>,
    ) -> Self {
        Self {
            index,
            node_count,
            tubes,
            shared,
            io,
        }
    }

    /// Index of this node within the task.
    pub fn index(&self) -> NodeIndex {
        self.index
    }

    pub fn node_count(&self) -> usize {
        self.node_count
    }

    pub fn push(&mut self, tube: &str, value: impl Into<Value>) -> Result<()> {
        if !self.tubes.outgoing.contains_key(tube) {
            return Err(Error::NoTube(format!(
                "node {} has no outgoing tube \"{}\"",
                self.index, tube
            )));
        }
        self.io.push(tube, value.into())
    }

    pub fn pop(&mut self, tube: &str) -> Result<Value> {
        if !self.tubes.incoming.contains_key(tube) {
            return Err(Error::NoTube(format!(
                "node {} has no incoming tube \"{}\"",
                self.index, tube
            )));
        }
        self.io.pop(tube)
    }

    /// Publishes a snapshot readable with `get_info` while the task runs.
    pub fn set_info(&mut self, info: impl Into<Value>) -> Result<()> {
        self.io.set_info(info.into())
    }

    /// Read-only data shared by all nodes on this machine.
    pub fn shared(&self) -> &SharedData {
        &self.shared
    }

    pub fn incoming(&self) -> Vec<&str> {
        self.tubes.incoming.keys().map(|s| s.as_str()).collect()
    }

    pub fn outgoing(&self) -> Vec<&str> {
        self.tubes.outgoing.keys().map(|s| s.as_str()).collect()
    }
}

/// Stateful, topology-aware unit of work.
///
/// One instance is created per node, inside the worker process bound to
/// that node. `initialize` always runs to completion on every node before
/// `start` is called on any of them.
pub trait Task: Send {
    fn initialize(&mut self, _ctx: &mut TaskContext, _args: Vec<Value>) -> Result<()> {
        Ok(())
    }

    /// Runs the node to completion, returning its result.
    fn start(&mut self, ctx: &mut TaskContext) -> Result<Value>;
}
