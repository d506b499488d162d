//! Handler hosting the local part of a distributed task.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread;
use std::time::Duration;

use fnv::FnvHashMap;
use serde_repr::*;

use spindle_core::{
    Machine, Node, NodeIndex, RemoteError, ResourceType, SharedData, Topology, Value,
};

use crate::client::{Client, ClientConfig};
use crate::msg::worker::{Reply, WorkerRequest};
use crate::msg::Procedure;
use crate::pool::{Pending, TubeRouter, WorkerPool};
use crate::server::{Call, Handler, ServerContext};
use crate::util::{lock, wait_for};
use crate::{Error, Result};

/// Time a single node gets to answer an info snapshot request.
const INFO_TIMEOUT: Duration = Duration::from_secs(1);

/// Lifecycle of a task on one machine.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum TaskState {
    New = 0,
    Submitted = 1,
    Initialized = 2,
    Running = 3,
    Finished = 4,
}

impl TaskState {
    pub fn to_str(&self) -> &'static str {
        match self {
            TaskState::New => "new",
            TaskState::Submitted => "submitted",
            TaskState::Initialized => "initialized",
            TaskState::Running => "running",
            TaskState::Finished => "finished",
        }
    }
}

impl FromStr for TaskState {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "new" => Ok(TaskState::New),
            "submitted" => Ok(TaskState::Submitted),
            "initialized" => Ok(TaskState::Initialized),
            "running" => Ok(TaskState::Running),
            "finished" => Ok(TaskState::Finished),
            _ => Err(Error::Other(format!("unknown task state: {}", s))),
        }
    }
}

/// Local node along with the worker slot it runs on.
#[derive(Debug, Copy, Clone)]
struct Placement {
    node: NodeIndex,
    slot: usize,
    finished: bool,
}

struct SyncState {
    status: TaskState,
    pool: Option<Arc<WorkerPool>>,
    placements: Vec<Placement>,
    /// Values delivered before the task was submitted here
    early: Vec<(NodeIndex, String, Value)>,
    results: BTreeMap<NodeIndex, Reply>,
    /// Last known info snapshots of finished nodes
    infos: BTreeMap<NodeIndex, Value>,
}

impl SyncState {
    fn expect(&self, expected: TaskState, method: &str) -> Result<()> {
        if self.status != expected {
            return Err(Error::InvalidState(format!(
                "can't {} a task that is {}",
                method,
                self.status.to_str()
            )));
        }
        Ok(())
    }

    fn pool(&self) -> Result<Arc<WorkerPool>> {
        self.pool
            .clone()
            .ok_or_else(|| Error::InvalidState("task was not submitted".to_string()))
    }

    fn slot_of(&self, node: NodeIndex) -> Option<usize> {
        self.placements
            .iter()
            .find(|p| p.node == node && !p.finished)
            .map(|p| p.slot)
    }
}

struct SyncInner {
    task_id: String,
    state: Mutex<SyncState>,
    cond: Condvar,
}

impl SyncInner {
    fn node_finished(&self, node: NodeIndex, reply: Reply) {
        let mut state = lock(&self.state);
        let pool = match state.pool.clone() {
            Some(pool) => pool,
            None => return,
        };
        let slot = match state.placements.iter_mut().find(|p| p.node == node) {
            Some(p) if !p.finished => {
                p.finished = true;
                p.slot
            }
            _ => return,
        };
        drop(state);

        // keep the final snapshot around for later info requests
        let info = pool
            .request(slot, |ticket| WorkerRequest::GetInfo {
                ticket,
                task_id: self.task_id.clone(),
            })
            .and_then(|pending| pending.wait_timeout(INFO_TIMEOUT));
        let _ = pool.send(
            slot,
            &WorkerRequest::DropTask {
                task_id: self.task_id.clone(),
            },
        );
        pool.release(&[slot]);

        match &reply {
            Ok(_) => debug!("task {}: node {} finished", self.task_id, node),
            Err(e) => warn!("task {}: node {} failed: {}", self.task_id, node, e),
        }
        let mut state = lock(&self.state);
        if let Ok(Ok(info)) = info {
            state.infos.insert(node, info);
        }
        state.results.insert(node, reply);
        if state.placements.iter().all(|p| p.finished) && state.status == TaskState::Running {
            state.status = TaskState::Finished;
            pool.unregister_router(&self.task_id);
            info!("task {}: all local nodes finished", self.task_id);
        }
        self.cond.notify_all();
    }
}

/// Hosts the nodes of a single task that were placed on this machine.
///
/// The handler is stored under the task id, so every machine taking part
/// in a task has a handler with the same id, and values relayed between
/// machines are addressed to it.
pub struct SyncHandler {
    inner: Arc<SyncInner>,
}

impl SyncHandler {
    pub fn new(task_id: &str) -> Self {
        Self {
            inner: Arc::new(SyncInner {
                task_id: task_id.to_string(),
                state: Mutex::new(SyncState {
                    status: TaskState::New,
                    pool: None,
                    placements: Vec::new(),
                    early: Vec::new(),
                    results: BTreeMap::new(),
                    infos: BTreeMap::new(),
                }),
                cond: Condvar::new(),
            }),
        }
    }

    pub fn task_id(&self) -> &str {
        &self.inner.task_id
    }

    pub fn status(&self) -> TaskState {
        lock(&self.inner.state).status
    }

    /// Claims workers for the local nodes and creates a task instance on
    /// each of them. Returns the claimed slots, in local node order.
    ///
    /// Arguments: task class, packed topology, packed list of all nodes,
    /// list of local node indices, resource type and packed optional
    /// shared data.
    fn submit(&self, ctx: &Arc<ServerContext>, call: &Call) -> Result<Value> {
        let class = call.arg(0)?.as_str()?.to_string();
        let topology: Topology = call.arg(1)?.unpack()?;
        let nodes: Vec<Node> = call.arg(2)?.unpack()?;
        let local = call
            .arg(3)?
            .as_list()?
            .iter()
            .map(|v| v.as_usize())
            .collect::<spindle_core::Result<Vec<_>>>()?;
        let resource_type: ResourceType = call.arg(4)?.as_str()?.parse()?;
        let shared: Option<SharedData> = match call.args.get(5) {
            Some(v) => v.unpack()?,
            None => None,
        };

        topology.validate(nodes.len())?;
        if let Some(&n) = local.iter().find(|&&n| n >= nodes.len()) {
            return Err(Error::CoreError(spindle_core::Error::InvalidTopology(
                format!("local node {} out of range ({} nodes)", n, nodes.len()),
            )));
        }
        lock(&self.inner.state).expect(TaskState::New, "submit")?;

        let pool = ctx.pool(resource_type)?.clone();
        let slots = pool.claim_idle_units(local.len());
        if slots.len() < local.len() {
            pool.release(&slots);
            return Err(Error::PoolExhausted {
                requested: local.len(),
                available: slots.len(),
            });
        }
        if let Err(e) = self.place(ctx, &pool, &class, topology, nodes, &local, &slots, shared) {
            pool.unregister_router(&self.inner.task_id);
            for &slot in &slots {
                let _ = pool.send(
                    slot,
                    &WorkerRequest::DropTask {
                        task_id: self.inner.task_id.clone(),
                    },
                );
            }
            pool.release(&slots);
            return Err(e);
        }
        info!(
            "task {}: submitted {} {} node(s) of {}",
            self.inner.task_id,
            local.len(),
            resource_type,
            class
        );
        Ok(Value::List(slots.into_iter().map(Value::from).collect()))
    }

    #[allow(clippy::too_many_arguments)]
    fn place(
        &self,
        ctx: &Arc<ServerContext>,
        pool: &Arc<WorkerPool>,
        class: &str,
        topology: Topology,
        nodes: Vec<Node>,
        local: &[NodeIndex],
        slots: &[usize],
        shared: Option<SharedData>,
    ) -> Result<()> {
        if let Some(shared) = &shared {
            pool.restart_workers(slots, Some(shared))?;
        }

        let placements = local
            .iter()
            .zip(slots)
            .map(|(&node, &slot)| Placement {
                node,
                slot,
                finished: false,
            })
            .collect::<Vec<_>>();
        let router = Router {
            task_id: self.inner.task_id.clone(),
            topology: topology.clone(),
            machines: nodes.iter().map(|n| n.machine.clone()).collect(),
            local: placements.iter().map(|p| (p.node, p.slot)).collect(),
            pool: Arc::downgrade(pool),
            relay: ctx.relay_config(),
            clients: Mutex::new(FnvHashMap::default()),
        };
        pool.register_router(&self.inner.task_id, Arc::new(router));

        let pending = placements
            .iter()
            .map(|p| {
                pool.request(p.slot, |ticket| WorkerRequest::CreateTask {
                    ticket,
                    task_id: self.inner.task_id.clone(),
                    class: class.to_string(),
                    node: p.node,
                    node_count: nodes.len(),
                    tubes: topology.tubes_for(p.node),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        wait_all(pending)?;

        let mut state = lock(&self.inner.state);
        state.status = TaskState::Submitted;
        state.pool = Some(pool.clone());
        state.placements = placements;
        for (node, tube, value) in std::mem::take(&mut state.early) {
            match state.slot_of(node) {
                Some(slot) => pool.send(
                    slot,
                    &WorkerRequest::Deliver {
                        task_id: self.inner.task_id.clone(),
                        tube,
                        value,
                    },
                )?,
                None => warn!(
                    "task {}: dropping value for node {} not hosted here",
                    self.inner.task_id, node
                ),
            }
        }
        Ok(())
    }

    /// Passes each local node its initialization arguments, given as a
    /// list of argument lists aligned with the local nodes.
    fn initialize(&self, call: &Call) -> Result<Value> {
        let (pool, placements) = {
            let state = lock(&self.inner.state);
            state.expect(TaskState::Submitted, "initialize")?;
            (state.pool()?, state.placements.clone())
        };
        let mut args = match call.args.get(0) {
            Some(list) => list
                .as_list()?
                .iter()
                .map(|a| a.clone().into_list())
                .collect::<spindle_core::Result<Vec<_>>>()?,
            None => Vec::new(),
        };
        args.resize(placements.len(), Vec::new());

        let pending = placements
            .iter()
            .zip(args)
            .map(|(p, args)| {
                pool.request(p.slot, |ticket| WorkerRequest::InitializeTask {
                    ticket,
                    task_id: self.inner.task_id.clone(),
                    args,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        wait_all(pending)?;
        lock(&self.inner.state).status = TaskState::Initialized;
        Ok(Value::Unit)
    }

    /// Starts all local nodes. Each node reports back on its own thread.
    fn start(&self) -> Result<Value> {
        let mut state = lock(&self.inner.state);
        state.expect(TaskState::Initialized, "start")?;
        let pool = state.pool()?;
        let mut started = Vec::with_capacity(state.placements.len());
        for p in &state.placements {
            let pending = pool.request(p.slot, |ticket| WorkerRequest::StartTask {
                ticket,
                task_id: self.inner.task_id.clone(),
            })?;
            started.push((p.node, pending));
        }
        state.status = TaskState::Running;
        drop(state);

        for (node, pending) in started {
            let inner = self.inner.clone();
            thread::Builder::new()
                .name(format!("task-{}-{}", inner.task_id, node))
                .spawn(move || {
                    let reply = pending.wait().unwrap_or_else(|e| {
                        Err(RemoteError::new(
                            e.to_string(),
                            format!("node {} of task {}: {}", node, inner.task_id, e),
                        ))
                    });
                    inner.node_finished(node, reply);
                })?;
        }
        Ok(Value::Unit)
    }

    /// Collects info snapshots of the local nodes without waiting for them
    /// to finish. Nodes that don't answer in time are left out.
    fn get_info(&self) -> Result<Value> {
        let (pool, placements, mut infos) = {
            let state = lock(&self.inner.state);
            (state.pool.clone(), state.placements.clone(), state.infos.clone())
        };
        if let Some(pool) = pool {
            let pending = placements
                .iter()
                .filter(|p| !p.finished)
                .filter_map(|p| {
                    pool.request(p.slot, |ticket| WorkerRequest::GetInfo {
                        ticket,
                        task_id: self.inner.task_id.clone(),
                    })
                    .ok()
                    .map(|pending| (p.node, pending))
                })
                .collect::<Vec<_>>();
            for (node, pending) in pending {
                if let Ok(Ok(info)) = pending.wait_timeout(INFO_TIMEOUT) {
                    infos.insert(node, info);
                }
            }
        }
        Ok(Value::pack(&infos.into_iter().collect::<Vec<_>>())?)
    }

    /// Blocks until all local nodes have finished, returning their
    /// outcomes.
    fn get_result(&self) -> Result<Value> {
        let state = lock(&self.inner.state);
        match state.status {
            TaskState::Running | TaskState::Finished => (),
            other => {
                return Err(Error::InvalidState(format!(
                    "can't get results of a task that is {}",
                    other.to_str()
                )))
            }
        }
        let state = wait_for(&self.inner.cond, state, |st| {
            st.status != TaskState::Running
        });
        let results = state
            .results
            .iter()
            .map(|(node, reply)| (*node, reply.clone()))
            .collect::<Vec<_>>();
        Ok(Value::pack(&results)?)
    }

    /// Enqueues a value relayed from another machine on one of the local
    /// nodes' incoming tubes.
    fn deliver(&self, call: &mut Call) -> Result<Value> {
        let node = call.arg(0)?.as_usize()?;
        let tube = call.arg(1)?.as_str()?.to_string();
        let value = call.take(2)?;
        let mut state = lock(&self.inner.state);
        if state.status == TaskState::New {
            state.early.push((node, tube, value));
            return Ok(Value::Unit);
        }
        match state.slot_of(node) {
            Some(slot) => {
                let pool = state.pool()?;
                drop(state);
                pool.send(
                    slot,
                    &WorkerRequest::Deliver {
                        task_id: self.inner.task_id.clone(),
                        tube,
                        value,
                    },
                )?;
            }
            None => debug!(
                "task {}: dropping value on {} for node {}",
                self.inner.task_id, tube, node
            ),
        }
        Ok(Value::Unit)
    }
}

impl Handler for SyncHandler {
    fn call(&self, ctx: &Arc<ServerContext>, method: &str, mut call: Call) -> Result<Value> {
        match method {
            "submit" => self.submit(ctx, &call),
            "initialize" => self.initialize(&call),
            "start" => self.start(),
            "get_info" => self.get_info(),
            "get_result" => self.get_result(),
            "deliver" => self.deliver(&mut call),
            "status" => Ok(Value::from(self.status().to_str())),
            _ => Err(Error::UnknownMethod(method.to_string())),
        }
    }

    /// Drops the task from its workers. Nodes blocked on a tube get an
    /// error, nodes that haven't started yet have their workers released.
    fn close(&self) {
        let state = lock(&self.inner.state);
        let pool = match state.pool.clone() {
            Some(pool) => pool,
            None => return,
        };
        let status = state.status;
        let unfinished = state
            .placements
            .iter()
            .filter(|p| !p.finished)
            .map(|p| p.slot)
            .collect::<Vec<_>>();
        drop(state);

        pool.unregister_router(&self.inner.task_id);
        for &slot in &unfinished {
            let _ = pool.send(
                slot,
                &WorkerRequest::DropTask {
                    task_id: self.inner.task_id.clone(),
                },
            );
        }
        // running nodes release their workers once they return
        if status != TaskState::Running {
            pool.release(&unfinished);
            let mut state = lock(&self.inner.state);
            state.placements.iter_mut().for_each(|p| p.finished = true);
        }
        debug!("task {}: closed", self.inner.task_id);
    }
}

/// Waits for every reply, failing with the first error.
fn wait_all(pending: Vec<Pending>) -> Result<()> {
    let mut first_error = None;
    for p in pending {
        let outcome = p.wait().and_then(|reply| reply.map_err(Error::Remote));
        if let Err(e) = outcome {
            first_error.get_or_insert(e);
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Moves values pushed by local nodes to their targets, either on this
/// machine or on another one.
struct Router {
    task_id: String,
    topology: Topology,
    /// Machine of every node, by index
    machines: Vec<Machine>,
    /// Slots of the nodes hosted on this machine
    local: FnvHashMap<NodeIndex, usize>,
    pool: Weak<WorkerPool>,
    relay: ClientConfig,
    clients: Mutex<FnvHashMap<Machine, Arc<Mutex<Client>>>>,
}

impl Router {
    fn relay(&self, target: NodeIndex, tube: &str, value: Value) -> Result<()> {
        let machine = self
            .machines
            .get(target)
            .ok_or_else(|| Error::Other(format!("no machine for node {}", target)))?;
        let client = lock(&self.clients)
            .entry(machine.clone())
            .or_insert_with(|| {
                Arc::new(Mutex::new(Client::persistent(
                    machine.clone(),
                    self.relay.clone(),
                )))
            })
            .clone();
        let procedure = Procedure::handler("sync", Some(&self.task_id), "deliver")
            .arg(target)
            .arg(tube)
            .arg(value);
        lock(&client).execute(procedure)?;
        Ok(())
    }
}

impl TubeRouter for Router {
    fn route(&self, source: NodeIndex, tube: &str, value: Value) {
        let target = match self.topology.target_of(source, tube) {
            Some(t) => t,
            None => {
                warn!(
                    "task {}: node {} has no outgoing tube {}",
                    self.task_id, source, tube
                );
                return;
            }
        };
        let result = match self.local.get(&target) {
            Some(&slot) => match self.pool.upgrade() {
                Some(pool) => pool.send(
                    slot,
                    &WorkerRequest::Deliver {
                        task_id: self.task_id.clone(),
                        tube: tube.to_string(),
                        value,
                    },
                ),
                None => Err(Error::ShuttingDown),
            },
            None => self.relay(target, tube, value),
        };
        if let Err(e) = result {
            warn!(
                "task {}: failed moving value from node {} to {} over {}: {}",
                self.task_id, source, target, tube, e
            );
        }
    }
}
