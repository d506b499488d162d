//! Worker process runtime.
//!
//! A worker is launched by a [`WorkerPool`] and connects back to it over
//! loopback. It runs two threads:
//!
//! - the *control* thread reads requests coming from the pool. Tube
//!   deliveries and info snapshot reads are served right away, everything
//!   else is queued for the executor.
//! - the *executor* thread hosts the task instances and runs the queued
//!   calls one at a time.
//!
//! Both send their output over the shared side channel.
//!
//! [`WorkerPool`]: crate::WorkerPool

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use fnv::{FnvHashMap, FnvHashSet};

use spindle_core::{
    JobContext, NodeIndex, Registry, RemoteError, ResourceType, SharedData, Task, TaskContext,
    TubeIo, Value,
};

use crate::msg::worker::{
    ChannelKind, Reply, Ticket, WorkerEvent, WorkerHello, WorkerRequest,
};
use crate::socket::{Channel, Secret, SocketConfig};
use crate::util::lock;
use crate::{Error, Result};

pub const ENV_POOL: &str = "SPINDLE_WORKER_POOL";
pub const ENV_SLOT: &str = "SPINDLE_WORKER_SLOT";
pub const ENV_GENERATION: &str = "SPINDLE_WORKER_GENERATION";
pub const ENV_SECRET: &str = "SPINDLE_WORKER_SECRET";
pub const ENV_RESOURCE: &str = "SPINDLE_WORKER_RESOURCE";
pub const ENV_SHARED: &str = "SPINDLE_WORKER_SHARED";
pub const ENV_ENCODING: &str = "SPINDLE_WORKER_ENCODING";
pub const ENV_COMPRESSION: &str = "SPINDLE_WORKER_COMPRESSION";

/// Everything a worker needs to know to connect back to its pool.
#[derive(Debug, Clone)]
pub struct WorkerEnv {
    /// Address of the pool listener
    pub pool: String,
    pub slot: usize,
    pub generation: u32,
    pub secret: String,
    pub resource_type: ResourceType,
    /// File holding shared data to load before serving
    pub shared: Option<PathBuf>,
    /// Must match the socket config of the pool, only encoding and
    /// compression are passed on to worker processes
    pub socket: SocketConfig,
}

impl WorkerEnv {
    /// Reads the worker environment of the current process, if there is
    /// one.
    pub fn from_env() -> Option<Result<Self>> {
        let pool = std::env::var(ENV_POOL).ok()?;
        Some(Self::read_rest(pool))
    }

    fn read_rest(pool: String) -> Result<Self> {
        let var = |name: &str| {
            std::env::var(name).map_err(|_| Error::Other(format!("missing env var: {}", name)))
        };
        Ok(Self {
            pool,
            slot: var(ENV_SLOT)?.parse()?,
            generation: var(ENV_GENERATION)?.parse()?,
            secret: var(ENV_SECRET)?,
            resource_type: var(ENV_RESOURCE)?.parse()?,
            shared: std::env::var(ENV_SHARED).ok().map(PathBuf::from),
            socket: SocketConfig {
                encoding: var(ENV_ENCODING)?.parse()?,
                compression: var(ENV_COMPRESSION)?.parse()?,
                ..SocketConfig::default()
            },
        })
    }

    pub(crate) fn vars(&self) -> Vec<(&'static str, String)> {
        let mut vars = vec![
            (ENV_POOL, self.pool.clone()),
            (ENV_SLOT, self.slot.to_string()),
            (ENV_GENERATION, self.generation.to_string()),
            (ENV_SECRET, self.secret.clone()),
            (ENV_RESOURCE, self.resource_type.to_string()),
            (ENV_ENCODING, self.socket.encoding.to_string()),
            (ENV_COMPRESSION, self.socket.compression.to_string()),
        ];
        if let Some(shared) = &self.shared {
            vars.push((ENV_SHARED, shared.to_string_lossy().to_string()));
        }
        vars
    }
}

/// Turns the current process into a worker if it was launched as one.
///
/// Returns immediately when the worker environment is not present.
/// Otherwise serves the pool and exits the process once done.
pub fn run_if_worker(registry: &Registry) {
    let env = match WorkerEnv::from_env() {
        Some(Ok(env)) => env,
        Some(Err(e)) => {
            error!("invalid worker environment: {}", e);
            std::process::exit(2);
        }
        None => return,
    };
    let code = match serve(env, registry.clone()) {
        Ok(()) => 0,
        Err(e) => {
            error!("worker failed: {}", e);
            1
        }
    };
    std::process::exit(code);
}

/// Connects to the pool and serves requests until told to terminate or
/// until the pool goes away.
pub fn serve(env: WorkerEnv, registry: Registry) -> Result<()> {
    let shared = Arc::new(match &env.shared {
        Some(path) => SharedData::from_file(path)?,
        None => SharedData::new(),
    });
    let secret = Secret::new(&env.secret);
    let config = env.socket;
    let hello = |kind| WorkerHello {
        slot: env.slot,
        generation: env.generation,
        pid: std::process::id(),
        kind,
    };

    let mut side = Channel::connect(&env.pool, &secret, None, config)?;
    side.send(&hello(ChannelKind::Side))?;
    let mut control = Channel::connect(&env.pool, &secret, None, config)?;
    control.send(&hello(ChannelKind::Control))?;
    debug!(
        "worker {}:{} (generation {}) connected to {}",
        env.resource_type, env.slot, env.generation, env.pool
    );

    let side = Arc::new(Mutex::new(side));
    let mailboxes = Arc::new(Mailboxes::default());
    let infos: Arc<Mutex<FnvHashMap<String, Value>>> = Default::default();

    let (sender, receiver) = crossbeam_channel::unbounded();
    let executor = Executor {
        registry,
        shared,
        side: side.clone(),
        mailboxes: mailboxes.clone(),
        infos: infos.clone(),
        tasks: FnvHashMap::default(),
    };
    let executor_handle = thread::Builder::new()
        .name(format!("executor-{}-{}", env.resource_type, env.slot))
        .spawn(move || executor.run(receiver))?;

    loop {
        let request: WorkerRequest = match control.recv() {
            Ok(r) => r,
            Err(e) => {
                debug!("worker {}: control channel closed: {}", env.slot, e);
                break;
            }
        };
        match request {
            WorkerRequest::Deliver {
                task_id,
                tube,
                value,
            } => mailboxes.push(&task_id, &tube, value),
            WorkerRequest::GetInfo { ticket, task_id } => {
                let info = lock(&infos).get(&task_id).cloned().unwrap_or_default();
                send_event(
                    &side,
                    &WorkerEvent::Done {
                        ticket,
                        reply: Ok(info),
                    },
                )?;
            }
            WorkerRequest::DropTask { task_id } => {
                mailboxes.drop_task(&task_id);
                lock(&infos).remove(&task_id);
                let _ = sender.send(WorkerRequest::DropTask { task_id });
            }
            WorkerRequest::Terminate => {
                debug!("worker {}: terminating", env.slot);
                break;
            }
            other => {
                if sender.send(other).is_err() {
                    warn!("worker {}: executor is gone", env.slot);
                    break;
                }
            }
        }
    }

    // unblock any node still waiting on a tube
    mailboxes.close();
    drop(sender);
    if executor_handle.join().is_err() {
        error!("worker {}: executor thread panicked", env.slot);
    }
    lock(&side).shutdown();
    control.shutdown();
    Ok(())
}

fn send_event(side: &Mutex<Channel>, event: &WorkerEvent) -> Result<()> {
    lock(side).send(event)
}

/// Runs a call, turning errors and panics into a remote error.
fn guarded<F>(context: &str, f: F) -> Reply
where
    F: FnOnce() -> spindle_core::Result<Value>,
{
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(RemoteError::capture(&e, context)),
        Err(payload) => Err(RemoteError::from_panic(payload, context)),
    }
}

struct HostedTask {
    task: Box<dyn Task>,
    ctx: TaskContext,
}

struct Executor {
    registry: Registry,
    shared: Arc<SharedData>,
    side: Arc<Mutex<Channel>>,
    mailboxes: Arc<Mailboxes>,
    infos: Arc<Mutex<FnvHashMap<String, Value>>>,
    tasks: FnvHashMap<String, HostedTask>,
}

impl Executor {
    fn run(mut self, receiver: crossbeam_channel::Receiver<WorkerRequest>) {
        for request in receiver.iter() {
            if let Err(e) = self.handle(request) {
                // side channel is gone, nobody left to report to
                debug!("executor stopping: {}", e);
                break;
            }
        }
    }

    fn reply(&self, ticket: Ticket, reply: Reply) -> Result<()> {
        send_event(&self.side, &WorkerEvent::Done { ticket, reply })
    }

    fn handle(&mut self, request: WorkerRequest) -> Result<()> {
        match request {
            WorkerRequest::RunJob {
                ticket,
                function,
                args,
                kwds,
            } => {
                let registry = &self.registry;
                let ctx = JobContext::new(kwds, self.shared.clone());
                let reply = guarded(&format!("job {}", function), || {
                    registry.run_job(&function, &ctx, args)
                });
                self.reply(ticket, reply)
            }
            WorkerRequest::CreateTask {
                ticket,
                task_id,
                class,
                node,
                node_count,
                tubes,
            } => {
                let registry = &self.registry;
                let mut created = None;
                let reply = guarded(&format!("task {} ({})", task_id, class), || {
                    created = Some(registry.make_task(&class)?);
                    Ok(Value::Unit)
                });
                if let Some(task) = created {
                    let io = WorkerTubes {
                        task_id: task_id.clone(),
                        node,
                        side: self.side.clone(),
                        mailboxes: self.mailboxes.clone(),
                        infos: self.infos.clone(),
                    };
                    let ctx = TaskContext::new(
                        node,
                        node_count,
                        tubes,
                        self.shared.clone(),
                        Box::new(io),
                    );
                    self.tasks.insert(task_id, HostedTask { task, ctx });
                }
                self.reply(ticket, reply)
            }
            WorkerRequest::InitializeTask {
                ticket,
                task_id,
                args,
            } => {
                let reply = match self.tasks.get_mut(&task_id) {
                    Some(hosted) => guarded(&format!("task {} initialize", task_id), || {
                        hosted.task.initialize(&mut hosted.ctx, args)?;
                        Ok(Value::Unit)
                    }),
                    None => Err(missing_task(&task_id)),
                };
                self.reply(ticket, reply)
            }
            WorkerRequest::StartTask { ticket, task_id } => {
                let reply = match self.tasks.get_mut(&task_id) {
                    Some(hosted) => guarded(&format!("task {} node {}", task_id, hosted.ctx.index()), || {
                        hosted.task.start(&mut hosted.ctx)
                    }),
                    None => Err(missing_task(&task_id)),
                };
                self.reply(ticket, reply)
            }
            WorkerRequest::GetInfo { ticket, task_id } => {
                let info = lock(&self.infos).get(&task_id).cloned().unwrap_or_default();
                self.reply(ticket, Ok(info))
            }
            WorkerRequest::DropTask { task_id } => {
                self.tasks.remove(&task_id);
                Ok(())
            }
            WorkerRequest::Deliver {
                task_id,
                tube,
                value,
            } => {
                self.mailboxes.push(&task_id, &tube, value);
                Ok(())
            }
            WorkerRequest::Terminate => Ok(()),
        }
    }
}

fn missing_task(task_id: &str) -> RemoteError {
    RemoteError::new(
        format!("no task {} on this worker", task_id),
        "worker executor",
    )
}

/// Tube transport of a single node hosted by this worker.
struct WorkerTubes {
    task_id: String,
    node: NodeIndex,
    side: Arc<Mutex<Channel>>,
    mailboxes: Arc<Mailboxes>,
    infos: Arc<Mutex<FnvHashMap<String, Value>>>,
}

impl TubeIo for WorkerTubes {
    fn push(&mut self, tube: &str, value: Value) -> spindle_core::Result<()> {
        let event = WorkerEvent::Push {
            task_id: self.task_id.clone(),
            source: self.node,
            tube: tube.to_string(),
            value,
        };
        send_event(&self.side, &event)
            .map_err(|e| spindle_core::Error::TubeDisconnected(format!("{}: {}", tube, e)))
    }

    fn pop(&mut self, tube: &str) -> spindle_core::Result<Value> {
        self.mailboxes.pop(&self.task_id, tube)
    }

    fn set_info(&mut self, info: Value) -> spindle_core::Result<()> {
        lock(&self.infos).insert(self.task_id.clone(), info);
        Ok(())
    }
}

/// Number of dropped task ids remembered for discarding late deliveries.
const DROPPED_MEMORY: usize = 256;

#[derive(Default)]
struct MailState {
    queues: FnvHashMap<(String, String), VecDeque<Value>>,
    dropped: FnvHashSet<String>,
    /// Dropped task ids, oldest first
    dropped_order: VecDeque<String>,
    closed: bool,
}

/// Incoming tube queues of all the tasks hosted by a worker.
///
/// Queues are created on first use, so values can arrive before the node
/// starts popping them.
#[derive(Default)]
pub(crate) struct Mailboxes {
    state: Mutex<MailState>,
    cond: Condvar,
}

impl Mailboxes {
    pub(crate) fn push(&self, task_id: &str, tube: &str, value: Value) {
        let mut state = lock(&self.state);
        if state.closed || state.dropped.contains(task_id) {
            trace!("discarding value for {}/{}", task_id, tube);
            return;
        }
        state
            .queues
            .entry((task_id.to_string(), tube.to_string()))
            .or_default()
            .push_back(value);
        self.cond.notify_all();
    }

    /// Takes the next value off the queue, blocking until one arrives.
    pub(crate) fn pop(&self, task_id: &str, tube: &str) -> spindle_core::Result<Value> {
        let key = (task_id.to_string(), tube.to_string());
        let mut state = lock(&self.state);
        loop {
            if let Some(value) = state.queues.get_mut(&key).and_then(|q| q.pop_front()) {
                return Ok(value);
            }
            if state.closed || state.dropped.contains(task_id) {
                return Err(spindle_core::Error::TubeDisconnected(tube.to_string()));
            }
            state = self.cond.wait(state).unwrap_or_else(|e| e.into_inner());
        }
    }

    pub(crate) fn drop_task(&self, task_id: &str) {
        let mut state = lock(&self.state);
        state.queues.retain(|(task, _), _| task != task_id);
        if state.dropped.insert(task_id.to_string()) {
            state.dropped_order.push_back(task_id.to_string());
        }
        while state.dropped_order.len() > DROPPED_MEMORY {
            if let Some(oldest) = state.dropped_order.pop_front() {
                state.dropped.remove(&oldest);
            }
        }
        self.cond.notify_all();
    }

    /// Refuses all further values. Dropped ids are no longer needed after
    /// this.
    pub(crate) fn close(&self) {
        let mut state = lock(&self.state);
        state.closed = true;
        state.queues.clear();
        state.dropped.clear();
        state.dropped_order.clear();
        self.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::CompressionPolicy;
    use std::time::Duration;

    #[test]
    fn mailbox_fifo_across_threads() {
        let mailboxes = Arc::new(Mailboxes::default());
        let consumer = {
            let mailboxes = mailboxes.clone();
            thread::spawn(move || {
                (0..100)
                    .map(|_| mailboxes.pop("t", "a").unwrap().as_int().unwrap())
                    .collect::<Vec<_>>()
            })
        };
        for n in 0..100 {
            mailboxes.push("t", "a", Value::Int(n));
            // other tubes don't interfere
            mailboxes.push("t", "b", Value::Int(-n));
        }
        assert_eq!(consumer.join().unwrap(), (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn closing_unblocks_pop() {
        let mailboxes = Arc::new(Mailboxes::default());
        let waiting = {
            let mailboxes = mailboxes.clone();
            thread::spawn(move || mailboxes.pop("t", "a"))
        };
        thread::sleep(Duration::from_millis(50));
        mailboxes.close();
        assert!(waiting.join().unwrap().is_err());
    }

    #[test]
    fn dropped_task_discards_values() {
        let mailboxes = Mailboxes::default();
        mailboxes.push("t", "a", Value::Int(1));
        mailboxes.drop_task("t");
        mailboxes.push("t", "a", Value::Int(2));
        assert!(mailboxes.pop("t", "a").is_err());
    }

    #[test]
    fn dropped_ids_are_bounded() {
        let mailboxes = Mailboxes::default();
        for n in 0..DROPPED_MEMORY + 10 {
            mailboxes.drop_task(&format!("t{}", n));
        }
        {
            let state = lock(&mailboxes.state);
            assert_eq!(state.dropped.len(), DROPPED_MEMORY);
            assert_eq!(state.dropped_order.len(), DROPPED_MEMORY);
            assert!(!state.dropped.contains("t0"));
        }
        // recent ones still discard late values
        let last = format!("t{}", DROPPED_MEMORY + 9);
        mailboxes.push(&last, "a", Value::Int(1));
        assert!(mailboxes.pop(&last, "a").is_err());

        mailboxes.close();
        let state = lock(&mailboxes.state);
        assert!(state.dropped.is_empty());
        assert!(state.queues.is_empty());
    }

    #[test]
    fn env_vars_round_trip() {
        let env = WorkerEnv {
            pool: "127.0.0.1:4000".to_string(),
            slot: 3,
            generation: 2,
            secret: "s".to_string(),
            resource_type: ResourceType::Gpu,
            shared: None,
            socket: SocketConfig {
                compression: CompressionPolicy::Everything,
                ..SocketConfig::default()
            },
        };
        let vars = env.vars();
        assert!(vars.contains(&(ENV_RESOURCE, "gpu".to_string())));
        assert!(vars.contains(&(ENV_ENCODING, "bincode".to_string())));
        assert!(vars.iter().all(|(name, _)| *name != ENV_SHARED));
        let compression = vars
            .iter()
            .find(|(name, _)| *name == ENV_COMPRESSION)
            .map(|(_, value)| value.parse::<CompressionPolicy>().unwrap());
        assert_eq!(compression, Some(CompressionPolicy::Everything));
        assert_eq!(
            CompressionPolicy::LargerThan(512)
                .to_string()
                .parse::<CompressionPolicy>()
                .unwrap(),
            CompressionPolicy::LargerThan(512)
        );
    }
}
