//! Pool of long-lived worker processes serving a single resource type.

use std::fmt;
use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use fnv::FnvHashMap;
use serde_repr::*;

use spindle_core::{NodeIndex, Registry, ResourceType, SharedData, Value};

use crate::msg::worker::{ChannelKind, Reply, Ticket, WorkerEvent, WorkerHello, WorkerRequest};
use crate::socket::{Channel, Listener, Secret, SocketConfig};
use crate::util::{lock, wait_for};
use crate::worker::{self, WorkerEnv};
use crate::{Error, Result};

/// Defines how worker processes are brought up.
#[derive(Clone)]
pub enum Launcher {
    /// Spawns the program as a separate OS process. The program must call
    /// [`worker::run_if_worker`] at startup.
    Process { program: PathBuf, args: Vec<String> },
    /// Runs workers on threads of the current process.
    Thread(Registry),
}

impl Launcher {
    /// Launches workers by re-running the current executable.
    pub fn current_exe() -> Result<Self> {
        Ok(Launcher::Process {
            program: std::env::current_exe()?,
            args: Vec::new(),
        })
    }
}

impl fmt::Debug for Launcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Launcher::Process { program, args } => {
                write!(f, "Process({} {})", program.display(), args.join(" "))
            }
            Launcher::Thread(_) => write!(f, "Thread"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub resource_type: ResourceType,
    /// Number of workers started with the pool
    pub size: usize,
    pub launcher: Launcher,
    /// Secret workers authenticate with, random if not set
    pub secret: Option<String>,
    /// Time given to a batch of workers to connect back after launch
    pub startup_timeout: Duration,
    /// Time given to a worker to exit on its own before it's killed
    pub kill_grace: Duration,
    pub socket: SocketConfig,
    pub poll_wait: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            resource_type: ResourceType::Cpu,
            size: num_cpus::get(),
            launcher: Launcher::Thread(Registry::new()),
            secret: None,
            startup_timeout: Duration::from_secs(10),
            kill_grace: Duration::from_secs(1),
            socket: SocketConfig::default(),
            poll_wait: Duration::from_millis(10),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum WorkerStatus {
    Idle = 0,
    Busy = 1,
}

/// Snapshot of a single pool slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub slot: usize,
    pub pid: u32,
    pub status: WorkerStatus,
    pub generation: u32,
    pub started_at: DateTime<Utc>,
}

/// Receives values pushed by task nodes hosted in the pool.
///
/// Called from the reader thread of the pushing worker, one value at a
/// time and in push order.
pub trait TubeRouter: Send + Sync {
    fn route(&self, source: NodeIndex, tube: &str, value: Value);
}

/// Reply to a request sent to a worker, not yet received.
pub struct Pending {
    slot: usize,
    receiver: Receiver<Reply>,
}

impl Pending {
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Blocks until the worker replies. Fails if the worker goes away
    /// first.
    pub fn wait(&self) -> Result<Reply> {
        self.receiver
            .recv()
            .map_err(|_| Error::WorkerLost(format!("worker {} went away", self.slot)))
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Result<Reply> {
        match self.receiver.recv_timeout(timeout) {
            Ok(reply) => Ok(reply),
            Err(RecvTimeoutError::Timeout) => Err(Error::TimedOut),
            Err(RecvTimeoutError::Disconnected) => Err(Error::WorkerLost(format!(
                "worker {} went away",
                self.slot
            ))),
        }
    }
}

enum Handle {
    Child(Child),
    Thread(JoinHandle<()>),
}

impl Handle {
    fn has_exited(&mut self) -> bool {
        match self {
            Handle::Child(child) => matches!(child.try_wait(), Ok(Some(_))),
            Handle::Thread(handle) => handle.is_finished(),
        }
    }
}

struct Slot {
    generation: u32,
    status: WorkerStatus,
    pid: u32,
    started_at: DateTime<Utc>,
    control: Option<Arc<Mutex<Channel>>>,
    side: Option<Channel>,
    handle: Option<Handle>,
}

impl Slot {
    fn new() -> Self {
        Self {
            generation: 0,
            status: WorkerStatus::Idle,
            pid: 0,
            started_at: Utc::now(),
            control: None,
            side: None,
            handle: None,
        }
    }

    fn is_ready(&self) -> bool {
        self.control.is_some() && self.side.is_some()
    }

    fn detach(&mut self) -> Detached {
        Detached {
            control: self.control.take(),
            side: self.side.take(),
            handle: self.handle.take(),
        }
    }
}

/// Worker taken out of its slot, about to be stopped.
struct Detached {
    control: Option<Arc<Mutex<Channel>>>,
    side: Option<Channel>,
    handle: Option<Handle>,
}

impl Detached {
    /// Asks the worker to exit. With a grace period the worker gets killed
    /// once it passes, otherwise it's waited for as long as it takes.
    fn terminate(self, grace: Option<Duration>) {
        if let Some(control) = &self.control {
            if let Err(e) = lock(control).send(&WorkerRequest::Terminate) {
                trace!("failed sending terminate: {}", e);
            }
        }
        match self.handle {
            Some(Handle::Child(mut child)) => match grace {
                Some(grace) => {
                    let deadline = Instant::now() + grace;
                    loop {
                        match child.try_wait() {
                            Ok(Some(_)) => break,
                            Ok(None) if Instant::now() < deadline => {
                                thread::sleep(Duration::from_millis(10))
                            }
                            _ => {
                                debug!("killing worker process {}", child.id());
                                let _ = child.kill();
                                let _ = child.wait();
                                break;
                            }
                        }
                    }
                }
                None => {
                    let _ = child.wait();
                }
            },
            Some(Handle::Thread(handle)) => {
                // worker threads can't be killed, they exit once their
                // channels go down
                if grace.is_none() && handle.join().is_err() {
                    warn!("worker thread panicked");
                }
            }
            None => (),
        }
        shutdown_channels(self.control, self.side);
    }

    fn kill(self) {
        shutdown_channels(self.control, self.side);
        if let Some(Handle::Child(mut child)) = self.handle {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

fn shutdown_channels(control: Option<Arc<Mutex<Channel>>>, side: Option<Channel>) {
    if let Some(control) = control {
        lock(&control).shutdown();
    }
    if let Some(side) = side {
        side.shutdown();
    }
}

struct PoolState {
    slots: Vec<Slot>,
    pending: FnvHashMap<Ticket, (usize, Sender<Reply>)>,
    routers: FnvHashMap<String, Arc<dyn TubeRouter>>,
    next_ticket: Ticket,
}

impl PoolState {
    /// Drops the reply senders of requests sent to the given slots, waking
    /// up their waiters.
    fn fail_pending(&mut self, slots: &[usize]) {
        self.pending.retain(|_, (slot, _)| !slots.contains(slot));
    }
}

struct PoolInner {
    config: PoolConfig,
    state: Mutex<PoolState>,
    cond: Condvar,
    running: AtomicBool,
    address: SocketAddr,
    secret: String,
}

impl PoolInner {
    fn handle_event(&self, event: WorkerEvent) {
        match event {
            WorkerEvent::Done { ticket, reply } => {
                let pending = lock(&self.state).pending.remove(&ticket);
                match pending {
                    Some((_, sender)) => {
                        let _ = sender.send(reply);
                    }
                    None => trace!("reply for unknown ticket {}", ticket),
                }
            }
            WorkerEvent::Push {
                task_id,
                source,
                tube,
                value,
            } => {
                let router = lock(&self.state).routers.get(&task_id).cloned();
                match router {
                    Some(router) => router.route(source, &tube, value),
                    None => debug!(
                        "dropping value pushed by node {} of unknown task {}",
                        source, task_id
                    ),
                }
            }
        }
    }

    fn worker_lost(&self, slot: usize, generation: u32) {
        let mut state = lock(&self.state);
        match state.slots.get_mut(slot) {
            Some(s) if s.generation == generation => {
                if self.running.load(Ordering::SeqCst) {
                    warn!(
                        "{} worker {} (pid {}) disconnected",
                        self.config.resource_type, slot, s.pid
                    );
                }
                let detached = s.detach();
                state.fail_pending(&[slot]);
                drop(state);
                detached.kill();
                self.cond.notify_all();
            }
            _ => (),
        }
    }

    fn register(self: &Arc<Self>, channel: Channel, hello: WorkerHello) -> Result<()> {
        let mut state = lock(&self.state);
        let slot = match state.slots.get_mut(hello.slot) {
            Some(s) if s.generation == hello.generation => s,
            _ => {
                debug!(
                    "ignoring stale worker {} (generation {})",
                    hello.slot, hello.generation
                );
                channel.shutdown();
                return Ok(());
            }
        };
        slot.pid = hello.pid;
        match hello.kind {
            ChannelKind::Side => {
                let reader = channel.try_clone()?;
                slot.side = Some(channel);
                let inner = self.clone();
                let (index, generation) = (hello.slot, hello.generation);
                thread::Builder::new()
                    .name(format!("pool-events-{}", index))
                    .spawn(move || inner.read_events(reader, index, generation))?;
            }
            ChannelKind::Control => slot.control = Some(Arc::new(Mutex::new(channel))),
        }
        if slot.is_ready() {
            debug!(
                "{} worker {} ready (pid {}, generation {})",
                self.config.resource_type, hello.slot, hello.pid, hello.generation
            );
            self.cond.notify_all();
        }
        Ok(())
    }

    fn read_events(&self, mut channel: Channel, slot: usize, generation: u32) {
        loop {
            match channel.recv::<WorkerEvent>() {
                Ok(event) => self.handle_event(event),
                Err(e) => {
                    trace!("side channel of worker {} closed: {}", slot, e);
                    break;
                }
            }
        }
        self.worker_lost(slot, generation);
    }

    fn accept_loop(self: Arc<Self>, listener: Listener) {
        let secret = Secret::new(&self.secret);
        loop {
            let stream = match listener.accept(&self.running) {
                Ok(Some((stream, _))) => stream,
                Ok(None) => break,
                Err(e) => {
                    warn!("pool listener failed: {}", e);
                    break;
                }
            };
            let inner = self.clone();
            let secret = secret.clone();
            let spawned = thread::Builder::new()
                .name("pool-handshake".to_string())
                .spawn(move || {
                    let result = Channel::accept(stream, &secret, inner.config.socket)
                        .and_then(|(mut channel, _)| {
                            channel.set_read_timeout(Some(inner.config.socket.handshake_timeout))?;
                            let hello: WorkerHello = channel.recv()?;
                            channel.set_read_timeout(None)?;
                            inner.register(channel, hello)
                        });
                    if let Err(e) = result {
                        warn!("failed registering worker connection: {}", e);
                    }
                });
            if let Err(e) = spawned {
                error!("failed spawning handshake thread: {}", e);
            }
        }
        debug!("pool listener on {} stopped", self.address);
    }

    fn launch(&self, slot: usize, generation: u32, shared: Option<PathBuf>) -> Result<Handle> {
        let env = WorkerEnv {
            pool: self.address.to_string(),
            slot,
            generation,
            secret: self.secret.clone(),
            resource_type: self.config.resource_type,
            shared,
            socket: self.config.socket,
        };
        match &self.config.launcher {
            Launcher::Process { program, args } => {
                let mut cmd = Command::new(program);
                cmd.args(args).stdin(Stdio::null());
                for (name, value) in env.vars() {
                    cmd.env(name, value);
                }
                let child = cmd.spawn()?;
                debug!(
                    "launched {} worker {} as process {}",
                    self.config.resource_type,
                    slot,
                    child.id()
                );
                Ok(Handle::Child(child))
            }
            Launcher::Thread(registry) => {
                let registry = registry.clone();
                let handle = thread::Builder::new()
                    .name(format!("worker-{}-{}", self.config.resource_type, slot))
                    .spawn(move || {
                        if let Err(e) = worker::serve(env, registry) {
                            warn!("worker thread {} failed: {}", slot, e);
                        }
                    })?;
                Ok(Handle::Thread(handle))
            }
        }
    }

    /// Launches fresh workers for the given slots and waits until all of
    /// them have connected back.
    fn launch_all(&self, slots: &[usize], shared: Option<PathBuf>) -> Result<()> {
        for &slot in slots {
            let generation = lock(&self.state).slots[slot].generation;
            let handle = self.launch(slot, generation, shared.clone())?;
            let mut state = lock(&self.state);
            let s = &mut state.slots[slot];
            s.handle = Some(handle);
            s.started_at = Utc::now();
        }
        self.wait_ready(slots)
    }

    fn wait_ready(&self, slots: &[usize]) -> Result<()> {
        let deadline = Instant::now() + self.config.startup_timeout;
        let mut state = lock(&self.state);
        loop {
            let mut waiting = 0;
            for &slot in slots {
                let s = &mut state.slots[slot];
                if s.is_ready() {
                    continue;
                }
                if let Some(handle) = &mut s.handle {
                    if handle.has_exited() {
                        return Err(Error::WorkerLost(format!(
                            "{} worker {} exited during startup",
                            self.config.resource_type, slot
                        )));
                    }
                }
                waiting += 1;
            }
            if waiting == 0 {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::WorkerLost(format!(
                    "{} {} worker(s) failed to start within {}ms",
                    waiting,
                    self.config.resource_type,
                    self.config.startup_timeout.as_millis()
                )));
            }
            let wait = (deadline - now).min(Duration::from_millis(50));
            state = match self.cond.wait_timeout(state, wait) {
                Ok((guard, _)) => guard,
                Err(e) => e.into_inner().0,
            };
        }
    }
}

/// Fixed set of long-lived workers for one resource type.
///
/// Workers connect back to the pool over loopback, see
/// [`msg::worker`](crate::msg::worker) for the protocol. Slots are claimed
/// by handlers for the duration of a task or a batch of jobs and released
/// afterwards; the pool itself never picks workers for a request.
pub struct WorkerPool {
    inner: Arc<PoolInner>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Starts the listener and launches the initial set of workers.
    pub fn new(config: PoolConfig) -> Result<Self> {
        let listener = Listener::bind("127.0.0.1:0", config.poll_wait)?;
        let address = listener.local_addr()?;
        let secret = config
            .secret
            .clone()
            .unwrap_or_else(|| spindle_core::util::random_id(16));
        let size = config.size;
        let inner = Arc::new(PoolInner {
            state: Mutex::new(PoolState {
                slots: (0..size).map(|_| Slot::new()).collect(),
                pending: FnvHashMap::default(),
                routers: FnvHashMap::default(),
                next_ticket: 0,
            }),
            config,
            cond: Condvar::new(),
            running: AtomicBool::new(true),
            address,
            secret,
        });
        let accept_inner = inner.clone();
        let handle = thread::Builder::new()
            .name(format!("pool-{}", inner.config.resource_type))
            .spawn(move || accept_inner.accept_loop(listener))?;
        let pool = Self {
            inner,
            listener: Mutex::new(Some(handle)),
        };

        let slots = (0..size).collect::<Vec<_>>();
        pool.inner.launch_all(&slots, None)?;
        info!(
            "started {} pool with {} worker(s) ({:?})",
            pool.inner.config.resource_type, size, pool.inner.config.launcher
        );
        Ok(pool)
    }

    pub fn resource_type(&self) -> ResourceType {
        self.inner.config.resource_type
    }

    pub fn size(&self) -> usize {
        lock(&self.inner.state).slots.len()
    }

    /// Returns up to `n` idle slots without claiming them.
    pub fn get_idle_units(&self, n: usize) -> Vec<usize> {
        lock(&self.inner.state)
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.status == WorkerStatus::Idle && s.is_ready())
            .map(|(i, _)| i)
            .take(n)
            .collect()
    }

    /// Marks up to `n` idle slots as busy and returns them. May return
    /// fewer than requested.
    pub fn claim_idle_units(&self, n: usize) -> Vec<usize> {
        let mut state = lock(&self.inner.state);
        let mut claimed = Vec::with_capacity(n);
        for (i, slot) in state.slots.iter_mut().enumerate() {
            if claimed.len() == n {
                break;
            }
            if slot.status == WorkerStatus::Idle && slot.is_ready() {
                slot.status = WorkerStatus::Busy;
                claimed.push(i);
            }
        }
        claimed
    }

    pub fn release(&self, slots: &[usize]) {
        let mut state = lock(&self.inner.state);
        for &slot in slots {
            if let Some(s) = state.slots.get_mut(slot) {
                s.status = WorkerStatus::Idle;
            }
        }
        self.inner.cond.notify_all();
    }

    /// Sends a request expecting a reply. The closure receives the ticket
    /// to embed in the request.
    pub fn request<F>(&self, slot: usize, make: F) -> Result<Pending>
    where
        F: FnOnce(Ticket) -> WorkerRequest,
    {
        let (sender, receiver) = crossbeam_channel::bounded(1);
        let (ticket, control) = {
            let mut state = lock(&self.inner.state);
            let control = self.control(&state, slot)?;
            state.next_ticket += 1;
            let ticket = state.next_ticket;
            state.pending.insert(ticket, (slot, sender));
            (ticket, control)
        };
        if let Err(e) = lock(&control).send(&make(ticket)) {
            lock(&self.inner.state).pending.remove(&ticket);
            return Err(Error::WorkerLost(format!("worker {}: {}", slot, e)));
        }
        Ok(Pending { slot, receiver })
    }

    /// Sends a request that doesn't get a reply.
    pub fn send(&self, slot: usize, request: &WorkerRequest) -> Result<()> {
        let control = self.control(&lock(&self.inner.state), slot)?;
        let mut channel = lock(&control);
        channel
            .send(request)
            .map_err(|e| Error::WorkerLost(format!("worker {}: {}", slot, e)))
    }

    fn control(&self, state: &PoolState, slot: usize) -> Result<Arc<Mutex<Channel>>> {
        state
            .slots
            .get(slot)
            .and_then(|s| s.control.clone())
            .ok_or_else(|| {
                Error::WorkerLost(format!(
                    "{} worker {} is not connected",
                    self.inner.config.resource_type, slot
                ))
            })
    }

    pub fn register_router(&self, task_id: &str, router: Arc<dyn TubeRouter>) {
        lock(&self.inner.state)
            .routers
            .insert(task_id.to_string(), router);
    }

    pub fn unregister_router(&self, task_id: &str) {
        lock(&self.inner.state).routers.remove(task_id);
    }

    /// Tears down the workers in the given slots and launches new ones,
    /// optionally loading shared data before they start serving. Slot
    /// statuses are left untouched.
    pub fn restart_workers(&self, slots: &[usize], shared: Option<&SharedData>) -> Result<()> {
        let path = match shared {
            Some(data) => {
                let path = std::env::temp_dir().join(format!(
                    "spindle-shared-{}.bin",
                    spindle_core::util::random_id(8)
                ));
                data.to_file(&path)?;
                Some(path)
            }
            None => None,
        };

        let mut detached = Vec::with_capacity(slots.len());
        {
            let mut state = lock(&self.inner.state);
            for &slot in slots {
                let s = state.slots.get_mut(slot).ok_or_else(|| {
                    Error::Other(format!("no slot {} in {} pool", slot, self.resource_type()))
                })?;
                s.generation += 1;
                detached.push(s.detach());
            }
            state.fail_pending(slots);
        }
        for worker in detached {
            worker.terminate(Some(self.inner.config.kill_grace));
        }
        debug!("restarting {} worker(s): {:?}", self.resource_type(), slots);
        let result = self.inner.launch_all(slots, path.clone());

        // workers load the data before connecting back
        if let Some(path) = path {
            if let Err(e) = fs::remove_file(&path) {
                warn!("failed removing {}: {}", path.display(), e);
            }
        }
        result
    }

    /// Grows the pool to at least `n` workers. Never shrinks it.
    pub fn ensure_size(&self, n: usize) -> Result<()> {
        let new_slots = {
            let mut state = lock(&self.inner.state);
            let current = state.slots.len();
            if n <= current {
                return Ok(());
            }
            state.slots.extend((current..n).map(|_| Slot::new()));
            (current..n).collect::<Vec<_>>()
        };
        info!(
            "growing {} pool to {} worker(s)",
            self.resource_type(),
            n
        );
        self.inner.launch_all(&new_slots, None)
    }

    pub fn status(&self) -> Vec<WorkerRecord> {
        lock(&self.inner.state)
            .slots
            .iter()
            .enumerate()
            .map(|(i, s)| WorkerRecord {
                slot: i,
                pid: s.pid,
                status: s.status,
                generation: s.generation,
                started_at: s.started_at,
            })
            .collect()
    }

    /// Blocks until every slot is idle.
    pub fn join(&self) {
        let state = lock(&self.inner.state);
        let _state = wait_for(&self.inner.cond, state, |st| {
            st.slots.iter().all(|s| s.status == WorkerStatus::Idle)
        });
    }

    /// Asks every worker to finish what it's doing and exit, then waits
    /// for all of them.
    pub fn close(&self) {
        if !self.stop_listener() {
            return;
        }
        let detached = self.detach_all();
        for worker in detached {
            worker.terminate(None);
        }
        info!("closed {} pool", self.resource_type());
    }

    /// Terminates every worker immediately, abandoning in-flight work.
    pub fn kill(&self) {
        if !self.stop_listener() {
            return;
        }
        for worker in self.detach_all() {
            worker.kill();
        }
        info!("killed {} pool", self.resource_type());
    }

    fn detach_all(&self) -> Vec<Detached> {
        let mut state = lock(&self.inner.state);
        let all = (0..state.slots.len()).collect::<Vec<_>>();
        state.fail_pending(&all);
        state.routers.clear();
        let detached = state.slots.iter_mut().map(|s| s.detach()).collect();
        self.inner.cond.notify_all();
        detached
    }

    /// Returns false if the pool was already stopped.
    fn stop_listener(&self) -> bool {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return false;
        }
        if let Some(handle) = lock(&self.listener).take() {
            let _ = handle.join();
        }
        true
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.kill();
    }
}
