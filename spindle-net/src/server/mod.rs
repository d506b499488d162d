use std::collections::BTreeMap;
use std::net::TcpStream;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use fnv::FnvHashMap;
use id_pool::IdPool;

use spindle_core::{Machine, Registry, RemoteError, ResourceType, Value};

use crate::msg::worker::Reply;
use crate::msg::{Procedure, Request, Response, TempToken};
use crate::pool::{Launcher, PoolConfig, WorkerPool};
use crate::socket::{Channel, Listener, Secret, SocketConfig};
use crate::util::{lock, wait_for};
use crate::{ClientConfig, Error, ResourceLedger, Result};

mod handler;
mod native;

pub use handler::{Call, Handler, HandlerRegistry};

/// Configuration settings for server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Name of the server, used in logs
    pub name: String,
    /// Address to listen on
    pub address: String,
    /// Secret clients have to know to connect
    pub secret: Secret,

    /// Total cpu units, defaults to the number of logical cores
    pub cpu: Option<usize>,
    /// Total gpu units, defaults to zero
    pub gpu: Option<usize>,
    /// Way of launching worker processes
    pub launcher: Launcher,
    /// Directory where job records are stored
    pub job_dir: PathBuf,

    /// Delay between polling for new incoming client connections
    pub poll_wait: Duration,
    pub socket: SocketConfig,
    /// Time given to in-flight sessions to finish on shutdown
    pub shutdown_grace: Duration,
    /// Time given to workers to connect back after launch
    pub worker_startup: Duration,

    /// Trials for relaying tube values to other servers
    pub relay_trials: u32,
    /// Time limit for relaying a single tube value to another server
    pub relay_timeout: Duration,
    /// Time a deferred result is kept around after it's ready
    pub temp_ttl: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            name: "spindle".to_string(),
            address: format!("0.0.0.0:{}", spindle_core::machine::DEFAULT_PORT),
            secret: Secret::default(),
            cpu: None,
            gpu: None,
            launcher: Launcher::current_exe().unwrap_or_else(|_| Launcher::Thread(Registry::new())),
            job_dir: std::env::temp_dir().join("spindle-jobs"),
            poll_wait: Duration::from_millis(10),
            socket: SocketConfig::default(),
            shutdown_grace: Duration::from_secs(2),
            worker_startup: Duration::from_secs(10),
            relay_trials: 5,
            relay_timeout: Duration::from_secs(10),
            temp_ttl: Duration::from_secs(600),
        }
    }
}

/// Results of deferred calls waiting to be fetched.
///
/// Results nobody fetches within `ttl` of being ready are dropped.
struct TempResults {
    state: Mutex<TempState>,
    cond: Condvar,
    ttl: Duration,
}

struct TempState {
    tokens: IdPool,
    /// Pending entries have no reply yet, ready ones carry the time they
    /// were put
    results: FnvHashMap<TempToken, Option<(Reply, Instant)>>,
    closed: bool,
}

impl TempResults {
    fn new(ttl: Duration) -> Self {
        Self {
            state: Mutex::new(TempState {
                tokens: IdPool::new(),
                results: FnvHashMap::default(),
                closed: false,
            }),
            cond: Condvar::new(),
            ttl,
        }
    }

    fn reserve(&self) -> Result<TempToken> {
        let mut state = lock(&self.state);
        self.expire(&mut state);
        let token = state
            .tokens
            .request_id()
            .ok_or_else(|| Error::Other("ran out of temp result tokens".to_string()))?;
        state.results.insert(token, None);
        Ok(token)
    }

    fn put(&self, token: TempToken, reply: Reply) {
        lock(&self.state)
            .results
            .insert(token, Some((reply, Instant::now())));
        self.cond.notify_all();
    }

    /// Waits for the result stored under the token and takes it out.
    fn fetch(&self, token: TempToken) -> Result<Reply> {
        let state = lock(&self.state);
        let mut state = wait_for(&self.cond, state, |st| {
            st.closed || !matches!(st.results.get(&token), Some(None))
        });
        match state.results.remove(&token) {
            Some(Some((reply, _))) => {
                let _ = state.tokens.return_id(token);
                Ok(reply)
            }
            Some(None) => Err(Error::ShuttingDown),
            None => Err(Error::Other(format!("no temp result under token {}", token))),
        }
    }

    /// Drops ready results older than the time limit.
    fn expire(&self, state: &mut TempState) {
        let ttl = self.ttl;
        let expired = state
            .results
            .iter()
            .filter_map(|(token, entry)| match entry {
                Some((_, ready_at)) if ready_at.elapsed() >= ttl => Some(*token),
                _ => None,
            })
            .collect::<Vec<_>>();
        for token in expired {
            debug!("temp result {} was never fetched, dropping", token);
            state.results.remove(&token);
            let _ = state.tokens.return_id(token);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        lock(&self.state).results.len()
    }

    fn close(&self) {
        lock(&self.state).closed = true;
        self.cond.notify_all();
    }
}

/// State shared by all the sessions of a server.
pub struct ServerContext {
    pub config: ServerConfig,
    /// Address other machines can reach this server at
    pub machine: Machine,
    pub(crate) ledger: Mutex<ResourceLedger>,
    pools: FnvHashMap<ResourceType, Arc<WorkerPool>>,
    handlers: Mutex<BTreeMap<String, (String, Arc<dyn Handler>)>>,
    classes: HandlerRegistry,
    temp: TempResults,
    running: AtomicBool,
    killed: AtomicBool,
    /// Handles of open sessions, used to cut them off on shutdown
    sessions: Mutex<FnvHashMap<u64, Channel>>,
    session_count: AtomicU64,
}

impl ServerContext {
    pub fn pool(&self, resource_type: ResourceType) -> Result<&Arc<WorkerPool>> {
        self.pools
            .get(&resource_type)
            .ok_or_else(|| Error::Other(format!("no {} pool on this server", resource_type)))
    }

    /// Gets the handler stored under the id, creating one of the given
    /// class if there's none yet.
    pub fn handler(self: &Arc<Self>, id: &str, class: &str) -> Result<Arc<dyn Handler>> {
        let mut handlers = lock(&self.handlers);
        if let Some((existing, handler)) = handlers.get(id) {
            if existing != class {
                return Err(Error::InvalidState(format!(
                    "handler {} is of class {}, not {}",
                    id, existing, class
                )));
            }
            return Ok(handler.clone());
        }
        let handler = self.classes.construct(class, self, id)?;
        debug!("created {} handler: {}", class, id);
        handlers.insert(id.to_string(), (class.to_string(), handler.clone()));
        Ok(handler)
    }

    /// Removes the handler, returning false if there was none.
    pub fn delete_handler(&self, id: &str) -> bool {
        let removed = lock(&self.handlers).remove(id);
        match removed {
            Some((class, handler)) => {
                handler.close();
                debug!("deleted {} handler: {}", class, id);
                true
            }
            None => false,
        }
    }

    /// Lists handler ids along with their classes.
    pub fn list_handlers(&self) -> BTreeMap<String, String> {
        lock(&self.handlers)
            .iter()
            .map(|(id, (class, _))| (id.clone(), class.clone()))
            .collect()
    }

    /// Client configuration used when talking to other servers.
    pub fn relay_config(&self) -> ClientConfig {
        ClientConfig {
            secret: self.config.secret.clone(),
            identity: Some(self.machine.to_string()),
            trials: self.config.relay_trials,
            timeout: self.config.relay_timeout,
            socket: self.config.socket,
            ..ClientConfig::default()
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stops accepting new connections.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    fn handle_connection(self: Arc<Self>, stream: TcpStream) {
        let (channel, identity) =
            match Channel::accept(stream, &self.config.secret, self.config.socket) {
                Ok(c) => c,
                Err(e) => {
                    warn!("{}: {}", self.config.name, e);
                    return;
                }
            };
        let client = identity.unwrap_or_else(|| channel.peer_addr().ip().to_string());
        let id = self.session_count.fetch_add(1, Ordering::SeqCst);
        match channel.try_clone() {
            Ok(clone) => {
                lock(&self.sessions).insert(id, clone);
            }
            Err(e) => warn!("failed cloning session channel: {}", e),
        }
        trace!("session {} opened by {}", id, client);
        self.serve_session(channel, &client);
        lock(&self.sessions).remove(&id);
        trace!("session {} closed", id);
    }

    fn serve_session(self: &Arc<Self>, mut channel: Channel, client: &str) {
        let mut persistent = false;
        loop {
            let request: Request = match channel.recv() {
                Ok(r) => r,
                Err(Error::Disconnected) => break,
                Err(e) => {
                    debug!("session with {} failed: {}", client, e);
                    break;
                }
            };
            let response = match request {
                Request::KeepConnection => {
                    persistent = true;
                    Response::Ack
                }
                Request::CloseConnection => {
                    let _ = channel.send(&Response::Ack);
                    break;
                }
                Request::Shutdown => {
                    info!("{}: shutdown requested by {}", self.config.name, client);
                    self.shutdown();
                    let _ = channel.send(&Response::Ack);
                    break;
                }
                Request::Call(procedure) if procedure.deferred => {
                    let response = match self.defer(procedure, client) {
                        Ok(token) => Response::Deferred(token),
                        Err(e) => Response::Failed(e.to_remote("deferred call")),
                    };
                    // the client reconnects to fetch the result
                    let _ = channel.send(&response);
                    break;
                }
                Request::Call(procedure) => dispatch(self, procedure, client).into(),
                Request::FetchTemp(token) => match self.temp.fetch(token) {
                    Ok(reply) => reply.into(),
                    Err(e) => Response::Failed(e.to_remote("fetch temp result")),
                },
            };
            if let Err(e) = channel.send(&response) {
                debug!("failed responding to {}: {}", client, e);
                break;
            }
            if !persistent {
                break;
            }
        }
        channel.shutdown();
    }

    fn defer(self: &Arc<Self>, procedure: Procedure, client: &str) -> Result<TempToken> {
        let token = self.temp.reserve()?;
        let ctx = self.clone();
        let client = client.to_string();
        thread::Builder::new()
            .name(format!("deferred-{}", token))
            .spawn(move || {
                let reply = dispatch(&ctx, procedure, &client);
                ctx.temp.put(token, reply);
            })?;
        Ok(token)
    }

    /// Waits for sessions to wind down, then closes all handlers and
    /// worker pools.
    fn finish(&self, sessions: Vec<JoinHandle<()>>) {
        let killed = self.killed.load(Ordering::SeqCst);
        if !killed {
            let deadline = Instant::now() + self.config.shutdown_grace;
            while Instant::now() < deadline && sessions.iter().any(|s| !s.is_finished()) {
                thread::sleep(self.config.poll_wait);
            }
        }
        for (_, channel) in lock(&self.sessions).drain() {
            channel.shutdown();
        }
        self.temp.close();

        let handlers = std::mem::take(&mut *lock(&self.handlers));
        for (_, (_, handler)) in handlers {
            handler.close();
        }
        for pool in self.pools.values() {
            if killed {
                pool.kill();
            } else {
                pool.close();
            }
        }
        info!("{}: server at {} stopped", self.config.name, self.machine);
    }
}

/// Calls the procedure, capturing any error or panic as a remote error.
fn dispatch(ctx: &Arc<ServerContext>, procedure: Procedure, client: &str) -> Reply {
    let context = format!(
        "{}.{}",
        procedure.handler_class.as_deref().unwrap_or("native"),
        procedure.method
    );
    match panic::catch_unwind(AssertUnwindSafe(|| call_procedure(ctx, procedure, client))) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => {
            debug!("{} failed: {}", context, e);
            Err(e.to_remote(&context))
        }
        Err(payload) => {
            let e = RemoteError::from_panic(payload, &context);
            error!("{}", e.trace);
            Err(e)
        }
    }
}

fn call_procedure(ctx: &Arc<ServerContext>, procedure: Procedure, client: &str) -> Result<Value> {
    let call = Call {
        client: client.to_string(),
        args: procedure.args,
        kwds: procedure.kwds,
    };
    match procedure.handler_class {
        None => native::call(ctx, &procedure.method, call),
        Some(class) => {
            let id = procedure
                .handler_id
                .unwrap_or_else(|| call.client.clone());
            let handler = ctx.handler(&id, &class)?;
            handler.call(ctx, &procedure.method, call)
        }
    }
}

/// Connection entry point for clients.
///
/// # Sessions
///
/// Every accepted connection is served on its own thread, so a slow call
/// never holds up other clients. A session handles a single request unless
/// the client asks to keep the connection open.
///
/// # Shutting down
///
/// Once shut down, the server stops accepting connections and gives open
/// sessions a grace period to finish. Remaining sessions are then cut off,
/// handlers are closed and worker pools are asked to finish their work.
pub struct Server {
    context: Arc<ServerContext>,
    listener: Listener,
}

impl Server {
    /// Creates a new server with the built-in handler classes, binding its
    /// listener and launching the worker pools.
    pub fn new(config: ServerConfig) -> Result<Self> {
        Self::new_with_classes(config, HandlerRegistry::with_builtins())
    }

    pub fn new_with_classes(config: ServerConfig, classes: HandlerRegistry) -> Result<Self> {
        let listener = Listener::bind(&config.address, config.poll_wait)?;
        let local = listener.local_addr()?;
        let machine = if local.ip().is_unspecified() {
            Machine::local(local.port())
        } else {
            Machine::from(local)
        };

        let cpu = config.cpu.unwrap_or_else(num_cpus::get);
        let gpu = config.gpu.unwrap_or(0);
        let mut pools = FnvHashMap::default();
        for (resource_type, size) in vec![(ResourceType::Cpu, cpu), (ResourceType::Gpu, gpu)] {
            let pool = WorkerPool::new(PoolConfig {
                resource_type,
                size,
                launcher: config.launcher.clone(),
                startup_timeout: config.worker_startup,
                socket: config.socket,
                poll_wait: config.poll_wait,
                ..PoolConfig::default()
            })?;
            pools.insert(resource_type, Arc::new(pool));
        }
        info!(
            "{}: serving {} cpu and {} gpu unit(s) at {}",
            config.name, cpu, gpu, machine
        );

        let temp = TempResults::new(config.temp_ttl);
        let context = Arc::new(ServerContext {
            ledger: Mutex::new(ResourceLedger::new(cpu, gpu)),
            config,
            machine,
            pools,
            handlers: Mutex::new(BTreeMap::new()),
            classes,
            temp,
            running: AtomicBool::new(true),
            killed: AtomicBool::new(false),
            sessions: Mutex::new(FnvHashMap::default()),
            session_count: AtomicU64::new(0),
        });
        Ok(Self { context, listener })
    }

    pub fn machine(&self) -> &Machine {
        &self.context.machine
    }

    pub fn context(&self) -> Arc<ServerContext> {
        self.context.clone()
    }

    /// Serves incoming connections until the server is shut down.
    pub fn start_polling(self) -> Result<()> {
        let mut sessions: Vec<JoinHandle<()>> = Vec::new();
        let result = loop {
            let (stream, addr) = match self.listener.accept(&self.context.running) {
                Ok(Some(accepted)) => accepted,
                Ok(None) => break Ok(()),
                Err(e) => {
                    error!("{}: listener failed: {}", self.context.config.name, e);
                    self.context.shutdown();
                    break Err(e);
                }
            };
            sessions.retain(|s| !s.is_finished());
            let ctx = self.context.clone();
            let spawned = thread::Builder::new()
                .name(format!("session-{}", addr))
                .spawn(move || ctx.handle_connection(stream));
            match spawned {
                Ok(handle) => sessions.push(handle),
                Err(e) => error!("failed spawning session thread: {}", e),
            }
        };
        drop(self.listener);
        self.context.finish(sessions);
        result
    }

    /// Starts serving on a background thread.
    pub fn start(config: ServerConfig) -> Result<ServerHandle> {
        Self::new(config)?.spawn()
    }

    pub fn start_with(config: ServerConfig, classes: HandlerRegistry) -> Result<ServerHandle> {
        Self::new_with_classes(config, classes)?.spawn()
    }

    fn spawn(self) -> Result<ServerHandle> {
        let context = self.context.clone();
        let thread = thread::Builder::new()
            .name(format!("server-{}", context.machine.port))
            .spawn(move || self.start_polling())?;
        Ok(ServerHandle {
            context,
            thread: Some(thread),
        })
    }
}

/// Server running on a background thread of the current process.
pub struct ServerHandle {
    context: Arc<ServerContext>,
    thread: Option<JoinHandle<Result<()>>>,
}

impl ServerHandle {
    pub fn machine(&self) -> Machine {
        self.context.machine.clone()
    }

    pub fn address(&self) -> String {
        self.context.machine.address()
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        &self.context
    }

    pub fn is_running(&self) -> bool {
        self.context.is_running()
    }

    /// Asks the server to shut down gracefully, without waiting for it.
    pub fn shutdown(&self) {
        self.context.shutdown();
    }

    /// Waits for the server to stop.
    pub fn join(mut self) -> Result<()> {
        self.wait()
    }

    /// Stops the server right away, cutting off open sessions and killing
    /// the workers.
    pub fn kill(mut self) {
        self.context.killed.store(true, Ordering::SeqCst);
        self.context.shutdown();
        if let Err(e) = self.wait() {
            warn!("server stopped with error: {}", e);
        }
    }

    fn wait(&mut self) -> Result<()> {
        match self.thread.take() {
            Some(thread) => thread
                .join()
                .unwrap_or_else(|_| Err(Error::Other("server thread panicked".to_string()))),
            None => Ok(()),
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.context.killed.store(true, Ordering::SeqCst);
            self.context.shutdown();
            let _ = self.wait();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temp_results_wait_for_put() {
        let temp = Arc::new(TempResults::new(Duration::from_secs(60)));
        let token = temp.reserve().unwrap();
        let fetching = {
            let temp = temp.clone();
            thread::spawn(move || temp.fetch(token))
        };
        thread::sleep(Duration::from_millis(20));
        temp.put(token, Ok(Value::Int(3)));
        assert_eq!(fetching.join().unwrap().unwrap(), Ok(Value::Int(3)));
        // taken out on fetch
        assert!(temp.fetch(token).is_err());
    }

    #[test]
    fn closing_releases_fetchers() {
        let temp = TempResults::new(Duration::from_secs(60));
        let token = temp.reserve().unwrap();
        temp.close();
        assert!(matches!(temp.fetch(token), Err(Error::ShuttingDown)));
    }

    #[test]
    fn unfetched_results_expire() {
        let temp = TempResults::new(Duration::from_millis(20));
        let forgotten = temp.reserve().unwrap();
        temp.put(forgotten, Ok(Value::Int(1)));
        let pending = temp.reserve().unwrap();
        thread::sleep(Duration::from_millis(40));

        // expired entries are cleared out as new ones come in
        let fresh = temp.reserve().unwrap();
        assert_eq!(temp.len(), 2);
        assert_ne!(fresh, pending);

        // pending ones are kept however long they take
        temp.put(pending, Ok(Value::Int(2)));
        assert_eq!(temp.fetch(pending).unwrap(), Ok(Value::Int(2)));
        temp.put(fresh, Ok(Value::Int(3)));
        assert_eq!(temp.fetch(fresh).unwrap(), Ok(Value::Int(3)));
    }
}
