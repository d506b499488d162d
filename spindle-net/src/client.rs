use std::thread;
use std::time::{Duration, Instant};

use spindle_core::{Machine, Value};

use crate::msg::{Procedure, Request, Response, TempToken};
use crate::socket::{Channel, Secret, SocketConfig};
use crate::{Error, Result};

/// Configuration settings for client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Shared secret expected by the servers
    pub secret: Secret,
    /// Name announced to servers, defaults to the client's address as seen
    /// by the server
    pub identity: Option<String>,
    /// Number of attempts at completing a single call
    pub trials: u32,
    /// Total time limit for all attempts at a single call
    pub timeout: Duration,
    /// Delay before the first retry, doubled on each following one
    pub backoff: Duration,
    pub socket: SocketConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            secret: Secret::default(),
            identity: None,
            trials: 5,
            timeout: Duration::from_secs(10),
            backoff: Duration::from_millis(50),
            socket: SocketConfig::default(),
        }
    }
}

/// Connects to a single server.
///
/// By default a new connection is opened for every call and closed by the
/// server once it replies. After [`Client::connect`] the connection is kept
/// open until [`Client::disconnect`].
///
/// Calls interrupted by connection-level failures are retried with
/// exponential backoff within the configured trial count and timeout. A
/// retried call may end up being executed twice on the server.
pub struct Client {
    machine: Machine,
    config: ClientConfig,
    channel: Option<Channel>,
    persistent: bool,
}

impl Client {
    pub fn new(machine: Machine, config: ClientConfig) -> Self {
        Self {
            machine,
            config,
            channel: None,
            persistent: false,
        }
    }

    /// Creates a client that keeps its connection open, establishing it
    /// lazily on first call.
    pub fn persistent(machine: Machine, config: ClientConfig) -> Self {
        let mut client = Self::new(machine, config);
        client.persistent = true;
        client
    }

    pub fn machine(&self) -> &Machine {
        &self.machine
    }

    pub fn is_connected(&self) -> bool {
        self.channel.is_some()
    }

    /// Opens a connection and keeps it open for subsequent calls.
    pub fn connect(&mut self) -> Result<()> {
        self.persistent = true;
        if self.channel.is_none() {
            self.channel = Some(self.open()?);
        }
        Ok(())
    }

    /// Closes a kept connection, if any.
    pub fn disconnect(&mut self) -> Result<()> {
        self.persistent = false;
        if let Some(mut channel) = self.channel.take() {
            channel.send(&Request::CloseConnection)?;
            let _: Response = channel.recv()?;
            channel.shutdown();
        }
        Ok(())
    }

    /// Calls the procedure, re-raising any error from the remote end as
    /// `Error::Remote`.
    pub fn execute(&mut self, procedure: Procedure) -> Result<Value> {
        let method = procedure.method.clone();
        match self.request(Request::Call(procedure))? {
            Response::Done(value) => Ok(value),
            Response::Failed(e) => {
                debug!("{} raised on {}: {}", method, self.machine, e.trace);
                Err(Error::Remote(e))
            }
            Response::Deferred(token) => {
                // the server closes the connection after a deferred reply
                self.drop_channel();
                self.fetch_temp(token)
            }
            Response::Ack => Err(Error::UnexpectedResponse(format!(
                "got ack in response to {}",
                method
            ))),
        }
    }

    pub fn ping(&mut self) -> Result<()> {
        self.execute(Procedure::native("ping"))?;
        Ok(())
    }

    /// Asks the server to shut down.
    pub fn shutdown_server(&mut self) -> Result<()> {
        let response = self.request(Request::Shutdown)?;
        self.drop_channel();
        match response {
            Response::Ack => Ok(()),
            other => Err(Error::UnexpectedResponse(format!("{:?}", other))),
        }
    }

    fn fetch_temp(&mut self, token: TempToken) -> Result<Value> {
        match self.request(Request::FetchTemp(token))? {
            Response::Done(value) => Ok(value),
            Response::Failed(e) => Err(Error::Remote(e)),
            other => Err(Error::UnexpectedResponse(format!("{:?}", other))),
        }
    }

    fn open(&self) -> Result<Channel> {
        let mut channel = Channel::connect(
            &self.machine.address(),
            &self.config.secret,
            self.config.identity.clone(),
            self.config.socket,
        )?;
        if self.persistent {
            channel.send(&Request::KeepConnection)?;
            match channel.recv()? {
                Response::Ack => (),
                other => return Err(Error::UnexpectedResponse(format!("{:?}", other))),
            }
        }
        Ok(channel)
    }

    fn drop_channel(&mut self) {
        if let Some(channel) = self.channel.take() {
            channel.shutdown();
        }
    }

    /// Sends a request and waits for the response, retrying on transient
    /// connection errors.
    fn request(&mut self, request: Request) -> Result<Response> {
        let started = Instant::now();
        let mut delay = self.config.backoff;
        let mut trial = 0;
        loop {
            trial += 1;
            let result = match self.channel.take() {
                Some(channel) => Ok(channel),
                None => self.open(),
            }
            .and_then(|mut channel| {
                channel.send(&request)?;
                let response: Response = channel.recv()?;
                Ok((channel, response))
            });

            match result {
                Ok((channel, response)) => {
                    if self.persistent {
                        self.channel = Some(channel);
                    }
                    return Ok(response);
                }
                Err(e) if e.is_transient() => {
                    let out_of_time = started.elapsed() + delay >= self.config.timeout;
                    if trial >= self.config.trials || out_of_time {
                        warn!(
                            "giving up on {} after {} trial(s): {}",
                            self.machine, trial, e
                        );
                        return Err(Error::ConnectionFailed {
                            addr: self.machine.to_string(),
                            trials: trial,
                            last: e.to_string(),
                        });
                    }
                    debug!(
                        "trial {} with {} failed: {}, retrying in {}ms",
                        trial,
                        self.machine,
                        e,
                        delay.as_millis()
                    );
                    thread::sleep(delay);
                    delay *= 2;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if self.channel.is_some() {
            if let Err(e) = self.disconnect() {
                trace!("failed disconnecting from {}: {}", self.machine, e);
            }
        }
    }
}

/// Group of clients used to address many servers with a single call.
///
/// Calls are made concurrently, results are returned in the order of the
/// machines the group was created with.
pub struct Clients {
    clients: Vec<Client>,
}

impl Clients {
    pub fn new(machines: &[Machine], config: &ClientConfig) -> Self {
        Self {
            clients: machines
                .iter()
                .map(|m| Client::new(m.clone(), config.clone()))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn machines(&self) -> Vec<Machine> {
        self.clients.iter().map(|c| c.machine().clone()).collect()
    }

    /// Calls the same procedure on every server.
    pub fn execute_all(&mut self, procedure: &Procedure) -> Result<Vec<Value>> {
        let procedures = vec![procedure.clone(); self.clients.len()];
        self.execute_each(procedures)
    }

    /// Calls one procedure per server, failing with the first error.
    pub fn execute_each(&mut self, procedures: Vec<Procedure>) -> Result<Vec<Value>> {
        self.execute_each_outcomes(procedures)?.into_iter().collect()
    }

    /// Calls one procedure per server, collecting every outcome.
    pub fn execute_each_outcomes(
        &mut self,
        procedures: Vec<Procedure>,
    ) -> Result<Vec<Result<Value>>> {
        if procedures.len() != self.clients.len() {
            return Err(Error::Other(format!(
                "got {} procedures for {} clients",
                procedures.len(),
                self.clients.len()
            )));
        }
        let outcomes = thread::scope(|scope| {
            let handles = self
                .clients
                .iter_mut()
                .zip(procedures)
                .map(|(client, procedure)| scope.spawn(move || client.execute(procedure)))
                .collect::<Vec<_>>();
            handles
                .into_iter()
                .map(|handle| {
                    handle
                        .join()
                        .unwrap_or_else(|_| Err(Error::Other("client thread panicked".to_string())))
                })
                .collect::<Vec<_>>()
        });
        Ok(outcomes)
    }
}
