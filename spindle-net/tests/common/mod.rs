#![allow(dead_code)]

use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use spindle_net::core::{Error as CoreError, JobContext, Registry, Task, TaskContext, Value};
use spindle_net::{
    ClientConfig, HandlerRegistry, Launcher, Secret, Server, ServerConfig, ServerHandle,
};

pub const SECRET: &str = "test secret";

/// Pushes its initialization value down every outgoing tube, then pops one
/// value from every incoming tube and returns them.
#[derive(Default)]
pub struct Exchange {
    value: Value,
}

impl Task for Exchange {
    fn initialize(&mut self, ctx: &mut TaskContext, args: Vec<Value>) -> spindle_net::core::Result<()> {
        self.value = args
            .into_iter()
            .next()
            .unwrap_or_else(|| Value::from(ctx.index()));
        Ok(())
    }

    fn start(&mut self, ctx: &mut TaskContext) -> spindle_net::core::Result<Value> {
        for tube in ctx.outgoing().iter().map(|t| t.to_string()).collect::<Vec<_>>() {
            ctx.push(&tube, self.value.clone())?;
        }
        let mut popped = Vec::new();
        for tube in ctx.incoming().iter().map(|t| t.to_string()).collect::<Vec<_>>() {
            popped.push(ctx.pop(&tube)?);
        }
        Ok(Value::List(popped))
    }
}

/// Streams a number of integers through tube "s", returning what was
/// received.
#[derive(Default)]
pub struct Stream {
    count: i64,
}

impl Task for Stream {
    fn initialize(&mut self, _ctx: &mut TaskContext, args: Vec<Value>) -> spindle_net::core::Result<()> {
        self.count = args.get(0).map(|v| v.as_int()).transpose()?.unwrap_or(100);
        Ok(())
    }

    fn start(&mut self, ctx: &mut TaskContext) -> spindle_net::core::Result<Value> {
        let mut received = Vec::new();
        if ctx.outgoing().contains(&"s") {
            for n in 0..self.count {
                ctx.push("s", n)?;
            }
        }
        if ctx.incoming().contains(&"s") {
            for _ in 0..self.count {
                received.push(ctx.pop("s")?);
            }
        }
        Ok(Value::List(received))
    }
}

/// Sums the shared array "xs".
#[derive(Default)]
pub struct SharedSum;

impl Task for SharedSum {
    fn start(&mut self, ctx: &mut TaskContext) -> spindle_net::core::Result<Value> {
        Ok(Value::Float(ctx.shared().get_f64s("xs")?.iter().sum()))
    }
}

/// Fails on odd nodes.
#[derive(Default)]
pub struct FailOdd;

impl Task for FailOdd {
    fn start(&mut self, ctx: &mut TaskContext) -> spindle_net::core::Result<Value> {
        if ctx.index() % 2 == 1 {
            return Err(CoreError::TaskFailed(format!("node {} is odd", ctx.index())));
        }
        Ok(Value::from(ctx.index()))
    }
}

/// Publishes its progress as info while counting to ten.
#[derive(Default)]
pub struct Ticker;

impl Task for Ticker {
    fn start(&mut self, ctx: &mut TaskContext) -> spindle_net::core::Result<Value> {
        for i in 0..=10 {
            ctx.set_info(i)?;
            thread::sleep(Duration::from_millis(5));
        }
        Ok(Value::Unit)
    }
}

/// Waits on tube "never", which nobody feeds.
#[derive(Default)]
pub struct Stuck;

impl Task for Stuck {
    fn start(&mut self, ctx: &mut TaskContext) -> spindle_net::core::Result<Value> {
        ctx.pop("never")
    }
}

pub fn registry() -> Registry {
    let mut registry = Registry::new();
    registry
        .task::<Exchange>("exchange")
        .task::<Stream>("stream")
        .task::<SharedSum>("shared_sum")
        .task::<FailOdd>("fail_odd")
        .task::<Ticker>("ticker")
        .task::<Stuck>("stuck")
        .job("square", |_: &JobContext, args: Vec<Value>| {
            let x = args
                .get(0)
                .ok_or(CoreError::MissingElement(0))?
                .as_int()?;
            Ok(Value::Int(x * x))
        })
        .job("scaled", |ctx: &JobContext, args: Vec<Value>| {
            let factor = ctx.kwd("factor").map(|f| f.as_int()).transpose()?.unwrap_or(1);
            Ok(Value::Int(args[0].as_int()? * factor))
        });
    registry
}

pub fn job_dir() -> PathBuf {
    std::env::temp_dir().join(format!(
        "spindle-test-jobs-{}",
        spindle_net::core::util::random_id(6)
    ))
}

pub fn server_config(cpu: usize) -> ServerConfig {
    ServerConfig {
        address: "127.0.0.1:0".to_string(),
        secret: Secret::new(SECRET),
        cpu: Some(cpu),
        gpu: Some(0),
        launcher: Launcher::Thread(registry()),
        job_dir: job_dir(),
        shutdown_grace: Duration::from_millis(200),
        relay_trials: 3,
        relay_timeout: Duration::from_secs(2),
        ..ServerConfig::default()
    }
}

pub fn server(cpu: usize) -> ServerHandle {
    Server::start(server_config(cpu)).unwrap()
}

pub fn server_with(cpu: usize, classes: HandlerRegistry) -> ServerHandle {
    Server::start_with(server_config(cpu), classes).unwrap()
}

pub fn client_config() -> ClientConfig {
    ClientConfig {
        secret: Secret::new(SECRET),
        trials: 3,
        timeout: Duration::from_secs(2),
        ..ClientConfig::default()
    }
}

pub fn init_logging() {
    let _ = simplelog::TestLogger::init(simplelog::LevelFilter::Debug, simplelog::Config::default());
}
