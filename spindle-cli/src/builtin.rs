//! Tasks and jobs available on servers started from the command line.

use spindle::{Error, JobContext, Registry, Result, Task, TaskContext, Value};

/// Passes a value around: sends it down every outgoing tube, then collects
/// one value from every incoming tube.
#[derive(Default)]
pub struct Relay {
    value: Value,
}

impl Task for Relay {
    fn initialize(&mut self, ctx: &mut TaskContext, args: Vec<Value>) -> Result<()> {
        self.value = match args.into_iter().next() {
            Some(value) => value,
            None => Value::from(ctx.index()),
        };
        Ok(())
    }

    fn start(&mut self, ctx: &mut TaskContext) -> Result<Value> {
        let outgoing = ctx.outgoing().iter().map(|t| t.to_string()).collect::<Vec<_>>();
        for tube in outgoing {
            ctx.push(&tube, self.value.clone())?;
        }
        let incoming = ctx.incoming().iter().map(|t| t.to_string()).collect::<Vec<_>>();
        let mut received = Vec::with_capacity(incoming.len());
        for tube in incoming {
            received.push(ctx.pop(&tube)?);
        }
        Ok(Value::List(received))
    }
}

/// Reports where it runs.
#[derive(Default)]
pub struct Whoami;

impl Task for Whoami {
    fn start(&mut self, ctx: &mut TaskContext) -> Result<Value> {
        ctx.set_info(Value::from(std::process::id() as i64))?;
        Ok(Value::List(vec![
            Value::from(ctx.index()),
            Value::from(ctx.node_count()),
            Value::from(std::process::id() as i64),
        ]))
    }
}

fn square(_: &JobContext, args: Vec<Value>) -> Result<Value> {
    let x = args.get(0).ok_or(Error::MissingElement(0))?;
    match x {
        Value::Float(f) => Ok(Value::Float(f * f)),
        _ => {
            let i = x.as_int()?;
            Ok(Value::Int(i * i))
        }
    }
}

/// Sums all arguments, scaled by the optional `scale` keyword.
fn sum(ctx: &JobContext, args: Vec<Value>) -> Result<Value> {
    let mut total = 0.;
    for arg in &args {
        total += arg.as_float()?;
    }
    if let Some(scale) = ctx.kwd("scale") {
        total *= scale.as_float()?;
    }
    Ok(Value::Float(total))
}

fn pid(_: &JobContext, _: Vec<Value>) -> Result<Value> {
    Ok(Value::from(std::process::id() as i64))
}

pub fn registry() -> Registry {
    let mut registry = Registry::new();
    registry
        .task::<Relay>("relay")
        .task::<Whoami>("whoami")
        .job("square", square)
        .job("sum", sum)
        .job("pid", pid);
    registry
}
