//! Named task and job implementations.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::shared::SharedData;
use crate::task::Task;
use crate::value::Value;

type TaskFactory = Arc<dyn Fn() -> Box<dyn Task> + Send + Sync>;
type JobFn = Arc<dyn Fn(&JobContext, Vec<Value>) -> Result<Value> + Send + Sync>;

/// Environment available to a running job.
pub struct JobContext {
    pub kwds: BTreeMap<String, Value>,
    shared: Arc<SharedData>,
}

impl JobContext {
    pub fn new(kwds: BTreeMap<String, Value>, shared: Arc<SharedData>) -> Self {
        Self { kwds, shared }
    }

    pub fn kwd(&self, name: &str) -> Option<&Value> {
        self.kwds.get(name)
    }

    pub fn shared(&self) -> &SharedData {
        &self.shared
    }
}

/// Table of implementations every worker image is built with.
///
/// Controllers never send code, only names. A name that isn't present in the
/// worker's registry results in a remote error for that node or job.
#[derive(Clone, Default)]
pub struct Registry {
    tasks: BTreeMap<String, TaskFactory>,
    jobs: BTreeMap<String, JobFn>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a task type constructed with `Default`.
    pub fn task<T: Task + Default + 'static>(&mut self, name: &str) -> &mut Self {
        self.task_with(name, || Box::new(T::default()))
    }

    pub fn task_with<F>(&mut self, name: &str, factory: F) -> &mut Self
    where
        F: Fn() -> Box<dyn Task> + Send + Sync + 'static,
    {
        if self.tasks.insert(name.to_string(), Arc::new(factory)).is_some() {
            warn!("task \"{}\" registered more than once", name);
        }
        self
    }

    pub fn job<F>(&mut self, name: &str, function: F) -> &mut Self
    where
        F: Fn(&JobContext, Vec<Value>) -> Result<Value> + Send + Sync + 'static,
    {
        if self.jobs.insert(name.to_string(), Arc::new(function)).is_some() {
            warn!("job \"{}\" registered more than once", name);
        }
        self
    }

    pub fn make_task(&self, name: &str) -> Result<Box<dyn Task>> {
        let factory = self
            .tasks
            .get(name)
            .ok_or_else(|| Error::NoTask(name.to_string()))?;
        Ok(factory())
    }

    pub fn run_job(&self, name: &str, ctx: &JobContext, args: Vec<Value>) -> Result<Value> {
        let function = self
            .jobs
            .get(name)
            .ok_or_else(|| Error::NoJob(name.to_string()))?;
        function(ctx, args)
    }

    pub fn has_task(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }

    pub fn has_job(&self, name: &str) -> bool {
        self.jobs.contains_key(name)
    }

    pub fn task_names(&self) -> Vec<&str> {
        self.tasks.keys().map(|s| s.as_str()).collect()
    }

    pub fn job_names(&self) -> Vec<&str> {
        self.jobs.keys().map(|s| s.as_str()).collect()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("tasks", &self.task_names())
            .field("jobs", &self.job_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskContext;

    #[derive(Default)]
    struct Idle;

    impl Task for Idle {
        fn start(&mut self, _ctx: &mut TaskContext) -> Result<Value> {
            Ok(Value::Unit)
        }
    }

    #[test]
    fn lookup_by_name() {
        let mut registry = Registry::new();
        registry.task::<Idle>("idle").job("double", |_, args| {
            Ok(Value::Int(args[0].as_int()? * 2))
        });
        assert!(registry.has_task("idle"));
        assert!(registry.make_task("busy").is_err());

        let ctx = JobContext::new(BTreeMap::new(), Arc::new(SharedData::new()));
        let out = registry.run_job("double", &ctx, vec![Value::Int(21)]).unwrap();
        assert_eq!(out, Value::Int(42));
        match registry.run_job("triple", &ctx, vec![]) {
            Err(Error::NoJob(name)) => assert_eq!(name, "triple"),
            other => panic!("unexpected: {:?}", other),
        }
    }
}
