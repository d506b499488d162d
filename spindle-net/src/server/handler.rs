use std::collections::BTreeMap;
use std::sync::Arc;

use spindle_core::Value;

use crate::server::ServerContext;
use crate::{Error, JobHandler, Result, SyncHandler};

/// Arguments of a single handler method call.
#[derive(Debug, Clone, Default)]
pub struct Call {
    /// Identity of the calling client
    pub client: String,
    pub args: Vec<Value>,
    pub kwds: BTreeMap<String, Value>,
}

impl Call {
    /// Gets a positional argument, failing if it's missing.
    pub fn arg(&self, index: usize) -> Result<&Value> {
        self.args.get(index).ok_or_else(|| {
            Error::Other(format!(
                "missing argument at position {} (got {})",
                index,
                self.args.len()
            ))
        })
    }

    /// Takes a positional argument out of the call, leaving a unit value in
    /// its place.
    pub fn take(&mut self, index: usize) -> Result<Value> {
        self.arg(index)?;
        Ok(std::mem::take(&mut self.args[index]))
    }

    pub fn kwd(&self, name: &str) -> Option<&Value> {
        self.kwds.get(name)
    }
}

/// Server-side state addressed by an id, exposing methods callable over
/// RPC.
///
/// Methods take `&self` since calls from different sessions may arrive
/// concurrently. Implementations lock their own state as needed.
pub trait Handler: Send + Sync {
    fn call(&self, ctx: &Arc<ServerContext>, method: &str, call: Call) -> Result<Value>;

    /// Invoked when the handler is deleted or the server shuts down.
    fn close(&self) {}
}

type Constructor = Arc<dyn Fn(&Arc<ServerContext>, &str) -> Result<Arc<dyn Handler>> + Send + Sync>;

/// Handler classes known to a server, by name.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    classes: BTreeMap<String, Constructor>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry with the `sync` and `jobs` classes.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry
            .register("sync", |_, id| {
                Ok(Arc::new(SyncHandler::new(id)) as Arc<dyn Handler>)
            })
            .register("jobs", |ctx, _| {
                Ok(Arc::new(JobHandler::new(&ctx.config.job_dir)?) as Arc<dyn Handler>)
            });
        registry
    }

    /// Registers a handler class. The constructor gets the id the new
    /// handler will be stored under.
    pub fn register<F>(&mut self, class: &str, constructor: F) -> &mut Self
    where
        F: Fn(&Arc<ServerContext>, &str) -> Result<Arc<dyn Handler>> + Send + Sync + 'static,
    {
        self.classes.insert(class.to_string(), Arc::new(constructor));
        self
    }

    pub fn construct(
        &self,
        class: &str,
        ctx: &Arc<ServerContext>,
        id: &str,
    ) -> Result<Arc<dyn Handler>> {
        let constructor = self
            .classes
            .get(class)
            .ok_or_else(|| Error::UnknownHandlerClass(class.to_string()))?;
        constructor(ctx, id)
    }

    pub fn names(&self) -> Vec<&str> {
        self.classes.keys().map(|s| s.as_str()).collect()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("classes", &self.names())
            .finish()
    }
}
