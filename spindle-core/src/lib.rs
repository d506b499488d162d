//! This library implements the data model shared by every process taking part
//! in a `spindle` deployment.
//!
//! By itself, this library does not provide any networking capability. It
//! defines the structures used to describe distributed work: machines,
//! resource allocations, task topologies made up of nodes connected with
//! *tubes*, jobs with their persisted records, and the [`Registry`] of named
//! task and job implementations compiled into every worker image.
//! For the networking implementation see `spindle-net`.
//!
//! # Tasks and jobs
//!
//! A *task* is a stateful, topology-aware unit of work spanning one or more
//! nodes. Each node runs inside its own worker process and can exchange
//! values with its neighbours using named, directed, FIFO *tubes*.
//!
//! A *job* is a stateless, one-shot function call with a durable result that
//! can be polled independently of the call that submitted it.
//!
//! # Submitting work by reference
//!
//! Code is never shipped over the network. Instead, every worker is built
//! with the same [`Registry`], and controllers refer to implementations by
//! name:
//!
//! ```ignore
//! use spindle_core::{Registry, Value};
//!
//! let mut registry = Registry::new();
//! registry.job("square", |_ctx, args| {
//!     let x = args[0].as_int()?;
//!     Ok(Value::Int(x * x))
//! });
//! ```
//!
//! [`Registry`]: registry/struct.Registry.html

#[macro_use]
extern crate serde;
#[macro_use]
extern crate log;

pub use error::{Error, RemoteError, Result};
pub use job::{JobId, JobIdGenerator, JobRecord, JobSpec, JobStatus};
pub use machine::Machine;
pub use registry::{JobContext, Registry};
pub use resource::{distribute, Allocation, ResourceType};
pub use shared::SharedData;
pub use task::{Task, TaskContext, TubeIo};
pub use topology::{Node, NodeIndex, NodeTubes, Topology, Tube};
pub use value::{Value, ValueType};

pub mod error;
pub mod job;
pub mod machine;
pub mod registry;
pub mod resource;
pub mod shared;
pub mod task;
pub mod topology;
pub mod util;
pub mod value;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
