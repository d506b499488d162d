//! This library provides the networking side of `spindle`: everything needed
//! to spread tasks and jobs across worker processes on one or many machines.
//!
//! # Overview
//!
//! Each participating machine runs a [`Server`]. The server keeps a ledger of
//! the resource units (cpu cores, accelerators) it offers and of how many of
//! them each client has claimed. It also owns one [`WorkerPool`] per
//! resource type, a fixed set of long-lived worker processes that actually
//! run user code, so that a slow computation never stalls request handling.
//!
//! Clients talk to servers using remote procedure calls. A [`Procedure`] is
//! either addressed to one of the server's *native* methods (resource
//! management, handler lifecycle), or to a *handler*, a piece of server-side
//! state created lazily under an id chosen by the client. Two handler
//! classes are built in:
//!
//! - `sync` hosts a single distributed task, mapping its nodes onto workers
//!   and relaying the values nodes push into each other's tubes, also across
//!   machines.
//! - `jobs` runs stateless job functions and keeps their results on disk so
//!   they can be fetched long after the submitting call returned.
//!
//! On the client side, a [`Session`] ties this together: it allocates
//! resources across a list of machines, starts tasks and submits jobs,
//! handing back [`TaskRun`] and [`JobRun`] handles used to poll for status
//! and fetch results later.
//!
//! # Wire protocol
//!
//! All connections, including the ones between a pool and its workers, use
//! the same authenticated, length-framed [`Channel`]. The connecting side
//! proves knowledge of a shared secret first, then one request and one
//! response are exchanged, unless the client asked to keep the connection
//! open for more.
//!
//! # Worker processes
//!
//! Code is never sent over the network. Any program that wants to serve as
//! a worker calls [`worker::run_if_worker`] with its [`Registry`] at the top
//! of `main`:
//!
//! ```ignore
//! fn main() {
//!     spindle_net::worker::run_if_worker(&my_registry());
//!     // regular program continues here
//! }
//! ```
//!
//! [`Registry`]: spindle_core::Registry

#[macro_use]
extern crate serde;
#[macro_use]
extern crate log;

pub mod msg;
pub mod socket;
pub mod worker;

mod client;
mod error;
mod jobs;
mod pool;
mod resource;
mod run;
mod server;
mod sync;
mod util;

pub use client::{Client, ClientConfig, Clients};
pub use jobs::{JobHandler, JobStore};
pub use msg::{Procedure, Request, Response};
pub use pool::{Launcher, Pending, PoolConfig, TubeRouter, WorkerPool, WorkerRecord, WorkerStatus};
pub use resource::{allocate, ResourceLedger};
pub use run::{JobRun, Session, TaskRun};
pub use server::{
    Call, Handler, HandlerRegistry, Server, ServerConfig, ServerContext, ServerHandle,
};
pub use socket::{Channel, CompressionPolicy, Encoding, Secret, SocketConfig};
pub use sync::{SyncHandler, TaskState};

pub use error::{Error, Result};

pub use spindle_core as core;
