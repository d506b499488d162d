//! Handler running stateless jobs and keeping their records on disk.

use std::collections::VecDeque;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use fnv::FnvHashSet;

use spindle_core::{JobId, JobRecord, JobSpec, JobStatus, ResourceType, Value};

use crate::msg::worker::{Reply, WorkerRequest};
use crate::pool::WorkerPool;
use crate::server::{Call, Handler, ServerContext};
use crate::util::{lock, wait_for};
use crate::{Error, Result};

/// Directory of job records, one file per job.
#[derive(Debug, Clone)]
pub struct JobStore {
    dir: PathBuf,
}

impl JobStore {
    pub fn new(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    pub fn path(&self, id: &JobId) -> PathBuf {
        self.dir.join(format!("{}.job", id))
    }

    /// Writes the record, replacing the previous one atomically.
    pub fn write(&self, record: &JobRecord) -> Result<()> {
        let bytes = bincode::serialize(record)?;
        let tmp = self.dir.join(format!("{}.tmp", record.id));
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, self.path(&record.id))?;
        Ok(())
    }

    pub fn read(&self, id: &JobId) -> Result<Option<JobRecord>> {
        match fs::read(self.path(id)) {
            Ok(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Removes the record, returning false if there was none.
    pub fn erase(&self, id: &JobId) -> Result<bool> {
        match fs::remove_file(self.path(id)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// Jobs submitted through this handler that haven't completed yet.
#[derive(Default)]
struct InFlight {
    ids: Mutex<FnvHashSet<JobId>>,
    cond: Condvar,
}

impl InFlight {
    fn done(&self, id: &JobId) {
        lock(&self.ids).remove(id);
        self.cond.notify_all();
    }
}

/// Runs jobs on claimed workers, persisting each job's record as it moves
/// through its lifecycle.
///
/// Results are read back from the record files, so they stay available
/// to any handler using the same directory, also after a server restart.
pub struct JobHandler {
    store: Arc<JobStore>,
    in_flight: Arc<InFlight>,
}

impl JobHandler {
    pub fn new(dir: &Path) -> Result<Self> {
        Ok(Self {
            store: Arc::new(JobStore::new(dir)?),
            in_flight: Arc::new(InFlight::default()),
        })
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    /// Arguments: packed list of job specs, resource type and the number
    /// of workers to spread the jobs over.
    fn submit(&self, ctx: &Arc<ServerContext>, call: &Call) -> Result<Value> {
        let specs: Vec<JobSpec> = call.arg(0)?.unpack()?;
        let resource_type: ResourceType = call.arg(1)?.as_str()?.parse()?;
        let units = match call.args.get(2) {
            Some(v) => v.as_usize()?,
            None => specs.len(),
        };
        if specs.is_empty() {
            return Ok(Value::List(Vec::new()));
        }

        let pool = ctx.pool(resource_type)?.clone();
        let slots = pool.claim_idle_units(units.min(specs.len()));
        if slots.is_empty() {
            return Err(Error::PoolExhausted {
                requested: units,
                available: 0,
            });
        }

        let mut queue = VecDeque::with_capacity(specs.len());
        for spec in specs {
            let record = JobRecord::queued(&spec);
            if let Err(e) = self.store.write(&record) {
                pool.release(&slots);
                return Err(e);
            }
            lock(&self.in_flight.ids).insert(spec.id.clone());
            queue.push_back((spec, record));
        }
        let ids = queue
            .iter()
            .map(|(spec, _)| Value::from(spec.id.to_string()))
            .collect();
        info!(
            "queued {} job(s) on {} {} worker(s)",
            queue.len(),
            slots.len(),
            resource_type
        );

        let queue = Arc::new(Mutex::new(queue));
        for slot in slots {
            let runner = Runner {
                store: self.store.clone(),
                in_flight: self.in_flight.clone(),
                pool: pool.clone(),
                queue: queue.clone(),
                slot,
            };
            let spawned = thread::Builder::new()
                .name(format!("jobs-{}-{}", resource_type, slot))
                .spawn(move || runner.run());
            if let Err(e) = spawned {
                error!("failed spawning job runner: {}", e);
                pool.release(&[slot]);
            }
        }
        Ok(Value::List(ids))
    }

    fn get_status(&self, call: &Call) -> Result<Value> {
        let statuses = job_ids(call)?
            .iter()
            .map(|id| Ok(self.record(id)?.status))
            .collect::<Result<Vec<JobStatus>>>()?;
        Ok(Value::pack(&statuses)?)
    }

    /// Waits for the jobs to complete and returns their outcomes.
    fn get_results(&self, call: &Call) -> Result<Value> {
        let ids = job_ids(call)?;
        {
            let in_flight = lock(&self.in_flight.ids);
            let _in_flight = wait_for(&self.in_flight.cond, in_flight, |running| {
                ids.iter().all(|id| !running.contains(id))
            });
        }
        let mut replies: Vec<Reply> = Vec::with_capacity(ids.len());
        for id in &ids {
            let record = self.record(id)?;
            match record.result {
                Some(reply) if record.status.is_final() => replies.push(reply),
                _ => {
                    return Err(Error::InvalidState(format!(
                        "job {} is {} but not running on this server",
                        id, record.status
                    )))
                }
            }
        }
        Ok(Value::pack(&replies)?)
    }

    fn erase(&self, call: &Call) -> Result<Value> {
        let mut erased = 0;
        for id in job_ids(call)? {
            if self.store.erase(&id)? {
                erased += 1;
            }
        }
        debug!("erased {} job record(s)", erased);
        Ok(Value::from(erased as usize))
    }

    fn record(&self, id: &JobId) -> Result<JobRecord> {
        self.store
            .read(id)?
            .ok_or_else(|| Error::CoreError(spindle_core::Error::NoJob(id.to_string())))
    }
}

impl Handler for JobHandler {
    fn call(&self, ctx: &Arc<ServerContext>, method: &str, call: Call) -> Result<Value> {
        match method {
            "submit" => self.submit(ctx, &call),
            "get_status" => self.get_status(&call),
            "get_results" => self.get_results(&call),
            "erase" => self.erase(&call),
            _ => Err(Error::UnknownMethod(method.to_string())),
        }
    }
}

fn job_ids(call: &Call) -> Result<Vec<JobId>> {
    let mut ids = Vec::new();
    for v in call.arg(0)?.as_list()? {
        ids.push(v.as_str()?.parse()?);
    }
    Ok(ids)
}

/// Works through the shared queue on a single claimed worker.
struct Runner {
    store: Arc<JobStore>,
    in_flight: Arc<InFlight>,
    pool: Arc<WorkerPool>,
    queue: Arc<Mutex<VecDeque<(JobSpec, JobRecord)>>>,
    slot: usize,
}

impl Runner {
    fn run(self) {
        loop {
            let next = lock(&self.queue).pop_front();
            let (spec, mut record) = match next {
                Some(job) => job,
                None => break,
            };
            let id = spec.id.clone();
            if let Err(e) = self.run_one(spec, &mut record) {
                error!("job {}: {}", id, e);
            }
            self.in_flight.done(&id);
        }
        self.pool.release(&[self.slot]);
    }

    fn run_one(&self, spec: JobSpec, record: &mut JobRecord) -> Result<()> {
        record.advance(JobStatus::Processing)?;
        self.store.write(record)?;

        let context = format!("job {} ({})", spec.id, spec.function);
        let outcome = self
            .pool
            .request(self.slot, |ticket| WorkerRequest::RunJob {
                ticket,
                function: spec.function,
                args: spec.args,
                kwds: spec.kwds,
            })
            .and_then(|pending| pending.wait());
        let reply = match outcome {
            Ok(reply) => reply,
            Err(e) => {
                if let Error::WorkerLost(_) = e {
                    // bring the worker back for the remaining jobs
                    warn!("{}: {}, restarting worker {}", context, e, self.slot);
                    if let Err(e) = self.pool.restart_workers(&[self.slot], None) {
                        error!("failed restarting worker {}: {}", self.slot, e);
                    }
                }
                Err(e.to_remote(&context))
            }
        };
        match &reply {
            Ok(_) => debug!("{} finished", context),
            Err(e) => debug!("{} crashed: {}", context, e),
        }
        record.complete(reply)?;
        self.store.write(record)
    }
}
