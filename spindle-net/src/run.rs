//! Client-side entry point for running tasks and jobs.

use std::collections::BTreeMap;

use fnv::FnvHashMap;

use spindle_core::{
    Allocation, JobId, JobIdGenerator, JobSpec, JobStatus, Machine, Node, NodeIndex,
    ResourceType, SharedData, Topology, Value,
};

use crate::client::{ClientConfig, Clients};
use crate::msg::worker::Reply;
use crate::msg::Procedure;
use crate::resource::allocate;
use crate::server::{Server, ServerConfig, ServerHandle};
use crate::sync::TaskState;
use crate::{Error, Result};

/// Controller's view of a cluster.
///
/// Holds the client configuration used for every call and, when work is
/// allocated without naming any machines, an embedded server running in
/// the current process.
pub struct Session {
    config: ClientConfig,
    server_config: ServerConfig,
    local: Option<ServerHandle>,
    ids: JobIdGenerator,
}

impl Session {
    pub fn new(config: ClientConfig) -> Self {
        Self::with_local_server(config, ServerConfig::default())
    }

    /// Creates a session that starts an embedded server with the given
    /// configuration if needed. The address and secret of the server are
    /// overridden to match the session.
    pub fn with_local_server(config: ClientConfig, server_config: ServerConfig) -> Self {
        Self {
            config,
            server_config,
            local: None,
            ids: JobIdGenerator::new(),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn local_server(&self) -> Option<&ServerHandle> {
        self.local.as_ref()
    }

    /// Allocates resource units across the machines. With no machines
    /// given, allocates on an embedded server started on first use.
    pub fn allocate(
        &mut self,
        machines: &[Machine],
        units: Option<usize>,
        resource_type: ResourceType,
    ) -> Result<Allocation> {
        if machines.is_empty() {
            let local = self.start_local()?;
            return allocate(&[local], units, resource_type, &self.config);
        }
        allocate(machines, units, resource_type, &self.config)
    }

    fn start_local(&mut self) -> Result<Machine> {
        if let Some(local) = &self.local {
            return Ok(local.machine());
        }
        let mut config = self.server_config.clone();
        config.address = "127.0.0.1:0".to_string();
        config.secret = self.config.secret.clone();
        let handle = Server::start(config)?;
        let machine = handle.machine();
        info!("started embedded server at {}", machine);
        self.local = Some(handle);
        Ok(machine)
    }

    /// Starts a task with one node per allocated unit. Nodes are numbered
    /// in allocation order and each gets the argument list at its index.
    pub fn start_task(
        &mut self,
        class: &str,
        allocation: &Allocation,
        topology: Topology,
        args: Vec<Vec<Value>>,
        shared: Option<SharedData>,
    ) -> Result<TaskRun> {
        let mut nodes = Vec::with_capacity(allocation.total_units());
        for (machine, units) in allocation.iter() {
            for _ in 0..*units {
                nodes.push(Node {
                    index: nodes.len(),
                    machine: machine.clone(),
                    resource_type: allocation.resource_type,
                    local_unit_index: None,
                });
            }
        }
        if nodes.is_empty() {
            return Err(Error::Other("can't start a task on an empty allocation".to_string()));
        }
        topology.validate(nodes.len())?;

        let mut run = TaskRun {
            task_id: spindle_core::util::random_id(16),
            machines: allocation.machines(),
            nodes,
            config: self.config.clone(),
        };
        if let Err(e) = run.launch(class, &topology, &args, &shared) {
            warn!("task {} failed to start: {}", run.task_id, e);
            if let Err(e) = run.close() {
                debug!("failed cleaning up task {}: {}", run.task_id, e);
            }
            return Err(e);
        }
        info!(
            "started task {} ({}) on {} node(s)",
            run.task_id,
            class,
            run.nodes.len()
        );
        Ok(run)
    }

    pub fn submit_jobs(
        &mut self,
        function: &str,
        args: Vec<Vec<Value>>,
        allocation: &Allocation,
    ) -> Result<JobRun> {
        self.submit_jobs_with(function, args, BTreeMap::new(), allocation)
    }

    /// Submits one job per argument list. Jobs are spread over the
    /// allocated units round-robin, every job gets the same keywords.
    pub fn submit_jobs_with(
        &mut self,
        function: &str,
        args: Vec<Vec<Value>>,
        kwds: BTreeMap<String, Value>,
        allocation: &Allocation,
    ) -> Result<JobRun> {
        let total = allocation.total_units();
        if total == 0 {
            return Err(Error::Other("can't submit jobs to an empty allocation".to_string()));
        }
        let mut batches: Vec<(Machine, usize, Vec<JobSpec>)> = allocation
            .iter()
            .map(|(m, units)| (m.clone(), *units, Vec::new()))
            .collect();
        let mut ids = Vec::with_capacity(args.len());
        for (j, args) in args.into_iter().enumerate() {
            let id = self.ids.next(function, &args);
            let mut unit = j % total;
            let batch = batches
                .iter_mut()
                .find(|(_, units, _)| {
                    if unit < *units {
                        true
                    } else {
                        unit -= units;
                        false
                    }
                })
                .ok_or_else(|| Error::Other("job assignment out of range".to_string()))?;
            ids.push(id.clone());
            batch.2.push(JobSpec {
                id,
                function: function.to_string(),
                args,
                kwds: kwds.clone(),
            });
        }
        batches.retain(|(_, _, specs)| !specs.is_empty());

        let machines = batches.iter().map(|(m, _, _)| m.clone()).collect::<Vec<_>>();
        let mut procedures = Vec::with_capacity(batches.len());
        let mut assignments = Vec::with_capacity(batches.len());
        for (machine, units, specs) in batches {
            procedures.push(
                Procedure::handler("jobs", None, "submit")
                    .arg(Value::pack(&specs)?)
                    .arg(allocation.resource_type.to_str())
                    .arg(units),
            );
            assignments.push((machine, specs.into_iter().map(|s| s.id).collect()));
        }
        Clients::new(&machines, &self.config).execute_each(procedures)?;
        info!(
            "submitted {} {} job(s) to {} machine(s)",
            ids.len(),
            function,
            machines.len()
        );
        Ok(JobRun {
            ids,
            assignments,
            config: self.config.clone(),
        })
    }

    /// Shuts the embedded server down, if there is one.
    pub fn shutdown(&mut self) -> Result<()> {
        match self.local.take() {
            Some(handle) => {
                handle.shutdown();
                handle.join()
            }
            None => Ok(()),
        }
    }
}

/// Handle to a started task.
#[derive(Debug, Clone)]
pub struct TaskRun {
    task_id: String,
    machines: Vec<Machine>,
    nodes: Vec<Node>,
    config: ClientConfig,
}

impl TaskRun {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn machines(&self) -> &[Machine] {
        &self.machines
    }

    /// Nodes of the task, with the worker slots they were placed on.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    fn clients(&self) -> Clients {
        Clients::new(&self.machines, &self.config)
    }

    fn procedure(&self, method: &str) -> Procedure {
        Procedure::handler("sync", Some(&self.task_id), method)
    }

    fn local_nodes<'a>(&'a self, machine: &'a Machine) -> impl Iterator<Item = &'a Node> + 'a {
        self.nodes.iter().filter(move |n| &n.machine == machine)
    }

    fn launch(
        &mut self,
        class: &str,
        topology: &Topology,
        args: &[Vec<Value>],
        shared: &Option<SharedData>,
    ) -> Result<()> {
        let mut clients = self.clients();
        let topology = Value::pack(topology)?;
        let nodes = Value::pack(&self.nodes)?;
        let shared = Value::pack(shared)?;
        let rt = self.nodes[0].resource_type;

        let submits = self
            .machines
            .iter()
            .map(|m| {
                let local = self.local_nodes(m).map(|n| Value::from(n.index)).collect();
                self.procedure("submit")
                    .arg(class)
                    .arg(topology.clone())
                    .arg(nodes.clone())
                    .arg(Value::List(local))
                    .arg(rt.to_str())
                    .arg(shared.clone())
            })
            .collect();
        let placed = clients.execute_each(submits)?;
        for (machine, slots) in self.machines.clone().iter().zip(placed) {
            let slots = slots.into_list()?;
            let local = self.nodes.iter_mut().filter(|n| &n.machine == machine);
            for (node, slot) in local.zip(slots) {
                node.local_unit_index = Some(slot.as_usize()?);
            }
        }

        let inits = self
            .machines
            .iter()
            .map(|m| {
                let per_node = self
                    .local_nodes(m)
                    .map(|n| Value::List(args.get(n.index).cloned().unwrap_or_default()))
                    .collect();
                self.procedure("initialize").arg(Value::List(per_node))
            })
            .collect();
        clients.execute_each(inits)?;
        clients.execute_all(&self.procedure("start"))?;
        Ok(())
    }

    /// State of the task on each machine.
    pub fn get_status(&self) -> Result<Vec<(Machine, TaskState)>> {
        let states = self.clients().execute_all(&self.procedure("status"))?;
        self.machines
            .iter()
            .zip(states)
            .map(|(m, s)| Ok((m.clone(), s.as_str()?.parse()?)))
            .collect()
    }

    /// Latest info snapshots of the nodes, best effort.
    pub fn get_info(&self) -> Result<BTreeMap<NodeIndex, Value>> {
        let mut infos = BTreeMap::new();
        for packed in self.clients().execute_all(&self.procedure("get_info"))? {
            let part: Vec<(NodeIndex, Value)> = packed.unpack()?;
            infos.extend(part);
        }
        Ok(infos)
    }

    /// Waits for all nodes to finish and returns their outcomes, ordered
    /// by node index.
    pub fn get_node_results(&self) -> Result<Vec<Reply>> {
        let mut outcomes: Vec<Option<Reply>> = vec![None; self.nodes.len()];
        let parts = self
            .clients()
            .execute_all(&self.procedure("get_result").defer())?;
        for packed in parts {
            let part: Vec<(NodeIndex, Reply)> = packed.unpack()?;
            for (node, reply) in part {
                if let Some(slot) = outcomes.get_mut(node) {
                    *slot = Some(reply);
                }
            }
        }
        outcomes
            .into_iter()
            .enumerate()
            .map(|(node, reply)| {
                reply.ok_or_else(|| Error::Other(format!("no result reported for node {}", node)))
            })
            .collect()
    }

    /// Waits for all nodes to finish and returns their results, failing
    /// with the first error raised by any node.
    pub fn get_result(&self) -> Result<Vec<Value>> {
        self.get_node_results()?
            .into_iter()
            .map(|reply| reply.map_err(Error::Remote))
            .collect()
    }

    /// Removes the task's handlers from all machines.
    pub fn close(&self) -> Result<()> {
        let procedures = vec![
            Procedure::native("delete_handler").arg(self.task_id.as_str());
            self.machines.len()
        ];
        let mut first_error = None;
        for (machine, outcome) in self
            .machines
            .iter()
            .zip(self.clients().execute_each_outcomes(procedures)?)
        {
            if let Err(e) = outcome {
                warn!("failed closing task {} on {}: {}", self.task_id, machine, e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Handle to a batch of submitted jobs.
#[derive(Debug, Clone)]
pub struct JobRun {
    /// Ids in submission order
    ids: Vec<JobId>,
    /// Ids of the jobs sent to each machine
    assignments: Vec<(Machine, Vec<JobId>)>,
    config: ClientConfig,
}

impl JobRun {
    pub fn ids(&self) -> &[JobId] {
        &self.ids
    }

    fn fan_out(&self, method: &str, deferred: bool) -> Result<Vec<(Vec<JobId>, Value)>> {
        let machines = self
            .assignments
            .iter()
            .map(|(m, _)| m.clone())
            .collect::<Vec<_>>();
        let procedures = self
            .assignments
            .iter()
            .map(|(_, ids)| {
                let ids = ids.iter().map(|id| Value::from(id.to_string())).collect();
                let procedure = Procedure::handler("jobs", None, method).arg(Value::List(ids));
                if deferred {
                    procedure.defer()
                } else {
                    procedure
                }
            })
            .collect();
        let values = Clients::new(&machines, &self.config).execute_each(procedures)?;
        Ok(self
            .assignments
            .iter()
            .map(|(_, ids)| ids.clone())
            .zip(values)
            .collect())
    }

    /// Puts per-machine answers back in submission order.
    fn in_order<T: serde::de::DeserializeOwned>(
        &self,
        parts: Vec<(Vec<JobId>, Value)>,
    ) -> Result<Vec<T>> {
        let mut by_id = FnvHashMap::default();
        for (ids, packed) in parts {
            let items: Vec<T> = packed.unpack()?;
            by_id.extend(ids.into_iter().zip(items));
        }
        self.ids
            .iter()
            .map(|id| {
                by_id
                    .remove(id)
                    .ok_or_else(|| Error::Other(format!("no answer for job {}", id)))
            })
            .collect()
    }

    /// Current status of every job, without waiting.
    pub fn get_status(&self) -> Result<Vec<JobStatus>> {
        let parts = self.fan_out("get_status", false)?;
        self.in_order(parts)
    }

    /// Waits for all jobs and returns their outcomes in submission order.
    pub fn get_outcomes(&self) -> Result<Vec<Reply>> {
        let parts = self.fan_out("get_results", true)?;
        self.in_order(parts)
    }

    /// Waits for all jobs and returns their results, failing with the
    /// first error raised by any job.
    pub fn get_results(&self) -> Result<Vec<Value>> {
        self.get_outcomes()?
            .into_iter()
            .map(|reply| reply.map_err(Error::Remote))
            .collect()
    }

    /// Deletes the job records, returning how many were removed.
    pub fn erase(&self) -> Result<usize> {
        let mut erased = 0;
        for (_, count) in self.fan_out("erase", false)? {
            erased += count.as_usize()?;
        }
        Ok(erased)
    }
}
