//! Resource types and allocations.

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde_repr::*;

use crate::error::{Error, Result};
use crate::machine::Machine;

/// Kind of resource unit a worker process is bound to.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize_repr, Deserialize_repr,
)]
#[repr(u8)]
pub enum ResourceType {
    /// Compute core
    Cpu,
    /// Accelerator
    Gpu,
}

/// List of all resource types.
pub const RESOURCE_TYPES: &[ResourceType; 2] = &[ResourceType::Cpu, ResourceType::Gpu];

impl ResourceType {
    pub fn to_str(&self) -> &'static str {
        match self {
            ResourceType::Cpu => "cpu",
            ResourceType::Gpu => "gpu",
        }
    }
}

impl FromStr for ResourceType {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "cpu" | "cpus" | "core" | "cores" => Ok(ResourceType::Cpu),
            "gpu" | "gpus" | "accelerator" => Ok(ResourceType::Gpu),
            _ => Err(Error::InvalidResourceType(s.to_string())),
        }
    }
}

impl Display for ResourceType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_str())
    }
}

/// Mapping of machines to granted resource units for one client.
///
/// Entries are kept in the order they were added. Machines assigned zero
/// units are never stored, so `total_units` always equals the sum of the
/// stored counts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub resource_type: ResourceType,
    entries: Vec<(Machine, usize)>,
}

impl Allocation {
    pub fn new(resource_type: ResourceType) -> Self {
        Self {
            resource_type,
            entries: Vec::new(),
        }
    }

    /// Adds units on a machine, merging with an existing entry for the same
    /// machine.
    pub fn add(&mut self, machine: Machine, units: usize) {
        if units == 0 {
            return;
        }
        if let Some((_, count)) = self.entries.iter_mut().find(|(m, _)| m == &machine) {
            *count += units;
        } else {
            self.entries.push((machine, units));
        }
    }

    pub fn total_units(&self) -> usize {
        self.entries.iter().map(|(_, c)| c).sum()
    }

    pub fn units_on(&self, machine: &Machine) -> usize {
        self.entries
            .iter()
            .find(|(m, _)| m == machine)
            .map(|(_, c)| *c)
            .unwrap_or(0)
    }

    pub fn machines(&self) -> Vec<Machine> {
        self.entries.iter().map(|(m, _)| m.clone()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(Machine, usize)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Computes an allocation out of the idle capacity reported by each machine.
///
/// Machines are visited in list order, each receiving as many of the
/// remaining requested units as it has idle. Once the request is satisfied,
/// the machines further down the list receive nothing and are left out of
/// the allocation. With no explicit request all idle capacity is taken.
///
/// The result always satisfies
/// `total_units == min(requested, sum(idle))`.
pub fn distribute(
    idle: &[(Machine, usize)],
    requested: Option<usize>,
    resource_type: ResourceType,
) -> Allocation {
    let available: usize = idle.iter().map(|(_, c)| c).sum();
    let mut remaining = match requested {
        Some(r) => r.min(available),
        None => available,
    };
    let mut allocation = Allocation::new(resource_type);
    for (machine, count) in idle {
        if remaining == 0 {
            break;
        }
        let granted = (*count).min(remaining);
        allocation.add(machine.clone(), granted);
        remaining -= granted;
    }
    allocation
}

#[cfg(test)]
mod tests {
    use super::*;

    fn idle(counts: &[usize]) -> Vec<(Machine, usize)> {
        counts
            .iter()
            .enumerate()
            .map(|(n, c)| (Machine::local(3000 + n as u16), *c))
            .collect()
    }

    #[test]
    fn distribute_takes_everything_by_default() {
        let alloc = distribute(&idle(&[2, 0, 3]), None, ResourceType::Cpu);
        assert_eq!(alloc.total_units(), 5);
        // zero-unit machine omitted
        assert_eq!(alloc.len(), 2);
    }

    #[test]
    fn distribute_truncates_last_machines() {
        let machines = idle(&[2, 2, 2]);
        let alloc = distribute(&machines, Some(3), ResourceType::Cpu);
        assert_eq!(alloc.total_units(), 3);
        assert_eq!(alloc.units_on(&machines[0].0), 2);
        assert_eq!(alloc.units_on(&machines[1].0), 1);
        assert_eq!(alloc.units_on(&machines[2].0), 0);
        assert_eq!(alloc.machines().len(), 2);
    }

    #[test]
    fn distribute_never_exceeds_bounds() {
        for requested in 0..10 {
            for counts in &[vec![], vec![0], vec![1, 4], vec![3, 3, 3]] {
                let machines = idle(counts);
                let available: usize = counts.iter().sum();
                let alloc = distribute(&machines, Some(requested), ResourceType::Gpu);
                assert!(alloc.total_units() <= requested);
                assert!(alloc.total_units() <= available);
                assert_eq!(alloc.total_units(), requested.min(available));
            }
        }
    }

    #[test]
    fn resource_type_parse() {
        assert_eq!("CPU".parse::<ResourceType>().unwrap(), ResourceType::Cpu);
        assert_eq!("gpu".parse::<ResourceType>().unwrap(), ResourceType::Gpu);
        assert!("tpu".parse::<ResourceType>().is_err());
    }
}
