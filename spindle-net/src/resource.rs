//! Per-machine resource accounting and client-side allocation.

use std::collections::BTreeMap;

use spindle_core::{distribute, Allocation, Machine, ResourceType};

use crate::client::{ClientConfig, Clients};
use crate::msg::Procedure;
use crate::Result;

/// Bookkeeping of total and per-client allocated units on one machine.
///
/// Allocations are advisory. Requests are clamped to the total but never
/// checked against what other clients hold, so concurrent requests for the
/// last idle units all succeed and the ledger simply records the latest
/// value for each client.
#[derive(Debug, Clone, Default)]
pub struct ResourceLedger {
    totals: BTreeMap<ResourceType, usize>,
    allocations: BTreeMap<ResourceType, BTreeMap<String, usize>>,
}

impl ResourceLedger {
    pub fn new(cpu: usize, gpu: usize) -> Self {
        let mut ledger = Self::default();
        ledger.totals.insert(ResourceType::Cpu, cpu);
        ledger.totals.insert(ResourceType::Gpu, gpu);
        ledger
    }

    pub fn total(&self, resource_type: ResourceType) -> usize {
        self.totals.get(&resource_type).copied().unwrap_or(0)
    }

    pub fn set_total(&mut self, resource_type: ResourceType, units: usize) {
        self.totals.insert(resource_type, units);
    }

    /// Sum of units held by clients other than the given one.
    pub fn others(&self, client: &str, resource_type: ResourceType) -> usize {
        self.allocations
            .get(&resource_type)
            .map(|clients| {
                clients
                    .iter()
                    .filter(|(c, _)| c.as_str() != client)
                    .map(|(_, n)| n)
                    .sum()
            })
            .unwrap_or(0)
    }

    /// Records the client's allocation, saturating at the total. Returns the
    /// number of units granted.
    pub fn request(&mut self, client: &str, resource_type: ResourceType, units: usize) -> usize {
        let granted = units.min(self.total(resource_type));
        let clients = self.allocations.entry(resource_type).or_default();
        if granted == 0 {
            clients.remove(client);
        } else {
            clients.insert(client.to_string(), granted);
        }
        granted
    }

    /// Requests everything not held by other clients.
    pub fn request_all(&mut self, client: &str, resource_type: ResourceType) -> usize {
        let available = self.available(client, resource_type);
        self.request(client, resource_type, available)
    }

    /// Units available to the client, including the ones it already holds.
    pub fn available(&self, client: &str, resource_type: ResourceType) -> usize {
        self.total(resource_type)
            .saturating_sub(self.others(client, resource_type))
    }

    pub fn mine(&self, client: &str, resource_type: ResourceType) -> usize {
        self.allocations
            .get(&resource_type)
            .and_then(|clients| clients.get(client))
            .copied()
            .unwrap_or(0)
    }

    pub fn table(&self, resource_type: ResourceType) -> BTreeMap<String, usize> {
        self.allocations
            .get(&resource_type)
            .cloned()
            .unwrap_or_default()
    }
}

/// Allocates resource units across the given machines.
///
/// Queries every machine for the units available to this client, computes
/// the allocation using [`distribute`], then claims the chosen units on each
/// machine. Machines that end up with nothing have their claim for this
/// resource type reset to zero.
pub fn allocate(
    machines: &[Machine],
    units: Option<usize>,
    resource_type: ResourceType,
    config: &ClientConfig,
) -> Result<Allocation> {
    let mut clients = Clients::new(machines, config);
    let available = clients.execute_all(
        &Procedure::native("get_available_resources").arg(resource_type.to_str()),
    )?;
    let mut idle = Vec::with_capacity(machines.len());
    for (machine, count) in machines.iter().zip(available) {
        idle.push((machine.clone(), count.as_usize()?));
    }
    let allocation = distribute(&idle, units, resource_type);
    debug!(
        "allocating {} {} unit(s) across {} machine(s) (requested: {:?})",
        allocation.total_units(),
        resource_type,
        allocation.len(),
        units
    );

    let requests = machines
        .iter()
        .map(|m| {
            Procedure::native("request_resources")
                .kwd(resource_type.to_str(), allocation.units_on(m))
        })
        .collect();
    let granted = clients.execute_each(requests)?;
    for (machine, granted) in machines.iter().zip(granted) {
        let granted = granted
            .get(resource_type.to_str())
            .map(|v| v.as_usize())
            .transpose()?
            .unwrap_or(0);
        if granted != allocation.units_on(machine) {
            warn!(
                "{} granted {} {} unit(s), expected {}",
                machine,
                granted,
                resource_type,
                allocation.units_on(machine)
            );
        }
    }
    Ok(allocation)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_saturates_at_total() {
        let mut ledger = ResourceLedger::new(4, 0);
        assert_eq!(ledger.request("a", ResourceType::Cpu, 10), 4);
        assert_eq!(ledger.request("a", ResourceType::Gpu, 1), 0);
        assert_eq!(ledger.mine("a", ResourceType::Cpu), 4);
    }

    #[test]
    fn availability_excludes_only_others() {
        let mut ledger = ResourceLedger::new(4, 0);
        ledger.request("a", ResourceType::Cpu, 1);
        ledger.request("b", ResourceType::Cpu, 2);
        assert_eq!(ledger.available("a", ResourceType::Cpu), 2);
        assert_eq!(ledger.available("b", ResourceType::Cpu), 3);
        assert_eq!(ledger.available("c", ResourceType::Cpu), 1);
        assert_eq!(ledger.request_all("c", ResourceType::Cpu), 1);
        assert_eq!(ledger.available("c", ResourceType::Cpu), 1);
        assert_eq!(ledger.table(ResourceType::Cpu).len(), 3);
    }

    #[test]
    fn shrinking_total_never_underflows() {
        let mut ledger = ResourceLedger::new(4, 0);
        ledger.request("a", ResourceType::Cpu, 4);
        ledger.set_total(ResourceType::Cpu, 2);
        assert_eq!(ledger.available("b", ResourceType::Cpu), 0);
        // releasing removes the entry altogether
        ledger.request("a", ResourceType::Cpu, 0);
        assert!(ledger.table(ResourceType::Cpu).is_empty());
    }
}
