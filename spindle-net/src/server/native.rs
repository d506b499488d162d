//! Methods served by the server itself, without a handler.

use std::collections::BTreeMap;
use std::sync::Arc;

use spindle_core::resource::RESOURCE_TYPES;
use spindle_core::{ResourceType, Value};

use crate::server::{Call, ServerContext};
use crate::util::lock;
use crate::{Error, ResourceLedger, Result};

pub(crate) fn call(ctx: &Arc<ServerContext>, method: &str, call: Call) -> Result<Value> {
    match method {
        "ping" => Ok(Value::Unit),
        "request_resources" => request_resources(ctx, &call),
        "request_all_resources" => {
            let mut ledger = lock(&ctx.ledger);
            per_type(&call, |rt| ledger.request_all(&call.client, rt))
        }
        "get_available_resources" => {
            let ledger = lock(&ctx.ledger);
            per_type(&call, |rt| ledger.available(&call.client, rt))
        }
        "get_my_resources" => {
            let ledger = lock(&ctx.ledger);
            per_type(&call, |rt| ledger.mine(&call.client, rt))
        }
        "get_total_resources" => {
            let ledger = lock(&ctx.ledger);
            per_type(&call, |rt| ledger.total(rt))
        }
        "set_total_resources" => set_total_resources(ctx, &call),
        "get_resource_table" => {
            let rt = resource_type(call.arg(0)?)?;
            let table = lock(&ctx.ledger)
                .table(rt)
                .into_iter()
                .map(|(client, units)| (client, Value::from(units)))
                .collect::<BTreeMap<_, _>>();
            Ok(Value::Map(table))
        }
        "get_pool_status" => {
            let rt = resource_type(call.arg(0)?)?;
            Ok(Value::pack(&ctx.pool(rt)?.status())?)
        }
        "delete_handler" => {
            let id = match call.args.get(0) {
                Some(id) => id.as_str()?.to_string(),
                None => call.client.clone(),
            };
            Ok(Value::Bool(ctx.delete_handler(&id)))
        }
        "list_handlers" => Ok(Value::Map(
            ctx.list_handlers()
                .into_iter()
                .map(|(id, class)| (id, Value::String(class)))
                .collect(),
        )),
        _ => Err(Error::UnknownMethod(method.to_string())),
    }
}

fn resource_type(value: &Value) -> Result<ResourceType> {
    Ok(value.as_str()?.parse()?)
}

/// Applies the getter to the resource type given as the first argument,
/// or to every type when there's none.
fn per_type<F>(call: &Call, mut f: F) -> Result<Value>
where
    F: FnMut(ResourceType) -> usize,
{
    match call.args.get(0) {
        Some(rt) => Ok(Value::from(f(resource_type(rt)?))),
        None => Ok(Value::Map(
            RESOURCE_TYPES
                .iter()
                .map(|rt| (rt.to_str().to_string(), Value::from(f(*rt))))
                .collect(),
        )),
    }
}

/// Records the units requested per resource type, given as keywords, and
/// returns the granted amounts.
fn request_resources(ctx: &Arc<ServerContext>, call: &Call) -> Result<Value> {
    let mut requests = Vec::with_capacity(call.kwds.len());
    for (name, units) in &call.kwds {
        requests.push((name.parse::<ResourceType>()?, units.as_usize()?));
    }
    let mut ledger = lock(&ctx.ledger);
    let granted = requests
        .into_iter()
        .map(|(rt, units)| {
            let granted = ledger.request(&call.client, rt, units);
            (rt.to_str().to_string(), Value::from(granted))
        })
        .collect::<BTreeMap<_, _>>();
    log_request(&ledger, &call.client);
    Ok(Value::Map(granted))
}

fn log_request(ledger: &ResourceLedger, client: &str) {
    debug!(
        "{} now holds {} cpu and {} gpu unit(s)",
        client,
        ledger.mine(client, ResourceType::Cpu),
        ledger.mine(client, ResourceType::Gpu)
    );
}

/// Changes the advertised capacity, growing the worker pool if needed.
fn set_total_resources(ctx: &Arc<ServerContext>, call: &Call) -> Result<Value> {
    let rt = resource_type(call.arg(0)?)?;
    let units = call.arg(1)?.as_usize()?;
    ctx.pool(rt)?.ensure_size(units)?;
    lock(&ctx.ledger).set_total(rt, units);
    info!("total {} units set to {}", rt, units);
    Ok(Value::from(units))
}
