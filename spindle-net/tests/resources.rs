mod common;

use spindle_net::core::{ResourceType, Value};
use spindle_net::{Client, ClientConfig, Procedure, Session, WorkerRecord};

use common::*;

fn named(identity: &str) -> ClientConfig {
    ClientConfig {
        identity: Some(identity.to_string()),
        ..client_config()
    }
}

#[test]
fn request_is_idempotent() {
    let server = server(2);
    let mut client = Client::new(server.machine(), client_config());

    let available = client
        .execute(Procedure::native("get_available_resources").arg("cpu"))
        .unwrap();
    assert_eq!(available, Value::Int(2));

    for _ in 0..2 {
        let granted = client
            .execute(Procedure::native("request_resources").kwd("cpu", 2))
            .unwrap();
        assert_eq!(granted.get("cpu"), Some(&Value::Int(2)));
        let mine = client
            .execute(Procedure::native("get_my_resources").arg("cpu"))
            .unwrap();
        assert_eq!(mine, Value::Int(2));
    }
}

#[test]
fn others_see_what_is_left() {
    let server = server(3);
    let mut alice = Client::new(server.machine(), named("alice"));
    let mut bob = Client::new(server.machine(), named("bob"));

    let granted = alice
        .execute(Procedure::native("request_resources").kwd("cpu", 2))
        .unwrap();
    assert_eq!(granted.get("cpu"), Some(&Value::Int(2)));

    let granted = bob
        .execute(Procedure::native("request_all_resources").arg("cpu"))
        .unwrap();
    assert_eq!(granted, Value::Int(1));

    // alice's own claim doesn't count against her
    let available = alice
        .execute(Procedure::native("get_available_resources").arg("cpu"))
        .unwrap();
    assert_eq!(available, Value::Int(2));

    let table = alice
        .execute(Procedure::native("get_resource_table").arg("cpu"))
        .unwrap();
    let table = table.as_map().unwrap();
    assert_eq!(table.get("alice"), Some(&Value::Int(2)));
    assert_eq!(table.get("bob"), Some(&Value::Int(1)));

    // releasing by requesting zero
    alice
        .execute(Procedure::native("request_resources").kwd("cpu", 0))
        .unwrap();
    let available = bob
        .execute(Procedure::native("get_available_resources").arg("cpu"))
        .unwrap();
    assert_eq!(available, Value::Int(3));
}

#[test]
fn totals_per_resource_type() {
    let server = server(2);
    let mut client = Client::new(server.machine(), client_config());
    let totals = client
        .execute(Procedure::native("get_total_resources"))
        .unwrap();
    assert_eq!(totals.get("cpu"), Some(&Value::Int(2)));
    assert_eq!(totals.get("gpu"), Some(&Value::Int(0)));
}

#[test]
fn growing_total_grows_pool() {
    let server = server(1);
    let mut client = Client::new(server.machine(), client_config());
    let total = client
        .execute(Procedure::native("set_total_resources").arg("cpu").arg(3))
        .unwrap();
    assert_eq!(total, Value::Int(3));

    let total = client
        .execute(Procedure::native("get_total_resources").arg("cpu"))
        .unwrap();
    assert_eq!(total, Value::Int(3));

    let status = client
        .execute(Procedure::native("get_pool_status").arg("cpu"))
        .unwrap();
    let workers: Vec<WorkerRecord> = status.unpack().unwrap();
    assert_eq!(workers.len(), 3);
}

#[test]
fn allocate_fills_machines_in_order() {
    let first = server(2);
    let second = server(3);
    let machines = vec![first.machine(), second.machine()];

    let mut session = Session::new(named("controller"));
    let allocation = session
        .allocate(&machines, Some(4), ResourceType::Cpu)
        .unwrap();
    assert_eq!(allocation.total_units(), 4);
    assert_eq!(allocation.units_on(&first.machine()), 2);
    assert_eq!(allocation.units_on(&second.machine()), 2);

    let mut client = Client::new(second.machine(), named("controller"));
    let mine = client
        .execute(Procedure::native("get_my_resources").arg("cpu"))
        .unwrap();
    assert_eq!(mine, Value::Int(2));

    // what's left for someone else
    let mut other = Session::new(named("other"));
    let allocation = other
        .allocate(&machines, None, ResourceType::Cpu)
        .unwrap();
    assert_eq!(allocation.total_units(), 1);
    assert_eq!(allocation.machines(), vec![second.machine()]);
}

#[test]
fn allocation_skips_unneeded_machines() {
    let first = server(2);
    let second = server(2);
    let machines = vec![first.machine(), second.machine()];

    let mut session = Session::new(client_config());
    let allocation = session
        .allocate(&machines, Some(1), ResourceType::Cpu)
        .unwrap();
    assert_eq!(allocation.len(), 1);
    assert_eq!(allocation.machines(), vec![first.machine()]);

    let mut client = Client::new(second.machine(), client_config());
    let mine = client
        .execute(Procedure::native("get_my_resources").arg("cpu"))
        .unwrap();
    assert_eq!(mine, Value::Int(0));
}

#[test]
fn embedded_server_without_machines() {
    let mut session = Session::with_local_server(client_config(), server_config(2));
    assert!(session.local_server().is_none());
    let allocation = session.allocate(&[], None, ResourceType::Cpu).unwrap();
    assert_eq!(allocation.total_units(), 2);

    let local = session.local_server().unwrap().machine();
    assert_eq!(allocation.machines(), vec![local]);
    session.shutdown().unwrap();
    assert!(session.local_server().is_none());
}
