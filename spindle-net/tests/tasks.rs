mod common;

use std::thread;
use std::time::Duration;

use spindle_net::core::{ResourceType, SharedData, Topology, Value};
use spindle_net::{Client, Error, Procedure, Session, TaskState};

use common::*;

fn ints(range: std::ops::Range<i64>) -> Value {
    Value::List(range.map(Value::Int).collect())
}

#[test]
fn values_flow_between_nodes() {
    let server = server(2);
    let mut session = Session::new(client_config());
    let allocation = session
        .allocate(&[server.machine()], Some(2), ResourceType::Cpu)
        .unwrap();
    let topology = Topology::new().with("t", 0, 1);
    let run = session
        .start_task(
            "exchange",
            &allocation,
            topology,
            vec![vec![Value::Int(7)], vec![]],
            None,
        )
        .unwrap();

    let results = run.get_result().unwrap();
    assert_eq!(
        results,
        vec![Value::List(vec![]), Value::List(vec![Value::Int(7)])]
    );
    for (_, state) in run.get_status().unwrap() {
        assert_eq!(state, TaskState::Finished);
    }
    assert!(run.nodes().iter().all(|n| n.local_unit_index.is_some()));
    run.close().unwrap();
}

#[test]
fn tubes_keep_order() {
    let server = server(2);
    let mut session = Session::new(client_config());
    let allocation = session
        .allocate(&[server.machine()], Some(2), ResourceType::Cpu)
        .unwrap();
    let run = session
        .start_task(
            "stream",
            &allocation,
            Topology::new().with("s", 0, 1),
            vec![vec![Value::Int(200)], vec![Value::Int(200)]],
            None,
        )
        .unwrap();
    let results = run.get_result().unwrap();
    assert_eq!(results[0], Value::List(vec![]));
    assert_eq!(results[1], ints(0..200));
}

#[test]
fn values_are_relayed_across_machines() {
    init_logging();
    let first = server(1);
    let second = server(1);
    let mut session = Session::new(client_config());
    let allocation = session
        .allocate(
            &[first.machine(), second.machine()],
            None,
            ResourceType::Cpu,
        )
        .unwrap();
    assert_eq!(allocation.len(), 2);

    let topology = Topology::new().with("ping", 0, 1).with("pong", 1, 0);
    let run = session
        .start_task(
            "exchange",
            &allocation,
            topology,
            vec![vec![Value::from("a")], vec![Value::from("b")]],
            None,
        )
        .unwrap();
    assert_eq!(run.machines().len(), 2);

    let results = run.get_result().unwrap();
    assert_eq!(
        results,
        vec![
            Value::List(vec![Value::from("b")]),
            Value::List(vec![Value::from("a")])
        ]
    );
    run.close().unwrap();
}

#[test]
fn streams_are_relayed_in_order() {
    let first = server(1);
    let second = server(1);
    let mut session = Session::new(client_config());
    let allocation = session
        .allocate(
            &[first.machine(), second.machine()],
            None,
            ResourceType::Cpu,
        )
        .unwrap();
    let run = session
        .start_task(
            "stream",
            &allocation,
            Topology::new().with("s", 0, 1),
            vec![vec![Value::Int(50)], vec![Value::Int(50)]],
            None,
        )
        .unwrap();
    let results = run.get_result().unwrap();
    assert_eq!(results[1], ints(0..50));
}

#[test]
fn shared_data_reaches_every_node() {
    let server = server(2);
    let mut session = Session::new(client_config());
    let allocation = session
        .allocate(&[server.machine()], None, ResourceType::Cpu)
        .unwrap();
    let mut shared = SharedData::new();
    shared.insert_f64s("xs", &[1.0, 2.0, 3.5]);

    let run = session
        .start_task("shared_sum", &allocation, Topology::new(), vec![], Some(shared))
        .unwrap();
    assert_eq!(
        run.get_result().unwrap(),
        vec![Value::Float(6.5), Value::Float(6.5)]
    );
}

#[test]
fn failing_nodes_report_their_own_error() {
    let server = server(2);
    let mut session = Session::new(client_config());
    let allocation = session
        .allocate(&[server.machine()], None, ResourceType::Cpu)
        .unwrap();
    let run = session
        .start_task("fail_odd", &allocation, Topology::new(), vec![], None)
        .unwrap();

    let outcomes = run.get_node_results().unwrap();
    assert_eq!(outcomes.len(), 2);
    assert_eq!(outcomes[0], Ok(Value::Int(0)));
    match &outcomes[1] {
        Err(e) => assert!(e.message.contains("node 1 is odd"), "{}", e.message),
        Ok(v) => panic!("expected failure, got {:?}", v),
    }

    match run.get_result() {
        Err(Error::Remote(e)) => assert!(e.message.contains("node 1 is odd")),
        other => panic!("expected remote error, got {:?}", other),
    }
}

#[test]
fn info_is_kept_after_finishing() {
    let server = server(1);
    let mut session = Session::new(client_config());
    let allocation = session
        .allocate(&[server.machine()], Some(1), ResourceType::Cpu)
        .unwrap();
    let run = session
        .start_task("ticker", &allocation, Topology::new(), vec![], None)
        .unwrap();
    run.get_result().unwrap();

    let info = run.get_info().unwrap();
    assert_eq!(info.len(), 1);
    assert_eq!(info.get(&0), Some(&Value::Int(10)));
}

#[test]
fn unknown_task_class_fails_to_start() {
    let server = server(1);
    let mut session = Session::new(client_config());
    let allocation = session
        .allocate(&[server.machine()], Some(1), ResourceType::Cpu)
        .unwrap();
    let err = session
        .start_task("no_such_task", &allocation, Topology::new(), vec![], None)
        .unwrap_err();
    assert!(err.to_string().contains("no_such_task"), "{}", err);

    // the worker is given back
    let run = session
        .start_task("ticker", &allocation, Topology::new(), vec![], None)
        .unwrap();
    run.get_result().unwrap();
}

#[test]
fn lifecycle_steps_must_come_in_order() {
    let server = server(1);
    let mut client = Client::new(server.machine(), client_config());
    let start = Procedure::handler("sync", Some("out-of-order"), "start");
    let err = client.execute(start).unwrap_err();
    assert!(matches!(err, Error::Remote(_)));
    assert!(err.to_string().contains("invalid state"), "{}", err);

    let err = client
        .execute(Procedure::handler("sync", Some("out-of-order"), "get_result"))
        .unwrap_err();
    assert!(err.to_string().contains("invalid state"), "{}", err);

    let status = client
        .execute(Procedure::handler("sync", Some("out-of-order"), "status"))
        .unwrap();
    assert_eq!(status, Value::from("new"));
}

#[test]
fn waiting_client_fails_when_server_dies() {
    let server = server(2);
    let mut session = Session::new(client_config());
    let allocation = session
        .allocate(&[server.machine()], None, ResourceType::Cpu)
        .unwrap();
    let topology = Topology::new().with("never", 0, 1).with("never", 1, 0);
    let run = session
        .start_task("stuck", &allocation, topology, vec![], None)
        .unwrap();

    let waiter = thread::spawn(move || run.get_result());
    thread::sleep(Duration::from_millis(300));
    server.kill();
    let outcome = waiter.join().unwrap();
    assert!(
        matches!(outcome, Err(Error::ConnectionFailed { .. })),
        "got {:?}",
        outcome
    );
}
