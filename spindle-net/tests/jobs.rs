mod common;

use std::collections::BTreeMap;
use std::thread;
use std::time::{Duration, Instant};

use spindle_net::core::{JobStatus, ResourceType, Value};
use spindle_net::{Error, Session};

use common::*;

fn single(xs: &[i64]) -> Vec<Vec<Value>> {
    xs.iter().map(|x| vec![Value::Int(*x)]).collect()
}

#[test]
fn jobs_run_to_completion() {
    let server = server(2);
    let mut session = Session::new(client_config());
    let allocation = session
        .allocate(&[server.machine()], None, ResourceType::Cpu)
        .unwrap();
    let run = session
        .submit_jobs("square", single(&[1, 2, 3, 4]), &allocation)
        .unwrap();
    assert_eq!(run.ids().len(), 4);

    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let statuses = run.get_status().unwrap();
        assert_eq!(statuses.len(), 4);
        if statuses.iter().all(|s| *s == JobStatus::Finished) {
            break;
        }
        assert!(Instant::now() < deadline, "jobs stuck at {:?}", statuses);
        thread::sleep(Duration::from_millis(20));
    }

    let results = run.get_results().unwrap();
    assert_eq!(
        results,
        vec![Value::Int(1), Value::Int(4), Value::Int(9), Value::Int(16)]
    );
}

#[test]
fn crashed_jobs_keep_their_error() {
    let server = server(1);
    let mut session = Session::new(client_config());
    let allocation = session
        .allocate(&[server.machine()], None, ResourceType::Cpu)
        .unwrap();
    let run = session
        .submit_jobs(
            "square",
            vec![vec![Value::Int(2)], vec![Value::from("x")], vec![]],
            &allocation,
        )
        .unwrap();

    let outcomes = run.get_outcomes().unwrap();
    assert_eq!(outcomes[0], Ok(Value::Int(4)));
    assert!(outcomes[1].is_err());
    assert!(outcomes[2].is_err());
    assert_eq!(
        run.get_status().unwrap(),
        vec![JobStatus::Finished, JobStatus::Crashed, JobStatus::Crashed]
    );
    assert!(matches!(run.get_results(), Err(Error::Remote(_))));
}

#[test]
fn keywords_are_passed_to_every_job() {
    let server = server(2);
    let mut session = Session::new(client_config());
    let allocation = session
        .allocate(&[server.machine()], None, ResourceType::Cpu)
        .unwrap();
    let mut kwds = BTreeMap::new();
    kwds.insert("factor".to_string(), Value::Int(10));
    let run = session
        .submit_jobs_with("scaled", single(&[1, 2, 3]), kwds, &allocation)
        .unwrap();
    assert_eq!(
        run.get_results().unwrap(),
        vec![Value::Int(10), Value::Int(20), Value::Int(30)]
    );
}

#[test]
fn jobs_spread_over_machines() {
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
        .submit_jobs("square", single(&[1, 2, 3, 4, 5]), &allocation)
        .unwrap();
    assert_eq!(
        run.get_results().unwrap(),
        vec![
            Value::Int(1),
            Value::Int(4),
            Value::Int(9),
            Value::Int(16),
            Value::Int(25)
        ]
    );
}

#[test]
fn erasing_removes_records() {
    let server = server(1);
    let mut session = Session::new(client_config());
    let allocation = session
        .allocate(&[server.machine()], None, ResourceType::Cpu)
        .unwrap();
    let run = session
        .submit_jobs("square", single(&[3, 4]), &allocation)
        .unwrap();
    run.get_results().unwrap();

    assert_eq!(run.erase().unwrap(), 2);
    assert_eq!(run.erase().unwrap(), 0);
    assert!(run.get_status().is_err());
}
