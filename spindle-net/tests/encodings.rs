mod common;

use spindle_net::core::{ResourceType, Topology, Value};
use spindle_net::{CompressionPolicy, Server, Session, SocketConfig};
#[cfg(any(feature = "msgpack_encoding", feature = "json_encoding"))]
use spindle_net::Encoding;

use common::*;

/// Runs a task and a batch of jobs on a server whose clients and workers
/// all talk with the given socket settings.
fn tasks_and_jobs_with(socket: SocketConfig) {
    let mut config = server_config(2);
    config.socket = socket;
    let server = Server::start(config).unwrap();

    let mut client = client_config();
    client.socket = socket;
    let mut session = Session::new(client);
    let allocation = session
        .allocate(&[server.machine()], Some(2), ResourceType::Cpu)
        .unwrap();

    // large enough to be compressed when the policy has a threshold
    let payload = Value::List((0..20_000).map(Value::Int).collect());
    let run = session
        .start_task(
            "exchange",
            &allocation,
            Topology::new().with("t", 0, 1),
            vec![vec![payload.clone()], vec![]],
            None,
        )
        .unwrap();
    assert_eq!(
        run.get_result().unwrap(),
        vec![Value::List(vec![]), Value::List(vec![payload])]
    );
    run.close().unwrap();

    let jobs = session
        .submit_jobs(
            "square",
            (1..=4).map(|i| vec![Value::Int(i)]).collect(),
            &allocation,
        )
        .unwrap();
    assert_eq!(
        jobs.get_results().unwrap(),
        vec![Value::Int(1), Value::Int(4), Value::Int(9), Value::Int(16)]
    );
    jobs.erase().unwrap();
    server.shutdown();
}

#[test]
fn bincode_without_compression() {
    tasks_and_jobs_with(SocketConfig {
        compression: CompressionPolicy::Nothing,
        ..SocketConfig::default()
    });
}

#[cfg(feature = "lz4")]
#[test]
fn bincode_compressing_everything() {
    tasks_and_jobs_with(SocketConfig {
        compression: CompressionPolicy::Everything,
        ..SocketConfig::default()
    });
}

#[cfg(feature = "lz4")]
#[test]
fn bincode_compressing_large_frames() {
    tasks_and_jobs_with(SocketConfig {
        compression: CompressionPolicy::LargerThan(1024),
        ..SocketConfig::default()
    });
}

#[cfg(feature = "msgpack_encoding")]
#[test]
fn msgpack_server_and_workers() {
    tasks_and_jobs_with(SocketConfig {
        encoding: Encoding::MsgPack,
        ..SocketConfig::default()
    });
}

#[cfg(feature = "json_encoding")]
#[test]
fn json_server_and_workers() {
    tasks_and_jobs_with(SocketConfig {
        encoding: Encoding::Json,
        compression: CompressionPolicy::Everything,
        ..SocketConfig::default()
    });
}

/// Compression is recorded per frame, so peers with different policies
/// still understand each other.
#[cfg(feature = "lz4")]
#[test]
fn compression_policies_can_differ() {
    let server = server(1);
    let mut client = client_config();
    client.socket.compression = CompressionPolicy::Everything;
    let mut session = Session::new(client);
    let allocation = session
        .allocate(&[server.machine()], Some(1), ResourceType::Cpu)
        .unwrap();
    let jobs = session
        .submit_jobs("square", vec![vec![Value::Int(12)]], &allocation)
        .unwrap();
    assert_eq!(jobs.get_results().unwrap(), vec![Value::Int(144)]);
}

#[cfg(any(feature = "msgpack_encoding", feature = "json_encoding"))]
#[test]
fn mismatched_encoding_fails() {
    let server = server(1);
    let mut client = client_config();
    client.socket.encoding = if cfg!(feature = "msgpack_encoding") {
        Encoding::MsgPack
    } else {
        Encoding::Json
    };
    client.trials = 1;
    let mut session = Session::new(client);
    assert!(session
        .allocate(&[server.machine()], Some(1), ResourceType::Cpu)
        .is_err());
}
