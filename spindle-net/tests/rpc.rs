mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use spindle_net::core::Value;
use spindle_net::{
    Call, Client, ClientConfig, Error, Handler, HandlerRegistry, Procedure, Result, Secret,
    ServerContext,
};

use common::*;

struct Echo {
    calls: Arc<AtomicUsize>,
}

impl Handler for Echo {
    fn call(&self, _ctx: &Arc<ServerContext>, method: &str, call: Call) -> Result<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match method {
            "echo" => Ok(call.arg(0)?.clone()),
            "whoami" => Ok(Value::from(call.client)),
            "fail" => Err(Error::Other(format!("boom: {}", call.arg(0)?))),
            "panic" => panic!("handler panicked"),
            _ => Err(Error::UnknownMethod(method.to_string())),
        }
    }
}

fn echo_classes(calls: Arc<AtomicUsize>) -> HandlerRegistry {
    let mut classes = HandlerRegistry::with_builtins();
    classes.register("echo", move |_, _| {
        Ok(Arc::new(Echo {
            calls: calls.clone(),
        }) as Arc<dyn Handler>)
    });
    classes
}

#[test]
fn valid_secret_round_trip() {
    let server = server(1);
    let mut client = Client::new(server.machine(), client_config());
    client.ping().unwrap();
    let value = client
        .execute(Procedure::handler("echo", None, "echo").arg("hi"))
        .unwrap_err();
    // no such class on a default server
    assert!(value.to_string().contains("echo"));
}

#[test]
fn invalid_secret_is_rejected_without_dispatch() {
    let calls = Arc::new(AtomicUsize::new(0));
    let server = server_with(1, echo_classes(calls.clone()));
    let config = ClientConfig {
        secret: Secret::new("wrong"),
        ..client_config()
    };
    let mut client = Client::new(server.machine(), config);
    let err = client
        .execute(Procedure::handler("echo", None, "echo").arg(1))
        .unwrap_err();
    assert!(matches!(err, Error::HandshakeFailed(_)), "got {:?}", err);
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    let mut client = Client::new(server.machine(), client_config());
    let echoed = client
        .execute(Procedure::handler("echo", None, "echo").arg(1))
        .unwrap();
    assert_eq!(echoed, Value::Int(1));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn remote_errors_keep_their_message() {
    let calls = Arc::new(AtomicUsize::new(0));
    let server = server_with(1, echo_classes(calls));
    let mut client = Client::new(server.machine(), client_config());

    let err = client
        .execute(Procedure::handler("echo", None, "fail").arg("x"))
        .unwrap_err();
    let expected = Error::Other("boom: x".to_string()).to_string();
    match &err {
        Error::Remote(e) => {
            assert_eq!(e.message, expected);
            assert!(e.trace.contains("echo.fail"));
        }
        other => panic!("expected remote error, got {:?}", other),
    }
    assert_eq!(err.to_string(), expected);

    // panics are reported the same way and don't take the server down
    let err = client
        .execute(Procedure::handler("echo", None, "panic"))
        .unwrap_err();
    assert!(err.to_string().contains("handler panicked"));
    client.ping().unwrap();
}

#[test]
fn handlers_are_kept_per_id() {
    let calls = Arc::new(AtomicUsize::new(0));
    let server = server_with(1, echo_classes(calls));
    let mut client = Client::new(server.machine(), client_config());

    let me = client
        .execute(Procedure::handler("echo", None, "whoami"))
        .unwrap();
    client
        .execute(Procedure::handler("echo", Some("named"), "echo").arg(0))
        .unwrap();
    let handlers = client
        .execute(Procedure::native("list_handlers"))
        .unwrap();
    let handlers = handlers.as_map().unwrap();
    assert_eq!(handlers.len(), 2);
    assert_eq!(handlers.get(me.as_str().unwrap()), Some(&Value::from("echo")));

    // same id, different class
    let err = client
        .execute(Procedure::handler("sync", Some("named"), "status"))
        .unwrap_err();
    assert!(err.to_string().contains("class"));

    let deleted = client
        .execute(Procedure::native("delete_handler").arg("named"))
        .unwrap();
    assert_eq!(deleted, Value::Bool(true));
    let deleted = client
        .execute(Procedure::native("delete_handler").arg("named"))
        .unwrap();
    assert_eq!(deleted, Value::Bool(false));
}

#[test]
fn persistent_connection_serves_many_calls() {
    let server = server(1);
    let mut client = Client::new(server.machine(), client_config());
    client.connect().unwrap();
    for _ in 0..10 {
        client.ping().unwrap();
        assert!(client.is_connected());
    }
    client.disconnect().unwrap();
    assert!(!client.is_connected());
    client.ping().unwrap();
}

#[test]
fn persistent_client_connects_on_first_call() {
    let server = server(1);
    let mut client = Client::persistent(server.machine(), client_config());
    assert!(!client.is_connected());
    client.ping().unwrap();
    assert!(client.is_connected());
    client.ping().unwrap();
    assert!(client.is_connected());
    drop(client);

    let mut other = Client::new(server.machine(), client_config());
    other.ping().unwrap();
    assert!(!other.is_connected());
}

#[test]
fn deferred_calls_are_fetched_later() {
    let calls = Arc::new(AtomicUsize::new(0));
    let server = server_with(1, echo_classes(calls));
    let mut client = Client::new(server.machine(), client_config());
    client.connect().unwrap();
    let value = client
        .execute(Procedure::handler("echo", None, "echo").arg("later").defer())
        .unwrap();
    assert_eq!(value, Value::from("later"));
    // still usable afterwards
    client.ping().unwrap();
}

#[test]
fn unknown_native_method() {
    let server = server(1);
    let mut client = Client::new(server.machine(), client_config());
    let err = client
        .execute(Procedure::native("no_such_method"))
        .unwrap_err();
    assert!(matches!(err, Error::Remote(_)));
    assert!(err.to_string().contains("no_such_method"));
}

#[test]
fn unreachable_server_fails_after_trials() {
    let server = server(1);
    let machine = server.machine();
    server.kill();
    let mut client = Client::new(machine, client_config());
    match client.ping() {
        Err(Error::ConnectionFailed { trials, .. }) => assert!(trials >= 1),
        other => panic!("expected connection failure, got {:?}", other),
    }
}

#[test]
fn shutdown_request_stops_server() {
    let server = server(1);
    let mut client = Client::new(server.machine(), client_config());
    client.shutdown_server().unwrap();
    server.join().unwrap();
}
