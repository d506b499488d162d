//! Message definitions exchanged between clients, servers and workers.

use std::collections::BTreeMap;

use spindle_core::{RemoteError, Value};

pub mod worker;

/// Token under which the result of a deferred call is cached.
pub type TempToken = u32;

/// Unit of remote procedure call.
///
/// Procedures without a handler class are dispatched to the server's native
/// methods. Otherwise the call goes to the handler stored under
/// `handler_id`, created from `handler_class` if it doesn't exist yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Procedure {
    pub handler_class: Option<String>,
    /// Defaults to the identity of the calling client
    pub handler_id: Option<String>,
    pub method: String,
    pub args: Vec<Value>,
    pub kwds: BTreeMap<String, Value>,
    /// Run the call detached from the connection, see `Request::FetchTemp`
    pub deferred: bool,
}

impl Procedure {
    /// Creates a call to one of the server's native methods.
    pub fn native(method: &str) -> Self {
        Self {
            handler_class: None,
            handler_id: None,
            method: method.to_string(),
            args: Vec::new(),
            kwds: BTreeMap::new(),
            deferred: false,
        }
    }

    /// Creates a call to a handler method.
    pub fn handler(class: &str, id: Option<&str>, method: &str) -> Self {
        Self {
            handler_class: Some(class.to_string()),
            handler_id: id.map(|s| s.to_string()),
            ..Self::native(method)
        }
    }

    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn kwd(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.kwds.insert(name.to_string(), value.into());
        self
    }

    pub fn defer(mut self) -> Self {
        self.deferred = true;
        self
    }

    pub fn is_native(&self) -> bool {
        self.handler_class.is_none()
    }
}

/// Message sent from client to server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Request {
    /// Keep the connection open after replying
    KeepConnection,
    CloseConnection,
    /// Stop accepting connections and shut the server down
    Shutdown,
    Call(Procedure),
    /// Fetch the result of a deferred call, waiting for it if necessary
    FetchTemp(TempToken),
}

/// Message sent from server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Response {
    Done(Value),
    Failed(RemoteError),
    /// Call is running detached, its result is cached under the token
    Deferred(TempToken),
    /// Acknowledges a control request
    Ack,
}

impl From<std::result::Result<Value, RemoteError>> for Response {
    fn from(r: std::result::Result<Value, RemoteError>) -> Self {
        match r {
            Ok(v) => Response::Done(v),
            Err(e) => Response::Failed(e),
        }
    }
}
