//! The remote debugger: commands, responses, events and the context directory.
//!
//! A [`RemoteConnection`] sends [`Command`]s and resolves each with the
//! response carrying the same request id. Notifications the remote side sends
//! on its own arrive separately as [`RemoteEvent`]s. The [`Coordinator`] keeps
//! the directory of script contexts on top of a connection.

mod connection;
pub mod wire;

pub use connection::{RemoteClient, TcpConnector};

use std::{
    future::Future,
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use indexmap::IndexMap;
use serde::Deserialize;
use serde_json::{Map, Value};
use tokio::sync::mpsc::UnboundedReceiver;
use uuid::Uuid;

use crate::{error::RemoteError, logging::Logger};

/// Id of a script context on the remote engine.
pub type ContextId = u64;

/// A request to the remote debugger.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    name: String,
    id: Uuid,
    context_id: Option<ContextId>,
    arguments: Map<String, Value>,
}

impl Command {
    /// Creates a command without arguments and a fresh request id.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: Uuid::new_v4(),
            context_id: None,
            arguments: Map::new(),
        }
    }

    /// Addresses the command to a context.
    #[must_use]
    pub fn with_context(mut self, context_id: ContextId) -> Self {
        self.context_id = Some(context_id);
        self
    }

    /// Adds an argument.
    #[must_use]
    pub fn arg(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.arguments.insert(key.to_owned(), value.into());
        self
    }

    /// Command name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Request id.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Addressed context, if any.
    pub fn context_id(&self) -> Option<ContextId> {
        self.context_id
    }

    /// Arguments in insertion order.
    pub fn arguments(&self) -> &Map<String, Value> {
        &self.arguments
    }

    /// Lists all contexts.
    pub fn get_available_contexts() -> Self {
        Self::new("get_available_contexts")
    }

    /// Fetches the text of script `url`.
    pub fn get_source(url: &str, context_id: Option<ContextId>) -> Self {
        let command = Self::new("get_source").arg("url", url);
        match context_id {
            Some(id) => command.with_context(id),
            None => command,
        }
    }

    /// Sets a breakpoint at `line` of script `url`.
    pub fn set_breakpoint(url: &str, line: usize, pending: bool, context_id: Option<ContextId>) -> Self {
        let command = Self::new("set_breakpoint")
            .arg("url", url)
            .arg("line", line)
            .arg("pending", pending);
        match context_id {
            Some(id) => command.with_context(id),
            None => command,
        }
    }

    /// Asks for the version of the remote debugger.
    pub fn server_version() -> Self {
        Self::new("server_version")
    }

    /// Deletes every breakpoint.
    pub fn delete_all_breakpoints() -> Self {
        Self::new("delete_all_breakpoints")
    }

    /// Reads the call stack of a context.
    pub fn get_stacktrace(context_id: ContextId) -> Self {
        Self::new("get_stacktrace").with_context(context_id)
    }

    /// Reads the local variables of frame `depth`.
    pub fn get_variables(context_id: ContextId, depth: usize) -> Self {
        Self::new("get_variables")
            .with_context(context_id)
            .arg("depth", depth)
    }

    /// Evaluates an expression.
    pub fn evaluate(context_id: ContextId, expression: &str) -> Self {
        Self::new("evaluate")
            .with_context(context_id)
            .arg("path", expression)
    }

    /// Assigns `value` to the variable reachable through `path`; `None` assigns `undefined`.
    pub fn set_variable(context_id: ContextId, path: &str, value: Option<Value>) -> Self {
        let command = Self::new("set_variable")
            .with_context(context_id)
            .arg("path", path);
        match value {
            Some(value) => command.arg("value", value),
            None => command,
        }
    }
}

/// A message from the remote debugger.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteResponse {
    /// The `type` field.
    pub name: String,
    /// Request id for responses.
    pub id: Option<Uuid>,
    /// Context prefix.
    pub context_id: Option<ContextId>,
    /// Every other field.
    pub content: Map<String, Value>,
}

impl RemoteResponse {
    /// Creates a response to `command` carrying `content`.
    pub fn reply(command: &Command, name: &str, content: Value) -> Self {
        let content = match content {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            name: name.to_owned(),
            id: Some(command.id()),
            context_id: command.context_id(),
            content,
        }
    }

    /// The rejection text if this is an `error` message.
    pub fn error_message(&self) -> Option<String> {
        (self.name == "error").then(|| {
            self.content
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("Unknown error")
                .to_owned()
        })
    }

    /// Turns an `error` message into [`RemoteError::Rejected`].
    pub fn into_result(self) -> Result<Self, RemoteError> {
        match self.error_message() {
            Some(message) => Err(RemoteError::Rejected(message)),
            None => Ok(self),
        }
    }

    /// Deserializes the field `key`.
    pub fn field<T: for<'de> Deserialize<'de>>(&self, key: &str) -> Result<T, RemoteError> {
        let value = self
            .content
            .get(key)
            .cloned()
            .ok_or_else(|| RemoteError::Protocol(format!("'{}' without {key}", self.name)))?;
        serde_json::from_value(value)
            .map_err(|err| RemoteError::Protocol(format!("{key} in '{}': {err}", self.name)))
    }
}

/// A script context as listed by the remote engine.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextInfo {
    /// Context id.
    #[serde(rename = "contextId")]
    pub id: ContextId,
    /// Logical script name.
    #[serde(rename = "contextName")]
    pub name: String,
    /// Whether the context is stopped.
    pub paused: bool,
}

impl ContextInfo {
    /// Returns `true` if the context is stopped.
    pub fn is_stopped(&self) -> bool {
        self.paused
    }
}

/// One entry of a remote call stack, top first.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteFrame {
    /// Script the frame executes.
    pub url: String,
    /// Remote line.
    pub line: usize,
    /// Depth, `0` for the top frame.
    #[serde(default)]
    pub r_depth: usize,
}

/// A variable as listed by `get_variables`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RemoteVariable {
    /// Variable name.
    pub name: String,
    /// Raw value.
    pub value: Value,
}

/// Result of `evaluate`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EvaluatedValue {
    /// Declared type.
    #[serde(rename = "type")]
    pub type_: String,
    /// Raw value; composite values arrive as JSON text.
    pub value: Value,
}

/// Notification the remote side sends without being asked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteEvent {
    /// A context stopped.
    ContextPaused(ContextId),
    /// A context appeared.
    NewContext {
        /// Context id.
        id: ContextId,
        /// Logical name.
        name: String,
        /// Whether it starts stopped.
        stopped: bool,
    },
    /// The remote side reported an error outside of any request.
    Error(String),
    /// The connection is gone.
    Closed,
}

/// A connection to the remote debugger.
pub trait RemoteConnection: Send + Sync {
    /// Sends `command` and waits for the response with the same id.
    fn send_request(
        &self,
        command: Command,
    ) -> impl Future<Output = Result<RemoteResponse, RemoteError>> + Send;

    /// Closes the connection; pending requests fail with [`RemoteError::Closed`].
    fn disconnect(&self) -> impl Future<Output = ()> + Send;
}

/// Opens connections to the remote debugger.
pub trait RemoteConnector: Send + Sync {
    /// The connection type.
    type Connection: RemoteConnection;

    /// Waits up to `bound` for `host:port` to accept connections.
    fn probe(
        &self,
        host: &str,
        port: u16,
        bound: Duration,
        interval: Duration,
    ) -> impl Future<Output = bool> + Send;

    /// Connects and returns the connection with its event stream.
    fn connect(
        &self,
        host: &str,
        port: u16,
    ) -> impl Future<
        Output = Result<(Self::Connection, UnboundedReceiver<RemoteEvent>), RemoteError>,
    > + Send;
}

/// The directory of script contexts over one connection.
#[derive(Debug)]
pub struct Coordinator<C> {
    connection: C,
    contexts: Mutex<IndexMap<ContextId, ContextInfo>>,
    log: Logger,
}

impl<C: RemoteConnection> Coordinator<C> {
    /// Wraps `connection`.
    pub fn new(connection: C, log: Logger) -> Self {
        Self {
            connection,
            contexts: Mutex::default(),
            log,
        }
    }

    fn contexts(&self) -> MutexGuard<'_, IndexMap<ContextId, ContextInfo>> {
        self.contexts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sends `command`; an `error` answer becomes [`RemoteError::Rejected`].
    pub async fn request(&self, command: Command) -> Result<RemoteResponse, RemoteError> {
        let name = command.name().to_owned();
        let response = self.connection.send_request(command).await?;
        response.into_result().inspect_err(|err| {
            self.log.debug(format_args!("{name} failed: {err}"));
        })
    }

    /// Queries every context and refreshes the directory.
    pub async fn all_available_contexts(&self) -> Result<Vec<ContextInfo>, RemoteError> {
        let response = self.request(Command::get_available_contexts()).await?;
        let contexts: Vec<ContextInfo> = response.field("contexts")?;
        let mut directory = self.contexts();
        directory.clear();
        directory.extend(contexts.iter().map(|context| (context.id, context.clone())));
        Ok(contexts)
    }

    /// The cached context `id`.
    pub fn context(&self, id: ContextId) -> Result<ContextInfo, RemoteError> {
        self.contexts()
            .get(&id)
            .cloned()
            .ok_or(RemoteError::NoSuchContext(id))
    }

    /// Records that a context runs again after a continue or step.
    pub fn mark_running(&self, id: ContextId) {
        if let Some(context) = self.contexts().get_mut(&id) {
            context.paused = false;
        }
    }

    /// Keeps the directory current with an event.
    pub fn handle_event(&self, event: &RemoteEvent) {
        match event {
            RemoteEvent::ContextPaused(id) => {
                if let Some(context) = self.contexts().get_mut(id) {
                    context.paused = true;
                }
            }
            RemoteEvent::NewContext { id, name, stopped } => {
                self.contexts().insert(
                    *id,
                    ContextInfo {
                        id: *id,
                        name: name.clone(),
                        paused: *stopped,
                    },
                );
            }
            RemoteEvent::Error(_) | RemoteEvent::Closed => {}
        }
    }

    /// Fetches the text of script `url`.
    pub async fn source(
        &self,
        url: &str,
        context_id: Option<ContextId>,
    ) -> Result<Vec<String>, RemoteError> {
        self.request(Command::get_source(url, context_id))
            .await?
            .field("source")
    }

    /// Reads the call stack of `context_id`.
    pub async fn stacktrace(&self, context_id: ContextId) -> Result<Vec<RemoteFrame>, RemoteError> {
        self.request(Command::get_stacktrace(context_id))
            .await?
            .field("stacktrace")
    }

    /// Reads the locals of frame `depth`.
    pub async fn variables(
        &self,
        context_id: ContextId,
        depth: usize,
    ) -> Result<Vec<RemoteVariable>, RemoteError> {
        self.request(Command::get_variables(context_id, depth))
            .await?
            .field("variables")
    }

    /// Evaluates `expression` in `context_id`.
    pub async fn evaluate(
        &self,
        context_id: ContextId,
        expression: &str,
    ) -> Result<EvaluatedValue, RemoteError> {
        self.request(Command::evaluate(context_id, expression))
            .await?
            .field("result")
    }

    /// Version reported by the remote debugger, if it names one.
    pub async fn server_version(&self) -> Result<Option<String>, RemoteError> {
        let response = self.request(Command::server_version()).await?;
        Ok(response.field::<Value>("version").ok().map(|version| match version {
            Value::String(version) => version,
            other => other.to_string(),
        }))
    }

    /// Sends a context-level command without payload, such as `continue` or `pause`.
    pub async fn control(&self, name: &str, context_id: Option<ContextId>) -> Result<(), RemoteError> {
        let command = Command::new(name);
        let command = match context_id {
            Some(id) => command.with_context(id),
            None => command,
        };
        self.request(command).await.map(drop)
    }

    /// Closes the connection.
    pub async fn disconnect(&self) {
        self.connection.disconnect().await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use serde_json::json;

    use super::*;
    use crate::logging::targets;

    #[derive(Debug, Default)]
    struct Canned {
        answers: StdMutex<Vec<(String, Value)>>,
    }

    impl RemoteConnection for Canned {
        async fn send_request(&self, command: Command) -> Result<RemoteResponse, RemoteError> {
            let (name, content) = self.answers.lock().unwrap().remove(0);
            Ok(RemoteResponse::reply(&command, &name, content))
        }

        async fn disconnect(&self) {}
    }

    fn coordinator(answers: Vec<(&str, Value)>) -> Coordinator<Canned> {
        let connection = Canned {
            answers: StdMutex::new(
                answers
                    .into_iter()
                    .map(|(name, content)| (name.to_owned(), content))
                    .collect(),
            ),
        };
        Coordinator::new(connection, Logger::new(targets::REMOTE))
    }

    #[tokio::test]
    async fn directory_is_refreshed_and_kept_current() {
        let coordinator = coordinator(vec![(
            "contexts",
            json!({ "contexts": [
                { "contextId": 3, "contextName": "main", "paused": false },
            ] }),
        )]);

        let contexts = coordinator.all_available_contexts().await.unwrap();
        assert_eq!(contexts.len(), 1);
        assert!(!coordinator.context(3).unwrap().is_stopped());

        coordinator.handle_event(&RemoteEvent::ContextPaused(3));
        assert!(coordinator.context(3).unwrap().is_stopped());
        coordinator.mark_running(3);
        assert!(!coordinator.context(3).unwrap().is_stopped());

        coordinator.handle_event(&RemoteEvent::NewContext {
            id: 4,
            name: "other".to_owned(),
            stopped: true,
        });
        assert_eq!(coordinator.context(4).unwrap().name, "other");

        let err = coordinator.context(9).unwrap_err();
        assert_eq!(err.to_string(), "No such context: 9");
    }

    #[tokio::test]
    async fn server_version_is_optional() {
        let coordinator = coordinator(vec![
            ("server_version", json!({ "version": "1.2" })),
            ("server_version", json!({ "version": 3 })),
            ("server_version", json!({})),
        ]);

        assert_eq!(coordinator.server_version().await.unwrap().as_deref(), Some("1.2"));
        assert_eq!(coordinator.server_version().await.unwrap().as_deref(), Some("3"));
        assert_eq!(coordinator.server_version().await.unwrap(), None);
    }

    #[tokio::test]
    async fn error_answers_are_rejections() {
        let coordinator = coordinator(vec![
            ("error", json!({ "message": "Cannot set breakpoint at given line." })),
            ("error", json!({})),
        ]);

        let err = coordinator
            .request(Command::set_breakpoint("main", 1, false, None))
            .await
            .unwrap_err();
        assert!(err.is_rejection("Cannot set breakpoint at given line."));

        let err = coordinator.control("pause", Some(1)).await.unwrap_err();
        assert_eq!(err.to_string(), "target responded with error 'Unknown error'");
    }

    #[tokio::test]
    async fn typed_fields() {
        let coordinator = coordinator(vec![
            ("stacktrace", json!({ "stacktrace": [{ "url": "lib", "line": 4, "rDepth": 1 }] })),
            ("evaluated", json!({ "result": { "type": "number", "value": 2 } })),
            ("source", json!({})),
        ]);

        let frames = coordinator.stacktrace(1).await.unwrap();
        assert_eq!(frames[0].url, "lib");
        assert_eq!(frames[0].r_depth, 1);

        let value = coordinator.evaluate(1, "1 + 1").await.unwrap();
        assert_eq!(value.type_, "number");

        assert!(matches!(
            coordinator.source("main", None).await,
            Err(RemoteError::Protocol(_))
        ));
    }
}
