//! Line codec of the remote debugger protocol.
//!
//! Every message is one line: the context id (or `X` for messages that do
//! not address a context), a slash, and a JSON object whose `type` names the
//! command, response or event.

use serde_json::{Map, Value};
use uuid::Uuid;

use super::{Command, ContextId, RemoteResponse};
use crate::error::RemoteError;

const NO_CONTEXT: &str = "X";

/// Encodes a command as one protocol line, newline included.
pub fn encode(command: &Command) -> Result<String, RemoteError> {
    let mut object = Map::new();
    object.insert("type".to_owned(), Value::String(command.name().to_owned()));
    object.insert("id".to_owned(), Value::String(command.id().to_string()));
    for (key, value) in command.arguments() {
        object.insert(key.clone(), value.clone());
    }
    let json = serde_json::to_string(&object).map_err(|err| RemoteError::Protocol(err.to_string()))?;

    Ok(match command.context_id() {
        Some(context_id) => format!("{context_id}/{json}\n"),
        None => format!("{NO_CONTEXT}/{json}\n"),
    })
}

/// Decodes one protocol line.
pub fn decode(line: &str) -> Result<RemoteResponse, RemoteError> {
    let line = line.trim_end_matches(['\r', '\n']);
    let (prefix, json) = line
        .split_once('/')
        .ok_or_else(|| RemoteError::Protocol(format!("missing context prefix in '{line}'")))?;

    let context_id = match prefix {
        NO_CONTEXT => None,
        id => Some(
            id.parse::<ContextId>()
                .map_err(|_| RemoteError::Protocol(format!("invalid context id '{id}'")))?,
        ),
    };

    let Value::Object(mut content) =
        serde_json::from_str(json).map_err(|err| RemoteError::Protocol(err.to_string()))?
    else {
        return Err(RemoteError::Protocol(format!("expected an object in '{line}'")));
    };

    let name = match content.remove("type") {
        Some(Value::String(name)) => name,
        _ => return Err(RemoteError::Protocol(format!("missing type in '{line}'"))),
    };
    let id = match content.remove("id") {
        Some(Value::String(id)) => Uuid::parse_str(&id).ok(),
        _ => None,
    };

    Ok(RemoteResponse {
        name,
        id,
        context_id,
        content,
    })
}
