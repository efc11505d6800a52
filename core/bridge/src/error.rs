//! Error types for the bridge.
//!
//! Each component owns its own error enum; [`SessionError`] wraps them for the
//! editor-facing request handlers and renders the message shown to the user.

use std::{io, path::PathBuf};

use thiserror::Error;

use crate::remote::ContextId;

/// Errors raised while translating positions between remote and local sources.
#[derive(Debug, Error)]
pub enum MappingError {
    /// A remote line is not covered by any chunk.
    #[error("eval() statement in script? set debugger; statement to line 1")]
    RemoteLineNotFound {
        /// The remote line that was queried.
        line: usize,
    },

    /// A remote line points at a synthetic boundary-marker comment.
    #[error("unexpected position {line}: line is the boundary marker of a required script")]
    BoundaryMarker {
        /// The remote line that was queried.
        line: usize,
    },

    /// A local position is not covered by any chunk.
    #[error("{source_name} line {line} not found in chunks")]
    LocalLineNotFound {
        /// Logical name of the local source.
        source_name: String,
        /// The local line that was queried.
        line: usize,
    },

    /// No local file is registered for a logical name.
    #[error("local source '{name}' not found, remote line {remote_line}, local line {local_line}")]
    LocalSourceNotFound {
        /// Logical name that could not be resolved.
        name: String,
        /// Remote line being translated.
        remote_line: usize,
        /// Local line it was translated to.
        local_line: usize,
    },

    /// The same script was inlined more than once with different lengths.
    #[error("duplicate #import in {name}, first occurrence at line {line}")]
    DuplicateImport {
        /// The duplicated logical name.
        name: String,
        /// The line of the first import statement in the importing file.
        line: usize,
    },

    /// Local and remote text differ at the translated position.
    #[error("not on same source line")]
    OutOfSync {
        /// The remote line whose text did not match.
        remote_line: usize,
        /// Surrounding remote lines with a warning banner, for display.
        snippet: String,
    },

    /// A local file lacks the requested line.
    #[error("line {line} does not exist in {name}")]
    MissingLine {
        /// File name.
        name: String,
        /// The requested line.
        line: usize,
    },

    /// A local source has several candidate files and none was chosen yet.
    #[error("can't load source {0}. Found multiple source files with the same name")]
    Ambiguous(String),

    /// A local source was created without any path.
    #[error("local source must have at least one local path")]
    NoPaths,

    /// Reading a local file failed.
    #[error("could not read {}: {source}", path.display())]
    Io {
        /// File that failed to load.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// Asking the user for the right local file failed.
    #[error(transparent)]
    Prompt(#[from] PromptError),

    /// Chunk construction produced an inconsistent chunk list.
    #[error("internal error: chunk {index} of {name} has zero length")]
    EmptyChunk {
        /// Remote source name.
        name: String,
        /// Index of the offending chunk.
        index: usize,
    },
}

/// Errors raised by the variables graph.
#[derive(Debug, Error)]
pub enum VariablesError {
    /// A variable without a name was materialized.
    #[error("variables name cannot be empty")]
    EmptyName,

    /// The editor asked for a reference the bridge never handed out.
    #[error("unable to get variables: no variable with reference {0}")]
    UnknownReference(u64),

    /// A variable was expected exactly once inside a container.
    #[error("internal error: {count} variables found with variablesReference {reference} and name {name}")]
    NotUnique {
        /// Container reference.
        reference: u64,
        /// Variable name.
        name: String,
        /// Number of matches.
        count: usize,
    },

    /// A variable lacks an evaluate expression.
    #[error("internal error: variable {0} has no evaluate name")]
    NoEvaluateName(String),

    /// Re-evaluating an object on the remote side failed.
    #[error("evaluate for variable {expression} failed: {reason}")]
    Evaluate {
        /// Expression that was evaluated.
        expression: String,
        /// Why it failed.
        reason: String,
    },
}

/// Errors raised by the remote connection and its context directory.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// The socket could not be opened or broke down.
    #[error("failed to connect to server: {}{}", connection_category(.source.kind()), timeout_hint(.source.kind()))]
    Connect {
        /// Remote host.
        host: String,
        /// Remote port.
        port: u16,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// The remote engine answered with an error.
    #[error("target responded with error '{0}'")]
    Rejected(String),

    /// The context directory does not know the context.
    #[error("No such context: {0}")]
    NoSuchContext(ContextId),

    /// The connection was closed while a request was outstanding.
    #[error("connection to remote debugger closed")]
    Closed,

    /// A remote message could not be understood.
    #[error("malformed message from remote debugger: {0}")]
    Protocol(String),

    /// Writing to the connection failed.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl RemoteError {
    /// Returns `true` if the remote side rejected the command with exactly `message`.
    pub fn is_rejection(&self, message: &str) -> bool {
        matches!(self, Self::Rejected(m) if m == message)
    }
}

fn connection_category(kind: io::ErrorKind) -> &'static str {
    match kind {
        io::ErrorKind::Interrupted => "Operation canceled",
        io::ErrorKind::ConnectionAborted => "Connection aborted",
        io::ErrorKind::ConnectionRefused => "Connection refused",
        io::ErrorKind::ConnectionReset => "Connection reset",
        io::ErrorKind::TimedOut => "Connection timed out",
        _ => "Unknown error",
    }
}

fn timeout_hint(kind: io::ErrorKind) -> &'static str {
    if kind == io::ErrorKind::TimedOut {
        ". Maybe wrong port or host?"
    } else {
        ""
    }
}

/// Errors raised by the editor-prompt collaborator.
#[derive(Debug, Error)]
pub enum PromptError {
    /// Nobody answered within the bounded wait.
    #[error("request timed out")]
    Timeout,

    /// The prompt channel is gone.
    #[error("editor prompt channel closed")]
    Closed,

    /// The answer had an unexpected shape.
    #[error("unexpected answer to {event}: {reason}")]
    Answer {
        /// The response event.
        event: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Socket failure.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Errors surfaced to the editor as failed responses.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Launch configuration without a script.
    #[error("missing required property 'script' in your launch configuration")]
    MissingScript,

    /// The remote listener never came up.
    #[error("cannot launch remote script {script}, port {host}:{port} not open")]
    PortNotOpen {
        /// Script that was started.
        script: String,
        /// Remote host.
        host: String,
        /// Remote debugger port.
        port: u16,
    },

    /// The launched script never showed up in the context directory.
    #[error("could not launch remote script: no script with name {0} found")]
    ScriptNotFound(String),

    /// Fetching the remote text failed during launch.
    #[error("could not get source code for remote script {script}: {source}")]
    SourceUnavailable {
        /// Script name.
        script: String,
        /// Underlying error.
        #[source]
        source: Box<SessionError>,
    },

    /// Attaching found nothing to attach to.
    #[error("no context found to attach to")]
    NoContext,

    /// The user chose to terminate all paused scripts.
    #[error("terminated all paused scripts")]
    TerminatedAll,

    /// Attach failed with the wrapped error.
    #[error("attach failed: {0}")]
    Attach(#[source] Box<SessionError>),

    /// A request the bridge does not implement.
    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    /// A request needs a remote connection but none exists.
    #[error("no connection")]
    NoConnection,

    /// An evaluate request without frame.
    #[error("no frame id passed")]
    NoFrame,

    /// A frame id the bridge never handed out.
    #[error("unknown stack frame {0}")]
    UnknownFrame(i64),

    /// Request arguments could not be decoded.
    #[error("invalid arguments: {0}")]
    InvalidArguments(#[from] serde_json::Error),

    /// Breakpoint request lacked the source path.
    #[error("an internal error occurred")]
    MissingSourcePath,

    /// Setting breakpoints failed as a whole.
    #[error("could not set breakpoint(s): {0}")]
    Breakpoints(#[source] RemoteError),

    /// Clearing breakpoints failed.
    #[error("could not clear breakpoint(s): {0}")]
    ClearBreakpoints(#[source] RemoteError),

    /// Evaluating an expression failed.
    #[error("could not evaluate expression \"{expression}\": {source}")]
    Evaluate {
        /// Expression from the editor.
        expression: String,
        /// Underlying error.
        #[source]
        source: RemoteError,
    },

    /// Setting a variable failed.
    #[error("could not set variable \"{name}\": {source}")]
    SetVariable {
        /// Variable name.
        name: String,
        /// Underlying error.
        #[source]
        source: RemoteError,
    },

    /// Position mapping failure.
    #[error(transparent)]
    Mapping(#[from] MappingError),

    /// Variables graph failure.
    #[error(transparent)]
    Variables(#[from] VariablesError),

    /// Remote connection failure.
    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// Editor prompt failure.
    #[error(transparent)]
    Prompt(#[from] PromptError),
}

impl SessionError {
    /// Renders the error for display to the user: the message with its first letter upper-cased.
    pub fn user_message(&self) -> String {
        capitalize(&self.to_string())
    }
}

/// Upper-cases the first character of `message`.
pub fn capitalize(message: &str) -> String {
    let mut chars = message.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_errors_are_categorized() {
        let err = RemoteError::Connect {
            host: "localhost".into(),
            port: 8089,
            source: io::Error::from(io::ErrorKind::ConnectionRefused),
        };
        assert_eq!(err.to_string(), "failed to connect to server: Connection refused");

        let err = RemoteError::Connect {
            host: "localhost".into(),
            port: 8089,
            source: io::Error::from(io::ErrorKind::TimedOut),
        };
        assert_eq!(
            err.to_string(),
            "failed to connect to server: Connection timed out. Maybe wrong port or host?"
        );
    }

    #[test]
    fn user_message_is_capitalized() {
        let err = SessionError::from(RemoteError::Rejected("boom".into()));
        assert_eq!(err.user_message(), "Target responded with error 'boom'");
        assert_eq!(capitalize(""), "");
    }
}
