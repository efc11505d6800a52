//! DAP server implementation
//!
//! This module implements the Debug Adapter Protocol server that handles
//! JSON communication with DAP clients (like VS Code), relaying events of
//! the remote debugger while requests are served one at a time.

use std::io;

use serde::{Serialize, de::DeserializeOwned};
use serde_json::{Value, json};
use tokio::{
    io::{AsyncRead, AsyncWrite, BufReader},
    sync::mpsc::{self, UnboundedSender},
};

use super::{
    Event, ProtocolMessage, Request, Response,
    messages::*,
    session::{DebugSession, SessionEvent},
    transport::{read_message, write_message},
};
use crate::{error::SessionError, logging::Logger, prompt::EditorPrompt, remote::RemoteConnector};

type Incoming = Result<ProtocolMessage, serde_json::Error>;

enum Step {
    Message(Option<Incoming>),
    Signal(super::Signal),
}

fn parse<T: DeserializeOwned>(arguments: Value) -> Result<T, SessionError> {
    Ok(serde_json::from_value(arguments)?)
}

fn to_body<T: Serialize>(body: T) -> Result<Option<Value>, SessionError> {
    Ok(Some(serde_json::to_value(body)?))
}

async fn read_requests<I>(mut input: BufReader<I>, sender: UnboundedSender<Incoming>, log: Logger)
where
    I: AsyncRead + Unpin,
{
    loop {
        match read_message(&mut input).await {
            Ok(Some(body)) => {
                if sender.send(serde_json::from_str(&body)).is_err() {
                    break;
                }
            }
            Ok(None) => {
                log.info(format_args!("editor closed the connection"));
                break;
            }
            Err(err) => {
                log.error(format_args!("failed to read message: {err}"));
                break;
            }
        }
    }
}

/// DAP server that handles protocol communication
pub struct DapServer<R: RemoteConnector, P> {
    /// The debug session
    session: DebugSession<R, P>,

    /// Sequence number for responses and events
    seq: i64,

    log: Logger,
}

impl<R: RemoteConnector, P> std::fmt::Debug for DapServer<R, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DapServer")
            .field("session", &self.session)
            .field("seq", &self.seq)
            .finish_non_exhaustive()
    }
}

impl<R: RemoteConnector, P: EditorPrompt> DapServer<R, P> {
    /// Creates a new DAP server
    pub fn new(session: DebugSession<R, P>, log: Logger) -> Self {
        Self {
            session,
            seq: 1,
            log,
        }
    }

    /// Gets the next sequence number
    fn next_seq(&mut self) -> i64 {
        let seq = self.seq;
        self.seq += 1;
        seq
    }

    /// Runs the DAP server until the editor disconnects or closes `input`.
    pub async fn run<I, O>(&mut self, input: I, mut output: O) -> io::Result<()>
    where
        I: AsyncRead + Unpin + Send + 'static,
        O: AsyncWrite + Unpin,
    {
        let (sender, mut requests) = mpsc::unbounded_channel();
        let reader = tokio::spawn(read_requests(BufReader::new(input), sender, self.log));

        loop {
            let step = tokio::select! {
                message = requests.recv() => Step::Message(message),
                signal = self.session.next_signal() => Step::Signal(signal),
            };

            match step {
                Step::Message(None) => break,
                Step::Message(Some(Err(err))) => {
                    self.log.warn(format_args!("dropping malformed message: {err}"));
                }
                Step::Message(Some(Ok(ProtocolMessage::Request(request)))) => {
                    let disconnect = request.command == "disconnect";
                    let response = self.handle_request(request).await;
                    self.send_message(&response, &mut output).await?;
                    self.send_events(&mut output).await?;
                    if disconnect {
                        break;
                    }
                }
                Step::Message(Some(Ok(message))) => {
                    self.log
                        .debug(format_args!("ignoring message {} from the editor", message.seq()));
                }
                Step::Signal(signal) => {
                    self.session.handle_signal(signal).await;
                    self.send_events(&mut output).await?;
                }
            }
        }

        reader.abort();
        Ok(())
    }

    /// Handles a DAP request and returns its response
    async fn handle_request(&mut self, request: Request) -> ProtocolMessage {
        let Request {
            seq,
            command,
            arguments,
        } = request;
        self.log.debug(format_args!("request {seq}: {command}"));

        match self
            .dispatch(&command, arguments.unwrap_or_else(|| json!({})))
            .await
        {
            Ok(body) => self.create_response(seq, &command, true, None, body),
            Err(err) => {
                self.log.error(format_args!("{command} failed: {err}"));
                self.create_response(seq, &command, false, Some(err.user_message()), None)
            }
        }
    }

    async fn dispatch(&mut self, command: &str, arguments: Value) -> Result<Option<Value>, SessionError> {
        let session = &mut self.session;
        let body = match command {
            "initialize" => to_body(session.handle_initialize(&parse(arguments)?))?,
            "launch" => {
                session.handle_launch(parse(arguments)?).await?;
                None
            }
            "attach" => {
                session.handle_attach(parse(arguments)?).await?;
                None
            }
            "setBreakpoints" => to_body(session.handle_set_breakpoints(parse(arguments)?).await?)?,
            "setFunctionBreakpoints" | "setExceptionBreakpoints" => None,
            "configurationDone" => {
                session.handle_configuration_done().await?;
                None
            }
            "continue" => to_body(session.handle_continue(parse(arguments)?).await?)?,
            "next" => {
                session.handle_next(parse(arguments)?).await?;
                None
            }
            "stepIn" => {
                session.handle_step_in(parse(arguments)?).await?;
                None
            }
            "stepOut" => {
                session.handle_step_out(parse(arguments)?).await?;
                None
            }
            "pause" => {
                session.handle_pause(parse(arguments)?).await?;
                None
            }
            "threads" => to_body(session.handle_threads().await?)?,
            "stackTrace" => to_body(session.handle_stack_trace(parse(arguments)?).await?)?,
            "scopes" => to_body(session.handle_scopes(parse(arguments)?).await?)?,
            "variables" => to_body(session.handle_variables(parse(arguments)?).await?)?,
            "setVariable" => to_body(session.handle_set_variable(parse(arguments)?).await?)?,
            "evaluate" => to_body(session.handle_evaluate(parse(arguments)?).await?)?,
            "source" => match session.handle_source(&parse(arguments)?)? {
                Some(body) => to_body(body)?,
                None => None,
            },
            "disconnect" => {
                session.handle_disconnect(&parse(arguments)?).await?;
                None
            }
            _ => return Err(SessionError::UnknownCommand(command.to_owned())),
        };
        Ok(body)
    }

    /// Creates a response message
    fn create_response(
        &mut self,
        request_seq: i64,
        command: &str,
        success: bool,
        message: Option<String>,
        body: Option<Value>,
    ) -> ProtocolMessage {
        ProtocolMessage::Response(Response {
            seq: self.next_seq(),
            request_seq,
            success,
            command: command.to_owned(),
            message,
            body,
        })
    }

    /// Creates an event message
    fn create_event(&mut self, event: &str, body: Option<Value>) -> ProtocolMessage {
        ProtocolMessage::Event(Event {
            seq: self.next_seq(),
            event: event.to_owned(),
            body,
        })
    }

    fn event_message(&mut self, event: SessionEvent) -> serde_json::Result<ProtocolMessage> {
        Ok(match event {
            SessionEvent::Initialized => self.create_event("initialized", None),
            SessionEvent::Stopped { reason, thread_id } => {
                let body = serde_json::to_value(StoppedEventBody {
                    reason: reason.to_owned(),
                    description: None,
                    thread_id: Some(thread_id),
                    all_threads_stopped: false,
                })?;
                self.create_event("stopped", Some(body))
            }
            SessionEvent::Continued { thread_id } => {
                let body = serde_json::to_value(ContinuedEventBody {
                    thread_id,
                    all_threads_continued: false,
                })?;
                self.create_event("continued", Some(body))
            }
            SessionEvent::Terminated => self.create_event("terminated", None),
            SessionEvent::Output(output) => {
                let body = serde_json::to_value(OutputEventBody {
                    category: Some("console".to_owned()),
                    output,
                })?;
                self.create_event("output", Some(body))
            }
        })
    }

    async fn send_events<W: AsyncWrite + Unpin>(&mut self, writer: &mut W) -> io::Result<()> {
        for event in self.session.take_events() {
            let message = self.event_message(event)?;
            self.send_message(&message, writer).await?;
        }
        Ok(())
    }

    /// Sends a protocol message
    async fn send_message<W: AsyncWrite + Unpin>(
        &self,
        message: &ProtocolMessage,
        writer: &mut W,
    ) -> io::Result<()> {
        let json = serde_json::to_string(message)?;
        self.log.debug(format_args!("sending {json}"));
        write_message(writer, &json).await
    }
}
