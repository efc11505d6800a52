//! Debug session management
//!
//! This module implements the debug session that connects the DAP requests
//! with the remote debugger: connection setup, launch and attach, breakpoint
//! translation, execution control and inspection.

use std::{fmt, future::pending, mem, path::Path};

use futures_concurrency::future::Join;
use serde_json::{Number, Value};
use tokio::{
    sync::{mpsc::UnboundedReceiver, oneshot},
    time::{sleep, timeout},
};

use super::messages::*;
use crate::{
    config::{AttachArguments, BridgeConfig, LaunchArguments},
    encoding::decode_remote_string,
    error::{MappingError, RemoteError, SessionError, VariablesError},
    logging::{LogConfig, Logger, targets},
    prompt::{EditorPrompt, Severity},
    remote::{
        Command, ContextId, ContextInfo, Coordinator, RemoteConnection, RemoteConnector,
        RemoteEvent, RemoteFrame,
    },
    source_map::{LocalSource, ServerSource, SourceMap},
    variables::{Evaluator, VariablesMap, VariablesReference},
};

const CANNOT_SET_BREAKPOINT: &str = "Cannot set breakpoint at given line.";
const TERMINATE_ALL_PAUSED: &str = "<Terminate all paused scripts>";
const DEBUG_NEWEST: &str = "Debug newest";
const TERMINATE_ALL: &str = "Terminate all";
const CANCEL: &str = "Cancel";

/// Something the session reports to the editor on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Ready for breakpoints and configuration.
    Initialized,
    /// A context stopped.
    Stopped {
        /// Why it stopped.
        reason: &'static str,
        /// The context.
        thread_id: ContextId,
    },
    /// A context runs again.
    Continued {
        /// The context.
        thread_id: ContextId,
    },
    /// The debuggee is gone.
    Terminated,
    /// Text for the debug console.
    Output(String),
}

/// Input the session waits for besides editor requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    /// A notification of the remote debugger.
    Remote(RemoteEvent),
    /// The script started through the editor ended; `completed` is `false`
    /// if the editor can no longer tell.
    ScriptFinished {
        /// Whether the editor reported the end.
        completed: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Launch,
    Attach,
}

/// A frame handed to the editor; its id is its position in the last trace.
#[derive(Debug, Clone)]
struct FrameInfo {
    id: i64,
    context_id: ContextId,
    depth: usize,
    url: String,
    line: usize,
}

#[derive(Debug, Default)]
struct FrameMap {
    frames: Vec<FrameInfo>,
}

impl FrameMap {
    fn replace(&mut self, context_id: ContextId, trace: &[RemoteFrame]) -> &[FrameInfo] {
        self.frames = (0_i64..)
            .zip(trace)
            .map(|(id, frame)| FrameInfo {
                id,
                context_id,
                depth: frame.r_depth,
                url: frame.url.clone(),
                line: frame.line,
            })
            .collect();
        &self.frames
    }

    fn get(&self, id: i64) -> Result<&FrameInfo, SessionError> {
        usize::try_from(id)
            .ok()
            .and_then(|index| self.frames.get(index))
            .ok_or(SessionError::UnknownFrame(id))
    }
}

/// Diagnostics already shown for the top frame.
#[derive(Debug, Default)]
struct Notices {
    debugger_hint: bool,
    line_mismatch: bool,
    source_mismatch: bool,
}

/// Evaluates variables through the attached connection.
struct RemoteEvaluator<'a, C> {
    coordinator: &'a Coordinator<C>,
}

impl<C: RemoteConnection> Evaluator for RemoteEvaluator<'_, C> {
    async fn evaluate(&self, context_id: ContextId, expression: &str) -> Result<Value, VariablesError> {
        let evaluated = self
            .coordinator
            .evaluate(context_id, expression)
            .await
            .map_err(|err| VariablesError::Evaluate {
                expression: expression.to_owned(),
                reason: err.to_string(),
            })?;
        Ok(match evaluated.value {
            Value::String(text) if evaluated.type_ == "string" => {
                Value::String(decode_remote_string(&text).into_owned())
            }
            value => value,
        })
    }
}

/// Turns the text typed into the editor into the value sent to the remote engine.
///
/// `None` stands for `undefined`.
pub fn coerce_value(text: &str) -> Option<Value> {
    match text {
        "null" => Some(Value::Null),
        "undefined" => None,
        "true" => Some(Value::Bool(true)),
        "false" => Some(Value::Bool(false)),
        _ => Some(if let Ok(integer) = text.parse::<i64>() {
            Value::from(integer)
        } else if let Some(number) = text.parse::<f64>().ok().and_then(Number::from_f64) {
            Value::Number(number)
        } else {
            Value::String(text.to_owned())
        }),
    }
}

async fn stop_all<C: RemoteConnection>(coordinator: &Coordinator<C>, log: &Logger) {
    if let Err(err) = coordinator.control("stop", None).await {
        log.warn(format_args!("could not terminate paused scripts: {err}"));
    }
}

/// An unknown context means the remote side already tore it down.
async fn exit_after<C: RemoteConnection>(coordinator: &Coordinator<C>, err: &RemoteError, log: &Logger) {
    if matches!(err, RemoteError::NoSuchContext(_))
        && let Err(exit) = coordinator.control("exit", None).await
    {
        log.warn(format_args!("exit failed: {exit}"));
    }
}

fn connection_lost(err: &SessionError) -> bool {
    matches!(
        err,
        SessionError::Remote(RemoteError::Connect { .. } | RemoteError::Closed)
    )
}

fn frame_source(source: &LocalSource, hint: &str) -> Source {
    Source {
        name: Some(source.name().to_owned()),
        path: source.path().map(|path| path.display().to_string()),
        source_reference: None,
        presentation_hint: Some(hint.to_owned()),
    }
}

/// A debug session manages the connection between DAP and the remote debugger
pub struct DebugSession<R: RemoteConnector, P> {
    connector: R,
    prompt: P,
    config: BridgeConfig,
    logs: LogConfig,

    /// Position mapping of the attached context
    source_map: SourceMap,

    /// Inspectable variables of the current stop
    variables: VariablesMap,

    /// Frames of the last stack trace
    frames: FrameMap,

    connection: Option<Coordinator<R::Connection>>,
    remote_events: Option<UnboundedReceiver<RemoteEvent>>,
    script_finished: Option<oneshot::Receiver<()>>,

    /// The only context exposed as a thread
    attached: Option<ContextId>,
    mode: Option<Mode>,
    terminate_on_disconnect: bool,
    notices: Notices,

    /// Events waiting to be sent to the editor
    outbox: Vec<SessionEvent>,
    log: Logger,
}

impl<R: RemoteConnector, P> fmt::Debug for DebugSession<R, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DebugSession")
            .field("attached", &self.attached)
            .field("mode", &self.mode)
            .field("connected", &self.connection.is_some())
            .finish_non_exhaustive()
    }
}

impl<R: RemoteConnector, P: EditorPrompt> DebugSession<R, P> {
    /// Creates a new, unattached debug session
    pub fn new(connector: R, prompt: P, config: BridgeConfig, logs: LogConfig) -> Self {
        Self {
            source_map: SourceMap::new(logs.logger(targets::SOURCE_MAP)),
            variables: VariablesMap::new(config.json_helper.clone(), logs.logger(targets::VARIABLES)),
            frames: FrameMap::default(),
            connection: None,
            remote_events: None,
            script_finished: None,
            attached: None,
            mode: None,
            terminate_on_disconnect: false,
            notices: Notices::default(),
            outbox: Vec::new(),
            log: logs.logger(targets::DEBUG),
            connector,
            prompt,
            config,
            logs,
        }
    }

    /// The attached context, if any.
    pub fn attached_context(&self) -> Option<ContextId> {
        self.attached
    }

    /// Returns `true` while a remote connection exists.
    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    /// The position mapping of the attached context.
    pub fn source_map(&self) -> &SourceMap {
        &self.source_map
    }

    /// Removes and returns the events produced so far.
    pub fn take_events(&mut self) -> Vec<SessionEvent> {
        mem::take(&mut self.outbox)
    }

    fn reset(&mut self) {
        self.source_map = SourceMap::new(self.logs.logger(targets::SOURCE_MAP));
        self.variables = VariablesMap::new(
            self.config.json_helper.clone(),
            self.logs.logger(targets::VARIABLES),
        );
        self.frames = FrameMap::default();
        self.notices = Notices::default();
        self.script_finished = None;
        self.attached = None;
        self.mode = None;
        self.terminate_on_disconnect = false;
    }

    async fn close_connection(&mut self) {
        self.remote_events = None;
        self.attached = None;
        if let Some(coordinator) = self.connection.take() {
            coordinator.disconnect().await;
        }
    }

    async fn connect(&mut self, host: &str, port: u16) -> Result<(), SessionError> {
        if self.connection.is_some() {
            self.log
                .warn(format_args!("already made a connection to remote debugger"));
        }
        let (connection, events) = self.connector.connect(host, port).await?;
        self.log.info(format_args!("connected to {host}:{port}"));
        let coordinator = Coordinator::new(connection, self.logs.logger(targets::REMOTE));
        match timeout(self.config.port_confirm, coordinator.server_version()).await {
            Ok(Ok(Some(version))) => self
                .log
                .info(format_args!("determined version {version} of remote debugger")),
            Ok(Ok(None)) => self.log.info(format_args!("remote debugger did not report a version")),
            Ok(Err(err)) => self
                .log
                .warn(format_args!("could not determine remote debugger version: {err}")),
            Err(_) => self
                .log
                .warn(format_args!("remote debugger did not answer the version request")),
        }
        self.connection = Some(coordinator);
        self.remote_events = Some(events);
        Ok(())
    }

    async fn show(&self, message: &str, severity: Severity, snippet: Option<&str>) {
        if let Err(err) = self.prompt.display_message(message, severity, snippet).await {
            self.log
                .warn(format_args!("could not display message '{message}': {err}"));
        }
    }

    fn context_for(&self, thread_id: ContextId) -> ContextId {
        if thread_id == 0 {
            self.attached.unwrap_or_default()
        } else {
            thread_id
        }
    }

    /// Handles the initialize request
    pub fn handle_initialize(&mut self, args: &InitializeRequestArguments) -> Capabilities {
        self.log.info(format_args!(
            "initialize request from {}",
            args.client_name.as_deref().unwrap_or("unknown client")
        ));
        Capabilities {
            supports_configuration_done_request: true,
            supports_set_variable: true,
            ..Capabilities::default()
        }
    }

    /// Handles the launch request
    ///
    /// Starts the script through the editor unless the remote port is already
    /// open, waits for its context to show up stopped, and attaches to it.
    pub async fn handle_launch(&mut self, args: LaunchArguments) -> Result<(), SessionError> {
        self.log.info(format_args!("launch request"));
        self.close_connection().await;
        self.reset();
        self.mode = Some(Mode::Launch);
        self.terminate_on_disconnect = args.terminate_on_disconnect;

        let Some(script) = args.script.clone().filter(|script| !script.is_empty()) else {
            let err = SessionError::MissingScript;
            self.show(&err.user_message(), Severity::Warning, None).await;
            self.outbox.push(SessionEvent::Terminated);
            return Err(err);
        };
        if let Some(workspace) = &args.workspace {
            self.source_map.register_workspace(workspace);
        }
        let source = LocalSource::new(&script);
        let script_name = source.source_name().to_owned();
        self.source_map.add_mapping(source, script_name.clone());

        match self.launch_script(&args, &script_name).await {
            Ok(true) => Ok(()),
            Ok(false) => {
                self.log.info(format_args!("launch of {script_name} cancelled"));
                self.close_connection().await;
                self.outbox.push(SessionEvent::Terminated);
                Ok(())
            }
            Err(err) => {
                self.log.error(format_args!("launch failed: {err}"));
                if connection_lost(&err) {
                    self.outbox.push(SessionEvent::Terminated);
                }
                self.close_connection().await;
                Err(err)
            }
        }
    }

    /// Returns `false` if the user cancelled.
    async fn launch_script(
        &mut self,
        args: &LaunchArguments,
        script_name: &str,
    ) -> Result<bool, SessionError> {
        let (host, port) = (args.host.as_str(), args.debugger_port);
        let interval = self.config.port_poll_interval;

        // the server opens the debugger port when the first script starts
        let mut started = false;
        if !self
            .connector
            .probe(host, port, self.config.port_probe, interval)
            .await
        {
            self.log.info(format_args!(
                "port {port} not open, script {script_name} will be started, to open the port"
            ));
            self.script_finished = Some(self.prompt.run_script_to_completion(script_name).await?);
            started = true;
            if !self
                .connector
                .probe(host, port, self.config.port_confirm, interval)
                .await
            {
                return Err(SessionError::PortNotOpen {
                    script: script_name.to_owned(),
                    host: host.to_owned(),
                    port,
                });
            }
        }

        self.connect(host, port).await?;
        let coordinator = self.connection.as_ref().ok_or(SessionError::NoConnection)?;

        let mut newest_before = None;
        if !started {
            let before = coordinator.all_available_contexts().await?;
            newest_before = before.iter().map(|context| context.id).max();
            self.script_finished = Some(self.prompt.run_script_to_completion(script_name).await?);
        }

        let attempts = self.config.context_poll_attempts;
        let mut candidates = Vec::new();
        let mut selected = None;
        for attempt in 1..=attempts {
            candidates = coordinator
                .all_available_contexts()
                .await?
                .into_iter()
                .filter(|context| context.name == script_name)
                .collect::<Vec<_>>();
            candidates.sort_by_key(|context| context.id);

            if let Some(newest) = candidates.last()
                && newest_before.is_none_or(|before| newest.id > before)
                && newest.is_stopped()
            {
                selected = Some(newest.clone());
                break;
            }
            self.log.info(format_args!(
                "no context with name {script_name} available yet, wait and try again..."
            ));
            if attempt < attempts {
                sleep(self.config.context_poll_interval).await;
            }
        }
        let selected = selected.ok_or_else(|| SessionError::ScriptNotFound(script_name.to_owned()))?;

        if candidates.len() > 1 {
            self.log.info(format_args!(
                "available contexts with name {script_name}: {}",
                candidates.len()
            ));
            let options = [DEBUG_NEWEST, TERMINATE_ALL, CANCEL].map(str::to_owned);
            match self.prompt.show_context_quick_pick(&options).await?.as_str() {
                TERMINATE_ALL => {
                    stop_all(coordinator, &self.log).await;
                    return Err(SessionError::TerminatedAll);
                }
                CANCEL => return Ok(false),
                _ => {}
            }
        }

        let unavailable = |err: SessionError| SessionError::SourceUnavailable {
            script: script_name.to_owned(),
            source: Box::new(err),
        };
        let lines = coordinator
            .source(&selected.name, Some(selected.id))
            .await
            .map_err(|err| unavailable(err.into()))?;
        let server_source = ServerSource::build(script_name, lines, true, None)
            .map_err(|err| unavailable(err.into()))?;
        self.source_map.set_server_source(server_source);

        self.log.debug(format_args!(
            "selected context '{}' ({})",
            selected.name, selected.id
        ));
        self.attached = Some(selected.id);
        self.outbox.push(SessionEvent::Initialized);
        self.outbox.push(SessionEvent::Output(format!(
            "Connected to remote debugger on {host}:{port}\n"
        )));
        Ok(true)
    }

    /// Handles the attach request
    pub async fn handle_attach(&mut self, args: AttachArguments) -> Result<(), SessionError> {
        self.log.info(format_args!("attach request"));
        self.close_connection().await;
        self.reset();
        self.mode = Some(Mode::Attach);
        self.terminate_on_disconnect = args.terminate_on_disconnect;
        if let Some(workspace) = &args.workspace {
            self.source_map.register_workspace(workspace);
        }

        if let Err(err) = self.connect(&args.host, args.debugger_port).await {
            self.log.error(format_args!(
                "failed to connect to {}:{}: {err}",
                args.host, args.debugger_port
            ));
            self.outbox.push(SessionEvent::Terminated);
            return Err(err);
        }

        match self.attach_context(&args).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.log.error(format_args!("attach failed: {err}"));
                if connection_lost(&err) {
                    self.outbox.push(SessionEvent::Terminated);
                }
                self.close_connection().await;
                Err(match err {
                    SessionError::TerminatedAll => err,
                    err => SessionError::Attach(Box::new(err)),
                })
            }
        }
    }

    async fn attach_context(&mut self, args: &AttachArguments) -> Result<(), SessionError> {
        let coordinator = self.connection.as_ref().ok_or(SessionError::NoConnection)?;

        // sorted by start time, which helps when picking from a list
        let mut contexts = coordinator.all_available_contexts().await?;
        contexts.sort_by_key(|context| context.id);

        let target = match contexts.as_slice() {
            [] => return Err(SessionError::NoContext),
            [only] => only.clone(),
            _ => {
                let mut options: Vec<String> =
                    contexts.iter().map(|context| context.name.clone()).collect();
                options.push(TERMINATE_ALL_PAUSED.to_owned());
                let chosen = self.prompt.show_context_quick_pick(&options).await?;
                if chosen == TERMINATE_ALL_PAUSED {
                    stop_all(coordinator, &self.log).await;
                    return Err(SessionError::TerminatedAll);
                }
                let named: Vec<&ContextInfo> = contexts
                    .iter()
                    .filter(|context| context.name == chosen)
                    .collect();
                named
                    .iter()
                    .find(|context| context.is_stopped())
                    .or_else(|| named.first())
                    .map(|context| (*context).clone())
                    .ok_or(SessionError::NoContext)?
            }
        };
        self.log.debug(format_args!(
            "selected context '{}' ({})",
            target.name, target.id
        ));

        let lines = coordinator.source(&target.name, Some(target.id)).await?;
        let local = self
            .source_map
            .source(&target.name, Some(lines.as_slice()), &self.prompt)
            .await?;
        let server_source = ServerSource::build(target.name.clone(), lines, false, local.as_ref())?;
        self.source_map.set_server_source(server_source);
        self.attached = Some(target.id);

        if target.is_stopped() {
            self.log.debug(format_args!("context {} is stopped", target.id));
        } else if args.break_on_attach {
            // the editor only accepts a pause request after a stop event
            self.log.info(format_args!("sending 'pause' request to remote"));
            coordinator.control("pause", Some(target.id)).await?;
        } else {
            self.log.warn(format_args!("context {} not paused", target.id));
        }

        self.outbox.push(SessionEvent::Initialized);
        self.outbox.push(SessionEvent::Output(format!(
            "Connected to remote debugger on {}:{}\n",
            args.host, args.debugger_port
        )));
        Ok(())
    }

    async fn local_source_for(&self, path: &Path) -> Result<LocalSource, SessionError> {
        let name = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .ok_or(SessionError::MissingSourcePath)?;
        if let Some(source) = self.source_map.source(name, None, &self.prompt).await? {
            return Ok(source);
        }
        let source = LocalSource::new(path);
        self.source_map
            .add_mapping(source.clone(), source.source_name().to_owned());
        Ok(source)
    }

    /// Handles the setBreakpoints request
    ///
    /// An empty list clears every breakpoint on the remote side.
    pub async fn handle_set_breakpoints(
        &mut self,
        args: SetBreakpointsArguments,
    ) -> Result<SetBreakpointsResponseBody, SessionError> {
        let requested = args.breakpoints.unwrap_or_default();
        self.log.info(format_args!(
            "setBreakpoints request for {} breakpoint(s)",
            requested.len()
        ));
        let coordinator = self.connection.as_ref().ok_or(SessionError::NoConnection)?;

        if requested.is_empty() {
            coordinator
                .request(Command::delete_all_breakpoints())
                .await
                .map_err(SessionError::ClearBreakpoints)?;
            self.log.debug(format_args!("cleared all breakpoints"));
            return Ok(SetBreakpointsResponseBody {
                breakpoints: Vec::new(),
            });
        }

        let path = args
            .source
            .path
            .as_deref()
            .map(Path::new)
            .ok_or(SessionError::MissingSourcePath)?;
        let remote_url = match self.attached {
            Some(id) => coordinator.context(id)?.name,
            None => self.source_map.remote_url(path),
        };
        let source = self.local_source_for(path).await?;
        let dynamic = self.source_map.dynamic_script(source.source_name());
        let script_url = dynamic
            .as_ref()
            .map_or_else(|| remote_url.clone(), |script| script.name().to_owned());
        let local_path = Source {
            path: Some(path.display().to_string()),
            ..Source::default()
        };

        let mut slots: Vec<Option<Breakpoint>> = vec![None; requested.len()];
        let mut pending = Vec::new();
        for (index, breakpoint) in requested.iter().enumerate() {
            match self
                .source_map
                .to_remote_line(&source, breakpoint.line, dynamic.as_deref())
            {
                Ok(remote_line) => pending.push((index, remote_line)),
                Err(err) => {
                    self.log
                        .debug(format_args!("breakpoint at line {}: {err}", breakpoint.line));
                    slots[index] = Some(Breakpoint {
                        id: None,
                        verified: false,
                        message: Some(err.to_string()),
                        source: Some(local_path.clone()),
                        line: Some(breakpoint.line),
                    });
                }
            }
        }

        let responses = pending
            .iter()
            .map(|&(_, remote_line)| {
                coordinator.request(Command::set_breakpoint(
                    &script_url,
                    remote_line,
                    false,
                    self.attached,
                ))
            })
            .collect::<Vec<_>>()
            .join()
            .await;

        for ((index, remote_line), response) in pending.into_iter().zip(responses) {
            let (line, id, verified) = match response {
                Ok(response) => (
                    response.field::<usize>("line").unwrap_or(remote_line),
                    response.field::<i64>("bid").ok(),
                    true,
                ),
                Err(err) if err.is_rejection(CANNOT_SET_BREAKPOINT) => {
                    self.log.info(format_args!(
                        "cannot set breakpoint at {} (remote {remote_line})",
                        requested[index].line
                    ));
                    (remote_line, None, false)
                }
                Err(err) => return Err(SessionError::Breakpoints(err)),
            };

            let local_line = match self
                .source_map
                .to_local_position(line, Some(&script_url), &self.prompt)
                .await
            {
                Ok(position) => position.line,
                Err(err) => {
                    self.log
                        .debug(format_args!("breakpoint line {line} not mapped back: {err}"));
                    requested[index].line
                }
            };
            slots[index] = Some(Breakpoint {
                id,
                verified,
                message: (!verified).then(|| "Cannot set breakpoint at this line".to_owned()),
                source: Some(local_path.clone()),
                line: Some(local_line),
            });
        }

        Ok(SetBreakpointsResponseBody {
            breakpoints: slots.into_iter().flatten().collect(),
        })
    }

    /// Handles the configurationDone request
    pub async fn handle_configuration_done(&mut self) -> Result<(), SessionError> {
        self.log.info(format_args!("configurationDone request"));
        let coordinator = self.connection.as_ref().ok_or(SessionError::NoConnection)?;
        let Some(id) = self.attached else {
            self.log.info(format_args!("no attached context"));
            return Ok(());
        };

        if self.source_map.server_source().synthetic_statement() {
            // the stop event follows once the step completes
            self.log.debug(format_args!(
                "preceding 'debugger;' statement -> sending 'next' to remote"
            ));
            coordinator.control("next", Some(id)).await?;
        } else if coordinator.context(id)?.is_stopped() {
            self.outbox.push(SessionEvent::Stopped {
                reason: "pause",
                thread_id: id,
            });
        }
        Ok(())
    }

    async fn control(&mut self, command: &'static str, thread_id: ContextId) -> Result<ContextId, SessionError> {
        let coordinator = self.connection.as_ref().ok_or(SessionError::NoConnection)?;
        let context_id = self.context_for(thread_id);
        if let Err(err) = coordinator.context(context_id) {
            self.log.warn(format_args!("{command}: {err}"));
            exit_after(coordinator, &err, &self.log).await;
            return Err(err.into());
        }
        coordinator.control(command, Some(context_id)).await?;
        Ok(context_id)
    }

    fn mark_running(&self, context_id: ContextId) {
        if let Some(coordinator) = &self.connection {
            coordinator.mark_running(context_id);
        }
    }

    /// Handles the continue request
    pub async fn handle_continue(&mut self, args: ThreadArguments) -> Result<ContinueResponseBody, SessionError> {
        self.log.info(format_args!("continue request"));
        let context_id = self.control("continue", args.thread_id).await?;
        self.mark_running(context_id);
        self.outbox.push(SessionEvent::Continued {
            thread_id: context_id,
        });
        Ok(ContinueResponseBody {
            all_threads_continued: false,
        })
    }

    /// Handles the next request; the stop arrives as a remote notification.
    pub async fn handle_next(&mut self, args: ThreadArguments) -> Result<(), SessionError> {
        self.log
            .info(format_args!("next request for thread {}", args.thread_id));
        let context_id = self.control("next", args.thread_id).await?;
        self.mark_running(context_id);
        Ok(())
    }

    /// Handles the stepIn request
    pub async fn handle_step_in(&mut self, args: ThreadArguments) -> Result<(), SessionError> {
        self.log.info(format_args!("stepIn request"));
        let context_id = self.control("step", args.thread_id).await?;
        self.mark_running(context_id);
        Ok(())
    }

    /// Handles the stepOut request
    pub async fn handle_step_out(&mut self, args: ThreadArguments) -> Result<(), SessionError> {
        self.log
            .info(format_args!("stepOut request for thread {}", args.thread_id));
        let context_id = self.control("step_out", args.thread_id).await?;
        self.mark_running(context_id);
        Ok(())
    }

    /// Handles the pause request
    pub async fn handle_pause(&mut self, args: ThreadArguments) -> Result<(), SessionError> {
        self.log.info(format_args!("pause request"));
        let context_id = self.control("pause", args.thread_id).await?;
        self.outbox.push(SessionEvent::Stopped {
            reason: "pause",
            thread_id: context_id,
        });
        Ok(())
    }

    /// Handles the threads request: the attached context is the only thread.
    pub async fn handle_threads(&mut self) -> Result<ThreadsResponseBody, SessionError> {
        self.log.info(format_args!("threads request"));
        let coordinator = self.connection.as_ref().ok_or(SessionError::NoConnection)?;
        let mut threads = Vec::new();
        if let Some(id) = self.attached {
            match coordinator.context(id) {
                Ok(context) => threads.push(Thread {
                    id,
                    name: context.name,
                }),
                Err(err) => {
                    self.log.warn(format_args!("threads: {err}"));
                    exit_after(coordinator, &err, &self.log).await;
                    return Err(err.into());
                }
            }
        }
        Ok(ThreadsResponseBody { threads })
    }

    /// Handles the stackTrace request
    ///
    /// A new trace means a new stop, so previously materialized variables are
    /// dropped. Frames are translated concurrently; a frame that cannot be
    /// translated is shown as "not available".
    pub async fn handle_stack_trace(
        &mut self,
        args: StackTraceArguments,
    ) -> Result<StackTraceResponseBody, SessionError> {
        self.log.info(format_args!("stackTrace request"));
        let coordinator = self.connection.as_ref().ok_or(SessionError::NoConnection)?;
        let context_id = self.context_for(args.thread_id);
        let context = match coordinator.context(context_id) {
            Ok(context) => context,
            Err(err) => {
                self.log.warn(format_args!("stackTrace: {err}"));
                exit_after(coordinator, &err, &self.log).await;
                return Err(err.into());
            }
        };
        if context.name.is_empty() {
            self.log.error(format_args!(
                "found context with id {context_id}, but it has no name"
            ));
        }

        let trace = coordinator.stacktrace(context_id).await?;
        self.variables.clear();
        let frames = self.frames.replace(context_id, &trace).to_vec();

        let levels = args.levels.filter(|&levels| levels > 0).unwrap_or(usize::MAX);
        let window: Vec<&FrameInfo> = frames
            .iter()
            .skip(args.start_frame.unwrap_or_default())
            .take(levels)
            .collect();
        let results = window
            .iter()
            .map(|frame| self.locate_frame(coordinator, &context, frame))
            .collect::<Vec<_>>()
            .join()
            .await;

        let mut stack_frames = Vec::with_capacity(window.len());
        for (frame, result) in window.into_iter().zip(results) {
            match result {
                Ok(stack_frame) => stack_frames.push(stack_frame),
                Err(err) => {
                    if frame.id == 0 {
                        self.log.error(format_args!(
                            "no local position for '{}': {err}",
                            context.name
                        ));
                        self.report_top_frame_failure(&err).await;
                    } else {
                        self.log.info(format_args!(
                            "stack trace: no local position for '{}': {err}",
                            context.name
                        ));
                    }
                    if let Some(source) = self.source_map.located_source(frame.line, Some(&frame.url)) {
                        self.log.debug(format_args!(
                            "frame {} lies in {}, but its line does not match",
                            frame.id,
                            source.name()
                        ));
                    }
                    stack_frames.push(StackFrame {
                        id: frame.id,
                        name: "not available".to_owned(),
                        source: None,
                        line: 0,
                        column: 0,
                    });
                }
            }
        }

        Ok(StackTraceResponseBody {
            stack_frames,
            total_frames: Some(trace.len()),
        })
    }

    async fn locate_frame(
        &self,
        coordinator: &Coordinator<R::Connection>,
        context: &ContextInfo,
        frame: &FrameInfo,
    ) -> Result<StackFrame, SessionError> {
        self.log.debug(format_args!(
            "frame {}: context '{}' url '{}' line {}",
            frame.id, context.name, frame.url, frame.line
        ));

        // required scripts are fetched once and cached
        if frame.url != context.name && self.source_map.dynamic_script(&frame.url).is_none() {
            let lines = coordinator.source(&frame.url, self.attached).await?;
            self.log.info(format_args!(
                "retrieved dynamic server source for: {}",
                frame.url
            ));
            self.source_map
                .add_dynamic_script(frame.url.clone(), ServerSource::build(frame.url.clone(), lines, false, None)?);
        }

        let position = self
            .source_map
            .to_local_position(frame.line, Some(&frame.url), &self.prompt)
            .await?;
        self.log.info(format_args!(
            "position: line {} in file '{}'",
            position.line,
            position.source.name()
        ));
        Ok(StackFrame {
            id: frame.id,
            name: position.source.name().to_owned(),
            source: Some(frame_source(&position.source, "emphasize")),
            line: position.line,
            column: 0,
        })
    }

    async fn report_top_frame_failure(&mut self, err: &SessionError) {
        let message = err.to_string();
        if message.contains("debugger;") {
            if !mem::replace(&mut self.notices.debugger_hint, true) {
                self.show(&message, Severity::Information, None).await;
            }
        } else if let SessionError::Mapping(MappingError::OutOfSync { snippet, .. }) = err {
            if !mem::replace(&mut self.notices.line_mismatch, true) {
                self.show(
                    "Line mismatch: see current lines in temporary file",
                    Severity::Information,
                    Some(snippet),
                )
                .await;
            }
        } else if !mem::replace(&mut self.notices.source_mismatch, true) {
            self.show(
                "Source mismatch: use Breakpoints and Continue.",
                Severity::Information,
                None,
            )
            .await;
        }
    }

    /// Handles the scopes request: one "Locals" scope per frame.
    pub async fn handle_scopes(&mut self, args: ScopesArguments) -> Result<ScopesResponseBody, SessionError> {
        self.log.info(format_args!("scopes request"));
        let coordinator = self.connection.as_ref().ok_or(SessionError::NoConnection)?;
        let frame = self.frames.get(args.frame_id)?.clone();
        coordinator.context(frame.context_id)?;

        // frame ids start at 0 but the editor only expands references > 0
        let reference: VariablesReference = frame.id.unsigned_abs() + 1;
        let locals = coordinator.variables(frame.context_id, frame.depth).await?;

        self.variables.create_scope(reference, frame.context_id);
        for local in &locals {
            self.variables.create_variable(
                &local.name,
                &local.value,
                frame.context_id,
                reference,
                None,
            )?;
        }

        Ok(ScopesResponseBody {
            scopes: vec![Scope {
                name: "Locals".to_owned(),
                presentation_hint: None,
                variables_reference: reference,
                expensive: false,
            }],
        })
    }

    /// Handles the variables request
    pub async fn handle_variables(
        &mut self,
        args: VariablesArguments,
    ) -> Result<VariablesResponseBody, SessionError> {
        self.log.info(format_args!(
            "variables request {}",
            args.variables_reference
        ));
        let coordinator = self.connection.as_ref().ok_or(SessionError::NoConnection)?;
        let context_id = self.variables.container(args.variables_reference)?.context_id;
        coordinator.context(context_id)?;

        let evaluator = RemoteEvaluator { coordinator };
        let variables = self
            .variables
            .variables(args.variables_reference, &evaluator)
            .await?;
        Ok(VariablesResponseBody { variables })
    }

    /// Handles the setVariable request
    pub async fn handle_set_variable(
        &mut self,
        args: SetVariableArguments,
    ) -> Result<SetVariableResponseBody, SessionError> {
        self.log.info(format_args!(
            "setVariable request with variablesReference {}",
            args.variables_reference
        ));
        let coordinator = self.connection.as_ref().ok_or(SessionError::NoConnection)?;
        let variable = self
            .variables
            .unique_variable(args.variables_reference, &args.name)?;
        let evaluate_name = variable
            .evaluate_name
            .clone()
            .filter(|name| !name.is_empty())
            .ok_or_else(|| VariablesError::NoEvaluateName(variable.name.clone()))?;
        let context_id = self.variables.container(args.variables_reference)?.context_id;
        coordinator.context(context_id)?;

        coordinator
            .request(Command::set_variable(
                context_id,
                &evaluate_name,
                coerce_value(&args.value),
            ))
            .await
            .map_err(|source| SessionError::SetVariable {
                name: args.name.clone(),
                source,
            })?;

        let updated = self
            .variables
            .set_display_value(args.variables_reference, &args.name, &args.value)?;
        Ok(SetVariableResponseBody {
            value: updated.value,
            type_: Some(updated.type_),
            variables_reference: updated.variables_reference,
        })
    }

    /// Handles the evaluate request
    pub async fn handle_evaluate(&mut self, args: EvaluateArguments) -> Result<EvaluateResponseBody, SessionError> {
        let coordinator = self.connection.as_ref().ok_or(SessionError::NoConnection)?;
        let frame_id = args.frame_id.ok_or(SessionError::NoFrame)?;
        let context_id = self.frames.get(frame_id)?.context_id;
        coordinator.context(context_id)?;

        let evaluated = coordinator
            .evaluate(context_id, &args.expression)
            .await
            .map_err(|source| SessionError::Evaluate {
                expression: args.expression.clone(),
                source,
            })?;
        let result = match &evaluated.value {
            Value::String(text) if evaluated.type_ == "string" => {
                decode_remote_string(text).into_owned()
            }
            Value::String(text) => text.clone(),
            other => other.to_string(),
        };
        Ok(EvaluateResponseBody {
            result,
            type_: Some(evaluated.type_),
            variables_reference: 0,
        })
    }

    /// Handles the source request: the remote text of the attached context.
    pub fn handle_source(&self, args: &SourceArguments) -> Result<Option<SourceResponseBody>, SessionError> {
        let Some(reference) = args.source_reference else {
            self.log.warn(format_args!("source request without sourceReference"));
            return Ok(None);
        };
        self.log
            .info(format_args!("source request for sourceReference {reference}"));
        if self.connection.is_none() {
            return Err(SessionError::NoConnection);
        }
        Ok(Some(SourceResponseBody {
            content: self.source_map.server_source().text(),
            mime_type: Some("text/javascript".to_owned()),
        }))
    }

    /// Handles the disconnect request
    ///
    /// A launched script, or any script when asked to, is stopped if it is
    /// currently paused; stopping a running context is not reliable.
    pub async fn handle_disconnect(&mut self, args: &DisconnectArguments) -> Result<(), SessionError> {
        self.log.info(format_args!("disconnect request"));
        let terminate = self.mode == Some(Mode::Launch)
            || self.terminate_on_disconnect
            || args.terminate_debuggee == Some(true);
        let Some(coordinator) = self.connection.as_ref() else {
            self.reset();
            return Ok(());
        };

        if let Some(id) = self.attached {
            match coordinator.all_available_contexts().await {
                Ok(contexts) => match contexts.iter().find(|context| context.id == id) {
                    Some(context) if terminate => {
                        if context.is_stopped() {
                            self.log.debug(format_args!("terminating debuggee ({id})"));
                            if let Err(err) = coordinator.control("stop", Some(id)).await {
                                self.log.warn(format_args!("stop failed: {err}"));
                            }
                        } else {
                            self.log.warn(format_args!(
                                "not terminating debuggee ({id}), it is not stopped"
                            ));
                        }
                    }
                    Some(_) => {}
                    None => self
                        .log
                        .debug(format_args!("debuggee ({id}) not running anymore")),
                },
                Err(err) => self.log.warn(format_args!(
                    "could not read contexts before disconnecting: {err}"
                )),
            }
        }

        if let Err(err) = coordinator.control("exit", None).await {
            self.log.warn(format_args!("exit failed: {err}"));
        }
        self.close_connection().await;
        self.reset();
        Ok(())
    }

    /// Waits for the next remote notification or the end of a started script.
    ///
    /// Never completes while there is nothing to wait for.
    pub async fn next_signal(&mut self) -> Signal {
        let Self {
            remote_events,
            script_finished,
            ..
        } = self;
        let remote = async move {
            match remote_events {
                Some(events) => events.recv().await.unwrap_or(RemoteEvent::Closed),
                None => pending().await,
            }
        };
        let finished = async move {
            match script_finished {
                Some(finished) => finished.await.is_ok(),
                None => pending().await,
            }
        };
        tokio::select! {
            event = remote => Signal::Remote(event),
            completed = finished => Signal::ScriptFinished { completed },
        }
    }

    /// Reacts to a signal returned by [`Self::next_signal`].
    pub async fn handle_signal(&mut self, signal: Signal) {
        match signal {
            Signal::Remote(event) => self.handle_remote_event(event).await,
            Signal::ScriptFinished { completed } => {
                self.script_finished = None;
                if completed {
                    self.log.info(format_args!("script finished"));
                    self.outbox.push(SessionEvent::Terminated);
                }
            }
        }
    }

    async fn handle_remote_event(&mut self, event: RemoteEvent) {
        if let Some(coordinator) = &self.connection {
            coordinator.handle_event(&event);
        }
        match event {
            RemoteEvent::ContextPaused(id) => {
                // every stop, whether breakpoint or finished step, arrives here
                if self.attached == Some(id) {
                    self.log.debug(format_args!("sending 'stopped' to the editor"));
                    self.outbox.push(SessionEvent::Stopped {
                        reason: "breakpoint",
                        thread_id: id,
                    });
                }
            }
            RemoteEvent::NewContext { id, name, stopped } => self.log.info(format_args!(
                "new context on target: {id}, context name: \"{name}\", stopped: {stopped}"
            )),
            RemoteEvent::Error(reason) => {
                self.log
                    .error(format_args!("error on remote connection: {reason}"));
                self.outbox.push(SessionEvent::Output(format!("{reason}\n")));
                self.close_connection().await;
                self.outbox.push(SessionEvent::Terminated);
            }
            RemoteEvent::Closed => {
                self.log.info(format_args!("remote closed the connection"));
                self.close_connection().await;
                self.outbox.push(SessionEvent::Terminated);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use test_case::test_case;

    use super::*;

    #[test_case("null", Some(json!(null)))]
    #[test_case("undefined", None)]
    #[test_case("42", Some(json!(42)))]
    #[test_case("-7", Some(json!(-7)))]
    #[test_case("1.5", Some(json!(1.5)))]
    #[test_case("true", Some(json!(true)))]
    #[test_case("false", Some(json!(false)))]
    #[test_case("abc1", Some(json!("abc1")))]
    #[test_case("NaN", Some(json!("NaN")))]
    fn edited_values_are_coerced(text: &str, expected: Option<Value>) {
        assert_eq!(coerce_value(text), expected);
    }

    #[test]
    fn frame_ids_index_the_last_trace() {
        let trace = [
            RemoteFrame {
                url: "main".to_owned(),
                line: 4,
                r_depth: 0,
            },
            RemoteFrame {
                url: "lib".to_owned(),
                line: 9,
                r_depth: 1,
            },
        ];
        let mut frames = FrameMap::default();
        frames.replace(3, &trace);
        let frame = frames.get(1).unwrap();
        assert_eq!((frame.context_id, frame.depth, frame.url.as_str()), (3, 1, "lib"));
        assert!(matches!(frames.get(2), Err(SessionError::UnknownFrame(2))));
        assert!(matches!(frames.get(-1), Err(SessionError::UnknownFrame(-1))));
    }
}
