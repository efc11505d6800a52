use std::{
    collections::VecDeque,
    path::PathBuf,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    net::TcpStream,
    sync::oneshot,
    task::JoinHandle,
    time::timeout,
};

use super::{EditorPrompt, Severity};
use crate::{config::BridgeConfig, error::PromptError, logging::Logger};

/// Questions waiting for their answer, oldest first per answer event.
///
/// Answers carry no request id, so questions of the same kind are answered in
/// the order they were asked.
#[derive(Debug, Default)]
struct Waiting {
    next_id: u64,
    queues: FxHashMap<String, VecDeque<(u64, oneshot::Sender<Value>)>>,
}

impl Waiting {
    fn push(&mut self, event: &str, sender: oneshot::Sender<Value>) -> u64 {
        self.next_id += 1;
        self.queues
            .entry(event.to_owned())
            .or_default()
            .push_back((self.next_id, sender));
        self.next_id
    }

    /// The oldest waiter for `event` that still listens.
    fn take(&mut self, event: &str) -> Option<oneshot::Sender<Value>> {
        let queue = self.queues.get_mut(event)?;
        let waiter = loop {
            match queue.pop_front() {
                Some((_, sender)) if sender.is_closed() => {}
                other => break other,
            }
        };
        if queue.is_empty() {
            self.queues.remove(event);
        }
        waiter.map(|(_, sender)| sender)
    }

    fn forget(&mut self, event: &str, id: u64) {
        if let Some(queue) = self.queues.get_mut(event) {
            queue.retain(|(waiting, _)| *waiting != id);
            if queue.is_empty() {
                self.queues.remove(event);
            }
        }
    }

    fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    fn clear(&mut self) {
        self.queues.clear();
    }
}

type Waiters = Arc<Mutex<Waiting>>;

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One line of the extension channel.
#[derive(Debug, Serialize, Deserialize)]
struct IpcMessage {
    event: String,
    #[serde(default)]
    data: Value,
}

/// Talks to the editor extension with line-delimited JSON.
///
/// Each question waits for its answer event with a bounded timeout; answers
/// nobody waits for are logged and dropped.
pub struct IpcPrompt {
    writer: tokio::sync::Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    waiters: Waiters,
    reader: JoinHandle<()>,
    prompt_timeout: Duration,
    file_prompt_timeout: Duration,
    log: Logger,
}

impl std::fmt::Debug for IpcPrompt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpcPrompt")
            .field("prompt_timeout", &self.prompt_timeout)
            .field("file_prompt_timeout", &self.file_prompt_timeout)
            .finish_non_exhaustive()
    }
}

impl IpcPrompt {
    /// Connects to the extension listening on `port` of the local host.
    pub async fn connect(port: u16, config: &BridgeConfig, log: Logger) -> Result<Self, PromptError> {
        log.debug(format_args!("connect to VS Code extension on port {port}"));
        let stream = timeout(config.prompt_timeout, TcpStream::connect(("127.0.0.1", port)))
            .await
            .map_err(|_| PromptError::Timeout)??;
        log.debug(format_args!("connected to VS Code extension"));
        let (reader, writer) = stream.into_split();
        Ok(Self::new(reader, writer, config, log))
    }

    /// Runs the channel over an existing byte stream.
    pub fn new<R, W>(reader: R, writer: W, config: &BridgeConfig, log: Logger) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let waiters = Waiters::default();
        let reader = tokio::spawn(read_answers(reader, Arc::clone(&waiters), log));
        Self {
            writer: tokio::sync::Mutex::new(Box::new(writer)),
            waiters,
            reader,
            prompt_timeout: config.prompt_timeout,
            file_prompt_timeout: config.file_prompt_timeout,
            log,
        }
    }

    async fn emit(&self, event: &str, data: Value) -> Result<(), PromptError> {
        let mut line = serde_json::to_string(&IpcMessage {
            event: event.to_owned(),
            data,
        })
        .map_err(|err| PromptError::Answer {
            event: event.to_owned(),
            reason: err.to_string(),
        })?;
        line.push('\n');

        let mut writer = self.writer.lock().await;
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }

    fn wait_for(&self, answer_event: &str) -> (u64, oneshot::Receiver<Value>) {
        let (sender, receiver) = oneshot::channel();
        let id = locked(&self.waiters).push(answer_event, sender);
        (id, receiver)
    }

    async fn request(
        &self,
        event: &str,
        answer_event: &str,
        data: Value,
        bound: Duration,
    ) -> Result<Value, PromptError> {
        self.log.debug(format_args!("{event}"));
        let (id, answer) = self.wait_for(answer_event);
        let result = match self.emit(event, data).await {
            Ok(()) => match timeout(bound, answer).await {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(_)) => Err(PromptError::Closed),
                Err(_) => Err(PromptError::Timeout),
            },
            Err(err) => Err(err),
        };
        locked(&self.waiters).forget(answer_event, id);
        result
    }

    /// Closes the channel.
    pub fn disconnect(&self) {
        self.reader.abort();
        locked(&self.waiters).clear();
    }
}

impl Drop for IpcPrompt {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

fn answer_as<T: for<'de> Deserialize<'de>>(event: &str, value: Value) -> Result<T, PromptError> {
    serde_json::from_value(value).map_err(|err| PromptError::Answer {
        event: event.to_owned(),
        reason: err.to_string(),
    })
}

impl EditorPrompt for IpcPrompt {
    async fn ask_for_correct_source_file(
        &self,
        name: &str,
        candidates: &[PathBuf],
        remote_lines: Option<&[String]>,
    ) -> Result<PathBuf, PromptError> {
        let answer = self
            .request(
                "askForCorrectSourceFile",
                "correctSourceFileProvided",
                json!([name, candidates, remote_lines]),
                self.file_prompt_timeout,
            )
            .await?;
        answer_as("correctSourceFileProvided", answer)
    }

    async fn show_context_quick_pick(&self, options: &[String]) -> Result<String, PromptError> {
        let answer = self
            .request(
                "showContextQuickPick",
                "contextChosen",
                json!([options]),
                self.prompt_timeout,
            )
            .await?;
        answer_as("contextChosen", answer)
    }

    async fn display_message(
        &self,
        message: &str,
        severity: Severity,
        snippet: Option<&str>,
    ) -> Result<(), PromptError> {
        self.emit(
            "displayMessage",
            json!({
                "message": message,
                "source": snippet.unwrap_or_default(),
                "type": severity,
            }),
        )
        .await
    }

    async fn run_script_to_completion(
        &self,
        script: &str,
    ) -> Result<oneshot::Receiver<()>, PromptError> {
        self.log.info(format_args!("debug script {script}"));
        let (id, answer) = self.wait_for("scriptFinished");
        if let Err(err) = self.emit("debugScript", json!([script])).await {
            locked(&self.waiters).forget("scriptFinished", id);
            return Err(err);
        }

        let (mut finished, receiver) = oneshot::channel();
        let script = script.to_owned();
        let log = self.log;
        // gives up once the session stops listening, so later runs get the answer
        tokio::spawn(async move {
            let answered = tokio::select! {
                answer = answer => answer.is_ok(),
                () = finished.closed() => false,
            };
            if answered {
                log.info(format_args!("script {script} finished"));
                let _ignored = finished.send(());
            }
        });
        Ok(receiver)
    }
}

async fn read_answers<R>(reader: R, waiters: Waiters, log: Logger)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => {
                log.warn(format_args!("extension channel error: {err}"));
                break;
            }
        };
        let message: IpcMessage = match serde_json::from_str(&line) {
            Ok(message) => message,
            Err(err) => {
                log.warn(format_args!("malformed message from VS Code extension: {err}"));
                continue;
            }
        };

        let waiter = locked(&waiters).take(&message.event);
        match waiter {
            Some(waiter) => {
                let _ignored = waiter.send(message.data);
            }
            None => log.warn(format_args!(
                "got '{}' message from VS Code extension but we haven't asked!",
                message.event
            )),
        }
    }
    log.debug(format_args!("disconnected from VS Code extension"));
    locked(&waiters).clear();
}
