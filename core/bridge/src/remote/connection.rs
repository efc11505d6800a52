use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    net::TcpStream,
    sync::{
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        oneshot,
    },
    task::JoinHandle,
    time::{Instant, sleep, timeout},
};
use uuid::Uuid;

use super::{
    Command, RemoteConnection, RemoteConnector, RemoteEvent, RemoteResponse, wire,
};
use crate::{error::RemoteError, logging::Logger};

/// Requests waiting for their response.
///
/// Once `closed` is set no request is registered anymore; the reader sets it
/// under the same lock it drains the waiters with.
#[derive(Debug, Default)]
struct Waiters {
    requests: FxHashMap<Uuid, oneshot::Sender<RemoteResponse>>,
    closed: bool,
}

impl Waiters {
    fn close(&mut self) {
        self.closed = true;
        self.requests.clear();
    }
}

type Pending = Arc<Mutex<Waiters>>;

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A connection to the remote debugger over any byte stream.
///
/// A reader task matches responses to pending requests by id and forwards
/// everything else as [`RemoteEvent`]s.
pub struct RemoteClient {
    writer: tokio::sync::Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    pending: Pending,
    reader: JoinHandle<()>,
    log: Logger,
}

impl std::fmt::Debug for RemoteClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteClient")
            .field("pending", &locked(&self.pending).requests.len())
            .finish_non_exhaustive()
    }
}

impl RemoteClient {
    /// Starts the reader task and returns the client with its event stream.
    pub fn new<R, W>(reader: R, writer: W, log: Logger) -> (Self, UnboundedReceiver<RemoteEvent>)
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (events, receiver) = mpsc::unbounded_channel();
        let pending = Pending::default();
        let reader = tokio::spawn(read_messages(reader, Arc::clone(&pending), events, log));

        let client = Self {
            writer: tokio::sync::Mutex::new(Box::new(writer)),
            pending,
            reader,
            log,
        };
        (client, receiver)
    }
}

impl RemoteConnection for RemoteClient {
    async fn send_request(&self, command: Command) -> Result<RemoteResponse, RemoteError> {
        let line = wire::encode(&command)?;
        let (sender, receiver) = oneshot::channel();
        {
            let mut pending = locked(&self.pending);
            if pending.closed {
                return Err(RemoteError::Closed);
            }
            pending.requests.insert(command.id(), sender);
        }
        self.log.debug(format_args!("request: {}", line.trim_end()));

        let written = async {
            let mut writer = self.writer.lock().await;
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await
        }
        .await;
        if let Err(err) = written {
            locked(&self.pending).requests.remove(&command.id());
            return Err(err.into());
        }

        receiver.await.map_err(|_| RemoteError::Closed)
    }

    async fn disconnect(&self) {
        self.reader.abort();
        locked(&self.pending).close();
        if let Err(err) = self.writer.lock().await.shutdown().await {
            self.log.debug(format_args!("shutdown failed: {err}"));
        }
    }
}

impl Drop for RemoteClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_messages<R>(
    reader: R,
    pending: Pending,
    events: UnboundedSender<RemoteEvent>,
    log: Logger,
) where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => {
                log.warn(format_args!("connection error: {err}"));
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        log.debug(format_args!("received: {line}"));

        let message = match wire::decode(&line) {
            Ok(message) => message,
            Err(err) => {
                log.warn(format_args!("{err}"));
                continue;
            }
        };

        if let Some(id) = message.id {
            let waiter = locked(&pending).requests.remove(&id);
            match waiter {
                Some(waiter) => {
                    let _ignored = waiter.send(message);
                }
                None if message.name == "error" => forward(&events, &message, &log),
                None => log.debug(format_args!("discarding response {id} nobody waits for")),
            }
            continue;
        }
        forward(&events, &message, &log);
    }

    locked(&pending).close();
    let _ignored = events.send(RemoteEvent::Closed);
}

fn forward(events: &UnboundedSender<RemoteEvent>, message: &RemoteResponse, log: &Logger) {
    let event = match message.name.as_str() {
        "stopped" | "paused" => message.context_id.map(RemoteEvent::ContextPaused),
        "new_context" => message.context_id.map(|id| RemoteEvent::NewContext {
            id,
            name: message
                .content
                .get("contextName")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned(),
            stopped: message
                .content
                .get("paused")
                .and_then(Value::as_bool)
                .unwrap_or_default(),
        }),
        "error" => message.error_message().map(RemoteEvent::Error),
        _ => None,
    };
    match event {
        Some(event) => {
            let _ignored = events.send(event);
        }
        None => log.debug(format_args!("ignoring '{}' notification", message.name)),
    }
}

/// Connects to the remote debugger over TCP.
#[derive(Debug, Clone, Copy)]
pub struct TcpConnector {
    log: Logger,
}

impl TcpConnector {
    /// Creates a connector.
    pub fn new(log: Logger) -> Self {
        Self { log }
    }
}

impl RemoteConnector for TcpConnector {
    type Connection = RemoteClient;

    async fn probe(&self, host: &str, port: u16, bound: Duration, interval: Duration) -> bool {
        let deadline = Instant::now() + bound;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if let Ok(Ok(_stream)) = timeout(remaining, TcpStream::connect((host, port))).await {
                return true;
            }
            if Instant::now() + interval >= deadline {
                self.log
                    .debug(format_args!("port {host}:{port} not open after {bound:?}"));
                return false;
            }
            sleep(interval).await;
        }
    }

    async fn connect(
        &self,
        host: &str,
        port: u16,
    ) -> Result<(RemoteClient, UnboundedReceiver<RemoteEvent>), RemoteError> {
        let stream = TcpStream::connect((host, port))
            .await
            .map_err(|source| RemoteError::Connect {
                host: host.to_owned(),
                port,
                source,
            })?;
        self.log.info(format_args!("connected to {host}:{port}"));
        let (reader, writer) = stream.into_split();
        Ok(RemoteClient::new(reader, writer, self.log))
    }
}
