//! Integration tests for the `jsrdbg-dap` binary.
//!
//! Each test spawns the adapter on stdio and speaks Content-Length framed
//! JSON to it, without any remote debugger running.

use std::io::{BufRead, BufReader, Read, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

use serde_json::{Value, json};

struct Adapter {
    child: Child,
    stdin: Option<ChildStdin>,
    reader: BufReader<ChildStdout>,
}

impl Adapter {
    fn spawn() -> Self {
        let mut child = Command::new(env!("CARGO_BIN_EXE_jsrdbg-dap"))
            .args(["--log-level", "None"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .expect("Failed to start debug adapter");

        let stdin = child.stdin.take().expect("Failed to open stdin");
        let stdout = child.stdout.take().expect("Failed to open stdout");
        Self {
            child,
            stdin: Some(stdin),
            reader: BufReader::new(stdout),
        }
    }

    /// Sends a request with a proper Content-Length header.
    fn send(&mut self, seq: u64, command: &str, arguments: Value) {
        let message = json!({
            "seq": seq,
            "type": "request",
            "command": command,
            "arguments": arguments,
        });
        let body = serde_json::to_string(&message).expect("Failed to serialize message");
        let stdin = self.stdin.as_mut().expect("stdin already closed");

        write!(stdin, "Content-Length: {}\r\n\r\n{body}", body.len()).expect("Failed to write message");
        stdin.flush().expect("Failed to flush");
    }

    /// Reads the next framed message, `None` once the adapter closed stdout.
    fn receive(&mut self) -> Option<Value> {
        let mut header = String::new();
        if self.reader.read_line(&mut header).ok()? == 0 {
            return None;
        }

        let length: usize = header
            .trim()
            .strip_prefix("Content-Length:")
            .and_then(|s| s.trim().parse().ok())?;

        let mut empty = String::new();
        self.reader.read_line(&mut empty).ok()?;

        let mut body = vec![0u8; length];
        self.reader.read_exact(&mut body).ok()?;
        serde_json::from_slice(&body).ok()
    }

    fn finish(mut self) -> std::process::ExitStatus {
        drop(self.stdin.take());
        self.child.wait().expect("Failed to wait for the adapter")
    }
}

#[test]
fn initialize_returns_capabilities() {
    let mut adapter = Adapter::spawn();
    adapter.send(
        1,
        "initialize",
        json!({
            "clientID": "test",
            "clientName": "Test Client",
            "adapterID": "jsrdbg",
            "linesStartAt1": true,
            "columnsStartAt1": true,
            "pathFormat": "path"
        }),
    );

    let response = adapter.receive().expect("Failed to read initialize response");
    assert_eq!(response["type"], "response");
    assert_eq!(response["command"], "initialize");
    assert_eq!(response["request_seq"], 1);
    assert_eq!(response["success"], true);
    assert_eq!(response["body"]["supportsConfigurationDoneRequest"], true);
    assert_eq!(response["body"]["supportsSetVariable"], true);

    assert!(adapter.finish().success());
}

#[test]
fn unknown_command_is_rejected() {
    let mut adapter = Adapter::spawn();
    adapter.send(1, "restartFrame", json!({ "frameId": 1 }));

    let response = adapter.receive().expect("Failed to read response");
    assert_eq!(response["command"], "restartFrame");
    assert_eq!(response["success"], false);
    assert_eq!(response["message"], "Unknown command: restartFrame");

    assert!(adapter.finish().success());
}

#[test]
fn threads_need_a_connection() {
    let mut adapter = Adapter::spawn();
    adapter.send(1, "threads", json!({}));

    let response = adapter.receive().expect("Failed to read threads response");
    assert_eq!(response["command"], "threads");
    assert_eq!(response["success"], false);
    assert_eq!(response["message"], "No connection");

    assert!(adapter.finish().success());
}

#[test]
fn launch_without_script_terminates() {
    let mut adapter = Adapter::spawn();
    adapter.send(1, "launch", json!({ "host": "localhost", "debuggerPort": 8089 }));

    let response = adapter.receive().expect("Failed to read launch response");
    assert_eq!(response["command"], "launch");
    assert_eq!(response["success"], false);
    assert_eq!(
        response["message"],
        "Missing required property 'script' in your launch configuration"
    );

    let event = adapter.receive().expect("Failed to read terminated event");
    assert_eq!(event["type"], "event");
    assert_eq!(event["event"], "terminated");

    assert!(adapter.finish().success());
}

#[test]
fn disconnect_ends_the_session() {
    let mut adapter = Adapter::spawn();
    adapter.send(1, "disconnect", json!({}));

    let response = adapter.receive().expect("Failed to read disconnect response");
    assert_eq!(response["command"], "disconnect");
    assert_eq!(response["success"], true);

    assert!(adapter.finish().success());
}
