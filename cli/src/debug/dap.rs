//! Debug adapter runner for the CLI.
//!
//! Wires a [`DebugSession`] to the remote jsrdbg connector and the chosen
//! editor prompt, then serves the Debug Adapter Protocol over stdio or over a
//! single TCP client connection.

use std::io;

use jsrdbg_bridge::{
    config::BridgeConfig,
    dap::{DapServer, DebugSession},
    logging::{LogConfig, targets},
    prompt::EditorPrompt,
    remote::TcpConnector,
};
use tokio::net::TcpListener;

/// Transport the editor talks to the adapter over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DapTransportMode {
    /// Standard input/output (default).
    Stdio,
    /// A single client connecting to the given local port.
    Tcp(u16),
}

/// Runs the adapter until the editor disconnects.
pub async fn run_dap_server<P: EditorPrompt>(
    mode: DapTransportMode,
    prompt: P,
    config: BridgeConfig,
    logs: &LogConfig,
) -> io::Result<()> {
    let log = logs.logger(targets::SERVER);
    let session = DebugSession::new(
        TcpConnector::new(logs.logger(targets::REMOTE)),
        prompt,
        config,
        logs.clone(),
    );
    let mut server = DapServer::new(session, log);

    match mode {
        DapTransportMode::Stdio => {
            log.info(format_args!("starting debug adapter on stdio"));
            server.run(tokio::io::stdin(), tokio::io::stdout()).await?;
        }
        DapTransportMode::Tcp(port) => {
            let listener = TcpListener::bind(("127.0.0.1", port)).await?;
            log.info(format_args!("waiting for the editor on {}", listener.local_addr()?));

            // One connection per debug session.
            let (stream, peer) = listener.accept().await?;
            log.info(format_args!("editor connected from {peer}"));
            let (input, output) = stream.into_split();
            server.run(input, output).await?;
        }
    }

    log.info(format_args!("debug adapter stopped"));
    Ok(())
}
