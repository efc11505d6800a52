//! A debug adapter that lets an editor debug scripts running on a remote
//! jsrdbg server.
//!
//! The editor speaks the Debug Adapter Protocol to the bridge; the bridge
//! drives script contexts on the remote engine over the jsrdbg line protocol.
//!
//! # Components
//!
//! - [`source_map`]: translates lines between the remote script text, which
//!   inlines required scripts, and the user's local files
//! - [`variables`]: turns remote values into the lazily expanded variables tree
//! - [`dap`]: the protocol front end and the session controller
//! - [`remote`]: the connection to the remote debugger and its context directory
//! - [`prompt`]: questions and messages for the user, asked through the editor
//!
//! # Example
//!
//! ```no_run
//! use jsrdbg_bridge::{
//!     config::BridgeConfig,
//!     dap::{DapServer, DebugSession},
//!     logging::{LogConfig, Logger, targets},
//!     prompt::HeadlessPrompt,
//!     remote::TcpConnector,
//! };
//!
//! # async fn serve() -> std::io::Result<()> {
//! let logs = LogConfig::default();
//! let session = DebugSession::new(
//!     TcpConnector::new(logs.logger(targets::REMOTE)),
//!     HeadlessPrompt::new(logs.logger(targets::IPC)),
//!     BridgeConfig::default(),
//!     logs.clone(),
//! );
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:4711").await?;
//! let (stream, _) = listener.accept().await?;
//! let (input, output) = stream.into_split();
//! DapServer::new(session, logs.logger(targets::SERVER))
//!     .run(input, output)
//!     .await
//! # }
//! ```

pub mod config;
pub mod dap;
pub mod encoding;
pub mod error;
pub mod logging;
pub mod prompt;
pub mod remote;
pub mod source_map;
pub mod variables;
