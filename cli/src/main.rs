//! Command line entry point of the jsrdbg debug adapter.
//!
//! The adapter speaks the Debug Adapter Protocol on stdin/stdout by default.
//! Logs go to stderr, which editors show in their debug console.

mod debug;

use clap::Parser;
use color_eyre::eyre::WrapErr;
use jsrdbg_bridge::{
    config::BridgeConfig,
    logging::{LogConfig, TargetLevel, parse_level, targets},
    prompt::{HeadlessPrompt, IpcPrompt},
};
use log::LevelFilter;
use simple_logger::SimpleLogger;

use crate::debug::dap::{DapTransportMode, run_dap_server};

#[derive(Debug, Parser)]
#[command(author, version, about, name = "jsrdbg-dap")]
struct Opt {
    /// Serve a single editor connection on this TCP port instead of stdio.
    #[arg(long, value_name = "PORT")]
    port: Option<u16>,

    /// Port of the editor extension that answers prompts.
    ///
    /// Without it the adapter runs headless: it picks the first candidate
    /// whenever it would ask, and cannot start scripts for `launch`.
    #[arg(long, value_name = "PORT")]
    ipc: Option<u16>,

    /// Default log level: Debug, Info, Warn, Error or None.
    #[arg(long, value_name = "LEVEL", default_value = "Info", value_parser = parse_level)]
    log_level: LevelFilter,

    /// Log level of a single component, e.g. `RemoteConnection=Debug`.
    #[arg(long = "log-target", value_name = "NAME=LEVEL")]
    log_targets: Vec<TargetLevel>,
}

impl Opt {
    fn log_config(&self) -> LogConfig {
        self.log_targets
            .iter()
            .fold(LogConfig::new(self.log_level), |logs, target| {
                logs.with_target(target.target.clone(), target.level)
            })
    }

    fn transport(&self) -> DapTransportMode {
        self.port.map_or(DapTransportMode::Stdio, DapTransportMode::Tcp)
    }
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    let args = Opt::parse();
    let logs = args.log_config();
    SimpleLogger::new()
        .with_level(logs.max_level())
        .init()
        .wrap_err("could not initialize logging")?;

    let config = BridgeConfig::default();
    let transport = args.transport();
    match args.ipc {
        Some(port) => {
            let prompt = IpcPrompt::connect(port, &config, logs.logger(targets::IPC))
                .await
                .wrap_err_with(|| format!("could not reach the editor extension on port {port}"))?;
            run_dap_server(transport, prompt, config, &logs).await?;
        }
        None => {
            let prompt = HeadlessPrompt::new(logs.logger(targets::IPC));
            run_dap_server(transport, prompt, config, &logs).await?;
        }
    }

    Ok(())
}
