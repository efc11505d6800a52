//! Launch and attach configuration, bounded waits, and workspace discovery.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use walkdir::{DirEntry, WalkDir};

/// Default remote debugger port.
pub const DEFAULT_DEBUGGER_PORT: u16 = 8089;

/// Default remote host.
pub const DEFAULT_HOST: &str = "localhost";

fn default_host() -> String {
    DEFAULT_HOST.to_owned()
}

const fn default_port() -> u16 {
    DEFAULT_DEBUGGER_PORT
}

/// Arguments of the `launch` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchArguments {
    /// Path of the local script to run on the server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,
    /// Remote host.
    #[serde(default = "default_host")]
    pub host: String,
    /// Remote debugger port.
    #[serde(default = "default_port")]
    pub debugger_port: u16,
    /// Stop at the first line.
    #[serde(default)]
    pub stop_on_entry: bool,
    /// Workspace folder holding the local sources.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace: Option<PathBuf>,
    /// Stop the script when the editor disconnects.
    #[serde(default)]
    pub terminate_on_disconnect: bool,
}

impl Default for LaunchArguments {
    fn default() -> Self {
        Self {
            script: None,
            host: default_host(),
            debugger_port: default_port(),
            stop_on_entry: false,
            workspace: None,
            terminate_on_disconnect: false,
        }
    }
}

/// Arguments of the `attach` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachArguments {
    /// Remote host.
    #[serde(default = "default_host")]
    pub host: String,
    /// Remote debugger port.
    #[serde(default = "default_port")]
    pub debugger_port: u16,
    /// Stop the script when the editor disconnects.
    #[serde(default)]
    pub terminate_on_disconnect: bool,
    /// Pause a running script right after attaching.
    #[serde(default)]
    pub break_on_attach: bool,
    /// Workspace folder holding the local sources.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace: Option<PathBuf>,
}

impl Default for AttachArguments {
    fn default() -> Self {
        Self {
            host: default_host(),
            debugger_port: default_port(),
            terminate_on_disconnect: false,
            break_on_attach: false,
            workspace: None,
        }
    }
}

/// Bounded waits and remote helper names used by a session.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// First check whether the remote port is already open.
    pub port_probe: Duration,
    /// Wait for the port after asking the editor to start the script.
    pub port_confirm: Duration,
    /// Interval between two port checks.
    pub port_poll_interval: Duration,
    /// Sleep between two context directory polls.
    pub context_poll_interval: Duration,
    /// How often the context directory is polled during launch.
    pub context_poll_attempts: u32,
    /// Timeout for quick picks and other short prompts.
    pub prompt_timeout: Duration,
    /// Timeout for file disambiguation prompts.
    pub file_prompt_timeout: Duration,
    /// Module on the server that shapes documents into JSON.
    pub json_helper: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            port_probe: Duration::from_millis(500),
            port_confirm: Duration::from_secs(10),
            port_poll_interval: Duration::from_millis(100),
            context_poll_interval: Duration::from_millis(500),
            context_poll_attempts: 49,
            prompt_timeout: Duration::from_secs(2 * 60),
            file_prompt_timeout: Duration::from_secs(5 * 60),
            json_helper: "documents-to-json".to_owned(),
        }
    }
}

fn is_skipped_dir(entry: &DirEntry) -> bool {
    entry.depth() > 0
        && entry.file_type().is_dir()
        && entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.starts_with('.') || name == "node_modules")
}

/// Collects every `.js` file below `root`, grouped by file name.
///
/// Hidden directories and `node_modules` are not descended into. Unreadable
/// entries are skipped.
pub fn discover_scripts(root: &Path) -> BTreeMap<String, Vec<PathBuf>> {
    let mut scripts: BTreeMap<String, Vec<PathBuf>> = BTreeMap::new();
    let walker = WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| !is_skipped_dir(entry));

    for entry in walker.filter_map(Result::ok) {
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if path.extension().is_none_or(|ext| ext != "js") {
            continue;
        }
        if let Some(name) = path.file_name().and_then(|name| name.to_str()) {
            scripts
                .entry(name.to_owned())
                .or_default()
                .push(path.to_path_buf());
        }
    }
    scripts
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn launch_arguments_defaults() {
        let args: LaunchArguments =
            serde_json::from_value(serde_json::json!({ "script": "/w/main.js" })).unwrap();
        assert_eq!(args.script.as_deref(), Some("/w/main.js"));
        assert_eq!(args.host, "localhost");
        assert_eq!(args.debugger_port, 8089);
        assert!(!args.stop_on_entry);
        assert!(!args.terminate_on_disconnect);
    }

    #[test]
    fn attach_arguments_from_camel_case() {
        let args: AttachArguments = serde_json::from_value(serde_json::json!({
            "host": "srv",
            "debuggerPort": 9000,
            "breakOnAttach": true,
        }))
        .unwrap();
        assert_eq!(args.host, "srv");
        assert_eq!(args.debugger_port, 9000);
        assert!(args.break_on_attach);
        assert!(args.workspace.is_none());
    }

    #[test]
    fn discovers_scripts_grouped_by_name() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("lib")).unwrap();
        fs::create_dir_all(root.join("other")).unwrap();
        fs::create_dir_all(root.join("node_modules/dep")).unwrap();
        fs::create_dir_all(root.join(".git")).unwrap();
        fs::write(root.join("main.js"), "").unwrap();
        fs::write(root.join("lib/util.js"), "").unwrap();
        fs::write(root.join("other/util.js"), "").unwrap();
        fs::write(root.join("lib/readme.md"), "").unwrap();
        fs::write(root.join("node_modules/dep/index.js"), "").unwrap();
        fs::write(root.join(".git/hook.js"), "").unwrap();

        let scripts = discover_scripts(root);
        assert_eq!(scripts.keys().collect::<Vec<_>>(), ["main.js", "util.js"]);
        assert_eq!(scripts["main.js"], [root.join("main.js")]);
        assert_eq!(
            scripts["util.js"],
            [root.join("lib/util.js"), root.join("other/util.js")]
        );
    }
}
