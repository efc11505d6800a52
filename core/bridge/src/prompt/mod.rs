//! Questions and messages for the user, asked through the editor.

mod ipc;

pub use ipc::IpcPrompt;

use std::{future::Future, path::PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::{error::PromptError, logging::Logger};

/// Severity of a message shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational.
    Information,
    /// Warning.
    Warning,
    /// Error.
    Error,
}

/// The editor side of the bridge that talks to the user.
pub trait EditorPrompt: Send + Sync {
    /// Lets the user pick which of several files named `name` is meant.
    ///
    /// `remote_lines` is the remote text, shown for comparison.
    fn ask_for_correct_source_file(
        &self,
        name: &str,
        candidates: &[PathBuf],
        remote_lines: Option<&[String]>,
    ) -> impl Future<Output = Result<PathBuf, PromptError>> + Send;

    /// Lets the user pick one of `options`.
    fn show_context_quick_pick(
        &self,
        options: &[String],
    ) -> impl Future<Output = Result<String, PromptError>> + Send;

    /// Shows a message, with an optional snippet opened next to it.
    fn display_message(
        &self,
        message: &str,
        severity: Severity,
        snippet: Option<&str>,
    ) -> impl Future<Output = Result<(), PromptError>> + Send;

    /// Starts `script` on the server; the receiver resolves when it finishes.
    fn run_script_to_completion(
        &self,
        script: &str,
    ) -> impl Future<Output = Result<oneshot::Receiver<()>, PromptError>> + Send;
}

/// A prompt for sessions without an editor extension.
///
/// Picks the first candidate or option, logs messages, and cannot start scripts.
#[derive(Debug, Clone, Copy)]
pub struct HeadlessPrompt {
    log: Logger,
}

impl HeadlessPrompt {
    /// Creates the prompt.
    pub fn new(log: Logger) -> Self {
        Self { log }
    }
}

impl EditorPrompt for HeadlessPrompt {
    async fn ask_for_correct_source_file(
        &self,
        name: &str,
        candidates: &[PathBuf],
        _remote_lines: Option<&[String]>,
    ) -> Result<PathBuf, PromptError> {
        let chosen = candidates.first().cloned().ok_or_else(|| PromptError::Answer {
            event: "correctSourceFileProvided".to_owned(),
            reason: format!("no candidates for {name}"),
        })?;
        self.log.warn(format_args!(
            "several files named {name}, using {}",
            chosen.display()
        ));
        Ok(chosen)
    }

    async fn show_context_quick_pick(&self, options: &[String]) -> Result<String, PromptError> {
        options.first().cloned().ok_or_else(|| PromptError::Answer {
            event: "contextChosen".to_owned(),
            reason: "nothing to choose from".to_owned(),
        })
    }

    async fn display_message(
        &self,
        message: &str,
        severity: Severity,
        snippet: Option<&str>,
    ) -> Result<(), PromptError> {
        let snippet = snippet.map(|s| format!("\n{s}")).unwrap_or_default();
        match severity {
            Severity::Information => self.log.info(format_args!("{message}{snippet}")),
            Severity::Warning => self.log.warn(format_args!("{message}{snippet}")),
            Severity::Error => self.log.error(format_args!("{message}{snippet}")),
        }
        Ok(())
    }

    async fn run_script_to_completion(
        &self,
        script: &str,
    ) -> Result<oneshot::Receiver<()>, PromptError> {
        self.log.warn(format_args!(
            "cannot start {script} without an editor extension"
        ));
        let (_finished, receiver) = oneshot::channel();
        Ok(receiver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::targets;

    #[tokio::test]
    async fn headless_prompt_takes_the_first_choice() {
        let prompt = HeadlessPrompt::new(Logger::new(targets::IPC));
        let candidates = [PathBuf::from("/a/x.js"), PathBuf::from("/b/x.js")];
        assert_eq!(
            prompt
                .ask_for_correct_source_file("x.js", &candidates, None)
                .await
                .unwrap(),
            candidates[0]
        );
        assert!(prompt.ask_for_correct_source_file("x.js", &[], None).await.is_err());

        let options = ["one".to_owned(), "two".to_owned()];
        assert_eq!(prompt.show_context_quick_pick(&options).await.unwrap(), "one");

        // the script never runs, so it never finishes
        let finished = prompt.run_script_to_completion("main").await.unwrap();
        assert!(finished.await.is_err());
    }

    #[test]
    fn severity_names() {
        assert_eq!(
            serde_json::to_string(&Severity::Information).unwrap(),
            "\"information\""
        );
    }
}
