//! Position mapping between the remote script text and local files.
//!
//! The remote engine does not execute the user's files verbatim: it inlines
//! required scripts behind `//# <offset> <name>` boundary markers and may run
//! a `debugger;` statement the bridge injected in front of the main script.
//! [`ServerSource`] models one such remote text as a list of [`Chunk`]s and
//! translates lines in both directions; [`SourceMap`] ties the remote names to
//! [`LocalSource`]s and checks that translated lines actually match.

mod local_source;
mod server_source;

pub use local_source::{LocalSource, leading_debugger_statements};
pub use server_source::{Chunk, ChunkPosition, ServerSource};

use std::{
    path::Path,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use indexmap::IndexMap;
use rustc_hash::FxHashMap;

use crate::{
    config::discover_scripts, encoding::decode_remote_string, error::MappingError,
    logging::Logger, prompt::EditorPrompt,
};

/// A remote line resolved to a local file.
#[derive(Debug, Clone)]
pub struct LocalPosition {
    /// The local file.
    pub source: LocalSource,
    /// Line in the local file.
    pub line: usize,
    /// Index of the owning chunk in the remote source.
    pub chunk: usize,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Registry of local sources, the attached remote source, and scripts loaded on demand.
#[derive(Debug)]
pub struct SourceMap {
    sources: Mutex<IndexMap<String, LocalSource>>,
    server_source: Mutex<Arc<ServerSource>>,
    dynamic_scripts: Mutex<FxHashMap<String, Arc<ServerSource>>>,
    asking: tokio::sync::Mutex<()>,
    log: Logger,
}

impl SourceMap {
    /// Creates an empty registry.
    pub fn new(log: Logger) -> Self {
        Self {
            sources: Mutex::default(),
            server_source: Mutex::default(),
            dynamic_scripts: Mutex::default(),
            asking: tokio::sync::Mutex::new(()),
            log,
        }
    }

    /// The remote source of the attached context.
    pub fn server_source(&self) -> Arc<ServerSource> {
        Arc::clone(&locked(&self.server_source))
    }

    /// Replaces the remote source of the attached context.
    pub fn set_server_source(&self, source: ServerSource) {
        *locked(&self.server_source) = Arc::new(source);
    }

    /// Caches the remote source of a script loaded at runtime.
    pub fn add_dynamic_script(&self, remote_url: impl Into<String>, source: ServerSource) {
        locked(&self.dynamic_scripts).insert(remote_url.into(), Arc::new(source));
    }

    /// The cached remote source of a script loaded at runtime.
    pub fn dynamic_script(&self, remote_url: &str) -> Option<Arc<ServerSource>> {
        locked(&self.dynamic_scripts).get(remote_url).cloned()
    }

    /// Associates a remote name with a local source, replacing any previous association.
    pub fn add_mapping(&self, source: LocalSource, remote_name: impl Into<String>) {
        locked(&self.sources).insert(remote_name.into(), source);
    }

    /// Registers every script found below `root` under its name without extension.
    ///
    /// Names that are already mapped keep their mapping.
    pub fn register_workspace(&self, root: &Path) {
        let scripts = discover_scripts(root);
        self.log.debug(format_args!(
            "found {} script name(s) in {}",
            scripts.len(),
            root.display()
        ));
        let mut sources = locked(&self.sources);
        for paths in scripts.into_values() {
            match LocalSource::with_candidates(paths) {
                Ok(source) => {
                    if !source.candidates().is_empty() {
                        self.log.info(format_args!(
                            "additional paths found for {}: {:?}",
                            source.name(),
                            source.candidates()
                        ));
                    }
                    sources
                        .entry(source.source_name().to_owned())
                        .or_insert(source);
                }
                Err(err) => self.log.warn(format_args!("skipping workspace script: {err}")),
            }
        }
    }

    /// Finds the remote name of a local file: by path, then by file name.
    ///
    /// Unknown files are sent under their path.
    pub fn remote_url(&self, local_path: &Path) -> String {
        let sources = locked(&self.sources);
        let by_path = sources
            .iter()
            .find(|(_, source)| source.path() == Some(local_path));
        let by_alias = || {
            let base = local_path.file_name()?.to_str()?;
            sources
                .iter()
                .find(|(_, source)| source.alias_names().iter().any(|alias| alias == base))
        };

        let remote_name = match by_path.or_else(by_alias) {
            Some((name, _)) => name.clone(),
            None => {
                self.log.warn(format_args!(
                    "no remote name found for '{}'",
                    local_path.display()
                ));
                local_path.to_string_lossy().into_owned()
            }
        };
        self.log.debug(format_args!(
            "remote url: '{}' -> '{remote_name}'",
            local_path.display()
        ));
        remote_name
    }

    /// The local source registered under `remote_name`, if its file is known.
    pub fn resolved_source(&self, remote_name: &str) -> Option<LocalSource> {
        locked(&self.sources)
            .get(remote_name)
            .filter(|source| source.path().is_some())
            .cloned()
    }

    /// Returns the local source registered under `remote_name`.
    ///
    /// An ambiguous source is resolved by asking the user. Only one question is
    /// outstanding at a time: concurrent callers wait for it and then reuse the
    /// answer. `remote_lines` is shown to the user and defaults to the attached
    /// remote source.
    pub async fn source<P: EditorPrompt>(
        &self,
        remote_name: &str,
        remote_lines: Option<&[String]>,
        prompt: &P,
    ) -> Result<Option<LocalSource>, MappingError> {
        let Some(source) = locked(&self.sources).get(remote_name).cloned() else {
            return Ok(None);
        };
        if source.path().is_some() {
            return Ok(Some(source));
        }

        let _asking = self.asking.lock().await;

        let Some(mut source) = locked(&self.sources).get(remote_name).cloned() else {
            return Ok(None);
        };
        if source.path().is_some() {
            return Ok(Some(source));
        }

        let server_source = self.server_source();
        let lines = remote_lines.unwrap_or_else(|| server_source.lines_without_synthetic());
        let chosen = prompt
            .ask_for_correct_source_file(source.name(), source.candidates(), Some(lines))
            .await?;
        self.log.info(format_args!(
            "using {} for {remote_name}",
            chosen.display()
        ));
        source.set_path(chosen);
        locked(&self.sources).insert(remote_name.to_owned(), source.clone());
        Ok(Some(source))
    }

    /// Translates a remote line to a local position and checks that both lines match.
    ///
    /// `remote_url` selects a script loaded at runtime; the attached remote
    /// source is used when it is absent, equal to the attached name, or not cached.
    pub async fn to_local_position<P: EditorPrompt>(
        &self,
        line: usize,
        remote_url: Option<&str>,
        prompt: &P,
    ) -> Result<LocalPosition, MappingError> {
        let main = self.server_source();
        let server_source = match remote_url {
            Some(url) if url != main.name() => {
                self.log.info(format_args!("dynamic script {url}"));
                self.dynamic_script(url).unwrap_or(main)
            }
            _ => main,
        };

        let position = server_source.to_local_position(line)?;
        let source = self
            .source(
                &position.name,
                Some(server_source.lines_without_synthetic()),
                prompt,
            )
            .await?
            .ok_or_else(|| MappingError::LocalSourceNotFound {
                name: position.name.clone(),
                remote_line: line,
                local_line: position.line,
            })?;

        let local_line = source.line(position.line)?;
        let remote_line = server_source.line(line).unwrap_or_default();

        if local_line.trim() != remote_line.trim() {
            if line == 1 && server_source.synthetic_statement() {
                return Ok(LocalPosition {
                    source,
                    line: position.line,
                    chunk: position.chunk,
                });
            }

            if let Some(duplicate) = server_source.duplicate_of(position.chunk) {
                return Err(MappingError::DuplicateImport {
                    name: duplicate.name().to_owned(),
                    line: duplicate.local_start().saturating_sub(1),
                });
            }

            let decoded = decode_remote_string(remote_line);
            if local_line.trim() != decoded.trim() {
                return Err(MappingError::OutOfSync {
                    remote_line: line,
                    snippet: server_source.chunk_snippet(position.chunk, &decoded),
                });
            }
        }

        Ok(LocalPosition {
            source,
            line: position.line,
            chunk: position.chunk,
        })
    }

    /// The local source owning a remote line, without checking the line text or prompting.
    pub fn located_source(&self, line: usize, remote_url: Option<&str>) -> Option<LocalSource> {
        let server_source = remote_url
            .and_then(|url| self.dynamic_script(url))
            .unwrap_or_else(|| self.server_source());
        let position = server_source.to_local_position(line).ok()?;
        self.resolved_source(&position.name)
    }

    /// Translates a local line to the remote line, in `dynamic` when given.
    pub fn to_remote_line(
        &self,
        source: &LocalSource,
        line: usize,
        dynamic: Option<&ServerSource>,
    ) -> Result<usize, MappingError> {
        match dynamic {
            Some(script) => {
                self.log
                    .debug(format_args!("to remote line: dynamic script {}", script.name()));
                script.to_remote_line(source.source_name(), line)
            }
            None => {
                self.log.debug(format_args!("to remote line: static script"));
                self.server_source()
                    .to_remote_line(source.source_name(), line)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        fs,
        path::PathBuf,
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use futures_concurrency::future::Join;
    use indoc::indoc;

    use super::*;
    use crate::{
        error::PromptError,
        logging::targets,
        prompt::Severity,
    };

    #[derive(Debug, Default)]
    struct CountingPrompt {
        asked: AtomicUsize,
        answer: usize,
    }

    impl EditorPrompt for CountingPrompt {
        async fn ask_for_correct_source_file(
            &self,
            _name: &str,
            candidates: &[PathBuf],
            _remote_lines: Option<&[String]>,
        ) -> Result<PathBuf, PromptError> {
            self.asked.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(candidates[self.answer].clone())
        }

        async fn show_context_quick_pick(&self, options: &[String]) -> Result<String, PromptError> {
            Ok(options[0].clone())
        }

        async fn display_message(
            &self,
            _message: &str,
            _severity: Severity,
            _snippet: Option<&str>,
        ) -> Result<(), PromptError> {
            Ok(())
        }

        async fn run_script_to_completion(
            &self,
            _script: &str,
        ) -> Result<tokio::sync::oneshot::Receiver<()>, PromptError> {
            Err(PromptError::Closed)
        }
    }

    fn lines(text: &str) -> Vec<String> {
        text.lines().map(str::to_owned).collect()
    }

    fn source_map() -> SourceMap {
        SourceMap::new(Logger::new(targets::SOURCE_MAP))
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_one_question() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("a/util.js");
        let second = dir.path().join("b/util.js");
        fs::create_dir_all(first.parent().unwrap()).unwrap();
        fs::create_dir_all(second.parent().unwrap()).unwrap();
        fs::write(&first, "").unwrap();
        fs::write(&second, "").unwrap();

        let map = source_map();
        map.register_workspace(dir.path());
        let prompt = CountingPrompt {
            answer: 1,
            ..CountingPrompt::default()
        };

        let (a, b, c) = (
            map.source("util", None, &prompt),
            map.source("util", None, &prompt),
            map.source("util", None, &prompt),
        )
            .join()
            .await;

        assert_eq!(prompt.asked.load(Ordering::SeqCst), 1);
        for source in [a, b, c] {
            assert_eq!(source.unwrap().unwrap().path(), Some(second.as_path()));
        }
        assert!(map.source("missing", None, &prompt).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn translates_and_checks_lines() {
        let dir = tempfile::tempdir().unwrap();
        let main = dir.path().join("main.js");
        fs::write(&main, "var a = 1;\nvar b = 2;\n").unwrap();

        let map = source_map();
        let source = LocalSource::new(&main);
        map.add_mapping(source.clone(), source.source_name());
        map.set_server_source(
            ServerSource::build("main", lines("debugger;\nvar a = 1;\nvar b = 2;"), true, None)
                .unwrap(),
        );
        let prompt = CountingPrompt::default();

        let position = map.to_local_position(3, None, &prompt).await.unwrap();
        assert_eq!(position.line, 2);
        assert_eq!(position.source.path(), Some(main.as_path()));

        // the injected statement maps to the first line
        assert_eq!(map.to_local_position(1, None, &prompt).await.unwrap().line, 1);
        assert_eq!(map.to_remote_line(&source, 1, None).unwrap(), 2);
        assert_eq!(prompt.asked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn reports_out_of_sync_lines_with_snippet() {
        let dir = tempfile::tempdir().unwrap();
        let main = dir.path().join("main.js");
        fs::write(&main, "var a = 1;\nvar b = 3;\n").unwrap();

        let map = source_map();
        let source = LocalSource::new(&main);
        map.add_mapping(source.clone(), source.source_name());
        map.set_server_source(
            ServerSource::build("main", lines("var a = 1;\nvar b = 2;"), false, None).unwrap(),
        );

        let err = map
            .to_local_position(2, None, &CountingPrompt::default())
            .await
            .unwrap_err();
        let MappingError::OutOfSync { remote_line, snippet } = err else {
            panic!("unexpected error {err}");
        };
        assert_eq!(remote_line, 2);
        assert!(snippet.starts_with(indoc! {"
            // This is ONLY A PART of the currently executed source code on server
            // Current line is:
            // var b = 2;
        "}));
        assert_eq!(map.located_source(2, None).unwrap().name(), "main.js");
    }

    #[tokio::test]
    async fn accepts_lines_after_decoding() {
        let dir = tempfile::tempdir().unwrap();
        let main = dir.path().join("main.js");
        fs::write(&main, "var s = \"grün\";\n").unwrap();

        let map = source_map();
        let source = LocalSource::new(&main);
        map.add_mapping(source.clone(), source.source_name());
        map.set_server_source(
            ServerSource::build("main", vec!["var s = \"gr\u{c3}\u{bc}n\";".to_owned()], false, None)
                .unwrap(),
        );

        let position = map
            .to_local_position(1, None, &CountingPrompt::default())
            .await
            .unwrap();
        assert_eq!(position.line, 1);
    }

    #[tokio::test]
    async fn reports_duplicate_imports() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("main.js"), "require('lib');\n").unwrap();
        fs::write(dir.path().join("lib.js"), "x\ny\n").unwrap();

        let map = source_map();
        map.register_workspace(dir.path());
        let remote = "require('lib');\n//# 0 lib\nx\ny\n//# 0 lib\nz";
        map.set_server_source(ServerSource::build("main", lines(remote), false, None).unwrap());

        let err = map
            .to_local_position(6, None, &CountingPrompt::default())
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "duplicate #import in lib, first occurrence at line 0"
        );
    }

    #[tokio::test]
    async fn prefers_dynamic_scripts() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("main.js"), "main();\n").unwrap();
        fs::write(dir.path().join("lib.js"), "one\ntwo\n").unwrap();

        let map = source_map();
        map.register_workspace(dir.path());
        map.set_server_source(ServerSource::build("main", lines("main();"), false, None).unwrap());
        map.add_dynamic_script(
            "lib",
            ServerSource::build("lib", lines("one\ntwo"), false, None).unwrap(),
        );

        let position = map
            .to_local_position(2, Some("lib"), &CountingPrompt::default())
            .await
            .unwrap();
        assert_eq!(position.source.name(), "lib.js");
        assert_eq!(position.line, 2);

        let lib = map.resolved_source("lib").unwrap();
        let dynamic = map.dynamic_script("lib").unwrap();
        assert_eq!(map.to_remote_line(&lib, 2, Some(&dynamic)).unwrap(), 2);
        assert!(map.to_remote_line(&lib, 2, None).is_err());
    }

    #[test]
    fn remote_url_by_path_then_alias() {
        let map = source_map();
        let source = LocalSource::new("/work/main.js");
        map.add_mapping(source, "main");

        assert_eq!(map.remote_url(Path::new("/work/main.js")), "main");
        assert_eq!(map.remote_url(Path::new("/elsewhere/main.js")), "main");
        assert_eq!(map.remote_url(Path::new("/work/other.js")), "/work/other.js");
    }
}
