use std::{ops::Range, sync::LazyLock};

use regex::Regex;

use super::local_source::{DEBUGGER_STATEMENT, LocalSource, leading_debugger_statements};
use crate::error::MappingError;

/// `//# <offset> <name>` comment the remote engine writes where it inlined a required script.
static BOUNDARY_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^//#\s([0-9]+)\s([A-Za-z0-9_.#-]+);?$").expect("boundary marker pattern is valid")
});

/// A run of remote lines that belongs to one local file.
///
/// Every chunk but the first starts at its boundary marker line. The first
/// chunk starts at remote line 1 and may be preceded by the synthetic
/// `debugger;` statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    name: String,
    start: usize,
    len: usize,
    local_start: usize,
    first: bool,
    synthetic: bool,
}

impl Chunk {
    /// Logical name of the local file.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Remote lines covered by this chunk, marker line included.
    pub fn remote_range(&self) -> Range<usize> {
        self.start..self.start + self.len
    }

    /// Number of remote lines covered.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the chunk covers no line.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Local line of the first content line.
    pub fn local_start(&self) -> usize {
        self.local_start
    }

    /// Returns `true` for the leading chunk.
    pub fn is_first(&self) -> bool {
        self.first
    }

    /// Returns `true` if the chunk starts with the synthetic `debugger;` statement.
    pub fn preceded_by_synthetic_statement(&self) -> bool {
        self.synthetic
    }

    /// First remote line that has a local counterpart.
    pub fn content_start(&self) -> usize {
        if self.first && !self.synthetic {
            self.start
        } else {
            self.start + 1
        }
    }

    /// Number of remote lines that have a local counterpart.
    pub fn content_len(&self) -> usize {
        (self.start + self.len).saturating_sub(self.content_start())
    }

    fn contains_remote(&self, line: usize) -> bool {
        self.remote_range().contains(&line)
    }

    fn contains_local(&self, name: &str, line: usize) -> bool {
        self.name == name && (self.local_start..self.local_start + self.content_len()).contains(&line)
    }
}

/// Position of a remote line inside the chunk list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkPosition {
    /// Logical name of the local file.
    pub name: String,
    /// Line in the local file.
    pub line: usize,
    /// Index of the owning chunk.
    pub chunk: usize,
}

/// The text the remote engine executes for one context, split into chunks.
#[derive(Debug, Clone, Default)]
pub struct ServerSource {
    name: String,
    lines: Vec<String>,
    chunks: Vec<Chunk>,
    synthetic_statement: bool,
    static_scripts: Vec<String>,
}

impl ServerSource {
    /// Splits `lines` into chunks at the boundary markers.
    ///
    /// `synthetic_hint` tells whether the bridge injected a `debugger;`
    /// statement. Without the hint, it is inferred by comparing the leading
    /// `debugger;` statements of `local` with the remote text. Either way the
    /// hint is dropped when the first remote line is not such a statement.
    pub fn build(
        name: impl Into<String>,
        lines: Vec<String>,
        synthetic_hint: bool,
        local: Option<&LocalSource>,
    ) -> Result<Self, MappingError> {
        let name = name.into();
        let mut synthetic = synthetic_hint;

        if !synthetic
            && let Some(local_count) = local.and_then(|local| local.leading_debugger_statements().ok())
        {
            let remote_count = leading_debugger_statements(lines.iter().map(String::as_str));
            synthetic = remote_count > local_count;
        }

        if synthetic
            && !lines
                .first()
                .is_some_and(|line| line.trim().starts_with(DEBUGGER_STATEMENT))
        {
            synthetic = false;
        }

        let mut chunks = Vec::new();
        let mut static_scripts: Vec<String> = Vec::new();
        let mut current: Option<Chunk> = None;

        for (index, line) in lines.iter().enumerate() {
            let line_no = index + 1;
            let Some(captures) = BOUNDARY_MARKER.captures(line.trim()) else {
                continue;
            };

            let Ok(offset) = captures[1].parse::<usize>() else {
                continue;
            };

            if chunks.is_empty() {
                chunks.push(Chunk {
                    name: name.clone(),
                    start: 1,
                    len: line_no - 1,
                    local_start: 1,
                    first: true,
                    synthetic,
                });
            }

            let chunk_name = captures[2].to_owned();
            if !static_scripts.contains(&chunk_name) {
                static_scripts.push(chunk_name.clone());
            }

            let mut local_start = 1 + offset;
            if synthetic && chunk_name == name {
                // the injected statement has no local counterpart
                local_start = local_start.saturating_sub(1).max(1);
            }

            if let Some(mut chunk) = current.take() {
                chunk.len = line_no - chunk.start;
                if chunk.len > 0 {
                    chunks.push(chunk);
                }
            }

            current = Some(Chunk {
                name: chunk_name,
                start: line_no,
                len: 0,
                local_start,
                first: false,
                synthetic: false,
            });
        }

        if let Some(mut chunk) = current {
            chunk.len = lines.len() + 1 - chunk.start;
            chunks.push(chunk);
        }

        if chunks.is_empty() {
            chunks.push(Chunk {
                name: name.clone(),
                start: 1,
                len: lines.len(),
                local_start: 1,
                first: true,
                synthetic,
            });
        }

        if let Some(index) = chunks.iter().skip(1).position(Chunk::is_empty) {
            return Err(MappingError::EmptyChunk {
                name,
                index: index + 1,
            });
        }

        Ok(Self {
            name,
            lines,
            chunks,
            synthetic_statement: synthetic,
            static_scripts,
        })
    }

    /// Logical name of the context or script.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The chunks, in remote order.
    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    /// The remote text, line by line.
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// The remote text without the synthetic statement.
    pub fn lines_without_synthetic(&self) -> &[String] {
        if self.synthetic_statement {
            self.lines.get(1..).unwrap_or_default()
        } else {
            &self.lines
        }
    }

    /// Returns `true` if the bridge's `debugger;` statement precedes the script.
    pub fn synthetic_statement(&self) -> bool {
        self.synthetic_statement
    }

    /// Names of the scripts inlined into this source, in order of appearance.
    pub fn static_scripts(&self) -> &[String] {
        &self.static_scripts
    }

    /// The whole remote text.
    pub fn text(&self) -> String {
        self.lines.join("\n")
    }

    /// Remote line `line_no` (1-based).
    pub fn line(&self, line_no: usize) -> Option<&str> {
        line_no
            .checked_sub(1)
            .and_then(|index| self.lines.get(index))
            .map(String::as_str)
    }

    /// Translates a remote line to a position in a local file.
    pub fn to_local_position(&self, line: usize) -> Result<ChunkPosition, MappingError> {
        let chunk_index = self
            .chunks
            .iter()
            .position(|chunk| chunk.contains_remote(line))
            .ok_or(MappingError::RemoteLineNotFound { line })?;
        let chunk = &self.chunks[chunk_index];

        if !chunk.first && line == chunk.start {
            return Err(MappingError::BoundaryMarker { line });
        }

        if self.synthetic_statement && chunk.first && line == 1 {
            return Ok(ChunkPosition {
                name: chunk.name.clone(),
                line: 1,
                chunk: chunk_index,
            });
        }

        Ok(ChunkPosition {
            name: chunk.name.clone(),
            line: chunk.local_start + (line - chunk.content_start()),
            chunk: chunk_index,
        })
    }

    /// Translates a line of the local file `name` to the remote line.
    pub fn to_remote_line(&self, name: &str, line: usize) -> Result<usize, MappingError> {
        let chunk = self
            .chunks
            .iter()
            .find(|chunk| chunk.contains_local(name, line))
            .ok_or_else(|| MappingError::LocalLineNotFound {
                source_name: name.to_owned(),
                line,
            })?;
        Ok(chunk.content_start() + (line - chunk.local_start))
    }

    /// Finds another chunk importing the same file at the same place with a different length.
    pub fn duplicate_of(&self, chunk_index: usize) -> Option<&Chunk> {
        let chunk = self.chunks.get(chunk_index)?;
        self.chunks.iter().find(|other| {
            other.name == chunk.name && other.local_start == chunk.local_start && other.len != chunk.len
        })
    }

    /// The lines of one chunk below a banner naming `current_line`.
    pub fn chunk_snippet(&self, chunk_index: usize, current_line: &str) -> String {
        let mut snippet = String::from(
            "// This is ONLY A PART of the currently executed source code on server\n",
        );
        snippet.push_str("// Current line is:\n");
        snippet.push_str(&format!("// {current_line}\n\n"));
        if let Some(chunk) = self.chunks.get(chunk_index) {
            let start = chunk.start.saturating_sub(1).min(self.lines.len());
            let end = (start + chunk.len).min(self.lines.len());
            snippet.push_str(&self.lines[start..end].join("\n"));
        }
        snippet.push('\n');
        snippet
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use proptest::prelude::*;
    use rstest::rstest;

    fn lines(text: &str) -> Vec<String> {
        text.lines().map(str::to_owned).collect()
    }

    #[test]
    fn without_markers_one_chunk_covers_everything() {
        let source = ServerSource::build("main", lines("a\nb\nc"), false, None).unwrap();
        assert_eq!(source.chunks().len(), 1);
        let chunk = &source.chunks()[0];
        assert_eq!(chunk.remote_range(), 1..4);
        assert_eq!(chunk.local_start(), 1);
        assert!(chunk.is_first());
        assert!(!chunk.preceded_by_synthetic_statement());
        assert!(!source.synthetic_statement());
    }

    #[test]
    fn injected_statement_before_main_marker() {
        let source =
            ServerSource::build("main", lines("debugger;\n//# 0 main\na\nb"), true, None).unwrap();
        assert!(source.synthetic_statement());
        assert!(source.chunks().iter().any(Chunk::preceded_by_synthetic_statement));

        let at = |line| source.to_local_position(line).unwrap();
        assert_eq!((at(1).name.as_str(), at(1).line), ("main", 1));
        assert_eq!((at(3).name.as_str(), at(3).line), ("main", 1));
        assert_eq!((at(4).name.as_str(), at(4).line), ("main", 2));

        assert!(matches!(
            source.to_local_position(2),
            Err(MappingError::BoundaryMarker { line: 2 })
        ));
        assert_eq!(source.to_remote_line("main", 1).unwrap(), 3);
        assert_eq!(source.to_remote_line("main", 2).unwrap(), 4);
    }

    #[test]
    fn two_imports_give_three_chunks() {
        let text = indoc! {"
            var x = require('lib');
            //# 0 lib
            function lib() {}
            //# 4 helper
            function helper() {}
            helper();
        "};
        let source = ServerSource::build("main", lines(text), false, None).unwrap();

        let chunks = source.chunks();
        assert_eq!(chunks.len(), 3);
        assert_eq!((chunks[0].name(), chunks[0].remote_range()), ("main", 1..2));
        assert_eq!((chunks[1].name(), chunks[1].remote_range()), ("lib", 2..4));
        assert_eq!((chunks[2].name(), chunks[2].remote_range()), ("helper", 4..7));
        assert_eq!(source.static_scripts(), ["lib", "helper"]);

        let pos = source.to_local_position(6).unwrap();
        assert_eq!((pos.name.as_str(), pos.line, pos.chunk), ("helper", 6, 2));
        assert_eq!(source.to_remote_line("helper", 6).unwrap(), 6);
        assert_eq!(source.to_local_position(1).unwrap().line, 1);
    }

    #[test]
    fn hint_is_dropped_without_leading_statement() {
        let source = ServerSource::build("main", lines("a\nb"), true, None).unwrap();
        assert!(!source.synthetic_statement());
        assert_eq!(source.to_local_position(1).unwrap().line, 1);
    }

    #[test]
    fn statement_is_detected_from_local_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("main.js");
        std::fs::write(&path, "a\nb\n").unwrap();
        let local = LocalSource::new(&path);

        let source =
            ServerSource::build("main", lines("debugger;\na\nb"), false, Some(&local)).unwrap();
        assert!(source.synthetic_statement());
        assert_eq!(source.to_local_position(2).unwrap().line, 1);
        assert_eq!(source.lines_without_synthetic(), ["a", "b"]);

        std::fs::write(&path, "debugger;\na\nb\n").unwrap();
        let source =
            ServerSource::build("main", lines("debugger;\na\nb"), false, Some(&local)).unwrap();
        assert!(!source.synthetic_statement());
    }

    #[test]
    fn leading_marker_leaves_empty_first_chunk() {
        let source = ServerSource::build("main", lines("//# 0 lib\nx"), false, None).unwrap();
        assert!(source.chunks()[0].is_empty());
        assert_eq!(source.chunks()[1].remote_range(), 1..3);
        assert_eq!(source.to_local_position(2).unwrap().line, 1);
    }

    #[test]
    fn adjacent_markers_keep_a_marker_only_chunk() {
        let source =
            ServerSource::build("main", lines("a\n//# 0 lib\n//# 0 other\nx"), false, None).unwrap();
        let names: Vec<_> = source.chunks().iter().map(Chunk::name).collect();
        assert_eq!(names, ["main", "lib", "other"]);
        assert_eq!(source.chunks()[1].len(), 1);
        assert_eq!(source.chunks()[1].content_len(), 0);
        assert_eq!(source.to_local_position(4).unwrap().name, "other");
    }

    #[rstest]
    #[case(0)]
    #[case(9)]
    fn lines_outside_the_source_are_not_found(#[case] line: usize) {
        let source = ServerSource::build("main", lines("a\nb"), false, None).unwrap();
        let err = source.to_local_position(line).unwrap_err();
        assert_eq!(
            err.to_string(),
            "eval() statement in script? set debugger; statement to line 1"
        );
    }

    #[test]
    fn unknown_local_line_is_an_error() {
        let source = ServerSource::build("main", lines("a\nb"), false, None).unwrap();
        assert!(matches!(
            source.to_remote_line("main", 3),
            Err(MappingError::LocalLineNotFound { line: 3, .. })
        ));
        assert!(source.to_remote_line("lib", 1).is_err());
    }

    #[test]
    fn duplicate_import_is_found() {
        let text = "main\n//# 0 lib\nx\ny\n//# 0 lib\nx";
        let source = ServerSource::build("main", lines(text), false, None).unwrap();
        let duplicate = source.duplicate_of(1).unwrap();
        assert_eq!(duplicate.remote_range(), 5..7);
        assert!(source.duplicate_of(0).is_none());
    }

    #[test]
    fn snippet_has_banner_and_chunk_lines() {
        let source = ServerSource::build("main", lines("a\n//# 0 lib\nx\ny"), false, None).unwrap();
        let snippet = source.chunk_snippet(1, "y");
        assert_eq!(
            snippet,
            indoc! {"
                // This is ONLY A PART of the currently executed source code on server
                // Current line is:
                // y

                //# 0 lib
                x
                y
            "}
        );
    }

    fn remote_text() -> impl Strategy<Value = Vec<String>> {
        prop::collection::vec(
            prop_oneof![
                3 => "[a-z ;=()]{0,12}",
                1 => (0usize..40, prop::sample::select(vec!["main", "lib", "util"]))
                    .prop_map(|(offset, name)| format!("//# {offset} {name}")),
            ],
            0..40,
        )
    }

    proptest! {
        #[test]
        fn only_the_first_chunk_may_be_empty(text in remote_text(), hint in any::<bool>()) {
            let source = ServerSource::build("main", text.clone(), hint, None).unwrap();
            prop_assert!(source.chunks().iter().skip(1).all(|chunk| !chunk.is_empty()));

            let covered: usize = source.chunks().iter().map(Chunk::len).sum();
            prop_assert_eq!(covered, text.len());
        }

        #[test]
        fn round_trip_without_markers(count in 1usize..60, hint in any::<bool>()) {
            let mut text: Vec<String> = (0..count).map(|i| format!("line {i}")).collect();
            if hint {
                text.insert(0, "debugger;".to_owned());
            }
            let source = ServerSource::build("main", text, hint, None).unwrap();
            prop_assert_eq!(source.chunks().len(), 1);
            for line in 1..=count {
                let remote = source.to_remote_line("main", line).unwrap();
                let local = source.to_local_position(remote).unwrap();
                prop_assert_eq!(local.line, line);
                prop_assert_eq!(local.name.as_str(), "main");
            }
        }
    }
}
