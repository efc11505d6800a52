use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::error::MappingError;

/// Statement the bridge may inject to break on entry.
pub(crate) const DEBUGGER_STATEMENT: &str = "debugger;";

/// Counts how many lines at the top of a script start with `debugger;`.
pub fn leading_debugger_statements<'a, I>(lines: I) -> usize
where
    I: IntoIterator<Item = &'a str>,
{
    lines
        .into_iter()
        .take_while(|line| line.trim().starts_with(DEBUGGER_STATEMENT))
        .count()
}

/// A script file in the user's workspace.
///
/// A source is ambiguous while several files share its name; the user picks
/// one of the candidates the first time the source is needed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalSource {
    name: String,
    path: Option<PathBuf>,
    candidates: Vec<PathBuf>,
    alias_names: Vec<String>,
}

impl LocalSource {
    /// Creates a source backed by exactly one file.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let (name, alias_names) = names_of(&path);
        Self {
            name,
            path: Some(path),
            candidates: Vec::new(),
            alias_names,
        }
    }

    /// Creates a source from every file carrying its name.
    ///
    /// All paths are expected to have the same file name.
    pub fn with_candidates(mut paths: Vec<PathBuf>) -> Result<Self, MappingError> {
        match paths.len() {
            0 => Err(MappingError::NoPaths),
            1 => Ok(Self::new(paths.remove(0))),
            _ => {
                let (name, alias_names) = names_of(&paths[0]);
                Ok(Self {
                    name,
                    path: None,
                    candidates: paths,
                    alias_names,
                })
            }
        }
    }

    /// File name, including the extension.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// File name without extension; this is how the remote engine names scripts.
    pub fn source_name(&self) -> &str {
        &self.alias_names[0]
    }

    /// Names under which the remote engine may refer to this source.
    pub fn alias_names(&self) -> &[String] {
        &self.alias_names
    }

    /// The chosen file, if known.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Files the user has to choose from.
    pub fn candidates(&self) -> &[PathBuf] {
        &self.candidates
    }

    /// Records the file the user chose.
    pub fn set_path(&mut self, path: PathBuf) {
        self.path = Some(path);
    }

    /// Reads the whole file.
    pub fn load(&self) -> Result<String, MappingError> {
        let path = self
            .path
            .as_ref()
            .ok_or_else(|| MappingError::Ambiguous(self.name.clone()))?;
        fs::read_to_string(path).map_err(|source| MappingError::Io {
            path: path.clone(),
            source,
        })
    }

    /// Returns line `line_no` (1-based), trimmed.
    pub fn line(&self, line_no: usize) -> Result<String, MappingError> {
        let contents = self.load()?;
        line_no
            .checked_sub(1)
            .and_then(|index| contents.split('\n').nth(index))
            .map(|line| line.trim().to_owned())
            .ok_or_else(|| MappingError::MissingLine {
                name: self.name.clone(),
                line: line_no,
            })
    }

    /// Counts the `debugger;` statements at the top of the file.
    pub fn leading_debugger_statements(&self) -> Result<usize, MappingError> {
        let contents = self.load()?;
        Ok(leading_debugger_statements(contents.split('\n')))
    }
}

fn names_of(path: &Path) -> (String, Vec<String>) {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let stem = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.clone());
    (name.clone(), vec![stem, name])
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    #[test]
    fn names_and_aliases() {
        let source = LocalSource::new("/work/lib/util.js");
        assert_eq!(source.name(), "util.js");
        assert_eq!(source.source_name(), "util");
        assert_eq!(source.alias_names(), ["util", "util.js"]);
        assert_eq!(source.path(), Some(Path::new("/work/lib/util.js")));
    }

    #[test]
    fn several_candidates_are_ambiguous() {
        let source = LocalSource::with_candidates(vec![
            PathBuf::from("/a/util.js"),
            PathBuf::from("/b/util.js"),
        ])
        .unwrap();
        assert!(source.path().is_none());
        assert_eq!(source.candidates().len(), 2);
        assert!(matches!(source.load(), Err(MappingError::Ambiguous(name)) if name == "util.js"));

        assert!(matches!(
            LocalSource::with_candidates(Vec::new()),
            Err(MappingError::NoPaths)
        ));
    }

    #[test]
    fn reads_trimmed_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("main.js");
        fs::write(
            &path,
            indoc! {"
                debugger;
                  debugger; // twice
                var a = 1;\r
            "},
        )
        .unwrap();

        let source = LocalSource::new(&path);
        assert_eq!(source.line(3).unwrap(), "var a = 1;");
        assert_eq!(source.leading_debugger_statements().unwrap(), 2);
        assert!(matches!(
            source.line(9),
            Err(MappingError::MissingLine { line: 9, .. })
        ));
        assert!(source.line(0).is_err());
    }
}
