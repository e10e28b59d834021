/// File name filtering for candidate selection.
///
/// Remote listings only give us bare names, so every check here works on a
/// name rather than a path. Three filters apply, in order:
///
/// 1. The filename glob (`*.xml`, `TCO_*_KMC_*.xml`, ...). An empty glob
///    matches everything.
/// 2. The extension allow-list, compared case-insensitively.
/// 3. Ignore patterns, also globs. Any match drops the file.
///
/// An invalid glob is a configuration error and is reported when the filter
/// is built, not silently treated as "no match" per file.
use glob::{MatchOptions, Pattern};
use std::path::Path;

use crate::errors::{SearchError, SearchResult};

/// Compiled name filters for one run
#[derive(Debug, Clone)]
pub struct NameFilter {
    glob: Option<Pattern>,
    extensions: Option<Vec<String>>,
    ignore: Vec<Pattern>,
}

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

fn compile(pattern: &str) -> SearchResult<Pattern> {
    Pattern::new(pattern).map_err(|e| {
        SearchError::config_error(format!("invalid glob '{}': {}", pattern, e.msg))
    })
}

impl NameFilter {
    pub fn new(
        filename_glob: &str,
        extensions: Option<&[String]>,
        ignore_patterns: &[String],
    ) -> SearchResult<Self> {
        let glob = match filename_glob.trim() {
            "" => None,
            pattern => Some(compile(pattern)?),
        };
        let ignore = ignore_patterns
            .iter()
            .map(|p| compile(p))
            .collect::<SearchResult<Vec<_>>>()?;
        Ok(Self {
            glob,
            extensions: extensions.map(|exts| {
                exts.iter()
                    .map(|e| e.trim_start_matches('.').to_string())
                    .collect()
            }),
            ignore,
        })
    }

    /// A filter that accepts every name
    pub fn accept_all() -> Self {
        Self {
            glob: None,
            extensions: None,
            ignore: Vec::new(),
        }
    }

    pub fn matches(&self, name: &str) -> bool {
        if let Some(glob) = &self.glob {
            if !glob.matches_with(name, MATCH_OPTIONS) {
                return false;
            }
        }
        has_valid_extension(name, self.extensions.as_deref()) && !should_ignore(name, &self.ignore)
    }
}

/// Checks the name's extension against the allow-list
pub fn has_valid_extension(name: &str, extensions: Option<&[String]>) -> bool {
    match extensions {
        None => true,
        Some(exts) => Path::new(name)
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| exts.iter().any(|e| e.eq_ignore_ascii_case(ext))),
    }
}

/// Checks if a name should be ignored based on ignore patterns
pub fn should_ignore(name: &str, ignore_patterns: &[Pattern]) -> bool {
    ignore_patterns
        .iter()
        .any(|p| p.matches_with(name, MATCH_OPTIONS))
}
