//! Blocked-file guardrails.
//!
//! Patterns use `glob::Pattern` syntax and are matched against repository
//! relative paths. A pattern without a `/` also matches any path whose file
//! name matches, so `*.lock` also blocks `web/yarn.lock`.

use glob::{MatchOptions, Pattern, PatternError};

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: false,
    require_literal_leading_dot: false,
};

/// Compiled blocked-file patterns for one project.
#[derive(Debug, Clone, Default)]
pub struct Guardrails {
    patterns: Vec<(String, Pattern)>,
}

impl Guardrails {
    /// Compile patterns, failing on the first invalid one.
    pub fn new(patterns: &[String]) -> Result<Self, PatternError> {
        let patterns = patterns
            .iter()
            .map(|raw| Pattern::new(raw).map(|p| (raw.clone(), p)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// The first pattern blocking `path`, if any.
    pub fn blocking_pattern(&self, path: &str) -> Option<&str> {
        let path = path.trim_start_matches("./");
        let basename = path.rsplit('/').next().unwrap_or(path);
        self.patterns.iter().find_map(|(raw, pattern)| {
            let hit = pattern.matches_with(path, MATCH_OPTIONS)
                || (!raw.contains('/') && pattern.matches_with(basename, MATCH_OPTIONS));
            hit.then_some(raw.as_str())
        })
    }

    /// Every changed path that hits a blocked pattern, in input order.
    pub fn violations<'a>(&self, changed: &'a [String]) -> Vec<Violation<'a>> {
        if self.is_empty() {
            return Vec::new();
        }
        changed
            .iter()
            .filter_map(|path| {
                self.blocking_pattern(path).map(|pattern| Violation {
                    path: path.as_str(),
                    pattern: pattern.to_string(),
                })
            })
            .collect()
    }
}

/// A changed path that matched a blocked pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation<'a> {
    pub path: &'a str,
    pub pattern: String,
}

impl std::fmt::Display for Violation<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (matches `{}`)", self.path, self.pattern)
    }
}
