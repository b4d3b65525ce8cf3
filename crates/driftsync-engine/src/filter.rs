//! Filter compiler
//!
//! Compiles a profile's include/exclude rules (glob syntax, or regular
//! expressions in regex mode) together with size/age/depth predicates into
//! a [`CompiledFilter`] implementing the [`PathFilter`] port.
//!
//! Rules are evaluated in order, includes before excludes, first match
//! wins. A path matching no rule is included, which is why a scoped delta
//! appends a catch-all `**` exclude last: includes take precedence over it,
//! everything else falls through to the exclude.

use std::time::Duration;

use globset::{Glob, GlobMatcher};
use regex::Regex;

use driftsync_core::domain::change::{EntryKind, FileChange};
use driftsync_core::domain::profile::{parse_age, parse_size, Profile};
use driftsync_core::ports::PathFilter;
use driftsync_core::CoreError;

enum RuleMatcher {
    /// Anchored rules (leading `/`) match from the root; unanchored rules
    /// match at any depth.
    Glob {
        anchored: GlobMatcher,
        unanchored: Option<GlobMatcher>,
        /// Literal prefix of the pattern up to the first wildcard, used to
        /// keep parent directories of an include traversable.
        literal_prefix: String,
    },
    Regex(Regex),
}

struct Rule {
    include: bool,
    matcher: RuleMatcher,
}

impl Rule {
    fn compile(pattern: &str, include: bool, use_regex: bool) -> Result<Self, CoreError> {
        let matcher = if use_regex {
            let regex = Regex::new(pattern).map_err(|e| {
                CoreError::Validation(format!("invalid filter regex '{pattern}': {e}"))
            })?;
            RuleMatcher::Regex(regex)
        } else {
            let (anchored_pat, unanchored) = match pattern.strip_prefix('/') {
                // Leading slash anchors the rule at the transfer root
                Some(rest) => (rest.to_string(), None),
                None => {
                    let nested = Glob::new(&format!("**/{pattern}")).map_err(|e| {
                        CoreError::Validation(format!("invalid filter glob '{pattern}': {e}"))
                    })?;
                    (pattern.to_string(), Some(nested.compile_matcher()))
                }
            };

            let literal_prefix = anchored_pat
                .find(&['*', '?', '[', '{'][..])
                .map(|idx| anchored_pat[..idx].to_string())
                .unwrap_or_else(|| anchored_pat.clone());

            let anchored = Glob::new(&anchored_pat)
                .map_err(|e| {
                    CoreError::Validation(format!("invalid filter glob '{pattern}': {e}"))
                })?
                .compile_matcher();

            RuleMatcher::Glob {
                anchored,
                unanchored,
                literal_prefix,
            }
        };

        Ok(Rule { include, matcher })
    }

    fn matches(&self, path: &str) -> bool {
        match &self.matcher {
            RuleMatcher::Glob {
                anchored,
                unanchored,
                ..
            } => {
                anchored.is_match(path)
                    || unanchored.as_ref().is_some_and(|m| m.is_match(path))
            }
            RuleMatcher::Regex(regex) => regex.is_match(path),
        }
    }

    /// Whether this include rule could match something strictly below `dir`.
    fn may_match_within(&self, dir: &str) -> bool {
        match &self.matcher {
            RuleMatcher::Glob {
                unanchored,
                literal_prefix,
                ..
            } => {
                // Unanchored and wildcard-prefixed rules can match anywhere
                if unanchored.is_some() || literal_prefix.is_empty() {
                    return true;
                }
                literal_prefix.starts_with(&format!("{dir}/"))
            }
            // Regexes are opaque; keep directories traversable
            RuleMatcher::Regex(_) => true,
        }
    }
}

/// Compiled include/exclude rules plus attribute predicates.
pub struct CompiledFilter {
    rules: Vec<Rule>,
    has_includes: bool,
    min_size: Option<u64>,
    max_size: Option<u64>,
    min_age: Option<Duration>,
    max_age: Option<Duration>,
    max_depth: u32,
}

impl CompiledFilter {
    /// Compiles the filter context for a profile.
    pub fn from_profile(profile: &Profile) -> Result<Self, CoreError> {
        let mut rules = Vec::new();
        for pattern in &profile.included_paths {
            rules.push(Rule::compile(pattern, true, profile.use_regex)?);
        }
        for pattern in &profile.excluded_paths {
            rules.push(Rule::compile(pattern, false, profile.use_regex)?);
        }
        let has_includes = !profile.included_paths.is_empty();

        let parse_opt_size = |expr: &Option<String>| -> Result<Option<u64>, CoreError> {
            expr.as_deref()
                .filter(|e| !e.is_empty())
                .map(parse_size)
                .transpose()
        };
        let parse_opt_age = |expr: &Option<String>| -> Result<Option<Duration>, CoreError> {
            Ok(expr
                .as_deref()
                .filter(|e| !e.is_empty())
                .map(parse_age)
                .transpose()?
                .map(Duration::from_secs))
        };

        Ok(CompiledFilter {
            rules,
            has_includes,
            min_size: parse_opt_size(&profile.min_size)?,
            max_size: parse_opt_size(&profile.max_size)?,
            min_age: parse_opt_age(&profile.min_age)?,
            max_age: parse_opt_age(&profile.max_age)?,
            max_depth: profile.max_depth,
        })
    }

    /// Builds the narrowed filter for a delta-scoped sync: one include per
    /// changed path (directories also get a recursive `/<p>/**`), then a
    /// catch-all `**` exclude.
    pub fn scoped_to_changes(changes: &[FileChange]) -> Result<Self, CoreError> {
        let mut rules = Vec::new();
        let mut seen = std::collections::HashSet::new();

        for change in changes {
            if !seen.insert(change.path.as_str()) {
                continue;
            }
            if change.entry == EntryKind::Directory {
                rules.push(Rule::compile(
                    &format!("/{}/**", change.path),
                    true,
                    false,
                )?);
            }
            rules.push(Rule::compile(&format!("/{}", change.path), true, false)?);
        }

        rules.push(Rule::compile("**", false, false)?);

        Ok(CompiledFilter {
            rules,
            has_includes: true,
            min_size: None,
            max_size: None,
            min_age: None,
            max_age: None,
            max_depth: 0,
        })
    }

    /// A filter with no rules: everything included.
    pub fn allow_all() -> Self {
        CompiledFilter {
            rules: Vec::new(),
            has_includes: false,
            min_size: None,
            max_size: None,
            min_age: None,
            max_age: None,
            max_depth: 0,
        }
    }

    fn first_match(&self, path: &str) -> Option<bool> {
        self.rules
            .iter()
            .find(|rule| rule.matches(path))
            .map(|rule| rule.include)
    }
}

impl PathFilter for CompiledFilter {
    fn include_path(&self, path: &str, is_dir: bool) -> bool {
        let path = path.trim_start_matches('/');

        // A directory stays traversable when some include rule could match
        // beneath it, even if an exclude would match the directory itself.
        if is_dir
            && self
                .rules
                .iter()
                .any(|rule| rule.include && rule.may_match_within(path))
        {
            return true;
        }

        match self.first_match(path) {
            Some(include) => include,
            // No rule matched: when include rules exist they define the
            // scope, so only rule-free filters default to include.
            None => !self.has_includes || is_dir,
        }
    }

    fn include_entry(&self, path: &str, size: u64, age: Duration, depth: u32) -> bool {
        if self.max_depth > 0 && depth > self.max_depth {
            return false;
        }
        if self.min_size.is_some_and(|min| size < min) {
            return false;
        }
        if self.max_size.is_some_and(|max| size > max) {
            return false;
        }
        if self.min_age.is_some_and(|min| age < min) {
            return false;
        }
        if self.max_age.is_some_and(|max| age > max) {
            return false;
        }
        self.include_path(path, false)
    }
}
