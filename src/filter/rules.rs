//! Domain patterns for split routing.
//!
//! Patterns are regular expressions matched against the whole queried
//! name. Results are cached per exact name for the lifetime of the rule set.

use fancy_regex::Regex;
use rustc_hash::FxHashMap;

use super::FilterError;

/// A compiled set of domain patterns with a per-name match cache.
pub struct DomainRules {
    patterns: Vec<Regex>,
    cache: FxHashMap<String, bool>,
}

impl DomainRules {
    /// Compile `patterns`, each anchored to a full-string match.
    pub fn compile<S: AsRef<str>>(patterns: &[S]) -> Result<Self, FilterError> {
        let patterns = patterns
            .iter()
            .map(|p| {
                let p = p.as_ref();
                Regex::new(&format!("^(?:{p})$")).map_err(|source| FilterError::InvalidPattern {
                    pattern: p.to_string(),
                    source: Box::new(source),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            patterns,
            cache: FxHashMap::default(),
        })
    }

    /// Check if `name` fully matches any pattern.
    pub fn matches(&mut self, name: &str) -> bool {
        if let Some(&hit) = self.cache.get(name) {
            return hit;
        }

        let hit = self
            .patterns
            .iter()
            .any(|r| r.is_match(name).unwrap_or(false));
        self.cache.insert(name.to_string(), hit);
        hit
    }

    /// Returns the number of patterns.
    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Returns the number of names with a cached result.
    pub fn cached(&self) -> usize {
        self.cache.len()
    }
}
