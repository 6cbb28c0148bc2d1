//! Find/replace rules applied to compare-mode documents.

use serde::Deserialize;

use super::error::DomainError;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RewriteRule {
    pub search: String,
    pub replace: String,
}

impl RewriteRule {
    pub fn new(search: impl Into<String>, replace: impl Into<String>) -> Result<Self, DomainError> {
        let search = search.into();
        if search.is_empty() {
            return Err(DomainError::validation("rewrite rule search text is empty"));
        }
        Ok(Self {
            search,
            replace: replace.into(),
        })
    }
}

/// Ordered rule list; earlier rules run first on every line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RewriteRuleSet {
    rules: Vec<RewriteRule>,
}

impl RewriteRuleSet {
    pub fn new(rules: Vec<RewriteRule>) -> Self {
        Self { rules }
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RewriteRule> {
        self.rules.iter()
    }
}
