//! Mutation filtering.
//!
//! The replication spec may carry a filter expression selecting which
//! documents are replicated; only matching mutations are binned and
//! compared. Filtering never holds back checkpoint advancement.

use regex::bytes::Regex;
use thiserror::Error;

use crate::core::mutation::Mutation;

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("invalid filter expression: {0}")]
    InvalidExpression(#[from] regex::Error),

    #[error("filter evaluation failed: {reason}")]
    Eval { reason: String },
}

pub trait MutationFilter: Send + Sync {
    /// True if the mutation is part of the replicated set.
    fn matches(&self, mutation: &Mutation) -> Result<bool, FilterError>;
}

/// Keeps mutations whose key matches a regular expression.
#[derive(Debug)]
pub struct KeyRegexFilter {
    regex: Regex,
}

impl KeyRegexFilter {
    pub fn new(expression: &str) -> Result<Self, FilterError> {
        Ok(Self {
            regex: Regex::new(expression)?,
        })
    }
}

impl MutationFilter for KeyRegexFilter {
    fn matches(&self, mutation: &Mutation) -> Result<bool, FilterError> {
        Ok(self.regex.is_match(&mutation.key))
    }
}
