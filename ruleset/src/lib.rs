//! The analyzer tree.
//!
//! A ruleset turns the identity of a new flow into an explicit analyzer request. Explicit
//! requests outrank every other way the engine has of choosing an analyzer.

use std::fmt::Debug;

use nt_analyzer::FlowInfo;

pub mod builtins;
pub mod engine;
pub mod expr_rule;

/// The rule which matched a flow and the analyzer it asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchResult {
    pub rule: String,
    pub analyzer: String,
}

/// The ruleset trait.
pub trait Ruleset: Send + Sync + Debug {
    /// - returns the analyzer explicitly requested for a flow, if a rule matches.
    ///
    /// It must be safe for concurrent use by multiple workers.
    fn analyzer_for(&self, info: &FlowInfo) -> Option<MatchResult>;
}

/// A ruleset without rules; no flow carries an explicit request.
#[derive(Debug, Default)]
pub struct EmptyRuleset;

impl Ruleset for EmptyRuleset {
    fn analyzer_for(&self, _info: &FlowInfo) -> Option<MatchResult> {
        None
    }
}
