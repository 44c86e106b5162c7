//! Expression rules: the YAML form of the analyzer tree.
//!
//! ```yaml
//! - name: udp on custom port
//!   analyzer: UDP
//!   log: true
//!   expr: proto == "udp" && dst_port == 9999
//! ```
//!
//! Rules are evaluated in file order and the first one whose expression is true wins.

use std::fmt;

use nt_analyzer::FlowInfo;
use serde::{Deserialize, Serialize};
use snafu::{ensure, ResultExt, Snafu};
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tracing::{error, info};

use crate::{engine, MatchResult, Ruleset};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum RulesetError {
    #[snafu(display("Failed to read ruleset file {}: {}", path, source))]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[snafu(display("Failed to parse ruleset: {}", source))]
    Parse { source: serde_yaml::Error },

    #[snafu(display("Rule {} does not name an analyzer", rule))]
    EmptyAnalyzer { rule: String },

    #[snafu(display("Failed to compile expression of rule {}: {}", rule, source))]
    Compile {
        rule: String,
        source: rhai::ParseError,
    },
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct ExprRule {
    pub name: String,
    pub analyzer: String,
    #[serde(default)]
    pub log: bool,
    pub expr: String,
}

pub fn read_expr_rules_from_str(contents: &str) -> Result<Vec<ExprRule>, RulesetError> {
    serde_yaml::from_str(contents).context(ParseSnafu)
}

pub async fn read_expr_rules_from_file(path: &str) -> Result<Vec<ExprRule>, RulesetError> {
    let mut file = File::open(path).await.context(IoSnafu { path })?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)
        .await
        .context(IoSnafu { path })?;
    read_expr_rules_from_str(&contents)
}

struct CompiledExprRule {
    name: String,
    analyzer: String,
    log: bool,
    ast: rhai::AST,
}

/// A ruleset whose rules are compiled rhai expressions.
pub struct ExprRuleset {
    engine: rhai::Engine,
    rules: Vec<CompiledExprRule>,
}

impl fmt::Debug for ExprRuleset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExprRuleset")
            .field(
                "rules",
                &self.rules.iter().map(|r| &r.name).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl ExprRuleset {
    /// The number of rules.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Whether the ruleset has no rules.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// The analyzer names referenced by the rules, in rule order.
    pub fn analyzers(&self) -> Vec<&str> {
        self.rules.iter().map(|r| r.analyzer.as_str()).collect()
    }
}

/// Compile raw rules into an `ExprRuleset`.
///
/// Every expression is compiled up front so that a broken rule fails the load instead of
/// silently never matching.
pub fn compile_expr_rules(rules: Vec<ExprRule>) -> Result<ExprRuleset, RulesetError> {
    let engine = engine::new_engine();

    let mut compiled = Vec::with_capacity(rules.len());
    for rule in rules {
        ensure!(
            !rule.analyzer.is_empty(),
            EmptyAnalyzerSnafu { rule: &rule.name }
        );
        let ast = engine
            .compile_expression(&rule.expr)
            .context(CompileSnafu { rule: &rule.name })?;
        compiled.push(CompiledExprRule {
            name: rule.name,
            analyzer: rule.analyzer,
            log: rule.log,
            ast,
        });
    }

    Ok(ExprRuleset {
        engine,
        rules: compiled,
    })
}

impl Ruleset for ExprRuleset {
    fn analyzer_for(&self, info: &FlowInfo) -> Option<MatchResult> {
        let mut scope = engine::flow_scope(info);

        for rule in &self.rules {
            match self.engine.eval_ast_with_scope::<bool>(&mut scope, &rule.ast) {
                Ok(true) => {
                    if rule.log {
                        info!(
                            "Rule {} requests analyzer {} for flow {}",
                            rule.name, rule.analyzer, info
                        );
                    }
                    return Some(MatchResult {
                        rule: rule.name.clone(),
                        analyzer: rule.analyzer.clone(),
                    });
                }
                Ok(false) => {}
                Err(e) => error!("Failed to evaluate rule {}: {}", rule.name, e),
            }
        }

        None
    }
}
