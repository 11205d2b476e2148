//! Detection rules.
//!
//! A detection rule is a regular expression matched against the
//! destinations that users connect to.  Rules come from three places: a
//! local file read once at startup, the node descriptor, and the panel's
//! rule list.  Local rules are always kept; remote ones replace each other.

use std::path::Path;
use std::sync::Arc;

use regex::Regex;
use serde::{Deserialize, Serialize};
use xnode_error::warn_report;

use crate::{Error, Result};

/// The identifier given to rules read from the local rule file.
pub const LOCAL_RULE_ID: i64 = -1;

/// A detection rule as the panel sends it.
#[derive(Debug, Clone, Default, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(default)]
#[non_exhaustive]
pub struct RuleSpec {
    /// Panel identifier of the rule.
    pub id: i64,
    /// The pattern, as a regular expression.
    pub regex: String,
}

impl RuleSpec {
    /// Construct a new `RuleSpec`.
    pub fn new(id: i64, regex: impl Into<String>) -> Self {
        RuleSpec {
            id,
            regex: regex.into(),
        }
    }

    /// Compile this rule.
    pub fn compile(&self) -> std::result::Result<DetectRule, regex::Error> {
        Ok(DetectRule {
            id: self.id,
            pattern: Regex::new(&self.regex)?,
        })
    }
}

/// A compiled detection rule.
#[derive(Debug, Clone)]
pub struct DetectRule {
    /// Panel identifier of the rule, or [`LOCAL_RULE_ID`].
    id: i64,
    /// The compiled pattern.
    pattern: Regex,
}

impl DetectRule {
    /// Return the identifier of this rule.
    pub fn id(&self) -> i64 {
        self.id
    }

    /// Return the compiled pattern.
    pub fn pattern(&self) -> &Regex {
        &self.pattern
    }

    /// Return true if `destination` matches this rule.
    pub fn is_match(&self, destination: &str) -> bool {
        self.pattern.is_match(destination)
    }
}

impl PartialEq for DetectRule {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.pattern.as_str() == other.pattern.as_str()
    }
}

impl Eq for DetectRule {}

/// Compile `specs`, skipping (and logging) any that aren't valid regular
/// expressions.
pub fn compile_rules<'a>(specs: impl IntoIterator<Item = &'a RuleSpec>) -> Vec<DetectRule> {
    specs
        .into_iter()
        .filter_map(|spec| match spec.compile() {
            Ok(rule) => Some(rule),
            Err(e) => {
                warn_report!(e, "Ignoring detection rule {} ({:?})", spec.id, spec.regex);
                None
            }
        })
        .collect()
}

/// Read a local rule file: one regular expression per non-empty line.
///
/// Invalid lines are logged and skipped.
pub fn load_local_rules(path: &Path) -> Result<Vec<DetectRule>> {
    let text = std::fs::read_to_string(path).map_err(|e| Error::ReadRules {
        path: path.to_owned(),
        cause: Arc::new(e),
    })?;
    let specs: Vec<RuleSpec> = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| RuleSpec::new(LOCAL_RULE_ID, line))
        .collect();
    Ok(compile_rules(&specs))
}
