//! Rule configuration and load-time validation.

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Upper bound on rules in one filter.
pub const MAX_RULES: usize = 64;

/// Submatch references must stay in single-digit range.
const MAX_SUBMATCH: i64 = 9;

/// Configuration of a single rule.
///
/// `match` is `[metric_regex, tagkey1, tagvalue_regex1, ...]`; an empty
/// metric regex skips the metric test, and a tag value regex is matched
/// against the empty string when the tag is absent. `set` is
/// `[new_metric, tagkey1, new_tagvalue1, ...]`; an empty new metric skips
/// the metric rewrite, and `${N}` in any set value expands to the N-th
/// submatch of the rule's single capturing regex.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Rule {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub r#match: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub set: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block: Option<bool>,
}

impl Rule {
    /// A rule that drops every point. Used as the default filter so that
    /// forwarding is an explicit opt-in.
    pub fn block_all() -> Rule {
        Rule {
            block: Some(true),
            ..Rule::default()
        }
    }

    /// Validate the rule and return the capture-group count of its single
    /// submatch-bearing match regex (0 when none).
    pub(crate) fn validate(&self) -> Result<usize, RuleError> {
        self.validate_shape()?;
        let group_count = self.validate_match()?;
        self.validate_set(group_count)?;
        Ok(group_count)
    }

    fn is_block(&self) -> bool {
        self.block == Some(true)
    }

    fn validate_shape(&self) -> Result<(), RuleError> {
        if self.block.is_none() {
            let noop = match self.set.as_slice() {
                [] => true,
                [m] if m.is_empty() => true,
                [m, _] if m.is_empty() => true,
                [m, _, v] if m.is_empty() && v.is_empty() => true,
                _ => false,
            };
            if noop {
                return Err(RuleError::NoOp);
            }
        }
        if self.is_block() && !self.set.is_empty() {
            return Err(RuleError::SetWithBlock);
        }
        if self.r#match.len() > 1 && (self.r#match.len() - 1) % 2 != 0 {
            return Err(RuleError::MatchArity(self.r#match.len()));
        }
        Ok(())
    }

    fn validate_match(&self) -> Result<usize, RuleError> {
        let mut submatch_regexes = 0;
        let mut group_count = 0;
        for (i, pattern) in self.r#match.iter().enumerate() {
            let re = Regex::new(pattern).map_err(|err| RuleError::BadRegex {
                pattern: pattern.clone(),
                message: err.to_string(),
            })?;
            let groups = re.captures_len() - 1;
            if groups == 0 {
                continue;
            }
            // Elements at odd positions are tag keys, not patterns; a
            // capture group there could never be expanded.
            if i >= 1 && (i - 1) % 2 == 0 {
                return Err(RuleError::SubmatchInTagKey);
            }
            submatch_regexes += 1;
            group_count = groups;
        }
        if submatch_regexes > 1 {
            return Err(RuleError::TooManySubmatchRegexes);
        }
        Ok(group_count)
    }

    fn validate_set(&self, group_count: usize) -> Result<(), RuleError> {
        if let Some(metric) = self.set.first() {
            if !metric.is_empty() {
                validate_templates(metric, group_count)
                    .map_err(|err| RuleError::SetMetric(Box::new(err)))?;
            }
        }
        if self.set.len() > 1 {
            let set_tags = &self.set[1..];
            if set_tags.len() % 2 != 0 {
                return Err(RuleError::SetArity(set_tags.len()));
            }
            for pair in set_tags.chunks(2) {
                let (key, value) = (&pair[0], &pair[1]);
                if SUBMATCH_RE.is_match(key) {
                    return Err(RuleError::SubmatchInTagKey);
                }
                validate_templates(value, group_count)
                    .map_err(|err| RuleError::SetTag(Box::new(err)))?;
            }
        }
        Ok(())
    }
}

static SUBMATCH_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{[0-9]+\}").expect("static pattern"));

/// Check every `${N}` reference in a set template against the group count of
/// the rule's capturing regex.
fn validate_templates(template: &str, group_count: usize) -> Result<(), RuleError> {
    for m in SUBMATCH_RE.find_iter(template) {
        let digits = &template[m.start() + 2..m.end() - 1];
        let index: i64 = digits.parse().map_err(|_| RuleError::SubmatchRange {
            reference: m.as_str().to_string(),
            want: "a number".to_string(),
        })?;
        if index < 1 {
            return Err(RuleError::SubmatchRange {
                reference: m.as_str().to_string(),
                want: "at least ${1}".to_string(),
            });
        }
        if index > group_count as i64 {
            let want = if group_count == 0 {
                "none".to_string()
            } else {
                format!("at most ${{{group_count}}}")
            };
            return Err(RuleError::SubmatchRange {
                reference: m.as_str().to_string(),
                want,
            });
        }
        if index > MAX_SUBMATCH {
            return Err(RuleError::SubmatchRange {
                reference: m.as_str().to_string(),
                want: format!("at most ${{{MAX_SUBMATCH}}}"),
            });
        }
    }
    Ok(())
}

/// A defect in one rule, found at load time.
#[derive(Debug, Error)]
pub enum RuleError {
    #[error("rule is a no-op, either set or block must be used")]
    NoOp,
    #[error("set and block=true used together")]
    SetWithBlock,
    #[error("match array has {0} fields, want a metric pattern plus key/pattern pairs")]
    MatchArity(usize),
    #[error("set tag array has {0} elements, want key/value pairs")]
    SetArity(usize),
    #[error("bad regex {pattern:?}: {message}")]
    BadRegex { pattern: String, message: String },
    #[error("regex submatch used in tag name context")]
    SubmatchInTagKey,
    #[error("too many regexes with subexpressions: want 0 or 1")]
    TooManySubmatchRegexes,
    #[error("invalid set metric: {0}")]
    SetMetric(#[source] Box<RuleError>),
    #[error("invalid set tag: {0}")]
    SetTag(#[source] Box<RuleError>),
    #[error("submatch number out of range: {reference}, want {want}")]
    SubmatchRange { reference: String, want: String },
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        let mut sep = "";
        if !self.r#match.is_empty() {
            write!(f, "{sep}match:{:?}", self.r#match)?;
            sep = " ";
        }
        if !self.set.is_empty() {
            write!(f, "{sep}set:{:?}", self.set)?;
            sep = " ";
        }
        if let Some(block) = self.block {
            write!(f, "{sep}block:{block}")?;
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(r#match: &[&str], set: &[&str], block: Option<bool>) -> Rule {
        Rule {
            r#match: r#match.iter().map(|s| s.to_string()).collect(),
            set: set.iter().map(|s| s.to_string()).collect(),
            block,
        }
    }

    #[test]
    fn test_validate_table() {
        let cases: Vec<(Rule, bool)> = vec![
            // A pass rule.
            (rule(&[], &[], Some(false)), true),
            // Missing tag value pattern in match.
            (rule(&[".*", "host"], &[], None), false),
            // Undefined set metric.
            (rule(&[], &[""], None), false),
            // Missing tag value in set.
            (rule(&[], &["", "a"], None), false),
            // Single submatch-bearing regex without references is fine.
            (rule(&["foo(.*)"], &["bar"], None), true),
            // Multiple submatch-bearing regexes.
            (
                rule(&["foo(.*)", "host", "bar(.*)"], &["${1}"], None),
                false,
            ),
            // References to nonexistent submatches.
            (rule(&["foo(.*)"], &["${0}"], None), false),
            (rule(&["foo(.*)"], &["${2}"], None), false),
            // Submatch used to build a tag name.
            (rule(&["foo(.*)"], &["", "${2}", "foo"], None), false),
            // Mutating and blocking.
            (rule(&[], &["foo"], Some(true)), false),
            (rule(&[], &["", "foo", "1"], Some(true)), false),
            // Mutating with an explicit pass decision.
            (rule(&[], &["foo"], Some(false)), true),
            // Empty tag value in set.
            (rule(&[], &["", "a", ""], None), false),
            // Submatch defined but unused.
            (rule(&["(a|b)"], &[], Some(true)), true),
        ];
        for (i, (rule, ok)) in cases.iter().enumerate() {
            let got = rule.validate();
            assert_eq!(got.is_ok(), *ok, "#{i} {rule}: {got:?}");
        }
    }

    #[test]
    fn test_group_count() {
        assert_eq!(rule(&["foo(.*)"], &["${1}"], None).validate().unwrap(), 1);
        assert_eq!(
            rule(&[r"foo\.([^\.]+)\.(.*)"], &["foo.${2}"], None)
                .validate()
                .unwrap(),
            2
        );
        assert_eq!(rule(&[], &["bar"], None).validate().unwrap(), 0);
    }

    #[test]
    fn test_tag_value_submatch_allowed() {
        let r = rule(&["foo(.*)"], &["", "suffix", "${1}"], None);
        assert!(r.validate().is_ok());
    }

    #[test]
    fn test_bad_regex() {
        assert!(matches!(
            rule(&["foo("], &[], Some(true)).validate(),
            Err(RuleError::BadRegex { .. })
        ));
    }

    #[test]
    fn test_display() {
        let r = rule(&["a"], &["b"], Some(false));
        assert_eq!(r.to_string(), r#"{match:["a"] set:["b"] block:false}"#);
    }
}
