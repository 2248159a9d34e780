//! Compiled filter and point evaluation.

use regex::bytes::Regex;
use thiserror::Error;

use tsp_wire::{Point, PointError};

use crate::rule::{Rule, RuleError, MAX_RULES};

/// Filter construction or evaluation failure.
#[derive(Debug, Error)]
pub enum FilterError {
    #[error("no rules defined")]
    NoRules,
    #[error("too many filter rules defined ({0}>{MAX_RULES})")]
    TooManyRules(usize),
    #[error("{source}, rule={rule}")]
    Rule { rule: String, source: RuleError },
    #[error("rewrite failed: {0}")]
    Rewrite(#[from] PointError),
}

/// A compiled, ordered rule list.
pub struct Filter {
    rules: Vec<CompiledRule>,
}

struct CompiledRule {
    match_metric: Option<Regex>,
    match_tags: Vec<(Vec<u8>, Regex)>,
    set_metric: Option<Vec<u8>>,
    set_tags: Vec<(Vec<u8>, Vec<u8>)>,
    block: Option<bool>,
}

/// The recorded submatch of the one capturing regex that matched: the regex
/// plus an owned copy of its haystack, so expansion is untangled from later
/// mutation of the point.
struct Submatch<'f> {
    re: &'f Regex,
    src: Vec<u8>,
}

impl Filter {
    /// Compile a filter from rule configuration. The whole rule list is
    /// validated before any rule is compiled.
    pub fn new(rules: &[Rule]) -> Result<Filter, FilterError> {
        if rules.is_empty() {
            return Err(FilterError::NoRules);
        }
        if rules.len() > MAX_RULES {
            return Err(FilterError::TooManyRules(rules.len()));
        }
        let mut compiled = Vec::with_capacity(rules.len());
        for rule in rules {
            rule.validate().map_err(|source| FilterError::Rule {
                rule: rule.to_string(),
                source,
            })?;
            compiled.push(CompiledRule::new(rule));
        }
        Ok(Filter { rules: compiled })
    }

    /// Evaluate the point against each rule in order. Returns `true` if the
    /// point is accepted. Rewrites are destructive; callers that need the
    /// original must copy it first.
    pub fn eval(&self, point: &mut Point) -> Result<bool, FilterError> {
        for rule in &self.rules {
            let submatch = match rule.matches(point) {
                None => continue,
                Some(submatch) => submatch,
            };
            rule.rewrite(point, &submatch)?;
            if let Some(block) = rule.block {
                return Ok(!block);
            }
        }
        Ok(true)
    }
}

impl CompiledRule {
    fn new(rule: &Rule) -> CompiledRule {
        let match_metric = match rule.r#match.first() {
            Some(pattern) if !pattern.is_empty() => {
                Some(Regex::new(pattern).expect("pattern validated"))
            }
            _ => None,
        };
        let mut match_tags = Vec::new();
        if rule.r#match.len() > 1 {
            for pair in rule.r#match[1..].chunks(2) {
                let re = Regex::new(&pair[1]).expect("pattern validated");
                match_tags.push((pair[0].as_bytes().to_vec(), re));
            }
        }
        let set_metric = match rule.set.first() {
            Some(metric) if !metric.is_empty() => Some(metric.as_bytes().to_vec()),
            _ => None,
        };
        let mut set_tags = Vec::new();
        if rule.set.len() > 1 {
            for pair in rule.set[1..].chunks(2) {
                set_tags.push((pair[0].as_bytes().to_vec(), pair[1].as_bytes().to_vec()));
            }
        }
        CompiledRule {
            match_metric,
            match_tags,
            set_metric,
            set_tags,
            block: rule.block,
        }
    }

    /// Test the point against the rule. `Some` carries the submatch record
    /// for rewriting, which is empty when the rule has no capturing regex.
    fn matches(&self, point: &Point) -> Option<Option<Submatch<'_>>> {
        let mut submatch = None;
        if let Some(re) = &self.match_metric {
            if !re.is_match(point.metric()) {
                return None;
            }
            if submatch.is_none() && re.captures_len() > 1 {
                submatch = Some(Submatch {
                    re,
                    src: point.metric().to_vec(),
                });
            }
        }
        for (key, re) in &self.match_tags {
            // An absent tag is matched against the empty string.
            let src = point.tag(key).unwrap_or(b"");
            if !re.is_match(src) {
                return None;
            }
            if submatch.is_none() && re.captures_len() > 1 {
                submatch = Some(Submatch {
                    re,
                    src: src.to_vec(),
                });
            }
        }
        Some(submatch)
    }

    fn rewrite(&self, point: &mut Point, submatch: &Option<Submatch>) -> Result<(), FilterError> {
        if let Some(template) = &self.set_metric {
            let metric = expand(submatch, template);
            point.set_metric(&metric)?;
        }
        if !self.set_tags.is_empty() {
            let expanded: Vec<(Vec<u8>, Vec<u8>)> = self
                .set_tags
                .iter()
                .map(|(key, template)| (key.clone(), expand(submatch, template)))
                .collect();
            let pairs: Vec<(&[u8], &[u8])> = expanded
                .iter()
                .map(|(k, v)| (k.as_slice(), v.as_slice()))
                .collect();
            point.set_tags(&pairs)?;
        }
        Ok(())
    }
}

/// Instantiate a set template, expanding `${N}` from the recorded submatch.
fn expand(submatch: &Option<Submatch>, template: &[u8]) -> Vec<u8> {
    let Some(Submatch { re, src }) = submatch else {
        return template.to_vec();
    };
    match re.captures(src) {
        Some(caps) => {
            let mut dst = Vec::with_capacity(template.len() + src.len());
            caps.expand(template, &mut dst);
            dst
        }
        // The regex matched this exact haystack during the match phase.
        None => template.to_vec(),
    }
}
