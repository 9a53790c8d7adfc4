//! Rule matching and priority resolution.
//!
//! A [`RuleSet`] is an immutable, ordered collection of compiled rules. It is
//! built once per load and shared read-only between concurrent dispatches.

use crate::config::Rule;
use crate::pattern::{BodyMatcher, CompiledPath, KeyedMatcher, MethodMatcher};
use crate::request::IncomingRequest;
use std::collections::HashMap;
use tracing::{debug, trace};

/// Context captured during matching (for template variables).
#[derive(Debug, Clone, Default)]
pub struct MatchContext {
    /// Path parameters extracted from placeholder matching
    pub path_params: HashMap<String, String>,
    /// Regex capture groups
    pub captures: HashMap<String, String>,
}

/// Result of resolving a request against a rule set.
#[derive(Debug)]
pub struct MatchResult<'a> {
    /// The winning rule
    pub rule: &'a Rule,
    /// Position of the rule in declaration order
    pub index: usize,
    /// Context captured while matching the winning rule
    pub context: MatchContext,
}

/// A rule with its predicates compiled.
#[derive(Debug)]
pub struct CompiledRule {
    rule: Rule,
    method: MethodMatcher,
    path: Option<CompiledPath>,
    query: KeyedMatcher,
    headers: KeyedMatcher,
    body: Vec<BodyMatcher>,
}

impl CompiledRule {
    pub fn compile(rule: Rule) -> Self {
        let matcher = &rule.matcher;
        let method = MethodMatcher::compile(matcher.method.as_deref());
        let path = matcher.path.as_ref().map(CompiledPath::compile_lenient);
        let query = KeyedMatcher::query(matcher);
        let headers = KeyedMatcher::headers(matcher);
        let body = matcher.body.iter().map(BodyMatcher::compile).collect();

        Self {
            rule,
            method,
            path,
            query,
            headers,
            body,
        }
    }

    pub fn rule(&self) -> &Rule {
        &self.rule
    }

    /// Evaluate this rule against a request. Cheap dimensions are checked
    /// first: method, path, query, headers, then body.
    pub fn matches(&self, request: &IncomingRequest) -> Option<MatchContext> {
        let mut context = MatchContext::default();

        if !self.method.matches(&request.method) {
            return None;
        }

        if let Some(path) = &self.path {
            if !path.matches(&request.path, &mut context) {
                return None;
            }
        }

        if !self.query.matches(|name| request.query_param(name)) {
            return None;
        }

        if !self.headers.matches(|name| request.header(name)) {
            return None;
        }

        let body = request.body_text();
        if !self.body.iter().all(|m| m.matches(body)) {
            return None;
        }

        Some(context)
    }
}

/// Immutable ordered rule collection.
#[derive(Debug, Default)]
pub struct RuleSet {
    rules: Vec<CompiledRule>,
}

impl RuleSet {
    /// Compile rules, keeping declaration order. Disabled or soft-deleted
    /// rules are dropped.
    pub fn new(rules: impl IntoIterator<Item = Rule>) -> Self {
        let rules = rules
            .into_iter()
            .filter(|rule| {
                if !rule.is_active() {
                    debug!(rule_id = %rule.id, "Skipping inactive rule");
                }
                rule.is_active()
            })
            .map(CompiledRule::compile)
            .collect();
        Self { rules }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn rules(&self) -> impl Iterator<Item = &Rule> {
        self.rules.iter().map(CompiledRule::rule)
    }

    /// All rules matching the request, in declaration order.
    pub fn matching<'a, 'r>(
        &'a self,
        request: &'r IncomingRequest,
    ) -> impl Iterator<Item = MatchResult<'a>> + 'r
    where
        'a: 'r,
    {
        self.rules
            .iter()
            .enumerate()
            .filter_map(move |(index, compiled)| {
                compiled.matches(request).map(|context| MatchResult {
                    rule: &compiled.rule,
                    index,
                    context,
                })
            })
    }

    /// Select the winning rule: smallest priority value, first declared on
    /// ties. `None` when nothing matches.
    pub fn resolve(&self, request: &IncomingRequest) -> Option<MatchResult<'_>> {
        let mut best: Option<MatchResult<'_>> = None;
        for candidate in self.matching(request) {
            trace!(rule_id = %candidate.rule.id, priority = candidate.rule.priority, "Rule matched");
            let replace = match &best {
                Some(current) => candidate.rule.priority < current.rule.priority,
                None => true,
            };
            if replace {
                best = Some(candidate);
            }
        }
        best
    }
}
