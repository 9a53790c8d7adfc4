//! Pattern matchers for the individual request dimensions.
//!
//! Each matcher is compiled once when a rule set is loaded and evaluated as a
//! pure predicate per request. A pattern that fails to compile is kept as an
//! "invalid" matcher that never matches; evaluation itself never fails.

use crate::config::{
    BodyConstraint, BodyMatchType, PathMatchType, PathSpec, RequestMatcher, ValueMatchType,
    ValuePattern,
};
use crate::matcher::MatchContext;
use regex::{Regex, RegexBuilder};
use std::collections::HashMap;
use tracing::debug;

/// Build a regex honouring the case-insensitive flag.
pub(crate) fn build_regex(pattern: &str, case_insensitive: bool) -> Result<Regex, regex::Error> {
    RegexBuilder::new(pattern)
        .case_insensitive(case_insensitive)
        .build()
}

/// Build a regex that must match the whole input.
fn build_anchored(pattern: &str, case_insensitive: bool) -> Result<Regex, regex::Error> {
    build_regex(&format!("^(?:{})$", pattern), case_insensitive)
}

fn compile_or_log(pattern: &str, case_insensitive: bool, what: &str) -> Option<Regex> {
    match build_regex(pattern, case_insensitive) {
        Ok(regex) => Some(regex),
        Err(e) => {
            debug!(pattern, error = %e, "Invalid {} regex, constraint will never match", what);
            None
        }
    }
}

/// Case-aware text equality. `expected` is already lowercased when
/// `case_insensitive` is set.
fn text_eq(actual: &str, expected: &str, case_insensitive: bool) -> bool {
    if case_insensitive {
        actual.to_lowercase() == expected
    } else {
        actual == expected
    }
}

fn text_contains(actual: &str, needle: &str, case_insensitive: bool) -> bool {
    if case_insensitive {
        actual.to_lowercase().contains(needle)
    } else {
        actual.contains(needle)
    }
}

fn fold(value: &str, case_insensitive: bool) -> String {
    if case_insensitive {
        value.to_lowercase()
    } else {
        value.to_string()
    }
}

/// Compiled HTTP method constraint.
#[derive(Debug, Clone)]
pub enum MethodMatcher {
    Any,
    Only(String),
}

impl MethodMatcher {
    /// Absent, empty, `*` and `ANY` accept every method.
    pub fn compile(method: Option<&str>) -> Self {
        match method.map(str::trim) {
            None | Some("") | Some("*") => MethodMatcher::Any,
            Some(m) if m.eq_ignore_ascii_case("any") => MethodMatcher::Any,
            Some(m) => MethodMatcher::Only(m.to_uppercase()),
        }
    }

    /// Case-insensitive method comparison.
    pub fn matches(&self, method: &str) -> bool {
        match self {
            MethodMatcher::Any => true,
            MethodMatcher::Only(expected) => method.eq_ignore_ascii_case(expected),
        }
    }
}

/// Compiled path specification.
#[derive(Debug, Clone)]
pub enum CompiledPath {
    Exact {
        value: String,
        case_insensitive: bool,
    },
    /// Literal path with `{name}` placeholders
    Template(PathTemplate),
    /// Wildcard or regular expression, anchored to the whole path
    Regex(Regex),
    /// Pattern failed to compile
    Invalid,
}

impl CompiledPath {
    /// Compile a path specification, failing on a bad pattern.
    pub fn compile(spec: &PathSpec) -> Result<Self, regex::Error> {
        match spec {
            PathSpec::Template(template) => PathTemplate::parse(template).map(CompiledPath::Template),
            PathSpec::Pattern(p) => match p.kind {
                PathMatchType::Exact => Ok(CompiledPath::Exact {
                    value: fold(&p.pattern, p.case_insensitive),
                    case_insensitive: p.case_insensitive,
                }),
                PathMatchType::Wildcard => {
                    build_anchored(&wildcard_to_regex(&p.pattern), p.case_insensitive)
                        .map(CompiledPath::Regex)
                }
                PathMatchType::Regex => {
                    build_anchored(&p.pattern, p.case_insensitive).map(CompiledPath::Regex)
                }
            },
        }
    }

    /// Compile, degrading to a never-matching path on error.
    pub fn compile_lenient(spec: &PathSpec) -> Self {
        Self::compile(spec).unwrap_or_else(|e| {
            debug!(error = %e, "Invalid path pattern, rule will never match");
            CompiledPath::Invalid
        })
    }

    /// Match the whole path, recording placeholders and captures in `context`.
    pub fn matches(&self, path: &str, context: &mut MatchContext) -> bool {
        match self {
            CompiledPath::Exact {
                value,
                case_insensitive,
            } => text_eq(path, value, *case_insensitive),
            CompiledPath::Template(template) => match template.matches(path) {
                Some(params) => {
                    context.path_params = params;
                    true
                }
                None => false,
            },
            CompiledPath::Regex(regex) => match regex.captures(path) {
                Some(captures) => {
                    for (i, cap) in captures.iter().enumerate().skip(1) {
                        if let Some(m) = cap {
                            context.captures.insert(i.to_string(), m.as_str().to_string());
                        }
                    }
                    for name in regex.capture_names().flatten() {
                        if let Some(m) = captures.name(name) {
                            context.captures.insert(name.to_string(), m.as_str().to_string());
                        }
                    }
                    true
                }
                None => false,
            },
            CompiledPath::Invalid => false,
        }
    }
}

/// `*` matches any sequence, `?` any single character, everything else is literal.
fn wildcard_to_regex(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len() * 2);
    let mut buf = [0u8; 4];
    for ch in pattern.chars() {
        match ch {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            other => out.push_str(&regex::escape(other.encode_utf8(&mut buf))),
        }
    }
    out
}

/// A literal path where each `{name}` stands for one non-empty, slash-free
/// segment.
#[derive(Debug, Clone)]
pub struct PathTemplate {
    regex: Regex,
    params: Vec<String>,
}

enum TemplateSegment {
    Literal(String),
    Param(String),
}

impl PathTemplate {
    /// Parse `/users/{id}` style templates.
    pub fn parse(template: &str) -> Result<Self, regex::Error> {
        let mut segments = Vec::new();
        let mut current = String::new();
        let mut in_param = false;
        let mut param_name = String::new();

        for ch in template.chars() {
            if ch == '{' && !in_param {
                if !current.is_empty() {
                    segments.push(TemplateSegment::Literal(std::mem::take(&mut current)));
                }
                in_param = true;
                param_name.clear();
            } else if ch == '}' && in_param {
                segments.push(TemplateSegment::Param(std::mem::take(&mut param_name)));
                in_param = false;
            } else if in_param {
                param_name.push(ch);
            } else {
                current.push(ch);
            }
        }

        // An unclosed brace is literal text
        if in_param {
            current.push('{');
            current.push_str(&param_name);
        }
        if !current.is_empty() {
            segments.push(TemplateSegment::Literal(current));
        }

        let mut pattern = String::from("^");
        let mut params = Vec::new();
        for segment in segments {
            match segment {
                TemplateSegment::Literal(lit) => pattern.push_str(&regex::escape(&lit)),
                TemplateSegment::Param(name) => {
                    pattern.push_str("([^/]+)");
                    params.push(name);
                }
            }
        }
        pattern.push('$');

        Ok(Self {
            regex: Regex::new(&pattern)?,
            params,
        })
    }

    /// Placeholder values when the path matches.
    pub fn matches(&self, path: &str) -> Option<HashMap<String, String>> {
        let captures = self.regex.captures(path)?;
        Some(
            self.params
                .iter()
                .zip(captures.iter().skip(1))
                .filter_map(|(name, m)| m.map(|m| (name.clone(), m.as_str().to_string())))
                .collect(),
        )
    }
}

/// One header or query parameter constraint.
#[derive(Debug, Clone)]
pub enum ValueMatcher {
    /// Literal form: present with an exactly equal value
    Literal(String),
    Exists,
    Exact {
        value: String,
        case_insensitive: bool,
    },
    Contains {
        needle: String,
        case_insensitive: bool,
    },
    /// `None` when the pattern failed to compile
    Regex(Option<Regex>),
}

impl ValueMatcher {
    /// Compile an advanced constraint.
    pub fn compile(pattern: &ValuePattern) -> Self {
        let ci = pattern.case_insensitive;
        match pattern.kind {
            ValueMatchType::Exists => ValueMatcher::Exists,
            ValueMatchType::Exact => ValueMatcher::Exact {
                value: fold(&pattern.pattern, ci),
                case_insensitive: ci,
            },
            ValueMatchType::Contains => ValueMatcher::Contains {
                needle: fold(&pattern.pattern, ci),
                case_insensitive: ci,
            },
            ValueMatchType::Regex => {
                ValueMatcher::Regex(compile_or_log(&pattern.pattern, ci, "value"))
            }
        }
    }

    /// A missing key fails every constraint, `Exists` included.
    pub fn matches(&self, actual: Option<&str>) -> bool {
        let Some(actual) = actual else {
            return false;
        };
        match self {
            ValueMatcher::Literal(expected) => actual == expected,
            ValueMatcher::Exists => true,
            ValueMatcher::Exact {
                value,
                case_insensitive,
            } => text_eq(actual, value, *case_insensitive),
            ValueMatcher::Contains {
                needle,
                case_insensitive,
            } => text_contains(actual, needle, *case_insensitive),
            ValueMatcher::Regex(Some(regex)) => regex.is_match(actual),
            ValueMatcher::Regex(None) => false,
        }
    }
}

/// Constraints for one keyed dimension (headers or query).
///
/// The advanced form replaces the literal map when present; the choice is
/// made once at compile time.
#[derive(Debug, Clone, Default)]
pub struct KeyedMatcher {
    constraints: Vec<(String, ValueMatcher)>,
}

impl KeyedMatcher {
    fn compile(
        literal: &HashMap<String, String>,
        patterns: &HashMap<String, ValuePattern>,
        normalise_key: fn(&str) -> String,
    ) -> Self {
        let constraints = if patterns.is_empty() {
            literal
                .iter()
                .map(|(k, v)| (normalise_key(k), ValueMatcher::Literal(v.clone())))
                .collect()
        } else {
            patterns
                .iter()
                .map(|(k, p)| (normalise_key(k), ValueMatcher::compile(p)))
                .collect()
        };
        Self { constraints }
    }

    /// Header constraints; keys are matched case-insensitively.
    pub fn headers(matcher: &RequestMatcher) -> Self {
        Self::compile(&matcher.headers, &matcher.header_patterns, |k| {
            k.to_lowercase()
        })
    }

    /// Query parameter constraints; keys are matched exactly.
    pub fn query(matcher: &RequestMatcher) -> Self {
        Self::compile(&matcher.query, &matcher.query_patterns, |k| k.to_string())
    }

    /// Every constraint must hold for the value `lookup` returns.
    pub fn matches<'a>(&self, lookup: impl Fn(&str) -> Option<&'a str>) -> bool {
        self.constraints
            .iter()
            .all(|(key, matcher)| matcher.matches(lookup(key)))
    }

    pub fn is_empty(&self) -> bool {
        self.constraints.is_empty()
    }
}

/// One body constraint.
#[derive(Debug, Clone)]
pub enum BodyMatcher {
    Exact {
        value: String,
        case_insensitive: bool,
    },
    Contains {
        needle: String,
        case_insensitive: bool,
    },
    Regex(Option<Regex>),
    JsonPath(StructuredCheck),
    XPath(StructuredCheck),
}

/// Expression plus optional expected value for structured body checks.
#[derive(Debug, Clone)]
pub struct StructuredCheck {
    expression: String,
    expected: Option<String>,
    case_insensitive: bool,
}

impl StructuredCheck {
    fn new(constraint: &BodyConstraint) -> Self {
        let ci = constraint.case_insensitive;
        Self {
            expression: constraint.expression.clone(),
            expected: constraint.expected_value.as_deref().map(|v| fold(v, ci)),
            case_insensitive: ci,
        }
    }

    /// Without an expected value any resolved value is a match.
    fn accepts(&self, extracted: Option<String>) -> bool {
        match (extracted, &self.expected) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(actual), Some(expected)) => text_eq(&actual, expected, self.case_insensitive),
        }
    }
}

impl BodyMatcher {
    /// Compile a body constraint.
    pub fn compile(constraint: &BodyConstraint) -> Self {
        let ci = constraint.case_insensitive;
        match constraint.kind {
            BodyMatchType::Exact => BodyMatcher::Exact {
                value: fold(&constraint.expression, ci),
                case_insensitive: ci,
            },
            BodyMatchType::Contains => BodyMatcher::Contains {
                needle: fold(&constraint.expression, ci),
                case_insensitive: ci,
            },
            BodyMatchType::Regex => {
                BodyMatcher::Regex(compile_or_log(&constraint.expression, ci, "body"))
            }
            BodyMatchType::StructuredPath => BodyMatcher::JsonPath(StructuredCheck::new(constraint)),
            BodyMatchType::StructuredQuery => BodyMatcher::XPath(StructuredCheck::new(constraint)),
        }
    }

    /// Evaluate against the raw body text. Unparsable bodies never match
    /// structured checks.
    pub fn matches(&self, body: &str) -> bool {
        match self {
            BodyMatcher::Exact {
                value,
                case_insensitive,
            } => text_eq(body, value, *case_insensitive),
            BodyMatcher::Contains {
                needle,
                case_insensitive,
            } => text_contains(body, needle, *case_insensitive),
            BodyMatcher::Regex(Some(regex)) => regex.is_match(body),
            BodyMatcher::Regex(None) => false,
            BodyMatcher::JsonPath(check) => check.accepts(extract_json_path(body, &check.expression)),
            BodyMatcher::XPath(check) => check.accepts(extract_xpath(body, &check.expression)),
        }
    }
}

/// Evaluate a JSON path against `body` and stringify the first result.
fn extract_json_path(body: &str, expression: &str) -> Option<String> {
    use jsonpath_rust::JsonPath;

    let json: serde_json::Value = match serde_json::from_str(body) {
        Ok(json) => json,
        Err(e) => {
            debug!(error = %e, "Body is not JSON, structured path check fails");
            return None;
        }
    };
    let path = match JsonPath::try_from(expression) {
        Ok(path) => path,
        Err(_) => {
            debug!(expression, "Invalid JSON path expression");
            return None;
        }
    };

    let first = match path.find(&json) {
        serde_json::Value::Null => None,
        serde_json::Value::Array(results) => results.into_iter().next(),
        other => Some(other),
    };
    first.map(|value| match value {
        serde_json::Value::String(s) => s,
        other => other.to_string(),
    })
}

/// Evaluate an XPath expression against `body` and stringify the result.
fn extract_xpath(body: &str, expression: &str) -> Option<String> {
    use sxd_document::parser;
    use sxd_xpath::{evaluate_xpath, Value};

    let package = match parser::parse(body) {
        Ok(package) => package,
        Err(e) => {
            debug!(error = ?e, "Body is not XML, structured query check fails");
            return None;
        }
    };
    let document = package.as_document();

    match evaluate_xpath(&document, expression) {
        Ok(Value::String(s)) => Some(s),
        Ok(Value::Number(n)) => Some(n.to_string()),
        Ok(Value::Boolean(b)) => Some(b.to_string()),
        Ok(Value::Nodeset(nodes)) => nodes.document_order_first().map(|n| n.string_value()),
        Err(e) => {
            debug!(expression, error = ?e, "Invalid XPath expression");
            None
        }
    }
}
