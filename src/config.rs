//! Rule-set data model.
//!
//! Defines rules, their request matchers, response templates, conditional
//! response variants and fault/latency settings, plus loading and validation
//! of rule documents.

use crate::pattern::{build_regex, CompiledPath};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use thiserror::Error;

/// Errors raised while loading a rule document.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to read rule file: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid YAML rule document: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid JSON rule document: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid rule set: {0}")]
    Invalid(String),
}

/// A complete rule document.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct RuleSetConfig {
    /// Rules in declaration order
    #[serde(default)]
    pub rules: Vec<Rule>,

    /// Engine settings
    #[serde(default)]
    pub settings: EngineSettings,
}

impl RuleSetConfig {
    /// Load and validate a rule document. Files ending in `.json` are parsed
    /// as JSON, everything else as YAML.
    pub fn from_file(path: &Path) -> Result<Self, LoadError> {
        let content = std::fs::read_to_string(path)?;
        if is_json_document(path) {
            Self::from_json_str(&content)
        } else {
            Self::from_yaml_str(&content)
        }
    }

    /// Parse and validate a YAML rule document.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, LoadError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.checked()
    }

    /// Parse and validate a JSON rule document.
    pub fn from_json_str(json: &str) -> Result<Self, LoadError> {
        let config: Self = serde_json::from_str(json)?;
        config.checked()
    }

    fn checked(self) -> Result<Self, LoadError> {
        self.validate()
            .map_err(|e| LoadError::Invalid(format!("{:#}", e)))?;
        Ok(self)
    }

    /// Validate the document. Only a document that passes may become active.
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut seen = HashSet::new();
        for (i, rule) in self.rules.iter().enumerate() {
            rule.validate()
                .map_err(|e| anyhow::anyhow!("Rule {} ({}): {}", i, rule.id, e))?;
            if !seen.insert(rule.id.as_str()) {
                anyhow::bail!("Rule {}: duplicate rule id '{}'", i, rule.id);
            }
        }
        Ok(())
    }

    /// Rules that are enabled and not soft-deleted, in declaration order.
    pub fn active_rules(&self) -> Vec<Rule> {
        self.rules.iter().filter(|r| r.is_active()).cloned().collect()
    }
}

pub(crate) fn is_json_document(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.eq_ignore_ascii_case("json"))
        .unwrap_or(false)
}

/// A single rule: a request matcher paired with a response template.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Rule {
    /// Unique identifier
    pub id: String,

    /// Human-readable name
    #[serde(default)]
    pub name: Option<String>,

    /// Precedence among matching rules (lower = stronger)
    #[serde(default)]
    pub priority: i32,

    /// Whether this rule is enabled
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Soft-deleted rules are never served
    #[serde(default)]
    pub deleted: bool,

    /// Free-form tags
    #[serde(default)]
    pub tags: Vec<String>,

    /// Request matcher
    #[serde(default)]
    pub matcher: RequestMatcher,

    /// Response to return
    #[serde(default)]
    pub response: ResponseTemplate,

    /// Latency and failure simulation
    #[serde(default)]
    pub fault: Option<FaultSpec>,
}

fn default_true() -> bool {
    true
}

impl Rule {
    /// Create an enabled rule that matches everything and answers 200.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            priority: 0,
            enabled: true,
            deleted: false,
            tags: Vec::new(),
            matcher: RequestMatcher::default(),
            response: ResponseTemplate::default(),
            fault: None,
        }
    }

    /// Whether the rule may take part in matching.
    pub fn is_active(&self) -> bool {
        self.enabled && !self.deleted
    }

    /// Validate the rule.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.id.is_empty() {
            anyhow::bail!("Rule id cannot be empty");
        }
        self.matcher.validate()?;
        self.response.validate()?;
        if let Some(fault) = &self.fault {
            fault.validate()?;
        }
        Ok(())
    }
}

/// Per-rule predicate bundle. All present constraints must hold.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct RequestMatcher {
    /// HTTP method (absent, empty, `ANY` or `*` = any method)
    #[serde(default)]
    pub method: Option<String>,

    /// Path specification
    #[serde(default)]
    pub path: Option<PathSpec>,

    /// Literal header equality constraints
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Literal query parameter equality constraints
    #[serde(default)]
    pub query: HashMap<String, String>,

    /// Advanced header constraints. When present they replace `headers`.
    #[serde(default)]
    pub header_patterns: HashMap<String, ValuePattern>,

    /// Advanced query constraints. When present they replace `query`.
    #[serde(default)]
    pub query_patterns: HashMap<String, ValuePattern>,

    /// Body constraints (all must hold)
    #[serde(default)]
    pub body: Vec<BodyConstraint>,
}

impl RequestMatcher {
    /// Validate the request matcher.
    pub fn validate(&self) -> anyhow::Result<()> {
        if let Some(path) = &self.path {
            path.validate()?;
        }
        for (name, pattern) in self.header_patterns.iter().chain(&self.query_patterns) {
            pattern
                .validate()
                .map_err(|e| anyhow::anyhow!("constraint on '{}': {}", name, e))?;
        }
        for constraint in &self.body {
            constraint.validate()?;
        }
        Ok(())
    }
}

/// Path specification: a literal path with `{name}` placeholders, or an
/// explicit pattern.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSpec {
    /// e.g. `/api/users/{id}`
    Template(String),
    /// Explicit pattern
    Pattern(PathPattern),
}

impl PathSpec {
    /// Validate the path specification.
    pub fn validate(&self) -> anyhow::Result<()> {
        CompiledPath::compile(self)
            .map(|_| ())
            .map_err(|e| anyhow::anyhow!("Invalid path pattern: {}", e))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PathPattern {
    #[serde(rename = "type")]
    pub kind: PathMatchType,
    pub pattern: String,
    #[serde(default)]
    pub case_insensitive: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PathMatchType {
    /// Full-string equality
    Exact,
    /// `*` = any sequence, `?` = any single character
    Wildcard,
    /// Full match of a regular expression
    Regex,
}

/// Advanced header/query constraint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ValuePattern {
    #[serde(rename = "type")]
    pub kind: ValueMatchType,
    #[serde(default)]
    pub pattern: String,
    #[serde(default)]
    pub case_insensitive: bool,
}

impl ValuePattern {
    fn validate(&self) -> anyhow::Result<()> {
        if self.kind == ValueMatchType::Regex {
            build_regex(&self.pattern, self.case_insensitive)
                .map_err(|e| anyhow::anyhow!("Invalid regex: {}", e))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValueMatchType {
    /// Key present, any value
    Exists,
    Exact,
    Contains,
    Regex,
}

/// Body constraint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BodyConstraint {
    #[serde(rename = "type")]
    pub kind: BodyMatchType,
    /// Literal, pattern, JSON path or XPath depending on `kind`
    pub expression: String,
    /// Expected extracted value for structured checks (absent = existence)
    #[serde(default, deserialize_with = "deserialize_optional_text")]
    pub expected_value: Option<String>,
    #[serde(default)]
    pub case_insensitive: bool,
}

impl BodyConstraint {
    fn validate(&self) -> anyhow::Result<()> {
        if self.kind == BodyMatchType::Regex {
            build_regex(&self.expression, self.case_insensitive)
                .map_err(|e| anyhow::anyhow!("Invalid body regex: {}", e))?;
        }
        if self.expression.is_empty()
            && matches!(
                self.kind,
                BodyMatchType::StructuredPath | BodyMatchType::StructuredQuery
            )
        {
            anyhow::bail!("Structured body constraint needs an expression");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BodyMatchType {
    Exact,
    Contains,
    Regex,
    /// JSON path against the parsed body
    #[serde(alias = "JSON_PATH")]
    StructuredPath,
    /// XPath against the parsed body
    #[serde(alias = "XPATH")]
    StructuredQuery,
}

/// Response definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResponseTemplate {
    /// HTTP status code
    #[serde(default = "default_status")]
    pub status: u16,

    /// Response headers
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Response body as text, or a structured JSON/YAML value
    #[serde(default)]
    pub body: ResponseBody,

    /// Whether body and header values go through the template renderer
    #[serde(default, alias = "template")]
    pub templating: bool,

    /// Variants keyed by a correlation header
    #[serde(default)]
    pub conditional: Option<ConditionalSet>,
}

fn default_status() -> u16 {
    200
}

impl Default for ResponseTemplate {
    fn default() -> Self {
        Self {
            status: default_status(),
            headers: HashMap::new(),
            body: ResponseBody::default(),
            templating: false,
            conditional: None,
        }
    }
}

impl ResponseTemplate {
    /// Validate the response definition.
    pub fn validate(&self) -> anyhow::Result<()> {
        validate_status(self.status)?;
        if let Some(conditional) = &self.conditional {
            if conditional.header.trim().is_empty() {
                anyhow::bail!("Conditional response needs a correlation header");
            }
            for variant in &conditional.overrides {
                if let Some(status) = variant.status {
                    validate_status(status)?;
                }
            }
        }
        Ok(())
    }
}

fn validate_status(status: u16) -> anyhow::Result<()> {
    if !(100..=599).contains(&status) {
        anyhow::bail!("Invalid status code: {}", status);
    }
    Ok(())
}

/// Response body as authored.
///
/// A structured body is kept as a value so templating can render each string
/// leaf on its own and the result stays valid JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResponseBody {
    Text(String),
    Json(serde_json::Value),
}

impl Default for ResponseBody {
    fn default() -> Self {
        ResponseBody::Text(String::new())
    }
}

impl ResponseBody {
    /// Body text; structured values are written as compact JSON.
    pub fn text(&self) -> String {
        match self {
            ResponseBody::Text(text) => text.clone(),
            ResponseBody::Json(value) => value_to_text(value.clone()),
        }
    }
}

impl From<&str> for ResponseBody {
    fn from(text: &str) -> Self {
        ResponseBody::Text(text.to_string())
    }
}

impl From<String> for ResponseBody {
    fn from(text: String) -> Self {
        ResponseBody::Text(text)
    }
}

/// Response variants selected by the value of a correlation header.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConditionalSet {
    /// Correlation header name (matched case-insensitively)
    pub header: String,
    /// Overrides, first exact value match wins
    #[serde(default)]
    pub overrides: Vec<ConditionalOverride>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConditionalOverride {
    /// Header value selecting this override
    pub value: String,
    #[serde(default)]
    pub status: Option<u16>,
    #[serde(default)]
    pub body: Option<ResponseBody>,
    #[serde(default)]
    pub headers: Option<HashMap<String, String>>,
}

/// Latency and failure simulation.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct FaultSpec {
    #[serde(default)]
    pub delay: DelayMode,

    /// Delay for `fixed` mode (ms)
    #[serde(default)]
    pub fixed_ms: u64,

    /// Lower bound for `variable` mode (ms, inclusive)
    #[serde(default)]
    pub min_ms: u64,

    /// Upper bound for `variable` mode (ms, exclusive)
    #[serde(default)]
    pub max_ms: u64,

    /// Percent chance (0-100) that a dispatch returns `error_response`
    #[serde(default)]
    pub error_probability: u8,

    #[serde(default)]
    pub error_response: Option<ErrorResponse>,
}

impl FaultSpec {
    /// Validate the fault settings.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.error_probability > 100 {
            anyhow::bail!(
                "error_probability must be within 0-100, got {}",
                self.error_probability
            );
        }
        if let Some(error) = &self.error_response {
            validate_status(error.status)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DelayMode {
    #[default]
    None,
    Fixed,
    Variable,
}

/// Response substituted when a fault fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ErrorResponse {
    #[serde(default = "default_error_status")]
    pub status: u16,
    #[serde(default, deserialize_with = "deserialize_text")]
    pub body: String,
}

fn default_error_status() -> u16 {
    500
}

/// Engine-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineSettings {
    /// Log every matched rule
    #[serde(default = "default_true")]
    pub log_matches: bool,

    /// Log requests no rule matched
    #[serde(default = "default_true")]
    pub log_unmatched: bool,

    /// Content type for responses that declare none
    #[serde(default = "default_content_type")]
    pub default_content_type: String,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            log_matches: true,
            log_unmatched: true,
            default_content_type: default_content_type(),
        }
    }
}

fn default_content_type() -> String {
    "application/json".to_string()
}

/// Accept a string or any structured value; structured values become JSON text.
fn deserialize_text<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(value_to_text(value))
}

fn deserialize_optional_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(value.map(value_to_text))
}

fn value_to_text(value: serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s,
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}
