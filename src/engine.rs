//! Dispatch engine.
//!
//! Evaluates each incoming request against the active rule set and produces a
//! [`ResolvedDispatch`]: match, priority resolution, fault/latency draw,
//! conditional selection, rendering.

use crate::conditional;
use crate::config::{EngineSettings, LoadError, ResponseBody, Rule, RuleSetConfig};
use crate::fault;
use crate::matcher::{MatchContext, RuleSet};
use crate::provider::RuleSetProvider;
use crate::request::IncomingRequest;
use crate::template::{RequestContext, TemplateEngine, TemplateRenderer};
use rand::Rng;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Whether any rule matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DispatchOutcome {
    NoMatch,
    Matched,
}

/// Result of one dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedDispatch {
    pub outcome: DispatchOutcome,
    /// Winning rule
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    /// Delay to hold the response for
    pub delay_ms: u64,
    /// Whether the response is an injected fault
    pub fault: bool,
    /// Correlation value of the applied conditional override
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

impl ResolvedDispatch {
    pub fn no_match() -> Self {
        Self {
            outcome: DispatchOutcome::NoMatch,
            rule_id: None,
            status: None,
            headers: None,
            body: None,
            delay_ms: 0,
            fault: false,
            variant: None,
        }
    }

    pub fn is_match(&self) -> bool {
        self.outcome == DispatchOutcome::Matched
    }
}

/// Request matching and response resolution engine.
///
/// The active rule set is an immutable snapshot behind an `Arc`; a reload
/// swaps the pointer, so every dispatch sees exactly one complete set.
pub struct Engine {
    rules: RwLock<Arc<RuleSet>>,
    renderer: Arc<dyn TemplateRenderer>,
    settings: EngineSettings,
    /// Total dispatches.
    requests_total: AtomicU64,
    /// Dispatches that matched a rule.
    requests_matched: AtomicU64,
    /// Dispatches that matched nothing.
    requests_unmatched: AtomicU64,
    /// Dispatches answered with an injected fault.
    faults_injected: AtomicU64,
}

impl Engine {
    /// Create an engine over `rules` with the Handlebars renderer.
    pub fn new(rules: Vec<Rule>, settings: EngineSettings) -> Self {
        let rules = RuleSet::new(rules);

        info!(rules = rules.len(), "Dispatch engine initialized");

        Self {
            rules: RwLock::new(Arc::new(rules)),
            renderer: Arc::new(TemplateEngine::new()),
            settings,
            requests_total: AtomicU64::new(0),
            requests_matched: AtomicU64::new(0),
            requests_unmatched: AtomicU64::new(0),
            faults_injected: AtomicU64::new(0),
        }
    }

    /// Create an engine from a loaded rule document.
    pub fn from_config(config: RuleSetConfig) -> Self {
        let rules = config.active_rules();
        Self::new(rules, config.settings)
    }

    /// Create from a YAML rule document.
    pub fn from_yaml(yaml: &str) -> Result<Self, LoadError> {
        Ok(Self::from_config(RuleSetConfig::from_yaml_str(yaml)?))
    }

    /// Replace the template renderer.
    pub fn with_renderer(mut self, renderer: Arc<dyn TemplateRenderer>) -> Self {
        self.renderer = renderer;
        self
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// The currently active rule set.
    pub async fn snapshot(&self) -> Arc<RuleSet> {
        self.rules.read().await.clone()
    }

    /// Replace the active rule set. Rules are compiled before the swap.
    pub async fn reload(&self, rules: Vec<Rule>) {
        let next = Arc::new(RuleSet::new(rules));
        let count = next.len();
        *self.rules.write().await = next;
        info!(rules = count, "Rule set reloaded");
    }

    /// Load rules from a provider and swap them in. On failure the current
    /// rule set stays active.
    pub async fn reload_from(&self, provider: &dyn RuleSetProvider) -> Result<usize, LoadError> {
        match provider.load().await {
            Ok(rules) => {
                let count = rules.len();
                self.reload(rules).await;
                Ok(count)
            }
            Err(e) => {
                warn!(error = %e, "Rule set reload failed, keeping current rules");
                Err(e)
            }
        }
    }

    /// Resolve a request without applying the delay.
    pub async fn dispatch(&self, request: &IncomingRequest) -> ResolvedDispatch {
        let rules = self.snapshot().await;
        self.dispatch_on(&rules, request, &mut rand::thread_rng())
    }

    /// Resolve a request and hold the result for its delay.
    pub async fn respond(&self, request: &IncomingRequest) -> ResolvedDispatch {
        let dispatch = self.dispatch(request).await;
        if dispatch.delay_ms > 0 {
            debug!(rule_id = ?dispatch.rule_id, delay_ms = dispatch.delay_ms, "Applying delay");
            tokio::time::sleep(Duration::from_millis(dispatch.delay_ms)).await;
        }
        dispatch
    }

    /// Like [`Engine::respond`], but gives up with `None` if `cancel`
    /// completes first.
    pub async fn respond_until<F>(&self, request: &IncomingRequest, cancel: F) -> Option<ResolvedDispatch>
    where
        F: Future<Output = ()>,
    {
        tokio::select! {
            dispatch = self.respond(request) => Some(dispatch),
            _ = cancel => {
                debug!(method = %request.method, path = %request.path, "Dispatch cancelled");
                None
            }
        }
    }

    /// Run the full pipeline against `rules` using `rng` for the fault and
    /// delay draws.
    pub fn dispatch_on<R: Rng>(
        &self,
        rules: &RuleSet,
        request: &IncomingRequest,
        rng: &mut R,
    ) -> ResolvedDispatch {
        self.requests_total.fetch_add(1, Ordering::Relaxed);

        let Some(result) = rules.resolve(request) else {
            self.requests_unmatched.fetch_add(1, Ordering::Relaxed);
            if self.settings.log_unmatched {
                warn!(
                    method = %request.method,
                    path = %request.path,
                    "No matching rule found"
                );
            }
            return ResolvedDispatch::no_match();
        };

        self.requests_matched.fetch_add(1, Ordering::Relaxed);
        let rule = result.rule;
        if self.settings.log_matches {
            info!(
                rule_id = %rule.id,
                method = %request.method,
                path = %request.path,
                "Request matched rule"
            );
        }

        let decision = fault::decide(rule.fault.as_ref(), rng);
        if let Some(error) = decision.error {
            self.faults_injected.fetch_add(1, Ordering::Relaxed);
            debug!(rule_id = %rule.id, status = error.status, "Injecting fault response");
            let headers = HashMap::from([(
                "Content-Type".to_string(),
                "application/json".to_string(),
            )]);
            return ResolvedDispatch {
                outcome: DispatchOutcome::Matched,
                rule_id: Some(rule.id.clone()),
                status: Some(error.status),
                headers: Some(headers),
                body: Some(error.body),
                delay_ms: decision.delay_ms,
                fault: true,
                variant: None,
            };
        }

        let selected = conditional::select(&rule.response, request);
        let (headers, body) = if rule.response.templating {
            self.render(rule, selected.headers, &selected.body, request, &result.context)
        } else {
            (selected.headers, selected.body.text())
        };

        ResolvedDispatch {
            outcome: DispatchOutcome::Matched,
            rule_id: Some(rule.id.clone()),
            status: Some(selected.status),
            headers: Some(self.with_content_type(headers)),
            body: Some(body),
            delay_ms: decision.delay_ms,
            fault: false,
            variant: selected.variant,
        }
    }

    /// Template the chosen body and header values.
    fn render(
        &self,
        rule: &Rule,
        headers: HashMap<String, String>,
        body: &ResponseBody,
        request: &IncomingRequest,
        match_ctx: &MatchContext,
    ) -> (HashMap<String, String>, String) {
        let ctx = RequestContext::new(request, match_ctx);
        let body = match body {
            ResponseBody::Text(text) => self.render_text(&rule.id, text.clone(), &ctx),
            ResponseBody::Json(value) => match self.renderer.render_json(value, &ctx) {
                Ok(rendered) => rendered.to_string(),
                Err(e) => {
                    warn!(rule_id = %rule.id, error = %e, "Template rendering failed, returning raw body");
                    body.text()
                }
            },
        };
        let headers = headers
            .into_iter()
            .map(|(name, value)| (name, self.render_text(&rule.id, value, &ctx)))
            .collect();
        (headers, body)
    }

    /// A failed render keeps the unrendered text.
    fn render_text(&self, rule_id: &str, text: String, ctx: &RequestContext) -> String {
        match self.renderer.render(&text, ctx) {
            Ok(rendered) => rendered,
            Err(e) => {
                warn!(rule_id, error = %e, "Template rendering failed, returning raw text");
                text
            }
        }
    }

    fn with_content_type(&self, mut headers: HashMap<String, String>) -> HashMap<String, String> {
        let has_content_type = headers
            .keys()
            .any(|name| name.eq_ignore_ascii_case("content-type"));
        if !has_content_type {
            headers.insert(
                "Content-Type".to_string(),
                self.settings.default_content_type.clone(),
            );
        }
        headers
    }

    /// Get total dispatches.
    pub fn total_requests(&self) -> u64 {
        self.requests_total.load(Ordering::Relaxed)
    }

    /// Get dispatches that matched a rule.
    pub fn total_matched(&self) -> u64 {
        self.requests_matched.load(Ordering::Relaxed)
    }

    /// Get dispatches that matched nothing.
    pub fn total_unmatched(&self) -> u64 {
        self.requests_unmatched.load(Ordering::Relaxed)
    }

    /// Get dispatches answered with an injected fault.
    pub fn total_faults(&self) -> u64 {
        self.faults_injected.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::StaticRuleSetProvider;
    use crate::template::RenderError;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::time::Instant;

    fn test_config() -> RuleSetConfig {
        let yaml = r#"
rules:
  - id: hello
    matcher:
      method: GET
      path: /hello
    response:
      status: 200
      headers:
        Content-Type: text/plain
      body: "Hello, World!"

  - id: user-by-id
    priority: 5
    matcher:
      method: GET
      path: /users/{id}
    response:
      status: 200
      templating: true
      headers:
        X-User: "{{path.id}}"
      body:
        id: "{{path.id}}"
        name: "User {{path.id}}"

  - id: payments
    matcher:
      method: POST
      path: /payments
    response:
      status: 201
      templating: true
      body: '{"request":"{{headers.x-request-id}}"}'
      conditional:
        header: X-Request-ID
        overrides:
          - value: err-1
            status: 402
            body: '{"error":"declined","request":"{{headers.x-request-id}}"}'

  - id: always-broken
    matcher:
      path: /broken
    response:
      status: 200
      templating: true
      body: '{"ok":true}'
      conditional:
        header: X-Request-ID
        overrides:
          - value: err-1
            status: 418
    fault:
      delay: fixed
      fixed_ms: 25
      error_probability: 100
      error_response:
        status: 503
        body: '{"error":"{{uuid}}"}'

  - id: slow
    matcher:
      path: /slow
    response:
      status: 200
      body: "Delayed response"
    fault:
      delay: variable
      min_ms: 30
      max_ms: 30

settings:
  log_unmatched: false
"#;
        RuleSetConfig::from_yaml_str(yaml).unwrap()
    }

    fn engine() -> Engine {
        Engine::from_config(test_config())
    }

    #[tokio::test]
    async fn test_static_match() {
        let engine = engine();
        let dispatch = engine.dispatch(&IncomingRequest::new("GET", "/hello")).await;

        assert_eq!(dispatch.outcome, DispatchOutcome::Matched);
        assert_eq!(dispatch.rule_id.as_deref(), Some("hello"));
        assert_eq!(dispatch.status, Some(200));
        assert_eq!(dispatch.body.as_deref(), Some("Hello, World!"));
        assert_eq!(dispatch.headers.unwrap()["Content-Type"], "text/plain");
        assert_eq!(dispatch.delay_ms, 0);
        assert!(!dispatch.fault);
    }

    #[tokio::test]
    async fn test_no_match() {
        let engine = engine();
        let dispatch = engine.dispatch(&IncomingRequest::new("GET", "/nonexistent")).await;
        assert_eq!(dispatch, ResolvedDispatch::no_match());
        assert_eq!(engine.total_unmatched(), 1);
        assert_eq!(engine.total_matched(), 0);
    }

    #[tokio::test]
    async fn test_templated_body_and_headers() {
        let engine = engine();
        let dispatch = engine.dispatch(&IncomingRequest::new("GET", "/users/123")).await;

        let body: serde_json::Value = serde_json::from_str(dispatch.body.as_deref().unwrap()).unwrap();
        assert_eq!(body["id"], "123");
        assert_eq!(body["name"], "User 123");
        let headers = dispatch.headers.unwrap();
        assert_eq!(headers["X-User"], "123");
        assert_eq!(headers["Content-Type"], "application/json");
    }

    #[tokio::test]
    async fn test_structured_body_stays_valid_json() {
        let engine = Engine::from_yaml(
            r#"
rules:
  - id: echo-name
    matcher:
      path: /echo
    response:
      templating: true
      body:
        name: "{{headers.x-name}}"
        tags: ["{{method}}"]
"#,
        )
        .unwrap();
        let request = IncomingRequest::new("POST", "/echo").with_header("X-Name", r#"a"b"#);
        let dispatch = engine.dispatch(&request).await;

        let body: serde_json::Value = serde_json::from_str(dispatch.body.as_deref().unwrap()).unwrap();
        assert_eq!(body["name"], r#"a"b"#);
        assert_eq!(body["tags"][0], "POST");
    }

    #[tokio::test]
    async fn test_conditional_override_is_templated() {
        let engine = engine();
        let request = IncomingRequest::new("POST", "/payments").with_header("X-Request-ID", "err-1");
        let dispatch = engine.dispatch(&request).await;
        assert_eq!(dispatch.status, Some(402));
        assert_eq!(
            dispatch.body.as_deref(),
            Some(r#"{"error":"declined","request":"err-1"}"#)
        );
        assert_eq!(dispatch.variant.as_deref(), Some("err-1"));

        let request = IncomingRequest::new("POST", "/payments").with_header("X-Request-ID", "ok-7");
        let dispatch = engine.dispatch(&request).await;
        assert_eq!(dispatch.status, Some(201));
        assert_eq!(dispatch.body.as_deref(), Some(r#"{"request":"ok-7"}"#));
        assert!(dispatch.variant.is_none());

        let dispatch = engine.dispatch(&IncomingRequest::new("POST", "/payments")).await;
        assert_eq!(dispatch.status, Some(201));
    }

    #[tokio::test]
    async fn test_fault_bypasses_conditional_and_templating() {
        let engine = engine();
        let request = IncomingRequest::new("GET", "/broken").with_header("X-Request-ID", "err-1");
        for _ in 0..50 {
            let dispatch = engine.dispatch(&request).await;
            assert!(dispatch.fault);
            assert_eq!(dispatch.status, Some(503));
            assert_eq!(dispatch.body.as_deref(), Some(r#"{"error":"{{uuid}}"}"#));
            assert_eq!(
                dispatch.headers.as_ref().unwrap()["Content-Type"],
                "application/json"
            );
            assert_eq!(dispatch.delay_ms, 25);
            assert!(dispatch.variant.is_none());
        }
        assert_eq!(engine.total_faults(), 50);
    }

    #[tokio::test]
    async fn test_fault_rate_is_drawn_per_dispatch() {
        let mut rule = Rule::new("flaky");
        rule.fault = Some(crate::config::FaultSpec {
            error_probability: 15,
            ..Default::default()
        });
        let engine = Engine::new(vec![rule], EngineSettings::default());
        let rules = engine.snapshot().await;
        let mut rng = StdRng::seed_from_u64(42);
        let request = IncomingRequest::new("GET", "/");

        let n = 10_000;
        let faults = (0..n)
            .filter(|_| engine.dispatch_on(&rules, &request, &mut rng).fault)
            .count();
        let rate = faults as f64 / n as f64;
        assert!((rate - 0.15).abs() < 0.015, "observed rate {}", rate);
    }

    #[tokio::test]
    async fn test_respond_applies_delay() {
        let engine = engine();
        let started = Instant::now();
        let dispatch = engine.respond(&IncomingRequest::new("GET", "/slow")).await;
        assert_eq!(dispatch.delay_ms, 30);
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn test_respond_until_cancels() {
        let mut rule = Rule::new("stuck");
        rule.fault = Some(crate::config::FaultSpec {
            delay: crate::config::DelayMode::Fixed,
            fixed_ms: 60_000,
            ..Default::default()
        });
        let engine = Engine::new(vec![rule], EngineSettings::default());

        let started = Instant::now();
        let result = engine
            .respond_until(
                &IncomingRequest::new("GET", "/"),
                tokio::time::sleep(Duration::from_millis(10)),
            )
            .await;
        assert!(result.is_none());
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_reload_swaps_rule_set() {
        let engine = engine();
        let request = IncomingRequest::new("GET", "/hello");
        assert!(engine.dispatch(&request).await.is_match());

        engine.reload(Vec::new()).await;
        assert!(!engine.dispatch(&request).await.is_match());

        let mut replacement = Rule::new("replacement");
        replacement.response.body = "new".into();
        let provider = StaticRuleSetProvider::new(vec![replacement]);
        assert_eq!(engine.reload_from(&provider).await.unwrap(), 1);
        let dispatch = engine.dispatch(&request).await;
        assert_eq!(dispatch.rule_id.as_deref(), Some("replacement"));
    }

    #[tokio::test]
    async fn test_reload_with_same_rules_is_idempotent() {
        let engine = engine();
        let requests = [
            IncomingRequest::new("GET", "/hello"),
            IncomingRequest::new("GET", "/users/9"),
            IncomingRequest::new("POST", "/payments").with_header("X-Request-ID", "err-1"),
            IncomingRequest::new("DELETE", "/missing"),
        ];
        let mut before = Vec::new();
        for request in &requests {
            before.push(engine.dispatch(request).await);
        }

        engine.reload(test_config().active_rules()).await;
        for (request, expected) in requests.iter().zip(before) {
            assert_eq!(engine.dispatch(request).await, expected);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_dispatch_during_reload() {
        let engine = Arc::new(engine());
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let engine = engine.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..200 {
                    let dispatch = engine.dispatch(&IncomingRequest::new("GET", "/hello")).await;
                    // Either the full set or the single catch-all
                    match dispatch.rule_id.as_deref() {
                        Some("hello") | Some("catch-all") => {}
                        other => panic!("unexpected rule {:?}", other),
                    }
                }
            }));
        }
        for i in 0..50 {
            if i % 2 == 0 {
                engine.reload(vec![Rule::new("catch-all")]).await;
            } else {
                engine.reload(test_config().active_rules()).await;
            }
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(engine.total_requests(), 1_600);
    }

    #[tokio::test]
    async fn test_bundled_rule_document() {
        let engine = Engine::from_yaml(include_str!("../demos/default-rules.yaml")).unwrap();

        let request = IncomingRequest::from_target("POST", "/api/users?dry_run=1")
            .with_header("content-type", "application/json")
            .with_body(r#"{"role":"admin"}"#);
        let dispatch = engine.dispatch(&request).await;
        assert_eq!(dispatch.rule_id.as_deref(), Some("create-user"));
        assert_eq!(dispatch.status, Some(202));

        let dispatch = engine
            .dispatch(&IncomingRequest::new("GET", "/api/orders/77/items"))
            .await;
        assert_eq!(dispatch.body.as_deref(), Some(r#"{"items":[],"order":"77"}"#));

        let request = IncomingRequest::new("POST", "/api/payments/v2").with_header("X-Scenario", "rate-limited");
        let dispatch = engine.dispatch(&request).await;
        assert_eq!(dispatch.status, Some(429));
        assert_eq!(dispatch.headers.unwrap()["Retry-After"], "30");

        let dispatch = engine.dispatch(&IncomingRequest::new("GET", "/api/v0/legacy")).await;
        assert!(!dispatch.is_match());
    }

    struct FailingRenderer;

    impl TemplateRenderer for FailingRenderer {
        fn render(&self, _: &str, _: &RequestContext) -> Result<String, RenderError> {
            Err(RenderError("boom".to_string()))
        }
    }

    #[tokio::test]
    async fn test_render_failure_keeps_raw_text() {
        let engine = engine().with_renderer(Arc::new(FailingRenderer));
        let dispatch = engine.dispatch(&IncomingRequest::new("GET", "/users/5")).await;
        assert_eq!(dispatch.status, Some(200));
        assert!(dispatch.body.unwrap().contains("{{path.id}}"));
    }

    #[test]
    fn test_dispatch_serializes_outcome() {
        let json = serde_json::to_value(ResolvedDispatch::no_match()).unwrap();
        assert_eq!(json["outcome"], "NO_MATCH");
        assert_eq!(json["delay_ms"], 0);
        assert!(json.get("status").is_none());
    }
}
