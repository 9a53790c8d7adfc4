//! Response templating.
//!
//! The engine only depends on [`TemplateRenderer`]; [`TemplateEngine`] is the
//! Handlebars implementation used by default.

use crate::matcher::MatchContext;
use crate::request::IncomingRequest;
use handlebars::Handlebars;
use serde::Serialize;
use std::collections::HashMap;
use thiserror::Error;

/// Rendering failure reported by a [`TemplateRenderer`].
#[derive(Debug, Error)]
#[error("template rendering failed: {0}")]
pub struct RenderError(pub String);

impl From<handlebars::RenderError> for RenderError {
    fn from(err: handlebars::RenderError) -> Self {
        RenderError(err.to_string())
    }
}

/// Pluggable placeholder substitution over response bodies and header values.
pub trait TemplateRenderer: Send + Sync {
    fn render(&self, template: &str, ctx: &RequestContext) -> Result<String, RenderError>;

    /// Render every string leaf of a structured body. Keys and non-string
    /// values are left alone, so the output is still valid JSON.
    fn render_json(
        &self,
        value: &serde_json::Value,
        ctx: &RequestContext,
    ) -> Result<serde_json::Value, RenderError> {
        match value {
            serde_json::Value::String(s) => Ok(serde_json::Value::String(self.render(s, ctx)?)),
            serde_json::Value::Array(arr) => {
                let rendered: Result<Vec<_>, _> =
                    arr.iter().map(|v| self.render_json(v, ctx)).collect();
                Ok(serde_json::Value::Array(rendered?))
            }
            serde_json::Value::Object(obj) => {
                let mut rendered = serde_json::Map::new();
                for (k, v) in obj {
                    rendered.insert(k.clone(), self.render_json(v, ctx)?);
                }
                Ok(serde_json::Value::Object(rendered))
            }
            _ => Ok(value.clone()),
        }
    }
}

/// Request data exposed to templates.
#[derive(Debug, Clone, Serialize)]
pub struct RequestContext {
    /// Path parameters from placeholder matching
    pub path: HashMap<String, String>,
    /// Query parameters
    pub query: HashMap<String, String>,
    /// Request headers (lowercased names)
    pub headers: HashMap<String, String>,
    /// Regex capture groups
    pub captures: HashMap<String, String>,
    /// Request method
    pub method: String,
    /// Request path
    pub request_path: String,
    /// Request body
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    /// Request body as JSON (if parseable)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub json: Option<serde_json::Value>,
}

impl RequestContext {
    pub fn new(request: &IncomingRequest, match_ctx: &MatchContext) -> Self {
        let json = request
            .body
            .as_deref()
            .and_then(|s| serde_json::from_str(s).ok());

        Self {
            path: match_ctx.path_params.clone(),
            query: request.query.clone(),
            headers: request.headers().clone(),
            captures: match_ctx.captures.clone(),
            method: request.method.clone(),
            request_path: request.path.clone(),
            body: request.body.clone(),
            json,
        }
    }
}

/// Handlebars-backed renderer.
pub struct TemplateEngine {
    handlebars: Handlebars<'static>,
}

impl TemplateEngine {
    pub fn new() -> Self {
        let mut handlebars = Handlebars::new();

        handlebars.register_helper("json", Box::new(json_helper));
        handlebars.register_helper("uuid", Box::new(uuid_helper));
        handlebars.register_helper("now", Box::new(now_helper));
        handlebars.register_helper("random", Box::new(random_helper));
        handlebars.register_helper("default", Box::new(default_helper));
        handlebars.register_helper("upper", Box::new(upper_helper));
        handlebars.register_helper("lower", Box::new(lower_helper));

        // Responses are not HTML
        handlebars.register_escape_fn(handlebars::no_escape);

        Self { handlebars }
    }
}

impl Default for TemplateEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateRenderer for TemplateEngine {
    fn render(&self, template: &str, ctx: &RequestContext) -> Result<String, RenderError> {
        if !template.contains("{{") {
            return Ok(template.to_string());
        }
        Ok(self.handlebars.render_template(template, ctx)?)
    }
}

fn json_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    match h.param(0).map(|v| v.value()) {
        Some(serde_json::Value::String(s)) => match serde_json::from_str::<serde_json::Value>(s) {
            Ok(json) => out.write(&json.to_string())?,
            Err(_) => out.write(s)?,
        },
        Some(value) => out.write(&value.to_string())?,
        None => {}
    }
    Ok(())
}

fn uuid_helper(
    _: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let uuid = format!(
        "{:08x}-{:04x}-4{:03x}-{:04x}-{:012x}",
        rng.gen::<u32>(),
        rng.gen::<u16>(),
        rng.gen::<u16>() & 0x0fff,
        (rng.gen::<u16>() & 0x3fff) | 0x8000,
        rng.gen::<u64>() & 0xffffffffffff,
    );
    out.write(&uuid)?;
    Ok(())
}

fn now_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    use chrono::Utc;

    let format = h
        .param(0)
        .and_then(|v| v.value().as_str())
        .unwrap_or("%Y-%m-%dT%H:%M:%S%.3fZ");

    out.write(&Utc::now().format(format).to_string())?;
    Ok(())
}

fn random_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    use rand::Rng;

    let a = h.param(0).and_then(|v| v.value().as_i64()).unwrap_or(0);
    let b = h.param(1).and_then(|v| v.value().as_i64()).unwrap_or(100);
    let (min, max) = if a <= b { (a, b) } else { (b, a) };

    let value = rand::thread_rng().gen_range(min..=max);
    out.write(&value.to_string())?;
    Ok(())
}

fn default_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    let value = h.param(0).map(|v| v.value());
    let default = h.param(1).and_then(|v| v.value().as_str()).unwrap_or("");

    match value {
        Some(serde_json::Value::String(s)) if !s.is_empty() => out.write(s)?,
        Some(v) if !v.is_null() && !v.is_string() => out.write(&v.to_string())?,
        _ => out.write(default)?,
    }
    Ok(())
}

fn upper_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    let value = h.param(0).and_then(|v| v.value().as_str()).unwrap_or("");
    out.write(&value.to_uppercase())?;
    Ok(())
}

fn lower_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    let value = h.param(0).and_then(|v| v.value().as_str()).unwrap_or("");
    out.write(&value.to_lowercase())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render(template: &str, request: &IncomingRequest, match_ctx: &MatchContext) -> String {
        TemplateEngine::new()
            .render(template, &RequestContext::new(request, match_ctx))
            .unwrap()
    }

    #[test]
    fn test_path_params() {
        let mut ctx = MatchContext::default();
        ctx.path_params.insert("id".to_string(), "123".to_string());
        let request = IncomingRequest::new("GET", "/users/123");

        assert_eq!(render("User ID: {{path.id}}", &request, &ctx), "User ID: 123");
    }

    #[test]
    fn test_query_and_method() {
        let request = IncomingRequest::new("GET", "/list").with_query("page", "1");
        assert_eq!(
            render("{{method}} {{request_path}} page {{query.page}}", &request, &MatchContext::default()),
            "GET /list page 1"
        );
    }

    #[test]
    fn test_headers() {
        let request = IncomingRequest::new("GET", "/").with_header("User-Agent", "test-client");
        assert_eq!(
            render("Client: {{headers.user-agent}}", &request, &MatchContext::default()),
            "Client: test-client"
        );
    }

    #[test]
    fn test_request_body_json() {
        let request = IncomingRequest::new("POST", "/users").with_body(r#"{"name":"John"}"#);
        assert_eq!(
            render("Name: {{json.name}}", &request, &MatchContext::default()),
            "Name: John"
        );
    }

    #[test]
    fn test_no_html_escaping() {
        let request = IncomingRequest::new("GET", "/").with_query("q", "<a&b>");
        assert_eq!(
            render("{{query.q}}", &request, &MatchContext::default()),
            "<a&b>"
        );
    }

    #[test]
    fn test_uuid_helper() {
        let result = render("ID: {{uuid}}", &IncomingRequest::default(), &MatchContext::default());
        let uuid = &result[4..];
        assert_eq!(uuid.len(), 36);
        assert_eq!(uuid.chars().nth(8), Some('-'));
        assert_eq!(uuid.chars().nth(14), Some('4'));
    }

    #[test]
    fn test_default_helper() {
        let result = render(
            "Value: {{default query.missing \"fallback\"}}",
            &IncomingRequest::default(),
            &MatchContext::default(),
        );
        assert_eq!(result, "Value: fallback");
    }

    #[test]
    fn test_upper_lower_helpers() {
        let mut ctx = MatchContext::default();
        ctx.path_params.insert("name".to_string(), "John".to_string());
        let result = render(
            "Upper: {{upper path.name}}, Lower: {{lower path.name}}",
            &IncomingRequest::default(),
            &ctx,
        );
        assert_eq!(result, "Upper: JOHN, Lower: john");
    }

    #[test]
    fn test_random_helper_handles_reversed_bounds() {
        let result = render("{{random 10 5}}", &IncomingRequest::default(), &MatchContext::default());
        let value: i64 = result.parse().unwrap();
        assert!((5..=10).contains(&value));
    }

    #[test]
    fn test_plain_text_is_untouched() {
        let result = render("no placeholders here", &IncomingRequest::default(), &MatchContext::default());
        assert_eq!(result, "no placeholders here");
    }

    #[test]
    fn test_render_json_renders_string_leaves() {
        let mut ctx = MatchContext::default();
        ctx.path_params.insert("id".to_string(), "7".to_string());
        let request = IncomingRequest::new("GET", "/users/7").with_header("X-Name", r#"a"b"#);
        let body = serde_json::json!({
            "id": "{{path.id}}",
            "name": "{{headers.x-name}}",
            "tags": ["{{method}}", 3],
            "{{not.a.key}}": true
        });

        let rendered = TemplateEngine::new()
            .render_json(&body, &RequestContext::new(&request, &ctx))
            .unwrap();
        assert_eq!(rendered["id"], "7");
        assert_eq!(rendered["name"], r#"a"b"#);
        assert_eq!(rendered["tags"], serde_json::json!(["GET", 3]));
        assert_eq!(rendered["{{not.a.key}}"], true);
    }

    #[test]
    fn test_malformed_template_is_an_error() {
        let engine = TemplateEngine::new();
        let ctx = RequestContext::new(&IncomingRequest::default(), &MatchContext::default());
        assert!(engine.render("{{#if}}", &ctx).is_err());
    }
}
