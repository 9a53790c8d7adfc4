//! Incoming request boundary type.

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;

/// An inbound request as seen by the engine.
///
/// Header names are stored lowercased so lookups are case-insensitive.
/// The path is expected to be URL-decoded already.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IncomingRequest {
    pub method: String,
    pub path: String,
    #[serde(default, deserialize_with = "deserialize_headers")]
    headers: HashMap<String, String>,
    #[serde(default)]
    pub query: HashMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
}

impl IncomingRequest {
    /// Create a request for `method` and `path` with no headers, query or body.
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            ..Self::default()
        }
    }

    /// Create a request from a raw request target such as `/users?page=2`.
    pub fn from_target(method: impl Into<String>, target: &str) -> Self {
        let (path, query) = match target.split_once('?') {
            Some((path, query)) => (path, parse_query_string(query)),
            None => (target, HashMap::new()),
        };
        Self {
            method: method.into(),
            path: urlencoding_decode(path, false),
            query,
            ..Self::default()
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_lowercase(), value.into());
        self
    }

    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(name.into(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_lowercase()).map(String::as_str)
    }

    /// All headers, keyed by lowercased name.
    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(String::as_str)
    }

    /// Raw body text, empty when absent.
    pub fn body_text(&self) -> &str {
        self.body.as_deref().unwrap_or("")
    }
}

fn deserialize_headers<'de, D>(deserializer: D) -> Result<HashMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = HashMap::<String, String>::deserialize(deserializer)?;
    Ok(raw
        .into_iter()
        .map(|(k, v)| (k.to_lowercase(), v))
        .collect())
}

/// Parse a query string into key-value pairs.
pub fn parse_query_string(query: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();

    for part in query.split('&') {
        if part.is_empty() {
            continue;
        }
        if let Some((key, value)) = part.split_once('=') {
            params.insert(urlencoding_decode(key, true), urlencoding_decode(value, true));
        } else {
            params.insert(urlencoding_decode(part, true), String::new());
        }
    }

    params
}

/// Percent-decoding. `+` becomes a space only inside query strings.
/// Invalid escapes are kept verbatim; decoded bytes are read as UTF-8.
fn urlencoding_decode(s: &str, plus_as_space: bool) -> String {
    let decoded = if plus_as_space {
        urlencoding::decode_binary(s.replace('+', " ").as_bytes()).into_owned()
    } else {
        urlencoding::decode_binary(s.as_bytes()).into_owned()
    };
    String::from_utf8_lossy(&decoded).into_owned()
}
