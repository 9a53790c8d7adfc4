//! Conditional response selection keyed by a correlation header.

use crate::config::{ConditionalOverride, ResponseBody, ResponseTemplate};
use crate::request::IncomingRequest;
use std::collections::HashMap;

/// Status, headers and body chosen for a normal (non-fault) dispatch, before
/// templating.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectedResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: ResponseBody,
    /// Correlation value of the applied override, if any
    pub variant: Option<String>,
}

impl SelectedResponse {
    fn base(template: &ResponseTemplate) -> Self {
        Self {
            status: template.status,
            headers: template.headers.clone(),
            body: template.body.clone(),
            variant: None,
        }
    }
}

/// Find the override selected by the request's correlation header.
pub fn find_override<'a>(
    template: &'a ResponseTemplate,
    request: &IncomingRequest,
) -> Option<&'a ConditionalOverride> {
    let conditional = template.conditional.as_ref()?;
    let value = request.header(&conditional.header)?;
    conditional.overrides.iter().find(|o| o.value == value)
}

/// Pick the response for a normal dispatch: the base response, with the
/// matching override's status, body and headers applied on top.
pub fn select(template: &ResponseTemplate, request: &IncomingRequest) -> SelectedResponse {
    let mut selected = SelectedResponse::base(template);
    let Some(variant) = find_override(template, request) else {
        return selected;
    };

    if let Some(status) = variant.status {
        selected.status = status;
    }
    if let Some(body) = &variant.body {
        selected.body = body.clone();
    }
    if let Some(headers) = &variant.headers {
        // Override wins per header name, regardless of case
        for (name, value) in headers {
            selected.headers.retain(|k, _| !k.eq_ignore_ascii_case(name));
            selected.headers.insert(name.clone(), value.clone());
        }
    }
    selected.variant = Some(variant.value.clone());
    selected
}
