//! Header and body rewrite rules.
//!
//! Rules match on a path prefix plus an optional method and apply in
//! declared order; the pipeline records the first matching rule index
//! per request. Body substring replacement requires buffered mode;
//! when a response streams, the engine degrades to header-only.

use infermesh_config::RewriteRule;

pub struct RewriteEngine {
    rules: Vec<RewriteRule>,
}

/// Replace every occurrence of `from` in `data`.
fn replace_all(data: &[u8], from: &[u8], to: &[u8]) -> Vec<u8> {
    if from.is_empty() {
        return data.to_vec();
    }
    let mut out = Vec::with_capacity(data.len());
    let mut i = 0;
    while i < data.len() {
        if data[i..].starts_with(from) {
            out.extend_from_slice(to);
            i += from.len();
        } else {
            out.push(data[i]);
            i += 1;
        }
    }
    out
}

fn set_header(headers: &mut Vec<(String, String)>, name: &str, value: &str) {
    if let Some(slot) = headers.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(name)) {
        slot.1 = value.to_string();
    } else {
        headers.push((name.to_string(), value.to_string()));
    }
}

fn remove_header(headers: &mut Vec<(String, String)>, name: &str) {
    headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
}

impl RewriteEngine {
    pub fn new(rules: Vec<RewriteRule>) -> Self {
        Self { rules }
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// First rule matching this request, if any.
    pub fn match_rule(&self, method: &str, path: &str) -> Option<usize> {
        self.rules.iter().position(|rule| {
            path.starts_with(&rule.path_prefix)
                && rule
                    .method
                    .as_deref()
                    .map(|m| m.eq_ignore_ascii_case(method))
                    .unwrap_or(true)
        })
    }

    pub fn apply_request_headers(&self, idx: usize, headers: &mut Vec<(String, String)>) {
        let Some(rule) = self.rules.get(idx) else { return };
        for name in &rule.remove_request_headers {
            remove_header(headers, name);
        }
        for pair in &rule.set_request_headers {
            set_header(headers, &pair.name, &pair.value);
        }
    }

    pub fn request_needs_body(&self, idx: usize) -> bool {
        self.rules
            .get(idx)
            .map(|r| !r.request_body_replace.is_empty())
            .unwrap_or(false)
    }

    pub fn apply_request_body(&self, idx: usize, body: Vec<u8>) -> Vec<u8> {
        let Some(rule) = self.rules.get(idx) else { return body };
        let mut body = body;
        for rep in &rule.request_body_replace {
            body = replace_all(&body, rep.from.as_bytes(), rep.to.as_bytes());
        }
        body
    }

    pub fn apply_response_headers(&self, idx: usize, headers: &mut Vec<(String, String)>) {
        let Some(rule) = self.rules.get(idx) else { return };
        for name in &rule.remove_response_headers {
            remove_header(headers, name);
        }
        for pair in &rule.set_response_headers {
            set_header(headers, &pair.name, &pair.value);
        }
    }

    /// Whether this rule needs the full response body buffered.
    pub fn response_needs_body(&self, idx: usize) -> bool {
        self.rules
            .get(idx)
            .map(|r| !r.response_body_replace.is_empty())
            .unwrap_or(false)
    }

    pub fn apply_response_body(&self, idx: usize, body: Vec<u8>) -> Vec<u8> {
        let Some(rule) = self.rules.get(idx) else { return body };
        let mut body = body;
        for rep in &rule.response_body_replace {
            body = replace_all(&body, rep.from.as_bytes(), rep.to.as_bytes());
        }
        body
    }
}
