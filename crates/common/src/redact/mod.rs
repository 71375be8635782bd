//! Scrubbing of captured headers and bodies
//!
//! Best effort only: malformed input is returned as-is, never an error.

use crate::config::{BodySettings, RedactSettings};
use serde_json::Value;
use std::collections::BTreeMap;

/// Stored header shape: lowercase name to every value sent
pub type HeaderMap = BTreeMap<String, Vec<String>>;

/// Stored in place of a body when body storage is switched off
pub const BODY_DISABLED: &str = "[Body storage disabled]";

/// Configured redaction and size-bounding rules
#[derive(Debug, Clone)]
pub struct Redactor {
    headers: Vec<String>,
    fields: Vec<String>,
    replacement: String,
    store_body: bool,
    max_size: Option<usize>,
}

impl Redactor {
    pub fn new(redact: &RedactSettings, body: &BodySettings) -> Self {
        Self {
            headers: redact.headers.iter().map(|h| h.to_ascii_lowercase()).collect(),
            fields: redact.fields.iter().map(|f| f.to_lowercase()).collect(),
            replacement: redact.replacement.clone(),
            store_body: body.store,
            max_size: body.max_size,
        }
    }

    pub fn replacement(&self) -> &str {
        &self.replacement
    }

    fn is_sensitive_header(&self, name: &str) -> bool {
        self.headers.iter().any(|h| h.eq_ignore_ascii_case(name))
    }

    fn is_sensitive_field(&self, key: &str) -> bool {
        let key = key.to_lowercase();
        self.fields.iter().any(|f| *f == key)
    }

    /// Replace the values of sensitive headers, keeping the list shape
    pub fn redact_headers(&self, headers: &HeaderMap) -> HeaderMap {
        headers
            .iter()
            .map(|(name, values)| {
                if self.is_sensitive_header(name) {
                    (name.clone(), vec![self.replacement.clone()])
                } else {
                    (name.clone(), values.clone())
                }
            })
            .collect()
    }

    /// Redact configured fields of a JSON body.
    ///
    /// Non-JSON content types and unparseable bodies come back unchanged.
    pub fn redact_body(&self, body: &str, content_type: Option<&str>) -> String {
        if !is_json_content_type(content_type) {
            return body.to_string();
        }

        let Ok(mut value) = serde_json::from_str::<Value>(body) else {
            return body.to_string();
        };

        self.scrub(&mut value);
        serde_json::to_string(&value).unwrap_or_else(|_| body.to_string())
    }

    fn scrub(&self, value: &mut Value) {
        match value {
            Value::Object(map) => {
                for (key, child) in map.iter_mut() {
                    if self.is_sensitive_field(key) {
                        *child = Value::String(self.replacement.clone());
                    } else {
                        self.scrub(child);
                    }
                }
            }
            Value::Array(items) => items.iter_mut().for_each(|item| self.scrub(item)),
            _ => {}
        }
    }

    /// Turn raw body bytes into their stored form.
    ///
    /// Empty bodies are `None`. The size bound is applied before field
    /// redaction, so a truncated JSON body no longer parses and is kept
    /// unredacted.
    pub fn prepare_body(&self, raw: &[u8], content_type: Option<&str>) -> Option<String> {
        self.prepare_prefix(raw, raw.len(), content_type)
    }

    /// `prepare_body` for a body of `original_size` bytes of which only the
    /// leading `kept` bytes were held on to
    pub fn prepare_prefix(
        &self,
        kept: &[u8],
        original_size: usize,
        content_type: Option<&str>,
    ) -> Option<String> {
        if original_size == 0 {
            return None;
        }
        if !self.store_body {
            return Some(BODY_DISABLED.to_string());
        }

        let bounded = match self.max_size {
            Some(max) => truncate_prefix(kept, original_size, max),
            None => String::from_utf8_lossy(kept).into_owned(),
        };

        Some(self.redact_body(&bounded, content_type))
    }

    /// Bytes worth keeping from a body; `None` keeps everything
    pub fn capture_limit(&self) -> Option<usize> {
        if self.store_body {
            self.max_size
        } else {
            Some(0)
        }
    }
}

pub fn is_json_content_type(content_type: Option<&str>) -> bool {
    content_type
        .map(|ct| ct.to_ascii_lowercase().contains("json"))
        .unwrap_or(false)
}

/// Keep the first `max_size` bytes and note the original size
pub fn truncate_body(raw: &[u8], max_size: usize) -> String {
    truncate_prefix(raw, raw.len(), max_size)
}

fn truncate_prefix(kept: &[u8], original_size: usize, max_size: usize) -> String {
    if original_size <= max_size {
        return String::from_utf8_lossy(kept).into_owned();
    }

    format!(
        "{}\n\n[TRUNCATED - Original size: {} bytes]",
        String::from_utf8_lossy(&kept[..kept.len().min(max_size)]),
        original_size
    )
}

/// One string per header, values joined with ", ", sensitive names redacted again
pub fn headers_for_display(
    headers: &HeaderMap,
    redact_headers: &[String],
    replacement: &str,
) -> BTreeMap<String, String> {
    headers
        .iter()
        .map(|(name, values)| {
            let shown = if redact_headers.iter().any(|h| h.eq_ignore_ascii_case(name)) {
                replacement.to_string()
            } else {
                values.join(", ")
            };
            (name.clone(), shown)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn redactor() -> Redactor {
        Redactor::new(&RedactSettings::default(), &BodySettings::default())
    }

    fn bounded(max_size: usize) -> Redactor {
        Redactor::new(
            &RedactSettings::default(),
            &BodySettings {
                store: true,
                max_size: Some(max_size),
            },
        )
    }

    #[test]
    fn test_json_field_redaction_keeps_order() {
        let body = r#"{"password":"secret","ok":true}"#;
        let out = redactor().redact_body(body, Some("application/json"));
        assert_eq!(out, r#"{"password":"[REDACTED]","ok":true}"#);
    }

    #[test]
    fn test_non_json_body_untouched() {
        let body = "password=secret&ok=1";
        let out = redactor().redact_body(body, Some("application/x-www-form-urlencoded"));
        assert_eq!(out, body);
    }

    #[test]
    fn test_malformed_json_untouched() {
        let body = r#"{"password": "secret""#;
        assert_eq!(redactor().redact_body(body, Some("application/json")), body);
    }

    #[test]
    fn test_nested_and_case_insensitive() {
        let body = r#"{"user":{"Password":"x","name":"a"},"items":[{"API_KEY":"k"},{"cvv":123}]}"#;
        let out = redactor().redact_body(body, Some("application/vnd.api+json"));
        assert_eq!(
            out,
            r#"{"user":{"Password":"[REDACTED]","name":"a"},"items":[{"API_KEY":"[REDACTED]"},{"cvv":"[REDACTED]"}]}"#
        );
    }

    #[test]
    fn test_sensitive_object_replaced_whole() {
        let body = r#"{"secret":{"a":1}}"#;
        let out = redactor().redact_body(body, Some("application/json"));
        assert_eq!(out, r#"{"secret":"[REDACTED]"}"#);
    }

    #[test]
    fn test_header_redaction_keeps_shape() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization".into(), vec!["Bearer abc".into()]);
        headers.insert("accept".into(), vec!["text/html".into(), "application/json".into()]);

        let out = redactor().redact_headers(&headers);
        assert_eq!(out["authorization"], vec!["[REDACTED]".to_string()]);
        assert_eq!(out["accept"].len(), 2);
    }

    #[test]
    fn test_headers_for_display_collapse() {
        let mut headers = HeaderMap::new();
        headers.insert("accept".into(), vec!["text/html".into(), "application/json".into()]);
        headers.insert("cookie".into(), vec!["a=1".into(), "b=2".into()]);

        let shown = headers_for_display(&headers, &["Cookie".to_string()], "[REDACTED]");
        assert_eq!(shown["accept"], "text/html, application/json");
        assert_eq!(shown["cookie"], "[REDACTED]");
    }

    #[test]
    fn test_truncation_marker() {
        let raw = vec![b'a'; 10_000];
        let out = bounded(100).prepare_body(&raw, Some("text/plain")).unwrap();
        assert!(out.starts_with(&"a".repeat(100)));
        assert!(!out.starts_with(&"a".repeat(101)));
        assert!(out.ends_with("\n\n[TRUNCATED - Original size: 10000 bytes]"));
    }

    #[test]
    fn test_truncated_json_falls_back_to_unredacted() {
        let raw = br#"{"password":"hunter2","notes":"a fairly long note that will be cut"}"#;
        let out = bounded(30).prepare_body(raw, Some("application/json")).unwrap();
        assert!(out.starts_with(r#"{"password":"hunter2","notes":"#));
        assert!(out.contains("hunter2"));
        assert!(out.contains("[TRUNCATED - Original size:"));
    }

    #[test]
    fn test_small_json_within_bound_is_redacted() {
        let raw = br#"{"token":"t"}"#;
        let out = bounded(100).prepare_body(raw, Some("application/json")).unwrap();
        assert_eq!(out, r#"{"token":"[REDACTED]"}"#);
    }

    #[test]
    fn test_empty_and_disabled_bodies() {
        assert_eq!(redactor().prepare_body(b"", Some("application/json")), None);

        let off = Redactor::new(
            &RedactSettings::default(),
            &BodySettings {
                store: false,
                max_size: None,
            },
        );
        assert_eq!(off.prepare_body(b"{}", None).as_deref(), Some(BODY_DISABLED));
        assert_eq!(off.capture_limit(), Some(0));
        assert_eq!(redactor().capture_limit(), None);
    }

    #[test]
    fn test_prefix_reports_original_size() {
        let out = bounded(4)
            .prepare_prefix(b"hello", 2048, Some("text/plain"))
            .unwrap();
        assert_eq!(out, "hell\n\n[TRUNCATED - Original size: 2048 bytes]");
        assert_eq!(bounded(4).capture_limit(), Some(4));
    }
}
