//! Secret scrubbing for adapter errors and provider responses.
//!
//! Everything an adapter reports passes through here before it is logged
//! or persisted.

use once_cell::sync::Lazy;
use regex_lite::Regex;
use serde_json::{Map, Value};

const REDACTED: &str = "***";

static BEARER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)bearer\s+[A-Za-z0-9\-._~+/]+=*").unwrap());

static KEY_VALUE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?i)(access_token|refresh_token|client_secret|session_?id|api_key|token|password)(["']?\s*[:=]\s*["']?)[^"'&\s,}]+"#,
    )
    .unwrap()
});

static OPAQUE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[A-Za-z0-9_\-]{40,}").unwrap());

/// JSON keys whose values are always redacted.
const SECRET_KEYS: [&str; 9] = [
    "access_token",
    "refresh_token",
    "client_secret",
    "session_id",
    "sessionid",
    "sessionId",
    "api_key",
    "token",
    "password",
];

/// Redact bearer tokens, `key=value` secrets and long opaque strings.
pub fn sanitize(text: &str) -> String {
    let text = BEARER.replace_all(text, "Bearer ***");
    let text = KEY_VALUE.replace_all(&text, "${1}${2}***");
    OPAQUE.replace_all(&text, REDACTED).into_owned()
}

/// Recursively scrub a JSON document.
pub fn sanitize_value(value: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(sanitize(s)),
        Value::Array(items) => Value::Array(items.iter().map(sanitize_value).collect()),
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (key, v) in map {
                let scrubbed = if SECRET_KEYS.iter().any(|k| k.eq_ignore_ascii_case(key)) {
                    Value::String(REDACTED.to_string())
                } else {
                    sanitize_value(v)
                };
                out.insert(key.clone(), scrubbed);
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_bearer_token() {
        let out = sanitize("401 for Authorization: Bearer ya29.a0AfH6SMB-xyz");
        assert_eq!(out, "401 for Authorization: Bearer ***");
    }

    #[test]
    fn test_key_value_pairs() {
        let out = sanitize("url?access_token=abc123&v=5.199 refresh_token: \"r-456\"");
        assert!(out.contains("access_token=***"));
        assert!(out.contains("v=5.199"));
        assert!(!out.contains("r-456"));

        let out = sanitize(r#"{"sessionid": "s3ss"}"#);
        assert!(!out.contains("s3ss"));
    }

    #[test]
    fn test_long_opaque_strings() {
        let secret = "a".repeat(48);
        let out = sanitize(&format!("upload to https://host/{} failed", secret));
        assert!(!out.contains(&secret));
        assert!(out.contains("failed"));
    }

    #[test]
    fn test_plain_messages_untouched() {
        let msg = "YouTube upload failed: HTTP 503: backend error";
        assert_eq!(sanitize(msg), msg);
    }

    #[test]
    fn test_sanitize_value_redacts_secret_keys() {
        let raw = json!({
            "id": "v1",
            "client_secret": "shh",
            "nested": [{"token": "t", "note": "Bearer abc"}],
            "count": 3
        });
        let out = sanitize_value(&raw);
        assert_eq!(out["id"], "v1");
        assert_eq!(out["client_secret"], "***");
        assert_eq!(out["nested"][0]["token"], "***");
        assert_eq!(out["nested"][0]["note"], "Bearer ***");
        assert_eq!(out["count"], 3);
    }
}
