//! Secret scrubbing for anything that leaves the store.
//!
//! Only export and display paths call into this module. Stored payloads are
//! never redacted.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

pub const PLACEHOLDER: &str = "[REDACTED]";

static SECRET_FIELD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?i)("(?:api[_-]?key|access[_-]?token|token|secret|client[_-]?secret|password|authorization)"\s*:\s*")[^"]*(")"#,
    )
    .expect("secret field pattern")
});

static BEARER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(bearer\s+)[A-Za-z0-9._~+/=-]{8,}").expect("bearer pattern")
});

// `\b` treats `_` and non-ASCII letters as word characters, so keys glued to
// identifiers like `OPENAI_KEY_sk-...` would slip through. Anchor on ASCII
// alphanumerics explicitly instead.
static PREFIXED_KEY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(^|[^A-Za-z0-9])(?:(?:sk|pk|rk)-[A-Za-z0-9_-]{16,}|AIza[0-9A-Za-z_-]{30,})")
        .expect("prefixed key pattern")
});

// Leftmost-greedy matching always consumes a whole alphanumeric run.
static LONG_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[A-Za-z0-9]{32,}").expect("long token pattern"));

/// Replace every recognised secret in `text` with [`PLACEHOLDER`].
/// `redact(&redact(x)) == redact(x)` for every input.
pub fn redact(text: &str) -> String {
    let out = SECRET_FIELD.replace_all(text, format!("${{1}}{}${{2}}", PLACEHOLDER).as_str());
    let out = BEARER.replace_all(&out, format!("${{1}}{}", PLACEHOLDER).as_str());
    let out = PREFIXED_KEY.replace_all(&out, format!("${{1}}{}", PLACEHOLDER).as_str());
    let out = LONG_TOKEN.replace_all(&out, PLACEHOLDER);
    out.into_owned()
}

/// Redact every string inside a JSON tree, and blank values held under
/// secret-looking object keys.
pub fn redact_value(value: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(redact(s)),
        Value::Array(items) => Value::Array(items.iter().map(redact_value).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| {
                    let v = if is_secret_key(k) && !v.is_null() {
                        Value::String(PLACEHOLDER.to_string())
                    } else {
                        redact_value(v)
                    };
                    (k.clone(), v)
                })
                .collect(),
        ),
        other => other.clone(),
    }
}

fn is_secret_key(key: &str) -> bool {
    let normalized: String = key
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect();
    matches!(
        normalized.as_str(),
        "apikey" | "accesstoken" | "token" | "secret" | "clientsecret" | "password" | "authorization"
    )
}
