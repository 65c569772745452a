use std::fmt::{self, Write};
use std::sync::Arc;

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::types::{Method, RequestConfig};

/// The identity of a request, used both for deduplication and caching.
///
/// A key is either the explicit `cache_key` of a [`RequestConfig`], or derived from its
/// effective method, endpoint and normalized payload. Derived keys are a hex-formatted sha-256
/// hash of human-readable metadata, which is kept around for debugging.
#[derive(Debug, Clone, Eq)]
pub struct RequestKey {
    key: Arc<str>,
    metadata: Arc<str>,
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}

impl PartialEq for RequestKey {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl std::hash::Hash for RequestKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

impl RequestKey {
    /// Creates the [`RequestKey`] for the given request.
    pub fn for_request(config: &RequestConfig) -> Self {
        match &config.cache_key {
            Some(key) => Self::explicit(key),
            None => Self::derive(
                config.effective_method(),
                &config.endpoint,
                config.data.as_ref(),
            ),
        }
    }

    /// Wraps a caller-supplied key verbatim.
    pub fn explicit(key: &str) -> Self {
        Self {
            key: key.into(),
            metadata: format!("explicit: {key}\n").into(),
        }
    }

    /// Derives a key from the request's identity.
    ///
    /// Payloads that are semantically equal, such as objects whose keys were inserted in a
    /// different order, derive the same key.
    pub fn derive(method: Method, endpoint: &str, data: Option<&Value>) -> Self {
        let mut metadata = format!("method: {method}\nendpoint: {endpoint}\n");
        if let Some(data) = data {
            metadata.push_str("data: ");
            write_canonical(&mut metadata, data);
            metadata.push('\n');
        }

        let hash = Sha256::digest(metadata.as_bytes());
        let mut key = String::with_capacity(hash.len() * 2);
        for b in hash {
            key.write_fmt(format_args!("{b:02x}")).unwrap();
        }

        Self {
            key: key.into(),
            metadata: metadata.into(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.key
    }

    /// Returns the human-readable metadata that forms the basis of the key.
    pub fn metadata(&self) -> &str {
        &self.metadata
    }
}

/// Writes `value` as JSON with object keys in sorted order.
///
/// This does not depend on whether `serde_json` preserves insertion order.
fn write_canonical(out: &mut String, value: &Value) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_unstable_by(|a, b| a.0.cmp(b.0));

            out.push('{');
            for (i, (key, value)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(out, value);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(out, item);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_equal_payloads_share_key() {
        let a: Value = serde_json::from_str(r#"{"b": [1, {"y": 2, "x": 1}], "a": "s"}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"a": "s", "b": [1, {"x": 1, "y": 2}]}"#).unwrap();

        let key_a = RequestKey::derive(Method::Post, "/search", Some(&a));
        let key_b = RequestKey::derive(Method::Post, "/search", Some(&b));
        assert_eq!(key_a, key_b);
        assert_eq!(key_a.as_str().len(), 64);
    }

    #[test]
    fn test_identity_components() {
        let data = json!({"q": "rust"});
        let base = RequestKey::derive(Method::Post, "/search", Some(&data));

        assert_ne!(base, RequestKey::derive(Method::Put, "/search", Some(&data)));
        assert_ne!(base, RequestKey::derive(Method::Post, "/find", Some(&data)));
        assert_ne!(base, RequestKey::derive(Method::Post, "/search", None));
        assert_ne!(
            base,
            RequestKey::derive(Method::Post, "/search", Some(&json!({"q": "go"})))
        );
    }

    #[test]
    fn test_metadata() {
        let key = RequestKey::derive(Method::Get, "/users", Some(&json!({"b": 1, "a": null})));
        assert_eq!(
            key.metadata(),
            "method: GET\nendpoint: /users\ndata: {\"a\":null,\"b\":1}\n"
        );
    }

    #[test]
    fn test_explicit_key_overrides() {
        let a = RequestConfig::new("/a").with_cache_key("profile");
        let b = RequestConfig::new("/b")
            .with_data(json!(1))
            .with_cache_key("profile");
        assert_eq!(RequestKey::for_request(&a), RequestKey::for_request(&b));
        assert_eq!(RequestKey::for_request(&a).as_str(), "profile");
    }

    #[test]
    fn test_for_request_uses_effective_method() {
        let implicit = RequestConfig::new("/a").with_data(json!(1));
        let explicit = RequestConfig::new("/a")
            .with_data(json!(1))
            .with_method(Method::Post);
        assert_eq!(
            RequestKey::for_request(&implicit),
            RequestKey::for_request(&explicit)
        );
    }
}
