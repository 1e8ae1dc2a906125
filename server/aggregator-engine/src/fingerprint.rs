//! Stable fingerprint over selected header values, used as a composite correlation key.

use serde_json::Value;

use crate::types::CorrelationKey;

/// Render a header value as key text: strings verbatim, everything else as compact JSON.
///
/// The JSON type is not part of the key: `"17"` and `17` (or `"true"` and `true`)
/// correlate into the same group, so a header that loses its type in transit
/// still lands with its siblings.
pub fn key_text(value: &Value) -> String {
  match value {
    Value::String(s) => s.clone(),
    other => other.to_string(),
  }
}

/// Compute a stable fingerprint from ordered `(name, value)` pairs.
///
/// Names are hashed alongside values so `{a: "x"}` and `{b: "x"}` never collide.
pub fn compute<'a, I>(parts: I) -> CorrelationKey
where
  I: IntoIterator<Item = (&'a str, &'a Value)>,
{
  let mut hasher = blake3::Hasher::new();
  for (i, (name, value)) in parts.into_iter().enumerate() {
    if i > 0 {
      hasher.update(b"|");
    }
    hasher.update(name.as_bytes());
    hasher.update(b"=");
    hasher.update(key_text(value).as_bytes());
  }

  let hash = hasher.finalize();
  // First 16 bytes (32 hex chars): compact but collision-resistant.
  let hex = hash.to_hex();
  CorrelationKey(hex[..32].to_string())
}
