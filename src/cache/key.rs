//! Deterministic cache key generation.
//!
//! Keys have the form `METHOD:url:params:body`. Params and body are written in a
//! canonical JSON form (object keys sorted) so structurally equal requests always
//! produce the same key. Key generation never fails: a part that cannot be
//! serialized degrades to a coarse `params-present` / `data-present` marker.

use crate::request::{Body, QueryValue};
use http::Method;
use serde_json::Value;
use std::fmt::Write;

/// Written in place of a structure that is already being serialized higher up.
pub const CIRCULAR_MARKER: &str = "\"[Circular]\"";

/// Nesting beyond this depth is treated as a serialization failure.
const MAX_DEPTH: usize = 128;

#[derive(Debug)]
struct Unserializable;

/// Computes the default key for a request.
///
/// # Examples
///
/// ```
/// use http::Method;
/// use waypost::cache::compute_key;
///
/// let key = compute_key(&Method::GET, "https://pokeapi.co/api/v2/pokemon/25", &[], None);
/// assert_eq!(key, "GET:https://pokeapi.co/api/v2/pokemon/25::");
/// ```
pub fn compute_key(
    method: &Method,
    url: &str,
    params: &[(String, QueryValue)],
    body: Option<&Body>,
) -> String {
    format!(
        "{}:{}:{}:{}",
        method.as_str().to_ascii_uppercase(),
        url,
        serialize_params(params),
        serialize_body(body)
    )
}

fn serialize_params(params: &[(String, QueryValue)]) -> String {
    if params.is_empty() {
        return String::new();
    }
    serde_json::to_value(params)
        .map_err(|_| Unserializable)
        .and_then(|value| canonical(&value))
        .unwrap_or_else(|_| "params-present".to_string())
}

fn serialize_body(body: Option<&Body>) -> String {
    let result = match body {
        None => return String::new(),
        Some(Body::Json(value)) => canonical(value),
        Some(Body::Text(text)) => quote(text),
        Some(Body::Bytes(bytes)) => match std::str::from_utf8(bytes) {
            Ok(text) => quote(text),
            Err(_) => Ok(hex_tagged(bytes)),
        },
    };
    result.unwrap_or_else(|_| "data-present".to_string())
}

/// Writes `value` canonically, guarding against revisiting a structure that is
/// still open on the traversal path.
fn canonical(value: &Value) -> Result<String, Unserializable> {
    let mut writer = CanonicalWriter {
        out: String::new(),
        open: Vec::new(),
    };
    writer.write(value)?;
    Ok(writer.out)
}

struct CanonicalWriter {
    out: String,
    // identities of the arrays/objects currently being written
    open: Vec<*const Value>,
}

impl CanonicalWriter {
    fn write(&mut self, value: &Value) -> Result<(), Unserializable> {
        match value {
            Value::Array(_) | Value::Object(_) => {
                let identity = value as *const Value;
                if self.open.contains(&identity) {
                    self.out.push_str(CIRCULAR_MARKER);
                    return Ok(());
                }
                if self.open.len() >= MAX_DEPTH {
                    return Err(Unserializable);
                }
                self.open.push(identity);
                let result = self.write_container(value);
                self.open.pop();
                result
            }
            Value::String(s) => {
                let quoted = quote(s)?;
                self.out.push_str(&quoted);
                Ok(())
            }
            scalar => write!(self.out, "{}", scalar).map_err(|_| Unserializable),
        }
    }

    fn write_container(&mut self, value: &Value) -> Result<(), Unserializable> {
        match value {
            Value::Array(items) => {
                self.out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        self.out.push(',');
                    }
                    self.write(item)?;
                }
                self.out.push(']');
            }
            Value::Object(map) => {
                let mut entries: Vec<_> = map.iter().collect();
                entries.sort_by(|a, b| a.0.cmp(b.0));
                self.out.push('{');
                for (i, (key, item)) in entries.into_iter().enumerate() {
                    if i > 0 {
                        self.out.push(',');
                    }
                    let quoted = quote(key)?;
                    self.out.push_str(&quoted);
                    self.out.push(':');
                    self.write(item)?;
                }
                self.out.push('}');
            }
            _ => return self.write(value),
        }
        Ok(())
    }
}

/// Lossless form for bodies that are not UTF-8, e.g. `hex:fffe`.
fn hex_tagged(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(4 + bytes.len() * 2);
    out.push_str("hex:");
    for byte in bytes {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

fn quote(s: &str) -> Result<String, Unserializable> {
    serde_json::to_string(s).map_err(|_| Unserializable)
}
