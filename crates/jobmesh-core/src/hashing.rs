//! Content addressing for jobs and tasks.
//!
//! Both identifiers are SHA-256 digests of a canonical JSON encoding:
//!
//! - object keys sorted by UTF-8 bytes, at every depth
//! - no whitespace
//! - strings escaped the way `serde_json` escapes them
//! - numbers in `serde_json`'s shortest round-trip form
//!
//! The encoding is versioned through [`ENCODING_VERSION`], which is part of
//! every task fingerprint. Changing the rules requires bumping it.

use std::{collections::BTreeMap, fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::{Error, Result};

/// Version of the canonical task encoding.
pub const ENCODING_VERSION: u64 = 1;

/// Length of a hex digest.
const DIGEST_HEX_LEN: usize = 64;

/// Job parameters. Keys are unique by construction.
pub type Parameters = serde_json::Map<String, Value>;

// ═══════════════════════════════════════════════════════════════════════════
// CANONICAL ENCODING
// ═══════════════════════════════════════════════════════════════════════════

/// Encode `value` canonically.
pub fn canonical_bytes(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Null => out.extend_from_slice(b"null"),
        Value::Bool(true) => out.extend_from_slice(b"true"),
        Value::Bool(false) => out.extend_from_slice(b"false"),
        Value::Number(n) => out.extend_from_slice(n.to_string().as_bytes()),
        Value::String(s) => write_string(s, out),
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_canonical(item, out);
            }
            out.push(b']');
        }
        Value::Object(map) => {
            // Sort explicitly: serde_json may be built with `preserve_order`.
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));
            out.push(b'{');
            for (i, (key, item)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_string(key, out);
                out.push(b':');
                write_canonical(item, out);
            }
            out.push(b'}');
        }
    }
}

fn write_string(s: &str, out: &mut Vec<u8>) {
    // Serializing a str cannot fail.
    let encoded = Value::String(s.to_owned()).to_string();
    out.extend_from_slice(encoded.as_bytes());
}

fn digest_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn validate_hex(kind: &'static str, s: &str) -> Result<()> {
    let well_formed = s.len() == DIGEST_HEX_LEN
        && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
    if well_formed {
        Ok(())
    } else {
        Err(Error::InvalidConfig(format!(
            "'{s}' is not a valid {kind} (expected {DIGEST_HEX_LEN} lowercase hex characters)"
        )))
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// JOB ID
// ═══════════════════════════════════════════════════════════════════════════

/// Content-addressed job identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Derive the id of a parameter mapping.
    #[must_use]
    pub fn from_parameters(parameters: &Parameters) -> Self {
        let value = Value::Object(parameters.clone());
        Self(digest_hex(&canonical_bytes(&value)))
    }

    /// Parse an id given by a user or read from a document.
    pub fn parse(s: &str) -> Result<Self> {
        validate_hex("job id", s)?;
        Ok(Self(s.to_owned()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for JobId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl AsRef<str> for JobId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// TASK FINGERPRINT
// ═══════════════════════════════════════════════════════════════════════════

/// Digest of a task reference plus its positional and keyword arguments.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Fingerprint a task invocation.
    ///
    /// Keyword arguments are a sorted map already; positional order is
    /// significant.
    #[must_use]
    pub fn of(task: &str, args: &[Value], kwargs: &BTreeMap<String, Value>) -> Self {
        let kwargs: serde_json::Map<String, Value> = kwargs
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let envelope = serde_json::json!({
            "v": ENCODING_VERSION,
            "task": task,
            "args": args,
            "kwargs": kwargs,
        });
        Self(digest_hex(&canonical_bytes(&envelope)))
    }

    pub fn parse(s: &str) -> Result<Self> {
        validate_hex("fingerprint", s)?;
        Ok(Self(s.to_owned()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Fingerprint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl AsRef<str> for Fingerprint {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn params(value: Value) -> Parameters {
        match value {
            Value::Object(map) => map,
            _ => Parameters::new(),
        }
    }

    #[test]
    fn test_canonical_bytes_sorts_nested_keys() {
        let value = json!({"b": {"z": 1, "a": [true, null]}, "a": "x"});
        assert_eq!(
            String::from_utf8_lossy(&canonical_bytes(&value)),
            r#"{"a":"x","b":{"a":[true,null],"z":1}}"#
        );
    }

    #[test]
    fn test_job_id_ignores_key_order() {
        let mut first = Parameters::new();
        first.insert("a".into(), json!(1));
        first.insert("b".into(), json!(2));
        let mut second = Parameters::new();
        second.insert("b".into(), json!(2));
        second.insert("a".into(), json!(1));
        assert_eq!(JobId::from_parameters(&first), JobId::from_parameters(&second));
    }

    #[test]
    fn test_job_id_distinguishes_values_and_types() {
        let one = JobId::from_parameters(&params(json!({"a": 1})));
        let two = JobId::from_parameters(&params(json!({"a": 2})));
        let text = JobId::from_parameters(&params(json!({"a": "1"})));
        assert_ne!(one, two);
        assert_ne!(one, text);
    }

    #[test]
    fn test_job_id_roundtrips_through_parse() -> Result<()> {
        let id = JobId::from_parameters(&params(json!({"a": 1, "b": 2})));
        assert_eq!(JobId::parse(id.as_str())?, id);
        assert_eq!(id.as_str().len(), 64);
        Ok(())
    }

    #[test]
    fn test_parse_rejects_malformed_ids() {
        assert!(JobId::parse("abc").is_err());
        assert!(JobId::parse(&"G".repeat(64)).is_err());
        assert!(Fingerprint::parse(&"A".repeat(64)).is_err());
    }

    #[test]
    fn test_fingerprint_depends_on_argument_order_not_kwarg_order() {
        let mut kw1 = BTreeMap::new();
        kw1.insert("x".to_string(), json!(1));
        kw1.insert("y".to_string(), json!(2));
        let mut kw2 = BTreeMap::new();
        kw2.insert("y".to_string(), json!(2));
        kw2.insert("x".to_string(), json!(1));

        let a = Fingerprint::of("mod.f", &[json!(1), json!(2)], &kw1);
        let b = Fingerprint::of("mod.f", &[json!(1), json!(2)], &kw2);
        let swapped = Fingerprint::of("mod.f", &[json!(2), json!(1)], &kw1);
        let other_task = Fingerprint::of("mod.g", &[json!(1), json!(2)], &kw1);

        assert_eq!(a, b);
        assert_ne!(a, swapped);
        assert_ne!(a, other_task);
    }
}
