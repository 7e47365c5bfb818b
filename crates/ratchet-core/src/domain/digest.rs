//! Canonical JSON and digest computation.
//!
//! Canonical form used for every integrity digest in Ratchet (constitution
//! rules, benchmark suites, snapshots):
//! - object keys sorted by UTF-16 code units
//! - integer-valued floats written as integers; NaN/Infinity rejected
//! - compact output, no insignificant whitespace

use std::fmt::Write as _;

use crate::domain::error::{RatchetError, Result};
use sha2::{Digest, Sha256};

fn write_canonical(value: &serde_json::Value, out: &mut String) -> Result<()> {
    use serde_json::Value;
    match value {
        Value::Null | Value::Bool(_) | Value::String(_) => {
            out.push_str(&serde_json::to_string(value)?);
        }
        Value::Number(n) => {
            if n.is_i64() || n.is_u64() {
                let _ = write!(out, "{n}");
            } else if let Some(f) = n.as_f64() {
                if !f.is_finite() {
                    return Err(RatchetError::NonCanonical(
                        "NaN/Infinity not permitted".to_string(),
                    ));
                }
                if f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 {
                    let _ = write!(out, "{}", f as i64);
                } else {
                    let _ = write!(out, "{n}");
                }
            } else {
                let _ = write!(out, "{n}");
            }
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out)?;
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_by(|a, b| a.encode_utf16().cmp(b.encode_utf16()));
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key)?);
                out.push(':');
                if let Some(v) = map.get(key) {
                    write_canonical(v, out)?;
                }
            }
            out.push('}');
        }
    }
    Ok(())
}

/// Convert a JSON value to its canonical string form.
pub fn canonical_json(value: &serde_json::Value) -> Result<String> {
    let mut out = String::new();
    write_canonical(value, &mut out)?;
    Ok(out)
}

/// SHA-256 hex digest of the canonical form of `value`.
pub fn compute_digest(value: &serde_json::Value) -> Result<String> {
    let canonical = canonical_json(value)?;
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

/// Serialize `value` and digest its canonical form.
pub fn digest_of<T: serde::Serialize>(value: &T) -> Result<String> {
    compute_digest(&serde_json::to_value(value)?)
}

/// Compare an expected digest against the computed one.
pub fn verify_digest(expected: &str, actual: &str) -> Result<()> {
    if expected.eq_ignore_ascii_case(actual) {
        Ok(())
    } else {
        Err(RatchetError::DigestMismatch {
            expected: expected.to_string(),
            actual: actual.to_string(),
        })
    }
}
